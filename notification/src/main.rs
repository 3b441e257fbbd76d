use std::sync::Arc;

use actix_web::HttpServer;
use notification::{
    bus::rabbit::RabbitSource,
    config::NotificationConfig,
    create_app,
    repositories::{notifications::MongoEventLedger, EventLedger},
    service::{dispatcher::Dispatcher, live::NotificationsManager, writer::NotificationListener},
};
use tokio_util::sync::CancellationToken;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    env_logger::init();

    let config = NotificationConfig::from_env()?;

    let ledger: Arc<dyn EventLedger> =
        Arc::new(MongoEventLedger::connect(&config.mongo_uri, &config.database).await?);
    log::info!("MongoDB connected to database {}", config.database);

    let source = Arc::new(RabbitSource::connect(&config.bus).await?);
    let dead_letters = Arc::new(source.dead_letters());

    let manager = Arc::new(NotificationsManager::new());
    let listener: Arc<dyn NotificationListener> = manager.clone();

    let dispatcher = Arc::new(Dispatcher::new(
        source.clone(),
        dead_letters,
        ledger.clone(),
        Some(listener),
        &config.dispatcher,
    ));
    let cancel = CancellationToken::new();
    let workers = dispatcher.spawn(cancel.clone());

    log::info!("Backend server is running at port {}", config.port);
    HttpServer::new(move || create_app(ledger.clone(), manager.clone()))
        .bind((config.host.as_str(), config.port))?
        .run()
        .await?;

    log::info!("Shutting down dispatcher");
    cancel.cancel();
    workers.join().await;
    source.close().await;

    Ok(())
}
