use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{
    body::MessageBody,
    dev::{ServiceFactory, ServiceRequest, ServiceResponse},
    middleware, web, App,
};
use common::services::API_PREFIX;
use handlers::{
    indexer::ping,
    notifications::{live_notifications, notification, recipient_notifications},
};
use repositories::EventLedger;
use service::live::NotificationsManager;

pub mod bus;
pub mod config;
pub mod error;
pub mod handlers;
pub mod repositories;
pub mod service;

pub fn create_app(
    ledger: Arc<dyn EventLedger>,
    manager: Arc<NotificationsManager>,
) -> App<
    impl ServiceFactory<
        ServiceRequest,
        Response = ServiceResponse<impl MessageBody>,
        Config = (),
        InitError = (),
        Error = actix_web::Error,
    >,
> {
    let cors = Cors::permissive();
    let security_headers = middleware::DefaultHeaders::new()
        .add(("X-Content-Type-Options", "nosniff"))
        .add(("X-Frame-Options", "DENY"))
        .add(("Referrer-Policy", "no-referrer"));

    #[allow(clippy::let_and_return)]
    let app = App::new()
        .wrap(cors)
        .wrap(security_headers)
        .wrap(middleware::Logger::default())
        .app_data(web::Data::from(ledger))
        .app_data(web::Data::from(manager))
        .service(
            web::scope(&API_PREFIX)
                .service(ping)
                .service(live_notifications)
                .service(recipient_notifications)
                .service(notification),
        );
    app
}
