use actix_web::{get, web, HttpRequest, HttpResponse};
use anyhow::anyhow;
use common::{
    entities::notification::PublicNotification,
    error::{self, AddCode},
};
use mongodb::bson::oid::ObjectId;

use crate::{repositories::EventLedger, service::live::{self, NotificationsManager}};

#[get("/notifications/recipient/{recipient_id}")]
pub async fn recipient_notifications(
    recipient_id: web::Path<String>,
    ledger: web::Data<dyn EventLedger>,
) -> error::Result<web::Json<Vec<PublicNotification>>> {
    let notifications = ledger.find_by_recipient(&recipient_id).await?;
    Ok(web::Json(
        notifications.into_iter().map(PublicNotification::from).collect(),
    ))
}

#[get("/notifications/recipient/{recipient_id}/live")]
pub async fn live_notifications(
    req: HttpRequest,
    stream: web::Payload,
    recipient_id: web::Path<String>,
    ledger: web::Data<dyn EventLedger>,
    manager: web::Data<NotificationsManager>,
) -> error::Result<HttpResponse> {
    live::subscribe(
        req,
        stream,
        manager.into_inner(),
        recipient_id.into_inner(),
        ledger.get_ref(),
    )
    .await
}

#[get("/notifications/{id}")]
pub async fn notification(
    id: web::Path<String>,
    ledger: web::Data<dyn EventLedger>,
) -> error::Result<web::Json<PublicNotification>> {
    let id = ObjectId::parse_str(id.as_str()).map_err(|e| e.code(400))?;
    let Some(notification) = ledger.find_by_id(&id).await? else {
        return Err(anyhow!("Notification not found").code(404));
    };
    Ok(web::Json(notification.into()))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use actix_web::{
        http::StatusCode,
        test::{self, init_service},
    };
    use common::entities::{
        notification::NotificationRecord, processed_event::ProcessedEventRecord,
    };

    use crate::{create_app, repositories::memory::InMemoryEventLedger};

    use super::*;

    async fn seeded_ledger() -> (Arc<InMemoryEventLedger>, NotificationRecord) {
        let ledger = Arc::new(InMemoryEventLedger::new());
        let record = NotificationRecord {
            id: ObjectId::new(),
            recipient_id: "u1".to_string(),
            source_event_id: "evt-1".to_string(),
            kind: "ProductCreated".to_string(),
            body: "A new product \"Desk lamp\" was created under your account.".to_string(),
            created_at: 1,
        };
        ledger
            .commit(&record, &ProcessedEventRecord::now("evt-1"))
            .await
            .unwrap();
        (ledger, record)
    }

    #[actix_web::test]
    async fn test_ping() {
        let (ledger, _) = seeded_ledger().await;
        let app = init_service(create_app(ledger, Arc::new(NotificationsManager::new()))).await;
        let req = test::TestRequest::get()
            .uri("/api/notifications/ping")
            .to_request();
        let res = test::call_service(&app, req).await;
        assert!(res.status().is_success());
        assert_eq!(res.headers().get("x-content-type-options").unwrap(), "nosniff");
    }

    #[actix_web::test]
    async fn test_recipient_notifications() {
        let (ledger, record) = seeded_ledger().await;
        let app = init_service(create_app(ledger, Arc::new(NotificationsManager::new()))).await;

        let req = test::TestRequest::get()
            .uri("/api/notifications/recipient/u1")
            .to_request();
        let body: Vec<PublicNotification> = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body, vec![PublicNotification::from(record)]);

        let req = test::TestRequest::get()
            .uri("/api/notifications/recipient/nobody")
            .to_request();
        let body: Vec<PublicNotification> = test::call_and_read_body_json(&app, req).await;
        assert!(body.is_empty());
    }

    #[actix_web::test]
    async fn test_notification_by_id() {
        let (ledger, record) = seeded_ledger().await;
        let app = init_service(create_app(ledger, Arc::new(NotificationsManager::new()))).await;

        let req = test::TestRequest::get()
            .uri(&format!("/api/notifications/{}", record.id.to_hex()))
            .to_request();
        let body: PublicNotification = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body.source_event_id, "evt-1");

        let req = test::TestRequest::get()
            .uri(&format!("/api/notifications/{}", ObjectId::new().to_hex()))
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);

        let req = test::TestRequest::get()
            .uri("/api/notifications/not-an-id")
            .to_request();
        let res = test::call_service(&app, req).await;
        assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    }
}
