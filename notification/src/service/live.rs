use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use actix::{Actor, ActorContext, AsyncContext, Handler, Message, Recipient, StreamHandler};
use actix_web::{HttpRequest, HttpResponse};
use actix_web_actors::ws::{self, WsResponseBuilder};
use anyhow::anyhow;
use common::{
    entities::notification::{NotificationRecord, PublicNotification},
    error::{self, AddCode},
};
use mongodb::bson::oid::ObjectId;

use super::writer::NotificationListener;
use crate::repositories::EventLedger;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Message, Clone, Debug)]
#[rtype(result = "()")]
pub struct LiveNotification(pub PublicNotification);

/// Stored notifications a session starts with, newest first.
#[derive(Message, Debug)]
#[rtype(result = "()")]
struct Backlog(Vec<PublicNotification>);

/// Ids already pushed to one session. A notification can show up both live
/// and in the backlog when it is written while the session opens.
#[derive(Default)]
struct Delivered {
    ids: HashSet<String>,
}

impl Delivered {
    /// Returns true the first time `id` is seen.
    fn first_time(&mut self, id: &str) -> bool {
        self.ids.insert(id.to_string())
    }

    fn unseen(&mut self, notifications: Vec<PublicNotification>) -> Vec<PublicNotification> {
        notifications
            .into_iter()
            .filter(|notification| self.first_time(&notification.id))
            .collect()
    }
}

/// Open WebSocket sessions, by recipient and then by session.
pub struct NotificationsManager {
    subscribers: Mutex<HashMap<String, HashMap<ObjectId, Recipient<LiveNotification>>>>,
}

impl Default for NotificationsManager {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationsManager {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    fn add(&self, recipient_id: &str, session_id: ObjectId, recipient: Recipient<LiveNotification>) {
        self.subscribers
            .lock()
            .unwrap()
            .entry(recipient_id.to_string())
            .or_default()
            .insert(session_id, recipient);
    }

    fn remove(&self, recipient_id: &str, session_id: &ObjectId) {
        let mut subscribers = self.subscribers.lock().unwrap();
        if let Some(sessions) = subscribers.get_mut(recipient_id) {
            sessions.remove(session_id);
            if sessions.is_empty() {
                subscribers.remove(recipient_id);
            }
        }
    }

    pub fn session_count(&self, recipient_id: &str) -> usize {
        self.subscribers
            .lock()
            .unwrap()
            .get(recipient_id)
            .map_or(0, HashMap::len)
    }
}

impl NotificationListener for NotificationsManager {
    fn notify(&self, notification: &NotificationRecord) {
        let subscribers = self.subscribers.lock().unwrap();
        if let Some(sessions) = subscribers.get(&notification.recipient_id) {
            let message = LiveNotification(notification.clone().into());
            for recipient in sessions.values() {
                recipient.do_send(message.clone());
            }
        }
    }
}

struct LiveSession {
    session_id: ObjectId,
    recipient_id: String,
    delivered: Delivered,
    manager: Arc<NotificationsManager>,
    hb: Instant,
}

impl LiveSession {
    fn hb(&self, ctx: &mut <Self as Actor>::Context) {
        ctx.run_interval(HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.hb) > CLIENT_TIMEOUT {
                log::debug!("Live session {} timed out", act.session_id);
                ctx.close(None);
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }
}

impl Actor for LiveSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        self.hb(ctx);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.manager.remove(&self.recipient_id, &self.session_id);
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for LiveSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Close(reason)) => {
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Pong(_)) => self.hb = Instant::now(),
            Ok(ws::Message::Ping(msg)) => {
                self.hb = Instant::now();
                ctx.pong(&msg);
            }
            Err(err) => {
                log::warn!("Live session {} protocol error: {}", self.session_id, err);
                ctx.stop();
            }
            _ => (),
        }
    }
}

impl Handler<LiveNotification> for LiveSession {
    type Result = ();

    fn handle(&mut self, msg: LiveNotification, ctx: &mut Self::Context) {
        if !self.delivered.first_time(&msg.0.id) {
            return;
        }
        match serde_json::to_string(&msg.0) {
            Ok(text) => ctx.text(text),
            Err(err) => log::error!("Failed to serialize notification: {}", err),
        }
    }
}

impl Handler<Backlog> for LiveSession {
    type Result = ();

    fn handle(&mut self, msg: Backlog, ctx: &mut Self::Context) {
        let backlog = self.delivered.unseen(msg.0);
        match serde_json::to_string(&backlog) {
            Ok(text) => ctx.text(text),
            Err(err) => log::error!("Failed to serialize backlog: {}", err),
        }
    }
}

/// Opens a live session. The session is registered before the backlog is
/// read, so nothing written in between is missed.
pub async fn subscribe(
    req: HttpRequest,
    stream: actix_web::web::Payload,
    manager: Arc<NotificationsManager>,
    recipient_id: String,
    ledger: &dyn EventLedger,
) -> error::Result<HttpResponse> {
    let session_id = ObjectId::new();
    let session = LiveSession {
        session_id,
        recipient_id: recipient_id.clone(),
        delivered: Delivered::default(),
        manager: manager.clone(),
        hb: Instant::now(),
    };

    let Ok((addr, resp)) = WsResponseBuilder::new(session, &req, stream).start_with_addr() else {
        return Err(anyhow!("Failed to start websocket").code(400));
    };
    manager.add(&recipient_id, session_id, addr.clone().recipient());

    let backlog = match ledger.find_by_recipient(&recipient_id).await {
        Ok(backlog) => backlog,
        Err(err) => {
            manager.remove(&recipient_id, &session_id);
            return Err(err.into());
        }
    };
    addr.do_send(Backlog(
        backlog.into_iter().map(PublicNotification::from).collect(),
    ));
    log::debug!("Live session {} opened for {}", session_id, recipient_id);

    Ok(resp)
}
