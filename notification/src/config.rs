use std::{env, str::FromStr, time::Duration};

use anyhow::{anyhow, Context};
use lapin::uri::{AMQPAuthority, AMQPUri, AMQPUserInfo};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,
    pub exchange: String,
    pub event_name: String,
    pub queue: String,
    pub prefetch: u16,
    pub dead_letter_exchange: String,
}

impl BusSettings {
    /// Connection target with credentials and vhost kept as plain values,
    /// so nothing in them needs URI escaping.
    pub fn amqp_uri(&self) -> AMQPUri {
        let vhost = match self.vhost.trim_start_matches('/') {
            "" => "/".to_string(),
            vhost => vhost.to_string(),
        };
        AMQPUri {
            authority: AMQPAuthority {
                userinfo: AMQPUserInfo {
                    username: self.username.clone(),
                    password: self.password.clone(),
                },
                host: self.host.clone(),
                port: self.port,
            },
            vhost,
            ..Default::default()
        }
    }

    pub fn dead_letter_queue(&self) -> String {
        format!("{}.queue", self.dead_letter_exchange)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherSettings {
    pub concurrency: usize,
    pub max_redeliveries: u32,
    pub store_timeout: Duration,
    pub ack_timeout: Duration,
    pub reconnect_delay: Duration,
    /// Base pause before a failed message goes back to the queue. Grows with
    /// the attempt number.
    pub requeue_delay: Duration,
    pub processed_cache_size: usize,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_redeliveries: 5,
            store_timeout: Duration::from_millis(5000),
            ack_timeout: Duration::from_millis(2000),
            reconnect_delay: Duration::from_millis(1000),
            requeue_delay: Duration::from_millis(500),
            processed_cache_size: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationConfig {
    pub host: String,
    pub port: u16,
    pub mongo_uri: String,
    pub database: String,
    pub bus: BusSettings,
    pub dispatcher: DispatcherSettings,
}

impl NotificationConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let string = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let mongo_uri = lookup("MONGODB_URL")
            .filter(|uri| !uri.is_empty())
            .ok_or_else(|| anyhow!("MONGODB_URL environment variable is not defined"))?;

        let defaults = DispatcherSettings::default();
        let dispatcher = DispatcherSettings {
            concurrency: parse(&lookup, "WORKER_CONCURRENCY", defaults.concurrency)?,
            max_redeliveries: parse(&lookup, "MAX_REDELIVERIES", defaults.max_redeliveries)?,
            store_timeout: Duration::from_millis(parse(&lookup, "STORE_TIMEOUT_MS", 5000)?),
            ack_timeout: Duration::from_millis(parse(&lookup, "ACK_TIMEOUT_MS", 2000)?),
            reconnect_delay: Duration::from_millis(parse(&lookup, "RECONNECT_DELAY_MS", 1000)?),
            requeue_delay: Duration::from_millis(parse(&lookup, "REQUEUE_DELAY_MS", 500)?),
            processed_cache_size: parse(&lookup, "PROCESSED_CACHE_SIZE", defaults.processed_cache_size)?,
        };
        if dispatcher.concurrency == 0 {
            return Err(anyhow!("WORKER_CONCURRENCY must be at least 1"));
        }

        let event_name = string("RABBIT_MQ_EVENT", "ProductCreated");
        let bus = BusSettings {
            host: string("RABBIT_MQ_HOST", "localhost"),
            port: parse(&lookup, "RABBIT_MQ_PORT", 5672)?,
            username: string("RABBIT_MQ_USERNAME", "guest"),
            password: string("RABBIT_MQ_PASSWORD", "guest"),
            vhost: string("RABBIT_MQ_VHOST", "/"),
            exchange: string("RABBIT_MQ_EXCHANGE", "products"),
            queue: lookup("RABBIT_MQ_QUEUE").unwrap_or_else(|| format!("notification.{}", event_name)),
            event_name,
            prefetch: parse(&lookup, "RABBIT_MQ_PREFETCH", 16)?,
            dead_letter_exchange: string("DEAD_LETTER_EXCHANGE", "notification.dead_letter"),
        };

        Ok(Self {
            host: string("HOST", "0.0.0.0"),
            port: parse(&lookup, "PORT", 8900)?,
            mongo_uri,
            database: string("MONGODB_DATABASE", "notifications"),
            bus,
            dispatcher,
        })
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {}: {:?}", key, value)),
        None => Ok(default),
    }
}
