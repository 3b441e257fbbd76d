use chrono::Utc;

pub mod entities;
pub mod error;
pub mod repository;
pub mod services;

pub fn default_timestamp() -> i64 {
    Utc::now().timestamp_micros()
}
