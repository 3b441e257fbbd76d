use std::env::var;

use lazy_static::lazy_static;

lazy_static! {
    pub static ref API_PREFIX: String = var("API_PREFIX").unwrap_or_else(|_| "/api".to_string());
}
