pub mod mongo_repository;

use async_trait::async_trait;
use mongodb::bson::Bson;

pub trait Entity {
    fn timestamp(&self) -> i64;
}

#[async_trait]
pub trait Repository<T> {
    async fn find(&self, field: &str, value: &Bson) -> anyhow::Result<Option<T>>;
    /// Newest first, by [`Entity::timestamp`].
    async fn find_many(&self, field: &str, value: &Bson) -> anyhow::Result<Vec<T>>;
}
