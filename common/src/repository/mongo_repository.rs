use async_trait::async_trait;
use futures::StreamExt;
use mongodb::{
    bson::{doc, Bson},
    options::IndexOptions,
    Client, IndexModel,
};
use serde::{de::DeserializeOwned, Serialize};

use super::{Entity, Repository};

pub struct MongoRepository<T> {
    pub collection: mongodb::Collection<T>,
}

impl<T> MongoRepository<T> {
    pub fn new(client: &Client, database: &str, collection: &str) -> Self {
        let collection = client.database(database).collection(collection);
        Self { collection }
    }

    pub async fn ensure_index(&self, field: &str, unique: bool) -> anyhow::Result<()> {
        let index = IndexModel::builder()
            .keys(doc! { field: 1 })
            .options(IndexOptions::builder().unique(unique).build())
            .build();
        self.collection.create_index(index, None).await?;
        log::debug!(
            "Index on {}.{} ready (unique: {})",
            self.collection.name(),
            field,
            unique
        );
        Ok(())
    }
}

#[async_trait]
impl<T> Repository<T> for MongoRepository<T>
where
    T: Entity + Serialize + DeserializeOwned + Unpin + Send + Sync,
{
    async fn find(&self, field: &str, value: &Bson) -> anyhow::Result<Option<T>> {
        let result = self.collection.find_one(doc! {field: value.clone()}, None).await?;
        Ok(result)
    }

    async fn find_many(&self, field: &str, value: &Bson) -> anyhow::Result<Vec<T>> {
        let result: Vec<mongodb::error::Result<T>> = self
            .collection
            .find(doc! {field: value.clone()}, None)
            .await?
            .collect()
            .await;
        let mut items = result.into_iter().collect::<mongodb::error::Result<Vec<_>>>()?;
        items.sort_by_key(|item| std::cmp::Reverse(item.timestamp()));
        Ok(items)
    }
}
