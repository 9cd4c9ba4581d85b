//! MongoDB backed field store.
//!
//! The whole trip lives in a single document of the configured collection:
//!
//! ```text
//! { _id: <trip id>, expenses: [...], archivedSettlements: [...],
//!   clearedSplits: { "<expenseId>-<memberId>": bool }, updatedAt: <date> }
//! ```
//!
//! Subscriptions are served by a change stream on that document, which needs a
//! replica set deployment.
use async_trait::async_trait;
use bson::{doc, Bson, Document};
use chrono::Utc;
use futures::{stream, StreamExt};
use mongodb::change_stream::event::OperationType;
use mongodb::options::{ChangeStreamOptions, FullDocumentType, UpdateOptions};
use mongodb::{Client, Collection};

use super::{Field, FieldStore, FieldStream, FieldValue, WriteMode};
use crate::error::StoreError;

#[derive(Clone)]
pub struct MongoFieldStore {
    collection: Collection<Document>,
    trip_id: String,
}

impl MongoFieldStore {
    pub async fn connect(
        uri: &str,
        database: &str,
        collection: &str,
        trip_id: &str,
    ) -> Result<Self, StoreError> {
        let client = Client::with_uri_str(uri).await?;
        tracing::info!(database, collection, trip_id, "connected to MongoDB");
        Ok(Self::new(&client, database, collection, trip_id))
    }

    pub fn new(client: &Client, database: &str, collection: &str, trip_id: &str) -> Self {
        Self {
            collection: client.database(database).collection(collection),
            trip_id: trip_id.to_string(),
        }
    }

    fn filter(&self) -> Document {
        doc! { "_id": self.trip_id.as_str() }
    }

    async fn load(&self) -> Result<Option<Document>, StoreError> {
        Ok(self.collection.find_one(self.filter(), None).await?)
    }

    async fn apply(&self, mut fields: Document) -> Result<(), StoreError> {
        fields.insert("updatedAt", bson::DateTime::from_chrono(Utc::now()));
        let options = UpdateOptions::builder().upsert(true).build();
        self.collection
            .update_one(self.filter(), doc! { "$set": fields }, options)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl FieldStore for MongoFieldStore {
    async fn get(&self, field: Field) -> Result<Option<FieldValue>, StoreError> {
        decode(field, self.load().await?.as_ref())
    }

    async fn set(
        &self,
        field: Field,
        value: FieldValue,
        mode: WriteMode,
    ) -> Result<(), StoreError> {
        value.ensure_field(field)?;
        let mut fields = Document::new();
        match (mode, value) {
            (WriteMode::Merge, FieldValue::ClearedSplits(flags)) => {
                for (key, cleared) in flags.iter() {
                    fields.insert(format!("{}.{key}", field.key()), *cleared);
                }
            }
            (WriteMode::Merge, value) => {
                let current = decode(field, self.load().await?.as_ref())?;
                let merged = value.written_over(current, WriteMode::Merge)?;
                fields.insert(field.key(), encode(&merged)?);
            }
            (WriteMode::Overwrite, value) => {
                let value = value.written_over(None, WriteMode::Overwrite)?;
                fields.insert(field.key(), encode(&value)?);
            }
        }
        self.apply(fields).await
    }

    async fn subscribe(&self, field: Field) -> Result<FieldStream, StoreError> {
        let pipeline = vec![doc! { "$match": { "documentKey._id": self.trip_id.as_str() } }];
        let options = ChangeStreamOptions::builder()
            .full_document(Some(FullDocumentType::UpdateLookup))
            .build();
        // Open the stream before reading so no change falls in between.
        let changes = self.collection.watch(pipeline, options).await?;
        let current = decode(field, self.load().await?.as_ref())?;

        let updates = changes.filter_map(move |event| async move {
            let event = match event {
                Ok(event) => event,
                Err(err) => {
                    tracing::warn!(%field, "change stream error: {err}");
                    return None;
                }
            };
            if matches!(event.operation_type, OperationType::Delete) {
                return Some(None);
            }
            let document = event.full_document?;
            match decode(field, Some(&document)) {
                Ok(value) => Some(value),
                Err(err) => {
                    tracing::warn!(%field, "skipping undecodable change: {err}");
                    None
                }
            }
        });
        Ok(stream::once(async move { current }).chain(updates).boxed())
    }
}

fn encode(value: &FieldValue) -> Result<Bson, StoreError> {
    let encoded = match value {
        FieldValue::Expenses(expenses) => bson::to_bson(expenses),
        FieldValue::ArchivedSettlements(settlements) => bson::to_bson(settlements),
        FieldValue::ClearedSplits(flags) => bson::to_bson(flags),
    };
    encoded.map_err(|err| StoreError::Codec {
        field: value.field(),
        reason: err.to_string(),
    })
}

fn decode(field: Field, document: Option<&Document>) -> Result<Option<FieldValue>, StoreError> {
    let raw = match document.and_then(|document| document.get(field.key())) {
        None | Some(Bson::Null) => return Ok(None),
        Some(raw) => raw.clone(),
    };
    let codec = |err: bson::de::Error| StoreError::Codec {
        field,
        reason: err.to_string(),
    };
    let value = match field {
        Field::Expenses => FieldValue::Expenses(bson::from_bson(raw).map_err(codec)?),
        Field::ArchivedSettlements => {
            FieldValue::ArchivedSettlements(bson::from_bson(raw).map_err(codec)?)
        }
        Field::ClearedSplits => FieldValue::ClearedSplits(bson::from_bson(raw).map_err(codec)?),
    };
    Ok(Some(value))
}
