//! MongoDB-backed document store.

use bson::{Document, doc};
use chrono::{DateTime, Utc};
use futures_util::TryStreamExt;
use mongodb::options::FullDocumentType;
use mongodb::{Client, Collection};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{DirectoryStore, SampleStore, StoreError};
use crate::config::Settings;
use crate::model::{
    ChangeEvent, CommandStatusSnapshot, DiskStatusSnapshot, Instance, SlowQueryRecord,
};

/// Handles to the engine's collections. Cheap to clone.
#[derive(Clone)]
pub struct MongoStore {
    instances: Collection<Document>,
    slow_log: Collection<SlowQueryRecord>,
    com_status: Collection<CommandStatusSnapshot>,
    disk_usage: Collection<DiskStatusSnapshot>,
}

impl MongoStore {
    /// Connects and verifies the server with a ping.
    pub async fn connect(settings: &Settings) -> Result<Self, StoreError> {
        let client = Client::with_uri_str(&settings.mongo_uri)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        let db = client.database(&settings.mongo_db);
        db.run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;
        info!(db = %settings.mongo_db, "connected to document store");

        Ok(Self {
            instances: db.collection(&settings.instance_collection),
            slow_log: db.collection(&settings.slow_log_collection),
            com_status: db.collection(&settings.com_status_collection),
            disk_usage: db.collection(&settings.disk_usage_collection),
        })
    }
}

impl DirectoryStore for MongoStore {
    async fn load_instances(&self) -> Result<Vec<Instance>, StoreError> {
        let mut cursor = self
            .instances
            .find(doc! {})
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        let mut out = Vec::new();
        while let Some(document) = cursor
            .try_next()
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?
        {
            match bson::from_document::<Instance>(document) {
                Ok(instance) => out.push(instance),
                Err(e) => {
                    // Incomplete entry: skip it, keep the rest of the fleet.
                    warn!(error = %e, "skipping malformed instance document");
                }
            }
        }
        Ok(out)
    }

    async fn watch_instances(&self, tx: mpsc::Sender<ChangeEvent>) -> Result<(), StoreError> {
        let mut stream = self
            .instances
            .watch()
            .full_document(FullDocumentType::UpdateLookup)
            .await
            .map_err(|e| StoreError::Feed(e.to_string()))?;
        debug!("directory change feed opened");

        while let Some(event) = stream
            .try_next()
            .await
            .map_err(|e| StoreError::Feed(e.to_string()))?
        {
            use mongodb::change_stream::event::OperationType;

            let mapped = match event.operation_type {
                OperationType::Insert | OperationType::Update | OperationType::Replace => {
                    match event.full_document {
                        Some(document) => match bson::from_document::<Instance>(document) {
                            Ok(instance) => Some(ChangeEvent::Upsert(instance)),
                            Err(e) => {
                                warn!(error = %e, "ignoring malformed directory change");
                                None
                            }
                        },
                        None => None,
                    }
                }
                OperationType::Delete => event
                    .document_key
                    .as_ref()
                    .and_then(removed_instance_name)
                    .map(ChangeEvent::Remove),
                _ => None,
            };

            if let Some(change) = mapped {
                if tx.send(change).await.is_err() {
                    // Receiver gone — the dispatcher is shutting down.
                    return Ok(());
                }
            }
        }

        Ok(())
    }
}

/// Extracts the instance name from a delete event's document key.
///
/// Deletes carry only the document key, not the full document; the name is
/// taken from an `instance_name` key if present, otherwise from a string
/// `_id`. Anything else is dropped here and picked up by reconciliation.
fn removed_instance_name(key: &Document) -> Option<String> {
    key.get_str("instance_name")
        .or_else(|_| key.get_str("_id"))
        .ok()
        .map(str::to_string)
}

impl SampleStore for MongoStore {
    async fn slow_query_exists(
        &self,
        instance: &str,
        db: &str,
        pid: i64,
        start: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let filter = doc! {
            "instance": instance,
            "db": db,
            "pid": pid,
            "start": bson::DateTime::from_chrono(start),
        };
        let found = self
            .slow_log
            .find_one(filter)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(found.is_some())
    }

    async fn insert_slow_query(&self, record: &SlowQueryRecord) -> Result<(), StoreError> {
        self.slow_log
            .insert_one(record)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    async fn insert_command_status(
        &self,
        snapshot: &CommandStatusSnapshot,
    ) -> Result<(), StoreError> {
        self.com_status
            .insert_one(snapshot)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    async fn insert_disk_status(&self, snapshot: &DiskStatusSnapshot) -> Result<(), StoreError> {
        self.disk_usage
            .insert_one(snapshot)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directory_document_parses_with_optional_fields_defaulted() {
        let doc = doc! {
            "instance_name": "db-a",
            "host": "10.1.2.3",
            "port": 3306,
            "user": "monitorer",
            "password": "blob",
        };
        let instance = bson::from_document::<Instance>(doc).unwrap();
        assert_eq!(instance.name, "db-a");
        assert_eq!(instance.port, 3306);
        assert_eq!(instance.db, "");
        assert_eq!(instance.account, "");
    }

    #[test]
    fn incomplete_directory_document_is_rejected() {
        // No host: the document is skipped, not defaulted.
        let doc = doc! {
            "instance_name": "db-a",
            "port": 3306,
            "user": "monitorer",
            "password": "blob",
        };
        assert!(bson::from_document::<Instance>(doc).is_err());
    }

    #[test]
    fn delete_key_prefers_instance_name() {
        let key = doc! { "_id": "oid", "instance_name": "db-a" };
        assert_eq!(removed_instance_name(&key).as_deref(), Some("db-a"));
    }

    #[test]
    fn delete_key_falls_back_to_string_id() {
        let key = doc! { "_id": "db-b" };
        assert_eq!(removed_instance_name(&key).as_deref(), Some("db-b"));
    }

    #[test]
    fn delete_key_without_name_is_dropped() {
        let key = doc! { "_id": bson::oid::ObjectId::new() };
        assert_eq!(removed_instance_name(&key), None);
    }
}
