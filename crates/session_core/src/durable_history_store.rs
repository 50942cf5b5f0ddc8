use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use shared::domain::{Identity, SessionRecord, UserId};
use storage::Storage;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::{HistoryFeed, HistoryStore};

const CHANGE_BUFFER: usize = 128;
const FEED_DEPTH: usize = 16;

/// SQLite-backed [`HistoryStore`]. Every acknowledged write pushes a fresh
/// snapshot to the writer's open feeds.
pub struct DurableHistoryStore {
    store: Storage,
    changes: broadcast::Sender<UserId>,
}

impl DurableHistoryStore {
    pub async fn initialize(database_url: &str) -> Result<Arc<Self>> {
        let store = Storage::new(database_url)
            .await
            .with_context(|| format!("failed to initialize history storage at '{database_url}'"))?;
        Ok(Arc::new(Self::new(store)))
    }

    pub fn new(store: Storage) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        Self { store, changes }
    }

    pub fn storage(&self) -> &Storage {
        &self.store
    }
}

#[async_trait]
impl HistoryStore for DurableHistoryStore {
    async fn write(&self, identity: &Identity, record: &SessionRecord) -> Result<()> {
        self.store
            .append_session_record(&identity.user_id, record)
            .await?;
        debug!(user_id = %identity.user_id, record_id = %record.id, "session record stored");
        let _ = self.changes.send(identity.user_id.clone());
        Ok(())
    }

    async fn subscribe(&self, identity: &Identity) -> Result<HistoryFeed> {
        // listen before the first read so a concurrent write cannot slip between
        let mut changes = self.changes.subscribe();
        let initial = self.store.list_session_records(&identity.user_id).await?;

        let (tx, rx) = mpsc::channel(FEED_DEPTH);
        let store = self.store.clone();
        let user_id = identity.user_id.clone();
        let producer = tokio::spawn(async move {
            if tx.send(initial).await.is_err() {
                return;
            }
            loop {
                match changes.recv().await {
                    Ok(changed) if changed != user_id => continue,
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
                match store.list_session_records(&user_id).await {
                    Ok(records) => {
                        if tx.send(records).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(user_id = %user_id, "failed to refresh history: {err:#}"),
                }
            }
        });

        Ok(HistoryFeed::new(rx, producer))
    }
}

#[cfg(test)]
#[path = "tests/durable_history_store_tests.rs"]
mod tests;
