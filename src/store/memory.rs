use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use super::{Field, FieldStore, FieldStream, FieldValue, WriteMode};
use crate::error::StoreError;

/// In-process field store.
///
/// Clones share the same fields, so several ledgers attached to one store behave
/// like several clients of the same trip.
#[derive(Clone)]
pub struct MemoryFieldStore {
    fields: Arc<HashMap<Field, watch::Sender<Option<FieldValue>>>>,
    failing_writes: Arc<AtomicUsize>,
}

impl Default for MemoryFieldStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryFieldStore {
    pub fn new() -> Self {
        let fields = Field::ALL
            .into_iter()
            .map(|field| (field, watch::Sender::new(None)))
            .collect();
        Self {
            fields: Arc::new(fields),
            failing_writes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Makes the next `count` writes fail as if the store were unreachable.
    pub fn fail_next_writes(&self, count: usize) {
        self.failing_writes.store(count, Ordering::SeqCst);
    }

    fn sender(&self, field: Field) -> &watch::Sender<Option<FieldValue>> {
        // Every field gets a channel in `new`.
        &self.fields[&field]
    }

    fn take_failure(&self) -> bool {
        self.failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl FieldStore for MemoryFieldStore {
    async fn get(&self, field: Field) -> Result<Option<FieldValue>, StoreError> {
        Ok(self.sender(field).borrow().clone())
    }

    async fn set(
        &self,
        field: Field,
        value: FieldValue,
        mode: WriteMode,
    ) -> Result<(), StoreError> {
        value.ensure_field(field)?;
        if self.take_failure() {
            tracing::debug!(%field, "injected write failure");
            return Err(StoreError::Unavailable(format!(
                "write to \"{field}\" rejected"
            )));
        }
        let mut outcome = Ok(());
        self.sender(field).send_if_modified(|current| {
            match value.written_over(current.clone(), mode) {
                Ok(written) => {
                    *current = Some(written);
                    true
                }
                Err(err) => {
                    outcome = Err(err);
                    false
                }
            }
        });
        outcome
    }

    async fn subscribe(&self, field: Field) -> Result<FieldStream, StoreError> {
        let receiver = self.sender(field).subscribe();
        Ok(WatchStream::new(receiver).boxed())
    }
}
