//! Named fields of the shared trip document and the store that holds them.
//!
//! A [`FieldStore`] keeps one value per [`Field`]. Values are typed
//! ([`FieldValue`]) and tagged with the field they belong to; writing a value to
//! the wrong field is rejected at the store boundary.
use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::schemas::{ArchivedSettlement, ClearedSplits, Expense};

pub mod memory;
pub mod mongo;

pub use memory::MemoryFieldStore;
pub use mongo::MongoFieldStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Field {
    Expenses,
    ArchivedSettlements,
    ClearedSplits,
}

impl Field {
    pub const ALL: [Field; 3] = [
        Field::Expenses,
        Field::ArchivedSettlements,
        Field::ClearedSplits,
    ];

    /// Name of the field inside the trip document.
    pub const fn key(self) -> &'static str {
        match self {
            Field::Expenses => "expenses",
            Field::ArchivedSettlements => "archivedSettlements",
            Field::ClearedSplits => "clearedSplits",
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteMode {
    /// Replace the whole field.
    Overwrite,
    /// Upsert the given entries (by id, or by key for clearance flags) and keep
    /// the others.
    Merge,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Expenses(Vec<Expense>),
    ArchivedSettlements(Vec<ArchivedSettlement>),
    ClearedSplits(ClearedSplits),
}

impl FieldValue {
    pub fn field(&self) -> Field {
        match self {
            FieldValue::Expenses(_) => Field::Expenses,
            FieldValue::ArchivedSettlements(_) => Field::ArchivedSettlements,
            FieldValue::ClearedSplits(_) => Field::ClearedSplits,
        }
    }

    /// The value a never-written field reads as.
    pub fn empty(field: Field) -> Self {
        match field {
            Field::Expenses => FieldValue::Expenses(Vec::new()),
            Field::ArchivedSettlements => FieldValue::ArchivedSettlements(Vec::new()),
            Field::ClearedSplits => FieldValue::ClearedSplits(ClearedSplits::default()),
        }
    }

    /// Fails unless the value belongs to `field`.
    pub fn ensure_field(&self, field: Field) -> Result<(), StoreError> {
        if self.field() == field {
            Ok(())
        } else {
            Err(StoreError::FieldMismatch {
                expected: field,
                found: self.field(),
            })
        }
    }

    /// Drops stored records that would corrupt the balances, logging each one.
    pub fn without_invalid_records(self) -> FieldValue {
        match self {
            FieldValue::Expenses(expenses) => FieldValue::Expenses(
                expenses
                    .into_iter()
                    .filter(|expense| match expense.validate() {
                        Ok(()) => true,
                        Err(err) => {
                            tracing::warn!(expense = %expense.id, "skipping stored expense: {err}");
                            false
                        }
                    })
                    .collect(),
            ),
            FieldValue::ArchivedSettlements(settlements) => FieldValue::ArchivedSettlements(
                settlements
                    .into_iter()
                    .filter(|settlement| match settlement.validate() {
                        Ok(()) => true,
                        Err(err) => {
                            tracing::warn!(settlement = %settlement.id, "skipping stored settlement: {err}");
                            false
                        }
                    })
                    .collect(),
            ),
            flags => flags,
        }
    }

    /// Computes the field content after writing `self` over `current`.
    pub fn written_over(
        self,
        current: Option<FieldValue>,
        mode: WriteMode,
    ) -> Result<FieldValue, StoreError> {
        let field = self.field();
        let current = match (mode, current) {
            (WriteMode::Overwrite, _) | (WriteMode::Merge, None) => {
                return Ok(self.sorted());
            }
            (WriteMode::Merge, Some(current)) => current,
        };
        current.ensure_field(field)?;
        let merged = match (current, self) {
            (FieldValue::Expenses(mut current), FieldValue::Expenses(incoming)) => {
                upsert_by(&mut current, incoming, |expense| expense.id.clone());
                FieldValue::Expenses(current)
            }
            (
                FieldValue::ArchivedSettlements(mut current),
                FieldValue::ArchivedSettlements(incoming),
            ) => {
                upsert_by(&mut current, incoming, |settlement| settlement.id.clone());
                FieldValue::ArchivedSettlements(current)
            }
            (FieldValue::ClearedSplits(mut current), FieldValue::ClearedSplits(incoming)) => {
                current.extend(incoming);
                FieldValue::ClearedSplits(current)
            }
            (current, _) => {
                return Err(StoreError::FieldMismatch {
                    expected: field,
                    found: current.field(),
                })
            }
        };
        Ok(merged.sorted())
    }

    /// Orders collections most recent first.
    fn sorted(self) -> FieldValue {
        match self {
            FieldValue::Expenses(mut expenses) => {
                expenses.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                FieldValue::Expenses(expenses)
            }
            FieldValue::ArchivedSettlements(mut settlements) => {
                settlements.sort_by(|a, b| b.date.cmp(&a.date));
                FieldValue::ArchivedSettlements(settlements)
            }
            cleared => cleared,
        }
    }
}

fn upsert_by<T, K: PartialEq>(current: &mut Vec<T>, incoming: Vec<T>, key: impl Fn(&T) -> K) {
    for item in incoming {
        let id = key(&item);
        match current.iter_mut().find(|existing| key(existing) == id) {
            Some(existing) => *existing = item,
            None => current.push(item),
        }
    }
}

/// Change notifications for one field. `None` means the field was never written.
/// Dropping the stream ends the subscription.
pub type FieldStream = BoxStream<'static, Option<FieldValue>>;

/// Durable, shared storage of the trip fields.
///
/// Delivery on a [`FieldStream`] starts with the current value and is
/// at-least-once afterwards; intermediate values may be skipped. Concurrent
/// writers race and the last accepted write wins.
#[async_trait]
pub trait FieldStore: Send + Sync {
    async fn get(&self, field: Field) -> Result<Option<FieldValue>, StoreError>;

    /// Writes `value` into `field`, creating the field when missing.
    async fn set(&self, field: Field, value: FieldValue, mode: WriteMode)
        -> Result<(), StoreError>;

    async fn subscribe(&self, field: Field) -> Result<FieldStream, StoreError>;
}
