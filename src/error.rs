//! Errors raised by the ledger core.
//!
//! - [`ValidationError`] rejects a mutation locally, before anything is written.
//! - [`StoreError`] reports a failed read or write against the field store.
//! - [`LedgerError`] is what the [`Ledger`] facade returns to its callers.
//!
//!  [`Ledger`]: crate::Ledger
use thiserror::Error;

use crate::store::Field;

/// Mutations rejected before any write is issued.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(f64),
    #[error("An expense must be split with at least one member")]
    EmptySplit,
    #[error("\"{0}\" appears more than once in the split")]
    DuplicateSplitMember(String),
    #[error("\"{0}\" member not found!")]
    UnknownMember(String),
    #[error("\"{0}\" already present!")]
    DuplicateMember(String),
    #[error("A trip needs at least one member")]
    EmptyRoster,
    #[error("The last member of a trip can't be removed")]
    LastMember,
    #[error("\"{0}\" expense not found!")]
    UnknownExpense(String),
    #[error("\"{0}\" settlement not found!")]
    UnknownSettlement(String),
    #[error("\"{member}\" is not part of the split of expense \"{expense}\"")]
    NotInSplit { expense: String, member: String },
    #[error("A settlement needs two different members")]
    SelfSettlement,
    #[error("Unarchiving a settlement needs an explicit confirmation")]
    NotConfirmed,
    #[error("Invalid rate for {code}: {rate}")]
    InvalidRate { code: String, rate: f64 },
    #[error("The common currency {0} always has rate 1")]
    CommonCurrency(String),
    #[error("Currency code can't be empty")]
    EmptyCurrency,
    #[error("Settlement tolerance must be a positive number, got {0}")]
    InvalidEpsilon(f64),
    #[error("\"{0}\" is not a category")]
    UnknownCategory(String),
}

/// Failures of the field store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Field store unavailable: {0}")]
    Unavailable(String),
    #[error("Value for \"{found}\" written to field \"{expected}\"")]
    FieldMismatch { expected: Field, found: Field },
    #[error("Can't encode or decode field \"{field}\": {reason}")]
    Codec { field: Field, reason: String },
    #[error(transparent)]
    Mongo(#[from] mongodb::error::Error),
}

/// Errors returned by the [`Ledger`](crate::Ledger) operations.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Field \"{0}\" has not been synchronized yet")]
    NotSynced(Field),
    #[error("Write to \"{0}\" was aborted before completing")]
    WriteAborted(Field),
}

pub type ResultLedger<T> = Result<T, LedgerError>;
