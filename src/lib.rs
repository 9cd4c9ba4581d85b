//! Shared expense ledger of a group trip.
//!
//! Expenses, archived settlements and clearance flags live in a [`FieldStore`]
//! shared by every client of the trip. A [`Ledger`] keeps a local copy of them
//! in sync, applies mutations optimistically and derives balances and
//! settlement plans from the local copy.
pub mod balance;
pub mod error;
pub mod ledger;
pub mod schemas;
pub mod settlement;
pub mod store;
pub mod sync;

pub use balance::{Balances, CategoryTotal, MemberBalance, SplitShare};
pub use error::{LedgerError, ResultLedger, StoreError, ValidationError};
pub use ledger::Ledger;
pub use schemas::{
    ArchivedSettlement, Category, ClearedSplits, CurrencyRateTable, Expense, ExpenseDraft,
    LedgerModel, Member, Roster,
};
pub use settlement::{SettlementPlan, DEFAULT_EPSILON};
pub use store::{Field, FieldStore, FieldValue, MemoryFieldStore, MongoFieldStore, WriteMode};
pub use sync::{FieldStatus, PendingWrite, Subscription, SyncCoordinator, SyncState, WriteFailure};
