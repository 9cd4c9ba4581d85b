use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use crate::balance::{self, Balances, CategoryTotal, SplitShare};
use crate::error::{ResultLedger, ValidationError};
use crate::schemas::{
    ArchivedSettlement, Category, ClearedSplits, CurrencyRateTable, Expense, ExpenseDraft,
    Member, Roster,
};
use crate::settlement::{self, SettlementPlan, DEFAULT_EPSILON};
use crate::store::{Field, FieldStore, FieldValue, WriteMode};
use crate::sync::{FieldStatus, PendingWrite, Subscription, SyncCoordinator, WriteFailure};

/// Shared ledger of one trip, as seen by one client.
///
/// Mutations check their input, update the local model and return a
/// [`PendingWrite`] for the store outcome. Queries are computed from the local
/// model, the roster and the rate table each time they are called.
#[derive(Clone)]
pub struct Ledger {
    sync: SyncCoordinator,
    roster: Arc<RwLock<Roster>>,
    rates: Arc<RwLock<CurrencyRateTable>>,
    epsilon: f64,
}

impl Ledger {
    pub fn new(store: Arc<dyn FieldStore>, roster: Roster, rates: CurrencyRateTable) -> Self {
        Self {
            sync: SyncCoordinator::new(store),
            roster: Arc::new(RwLock::new(roster)),
            rates: Arc::new(RwLock::new(rates)),
            epsilon: DEFAULT_EPSILON,
        }
    }

    /// Sets the tolerance under which a balance counts as settled.
    pub fn with_epsilon(mut self, epsilon: f64) -> Result<Self, ValidationError> {
        if !epsilon.is_finite() || epsilon <= 0.0 {
            return Err(ValidationError::InvalidEpsilon(epsilon));
        }
        self.epsilon = epsilon;
        Ok(self)
    }

    pub fn coordinator(&self) -> &SyncCoordinator {
        &self.sync
    }

    pub async fn subscribe_expenses<F>(&self, callback: F) -> ResultLedger<Subscription>
    where
        F: Fn(&[Expense]) + Send + Sync + 'static,
    {
        self.sync
            .subscribe(
                Field::Expenses,
                Arc::new(move |value: &FieldValue| {
                    if let FieldValue::Expenses(expenses) = value {
                        callback(expenses);
                    }
                }),
            )
            .await
    }

    pub async fn subscribe_archived_settlements<F>(
        &self,
        callback: F,
    ) -> ResultLedger<Subscription>
    where
        F: Fn(&[ArchivedSettlement]) + Send + Sync + 'static,
    {
        self.sync
            .subscribe(
                Field::ArchivedSettlements,
                Arc::new(move |value: &FieldValue| {
                    if let FieldValue::ArchivedSettlements(settlements) = value {
                        callback(settlements);
                    }
                }),
            )
            .await
    }

    pub async fn subscribe_cleared_splits<F>(&self, callback: F) -> ResultLedger<Subscription>
    where
        F: Fn(&ClearedSplits) + Send + Sync + 'static,
    {
        self.sync
            .subscribe(
                Field::ClearedSplits,
                Arc::new(move |value: &FieldValue| {
                    if let FieldValue::ClearedSplits(flags) = value {
                        callback(flags);
                    }
                }),
            )
            .await
    }

    /// Keeps every field synchronized for as long as the returned handles live,
    /// and waits for the first value of each.
    pub async fn sync_all(&self) -> ResultLedger<Vec<Subscription>> {
        let mut subscriptions = Vec::with_capacity(Field::ALL.len());
        for field in Field::ALL {
            subscriptions.push(self.sync.subscribe(field, Arc::new(|_: &FieldValue| {})).await?);
        }
        for field in Field::ALL {
            self.sync.until_synced(field).await?;
        }
        tracing::info!("ledger synchronized");
        Ok(subscriptions)
    }

    /// Adds a new expense (draft without id) or replaces an existing one.
    pub fn save_expense(&self, draft: ExpenseDraft) -> ResultLedger<PendingWrite> {
        let roster = self.roster();
        draft.validate(&roster)?;
        let editing = draft.id.is_some();
        self.sync
            .write_with(Field::Expenses, WriteMode::Merge, editing, |model| {
                let existing = draft.id.as_deref().and_then(|id| model.expense(id));
                let expense = draft.into_expense(&roster, existing, Utc::now())?;
                tracing::info!(expense = %expense.id, editing, "saving expense");
                Ok(FieldValue::Expenses(vec![expense]))
            })
    }

    pub fn delete_expense(&self, id: &str) -> ResultLedger<PendingWrite> {
        self.sync
            .write_with(Field::Expenses, WriteMode::Overwrite, true, |model| {
                if model.expense(id).is_none() {
                    return Err(ValidationError::UnknownExpense(id.to_string()).into());
                }
                tracing::info!(expense = id, "deleting expense");
                Ok(FieldValue::Expenses(
                    model
                        .expenses
                        .iter()
                        .filter(|expense| expense.id != id)
                        .cloned()
                        .collect(),
                ))
            })
    }

    /// Records a payment. Submitting the same record again (same id) is a no-op
    /// on the stored data, so retries are safe.
    pub fn archive_settlement(&self, settlement: ArchivedSettlement) -> ResultLedger<PendingWrite> {
        settlement.validate()?;
        {
            let roster = self.roster.read();
            for member in [&settlement.from, &settlement.to] {
                if !roster.contains(member) {
                    return Err(ValidationError::UnknownMember(member.clone()).into());
                }
            }
        }
        tracing::info!(
            settlement = %settlement.id,
            from = %settlement.from,
            to = %settlement.to,
            amount = settlement.amount,
            "archiving settlement"
        );
        self.sync.write(
            Field::ArchivedSettlements,
            FieldValue::ArchivedSettlements(vec![settlement]),
            WriteMode::Merge,
        )
    }

    /// Archives a plan entry under a fresh id. Keep the returned record to retry
    /// with [`Ledger::archive_settlement`].
    pub fn archive_plan(
        &self,
        plan: &SettlementPlan,
    ) -> ResultLedger<(ArchivedSettlement, PendingWrite)> {
        let settlement =
            ArchivedSettlement::new(plan.from.clone(), plan.to.clone(), plan.amount, Utc::now())?;
        let pending = self.archive_settlement(settlement.clone())?;
        Ok((settlement, pending))
    }

    /// Deletes an archived settlement, bringing back the debt it retired.
    pub fn unarchive_settlement(&self, id: &str, confirmed: bool) -> ResultLedger<PendingWrite> {
        if !confirmed {
            return Err(ValidationError::NotConfirmed.into());
        }
        self.sync
            .write_with(Field::ArchivedSettlements, WriteMode::Overwrite, true, |model| {
                if model.archived_settlement(id).is_none() {
                    return Err(ValidationError::UnknownSettlement(id.to_string()).into());
                }
                tracing::info!(settlement = id, "unarchiving settlement");
                Ok(FieldValue::ArchivedSettlements(
                    model
                        .archived_settlements
                        .iter()
                        .filter(|settlement| settlement.id != id)
                        .cloned()
                        .collect(),
                ))
            })
    }

    pub fn toggle_cleared_split(
        &self,
        expense_id: &str,
        member_id: &str,
    ) -> ResultLedger<PendingWrite> {
        self.sync.require_synced(Field::Expenses)?;
        self.sync
            .write_with(Field::ClearedSplits, WriteMode::Merge, true, |model| {
                let expense = model
                    .expense(expense_id)
                    .ok_or_else(|| ValidationError::UnknownExpense(expense_id.to_string()))?;
                if !expense.split_with.iter().any(|member| member == member_id) {
                    return Err(ValidationError::NotInSplit {
                        expense: expense_id.to_string(),
                        member: member_id.to_string(),
                    }
                    .into());
                }
                let cleared = !model.cleared_splits.is_cleared(expense_id, member_id);
                tracing::info!(expense = expense_id, member = member_id, cleared, "toggling split");
                let mut flag = ClearedSplits::default();
                flag.set(expense_id, member_id, cleared);
                Ok(FieldValue::ClearedSplits(flag))
            })
    }

    pub fn get_balances(&self) -> Balances {
        let roster = self.roster.read();
        let rates = self.rates.read();
        self.sync
            .read(|model| balance::compute_balances(roster.members(), model, &rates))
    }

    pub fn get_settlement_plans(&self) -> Vec<SettlementPlan> {
        settlement::plan_settlements(&self.get_balances(), self.epsilon)
    }

    pub fn get_pairwise_debts(&self) -> Vec<SettlementPlan> {
        let roster = self.roster.read();
        let rates = self.rates.read();
        self.sync.read(|model| {
            settlement::pairwise_debts(roster.members(), model, &rates, self.epsilon)
        })
    }

    pub fn get_total_in_common_currency(&self) -> f64 {
        let rates = self.rates.read();
        self.sync
            .read(|model| balance::total_in_common_currency(&model.expenses, &rates))
    }

    pub fn get_spending_by_category(&self) -> Vec<CategoryTotal> {
        let rates = self.rates.read();
        self.sync
            .read(|model| balance::spending_by_category(&model.expenses, &rates))
    }

    pub fn get_expenses_in_category(&self, category: Category) -> Vec<Expense> {
        self.sync
            .read(|model| balance::expenses_in_category(&model.expenses, category))
    }

    pub fn get_expense_shares(&self, expense_id: &str) -> ResultLedger<Vec<SplitShare>> {
        let rates = self.rates.read();
        self.sync.read(|model| {
            let expense = model
                .expense(expense_id)
                .ok_or_else(|| ValidationError::UnknownExpense(expense_id.to_string()))?;
            Ok(balance::expense_shares(expense, &rates, &model.cleared_splits))
        })
    }

    pub fn expenses(&self) -> Vec<Expense> {
        self.sync.read(|model| model.expenses.clone())
    }

    pub fn archived_settlements(&self) -> Vec<ArchivedSettlement> {
        self.sync.read(|model| model.archived_settlements.clone())
    }

    pub fn cleared_splits(&self) -> ClearedSplits {
        self.sync.read(|model| model.cleared_splits.clone())
    }

    pub fn field_status(&self, field: Field) -> FieldStatus {
        self.sync.status(field)
    }

    pub fn write_failures(&self) -> broadcast::Receiver<WriteFailure> {
        self.sync.write_failures()
    }

    pub fn roster(&self) -> Roster {
        self.roster.read().clone()
    }

    pub fn set_roster(&self, members: Vec<Member>) -> Result<(), ValidationError> {
        *self.roster.write() = Roster::new(members)?;
        Ok(())
    }

    pub fn add_member(&self, member: Member) -> Result<(), ValidationError> {
        self.roster.write().add(member)
    }

    pub fn remove_member(&self, id: &str) -> Result<Member, ValidationError> {
        self.roster.write().remove(id)
    }

    pub fn rates(&self) -> CurrencyRateTable {
        self.rates.read().clone()
    }

    pub fn set_rates(&self, rates: CurrencyRateTable) {
        *self.rates.write() = rates;
    }

    pub fn set_rate(&self, code: &str, rate: f64) -> Result<(), ValidationError> {
        self.rates.write().set_rate(code, rate)
    }

    pub fn remove_rate(&self, code: &str) -> Result<Option<f64>, ValidationError> {
        self.rates.write().remove_rate(code)
    }
}
