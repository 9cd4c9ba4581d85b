use std::collections::HashMap;

use serde::Serialize;

use crate::schemas::{
    ArchivedSettlement, Category, ClearedSplits, CurrencyRateTable, Expense, LedgerModel, Member,
    MemberId,
};

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberBalance {
    pub member_id: MemberId,
    /// Positive when the member is owed money, negative when they owe.
    pub balance: f64,
}

/// Net position of every member in the common currency, in roster order.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Balances(Vec<MemberBalance>);

impl Balances {
    pub fn get(&self, member_id: &str) -> Option<f64> {
        self.0
            .iter()
            .find(|entry| entry.member_id == member_id)
            .map(|entry| entry.balance)
    }

    pub fn iter(&self) -> impl Iterator<Item = &MemberBalance> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Sum of all balances, zero up to floating point noise.
    pub fn total(&self) -> f64 {
        self.0.iter().map(|entry| entry.balance).sum()
    }
}

impl FromIterator<MemberBalance> for Balances {
    fn from_iter<T: IntoIterator<Item = MemberBalance>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Balances indexed by roster position.
struct Tally<'a> {
    index: HashMap<&'a str, usize>,
    balances: Vec<f64>,
}

impl<'a> Tally<'a> {
    fn new(members: &'a [Member]) -> Self {
        Self {
            index: members
                .iter()
                .enumerate()
                .map(|(position, member)| (member.id.as_str(), position))
                .collect(),
            balances: vec![0.0; members.len()],
        }
    }

    /// Moves `amount` of debt from `debtor` to `creditor`. Skipped when either
    /// side is unknown so that the total stays at zero.
    fn transfer(&mut self, creditor: &str, debtor: &str, amount: f64) -> bool {
        match (self.index.get(creditor), self.index.get(debtor)) {
            (Some(&creditor), Some(&debtor)) => {
                self.balances[creditor] += amount;
                self.balances[debtor] -= amount;
                true
            }
            _ => false,
        }
    }
}

pub fn compute_balances(
    members: &[Member],
    ledger: &LedgerModel,
    rates: &CurrencyRateTable,
) -> Balances {
    compute_balances_from(
        members,
        &ledger.expenses,
        &ledger.archived_settlements,
        &ledger.cleared_splits,
        rates,
    )
}

pub fn compute_balances_from(
    members: &[Member],
    expenses: &[Expense],
    archived: &[ArchivedSettlement],
    cleared: &ClearedSplits,
    rates: &CurrencyRateTable,
) -> Balances {
    let mut tally = Tally::new(members);

    for expense in expenses {
        if expense.split_with.is_empty() {
            continue;
        }
        let amount = rates.convert(expense.amount, &expense.currency);
        let share = amount / expense.split_with.len() as f64;
        for member in &expense.split_with {
            if *member == expense.payer_id || cleared.is_cleared(&expense.id, member) {
                continue;
            }
            if !tally.transfer(&expense.payer_id, member, share) {
                tracing::debug!(
                    expense = %expense.id,
                    payer = %expense.payer_id,
                    member = %member,
                    "skipping share of a member outside the roster"
                );
            }
        }
    }

    for settlement in archived {
        if !tally.transfer(&settlement.from, &settlement.to, settlement.amount) {
            tracing::debug!(
                settlement = %settlement.id,
                "skipping settlement of a member outside the roster"
            );
        }
    }

    members
        .iter()
        .zip(tally.balances)
        .map(|(member, balance)| MemberBalance {
            member_id: member.id.clone(),
            balance,
        })
        .collect()
}

pub fn total_in_common_currency(expenses: &[Expense], rates: &CurrencyRateTable) -> f64 {
    expenses
        .iter()
        .map(|expense| rates.convert(expense.amount, &expense.currency))
        .sum()
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CategoryTotal {
    pub category: Category,
    pub amount: f64,
    /// Share of the trip total, between 0 and 1.
    pub fraction: f64,
}

/// Spending per category in the common currency, biggest first.
pub fn spending_by_category(expenses: &[Expense], rates: &CurrencyRateTable) -> Vec<CategoryTotal> {
    let mut totals: Vec<CategoryTotal> = Vec::new();
    for expense in expenses {
        let amount = rates.convert(expense.amount, &expense.currency);
        match totals
            .iter_mut()
            .find(|total| total.category == expense.category)
        {
            Some(total) => total.amount += amount,
            None => totals.push(CategoryTotal {
                category: expense.category,
                amount,
                fraction: 0.0,
            }),
        }
    }
    let trip_total: f64 = totals.iter().map(|total| total.amount).sum();
    for total in &mut totals {
        total.fraction = if trip_total > 0.0 {
            total.amount / trip_total
        } else {
            0.0
        };
    }
    totals.sort_by(|a, b| b.amount.total_cmp(&a.amount));
    totals
}

/// Expenses of one category, most recent date first.
pub fn expenses_in_category(expenses: &[Expense], category: Category) -> Vec<Expense> {
    let mut selected: Vec<Expense> = expenses
        .iter()
        .filter(|expense| expense.category == category)
        .cloned()
        .collect();
    selected.sort_by(|a, b| b.date.cmp(&a.date));
    selected
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitShare {
    pub member_id: MemberId,
    /// The member's part of the expense in the common currency.
    pub share: f64,
    pub cleared: bool,
    /// The payer's own part, which is never owed to anybody.
    pub is_payer: bool,
}

pub fn expense_shares(
    expense: &Expense,
    rates: &CurrencyRateTable,
    cleared: &ClearedSplits,
) -> Vec<SplitShare> {
    if expense.split_with.is_empty() {
        return Vec::new();
    }
    let share =
        rates.convert(expense.amount, &expense.currency) / expense.split_with.len() as f64;
    expense
        .split_with
        .iter()
        .map(|member| SplitShare {
            member_id: member.clone(),
            share,
            cleared: cleared.is_cleared(&expense.id, member),
            is_payer: *member == expense.payer_id,
        })
        .collect()
}
