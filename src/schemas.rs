use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

pub type MemberId = String;
pub type ExpenseId = String;
pub type SettlementId = String;

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Member {
    pub id: MemberId,
    pub name: String,
    #[serde(default)]
    pub avatar: String,
}

/// The members of the trip, in the order they joined.
///
/// The order matters: balances are reported in roster order, and the settlement
/// planner breaks ties between equal balances by that order.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Roster {
    members: Vec<Member>,
}

impl Roster {
    pub fn new(members: Vec<Member>) -> Result<Self, ValidationError> {
        if members.is_empty() {
            return Err(ValidationError::EmptyRoster);
        }
        let mut seen = HashSet::new();
        for member in &members {
            if !seen.insert(member.id.as_str()) {
                return Err(ValidationError::DuplicateMember(member.id.clone()));
            }
        }
        Ok(Self { members })
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.iter().any(|member| member.id == id)
    }

    pub fn add(&mut self, member: Member) -> Result<(), ValidationError> {
        if self.contains(&member.id) {
            return Err(ValidationError::DuplicateMember(member.id));
        }
        self.members.push(member);
        Ok(())
    }

    pub fn remove(&mut self, id: &str) -> Result<Member, ValidationError> {
        let position = self
            .members
            .iter()
            .position(|member| member.id == id)
            .ok_or_else(|| ValidationError::UnknownMember(id.to_string()))?;
        if self.members.len() == 1 {
            return Err(ValidationError::LastMember);
        }
        Ok(self.members.remove(position))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub enum Category {
    #[default]
    Food,
    Transport,
    Shopping,
    Hotel,
    Ticket,
    Activity,
    Accommodation,
    Attraction,
    #[serde(other)]
    Other,
}

impl Category {
    pub const ALL: [Category; 9] = [
        Category::Food,
        Category::Transport,
        Category::Shopping,
        Category::Hotel,
        Category::Ticket,
        Category::Activity,
        Category::Accommodation,
        Category::Attraction,
        Category::Other,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Category::Food => "Food",
            Category::Transport => "Transport",
            Category::Shopping => "Shopping",
            Category::Hotel => "Hotel",
            Category::Ticket => "Ticket",
            Category::Activity => "Activity",
            Category::Accommodation => "Accommodation",
            Category::Attraction => "Attraction",
            Category::Other => "Other",
        }
    }
}

/// Strict parsing, case-insensitive. Unlike deserialization of stored data,
/// an unknown name is an error rather than [`Category::Other`].
impl FromStr for Category {
    type Err = ValidationError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|category| category.name().eq_ignore_ascii_case(name.trim()))
            .ok_or_else(|| ValidationError::UnknownCategory(name.to_string()))
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Expense {
    pub id: ExpenseId,
    pub amount: f64,
    pub currency: String,
    #[serde(default)]
    pub category: Category,
    pub payer_id: MemberId,
    pub split_with: Vec<MemberId>,
    pub date: NaiveDate,
    #[serde(default)]
    pub note: String,
    #[serde(default)]
    pub added_by: MemberId,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Expense {
    /// Checks a stored expense. Unlike a draft, its members are not checked
    /// against the roster.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.amount.is_finite() || self.amount <= 0.0 {
            return Err(ValidationError::InvalidAmount(self.amount));
        }
        if self.currency.trim().is_empty() {
            return Err(ValidationError::EmptyCurrency);
        }
        if self.split_with.is_empty() {
            return Err(ValidationError::EmptySplit);
        }
        let mut seen = HashSet::new();
        for member in &self.split_with {
            if !seen.insert(member.as_str()) {
                return Err(ValidationError::DuplicateSplitMember(member.clone()));
            }
        }
        Ok(())
    }
}

/// An expense as entered by a user, before the ledger assigns its identity.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpenseDraft {
    /// `None` for a new expense, the existing id when editing.
    #[serde(default)]
    pub id: Option<ExpenseId>,
    pub amount: f64,
    pub currency: String,
    #[serde(default)]
    pub category: Category,
    pub payer_id: MemberId,
    pub split_with: Vec<MemberId>,
    pub date: NaiveDate,
    #[serde(default)]
    pub note: String,
    #[serde(default)]
    pub added_by: MemberId,
}

impl ExpenseDraft {
    pub fn validate(&self, roster: &Roster) -> Result<(), ValidationError> {
        if !self.amount.is_finite() || self.amount <= 0.0 {
            return Err(ValidationError::InvalidAmount(self.amount));
        }
        if self.currency.trim().is_empty() {
            return Err(ValidationError::EmptyCurrency);
        }
        if self.split_with.is_empty() {
            return Err(ValidationError::EmptySplit);
        }
        if !roster.contains(&self.payer_id) {
            return Err(ValidationError::UnknownMember(self.payer_id.clone()));
        }
        let mut seen = HashSet::new();
        for member in &self.split_with {
            if !seen.insert(member.as_str()) {
                return Err(ValidationError::DuplicateSplitMember(member.clone()));
            }
            if !roster.contains(member) {
                return Err(ValidationError::UnknownMember(member.clone()));
            }
        }
        Ok(())
    }

    /// Builds the stored expense. `existing` is the stored version when editing,
    /// whose creation time is kept.
    pub fn into_expense(
        self,
        roster: &Roster,
        existing: Option<&Expense>,
        now: DateTime<Utc>,
    ) -> Result<Expense, ValidationError> {
        self.validate(roster)?;
        let (id, created_at, updated_at) = match (self.id, existing) {
            (Some(id), Some(existing)) => (id, existing.created_at, Some(now)),
            (Some(id), None) => return Err(ValidationError::UnknownExpense(id)),
            (None, _) => (Uuid::new_v4().to_string(), now, None),
        };
        Ok(Expense {
            id,
            amount: self.amount,
            currency: self.currency.trim().to_ascii_uppercase(),
            category: self.category,
            payer_id: self.payer_id,
            split_with: self.split_with,
            date: self.date,
            note: self.note,
            added_by: self.added_by,
            created_at,
            updated_at,
        })
    }
}

/// A real-world payment recorded against the netted debt.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct ArchivedSettlement {
    pub id: SettlementId,
    pub from: MemberId,
    pub to: MemberId,
    pub amount: f64,
    pub date: DateTime<Utc>,
}

impl ArchivedSettlement {
    /// Creates a record with a fresh id. Keep the returned value around and
    /// resubmit it as is when a write has to be retried.
    pub fn new(
        from: MemberId,
        to: MemberId,
        amount: f64,
        date: DateTime<Utc>,
    ) -> Result<Self, ValidationError> {
        let settlement = Self {
            id: Uuid::new_v4().to_string(),
            from,
            to,
            amount,
            date,
        };
        settlement.validate()?;
        Ok(settlement)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.amount.is_finite() || self.amount <= 0.0 {
            return Err(ValidationError::InvalidAmount(self.amount));
        }
        if self.from == self.to {
            return Err(ValidationError::SelfSettlement);
        }
        Ok(())
    }
}

/// Per (expense, member) clearance flags, keyed `"<expenseId>-<memberId>"`.
///
/// The key shape is shared with historical data and must not change.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(transparent)]
pub struct ClearedSplits(BTreeMap<String, bool>);

impl ClearedSplits {
    pub fn key(expense_id: &str, member_id: &str) -> String {
        format!("{expense_id}-{member_id}")
    }

    pub fn is_cleared(&self, expense_id: &str, member_id: &str) -> bool {
        self.0
            .get(&Self::key(expense_id, member_id))
            .copied()
            .unwrap_or(false)
    }

    pub fn set(&mut self, expense_id: &str, member_id: &str, cleared: bool) {
        self.0.insert(Self::key(expense_id, member_id), cleared);
    }

    /// Copies every flag of `other` over this map, leaving the other keys alone.
    pub fn extend(&mut self, other: ClearedSplits) {
        self.0.extend(other.0);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &bool)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, bool)> for ClearedSplits {
    fn from_iter<T: IntoIterator<Item = (String, bool)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Value of each currency in the common currency.
///
/// Rates come from outside (manual entry or a periodic refresh). A currency
/// missing from the table converts 1:1.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrencyRateTable {
    common: String,
    rates: HashMap<String, f64>,
}

impl CurrencyRateTable {
    pub fn new(common: &str) -> Result<Self, ValidationError> {
        let common = normalize_code(common)?;
        Ok(Self {
            rates: HashMap::from([(common.clone(), 1.0)]),
            common,
        })
    }

    pub fn with_rates(
        common: &str,
        rates: impl IntoIterator<Item = (String, f64)>,
    ) -> Result<Self, ValidationError> {
        let mut table = Self::new(common)?;
        for (code, rate) in rates {
            if normalize_code(&code)? == table.common {
                continue;
            }
            table.set_rate(&code, rate)?;
        }
        Ok(table)
    }

    pub fn common(&self) -> &str {
        &self.common
    }

    pub fn rates(&self) -> &HashMap<String, f64> {
        &self.rates
    }

    pub fn rate(&self, code: &str) -> f64 {
        if code.eq_ignore_ascii_case(&self.common) {
            return 1.0;
        }
        self.rates
            .get(code)
            .or_else(|| self.rates.get(&code.to_ascii_uppercase()))
            .copied()
            .unwrap_or(1.0)
    }

    /// Converts `amount` of `code` into the common currency.
    pub fn convert(&self, amount: f64, code: &str) -> f64 {
        amount * self.rate(code)
    }

    /// Converts `amount` of the common currency into `code`.
    pub fn convert_back(&self, amount: f64, code: &str) -> f64 {
        amount / self.rate(code)
    }

    pub fn set_rate(&mut self, code: &str, rate: f64) -> Result<(), ValidationError> {
        let code = normalize_code(code)?;
        if code == self.common {
            return Err(ValidationError::CommonCurrency(code));
        }
        if !rate.is_finite() || rate <= 0.0 {
            return Err(ValidationError::InvalidRate { code, rate });
        }
        self.rates.insert(code, rate);
        Ok(())
    }

    pub fn remove_rate(&mut self, code: &str) -> Result<Option<f64>, ValidationError> {
        let code = normalize_code(code)?;
        if code == self.common {
            return Err(ValidationError::CommonCurrency(code));
        }
        Ok(self.rates.remove(&code))
    }
}

fn normalize_code(code: &str) -> Result<String, ValidationError> {
    let code = code.trim().to_ascii_uppercase();
    if code.is_empty() {
        return Err(ValidationError::EmptyCurrency);
    }
    Ok(code)
}

/// The local, rebuildable projection of the shared trip fields.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerModel {
    pub expenses: Vec<Expense>,
    pub archived_settlements: Vec<ArchivedSettlement>,
    pub cleared_splits: ClearedSplits,
}

impl LedgerModel {
    pub fn expense(&self, id: &str) -> Option<&Expense> {
        self.expenses.iter().find(|expense| expense.id == id)
    }

    pub fn archived_settlement(&self, id: &str) -> Option<&ArchivedSettlement> {
        self.archived_settlements
            .iter()
            .find(|settlement| settlement.id == id)
    }
}
