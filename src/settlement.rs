use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::balance::Balances;
use crate::schemas::{CurrencyRateTable, LedgerModel, Member, MemberId};

/// Balances closer to zero than this are considered settled.
pub const DEFAULT_EPSILON: f64 = 0.5;

/// A suggested payment from a debtor to a creditor.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct SettlementPlan {
    pub from: MemberId,
    pub to: MemberId,
    pub amount: f64,
}

impl SettlementPlan {
    pub fn key(&self) -> String {
        format!("{}-{}", self.from, self.to)
    }
}

#[derive(Clone, Debug)]
struct PersonalBalance {
    id: MemberId,
    balance: f64,
}

/// Greedily nets the balances into payments, largest creditor against largest
/// debtor first.
///
/// Members are taken in balance order; equal balances keep their roster order.
/// The same balances always produce the same plan.
pub fn plan_settlements(balances: &Balances, epsilon: f64) -> Vec<SettlementPlan> {
    let mut creditors: Vec<PersonalBalance> = balances
        .iter()
        .filter(|entry| entry.balance > epsilon)
        .map(|entry| PersonalBalance {
            id: entry.member_id.clone(),
            balance: entry.balance,
        })
        .collect();
    let mut debtors: Vec<PersonalBalance> = balances
        .iter()
        .filter(|entry| entry.balance < -epsilon)
        .map(|entry| PersonalBalance {
            id: entry.member_id.clone(),
            balance: entry.balance,
        })
        .collect();
    creditors.sort_by(|a, b| b.balance.total_cmp(&a.balance));
    debtors.sort_by(|a, b| a.balance.total_cmp(&b.balance));

    let mut plans = Vec::new();
    let (mut c, mut d) = (0, 0);
    while c < creditors.len() && d < debtors.len() {
        let creditor = &mut creditors[c];
        let debtor = &mut debtors[d];
        let amount = creditor.balance.min(debtor.balance.abs());
        if amount <= 0.0 {
            // Only reachable with a non-positive tolerance.
            if creditor.balance <= 0.0 {
                c += 1;
            }
            if debtor.balance >= 0.0 {
                d += 1;
            }
            continue;
        }
        plans.push(SettlementPlan {
            from: debtor.id.clone(),
            to: creditor.id.clone(),
            amount,
        });
        creditor.balance -= amount;
        debtor.balance += amount;
        if creditor.balance <= epsilon {
            c += 1;
        }
        if debtor.balance.abs() <= epsilon {
            d += 1;
        }
    }
    plans
}

#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
struct MemberPair {
    first: MemberId,
    second: MemberId,
}

/// Who owes whom directly, without netting across the group.
///
/// Every share and archived payment is booked on the pair of members involved;
/// pairs whose debts cancel out (within `epsilon`) are left out. Sorted by
/// debtor, then creditor.
pub fn pairwise_debts(
    members: &[Member],
    ledger: &LedgerModel,
    rates: &CurrencyRateTable,
    epsilon: f64,
) -> Vec<SettlementPlan> {
    let known: HashSet<&str> = members.iter().map(|member| member.id.as_str()).collect();
    let mut balances_between_people: BTreeMap<MemberPair, f64> = BTreeMap::new();

    // `debtor` owes `amount` to `creditor`.
    let mut book = |creditor: &str, debtor: &str, amount: f64| {
        if !known.contains(creditor) || !known.contains(debtor) {
            return;
        }
        // Alphabetical order keeps both directions of a pair on the same entry;
        // a positive balance means `second` owes `first`.
        let (pair, amount) = if creditor <= debtor {
            (
                MemberPair {
                    first: creditor.to_string(),
                    second: debtor.to_string(),
                },
                amount,
            )
        } else {
            (
                MemberPair {
                    first: debtor.to_string(),
                    second: creditor.to_string(),
                },
                -amount,
            )
        };
        *balances_between_people.entry(pair).or_insert(0.0) += amount;
    };

    for expense in &ledger.expenses {
        if expense.split_with.is_empty() {
            continue;
        }
        let share =
            rates.convert(expense.amount, &expense.currency) / expense.split_with.len() as f64;
        for member in &expense.split_with {
            if *member != expense.payer_id && !ledger.cleared_splits.is_cleared(&expense.id, member)
            {
                book(&expense.payer_id, member, share);
            }
        }
    }
    for settlement in &ledger.archived_settlements {
        book(&settlement.from, &settlement.to, settlement.amount);
    }

    let mut debts: Vec<SettlementPlan> = balances_between_people
        .into_iter()
        .filter(|(_, balance)| balance.abs() >= epsilon)
        .map(|(pair, balance)| {
            if balance > 0.0 {
                SettlementPlan {
                    from: pair.second,
                    to: pair.first,
                    amount: balance,
                }
            } else {
                SettlementPlan {
                    from: pair.first,
                    to: pair.second,
                    amount: -balance,
                }
            }
        })
        .collect();
    debts.sort_by(|a, b| (&a.from, &a.to).cmp(&(&b.from, &b.to)));
    debts
}
