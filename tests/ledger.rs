use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use tripsplit::store::FieldStream;
use tripsplit::{
    Category, CurrencyRateTable, Expense, ExpenseDraft, Field, FieldStore, FieldValue, Ledger,
    LedgerError, Member, MemoryFieldStore, Roster, SettlementPlan, StoreError, Subscription,
    ValidationError, WriteMode,
};

fn member(id: &str) -> Member {
    Member {
        id: id.to_string(),
        name: format!("Member {id}"),
        avatar: String::new(),
    }
}

fn roster(ids: &[&str]) -> Roster {
    Roster::new(ids.iter().map(|id| member(id)).collect()).unwrap()
}

fn rates() -> CurrencyRateTable {
    CurrencyRateTable::with_rates("TWD", [("EUR".to_string(), 35.0)]).unwrap()
}

fn draft(amount: f64, currency: &str, payer: &str, split: &[&str]) -> ExpenseDraft {
    ExpenseDraft {
        id: None,
        amount,
        currency: currency.to_string(),
        category: Category::Food,
        payer_id: payer.to_string(),
        split_with: split.iter().map(|id| id.to_string()).collect(),
        date: NaiveDate::from_ymd_opt(2025, 1, 10).unwrap(),
        note: String::new(),
        added_by: payer.to_string(),
    }
}

async fn synced_ledger(store: &MemoryFieldStore, ids: &[&str]) -> (Ledger, Vec<Subscription>) {
    let ledger = Ledger::new(Arc::new(store.clone()), roster(ids), rates());
    let subscriptions = ledger.sync_all().await.unwrap();
    (ledger, subscriptions)
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn balance(ledger: &Ledger, member: &str) -> f64 {
    ledger.get_balances().get(member).unwrap()
}

#[tokio::test]
async fn two_members_even_split() {
    let store = MemoryFieldStore::new();
    let (ledger, _subscriptions) = synced_ledger(&store, &["1", "2"]).await;

    ledger
        .save_expense(draft(100.0, "TWD", "1", &["1", "2"]))
        .unwrap()
        .await
        .unwrap();

    assert_eq!(balance(&ledger, "1"), 50.0);
    assert_eq!(balance(&ledger, "2"), -50.0);
    assert_eq!(
        ledger.get_settlement_plans(),
        vec![SettlementPlan {
            from: "2".to_string(),
            to: "1".to_string(),
            amount: 50.0,
        }]
    );
    assert_eq!(ledger.get_total_in_common_currency(), 100.0);
}

#[tokio::test]
async fn three_members_plan_moves_half_the_absolute_balances() {
    let store = MemoryFieldStore::new();
    let (ledger, _subscriptions) = synced_ledger(&store, &["1", "2", "3"]).await;

    ledger
        .save_expense(draft(90.0, "TWD", "1", &["1", "2", "3"]))
        .unwrap()
        .await
        .unwrap();
    ledger
        .save_expense(draft(60.0, "TWD", "2", &["1", "2", "3"]))
        .unwrap()
        .await
        .unwrap();

    let balances = ledger.get_balances();
    assert_eq!(balances.get("1"), Some(40.0));
    assert_eq!(balances.get("2"), Some(10.0));
    assert_eq!(balances.get("3"), Some(-50.0));
    assert!(balances.total().abs() < 1e-9);

    let plans = ledger.get_settlement_plans();
    let transferred: f64 = plans.iter().map(|plan| plan.amount).sum();
    let absolute: f64 = balances.iter().map(|entry| entry.balance.abs()).sum();
    assert!((transferred - absolute / 2.0).abs() < 1e-9);
    assert_eq!(plans.len(), 2);
    assert!(plans.iter().all(|plan| plan.from == "3"));
}

#[tokio::test]
async fn unknown_currency_converts_one_to_one() {
    let store = MemoryFieldStore::new();
    let (ledger, _subscriptions) = synced_ledger(&store, &["1", "2"]).await;

    ledger
        .save_expense(draft(100.0, "usd", "1", &["1", "2"]))
        .unwrap()
        .await
        .unwrap();
    ledger
        .save_expense(draft(10.0, "EUR", "2", &["1", "2"]))
        .unwrap()
        .await
        .unwrap();

    assert_eq!(ledger.expenses().iter().filter(|e| e.currency == "USD").count(), 1);
    assert_eq!(balance(&ledger, "1"), 50.0 - 175.0);
    assert_eq!(balance(&ledger, "2"), 175.0 - 50.0);
}

#[tokio::test]
async fn archiving_and_unarchiving_a_settlement() {
    let store = MemoryFieldStore::new();
    let (ledger, _subscriptions) = synced_ledger(&store, &["1", "2", "3"]).await;
    ledger
        .save_expense(draft(90.0, "TWD", "1", &["1", "2", "3"]))
        .unwrap()
        .await
        .unwrap();
    let before = ledger.get_balances();

    let plans = ledger.get_settlement_plans();
    let (settlement, pending) = ledger.archive_plan(&plans[0]).unwrap();
    pending.await.unwrap();

    let after = ledger.get_balances();
    let debtor = &plans[0].from;
    assert_eq!(after.get(debtor).unwrap(), before.get(debtor).unwrap() + plans[0].amount);
    assert_eq!(after.get("1").unwrap(), before.get("1").unwrap() - plans[0].amount);
    assert_eq!(ledger.get_settlement_plans().len(), plans.len() - 1);

    assert!(matches!(
        ledger.unarchive_settlement(&settlement.id, false),
        Err(LedgerError::Validation(ValidationError::NotConfirmed))
    ));
    ledger
        .unarchive_settlement(&settlement.id, true)
        .unwrap()
        .await
        .unwrap();
    assert_eq!(ledger.get_balances(), before);
    assert!(ledger.archived_settlements().is_empty());
}

#[tokio::test]
async fn archive_retry_is_idempotent() {
    let store = MemoryFieldStore::new();
    let (ledger, _subscriptions) = synced_ledger(&store, &["1", "2"]).await;
    ledger
        .save_expense(draft(100.0, "TWD", "1", &["1", "2"]))
        .unwrap()
        .await
        .unwrap();

    let plan = ledger.get_settlement_plans().remove(0);
    let (settlement, pending) = ledger.archive_plan(&plan).unwrap();
    pending.await.unwrap();
    ledger
        .archive_settlement(settlement.clone())
        .unwrap()
        .await
        .unwrap();

    assert_eq!(ledger.archived_settlements(), vec![settlement]);
    assert_eq!(balance(&ledger, "1"), 0.0);
    assert_eq!(balance(&ledger, "2"), 0.0);
    assert!(ledger.get_settlement_plans().is_empty());
}

#[tokio::test]
async fn cleared_split_is_excluded_until_toggled_back() {
    let store = MemoryFieldStore::new();
    let (ledger, _subscriptions) = synced_ledger(&store, &["1", "2", "3"]).await;
    ledger
        .save_expense(draft(90.0, "TWD", "1", &["1", "2", "3"]))
        .unwrap()
        .await
        .unwrap();
    let expense_id = ledger.expenses()[0].id.clone();
    let before = ledger.get_balances();

    ledger
        .toggle_cleared_split(&expense_id, "3")
        .unwrap()
        .await
        .unwrap();
    assert!(ledger.cleared_splits().is_cleared(&expense_id, "3"));
    assert_eq!(balance(&ledger, "1"), 30.0);
    assert_eq!(balance(&ledger, "3"), 0.0);
    let shares = ledger.get_expense_shares(&expense_id).unwrap();
    assert!(shares.iter().any(|share| share.member_id == "3" && share.cleared));

    ledger
        .toggle_cleared_split(&expense_id, "3")
        .unwrap()
        .await
        .unwrap();
    assert_eq!(ledger.get_balances(), before);

    assert!(matches!(
        ledger.toggle_cleared_split("missing", "3"),
        Err(LedgerError::Validation(ValidationError::UnknownExpense(_)))
    ));
    ledger.remove_member("3").unwrap();
    ledger.add_member(member("4")).unwrap();
    assert!(matches!(
        ledger.toggle_cleared_split(&expense_id, "4"),
        Err(LedgerError::Validation(ValidationError::NotInSplit { .. }))
    ));
}

#[tokio::test]
async fn invalid_expenses_write_nothing() {
    let store = MemoryFieldStore::new();
    let (ledger, _subscriptions) = synced_ledger(&store, &["1", "2"]).await;

    assert!(matches!(
        ledger.save_expense(draft(0.0, "TWD", "1", &["1", "2"])),
        Err(LedgerError::Validation(ValidationError::InvalidAmount(_)))
    ));
    assert!(matches!(
        ledger.save_expense(draft(10.0, "TWD", "1", &[])),
        Err(LedgerError::Validation(ValidationError::EmptySplit))
    ));
    assert!(matches!(
        ledger.save_expense(draft(10.0, "TWD", "9", &["1"])),
        Err(LedgerError::Validation(ValidationError::UnknownMember(_)))
    ));
    assert!(matches!(
        ledger.delete_expense("missing"),
        Err(LedgerError::Validation(ValidationError::UnknownExpense(_)))
    ));
    assert!(ledger.expenses().is_empty());
    assert_eq!(ledger.field_status(Field::Expenses).pending_writes, 0);
}

#[tokio::test]
async fn edits_and_deletes_need_a_synced_field() {
    let store = MemoryFieldStore::new();
    let ledger = Ledger::new(Arc::new(store.clone()), roster(&["1", "2"]), rates());

    assert!(matches!(
        ledger.delete_expense("any"),
        Err(LedgerError::NotSynced(Field::Expenses))
    ));
    let mut edit = draft(10.0, "TWD", "1", &["1", "2"]);
    edit.id = Some("any".to_string());
    assert!(matches!(
        ledger.save_expense(edit),
        Err(LedgerError::NotSynced(Field::Expenses))
    ));

    // Adding a new expense does not depend on what is already stored.
    ledger
        .save_expense(draft(10.0, "TWD", "1", &["1", "2"]))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(ledger.expenses().len(), 1);
}

#[tokio::test]
async fn editing_keeps_identity_and_creation_time() {
    let store = MemoryFieldStore::new();
    let (ledger, _subscriptions) = synced_ledger(&store, &["1", "2"]).await;
    ledger
        .save_expense(draft(10.0, "TWD", "1", &["1", "2"]))
        .unwrap()
        .await
        .unwrap();
    let original = ledger.expenses().remove(0);

    let mut edit = draft(20.0, "TWD", "2", &["1", "2"]);
    edit.id = Some(original.id.clone());
    ledger.save_expense(edit).unwrap().await.unwrap();

    let expenses = ledger.expenses();
    assert_eq!(expenses.len(), 1);
    assert_eq!(expenses[0].id, original.id);
    assert_eq!(expenses[0].created_at, original.created_at);
    assert!(expenses[0].updated_at.is_some());
    assert_eq!(balance(&ledger, "2"), 10.0);

    ledger.delete_expense(&original.id).unwrap().await.unwrap();
    assert!(ledger.expenses().is_empty());
    assert_eq!(balance(&ledger, "2"), 0.0);
}

#[tokio::test]
async fn failed_write_is_reported_and_kept_locally() {
    let store = MemoryFieldStore::new();
    let (ledger, _subscriptions) = synced_ledger(&store, &["1", "2"]).await;
    let mut failures = ledger.write_failures();

    store.fail_next_writes(1);
    let pending = ledger
        .save_expense(draft(100.0, "TWD", "1", &["1", "2"]))
        .unwrap();
    assert_eq!(balance(&ledger, "1"), 50.0);

    assert!(matches!(pending.await, Err(LedgerError::Store(_))));
    let failure = failures.recv().await.unwrap();
    assert_eq!(failure.field, Field::Expenses);
    assert!(ledger.field_status(Field::Expenses).last_failure.is_some());
    assert_eq!(ledger.expenses().len(), 1);

    ledger
        .save_expense(draft(20.0, "TWD", "2", &["1", "2"]))
        .unwrap()
        .await
        .unwrap();
    let status = ledger.field_status(Field::Expenses);
    assert!(status.last_failure.is_none());
    assert_eq!(status.pending_writes, 0);
}

#[tokio::test]
async fn subscribers_receive_full_collections() {
    let store = MemoryFieldStore::new();
    let ledger = Ledger::new(Arc::new(store.clone()), roster(&["1", "2"]), rates());
    let (sender, mut received) = tokio::sync::mpsc::unbounded_channel();
    let subscription = ledger
        .subscribe_expenses(move |expenses| {
            let _ = sender.send(expenses.len());
        })
        .await
        .unwrap();

    assert_eq!(received.recv().await, Some(0));
    ledger
        .save_expense(draft(10.0, "TWD", "1", &["1", "2"]))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(received.recv().await, Some(1));

    subscription.unsubscribe();
    ledger
        .save_expense(draft(10.0, "TWD", "2", &["1", "2"]))
        .unwrap()
        .await
        .unwrap();
    while let Ok(count) = received.try_recv() {
        assert_eq!(count, 1);
    }
}

#[tokio::test]
async fn clients_of_the_same_trip_converge() {
    let store = MemoryFieldStore::new();
    let (alice, _alice_subscriptions) = synced_ledger(&store, &["1", "2"]).await;
    let (bob, _bob_subscriptions) = synced_ledger(&store, &["1", "2"]).await;

    alice
        .save_expense(draft(100.0, "TWD", "1", &["1", "2"]))
        .unwrap()
        .await
        .unwrap();
    eventually(|| bob.expenses().len() == 1).await;
    let id = bob.expenses()[0].id.clone();

    // Concurrent edits of the same expense: the last write to reach the store wins.
    let mut from_alice = draft(100.0, "TWD", "1", &["1", "2"]);
    from_alice.id = Some(id.clone());
    from_alice.note = "alice".to_string();
    let mut from_bob = draft(100.0, "TWD", "1", &["1", "2"]);
    from_bob.id = Some(id.clone());
    from_bob.note = "bob".to_string();
    let (first, second) = tokio::join!(
        alice.save_expense(from_alice).unwrap(),
        bob.save_expense(from_bob).unwrap()
    );
    first.unwrap();
    second.unwrap();
    eventually(|| alice.expenses()[0].note == bob.expenses()[0].note).await;
    assert_eq!(alice.expenses().len(), 1);

    // Both settle the same debt: the second archive overshoots until one is removed.
    let plan = alice.get_settlement_plans().remove(0);
    let (first, first_write) = alice.archive_plan(&plan).unwrap();
    let (_second, second_write) = bob.archive_plan(&plan).unwrap();
    first_write.await.unwrap();
    second_write.await.unwrap();
    eventually(|| {
        alice.archived_settlements().len() == 2 && bob.archived_settlements().len() == 2
    })
    .await;
    assert_eq!(balance(&alice, "1"), -50.0);

    bob.unarchive_settlement(&first.id, true)
        .unwrap()
        .await
        .unwrap();
    eventually(|| alice.archived_settlements().len() == 1).await;
    assert_eq!(balance(&alice, "1"), 0.0);
    assert_eq!(balance(&bob, "2"), 0.0);
}

#[tokio::test]
async fn roster_and_rates_management() {
    let store = MemoryFieldStore::new();
    let (ledger, _subscriptions) = synced_ledger(&store, &["1"]).await;

    assert_eq!(ledger.remove_member("1"), Err(ValidationError::LastMember));
    assert_eq!(
        ledger.add_member(member("1")),
        Err(ValidationError::DuplicateMember("1".to_string()))
    );
    ledger.add_member(member("2")).unwrap();
    assert_eq!(ledger.remove_member("1").unwrap().id, "1");
    assert_eq!(ledger.roster().members().len(), 1);

    assert_eq!(
        ledger.set_rate("twd", 2.0),
        Err(ValidationError::CommonCurrency("TWD".to_string()))
    );
    ledger.set_rate("jpy", 0.25).unwrap();
    assert_eq!(ledger.rates().convert(100.0, "JPY"), 25.0);
    assert_eq!(ledger.remove_rate("JPY").unwrap(), Some(0.25));
    assert_eq!(ledger.rates().convert(100.0, "JPY"), 100.0);
}

/// Shares a memory store but takes a while to acknowledge writes.
struct SlowStore(MemoryFieldStore);

#[async_trait]
impl FieldStore for SlowStore {
    async fn get(&self, field: Field) -> Result<Option<FieldValue>, StoreError> {
        self.0.get(field).await
    }

    async fn set(&self, field: Field, value: FieldValue, mode: WriteMode) -> Result<(), StoreError> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.0.set(field, value, mode).await
    }

    async fn subscribe(&self, field: Field) -> Result<FieldStream, StoreError> {
        self.0.subscribe(field).await
    }
}

fn notes(expenses: &[Expense]) -> Vec<String> {
    let mut notes: Vec<String> = expenses.iter().map(|expense| expense.note.clone()).collect();
    notes.sort();
    notes
}

fn noted(note: &str) -> ExpenseDraft {
    let mut draft = draft(30.0, "TWD", "1", &["1", "2"]);
    draft.note = note.to_string();
    draft
}

#[tokio::test]
async fn pending_writes_survive_remote_updates() {
    let store = MemoryFieldStore::new();
    let alice = Ledger::new(Arc::new(SlowStore(store.clone())), roster(&["1", "2"]), rates());
    let _alice_subscriptions = alice.sync_all().await.unwrap();
    let (bob, _bob_subscriptions) = synced_ledger(&store, &["1", "2"]).await;

    bob.save_expense(noted("dinner")).unwrap().await.unwrap();
    eventually(|| alice.expenses().len() == 1).await;
    let dinner = alice.expenses()[0].id.clone();

    // Bob's taxi reaches the store while Alice's hotel is still in flight.
    let hotel = alice.save_expense(noted("hotel")).unwrap();
    bob.save_expense(noted("taxi")).unwrap().await.unwrap();
    eventually(|| notes(&alice.expenses()).contains(&"taxi".to_string())).await;
    assert_eq!(notes(&alice.expenses()), ["dinner", "hotel", "taxi"]);

    let delete = alice.delete_expense(&dinner).unwrap();
    hotel.await.unwrap();
    delete.await.unwrap();

    let Some(FieldValue::Expenses(stored)) = store.get(Field::Expenses).await.unwrap() else {
        panic!("expenses were never stored");
    };
    assert_eq!(notes(&stored), ["hotel", "taxi"]);
    eventually(|| notes(&bob.expenses()) == ["hotel", "taxi"]).await;
    assert_eq!(notes(&alice.expenses()), ["hotel", "taxi"]);
}

#[tokio::test]
async fn settlement_tolerance_must_be_positive() {
    let store = MemoryFieldStore::new();
    let ledger = || Ledger::new(Arc::new(store.clone()), roster(&["1", "2"]), rates());

    for epsilon in [0.0, -0.5, f64::NAN, f64::INFINITY] {
        assert!(matches!(
            ledger().with_epsilon(epsilon),
            Err(ValidationError::InvalidEpsilon(_))
        ));
    }
    assert!(ledger().with_epsilon(0.01).is_ok());
}
