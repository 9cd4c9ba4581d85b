//! Keeps the local [`LedgerModel`] in step with the field store.
//!
//! Every subscribed field goes `Uninitialized → Synced` on its first
//! notification and stays `Synced` while somebody listens. All listeners of a
//! field share one store subscription; when the last one leaves, the
//! subscription is dropped and the field is `Uninitialized` again.
//!
//! Writes are optimistic. The local model changes and listeners are notified
//! right away; the store write runs afterwards on a writer task that keeps the
//! order in which writes were issued. Its outcome is reported through
//! [`PendingWrite`], [`SyncCoordinator::write_failures`] and the field status.
//! A failed write is never rolled back locally.
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::StreamExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::error::{LedgerError, ResultLedger, StoreError};
use crate::schemas::LedgerModel;
use crate::store::{Field, FieldStore, FieldStream, FieldValue, WriteMode};

pub type Listener = Arc<dyn Fn(&FieldValue) + Send + Sync>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub enum SyncState {
    #[default]
    Uninitialized,
    Synced,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldStatus {
    pub state: SyncState,
    /// Writes applied locally whose store outcome is still unknown.
    pub pending_writes: usize,
    /// The last failed write, cleared by the next successful one.
    pub last_failure: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct WriteFailure {
    pub field: Field,
    pub reason: String,
}

struct ListenerEntry {
    active: AtomicBool,
    callback: Listener,
}

#[derive(Default)]
struct FieldSync {
    state: SyncState,
    listeners: BTreeMap<u64, Arc<ListenerEntry>>,
    pump: Option<JoinHandle<()>>,
    starting: bool,
    /// Bumped whenever the pump changes, so a stale pump can't deliver.
    generation: u64,
    pending_writes: usize,
    /// Writes sent to the writer task and not settled yet, in issue order.
    /// They are replayed over every store notification until settled.
    unacked: VecDeque<(FieldValue, WriteMode)>,
    last_failure: Option<String>,
}

impl FieldSync {
    fn active_listeners(&self) -> Vec<Arc<ListenerEntry>> {
        self.listeners.values().cloned().collect()
    }
}

#[derive(Default)]
struct Inner {
    model: LedgerModel,
    fields: HashMap<Field, FieldSync>,
    next_listener: u64,
}

struct WriteRequest {
    field: Field,
    value: FieldValue,
    mode: WriteMode,
    done: oneshot::Sender<Result<(), StoreError>>,
}

#[derive(Clone)]
pub struct SyncCoordinator {
    store: Arc<dyn FieldStore>,
    inner: Arc<Mutex<Inner>>,
    writes: mpsc::UnboundedSender<WriteRequest>,
    failures: broadcast::Sender<WriteFailure>,
    revision: Arc<watch::Sender<u64>>,
}

impl SyncCoordinator {
    /// Creates a coordinator and its writer task. Must be called from within a
    /// tokio runtime.
    pub fn new(store: Arc<dyn FieldStore>) -> Self {
        let inner = Arc::new(Mutex::new(Inner::default()));
        let (writes, queue) = mpsc::unbounded_channel();
        let (failures, _) = broadcast::channel(64);
        tokio::spawn(run_writer(
            store.clone(),
            inner.clone(),
            failures.clone(),
            queue,
        ));
        Self {
            store,
            inner,
            writes,
            failures,
            revision: Arc::new(watch::Sender::new(0)),
        }
    }

    /// Registers `callback` for every change of `field`.
    ///
    /// The first listener of a field opens the store subscription; the callback
    /// then receives the store's current value as the first notification. A
    /// listener joining an already synced field receives the local value
    /// immediately.
    pub async fn subscribe(&self, field: Field, callback: Listener) -> ResultLedger<Subscription> {
        let entry = Arc::new(ListenerEntry {
            active: AtomicBool::new(true),
            callback,
        });

        let (id, needs_pump, initial) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let id = inner.next_listener;
            inner.next_listener += 1;
            let sync = inner.fields.entry(field).or_default();
            sync.listeners.insert(id, entry.clone());
            let needs_pump = sync.pump.is_none() && !sync.starting;
            if needs_pump {
                sync.starting = true;
            }
            let initial = (sync.state == SyncState::Synced)
                .then(|| field_value(&inner.model, field));
            (id, needs_pump, initial)
        };
        // Declared before the subscription so that, if this future is dropped
        // while opening, the listener is gone by the time the guard runs.
        let mut opening = needs_pump.then(|| Opening {
            coordinator: self.clone(),
            field,
            finished: false,
        });
        let subscription = Subscription {
            coordinator: self.clone(),
            field,
            id,
            active: true,
        };

        if let Some(opening) = opening.as_mut() {
            let opened = self.open_field(field).await;
            opening.finished = true;
            if let Err(err) = opened {
                // Dropping the subscription removes the listener again.
                drop(subscription);
                return Err(err.into());
            }
        }

        if let Some(value) = initial {
            if entry.active.load(Ordering::SeqCst) {
                (entry.callback)(&value);
            }
        }
        Ok(subscription)
    }

    /// Opens the store subscription of `field` and spawns its pump. Clears the
    /// `starting` mark whatever the outcome.
    async fn open_field(&self, field: Field) -> Result<(), StoreError> {
        let stream = match self.store.subscribe(field).await {
            Ok(stream) => stream,
            Err(err) => {
                self.inner
                    .lock()
                    .fields
                    .entry(field)
                    .or_default()
                    .starting = false;
                return Err(err);
            }
        };
        let mut inner = self.inner.lock();
        let sync = inner.fields.entry(field).or_default();
        sync.starting = false;
        if sync.listeners.is_empty() {
            return Ok(());
        }
        sync.generation += 1;
        let pump = tokio::spawn(self.clone().pump(field, sync.generation, stream));
        sync.pump = Some(pump);
        tracing::debug!(%field, "field subscription opened");
        Ok(())
    }

    fn unsubscribe(&self, field: Field, id: u64) {
        let mut inner = self.inner.lock();
        let Some(sync) = inner.fields.get_mut(&field) else {
            return;
        };
        if let Some(entry) = sync.listeners.remove(&id) {
            entry.active.store(false, Ordering::SeqCst);
        }
        if sync.listeners.is_empty() {
            if let Some(pump) = sync.pump.take() {
                pump.abort();
                tracing::debug!(%field, "field subscription closed");
            }
            sync.generation += 1;
            sync.state = SyncState::Uninitialized;
        }
    }

    async fn pump(self, field: Field, generation: u64, mut stream: FieldStream) {
        while let Some(value) = stream.next().await {
            self.deliver(field, generation, value);
        }
        tracing::debug!(%field, "field stream ended");
    }

    fn deliver(&self, field: Field, generation: u64, value: Option<FieldValue>) {
        let value = match value {
            Some(value) => match value.ensure_field(field) {
                Ok(()) => value,
                Err(err) => {
                    tracing::warn!(%field, "ignoring notification: {err}");
                    return;
                }
            },
            None => FieldValue::empty(field),
        };
        let value = value.without_invalid_records();

        let (payload, listeners) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let Some(sync) = inner.fields.get_mut(&field) else {
                return;
            };
            if sync.generation != generation {
                return;
            }
            if sync.state == SyncState::Uninitialized {
                tracing::debug!(%field, "field synced");
            }
            sync.state = SyncState::Synced;
            let listeners = sync.active_listeners();
            let mut value = value;
            for (write, mode) in &sync.unacked {
                match write.clone().written_over(Some(value.clone()), *mode) {
                    Ok(replayed) => value = replayed,
                    Err(err) => tracing::warn!(%field, "can't replay pending write: {err}"),
                }
            }
            replace_field(&mut inner.model, value);
            (field_value(&inner.model, field), listeners)
        };
        self.revision.send_modify(|revision| *revision += 1);
        notify(&listeners, &payload);
    }

    /// Applies a write computed from the current local model, then queues it
    /// for the store.
    ///
    /// With `requires_sync`, the write is refused while `field` has not been
    /// synchronized, since the local value could be stale or empty.
    pub fn write_with<F>(
        &self,
        field: Field,
        mode: WriteMode,
        requires_sync: bool,
        compute: F,
    ) -> ResultLedger<PendingWrite>
    where
        F: FnOnce(&LedgerModel) -> ResultLedger<FieldValue>,
    {
        let (outcome, payload, listeners) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let sync = inner.fields.entry(field).or_default();
            if requires_sync && sync.state != SyncState::Synced {
                return Err(LedgerError::NotSynced(field));
            }
            let value = compute(&inner.model)?;
            value.ensure_field(field)?;
            let written = value
                .clone()
                .written_over(Some(field_value(&inner.model, field)), mode)?;

            // Queued under the lock so the writer settles writes in the order
            // they enter `unacked`.
            let (done, outcome) = oneshot::channel();
            let request = WriteRequest {
                field,
                value: value.clone(),
                mode,
                done,
            };
            if self.writes.send(request).is_err() {
                return Err(LedgerError::WriteAborted(field));
            }
            replace_field(&mut inner.model, written);
            sync.pending_writes += 1;
            sync.unacked.push_back((value, mode));
            let listeners = sync.active_listeners();
            (outcome, field_value(&inner.model, field), listeners)
        };
        notify(&listeners, &payload);
        Ok(PendingWrite { field, outcome })
    }

    pub fn write(&self, field: Field, value: FieldValue, mode: WriteMode) -> ResultLedger<PendingWrite> {
        self.write_with(field, mode, false, |_| Ok(value))
    }

    /// Waits until `field` received its first notification.
    pub async fn until_synced(&self, field: Field) -> ResultLedger<()> {
        let mut revision = self.revision.subscribe();
        loop {
            if self.state(field) == SyncState::Synced {
                return Ok(());
            }
            if revision.changed().await.is_err() {
                return Err(LedgerError::NotSynced(field));
            }
        }
    }

    pub fn require_synced(&self, field: Field) -> ResultLedger<()> {
        match self.state(field) {
            SyncState::Synced => Ok(()),
            SyncState::Uninitialized => Err(LedgerError::NotSynced(field)),
        }
    }

    pub fn state(&self, field: Field) -> SyncState {
        self.inner
            .lock()
            .fields
            .get(&field)
            .map(|sync| sync.state)
            .unwrap_or_default()
    }

    pub fn status(&self, field: Field) -> FieldStatus {
        let inner = self.inner.lock();
        match inner.fields.get(&field) {
            Some(sync) => FieldStatus {
                state: sync.state,
                pending_writes: sync.pending_writes,
                last_failure: sync.last_failure.clone(),
            },
            None => FieldStatus {
                state: SyncState::Uninitialized,
                pending_writes: 0,
                last_failure: None,
            },
        }
    }

    /// Reads the local model without copying it.
    pub fn read<R>(&self, read: impl FnOnce(&LedgerModel) -> R) -> R {
        read(&self.inner.lock().model)
    }

    pub fn snapshot(&self) -> LedgerModel {
        self.read(LedgerModel::clone)
    }

    /// Every failed store write from now on.
    pub fn write_failures(&self) -> broadcast::Receiver<WriteFailure> {
        self.failures.subscribe()
    }
}

/// Handle of a registered listener. Dropping it unsubscribes.
pub struct Subscription {
    coordinator: SyncCoordinator,
    field: Field,
    id: u64,
    active: bool,
}

impl Subscription {
    pub fn field(&self) -> Field {
        self.field
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.active {
            self.active = false;
            self.coordinator.unsubscribe(self.field, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

/// Store outcome of a write that was already applied locally.
///
/// Awaiting it is optional; dropping it does not cancel the write.
#[must_use = "dropping a pending write hides its failure from the caller"]
pub struct PendingWrite {
    field: Field,
    outcome: oneshot::Receiver<Result<(), StoreError>>,
}

impl PendingWrite {
    pub fn field(&self) -> Field {
        self.field
    }
}

impl Future for PendingWrite {
    type Output = ResultLedger<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let field = self.field;
        Pin::new(&mut self.outcome).poll(cx).map(|outcome| match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(LedgerError::Store(err)),
            Err(_) => Err(LedgerError::WriteAborted(field)),
        })
    }
}

/// Pending opening of a field's store subscription.
///
/// If the opening future is dropped before it finishes, clears the `starting`
/// mark, and reopens in the background when other listeners are waiting.
struct Opening {
    coordinator: SyncCoordinator,
    field: Field,
    finished: bool,
}

impl Drop for Opening {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let field = self.field;
        let reopen = {
            let mut inner = self.coordinator.inner.lock();
            let sync = inner.fields.entry(field).or_default();
            sync.starting = !sync.listeners.is_empty();
            sync.starting
        };
        if !reopen {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            self.coordinator.inner.lock().fields.entry(field).or_default().starting = false;
            return;
        };
        let coordinator = self.coordinator.clone();
        runtime.spawn(async move {
            if let Err(err) = coordinator.open_field(field).await {
                tracing::warn!(%field, "can't open field subscription: {err}");
            }
        });
    }
}

async fn run_writer(
    store: Arc<dyn FieldStore>,
    inner: Arc<Mutex<Inner>>,
    failures: broadcast::Sender<WriteFailure>,
    mut queue: mpsc::UnboundedReceiver<WriteRequest>,
) {
    while let Some(request) = queue.recv().await {
        let outcome = store
            .set(request.field, request.value, request.mode)
            .await;
        let reason = outcome.as_ref().err().map(ToString::to_string);
        settle_write(&inner, &failures, request.field, reason.as_deref());
        // The caller may have dropped its handle.
        let _ = request.done.send(outcome);
    }
}

fn settle_write(
    inner: &Mutex<Inner>,
    failures: &broadcast::Sender<WriteFailure>,
    field: Field,
    failure: Option<&str>,
) {
    {
        let mut inner = inner.lock();
        let sync = inner.fields.entry(field).or_default();
        sync.pending_writes = sync.pending_writes.saturating_sub(1);
        sync.unacked.pop_front();
        sync.last_failure = failure.map(str::to_string);
    }
    if let Some(reason) = failure {
        tracing::warn!(%field, "write failed, local state is ahead of the store: {reason}");
        let _ = failures.send(WriteFailure {
            field,
            reason: reason.to_string(),
        });
    }
}

fn notify(listeners: &[Arc<ListenerEntry>], payload: &FieldValue) {
    for entry in listeners {
        if entry.active.load(Ordering::SeqCst) {
            (entry.callback)(payload);
        }
    }
}

fn field_value(model: &LedgerModel, field: Field) -> FieldValue {
    match field {
        Field::Expenses => FieldValue::Expenses(model.expenses.clone()),
        Field::ArchivedSettlements => {
            FieldValue::ArchivedSettlements(model.archived_settlements.clone())
        }
        Field::ClearedSplits => FieldValue::ClearedSplits(model.cleared_splits.clone()),
    }
}

fn replace_field(model: &mut LedgerModel, value: FieldValue) {
    match value {
        FieldValue::Expenses(expenses) => model.expenses = expenses,
        FieldValue::ArchivedSettlements(settlements) => model.archived_settlements = settlements,
        FieldValue::ClearedSplits(flags) => model.cleared_splits = flags,
    }
}
