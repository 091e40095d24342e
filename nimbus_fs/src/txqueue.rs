//! Serialized access to a pool's row store.
//!
//! Every read or write of a pool goes through its [`TransactionQueue`]: a
//! bounded channel drained by one consumer task that runs queued units one
//! at a time, each inside its own `begin`/`commit`/`rollback` bracket.

use futures::FutureExt;
use futures::future::BoxFuture;
use nimbus_core::{Fields, Filter, Query, RowId, RowStore};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::FSResult;
use crate::error::FsError;
use crate::schema::Entity;

tokio::task_local! {
    /// Pool whose unit the current task is running, if any.
    static ACTIVE_POOL: u64;
}

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

const QUEUED: u8 = 0;
const RUNNING: u8 = 1;
const ABANDONED: u8 = 2;

type Hook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Hooks {
    on_success: Vec<Hook>,
    on_failure: Vec<Hook>,
}

/// A transaction granted to one unit. Cheap to clone; every clone talks to
/// the same open backend transaction.
#[derive(Clone)]
pub struct Txn {
    store: Arc<dyn RowStore>,
    hooks: Arc<Mutex<Hooks>>,
}

impl std::fmt::Debug for Txn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Txn").field("store", &self.store).finish()
    }
}

impl Txn {
    pub fn store(&self) -> &dyn RowStore {
        self.store.as_ref()
    }

    /// Registers `hook` to run after a successful commit.
    pub fn on_success(&self, hook: impl FnOnce() + Send + 'static) {
        if let Ok(mut hooks) = self.hooks.lock() {
            hooks.on_success.push(Box::new(hook));
        }
    }

    /// Registers `hook` to run after a rollback.
    pub fn on_failure(&self, hook: impl FnOnce() + Send + 'static) {
        if let Ok(mut hooks) = self.hooks.lock() {
            hooks.on_failure.push(Box::new(hook));
        }
    }

    pub(crate) async fn insert<E: Entity>(&self, entity: &E) -> FSResult<RowId> {
        Ok(self.store.insert(E::TABLE, entity.to_fields()).await?)
    }

    pub(crate) async fn update(&self, table: &str, id: RowId, fields: Fields) -> FSResult<()> {
        Ok(self.store.update(table, id, fields).await?)
    }

    pub(crate) async fn delete(&self, table: &str, filter: Filter) -> FSResult<u64> {
        Ok(self.store.delete(table, &filter).await?)
    }

    pub(crate) async fn get<E: Entity>(&self, id: RowId) -> FSResult<Option<E>> {
        match self.store.get(E::TABLE, id).await? {
            Some(record) => Ok(Some(E::from_record(&record)?)),
            None => Ok(None),
        }
    }

    pub(crate) async fn select<E: Entity>(&self, query: Query) -> FSResult<Vec<E>> {
        self.store
            .query(E::TABLE, &query)
            .await?
            .iter()
            .map(E::from_record)
            .collect()
    }

    pub(crate) async fn first<E: Entity>(&self, filter: Filter) -> FSResult<Option<E>> {
        Ok(self.select(Query::new(filter).limit(1)).await?.pop())
    }
}

/// Outcome of running a unit's body, before commit or rollback.
struct Finished {
    ok: bool,
    /// Hands the final outcome to whoever is waiting on the unit.
    deliver: Box<dyn FnOnce(FSResult<()>) + Send>,
}

/// A queued piece of work. Modelled on the actor's `Task`: a boxed trait
/// object owning its own responder.
trait Unit: Send {
    fn run(self: Box<Self>, txn: Txn) -> BoxFuture<'static, Finished>;

    /// Reports an error raised before the unit body could run.
    fn fail(self: Box<Self>, err: FsError);
}

struct FunctionUnit<F, T> {
    func: F,
    responder: oneshot::Sender<FSResult<T>>,
}

impl<F, Fut, T> Unit for FunctionUnit<F, T>
where
    F: FnOnce(Txn) -> Fut + Send + 'static,
    Fut: Future<Output = FSResult<T>> + Send + 'static,
    T: Send + 'static,
{
    fn run(self: Box<Self>, txn: Txn) -> BoxFuture<'static, Finished> {
        let FunctionUnit { func, responder } = *self;
        Box::pin(async move {
            let result = func(txn).await;
            Finished {
                ok: result.is_ok(),
                deliver: Box::new(move |outcome: FSResult<()>| {
                    // The caller may have given up waiting.
                    let _ = responder.send(outcome.and(result));
                }),
            }
        })
    }

    fn fail(self: Box<Self>, err: FsError) {
        let _ = self.responder.send(Err(err));
    }
}

struct QueuedUnit {
    unit: Box<dyn Unit>,
    cancel: CancellationToken,
    state: Arc<AtomicU8>,
}

enum QueueMessage {
    Unit(QueuedUnit),
    Shutdown { responder: oneshot::Sender<()> },
}

/// Handle to a pool's queue. Clones share the same consumer.
#[derive(Clone)]
pub struct TransactionQueue {
    sender: mpsc::Sender<QueueMessage>,
    pool_id: u64,
    store: Arc<dyn RowStore>,
}

impl std::fmt::Debug for TransactionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionQueue")
            .field("pool_id", &self.pool_id)
            .finish()
    }
}

impl TransactionQueue {
    /// Starts the consumer task for `store`. Must be called inside a tokio
    /// runtime.
    pub fn spawn(store: Arc<dyn RowStore>, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let pool_id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        let consumer = Consumer {
            store: store.clone(),
            receiver,
            pool_id,
        };
        tokio::spawn(consumer.run());
        Self {
            sender,
            pool_id,
            store,
        }
    }

    pub fn store(&self) -> &Arc<dyn RowStore> {
        &self.store
    }

    /// Whether the current task is already running a unit of this pool.
    fn in_unit(&self) -> bool {
        ACTIVE_POOL
            .try_with(|active| *active == self.pool_id)
            .unwrap_or(false)
    }

    /// Runs `func` as one transactional unit and returns its result.
    ///
    /// The unit commits if `func` returns `Ok` and rolls back otherwise.
    /// Cancelling `cancel` before the unit starts drops it untouched; while
    /// it runs, the unit is rolled back at its next suspension point. Either
    /// way the caller sees [`FsError::Cancelled`].
    pub async fn run<F, Fut, T>(&self, cancel: &CancellationToken, func: F) -> FSResult<T>
    where
        F: FnOnce(Txn) -> Fut + Send + 'static,
        Fut: Future<Output = FSResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        if self.in_unit() {
            return Err(FsError::NestedTransaction);
        }
        if cancel.is_cancelled() {
            return Err(FsError::Cancelled);
        }

        let (responder, receiver) = oneshot::channel();
        let state = Arc::new(AtomicU8::new(QUEUED));
        let queued = QueuedUnit {
            unit: Box::new(FunctionUnit { func, responder }),
            cancel: cancel.clone(),
            state: state.clone(),
        };
        self.sender
            .send(QueueMessage::Unit(queued))
            .await
            .map_err(|_| FsError::QueueClosed)?;

        // A responder dropped while the consumer still runs means the unit
        // body panicked.
        let closed = |cancel: &CancellationToken| {
            if cancel.is_cancelled() {
                FsError::Cancelled
            } else if self.sender.is_closed() {
                FsError::QueueClosed
            } else {
                FsError::UnitPanicked
            }
        };

        let mut receiver = receiver;
        tokio::select! {
            res = &mut receiver => return res.unwrap_or_else(|_| Err(closed(cancel))),
            _ = cancel.cancelled() => {}
        }

        // Still queued: withdraw it and return right away. Already running:
        // the consumer rolls it back, wait for that to finish.
        if state
            .compare_exchange(QUEUED, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return Err(FsError::Cancelled);
        }
        receiver.await.unwrap_or_else(|_| Err(FsError::Cancelled))
    }

    /// Stops the consumer once every unit queued before this call has run.
    pub async fn shutdown(&self) -> FSResult<()> {
        let (responder, receiver) = oneshot::channel();
        self.sender
            .send(QueueMessage::Shutdown { responder })
            .await
            .map_err(|_| FsError::QueueClosed)?;
        receiver.await.map_err(|_| FsError::QueueClosed)
    }
}

struct Consumer {
    store: Arc<dyn RowStore>,
    receiver: mpsc::Receiver<QueueMessage>,
    pool_id: u64,
}

impl Consumer {
    async fn run(mut self) {
        tracing::debug!(pool = self.pool_id, "transaction queue started");
        while let Some(msg) = self.receiver.recv().await {
            match msg {
                QueueMessage::Unit(queued) => self.execute(queued).await,
                QueueMessage::Shutdown { responder } => {
                    self.receiver.close();
                    // Units that raced in after the shutdown request are
                    // dropped; their callers observe a closed queue.
                    while self.receiver.try_recv().is_ok() {}
                    let _ = responder.send(());
                    break;
                }
            }
        }
        tracing::debug!(pool = self.pool_id, "transaction queue stopped");
    }

    async fn execute(&self, queued: QueuedUnit) {
        let QueuedUnit {
            unit,
            cancel,
            state,
        } = queued;

        if cancel.is_cancelled()
            || state
                .compare_exchange(QUEUED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            tracing::debug!(pool = self.pool_id, "skipping cancelled unit");
            return;
        }

        if let Err(err) = self.store.begin().await {
            tracing::error!(pool = self.pool_id, "begin failed: {err}");
            unit.fail(err.into());
            return;
        }

        let hooks = Arc::new(Mutex::new(Hooks::default()));
        let txn = Txn {
            store: self.store.clone(),
            hooks: hooks.clone(),
        };
        let body = AssertUnwindSafe(ACTIVE_POOL.scope(self.pool_id, unit.run(txn))).catch_unwind();

        let finished = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            finished = body => Some(finished),
        };

        let finished = match finished {
            Some(Ok(finished)) => Some(finished),
            Some(Err(panic)) => {
                // The responder went down with the body; the caller sees a
                // dropped channel.
                tracing::error!(
                    pool = self.pool_id,
                    "unit panicked: {}",
                    panic_message(panic.as_ref())
                );
                self.rollback().await;
                self.run_hooks(&hooks, false);
                return;
            }
            None => None,
        };

        match finished {
            Some(Finished { ok: true, deliver }) => match self.store.commit().await {
                Ok(()) => {
                    self.run_hooks(&hooks, true);
                    deliver(Ok(()));
                }
                Err(err) => {
                    tracing::warn!(pool = self.pool_id, "commit failed: {err}");
                    // A failed commit may or may not have closed the transaction.
                    let _ = self.store.rollback().await;
                    self.run_hooks(&hooks, false);
                    deliver(Err(err.into()));
                }
            },
            Some(Finished { ok: false, deliver }) => {
                self.rollback().await;
                self.run_hooks(&hooks, false);
                deliver(Ok(()));
            }
            None => {
                // The unit future was dropped with its responder inside.
                tracing::debug!(pool = self.pool_id, "unit cancelled while running");
                self.rollback().await;
                self.run_hooks(&hooks, false);
            }
        }
    }

    async fn rollback(&self) {
        if let Err(err) = self.store.rollback().await {
            tracing::error!(pool = self.pool_id, "rollback failed: {err}");
        } else {
            tracing::debug!(pool = self.pool_id, "unit rolled back");
        }
    }

    /// Runs hooks newest first.
    fn run_hooks(&self, hooks: &Mutex<Hooks>, committed: bool) {
        let pending = match hooks.lock() {
            Ok(mut hooks) => std::mem::take(&mut *hooks),
            Err(_) => {
                tracing::error!(pool = self.pool_id, "hook registry poisoned");
                return;
            }
        };
        let list = if committed {
            pending.on_success
        } else {
            pending.on_failure
        };
        for hook in list.into_iter().rev() {
            if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(hook)) {
                tracing::error!(
                    pool = self.pool_id,
                    committed,
                    "unit hook panicked: {}",
                    panic_message(panic.as_ref())
                );
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&'static str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "non-string panic payload"
    }
}
