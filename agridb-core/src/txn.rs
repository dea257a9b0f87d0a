/// Transactions and object store handles
///
/// A [`Transaction`] is a scoped unit of work over named stores. Operations
/// issued through an [`ObjectStore`] are queued on the transaction and run
/// in issue order by the coordinator thread once the transaction is active.
/// When the caller has dropped every handle (or called `commit`) and the
/// queue is empty, the transaction commits on its own.

use crate::coordinator::Command;
use crate::log::Mutation;
use crate::request::{self, Completer, Request};
use crate::store::StoreState;
use crate::{Error, Key, Record, Result, TxnId, Value};
use crossbeam::channel::Sender;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::ops::Bound;
use std::sync::Arc;

/// Access mode of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
}

impl fmt::Display for TransactionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionMode::ReadOnly => write!(f, "readonly"),
            TransactionMode::ReadWrite => write!(f, "readwrite"),
        }
    }
}

/// Lifecycle of a transaction: Pending -> Active -> Committed | Aborted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionState {
    /// Created, waiting for conflicting transactions to finish
    Pending,
    /// Running queued operations
    Active,
    Committed,
    Aborted,
}

impl TransactionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }
}

pub(crate) type OpFn =
    Box<dyn FnOnce(std::result::Result<&mut TxnWork, Error>, &TransactionScope) -> Option<Error> + Send>;
pub(crate) type NotifyFn = Box<dyn FnOnce(&TransactionScope) + Send>;

/// Queued work item
pub(crate) enum Queued {
    /// An operation; returns the failure that must abort the transaction
    Op(OpFn),
    /// A completion callback registered after its operation finished
    Notify(NotifyFn),
}

pub(crate) struct TxnQueue {
    pub(crate) state: TransactionState,
    /// Set by the coordinator when it starts committing; no more work is accepted
    pub(crate) finishing: bool,
    pub(crate) ops: VecDeque<Queued>,
    /// Every caller handle is gone
    pub(crate) released: bool,
    pub(crate) commit_requested: bool,
    pub(crate) abort_requested: Option<String>,
    pub(crate) listeners: Vec<Completer<()>>,
    /// Ok, or the abort reason
    pub(crate) outcome: Option<std::result::Result<(), String>>,
}

/// State shared between caller handles and the coordinator
pub(crate) struct TxnShared {
    pub(crate) id: TxnId,
    pub(crate) mode: TransactionMode,
    /// Sorted, deduplicated store names
    pub(crate) scope: Vec<String>,
    pub(crate) queue: Mutex<TxnQueue>,
    commands: Sender<Command>,
}

impl TxnShared {
    pub(crate) fn new(
        id: TxnId,
        mode: TransactionMode,
        scope: Vec<String>,
        commands: Sender<Command>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            mode,
            scope,
            queue: Mutex::new(TxnQueue {
                state: TransactionState::Pending,
                finishing: false,
                ops: VecDeque::new(),
                released: false,
                commit_requested: false,
                abort_requested: None,
                listeners: Vec::new(),
                outcome: None,
            }),
            commands,
        })
    }

    fn wake(&self) {
        // The coordinator is gone only after every transaction finished
        let _ = self.commands.send(Command::Wake(self.id));
    }

    pub(crate) fn state(&self) -> TransactionState {
        self.queue.lock().state
    }

    fn inactive_reason(&self, queue: &TxnQueue) -> Option<Error> {
        match queue.state {
            TransactionState::Committed => Some(Error::TransactionInactive(format!(
                "transaction {} already committed",
                self.id
            ))),
            TransactionState::Aborted => Some(Error::TransactionInactive(format!(
                "transaction {} already aborted",
                self.id
            ))),
            _ if queue.finishing || queue.commit_requested => Some(Error::TransactionInactive(
                format!("transaction {} is committing", self.id),
            )),
            _ => None,
        }
    }

    /// Queue an operation against the working copy.
    ///
    /// A failed operation aborts the whole transaction once its outcome has
    /// been delivered.
    pub(crate) fn submit<T, F>(self: &Arc<Self>, op: F) -> Request<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut TxnWork) -> Result<T> + Send + 'static,
    {
        let (request, completer) = request::pair(Arc::clone(self));

        let mut queue = self.queue.lock();
        if let Some(err) = self.inactive_reason(&queue) {
            drop(queue);
            completer.complete(Err(err), &TransactionScope::new(Arc::clone(self)));
            return request;
        }

        queue.ops.push_back(Queued::Op(Box::new(move |work, scope| match work {
            Ok(work) => {
                let result = op(work);
                let failure = result.as_ref().err().map(Error::duplicate);
                completer.complete(result, scope);
                failure
            }
            Err(cancelled) => {
                completer.complete(Err(cancelled), scope);
                None
            }
        })));
        drop(queue);

        self.wake();
        request
    }

    /// Run a late completion callback in transaction order, or right away
    /// when the transaction can no longer run callbacks.
    pub(crate) fn notify(self: &Arc<Self>, callback: NotifyFn) {
        let mut queue = self.queue.lock();
        if !queue.state.is_terminal() && !queue.finishing {
            queue.ops.push_back(Queued::Notify(callback));
            drop(queue);
            self.wake();
            return;
        }
        drop(queue);
        callback(&TransactionScope::new(Arc::clone(self)));
    }

    /// Request resolving when the transaction commits or aborts
    pub(crate) fn listen(self: &Arc<Self>) -> Request<()> {
        let (request, completer) = request::pair(Arc::clone(self));

        let mut queue = self.queue.lock();
        let Some(outcome) = queue.outcome.clone() else {
            queue.listeners.push(completer);
            return request;
        };
        drop(queue);

        let result = outcome.map_err(Error::TransactionAborted);
        completer.complete(result, &TransactionScope::new(Arc::clone(self)));
        request
    }

    fn release(&self) {
        self.queue.lock().released = true;
        self.wake();
    }

    fn request_commit(&self) {
        {
            let mut queue = self.queue.lock();
            if queue.state.is_terminal() {
                return;
            }
            queue.commit_requested = true;
        }
        self.wake();
    }

    pub(crate) fn request_abort(&self, reason: &str) {
        {
            let mut queue = self.queue.lock();
            if queue.state.is_terminal() || queue.finishing || queue.abort_requested.is_some() {
                return;
            }
            queue.abort_requested = Some(reason.to_string());
        }
        self.wake();
    }
}

/// Releases the transaction when the last caller handle goes away
struct HandleToken {
    shared: Arc<TxnShared>,
}

impl Drop for HandleToken {
    fn drop(&mut self) {
        self.shared.release();
    }
}

/// Caller handle to a transaction.
///
/// Dropping the transaction and every [`ObjectStore`] obtained from it lets
/// the transaction commit as soon as its queued operations have run.
pub struct Transaction {
    shared: Arc<TxnShared>,
    token: Arc<HandleToken>,
}

impl Transaction {
    pub(crate) fn new(shared: Arc<TxnShared>) -> Self {
        let token = Arc::new(HandleToken {
            shared: Arc::clone(&shared),
        });
        Self { shared, token }
    }

    pub fn id(&self) -> TxnId {
        self.shared.id
    }

    pub fn mode(&self) -> TransactionMode {
        self.shared.mode
    }

    pub fn state(&self) -> TransactionState {
        self.shared.state()
    }

    /// Stores this transaction may touch
    pub fn store_names(&self) -> &[String] {
        &self.shared.scope
    }

    /// Handle to one store in scope
    pub fn object_store(&self, name: &str) -> Result<ObjectStore> {
        ObjectStore::open(&self.shared, name, Some(Arc::clone(&self.token)))
    }

    /// Request resolving to `Ok(())` on commit, or `TransactionAborted` with
    /// the abort cause
    pub fn finished(&self) -> Request<()> {
        self.shared.listen()
    }

    /// Commit once the queued operations have run; no further operations
    /// are accepted.
    pub fn commit(self) -> Request<()> {
        let finished = self.shared.listen();
        self.shared.request_commit();
        finished
    }

    /// Abort, discarding every write of this transaction.
    ///
    /// Operations still queued fail with `TransactionAborted`.
    pub fn abort(self) {
        self.shared.request_abort("aborted by caller");
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.shared.id)
            .field("mode", &self.shared.mode)
            .field("scope", &self.shared.scope)
            .finish()
    }
}

/// View of a running transaction handed to completion callbacks
pub struct TransactionScope {
    shared: Arc<TxnShared>,
}

impl TransactionScope {
    pub(crate) fn new(shared: Arc<TxnShared>) -> Self {
        Self { shared }
    }

    pub fn id(&self) -> TxnId {
        self.shared.id
    }

    pub fn mode(&self) -> TransactionMode {
        self.shared.mode
    }

    pub fn state(&self) -> TransactionState {
        self.shared.state()
    }

    /// Store handle for issuing follow-up operations
    pub fn object_store(&self, name: &str) -> Result<ObjectStore> {
        ObjectStore::open(&self.shared, name, None)
    }

    /// Abort the transaction after the current callback returns
    pub fn abort(&self, reason: &str) {
        self.shared.request_abort(reason);
    }
}

/// Handle to one object store inside a transaction
#[derive(Clone)]
pub struct ObjectStore {
    shared: Arc<TxnShared>,
    name: String,
    _token: Option<Arc<HandleToken>>,
}

impl ObjectStore {
    fn open(shared: &Arc<TxnShared>, name: &str, token: Option<Arc<HandleToken>>) -> Result<Self> {
        if shared.scope.binary_search_by(|s| s.as_str().cmp(name)).is_err() {
            return Err(Error::NotFound(format!(
                "object store '{}' in the scope of transaction {}",
                name, shared.id
            )));
        }
        Ok(Self {
            shared: Arc::clone(shared),
            name: name.to_string(),
            _token: token,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Validate and insert a record under a newly generated key
    pub fn add(&self, record: Record) -> Request<Key> {
        let name = self.name.clone();
        self.shared.submit(move |work| work.add(&name, record))
    }

    /// Fails with `NotFound` for a missing key, which aborts the
    /// transaction like any other failed operation
    pub fn get(&self, key: Key) -> Request<Record> {
        let name = self.name.clone();
        self.shared
            .submit(move |work| work.store(&name)?.get(key).cloned())
    }

    /// Every record in ascending key order
    pub fn get_all(&self) -> Request<Vec<(Key, Record)>> {
        let name = self.name.clone();
        self.shared.submit(move |work| Ok(work.store(&name)?.get_all()))
    }

    /// Remove a record and its index entries.
    ///
    /// A missing key fails with `NotFound` and aborts the transaction,
    /// rolling back its earlier writes. On its own the failed delete changes
    /// nothing, so callers that only delete can treat `NotFound` as done.
    pub fn delete(&self, key: Key) -> Request<()> {
        let name = self.name.clone();
        self.shared.submit(move |work| work.delete(&name, key))
    }

    pub fn count(&self) -> Request<usize> {
        let name = self.name.clone();
        self.shared.submit(move |work| Ok(work.store(&name)?.count()))
    }

    /// Primary keys whose index key equals `value`
    pub fn index_lookup(&self, index: &str, value: Value) -> Request<Vec<Key>> {
        let name = self.name.clone();
        let index = index.to_string();
        self.shared
            .submit(move |work| work.store(&name)?.lookup(&index, &value))
    }

    /// Primary keys whose index key falls between the bounds
    pub fn index_range(&self, index: &str, lower: Bound<Value>, upper: Bound<Value>) -> Request<Vec<Key>> {
        let name = self.name.clone();
        let index = index.to_string();
        self.shared.submit(move |work| {
            work.store(&name)?
                .range(&index, lower.as_ref(), upper.as_ref())
        })
    }

    /// Records whose index key equals `value`
    pub fn index_get_all(&self, index: &str, value: Value) -> Request<Vec<(Key, Record)>> {
        let name = self.name.clone();
        let index = index.to_string();
        self.shared.submit(move |work| {
            let store = work.store(&name)?;
            let keys = store.lookup(&index, &value)?;
            Ok(store.records_for(&keys))
        })
    }

    pub fn index_names(&self) -> Request<Vec<String>> {
        let name = self.name.clone();
        self.shared.submit(move |work| {
            Ok(work
                .store(&name)?
                .indexes()
                .names()
                .map(str::to_string)
                .collect())
        })
    }
}

impl fmt::Debug for ObjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectStore")
            .field("name", &self.name)
            .field("txn", &self.shared.id)
            .finish()
    }
}

/// Working copy of an active transaction.
///
/// Stores are shared with the committed state until first written
/// (`Arc::make_mut`); dropping the work discards every write.
pub(crate) struct TxnWork {
    mode: TransactionMode,
    pub(crate) stores: BTreeMap<String, Arc<StoreState>>,
    pub(crate) mutations: Vec<Mutation>,
    pub(crate) dirty: BTreeSet<String>,
}

impl TxnWork {
    pub(crate) fn new(mode: TransactionMode, stores: BTreeMap<String, Arc<StoreState>>) -> Self {
        Self {
            mode,
            stores,
            mutations: Vec::new(),
            dirty: BTreeSet::new(),
        }
    }

    pub(crate) fn store(&self, name: &str) -> Result<&StoreState> {
        self.stores
            .get(name)
            .map(|store| store.as_ref())
            .ok_or_else(|| Error::NotFound(format!("object store '{}'", name)))
    }

    fn store_mut(&mut self, name: &str) -> Result<&mut StoreState> {
        if self.mode == TransactionMode::ReadOnly {
            return Err(Error::ReadOnly(format!(
                "cannot write to '{}' in a readonly transaction",
                name
            )));
        }
        let store = self
            .stores
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("object store '{}'", name)))?;
        self.dirty.insert(name.to_string());
        Ok(Arc::make_mut(store))
    }

    fn add(&mut self, name: &str, record: Record) -> Result<Key> {
        let (key, stored) = {
            let store = self.store_mut(name)?;
            let key = store.add(record)?;
            (key, store.get(key)?.clone())
        };
        self.mutations.push(Mutation::Put {
            store: name.to_string(),
            key,
            record: stored,
        });
        Ok(key)
    }

    fn delete(&mut self, name: &str, key: Key) -> Result<()> {
        self.store_mut(name)?.delete(key)?;
        self.mutations.push(Mutation::Delete {
            store: name.to_string(),
            key,
        });
        Ok(())
    }

    /// Key generator position of every written store
    pub(crate) fn key_generators(&self) -> BTreeMap<String, Key> {
        self.dirty
            .iter()
            .filter_map(|name| {
                self.stores
                    .get(name)
                    .map(|store| (name.clone(), store.next_key()))
            })
            .collect()
    }
}
