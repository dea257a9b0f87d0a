/// Transaction coordinator
///
/// One worker thread per open database owns scheduling. It activates
/// pending transactions in creation order, runs their queued operations,
/// commits or aborts them, and runs version upgrades with nothing else in
/// flight. Caller threads only ever talk to it through [`Command`]s.
///
/// Scheduling rules:
/// - readwrite transactions with overlapping scopes run one at a time, in
///   creation order
/// - a readonly transaction waits for every earlier readwrite transaction
///   that overlaps its scope, then reads a snapshot; it never blocks later
///   transactions
/// - an upgrade waits for everything created before it and blocks
///   everything created after it

use crate::engine::{EngineState, ShutdownSignal};
use crate::error::{Error, Result};
use crate::log::LogEntry;
use crate::txn::{Queued, TransactionMode, TransactionScope, TransactionState, TxnShared, TxnWork};
use crate::upgrade::{UpgradeFn, UpgradeTransaction};
use crate::{TxnId, Version};
use crossbeam::channel::{Receiver, Sender};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

pub(crate) enum Command {
    /// A new transaction, in creation order
    Begin(Arc<TxnShared>),
    /// Something changed on a transaction's queue
    Wake(TxnId),
    Upgrade(UpgradeRequest),
    /// Finish outstanding work, then exit
    Shutdown,
}

pub(crate) struct UpgradeRequest {
    pub(crate) version: Version,
    pub(crate) apply: UpgradeFn,
    pub(crate) reply: Sender<Result<Version>>,
}

enum Work {
    Txn(Arc<TxnShared>),
    Upgrade(UpgradeRequest),
}

struct ActiveTxn {
    shared: Arc<TxnShared>,
    work: TxnWork,
}

enum Step {
    Run(Queued),
    Commit,
    Abort(Error),
    Idle,
}

/// Start the coordinator thread for an engine
pub(crate) fn spawn(
    state: Arc<EngineState>,
    receiver: Receiver<Command>,
    shutdown: Arc<ShutdownSignal>,
) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("agridb-coordinator".to_string())
        .spawn(move || {
            Coordinator::new(state, receiver).run();
            shutdown.notify();
        })?;
    Ok(handle)
}

struct Coordinator {
    state: Arc<EngineState>,
    receiver: Receiver<Command>,
    pending: VecDeque<Work>,
    active: BTreeMap<TxnId, ActiveTxn>,
    closing: bool,
}

impl Coordinator {
    fn new(state: Arc<EngineState>, receiver: Receiver<Command>) -> Self {
        Self {
            state,
            receiver,
            pending: VecDeque::new(),
            active: BTreeMap::new(),
            closing: false,
        }
    }

    fn run(mut self) {
        debug!("Coordinator loop started");

        while let Ok(command) = self.receiver.recv() {
            self.handle(command);
            while let Ok(command) = self.receiver.try_recv() {
                self.handle(command);
            }

            self.pump();

            if self.closing && self.pending.is_empty() && self.active.is_empty() {
                break;
            }
        }

        info!("Coordinator loop exited");
    }

    fn handle(&mut self, command: Command) {
        match command {
            Command::Begin(shared) => {
                if self.closing {
                    Self::finish(
                        &shared,
                        Err(Error::TransactionInactive("database is closing".to_string())),
                    );
                    return;
                }
                debug!(
                    "Transaction {} created ({} on {:?})",
                    shared.id, shared.mode, shared.scope
                );
                self.pending.push_back(Work::Txn(shared));
            }
            Command::Wake(_) => {}
            Command::Upgrade(request) => self.pending.push_back(Work::Upgrade(request)),
            Command::Shutdown => {
                info!(
                    "Closing: {} pending and {} active transactions to finish",
                    self.pending.len(),
                    self.active.len()
                );
                self.closing = true;
                // Caller handles may outlive the database; treat them as dropped
                for work in &self.pending {
                    if let Work::Txn(shared) = work {
                        shared.queue.lock().released = true;
                    }
                }
                for txn in self.active.values() {
                    txn.shared.queue.lock().released = true;
                }
            }
        }
    }

    /// Schedule and drive transactions until nothing moves
    fn pump(&mut self) {
        loop {
            let mut progressed = self.schedule();
            let ids: Vec<TxnId> = self.active.keys().copied().collect();
            for id in ids {
                progressed |= self.drive(id);
            }
            if !progressed {
                break;
            }
        }
    }

    /// Activate every pending transaction whose conflicts have cleared
    fn schedule(&mut self) -> bool {
        let mut progressed = false;
        // Stores claimed by active or earlier pending readwrite transactions
        let mut claimed: BTreeSet<String> = self
            .active
            .values()
            .filter(|txn| txn.shared.mode == TransactionMode::ReadWrite)
            .flat_map(|txn| txn.shared.scope.iter().cloned())
            .collect();

        let mut i = 0;
        while i < self.pending.len() {
            let shared = match &self.pending[i] {
                Work::Upgrade(_) => {
                    if i == 0 && self.active.is_empty() {
                        if let Some(Work::Upgrade(request)) = self.pending.pop_front() {
                            self.run_upgrade(request);
                        }
                        progressed = true;
                        continue;
                    }
                    break;
                }
                Work::Txn(shared) => Arc::clone(shared),
            };

            let abort = shared.queue.lock().abort_requested.take();
            if let Some(reason) = abort {
                self.pending.remove(i);
                Self::abort(&shared, Error::TransactionAborted(reason));
                progressed = true;
                continue;
            }

            let conflicts = shared.scope.iter().any(|name| claimed.contains(name));
            if shared.mode == TransactionMode::ReadWrite {
                claimed.extend(shared.scope.iter().cloned());
            }
            if conflicts {
                i += 1;
                continue;
            }

            self.pending.remove(i);
            self.activate(shared);
            progressed = true;
        }

        progressed
    }

    fn activate(&mut self, shared: Arc<TxnShared>) {
        let state = Arc::clone(&self.state);
        let committed = state.committed.read();

        let mut stores = BTreeMap::new();
        for name in &shared.scope {
            match committed.stores.get(name) {
                Some(store) => {
                    stores.insert(name.clone(), Arc::clone(store));
                }
                None => {
                    drop(committed);
                    Self::abort(
                        &shared,
                        Error::NotFound(format!("object store '{}'", name)),
                    );
                    return;
                }
            }
        }
        drop(committed);

        shared.queue.lock().state = TransactionState::Active;
        debug!("Transaction {} active", shared.id);

        let work = TxnWork::new(shared.mode, stores);
        self.active.insert(shared.id, ActiveTxn { shared, work });
    }

    /// Run queued work of one active transaction; returns whether anything ran
    fn drive(&mut self, id: TxnId) -> bool {
        let Some(mut txn) = self.active.remove(&id) else {
            return false;
        };
        let scope = TransactionScope::new(Arc::clone(&txn.shared));
        let mut progressed = false;

        loop {
            let step = {
                let mut queue = txn.shared.queue.lock();
                if let Some(reason) = queue.abort_requested.take() {
                    Step::Abort(Error::TransactionAborted(reason))
                } else if let Some(item) = queue.ops.pop_front() {
                    Step::Run(item)
                } else if queue.released || queue.commit_requested {
                    queue.finishing = true;
                    Step::Commit
                } else {
                    Step::Idle
                }
            };

            match step {
                Step::Run(Queued::Op(op)) => {
                    progressed = true;
                    let work = &mut txn.work;
                    let failure = panic::catch_unwind(AssertUnwindSafe(|| op(Ok(work), &scope)))
                        .unwrap_or_else(|_| Some(Error::Internal("operation callback panicked".to_string())));
                    if let Some(cause) = failure {
                        Self::abort(&txn.shared, cause);
                        return true;
                    }
                }
                Step::Run(Queued::Notify(callback)) => {
                    progressed = true;
                    if panic::catch_unwind(AssertUnwindSafe(|| callback(&scope))).is_err() {
                        Self::abort(
                            &txn.shared,
                            Error::Internal("completion callback panicked".to_string()),
                        );
                        return true;
                    }
                }
                Step::Commit => {
                    self.commit(txn);
                    return true;
                }
                Step::Abort(cause) => {
                    Self::abort(&txn.shared, cause);
                    return true;
                }
                Step::Idle => {
                    self.active.insert(id, txn);
                    return progressed;
                }
            }
        }
    }

    fn commit(&mut self, txn: ActiveTxn) {
        let ActiveTxn { shared, work } = txn;

        if shared.mode == TransactionMode::ReadWrite && !work.mutations.is_empty() {
            let entry = LogEntry::Commit {
                txn_id: shared.id,
                mutations: work.mutations.clone(),
                key_generators: work.key_generators(),
            };
            let appended = self
                .state
                .log
                .lock()
                .append(&entry, self.state.config.sync_on_commit);
            if let Err(e) = appended {
                error!("Failed to log commit of transaction {}: {}", shared.id, e);
                Self::abort(&shared, e);
                return;
            }
        }

        {
            let mut committed = self.state.committed.write();
            for name in &work.dirty {
                if let Some(store) = work.stores.get(name) {
                    committed.stores.insert(name.clone(), Arc::clone(store));
                }
            }
        }

        debug!(
            "Transaction {} committed ({} mutations)",
            shared.id,
            work.mutations.len()
        );
        Self::finish(&shared, Ok(()));
    }

    /// Abort: the working copy is dropped by the caller, queued operations
    /// fail with the cause
    fn abort(shared: &Arc<TxnShared>, cause: Error) {
        warn!("Transaction {} aborted: {}", shared.id, cause);
        Self::finish(shared, Err(cause));
    }

    /// Move to a terminal state and notify everything still waiting
    fn finish(shared: &Arc<TxnShared>, outcome: Result<()>) {
        let reason = outcome.as_ref().err().map(|cause| match cause {
            Error::TransactionAborted(reason) => reason.clone(),
            other => other.to_string(),
        });

        let (cancelled, listeners) = {
            let mut queue = shared.queue.lock();
            queue.state = match outcome {
                Ok(()) => TransactionState::Committed,
                Err(_) => TransactionState::Aborted,
            };
            queue.finishing = false;
            queue.outcome = Some(match &reason {
                None => Ok(()),
                Some(reason) => Err(reason.clone()),
            });
            (
                std::mem::take(&mut queue.ops),
                std::mem::take(&mut queue.listeners),
            )
        };

        let scope = TransactionScope::new(Arc::clone(shared));
        for item in cancelled {
            let delivered = match item {
                Queued::Op(op) => {
                    let cause = Error::TransactionAborted(reason.clone().unwrap_or_default());
                    panic::catch_unwind(AssertUnwindSafe(|| {
                        op(Err(cause), &scope);
                    }))
                }
                Queued::Notify(callback) => panic::catch_unwind(AssertUnwindSafe(|| callback(&scope))),
            };
            if delivered.is_err() {
                warn!("Callback of transaction {} panicked after it finished", shared.id);
            }
        }

        for listener in listeners {
            let result = match &reason {
                None => Ok(()),
                Some(reason) => Err(Error::TransactionAborted(reason.clone())),
            };
            if panic::catch_unwind(AssertUnwindSafe(|| listener.complete(result, &scope))).is_err() {
                warn!("Completion listener of transaction {} panicked", shared.id);
            }
        }
    }

    fn run_upgrade(&mut self, request: UpgradeRequest) {
        let UpgradeRequest {
            version,
            apply,
            reply,
        } = request;
        let result = self.apply_upgrade(version, apply);
        // The opener may have given up waiting
        let _ = reply.send(result);
    }

    fn apply_upgrade(&mut self, version: Version, apply: UpgradeFn) -> Result<Version> {
        let (current, stores) = {
            let committed = self.state.committed.read();
            (committed.version, committed.stores.clone())
        };

        if version < current {
            return Err(Error::Open(format!(
                "Requested version {} is lower than stored version {}",
                version, current
            )));
        }
        if version == current {
            return Ok(current);
        }

        let mut upgrade = UpgradeTransaction::new(current, version, stores, self.state.config.clone());
        match panic::catch_unwind(AssertUnwindSafe(|| apply(&mut upgrade))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Upgrade to version {} failed: {}", version, e);
                return Err(match e {
                    Error::Upgrade(message) => Error::Upgrade(message),
                    other => Error::Upgrade(other.to_string()),
                });
            }
            Err(_) => {
                warn!("Upgrade callback for version {} panicked", version);
                return Err(Error::Upgrade("upgrade callback panicked".to_string()));
            }
        }

        let (stores, entry) = upgrade.finish();
        self.state
            .log
            .lock()
            .append(&entry, true)
            .map_err(|e| Error::Upgrade(format!("Failed to log upgrade: {}", e)))?;

        {
            let mut committed = self.state.committed.write();
            committed.version = version;
            committed.stores = stores;
        }

        info!("Upgraded database from version {} to {}", current, version);
        Ok(version)
    }
}
