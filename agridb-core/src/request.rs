/// Completion handles for queued operations
///
/// Submitting an operation returns a [`Request`] at once. The outcome is
/// delivered later by the coordinator thread, either to the request itself
/// (`wait()` or `.await`) or to a callback registered with
/// [`Request::then`], which runs on the coordinator thread and may queue
/// follow-up operations into the same transaction.

use crate::txn::{TransactionScope, TxnShared};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::oneshot::{self, error::TryRecvError};
use tracing::warn;

pub(crate) type Callback<T> = Box<dyn FnOnce(Result<T>, &TransactionScope) + Send>;

struct Slot<T> {
    sender: Option<oneshot::Sender<Result<T>>>,
    callback: Option<Callback<T>>,
}

/// Pending outcome of one operation
#[must_use = "a request does nothing unless its outcome is observed"]
pub struct Request<T> {
    receiver: oneshot::Receiver<Result<T>>,
    slot: Arc<Mutex<Slot<T>>>,
    txn: Arc<TxnShared>,
}

/// Coordinator-side end of a request
pub(crate) struct Completer<T> {
    slot: Arc<Mutex<Slot<T>>>,
}

pub(crate) fn pair<T>(txn: Arc<TxnShared>) -> (Request<T>, Completer<T>) {
    let (sender, receiver) = oneshot::channel();
    let slot = Arc::new(Mutex::new(Slot {
        sender: Some(sender),
        callback: None,
    }));
    (
        Request {
            receiver,
            slot: Arc::clone(&slot),
            txn,
        },
        Completer { slot },
    )
}

fn dropped() -> Error {
    Error::Internal("operation dropped before completion".to_string())
}

impl<T> Completer<T> {
    /// Deliver the outcome to the registered callback, or to the receiver
    /// when no callback was registered.
    pub(crate) fn complete(self, result: Result<T>, scope: &TransactionScope) {
        let callback = {
            let mut slot = self.slot.lock();
            match slot.callback.take() {
                Some(callback) => callback,
                None => {
                    if let Some(sender) = slot.sender.take() {
                        let _ = sender.send(result);
                    }
                    return;
                }
            }
        };
        callback(result, scope);
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        let mut slot = self.slot.lock();
        if let Some(sender) = slot.sender.take() {
            let _ = sender.send(Err(dropped()));
        }
        if slot.callback.take().is_some() {
            warn!("Completion callback discarded: operation dropped before completion");
        }
    }
}

/// Refuse blocking waits on threads that run inside a tokio runtime, where
/// they would stall the executor. Such callers `.await` the request.
pub fn ensure_blocking_allowed() -> Result<()> {
    if tokio::runtime::Handle::try_current().is_ok() {
        return Err(Error::InvalidArgument(
            "Blocking wait inside an async runtime; await the request instead".to_string(),
        ));
    }
    Ok(())
}

impl<T: Send + 'static> Request<T> {
    /// Block the calling thread until the outcome arrives.
    ///
    /// Fails with `InvalidArgument` inside an async runtime (use `.await`).
    /// Must not be called from a completion callback: it would block the
    /// coordinator.
    pub fn wait(self) -> Result<T> {
        ensure_blocking_allowed()?;
        self.receiver.blocking_recv().unwrap_or_else(|_| Err(dropped()))
    }

    /// Take the outcome if it has already arrived
    pub fn try_result(&mut self) -> Option<Result<T>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Closed) => Some(Err(dropped())),
        }
    }

    /// Identifier of the owning transaction
    pub fn transaction_id(&self) -> crate::TxnId {
        self.txn.id
    }

    /// Deliver the outcome to `callback` on the coordinator thread.
    ///
    /// The callback receives a [`TransactionScope`] through which it can
    /// queue follow-up operations; the transaction does not commit before
    /// they have run. If the transaction already finished, the callback runs
    /// right away on the calling thread and follow-ups fail as inactive.
    pub fn then<F>(self, callback: F)
    where
        F: FnOnce(Result<T>, &TransactionScope) + Send + 'static,
    {
        let Request {
            mut receiver,
            slot,
            txn,
        } = self;

        {
            let mut guard = slot.lock();
            if guard.sender.is_some() {
                guard.sender = None;
                guard.callback = Some(Box::new(callback));
                return;
            }
        }

        // Already completed: the outcome sits in the receiver
        let result = receiver.try_recv().unwrap_or_else(|_| Err(dropped()));
        txn.notify(Box::new(move |scope| callback(result, scope)));
    }
}

impl<T> Future for Request<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.receiver)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(dropped())))
    }
}

impl<T> std::fmt::Debug for Request<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request").field("txn", &self.txn.id).finish()
    }
}
