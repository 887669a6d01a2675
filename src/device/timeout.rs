use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use log::debug;
use tokio::spawn;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::device::types::PeerAddress;
use crate::device::worker::{WorkerMessage, WorkerSender};

// Tokens are unique for the whole process, so a timeout armed by an evicted connector can never be
// mistaken for one armed by its replacement.
static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    Connect,
    Discover,
    ScanStop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimeoutOwner {
    Connector(PeerAddress),
    Scanner,
}

/// Posted to the worker queue when an armed timeout elapses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutFired {
    pub owner: TimeoutOwner,
    pub kind: TimeoutKind,
    pub token: u64,
}

#[derive(Debug)]
struct PendingTimeout {
    token: u64,
    kind: TimeoutKind,
    cancel: CancellationToken,
}

/// Arms at most one delayed callback at a time for its owner.
///
/// The delay runs on its own task; when it elapses the task only posts a `TimeoutFired` message to
/// the worker queue, and the worker decides with `take_fired` whether that timeout is still the
/// armed one.
#[derive(Debug)]
pub struct TimeoutSupervisor {
    owner: TimeoutOwner,
    tx: WorkerSender,
    pending: Option<PendingTimeout>,
}

impl TimeoutSupervisor {
    pub(crate) fn new(owner: TimeoutOwner, tx: WorkerSender) -> Self {
        TimeoutSupervisor {
            owner,
            tx,
            pending: None,
        }
    }

    /// Arms a timeout, cancelling the previously armed one first.
    pub fn arm(&mut self, kind: TimeoutKind, delay: Duration) {
        self.cancel();

        let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let cancel_for_task = cancel.clone();
        let tx = self.tx.clone();
        let fired = TimeoutFired {
            owner: self.owner.clone(),
            kind,
            token,
        };

        debug!("Arming {:?} timeout for {:?} in {:?}", kind, self.owner, delay);
        spawn(async move {
            tokio::select! {
                _ = cancel_for_task.cancelled() => {},
                _ = sleep(delay) => {
                    if tx.unbounded_send(WorkerMessage::Timeout(fired)).is_err() {
                        debug!("Timeout elapsed after the link worker stopped");
                    }
                }
            }
        });

        self.pending = Some(PendingTimeout { token, kind, cancel });
    }

    pub fn cancel(&mut self) {
        if let Some(pending) = self.pending.take() {
            debug!("Cancelling {:?} timeout for {:?}", pending.kind, self.owner);
            pending.cancel.cancel();
        }
    }

    pub fn armed(&self) -> Option<TimeoutKind> {
        self.pending.as_ref().map(|pending| pending.kind)
    }

    /// Returns true and disarms if `fired` is the currently armed timeout. A fired timeout that
    /// was cancelled or replaced in the meantime is stale and yields false.
    pub fn take_fired(&mut self, fired: &TimeoutFired) -> bool {
        match &self.pending {
            Some(pending) if pending.token == fired.token => {
                self.pending = None;
                true
            },
            _ => false,
        }
    }
}

impl Drop for TimeoutSupervisor {
    fn drop(&mut self) {
        self.cancel();
    }
}
