//! Cooperative cancellation for shard-scoped work.
//!
//! A `CancelToken` is select-able: its `done()` receiver disconnects when
//! the paired `Canceller` fires (or is dropped), so long-lived loops fold
//! cancellation into their channel selects instead of polling a flag.

use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, Receiver, Sender, TryRecvError};
use crossbeam::select;

/// Why a token fired.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelCause {
    /// Explicit cancellation.
    Canceled,
    /// A deadline elapsed before explicit cancellation.
    DeadlineExceeded,
}

/// Create a linked canceller/token pair.
pub fn cancel_pair() -> (Canceller, CancelToken) {
    let (tx, rx) = channel::bounded::<()>(0);
    let cause = Arc::new(OnceLock::new());
    let canceller = Canceller {
        tx: Arc::new(Mutex::new(Some(tx))),
        rx: rx.clone(),
        cause: cause.clone(),
    };
    (canceller, CancelToken { rx, cause })
}

/// Fires the paired tokens. Cloning shares the same cancellation scope;
/// dropping the last clone cancels it.
#[derive(Clone)]
pub struct Canceller {
    tx: Arc<Mutex<Option<Sender<()>>>>,
    rx: Receiver<()>,
    cause: Arc<OnceLock<CancelCause>>,
}

impl Canceller {
    pub fn cancel(&self) {
        self.cancel_with(CancelCause::Canceled);
    }

    /// Cancel all linked tokens after `dur`, as `DeadlineExceeded`,
    /// unless cancellation happens first.
    pub fn deadline(&self, dur: Duration) {
        let this = self.clone();
        thread::spawn(move || {
            select! {
                recv(this.rx) -> _ => {}
                recv(channel::after(dur)) -> _ => this.cancel_with(CancelCause::DeadlineExceeded),
            }
        });
    }

    fn cancel_with(&self, cause: CancelCause) {
        // First firing wins; a later deadline cannot rewrite the cause.
        let _ = self.cause.set(cause);
        self.tx
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .take();
    }
}

/// Observer half of a cancellation scope.
#[derive(Clone)]
pub struct CancelToken {
    rx: Receiver<()>,
    cause: Arc<OnceLock<CancelCause>>,
}

impl CancelToken {
    /// A token that never fires.
    pub fn never() -> CancelToken {
        let (canceller, token) = cancel_pair();
        std::mem::forget(canceller);
        token
    }

    /// Receiver that disconnects once the scope is canceled. Use in
    /// `select!` arms.
    pub fn done(&self) -> &Receiver<()> {
        &self.rx
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Cause of cancellation, if fired.
    pub fn cause(&self) -> Option<CancelCause> {
        if self.is_canceled() {
            Some(*self.cause.get().unwrap_or(&CancelCause::Canceled))
        } else {
            None
        }
    }

    /// Derive a child scope: the child fires when this token fires (with
    /// the same cause) or when its own canceller fires, whichever is
    /// first.
    pub fn child(&self) -> (Canceller, CancelToken) {
        let (canceller, token) = cancel_pair();
        let parent = self.clone();
        let relay = canceller.clone();
        thread::spawn(move || {
            let _ = parent.rx.recv();
            relay.cancel_with(*parent.cause.get().unwrap_or(&CancelCause::Canceled));
        });
        (canceller, token)
    }
}
