//! Cancellation tokens.
//!
//! A [`CancelToken`] is the single shared stop switch of a pipeline or stream. Tokens form a tree:
//! cancelling a token cancels every [`child`](CancelToken::child) derived from it, but never its
//! parent. Every blocking operation in this crate selects on [`CancelToken::done`], so no thread
//! stays blocked on a channel after its token fires.

use std::{
    fmt, io,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    thread,
    time::Duration,
};

use crossbeam_channel::{select, Receiver, RecvError, Sender};

use crate::{drop::trace_thread, signal::Signal};

/// Why a [`CancelToken`] was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum Cancelled {
    /// [`CancelToken::cancel`] was called on the token or one of its ancestors.
    #[error("operation was cancelled")]
    Requested,
    /// The deadline set by [`CancelToken::with_timeout`] passed.
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

/// A cloneable, idempotent cancellation handle.
#[derive(Clone)]
pub struct CancelToken(Arc<TokenInner>);

struct TokenInner {
    signal: Signal,
    state: Mutex<TokenState>,
}

#[derive(Default)]
struct TokenState {
    reason: Option<Cancelled>,
    children: Vec<Weak<TokenInner>>,
}

impl TokenInner {
    fn state(&self) -> MutexGuard<'_, TokenState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CancelToken {
    /// Creates a new root token.
    pub fn new() -> Self {
        Self(Arc::new(TokenInner {
            signal: Signal::new(),
            state: Mutex::default(),
        }))
    }

    /// Derives a token that is cancelled together with `self`.
    ///
    /// Cancelling the child does not affect `self`. If `self` is already cancelled, the child
    /// starts out cancelled with the same reason.
    pub fn child(&self) -> Self {
        let child = Self::new();
        let mut state = self.0.state();
        match state.reason {
            Some(reason) => {
                drop(state);
                child.cancel_with(reason);
            }
            None => {
                state.children.retain(|c| c.strong_count() > 0);
                state.children.push(Arc::downgrade(&child.0));
            }
        }
        child
    }

    /// Derives a child token that cancels itself with [`Cancelled::DeadlineExceeded`] once
    /// `timeout` has elapsed.
    ///
    /// A timer thread waits for the deadline. It exits early when the token is cancelled or every
    /// handle to it has been dropped.
    pub fn with_timeout(&self, timeout: Duration) -> io::Result<Self> {
        let child = self.child();
        let weak = Arc::downgrade(&child.0);
        let done = child.done().clone();
        thread::Builder::new()
            .name("deadline".into())
            .spawn(move || {
                let _guard = trace_thread("deadline timer", format!("{timeout:?}"));
                select! {
                    recv(crossbeam_channel::after(timeout)) -> _ => {
                        if let Some(inner) = weak.upgrade() {
                            CancelToken(inner).cancel_with(Cancelled::DeadlineExceeded);
                        }
                    }
                    recv(done) -> _ => {}
                }
            })?;
        Ok(child)
    }

    /// Cancels this token and all of its descendants.
    ///
    /// Returns `true` if this call performed the cancellation.
    pub fn cancel(&self) -> bool {
        self.cancel_with(Cancelled::Requested)
    }

    fn cancel_with(&self, reason: Cancelled) -> bool {
        let children = {
            let mut state = self.0.state();
            if state.reason.is_some() {
                return false;
            }
            state.reason = Some(reason);
            std::mem::take(&mut state.children)
        };
        // The reason is recorded before the signal fires, so anyone woken by it can read it.
        self.0.signal.fire();
        log::trace!("token cancelled: {reason}");
        for child in children.iter().filter_map(Weak::upgrade) {
            CancelToken(child).cancel_with(reason);
        }
        true
    }

    /// Returns whether the token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.0.signal.is_fired()
    }

    /// Returns why the token was cancelled, or [`None`] if it is still live.
    pub fn reason(&self) -> Option<Cancelled> {
        self.0.state().reason
    }

    /// Returns `Err` with the cancellation reason if the token has been cancelled.
    ///
    /// Long-running work functions can call this between steps and propagate it with `?`.
    pub fn check(&self) -> Result<(), Cancelled> {
        match self.reason() {
            Some(reason) => Err(reason),
            None => Ok(()),
        }
    }

    /// Blocks until the token is cancelled and returns the reason.
    pub fn wait(&self) -> Cancelled {
        self.0.signal.wait();
        self.fired_reason()
    }

    /// Sleeps for `duration`, waking early if the token is cancelled.
    pub fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        self.check()?;
        select! {
            recv(crossbeam_channel::after(duration)) -> _ => Ok(()),
            recv(self.done()) -> _ => Err(self.fired_reason()),
        }
    }

    /// Returns a receiver that becomes ready once the token is cancelled.
    ///
    /// Use it as an arm of [`crossbeam_channel::select!`] to make a blocking operation
    /// cancellable.
    pub fn done(&self) -> &Receiver<()> {
        self.0.signal.receiver()
    }

    /// Returns the [`Signal`] fired on cancellation, e.g. to combine it with gates.
    pub fn signal(&self) -> Signal {
        self.0.signal.clone()
    }

    /// Sends `value` unless the token is cancelled first.
    ///
    /// Returns `false` if the token was cancelled or the receiving side is gone.
    pub(crate) fn send<T>(&self, out: &Sender<T>, value: T) -> bool {
        if self.is_cancelled() {
            return false;
        }
        select! {
            send(out, value) -> res => res.is_ok(),
            recv(self.done()) -> _ => false,
        }
    }

    /// Receives from `input` unless the token is cancelled first.
    ///
    /// `Ok(None)` means the input is exhausted.
    pub(crate) fn recv<T>(&self, input: &Receiver<T>) -> Result<Option<T>, Cancelled> {
        self.check()?;
        select! {
            recv(input) -> msg => match msg {
                Ok(value) => Ok(Some(value)),
                Err(RecvError) => Ok(None),
            },
            recv(self.done()) -> _ => Err(self.fired_reason()),
        }
    }

    fn fired_reason(&self) -> Cancelled {
        match self.reason() {
            Some(reason) => reason,
            None => unreachable!("the signal only fires after a reason is recorded"),
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("reason", &self.reason())
            .finish_non_exhaustive()
    }
}
