use std::{
    io,
    panic::resume_unwind,
    thread::{self, JoinHandle},
};

use crate::drop::trace_thread;

/// An owned, named, run-to-completion thread.
///
/// Calling [`Background::join`] or dropping a [`Background`] object will join the thread. If the
/// thread panicked, the panic will be propagated to the owner.
///
/// Every thread spawned by a pipeline or stream is held in one of these, which is what guarantees
/// that none of them outlives the call (or the [`Stream`][crate::Stream]) that started it.
pub(crate) struct Background<R> {
    handle: Option<JoinHandle<R>>,
}

impl<R> Drop for Background<R> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if let Err(payload) = handle.join() {
                if !thread::panicking() {
                    resume_unwind(payload);
                }
            }
        }
    }
}

impl<R: Send + 'static> Background<R> {
    /// Spawns `f` on a thread named `name`.
    pub(crate) fn spawn<F>(name: String, f: F) -> io::Result<Self>
    where
        F: FnOnce() -> R + Send + 'static,
    {
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            let _guard = trace_thread("thread", name);
            f()
        })?;
        Ok(Self {
            handle: Some(handle),
        })
    }

    /// Blocks on the background thread and returns its result.
    ///
    /// If the thread panics, the panic will be propagated to the owner.
    pub(crate) fn join(mut self) -> R {
        let handle = self.handle.take().expect("only `join` and `drop` take the handle");
        match handle.join() {
            Ok(r) => r,
            Err(payload) => resume_unwind(payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{catch_unwind, AssertUnwindSafe};

    use super::*;
    use crate::test::silent_panic;

    #[test]
    fn join_returns_result() {
        let bg = Background::spawn("answer".into(), || 6 * 7).unwrap();
        assert_eq!(bg.join(), 42);
    }

    #[test]
    fn propagates_panic_on_join() {
        let bg = Background::spawn("doomed".into(), || silent_panic("bg panic".into())).unwrap();
        catch_unwind(AssertUnwindSafe(|| bg.join())).unwrap_err();
    }

    #[test]
    fn propagates_panic_on_drop() {
        let bg: Background<()> =
            Background::spawn("doomed".into(), || silent_panic("bg panic".into())).unwrap();
        catch_unwind(AssertUnwindSafe(|| drop(bg))).unwrap_err();
    }

    #[test]
    fn uses_the_given_name() {
        let bg = Background::spawn("named-thread".into(), || {
            thread::current().name().map(str::to_owned)
        })
        .unwrap();
        assert_eq!(bg.join().as_deref(), Some("named-thread"));
    }
}
