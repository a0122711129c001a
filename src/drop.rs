//! Utilities related to destructors and drop.

/// Drop guard returned by [`defer`].
#[must_use = "`Defer` should be assigned to a variable, or it will be dropped immediately"]
pub struct Defer<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Drop for Defer<F> {
    fn drop(&mut self) {
        if let Some(cb) = self.0.take() {
            cb();
        }
    }
}

/// Returns a value that runs `cb` when dropped.
pub fn defer<F: FnOnce()>(cb: F) -> Defer<F> {
    Defer(Some(cb))
}

/// Logs the start of a named thread and returns a guard that logs its exit.
///
/// The exit message is also emitted when the thread unwinds.
pub fn trace_thread(kind: &'static str, name: String) -> Defer<impl FnOnce()> {
    log::trace!("{kind} '{name}' starting");
    defer(move || log::trace!("{kind} '{name}' exiting"))
}
