//! One-shot completion signals and the AND/OR gates that combine them.
//!
//! A [`Signal`] is a broadcast event: any number of threads can wait for it, and it can be fired
//! exactly once. It is built on a [`crossbeam_channel`] channel that never carries a message.
//! Firing the signal drops the only [`Sender`], which disconnects the channel and wakes every
//! receiver at once. That makes [`Signal::receiver`] usable in a [`select!`] next to any other
//! channel operation.

use std::{
    fmt, io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError, Weak,
    },
    thread,
    time::Duration,
};

use crossbeam_channel::{select, Receiver, RecvTimeoutError, Sender, TryRecvError};

use crate::drop::trace_thread;

/// A one-shot, broadcastable completion event.
///
/// Clones refer to the same event. Firing is irreversible and idempotent: only the first call to
/// [`Signal::fire`] performs the transition, later calls observe it and return `false`.
#[derive(Clone)]
pub struct Signal(Arc<Inner>);

struct Inner {
    /// Present while pending. Dropping it disconnects `fired`.
    trigger: Mutex<Option<Sender<()>>>,
    fired: Receiver<()>,
}

impl Signal {
    /// Creates a pending signal.
    pub fn new() -> Self {
        let (trigger, fired) = crossbeam_channel::bounded(0);
        Self(Arc::new(Inner {
            trigger: Mutex::new(Some(trigger)),
            fired,
        }))
    }

    /// Fires the signal, waking every waiter.
    ///
    /// Returns `true` if this call fired the signal, and `false` if it had already been fired.
    pub fn fire(&self) -> bool {
        let mut trigger = self
            .0
            .trigger
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // The sender is dropped while the lock is held, so once any `fire` returns the channel is
        // already disconnected.
        trigger.take().is_some()
    }

    /// Returns whether the signal has been fired.
    pub fn is_fired(&self) -> bool {
        matches!(self.0.fired.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Blocks the calling thread until the signal fires.
    pub fn wait(&self) {
        // Nothing is ever sent, so this only returns on disconnection.
        let _ = self.0.fired.recv();
    }

    /// Blocks until the signal fires or `timeout` elapses.
    ///
    /// Returns `true` if the signal fired.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match self.0.fired.recv_timeout(timeout) {
            Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
            Ok(()) => unreachable!("signal channels never carry messages"),
        }
    }

    /// Returns a receiver that becomes ready (with a disconnection error) once the signal fires.
    ///
    /// This is meant to be used as an arm in [`crossbeam_channel::select!`].
    pub fn receiver(&self) -> &Receiver<()> {
        &self.0.fired
    }

    /// Returns what a gate watcher needs: a way to observe the gate and a way to fire it that
    /// doesn't keep it alive.
    fn watch(&self) -> (Receiver<()>, Weak<Inner>) {
        (self.0.fired.clone(), Arc::downgrade(&self.0))
    }

    #[cfg(test)]
    pub(crate) fn handle_count(&self) -> usize {
        Arc::strong_count(&self.0)
    }

    #[cfg(test)]
    pub(crate) fn same_as(&self, other: &Signal) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("fired", &self.is_fired())
            .finish()
    }
}

/// Returns a signal that fires once every signal in `signals` has fired.
///
/// One watcher thread is spawned per input. Each watcher also listens to the returned signal, so
/// firing the result by hand, or dropping every handle to it, releases all of them.
///
/// With no inputs, the returned signal never fires on its own.
pub fn gate_all<I>(signals: I) -> io::Result<Signal>
where
    I: IntoIterator<Item = Signal>,
{
    let signals: Vec<Signal> = signals.into_iter().collect();
    let gate = Signal::new();
    if signals.is_empty() {
        return Ok(gate);
    }

    let remaining = Arc::new(AtomicUsize::new(signals.len()));
    for (i, input) in signals.into_iter().enumerate() {
        let (gate_fired, gate_) = gate.watch();
        let remaining = remaining.clone();
        let name = format!("gate-all-{i}");
        let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
            let _guard = trace_thread("gate watcher", name);
            select! {
                recv(input.receiver()) -> _ => {
                    // Last one out fires the gate.
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        if let Some(gate) = gate_.upgrade() {
                            Signal(gate).fire();
                        }
                    }
                }
                recv(gate_fired) -> _ => {}
            }
        });
        if let Err(e) = spawned {
            gate.fire();
            return Err(e);
        }
    }

    Ok(gate)
}

/// Returns a signal that fires as soon as any signal in `signals` fires.
///
/// Returns [`None`] when `signals` is empty, and the input itself when there is exactly one.
/// Otherwise one watcher thread is spawned per input; the first to observe its input fires the
/// gate, and all others exit as soon as the gate has fired or has been dropped.
pub fn gate_any<I>(signals: I) -> io::Result<Option<Signal>>
where
    I: IntoIterator<Item = Signal>,
{
    let mut signals: Vec<Signal> = signals.into_iter().collect();
    if signals.len() <= 1 {
        return Ok(signals.pop());
    }

    let gate = Signal::new();
    for (i, input) in signals.into_iter().enumerate() {
        let (gate_fired, gate_) = gate.watch();
        let name = format!("gate-any-{i}");
        let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
            let _guard = trace_thread("gate watcher", name);
            select! {
                recv(input.receiver()) -> _ => {
                    if let Some(gate) = gate_.upgrade() {
                        Signal(gate).fire();
                    }
                }
                recv(gate_fired) -> _ => {}
            }
        });
        if let Err(e) = spawned {
            gate.fire();
            return Err(e);
        }
    }

    Ok(Some(gate))
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::test::{signal_after, wait_until};

    #[test]
    fn fire_is_idempotent() {
        let signal = Signal::new();
        assert!(!signal.is_fired());
        assert!(signal.fire());
        assert!(!signal.fire());
        assert!(signal.is_fired());
    }

    #[test]
    fn concurrent_fire_closes_once() {
        let signal = Signal::new();
        let fired = AtomicUsize::new(0);
        thread::scope(|s| {
            for _ in 0..16 {
                s.spawn(|| {
                    if signal.fire() {
                        fired.fetch_add(1, Ordering::Relaxed);
                    }
                });
            }
        });
        assert_eq!(fired.load(Ordering::Relaxed), 1);
        assert!(signal.is_fired());
    }

    #[test]
    fn wait_timeout_observes_fire() {
        let signal = Signal::new();
        assert!(!signal.wait_timeout(Duration::from_millis(10)));
        let clone = signal.clone();
        clone.fire();
        assert!(signal.wait_timeout(Duration::from_millis(10)));
        signal.wait();
    }

    #[test]
    fn gate_any_of_nothing_is_none() {
        assert!(gate_any(Vec::new()).unwrap().is_none());
    }

    #[test]
    fn gate_any_of_one_is_the_input() {
        let signal = Signal::new();
        let gate = gate_any([signal.clone()]).unwrap().unwrap();
        assert!(gate.same_as(&signal));
    }

    #[test]
    fn gate_any_fires_with_the_earliest_input() {
        let delays = (1..=10).map(|j| Duration::from_millis(j * 200));
        let mut signals: Vec<Signal> = delays.map(signal_after).collect();
        signals.push(signal_after(Duration::from_millis(5)));

        let start = Instant::now();
        let gate = gate_any(signals).unwrap().unwrap();
        assert!(gate.wait_timeout(Duration::from_secs(5)));
        let elapsed = start.elapsed();
        assert!(
            elapsed < Duration::from_millis(150),
            "{elapsed:?} elapsed, expected the 5ms input to win"
        );
    }

    #[test]
    fn gate_any_releases_watchers() {
        let pending: Vec<Signal> = (0..8).map(|_| Signal::new()).collect();
        let trigger = Signal::new();
        let mut inputs = pending.clone();
        inputs.push(trigger.clone());

        let gate = gate_any(inputs).unwrap().unwrap();
        assert!(!gate.is_fired());
        trigger.fire();
        gate.wait();

        // Every watcher holds a clone of its input until it exits.
        assert!(
            wait_until(Duration::from_secs(5), || pending
                .iter()
                .all(|s| s.handle_count() == 1)),
            "watchers still hold their inputs after the gate fired"
        );
    }

    #[test]
    fn gate_all_waits_for_the_slowest() {
        let signals: Vec<Signal> = (0..5).map(|_| Signal::new()).collect();
        let gate = gate_all(signals.clone()).unwrap();

        for signal in &signals[..4] {
            signal.fire();
        }
        assert!(!gate.wait_timeout(Duration::from_millis(50)));

        signals[4].fire();
        assert!(gate.wait_timeout(Duration::from_secs(5)));
    }

    #[test]
    fn gate_all_with_staggered_inputs() {
        let start = Instant::now();
        let signals = [10, 40, 80].map(|ms| signal_after(Duration::from_millis(ms)));
        let gate = gate_all(signals).unwrap();
        assert!(gate.wait_timeout(Duration::from_secs(5)));
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[test]
    fn gate_all_of_nothing_never_fires() {
        let gate = gate_all(Vec::new()).unwrap();
        assert!(!gate.wait_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn firing_a_gate_releases_its_watchers() {
        let pending: Vec<Signal> = (0..4).map(|_| Signal::new()).collect();
        let gate = gate_all(pending.clone()).unwrap();
        gate.fire();
        assert!(wait_until(Duration::from_secs(5), || pending
            .iter()
            .all(|s| s.handle_count() == 1)));
        assert!(pending.iter().all(|s| !s.is_fired()));
    }

    #[test]
    fn dropping_a_gate_releases_its_watchers() {
        let pending: Vec<Signal> = (0..4).map(|_| Signal::new()).collect();
        drop(gate_all(pending.clone()).unwrap());
        drop(gate_any(pending.clone()).unwrap());
        assert!(
            wait_until(Duration::from_secs(5), || pending
                .iter()
                .all(|s| s.handle_count() == 1)),
            "watchers of a dropped gate are still running"
        );
        assert!(pending.iter().all(|s| !s.is_fired()));
    }
}
