//! Thread-based fan-out/fan-in building blocks with cooperative cancellation.
//!
//! (this library runs everything on OS threads and blocking channels; if you need to juggle large
//! numbers of I/O-bound tasks rather than a moderate number of CPU-bound ones, you're probably
//! better served by an `async` runtime)
//!
//! # Overview
//!
//! - [`Signal`] is a one-shot broadcast event. [`gate_all`] and [`gate_any`] combine several of
//!   them into one that fires when all or any of the inputs have fired.
//! - [`CancelToken`] carries cancellation requests and deadlines. Tokens form a tree: cancelling a
//!   token cancels everything derived from it via [`CancelToken::child`].
//! - [`parallel_map`] and [`PoolBuilder`] apply a function to a batch of items on a bounded number
//!   of threads and return the outcomes in input order.
//! - [`Pipeline`] chains transformation stages, each with its own worker count, and stops early
//!   when a stage fails or the caller cancels.
//! - [`merge_sorted`], [`fan_in`] and [`generate`] produce [`Stream`]s from other channels or
//!   iterators.
//! - [`retry`] repeats a fallible operation with exponential backoff and jitter according to a
//!   [`Backoff`] policy.
//!
//! # Structured concurrency
//!
//! No thread started by this library outlives the value that started it. [`parallel_map`] and
//! [`Pipeline::run`] join all of their threads before returning. A [`Stream`] owns its producers
//! and cancels and joins them when dropped. Gate watchers exit as soon as the gate fires or every
//! handle to it is dropped.
//!
//! Panics in user-supplied work functions are caught and reported as [`TaskError::Panicked`]
//! instead of tearing down the calling thread. Panics anywhere else are propagated to whoever
//! joins the panicking thread.
//!
//! # Logging
//!
//! Thread lifecycle events are logged at `trace` level, and recovered failures (panicking work
//! functions, failed pipeline stages, retried attempts) at `debug` or `warn` level, using the
//! [`log`] facade. Install any `log`-compatible logger to see them.
//!
//! # Usage
//!
//! Squaring numbers on 4 threads:
//!
//! ```
//! use fanline::parallel_map;
//!
//! let outcomes = parallel_map((1..=8).collect(), 4, |x: u64| Ok::<_, ()>(x * x)).unwrap();
//! let squares: Vec<u64> = outcomes.into_iter().map(Result::unwrap).collect();
//! assert_eq!(squares, [1, 4, 9, 16, 25, 36, 49, 64]);
//! ```
//!
//! Waiting for the first of several signals:
//!
//! ```
//! use fanline::{gate_any, Signal};
//!
//! let fast = Signal::new();
//! let slow = Signal::new();
//! let first = gate_any(vec![fast.clone(), slow.clone()]).unwrap().unwrap();
//!
//! fast.fire();
//! first.wait();
//! assert!(!slow.is_fired());
//! ```
//!
//! [`log`]: https://crates.io/crates/log

mod background;
mod cancel;
mod drop;
mod error;
mod pipeline;
mod pool;
mod retry;
mod signal;
mod stream;

pub use cancel::{CancelToken, Cancelled};
pub use error::TaskError;
pub use pipeline::{Pipeline, PipelineError, PipelineRun};
pub use pool::{parallel_map, Outcomes, PoolBuilder};
pub use retry::{retry, Attempt, Backoff, RetryError, DEFAULT_MAX_DELAY};
pub use signal::{gate_all, gate_any, Signal};
pub use stream::{fan_in, generate, merge_sorted, Stream};
