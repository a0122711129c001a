//! Bounded parallel mapping.
//!
//! [`PoolBuilder::map`] spreads a batch of independent items over a fixed number of scoped worker
//! threads. The threads borrow the work function from the caller and are all joined before the call
//! returns, so nothing spawned here outlives it.

use std::{io, num::NonZeroUsize, thread};

use crate::{
    drop::trace_thread,
    error::{run_guarded, TaskError},
};

/// Positional outcomes of a pool run: element `i` describes input item `i`.
pub type Outcomes<R, E> = Vec<Result<R, TaskError<E>>>;

/// A builder object that can be used to configure a bounded worker pool.
#[derive(Clone, Debug)]
pub struct PoolBuilder {
    name: Option<String>,
    workers: usize,
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self {
            name: None,
            workers: thread::available_parallelism().map_or(1, NonZeroUsize::get),
        }
    }
}

impl PoolBuilder {
    /// Creates a [`PoolBuilder`] with one worker per available CPU.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the base name of the worker threads.
    ///
    /// Each thread spawned will be named according to this base name and its index.
    pub fn name<N: Into<String>>(self, name: N) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    /// Sets the number of concurrent workers. A count of 0 is treated as 1.
    #[inline]
    pub fn workers(self, workers: usize) -> Self {
        Self { workers, ..self }
    }

    /// Applies `work` to every item of `input` on the pool and returns the outcomes.
    ///
    /// Element `i` of the returned vector is the outcome for `input[i]`, regardless of which worker
    /// processed it or when. A failing or panicking item is reported at its own index and does not
    /// affect any other item.
    ///
    /// The only error returned directly is a failure to spawn a worker thread.
    pub fn map<T, R, E, F>(&self, input: Vec<T>, work: F) -> io::Result<Outcomes<R, E>>
    where
        T: Send,
        R: Send,
        E: Send,
        F: Fn(T) -> Result<R, E> + Sync,
    {
        let len = input.len();
        if len == 0 {
            return Ok(Vec::new());
        }
        let count = self.workers.clamp(1, len);

        // The queue can hold every item, so it is filled up front and closed.
        let (jobs, queue) = crossbeam_channel::bounded(len);
        for job in input.into_iter().enumerate() {
            jobs.send(job).expect("queue has room for every item");
        }
        drop(jobs);

        let (results, collected) = crossbeam_channel::bounded(0);
        let work = &work;
        thread::scope(|s| -> io::Result<Outcomes<R, E>> {
            for i in 0..count {
                let queue = queue.clone();
                let results = results.clone();
                let label = match &self.name {
                    Some(name) => format!("{name}-{i}"),
                    None => format!("pool-{i}"),
                };
                let mut builder = thread::Builder::new();
                if self.name.is_some() {
                    builder = builder.name(label.clone());
                }
                builder.spawn_scoped(s, move || {
                    let _guard = trace_thread("pool worker", label);
                    for (index, item) in queue {
                        let outcome = run_guarded(|| work(item));
                        if results.send((index, outcome)).is_err() {
                            break;
                        }
                    }
                })?;
            }
            // Only workers hold senders now; `collected` closes when the last one exits.
            drop(results);

            let mut slots: Vec<Option<Result<R, TaskError<E>>>> = (0..len).map(|_| None).collect();
            for (index, outcome) in collected {
                slots[index] = Some(outcome);
            }
            Ok(slots
                .into_iter()
                .map(|slot| slot.expect("every item reports exactly once"))
                .collect())
        })
    }
}

/// Applies `work` to every item of `input` using `workers` concurrent threads.
///
/// This is a shorthand for [`PoolBuilder::new().workers(workers).map(input, work)`][PoolBuilder::map].
pub fn parallel_map<T, R, E, F>(
    input: Vec<T>,
    workers: usize,
    work: F,
) -> io::Result<Outcomes<R, E>>
where
    T: Send,
    R: Send,
    E: Send,
    F: Fn(T) -> Result<R, E> + Sync,
{
    PoolBuilder::new().workers(workers).map(input, work)
}
