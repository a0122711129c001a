//! Cancellable multi-stage pipelines.
//!
//! A [`Pipeline`] chains several bounded worker pools. Item `i` of the input flows through every
//! stage in order, carrying its index along so the final outputs can be written back positionally.
//!
//! Stages are connected by unbuffered (rendezvous) channels, so a fast stage blocks on a slow one
//! instead of queueing ahead of it. The first error or panic in any stage cancels a pipeline-local
//! [`CancelToken`]; every worker then stops pulling new items. Items already in flight are
//! finished, or abandoned early by transforms that watch the token they are given. No item is ever
//! processed twice.
//!
//! # Examples
//!
//! ```
//! use fanline::{CancelToken, Pipeline};
//!
//! let token = CancelToken::new();
//! let run = Pipeline::new()
//!     .name("parse")
//!     .stage(2, |_, s: String| s.trim().parse::<i64>().map_err(|e| e.to_string()))
//!     .stage(2, |_, n: i64| Ok(n * 10))
//!     .run(&token, vec![" 1".to_string(), "2 ".to_string(), "3".to_string()])
//!     .unwrap();
//!
//! assert!(run.is_complete());
//! assert_eq!(run.outputs, [Some(10), Some(20), Some(30)]);
//! ```

use std::{io, sync::Arc};

use crossbeam_channel::{Receiver, Sender};

use crate::{
    background::Background,
    cancel::{CancelToken, Cancelled},
    error::{run_guarded, TaskError},
};

/// An error raised by one item in one stage of a [`Pipeline`].
#[derive(Debug, thiserror::Error)]
#[error("stage {stage} failed on item {index}: {error}")]
pub struct PipelineError<E> {
    /// Zero-based position of the failing stage.
    pub stage: usize,
    /// Index of the input item that failed.
    pub index: usize,
    /// What the stage's transform returned, or the message it panicked with.
    pub error: TaskError<E>,
}

/// The result of [`Pipeline::run`].
#[derive(Debug)]
pub struct PipelineRun<O, E> {
    /// `outputs[i]` holds the final output for input item `i`, or [`None`] if that item failed or
    /// was abandoned because the pipeline was cancelled.
    pub outputs: Vec<Option<O>>,
    /// Every stage error, in the order they were observed.
    pub errors: Vec<PipelineError<E>>,
    /// Set if the caller's token was cancelled, distinguishing "we gave up" from "the work itself
    /// failed".
    pub cancelled: Option<Cancelled>,
}

impl<O, E> PipelineRun<O, E> {
    /// Returns whether every item made it through every stage.
    pub fn is_complete(&self) -> bool {
        self.errors.is_empty() && self.outputs.iter().all(Option::is_some)
    }
}

type Link<I, O, E> = Box<
    dyn FnOnce(Receiver<(usize, I)>, &mut Stages<E>) -> io::Result<Receiver<(usize, O)>> + Send,
>;

/// A chain of stages turning `I`s into `O`s, failing with `E`.
///
/// Build one with [`Pipeline::new`] and [`Pipeline::stage`], then execute it with
/// [`Pipeline::run`].
pub struct Pipeline<I, O, E> {
    name: Option<String>,
    link: Link<I, O, E>,
}

impl<I: Send + 'static, E: Send + 'static> Pipeline<I, I, E> {
    /// Creates a pipeline without any stages. Running it returns the input unchanged.
    pub fn new() -> Self {
        Self {
            name: None,
            link: Box::new(|source: Receiver<(usize, I)>, _: &mut Stages<E>| Ok(source)),
        }
    }
}

impl<I: Send + 'static, E: Send + 'static> Default for Pipeline<I, I, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<I, O, E> Pipeline<I, O, E>
where
    I: Send + 'static,
    O: Send + 'static,
    E: Send + 'static,
{
    /// Sets the base name of the pipeline's threads.
    ///
    /// Stage workers are named `{name}-{stage}-{worker}`.
    pub fn name<N: Into<String>>(self, name: N) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    /// Appends a stage that runs `transform` on `workers` threads (0 is treated as 1).
    ///
    /// `transform` is passed the pipeline's own token, which is cancelled by the first failure in
    /// any stage as well as by the caller. Long-running transforms can poll it (or sleep on it) to
    /// abandon an item once its result can no longer be used.
    pub fn stage<P, F>(self, workers: usize, transform: F) -> Pipeline<I, P, E>
    where
        P: Send + 'static,
        F: Fn(&CancelToken, O) -> Result<P, E> + Send + Sync + 'static,
    {
        let upstream = self.link;
        Pipeline {
            name: self.name,
            link: Box::new(move |source: Receiver<(usize, I)>, stages: &mut Stages<E>| {
                let input = upstream(source, stages)?;
                stages.spawn(workers, transform, input)
            }),
        }
    }

    /// Runs every item of `input` through the pipeline.
    ///
    /// Cancelling `token` stops the pipeline early. This method returns only after all of the
    /// pipeline's threads have exited. The only error returned directly is a failure to spawn a
    /// thread; stage failures are reported in [`PipelineRun::errors`].
    pub fn run(self, token: &CancelToken, input: Vec<I>) -> io::Result<PipelineRun<O, E>> {
        let len = input.len();
        let (errors, failures) = crossbeam_channel::unbounded();
        let collector = Background::spawn(thread_label(&self.name, "errors"), move || {
            failures.iter().collect::<Vec<PipelineError<E>>>()
        })?;

        // Declared after `collector`, so on an early return the workers are cancelled and joined
        // (and their error senders dropped) before the collector is joined.
        let mut stages = Stages {
            name: self.name,
            token: token.child(),
            errors,
            threads: Vec::new(),
            count: 0,
        };
        let source = stages.feed(input)?;
        let sink = (self.link)(source, &mut stages)?;

        let mut outputs: Vec<Option<O>> = (0..len).map(|_| None).collect();
        for (index, output) in sink {
            outputs[index] = Some(output);
        }

        drop(stages);
        let errors = collector.join();
        Ok(PipelineRun {
            outputs,
            errors,
            cancelled: token.reason(),
        })
    }
}

fn thread_label(name: &Option<String>, role: &str) -> String {
    match name {
        Some(name) => format!("{name}-{role}"),
        None => format!("pipeline-{role}"),
    }
}

/// The threads and shared state of one pipeline run.
struct Stages<E> {
    name: Option<String>,
    /// Pipeline-local child of the caller's token.
    token: CancelToken,
    errors: Sender<PipelineError<E>>,
    threads: Vec<Background<()>>,
    count: usize,
}

impl<E> Drop for Stages<E> {
    fn drop(&mut self) {
        // Releases every worker still waiting on a channel; `threads` is joined right after.
        self.token.cancel();
    }
}

impl<E: Send + 'static> Stages<E> {
    /// Spawns the source thread that hands input items to the first stage.
    fn feed<I: Send + 'static>(&mut self, input: Vec<I>) -> io::Result<Receiver<(usize, I)>> {
        let (tx, rx) = crossbeam_channel::bounded(0);
        let token = self.token.clone();
        let feeder = Background::spawn(thread_label(&self.name, "feed"), move || {
            for item in input.into_iter().enumerate() {
                if !token.send(&tx, item) {
                    break;
                }
            }
        })?;
        self.threads.push(feeder);
        Ok(rx)
    }

    /// Spawns the workers of the next stage, reading from `input`.
    ///
    /// The returned receiver closes once every worker of the stage has exited: each worker owns a
    /// clone of the only sender.
    fn spawn<A, B, F>(
        &mut self,
        workers: usize,
        transform: F,
        input: Receiver<(usize, A)>,
    ) -> io::Result<Receiver<(usize, B)>>
    where
        A: Send + 'static,
        B: Send + 'static,
        F: Fn(&CancelToken, A) -> Result<B, E> + Send + Sync + 'static,
    {
        let stage = self.count;
        self.count += 1;

        let (tx, rx) = crossbeam_channel::bounded(0);
        let transform = Arc::new(transform);
        for i in 0..workers.max(1) {
            let worker = StageWorker {
                stage,
                input: input.clone(),
                output: tx.clone(),
                errors: self.errors.clone(),
                token: self.token.clone(),
                transform: transform.clone(),
            };
            let label = thread_label(&self.name, &format!("{stage}-{i}"));
            let thread = Background::spawn(label, move || worker.run())?;
            self.threads.push(thread);
        }
        Ok(rx)
    }
}

struct StageWorker<A, B, E, F> {
    stage: usize,
    input: Receiver<(usize, A)>,
    output: Sender<(usize, B)>,
    errors: Sender<PipelineError<E>>,
    token: CancelToken,
    transform: Arc<F>,
}

impl<A, B, E, F> StageWorker<A, B, E, F>
where
    F: Fn(&CancelToken, A) -> Result<B, E>,
{
    fn run(self) {
        while let Ok(Some((index, item))) = self.token.recv(&self.input) {
            match run_guarded(|| (self.transform)(&self.token, item)) {
                Ok(output) => {
                    if !self.token.send(&self.output, (index, output)) {
                        break;
                    }
                }
                Err(error) => {
                    log::debug!(
                        "stage {} failed on item {index}, cancelling pipeline",
                        self.stage
                    );
                    // The collector outlives every worker, so this cannot fail.
                    let _ = self.errors.send(PipelineError {
                        stage: self.stage,
                        index,
                        error,
                    });
                    self.token.cancel();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        thread,
        time::{Duration, Instant},
    };

    use super::*;
    use crate::test::silent_panic;

    #[test]
    fn items_flow_through_every_stage_in_position() {
        let token = CancelToken::new();
        let run = Pipeline::new()
            .stage(3, |_, x: u32| Ok::<_, String>(x + 1))
            .stage(2, |_, x: u32| {
                thread::sleep(Duration::from_micros(50 * u64::from(x % 7)));
                Ok(u64::from(x) * 2)
            })
            .stage(4, |_, x: u64| Ok(format!("<{x}>")))
            .run(&token, (0..50).collect())
            .unwrap();

        assert!(run.is_complete());
        assert_eq!(run.cancelled, None);
        for (i, output) in run.outputs.iter().enumerate() {
            assert_eq!(output.as_deref(), Some(format!("<{}>", (i + 1) * 2).as_str()));
        }
    }

    #[test]
    fn no_stages_is_identity() {
        let run = Pipeline::<_, _, ()>::new()
            .run(&CancelToken::new(), vec!['a', 'b', 'c'])
            .unwrap();
        assert_eq!(run.outputs, [Some('a'), Some('b'), Some('c')]);
    }

    #[test]
    fn empty_input() {
        let run = Pipeline::new()
            .stage(2, |_, x: i32| Ok::<_, ()>(x))
            .run(&CancelToken::new(), Vec::new())
            .unwrap();
        assert!(run.outputs.is_empty());
        assert!(run.is_complete());
    }

    #[test]
    fn first_error_stops_the_pipeline() {
        let processed = Arc::new(AtomicUsize::new(0));
        let counter = processed.clone();
        let token = CancelToken::new();
        let run = Pipeline::new()
            .stage(2, |_, x: usize| Ok(x))
            .stage(2, move |_, x: usize| {
                counter.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(1));
                if x == 3 {
                    Err(format!("item {x} is cursed"))
                } else {
                    Ok(x)
                }
            })
            .run(&token, (0..1000).collect())
            .unwrap();

        assert_eq!(run.errors.len(), 1);
        let error = &run.errors[0];
        assert_eq!((error.stage, error.index), (1, 3));
        assert_eq!(error.error.as_failed().unwrap(), "item 3 is cursed");
        assert_eq!(
            error.to_string(),
            "stage 1 failed on item 3: item 3 is cursed"
        );
        assert!(run.outputs[3].is_none());
        assert!(!run.is_complete());
        assert!(processed.load(Ordering::SeqCst) < 1000);
        // The failure is the pipeline's own, not the caller's.
        assert_eq!(run.cancelled, None);
        assert!(!token.is_cancelled());
    }

    #[test]
    fn in_flight_items_see_a_sibling_failure() {
        let steps = Arc::new(AtomicUsize::new(0));
        let counter = steps.clone();
        let start = Instant::now();
        let run = Pipeline::new()
            .stage(2, move |token: &CancelToken, x: u32| {
                if x == 0 {
                    thread::sleep(Duration::from_millis(10));
                    return Err("item 0 failed");
                }
                for _ in 0..100 {
                    if token.sleep(Duration::from_millis(10)).is_err() {
                        break;
                    }
                    counter.fetch_add(1, Ordering::SeqCst);
                }
                Ok(x)
            })
            .run(&CancelToken::new(), vec![0, 1])
            .unwrap();

        assert!(start.elapsed() < Duration::from_millis(500));
        assert!(steps.load(Ordering::SeqCst) < 50);
        assert_eq!(run.errors.len(), 1);
        assert_eq!(run.errors[0].index, 0);
        assert_eq!(run.outputs, [None, None]);
        assert_eq!(run.cancelled, None);
    }

    #[test]
    fn panics_are_reported_as_stage_errors() {
        let run = Pipeline::new()
            .stage(1, |_, x: i32| {
                if x == 0 {
                    silent_panic("zero".into());
                }
                Ok::<_, ()>(x)
            })
            .run(&CancelToken::new(), vec![0])
            .unwrap();
        assert_eq!(run.errors.len(), 1);
        assert!(run.errors[0].error.is_panic());
        assert_eq!(run.outputs, [None]);
    }

    #[test]
    fn caller_cancellation_returns_promptly() {
        let token = CancelToken::new();
        let canceller = token.clone();
        let bg = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            canceller.cancel();
        });

        let start = Instant::now();
        let run = Pipeline::new()
            .stage(2, |_, x: u32| {
                thread::sleep(Duration::from_millis(10));
                Ok::<_, ()>(x)
            })
            .stage(1, |_, x: u32| Ok(x))
            .run(&token, (0..10_000).collect())
            .unwrap();
        bg.join().unwrap();

        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(run.cancelled, Some(Cancelled::Requested));
        assert!(run.errors.is_empty());
        assert!(run.outputs.iter().any(Option::is_none));
    }

    #[test]
    fn deadline_is_reported() {
        let token = CancelToken::new()
            .with_timeout(Duration::from_millis(30))
            .unwrap();
        let run = Pipeline::new()
            .stage(1, |_, x: u32| {
                thread::sleep(Duration::from_millis(5));
                Ok::<_, ()>(x)
            })
            .run(&token, (0..10_000).collect())
            .unwrap();
        assert_eq!(run.cancelled, Some(Cancelled::DeadlineExceeded));
    }

    #[test]
    fn already_cancelled_token_processes_nothing() {
        let token = CancelToken::new();
        token.cancel();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let run = Pipeline::new()
            .stage(2, move |_, x: u8| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ()>(x)
            })
            .run(&token, vec![1, 2, 3])
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(run.outputs, [None, None, None]);
        assert_eq!(run.cancelled, Some(Cancelled::Requested));
    }

    #[test]
    fn no_item_is_processed_twice() {
        let seen: Arc<Vec<AtomicUsize>> = Arc::new((0..200).map(|_| AtomicUsize::new(0)).collect());
        let counts = seen.clone();
        let run = Pipeline::new()
            .stage(8, move |_, x: usize| {
                counts[x].fetch_add(1, Ordering::SeqCst);
                if x == 150 {
                    Err(())
                } else {
                    Ok(x)
                }
            })
            .run(&CancelToken::new(), (0..200).collect())
            .unwrap();
        assert_eq!(run.errors.len(), 1);
        assert!(seen.iter().all(|n| n.load(Ordering::SeqCst) <= 1));
        for (i, output) in run.outputs.iter().enumerate() {
            if let Some(x) = output {
                assert_eq!(*x, i);
            }
        }
    }

    #[test]
    fn names_stage_threads() {
        let run = Pipeline::new()
            .name("ingest")
            .stage(1, |_, ()| {
                Ok::<_, ()>(thread::current().name().unwrap_or_default().to_owned())
            })
            .run(&CancelToken::new(), vec![()])
            .unwrap();
        assert_eq!(run.outputs, [Some("ingest-0-0".to_string())]);
    }
}
