//! Owned value streams: sources, ordered merges and unordered fan-in.
//!
//! Every function here spawns the threads that produce a [`Stream`] and hands them to it. The
//! stream owns them from then on: dropping it cancels its token and joins every producer, so a
//! stream never leaves threads behind.
//!
//! Inputs are plain [`crossbeam_channel::Receiver`]s. A stream's own receiver can be borrowed with
//! [`Stream::receiver`] to feed it into another merge.
//!
//! # Examples
//!
//! ```
//! use fanline::{merge_sorted, CancelToken};
//!
//! let token = CancelToken::new();
//! let odd = crossbeam_channel::unbounded();
//! let even = crossbeam_channel::unbounded();
//! for i in 0..5 {
//!     odd.0.send(2 * i + 1).unwrap();
//!     even.0.send(2 * i).unwrap();
//! }
//! drop((odd.0, even.0));
//!
//! let merged: Vec<i32> = merge_sorted(&token, vec![odd.1, even.1]).unwrap().collect();
//! assert_eq!(merged, (0..10).collect::<Vec<_>>());
//! ```

use std::io;

use crossbeam_channel::{Receiver, Sender};

use crate::{background::Background, cancel::CancelToken};

/// A stream of values produced by background threads.
///
/// Iterating yields values until every producer has finished or the stream's token is cancelled.
pub struct Stream<T> {
    receiver: Receiver<T>,
    token: CancelToken,
    threads: Vec<Background<()>>,
}

impl<T> Drop for Stream<T> {
    fn drop(&mut self) {
        // Producers blocked on a send or receive wake up on cancellation; `threads` is joined
        // right after.
        self.token.cancel();
    }
}

impl<T> Stream<T> {
    fn new(token: &CancelToken) -> (Self, Sender<T>) {
        let (tx, rx) = crossbeam_channel::bounded(0);
        let stream = Self {
            receiver: rx,
            token: token.child(),
            threads: Vec::new(),
        };
        (stream, tx)
    }

    fn spawn<F>(&mut self, name: String, f: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.threads.push(Background::spawn(name, f)?);
        Ok(())
    }

    /// Blocks until the next value is available.
    ///
    /// Returns [`None`] once the stream is exhausted or cancelled.
    pub fn recv(&self) -> Option<T> {
        self.receiver.recv().ok()
    }

    /// Returns the underlying receiver, e.g. to use it in a [`crossbeam_channel::select!`].
    pub fn receiver(&self) -> &Receiver<T> {
        &self.receiver
    }

    /// Stops the producers. Values already handed over are still delivered.
    pub fn cancel(&self) {
        self.token.cancel();
    }
}

impl<T> Iterator for Stream<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.recv()
    }
}

/// Returns a stream yielding `items` in order.
///
/// The producer hands over one item at a time and stops early when `token` is cancelled, so
/// `items` may be unbounded.
pub fn generate<T, I>(token: &CancelToken, items: I) -> io::Result<Stream<T>>
where
    T: Send + 'static,
    I: IntoIterator<Item = T> + Send + 'static,
{
    let (mut stream, tx) = Stream::new(token);
    let token = stream.token.clone();
    stream.spawn("generate".into(), move || {
        for item in items {
            if !token.send(&tx, item) {
                break;
            }
        }
    })?;
    Ok(stream)
}

/// Merges individually sorted streams into one sorted stream.
///
/// Each input must yield values in non-decreasing order. The merge keeps one head value per input
/// and always emits the smallest head, breaking ties in favor of the input listed first, then
/// refills that head from the same input. Exhausted inputs drop out; the output ends when all of
/// them are exhausted, or early when `token` is cancelled.
pub fn merge_sorted<T>(token: &CancelToken, streams: Vec<Receiver<T>>) -> io::Result<Stream<T>>
where
    T: Ord + Send + 'static,
{
    let (mut stream, tx) = Stream::new(token);
    let token = stream.token.clone();
    stream.spawn("merge-sorted".into(), move || {
        merge_heads(&token, &streams, &tx);
    })?;
    Ok(stream)
}

fn merge_heads<T: Ord>(token: &CancelToken, streams: &[Receiver<T>], out: &Sender<T>) {
    // `None` marks an exhausted input.
    let mut heads = Vec::with_capacity(streams.len());
    for stream in streams {
        let Ok(head) = token.recv(stream) else {
            return;
        };
        heads.push(head);
    }

    loop {
        // `min_by` keeps the first of several equal elements, i.e. the lowest stream index.
        let next = heads
            .iter()
            .enumerate()
            .filter_map(|(i, head)| head.as_ref().map(|value| (i, value)))
            .min_by(|a, b| a.1.cmp(b.1))
            .map(|(i, _)| i);
        let Some(index) = next else {
            log::trace!("all {} inputs exhausted", streams.len());
            return;
        };

        if let Some(value) = heads[index].take() {
            if !token.send(out, value) {
                return;
            }
        }
        match token.recv(&streams[index]) {
            Ok(head) => heads[index] = head,
            Err(_) => return,
        }
    }
}

/// Forwards values from every input into one stream, in arrival order.
///
/// One forwarding thread is spawned per input. The output ends once every input is exhausted, or
/// early when `token` is cancelled.
pub fn fan_in<T>(token: &CancelToken, streams: Vec<Receiver<T>>) -> io::Result<Stream<T>>
where
    T: Send + 'static,
{
    let (mut stream, tx) = Stream::new(token);
    for (i, input) in streams.into_iter().enumerate() {
        let tx = tx.clone();
        let token = stream.token.clone();
        // On failure `stream` is dropped, which cancels and joins the forwarders spawned so far.
        stream.spawn(format!("fan-in-{i}"), move || {
            while let Ok(Some(value)) = token.recv(&input) {
                if !token.send(&tx, value) {
                    break;
                }
            }
        })?;
    }
    Ok(stream)
}
