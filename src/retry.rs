//! Retrying fallible operations with exponential backoff.

use std::time::Duration;

use rand::Rng;

use crate::cancel::{CancelToken, Cancelled};

/// Upper bound on the wait between two attempts, unless configured otherwise.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

/// Information passed to the operation on every attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// Zero-based attempt number. `0` is the first call, `1` the first retry, and so on.
    pub number: u32,
    /// How long the controller waited before this attempt.
    pub delay: Duration,
}

/// Retry policy: exponential backoff with additive random jitter.
///
/// Before retry `n` (counting from 0) the controller waits
/// `min(base * 2^n, max_delay) + jitter`, where `jitter` is drawn uniformly from `[0, base)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max_delay: Duration,
    max_retries: u32,
}

impl Backoff {
    /// Creates a policy with the given base delay, 3 retries and a cap of [`DEFAULT_MAX_DELAY`].
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            max_delay: DEFAULT_MAX_DELAY,
            max_retries: 3,
        }
    }

    /// Caps the exponential part of the delay.
    ///
    /// Jitter is added on top of the cap, so actual waits may exceed `max_delay` by up to `base`.
    pub fn max_delay(self, max_delay: Duration) -> Self {
        Self { max_delay, ..self }
    }

    /// Sets how many times a failed operation is retried. `0` means it is called exactly once.
    #[inline]
    pub fn max_retries(self, max_retries: u32) -> Self {
        Self {
            max_retries,
            ..self
        }
    }

    /// Returns the base delay, which is both the first wait and the upper bound on jitter.
    #[inline]
    pub fn base(&self) -> Duration {
        self.base
    }

    /// Returns the deterministic part of the wait before retry `retry`.
    pub fn ceiling(&self, retry: u32) -> Duration {
        1u32.checked_shl(retry)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }

    /// Draws the full wait before retry `retry`.
    pub fn delay<R: Rng + ?Sized>(&self, retry: u32, rng: &mut R) -> Duration {
        let jitter = if self.base.is_zero() {
            Duration::ZERO
        } else {
            rng.gen_range(Duration::ZERO..self.base)
        };
        self.ceiling(retry).saturating_add(jitter)
    }
}

/// Error returned by [`retry`].
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// Every attempt failed. `last` is the error of the final attempt.
    #[error("operation failed after {attempts} attempt(s): {last}")]
    Exhausted {
        /// Number of times the operation was called.
        attempts: u32,
        /// The error returned by the final call.
        last: E,
    },
    /// The token was cancelled before an attempt could start.
    #[error(transparent)]
    Cancelled(#[from] Cancelled),
}

impl<E> RetryError<E> {
    /// Returns the error of the last attempt, if the operation ran out of retries.
    pub fn into_last(self) -> Option<E> {
        match self {
            RetryError::Exhausted { last, .. } => Some(last),
            RetryError::Cancelled(_) => None,
        }
    }
}

/// Calls `op` until it succeeds, waiting between failed attempts as prescribed by `backoff`.
///
/// `op` is called at most `backoff`'s `max_retries + 1` times. `token` is checked before every
/// attempt and interrupts the wait between attempts, so cancellation takes effect without waiting
/// out the current delay. An attempt that is already running is never interrupted.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use fanline::{retry, Backoff, CancelToken};
///
/// let backoff = Backoff::new(Duration::from_millis(1)).max_retries(5);
/// let value = retry(&CancelToken::new(), &backoff, |attempt| {
///     if attempt.number < 2 {
///         Err("not yet")
///     } else {
///         Ok(attempt.number)
///     }
/// })
/// .unwrap();
/// assert_eq!(value, 2);
/// ```
pub fn retry<T, E, F>(token: &CancelToken, backoff: &Backoff, mut op: F) -> Result<T, RetryError<E>>
where
    F: FnMut(Attempt) -> Result<T, E>,
    E: std::fmt::Display,
{
    let mut rng = rand::thread_rng();
    let mut delay = Duration::ZERO;
    for number in 0..=backoff.max_retries {
        token.check()?;
        match op(Attempt { number, delay }) {
            Ok(value) => return Ok(value),
            Err(last) if number == backoff.max_retries => {
                return Err(RetryError::Exhausted {
                    attempts: number + 1,
                    last,
                });
            }
            Err(e) => {
                delay = backoff.delay(number, &mut rng);
                log::debug!("attempt {} failed: {e}; retrying in {delay:?}", number + 1);
                token.sleep(delay)?;
            }
        }
    }
    unreachable!("the final attempt always returns")
}
