//! Backoff strategies applied between failed attempts of a job.
//!
//! Two strategies are provided:
//!
//! 1. Exponential, the default for image jobs: the delay before retrying after attempt `n` is
//!    `base * 2^(n-1)`.
//! 2. Fixed: always the same delay.
//!
//! Either can be modified by applying a [`Jitter`], a maximum and a minimum delay. All of the
//! constructors and configuration functions are `const`.
//!
//! # Example
//!
//! ```
//! # use imagequeue::prelude::*;
//! # use chrono::TimeDelta;
//! let strategy = BackoffStrategy::exponential(TimeDelta::seconds(1))
//!     .with_max(TimeDelta::seconds(5));
//!
//! assert_eq!(strategy.backoff(1), TimeDelta::seconds(1));
//! assert_eq!(strategy.backoff(2), TimeDelta::seconds(2));
//! assert_eq!(strategy.backoff(3), TimeDelta::seconds(4));
//! assert_eq!(strategy.backoff(4), TimeDelta::seconds(5));
//! ```

use chrono::TimeDelta;
use rand::Rng;

/// Type that can be used to implement a backoff strategy.
pub trait Strategy {
    /// Given the number of the attempt that just failed, returns the [`TimeDelta`] to wait
    /// before the job should be retried.
    fn backoff(&self, attempt: u16) -> TimeDelta;
}

/// Fixed backoff strategy.
///
/// Always returns the same value no matter what the attempt is.
///
/// __Note:__ This type cannot be constructed directly, instead [`BackoffStrategy::fixed`]
/// should be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fixed {
    delay: TimeDelta,
}

impl Strategy for Fixed {
    fn backoff(&self, _attempt: u16) -> TimeDelta {
        self.delay
    }
}

/// Exponential backoff strategy.
///
/// Doubles with each attempt starting from `base` after the first attempt. It is also possible
/// to cap the backoff using [`BackoffStrategy::with_max`].
///
/// __Note:__ This type cannot be constructed directly, instead [`BackoffStrategy::exponential`]
/// should be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exponential {
    base: TimeDelta,
    max: Option<TimeDelta>,
}

impl Strategy for Exponential {
    fn backoff(&self, attempt: u16) -> TimeDelta {
        let exponent = u32::from(attempt.saturating_sub(1));
        let mut backoff = 2_i32
            .checked_pow(exponent)
            .and_then(|factor| self.base.checked_mul(factor))
            .unwrap_or(TimeDelta::MAX);
        if let Some(max) = self.max {
            backoff = backoff.min(max);
        }
        backoff
    }
}

/// A random jitter to be applied to a given backoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// A random jitter to be added to the backoff in the range `-delta =< jitter =< delta`.
    Absolute(TimeDelta),
    /// A random jitter to be added as a proportion of the current backoff.
    Relative(f64),
}

impl Jitter {
    fn apply_jitter(&self, value: TimeDelta) -> TimeDelta {
        let milliseconds = match self {
            Self::Absolute(delta) => delta.num_milliseconds().abs(),
            Self::Relative(ratio) => (value.num_milliseconds() as f64 * ratio).round().abs() as i64,
        };
        let rand_jitter = rand::thread_rng().gen_range(-milliseconds..=milliseconds);
        value
            .checked_add(&TimeDelta::milliseconds(rand_jitter))
            .unwrap_or(value)
    }
}

/// A backoff strategy with optional jitter and bounds.
///
/// # Example
///
/// ```
/// # use imagequeue::prelude::*;
/// # use chrono::TimeDelta;
/// let strategy = BackoffStrategy::fixed(TimeDelta::seconds(20))
///     .with_jitter(Jitter::Absolute(TimeDelta::seconds(10)));
///
/// assert!(strategy.backoff(1) >= TimeDelta::seconds(10));
/// assert!(strategy.backoff(1) <= TimeDelta::seconds(30));
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffStrategy<T: Strategy> {
    strategy: T,
    jitter: Option<Jitter>,
    min: TimeDelta,
}

impl BackoffStrategy<Fixed> {
    /// Creates a [`BackoffStrategy`] that always waits `delay`.
    pub const fn fixed(delay: TimeDelta) -> Self {
        Self::new(Fixed { delay })
    }
}

impl BackoffStrategy<Exponential> {
    /// Creates a [`BackoffStrategy`] waiting `base * 2^(attempt-1)`.
    ///
    /// ```
    /// # use imagequeue::prelude::*;
    /// # use chrono::TimeDelta;
    /// let strategy = BackoffStrategy::exponential(TimeDelta::milliseconds(1000));
    ///
    /// assert_eq!(strategy.backoff(1), TimeDelta::milliseconds(1000));
    /// assert_eq!(strategy.backoff(2), TimeDelta::milliseconds(2000));
    /// assert_eq!(strategy.backoff(3), TimeDelta::milliseconds(4000));
    /// ```
    pub const fn exponential(base: TimeDelta) -> Self {
        Self::new(Exponential { base, max: None })
    }

    /// Clamps the maximum value to be returned by [`Strategy::backoff`] to `max_delay`.
    pub const fn with_max(mut self, max_delay: TimeDelta) -> Self {
        self.strategy.max = Some(max_delay);
        self
    }
}

impl<T> BackoffStrategy<T>
where
    T: Strategy,
{
    /// Creates a [`BackoffStrategy`] with a the given backoff strategy.
    ///
    /// More commonly constructed via [`BackoffStrategy::exponential`] or
    /// [`BackoffStrategy::fixed`].
    pub const fn new(strategy: T) -> Self {
        Self {
            strategy,
            jitter: None,
            min: TimeDelta::zero(),
        }
    }

    /// Add a jitter to the backoff strategy see [`Jitter`] for more information about how this
    /// affects the strategy.
    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// Add a minimum value. This can be useful when you have a particularly large jitter and would
    /// like to avoid a delay of less than a given amount.
    pub const fn with_min(mut self, min: TimeDelta) -> Self {
        self.min = min;
        self
    }
}

impl<T> Strategy for BackoffStrategy<T>
where
    T: Strategy,
{
    fn backoff(&self, attempt: u16) -> TimeDelta {
        let mut backoff = self.strategy.backoff(attempt);

        if let Some(jitter) = self.jitter {
            backoff = jitter.apply_jitter(backoff);
        }

        backoff.max(self.min)
    }
}

/// The backoff policy stored on each job.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BackoffPolicy {
    /// See [`BackoffStrategy::exponential`].
    Exponential(BackoffStrategy<Exponential>),
    /// See [`BackoffStrategy::fixed`].
    Fixed(BackoffStrategy<Fixed>),
}

impl BackoffPolicy {
    /// Exponential backoff with a base delay of one second.
    pub const DEFAULT: Self =
        Self::Exponential(BackoffStrategy::exponential(TimeDelta::milliseconds(1000)));
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl Strategy for BackoffPolicy {
    fn backoff(&self, attempt: u16) -> TimeDelta {
        match self {
            Self::Exponential(strategy) => strategy.backoff(attempt),
            Self::Fixed(strategy) => strategy.backoff(attempt),
        }
    }
}

impl From<BackoffStrategy<Exponential>> for BackoffPolicy {
    fn from(value: BackoffStrategy<Exponential>) -> Self {
        Self::Exponential(value)
    }
}

impl From<BackoffStrategy<Fixed>> for BackoffPolicy {
    fn from(value: BackoffStrategy<Fixed>) -> Self {
        Self::Fixed(value)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fixed_backoff() {
        let delay = TimeDelta::minutes(1);
        let strategy = BackoffStrategy::fixed(delay);

        for i in 1..100 {
            assert_eq!(strategy.backoff(i), delay);
        }
    }

    #[test]
    fn fixed_backoff_with_absolute_jitter() {
        let delay = TimeDelta::minutes(1);
        let jitter = TimeDelta::seconds(10);
        let strategy = BackoffStrategy::fixed(delay).with_jitter(Jitter::Absolute(jitter));

        for i in 1..100 {
            let backoff = strategy.backoff(i);
            assert!(backoff >= delay - jitter);
            assert!(backoff <= delay + jitter);
        }
    }

    #[test]
    fn fixed_backoff_with_jitter_min() {
        let delay = TimeDelta::seconds(20);
        let jitter = TimeDelta::seconds(20);
        let min = TimeDelta::seconds(5);
        let strategy = BackoffStrategy::fixed(delay)
            .with_jitter(Jitter::Absolute(jitter))
            .with_min(min);

        for i in 1..100 {
            let backoff = strategy.backoff(i);
            assert!(backoff >= min);
            assert!(backoff <= delay + jitter);
        }
    }

    #[test]
    fn exponential_backoff() {
        let base = TimeDelta::milliseconds(1000);
        let strategy = BackoffStrategy::exponential(base);

        for i in 1..10 {
            assert_eq!(
                strategy.backoff(i).num_milliseconds(),
                1000 * 2_i64.pow(u32::from(i) - 1)
            );
        }
    }

    #[test]
    fn exponential_backoff_treats_attempt_zero_as_first() {
        let base = TimeDelta::milliseconds(250);
        let strategy = BackoffStrategy::exponential(base);

        assert_eq!(strategy.backoff(0), base);
    }

    #[test]
    fn exponential_backoff_saturates() {
        let strategy = BackoffStrategy::exponential(TimeDelta::days(1));

        assert_eq!(strategy.backoff(u16::MAX), TimeDelta::MAX);
    }

    #[test]
    fn exponential_backoff_with_max() {
        let delay = TimeDelta::minutes(1);
        let max = TimeDelta::minutes(10);
        let strategy = BackoffStrategy::exponential(delay).with_max(max);

        for i in 1..100 {
            let backoff = strategy.backoff(i);
            assert!(backoff <= max);
        }
    }

    #[test]
    fn exponential_backoff_with_relative_jitter() {
        let delay = TimeDelta::minutes(1);
        let strategy = BackoffStrategy::exponential(delay).with_jitter(Jitter::Relative(0.1));

        for i in 1..5 {
            let backoff = strategy.backoff(i).num_milliseconds() as f64;
            let expected = delay.num_milliseconds() as f64 * 2_f64.powi(i32::from(i) - 1);
            assert!(backoff >= expected * 0.9);
            assert!(backoff <= expected * 1.1);
        }
    }

    #[test]
    fn default_policy() {
        let policy = BackoffPolicy::default();

        assert_eq!(policy.backoff(1), TimeDelta::seconds(1));
        assert_eq!(policy.backoff(2), TimeDelta::seconds(2));
        assert_eq!(policy.backoff(3), TimeDelta::seconds(4));
    }

    #[test]
    fn policy_from_fixed() {
        let policy: BackoffPolicy = BackoffStrategy::fixed(TimeDelta::milliseconds(5)).into();

        assert_eq!(policy.backoff(1), TimeDelta::milliseconds(5));
        assert_eq!(policy.backoff(7), TimeDelta::milliseconds(5));
    }
}
