//! # Jitter policy for restart delays.
//!
//! [`JitterPolicy`] adds randomness to backoff delays so that independent
//! restart loops (many controllers failing on the same root cause) do not
//! retry in lockstep.
//!
//! - [`JitterPolicy::None`] no randomization, predictable delays
//! - [`JitterPolicy::Full`] random delay in [0, delay]
//! - [`JitterPolicy::Equal`] delay/2 + random[0, delay/2]
//! - [`JitterPolicy::Decorrelated`] stateful jitter based on previous delay

use std::time::Duration;

use rand::Rng;

/// Policy controlling randomization of restart delays.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JitterPolicy {
    /// No jitter: use the exact backoff delay.
    None,

    /// Full jitter: random delay in [0, delay].
    Full,

    /// Equal jitter: delay/2 + random[0, delay/2].
    ///
    /// Preserves ~75% of the original backoff on average.
    Equal,

    /// Decorrelated jitter: delay = random[base, prev * 3], capped at `max`.
    ///
    /// Requires context via [`apply_decorrelated`](Self::apply_decorrelated).
    Decorrelated,
}

impl Default for JitterPolicy {
    /// Returns [`JitterPolicy::None`].
    fn default() -> Self {
        JitterPolicy::None
    }
}

impl JitterPolicy {
    /// Applies jitter to the given delay.
    ///
    /// For `Decorrelated`, this method returns the input unchanged; use
    /// [`apply_decorrelated`](Self::apply_decorrelated) instead.
    pub fn apply(&self, delay: Duration) -> Duration {
        match self {
            JitterPolicy::None => delay,
            JitterPolicy::Full => full_jitter(delay),
            JitterPolicy::Equal => equal_jitter(delay),
            JitterPolicy::Decorrelated => delay,
        }
    }

    /// Applies decorrelated jitter with full context.
    ///
    /// - `base`: minimal delay (usually the initial backoff)
    /// - `prev`: previous actual delay
    /// - `max`: maximum cap
    pub fn apply_decorrelated(&self, base: Duration, prev: Duration, max: Duration) -> Duration {
        if !matches!(self, JitterPolicy::Decorrelated) {
            return self.apply(base);
        }

        let mut rng = rand::rng();
        let base_ms = (base.as_millis().min(u128::from(u64::MAX))) as u64;
        let prev_ms = (prev.as_millis().min(u128::from(u64::MAX))) as u64;
        let max_ms = (max.as_millis().min(u128::from(u64::MAX))) as u64;

        let upper_bound = prev_ms.saturating_mul(3).min(max_ms);
        let clamped_upper = upper_bound.max(base_ms);
        if base_ms >= clamped_upper {
            return base;
        }

        let jittered_ms = rng.random_range(base_ms..=clamped_upper);
        Duration::from_millis(jittered_ms)
    }
}

/// Full jitter: random in [0, delay].
fn full_jitter(delay: Duration) -> Duration {
    let mut rng = rand::rng();
    let ms = (delay.as_millis().min(u128::from(u64::MAX))) as u64;
    if ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rng.random_range(0..=ms))
}

/// Equal jitter: delay/2 + random[0, delay/2].
fn equal_jitter(delay: Duration) -> Duration {
    let mut rng = rand::rng();
    let ms = (delay.as_millis().min(u128::from(u64::MAX))) as u64;
    if ms == 0 {
        return Duration::ZERO;
    }
    let half = ms / 2;
    let jitter = if half == 0 {
        0
    } else {
        rng.random_range(0..=half)
    };
    Duration::from_millis(half + jitter)
}
