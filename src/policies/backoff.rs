//! # Backoff policy for restart delays.
//!
//! [`BackoffPolicy`] controls how restart delays grow after repeated
//! failures. It is parameterized by:
//! - [`BackoffPolicy::first`] the initial delay;
//! - [`BackoffPolicy::max`] the maximum delay cap;
//! - [`BackoffPolicy::factor`] the multiplicative growth factor.
//!
//! The default policy matches the service restart discipline: 100 ms doubling
//! up to 60 s. Consecutive delays form a non-decreasing sequence bounded by
//! `max`; the consumer resets the sequence (passes `prev = None`) after a
//! sufficiently long clean run.
//!
//! # Example
//! ```rust
//! use std::time::Duration;
//! use nodevisor::policies::BackoffPolicy;
//!
//! let backoff = BackoffPolicy::default();
//!
//! assert_eq!(backoff.next(None), Duration::from_millis(100));
//! assert_eq!(
//!     backoff.next(Some(Duration::from_millis(100))),
//!     Duration::from_millis(200),
//! );
//! // Capped at max once the doubling overshoots.
//! assert_eq!(
//!     backoff.next(Some(Duration::from_secs(50))),
//!     Duration::from_secs(60),
//! );
//! ```

use std::time::Duration;

use crate::policies::jitter::JitterPolicy;

/// Restart backoff policy.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    /// Initial delay before the first restart.
    pub first: Duration,
    /// Maximum delay cap.
    pub max: Duration,
    /// Multiplicative growth factor (`>= 1.0` recommended).
    pub factor: f64,
    /// Jitter policy applied to the computed delay.
    pub jitter: JitterPolicy,
}

impl Default for BackoffPolicy {
    /// Returns the service restart policy:
    /// - `first = 100ms`;
    /// - `max = 60s`;
    /// - `factor = 2.0` (doubling);
    /// - no jitter.
    fn default() -> Self {
        Self {
            first: Duration::from_millis(100),
            max: Duration::from_secs(60),
            factor: 2.0,
            jitter: JitterPolicy::None,
        }
    }
}

impl BackoffPolicy {
    /// Policy used for controller restarts: 500 ms doubling up to 30 s with
    /// equal jitter, so independently failing controllers do not synchronize.
    pub fn controller() -> Self {
        Self {
            first: Duration::from_millis(500),
            max: Duration::from_secs(30),
            factor: 2.0,
            jitter: JitterPolicy::Equal,
        }
    }

    /// Computes the next delay based on the previous one.
    ///
    /// - If `prev` is `None`, returns `first` clamped to `max`.
    /// - Otherwise multiplies the previous delay by [`BackoffPolicy::factor`]
    ///   and caps it at [`BackoffPolicy::max`].
    pub fn next(&self, prev: Option<Duration>) -> Duration {
        let unclamped = match prev {
            None => self.first,
            Some(d) => {
                let mul = d.as_secs_f64() * self.factor;
                if !mul.is_finite() {
                    self.max
                } else {
                    d.mul_f64(self.factor)
                }
            }
        };

        let base = if unclamped > self.max {
            self.max
        } else {
            unclamped
        };

        match self.jitter {
            JitterPolicy::Decorrelated => {
                let prev_for_jitter = prev.unwrap_or(self.first.min(self.max));
                self.jitter
                    .apply_decorrelated(self.first.min(self.max), prev_for_jitter, self.max)
            }
            _ => self.jitter.apply(base),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_and_caps() {
        let b = BackoffPolicy::default();
        let mut prev = None;
        let mut delays = Vec::new();

        for _ in 0..12 {
            let d = b.next(prev);
            delays.push(d);
            prev = Some(d);
        }

        // Non-decreasing and bounded by the cap.
        for w in delays.windows(2) {
            assert!(w[0] <= w[1]);
        }
        assert_eq!(*delays.last().unwrap(), Duration::from_secs(60));
        assert_eq!(delays[0], Duration::from_millis(100));
        assert_eq!(delays[1], Duration::from_millis(200));
    }
}
