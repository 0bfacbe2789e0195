//! Policies governing supervised execution:
//!  - [`BackoffPolicy`] for restart delays;
//!  - [`RestartPolicy`] for restart decisions;
//!  - [`JitterPolicy`] for delay randomization.
//!
//! ## Overview
//! - [`backoff`]: compute the next delay after failures with capped
//!   multiplicative growth. Service restarts start at 100 ms and double up to
//!   a 60 s cap; the cap and growth are configurable per consumer.
//! - [`restart`]: decide whether a service or controller is restarted:
//!   *never / always / on failure*.
//! - [`jitter`]: optionally randomize delays so independent restart loops do
//!   not synchronize.

mod backoff;
mod jitter;
mod restart;

pub use backoff::BackoffPolicy;
pub use jitter::JitterPolicy;
pub use restart::RestartPolicy;
