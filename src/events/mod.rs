//! Runtime event plumbing.
//!
//! - [`Bus`]: bounded broadcast channel shared by the service supervisor,
//!   the sequencer, and the controller runtime.
//! - [`Event`] / [`EventKind`]: lifecycle events with global monotonic
//!   sequence numbers.
//!
//! Event delivery is fire-and-forget: the runtime operates correctly with no
//! subscribers at all, and slow subscribers may observe `Lagged`.

mod bus;
mod event;

pub use bus::Bus;
pub use event::{Event, EventKind};
