//! Shared building blocks for the messaging core: ids, handler errors and clocks.
//!
//! This crate contains **pure** primitives (no broker, storage or runtime concerns).

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{HandlerError, HandlerResult};
pub use id::{EventId, OutboxEventId};
