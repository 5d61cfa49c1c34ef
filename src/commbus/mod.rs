//! Communication bus: command routing and event pub/sub between modules.
//!
//! All module-to-module and host-to-module calls flow through here:
//!   - **Commands**: name → single owning handler, request/response
//!   - **Events**: fan-out to every subscriber, in subscription order
//!
//! Rows are keyed by owner id, never by module reference, so unloading a
//! module revokes everything it registered in one batch.

mod commands;
mod events;
mod owner;

pub use commands::{CommandHandler, CommandInfo, CommandRegistry, CommandStats, ParkTicket};
pub use events::{
    DeliveryFailure, DeliveryReport, Event, EventBus, EventHandler, EventStats,
};
pub use owner::{drain_all, CallBudget, CallGate, CallOutcome, CallPermit, Lane, OwnerRef};
