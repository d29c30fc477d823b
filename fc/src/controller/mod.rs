//! Controller: registration ledger, idle watchdog, and the message router
//!
//! The controller is a single polling task. It waits for the first peer to
//! register, serves requests through a [`crate::handler::RequestHandler`],
//! and exits once the last peer deregisters. A deregister with no registered
//! peers, or too long without traffic, aborts the channel with a nonzero code.

mod ledger;
mod router;
mod watchdog;

pub use ledger::{Departure, Ledger, LedgerError};
pub use router::{CHANNEL_EXIT_CODE, Controller, ControllerError, INVARIANT_EXIT_CODE, RouterState, RunSummary};
pub use watchdog::{IDLE_TIMEOUT_EXIT_CODE, Watchdog};
