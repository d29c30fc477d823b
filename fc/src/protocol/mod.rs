//! Wire protocol between engine peers and the controller
//!
//! Self-describing JSON envelopes; see [`Envelope`] for the message set.

mod envelope;
mod types;

pub use envelope::{Decoded, Envelope, EnvelopeError};
pub use types::{AtomData, AtomRecord, ForceDelta, GridDescriptor, GridNode};
