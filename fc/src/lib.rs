//! forcectl - controller side of a force-offload protocol
//!
//! A molecular dynamics engine running as one or more peers ships per-atom
//! state to a controller, which answers with force corrections. The
//! controller coordinates any number of peers over a partitioned channel,
//! tracks registrations, and shuts down once the last peer leaves.
//!
//! # Modules
//!
//! - [`protocol`] - Wire envelopes and payload types
//! - [`channel`] - Partitioned channels over memory or Unix sockets
//! - [`controller`] - Registration ledger, watchdog and message router
//! - [`handler`] - Independent-atom, dependent-atom and grid-sampling request handlers
//! - [`client`] - Engine-side peer client
//! - [`lattice`] - Force fields assembled from grid responses
//! - [`config`] - Configuration types and loading
//! - [`cli`] - Command-line interface

pub mod channel;
pub mod cli;
pub mod client;
pub mod config;
pub mod controller;
pub mod handler;
pub mod lattice;
pub mod models;
pub mod protocol;

pub use channel::{Channel, ChannelError, ChannelPair, MemoryWorld, PeerLink, SocketPeer, SocketWorld, World};
pub use client::{ClientError, GridReply, PeerClient};
pub use config::{Config, ControllerConfig, HandlerMode, TransportConfig};
pub use controller::{Controller, ControllerError, RouterState, RunSummary};
pub use handler::{
    BatchModel, DependentAtomHandler, GridSample, GridSamplingHandler, IndependentAtomHandler, Reply, Request,
    RequestHandler,
};
pub use lattice::{ForceField, LatticeError};
pub use protocol::{AtomData, AtomRecord, Envelope, ForceDelta, GridDescriptor, GridNode};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
