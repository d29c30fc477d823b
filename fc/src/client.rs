//! Engine-side peer client
//!
//! Speaks the peer half of the protocol over any [`PeerLink`]: register and
//! wait for the ack, send requests and wait for their responses, deregister.
//! `waiting` envelopes from the controller are skipped while a reply is
//! outstanding.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::channel::{ChannelError, PeerLink};
use crate::lattice::{ForceField, LatticeError};
use crate::protocol::{AtomRecord, Decoded, Envelope, EnvelopeError, ForceDelta, GridDescriptor};

/// Default time to wait for a controller reply
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from the peer side of a conversation
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("No '{expected}' from controller within {timeout:?}")]
    Timeout { expected: &'static str, timeout: Duration },

    #[error("Expected '{expected}', got '{got}'")]
    UnexpectedReply { expected: &'static str, got: String },

    #[error("Sent {sent} atoms but got {got} force deltas back")]
    CountMismatch { sent: usize, got: usize },

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),

    #[error("Bad grid response: {0}")]
    Lattice(#[from] LatticeError),
}

/// A sampled lattice plus how often the controller wants it refreshed
#[derive(Debug, Clone, PartialEq)]
pub struct GridReply {
    pub field: ForceField,
    pub every: Option<u64>,
}

/// Peer end of a controller conversation
pub struct PeerClient<L> {
    link: L,
    timeout: Duration,
    registered: bool,
}

impl<L: PeerLink> PeerClient<L> {
    pub fn new(link: L) -> Self {
        Self {
            link,
            timeout: DEFAULT_REPLY_TIMEOUT,
            registered: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    /// Give back the underlying link
    pub fn into_inner(self) -> L {
        self.link
    }

    /// Announce this peer and wait for the ack
    pub async fn register(&mut self) -> Result<(), ClientError> {
        debug!("PeerClient::register: called");
        self.send(&Envelope::Register).await?;
        match self.await_reply("ack").await? {
            Envelope::Ack => {
                self.registered = true;
                Ok(())
            }
            other => Err(ClientError::UnexpectedReply {
                expected: "ack",
                got: other.kind().to_string(),
            }),
        }
    }

    /// Send one batch of atoms; the result lines up with `atoms` by index
    pub async fn request(&mut self, atoms: Vec<AtomRecord>) -> Result<Vec<ForceDelta>, ClientError> {
        let sent = atoms.len();
        debug!(atoms = sent, "PeerClient::request: called");
        self.send(&Envelope::request(atoms)).await?;

        match self.await_reply("response").await? {
            Envelope::Response { atoms: Some(deltas), .. } => {
                if deltas.len() != sent {
                    return Err(ClientError::CountMismatch {
                        sent,
                        got: deltas.len(),
                    });
                }
                Ok(deltas)
            }
            other => Err(ClientError::UnexpectedReply {
                expected: "response",
                got: other.kind().to_string(),
            }),
        }
    }

    /// Ask for a whole lattice and assemble the result
    pub async fn grid_request(&mut self, grid: GridDescriptor) -> Result<GridReply, ClientError> {
        debug!(counts = ?grid.node_counts, "PeerClient::grid_request: called");
        self.send(&Envelope::GridRequest(grid.clone())).await?;

        match self.await_reply("response").await? {
            Envelope::Response {
                nodes: Some(nodes),
                every,
                ..
            } => Ok(GridReply {
                field: ForceField::from_nodes(&grid, &nodes)?,
                every,
            }),
            other => Err(ClientError::UnexpectedReply {
                expected: "response",
                got: other.kind().to_string(),
            }),
        }
    }

    /// Leave; no reply is expected
    pub async fn deregister(&mut self) -> Result<(), ClientError> {
        debug!("PeerClient::deregister: called");
        self.send(&Envelope::Deregister).await?;
        self.registered = false;
        Ok(())
    }

    async fn send(&mut self, envelope: &Envelope) -> Result<(), ClientError> {
        self.link.send_raw(envelope.encode()?).await?;
        Ok(())
    }

    /// Next non-`waiting` reply; each `waiting` restarts the timeout
    async fn await_reply(&mut self, expected: &'static str) -> Result<Envelope, ClientError> {
        let mut deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let payload = self
                .link
                .recv_raw(remaining)
                .await?
                .ok_or(ClientError::Timeout {
                    expected,
                    timeout: self.timeout,
                })?;

            match Envelope::decode(&payload)? {
                Decoded::Known(Envelope::Waiting) => {
                    debug!("PeerClient: controller still working");
                    deadline = tokio::time::Instant::now() + self.timeout;
                }
                Decoded::Known(envelope) => return Ok(envelope),
                Decoded::Unknown { kind } => {
                    warn!(kind, "PeerClient: skipping unknown message");
                }
            }
        }
    }
}
