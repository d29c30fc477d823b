//! Channel management
//!
//! A [`World`] is the process group peers and controllers share. Splitting it
//! on a partition tag yields a [`Channel`] that only sees traffic addressed to
//! that tag, which keeps controller traffic away from the host application's
//! own messages on the default tag.
//!
//! [`open`] performs the split the controller needs (a discard channel on the
//! default tag plus the work channel on the reserved tag) and hands back a
//! [`ChannelPair`] that must be consumed by either [`ChannelPair::close`] or
//! [`ChannelPair::abort`].

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::protocol::{Envelope, EnvelopeError};

pub mod memory;
pub mod socket;

pub use memory::{ChannelStats, MemoryChannel, MemoryPeer, MemoryWorld};
pub use socket::{SocketChannel, SocketPeer, SocketWorld, partition_socket_path};

/// Tag the host application uses for its own traffic
pub const DEFAULT_TAG: u32 = 0;

/// Tag reserved for force offload traffic
pub const PARTITION_TAG: u32 = 56789;

/// Identifies one sender on a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// A raw inbound frame and who sent it
#[derive(Debug, Clone, PartialEq)]
pub struct Incoming {
    pub from: PeerId,
    pub payload: Vec<u8>,
}

/// Errors raised by channel operations
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Partition tag {tag} is reserved for host traffic")]
    ReservedTag { tag: u32 },

    #[error("Partition tag {tag} is already in use at {location}")]
    TagInUse { tag: u32, location: String },

    #[error("No channel is open on partition tag {tag}")]
    NotOpen { tag: u32 },

    #[error("{peer} is no longer connected")]
    PeerGone { peer: PeerId },

    #[error("Channel closed")]
    Closed,

    #[error("Frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Controller side of a partition
#[async_trait]
pub trait Channel: Send {
    /// Partition tag this channel was split on
    fn tag(&self) -> u32;

    /// Wait up to `timeout` for the next frame from any peer
    ///
    /// Returns `Ok(None)` when the wait elapsed with nothing delivered.
    async fn recv(&mut self, timeout: Duration) -> Result<Option<Incoming>, ChannelError>;

    /// Send one envelope to a peer
    async fn send(&mut self, to: PeerId, envelope: &Envelope) -> Result<(), ChannelError>;

    /// Final synchronization with the rest of the process group
    async fn barrier(&mut self) -> Result<(), ChannelError>;

    /// Release the channel after a clean shutdown
    async fn release(self: Box<Self>) -> Result<(), ChannelError>;

    /// Tear the channel down immediately, reporting `code` to the group
    async fn abort(self: Box<Self>, code: i32);
}

/// A process group that can be split into tagged channels
#[async_trait]
pub trait World: Send {
    async fn split(&mut self, tag: u32) -> Result<Box<dyn Channel>, ChannelError>;
}

/// Peer side of a partition
#[async_trait]
pub trait PeerLink: Send {
    async fn send_raw(&mut self, payload: Vec<u8>) -> Result<(), ChannelError>;

    /// Wait up to `timeout` for the next frame from the controller
    async fn recv_raw(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, ChannelError>;
}

/// The work and discard channels owned by one controller
pub struct ChannelPair {
    work: Box<dyn Channel>,
    discard: Box<dyn Channel>,
}

impl fmt::Debug for ChannelPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelPair")
            .field("work_tag", &self.work.tag())
            .field("discard_tag", &self.discard.tag())
            .finish()
    }
}

/// Split `world` into a discard channel on the default tag and a work
/// channel on `tag`
///
/// Any failure is returned as-is; callers treat it as fatal.
pub async fn open(world: &mut dyn World, tag: u32) -> Result<ChannelPair, ChannelError> {
    debug!(tag, "open: called");
    if tag == DEFAULT_TAG {
        return Err(ChannelError::ReservedTag { tag });
    }

    let discard = world.split(DEFAULT_TAG).await?;
    let work = match world.split(tag).await {
        Ok(work) => work,
        Err(e) => {
            if let Err(release_err) = discard.release().await {
                warn!(error = %release_err, "open: failed to release discard channel");
            }
            return Err(e);
        }
    };

    info!(tag, "Opened controller channel");
    Ok(ChannelPair { work, discard })
}

impl ChannelPair {
    pub fn tag(&self) -> u32 {
        self.work.tag()
    }

    /// The channel carrying controller traffic
    pub fn work(&mut self) -> &mut dyn Channel {
        self.work.as_mut()
    }

    /// Barrier, then release both channels
    ///
    /// Both channels are released even when the barrier fails; the first
    /// error encountered is returned.
    pub async fn close(mut self) -> Result<(), ChannelError> {
        debug!(tag = self.work.tag(), "ChannelPair::close: called");
        let barrier = self.work.barrier().await;
        let work = self.work.release().await;
        let discard = self.discard.release().await;
        info!("Released controller channel");
        barrier.and(work).and(discard)
    }

    /// Abort the work channel with `code` and drop the discard channel
    pub async fn abort(self, code: i32) {
        error!(tag = self.work.tag(), code, "Aborting controller channel");
        self.work.abort(code).await;
        if let Err(e) = self.discard.release().await {
            warn!(error = %e, "ChannelPair::abort: failed to release discard channel");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_display() {
        assert_eq!(PeerId(7).to_string(), "peer-7");
    }

    #[tokio::test]
    async fn test_open_rejects_default_tag() {
        let mut world = MemoryWorld::new();
        let err = open(&mut world, DEFAULT_TAG).await.unwrap_err();
        assert!(matches!(err, ChannelError::ReservedTag { tag: 0 }));
    }

    #[tokio::test]
    async fn test_open_conflicting_tag_fails() {
        let mut world = MemoryWorld::new();
        let _first = open(&mut world, PARTITION_TAG).await.unwrap();
        let err = open(&mut world, PARTITION_TAG).await.unwrap_err();
        assert!(matches!(err, ChannelError::TagInUse { tag: PARTITION_TAG, .. }));
    }

    #[tokio::test]
    async fn test_close_runs_barrier_and_releases_once() {
        let mut world = MemoryWorld::new();
        let pair = open(&mut world, 42).await.unwrap();
        assert_eq!(pair.tag(), 42);

        pair.close().await.unwrap();

        let stats = world.stats(42);
        assert_eq!(stats.barriers, 1);
        assert_eq!(stats.releases, 1);
        assert_eq!(stats.abort_code, None);
    }

    #[tokio::test]
    async fn test_abort_records_code_and_skips_barrier() {
        let mut world = MemoryWorld::new();
        let pair = open(&mut world, 42).await.unwrap();

        pair.abort(10).await;

        let stats = world.stats(42);
        assert_eq!(stats.barriers, 0);
        assert_eq!(stats.releases, 1);
        assert_eq!(stats.abort_code, Some(10));
    }

    #[tokio::test]
    async fn test_tag_reusable_after_close() {
        let mut world = MemoryWorld::new();
        open(&mut world, 42).await.unwrap().close().await.unwrap();
        assert!(open(&mut world, 42).await.is_ok());
    }
}
