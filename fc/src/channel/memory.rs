//! In-process world backed by tokio queues
//!
//! Used by tests and by embedders that run the engine and the controller in
//! one process. Each split on a non-default tag gets one inbound queue shared
//! by every connected [`MemoryPeer`], so per-peer ordering is preserved while
//! peers interleave freely.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error};

use super::{Channel, ChannelError, DEFAULT_TAG, Incoming, PeerId, PeerLink, World};
use crate::protocol::Envelope;

/// Counters recorded per partition tag, kept after the channel is released
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub frames_received: u64,
    pub frames_sent: u64,
    pub barriers: u32,
    pub releases: u32,
    pub abort_code: Option<i32>,
}

struct Partition {
    inbound: mpsc::UnboundedSender<Incoming>,
    peers: HashMap<PeerId, mpsc::UnboundedSender<Vec<u8>>>,
}

#[derive(Default)]
struct WorldState {
    partitions: HashMap<u32, Partition>,
    stats: HashMap<u32, ChannelStats>,
    next_peer: u64,
}

/// A shareable in-process world
#[derive(Clone, Default)]
pub struct MemoryWorld {
    state: Arc<Mutex<WorldState>>,
}

impl MemoryWorld {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, WorldState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a new peer to the channel currently open on `tag`
    pub fn connect(&self, tag: u32) -> Result<MemoryPeer, ChannelError> {
        let mut state = self.lock();
        state.next_peer += 1;
        let id = PeerId(state.next_peer);

        let partition = state.partitions.get_mut(&tag).ok_or(ChannelError::NotOpen { tag })?;
        let (reply_tx, reply_rx) = mpsc::unbounded_channel();
        partition.peers.insert(id, reply_tx);
        debug!(%id, tag, "MemoryWorld::connect: peer attached");

        Ok(MemoryPeer {
            id,
            inbound: partition.inbound.clone(),
            replies: reply_rx,
        })
    }

    /// Snapshot of the counters recorded for `tag`
    pub fn stats(&self, tag: u32) -> ChannelStats {
        self.lock().stats.get(&tag).cloned().unwrap_or_default()
    }

    pub fn is_open(&self, tag: u32) -> bool {
        self.lock().partitions.contains_key(&tag)
    }

    fn record(&self, tag: u32, f: impl FnOnce(&mut ChannelStats)) {
        f(self.lock().stats.entry(tag).or_default());
    }
}

#[async_trait]
impl World for MemoryWorld {
    async fn split(&mut self, tag: u32) -> Result<Box<dyn Channel>, ChannelError> {
        debug!(tag, "MemoryWorld::split: called");
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        // The default tag holds host traffic: every split gets a private sink
        // that no peer can connect to.
        if tag != DEFAULT_TAG {
            let mut state = self.lock();
            if state.partitions.contains_key(&tag) {
                return Err(ChannelError::TagInUse {
                    tag,
                    location: "memory".to_string(),
                });
            }
            state.partitions.insert(
                tag,
                Partition {
                    inbound: inbound_tx.clone(),
                    peers: HashMap::new(),
                },
            );
            state.stats.insert(tag, ChannelStats::default());
        }

        Ok(Box::new(MemoryChannel {
            tag,
            world: self.clone(),
            inbound: inbound_rx,
            _keepalive: inbound_tx,
        }))
    }
}

/// Controller end of a memory partition
pub struct MemoryChannel {
    tag: u32,
    world: MemoryWorld,
    inbound: mpsc::UnboundedReceiver<Incoming>,
    _keepalive: mpsc::UnboundedSender<Incoming>,
}

impl MemoryChannel {
    fn detach(&self) {
        if self.tag != DEFAULT_TAG {
            self.world.lock().partitions.remove(&self.tag);
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn tag(&self) -> u32 {
        self.tag
    }

    async fn recv(&mut self, timeout: Duration) -> Result<Option<Incoming>, ChannelError> {
        match tokio::time::timeout(timeout, self.inbound.recv()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(ChannelError::Closed),
            Ok(Some(incoming)) => {
                self.world.record(self.tag, |s| s.frames_received += 1);
                Ok(Some(incoming))
            }
        }
    }

    async fn send(&mut self, to: PeerId, envelope: &Envelope) -> Result<(), ChannelError> {
        let payload = envelope.encode()?;
        {
            let state = self.world.lock();
            let reply_tx = state
                .partitions
                .get(&self.tag)
                .and_then(|p| p.peers.get(&to))
                .ok_or(ChannelError::PeerGone { peer: to })?;
            reply_tx.send(payload).map_err(|_| ChannelError::PeerGone { peer: to })?;
        }
        self.world.record(self.tag, |s| s.frames_sent += 1);
        Ok(())
    }

    /// Records the call and returns at once
    ///
    /// Memory peers live in the caller's own process, so there is no group
    /// to wait on. Peers still held by the caller do not block `close`.
    async fn barrier(&mut self) -> Result<(), ChannelError> {
        debug!(tag = self.tag, "MemoryChannel::barrier: called");
        self.world.record(self.tag, |s| s.barriers += 1);
        Ok(())
    }

    async fn release(self: Box<Self>) -> Result<(), ChannelError> {
        debug!(tag = self.tag, "MemoryChannel::release: called");
        self.detach();
        self.world.record(self.tag, |s| s.releases += 1);
        Ok(())
    }

    async fn abort(self: Box<Self>, code: i32) {
        error!(tag = self.tag, code, "MemoryChannel::abort: called");
        self.detach();
        self.world.record(self.tag, |s| {
            s.releases += 1;
            s.abort_code = Some(code);
        });
    }
}

/// Engine end of a memory partition
pub struct MemoryPeer {
    id: PeerId,
    inbound: mpsc::UnboundedSender<Incoming>,
    replies: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MemoryPeer {
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// Send an envelope to the controller
    pub fn send(&self, envelope: &Envelope) -> Result<(), ChannelError> {
        self.push(envelope.encode()?)
    }

    fn push(&self, payload: Vec<u8>) -> Result<(), ChannelError> {
        self.inbound
            .send(Incoming {
                from: self.id,
                payload,
            })
            .map_err(|_| ChannelError::Closed)
    }
}

#[async_trait]
impl PeerLink for MemoryPeer {
    async fn send_raw(&mut self, payload: Vec<u8>) -> Result<(), ChannelError> {
        self.push(payload)
    }

    async fn recv_raw(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, ChannelError> {
        match tokio::time::timeout(timeout, self.replies.recv()).await {
            Err(_) => Ok(None),
            Ok(None) => Err(ChannelError::Closed),
            Ok(Some(payload)) => Ok(Some(payload)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TAG: u32 = 56789;

    #[tokio::test]
    async fn test_connect_requires_open_partition() {
        let world = MemoryWorld::new();
        assert!(matches!(world.connect(TAG), Err(ChannelError::NotOpen { tag: TAG })));
    }

    #[tokio::test]
    async fn test_default_tag_is_not_connectable() {
        let mut world = MemoryWorld::new();
        let _sink = world.split(DEFAULT_TAG).await.unwrap();
        let _another = world.split(DEFAULT_TAG).await.unwrap();
        assert!(world.connect(DEFAULT_TAG).is_err());
    }

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let mut world = MemoryWorld::new();
        let mut channel = world.split(TAG).await.unwrap();
        let mut peer = world.connect(TAG).unwrap();

        peer.send(&Envelope::Register).unwrap();
        let incoming = channel.recv(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(incoming.from, peer.id());
        assert_eq!(incoming.payload, br#"{"type":"register"}"#.to_vec());

        channel.send(peer.id(), &Envelope::Ack).await.unwrap();
        let reply = peer.recv_raw(Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(reply, br#"{"type":"ack"}"#.to_vec());

        let stats = world.stats(TAG);
        assert_eq!(stats.frames_received, 1);
        assert_eq!(stats.frames_sent, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recv_times_out_empty() {
        let mut world = MemoryWorld::new();
        let mut channel = world.split(TAG).await.unwrap();
        let got = channel.recv(Duration::from_millis(100)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_per_peer_order_preserved() {
        let mut world = MemoryWorld::new();
        let mut channel = world.split(TAG).await.unwrap();
        let a = world.connect(TAG).unwrap();
        let b = world.connect(TAG).unwrap();

        a.send(&Envelope::Register).unwrap();
        b.send(&Envelope::Register).unwrap();
        a.send(&Envelope::Deregister).unwrap();
        b.send(&Envelope::Deregister).unwrap();

        let mut from_a = Vec::new();
        while let Some(incoming) = channel.recv(Duration::from_millis(10)).await.unwrap() {
            if incoming.from == a.id() {
                from_a.push(incoming.payload);
            }
        }
        assert_eq!(from_a.len(), 2);
        assert_eq!(from_a[0], Envelope::Register.encode().unwrap());
        assert_eq!(from_a[1], Envelope::Deregister.encode().unwrap());
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer() {
        let mut world = MemoryWorld::new();
        let mut channel = world.split(TAG).await.unwrap();
        let err = channel.send(PeerId(99), &Envelope::Ack).await.unwrap_err();
        assert!(matches!(err, ChannelError::PeerGone { peer: PeerId(99) }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_barrier_returns_with_peers_still_held() {
        let mut world = MemoryWorld::new();
        let mut channel = world.split(TAG).await.unwrap();
        let _held = world.connect(TAG).unwrap();

        let started = tokio::time::Instant::now();
        channel.barrier().await.unwrap();
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(world.stats(TAG).barriers, 1);
    }

    #[tokio::test]
    async fn test_peer_sees_close_after_release() {
        let mut world = MemoryWorld::new();
        let channel = world.split(TAG).await.unwrap();
        let mut peer = world.connect(TAG).unwrap();

        channel.release().await.unwrap();
        assert!(!world.is_open(TAG));

        let err = peer.recv_raw(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, ChannelError::Closed));
        assert!(peer.send(&Envelope::Register).is_err());
    }
}
