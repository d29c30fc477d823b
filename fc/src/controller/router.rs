//! The controller polling loop

use std::fmt;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::ledger::{Departure, Ledger, LedgerError};
use super::watchdog::{IDLE_TIMEOUT_EXIT_CODE, Watchdog};
use crate::channel::{ChannelError, ChannelPair, Incoming, PeerId};
use crate::config::ControllerConfig;
use crate::handler::{Reply, Request, RequestHandler};
use crate::protocol::{Decoded, Envelope};

/// Exit code for a protocol invariant violation
pub const INVARIANT_EXIT_CODE: i32 = 2;

/// Exit code for a channel failure
pub const CHANNEL_EXIT_CODE: i32 = 1;

/// Fatal conditions that end a controller run
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Protocol invariant violated: {0}")]
    Invariant(#[from] LedgerError),

    #[error("No traffic for {idle_ms}ms (limit {max_idle_ms}ms)")]
    IdleTimeout { idle_ms: u64, max_idle_ms: u64 },

    #[error("Channel failure: {0}")]
    Channel(#[from] ChannelError),
}

impl ControllerError {
    /// Process exit status the host should see
    pub fn exit_code(&self) -> i32 {
        match self {
            ControllerError::Invariant(_) => INVARIANT_EXIT_CODE,
            ControllerError::IdleTimeout { .. } => IDLE_TIMEOUT_EXIT_CODE,
            ControllerError::Channel(_) => CHANNEL_EXIT_CODE,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ControllerError::IdleTimeout { .. })
    }
}

/// Router lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterState {
    /// Nobody has registered yet; polls without a watchdog
    AwaitingFirstPeer,
    /// At least one peer registered
    Active,
    /// The last peer left; terminal
    Draining,
}

impl fmt::Display for RouterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RouterState::AwaitingFirstPeer => "awaiting-first-peer",
            RouterState::Active => "active",
            RouterState::Draining => "draining",
        };
        f.write_str(name)
    }
}

/// Counters for one controller run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub registrations: u64,
    pub peak_peers: u64,
    pub requests: u64,
    pub grid_requests: u64,
    pub ignored: u64,
    /// `waiting` envelopes sent while a handler deferred its answer
    pub waiting: u64,
    pub idle_polls: u64,
    /// Every state the router entered, in order
    pub states: Vec<RouterState>,
}

/// Single-threaded controller loop
///
/// Owns its channel pair for its whole lifetime and consumes it exactly once
/// on exit: `close` after a clean drain, `abort` on any fatal error.
pub struct Controller<H> {
    config: ControllerConfig,
    channels: ChannelPair,
    handler: H,
    ledger: Ledger,
    watchdog: Watchdog,
    state: RouterState,
    summary: RunSummary,
}

impl<H: RequestHandler> Controller<H> {
    pub fn new(config: ControllerConfig, channels: ChannelPair, handler: H) -> Self {
        let watchdog = Watchdog::new(config.max_idle());
        Self {
            config,
            channels,
            handler,
            ledger: Ledger::new(),
            watchdog,
            state: RouterState::AwaitingFirstPeer,
            summary: RunSummary {
                states: vec![RouterState::AwaitingFirstPeer],
                ..Default::default()
            },
        }
    }

    /// Run until every peer has deregistered or a fatal error occurs
    pub async fn run(mut self) -> Result<RunSummary, ControllerError> {
        info!(
            tag = self.channels.tag(),
            handler = self.handler.name(),
            max_idle_ms = self.config.max_idle_ms,
            "Started controller"
        );

        let outcome = self.poll_until_drained().await;
        let Controller {
            channels,
            ledger,
            mut summary,
            ..
        } = self;
        summary.registrations = ledger.registrations();
        summary.peak_peers = ledger.peak();

        match outcome {
            Ok(()) => {
                info!(requests = summary.requests, grids = summary.grid_requests, "Halting controller");
                channels.close().await?;
                Ok(summary)
            }
            Err(e) => {
                channels.abort(e.exit_code()).await;
                Err(e)
            }
        }
    }

    async fn poll_until_drained(&mut self) -> Result<(), ControllerError> {
        let poll = self.config.poll_interval();

        while self.state != RouterState::Draining {
            let wait = if self.watchdog.is_armed() {
                poll.min(self.watchdog.remaining())
            } else {
                poll
            };

            let started = Instant::now();
            match self.channels.work().recv(wait).await? {
                Some(incoming) => {
                    self.watchdog.reset();
                    self.route(incoming).await?;
                }
                None => {
                    self.summary.idle_polls += 1;
                    self.watchdog.tick(started.elapsed());
                }
            }

            if self.state == RouterState::Active {
                self.advance_handler().await?;
            }
            if self.watchdog.expired() {
                return Err(ControllerError::IdleTimeout {
                    idle_ms: self.watchdog.idle().as_millis() as u64,
                    max_idle_ms: self.config.max_idle_ms,
                });
            }
        }
        Ok(())
    }

    /// Let the handler finish deferred work; anything it sends counts as activity
    async fn advance_handler(&mut self) -> Result<(), ControllerError> {
        let replies = self.handler.poll(self.ledger.active());
        if !replies.is_empty() {
            self.watchdog.reset();
            self.deliver(replies).await?;
        }
        Ok(())
    }

    fn enter(&mut self, state: RouterState) {
        if self.state != state {
            info!(from = %self.state, to = %state, "Router state change");
            self.state = state;
            self.summary.states.push(state);
        }
    }

    fn ignore(&mut self, from: PeerId, reason: &str) {
        warn!(peer = %from, reason, "Ignoring message");
        self.summary.ignored += 1;
    }

    async fn route(&mut self, incoming: Incoming) -> Result<(), ControllerError> {
        let Incoming { from, payload } = incoming;

        let envelope = match Envelope::decode(&payload) {
            Ok(Decoded::Known(envelope)) => envelope,
            Ok(Decoded::Unknown { kind }) => {
                self.ignore(from, &format!("unknown message type '{}'", kind));
                return Ok(());
            }
            Err(e) => {
                self.ignore(from, &e.to_string());
                return Ok(());
            }
        };
        debug!(peer = %from, kind = envelope.kind(), "route: received");

        match envelope {
            Envelope::Register => {
                let ack = self.ledger.on_register();
                self.watchdog.arm();
                self.enter(RouterState::Active);
                self.reply(from, &ack).await
            }
            Envelope::Deregister => {
                match self.ledger.on_deregister()? {
                    Departure::Remaining(active) => debug!(active, "route: peer deregistered"),
                    Departure::Drained => self.enter(RouterState::Draining),
                }
                Ok(())
            }
            Envelope::Request { atoms, .. } => self.dispatch(from, Request::Atoms(atoms)).await,
            Envelope::GridRequest(grid) => self.dispatch(from, Request::Grid(grid)).await,
            other => {
                self.ignore(from, &format!("'{}' is not a controller-bound message", other.kind()));
                Ok(())
            }
        }
    }

    async fn dispatch(&mut self, from: PeerId, request: Request) -> Result<(), ControllerError> {
        if self.state != RouterState::Active {
            self.ignore(from, &format!("'{}' before any registration", request.kind()));
            return Ok(());
        }

        let is_grid = matches!(request, Request::Grid(_));
        match self.handler.handle(from, request, self.ledger.active()) {
            Ok(replies) => {
                if is_grid {
                    self.summary.grid_requests += 1;
                } else {
                    self.summary.requests += 1;
                }
                self.deliver(replies).await
            }
            Err(e) => {
                self.ignore(from, &e.to_string());
                Ok(())
            }
        }
    }

    async fn deliver(&mut self, replies: Vec<Reply>) -> Result<(), ControllerError> {
        for Reply { to, envelope } in replies {
            if envelope == Envelope::Waiting {
                self.summary.waiting += 1;
            }
            self.reply(to, &envelope).await?;
        }
        Ok(())
    }

    async fn reply(&mut self, to: PeerId, envelope: &Envelope) -> Result<(), ControllerError> {
        match self.channels.work().send(to, envelope).await {
            Ok(()) => Ok(()),
            Err(ChannelError::PeerGone { peer }) => {
                warn!(%peer, kind = envelope.kind(), "Peer went away before its reply was sent");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{self, MemoryWorld, PeerLink};
    use crate::handler::IndependentAtomHandler;
    use crate::protocol::{AtomRecord, ForceDelta};
    use std::time::Duration;

    const TAG: u32 = 777;

    fn config() -> ControllerConfig {
        ControllerConfig {
            partition_tag: TAG,
            max_idle_ms: 1000,
            poll_interval_ms: 100,
            ..Default::default()
        }
    }

    async fn start(world: &mut MemoryWorld) -> tokio::task::JoinHandle<Result<RunSummary, ControllerError>> {
        let channels = channel::open(world, TAG).await.unwrap();
        let handler = IndependentAtomHandler::new(|_: &AtomRecord| ForceDelta::new(1.0, 0.0, 0.0));
        tokio::spawn(Controller::new(config(), channels, handler).run())
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ControllerError::from(LedgerError::DeregisterWithoutPeers).exit_code(), 2);
        let timeout = ControllerError::IdleTimeout {
            idle_ms: 10_000,
            max_idle_ms: 10_000,
        };
        assert_eq!(timeout.exit_code(), 10);
        assert!(timeout.is_timeout());
        assert_eq!(ControllerError::from(ChannelError::Closed).exit_code(), 1);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(RouterState::AwaitingFirstPeer.to_string(), "awaiting-first-peer");
        assert_eq!(RouterState::Draining.to_string(), "draining");
    }

    #[tokio::test(start_paused = true)]
    async fn test_deregister_before_register_is_fatal() {
        let mut world = MemoryWorld::new();
        let task = start(&mut world).await;
        let peer = world.connect(TAG).unwrap();

        peer.send(&Envelope::Deregister).unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, ControllerError::Invariant(LedgerError::DeregisterWithoutPeers)));
        assert_eq!(world.stats(TAG).abort_code, Some(INVARIANT_EXIT_CODE));
        assert_eq!(world.stats(TAG).releases, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_before_register_is_ignored() {
        let mut world = MemoryWorld::new();
        let task = start(&mut world).await;
        let mut peer = world.connect(TAG).unwrap();

        peer.send(&Envelope::request(vec![AtomRecord::new()])).unwrap();
        peer.send(&Envelope::Register).unwrap();
        let ack = peer.recv_raw(Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(ack, Envelope::Ack.encode().unwrap());
        peer.send(&Envelope::Deregister).unwrap();

        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.ignored, 1);
        assert_eq!(summary.requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_and_malformed_are_ignored() {
        let mut world = MemoryWorld::new();
        let task = start(&mut world).await;
        let mut peer = world.connect(TAG).unwrap();

        peer.send(&Envelope::Register).unwrap();
        peer.recv_raw(Duration::from_secs(1)).await.unwrap().unwrap();

        peer.send_raw(br#"{"type":"telemetry"}"#.to_vec()).await.unwrap();
        peer.send_raw(b"garbage".to_vec()).await.unwrap();
        peer.send_raw(vec![0xff, 0xfe, b'x']).await.unwrap();
        peer.send(&Envelope::Ack).unwrap();
        peer.send(&Envelope::Deregister).unwrap();

        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.ignored, 4);
        assert!(peer.recv_raw(Duration::from_millis(10)).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_request_kind_is_ignored() {
        let mut world = MemoryWorld::new();
        let task = start(&mut world).await;
        let mut peer = world.connect(TAG).unwrap();

        peer.send(&Envelope::Register).unwrap();
        peer.recv_raw(Duration::from_secs(1)).await.unwrap().unwrap();
        let grid = crate::protocol::GridDescriptor::new([0.0; 3], [1.0; 3], [1, 1, 1]);
        peer.send(&Envelope::GridRequest(grid)).unwrap();
        peer.send(&Envelope::Deregister).unwrap();

        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.ignored, 1);
        assert_eq!(summary.grid_requests, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_awaiting_first_peer_never_times_out() {
        let mut world = MemoryWorld::new();
        let task = start(&mut world).await;

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!task.is_finished());

        let mut peer = world.connect(TAG).unwrap();
        peer.send(&Envelope::Register).unwrap();
        peer.recv_raw(Duration::from_secs(1)).await.unwrap().unwrap();
        peer.send(&Envelope::Deregister).unwrap();

        let summary = task.await.unwrap().unwrap();
        assert_eq!(
            summary.states,
            vec![RouterState::AwaitingFirstPeer, RouterState::Active, RouterState::Draining]
        );
        assert!(summary.idle_polls > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_to_departed_peer_is_not_fatal() {
        let mut world = MemoryWorld::new();
        let task = start(&mut world).await;
        let keeper = world.connect(TAG).unwrap();
        let leaver = world.connect(TAG).unwrap();

        keeper.send(&Envelope::Register).unwrap();
        leaver.send(&Envelope::Register).unwrap();
        leaver.send(&Envelope::request(vec![AtomRecord::new()])).unwrap();
        drop(leaver);
        keeper.send(&Envelope::Deregister).unwrap();

        // The controller still counts the dropped peer as registered.
        let err = task.await.unwrap().unwrap_err();
        assert!(err.is_timeout());
    }
}
