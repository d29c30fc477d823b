//! Unix Domain Socket world
//!
//! Each partition tag maps to one socket file under a shared directory and
//! every connection is one peer. Frames are single lines of JSON followed by
//! `\n`. Frame bytes are forwarded untouched; decoding is the router's job.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{Channel, ChannelError, DEFAULT_TAG, Incoming, PeerId, PeerLink, World};
use crate::protocol::Envelope;

/// Largest frame accepted from a peer (64MB)
const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Buffered socket events between the acceptor and the channel
const EVENT_BUFFER: usize = 1024;

/// Default time the barrier waits for peers to hang up
const DEFAULT_BARRIER_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause after a failed accept so persistent errors (EMFILE) do not spin
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Host sockets handed out so far in this process
static HOST_SOCKETS: AtomicU64 = AtomicU64::new(0);

/// Socket path peers connect to for partition `tag`
pub fn partition_socket_path(dir: &Path, tag: u32) -> PathBuf {
    dir.join(format!("arbfn-{tag}.sock"))
}

/// A world whose partitions are sockets in one directory
#[derive(Debug, Clone)]
pub struct SocketWorld {
    dir: PathBuf,
    barrier_timeout: Duration,
    max_frame_size: usize,
}

impl SocketWorld {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            barrier_timeout: DEFAULT_BARRIER_TIMEOUT,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    pub fn with_barrier_timeout(mut self, timeout: Duration) -> Self {
        self.barrier_timeout = timeout;
        self
    }

    /// Longest frame accepted from a peer; longer lines are skipped
    pub fn with_max_frame_size(mut self, limit: usize) -> Self {
        self.max_frame_size = limit;
        self
    }

    /// Socket file backing `tag` for this process
    ///
    /// The default tag is private host traffic, so every call for it yields a
    /// fresh path carrying the process id and a sequence number.
    pub fn socket_path(&self, tag: u32) -> PathBuf {
        if tag == DEFAULT_TAG {
            let seq = HOST_SOCKETS.fetch_add(1, Ordering::Relaxed);
            self.dir.join(format!("host-{}-{}.sock", std::process::id(), seq))
        } else {
            partition_socket_path(&self.dir, tag)
        }
    }
}

/// Bind a listener, refusing sockets that still have a live owner
async fn bind(path: &Path, tag: u32) -> Result<UnixListener, ChannelError> {
    debug!(?path, tag, "bind: creating partition socket");

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if path.exists() {
        if UnixStream::connect(path).await.is_ok() {
            return Err(ChannelError::TagInUse {
                tag,
                location: path.display().to_string(),
            });
        }
        debug!(?path, "bind: removing stale socket");
        std::fs::remove_file(path)?;
    }

    let listener = UnixListener::bind(path)?;
    debug!(?path, "bind: socket bound successfully");
    Ok(listener)
}

/// Remove the socket file on shutdown
fn cleanup_socket(path: &Path) {
    if path.exists() {
        debug!(?path, "cleanup_socket: removing socket file");
        if let Err(e) = std::fs::remove_file(path) {
            warn!(?path, error = %e, "Failed to remove socket file");
        }
    }
}

#[async_trait]
impl World for SocketWorld {
    async fn split(&mut self, tag: u32) -> Result<Box<dyn Channel>, ChannelError> {
        let path = self.socket_path(tag);
        let listener = bind(&path, tag).await?;
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let acceptor = tokio::spawn(accept_peers(listener, tx, self.max_frame_size));
        info!(tag, ?path, "Listening for peers");

        Ok(Box::new(SocketChannel {
            tag,
            path,
            events: rx,
            writers: HashMap::new(),
            acceptor,
            barrier_timeout: self.barrier_timeout,
        }))
    }
}

enum SocketEvent {
    Connected { peer: PeerId, writer: OwnedWriteHalf },
    Frame(Incoming),
    Disconnected { peer: PeerId },
}

async fn accept_peers(listener: UnixListener, tx: mpsc::Sender<SocketEvent>, max_frame_size: usize) {
    let mut readers = JoinSet::new();
    let mut next_peer = 0u64;

    loop {
        while readers.try_join_next().is_some() {}

        let stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(e) => {
                warn!(error = %e, "accept_peers: accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        next_peer += 1;
        let peer = PeerId(next_peer);
        let (read, writer) = stream.into_split();
        debug!(%peer, "accept_peers: peer connected");

        if tx.send(SocketEvent::Connected { peer, writer }).await.is_err() {
            break;
        }
        readers.spawn(read_frames(peer, read, tx.clone(), max_frame_size));
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Frame {
    Complete,
    /// Line longer than the limit; its bytes were consumed and discarded
    Oversized(usize),
    Eof,
}

/// Read one `\n`-terminated frame into `buf` without the newline
///
/// Never buffers more than `limit + 1` bytes at a time. A final frame that
/// ends at EOF without a newline still counts as complete.
async fn read_frame<R>(reader: &mut R, buf: &mut Vec<u8>, limit: usize) -> std::io::Result<Frame>
where
    R: AsyncBufRead + Unpin,
{
    let cap = limit as u64 + 1;
    buf.clear();
    let read = (&mut *reader).take(cap).read_until(b'\n', buf).await?;
    if read == 0 {
        return Ok(Frame::Eof);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
        return Ok(Frame::Complete);
    }
    if read <= limit {
        return Ok(Frame::Complete);
    }

    let mut skipped = read;
    loop {
        buf.clear();
        let read = (&mut *reader).take(cap).read_until(b'\n', buf).await?;
        skipped += read;
        if read == 0 || buf.last() == Some(&b'\n') {
            break;
        }
    }
    buf.clear();
    Ok(Frame::Oversized(skipped))
}

async fn read_frames(peer: PeerId, read: OwnedReadHalf, tx: mpsc::Sender<SocketEvent>, max_frame_size: usize) {
    let mut reader = BufReader::new(read);
    let mut buf = Vec::new();
    loop {
        match read_frame(&mut reader, &mut buf, max_frame_size).await {
            Ok(Frame::Complete) => {
                if buf.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                let frame = Incoming {
                    from: peer,
                    payload: std::mem::take(&mut buf),
                };
                if tx.send(SocketEvent::Frame(frame)).await.is_err() {
                    return;
                }
            }
            Ok(Frame::Oversized(size)) => {
                warn!(%peer, size, limit = max_frame_size, "read_frames: frame too large, skipped");
            }
            Ok(Frame::Eof) => break,
            Err(e) => {
                warn!(%peer, error = %e, "read_frames: read failed");
                break;
            }
        }
    }
    let _ = tx.send(SocketEvent::Disconnected { peer }).await;
}

/// Controller end of a socket partition
pub struct SocketChannel {
    tag: u32,
    path: PathBuf,
    events: mpsc::Receiver<SocketEvent>,
    writers: HashMap<PeerId, OwnedWriteHalf>,
    acceptor: JoinHandle<()>,
    barrier_timeout: Duration,
}

impl SocketChannel {
    /// Apply bookkeeping events; hand frames back to the caller
    fn handle_event(&mut self, event: SocketEvent) -> Option<Incoming> {
        match event {
            SocketEvent::Connected { peer, writer } => {
                self.writers.insert(peer, writer);
                None
            }
            SocketEvent::Disconnected { peer } => {
                debug!(%peer, "SocketChannel: peer disconnected");
                self.writers.remove(&peer);
                None
            }
            SocketEvent::Frame(incoming) => Some(incoming),
        }
    }
}

impl Drop for SocketChannel {
    fn drop(&mut self) {
        self.acceptor.abort();
        self.writers.clear();
        cleanup_socket(&self.path);
    }
}

#[async_trait]
impl Channel for SocketChannel {
    fn tag(&self) -> u32 {
        self.tag
    }

    async fn recv(&mut self, timeout: Duration) -> Result<Option<Incoming>, ChannelError> {
        let deadline = Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Err(_) => return Ok(None),
                Ok(None) => return Err(ChannelError::Closed),
                Ok(Some(event)) => {
                    if let Some(incoming) = self.handle_event(event) {
                        return Ok(Some(incoming));
                    }
                }
            }
        }
    }

    async fn send(&mut self, to: PeerId, envelope: &Envelope) -> Result<(), ChannelError> {
        let mut frame = envelope.encode()?;
        frame.push(b'\n');

        let writer = self.writers.get_mut(&to).ok_or(ChannelError::PeerGone { peer: to })?;
        let written = match writer.write_all(&frame).await {
            Ok(()) => writer.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            debug!(peer = %to, error = %e, "SocketChannel::send: write failed");
            self.writers.remove(&to);
            return Err(ChannelError::PeerGone { peer: to });
        }
        Ok(())
    }

    /// Wait (bounded) until every connected peer has hung up
    async fn barrier(&mut self) -> Result<(), ChannelError> {
        debug!(tag = self.tag, peers = self.writers.len(), "SocketChannel::barrier: called");
        let deadline = Instant::now() + self.barrier_timeout;

        while !self.writers.is_empty() {
            match tokio::time::timeout_at(deadline, self.events.recv()).await {
                Err(_) => {
                    warn!(
                        remaining = self.writers.len(),
                        "Barrier timed out waiting for peers to disconnect"
                    );
                    break;
                }
                Ok(None) => break,
                Ok(Some(event)) => {
                    if let Some(incoming) = self.handle_event(event) {
                        debug!(peer = %incoming.from, "SocketChannel::barrier: dropping late frame");
                    }
                }
            }
        }
        Ok(())
    }

    async fn release(self: Box<Self>) -> Result<(), ChannelError> {
        debug!(tag = self.tag, path = ?self.path, "SocketChannel::release: called");
        drop(self);
        Ok(())
    }

    async fn abort(self: Box<Self>, code: i32) {
        error!(tag = self.tag, code, peers = self.writers.len(), "SocketChannel::abort: called");
        drop(self);
    }
}

/// Engine end of a socket partition
pub struct SocketPeer {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl SocketPeer {
    /// Connect to the controller listening at `path`
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, ChannelError> {
        let path = path.as_ref();
        debug!(?path, "SocketPeer::connect: called");
        let stream = UnixStream::connect(path).await?;
        let (read, writer) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(read).lines(),
            writer,
        })
    }
}

#[async_trait]
impl PeerLink for SocketPeer {
    async fn send_raw(&mut self, mut payload: Vec<u8>) -> Result<(), ChannelError> {
        if payload.len() > MAX_FRAME_SIZE {
            return Err(ChannelError::FrameTooLarge {
                size: payload.len(),
                limit: MAX_FRAME_SIZE,
            });
        }
        payload.push(b'\n');
        self.writer.write_all(&payload).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn recv_raw(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, ChannelError> {
        let deadline = Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.lines.next_line()).await {
                Err(_) => return Ok(None),
                Ok(Ok(Some(line))) if line.trim().is_empty() => continue,
                Ok(Ok(Some(line))) => return Ok(Some(line.into_bytes())),
                Ok(Ok(None)) => return Err(ChannelError::Closed),
                Ok(Err(e)) => return Err(ChannelError::Io(e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const TAG: u32 = 56789;

    #[test]
    fn test_partition_socket_path() {
        let path = partition_socket_path(Path::new("/run/forcectl"), TAG);
        assert_eq!(path, PathBuf::from("/run/forcectl/arbfn-56789.sock"));
    }

    #[test]
    fn test_default_tag_socket_is_private() {
        let world = SocketWorld::new("/tmp/fc");
        let path = world.socket_path(DEFAULT_TAG);
        assert!(path.to_string_lossy().contains(&std::process::id().to_string()));
        assert_ne!(path, world.socket_path(DEFAULT_TAG));
        assert_ne!(path, world.socket_path(TAG));
    }

    #[tokio::test]
    async fn test_split_creates_socket_dir() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("nested").join("sockets");
        let mut world = SocketWorld::new(&dir);

        let channel = world.split(TAG).await.unwrap();
        assert!(partition_socket_path(&dir, TAG).exists());

        channel.release().await.unwrap();
        assert!(!partition_socket_path(&dir, TAG).exists());
    }

    #[tokio::test]
    async fn test_split_removes_stale_socket() {
        let temp = TempDir::new().unwrap();
        std::fs::write(partition_socket_path(temp.path(), TAG), "stale").unwrap();

        let mut world = SocketWorld::new(temp.path());
        assert!(world.split(TAG).await.is_ok());
    }

    #[tokio::test]
    async fn test_split_live_socket_is_in_use() {
        let temp = TempDir::new().unwrap();
        let mut world = SocketWorld::new(temp.path());
        let _live = world.split(TAG).await.unwrap();

        let err = world.split(TAG).await.err().expect("expected error");
        assert!(matches!(err, ChannelError::TagInUse { tag: TAG, .. }));
    }

    #[tokio::test]
    async fn test_round_trip_over_socket() {
        let temp = TempDir::new().unwrap();
        let mut world = SocketWorld::new(temp.path());
        let mut channel = world.split(TAG).await.unwrap();

        let mut peer = SocketPeer::connect(partition_socket_path(temp.path(), TAG))
            .await
            .unwrap();
        peer.send_raw(Envelope::Register.encode().unwrap()).await.unwrap();

        let incoming = channel.recv(Duration::from_secs(2)).await.unwrap().unwrap();
        assert_eq!(incoming.payload, Envelope::Register.encode().unwrap());

        channel.send(incoming.from, &Envelope::Ack).await.unwrap();
        let reply = peer.recv_raw(Duration::from_secs(2)).await.unwrap().unwrap();
        assert_eq!(reply, br#"{"type":"ack"}"#.to_vec());
    }

    #[tokio::test]
    async fn test_read_frame_splits_lines_and_skips_oversized() {
        let input = b"{\"a\":1}\nxxxxxxxxxxxxxxxxxxxx\nok\ntail";
        let mut reader: &[u8] = input;
        let mut buf = Vec::new();

        assert_eq!(read_frame(&mut reader, &mut buf, 10).await.unwrap(), Frame::Complete);
        assert_eq!(buf, br#"{"a":1}"#.to_vec());
        assert_eq!(read_frame(&mut reader, &mut buf, 10).await.unwrap(), Frame::Oversized(21));
        assert!(buf.is_empty());
        assert_eq!(read_frame(&mut reader, &mut buf, 10).await.unwrap(), Frame::Complete);
        assert_eq!(buf, b"ok".to_vec());
        assert_eq!(read_frame(&mut reader, &mut buf, 10).await.unwrap(), Frame::Complete);
        assert_eq!(buf, b"tail".to_vec());
        assert_eq!(read_frame(&mut reader, &mut buf, 10).await.unwrap(), Frame::Eof);
    }

    #[tokio::test]
    async fn test_read_frame_keeps_non_utf8_bytes() {
        let mut reader: &[u8] = &[0xff, 0xfe, b'x', b'\n'];
        let mut buf = Vec::new();

        assert_eq!(read_frame(&mut reader, &mut buf, 64).await.unwrap(), Frame::Complete);
        assert_eq!(buf, vec![0xff, 0xfe, b'x']);
    }

    #[tokio::test]
    async fn test_oversized_frame_is_skipped_and_peer_kept() {
        let temp = TempDir::new().unwrap();
        let mut world = SocketWorld::new(temp.path()).with_max_frame_size(32);
        let mut channel = world.split(TAG).await.unwrap();

        let mut peer = SocketPeer::connect(partition_socket_path(temp.path(), TAG))
            .await
            .unwrap();
        peer.send_raw(vec![b'x'; 200]).await.unwrap();
        peer.send_raw(Envelope::Register.encode().unwrap()).await.unwrap();

        let incoming = channel.recv(Duration::from_secs(2)).await.unwrap().unwrap();
        assert_eq!(incoming.payload, Envelope::Register.encode().unwrap());

        channel.send(incoming.from, &Envelope::Ack).await.unwrap();
        let reply = peer.recv_raw(Duration::from_secs(2)).await.unwrap().unwrap();
        assert_eq!(reply, br#"{"type":"ack"}"#.to_vec());
    }

    #[tokio::test]
    async fn test_barrier_waits_for_hangup() {
        let temp = TempDir::new().unwrap();
        let mut world = SocketWorld::new(temp.path()).with_barrier_timeout(Duration::from_secs(5));
        let mut channel = world.split(TAG).await.unwrap();

        let mut peer = SocketPeer::connect(partition_socket_path(temp.path(), TAG))
            .await
            .unwrap();
        peer.send_raw(Envelope::Register.encode().unwrap()).await.unwrap();
        channel.recv(Duration::from_secs(2)).await.unwrap().unwrap();

        drop(peer);
        let started = std::time::Instant::now();
        channel.barrier().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_barrier_times_out_with_lingering_peer() {
        let temp = TempDir::new().unwrap();
        let mut world = SocketWorld::new(temp.path()).with_barrier_timeout(Duration::from_millis(50));
        let mut channel = world.split(TAG).await.unwrap();

        let mut peer = SocketPeer::connect(partition_socket_path(temp.path(), TAG))
            .await
            .unwrap();
        peer.send_raw(Envelope::Register.encode().unwrap()).await.unwrap();
        channel.recv(Duration::from_secs(2)).await.unwrap().unwrap();

        assert!(channel.barrier().await.is_ok());
    }

    #[tokio::test]
    async fn test_peer_sees_close_after_abort() {
        let temp = TempDir::new().unwrap();
        let mut world = SocketWorld::new(temp.path());
        let mut channel = world.split(TAG).await.unwrap();

        let mut peer = SocketPeer::connect(partition_socket_path(temp.path(), TAG))
            .await
            .unwrap();
        peer.send_raw(Envelope::Register.encode().unwrap()).await.unwrap();
        channel.recv(Duration::from_secs(2)).await.unwrap().unwrap();

        channel.abort(10).await;
        let err = peer.recv_raw(Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, ChannelError::Closed | ChannelError::Io(_)));
    }
}
