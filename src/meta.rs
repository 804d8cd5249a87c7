//! Meta-connection (§4.F): a per-peer TCP link carrying SPTPS-wrapped
//! control traffic (ID/ACK, gossip, PING/PONG) and, when UDP isn't
//! WORKING for that peer, tunnelled data packets.
//!
//! Grounded on the donor's `transport.rs` `MeshConnection` (split
//! `OwnedReadHalf`/`OwnedWriteHalf` behind `Arc<Mutex<_>>`,
//! `ReconnectBackoff`) and `gossip.rs`'s async dispatch/state-locking
//! pattern — reused here for `ADD_EDGE`/`DEL_EDGE` gossip instead of
//! room sync.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::error::{MeshError, Result};
use crate::sptps::SptpsSession;
use crate::wire::meta::MetaLine;
use crate::wire::packet::Packet;

pub const META_RECORD_TYPE: u8 = 1;
pub const PACKET_RECORD_TYPE: u8 = 2;

pub const PING_INTERVAL: Duration = Duration::from_secs(60);
pub const PONG_TIMEOUT: Duration = Duration::from_secs(30);
pub const BACKOFF_BASE: Duration = Duration::from_secs(1);
pub const BACKOFF_CAP: Duration = Duration::from_secs(15 * 60);

/// Meta-connection lifecycle state (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaState {
    Unconnected,
    Connecting,
    Handshake,
    Active,
    Closing,
}

/// Exponential backoff for reconnect attempts, capped at 15 minutes
/// (§4.F). Same doubling-and-cap idiom as the donor's
/// `transport::ReconnectBackoff`, retimed to the spec's constants.
pub struct ReconnectBackoff {
    attempt: u32,
    base: Duration,
    cap: Duration,
}

impl ReconnectBackoff {
    pub fn new() -> Self {
        Self {
            attempt: 0,
            base: BACKOFF_BASE,
            cap: BACKOFF_CAP,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let scale = 2u64.saturating_pow(self.attempt);
        let delay = self.base.saturating_mul(scale as u32).min(self.cap);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::new()
    }
}

/// Length-prefixed (u32 big-endian) write of an SPTPS ciphertext record
/// over a reliable byte stream — the stream-mode framing from §4.B
/// (`type | length:u16 (stream mode) | ciphertext | tag`), collapsed
/// here into one write since `type` and `length` are folded into the
/// record header written by the caller.
async fn write_frame(writer: &mut OwnedWriteHalf, record_type: u8, seqno: u64, ciphertext: &[u8]) -> Result<()> {
    let mut header = Vec::with_capacity(1 + 8 + 4);
    header.push(record_type);
    header.extend_from_slice(&seqno.to_be_bytes());
    header.extend_from_slice(&(ciphertext.len() as u32).to_be_bytes());
    writer.write_all(&header).await?;
    writer.write_all(ciphertext).await?;
    Ok(())
}

async fn read_frame(reader: &mut OwnedReadHalf) -> Result<(u8, u64, Vec<u8>)> {
    let mut header = [0u8; 1 + 8 + 4];
    reader.read_exact(&mut header).await?;
    let record_type = header[0];
    let seqno = u64::from_be_bytes(header[1..9].try_into().unwrap());
    let len = u32::from_be_bytes(header[9..13].try_into().unwrap()) as usize;
    let mut ciphertext = vec![0u8; len];
    reader.read_exact(&mut ciphertext).await?;
    Ok((record_type, seqno, ciphertext))
}

/// A stateful meta-connection to exactly one peer. At most one may be
/// ACTIVE for a given peer at a time; `wins_duplicate_race` implements
/// the deterministic tie-break (smaller name wins, §3).
pub struct MetaConnection {
    pub peer_name: String,
    pub local_name: String,
    state: Mutex<MetaState>,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    session: Mutex<Option<SptpsSession>>,
    pub backoff: Mutex<ReconnectBackoff>,
    last_pong: Mutex<Option<Instant>>,
    last_ping_sent: Mutex<Option<Instant>>,
    edges_advertised: AtomicU64,
}

impl MetaConnection {
    pub fn new(local_name: &str, peer_name: &str) -> Arc<Self> {
        Arc::new(Self {
            peer_name: peer_name.to_string(),
            local_name: local_name.to_string(),
            state: Mutex::new(MetaState::Unconnected),
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            session: Mutex::new(None),
            backoff: Mutex::new(ReconnectBackoff::new()),
            last_pong: Mutex::new(None),
            last_ping_sent: Mutex::new(None),
            edges_advertised: AtomicU64::new(0),
        })
    }

    pub async fn state(&self) -> MetaState {
        *self.state.lock().await
    }

    pub async fn set_state(&self, new: MetaState) {
        *self.state.lock().await = new;
    }

    /// Attaches a connected TCP stream and a freshly established SPTPS
    /// session, transitioning `HANDSHAKE -> ACTIVE` once the caller has
    /// already completed the `ID`/`ACK` exchange (driven by `meta.rs`'s
    /// caller, typically `scheduler.rs`).
    pub async fn attach(&self, stream: TcpStream, session: SptpsSession) {
        let (read_half, write_half) = stream.into_split();
        *self.reader.lock().await = Some(read_half);
        *self.writer.lock().await = Some(write_half);
        *self.session.lock().await = Some(session);
        *self.last_pong.lock().await = Some(Instant::now());
    }

    /// Deterministic duplicate-activation tie-break: the connection
    /// whose local name sorts smaller wins (§3).
    pub fn wins_duplicate_race(local_name: &str, peer_name: &str) -> bool {
        local_name < peer_name
    }

    /// Sends one meta-protocol control line (§4.C), wrapped as an SPTPS
    /// application record of type `META` (§4.F).
    pub async fn send_line(&self, line: &MetaLine) -> Result<()> {
        let mut text = line.to_string();
        text.push('\n');
        let mut session_guard = self.session.lock().await;
        let session = session_guard
            .as_mut()
            .ok_or_else(|| MeshError::network("meta-connection has no live session"))?;
        let (seqno, ciphertext) = session.seal(META_RECORD_TYPE, text.as_bytes())?;
        drop(session_guard);
        let mut writer_guard = self.writer.lock().await;
        let writer = writer_guard
            .as_mut()
            .ok_or_else(|| MeshError::network("meta-connection has no live socket"))?;
        write_frame(writer, META_RECORD_TYPE, seqno, &ciphertext).await
    }

    /// Encapsulates application data as a tunnelled `PACKET` record
    /// (§4.F: used when the peer's UDP path is FAILED/IMPOSSIBLE).
    pub async fn send_packet(&self, packet: &Packet) -> Result<()> {
        let payload = packet.encode()?;
        let mut session_guard = self.session.lock().await;
        let session = session_guard
            .as_mut()
            .ok_or_else(|| MeshError::network("meta-connection has no live session"))?;
        let (seqno, ciphertext) = session.seal(PACKET_RECORD_TYPE, &payload)?;
        drop(session_guard);
        let mut writer_guard = self.writer.lock().await;
        let writer = writer_guard
            .as_mut()
            .ok_or_else(|| MeshError::network("meta-connection has no live socket"))?;
        write_frame(writer, PACKET_RECORD_TYPE, seqno, &ciphertext).await
    }

    /// Reads and decrypts the next record, dispatching it to either a
    /// decoded `MetaLine` or a decoded `Packet`.
    pub async fn recv(&self) -> Result<MetaRecord> {
        let mut reader_guard = self.reader.lock().await;
        let reader = reader_guard
            .as_mut()
            .ok_or_else(|| MeshError::network("meta-connection has no live socket"))?;
        let (record_type, seqno, ciphertext) = read_frame(reader).await?;
        drop(reader_guard);

        let mut session_guard = self.session.lock().await;
        let session = session_guard
            .as_mut()
            .ok_or_else(|| MeshError::network("meta-connection has no live session"))?;
        let plaintext = session.open(record_type, seqno, &ciphertext)?;
        drop(session_guard);

        match record_type {
            META_RECORD_TYPE => {
                let text = String::from_utf8_lossy(&plaintext);
                let line = text
                    .lines()
                    .next()
                    .ok_or_else(|| MeshError::network("empty meta line"))?;
                let parsed: MetaLine = line.parse()?;
                Ok(MetaRecord::Line(parsed))
            }
            PACKET_RECORD_TYPE => {
                let packet = Packet::decode(&plaintext)?;
                Ok(MetaRecord::Data(packet))
            }
            other => Err(MeshError::network(format!(
                "unknown meta-connection record type {other}"
            ))),
        }
    }

    pub async fn note_pong(&self) {
        *self.last_pong.lock().await = Some(Instant::now());
    }

    pub async fn note_ping_sent(&self) {
        *self.last_ping_sent.lock().await = Some(Instant::now());
    }

    /// Whether a PONG is overdue (§4.F: "PONG within 30s or the
    /// connection is torn down").
    pub async fn pong_overdue(&self) -> bool {
        let sent = self.last_ping_sent.lock().await;
        let pong = self.last_pong.lock().await;
        match (*sent, *pong) {
            (Some(sent_at), Some(pong_at)) => {
                sent_at > pong_at && sent_at.elapsed() >= PONG_TIMEOUT
            }
            (Some(sent_at), None) => sent_at.elapsed() >= PONG_TIMEOUT,
            _ => false,
        }
    }

    pub fn record_edge_advertised(&self) {
        self.edges_advertised.fetch_add(1, Ordering::Relaxed);
    }

    pub fn edges_advertised_count(&self) -> u64 {
        self.edges_advertised.load(Ordering::Relaxed)
    }

    /// Zeroes the edge-advertisement counter (§4.K:
    /// `devtool_reset_node_counters`).
    pub fn reset_edges_advertised(&self) {
        self.edges_advertised.store(0, Ordering::Relaxed);
    }

    /// Tears the connection down: closes the socket halves and resets
    /// to `UNCONNECTED` so autoconnect can retry with backoff. The
    /// caller (scheduler) is responsible for deleting this peer's
    /// advertised edges from the node store (§4.F: "marks all edges
    /// advertised by that connection for deletion").
    pub async fn close(&self) {
        self.set_state(MetaState::Closing).await;
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        *self.reader.lock().await = None;
        *self.session.lock().await = None;
        self.set_state(MetaState::Unconnected).await;
    }
}

#[derive(Debug)]
pub enum MetaRecord {
    Line(MetaLine),
    Data(Packet),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps_at_fifteen_minutes() {
        let mut backoff = ReconnectBackoff::new();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        for _ in 0..20 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), BACKOFF_CAP);
    }

    #[test]
    fn backoff_resets() {
        let mut backoff = ReconnectBackoff::new();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn duplicate_tie_break_is_deterministic() {
        assert!(MetaConnection::wins_duplicate_race("alice", "bob"));
        assert!(!MetaConnection::wins_duplicate_race("bob", "alice"));
    }

    #[tokio::test]
    async fn state_transitions() {
        let conn = MetaConnection::new("foo", "bar");
        assert_eq!(conn.state().await, MetaState::Unconnected);
        conn.set_state(MetaState::Connecting).await;
        assert_eq!(conn.state().await, MetaState::Connecting);
    }
}
