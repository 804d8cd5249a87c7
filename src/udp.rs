//! UDP path and PMTU discovery (§4.G): per-peer UDP session state,
//! probe scheduling, binary-search MTU discovery, and hole-punching.
//!
//! No donor analogue exists (the donor never speaks UDP); this module's
//! shape is grounded in `other_examples`'s ZeroTierOne `path.rs`
//! (per-path liveness/quality bookkeeping driven by explicit
//! send/receive timestamps rather than a background task per path) and
//! built to the spec's exact numeric policy.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;

use crate::error::{MeshError, Result};
use crate::wire::packet::{Packet, PacketFlags};

/// Per-peer UDP path state (§4.G).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathState {
    Unknown,
    Trying,
    Working,
    Failed,
    /// No usable address exists at all for this peer.
    Impossible,
}

pub const MIN_PROBE_SIZE: u16 = 512;
pub const MAX_PROBE_SIZE: u16 = 65535;
/// Consecutive same-size probe successes required before `mtu` is
/// fixed (§4.G: "N around 10").
pub const FIXATION_THRESHOLD: u32 = 10;
/// A WORKING path idle this long without a successful probe echo drops
/// back to TRYING (§4.G).
pub const WORKING_TIMEOUT: Duration = Duration::from_secs(30);

const MAGIC: [u8; 4] = *b"MTUP";

/// Binary-search PMTU probe state for one peer's UDP path.
pub struct PmtuProbe {
    pub state: PathState,
    pub peer_addr: Option<SocketAddr>,
    pub minmtu: u16,
    pub maxmtu: u16,
    pub mtu: Option<u16>,
    probe_seq: u32,
    consecutive_successes: u32,
    last_probe_size: Option<u16>,
    pub last_success: Option<Instant>,
    probes_sent: u64,
}

impl PmtuProbe {
    pub fn new(peer_addr: Option<SocketAddr>) -> Self {
        let state = if peer_addr.is_some() {
            PathState::Unknown
        } else {
            PathState::Impossible
        };
        Self {
            state,
            peer_addr,
            minmtu: MIN_PROBE_SIZE,
            maxmtu: MAX_PROBE_SIZE,
            mtu: None,
            probe_seq: 0,
            consecutive_successes: 0,
            last_probe_size: None,
            last_success: None,
            probes_sent: 0,
        }
    }

    pub fn probes_sent(&self) -> u64 {
        self.probes_sent
    }

    /// Picks the next probe size to try: the midpoint of the current
    /// `[minmtu, maxmtu]` search range while it's still non-empty, or
    /// the converged candidate (`minmtu`) repeated until the fixation
    /// threshold is met, once the range has collapsed.
    fn next_probe_size(&self) -> Option<u16> {
        if self.mtu.is_some() {
            return None;
        }
        if self.minmtu < self.maxmtu {
            Some(self.minmtu + (self.maxmtu - self.minmtu) / 2)
        } else {
            Some(self.minmtu)
        }
    }

    /// Builds the next probe packet to send, transitioning
    /// `UNKNOWN`/`FAILED` into `TRYING` as a side effect.
    pub fn build_probe(&mut self) -> Option<Packet> {
        if self.state == PathState::Impossible {
            return None;
        }
        let size = self.next_probe_size()?;
        if self.state == PathState::Unknown || self.state == PathState::Failed {
            self.state = PathState::Trying;
        }
        self.probe_seq = self.probe_seq.wrapping_add(1);
        self.last_probe_size = Some(size);
        self.probes_sent += 1;
        let mut payload = MAGIC.to_vec();
        payload.resize(size as usize, 0);
        Some(Packet {
            seqno: self.probe_seq,
            flags: PacketFlags::PROBE,
            payload,
        })
    }

    /// Records a successful probe echo: narrows the search range while
    /// it's still open, or — once converged — counts consecutive
    /// same-size successes and fixes `mtu` once the fixation threshold
    /// is met (§4.G).
    pub fn on_probe_echo(&mut self, size: u16) {
        self.last_success = Some(Instant::now());
        let converged = self.minmtu >= self.maxmtu;

        if Some(size) == self.last_probe_size {
            self.consecutive_successes += 1;
        } else {
            self.consecutive_successes = 1;
        }
        self.minmtu = self.minmtu.max(size);

        if converged && self.consecutive_successes >= FIXATION_THRESHOLD {
            self.mtu = Some(self.minmtu);
            self.state = PathState::Working;
        }
    }

    /// Records a probe timeout (no echo): narrows the max bound.
    pub fn on_probe_timeout(&mut self) {
        if let Some(size) = self.last_probe_size {
            self.maxmtu = self.maxmtu.min(size.saturating_sub(1)).max(self.minmtu);
        }
        self.consecutive_successes = 0;
        if self.state == PathState::Trying && self.minmtu >= self.maxmtu && self.mtu.is_none() {
            self.state = PathState::Failed;
        }
    }

    /// Resets the search range and drops back to TRYING after a
    /// WORKING path has gone quiet (§4.G: "30s with no successful
    /// probe echo").
    pub fn check_working_timeout(&mut self) {
        if self.state != PathState::Working {
            return;
        }
        let stale = self
            .last_success
            .map(|t| t.elapsed() >= WORKING_TIMEOUT)
            .unwrap_or(true);
        if stale {
            self.state = PathState::Trying;
            self.mtu = None;
            self.minmtu = MIN_PROBE_SIZE;
            self.maxmtu = MAX_PROBE_SIZE;
            self.consecutive_successes = 0;
        }
    }

    /// Marks the path permanently unusable, e.g. after repeated
    /// hole-punch failure indicating a symmetric NAT (§4.G).
    pub fn mark_impossible(&mut self) {
        self.state = PathState::Impossible;
        self.mtu = None;
    }
}

/// Binds the UDP data socket for one mesh instance (§6: "one
/// configurable UDP port, same number as the TCP meta-connection
/// port").
pub async fn bind(port: u16) -> Result<UdpSocket> {
    let addr: SocketAddr = format!("0.0.0.0:{port}")
        .parse()
        .map_err(|_| MeshError::inval("invalid UDP bind port"))?;
    UdpSocket::bind(addr)
        .await
        .map_err(|e| MeshError::network(format!("UDP bind failed: {e}")))
}

/// Sends a probe datagram to `addr`.
pub async fn send_probe(socket: &UdpSocket, addr: SocketAddr, packet: &Packet) -> Result<()> {
    let encoded = packet.encode()?;
    socket
        .send_to(&encoded, addr)
        .await
        .map_err(|e| MeshError::network(format!("UDP send failed: {e}")))?;
    Ok(())
}

/// Hole-punch: both sides send a probe to the address learned from
/// gossip or the meta-connection at roughly the same time, relying on
/// the simultaneous-send NAT-traversal trick (§4.G; this is the only
/// NAT traversal this library attempts, per §1's Non-goals).
pub async fn hole_punch(socket: &UdpSocket, addr: SocketAddr) -> Result<()> {
    let probe = Packet {
        seqno: 0,
        flags: PacketFlags::PROBE,
        payload: MAGIC.to_vec(),
    };
    send_probe(socket, addr, &probe).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "203.0.113.10:655".parse().unwrap()
    }

    #[test]
    fn no_address_is_impossible() {
        let probe = PmtuProbe::new(None);
        assert_eq!(probe.state, PathState::Impossible);
    }

    #[test]
    fn probe_sizes_stay_within_bounds_and_converge() {
        let mut probe = PmtuProbe::new(Some(addr()));
        let mut iterations = 0;
        while let Some(pkt) = probe.build_probe() {
            assert!(pkt.payload.len() as u16 >= MIN_PROBE_SIZE);
            assert!(pkt.payload.len() as u16 <= MAX_PROBE_SIZE);
            probe.on_probe_echo(pkt.payload.len() as u16);
            iterations += 1;
            assert!(iterations < 100);
        }
        assert!(probe.mtu.is_some());
    }

    #[test]
    fn converges_to_working_with_bounded_probes() {
        let mut probe = PmtuProbe::new(Some(addr()));
        probe.maxmtu = 800;
        let mut sent = 0u32;
        loop {
            let Some(pkt) = probe.build_probe() else { break };
            sent += 1;
            probe.on_probe_echo(pkt.payload.len() as u16);
            if probe.mtu.is_some() {
                break;
            }
            assert!(sent < 30, "should converge well within 30 probes");
        }
        let mtu = probe.mtu.unwrap();
        assert!(mtu <= 800);
        assert_eq!(probe.state, PathState::Working);
    }

    #[test]
    fn timeout_with_collapsed_range_marks_failed() {
        let mut probe = PmtuProbe::new(Some(addr()));
        probe.maxmtu = MIN_PROBE_SIZE;
        let _ = probe.build_probe();
        probe.on_probe_timeout();
        assert_eq!(probe.state, PathState::Failed);
    }

    #[test]
    fn working_path_resets_after_idle_timeout() {
        let mut probe = PmtuProbe::new(Some(addr()));
        probe.state = PathState::Working;
        probe.mtu = Some(1400);
        probe.last_success = Some(Instant::now() - Duration::from_secs(31));
        probe.check_working_timeout();
        assert_eq!(probe.state, PathState::Trying);
        assert!(probe.mtu.is_none());
    }

    #[test]
    fn mark_impossible_clears_mtu() {
        let mut probe = PmtuProbe::new(Some(addr()));
        probe.mtu = Some(1400);
        probe.mark_impossible();
        assert_eq!(probe.state, PathState::Impossible);
        assert!(probe.mtu.is_none());
    }
}
