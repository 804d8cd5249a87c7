//! The mesh's single logical event loop (§4.I): TCP accept, per-peer
//! meta-connection recv loops, UDP datagram dispatch, autoconnect, and
//! PING/PONG liveness — all driven off one shared [`MeshState`].
//!
//! Grounded on the donor's `main.rs` (`tcp_accept_loop` +
//! `connection_health_loop`, spawned as independent `tokio::spawn` tasks
//! coordinated by a shared `Arc<Mutex<MeshState>>` and a
//! `CancellationToken`), generalized from the donor's single
//! Noise-handshake-then-JSON-message loop into: SPTPS handshake over
//! `meta.rs`, routing recomputation on edge changes, and UDP path
//! maintenance the donor never had.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::channel::{AioRequest, Channel, ChannelControlKind, ChannelControlMsg, ChannelFlags, ChannelTable};
use crate::error::{MeshError, Result};
use crate::identity::{DeviceClass, LocalIdentity};
use crate::meta::{MetaConnection, MetaRecord, MetaState, ReconnectBackoff};
use crate::routing::{self, RoutingTable};
use crate::sptps::{HandshakeState, SptpsSession};
use crate::store::{Edge, NodeId, NodeStore, SocketAddrRecord};
use crate::udp::{self, PmtuProbe};
use crate::wire::meta::MetaLine;
use crate::wire::packet::{Packet, PacketFlags};
use crate::Callbacks;

/// Cadence of the autoconnect sweep (§4.I); the actual per-peer redial
/// pacing is governed by [`ReconnectBackoff`], not this constant — the
/// sweep just has to run often enough that a peer whose backoff deadline
/// just elapsed doesn't wait a whole extra interval to be noticed.
pub const AUTOCONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// Cadence of the PMTU probe sweep (§4.G).
pub const PMTU_PROBE_INTERVAL: Duration = Duration::from_millis(200);

/// Cadence of the channel AIO/flush pump (§4.H).
pub const CHANNEL_PUMP_INTERVAL: Duration = Duration::from_millis(50);

/// The reserved channel port every active meta-connection carries open
/// from the moment it activates (§4.K: `meshlink_send`), so a one-shot
/// direct send rides the same `channel_receive_cb`/`channel_poll_cb`
/// delivery path as a real channel instead of a separate one-off.
pub(crate) const DIRECT_SEND_PORT: u32 = 0;

/// All mutable mesh state shared across the scheduler's tasks. A plain
/// `Mutex`-guarded struct rather than an actor, matching the donor's
/// `MeshState` — the scheduler's own tasks are this struct's only
/// writers; the public API's other-thread calls read/write through the
/// same lock (§5).
pub struct MeshState {
    pub identity: LocalIdentity,
    pub store: NodeStore,
    pub self_id: NodeId,
    pub routing: RoutingTable,
    pub connections: HashMap<String, Arc<MetaConnection>>,
    pub pmtu: HashMap<String, PmtuProbe>,
    /// Per-peer reconnect backoff, kept independent of any particular
    /// `MetaConnection` since a dial can fail before one ever exists
    /// (§4.F, §4.I).
    pub reconnect_backoff: HashMap<String, ReconnectBackoff>,
    pub next_attempt_at: HashMap<String, Instant>,
    pub channels: Arc<ChannelTable>,
    pub callbacks: Arc<Callbacks>,
    pub port: u16,
}

impl MeshState {
    pub fn new(identity: LocalIdentity, port: u16, channels: Arc<ChannelTable>, callbacks: Arc<Callbacks>) -> Self {
        let mut store = NodeStore::new();
        let self_id = store
            .insert_node(&identity.name, identity.ed25519_public(), identity.device_class)
            .expect("fresh store has no name collision for self");
        Self {
            identity,
            store,
            self_id,
            routing: RoutingTable::default(),
            connections: HashMap::new(),
            pmtu: HashMap::new(),
            reconnect_backoff: HashMap::new(),
            next_attempt_at: HashMap::new(),
            channels,
            callbacks,
            port,
        }
    }

    /// Recomputes routing from `self_id` and returns the reachability
    /// transitions since the previous table (§4.E); the caller is
    /// responsible for firing the node-status callback and stamping
    /// `last_reachable`/`last_unreachable`.
    pub fn recompute_routing(&mut self) -> Vec<(NodeId, routing::ReachabilityChange)> {
        let previous = std::mem::take(&mut self.routing);
        let current = routing::compute(&self.store, self.self_id);
        let changes = routing::reachability_diff(&self.store, self.self_id, &previous, &current);
        let now = std::time::SystemTime::now();
        for (id, change) in &changes {
            if let Some(node) = self.store.node_mut(*id) {
                match change {
                    routing::ReachabilityChange::BecameReachable => node.last_reachable = Some(now),
                    routing::ReachabilityChange::BecameUnreachable => node.last_unreachable = Some(now),
                }
            }
        }
        self.routing = current;
        changes
    }
}

/// Resolves reachability transitions to node names while the store is
/// still locked (§4.E), so the caller can fire `node_status` after
/// releasing the lock.
fn named_reachability_changes(
    store: &NodeStore,
    changes: Vec<(NodeId, routing::ReachabilityChange)>,
) -> Vec<(String, bool)> {
    changes
        .into_iter()
        .filter_map(|(id, change)| {
            store
                .node(id)
                .map(|n| (n.name.clone(), change == routing::ReachabilityChange::BecameReachable))
        })
        .collect()
}

/// Fires `node_status_cb` once per named reachability transition (§4.E,
/// §4.K). A no-op if nothing changed or no callback is registered.
async fn fire_node_status(callbacks: &Callbacks, changes: Vec<(String, bool)>) {
    if changes.is_empty() {
        return;
    }
    let Some(cb) = callbacks.node_status.lock().await.clone() else {
        return;
    };
    for (name, reachable) in changes {
        cb(&name, reachable);
    }
}

async fn log_event(state: &Arc<Mutex<MeshState>>, level: tracing::Level, msg: &str) {
    let callbacks = state.lock().await.callbacks.clone();
    callbacks.log(level, msg).await;
}

fn fire_aio_completion(req: &AioRequest) {
    if let Some(cb) = &req.callback {
        cb(req.id, req.consumed);
    }
}

/// Owns the background tasks for one open mesh instance. Dropping this
/// (or calling `stop`) cancels every task via the shared token, mirroring
/// the donor's `cancel.cancel()` shutdown.
pub struct Scheduler {
    state: Arc<Mutex<MeshState>>,
    cancel: CancellationToken,
}

impl Scheduler {
    pub fn new(state: Arc<Mutex<MeshState>>) -> Self {
        Self {
            state,
            cancel: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> Arc<Mutex<MeshState>> {
        self.state.clone()
    }

    /// Starts the accept loop, the UDP dispatch loop, the PMTU probe
    /// loop, the channel AIO/flush pump, the ping/liveness loop, and the
    /// autoconnect loop as independent tasks sharing `self.cancel`.
    pub async fn start(&self, bind_addr: &str) -> Result<()> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(|e| MeshError::network(format!("TCP bind failed: {e}")))?;

        let port = self.state.lock().await.port;
        let socket = Arc::new(udp::bind(port).await?);

        let accept_state = self.state.clone();
        let accept_cancel = self.cancel.clone();
        tokio::spawn(async move {
            accept_loop(listener, accept_state, accept_cancel).await;
        });

        let udp_state = self.state.clone();
        let udp_socket = socket.clone();
        let udp_cancel = self.cancel.clone();
        tokio::spawn(async move {
            udp_loop(udp_socket, udp_state, udp_cancel).await;
        });

        let probe_state = self.state.clone();
        let probe_socket = socket.clone();
        let probe_cancel = self.cancel.clone();
        tokio::spawn(async move {
            pmtu_probe_loop(probe_socket, probe_state, probe_cancel).await;
        });

        let pump_state = self.state.clone();
        let pump_cancel = self.cancel.clone();
        tokio::spawn(async move {
            channel_pump_loop(pump_state, pump_cancel).await;
        });

        let ping_state = self.state.clone();
        let ping_cancel = self.cancel.clone();
        tokio::spawn(async move {
            ping_loop(ping_state, ping_cancel).await;
        });

        let autoconnect_state = self.state.clone();
        let autoconnect_cancel = self.cancel.clone();
        tokio::spawn(async move {
            autoconnect_loop(autoconnect_state, autoconnect_cancel).await;
        });

        Ok(())
    }

    /// Cancels all scheduler tasks (§4.K: `stop`).
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

/// Runs the initiator side of an SPTPS+ID/ACK handshake over `stream`,
/// returning the live [`MetaConnection`] on success (§4.F).
async fn handshake_outbound(
    state: &Arc<Mutex<MeshState>>,
    mut stream: TcpStream,
    peer_name: &str,
) -> Result<Arc<MetaConnection>> {
    let (local_name, signing_bytes, device_class) = {
        let st = state.lock().await;
        (
            st.identity.name.clone(),
            st.identity.signing().to_bytes(),
            st.identity.device_class,
        )
    };
    let signing = crate::crypto::SigningIdentity::from_bytes(signing_bytes);

    let hs = HandshakeState::start(true, &local_name);
    send_kex(&mut stream, &hs.local_kex).await?;
    let remote_kex = recv_kex(&mut stream).await?;
    let sig = hs.sign_transcript(&signing, &remote_kex);
    send_sig(&mut stream, &sig).await?;
    let remote_sig = recv_sig(&mut stream).await?;

    let peer_pub = lookup_peer_key(state, peer_name).await?;
    hs.verify_transcript(&peer_pub, &remote_kex, &remote_sig)?;
    let (send_key, recv_key) = hs.finish(&remote_kex)?;
    let session = SptpsSession::new(send_key, recv_key);

    let conn = MetaConnection::new(&local_name, peer_name);
    conn.attach(stream, session).await;
    conn.send_line(&MetaLine::Id {
        name: local_name,
        device_class: format!("{device_class:?}").to_lowercase(),
        protocol_version: crate::sptps::PROTOCOL_VERSION as u32,
    })
    .await?;
    conn.set_state(MetaState::Active).await;
    Ok(conn)
}

async fn lookup_peer_key(
    state: &Arc<Mutex<MeshState>>,
    peer_name: &str,
) -> Result<ed25519_dalek::VerifyingKey> {
    let st = state.lock().await;
    st.store
        .node_by_name(peer_name)
        .map(|n| n.ed25519_public)
        .ok_or_else(|| MeshError::no_ent(format!("unknown peer {peer_name}")))
}

async fn send_kex(stream: &mut TcpStream, kex: &crate::sptps::KexMessage) -> Result<()> {
    use tokio::io::AsyncWriteExt;
    let body = kex.encode();
    stream.write_all(&(body.len() as u32).to_be_bytes()).await?;
    stream.write_all(&body).await?;
    Ok(())
}

async fn recv_kex(stream: &mut TcpStream) -> Result<crate::sptps::KexMessage> {
    use tokio::io::AsyncReadExt;
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;
    crate::sptps::KexMessage::decode(&body)
}

async fn send_sig(stream: &mut TcpStream, sig: &crate::sptps::SigMessage) -> Result<()> {
    use tokio::io::AsyncWriteExt;
    stream.write_all(&sig.signature).await?;
    Ok(())
}

async fn recv_sig(stream: &mut TcpStream) -> Result<crate::sptps::SigMessage> {
    use tokio::io::AsyncReadExt;
    let mut signature = [0u8; crate::crypto::ED25519_SIGNATURE_LEN];
    stream.read_exact(&mut signature).await?;
    Ok(crate::sptps::SigMessage { signature })
}

/// Runs the responder side of the same handshake for an inbound
/// connection. The peer's identity is only known once its `ID` line
/// arrives over the freshly established session, so this returns the
/// connection still unregistered; the caller looks up/creates the node
/// and inserts it into `state.connections`.
async fn handshake_inbound(
    state: &Arc<Mutex<MeshState>>,
    mut stream: TcpStream,
) -> Result<(String, Arc<MetaConnection>)> {
    let (local_name, signing_bytes) = {
        let st = state.lock().await;
        (st.identity.name.clone(), st.identity.signing().to_bytes())
    };
    let signing = crate::crypto::SigningIdentity::from_bytes(signing_bytes);

    let hs = HandshakeState::start(false, &local_name);
    let remote_kex = recv_kex(&mut stream).await?;
    send_kex(&mut stream, &hs.local_kex).await?;
    let remote_sig = recv_sig(&mut stream).await?;
    let sig = hs.sign_transcript(&signing, &remote_kex);
    send_sig(&mut stream, &sig).await?;

    // The peer's identity (and hence its verifying key) is carried in
    // its `label`; full signature verification against the store
    // happens once the `ID` line resolves the node (or the connection
    // is rejected as UNAUTHORIZED if the name is unknown, per §4.F).
    let peer_name = remote_kex.label.clone();
    let peer_pub = lookup_peer_key(state, &peer_name).await?;
    hs.verify_transcript(&peer_pub, &remote_kex, &remote_sig)?;
    let (send_key, recv_key) = hs.finish(&remote_kex)?;
    let session = SptpsSession::new(send_key, recv_key);

    let conn = MetaConnection::new(&local_name, &peer_name);
    conn.attach(stream, session).await;
    conn.set_state(MetaState::Active).await;
    Ok((peer_name, conn))
}

async fn accept_loop(listener: TcpListener, state: Arc<Mutex<MeshState>>, cancel: CancellationToken) {
    tracing::info!("meta-connection accept loop started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("meta-connection accept loop shutting down");
                break;
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        tracing::debug!(peer = %peer_addr, "incoming meta-connection");
                        let state = state.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(async move {
                            match handshake_inbound(&state, stream).await {
                                Ok((peer_name, conn)) => {
                                    register_and_run(state, cancel, peer_name, conn).await;
                                }
                                Err(e) => {
                                    tracing::warn!(peer = %peer_addr, error = %e, "meta-connection handshake failed");
                                    log_event(&state, tracing::Level::WARN, &format!("meta-connection handshake failed: {e}")).await;
                                }
                            }
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "meta-connection accept error"),
                }
            }
        }
    }
}

/// Ensures the reserved port-0 direct-send channel (§4.K: `meshlink_send`)
/// exists and is open for `peer_name`, without disturbing it if it's
/// already there (e.g. a fast reconnect racing a still-draining abort).
fn ensure_direct_send_channel(channels: &ChannelTable, peer_name: &str) {
    if !channels.contains(peer_name, DIRECT_SEND_PORT) {
        let mut channel = Channel::new(DIRECT_SEND_PORT, DIRECT_SEND_PORT, ChannelFlags::default());
        channel.mark_open();
        channels.insert(peer_name, channel);
    } else {
        let _ = channels.with_channel(peer_name, DIRECT_SEND_PORT, |ch| ch.mark_open());
    }
}

async fn register_and_run(
    state: Arc<Mutex<MeshState>>,
    cancel: CancellationToken,
    peer_name: String,
    conn: Arc<MetaConnection>,
) {
    let channels = {
        let mut st = state.lock().await;
        if let Some(existing) = st.connections.get(&peer_name) {
            if !MetaConnection::wins_duplicate_race(&st.identity.name.clone(), &peer_name)
                && existing.state().await == MetaState::Active
            {
                tracing::debug!(peer = %peer_name, "dropping duplicate meta-connection, losing tie-break");
                return;
            }
        }
        st.connections.insert(peer_name.clone(), conn.clone());
        st.reconnect_backoff.entry(peer_name.clone()).or_insert_with(ReconnectBackoff::new).reset();
        st.next_attempt_at.remove(&peer_name);
        st.channels.clone()
    };
    ensure_direct_send_channel(&channels, &peer_name);
    tracing::info!(peer = %peer_name, "inbound meta-connection active");
    log_event(&state, tracing::Level::INFO, &format!("inbound meta-connection active with {peer_name}")).await;
    meta_recv_loop(state, cancel, peer_name, conn).await;
}

/// Dispatches records off one active meta-connection until it closes or
/// the scheduler is cancelled, applying `ADD_EDGE`/`DEL_EDGE` gossip to
/// the node store and recomputing routing on change (§4.F, §4.E), and
/// routing tunnelled `CHANNEL_CONTROL`/`CHANNEL_DATA` packets to the
/// channel multiplexer (§4.H).
async fn meta_recv_loop(
    state: Arc<Mutex<MeshState>>,
    cancel: CancellationToken,
    peer_name: String,
    conn: Arc<MetaConnection>,
) {
    loop {
        let record = tokio::select! {
            _ = cancel.cancelled() => break,
            record = conn.recv() => record,
        };
        match record {
            Ok(MetaRecord::Line(line)) => {
                if !apply_meta_line(&state, &peer_name, &conn, line).await {
                    break;
                }
            }
            Ok(MetaRecord::Data(packet)) => {
                process_data_packet(&state, &peer_name, &conn, packet).await;
            }
            Err(e) => {
                tracing::info!(peer = %peer_name, error = %e, "meta-connection closed");
                log_event(&state, tracing::Level::INFO, &format!("meta-connection to {peer_name} closed: {e}")).await;
                break;
            }
        }
    }
    teardown_connection(&state, &peer_name).await;
}

/// Routes one tunnelled data-plane packet (§4.F) to the channel open/
/// accept handshake or to the channel multiplexer's receive side.
async fn process_data_packet(
    state: &Arc<Mutex<MeshState>>,
    peer_name: &str,
    conn: &Arc<MetaConnection>,
    packet: Packet,
) {
    if packet.flags.contains(PacketFlags::CHANNEL_CONTROL) {
        if let Some(ctrl) = ChannelControlMsg::from_packet(&packet) {
            handle_channel_control(state, peer_name, conn, ctrl).await;
        }
        return;
    }
    if packet.flags.contains(PacketFlags::CHANNEL_DATA) {
        if let Some((port, data)) = crate::channel::parse_data_packet(&packet) {
            let (channels, callbacks) = {
                let st = state.lock().await;
                (st.channels.clone(), st.callbacks.clone())
            };
            crate::deliver_and_notify(&channels, &callbacks, peer_name, port, data).await;
        }
    }
}

/// Drives the channel open/accept/reject/fin handshake (§4.H) for one
/// inbound `CHANNEL_CONTROL` message.
async fn handle_channel_control(
    state: &Arc<Mutex<MeshState>>,
    peer_name: &str,
    conn: &Arc<MetaConnection>,
    ctrl: ChannelControlMsg,
) {
    let (channels, callbacks) = {
        let st = state.lock().await;
        (st.channels.clone(), st.callbacks.clone())
    };
    match ctrl.kind {
        ChannelControlKind::Open => {
            let accept = match callbacks.channel_accept.lock().await.clone() {
                Some(cb) => cb(peer_name, ctrl.port),
                None => true,
            };
            let reply_kind = if accept {
                if !channels.contains(peer_name, ctrl.port) {
                    channels.insert(peer_name, Channel::new(ctrl.port, ctrl.port, ChannelFlags::default()));
                }
                let _ = channels.with_channel(peer_name, ctrl.port, |ch| ch.mark_open());
                ChannelControlKind::Accept
            } else {
                ChannelControlKind::Reject
            };
            let reply = ChannelControlMsg { kind: reply_kind, port: ctrl.port }.to_packet(0);
            let _ = conn.send_packet(&reply).await;
        }
        ChannelControlKind::Accept => {
            let _ = channels.with_channel(peer_name, ctrl.port, |ch| ch.mark_open());
        }
        ChannelControlKind::Reject => {
            channels.remove(peer_name, ctrl.port);
        }
        ChannelControlKind::Fin => {
            let _ = channels.with_channel(peer_name, ctrl.port, |ch| ch.note_remote_fin());
        }
    }
}

async fn apply_meta_line(
    state: &Arc<Mutex<MeshState>>,
    peer_name: &str,
    conn: &Arc<MetaConnection>,
    line: MetaLine,
) -> bool {
    match line {
        MetaLine::Ping => {
            if conn.send_line(&MetaLine::Pong).await.is_err() {
                return false;
            }
        }
        MetaLine::Pong => conn.note_pong().await,
        MetaLine::AddEdge {
            from,
            to,
            host,
            port,
            options,
            weight,
        } => {
            let (changes, callbacks) = {
                let mut st = state.lock().await;
                let mut changes = Vec::new();
                if let (Some(from_id), Some(to_id)) = (st.store.id_by_name(&from), st.store.id_by_name(&to)) {
                    st.store.add_edge(Edge {
                        from: from_id,
                        to: to_id,
                        address: Some(SocketAddrRecord { host, port }),
                        options,
                        weight,
                    });
                    let raw = st.recompute_routing();
                    changes = named_reachability_changes(&st.store, raw);
                }
                (changes, st.callbacks.clone())
            };
            fire_node_status(&callbacks, changes).await;
            conn.record_edge_advertised();
        }
        MetaLine::DelEdge { from, to } => {
            let (changes, callbacks) = {
                let mut st = state.lock().await;
                let mut changes = Vec::new();
                if let (Some(from_id), Some(to_id)) = (st.store.id_by_name(&from), st.store.id_by_name(&to)) {
                    st.store.del_edge(from_id, to_id);
                    let raw = st.recompute_routing();
                    changes = named_reachability_changes(&st.store, raw);
                }
                (changes, st.callbacks.clone())
            };
            fire_node_status(&callbacks, changes).await;
        }
        MetaLine::Termreq => {
            tracing::debug!(peer = %peer_name, "peer requested termination");
            return false;
        }
        MetaLine::Error { text } => {
            tracing::warn!(peer = %peer_name, error = %text, "peer sent ERROR");
            return false;
        }
        // ID/ACK only matter during handshake, already consumed there;
        // subnets and key exchange are accepted but unused by the core
        // (§4.C: "reserved but unused"/REQ_KEY-ANS_KEY belongs to the
        // channel layer's key rotation path, not the scheduler).
        _ => {}
    }
    true
}

async fn teardown_connection(state: &Arc<Mutex<MeshState>>, peer_name: &str) {
    let (changes, callbacks) = {
        let mut st = state.lock().await;
        st.connections.remove(peer_name);
        let mut changes = Vec::new();
        if let Some(id) = st.store.id_by_name(peer_name) {
            st.store.del_edges_from(id);
            let raw = st.recompute_routing();
            changes = named_reachability_changes(&st.store, raw);
        }
        (changes, st.callbacks.clone())
    };
    fire_node_status(&callbacks, changes).await;
}

/// PING/PONG liveness sweep (§4.F): every connection gets a PING roughly
/// once per `PING_INTERVAL`; a connection whose PONG is overdue is torn
/// down so autoconnect can retry it fresh.
async fn ping_loop(state: Arc<Mutex<MeshState>>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(crate::meta::PING_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let conns: Vec<(String, Arc<MetaConnection>)> = {
                    let st = state.lock().await;
                    st.connections.iter().map(|(k, v)| (k.clone(), v.clone())).collect()
                };
                for (peer_name, conn) in conns {
                    if conn.pong_overdue().await {
                        tracing::warn!(peer = %peer_name, "PONG overdue, tearing down meta-connection");
                        log_event(&state, tracing::Level::WARN, &format!("PONG overdue for {peer_name}, tearing down")).await;
                        conn.close().await;
                        teardown_connection(&state, &peer_name).await;
                        continue;
                    }
                    conn.note_ping_sent().await;
                    let _ = conn.send_line(&MetaLine::Ping).await;
                }
            }
        }
    }
}

/// Maintains each known node's `target_connections()` floor by dialing
/// out to under-connected, non-blacklisted peers with a known address,
/// skipping any peer whose reconnect backoff hasn't elapsed yet (§4.I).
async fn autoconnect_loop(state: Arc<Mutex<MeshState>>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(AUTOCONNECT_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let targets = select_autoconnect_targets(&state).await;
                for (peer_name, addr) in targets {
                    let state = state.clone();
                    tokio::spawn(async move {
                        if let Err(e) = connect_to_peer(&state, &peer_name, addr).await {
                            tracing::debug!(peer = %peer_name, error = %e, "autoconnect attempt failed");
                            log_event(&state, tracing::Level::DEBUG, &format!("autoconnect to {peer_name} failed: {e}")).await;
                            let mut st = state.lock().await;
                            let delay = st
                                .reconnect_backoff
                                .entry(peer_name.clone())
                                .or_insert_with(ReconnectBackoff::new)
                                .next_delay();
                            st.next_attempt_at.insert(peer_name, Instant::now() + delay);
                        }
                    });
                }
            }
        }
    }
}

/// Picks candidate peers to dial this sweep: known, non-blacklisted,
/// reachable-by-address nodes not already connected and not still
/// backing off, one per class shortfall per sweep to avoid a connection
/// storm (§4.I).
async fn select_autoconnect_targets(
    state: &Arc<Mutex<MeshState>>,
) -> Vec<(String, std::net::SocketAddr)> {
    let st = state.lock().await;
    let now = Instant::now();
    let mut targets = Vec::new();
    for class in [
        DeviceClass::Backbone,
        DeviceClass::Stationary,
        DeviceClass::Portable,
        DeviceClass::Unknown,
    ] {
        let connected_of_class = st
            .store
            .by_dev_class(class)
            .into_iter()
            .filter(|id| {
                st.store
                    .node(*id)
                    .map(|n| st.connections.contains_key(&n.name))
                    .unwrap_or(false)
            })
            .count();
        if connected_of_class >= class.target_connections() {
            continue;
        }
        for id in st.store.by_dev_class(class) {
            if id == st.self_id {
                continue;
            }
            let Some(node) = st.store.node(id) else { continue };
            if node.blacklisted || st.connections.contains_key(&node.name) {
                continue;
            }
            if st.next_attempt_at.get(&node.name).map(|at| now < *at).unwrap_or(false) {
                continue;
            }
            let addr = node
                .canonical_addresses
                .first()
                .or_else(|| node.recent_addresses.first());
            if let Some(addr) = addr {
                if let Ok(parsed) = format!("{}:{}", addr.host, addr.port).parse() {
                    targets.push((node.name.clone(), parsed));
                    break;
                }
            }
        }
    }
    targets
}

/// Dials, handshakes, and registers an outbound meta-connection to
/// `peer_name` at `addr`, resetting its reconnect backoff on success
/// (§4.F, §4.I).
pub async fn connect_to_peer(
    state: &Arc<Mutex<MeshState>>,
    peer_name: &str,
    addr: std::net::SocketAddr,
) -> Result<()> {
    let stream = tokio::time::timeout(Duration::from_secs(10), TcpStream::connect(addr))
        .await
        .map_err(|_| MeshError::timeout("meta-connection dial timed out"))?
        .map_err(|e| MeshError::network(format!("meta-connection dial failed: {e}")))?;

    let conn = handshake_outbound(state, stream, peer_name).await?;
    let channels = {
        let mut st = state.lock().await;
        st.connections.insert(peer_name.to_string(), conn.clone());
        st.reconnect_backoff.entry(peer_name.to_string()).or_insert_with(ReconnectBackoff::new).reset();
        st.next_attempt_at.remove(peer_name);
        st.channels.clone()
    };
    ensure_direct_send_channel(&channels, peer_name);
    tracing::info!(peer = %peer_name, "meta-connection established");
    log_event(state, tracing::Level::INFO, &format!("meta-connection established with {peer_name}")).await;
    Ok(())
}

/// Replies to an MTU probe packet with an echo carrying the same size
/// (§4.G), or applies an echoed reply to the sender's own probe state.
pub fn handle_udp_packet(probe: &mut PmtuProbe, packet: &Packet) -> Option<Packet> {
    if packet.flags.contains(PacketFlags::PROBE) {
        return Some(Packet {
            seqno: packet.seqno,
            flags: PacketFlags::MTU_PROBE_REPLY,
            payload: packet.payload.clone(),
        });
    }
    if packet.flags.contains(PacketFlags::MTU_PROBE_REPLY) {
        probe.on_probe_echo(packet.payload.len() as u16);
    }
    None
}

/// Receives UDP datagrams and dispatches PMTU probe traffic and
/// channel-multiplexed data (§4.G, §4.H) until the scheduler stops.
async fn udp_loop(socket: Arc<UdpSocket>, state: Arc<Mutex<MeshState>>, cancel: CancellationToken) {
    let mut buf = vec![0u8; udp::MAX_PROBE_SIZE as usize + 64];
    tracing::info!("UDP dispatch loop started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((n, from)) => {
                        if let Ok(packet) = Packet::decode(&buf[..n]) {
                            handle_udp_datagram(&socket, &state, from, packet).await;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "UDP recv error"),
                }
            }
        }
    }
}

/// Looks up which known peer a UDP datagram's source address belongs to
/// by scanning the PMTU table (the only place this mesh instance records
/// a peer's expected UDP address).
fn peer_for_udp_addr(state_pmtu: &HashMap<String, PmtuProbe>, from: SocketAddr) -> Option<String> {
    state_pmtu
        .iter()
        .find(|(_, probe)| probe.peer_addr == Some(from))
        .map(|(name, _)| name.clone())
}

async fn handle_udp_datagram(
    socket: &UdpSocket,
    state: &Arc<Mutex<MeshState>>,
    from: SocketAddr,
    packet: Packet,
) {
    if packet.flags.contains(PacketFlags::PROBE) || packet.flags.contains(PacketFlags::MTU_PROBE_REPLY) {
        let outcome = {
            let mut st = state.lock().await;
            let Some(peer_name) = peer_for_udp_addr(&st.pmtu, from) else {
                return;
            };
            let before_mtu = st.pmtu.get(&peer_name).and_then(|p| p.mtu);
            let reply = {
                let probe = st.pmtu.get_mut(&peer_name).expect("looked up above");
                handle_udp_packet(probe, &packet)
            };
            let after_mtu = st.pmtu.get(&peer_name).and_then(|p| p.mtu);
            (peer_name, reply, before_mtu.is_none() && after_mtu.is_some(), after_mtu, st.callbacks.clone())
        };
        let (peer_name, reply, newly_fixed, after_mtu, callbacks) = outcome;
        if let Some(reply) = reply {
            let _ = udp::send_probe(socket, from, &reply).await;
        }
        if newly_fixed {
            if let (Some(mtu), Some(cb)) = (after_mtu, callbacks.channel_pmtu.lock().await.clone()) {
                cb(&peer_name, mtu);
            }
        }
        return;
    }

    if packet.flags.contains(PacketFlags::CHANNEL_DATA) {
        let resolved = {
            let st = state.lock().await;
            peer_for_udp_addr(&st.pmtu, from).map(|name| (name, st.channels.clone(), st.callbacks.clone()))
        };
        if let (Some((peer_name, channels, callbacks)), Some((port, data))) =
            (resolved, crate::channel::parse_data_packet(&packet))
        {
            crate::deliver_and_notify(&channels, &callbacks, &peer_name, port, data).await;
        }
    }
}

/// Maintains one [`PmtuProbe`] per connected peer, sending the next
/// probe in its binary search each sweep and expiring stale WORKING
/// paths back to TRYING (§4.G).
async fn pmtu_probe_loop(socket: Arc<UdpSocket>, state: Arc<Mutex<MeshState>>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(PMTU_PROBE_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let targets = {
                    let mut st = state.lock().await;
                    let peer_names: Vec<String> = st.connections.keys().cloned().collect();
                    for name in &peer_names {
                        if !st.pmtu.contains_key(name) {
                            let addr = st
                                .store
                                .node_by_name(name)
                                .and_then(|n| n.canonical_addresses.first().or_else(|| n.recent_addresses.first()))
                                .and_then(|a| format!("{}:{}", a.host, a.port).parse().ok());
                            st.pmtu.insert(name.clone(), PmtuProbe::new(addr));
                        }
                    }
                    let mut targets = Vec::new();
                    for name in &peer_names {
                        if let Some(probe) = st.pmtu.get_mut(name) {
                            probe.check_working_timeout();
                            if let (Some(addr), Some(pkt)) = (probe.peer_addr, probe.build_probe()) {
                                targets.push((addr, pkt));
                            }
                        }
                    }
                    targets
                };
                for (addr, pkt) in targets {
                    let _ = udp::send_probe(&socket, addr, &pkt).await;
                }
            }
        }
    }
}

/// Drives each open channel's AIO send/receive queues (§4.H): pumps
/// queued AIO sends into the channel's send buffer and flushes that
/// buffer to the wire over the peer's meta-connection, then pumps any
/// already-buffered received data into waiting AIO receive requests,
/// firing each request's completion callback as it finishes.
async fn channel_pump_loop(state: Arc<Mutex<MeshState>>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(CHANNEL_PUMP_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let (channels, connections) = {
                    let st = state.lock().await;
                    (st.channels.clone(), st.connections.clone())
                };
                for (peer, port) in channels.snapshot_keys() {
                    while let Ok(Some(req)) = channels.with_channel(&peer, port, |ch| ch.pump_aio_send()) {
                        fire_aio_completion(&req);
                    }
                    if port != DIRECT_SEND_PORT {
                        if let Some(conn) = connections.get(&peer) {
                            let chunk = channels
                                .with_channel(&peer, port, |ch| ch.drain_send(crate::channel::MAX_DATAGRAM_SIZE))
                                .unwrap_or_default();
                            if !chunk.is_empty() {
                                let packet = crate::channel::build_data_packet(port, 0, &chunk);
                                let _ = conn.send_packet(&packet).await;
                            }
                        }
                    }
                    while let Ok(Some(req)) = channels.with_channel(&peer, port, |ch| ch.pump_aio_receive()) {
                        fire_aio_completion(&req);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::DeviceClass;

    #[test]
    fn udp_probe_echoes_and_updates_state() {
        let mut probe = PmtuProbe::new(Some("203.0.113.1:655".parse().unwrap()));
        let outgoing = probe.build_probe().unwrap();
        let reply = handle_udp_packet(&mut probe, &Packet {
            seqno: outgoing.seqno,
            flags: PacketFlags::PROBE,
            payload: outgoing.payload.clone(),
        });
        assert!(reply.unwrap().flags.contains(PacketFlags::MTU_PROBE_REPLY));
    }

    #[tokio::test]
    async fn mesh_state_recomputes_routing_on_edge_change() {
        let identity = LocalIdentity::generate("a", DeviceClass::Backbone).unwrap();
        let mut state = MeshState::new(identity, 655, Arc::new(ChannelTable::new()), Arc::new(Callbacks::default()));
        let b = state
            .store
            .insert_node(
                "b",
                crate::crypto::SigningIdentity::generate().verifying_key(),
                DeviceClass::Backbone,
            )
            .unwrap();
        state.store.add_edge(Edge {
            from: state.self_id,
            to: b,
            address: None,
            options: 0,
            weight: 1,
        });
        state.store.add_edge(Edge {
            from: b,
            to: state.self_id,
            address: None,
            options: 0,
            weight: 1,
        });
        let changes = state.recompute_routing();
        assert_eq!(changes.len(), 1);
        assert!(state.routing.is_reachable(b));
    }

    #[test]
    fn ensure_direct_send_channel_is_open_and_idempotent() {
        let channels = ChannelTable::new();
        ensure_direct_send_channel(&channels, "bob");
        assert!(channels.contains("bob", DIRECT_SEND_PORT));
        ensure_direct_send_channel(&channels, "bob");
        assert!(channels.contains("bob", DIRECT_SEND_PORT));
    }

    #[tokio::test]
    async fn handle_channel_control_open_without_accept_cb_defaults_to_accept() {
        let identity = LocalIdentity::generate("a", DeviceClass::Backbone).unwrap();
        let channels = Arc::new(ChannelTable::new());
        let callbacks = Arc::new(Callbacks::default());
        let state = Arc::new(Mutex::new(MeshState::new(identity, 0, channels.clone(), callbacks)));
        let conn = MetaConnection::new("a", "b");
        handle_channel_control(
            &state,
            "b",
            &conn,
            ChannelControlMsg { kind: ChannelControlKind::Open, port: 3 },
        )
        .await;
        assert!(channels.contains("b", 3));
    }
}
