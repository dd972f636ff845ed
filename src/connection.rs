// Per-connection state machine for direct-UDP sessions.
// Numan Thabit 2025

use std::{collections::VecDeque, io::IoSlice, net::SocketAddr};

use bytes::Bytes;
use prost::Message;
use thiserror::Error;
use tracing::{debug, warn};

use crate::{
    clock::{Timestamp, MILLION},
    config::{MIN_PROTOCOL_VERSION, PROTOCOL_VERSION},
    context::{Env, Event},
    crypto::{
        cert::{verify_handshake, CertBundle, CryptoError, UnsignedCertPolicy},
        session::{SessionCrypto, SessionKeys},
        AeadError,
    },
    identity::Identity,
    listener::{apply_ip_identity_policy, claimed_identity},
    proto::{
        CMsgSteamDatagramCertificateSigned, CMsgSteamDatagramSessionCryptInfoSigned,
        CMsgSteamSocketsUdpChallengeReply, CMsgSteamSocketsUdpChallengeRequest,
        CMsgSteamSocketsUdpConnectOk, CMsgSteamSocketsUdpConnectRequest,
        CMsgSteamSocketsUdpConnectionClosed, CMsgSteamSocketsUdpNoConnection,
        CMsgSteamSocketsUdpStats,
    },
    seqnum::RecvSequencer,
    socket::{BoundSocket, SharedSocket, SocketError},
    stats::{flags as stats_flags, EndpointStats, StatsReplyRequest, PING_SANITY_MAX},
    wire::{
        self, DataHeader, MsgKind, PacketClass, WireError, DATA_FLAG_PROTOBUF_BLOB,
        DATA_HEADER_LEN,
    },
};

/// End-reason codes carried in `ConnectionClosed.reason_code`.
pub mod reasons {
    pub const INVALID: u32 = 0;
    pub const APP_GENERIC: u32 = 1000;
    pub const REMOTE_BAD_CRYPT: u32 = 4002;
    pub const MISC_GENERIC: u32 = 5001;
    pub const MISC_INTERNAL_ERROR: u32 = 5002;
    pub const MISC_TIMEOUT: u32 = 5003;
}

/// How often a terminal endpoint re-sends its closing notice.
const TEARDOWN_RETRY: Timestamp = 250_000;

/// Give up re-sending the closing notice after this long.
const TEARDOWN_TIMEOUT: Timestamp = 5 * MILLION;

/// Discard handshake timestamps older than this when echoing in ConnectOK.
const HANDSHAKE_TIMESTAMP_MAX_AGE: Timestamp = 4 * MILLION;

/// Ping estimates above this are nonsense and ignored.
const PING_EST_SANITY_MS: u32 = 1500;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not yet started.
    None,
    /// Handshake in progress (active), or awaiting the application's accept
    /// (passive).
    Connecting,
    /// Present for wire compatibility; never entered by this layer.
    FindingRoute,
    Connected,
    /// Half-closed, draining.
    Linger,
    ClosedByPeer,
    ProblemDetectedLocally,
    /// We closed; retransmitting the closing notice until acked.
    FinWait,
    /// Terminal.
    Dead,
}

impl ConnectionState {
    pub fn terminal(self) -> bool {
        matches!(self, ConnectionState::Dead)
    }

    fn half_dead(self) -> bool {
        matches!(
            self,
            ConnectionState::ClosedByPeer
                | ConnectionState::ProblemDetectedLocally
                | ConnectionState::FinWait
        )
    }
}

/// Opaque handle to a connection slot in the context table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    pub(crate) slot: u32,
    pub(crate) generation: u32,
}

impl ConnectionHandle {
    pub(crate) fn raw(self) -> u64 {
        (u64::from(self.slot) << 32) | u64::from(self.generation)
    }

    pub(crate) fn from_raw(raw: u64) -> Self {
        Self {
            slot: (raw >> 32) as u32,
            generation: raw as u32,
        }
    }
}

/// Which side of the handshake we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We called connect().
    Active,
    /// We were accepted off a listener.
    Passive { listener: usize },
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("socket error: {0}")]
    Socket(#[from] SocketError),
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("aead error: {0}")]
    Aead(#[from] AeadError),
    #[error("connection is in state {0:?}")]
    InvalidState(ConnectionState),
    #[error("no transport attached")]
    NoTransport,
    #[error("local identity required but auth not allowed")]
    IdentityRequired,
}

/// Piggyback context assembled for one outbound data packet.
#[derive(Debug)]
pub struct SendPacketContext {
    msg: CMsgSteamSocketsUdpStats,
    required: bool,
    opportunistic: bool,
}

impl SendPacketContext {
    /// Decides what the stats collaborator wants on this packet.
    fn populate(stats: &mut EndpointStats, reply: StatsReplyRequest, now: Timestamp) -> Self {
        let flag_bits = stats.compute_flags(reply, now);
        let mut msg = CMsgSteamSocketsUdpStats {
            stats: None,
            flags: if flag_bits != 0 { Some(flag_bits) } else { None },
            seq_num: None,
        };
        let required = stats.need_to_send_stats(now);
        let opportunistic = !required && stats.ready_to_send_stats(now);
        if required {
            msg.stats = Some(stats.populate_message(now));
        }
        Self {
            msg,
            required,
            opportunistic,
        }
    }

    /// Fills the stats block opportunistically when the packet has room.
    fn fill_opportunistic(&mut self, stats: &mut EndpointStats, budget: usize, now: Timestamp) {
        if !self.opportunistic || self.msg.stats.is_some() {
            return;
        }
        let mut candidate = self.msg.clone();
        candidate.stats = Some(stats.populate_message(now));
        if wire::length_prefixed_len(&candidate) <= budget {
            self.msg = candidate;
        }
    }

    fn has_blob(&self) -> bool {
        self.msg.flags.is_some() || self.msg.stats.is_some()
    }

    fn blob_len(&self) -> usize {
        if self.has_blob() {
            wire::length_prefixed_len(&self.msg)
        } else {
            0
        }
    }

    /// Degrades the blob until it fits `budget`: first the instantaneous
    /// sub-message goes, then the whole stats block.
    fn shrink(&mut self, budget: usize) {
        while self.has_blob() && self.blob_len() > budget {
            let Some(stats) = self.msg.stats.as_mut() else {
                // Flags alone never exceed a sane budget.
                self.msg.flags = None;
                return;
            };
            if stats.instantaneous.is_some() && stats.lifetime.is_some() {
                stats.instantaneous = None;
            } else {
                self.msg.stats = None;
            }
        }
    }
}

/// A single direct-UDP connection, active or passive.
#[derive(Debug)]
pub struct Connection {
    handle: ConnectionHandle,
    state: ConnectionState,
    role: Role,
    pub(crate) local_cid: u32,
    pub(crate) remote_cid: u32,
    identity_local: Identity,
    pub(crate) identity_remote: Option<Identity>,
    expected_identity: Option<Identity>,
    transport: Option<BoundSocket>,
    /// Active connections keep their ephemeral shared socket alive here so
    /// the context can drain it.
    pub(crate) own_socket: Option<SharedSocket>,
    cert: CertBundle,
    crypto: Option<SessionCrypto>,
    recv_seq: RecvSequencer,
    pub(crate) stats: EndpointStats,
    end_reason: u32,
    end_debug: String,
    last_handshake_send: Timestamp,
    last_teardown_send: Timestamp,
    teardown_started: Timestamp,
    handshake_remote_timestamp: u64,
    handshake_timestamp_received_at: Timestamp,
    suppress_connect_events: bool,
    recv_queue: VecDeque<(u64, Bytes)>,
    pub(crate) next_think: Timestamp,
}

impl Connection {
    /// Starts an active (client) connection to `remote`.
    pub fn connect(
        handle: ConnectionHandle,
        local_cid: u32,
        remote: SocketAddr,
        identity_local: Option<Identity>,
        expected_identity: Option<Identity>,
        env: &mut Env<'_>,
    ) -> Result<Self, ConnectionError> {
        let identity_local = match identity_local {
            Some(id) => id,
            None => {
                if env.cfg.ip_allow_without_auth.refused() {
                    return Err(ConnectionError::IdentityRequired);
                }
                Identity::LocalHost
            }
        };
        let (own_socket, bound) = SharedSocket::bind_to_host(
            remote,
            crate::socket::RouteTarget::Connection(handle.raw()),
        )?;

        let cert = CertBundle::generate(match &identity_local {
            Identity::LocalHost => None,
            id => Some(id),
        });

        let mut conn = Self::new_inner(
            handle,
            local_cid,
            Role::Active,
            identity_local,
            cert,
            bound,
            env.now,
        );
        conn.own_socket = Some(own_socket);
        conn.expected_identity = expected_identity;
        conn.set_state(env, ConnectionState::Connecting);
        conn.send_challenge_request(env);
        Ok(conn)
    }

    /// Creates the passive side of a connection after the listener verified
    /// the challenge and the identity policy passed.  Does not send
    /// ConnectOK; the application must accept first.
    #[allow(clippy::too_many_arguments)]
    pub fn begin_accept(
        handle: ConnectionHandle,
        listener: usize,
        local_cid: u32,
        identity_local: Option<Identity>,
        identity_remote: Identity,
        remote_cid: u32,
        transport: BoundSocket,
        msg_cert: &CMsgSteamDatagramCertificateSigned,
        msg_crypt: &CMsgSteamDatagramSessionCryptInfoSigned,
        env: &mut Env<'_>,
    ) -> Result<Self, ConnectionError> {
        let cert = CertBundle::generate(identity_local.as_ref());
        let mut conn = Self::new_inner(
            handle,
            local_cid,
            Role::Passive { listener },
            identity_local.unwrap_or(Identity::LocalHost),
            cert,
            transport,
            env.now,
        );
        conn.remote_cid = remote_cid;
        conn.identity_remote = Some(identity_remote);

        // Crypto binds now; a bad handshake means the connection is never
        // surfaced to the application.
        let verified = verify_handshake(
            msg_cert,
            msg_crypt,
            UnsignedCertPolicy::from(env.cfg.ip_allow_without_auth),
            env.trusted_ca.as_ref(),
        )?;
        let keys = SessionKeys::derive(&conn.cert, verified.dh_public, verified.nonce, true);
        conn.crypto = Some(SessionCrypto::new(keys));
        conn.stats.peer_protocol_version = verified.protocol_version;

        conn.set_state(env, ConnectionState::Connecting);
        Ok(conn)
    }

    /// Builds one half of a loopback pair.  The caller cross-wires the two
    /// halves and flips them to Connected.
    pub fn new_loopback(
        handle: ConnectionHandle,
        local_cid: u32,
        identity_local: Identity,
        transport: BoundSocket,
        now: Timestamp,
    ) -> Self {
        let cert = CertBundle::generate(Some(&identity_local));
        let mut conn = Self::new_inner(
            handle,
            local_cid,
            Role::Active,
            identity_local,
            cert,
            transport,
            now,
        );
        conn.suppress_connect_events = true;
        conn
    }

    fn new_inner(
        handle: ConnectionHandle,
        local_cid: u32,
        role: Role,
        identity_local: Identity,
        cert: CertBundle,
        transport: BoundSocket,
        now: Timestamp,
    ) -> Self {
        Self {
            handle,
            state: ConnectionState::None,
            role,
            local_cid,
            remote_cid: 0,
            identity_local,
            identity_remote: None,
            expected_identity: None,
            transport: Some(transport),
            own_socket: None,
            cert,
            crypto: None,
            recv_seq: RecvSequencer::new(),
            stats: EndpointStats::new(now),
            end_reason: reasons::INVALID,
            end_debug: String::new(),
            last_handshake_send: 0,
            last_teardown_send: 0,
            teardown_started: 0,
            handshake_remote_timestamp: 0,
            handshake_timestamp_received_at: 0,
            suppress_connect_events: false,
            recv_queue: VecDeque::new(),
            next_think: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn remote_identity(&self) -> Option<&Identity> {
        self.identity_remote.as_ref()
    }

    pub fn stats(&self) -> &EndpointStats {
        &self.stats
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.transport.as_ref().map(|t| t.remote_addr())
    }

    /// Human-readable description used as tracing context.
    pub fn description(&self) -> String {
        let remote = self.remote_addr();
        let addr = match remote {
            Some(addr) => addr.to_string(),
            None => "???".into(),
        };
        match (&self.identity_remote, remote) {
            (Some(id), Some(remote)) if !id.is_anonymous_for(remote) => {
                format!("UDP {id}@{addr}")
            }
            _ => format!("UDP {addr}"),
        }
    }

    // ------------------------------------------------------------------
    // State transitions
    // ------------------------------------------------------------------

    fn set_state(&mut self, env: &mut Env<'_>, new: ConnectionState) {
        let old = self.state;
        if old == new {
            return;
        }
        self.state = new;
        debug!(conn = %self.description(), ?old, ?new, "connection state changed");

        match new {
            ConnectionState::FinWait | ConnectionState::ProblemDetectedLocally => {
                self.teardown_started = env.now;
                self.send_connection_closed_or_no_connection(env);
            }
            _ => {}
        }

        let suppressed = self.suppress_connect_events
            && matches!(
                new,
                ConnectionState::Connecting | ConnectionState::Connected
            );
        if !suppressed {
            env.events.push_back(Event::StateChange {
                conn: self.handle,
                old_state: old,
                new_state: new,
                end_reason: self.end_reason,
                end_debug: self.end_debug.clone(),
            });
        }
        self.next_think = 0;
    }

    /// Local protocol or crypto failure: enter ProblemDetectedLocally.
    fn problem(&mut self, env: &mut Env<'_>, reason: u32, debug_msg: &str) {
        if self.state.terminal() || self.state.half_dead() {
            return;
        }
        self.end_reason = reason;
        self.end_debug = debug_msg.to_owned();
        warn!(conn = %self.description(), reason, debug_msg, "problem detected locally");
        self.set_state(env, ConnectionState::ProblemDetectedLocally);
    }

    /// The peer told us the connection is gone.
    fn closed_by_peer(&mut self, env: &mut Env<'_>, reason: u32, debug_msg: &str) {
        match self.state {
            ConnectionState::Dead | ConnectionState::ClosedByPeer => {}
            ConnectionState::FinWait | ConnectionState::ProblemDetectedLocally => {
                // Our close crossed theirs; that is as good as an ack.
                self.set_state(env, ConnectionState::Dead);
            }
            _ => {
                self.end_reason = reason;
                self.end_debug = debug_msg.to_owned();
                self.set_state(env, ConnectionState::ClosedByPeer);
            }
        }
    }

    /// Application-side accept of a passive connection.
    pub fn accept(&mut self, env: &mut Env<'_>) -> Result<(), ConnectionError> {
        if !matches!(self.role, Role::Passive { .. }) || self.state != ConnectionState::Connecting
        {
            return Err(ConnectionError::InvalidState(self.state));
        }
        self.send_connect_ok(env);
        self.set_state(env, ConnectionState::Connected);
        Ok(())
    }

    /// Application-side close.  `linger` half-closes a connected endpoint.
    pub fn close(&mut self, env: &mut Env<'_>, reason: u32, debug_msg: &str, linger: bool) {
        match self.state {
            ConnectionState::Dead => {}
            ConnectionState::ClosedByPeer
            | ConnectionState::FinWait
            | ConnectionState::ProblemDetectedLocally => {
                self.set_state(env, ConnectionState::Dead);
            }
            ConnectionState::Connected | ConnectionState::Linger if linger => {
                self.end_reason = reason;
                self.end_debug = debug_msg.to_owned();
                self.set_state(env, ConnectionState::Linger);
            }
            _ => {
                self.end_reason = if reason == reasons::INVALID {
                    reasons::APP_GENERIC
                } else {
                    reason
                };
                self.end_debug = debug_msg.to_owned();
                self.set_state(env, ConnectionState::FinWait);
            }
        }
    }

    /// Releases the transport.  Called when the slot is reaped.
    pub fn free_resources(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
        self.own_socket = None;
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    /// Runs deferred work.  Called by the service loop whenever
    /// `next_think` has passed.
    pub fn think(&mut self, env: &mut Env<'_>) {
        let now = env.now;
        match self.state {
            ConnectionState::Connecting => {
                if self.stats.timed_out(now, env.cfg.connection_timeout) {
                    self.problem(env, reasons::MISC_TIMEOUT, "Timed out attempting to connect");
                    return;
                }
                let retry = env.cfg.connect_retry_interval;
                if self.role == Role::Active {
                    if now >= self.last_handshake_send + retry {
                        // Restart from the challenge; it has a short expiry
                        // anyway and this keeps the retry path single.
                        self.send_challenge_request(env);
                    }
                    self.next_think = (self.last_handshake_send + retry)
                        .min(self.stats.last_recv_or_created() + env.cfg.connection_timeout);
                } else {
                    self.next_think =
                        self.stats.last_recv_or_created() + env.cfg.connection_timeout;
                }
            }
            ConnectionState::Connected | ConnectionState::Linger => {
                if self.stats.timed_out(now, env.cfg.connection_timeout) {
                    self.problem(env, reasons::MISC_TIMEOUT, "Connection timed out");
                    return;
                }
                if let Some(reason) = self.stats.whats_needed_now(now) {
                    if let Err(err) = self.send_stats_msg(env, StatsReplyRequest::NothingToSend, reason)
                    {
                        debug!(conn = %self.description(), %err, "failed to send stats packet");
                    }
                }
                self.next_think = self.stats.next_think_time(now, env.cfg.connection_timeout);
            }
            ConnectionState::FinWait | ConnectionState::ProblemDetectedLocally => {
                if now >= self.teardown_started + TEARDOWN_TIMEOUT {
                    self.set_state(env, ConnectionState::Dead);
                    return;
                }
                if now >= self.last_teardown_send + TEARDOWN_RETRY {
                    self.send_connection_closed_or_no_connection(env);
                }
                self.next_think = (self.last_teardown_send + TEARDOWN_RETRY)
                    .min(self.teardown_started + TEARDOWN_TIMEOUT);
            }
            ConnectionState::ClosedByPeer => {
                // Waiting for the application to close us.
                self.next_think = now + 60 * MILLION;
            }
            ConnectionState::None
            | ConnectionState::FindingRoute
            | ConnectionState::Dead => {
                self.next_think = now + 60 * MILLION;
            }
        }
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    fn send_msg<M: Message>(&mut self, env: &mut Env<'_>, kind: MsgKind, msg: &M) {
        let pkt = match wire::serialize_msg(kind, msg) {
            Ok(pkt) => pkt,
            Err(err) => {
                debug!(conn = %self.description(), %err, "failed to serialize message");
                return;
            }
        };
        self.send_packet(env, &pkt);
    }

    fn send_padded_msg<M: Message>(&mut self, env: &mut Env<'_>, kind: MsgKind, msg: &M) {
        let pkt = match wire::serialize_padded_msg(kind, msg) {
            Ok(pkt) => pkt,
            Err(err) => {
                debug!(conn = %self.description(), %err, "failed to serialize padded message");
                return;
            }
        };
        self.send_packet(env, &pkt);
    }

    fn send_packet(&mut self, env: &mut Env<'_>, pkt: &[u8]) {
        let Some(transport) = self.transport.as_ref() else {
            debug_assert!(false, "send with no transport");
            return;
        };
        if let Err(err) = transport.send_raw(pkt) {
            debug!(conn = %self.description(), %err, "raw send failed");
            return;
        }
        self.stats.track_sent_packet(pkt.len(), env.now);
    }

    fn send_challenge_request(&mut self, env: &mut Env<'_>) {
        let msg = CMsgSteamSocketsUdpChallengeRequest {
            connection_id: Some(self.local_cid),
            my_timestamp: Some(env.now),
            protocol_version: Some(PROTOCOL_VERSION),
        };
        self.send_padded_msg(env, MsgKind::ChallengeRequest, &msg);
        self.last_handshake_send = env.now;
    }

    fn send_connect_ok(&mut self, env: &mut Env<'_>) {
        debug_assert!(self.local_cid != 0);
        debug_assert!(self.remote_cid != 0);

        let mut msg = CMsgSteamSocketsUdpConnectOk {
            client_connection_id: Some(self.remote_cid),
            server_connection_id: Some(self.local_cid),
            your_timestamp: None,
            delay_time_usec: None,
            cert: Some(self.cert.signed_cert.clone()),
            crypt: Some(self.cert.signed_crypt.clone()),
            identity_string: (!self.cert.cert_has_identity)
                .then(|| self.identity_local.to_string()),
        };

        if self.handshake_timestamp_received_at != 0 {
            let elapsed = env.now.saturating_sub(self.handshake_timestamp_received_at);
            if elapsed < HANDSHAKE_TIMESTAMP_MAX_AGE {
                msg.your_timestamp = Some(self.handshake_remote_timestamp);
                msg.delay_time_usec = Some(elapsed as i64);
            } else {
                warn!(
                    conn = %self.description(),
                    elapsed_ms = elapsed / 1000,
                    "discarding stale handshake timestamp, not echoing in ConnectOK"
                );
                self.handshake_timestamp_received_at = 0;
            }
        }

        self.send_msg(env, MsgKind::ConnectOk, &msg);
        env.metrics.connect_ok_sent.inc();
    }

    fn send_no_connection(&mut self, env: &mut Env<'_>, from_cid: u32, to_cid: u32) {
        if from_cid == 0 && to_cid == 0 {
            debug_assert!(false, "NoConnection needs at least one connection ID");
            return;
        }
        let msg = CMsgSteamSocketsUdpNoConnection {
            from_connection_id: (from_cid != 0).then_some(from_cid),
            to_connection_id: (to_cid != 0).then_some(to_cid),
        };
        self.send_msg(env, MsgKind::NoConnection, &msg);
        env.metrics.no_connection_sent.inc();
    }

    /// Sends whichever teardown notice the current state calls for.
    fn send_connection_closed_or_no_connection(&mut self, env: &mut Env<'_>) {
        if self.state == ConnectionState::ClosedByPeer {
            self.send_no_connection(env, self.local_cid, self.remote_cid);
        } else {
            let msg = CMsgSteamSocketsUdpConnectionClosed {
                from_connection_id: Some(self.local_cid),
                to_connection_id: (self.remote_cid != 0).then_some(self.remote_cid),
                reason_code: Some(self.end_reason),
                debug: (!self.end_debug.is_empty()).then(|| self.end_debug.clone()),
            };
            self.send_padded_msg(env, MsgKind::ConnectionClosed, &msg);
            env.metrics.connection_closed_sent.inc();
        }
        self.last_teardown_send = env.now;
    }

    /// Emits a data packet that exists only to carry stats/acks.
    fn send_stats_msg(
        &mut self,
        env: &mut Env<'_>,
        reply: StatsReplyRequest,
        reason: &'static str,
    ) -> Result<(), ConnectionError> {
        debug!(conn = %self.description(), reason, "sending standalone stats packet");
        let mut ctx = SendPacketContext::populate(&mut self.stats, reply, env.now);
        self.send_encrypted_chunk_inner(env, &[], &mut ctx)?;
        Ok(())
    }

    /// Largest plaintext chunk that fits a single data packet right now.
    pub fn max_plaintext_chunk(&self, ctx: &SendPacketContext, env: &Env<'_>) -> usize {
        let overhead = DATA_HEADER_LEN
            + if ctx.required { ctx.blob_len() } else { 0 }
            + crate::crypto::TAG_LEN;
        env.cfg.mtu.saturating_sub(overhead)
    }

    /// Encrypts and sends application payload, chunking to the MTU budget.
    pub fn send_plaintext(&mut self, env: &mut Env<'_>, data: &[u8]) -> Result<(), ConnectionError> {
        if self.state != ConnectionState::Connected {
            return Err(ConnectionError::InvalidState(self.state));
        }
        if data.is_empty() {
            return Ok(());
        }
        let mut ctx = SendPacketContext::populate(
            &mut self.stats,
            StatsReplyRequest::NothingToSend,
            env.now,
        );
        let budget = self.max_plaintext_chunk(&ctx, env);
        debug_assert!(budget > 0);

        let mut offset = 0;
        loop {
            let end = (offset + budget).min(data.len());
            self.send_encrypted_chunk_inner(env, &data[offset..end], &mut ctx)?;
            offset = end;
            if offset >= data.len() {
                break;
            }
            // Follow-on chunks carry no piggyback.
            ctx = SendPacketContext {
                msg: CMsgSteamSocketsUdpStats::default(),
                required: false,
                opportunistic: false,
            };
        }
        Ok(())
    }

    /// Sends one already-sized chunk; the contract the reliable-segment
    /// layer uses ("send one encrypted chunk of at most N bytes now").
    pub fn send_encrypted_chunk(
        &mut self,
        env: &mut Env<'_>,
        plaintext_chunk: &[u8],
        ctx: &mut SendPacketContext,
    ) -> Result<usize, ConnectionError> {
        self.send_encrypted_chunk_inner(env, plaintext_chunk, ctx)
    }

    fn send_encrypted_chunk_inner(
        &mut self,
        env: &mut Env<'_>,
        plaintext_chunk: &[u8],
        ctx: &mut SendPacketContext,
    ) -> Result<usize, ConnectionError> {
        let crypto = self
            .crypto
            .as_ref()
            .ok_or(ConnectionError::InvalidState(self.state))?;
        debug_assert!(self.remote_cid != 0);

        let (full_seq, wire_seq) = self.stats.consume_packet_number();
        let ciphertext = crypto.seal_chunk(full_seq, plaintext_chunk)?;

        // Whatever the chunk left over is the blob's budget; trim stats to
        // fit, opportunistically topping up first if there is slack.
        let budget = env
            .cfg
            .mtu
            .saturating_sub(DATA_HEADER_LEN + ciphertext.len());
        ctx.fill_opportunistic(&mut self.stats, budget, env.now);
        ctx.shrink(budget);

        let mut header = Vec::with_capacity(DATA_HEADER_LEN + ctx.blob_len());
        let hdr = DataHeader {
            flags: if ctx.has_blob() {
                DATA_FLAG_PROTOBUF_BLOB
            } else {
                0
            },
            to_connection_id: self.remote_cid,
            wire_seq,
        };
        hdr.encode_into(&mut header);
        if ctx.has_blob() {
            wire::encode_length_prefixed(&ctx.msg, &mut header);
        }

        let total = header.len() + ciphertext.len();
        debug_assert!(total <= env.cfg.mtu, "assembled packet exceeds MTU");

        let transport = self.transport.as_ref().ok_or(ConnectionError::NoTransport)?;
        transport.send_raw_gather(&[IoSlice::new(&header), IoSlice::new(&ciphertext)])?;

        self.stats.track_sent_stats(
            ctx.msg.stats.is_some(),
            ctx.msg.flags.unwrap_or(0),
            env.now,
        );
        self.stats.track_sent_packet(total, env.now);
        env.metrics.data_packets_sent.inc();
        Ok(total)
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Next plaintext delivered by the peer, with its full sequence number.
    pub fn poll_received(&mut self) -> Option<(u64, Bytes)> {
        self.recv_queue.pop_front()
    }

    /// Next packet queued on a loopback transport, for the context pump.
    pub(crate) fn pop_loopback_inbound(&self) -> Option<Vec<u8>> {
        match self.transport.as_ref() {
            Some(BoundSocket::Loopback(sock)) => sock.pop_inbound(),
            _ => None,
        }
    }

    /// Entry point for every packet routed to this connection.
    pub fn on_packet(&mut self, env: &mut Env<'_>, pkt: &[u8]) {
        match wire::classify(pkt) {
            PacketClass::TooShort => {
                env.metrics.packets_dropped_short.inc();
                self.report_bad_packet(env, "packet", &format!("{} byte packet is too small", pkt.len()));
            }
            PacketClass::Connectionless => {}
            PacketClass::Data => self.on_data(env, pkt),
            PacketClass::Control(kind) => {
                self.stats.track_recv_packet(pkt.len(), env.now);
                self.on_control(env, kind, pkt);
            }
            PacketClass::Unknown(lead) => {
                self.report_bad_packet(
                    env,
                    "packet",
                    &format!("Lead byte 0x{lead:02x} not a known message ID"),
                );
            }
        }
    }

    fn on_control(&mut self, env: &mut Env<'_>, kind: MsgKind, pkt: &[u8]) {
        let body = if kind.padded() {
            wire::parse_padded_body(pkt)
        } else {
            wire::parse_bare_body(pkt)
        };
        let body = match body {
            Ok(body) => body,
            Err(err) => {
                self.report_bad_packet(env, kind_name(kind), &err.to_string());
                return;
            }
        };

        match kind {
            MsgKind::ChallengeReply => match CMsgSteamSocketsUdpChallengeReply::decode(body) {
                Ok(msg) => self.on_challenge_reply(env, &msg),
                Err(err) => self.report_bad_packet(env, "ChallengeReply", &err.to_string()),
            },
            MsgKind::ConnectOk => match CMsgSteamSocketsUdpConnectOk::decode(body) {
                Ok(msg) => self.on_connect_ok(env, &msg),
                Err(err) => self.report_bad_packet(env, "ConnectOK", &err.to_string()),
            },
            MsgKind::ConnectionClosed => {
                match CMsgSteamSocketsUdpConnectionClosed::decode(body) {
                    Ok(msg) => self.on_connection_closed(env, &msg),
                    Err(err) => self.report_bad_packet(env, "ConnectionClosed", &err.to_string()),
                }
            }
            MsgKind::NoConnection => match CMsgSteamSocketsUdpNoConnection::decode(body) {
                Ok(msg) => self.on_no_connection(env, &msg),
                Err(err) => self.report_bad_packet(env, "NoConnection", &err.to_string()),
            },
            MsgKind::ChallengeRequest => {
                match CMsgSteamSocketsUdpChallengeRequest::decode(body) {
                    Ok(msg) => self.on_challenge_or_connect_request(
                        env,
                        "ChallengeRequest",
                        msg.connection_id.unwrap_or(0),
                    ),
                    Err(err) => self.report_bad_packet(env, "ChallengeRequest", &err.to_string()),
                }
            }
            MsgKind::ConnectRequest => match CMsgSteamSocketsUdpConnectRequest::decode(body) {
                Ok(msg) => self.on_challenge_or_connect_request(
                    env,
                    "ConnectRequest",
                    msg.client_connection_id.unwrap_or(0),
                ),
                Err(err) => self.report_bad_packet(env, "ConnectRequest", &err.to_string()),
            },
        }
    }

    fn on_challenge_reply(&mut self, env: &mut Env<'_>, msg: &CMsgSteamSocketsUdpChallengeReply) {
        if matches!(self.role, Role::Passive { .. }) {
            self.report_bad_packet(
                env,
                "ChallengeReply",
                "Only connections initiated locally should receive this",
            );
            return;
        }
        if self.state != ConnectionState::Connecting {
            return;
        }
        if msg.connection_id.unwrap_or(0) != self.local_cid {
            self.report_bad_packet(
                env,
                "ChallengeReply",
                "Incorrect connection ID.  Message is stale or could be spoofed, ignoring.",
            );
            return;
        }
        let protocol_version = msg.protocol_version.unwrap_or(0);
        if protocol_version < MIN_PROTOCOL_VERSION {
            self.problem(
                env,
                reasons::MISC_GENERIC,
                "Peer is running old software and needs to be updated",
            );
            return;
        }
        self.stats.peer_protocol_version = protocol_version;

        if let Some(your_timestamp) = msg.your_timestamp {
            self.apply_ping_sample(env, your_timestamp, 0, "ChallengeReply");
        }

        let reply = CMsgSteamSocketsUdpConnectRequest {
            client_connection_id: Some(self.local_cid),
            challenge: msg.challenge,
            my_timestamp: Some(env.now),
            ping_est_ms: self.stats.ping.smoothed_ms(),
            cert: Some(self.cert.signed_cert.clone()),
            crypt: Some(self.cert.signed_crypt.clone()),
            identity_string: (!self.cert.cert_has_identity)
                .then(|| self.identity_local.to_string()),
        };
        self.send_msg(env, MsgKind::ConnectRequest, &reply);

        // If this reply is lost we restart the whole handshake from the
        // challenge; it has a short expiry anyway.
        self.last_handshake_send = env.now;
        self.next_think = env.now + env.cfg.connect_retry_interval;
    }

    fn on_connect_ok(&mut self, env: &mut Env<'_>, msg: &CMsgSteamSocketsUdpConnectOk) {
        if matches!(self.role, Role::Passive { .. }) {
            self.report_bad_packet(
                env,
                "ConnectOK",
                "Only connections initiated locally should receive this",
            );
            return;
        }
        if msg.client_connection_id.unwrap_or(0) != self.local_cid {
            self.report_bad_packet(
                env,
                "ConnectOK",
                "Incorrect connection ID.  Message is stale or could be spoofed, ignoring.",
            );
            return;
        }

        let claimed = match claimed_identity(msg.cert.as_ref(), msg.identity_string.as_deref()) {
            Ok(claimed) => claimed,
            Err(text) => {
                self.report_bad_packet(env, "ConnectOK", &text);
                return;
            }
        };
        let Some(remote_addr) = self.remote_addr() else {
            return;
        };
        let identity_remote = match apply_ip_identity_policy(
            claimed.identity,
            claimed.in_cert,
            remote_addr,
            env.cfg,
        ) {
            Ok(identity) => identity,
            Err(text) => {
                self.report_bad_packet(env, "ConnectOK", &text);
                return;
            }
        };

        // The server must be who the application asked to talk to.
        if let Some(expected) = &self.expected_identity {
            if *expected != identity_remote {
                self.problem(
                    env,
                    reasons::REMOTE_BAD_CRYPT,
                    "Server identity doesn't match who we expect to be connecting to",
                );
                return;
            }
        }

        if let Some(your_timestamp) = msg.your_timestamp {
            self.apply_ping_sample(
                env,
                your_timestamp,
                msg.delay_time_usec.unwrap_or(0),
                "ConnectOK",
            );
        }

        match self.state {
            ConnectionState::ClosedByPeer
            | ConnectionState::FinWait
            | ConnectionState::ProblemDetectedLocally => {
                self.send_connection_closed_or_no_connection(env);
                return;
            }
            ConnectionState::Connected | ConnectionState::Linger => {
                // Duplicate of a reply we already processed.
                return;
            }
            ConnectionState::Connecting => {}
            ConnectionState::None | ConnectionState::FindingRoute | ConnectionState::Dead => {
                debug_assert!(false, "connect ok in state {:?}", self.state);
                return;
            }
        }

        let server_cid = msg.server_connection_id.unwrap_or(0);
        if server_cid & 0xffff == 0 {
            self.problem(env, reasons::REMOTE_BAD_CRYPT, "Didn't send valid connection ID");
            return;
        }
        self.remote_cid = server_cid;
        self.identity_remote = Some(identity_remote);

        let (Some(cert), Some(crypt)) = (msg.cert.as_ref(), msg.crypt.as_ref()) else {
            self.problem(env, reasons::REMOTE_BAD_CRYPT, "Missing cert or crypt info");
            return;
        };
        let verified = match verify_handshake(
            cert,
            crypt,
            UnsignedCertPolicy::from(env.cfg.ip_allow_without_auth),
            env.trusted_ca.as_ref(),
        ) {
            Ok(verified) => verified,
            Err(err) => {
                self.problem(env, reasons::REMOTE_BAD_CRYPT, &format!("Failed crypto init.  {err}"));
                return;
            }
        };
        let keys = SessionKeys::derive(&self.cert, verified.dh_public, verified.nonce, false);
        self.crypto = Some(SessionCrypto::new(keys));

        self.set_state(env, ConnectionState::Connected);
    }

    fn apply_ping_sample(
        &mut self,
        env: &Env<'_>,
        your_timestamp: u64,
        remote_delay: i64,
        what: &str,
    ) {
        let elapsed = env.now as i64 - your_timestamp as i64 - remote_delay;
        if elapsed < 0 || elapsed > PING_SANITY_MAX as i64 {
            warn!(
                conn = %self.description(),
                your_timestamp,
                now = env.now,
                remote_delay,
                "ignoring weird timestamp in {what}"
            );
            return;
        }
        let ping_ms = ((elapsed + 500) / 1000) as u32;
        self.stats.ping.received_ping(ping_ms);
    }

    fn on_connection_closed(
        &mut self,
        env: &mut Env<'_>,
        msg: &CMsgSteamSocketsUdpConnectionClosed,
    ) {
        let to_cid = msg.to_connection_id.unwrap_or(0);
        let from_cid = msg.from_connection_id.unwrap_or(0);

        // The peer might not know our ID yet if it is a client aborting the
        // connection really early.
        let cid_match = to_cid == self.local_cid
            || (to_cid == 0 && from_cid != 0 && from_cid == self.remote_cid);

        if cid_match || env.limiters.reply.allow(env.now) {
            let reply = CMsgSteamSocketsUdpNoConnection {
                from_connection_id: (to_cid != 0).then_some(to_cid),
                to_connection_id: (from_cid != 0).then_some(from_cid),
            };
            self.send_msg(env, MsgKind::NoConnection, &reply);
            env.metrics.no_connection_sent.inc();
        }

        if !cid_match {
            return;
        }
        self.closed_by_peer(
            env,
            msg.reason_code.unwrap_or(0),
            msg.debug.as_deref().unwrap_or(""),
        );
    }

    fn on_no_connection(&mut self, env: &mut Env<'_>, msg: &CMsgSteamSocketsUdpNoConnection) {
        // Must be an ack of something we would have sent.
        if msg.to_connection_id.unwrap_or(0) != self.local_cid
            || msg.from_connection_id.unwrap_or(0) != self.remote_cid
        {
            self.report_bad_packet(
                env,
                "NoConnection",
                "Old/incorrect connection ID.  Message is for a stale connection, or is spoofed.  Ignoring.",
            );
            return;
        }
        self.closed_by_peer(env, reasons::INVALID, "");
    }

    fn on_challenge_or_connect_request(
        &mut self,
        env: &mut Env<'_>,
        packet_type: &str,
        packet_cid: u32,
    ) {
        if packet_cid != self.remote_cid {
            self.report_bad_packet(
                env,
                packet_type,
                "Incorrect connection ID, when we do have a connection for this address.  Could be spoofed, ignoring.",
            );
            return;
        }
        match self.state {
            ConnectionState::ClosedByPeer
            | ConnectionState::FinWait
            | ConnectionState::ProblemDetectedLocally => {
                self.send_connection_closed_or_no_connection(env);
            }
            ConnectionState::Connecting => {
                // Waiting on the application to accept; let them retry.
            }
            ConnectionState::Connected | ConnectionState::Linger => {
                if self.role == Role::Active {
                    self.report_bad_packet(
                        env,
                        packet_type,
                        "We initiated the connection, so the server shouldn't be sending us this",
                    );
                    return;
                }
                // Our earlier reply might have dropped; re-send it.
                self.send_connect_ok(env);
            }
            ConnectionState::None | ConnectionState::FindingRoute | ConnectionState::Dead => {
                debug_assert!(false, "handshake packet in state {:?}", self.state);
            }
        }
    }

    fn on_data(&mut self, env: &mut Env<'_>, pkt: &[u8]) {
        let hdr = match DataHeader::parse(pkt) {
            Ok(hdr) => hdr,
            Err(err) => {
                self.report_bad_packet(env, "DataPacket", &err.to_string());
                return;
            }
        };

        if hdr.to_connection_id != self.local_cid {
            // Wrong session: an old one, or spoofed.
            self.report_bad_packet(env, "DataPacket", "Incorrect connection ID");
            if env.limiters.reply.allow(env.now) {
                self.send_no_connection(env, hdr.to_connection_id, 0);
            }
            return;
        }

        match self.state {
            ConnectionState::ClosedByPeer
            | ConnectionState::FinWait
            | ConnectionState::ProblemDetectedLocally => {
                self.send_connection_closed_or_no_connection(env);
                return;
            }
            ConnectionState::Linger => {
                // Half-closed; inbound payload is no longer deliverable.
                return;
            }
            ConnectionState::Connecting => {
                // Most likely our ConnectOK (or theirs) is still in flight;
                // we cannot decrypt yet.
                return;
            }
            ConnectionState::Connected => {}
            ConnectionState::None | ConnectionState::FindingRoute | ConnectionState::Dead => {
                debug_assert!(false, "data packet in state {:?}", self.state);
                return;
            }
        }

        let trailer = &pkt[DATA_HEADER_LEN..];
        let has_stats = hdr.flags & DATA_FLAG_PROTOBUF_BLOB != 0;
        let (stats_blob, ciphertext) = match wire::split_data_trailer(trailer, has_stats) {
            Ok(parts) => parts,
            Err(err) => {
                self.report_bad_packet(env, "DataPacket", &err.to_string());
                return;
            }
        };

        let inline_stats = match stats_blob {
            Some(blob) => match CMsgSteamSocketsUdpStats::decode(blob) {
                Ok(mut msg) => {
                    msg.seq_num = Some(u32::from(hdr.wire_seq));
                    Some(msg)
                }
                Err(_) => {
                    self.report_bad_packet(
                        env,
                        "DataPacket",
                        "protobuf failed to parse inline stats message",
                    );
                    return;
                }
            },
            None => None,
        };

        let full_seq = self.recv_seq.expand(hdr.wire_seq);
        if self.recv_seq.check(full_seq).is_err() {
            self.stats.track_recv_duplicate();
            env.metrics.duplicate_packets_dropped.inc();
            return;
        }

        let Some(crypto) = self.crypto.as_ref() else {
            debug_assert!(false, "connected without crypto");
            return;
        };
        let plaintext = match crypto.open_chunk(full_seq, ciphertext) {
            Ok(plaintext) => plaintext,
            Err(_) => {
                // Silent: replying here would hand an attacker a decryption
                // oracle.
                env.metrics.decrypt_failures.inc();
                return;
            }
        };

        let prev_high = self.recv_seq.high_watermark();
        self.recv_seq.commit(full_seq);
        self.stats.track_recv_packet(pkt.len(), env.now);
        self.stats.track_recv_sequenced(full_seq, prev_high);
        env.metrics.data_packets_received.inc();

        if !plaintext.is_empty() {
            self.recv_queue.push_back((full_seq, Bytes::from(plaintext)));
        }

        if let Some(stats_msg) = inline_stats {
            self.recv_stats(env, &stats_msg);
        }
    }

    /// Processes a stats message, inline or standalone.
    fn recv_stats(&mut self, env: &mut Env<'_>, msg: &CMsgSteamSocketsUdpStats) {
        if let Some(block) = &msg.stats {
            self.stats.process_message(block, env.now);
        }

        if matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Linger
        ) {
            let msg_flags = msg.flags.unwrap_or(0);
            let immediate = msg_flags & stats_flags::ACK_REQUEST_IMMEDIATE != 0;
            if msg_flags & stats_flags::ACK_REQUEST_E2E != 0 || msg.stats.is_some() {
                self.stats.queue_ack(immediate, env.now);
            }
            if let Some(reason) = self.stats.whats_needed_now(env.now) {
                if let Err(err) =
                    self.send_stats_msg(env, StatsReplyRequest::NothingToSend, reason)
                {
                    debug!(conn = %self.description(), %err, "failed to send stats reply");
                }
            }
        }
    }

    fn report_bad_packet(&self, env: &mut Env<'_>, msg_type: &str, detail: &str) {
        let remote = self
            .remote_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|| "???".into());
        if env.limiters.bad_packet.allow(env.now) {
            env.metrics.bad_packets_reported.inc();
            warn!(%remote, msg_type, detail, "ignored bad packet");
        } else {
            env.metrics.bad_packets_suppressed.inc();
        }
    }
}

fn kind_name(kind: MsgKind) -> &'static str {
    match kind {
        MsgKind::ChallengeRequest => "ChallengeRequest",
        MsgKind::ChallengeReply => "ChallengeReply",
        MsgKind::ConnectRequest => "ConnectRequest",
        MsgKind::ConnectOk => "ConnectOK",
        MsgKind::ConnectionClosed => "ConnectionClosed",
        MsgKind::NoConnection => "NoConnection",
    }
}

// Loopback pair wiring needs pieces no other caller touches.
impl Connection {
    /// Completes one side of a loopback pair against its peer's handshake
    /// material.  `server_role` keys the directional key schedule.
    pub(crate) fn complete_loopback(
        &mut self,
        env: &mut Env<'_>,
        peer_identity: Identity,
        peer_cid: u32,
        peer_cert: &CMsgSteamDatagramCertificateSigned,
        peer_crypt: &CMsgSteamDatagramSessionCryptInfoSigned,
        server_role: bool,
    ) -> Result<(), ConnectionError> {
        self.identity_remote = Some(peer_identity);
        self.remote_cid = peer_cid;
        let verified = verify_handshake(peer_cert, peer_crypt, UnsignedCertPolicy::Allow, None)?;
        let keys = SessionKeys::derive(&self.cert, verified.dh_public, verified.nonce, server_role);
        self.crypto = Some(SessionCrypto::new(keys));
        // Act like we just now received something.
        self.stats.note_recv_activity(env.now);
        self.set_state(env, ConnectionState::Connecting);
        self.set_state(env, ConnectionState::Connected);
        Ok(())
    }

    pub(crate) fn handshake_material(
        &self,
    ) -> (
        Identity,
        u32,
        CMsgSteamDatagramCertificateSigned,
        CMsgSteamDatagramSessionCryptInfoSigned,
    ) {
        (
            self.identity_local.clone(),
            self.local_cid,
            self.cert.signed_cert.clone(),
            self.cert.signed_crypt.clone(),
        )
    }

    pub(crate) fn set_handshake_timestamp(&mut self, remote_timestamp: u64, received_at: Timestamp) {
        self.handshake_remote_timestamp = remote_timestamp;
        self.handshake_timestamp_received_at = received_at;
    }

    pub(crate) fn note_ping_estimate(&mut self, ping_est_ms: u32) {
        if ping_est_ms > PING_EST_SANITY_MS {
            warn!(
                conn = %self.description(),
                ping_est_ms,
                "ignoring really large ping estimate in connect request"
            );
            return;
        }
        self.stats.ping.received_ping(ping_est_ms);
    }
}
