// Listen socket for direct-UDP connectivity.
// Numan Thabit 2025

use std::net::SocketAddr;

use ahash::AHashMap;
use prost::Message;
use thiserror::Error;
use tracing::warn;

use crate::{
    challenge::{challenge_time, ChallengeError, ChallengeIssuer},
    config::{Config, PROTOCOL_VERSION},
    connection::{reasons, Connection, ConnectionHandle},
    context::{ConnectionTable, Env},
    crypto::cert::extract_cert_identity,
    identity::{Identity, RemoteKey},
    proto::{
        CMsgSteamDatagramCertificateSigned, CMsgSteamSocketsUdpChallengeReply,
        CMsgSteamSocketsUdpChallengeRequest, CMsgSteamSocketsUdpConnectRequest,
        CMsgSteamSocketsUdpConnectionClosed, CMsgSteamSocketsUdpNoConnection,
    },
    socket::{RouteTarget, SharedSocket, SocketError},
    wire::{self, MsgKind, PacketClass},
};

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("must specify local port")]
    MustSpecifyPort,
    #[error("socket error: {0}")]
    Socket(#[from] SocketError),
}

/// What a connect-or-ok message claims the sender's identity to be, and
/// where the claim came from.
#[derive(Debug)]
pub(crate) struct IdentityClaim {
    pub identity: Identity,
    pub in_cert: bool,
}

/// Resolves the identity asserted by a handshake message: the signed cert
/// wins, then the explicit identity field, then the anonymous sentinel.
pub(crate) fn claimed_identity(
    cert: Option<&CMsgSteamDatagramCertificateSigned>,
    explicit: Option<&str>,
) -> Result<IdentityClaim, String> {
    if let Some(cert) = cert {
        match extract_cert_identity(cert) {
            Ok(Some(identity)) => {
                return Ok(IdentityClaim {
                    identity,
                    in_cert: true,
                })
            }
            Ok(None) => {}
            Err(err) => return Err(format!("Bad identity in cert.  {err}")),
        }
    }
    match explicit {
        Some(s) => match s.parse::<Identity>() {
            Ok(identity) => Ok(IdentityClaim {
                identity,
                in_cert: false,
            }),
            Err(err) => Err(format!("Bad identity.  {err}")),
        },
        // No identity presented is the same as claiming to be "localhost".
        None => Ok(IdentityClaim {
            identity: Identity::LocalHost,
            in_cert: false,
        }),
    }
}

/// Policy for IP-flavored identities.
///
/// The anonymous sentinel is rewritten to the observed source address and is
/// only allowed when unauthenticated peers are.  An explicit IP identity
/// must come from a cert; the source address is not required to match it
/// unless configured, since a NATed peer legitimately differs.
pub(crate) fn apply_ip_identity_policy(
    identity: Identity,
    in_cert: bool,
    from: SocketAddr,
    cfg: &Config,
) -> Result<Identity, String> {
    match identity {
        Identity::LocalHost => {
            if cfg.ip_allow_without_auth.refused() {
                return Err("Unauthenticated connections not allowed.".into());
            }
            if cfg.ip_allow_without_auth.warn() {
                warn!(%from, "allowing unauthenticated connection");
            }
            Ok(Identity::IpAddress(from))
        }
        Identity::IpAddress(addr) => {
            if !in_cert {
                return Err("Cannot use specific IP address.".into());
            }
            if cfg.require_identity_address_match && addr != from {
                return Err(format!(
                    "Identity in request is ip:{addr}, but packet is coming from {from}."
                ));
            }
            Ok(Identity::IpAddress(addr))
        }
        other => Ok(other),
    }
}

/// Passive endpoint: owns one shared UDP bind and creates connections from
/// verified connect requests.  Holds no per-peer state before the cookie
/// round-trips.
#[derive(Debug)]
pub struct Listener {
    index: usize,
    sock: SharedSocket,
    challenge: ChallengeIssuer,
    identity_local: Option<Identity>,
    children: AHashMap<RemoteKey, ConnectionHandle>,
}

impl Listener {
    pub fn bind(
        index: usize,
        local: SocketAddr,
        identity_local: Option<Identity>,
    ) -> Result<Self, ListenerError> {
        if local.port() == 0 {
            return Err(ListenerError::MustSpecifyPort);
        }
        let sock = SharedSocket::bind(local, RouteTarget::Listener(index))?;
        Ok(Self {
            index,
            sock,
            challenge: ChallengeIssuer::new(),
            identity_local,
            children: AHashMap::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.sock.local_addr()
    }

    pub fn socket(&self) -> &SharedSocket {
        &self.sock
    }

    /// Drops the child-map entry for a connection that went away.
    pub fn forget_connection(&mut self, handle: ConnectionHandle) {
        self.children.retain(|_, h| *h != handle);
    }

    /// Entry point for packets from sources with no routed connection.
    pub fn on_unknown_packet(
        &mut self,
        env: &mut Env<'_>,
        table: &mut ConnectionTable,
        pkt: &[u8],
        from: SocketAddr,
    ) {
        match wire::classify(pkt) {
            PacketClass::TooShort => {
                env.metrics.packets_dropped_short.inc();
                self.report_bad_packet(
                    env,
                    from,
                    "packet",
                    &format!("{} byte packet is too small", pkt.len()),
                );
            }
            PacketClass::Connectionless => {
                // LAN discovery and other legacy connectionless traffic.
                // Ignore without even logging.
            }
            PacketClass::Data => {
                // A stray data packet.  Whoever sent it either never had a
                // connection here, or its FinWait already timed out.  Never
                // allocate anything for it.
                self.report_bad_packet(
                    env,
                    from,
                    "Data",
                    "Stray data packet from host with no connection.  Ignoring.",
                );
            }
            PacketClass::Control(MsgKind::ChallengeRequest) => {
                match wire::parse_padded_body(pkt)
                    .and_then(|body| Ok(CMsgSteamSocketsUdpChallengeRequest::decode(body)?))
                {
                    Ok(msg) => self.handle_challenge_request(env, &msg, from),
                    Err(err) => {
                        self.report_bad_packet(env, from, "ChallengeRequest", &err.to_string())
                    }
                }
            }
            PacketClass::Control(MsgKind::ConnectRequest) => {
                match wire::parse_bare_body(pkt)
                    .and_then(|body| Ok(CMsgSteamSocketsUdpConnectRequest::decode(body)?))
                {
                    Ok(msg) => self.handle_connect_request(env, table, &msg, from, pkt.len()),
                    Err(err) => {
                        self.report_bad_packet(env, from, "ConnectRequest", &err.to_string())
                    }
                }
            }
            PacketClass::Control(MsgKind::ConnectionClosed) => {
                match wire::parse_padded_body(pkt)
                    .and_then(|body| Ok(CMsgSteamSocketsUdpConnectionClosed::decode(body)?))
                {
                    Ok(msg) => self.handle_connection_closed(env, &msg, from),
                    Err(err) => {
                        self.report_bad_packet(env, from, "ConnectionClosed", &err.to_string())
                    }
                }
            }
            PacketClass::Control(MsgKind::NoConnection) => {
                // They don't think there's a connection on this address.
                // We agree.  Nothing else to do.
            }
            PacketClass::Control(_) | PacketClass::Unknown(_) => {
                // ChallengeReply / ConnectOK land here too: we are not
                // initiating connections, so we should never receive them.
                self.report_bad_packet(
                    env,
                    from,
                    "packet",
                    &format!("Invalid lead byte 0x{:02x}", pkt[0]),
                );
            }
        }
    }

    fn handle_challenge_request(
        &mut self,
        env: &mut Env<'_>,
        msg: &CMsgSteamSocketsUdpChallengeRequest,
        from: SocketAddr,
    ) {
        let connection_id = msg.connection_id.unwrap_or(0);
        if connection_id == 0 {
            self.report_bad_packet(env, from, "ChallengeRequest", "Missing connection_id.");
            return;
        }

        let n_time = challenge_time(env.now);
        let challenge = self.challenge.generate(n_time, from);

        let reply = CMsgSteamSocketsUdpChallengeReply {
            connection_id: Some(connection_id),
            challenge: Some(challenge),
            your_timestamp: msg.my_timestamp,
            protocol_version: Some(PROTOCOL_VERSION),
        };
        self.send_msg(MsgKind::ChallengeReply, &reply, from);
        env.metrics.challenges_issued.inc();
    }

    fn handle_connect_request(
        &mut self,
        env: &mut Env<'_>,
        table: &mut ConnectionTable,
        msg: &CMsgSteamSocketsUdpConnectRequest,
        from: SocketAddr,
        pkt_len: usize,
    ) {
        // The cookie must have round-tripped through the claimed source
        // recently; this is the whole anti-spoofing story.
        match self
            .challenge
            .verify(msg.challenge.unwrap_or(0), from, env.now)
        {
            Ok(()) => {}
            Err(ChallengeError::Stale) => {
                env.metrics.challenges_rejected.inc();
                self.report_bad_packet(env, from, "ConnectRequest", "Challenge too old.");
                return;
            }
            Err(ChallengeError::Mismatch) => {
                env.metrics.challenges_rejected.inc();
                self.report_bad_packet(
                    env,
                    from,
                    "ConnectRequest",
                    "Incorrect challenge.  Could be spoofed.",
                );
                return;
            }
        }

        let client_cid = msg.client_connection_id.unwrap_or(0);
        if client_cid == 0 {
            self.report_bad_packet(env, from, "ConnectRequest", "Missing connection ID");
            return;
        }

        let (Some(cert), Some(crypt)) = (msg.cert.as_ref(), msg.crypt.as_ref()) else {
            self.report_bad_packet(env, from, "ConnectRequest", "Missing cert or crypt info");
            return;
        };

        let claim = match claimed_identity(msg.cert.as_ref(), msg.identity_string.as_deref()) {
            Ok(claim) => claim,
            Err(text) => {
                self.report_bad_packet(env, from, "ConnectRequest", &text);
                return;
            }
        };
        let identity_remote =
            match apply_ip_identity_policy(claim.identity, claim.in_cert, from, env.cfg) {
                Ok(identity) => identity,
                Err(text) => {
                    self.report_bad_packet(env, from, "ConnectRequest", &text);
                    return;
                }
            };

        // One connection per (identity, client cid).  A different address
        // for the same key means either a duplicate or an impersonation;
        // the existing connection stays, the newcomer is told to go away.
        let key = RemoteKey::new(identity_remote.clone(), client_cid);
        if let Some(existing) = self.children.get(&key) {
            if table.get(*existing).is_some() {
                env.metrics.connections_rejected_duplicate.inc();
                self.report_bad_packet(
                    env,
                    from,
                    "ConnectRequest",
                    &format!(
                        "Rejecting connection request from {identity_remote} at {from}, connection ID {client_cid}.  That identity/ConnectionID pair already has a connection"
                    ),
                );

                let reject = CMsgSteamSocketsUdpConnectionClosed {
                    to_connection_id: Some(client_cid),
                    from_connection_id: None,
                    reason_code: Some(reasons::MISC_GENERIC),
                    debug: Some("A connection with that ID already exists.".into()),
                };
                self.send_padded_msg(MsgKind::ConnectionClosed, &reject, from);
                env.metrics.connection_closed_sent.inc();
                return;
            }
            // Stale entry for a reaped connection.
            self.children.remove(&key);
        }

        let handle = table.reserve();
        let local_cid = table.generate_local_cid();
        let transport = self
            .sock
            .add_remote(from, RouteTarget::Connection(handle.raw()));

        let mut conn = match Connection::begin_accept(
            handle,
            self.index,
            local_cid,
            self.identity_local.clone(),
            identity_remote,
            client_cid,
            transport,
            cert,
            crypt,
            env,
        ) {
            Ok(conn) => conn,
            Err(err) => {
                warn!(%from, %err, "failed to accept connection");
                table.release(handle);
                return;
            }
        };

        conn.stats.track_recv_packet(pkt_len, env.now);
        if let Some(ping_est_ms) = msg.ping_est_ms {
            conn.note_ping_estimate(ping_est_ms);
        }
        if let Some(my_timestamp) = msg.my_timestamp {
            conn.set_handshake_timestamp(my_timestamp, env.now);
        }

        table.install(handle, conn);
        self.children.insert(key, handle);
        env.metrics.connections_accepted.inc();
        // ConnectOK is NOT sent here; the application must accept first.
    }

    fn handle_connection_closed(
        &mut self,
        env: &mut Env<'_>,
        msg: &CMsgSteamSocketsUdpConnectionClosed,
        from: SocketAddr,
    ) {
        // Ack so they stop retransmitting.  The inbound message is padded
        // and this reply is tiny, so reflection is not a concern even with
        // a spoofed source.
        let reply = CMsgSteamSocketsUdpNoConnection {
            to_connection_id: msg.from_connection_id.filter(|&id| id != 0),
            from_connection_id: msg.to_connection_id.filter(|&id| id != 0),
        };
        self.send_msg(MsgKind::NoConnection, &reply, from);
        env.metrics.no_connection_sent.inc();
    }

    fn send_msg<M: Message>(&self, kind: MsgKind, msg: &M, to: SocketAddr) {
        match wire::serialize_msg(kind, msg) {
            Ok(pkt) => {
                if let Err(err) = self.sock.send_raw(&pkt, to) {
                    warn!(%to, %err, "listener send failed");
                }
            }
            Err(err) => warn!(%to, %err, "failed to serialize listener message"),
        }
    }

    fn send_padded_msg<M: Message>(&self, kind: MsgKind, msg: &M, to: SocketAddr) {
        match wire::serialize_padded_msg(kind, msg) {
            Ok(pkt) => {
                if let Err(err) = self.sock.send_raw(&pkt, to) {
                    warn!(%to, %err, "listener send failed");
                }
            }
            Err(err) => warn!(%to, %err, "failed to serialize listener message"),
        }
    }

    fn report_bad_packet(
        &self,
        env: &mut Env<'_>,
        from: SocketAddr,
        msg_type: &str,
        detail: &str,
    ) {
        if env.limiters.bad_packet.allow(env.now) {
            env.metrics.bad_packets_reported.inc();
            warn!(%from, msg_type, detail, "ignored bad packet");
        } else {
            env.metrics.bad_packets_suppressed.inc();
        }
    }
}
