// api.rs - public surface over one locked transport context
// Numan Thabit 2025

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard},
};

use crate::{
    clock::Timestamp,
    config::Config,
    connection::{ConnectionError, ConnectionHandle, ConnectionState},
    context::{ContextError, Event, SocketsContext},
    identity::Identity,
    listener::ListenerError,
    metrics::Metrics,
};

/// Handle to a listener created through [`Sockets::listen`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerHandle(usize);

/// The application's entry point.
///
/// All operations take the single transport lock before touching connection
/// state, matching the service thread; the lock IS the concurrency model.
/// Clones share the same context.
#[derive(Clone)]
pub struct Sockets {
    inner: Arc<Mutex<SocketsContext>>,
}

impl Sockets {
    pub fn new(cfg: Config) -> Result<Self, ContextError> {
        Ok(Self {
            inner: Arc::new(Mutex::new(SocketsContext::new(cfg)?)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SocketsContext> {
        self.inner.lock().expect("transport lock poisoned")
    }

    /// Current transport time, microseconds.
    pub fn now(&self) -> Timestamp {
        self.lock().now()
    }

    /// Snapshot of the metric handles (cheap; counters are shared).
    pub fn metrics(&self) -> Metrics {
        self.lock().metrics().clone()
    }

    /// Binds a listener.  `identity_local` goes into the certs of accepted
    /// connections; `None` listens anonymously.
    pub fn listen(
        &self,
        local: SocketAddr,
        identity_local: Option<Identity>,
    ) -> Result<ListenerHandle, ListenerError> {
        self.lock().listen(local, identity_local).map(ListenerHandle)
    }

    pub fn listener_addr(&self, listener: ListenerHandle) -> Option<SocketAddr> {
        self.lock().listener_addr(listener.0)
    }

    /// Starts connecting to `remote`.  The connection reports progress via
    /// [`Sockets::drain_events`].
    pub fn connect(
        &self,
        remote: SocketAddr,
        identity_local: Option<Identity>,
        expected_identity: Option<Identity>,
    ) -> Result<ConnectionHandle, ConnectionError> {
        self.lock().connect(remote, identity_local, expected_identity)
    }

    /// Accepts a pending passive connection, sending ConnectOK.
    pub fn accept(&self, conn: ConnectionHandle) -> Result<(), ConnectionError> {
        self.lock().accept(conn)
    }

    /// Closes a connection.  Non-blocking; teardown packets flow from the
    /// service loop.  `linger` half-closes instead.
    pub fn close(&self, conn: ConnectionHandle, reason: u32, debug: &str, linger: bool) {
        self.lock().close(conn, reason, debug, linger)
    }

    /// Sends application payload.  Chunks larger than one packet are split.
    pub fn send(&self, conn: ConnectionHandle, data: &[u8]) -> Result<(), ConnectionError> {
        self.lock().send(conn, data)
    }

    /// Next plaintext delivered by the peer, with its full packet number.
    pub fn poll_received(&self, conn: ConnectionHandle) -> Option<(u64, bytes::Bytes)> {
        self.lock().poll_received(conn)
    }

    /// Current state, or `None` once the connection has been reaped.
    pub fn connection_state(&self, conn: ConnectionHandle) -> Option<ConnectionState> {
        self.lock().connection_state(conn)
    }

    pub fn remote_identity(&self, conn: ConnectionHandle) -> Option<Identity> {
        self.lock().remote_identity(conn)
    }

    /// Drains queued state-change events.
    pub fn drain_events(&self) -> Vec<Event> {
        self.lock().drain_events()
    }

    /// Creates a fully established in-process connection pair that never
    /// touches the network.
    pub fn create_socket_pair(
        &self,
        identity_a: Identity,
        identity_b: Identity,
    ) -> Result<(ConnectionHandle, ConnectionHandle), ConnectionError> {
        self.lock().create_socket_pair(identity_a, identity_b)
    }

    /// Runs one service iteration: drain sockets, run timers, reap the
    /// dead.  Returns the next wanted wakeup time.  The service thread
    /// calls this; tests may drive it manually.
    pub fn pump(&self) -> Timestamp {
        self.lock().pump()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        challenge::challenge_time,
        config::{AllowWithoutAuth, MIN_PADDED_PACKET_SIZE, PROTOCOL_VERSION},
        connection::reasons,
        crypto::cert::CertBundle,
        proto::{
            CMsgSteamSocketsUdpChallengeReply, CMsgSteamSocketsUdpChallengeRequest,
            CMsgSteamSocketsUdpConnectOk, CMsgSteamSocketsUdpConnectRequest,
            CMsgSteamSocketsUdpConnectionClosed,
        },
        wire::{self, MsgKind},
    };
    use prost::Message;
    use rand::Rng;
    use std::{net::UdpSocket, time::Duration};

    fn make_sockets() -> Sockets {
        Sockets::new(Config::default()).expect("context")
    }

    fn bind_listener(sockets: &Sockets, identity: Option<Identity>) -> (ListenerHandle, SocketAddr) {
        let mut rng = rand::thread_rng();
        for _ in 0..32 {
            let port: u16 = rng.gen_range(20000..60000);
            let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
            if let Ok(listener) = sockets.listen(addr, identity.clone()) {
                return (listener, addr);
            }
        }
        panic!("could not find a free port");
    }

    /// Pumps until `pred` holds or the deadline passes.
    fn drive_until(sockets: &Sockets, mut pred: impl FnMut() -> bool) -> bool {
        for _ in 0..2000 {
            sockets.pump();
            if pred() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }

    /// Pumps a fixed number of rounds, for "nothing should happen" checks.
    fn drive_n(sockets: &Sockets, rounds: usize) {
        for _ in 0..rounds {
            sockets.pump();
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn pending_passive_conn(events: &[Event], client: ConnectionHandle) -> Option<ConnectionHandle> {
        events.iter().find_map(|event| match event {
            Event::StateChange {
                conn, new_state, ..
            } if *conn != client && *new_state == ConnectionState::Connecting => Some(*conn),
            _ => None,
        })
    }

    /// Hand-rolled wire client for the server-side scenarios.
    struct RawClient {
        sock: UdpSocket,
        server: SocketAddr,
    }

    impl RawClient {
        fn new(server: SocketAddr) -> Self {
            let sock = UdpSocket::bind("127.0.0.1:0").expect("bind");
            sock.set_read_timeout(Some(Duration::from_millis(20)))
                .expect("timeout");
            Self { sock, server }
        }

        fn send(&self, pkt: &[u8]) {
            self.sock.send_to(pkt, self.server).expect("send");
        }

        fn try_recv(&self) -> Option<Vec<u8>> {
            let mut buf = [0u8; 2048];
            match self.sock.recv_from(&mut buf) {
                Ok((len, _)) => Some(buf[..len].to_vec()),
                Err(_) => None,
            }
        }

        /// Receives while keeping the server context pumped.
        fn recv_pumped(&self, sockets: &Sockets) -> Option<Vec<u8>> {
            for _ in 0..20 {
                sockets.pump();
                if let Some(pkt) = self.try_recv() {
                    return Some(pkt);
                }
            }
            None
        }

        fn fetch_challenge(&self, sockets: &Sockets, cid: u32) -> u64 {
            let msg = CMsgSteamSocketsUdpChallengeRequest {
                connection_id: Some(cid),
                my_timestamp: Some(1),
                protocol_version: Some(PROTOCOL_VERSION),
            };
            let pkt = wire::serialize_padded_msg(MsgKind::ChallengeRequest, &msg).unwrap();
            self.send(&pkt);
            let reply = self.recv_pumped(sockets).expect("challenge reply");
            assert_eq!(reply[0], MsgKind::ChallengeReply as u8);
            let reply =
                CMsgSteamSocketsUdpChallengeReply::decode(wire::parse_bare_body(&reply).unwrap())
                    .unwrap();
            reply.challenge.expect("challenge present")
        }

        fn send_connect_request(&self, cid: u32, challenge: u64, bundle: &CertBundle) {
            let msg = CMsgSteamSocketsUdpConnectRequest {
                client_connection_id: Some(cid),
                challenge: Some(challenge),
                my_timestamp: Some(2),
                ping_est_ms: None,
                cert: Some(bundle.signed_cert.clone()),
                crypt: Some(bundle.signed_crypt.clone()),
                identity_string: None,
            };
            let pkt = wire::serialize_msg(MsgKind::ConnectRequest, &msg).unwrap();
            self.send(&pkt);
        }
    }

    #[test]
    fn happy_path_connect_and_exchange() {
        let sockets = make_sockets();
        let (_listener, addr) = bind_listener(&sockets, Some(Identity::User(1)));

        let client = sockets
            .connect(addr, Some(Identity::User(2)), None)
            .expect("connect");

        // Wait for the incoming connection to surface, then accept it.
        let mut seen = Vec::new();
        assert!(
            drive_until(&sockets, || {
                seen.extend(sockets.drain_events());
                pending_passive_conn(&seen, client).is_some()
            }),
            "server side never surfaced"
        );
        let server = pending_passive_conn(&seen, client).unwrap();
        sockets.accept(server).expect("accept");

        assert!(
            drive_until(&sockets, || {
                sockets.connection_state(client) == Some(ConnectionState::Connected)
                    && sockets.connection_state(server) == Some(ConnectionState::Connected)
            }),
            "both sides should connect"
        );

        // Each side learned the peer's cert identity.
        assert_eq!(sockets.remote_identity(server), Some(Identity::User(2)));
        assert_eq!(sockets.remote_identity(client), Some(Identity::User(1)));

        // Payload both ways.
        sockets.send(client, b"hello from client").expect("send");
        assert!(drive_until(&sockets, || {
            sockets
                .poll_received(server)
                .is_some_and(|(_, data)| data.as_ref() == b"hello from client")
        }));

        sockets.send(server, b"hello from server").expect("send");
        assert!(drive_until(&sockets, || {
            sockets
                .poll_received(client)
                .is_some_and(|(_, data)| data.as_ref() == b"hello from server")
        }));
    }

    #[test]
    fn spoof_cannot_amplify_or_allocate() {
        let sockets = make_sockets();
        let (_listener, addr) = bind_listener(&sockets, None);
        let raw = RawClient::new(addr);

        let msg = CMsgSteamSocketsUdpChallengeRequest {
            connection_id: Some(77),
            my_timestamp: Some(1),
            protocol_version: Some(PROTOCOL_VERSION),
        };
        let request = wire::serialize_padded_msg(MsgKind::ChallengeRequest, &msg).unwrap();
        assert!(request.len() >= MIN_PADDED_PACKET_SIZE);
        raw.send(&request);

        let reply = raw.recv_pumped(&sockets).expect("challenge reply");
        assert!(
            reply.len() <= request.len(),
            "reply of {} bytes would amplify the {} byte request",
            reply.len(),
            request.len()
        );
        // The cookie never came back, so nothing may have been allocated.
        assert_eq!(sockets.metrics().connections_accepted.get(), 0);
        assert_eq!(sockets.metrics().live_connections.get(), 0);
    }

    #[test]
    fn stale_challenge_rejected_without_reply() {
        let sockets = make_sockets();
        let (_listener, addr) = bind_listener(&sockets, None);
        let raw = RawClient::new(addr);

        let real = raw.fetch_challenge(&sockets, 100);
        // Same cookie bits, but claiming a tick from ten windows ago.
        let old_tick = challenge_time(sockets.now()).wrapping_sub(10);
        let stale = (real & !0xffff) | u64::from(old_tick);

        let bundle = CertBundle::generate(None);
        raw.send_connect_request(100, stale, &bundle);
        assert!(drive_until(&sockets, || {
            sockets.metrics().challenges_rejected.get() == 1
        }));

        assert!(raw.try_recv().is_none(), "stale challenge must draw no reply");
        assert_eq!(sockets.metrics().connections_accepted.get(), 0);
    }

    #[test]
    fn duplicate_remote_key_rejected() {
        let sockets = make_sockets();
        let (_listener, addr) = bind_listener(&sockets, None);

        let identity = Identity::User(42);
        let bundle_a = CertBundle::generate(Some(&identity));
        let bundle_b = CertBundle::generate(Some(&identity));

        let a = RawClient::new(addr);
        let challenge = a.fetch_challenge(&sockets, 100);
        a.send_connect_request(100, challenge, &bundle_a);
        assert!(drive_until(&sockets, || {
            sockets.metrics().connections_accepted.get() == 1
        }));

        // Same identity, same client connection id, different address.
        let b = RawClient::new(addr);
        let challenge = b.fetch_challenge(&sockets, 100);
        b.send_connect_request(100, challenge, &bundle_b);

        let reply = b.recv_pumped(&sockets).expect("rejection expected");
        assert_eq!(reply[0], MsgKind::ConnectionClosed as u8);
        assert!(reply.len() >= MIN_PADDED_PACKET_SIZE);
        let closed = CMsgSteamSocketsUdpConnectionClosed::decode(
            wire::parse_padded_body(&reply).unwrap(),
        )
        .unwrap();
        assert_eq!(closed.to_connection_id, Some(100));
        assert_eq!(closed.reason_code, Some(reasons::MISC_GENERIC));
        assert_eq!(
            closed.debug.as_deref(),
            Some("A connection with that ID already exists.")
        );

        // The first connection is unaffected.
        assert_eq!(sockets.metrics().connections_accepted.get(), 1);
        assert_eq!(sockets.metrics().connections_rejected_duplicate.get(), 1);
    }

    #[test]
    fn repeated_connect_request_is_idempotent_and_reply_resent() {
        let sockets = make_sockets();
        let (_listener, addr) = bind_listener(&sockets, None);

        let raw = RawClient::new(addr);
        let bundle = CertBundle::generate(Some(&Identity::User(7)));
        let challenge = raw.fetch_challenge(&sockets, 555);
        raw.send_connect_request(555, challenge, &bundle);
        assert!(drive_until(&sockets, || {
            sockets.metrics().connections_accepted.get() == 1
        }));

        let events = sockets.drain_events();
        let server = events
            .iter()
            .find_map(|e| match e {
                Event::StateChange {
                    conn, new_state, ..
                } if *new_state == ConnectionState::Connecting => Some(*conn),
                _ => None,
            })
            .expect("incoming connection");

        // Client retransmits before we accept: ignored, no extra connection.
        raw.send_connect_request(555, challenge, &bundle);
        drive_n(&sockets, 30);
        assert_eq!(sockets.metrics().connections_accepted.get(), 1);
        assert!(raw.try_recv().is_none());

        sockets.accept(server).expect("accept");
        let ok = raw.recv_pumped(&sockets).expect("connect ok");
        assert_eq!(ok[0], MsgKind::ConnectOk as u8);
        let ok = CMsgSteamSocketsUdpConnectOk::decode(wire::parse_bare_body(&ok).unwrap()).unwrap();
        assert_eq!(ok.client_connection_id, Some(555));

        // A retransmit after acceptance gets exactly one fresh ConnectOK.
        raw.send_connect_request(555, challenge, &bundle);
        let resent = raw.recv_pumped(&sockets).expect("resent connect ok");
        assert_eq!(resent[0], MsgKind::ConnectOk as u8);
        assert!(raw.try_recv().is_none());
        assert_eq!(sockets.metrics().connections_accepted.get(), 1);
    }

    #[test]
    fn close_tears_down_both_sides() {
        let sockets = make_sockets();
        let (_listener, addr) = bind_listener(&sockets, None);

        let client = sockets.connect(addr, None, None).expect("connect");
        let mut seen = Vec::new();
        assert!(drive_until(&sockets, || {
            seen.extend(sockets.drain_events());
            pending_passive_conn(&seen, client).is_some()
        }));
        let server = pending_passive_conn(&seen, client).unwrap();
        sockets.accept(server).expect("accept");
        assert!(drive_until(&sockets, || {
            sockets.connection_state(client) == Some(ConnectionState::Connected)
                && sockets.connection_state(server) == Some(ConnectionState::Connected)
        }));

        sockets.close(client, reasons::APP_GENERIC, "done here", false);

        // The server hears the close and acknowledges; the client teardown
        // completes and its slot is reaped once Dead.
        assert!(drive_until(&sockets, || {
            sockets.connection_state(server) == Some(ConnectionState::ClosedByPeer)
                && sockets.connection_state(client).is_none()
        }));

        let events = sockets.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            Event::StateChange { conn, new_state: ConnectionState::ClosedByPeer, end_reason, .. }
                if *conn == server && *end_reason == reasons::APP_GENERIC
        )));
    }

    #[test]
    fn loopback_pair_transfers_a_megabyte() {
        let sockets = make_sockets();
        let (a, b) = sockets
            .create_socket_pair(Identity::User(10), Identity::User(20))
            .expect("pair");

        assert_eq!(sockets.connection_state(a), Some(ConnectionState::Connected));
        assert_eq!(sockets.connection_state(b), Some(ConnectionState::Connected));
        assert_eq!(sockets.remote_identity(a), Some(Identity::User(20)));
        assert_eq!(sockets.remote_identity(b), Some(Identity::User(10)));

        // The synthetic connect transitions are invisible.
        assert!(sockets.drain_events().is_empty());

        // Nothing crossed a network socket.
        assert_eq!(sockets.metrics().connections_accepted.get(), 0);

        let mut payload = vec![0u8; 1 << 20];
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        sockets.send(a, &payload).expect("send");

        let mut received = Vec::with_capacity(payload.len());
        let mut last_seq = 0;
        while let Some((seq, chunk)) = sockets.poll_received(b) {
            assert!(seq > last_seq, "chunks must arrive in order");
            last_seq = seq;
            received.extend_from_slice(&chunk);
        }
        assert_eq!(received.len(), payload.len());
        assert_eq!(received, payload);

        // Later transitions do produce events.
        sockets.close(a, reasons::APP_GENERIC, "bye", false);
        sockets.pump();
        let events = sockets.drain_events();
        assert!(events.iter().any(|e| matches!(
            e,
            Event::StateChange { conn, new_state: ConnectionState::ClosedByPeer, .. } if *conn == b
        )));
    }

    #[test]
    fn unauthenticated_refused_when_policy_forbids() {
        let cfg = Config {
            ip_allow_without_auth: AllowWithoutAuth(0),
            ..Config::default()
        };
        let sockets = Sockets::new(cfg).expect("context");
        let (_listener, addr) = bind_listener(&sockets, None);

        let raw = RawClient::new(addr);
        let bundle = CertBundle::generate(None); // anonymous
        let challenge = raw.fetch_challenge(&sockets, 9);
        raw.send_connect_request(9, challenge, &bundle);
        drive_n(&sockets, 50);

        assert!(raw.try_recv().is_none());
        assert_eq!(sockets.metrics().connections_accepted.get(), 0);

        // Also refused at the connect() call with no local identity.
        let err = sockets.connect(addr, None, None).unwrap_err();
        assert!(matches!(err, ConnectionError::IdentityRequired));
    }

    #[test]
    fn wrong_cid_data_packet_draws_rate_limited_no_connection() {
        let sockets = make_sockets();
        let (a, _b) = sockets
            .create_socket_pair(Identity::User(1), Identity::User(2))
            .expect("pair");

        // Deliver a data packet with a bogus recipient cid straight into a.
        let mut pkt = Vec::new();
        wire::DataHeader {
            flags: 0,
            to_connection_id: 0xbad0_cafe,
            wire_seq: 1,
        }
        .encode_into(&mut pkt);
        pkt.extend_from_slice(&[0u8; 32]);

        let before = sockets.metrics().no_connection_sent.get();
        {
            let mut guard = sockets.inner.lock().unwrap();
            guard.inject_packet_for_test(a, &pkt);
            guard.inject_packet_for_test(a, &pkt);
        }
        let after = sockets.metrics().no_connection_sent.get();
        // The reflection limiter lets at most one hint through.
        assert_eq!(after - before, 1);
    }
}
