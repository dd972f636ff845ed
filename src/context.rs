// context.rs - process context: connection table, limiters, inbound pump
// Numan Thabit 2025

use std::{collections::VecDeque, net::SocketAddr};

use ed25519_dalek::VerifyingKey;
use rand::Rng;
use tracing::warn;

use crate::{
    clock::{MonotonicClock, Timestamp, MILLION},
    config::{Config, ConfigError, MAX_RECENT_LOCAL_CIDS},
    connection::{Connection, ConnectionError, ConnectionHandle, ConnectionState},
    identity::Identity,
    listener::{Listener, ListenerError},
    metrics::{Metrics, MetricsError},
    socket::{loopback_pair, BoundSocket, RouteTarget, RECV_BUFFER_LEN},
};

/// Global token-per-interval limiter, as used for bad-packet reporting and
/// stray-packet replies.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Timestamp,
    last: Timestamp,
}

impl RateLimiter {
    pub fn new(interval: Timestamp) -> Self {
        Self { interval, last: 0 }
    }

    /// True at most once per interval.
    pub fn allow(&mut self, now: Timestamp) -> bool {
        if self.last != 0 && self.last + self.interval > now {
            return false;
        }
        self.last = now;
        true
    }
}

/// The process-wide rate limiters of the transport.
#[derive(Debug)]
pub struct Limiters {
    /// Bad-packet log reports: one per two seconds, globally.
    pub bad_packet: RateLimiter,
    /// Replies to stray packets (reflection guard): one per second.
    pub reply: RateLimiter,
}

impl Default for Limiters {
    fn default() -> Self {
        Self {
            bad_packet: RateLimiter::new(2 * MILLION),
            reply: RateLimiter::new(MILLION),
        }
    }
}

/// Notifications surfaced to the application.
#[derive(Debug, Clone)]
pub enum Event {
    /// A connection changed state.  A passive connection's first event
    /// (`None` -> `Connecting`) is the signal to accept or close it.
    StateChange {
        conn: ConnectionHandle,
        old_state: ConnectionState,
        new_state: ConnectionState,
        end_reason: u32,
        end_debug: String,
    },
}

/// Borrowed slice of context state handed into listener and connection
/// handlers.
pub struct Env<'a> {
    pub cfg: &'a Config,
    pub metrics: &'a Metrics,
    pub limiters: &'a mut Limiters,
    pub events: &'a mut VecDeque<Event>,
    pub trusted_ca: Option<VerifyingKey>,
    pub now: Timestamp,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    reserved: bool,
    conn: Option<Connection>,
}

/// Owning table of all connections in a context, active and passive, plus
/// the ring of recently used local connection ids.
#[derive(Debug, Default)]
pub struct ConnectionTable {
    slots: Vec<Slot>,
    recent_cids: VecDeque<u16>,
}

impl ConnectionTable {
    /// Claims a slot and hands out its handle before the connection is
    /// built, so the handle can be wired into socket routes.
    pub fn reserve(&mut self) -> ConnectionHandle {
        let slot = self
            .slots
            .iter()
            .position(|s| s.conn.is_none() && !s.reserved);
        let slot = match slot {
            Some(i) => i,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    reserved: false,
                    conn: None,
                });
                self.slots.len() - 1
            }
        };
        let entry = &mut self.slots[slot];
        entry.generation = entry.generation.wrapping_add(1);
        entry.reserved = true;
        ConnectionHandle {
            slot: slot as u32,
            generation: entry.generation,
        }
    }

    pub fn install(&mut self, handle: ConnectionHandle, conn: Connection) {
        let entry = &mut self.slots[handle.slot as usize];
        debug_assert!(entry.reserved && entry.generation == handle.generation);
        entry.reserved = false;
        entry.conn = Some(conn);
    }

    /// Releases a reservation that never got a connection.
    pub fn release(&mut self, handle: ConnectionHandle) {
        let entry = &mut self.slots[handle.slot as usize];
        if entry.generation == handle.generation {
            entry.reserved = false;
        }
    }

    pub fn get(&self, handle: ConnectionHandle) -> Option<&Connection> {
        self.slots
            .get(handle.slot as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.conn.as_ref())
    }

    pub fn get_mut(&mut self, handle: ConnectionHandle) -> Option<&mut Connection> {
        self.slots
            .get_mut(handle.slot as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.conn.as_mut())
    }

    pub fn remove(&mut self, handle: ConnectionHandle) -> Option<Connection> {
        self.slots
            .get_mut(handle.slot as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.conn.take())
    }

    /// Handles of all live connections.
    pub fn handles(&self) -> Vec<ConnectionHandle> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| {
                s.conn.as_ref().map(|_| ConnectionHandle {
                    slot: i as u32,
                    generation: s.generation,
                })
            })
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.conn.is_some()).count()
    }

    /// Picks a fresh local connection id: nonzero, nonzero low half, not
    /// recently used, not colliding with a live connection.
    pub fn generate_local_cid(&mut self) -> u32 {
        let mut rng = rand::thread_rng();
        loop {
            let candidate: u32 = rng.gen();
            if candidate == 0 || candidate & 0xffff == 0 {
                continue;
            }
            let low = candidate as u16;
            if self.recent_cids.contains(&low) {
                continue;
            }
            if self
                .slots
                .iter()
                .any(|s| s.conn.as_ref().is_some_and(|c| c.local_cid == candidate))
            {
                continue;
            }
            self.recent_cids.push_back(low);
            while self.recent_cids.len() > MAX_RECENT_LOCAL_CIDS {
                self.recent_cids.pop_front();
            }
            return candidate;
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("metrics error: {0}")]
    Metrics(#[from] MetricsError),
    #[error("trusted CA key is not a valid ed25519 key")]
    BadCaKey,
}

/// Everything one transport instance owns.  The original kept pieces of
/// this in module-level statics; holding them here lets tests run multiple
/// contexts in one process.
pub struct SocketsContext {
    cfg: Config,
    metrics: Metrics,
    clock: MonotonicClock,
    limiters: Limiters,
    events: VecDeque<Event>,
    trusted_ca: Option<VerifyingKey>,
    table: ConnectionTable,
    listeners: Vec<Option<Listener>>,
}

impl SocketsContext {
    pub fn new(cfg: Config) -> Result<Self, ContextError> {
        cfg.validate()?;
        let trusted_ca = match cfg.trusted_ca_key_bytes() {
            Some(bytes) => {
                Some(VerifyingKey::from_bytes(&bytes).map_err(|_| ContextError::BadCaKey)?)
            }
            None => None,
        };
        Ok(Self {
            cfg,
            metrics: Metrics::new()?,
            clock: MonotonicClock::new(),
            limiters: Limiters::default(),
            events: VecDeque::new(),
            trusted_ca,
            table: ConnectionTable::default(),
            listeners: Vec::new(),
        })
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    // ------------------------------------------------------------------
    // Application operations (callers hold the transport lock)
    // ------------------------------------------------------------------

    /// Creates a listener bound to `local`.
    pub fn listen(
        &mut self,
        local: SocketAddr,
        identity_local: Option<Identity>,
    ) -> Result<usize, ListenerError> {
        let index = self
            .listeners
            .iter()
            .position(|l| l.is_none())
            .unwrap_or(self.listeners.len());
        let listener = Listener::bind(index, local, identity_local)?;
        if index == self.listeners.len() {
            self.listeners.push(Some(listener));
        } else {
            self.listeners[index] = Some(listener);
        }
        Ok(index)
    }

    pub fn listener_addr(&self, index: usize) -> Option<SocketAddr> {
        self.listeners
            .get(index)
            .and_then(|l| l.as_ref())
            .map(|l| l.local_addr())
    }

    /// Starts an active connection to `remote`.
    pub fn connect(
        &mut self,
        remote: SocketAddr,
        identity_local: Option<Identity>,
        expected_identity: Option<Identity>,
    ) -> Result<ConnectionHandle, ConnectionError> {
        let now = self.clock.now();
        let handle = self.table.reserve();
        let local_cid = self.table.generate_local_cid();

        let Self {
            cfg,
            metrics,
            limiters,
            events,
            trusted_ca,
            table,
            ..
        } = self;
        let mut env = Env {
            cfg,
            metrics,
            limiters,
            events,
            trusted_ca: trusted_ca.clone(),
            now,
        };
        match Connection::connect(
            handle,
            local_cid,
            remote,
            identity_local,
            expected_identity,
            &mut env,
        ) {
            Ok(conn) => {
                table.install(handle, conn);
                metrics.live_connections.set(table.live_count() as i64);
                Ok(handle)
            }
            Err(err) => {
                table.release(handle);
                Err(err)
            }
        }
    }

    /// Accepts a pending passive connection (sends ConnectOK).
    pub fn accept(&mut self, handle: ConnectionHandle) -> Result<(), ConnectionError> {
        self.with_conn(handle, |conn, env| conn.accept(env))?
    }

    /// Closes a connection.  Teardown packets flow from the think loop.
    pub fn close(&mut self, handle: ConnectionHandle, reason: u32, debug: &str, linger: bool) {
        let _ = self.with_conn(handle, |conn, env| {
            conn.close(env, reason, debug, linger);
            Ok::<(), ConnectionError>(())
        });
        self.pump_loopback();
    }

    /// Sends application payload over an established connection.
    pub fn send(&mut self, handle: ConnectionHandle, data: &[u8]) -> Result<(), ConnectionError> {
        self.with_conn(handle, |conn, env| conn.send_plaintext(env, data))??;
        self.pump_loopback();
        Ok(())
    }

    /// Next plaintext delivered on this connection.
    pub fn poll_received(&mut self, handle: ConnectionHandle) -> Option<(u64, bytes::Bytes)> {
        self.table.get_mut(handle).and_then(|c| c.poll_received())
    }

    pub fn connection_state(&self, handle: ConnectionHandle) -> Option<ConnectionState> {
        self.table.get(handle).map(|c| c.state())
    }

    pub fn remote_identity(&self, handle: ConnectionHandle) -> Option<Identity> {
        self.table
            .get(handle)
            .and_then(|c| c.remote_identity().cloned())
    }

    /// Drains pending application events.
    pub fn drain_events(&mut self) -> Vec<Event> {
        self.events.drain(..).collect()
    }

    /// Creates a fully established in-process connection pair.  No packets
    /// touch the network and the synthetic connect transitions produce no
    /// events.
    pub fn create_socket_pair(
        &mut self,
        identity_a: Identity,
        identity_b: Identity,
    ) -> Result<(ConnectionHandle, ConnectionHandle), ConnectionError> {
        let now = self.clock.now();
        let handle_a = self.table.reserve();
        let handle_b = self.table.reserve();
        let cid_a = self.table.generate_local_cid();
        let cid_b = self.table.generate_local_cid();

        let (sock_a, sock_b) = loopback_pair();
        let mut conn_a = Connection::new_loopback(
            handle_a,
            cid_a,
            identity_a,
            BoundSocket::Loopback(sock_a),
            now,
        );
        let mut conn_b = Connection::new_loopback(
            handle_b,
            cid_b,
            identity_b,
            BoundSocket::Loopback(sock_b),
            now,
        );

        let (id_a, cid_a, cert_a, crypt_a) = conn_a.handshake_material();
        let (id_b, cid_b, cert_b, crypt_b) = conn_b.handshake_material();

        let Self {
            cfg,
            metrics,
            limiters,
            events,
            trusted_ca,
            table,
            ..
        } = self;
        let mut env = Env {
            cfg,
            metrics,
            limiters,
            events,
            trusted_ca: trusted_ca.clone(),
            now,
        };
        conn_a.complete_loopback(&mut env, id_b, cid_b, &cert_b, &crypt_b, true)?;
        conn_b.complete_loopback(&mut env, id_a, cid_a, &cert_a, &crypt_a, false)?;

        table.install(handle_a, conn_a);
        table.install(handle_b, conn_b);
        metrics.live_connections.set(table.live_count() as i64);
        Ok((handle_a, handle_b))
    }

    // ------------------------------------------------------------------
    // Service pump
    // ------------------------------------------------------------------

    /// Drains sockets, runs due thinks, reaps dead connections.  Returns
    /// the earliest deadline at which it wants to run again.
    pub fn pump(&mut self) -> Timestamp {
        let now = self.clock.now();
        self.drain_listener_sockets(now);
        self.drain_connection_sockets(now);
        self.pump_loopback();
        self.run_thinks(now);
        self.reap_dead();
        self.earliest_deadline(now)
    }

    fn drain_listener_sockets(&mut self, now: Timestamp) {
        for i in 0..self.listeners.len() {
            loop {
                let mut buf = [0u8; RECV_BUFFER_LEN];
                let polled = {
                    let Some(listener) = self.listeners[i].as_ref() else {
                        break;
                    };
                    match listener.socket().poll_recv(&mut buf) {
                        Ok(polled) => polled,
                        Err(err) => {
                            warn!(%err, "listener socket receive failed");
                            break;
                        }
                    }
                };
                let Some((len, from)) = polled else { break };
                let route = self.listeners[i]
                    .as_ref()
                    .map(|l| l.socket().route_for(from))
                    .unwrap_or(RouteTarget::Listener(i));
                let pkt = buf[..len].to_vec();
                self.dispatch(route, &pkt, from, now);
            }
        }
    }

    fn drain_connection_sockets(&mut self, now: Timestamp) {
        for handle in self.table.handles() {
            loop {
                let mut buf = [0u8; RECV_BUFFER_LEN];
                let polled = {
                    let Some(sock) = self.table.get(handle).and_then(|c| c.own_socket.as_ref())
                    else {
                        break;
                    };
                    match sock.poll_recv(&mut buf) {
                        Ok(polled) => polled,
                        Err(err) => {
                            warn!(%err, "connection socket receive failed");
                            break;
                        }
                    }
                };
                let Some((len, from)) = polled else { break };
                let pkt = buf[..len].to_vec();
                self.dispatch(RouteTarget::Connection(handle.raw()), &pkt, from, now);
            }
        }
    }

    /// Moves queued loopback packets into their destination connections
    /// until everything settles.
    fn pump_loopback(&mut self) {
        loop {
            let mut progressed = false;
            for handle in self.table.handles() {
                while let Some(pkt) = self
                    .table
                    .get(handle)
                    .and_then(|c| c.pop_loopback_inbound())
                {
                    progressed = true;
                    let now = self.clock.now();
                    let Self {
                        cfg,
                        metrics,
                        limiters,
                        events,
                        trusted_ca,
                        table,
                        ..
                    } = self;
                    if let Some(conn) = table.get_mut(handle) {
                        let mut env = Env {
                            cfg,
                            metrics,
                            limiters,
                            events,
                            trusted_ca: trusted_ca.clone(),
                            now,
                        };
                        conn.on_packet(&mut env, &pkt);
                    }
                }
            }
            if !progressed {
                break;
            }
        }
    }

    fn dispatch(&mut self, route: RouteTarget, pkt: &[u8], from: SocketAddr, now: Timestamp) {
        let Self {
            cfg,
            metrics,
            limiters,
            events,
            trusted_ca,
            table,
            listeners,
            ..
        } = self;
        let mut env = Env {
            cfg,
            metrics,
            limiters,
            events,
            trusted_ca: trusted_ca.clone(),
            now,
        };
        match route {
            RouteTarget::Listener(i) => {
                if let Some(listener) = listeners.get_mut(i).and_then(|l| l.as_mut()) {
                    listener.on_unknown_packet(&mut env, table, pkt, from);
                }
            }
            RouteTarget::Connection(raw) => {
                let handle = ConnectionHandle::from_raw(raw);
                if let Some(conn) = table.get_mut(handle) {
                    conn.on_packet(&mut env, pkt);
                }
            }
        }
    }

    fn run_thinks(&mut self, now: Timestamp) {
        for handle in self.table.handles() {
            let due = self
                .table
                .get(handle)
                .map(|c| c.next_think <= now)
                .unwrap_or(false);
            if !due {
                continue;
            }
            let Self {
                cfg,
                metrics,
                limiters,
                events,
                trusted_ca,
                table,
                ..
            } = self;
            if let Some(conn) = table.get_mut(handle) {
                let mut env = Env {
                    cfg,
                    metrics,
                    limiters,
                    events,
                    trusted_ca: trusted_ca.clone(),
                    now,
                };
                conn.think(&mut env);
            }
        }
        self.pump_loopback();
    }

    fn reap_dead(&mut self) {
        for handle in self.table.handles() {
            let dead = self
                .table
                .get(handle)
                .map(|c| c.state().terminal())
                .unwrap_or(false);
            if !dead {
                continue;
            }
            if let Some(mut conn) = self.table.remove(handle) {
                conn.free_resources();
            }
            for listener in self.listeners.iter_mut().flatten() {
                listener.forget_connection(handle);
            }
        }
        self.metrics
            .live_connections
            .set(self.table.live_count() as i64);
    }

    fn earliest_deadline(&self, now: Timestamp) -> Timestamp {
        self.table
            .handles()
            .into_iter()
            .filter_map(|h| self.table.get(h).map(|c| c.next_think))
            .min()
            .unwrap_or(now + MILLION)
            .max(now)
    }

    /// Feeds a raw packet straight into a connection, bypassing sockets.
    #[cfg(test)]
    pub(crate) fn inject_packet_for_test(&mut self, handle: ConnectionHandle, pkt: &[u8]) {
        let now = self.clock.now();
        let from: SocketAddr = "127.0.0.1:9".parse().expect("literal addr");
        self.dispatch(RouteTarget::Connection(handle.raw()), pkt, from, now);
    }

    fn with_conn<T>(
        &mut self,
        handle: ConnectionHandle,
        f: impl FnOnce(&mut Connection, &mut Env<'_>) -> T,
    ) -> Result<T, ConnectionError> {
        let now = self.clock.now();
        let Self {
            cfg,
            metrics,
            limiters,
            events,
            trusted_ca,
            table,
            ..
        } = self;
        let conn = table
            .get_mut(handle)
            .ok_or(ConnectionError::InvalidState(ConnectionState::Dead))?;
        let mut env = Env {
            cfg,
            metrics,
            limiters,
            events,
            trusted_ca: trusted_ca.clone(),
            now,
        };
        Ok(f(conn, &mut env))
    }
}
