// socket.rs - shared UDP sockets, per-remote views, loopback pairs
// Numan Thabit 2025

use std::{
    collections::VecDeque,
    io::{self, IoSlice},
    net::{SocketAddr, UdpSocket},
    sync::{Arc, Mutex},
};

use ahash::AHashMap;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use thiserror::Error;

/// Receive buffer size; comfortably above the wire MTU.
pub const RECV_BUFFER_LEN: usize = 2048;

/// Where inbound packets from a given remote should be delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTarget {
    /// The listener's unknown-source path.
    Listener(usize),
    /// An accepted or connecting connection (raw handle bits).
    Connection(u64),
}

#[derive(Debug, Error)]
pub enum SocketError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("socket closed")]
    Closed,
}

#[derive(Debug)]
struct SharedSocketInner {
    sock: UdpSocket,
    local_addr: SocketAddr,
    default_route: RouteTarget,
    routes: Mutex<AHashMap<SocketAddr, RouteTarget>>,
}

/// One UDP bind shared between a listener and its accepted connections.
///
/// The socket is non-blocking; the service loop drains it and uses
/// [`route_for`](Self::route_for) to dispatch each packet.  Only the service
/// thread mutates the route table.
#[derive(Debug, Clone)]
pub struct SharedSocket {
    inner: Arc<SharedSocketInner>,
}

impl SharedSocket {
    /// Binds to `local`; packets from unknown remotes go to `default_route`.
    pub fn bind(local: SocketAddr, default_route: RouteTarget) -> Result<Self, SocketError> {
        let domain = Domain::for_address(local);
        let sock = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        sock.set_nonblocking(true)?;
        sock.bind(&local.into())?;
        let sock: UdpSocket = sock.into();
        let local_addr = sock.local_addr()?;
        Ok(Self {
            inner: Arc::new(SharedSocketInner {
                sock,
                local_addr,
                default_route,
                routes: Mutex::new(AHashMap::new()),
            }),
        })
    }

    /// Opens an ephemeral socket for talking to one host, as an active
    /// connection does.  All inbound traffic routes to `route`.
    pub fn bind_to_host(
        remote: SocketAddr,
        route: RouteTarget,
    ) -> Result<(Self, BoundSocket), SocketError> {
        let wildcard: SocketAddr = if remote.is_ipv4() {
            "0.0.0.0:0".parse().expect("literal addr")
        } else {
            "[::]:0".parse().expect("literal addr")
        };
        let shared = Self::bind(wildcard, route)?;
        let bound = shared.add_remote(remote, route);
        Ok((shared, bound))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Registers a per-remote route and returns a view bound to it.
    pub fn add_remote(&self, remote: SocketAddr, target: RouteTarget) -> BoundSocket {
        self.inner
            .routes
            .lock()
            .expect("route table lock")
            .insert(remote, target);
        BoundSocket::Udp(UdpBoundSocket {
            shared: Arc::clone(&self.inner),
            remote,
            closed: false,
        })
    }

    /// Looks up the delivery target for a source address.
    pub fn route_for(&self, from: SocketAddr) -> RouteTarget {
        self.inner
            .routes
            .lock()
            .expect("route table lock")
            .get(&from)
            .copied()
            .unwrap_or(self.inner.default_route)
    }

    /// Sends one raw packet to an arbitrary destination.
    pub fn send_raw(&self, pkt: &[u8], to: SocketAddr) -> Result<(), SocketError> {
        self.inner.sock.send_to(pkt, to)?;
        Ok(())
    }

    /// Non-blocking receive of one packet.
    pub fn poll_recv(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>, SocketError> {
        match self.inner.sock.recv_from(buf) {
            Ok((len, from)) => Ok(Some((len, from))),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(SocketError::Io(err)),
        }
    }
}

/// Per-remote send view over a [`SharedSocket`].
#[derive(Debug)]
pub struct UdpBoundSocket {
    shared: Arc<SharedSocketInner>,
    remote: SocketAddr,
    closed: bool,
}

impl UdpBoundSocket {
    fn send_gather(&self, chunks: &[IoSlice<'_>]) -> Result<(), SocketError> {
        if self.closed {
            return Err(SocketError::Closed);
        }
        SockRef::from(&self.shared.sock).send_to_vectored(chunks, &self.remote.into())?;
        Ok(())
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.shared
                .routes
                .lock()
                .expect("route table lock")
                .remove(&self.remote);
        }
    }
}

impl Drop for UdpBoundSocket {
    fn drop(&mut self) {
        self.close();
    }
}

/// In-memory queue feeding one side of a loopback pair.
pub type LoopbackQueue = Arc<Mutex<VecDeque<Vec<u8>>>>;

/// One end of an in-process socket pair.  Sends append to the peer's inbox;
/// the context pumps each inbox into its connection, so nothing touches the
/// network.
#[derive(Debug)]
pub struct LoopbackSocket {
    inbox: LoopbackQueue,
    peer_inbox: LoopbackQueue,
    remote: SocketAddr,
    closed: bool,
}

impl LoopbackSocket {
    fn send_bytes(&self, pkt: Vec<u8>) -> Result<(), SocketError> {
        if self.closed {
            return Err(SocketError::Closed);
        }
        self.peer_inbox.lock().expect("loopback lock").push_back(pkt);
        Ok(())
    }

    /// Takes the next packet delivered to this side, if any.
    pub fn pop_inbound(&self) -> Option<Vec<u8>> {
        self.inbox.lock().expect("loopback lock").pop_front()
    }
}

/// Creates a cross-wired loopback socket pair.
pub fn loopback_pair() -> (LoopbackSocket, LoopbackSocket) {
    let inbox_a: LoopbackQueue = Arc::new(Mutex::new(VecDeque::new()));
    let inbox_b: LoopbackQueue = Arc::new(Mutex::new(VecDeque::new()));
    let addr_a: SocketAddr = "[::1]:1".parse().expect("literal addr");
    let addr_b: SocketAddr = "[::1]:2".parse().expect("literal addr");
    (
        LoopbackSocket {
            inbox: Arc::clone(&inbox_a),
            peer_inbox: Arc::clone(&inbox_b),
            remote: addr_b,
            closed: false,
        },
        LoopbackSocket {
            inbox: inbox_b,
            peer_inbox: inbox_a,
            remote: addr_a,
            closed: false,
        },
    )
}

/// A connection's transport endpoint: a real per-remote UDP view or one end
/// of a loopback pair.
#[derive(Debug)]
pub enum BoundSocket {
    Udp(UdpBoundSocket),
    Loopback(LoopbackSocket),
}

impl BoundSocket {
    /// Gather-send without copying the payload chunks together.
    pub fn send_raw_gather(&self, chunks: &[IoSlice<'_>]) -> Result<(), SocketError> {
        match self {
            BoundSocket::Udp(sock) => sock.send_gather(chunks),
            BoundSocket::Loopback(sock) => {
                let total = chunks.iter().map(|c| c.len()).sum();
                let mut pkt = Vec::with_capacity(total);
                for chunk in chunks {
                    pkt.extend_from_slice(chunk);
                }
                sock.send_bytes(pkt)
            }
        }
    }

    /// Convenience single-buffer send.
    pub fn send_raw(&self, pkt: &[u8]) -> Result<(), SocketError> {
        self.send_raw_gather(&[IoSlice::new(pkt)])
    }

    pub fn remote_addr(&self) -> SocketAddr {
        match self {
            BoundSocket::Udp(sock) => sock.remote,
            BoundSocket::Loopback(sock) => sock.remote,
        }
    }

    pub fn close(&mut self) {
        match self {
            BoundSocket::Udp(sock) => sock.close(),
            BoundSocket::Loopback(sock) => sock.closed = true,
        }
    }
}
