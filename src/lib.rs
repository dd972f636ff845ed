// Numilink direct-UDP session layer public surface.
// Numan Thabit 2025

pub mod config;

pub mod clock;

pub mod identity;

pub mod challenge;

pub mod wire;

pub mod proto;

pub mod seqnum;

pub mod crypto;

pub mod stats;

pub mod socket;

pub mod listener;

pub mod connection;

pub mod context;

pub mod api;

pub mod service;

pub mod metrics;

pub use config::{AllowWithoutAuth, Config, ConfigError, MAX_PACKET_SIZE, MIN_PADDED_PACKET_SIZE};

pub use identity::{Identity, IdentityParseError, RemoteKey};

pub use challenge::{challenge_time, ChallengeError, ChallengeIssuer};

pub use connection::{
    reasons, ConnectionError, ConnectionHandle, ConnectionState,
};

pub use context::{ContextError, Event, RateLimiter, SocketsContext};

pub use api::{ListenerHandle, Sockets};

pub use service::ServiceThread;

pub use listener::{Listener, ListenerError};

pub use seqnum::{expand_wire_seq, RecvSequencer, SequenceError};

pub use stats::{EndpointStats, StatsReplyRequest};

pub use metrics::{Metrics, MetricsError};
