// Generated wire protobuf types.
// Numan Thabit 2025

// The schema message names (CMsgSteamSockets_UDP_*) are a compatibility
// contract; prost camel-cases them into the Rust type names below.
#[allow(clippy::all, missing_docs)]
mod generated {
    include!(concat!(env!("OUT_DIR"), "/steamsockets.udp.rs"));
}

pub use generated::{
    CMsgSteamDatagramCertificate, CMsgSteamDatagramCertificateSigned,
    CMsgSteamDatagramLinkInstantaneousStats, CMsgSteamDatagramLinkLifetimeStats,
    CMsgSteamDatagramLinkStats, CMsgSteamDatagramSessionCryptInfo,
    CMsgSteamDatagramSessionCryptInfoSigned, CMsgSteamSocketsUdpChallengeReply,
    CMsgSteamSocketsUdpChallengeRequest, CMsgSteamSocketsUdpConnectOk,
    CMsgSteamSocketsUdpConnectRequest, CMsgSteamSocketsUdpConnectionClosed,
    CMsgSteamSocketsUdpNoConnection, CMsgSteamSocketsUdpStats,
};
