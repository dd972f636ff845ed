// challenge.rs - stateless SYN-cookie challenges
// Numan Thabit 2025

use std::hash::Hasher;
use std::net::{IpAddr, SocketAddr};

use rand::RngCore;
use siphasher::sip::SipHasher;
use thiserror::Error;

use crate::clock::{Timestamp, MILLION};

/// Coarse time tick used inside challenges: microseconds shifted down to a
/// roughly 1.05-second granularity, truncated to 16 bits.
pub const fn challenge_time(usec: Timestamp) -> u16 {
    (usec >> 20) as u16
}

/// Challenges older than this many ticks are rejected.
const MAX_CHALLENGE_AGE_TICKS: u16 = challenge_time(4 * MILLION);

/// Why a presented challenge was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChallengeError {
    /// The embedded time tick is outside the acceptance window.
    #[error("challenge too old")]
    Stale,
    /// The cookie does not match what we would have issued.
    #[error("incorrect challenge")]
    Mismatch,
}

/// Stateless cookie mint bound to one listener.
///
/// A cookie commits to the remote address, the remote port, and a coarse
/// time tick, keyed by a secret generated at bind time.  Verification
/// recomputes the cookie, so the listener stores nothing per peer and a
/// spoofed source can never complete the handshake.
#[derive(Debug)]
pub struct ChallengeIssuer {
    secret: [u8; 16],
}

impl ChallengeIssuer {
    /// Creates an issuer with a fresh random secret.
    pub fn new() -> Self {
        let mut secret = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut secret);
        Self { secret }
    }

    /// Creates an issuer with a fixed secret, for tests.
    #[cfg(test)]
    pub fn with_secret(secret: [u8; 16]) -> Self {
        Self { secret }
    }

    /// Mints the cookie for `addr` at time tick `n_time`.
    ///
    /// The low 16 bits of the result carry the tick so verification can
    /// recover it; the upper 48 bits are the keyed hash.
    pub fn generate(&self, n_time: u16, addr: SocketAddr) -> u64 {
        let mut data = [0u8; 20];
        data[0..2].copy_from_slice(&n_time.to_le_bytes());
        data[2..4].copy_from_slice(&addr.port().to_le_bytes());
        data[4..20].copy_from_slice(&ipv6_bytes(addr.ip()));

        let mut hasher = SipHasher::new_with_key(&self.secret);
        hasher.write(&data);
        let cookie = hasher.finish();
        (cookie & 0xffff_ffff_ffff_0000) | u64::from(n_time)
    }

    /// Verifies a cookie presented by `addr` at current time `now`.
    pub fn verify(
        &self,
        challenge: u64,
        addr: SocketAddr,
        now: Timestamp,
    ) -> Result<(), ChallengeError> {
        let n_time_then = challenge as u16;
        let elapsed = challenge_time(now).wrapping_sub(n_time_then);
        if elapsed > MAX_CHALLENGE_AGE_TICKS {
            return Err(ChallengeError::Stale);
        }
        if self.generate(n_time_then, addr) != challenge {
            return Err(ChallengeError::Mismatch);
        }
        Ok(())
    }
}

impl Default for ChallengeIssuer {
    fn default() -> Self {
        Self::new()
    }
}

/// Canonical 16-byte form of an address, IPv4-mapped when needed.
fn ipv6_bytes(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MILLION;
    use proptest::prelude::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn cookie_embeds_tick() {
        let issuer = ChallengeIssuer::with_secret([7; 16]);
        let cookie = issuer.generate(0x1234, addr("[::1]:5555"));
        assert_eq!(cookie as u16, 0x1234);
    }

    #[test]
    fn fresh_cookie_verifies() {
        let issuer = ChallengeIssuer::with_secret([1; 16]);
        let now = 100 * MILLION;
        let cookie = issuer.generate(challenge_time(now), addr("10.0.0.1:27015"));
        assert_eq!(issuer.verify(cookie, addr("10.0.0.1:27015"), now), Ok(()));
    }

    #[test]
    fn cookie_bound_to_address_and_port() {
        let issuer = ChallengeIssuer::with_secret([1; 16]);
        let now = 100 * MILLION;
        let cookie = issuer.generate(challenge_time(now), addr("10.0.0.1:27015"));
        assert_eq!(
            issuer.verify(cookie, addr("10.0.0.2:27015"), now),
            Err(ChallengeError::Mismatch)
        );
        assert_eq!(
            issuer.verify(cookie, addr("10.0.0.1:27016"), now),
            Err(ChallengeError::Mismatch)
        );
    }

    #[test]
    fn cookie_bound_to_secret() {
        let a = ChallengeIssuer::with_secret([1; 16]);
        let b = ChallengeIssuer::with_secret([2; 16]);
        let now = 100 * MILLION;
        let cookie = a.generate(challenge_time(now), addr("[::1]:1"));
        assert_eq!(
            b.verify(cookie, addr("[::1]:1"), now),
            Err(ChallengeError::Mismatch)
        );
    }

    #[test]
    fn stale_after_five_seconds() {
        let issuer = ChallengeIssuer::with_secret([3; 16]);
        let issued = 100 * MILLION;
        let cookie = issuer.generate(challenge_time(issued), addr("[::1]:1"));
        assert_eq!(
            issuer.verify(cookie, addr("[::1]:1"), issued + 5 * MILLION),
            Err(ChallengeError::Stale)
        );
    }

    #[test]
    fn age_window_is_strict_in_ticks() {
        let issuer = ChallengeIssuer::with_secret([4; 16]);
        let issued = 100 * MILLION;
        let tick = challenge_time(issued);
        let cookie = issuer.generate(tick, addr("[::1]:1"));

        // Rejection is on tick distance, strictly greater than the 4-second
        // equivalent: 3 ticks still passes, 4 ticks fails.
        let now_ok = ((u64::from(tick) + 3) << 20) + 1;
        assert_eq!(issuer.verify(cookie, addr("[::1]:1"), now_ok), Ok(()));
        let now_stale = (u64::from(tick) + 4) << 20;
        assert_eq!(
            issuer.verify(cookie, addr("[::1]:1"), now_stale),
            Err(ChallengeError::Stale)
        );
    }

    proptest! {
        #[test]
        fn verify_round_trip(secret in prop::array::uniform16(any::<u8>()),
                             now in 1u64..u64::MAX / 2,
                             ip in prop::array::uniform16(any::<u8>()),
                             port in 1u16..u16::MAX) {
            let issuer = ChallengeIssuer::with_secret(secret);
            let sock = SocketAddr::new(IpAddr::from(ip), port);
            let cookie = issuer.generate(challenge_time(now), sock);
            prop_assert_eq!(issuer.verify(cookie, sock, now), Ok(()));
        }
    }
}
