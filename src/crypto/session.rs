// Session key schedule and record protection context.
// Numan Thabit 2025

use hkdf::Hkdf;
use sha2::Sha256;

use super::{
    aead::{self, AeadError, AeadKey, NONCE_SALT_LEN},
    cert::CertBundle,
};

const SESSION_INFO: &[u8] = b"numilink/session";

/// Directional keys and nonce salts for one established session.
pub struct SessionKeys {
    pub send_key: AeadKey,
    pub recv_key: AeadKey,
    pub send_salt: [u8; NONCE_SALT_LEN],
    pub recv_salt: [u8; NONCE_SALT_LEN],
}

impl std::fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKeys(..)")
    }
}

impl SessionKeys {
    /// Derives the directional key material from the x25519 agreement.
    ///
    /// Both sides compute the same schedule; `server_role` selects which
    /// half is ours to send with.  The salt input orders the session nonces
    /// server-first so the two ends agree on it.
    pub fn derive(
        local: &CertBundle,
        remote_dh_public: [u8; 32],
        remote_nonce: u64,
        server_role: bool,
    ) -> Self {
        let shared = local
            .dh_secret
            .diffie_hellman(&x25519_dalek::PublicKey::from(remote_dh_public));

        let (server_nonce, client_nonce) = if server_role {
            (local.nonce, remote_nonce)
        } else {
            (remote_nonce, local.nonce)
        };
        let mut salt = [0u8; 16];
        salt[..8].copy_from_slice(&server_nonce.to_le_bytes());
        salt[8..].copy_from_slice(&client_nonce.to_le_bytes());

        let hk = Hkdf::<Sha256>::new(Some(&salt), shared.as_bytes());
        let mut okm = [0u8; 72];
        hk.expand(SESSION_INFO, &mut okm)
            .expect("72 bytes is a valid hkdf-sha256 output length");

        let mut key_s2c = [0u8; 32];
        let mut key_c2s = [0u8; 32];
        let mut salt_s2c = [0u8; NONCE_SALT_LEN];
        let mut salt_c2s = [0u8; NONCE_SALT_LEN];
        key_s2c.copy_from_slice(&okm[0..32]);
        key_c2s.copy_from_slice(&okm[32..64]);
        salt_s2c.copy_from_slice(&okm[64..68]);
        salt_c2s.copy_from_slice(&okm[68..72]);

        if server_role {
            Self {
                send_key: AeadKey::new(key_s2c),
                recv_key: AeadKey::new(key_c2s),
                send_salt: salt_s2c,
                recv_salt: salt_c2s,
            }
        } else {
            Self {
                send_key: AeadKey::new(key_c2s),
                recv_key: AeadKey::new(key_s2c),
                send_salt: salt_c2s,
                recv_salt: salt_s2c,
            }
        }
    }
}

/// Record protection for an established connection.
#[derive(Debug)]
pub struct SessionCrypto {
    keys: SessionKeys,
}

impl SessionCrypto {
    pub fn new(keys: SessionKeys) -> Self {
        Self { keys }
    }

    /// Encrypts one payload chunk under the given full packet number.
    pub fn seal_chunk(&self, packet_number: u64, plaintext: &[u8]) -> Result<Vec<u8>, AeadError> {
        let nonce = aead::packet_nonce(&self.keys.send_salt, packet_number);
        aead::seal(&self.keys.send_key, &nonce, &[], plaintext)
    }

    /// Decrypts one payload chunk under the given full packet number.
    pub fn open_chunk(&self, packet_number: u64, ciphertext: &[u8]) -> Result<Vec<u8>, AeadError> {
        let nonce = aead::packet_nonce(&self.keys.recv_salt, packet_number);
        aead::open(&self.keys.recv_key, &nonce, &[], ciphertext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paired_sessions() -> (SessionCrypto, SessionCrypto) {
        let server = CertBundle::generate(None);
        let client = CertBundle::generate(None);
        let server_pub = *x25519_dalek::PublicKey::from(&server.dh_secret).as_bytes();
        let client_pub = *x25519_dalek::PublicKey::from(&client.dh_secret).as_bytes();

        let server_keys = SessionKeys::derive(&server, client_pub, client.nonce, true);
        let client_keys = SessionKeys::derive(&client, server_pub, server.nonce, false);
        (
            SessionCrypto::new(server_keys),
            SessionCrypto::new(client_keys),
        )
    }

    #[test]
    fn both_directions_round_trip() {
        let (server, client) = paired_sessions();

        let c2s = client.seal_chunk(1, b"from client").unwrap();
        assert_eq!(server.open_chunk(1, &c2s).unwrap(), b"from client");

        let s2c = server.seal_chunk(1, b"from server").unwrap();
        assert_eq!(client.open_chunk(1, &s2c).unwrap(), b"from server");
    }

    #[test]
    fn directions_use_distinct_keys() {
        let (server, client) = paired_sessions();
        let c2s = client.seal_chunk(5, b"payload").unwrap();
        // The server's own send direction must not decrypt client traffic.
        assert!(client.open_chunk(5, &c2s).is_err());
        assert!(server.open_chunk(5, &c2s).is_ok());
    }

    #[test]
    fn packet_number_binds_ciphertext() {
        let (server, client) = paired_sessions();
        let c2s = client.seal_chunk(9, b"payload").unwrap();
        assert!(server.open_chunk(10, &c2s).is_err());
    }
}
