// Cryptographic plumbing: record protection and the cert/crypt handshake.
// Numan Thabit 2025

pub mod aead;
pub mod cert;
pub mod session;

pub use aead::{open, seal, AeadError, AeadKey, TAG_LEN};
pub use cert::{CertBundle, CryptoError, UnsignedCertPolicy, VerifiedHandshake};
pub use session::{SessionCrypto, SessionKeys};
