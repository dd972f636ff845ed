// Signed certificates and per-session crypt info.
// Numan Thabit 2025
//
// A peer's handshake carries two nested signed blobs: a certificate binding
// an identity to an ed25519 key (optionally CA-signed), and session crypt
// info (x25519 public key, nonce, protocol version) signed by that
// certificate key.  The crypt signature is always required; an unsigned
// certificate is accepted or refused by policy.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use prost::Message;
use rand::{rngs::OsRng, Rng};
use thiserror::Error;
use tracing::warn;
use x25519_dalek::StaticSecret;

use crate::{
    config::{AllowWithoutAuth, MIN_PROTOCOL_VERSION, PROTOCOL_VERSION},
    identity::{Identity, IdentityParseError},
    proto::{
        CMsgSteamDatagramCertificate, CMsgSteamDatagramCertificateSigned,
        CMsgSteamDatagramSessionCryptInfo, CMsgSteamDatagramSessionCryptInfoSigned,
    },
};

/// Policy applied to certificates without a CA signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsignedCertPolicy {
    Disallow,
    AllowWarn,
    Allow,
}

impl From<AllowWithoutAuth> for UnsignedCertPolicy {
    fn from(value: AllowWithoutAuth) -> Self {
        match value.0 {
            0 => UnsignedCertPolicy::Disallow,
            1 => UnsignedCertPolicy::AllowWarn,
            _ => UnsignedCertPolicy::Allow,
        }
    }
}

/// Handshake verification failures.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("handshake is missing the certificate")]
    MissingCert,
    #[error("handshake is missing the session crypt info")]
    MissingCryptInfo,
    #[error("certificate failed to parse: {0}")]
    BadCertEncoding(prost::DecodeError),
    #[error("crypt info failed to parse: {0}")]
    BadCryptEncoding(prost::DecodeError),
    #[error("bad identity in cert: {0}")]
    BadIdentity(#[from] IdentityParseError),
    #[error("certificate key is not a valid ed25519 key")]
    BadCertKey,
    #[error("crypt key is not a valid x25519 key")]
    BadCryptKey,
    #[error("unsigned certificates not allowed")]
    UnsignedNotAllowed,
    #[error("certificate CA signature invalid or CA not trusted")]
    BadCaSignature,
    #[error("crypt info signature invalid")]
    BadCryptSignature,
    #[error("peer protocol version {0} is too old")]
    OldProtocol(u32),
}

/// Everything learned from a peer's verified cert + crypt info.
#[derive(Debug)]
pub struct VerifiedHandshake {
    /// Identity asserted by the cert, if it carried one.
    pub identity: Option<Identity>,
    /// Peer's x25519 public key.
    pub dh_public: [u8; 32],
    /// Peer's session nonce.
    pub nonce: u64,
    /// Peer's protocol version.
    pub protocol_version: u32,
}

/// Local key material plus the serialized handshake blobs we put on the wire.
pub struct CertBundle {
    signing: SigningKey,
    pub(crate) dh_secret: StaticSecret,
    pub nonce: u64,
    pub signed_cert: CMsgSteamDatagramCertificateSigned,
    pub signed_crypt: CMsgSteamDatagramSessionCryptInfoSigned,
    /// Whether our cert asserts an identity (otherwise it travels in the
    /// connect message itself).
    pub cert_has_identity: bool,
}

impl std::fmt::Debug for CertBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertBundle")
            .field("nonce", &self.nonce)
            .field("cert_has_identity", &self.cert_has_identity)
            .finish_non_exhaustive()
    }
}

impl CertBundle {
    /// Generates an unsigned (self-asserted) bundle for `identity`.
    pub fn generate(identity: Option<&Identity>) -> Self {
        Self::generate_inner(identity, None)
    }

    /// Generates a bundle whose certificate is signed by `ca`.
    pub fn generate_ca_signed(identity: Option<&Identity>, ca: &SigningKey) -> Self {
        Self::generate_inner(identity, Some(ca))
    }

    fn generate_inner(identity: Option<&Identity>, ca: Option<&SigningKey>) -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        let dh_secret = StaticSecret::random_from_rng(OsRng);
        let nonce: u64 = rand::thread_rng().gen();

        let cert = CMsgSteamDatagramCertificate {
            key_data: Some(signing.verifying_key().to_bytes().to_vec()),
            identity_string: identity.map(|id| id.to_string()),
            time_created: None,
            time_expiry: None,
        };
        let cert_bytes = cert.encode_to_vec();
        let ca_signature = ca.map(|key| key.sign(&cert_bytes).to_bytes().to_vec());
        let signed_cert = CMsgSteamDatagramCertificateSigned {
            cert: Some(cert_bytes),
            ca_signature,
        };

        let info = CMsgSteamDatagramSessionCryptInfo {
            key_data: Some(x25519_dalek::PublicKey::from(&dh_secret).as_bytes().to_vec()),
            nonce: Some(nonce),
            protocol_version: Some(PROTOCOL_VERSION),
        };
        let info_bytes = info.encode_to_vec();
        let signature = signing.sign(&info_bytes).to_bytes().to_vec();
        let signed_crypt = CMsgSteamDatagramSessionCryptInfoSigned {
            info: Some(info_bytes),
            signature: Some(signature),
        };

        Self {
            signing,
            dh_secret,
            nonce,
            signed_cert,
            signed_crypt,
            cert_has_identity: identity.is_some(),
        }
    }

}

/// Pulls the asserted identity out of a signed cert without full
/// verification.  Used to key policy decisions before keys are needed.
pub fn extract_cert_identity(
    signed: &CMsgSteamDatagramCertificateSigned,
) -> Result<Option<Identity>, CryptoError> {
    let cert_bytes = signed.cert.as_deref().ok_or(CryptoError::MissingCert)?;
    let cert =
        CMsgSteamDatagramCertificate::decode(cert_bytes).map_err(CryptoError::BadCertEncoding)?;
    match cert.identity_string.as_deref() {
        Some(s) => Ok(Some(s.parse::<Identity>()?)),
        None => Ok(None),
    }
}

/// Verifies a peer's cert + crypt info pair.
pub fn verify_handshake(
    signed_cert: &CMsgSteamDatagramCertificateSigned,
    signed_crypt: &CMsgSteamDatagramSessionCryptInfoSigned,
    policy: UnsignedCertPolicy,
    trusted_ca: Option<&VerifyingKey>,
) -> Result<VerifiedHandshake, CryptoError> {
    let cert_bytes = signed_cert.cert.as_deref().ok_or(CryptoError::MissingCert)?;
    let cert =
        CMsgSteamDatagramCertificate::decode(cert_bytes).map_err(CryptoError::BadCertEncoding)?;

    let cert_key: [u8; 32] = cert
        .key_data
        .as_deref()
        .and_then(|k| k.try_into().ok())
        .ok_or(CryptoError::BadCertKey)?;
    let cert_key = VerifyingKey::from_bytes(&cert_key).map_err(|_| CryptoError::BadCertKey)?;

    match signed_cert.ca_signature.as_deref() {
        None | Some(&[]) => match policy {
            UnsignedCertPolicy::Disallow => return Err(CryptoError::UnsignedNotAllowed),
            UnsignedCertPolicy::AllowWarn => {
                warn!("accepting unsigned certificate");
            }
            UnsignedCertPolicy::Allow => {}
        },
        Some(sig_bytes) => {
            let ca = trusted_ca.ok_or(CryptoError::BadCaSignature)?;
            let sig =
                Signature::from_slice(sig_bytes).map_err(|_| CryptoError::BadCaSignature)?;
            ca.verify(cert_bytes, &sig)
                .map_err(|_| CryptoError::BadCaSignature)?;
        }
    }

    let identity = match cert.identity_string.as_deref() {
        Some(s) => Some(s.parse::<Identity>()?),
        None => None,
    };

    let info_bytes = signed_crypt
        .info
        .as_deref()
        .ok_or(CryptoError::MissingCryptInfo)?;
    let sig_bytes = signed_crypt
        .signature
        .as_deref()
        .ok_or(CryptoError::BadCryptSignature)?;
    let sig = Signature::from_slice(sig_bytes).map_err(|_| CryptoError::BadCryptSignature)?;
    cert_key
        .verify(info_bytes, &sig)
        .map_err(|_| CryptoError::BadCryptSignature)?;

    let info = CMsgSteamDatagramSessionCryptInfo::decode(info_bytes)
        .map_err(CryptoError::BadCryptEncoding)?;
    let dh_public: [u8; 32] = info
        .key_data
        .as_deref()
        .and_then(|k| k.try_into().ok())
        .ok_or(CryptoError::BadCryptKey)?;
    let protocol_version = info.protocol_version.unwrap_or(0);
    if protocol_version < MIN_PROTOCOL_VERSION {
        return Err(CryptoError::OldProtocol(protocol_version));
    }

    Ok(VerifiedHandshake {
        identity,
        dh_public,
        nonce: info.nonce.unwrap_or(0),
        protocol_version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsigned_bundle_verifies_when_allowed() {
        let id = Identity::User(42);
        let bundle = CertBundle::generate(Some(&id));
        let verified = verify_handshake(
            &bundle.signed_cert,
            &bundle.signed_crypt,
            UnsignedCertPolicy::Allow,
            None,
        )
        .expect("verify");
        assert_eq!(verified.identity, Some(id));
        assert_eq!(verified.nonce, bundle.nonce);
        assert_eq!(verified.protocol_version, PROTOCOL_VERSION);
    }

    #[test]
    fn unsigned_bundle_refused_when_disallowed() {
        let bundle = CertBundle::generate(None);
        let err = verify_handshake(
            &bundle.signed_cert,
            &bundle.signed_crypt,
            UnsignedCertPolicy::Disallow,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, CryptoError::UnsignedNotAllowed));
    }

    #[test]
    fn ca_signed_bundle_requires_matching_ca() {
        let ca = SigningKey::generate(&mut OsRng);
        let other_ca = SigningKey::generate(&mut OsRng);
        let bundle = CertBundle::generate_ca_signed(Some(&Identity::User(7)), &ca);

        verify_handshake(
            &bundle.signed_cert,
            &bundle.signed_crypt,
            UnsignedCertPolicy::Disallow,
            Some(&ca.verifying_key()),
        )
        .expect("trusted CA verifies");

        let err = verify_handshake(
            &bundle.signed_cert,
            &bundle.signed_crypt,
            UnsignedCertPolicy::Disallow,
            Some(&other_ca.verifying_key()),
        )
        .unwrap_err();
        assert!(matches!(err, CryptoError::BadCaSignature));
    }

    #[test]
    fn tampered_crypt_signature_fails() {
        let bundle = CertBundle::generate(None);
        let mut crypt = bundle.signed_crypt.clone();
        let mut sig = crypt.signature.take().unwrap();
        sig[0] ^= 0xff;
        crypt.signature = Some(sig);
        let err = verify_handshake(
            &bundle.signed_cert,
            &crypt,
            UnsignedCertPolicy::Allow,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, CryptoError::BadCryptSignature));
    }

    #[test]
    fn crypt_signed_by_foreign_key_fails() {
        // Swapping in another bundle's crypt info must break the binding
        // between cert and session keys.
        let a = CertBundle::generate(None);
        let b = CertBundle::generate(None);
        let err = verify_handshake(
            &a.signed_cert,
            &b.signed_crypt,
            UnsignedCertPolicy::Allow,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, CryptoError::BadCryptSignature));
    }

    #[test]
    fn extracts_identity_without_verification() {
        let id = Identity::Generic("server-3".into());
        let bundle = CertBundle::generate(Some(&id));
        assert_eq!(
            extract_cert_identity(&bundle.signed_cert).unwrap(),
            Some(id)
        );
        let anon = CertBundle::generate(None);
        assert_eq!(extract_cert_identity(&anon.signed_cert).unwrap(), None);
    }

    #[test]
    fn old_protocol_rejected() {
        let bundle = CertBundle::generate(None);
        let mut info = CMsgSteamDatagramSessionCryptInfo::decode(
            bundle.signed_crypt.info.as_deref().unwrap(),
        )
        .unwrap();
        info.protocol_version = Some(MIN_PROTOCOL_VERSION - 1);
        let info_bytes = info.encode_to_vec();
        let signature = bundle.signing.sign(&info_bytes).to_bytes().to_vec();
        let crypt = CMsgSteamDatagramSessionCryptInfoSigned {
            info: Some(info_bytes),
            signature: Some(signature),
        };
        let err = verify_handshake(
            &bundle.signed_cert,
            &crypt,
            UnsignedCertPolicy::Allow,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, CryptoError::OldProtocol(_)));
    }
}
