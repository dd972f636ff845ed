// Configuration schema for the numilink transport.
// Numan Thabit 2025

use std::{env, fmt, fs, io, path::PathBuf, time::Duration};

use serde::Deserialize;
use thiserror::Error;

use crate::clock::{Timestamp, MILLION};

/// Minimum wire size of padded control messages.
pub const MIN_PADDED_PACKET_SIZE: usize = 512;

/// Inbound packets shorter than this are discarded without inspection.
pub const MIN_PACKET_SIZE: usize = 5;

/// Largest packet we will put on the wire.
pub const MAX_PACKET_SIZE: usize = 1300;

/// Capacity of the recent-local-connection-id ring.
pub const MAX_RECENT_LOCAL_CIDS: usize = 256;

/// Protocol version we speak.
pub const PROTOCOL_VERSION: u32 = 8;

/// Oldest protocol version we will talk to.
pub const MIN_PROTOCOL_VERSION: u32 = 5;

/// Why a configuration could not be produced.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The named config file could not be read.
    #[error("cannot read {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The file contents were not the TOML this crate expects.
    #[error("malformed transport config: {0}")]
    Malformed(#[from] toml::de::Error),
    /// A field value is outside the range the transport can run with.
    #[error("unusable config value: {0}")]
    Unusable(String),
}

/// Policy for peers presenting no authenticated identity.
///
/// 0 refuses them, 1 allows with a warning, 2 and above allows silently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct AllowWithoutAuth(pub u32);

impl AllowWithoutAuth {
    pub fn refused(self) -> bool {
        self.0 == 0
    }

    pub fn warn(self) -> bool {
        self.0 == 1
    }
}

impl fmt::Display for AllowWithoutAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transport configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Whether unauthenticated (localhost-identity) peers are accepted.
    pub ip_allow_without_auth: AllowWithoutAuth,
    /// Require an explicit IP identity to match the packet source address.
    /// Off by default: a NATed peer legitimately fails this check.
    pub require_identity_address_match: bool,
    /// Handshake retransmit cadence, microseconds.
    pub connect_retry_interval: Timestamp,
    /// Give up on a connection after this long without inbound progress.
    pub connection_timeout: Timestamp,
    /// Largest packet placed on the wire.
    pub mtu: usize,
    /// Trusted CA public key (hex ed25519) for validating signed certs.
    pub trusted_ca_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ip_allow_without_auth: AllowWithoutAuth(1),
            require_identity_address_match: false,
            connect_retry_interval: 250_000,
            connection_timeout: 10 * MILLION,
            mtu: MAX_PACKET_SIZE,
            trusted_ca_key: None,
        }
    }
}

impl Config {
    /// Builds the runtime configuration.
    ///
    /// When `NUMILINK_CONFIG` names a file, that file wins; otherwise the
    /// built-in defaults apply.  The result is validated either way, so a
    /// bad environment surfaces at startup rather than mid-handshake.
    pub fn load() -> Result<Self, ConfigError> {
        let Some(path) = env::var_os("NUMILINK_CONFIG") else {
            let defaults = Self::default();
            defaults.validate()?;
            return Ok(defaults);
        };
        Self::from_path(PathBuf::from(path))
    }

    /// Reads and validates a config file.
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        match fs::read_to_string(&path) {
            Ok(text) => Self::from_toml_str(&text),
            Err(source) => Err(ConfigError::Unreadable { path, source }),
        }
    }

    /// Parses and validates TOML config text.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let cfg: Self = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Handshake retransmit cadence as a [`Duration`].
    pub fn connect_retry(&self) -> Duration {
        Duration::from_micros(self.connect_retry_interval)
    }

    /// Checks every field against the ranges the transport can operate in.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(200_000..=MILLION).contains(&self.connect_retry_interval) {
            return Err(ConfigError::Unusable(format!(
                "connect_retry_interval {}us outside [200ms, 1s]",
                self.connect_retry_interval
            )));
        }
        if self.connection_timeout < self.connect_retry_interval {
            return Err(ConfigError::Unusable(
                "connection_timeout shorter than connect_retry_interval".into(),
            ));
        }
        if self.mtu < MIN_PADDED_PACKET_SIZE || self.mtu > MAX_PACKET_SIZE {
            return Err(ConfigError::Unusable(format!(
                "mtu {} outside [{MIN_PADDED_PACKET_SIZE}, {MAX_PACKET_SIZE}]",
                self.mtu
            )));
        }
        if let Some(key) = &self.trusted_ca_key {
            if key.len() != 64 || !key.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(ConfigError::Unusable(
                    "trusted_ca_key must be 64 hex characters".into(),
                ));
            }
        }
        Ok(())
    }

    /// Decoded trusted CA key bytes, if configured.
    pub fn trusted_ca_key_bytes(&self) -> Option<[u8; 32]> {
        let key = self.trusted_ca_key.as_ref()?;
        let mut out = [0u8; 32];
        for (i, chunk) in key.as_bytes().chunks(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16)?;
            let lo = (chunk[1] as char).to_digit(16)?;
            out[i] = ((hi << 4) | lo) as u8;
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().expect("defaults valid");
    }

    #[test]
    fn parses_toml() {
        let cfg = Config::from_toml_str(
            r#"
            ip_allow_without_auth = 0
            require_identity_address_match = true
            connect_retry_interval = 400000
            "#,
        )
        .expect("parse");
        assert!(cfg.ip_allow_without_auth.refused());
        assert!(cfg.require_identity_address_match);
        assert_eq!(cfg.connect_retry_interval, 400_000);
        assert_eq!(cfg.mtu, MAX_PACKET_SIZE);
    }

    #[test]
    fn rejects_out_of_range_retry() {
        let err = Config::from_toml_str("connect_retry_interval = 100").unwrap_err();
        assert!(matches!(err, ConfigError::Unusable(_)));
    }

    #[test]
    fn rejects_bad_ca_key() {
        let err = Config::from_toml_str(r#"trusted_ca_key = "zz""#).unwrap_err();
        assert!(matches!(err, ConfigError::Unusable(_)));
    }

    #[test]
    fn non_toml_input_is_malformed() {
        let err = Config::from_toml_str("this is not toml =").unwrap_err();
        assert!(matches!(err, ConfigError::Malformed(_)));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = Config::from_path("/definitely/not/here.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Unreadable { .. }));
        assert!(err.to_string().contains("/definitely/not/here.toml"));
    }

    #[test]
    fn decodes_ca_key() {
        let cfg = Config::from_toml_str(&format!("trusted_ca_key = \"{}\"", "ab".repeat(32)))
            .expect("parse");
        assert_eq!(cfg.trusted_ca_key_bytes(), Some([0xab; 32]));
    }
}
