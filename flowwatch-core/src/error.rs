//! Error taxonomy for capability lifecycle, decoding and configuration.

use std::io;

use thiserror::Error;

/// A capability identifier could not be resolved to an implementation.
#[derive(Debug, Error)]
pub enum LoadError {
    /// No loader is registered under this reference.
    #[error("no loader registered for reference `{0}`")]
    UnknownLoader(String),

    /// The capability is not present in the registry table.
    #[error("unknown capability `{0}`")]
    UnknownCapability(String),
}

/// The collector could not acquire its network endpoint.
#[derive(Debug, Error)]
#[error("failed to bind {addr}: {source}")]
pub struct BindError {
    pub addr: String,
    #[source]
    pub source: io::Error,
}

impl BindError {
    pub fn new(addr: impl Into<String>, source: io::Error) -> Self {
        Self {
            addr: addr.into(),
            source,
        }
    }

    /// Underlying I/O error kind (e.g. `AddrInUse`, `PermissionDenied`).
    pub fn kind(&self) -> io::ErrorKind {
        self.source.kind()
    }
}

/// A single datagram could not be decoded. Always recovered locally.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("truncated {context}: need {needed} bytes, have {available}")]
    Truncated {
        context: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("unsupported {protocol} version {version}")]
    UnsupportedVersion { protocol: &'static str, version: u32 },

    #[error("malformed datagram: {0}")]
    Malformed(String),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// A threshold mapping was rejected before any state changed.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum InvalidThreshold {
    #[error("unknown metric `{0}`")]
    UnknownMetric(String),

    #[error("threshold for {metric} is not a finite number")]
    NotFinite { metric: String },

    #[error("threshold for {metric} is negative ({value})")]
    Negative { metric: String, value: f64 },
}

/// A monitor or baseline setting was rejected before any state changed.
#[derive(Debug, Error, Clone, PartialEq)]
#[error("invalid {name}: {reason}")]
pub struct InvalidSetting {
    pub name: &'static str,
    pub reason: String,
}

impl InvalidSetting {
    pub fn new(name: &'static str, reason: impl Into<String>) -> Self {
        Self {
            name,
            reason: reason.into(),
        }
    }
}

/// Errors surfaced by registry lifecycle operations.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Bind(#[from] BindError),

    #[error("unknown capability `{0}`")]
    UnknownCapability(String),

    #[error("capability `{0}` is already configured")]
    Duplicate(String),

    #[error("capability `{0}` is not loaded")]
    NotLoaded(String),

    #[error("capability `{0}` is not running")]
    NotRunning(String),

    #[error("capability `{0}` is running; stop it first")]
    StillRunning(String),
}

/// Configuration values that could not be interpreted.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid duration `{0}`")]
    InvalidDuration(String),

    #[error(transparent)]
    Threshold(#[from] InvalidThreshold),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_error_exposes_kind() {
        let err = BindError::new(
            "0.0.0.0:2055",
            io::Error::new(io::ErrorKind::AddrInUse, "address in use"),
        );

        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
        assert!(err.to_string().contains("0.0.0.0:2055"));
    }

    #[test]
    fn registry_error_is_transparent_over_bind() {
        let err: RegistryError = BindError::new(
            "127.0.0.1:1",
            io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        )
        .into();

        assert_eq!(err.to_string(), "failed to bind 127.0.0.1:1: denied");
    }

    #[test]
    fn truncated_message_names_context() {
        let err = DecodeError::Truncated {
            context: "netflow v5 header",
            needed: 24,
            available: 10,
        };
        assert_eq!(
            err.to_string(),
            "truncated netflow v5 header: need 24 bytes, have 10"
        );
    }
}
