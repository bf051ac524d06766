//! Error types for the SAN topology manager
//!
//! Every failure is classified as one of three kinds: configuration problems
//! (bad or incomplete topology file), capability problems (the owning device
//! cannot perform the requested action) and transient hardware problems
//! (a driver call failed on real equipment).

use thiserror::Error;

/// Unified error type for the SAN topology manager
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    #[error("Could not read SAN config {path}: {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed SAN config at line {line}: {reason}")]
    ConfigParse { line: usize, reason: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid {kind} address '{value}' on [{section}] {key}")]
    InvalidAddress {
        section: String,
        key: String,
        kind: String,
        value: String,
    },

    #[error("Address {address} is specified more than once on [{section}] ({key})")]
    DuplicateAddress {
        section: String,
        key: String,
        address: String,
    },

    #[error("Device [{section}] is missing mandatory field '{field}'")]
    MissingField { section: String, field: String },

    #[error("Device [{section}] has model '{model}' which is not in vendor-model format")]
    InvalidModel { section: String, model: String },

    #[error("Alias '{alias}' has no value")]
    UnresolvedAlias { alias: String },

    #[error("SAN config was not loaded")]
    NotLoaded,

    // =========================================================================
    // Capability Errors
    // =========================================================================
    #[error("{device} does not support {capability} (advertised: {advertised})")]
    CapabilityUnsupported {
        capability: String,
        device: String,
        advertised: String,
    },

    #[error("No configured {category} controls address {address}")]
    NoOwner { category: String, address: String },

    #[error("No storage array is configured for this host")]
    NoArray,

    #[error("More than one storage array is configured: {names:?}")]
    AmbiguousArray { names: Vec<String> },

    #[error("Port {port} has status {status}, expected Active")]
    PortNotActive { port: String, status: String },

    // =========================================================================
    // Driver / Hardware Errors
    // =========================================================================
    #[error("Driver operation failed: {device} - {operation}: {reason}")]
    Driver {
        device: String,
        operation: String,
        reason: String,
    },

    #[error("LUN {lun} was left on {device}: map failed ({map_error}), removal failed ({remove_error})")]
    OrphanedLun {
        device: String,
        lun: String,
        map_error: String,
        remove_error: String,
    },

    #[error("Device {device} is configured but not controllable: {reason}")]
    DriverUnavailable { device: String, reason: String },

    #[error("Unsupported device: no driver registered for {key}")]
    UnsupportedDevice { key: String },

    #[error("Host operation failed: {0}")]
    Host(String),

    #[error("Timeout waiting for {what} after {seconds}s")]
    Timeout { what: String, seconds: u64 },

    // =========================================================================
    // Argument / Parse Errors
    // =========================================================================
    #[error("Size parse error: {0}")]
    SizeParse(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The three families of failure the manager distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad, ambiguous or incomplete topology configuration
    Configuration,
    /// The resolved device cannot perform the requested operation
    Capability,
    /// A device or host call failed and may succeed when repeated
    Transient,
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::ConfigRead { .. }
            | Error::ConfigParse { .. }
            | Error::Configuration(_)
            | Error::InvalidAddress { .. }
            | Error::DuplicateAddress { .. }
            | Error::MissingField { .. }
            | Error::InvalidModel { .. }
            | Error::UnresolvedAlias { .. }
            | Error::NotLoaded
            | Error::SizeParse(_)
            | Error::InvalidArgument(_)
            | Error::Json(_) => ErrorKind::Configuration,

            Error::CapabilityUnsupported { .. }
            | Error::NoOwner { .. }
            | Error::NoArray
            | Error::AmbiguousArray { .. }
            | Error::PortNotActive { .. }
            | Error::UnsupportedDevice { .. } => ErrorKind::Capability,

            Error::Driver { .. }
            | Error::OrphanedLun { .. }
            | Error::DriverUnavailable { .. }
            | Error::Host(_)
            | Error::Timeout { .. }
            | Error::Io(_) => ErrorKind::Transient,
        }
    }

    /// Check if repeating the failed call could succeed
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    /// Shorthand for a failed driver call
    pub fn driver(
        device: impl Into<String>,
        operation: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::Driver {
            device: device.into(),
            operation: operation.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for the SAN topology manager
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let err = Error::MissingField {
            section: "sw1".into(),
            field: "ctrl_ip".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let err = Error::CapabilityUnsupported {
            capability: "link_up".into(),
            device: "sw1".into(),
            advertised: "link_down".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Capability);

        let err = Error::driver("array1", "lun_remove", "LUN busy");
        assert_eq!(err.kind(), ErrorKind::Transient);

        let err = Error::OrphanedLun {
            device: "array1".into(),
            lun: "/vol/vol0/lun1".into(),
            map_error: "map refused".into(),
            remove_error: "LUN busy".into(),
        };
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.to_string().contains("/vol/vol0/lun1"));
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::driver("array1", "lun_remove", "LUN busy");
        assert!(transient.is_retryable());

        let config_err = Error::Configuration("invalid".into());
        assert!(!config_err.is_retryable());

        let unsupported = Error::UnsupportedDevice {
            key: "array.acme.x1".into(),
        };
        assert!(!unsupported.is_retryable());
    }

    #[test]
    fn test_error_messages_name_the_offender() {
        let err = Error::DuplicateAddress {
            section: "sw1".into(),
            key: "wwpn-p2".into(),
            address: "10:00:00:00:c9:95:2f:de".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("sw1"));
        assert!(msg.contains("wwpn-p2"));
    }
}
