//! Error types for devshare

use thiserror::Error;

use crate::device::DeviceType;

/// Main error type for devshare
#[derive(Error, Debug)]
pub enum DevshareError {
    /// GPU ask uses an invalid or inconsistent combination of resource names
    #[error("Invalid GPU combination: {0}")]
    InvalidGpuCombination(String),

    /// Device ask is negative, fractional or otherwise malformed
    #[error("Invalid device quantity: {0}")]
    InvalidDeviceQuantity(String),

    /// Quantity string could not be parsed
    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    /// Node has no device inventory record
    #[error("node(s) missing Device: {0}")]
    MissingDevice(String),

    /// Node cannot satisfy the normalized request
    #[error("Insufficient Devices: node {node} cannot satisfy {device_type} request")]
    InsufficientDevices {
        node: String,
        device_type: DeviceType,
    },

    /// Persistence write lost an optimistic-concurrency race
    #[error("Conflict on commit: {0}")]
    ConflictOnCommit(String),

    /// Persistence collaborator failed for a non-conflict reason
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// Inventory or allocator invariant violation
    #[error("Internal error: {0}")]
    Internal(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DevshareError {
    /// Whether the persistence write may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, DevshareError::ConflictOnCommit(_))
    }

    /// Whether the error only excludes one candidate node
    pub fn is_node_local(&self) -> bool {
        matches!(
            self,
            DevshareError::MissingDevice(_) | DevshareError::InsufficientDevices { .. }
        )
    }

    /// Whether the request itself is malformed
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            DevshareError::InvalidGpuCombination(_)
                | DevshareError::InvalidDeviceQuantity(_)
                | DevshareError::InvalidQuantity(_)
        )
    }
}

/// Result type for devshare operations
pub type DevshareResult<T> = Result<T, DevshareError>;

impl From<serde_json::Error> for DevshareError {
    fn from(err: serde_json::Error) -> Self {
        DevshareError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for DevshareError {
    fn from(err: toml::de::Error) -> Self {
        DevshareError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DevshareError::InsufficientDevices {
            node: "node-1".to_string(),
            device_type: DeviceType::Rdma,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient Devices: node node-1 cannot satisfy rdma request"
        );
        assert_eq!(
            DevshareError::MissingDevice("node-2".to_string()).to_string(),
            "node(s) missing Device: node-2"
        );
    }

    #[test]
    fn test_error_classification() {
        assert!(DevshareError::ConflictOnCommit("stale".into()).is_retryable());
        assert!(!DevshareError::Persistence("gone".into()).is_retryable());

        assert!(DevshareError::MissingDevice("n".into()).is_node_local());
        assert!(!DevshareError::InvalidGpuCombination("x".into()).is_node_local());

        assert!(DevshareError::InvalidDeviceQuantity("x".into()).is_validation());
        assert!(!DevshareError::Internal("x".into()).is_validation());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: DevshareError = io_err.into();
        assert!(matches!(err, DevshareError::Io(_)));
    }
}
