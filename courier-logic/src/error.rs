use serde::{Deserialize, Serialize};

use crate::order::RoleField;

/// Problems shown to the user while tracking, none of these end the session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum TrackingError {
    /// The user refused location access, terminal for this session
    #[error(
        "Location permission denied. Please allow location access to enable live tracking."
    )]
    PermissionDenied,
    /// The platform can't provide geolocation at all
    #[error("Geolocation is not supported on this device.")]
    Unsupported,
    #[error("Location error: timed out waiting for a position")]
    Timeout,
    #[error("Location error: {0}")]
    PositionUnavailable(String),
    /// Never surfaced by the relay itself, writes are tolerated
    #[error("Failed to publish location: {0}")]
    RemoteWriteFailed(String),
    #[error("Live tracking stalled: {0}")]
    RemoteReadFailed(String),
}

impl TrackingError {
    /// Whether a later successful fix makes this error stale
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::PositionUnavailable(_))
    }
}

/// Errors returned by a [crate::LocationStore]
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The order record doesn't exist (yet)
    #[error("Order not found")]
    NotFound,
    #[error("Store rejected request: {0}")]
    Rejected(String),
    #[error("Connection to store failed: {0}")]
    Connection(String),
    #[error("Could not decode order record: {0}")]
    Decode(String),
}

/// Misuse of the relay API
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    #[error("Self and partner fields must differ (both were {0})")]
    SameField(RoleField),
}
