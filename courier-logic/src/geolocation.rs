use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{error::TrackingError, location::Position, prelude::*};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// The platform's geolocation permission as seen by this session
pub enum PermissionState {
    #[default]
    Prompt,
    Granted,
    Denied,
}

impl PermissionState {
    /// State after a successful fix, denial is sticky for the session
    pub fn after_fix(self) -> Self {
        match self {
            Self::Denied => Self::Denied,
            _ => Self::Granted,
        }
    }

    /// State after the provider reports an error
    pub fn after_error(self, err: &GeolocationError) -> Self {
        match err {
            GeolocationError::PermissionDenied => Self::Denied,
            _ => self,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchOptions {
    pub high_accuracy: bool,
    /// Oldest cached fix the provider may hand back
    pub max_age: Duration,
    /// How long the provider may wait for a fix before reporting [GeolocationError::Timeout]
    pub timeout: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            high_accuracy: true,
            max_age: Duration::from_millis(3000),
            timeout: Duration::from_millis(10000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GeolocationError {
    PermissionDenied,
    Timeout,
    Unavailable(String),
}

impl From<GeolocationError> for TrackingError {
    fn from(err: GeolocationError) -> Self {
        match err {
            GeolocationError::PermissionDenied => TrackingError::PermissionDenied,
            GeolocationError::Timeout => TrackingError::Timeout,
            GeolocationError::Unavailable(why) => TrackingError::PositionUnavailable(why),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GeolocationEvent {
    Position(Position),
    Error(GeolocationError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Handle for an active watch, pass back to [GeolocationProvider::clear_watch]
pub struct WatchId(pub u64);

/// Source of the device's position.
///
/// A watch keeps delivering events into the given channel until it's cleared, so every
/// successful [GeolocationProvider::watch_position] must be paired with a
/// [GeolocationProvider::clear_watch].
pub trait GeolocationProvider: Send + Sync {
    /// Whether this platform can provide positions at all
    fn is_supported(&self) -> bool {
        true
    }
    /// Begin continuous sampling
    fn watch_position(
        &self,
        options: WatchOptions,
        events: mpsc::Sender<GeolocationEvent>,
    ) -> Result<WatchId>;
    /// Stop a watch, unknown ids are ignored
    fn clear_watch(&self, id: WatchId);
}
