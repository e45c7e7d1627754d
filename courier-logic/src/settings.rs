use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{eta::DistanceMethod, geolocation::WatchOptions};

#[derive(Debug, Clone, Serialize, Deserialize)]
/// Settings for a [crate::LocationRelay]
pub struct RelaySettings {
    /// Options handed to the geolocation provider when watching
    pub watch: WatchOptions,
    /// Minimum time between two writes of our position, fixes in between only update the
    /// local view
    pub publish_interval: Duration,
    /// Assumed average travel speed used for the ETA, in km/h
    pub speed_kmh: f64,
    pub distance_method: DistanceMethod,
    /// Extra attempts for a failed position write. 0 leaves it to the next fix.
    pub write_retries: u32,
    /// Pause between write attempts
    pub write_retry_delay: Duration,
    /// Buffer size of the provider and snapshot channels
    pub channel_capacity: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            watch: WatchOptions::default(),
            publish_interval: Duration::from_secs(1),
            speed_kmh: 24.0,
            distance_method: DistanceMethod::Equirectangular,
            write_retries: 0,
            write_retry_delay: Duration::from_millis(500),
            channel_capacity: 16,
        }
    }
}
