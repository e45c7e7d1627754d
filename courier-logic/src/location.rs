use serde::{Deserialize, Serialize};

use crate::UtcDT;

/// A "part" of a location
pub type LocationComponent = f64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
/// A single fix from a geolocation provider
pub struct Position {
    /// Latitude in degrees
    pub lat: LocationComponent,
    /// Longitude in degrees
    pub lng: LocationComponent,
    /// Radius of uncertainty in metres
    pub accuracy: LocationComponent,
    /// When the provider captured this fix
    pub captured_at: UtcDT,
}

impl Position {
    pub fn new(lat: LocationComponent, lng: LocationComponent, accuracy: LocationComponent) -> Self {
        Self {
            lat,
            lng,
            accuracy,
            captured_at: chrono::Utc::now(),
        }
    }

    /// Whether both coordinates are usable numbers
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite() && self.lng.is_finite()
    }

    pub fn as_write(&self) -> LocationWrite {
        LocationWrite {
            lat: self.lat,
            lng: self.lng,
            accuracy: self.accuracy,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
/// Payload sent to the store for our own role field, the store stamps the time
pub struct LocationWrite {
    pub lat: LocationComponent,
    pub lng: LocationComponent,
    pub accuracy: LocationComponent,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
/// A role field as it lives on the order record
pub struct SharedLocation {
    pub lat: LocationComponent,
    pub lng: LocationComponent,
    #[serde(default)]
    pub accuracy: LocationComponent,
    /// Assigned by the store when the write lands
    #[serde(default)]
    pub updated_at: Option<UtcDT>,
}

impl SharedLocation {
    pub fn stamped(write: LocationWrite, at: UtcDT) -> Self {
        Self {
            lat: write.lat,
            lng: write.lng,
            accuracy: write.accuracy,
            updated_at: Some(at),
        }
    }

    /// Convert to a [Position], returns `None` if the coordinates aren't finite.
    pub fn to_position(&self) -> Option<Position> {
        let pos = Position {
            lat: self.lat,
            lng: self.lng,
            accuracy: self.accuracy,
            captured_at: self.updated_at.unwrap_or_else(chrono::Utc::now),
        };
        pos.is_valid().then_some(pos)
    }
}
