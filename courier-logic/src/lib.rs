mod error;
mod eta;
mod geolocation;
mod location;
mod order;
mod relay;
mod settings;
mod store;
#[cfg(test)]
mod tests;
mod view;

pub use error::{RelayError, StoreError, TrackingError};
pub use eta::{DistanceMethod, EtaEstimate, KM_PER_DEGREE, equirectangular_km, haversine_km};
pub use geolocation::{
    GeolocationError, GeolocationEvent, GeolocationProvider, PermissionState, WatchId,
    WatchOptions,
};
pub use location::{LocationComponent, LocationWrite, Position, SharedLocation};
pub use order::{OrderId, OrderSnapshot, OrderStatus, RoleField};
pub use relay::{LocationRelay, StateUpdateSender};
pub use settings::RelaySettings;
pub use store::{LocationStore, SnapshotEvent, SubscriptionId};
pub use view::TrackingView;

/// Convenience alias for UTC DT
pub type UtcDT = chrono::DateTime<chrono::Utc>;

pub mod prelude {
    use anyhow::Error as AnyhowError;
    use std::result::Result as StdResult;
    pub type Result<T = (), E = AnyhowError> = StdResult<T, E>;
    pub use anyhow::Context;
}
