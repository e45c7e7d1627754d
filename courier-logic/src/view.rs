use serde::{Deserialize, Serialize};

use crate::{
    error::TrackingError,
    eta::{DistanceMethod, EtaEstimate},
    geolocation::PermissionState,
    location::Position,
    order::OrderId,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
/// What a consuming UI gets to see of a relay
pub struct TrackingView {
    /// Order being tracked, `None` while the relay is stopped
    pub order: Option<OrderId>,
    pub my_position: Option<Position>,
    pub partner_position: Option<Position>,
    pub permission_state: PermissionState,
    pub last_error: Option<TrackingError>,
    pub eta: Option<EtaEstimate>,
    /// The partner feed failed, `partner_position` is no longer live
    pub stalled: bool,
}

impl TrackingView {
    /// Recompute the ETA from the current pair of positions
    pub(crate) fn refresh_eta(&mut self, method: DistanceMethod, speed_kmh: f64) {
        self.eta = match (&self.my_position, &self.partner_position) {
            (Some(me), Some(partner)) => Some(EtaEstimate::between(me, partner, method, speed_kmh)),
            _ => None,
        };
    }

    /// Clear everything tied to an order, permission (and why it was lost) outlives orders
    pub(crate) fn reset(&mut self) {
        let last_error = self.last_error.take().filter(|err| {
            matches!(
                err,
                TrackingError::PermissionDenied | TrackingError::Unsupported
            )
        });
        *self = Self {
            permission_state: self.permission_state,
            last_error,
            ..Self::default()
        };
    }

    /// Whether the partner can currently be seen live
    pub fn is_live(&self) -> bool {
        self.partner_position.is_some() && !self.stalled
    }
}
