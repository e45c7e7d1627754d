use serde::{Deserialize, Serialize};

use crate::location::Position;

/// Kilometres per degree of latitude
pub const KM_PER_DEGREE: f64 = 111.0;

const EARTH_RADIUS_KM: f64 = 6371.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
/// How to turn two coordinates into a straight-line distance
pub enum DistanceMethod {
    /// Flat projection scaled at 111 km per degree, good enough under ~20 km
    #[default]
    Equirectangular,
    Haversine,
}

impl DistanceMethod {
    pub fn distance_km(self, a: &Position, b: &Position) -> f64 {
        match self {
            Self::Equirectangular => equirectangular_km(a, b),
            Self::Haversine => haversine_km(a, b),
        }
    }
}

pub fn equirectangular_km(a: &Position, b: &Position) -> f64 {
    let mean_lat = ((a.lat + b.lat) / 2.0).to_radians();
    let dy = (b.lat - a.lat) * KM_PER_DEGREE;
    let dx = (b.lng - a.lng) * KM_PER_DEGREE * mean_lat.cos();
    dx.hypot(dy)
}

pub fn haversine_km(a: &Position, b: &Position) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();
    let h = (d_lat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
/// Display heuristic, ignores roads entirely
pub struct EtaEstimate {
    pub distance_km: f64,
    /// Whole minutes, never below 1
    pub minutes: u32,
}

impl EtaEstimate {
    pub fn between(a: &Position, b: &Position, method: DistanceMethod, speed_kmh: f64) -> Self {
        let distance_km = method.distance_km(a, b);
        Self {
            distance_km,
            minutes: minutes_for(distance_km, speed_kmh),
        }
    }
}

/// Travel time in whole minutes at the given speed, clamped to at least 1
pub fn minutes_for(distance_km: f64, speed_kmh: f64) -> u32 {
    let km_per_minute = speed_kmh / 60.0;
    if !distance_km.is_finite() || km_per_minute <= 0.0 || !km_per_minute.is_finite() {
        return 1;
    }
    let minutes = (distance_km.max(0.0) / km_per_minute).ceil();
    // Saturating float to int cast
    (minutes as u32).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(lat: f64, lng: f64) -> Position {
        Position::new(lat, lng, 0.0)
    }

    #[test]
    fn test_hundredth_degree_latitude() {
        let a = pos(-0.3476, 32.5825);
        let b = pos(-0.3376, 32.5825);
        let eta = EtaEstimate::between(&a, &b, DistanceMethod::Equirectangular, 24.0);
        assert!((eta.distance_km - 1.11).abs() < 1e-6);
        assert_eq!(eta.minutes, 3);
    }

    #[test]
    fn test_same_position_clamps_to_one() {
        let a = pos(-0.3476, 32.5825);
        let eta = EtaEstimate::between(&a, &a, DistanceMethod::Equirectangular, 24.0);
        assert_eq!(eta.distance_km, 0.0);
        assert_eq!(eta.minutes, 1);
    }

    #[test]
    fn test_bad_speed_clamps_to_one() {
        assert_eq!(minutes_for(5.0, 0.0), 1);
        assert_eq!(minutes_for(5.0, -3.0), 1);
        assert_eq!(minutes_for(f64::NAN, 24.0), 1);
    }

    #[test]
    fn test_methods_agree_at_city_scale() {
        let a = pos(-0.3476, 32.5825);
        let b = pos(-0.3596, 32.6005);
        let flat = equirectangular_km(&a, &b);
        let round = haversine_km(&a, &b);
        assert!((flat - round).abs() / round < 0.01, "{flat} vs {round}");
    }

    #[test]
    fn test_minutes_non_decreasing_with_distance() {
        let mut last = 0;
        for step in 0..200 {
            let minutes = minutes_for(step as f64 * 0.05, 24.0);
            assert!(minutes >= last.max(1));
            last = minutes;
        }
    }
}
