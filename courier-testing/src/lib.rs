use std::{
    collections::{HashMap, VecDeque},
    fmt,
    str::FromStr,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use courier_logic::{
    GeolocationError, GeolocationEvent, GeolocationProvider, Position, WatchId, WatchOptions,
};
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod prelude {
    pub use anyhow::{Context, anyhow, bail};
    pub type Result<T = (), E = anyhow::Error> = std::result::Result<T, E>;
}

pub use prelude::*;

/// A bare coordinate pair, parsed from `lat,lng` on the command line
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lng: f64,
}

impl LatLng {
    pub const fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// Kampala city centre
pub const KAMPALA: LatLng = LatLng::new(0.3476, 32.5825);

impl FromStr for LatLng {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (lat, lng) = s
            .split_once(',')
            .context("Expected a coordinate pair like 0.3476,32.5825")?;
        let lat = lat.trim().parse::<f64>().context("Invalid latitude")?;
        let lng = lng.trim().parse::<f64>().context("Invalid longitude")?;
        if !(lat.is_finite() && lng.is_finite()) {
            bail!("Coordinates must be finite");
        }
        if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
            bail!("Coordinates out of range");
        }
        Ok(Self { lat, lng })
    }
}

impl fmt::Display for LatLng {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.5},{:.5}", self.lat, self.lng)
    }
}

/// Once both axes are this close to the target, the simulation stops moving
pub const ARRIVAL_EPSILON: f64 = 0.00003;

#[derive(Debug, Clone, Copy)]
pub struct SimSettings {
    /// Time between two samples
    pub tick: Duration,
    /// Share of the remaining distance covered on each tick
    pub step_fraction: f64,
    /// Reported accuracy of every fix, in meters
    pub accuracy: f64,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(200),
            step_fraction: 0.012,
            accuracy: 8.0,
        }
    }
}

#[derive(Debug)]
struct Route {
    position: LatLng,
    target: Option<LatLng>,
    denied: bool,
    errors: VecDeque<GeolocationError>,
}

impl Route {
    fn arrived(&self) -> bool {
        self.target.is_none_or(|target| {
            (target.lat - self.position.lat).abs() < ARRIVAL_EPSILON
                && (target.lng - self.position.lng).abs() < ARRIVAL_EPSILON
        })
    }

    /// Move toward the target, returns whether we moved
    fn step(&mut self, fraction: f64) -> bool {
        if self.arrived() {
            return false;
        }
        if let Some(target) = self.target {
            self.position.lat += (target.lat - self.position.lat) * fraction;
            self.position.lng += (target.lng - self.position.lng) * fraction;
        }
        true
    }
}

/// A [GeolocationProvider] for demos and tests. Every watch samples a shared route on a
/// fixed tick, moving toward the current target by a fixed share of the remaining distance.
/// Fixes are only delivered when the position moved, plus one right away for a new watch.
pub struct SimulatedGeolocation {
    settings: SimSettings,
    supported: bool,
    route: Arc<Mutex<Route>>,
    next_id: AtomicU64,
    watches: Mutex<HashMap<WatchId, CancellationToken>>,
}

impl SimulatedGeolocation {
    /// Stand still at `start` until given a target
    pub fn new(start: LatLng, settings: SimSettings) -> Self {
        Self {
            settings,
            supported: true,
            route: Arc::new(Mutex::new(Route {
                position: start,
                target: None,
                denied: false,
                errors: VecDeque::new(),
            })),
            next_id: AtomicU64::new(1),
            watches: Mutex::new(HashMap::new()),
        }
    }

    /// Travel from `start` to `target`
    pub fn travelling(start: LatLng, target: LatLng, settings: SimSettings) -> Self {
        let sim = Self::new(start, settings);
        sim.set_target(target);
        sim
    }

    /// A platform without geolocation
    pub fn unsupported() -> Self {
        let mut sim = Self::new(KAMPALA, SimSettings::default());
        sim.supported = false;
        sim
    }

    pub fn set_target(&self, target: LatLng) {
        self.route.lock().unwrap().target = Some(target);
    }

    pub fn position(&self) -> LatLng {
        self.route.lock().unwrap().position
    }

    pub fn arrived(&self) -> bool {
        self.route.lock().unwrap().arrived()
    }

    /// Act as if the user revoked location access, every watch reports it once then goes quiet
    pub fn deny(&self) {
        self.route.lock().unwrap().denied = true;
    }

    /// Deliver `err` on the next tick instead of a fix
    pub fn inject_error(&self, err: GeolocationError) {
        self.route.lock().unwrap().errors.push_back(err);
    }

    pub fn active_watches(&self) -> usize {
        self.watches.lock().unwrap().len()
    }
}

impl GeolocationProvider for SimulatedGeolocation {
    fn is_supported(&self) -> bool {
        self.supported
    }

    fn watch_position(
        &self,
        _options: WatchOptions,
        events: mpsc::Sender<GeolocationEvent>,
    ) -> Result<WatchId> {
        if !self.supported {
            bail!("Geolocation is not supported");
        }

        let id = WatchId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let cancel = CancellationToken::new();
        self.watches.lock().unwrap().insert(id, cancel.clone());

        tokio::spawn(sample_route(
            self.route.clone(),
            self.settings,
            events,
            cancel,
        ));

        Ok(id)
    }

    fn clear_watch(&self, id: WatchId) {
        if let Some(cancel) = self.watches.lock().unwrap().remove(&id) {
            cancel.cancel();
        }
    }
}

impl Drop for SimulatedGeolocation {
    fn drop(&mut self) {
        if let Ok(watches) = self.watches.get_mut() {
            for cancel in watches.values() {
                cancel.cancel();
            }
        }
    }
}

async fn sample_route(
    route: Arc<Mutex<Route>>,
    settings: SimSettings,
    events: mpsc::Sender<GeolocationEvent>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(settings.tick);
    let mut reported_denial = false;
    let mut sent_first = false;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            _ = events.closed() => break,
            _ = interval.tick() => {}
        }

        let event = {
            let mut route = route.lock().unwrap();
            if route.denied {
                (!reported_denial).then(|| {
                    reported_denial = true;
                    GeolocationEvent::Error(GeolocationError::PermissionDenied)
                })
            } else if let Some(err) = route.errors.pop_front() {
                Some(GeolocationEvent::Error(err))
            } else if route.step(settings.step_fraction) || !sent_first {
                sent_first = true;
                let LatLng { lat, lng } = route.position;
                Some(GeolocationEvent::Position(Position::new(
                    lat,
                    lng,
                    settings.accuracy,
                )))
            } else {
                None
            }
        };

        if let Some(event) = event {
            if events.send(event).await.is_err() {
                break;
            }
        }
    }

    debug!("Simulated watch ended");
}
