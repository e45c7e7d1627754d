use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::{
    sync::{Mutex, mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{RelayError, TrackingError},
    geolocation::{GeolocationEvent, GeolocationProvider, PermissionState, WatchId},
    location::{Position, SharedLocation},
    order::{OrderId, RoleField},
    settings::RelaySettings,
    store::{LocationStore, SnapshotEvent, SubscriptionId},
    view::TrackingView,
};

/// Notified whenever the [TrackingView] of a relay changes
pub trait StateUpdateSender {
    fn send_update(&self);
}

type ViewHandle = Arc<watch::Sender<TrackingView>>;

/// Registrations held for one (order, role) pair
struct Session {
    order: OrderId,
    self_field: RoleField,
    partner_field: RoleField,
    watch: Option<WatchId>,
    subscription: Option<SubscriptionId>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Session {
    fn is_for(&self, order: &OrderId, self_field: RoleField, partner_field: RoleField) -> bool {
        self.order == *order && self.self_field == self_field && self.partner_field == partner_field
    }
}

/// Two-way live position channel between the two parties of an order.
///
/// Local fixes from the [GeolocationProvider] are published into our own role field through
/// the [LocationStore], while the partner's field is read back from the store's snapshots.
/// Both feeds are consumed by a single update loop per session, which is the only writer of
/// the [TrackingView].
pub struct LocationRelay<G, S, U>
where
    G: GeolocationProvider + 'static,
    S: LocationStore + 'static,
    U: StateUpdateSender + Send + Sync + 'static,
{
    settings: RelaySettings,
    provider: Arc<G>,
    store: Arc<S>,
    updates: Arc<U>,
    view: ViewHandle,
    session: Mutex<Option<Session>>,
}

impl<G, S, U> LocationRelay<G, S, U>
where
    G: GeolocationProvider + 'static,
    S: LocationStore + 'static,
    U: StateUpdateSender + Send + Sync + 'static,
{
    pub fn new(settings: RelaySettings, provider: Arc<G>, store: Arc<S>, updates: U) -> Self {
        let (view, _) = watch::channel(TrackingView::default());
        Self {
            settings,
            provider,
            store,
            updates: Arc::new(updates),
            view: Arc::new(view),
            session: Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    /// Current state of the relay
    pub fn view(&self) -> TrackingView {
        self.view.borrow().clone()
    }

    /// Live, read-only feed of the relay state
    pub fn subscribe_view(&self) -> watch::Receiver<TrackingView> {
        self.view.subscribe()
    }

    /// Begin sharing our position for `order` in `self_field` and following `partner_field`.
    ///
    /// Does nothing if `order` is blank or this exact session is already running. A running
    /// session for anything else is fully stopped before the new one registers.
    pub async fn start(
        &self,
        order: impl AsRef<str>,
        self_field: RoleField,
        partner_field: RoleField,
    ) -> Result<(), RelayError> {
        let Some(order) = OrderId::parse(order.as_ref()) else {
            debug!("No active order, not starting relay");
            return Ok(());
        };

        if self_field == partner_field {
            return Err(RelayError::SameField(self_field));
        }

        let mut session = self.session.lock().await;

        if session
            .as_ref()
            .is_some_and(|s| s.is_for(&order, self_field, partner_field))
        {
            return Ok(());
        }

        if let Some(old) = session.take() {
            self.teardown(old).await;
        }

        *session = Some(self.open(order, self_field, partner_field).await);

        Ok(())
    }

    /// Follow a (possibly cleared) order id, always stop-then-start
    pub async fn switch_order(
        &self,
        order: Option<&str>,
        self_field: RoleField,
        partner_field: RoleField,
    ) -> Result<(), RelayError> {
        match order.and_then(OrderId::parse) {
            Some(order) => self.start(order, self_field, partner_field).await,
            None => {
                self.stop().await;
                Ok(())
            }
        }
    }

    /// Release the watch and the subscription. Safe to call at any time and more than once,
    /// once this returns the view won't change until the next [Self::start].
    pub async fn stop(&self) {
        let mut session = self.session.lock().await;
        if let Some(old) = session.take() {
            self.teardown(old).await;
        }
    }

    pub async fn is_active(&self) -> bool {
        self.session.lock().await.is_some()
    }

    fn modify_view(&self, f: impl FnOnce(&mut TrackingView)) {
        self.view.send_modify(f);
        self.updates.send_update();
    }

    async fn open(&self, order: OrderId, self_field: RoleField, partner_field: RoleField) -> Session {
        info!("Sharing {self_field} on order {order}, following {partner_field}");

        let capacity = self.settings.channel_capacity.max(1);
        let cancel = CancellationToken::new();

        self.modify_view(|view| {
            view.reset();
            view.order = Some(order.clone());
        });

        let (watch, positions) = if self.provider.is_supported() {
            let (tx, rx) = mpsc::channel(capacity);
            match self.provider.watch_position(self.settings.watch, tx) {
                Ok(id) => (Some(id), Some(rx)),
                Err(why) => {
                    warn!("Failed to start watching position: {why:?}");
                    self.modify_view(|view| {
                        view.last_error = Some(TrackingError::PositionUnavailable(why.to_string()));
                    });
                    (None, None)
                }
            }
        } else {
            warn!("Geolocation is not supported here");
            self.modify_view(|view| {
                view.permission_state = PermissionState::Denied;
                view.last_error = Some(TrackingError::Unsupported);
            });
            (None, None)
        };

        let (tx, rx) = mpsc::channel(capacity);
        let (subscription, snapshots) = match self.store.subscribe(&order, tx).await {
            Ok(id) => (Some(id), Some(rx)),
            Err(why) => {
                error!("Failed to subscribe to order {order}: {why}");
                self.modify_view(|view| {
                    view.stalled = true;
                    view.last_error = Some(TrackingError::RemoteReadFailed(why.to_string()));
                });
                (None, None)
            }
        };

        let update_loop = UpdateLoop {
            order: order.clone(),
            self_field,
            partner_field,
            settings: self.settings.clone(),
            store: self.store.clone(),
            updates: self.updates.clone(),
            view: self.view.clone(),
            cancel: cancel.clone(),
            last_publish: None,
            pending: None,
        };

        let task = tokio::spawn(update_loop.run(positions, snapshots));

        Session {
            order,
            self_field,
            partner_field,
            watch,
            subscription,
            cancel,
            task,
        }
    }

    async fn teardown(&self, session: Session) {
        info!(
            "Stopping {} relay for order {}",
            session.self_field, session.order
        );

        session.cancel.cancel();

        if let Some(id) = session.watch {
            self.provider.clear_watch(id);
        }

        if let Some(id) = session.subscription {
            self.store.unsubscribe(id).await;
        }

        if let Err(why) = session.task.await {
            error!("Relay loop for order {} failed: {why:?}", session.order);
        }

        self.modify_view(TrackingView::reset);
    }
}

impl<G, S, U> Drop for LocationRelay<G, S, U>
where
    G: GeolocationProvider + 'static,
    S: LocationStore + 'static,
    U: StateUpdateSender + Send + Sync + 'static,
{
    fn drop(&mut self) {
        // Unsubscribing needs to await. The loop drops its snapshot receiver on cancel and the
        // store ends the subscription once it sees the receiver is gone.
        if let Some(session) = self.session.get_mut().take() {
            session.cancel.cancel();
            if let Some(id) = session.watch {
                self.provider.clear_watch(id);
            }
        }
    }
}

async fn recv_or_pending<T>(rx: &mut Option<mpsc::Receiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Owns the session state and applies events from both feeds, one at a time
struct UpdateLoop<S: LocationStore, U: StateUpdateSender> {
    order: OrderId,
    self_field: RoleField,
    partner_field: RoleField,
    settings: RelaySettings,
    store: Arc<S>,
    updates: Arc<U>,
    view: ViewHandle,
    cancel: CancellationToken,
    last_publish: Option<Instant>,
    /// Latest fix that landed inside the publish interval, written once the interval is up
    pending: Option<Position>,
}

impl<S, U> UpdateLoop<S, U>
where
    S: LocationStore + 'static,
    U: StateUpdateSender + Send + Sync + 'static,
{
    async fn run(
        mut self,
        mut positions: Option<mpsc::Receiver<GeolocationEvent>>,
        mut snapshots: Option<mpsc::Receiver<SnapshotEvent>>,
    ) {
        loop {
            let deadline = self.publish_deadline();

            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => {
                    break;
                }

                _ = tokio::time::sleep_until(deadline), if self.pending.is_some() => {
                    if let Some(pos) = self.pending.take() {
                        self.publish(pos);
                    }
                }

                event = recv_or_pending(&mut positions) => {
                    if let Some(event) = event {
                        self.handle_geolocation(event);
                    } else {
                        debug!("Geolocation provider closed its feed for order {}", self.order);
                        positions = None;
                    }
                }

                event = recv_or_pending(&mut snapshots) => {
                    if let Some(event) = event {
                        self.handle_snapshot(event);
                    } else {
                        warn!("Subscription to order {} ended", self.order);
                        self.mark_stalled("subscription ended".to_string());
                        snapshots = None;
                    }
                }
            }
        }
    }

    /// Apply a change to the view, only notifies if something actually changed
    fn update_view(&self, f: impl FnOnce(&mut TrackingView)) {
        let method = self.settings.distance_method;
        let speed = self.settings.speed_kmh;
        let changed = self.view.send_if_modified(|view| {
            let before = view.clone();
            f(view);
            view.refresh_eta(method, speed);
            *view != before
        });
        if changed {
            self.updates.send_update();
        }
    }

    fn handle_geolocation(&mut self, event: GeolocationEvent) {
        match event {
            GeolocationEvent::Position(pos) => {
                if !pos.is_valid() {
                    warn!("Ignoring fix with non-finite coordinates: {pos:?}");
                    return;
                }

                self.update_view(|view| {
                    view.my_position = Some(pos);
                    view.permission_state = view.permission_state.after_fix();
                    if view.last_error.as_ref().is_some_and(TrackingError::is_transient) {
                        view.last_error = None;
                    }
                });

                self.publish(pos);
            }
            GeolocationEvent::Error(err) => {
                warn!("Geolocation error on order {}: {err:?}", self.order);
                self.update_view(|view| {
                    let denied_before = view.permission_state == PermissionState::Denied;
                    view.permission_state = view.permission_state.after_error(&err);
                    // Once denied, keep telling the user why tracking is off
                    if !denied_before || view.last_error.is_none() {
                        view.last_error = Some(err.into());
                    }
                });
            }
        }
    }

    fn handle_snapshot(&mut self, event: SnapshotEvent) {
        match event {
            Ok(Some(snapshot)) => {
                let partner = snapshot
                    .field(self.partner_field)
                    .and_then(SharedLocation::to_position);

                self.update_view(|view| {
                    if let Some(partner) = partner {
                        view.partner_position = Some(partner);
                    }
                    if view.stalled {
                        view.stalled = false;
                        if matches!(view.last_error, Some(TrackingError::RemoteReadFailed(_))) {
                            view.last_error = None;
                        }
                    }
                });
            }
            Ok(None) => {
                debug!("Order {} has no record yet", self.order);
            }
            Err(why) => {
                error!("Subscription error on order {}: {why}", self.order);
                self.mark_stalled(why.to_string());
            }
        }
    }

    fn mark_stalled(&self, why: String) {
        self.update_view(|view| {
            view.stalled = true;
            view.last_error = Some(TrackingError::RemoteReadFailed(why));
        });
    }

    /// Earliest time the next write may go out
    fn publish_deadline(&self) -> Instant {
        self.last_publish
            .map_or_else(Instant::now, |last| last + self.settings.publish_interval)
    }

    /// Write our position, or hold it until the publish interval is up. Writes run on their
    /// own so a slow one can't hold up the loop, whichever lands last wins.
    fn publish(&mut self, pos: Position) {
        let now = Instant::now();
        if self.last_publish.is_some() && now < self.publish_deadline() {
            self.pending = Some(pos);
            return;
        }
        self.last_publish = Some(now);
        self.pending = None;

        let store = self.store.clone();
        let order = self.order.clone();
        let field = self.self_field;
        let retries = self.settings.write_retries;
        let delay = self.settings.write_retry_delay;
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let write = pos.as_write();
            let mut attempt = 0;
            loop {
                match store.write_location(&order, field, write).await {
                    Ok(()) => break,
                    Err(why) if attempt < retries && !cancel.is_cancelled() => {
                        attempt += 1;
                        debug!("Write of {field} on {order} failed ({why}), retry {attempt}");
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    Err(why) => {
                        // The order may not exist yet, the next fix tries again
                        debug!("Dropping write of {field} on {order}: {why}");
                        break;
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::{
        GeolocationError, OrderSnapshot, StoreError,
        tests::{Call, CallLog, CountingSender, DummySender, MockGeolocation, MockStore},
    };

    use super::*;
    use tokio::test;

    type TestRelay<U> = LocationRelay<MockGeolocation, MockStore, U>;

    const KAMPALA: (f64, f64) = (-0.3476, 32.5825);

    struct Harness<U: StateUpdateSender + Send + Sync + 'static = DummySender> {
        log: CallLog,
        provider: Arc<MockGeolocation>,
        store: Arc<MockStore>,
        relay: TestRelay<U>,
    }

    fn test_settings() -> RelaySettings {
        RelaySettings {
            publish_interval: Duration::ZERO,
            ..Default::default()
        }
    }

    fn order(raw: &str) -> OrderId {
        OrderId::parse(raw).expect("Valid order id")
    }

    impl Harness {
        fn new() -> Self {
            Self::with(test_settings(), DummySender, true)
        }
    }

    impl<U: StateUpdateSender + Send + Sync + 'static> Harness<U> {
        fn with(settings: RelaySettings, updates: U, supported: bool) -> Self {
            tokio::time::pause();
            let log = CallLog::default();
            let provider = Arc::new(if supported {
                MockGeolocation::new(log.clone())
            } else {
                MockGeolocation::unsupported(log.clone())
            });
            let store = Arc::new(MockStore::new(log.clone()));
            let relay = LocationRelay::new(settings, provider.clone(), store.clone(), updates);
            Self {
                log,
                provider,
                store,
                relay,
            }
        }

        async fn start_customer(&self, raw: &str) {
            self.relay
                .start(raw, RoleField::Customer, RoleField::Rider)
                .await
                .expect("Failed to start relay");
            settle().await;
        }

        fn calls(&self) -> Vec<Call> {
            self.log.lock().unwrap().clone()
        }
    }

    /// Let every spawned task run until the runtime is idle
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    #[test]
    async fn test_my_position_is_sample() {
        let h = Harness::new();
        h.store.create_order(&order("EG-001")).await;
        h.start_customer("EG-001").await;

        h.provider.fix(KAMPALA.0, KAMPALA.1).await;
        settle().await;

        let view = h.relay.view();
        let me = view.my_position.expect("No position after a fix");
        assert_eq!((me.lat, me.lng), KAMPALA);
        assert_eq!(view.permission_state, PermissionState::Granted);
        assert_eq!(view.order, Some(order("EG-001")));

        let written = h
            .store
            .field(&order("EG-001"), RoleField::Customer)
            .expect("Position was not published");
        assert_eq!((written.lat, written.lng), KAMPALA);
        assert!(written.updated_at.is_some());
    }

    #[test]
    async fn test_blank_order_is_noop() {
        let h = Harness::new();

        for blank in ["", "   "] {
            h.relay
                .start(blank, RoleField::Customer, RoleField::Rider)
                .await
                .expect("Blank order should not error");
        }
        settle().await;

        assert!(h.calls().is_empty(), "Registered something: {:?}", h.calls());
        assert_eq!(h.provider.active_watches(), 0);
        assert_eq!(h.store.active_subscriptions(), 0);
        assert!(!h.relay.is_active().await);
        assert_eq!(h.relay.view(), TrackingView::default());
    }

    #[test]
    async fn test_same_fields_rejected() {
        let h = Harness::new();

        let res = h
            .relay
            .start("EG-001", RoleField::Rider, RoleField::Rider)
            .await;

        assert_eq!(res, Err(RelayError::SameField(RoleField::Rider)));
        assert!(h.calls().is_empty());
    }

    #[test]
    async fn test_stop_releases_everything() {
        let h = Harness::new();
        h.start_customer("EG-001").await;

        assert_eq!(h.provider.active_watches(), 1);
        assert_eq!(h.store.active_subscriptions(), 1);

        h.relay.stop().await;
        assert_eq!(h.provider.active_watches(), 0);
        assert_eq!(h.store.active_subscriptions(), 0);
        assert!(!h.relay.is_active().await);

        // Second stop is harmless
        h.relay.stop().await;
        assert_eq!(h.calls().len(), 4);
    }

    #[test]
    async fn test_start_is_idempotent() {
        let h = Harness::new();
        h.start_customer("EG-001").await;
        h.start_customer("EG-001").await;

        assert_eq!(h.calls().len(), 2, "Restarted an identical session");
        assert_eq!(h.provider.active_watches(), 1);
    }

    #[test]
    async fn test_switch_order_never_overlaps() {
        let h = Harness::new();
        h.start_customer("EG-001").await;
        h.start_customer("EG-002").await;

        let mut watches = 0i32;
        let mut subs = 0i32;
        for call in h.calls() {
            match call {
                Call::Watch(_) => watches += 1,
                Call::ClearWatch(_) => watches -= 1,
                Call::Subscribe(_, _) => subs += 1,
                Call::Unsubscribe(_) => subs -= 1,
            }
            assert!(watches <= 1, "Two watches active at once");
            assert!(subs <= 1, "Two subscriptions active at once");
        }

        let calls = h.calls();
        let cleared = calls
            .iter()
            .position(|c| matches!(c, Call::Unsubscribe(_)))
            .expect("First subscription never released");
        let second = calls
            .iter()
            .position(|c| matches!(c, Call::Subscribe(o, _) if *o == order("EG-002")))
            .expect("Second order never subscribed");
        assert!(cleared < second);
        assert_eq!(h.relay.view().order, Some(order("EG-002")));

        h.relay
            .switch_order(None, RoleField::Customer, RoleField::Rider)
            .await
            .expect("Clearing the order failed");
        assert_eq!(h.provider.active_watches(), 0);
        assert_eq!(h.store.active_subscriptions(), 0);
    }

    #[test]
    async fn test_missing_partner_field_keeps_last() {
        let h = Harness::new();
        let id = order("EG-001");
        h.store.create_order(&id).await;
        h.start_customer("EG-001").await;

        // Record exists but the rider hasn't published
        assert_eq!(h.relay.view().partner_position, None);

        h.store
            .partner_writes(&id, RoleField::Rider, -0.333, 32.575)
            .await;
        settle().await;
        let partner = h.relay.view().partner_position.expect("No partner position");
        assert_eq!((partner.lat, partner.lng), (-0.333, 32.575));

        // A snapshot without the field, the last known position stays
        let bare = OrderSnapshot::new(id.clone(), chrono::Utc::now());
        h.store.notify(&id, Ok(Some(bare))).await;
        h.store.notify(&id, Ok(None)).await;
        settle().await;
        assert_eq!(h.relay.view().partner_position, Some(partner));
    }

    #[test]
    async fn test_own_field_echo_is_not_partner() {
        let h = Harness::new();
        h.store.create_order(&order("EG-001")).await;
        h.start_customer("EG-001").await;

        h.provider.fix(KAMPALA.0, KAMPALA.1).await;
        settle().await;

        assert_eq!(h.relay.view().partner_position, None);
    }

    #[test]
    async fn test_eta_from_positions() {
        let h = Harness::new();
        let id = order("EG-001");
        h.store.create_order(&id).await;
        h.start_customer("EG-001").await;

        h.provider.fix(KAMPALA.0, KAMPALA.1).await;
        settle().await;
        assert_eq!(h.relay.view().eta, None, "ETA without a partner");

        h.store
            .partner_writes(&id, RoleField::Rider, KAMPALA.0 + 0.01, KAMPALA.1)
            .await;
        settle().await;
        assert_eq!(h.relay.view().eta.map(|e| e.minutes), Some(3));

        h.store
            .partner_writes(&id, RoleField::Rider, KAMPALA.0, KAMPALA.1)
            .await;
        settle().await;
        let eta = h.relay.view().eta.expect("No ETA");
        assert_eq!(eta.minutes, 1);
        assert_eq!(eta.distance_km, 0.0);
    }

    #[test]
    async fn test_denied_is_sticky() {
        let h = Harness::new();
        h.start_customer("EG-001").await;

        h.provider.fail(GeolocationError::PermissionDenied).await;
        settle().await;
        let view = h.relay.view();
        assert_eq!(view.permission_state, PermissionState::Denied);
        assert_eq!(view.last_error, Some(TrackingError::PermissionDenied));

        h.provider.fail(GeolocationError::Timeout).await;
        h.provider
            .fail(GeolocationError::Unavailable("no satellites".into()))
            .await;
        settle().await;
        let view = h.relay.view();
        assert_eq!(view.permission_state, PermissionState::Denied);
        assert_eq!(view.last_error, Some(TrackingError::PermissionDenied));

        // Permission is for the session, not the order
        h.start_customer("EG-002").await;
        assert_eq!(h.relay.view().permission_state, PermissionState::Denied);
    }

    #[test]
    async fn test_transient_error_keeps_state() {
        let h = Harness::new();
        h.start_customer("EG-001").await;

        h.provider.fix(KAMPALA.0, KAMPALA.1).await;
        h.provider.fail(GeolocationError::Timeout).await;
        settle().await;

        let view = h.relay.view();
        assert_eq!(view.permission_state, PermissionState::Granted);
        assert_eq!(view.last_error, Some(TrackingError::Timeout));
        assert!(view.my_position.is_some());

        h.provider.fix(KAMPALA.0 + 0.001, KAMPALA.1).await;
        settle().await;
        assert_eq!(h.relay.view().last_error, None);
    }

    #[test]
    async fn test_non_finite_fix_ignored() {
        let h = Harness::new();
        h.start_customer("EG-001").await;

        h.provider.fix(KAMPALA.0, KAMPALA.1).await;
        h.provider.fix(f64::NAN, KAMPALA.1).await;
        h.provider.fix(KAMPALA.0, f64::INFINITY).await;
        settle().await;

        let me = h.relay.view().my_position.expect("No position");
        assert_eq!((me.lat, me.lng), KAMPALA);
    }

    #[test]
    async fn test_write_to_missing_order_is_swallowed() {
        let h = Harness::new();
        let id = order("EG-001");
        h.start_customer("EG-001").await;

        h.provider.fix(KAMPALA.0, KAMPALA.1).await;
        settle().await;

        assert_eq!(h.store.write_attempts(), 1);
        let view = h.relay.view();
        assert_eq!(view.last_error, None);
        assert!(!view.stalled);

        // The order shows up a little later, the next fix lands
        h.store.create_order(&id).await;
        h.provider.fix(KAMPALA.0 + 0.001, KAMPALA.1).await;
        settle().await;
        assert!(h.store.field(&id, RoleField::Customer).is_some());
    }

    #[test]
    async fn test_write_retries() {
        let settings = RelaySettings {
            write_retries: 2,
            ..test_settings()
        };
        let h = Harness::with(settings, DummySender, true);
        h.start_customer("EG-001").await;

        h.provider.fix(KAMPALA.0, KAMPALA.1).await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(h.store.write_attempts(), 3);
    }

    #[test]
    async fn test_publish_interval() {
        let settings = RelaySettings {
            publish_interval: Duration::from_secs(1),
            ..test_settings()
        };
        let h = Harness::with(settings, DummySender, true);
        h.store.create_order(&order("EG-001")).await;
        h.start_customer("EG-001").await;

        for i in 0..3 {
            h.provider.fix(KAMPALA.0 + i as f64 * 0.001, KAMPALA.1).await;
            settle().await;
        }
        assert_eq!(h.store.write_attempts(), 1);
        let me = h.relay.view().my_position.expect("No position");
        assert_eq!(me.lat, KAMPALA.0 + 0.002, "View should still follow every fix");

        // The held fix goes out once the interval is up
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.store.write_attempts(), 2);
        let stored = h
            .store
            .field(&order("EG-001"), RoleField::Customer)
            .expect("Position was not published");
        assert_eq!(stored.lat, KAMPALA.0 + 0.002);

        h.provider.fix(KAMPALA.0, KAMPALA.1).await;
        settle().await;
        assert_eq!(h.store.write_attempts(), 2);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.store.write_attempts(), 3);
    }

    #[test]
    async fn test_last_fix_reaches_store_after_device_goes_quiet() {
        let h = Harness::with(RelaySettings::default(), DummySender, true);
        h.store.create_order(&order("EG-001")).await;
        h.start_customer("EG-001").await;

        h.provider.fix(0.30, KAMPALA.1).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        h.provider.fix(0.35, KAMPALA.1).await;
        tokio::time::sleep(Duration::from_secs(30)).await;

        let stored = h
            .store
            .field(&order("EG-001"), RoleField::Customer)
            .expect("Position was not published");
        assert_eq!(stored.lat, 0.35);
        assert_eq!(h.store.write_attempts(), 2);
    }

    #[test]
    async fn test_held_fix_dropped_on_stop() {
        let h = Harness::with(RelaySettings::default(), DummySender, true);
        h.store.create_order(&order("EG-001")).await;
        h.start_customer("EG-001").await;

        h.provider.fix(0.30, KAMPALA.1).await;
        settle().await;
        h.provider.fix(0.35, KAMPALA.1).await;
        settle().await;
        h.relay.stop().await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.store.write_attempts(), 1);
    }

    #[test]
    async fn test_subscribe_failure_stalls() {
        let h = Harness::new();
        h.store.set_fail_subscribe(true);
        h.start_customer("EG-001").await;

        let view = h.relay.view();
        assert!(view.stalled);
        assert!(matches!(
            view.last_error,
            Some(TrackingError::RemoteReadFailed(_))
        ));
        // Local sharing still runs
        assert_eq!(h.provider.active_watches(), 1);
    }

    #[test]
    async fn test_snapshot_error_stalls_until_next_snapshot() {
        let h = Harness::new();
        let id = order("EG-001");
        h.store.create_order(&id).await;
        h.start_customer("EG-001").await;
        h.store
            .partner_writes(&id, RoleField::Rider, -0.333, 32.575)
            .await;
        settle().await;

        h.store
            .notify(&id, Err(StoreError::Connection("reset".into())))
            .await;
        settle().await;
        let view = h.relay.view();
        assert!(view.stalled);
        assert!(!view.is_live());
        assert!(view.partner_position.is_some(), "Stalling lost the position");

        h.store
            .partner_writes(&id, RoleField::Rider, -0.334, 32.575)
            .await;
        settle().await;
        let view = h.relay.view();
        assert!(view.is_live());
        assert_eq!(view.last_error, None);
    }

    #[test]
    async fn test_subscription_ending_stalls() {
        let h = Harness::new();
        h.start_customer("EG-001").await;

        h.store.drop_subscribers();
        settle().await;

        assert!(h.relay.view().stalled);
    }

    #[test]
    async fn test_no_updates_after_stop() {
        let updates = CountingSender::default();
        let h = Harness::with(test_settings(), updates.clone(), true);
        let id = order("EG-001");
        h.store.create_order(&id).await;
        h.start_customer("EG-001").await;
        h.provider.fix(KAMPALA.0, KAMPALA.1).await;
        settle().await;

        h.relay.stop().await;
        let view = h.relay.view();
        let count = updates.count();
        assert_eq!(view.my_position, None);
        assert_eq!(view.order, None);
        assert_eq!(view.permission_state, PermissionState::Granted);

        h.provider.fix(1.0, 1.0).await;
        h.store
            .partner_writes(&id, RoleField::Rider, -0.333, 32.575)
            .await;
        settle().await;

        assert_eq!(h.relay.view(), view);
        assert_eq!(updates.count(), count);
    }

    #[test]
    async fn test_unsupported_provider() {
        let h = Harness::with(test_settings(), DummySender, false);
        h.start_customer("EG-001").await;

        let view = h.relay.view();
        assert_eq!(view.permission_state, PermissionState::Denied);
        assert_eq!(view.last_error, Some(TrackingError::Unsupported));
        assert_eq!(h.provider.active_watches(), 0);
        assert_eq!(h.store.active_subscriptions(), 1);
    }

    #[test]
    async fn test_view_feed_sees_changes() {
        let h = Harness::new();
        let mut feed = h.relay.subscribe_view();
        h.start_customer("EG-001").await;
        feed.borrow_and_update();

        h.provider.fix(KAMPALA.0, KAMPALA.1).await;
        settle().await;

        assert!(feed.has_changed().expect("View sender dropped"));
        assert!(feed.borrow_and_update().my_position.is_some());
    }

    #[test]
    async fn test_rider_follows_customer() {
        let h = Harness::new();
        let id = order("EG-003");
        h.store.create_order(&id).await;
        h.relay
            .start("EG-003", RoleField::Rider, RoleField::Customer)
            .await
            .expect("Failed to start relay");
        settle().await;

        h.store
            .partner_writes(&id, RoleField::Customer, KAMPALA.0, KAMPALA.1)
            .await;
        h.provider.fix(KAMPALA.0 + 0.02, KAMPALA.1).await;
        settle().await;

        let view = h.relay.view();
        assert_eq!(view.partner_position.map(|p| p.lat), Some(KAMPALA.0));
        assert!(h.store.field(&id, RoleField::Rider).is_some());
        assert_eq!(view.eta.map(|e| e.minutes), Some(6));
    }
}
