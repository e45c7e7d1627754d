use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
};

use chrono::Utc;
use tokio::sync::mpsc;

use crate::{
    GeolocationError, GeolocationEvent, GeolocationProvider, LocationStore, LocationWrite,
    OrderId, OrderSnapshot, Position, RoleField, SharedLocation, SnapshotEvent,
    StateUpdateSender, StoreError, SubscriptionId, WatchId, WatchOptions, prelude::*,
};

/// Registration calls made against the mocks, in the order they happened
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Watch(WatchId),
    ClearWatch(WatchId),
    Subscribe(OrderId, SubscriptionId),
    Unsubscribe(SubscriptionId),
}

pub type CallLog = Arc<Mutex<Vec<Call>>>;

pub struct MockGeolocation {
    supported: bool,
    next_id: AtomicU64,
    watches: Mutex<HashMap<WatchId, mpsc::Sender<GeolocationEvent>>>,
    log: CallLog,
}

impl MockGeolocation {
    pub fn new(log: CallLog) -> Self {
        Self {
            supported: true,
            next_id: AtomicU64::new(1),
            watches: Mutex::new(HashMap::new()),
            log,
        }
    }

    pub fn unsupported(log: CallLog) -> Self {
        Self {
            supported: false,
            ..Self::new(log)
        }
    }

    pub fn active_watches(&self) -> usize {
        self.watches.lock().unwrap().len()
    }

    /// Deliver an event to every active watch
    pub async fn emit(&self, event: GeolocationEvent) {
        let senders = self
            .watches
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect::<Vec<_>>();
        for tx in senders {
            tx.send(event.clone()).await.ok();
        }
    }

    pub async fn fix(&self, lat: f64, lng: f64) {
        self.emit(GeolocationEvent::Position(Position::new(lat, lng, 5.0)))
            .await;
    }

    pub async fn fail(&self, err: GeolocationError) {
        self.emit(GeolocationEvent::Error(err)).await;
    }
}

impl GeolocationProvider for MockGeolocation {
    fn is_supported(&self) -> bool {
        self.supported
    }

    fn watch_position(
        &self,
        _options: WatchOptions,
        events: mpsc::Sender<GeolocationEvent>,
    ) -> Result<WatchId> {
        let id = WatchId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.watches.lock().unwrap().insert(id, events);
        self.log.lock().unwrap().push(Call::Watch(id));
        Ok(id)
    }

    fn clear_watch(&self, id: WatchId) {
        self.watches.lock().unwrap().remove(&id);
        self.log.lock().unwrap().push(Call::ClearWatch(id));
    }
}

type Subscriber = (OrderId, mpsc::Sender<SnapshotEvent>);

pub struct MockStore {
    records: Mutex<HashMap<OrderId, OrderSnapshot>>,
    subscribers: Mutex<HashMap<SubscriptionId, Subscriber>>,
    next_id: AtomicU64,
    write_attempts: AtomicUsize,
    fail_subscribe: AtomicBool,
    log: CallLog,
}

impl MockStore {
    pub fn new(log: CallLog) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            write_attempts: AtomicUsize::new(0),
            fail_subscribe: AtomicBool::new(false),
            log,
        }
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    pub fn active_subscriptions(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    pub fn write_attempts(&self) -> usize {
        self.write_attempts.load(Ordering::SeqCst)
    }

    pub fn field(&self, order: &OrderId, field: RoleField) -> Option<SharedLocation> {
        self.records
            .lock()
            .unwrap()
            .get(order)
            .and_then(|r| r.field(field).copied())
    }

    pub async fn create_order(&self, order: &OrderId) {
        let snapshot = OrderSnapshot::new(order.clone(), Utc::now());
        self.records
            .lock()
            .unwrap()
            .insert(order.clone(), snapshot.clone());
        self.notify(order, Ok(Some(snapshot))).await;
    }

    /// Publish a location as if the other party wrote it
    pub async fn partner_writes(&self, order: &OrderId, field: RoleField, lat: f64, lng: f64) {
        let write = LocationWrite {
            lat,
            lng,
            accuracy: 5.0,
        };
        self.write_location(order, field, write)
            .await
            .expect("Order should exist");
    }

    /// Push an arbitrary event to the subscribers of an order
    pub async fn notify(&self, order: &OrderId, event: SnapshotEvent) {
        let senders = self
            .subscribers
            .lock()
            .unwrap()
            .values()
            .filter(|(o, _)| o == order)
            .map(|(_, tx)| tx.clone())
            .collect::<Vec<_>>();
        for tx in senders {
            tx.send(event.clone()).await.ok();
        }
    }

    /// End every subscription from the store side
    pub fn drop_subscribers(&self) {
        self.subscribers.lock().unwrap().clear();
    }
}

impl LocationStore for MockStore {
    async fn write_location(
        &self,
        order: &OrderId,
        field: RoleField,
        location: LocationWrite,
    ) -> Result<(), StoreError> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        let snapshot = {
            let mut records = self.records.lock().unwrap();
            let record = records.get_mut(order).ok_or(StoreError::NotFound)?;
            *record.field_mut(field) = Some(SharedLocation::stamped(location, Utc::now()));
            record.clone()
        };
        self.notify(order, Ok(Some(snapshot))).await;
        Ok(())
    }

    async fn subscribe(
        &self,
        order: &OrderId,
        snapshots: mpsc::Sender<SnapshotEvent>,
    ) -> Result<SubscriptionId, StoreError> {
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("mock refused".to_string()));
        }
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let current = self.records.lock().unwrap().get(order).cloned();
        self.subscribers
            .lock()
            .unwrap()
            .insert(id, (order.clone(), snapshots.clone()));
        self.log
            .lock()
            .unwrap()
            .push(Call::Subscribe(order.clone(), id));
        snapshots.send(Ok(current)).await.ok();
        Ok(id)
    }

    async fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.lock().unwrap().remove(&id);
        self.log.lock().unwrap().push(Call::Unsubscribe(id));
    }
}

pub struct DummySender;

impl StateUpdateSender for DummySender {
    fn send_update(&self) {}
}

#[derive(Default, Clone)]
pub struct CountingSender(pub Arc<AtomicUsize>);

impl CountingSender {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

impl StateUpdateSender for CountingSender {
    fn send_update(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}
