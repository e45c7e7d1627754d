use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use axum::http::StatusCode;
use chrono::Utc;
use courier_logic::{
    LocationWrite, OrderId, OrderSnapshot, OrderStatus, RoleField, SharedLocation,
};
use tokio::sync::watch;

pub type StateObj<T> = Arc<Mutex<T>>;

/// Latest version of an order, `None` until the order is created
pub type OrderFeed = watch::Receiver<Option<OrderSnapshot>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderError {
    /// Order already exists
    Exists,
    /// Order was not found
    NotFound,
    /// Couldn't find a free order id
    NoFreeIds,
}

impl From<OrderError> for StatusCode {
    fn from(val: OrderError) -> Self {
        match val {
            OrderError::Exists => StatusCode::CONFLICT,
            OrderError::NotFound => StatusCode::NOT_FOUND,
            OrderError::NoFreeIds => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

const ORDER_ID_PREFIX: &str = "EG-";
const ORDER_ID_CHAR_POOL: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ1234567890";
const ORDER_ID_LEN: usize = 6;
const MAX_ID_TRIES: usize = 25;

/// Every order record the server knows about. Each order has a watch channel that
/// subscribers follow, created on first use so a subscriber may show up before the order.
#[derive(Default, Debug, Clone)]
pub struct OrderBook {
    orders: StateObj<HashMap<OrderId, watch::Sender<Option<OrderSnapshot>>>>,
}

impl OrderBook {
    fn random_order_id() -> Option<OrderId> {
        let suffix = (0..ORDER_ID_LEN)
            .map(|_| ORDER_ID_CHAR_POOL[rand::random_range(0..ORDER_ID_CHAR_POOL.len())] as char)
            .collect::<String>();
        OrderId::parse(&format!("{ORDER_ID_PREFIX}{suffix}"))
    }

    fn exists(&self, id: &OrderId) -> bool {
        self.orders
            .lock()
            .unwrap()
            .get(id)
            .is_some_and(|feed| feed.borrow().is_some())
    }

    /// Create an order with a generated id
    pub fn create_generated(&self) -> Result<OrderSnapshot, OrderError> {
        for _ in 0..MAX_ID_TRIES {
            if let Some(id) = Self::random_order_id().filter(|id| !self.exists(id)) {
                return self.create(id);
            }
        }
        Err(OrderError::NoFreeIds)
    }

    /// Create an order with the given id, fails if it already exists
    pub fn create(&self, id: OrderId) -> Result<OrderSnapshot, OrderError> {
        let mut orders = self.orders.lock().unwrap();
        let feed = orders
            .entry(id.clone())
            .or_insert_with(|| watch::channel(None).0);

        if feed.borrow().is_some() {
            return Err(OrderError::Exists);
        }

        let snapshot = OrderSnapshot::new(id, Utc::now());
        feed.send_replace(Some(snapshot.clone()));
        Ok(snapshot)
    }

    pub fn get(&self, id: &OrderId) -> Option<OrderSnapshot> {
        self.orders
            .lock()
            .unwrap()
            .get(id)
            .and_then(|feed| feed.borrow().clone())
    }

    /// Apply a change to an existing order and notify subscribers
    fn update(
        &self,
        id: &OrderId,
        f: impl FnOnce(&mut OrderSnapshot),
    ) -> Result<OrderSnapshot, OrderError> {
        let orders = self.orders.lock().unwrap();
        let feed = orders.get(id).ok_or(OrderError::NotFound)?;

        let mut updated = None;
        feed.send_if_modified(|current| {
            if let Some(snapshot) = current {
                f(snapshot);
                updated = Some(snapshot.clone());
                true
            } else {
                false
            }
        });

        updated.ok_or(OrderError::NotFound)
    }

    /// Write a role field, stamped with the server clock
    pub fn write_location(
        &self,
        id: &OrderId,
        field: RoleField,
        write: LocationWrite,
    ) -> Result<OrderSnapshot, OrderError> {
        let stamped = SharedLocation::stamped(write, Utc::now());
        self.update(id, |snapshot| *snapshot.field_mut(field) = Some(stamped))
    }

    pub fn set_status(&self, id: &OrderId, status: OrderStatus) -> Result<OrderSnapshot, OrderError> {
        self.update(id, |snapshot| snapshot.status = status)
    }

    /// Follow an order, works for orders that don't exist yet
    pub fn watch(&self, id: &OrderId) -> OrderFeed {
        self.orders
            .lock()
            .unwrap()
            .entry(id.clone())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    /// Forget the feed of an order that was never created once nobody follows it
    pub fn release(&self, id: &OrderId) {
        let mut orders = self.orders.lock().unwrap();
        if orders
            .get(id)
            .is_some_and(|feed| feed.borrow().is_none() && feed.receiver_count() == 0)
        {
            orders.remove(id);
        }
    }

    pub fn len(&self) -> usize {
        self.orders
            .lock()
            .unwrap()
            .values()
            .filter(|feed| feed.borrow().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
