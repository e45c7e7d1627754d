use tokio::sync::mpsc;

use crate::{
    error::StoreError,
    location::LocationWrite,
    order::{OrderId, OrderSnapshot, RoleField},
};

/// A snapshot pushed by a subscription, `Ok(None)` means the record doesn't exist yet
pub type SnapshotEvent = Result<Option<OrderSnapshot>, StoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Handle for an active subscription, pass back to [LocationStore::unsubscribe]
pub struct SubscriptionId(pub u64);

/// The shared order record store. Each party writes only its own role field and
/// watches the whole record.
pub trait LocationStore: Send + Sync {
    /// Write a role field, the store stamps the update time. Fails with
    /// [StoreError::NotFound] if the order record doesn't exist.
    fn write_location(
        &self,
        order: &OrderId,
        field: RoleField,
        location: LocationWrite,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
    /// Start pushing the full record into `snapshots` on every change. Keeps going until
    /// [LocationStore::unsubscribe] is called or the receiver is dropped.
    fn subscribe(
        &self,
        order: &OrderId,
        snapshots: mpsc::Sender<SnapshotEvent>,
    ) -> impl Future<Output = Result<SubscriptionId, StoreError>> + Send;
    /// Stop a subscription, unknown ids are ignored
    fn unsubscribe(&self, id: SubscriptionId) -> impl Future<Output = ()> + Send;
}
