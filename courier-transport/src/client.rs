use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use futures::StreamExt;
use log::{debug, error, info, warn};
use reqwest::{Response, StatusCode};
use tokio::{net::TcpStream, sync::mpsc};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message as WsMessage,
};
use tokio_util::sync::CancellationToken;

use courier_logic::{
    LocationStore, LocationWrite, OrderId, OrderSnapshot, OrderStatus, RoleField, SnapshotEvent,
    StoreError, SubscriptionId, prelude::*,
};

use crate::endpoint::Endpoint;

type SnapshotSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Cancel token of every live subscription, a forwarder removes its own entry when it ends
type SubscriptionMap = Arc<Mutex<HashMap<SubscriptionId, CancellationToken>>>;

/// Talks to a `courier-store` server. Writes are plain HTTP requests, every subscription
/// holds its own websocket that the server pushes full records down.
pub struct StoreClient {
    endpoint: Endpoint,
    http: reqwest::Client,
    next_id: AtomicU64,
    subscriptions: SubscriptionMap,
}

fn connection_error(why: impl ToString) -> StoreError {
    StoreError::Connection(why.to_string())
}

fn check_status(resp: Response) -> Result<Response, StoreError> {
    match resp.status() {
        status if status.is_success() => Ok(resp),
        StatusCode::NOT_FOUND => Err(StoreError::NotFound),
        status => Err(StoreError::Rejected(status.to_string())),
    }
}

fn decode_snapshot(raw: &str) -> SnapshotEvent {
    serde_json::from_str::<Option<OrderSnapshot>>(raw)
        .map_err(|why| StoreError::Decode(why.to_string()))
}

impl StoreClient {
    /// Client for the store this build was compiled against
    pub fn new() -> Result<Self> {
        Endpoint::compiled().and_then(Self::with_endpoint)
    }

    /// Client for the store at `base_url`, e.g. `http://127.0.0.1:3537`
    pub fn with_base_url(base_url: &str) -> Result<Self> {
        Endpoint::parse(base_url).and_then(Self::with_endpoint)
    }

    fn with_endpoint(endpoint: Endpoint) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            endpoint,
            http,
            next_id: AtomicU64::new(1),
            subscriptions: SubscriptionMap::default(),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Create an order with an id picked by the server
    pub async fn create_order(&self) -> Result<OrderSnapshot> {
        let url = self.endpoint.http(&["orders"]);
        self.http
            .post(url)
            .send()
            .await
            .context("Could not send request")?
            .error_for_status()
            .context("Server returned error")?
            .json()
            .await
            .context("Invalid order from server")
    }

    /// Create an order with a chosen id, fails if it's taken
    pub async fn create_order_with_id(&self, id: &OrderId) -> Result<OrderSnapshot> {
        let url = self.endpoint.http(&["orders", id.as_str()]);
        self.http
            .put(url)
            .send()
            .await
            .context("Could not send request")?
            .error_for_status()
            .with_context(|| format!("Couldn't create order {id}"))?
            .json()
            .await
            .context("Invalid order from server")
    }

    /// Fetch an order once, `None` if it doesn't exist
    pub async fn get_order(&self, id: &OrderId) -> Result<Option<OrderSnapshot>> {
        let url = self.endpoint.http(&["orders", id.as_str()]);
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .context("Could not send request")?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        resp.error_for_status()
            .context("Server returned error")?
            .json()
            .await
            .map(Some)
            .context("Invalid order from server")
    }

    pub async fn set_status(&self, id: &OrderId, status: OrderStatus) -> Result<OrderSnapshot> {
        let url = self
            .endpoint
            .http(&["orders", id.as_str(), "status", status.as_str()]);
        self.http
            .post(url)
            .send()
            .await
            .context("Could not send request")?
            .error_for_status()
            .with_context(|| format!("Couldn't move order {id} to {}", status.as_str()))?
            .json()
            .await
            .context("Invalid order from server")
    }

    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions.lock().unwrap().len()
    }
}

impl LocationStore for StoreClient {
    async fn write_location(
        &self,
        order: &OrderId,
        field: RoleField,
        location: LocationWrite,
    ) -> Result<(), StoreError> {
        let url = self
            .endpoint
            .http(&["orders", order.as_str(), field.field_name()]);
        let resp = self
            .http
            .patch(url)
            .json(&location)
            .send()
            .await
            .map_err(connection_error)?;
        check_status(resp).map(|_| ())
    }

    async fn subscribe(
        &self,
        order: &OrderId,
        snapshots: mpsc::Sender<SnapshotEvent>,
    ) -> Result<SubscriptionId, StoreError> {
        let url = self.endpoint.ws(&["orders", order.as_str(), "subscribe"]);
        let (socket, _) = connect_async(url.as_str())
            .await
            .map_err(connection_error)?;

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let cancel = CancellationToken::new();
        self.subscriptions
            .lock()
            .unwrap()
            .insert(id, cancel.clone());

        info!("Subscribed to order {order} ({id:?})");
        let subscriptions = self.subscriptions.clone();
        let order = order.clone();
        tokio::spawn(async move {
            forward_snapshots(&order, socket, snapshots, cancel).await;
            subscriptions.lock().unwrap().remove(&id);
        });

        Ok(id)
    }

    async fn unsubscribe(&self, id: SubscriptionId) {
        if let Some(cancel) = self.subscriptions.lock().unwrap().remove(&id) {
            cancel.cancel();
        }
    }
}

impl Drop for StoreClient {
    fn drop(&mut self) {
        if let Ok(subscriptions) = self.subscriptions.lock() {
            for cancel in subscriptions.values() {
                cancel.cancel();
            }
        }
    }
}

/// Pump records off the socket into the relay until cancelled, the relay stops listening,
/// or the server goes away. Losing the server is reported once as a connection error.
async fn forward_snapshots(
    order: &OrderId,
    mut socket: SnapshotSocket,
    snapshots: mpsc::Sender<SnapshotEvent>,
    cancel: CancellationToken,
) {
    loop {
        let (event, last) = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                if let Err(why) = socket.close(None).await {
                    debug!("Couldn't close subscription to {order} cleanly: {why:?}");
                }
                break;
            }

            _ = snapshots.closed() => break,

            msg = socket.next() => match msg {
                Some(Ok(WsMessage::Text(raw))) => {
                    let event = decode_snapshot(raw.as_str());
                    if let Err(why) = &event {
                        warn!("Bad record for order {order}: {why}");
                    }
                    (event, false)
                }
                Some(Ok(WsMessage::Close(_))) | None => {
                    (Err(connection_error("Store closed the subscription")), true)
                }
                Some(Ok(_)) => continue,
                Some(Err(why)) => {
                    error!("Subscription to {order} failed: {why:?}");
                    (Err(connection_error(why)), true)
                }
            },
        };

        if snapshots.send(event).await.is_err() || last {
            break;
        }
    }

    info!("Subscription to order {order} ended");
}
