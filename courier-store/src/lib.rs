mod state;

use axum::{
    Json, Router,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use courier_logic::{LocationWrite, OrderId, OrderSnapshot, OrderStatus, RoleField};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};

pub use state::{OrderBook, OrderError, OrderFeed};

type HandlerResult<T> = Result<T, StatusCode>;

fn parse_id(raw: &str) -> HandlerResult<OrderId> {
    OrderId::parse(raw).ok_or(StatusCode::BAD_REQUEST)
}

async fn create_order(State(book): State<OrderBook>) -> HandlerResult<impl IntoResponse> {
    let snapshot = book.create_generated()?;
    info!("Created order {}", snapshot.id);
    Ok((StatusCode::CREATED, Json(snapshot)))
}

async fn create_order_with_id(
    State(book): State<OrderBook>,
    Path(raw_id): Path<String>,
) -> HandlerResult<impl IntoResponse> {
    let snapshot = book.create(parse_id(&raw_id)?)?;
    info!("Created order {}", snapshot.id);
    Ok((StatusCode::CREATED, Json(snapshot)))
}

async fn get_order(
    State(book): State<OrderBook>,
    Path(raw_id): Path<String>,
) -> HandlerResult<Json<OrderSnapshot>> {
    let id = parse_id(&raw_id)?;
    book.get(&id).map(Json).ok_or(StatusCode::NOT_FOUND)
}

async fn write_location(
    State(book): State<OrderBook>,
    Path((raw_id, raw_field)): Path<(String, String)>,
    Json(write): Json<LocationWrite>,
) -> HandlerResult<StatusCode> {
    let id = parse_id(&raw_id)?;
    let field = RoleField::from_field_name(&raw_field).ok_or(StatusCode::BAD_REQUEST)?;
    if !(write.lat.is_finite() && write.lng.is_finite()) {
        return Err(StatusCode::UNPROCESSABLE_ENTITY);
    }
    book.write_location(&id, field, write)?;
    debug!("{field} on {id} is now {}, {}", write.lat, write.lng);
    Ok(StatusCode::NO_CONTENT)
}

async fn set_status(
    State(book): State<OrderBook>,
    Path((raw_id, raw_status)): Path<(String, String)>,
) -> HandlerResult<Json<OrderSnapshot>> {
    let id = parse_id(&raw_id)?;
    let status = OrderStatus::parse(&raw_status).ok_or(StatusCode::BAD_REQUEST)?;
    let snapshot = book.set_status(&id, status)?;
    info!("Order {id} is now {}", status.as_str());
    Ok(Json(snapshot))
}

async fn subscribe(
    State(book): State<OrderBook>,
    Path(raw_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    match parse_id(&raw_id) {
        Ok(id) => ws.on_upgrade(move |socket| follow_order(socket, book, id)),
        Err(status) => status.into_response(),
    }
}

async fn follow_order(socket: WebSocket, book: OrderBook, id: OrderId) {
    let feed = book.watch(&id);
    push_snapshots(socket, &id, feed).await;
    book.release(&id);
}

/// Send the current record, then the full record again on every change, until either side
/// goes away. A record that doesn't exist yet is sent as `null`.
async fn push_snapshots(socket: WebSocket, id: &OrderId, mut feed: OrderFeed) {
    info!("Subscriber joined order {id}");

    let (mut sender, mut receiver) = socket.split();

    'feed: loop {
        let snapshot = feed.borrow_and_update().clone();
        let encoded = match serde_json::to_string(&snapshot) {
            Ok(encoded) => encoded,
            Err(why) => {
                warn!("Failed to encode order {id}: {why:?}");
                break;
            }
        };

        if let Err(why) = sender.send(Message::Text(encoded.into())).await {
            debug!("Subscriber of {id} went away: {why:?}");
            break;
        }

        loop {
            tokio::select! {
                changed = feed.changed() => {
                    if changed.is_err() {
                        break 'feed;
                    }
                    break;
                }

                msg = receiver.next() => {
                    match msg {
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break 'feed,
                        // Pings are answered by axum, anything else is ignored
                        Some(Ok(_)) => {}
                    }
                }
            }
        }
    }

    info!("Subscriber left order {id}");
}

pub fn router(book: OrderBook) -> Router {
    Router::new()
        .route("/orders", post(create_order))
        .route("/orders/{id}", get(get_order).put(create_order_with_id))
        .route("/orders/{id}/subscribe", get(subscribe))
        .route("/orders/{id}/status/{status}", post(set_status))
        .route("/orders/{id}/{field}", patch(write_location))
        .with_state(book)
}
