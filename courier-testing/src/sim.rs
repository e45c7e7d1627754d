use std::{sync::Arc, time::Duration};

use clap::{Parser, Subcommand};
use courier_logic::{
    LocationRelay, OrderId, OrderStatus, Position, RelaySettings, RoleField, StateUpdateSender,
    TrackingView,
};
use courier_test_shared::{LatLng, SimSettings, SimulatedGeolocation, prelude::*};
use courier_transport::{SERVER_HTTP_URL, StoreClient};
use log::info;
use tokio::sync::Notify;

#[derive(Parser)]
struct Cli {
    /// Base URL of the order store
    #[arg(long, default_value = SERVER_HTTP_URL)]
    store: String,

    #[command(subcommand)]
    command: Commands,
}

fn parse_status(raw: &str) -> Result<OrderStatus, String> {
    OrderStatus::parse(raw).ok_or_else(|| {
        let known = OrderStatus::ALL.map(OrderStatus::as_str).join(", ");
        format!("Unknown status, expected one of {known}")
    })
}

#[derive(Subcommand)]
enum Commands {
    /// Create an order
    CreateOrder {
        /// Use this id instead of a generated one
        #[arg(long)]
        id: Option<String>,
    },
    /// Move an order to a new status
    Status {
        id: String,
        #[arg(value_parser = parse_status)]
        status: OrderStatus,
    },
    /// Ride toward a point as the rider of an order
    Ride {
        id: String,
        /// Starting point, as lat,lng
        #[arg(long)]
        from: LatLng,
        /// Destination, as lat,lng
        #[arg(long)]
        to: LatLng,
        /// Time between simulated fixes
        #[arg(long, default_value_t = 200)]
        tick_ms: u64,
        /// Minimum time between two position writes
        #[arg(long, default_value_t = 1000)]
        publish_ms: u64,
        /// Quit once the destination is reached
        #[arg(long)]
        exit_on_arrival: bool,
    },
    /// Share a fixed position as the customer of an order
    Customer {
        id: String,
        /// Where the customer is, as lat,lng
        #[arg(long)]
        at: LatLng,
    },
    /// Print an order record
    Show { id: String },
}

struct UpdateSender(Arc<Notify>);

impl StateUpdateSender for UpdateSender {
    fn send_update(&self) {
        self.0.notify_one();
    }
}

type SimRelay = LocationRelay<SimulatedGeolocation, StoreClient, UpdateSender>;

fn parse_id(raw: &str) -> Result<OrderId> {
    OrderId::parse(raw).context("Order id can't be blank")
}

fn fmt_position(pos: Option<&Position>) -> String {
    pos.map(|p| format!("{:.5},{:.5}", p.lat, p.lng))
        .unwrap_or_else(|| "-".to_string())
}

fn print_view(view: &TrackingView) {
    let eta = view
        .eta
        .map(|eta| format!("{} min ({:.2} km)", eta.minutes, eta.distance_km))
        .unwrap_or_else(|| "-".to_string());
    let mut line = format!(
        "me {} | partner {} | eta {} | permission {:?}",
        fmt_position(view.my_position.as_ref()),
        fmt_position(view.partner_position.as_ref()),
        eta,
        view.permission_state,
    );
    if view.stalled {
        line.push_str(" | stalled");
    }
    if let Some(err) = &view.last_error {
        line.push_str(&format!(" | {err}"));
    }
    println!("{line}");
}

/// Share a position on `order` and print the view whenever it changes
async fn run_relay(
    client: StoreClient,
    order: OrderId,
    self_field: RoleField,
    sim: SimulatedGeolocation,
    settings: RelaySettings,
    exit_on_arrival: bool,
) -> Result {
    let notify = Arc::new(Notify::new());
    let sim = Arc::new(sim);
    let relay: SimRelay = LocationRelay::new(
        settings,
        sim.clone(),
        Arc::new(client),
        UpdateSender(notify.clone()),
    );

    relay
        .start(&order, self_field, self_field.partner())
        .await
        .context("Failed to start relay")?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let mut last = None;

    loop {
        tokio::select! {
            res = &mut ctrl_c => {
                res.context("Failed to listen for Ctrl-C")?;
                info!("Interrupted");
                break;
            }
            _ = notify.notified() => {}
        }

        let view = relay.view();
        if last.as_ref() != Some(&view) {
            print_view(&view);
            last = Some(view);
        }

        if exit_on_arrival && sim.arrived() {
            println!("Arrived");
            // Let the last write land
            tokio::time::sleep(relay.settings().publish_interval).await;
            break;
        }
    }

    relay.stop().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result {
    colog::init();

    let cli = Cli::parse();
    let client = StoreClient::with_base_url(&cli.store).context("Failed to make store client")?;

    match cli.command {
        Commands::CreateOrder { id } => {
            let order = if let Some(id) = id {
                client.create_order_with_id(&parse_id(&id)?).await?
            } else {
                client.create_order().await?
            };
            println!("{}", order.id);
        }
        Commands::Status { id, status } => {
            let order = client.set_status(&parse_id(&id)?, status).await?;
            info!("Order {} is now {}", order.id, order.status.as_str());
        }
        Commands::Show { id } => {
            let id = parse_id(&id)?;
            let order = client
                .get_order(&id)
                .await?
                .with_context(|| format!("Order {id} doesn't exist"))?;
            let pretty = serde_json::to_string_pretty(&order).context("Failed to encode order")?;
            println!("{pretty}");
        }
        Commands::Ride {
            id,
            from,
            to,
            tick_ms,
            publish_ms,
            exit_on_arrival,
        } => {
            let sim_settings = SimSettings {
                tick: Duration::from_millis(tick_ms.max(1)),
                ..Default::default()
            };
            let settings = RelaySettings {
                publish_interval: Duration::from_millis(publish_ms),
                ..Default::default()
            };
            info!("Riding from {from} to {to}");
            let sim = SimulatedGeolocation::travelling(from, to, sim_settings);
            run_relay(
                client,
                parse_id(&id)?,
                RoleField::Rider,
                sim,
                settings,
                exit_on_arrival,
            )
            .await?;
        }
        Commands::Customer { id, at } => {
            info!("Waiting at {at}");
            let sim = SimulatedGeolocation::new(at, SimSettings::default());
            run_relay(
                client,
                parse_id(&id)?,
                RoleField::Customer,
                sim,
                RelaySettings::default(),
                false,
            )
            .await?;
        }
    }

    Ok(())
}
