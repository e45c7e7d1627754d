use anyhow::Context;
use courier_store::{OrderBook, router};
use log::info;
use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    result::Result as StdResult,
};

type Result<T = (), E = anyhow::Error> = StdResult<T, E>;

const DEFAULT_PORT: u16 = 3537;

#[tokio::main]
async fn main() -> Result {
    colog::init();

    let args = std::env::args().collect::<Vec<_>>();
    let socket_addr = args
        .get(1)
        .map(|raw_binding| raw_binding.parse::<SocketAddr>())
        .transpose()
        .context("Invalid socket addr passed")?
        .unwrap_or(SocketAddr::new(
            IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            DEFAULT_PORT,
        ));

    let listener = tokio::net::TcpListener::bind(socket_addr)
        .await
        .with_context(|| format!("Failed to bind to {socket_addr}"))?;

    info!(
        "Starting courier order store {} on {socket_addr}",
        env!("CARGO_PKG_VERSION")
    );

    axum::serve(listener, router(OrderBook::default()))
        .await
        .context("Error while running server")
}
