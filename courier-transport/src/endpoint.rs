use anyhow::{anyhow, bail};
use reqwest::Url;

use courier_logic::prelude::*;

const fn server_host() -> &'static str {
    if let Some(host) = option_env!("STORE_SERVER_HOST") {
        host
    } else {
        "localhost"
    }
}

const fn server_port() -> u16 {
    if let Some(port) = option_env!("STORE_SERVER_PORT") {
        const_str::parse!(port, u16)
    } else {
        3537
    }
}

const fn server_secure() -> bool {
    if let Some(secure) = option_env!("STORE_SERVER_SECURE") {
        const_str::eq_ignore_ascii_case!(secure, "true") || const_str::equal!(secure, "1")
    } else {
        false
    }
}

const fn server_http_proto() -> &'static str {
    if server_secure() { "https" } else { "http" }
}

const SERVER_HOST: &str = server_host();
const SERVER_PORT: u16 = server_port();
const SERVER_HTTP_PROTO: &str = server_http_proto();

const SERVER_SOCKET: &str = const_str::concat!(SERVER_HOST, ":", SERVER_PORT);

/// Store address baked in at compile time
pub const SERVER_HTTP_URL: &str = const_str::concat!(SERVER_HTTP_PROTO, "://", SERVER_SOCKET);

/// Where a store lives, one base URL for plain requests and one for subscriptions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    http: Url,
    ws: Url,
}

impl Endpoint {
    /// Build from an `http://` or `https://` base, the websocket base follows its scheme
    pub fn parse(http_base: &str) -> Result<Self> {
        let http = Url::parse(http_base).context("Invalid store URL")?;

        let ws_scheme = match http.scheme() {
            "http" => "ws",
            "https" => "wss",
            other => bail!("Unsupported store URL scheme {other}"),
        };

        if http.cannot_be_a_base() {
            bail!("Store URL {http_base} can't be used as a base");
        }

        let mut ws = http.clone();
        ws.set_scheme(ws_scheme)
            .map_err(|_| anyhow!("Couldn't switch {http_base} to {ws_scheme}"))?;

        Ok(Self { http, ws })
    }

    fn join(base: &Url, segments: &[&str]) -> Url {
        let mut url = base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// The store this build was compiled against
    pub fn compiled() -> Result<Self> {
        Self::parse(SERVER_HTTP_URL)
    }

    pub fn http(&self, segments: &[&str]) -> Url {
        Self::join(&self.http, segments)
    }

    pub fn ws(&self, segments: &[&str]) -> Url {
        Self::join(&self.ws, segments)
    }
}
