mod client;
mod endpoint;

pub use client::StoreClient;
pub use endpoint::{Endpoint, SERVER_HTTP_URL};
