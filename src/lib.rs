pub mod access_log;
pub mod config;
pub mod crypto;
pub mod fetcher;
pub mod ingest;
pub mod proxy;
pub mod registry;
pub mod route;
pub mod route_service;
pub mod status;
pub mod varz;

pub use config::Config;
pub use registry::RouteRegistry;
pub use route::{Endpoint, RouteKey};
