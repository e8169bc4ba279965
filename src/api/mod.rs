//! APInox proxy API
//!
//! Entry points for the embedding application.

pub mod proxy_api;

pub use proxy_api::{get_version, init_core, ProxyService};
