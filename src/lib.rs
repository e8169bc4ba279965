//! # APInox Proxy Core
//!
//! Intercepting HTTP/HTTPS proxy for SOAP and REST debugging.
//!
//! ## Features
//!
//! - Forwards every request to a configured target, over HTTP or TLS
//! - Self-signed certificate generation for the HTTPS listener
//! - Mock short-circuiting through a pluggable rule engine
//! - XML replace rules on request and response bodies
//! - Request/response breakpoints with edit and resume
//! - SOAP faults for upstream failures, with connectivity diagnostics on 503
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                 Embedding application                    │
//! ├─────────────────────────────────────────────────────────┤
//! │      ProxyService (api)        ServiceEvent broadcast    │
//! ├─────────────────────────────────────────────────────────┤
//! │  ┌──────────┐  ┌──────────┐  ┌──────────┐  ┌─────────┐  │
//! │  │ Listener │──│  Server  │──│ Pipeline │──│Upstream │  │
//! │  │ (TLS)    │  │ (HTTP/1) │  │          │  │(reqwest)│  │
//! │  └──────────┘  └──────────┘  └──────────┘  └─────────┘  │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod api;
pub mod integrations;
pub mod models;
pub mod proxy;

pub use api::{get_version, init_core, ProxyService};
pub use integrations::{MockResponder, Notifier, ReplaceApplier, SettingsProvider};
pub use proxy::{create_soap_fault, matches_rule, CertManager, StartError, XmlReplaceApplier};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
