//! HTTP/HTTPS proxy engine
//!
//! The listener accepts client connections, the server module frames
//! HTTP/1.1 on them and the pipeline decides per request whether to mock,
//! pause, rewrite or forward it.

pub mod breakpoints;
pub mod cert_manager;
pub mod diagnostics;
pub mod fault;
pub mod listener;
pub mod pipeline;
pub mod replace;
pub mod server;
pub mod state;
pub mod upstream;

pub use breakpoints::{BreakpointEngine, BREAKPOINT_TIMEOUT};
pub use cert_manager::{CertManager, CertificatePair};
pub use fault::{create_soap_fault, SoapVersion};
pub use listener::StartError;
pub use replace::XmlReplaceApplier;
pub use server::MAX_REQUEST_BODY_BYTES;
pub use state::EventBus;
pub use upstream::matches_rule;
