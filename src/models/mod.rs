//! Data models for the APInox proxy engine
//!
//! These models are shared with the embedding application and serialise to
//! the camelCase JSON shapes the UI consumes.

pub mod breakpoint;
pub mod config;
pub mod event;
pub mod rules;

pub use breakpoint::*;
pub use config::*;
pub use event::*;
pub use rules::*;
