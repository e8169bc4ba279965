//! Proxy traffic events.
//!
//! One `ProxyEvent` is built per request/response cycle and published through
//! the service event bus at its terminal point.

use crate::models::breakpoint::BreakpointHit;
use chrono::{Local, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single proxied exchange as seen by observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyEvent {
    /// Unique per request
    pub id: String,
    /// Milliseconds since epoch
    pub timestamp: i64,
    pub timestamp_label: String,
    pub method: String,
    /// Path and query as received
    pub url: String,
    pub request_headers: HashMap<String, String>,
    pub request_body: String,
    pub status: Option<u16>,
    pub response_headers: Option<HashMap<String, String>>,
    pub response_body: Option<String>,
    /// Seconds
    pub duration: Option<f64>,
    pub success: Option<bool>,
    pub error: Option<String>,
}

impl ProxyEvent {
    pub fn new(
        method: &str,
        url: &str,
        request_headers: HashMap<String, String>,
        request_body: String,
    ) -> Self {
        let timestamp = Utc::now().timestamp_millis();
        Self {
            id: new_event_id(timestamp),
            timestamp,
            timestamp_label: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            method: method.to_string(),
            url: url.to_string(),
            request_headers,
            request_body,
            status: None,
            response_headers: None,
            response_body: None,
            duration: None,
            success: None,
            error: None,
        }
    }
}

fn new_event_id(timestamp: i64) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(9)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();
    format!("proxy-{}-{}", timestamp, suffix)
}

/// Marks the early `log` emitted before any processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStage {
    Request,
}

/// Everything the service publishes to subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "payload", rename_all = "camelCase")]
pub enum ServiceEvent {
    /// Listener running state changed
    Status(bool),
    /// Traffic log; `stage` is set for the in-flight request notification
    Log {
        stage: Option<LogStage>,
        event: ProxyEvent,
    },
    DebugLog(String),
    BreakpointHit(BreakpointHit),
    #[serde(rename_all = "camelCase")]
    BreakpointTimeout {
        breakpoint_id: String,
    },
}
