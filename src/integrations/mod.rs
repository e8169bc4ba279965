//! Collaborators the proxy engine consumes but does not own.
//!
//! The embedding application plugs in its mock engine, notification surface
//! and settings store through these traits.

use crate::models::{Direction, ReplaceRule};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Request as handed to the mock engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MockRequest {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// Rule selected by the mock engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MockRuleRef {
    pub id: String,
    pub name: String,
}

/// Context passed along when the mock engine answers a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MockContext {
    pub event_id: String,
    pub start_time: i64,
    pub method: String,
    pub url: String,
    pub request_headers: HashMap<String, String>,
    pub request_body: String,
}

/// Response generated by the mock engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MockResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MockSettings {
    /// Unmatched requests fall through to the upstream in `mock` mode
    pub passthrough_enabled: bool,
    /// Completed proxy exchanges are captured as new mock rules
    pub record_mode: bool,
}

/// Completed proxy exchange offered for recording.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedExchange {
    pub method: String,
    pub url: String,
    pub request_headers: HashMap<String, String>,
    pub request_body: String,
    pub status: u16,
    pub response_headers: HashMap<String, String>,
    pub response_body: String,
}

/// Mock rule engine.
#[async_trait]
pub trait MockResponder: Send + Sync {
    fn find_matching_rule(&self, request: &MockRequest) -> Option<MockRuleRef>;

    async fn send_mock_response(
        &self,
        rule: &MockRuleRef,
        context: &MockContext,
    ) -> anyhow::Result<MockResponse>;

    fn settings(&self) -> MockSettings;

    fn record_request(&self, exchange: RecordedExchange);
}

/// Text substitution engine for replace rules.
pub trait ReplaceApplier: Send + Sync {
    fn apply(&self, content: &str, rules: &[ReplaceRule], direction: Direction) -> String;
}

/// User-facing error surface.
pub trait Notifier: Send + Sync {
    fn show_error(&self, message: &str);
}

/// Application settings the proxy reads per request.
pub trait SettingsProvider: Send + Sync {
    /// `None` means "not configured"; the proxy then validates certificates
    fn strict_ssl(&self) -> Option<bool>;

    fn proxy_url(&self) -> Option<String>;
}
