//! Models related to breakpoints and in-flight content editing.

use crate::models::rules::{Direction, RuleTarget};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Field of the exchange a breakpoint pattern is tested against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchOn {
    Url,
    Body,
    Header,
}

/// Breakpoint rule supplied by the embedding application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Breakpoint {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub enabled: bool,
    /// Substring, or a regex when `is_regex` is set
    pub pattern: String,
    #[serde(default)]
    pub is_regex: bool,
    pub target: RuleTarget,
    pub match_on: MatchOn,
    /// Header inspected when `match_on` is `header`
    #[serde(default)]
    pub header_name: Option<String>,
}

impl Breakpoint {
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Published when traffic is suspended at a breakpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointHit {
    pub breakpoint_id: String,
    pub event_id: String,
    #[serde(rename = "type")]
    pub direction: Direction,
    pub content: String,
    pub headers: HashMap<String, String>,
    pub breakpoint_name: String,
    pub timeout_ms: u64,
}

/// How a suspended exchange resumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakpointResolution {
    pub content: String,
    pub cancelled: bool,
}

/// Key of a pending breakpoint: one per exchange and direction.
pub fn breakpoint_id(event_id: &str, direction: Direction) -> String {
    format!("bp-{}-{}", event_id, direction.as_str())
}
