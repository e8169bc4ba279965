use crate::models::breakpoint::{
    breakpoint_id, Breakpoint, BreakpointHit, BreakpointResolution, MatchOn,
};
use crate::models::{Direction, ServerMode, ServiceEvent};
use crate::proxy::state::{read, write, EventBus};
use dashmap::DashMap;
use regex::Regex;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::oneshot;

pub const BREAKPOINT_TIMEOUT: Duration = Duration::from_millis(45_000);

struct PendingBreakpoint {
    event_id: String,
    direction: Direction,
    resolver: oneshot::Sender<BreakpointResolution>,
}

/// Breakpoint rules plus the registry of exchanges currently suspended.
pub struct BreakpointEngine {
    rules: RwLock<Vec<Breakpoint>>,
    pending: DashMap<String, PendingBreakpoint>,
    events: EventBus,
    timeout: RwLock<Duration>,
}

impl BreakpointEngine {
    pub fn new(events: EventBus, timeout: Duration) -> Self {
        Self {
            rules: RwLock::new(Vec::new()),
            pending: DashMap::new(),
            events,
            timeout: RwLock::new(timeout),
        }
    }

    pub fn timeout(&self) -> Duration {
        *read(&self.timeout)
    }

    pub fn set_timeout(&self, timeout: Duration) {
        *write(&self.timeout) = timeout;
    }

    /// Replace the whole rule set.
    pub fn set_rules(&self, rules: Vec<Breakpoint>) {
        *write(&self.rules) = rules;
    }

    pub fn rules(&self) -> Vec<Breakpoint> {
        read(&self.rules).clone()
    }

    fn rule_matches(
        rule: &Breakpoint,
        url: &str,
        content: &str,
        headers: &HashMap<String, String>,
    ) -> bool {
        let text = match rule.match_on {
            MatchOn::Url => url,
            MatchOn::Body => content,
            MatchOn::Header => match &rule.header_name {
                Some(name) => headers
                    .iter()
                    .find(|(key, _)| key.eq_ignore_ascii_case(name))
                    .map(|(_, value)| value.as_str())
                    .unwrap_or(""),
                None => return false,
            },
        };

        if rule.is_regex {
            match Regex::new(&rule.pattern) {
                Ok(re) => re.is_match(text),
                Err(err) => {
                    tracing::warn!(
                        "Ignoring breakpoint {} with invalid regex: {}",
                        rule.label(),
                        err
                    );
                    false
                }
            }
        } else {
            text.contains(&rule.pattern)
        }
    }

    /// First enabled rule (in registration order) matching this exchange.
    ///
    /// Always `None` in `mock` and `off` modes.
    pub fn check(
        &self,
        mode: ServerMode,
        url: &str,
        content: &str,
        headers: &HashMap<String, String>,
        direction: Direction,
    ) -> Option<Breakpoint> {
        if !mode.breakpoints_enabled() {
            return None;
        }

        let hit = read(&self.rules)
            .iter()
            .filter(|rule| rule.enabled && rule.target.applies_to(direction))
            .find(|rule| Self::rule_matches(rule, url, content, headers))
            .cloned();
        if let Some(rule) = &hit {
            self.events.debug(format!(
                "[ProxyService] Breakpoint hit: {} on {}",
                rule.label(),
                direction
            ));
        }
        hit
    }

    /// Suspend until the breakpoint is resolved or times out.
    ///
    /// On timeout the original content continues unmodified.
    pub async fn wait(
        &self,
        event_id: &str,
        direction: Direction,
        content: &str,
        headers: &HashMap<String, String>,
        rule: &Breakpoint,
    ) -> BreakpointResolution {
        let id = breakpoint_id(event_id, direction);
        let timeout = self.timeout();
        let (tx, mut rx) = oneshot::channel();
        self.pending.insert(
            id.clone(),
            PendingBreakpoint {
                event_id: event_id.to_string(),
                direction,
                resolver: tx,
            },
        );

        self.events.emit(ServiceEvent::BreakpointHit(BreakpointHit {
            breakpoint_id: id.clone(),
            event_id: event_id.to_string(),
            direction,
            content: content.to_string(),
            headers: headers.clone(),
            breakpoint_name: rule.label().to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }));

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(resolution)) => resolution,
            Ok(Err(_)) => {
                // Resolver dropped without answering (pending set cleared)
                self.pending.remove(&id);
                Self::unmodified(content)
            }
            Err(_) => {
                if self.pending.remove(&id).is_none() {
                    // Resolved in the same instant the timer fired
                    if let Ok(resolution) = rx.try_recv() {
                        return resolution;
                    }
                }
                self.events.emit(ServiceEvent::BreakpointTimeout {
                    breakpoint_id: id.clone(),
                });
                self.events.debug(format!(
                    "[ProxyService] Breakpoint {} timed out after {}ms",
                    id,
                    timeout.as_millis()
                ));
                Self::unmodified(content)
            }
        }
    }

    fn unmodified(content: &str) -> BreakpointResolution {
        BreakpointResolution {
            content: content.to_string(),
            cancelled: false,
        }
    }

    /// Resume a suspended exchange. Unknown or already settled ids are ignored.
    pub fn resolve(&self, breakpoint_id: &str, content: String, cancelled: bool) -> bool {
        let Some((_, pending)) = self.pending.remove(breakpoint_id) else {
            return false;
        };
        let _ = pending.resolver.send(BreakpointResolution { content, cancelled });
        self.events.debug(format!(
            "[ProxyService] Breakpoint {} resolved for {} {} (cancelled: {})",
            breakpoint_id, pending.event_id, pending.direction, cancelled
        ));
        true
    }

    pub fn pending_ids(&self) -> Vec<String> {
        self.pending.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Drop every pending entry; their waiters resume with the original content.
    pub fn clear_pending(&self) {
        self.pending.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RuleTarget;
    use std::sync::Arc;

    fn rule(id: &str, pattern: &str, target: RuleTarget, match_on: MatchOn) -> Breakpoint {
        Breakpoint {
            id: id.into(),
            name: None,
            enabled: true,
            pattern: pattern.into(),
            is_regex: false,
            target,
            match_on,
            header_name: None,
        }
    }

    fn engine(timeout: Duration) -> Arc<BreakpointEngine> {
        Arc::new(BreakpointEngine::new(EventBus::default(), timeout))
    }

    fn no_headers() -> HashMap<String, String> {
        HashMap::new()
    }

    #[test]
    fn url_rule_matches_by_substring() {
        let engine = engine(BREAKPOINT_TIMEOUT);
        engine.set_rules(vec![rule("bp-1", "test-endpoint", RuleTarget::Request, MatchOn::Url)]);

        let hit = engine.check(
            ServerMode::Proxy,
            "http://localhost/test-endpoint",
            "",
            &no_headers(),
            Direction::Request,
        );
        assert_eq!(hit.map(|r| r.id), Some("bp-1".to_string()));

        let miss = engine.check(
            ServerMode::Proxy,
            "http://localhost/other",
            "",
            &no_headers(),
            Direction::Request,
        );
        assert!(miss.is_none());
    }

    #[test]
    fn body_rule_and_direction_filtering() {
        let engine = engine(BREAKPOINT_TIMEOUT);
        engine.set_rules(vec![rule("bp-2", "<Secret>", RuleTarget::Request, MatchOn::Body)]);

        let body = "<Secret>Value</Secret>";
        assert!(engine
            .check(ServerMode::Proxy, "http://localhost/", body, &no_headers(), Direction::Request)
            .is_some());
        assert!(engine
            .check(ServerMode::Proxy, "http://localhost/", body, &no_headers(), Direction::Response)
            .is_none());
    }

    #[test]
    fn disabled_rule_never_matches() {
        let engine = engine(BREAKPOINT_TIMEOUT);
        let mut bp = rule("bp-3", "test", RuleTarget::Both, MatchOn::Url);
        bp.enabled = false;
        engine.set_rules(vec![bp]);

        assert!(engine
            .check(ServerMode::Proxy, "http://localhost/test", "", &no_headers(), Direction::Request)
            .is_none());
    }

    #[test]
    fn header_rule_is_case_insensitive_and_regex_capable() {
        let engine = engine(BREAKPOINT_TIMEOUT);
        let mut bp = rule("bp-4", r"^urn:Get\w+$", RuleTarget::Both, MatchOn::Header);
        bp.is_regex = true;
        bp.header_name = Some("SOAPAction".into());
        engine.set_rules(vec![bp]);

        let mut headers = HashMap::new();
        headers.insert("soapaction".to_string(), "urn:GetCustomer".to_string());
        assert!(engine
            .check(ServerMode::Both, "http://x/", "", &headers, Direction::Response)
            .is_some());

        headers.insert("soapaction".to_string(), "urn:Delete".to_string());
        assert!(engine
            .check(ServerMode::Both, "http://x/", "", &headers, Direction::Response)
            .is_none());
    }

    #[test]
    fn first_matching_rule_wins_and_invalid_regex_is_skipped() {
        let engine = engine(BREAKPOINT_TIMEOUT);
        let mut broken = rule("broken", "([", RuleTarget::Both, MatchOn::Url);
        broken.is_regex = true;
        engine.set_rules(vec![
            broken,
            rule("first", "svc", RuleTarget::Both, MatchOn::Url),
            rule("second", "svc", RuleTarget::Both, MatchOn::Url),
        ]);

        let hit = engine
            .check(ServerMode::Proxy, "http://h/svc", "", &no_headers(), Direction::Request)
            .unwrap();
        assert_eq!(hit.id, "first");
    }

    #[test]
    fn mock_and_off_modes_disable_breakpoints() {
        let engine = engine(BREAKPOINT_TIMEOUT);
        engine.set_rules(vec![rule("bp", "svc", RuleTarget::Both, MatchOn::Url)]);
        for mode in [ServerMode::Mock, ServerMode::Off] {
            assert!(engine
                .check(mode, "http://h/svc", "", &no_headers(), Direction::Request)
                .is_none());
        }
    }

    #[tokio::test]
    async fn resolve_resumes_with_edited_content() {
        let engine = engine(BREAKPOINT_TIMEOUT);
        let bp = rule("bp", "svc", RuleTarget::Both, MatchOn::Url);
        let mut events = engine.events.subscribe();

        let waiter = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .wait("evt-1", Direction::Request, "original", &HashMap::new(), &bp)
                    .await
            })
        };

        let hit = loop {
            if let ServiceEvent::BreakpointHit(hit) = events.recv().await.unwrap() {
                break hit;
            }
        };
        assert_eq!(hit.breakpoint_id, "bp-evt-1-request");
        assert_eq!(hit.content, "original");
        assert_eq!(hit.timeout_ms, 45_000);

        assert!(engine.resolve(&hit.breakpoint_id, "new content".into(), false));
        let resolution = waiter.await.unwrap();
        assert_eq!(resolution.content, "new content");
        assert!(!resolution.cancelled);

        // Second resolution of the same id is a no-op
        assert!(!engine.resolve(&hit.breakpoint_id, "again".into(), false));
        assert!(engine.pending_ids().is_empty());
    }

    #[tokio::test]
    async fn cancelled_resolution_is_reported() {
        let engine = engine(BREAKPOINT_TIMEOUT);
        let bp = rule("bp", "svc", RuleTarget::Both, MatchOn::Url);
        let waiter = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .wait("evt-2", Direction::Response, "body", &HashMap::new(), &bp)
                    .await
            })
        };

        while engine.pending_ids().is_empty() {
            tokio::task::yield_now().await;
        }
        engine.resolve("bp-evt-2-response", String::new(), true);
        assert!(waiter.await.unwrap().cancelled);
    }

    #[tokio::test]
    async fn timeout_resumes_with_original_content() {
        let engine = engine(Duration::from_millis(50));
        let bp = rule("bp", "svc", RuleTarget::Both, MatchOn::Url);
        let mut events = engine.events.subscribe();

        let resolution = engine
            .wait("evt-3", Direction::Request, "untouched", &HashMap::new(), &bp)
            .await;
        assert_eq!(resolution.content, "untouched");
        assert!(!resolution.cancelled);
        assert!(engine.pending_ids().is_empty());

        let mut saw_timeout = false;
        while let Ok(event) = events.try_recv() {
            if let ServiceEvent::BreakpointTimeout { breakpoint_id } = event {
                assert_eq!(breakpoint_id, "bp-evt-3-request");
                saw_timeout = true;
            }
        }
        assert!(saw_timeout);
        assert!(!engine.resolve("bp-evt-3-request", "late".into(), false));
    }
}
