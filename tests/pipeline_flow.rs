mod common;

use apinox_proxy_core::integrations::{
    MockContext, MockRequest, MockResponder, MockResponse, MockRuleRef, MockSettings,
    RecordedExchange,
};
use apinox_proxy_core::models::{
    Breakpoint, Direction, LogStage, MatchOn, ReplaceRule, RuleTarget, ServerMode, ServiceEvent,
};
use apinox_proxy_core::ProxyService;
use async_trait::async_trait;
use common::{body_of, local_config, refused_addr, send_raw, spawn_echo_upstream};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

async fn running_service(target_url: String) -> (Arc<ProxyService>, std::net::SocketAddr) {
    let service = Arc::new(ProxyService::new(local_config(target_url)));
    service.start().await.expect("proxy starts");
    let addr = service.local_addr().unwrap();
    (service, addr)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn forwards_to_upstream_with_request_replace_rule() {
    let upstream = spawn_echo_upstream().await;
    let (service, proxy) = running_service(format!("http://{}", upstream)).await;
    service.set_replace_rules(vec![ReplaceRule {
        id: "r1".into(),
        name: Some("rename".into()),
        enabled: true,
        xpath: "//ns:Name".into(),
        match_text: "World".into(),
        replace_with: "Rust".into(),
        target: RuleTarget::Request,
        is_regex: false,
    }]);

    let raw = send_raw(
        proxy,
        "POST",
        "/svc",
        &[("Content-Type", "text/xml")],
        "<ns:Name>World</ns:Name><Other>World</Other>",
    )
    .await;

    assert!(raw.starts_with("HTTP/1.1 200"), "{}", raw);
    assert_eq!(body_of(&raw), "<ns:Name>Rust</ns:Name><Other>World</Other>");
    service.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn request_breakpoint_resumes_with_edited_content() {
    let upstream = spawn_echo_upstream().await;
    let (service, proxy) = running_service(format!("http://{}", upstream)).await;
    service.set_breakpoints(vec![Breakpoint {
        id: "bp1".into(),
        name: Some("pause svc".into()),
        enabled: true,
        pattern: "/svc".into(),
        is_regex: false,
        target: RuleTarget::Request,
        match_on: MatchOn::Url,
        header_name: None,
    }]);
    let mut events = service.subscribe();

    let client = tokio::spawn(send_raw(proxy, "POST", "/svc", &[], "original"));

    let hit = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(ServiceEvent::BreakpointHit(hit)) => break hit,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("breakpoint hit");

    assert_eq!(hit.direction, Direction::Request);
    assert_eq!(hit.content, "original");
    assert_eq!(hit.breakpoint_name, "pause svc");
    assert_eq!(service.pending_breakpoints(), vec![hit.breakpoint_id.clone()]);

    assert!(service.resolve_breakpoint(&hit.breakpoint_id, "edited", false));
    let raw = client.await.unwrap();
    assert_eq!(body_of(&raw), "edited");
    assert!(service.pending_breakpoints().is_empty());
    service.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn breakpoint_times_out_and_forwards_original() {
    let upstream = spawn_echo_upstream().await;
    let service = Arc::new(
        ProxyService::new(local_config(format!("http://{}", upstream)))
            .with_breakpoint_timeout(Duration::from_millis(100)),
    );
    service.start().await.unwrap();
    let proxy = service.local_addr().unwrap();
    service.set_breakpoints(vec![Breakpoint {
        id: "bp1".into(),
        name: None,
        enabled: true,
        pattern: "original".into(),
        is_regex: false,
        target: RuleTarget::Request,
        match_on: MatchOn::Body,
        header_name: None,
    }]);
    let mut events = service.subscribe();

    let raw = send_raw(proxy, "POST", "/svc", &[], "original").await;
    assert_eq!(body_of(&raw), "original");

    let mut timed_out = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, ServiceEvent::BreakpointTimeout { .. }) {
            timed_out = true;
        }
    }
    assert!(timed_out);
    service.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refused_upstream_yields_soap_fault() {
    let target = refused_addr().await;
    let (service, proxy) = running_service(format!("http://{}", target)).await;
    let mut events = service.subscribe();

    let raw = send_raw(
        proxy,
        "POST",
        "/svc",
        &[("Content-Type", "text/xml"), ("SOAPAction", "\"urn:op\"")],
        "<Envelope/>",
    )
    .await;

    assert!(raw.starts_with("HTTP/1.1 500"), "{}", raw);
    assert!(raw.to_ascii_lowercase().contains("content-type: text/xml"));
    assert!(body_of(&raw).contains("<faultstring>APInox Proxy Error</faultstring>"));

    let terminal = loop {
        match events.try_recv() {
            Ok(ServiceEvent::Log { stage: None, event }) => break event,
            Ok(_) => continue,
            Err(err) => panic!("no terminal log: {:?}", err),
        }
    };
    assert_eq!(terminal.success, Some(false));
    assert_eq!(terminal.status, Some(500));
    assert!(terminal.error.is_some());
    service.stop().await;
}

#[derive(Default)]
struct FixedMock {
    recorded: Mutex<Vec<RecordedExchange>>,
}

#[async_trait]
impl MockResponder for FixedMock {
    fn find_matching_rule(&self, request: &MockRequest) -> Option<MockRuleRef> {
        request.url.ends_with("/mocked").then(|| MockRuleRef {
            id: "m1".into(),
            name: "fixed".into(),
        })
    }

    async fn send_mock_response(
        &self,
        _rule: &MockRuleRef,
        _context: &MockContext,
    ) -> anyhow::Result<MockResponse> {
        Ok(MockResponse {
            status: 200,
            headers: vec![("Content-Type".into(), "application/json".into())],
            body: r#"{"mocked":true}"#.into(),
        })
    }

    fn settings(&self) -> MockSettings {
        MockSettings::default()
    }

    fn record_request(&self, exchange: RecordedExchange) {
        self.recorded.lock().unwrap().push(exchange);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn mock_mode_short_circuits_and_rejects_unmatched() {
    let target = refused_addr().await;
    let (service, proxy) = running_service(format!("http://{}", target)).await;
    service.set_mock_service(Some(Arc::new(FixedMock::default())));
    service.set_server_mode(ServerMode::Mock);
    let mut events = service.subscribe();

    let raw = send_raw(proxy, "GET", "/mocked", &[], "").await;
    assert!(raw.starts_with("HTTP/1.1 200"), "{}", raw);
    assert_eq!(body_of(&raw), r#"{"mocked":true}"#);

    let raw = send_raw(proxy, "GET", "/other", &[], "").await;
    assert!(raw.starts_with("HTTP/1.1 404"), "{}", raw);
    assert_eq!(body_of(&raw), "No matching mock rule");

    let mut request_logs = 0;
    while let Ok(event) = events.try_recv() {
        if let ServiceEvent::Log {
            stage: Some(LogStage::Request),
            ..
        } = event
        {
            request_logs += 1;
        }
    }
    assert_eq!(request_logs, 2);
    service.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn response_replace_and_breakpoint_rewrite_upstream_body() {
    let upstream = spawn_echo_upstream().await;
    let (service, proxy) = running_service(format!("http://{}", upstream)).await;
    service.set_replace_rules(vec![ReplaceRule {
        id: "r1".into(),
        name: None,
        enabled: true,
        xpath: String::new(),
        match_text: "Hello".into(),
        replace_with: "Hi".into(),
        target: RuleTarget::Response,
        is_regex: false,
    }]);
    service.set_breakpoints(vec![Breakpoint {
        id: "bp1".into(),
        name: None,
        enabled: true,
        pattern: "Hi".into(),
        is_regex: false,
        target: RuleTarget::Response,
        match_on: MatchOn::Body,
        header_name: None,
    }]);
    let mut events = service.subscribe();

    let client = tokio::spawn(send_raw(
        proxy,
        "POST",
        "/greet",
        &[],
        "<Greeting>Hello</Greeting>",
    ));

    let hit = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(ServiceEvent::BreakpointHit(hit)) => break hit,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("response breakpoint hit");

    assert_eq!(hit.direction, Direction::Response);
    assert_eq!(hit.content, "<Greeting>Hi</Greeting>");
    assert!(service.resolve_breakpoint(&hit.breakpoint_id, "<Greeting>Edited</Greeting>", false));

    let raw = client.await.unwrap();
    assert!(raw.starts_with("HTTP/1.1 200"), "{}", raw);
    assert_eq!(body_of(&raw), "<Greeting>Edited</Greeting>");

    let terminal = loop {
        match events.try_recv() {
            Ok(ServiceEvent::Log { stage: None, event }) => break event,
            Ok(_) | Err(tokio::sync::broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(err) => panic!("no terminal log: {:?}", err),
        }
    };
    assert_eq!(
        terminal.response_body.as_deref(),
        Some("<Greeting>Edited</Greeting>")
    );
    assert_eq!(terminal.status, Some(200));
    service.stop().await;
}

struct RecordingMock {
    recorded: Mutex<Vec<RecordedExchange>>,
}

#[async_trait]
impl MockResponder for RecordingMock {
    fn find_matching_rule(&self, _request: &MockRequest) -> Option<MockRuleRef> {
        None
    }

    async fn send_mock_response(
        &self,
        _rule: &MockRuleRef,
        _context: &MockContext,
    ) -> anyhow::Result<MockResponse> {
        anyhow::bail!("no rules to answer with")
    }

    fn settings(&self) -> MockSettings {
        MockSettings {
            passthrough_enabled: true,
            record_mode: true,
        }
    }

    fn record_request(&self, exchange: RecordedExchange) {
        self.recorded.lock().unwrap().push(exchange);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn record_mode_captures_final_exchange() {
    let upstream = spawn_echo_upstream().await;
    let (service, proxy) = running_service(format!("http://{}", upstream)).await;
    let mock = Arc::new(RecordingMock {
        recorded: Mutex::new(Vec::new()),
    });
    service.set_mock_service(Some(mock.clone()));
    service.set_replace_rules(vec![ReplaceRule {
        id: "r1".into(),
        name: None,
        enabled: true,
        xpath: String::new(),
        match_text: "ping".into(),
        replace_with: "pong".into(),
        target: RuleTarget::Response,
        is_regex: false,
    }]);

    let raw = send_raw(proxy, "POST", "/rec", &[("Content-Type", "text/plain")], "ping").await;
    assert_eq!(body_of(&raw), "pong");

    let recorded = mock.recorded.lock().unwrap().clone();
    assert_eq!(recorded.len(), 1);
    let exchange = &recorded[0];
    assert_eq!(exchange.method, "POST");
    assert_eq!(exchange.url, "/rec");
    assert_eq!(exchange.request_body, "ping");
    assert_eq!(exchange.status, 200);
    assert_eq!(exchange.response_body, "pong");
    assert_eq!(
        exchange.response_headers.get("content-type").map(String::as_str),
        Some("text/xml")
    );
    service.stop().await;
}
