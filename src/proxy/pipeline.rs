//! Per-request pipeline: mock short-circuit, replace rules, breakpoints,
//! upstream dispatch and error synthesis.

use crate::integrations::{
    MockContext, MockRequest, MockResponder, ReplaceApplier, RecordedExchange,
};
use crate::models::{Direction, LogStage, ProxyEvent, ReplaceRule, ServerMode};
use crate::proxy::diagnostics::{self, DiagnosticsRequest};
use crate::proxy::fault::SoapVersion;
use crate::proxy::replace::applicable_rules;
use crate::proxy::server::{InboundRequest, OutboundResponse};
use crate::proxy::state::ProxyState;
use crate::proxy::upstream::{
    self, forward_headers, host_of, join_target_url, lowercase_header_map, method_has_body,
    UpstreamPolicy,
};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

const NO_MOCK_MATCH_BODY: &str = "No matching mock rule";

/// Buffered view of the inbound request shared by the pipeline stages.
struct Exchange<'a> {
    request: &'a InboundRequest,
    headers: HashMap<String, String>,
    body_text: String,
    started: Instant,
}

impl Exchange<'_> {
    fn elapsed_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }
}

/// Produce the client response for one buffered request.
///
/// Never fails: upstream errors become a SOAP fault or a plain-text 500.
pub(crate) async fn handle_request(
    state: &Arc<ProxyState>,
    request: InboundRequest,
) -> OutboundResponse {
    let exchange = Exchange {
        headers: request.header_map(),
        body_text: String::from_utf8_lossy(&request.body).into_owned(),
        started: Instant::now(),
        request: &request,
    };

    let mut event = ProxyEvent::new(
        &request.method,
        &request.path,
        exchange.headers.clone(),
        exchange.body_text.clone(),
    );
    state.events.log(Some(LogStage::Request), &event);

    let result = match serve_from_mock(state, &exchange, &mut event).await {
        Ok(Some(response)) => return response,
        Ok(None) => forward_upstream(state, &exchange, &mut event).await,
        Err(err) => Err(err),
    };

    result.unwrap_or_else(|err| error_response(state, &exchange, &mut event, err))
}

/// Answer from the mock collaborator when the mode allows it.
///
/// `Ok(None)` means the request continues to the upstream.
async fn serve_from_mock(
    state: &ProxyState,
    exchange: &Exchange<'_>,
    event: &mut ProxyEvent,
) -> anyhow::Result<Option<OutboundResponse>> {
    let mode = state.server_mode();
    if !mode.mocks_enabled() {
        return Ok(None);
    }
    let Some(mock) = state.mock() else {
        return Ok(None);
    };

    let request = exchange.request;
    let mock_request = MockRequest {
        method: request.method.clone(),
        url: request.path.clone(),
        headers: exchange.headers.clone(),
        body: exchange.body_text.clone(),
    };

    if let Some(rule) = mock.find_matching_rule(&mock_request) {
        state.events.debug(format!(
            "[ProxyService] Mock rule matched: {} - returning mock response",
            rule.name
        ));
        let context = MockContext {
            event_id: event.id.clone(),
            start_time: event.timestamp,
            method: mock_request.method,
            url: mock_request.url,
            request_headers: mock_request.headers,
            request_body: mock_request.body,
        };
        let response = mock.send_mock_response(&rule, &context).await?;

        event.status = Some(response.status);
        event.response_headers = Some(lowercase_header_map(&response.headers));
        event.response_body = Some(response.body.clone());
        event.duration = Some(exchange.elapsed_secs());
        event.success = Some((200..300).contains(&response.status));
        state.events.log(None, event);

        return Ok(Some(OutboundResponse {
            status: response.status,
            headers: response.headers,
            body: Bytes::from(response.body),
        }));
    }

    if mode == ServerMode::Mock && !mock.settings().passthrough_enabled {
        state
            .events
            .debug("[ProxyService] Mock mode: No matching rule, returning 404");
        event.status = Some(404);
        event.response_body = Some(NO_MOCK_MATCH_BODY.to_string());
        event.duration = Some(exchange.elapsed_secs());
        state.events.log(None, event);
        return Ok(Some(OutboundResponse::text(
            404,
            "text/plain",
            NO_MOCK_MATCH_BODY,
        )));
    }

    Ok(None)
}

async fn forward_upstream(
    state: &Arc<ProxyState>,
    exchange: &Exchange<'_>,
    event: &mut ProxyEvent,
) -> anyhow::Result<OutboundResponse> {
    let request = exchange.request;
    let config = state.config();
    let target_url = join_target_url(&config.target_url, &request.path);
    let (target_host, _) = host_of(&target_url)?;
    let (_, target_authority) = host_of(&config.target_url)?;

    let strict_ssl = state.strict_ssl();
    let proxy_url = state.proxy_url();
    state.events.debug(format!(
        "[Proxy] Request Settings - strictSSL={}, systemProxy={}",
        strict_ssl,
        proxy_url.as_deref().unwrap_or("none")
    ));
    let policy = UpstreamPolicy::resolve(
        &target_host,
        &state.proxy_rules(),
        config.system_proxy_enabled,
        proxy_url,
        strict_ssl,
    );
    if let Some(proxy_url) = &policy.proxy_url {
        state
            .events
            .debug(format!("[Proxy] Using System Proxy: {}", proxy_url));
    }
    let client = state.clients.client_for(&policy)?;

    let mode = state.server_mode();
    let rules = state.replace_rules();
    let replacer = state.replacer();

    let mut request_data = apply_replace_rules(
        state,
        replacer.as_ref(),
        &rules,
        &exchange.body_text,
        Direction::Request,
    );
    if let Some(rule) = state.breakpoints.check(
        mode,
        &target_url,
        &request_data,
        &exchange.headers,
        Direction::Request,
    ) {
        let resolution = state
            .breakpoints
            .wait(
                &event.id,
                Direction::Request,
                &request_data,
                &exchange.headers,
                &rule,
            )
            .await;
        if !resolution.cancelled {
            request_data = resolution.content;
        }
    }

    let request_body = if request_data == exchange.body_text {
        request.body.clone()
    } else {
        Bytes::from(request_data)
    };
    let outgoing_headers = forward_headers(
        &request.headers,
        &target_authority,
        &request.method,
        request_body.len(),
    );

    state
        .events
        .debug(format!("[Proxy] Sending Request to: {}", target_url));
    let body = method_has_body(&request.method).then_some(request_body);
    let response = upstream::send(
        &client,
        &request.method,
        &target_url,
        &outgoing_headers,
        body,
        None,
    )
    .await?;

    let response_headers = response.header_map();
    let response_text = String::from_utf8_lossy(&response.body).into_owned();
    event.status = Some(response.status);
    event.response_headers = Some(response_headers.clone());
    event.response_body = Some(response_text.clone());
    event.duration = Some(exchange.elapsed_secs());
    event.success = Some((200..300).contains(&response.status));

    if response.status == 503 {
        state
            .events
            .debug("[Proxy] 503 Detected. Running diagnostics...");
        tokio::spawn(diagnostics::run(
            DiagnosticsRequest {
                target_url: target_url.clone(),
                headers: outgoing_headers,
                policy: policy.clone(),
                system_proxy_enabled: config.system_proxy_enabled,
            },
            state.events.clone(),
        ));
    }

    let mut response_data = apply_replace_rules(
        state,
        replacer.as_ref(),
        &rules,
        &response_text,
        Direction::Response,
    );
    if response_data != response_text {
        event.response_body = Some(response_data.clone());
    }
    if let Some(rule) = state.breakpoints.check(
        mode,
        &target_url,
        &response_data,
        &response_headers,
        Direction::Response,
    ) {
        let resolution = state
            .breakpoints
            .wait(
                &event.id,
                Direction::Response,
                &response_data,
                &response_headers,
                &rule,
            )
            .await;
        if !resolution.cancelled {
            response_data = resolution.content;
            event.response_body = Some(response_data.clone());
        }
    }

    let response_body = if response_data == response_text {
        response.body.clone()
    } else {
        Bytes::from(response_data.clone())
    };

    state.events.log(None, event);

    if let Some(mock) = state.mock() {
        record_exchange(
            mock.as_ref(),
            exchange,
            response.status,
            response_headers,
            response_data,
        );
    }

    Ok(OutboundResponse {
        status: response.status,
        headers: response.headers,
        body: response_body,
    })
}

fn apply_replace_rules(
    state: &ProxyState,
    replacer: &dyn ReplaceApplier,
    rules: &[ReplaceRule],
    content: &str,
    direction: Direction,
) -> String {
    if rules.is_empty() {
        return content.to_string();
    }
    let updated = replacer.apply(content, rules, direction);
    if updated != content {
        let names = applicable_rules(rules, direction)
            .map(ReplaceRule::label)
            .collect::<Vec<_>>()
            .join(", ");
        state.events.debug(format!(
            "[Proxy] Applied replace rules to {}: {}",
            direction, names
        ));
    }
    updated
}

fn record_exchange(
    mock: &dyn MockResponder,
    exchange: &Exchange<'_>,
    status: u16,
    response_headers: HashMap<String, String>,
    response_body: String,
) {
    if !mock.settings().record_mode {
        return;
    }
    mock.record_request(RecordedExchange {
        method: exchange.request.method.clone(),
        url: exchange.request.path.clone(),
        request_headers: exchange.headers.clone(),
        request_body: exchange.body_text.clone(),
        status,
        response_headers,
        response_body,
    });
}

fn error_response(
    state: &ProxyState,
    exchange: &Exchange<'_>,
    event: &mut ProxyEvent,
    err: anyhow::Error,
) -> OutboundResponse {
    let message = format!("{:#}", err);
    state
        .events
        .debug(format!("[Proxy] HTTP Request Error: {}", message));

    event.duration = Some(exchange.elapsed_secs());
    event.success = Some(false);
    event.error = Some(message.clone());
    event.status = Some(500);

    let response = match SoapVersion::detect(&exchange.headers) {
        Some(version) => {
            let fault = version.fault(&message);
            event.response_body = Some(fault.clone());
            OutboundResponse::text(500, version.content_type(), fault)
        }
        None => OutboundResponse::text(
            500,
            "text/plain",
            format!("APInox Proxy Error: {}", message),
        ),
    };

    state.events.log(None, event);
    response
}
