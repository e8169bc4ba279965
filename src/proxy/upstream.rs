//! Upstream dispatch: target URL joining, proxy selection, header shaping and
//! the per-call HTTP client.

use crate::models::ProxyRule;
use anyhow::{anyhow, Context};
use bytes::Bytes;
use dashmap::DashMap;
use regex::RegexBuilder;
use std::collections::HashMap;
use std::time::Duration;

/// Sent upstream in place of the client's own user agent.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

const STRIPPED_REQUEST_HEADERS: [&str; 4] = ["transfer-encoding", "connection", "content-length", "host"];

/// Join the configured target base and the inbound request path.
pub fn join_target_url(target_base: &str, path: &str) -> String {
    let base = target_base.trim().strip_suffix('/').unwrap_or(target_base.trim());
    let path = path.strip_prefix('/').unwrap_or(path);
    format!("{}/{}", base, path)
}

/// Glob match of a host name against a proxy rule pattern (`*` matches any
/// run of characters, comparison is case-insensitive).
pub fn matches_rule(host: &str, pattern: &str) -> bool {
    let body = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    match RegexBuilder::new(&format!("^{}$", body))
        .case_insensitive(true)
        .build()
    {
        Ok(re) => re.is_match(host),
        Err(err) => {
            tracing::warn!("Invalid proxy rule pattern '{}': {}", pattern, err);
            false
        }
    }
}

/// How the upstream connection is made for one request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UpstreamPolicy {
    /// Validate the target's (and the proxy's) certificates
    pub strict_ssl: bool,
    /// Proxy to tunnel through, `None` for a direct connection
    pub proxy_url: Option<String>,
}

impl UpstreamPolicy {
    /// Decide between the system proxy and a direct connection. The first
    /// enabled proxy rule matching `host` overrides `system_proxy_enabled`.
    pub fn resolve(
        host: &str,
        rules: &[ProxyRule],
        system_proxy_enabled: bool,
        proxy_url: Option<String>,
        strict_ssl: bool,
    ) -> Self {
        let mut use_proxy = system_proxy_enabled;
        if let Some(rule) = rules
            .iter()
            .filter(|rule| rule.enabled)
            .find(|rule| matches_rule(host, &rule.pattern))
        {
            tracing::debug!("Proxy rule {} matched -> use proxy: {}", rule.pattern, rule.use_proxy);
            use_proxy = rule.use_proxy;
        }

        let proxy_url = match proxy_url {
            Some(url) if use_proxy => Some(url),
            Some(url) => {
                tracing::debug!("Ignoring system proxy {}, direct connection requested", url);
                None
            }
            None => None,
        };

        Self {
            strict_ssl,
            proxy_url,
        }
    }

    /// Build a client scoped to this policy.
    pub fn build_client(&self) -> anyhow::Result<reqwest::Client> {
        let mut client_builder = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(!self.strict_ssl)
            .no_proxy();

        if let Some(proxy_url) = &self.proxy_url {
            let proxy = reqwest::Proxy::all(proxy_url)
                .with_context(|| format!("Invalid proxy URL {}", proxy_url))?;
            client_builder = client_builder.proxy(proxy);
        }

        client_builder
            .build()
            .context("Failed to build upstream HTTP client")
    }
}

/// Upstream clients reused across requests, one per distinct policy, so
/// connections to the target are pooled.
#[derive(Default)]
pub struct UpstreamClients {
    clients: DashMap<UpstreamPolicy, reqwest::Client>,
}

impl UpstreamClients {
    pub fn client_for(&self, policy: &UpstreamPolicy) -> anyhow::Result<reqwest::Client> {
        if let Some(client) = self.clients.get(policy) {
            return Ok(client.clone());
        }
        let client = policy.build_client()?;
        Ok(self
            .clients
            .entry(policy.clone())
            .or_insert(client)
            .clone())
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Drop pooled connections, e.g. when the listener stops.
    pub fn clear(&self) {
        self.clients.clear();
    }
}

/// Host (with port when present) of an absolute URL.
pub fn host_of(url: &str) -> anyhow::Result<(String, String)> {
    let parsed = reqwest::Url::parse(url).with_context(|| format!("Invalid URL '{}'", url))?;
    let hostname = parsed
        .host_str()
        .ok_or_else(|| anyhow!("URL '{}' has no host", url))?
        .to_string();
    let authority = match parsed.port() {
        Some(port) => format!("{}:{}", hostname, port),
        None => hostname.clone(),
    };
    Ok((hostname, authority))
}

pub fn method_has_body(method: &str) -> bool {
    !(method.eq_ignore_ascii_case("GET") || method.eq_ignore_ascii_case("HEAD"))
}

/// Header set sent upstream: sizing/hop-by-hop headers are replaced with
/// values computed for the target and the (possibly rewritten) body.
pub fn forward_headers(
    inbound: &[(String, String)],
    target_authority: &str,
    method: &str,
    body_len: usize,
) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = inbound
        .iter()
        .filter(|(name, _)| {
            let lower = name.to_ascii_lowercase();
            !STRIPPED_REQUEST_HEADERS.contains(&lower.as_str()) && lower != "user-agent"
        })
        .cloned()
        .collect();

    headers.push(("host".into(), target_authority.to_string()));
    headers.push(("user-agent".into(), BROWSER_USER_AGENT.into()));
    headers.push(("connection".into(), "keep-alive".into()));
    if method_has_body(method) {
        headers.push(("content-length".into(), body_len.to_string()));
    }
    headers
}

/// Fully buffered upstream response.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl UpstreamResponse {
    /// Header map with lowercase names; repeated headers are comma-joined.
    pub fn header_map(&self) -> HashMap<String, String> {
        lowercase_header_map(&self.headers)
    }
}

pub fn lowercase_header_map(headers: &[(String, String)]) -> HashMap<String, String> {
    let mut map: HashMap<String, String> = HashMap::new();
    for (name, value) in headers {
        map.entry(name.to_ascii_lowercase())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.clone());
    }
    map
}

/// Issue one request upstream and buffer the full response.
pub async fn send(
    client: &reqwest::Client,
    method: &str,
    url: &str,
    headers: &[(String, String)],
    body: Option<Bytes>,
    timeout: Option<Duration>,
) -> anyhow::Result<UpstreamResponse> {
    let reqwest_method = reqwest::Method::from_bytes(method.as_bytes())
        .with_context(|| format!("Unsupported method {}", method))?;
    let mut request_builder = client.request(reqwest_method, url);

    for (key, value) in headers {
        if let Ok(header_name) = reqwest::header::HeaderName::try_from(key.as_str()) {
            if let Ok(header_value) = reqwest::header::HeaderValue::from_str(value) {
                request_builder = request_builder.header(header_name, header_value);
            }
        }
    }
    if let Some(body) = body {
        request_builder = request_builder.body(body);
    }
    if let Some(timeout) = timeout {
        request_builder = request_builder.timeout(timeout);
    }

    let response = request_builder.send().await?;
    let status = response.status().as_u16();
    let headers = response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).to_string(),
            )
        })
        .collect();
    let body = response.bytes().await?;

    Ok(UpstreamResponse {
        status,
        headers,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(pattern: &str, use_proxy: bool) -> ProxyRule {
        ProxyRule {
            pattern: pattern.into(),
            use_proxy,
            enabled: true,
        }
    }

    #[test]
    fn glob_matching() {
        assert!(matches_rule("api.example.com", "api.*"));
        assert!(!matches_rule("other.com", "api.*"));
        assert!(matches_rule("sub.api.example.com", "*.api.example.com"));
        assert!(matches_rule("API.Example.com", "api.example.com"));
        assert!(!matches_rule("apiXexample.com", "api.example.com"));
        assert!(matches_rule("a+b.com", "a+b.com"));
    }

    #[test]
    fn joins_target_and_path_with_single_slash() {
        assert_eq!(
            join_target_url("http://svc:8080/", "/Service.svc"),
            "http://svc:8080/Service.svc"
        );
        assert_eq!(
            join_target_url("http://svc:8080/base", "orders?id=1"),
            "http://svc:8080/base/orders?id=1"
        );
        assert_eq!(join_target_url("http://svc", "/"), "http://svc/");
    }

    #[test]
    fn first_enabled_rule_decides_proxy_use() {
        let proxy = Some("http://corp-proxy:3128".to_string());
        let mut disabled = rule("*.internal", true);
        disabled.enabled = false;
        let rules = vec![disabled, rule("*.internal", false), rule("*", true)];

        let direct = UpstreamPolicy::resolve("svc.internal", &rules, true, proxy.clone(), true);
        assert_eq!(direct.proxy_url, None);

        let proxied = UpstreamPolicy::resolve("example.com", &rules, false, proxy.clone(), false);
        assert_eq!(proxied.proxy_url, proxy);
        assert!(!proxied.strict_ssl);

        let global_off = UpstreamPolicy::resolve("example.com", &[], false, proxy, true);
        assert_eq!(global_off.proxy_url, None);

        let no_proxy = UpstreamPolicy::resolve("example.com", &rules, true, None, true);
        assert_eq!(no_proxy.proxy_url, None);
        assert!(no_proxy.build_client().is_ok());
    }

    #[test]
    fn clients_are_reused_per_policy() {
        let clients = UpstreamClients::default();
        let strict = UpstreamPolicy {
            strict_ssl: true,
            proxy_url: None,
        };
        let lenient = UpstreamPolicy {
            strict_ssl: false,
            proxy_url: None,
        };

        clients.client_for(&strict).unwrap();
        clients.client_for(&strict).unwrap();
        assert_eq!(clients.len(), 1);

        clients.client_for(&lenient).unwrap();
        assert_eq!(clients.len(), 2);

        clients.clear();
        assert!(clients.is_empty());
    }

    #[test]
    fn forwarded_headers_replace_sizing_and_identity() {
        let inbound = vec![
            ("Host".to_string(), "localhost:9000".to_string()),
            ("Content-Length".to_string(), "3".to_string()),
            ("Transfer-Encoding".to_string(), "chunked".to_string()),
            ("Connection".to_string(), "close".to_string()),
            ("User-Agent".to_string(), "curl/8".to_string()),
            ("SOAPAction".to_string(), "\"urn:Op\"".to_string()),
        ];
        let post = lowercase_header_map(&forward_headers(&inbound, "svc:8080", "POST", 42));
        assert_eq!(post.get("host").map(String::as_str), Some("svc:8080"));
        assert_eq!(post.get("content-length").map(String::as_str), Some("42"));
        assert_eq!(post.get("connection").map(String::as_str), Some("keep-alive"));
        assert_eq!(post.get("user-agent").map(String::as_str), Some(BROWSER_USER_AGENT));
        assert_eq!(post.get("soapaction").map(String::as_str), Some("\"urn:Op\""));
        assert!(!post.contains_key("transfer-encoding"));

        let get = lowercase_header_map(&forward_headers(&inbound, "svc:8080", "GET", 0));
        assert!(!get.contains_key("content-length"));
    }

    #[test]
    fn host_of_keeps_explicit_port() {
        let (host, authority) = host_of("https://svc.example.com:8443/a").unwrap();
        assert_eq!(host, "svc.example.com");
        assert_eq!(authority, "svc.example.com:8443");
        let (_, authority) = host_of("http://svc.example.com/a").unwrap();
        assert_eq!(authority, "svc.example.com");
        assert!(host_of("not a url").is_err());
    }
}
