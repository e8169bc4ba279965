//! Best-effort connectivity probes run after an upstream 503.
//!
//! Every step logs its own outcome through the event bus; nothing here ever
//! fails the caller.

use crate::proxy::state::EventBus;
use crate::proxy::upstream::{self, UpstreamPolicy};
use anyhow::{anyhow, Context};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use x509_parser::prelude::{FromDer, X509Certificate, X509Name};

const TCP_PROBE_TIMEOUT: Duration = Duration::from_secs(3);
const HTTP_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const BODY_PREVIEW_CHARS: usize = 150;

/// Issuer organisations of common TLS-intercepting middleboxes.
const INTERCEPTING_ISSUERS: [&str; 2] = ["zscaler", "fortinet"];

/// Inputs for one diagnostics run.
#[derive(Debug, Clone)]
pub struct DiagnosticsRequest {
    pub target_url: String,
    /// Headers of the failing upstream request
    pub headers: Vec<(String, String)>,
    pub policy: UpstreamPolicy,
    pub system_proxy_enabled: bool,
}

struct Probe<'a> {
    events: &'a EventBus,
}

impl Probe<'_> {
    fn log(&self, message: impl AsRef<str>) {
        self.events.debug(format!("[Diagnostic] {}", message.as_ref()));
    }
}

/// Run every probe in order, logging as it goes.
pub async fn run(request: DiagnosticsRequest, events: EventBus) {
    let probe = Probe { events: &events };
    probe.log("---------------------------------------------------");
    probe.log(format!("DEEP DIAGNOSTICS for {}", request.target_url));

    if let Err(err) = run_steps(&probe, &request).await {
        probe.log(format!("Diagnostics CRASHED: {:#}", err));
    }
    probe.log("---------------------------------------------------");
}

async fn run_steps(probe: &Probe<'_>, request: &DiagnosticsRequest) -> anyhow::Result<()> {
    probe.log(format!(
        "Proxy Config: System={}, URL={}",
        request.system_proxy_enabled,
        request.policy.proxy_url.as_deref().unwrap_or("None")
    ));

    let url = reqwest::Url::parse(&request.target_url)
        .with_context(|| format!("Invalid target URL {}", request.target_url))?;
    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("target URL has no host"))?
        .to_string();
    let port = url
        .port_or_known_default()
        .ok_or_else(|| anyhow!("target URL has no port"))?;

    probe.log(format!("Step 1: DNS Resolution for {}...", host));
    match tokio::net::lookup_host((host.as_str(), port)).await {
        Ok(addrs) => {
            let ips: Vec<String> = addrs.map(|addr| addr.ip().to_string()).collect();
            probe.log(format!("DNS Success: {:?}", ips));
        }
        Err(err) => probe.log(format!("DNS FAILED: {}", err)),
    }

    probe.log(format!("Step 2: TCP Connect to {}:{}...", host, port));
    match tokio::time::timeout(TCP_PROBE_TIMEOUT, TcpStream::connect((host.as_str(), port))).await
    {
        Ok(Ok(_)) => probe.log("TCP Connection ESTABLISHED"),
        Ok(Err(err)) => probe.log(format!("TCP Connection FAILED: {}", err)),
        Err(_) => probe.log("TCP Connection TIMEOUT"),
    }

    if url.scheme() == "https" {
        probe.log("Step 3: TLS Handshake & Cert Inspection...");
        match tokio::time::timeout(HTTP_PROBE_TIMEOUT, inspect_certificate(&host, port)).await {
            Ok(Ok(lines)) => lines.iter().for_each(|line| probe.log(line)),
            Ok(Err(err)) => probe.log(format!("TLS Handshake FAILED: {:#}", err)),
            Err(_) => probe.log("TLS Handshake TIMEOUT"),
        }
    }

    probe.log("Step 4: Application Layer Probes...");
    let client = request.policy.build_client()?;
    let headers: Vec<(String, String)> = request
        .headers
        .iter()
        .filter(|(name, value)| !name.eq_ignore_ascii_case("content-length") && !value.is_empty())
        .cloned()
        .collect();

    let wsdl_url = format!("{}?wsdl", request.target_url);
    let probes = [
        ("GET Root", request.target_url.as_str(), "GET", None),
        ("GET WSDL", wsdl_url.as_str(), "GET", None),
        ("OPTIONS", request.target_url.as_str(), "OPTIONS", None),
        ("POST (Empty)", request.target_url.as_str(), "POST", Some(bytes::Bytes::new())),
    ];
    for (label, url, method, body) in probes {
        let mut probe_headers = headers.clone();
        if body.is_some() {
            probe_headers.push(("content-length".into(), "0".into()));
        }
        match upstream::send(&client, method, url, &probe_headers, body, Some(HTTP_PROBE_TIMEOUT))
            .await
        {
            Ok(response) => {
                let reason = http::StatusCode::from_u16(response.status)
                    .ok()
                    .and_then(|status| status.canonical_reason())
                    .unwrap_or("");
                probe.log(format!("{}: {} {}", label, response.status, reason));
                if response.status != 200 {
                    let text = String::from_utf8_lossy(&response.body);
                    probe.log(format!("  > Body Preview: {}...", preview(&text)));
                }
            }
            Err(err) => probe.log(format!("{}: FAILED - {:#}", label, err)),
        }
    }

    Ok(())
}

/// First characters of a response body.
fn preview(text: &str) -> String {
    text.chars().take(BODY_PREVIEW_CHARS).collect()
}

/// TLS handshake without verification, reporting the peer certificate.
async fn inspect_certificate(host: &str, port: u16) -> anyhow::Result<Vec<String>> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .context("TLS client config")?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
        .with_no_client_auth();
    let connector = TlsConnector::from(Arc::new(config));
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| anyhow!("invalid server name {}: {}", host, e))?;

    let tcp = TcpStream::connect((host, port)).await?;
    let tls = connector.connect(server_name, tcp).await?;
    let (_, conn) = tls.get_ref();

    let Some(leaf) = conn.peer_certificates().and_then(|certs| certs.first()) else {
        return Ok(vec![
            "TLS Handshake success, but no cert returned or empty subject.".to_string(),
        ]);
    };
    Ok(describe_certificate(leaf.as_ref()))
}

fn describe_certificate(der: &[u8]) -> Vec<String> {
    let cert = match X509Certificate::from_der(der) {
        Ok((_, cert)) => cert,
        Err(err) => return vec![format!("Unable to parse server certificate: {}", err)],
    };

    let mut lines = vec![
        format!(
            "Server Cert Subject: {} / {}",
            first_cn(cert.subject()),
            first_org(cert.subject())
        ),
        format!(
            "Server Cert Issuer:  {} / {}",
            first_cn(cert.issuer()),
            first_org(cert.issuer())
        ),
    ];
    let issuer_org = first_org(cert.issuer());
    if let Some(alert) = intercepting_issuer_alert(&issuer_org) {
        lines.push(alert);
    }
    lines
}

fn intercepting_issuer_alert(issuer_org: &str) -> Option<String> {
    let lower = issuer_org.to_ascii_lowercase();
    INTERCEPTING_ISSUERS
        .iter()
        .any(|needle| lower.contains(needle))
        .then(|| {
            format!(
                "(!) ALERT: You are behind a Corporate Proxy/Firewall ({})",
                issuer_org
            )
        })
}

fn first_cn(name: &X509Name<'_>) -> String {
    name.iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .unwrap_or("")
        .to_string()
}

fn first_org(name: &X509Name<'_>) -> String {
    name.iter_organization()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .unwrap_or("")
        .to_string()
}

/// Accepts any server certificate; used only to look at what the peer presents.
#[derive(Debug)]
struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
