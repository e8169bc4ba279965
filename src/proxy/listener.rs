//! Listener startup and transport selection
//!
//! The listening protocol mirrors the target: HTTPS targets get a TLS
//! listener using the generated certificate, HTTP targets a plain one. When
//! the certificate cannot be produced the listener still comes up as plain
//! HTTP (`ListenerState::HttpFallback`).

use crate::models::{ListenerState, ServiceEvent};
use crate::proxy::cert_manager::{CertManager, CertificatePair};
use crate::proxy::server::handle_connection;
use crate::proxy::state::ProxyState;
use anyhow::Context;
use rustls::crypto::aws_lc_rs::{cipher_suite, default_provider};
use rustls::crypto::CryptoProvider;
use rustls::ServerConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;

/// Clients must complete the TLS handshake within this window.
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Why `start()` could not bring the listener up.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("failed to bind proxy listener on port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

/// Handle to a running accept loop.
pub(crate) struct RunningListener {
    pub local_addr: SocketAddr,
    pub state: ListenerState,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl RunningListener {
    /// Close the listener and abort in-flight connections.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        if let Err(err) = self.task.await {
            tracing::warn!("Proxy accept loop ended abnormally: {}", err);
        }
    }
}

/// TLS server configuration for the HTTPS listener: TLS 1.2 and 1.3,
/// server-preferred ECDHE AES-GCM suites, no client certificates.
pub fn build_tls_config(pair: &CertificatePair) -> anyhow::Result<ServerConfig> {
    let (certs, key) = pair.to_der()?;

    let provider = CryptoProvider {
        cipher_suites: vec![
            cipher_suite::TLS13_AES_256_GCM_SHA384,
            cipher_suite::TLS13_AES_128_GCM_SHA256,
            cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
            cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
            cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
            cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        ],
        ..default_provider()
    };

    let mut config = ServerConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])
        .context("Unsupported TLS protocol versions")?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Failed to build TLS configuration")?;
    config.ignore_client_order = true;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(config)
}

async fn load_acceptor(cert_manager: CertManager) -> anyhow::Result<TlsAcceptor> {
    let pair = tokio::task::spawn_blocking(move || cert_manager.ensure_cert())
        .await
        .context("Certificate task failed")??;
    let config = build_tls_config(&pair)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Bind the listener for the current config and spawn its accept loop.
pub(crate) async fn start_listener(
    state: Arc<ProxyState>,
    cert_manager: CertManager,
) -> Result<RunningListener, StartError> {
    let config = state.config();
    let events = &state.events;

    events.debug("[ProxyService] ========================================");
    events.debug("[ProxyService] Starting Proxy Server");
    events.debug(format!("[ProxyService] Target: {}", config.target_url));
    events.debug(format!("[ProxyService] Port: {}", config.port));
    events.debug(format!(
        "[ProxyService] Strict SSL: {}",
        if state.strict_ssl() {
            "ENABLED (validates certificates)"
        } else {
            "DISABLED (accepts self-signed)"
        }
    ));
    events.debug("[ProxyService] ========================================");

    let (acceptor, listener_state) = if config.is_https_target() {
        events.debug("[ProxyService] Target is HTTPS - proxy will use HTTPS");
        match load_acceptor(cert_manager).await {
            Ok(acceptor) => {
                events.debug("[ProxyService] Certs loaded successfully");
                (Some(acceptor), ListenerState::Https)
            }
            Err(err) => {
                events.debug(format!("[ProxyService] Certificate error: {:#}", err));
                events.debug("[ProxyService] FALLING BACK TO HTTP SERVER - CLIENTS WILL FAIL!");
                state.notify_error(&format!(
                    "Proxy certificate error: {:#}\n\nProxy is starting as HTTP but target is HTTPS!\nYour HTTPS clients will fail with \"wrong version number\".",
                    err
                ));
                (None, ListenerState::HttpFallback)
            }
        }
    } else {
        events.debug("[ProxyService] Target is HTTP - proxy will use HTTP");
        (None, ListenerState::Http)
    };

    let addr = format!("{}:{}", config.bind_address, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| StartError::Bind {
            port: config.port,
            source,
        })?;
    let local_addr = listener.local_addr().map_err(|source| StartError::Bind {
        port: config.port,
        source,
    })?;

    match listener_state {
        ListenerState::HttpFallback => {
            tracing::warn!("Proxy listening on {} as HTTP for an HTTPS target", local_addr);
            events.debug(format!(
                "APInox Proxy listening on port {} (HTTP - WRONG FOR HTTPS TARGET!)",
                local_addr.port()
            ));
        }
        _ => {
            tracing::info!("Proxy server listening on {}", local_addr);
            events.debug(format!(
                "APInox Proxy listening on port {} ({})",
                local_addr.port(),
                if acceptor.is_some() { "HTTPS" } else { "HTTP" }
            ));
        }
    }

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let task = tokio::spawn(accept_loop(listener, acceptor, state.clone(), shutdown_rx));

    Ok(RunningListener {
        local_addr,
        state: listener_state,
        shutdown: shutdown_tx,
        task,
    })
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    state: Arc<ProxyState>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer_addr)) => {
                    tracing::debug!("Connection from {}", peer_addr);
                    let acceptor = acceptor.clone();
                    let state = state.clone();
                    connections.spawn(serve_socket(
                        socket,
                        peer_addr,
                        acceptor,
                        state,
                        TLS_HANDSHAKE_TIMEOUT,
                    ));
                }
                Err(e) => tracing::error!("Accept error: {}", e),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    connections.shutdown().await;
    tracing::info!("Proxy server stopped");
}

async fn serve_socket(
    socket: TcpStream,
    peer_addr: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    state: Arc<ProxyState>,
    handshake_timeout: Duration,
) {
    let result = match acceptor {
        Some(acceptor) => match tokio::time::timeout(handshake_timeout, acceptor.accept(socket)).await {
            Err(_) => {
                tracing::warn!("TLS handshake from {} timed out", peer_addr);
                state.events.debug(format!(
                    "[ProxyService] TLS Error: handshake from {} timed out after {}ms",
                    peer_addr,
                    handshake_timeout.as_millis()
                ));
                return;
            }
            Ok(Ok(tls)) => {
                let (_, conn) = tls.get_ref();
                state.events.debug(format!(
                    "[ProxyService] Secure connection established: Protocol={:?}, Cipher={:?}",
                    conn.protocol_version(),
                    conn.negotiated_cipher_suite().map(|suite| suite.suite())
                ));
                handle_connection(tls, state).await
            }
            Ok(Err(err)) => {
                tracing::warn!("TLS client error from {}: {}", peer_addr, err);
                state.events.emit(ServiceEvent::DebugLog(format!(
                    "[ProxyService] TLS Error: {}",
                    err
                )));
                return;
            }
        },
        None => handle_connection(socket, state).await,
    };

    if let Err(e) = result {
        let err_str = e.to_string().to_lowercase();
        if err_str.contains("eof")
            || err_str.contains("broken pipe")
            || err_str.contains("connection reset")
        {
            tracing::debug!("Connection closed by client: {}", e);
        } else {
            tracing::error!("Error handling connection: {}", e);
        }
    }
}
