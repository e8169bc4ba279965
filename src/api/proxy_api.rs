//! Proxy API
//!
//! `ProxyService` is the handle an embedding application uses to configure,
//! start and stop the intercepting proxy and to answer breakpoints.

use crate::integrations::{MockResponder, Notifier, ReplaceApplier, SettingsProvider};
use crate::models::{
    Breakpoint, ConfigSnapshot, Direction, ListenerState, ProxyConfig, ProxyConfigUpdate,
    ProxyRule, ReplaceRule, ServerMode, ServiceEvent,
};
use crate::proxy::cert_manager::{CertManager, CertificatePair};
use crate::proxy::listener::{start_listener, RunningListener, StartError};
use crate::proxy::state::{read, write, ProxyState};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};

/// Get the version of the APInox proxy core library
pub fn get_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

/// Initialize logging (call once at startup).
///
/// With `log_dir` output goes to a daily rolling file in that directory,
/// otherwise to stderr. Calling it again is harmless.
pub fn init_core(log_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let level = resolve_log_level();

    match log_dir {
        Some(log_dir) => {
            // Create logs directory if it doesn't exist (fail fast if we can't)
            std::fs::create_dir_all(&log_dir).map_err(|e| {
                anyhow::anyhow!(
                    "Failed to create log directory {}: {}",
                    log_dir.display(),
                    e
                )
            })?;
            let file_appender = tracing_appender::rolling::daily(&log_dir, "apinox_proxy");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

            // Logging lasts until program exit
            std::mem::forget(guard);

            // If logging is already set elsewhere, don't treat it as fatal.
            let _ = tracing_subscriber::fmt()
                .with_max_level(level)
                .with_writer(non_blocking)
                .with_ansi(false)
                .try_init();
        }
        None => {
            let _ = tracing_subscriber::fmt().with_max_level(level).try_init();
        }
    }

    tracing::info!("APInox proxy core initialized v{}", env!("CARGO_PKG_VERSION"));
    Ok(())
}

fn resolve_log_level() -> tracing::level_filters::LevelFilter {
    use tracing::level_filters::LevelFilter;

    match std::env::var("RUST_LOG") {
        Ok(val) => match val.to_lowercase().as_str() {
            "trace" => LevelFilter::TRACE,
            "debug" => LevelFilter::DEBUG,
            "info" => LevelFilter::INFO,
            "warn" | "warning" => LevelFilter::WARN,
            "error" => LevelFilter::ERROR,
            _ => LevelFilter::INFO,
        },
        Err(_) => LevelFilter::INFO,
    }
}

/// The intercepting proxy service.
pub struct ProxyService {
    state: Arc<ProxyState>,
    cert_manager: CertManager,
    listener: Mutex<Option<RunningListener>>,
    running: AtomicBool,
    /// Listener state and bound address, readable without awaiting
    status: RwLock<(ListenerState, Option<SocketAddr>)>,
}

impl Default for ProxyService {
    fn default() -> Self {
        Self::new(ProxyConfig::default())
    }
}

impl ProxyService {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            state: Arc::new(ProxyState::new(config)),
            cert_manager: CertManager::default(),
            listener: Mutex::new(None),
            running: AtomicBool::new(false),
            status: RwLock::new((ListenerState::Stopped, None)),
        }
    }

    pub fn with_notifier(self, notifier: Arc<dyn Notifier>) -> Self {
        *write(&self.state.notifier) = Some(notifier);
        self
    }

    pub fn with_settings(self, settings: Arc<dyn SettingsProvider>) -> Self {
        *write(&self.state.settings) = Some(settings);
        self
    }

    /// Replace the built-in replace-rule engine.
    pub fn with_replace_applier(self, replacer: Arc<dyn ReplaceApplier>) -> Self {
        *write(&self.state.replacer) = replacer;
        self
    }

    /// Directory holding the generated certificate (defaults to the temp dir).
    pub fn with_cert_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cert_manager = CertManager::new(dir);
        self
    }

    pub fn with_breakpoint_timeout(self, timeout: Duration) -> Self {
        self.state.breakpoints.set_timeout(timeout);
        self
    }

    /// Receive every event the service publishes from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.state.events.subscribe()
    }

    /// Merge `update` into the config, restarting the listener if it is running.
    pub async fn update_config(&self, update: ProxyConfigUpdate) -> Result<(), StartError> {
        self.state.events.debug(format!(
            "[ProxyService] updateConfig called with: {}",
            serde_json::to_string(&update).unwrap_or_default()
        ));
        let config = {
            let mut config = write(&self.state.config);
            config.apply(update);
            config.clone()
        };
        self.state.events.debug(format!(
            "[ProxyService] New config is: {}",
            serde_json::to_string(&config).unwrap_or_default()
        ));

        if self.is_active() {
            self.state
                .events
                .debug("[ProxyService] Restarting proxy with new config...");
            self.stop().await;
            self.start().await?;
        }
        Ok(())
    }

    pub fn set_replace_rules(&self, rules: Vec<ReplaceRule>) {
        let count = rules.len();
        *write(&self.state.replace_rules) = rules;
        self.state.events.debug(format!(
            "[ProxyService] Updated replace rules: {} rules",
            count
        ));
    }

    pub fn set_proxy_rules(&self, rules: Vec<ProxyRule>) {
        let count = rules.len();
        *write(&self.state.proxy_rules) = rules;
        self.state
            .events
            .debug(format!("[ProxyService] Updated proxy rules: {} rules", count));
    }

    pub fn set_breakpoints(&self, breakpoints: Vec<Breakpoint>) {
        let count = breakpoints.len();
        self.state.breakpoints.set_rules(breakpoints);
        self.state.events.debug(format!(
            "[ProxyService] Updated breakpoints: {} breakpoints",
            count
        ));
    }

    /// Attach (or detach with `None`) the mock rule engine.
    pub fn set_mock_service(&self, mock: Option<Arc<dyn MockResponder>>) {
        let attached = mock.is_some();
        *write(&self.state.mock) = mock;
        if attached {
            self.state
                .events
                .debug("[ProxyService] MockService linked for middleware mode");
        }
    }

    pub fn set_server_mode(&self, mode: ServerMode) {
        *write(&self.state.server_mode) = mode;
        self.state
            .events
            .debug(format!("[ProxyService] Server mode set to: {:?}", mode));
    }

    pub fn get_server_mode(&self) -> ServerMode {
        self.state.server_mode()
    }

    /// Evaluate the breakpoint rules against one side of an exchange, using
    /// the current server mode.
    pub fn check_breakpoints(
        &self,
        url: &str,
        content: &str,
        headers: &HashMap<String, String>,
        direction: Direction,
    ) -> Option<Breakpoint> {
        self.state
            .breakpoints
            .check(self.get_server_mode(), url, content, headers, direction)
    }

    /// Resume a suspended exchange. Returns `false` for unknown or already
    /// settled ids.
    pub fn resolve_breakpoint(
        &self,
        breakpoint_id: &str,
        content: impl Into<String>,
        cancelled: bool,
    ) -> bool {
        self.state
            .breakpoints
            .resolve(breakpoint_id, content.into(), cancelled)
    }

    /// Ids of breakpoints currently waiting for resolution.
    pub fn pending_breakpoints(&self) -> Vec<String> {
        self.state.breakpoints.pending_ids()
    }

    /// Make sure the listener certificate exists ahead of an HTTPS start.
    pub async fn prepare_cert(&self) -> anyhow::Result<CertificatePair> {
        let manager = self.cert_manager.clone();
        tokio::task::spawn_blocking(move || manager.ensure_cert()).await?
    }

    /// Start listening. A no-op when already running.
    pub async fn start(&self) -> Result<(), StartError> {
        let mut listener = self.listener.lock().await;
        if listener.is_some() {
            return Ok(());
        }

        match start_listener(self.state.clone(), self.cert_manager.clone()).await {
            Ok(running) => {
                *write(&self.status) = (running.state, Some(running.local_addr));
                *listener = Some(running);
                self.running.store(true, Ordering::SeqCst);
                self.state.events.emit(ServiceEvent::Status(true));
                Ok(())
            }
            Err(err) => {
                drop(listener);
                self.state
                    .notify_error(&format!("APInox Proxy Error: {}", err));
                self.stop().await;
                Err(err)
            }
        }
    }

    /// Stop listening and drop in-flight work. Safe to call when stopped.
    pub async fn stop(&self) {
        let running = self.listener.lock().await.take();
        if let Some(running) = running {
            tracing::info!("Stopping proxy");
            running.stop().await;
        }
        self.state.breakpoints.clear_pending();
        self.state.clients.clear();
        *write(&self.status) = (ListenerState::Stopped, None);
        self.running.store(false, Ordering::SeqCst);
        self.state.events.emit(ServiceEvent::Status(false));
    }

    pub fn get_config(&self) -> ConfigSnapshot {
        let config = self.state.config();
        let expected_protocol = config.expected_protocol();
        ConfigSnapshot {
            config,
            actual_protocol: self.listener_state().protocol(),
            expected_protocol,
        }
    }

    pub fn get_cert_path(&self) -> PathBuf {
        self.cert_manager.cert_path().to_path_buf()
    }

    pub fn is_active(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn listener_state(&self) -> ListenerState {
        read(&self.status).0
    }

    /// Address the listener is bound to while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        read(&self.status).1
    }
}
