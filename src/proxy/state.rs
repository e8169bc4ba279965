//! State shared between the service handle and in-flight requests.

use crate::integrations::{MockResponder, Notifier, ReplaceApplier, SettingsProvider};
use crate::models::{
    LogStage, ProxyConfig, ProxyEvent, ProxyRule, ReplaceRule, ServerMode, ServiceEvent,
};
use crate::proxy::breakpoints::{BreakpointEngine, BREAKPOINT_TIMEOUT};
use crate::proxy::replace::XmlReplaceApplier;
use crate::proxy::upstream::UpstreamClients;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Broadcast channel carrying every `ServiceEvent`.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ServiceEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (tx, _rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }
}

impl EventBus {
    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ServiceEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn debug(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!("{}", message);
        self.emit(ServiceEvent::DebugLog(message));
    }

    pub fn log(&self, stage: Option<LogStage>, event: &ProxyEvent) {
        self.emit(ServiceEvent::Log {
            stage,
            event: event.clone(),
        });
    }
}

pub(crate) struct ProxyState {
    pub config: RwLock<ProxyConfig>,
    pub server_mode: RwLock<ServerMode>,
    pub replace_rules: RwLock<Vec<ReplaceRule>>,
    pub proxy_rules: RwLock<Vec<ProxyRule>>,
    pub mock: RwLock<Option<Arc<dyn MockResponder>>>,
    pub breakpoints: BreakpointEngine,
    pub replacer: RwLock<Arc<dyn ReplaceApplier>>,
    pub notifier: RwLock<Option<Arc<dyn Notifier>>>,
    pub settings: RwLock<Option<Arc<dyn SettingsProvider>>>,
    pub events: EventBus,
    pub clients: UpstreamClients,
}

impl ProxyState {
    pub fn new(config: ProxyConfig) -> Self {
        let events = EventBus::default();
        Self {
            config: RwLock::new(config),
            server_mode: RwLock::new(ServerMode::default()),
            replace_rules: RwLock::new(Vec::new()),
            proxy_rules: RwLock::new(Vec::new()),
            mock: RwLock::new(None),
            breakpoints: BreakpointEngine::new(events.clone(), BREAKPOINT_TIMEOUT),
            replacer: RwLock::new(Arc::new(XmlReplaceApplier)),
            notifier: RwLock::new(None),
            settings: RwLock::new(None),
            events,
            clients: UpstreamClients::default(),
        }
    }

    pub fn config(&self) -> ProxyConfig {
        read(&self.config).clone()
    }

    pub fn server_mode(&self) -> ServerMode {
        *read(&self.server_mode)
    }

    pub fn replace_rules(&self) -> Vec<ReplaceRule> {
        read(&self.replace_rules).clone()
    }

    pub fn proxy_rules(&self) -> Vec<ProxyRule> {
        read(&self.proxy_rules).clone()
    }

    pub fn mock(&self) -> Option<Arc<dyn MockResponder>> {
        read(&self.mock).clone()
    }

    pub fn replacer(&self) -> Arc<dyn ReplaceApplier> {
        read(&self.replacer).clone()
    }

    fn settings(&self) -> Option<Arc<dyn SettingsProvider>> {
        read(&self.settings).clone()
    }

    /// Certificates are validated unless the settings explicitly disable it.
    pub fn strict_ssl(&self) -> bool {
        self.settings()
            .and_then(|s| s.strict_ssl())
            .unwrap_or(true)
    }

    /// Settings first, then the conventional environment variables.
    pub fn proxy_url(&self) -> Option<String> {
        self.settings()
            .and_then(|s| s.proxy_url())
            .filter(|url| !url.trim().is_empty())
            .or_else(|| std::env::var("HTTPS_PROXY").ok())
            .or_else(|| std::env::var("HTTP_PROXY").ok())
            .filter(|url| !url.trim().is_empty())
    }

    pub fn notify_error(&self, message: &str) {
        tracing::error!("{}", message);
        let notifier = read(&self.notifier).clone();
        if let Some(notifier) = notifier {
            notifier.show_error(message);
        }
    }
}
