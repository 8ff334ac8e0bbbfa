//! Application core: owns the server, settings, extension registry, event
//! bus and readiness flag, and drives the listen/close/shutdown lifecycle.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info};

use crate::config::{ENV_DEV, ENV_PROD, ENV_TEST, Settings};
use crate::error::{AppError, AppResult};
use crate::events::{EventBus, EventPayload};
use crate::extensions::{
    CorsExtension, Extension, ExtensionContext, HealthStatusExtension, PingExtension,
    ReadinessProbeExtension,
};
use crate::formatter::{Formatter, Formatters};
use crate::server::Server;
use crate::shutdown::{self, SHUTDOWN_EVENT, ShutdownAck, ShutdownPhase, ShutdownReport};

/// Prefix of `get` keys that look up extension activations.
pub const EXTENSION_PREFIX: &str = "extension-";

/// Shared readiness flag. Moves from false to true once and stays there.
#[derive(Debug, Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    /// Whether the application is ready.
    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Mark ready. Returns true if this call made the transition.
    pub fn set_ready(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }
}

/// Construction options.
#[derive(Clone, Default)]
pub struct ApplicationOptions {
    formatters: HashMap<String, Arc<dyn Formatter>>,
}

impl std::fmt::Debug for ApplicationOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplicationOptions")
            .field("formatters", &self.formatters.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ApplicationOptions {
    /// Options with no custom formatters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a formatter for `content_type`. `application/json` is always
    /// replaced by the built-in JSON formatter.
    pub fn with_formatter(
        mut self,
        content_type: impl Into<String>,
        formatter: impl Formatter + 'static,
    ) -> Self {
        self.formatters
            .insert(content_type.into(), Arc::new(formatter));
        self
    }
}

/// Keys understood by [`ApplicationCore::get`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Property<'a> {
    /// `extension-<name>`
    Extension(&'a str),
    /// `is-dev-mode`
    IsDevMode,
    /// `is-prod-mode`
    IsProdMode,
    /// `is-test-mode`
    IsTestMode,
    /// `family`
    Family,
    /// `host`
    Host,
    /// `port`
    Port,
    /// `url`
    Url,
}

impl<'a> Property<'a> {
    /// Parse a key; unknown keys yield `None`.
    pub fn parse(name: &'a str) -> Option<Self> {
        if let Some(extension) = name.strip_prefix(EXTENSION_PREFIX) {
            return Some(Self::Extension(extension));
        }
        match name {
            "is-dev-mode" => Some(Self::IsDevMode),
            "is-prod-mode" => Some(Self::IsProdMode),
            "is-test-mode" => Some(Self::IsTestMode),
            "family" => Some(Self::Family),
            "host" => Some(Self::Host),
            "port" => Some(Self::Port),
            "url" => Some(Self::Url),
            _ => None,
        }
    }
}

/// Process-wide application wrapper around the HTTP server.
pub struct ApplicationCore {
    server: Arc<Server>,
    settings: RwLock<Option<Arc<Settings>>>,
    extensions: RwLock<HashMap<String, Value>>,
    events: EventBus,
    readiness: Readiness,
    shutdown_phase: Mutex<ShutdownPhase>,
    shutdown_triggered: AtomicBool,
    started_at: Instant,
}

impl std::fmt::Debug for ApplicationCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplicationCore")
            .field("server", &self.server)
            .field("settings", &self.settings.read())
            .field("extensions", &self.extensions.read().keys().collect::<Vec<_>>())
            .field("ready", &self.readiness.is_ready())
            .field("shutdown_phase", &*self.shutdown_phase.lock())
            .finish()
    }
}

impl ApplicationCore {
    /// Build an application. Most callers want [`crate::get_application`];
    /// tests construct instances directly.
    pub fn new(options: ApplicationOptions) -> Self {
        let formatters = Formatters::new(options.formatters);
        debug!(?formatters, "Creating application");
        Self {
            server: Arc::new(Server::new(formatters)),
            settings: RwLock::new(None),
            extensions: RwLock::new(HashMap::new()),
            events: EventBus::new(),
            readiness: Readiness::default(),
            shutdown_phase: Mutex::new(ShutdownPhase::Idle),
            shutdown_triggered: AtomicBool::new(false),
            started_at: Instant::now(),
        }
    }

    /// The server handle.
    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// The event bus.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Publish `data` to every subscriber of `event`.
    pub fn emit(&self, event: &str, data: Value) -> usize {
        self.events.emit(event, data)
    }

    /// Subscribe to `event`.
    pub fn on<F>(&self, event: impl Into<String>, listener: F)
    where
        F: Fn(EventPayload) + Send + Sync + 'static,
    {
        self.events.on(event, listener);
    }

    /// Subscribe to the shutdown event. `listener` must eventually call
    /// [`ShutdownAck::ack`], or shutdown will not complete.
    pub fn on_shutdown<F>(&self, listener: F)
    where
        F: Fn(ShutdownAck) + Send + Sync + 'static,
    {
        self.events.on(SHUTDOWN_EVENT, move |payload| {
            if let Some(ack) = payload.into_ack() {
                listener(ack);
            }
        });
    }

    /// Current settings.
    pub fn settings(&self) -> Option<Arc<Settings>> {
        self.settings.read().clone()
    }

    /// Replace the settings record.
    pub fn set_settings(&self, settings: Settings) {
        debug!(env = %settings.env, port = settings.port, "Settings updated");
        *self.settings.write() = Some(Arc::new(settings));
    }

    /// Look up a derived value by name. Unknown names yield `None`.
    pub fn get(&self, name: &str) -> Option<Value> {
        match Property::parse(name)? {
            Property::Extension(extension) => self.extensions.read().get(extension).cloned(),
            Property::IsDevMode => Some(Value::Bool(self.is_env(ENV_DEV))),
            Property::IsProdMode => Some(Value::Bool(self.is_env(ENV_PROD))),
            Property::IsTestMode => Some(Value::Bool(self.is_env(ENV_TEST))),
            Property::Family => self.family().map(Value::from),
            Property::Host => self.host().map(Value::from),
            Property::Port => self.port().map(Value::from),
            Property::Url => self.url().map(Value::from),
        }
    }

    /// Whether the settings' environment tag equals `env`.
    pub fn is_env(&self, env: &str) -> bool {
        self.settings
            .read()
            .as_ref()
            .is_some_and(|settings| settings.is_env(env))
    }

    /// Address of the bound socket.
    pub fn address(&self) -> Option<SocketAddr> {
        self.server.local_addr()
    }

    /// Address family of the bound socket ("IPv4" or "IPv6").
    pub fn family(&self) -> Option<&'static str> {
        self.address()
            .map(|addr| if addr.is_ipv4() { "IPv4" } else { "IPv6" })
    }

    /// Bound host, with the any-address shown as "localhost".
    pub fn host(&self) -> Option<String> {
        self.address().map(|addr| {
            let ip = addr.ip();
            if ip.is_unspecified() {
                "localhost".to_string()
            } else {
                ip.to_string()
            }
        })
    }

    /// Bound port.
    pub fn port(&self) -> Option<u16> {
        self.address().map(|addr| addr.port())
    }

    /// `https://host:port` when bound to 443, `http://host:port` otherwise.
    pub fn url(&self) -> Option<String> {
        let host = self.host()?;
        let port = self.port()?;
        let scheme = if port == 443 { "https" } else { "http" };
        Some(format!("{scheme}://{host}:{port}"))
    }

    /// Bind the server to the configured address, mark the application
    /// ready and call `on_listening`.
    pub async fn listen<F>(&self, on_listening: F) -> AppResult<SocketAddr>
    where
        F: FnOnce(&Server),
    {
        let settings = self.settings().ok_or(AppError::SettingsMissing)?;
        let addr = self.server.listen(settings.listen_addr()).await?;
        if self.readiness.set_ready() {
            info!(%addr, "Application ready");
        }
        on_listening(&self.server);
        Ok(addr)
    }

    /// Whether the application is ready.
    pub fn is_ready(&self) -> bool {
        self.readiness.is_ready()
    }

    /// Mark the application ready without binding.
    pub fn set_ready(&self) {
        self.readiness.set_ready();
    }

    /// The readiness flag.
    pub fn readiness(&self) -> &Readiness {
        &self.readiness
    }

    /// Close the server. Fails with [`AppError::NotListening`] if it is not bound.
    pub async fn close(&self) -> AppResult<()> {
        self.server.close().await
    }

    fn extension_context(&self) -> ExtensionContext {
        ExtensionContext::new(&self.server, self.readiness.clone(), self.started_at)
    }

    /// Bind and execute extension `E`, recording its result under `E::NAME`.
    pub fn activate<E: Extension>(&self, config: Value) -> AppResult<()> {
        let value = E::bind(self.extension_context()).execute(config)?;
        debug!(extension = E::NAME, "Extension activated");
        self.extensions.write().insert(E::NAME.to_string(), value);
        Ok(())
    }

    /// Enable CORS.
    pub fn enable_cors(&self, config: Value) -> AppResult<()> {
        self.activate::<CorsExtension>(config)
    }

    /// Add the health status endpoint.
    pub fn add_health_status(&self, config: Value) -> AppResult<()> {
        self.activate::<HealthStatusExtension>(config)
    }

    /// Add the readiness probe endpoint.
    pub fn add_readiness_probe(&self, config: Value) -> AppResult<()> {
        self.activate::<ReadinessProbeExtension>(config)
    }

    /// Add `/ping`.
    pub fn add_ping_endpoint(&self) -> AppResult<()> {
        self.activate::<PingExtension>(Value::Null)
    }

    /// Current shutdown phase.
    pub fn shutdown_phase(&self) -> ShutdownPhase {
        *self.shutdown_phase.lock()
    }

    /// Run graceful shutdown: notify shutdown listeners, wait for every
    /// acknowledgment, close the server.
    ///
    /// Can be triggered once, including when it ends in
    /// [`ShutdownPhase::Failed`].
    pub async fn graceful_shutdown(&self) -> AppResult<ShutdownReport> {
        if self.shutdown_triggered.swap(true, Ordering::AcqRel) {
            return Err(AppError::ShutdownAlreadyTriggered);
        }

        let timeout = self
            .settings()
            .and_then(|settings| settings.shutdown_timeout_duration());
        shutdown::run(
            &self.events,
            timeout,
            shutdown::close_if_listening(&self.server),
            |phase| {
                debug!(%phase, "Shutdown phase");
                *self.shutdown_phase.lock() = phase;
            },
        )
        .await
    }

    /// Process exit hook: wait for `signal`, then shut down gracefully.
    /// Returns once the process may exit.
    pub async fn run_until_exit<S>(&self, signal: S) -> AppResult<ShutdownReport>
    where
        S: Future<Output = ()>,
    {
        signal.await;
        info!("Exit requested, starting graceful shutdown");
        self.graceful_shutdown().await
    }
}
