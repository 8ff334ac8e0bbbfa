//! Extension contract.
//!
//! An extension is bound to the application's server, executed once with a
//! configuration value, then dropped. Executing adds middleware or routes to
//! the shared server; repeated activations add further layers rather than
//! replacing earlier ones.

pub mod cors;
pub mod health;

use std::sync::{Arc, Weak};
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::application::Readiness;
use crate::error::{AppError, AppResult};
use crate::server::Server;

pub use cors::CorsExtension;
pub use health::{HealthStatusExtension, PingExtension, ReadinessProbeExtension};

/// What an extension is bound to.
#[derive(Debug, Clone)]
pub struct ExtensionContext {
    server: Weak<Server>,
    readiness: Readiness,
    started_at: Instant,
}

impl ExtensionContext {
    pub(crate) fn new(server: &Arc<Server>, readiness: Readiness, started_at: Instant) -> Self {
        Self {
            server: Arc::downgrade(server),
            readiness,
            started_at,
        }
    }

    /// The server this extension mutates.
    pub fn server(&self) -> AppResult<Arc<Server>> {
        self.server.upgrade().ok_or(AppError::ServerGone)
    }

    /// The application's readiness flag.
    pub fn readiness(&self) -> &Readiness {
        &self.readiness
    }

    /// When the application was constructed.
    pub fn started_at(&self) -> Instant {
        self.started_at
    }
}

/// A unit that, given configuration, mutates the server's pipeline.
pub trait Extension: Sized {
    /// Name under which the activation result is recorded (`extension-<NAME>`).
    const NAME: &'static str;

    /// Bind to the application.
    fn bind(context: ExtensionContext) -> Self;

    /// Apply `config`. The returned value is recorded for introspection.
    fn execute(self, config: Value) -> AppResult<Value>;
}

/// Fill keys missing from `config` with `defaults`, recursively.
///
/// Objects merge key by key; any other value in `config` (arrays included)
/// wins as a whole. `null` counts as absent.
pub fn merge_defaults(config: Value, defaults: Value) -> Value {
    match (config, defaults) {
        (Value::Object(mut config), Value::Object(defaults)) => {
            for (key, default) in defaults {
                let merged = match config.remove(&key) {
                    Some(value) => merge_defaults(value, default),
                    None => default,
                };
                config.insert(key, merged);
            }
            Value::Object(config)
        }
        (Value::Null, defaults) => defaults,
        (config, _) => config,
    }
}

/// Merge `config` over `defaults` and deserialize, reporting failures as
/// [`AppError::MisconfiguredExtension`] for `name`.
pub fn parse_config<T: DeserializeOwned>(
    name: &'static str,
    config: Value,
    defaults: Value,
) -> AppResult<T> {
    serde_json::from_value(merge_defaults(config, defaults))
        .map_err(|e| AppError::misconfigured(name, e.to_string()))
}
