//! Health, readiness and ping endpoints.

use std::sync::Arc;

use axum::Extension as Ext;
use axum::http::StatusCode;
use axum::routing::get;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::info;

use super::{Extension, ExtensionContext, parse_config};
use crate::error::AppResult;
use crate::formatter::Formatters;

/// Path configuration shared by the endpoint extensions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Route path.
    pub path: String,
}

/// Health status response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always "healthy" while the process can answer.
    pub status: String,
    /// Crate version.
    pub version: String,
    /// Seconds since the application was constructed.
    pub uptime_seconds: u64,
}

/// Adds `GET /health` (path configurable).
#[derive(Debug)]
pub struct HealthStatusExtension {
    context: ExtensionContext,
}

impl Extension for HealthStatusExtension {
    const NAME: &'static str = "health";

    fn bind(context: ExtensionContext) -> Self {
        Self { context }
    }

    fn execute(self, config: Value) -> AppResult<Value> {
        let config: EndpointConfig =
            parse_config(Self::NAME, config, json!({"path": "/health"}))?;
        let started_at = self.context.started_at();

        self.context.server()?.route(
            &config.path,
            get(move |Ext(formatters): Ext<Arc<Formatters>>| async move {
                let health = HealthResponse {
                    status: "healthy".to_string(),
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    uptime_seconds: started_at.elapsed().as_secs(),
                };
                formatters.json(StatusCode::OK, serde_json::to_value(health)?)
            }),
        )?;

        info!(path = %config.path, "Health status endpoint added");
        Ok(serde_json::to_value(config)?)
    }
}

/// Adds `GET /ready`: 200 once the application is ready, 503 before.
#[derive(Debug)]
pub struct ReadinessProbeExtension {
    context: ExtensionContext,
}

impl Extension for ReadinessProbeExtension {
    const NAME: &'static str = "readiness";

    fn bind(context: ExtensionContext) -> Self {
        Self { context }
    }

    fn execute(self, config: Value) -> AppResult<Value> {
        let config: EndpointConfig =
            parse_config(Self::NAME, config, json!({"path": "/ready"}))?;
        let readiness = self.context.readiness().clone();

        self.context.server()?.route(
            &config.path,
            get(move |Ext(formatters): Ext<Arc<Formatters>>| {
                let ready = readiness.is_ready();
                async move {
                    let status = if ready {
                        StatusCode::OK
                    } else {
                        StatusCode::SERVICE_UNAVAILABLE
                    };
                    formatters.json(status, json!({ "ready": ready }))
                }
            }),
        )?;

        info!(path = %config.path, "Readiness probe added");
        Ok(serde_json::to_value(config)?)
    }
}

/// Adds `GET /ping`, answering `"pong"`.
#[derive(Debug)]
pub struct PingExtension {
    context: ExtensionContext,
}

impl Extension for PingExtension {
    const NAME: &'static str = "ping";

    fn bind(context: ExtensionContext) -> Self {
        Self { context }
    }

    fn execute(self, config: Value) -> AppResult<Value> {
        let config: EndpointConfig = parse_config(Self::NAME, config, json!({"path": "/ping"}))?;

        self.context.server()?.route(
            &config.path,
            get(|Ext(formatters): Ext<Arc<Formatters>>| async move {
                formatters.json(StatusCode::OK, "pong")
            }),
        )?;

        Ok(serde_json::to_value(config)?)
    }
}
