//! Application settings.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment tag for development.
pub const ENV_DEV: &str = "DEV";
/// Environment tag for production.
pub const ENV_PROD: &str = "PROD";
/// Environment tag for tests.
pub const ENV_TEST: &str = "TEST";

/// Boot settings for the application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Environment tag ("DEV", "PROD", "TEST").
    #[serde(default = "default_env")]
    pub env: String,

    /// Address to bind (0.0.0.0 or :: bind every interface).
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to bind; 0 picks an ephemeral port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Upper bound on the wait for shutdown acknowledgments, in seconds.
    /// Unset means wait until every listener has acknowledged.
    #[serde(default)]
    pub shutdown_timeout: Option<u64>,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Extensions activated by the server binary at boot.
    #[serde(default)]
    pub extensions: ExtensionsConfig,
}

fn default_env() -> String {
    ENV_DEV.to_string()
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    8080
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            env: default_env(),
            host: default_host(),
            port: default_port(),
            shutdown_timeout: None,
            logging: LoggingConfig::default(),
            extensions: ExtensionsConfig::default(),
        }
    }
}

impl Settings {
    /// Load settings from a JSON file.
    pub fn load(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let settings: Self = serde_json::from_str(&content)?;
        Ok(settings)
    }

    /// Load from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary variable lookup, starting from defaults.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut settings = Self::default();

        if let Some(env) = lookup("HARBOR_ENV") {
            settings.env = env.to_uppercase();
        }

        if let Some(host) = lookup("HARBOR_HOST") {
            settings.host = host
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid HARBOR_HOST {host:?}: {e}"))?;
        }

        if let Some(port) = lookup("HARBOR_PORT") {
            settings.port = port
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid HARBOR_PORT {port:?}: {e}"))?;
        }

        if let Some(timeout) = lookup("HARBOR_SHUTDOWN_TIMEOUT") {
            settings.shutdown_timeout = Some(timeout.parse().map_err(|e| {
                anyhow::anyhow!("Invalid HARBOR_SHUTDOWN_TIMEOUT {timeout:?}: {e}")
            })?);
        }

        Ok(settings)
    }

    /// Socket address the server binds to.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// Whether the environment tag equals `env`.
    pub fn is_env(&self, env: &str) -> bool {
        self.env == env
    }

    /// Shutdown acknowledgment timeout as a Duration.
    pub fn shutdown_timeout_duration(&self) -> Option<Duration> {
        self.shutdown_timeout.map(Duration::from_secs)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level.
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format (json or pretty).
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Extension activation at boot. Each entry is passed through to the
/// extension untouched; absent entries are not activated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtensionsConfig {
    /// CORS configuration.
    #[serde(default)]
    pub cors: Option<serde_json::Value>,
    /// Health status endpoint configuration.
    #[serde(default)]
    pub health: Option<serde_json::Value>,
    /// Readiness probe configuration.
    #[serde(default)]
    pub readiness: Option<serde_json::Value>,
    /// Register `/ping`.
    #[serde(default)]
    pub ping: bool,
}
