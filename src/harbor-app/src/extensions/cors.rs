//! CORS extension.
//!
//! Installs two middlewares: a preflight responder on the pre-routing chain
//! and an actual-request decorator on the request-handling chain.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::{
    ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN,
    ACCESS_CONTROL_EXPOSE_HEADERS, ACCESS_CONTROL_MAX_AGE, ACCESS_CONTROL_REQUEST_METHOD, ORIGIN,
    VARY,
};
use axum::http::{HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};

use super::{Extension, ExtensionContext, parse_config};
use crate::error::{AppError, AppResult};

/// Headers always allowed, ahead of any configured ones.
pub const BASE_ALLOWED_HEADERS: [&str; 3] =
    ["X-Api-Key", "Access-Control-Allow-Origin", "Authorization"];

/// `Access-Control-Max-Age` sent on preflight responses, in seconds.
pub const PREFLIGHT_MAX_AGE: u32 = 5;

/// CORS configuration after defaults are applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorsSettings {
    /// Allowed origins: `*`, exact origins, or patterns like `https://*.example.com`.
    pub origins: Vec<String>,
    /// Headers allowed in addition to [`BASE_ALLOWED_HEADERS`].
    pub allowed_headers: Vec<String>,
    /// Headers exposed to the browser.
    pub exposed_headers: Vec<String>,
}

fn defaults() -> Value {
    json!({
        "origins": ["*"],
        "allowedHeaders": [],
        "exposedHeaders": [],
    })
}

/// Base headers followed by the configured ones, in order, duplicates kept.
pub fn allowed_headers(settings: &CorsSettings) -> Vec<String> {
    BASE_ALLOWED_HEADERS
        .iter()
        .map(|h| h.to_string())
        .chain(settings.allowed_headers.iter().cloned())
        .collect()
}

/// Exposed headers; there is no base list.
pub fn exposed_headers(settings: &CorsSettings) -> Vec<String> {
    settings.exposed_headers.clone()
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum OriginPattern {
    Any,
    Exact(String),
    Wildcard { prefix: String, suffix: String },
}

impl OriginPattern {
    fn parse(origin: &str) -> Self {
        if origin == "*" {
            return Self::Any;
        }
        match origin.split_once('*') {
            Some((prefix, suffix)) => Self::Wildcard {
                prefix: prefix.to_ascii_lowercase(),
                suffix: suffix.to_ascii_lowercase(),
            },
            None => Self::Exact(origin.to_ascii_lowercase()),
        }
    }

    fn matches(&self, origin: &str) -> bool {
        let origin = origin.to_ascii_lowercase();
        match self {
            Self::Any => true,
            Self::Exact(expected) => origin == *expected,
            Self::Wildcard { prefix, suffix } => {
                origin.len() > prefix.len() + suffix.len()
                    && origin.starts_with(prefix.as_str())
                    && origin.ends_with(suffix.as_str())
            }
        }
    }
}

/// Compiled CORS parameters shared by the middleware pair.
#[derive(Debug, Clone)]
pub struct CorsPolicy {
    origins: Vec<OriginPattern>,
    allow_headers: Vec<String>,
    expose_headers: Vec<String>,
    allow_headers_value: HeaderValue,
    expose_headers_value: Option<HeaderValue>,
    max_age: u32,
}

impl CorsPolicy {
    /// Compile `settings`, rejecting origins or header names that cannot be sent.
    pub fn new(settings: &CorsSettings) -> AppResult<Self> {
        let misconfigured = |message: String| AppError::misconfigured(CorsExtension::NAME, message);

        for origin in &settings.origins {
            HeaderValue::from_str(origin)
                .map_err(|_| misconfigured(format!("invalid origin {origin:?}")))?;
        }

        let allow_headers = allowed_headers(settings);
        let expose_headers = exposed_headers(settings);
        for name in allow_headers.iter().chain(&expose_headers) {
            HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| misconfigured(format!("invalid header name {name:?}")))?;
        }

        let allow_headers_value = HeaderValue::from_str(&allow_headers.join(", "))
            .map_err(|e| misconfigured(e.to_string()))?;
        let expose_headers_value = if expose_headers.is_empty() {
            None
        } else {
            Some(
                HeaderValue::from_str(&expose_headers.join(", "))
                    .map_err(|e| misconfigured(e.to_string()))?,
            )
        };

        Ok(Self {
            origins: settings.origins.iter().map(|o| OriginPattern::parse(o)).collect(),
            allow_headers,
            expose_headers,
            allow_headers_value,
            expose_headers_value,
            max_age: PREFLIGHT_MAX_AGE,
        })
    }

    /// Allowed request headers, in the order they are advertised.
    pub fn allow_headers(&self) -> &[String] {
        &self.allow_headers
    }

    /// Exposed response headers.
    pub fn expose_headers(&self) -> &[String] {
        &self.expose_headers
    }

    /// Preflight cache lifetime in seconds.
    pub fn max_age(&self) -> u32 {
        self.max_age
    }

    fn allows_any_origin(&self) -> bool {
        self.origins.contains(&OriginPattern::Any)
    }

    /// `Access-Control-Allow-Origin` value for `origin`, or `None` if not allowed.
    pub fn allowed_origin(&self, origin: &HeaderValue) -> Option<HeaderValue> {
        if self.allows_any_origin() {
            return Some(HeaderValue::from_static("*"));
        }
        let text = origin.to_str().ok()?;
        self.origins
            .iter()
            .any(|pattern| pattern.matches(text))
            .then(|| origin.clone())
    }

    fn request_origin(&self, request: &Request) -> Option<HeaderValue> {
        request
            .headers()
            .get(ORIGIN)
            .and_then(|origin| self.allowed_origin(origin))
    }
}

/// Answer CORS preflight requests from allowed origins.
pub async fn preflight(
    State(policy): State<Arc<CorsPolicy>>,
    request: Request,
    next: Next,
) -> Response {
    if request.method() != Method::OPTIONS {
        return next.run(request).await;
    }
    let Some(requested_method) = request.headers().get(ACCESS_CONTROL_REQUEST_METHOD).cloned()
    else {
        return next.run(request).await;
    };
    let Some(allow_origin) = policy.request_origin(&request) else {
        debug!(
            origin = ?request.headers().get(ORIGIN),
            "CORS preflight from disallowed origin"
        );
        return next.run(request).await;
    };

    let mut response = StatusCode::NO_CONTENT.into_response();
    let headers = response.headers_mut();
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, allow_origin);
    headers.insert(ACCESS_CONTROL_ALLOW_METHODS, requested_method);
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        policy.allow_headers_value.clone(),
    );
    headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from(policy.max_age));
    if !policy.allows_any_origin() {
        headers.append(VARY, HeaderValue::from_static("Origin"));
    }
    response
}

/// Decorate responses to cross-origin requests from allowed origins.
pub async fn actual(
    State(policy): State<Arc<CorsPolicy>>,
    request: Request,
    next: Next,
) -> Response {
    let allow_origin = policy.request_origin(&request);
    let mut response = next.run(request).await;

    if let Some(allow_origin) = allow_origin {
        let headers = response.headers_mut();
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, allow_origin);
        if let Some(expose) = &policy.expose_headers_value {
            headers.insert(ACCESS_CONTROL_EXPOSE_HEADERS, expose.clone());
        }
        if !policy.allows_any_origin() {
            headers.append(VARY, HeaderValue::from_static("Origin"));
        }
    }
    response
}

/// Enables CORS on the server.
#[derive(Debug)]
pub struct CorsExtension {
    context: ExtensionContext,
}

impl Extension for CorsExtension {
    const NAME: &'static str = "cors";

    fn bind(context: ExtensionContext) -> Self {
        Self { context }
    }

    fn execute(self, config: Value) -> AppResult<Value> {
        let settings: CorsSettings = parse_config(Self::NAME, config, defaults())?;
        let policy = Arc::new(CorsPolicy::new(&settings)?);
        let server = self.context.server()?;

        server.pre(middleware::from_fn_with_state(Arc::clone(&policy), preflight));
        server.use_middleware(middleware::from_fn_with_state(Arc::clone(&policy), actual));

        info!(
            origins = ?settings.origins,
            allowed_headers = policy.allow_headers().len(),
            exposed_headers = policy.expose_headers().len(),
            "CORS enabled"
        );
        Ok(json!({
            "origins": settings.origins,
            "allowedHeaders": policy.allow_headers(),
            "exposedHeaders": policy.expose_headers(),
            "preflightMaxAge": policy.max_age(),
        }))
    }
}
