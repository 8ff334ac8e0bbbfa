//! HTTP server handle: routes, middleware chains and the listening socket.
//!
//! Two middleware chains are kept, both executed in registration order:
//!
//! - `pre` layers wrap the router and run before route matching, so they see
//!   every request, including ones no route handles (CORS preflight).
//! - `use_middleware` layers are applied to every route and the fallback,
//!   after routing.
//!
//! The router is assembled when the server starts listening; changes made
//! afterwards apply to the next `listen`.

use std::collections::HashSet;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::Request;
use axum::response::IntoResponse;
use axum::routing::{MethodRouter, Route};
use axum::{Extension, Router};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower::{Layer, Service};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::error::{AppError, AppResult};
use crate::formatter::Formatters;

type Hook = Box<dyn Fn(Router) -> Router + Send + Sync>;

#[derive(Default)]
struct Pipeline {
    routes: Router,
    paths: HashSet<String>,
    pre: Vec<Hook>,
    chain: Vec<Hook>,
}

struct Running {
    local_addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<std::io::Result<()>>,
}

enum ServerState {
    Idle,
    Listening(Running),
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment<'a> {
    Static(&'a str),
    Capture(&'a str),
    CatchAll(&'a str),
}

fn is_capture_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Split a route path into segments: `/static`, `/{name}` or a final
/// `/{*name}`. Anything the router would refuse at insertion is an error.
fn parse_path(path: &str) -> Result<Vec<Segment<'_>>, &'static str> {
    let Some(rest) = path.strip_prefix('/') else {
        return Err("paths must start with `/`");
    };
    if rest.is_empty() {
        return Ok(Vec::new());
    }

    let parts: Vec<&str> = rest.split('/').collect();
    let last = parts.len() - 1;
    let mut segments = Vec::with_capacity(parts.len());
    for (index, part) in parts.into_iter().enumerate() {
        if part.is_empty() {
            return Err("path segments must not be empty");
        }
        if part.starts_with(':') || part.starts_with('*') {
            return Err("path segments must not start with `:` or `*`");
        }

        let segment = match part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
            Some(inner) => match inner.strip_prefix('*') {
                Some(_) if index != last => return Err("catch-all must be the last segment"),
                Some(name) if is_capture_name(name) => Segment::CatchAll(name),
                Some(_) => return Err("malformed catch-all capture"),
                None if is_capture_name(inner) => Segment::Capture(inner),
                None => return Err("malformed capture"),
            },
            None if part.contains(['{', '}']) => {
                return Err("captures must span a whole segment");
            }
            None => Segment::Static(part),
        };
        segments.push(segment);
    }
    Ok(segments)
}

/// Whether two routes share a prefix that ends in captures the router
/// cannot hold side by side (different names, or a capture beside a catch-all).
fn captures_conflict(a: &[Segment<'_>], b: &[Segment<'_>]) -> bool {
    for (left, right) in a.iter().zip(b) {
        match (left, right) {
            (Segment::Static(x), Segment::Static(y)) if x == y => continue,
            (Segment::Static(_), _) | (_, Segment::Static(_)) => return false,
            (left, right) if left == right => continue,
            _ => return true,
        }
    }
    false
}

/// The HTTP listener/dispatcher owned by the application core.
pub struct Server {
    pipeline: Mutex<Pipeline>,
    formatters: Arc<Formatters>,
    state: Mutex<ServerState>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pipeline = self.pipeline.lock();
        f.debug_struct("Server")
            .field("pre", &pipeline.pre.len())
            .field("chain", &pipeline.chain.len())
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new(Formatters::default())
    }
}

impl Server {
    /// Create a server that renders responses with `formatters`.
    pub fn new(formatters: Formatters) -> Self {
        Self {
            pipeline: Mutex::new(Pipeline::default()),
            formatters: Arc::new(formatters),
            state: Mutex::new(ServerState::Idle),
        }
    }

    /// Formatter table shared with handlers through request extensions.
    pub fn formatters(&self) -> &Arc<Formatters> {
        &self.formatters
    }

    /// Add a route. Each path can be registered once.
    ///
    /// Paths are checked against the router's grammar and against the
    /// captures of routes already registered, so a rejected path leaves the
    /// route table untouched.
    pub fn route(&self, path: &str, method_router: MethodRouter) -> AppResult<()> {
        let invalid = |reason| AppError::InvalidRoute {
            path: path.to_string(),
            reason,
        };
        let segments = parse_path(path).map_err(invalid)?;

        let mut pipeline = self.pipeline.lock();
        if pipeline.paths.contains(path) {
            return Err(invalid("path is already registered"));
        }
        let conflicting = pipeline.paths.iter().any(|existing| {
            parse_path(existing).is_ok_and(|other| captures_conflict(&segments, &other))
        });
        if conflicting {
            return Err(invalid("capture conflicts with a registered route"));
        }

        pipeline.paths.insert(path.to_string());
        let routes = std::mem::take(&mut pipeline.routes);
        pipeline.routes = routes.route(path, method_router);
        debug!(path, "Route registered");
        Ok(())
    }

    /// Whether a route is registered at `path`.
    pub fn has_route(&self, path: &str) -> bool {
        self.pipeline.lock().paths.contains(path)
    }

    /// Append a layer to the pre-routing chain.
    pub fn pre<L>(&self, layer: L)
    where
        L: Layer<Route> + Clone + Send + Sync + 'static,
        L::Service: Service<Request> + Clone + Send + Sync + 'static,
        <L::Service as Service<Request>>::Response: IntoResponse + 'static,
        <L::Service as Service<Request>>::Error: Into<Infallible> + 'static,
        <L::Service as Service<Request>>::Future: Send + 'static,
    {
        self.pipeline
            .lock()
            .pre
            .push(Box::new(move |router: Router| router.layer(layer.clone())));
    }

    /// Append a layer to the request-handling chain.
    pub fn use_middleware<L>(&self, layer: L)
    where
        L: Layer<Route> + Clone + Send + Sync + 'static,
        L::Service: Service<Request> + Clone + Send + Sync + 'static,
        <L::Service as Service<Request>>::Response: IntoResponse + 'static,
        <L::Service as Service<Request>>::Error: Into<Infallible> + 'static,
        <L::Service as Service<Request>>::Future: Send + 'static,
    {
        self.pipeline
            .lock()
            .chain
            .push(Box::new(move |router: Router| router.layer(layer.clone())));
    }

    /// Number of layers in the (pre-routing, request-handling) chains.
    pub fn middleware_count(&self) -> (usize, usize) {
        let pipeline = self.pipeline.lock();
        (pipeline.pre.len(), pipeline.chain.len())
    }

    /// Assemble the service: trace -> pre chain -> routing -> chain -> handler.
    pub fn router(&self) -> Router {
        let pipeline = self.pipeline.lock();

        // Router::layer makes the last layer outermost, so apply in reverse
        // to run the chain in registration order.
        let mut routed = pipeline
            .routes
            .clone()
            .layer(Extension(Arc::clone(&self.formatters)));
        for hook in pipeline.chain.iter().rev() {
            routed = hook(routed);
        }

        let mut app = Router::new().fallback_service(routed);
        for hook in pipeline.pre.iter().rev() {
            app = hook(app);
        }

        app.layer(TraceLayer::new_for_http())
    }

    /// Bind `addr` and start serving. Returns the bound address.
    pub async fn listen(&self, addr: SocketAddr) -> AppResult<SocketAddr> {
        if let Some(bound) = self.local_addr() {
            return Err(AppError::AlreadyListening(bound));
        }

        let listener = TcpListener::bind(addr).await.map_err(|source| {
            error!(%addr, error = %source, "Failed to bind server");
            AppError::Bind { addr, source }
        })?;
        let local_addr = listener.local_addr()?;
        let app = self.router();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let mut state = self.state.lock();
        if let ServerState::Listening(running) = &*state {
            return Err(AppError::AlreadyListening(running.local_addr));
        }

        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        *state = ServerState::Listening(Running {
            local_addr,
            shutdown_tx,
            task,
        });
        info!(%local_addr, "Server listening");
        Ok(local_addr)
    }

    /// Address of the bound socket, while listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.state.lock() {
            ServerState::Listening(running) => Some(running.local_addr),
            ServerState::Idle | ServerState::Closed => None,
        }
    }

    /// Whether the server is bound.
    pub fn is_listening(&self) -> bool {
        self.local_addr().is_some()
    }

    /// Whether the server has been closed since it last listened.
    pub fn is_closed(&self) -> bool {
        matches!(&*self.state.lock(), ServerState::Closed)
    }

    /// Stop accepting connections and wait for in-flight requests to finish.
    ///
    /// Closing a server that is not listening is an error rather than a no-op.
    pub async fn close(&self) -> AppResult<()> {
        let running = {
            let mut state = self.state.lock();
            match std::mem::replace(&mut *state, ServerState::Closed) {
                ServerState::Listening(running) => running,
                previous => {
                    *state = previous;
                    return Err(AppError::NotListening);
                }
            }
        };

        debug!(local_addr = %running.local_addr, "Closing server");
        let _ = running.shutdown_tx.send(());
        match running.task.await {
            Ok(result) => result?,
            Err(join_error) => return Err(AppError::Internal(join_error.to_string())),
        }
        info!(local_addr = %running.local_addr, "Server closed");
        Ok(())
    }
}
