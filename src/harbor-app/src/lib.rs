//! Harbor - a process-wide application wrapper around an HTTP server.
//!
//! This crate provides:
//! - A singleton [`ApplicationCore`] owning the server, settings and event bus
//! - Two middleware chains: pre-routing and request-handling
//! - Graceful shutdown gated on acknowledgments from every shutdown listener
//! - Extensions that mutate the server pipeline (CORS, health, readiness, ping)
//! - A JSON formatter that unwraps wrapped errors and base64-encodes binary bodies

#![deny(clippy::print_stdout, clippy::print_stderr)]

pub mod application;
pub mod config;
pub mod error;
pub mod events;
pub mod extensions;
pub mod formatter;
pub mod server;
pub mod shutdown;

use std::sync::Arc;

use once_cell::sync::OnceCell;

pub use application::{ApplicationCore, ApplicationOptions, Readiness};
pub use config::Settings;
pub use error::{AppError, AppResult};
pub use events::{EventBus, EventPayload};
pub use extensions::{Extension, ExtensionContext};
pub use formatter::{Formatter, Formatters, JsonFormatter, Payload, WrappedError};
pub use server::Server;
pub use shutdown::{SHUTDOWN_EVENT, ShutdownAck, ShutdownPhase, ShutdownReport};

static APPLICATION: OnceCell<Arc<ApplicationCore>> = OnceCell::new();

/// Get the process-wide application, creating it on first call.
///
/// `options` only take effect on the first call; later calls return the
/// existing instance unchanged.
pub fn get_application(options: ApplicationOptions) -> Arc<ApplicationCore> {
    Arc::clone(APPLICATION.get_or_init(|| Arc::new(ApplicationCore::new(options))))
}

/// The application, if [`get_application`] has been called.
pub fn try_application() -> Option<Arc<ApplicationCore>> {
    APPLICATION.get().cloned()
}
