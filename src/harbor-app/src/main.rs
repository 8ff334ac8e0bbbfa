//! Harbor server binary.

use std::net::IpAddr;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use harbor_app::{ApplicationCore, ApplicationOptions, Settings, get_application};

/// Harbor application server
#[derive(Parser)]
#[command(name = "harbor-server")]
#[command(about = "Application server with graceful shutdown and CORS")]
#[command(version)]
struct Args {
    /// Configuration file path (JSON)
    #[arg(short, long)]
    config: Option<String>,

    /// Bind address
    #[arg(long)]
    host: Option<IpAddr>,

    /// Bind port
    #[arg(short, long)]
    port: Option<u16>,

    /// Environment tag (DEV, PROD, TEST)
    #[arg(short, long)]
    env: Option<String>,

    /// Log level
    #[arg(long)]
    log_level: Option<String>,

    /// Enable JSON logging
    #[arg(long)]
    json_logs: bool,
}

fn setup_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if json {
        subscriber
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        subscriber
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }
}

fn load_settings(args: &Args) -> anyhow::Result<Settings> {
    let mut settings = match &args.config {
        Some(path) => Settings::load(path)?,
        None => Settings::from_env()?,
    };

    if let Some(host) = args.host {
        settings.host = host;
    }
    if let Some(port) = args.port {
        settings.port = port;
    }
    if let Some(env) = &args.env {
        settings.env = env.to_ascii_uppercase();
    }
    if let Some(level) = &args.log_level {
        settings.logging.level = level.clone();
    }
    if args.json_logs {
        settings.logging.format = "json".to_string();
    }
    Ok(settings)
}

fn activate_extensions(app: &ApplicationCore, settings: &Settings) -> anyhow::Result<()> {
    let extensions = &settings.extensions;
    if let Some(cors) = &extensions.cors {
        app.enable_cors(cors.clone()).context("Failed to enable CORS")?;
    }
    if let Some(health) = &extensions.health {
        app.add_health_status(health.clone())
            .context("Failed to add health status endpoint")?;
    }
    if let Some(readiness) = &extensions.readiness {
        app.add_readiness_probe(readiness.clone())
            .context("Failed to add readiness probe")?;
    }
    if extensions.ping {
        app.add_ping_endpoint()
            .context("Failed to add ping endpoint")?;
    }
    Ok(())
}

async fn exit_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

async fn run(settings: Settings) -> anyhow::Result<()> {
    let app = get_application(ApplicationOptions::new());
    activate_extensions(&app, &settings)?;
    app.set_settings(settings);

    app.listen(|_| info!("Press Ctrl+C to stop")).await?;
    if let Some(url) = app.url() {
        info!("Listening on {}", url);
    }

    let report = app.run_until_exit(exit_signal()).await?;
    if report.timed_out {
        error!(
            "Shutdown finished with {}/{} acknowledgments",
            report.received_acks, report.expected_acks
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let settings = match load_settings(&args) {
        Ok(settings) => settings,
        Err(e) => {
            setup_logging("info", args.json_logs);
            error!("Failed to load settings: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    setup_logging(
        &settings.logging.level,
        settings.logging.format.eq_ignore_ascii_case("json"),
    );

    if let Err(e) = run(settings).await {
        error!("Server error: {:#}", e);
        return ExitCode::FAILURE;
    }

    info!("Server stopped");
    ExitCode::SUCCESS
}
