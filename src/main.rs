//! Streamwatch - live media source supervisor
//!
//! Entry point: loads the saved configuration, starts one connection
//! controller per source and serves the reporting API until Ctrl+C.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use streamwatch_core::alerts::{
    AlertSound, EmailChannel, HttpNotificationTransport, NotificationTransport, SystemTone,
};
use streamwatch_core::{
    AlertRouter, ConfigStore, Configuration, HttpProbeEngine, JsonFileStore, ProbeSettings,
    Supervisor, BUILD_DATE, VERSION,
};
use streamwatch_server::{AppState, ServerConfig};
use tokio::sync::Notify;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

/// Command line options
#[derive(Debug, Default, PartialEq)]
struct Options {
    config: Option<PathBuf>,
    port: Option<u16>,
    bind: Option<String>,
    log_dir: Option<PathBuf>,
    email_endpoint: Option<String>,
    print_config: bool,
}

/// What the command line asked for
#[derive(Debug, PartialEq)]
enum Invocation {
    Run(Options),
    Help,
    Version,
}

fn parse_args(args: &[String]) -> Result<Invocation> {
    let mut options = Options::default();
    let mut i = 1;

    while i < args.len() {
        let flag = args[i].as_str();
        let value = || {
            args.get(i + 1)
                .cloned()
                .with_context(|| format!("{} requires a value", flag))
        };
        match flag {
            "--help" | "-h" => return Ok(Invocation::Help),
            "--version" | "-v" => return Ok(Invocation::Version),
            "--print-config" => {
                options.print_config = true;
                i += 1;
                continue;
            }
            "--config" | "-c" => options.config = Some(PathBuf::from(value()?)),
            "--port" | "-p" => {
                let port = value()?;
                options.port = Some(
                    port.parse()
                        .with_context(|| format!("Invalid port: {}", port))?,
                );
            }
            "--bind" | "-b" => options.bind = Some(value()?),
            "--log-dir" => options.log_dir = Some(PathBuf::from(value()?)),
            "--email-endpoint" => options.email_endpoint = Some(value()?),
            other => anyhow::bail!("Unknown argument: {}", other),
        }
        i += 2;
    }

    Ok(Invocation::Run(options))
}

fn print_help() {
    println!("Usage: streamwatch [OPTIONS]");
    println!();
    println!("Options:");
    println!("  -c, --config PATH         Configuration file (default: <data dir>/streamwatch/config.json)");
    println!("  -p, --port N              Port for the reporting server (default: 8920)");
    println!("  -b, --bind ADDR           Bind address (default: 0.0.0.0)");
    println!("      --log-dir DIR         Also write daily-rolling logs to DIR");
    println!("      --email-endpoint URL  Endpoint receiving email notification requests");
    println!("      --print-config        Print the effective configuration and exit");
    println!("  -v, --version             Show version");
    println!("  -h, --help                Show this help");
    println!();
    println!("Log verbosity follows RUST_LOG (default: streamwatch=info).");
}

/// Console logging, plus a daily-rolling file when `log_dir` is set
///
/// The returned guard flushes the file writer and must be kept alive.
fn init_logging(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::from_default_env().add_directive("streamwatch=info".parse()?);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "streamwatch.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();

    Ok(guard)
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let options = match parse_args(&args) {
        Ok(Invocation::Run(options)) => options,
        Ok(Invocation::Help) => {
            print_help();
            return Ok(());
        }
        Ok(Invocation::Version) => {
            println!("streamwatch {} ({})", VERSION, BUILD_DATE);
            return Ok(());
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            std::process::exit(2);
        }
    };

    let _log_guard = init_logging(options.log_dir.as_deref())?;

    let store = JsonFileStore::new(
        options
            .config
            .clone()
            .unwrap_or_else(JsonFileStore::default_path),
    );
    let mut config = store.load().unwrap_or_default();
    if let Some(endpoint) = &options.email_endpoint {
        config.monitor.email_endpoint = Some(endpoint.clone());
    }

    if options.print_config {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create Tokio runtime")?;
    runtime.block_on(run(options, store, config))
}

async fn run(options: Options, store: JsonFileStore, config: Configuration) -> Result<()> {
    tracing::info!(
        config = %store.path().display(),
        "Starting Streamwatch v{} ({})",
        VERSION,
        BUILD_DATE
    );

    let monitor = config.monitor.clone();
    let sound: Arc<dyn AlertSound> = Arc::new(SystemTone::new(monitor.require_audio_gesture));
    let transport: Arc<dyn NotificationTransport> =
        Arc::new(HttpNotificationTransport::new(monitor.email_endpoint.clone()));
    let router = Arc::new(AlertRouter::new(
        config.notifications.clone(),
        monitor.max_alerts,
        sound,
        EmailChannel::new(transport),
    ));
    let engine = Arc::new(HttpProbeEngine::new(ProbeSettings::default())?);

    let supervisor = Arc::new(Supervisor::new(engine, router, monitor));
    supervisor.apply_configuration(config).await;

    let defaults = ServerConfig::default();
    let server_config = ServerConfig {
        port: options.port.unwrap_or(defaults.port),
        bind_addr: options.bind.unwrap_or(defaults.bind_addr),
    };
    let store: Arc<dyn ConfigStore> = Arc::new(store);
    let state = AppState::new(Arc::clone(&supervisor), store, server_config);

    let shutdown = Arc::new(Notify::new());
    let signal = Arc::clone(&shutdown);
    ctrlc::set_handler(move || signal.notify_one()).context("Failed to set Ctrl+C handler")?;

    let result = tokio::select! {
        result = streamwatch_server::start_server(state) => result,
        _ = shutdown.notified() => {
            tracing::info!("Shutdown requested");
            Ok(())
        }
    };

    supervisor.shutdown().await;
    result
}
