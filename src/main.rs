//! Entry point: CLI parsing, config load, startup, signal-driven reload
//! and graceful shutdown.

use std::path::Path;
use std::process::ExitCode as ProcessExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use log::{error, info, warn};

use sni_gateway::cli::{Cli, ExitCode};
use sni_gateway::config;
use sni_gateway::resolver::{Resolver, SystemResolver};
use sni_gateway::supervisor::Supervisor;

/// How long graceful shutdown waits, in total, for accept loops to stop
/// and in-flight connections to finish before the remainder are aborted.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

fn main() -> ProcessExitCode {
    env_logger::init();

    let cli = Cli::parse();

    let loaded: anyhow::Result<config::ConfigData> = config::load_from_path(Path::new(&cli.config))
        .with_context(|| format!("failed to load configuration from {}", cli.config));

    if cli.test {
        return match loaded {
            Ok(_) => {
                info!("configuration is valid");
                ProcessExitCode::from(u8::try_from(i32::from(ExitCode::Success)).unwrap())
            }
            Err(err) => {
                error!("configuration is invalid: {err:#}");
                ProcessExitCode::from(u8::try_from(i32::from(ExitCode::ConfigError)).unwrap())
            }
        };
    }

    let config_data = match loaded {
        Ok(data) => data,
        Err(err) => {
            error!("{err:#}");
            return ProcessExitCode::from(u8::try_from(i32::from(ExitCode::ConfigError)).unwrap());
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(err) => {
            error!("failed to start async runtime: {err}");
            return ProcessExitCode::from(u8::try_from(i32::from(ExitCode::RuntimeFatal)).unwrap());
        }
    };

    runtime.block_on(async move { run(cli, config_data).await })
}

async fn run(cli: Cli, config_data: config::ConfigData) -> ProcessExitCode {
    let resolver: Arc<dyn Resolver> = Arc::new(SystemResolver::new());

    let mut supervisor = match Supervisor::start(config_data, resolver) {
        Ok(supervisor) => supervisor,
        Err(err) => {
            error!("failed to bind listeners: {err}");
            return ProcessExitCode::from(u8::try_from(i32::from(ExitCode::BindError)).unwrap());
        }
    };

    let mut sighup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
        Ok(signal) => signal,
        Err(err) => {
            error!("failed to install SIGHUP handler: {err}");
            return ProcessExitCode::from(u8::try_from(i32::from(ExitCode::RuntimeFatal)).unwrap());
        }
    };
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(signal) => signal,
        Err(err) => {
            error!("failed to install SIGTERM handler: {err}");
            return ProcessExitCode::from(u8::try_from(i32::from(ExitCode::RuntimeFatal)).unwrap());
        }
    };

    loop {
        tokio::select! {
            _ = sighup.recv() => {
                info!("SIGHUP received, reloading configuration from {}", cli.config);
                match config::load_from_path(Path::new(&cli.config)) {
                    Ok(new_data) => supervisor.reconcile(new_data).await,
                    Err(err) => warn!("reload failed, keeping previous configuration: {err}"),
                }
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT received, shutting down");
                break;
            }
        }
    }

    supervisor.shutdown(SHUTDOWN_TIMEOUT).await;
    ProcessExitCode::from(u8::try_from(i32::from(ExitCode::Success)).unwrap())
}
