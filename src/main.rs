// src/main.rs

use anyhow::{Context, Result};
use clap::Parser;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use rediacc_plugin::cli::{self, Cli};
use rediacc_plugin::config::Config;
use rediacc_plugin::session_manager::SessionManager;
use rediacc_plugin::ssh_manager::OpenSshTransport;
use rediacc_plugin::state_store::{ConnectionStateStore, LockMode};
use rediacc_plugin::vault::CliVaultApi;

use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

/// RUST_LOG wins over `--log-level`, which wins over the config file. Logs go
/// to stderr so command output on stdout stays parseable.
fn init_tracing(cli_args: &Cli, config: &Config) -> Result<Option<WorkerGuard>> {
    let fallback = cli_args
        .log_level
        .map(|level| level.as_filter().to_string())
        .unwrap_or_else(|| config.logging.level.clone());
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&fallback))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = if config.logging.file {
        let log_dir = config.log_dir();
        std::fs::create_dir_all(&log_dir)
            .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;
        let appender = tracing_appender::rolling::daily(&log_dir, "rediacc-plugin.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        (
            Some(fmt::layer().with_writer(writer).with_ansi(false)),
            Some(guard),
        )
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(file_layer)
        .try_init()
        .context("Setting default tracing subscriber failed")?;
    Ok(guard)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    let cli_args = Cli::parse();

    let config = Arc::new(
        Config::load(cli_args.config.as_deref()).context("Failed to load configuration")?,
    );
    let _log_guard = init_tracing(&cli_args, &config)?;
    debug!("Loaded app config: {:?}", config);

    let state_file = config
        .state_file_path()
        .context("Failed to determine the connection state file")?;
    info!("Using connection state at {}", state_file.display());

    let vault_api = Arc::new(CliVaultApi::new(
        config.api_binary(),
        Duration::from_secs(config.api.timeout_secs),
    ));
    let transport = Arc::new(OpenSshTransport::new(
        "ssh",
        Duration::from_secs(config.tunnel.probe_timeout_secs),
        Duration::from_secs(config.tunnel.connect_timeout_secs),
        config.control_dir(),
    ));
    let session_manager = SessionManager::new(
        Arc::clone(&config),
        vault_api,
        transport,
        ConnectionStateStore::new(state_file, LockMode::default()),
    );

    Ok(cli::handle_command(cli_args.command, cli_args.output, &session_manager).await)
}
