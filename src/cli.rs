// src/cli.rs

use clap::{Args, Parser, Subcommand};
use crossterm::style::Stylize;
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::debug;
use unicode_width::UnicodeWidthStr;

use crate::errors::TunnelResult;
use crate::plugin_discovery::PluginListing;
use crate::session_manager::{
    ConnectRequest, ConnectionHealth, Disconnected, SessionManager, StatusReport,
};
use crate::state_store::{ConnectionFilter, TunnelConnection};
use crate::tunnel_engine::StepResult;

/// rediacc-plugin: tunnels to plugin sockets inside remote repositories
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional path to the configuration file
    #[clap(long, value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Set log level (RUST_LOG takes precedence)
    #[clap(long, value_name = "LEVEL", value_enum, global = true)]
    pub log_level: Option<LogLevelCli>,

    /// Output format
    #[clap(long, value_enum, default_value_t = OutputFormat::Table, global = true)]
    pub output: OutputFormat,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug, Clone)]
pub struct RepositoryArgs {
    #[clap(long)]
    pub team: String,
    #[clap(long)]
    pub machine: String,
    #[clap(long)]
    pub repo: String,
    /// Skip host key verification
    #[clap(long)]
    pub dev: bool,
}

#[derive(Args, Debug, Clone)]
#[group(required = true, multiple = true)]
pub struct DisconnectArgs {
    #[clap(long)]
    pub connection_id: Option<String>,
    #[clap(long)]
    pub team: Option<String>,
    #[clap(long)]
    pub machine: Option<String>,
    #[clap(long)]
    pub repo: Option<String>,
    #[clap(long)]
    pub plugin: Option<String>,
    /// Disconnect every recorded tunnel
    #[clap(long, conflicts_with_all = ["connection_id", "team", "machine", "repo", "plugin"])]
    pub all: bool,
}

impl DisconnectArgs {
    pub fn filter(&self) -> ConnectionFilter {
        if self.all {
            return ConnectionFilter::default();
        }
        ConnectionFilter {
            connection_id: self.connection_id.clone(),
            team: self.team.clone(),
            machine: self.machine.clone(),
            repo: self.repo.clone(),
            plugin: self.plugin.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List plugins available in a repository
    List {
        #[clap(flatten)]
        repository: RepositoryArgs,
    },
    /// Open a tunnel to a plugin
    Connect {
        #[clap(flatten)]
        repository: RepositoryArgs,
        #[clap(long)]
        plugin: String,
        /// Local port (default: first free port in the configured range)
        #[clap(long)]
        port: Option<u16>,
    },
    /// Close tunnels
    Disconnect(DisconnectArgs),
    /// Show recorded tunnels and whether they are up
    Status,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogLevelCli {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevelCli {
    pub fn as_filter(self) -> &'static str {
        match self {
            LogLevelCli::Trace => "trace",
            LogLevelCli::Debug => "debug",
            LogLevelCli::Info => "info",
            LogLevelCli::Warn => "warn",
            LogLevelCli::Error => "error",
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
}

pub async fn handle_command(
    command: Commands,
    output: OutputFormat,
    session_manager: &SessionManager,
) -> ExitCode {
    let result = match command {
        Commands::List { repository } => handle_list(repository, output, session_manager).await,
        Commands::Connect {
            repository,
            plugin,
            port,
        } => {
            let request = ConnectRequest {
                team: repository.team,
                machine: repository.machine,
                repo: repository.repo,
                plugin,
                port,
                dev: repository.dev,
            };
            handle_connect(request, output, session_manager).await
        }
        Commands::Disconnect(args) => handle_disconnect(args, output, session_manager).await,
        Commands::Status => handle_status(output, session_manager).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            debug!("Command failed: {:?}", e);
            eprintln!("{} {}", "Error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn handle_list(
    repository: RepositoryArgs,
    output: OutputFormat,
    session_manager: &SessionManager,
) -> TunnelResult<()> {
    let listing = session_manager
        .list(
            &repository.team,
            &repository.machine,
            &repository.repo,
            repository.dev,
        )
        .await?;
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&listing)?),
        OutputFormat::Table => {
            if listing.containers.is_none() {
                eprintln!(
                    "{} could not query plugin containers; showing sockets only",
                    "Warning:".yellow().bold()
                );
            }
            print!("{}", render_listing(&listing));
        }
    }
    Ok(())
}

async fn handle_connect(
    request: ConnectRequest,
    output: OutputFormat,
    session_manager: &SessionManager,
) -> TunnelResult<()> {
    let connection = session_manager.connect(&request).await?;
    match output {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "connection_id": connection.connection_id,
                "plugin": connection.plugin,
                "local_port": connection.local_port,
                "url": connection.local_url(),
                "strategy": connection.strategy,
            }))?
        ),
        OutputFormat::Table => {
            println!(
                "{} {} ({})",
                "Connected".green().bold(),
                connection.plugin,
                connection.connection_id
            );
            println!("  URL: {}", connection.local_url());
        }
    }
    Ok(())
}

async fn handle_disconnect(
    args: DisconnectArgs,
    output: OutputFormat,
    session_manager: &SessionManager,
) -> TunnelResult<()> {
    let disconnected = session_manager.disconnect(&args.filter()).await?;
    match output {
        OutputFormat::Json => {
            let entries: Vec<_> = disconnected
                .iter()
                .map(|d| {
                    json!({
                        "connection_id": d.connection.connection_id,
                        "plugin": d.connection.plugin,
                        "local_port": d.connection.local_port,
                        "process_stopped": d.report.process_stopped(),
                        "credentials_removed": d.report.credentials_removed,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        OutputFormat::Table => print!("{}", render_disconnected(&disconnected)),
    }
    Ok(())
}

async fn handle_status(output: OutputFormat, session_manager: &SessionManager) -> TunnelResult<()> {
    let report = session_manager.status().await?;
    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Table => print!("{}", render_status(&report)),
    }
    Ok(())
}

/// Left-aligned columns padded by display width.
pub fn render_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = headers.iter().map(|h| h.width()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if let Some(width) = widths.get_mut(i) {
                *width = (*width).max(cell.width());
            }
        }
    }

    let render_row = |cells: Vec<&str>| -> String {
        let line = cells
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!("{}{}", cell, " ".repeat(width - cell.width())))
            .collect::<Vec<_>>()
            .join("  ");
        format!("{}\n", line.trim_end())
    };

    let mut out = render_row(headers.to_vec());
    let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
    out.push_str(&render_row(rule.iter().map(String::as_str).collect()));
    for row in rows {
        out.push_str(&render_row(row.iter().map(String::as_str).collect()));
    }
    out
}

pub fn render_status(report: &StatusReport) -> String {
    let mut out = String::new();
    for pruned in &report.pruned {
        out.push_str(&format!(
            "Removed stale connection {} ({})\n",
            pruned.connection_id, pruned.plugin
        ));
    }
    if report.connections.is_empty() {
        out.push_str("No active plugin connections\n");
        return out;
    }
    let rows: Vec<Vec<String>> = report
        .connections
        .iter()
        .map(|entry| {
            let c = &entry.connection;
            vec![
                c.connection_id.clone(),
                c.plugin.clone(),
                format!("{}/{}", c.team, c.repo),
                c.machine.clone(),
                c.local_port.to_string(),
                match entry.health {
                    ConnectionHealth::Active => "Active".to_string(),
                    ConnectionHealth::Error => "Error".to_string(),
                },
            ]
        })
        .collect();
    out.push_str(&render_table(
        &["ID", "Plugin", "Repository", "Machine", "Port", "Status"],
        &rows,
    ));
    out
}

pub fn render_listing(listing: &PluginListing) -> String {
    let mut out = String::new();
    if listing.plugins.is_empty() {
        out.push_str("No plugin sockets found\n");
    } else {
        let rows: Vec<Vec<String>> = listing
            .plugins
            .iter()
            .map(|p| {
                let url = connection_for(&listing.connections, &p.name)
                    .map(TunnelConnection::local_url)
                    .unwrap_or_default();
                vec![
                    p.name.clone(),
                    p.container_status.clone().unwrap_or_else(|| "-".to_string()),
                    url,
                ]
            })
            .collect();
        out.push_str(&render_table(&["Plugin", "Container", "Connection"], &rows));
    }

    if let Some(containers) = &listing.containers {
        if !containers.is_empty() {
            out.push('\n');
            let rows: Vec<Vec<String>> = containers
                .iter()
                .map(|c| vec![c.name.clone(), c.status.clone()])
                .collect();
            out.push_str(&render_table(&["Container", "Status"], &rows));
        }
    }
    out
}

fn connection_for<'c>(connections: &'c [TunnelConnection], plugin: &str) -> Option<&'c TunnelConnection> {
    connections.iter().find(|c| c.plugin == plugin)
}

pub fn render_disconnected(disconnected: &[Disconnected]) -> String {
    if disconnected.is_empty() {
        return "No matching connections\n".to_string();
    }
    let mut out = String::new();
    for d in disconnected {
        out.push_str(&format!(
            "Disconnected {} ({} on port {})\n",
            d.connection.connection_id, d.connection.plugin, d.connection.local_port
        ));
        if !d.report.process_stopped() {
            out.push_str("  tunnel process may still be running\n");
        }
        if let StepResult::Failed(reason) = &d.report.remote_cleanup {
            out.push_str(&format!("  remote bridge cleanup failed: {}\n", reason));
        }
        if !d.report.credentials_removed {
            out.push_str("  some credential files could not be removed\n");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_parse_connect() {
        let cli = Cli::try_parse_from([
            "rediacc-plugin",
            "--output",
            "json",
            "connect",
            "--team",
            "QA",
            "--machine",
            "m1",
            "--repo",
            "r1",
            "--plugin",
            "browser",
            "--port",
            "7200",
        ])
        .unwrap();
        assert_eq!(cli.output, OutputFormat::Json);
        match cli.command {
            Commands::Connect {
                repository,
                plugin,
                port,
            } => {
                assert_eq!(repository.team, "QA");
                assert!(!repository.dev);
                assert_eq!(plugin, "browser");
                assert_eq!(port, Some(7200));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_disconnect_requires_a_selector() {
        assert!(Cli::try_parse_from(["rediacc-plugin", "disconnect"]).is_err());
        assert!(Cli::try_parse_from(["rediacc-plugin", "disconnect", "--all", "--team", "QA"]).is_err());

        let cli = Cli::try_parse_from(["rediacc-plugin", "disconnect", "--plugin", "browser"]).unwrap();
        let Commands::Disconnect(args) = cli.command else {
            panic!("expected disconnect");
        };
        let filter = args.filter();
        assert_eq!(filter.plugin.as_deref(), Some("browser"));
        assert!(filter.team.is_none());
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["rediacc-plugin", "status", "--log-level", "debug"]).unwrap();
        assert_eq!(cli.log_level, Some(LogLevelCli::Debug));
        assert!(matches!(cli.command, Commands::Status));
    }

    #[test]
    fn test_render_table_aligns_wide_characters() {
        let table = render_table(
            &["ID", "Plugin"],
            &[
                vec!["a1".to_string(), "browser".to_string()],
                vec!["b2".to_string(), "終端".to_string()],
            ],
        );
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines[0], "ID  Plugin");
        assert_eq!(lines[1], "--  -------");
        assert_eq!(lines[2], "a1  browser");
        assert_eq!(lines[3], "b2  終端");
    }

    #[test]
    fn test_render_empty_status() {
        assert_eq!(
            render_status(&StatusReport::default()),
            "No active plugin connections\n"
        );
    }
}
