// src/errors.rs
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TunnelError {
    // Resolution errors
    #[error("Team not found: {team}")]
    TeamNotFound { team: String },

    #[error("Machine '{machine}' not found in team '{team}' or any other accessible team")]
    MachineNotFound { team: String, machine: String },

    #[error("Repository '{repo}' not found in team '{team}' (no repoGuid in API response)")]
    RepositoryNotFound { team: String, repo: String },

    #[error("No SSH private key found in any team vault (requested team: {team})")]
    SshKeyNotFound { team: String },

    #[error("Machine '{machine}' vault is missing required field '{field}'")]
    MachineVaultIncomplete { machine: String, field: String },

    #[error("API call '{operation}' failed: {message}")]
    ApiFailure { operation: String, message: String },

    // Capability errors
    #[error("Plugin socket not found on remote host: {socket_path} (run `list` to see available plugins)")]
    PluginSocketNotFound { socket_path: String },

    #[error("Local SSH client does not support Unix socket forwarding ({ssh_version}) and socat is not installed on the remote host; upgrade to OpenSSH 6.7+ or install socat")]
    UnsupportedSshClient { ssh_version: String },

    #[error("SSH connection to {host} failed: {reason}")]
    SshConnectionFailed { host: String, reason: String },

    // Launch errors
    #[error("Failed to start tunnel: {stderr}")]
    LaunchFailed { stderr: String },

    #[error("{probe} timed out after {seconds}s")]
    ProbeTimeout { probe: String, seconds: u64 },

    #[error("Failed to run {program}: {source}")]
    Command {
        program: String,
        #[source]
        source: std::io::Error,
    },

    // Resource errors
    #[error("No available ports in range {start}-{end}")]
    NoPortsAvailable { start: u16, end: u16 },

    #[error("Port {port} is not available")]
    PortUnavailable { port: u16 },

    #[error("Invalid port {port}: must be between 1024 and 65535")]
    InvalidPort { port: u16 },

    #[error("Plugin already connected on port {port} (connection id {connection_id})")]
    AlreadyConnected { connection_id: String, port: u16 },

    #[error("Connection state is locked by another process ({path})")]
    StateLocked { path: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type TunnelResult<T> = std::result::Result<T, TunnelError>;
