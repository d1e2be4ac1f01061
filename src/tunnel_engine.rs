// src/tunnel_engine.rs
// Chooses a tunneling strategy, launches the long-running ssh process and tears it down again.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::credentials;
use crate::errors::{TunnelError, TunnelResult};
use crate::process::{self, TerminateOutcome};
use crate::sanitize::mask_sensitive;
use crate::ssh_manager::{
    as_user, check_connection, launch_failure_message, parse_master_pid, shell_quote,
    CommandOutput, ControlOp, LocalForward, OpensshVersion, SshTarget, SshTransport,
    DEFAULT_SSH_PORT,
};
use crate::state_store::TunnelConnection;

/// How local TCP traffic reaches the remote Unix socket.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TunnelStrategy {
    /// OpenSSH forwards `localhost:PORT` straight to the socket.
    #[default]
    Native,
    /// ssh forwards to a remote TCP port where `socat` bridges to the socket.
    SocatBridge,
}

impl fmt::Display for TunnelStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelStrategy::Native => write!(f, "native"),
            TunnelStrategy::SocatBridge => write!(f, "socat-bridge"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelState {
    Idle,
    ProbingCapability,
    Launching,
    Running,
    Stopping,
    Stopped,
    Failed(String),
}

/// Native forwarding when the local client can do it; `None` means the
/// remote must provide socat.
pub fn strategy_for_version(version: Option<OpensshVersion>) -> Option<TunnelStrategy> {
    match version {
        Some(v) if v.supports_unix_socket_forwarding() => Some(TunnelStrategy::Native),
        _ => None,
    }
}

/// Everything needed to open one tunnel.
#[derive(Debug, Clone)]
pub struct TunnelRequest {
    pub target: SshTarget,
    /// Remote account that owns the repository mount.
    pub run_as: Option<String>,
    pub socket_path: String,
    pub local_port: u16,
    pub control_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchedTunnel {
    pub strategy: TunnelStrategy,
    pub ssh_pid: Option<u32>,
    pub remote_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    Succeeded,
    Failed(String),
    Skipped,
}

/// What happened during each teardown step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    pub remote_cleanup: StepResult,
    pub control_stop: StepResult,
    pub signal: Option<TerminateOutcome>,
    pub credentials_removed: bool,
}

impl TeardownReport {
    /// The tunnel process is known to be gone.
    pub fn process_stopped(&self) -> bool {
        match self.signal {
            Some(TerminateOutcome::Failed) => false,
            Some(_) => true,
            None => self.control_stop == StepResult::Succeeded,
        }
    }
}

pub struct TunnelEngine<'a> {
    transport: &'a dyn SshTransport,
    remote_timeout: Duration,
    liveness_wait: Duration,
    terminate_grace: Duration,
    state: TunnelState,
}

impl<'a> TunnelEngine<'a> {
    pub fn new(
        transport: &'a dyn SshTransport,
        remote_timeout: Duration,
        liveness_wait: Duration,
        terminate_grace: Duration,
    ) -> Self {
        TunnelEngine {
            transport,
            remote_timeout,
            liveness_wait,
            terminate_grace,
            state: TunnelState::Idle,
        }
    }

    pub fn state(&self) -> &TunnelState {
        &self.state
    }

    fn transition(&mut self, next: TunnelState) {
        debug!("Tunnel state {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn fail(&mut self, err: TunnelError) -> TunnelError {
        self.transition(TunnelState::Failed(err.to_string()));
        err
    }

    /// Probes capabilities and launches the tunnel. On success the engine is
    /// `Running`; on error it is `Failed`.
    pub async fn open(&mut self, request: &TunnelRequest) -> TunnelResult<LaunchedTunnel> {
        self.transition(TunnelState::ProbingCapability);
        let strategy = match self.probe(request).await {
            Ok(strategy) => strategy,
            Err(e) => return Err(self.fail(e)),
        };
        info!("Using {} tunnel strategy", strategy);

        self.transition(TunnelState::Launching);
        match self.launch(request, strategy).await {
            Ok(launched) => {
                self.transition(TunnelState::Running);
                Ok(launched)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn probe(&self, request: &TunnelRequest) -> TunnelResult<TunnelStrategy> {
        let target = &request.target;
        let test_socket = as_user(
            &target.user,
            request.run_as.as_deref(),
            &format!("test -S {}", shell_quote(&request.socket_path)),
        );
        let output = self
            .transport
            .exec(target, &test_socket, self.remote_timeout)
            .await?;
        check_connection(target, &output)?;
        if !output.success() {
            return Err(TunnelError::PluginSocketNotFound {
                socket_path: request.socket_path.clone(),
            });
        }

        let version_output = self.transport.client_version().await?;
        let version = OpensshVersion::parse(&version_output);
        debug!("Local ssh reports {:?} ({})", version, version_output);
        if let Some(strategy) = strategy_for_version(version) {
            return Ok(strategy);
        }

        let output = self
            .transport
            .exec(target, "command -v socat >/dev/null 2>&1", self.remote_timeout)
            .await?;
        check_connection(target, &output)?;
        if output.success() {
            Ok(TunnelStrategy::SocatBridge)
        } else {
            Err(TunnelError::UnsupportedSshClient {
                ssh_version: version_output,
            })
        }
    }

    async fn launch(
        &self,
        request: &TunnelRequest,
        strategy: TunnelStrategy,
    ) -> TunnelResult<LaunchedTunnel> {
        if let Some(dir) = request.control_path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        match strategy {
            TunnelStrategy::Native => {
                let forward = LocalForward::to_socket(request.local_port, &request.socket_path);
                let output = self
                    .transport
                    .launch_background_forward(&request.target, &forward, &request.control_path)
                    .await?;
                if !output.success() {
                    return Err(TunnelError::LaunchFailed {
                        stderr: launch_failure_message(&output.stderr, output.exit_code),
                    });
                }
                let ssh_pid = self.query_master_pid(&request.control_path).await;
                if ssh_pid.is_none() {
                    warn!(
                        "Tunnel started but its pid could not be recovered from {}",
                        request.control_path.display()
                    );
                }
                Ok(LaunchedTunnel {
                    strategy,
                    ssh_pid,
                    remote_port: None,
                })
            }
            TunnelStrategy::SocatBridge => {
                let remote_port = request.local_port;
                let forward = LocalForward::to_tcp(request.local_port, remote_port);
                let bridge = as_user(
                    &request.target.user,
                    request.run_as.as_deref(),
                    &format!(
                        "socat TCP-LISTEN:{},bind=127.0.0.1,reuseaddr,fork UNIX-CONNECT:{}",
                        remote_port,
                        shell_quote(&request.socket_path)
                    ),
                );
                let pid = self
                    .transport
                    .spawn_forward_with_command(
                        &request.target,
                        &forward,
                        &request.control_path,
                        &bridge,
                        self.liveness_wait,
                    )
                    .await?;
                Ok(LaunchedTunnel {
                    strategy,
                    ssh_pid: Some(pid),
                    remote_port: Some(remote_port),
                })
            }
        }
    }

    /// Asks the ControlMaster behind `control_path` for its pid.
    pub async fn query_master_pid(&self, control_path: &Path) -> Option<u32> {
        match self.transport.control(control_path, ControlOp::Check).await {
            Ok(output) => recover_background_pid(&output),
            Err(e) => {
                debug!("ssh -O check failed: {}", e);
                None
            }
        }
    }

    /// Stops the tunnel process and removes its credential files. Every step
    /// is attempted regardless of the previous one.
    pub async fn teardown(&mut self, connection: &TunnelConnection) -> TeardownReport {
        self.transition(TunnelState::Stopping);

        let remote_cleanup = match connection.strategy {
            TunnelStrategy::SocatBridge => self.stop_remote_bridge(connection).await,
            TunnelStrategy::Native => StepResult::Skipped,
        };

        let control_stop = match self
            .transport
            .control(&connection.control_path, ControlOp::Stop)
            .await
        {
            Ok(output) if output.success() => StepResult::Succeeded,
            Ok(output) => StepResult::Failed(launch_failure_message(&output.stderr, output.exit_code)),
            Err(e) => StepResult::Failed(mask_sensitive(&e.to_string())),
        };
        match &control_stop {
            StepResult::Failed(reason) => debug!(
                "Control stop for {} failed: {}",
                connection.connection_id, reason
            ),
            _ => debug!("Control stop for {} succeeded", connection.connection_id),
        }

        let signal = match connection.ssh_pid {
            Some(pid) => Some(process::terminate(pid, self.terminate_grace).await),
            None => None,
        };
        if let Some(outcome) = signal {
            debug!("Signal outcome for {}: {:?}", connection.connection_id, outcome);
        }

        let _ = std::fs::remove_file(&connection.control_path);
        let credentials_removed = credentials::release(
            connection.ssh_key_file.as_deref(),
            connection.known_hosts_file.as_deref(),
        );

        let report = TeardownReport {
            remote_cleanup,
            control_stop,
            signal,
            credentials_removed,
        };
        if report.process_stopped() {
            self.transition(TunnelState::Stopped);
        } else {
            warn!(
                "Tunnel process for {} may still be running: {:?}",
                connection.connection_id, report
            );
            self.transition(TunnelState::Failed("teardown incomplete".to_string()));
        }
        report
    }

    async fn stop_remote_bridge(&self, connection: &TunnelConnection) -> StepResult {
        let (Some(target), Some(remote_port)) =
            (target_for_connection(connection), connection.remote_port)
        else {
            return StepResult::Skipped;
        };
        let command = as_user(
            &target.user,
            connection.remote_user.as_deref(),
            // the bracket keeps the pattern from matching this command line itself
            &format!("pkill -f {}", shell_quote(&format!("[T]CP-LISTEN:{},", remote_port))),
        );
        match self.transport.exec(&target, &command, self.remote_timeout).await {
            // pkill exits 1 when nothing matched
            Ok(output) if matches!(output.exit_code, Some(0) | Some(1)) => StepResult::Succeeded,
            Ok(output) => StepResult::Failed(launch_failure_message(&output.stderr, output.exit_code)),
            Err(e) => StepResult::Failed(mask_sensitive(&e.to_string())),
        }
    }
}

/// Pid of a backgrounded ssh, from its `ssh -O check` output. ssh reports on
/// stderr; stdout is accepted too.
pub fn recover_background_pid(output: &CommandOutput) -> Option<u32> {
    parse_master_pid(&output.stderr).or_else(|| parse_master_pid(&output.stdout))
}

/// Rebuilds an ssh target for a persisted connection from its stored
/// destination and credential files.
pub fn target_for_connection(connection: &TunnelConnection) -> Option<SshTarget> {
    let destination = connection.destination.as_deref()?;
    let (user, host) = destination.split_once('@')?;
    let key_file = connection.ssh_key_file.as_ref()?;
    if !key_file.exists() {
        return None;
    }
    let mut options = vec![
        "-i".to_string(),
        key_file.display().to_string(),
        "-o".to_string(),
        "IdentitiesOnly=yes".to_string(),
    ];
    match &connection.known_hosts_file {
        Some(known) if known.exists() => options.extend([
            "-o".to_string(),
            "StrictHostKeyChecking=yes".to_string(),
            "-o".to_string(),
            format!("UserKnownHostsFile={}", known.display()),
        ]),
        _ => options.extend([
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
        ]),
    }
    Some(SshTarget {
        host: host.to_string(),
        user: user.to_string(),
        port: connection.ssh_port.unwrap_or(DEFAULT_SSH_PORT),
        options,
    })
}
