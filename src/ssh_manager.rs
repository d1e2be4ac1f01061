// src/ssh_manager.rs
// Invokes the system OpenSSH client: remote commands, ControlMaster operations and tunnel launches.

use async_trait::async_trait;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::errors::{TunnelError, TunnelResult};
use crate::sanitize::mask_sensitive;

pub const DEFAULT_SSH_PORT: u16 = 22;

/// Where and as whom to connect, plus the per-connection ssh options
/// (identity file, host key policy).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub options: Vec<String>,
}

impl SshTarget {
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOp {
    Check,
    Stop,
}

impl ControlOp {
    fn as_str(self) -> &'static str {
        match self {
            ControlOp::Check => "check",
            ControlOp::Stop => "stop",
        }
    }
}

/// A local TCP listener forwarded to `remote` (a Unix socket path or `host:port`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalForward {
    pub local_port: u16,
    pub remote: String,
}

impl LocalForward {
    pub fn to_socket(local_port: u16, socket_path: &str) -> Self {
        LocalForward {
            local_port,
            remote: socket_path.to_string(),
        }
    }

    pub fn to_tcp(local_port: u16, remote_port: u16) -> Self {
        LocalForward {
            local_port,
            remote: format!("localhost:{}", remote_port),
        }
    }

    pub fn spec(&self) -> String {
        format!("localhost:{}:{}", self.local_port, self.remote)
    }
}

#[async_trait]
pub trait SshTransport: Send + Sync {
    /// Raw `ssh -V` output.
    async fn client_version(&self) -> TunnelResult<String>;

    async fn exec(
        &self,
        target: &SshTarget,
        remote_command: &str,
        timeout: Duration,
    ) -> TunnelResult<CommandOutput>;

    /// `ssh -f -N` with a ControlMaster socket; returns once ssh has backgrounded.
    async fn launch_background_forward(
        &self,
        target: &SshTarget,
        forward: &LocalForward,
        control_path: &Path,
    ) -> TunnelResult<CommandOutput>;

    /// Spawns ssh running `remote_command` with `forward`, waits `liveness`
    /// and returns the pid if it is still running.
    async fn spawn_forward_with_command(
        &self,
        target: &SshTarget,
        forward: &LocalForward,
        control_path: &Path,
        remote_command: &str,
        liveness: Duration,
    ) -> TunnelResult<u32>;

    async fn control(&self, control_path: &Path, op: ControlOp) -> TunnelResult<CommandOutput>;
}

/// OpenSSH client version as reported by `ssh -V`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct OpensshVersion {
    pub major: u32,
    pub minor: u32,
}

impl OpensshVersion {
    pub fn parse(version_output: &str) -> Option<Self> {
        static PATTERN: OnceLock<Regex> = OnceLock::new();
        let pattern = PATTERN.get_or_init(|| {
            Regex::new(r"OpenSSH_(?:for_Windows_)?(\d+)\.(\d+)")
                .expect("version pattern is a valid regex")
        });
        let caps = pattern.captures(version_output)?;
        Some(OpensshVersion {
            major: caps[1].parse().ok()?,
            minor: caps[2].parse().ok()?,
        })
    }

    /// `-L port:/path/to/socket` arrived in OpenSSH 6.7.
    pub fn supports_unix_socket_forwarding(&self) -> bool {
        (self.major, self.minor) >= (6, 7)
    }
}

/// Extracts the master pid from `ssh -O check` output, e.g.
/// `Master running (pid=12345)`.
pub fn parse_master_pid(output: &str) -> Option<u32> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let pattern = PATTERN.get_or_init(|| {
        Regex::new(r"Master running \(pid=(\d+)\)").expect("pid pattern is a valid regex")
    });
    pattern
        .captures(output)
        .and_then(|caps| caps[1].parse::<u32>().ok())
        .filter(|pid| *pid > 0)
}

/// Single-quotes `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@,+".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Runs `command` as `run_as` through non-interactive sudo when the ssh login
/// user differs from it.
pub fn as_user(ssh_user: &str, run_as: Option<&str>, command: &str) -> String {
    match run_as {
        Some(user) if !user.is_empty() && user != ssh_user => {
            format!("sudo -n -u {} {}", shell_quote(user), command)
        }
        _ => command.to_string(),
    }
}

pub struct OpenSshTransport {
    binary: String,
    probe_timeout: Duration,
    connect_timeout: Duration,
    scratch_dir: PathBuf,
}

impl OpenSshTransport {
    pub fn new(
        binary: impl Into<String>,
        probe_timeout: Duration,
        connect_timeout: Duration,
        scratch_dir: impl Into<PathBuf>,
    ) -> Self {
        OpenSshTransport {
            binary: binary.into(),
            probe_timeout,
            connect_timeout,
            scratch_dir: scratch_dir.into(),
        }
    }

    fn base_command(&self, target: &SshTarget) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-p")
            .arg(target.port.to_string())
            .args(["-o", "BatchMode=yes"])
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)))
            .args(&target.options)
            .stdin(Stdio::null());
        cmd
    }

    fn scratch_log(&self, prefix: &str) -> TunnelResult<(PathBuf, fs::File)> {
        fs::create_dir_all(&self.scratch_dir)?;
        let path = self
            .scratch_dir
            .join(format!("{}-{}.log", prefix, Uuid::new_v4().simple()));
        let file = fs::File::create(&path)?;
        Ok((path, file))
    }

    async fn run_with_timeout(
        &self,
        mut cmd: Command,
        what: &str,
        timeout: Duration,
    ) -> TunnelResult<CommandOutput> {
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        trace!("Running {:?}", cmd);
        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Ok(result) => result.map_err(|source| TunnelError::Command {
                program: self.binary.clone(),
                source,
            })?,
            Err(_) => {
                return Err(TunnelError::ProbeTimeout {
                    probe: what.to_string(),
                    seconds: timeout.as_secs(),
                })
            }
        };
        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[async_trait]
impl SshTransport for OpenSshTransport {
    async fn client_version(&self) -> TunnelResult<String> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-V").stdin(Stdio::null());
        let output = self
            .run_with_timeout(cmd, "SSH version probe", self.probe_timeout)
            .await?;
        // ssh prints its version on stderr
        Ok(format!("{}{}", output.stderr, output.stdout).trim().to_string())
    }

    async fn exec(
        &self,
        target: &SshTarget,
        remote_command: &str,
        timeout: Duration,
    ) -> TunnelResult<CommandOutput> {
        let mut cmd = self.base_command(target);
        cmd.arg(target.destination()).arg(remote_command);
        debug!("Executing on {}: {}", target.host, remote_command);
        self.run_with_timeout(cmd, "Remote command", timeout).await
    }

    async fn launch_background_forward(
        &self,
        target: &SshTarget,
        forward: &LocalForward,
        control_path: &Path,
    ) -> TunnelResult<CommandOutput> {
        // The backgrounded ssh keeps inherited descriptors open, so stderr goes
        // to a file rather than a pipe that would never reach EOF.
        let (log_path, log_file) = self.scratch_log("forward")?;
        let mut cmd = self.base_command(target);
        cmd.args(["-f", "-N"])
            .args(["-o", "ControlMaster=yes"])
            .arg("-o")
            .arg(format!("ControlPath={}", control_path.display()))
            .args(["-o", "ExitOnForwardFailure=yes"])
            .args(["-o", "ServerAliveInterval=30"])
            .arg("-L")
            .arg(forward.spec())
            .arg(target.destination())
            .stdout(Stdio::null())
            .stderr(Stdio::from(log_file))
            .kill_on_drop(true);

        debug!("Launching native forward {} via {}", forward.spec(), target.host);
        let limit = self.connect_timeout + self.probe_timeout;
        let status = tokio::time::timeout(limit, cmd.status()).await;
        let stderr = fs::read_to_string(&log_path).unwrap_or_default();
        let _ = fs::remove_file(&log_path);

        match status {
            Ok(Ok(status)) => Ok(CommandOutput {
                exit_code: status.code(),
                stdout: String::new(),
                stderr,
            }),
            Ok(Err(source)) => Err(TunnelError::Command {
                program: self.binary.clone(),
                source,
            }),
            Err(_) => Err(TunnelError::ProbeTimeout {
                probe: "SSH tunnel launch".to_string(),
                seconds: limit.as_secs(),
            }),
        }
    }

    async fn spawn_forward_with_command(
        &self,
        target: &SshTarget,
        forward: &LocalForward,
        control_path: &Path,
        remote_command: &str,
        liveness: Duration,
    ) -> TunnelResult<u32> {
        let (log_path, log_file) = self.scratch_log("bridge")?;
        let mut cmd = self.base_command(target);
        cmd.args(["-o", "ControlMaster=yes"])
            .arg("-o")
            .arg(format!("ControlPath={}", control_path.display()))
            .args(["-o", "ExitOnForwardFailure=yes"])
            .args(["-o", "ServerAliveInterval=30"])
            .arg("-L")
            .arg(forward.spec())
            .arg(target.destination())
            .arg(remote_command)
            .stdout(Stdio::null())
            .stderr(Stdio::from(log_file))
            // outlive this process and ignore the terminal's Ctrl-C
            .process_group(0);

        debug!(
            "Spawning bridged forward {} via {}: {}",
            forward.spec(),
            target.host,
            remote_command
        );
        let mut child = cmd.spawn().map_err(|source| TunnelError::Command {
            program: self.binary.clone(),
            source,
        })?;

        tokio::time::sleep(liveness).await;

        let exited = child.try_wait()?;
        let stderr = fs::read_to_string(&log_path).unwrap_or_default();
        // ssh keeps writing to the unlinked file if it stays up
        let _ = fs::remove_file(&log_path);

        match (exited, child.id()) {
            (None, Some(pid)) => Ok(pid),
            (Some(status), _) => {
                debug!("Bridged ssh exited early with {}", status);
                Err(TunnelError::LaunchFailed {
                    stderr: launch_failure_message(&stderr, status.code()),
                })
            }
            (None, None) => Err(TunnelError::LaunchFailed {
                stderr: "ssh process id unavailable".to_string(),
            }),
        }
    }

    async fn control(&self, control_path: &Path, op: ControlOp) -> TunnelResult<CommandOutput> {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("-O")
            .arg(op.as_str())
            .arg("-o")
            .arg(format!("ControlPath={}", control_path.display()))
            .arg("dummy")
            .stdin(Stdio::null());
        self.run_with_timeout(cmd, "SSH control command", self.probe_timeout)
            .await
    }
}

/// ssh itself exits 255 when it cannot reach or authenticate to the host;
/// remote command failures use the command's own status.
pub fn check_connection(target: &SshTarget, output: &CommandOutput) -> TunnelResult<()> {
    if output.exit_code == Some(255) {
        return Err(TunnelError::SshConnectionFailed {
            host: target.host.clone(),
            reason: launch_failure_message(&output.stderr, output.exit_code),
        });
    }
    Ok(())
}

/// Masked stderr, or the exit code when ssh said nothing.
pub fn launch_failure_message(stderr: &str, exit_code: Option<i32>) -> String {
    let masked = mask_sensitive(stderr);
    if !masked.is_empty() {
        return masked;
    }
    match exit_code {
        Some(code) => format!("ssh exited with status {}", code),
        None => "ssh terminated by signal".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_parsing() {
        let v = OpensshVersion::parse("OpenSSH_8.4p1 Debian-5+deb11u1, OpenSSL 1.1.1w  11 Sep 2023")
            .unwrap();
        assert_eq!(v, OpensshVersion { major: 8, minor: 4 });

        let v = OpensshVersion::parse("OpenSSH_for_Windows_8.1p1, LibreSSL 3.0.2").unwrap();
        assert_eq!(v, OpensshVersion { major: 8, minor: 1 });

        assert!(OpensshVersion::parse("Dropbear v2022.83").is_none());
    }

    #[test]
    fn test_unix_socket_forwarding_boundary() {
        let support = |s: &str| {
            OpensshVersion::parse(s)
                .unwrap()
                .supports_unix_socket_forwarding()
        };
        assert!(!support("OpenSSH_6.6p1"));
        assert!(support("OpenSSH_6.7p1"));
        assert!(support("OpenSSH_7.0p1"));
        assert!(!support("OpenSSH_5.9p1"));
        assert!(support("OpenSSH_10.0p2"));
    }

    #[test]
    fn test_parse_master_pid() {
        assert_eq!(parse_master_pid("Master running (pid=12345)\r\n"), Some(12345));
        assert_eq!(
            parse_master_pid("debug1: auto-mux\nMaster running (pid=42)\n"),
            Some(42)
        );
        assert_eq!(
            parse_master_pid("Control socket connect(/tmp/cm): No such file or directory\n"),
            None
        );
        assert_eq!(parse_master_pid("Master running (pid=0)"), None);
        assert_eq!(parse_master_pid(""), None);
    }

    #[test]
    fn test_forward_specs() {
        assert_eq!(
            LocalForward::to_socket(7111, "/mnt/r/browser.sock").spec(),
            "localhost:7111:/mnt/r/browser.sock"
        );
        assert_eq!(
            LocalForward::to_tcp(7111, 7111).spec(),
            "localhost:7111:localhost:7111"
        );
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/mnt/data/x.sock"), "/mnt/data/x.sock");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_as_user() {
        assert_eq!(as_user("ops", Some("rediacc"), "ls"), "sudo -n -u rediacc ls");
        assert_eq!(as_user("ops", Some("ops"), "ls"), "ls");
        assert_eq!(as_user("ops", None, "ls"), "ls");
    }

    #[test]
    fn test_launch_failure_message() {
        assert_eq!(
            launch_failure_message("bind [127.0.0.1]:7111: Address already in use\n", Some(255)),
            "bind [127.0.0.1]:7111: Address already in use"
        );
        assert_eq!(launch_failure_message("", Some(255)), "ssh exited with status 255");
    }

    #[test]
    fn test_check_connection() {
        let target = SshTarget {
            host: "10.0.0.5".to_string(),
            user: "ops".to_string(),
            port: DEFAULT_SSH_PORT,
            options: Vec::new(),
        };
        let refused = CommandOutput {
            exit_code: Some(255),
            stdout: String::new(),
            stderr: "ssh: connect to host 10.0.0.5 port 22: Connection refused\n".to_string(),
        };
        assert!(matches!(
            check_connection(&target, &refused),
            Err(TunnelError::SshConnectionFailed { .. })
        ));
        let missing = CommandOutput {
            exit_code: Some(1),
            ..CommandOutput::default()
        };
        assert!(check_connection(&target, &missing).is_ok());
    }

    // ============== OpenSshTransport against a stand-in ssh binary ==============

    const GUID: &str = "1b4e28ba-2fa1-11d2-883f-0016d3cca427";

    fn fake_ssh(dir: &Path, body: &str) -> OpenSshTransport {
        use std::os::unix::fs::PermissionsExt;
        let script = dir.join("ssh");
        fs::write(&script, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        OpenSshTransport::new(
            script.display().to_string(),
            Duration::from_secs(5),
            Duration::from_secs(5),
            dir.join("scratch"),
        )
    }

    fn scratch_files(dir: &Path) -> Vec<PathBuf> {
        match fs::read_dir(dir.join("scratch")) {
            Ok(entries) => entries.filter_map(Result::ok).map(|e| e.path()).collect(),
            Err(_) => Vec::new(),
        }
    }

    fn target() -> SshTarget {
        SshTarget {
            host: "10.0.0.5".to_string(),
            user: "ops".to_string(),
            port: 2222,
            options: vec!["-i".to_string(), "/tmp/key".to_string()],
        }
    }

    #[tokio::test]
    async fn test_native_launch_backgrounds_with_control_master() {
        let dir = tempfile::tempdir().unwrap();
        let args = dir.path().join("args");
        let transport = fake_ssh(dir.path(), &format!("echo \"$@\" > {}", args.display()));
        let forward = LocalForward::to_socket(7111, "/mnt/r/browser.sock");

        let output = transport
            .launch_background_forward(&target(), &forward, Path::new("/tmp/x.ctl"))
            .await
            .unwrap();

        assert!(output.success());
        let recorded = fs::read_to_string(&args).unwrap();
        assert!(recorded.starts_with("-p 2222 -o BatchMode=yes -o ConnectTimeout=5 -i /tmp/key -f -N"));
        assert!(recorded.contains("-o ControlMaster=yes -o ControlPath=/tmp/x.ctl"));
        assert!(recorded.contains("-o ExitOnForwardFailure=yes"));
        assert!(recorded.contains("-L localhost:7111:/mnt/r/browser.sock ops@10.0.0.5"));
        assert!(scratch_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_native_launch_failure_keeps_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let transport = fake_ssh(
            dir.path(),
            "echo 'bind [127.0.0.1]:7111: Address already in use' >&2\nexit 255",
        );
        let forward = LocalForward::to_socket(7111, "/mnt/r/browser.sock");

        let output = transport
            .launch_background_forward(&target(), &forward, Path::new("/tmp/x.ctl"))
            .await
            .unwrap();

        assert_eq!(output.exit_code, Some(255));
        assert!(output.stderr.contains("Address already in use"));
        assert!(scratch_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_bridge_that_exits_early_fails_with_masked_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let transport = fake_ssh(
            dir.path(),
            &format!(
                "echo 'socat: connect(/mnt/rediacc/7111/mounts/{}/browser.sock): No such file' >&2\nexit 1",
                GUID
            ),
        );
        let forward = LocalForward::to_tcp(7111, 7111);

        let err = transport
            .spawn_forward_with_command(
                &target(),
                &forward,
                Path::new("/tmp/x.ctl"),
                "socat TCP-LISTEN:7111 UNIX-CONNECT:/x.sock",
                Duration::from_millis(500),
            )
            .await
            .unwrap_err();

        match err {
            TunnelError::LaunchFailed { stderr } => {
                assert!(stderr.contains("1b4e28ba..."));
                assert!(!stderr.contains(GUID));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(scratch_files(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn test_bridge_still_running_returns_pid() {
        let dir = tempfile::tempdir().unwrap();
        let transport = fake_ssh(dir.path(), "exec sleep 30");
        let forward = LocalForward::to_tcp(7111, 7111);

        let pid = transport
            .spawn_forward_with_command(
                &target(),
                &forward,
                Path::new("/tmp/x.ctl"),
                "socat TCP-LISTEN:7111 UNIX-CONNECT:/x.sock",
                Duration::from_millis(200),
            )
            .await
            .unwrap();

        assert!(crate::process::is_alive(pid));
        assert!(scratch_files(dir.path()).is_empty());
        let outcome = crate::process::terminate(pid, Duration::from_millis(100)).await;
        assert_ne!(outcome, crate::process::TerminateOutcome::Failed);
    }

    #[tokio::test]
    async fn test_control_check_reports_master_pid() {
        let dir = tempfile::tempdir().unwrap();
        let args = dir.path().join("args");
        let transport = fake_ssh(
            dir.path(),
            &format!(
                "echo \"$@\" > {}\necho 'Master running (pid=4242)' >&2",
                args.display()
            ),
        );

        let output = transport
            .control(Path::new("/tmp/x.ctl"), ControlOp::Check)
            .await
            .unwrap();

        assert!(output.success());
        assert_eq!(parse_master_pid(&output.stderr), Some(4242));
        assert_eq!(
            fs::read_to_string(&args).unwrap().trim(),
            "-O check -o ControlPath=/tmp/x.ctl dummy"
        );
    }

    #[tokio::test]
    async fn test_client_version_reads_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let transport = fake_ssh(dir.path(), "echo 'OpenSSH_9.6p1, OpenSSL 3.0.13' >&2");
        let version = transport.client_version().await.unwrap();
        assert_eq!(version, "OpenSSH_9.6p1, OpenSSL 3.0.13");
    }

    #[test]
    fn test_destination() {
        let target = SshTarget {
            host: "10.0.0.5".to_string(),
            user: "ops".to_string(),
            port: DEFAULT_SSH_PORT,
            options: Vec::new(),
        };
        assert_eq!(target.destination(), "ops@10.0.0.5");
    }
}
