// src/credentials.rs
// Materializes SSH key and known_hosts files for the lifetime of one connection attempt.

use base64::Engine;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::{Builder, NamedTempFile};
use tracing::{debug, warn};

use crate::errors::TunnelResult;

#[cfg(windows)]
const NULL_DEVICE: &str = "NUL";
#[cfg(not(windows))]
const NULL_DEVICE: &str = "/dev/null";

/// Credential files for one ssh invocation. Both files are deleted when this
/// value is dropped unless [`ProvisionedCredentials::persist`] was called.
#[derive(Debug)]
pub struct ProvisionedCredentials {
    key_file: NamedTempFile,
    known_hosts_file: Option<NamedTempFile>,
    ssh_options: Vec<String>,
}

/// Paths of credential files that outlive the process that created them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedCredentials {
    pub key_file: PathBuf,
    pub known_hosts_file: Option<PathBuf>,
}

impl ProvisionedCredentials {
    pub fn key_file(&self) -> &Path {
        self.key_file.path()
    }

    pub fn known_hosts_file(&self) -> Option<&Path> {
        self.known_hosts_file.as_ref().map(|f| f.path())
    }

    /// `-o` options to pass to ssh, identity file included.
    pub fn ssh_options(&self) -> &[String] {
        &self.ssh_options
    }

    /// Keeps the files on disk; the caller becomes responsible for [`release`].
    pub fn persist(self) -> TunnelResult<PersistedCredentials> {
        let key_file = self
            .key_file
            .into_temp_path()
            .keep()
            .map_err(|e| e.error)?;
        let known_hosts_file = match self.known_hosts_file {
            Some(file) => Some(file.into_temp_path().keep().map_err(|e| e.error)?),
            None => None,
        };
        Ok(PersistedCredentials {
            key_file,
            known_hosts_file,
        })
    }
}

/// Decodes base64 key material when it does not look like PEM already.
/// Falls back to the raw string when decoding fails.
pub fn decode_key_material(key_material: &str) -> String {
    let trimmed = key_material.trim();
    if trimmed.starts_with("-----BEGIN") || trimmed.contains('\n') {
        return ensure_trailing_newline(trimmed);
    }

    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    match base64::engine::general_purpose::STANDARD.decode(compact.as_bytes()) {
        Ok(bytes) => match String::from_utf8(bytes) {
            Ok(decoded) => ensure_trailing_newline(decoded.trim()),
            Err(_) => {
                debug!("Decoded SSH key is not UTF-8, using key material verbatim");
                ensure_trailing_newline(trimmed)
            }
        },
        Err(_) => {
            debug!("SSH key is not base64, using key material verbatim");
            ensure_trailing_newline(trimmed)
        }
    }
}

fn ensure_trailing_newline(key: &str) -> String {
    let mut key = key.to_string();
    if !key.ends_with('\n') {
        key.push('\n');
    }
    key
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Writes the key (and known_hosts line, when given) into `dir` and builds the
/// matching ssh options. Host key checking is strict when `host_entry` is set.
pub fn provision(
    dir: &Path,
    key_material: &str,
    host_entry: Option<&str>,
) -> TunnelResult<ProvisionedCredentials> {
    fs::create_dir_all(dir)?;

    // tempfile creates the file with mode 0600 before returning it
    let mut key_file = Builder::new()
        .prefix("rediacc-key-")
        .tempfile_in(dir)?;
    restrict_permissions(key_file.path())?;
    key_file.write_all(decode_key_material(key_material).as_bytes())?;
    key_file.flush()?;

    let mut ssh_options = vec![
        "-i".to_string(),
        key_file.path().display().to_string(),
        "-o".to_string(),
        "IdentitiesOnly=yes".to_string(),
    ];

    let known_hosts_file = match host_entry.map(str::trim).filter(|e| !e.is_empty()) {
        Some(entry) => {
            let mut file = Builder::new()
                .prefix("rediacc-known-hosts-")
                .tempfile_in(dir)?;
            writeln!(file, "{}", entry)?;
            file.flush()?;
            ssh_options.extend([
                "-o".to_string(),
                "StrictHostKeyChecking=yes".to_string(),
                "-o".to_string(),
                format!("UserKnownHostsFile={}", file.path().display()),
            ]);
            Some(file)
        }
        None => {
            ssh_options.extend([
                "-o".to_string(),
                "StrictHostKeyChecking=accept-new".to_string(),
                "-o".to_string(),
                format!("UserKnownHostsFile={}", NULL_DEVICE),
            ]);
            None
        }
    };

    debug!(
        "Provisioned SSH credentials at {} (known_hosts: {})",
        key_file.path().display(),
        known_hosts_file.is_some()
    );

    Ok(ProvisionedCredentials {
        key_file,
        known_hosts_file,
        ssh_options,
    })
}

/// Best-effort removal of persisted credential files. Already-missing files
/// are fine; other failures are logged.
pub fn release(key_file: Option<&Path>, known_hosts_file: Option<&Path>) -> bool {
    let mut clean = true;
    for path in [key_file, known_hosts_file].into_iter().flatten() {
        match fs::remove_file(path) {
            Ok(()) => debug!("Removed credential file {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!("Failed to remove credential file {}: {}", path.display(), e);
                clean = false;
            }
        }
    }
    clean
}
