// src/vault.rs
// Resolves machine, repository and SSH key records through the authenticated API client.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, trace};

use crate::errors::{TunnelError, TunnelResult};
use crate::sanitize::mask_sensitive;
use crate::ssh_manager::DEFAULT_SSH_PORT;

/// Response envelope printed by the API client with `--output json`.
#[derive(Deserialize, Debug, Default)]
pub struct ApiResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub data: Vec<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

/// The three API calls the tunnel manager needs. Each returns the `data`
/// array of a successful response.
#[async_trait]
pub trait VaultApi: Send + Sync {
    async fn list_teams(&self) -> TunnelResult<Vec<Value>>;
    async fn inspect_machine(&self, team: &str, machine: &str) -> TunnelResult<Vec<Value>>;
    async fn inspect_repository(&self, team: &str, repo: &str) -> TunnelResult<Vec<Value>>;
}

/// Shells out to the `rediacc-cli` binary. Its auth token variable is
/// inherited from this process's environment.
pub struct CliVaultApi {
    binary: String,
    timeout: Duration,
}

impl CliVaultApi {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        CliVaultApi {
            binary: binary.into(),
            timeout,
        }
    }

    async fn call(&self, operation: &str, args: &[&str]) -> TunnelResult<Vec<Value>> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["--output", "json"])
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        debug!("API call: {} {}", self.binary, args.join(" "));

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(result) => result.map_err(|source| TunnelError::Command {
                program: self.binary.clone(),
                source,
            })?,
            Err(_) => {
                return Err(TunnelError::ProbeTimeout {
                    probe: format!("API call '{}'", operation),
                    seconds: self.timeout.as_secs(),
                })
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        trace!("API stdout for {}: {} bytes", operation, stdout.len());
        parse_response(operation, &stdout, &stderr, output.status.success())
    }
}

/// Interprets API client output. A non-zero exit or `success: false` is an
/// `ApiFailure` carrying the masked error text.
pub fn parse_response(
    operation: &str,
    stdout: &str,
    stderr: &str,
    exited_ok: bool,
) -> TunnelResult<Vec<Value>> {
    let failure = |message: &str| TunnelError::ApiFailure {
        operation: operation.to_string(),
        message: mask_sensitive(message),
    };

    let response: ApiResponse = match serde_json::from_str(stdout.trim()) {
        Ok(response) => response,
        Err(e) => {
            let message = if stderr.trim().is_empty() {
                format!("unparsable response: {}", e)
            } else {
                stderr.to_string()
            };
            return Err(failure(&message));
        }
    };

    if !exited_ok || !response.success {
        let message = response
            .error
            .filter(|e| !e.trim().is_empty())
            .unwrap_or_else(|| stderr.to_string());
        return Err(failure(if message.trim().is_empty() {
            "request failed"
        } else {
            &message
        }));
    }
    Ok(response.data)
}

#[async_trait]
impl VaultApi for CliVaultApi {
    async fn list_teams(&self) -> TunnelResult<Vec<Value>> {
        self.call("list teams", &["list", "teams"]).await
    }

    async fn inspect_machine(&self, team: &str, machine: &str) -> TunnelResult<Vec<Value>> {
        self.call(
            "inspect machine",
            &["inspect", "machine", team, machine, "--include-vault"],
        )
        .await
    }

    async fn inspect_repository(&self, team: &str, repo: &str) -> TunnelResult<Vec<Value>> {
        self.call(
            "inspect repository",
            &["inspect", "repository", team, repo, "--include-vault"],
        )
        .await
    }
}

/// Decodes the vault attached to an API record. `vaultContent` may be a JSON
/// object or a string holding one. `None` means the vault is malformed; a
/// record without a vault yields an empty map.
pub fn parse_vault(record: &Value) -> Option<Map<String, Value>> {
    match record.get("vaultContent").or_else(|| record.get("vault")) {
        None | Some(Value::Null) => Some(Map::new()),
        Some(Value::Object(map)) => Some(map.clone()),
        Some(Value::String(raw)) if raw.trim().is_empty() => Some(Map::new()),
        Some(Value::String(raw)) => match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => Some(map),
            Ok(_) => None,
            Err(e) => {
                debug!("Vault content is not valid JSON: {}", e);
                None
            }
        },
        Some(_) => None,
    }
}

/// First non-empty value among `keys`, looked up in the vault and then in the
/// record itself. Numbers are accepted and rendered as strings.
fn field(vault: &Map<String, Value>, record: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .flat_map(|key| [vault.get(*key), record.get(*key)])
        .flatten()
        .find_map(|value| match value {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

const UNIVERSAL_USER_KEYS: &[&str] = &["universalUser", "UNIVERSAL_USER_NAME"];
const UNIVERSAL_USER_ID_KEYS: &[&str] = &["universalUserId", "UNIVERSAL_USER_ID"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineInfo {
    /// Team whose vault actually held the machine.
    pub team: String,
    pub machine: String,
    pub ip: String,
    pub user: String,
    pub port: u16,
    pub datastore: Option<String>,
    pub host_entry: Option<String>,
    pub universal_user: Option<String>,
    pub universal_user_id: Option<String>,
}

impl MachineInfo {
    /// Builds machine info from an `inspect machine` record. Returns `None`
    /// when the vault is malformed or lacks an `ip`.
    pub fn from_record(team: &str, machine: &str, record: &Value) -> Option<Self> {
        let vault = parse_vault(record)?;
        let ip = field(&vault, record, &["ip", "IP"])?;
        let user = field(&vault, record, &["user", "USER"]).unwrap_or_default();
        let port = field(&vault, record, &["port", "PORT"])
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(DEFAULT_SSH_PORT);
        Some(MachineInfo {
            team: team.to_string(),
            machine: machine.to_string(),
            ip,
            user,
            port,
            datastore: field(&vault, record, &["datastore", "DATASTORE"]),
            host_entry: field(&vault, record, &["hostEntry", "HOST_ENTRY"]),
            universal_user: field(&vault, record, UNIVERSAL_USER_KEYS),
            universal_user_id: field(&vault, record, UNIVERSAL_USER_ID_KEYS),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryInfo {
    pub team: String,
    pub repo: String,
    pub guid: String,
}

/// Team-level settings shared by every machine of the team.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeamVault {
    pub ssh_private_key: Option<String>,
    pub universal_user: Option<String>,
    pub universal_user_id: Option<String>,
}

fn team_name(record: &Value) -> Option<&str> {
    record
        .get("teamName")
        .or_else(|| record.get("name"))
        .and_then(Value::as_str)
}

/// Team names with the requested team first and the rest in API order.
fn search_order<'t>(requested: &'t str, teams: &'t [Value]) -> Vec<&'t str> {
    let mut order = vec![requested];
    order.extend(
        teams
            .iter()
            .filter_map(team_name)
            .filter(|name| *name != requested),
    );
    order
}

pub struct VaultResolver<'a> {
    api: &'a dyn VaultApi,
}

impl<'a> VaultResolver<'a> {
    pub fn new(api: &'a dyn VaultApi) -> Self {
        VaultResolver { api }
    }

    /// Looks the machine up in `team`, then in every other accessible team.
    pub async fn resolve_machine(&self, team: &str, machine: &str) -> TunnelResult<MachineInfo> {
        if let Some(info) = self.machine_in_team(team, machine).await {
            return Ok(info);
        }

        let teams = self.api.list_teams().await?;
        for candidate in search_order(team, &teams).into_iter().skip(1) {
            if let Some(info) = self.machine_in_team(candidate, machine).await {
                info!(
                    "Machine '{}' found in team '{}' instead of '{}'",
                    machine, candidate, team
                );
                return Ok(info);
            }
        }
        Err(TunnelError::MachineNotFound {
            team: team.to_string(),
            machine: machine.to_string(),
        })
    }

    async fn machine_in_team(&self, team: &str, machine: &str) -> Option<MachineInfo> {
        let records = match self.api.inspect_machine(team, machine).await {
            Ok(records) => records,
            Err(e) => {
                debug!("Machine '{}' not available in team '{}': {}", machine, team, e);
                return None;
            }
        };
        let found = records
            .iter()
            .find_map(|record| MachineInfo::from_record(team, machine, record));
        if found.is_none() && !records.is_empty() {
            debug!(
                "Skipping malformed machine record for '{}' in team '{}'",
                machine, team
            );
        }
        found
    }

    pub async fn resolve_repository(&self, team: &str, repo: &str) -> TunnelResult<RepositoryInfo> {
        let records = self.api.inspect_repository(team, repo).await?;
        let guid = records.iter().find_map(|record| {
            let vault = parse_vault(record).unwrap_or_default();
            field(&vault, record, &["repoGuid", "grandGuid"])
        });
        match guid {
            Some(guid) => Ok(RepositoryInfo {
                team: team.to_string(),
                repo: repo.to_string(),
                guid,
            }),
            None => Err(TunnelError::RepositoryNotFound {
                team: team.to_string(),
                repo: repo.to_string(),
            }),
        }
    }

    pub async fn team_vault(&self, team: &str) -> TunnelResult<TeamVault> {
        let teams = self.api.list_teams().await?;
        let record = teams
            .iter()
            .find(|record| team_name(record) == Some(team))
            .ok_or_else(|| TunnelError::TeamNotFound {
                team: team.to_string(),
            })?;
        let vault = parse_vault(record).unwrap_or_default();
        Ok(TeamVault {
            ssh_private_key: field(&vault, &Value::Null, &["SSH_PRIVATE_KEY"]),
            universal_user: field(&vault, record, UNIVERSAL_USER_KEYS),
            universal_user_id: field(&vault, record, UNIVERSAL_USER_ID_KEYS),
        })
    }

    /// `SSH_PRIVATE_KEY` from the requested team's vault, or from the first
    /// other team that has one.
    pub async fn resolve_ssh_key(&self, team: &str) -> TunnelResult<Option<String>> {
        let teams = self.api.list_teams().await?;
        for candidate in search_order(team, &teams) {
            let Some(record) = teams.iter().find(|r| team_name(r) == Some(candidate)) else {
                continue;
            };
            let Some(vault) = parse_vault(record) else {
                debug!("Skipping malformed vault of team '{}'", candidate);
                continue;
            };
            if let Some(key) = field(&vault, &Value::Null, &["SSH_PRIVATE_KEY"]) {
                if candidate != team {
                    info!("Using SSH key from team '{}'", candidate);
                }
                return Ok(Some(key));
            }
        }
        Ok(None)
    }
}
