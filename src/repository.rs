// src/repository.rs
// Remote layout of a repository and the resolved connection details for reaching it.

use std::path::Path;
use tracing::{debug, info};

use crate::credentials::{self, ProvisionedCredentials};
use crate::errors::{TunnelError, TunnelResult};
use crate::ssh_manager::SshTarget;
use crate::vault::VaultResolver;

/// Where a repository lives on its machine. Derived, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryPaths {
    base: String,
    guid: String,
}

impl RepositoryPaths {
    pub fn new(repo_guid: &str, datastore: &str, universal_user_id: &str) -> Self {
        RepositoryPaths {
            base: format!("{}/{}", datastore.trim_end_matches('/'), universal_user_id),
            guid: repo_guid.to_string(),
        }
    }

    pub fn mount_path(&self) -> String {
        format!("{}/mounts/{}", self.base, self.guid)
    }

    pub fn image_path(&self) -> String {
        format!("{}/repos/{}", self.base, self.guid)
    }

    pub fn docker_folder(&self) -> String {
        format!("{}/interim/{}/docker", self.base, self.guid)
    }

    pub fn docker_socket(&self) -> String {
        format!("{}/docker.sock", self.docker_folder())
    }

    pub fn docker_data(&self) -> String {
        format!("{}/data", self.docker_folder())
    }

    pub fn docker_exec(&self) -> String {
        format!("{}/exec", self.docker_folder())
    }

    pub fn plugin_socket(&self, plugin: &str) -> String {
        format!("{}/{}.sock", self.mount_path(), plugin)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub ip: String,
    pub user: String,
    pub port: u16,
    pub universal_user: Option<String>,
    pub universal_user_id: String,
    pub datastore: String,
    /// Team whose vault held the machine.
    pub team: String,
    pub host_entry: Option<String>,
}

/// A repository resolved down to host, credentials and remote paths.
#[derive(Debug, Clone)]
pub struct RepositoryConnection {
    info: ConnectionInfo,
    paths: RepositoryPaths,
    ssh_key: String,
}

impl RepositoryConnection {
    pub async fn connect(
        resolver: &VaultResolver<'_>,
        team: &str,
        machine: &str,
        repo: &str,
    ) -> TunnelResult<Self> {
        let machine_info = resolver.resolve_machine(team, machine).await?;
        let repository = resolver.resolve_repository(team, repo).await?;
        let ssh_key = resolver
            .resolve_ssh_key(team)
            .await?
            .ok_or_else(|| TunnelError::SshKeyNotFound {
                team: team.to_string(),
            })?;

        let incomplete = |field: &str| TunnelError::MachineVaultIncomplete {
            machine: machine.to_string(),
            field: field.to_string(),
        };
        if machine_info.user.is_empty() {
            return Err(incomplete("user"));
        }
        let datastore = machine_info
            .datastore
            .clone()
            .ok_or_else(|| incomplete("datastore"))?;

        // universal user settings may live on the team instead of the machine
        let (universal_user, universal_user_id) =
            match (&machine_info.universal_user, &machine_info.universal_user_id) {
                (user, Some(id)) => (user.clone(), id.clone()),
                (user, None) => {
                    let team_vault = resolver.team_vault(&machine_info.team).await?;
                    let id = team_vault
                        .universal_user_id
                        .ok_or_else(|| incomplete("universalUserId"))?;
                    (user.clone().or(team_vault.universal_user), id)
                }
            };

        let paths = RepositoryPaths::new(&repository.guid, &datastore, &universal_user_id);
        info!(
            "Resolved {}/{} on {} ({}@{})",
            team, repo, machine, machine_info.user, machine_info.ip
        );
        debug!("Repository mount path: {}", paths.mount_path());

        Ok(RepositoryConnection {
            info: ConnectionInfo {
                ip: machine_info.ip,
                user: machine_info.user,
                port: machine_info.port,
                universal_user,
                universal_user_id,
                datastore,
                team: machine_info.team,
                host_entry: machine_info.host_entry,
            },
            paths,
            ssh_key,
        })
    }

    pub fn connection_info(&self) -> &ConnectionInfo {
        &self.info
    }

    pub fn paths(&self) -> &RepositoryPaths {
        &self.paths
    }

    pub fn destination(&self) -> String {
        format!("{}@{}", self.info.user, self.info.ip)
    }

    /// Writes this connection's key (and known_hosts entry unless `dev`) to `dir`.
    pub fn provision_credentials(&self, dir: &Path, dev: bool) -> TunnelResult<ProvisionedCredentials> {
        let host_entry = if dev {
            None
        } else {
            self.info.host_entry.as_deref()
        };
        credentials::provision(dir, &self.ssh_key, host_entry)
    }

    pub fn ssh_target(&self, credentials: &ProvisionedCredentials) -> SshTarget {
        SshTarget {
            host: self.info.ip.clone(),
            user: self.info.user.clone(),
            port: self.info.port,
            options: credentials.ssh_options().to_vec(),
        }
    }
}
