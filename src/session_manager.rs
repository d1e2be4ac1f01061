// src/session_manager.rs
// Orchestrates the plugin tunnel commands: list, connect, disconnect and status.

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config as AppConfig;
use crate::credentials;
use crate::errors::{TunnelError, TunnelResult};
use crate::plugin_discovery::{PluginDiscovery, PluginListing};
use crate::ports;
use crate::repository::RepositoryConnection;
use crate::ssh_manager::SshTransport;
use crate::state_store::{ConnectionFilter, ConnectionStateStore, TunnelConnection};
use crate::tunnel_engine::{TeardownReport, TunnelEngine, TunnelRequest};
use crate::vault::{VaultApi, VaultResolver};

#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub team: String,
    pub machine: String,
    pub repo: String,
    pub plugin: String,
    pub port: Option<u16>,
    /// Skip host key verification.
    pub dev: bool,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionHealth {
    Active,
    Error,
}

#[derive(Serialize, Debug, Clone)]
pub struct StatusEntry {
    #[serde(flatten)]
    pub connection: TunnelConnection,
    pub health: ConnectionHealth,
}

#[derive(Serialize, Debug, Clone, Default)]
pub struct StatusReport {
    pub connections: Vec<StatusEntry>,
    pub pruned: Vec<TunnelConnection>,
}

#[derive(Debug, Clone)]
pub struct Disconnected {
    pub connection: TunnelConnection,
    pub report: TeardownReport,
}

pub struct SessionManager {
    app_config: Arc<AppConfig>,
    vault_api: Arc<dyn VaultApi>,
    transport: Arc<dyn SshTransport>,
    store: ConnectionStateStore,
}

impl SessionManager {
    pub fn new(
        app_config: Arc<AppConfig>,
        vault_api: Arc<dyn VaultApi>,
        transport: Arc<dyn SshTransport>,
        store: ConnectionStateStore,
    ) -> Self {
        SessionManager {
            app_config,
            vault_api,
            transport,
            store,
        }
    }

    pub fn store(&self) -> &ConnectionStateStore {
        &self.store
    }

    fn remote_timeout(&self) -> Duration {
        let tunnel = &self.app_config.tunnel;
        Duration::from_secs(tunnel.connect_timeout_secs + tunnel.probe_timeout_secs)
    }

    fn engine(&self) -> TunnelEngine<'_> {
        let tunnel = &self.app_config.tunnel;
        TunnelEngine::new(
            self.transport.as_ref(),
            self.remote_timeout(),
            Duration::from_millis(tunnel.liveness_wait_ms),
            Duration::from_millis(tunnel.terminate_grace_ms),
        )
    }

    async fn resolve(&self, team: &str, machine: &str, repo: &str) -> TunnelResult<RepositoryConnection> {
        let resolver = VaultResolver::new(self.vault_api.as_ref());
        RepositoryConnection::connect(&resolver, team, machine, repo).await
    }

    /// Drops dead tunnels from the store and deletes the key files they left behind.
    fn prune_stale(&self) -> TunnelResult<Vec<TunnelConnection>> {
        let pruned = self.store.reconcile_liveness()?;
        for connection in &pruned {
            credentials::release(
                connection.ssh_key_file.as_deref(),
                connection.known_hosts_file.as_deref(),
            );
        }
        Ok(pruned)
    }

    /// Plugins available in a repository, plus this machine's tunnels to it.
    pub async fn list(
        &self,
        team: &str,
        machine: &str,
        repo: &str,
        dev: bool,
    ) -> TunnelResult<PluginListing> {
        let repository = self.resolve(team, machine, repo).await?;
        let credentials =
            repository.provision_credentials(&self.app_config.control_dir(), dev)?;
        let target = repository.ssh_target(&credentials);

        self.prune_stale()?;
        let connections = self.store.matching(&ConnectionFilter {
            team: Some(team.to_string()),
            machine: Some(machine.to_string()),
            repo: Some(repo.to_string()),
            ..ConnectionFilter::default()
        });

        let discovery = PluginDiscovery::new(self.transport.as_ref(), self.remote_timeout());
        discovery
            .discover(
                &target,
                repository.connection_info().universal_user.as_deref(),
                repository.paths(),
                connections,
            )
            .await
    }

    fn select_port(&self, requested: Option<u16>) -> TunnelResult<u16> {
        match requested {
            Some(port) if !ports::is_valid_user_port(port) => Err(TunnelError::InvalidPort { port }),
            Some(port) if !ports::is_available(port) => Err(TunnelError::PortUnavailable { port }),
            Some(port) => Ok(port),
            None => {
                let (start, end) = (
                    self.app_config.tunnel.port_range_start,
                    self.app_config.tunnel.port_range_end,
                );
                ports::find_available(start, end).ok_or(TunnelError::NoPortsAvailable { start, end })
            }
        }
    }

    /// Opens a tunnel to a plugin socket and records it once it is running.
    pub async fn connect(&self, request: &ConnectRequest) -> TunnelResult<TunnelConnection> {
        self.prune_stale()?;
        if let Some(existing) =
            self.store
                .find_existing(&request.team, &request.machine, &request.repo, &request.plugin)
        {
            return Err(TunnelError::AlreadyConnected {
                connection_id: existing.connection_id,
                port: existing.local_port,
            });
        }

        let repository = self
            .resolve(&request.team, &request.machine, &request.repo)
            .await?;
        let control_dir = self.app_config.control_dir();
        // removed on drop unless the tunnel comes up
        let credentials = repository.provision_credentials(&control_dir, request.dev)?;
        let local_port = self.select_port(request.port)?;

        let now = Utc::now();
        let connection_id = self.store.generate_connection_id(
            &request.team,
            &request.machine,
            &request.repo,
            &request.plugin,
            now,
        );
        let info = repository.connection_info();
        let socket_path = repository.paths().plugin_socket(&request.plugin);
        let tunnel_request = TunnelRequest {
            target: repository.ssh_target(&credentials),
            run_as: info.universal_user.clone(),
            socket_path: socket_path.clone(),
            local_port,
            control_path: control_dir.join(format!("{}.ctl", connection_id)),
        };

        info!(
            "Connecting {} on {}/{} to localhost:{}",
            request.plugin, request.machine, request.repo, local_port
        );
        let mut engine = self.engine();
        let launched = engine.open(&tunnel_request).await?;

        let connection = TunnelConnection {
            connection_id,
            team: request.team.clone(),
            machine: request.machine.clone(),
            repo: request.repo.clone(),
            plugin: request.plugin.clone(),
            local_port,
            ssh_pid: launched.ssh_pid,
            control_path: tunnel_request.control_path.clone(),
            ssh_key_file: Some(credentials.key_file().to_path_buf()),
            known_hosts_file: credentials.known_hosts_file().map(|p| p.to_path_buf()),
            created_at: now,
            strategy: launched.strategy,
            remote_port: launched.remote_port,
            destination: Some(repository.destination()),
            remote_user: info.universal_user.clone(),
            ssh_port: Some(info.port),
            socket_path: Some(socket_path),
        };

        if let Err(e) = credentials.persist() {
            warn!("Could not keep credential files for the tunnel: {}", e);
            engine.teardown(&connection).await;
            return Err(e);
        }

        // a concurrent connect may have recorded the same plugin meanwhile
        if let Err(e) = self.store.insert_unique(connection.clone()) {
            warn!(
                "Discarding tunnel {} after failing to record it: {}",
                connection.connection_id, e
            );
            engine.teardown(&connection).await;
            return Err(e);
        }

        info!(
            "Connection {} ready at {}",
            connection.connection_id,
            connection.local_url()
        );
        Ok(connection)
    }

    /// Tears down every matching connection. No match is not an error.
    pub async fn disconnect(&self, filter: &ConnectionFilter) -> TunnelResult<Vec<Disconnected>> {
        let targets = self.store.matching(filter);
        if targets.is_empty() {
            debug!("No connections match {:?}", filter);
            return Ok(Vec::new());
        }

        let mut engine = self.engine();
        let mut disconnected = Vec::with_capacity(targets.len());
        for connection in targets {
            info!(
                "Disconnecting {} ({} on port {})",
                connection.connection_id, connection.plugin, connection.local_port
            );
            let report = engine.teardown(&connection).await;
            self.store.remove(&connection.connection_id)?;
            disconnected.push(Disconnected { connection, report });
        }
        Ok(disconnected)
    }

    /// Prunes dead tunnels, then reports whether each remaining local port is
    /// still held. A state file that cannot be pruned still gets reported.
    pub async fn status(&self) -> TunnelResult<StatusReport> {
        let pruned = match self.prune_stale() {
            Ok(pruned) => pruned,
            Err(e) => {
                warn!("Could not prune stale connections: {}", e);
                Vec::new()
            }
        };
        let connections = self
            .store
            .matching(&ConnectionFilter::default())
            .into_iter()
            .map(|connection| {
                let health = if ports::is_available(connection.local_port) {
                    ConnectionHealth::Error
                } else {
                    ConnectionHealth::Active
                };
                StatusEntry { connection, health }
            })
            .collect();
        Ok(StatusReport {
            connections,
            pruned,
        })
    }
}
