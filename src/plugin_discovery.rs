// src/plugin_discovery.rs
// Lists the plugin sockets and plugin containers of a repository on its machine.

use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

use crate::errors::TunnelResult;
use crate::repository::RepositoryPaths;
use crate::ssh_manager::{as_user, check_connection, shell_quote, SshTarget, SshTransport};
use crate::state_store::TunnelConnection;

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct PluginContainer {
    pub name: String,
    pub status: String,
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct PluginEntry {
    pub name: String,
    pub socket_path: String,
    /// Status of the container whose name contains the plugin name.
    pub container_status: Option<String>,
}

#[derive(Serialize, Debug, Clone)]
pub struct PluginListing {
    pub plugins: Vec<PluginEntry>,
    /// `None` when docker could not be queried.
    pub containers: Option<Vec<PluginContainer>>,
    pub connections: Vec<TunnelConnection>,
}

/// Plugin names from `find` output, one socket path per line.
pub fn parse_socket_listing(output: &str) -> Vec<(String, String)> {
    let mut sockets: Vec<(String, String)> = output
        .lines()
        .map(str::trim)
        .filter(|line| line.ends_with(".sock"))
        .filter_map(|line| {
            let stem = Path::new(line).file_stem()?.to_str()?.to_string();
            Some((stem, line.to_string()))
        })
        .collect();
    sockets.sort();
    sockets.dedup();
    sockets
}

/// Plugin containers from `docker ps --format '{{.Names}}\t{{.Status}}'`.
pub fn parse_container_listing(output: &str) -> Vec<PluginContainer> {
    output
        .lines()
        .filter_map(|line| {
            let (name, status) = line.split_once('\t').unwrap_or((line, ""));
            let name = name.trim();
            if name.is_empty() || !name.contains("plugin") {
                return None;
            }
            Some(PluginContainer {
                name: name.to_string(),
                status: status.trim().to_string(),
            })
        })
        .collect()
}

pub fn cross_reference(
    sockets: Vec<(String, String)>,
    containers: Option<&[PluginContainer]>,
) -> Vec<PluginEntry> {
    sockets
        .into_iter()
        .map(|(name, socket_path)| {
            let container_status = containers.and_then(|list| {
                list.iter()
                    .find(|c| c.name.contains(&name))
                    .map(|c| c.status.clone())
            });
            PluginEntry {
                name,
                socket_path,
                container_status,
            }
        })
        .collect()
}

pub struct PluginDiscovery<'a> {
    transport: &'a dyn SshTransport,
    timeout: Duration,
}

impl<'a> PluginDiscovery<'a> {
    pub fn new(transport: &'a dyn SshTransport, timeout: Duration) -> Self {
        PluginDiscovery { transport, timeout }
    }

    pub async fn list_sockets(
        &self,
        target: &SshTarget,
        run_as: Option<&str>,
        paths: &RepositoryPaths,
    ) -> TunnelResult<Vec<(String, String)>> {
        let command = as_user(
            &target.user,
            run_as,
            &format!(
                "find {} -maxdepth 1 -type s -name '*.sock'",
                shell_quote(&paths.mount_path())
            ),
        );
        let output = self.transport.exec(target, &command, self.timeout).await?;
        check_connection(target, &output)?;
        if !output.success() {
            debug!(
                "Socket listing exited with {:?}: {}",
                output.exit_code,
                output.stderr.trim()
            );
        }
        Ok(parse_socket_listing(&output.stdout))
    }

    /// `None` when docker is unreachable; that is reported, not fatal.
    pub async fn list_containers(
        &self,
        target: &SshTarget,
        run_as: Option<&str>,
        paths: &RepositoryPaths,
    ) -> Option<Vec<PluginContainer>> {
        let command = as_user(
            &target.user,
            run_as,
            &format!(
                "env DOCKER_HOST={} docker ps --format '{{{{.Names}}}}\t{{{{.Status}}}}'",
                shell_quote(&format!("unix://{}", paths.docker_socket()))
            ),
        );
        match self.transport.exec(target, &command, self.timeout).await {
            Ok(output) if output.success() => Some(parse_container_listing(&output.stdout)),
            Ok(output) => {
                warn!(
                    "Could not list plugin containers: {}",
                    crate::sanitize::mask_sensitive(&output.stderr)
                );
                None
            }
            Err(e) => {
                warn!("Could not list plugin containers: {}", e);
                None
            }
        }
    }

    pub async fn discover(
        &self,
        target: &SshTarget,
        run_as: Option<&str>,
        paths: &RepositoryPaths,
        connections: Vec<TunnelConnection>,
    ) -> TunnelResult<PluginListing> {
        let sockets = self.list_sockets(target, run_as, paths).await?;
        let containers = self.list_containers(target, run_as, paths).await;
        Ok(PluginListing {
            plugins: cross_reference(sockets, containers.as_deref()),
            containers,
            connections,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_socket_listing() {
        let out = "/m/r/browser.sock\n/m/r/terminal.sock\n\n/m/r/browser.sock\n/m/r/notes.txt\n";
        let sockets = parse_socket_listing(out);
        assert_eq!(
            sockets,
            vec![
                ("browser".to_string(), "/m/r/browser.sock".to_string()),
                ("terminal".to_string(), "/m/r/terminal.sock".to_string()),
            ]
        );
    }

    #[test]
    fn test_parse_container_listing_keeps_plugins() {
        let out = "plugin-browser\tUp 2 hours\npostgres\tUp 3 hours\nrepo-plugin-terminal\tExited (0) 1 minute ago\n";
        let containers = parse_container_listing(out);
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0].name, "plugin-browser");
        assert_eq!(containers[0].status, "Up 2 hours");
        assert_eq!(containers[1].status, "Exited (0) 1 minute ago");
    }

    #[test]
    fn test_cross_reference() {
        let sockets = vec![
            ("browser".to_string(), "/m/browser.sock".to_string()),
            ("terminal".to_string(), "/m/terminal.sock".to_string()),
        ];
        let containers = vec![PluginContainer {
            name: "plugin-browser".to_string(),
            status: "Up 5 minutes".to_string(),
        }];
        let entries = cross_reference(sockets.clone(), Some(&containers));
        assert_eq!(entries[0].container_status.as_deref(), Some("Up 5 minutes"));
        assert_eq!(entries[1].container_status, None);

        let no_docker = cross_reference(sockets, None);
        assert!(no_docker.iter().all(|e| e.container_status.is_none()));
    }
}
