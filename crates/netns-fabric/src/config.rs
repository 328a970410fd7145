//! Engine configuration
//!
//! The server-list JSON describes every physical host taking part in the
//! emulation; `EngineContext` snapshots the local host's slice of it plus
//! all derived paths. The context is built once at startup and handed to
//! the managers by reference, so nothing in the realization path reads
//! process-wide mutable state.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read server config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse server config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("server id {0} not present in server list ({1} entries)")]
    UnknownServer(usize, usize),

    #[error("invalid docker image name '{0}', expected 'repo:tag'")]
    BadImageName(String),
}

/// One physical host in the emulation cluster.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    pub ip_addr: String,
    #[serde(rename = "infraWorkDir")]
    pub work_dir: PathBuf,
    pub phy_intf: String,
    pub docker_image_name: String,
    /// `(operation, comm, kernel function)` triples consumed by the
    /// external monitor tooling; parsed but not used by the core.
    #[serde(default)]
    pub kern_funcs_to_monitor: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
struct ServerFile {
    servers: Vec<Server>,
}

/// Immutable context threaded through the managers and the engine.
#[derive(Debug, Clone)]
pub struct EngineContext {
    pub servers: Vec<Server>,
    pub server_id: usize,
    pub work_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub bin_dir: PathBuf,
    pub cctr_path: PathBuf,
    pub rootfs_path: PathBuf,
    pub phy_intf: String,
    pub disable_ipv6: bool,
    pub parallel: usize,
    pub backbone_ns_num: usize,
}

impl EngineContext {
    /// Build a context from a server-list file.
    pub fn from_server_file(
        path: &Path,
        server_id: usize,
        disable_ipv6: bool,
        parallel: usize,
        backbone_ns_num: usize,
    ) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let file: ServerFile = serde_json::from_str(&text)?;
        Self::from_servers(file.servers, server_id, disable_ipv6, parallel, backbone_ns_num)
    }

    /// Single-server profile for runs without a server file. Cross-host
    /// edges cannot be realized under this profile.
    pub fn local_default(
        disable_ipv6: bool,
        parallel: usize,
        backbone_ns_num: usize,
    ) -> Result<Self, ConfigError> {
        let servers = vec![Server {
            ip_addr: "127.0.0.1".to_string(),
            work_dir: PathBuf::from("."),
            phy_intf: "eth0".to_string(),
            docker_image_name: "ubuntu:latest".to_string(),
            kern_funcs_to_monitor: Vec::new(),
        }];
        Self::from_servers(servers, 0, disable_ipv6, parallel, backbone_ns_num)
    }

    pub fn from_servers(
        servers: Vec<Server>,
        server_id: usize,
        disable_ipv6: bool,
        parallel: usize,
        backbone_ns_num: usize,
    ) -> Result<Self, ConfigError> {
        let local = servers
            .get(server_id)
            .ok_or(ConfigError::UnknownServer(server_id, servers.len()))?
            .clone();

        let work_dir = local.work_dir.clone();
        let tmp_dir = work_dir.join("tmp");
        let bin_dir = work_dir.join("bin");
        let cctr_path = bin_dir.join("cctr");

        let (repo, tag) = local
            .docker_image_name
            .split_once(':')
            .ok_or_else(|| ConfigError::BadImageName(local.docker_image_name.clone()))?;
        let rootfs_path = tmp_dir.join("img_bundles").join(repo).join(tag).join("rootfs");

        Ok(Self {
            phy_intf: local.phy_intf.clone(),
            servers,
            server_id,
            work_dir,
            tmp_dir,
            bin_dir,
            cctr_path,
            rootfs_path,
            disable_ipv6,
            parallel,
            backbone_ns_num: backbone_ns_num.max(1),
        })
    }

    /// Remote peer address for a cross-host edge.
    pub fn peer_addr(&self, server_id: usize) -> Result<&str, ConfigError> {
        self.servers
            .get(server_id)
            .map(|s| s.ip_addr.as_str())
            .ok_or(ConfigError::UnknownServer(server_id, self.servers.len()))
    }

    /// Scratch directory for per-node launcher state.
    pub fn nodes_dir(&self) -> PathBuf {
        self.tmp_dir.join("nodes")
    }

    pub fn link_log_path(&self) -> PathBuf {
        self.tmp_dir.join("link_log.txt")
    }

    pub fn operation_log_path(&self, operation: &str) -> PathBuf {
        self.tmp_dir.join(format!("{}_log.txt", operation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"{
        "servers": [
            {
                "ipAddr": "10.0.0.1",
                "infraWorkDir": "/srv/netweave",
                "phyIntf": "eno1",
                "dockerImageName": "emu:v3",
                "kernFuncsToMonitor": [["setup", "cctr", "copy_net_ns"]]
            },
            {
                "ipAddr": "10.0.0.2",
                "infraWorkDir": "/srv/netweave",
                "phyIntf": "eno1",
                "dockerImageName": "emu:v3"
            }
        ]
    }"#;

    #[test]
    fn parses_server_file_and_derives_paths() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(SAMPLE.as_bytes()).unwrap();

        let ctx = EngineContext::from_server_file(f.path(), 0, true, 4, 3).unwrap();
        assert_eq!(ctx.servers.len(), 2);
        assert_eq!(ctx.phy_intf, "eno1");
        assert_eq!(ctx.tmp_dir, PathBuf::from("/srv/netweave/tmp"));
        assert_eq!(ctx.cctr_path, PathBuf::from("/srv/netweave/bin/cctr"));
        assert_eq!(
            ctx.rootfs_path,
            PathBuf::from("/srv/netweave/tmp/img_bundles/emu/v3/rootfs")
        );
        assert!(ctx.disable_ipv6);
        assert_eq!(ctx.parallel, 4);
        assert_eq!(ctx.backbone_ns_num, 3);
        assert_eq!(ctx.peer_addr(1).unwrap(), "10.0.0.2");
        assert_eq!(
            ctx.servers[0].kern_funcs_to_monitor,
            vec![vec!["setup", "cctr", "copy_net_ns"]]
        );
    }

    #[test]
    fn rejects_out_of_range_server_id() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(SAMPLE.as_bytes()).unwrap();
        let err = EngineContext::from_server_file(f.path(), 7, false, 0, 1).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownServer(7, 2)));
    }

    #[test]
    fn rejects_untagged_image_name() {
        let servers = vec![Server {
            ip_addr: "10.0.0.1".into(),
            work_dir: PathBuf::from("/srv"),
            phy_intf: "eth0".into(),
            docker_image_name: "plainimage".into(),
            kern_funcs_to_monitor: Vec::new(),
        }];
        let err = EngineContext::from_servers(servers, 0, false, 0, 1).unwrap_err();
        assert!(matches!(err, ConfigError::BadImageName(_)));
    }

    #[test]
    fn local_default_is_single_server() {
        let ctx = EngineContext::local_default(false, 0, 1).unwrap();
        assert_eq!(ctx.servers.len(), 1);
        assert_eq!(ctx.server_id, 0);
        assert!(ctx.peer_addr(1).is_err());
    }

    #[test]
    fn backbone_count_is_clamped_to_one() {
        let ctx = EngineContext::local_default(false, 0, 0).unwrap();
        assert_eq!(ctx.backbone_ns_num, 1);
    }

    #[test]
    fn log_paths_live_under_tmp() {
        let ctx = EngineContext::local_default(false, 0, 1).unwrap();
        assert_eq!(ctx.link_log_path(), PathBuf::from("./tmp/link_log.txt"));
        assert_eq!(
            ctx.operation_log_path("setup"),
            PathBuf::from("./tmp/setup_log.txt")
        );
    }
}
