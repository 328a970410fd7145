//! Node lifecycle management
//!
//! A virtual node is a containerized process owning a fresh network
//! namespace. The external `cctr` launcher creates it, writes the child
//! PID to `pid.txt`, and the namespace handle is obtained from
//! `/proc/{pid}/ns/net`. Handles are cached: the map is written by the
//! driver between batches and read concurrently by link-setup workers.

use crate::config::EngineContext;
use crate::netns::{NetnsError, NetnsHandle};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("launcher failed for node {node}: {detail}")]
    LauncherFailed { node: usize, detail: String },

    #[error("no namespace cached for node {0}")]
    UnknownNode(usize),

    #[error("failed to read pid file for node {node}: {detail}")]
    PidFile { node: usize, detail: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("namespace error: {0}")]
    Netns(#[from] NetnsError),
}

/// Capability set the realization engine needs from a node backend.
pub trait NodeManager: Send + Sync {
    /// Prepare the node scratch directory; purge it first on `setup`.
    fn init(&self, purge_existing: bool) -> Result<(), NodeError>;

    /// Instantiate a node and cache its namespace handle. Returns the
    /// launcher wall time.
    fn setup_node(
        &self,
        node: usize,
    ) -> impl std::future::Future<Output = Result<Duration, NodeError>> + Send;

    /// Cached namespace handle for a node set up earlier.
    fn node_netns(&self, node: usize) -> Result<Arc<NetnsHandle>, NodeError>;

    /// Tear a node down through the launcher's `kill` verb.
    fn clean_node(
        &self,
        node: usize,
    ) -> impl std::future::Future<Output = Result<(), NodeError>> + Send;

    /// Release all cached handles.
    fn delete(&self);
}

/// Node manager backed by the `cctr` container launcher.
pub struct CctrNodeManager {
    ctx: Arc<EngineContext>,
    nodes_dir: PathBuf,
    handles: RwLock<HashMap<usize, Arc<NetnsHandle>>>,
}

impl CctrNodeManager {
    pub fn new(ctx: Arc<EngineContext>) -> Self {
        let nodes_dir = ctx.nodes_dir();
        Self {
            ctx,
            nodes_dir,
            handles: RwLock::new(HashMap::new()),
        }
    }

    fn node_dir(&self, node: usize) -> PathBuf {
        self.nodes_dir.join(format!("node{}", node))
    }

    fn read_pid(&self, node: usize) -> Result<u32, NodeError> {
        let path = self.node_dir(node).join("pid.txt");
        let text = std::fs::read_to_string(&path).map_err(|e| NodeError::PidFile {
            node,
            detail: format!("{}: {}", path.display(), e),
        })?;
        let first = text.lines().next().unwrap_or("").trim();
        first.parse::<u32>().map_err(|_| NodeError::PidFile {
            node,
            detail: format!("invalid pid '{}' in {}", first, path.display()),
        })
    }
}

impl NodeManager for CctrNodeManager {
    fn init(&self, purge_existing: bool) -> Result<(), NodeError> {
        if purge_existing && self.nodes_dir.exists() {
            std::fs::remove_dir_all(&self.nodes_dir)?;
        }
        std::fs::create_dir_all(&self.nodes_dir)?;
        Ok(())
    }

    async fn setup_node(&self, node: usize) -> Result<Duration, NodeError> {
        let base_dir = self.node_dir(node);
        std::fs::create_dir_all(&base_dir)?;
        let hostname = format!("node{}", node);
        let pid_file_arg = format!("--pid-file={}", base_dir.join("pid.txt").display());
        let run_log = std::fs::File::create(base_dir.join("run.log"))?;

        debug!("launching node {}", node);
        let started = Instant::now();
        let status = Command::new(&self.ctx.cctr_path)
            .arg("run")
            .arg(&base_dir)
            .arg(&hostname)
            .arg(&self.ctx.rootfs_path)
            .arg(&pid_file_arg)
            .arg("-v")
            .stdout(Stdio::from(run_log.try_clone()?))
            .stderr(Stdio::from(run_log))
            .status()
            .await
            .map_err(|e| NodeError::LauncherFailed {
                node,
                detail: e.to_string(),
            })?;
        let elapsed = started.elapsed();

        if !status.success() {
            return Err(NodeError::LauncherFailed {
                node,
                detail: format!("launcher exited with {}", status),
            });
        }

        let pid = self.read_pid(node)?;
        let handle = NetnsHandle::from_pid(pid)?;
        self.handles.write().insert(node, Arc::new(handle));
        Ok(elapsed)
    }

    fn node_netns(&self, node: usize) -> Result<Arc<NetnsHandle>, NodeError> {
        self.handles
            .read()
            .get(&node)
            .cloned()
            .ok_or(NodeError::UnknownNode(node))
    }

    async fn clean_node(&self, node: usize) -> Result<(), NodeError> {
        let base_dir = self.node_dir(node);
        let pid = self.read_pid(node)?;
        let kill_log = std::fs::File::create(base_dir.join("kill.log"))?;

        debug!("killing node {} (pid {})", node, pid);
        let status = Command::new(&self.ctx.cctr_path)
            .arg("kill")
            .arg(pid.to_string())
            .arg("-v")
            .stdout(Stdio::from(kill_log.try_clone()?))
            .stderr(Stdio::from(kill_log))
            .status()
            .await
            .map_err(|e| NodeError::LauncherFailed {
                node,
                detail: e.to_string(),
            })?;
        if !status.success() {
            return Err(NodeError::LauncherFailed {
                node,
                detail: format!("kill exited with {}", status),
            });
        }
        self.handles.write().remove(&node);
        Ok(())
    }

    fn delete(&self) {
        self.handles.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Server;
    use std::os::unix::fs::PermissionsExt;

    /// Stand-in launcher: `run` records the parent pid (this test
    /// process, whose netns is always openable), `kill` is a no-op.
    const FAKE_CCTR: &str = r#"#!/bin/sh
verb="$1"
for a in "$@"; do
    case "$a" in
        --pid-file=*) echo $PPID > "${a#--pid-file=}" ;;
    esac
done
[ "$verb" = "fail" ] && exit 1
exit 0
"#;

    fn test_ctx(dir: &std::path::Path, launcher: &str) -> Arc<EngineContext> {
        let bin_dir = dir.join("bin");
        std::fs::create_dir_all(&bin_dir).unwrap();
        let cctr = bin_dir.join("cctr");
        std::fs::write(&cctr, launcher).unwrap();
        std::fs::set_permissions(&cctr, std::fs::Permissions::from_mode(0o755)).unwrap();

        let servers = vec![Server {
            ip_addr: "127.0.0.1".into(),
            work_dir: dir.to_path_buf(),
            phy_intf: "eth0".into(),
            docker_image_name: "emu:test".into(),
            kern_funcs_to_monitor: Vec::new(),
        }];
        Arc::new(EngineContext::from_servers(servers, 0, false, 0, 1).unwrap())
    }

    #[tokio::test]
    async fn setup_node_caches_a_namespace_handle() {
        let dir = tempfile::tempdir().unwrap();
        let nm = CctrNodeManager::new(test_ctx(dir.path(), FAKE_CCTR));
        nm.init(true).unwrap();

        let elapsed = nm.setup_node(7).await.unwrap();
        assert!(elapsed > Duration::ZERO);
        assert!(dir.path().join("tmp/nodes/node7/pid.txt").exists());
        assert!(dir.path().join("tmp/nodes/node7/run.log").exists());
        nm.node_netns(7).unwrap();

        nm.clean_node(7).await.unwrap();
        assert!(dir.path().join("tmp/nodes/node7/kill.log").exists());
        assert!(matches!(nm.node_netns(7), Err(NodeError::UnknownNode(7))));
    }

    #[tokio::test]
    async fn failing_launcher_is_surfaced() {
        let dir = tempfile::tempdir().unwrap();
        // A launcher that always exits non-zero.
        let nm = CctrNodeManager::new(test_ctx(dir.path(), "#!/bin/sh\nexit 1\n"));
        nm.init(true).unwrap();
        let err = nm.setup_node(0).await.unwrap_err();
        assert!(matches!(err, NodeError::LauncherFailed { node: 0, .. }));
    }

    #[tokio::test]
    async fn missing_pid_file_is_a_pid_error() {
        let dir = tempfile::tempdir().unwrap();
        // Launcher succeeds but never writes the pid file.
        let nm = CctrNodeManager::new(test_ctx(dir.path(), "#!/bin/sh\nexit 0\n"));
        nm.init(true).unwrap();
        let err = nm.setup_node(0).await.unwrap_err();
        assert!(matches!(err, NodeError::PidFile { node: 0, .. }));
    }

    #[test]
    fn init_purges_stale_state_on_setup() {
        let dir = tempfile::tempdir().unwrap();
        let nm = CctrNodeManager::new(test_ctx(dir.path(), FAKE_CCTR));

        let stale = dir.path().join("tmp/nodes/node0");
        std::fs::create_dir_all(&stale).unwrap();
        std::fs::write(stale.join("pid.txt"), "1\n").unwrap();

        nm.init(true).unwrap();
        assert!(!stale.exists());
        assert!(dir.path().join("tmp/nodes").exists());

        // Clean mode keeps existing state.
        std::fs::create_dir_all(&stale).unwrap();
        nm.init(false).unwrap();
        assert!(stale.exists());
    }

    #[test]
    fn unknown_node_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let nm = CctrNodeManager::new(test_ctx(dir.path(), FAKE_CCTR));
        assert!(matches!(nm.node_netns(3), Err(NodeError::UnknownNode(3))));
    }
}
