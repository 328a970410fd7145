//! Host environment control
//!
//! Sysctl writes needed before a large setup run, the per-namespace IPv6
//! switch, and the append-only link timing log.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

const PTY_MAX_PATH: &str = "/proc/sys/kernel/pty/max";
const PTY_RESERVE_PATH: &str = "/proc/sys/kernel/pty/reserve";
const DISABLE_IPV6_PATH: &str = "/proc/sys/net/ipv6/conf/all/disable_ipv6";

/// Every containerized node may allocate ptys; the defaults run out at
/// emulation scale.
const PTY_MAX: &str = "262144";
const PTY_RESERVE: &str = "65536";

#[derive(Error, Debug)]
pub enum EnvError {
    #[error("failed to write sysctl {path}: {source}")]
    Sysctl {
        path: &'static str,
        source: std::io::Error,
    },

    #[error("failed to open link log: {0}")]
    LinkLog(std::io::Error),
}

fn write_sysctl(path: &'static str, value: &str) -> Result<(), EnvError> {
    let mut f = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|source| EnvError::Sysctl { path, source })?;
    f.write_all(value.as_bytes())
        .map_err(|source| EnvError::Sysctl { path, source })?;
    debug!("sysctl {} = {}", path, value);
    Ok(())
}

/// Raise the host pty limits before a setup run.
pub fn apply_host_sysctls() -> Result<(), EnvError> {
    write_sysctl(PTY_MAX_PATH, PTY_MAX)?;
    write_sysctl(PTY_RESERVE_PATH, PTY_RESERVE)?;
    Ok(())
}

/// Disable IPv6 inside the calling thread's current network namespace.
pub fn disable_ipv6_for_current_netns() -> Result<(), EnvError> {
    write_sysctl(DISABLE_IPV6_PATH, "1")
}

/// Append-only per-link timing log: one `Node {v}` header per node and
/// one `Link no.{k} {ns}ns` line per realized link. Writes are serialized
/// so parallel link setup interleaves whole lines only.
pub struct LinkLog {
    file: Mutex<File>,
}

impl LinkLog {
    pub fn open(path: &Path) -> Result<Self, EnvError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(EnvError::LinkLog)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(EnvError::LinkLog)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    pub fn node_header(&self, node: usize) {
        let mut file = self.file.lock();
        let _ = writeln!(file, "Node {}", node);
    }

    pub fn link_line(&self, link_index: u64, elapsed: std::time::Duration) {
        let mut file = self.file.lock();
        let _ = writeln!(file, "Link no.{} {}ns", link_index, elapsed.as_nanos());
    }
}
