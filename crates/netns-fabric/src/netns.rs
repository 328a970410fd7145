//! Network namespace handles
//!
//! Named namespaces follow the `/var/run/netns/<name>` bind-mount
//! convention so they are visible to `ip netns`. A handle is an owned
//! file descriptor; it stays valid until dropped, and must be dropped
//! before the namespace backing it is deleted.

use nix::mount::{mount, umount, MsFlags};
use nix::sched::{setns, unshare, CloneFlags};
use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// Directory enumerated for named-namespace cleanup.
pub const NETNS_DIR: &str = "/var/run/netns";

#[derive(Error, Debug)]
pub enum NetnsError {
    #[error("Failed to create netns directory: {0}")]
    CreateDir(std::io::Error),

    #[error("Failed to create netns file: {0}")]
    CreateFile(std::io::Error),

    #[error("Failed to unshare network namespace: {0}")]
    Unshare(nix::Error),

    #[error("Failed to mount namespace: {0}")]
    Mount(nix::Error),

    #[error("Failed to unmount namespace: {0}")]
    Unmount(nix::Error),

    #[error("Failed to enter namespace: {0}")]
    SetNs(nix::Error),

    #[error("Failed to open namespace file: {0}")]
    OpenNs(std::io::Error),

    #[error("Failed to delete namespace: {0}")]
    Delete(std::io::Error),

    #[error("Namespace '{0}' already exists")]
    AlreadyExists(String),
}

/// Owned file-descriptor handle to a network namespace.
#[derive(Debug)]
pub struct NetnsHandle {
    file: File,
}

impl NetnsHandle {
    /// Handle to the calling thread's current network namespace.
    pub fn current() -> Result<Self, NetnsError> {
        Self::open_path("/proc/thread-self/ns/net")
    }

    /// Handle to the network namespace of process `pid`.
    pub fn from_pid(pid: u32) -> Result<Self, NetnsError> {
        Self::open_path(format!("/proc/{}/ns/net", pid))
    }

    /// Handle to an existing named namespace.
    pub fn open_named(name: &str) -> Result<Self, NetnsError> {
        Self::open_path(Path::new(NETNS_DIR).join(name))
    }

    /// Create a named namespace and leave the calling thread inside it.
    ///
    /// The sequence is: touch the bind-mount target, unshare the thread
    /// into a fresh namespace, bind-mount the thread's namespace onto the
    /// target, then open the target as the handle.
    pub fn create_named(name: &str) -> Result<Self, NetnsError> {
        std::fs::create_dir_all(NETNS_DIR).map_err(NetnsError::CreateDir)?;
        let ns_path = Path::new(NETNS_DIR).join(name);
        if ns_path.exists() {
            return Err(NetnsError::AlreadyExists(name.to_string()));
        }

        debug!("creating namespace {}", name);
        File::create(&ns_path).map_err(NetnsError::CreateFile)?;

        if let Err(e) = unshare(CloneFlags::CLONE_NEWNET) {
            let _ = std::fs::remove_file(&ns_path);
            return Err(NetnsError::Unshare(e));
        }
        if let Err(e) = mount(
            Some("/proc/thread-self/ns/net"),
            &ns_path,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        ) {
            let _ = std::fs::remove_file(&ns_path);
            return Err(NetnsError::Mount(e));
        }

        Self::open_path(ns_path)
    }

    /// Switch the calling thread into this namespace.
    pub fn enter(&self) -> Result<(), NetnsError> {
        setns(&self.file, CloneFlags::CLONE_NEWNET).map_err(NetnsError::SetNs)
    }

    pub fn raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    fn open_path<P: AsRef<Path>>(path: P) -> Result<Self, NetnsError> {
        let file = OpenOptions::new()
            .read(true)
            .open(path.as_ref())
            .map_err(NetnsError::OpenNs)?;
        Ok(Self { file })
    }
}

impl AsFd for NetnsHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.file.as_fd()
    }
}

/// Delete one named namespace: unmount, then unlink.
pub fn delete_named(name: &str) -> Result<(), NetnsError> {
    let ns_path = Path::new(NETNS_DIR).join(name);
    if let Err(e) = umount(&ns_path) {
        // Already-unmounted entries are unlinked anyway.
        warn!("failed to unmount namespace {}: {}", name, e);
    }
    std::fs::remove_file(&ns_path).map_err(NetnsError::Delete)?;
    debug!("deleted namespace {}", name);
    Ok(())
}

/// Names of all namespaces under [`NETNS_DIR`].
pub fn list_named() -> Result<Vec<String>, NetnsError> {
    let dir = PathBuf::from(NETNS_DIR);
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in std::fs::read_dir(&dir).map_err(NetnsError::OpenNs)? {
        let entry = entry.map_err(NetnsError::OpenNs)?;
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

/// Destroy every named namespace. Returns how many entries were removed.
pub fn delete_all_named() -> Result<usize, NetnsError> {
    let names = list_named()?;
    let mut removed = 0;
    for name in &names {
        delete_named(name)?;
        removed += 1;
    }
    Ok(removed)
}
