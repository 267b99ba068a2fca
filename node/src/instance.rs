//! Run-state of a local node: the data-directory lock and an optional PID file.
//!
//! `<data_dir>/.soundmesh.lock` is held with an exclusive advisory lock while a
//! node runs. Its body is a JSON [`InstanceInfo`], so client subcommands can
//! find the mesh listener of whichever node owns the directory.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{Deserialize, Serialize};

pub const LOCK_FILE_NAME: &str = ".soundmesh.lock";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mesh_addr: Option<SocketAddr>,
}

struct DirLock {
    path: PathBuf,
    file: File,
}

/// Held for the lifetime of a running node; releases everything on drop.
pub struct Instance {
    info: InstanceInfo,
    lock: Option<DirLock>,
    pid_file: Option<PathBuf>,
}

impl Instance {
    /// Lock `data_dir` (disk-backed nodes only) and create `pid_file`.
    pub fn claim(data_dir: Option<&Path>, pid_file: Option<&Path>) -> Result<Self> {
        let mut instance = Self {
            info: InstanceInfo {
                pid: std::process::id(),
                peer_id: None,
                mesh_addr: None,
            },
            lock: data_dir.map(lock_data_dir).transpose()?,
            pid_file: None,
        };
        instance.write_info()?;
        if let Some(path) = pid_file {
            instance.pid_file = Some(create_pid_file(path)?);
        }
        Ok(instance)
    }

    /// Publish the bound mesh listener for client subcommands.
    pub fn record_listener(&mut self, peer_id: &str, addr: SocketAddr) -> Result<()> {
        self.info.peer_id = Some(peer_id.to_string());
        self.info.mesh_addr = Some(addr);
        self.write_info()
    }

    pub fn info(&self) -> &InstanceInfo {
        &self.info
    }

    fn write_info(&self) -> Result<()> {
        let Some(lock) = &self.lock else {
            return Ok(());
        };
        let body = serde_json::to_vec(&self.info)?;
        let mut file = &lock.file;
        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&body)?;
        file.sync_data()
            .with_context(|| format!("failed to write {}", lock.path.display()))
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        if let Some(path) = self.pid_file.take() {
            let _ = fs::remove_file(path);
        }
        // Unlink before unlocking so a successor never loses its fresh file.
        if let Some(lock) = self.lock.take() {
            let _ = fs::remove_file(&lock.path);
            let _ = lock.file.unlock();
        }
    }
}

/// The node currently holding `data_dir`, if one is running.
pub fn running_instance(data_dir: &Path) -> Option<InstanceInfo> {
    let file = File::open(data_dir.join(LOCK_FILE_NAME)).ok()?;
    if file.try_lock_shared().is_ok() {
        // Left behind by a node that did not shut down cleanly.
        let _ = file.unlock();
        return None;
    }
    read_info(&file)
}

fn lock_data_dir(dir: &Path) -> Result<DirLock> {
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create data directory {}", dir.display()))?;
    let path = dir.join(LOCK_FILE_NAME);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&path)
        .with_context(|| format!("failed to open {}", path.display()))?;

    if file.try_lock_exclusive().is_err() {
        let owner = read_info(&file)
            .map(|info| format!("node pid {}", info.pid))
            .unwrap_or_else(|| "another process".to_string());
        anyhow::bail!("data directory {} is in use by {owner}", dir.display());
    }
    Ok(DirLock { path, file })
}

fn read_info(mut file: &File) -> Option<InstanceInfo> {
    let mut body = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut body).ok()?;
    serde_json::from_str(&body).ok()
}

fn create_pid_file(path: &Path) -> Result<PathBuf> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::AlreadyExists => {
            let owner = fs::read_to_string(path).unwrap_or_default();
            anyhow::bail!(
                "PID file {} already names pid {}; remove it if that node is gone",
                path.display(),
                owner.trim()
            );
        }
        Err(err) => {
            return Err(err).with_context(|| format!("failed to create {}", path.display()))
        }
    };
    writeln!(file, "{}", std::process::id())?;
    Ok(path.to_path_buf())
}
