//! Per-invocation scratch directory.
//!
//! Every stage invocation gets its own directory under the configured working directory.
//! The directory is optionally backed by a tmpfs mount and is removed when the
//! [`WorkspaceGuard`] drops, on success and failure alike, unless retention is enabled.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::error::{BridgeError, BridgeResult};

/// Builder for a fresh workspace.
#[derive(Debug, Clone, Copy)]
pub struct Workspace;

impl Workspace {
    /// Create `<base>/<workspace_id>` and return the guard that owns it.
    ///
    /// An existing directory with the same id is an error, never shared.
    pub fn begin(base: &Path, retain: bool) -> BridgeResult<WorkspaceGuard> {
        Self::begin_with_id(base, workspace_id(), retain)
    }

    fn begin_with_id(base: &Path, id: String, retain: bool) -> BridgeResult<WorkspaceGuard> {
        std::fs::create_dir_all(base).map_err(|e| BridgeError::io(base, e))?;
        let root = base.join(&id);
        std::fs::create_dir(&root).map_err(|e| BridgeError::io(&root, e))?;
        debug!(workspace = %root.display(), retain, "created workspace");
        Ok(WorkspaceGuard {
            id,
            root,
            retain,
            mounted: false,
        })
    }
}

/// `bart_<HH_MM_SS>__<1..=10000>_<thread>`.
fn workspace_id() -> String {
    let time = chrono::Local::now().format("%H_%M_%S");
    let salt: u32 = rand::thread_rng().gen_range(1..=10_000);
    format!("bart_{time}__{salt}_{}", thread_number())
}

/// Numeric part of the current thread's id.
fn thread_number() -> u64 {
    // ThreadId only exposes its number through Debug: "ThreadId(7)".
    let debug = format!("{:?}", std::thread::current().id());
    debug
        .chars()
        .filter(char::is_ascii_digit)
        .collect::<String>()
        .parse()
        .unwrap_or(0)
}

/// Owns a workspace directory for the duration of one invocation.
pub struct WorkspaceGuard {
    id: String,
    root: PathBuf,
    retain: bool,
    mounted: bool,
}

impl WorkspaceGuard {
    /// Workspace identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Directory path.
    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Whether the directory is kept after the invocation.
    pub fn is_retained(&self) -> bool {
        self.retain
    }

    /// Whether a tmpfs is mounted on the directory.
    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    /// Mount a tmpfs of `size_mb` megabytes on the directory.
    ///
    /// Skipped for retained workspaces, whose content must survive the unmount.
    pub fn mount_tmpfs(&mut self, size_mb: u32) -> BridgeResult<()> {
        if self.retain {
            debug!(workspace = %self.id, "retained workspace, tmpfs not mounted");
            return Ok(());
        }
        let status = Command::new("mount")
            .args(["-t", "tmpfs", "-o"])
            .arg(format!("size={size_mb}M,mode=0755"))
            .arg("tmpfs")
            .arg(&self.root)
            .status()
            .map_err(|e| BridgeError::io(&self.root, e))?;
        if !status.success() {
            return Err(BridgeError::io(
                &self.root,
                std::io::Error::other(format!("mount tmpfs exited with {status}")),
            ));
        }
        self.mounted = true;
        info!(workspace = %self.id, size_mb, "mounted tmpfs");
        Ok(())
    }

    fn unmount(&mut self) {
        match Command::new("umount").arg(&self.root).status() {
            Ok(status) if status.success() => self.mounted = false,
            Ok(status) => warn!(workspace = %self.id, %status, "umount failed"),
            Err(e) => warn!(workspace = %self.id, error = %e, "could not run umount"),
        }
    }
}

impl fmt::Debug for WorkspaceGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkspaceGuard")
            .field("root", &self.root)
            .field("retain", &self.retain)
            .field("mounted", &self.mounted)
            .finish()
    }
}

impl Drop for WorkspaceGuard {
    fn drop(&mut self) {
        if self.mounted {
            self.unmount();
        }
        if self.retain {
            info!(workspace = %self.root.display(), "workspace retained");
            return;
        }
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => debug!(workspace = %self.id, "removed workspace"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(workspace = %self.root.display(), error = %e, "could not remove workspace"),
        }
    }
}
