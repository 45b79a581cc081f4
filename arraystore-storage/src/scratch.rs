//! Per-operator scratch directories.
//!
//! Every storage operator stages object-storage uploads in its own directory named
//! `op-<pid>-<token>-*` under the scratch root. The directory is removed when the operator is
//! dropped. Directories left behind by crashed processes are swept the next time an operator is
//! created under the same root.

use std::path::{Path, PathBuf};

use sysinfo::{Pid, ProcessesToUpdate, System};

const SCRATCH_PREFIX: &str = "op-";

#[derive(Debug)]
pub struct ScratchDir {
    dir: tempfile::TempDir,
}

impl ScratchDir {
    pub fn create(root: &Path) -> std::io::Result<Self> {
        std::fs::create_dir_all(root)?;
        let swept = sweep_orphans(root);
        if swept > 0 {
            tracing::info!(root = %root.display(), swept, "removed orphaned scratch directories");
        }

        let token = uuid::Uuid::new_v4().simple().to_string();
        let dir = tempfile::Builder::new()
            .prefix(&format!("{SCRATCH_PREFIX}{}-{token}-", std::process::id()))
            .tempdir_in(root)?;
        tracing::debug!(path = %dir.path().display(), "created scratch directory");

        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn close(self) -> std::io::Result<()> {
        tracing::debug!(path = %self.dir.path().display(), "removing scratch directory");
        self.dir.close()
    }
}

/// A fresh, unused file path inside `dir` for staging one upload.
pub fn stage_path(dir: &Path) -> PathBuf {
    dir.join(uuid::Uuid::new_v4().simple().to_string())
}

/// Removes scratch directories under `root` whose owning process no longer runs.
pub fn sweep_orphans(root: &Path) -> usize {
    let Ok(entries) = std::fs::read_dir(root) else {
        return 0;
    };

    let own_pid = std::process::id();
    let mut system = System::new();
    let mut removed = 0;

    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(pid) = owner_pid(&name.to_string_lossy()) else {
            continue;
        };
        if pid == own_pid {
            continue;
        }

        let pid = Pid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        if system.process(pid).is_some() {
            continue;
        }

        match std::fs::remove_dir_all(entry.path()) {
            Ok(()) => removed += 1,
            Err(e) => tracing::warn!(
                path = %entry.path().display(),
                error = %e,
                "failed to remove orphaned scratch directory"
            ),
        }
    }
    removed
}

fn owner_pid(name: &str) -> Option<u32> {
    name.strip_prefix(SCRATCH_PREFIX)?
        .split('-')
        .next()?
        .parse()
        .ok()
}
