// hymod/src/core/state.rs

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::{defs, utils};

/// Snapshot of the last state-changing invocation. Overwritten, never
/// appended; readers fall back to defaults on a truncated or damaged file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeState {
    #[serde(default)]
    pub pid: u32,
    #[serde(default)]
    pub storage_mode: String,
    #[serde(default)]
    pub mount_point: PathBuf,
    #[serde(default)]
    pub overlay_module_ids: Vec<String>,
    #[serde(default)]
    pub magic_module_ids: Vec<String>,
    #[serde(default)]
    pub hymofs_module_ids: Vec<String>,
    #[serde(default)]
    pub active_mounts: Vec<String>,
    #[serde(default)]
    pub nuke_active: bool,
    #[serde(default)]
    pub hymofs_mismatch: bool,
    #[serde(default)]
    pub mismatch_message: String,
}

impl RuntimeState {
    pub fn load_from(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
            Err(_) => RuntimeState::default(),
        }
    }

    pub fn load() -> Self {
        RuntimeState::load_from(Path::new(defs::STATE_FILE))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        utils::atomic_write(path, serde_json::to_string_pretty(self)?)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(Path::new(defs::STATE_FILE))
    }

    /// Every module ID must live in exactly one strategy set.
    pub fn strategy_sets_disjoint(&self) -> bool {
        let mut seen = std::collections::HashSet::new();
        self.overlay_module_ids
            .iter()
            .chain(&self.magic_module_ids)
            .chain(&self.hymofs_module_ids)
            .all(|id| seen.insert(id.as_str()))
    }
}

/// Per-mount operation counters, snapshotted for observability.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MountStats {
    pub files: u64,
    pub directories: u64,
    pub symlinks: u64,
    pub whiteouts: u64,
    pub tmpfs_layers: u64,
    pub failures: u64,
}

impl MountStats {
    pub fn merge(&mut self, other: &MountStats) {
        self.files += other.files;
        self.directories += other.directories;
        self.symlinks += other.symlinks;
        self.whiteouts += other.whiteouts;
        self.tmpfs_layers += other.tmpfs_layers;
        self.failures += other.failures;
    }

    pub fn snapshot_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        utils::atomic_write(path, serde_json::to_string_pretty(self)?)
    }

    pub fn snapshot(&self) -> Result<()> {
        self.snapshot_to(Path::new(defs::MOUNT_STATS_FILE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon_state.json");
        let state = RuntimeState {
            pid: 42,
            storage_mode: "tmpfs".into(),
            mount_point: PathBuf::from("/dev/hymo_mirror"),
            hymofs_module_ids: vec!["a".into(), "b".into()],
            active_mounts: vec!["system".into()],
            ..Default::default()
        };
        state.save_to(&path).unwrap();
        let loaded = RuntimeState::load_from(&path);
        assert_eq!(loaded.pid, 42);
        assert_eq!(loaded.storage_mode, "tmpfs");
        assert_eq!(loaded.hymofs_module_ids, vec!["a", "b"]);
    }

    #[test]
    fn truncated_file_reads_as_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon_state.json");
        fs::write(&path, "{\"pid\": 42, \"storage_mo").unwrap();
        let loaded = RuntimeState::load_from(&path);
        assert_eq!(loaded.pid, 0);
        assert!(loaded.hymofs_module_ids.is_empty());
    }

    #[test]
    fn missing_file_reads_as_default() {
        let loaded = RuntimeState::load_from(Path::new("/nonexistent/daemon_state.json"));
        assert_eq!(loaded.storage_mode, "");
    }

    #[test]
    fn disjoint_sets_detected() {
        let mut state = RuntimeState::default();
        state.overlay_module_ids = vec!["a".into()];
        state.magic_module_ids = vec!["b".into()];
        state.hymofs_module_ids = vec!["c".into()];
        assert!(state.strategy_sets_disjoint());
        state.magic_module_ids.push("a".into());
        assert!(!state.strategy_sets_disjoint());
    }

    #[test]
    fn stats_merge_accumulates() {
        let mut total = MountStats::default();
        total.merge(&MountStats {
            files: 3,
            symlinks: 1,
            ..Default::default()
        });
        total.merge(&MountStats {
            files: 2,
            failures: 1,
            ..Default::default()
        });
        assert_eq!(total.files, 5);
        assert_eq!(total.symlinks, 1);
        assert_eq!(total.failures, 1);
    }
}
