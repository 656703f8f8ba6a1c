// hymod/src/config.rs
// Copyright 2026 Hymo Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::{defs, utils};

/// Backing store preference for the mirror.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsType {
    #[default]
    Auto,
    Tmpfs,
    Ext4,
    Erofs,
}

impl fmt::Display for FsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FsType::Auto => "auto",
            FsType::Tmpfs => "tmpfs",
            FsType::Ext4 => "ext4",
            FsType::Erofs => "erofs",
        };
        f.write_str(s)
    }
}

/// Which init stage the shell wrappers should invoke the core in. The core
/// only persists this; the wrappers read it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MountStage {
    #[serde(rename = "post-fs-data")]
    #[default]
    PostFsData,
    #[serde(rename = "metamount")]
    Metamount,
    #[serde(rename = "services")]
    Services,
}

/// Per-module mount strategy. `Auto` resolves at plan time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountMode {
    #[default]
    Auto,
    Hymofs,
    Overlay,
    Magic,
    None,
}

impl MountMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(MountMode::Auto),
            "hymofs" => Some(MountMode::Hymofs),
            "overlay" => Some(MountMode::Overlay),
            "magic" => Some(MountMode::Magic),
            "none" => Some(MountMode::None),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MountMode::Auto => "auto",
            MountMode::Hymofs => "hymofs",
            MountMode::Overlay => "overlay",
            MountMode::Magic => "magic",
            MountMode::None => "none",
        }
    }
}

/// One per-path strategy override inside a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRule {
    pub path: String,
    pub mode: MountMode,
}

fn default_moduledir() -> PathBuf {
    PathBuf::from(defs::DEFAULT_MODULE_DIR)
}

fn default_mountsource() -> String {
    defs::DEFAULT_MOUNT_SOURCE.to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_moduledir")]
    pub moduledir: PathBuf,
    #[serde(default)]
    pub tempdir: Option<PathBuf>,
    #[serde(default)]
    pub mirror_path: Option<String>,
    #[serde(default = "default_mountsource")]
    pub mountsource: String,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default)]
    pub fs_type: FsType,
    #[serde(default)]
    pub disable_umount: bool,
    #[serde(default)]
    pub enable_nuke: bool,
    #[serde(default)]
    pub ignore_protocol_mismatch: bool,
    #[serde(default)]
    pub enable_kernel_debug: bool,
    #[serde(default)]
    pub enable_stealth: bool,
    #[serde(default = "default_true")]
    pub hymofs_enabled: bool,
    #[serde(default)]
    pub uname_release: String,
    #[serde(default)]
    pub uname_version: String,
    #[serde(default)]
    pub partitions: Vec<String>,
    #[serde(default)]
    pub mount_stage: MountStage,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            moduledir: default_moduledir(),
            tempdir: None,
            mirror_path: None,
            mountsource: default_mountsource(),
            verbose: false,
            fs_type: FsType::Auto,
            disable_umount: false,
            enable_nuke: false,
            ignore_protocol_mismatch: false,
            enable_kernel_debug: false,
            enable_stealth: false,
            hymofs_enabled: true,
            uname_release: String::new(),
            uname_version: String::new(),
            partitions: Vec::new(),
            mount_stage: MountStage::PostFsData,
        }
    }
}

impl Config {
    /// Load from an explicit path. Parse failure is fatal here; the caller
    /// asked for this exact file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))
            .context(ErrorKind::ConfigInvalid)?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))
            .context(ErrorKind::ConfigInvalid)
    }

    pub fn load_default() -> Result<Self> {
        Config::from_file(Path::new(defs::CONFIG_FILE))
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        utils::atomic_write(path, json)
            .with_context(|| format!("Failed to write config {}", path.display()))
    }

    /// CLI flags override the persisted configuration.
    pub fn merge_with_cli(
        &mut self,
        moduledir: Option<PathBuf>,
        tempdir: Option<PathBuf>,
        mountsource: Option<String>,
        verbose: bool,
        partitions: Vec<String>,
    ) {
        if let Some(dir) = moduledir {
            self.moduledir = dir;
        }
        if let Some(dir) = tempdir {
            self.tempdir = Some(dir);
        }
        if let Some(source) = mountsource {
            self.mountsource = source;
        }
        if verbose {
            self.verbose = true;
        }
        for part in partitions {
            if !self.partitions.contains(&part) {
                self.partitions.push(part);
            }
        }
    }

    /// Union of builtins and configured extras, deduped. `system` is always
    /// a member because BUILTIN_PARTITIONS leads with it.
    pub fn all_partitions(&self) -> Vec<String> {
        let mut parts: Vec<String> = defs::BUILTIN_PARTITIONS
            .iter()
            .map(|s| s.to_string())
            .collect();
        for extra in &self.partitions {
            if !parts.iter().any(|p| p == extra) {
                parts.push(extra.clone());
            }
        }
        parts
    }

    /// Mirror point priority: mirror_path > tempdir > /dev/hymo_mirror.
    pub fn effective_mirror_path(&self) -> PathBuf {
        if let Some(p) = &self.mirror_path
            && !p.is_empty()
        {
            return PathBuf::from(p);
        }
        if let Some(t) = &self.tempdir {
            return t.clone();
        }
        PathBuf::from(defs::HYMO_MIRROR_DEV)
    }
}

/// Persisted `{id -> mode}` map. Parse failure means empty, never an error.
pub fn load_module_modes_from(path: &Path) -> HashMap<String, MountMode> {
    match fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
        Err(_) => HashMap::new(),
    }
}

pub fn load_module_modes() -> HashMap<String, MountMode> {
    load_module_modes_from(Path::new(defs::MODULE_MODE_FILE))
}

pub fn save_module_modes_to(path: &Path, modes: &HashMap<String, MountMode>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    utils::atomic_write(path, serde_json::to_string_pretty(modes)?)
}

pub fn save_module_modes(modes: &HashMap<String, MountMode>) -> Result<()> {
    save_module_modes_to(Path::new(defs::MODULE_MODE_FILE), modes)
}

/// Persisted `{id -> [{path, mode}]}` map, same tolerance rules.
pub fn load_module_rules_from(path: &Path) -> HashMap<String, Vec<PathRule>> {
    match fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
        Err(_) => HashMap::new(),
    }
}

pub fn load_module_rules() -> HashMap<String, Vec<PathRule>> {
    load_module_rules_from(Path::new(defs::MODULE_RULES_FILE))
}

pub fn save_module_rules_to(path: &Path, rules: &HashMap<String, Vec<PathRule>>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    utils::atomic_write(path, serde_json::to_string_pretty(rules)?)
}

pub fn save_module_rules(rules: &HashMap<String, Vec<PathRule>>) -> Result<()> {
    save_module_rules_to(Path::new(defs::MODULE_RULES_FILE), rules)
}

/// Upsert one rule in the persisted map.
pub fn add_module_rule(id: &str, path: &str, mode: MountMode) -> Result<()> {
    if !path.starts_with('/') {
        bail!(ErrorKind::InvalidInput);
    }
    let mut rules = load_module_rules();
    let entry = rules.entry(id.to_string()).or_default();
    if let Some(existing) = entry.iter_mut().find(|r| r.path == path) {
        existing.mode = mode;
    } else {
        entry.push(PathRule {
            path: path.to_string(),
            mode,
        });
    }
    save_module_rules(&rules)
}

/// Remove one rule; Ok(false) when it was not present.
pub fn remove_module_rule(id: &str, path: &str) -> Result<bool> {
    let mut rules = load_module_rules();
    let Some(entry) = rules.get_mut(id) else {
        return Ok(false);
    };
    let before = entry.len();
    entry.retain(|r| r.path != path);
    let removed = entry.len() != before;
    if entry.is_empty() {
        rules.remove(id);
    }
    if removed {
        save_module_rules(&rules)?;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_round_trips_identically() {
        let config = Config::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let parsed: Config = serde_json::from_str(&json).unwrap();
        let rejson = serde_json::to_string_pretty(&parsed).unwrap();
        assert_eq!(json, rejson);
    }

    #[test]
    fn missing_fields_take_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.moduledir, PathBuf::from(defs::DEFAULT_MODULE_DIR));
        assert_eq!(config.mountsource, defs::DEFAULT_MOUNT_SOURCE);
        assert_eq!(config.fs_type, FsType::Auto);
        assert!(config.hymofs_enabled);
        assert_eq!(config.mount_stage, MountStage::PostFsData);
    }

    #[test]
    fn fs_type_serializes_lowercase() {
        let json = serde_json::to_string(&FsType::Erofs).unwrap();
        assert_eq!(json, "\"erofs\"");
        let parsed: FsType = serde_json::from_str("\"tmpfs\"").unwrap();
        assert_eq!(parsed, FsType::Tmpfs);
    }

    #[test]
    fn all_partitions_dedupes_and_keeps_system() {
        let mut config = Config::default();
        config.partitions = vec!["oem".into(), "mycustom".into(), "mycustom".into()];
        let parts = config.all_partitions();
        assert_eq!(parts[0], "system");
        assert_eq!(parts.iter().filter(|p| *p == "oem").count(), 1);
        assert_eq!(parts.iter().filter(|p| *p == "mycustom").count(), 1);
    }

    #[test]
    fn merge_with_cli_overrides() {
        let mut config = Config::default();
        config.merge_with_cli(
            Some(PathBuf::from("/tmp/mods")),
            None,
            Some("APatch".into()),
            true,
            vec!["my_product".into()],
        );
        assert_eq!(config.moduledir, PathBuf::from("/tmp/mods"));
        assert_eq!(config.mountsource, "APatch");
        assert!(config.verbose);
        assert_eq!(config.partitions, vec!["my_product".to_string()]);
    }

    #[test]
    fn mirror_priority_is_mirror_path_then_tempdir() {
        let mut config = Config::default();
        assert_eq!(
            config.effective_mirror_path(),
            PathBuf::from(defs::HYMO_MIRROR_DEV)
        );
        config.tempdir = Some(PathBuf::from("/mnt/tmp"));
        assert_eq!(config.effective_mirror_path(), PathBuf::from("/mnt/tmp"));
        config.mirror_path = Some("/dev/other".into());
        assert_eq!(config.effective_mirror_path(), PathBuf::from("/dev/other"));
    }

    #[test]
    fn broken_mode_map_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("module_mode.conf");
        std::fs::write(&path, "{not json").unwrap();
        assert!(load_module_modes_from(&path).is_empty());
    }

    #[test]
    fn mode_map_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("module_mode.conf");
        let mut modes = HashMap::new();
        modes.insert("demo".to_string(), MountMode::Magic);
        save_module_modes_to(&path, &modes).unwrap();
        let loaded = load_module_modes_from(&path);
        assert_eq!(loaded.get("demo"), Some(&MountMode::Magic));
    }

    #[test]
    fn rules_map_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("module_rules.conf");
        let mut rules = HashMap::new();
        rules.insert(
            "demo".to_string(),
            vec![PathRule {
                path: "/system/app/Foo".to_string(),
                mode: MountMode::Overlay,
            }],
        );
        save_module_rules_to(&path, &rules).unwrap();
        let loaded = load_module_rules_from(&path);
        assert_eq!(loaded["demo"][0].mode, MountMode::Overlay);
    }
}
