// hymod/src/core/inventory.rs
// Copyright 2026 Hymo Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Serialize;

use crate::config::{MountMode, PathRule};
use crate::{defs, utils};

/// One discovered module.
#[derive(Debug, Clone)]
pub struct Module {
    pub id: String,
    pub source_path: PathBuf,
    pub name: String,
    pub version: String,
    pub author: String,
    pub description: String,
    pub mode: MountMode,
    pub rules: Vec<PathRule>,
}

impl Module {
    /// Effective mode for an absolute path: the longest rule prefix wins,
    /// falling back to the module-level mode.
    pub fn mode_for_path(&self, path: &str) -> MountMode {
        let mut best: Option<&PathRule> = None;
        for rule in &self.rules {
            if path == rule.path || path.starts_with(&format!("{}/", rule.path.trim_end_matches('/')))
            {
                match best {
                    Some(b) if b.path.len() >= rule.path.len() => {}
                    _ => best = Some(rule),
                }
            }
        }
        best.map(|r| r.mode).unwrap_or(self.mode)
    }
}

/// JSON record for the `modules` command.
#[derive(Serialize)]
pub struct ModuleInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    pub author: String,
    pub description: String,
    pub mode: String,
}

pub fn read_prop(path: &Path, key: &str) -> Option<String> {
    let file = fs::File::open(path).ok()?;
    let reader = BufReader::new(file);
    for line in reader.lines().map_while(Result::ok) {
        let trimmed = line.trim_start();
        if trimmed.starts_with('#') {
            continue;
        }
        if trimmed.starts_with(key) && trimmed.chars().nth(key.len()) == Some('=') {
            return Some(trimmed[key.len() + 1..].to_string());
        }
    }
    None
}

fn is_marker_present(path: &Path) -> bool {
    path.join(defs::DISABLE_FILE_NAME).exists()
        || path.join(defs::REMOVE_FILE_NAME).exists()
        || path.join(defs::SKIP_MOUNT_FILE_NAME).exists()
}

/// Enumerate the module directory one level deep and build the active
/// inventory. A module is active when its directory exists, no marker file
/// is present and at least one recognized partition below it has files.
///
/// The result is ordered reverse-lexicographically by ID: later IDs shadow
/// earlier ones, so the Z-side of the alphabet wins conflicts.
pub fn scan(
    moduledir: &Path,
    partitions: &[String],
    modes: &HashMap<String, MountMode>,
    rules: &HashMap<String, Vec<PathRule>>,
) -> Result<Vec<Module>> {
    let mut modules = Vec::new();
    if !moduledir.exists() {
        return Ok(modules);
    }

    for entry in fs::read_dir(moduledir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let id = entry.file_name().to_string_lossy().to_string();
        if id == defs::MANAGER_ID || id == "lost+found" {
            continue;
        }
        if utils::validate_module_id(&id).is_err() {
            log::warn!("Skipping module with unsafe ID: {id}");
            continue;
        }
        if is_marker_present(&path) {
            continue;
        }

        let has_content = partitions
            .iter()
            .any(|p| utils::has_files_recursive(&path.join(p)));
        if !has_content {
            log::debug!("Skipping empty module: {id}");
            continue;
        }

        let prop_path = path.join("module.prop");
        let name = read_prop(&prop_path, "name").unwrap_or_else(|| id.clone());
        let version = read_prop(&prop_path, "version").unwrap_or_default();
        let author = read_prop(&prop_path, "author").unwrap_or_default();
        let description = read_prop(&prop_path, "description").unwrap_or_default();
        let mode = modes.get(&id).copied().unwrap_or_default();
        let module_rules = rules.get(&id).cloned().unwrap_or_default();

        modules.push(Module {
            id,
            source_path: path,
            name,
            version,
            author,
            description,
            mode,
            rules: module_rules,
        });
    }

    modules.sort_by(|a, b| b.id.cmp(&a.id));
    Ok(modules)
}

/// Partition auto-discovery for `sync-partitions`: a module's top-level
/// directory name is a candidate when `/<name>` exists at root or
/// `/system/<name>` is a symlink pointing into `/<name>`.
pub fn scan_partition_candidates(moduledir: &Path) -> Vec<String> {
    let mut candidates = Vec::new();
    let Ok(entries) = fs::read_dir(moduledir) else {
        return candidates;
    };

    for entry in entries.flatten() {
        let module_path = entry.path();
        if !module_path.is_dir() || is_marker_present(&module_path) {
            continue;
        }
        let Ok(subdirs) = fs::read_dir(&module_path) else {
            continue;
        };
        for sub in subdirs.flatten() {
            if !sub.path().is_dir() {
                continue;
            }
            let name = sub.file_name().to_string_lossy().to_string();
            if candidates.contains(&name) {
                continue;
            }
            if is_partition_candidate(&name) {
                candidates.push(name);
            }
        }
    }

    candidates.sort();
    candidates
}

fn is_partition_candidate(name: &str) -> bool {
    let root_path = Path::new("/").join(name);
    if root_path.is_dir() {
        return true;
    }
    let system_path = Path::new("/system").join(name);
    if system_path.is_symlink()
        && let Ok(target) = fs::read_link(&system_path)
    {
        return target == root_path || target.to_string_lossy() == format!("/{name}");
    }
    false
}

/// Build the JSON inventory for the `modules` command.
pub fn list_info(
    moduledir: &Path,
    mirror_base: &Path,
    partitions: &[String],
    modes: &HashMap<String, MountMode>,
) -> Result<Vec<ModuleInfo>> {
    let mut infos = Vec::new();
    if !moduledir.exists() {
        return Ok(infos);
    }

    for entry in fs::read_dir(moduledir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let id = entry.file_name().to_string_lossy().to_string();
        if id == defs::MANAGER_ID || id == "lost+found" || is_marker_present(&path) {
            continue;
        }

        let has_content = partitions
            .iter()
            .any(|p| path.join(p).exists() || mirror_base.join(&id).join(p).exists());
        if !has_content {
            continue;
        }

        let prop_path = path.join("module.prop");
        infos.push(ModuleInfo {
            name: read_prop(&prop_path, "name").unwrap_or_else(|| id.clone()),
            version: read_prop(&prop_path, "version").unwrap_or_default(),
            author: read_prop(&prop_path, "author").unwrap_or_default(),
            description: read_prop(&prop_path, "description").unwrap_or_default(),
            mode: modes.get(&id).copied().unwrap_or_default().as_str().to_string(),
            id,
        });
    }
    infos.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(infos)
}

/// Rewrite the manager's own module.prop description with the run outcome.
pub fn update_description(
    ok: bool,
    storage_mode: &str,
    nuke_active: bool,
    overlay_count: usize,
    magic_count: usize,
    hymofs_count: usize,
    warning: &str,
) {
    update_description_at(
        Path::new(defs::MODULE_PROP_FILE),
        ok,
        storage_mode,
        nuke_active,
        overlay_count,
        magic_count,
        hymofs_count,
        warning,
    )
}

#[allow(clippy::too_many_arguments)]
fn update_description_at(
    path: &Path,
    ok: bool,
    storage_mode: &str,
    nuke_active: bool,
    overlay_count: usize,
    magic_count: usize,
    hymofs_count: usize,
    warning: &str,
) {
    if !path.exists() {
        log::warn!(
            "module.prop not found at {}, skipping description update",
            path.display()
        );
        return;
    }

    let new_desc = if ok {
        let emoji = match storage_mode {
            "tmpfs" => "🐾",
            "erofs" => "📦",
            "magic_only" => "🪄",
            _ => "💿",
        };
        let nuke_str = if nuke_active { " | Nuke ✨" } else { "" };
        let warn_str = if warning.is_empty() {
            String::new()
        } else {
            format!(" | {warning}")
        };
        format!(
            "description=😋 Running ({storage_mode}) {emoji} | HymoFS: {hymofs_count} | Overlay: {overlay_count} | Magic: {magic_count}{nuke_str}{warn_str}"
        )
    } else {
        "description=😭 Mount failed, check daemon.log".to_string()
    };

    match fs::read_to_string(path) {
        Ok(content) => {
            let new_lines: Vec<String> = content
                .lines()
                .map(|line| {
                    if line.starts_with("description=") {
                        new_desc.clone()
                    } else {
                        line.to_string()
                    }
                })
                .collect();
            if let Err(e) = fs::write(path, new_lines.join("\n")) {
                log::error!("Failed to update module.prop: {e}");
            }
        }
        Err(e) => log::error!("Failed to read module.prop: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_module(dir: &Path, id: &str, partition_file: &str, prop: &str) {
        let module = dir.join(id);
        let file = module.join(partition_file);
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(&file, b"payload").unwrap();
        fs::write(module.join("module.prop"), prop).unwrap();
    }

    fn parts() -> Vec<String> {
        defs::BUILTIN_PARTITIONS.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn prop_parser_skips_comments_and_matches_exact_keys() {
        let dir = tempfile::tempdir().unwrap();
        let prop = dir.path().join("module.prop");
        fs::write(
            &prop,
            "# comment\nname=Demo Module\nnamex=wrong\nversion=v1.0\nauthor=someone\n",
        )
        .unwrap();
        assert_eq!(read_prop(&prop, "name").as_deref(), Some("Demo Module"));
        assert_eq!(read_prop(&prop, "version").as_deref(), Some("v1.0"));
        assert_eq!(read_prop(&prop, "description"), None);
    }

    #[test]
    fn scan_filters_markers_and_empty_modules() {
        let dir = tempfile::tempdir().unwrap();
        fake_module(dir.path(), "active", "system/etc/hosts", "name=Active\n");
        fake_module(dir.path(), "disabled", "system/etc/hosts", "name=Off\n");
        fs::write(dir.path().join("disabled/disable"), b"").unwrap();
        // only empty partition dirs
        fs::create_dir_all(dir.path().join("hollow/system/app")).unwrap();
        fs::write(dir.path().join("hollow/module.prop"), "name=Hollow\n").unwrap();

        let modules = scan(dir.path(), &parts(), &HashMap::new(), &HashMap::new()).unwrap();
        let ids: Vec<&str> = modules.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["active"]);
        assert_eq!(modules[0].name, "Active");
        assert_eq!(modules[0].mode, MountMode::Auto);
    }

    #[test]
    fn scan_skips_unsafe_ids() {
        let dir = tempfile::tempdir().unwrap();
        fake_module(dir.path(), "bad id", "system/x", "name=Bad\n");
        fake_module(dir.path(), "good", "system/x", "name=Good\n");
        let modules = scan(dir.path(), &parts(), &HashMap::new(), &HashMap::new()).unwrap();
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].id, "good");
    }

    #[test]
    fn scan_orders_reverse_lexicographically() {
        let dir = tempfile::tempdir().unwrap();
        fake_module(dir.path(), "alpha", "system/f", "name=a\n");
        fake_module(dir.path(), "bravo", "system/f", "name=b\n");
        fake_module(dir.path(), "zulu", "system/f", "name=z\n");
        let modules = scan(dir.path(), &parts(), &HashMap::new(), &HashMap::new()).unwrap();
        let ids: Vec<&str> = modules.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["zulu", "bravo", "alpha"]);
    }

    #[test]
    fn vendor_only_module_needs_vendor_in_partition_set() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("m/system")).unwrap();
        fake_module(dir.path(), "m", "vendor/lib/x.so", "name=m\n");

        let only_system = vec!["system".to_string()];
        let modules = scan(dir.path(), &only_system, &HashMap::new(), &HashMap::new()).unwrap();
        assert!(modules.is_empty());

        let with_vendor = vec!["system".to_string(), "vendor".to_string()];
        let modules = scan(dir.path(), &with_vendor, &HashMap::new(), &HashMap::new()).unwrap();
        assert_eq!(modules.len(), 1);
    }

    #[test]
    fn mode_map_and_rules_are_applied() {
        let dir = tempfile::tempdir().unwrap();
        fake_module(dir.path(), "m", "system/f", "name=m\n");
        let mut modes = HashMap::new();
        modes.insert("m".to_string(), MountMode::Magic);
        let mut rules = HashMap::new();
        rules.insert(
            "m".to_string(),
            vec![PathRule {
                path: "/system/app".to_string(),
                mode: MountMode::Overlay,
            }],
        );
        let modules = scan(dir.path(), &parts(), &modes, &rules).unwrap();
        let m = &modules[0];
        assert_eq!(m.mode, MountMode::Magic);
        assert_eq!(m.mode_for_path("/system/app/Foo/Foo.apk"), MountMode::Overlay);
        assert_eq!(m.mode_for_path("/system/lib/x.so"), MountMode::Magic);
    }

    #[test]
    fn longest_rule_prefix_wins() {
        let module = Module {
            id: "m".into(),
            source_path: PathBuf::new(),
            name: String::new(),
            version: String::new(),
            author: String::new(),
            description: String::new(),
            mode: MountMode::Auto,
            rules: vec![
                PathRule {
                    path: "/system".into(),
                    mode: MountMode::Overlay,
                },
                PathRule {
                    path: "/system/app".into(),
                    mode: MountMode::Magic,
                },
            ],
        };
        assert_eq!(module.mode_for_path("/system/app/X"), MountMode::Magic);
        assert_eq!(module.mode_for_path("/system/lib"), MountMode::Overlay);
        assert_eq!(module.mode_for_path("/vendor/lib"), MountMode::Auto);
        // prefix must respect component boundaries
        assert_eq!(module.mode_for_path("/system/application"), MountMode::Overlay);
    }
}
