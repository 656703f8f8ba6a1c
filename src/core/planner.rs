// hymod/src/core/planner.rs
// Copyright 2026 Hymo Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::Serialize;
use walkdir::WalkDir;

use crate::config::MountMode;
use crate::core::inventory::Module;
use crate::{defs, utils};

/// One overlay mount: layer the lowerdirs over the pristine partition.
/// `target` stays symbolic ("/system"); the executor resolves it.
#[derive(Debug, Clone)]
pub struct OverlayOp {
    pub partition_name: String,
    pub target: String,
    /// Ordered highest priority first.
    pub lowerdirs: Vec<PathBuf>,
    pub upperdir: Option<PathBuf>,
    pub workdir: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct MountPlan {
    pub overlay_ops: Vec<OverlayOp>,
    pub hymofs_module_ids: Vec<String>,
    pub magic_module_paths: Vec<PathBuf>,
    pub magic_module_ids: Vec<String>,
    pub overlay_module_ids: Vec<String>,
    /// Per-path rules pinned to magic below partition level: recursive
    /// binds of (source, target).
    pub magic_rule_binds: Vec<(PathBuf, String)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConflictEntry {
    pub partition: String,
    pub relative_path: String,
    pub contending_modules: Vec<String>,
}

impl MountPlan {
    pub fn is_empty(&self) -> bool {
        self.overlay_ops.is_empty()
            && self.hymofs_module_ids.is_empty()
            && self.magic_module_paths.is_empty()
            && self.magic_rule_binds.is_empty()
    }

    /// Relative paths claimed by more than one overlay layer.
    pub fn analyze_conflicts(&self) -> Vec<ConflictEntry> {
        let mut conflicts = Vec::new();

        for op in &self.overlay_ops {
            let mut file_map: HashMap<String, Vec<String>> = HashMap::new();

            for layer_path in &op.lowerdirs {
                let module_id = layer_path
                    .parent()
                    .and_then(|p| p.file_name())
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_else(|| "UNKNOWN".into());

                for entry in WalkDir::new(layer_path).min_depth(1).into_iter().flatten() {
                    if !entry.file_type().is_file() {
                        continue;
                    }
                    if let Ok(rel) = entry.path().strip_prefix(layer_path) {
                        file_map
                            .entry(rel.to_string_lossy().to_string())
                            .or_default()
                            .push(module_id.clone());
                    }
                }
            }

            for (rel_path, modules) in file_map {
                if modules.len() > 1 {
                    conflicts.push(ConflictEntry {
                        partition: op.partition_name.clone(),
                        relative_path: rel_path,
                        contending_modules: modules,
                    });
                }
            }
        }

        conflicts.sort_by(|a, b| {
            a.partition
                .cmp(&b.partition)
                .then_with(|| a.relative_path.cmp(&b.relative_path))
        });
        conflicts
    }

    pub fn print_visuals(&self) {
        if self.is_empty() {
            log::info!(">> Empty plan. Standby mode.");
            return;
        }

        if !self.hymofs_module_ids.is_empty() {
            log::info!("[HymoFS Injection]");
            for id in &self.hymofs_module_ids {
                log::info!("├── [Inject] {id}");
            }
        }

        if !self.overlay_ops.is_empty() {
            log::info!("[OverlayFS Layers]");
            for op in &self.overlay_ops {
                log::info!("├── [Target: {}] {}", op.partition_name, op.target);
                for layer in &op.lowerdirs {
                    let mod_name = layer
                        .parent()
                        .and_then(|p| p.file_name())
                        .map(|n| n.to_string_lossy())
                        .unwrap_or_else(|| "UNKNOWN".into());
                    log::info!("│   ├── [Layer] {mod_name}");
                }
            }
        }

        if !self.magic_module_paths.is_empty() {
            log::info!("[Magic Mount]");
            for path in &self.magic_module_paths {
                let mod_name = path
                    .file_name()
                    .map(|n| n.to_string_lossy())
                    .unwrap_or_else(|| "UNKNOWN".into());
                log::info!("├── [Bind] {mod_name}");
            }
        }
    }
}

fn resolve_auto(mode: MountMode, hymofs_usable: bool) -> MountMode {
    match mode {
        MountMode::Auto => {
            if hymofs_usable {
                MountMode::Hymofs
            } else {
                MountMode::Overlay
            }
        }
        other => other,
    }
}

fn has_files(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// Build the plan. `modules` arrives reverse-lexicographically sorted from
/// the inventory, so pushing in iteration order yields lowerdir lists with
/// the highest-priority module first.
pub fn generate(
    partitions: &[String],
    modules: &[Module],
    mirror_root: &Path,
    hymofs_usable: bool,
) -> Result<MountPlan> {
    let mut plan = MountPlan::default();

    let mut overlay_groups: Vec<(String, Vec<PathBuf>)> = Vec::new();
    let mut rule_ops: Vec<OverlayOp> = Vec::new();
    let mut overlay_ids: Vec<String> = Vec::new();
    let mut hymofs_ids: Vec<String> = Vec::new();
    let mut magic_ids: Vec<String> = Vec::new();
    let mut magic_paths: Vec<PathBuf> = Vec::new();

    for module in modules {
        let module_mode = resolve_auto(module.mode, hymofs_usable);
        if module_mode == MountMode::None {
            log::debug!("Module {} disabled by mode=none", module.id);
            continue;
        }

        let mut content_path = mirror_root.join(&module.id);
        if !content_path.exists() {
            content_path = module.source_path.clone();
        }
        if !content_path.exists() {
            log::debug!("Planner: {} content missing (sync failed?), skipping", module.id);
            continue;
        }

        let mut placements: HashSet<MountMode> = HashSet::new();

        for part in partitions {
            let part_path = content_path.join(part);
            if !part_path.is_dir() || !has_files(&part_path) {
                continue;
            }

            let mode = resolve_auto(module.mode_for_path(&format!("/{part}")), hymofs_usable);
            match mode {
                MountMode::Overlay => {
                    match overlay_groups.iter_mut().find(|(p, _)| p == part) {
                        Some((_, layers)) => layers.push(part_path),
                        None => overlay_groups.push((part.clone(), vec![part_path])),
                    }
                    placements.insert(MountMode::Overlay);
                }
                MountMode::Hymofs => {
                    placements.insert(MountMode::Hymofs);
                }
                MountMode::Magic => {
                    if !magic_paths.contains(&content_path) {
                        magic_paths.push(content_path.clone());
                    }
                    placements.insert(MountMode::Magic);
                }
                MountMode::None | MountMode::Auto => {}
            }
        }

        // Per-path rules below partition level carve subtrees onto another
        // strategy; the fast path later segregates their sources out of the
        // HymoFS tree.
        for rule in &module.rules {
            let rule_mode = resolve_auto(rule.mode, hymofs_usable);
            if rule.mode == MountMode::Auto || rule_mode == module_mode {
                continue;
            }
            let rel = rule.path.trim_start_matches('/');
            let mut components = Path::new(rel).components();
            let Some(first) = components.next() else { continue };
            let partition = first.as_os_str().to_string_lossy().to_string();
            if !partitions.contains(&partition) || components.next().is_none() {
                continue;
            }
            let src = content_path.join(rel);
            if !src.exists() {
                continue;
            }

            match rule_mode {
                MountMode::Overlay => {
                    rule_ops.push(OverlayOp {
                        partition_name: partition,
                        target: rule.path.clone(),
                        lowerdirs: vec![src],
                        upperdir: None,
                        workdir: None,
                    });
                    placements.insert(MountMode::Overlay);
                }
                MountMode::Magic => {
                    plan.magic_rule_binds.push((src, rule.path.clone()));
                    placements.insert(MountMode::Magic);
                }
                MountMode::Hymofs | MountMode::None | MountMode::Auto => {}
            }
        }

        // The module ID lives in exactly one strategy set: the resolved
        // module-level mode when it produced content, else whatever did.
        let recorded = if placements.contains(&module_mode) {
            Some(module_mode)
        } else {
            [MountMode::Hymofs, MountMode::Overlay, MountMode::Magic]
                .into_iter()
                .find(|m| placements.contains(m))
        };
        match recorded {
            Some(MountMode::Hymofs) => hymofs_ids.push(module.id.clone()),
            Some(MountMode::Overlay) => overlay_ids.push(module.id.clone()),
            Some(MountMode::Magic) => magic_ids.push(module.id.clone()),
            _ => {}
        }
    }

    for (part, layers) in overlay_groups {
        plan.overlay_ops.push(OverlayOp {
            target: format!("/{part}"),
            partition_name: part,
            lowerdirs: layers,
            upperdir: None,
            workdir: None,
        });
    }
    // rule-level ops mount after their parent partition overlay
    plan.overlay_ops.append(&mut rule_ops);

    plan.overlay_module_ids = overlay_ids;
    plan.hymofs_module_ids = hymofs_ids;
    plan.magic_module_ids = magic_ids;
    plan.magic_module_paths = magic_paths;

    plan.overlay_module_ids.sort();
    plan.hymofs_module_ids.sort();
    plan.magic_module_ids.sort();

    Ok(plan)
}

/// Move every overlay/magic source that lives inside the mirror into the
/// `.overlay_staging` sibling so it cannot collide with the HymoFS source
/// tree. Fast path only; plan paths are rewritten in place.
pub fn segregate_custom_rules(plan: &mut MountPlan, mirror_dir: &Path) {
    let staging_dir = mirror_dir.join(defs::OVERLAY_STAGING_DIR);

    let mut relocate = |path: &mut PathBuf| {
        let Ok(rel) = path.strip_prefix(mirror_dir) else {
            return;
        };
        if rel.starts_with(defs::OVERLAY_STAGING_DIR) {
            return;
        }
        let target = staging_dir.join(rel);
        if !path.exists() {
            return;
        }
        if let Some(parent) = target.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            log::warn!("Failed to prepare staging dir: {e}");
            return;
        }
        if target.exists() {
            let _ = fs::remove_dir_all(&target);
        }
        match fs::rename(&*path, &target) {
            Ok(()) => {
                log::debug!("Segregated {} -> {}", path.display(), target.display());
                *path = target;
            }
            Err(e) => log::warn!("Failed to segregate {}: {e}", path.display()),
        }
    };

    for op in &mut plan.overlay_ops {
        for layer in &mut op.lowerdirs {
            relocate(layer);
        }
    }
    for path in &mut plan.magic_module_paths {
        relocate(path);
    }
    for (src, _) in &mut plan.magic_rule_binds {
        relocate(src);
    }
}

/// Active partitions for the state record: every partition any planned
/// module actually touches.
pub fn active_partitions(plan: &MountPlan, modules: &[Module], partitions: &[String]) -> Vec<String> {
    let planned_ids: HashSet<&str> = plan
        .hymofs_module_ids
        .iter()
        .chain(&plan.overlay_module_ids)
        .chain(&plan.magic_module_ids)
        .map(|s| s.as_str())
        .collect();

    let mut active = Vec::new();
    for part in partitions {
        let touched = modules.iter().any(|m| {
            planned_ids.contains(m.id.as_str())
                && utils::has_files_recursive(&m.source_path.join(part))
        }) || plan.overlay_ops.iter().any(|op| &op.partition_name == part);
        if touched && !active.contains(part) {
            active.push(part.clone());
        }
    }
    active
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathRule;
    use std::fs;

    fn module(mirror: &Path, id: &str, mode: MountMode) -> Module {
        Module {
            id: id.to_string(),
            source_path: mirror.join(id),
            name: id.to_string(),
            version: String::new(),
            author: String::new(),
            description: String::new(),
            mode,
            rules: Vec::new(),
        }
    }

    fn stage_content(mirror: &Path, id: &str, rel: &str) {
        let file = mirror.join(id).join(rel);
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(&file, b"x").unwrap();
    }

    fn parts() -> Vec<String> {
        defs::BUILTIN_PARTITIONS.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn auto_resolves_by_hymofs_availability() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = dir.path();
        stage_content(mirror, "demo", "system/etc/hosts");
        let modules = vec![module(mirror, "demo", MountMode::Auto)];

        let plan = generate(&parts(), &modules, mirror, true).unwrap();
        assert_eq!(plan.hymofs_module_ids, vec!["demo"]);
        assert!(plan.overlay_ops.is_empty());

        let plan = generate(&parts(), &modules, mirror, false).unwrap();
        assert_eq!(plan.overlay_module_ids, vec!["demo"]);
        assert_eq!(plan.overlay_ops.len(), 1);
        assert_eq!(plan.overlay_ops[0].target, "/system");
    }

    #[test]
    fn ids_land_in_exactly_one_set() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = dir.path();
        stage_content(mirror, "a", "system/f");
        stage_content(mirror, "b", "vendor/f");
        stage_content(mirror, "c", "system/f");
        let mut mods = vec![
            module(mirror, "a", MountMode::Hymofs),
            module(mirror, "b", MountMode::Overlay),
            module(mirror, "c", MountMode::Magic),
        ];
        mods.sort_by(|x, y| y.id.cmp(&x.id));

        let plan = generate(&parts(), &mods, mirror, true).unwrap();
        assert_eq!(plan.hymofs_module_ids, vec!["a"]);
        assert_eq!(plan.overlay_module_ids, vec!["b"]);
        assert_eq!(plan.magic_module_ids, vec!["c"]);

        let all: Vec<&String> = plan
            .hymofs_module_ids
            .iter()
            .chain(&plan.overlay_module_ids)
            .chain(&plan.magic_module_ids)
            .collect();
        let unique: HashSet<&&String> = all.iter().collect();
        assert_eq!(all.len(), unique.len());
    }

    #[test]
    fn lowerdirs_order_higher_priority_first() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = dir.path();
        stage_content(mirror, "alpha", "system/etc/hosts");
        stage_content(mirror, "bravo", "system/etc/hosts");
        // inventory order is reverse-lex: bravo before alpha
        let mods = vec![
            module(mirror, "bravo", MountMode::Overlay),
            module(mirror, "alpha", MountMode::Overlay),
        ];

        let plan = generate(&parts(), &mods, mirror, false).unwrap();
        let op = &plan.overlay_ops[0];
        assert_eq!(op.lowerdirs.len(), 2);
        assert!(op.lowerdirs[0].starts_with(mirror.join("bravo")));
        assert!(op.lowerdirs[1].starts_with(mirror.join("alpha")));
    }

    #[test]
    fn mode_none_is_excluded() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = dir.path();
        stage_content(mirror, "off", "system/f");
        let mods = vec![module(mirror, "off", MountMode::None)];
        let plan = generate(&parts(), &mods, mirror, true).unwrap();
        assert!(plan.is_empty());
        assert!(plan.hymofs_module_ids.is_empty());
    }

    #[test]
    fn deep_rule_emits_extra_overlay_op() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = dir.path();
        stage_content(mirror, "m", "system/app/Foo/Foo.apk");
        stage_content(mirror, "m", "system/etc/hosts");
        let mut m = module(mirror, "m", MountMode::Hymofs);
        m.rules.push(PathRule {
            path: "/system/app/Foo".to_string(),
            mode: MountMode::Overlay,
        });

        let plan = generate(&parts(), &[m], mirror, true).unwrap();
        assert_eq!(plan.hymofs_module_ids, vec!["m"]);
        assert_eq!(plan.overlay_ops.len(), 1);
        assert_eq!(plan.overlay_ops[0].target, "/system/app/Foo");
        assert_eq!(plan.overlay_ops[0].lowerdirs[0], mirror.join("m/system/app/Foo"));
    }

    #[test]
    fn segregation_moves_mirror_sources_to_staging() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = dir.path();
        stage_content(mirror, "m", "system/app/Foo/Foo.apk");
        let mut plan = MountPlan::default();
        plan.overlay_ops.push(OverlayOp {
            partition_name: "system".into(),
            target: "/system/app/Foo".into(),
            lowerdirs: vec![mirror.join("m/system/app/Foo")],
            upperdir: None,
            workdir: None,
        });

        segregate_custom_rules(&mut plan, mirror);

        let staged = mirror
            .join(defs::OVERLAY_STAGING_DIR)
            .join("m/system/app/Foo");
        assert_eq!(plan.overlay_ops[0].lowerdirs[0], staged);
        assert!(staged.join("Foo.apk").exists());
        assert!(!mirror.join("m/system/app/Foo").exists());
    }

    #[test]
    fn conflicts_reported_per_relative_path() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = dir.path();
        stage_content(mirror, "a", "system/etc/hosts");
        stage_content(mirror, "b", "system/etc/hosts");
        stage_content(mirror, "b", "system/etc/other");
        let mods = vec![
            module(mirror, "b", MountMode::Overlay),
            module(mirror, "a", MountMode::Overlay),
        ];
        let plan = generate(&parts(), &mods, mirror, false).unwrap();
        let conflicts = plan.analyze_conflicts();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].relative_path, "etc/hosts");
        assert_eq!(conflicts[0].contending_modules.len(), 2);
    }
}
