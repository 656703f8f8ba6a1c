// hymod/src/core/executor.rs
// Copyright 2026 Hymo Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::config::Config;
use crate::core::inventory::Module;
use crate::core::planner::MountPlan;
use crate::core::state::MountStats;
use crate::hymofs::{HymoClient, RuleInstallStats};
use crate::mount::{magic, overlay};
use crate::utils;

pub struct ExecutionResult {
    pub overlay_module_ids: Vec<String>,
    pub magic_module_ids: Vec<String>,
    pub hymofs_module_ids: Vec<String>,
    pub stats: MountStats,
}

/// Run the plan. Failures isolate per module or per operation; the plan
/// always runs to completion and the result reflects what actually
/// happened, not what was intended.
pub fn execute(
    plan: &MountPlan,
    config: &Config,
    client: &HymoClient,
    modules: &[Module],
    mirror_root: &Path,
    partitions: &[String],
    hymofs_active: bool,
) -> Result<ExecutionResult> {
    let mut stats = MountStats::default();
    let mut final_hymofs: Vec<String> = Vec::new();
    let mut final_overlay: HashSet<String> = HashSet::new();
    let mut final_magic: HashSet<String> = plan.magic_module_ids.iter().cloned().collect();

    // Phase 1: kernel redirection rules. Every byte of a module is already
    // in the mirror before this point; rules go in before the module is
    // recorded as active.
    if hymofs_active && !plan.hymofs_module_ids.is_empty() {
        log::info!(">> Phase 1: HymoFS rule installation...");
        for id in &plan.hymofs_module_ids {
            let module_root = mirror_root.join(id);
            let mut rule_stats = RuleInstallStats::default();
            let mut any = false;

            for part in partitions {
                let src_dir = module_root.join(part);
                if !src_dir.is_dir() {
                    continue;
                }
                let target_base = Path::new("/").join(part);
                if client.add_rules_from_directory(&target_base, &src_dir, &mut rule_stats) {
                    any = true;
                    let _ = client.hide_overlay_xattrs(&target_base);
                }
            }

            stats.files += rule_stats.added;
            stats.whiteouts += rule_stats.hidden;
            stats.failures += rule_stats.failed;

            if any && rule_stats.failed == 0 {
                final_hymofs.push(id.clone());
            } else if any {
                log::warn!(
                    "Module {id}: {} rule installs failed, keeping partial rules",
                    rule_stats.failed
                );
                final_hymofs.push(id.clone());
            } else {
                log::warn!("Module {id}: no rules installed");
            }
        }
    }

    // Phase 2: overlay operations. A failed op downgrades its modules to
    // magic mount instead of aborting the plan.
    if !plan.overlay_ops.is_empty() {
        log::info!(">> Phase 2: OverlayFS execution...");
    }
    for op in &plan.overlay_ops {
        let target = Path::new(&op.target);
        let resolved = match target.canonicalize() {
            Ok(p) if p.is_dir() => p,
            _ => {
                log::warn!("Overlay target {} unavailable, skipping", op.target);
                continue;
            }
        };

        let involved: Vec<String> = op
            .lowerdirs
            .iter()
            .filter_map(|p| module_id_of_layer(p, mirror_root))
            .collect();
        let lowerdir_strings: Vec<String> = op
            .lowerdirs
            .iter()
            .map(|p| p.display().to_string())
            .collect();

        log::info!(
            "Mounting {} [OVERLAY] ({} layers)",
            resolved.display(),
            lowerdir_strings.len()
        );

        match overlay::mount_overlay(
            &resolved.to_string_lossy(),
            &lowerdir_strings,
            op.upperdir.as_deref(),
            op.workdir.as_deref(),
            &config.mountsource,
            config.disable_umount,
        ) {
            Ok(()) => {
                stats.directories += 1;
                for id in involved {
                    if !final_hymofs.contains(&id) {
                        final_overlay.insert(id);
                    }
                }
            }
            Err(e) => {
                stats.failures += 1;
                log::warn!(
                    "OverlayFS failed for {}: {e:#}. Falling back to magic mount.",
                    op.target
                );
                let _ = rustix::mount::unmount(&resolved, rustix::mount::UnmountFlags::DETACH);
                for id in involved {
                    if !final_hymofs.contains(&id) {
                        final_magic.insert(id);
                    }
                }
            }
        }
    }

    // Per-path rules pinned to magic below partition level
    for (src, target) in &plan.magic_rule_binds {
        match overlay::bind_mount(src, Path::new(target)) {
            Ok(()) => {
                stats.files += 1;
                if !config.disable_umount {
                    let _ = crate::ksu::send_unmountable(Path::new(target));
                }
            }
            Err(e) => {
                stats.failures += 1;
                log::warn!("Rule bind {} -> {target} failed: {e:#}", src.display());
            }
        }
    }

    final_overlay.retain(|id| !final_magic.contains(id));

    // Phase 3: magic mount for everything that asked for it or fell back
    if !final_magic.is_empty() {
        let magic_paths = magic_paths_for(&final_magic, plan, modules, mirror_root);
        let tempdir = match &config.tempdir {
            Some(t) => t.clone(),
            None => utils::select_temp_dir()?,
        };
        log::info!(
            ">> Phase 3: Magic mount for {} modules via {}",
            final_magic.len(),
            tempdir.display()
        );
        utils::ensure_temp_dir(&tempdir)?;

        match magic::magic_mount(
            &tempdir,
            &magic_paths,
            &config.mountsource,
            &config.partitions,
            config.disable_umount,
        ) {
            Ok(magic_stats) => stats.merge(&magic_stats),
            Err(e) => {
                log::error!("Magic mount failed: {e:#}");
                stats.failures += 1;
                final_magic.clear();
            }
        }
        utils::cleanup_temp_dir(&tempdir);
    }

    let mut result_overlay: Vec<String> = final_overlay.into_iter().collect();
    let mut result_magic: Vec<String> = final_magic.into_iter().collect();
    result_overlay.sort();
    result_magic.sort();
    final_hymofs.sort();

    if let Err(e) = stats.snapshot() {
        log::debug!("Failed to snapshot mount stats: {e:#}");
    }

    Ok(ExecutionResult {
        overlay_module_ids: result_overlay,
        magic_module_ids: result_magic,
        hymofs_module_ids: final_hymofs,
        stats,
    })
}

/// Map one overlay layer path back to its module ID. Layers live at
/// `<mirror>/<id>/<partition>` or `<mirror>/.overlay_staging/<id>/...`;
/// anything else falls back to the path's grandparent name.
fn module_id_of_layer(layer: &Path, mirror_root: &Path) -> Option<String> {
    let rel = layer.strip_prefix(mirror_root).ok();
    if let Some(rel) = rel {
        let mut components = rel.components();
        let first = components.next()?.as_os_str().to_string_lossy().to_string();
        if first == crate::defs::OVERLAY_STAGING_DIR {
            return Some(
                components
                    .next()?
                    .as_os_str()
                    .to_string_lossy()
                    .to_string(),
            );
        }
        return Some(first);
    }
    layer
        .parent()
        .and_then(|p| p.file_name())
        .map(|s| s.to_string_lossy().to_string())
}

/// Content roots for the magic pass, in module priority order.
fn magic_paths_for(
    ids: &HashSet<String>,
    plan: &MountPlan,
    modules: &[Module],
    mirror_root: &Path,
) -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = Vec::new();
    for module in modules {
        if !ids.contains(&module.id) {
            continue;
        }
        let mirrored = mirror_root.join(&module.id);
        let path = if mirrored.exists() {
            mirrored
        } else {
            module.source_path.clone()
        };
        if !paths.contains(&path) {
            paths.push(path);
        }
    }
    // planner-provided paths cover modules not in the inventory slice
    for path in &plan.magic_module_paths {
        if !paths.contains(path) && path.exists() {
            paths.push(path.clone());
        }
    }
    paths
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_paths_resolve_to_module_ids() {
        let mirror = Path::new("/dev/hymo_mirror");
        assert_eq!(
            module_id_of_layer(&mirror.join("demo/system"), mirror).as_deref(),
            Some("demo")
        );
        assert_eq!(
            module_id_of_layer(
                &mirror.join(".overlay_staging/demo/system/app"),
                mirror
            )
            .as_deref(),
            Some("demo")
        );
        assert_eq!(
            module_id_of_layer(Path::new("/data/adb/modules/other/system"), mirror).as_deref(),
            Some("other")
        );
    }
}
