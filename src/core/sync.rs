// hymod/src/core/sync.rs
// Copyright 2026 Hymo Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use rayon::prelude::*;
use walkdir::WalkDir;

use crate::core::inventory::Module;
use crate::{defs, utils};

#[derive(Debug, Default)]
pub struct SyncSummary {
    pub synced: u64,
    pub skipped: u64,
    pub failed: u64,
}

/// Replicate every active module into the mirror. One bad module never
/// aborts the pass; it is logged, counted and skipped.
pub fn perform_sync(
    modules: &[Module],
    target_base: &Path,
    partitions: &[String],
    force: bool,
) -> Result<SyncSummary> {
    log::info!("Syncing {} modules to {}", modules.len(), target_base.display());

    prune_orphaned_modules(modules, target_base)?;

    let synced = AtomicU64::new(0);
    let skipped = AtomicU64::new(0);
    let failed = AtomicU64::new(0);

    modules.par_iter().for_each(|module| {
        let dst = target_base.join(&module.id);

        if !force && !should_sync(&module.source_path, &dst) {
            log::debug!("Up-to-date: {}", module.id);
            skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match sync_one(module, target_base, partitions) {
            Ok(()) => {
                synced.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                log::error!("Failed to sync module {}: {e:#}", module.id);
                failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    });

    let summary = SyncSummary {
        synced: synced.into_inner(),
        skipped: skipped.into_inner(),
        failed: failed.into_inner(),
    };
    log::info!(
        "Sync done: {} copied, {} up-to-date, {} failed",
        summary.synced,
        summary.skipped,
        summary.failed
    );
    Ok(summary)
}

fn sync_one(module: &Module, target_base: &Path, partitions: &[String]) -> Result<()> {
    let dst = target_base.join(&module.id);
    let tmp_dst = target_base.join(format!(".tmp_{}", module.id));

    if tmp_dst.exists() {
        let _ = fs::remove_dir_all(&tmp_dst);
    }

    log::info!("Syncing module: {}", module.id);
    let mut counters = utils::SyncCounters::default();
    if let Err(e) = utils::sync_dir(&module.source_path, &tmp_dst, &mut counters) {
        let _ = fs::remove_dir_all(&tmp_dst);
        return Err(e);
    }
    if counters.failed > 0 {
        log::warn!(
            "Module {}: {} entries failed to replicate ({} copied)",
            module.id,
            counters.failed,
            counters.copied
        );
    }

    if let Err(e) = apply_replace_markers(&tmp_dst) {
        log::warn!("Failed to apply replace markers for {}: {e:#}", module.id);
    }

    repair_module_contexts(&tmp_dst, partitions);

    if dst.exists() {
        let _ = fs::remove_dir_all(&dst);
    }
    if let Err(e) = fs::rename(&tmp_dst, &dst) {
        let _ = fs::remove_dir_all(&tmp_dst);
        return Err(e.into());
    }
    Ok(())
}

/// `.replace` sentinel files become the opaque xattr on their directory so
/// both overlay and HymoFS treat the directory as a full replacement.
fn apply_replace_markers(root: &Path) -> Result<()> {
    for entry in WalkDir::new(root).min_depth(1).into_iter().flatten() {
        if entry.file_type().is_file() && entry.file_name() == defs::REPLACE_DIR_FILE_NAME {
            if let Some(parent) = entry.path().parent() {
                utils::set_overlay_opaque(parent)?;
                log::debug!("Marked opaque: {}", parent.display());
            }
        }
    }
    Ok(())
}

/// Copy SELinux labels from the live root onto the replica. The live path
/// `/<relative>` is the only oracle; upperdir/workdir helpers inherit
/// their parent. Paths without a live counterpart keep whatever the copy
/// produced.
fn repair_module_contexts(module_root: &Path, partitions: &[String]) {
    for partition in partitions {
        let part_root = module_root.join(partition);
        if !part_root.is_dir() {
            continue;
        }
        for entry in WalkDir::new(&part_root).into_iter().flatten() {
            let current = entry.path();
            let Ok(relative) = current.strip_prefix(module_root) else {
                continue;
            };

            if let Some(name) = current.file_name().and_then(|n| n.to_str())
                && (name == "upperdir" || name == "workdir")
            {
                if let Some(parent) = current.parent()
                    && let Ok(ctx) = utils::lgetfilecon(parent)
                {
                    let _ = utils::lsetfilecon(current, &ctx);
                }
                continue;
            }

            let system_path = Path::new("/").join(relative);
            if system_path.exists() {
                let _ = utils::copy_path_context(&system_path, current);
            }
        }
    }
}

/// Drop mirror entries whose module is no longer active. Reserved entries
/// (`lost+found`, the manager itself, the staging area) survive.
fn prune_orphaned_modules(modules: &[Module], target_base: &Path) -> Result<()> {
    if !target_base.exists() {
        return Ok(());
    }

    let active_ids: HashSet<&str> = modules.iter().map(|m| m.id.as_str()).collect();
    let entries: Vec<_> = fs::read_dir(target_base)?.filter_map(|e| e.ok()).collect();

    entries.par_iter().for_each(|entry| {
        let path = entry.path();
        let name_os = entry.file_name();
        let name = name_os.to_string_lossy();

        if name == "lost+found"
            || name == defs::MANAGER_ID
            || name == defs::OVERLAY_STAGING_DIR
            || name.starts_with(".tmp_")
        {
            return;
        }
        if !active_ids.contains(name.as_ref()) {
            log::info!("Pruning orphaned module storage: {name}");
            if path.is_dir() {
                let _ = fs::remove_dir_all(&path);
            } else {
                let _ = fs::remove_file(&path);
            }
        }
    });

    Ok(())
}

/// A module is re-replicated when the destination is missing or the two
/// module.prop files differ byte-for-byte.
fn should_sync(src: &Path, dst: &Path) -> bool {
    if !dst.exists() {
        return true;
    }
    let src_prop = src.join("module.prop");
    let dst_prop = dst.join("module.prop");
    if !src_prop.exists() || !dst_prop.exists() {
        return true;
    }
    match (fs::read(&src_prop), fs::read(&dst_prop)) {
        (Ok(s), Ok(d)) => s != d,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MountMode;
    use std::path::PathBuf;

    fn module(dir: &Path, id: &str) -> Module {
        Module {
            id: id.to_string(),
            source_path: dir.join(id),
            name: id.to_string(),
            version: "v1".into(),
            author: String::new(),
            description: String::new(),
            mode: MountMode::Auto,
            rules: Vec::new(),
        }
    }

    fn parts() -> Vec<String> {
        vec!["system".to_string()]
    }

    #[test]
    fn fresh_module_is_replicated() {
        let dir = tempfile::tempdir().unwrap();
        let src_root = dir.path().join("modules");
        let mirror = dir.path().join("mirror");
        fs::create_dir_all(src_root.join("demo/system/etc")).unwrap();
        fs::write(src_root.join("demo/system/etc/hosts"), b"127.0.0.1").unwrap();
        fs::write(src_root.join("demo/module.prop"), "name=demo\nversion=1\n").unwrap();

        let modules = vec![module(&src_root, "demo")];
        let summary = perform_sync(&modules, &mirror, &parts(), false).unwrap();
        assert_eq!(summary.synced, 1);
        assert_eq!(
            fs::read(mirror.join("demo/system/etc/hosts")).unwrap(),
            b"127.0.0.1"
        );
    }

    #[test]
    fn identical_prop_skips_resync() {
        let dir = tempfile::tempdir().unwrap();
        let src_root = dir.path().join("modules");
        let mirror = dir.path().join("mirror");
        fs::create_dir_all(src_root.join("demo/system")).unwrap();
        fs::write(src_root.join("demo/system/f"), b"1").unwrap();
        fs::write(src_root.join("demo/module.prop"), "version=1\n").unwrap();

        let modules = vec![module(&src_root, "demo")];
        perform_sync(&modules, &mirror, &parts(), false).unwrap();
        let summary = perform_sync(&modules, &mirror, &parts(), false).unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.synced, 0);

        // bump version -> resync
        fs::write(src_root.join("demo/module.prop"), "version=2\n").unwrap();
        let summary = perform_sync(&modules, &mirror, &parts(), false).unwrap();
        assert_eq!(summary.synced, 1);
    }

    #[test]
    fn orphans_are_pruned_but_reserved_dirs_survive() {
        let dir = tempfile::tempdir().unwrap();
        let src_root = dir.path().join("modules");
        let mirror = dir.path().join("mirror");
        fs::create_dir_all(src_root.join("keep/system")).unwrap();
        fs::write(src_root.join("keep/system/f"), b"1").unwrap();
        fs::write(src_root.join("keep/module.prop"), "v=1\n").unwrap();

        fs::create_dir_all(mirror.join("stale")).unwrap();
        fs::create_dir_all(mirror.join("lost+found")).unwrap();
        fs::create_dir_all(mirror.join(defs::OVERLAY_STAGING_DIR)).unwrap();

        let modules = vec![module(&src_root, "keep")];
        perform_sync(&modules, &mirror, &parts(), false).unwrap();

        assert!(!mirror.join("stale").exists());
        assert!(mirror.join("lost+found").exists());
        assert!(mirror.join(defs::OVERLAY_STAGING_DIR).exists());
        assert!(mirror.join("keep").exists());
    }

    #[test]
    fn force_resyncs_up_to_date_module() {
        let dir = tempfile::tempdir().unwrap();
        let src_root = dir.path().join("modules");
        let mirror = dir.path().join("mirror");
        fs::create_dir_all(src_root.join("demo/system")).unwrap();
        fs::write(src_root.join("demo/system/f"), b"1").unwrap();
        fs::write(src_root.join("demo/module.prop"), "v=1\n").unwrap();

        let modules = vec![module(&src_root, "demo")];
        perform_sync(&modules, &mirror, &parts(), false).unwrap();
        let summary = perform_sync(&modules, &mirror, &parts(), true).unwrap();
        assert_eq!(summary.synced, 1);
    }
}
