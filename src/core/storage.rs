// hymod/src/core/storage.rs
// Copyright 2026 Hymo Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result, bail, ensure};
use jwalk::WalkDir;
use rustix::fs::Mode;
use rustix::mount::{UnmountFlags, unmount};
use serde_json::json;

use crate::config::FsType;
use crate::core::state::RuntimeState;
use crate::error::ErrorKind;
use crate::{defs, ksu, utils};

const DEFAULT_SELINUX_CONTEXT: &str = utils::CONTEXT_SYSTEM;
const MIN_IMAGE_SIZE: u64 = 64 * 1024 * 1024;

pub struct StorageHandle {
    pub mount_point: PathBuf,
    pub mode: String,
    pub backing_image: Option<PathBuf>,
}

fn try_hide(path: &Path, disable_umount: bool) {
    if disable_umount {
        return;
    }
    if let Err(e) = ksu::send_unmountable(path) {
        log::debug!("unmountable registration for {} failed: {e:#}", path.display());
    }
}

/// Provision the mirror backing store. Fallback ladder for `auto` is
/// tmpfs -> erofs -> ext4; explicit types degrade per their own rules and
/// `ext4` alone is final.
pub fn setup(
    mnt_dir: &Path,
    img_path: &Path,
    moduledir: &Path,
    fs_type: FsType,
    mount_source: &str,
    disable_umount: bool,
) -> Result<StorageHandle> {
    log::info!("Setting up storage at {} ({})", mnt_dir.display(), fs_type);

    if utils::is_mounted(mnt_dir) {
        let _ = unmount(mnt_dir, UnmountFlags::DETACH);
    }
    utils::ensure_dir_exists(mnt_dir)?;

    let erofs_image = img_path.with_extension("erofs");

    let do_tmpfs = || -> Result<Option<StorageHandle>> {
        if try_setup_tmpfs(mnt_dir, mount_source)? {
            Ok(Some(StorageHandle {
                mount_point: mnt_dir.to_path_buf(),
                mode: "tmpfs".to_string(),
                backing_image: None,
            }))
        } else {
            Ok(None)
        }
    };

    let do_erofs = || -> Option<StorageHandle> {
        match try_setup_erofs(mnt_dir, moduledir, &erofs_image) {
            Ok(true) => {
                try_hide(mnt_dir, disable_umount);
                Some(StorageHandle {
                    mount_point: mnt_dir.to_path_buf(),
                    mode: "erofs".to_string(),
                    backing_image: Some(erofs_image.clone()),
                })
            }
            Ok(false) => None,
            Err(e) => {
                log::warn!("EROFS setup failed: {e:#}");
                None
            }
        }
    };

    let do_ext4 = || -> Result<StorageHandle> {
        setup_ext4_image(mnt_dir, img_path, moduledir)?;
        try_hide(mnt_dir, disable_umount);
        Ok(StorageHandle {
            mount_point: mnt_dir.to_path_buf(),
            mode: "ext4".to_string(),
            backing_image: Some(img_path.to_path_buf()),
        })
    };

    let handle = match fs_type {
        FsType::Ext4 => do_ext4().context(ErrorKind::StorageUnavailable)?,
        FsType::Erofs => match do_erofs() {
            Some(handle) => handle,
            None => {
                log::warn!("EROFS unavailable, falling back to ext4");
                do_ext4().context(ErrorKind::StorageUnavailable)?
            }
        },
        FsType::Tmpfs | FsType::Auto => {
            if let Some(handle) = do_tmpfs()? {
                handle
            } else {
                if fs_type == FsType::Tmpfs {
                    log::warn!("Tmpfs unusable, continuing with auto preference");
                }
                match do_erofs() {
                    Some(handle) => handle,
                    None => do_ext4().context(ErrorKind::StorageUnavailable)?,
                }
            }
        }
    };

    log::info!(">> Storage backend: [{}]", handle.mode.to_uppercase());
    Ok(handle)
}

fn try_setup_tmpfs(target: &Path, mount_source: &str) -> Result<bool> {
    if let Err(e) = utils::mount_tmpfs(target, mount_source) {
        log::warn!("Tmpfs mount failed: {e:#}");
        return Ok(false);
    }
    if utils::is_xattr_supported(target) {
        log::info!("Tmpfs active (xattr probe passed).");
        return Ok(true);
    }
    log::warn!("Tmpfs lacks xattr support (CONFIG_TMPFS_XATTR). Detaching.");
    let _ = unmount(target, UnmountFlags::DETACH);
    Ok(false)
}

fn find_tool(candidates: &[&str]) -> Option<PathBuf> {
    for candidate in candidates {
        let path = Path::new(candidate);
        if rustix::fs::access(path, rustix::fs::Access::EXEC_OK).is_ok() {
            return Some(path.to_path_buf());
        }
    }
    None
}

fn mkfs_erofs_tool() -> Option<PathBuf> {
    find_tool(&[
        "/system/bin/mkfs.erofs",
        "/vendor/bin/mkfs.erofs",
        "/sbin/mkfs.erofs",
    ])
}

/// Ok(false) when the tool is missing; Err only for a failed build/mount.
fn try_setup_erofs(target: &Path, modules_dir: &Path, image_path: &Path) -> Result<bool> {
    let Some(mkfs) = mkfs_erofs_tool() else {
        log::debug!("mkfs.erofs not found, skipping EROFS backend");
        return Ok(false);
    };

    if image_path.exists() {
        let _ = fs::remove_file(image_path);
    }

    log::info!("Packing EROFS image from {}", modules_dir.display());
    let output = Command::new(&mkfs)
        .arg("-zlz4hc,9")
        .arg(image_path)
        .arg(modules_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .context("Failed to execute mkfs.erofs")?;
    ensure!(output.status.success(), "mkfs.erofs failed");

    utils::mount_image(image_path, target, "erofs", "loop,ro,noatime")
        .context("Failed to mount EROFS image")?;

    log::info!("EROFS active (read-only, compressed).");
    Ok(true)
}

fn dir_size(path: &Path) -> u64 {
    let mut total = 0u64;
    if !path.is_dir() {
        return 0;
    }
    for entry in walkdir::WalkDir::new(path).into_iter().flatten() {
        if entry.file_type().is_file() {
            total += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    total
}

/// Create an empty ext4 image sized `max(moduledir_size * 1.2, 64 MiB)`.
/// Formatting spawns mkfs.ext4/mke2fs directly, no shell.
pub fn create_image(img_path: &Path, moduledir: &Path) -> Result<()> {
    log::info!("Creating {}", img_path.display());
    if let Some(parent) = img_path.parent() {
        fs::create_dir_all(parent)?;
    }
    if img_path.exists() {
        fs::remove_file(img_path)?;
    }

    let total = dir_size(moduledir);
    let grow_size = ((total as f64 * 1.2) as u64).max(MIN_IMAGE_SIZE);

    fs::File::create(img_path)
        .context("Failed to create ext4 image file")?
        .set_len(grow_size)
        .context("Failed to reserve ext4 image size")?;

    let Some(mkfs) = find_tool(&[
        "/system/bin/mkfs.ext4",
        "/system/bin/mke2fs",
        "/sbin/mkfs.ext4",
        "/sbin/mke2fs",
    ]) else {
        let _ = fs::remove_file(img_path);
        bail!("mkfs.ext4/mke2fs not found");
    };

    let status = Command::new(&mkfs)
        .args(["-t", "ext4", "-b", "1024"])
        .arg(img_path)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .with_context(|| format!("Failed to execute {}", mkfs.display()))?;
    if !status.success() {
        let _ = fs::remove_file(img_path);
        bail!("mkfs.ext4 failed");
    }

    let _ = utils::lsetfilecon(img_path, utils::CONTEXT_KSU_FILE);
    log::info!("Image created ({})", utils::format_size(grow_size));
    Ok(())
}

fn setup_ext4_image(target: &Path, img_path: &Path, moduledir: &Path) -> Result<()> {
    if !img_path.exists() {
        log::warn!("modules.img missing, creating...");
        create_image(img_path, moduledir)?;
    }

    utils::lsetfilecon(img_path, utils::CONTEXT_KSU_FILE).ok();

    if let Err(first) = utils::mount_image(img_path, target, "ext4", "loop,rw,noatime") {
        log::warn!("Ext4 mount failed ({first:#}), attempting repair...");
        utils::repair_image(img_path)?;
        utils::mount_image(img_path, target, "ext4", "loop,rw,noatime")
            .context("Failed to mount modules.img after repair")?;
    }

    repair_storage_root_permissions(target);
    log::info!("Ext4 active.");
    Ok(())
}

fn repair_storage_root_permissions(target: &Path) {
    if let Err(e) = rustix::fs::chmod(target, Mode::from(0o755)) {
        log::warn!("Failed to chmod storage root: {e}");
    }
    if let Err(e) = rustix::fs::chown(
        target,
        Some(rustix::fs::Uid::from_raw(0)),
        Some(rustix::fs::Gid::from_raw(0)),
    ) {
        log::warn!("Failed to chown storage root: {e}");
    }
    let _ = utils::lsetfilecon(target, DEFAULT_SELINUX_CONTEXT);
}

/// Full relabel pass over the mirror after an ext4 sync. ext4 carries
/// whatever labels the image last had; reset to the default so system
/// processes can traverse before the context-repair pass refines them.
pub fn finalize_storage_permissions(target: &Path) {
    repair_storage_root_permissions(target);
    for dir_entry in WalkDir::new(target).parallelism(jwalk::Parallelism::Serial) {
        if let Some(path) = dir_entry.ok().map(|e| e.path()) {
            let _ = utils::lsetfilecon(&path, DEFAULT_SELINUX_CONTEXT);
        }
    }
}

pub fn get_usage(path: &Path) -> (u64, u64, u64, f64) {
    match rustix::fs::statvfs(path) {
        Ok(stat) => {
            let block = stat.f_frsize;
            let total = stat.f_blocks * block;
            let free = stat.f_bfree * block;
            let used = total.saturating_sub(free);
            let percent = if total > 0 {
                used as f64 * 100.0 / total as f64
            } else {
                0.0
            };
            (total, used, free, percent)
        }
        Err(_) => (0, 0, 0, 0.0),
    }
}

/// Emit the storage status JSON for the `storage` command.
pub fn print_status() -> Result<()> {
    let state = RuntimeState::load();
    let path = if state.mount_point.as_os_str().is_empty() {
        PathBuf::from(defs::HYMO_MIRROR_DEV)
    } else {
        state.mount_point.clone()
    };

    if !path.exists() {
        println!(
            "{}",
            json!({ "path": path, "pid": state.pid, "error": "Not mounted" })
        );
        return Ok(());
    }

    let mode = if state.storage_mode.is_empty() {
        "unknown".to_string()
    } else {
        state.storage_mode.clone()
    };

    let (total, mut used, avail, mut percent) = get_usage(&path);

    // Sparse images and bind sources can report zero use; fall back to a
    // logical byte sum so the UI shows a meaningful figure.
    if used == 0 {
        let logical = dir_size(&path);
        if logical > 0 {
            used = logical;
            if total > 0 {
                percent = used as f64 * 100.0 / total as f64;
            }
        }
    }
    if used == 0 && mode == "tmpfs" {
        let moduledir = crate::config::Config::load_default()
            .map(|c| c.moduledir)
            .unwrap_or_else(|_| PathBuf::from(defs::DEFAULT_MODULE_DIR));
        let logical = dir_size(&moduledir);
        if logical > 0 {
            used = logical;
            if total > 0 {
                percent = used as f64 * 100.0 / total as f64;
            }
        }
    }

    let mut doc = json!({
        "path": path,
        "pid": state.pid,
        "size": utils::format_size(total),
        "used": utils::format_size(used),
        "avail": utils::format_size(avail),
        "percent": percent,
        "mode": mode,
    });
    if total == 0 {
        doc["warning"] = json!("Zero size detected");
    }
    println!("{doc}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_size_sums_regular_files_only() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("a/b")).unwrap();
        fs::write(dir.path().join("a/one"), vec![0u8; 100]).unwrap();
        fs::write(dir.path().join("a/b/two"), vec![0u8; 50]).unwrap();
        assert_eq!(dir_size(dir.path()), 150);
        assert_eq!(dir_size(&dir.path().join("missing")), 0);
    }

    #[test]
    fn image_size_formula_has_floor() {
        let total: u64 = 10 * 1024 * 1024;
        let grown = ((total as f64 * 1.2) as u64).max(MIN_IMAGE_SIZE);
        assert_eq!(grown, MIN_IMAGE_SIZE);

        let big: u64 = 100 * 1024 * 1024;
        let grown = ((big as f64 * 1.2) as u64).max(MIN_IMAGE_SIZE);
        assert_eq!(grown, 120 * 1024 * 1024);
    }

    #[test]
    fn usage_reports_live_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let (total, _used, avail, percent) = get_usage(dir.path());
        assert!(total > 0);
        assert!(avail <= total);
        assert!((0.0..=100.0).contains(&percent));
    }
}
