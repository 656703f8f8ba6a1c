// hymod/src/mount/overlay.rs
// Copyright 2026 Hymo Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
    ffi::CString,
    os::fd::{AsFd, OwnedFd},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use procfs::process::Process;
use rustix::{
    fs::CWD,
    mount::{
        FsMountFlags, FsOpenFlags, MountAttrFlags, MountFlags, MoveMountFlags, OpenTreeFlags,
        fsconfig_create, fsconfig_set_string, fsmount, fsopen, mount, move_mount, open_tree,
    },
};

use crate::{defs, ksu};

/// Mount an overlay at `dest`: module layers over `lowest` (the pristine
/// tree). New mount API first, legacy option string as fallback.
pub fn mount_overlayfs(
    lower_dirs: &[String],
    lowest: &str,
    upperdir: Option<&Path>,
    workdir: Option<&Path>,
    dest: impl AsRef<Path>,
    mount_source: &str,
) -> Result<()> {
    let dest_path = dest.as_ref();
    let lowerdir_config = lower_dirs
        .iter()
        .map(|s| s.as_str())
        .chain(std::iter::once(lowest))
        .collect::<Vec<_>>()
        .join(":");

    let up_s = upperdir
        .filter(|p| p.exists())
        .map(|p| p.to_string_lossy().to_string());
    let wk_s = workdir
        .filter(|p| p.exists())
        .map(|p| p.to_string_lossy().to_string());

    let new_api = (|| -> Result<()> {
        let fs = fsopen("overlay", FsOpenFlags::FSOPEN_CLOEXEC)?;
        let fd = fs.as_fd();
        fsconfig_set_string(fd, "lowerdir", &lowerdir_config)?;
        if let (Some(u), Some(w)) = (&up_s, &wk_s) {
            fsconfig_set_string(fd, "upperdir", u)?;
            fsconfig_set_string(fd, "workdir", w)?;
        }
        fsconfig_set_string(fd, "source", mount_source)?;
        fsconfig_create(fd)?;
        let mnt = fsmount(fd, FsMountFlags::FSMOUNT_CLOEXEC, MountAttrFlags::empty())?;
        move_mount(
            mnt.as_fd(),
            "",
            CWD,
            dest_path,
            MoveMountFlags::MOVE_MOUNT_F_EMPTY_PATH,
        )?;
        Ok(())
    })();

    if let Err(e) = new_api {
        log::debug!("fsopen path failed ({e:#}), falling back to mount(2)");
        let mut data = format!("lowerdir={}", lowerdir_config.replace(',', "\\,"));
        if let (Some(u), Some(w)) = (up_s, wk_s) {
            data.push_str(&format!(
                ",upperdir={},workdir={}",
                u.replace(',', "\\,"),
                w.replace(',', "\\,")
            ));
        }
        mount(
            mount_source,
            dest_path,
            "overlay",
            MountFlags::empty(),
            Some(CString::new(data)?.as_c_str()),
        )
        .with_context(|| format!("overlay mount on {} failed", dest_path.display()))?;
    }
    Ok(())
}

/// Bind via open_tree + move_mount, degrading to a classic recursive bind.
pub fn bind_mount(from: impl AsRef<Path>, to: impl AsRef<Path>) -> Result<()> {
    let from = from.as_ref();
    let to = to.as_ref();

    let result = (|| {
        let tree = open_tree(
            CWD,
            from,
            OpenTreeFlags::OPEN_TREE_CLOEXEC
                | OpenTreeFlags::OPEN_TREE_CLONE
                | OpenTreeFlags::AT_RECURSIVE,
        )?;
        move_mount(
            tree.as_fd(),
            "",
            CWD,
            to,
            MoveMountFlags::MOVE_MOUNT_F_EMPTY_PATH,
        )
    })();

    if result.is_err() {
        log::debug!("open_tree failed, falling back to traditional bind mount");
        mount(from, to, "", MountFlags::BIND | MountFlags::REC, None)
            .context("Traditional bind mount failed")?;
    }
    Ok(())
}

/// Recursive clone of the pristine tree, detached, so child mounts stay
/// reachable after the overlay shadows them.
fn clone_tree(root: &Path) -> Option<OwnedFd> {
    open_tree(
        CWD,
        root,
        OpenTreeFlags::OPEN_TREE_CLOEXEC
            | OpenTreeFlags::OPEN_TREE_CLONE
            | OpenTreeFlags::AT_RECURSIVE,
    )
    .ok()
}

fn child_mounts_under(root: &str) -> Vec<String> {
    let Ok(process) = Process::myself() else {
        return Vec::new();
    };
    let Ok(mountinfo) = process.mountinfo() else {
        return Vec::new();
    };
    let prefix = format!("{}/", root.trim_end_matches('/'));
    let mut children: Vec<String> = mountinfo
        .into_iter()
        .filter_map(|m| {
            let p = m.mount_point.to_string_lossy().to_string();
            p.starts_with(&prefix).then_some(p)
        })
        .collect();
    children.sort();
    children.dedup();
    children
}

/// Builtin names under the target that are symlinks before the mount; if
/// the overlay turns one into a directory, the live partition is bound
/// back over it afterwards.
fn symlink_subpartitions(target: &str) -> Vec<(PathBuf, PathBuf)> {
    defs::BUILTIN_PARTITIONS
        .iter()
        .filter(|p| **p != "system")
        .filter_map(|p| {
            let under_target = Path::new(target).join(p);
            let at_root = Path::new("/").join(p);
            (under_target.is_symlink() && at_root.is_dir()).then_some((under_target, at_root))
        })
        .collect()
}

/// Mount one overlay op over an existing partition, preserving whatever
/// child mounts were layered on it before.
pub fn mount_overlay(
    target: &str,
    module_roots: &[String],
    upperdir: Option<&Path>,
    workdir: Option<&Path>,
    mount_source: &str,
    disable_umount: bool,
) -> Result<()> {
    let children = child_mounts_under(target);
    let stock_tree = if children.is_empty() {
        None
    } else {
        clone_tree(Path::new(target))
    };
    let symlinked = symlink_subpartitions(target);

    mount_overlayfs(module_roots, target, upperdir, workdir, target, mount_source)
        .with_context(|| format!("mount overlay on {target}"))?;

    for child in &children {
        let rel = child.trim_start_matches(target).trim_start_matches('/');
        let sub_lowers: Vec<String> = module_roots
            .iter()
            .map(|r| Path::new(r).join(rel).to_string_lossy().to_string())
            .filter(|p| Path::new(p).is_dir())
            .collect();

        let restored = if sub_lowers.is_empty() {
            restore_child_from_clone(stock_tree.as_ref(), rel, child)
        } else {
            mount_overlayfs(&sub_lowers, child, None, None, child, mount_source)
        };

        match restored {
            Ok(()) => {
                if !disable_umount {
                    let _ = ksu::send_unmountable(Path::new(child));
                }
            }
            Err(e) => log::warn!("Failed to restore child mount {child}: {e:#}"),
        }
    }

    // /system/vendor and friends: a symlink swallowed by the overlay gets
    // the real partition bound on top
    for (under_target, at_root) in symlinked {
        if under_target.is_dir() && !under_target.is_symlink() {
            if let Err(e) = bind_mount(&at_root, &under_target) {
                log::warn!(
                    "Failed to rebind {} over {}: {e:#}",
                    at_root.display(),
                    under_target.display()
                );
            }
        }
    }

    if !disable_umount {
        let _ = ksu::send_unmountable(Path::new(target));
    }
    Ok(())
}

fn restore_child_from_clone(
    stock_tree: Option<&OwnedFd>,
    rel: &str,
    child: &str,
) -> Result<()> {
    let Some(tree) = stock_tree else {
        anyhow::bail!("no pristine clone available for {child}");
    };
    let sub = open_tree(
        tree.as_fd(),
        rel,
        OpenTreeFlags::OPEN_TREE_CLOEXEC
            | OpenTreeFlags::OPEN_TREE_CLONE
            | OpenTreeFlags::AT_RECURSIVE,
    )
    .with_context(|| format!("open_tree {rel} from pristine clone"))?;
    move_mount(
        sub.as_fd(),
        "",
        CWD,
        child,
        MoveMountFlags::MOVE_MOUNT_F_EMPTY_PATH,
    )
    .with_context(|| format!("move pristine {rel} back onto {child}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_filter_requires_prefix_with_separator() {
        // /system_ext must not count as a child of /system; the filter
        // compares against "<root>/".
        let prefix = format!("{}/", "/system".trim_end_matches('/'));
        assert!("/system/vendor".starts_with(&prefix));
        assert!(!"/system_ext".starts_with(&prefix));
    }

    #[test]
    fn lowerdir_option_joins_layers_with_pristine_last() {
        let layers = vec!["/m/a/system".to_string(), "/m/b/system".to_string()];
        let joined = layers
            .iter()
            .map(|s| s.as_str())
            .chain(std::iter::once("/system"))
            .collect::<Vec<_>>()
            .join(":");
        assert_eq!(joined, "/m/a/system:/m/b/system:/system");
    }
}
