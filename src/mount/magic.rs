// hymod/src/mount/magic.rs
// Copyright 2026 Hymo Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
    fs::{self, DirEntry, create_dir, create_dir_all, read_link},
    os::unix::fs::{MetadataExt, symlink},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use rustix::{
    fs::{Gid, Mode, Uid, chmod, chown},
    mount::{
        MountFlags, MountPropagationFlags, UnmountFlags, mount, mount_bind, mount_change,
        mount_move, mount_remount, unmount,
    },
};

use crate::core::state::MountStats;
use crate::mount::node::{Node, NodeFileType, collect_module_trees};
use crate::utils::{ensure_dir_exists, lgetfilecon, lsetfilecon, make_device_node};
use crate::ksu;

fn clone_symlink<S: AsRef<Path>, D: AsRef<Path>>(src: S, dst: D) -> Result<()> {
    let link_target = read_link(src.as_ref())?;
    symlink(&link_target, dst.as_ref())?;
    if let Ok(ctx) = lgetfilecon(src.as_ref()) {
        lsetfilecon(dst.as_ref(), &ctx).ok();
    }
    Ok(())
}

/// Mirror one untouched entry of the real tree into the tmpfs skeleton.
fn mount_mirror<P: AsRef<Path>>(path: P, work_dir_path: P, entry: &DirEntry) -> Result<()> {
    let src = path.as_ref().join(entry.file_name());
    let dst = work_dir_path.as_ref().join(entry.file_name());
    let file_type = entry.file_type()?;

    if file_type.is_file() {
        fs::File::create(&dst)?;
        mount_bind(&src, &dst)?;
        if let Ok(ctx) = lgetfilecon(&src) {
            lsetfilecon(&dst, &ctx).ok();
        }
    } else if file_type.is_dir() {
        create_dir(&dst)?;
        let metadata = entry.metadata()?;
        chmod(&dst, Mode::from_raw_mode(metadata.mode()))?;
        chown(
            &dst,
            Some(Uid::from_raw(metadata.uid())),
            Some(Gid::from_raw(metadata.gid())),
        )?;
        if let Ok(ctx) = lgetfilecon(&src) {
            lsetfilecon(&dst, &ctx).ok();
        }
        for sub_entry in src.read_dir()?.flatten() {
            mount_mirror(&src, &dst, &sub_entry)?;
        }
    } else if file_type.is_symlink() {
        clone_symlink(&src, &dst)?;
    }

    Ok(())
}

/// Prepare a tmpfs directory standing in for `path`: same mode, owner and
/// SELinux label as the reference tree. Wrong labels here bootloop the
/// device, so the real path wins as reference whenever it exists.
fn tmpfs_skeleton(path: &Path, work_dir_path: &Path, node: &Node) -> Result<()> {
    create_dir_all(work_dir_path)?;

    let ref_path = if path.exists() {
        path.to_path_buf()
    } else if let Some(mod_path) = &node.module_path {
        mod_path.clone()
    } else {
        bail!("no reference path for directory {}", path.display());
    };

    let metadata = ref_path.metadata()?;
    chmod(work_dir_path, Mode::from_raw_mode(metadata.mode()))?;
    chown(
        work_dir_path,
        Some(Uid::from_raw(metadata.uid())),
        Some(Gid::from_raw(metadata.gid())),
    )?;
    if let Ok(ctx) = lgetfilecon(&ref_path) {
        lsetfilecon(work_dir_path, &ctx).ok();
    }
    Ok(())
}

struct MagicMount<'a> {
    node: Node,
    path: PathBuf,
    work_dir_path: PathBuf,
    has_tmpfs: bool,
    umount: bool,
    stats: &'a mut MountStats,
}

impl<'a> MagicMount<'a> {
    fn run(
        node: Node,
        parent_path: &Path,
        parent_work: &Path,
        has_tmpfs: bool,
        umount: bool,
        stats: &'a mut MountStats,
    ) -> Result<()> {
        let path = parent_path.join(&node.name);
        let work_dir_path = parent_work.join(&node.name);
        MagicMount {
            node,
            path,
            work_dir_path,
            has_tmpfs,
            umount,
            stats,
        }
        .do_mount()
    }

    fn do_mount(mut self) -> Result<()> {
        match self.node.file_type {
            NodeFileType::Symlink => self.symlink(),
            NodeFileType::RegularFile => self.regular_file(),
            NodeFileType::Directory => self.directory(),
            NodeFileType::Whiteout => self.whiteout(),
        }
    }

    /// Materialize the deletion: a character device with rdev 0 takes the
    /// entry's place in the tmpfs skeleton, carrying the real path's label
    /// when one exists.
    fn whiteout(&mut self) -> Result<()> {
        if !self.has_tmpfs {
            // without a skeleton there is no view to hide the entry from;
            // directory() escalates to tmpfs whenever the real path exists
            log::debug!("whiteout {} outside tmpfs, skipping", self.path.display());
            return Ok(());
        }

        make_device_node(&self.work_dir_path, libc::S_IFCHR as u32, 0)
            .with_context(|| format!("create whiteout {}", self.work_dir_path.display()))?;
        if self.path.exists()
            && let Ok(ctx) = lgetfilecon(&self.path)
        {
            lsetfilecon(&self.work_dir_path, &ctx).ok();
        }

        log::debug!("file {} is removed", self.path.display());
        self.stats.whiteouts += 1;
        Ok(())
    }

    fn symlink(&mut self) -> Result<()> {
        let Some(module_path) = &self.node.module_path else {
            bail!("cannot mount root symlink {}!", self.path.display());
        };
        if !self.has_tmpfs {
            bail!(
                "cannot create symlink {} on read-only filesystem",
                self.path.display()
            );
        }
        clone_symlink(module_path, &self.work_dir_path).with_context(|| {
            format!(
                "create module symlink {} -> {}",
                module_path.display(),
                self.work_dir_path.display(),
            )
        })?;
        self.stats.symlinks += 1;
        Ok(())
    }

    fn regular_file(&mut self) -> Result<()> {
        let Some(module_path) = self.node.module_path.clone() else {
            bail!("cannot mount root file {}!", self.path.display());
        };

        let target = if self.has_tmpfs {
            if !self.work_dir_path.exists() {
                fs::File::create(&self.work_dir_path)?;
            }
            &self.work_dir_path
        } else {
            &self.path
        };

        log::debug!(
            "mount module file {} -> {}",
            module_path.display(),
            target.display()
        );

        mount_bind(&module_path, target).with_context(|| {
            format!(
                "mount module file {} -> {}",
                module_path.display(),
                target.display(),
            )
        })?;

        if self.umount {
            let _ = ksu::send_unmountable(target);
        }
        if let Err(e) = mount_remount(target, MountFlags::RDONLY | MountFlags::BIND, "") {
            log::warn!("make file {} ro: {e:#?}", target.display());
        }

        self.stats.files += 1;
        Ok(())
    }

    fn directory(&mut self) -> Result<()> {
        let mut tmpfs_needed = self.has_tmpfs;

        if !tmpfs_needed {
            if self.node.replace {
                tmpfs_needed = true;
            } else {
                for (name, node) in &self.node.children {
                    let real_path = self.path.join(name);
                    let need = match node.file_type {
                        NodeFileType::Symlink => true,
                        NodeFileType::Whiteout => real_path.exists(),
                        _ => {
                            if node.module_path.is_some() && node.file_type != NodeFileType::Directory
                            {
                                // new or changed entry forces a skeleton
                                // unless it already exists with same type
                                match real_path.symlink_metadata() {
                                    Ok(metadata) => {
                                        NodeFileType::from_file_type(metadata.file_type())
                                            != Some(node.file_type)
                                    }
                                    Err(_) => true,
                                }
                            } else {
                                !real_path.exists()
                            }
                        }
                    };
                    if need {
                        tmpfs_needed = true;
                        break;
                    }
                }
            }
        }

        let creating_tmpfs = tmpfs_needed && !self.has_tmpfs;
        if creating_tmpfs {
            tmpfs_skeleton(&self.path, &self.work_dir_path, &self.node)?;
            // the source of mount_move must itself be a mountpoint
            mount_bind(&self.work_dir_path, &self.work_dir_path).with_context(|| {
                format!(
                    "creating tmpfs (self-bind) for {} at {}",
                    self.path.display(),
                    self.work_dir_path.display(),
                )
            })?;
            self.stats.tmpfs_layers += 1;
        } else if tmpfs_needed {
            create_dir_all(&self.work_dir_path)?;
            if self.path.exists()
                && let Ok(metadata) = self.path.metadata()
            {
                chmod(&self.work_dir_path, Mode::from_raw_mode(metadata.mode()))?;
                chown(
                    &self.work_dir_path,
                    Some(Uid::from_raw(metadata.uid())),
                    Some(Gid::from_raw(metadata.gid())),
                )?;
                if let Ok(ctx) = lgetfilecon(&self.path) {
                    lsetfilecon(&self.work_dir_path, &ctx).ok();
                }
            } else {
                tmpfs_skeleton(&self.path, &self.work_dir_path, &self.node)?;
            }
        }
        self.stats.directories += 1;

        // mirror original siblings that no module touches
        if self.path.exists() && !self.node.replace {
            for entry in self.path.read_dir()?.flatten() {
                let name = entry.file_name().to_string_lossy().to_string();
                let result = if let Some(node) = self.node.children.remove(&name) {
                    if node.skip {
                        continue;
                    }
                    MagicMount::run(
                        node,
                        &self.path,
                        &self.work_dir_path,
                        tmpfs_needed,
                        self.umount,
                        self.stats,
                    )
                    .with_context(|| format!("magic mount {}/{name}", self.path.display()))
                } else if tmpfs_needed {
                    mount_mirror(&self.path, &self.work_dir_path, &entry)
                        .with_context(|| format!("mount mirror {}/{name}", self.path.display()))
                } else {
                    Ok(())
                };

                if let Err(e) = result {
                    self.stats.failures += 1;
                    if tmpfs_needed {
                        return Err(e);
                    }
                    log::error!("mount child {}/{name} failed: {e:#?}", self.path.display());
                }
            }
        }

        // remaining children are additions not present in the original
        let children = std::mem::take(&mut self.node.children);
        for (name, node) in children {
            if node.skip {
                continue;
            }
            if let Err(e) = MagicMount::run(
                node,
                &self.path,
                &self.work_dir_path,
                tmpfs_needed,
                self.umount,
                self.stats,
            )
            .with_context(|| format!("magic mount {}/{name}", self.path.display()))
            {
                self.stats.failures += 1;
                if tmpfs_needed {
                    return Err(e);
                }
                log::error!("mount child {}/{name} failed: {e:#?}", self.path.display());
            }
        }

        // commit: move the assembled tmpfs over the real path
        if creating_tmpfs {
            if let Err(e) = mount_remount(
                &self.work_dir_path,
                MountFlags::RDONLY | MountFlags::BIND,
                "",
            ) {
                log::warn!("make dir {} ro: {e:#?}", self.path.display());
            }
            mount_move(&self.work_dir_path, &self.path).with_context(|| {
                format!(
                    "moving tmpfs {} -> {}",
                    self.work_dir_path.display(),
                    self.path.display()
                )
            })?;
            if let Err(e) = mount_change(&self.path, MountPropagationFlags::PRIVATE) {
                log::warn!("make dir {} private: {e:#?}", self.path.display());
            }
            if self.umount {
                let _ = ksu::send_unmountable(&self.path);
            }
        }
        Ok(())
    }
}

/// Magic-mount the given module roots. A tmpfs scratch tree is assembled
/// under `tmp_path` and moved over the real paths; the scratch mount is
/// detached and removed on success and failure alike.
pub fn magic_mount(
    tmp_path: &Path,
    module_paths: &[PathBuf],
    mount_source: &str,
    extra_partitions: &[String],
    disable_umount: bool,
) -> Result<MountStats> {
    let mut stats = MountStats::default();

    let Some(root) = collect_module_trees(module_paths, extra_partitions)? else {
        log::info!("no modules to magic mount, skipping");
        return Ok(stats);
    };
    log::debug!("collected: {root:?}");

    let tmp_dir = tmp_path.join("workdir");
    ensure_dir_exists(&tmp_dir)?;

    mount(mount_source, &tmp_dir, "tmpfs", MountFlags::empty(), None).context("mount tmp")?;
    mount_change(&tmp_dir, MountPropagationFlags::PRIVATE).context("make tmp private")?;
    if !disable_umount {
        let _ = ksu::send_unmountable(&tmp_dir);
    }

    let ret = MagicMount::run(
        root,
        Path::new("/"),
        tmp_dir.as_path(),
        false,
        !disable_umount,
        &mut stats,
    );

    if let Err(e) = unmount(&tmp_dir, UnmountFlags::DETACH) {
        log::error!("failed to unmount tmp: {e}");
    }
    fs::remove_dir(&tmp_dir).ok();

    log::info!(
        "magic mount done: {} files, {} symlinks, {} tmpfs layers, {} failures",
        stats.files,
        stats.symlinks,
        stats.tmpfs_layers,
        stats.failures
    );
    ret.map(|_| stats)
}
