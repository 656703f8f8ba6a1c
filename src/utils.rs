// hymod/src/utils.rs
// Copyright 2026 Hymo Developers
// SPDX-License-Identifier: GPL-3.0-or-later

use std::{
    ffi::CString,
    fs::{self, File, OpenOptions, create_dir_all, remove_dir_all, remove_file},
    io::Write,
    os::unix::{
        ffi::OsStrExt,
        fs::{FileTypeExt, MetadataExt, PermissionsExt, symlink},
    },
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::OnceLock,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result, bail};
#[cfg(any(target_os = "linux", target_os = "android"))]
use extattr::{Flags as XattrFlags, lgetxattr, llistxattr, lsetxattr};
use procfs::process::Process;
use regex_lite::Regex;
use rustix::{
    fs::ioctl_ficlone,
    mount::{MountFlags, UnmountFlags, mount, unmount},
};

pub const SELINUX_XATTR: &str = "security.selinux";
pub const OVERLAY_OPAQUE_XATTR: &str = "trusted.overlay.opaque";
pub const CONTEXT_SYSTEM: &str = "u:object_r:system_file:s0";
pub const CONTEXT_ROOTFS: &str = "u:object_r:rootfs:s0";
pub const CONTEXT_KSU_FILE: &str = "u:object_r:ksu_file:s0";

// Probe attribute used to verify xattr support on a fresh tmpfs
const PROBE_XATTR: &str = "user.hymo.probe";

// Candidate scratch roots for the magic-mount workdir, early-boot friendly
const TMPFS_CANDIDATES: &[&str] = &["/debug_ramdisk", "/patch_hw", "/oem", "/root", "/sbin"];

static MODULE_ID_REGEX: OnceLock<Regex> = OnceLock::new();

pub fn validate_module_id(module_id: &str) -> Result<()> {
    let re = MODULE_ID_REGEX
        .get_or_init(|| Regex::new(r"^[A-Za-z0-9_.-]+$").expect("Invalid Regex pattern"));
    if re.is_match(module_id) {
        Ok(())
    } else {
        bail!("Invalid module ID: '{module_id}'. Must match /^[A-Za-z0-9_.-]+$/")
    }
}

/// Write a file atomically: stage the bytes in a sibling file, sync, then
/// rename over the destination. Readers either see the old content or the
/// new, never a torn write; a failed stage is removed before returning.
pub fn atomic_write<P: AsRef<Path>, C: AsRef<[u8]>>(path: P, content: C) -> Result<()> {
    let path = path.as_ref();
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let stamp = SystemTime::now().duration_since(UNIX_EPOCH)?.as_nanos();
    let staging = dir.join(format!(".hymo_stage_{}_{stamp}", std::process::id()));

    let staged = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&staging)
        .context("Failed to create staging file for atomic write")
        .and_then(|mut file| {
            file.write_all(content.as_ref())?;
            file.sync_all()?;
            Ok(())
        });

    let committed = staged.and_then(|()| {
        fs::rename(&staging, path).context("Failed to commit atomic write")
    });

    if committed.is_err() {
        let _ = fs::remove_file(&staging);
    }
    committed
}

pub fn ensure_dir_exists<T: AsRef<Path>>(dir: T) -> Result<()> {
    if !dir.as_ref().exists() {
        create_dir_all(&dir)?;
    }
    Ok(())
}

pub fn lsetfilecon<P: AsRef<Path>>(path: P, con: &str) -> Result<()> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        if let Err(e) = lsetxattr(
            path.as_ref(),
            SELINUX_XATTR,
            con.as_bytes(),
            XattrFlags::empty(),
        ) {
            let io_err = std::io::Error::from(e);
            log::debug!(
                "lsetfilecon: {} -> {} failed: {}",
                path.as_ref().display(),
                con,
                io_err
            );
        }
    }
    Ok(())
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn lgetfilecon<P: AsRef<Path>>(path: P) -> Result<String> {
    let con = lgetxattr(path.as_ref(), SELINUX_XATTR).with_context(|| {
        format!(
            "Failed to get SELinux context for {}",
            path.as_ref().display()
        )
    })?;
    Ok(String::from_utf8_lossy(&con).trim_matches('\0').to_string())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub fn lgetfilecon<P: AsRef<Path>>(_path: P) -> Result<String> {
    unimplemented!();
}

/// Mirror the label of an existing path onto another. The live root is the
/// only label oracle; nothing is fabricated when the source is unlabeled.
pub fn copy_path_context<S: AsRef<Path>, D: AsRef<Path>>(src: S, dst: D) -> Result<()> {
    if let Ok(mut ctx) = lgetfilecon(&src) {
        if ctx == CONTEXT_ROOTFS {
            ctx = CONTEXT_SYSTEM.to_string();
        }
        lsetfilecon(dst, &ctx)?;
    }
    Ok(())
}

fn copy_extended_attributes(src: &Path, dst: &Path) -> Result<()> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        if let Ok(mut ctx) = lgetfilecon(src) {
            if ctx.contains(CONTEXT_ROOTFS) {
                ctx = CONTEXT_SYSTEM.to_string();
            }
            let _ = lsetfilecon(dst, &ctx);
        }

        if let Ok(xattrs) = llistxattr(src) {
            for xattr_name in xattrs {
                let name_str = String::from_utf8_lossy(xattr_name.as_bytes());
                if name_str.starts_with("trusted.overlay.") {
                    if let Ok(val) = lgetxattr(src, &xattr_name) {
                        lsetxattr(dst, &xattr_name, &val, XattrFlags::empty()).ok();
                    }
                }
            }
        }
    }
    Ok(())
}

pub fn set_overlay_opaque<P: AsRef<Path>>(path: P) -> Result<()> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        lsetxattr(path.as_ref(), OVERLAY_OPAQUE_XATTR, b"y", XattrFlags::empty())?;
    }
    Ok(())
}

/// True when a directory carries the replacement marker, either the xattr or
/// the sentinel file.
pub fn is_replace_marked(dir: &Path) -> bool {
    if dir.join(crate::defs::REPLACE_DIR_FILE_NAME).exists() {
        return true;
    }
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        if let Ok(val) = lgetxattr(dir, OVERLAY_OPAQUE_XATTR) {
            return val.first() == Some(&b'y');
        }
    }
    false
}

/// Set, read back and remove a probe xattr on a fresh mount root. tmpfs
/// without CONFIG_TMPFS_XATTR fails the set.
pub fn is_xattr_supported(path: &Path) -> bool {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        if lsetxattr(path, PROBE_XATTR, b"1", XattrFlags::empty()).is_err() {
            return false;
        }
        let ok = matches!(lgetxattr(path, PROBE_XATTR), Ok(v) if v == b"1");
        let _ = extattr::lremovexattr(path, PROBE_XATTR);
        ok
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        let _ = path;
        true
    }
}

pub fn is_mounted<P: AsRef<Path>>(path: P) -> bool {
    let path_str = path.as_ref().to_string_lossy();
    let search = path_str.trim_end_matches('/');

    if let Ok(process) = Process::myself()
        && let Ok(mountinfo) = process.mountinfo()
    {
        return mountinfo
            .into_iter()
            .any(|m| m.mount_point.to_string_lossy() == search);
    }

    if let Ok(content) = fs::read_to_string("/proc/mounts") {
        for line in content.lines() {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() > 1 && parts[1] == search {
                return true;
            }
        }
    }
    false
}

pub fn mount_tmpfs(target: &Path, source: &str) -> Result<()> {
    ensure_dir_exists(target)?;
    let data = CString::new("mode=0755")?;
    mount(
        source,
        target,
        "tmpfs",
        MountFlags::empty(),
        Some(data.as_c_str()),
    )
    .context("Failed to mount tmpfs")?;
    Ok(())
}

/// Loop-mount a filesystem image through the system mount binary. Loop
/// device setup stays in the host's hands, same as the boot scripts.
pub fn mount_image(image_path: &Path, target: &Path, fs_type: &str, options: &str) -> Result<()> {
    ensure_dir_exists(target)?;
    let status = Command::new("mount")
        .args(["-t", fs_type, "-o", options])
        .arg(image_path)
        .arg(target)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .with_context(|| format!("Failed to execute mount for {}", image_path.display()))?;
    if !status.success() {
        bail!(
            "mount -t {} {} -> {} failed",
            fs_type,
            image_path.display(),
            target.display()
        );
    }
    Ok(())
}

pub fn repair_image(image_path: &Path) -> Result<()> {
    log::info!("Running e2fsck on {}", image_path.display());
    let status = Command::new("e2fsck")
        .args(["-y", "-f"])
        .arg(image_path)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .context("Failed to execute e2fsck")?;

    // e2fsck exits 1/2 for corrected errors
    if let Some(code) = status.code()
        && code > 2
    {
        bail!("e2fsck failed with exit code: {}", code);
    }
    Ok(())
}

pub fn reflink_or_copy(src: &Path, dest: &Path) -> Result<u64> {
    let src_file = File::open(src)?;
    let dest_file = File::create(dest)?;

    if ioctl_ficlone(&dest_file, &src_file).is_ok() {
        let metadata = src_file.metadata()?;
        let len = metadata.len();
        dest_file.set_permissions(metadata.permissions())?;
        return Ok(len);
    }
    drop(dest_file);
    drop(src_file);
    fs::copy(src, dest).map_err(|e| e.into())
}

pub fn make_device_node(path: &Path, mode: u32, rdev: u64) -> Result<()> {
    let c_path = CString::new(path.as_os_str().as_encoded_bytes())?;
    let dev = rdev as libc::dev_t;
    unsafe {
        if libc::mknod(c_path.as_ptr(), mode as libc::mode_t, dev) != 0 {
            let err = std::io::Error::last_os_error();
            bail!("mknod failed for {}: {}", path.display(), err);
        }
    }
    Ok(())
}

/// Counters for one replication pass; individual failures never abort it.
#[derive(Debug, Default)]
pub struct SyncCounters {
    pub copied: u64,
    pub failed: u64,
}

fn preserve_owner(path: &Path, meta: &fs::Metadata) {
    let result = rustix::fs::chownat(
        rustix::fs::CWD,
        path,
        Some(rustix::fs::Uid::from_raw(meta.uid())),
        Some(rustix::fs::Gid::from_raw(meta.gid())),
        rustix::fs::AtFlags::SYMLINK_NOFOLLOW,
    );
    if let Err(e) = result {
        log::debug!("chown {} failed: {e}", path.display());
    }
}

fn sync_entry(src: &Path, dst: &Path, meta: &fs::Metadata) -> Result<()> {
    let ft = meta.file_type();
    if ft.is_symlink() {
        if dst.exists() {
            remove_file(dst)?;
        }
        symlink(fs::read_link(src)?, dst)?;
    } else if ft.is_char_device() || ft.is_block_device() || ft.is_fifo() {
        if dst.exists() {
            remove_file(dst)?;
        }
        make_device_node(dst, meta.permissions().mode(), meta.rdev())?;
    } else {
        reflink_or_copy(src, dst)?;
    }
    preserve_owner(dst, meta);
    let _ = copy_extended_attributes(src, dst);
    Ok(())
}

/// Replicate `src` into `dst`, preserving mode, owner, symlink targets,
/// device numbers and extended attributes. Iterative to keep deep trees off
/// the stack.
pub fn sync_dir(src: &Path, dst: &Path, counters: &mut SyncCounters) -> Result<()> {
    if !src.exists() {
        return Ok(());
    }
    ensure_dir_exists(dst)?;

    let mut stack: Vec<(PathBuf, PathBuf)> = vec![(src.to_path_buf(), dst.to_path_buf())];

    while let Some((curr_src, curr_dst)) = stack.pop() {
        if !curr_dst.exists() {
            create_dir_all(&curr_dst)?;
        }
        if let Ok(src_meta) = curr_src.metadata() {
            let _ = fs::set_permissions(&curr_dst, src_meta.permissions());
            preserve_owner(&curr_dst, &src_meta);
        }
        let _ = copy_extended_attributes(&curr_src, &curr_dst);

        for entry in fs::read_dir(&curr_src)? {
            let entry = entry?;
            let s = entry.path();
            let d = curr_dst.join(entry.file_name());

            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    log::warn!("sync: stat {} failed: {}", s.display(), e);
                    counters.failed += 1;
                    continue;
                }
            };

            if metadata.file_type().is_dir() {
                stack.push((s, d));
            } else if let Err(e) = sync_entry(&s, &d, &metadata) {
                log::warn!("sync: {} -> {} failed: {}", s.display(), d.display(), e);
                counters.failed += 1;
            } else {
                counters.copied += 1;
            }
        }
    }
    Ok(())
}

/// Any non-directory entry anywhere below `path`?
pub fn has_files_recursive(path: &Path) -> bool {
    if !path.exists() {
        return false;
    }
    walkdir::WalkDir::new(path)
        .min_depth(1)
        .into_iter()
        .flatten()
        .any(|e| !e.file_type().is_dir())
}

pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1}G", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.0}M", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.0}K", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

pub fn camouflage_process(name: &str) -> Result<()> {
    let c_name = CString::new(name)?;
    unsafe {
        libc::prctl(libc::PR_SET_NAME, c_name.as_ptr() as u64, 0, 0, 0);
    }
    Ok(())
}

pub fn random_kworker_name() -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
        .hash(&mut hasher);
    std::process::id().hash(&mut hasher);
    let hash = hasher.finish();

    format!("kworker/u{}:{}", hash % 16, (hash >> 4) % 10)
}

pub fn get_kernel_release() -> Result<String> {
    let uts = rustix::system::uname();
    Ok(uts.release().to_string_lossy().to_string())
}

/// Pick a scratch root for the magic-mount workdir. Early boot leaves few
/// writable tmpfs paths; fall back to /dev which always is one.
pub fn select_temp_dir() -> Result<PathBuf> {
    for candidate in TMPFS_CANDIDATES {
        let path = Path::new(candidate);
        if path.is_dir() {
            return Ok(path.join(".hymo_work"));
        }
    }
    Ok(PathBuf::from("/dev/.hymo_work"))
}

pub fn ensure_temp_dir(temp_dir: &Path) -> Result<()> {
    if temp_dir.exists() {
        remove_dir_all(temp_dir).ok();
    }
    create_dir_all(temp_dir)?;
    Ok(())
}

pub fn cleanup_temp_dir(temp_dir: &Path) {
    let _ = unmount(temp_dir, UnmountFlags::DETACH);
    if let Err(e) = remove_dir_all(temp_dir) {
        log::debug!("Failed to clean up temp dir {}: {:#}", temp_dir.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_id_charset() {
        assert!(validate_module_id("a_module-1.2").is_ok());
        assert!(validate_module_id("9lives").is_ok());
        assert!(validate_module_id("").is_err());
        assert!(validate_module_id("bad/id").is_err());
        assert!(validate_module_id("spa ce").is_err());
    }

    #[test]
    fn size_formatting() {
        assert_eq!(format_size(512), "512B");
        assert_eq!(format_size(2048), "2K");
        assert_eq!(format_size(3 * 1024 * 1024), "3M");
        assert_eq!(format_size(1024 * 1024 * 1024 + 512 * 1024 * 1024), "1.5G");
    }

    #[test]
    fn atomic_write_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("state.json");
        atomic_write(&target, "first").unwrap();
        atomic_write(&target, "second").unwrap();
        assert_eq!(fs::read_to_string(&target).unwrap(), "second");
        // no temp droppings left behind
        let leftovers: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn sync_dir_copies_files_and_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir_all(src.join("system/bin")).unwrap();
        fs::write(src.join("system/bin/tool"), b"bytes").unwrap();
        symlink("tool", src.join("system/bin/alias")).unwrap();

        let mut counters = SyncCounters::default();
        sync_dir(&src, &dst, &mut counters).unwrap();

        assert_eq!(fs::read(dst.join("system/bin/tool")).unwrap(), b"bytes");
        let link = fs::read_link(dst.join("system/bin/alias")).unwrap();
        assert_eq!(link, PathBuf::from("tool"));
        assert_eq!(counters.copied, 2);
        assert_eq!(counters.failed, 0);
    }

    #[test]
    fn has_files_recursive_ignores_empty_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("mod/system/app");
        fs::create_dir_all(&root).unwrap();
        assert!(!has_files_recursive(&dir.path().join("mod")));
        fs::write(root.join("Foo.apk"), b"x").unwrap();
        assert!(has_files_recursive(&dir.path().join("mod")));
    }

    #[test]
    fn replace_marker_file_detected() {
        let dir = tempfile::tempdir().unwrap();
        let marked = dir.path().join("marked");
        fs::create_dir_all(&marked).unwrap();
        assert!(!is_replace_marked(&marked));
        fs::write(marked.join(crate::defs::REPLACE_DIR_FILE_NAME), b"").unwrap();
        assert!(is_replace_marked(&marked));
    }

    #[test]
    fn kworker_name_shape() {
        let name = random_kworker_name();
        assert!(name.starts_with("kworker/u"));
        assert!(name.contains(':'));
    }
}
