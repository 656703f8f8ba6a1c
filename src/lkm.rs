// hymod/src/lkm.rs

//! HymoFS LKM lifecycle: pick the packaged `.ko` matching the running KMI
//! tuple and install it via finit_module. The packaging step has already
//! placed one binary per supported KMI under the module's binaries
//! directory; this is only the runtime selection half.

use std::ffi::CString;
use std::fs;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};

use crate::{defs, utils};

// Syscall number the LKM hooks for its legacy entry; passed as a module
// parameter at insertion.
const HYMO_SYSCALL_NR: i32 = 142;

const LKM_MODNAME: &str = "hymofs_lkm";

// finit_module / delete_module syscall numbers per supported arch
#[cfg(target_arch = "aarch64")]
const SYS_FINIT_MODULE: libc::c_long = 273;
#[cfg(target_arch = "aarch64")]
const SYS_DELETE_MODULE: libc::c_long = 106;

#[cfg(target_arch = "arm")]
const SYS_FINIT_MODULE: libc::c_long = 379;
#[cfg(target_arch = "arm")]
const SYS_DELETE_MODULE: libc::c_long = 129;

#[cfg(target_arch = "x86_64")]
const SYS_FINIT_MODULE: libc::c_long = 313;
#[cfg(target_arch = "x86_64")]
const SYS_DELETE_MODULE: libc::c_long = 176;

#[cfg(not(any(target_arch = "aarch64", target_arch = "arm", target_arch = "x86_64")))]
compile_error!("unsupported architecture: add finit_module/delete_module numbers");

#[cfg(target_arch = "aarch64")]
const ARCH_SUFFIX: &str = "_arm64";
#[cfg(target_arch = "arm")]
const ARCH_SUFFIX: &str = "_armv7";
#[cfg(target_arch = "x86_64")]
const ARCH_SUFFIX: &str = "_x86_64";

/// Derive the KMI tuple ("android14-6.1") from a kernel release string.
/// Returns None for non-GKI kernels.
pub fn kmi_from_release(release: &str) -> Option<String> {
    let dot1 = release.find('.')?;
    let dot2 = release[dot1 + 1..]
        .find(|c: char| !c.is_ascii_digit())
        .map(|i| dot1 + 1 + i)
        .unwrap_or(release.len());
    let major_minor = &release[..dot2];

    let android_pos = release.find("-android")?;
    let ver_start = android_pos + "-android".len();
    let ver_end = release[ver_start..]
        .find('-')
        .map(|i| ver_start + i)
        .unwrap_or(release.len());
    let android_ver = &release[ver_start..ver_end];
    if android_ver.is_empty() {
        return None;
    }

    Some(format!("android{}-{}", android_ver, major_minor))
}

fn current_kmi() -> Result<String> {
    let release = utils::get_kernel_release()?;
    kmi_from_release(&release)
        .with_context(|| format!("kernel release '{release}' carries no KMI tuple"))
}

/// Asset name scheme shared with the packaging step.
fn asset_name(kmi: &str) -> String {
    format!("{kmi}{ARCH_SUFFIX}_hymofs_lkm.ko")
}

/// Locate the `.ko` for the running kernel in the installed binaries
/// directory. Exact KMI name first, then a loose major.minor match.
pub fn find_lkm_binary(binaries_dir: &Path) -> Result<PathBuf> {
    let kmi = current_kmi()?;
    let wanted = asset_name(&kmi);

    let exact = binaries_dir.join(&wanted);
    if exact.exists() {
        return Ok(exact);
    }

    let release = utils::get_kernel_release()?;
    let parts: Vec<&str> = release.split('.').collect();
    if parts.len() < 2 {
        bail!("unparsable kernel release: {release}");
    }
    let kernel_short = format!("{}.{}", parts[0], parts[1]);

    for entry in fs::read_dir(binaries_dir)
        .with_context(|| format!("LKM directory missing: {}", binaries_dir.display()))?
        .flatten()
    {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.contains(&kernel_short) && name.contains(ARCH_SUFFIX) && name.ends_with(".ko") {
            log::info!("Found loose match LKM: {name}");
            return Ok(entry.path());
        }
    }

    bail!("no LKM binary for KMI {kmi} under {}", binaries_dir.display())
}

fn finit_module(ko_path: &Path, params: &str) -> Result<()> {
    let file = fs::File::open(ko_path)
        .with_context(|| format!("open {} failed", ko_path.display()))?;
    let c_params = CString::new(params)?;
    let ret = unsafe {
        libc::syscall(
            SYS_FINIT_MODULE,
            file.as_raw_fd() as libc::c_long,
            c_params.as_ptr(),
            0 as libc::c_long,
        )
    };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        bail!("finit_module {} failed: {}", ko_path.display(), err);
    }
    Ok(())
}

fn delete_module(name: &str) -> Result<()> {
    let c_name = CString::new(name)?;
    let ret = unsafe {
        libc::syscall(
            SYS_DELETE_MODULE,
            c_name.as_ptr(),
            libc::O_NONBLOCK as libc::c_long,
        )
    };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        bail!("delete_module {} failed: {}", name, err);
    }
    Ok(())
}

pub fn load() -> Result<()> {
    let ko_path = find_lkm_binary(Path::new(defs::MODULE_LKM_DIR))?;
    log::info!("Loading HymoFS LKM: {}", ko_path.display());
    finit_module(&ko_path, &format!("hymo_syscall_nr={HYMO_SYSCALL_NR}"))
}

pub fn unload() -> Result<()> {
    log::info!("Unloading HymoFS LKM");
    delete_module(LKM_MODNAME)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kmi_parses_gki_release() {
        assert_eq!(
            kmi_from_release("6.1.57-android14-11-g8bab72b63c20").as_deref(),
            Some("android14-6.1")
        );
        assert_eq!(
            kmi_from_release("5.10.198-android12-9").as_deref(),
            Some("android12-5.10")
        );
    }

    #[test]
    fn kmi_rejects_non_gki_release() {
        assert_eq!(kmi_from_release("6.8.0-generic"), None);
        assert_eq!(kmi_from_release("nodots"), None);
    }

    #[test]
    fn asset_name_scheme() {
        let name = asset_name("android14-6.1");
        assert!(name.starts_with("android14-6.1_"));
        assert!(name.ends_with("_hymofs_lkm.ko"));
    }
}
