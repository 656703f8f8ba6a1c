// hymod/src/ksu.rs

//! Host-kernel channel helpers. The root host exposes an anonymous control
//! fd through a SECCOMP-safe prctl option; mount paths registered as
//! "unmountable" are detached from denylisted namespaces by the host.

use std::ffi::CString;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::Path;

use anyhow::{Context, Result, bail};

use crate::error::ErrorKind;

// prctl option for GET_FD (SECCOMP-safe). arg2 = (int *) for fd output.
const HYMO_PRCTL_GET_FD: libc::c_int = 0x48021;

// Host ioctls on the control fd
const KSU_IOC_UNMOUNTABLE: libc::c_ulong = ioc(IOC_WRITE, b'K', 120, PATH_ARG_SIZE);
const KSU_IOC_NUKE_SYSFS: libc::c_ulong = ioc(IOC_WRITE, b'K', 121, PATH_ARG_SIZE);

const IOC_WRITE: libc::c_ulong = 1;
const PATH_ARG_SIZE: usize = std::mem::size_of::<*const libc::c_char>();

// Linux _IOC encoding: dir[2] size[14] type[8] nr[8]
const fn ioc(dir: libc::c_ulong, ty: u8, nr: u8, size: usize) -> libc::c_ulong {
    (dir << 30) | ((size as libc::c_ulong) << 16) | ((ty as libc::c_ulong) << 8) | nr as libc::c_ulong
}

/// Grab the host control fd. Re-opened per command; the channel is
/// stateless and the kernel serialises ioctls.
pub fn grab_ksu_fd() -> Result<OwnedFd> {
    let mut fd: RawFd = -1;
    let ret = unsafe { libc::prctl(HYMO_PRCTL_GET_FD, &mut fd as *mut RawFd, 0, 0, 0) };
    if ret != 0 || fd < 0 {
        bail!(ErrorKind::KernelUnavailable);
    }
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn path_ioctl(request: libc::c_ulong, path: &Path) -> Result<()> {
    use std::os::fd::AsRawFd;
    use std::os::unix::ffi::OsStrExt;

    let fd = grab_ksu_fd()?;
    let c_path = CString::new(path.as_os_str().as_bytes())?;
    let ptr = c_path.as_ptr();
    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), request as _, &ptr) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        bail!("host ioctl on {} failed: {}", path.display(), err);
    }
    Ok(())
}

/// Register a mount point so the host detaches it from hidden namespaces.
pub fn send_unmountable(target: &Path) -> Result<()> {
    path_ioctl(KSU_IOC_UNMOUNTABLE, target)
        .with_context(|| format!("register unmountable {}", target.display()))
}

/// Ask the host to scrub the backing loop device of the given mount point
/// from /sys.
pub fn nuke_sysfs(target: &Path) -> Result<()> {
    path_ioctl(KSU_IOC_NUKE_SYSFS, target)
        .with_context(|| format!("nuke sysfs traces of {}", target.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ioc_encoding_matches_linux_layout() {
        // _IOW('K', 120, ptr) on 64-bit: dir=1, size=8, type=0x4b, nr=0x78
        assert_eq!(KSU_IOC_UNMOUNTABLE, (1 << 30) | (8 << 16) | (0x4b << 8) | 0x78);
    }
}
