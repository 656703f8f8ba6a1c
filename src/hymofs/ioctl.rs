// hymod/src/hymofs/ioctl.rs
// Copyright 2026 Hymo Developers
// SPDX-License-Identifier: GPL-3.0-or-later

//! Wire marshalling for the HymoFS control channel. Every command travels
//! through the host as a packed `{cmd, _pad, arg, result}` record whose
//! layout must match the kernel side exactly on all supported
//! architectures: packed, 8-byte aligned, little-endian.

use std::ffi::CString;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use anyhow::{Context, Result, bail};

use crate::error::ErrorKind;
use crate::ksu;

pub const EXPECTED_PROTOCOL_VERSION: i32 = 12;

// Command codes forwarded to the LKM dispatcher. Numbering matches the
// kernel header's ioctl nr assignments; gaps are reserved there.
pub const CMD_ADD_RULE: u32 = 1;
pub const CMD_DEL_RULE: u32 = 2;
pub const CMD_HIDE_RULE: u32 = 3;
pub const CMD_CLEAR_ALL: u32 = 5;
pub const CMD_GET_VERSION: u32 = 6;
pub const CMD_LIST_RULES: u32 = 7;
pub const CMD_SET_DEBUG: u32 = 8;
pub const CMD_REORDER_MNT_ID: u32 = 9;
pub const CMD_SET_STEALTH: u32 = 10;
pub const CMD_HIDE_OVERLAY_XATTRS: u32 = 11;
pub const CMD_ADD_MERGE_RULE: u32 = 12;
pub const CMD_SET_MIRROR_PATH: u32 = 14;
pub const CMD_SET_UNAME: u32 = 17;
pub const CMD_SET_ENABLED: u32 = 20;

// _IOC(_IOC_READ|_IOC_WRITE, 'K', 150, 0)
const KSU_IOCTL_HYMO_CMD: libc::c_ulong = (3 << 30) | ((b'K' as libc::c_ulong) << 8) | 150;

pub const UNAME_FIELD_LEN: usize = 65;

/// Forwarding record. `arg` is the user pointer to the command-specific
/// struct; `result` carries the dispatcher's return value back.
#[repr(C, align(8))]
struct KsuHymoCmd {
    cmd: u32,
    _pad: u32,
    arg: u64,
    result: i32,
}

/// Matches `struct hymo_syscall_arg`.
#[repr(C)]
struct RuleArg {
    src: *const libc::c_char,
    target: *const libc::c_char,
    rule_type: libc::c_int,
}

/// Matches `struct hymo_syscall_list_arg`.
#[repr(C)]
struct ListArg {
    buf: *mut libc::c_char,
    size: libc::size_t,
}

/// Matches `struct hymo_spoof_uname`. Zeroed fields clear the spoof.
#[repr(C)]
struct UnameArg {
    sysname: [u8; UNAME_FIELD_LEN],
    nodename: [u8; UNAME_FIELD_LEN],
    release: [u8; UNAME_FIELD_LEN],
    version: [u8; UNAME_FIELD_LEN],
    machine: [u8; UNAME_FIELD_LEN],
    domainname: [u8; UNAME_FIELD_LEN],
    err: libc::c_int,
}

impl UnameArg {
    fn zeroed() -> Self {
        UnameArg {
            sysname: [0; UNAME_FIELD_LEN],
            nodename: [0; UNAME_FIELD_LEN],
            release: [0; UNAME_FIELD_LEN],
            version: [0; UNAME_FIELD_LEN],
            machine: [0; UNAME_FIELD_LEN],
            domainname: [0; UNAME_FIELD_LEN],
            err: 0,
        }
    }
}

fn fill_field(field: &mut [u8; UNAME_FIELD_LEN], value: &str) {
    let bytes = value.as_bytes();
    let len = bytes.len().min(UNAME_FIELD_LEN - 1);
    field[..len].copy_from_slice(&bytes[..len]);
}

/// Execute one command. The fd is grabbed fresh per call; the channel is
/// stateless. Returns the dispatcher's result value, which commands
/// interpret as 0 / -errno or as a payload (version, byte count).
fn execute(cmd: u32, arg: u64) -> Result<i32> {
    let fd = ksu::grab_ksu_fd()?;
    let mut record = KsuHymoCmd {
        cmd,
        _pad: 0,
        arg,
        result: 0,
    };
    let ret = unsafe { libc::ioctl(fd.as_raw_fd(), KSU_IOCTL_HYMO_CMD as _, &mut record) };
    if ret < 0 {
        let err = std::io::Error::last_os_error();
        return Err(anyhow::Error::new(err)
            .context(format!("hymo ioctl cmd {cmd} failed"))
            .context(ErrorKind::KernelUnavailable));
    }
    Ok(record.result)
}

fn c_path(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes()).context("path contains NUL")
}

pub fn get_version() -> Result<i32> {
    execute(CMD_GET_VERSION, 0)
}

pub fn add_rule(src: &Path, target: &Path, rule_type: i32) -> Result<()> {
    let src_c = c_path(src)?;
    let target_c = c_path(target)?;
    let arg = RuleArg {
        src: src_c.as_ptr(),
        target: target_c.as_ptr(),
        rule_type,
    };
    let ret = execute(CMD_ADD_RULE, &arg as *const RuleArg as u64)?;
    if ret != 0 {
        bail!("ADD_RULE {} -> {} returned {ret}", src.display(), target.display());
    }
    Ok(())
}

pub fn add_merge_rule(src: &Path, target: &Path) -> Result<()> {
    let src_c = c_path(src)?;
    let target_c = c_path(target)?;
    let arg = RuleArg {
        src: src_c.as_ptr(),
        target: target_c.as_ptr(),
        rule_type: 0,
    };
    let ret = execute(CMD_ADD_MERGE_RULE, &arg as *const RuleArg as u64)?;
    if ret != 0 {
        bail!("ADD_MERGE_RULE {} -> {} returned {ret}", src.display(), target.display());
    }
    Ok(())
}

pub fn delete_rule(src: &Path) -> Result<()> {
    let src_c = c_path(src)?;
    let arg = RuleArg {
        src: src_c.as_ptr(),
        target: std::ptr::null(),
        rule_type: 0,
    };
    let ret = execute(CMD_DEL_RULE, &arg as *const RuleArg as u64)?;
    if ret != 0 {
        bail!("DEL_RULE {} returned {ret}", src.display());
    }
    Ok(())
}

pub fn hide_rule(path: &Path) -> Result<()> {
    let path_c = c_path(path)?;
    let arg = RuleArg {
        src: path_c.as_ptr(),
        target: std::ptr::null(),
        rule_type: 0,
    };
    let ret = execute(CMD_HIDE_RULE, &arg as *const RuleArg as u64)?;
    if ret != 0 {
        bail!("HIDE_RULE {} returned {ret}", path.display());
    }
    Ok(())
}

pub fn hide_overlay_xattrs(path: &Path) -> Result<()> {
    let path_c = c_path(path)?;
    let arg = RuleArg {
        src: path_c.as_ptr(),
        target: std::ptr::null(),
        rule_type: 0,
    };
    let ret = execute(CMD_HIDE_OVERLAY_XATTRS, &arg as *const RuleArg as u64)?;
    if ret != 0 {
        bail!("HIDE_OVERLAY_XATTRS {} returned {ret}", path.display());
    }
    Ok(())
}

pub fn set_mirror_path(path: &Path) -> Result<()> {
    let path_c = c_path(path)?;
    let arg = RuleArg {
        src: path_c.as_ptr(),
        target: std::ptr::null(),
        rule_type: 0,
    };
    let ret = execute(CMD_SET_MIRROR_PATH, &arg as *const RuleArg as u64)?;
    if ret != 0 {
        bail!("SET_MIRROR_PATH {} returned {ret}", path.display());
    }
    Ok(())
}

pub fn clear_all() -> Result<()> {
    let ret = execute(CMD_CLEAR_ALL, 0)?;
    if ret != 0 {
        bail!("CLEAR_ALL returned {ret}");
    }
    Ok(())
}

fn set_flag(cmd: u32, enable: bool) -> Result<()> {
    // Boolean travels as a pointer-sized integer in `arg` itself.
    let ret = execute(cmd, enable as u64)?;
    if ret != 0 {
        bail!("flag cmd {cmd} returned {ret}");
    }
    Ok(())
}

pub fn set_debug(enable: bool) -> Result<()> {
    set_flag(CMD_SET_DEBUG, enable)
}

pub fn set_stealth(enable: bool) -> Result<()> {
    set_flag(CMD_SET_STEALTH, enable)
}

pub fn set_enabled(enable: bool) -> Result<()> {
    set_flag(CMD_SET_ENABLED, enable)
}

pub fn reorder_mnt_id() -> Result<()> {
    let ret = execute(CMD_REORDER_MNT_ID, 0)?;
    if ret != 0 {
        bail!("REORDER_MNT_ID returned {ret}");
    }
    Ok(())
}

/// Empty release and version clear the spoof: the record goes down zeroed
/// and the kernel reverts to real identity.
pub fn set_uname(release: &str, version: &str) -> Result<()> {
    let mut arg = UnameArg::zeroed();
    fill_field(&mut arg.release, release);
    fill_field(&mut arg.version, version);
    let ret = execute(CMD_SET_UNAME, &arg as *const UnameArg as u64)?;
    if ret != 0 {
        bail!("SET_UNAME returned {ret}");
    }
    Ok(())
}

/// Fetch the kernel's newline-separated rule listing.
pub fn list_rules() -> Result<String> {
    const BUF_SIZE: usize = 128 * 1024;
    let mut buf = vec![0u8; BUF_SIZE];
    let arg = ListArg {
        buf: buf.as_mut_ptr() as *mut libc::c_char,
        size: BUF_SIZE,
    };
    let written = execute(CMD_LIST_RULES, &arg as *const ListArg as u64)?;
    if written < 0 {
        bail!("LIST_RULES returned {written}");
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    Ok(String::from_utf8_lossy(&buf[..end]).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{align_of, offset_of, size_of};

    #[test]
    fn command_record_layout_is_kernel_compatible() {
        assert_eq!(align_of::<KsuHymoCmd>(), 8);
        assert_eq!(size_of::<KsuHymoCmd>(), 24);
        assert_eq!(offset_of!(KsuHymoCmd, cmd), 0);
        assert_eq!(offset_of!(KsuHymoCmd, _pad), 4);
        assert_eq!(offset_of!(KsuHymoCmd, arg), 8);
        assert_eq!(offset_of!(KsuHymoCmd, result), 16);
    }

    #[test]
    fn uname_record_layout() {
        assert_eq!(offset_of!(UnameArg, release), 2 * UNAME_FIELD_LEN);
        assert_eq!(offset_of!(UnameArg, version), 3 * UNAME_FIELD_LEN);
        let mut field = [0u8; UNAME_FIELD_LEN];
        fill_field(&mut field, "5.15.0-generic");
        assert_eq!(&field[..14], b"5.15.0-generic");
        assert_eq!(field[14], 0);
    }

    #[test]
    fn oversized_uname_is_truncated_with_nul() {
        let mut field = [0u8; UNAME_FIELD_LEN];
        let long = "x".repeat(200);
        fill_field(&mut field, &long);
        assert_eq!(field[UNAME_FIELD_LEN - 1], 0);
        assert!(field[..UNAME_FIELD_LEN - 1].iter().all(|&b| b == b'x'));
    }
}
