// hymod/src/hymofs/mod.rs
// Copyright 2026 Hymo Developers
// SPDX-License-Identifier: GPL-3.0-or-later

pub mod ioctl;

use std::cell::OnceCell;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;

use anyhow::Result;
use serde::Serialize;
use walkdir::WalkDir;

use crate::utils;

pub use ioctl::EXPECTED_PROTOCOL_VERSION;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HymoStatus {
    Available,
    NotPresent,
    KernelTooOld,
    ModuleTooOld,
}

/// One parsed line of the kernel rule listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleEntry {
    #[serde(rename = "type")]
    pub rule_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Counters for one rule-installation walk.
#[derive(Debug, Default, Clone, Copy)]
pub struct RuleInstallStats {
    pub added: u64,
    pub hidden: u64,
    pub merged: u64,
    pub failed: u64,
}

/// Client for the HymoFS control channel. The protocol status is probed at
/// most once per process; construct one client in main and pass it down.
pub struct HymoClient {
    status: OnceCell<HymoStatus>,
}

impl HymoClient {
    pub fn new() -> Self {
        HymoClient {
            status: OnceCell::new(),
        }
    }

    pub fn check_status(&self) -> HymoStatus {
        *self.status.get_or_init(|| {
            let version = match ioctl::get_version() {
                Ok(v) => v,
                Err(e) => {
                    log::debug!("HymoFS probe failed: {e:#}");
                    return HymoStatus::NotPresent;
                }
            };
            if version < 0 {
                log::warn!("HymoFS status: NotPresent (dispatch returned {version})");
                HymoStatus::NotPresent
            } else if version < EXPECTED_PROTOCOL_VERSION {
                log::warn!(
                    "HymoFS status: KernelTooOld (got {version}, expected {EXPECTED_PROTOCOL_VERSION})"
                );
                HymoStatus::KernelTooOld
            } else if version > EXPECTED_PROTOCOL_VERSION {
                log::warn!(
                    "HymoFS status: ModuleTooOld (got {version}, expected {EXPECTED_PROTOCOL_VERSION})"
                );
                HymoStatus::ModuleTooOld
            } else {
                log::info!("HymoFS status: Available (version {version})");
                HymoStatus::Available
            }
        })
    }

    pub fn is_available(&self) -> bool {
        self.check_status() == HymoStatus::Available
    }

    pub fn kernel_version(&self) -> Option<i32> {
        if self.check_status() == HymoStatus::NotPresent {
            return None;
        }
        ioctl::get_version().ok()
    }

    /// Install one redirection. `target` is the shadowed live path, `source`
    /// the mirror content backing it. The wire record's `src` field carries
    /// the shadowed path; naming follows the kernel header, not the listing.
    pub fn add_rule(&self, target: &Path, source: &Path, rule_type: i32) -> Result<()> {
        log::debug!(
            "HymoFS: ADD {} -> {} (type {rule_type})",
            target.display(),
            source.display()
        );
        ioctl::add_rule(target, source, rule_type)
    }

    pub fn add_merge_rule(&self, target: &Path, source: &Path) -> Result<()> {
        log::debug!("HymoFS: MERGE {} -> {}", target.display(), source.display());
        ioctl::add_merge_rule(target, source)
    }

    pub fn delete_rule(&self, target: &Path) -> Result<()> {
        log::debug!("HymoFS: DEL {}", target.display());
        ioctl::delete_rule(target)
    }

    pub fn hide_path(&self, path: &Path) -> Result<()> {
        log::debug!("HymoFS: HIDE {}", path.display());
        ioctl::hide_rule(path)
    }

    pub fn hide_overlay_xattrs(&self, path: &Path) -> Result<()> {
        ioctl::hide_overlay_xattrs(path)
    }

    pub fn clear_rules(&self) -> Result<()> {
        log::info!("HymoFS: clearing all rules");
        ioctl::clear_all()
    }

    pub fn set_debug(&self, enable: bool) -> Result<()> {
        ioctl::set_debug(enable)
    }

    pub fn set_stealth(&self, enable: bool) -> Result<()> {
        ioctl::set_stealth(enable)
    }

    pub fn set_enabled(&self, enable: bool) -> Result<()> {
        ioctl::set_enabled(enable)
    }

    pub fn set_mirror_path(&self, path: &Path) -> Result<()> {
        log::info!("HymoFS: mirror path -> {}", path.display());
        ioctl::set_mirror_path(path)
    }

    pub fn set_uname(&self, release: &str, version: &str) -> Result<()> {
        if release.is_empty() && version.is_empty() {
            log::info!("HymoFS: clearing uname spoof");
        } else {
            log::info!("HymoFS: uname spoof release='{release}' version='{version}'");
        }
        ioctl::set_uname(release, version)
    }

    pub fn fix_mounts(&self) -> Result<()> {
        log::info!("HymoFS: reordering mount IDs");
        ioctl::reorder_mnt_id()
    }

    pub fn get_active_rules(&self) -> Result<String> {
        ioctl::list_rules()
    }

    /// Walk staged module content and translate every entry into kernel
    /// rules. Duplicate installs are idempotent on the kernel side, so a
    /// re-run of the same tree is safe.
    pub fn add_rules_from_directory(
        &self,
        target_base: &Path,
        module_dir: &Path,
        stats: &mut RuleInstallStats,
    ) -> bool {
        if !module_dir.is_dir() {
            return false;
        }

        let mut any = false;
        for entry in WalkDir::new(module_dir)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .flatten()
        {
            let current = entry.path();
            let Ok(rel) = current.strip_prefix(module_dir) else {
                continue;
            };
            let target = target_base.join(rel);
            let file_type = entry.file_type();

            let result = if file_type.is_dir() {
                if utils::is_replace_marked(current) {
                    self.add_merge_rule(&target, current).map(|_| {
                        stats.merged += 1;
                    })
                } else {
                    continue;
                }
            } else if file_type.is_char_device() {
                match entry.metadata() {
                    Ok(meta) if is_whiteout_meta(&meta) => self.hide_path(&target).map(|_| {
                        stats.hidden += 1;
                    }),
                    _ => continue,
                }
            } else if file_type.is_file() || file_type.is_symlink() {
                if entry.file_name() == crate::defs::REPLACE_DIR_FILE_NAME {
                    continue;
                }
                self.add_rule(&target, current, 0).map(|_| {
                    stats.added += 1;
                })
            } else {
                continue;
            };

            match result {
                Ok(()) => any = true,
                Err(e) => {
                    stats.failed += 1;
                    log::warn!("HymoFS rule for {} failed: {e:#}", target.display());
                }
            }
        }
        any
    }

    /// Remove the kernel rules a module's content tree produced.
    pub fn remove_rules_from_directory(&self, target_base: &Path, module_dir: &Path) -> bool {
        if !module_dir.is_dir() {
            return false;
        }

        let mut any = false;
        for entry in WalkDir::new(module_dir).min_depth(1).into_iter().flatten() {
            let current = entry.path();
            let Ok(rel) = current.strip_prefix(module_dir) else {
                continue;
            };
            let target = target_base.join(rel);
            let file_type = entry.file_type();

            let removable = file_type.is_file()
                || file_type.is_symlink()
                || (file_type.is_char_device()
                    && entry.metadata().is_ok_and(|m| is_whiteout_meta(&m)))
                || (file_type.is_dir() && utils::is_replace_marked(current));

            if removable {
                match self.delete_rule(&target) {
                    Ok(()) => any = true,
                    Err(e) => log::debug!("delete rule {} failed: {e:#}", target.display()),
                }
            }
        }
        any
    }
}

impl Default for HymoClient {
    fn default() -> Self {
        HymoClient::new()
    }
}

fn is_whiteout_meta(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    meta.file_type().is_char_device() && meta.rdev() == 0
}

/// Parse one listing line. The kernel emits `ADD <target> <source>`,
/// `MERGE <target> <source>` and `HIDE <path>`; the type token is
/// case-insensitive and normalised to uppercase here.
pub fn parse_rule_line(line: &str) -> Option<RuleEntry> {
    let mut tokens = line.split_whitespace();
    let rule_type = tokens.next()?.to_uppercase();

    match rule_type.as_str() {
        "ADD" | "MERGE" => {
            let target = tokens.next()?.to_string();
            let source = tokens.next()?.to_string();
            Some(RuleEntry {
                rule_type,
                target: Some(target),
                source: Some(source),
                path: None,
            })
        }
        "HIDE" => {
            let path = tokens.next()?.to_string();
            Some(RuleEntry {
                rule_type,
                target: None,
                source: None,
                path: Some(path),
            })
        }
        _ => None,
    }
}

pub fn parse_rule_listing(listing: &str) -> Vec<RuleEntry> {
    listing.lines().filter_map(parse_rule_line).collect()
}

/// Extract module IDs from the rule listing by matching sources against the
/// module directory and the mirror base.
pub fn active_module_ids(listing: &str, roots: &[&Path]) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for entry in parse_rule_listing(listing) {
        let Some(source) = entry.source else { continue };
        let source_path = Path::new(&source);
        for root in roots {
            if let Ok(rel) = source_path.strip_prefix(root)
                && let Some(first) = rel.components().next()
            {
                let id = first.as_os_str().to_string_lossy().to_string();
                if !ids.contains(&id) {
                    ids.push(id);
                }
                break;
            }
        }
    }
    ids.sort();
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_add_and_hide_lines() {
        let entry = parse_rule_line("ADD /system/etc/hosts /dev/hymo_mirror/a/system/etc/hosts")
            .unwrap();
        assert_eq!(entry.rule_type, "ADD");
        assert_eq!(entry.target.as_deref(), Some("/system/etc/hosts"));
        assert_eq!(
            entry.source.as_deref(),
            Some("/dev/hymo_mirror/a/system/etc/hosts")
        );

        let hide = parse_rule_line("hide /system/app/Bloat/Bloat.apk").unwrap();
        assert_eq!(hide.rule_type, "HIDE");
        assert_eq!(hide.path.as_deref(), Some("/system/app/Bloat/Bloat.apk"));
    }

    #[test]
    fn lowercase_types_are_normalised() {
        let entry = parse_rule_line("merge /system/app/Bloat /mirror/z/system/app/Bloat").unwrap();
        assert_eq!(entry.rule_type, "MERGE");
    }

    #[test]
    fn garbage_lines_are_dropped() {
        assert!(parse_rule_line("").is_none());
        assert!(parse_rule_line("NOISE something").is_none());
        assert!(parse_rule_line("ADD /only-target").is_none());
        let listing = "ADD /a /m/x/a\n\nbogus\nHIDE /b\n";
        assert_eq!(parse_rule_listing(listing).len(), 2);
    }

    #[test]
    fn module_ids_extracted_from_sources() {
        let listing = "\
ADD /system/etc/hosts /dev/hymo_mirror/bravo/system/etc/hosts
ADD /system/etc/hosts /dev/hymo_mirror/alpha/system/etc/hosts
MERGE /system/app/X /data/adb/modules/zulu/system/app/X
HIDE /system/app/Bloat
";
        let mirror = Path::new("/dev/hymo_mirror");
        let moduledir = Path::new("/data/adb/modules");
        let ids = active_module_ids(listing, &[mirror, moduledir]);
        assert_eq!(ids, vec!["alpha", "bravo", "zulu"]);
    }

    #[test]
    fn status_is_memoised_per_process() {
        // No kernel channel in tests: the probe fails once, and the cached
        // NotPresent answer must be returned on every later call.
        let client = HymoClient::new();
        assert_eq!(client.check_status(), HymoStatus::NotPresent);
        assert_eq!(client.check_status(), HymoStatus::NotPresent);
        assert!(!client.is_available());
    }
}
