// hymod/src/user_rules.rs

//! User-defined hide rules: a persisted list of absolute paths the kernel
//! should pretend do not exist. Removal only edits the file; the kernel
//! keeps its copy until the next clear or reload, which is a documented
//! limitation of the channel.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};

use crate::error::ErrorKind;
use crate::hymofs::HymoClient;
use crate::{defs, utils};

pub fn load_rules_from(path: &Path) -> Vec<String> {
    match fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_default(),
        Err(_) => Vec::new(),
    }
}

pub fn load_rules() -> Vec<String> {
    load_rules_from(Path::new(defs::USER_HIDE_FILE))
}

pub fn save_rules_to(path: &Path, rules: &[String]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    utils::atomic_write(path, serde_json::to_string_pretty(rules)?)
        .context("Failed to save user hide rules")
}

pub fn save_rules(rules: &[String]) -> Result<()> {
    save_rules_to(Path::new(defs::USER_HIDE_FILE), rules)
}

/// Validate, dedupe, persist, then apply to the kernel when it is there.
pub fn add_rule(client: &HymoClient, path: &str) -> Result<()> {
    add_rule_at(Path::new(defs::USER_HIDE_FILE), client, path)
}

fn add_rule_at(file: &Path, client: &HymoClient, path: &str) -> Result<()> {
    if !path.starts_with('/') {
        bail!(ErrorKind::InvalidInput);
    }

    let mut rules = load_rules_from(file);
    if rules.iter().any(|r| r == path) {
        println!("Hide rule already exists: {path}");
        return Ok(());
    }
    rules.push(path.to_string());
    save_rules_to(file, &rules)?;
    log::info!("Added user hide rule: {path}");

    if client.is_available() {
        match client.hide_path(Path::new(path)) {
            Ok(()) => println!("Hide rule added and applied: {path}"),
            Err(e) => {
                log::warn!("Hide rule saved but kernel apply failed: {e:#}");
                println!("Hide rule added (kernel apply failed, will retry on reload): {path}");
            }
        }
    } else {
        println!("Hide rule added (will be applied on next boot): {path}");
    }
    Ok(())
}

/// Drop from the persisted list. The kernel-side rule stays until the next
/// clear or reload.
pub fn remove_rule(path: &str) -> Result<()> {
    remove_rule_at(Path::new(defs::USER_HIDE_FILE), path)
}

fn remove_rule_at(file: &Path, path: &str) -> Result<()> {
    let mut rules = load_rules_from(file);
    let before = rules.len();
    rules.retain(|r| r != path);
    if rules.len() == before {
        bail!("Hide rule not found: {path}");
    }
    save_rules_to(file, &rules)?;
    log::info!("Removed user hide rule: {path}");
    println!("Hide rule removed from user list: {path}");
    println!("Note: kernel rule will persist until next clear/reload");
    Ok(())
}

pub fn list_rules() -> Result<()> {
    let rules = load_rules();
    println!("{}", serde_json::to_string_pretty(&rules)?);
    Ok(())
}

/// Push every persisted rule into the kernel; invoked during reload.
pub fn apply_all(client: &HymoClient) {
    let rules = load_rules();
    if rules.is_empty() {
        log::info!("No user hide rules to apply");
        return;
    }
    if !client.is_available() {
        log::warn!("HymoFS not available, cannot apply user hide rules");
        return;
    }

    let mut success = 0;
    let mut failed = 0;
    for rule in &rules {
        match client.hide_path(Path::new(rule)) {
            Ok(()) => success += 1,
            Err(e) => {
                failed += 1;
                log::warn!("Failed to apply user hide rule {rule}: {e:#}");
            }
        }
    }
    log::info!("Applied user hide rules: {success} success, {failed} failed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("user_hide.json");
        let client = HymoClient::new();
        let err = add_rule_at(&file, &client, "relative/path").unwrap_err();
        assert!(crate::error::is_kind(&err, ErrorKind::InvalidInput));
        assert!(!file.exists());
    }

    #[test]
    fn add_dedupes_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("user_hide.json");
        let client = HymoClient::new();
        add_rule_at(&file, &client, "/system/app/Spy").unwrap();
        add_rule_at(&file, &client, "/system/app/Spy").unwrap();
        assert_eq!(load_rules_from(&file), vec!["/system/app/Spy".to_string()]);
    }

    #[test]
    fn remove_drops_only_named_rule() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("user_hide.json");
        let client = HymoClient::new();
        add_rule_at(&file, &client, "/a").unwrap();
        add_rule_at(&file, &client, "/b").unwrap();
        remove_rule_at(&file, "/a").unwrap();
        assert_eq!(load_rules_from(&file), vec!["/b".to_string()]);
        assert!(remove_rule_at(&file, "/missing").is_err());
    }

    #[test]
    fn broken_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("user_hide.json");
        fs::write(&file, "[\"/a\",").unwrap();
        assert!(load_rules_from(&file).is_empty());
    }
}
