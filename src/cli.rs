// hymod/src/cli.rs
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "hymod", version, about = "Hymo mount orchestration core")]
pub struct Cli {
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,
    #[arg(short = 'm', long = "moduledir", global = true)]
    pub moduledir: Option<PathBuf>,
    #[arg(short = 't', long = "tempdir", global = true)]
    pub tempdir: Option<PathBuf>,
    #[arg(short = 's', long = "mountsource", global = true)]
    pub mountsource: Option<String>,
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,
    #[arg(short = 'p', long = "partition", global = true, action = clap::ArgAction::Append)]
    pub partitions: Vec<String>,
    #[arg(short = 'o', long = "output", global = true)]
    pub output: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the full mount orchestration pipeline
    Mount,
    /// Recompute plan, resync mirror and refresh kernel rules (no re-mount)
    Reload,
    /// Print the effective configuration as JSON
    ShowConfig,
    /// Write the default configuration file
    GenConfig,
    /// Print storage status as JSON
    Storage,
    /// Print the module inventory as JSON
    Modules,
    /// Print modules whose declared paths collide
    CheckConflicts,
    /// Print protocol/kernel version info as JSON
    Version,
    /// Print the kernel rule list as JSON
    List,
    /// Clear all kernel rules
    Clear,
    /// User hide-rule management
    Hide {
        #[command(subcommand)]
        action: HideAction,
    },
    /// Toggle kernel debug logging
    Debug { state: String },
    /// Toggle stealth mode
    Stealth { state: String },
    /// Toggle the HymoFS master switch
    Hymofs { state: String },
    /// Persist and apply kernel identity spoofing (empty strings clear)
    SetUname {
        #[arg(default_value = "")]
        release: String,
        #[arg(default_value = "")]
        version: String,
    },
    /// Persist and apply a mirror path override
    SetMirror { path: String },
    /// Direct kernel rule manipulation: add/hide/delete/merge/clear
    Raw {
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Install all kernel rules for one module
    Add { id: String },
    /// Remove all kernel rules for one module
    Delete { id: String },
    /// Install a module's rules at runtime and clear its skip marker
    HotMount { id: String },
    /// Remove a module's rules at runtime and set its skip marker
    HotUnmount { id: String },
    /// Set the persisted mount mode for a module
    SetMode { id: String, mode: String },
    /// Add a per-path mount rule for a module
    AddRule {
        id: String,
        path: String,
        mode: String,
    },
    /// Remove a per-path mount rule for a module
    RemoveRule { id: String, path: String },
    /// Discover new partitions from modules and persist them
    SyncPartitions,
    /// Create an empty ext4 modules image
    CreateImage { dir: Option<PathBuf> },
    /// Ask the kernel to reorder mount IDs
    FixMounts,
    /// HymoFS LKM lifecycle
    Lkm {
        #[command(subcommand)]
        action: LkmAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum HideAction {
    /// Print the persisted hide rules as JSON
    List,
    /// Add an absolute path to hide
    Add { path: String },
    /// Remove a path from the persisted list
    Remove { path: String },
}

#[derive(Subcommand, Debug)]
pub enum LkmAction {
    /// Load the packaged LKM matching the running kernel
    Load,
    /// Unload the LKM
    Unload,
    /// Report whether the control channel answers
    Status,
}

/// `on`/`1`/`true` enable, everything else disables.
pub fn parse_switch(state: &str) -> bool {
    matches!(state, "on" | "1" | "true")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn switch_parsing() {
        assert!(parse_switch("on"));
        assert!(parse_switch("1"));
        assert!(parse_switch("true"));
        assert!(!parse_switch("off"));
        assert!(!parse_switch("0"));
        assert!(!parse_switch("banana"));
    }

    #[test]
    fn global_flags_parse() {
        let cli = Cli::parse_from([
            "hymod", "-v", "-p", "mycustom", "-p", "oem", "-m", "/tmp/mods", "mount",
        ]);
        assert!(cli.verbose);
        assert_eq!(cli.partitions, vec!["mycustom", "oem"]);
        assert_eq!(cli.moduledir.as_deref(), Some(std::path::Path::new("/tmp/mods")));
        assert!(matches!(cli.command, Some(Commands::Mount)));
    }

    #[test]
    fn set_uname_defaults_to_clear() {
        let cli = Cli::parse_from(["hymod", "set-uname"]);
        match cli.command {
            Some(Commands::SetUname { release, version }) => {
                assert!(release.is_empty());
                assert!(version.is_empty());
            }
            other => panic!("unexpected parse: {other:?}"),
        }
    }

    #[test]
    fn hide_subcommands_parse() {
        let cli = Cli::parse_from(["hymod", "hide", "add", "/system/app/Spy"]);
        match cli.command {
            Some(Commands::Hide {
                action: HideAction::Add { path },
            }) => assert_eq!(path, "/system/app/Spy"),
            other => panic!("unexpected parse: {other:?}"),
        }
    }
}
