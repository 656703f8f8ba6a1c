// hymod/src/main.rs
mod cli;
mod config;
mod core;
mod defs;
mod error;
mod hymofs;
mod ksu;
mod lkm;
mod logger;
mod mount;
mod user_rules;
mod utils;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{CommandFactory, Parser};
use serde_json::json;

use cli::{Cli, Commands, HideAction, LkmAction, parse_switch};
use config::{Config, MountMode};
use crate::core::HymoEngine;
use crate::core::state::RuntimeState;
use error::{ErrorKind, is_kind};
use hymofs::{HymoClient, HymoStatus};

fn load_config(cli: &Cli) -> Result<Config> {
    if let Some(config_path) = &cli.config {
        return Config::from_file(config_path);
    }
    match Config::load_default() {
        Ok(config) => Ok(config),
        Err(e) => {
            if Path::new(defs::CONFIG_FILE).exists() {
                eprintln!("Error loading config: {e:#}");
            }
            Ok(Config::default())
        }
    }
}

fn config_path(cli: &Cli) -> PathBuf {
    cli.config
        .clone()
        .unwrap_or_else(|| PathBuf::from(defs::CONFIG_FILE))
}

fn mirror_base_from_state() -> PathBuf {
    let state = RuntimeState::load();
    if state.mount_point.as_os_str().is_empty() {
        PathBuf::from(defs::HYMO_MIRROR_DEV)
    } else {
        state.mount_point
    }
}

fn all_partitions_of(config: &Config) -> Vec<String> {
    config.all_partitions()
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    logger::init(cli.verbose, Path::new(defs::DAEMON_LOG_FILE))?;

    let Some(command) = &cli.command else {
        Cli::command().print_help()?;
        return Ok(());
    };

    let client = HymoClient::new();

    match command {
        Commands::GenConfig => {
            let output = cli
                .output
                .clone()
                .unwrap_or_else(|| PathBuf::from(defs::CONFIG_FILE));
            Config::default().save_to_file(&output)?;
            println!("Generated config: {}", output.display());
            Ok(())
        }
        Commands::ShowConfig => {
            let config = load_config(&cli)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Storage => core::storage::print_status(),
        Commands::Modules => {
            let config = load_config(&cli)?;
            let infos = core::inventory::list_info(
                &config.moduledir,
                &mirror_base_from_state(),
                &all_partitions_of(&config),
                &config::load_module_modes(),
            )?;
            println!("{}", serde_json::to_string(&infos)?);
            Ok(())
        }
        Commands::CheckConflicts => {
            let config = load_config(&cli)?;
            let partitions = all_partitions_of(&config);
            let modules = core::inventory::scan(
                &config.moduledir,
                &partitions,
                &config::load_module_modes(),
                &config::load_module_rules(),
            )?;
            // conflicts are a property of layer stacking; force the overlay
            // view so every module participates
            let plan =
                core::planner::generate(&partitions, &modules, &config.moduledir, false)?;
            println!("{}", serde_json::to_string_pretty(&plan.analyze_conflicts())?);
            Ok(())
        }
        Commands::Version => cmd_version(&cli, &client),
        Commands::List => {
            let rules = if client.is_available() {
                hymofs::parse_rule_listing(&client.get_active_rules()?)
            } else {
                Vec::new()
            };
            println!("{}", serde_json::to_string_pretty(&rules)?);
            Ok(())
        }
        Commands::Clear => {
            if !client.is_available() {
                bail!(ErrorKind::KernelUnavailable);
            }
            client.clear_rules()?;
            println!("Successfully cleared all HymoFS rules.");
            let mut state = RuntimeState::load();
            state.hymofs_module_ids.clear();
            let _ = state.save();
            Ok(())
        }
        Commands::Hide { action } => match action {
            HideAction::List => user_rules::list_rules(),
            HideAction::Add { path } => user_rules::add_rule(&client, path),
            HideAction::Remove { path } => user_rules::remove_rule(path),
        },
        Commands::Debug { state } => {
            require_kernel(&client)?;
            let enable = parse_switch(state);
            client.set_debug(enable)?;
            println!("Kernel debug logging {}.", onoff(enable));
            Ok(())
        }
        Commands::Stealth { state } => {
            require_kernel(&client)?;
            let enable = parse_switch(state);
            client.set_stealth(enable)?;
            println!("Stealth mode {}.", onoff(enable));
            Ok(())
        }
        Commands::Hymofs { state } => {
            require_kernel(&client)?;
            let enable = parse_switch(state);
            client.set_enabled(enable)?;
            println!("HymoFS {}.", onoff(enable));
            Ok(())
        }
        Commands::SetUname { release, version } => {
            let mut config = load_config(&cli)?;
            config.uname_release = release.clone();
            config.uname_version = version.clone();
            config.save_to_file(&config_path(&cli))?;

            if client.is_available() {
                client.set_uname(release, version)?;
                if release.is_empty() && version.is_empty() {
                    println!("Kernel uname spoofing cleared.");
                } else {
                    println!("Kernel uname spoofing updated.");
                }
            } else {
                println!("Saved; will apply when the kernel channel is present.");
            }
            Ok(())
        }
        Commands::SetMirror { path } => {
            let mut config = load_config(&cli)?;
            config.mirror_path = Some(path.clone());
            config.save_to_file(&config_path(&cli))?;
            println!("Mirror path set to: {path}");
            if client.is_available() {
                client.set_mirror_path(Path::new(path))?;
                println!("Applied mirror path to kernel.");
            }
            Ok(())
        }
        Commands::Raw { args } => cmd_raw(&client, args),
        Commands::Add { id } => cmd_add_module(&cli, &client, id),
        Commands::Delete { id } => cmd_delete_module(&cli, &client, id),
        Commands::HotMount { id } => {
            let marker = Path::new(defs::HOT_UNMOUNT_DIR).join(id);
            if marker.exists() {
                fs::remove_file(&marker)?;
            }
            let config = load_config(&cli)?;
            let disable = config.moduledir.join(id).join(defs::DISABLE_FILE_NAME);
            if disable.exists() {
                fs::remove_file(&disable)?;
            }
            cmd_add_module(&cli, &client, id)
        }
        Commands::HotUnmount { id } => {
            utils::ensure_dir_exists(defs::HOT_UNMOUNT_DIR)?;
            fs::write(Path::new(defs::HOT_UNMOUNT_DIR).join(id), b"")?;
            cmd_delete_module(&cli, &client, id)
        }
        Commands::SetMode { id, mode } => {
            utils::validate_module_id(id).context(ErrorKind::InvalidInput)?;
            let Some(mode) = MountMode::parse(mode) else {
                bail!(ErrorKind::InvalidInput);
            };
            let mut modes = config::load_module_modes();
            modes.insert(id.clone(), mode);
            config::save_module_modes(&modes)?;
            println!("Set mode for {id} to {}", mode.as_str());
            Ok(())
        }
        Commands::AddRule { id, path, mode } => {
            utils::validate_module_id(id).context(ErrorKind::InvalidInput)?;
            let Some(mode) = MountMode::parse(mode) else {
                bail!(ErrorKind::InvalidInput);
            };
            config::add_module_rule(id, path, mode)?;
            println!("Added rule for {id}: {path} -> {}", mode.as_str());
            Ok(())
        }
        Commands::RemoveRule { id, path } => {
            if config::remove_module_rule(id, path)? {
                println!("Removed rule for {id}: {path}");
            } else {
                println!("Rule not found.");
            }
            Ok(())
        }
        Commands::SyncPartitions => cmd_sync_partitions(&cli),
        Commands::CreateImage { dir } => {
            let config = load_config(&cli)?;
            let base = dir.clone().unwrap_or_else(|| PathBuf::from(defs::BASE_DIR));
            let img = base.join("modules.img");
            core::storage::create_image(&img, &config.moduledir)?;
            println!("Successfully created image at {}", img.display());
            Ok(())
        }
        Commands::FixMounts => {
            require_kernel(&client)?;
            client.fix_mounts()?;
            println!("Mount namespace fixed (mnt_id reordered).");
            Ok(())
        }
        Commands::Lkm { action } => match action {
            LkmAction::Load => lkm::load(),
            LkmAction::Unload => {
                if client.is_available() {
                    let _ = client.clear_rules();
                }
                lkm::unload()
            }
            LkmAction::Status => {
                match client.check_status() {
                    HymoStatus::Available => println!("LKM loaded (protocol matched)"),
                    HymoStatus::NotPresent => println!("LKM not loaded"),
                    HymoStatus::KernelTooOld => println!("LKM loaded (kernel too old)"),
                    HymoStatus::ModuleTooOld => println!("LKM loaded (module too old)"),
                }
                Ok(())
            }
        },
        Commands::Reload => cmd_reload(&cli, &client),
        Commands::Mount => cmd_mount(&cli, &client),
    }
}

fn onoff(enable: bool) -> &'static str {
    if enable { "enabled" } else { "disabled" }
}

fn require_kernel(client: &HymoClient) -> Result<()> {
    if !client.is_available() {
        bail!(ErrorKind::KernelUnavailable);
    }
    Ok(())
}

fn cmd_version(_cli: &Cli, client: &HymoClient) -> Result<()> {
    let available = client.is_available();
    let kernel_version = client.kernel_version().unwrap_or(0);

    let active_modules = if available {
        let listing = client.get_active_rules().unwrap_or_default();
        let mirror = mirror_base_from_state();
        let moduledir = PathBuf::from(defs::DEFAULT_MODULE_DIR);
        hymofs::active_module_ids(&listing, &[mirror.as_path(), moduledir.as_path()])
    } else {
        Vec::new()
    };

    let doc = json!({
        "protocol_version": hymofs::EXPECTED_PROTOCOL_VERSION,
        "kernel_version": kernel_version,
        "protocol_mismatch": available && kernel_version != hymofs::EXPECTED_PROTOCOL_VERSION
            || matches!(client.check_status(), HymoStatus::KernelTooOld | HymoStatus::ModuleTooOld),
        "active_modules": active_modules,
        "hymofs_available": available,
        "mount_base": mirror_base_from_state(),
    });
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}

fn cmd_raw(client: &HymoClient, args: &[String]) -> Result<()> {
    let Some(cmd) = args.first() else {
        bail!(ErrorKind::InvalidInput);
    };
    require_kernel(client)?;

    match cmd.as_str() {
        "add" => {
            let (Some(src), Some(target)) = (args.get(1), args.get(2)) else {
                bail!(ErrorKind::InvalidInput);
            };
            let rule_type: i32 = args.get(3).map(|s| s.parse()).transpose()
                .context(ErrorKind::InvalidInput)?
                .unwrap_or(0);
            client.add_rule(Path::new(src), Path::new(target), rule_type)?;
        }
        "hide" => {
            let Some(path) = args.get(1) else {
                bail!(ErrorKind::InvalidInput);
            };
            client.hide_path(Path::new(path))?;
        }
        "delete" => {
            let Some(src) = args.get(1) else {
                bail!(ErrorKind::InvalidInput);
            };
            client.delete_rule(Path::new(src))?;
        }
        "merge" => {
            let (Some(src), Some(target)) = (args.get(1), args.get(2)) else {
                bail!(ErrorKind::InvalidInput);
            };
            client.add_merge_rule(Path::new(src), Path::new(target))?;
        }
        "clear" => client.clear_rules()?,
        other => {
            eprintln!("Unknown raw command: {other}");
            bail!(ErrorKind::InvalidInput);
        }
    }
    println!("Command executed successfully.");
    Ok(())
}

fn cmd_add_module(cli: &Cli, client: &HymoClient, id: &str) -> Result<()> {
    require_kernel(client)?;
    let config = load_config(cli)?;
    let module_path = config.moduledir.join(id);
    if !module_path.exists() {
        bail!("Module not found: {id}");
    }

    let mut stats = hymofs::RuleInstallStats::default();
    let mut success = false;
    for part in all_partitions_of(&config) {
        let src_dir = module_path.join(&part);
        if src_dir.is_dir() {
            let target_base = Path::new("/").join(&part);
            success |= client.add_rules_from_directory(&target_base, &src_dir, &mut stats);
        }
    }

    if success {
        println!("Successfully added module {id}");
        log::info!("CLI: added rules for module {id}");
        let mut state = RuntimeState::load();
        if !state.hymofs_module_ids.iter().any(|m| m == id) {
            state.hymofs_module_ids.push(id.to_string());
            state.hymofs_module_ids.sort();
            let _ = state.save();
        }
    } else {
        println!("No content found to add for module {id}");
    }
    Ok(())
}

fn cmd_delete_module(cli: &Cli, client: &HymoClient, id: &str) -> Result<()> {
    require_kernel(client)?;
    let config = load_config(cli)?;
    let module_path = config.moduledir.join(id);
    let mirror_path = mirror_base_from_state().join(id);

    let mut success = false;
    for part in all_partitions_of(&config) {
        let target_base = Path::new("/").join(&part);
        for root in [&module_path, &mirror_path] {
            let src_dir = root.join(&part);
            if src_dir.is_dir() {
                success |= client.remove_rules_from_directory(&target_base, &src_dir);
            }
        }
    }

    if success {
        println!("Successfully removed rules for module {id}");
        log::info!("CLI: removed rules for module {id}");
        let mut state = RuntimeState::load();
        let before = state.hymofs_module_ids.len();
        state.hymofs_module_ids.retain(|m| m != id);
        if state.hymofs_module_ids.len() != before {
            let _ = state.save();
        }
    } else {
        println!("No active rules found for module {id}");
    }
    Ok(())
}

fn cmd_sync_partitions(cli: &Cli) -> Result<()> {
    let mut config = load_config(cli)?;
    let candidates = core::inventory::scan_partition_candidates(&config.moduledir);

    let mut added = 0;
    for cand in candidates {
        let builtin = defs::BUILTIN_PARTITIONS.contains(&cand.as_str());
        if !builtin && !config.partitions.contains(&cand) {
            println!("Added partition: {cand}");
            config.partitions.push(cand);
            added += 1;
        }
    }

    if added > 0 {
        config.save_to_file(&config_path(cli))?;
        println!("Updated config with {added} new partitions.");
    } else {
        println!("No new partitions found.");
    }
    Ok(())
}

fn cmd_reload(cli: &Cli, client: &HymoClient) -> Result<()> {
    let config = load_config(cli)?;
    logger::init(config.verbose || cli.verbose, Path::new(defs::DAEMON_LOG_FILE))?;

    if !client.is_available() {
        log::warn!("HymoFS not available, cannot hot reload.");
        bail!(ErrorKind::KernelUnavailable);
    }

    log::info!("Reloading HymoFS mappings...");
    let mirror_dir = config.effective_mirror_path();
    let partitions = config.all_partitions();

    let mut modules = core::inventory::scan(
        &config.moduledir,
        &partitions,
        &config::load_module_modes(),
        &config::load_module_rules(),
    )?;
    modules.retain(|m| {
        let marker = Path::new(defs::HOT_UNMOUNT_DIR).join(&m.id);
        if marker.exists() {
            log::info!("Skipping hot-unmounted module: {}", m.id);
            false
        } else {
            true
        }
    });

    core::sync::perform_sync(&modules, &mirror_dir, &partitions, false)?;

    let mut plan = core::planner::generate(&partitions, &modules, &mirror_dir, true)?;
    core::planner::segregate_custom_rules(&mut plan, &mirror_dir);

    // refresh the kernel's view: drop everything, then re-install
    client.clear_rules()?;
    let mut stats = hymofs::RuleInstallStats::default();
    for id in &plan.hymofs_module_ids {
        for part in &partitions {
            let src_dir = mirror_dir.join(id).join(part);
            if src_dir.is_dir() {
                let target_base = Path::new("/").join(part);
                client.add_rules_from_directory(&target_base, &src_dir, &mut stats);
            }
        }
    }
    log::info!(
        "Reload installed {} rules ({} hides, {} merges, {} failures)",
        stats.added,
        stats.hidden,
        stats.merged,
        stats.failed
    );

    user_rules::apply_all(client);

    if let Err(e) = client.set_stealth(config.enable_stealth) {
        log::warn!("Failed to set stealth mode: {e:#}");
    }
    if let Err(e) = client.set_enabled(config.hymofs_enabled) {
        log::warn!("Failed to set HymoFS enabled state: {e:#}");
    }
    if config.enable_stealth {
        if let Err(e) = client.fix_mounts() {
            log::warn!("Failed to reorder mount IDs after reload: {e:#}");
        }
    }

    let mut state = RuntimeState::load();
    state.mount_point = mirror_dir.clone();
    state.hymofs_module_ids = plan.hymofs_module_ids.clone();
    state.active_mounts = core::planner::active_partitions(&plan, &modules, &partitions);
    state.save()?;

    log::info!("Reload complete.");
    Ok(())
}

/// Mode dispatch: kernel status plus the ignore flag select the path.
fn cmd_mount(cli: &Cli, client: &HymoClient) -> Result<()> {
    let mut config = load_config(cli)?;
    config.merge_with_cli(
        cli.moduledir.clone(),
        cli.tempdir.clone(),
        cli.mountsource.clone(),
        cli.verbose,
        cli.partitions.clone(),
    );
    logger::init(config.verbose, Path::new(defs::DAEMON_LOG_FILE))?;

    if let Err(e) = utils::camouflage_process(&utils::random_kworker_name()) {
        log::warn!("Failed to camouflage process: {e:#}");
    }

    log::info!("Hymo daemon starting...");
    if config.disable_umount {
        log::warn!("Namespace detach registration is DISABLED.");
    }
    utils::ensure_dir_exists(defs::RUN_DIR)?;

    let status = client.check_status();
    let mut warning_msg = String::new();
    let mut mismatch = false;

    let mut can_use_hymofs = status == HymoStatus::Available;
    match status {
        HymoStatus::KernelTooOld => {
            mismatch = true;
            warning_msg =
                "⚠️ Kernel protocol older than module. Update your kernel.".to_string();
            if config.ignore_protocol_mismatch {
                log::warn!("Forcing HymoFS despite protocol mismatch (ignore_protocol_mismatch)");
                can_use_hymofs = true;
            }
        }
        HymoStatus::ModuleTooOld => {
            mismatch = true;
            warning_msg =
                "⚠️ Module protocol older than kernel. Update your module.".to_string();
            if config.ignore_protocol_mismatch {
                log::warn!("Forcing HymoFS despite protocol mismatch (ignore_protocol_mismatch)");
                can_use_hymofs = true;
            }
        }
        _ => {}
    }

    let result = if can_use_hymofs {
        run_fast_path(&config, client, mismatch, &warning_msg)
    } else {
        run_legacy_path(&config, client, mismatch, &warning_msg)
    };

    if let Err(e) = &result {
        core::inventory::update_description(false, "error", false, 0, 0, 0, "");
        log::error!("Mount failed: {e:#}");
    } else {
        log::info!("Hymo completed.");
    }
    result
}

fn apply_kernel_settings(config: &Config, client: &HymoClient, mirror: &Path) {
    if mirror != Path::new(defs::HYMO_MIRROR_DEV) {
        match client.set_mirror_path(mirror) {
            Ok(()) => log::info!("Applied custom mirror path: {}", mirror.display()),
            Err(e) => log::warn!("Failed to apply mirror path: {e:#}"),
        }
    }
    if config.enable_kernel_debug
        && let Err(e) = client.set_debug(true)
    {
        log::warn!("Failed to enable kernel debug logging: {e:#}");
    }
    if let Err(e) = client.set_stealth(config.enable_stealth) {
        log::warn!("Failed to set stealth mode: {e:#}");
    }
    if let Err(e) = client.set_enabled(config.hymofs_enabled) {
        log::warn!("Failed to set HymoFS enabled state: {e:#}");
    }
    if !config.uname_release.is_empty() || !config.uname_version.is_empty() {
        match client.set_uname(&config.uname_release, &config.uname_version) {
            Ok(()) => log::info!(
                "Applied kernel identity spoof: release='{}' version='{}'",
                config.uname_release,
                config.uname_version
            ),
            Err(e) => log::warn!("Failed to apply kernel identity spoof: {e:#}"),
        }
    }
}

fn run_fast_path(
    config: &Config,
    client: &HymoClient,
    mismatch: bool,
    warning: &str,
) -> Result<()> {
    log::info!("Mode: HymoFS fast path");

    let mirror = config.effective_mirror_path();
    apply_kernel_settings(config, client, &mirror);

    let attempt = (|| -> Result<()> {
        HymoEngine::new(config.clone(), client)
            .init_storage(&mirror, Path::new(defs::EXT4_IMAGE))?
            .scan_and_sync(false, false)?
            .generate_plan(true)?
            .execute(true)?
            .finalize(mismatch, warning)?;
        user_rules::apply_all(client);
        Ok(())
    })();

    match attempt {
        Ok(()) => Ok(()),
        Err(e) if is_kind(&e, ErrorKind::StorageUnavailable) || is_kind(&e, ErrorKind::SyncFailed) => {
            log::warn!("Mirror setup failed ({e:#}). Falling back to magic-only mount.");
            run_magic_only(config, client, mismatch, warning)
        }
        Err(e) => Err(e),
    }
}

fn run_legacy_path(
    config: &Config,
    client: &HymoClient,
    mismatch: bool,
    warning: &str,
) -> Result<()> {
    log::info!("Mode: standard overlay/magic path");

    let mnt_base = PathBuf::from(defs::FALLBACK_CONTENT_DIR);
    HymoEngine::new(config.clone(), client)
        .init_storage(&mnt_base, Path::new(defs::EXT4_IMAGE))?
        .scan_and_sync(false, false)?
        .generate_plan(false)?
        .execute(false)?
        .finalize(mismatch, warning)
}

/// Last-resort downshift: bind straight from the module sources without a
/// mirror. Visible in the state file as storage_mode = "magic_only".
fn run_magic_only(
    config: &Config,
    client: &HymoClient,
    mismatch: bool,
    warning: &str,
) -> Result<()> {
    let partitions = config.all_partitions();
    let modules = core::inventory::scan(
        &config.moduledir,
        &partitions,
        &config::load_module_modes(),
        &config::load_module_rules(),
    )?;

    let mut plan = core::planner::MountPlan::default();
    for module in &modules {
        plan.magic_module_paths.push(module.source_path.clone());
        plan.magic_module_ids.push(module.id.clone());
    }
    plan.magic_module_ids.sort();

    let result = core::executor::execute(
        &plan,
        config,
        client,
        &modules,
        &config.moduledir,
        &partitions,
        false,
    )?;

    let state = RuntimeState {
        pid: std::process::id(),
        storage_mode: "magic_only".to_string(),
        mount_point: config.moduledir.clone(),
        overlay_module_ids: Vec::new(),
        magic_module_ids: result.magic_module_ids.clone(),
        hymofs_module_ids: Vec::new(),
        active_mounts: core::planner::active_partitions(&plan, &modules, &partitions),
        nuke_active: false,
        hymofs_mismatch: mismatch,
        mismatch_message: warning.to_string(),
    };
    if let Err(e) = state.save() {
        log::error!("Failed to save runtime state: {e:#}");
    }

    core::inventory::update_description(
        true,
        "magic_only",
        false,
        0,
        result.magic_module_ids.len(),
        0,
        warning,
    );
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        log::error!("Fatal error: {e:#}");
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
