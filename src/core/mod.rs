// hymod/src/core/mod.rs

pub mod executor;
pub mod inventory;
pub mod planner;
pub mod state;
pub mod storage;
pub mod sync;

use std::path::Path;

use anyhow::Result;

use crate::config::Config;
use crate::hymofs::HymoClient;
use crate::{config, ksu};

pub struct Init;

pub struct StorageReady {
    pub handle: storage::StorageHandle,
}

pub struct Synced {
    pub handle: storage::StorageHandle,
    pub modules: Vec<inventory::Module>,
}

pub struct Planned {
    pub handle: storage::StorageHandle,
    pub modules: Vec<inventory::Module>,
    pub plan: planner::MountPlan,
}

pub struct Executed {
    pub handle: storage::StorageHandle,
    pub modules: Vec<inventory::Module>,
    pub plan: planner::MountPlan,
    pub result: executor::ExecutionResult,
}

/// The mount pipeline as a typestate: storage, sync, plan, execute,
/// finalize. Each step consumes the engine and returns the next stage, so
/// a step cannot run before its inputs exist.
pub struct HymoEngine<'c, S> {
    config: Config,
    client: &'c HymoClient,
    state: S,
}

impl<'c> HymoEngine<'c, Init> {
    pub fn new(config: Config, client: &'c HymoClient) -> Self {
        HymoEngine {
            config,
            client,
            state: Init,
        }
    }

    pub fn init_storage(
        self,
        mnt_base: &Path,
        img_path: &Path,
    ) -> Result<HymoEngine<'c, StorageReady>> {
        let handle = storage::setup(
            mnt_base,
            img_path,
            &self.config.moduledir,
            self.config.fs_type,
            &self.config.mountsource,
            self.config.disable_umount,
        )?;

        Ok(HymoEngine {
            config: self.config,
            client: self.client,
            state: StorageReady { handle },
        })
    }
}

impl<'c> HymoEngine<'c, StorageReady> {
    /// Scan the inventory and replicate module bytes into the mirror.
    /// `skip_hot_unmounted` honours the run/hot_unmounted markers (reload).
    pub fn scan_and_sync(
        self,
        skip_hot_unmounted: bool,
        force: bool,
    ) -> Result<HymoEngine<'c, Synced>> {
        let partitions = self.config.all_partitions();
        let modes = config::load_module_modes();
        let rules = config::load_module_rules();

        let mut modules =
            inventory::scan(&self.config.moduledir, &partitions, &modes, &rules)?;
        if skip_hot_unmounted {
            modules.retain(|m| {
                let marker = Path::new(crate::defs::HOT_UNMOUNT_DIR).join(&m.id);
                if marker.exists() {
                    log::info!("Skipping hot-unmounted module: {}", m.id);
                    false
                } else {
                    true
                }
            });
        }

        log::info!(">> Inventory: {} active modules", modules.len());

        let summary =
            sync::perform_sync(&modules, &self.state.handle.mount_point, &partitions, force)?;
        if !modules.is_empty() && summary.synced == 0 && summary.failed > 0 {
            anyhow::bail!(crate::error::ErrorKind::SyncFailed);
        }

        // ext4 images keep stale labels across boots
        if self.state.handle.mode == "ext4" {
            storage::finalize_storage_permissions(&self.state.handle.mount_point);
        }

        Ok(HymoEngine {
            config: self.config,
            client: self.client,
            state: Synced {
                handle: self.state.handle,
                modules,
            },
        })
    }
}

impl<'c> HymoEngine<'c, Synced> {
    pub fn generate_plan(self, hymofs_usable: bool) -> Result<HymoEngine<'c, Planned>> {
        let partitions = self.config.all_partitions();
        let mut plan = planner::generate(
            &partitions,
            &self.state.modules,
            &self.state.handle.mount_point,
            hymofs_usable,
        )?;

        if hymofs_usable {
            planner::segregate_custom_rules(&mut plan, &self.state.handle.mount_point);
        }

        plan.print_visuals();

        Ok(HymoEngine {
            config: self.config,
            client: self.client,
            state: Planned {
                handle: self.state.handle,
                modules: self.state.modules,
                plan,
            },
        })
    }
}

impl<'c> HymoEngine<'c, Planned> {
    pub fn execute(self, hymofs_active: bool) -> Result<HymoEngine<'c, Executed>> {
        log::info!(">> Executing mount plan...");
        let partitions = self.config.all_partitions();

        let result = executor::execute(
            &self.state.plan,
            &self.config,
            self.client,
            &self.state.modules,
            &self.state.handle.mount_point,
            &partitions,
            hymofs_active,
        )?;

        Ok(HymoEngine {
            config: self.config,
            client: self.client,
            state: Executed {
                handle: self.state.handle,
                modules: self.state.modules,
                plan: self.state.plan,
                result,
            },
        })
    }
}

impl<'c> HymoEngine<'c, Executed> {
    /// Post-processing and state persistence. RuntimeState is written even
    /// on partial failure; a save error is logged but the mount still
    /// counts as succeeded.
    pub fn finalize(self, hymofs_mismatch: bool, mismatch_message: &str) -> Result<()> {
        let Executed {
            handle,
            modules,
            plan,
            result,
        } = self.state;

        if self.config.enable_stealth && self.client.is_available() {
            match self.client.fix_mounts() {
                Ok(()) => log::info!("Mount namespace fixed (mnt_id reordered)."),
                Err(e) => log::warn!("Failed to reorder mount IDs: {e:#}"),
            }
        }

        let mut nuke_active = false;
        if handle.mode == "ext4" && self.config.enable_nuke {
            log::info!(">> Scrubbing backing store traces from /sys...");
            match ksu::nuke_sysfs(&handle.mount_point) {
                Ok(()) => {
                    log::info!(">> Sysfs traces purged.");
                    nuke_active = true;
                }
                Err(e) => log::warn!("Sysfs nuke failed: {e:#}"),
            }
        }

        let partitions = self.config.all_partitions();
        let active_mounts = planner::active_partitions(&plan, &modules, &partitions);

        inventory::update_description(
            true,
            &handle.mode,
            nuke_active,
            result.overlay_module_ids.len(),
            result.magic_module_ids.len(),
            result.hymofs_module_ids.len(),
            mismatch_message,
        );

        let state = state::RuntimeState {
            pid: std::process::id(),
            storage_mode: handle.mode.clone(),
            mount_point: handle.mount_point.clone(),
            overlay_module_ids: result.overlay_module_ids,
            magic_module_ids: result.magic_module_ids,
            hymofs_module_ids: result.hymofs_module_ids,
            active_mounts,
            nuke_active,
            hymofs_mismatch,
            mismatch_message: mismatch_message.to_string(),
        };
        debug_assert!(state.strategy_sets_disjoint());

        if let Err(e) = state.save() {
            log::error!("Failed to save runtime state: {e:#}");
        }

        log::info!(
            "Plan done: {} hymofs, {} overlay, {} magic ({} failures)",
            state.hymofs_module_ids.len(),
            state.overlay_module_ids.len(),
            state.magic_module_ids.len(),
            result.stats.failures
        );
        Ok(())
    }
}
