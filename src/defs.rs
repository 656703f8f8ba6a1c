// hymod/src/defs.rs

// Hymo Mount Core Constants

// The base directory for config, logs and backing images
pub const BASE_DIR: &str = "/data/adb/hymo/";

// Runtime state directory (hot-unmount markers, stats snapshots)
pub const RUN_DIR: &str = "/data/adb/hymo/run/";
pub const HOT_UNMOUNT_DIR: &str = "/data/adb/hymo/run/hot_unmounted/";
pub const STATE_FILE: &str = "/data/adb/hymo/daemon_state.json";
pub const MOUNT_STATS_FILE: &str = "/data/adb/hymo/run/mount_stats.json";

// Log file path (must match WebUI)
pub const DAEMON_LOG_FILE: &str = "/data/adb/hymo/daemon.log";

// Configuration files
pub const CONFIG_FILE: &str = "/data/adb/hymo/config.json";
pub const MODULE_MODE_FILE: &str = "/data/adb/hymo/module_mode.conf";
pub const MODULE_RULES_FILE: &str = "/data/adb/hymo/module_rules.conf";
pub const USER_HIDE_FILE: &str = "/data/adb/hymo/user_hide.json";

// Backing store images; the erofs sibling derives from the ext4 name
pub const EXT4_IMAGE: &str = "/data/adb/hymo/modules.img";
#[allow(dead_code)]
pub const EROFS_IMAGE: &str = "/data/adb/hymo/modules.erofs";

// Default mirror mount point when neither mirror_path nor tempdir is set
pub const HYMO_MIRROR_DEV: &str = "/dev/hymo_mirror";

// Legacy-path content mount point
pub const FALLBACK_CONTENT_DIR: &str = "/data/adb/hymo/mnt/";

// Module discovery
pub const DEFAULT_MODULE_DIR: &str = "/data/adb/modules";
pub const MANAGER_ID: &str = "hymo";

// Markers
pub const DISABLE_FILE_NAME: &str = "disable";
pub const REMOVE_FILE_NAME: &str = "remove";
pub const SKIP_MOUNT_FILE_NAME: &str = "skip_mount";
pub const REPLACE_DIR_FILE_NAME: &str = ".replace";
#[allow(dead_code)]
pub const REPLACE_DIR_XATTR: &str = "trusted.overlay.opaque";

// Mount source label fallback
pub const DEFAULT_MOUNT_SOURCE: &str = "KSU";

// Segregation directory for rule-pinned sources inside the mirror
pub const OVERLAY_STAGING_DIR: &str = ".overlay_staging";

// Module Prop Path (for dynamic description updates)
pub const MODULE_PROP_FILE: &str = "/data/adb/modules/hymo/module.prop";

// LKM binaries installed by the packaging step
pub const MODULE_LKM_DIR: &str = "/data/adb/modules/hymo/lkm/binaries";

// Standard Android partitions to check
pub const BUILTIN_PARTITIONS: &[&str] = &["system", "vendor", "product", "system_ext", "odm", "oem"];
