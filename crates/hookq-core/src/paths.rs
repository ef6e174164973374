use std::path::{Path, PathBuf};

pub const HOOKQ_DIR: &str = ".hookq";
pub const CONFIG_FILE: &str = ".hookq/config.yaml";
pub const DEFAULT_STORE_FILE: &str = ".hookq/actions.redb";

pub fn hookq_dir(root: &Path) -> PathBuf {
    root.join(HOOKQ_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

/// Resolve a configured store path; relative paths are relative to `root`.
pub fn store_path(root: &Path, configured: &Path) -> PathBuf {
    if configured.is_absolute() {
        configured.to_path_buf()
    } else {
        root.join(configured)
    }
}
