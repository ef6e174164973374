pub mod action;
pub mod config;
pub mod init;
pub mod serve;
pub mod status;
pub mod worker;

use anyhow::Context;
use hookq_core::{ActionStore, Config, RedbStore};
use std::path::Path;
use std::sync::Arc;

/// An initialized project: its config and an open store.
pub struct Project {
    pub config: Config,
    pub store: Arc<dyn ActionStore>,
}

pub fn open_project(root: &Path) -> anyhow::Result<Project> {
    let config = Config::load(root).context("failed to load config")?;
    let path = config.store_path(root);
    let store = RedbStore::open(&path)
        .with_context(|| format!("failed to open store {}", path.display()))?;
    Ok(Project {
        config,
        store: Arc::new(store),
    })
}

pub fn parse_id(id: &str) -> anyhow::Result<uuid::Uuid> {
    uuid::Uuid::parse_str(id).with_context(|| format!("invalid action id '{id}'"))
}

/// Holder id for the `n`th scheduler in this process: `<host>-<n>`, with the
/// pid standing in when the hostname is unavailable.
pub fn holder_id(n: usize) -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| format!("pid{}", std::process::id()));
    format!("{host}-{n}")
}
