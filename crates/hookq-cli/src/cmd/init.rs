use crate::output::print_json;
use anyhow::Context;
use hookq_core::{io, paths, Config, RedbStore};
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let dir = paths::hookq_dir(root);
    io::ensure_dir(&dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let config_path = paths::config_path(root);
    let config_created = !config_path.exists();
    let config = if config_created {
        let cfg = Config::default();
        cfg.save(root).context("failed to write config.yaml")?;
        cfg
    } else {
        Config::load(root).context("failed to load existing config.yaml")?
    };

    let store_path = config.store_path(root);
    let store_created = !store_path.exists();
    RedbStore::open(&store_path)
        .with_context(|| format!("failed to create store {}", store_path.display()))?;

    if json {
        return print_json(&serde_json::json!({
            "root": root,
            "config": config_path,
            "config_created": config_created,
            "store": store_path,
            "store_created": store_created,
        }));
    }

    println!("Initializing hookq in: {}", root.display());
    let label = |created: bool| if created { "created:" } else { "exists: " };
    println!("  {} {}", label(config_created), paths::CONFIG_FILE);
    println!("  {} {}", label(store_created), config.store.path.display());
    println!("\nNext: add hooks to {} and run `hookq enqueue <hook>`", paths::CONFIG_FILE);
    Ok(())
}
