use crate::output::print_json;
use anyhow::Context;
use clap::Subcommand;
use hookq_core::config::{Config, WarnLevel};
use std::path::Path;

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Print the effective configuration (defaults filled in)
    Show,

    /// Validate the config for common mistakes
    Validate,
}

pub fn run(root: &Path, subcmd: ConfigSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ConfigSubcommand::Show => show(root, json),
        ConfigSubcommand::Validate => validate(root, json),
    }
}

fn show(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    if json {
        return print_json(&config);
    }
    print!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}

fn validate(root: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let mut warnings = config.validate();
    warnings.sort_by_key(|w| w.level != WarnLevel::Error);
    let errors = warnings
        .iter()
        .filter(|w| w.level == WarnLevel::Error)
        .count();

    if json {
        print_json(&serde_json::json!({ "warnings": warnings, "errors": errors }))?;
    } else if warnings.is_empty() {
        println!("Config is valid.");
    } else {
        for w in &warnings {
            let tag = if w.level == WarnLevel::Error { "error" } else { "warning" };
            println!("[{tag}] {}", w.message);
        }
        println!(
            "{errors} error(s), {} warning(s)",
            warnings.len() - errors
        );
    }

    if errors > 0 {
        anyhow::bail!("{errors} config error(s)");
    }
    Ok(())
}
