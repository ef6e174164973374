use crate::action::validate_hook_name;
use crate::error::{HookqError, Result};
use crate::paths;
use crate::retry::{RetryPolicy, MAX_DELAY_SECS};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// StoreConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Relative paths resolve against the project root.
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from(paths::DEFAULT_STORE_FILE)
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Per-execution budget for hooks without their own `timeout_secs`.
    #[serde(default = "default_execution_budget_secs")]
    pub execution_budget_secs: u64,
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_batch_size() -> usize {
    25
}

fn default_lease_secs() -> u64 {
    300
}

fn default_tick_interval_ms() -> u64 {
    1000
}

fn default_execution_budget_secs() -> u64 {
    60
}

fn default_workers() -> usize {
    1
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            lease_secs: default_lease_secs(),
            tick_interval_ms: default_tick_interval_ms(),
            execution_budget_secs: default_execution_budget_secs(),
            workers: default_workers(),
        }
    }
}

impl WorkerConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn execution_budget(&self) -> Duration {
        Duration::from_secs(self.execution_budget_secs)
    }
}

// ---------------------------------------------------------------------------
// RetentionConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Days to keep finished actions; 0 keeps them forever.
    #[serde(default = "default_completed_days")]
    pub completed_days: u32,
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,
}

fn default_completed_days() -> u32 {
    30
}

fn default_purge_interval_secs() -> u64 {
    3600
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            completed_days: default_completed_days(),
            purge_interval_secs: default_purge_interval_secs(),
        }
    }
}

impl RetentionConfig {
    pub fn window(&self) -> Option<chrono::Duration> {
        (self.completed_days > 0).then(|| chrono::Duration::days(self.completed_days as i64))
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }
}

// ---------------------------------------------------------------------------
// HookConfig
// ---------------------------------------------------------------------------

/// A hook backed by an external command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookConfig {
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub hooks: BTreeMap<String, HookConfig>,
}

fn default_version() -> u32 {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            store: StoreConfig::default(),
            worker: WorkerConfig::default(),
            retry: RetryPolicy::default(),
            retention: RetentionConfig::default(),
            hooks: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(HookqError::NotInitialized);
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    pub fn store_path(&self, root: &Path) -> PathBuf {
        paths::store_path(root, &self.store.path)
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut error = |message: String| {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message,
            })
        };

        if self.worker.batch_size == 0 {
            error("worker.batch_size is 0; no action would ever be claimed".into());
        }
        if self.worker.lease_secs == 0 {
            error("worker.lease_secs is 0; every claim would expire immediately".into());
        }
        if self.retry.max_attempts == 0 {
            error("retry.max_attempts must be at least 1".into());
        }
        for (field, secs) in [
            ("retry.base_delay_secs", self.retry.base_delay_secs),
            ("retry.max_delay_secs", self.retry.max_delay_secs),
        ] {
            if secs > MAX_DELAY_SECS {
                error(format!("{field} ({secs}) exceeds the one-year limit of {MAX_DELAY_SECS}"));
            }
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            error(format!("retry.jitter {} is outside 0..=1", self.retry.jitter));
        }
        for (name, hook) in &self.hooks {
            if validate_hook_name(name).is_err() {
                error(format!("hook name '{name}' is not a valid hook name"));
            }
            if hook.command.trim().is_empty() {
                error(format!("hook '{name}' has an empty command"));
            }
        }

        let mut warn = |message: String| {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message,
            })
        };

        if self.worker.lease_secs > 0 && self.worker.lease_secs <= self.worker.execution_budget_secs {
            warn(format!(
                "worker.lease_secs ({}) should exceed worker.execution_budget_secs ({}); \
                 the lease is renewed per action but may still expire while one runs",
                self.worker.lease_secs, self.worker.execution_budget_secs
            ));
        }
        if self.retry.multiplier < 1.0 {
            warn(format!(
                "retry.multiplier {} is below 1; delays will not grow",
                self.retry.multiplier
            ));
        }
        if self.retry.base_delay_secs > self.retry.max_delay_secs {
            warn(format!(
                "retry.base_delay_secs ({}) exceeds retry.max_delay_secs ({})",
                self.retry.base_delay_secs, self.retry.max_delay_secs
            ));
        }
        for (name, hook) in &self.hooks {
            if let Some(timeout) = hook.timeout_secs {
                if timeout >= self.worker.lease_secs && self.worker.lease_secs > 0 {
                    warn(format!(
                        "hook '{name}' timeout_secs ({timeout}) is not shorter than worker.lease_secs ({})",
                        self.worker.lease_secs
                    ));
                }
            }
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_config_roundtrip() {
        let cfg = Config::default();
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.worker.batch_size, 25);
        assert_eq!(parsed.store.path, PathBuf::from(".hookq/actions.redb"));
        assert!(parsed.hooks.is_empty());
    }

    #[test]
    fn empty_yaml_uses_defaults() {
        let cfg: Config = serde_yaml::from_str("version: 1\n").unwrap();
        assert_eq!(cfg.worker.lease_secs, 300);
        assert_eq!(cfg.retry.max_attempts, 3);
        assert_eq!(cfg.retention.completed_days, 30);
    }

    #[test]
    fn hooks_parse() {
        let yaml = r#"
hooks:
  send-digest:
    command: ./scripts/digest.sh
    args: ["--daily"]
    timeout_secs: 120
  ping:
    command: /bin/true
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.hooks.len(), 2);
        let digest = &cfg.hooks["send-digest"];
        assert_eq!(digest.args, vec!["--daily".to_string()]);
        assert_eq!(digest.timeout_secs, Some(120));
        assert_eq!(cfg.hooks["ping"].command, "/bin/true");
    }

    #[test]
    fn load_missing_is_not_initialized() {
        let dir = TempDir::new().unwrap();
        let err = Config::load(dir.path()).unwrap_err();
        assert!(matches!(err, HookqError::NotInitialized));
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let mut cfg = Config::default();
        cfg.worker.batch_size = 7;
        cfg.save(dir.path()).unwrap();
        let loaded = Config::load(dir.path()).unwrap();
        assert_eq!(loaded.worker.batch_size, 7);
    }

    #[test]
    fn store_path_is_rooted() {
        let cfg = Config::default();
        assert_eq!(
            cfg.store_path(Path::new("/srv/app")),
            PathBuf::from("/srv/app/.hookq/actions.redb")
        );
    }

    #[test]
    fn validate_default_config_no_warnings() {
        assert!(Config::default().validate().is_empty());
    }

    #[test]
    fn validate_flags_broken_settings() {
        let mut cfg = Config::default();
        cfg.worker.batch_size = 0;
        cfg.retry.jitter = 1.5;
        cfg.hooks.insert(
            "bad name".into(),
            HookConfig {
                command: " ".into(),
                args: vec![],
                timeout_secs: None,
            },
        );
        let warnings = cfg.validate();
        let errors: Vec<_> = warnings
            .iter()
            .filter(|w| w.level == WarnLevel::Error)
            .collect();
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|w| w.message.contains("batch_size")));
        assert!(errors.iter().any(|w| w.message.contains("jitter")));
    }

    #[test]
    fn validate_warns_on_short_lease() {
        let mut cfg = Config::default();
        cfg.worker.lease_secs = 30;
        cfg.worker.execution_budget_secs = 60;
        let warnings = cfg.validate();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].level, WarnLevel::Warning);
        assert!(warnings[0].message.contains("lease_secs"));
    }

    #[test]
    fn validate_bounds_retry_delays() {
        let mut cfg = Config::default();
        cfg.retry.max_delay_secs = u64::MAX;
        let warnings = cfg.validate();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].level, WarnLevel::Error);
        assert!(warnings[0].message.contains("retry.max_delay_secs"));

        cfg.retry.max_delay_secs = MAX_DELAY_SECS;
        assert!(cfg.validate().is_empty());
    }

    #[test]
    fn retention_zero_disables_window() {
        let mut r = RetentionConfig::default();
        assert_eq!(r.window(), Some(chrono::Duration::days(30)));
        r.completed_days = 0;
        assert!(r.window().is_none());
    }
}
