use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use stowage_core::space::{SpaceLimits, GIB};
use stowage_pipeline::ledger::SpaceConfig;
use stowage_pipeline::{CoordinatorConfig, PipelineConfig, RecoveryConfig, UploadConfig};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} has invalid value {value:?}: expected {expected}")]
    Invalid {
        name: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// Worker configuration loaded from environment variables.
///
/// Everything except the database URL and upload endpoint has a default
/// suitable for a single local volume.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub source_roots: Vec<PathBuf>,
    pub upload_endpoint: String,
    pub upload_token: Option<String>,
    /// Upper bound on items taken by one run.
    pub max_items: Option<usize>,
    /// Recipients of escalation emails.
    pub notify_emails: Vec<String>,
    pub space: SpaceConfig,
    pub pipeline: PipelineConfig,
    pub upload: UploadConfig,
    pub recovery: RecoveryConfig,
    pub coordinator: CoordinatorConfig,
}

impl WorkerConfig {
    /// Load configuration from the process environment.
    ///
    /// | Env Var                  | Default                |
    /// |--------------------------|------------------------|
    /// | `DATABASE_URL`           | required               |
    /// | `UPLOAD_ENDPOINT`        | required               |
    /// | `UPLOAD_TOKEN`           | none                   |
    /// | `WORK_DIR`               | `./data`               |
    /// | `ARCHIVE_DIR`            | `$WORK_DIR/archives`   |
    /// | `SCRATCH_DIR`            | `$WORK_DIR/scratch`    |
    /// | `SOURCE_ROOTS`           | none (comma-separated) |
    /// | `MAX_DISK_USAGE_GB`      | `80`                   |
    /// | `LOW_WATER_GB`           | `5`                    |
    /// | `SAFETY_MARGIN_PERCENT`  | `10`                   |
    /// | `ARCHIVE_PASSWORD`       | none (archives unsealed) |
    /// | `UPLOAD_WORKERS`         | `2`                    |
    /// | `UPLOAD_MAX_RETRIES`     | `5`                    |
    /// | `PIPELINE_WORKERS`       | `1`                    |
    /// | `SWEEP_INTERVAL_SECS`    | `300`                  |
    /// | `ZOMBIE_THRESHOLD_HOURS` | `24`                   |
    /// | `MAX_ITEMS`              | unlimited              |
    /// | `DELETE_SOURCE`          | `false`                |
    /// | `NOTIFY_EMAILS`          | none (comma-separated) |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an explicit variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let database_url = env.required("DATABASE_URL")?;
        let upload_endpoint = env.required("UPLOAD_ENDPOINT")?;
        let work_dir = env.path("WORK_DIR").unwrap_or_else(|| PathBuf::from("./data"));
        let archive_dir = env.path("ARCHIVE_DIR").unwrap_or_else(|| work_dir.join("archives"));
        let scratch_dir = env.path("SCRATCH_DIR").unwrap_or_else(|| work_dir.join("scratch"));

        let defaults = SpaceLimits::default();
        let limits = SpaceLimits {
            max_usage_bytes: env
                .parse::<u64>("MAX_DISK_USAGE_GB", "whole gigabytes")?
                .map_or(defaults.max_usage_bytes, |gb| gb.saturating_mul(GIB)),
            low_water_bytes: env
                .parse::<u64>("LOW_WATER_GB", "whole gigabytes")?
                .map_or(defaults.low_water_bytes, |gb| gb.saturating_mul(GIB)),
            safety_margin_percent: env
                .parse("SAFETY_MARGIN_PERCENT", "a percentage")?
                .unwrap_or(defaults.safety_margin_percent),
        };
        let space = SpaceConfig {
            limits,
            monitored_paths: vec![work_dir.clone()],
            ..SpaceConfig::default()
        };

        let pipeline = PipelineConfig {
            work_dir: work_dir.clone(),
            archive_dir,
            scratch_dir,
            password: env.get("ARCHIVE_PASSWORD"),
            ..PipelineConfig::default()
        };

        let upload_defaults = UploadConfig::default();
        let upload = UploadConfig {
            workers: env
                .parse("UPLOAD_WORKERS", "a worker count")?
                .unwrap_or(upload_defaults.workers),
            max_retries: env
                .parse("UPLOAD_MAX_RETRIES", "a retry count")?
                .unwrap_or(upload_defaults.max_retries),
            ..upload_defaults
        };

        let recovery_defaults = RecoveryConfig::default();
        let recovery = RecoveryConfig {
            sweep_interval: env
                .parse("SWEEP_INTERVAL_SECS", "seconds")?
                .map_or(recovery_defaults.sweep_interval, Duration::from_secs),
            zombie_threshold: env
                .parse::<u64>("ZOMBIE_THRESHOLD_HOURS", "hours")?
                .map_or(recovery_defaults.zombie_threshold, |h| {
                    Duration::from_secs(h.saturating_mul(3600))
                }),
            policy_overrides: HashMap::new(),
        };

        let coordinator_defaults = CoordinatorConfig::default();
        let coordinator = CoordinatorConfig {
            work_dir,
            pipeline_workers: env
                .parse("PIPELINE_WORKERS", "a worker count")?
                .unwrap_or(coordinator_defaults.pipeline_workers),
            delete_source: env
                .parse("DELETE_SOURCE", "true or false")?
                .unwrap_or(coordinator_defaults.delete_source),
            ..coordinator_defaults
        };

        Ok(Self {
            database_url,
            source_roots: env.list("SOURCE_ROOTS").into_iter().map(PathBuf::from).collect(),
            upload_endpoint,
            upload_token: env.get("UPLOAD_TOKEN"),
            max_items: env.parse("MAX_ITEMS", "an item count")?,
            notify_emails: env.list("NOTIFY_EMAILS"),
            space,
            pipeline,
            upload,
            recovery,
            coordinator,
        })
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    /// Set and non-blank.
    fn get(&self, name: &str) -> Option<String> {
        (self.0)(name)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, name: &'static str) -> Result<String, ConfigError> {
        self.get(name).ok_or(ConfigError::Missing(name))
    }

    fn path(&self, name: &str) -> Option<PathBuf> {
        self.get(name).map(PathBuf::from)
    }

    fn list(&self, name: &str) -> Vec<String> {
        self.get(name)
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn parse<T: FromStr>(&self, name: &'static str, expected: &'static str) -> Result<Option<T>, ConfigError> {
        self.get(name)
            .map(|value| {
                value.parse().map_err(|_| ConfigError::Invalid {
                    name,
                    value: value.clone(),
                    expected,
                })
            })
            .transpose()
    }
}
