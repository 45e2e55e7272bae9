//! Server configuration.
//!
//! Values are layered from `config/default.toml`, an optional `config/local.toml` and finally
//! `IMAGEQUEUE_` prefixed environment variables, with `__` separating sections, e.g.
//! `IMAGEQUEUE_SERVER__PORT=8080`.
use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use anyhow::Context;
use chrono::TimeDelta;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use imagequeue::prelude::*;
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub retention: RetentionSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Largest accepted request body.
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            upload_dir: default_upload_dir(),
            output_dir: default_output_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u16,
    /// Delay before the first retry, doubled on each further attempt.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_lease_secs")]
    pub lease_secs: u64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
    /// Upper bound on a single attempt. Unbounded when unset.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            lease_secs: default_lease_secs(),
            heartbeat_secs: default_heartbeat_secs(),
            reaper_interval_secs: default_reaper_interval_secs(),
            timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetentionSettings {
    /// Six field cron expression, seconds first.
    #[serde(default = "default_schedule")]
    pub schedule: String,
    #[serde(default = "default_completed_max_count")]
    pub completed_max_count: u32,
    #[serde(default = "default_failed_max_age_secs")]
    pub failed_max_age_secs: u64,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            schedule: default_schedule(),
            completed_max_count: default_completed_max_count(),
            failed_max_age_secs: default_failed_max_age_secs(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_owned()
}

const fn default_port() -> u16 {
    3000
}

const fn default_max_upload_bytes() -> usize {
    20 * 1024 * 1024
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

const fn default_workers() -> usize {
    1
}

const fn default_max_attempts() -> u16 {
    JobOptions::DEFAULT_MAX_ATTEMPTS
}

const fn default_backoff_base_ms() -> u64 {
    1000
}

const fn default_lease_secs() -> u64 {
    30
}

const fn default_heartbeat_secs() -> u64 {
    10
}

const fn default_reaper_interval_secs() -> u64 {
    5
}

fn default_schedule() -> String {
    "0 * * * * *".to_owned()
}

const fn default_completed_max_count() -> u32 {
    PruneSpec::DEFAULT_COMPLETED_MAX_COUNT
}

const fn default_failed_max_age_secs() -> u64 {
    24 * 60 * 60
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let figment = Figment::new()
            .merge(Toml::file("config/default.toml"))
            .merge(Toml::file("config/local.toml"))
            .merge(Env::prefixed("IMAGEQUEUE_").split("__"));
        Self::from_figment(figment)
    }

    pub fn from_figment(figment: Figment) -> anyhow::Result<Self> {
        let config: Self = figment
            .extract()
            .context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// A worker must renew its lease before the reaper can hand the job to someone else.
    fn validate(&self) -> anyhow::Result<()> {
        let QueueConfig {
            lease_secs,
            heartbeat_secs,
            ..
        } = self.queue;
        anyhow::ensure!(lease_secs > 0, "queue.lease_secs must be at least 1");
        anyhow::ensure!(heartbeat_secs > 0, "queue.heartbeat_secs must be at least 1");
        anyhow::ensure!(
            heartbeat_secs < lease_secs,
            "queue.heartbeat_secs ({heartbeat_secs}) must be shorter than queue.lease_secs ({lease_secs})"
        );
        Ok(())
    }

    pub fn addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.server.host, self.server.port)
            .parse()
            .with_context(|| format!("Invalid listen address {}", self.server.host))
    }

    pub fn job_options(&self) -> JobOptions {
        let base = TimeDelta::milliseconds(saturating_i64(self.queue.backoff_base_ms));
        JobOptions::default()
            .with_max_attempts(self.queue.max_attempts)
            .with_backoff(BackoffStrategy::exponential(base))
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig::default()
            .with_concurrency(self.queue.workers.max(1))
            .with_timeout(self.queue.timeout_secs.map(Duration::from_secs))
            .with_heartbeat_interval(Duration::from_secs(self.queue.heartbeat_secs))
    }

    pub fn lease(&self) -> TimeDelta {
        TimeDelta::seconds(saturating_i64(self.queue.lease_secs))
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.queue.reaper_interval_secs)
    }

    pub fn retention_config(&self) -> anyhow::Result<RetentionConfig> {
        let schedule = cron::Schedule::from_str(&self.retention.schedule).with_context(|| {
            format!("Invalid retention schedule {:?}", self.retention.schedule)
        })?;
        let max_age = TimeDelta::seconds(saturating_i64(self.retention.failed_max_age_secs));
        Ok(RetentionConfig::new(schedule)
            .with_pruner(PruneSpec::max_length(
                self.retention.completed_max_count,
                JobStatus::Completed,
            ))
            .with_pruner(PruneSpec::max_age(max_age, JobStatus::Failed)))
    }
}

// Keeps huge configured values inside the range `TimeDelta` accepts without panicking.
fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX).min(i64::MAX / 1000 / 1000)
}
