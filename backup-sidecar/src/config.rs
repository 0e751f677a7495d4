//! Configuration management for the backup sidecar.
//!
//! Settings come from the environment (optionally seeded from a `.env` file)
//! and an optional TOML/JSON/YAML file passed on the command line. Keys in a
//! file are the lower-case form of the environment names (`backup_interval`,
//! `discord_auth_roles`, ...). Environment values override the file.
//!
//! The raw settings are validated once into an immutable [`Config`].

use crate::scheduler::interval::Interval;
use crate::scheduler::RECENT_OUTCOMES;
use crate::utils::errors::ConfigError;
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Raw, unvalidated settings as read from the sources.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RawSettings {
    pub data_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub backup_interval: String,
    pub archive_check_interval: String,
    pub retention: i64,
    pub archive: i64,
    pub archive_mode: String,
    pub gdrive_id: String,
    pub gdrive_token_path: PathBuf,
    pub artifact_prefix: String,
    pub compression_level: i32,
    pub snapshot_exclude: String,
    pub discord_bot_token: Option<String>,
    pub discord_webhook_url: Option<String>,
    pub discord_auth_roles: Option<String>,
    pub discord_command_prefix: String,
    pub discord_notify_channel_id: Option<String>,
    pub control_kind: String,
    pub rcon_address: String,
    pub rcon_password: Option<String>,
    pub container_name: String,
    pub docker_pause_command: String,
    pub docker_resume_command: String,
    pub quiesce_timeout_secs: u64,
    pub upload_max_attempts: u32,
    pub upload_initial_backoff_ms: u64,
    pub upload_max_backoff_ms: u64,
    pub upload_attempt_timeout_secs: u64,
    pub health_port: u16,
    pub health_failure_window: usize,
    pub log_level: String,
}

impl Default for RawSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            backup_dir: PathBuf::from("./backup"),
            backup_interval: "30M".to_string(),
            archive_check_interval: "1H".to_string(),
            retention: 5,
            archive: 7,
            archive_mode: "replace".to_string(),
            gdrive_id: "root".to_string(),
            gdrive_token_path: PathBuf::from("./token.json"),
            artifact_prefix: "MineCraftBackup".to_string(),
            compression_level: 3,
            snapshot_exclude: "session.lock".to_string(),
            discord_bot_token: None,
            discord_webhook_url: None,
            discord_auth_roles: None,
            discord_command_prefix: "!".to_string(),
            discord_notify_channel_id: None,
            control_kind: "rcon".to_string(),
            rcon_address: "127.0.0.1:25575".to_string(),
            rcon_password: None,
            container_name: "mc-br".to_string(),
            docker_pause_command: "send-command save hold".to_string(),
            docker_resume_command: "send-command save resume".to_string(),
            quiesce_timeout_secs: 10,
            upload_max_attempts: 5,
            upload_initial_backoff_ms: 2000,
            upload_max_backoff_ms: 60_000,
            upload_attempt_timeout_secs: 600,
            health_port: 8080,
            health_failure_window: 3,
            log_level: "info".to_string(),
        }
    }
}

/// A value that must never end up in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub paths: PathsConfig,
    pub schedule: ScheduleConfig,
    pub retention: RetentionConfig,
    pub remote: RemoteConfig,
    pub snapshot: SnapshotConfig,
    pub discord: DiscordConfig,
    pub control: ControlConfig,
    pub upload: UploadConfig,
    pub health: HealthConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct PathsConfig {
    /// Live data volume to back up
    pub data_dir: PathBuf,

    /// Staging directory for artifacts and `index.json`
    pub backup_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    pub interval: Interval,
    pub archive_check: Interval,
}

/// What happens to older archives in remote storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveMode {
    /// Keep only the newest archive.
    Replace,
    /// Never delete archives.
    Accumulate,
}

#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub keep_count: usize,
    pub archive_every_days: u32,
    pub archive_mode: ArchiveMode,
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub folder_id: String,
    pub token_path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SnapshotConfig {
    pub prefix: String,
    pub compression_level: i32,
    /// File names containing any of these are left out of the archive
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct DiscordConfig {
    pub bot_token: Secret,
    pub webhook_url: Secret,
    /// Discord role ids allowed to run commands
    pub auth_roles: HashSet<String>,
    pub command_prefix: String,
    pub notify_channel_id: Option<String>,
}

#[derive(Debug, Clone)]
pub enum ControlKind {
    Rcon {
        address: String,
        password: Secret,
    },
    Docker {
        container: String,
        pause: Vec<String>,
        resume: Vec<String>,
    },
    None,
}

#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub kind: ControlKind,
    pub quiesce_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub attempt_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub port: u16,
    pub failure_window: usize,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: String,
}

impl Config {
    /// Load `.env`, then the optional file, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Err(e) = dotenvy::dotenv() {
            if !e.not_found() {
                return Err(ConfigError::Invalid(format!(".env: {}", e)));
            }
        }
        let raw = Self::read_sources(path, true)?;
        Self::from_raw(raw)
    }

    fn read_sources(path: Option<&Path>, include_env: bool) -> Result<RawSettings, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        if include_env {
            builder = builder.add_source(config::Environment::default());
        }
        Ok(builder.build()?.try_deserialize()?)
    }

    /// Validate raw settings.
    pub fn from_raw(raw: RawSettings) -> Result<Self, ConfigError> {
        let invalid = |msg: String| ConfigError::Invalid(msg);

        if raw.retention <= 0 {
            return Err(invalid(format!(
                "RETENTION must be a positive integer, got {}",
                raw.retention
            )));
        }
        if raw.archive <= 0 || raw.archive > u32::MAX as i64 {
            return Err(invalid(format!(
                "ARCHIVE must be a positive number of days, got {}",
                raw.archive
            )));
        }

        let interval: Interval = raw
            .backup_interval
            .parse()
            .map_err(|e| invalid(format!("BACKUP_INTERVAL: {}", e)))?;
        let archive_check: Interval = raw
            .archive_check_interval
            .parse()
            .map_err(|e| invalid(format!("ARCHIVE_CHECK_INTERVAL: {}", e)))?;

        let archive_mode = match raw.archive_mode.trim().to_ascii_lowercase().as_str() {
            "replace" => ArchiveMode::Replace,
            "accumulate" => ArchiveMode::Accumulate,
            other => {
                return Err(invalid(format!(
                    "ARCHIVE_MODE must be 'replace' or 'accumulate', got {:?}",
                    other
                )))
            }
        };

        if !(1..=22).contains(&raw.compression_level) {
            return Err(invalid(format!(
                "COMPRESSION_LEVEL must be within 1..=22, got {}",
                raw.compression_level
            )));
        }
        if raw.artifact_prefix.trim().is_empty() {
            return Err(invalid("ARTIFACT_PREFIX must not be empty".to_string()));
        }

        let bot_token = required_secret(raw.discord_bot_token, "DISCORD_BOT_TOKEN")?;
        let webhook_url = required_secret(raw.discord_webhook_url, "DISCORD_WEBHOOK_URL")?;
        let auth_roles = parse_roles(raw.discord_auth_roles.as_deref().unwrap_or(""));
        if auth_roles.is_empty() {
            return Err(invalid("DISCORD_AUTH_ROLES must name at least one role".to_string()));
        }
        if raw.discord_command_prefix.is_empty() {
            return Err(invalid("DISCORD_COMMAND_PREFIX must not be empty".to_string()));
        }

        let kind = match raw.control_kind.trim().to_ascii_lowercase().as_str() {
            "rcon" => ControlKind::Rcon {
                address: raw.rcon_address,
                password: required_secret(raw.rcon_password, "RCON_PASSWORD")?,
            },
            "docker" => ControlKind::Docker {
                container: raw.container_name,
                pause: split_command(&raw.docker_pause_command, "DOCKER_PAUSE_COMMAND")?,
                resume: split_command(&raw.docker_resume_command, "DOCKER_RESUME_COMMAND")?,
            },
            "none" => ControlKind::None,
            other => {
                return Err(invalid(format!(
                    "CONTROL_KIND must be one of rcon, docker, none; got {:?}",
                    other
                )))
            }
        };
        if raw.quiesce_timeout_secs == 0 {
            return Err(invalid("QUIESCE_TIMEOUT_SECS must be positive".to_string()));
        }

        if raw.upload_max_attempts == 0 {
            return Err(invalid("UPLOAD_MAX_ATTEMPTS must be at least 1".to_string()));
        }
        if raw.upload_initial_backoff_ms > raw.upload_max_backoff_ms {
            return Err(invalid(
                "UPLOAD_INITIAL_BACKOFF_MS must not exceed UPLOAD_MAX_BACKOFF_MS".to_string(),
            ));
        }
        if raw.upload_attempt_timeout_secs == 0 {
            return Err(invalid("UPLOAD_ATTEMPT_TIMEOUT_SECS must be positive".to_string()));
        }
        if raw.health_failure_window == 0 || raw.health_failure_window > RECENT_OUTCOMES {
            return Err(invalid(format!(
                "HEALTH_FAILURE_WINDOW must be within 1..={}, got {}",
                RECENT_OUTCOMES, raw.health_failure_window
            )));
        }

        Ok(Config {
            paths: PathsConfig {
                data_dir: raw.data_dir,
                backup_dir: raw.backup_dir,
            },
            schedule: ScheduleConfig {
                interval,
                archive_check,
            },
            retention: RetentionConfig {
                keep_count: raw.retention as usize,
                archive_every_days: raw.archive as u32,
                archive_mode,
            },
            remote: RemoteConfig {
                folder_id: raw.gdrive_id,
                token_path: raw.gdrive_token_path,
            },
            snapshot: SnapshotConfig {
                prefix: raw.artifact_prefix,
                compression_level: raw.compression_level,
                exclude: split_list(&raw.snapshot_exclude).collect(),
            },
            discord: DiscordConfig {
                bot_token,
                webhook_url,
                auth_roles,
                command_prefix: raw.discord_command_prefix,
                notify_channel_id: raw.discord_notify_channel_id.filter(|s| !s.trim().is_empty()),
            },
            control: ControlConfig {
                kind,
                quiesce_timeout: Duration::from_secs(raw.quiesce_timeout_secs),
            },
            upload: UploadConfig {
                max_attempts: raw.upload_max_attempts,
                initial_backoff: Duration::from_millis(raw.upload_initial_backoff_ms),
                max_backoff: Duration::from_millis(raw.upload_max_backoff_ms),
                attempt_timeout: Duration::from_secs(raw.upload_attempt_timeout_secs),
            },
            health: HealthConfig {
                port: raw.health_port,
                failure_window: raw.health_failure_window,
            },
            log: LogConfig {
                level: raw.log_level,
            },
        })
    }
}

fn required_secret(value: Option<String>, key: &str) -> Result<Secret, ConfigError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(Secret::new(v.trim())),
        _ => Err(ConfigError::Invalid(format!("{} is required", key))),
    }
}

fn split_list(value: &str) -> impl Iterator<Item = String> + '_ {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn parse_roles(value: &str) -> HashSet<String> {
    split_list(value).collect()
}

fn split_command(value: &str, key: &str) -> Result<Vec<String>, ConfigError> {
    let parts: Vec<String> = value.split_whitespace().map(str::to_string).collect();
    if parts.is_empty() {
        return Err(ConfigError::Invalid(format!("{} must not be empty", key)));
    }
    Ok(parts)
}
