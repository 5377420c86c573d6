//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

pub use cli::{
    CliArgs, Command, DomainArgs, DomainCommand, DomainTarget, GlobalOverrides, ResolveArgs,
};

use std::{
    num::{NonZeroU32, NonZeroU64},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::{CacheConfig, CacheRatios};
use crate::domain::entities::normalize_domain;
use crate::domain::types::FederationMode;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "fedcache";
const DEFAULT_HOST: &str = "localhost";
const DEFAULT_DB_MAX_CONNECTIONS: u32 = 8;
const DEFAULT_FRESHNESS_HOURS: u64 = 6;
const DEFAULT_FORCED_FRESHNESS_MINUTES: u64 = 5;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MAX_DOCUMENT_BYTES: u64 = 1024 * 1024;
const DEFAULT_FEDERATOR_CONCURRENCY: u32 = 4;
const DEFAULT_QUEUE_CAPACITY: u32 = 1024;
const DEFAULT_MEDIA_DIR: &str = "media";
const DEFAULT_MEDIA_MAX_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub database: DatabaseSettings,
    pub cache: CacheSettings,
    pub federation: FederationSettings,
    pub workers: WorkerSettings,
    pub media: MediaSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct DatabaseSettings {
    /// `None` keeps all state in memory.
    pub url: Option<String>,
    pub max_connections: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub memory_target_bytes: u64,
    pub negative_ttl_ms: u64,
    pub ratios: CacheRatios,
}

#[derive(Debug, Clone)]
pub struct FederationSettings {
    /// Host this server is reachable at, punycode-normalised.
    pub host: String,
    /// Domain in local account handles; defaults to `host`.
    pub account_domain: String,
    pub mode: FederationMode,
    pub freshness: Duration,
    pub forced_freshness: Duration,
    pub request_timeout: Duration,
    pub user_agent: String,
    pub max_document_bytes: NonZeroU64,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub federator_concurrency: NonZeroU32,
    pub queue_capacity: NonZeroU32,
}

#[derive(Debug, Clone)]
pub struct MediaSettings {
    pub directory: PathBuf,
    /// Prefix of public media URLs; defaults to `https://{host}/media`.
    pub public_base: String,
    pub max_bytes: NonZeroU64,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("FEDCACHE").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(&cli.overrides);

    Settings::from_raw(raw)
}

pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    database: RawDatabaseSettings,
    cache: RawCacheSettings,
    federation: RawFederationSettings,
    workers: RawWorkerSettings,
    media: RawMediaSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &GlobalOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.database_url.as_ref() {
            self.database.url = Some(url.clone());
        }
        if overrides.ephemeral {
            self.database.url = None;
        }
        if let Some(host) = overrides.federation_host.as_ref() {
            self.federation.host = Some(host.clone());
        }
        if let Some(mode) = overrides.federation_mode.as_ref() {
            self.federation.mode = Some(mode.clone());
        }
        if let Some(bytes) = overrides.cache_memory_target_bytes {
            self.cache.memory_target_bytes = Some(bytes);
        }
        if let Some(directory) = overrides.media_directory.as_ref() {
            self.media.directory = Some(directory.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            database,
            cache,
            federation,
            workers,
            media,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let database = build_database_settings(database)?;
        let cache = build_cache_settings(cache)?;
        let federation = build_federation_settings(federation)?;
        let workers = build_worker_settings(workers)?;
        let media = build_media_settings(media, &federation.host)?;

        Ok(Self {
            logging,
            database,
            cache,
            federation,
            workers,
            media,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_database_settings(database: RawDatabaseSettings) -> Result<DatabaseSettings, LoadError> {
    let url = database.url.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    let max_connections = non_zero_u32(
        database
            .max_connections
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS)
            .into(),
        "database.max_connections",
    )?;

    Ok(DatabaseSettings {
        url,
        max_connections,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let defaults = CacheConfig::default();
    let memory_target_bytes = cache
        .memory_target_bytes
        .unwrap_or(defaults.memory_target_bytes);
    if memory_target_bytes == 0 {
        return Err(LoadError::invalid(
            "cache.memory_target_bytes",
            "must be greater than zero",
        ));
    }

    let ratios = cache.ratios;
    let named = [
        ("cache.ratios.account", ratios.account),
        ("cache.ratios.follow", ratios.follow),
        ("cache.ratios.block", ratios.block),
        ("cache.ratios.list_entry", ratios.list_entry),
        ("cache.ratios.emoji", ratios.emoji),
        ("cache.ratios.media", ratios.media),
        ("cache.ratios.status", ratios.status),
        ("cache.ratios.relationship_flags", ratios.relationship_flags),
    ];
    if let Some((key, value)) = named.iter().copied().find(|(_, value)| !value.is_finite()) {
        return Err(LoadError::invalid(key, format!("`{value}` is not a finite number")));
    }

    Ok(CacheSettings {
        memory_target_bytes,
        negative_ttl_ms: cache.negative_ttl_ms.unwrap_or(defaults.negative_ttl_ms),
        ratios,
    })
}

fn build_federation_settings(
    federation: RawFederationSettings,
) -> Result<FederationSettings, LoadError> {
    let host = normalize_domain(federation.host.as_deref().unwrap_or(DEFAULT_HOST))
        .map_err(|err| LoadError::invalid("federation.host", err.to_string()))?;
    let account_domain = match federation.account_domain.as_deref() {
        Some(domain) if !domain.trim().is_empty() => normalize_domain(domain)
            .map_err(|err| LoadError::invalid("federation.account_domain", err.to_string()))?,
        _ => host.clone(),
    };

    let mode = match federation.mode.as_deref() {
        Some(mode) => FederationMode::from_str(mode)
            .map_err(|err| LoadError::invalid("federation.mode", err.to_string()))?,
        None => FederationMode::default(),
    };

    let freshness_hours = federation
        .freshness_hours
        .unwrap_or(DEFAULT_FRESHNESS_HOURS);
    if freshness_hours == 0 {
        return Err(LoadError::invalid(
            "federation.freshness_hours",
            "must be greater than zero",
        ));
    }
    let forced_minutes = federation
        .forced_freshness_minutes
        .unwrap_or(DEFAULT_FORCED_FRESHNESS_MINUTES);
    if forced_minutes == 0 {
        return Err(LoadError::invalid(
            "federation.forced_freshness_minutes",
            "must be greater than zero",
        ));
    }
    let timeout_secs = federation
        .request_timeout_secs
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);
    if timeout_secs == 0 {
        return Err(LoadError::invalid(
            "federation.request_timeout_secs",
            "must be greater than zero",
        ));
    }

    let user_agent = federation
        .user_agent
        .filter(|agent| !agent.trim().is_empty())
        .unwrap_or_else(|| {
            format!(
                "fedcache/{} (+https://{host}/)",
                env!("CARGO_PKG_VERSION")
            )
        });

    let max_document_bytes = NonZeroU64::new(
        federation
            .max_document_bytes
            .unwrap_or(DEFAULT_MAX_DOCUMENT_BYTES),
    )
    .ok_or_else(|| {
        LoadError::invalid("federation.max_document_bytes", "must be greater than zero")
    })?;

    Ok(FederationSettings {
        host,
        account_domain,
        mode,
        freshness: Duration::from_secs(freshness_hours * 60 * 60),
        forced_freshness: Duration::from_secs(forced_minutes * 60),
        request_timeout: Duration::from_secs(timeout_secs),
        user_agent,
        max_document_bytes,
    })
}

fn build_worker_settings(workers: RawWorkerSettings) -> Result<WorkerSettings, LoadError> {
    let concurrency = workers
        .federator_concurrency
        .unwrap_or(DEFAULT_FEDERATOR_CONCURRENCY);
    let capacity = workers.queue_capacity.unwrap_or(DEFAULT_QUEUE_CAPACITY);

    Ok(WorkerSettings {
        federator_concurrency: non_zero_u32(concurrency.into(), "workers.federator_concurrency")?,
        queue_capacity: non_zero_u32(capacity.into(), "workers.queue_capacity")?,
    })
}

fn build_media_settings(media: RawMediaSettings, host: &str) -> Result<MediaSettings, LoadError> {
    let directory = media
        .directory
        .unwrap_or_else(|| PathBuf::from(DEFAULT_MEDIA_DIR));
    if directory.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "media.directory",
            "path must not be empty",
        ));
    }

    let public_base = media
        .public_base
        .filter(|base| !base.trim().is_empty())
        .unwrap_or_else(|| format!("https://{host}/media"));
    url::Url::parse(&public_base)
        .map_err(|err| LoadError::invalid("media.public_base", err.to_string()))?;

    let max_bytes = NonZeroU64::new(media.max_bytes.unwrap_or(DEFAULT_MEDIA_MAX_BYTES))
        .ok_or_else(|| LoadError::invalid("media.max_bytes", "must be greater than zero"))?;

    Ok(MediaSettings {
        directory,
        public_base,
        max_bytes,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatabaseSettings {
    url: Option<String>,
    max_connections: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    memory_target_bytes: Option<u64>,
    negative_ttl_ms: Option<u64>,
    ratios: CacheRatios,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawFederationSettings {
    host: Option<String>,
    account_domain: Option<String>,
    mode: Option<String>,
    freshness_hours: Option<u64>,
    forced_freshness_minutes: Option<u64>,
    request_timeout_secs: Option<u64>,
    user_agent: Option<String>,
    max_document_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawWorkerSettings {
    federator_concurrency: Option<u32>,
    queue_capacity: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawMediaSettings {
    directory: Option<PathBuf>,
    public_base: Option<String>,
    max_bytes: Option<u64>,
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

#[cfg(test)]
mod tests;
