use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the fedcache binary.
#[derive(Debug, Parser)]
#[command(
    name = "fedcache",
    version,
    about = "Entity cache and remote-account dereferencer"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "FEDCACHE_CONFIG_FILE",
        value_name = "PATH",
        value_hint = ValueHint::FilePath
    )]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: GlobalOverrides,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Resolve a remote account by URI or `@user@domain` and print it as JSON.
    Resolve(ResolveArgs),
    /// Print the capacity of every entity cache under the configured budget.
    Plan,
    /// Manage and query domain federation permissions.
    Domain(DomainArgs),
    /// Apply pending database migrations.
    Migrate,
}

#[derive(Debug, Args, Clone)]
pub struct ResolveArgs {
    /// Account URI or `@user@domain` handle.
    #[arg(value_name = "TARGET")]
    pub target: String,

    /// Local username on whose behalf the fetch is made; empty for the
    /// instance actor.
    #[arg(long, default_value = "")]
    pub requester: String,

    /// Use the shorter forced freshness window.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub force: bool,
}

#[derive(Debug, Args, Clone)]
pub struct DomainArgs {
    #[command(subcommand)]
    pub command: DomainCommand,
}

#[derive(Debug, Subcommand, Clone)]
pub enum DomainCommand {
    /// Add an explicit domain block.
    Block(DomainTarget),
    /// Add an explicit domain allow.
    Allow(DomainTarget),
    /// Remove an explicit domain block.
    Unblock(DomainTarget),
    /// Remove an explicit domain allow.
    Disallow(DomainTarget),
    /// Report whether federation with a domain is blocked.
    Check(DomainTarget),
}

#[derive(Debug, Args, Clone)]
pub struct DomainTarget {
    #[arg(value_name = "DOMAIN")]
    pub domain: String,
}

#[derive(Debug, Args, Default, Clone)]
pub struct GlobalOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,

    /// Override the database connection URL.
    #[arg(long = "database-url", value_name = "URL", global = true)]
    pub database_url: Option<String>,

    /// Keep all state in memory, ignoring any configured database.
    #[arg(long, action = clap::ArgAction::SetTrue, global = true)]
    pub ephemeral: bool,

    /// Override this server's host name.
    #[arg(long = "federation-host", value_name = "HOST", global = true)]
    pub federation_host: Option<String>,

    /// Override the federation mode (blocklist|allowlist).
    #[arg(long = "federation-mode", value_name = "MODE", global = true)]
    pub federation_mode: Option<String>,

    /// Override the entity cache memory budget in bytes.
    #[arg(long = "cache-memory-target-bytes", value_name = "BYTES", global = true)]
    pub cache_memory_target_bytes: Option<u64>,

    /// Override the media storage directory.
    #[arg(
        long = "media-directory",
        value_name = "PATH",
        value_hint = ValueHint::DirPath,
        global = true
    )]
    pub media_directory: Option<PathBuf>,
}
