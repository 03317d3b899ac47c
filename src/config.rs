//! Configuration for the range server and the fetch client.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values, which take
//! precedence over built-in defaults.

use crate::server::{InvalidRangePolicy, SessionOptions, DEFAULT_QUEUE_DEPTH};
use crate::source::SourceKind;
use crate::wire::{WireFormat, DEFAULT_MAX_MESSAGE, PAYLOAD_LEN};
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "rangecast")]
#[command(version)]
#[command(about = "Pipelined byte-range server and fetch client", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve byte ranges of a file
    Serve(ServeArgs),
    /// Fetch byte ranges from a server in a cyclic pattern
    Fetch(FetchArgs),
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// File to serve
    pub file: Option<PathBuf>,

    /// Address to bind to (e.g., 0.0.0.0:9999)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// How the file is read
    #[arg(long, value_enum)]
    pub source: Option<SourceKind>,

    /// Requests queued per connection before reads stop
    #[arg(short = 'q', long)]
    pub queue_depth: Option<usize>,

    /// Request encoding
    #[arg(long, value_enum)]
    pub wire: Option<WireFormat>,

    /// Handling of ranges past the end of the file
    #[arg(long, value_enum)]
    pub invalid_range: Option<InvalidRangePolicy>,

    /// Largest accepted request payload in bytes
    #[arg(long)]
    pub max_message: Option<usize>,
}

#[derive(Args, Debug)]
pub struct FetchArgs {
    /// Server host name or address
    pub host: Option<String>,

    /// Server port
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Bytes requested per range
    #[arg(short = 'b', long)]
    pub block_size: Option<u32>,

    /// Requests allowed in flight
    #[arg(short = 'o', long)]
    pub max_outstanding: Option<usize>,

    /// Size of the remote resource; offsets wrap before reaching it
    #[arg(short = 's', long)]
    pub resource_size: Option<u64>,

    /// Stop after this many requests (default: run until interrupted)
    #[arg(short = 'n', long)]
    pub requests: Option<u64>,

    /// Request encoding
    #[arg(long, value_enum)]
    pub wire: Option<WireFormat>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// `[server]` section
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// File to serve
    pub path: Option<PathBuf>,
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub source: SourceKind,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    #[serde(default)]
    pub wire: WireFormat,
    #[serde(default)]
    pub invalid_range: InvalidRangePolicy,
    #[serde(default = "default_max_message")]
    pub max_message: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            path: None,
            listen: default_listen(),
            source: SourceKind::default(),
            queue_depth: default_queue_depth(),
            wire: WireFormat::default(),
            invalid_range: InvalidRangePolicy::default(),
            max_message: default_max_message(),
        }
    }
}

/// `[client]` section
#[derive(Debug, Deserialize)]
pub struct ClientSection {
    pub host: Option<String>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    #[serde(default = "default_max_outstanding")]
    pub max_outstanding: usize,
    #[serde(default = "default_resource_size")]
    pub resource_size: u64,
    pub requests: Option<u64>,
    #[serde(default)]
    pub wire: WireFormat,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            host: None,
            port: default_port(),
            block_size: default_block_size(),
            max_outstanding: default_max_outstanding(),
            resource_size: default_resource_size(),
            requests: None,
            wire: WireFormat::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:9999".to_string()
}

fn default_queue_depth() -> usize {
    DEFAULT_QUEUE_DEPTH
}

fn default_max_message() -> usize {
    DEFAULT_MAX_MESSAGE
}

fn default_port() -> u16 {
    9999
}

fn default_block_size() -> u32 {
    64 * 1024
}

fn default_max_outstanding() -> usize {
    64
}

fn default_resource_size() -> u64 {
    1024 * 1024 * 1024 // 1 GiB
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolved server settings
#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub path: PathBuf,
    pub listen: String,
    pub source: SourceKind,
    pub queue_depth: usize,
    pub wire: WireFormat,
    pub invalid_range: InvalidRangePolicy,
    pub max_message: usize,
}

impl ServeConfig {
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            queue_depth: self.queue_depth,
            wire: self.wire,
            max_message: self.max_message,
            invalid_range: self.invalid_range,
        }
    }
}

/// Resolved client settings
#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub host: String,
    pub port: u16,
    pub block_size: u32,
    pub max_outstanding: usize,
    pub resource_size: u64,
    pub requests: Option<u64>,
    pub wire: WireFormat,
}

#[derive(Debug, Clone)]
pub enum Mode {
    Serve(ServeConfig),
    Fetch(FetchConfig),
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: Mode,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();
        let toml_config = match cli.config {
            Some(ref path) => load_toml(path)?,
            None => TomlConfig::default(),
        };
        Self::resolve(cli, toml_config)
    }

    /// Merge CLI args over TOML values and validate the result.
    pub fn resolve(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let mode = match cli.command {
            Command::Serve(args) => Mode::Serve(resolve_serve(args, toml_config.server)?),
            Command::Fetch(args) => Mode::Fetch(resolve_fetch(args, toml_config.client)?),
        };

        Ok(Config {
            mode,
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
        })
    }
}

fn load_toml(path: &Path) -> Result<TomlConfig, ConfigError> {
    let contents =
        std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead(path.to_path_buf(), e))?;
    toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(path.to_path_buf(), e))
}

fn resolve_serve(args: ServeArgs, section: ServerSection) -> Result<ServeConfig, ConfigError> {
    let path = args
        .file
        .or(section.path)
        .ok_or_else(|| ConfigError::Invalid("no file to serve".to_string()))?;

    let config = ServeConfig {
        path,
        listen: args.listen.unwrap_or(section.listen),
        source: args.source.unwrap_or(section.source),
        queue_depth: args.queue_depth.unwrap_or(section.queue_depth),
        wire: args.wire.unwrap_or(section.wire),
        invalid_range: args.invalid_range.unwrap_or(section.invalid_range),
        max_message: args.max_message.unwrap_or(section.max_message),
    };

    if config.queue_depth == 0 {
        return Err(ConfigError::Invalid(
            "queue_depth must be at least 1".to_string(),
        ));
    }
    if config.max_message < PAYLOAD_LEN {
        return Err(ConfigError::Invalid(format!(
            "max_message must be at least {} bytes",
            PAYLOAD_LEN
        )));
    }
    Ok(config)
}

fn resolve_fetch(args: FetchArgs, section: ClientSection) -> Result<FetchConfig, ConfigError> {
    let host = args
        .host
        .or(section.host)
        .ok_or_else(|| ConfigError::Invalid("no server host given".to_string()))?;

    let config = FetchConfig {
        host,
        port: args.port.unwrap_or(section.port),
        block_size: args.block_size.unwrap_or(section.block_size),
        max_outstanding: args.max_outstanding.unwrap_or(section.max_outstanding),
        resource_size: args.resource_size.unwrap_or(section.resource_size),
        requests: args.requests.or(section.requests),
        wire: args.wire.unwrap_or(section.wire),
    };

    if config.max_outstanding == 0 {
        return Err(ConfigError::Invalid(
            "max_outstanding must be at least 1".to_string(),
        ));
    }
    if config.block_size == 0 {
        return Err(ConfigError::Invalid(
            "block_size must be at least 1".to_string(),
        ));
    }
    if u64::from(config.block_size) > config.resource_size {
        return Err(ConfigError::Invalid(format!(
            "block_size {} exceeds resource_size {}",
            config.block_size, config.resource_size
        )));
    }
    Ok(config)
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::FileRead(_, e) => Some(e),
            ConfigError::TomlParse(_, e) => Some(e),
            ConfigError::Invalid(_) => None,
        }
    }
}
