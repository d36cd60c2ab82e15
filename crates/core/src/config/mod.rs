//! Command line and file configuration.
//!
//! Every setting can come from a flag, its environment variable or the
//! optional TOML file given with `--config`; flags and environment win over
//! the file, which wins over the defaults.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
#[cfg(feature = "trace")]
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;

use crate::measurement::{
    PhaseSettings, DEFAULT_CONNECTIONS, DEFAULT_PHASE_DURATION, DEFAULT_PHASE_PAUSE,
    DEFAULT_PING_INTERVAL, DEFAULT_PING_SAMPLES, DEFAULT_PING_TIMEOUT, DEFAULT_UPLOAD_CHUNK_SIZE,
    DEFAULT_WINDOW_SPAN,
};
use crate::runner::SpeedTestSettings;

pub const DEFAULT_PORT: u16 = 3000;
/// Upload sink cap (500 MiB).
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 500 * 1024 * 1024;
/// Largest buffer `/download` agrees to materialize (1 GiB).
pub const DEFAULT_MAX_DOWNLOAD_BYTES: u64 = 1024 * 1024 * 1024;
/// Chunk repeated by `/download-stream` (1 MiB).
pub const DEFAULT_STREAM_CHUNK_SIZE: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("no server to test against, pass --server or set it in the config file")]
    MissingServer,

    #[error("invalid server url {url}: {reason}")]
    InvalidServer { url: String, reason: String },
}

#[derive(clap::Parser, Debug, Clone)]
#[command(name = "lanspeed", version, about = "Measure LAN latency and throughput over HTTP")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Default log level, `RUST_LOG` directives take precedence.
    #[arg(long, global = true, env = "LANSPEED_LOG_LEVEL")]
    pub log_level: Option<LevelFilter>,

    /// TOML file with `[serve]` and `[run]` tables.
    #[arg(long, global = true, env = "LANSPEED_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(clap::Subcommand, Debug, Clone)]
pub enum Command {
    /// Serve the speed test endpoints.
    Serve(ServeArgs),
    /// Measure latency, download and upload throughput against a server.
    Run(RunArgs),
}

#[derive(clap::Args, Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServeArgs {
    /// Address to listen on, default is 0.0.0.0
    #[arg(long, env = "LANSPEED_ADDRESS")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<IpAddr>,

    /// Port to listen on, default is 3000
    #[arg(long, env = "PORT")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Largest accepted upload body.
    #[arg(long, env = "LANSPEED_MAX_UPLOAD_BYTES")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_upload_bytes: Option<u64>,

    /// Largest buffer served by `/download`.
    #[arg(long, env = "LANSPEED_MAX_DOWNLOAD_BYTES")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_download_bytes: Option<u64>,

    /// Size of each chunk written by `/download-stream`.
    #[arg(long, env = "LANSPEED_DOWNLOAD_CHUNK_SIZE")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_chunk_size: Option<usize>,
}

/// How the upload phase chooses its mode.
#[derive(clap::ValueEnum, Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadPreference {
    /// Stream when possible, fall back to looping.
    #[default]
    Auto,
    /// Always loop over discrete requests.
    Loop,
}

#[derive(clap::Args, Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RunArgs {
    /// Server to test against, e.g. `http://192.168.1.10:3000`.
    #[arg(long, env = "LANSPEED_SERVER")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,

    /// Length of each throughput phase.
    #[arg(long, env = "LANSPEED_DURATION_MS")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Span of the window behind the live rate.
    #[arg(long, env = "LANSPEED_WINDOW_MS")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_ms: Option<u64>,

    /// Concurrent connections per throughput phase.
    #[arg(long, env = "LANSPEED_CONNECTIONS")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connections: Option<usize>,

    /// Upload chunk size in bytes.
    #[arg(long, env = "LANSPEED_CHUNK_SIZE")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<usize>,

    #[arg(long, env = "LANSPEED_PING_SAMPLES")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ping_samples: Option<usize>,

    #[arg(long, env = "LANSPEED_PING_INTERVAL_MS")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ping_interval_ms: Option<u64>,

    /// Longest wait for one ping answer.
    #[arg(long, env = "LANSPEED_PING_TIMEOUT_MS")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ping_timeout_ms: Option<u64>,

    /// Idle time between phases.
    #[arg(long, env = "LANSPEED_PHASE_PAUSE_MS")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase_pause_ms: Option<u64>,

    #[arg(long, value_enum, env = "LANSPEED_UPLOAD_MODE")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_mode: Option<UploadPreference>,

    /// Allow testing against this very machine.
    #[arg(long)]
    #[serde(default)]
    pub allow_loopback: bool,

    /// Print the final report as JSON.
    #[arg(long)]
    #[serde(default)]
    pub json: bool,
}

/// Contents of the `--config` file.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub serve: ServeArgs,
    pub run: RunArgs,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    /// Loads `path` if given, defaults otherwise.
    pub fn load_optional(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => {
                tracing::debug!(path = %path.display(), "loading config file");
                Self::load(path)
            }
            None => Ok(Self::default()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub address: IpAddr,
    pub port: u16,
    pub max_upload_bytes: u64,
    pub max_download_bytes: u64,
    pub download_chunk_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            max_download_bytes: DEFAULT_MAX_DOWNLOAD_BYTES,
            download_chunk_size: DEFAULT_STREAM_CHUNK_SIZE,
        }
    }
}

impl ServeArgs {
    /// Fills the settings missing here from `file`.
    pub fn merge(self, file: ServeArgs) -> Self {
        Self {
            address: self.address.or(file.address),
            port: self.port.or(file.port),
            max_upload_bytes: self.max_upload_bytes.or(file.max_upload_bytes),
            max_download_bytes: self.max_download_bytes.or(file.max_download_bytes),
            download_chunk_size: self.download_chunk_size.or(file.download_chunk_size),
        }
    }

    pub fn build(self) -> Result<ServerConfig, ConfigError> {
        let defaults = ServerConfig::default();
        let config = ServerConfig {
            address: self.address.unwrap_or(defaults.address),
            port: self.port.unwrap_or(defaults.port),
            max_upload_bytes: self.max_upload_bytes.unwrap_or(defaults.max_upload_bytes),
            max_download_bytes: self.max_download_bytes.unwrap_or(defaults.max_download_bytes),
            download_chunk_size: self
                .download_chunk_size
                .unwrap_or(defaults.download_chunk_size),
        };
        non_zero("download-chunk-size", config.download_chunk_size as u64)?;
        Ok(config)
    }
}

/// Everything `lanspeed run` needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasurementConfig {
    pub server: Url,
    pub settings: SpeedTestSettings,
    pub allow_loopback: bool,
    pub json: bool,
}

impl RunArgs {
    /// Fills the settings missing here from `file`.
    pub fn merge(self, file: RunArgs) -> Self {
        Self {
            server: self.server.or(file.server),
            duration_ms: self.duration_ms.or(file.duration_ms),
            window_ms: self.window_ms.or(file.window_ms),
            connections: self.connections.or(file.connections),
            chunk_size: self.chunk_size.or(file.chunk_size),
            ping_samples: self.ping_samples.or(file.ping_samples),
            ping_interval_ms: self.ping_interval_ms.or(file.ping_interval_ms),
            ping_timeout_ms: self.ping_timeout_ms.or(file.ping_timeout_ms),
            phase_pause_ms: self.phase_pause_ms.or(file.phase_pause_ms),
            upload_mode: self.upload_mode.or(file.upload_mode),
            allow_loopback: self.allow_loopback || file.allow_loopback,
            json: self.json || file.json,
        }
    }

    pub fn build(self) -> Result<MeasurementConfig, ConfigError> {
        let server = parse_server(self.server.as_deref().ok_or(ConfigError::MissingServer)?)?;
        let millis = |value: Option<u64>, default: Duration| {
            value.map(Duration::from_millis).unwrap_or(default)
        };

        let phase = PhaseSettings {
            connections: self.connections.unwrap_or(DEFAULT_CONNECTIONS),
            duration: millis(self.duration_ms, DEFAULT_PHASE_DURATION),
            window_span: millis(self.window_ms, DEFAULT_WINDOW_SPAN),
        };
        let settings = SpeedTestSettings {
            phase,
            chunk_size: self.chunk_size.unwrap_or(DEFAULT_UPLOAD_CHUNK_SIZE),
            ping_samples: self.ping_samples.unwrap_or(DEFAULT_PING_SAMPLES),
            ping_interval: millis(self.ping_interval_ms, DEFAULT_PING_INTERVAL),
            ping_timeout: millis(self.ping_timeout_ms, DEFAULT_PING_TIMEOUT),
            phase_pause: millis(self.phase_pause_ms, DEFAULT_PHASE_PAUSE),
            force_loop_upload: self.upload_mode.unwrap_or_default() == UploadPreference::Loop,
        };

        non_zero("connections", phase.connections as u64)?;
        non_zero("duration-ms", phase.duration.as_millis() as u64)?;
        non_zero("window-ms", phase.window_span.as_millis() as u64)?;
        non_zero("chunk-size", settings.chunk_size as u64)?;
        non_zero("ping-samples", settings.ping_samples as u64)?;
        non_zero("ping-timeout-ms", settings.ping_timeout.as_millis() as u64)?;

        Ok(MeasurementConfig {
            server,
            settings,
            allow_loopback: self.allow_loopback,
            json: self.json,
        })
    }
}

fn non_zero(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Zero { field });
    }
    Ok(())
}

/// Accepts bare `host:port` targets by assuming `http`.
pub fn parse_server(raw: &str) -> Result<Url, ConfigError> {
    let raw = raw.trim();
    let invalid = |reason: String| ConfigError::InvalidServer {
        url: raw.to_owned(),
        reason,
    };
    let with_scheme = if raw.contains("://") {
        raw.to_owned()
    } else {
        format!("http://{raw}")
    };
    let url = Url::parse(&with_scheme).map_err(|error| invalid(error.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme {}", url.scheme())));
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host".into()));
    }
    Ok(url)
}

/// Installs the global `tracing` subscriber, once per process.
pub fn set_logger(level: Option<LevelFilter>) {
    #[cfg(feature = "trace")]
    {
        static LOGGER_SET: AtomicBool = AtomicBool::new(false);
        if LOGGER_SET
            .compare_exchange(
                false,
                true,
                std::sync::atomic::Ordering::Release,
                std::sync::atomic::Ordering::SeqCst,
            )
            .is_err()
        {
            return;
        }

        if let Err(error) = crate::tracing::tracer::init_tracer(level) {
            eprintln!("failed tracing initialization: {error}");
        }
    }
    #[cfg(not(feature = "trace"))]
    let _ = level;
}
