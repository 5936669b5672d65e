//! Layered configuration: compiled-in defaults, an optional TOML file, then
//! `DC_*` environment overrides. The CLI only ever selects the role to run
//! and where to find the config file — everything else flows through this
//! layering rather than a flag per option.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Role {
    Emitter,
    Absorber,
    Coordinator,
    Collector,
}

#[derive(Debug, Parser)]
#[command(name = "distbuildd", about = "Distributed C/C++ compilation daemon")]
pub struct Cli {
    /// Which role this process drives.
    #[arg(value_enum)]
    pub role: Role,

    /// TOML config file, consulted before environment overrides.
    #[arg(long, env = "DC_CONFIG_PATH")]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct FileHost {
    host: String,
    port: u16,
    #[serde(default)]
    threads: u32,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct FileCacheSettings {
    path: Option<PathBuf>,
    size: Option<u64>,
    direct: Option<bool>,
    clean_period_sec: Option<u64>,
    compression_level: Option<i32>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct FileEmitterSettings {
    local: Option<FileHost>,
    remotes: Vec<FileHost>,
    coordinator: Option<FileHost>,
    local_jobs: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct FileAbsorberSettings {
    local: Option<FileHost>,
    coordinator: Option<FileHost>,
    threads: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct FileCoordinatorSettings {
    local: Option<FileHost>,
    stale_after_sec: Option<u64>,
    poll_interval_sec: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct FileMetricsSettings {
    collector: Option<FileHost>,
    local: Option<FileHost>,
    push_interval_sec: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct FileSettings {
    socket_path: Option<PathBuf>,
    clang_path: Option<PathBuf>,
    clang_version: Option<String>,
    read_timeout_sec: Option<u64>,
    send_timeout_sec: Option<u64>,
    max_remote_attempts: Option<u32>,
    max_frame_bytes: Option<usize>,
    write_high_watermark_bytes: Option<usize>,
    cache: FileCacheSettings,
    emitter: FileEmitterSettings,
    absorber: FileAbsorberSettings,
    coordinator: FileCoordinatorSettings,
    metrics: FileMetricsSettings,
}

#[derive(Debug, Clone)]
pub struct RemoteHost {
    pub host: String,
    pub port: u16,
    pub threads: u32,
}

impl RemoteHost {
    #[must_use]
    pub fn id(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub direct_enabled: bool,
    pub clean_period: Duration,
    pub compression_level: i32,
}

#[derive(Debug, Clone)]
pub struct EmitterSettings {
    /// Client-facing listen address. `Connection`/`EventLoop` are TCP-only,
    /// so the Emitter listens here rather than on a Unix socket;
    /// `socket_path` is still carried on `Settings` for compatibility with
    /// config files that set it, but otherwise unused.
    pub listen: SocketAddr,
    pub remotes: Vec<RemoteHost>,
    pub coordinator: Option<SocketAddr>,
    pub local_jobs: usize,
}

#[derive(Debug, Clone)]
pub struct AbsorberSettings {
    pub listen: SocketAddr,
    pub coordinator: Option<SocketAddr>,
    pub threads: usize,
}

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub listen: SocketAddr,
    pub stale_after: Duration,
    pub poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct MetricsSettings {
    pub listen: Option<SocketAddr>,
    pub collector: Option<SocketAddr>,
    pub push_interval: Duration,
}

/// Fully resolved, validated runtime configuration. Immutable once built;
/// every role handler is handed the same `Arc<Settings>`.
#[derive(Debug, Clone)]
pub struct Settings {
    pub socket_path: PathBuf,
    pub clang_path: PathBuf,
    pub clang_version: Option<String>,
    pub read_timeout: Duration,
    pub send_timeout: Duration,
    pub max_remote_attempts: u32,
    pub max_frame_bytes: usize,
    pub write_high_watermark_bytes: usize,
    pub cache: CacheSettings,
    pub emitter: EmitterSettings,
    pub absorber: AbsorberSettings,
    pub coordinator: CoordinatorSettings,
    pub metrics: MetricsSettings,
}

impl Settings {
    /// Loads compiled-in defaults, merges an optional TOML file on top, then
    /// applies `DC_*` environment overrides.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if `config_path` is set but unreadable or
    /// malformed, or if an overridden value fails validation.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self, ConfigError> {
        let file = match config_path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.clone(),
                    source,
                })?;
                toml::from_str(&text).map_err(|source| ConfigError::Parse {
                    path: path.clone(),
                    source,
                })?
            }
            None => FileSettings::default(),
        };

        let mut settings = Self::from_file(file)?;
        settings.apply_env_overrides()?;
        Ok(settings)
    }

    fn from_file(file: FileSettings) -> Result<Self, ConfigError> {
        let default_host = |h: Option<FileHost>, default_port: u16| -> SocketAddr {
            let h = h.unwrap_or_default();
            let host = if h.host.is_empty() { "0.0.0.0".to_string() } else { h.host };
            let port = if h.port == 0 { default_port } else { h.port };
            format!("{host}:{port}").parse().unwrap_or_else(|_| {
                SocketAddr::from(([0, 0, 0, 0], default_port))
            })
        };

        Ok(Self {
            socket_path: file.socket_path.unwrap_or_else(|| PathBuf::from("/tmp/clangd.socket")),
            clang_path: file.clang_path.unwrap_or_else(|| PathBuf::from("clang++")),
            clang_version: file.clang_version,
            read_timeout: Duration::from_secs(file.read_timeout_sec.unwrap_or(30)),
            send_timeout: Duration::from_secs(file.send_timeout_sec.unwrap_or(30)),
            max_remote_attempts: file.max_remote_attempts.unwrap_or(2),
            max_frame_bytes: file.max_frame_bytes.unwrap_or(64 * 1024 * 1024),
            write_high_watermark_bytes: file.write_high_watermark_bytes.unwrap_or(16 * 1024 * 1024),
            cache: CacheSettings {
                path: file.cache.path.unwrap_or_else(|| PathBuf::from("/tmp/distbuild-cache")),
                size_bytes: file.cache.size.unwrap_or(10 * 1024 * 1024 * 1024),
                direct_enabled: file.cache.direct.unwrap_or(true),
                clean_period: Duration::from_secs(file.cache.clean_period_sec.unwrap_or(3600)),
                compression_level: file.cache.compression_level.unwrap_or(3),
            },
            emitter: EmitterSettings {
                listen: default_host(file.emitter.local, 8979),
                remotes: file
                    .emitter
                    .remotes
                    .into_iter()
                    .map(|h| RemoteHost {
                        host: h.host,
                        port: h.port,
                        threads: h.threads,
                    })
                    .collect(),
                coordinator: file.emitter.coordinator.map(|h| default_host(Some(h), 9090)),
                local_jobs: file.emitter.local_jobs.unwrap_or_else(num_cpus::get),
            },
            absorber: AbsorberSettings {
                listen: default_host(file.absorber.local, 8980),
                coordinator: file.absorber.coordinator.map(|h| default_host(Some(h), 9090)),
                threads: file.absorber.threads.unwrap_or_else(num_cpus::get),
            },
            coordinator: CoordinatorSettings {
                listen: default_host(file.coordinator.local, 9090),
                stale_after: Duration::from_secs(file.coordinator.stale_after_sec.unwrap_or(30)),
                poll_interval: Duration::from_secs(file.coordinator.poll_interval_sec.unwrap_or(5)),
            },
            metrics: MetricsSettings {
                listen: file.metrics.local.map(|h| default_host(Some(h), 9091)),
                collector: file.metrics.collector.map(|h| default_host(Some(h), 9091)),
                push_interval: Duration::from_secs(file.metrics.push_interval_sec.unwrap_or(10)),
            },
        })
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(v) = std::env::var("DC_CLANG_PATH") {
            self.clang_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("DC_CLANG_VERSION") {
            self.clang_version = Some(v);
        }
        if let Ok(v) = std::env::var("DC_SOCKET_PATH") {
            self.socket_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("DC_CACHE_PATH") {
            self.cache.path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("DC_CACHE_SIZE") {
            self.cache.size_bytes = v.parse().map_err(|_| ConfigError::Invalid {
                field: "DC_CACHE_SIZE",
                reason: format!("{v:?} is not a valid byte count"),
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_no_file_given() {
        let settings = Settings::load(None).unwrap();
        assert_eq!(settings.cache.size_bytes, 10 * 1024 * 1024 * 1024);
        assert_eq!(settings.max_remote_attempts, 2);
    }

    #[test]
    fn env_override_wins_over_file() {
        std::env::set_var("DC_CACHE_SIZE", "2000000");
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("distbuild.toml");
        std::fs::write(&config_path, "[cache]\nsize = 1000000\n").unwrap();

        let settings = Settings::load(Some(&config_path)).unwrap();
        assert_eq!(settings.cache.size_bytes, 2_000_000);
        std::env::remove_var("DC_CACHE_SIZE");
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let err = Settings::load(Some(&PathBuf::from("/nonexistent/distbuild.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
