use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TracekeepError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub db_path: PathBuf,
    pub otlp_grpc_addr: String,
    pub otlp_http_addr: String,
    pub query_tcp_addr: String,
    pub uds_path: PathBuf,
    pub write_batch_size: usize,
    pub write_flush_ms: u64,
    pub ingest_workers: usize,
    pub channel_capacity: usize,
    pub query_timeout: Duration,
    pub index_audit_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        let xdg_runtime = env::var("XDG_RUNTIME_DIR").ok();
        let data_home = env::var("XDG_DATA_HOME").ok();

        let data_root = data_home
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(home).join(".local/share"));

        let uds_path = xdg_runtime
            .map(PathBuf::from)
            .unwrap_or_else(|| data_root.join("tracekeep"))
            .join("tracekeep.sock");

        Self {
            db_path: data_root.join("tracekeep/traces.duckdb"),
            otlp_grpc_addr: "127.0.0.1:4317".to_string(),
            otlp_http_addr: "127.0.0.1:4318".to_string(),
            query_tcp_addr: "127.0.0.1:1777".to_string(),
            uds_path,
            write_batch_size: 512,
            write_flush_ms: 200,
            ingest_workers: 4,
            channel_capacity: 256,
            query_timeout: Duration::from_secs(10),
            index_audit_interval: Duration::from_secs(60 * 10),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let mut cfg = Self::default();
        let config_path = config_file_path();
        if let Some(file_overrides) = load_file_overrides(&config_path)? {
            apply_overrides(&mut cfg, file_overrides, "config file")?;
        }
        let env_overrides = load_env_overrides()?;
        apply_overrides(&mut cfg, env_overrides, "environment")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        let env_overrides = load_env_overrides()?;
        apply_overrides(&mut cfg, env_overrides, "environment")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ingest_workers == 0 {
            return Err(TracekeepError::Config(
                "ingest_workers must be at least 1".to_string(),
            ));
        }
        if self.write_batch_size == 0 || self.channel_capacity == 0 {
            return Err(TracekeepError::Config(
                "write_batch_size and channel_capacity must be positive".to_string(),
            ));
        }
        if self.index_audit_interval.is_zero() {
            return Err(TracekeepError::Config(
                "index_audit_interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigOverrides {
    db_path: Option<PathBuf>,
    otlp_grpc_addr: Option<String>,
    otlp_http_addr: Option<String>,
    query_tcp_addr: Option<String>,
    uds_path: Option<PathBuf>,
    write_batch_size: Option<usize>,
    write_flush_ms: Option<u64>,
    ingest_workers: Option<usize>,
    channel_capacity: Option<usize>,
    query_timeout: Option<String>,
    index_audit_interval: Option<String>,
}

fn config_file_path() -> PathBuf {
    if let Ok(path) = env::var("TRACEKEEP_CONFIG") {
        return PathBuf::from(path);
    }

    let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
    let config_home = env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(home).join(".config"));
    config_home.join("tracekeep/config.toml")
}

fn load_file_overrides(path: &PathBuf) -> Result<Option<ConfigOverrides>> {
    if !path.exists() {
        return Ok(None);
    }

    let raw = fs::read_to_string(path)
        .map_err(|e| TracekeepError::Config(format!("failed reading {}: {e}", path.display())))?;
    let parsed: ConfigOverrides = toml::from_str(&raw).map_err(|e| {
        TracekeepError::Config(format!("failed parsing {}: {e}", path.display()))
    })?;
    Ok(Some(parsed))
}

fn env_number<T>(key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(v) => v
            .parse::<T>()
            .map(Some)
            .map_err(|e| TracekeepError::Config(format!("bad {key} in environment: {e}"))),
        Err(_) => Ok(None),
    }
}

fn load_env_overrides() -> Result<ConfigOverrides> {
    Ok(ConfigOverrides {
        db_path: env::var("TRACEKEEP_DB_PATH").ok().map(PathBuf::from),
        otlp_grpc_addr: env::var("TRACEKEEP_OTLP_GRPC_ADDR").ok(),
        otlp_http_addr: env::var("TRACEKEEP_OTLP_HTTP_ADDR").ok(),
        query_tcp_addr: env::var("TRACEKEEP_QUERY_TCP_ADDR").ok(),
        uds_path: env::var("TRACEKEEP_QUERY_UDS_PATH").ok().map(PathBuf::from),
        write_batch_size: env_number("TRACEKEEP_WRITE_BATCH_SIZE")?,
        write_flush_ms: env_number("TRACEKEEP_WRITE_FLUSH_MS")?,
        ingest_workers: env_number("TRACEKEEP_INGEST_WORKERS")?,
        channel_capacity: None,
        query_timeout: env::var("TRACEKEEP_QUERY_TIMEOUT").ok(),
        index_audit_interval: env::var("TRACEKEEP_INDEX_AUDIT_INTERVAL").ok(),
    })
}

fn apply_overrides(cfg: &mut Config, overrides: ConfigOverrides, source: &str) -> Result<()> {
    if let Some(v) = overrides.db_path {
        cfg.db_path = v;
    }
    if let Some(v) = overrides.otlp_grpc_addr {
        cfg.otlp_grpc_addr = v;
    }
    if let Some(v) = overrides.otlp_http_addr {
        cfg.otlp_http_addr = v;
    }
    if let Some(v) = overrides.query_tcp_addr {
        cfg.query_tcp_addr = v;
    }
    if let Some(v) = overrides.uds_path {
        cfg.uds_path = v;
    }
    if let Some(v) = overrides.write_batch_size {
        cfg.write_batch_size = v;
    }
    if let Some(v) = overrides.write_flush_ms {
        cfg.write_flush_ms = v;
    }
    if let Some(v) = overrides.ingest_workers {
        cfg.ingest_workers = v;
    }
    if let Some(v) = overrides.channel_capacity {
        cfg.channel_capacity = v;
    }
    if let Some(v) = overrides.query_timeout {
        cfg.query_timeout = humantime::parse_duration(&v).map_err(|e| {
            TracekeepError::Config(format!("bad query_timeout in {source}: {e} (value={v})"))
        })?;
    }
    if let Some(v) = overrides.index_audit_interval {
        cfg.index_audit_interval = humantime::parse_duration(&v).map_err(|e| {
            TracekeepError::Config(format!(
                "bad index_audit_interval in {source}: {e} (value={v})"
            ))
        })?;
    }
    Ok(())
}
