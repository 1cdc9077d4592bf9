use std::{env, fs, net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{bail, Result};
use tracing::warn;
use uuid::Uuid;

use crate::cache::CacheConfig;

pub const DEFAULT_BULK_URL: &str = "https://eddb.io/archive/v6/systems_populated.json";
pub const DEFAULT_REFRESH_INTERVAL_HOURS: u32 = 24;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub api_key: String,
    pub api_key_is_fallback: bool,
    pub data_dir: PathBuf,
    pub bulk_url: String,
    pub refresh_interval_hours: u32,
    pub download_timeout: Duration,
    pub max_corruption_retries: u32,
    pub ingest_batch_size: usize,
    pub read_pool_size: usize,
    pub refresh_check_interval: Duration,
    pub cmdr_name: String,
    pub edsm_api_key: Option<String>,
    pub inara_api_key: Option<String>,
    pub lookup_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let bind_raw =
            env::var("ED_CACHE_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let bind_normalized = bind_raw
            .trim()
            .trim_matches('"')
            .trim_matches('\'')
            .to_string();
        let bind_addr = bind_normalized
            .parse::<SocketAddr>()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8080)));

        let (api_key, api_key_is_fallback) = resolve_api_key();

        let data_dir =
            PathBuf::from(env::var("ED_CACHE_DATA_DIR").unwrap_or_else(|_| "./data".to_string()));

        let bulk_url = env::var("ED_CACHE_BULK_URL")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_BULK_URL.to_string());

        let refresh_interval_hours =
            parse_refresh_interval(env::var("ED_CACHE_REFRESH_INTERVAL_HOURS").ok().as_deref())?;

        let download_timeout = Duration::from_secs(env_parse("ED_CACHE_DOWNLOAD_TIMEOUT_SECONDS", 600));
        let max_corruption_retries = env_parse("ED_CACHE_MAX_CORRUPTION_RETRIES", 1);
        let ingest_batch_size = env_parse::<usize>("ED_CACHE_INGEST_BATCH_SIZE", 1000).max(1);
        let read_pool_size = env_parse::<usize>("ED_CACHE_READ_POOL_SIZE", 4).max(1);
        let refresh_check_interval =
            Duration::from_secs(env_parse::<u64>("ED_CACHE_REFRESH_CHECK_SECONDS", 300).max(1));
        let lookup_timeout = Duration::from_secs(env_parse("ED_CACHE_LOOKUP_TIMEOUT_SECONDS", 15));

        let cmdr_name = env::var("ED_CMDR_NAME").unwrap_or_default().trim().to_string();
        let edsm_api_key = env::var("EDSM_API_KEY").ok();
        let inara_api_key = env::var("INARA_API_KEY").ok();

        Ok(Self {
            bind_addr,
            api_key,
            api_key_is_fallback,
            data_dir,
            bulk_url,
            refresh_interval_hours,
            download_timeout,
            max_corruption_retries,
            ingest_batch_size,
            read_pool_size,
            refresh_check_interval,
            cmdr_name,
            edsm_api_key,
            inara_api_key,
            lookup_timeout,
        })
    }

    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            data_dir: self.data_dir.clone(),
            refresh_interval_hours: self.refresh_interval_hours,
            max_corruption_retries: self.max_corruption_retries,
            ingest_batch_size: self.ingest_batch_size,
            read_pool_size: self.read_pool_size,
        }
    }
}

pub fn parse_refresh_interval(raw: Option<&str>) -> Result<u32> {
    let Some(raw) = raw.map(str::trim).filter(|v| !v.is_empty()) else {
        return Ok(DEFAULT_REFRESH_INTERVAL_HOURS);
    };
    match raw.parse::<u32>() {
        Ok(hours) if hours >= 1 => Ok(hours),
        _ => bail!("ED_CACHE_REFRESH_INTERVAL_HOURS must be an integer >= 1, got {raw:?}"),
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn resolve_api_key() -> (String, bool) {
    if let Ok(value) = env::var("ED_CACHE_API_KEY") {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return (trimmed.to_string(), false);
        }
    }

    if let Ok(key_file) = env::var("ED_CACHE_API_KEY_FILE") {
        match fs::read_to_string(&key_file) {
            Ok(raw) => {
                let trimmed = raw.trim();
                if !trimmed.is_empty() {
                    return (trimmed.to_string(), false);
                }
                warn!(
                    key_file = %key_file,
                    "ED_CACHE_API_KEY_FILE is empty, falling back to generated key"
                );
            }
            Err(err) => {
                warn!(
                    key_file = %key_file,
                    "Failed reading ED_CACHE_API_KEY_FILE: {err}. Falling back to generated key"
                );
            }
        }
    } else {
        warn!("ED_CACHE_API_KEY not set, falling back to generated key");
    }

    let generated = format!("fallback-{}", Uuid::new_v4());
    (generated, true)
}
