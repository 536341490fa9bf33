use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Resolved configuration values consumed by the crate. How they are loaded
/// (file, environment, flags) is the caller's concern; `parse_config` covers
/// the TOML-file case used by the bundled binary.
#[derive(Debug, Deserialize)]
pub struct Config {
    pub database_path: PathBuf,
    #[serde(default = "Config::default_cache_ttl")]
    pub cache_ttl: u64,
    /// Days before a stale-database warning; zero or negative disables it.
    #[serde(default = "Config::default_database_max_age_days")]
    pub database_max_age_days: i64,
    /// Proxy specifications: exact addresses, CIDR ranges, or `"*"`.
    #[serde(default)]
    pub trusted_proxies: Vec<String>,
    /// Consulted in order; empty means the built-in default list.
    #[serde(default)]
    pub forwarded_headers: Vec<String>,
    #[serde(default = "Config::default_log_level")]
    pub log_level: log::Level,
    #[serde(default)]
    pub update: UpdateConfig,
}

impl Config {
    fn default_cache_ttl() -> u64 {
        86400
    }

    fn default_database_max_age_days() -> i64 {
        45
    }

    fn default_log_level() -> log::Level {
        log::Level::Info
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateConfig {
    #[serde(default)]
    pub account_id: String,
    #[serde(default)]
    pub license_key: String,
    #[serde(default = "UpdateConfig::default_edition_id")]
    pub edition_id: String,
    /// Either a per-edition template with an `{edition_id}` placeholder or
    /// the legacy `app/geoip_download` endpoint.
    #[serde(default = "UpdateConfig::default_download_url")]
    pub download_url: String,
    #[serde(default = "UpdateConfig::default_download_timeout_secs")]
    pub download_timeout_secs: u64,
    /// Parent directory for scratch state; the system temp dir when unset.
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,
}

impl UpdateConfig {
    pub fn default_edition_id() -> String {
        "GeoLite2-Country".to_owned()
    }

    pub fn default_download_url() -> String {
        "https://download.maxmind.com/geoip/databases/{edition_id}/download".to_owned()
    }

    pub fn default_download_timeout_secs() -> u64 {
        120
    }
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            account_id: String::new(),
            license_key: String::new(),
            edition_id: Self::default_edition_id(),
            download_url: Self::default_download_url(),
            download_timeout_secs: Self::default_download_timeout_secs(),
            scratch_dir: None,
        }
    }
}

pub fn parse_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let toml_string = std::fs::read_to_string(path)?;
    let config: Config = toml::from_str(&toml_string)?;
    Ok(config)
}
