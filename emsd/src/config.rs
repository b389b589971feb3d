use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "/etc/emsd/emsd.toml";
const ENV_CONFIG_PATH: &str = "EMSD_CONFIG";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Size of the worker pool; each worker serves one session at a time.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Capacity of the session wait list. The listener blocks once this
    /// many handshakes are pending.
    #[serde(default = "default_wait_list")]
    pub wait_list: usize,
    /// Upper bound on seats per RESERVE call, enforced at the framing layer.
    #[serde(default = "default_max_reservation")]
    pub max_reservation: usize,
    /// Simulated memory-access delay around catalog scans, in microseconds.
    #[serde(default)]
    pub access_delay_us: u64,
}

impl Config {
    /// Load configuration from file. The path can be overridden with the
    /// `EMSD_CONFIG` environment variable. If the file is missing or fails
    /// to parse, defaults are returned.
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = PathBuf::from(path);
        match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Config::default(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            wait_list: default_wait_list(),
            max_reservation: default_max_reservation(),
            access_delay_us: 0,
        }
    }
}

fn default_workers() -> usize {
    8
}
fn default_wait_list() -> usize {
    16
}
fn default_max_reservation() -> usize {
    ems_wire::DEFAULT_MAX_RESERVATION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert!(config.workers >= 1);
        assert!(config.wait_list >= 1);
        assert_eq!(config.access_delay_us, 0);
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: Config = toml::from_str("workers = 2").unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.wait_list, default_wait_list());
        assert_eq!(config.max_reservation, ems_wire::DEFAULT_MAX_RESERVATION);
    }
}
