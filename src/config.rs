use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::giver::GiverSet;
use crate::rpc::Flavor;
use crate::rpc::access::DEFAULT_ACCESS_URL;
use crate::rpc::http::DEFAULT_V4_ENDPOINT;
use crate::rpc::peer::DEFAULT_GLOBAL_CONFIG_URL;
use crate::wallet::validate_address;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required secret: {0}")]
    MissingSecret(String),
    #[error("missing required setting: {0}")]
    MissingSetting(String),
    #[error("missing required config file: {0}")]
    MissingConfig(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Files read on top of the process environment, first one wins per key.
const ENV_FILES: [&str; 4] = ["config.txt.txt", ".env.txt", ".env", "config.txt"];

const DEFAULT_TIMEOUT_SECS: u64 = 5;
const DEFAULT_EVALUATE_INTERVAL_MS: u64 = 1000;

/// Resolved runtime settings.
#[derive(Debug, Clone)]
pub struct Config {
    pub mnemonic: String,
    pub givers: GiverSet,
    pub givers_file: PathBuf,
    pub api: Flavor,
    pub miner_bin: PathBuf,
    pub gpu: u32,
    pub timeout_secs: u64,
    pub primary_endpoint: String,
    /// Fixed secondary endpoint; when unset one is discovered through `access_url`.
    pub secondary_endpoint: Option<String>,
    pub access_url: String,
    pub global_config_url: String,
    pub wallet_address: String,
    pub bocs_dir: PathBuf,
    pub evaluate_interval: Duration,
    pub status_addr: Option<(String, u16)>,
}

impl Config {
    /// Merge the settings files into the process environment. Returns the ones found.
    pub fn load_env_files() -> Vec<&'static str> {
        ENV_FILES
            .into_iter()
            .filter(|file| dotenvy::from_filename(file).is_ok())
            .collect()
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mnemonic = get("SEED").ok_or_else(|| ConfigError::MissingSecret("SEED".into()))?;

        let wallet_address = get("WALLET_ADDRESS").ok_or_else(|| {
            ConfigError::MissingSetting("WALLET_ADDRESS (the wallet that receives mined rewards)".into())
        })?;
        validate_address(&wallet_address)
            .map_err(|e| ConfigError::InvalidConfig(format!("WALLET_ADDRESS: {e}")))?;

        let givers = match get("GIVERS") {
            Some(v) => v.parse::<GiverSet>()?,
            None => GiverSet::default(),
        };

        let api = match get("API").as_deref() {
            None | Some("tonhub") | Some("v4") => Flavor::Primary,
            Some("lite") => Flavor::Peer,
            Some(other) => {
                return Err(ConfigError::InvalidConfig(format!(
                    "API must be `tonhub` or `lite`, got `{other}`"
                )));
            }
        };

        let gpu = parse_number(get("GPU"), "GPU", 0)?;
        let timeout_secs = parse_number(get("TIMEOUT"), "TIMEOUT", DEFAULT_TIMEOUT_SECS)?;
        if timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig("TIMEOUT must be at least 1 second".into()));
        }
        let interval_ms = parse_number(
            get("EVALUATE_INTERVAL_MS"),
            "EVALUATE_INTERVAL_MS",
            DEFAULT_EVALUATE_INTERVAL_MS,
        )?;

        let status_addr = match get("STATUS_PORT") {
            Some(port) => {
                let port: u16 = port
                    .parse()
                    .map_err(|_| ConfigError::InvalidConfig(format!("STATUS_PORT `{port}` is not a port")))?;
                let host = get("STATUS_HOST").unwrap_or_else(|| "127.0.0.1".to_string());
                Some((host, port))
            }
            None => None,
        };

        Ok(Self {
            mnemonic,
            givers,
            givers_file: get("GIVERS_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("givers.json")),
            api,
            miner_bin: resolve_miner_bin(get("BIN").as_deref()),
            gpu,
            timeout_secs,
            primary_endpoint: get("V4_ENDPOINT").unwrap_or_else(|| DEFAULT_V4_ENDPOINT.to_string()),
            secondary_endpoint: get("SECONDARY_V4_ENDPOINT"),
            access_url: get("TON_ACCESS_URL").unwrap_or_else(|| DEFAULT_ACCESS_URL.to_string()),
            global_config_url: get("GLOBAL_CONFIG_URL")
                .unwrap_or_else(|| DEFAULT_GLOBAL_CONFIG_URL.to_string()),
            wallet_address,
            bocs_dir: get("BOCS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("bocs")),
            evaluate_interval: Duration::from_millis(interval_ms.max(1)),
            status_addr,
        })
    }
}

fn parse_number<T: std::str::FromStr>(raw: Option<String>, key: &str, default: T) -> Result<T, ConfigError> {
    match raw {
        Some(v) => v
            .parse()
            .map_err(|_| ConfigError::InvalidConfig(format!("{key} `{v}` is not a valid number"))),
        None => Ok(default),
    }
}

/// `cuda` / `opencl` (alias `amd`) map to the bundled miners, anything else is a path.
pub fn resolve_miner_bin(raw: Option<&str>) -> PathBuf {
    let ext = if cfg!(windows) { ".exe" } else { "" };
    match raw {
        None | Some("cuda") => PathBuf::from(format!("./pow-miner-cuda{ext}")),
        Some("opencl") | Some("amd") => PathBuf::from(format!("./pow-miner-opencl{ext}")),
        Some(path) => PathBuf::from(path),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;

    pub(crate) const WALLET: &str = "EQAAAQIDBAUGBwgJCgsMDQ4PEBESExQVFhcYGRobHB0eHx2j";

    /// Lookup over `pairs`, with a valid wallet address unless one is given.
    pub(crate) fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> + use<> {
        let mut map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        map.entry("WALLET_ADDRESS".to_string())
            .or_insert_with(|| WALLET.to_string());
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_only_seed_is_set() {
        let cfg = Config::from_lookup(lookup(&[("SEED", "word")])).unwrap();
        assert_eq!(cfg.givers, GiverSet::Large);
        assert_eq!(cfg.api, Flavor::Primary);
        assert_eq!(cfg.gpu, 0);
        assert_eq!(cfg.timeout_secs, 5);
        assert_eq!(cfg.primary_endpoint, DEFAULT_V4_ENDPOINT);
        assert_eq!(cfg.secondary_endpoint, None);
        assert_eq!(cfg.access_url, DEFAULT_ACCESS_URL);
        assert_eq!(cfg.wallet_address, WALLET);
        assert_eq!(cfg.bocs_dir, PathBuf::from("bocs"));
        assert_eq!(cfg.evaluate_interval, Duration::from_millis(1000));
        assert!(cfg.status_addr.is_none());
        assert!(cfg.miner_bin.to_string_lossy().contains("pow-miner-cuda"));
    }

    #[test]
    fn reads_every_override() {
        let cfg = Config::from_lookup(lookup(&[
            ("SEED", "word"),
            ("GIVERS", "100"),
            ("API", "lite"),
            ("BIN", "amd"),
            ("GPU", "2"),
            ("TIMEOUT", "30"),
            ("SECONDARY_V4_ENDPOINT", "https://other.example"),
            ("WALLET_ADDRESS", "0:000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f"),
            ("STATUS_PORT", "9090"),
        ]))
        .unwrap();
        assert_eq!(cfg.givers, GiverSet::Small);
        assert_eq!(cfg.api, Flavor::Peer);
        assert!(cfg.miner_bin.to_string_lossy().contains("pow-miner-opencl"));
        assert_eq!(cfg.gpu, 2);
        assert_eq!(cfg.timeout_secs, 30);
        assert_eq!(cfg.secondary_endpoint.as_deref(), Some("https://other.example"));
        assert!(cfg.wallet_address.starts_with("0:0001"));
        assert_eq!(cfg.status_addr, Some(("127.0.0.1".to_string(), 9090)));
    }

    #[test]
    fn missing_seed_is_fatal() {
        assert!(matches!(
            Config::from_lookup(lookup(&[("SEED", "   ")])),
            Err(ConfigError::MissingSecret(_))
        ));
    }

    #[test]
    fn missing_wallet_address_is_fatal() {
        let res = Config::from_lookup(|key: &str| (key == "SEED").then(|| "word".to_string()));
        match res {
            Err(err @ ConfigError::MissingSetting(_)) => {
                assert!(err.to_string().contains("WALLET_ADDRESS"));
            }
            other => panic!("expected a missing setting, got {other:?}"),
        }
    }

    #[test]
    fn invalid_values_are_rejected() {
        let key_hex = "02".to_string() + &"ab".repeat(32);
        for (key, value) in [
            ("GIVERS", "7"),
            ("API", "grpc"),
            ("GPU", "x"),
            ("TIMEOUT", "0"),
            ("WALLET_ADDRESS", key_hex.as_str()),
        ] {
            let res = Config::from_lookup(lookup(&[("SEED", "word"), (key, value)]));
            assert!(matches!(res, Err(ConfigError::InvalidConfig(_))), "{key}={value}");
        }
    }

    #[test]
    fn explicit_bin_path_is_kept() {
        assert_eq!(
            resolve_miner_bin(Some("/opt/miner/pow-miner")),
            PathBuf::from("/opt/miner/pow-miner")
        );
    }
}
