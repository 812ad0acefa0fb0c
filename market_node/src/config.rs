//! Node configuration.
//!
//! Layered with the `config` crate: built-in defaults, then an optional YAML
//! file, then `BMB_`-prefixed environment variables (`__` separates
//! sections, e.g. `BMB_SERVER__PORT=8080`). The legacy `USDT_CONTRACT_ADDRESS`
//! and `ESCROW_WALLET_ADDRESS` variables are honoured last.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::api::rate_limiter::RateLimitConfig;
use crate::market::service::MarketRules;
use crate::payment::DEFAULT_TOKEN_DECIMALS;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub auth: AuthConfig,
    pub payment: PaymentConfig,
    pub market: MarketRules,
    pub monitor: MonitorConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Empty allows any origin
    pub cors_origins: Vec<String>,
    pub max_upload_bytes: usize,
    pub realtime_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            cors_origins: Vec::new(),
            max_upload_bytes: 5 * 1024 * 1024,
            realtime_buffer: 1000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Rocksdb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectBackend {
    Memory,
    Fs,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub data_dir: PathBuf,
    pub objects: ObjectBackend,
    pub objects_dir: PathBuf,
    /// Prefix of public object URLs
    pub public_base_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            data_dir: PathBuf::from("data/db"),
            objects: ObjectBackend::Memory,
            objects_dir: PathBuf::from("data/objects"),
            public_base_url: "http://localhost:3000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub audience: String,
    pub token_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: "dev-secret-change-me".to_string(),
            audience: "authenticated".to_string(),
            token_ttl_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaymentConfig {
    pub rpc_url: Option<String>,
    pub usdt_contract_address: Option<String>,
    pub escrow_wallet_address: Option<String>,
    /// Receives the platform share; unset keeps it in escrow
    pub platform_wallet_address: Option<String>,
    /// Signs settlement transfers out of escrow
    pub escrow_private_key: Option<String>,
    pub token_decimals: u32,
    pub confirmation_timeout_secs: u64,
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            rpc_url: None,
            usdt_contract_address: None,
            escrow_wallet_address: None,
            platform_wallet_address: None,
            escrow_private_key: None,
            token_decimals: DEFAULT_TOKEN_DECIMALS,
            confirmation_timeout_secs: 120,
        }
    }
}

impl PaymentConfig {
    /// On-chain verification needs an RPC endpoint, the token and the escrow
    pub fn verifies_on_chain(&self) -> bool {
        self.rpc_url.is_some()
            && self.usdt_contract_address.is_some()
            && self.escrow_wallet_address.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub sweep_interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
        }
    }
}

impl NodeConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("BMB")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("failed to read configuration")?;

        let mut cfg: NodeConfig = settings
            .try_deserialize()
            .context("invalid configuration")?;
        cfg.apply_legacy_env();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_legacy_env(&mut self) {
        if let Ok(address) = std::env::var("USDT_CONTRACT_ADDRESS") {
            self.payment.usdt_contract_address = Some(address);
        }
        if let Ok(address) = std::env::var("ESCROW_WALLET_ADDRESS") {
            self.payment.escrow_wallet_address = Some(address);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.auth.jwt_secret.is_empty() {
            bail!("auth.jwt_secret must be set");
        }
        if self.market.win_threshold == 0 {
            bail!("market.win_threshold must be positive");
        }
        if self.market.dispute_window_hours <= 0 || self.market.approval_window_hours <= 0 {
            bail!("market windows must be positive");
        }
        if self.monitor.sweep_interval_secs == 0 {
            bail!("monitor.sweep_interval_secs must be positive");
        }
        if self.payment.escrow_private_key.is_some()
            && (self.payment.rpc_url.is_none() || self.payment.usdt_contract_address.is_none())
        {
            bail!("payment.escrow_private_key needs payment.rpc_url and payment.usdt_contract_address");
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("failed to render configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_validate() {
        let cfg = NodeConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.market.win_threshold, 248);
        assert_eq!(cfg.market.dispute_window_hours, 72);
        assert_eq!(cfg.payment.token_decimals, 18);
        assert!(!cfg.payment.verifies_on_chain());
    }

    #[test]
    fn yaml_file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "server:\n  port: 8088\nmarket:\n  win_threshold: 10\npayment:\n  token_decimals: 6\n"
        )
        .unwrap();

        let cfg = NodeConfig::load(Some(file.path())).unwrap();
        assert_eq!(cfg.server.port, 8088);
        assert_eq!(cfg.market.win_threshold, 10);
        assert_eq!(cfg.market.dispute_window_hours, 72);
        assert_eq!(cfg.payment.token_decimals, 6);
    }

    #[test]
    fn signer_without_rpc_is_rejected() {
        let mut cfg = NodeConfig::default();
        cfg.payment.escrow_private_key = Some("0x01".into());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn yaml_dump_round_trips() {
        let cfg = NodeConfig::default();
        let yaml = cfg.to_yaml().unwrap();
        let parsed: NodeConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.server.port, cfg.server.port);
        assert_eq!(parsed.storage.backend, StorageBackend::Memory);
    }
}
