//! Process configuration, loaded once at startup.
//!
//! Every knob is a CLI flag with an environment-variable fallback; `.env`
//! values are loaded by the entrypoint before parsing. Required values
//! without defaults abort startup through clap, and [`Config::validate`]
//! enforces the cross-field constraints (at least one relayer key, markup in
//! range).

use alloy_primitives::{Address, B256};
use alloy_signer_local::PrivateKeySigner;
use clap::Parser;
use std::str::FromStr;
use url::Url;

/// A validated EVM private key (32 bytes).
///
/// Parsed and checked before any signer is constructed so a malformed key is
/// a startup error, not a first-request failure.
#[derive(Clone, Copy)]
pub struct EvmPrivateKey(B256);

impl EvmPrivateKey {
    pub fn signer(&self) -> Result<PrivateKeySigner, ConfigError> {
        PrivateKeySigner::from_bytes(&self.0)
            .map_err(|e| ConfigError::Invalid(format!("unusable relayer key: {e}")))
    }
}

impl FromStr for EvmPrivateKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        B256::from_str(s)
            .map(Self)
            .map_err(|e| format!("Invalid evm private key: {e}"))
    }
}

// Keys never appear in logs or panics.
impl std::fmt::Debug for EvmPrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EvmPrivateKey(..)")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Server configuration.
#[derive(Parser, Debug, Clone)]
#[command(name = "relay402")]
#[command(about = "Gasless transaction relay HTTP server")]
pub struct Config {
    /// JSON-RPC endpoint of the target chain.
    #[arg(long, env = "CHAIN_RPC_URL")]
    pub chain_rpc_url: Url,

    /// Numeric EIP-155 chain id.
    #[arg(long, env = "CHAIN_ID")]
    pub chain_id: u64,

    /// Single relayer key; alternative to `RELAYER_PRIVATE_KEYS`.
    #[arg(long, env = "RELAYER_PRIVATE_KEY")]
    pub relayer_private_key: Option<EvmPrivateKey>,

    /// Comma-separated list of relayer keys. The first key is the primary
    /// wallet used for health checks and rebalancing.
    #[arg(long, env = "RELAYER_PRIVATE_KEYS", value_delimiter = ',')]
    pub relayer_private_keys: Vec<EvmPrivateKey>,

    /// EIP-3009 capable stablecoin contract.
    #[arg(long, env = "STABLECOIN_ADDRESS")]
    pub stablecoin_address: Address,

    /// Decimal places of the stablecoin.
    #[arg(long, env = "STABLECOIN_DECIMALS", default_value_t = 6)]
    pub stablecoin_decimals: u8,

    /// Trusted forwarder contract.
    #[arg(long, env = "FORWARDER_ADDRESS")]
    pub forwarder_address: Address,

    /// Wallet that receives stablecoin payments.
    #[arg(long, env = "RECEIVING_WALLET")]
    pub receiving_wallet: Address,

    /// Markup charged above gas cost, in percent (0..=100).
    #[arg(long, env = "MARKUP_PERCENTAGE", default_value_t = 20.0)]
    pub markup_percentage: f64,

    /// Price floor per relay, USD.
    #[arg(long, env = "MIN_PRICE_USD", default_value_t = 0.01)]
    pub min_price_usd: f64,

    /// Price ceiling per relay, USD.
    #[arg(long, env = "MAX_PRICE_USD", default_value_t = 10.0)]
    pub max_price_usd: f64,

    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: std::net::IpAddr,

    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// `development` or `production`; controls log verbosity defaults.
    #[arg(long, env = "NODE_ENV", default_value = "development")]
    pub node_env: String,

    /// Timeout applied to every outbound RPC call.
    #[arg(long, env = "RPC_TIMEOUT_SECS", default_value_t = 30)]
    pub rpc_timeout_secs: u64,

    /// How long to wait for a transaction receipt.
    #[arg(long, env = "RECEIPT_TIMEOUT_SECS", default_value_t = 30)]
    pub receipt_timeout_secs: u64,

    /// Floor applied when the node reports a zero or dust gas price, gwei.
    #[arg(long, env = "GAS_PRICE_FLOOR_GWEI", default_value_t = 5000)]
    pub gas_price_floor_gwei: u64,

    /// Native/USD spot refresh cadence.
    #[arg(long, env = "PRICE_REFRESH_SECS", default_value_t = 30)]
    pub price_refresh_secs: u64,

    /// How long a quote is honored.
    #[arg(long, env = "QUOTE_VALIDITY_SECS", default_value_t = 60)]
    pub quote_validity_secs: u64,

    /// External price API returning `{"<id>":{"usd":<number>}}`.
    #[arg(long, env = "PRICE_ORACLE_URL")]
    pub price_oracle_url: Option<Url>,

    #[arg(long, env = "PRICE_ORACLE_API_KEY")]
    pub price_oracle_api_key: Option<String>,

    /// V2-style swap router for stablecoin -> native rebalancing. The
    /// rebalance loop stays disabled unless both this and
    /// `WRAPPED_NATIVE_ADDRESS` are set.
    #[arg(long, env = "SWAP_ROUTER_ADDRESS")]
    pub swap_router_address: Option<Address>,

    #[arg(long, env = "WRAPPED_NATIVE_ADDRESS")]
    pub wrapped_native_address: Option<Address>,

    /// Native balance the rebalancer tops the primary wallet up to, in whole
    /// native units.
    #[arg(long, env = "REBALANCE_TARGET_NATIVE", default_value_t = 50.0)]
    pub rebalance_target_native: f64,
}

impl Config {
    /// Parse from CLI arguments and environment, then validate.
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::parse();
        config.validate()?;
        Ok(config)
    }

    /// Cross-field validation; called once at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.relayer_private_key.is_none() && self.relayer_private_keys.is_empty() {
            return Err(ConfigError::Invalid(
                "RELAYER_PRIVATE_KEY or RELAYER_PRIVATE_KEYS must be set".into(),
            ));
        }
        if !(0.0..=100.0).contains(&self.markup_percentage) {
            return Err(ConfigError::Invalid(format!(
                "MARKUP_PERCENTAGE must be within 0..=100, got {}",
                self.markup_percentage
            )));
        }
        if self.min_price_usd < 0.0 || self.max_price_usd < self.min_price_usd {
            return Err(ConfigError::Invalid(format!(
                "price bounds out of order: min {} max {}",
                self.min_price_usd, self.max_price_usd
            )));
        }
        if self.stablecoin_decimals > 18 {
            return Err(ConfigError::Invalid(format!(
                "STABLECOIN_DECIMALS must be <= 18, got {}",
                self.stablecoin_decimals
            )));
        }
        Ok(())
    }

    /// All configured relayer signers, single key first when both forms are
    /// given. Order is stable: the first signer is the primary wallet.
    pub fn signers(&self) -> Result<Vec<PrivateKeySigner>, ConfigError> {
        let mut signers = Vec::new();
        if let Some(key) = &self.relayer_private_key {
            signers.push(key.signer()?);
        }
        for key in &self.relayer_private_keys {
            signers.push(key.signer()?);
        }
        if signers.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one relayer key must be configured".into(),
            ));
        }
        Ok(signers)
    }

    pub fn is_production(&self) -> bool {
        self.node_env == "production"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config::parse_from([
            "relay402",
            "--chain-rpc-url",
            "http://localhost:8545",
            "--chain-id",
            "25",
            "--relayer-private-key",
            "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80",
            "--stablecoin-address",
            "0xc21223249ca28397b4b6541dffaecc539bff0c59",
            "--forwarder-address",
            "0x5fbdb2315678afecb367f032d93f642f64180aa3",
            "--receiving-wallet",
            "0x70997970c51812dc3a010c7d01b50e0d17dc79c8",
        ])
    }

    #[test]
    fn accepts_minimal_configuration() {
        let config = base_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.signers().unwrap().len(), 1);
        assert_eq!(config.port, 3000);
        assert_eq!(config.markup_percentage, 20.0);
    }

    #[test]
    fn rejects_markup_out_of_range() {
        let mut config = base_config();
        config.markup_percentage = 140.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_missing_keys() {
        let mut config = base_config();
        config.relayer_private_key = None;
        config.relayer_private_keys.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_comma_separated_key_list() {
        let config = Config::parse_from([
            "relay402",
            "--chain-rpc-url",
            "http://localhost:8545",
            "--chain-id",
            "25",
            "--relayer-private-keys",
            "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80,0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d",
            "--stablecoin-address",
            "0xc21223249ca28397b4b6541dffaecc539bff0c59",
            "--forwarder-address",
            "0x5fbdb2315678afecb367f032d93f642f64180aa3",
            "--receiving-wallet",
            "0x70997970c51812dc3a010c7d01b50e0d17dc79c8",
        ]);
        assert_eq!(config.signers().unwrap().len(), 2);
    }

    #[test]
    fn key_debug_is_redacted() {
        let key: EvmPrivateKey =
            "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80"
                .parse()
                .unwrap();
        assert_eq!(format!("{key:?}"), "EvmPrivateKey(..)");
    }
}
