//! Configuration for the headless rider.

use alloy_primitives::B256;
use alloy_signer_local::PrivateKeySigner;
use clap::Parser;
use ride4low_types::chain::{ChainId, Eip155ChainReference};
use ride4low_types::config::LiteralOrEnv;
use ride4low_types::ride::{Coordinate, PaymentMethod, RouteFare};
use ride4low_x402::{Eip1193Authority, LocalAuthority, QuotePolicy, SigningAuthority};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use url::Url;

/// CLI arguments for the rider.
#[derive(Parser, Debug)]
#[command(name = "ride4low")]
#[command(about = "Headless Ride4Low rider: follows one trip and pays for it")]
struct CliArgs {
    /// Path to the JSON configuration file
    #[arg(long, short, env = "CONFIG", default_value = "config.json")]
    config: PathBuf,
}

/// Rider configuration.
///
/// URLs fall back to environment variables, then to local development
/// defaults.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "config_defaults::default_websocket_url")]
    websocket_url: LiteralOrEnv<Url>,
    #[serde(default = "config_defaults::default_api_url")]
    api_url: LiteralOrEnv<Url>,
    #[serde(default = "config_defaults::default_payment_path")]
    payment_path: String,
    #[serde(default)]
    user_id: Option<LiteralOrEnv<String>>,
    #[serde(default)]
    location: Option<Coordinate>,
    #[serde(default)]
    fare: Option<RouteFare>,
    #[serde(default)]
    payment_method: Option<PaymentMethod>,
    #[serde(default = "config_defaults::default_signer")]
    signer: SignerConfig,
    #[serde(default)]
    quote_policy: QuotePolicy,
}

/// Who signs payment authorizations.
///
/// ```json
/// { "private_key": "$RIDER_PRIVATE_KEY", "network": "eip155:84532" }
/// ```
///
/// or a wallet bridge speaking EIP-1193 over JSON-RPC, which is the default
/// (`$WALLET_RPC_URL`, else `http://localhost:8545`):
///
/// ```json
/// { "rpc": "http://localhost:8545" }
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SignerConfig {
    PrivateKey {
        private_key: LiteralOrEnv<RiderPrivateKey>,
        #[serde(default = "config_defaults::default_network")]
        network: ChainId,
    },
    Wallet {
        rpc: LiteralOrEnv<Url>,
    },
}

/// A 32-byte secp256k1 private key, hex encoded.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RiderPrivateKey(B256);

impl std::fmt::Debug for RiderPrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RiderPrivateKey(..)")
    }
}

impl FromStr for RiderPrivateKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        B256::from_str(s)
            .map(Self)
            .map_err(|e| format!("Invalid rider private key: {e}"))
    }
}

pub mod config_defaults {
    use super::SignerConfig;
    use ride4low_types::chain::ChainId;
    use ride4low_types::config::LiteralOrEnv;
    use std::env;
    use url::Url;

    pub const DEFAULT_WEBSOCKET_URL: &str = "ws://localhost:8082/ws";
    pub const DEFAULT_API_URL: &str = "http://localhost:8081";
    pub const DEFAULT_PAYMENT_PATH: &str = "/trip/pay";
    pub const DEFAULT_WALLET_RPC_URL: &str = "http://localhost:8545";

    fn url_from_env(var: &str, fallback: &str) -> LiteralOrEnv<Url> {
        let url = env::var(var)
            .ok()
            .and_then(|s| Url::parse(&s).ok())
            .unwrap_or_else(|| Url::parse(fallback).expect("default URL is valid"));
        LiteralOrEnv::from_literal(url)
    }

    /// $WEBSOCKET_URL -> ws://localhost:8082/ws
    pub fn default_websocket_url() -> LiteralOrEnv<Url> {
        url_from_env("WEBSOCKET_URL", DEFAULT_WEBSOCKET_URL)
    }

    /// $API_URL -> http://localhost:8081
    pub fn default_api_url() -> LiteralOrEnv<Url> {
        url_from_env("API_URL", DEFAULT_API_URL)
    }

    pub fn default_signer() -> SignerConfig {
        SignerConfig::Wallet {
            rpc: url_from_env("WALLET_RPC_URL", DEFAULT_WALLET_RPC_URL),
        }
    }

    pub fn default_payment_path() -> String {
        DEFAULT_PAYMENT_PATH.to_string()
    }

    pub fn default_network() -> ChainId {
        ChainId::new("eip155", "84532")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {0}: {1}")]
    FileRead(PathBuf, std::io::Error),
    #[error("Failed to parse config file: {0}")]
    JsonParse(#[from] serde_json::Error),
    #[error("Invalid payment path {path}: {source}")]
    PaymentPath {
        path: String,
        #[source]
        source: url::ParseError,
    },
    #[error("Signer network {0} is not an EVM chain")]
    SignerNetwork(ChainId),
    #[error("Invalid signer key: {0}")]
    SignerKey(String),
}

impl Config {
    pub fn websocket_url(&self) -> &Url {
        self.websocket_url.inner()
    }

    pub fn api_url(&self) -> &Url {
        self.api_url.inner()
    }

    /// The crypto payment endpoint, `api_url` joined with `payment_path`.
    pub fn payment_url(&self) -> Result<Url, ConfigError> {
        let path = self.payment_path.trim_start_matches('/');
        let mut base = self.api_url.inner().clone();
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        base.join(path).map_err(|source| ConfigError::PaymentPath {
            path: self.payment_path.clone(),
            source,
        })
    }

    /// Empty when no rider is configured.
    pub fn user_id(&self) -> &str {
        self.user_id.as_ref().map(|id| id.inner().as_str()).unwrap_or("")
    }

    pub fn location(&self) -> Option<Coordinate> {
        self.location
    }

    pub fn fare(&self) -> Option<&RouteFare> {
        self.fare.as_ref()
    }

    pub fn payment_method(&self) -> Option<PaymentMethod> {
        self.payment_method
    }

    pub fn quote_policy(&self) -> &QuotePolicy {
        &self.quote_policy
    }

    pub fn signer(&self) -> &SignerConfig {
        &self.signer
    }

    /// Builds the configured signing authority.
    pub fn signing_authority(&self) -> Result<Arc<dyn SigningAuthority>, ConfigError> {
        let authority: Arc<dyn SigningAuthority> = match &self.signer {
            SignerConfig::PrivateKey {
                private_key,
                network,
            } => {
                let home = Eip155ChainReference::try_from(network)
                    .map_err(|_| ConfigError::SignerNetwork(network.clone()))?;
                let signer = PrivateKeySigner::from_bytes(&private_key.inner().0)
                    .map_err(|e| ConfigError::SignerKey(e.to_string()))?;
                Arc::new(LocalAuthority::new(signer, home))
            }
            SignerConfig::Wallet { rpc } => Arc::new(Eip1193Authority::new(rpc.inner().clone())),
        };
        Ok(authority)
    }

    /// Load configuration from CLI arguments and JSON file.
    ///
    /// The config file path is determined by:
    /// 1. `--config <path>` CLI argument or `$CONFIG`
    /// 2. `./config.json`
    pub fn load() -> Result<Self, ConfigError> {
        let cli_args = CliArgs::parse();
        let config_path = Path::new(&cli_args.config)
            .canonicalize()
            .map_err(|e| ConfigError::FileRead(cli_args.config, e))?;
        Self::load_from_path(config_path)
    }

    fn load_from_path(path: PathBuf) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(&path).map_err(|e| ConfigError::FileRead(path, e))?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }
}
