//! Application configuration module
//!
//! Handles loading and validating configuration from environment variables.

use solana_keypair::Keypair;
use solana_pubkey::Pubkey;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("Failed to read keypair {path}: {reason}")]
    Keypair { path: PathBuf, reason: String },
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: Ipv4Addr,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::new(0, 0, 0, 0),
            port: 3000,
        }
    }
}

/// CORS configuration
#[derive(Debug, Clone)]
pub struct CorsConfig {
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["http://localhost:3001".to_string()],
        }
    }
}

/// Backend the node talks to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterKind {
    /// In-memory cluster living inside this process
    Localnet,
    Devnet,
    Testnet,
    Mainnet,
    /// JSON-RPC node at the given URL
    Custom(Url),
}

impl ClusterKind {
    /// Public RPC endpoint of the cluster; `None` for the in-memory one
    pub fn default_endpoint(&self) -> Option<&str> {
        match self {
            ClusterKind::Localnet => None,
            ClusterKind::Devnet => Some("https://api.devnet.solana.com"),
            ClusterKind::Testnet => Some("https://api.testnet.solana.com"),
            ClusterKind::Mainnet => Some("https://api.mainnet-beta.solana.com"),
            ClusterKind::Custom(url) => Some(url.as_str()),
        }
    }
}

impl FromStr for ClusterKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        match raw.to_ascii_lowercase().as_str() {
            "localnet" | "local" => Ok(ClusterKind::Localnet),
            "devnet" => Ok(ClusterKind::Devnet),
            "testnet" => Ok(ClusterKind::Testnet),
            "mainnet" | "mainnet-beta" => Ok(ClusterKind::Mainnet),
            _ => match Url::parse(raw) {
                Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(ClusterKind::Custom(url)),
                _ => Err(ConfigError::InvalidValue(format!(
                    "SOLANA_CLUSTER '{}' is not supported (expected localnet, devnet, testnet, mainnet or an http(s) URL)",
                    raw
                ))),
            },
        }
    }
}

/// Cluster connection and confirmation budget
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub kind: ClusterKind,
    /// `RPC_ENDPOINT` if set, else the cluster's public endpoint
    pub rpc_endpoint: Url,
    pub confirm_attempts: u32,
    pub confirm_interval: Duration,
}

const DEFAULT_RPC_ENDPOINT: &str = "http://127.0.0.1:8899";
const DEFAULT_CONFIRM_ATTEMPTS: u32 = 30;
const DEFAULT_CONFIRM_INTERVAL_MS: u64 = 500;

/// Cross-program synchronization settings
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Wait before reading the multisig after a governance execution
    pub sync_delay: Duration,
    /// Realm used when a request does not name one
    pub active_realm: Option<Pubkey>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_delay: Duration::from_millis(2000),
            active_realm: None,
        }
    }
}

/// Complete application settings
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerConfig,
    pub cors: CorsConfig,
    pub cluster: ClusterConfig,
    pub sync: SyncConfig,
    /// JSON byte-array keypair file; an ephemeral keypair is used when unset
    pub signer_keypair: Option<PathBuf>,
}

impl Settings {
    /// Load settings from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists (ignore errors if file not found)
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key/value source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let server = ServerConfig {
            host: parse_or(&lookup, "HOST", ServerConfig::default().host)?,
            port: parse_or(&lookup, "PORT", ServerConfig::default().port)?,
        };

        let cors = CorsConfig {
            allowed_origins: lookup("ALLOWED_ORIGINS")
                .map(|s| s.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
                .unwrap_or_else(|| CorsConfig::default().allowed_origins),
        };

        let kind: ClusterKind = parse_or(&lookup, "SOLANA_CLUSTER", ClusterKind::Localnet)?;
        let raw_endpoint = lookup("RPC_ENDPOINT")
            .or_else(|| kind.default_endpoint().map(str::to_string))
            .unwrap_or_else(|| DEFAULT_RPC_ENDPOINT.to_string());
        let rpc_endpoint = Url::parse(&raw_endpoint)
            .map_err(|e| ConfigError::InvalidValue(format!("RPC_ENDPOINT '{}': {}", raw_endpoint, e)))?;
        let confirm_attempts: u32 = parse_or(&lookup, "CONFIRM_ATTEMPTS", DEFAULT_CONFIRM_ATTEMPTS)?;
        if confirm_attempts == 0 {
            return Err(ConfigError::InvalidValue("CONFIRM_ATTEMPTS must be at least 1".to_string()));
        }
        let cluster = ClusterConfig {
            kind,
            rpc_endpoint,
            confirm_attempts,
            confirm_interval: Duration::from_millis(parse_or(
                &lookup,
                "CONFIRM_INTERVAL_MS",
                DEFAULT_CONFIRM_INTERVAL_MS,
            )?),
        };

        let sync = SyncConfig {
            sync_delay: Duration::from_millis(parse_or(
                &lookup,
                "SYNC_DELAY_MS",
                SyncConfig::default().sync_delay.as_millis() as u64,
            )?),
            active_realm: lookup("ACTIVE_REALM")
                .map(|raw| {
                    Pubkey::from_str(raw.trim())
                        .map_err(|_| ConfigError::InvalidValue(format!("ACTIVE_REALM '{}' is not an address", raw)))
                })
                .transpose()?,
        };

        Ok(Self {
            server,
            cors,
            cluster,
            sync,
            signer_keypair: lookup("SIGNER_KEYPAIR").map(PathBuf::from),
        })
    }

    /// Keypair of this signer node
    pub fn load_signer(&self) -> Result<Option<Keypair>, ConfigError> {
        let Some(path) = &self.signer_keypair else {
            return Ok(None);
        };
        let keypair_error = |reason: String| ConfigError::Keypair {
            path: path.clone(),
            reason,
        };

        let raw = std::fs::read_to_string(path).map_err(|e| keypair_error(e.to_string()))?;
        let bytes: Vec<u8> = serde_json::from_str(&raw).map_err(|e| keypair_error(e.to_string()))?;
        #[allow(deprecated)]
        let keypair = Keypair::from_bytes(&bytes).map_err(|e| keypair_error(e.to_string()))?;
        Ok(Some(keypair))
    }
}

/// Parse a variable, falling back to `default` only when it is unset
fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(format!("{} '{}'", key, raw))),
        None => Ok(default),
    }
}
