/// Bridge configuration: where the bridge frame lives, how it is addressed,
/// and which device capability the host has.
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

/// Hosted bridge pages, one sub-path per chain family.
pub const DEFAULT_BRIDGE_BASE: &str = "https://binance-chain-npm.github.io/bc-ledger-bridge";

/// Environment variable overriding [`DEFAULT_BRIDGE_BASE`].
pub const BRIDGE_URL_ENV: &str = "LEDGER_BRIDGE_URL";

/// Long enough for a user to read and confirm a transaction on the device.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainFamily {
    Evm,
    Cosmos,
}

impl ChainFamily {
    /// Tag the frame filters inbound envelopes on.
    pub fn target_tag(self) -> &'static str {
        match self {
            Self::Evm => "LEDGER-IFRAME",
            Self::Cosmos => "BC-LEDGER-IFRAME",
        }
    }

    fn bridge_path(self) -> &'static str {
        match self {
            Self::Evm => "bsc/",
            Self::Cosmos => "bbc/",
        }
    }
}

impl fmt::Display for ChainFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Evm => write!(f, "evm"),
            Self::Cosmos => write!(f, "cosmos"),
        }
    }
}

impl FromStr for ChainFamily {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "evm" | "bsc" | "eth" => Ok(Self::Evm),
            "cosmos" | "bbc" | "bnb" => Ok(Self::Cosmos),
            other => Err(BridgeError::Unsupported(format!("chain family {other}"))),
        }
    }
}

/// How the host reaches the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// The host can open USB/HID itself.
    DirectUsb,
    /// Device I/O happens in a bridge frame reached over a message channel.
    Proxied,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub bridge_url: String,
    pub target_tag: String,
    #[serde(default = "default_timeout")]
    pub request_timeout: Duration,
}

fn default_timeout() -> Duration {
    DEFAULT_REQUEST_TIMEOUT
}

impl BridgeConfig {
    pub fn new(family: ChainFamily, bridge_url: impl Into<String>) -> Self {
        Self {
            bridge_url: bridge_url.into(),
            target_tag: family.target_tag().to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn evm(bridge_url: impl Into<String>) -> Self {
        Self::new(ChainFamily::Evm, bridge_url)
    }

    pub fn cosmos(bridge_url: impl Into<String>) -> Self {
        Self::new(ChainFamily::Cosmos, bridge_url)
    }

    /// Family page under `LEDGER_BRIDGE_URL`, or under the hosted default.
    pub fn from_env(family: ChainFamily) -> Self {
        let base = std::env::var(BRIDGE_URL_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BRIDGE_BASE.to_string());
        Self::new(family, bridge_url_for(&base, family))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Scheme and authority of the bridge URL; replies must come from here.
    pub fn origin(&self) -> String {
        origin_of(&self.bridge_url)
    }
}

/// `https://host:port/some/path` -> `https://host:port`.
pub fn origin_of(url: &str) -> String {
    url.split('/').take(3).collect::<Vec<_>>().join("/")
}

fn bridge_url_for(base: &str, family: ChainFamily) -> String {
    format!("{}/{}", base.trim_end_matches('/'), family.bridge_path())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_is_first_three_segments() {
        let config = BridgeConfig::evm("https://bridge.example.org:8443/bsc/index.html");
        assert_eq!(config.origin(), "https://bridge.example.org:8443");
        assert_eq!(origin_of("https://a.b"), "https://a.b");
    }

    #[test]
    fn family_tags() {
        assert_eq!(BridgeConfig::evm("https://x").target_tag, "LEDGER-IFRAME");
        assert_eq!(BridgeConfig::cosmos("https://x").target_tag, "BC-LEDGER-IFRAME");
    }

    #[test]
    fn family_paths() {
        assert_eq!(
            bridge_url_for("https://bridge.example.org/", ChainFamily::Cosmos),
            "https://bridge.example.org/bbc/"
        );
        assert_eq!(
            bridge_url_for(DEFAULT_BRIDGE_BASE, ChainFamily::Evm),
            "https://binance-chain-npm.github.io/bc-ledger-bridge/bsc/"
        );
    }

    #[test]
    fn family_parse() {
        assert_eq!("BSC".parse::<ChainFamily>().unwrap(), ChainFamily::Evm);
        assert_eq!("cosmos".parse::<ChainFamily>().unwrap(), ChainFamily::Cosmos);
        assert!("solana".parse::<ChainFamily>().is_err());
    }

    #[test]
    fn config_deserializes_without_timeout() {
        let config: BridgeConfig = serde_json::from_str(
            r#"{"bridge_url":"https://x/bsc/","target_tag":"LEDGER-IFRAME"}"#,
        )
        .unwrap();
        assert_eq!(config.request_timeout, DEFAULT_REQUEST_TIMEOUT);
    }
}
