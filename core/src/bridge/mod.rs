/// Public facades, one per chain family, and the backend they drive.
pub mod cosmos;
pub mod evm;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{BridgeConfig, Capability};
use crate::error::{BridgeError, Result};
use crate::path::DerivationPath;
use crate::proxy::{ProxyChannel, ProxyTransport};
use crate::session::{CosmosSession, DirectTransport, EvmSession};
use crate::transport::TransportFactory;

pub use cosmos::{CosmosBridge, CosmosTransaction};
pub use evm::{EvmBridge, EvmTransaction, SignTarget};

/// One row of an address page. `balance` is a placeholder and never fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddressRecord {
    pub address: String,
    pub hd_path: DerivationPath,
    pub index: u64,
    pub balance: u64,
}

/// The device capability a facade talks to, chosen once at construction.
pub enum Backend {
    Direct(DirectTransport),
    Proxy(ProxyTransport),
}

impl Backend {
    pub fn direct(factory: Arc<dyn TransportFactory>) -> Self {
        Self::Direct(DirectTransport::new(factory))
    }

    /// Starts the proxy listener, so this needs a tokio runtime.
    pub fn proxy(config: BridgeConfig, channel: ProxyChannel) -> Self {
        Self::Proxy(ProxyTransport::spawn(config, channel))
    }

    /// Pick the adapter for `capability`. The matching connector must be
    /// supplied; the other one is ignored.
    pub fn select(
        capability: Capability,
        config: BridgeConfig,
        usb: Option<Arc<dyn TransportFactory>>,
        frame: Option<ProxyChannel>,
    ) -> Result<Self> {
        match capability {
            Capability::DirectUsb => usb.map(Self::direct).ok_or_else(|| {
                BridgeError::Unsupported("direct USB capability without a transport".into())
            }),
            Capability::Proxied => frame.map(|channel| Self::proxy(config, channel)).ok_or_else(|| {
                BridgeError::Unsupported("proxied capability without a message channel".into())
            }),
        }
    }

    pub fn capability(&self) -> Capability {
        match self {
            Self::Direct(_) => Capability::DirectUsb,
            Self::Proxy(_) => Capability::Proxied,
        }
    }

    pub fn as_proxy(&self) -> Option<&ProxyTransport> {
        match self {
            Self::Proxy(proxy) => Some(proxy),
            Self::Direct(_) => None,
        }
    }

    pub(crate) fn evm(&mut self) -> &mut dyn EvmSession {
        match self {
            Self::Direct(direct) => direct,
            Self::Proxy(proxy) => proxy,
        }
    }

    pub(crate) fn cosmos(&mut self) -> &mut dyn CosmosSession {
        match self {
            Self::Direct(direct) => direct,
            Self::Proxy(proxy) => proxy,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulator::Emulator;

    #[test]
    fn select_requires_matching_connector() {
        let config = BridgeConfig::evm("https://bridge.example.org/bsc/");
        let usb: Arc<dyn TransportFactory> = Arc::new(Emulator::ethereum());

        let backend = Backend::select(Capability::DirectUsb, config.clone(), Some(usb), None).unwrap();
        assert_eq!(backend.capability(), Capability::DirectUsb);
        assert!(backend.as_proxy().is_none());

        let err = Backend::select(Capability::Proxied, config, None, None).err().unwrap();
        assert!(matches!(err, BridgeError::Unsupported(_)));
    }

    #[test]
    fn address_record_json_shape() {
        let record = AddressRecord {
            address: "0xabc".into(),
            hd_path: "44'/60'/1'/0/0".parse().unwrap(),
            index: 1,
            balance: 0,
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["hdPath"], "44'/60'/1'/0/0");
        assert_eq!(value["index"], 1);
        assert_eq!(value["balance"], 0);
    }
}
