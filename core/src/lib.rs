pub mod apdu;
pub mod app;
pub mod bridge;
pub mod classify;
pub mod config;
pub mod emulator;
pub mod error;
pub mod keys;
pub mod path;
pub mod proxy;
pub mod session;
pub mod transport;

pub use apdu::{ApduAnswer, ApduCommand};
pub use bridge::{
    AddressRecord, Backend, CosmosBridge, CosmosTransaction, EvmBridge, EvmTransaction, SignTarget,
};
pub use classify::{classify, DeviceError};
pub use config::{BridgeConfig, Capability, ChainFamily};
pub use error::{BridgeError, Result};
pub use keys::PublicKeyMaterial;
pub use path::{DerivationPath, Enumeration, Pager, PathCodec};
pub use proxy::{ProxyCanceller, ProxyChannel, ProxyTransport, Responder};
pub use session::{CosmosSession, DeviceSession, DirectTransport, EvmSession};
pub use transport::{Transport, TransportFactory};

/// Reject human-readable parts that cannot prefix a bech32 address.
/// Mixed case is refused even though bech32 itself is case-insensitive.
pub fn validate_hrp(hrp: &str) -> Result<()> {
    if hrp.is_empty() {
        return Err(BridgeError::Protocol("hrp cannot be empty".into()));
    }
    if hrp.chars().any(|c| c.is_ascii_uppercase()) {
        return Err(BridgeError::Protocol(format!("hrp {hrp:?} must be lowercase")));
    }
    bech32::Hrp::parse(hrp)
        .map(|_| ())
        .map_err(|e| BridgeError::Protocol(format!("invalid hrp {hrp:?}: {e}")))
}
