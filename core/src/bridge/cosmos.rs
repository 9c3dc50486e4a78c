/// Cosmos-family (Binance Chain) facade. The device enumerates addresses
/// itself; nothing is cached on this side.
use tracing::{debug, info};

use super::{AddressRecord, Backend};
use crate::app::cosmos::DEFAULT_ADDRESS_LIMIT;
use crate::error::{BridgeError, Result};
use crate::path::{DerivationPath, Pager, HARDENED, MIN_ENUMERATION_DEPTH};

pub const DEFAULT_HRP: &str = "bnb";

/// `44'/714'/0'/0/0`, written `44,714,0,0,0` in plain-index form.
pub fn default_hd_path() -> DerivationPath {
    DerivationPath::new(vec![44 | HARDENED, 714 | HARDENED, HARDENED, 0, 0])
}

/// Transaction object owned by the chain SDK.
pub trait CosmosTransaction {
    /// Canonical bytes the device signs.
    fn sign_bytes(&self) -> Vec<u8>;

    /// Attach a signature. `public_key` is the compressed key.
    fn add_signature(&mut self, public_key: &[u8], signature: &[u8]);
}

pub struct CosmosBridge {
    backend: Backend,
    hd_path: DerivationPath,
    hrp: String,
    pager: Pager,
}

impl CosmosBridge {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            hd_path: default_hd_path(),
            hrp: DEFAULT_HRP.to_string(),
            pager: Pager::default(),
        }
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn hd_path(&self) -> &DerivationPath {
        &self.hd_path
    }

    pub fn hrp(&self) -> &str {
        &self.hrp
    }

    pub fn page(&self) -> u32 {
        self.pager.page()
    }

    pub fn set_hd_path(&mut self, hd_path: DerivationPath) -> Result<()> {
        hd_path.require_depth(MIN_ENUMERATION_DEPTH)?;
        self.hd_path = hd_path;
        Ok(())
    }

    pub fn set_hrp(&mut self, hrp: impl Into<String>) -> Result<()> {
        let hrp = hrp.into();
        crate::validate_hrp(&hrp)?;
        self.hrp = hrp;
        Ok(())
    }

    /// Addresses starting at the current base path.
    pub async fn unlock(&mut self) -> Result<Vec<String>> {
        self.backend
            .cosmos()
            .unlock(&self.hd_path, &self.hrp, DEFAULT_ADDRESS_LIMIT)
            .await
    }

    pub async fn get_first_page(&mut self) -> Result<Vec<AddressRecord>> {
        let range = self.pager.first();
        self.get_page(range.start).await
    }

    pub async fn get_next_page(&mut self) -> Result<Vec<AddressRecord>> {
        let range = self.pager.next();
        self.get_page(range.start).await
    }

    pub async fn get_previous_page(&mut self) -> Result<Vec<AddressRecord>> {
        let range = self.pager.previous();
        self.get_page(range.start).await
    }

    /// Moves the base path's last component to `from` and unlocks there.
    async fn get_page(&mut self, from: u64) -> Result<Vec<AddressRecord>> {
        info!(page = self.pager.page(), from, hrp = %self.hrp, "fetching address page");
        self.hd_path = self
            .hd_path
            .with_last_index(from)
            .ok_or_else(|| BridgeError::InvalidPath(format!("{}: page start {from}", self.hd_path)))?;

        let addresses = self.unlock().await?;
        let mut records = Vec::with_capacity(addresses.len());
        for (offset, address) in (0u64..).zip(addresses) {
            let index = from + offset;
            let Some(hd_path) = self.hd_path.with_last_index(index) else {
                break;
            };
            records.push(AddressRecord {
                address,
                hd_path,
                index,
                balance: 0,
            });
        }
        Ok(records)
    }

    /// Confirm the address on the device, sign `tx.sign_bytes()` and attach
    /// the compressed key and 64-byte signature to `tx`.
    pub async fn sign_transaction<T>(&mut self, tx: &mut T, path: &DerivationPath) -> Result<()>
    where
        T: CosmosTransaction + ?Sized,
    {
        let sign_bytes = tx.sign_bytes();
        debug!(%path, len = sign_bytes.len(), "signing transaction");
        let signature = self
            .backend
            .cosmos()
            .sign_transaction(path, &sign_bytes, &self.hrp)
            .await?;
        tx.add_signature(&signature.public_key, &signature.signature);
        Ok(())
    }

    /// Hex uncompressed public key at `path`.
    pub async fn get_public_key(&mut self, path: &DerivationPath) -> Result<String> {
        Ok(hex::encode(self.backend.cosmos().public_key(path).await?))
    }

    pub async fn sign_message(&mut self, _path: &DerivationPath, _message: &str) -> Result<String> {
        Err(BridgeError::Unsupported("signMessage".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::cosmos::{INS_PUBLIC_KEY, INS_SHOW_ADDRESS, INS_SIGN};
    use crate::emulator::Emulator;
    use std::sync::Arc;

    fn bridge(emulator: &Emulator) -> CosmosBridge {
        CosmosBridge::new(Backend::direct(Arc::new(emulator.clone())))
    }

    #[derive(Default)]
    struct FakeTx {
        signatures: Vec<(Vec<u8>, Vec<u8>)>,
    }

    impl CosmosTransaction for FakeTx {
        fn sign_bytes(&self) -> Vec<u8> {
            br#"{"account_number":"1","chain_id":"Binance-Chain-Tigris"}"#.to_vec()
        }

        fn add_signature(&mut self, public_key: &[u8], signature: &[u8]) {
            self.signatures.push((public_key.to_vec(), signature.to_vec()));
        }
    }

    #[tokio::test]
    async fn pages_rewrite_last_component() {
        let emulator = Emulator::binance();
        let mut cosmos = bridge(&emulator);

        let first = cosmos.get_first_page().await.unwrap();
        assert_eq!(first.len(), 5);
        assert!(first.iter().all(|r| r.address.starts_with("bnb1")));
        assert_eq!(first[4].index, 4);

        let next = cosmos.get_next_page().await.unwrap();
        assert_eq!(next[0].index, 5);
        assert_eq!(next[0].hd_path.to_plain_list(), "44,714,0,0,5");
        assert_eq!(cosmos.hd_path().to_plain_list(), "44,714,0,0,5");

        let back = cosmos.get_previous_page().await.unwrap();
        assert_eq!(back, first);
        assert_eq!(emulator.count_ins(INS_PUBLIC_KEY), 15);
    }

    #[tokio::test]
    async fn next_page_without_first_is_page_one() {
        let emulator = Emulator::binance();
        let mut cosmos = bridge(&emulator);

        let page = cosmos.get_next_page().await.unwrap();
        assert_eq!(cosmos.page(), 1);
        assert_eq!(page[0].index, 0);
        assert_eq!(page[0].hd_path.to_plain_list(), "44,714,0,0,0");
    }

    #[tokio::test]
    async fn hrp_changes_address_prefix() {
        let emulator = Emulator::binance();
        let mut cosmos = bridge(&emulator);
        cosmos.set_hrp("tbnb").unwrap();
        assert!(cosmos.set_hrp("").is_err());
        assert_eq!(cosmos.hrp(), "tbnb");
        let addresses = cosmos.unlock().await.unwrap();
        assert!(addresses[0].starts_with("tbnb1"));
    }

    #[test]
    fn shallow_paths_rejected() {
        let emulator = Emulator::binance();
        let mut cosmos = bridge(&emulator);
        let err = cosmos
            .set_hd_path(DerivationPath::new(vec![44 | HARDENED, 714 | HARDENED]))
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidPath(_)));
    }

    #[tokio::test]
    async fn signs_and_attaches_compressed_key() {
        let emulator = Emulator::binance();
        let mut cosmos = bridge(&emulator);
        let mut tx = FakeTx::default();
        cosmos.sign_transaction(&mut tx, &default_hd_path()).await.unwrap();

        let (public_key, signature) = &tx.signatures[0];
        assert_eq!(public_key.len(), 33);
        assert_eq!(signature.len(), 64);
        assert_eq!(emulator.count_ins(INS_SHOW_ADDRESS), 1);
        assert!(emulator.count_ins(INS_SIGN) >= 2);
    }

    #[tokio::test]
    async fn public_key_and_unsupported_message() {
        let emulator = Emulator::binance();
        let mut cosmos = bridge(&emulator);
        let key = cosmos.get_public_key(&default_hd_path()).await.unwrap();
        assert_eq!(key.len(), 130);

        let err = cosmos
            .sign_message(&default_hd_path(), "hello")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UnsupportedError");
    }
}
