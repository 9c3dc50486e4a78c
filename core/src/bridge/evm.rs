/// EVM-family facade: unlock, address pages, transaction and personal-message
/// signing.
///
/// Keeps a one-slot public-key cache keyed by path. Legacy pages and the
/// address → index reverse lookup are derived locally from the cached key,
/// so only the base unlock touches the device.
use std::collections::HashMap;
use std::ops::Range;

use tracing::{debug, info};

use super::{AddressRecord, Backend};
use crate::error::{BridgeError, Result};
use crate::keys::{recover_personal_signer, to_checksum_address, PublicKeyMaterial};
use crate::path::{DerivationPath, Enumeration, Pager, PathCodec, HARDENED, MAX_CHILD_INDEX};

/// Reverse lookup scans this many legacy indices.
pub const MAX_INDEX: u64 = 1000;

/// `m/44'/60'/0'`.
pub fn default_hd_path() -> DerivationPath {
    DerivationPath::new(vec![44 | HARDENED, 60 | HARDENED, HARDENED])
}

/// Ledger-Live template `m/44'/60'/0'/0/0`.
pub fn ledger_live_hd_path() -> DerivationPath {
    DerivationPath::new(vec![44 | HARDENED, 60 | HARDENED, HARDENED, 0, 0])
}

/// Transaction object owned by the chain SDK.
pub trait EvmTransaction {
    fn chain_id(&self) -> u64;

    /// Destination address, if any.
    fn to(&self) -> Option<String>;

    fn set_signature(&mut self, v: u64, r: [u8; 32], s: [u8; 32]);

    /// Signable encoding with the current signature fields.
    fn serialize(&self) -> Vec<u8>;
}

/// What to sign with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignTarget {
    Path(DerivationPath),
    /// Resolved through the account index in Ledger-Live mode, or by reverse
    /// lookup of the address in legacy mode.
    Address { address: String, account_index: u64 },
}

struct CachedKey {
    path: DerivationPath,
    material: PublicKeyMaterial,
}

pub struct EvmBridge {
    backend: Backend,
    hd_path: DerivationPath,
    codec: PathCodec,
    hdk: Option<CachedKey>,
    pager: Pager,
    paths: HashMap<String, u64>,
}

impl EvmBridge {
    pub fn new(backend: Backend) -> Self {
        Self::with_hd_path(backend, default_hd_path())
    }

    pub fn with_hd_path(backend: Backend, hd_path: DerivationPath) -> Self {
        Self {
            backend,
            hd_path,
            codec: PathCodec::new(ledger_live_hd_path()),
            hdk: None,
            pager: Pager::default(),
            paths: HashMap::new(),
        }
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn hd_path(&self) -> &DerivationPath {
        &self.hd_path
    }

    /// Changing the base path drops the cached key and remembered addresses.
    pub fn set_hd_path(&mut self, hd_path: DerivationPath) {
        if hd_path != self.hd_path {
            self.hdk = None;
            self.paths.clear();
        }
        self.hd_path = hd_path;
    }

    pub fn is_unlocked(&self) -> bool {
        self.base_key().is_some()
    }

    pub fn page(&self) -> u32 {
        self.pager.page()
    }

    fn base_key(&self) -> Option<&PublicKeyMaterial> {
        self.hdk
            .as_ref()
            .filter(|cached| cached.path == self.hd_path)
            .map(|cached| &cached.material)
    }

    /// Key at `path`, from the cache slot if it holds that path.
    async fn material_at(&mut self, path: &DerivationPath) -> Result<PublicKeyMaterial> {
        if let Some(cached) = self.hdk.as_ref().filter(|c| &c.path == path) {
            return Ok(cached.material.clone());
        }
        let material = self.backend.evm().unlock(path).await?;
        self.hdk = Some(CachedKey {
            path: path.clone(),
            material: material.clone(),
        });
        Ok(material)
    }

    /// Address at `path`, or at the base path. Without an explicit path a
    /// cached base key is returned without touching the device.
    pub async fn unlock(&mut self, path: Option<&DerivationPath>) -> Result<String> {
        let path = match path {
            Some(path) => path.clone(),
            None => self.hd_path.clone(),
        };
        Ok(self.material_at(&path).await?.address)
    }

    pub async fn get_first_page(&mut self) -> Result<Vec<AddressRecord>> {
        let range = self.pager.first();
        self.get_page(range).await
    }

    pub async fn get_next_page(&mut self) -> Result<Vec<AddressRecord>> {
        let range = self.pager.next();
        self.get_page(range).await
    }

    pub async fn get_previous_page(&mut self) -> Result<Vec<AddressRecord>> {
        let range = self.pager.previous();
        self.get_page(range).await
    }

    async fn get_page(&mut self, range: Range<u64>) -> Result<Vec<AddressRecord>> {
        let mode = self.codec.enumeration(&self.hd_path);
        info!(page = self.pager.page(), ?mode, "fetching address page");
        match mode {
            Enumeration::FixedAccount => self.accounts_fixed(range).await,
            Enumeration::Legacy => self.accounts_legacy(range).await,
        }
    }

    /// One device unlock per hardened account.
    async fn accounts_fixed(&mut self, range: Range<u64>) -> Result<Vec<AddressRecord>> {
        let mut accounts = Vec::new();
        for index in range {
            let Some(path) = self.codec.path_for_index(&self.hd_path, index) else {
                break;
            };
            let material = self.material_at(&path).await?;
            accounts.push(AddressRecord {
                address: material.address,
                hd_path: path,
                index,
                balance: 0,
            });
        }
        Ok(accounts)
    }

    /// Children of the base key, derived locally.
    async fn accounts_legacy(&mut self, range: Range<u64>) -> Result<Vec<AddressRecord>> {
        let base = self.base_material().await?;
        let mut accounts = Vec::new();
        for index in range {
            let Some(path) = self.codec.path_for_index(&self.hd_path, index) else {
                break;
            };
            let address = address_for_index(&base, index)?;
            self.paths.insert(address.clone(), index);
            accounts.push(AddressRecord {
                address,
                hd_path: path,
                index,
                balance: 0,
            });
        }
        Ok(accounts)
    }

    async fn base_material(&mut self) -> Result<PublicKeyMaterial> {
        let base = self.hd_path.clone();
        self.material_at(&base).await
    }

    /// Legacy index of `address`: remembered from a page, or found by
    /// scanning the first [`MAX_INDEX`] children.
    async fn index_from_address(&mut self, address: &str) -> Result<u64> {
        let checksummed = to_checksum_address(address)?;
        if let Some(index) = self.paths.get(&checksummed) {
            return Ok(*index);
        }
        let base = self.base_material().await?;
        for index in 0..MAX_INDEX {
            if address_for_index(&base, index)? == checksummed {
                self.paths.insert(checksummed, index);
                return Ok(index);
            }
        }
        Err(BridgeError::UnknownAddress(checksummed))
    }

    async fn resolve_path(&mut self, target: &SignTarget) -> Result<DerivationPath> {
        let index = match target {
            SignTarget::Path(path) => return Ok(path.clone()),
            SignTarget::Address {
                address,
                account_index,
            } => match self.codec.enumeration(&self.hd_path) {
                Enumeration::FixedAccount => *account_index,
                Enumeration::Legacy => self.index_from_address(address).await?,
            },
        };
        self.codec
            .path_for_index(&self.hd_path, index)
            .ok_or_else(|| BridgeError::InvalidPath(format!("{}/{index}", self.hd_path)))
    }

    /// Sign `tx` in place. Signature fields are reset to `(chain id, 0, 0)`
    /// before serialization and replaced with the device's `(v, r, s)`.
    pub async fn sign_transaction<T>(&mut self, tx: &mut T, target: &SignTarget) -> Result<()>
    where
        T: EvmTransaction + ?Sized,
    {
        let path = self.resolve_path(target).await?;
        tx.set_signature(tx.chain_id(), [0; 32], [0; 32]);
        let bytes = tx.serialize();
        let to = tx.to().map(|to| to.to_lowercase());
        debug!(%path, len = bytes.len(), "signing transaction");

        let signature = self
            .backend
            .evm()
            .sign_transaction(&path, &bytes, to.as_deref())
            .await?;
        tx.set_signature(u64::from(signature.v), signature.r, signature.s);
        Ok(())
    }

    /// Personal-sign `message` (hex with `0x` prefix, or plain text) and
    /// return `0x` ‖ r ‖ s ‖ v. The signature must recover to the target
    /// address or the call fails.
    pub async fn sign_message(&mut self, message: &str, target: &SignTarget) -> Result<String> {
        let bytes = message_bytes(message);
        let path = self.resolve_path(target).await?;
        let expected = match target {
            SignTarget::Address { address, .. } => to_checksum_address(address)?,
            SignTarget::Path(path) => self.material_at(path).await?.address,
        };

        let signature = self
            .backend
            .evm()
            .sign_personal_message(&path, &bytes)
            .await?;
        let recovered = recover_personal_signer(&bytes, &signature.r, &signature.s, signature.v)?;
        if recovered != expected {
            return Err(BridgeError::SignatureMismatch {
                expected,
                recovered,
            });
        }
        Ok(signature.to_personal_hex())
    }

    /// Hex public key at the resolved path.
    pub async fn get_public_key(&mut self, target: &SignTarget) -> Result<String> {
        let path = self.resolve_path(target).await?;
        Ok(hex::encode(self.material_at(&path).await?.public_key))
    }
}

fn address_for_index(base: &PublicKeyMaterial, index: u64) -> Result<String> {
    let child = u32::try_from(index)
        .ok()
        .filter(|i| *i <= MAX_CHILD_INDEX)
        .ok_or_else(|| BridgeError::InvalidPath(format!("child index {index} out of range")))?;
    Ok(base.derive_child(child)?.address)
}

/// `0x`-prefixed hex is decoded; anything else is signed as its UTF-8 bytes.
fn message_bytes(message: &str) -> Vec<u8> {
    match message.strip_prefix("0x") {
        Some(body) => hex::decode(body).unwrap_or_else(|_| message.as_bytes().to_vec()),
        None => message.as_bytes().to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::eth::{INS_GET_ADDRESS, INS_SIGN_TRANSACTION};
    use crate::emulator::Emulator;
    use std::sync::Arc;

    fn bridge(emulator: &Emulator) -> EvmBridge {
        EvmBridge::new(Backend::direct(Arc::new(emulator.clone())))
    }

    fn path(s: &str) -> DerivationPath {
        s.parse().unwrap()
    }

    #[derive(Default)]
    struct FakeTx {
        chain_id: u64,
        to: Option<String>,
        payload: Vec<u8>,
        v: u64,
        r: [u8; 32],
        s: [u8; 32],
    }

    impl EvmTransaction for FakeTx {
        fn chain_id(&self) -> u64 {
            self.chain_id
        }

        fn to(&self) -> Option<String> {
            self.to.clone()
        }

        fn set_signature(&mut self, v: u64, r: [u8; 32], s: [u8; 32]) {
            self.v = v;
            self.r = r;
            self.s = s;
        }

        fn serialize(&self) -> Vec<u8> {
            let mut out = self.payload.clone();
            out.extend_from_slice(&self.v.to_be_bytes());
            out
        }
    }

    #[tokio::test]
    async fn unlock_uses_cache_without_override() {
        let emulator = Emulator::ethereum();
        let mut evm = bridge(&emulator);
        assert!(!evm.is_unlocked());

        let first = evm.unlock(None).await.unwrap();
        assert!(evm.is_unlocked());
        let second = evm.unlock(None).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(emulator.count_ins(INS_GET_ADDRESS), 1);

        evm.unlock(Some(&path("44'/60'/0'/0/0"))).await.unwrap();
        assert_eq!(emulator.count_ins(INS_GET_ADDRESS), 2);
    }

    #[tokio::test]
    async fn changing_path_invalidates_cache() {
        let emulator = Emulator::ethereum();
        let mut evm = bridge(&emulator);
        evm.unlock(None).await.unwrap();

        evm.set_hd_path(default_hd_path());
        assert!(evm.is_unlocked());

        evm.set_hd_path(path("44'/60'/1'"));
        assert!(!evm.is_unlocked());
        evm.unlock(None).await.unwrap();
        assert_eq!(emulator.count_ins(INS_GET_ADDRESS), 2);
    }

    #[tokio::test]
    async fn legacy_pages_derive_locally() {
        let emulator = Emulator::ethereum();
        let mut evm = bridge(&emulator);

        let first = evm.get_first_page().await.unwrap();
        let indices: Vec<u64> = first.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
        assert_eq!(first[3].hd_path.to_string(), "44'/60'/0'/3");

        let next = evm.get_next_page().await.unwrap();
        assert_eq!(next.first().unwrap().index, 5);
        assert_eq!(next.last().unwrap().index, 9);

        let back = evm.get_previous_page().await.unwrap();
        assert_eq!(back, first);
        evm.get_previous_page().await.unwrap();
        assert_eq!(evm.page(), 1);

        assert_eq!(emulator.count_ins(INS_GET_ADDRESS), 1);
    }

    #[tokio::test]
    async fn legacy_addresses_match_device_derivation() {
        let emulator = Emulator::ethereum();
        let mut evm = bridge(&emulator);
        let page = evm.get_first_page().await.unwrap();

        for record in &page[..2] {
            let on_device = evm.unlock(Some(&record.hd_path)).await.unwrap();
            assert_eq!(on_device, record.address);
        }
    }

    #[tokio::test]
    async fn fixed_account_page_uses_account_slot() {
        let emulator = Emulator::ethereum();
        let mut evm = bridge(&emulator);
        evm.set_hd_path(ledger_live_hd_path());

        let page = evm.get_first_page().await.unwrap();
        assert_eq!(page[0].address, "0x9858EfFD232B4033E47d90003D41EC34EcaEda94");
        assert_eq!(page[2].hd_path.to_string(), "44'/60'/2'/0/0");
    }

    #[tokio::test]
    async fn signs_by_address_with_placeholder_fields() {
        let emulator = Emulator::ethereum();
        let mut evm = bridge(&emulator);
        let page = evm.get_first_page().await.unwrap();

        let mut tx = FakeTx {
            chain_id: 56,
            to: Some("0xABCDEF0000000000000000000000000000000001".into()),
            payload: vec![0xc0; 10],
            ..FakeTx::default()
        };
        let target = SignTarget::Address {
            address: page[2].address.to_lowercase(),
            account_index: 0,
        };
        evm.sign_transaction(&mut tx, &target).await.unwrap();

        assert!(tx.v == 27 || tx.v == 28);
        assert_ne!(tx.r, [0; 32]);
        let signed = emulator
            .commands()
            .into_iter()
            .find(|c| c.ins == INS_SIGN_TRANSACTION)
            .unwrap();
        // count byte + 4 components, then the payload serialized with v = chain id
        assert_eq!(&signed.data[17..27], &[0xc0; 10]);
        assert_eq!(&signed.data[27..], &56u64.to_be_bytes());
    }

    #[tokio::test]
    async fn reverse_lookup_scans_without_a_page() {
        let emulator = Emulator::ethereum();
        let mut evm = bridge(&emulator);
        let base = evm.material_at(&default_hd_path()).await.unwrap();
        let address = address_for_index(&base, 42).unwrap();

        let mut fresh = bridge(&emulator);
        let target = SignTarget::Address {
            address,
            account_index: 0,
        };
        assert_eq!(
            fresh.resolve_path(&target).await.unwrap().to_string(),
            "44'/60'/0'/42"
        );
    }

    #[tokio::test]
    async fn sign_message_checks_recovered_address() {
        let emulator = Emulator::ethereum();
        let mut evm = bridge(&emulator);
        let target = SignTarget::Path(path("44'/60'/0'/0/0"));
        let signature = evm.sign_message("0x68656c6c6f", &target).await.unwrap();
        assert_eq!(signature.len(), 2 + 130);
        assert!(signature.ends_with("00") || signature.ends_with("01"));
    }

    #[tokio::test]
    async fn get_public_key_by_path() {
        let emulator = Emulator::ethereum();
        let mut evm = bridge(&emulator);
        let key = evm
            .get_public_key(&SignTarget::Path(path("44'/60'/0'/0/0")))
            .await
            .unwrap();
        assert_eq!(key.len(), 130);
        assert!(key.starts_with("04"));
    }

    #[test]
    fn message_normalization() {
        assert_eq!(message_bytes("0x6869"), b"hi".to_vec());
        assert_eq!(message_bytes("hi"), b"hi".to_vec());
        assert_eq!(message_bytes("0xzz"), b"0xzz".to_vec());
    }
}
