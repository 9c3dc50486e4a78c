//! Public-key material, local BIP-32 public derivation and address helpers.

use coins_bip32::primitives::{ChainCode, Hint, KeyFingerprint, XKeyInfo};
use coins_bip32::xkeys::{Parent, XPub};
use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::PublicKey;
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};
use sha3::Keccak256;

use crate::error::{BridgeError, Result};
use crate::path::HARDENED;

/// What an unlock returns: the key at a path, its chain code, and the
/// address the device rendered for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyMaterial {
    pub public_key: Vec<u8>,
    pub chain_code: Vec<u8>,
    pub address: String,
}

impl PublicKeyMaterial {
    /// Non-hardened BIP-32 child (CKDpub). The child address is computed
    /// locally, so no device round-trip is needed.
    pub fn derive_child(&self, index: u32) -> Result<Self> {
        if index & HARDENED != 0 {
            return Err(BridgeError::InvalidPath(format!(
                "hardened child {} cannot be derived from a public key",
                index & !HARDENED
            )));
        }
        let key = VerifyingKey::from(parse_public_key(&self.public_key)?);
        let chain_code: [u8; 32] = self.chain_code.as_slice().try_into().map_err(|_| {
            BridgeError::Protocol(format!(
                "chain code must be 32 bytes, got {}",
                self.chain_code.len()
            ))
        })?;
        let parent = XPub::new(
            key,
            XKeyInfo {
                depth: 0,
                parent: KeyFingerprint([0; 4]),
                index: 0,
                chain_code: ChainCode(chain_code),
                hint: Hint::Legacy,
            },
        );
        let child = parent
            .derive_child(index)
            .map_err(|e| BridgeError::Protocol(format!("child {index} is not derivable: {e}")))?;
        let child_key: &VerifyingKey = child.as_ref();

        let public_key = child_key.to_encoded_point(false).as_bytes().to_vec();
        let address = eth_address(&public_key)?;
        Ok(Self {
            public_key,
            chain_code: AsRef::<XKeyInfo>::as_ref(&child).chain_code.0.to_vec(),
            address,
        })
    }
}

fn parse_public_key(bytes: &[u8]) -> Result<PublicKey> {
    PublicKey::from_sec1_bytes(bytes)
        .map_err(|_| BridgeError::Protocol(format!("invalid secp256k1 key: {}", hex::encode(bytes))))
}

/// 33-byte SEC1 compressed form of any SEC1 encoded key.
pub fn compress_public_key(bytes: &[u8]) -> Result<Vec<u8>> {
    Ok(parse_public_key(bytes)?
        .to_encoded_point(true)
        .as_bytes()
        .to_vec())
}

fn address_from_uncompressed(point: &[u8]) -> String {
    let hash = Keccak256::digest(&point[1..]);
    checksum_hex(&hex::encode(&hash[12..]))
}

/// EIP-55 address of a secp256k1 public key (compressed or not).
pub fn eth_address(public_key: &[u8]) -> Result<String> {
    let key = parse_public_key(public_key)?;
    Ok(address_from_uncompressed(key.to_encoded_point(false).as_bytes()))
}

fn checksum_hex(lower: &str) -> String {
    let hash = Keccak256::digest(lower.as_bytes());
    let mut out = String::with_capacity(42);
    out.push_str("0x");
    for (i, c) in lower.chars().enumerate() {
        let nibble = (hash[i / 2] >> (if i % 2 == 0 { 4 } else { 0 })) & 0x0f;
        if c.is_ascii_alphabetic() && nibble >= 8 {
            out.push(c.to_ascii_uppercase());
        } else {
            out.push(c);
        }
    }
    out
}

/// EIP-55 checksum form of a hex address, with or without `0x`.
pub fn to_checksum_address(address: &str) -> Result<String> {
    let body = address
        .strip_prefix("0x")
        .or_else(|| address.strip_prefix("0X"))
        .unwrap_or(address);
    if body.len() != 40 || !body.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(BridgeError::UnknownAddress(address.to_string()));
    }
    Ok(checksum_hex(&body.to_ascii_lowercase()))
}

/// Bech32 account address: `hrp` + ripemd160(sha256(compressed key)).
pub fn cosmos_address(hrp: &str, public_key: &[u8]) -> Result<String> {
    let compressed = compress_public_key(public_key)?;
    let hash = Ripemd160::digest(Sha256::digest(&compressed));
    let hrp = bech32::Hrp::parse(hrp)
        .map_err(|e| BridgeError::Protocol(format!("invalid hrp {hrp:?}: {e}")))?;
    bech32::encode::<bech32::Bech32>(hrp, &hash)
        .map_err(|e| BridgeError::Protocol(format!("bech32 encoding failed: {e}")))
}

/// EIP-191 personal-message digest.
pub fn personal_message_hash(message: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(format!("\x19Ethereum Signed Message:\n{}", message.len()).as_bytes());
    hasher.update(message);
    hasher.finalize().into()
}

/// Recover the checksum address that produced `(r, s, v)` over a personal
/// message. `v` may be 27/28 or a bare recovery id.
pub fn recover_personal_signer(message: &[u8], r: &[u8; 32], s: &[u8; 32], v: u8) -> Result<String> {
    let recovery = match v {
        27 | 28 => v - 27,
        0 | 1 => v,
        other => {
            return Err(BridgeError::Protocol(format!("unexpected recovery byte {other}")));
        }
    };
    let mut compact = [0u8; 64];
    compact[..32].copy_from_slice(r);
    compact[32..].copy_from_slice(s);
    let signature = Signature::from_slice(&compact)
        .map_err(|e| BridgeError::Protocol(format!("invalid signature: {e}")))?;
    let recovery_id = RecoveryId::from_byte(recovery)
        .ok_or_else(|| BridgeError::Protocol(format!("invalid recovery id {recovery}")))?;
    let key = VerifyingKey::recover_from_prehash(
        &personal_message_hash(message),
        &signature,
        recovery_id,
    )
    .map_err(|e| BridgeError::Protocol(format!("signature recovery failed: {e}")))?;
    Ok(address_from_uncompressed(key.to_encoded_point(false).as_bytes()))
}

/// 64-byte `r || s` from either a compact or a DER encoded signature.
pub fn compact_signature(raw: &[u8]) -> Result<Vec<u8>> {
    if raw.len() == 64 {
        return Ok(raw.to_vec());
    }
    let signature = Signature::from_der(raw)
        .map_err(|e| BridgeError::Protocol(format!("invalid DER signature: {e}")))?;
    Ok(signature.to_bytes().to_vec())
}
