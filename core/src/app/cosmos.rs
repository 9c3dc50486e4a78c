/// Binance-Chain Ledger application (CLA `0xBC`), the Cosmos-style family.
use crate::apdu::ApduCommand;
use crate::error::{BridgeError, Result};
use crate::keys::{compact_signature, compress_public_key, cosmos_address};
use crate::path::{DerivationPath, MIN_ENUMERATION_DEPTH};
use crate::transport::{call, Transport};

pub const CLA: u8 = 0xbc;
pub const INS_PUBLIC_KEY: u8 = 0x01;
pub const INS_SIGN: u8 = 0x02;
pub const INS_SHOW_ADDRESS: u8 = 0x03;

pub const CHUNK_SIZE: usize = 250;

/// Default number of addresses fetched per unlock.
pub const DEFAULT_ADDRESS_LIMIT: u32 = 5;

/// Signature plus the compressed key that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CosmosSignature {
    pub signature: Vec<u8>,
    pub public_key: Vec<u8>,
}

/// 65-byte uncompressed secp256k1 key at `path`.
pub async fn public_key(transport: &mut dyn Transport, path: &DerivationPath) -> Result<Vec<u8>> {
    let data = call(
        transport,
        ApduCommand::new(CLA, INS_PUBLIC_KEY, 0, 0, path.to_bytes_le()?),
    )
    .await?;
    match data.get(..65) {
        Some(pk) => Ok(pk.to_vec()),
        None => Err(BridgeError::Protocol(format!(
            "public key answer too short: {} bytes",
            data.len()
        ))),
    }
}

/// Ask the device to display the address at `path` for confirmation.
pub async fn show_address(transport: &mut dyn Transport, hrp: &str, path: &DerivationPath) -> Result<()> {
    let hrp_len = u8::try_from(hrp.len())
        .map_err(|_| BridgeError::Protocol(format!("hrp too long: {hrp}")))?;
    let mut data = vec![hrp_len];
    data.extend_from_slice(hrp.as_bytes());
    data.extend_from_slice(&path.to_bytes_le()?);
    call(transport, ApduCommand::new(CLA, INS_SHOW_ADDRESS, 0, 0, data)).await?;
    Ok(())
}

/// Sign `message`. The path travels alone in chunk 1; P1 is the 1-based
/// chunk index and P2 the chunk count.
pub async fn sign(transport: &mut dyn Transport, path: &DerivationPath, message: &[u8]) -> Result<Vec<u8>> {
    let mut chunks = vec![path.to_bytes_le()?];
    chunks.extend(message.chunks(CHUNK_SIZE).map(<[u8]>::to_vec));
    let total = u8::try_from(chunks.len())
        .map_err(|_| BridgeError::Protocol("message too long to sign".into()))?;

    let mut answer = Vec::new();
    for (i, chunk) in chunks.into_iter().enumerate() {
        // i < total <= 255
        let index = (i + 1) as u8;
        answer = call(transport, ApduCommand::new(CLA, INS_SIGN, index, total, chunk)).await?;
    }
    compact_signature(&answer)
}

/// Up to `limit` consecutive addresses starting at `start`, stopping before
/// the last component would overflow.
pub async fn get_addresses(
    transport: &mut dyn Transport,
    start: &DerivationPath,
    hrp: &str,
    limit: u32,
) -> Result<Vec<String>> {
    start.require_depth(MIN_ENUMERATION_DEPTH)?;
    let first = u64::from(start.last_index().unwrap_or(0));

    let mut addresses = Vec::new();
    for i in 0..u64::from(limit) {
        let Some(path) = start.with_last_index(first + i) else {
            break;
        };
        let pk = public_key(transport, &path).await?;
        addresses.push(cosmos_address(hrp, &pk)?);
    }
    Ok(addresses)
}

/// Show, fetch key, sign: the full confirmation flow for a transaction.
pub async fn sign_transaction(
    transport: &mut dyn Transport,
    path: &DerivationPath,
    sign_bytes: &[u8],
    hrp: &str,
) -> Result<CosmosSignature> {
    show_address(transport, hrp, path).await?;
    let pk = public_key(transport, path).await?;
    let signature = sign(transport, path, sign_bytes).await?;
    Ok(CosmosSignature {
        signature,
        public_key: compress_public_key(&pk)?,
    })
}
