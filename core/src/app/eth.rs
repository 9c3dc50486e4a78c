/// Ethereum Ledger application (CLA `0xE0`).
use crate::apdu::ApduCommand;
use crate::error::{BridgeError, Result};
use crate::keys::{to_checksum_address, PublicKeyMaterial};
use crate::path::DerivationPath;
use crate::transport::{call, Transport};

pub const CLA: u8 = 0xe0;
pub const INS_GET_ADDRESS: u8 = 0x02;
pub const INS_SIGN_TRANSACTION: u8 = 0x04;
pub const INS_SIGN_PERSONAL_MESSAGE: u8 = 0x08;

/// Largest data field the app accepts per APDU.
pub const CHUNK_SIZE: usize = 150;

pub const P1_FIRST_CHUNK: u8 = 0x00;
pub const P1_MORE_CHUNKS: u8 = 0x80;

/// `(v, r, s)` as the device returns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvmSignature {
    pub v: u8,
    pub r: [u8; 32],
    pub s: [u8; 32],
}

impl EvmSignature {
    /// Parse the 65-byte `v || r || s` answer.
    pub fn from_device(data: &[u8]) -> Result<Self> {
        if data.len() < 65 {
            return Err(BridgeError::Protocol(format!(
                "signature answer too short: {} bytes",
                data.len()
            )));
        }
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&data[1..33]);
        s.copy_from_slice(&data[33..65]);
        Ok(Self { v: data[0], r, s })
    }

    pub fn to_device_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(65);
        out.push(self.v);
        out.extend_from_slice(&self.r);
        out.extend_from_slice(&self.s);
        out
    }

    /// `0x` ‖ r ‖ s ‖ (v − 27), the recoverable personal-sign encoding.
    pub fn to_personal_hex(&self) -> String {
        let v = self.v.checked_sub(27).unwrap_or(self.v);
        format!("0x{}{}{v:02x}", hex::encode(self.r), hex::encode(self.s))
    }
}

/// Split `payload` behind `header` into app-sized chunks. The first chunk
/// always carries the header, even for an empty payload.
pub fn chunk_payload(header: &[u8], payload: &[u8]) -> Vec<Vec<u8>> {
    let first_len = CHUNK_SIZE.saturating_sub(header.len()).min(payload.len());
    let mut first = header.to_vec();
    first.extend_from_slice(&payload[..first_len]);

    let mut chunks = vec![first];
    chunks.extend(payload[first_len..].chunks(CHUNK_SIZE).map(<[u8]>::to_vec));
    chunks
}

async fn send_chunks(transport: &mut dyn Transport, ins: u8, chunks: Vec<Vec<u8>>) -> Result<Vec<u8>> {
    let mut answer = Vec::new();
    for (i, chunk) in chunks.into_iter().enumerate() {
        let p1 = if i == 0 { P1_FIRST_CHUNK } else { P1_MORE_CHUNKS };
        answer = call(transport, ApduCommand::new(CLA, ins, p1, 0x00, chunk)).await?;
    }
    Ok(answer)
}

/// Public key, address and (optionally) chain code at `path`.
pub async fn get_address(
    transport: &mut dyn Transport,
    path: &DerivationPath,
    display: bool,
    chain_code: bool,
) -> Result<PublicKeyMaterial> {
    let command = ApduCommand::new(
        CLA,
        INS_GET_ADDRESS,
        u8::from(display),
        u8::from(chain_code),
        path.to_bytes_be()?,
    );
    let data = call(transport, command).await?;
    parse_address_answer(&data, chain_code)
}

fn parse_address_answer(data: &[u8], chain_code: bool) -> Result<PublicKeyMaterial> {
    let truncated = || BridgeError::Protocol("get address answer truncated".into());

    let pk_len = usize::from(*data.first().ok_or_else(truncated)?);
    let public_key = data.get(1..1 + pk_len).ok_or_else(truncated)?.to_vec();
    let mut offset = 1 + pk_len;

    let addr_len = usize::from(*data.get(offset).ok_or_else(truncated)?);
    offset += 1;
    let ascii = data.get(offset..offset + addr_len).ok_or_else(truncated)?;
    offset += addr_len;
    let ascii = std::str::from_utf8(ascii)
        .map_err(|_| BridgeError::Protocol("address is not ascii".into()))?;
    let address = to_checksum_address(&format!("0x{ascii}"))?;

    let chain_code = if chain_code {
        data.get(offset..offset + 32).ok_or_else(truncated)?.to_vec()
    } else {
        Vec::new()
    };

    Ok(PublicKeyMaterial {
        public_key,
        chain_code,
        address,
    })
}

/// Sign a serialized (RLP) transaction.
pub async fn sign_transaction(
    transport: &mut dyn Transport,
    path: &DerivationPath,
    tx: &[u8],
) -> Result<EvmSignature> {
    let chunks = chunk_payload(&path.to_bytes_be()?, tx);
    let answer = send_chunks(transport, INS_SIGN_TRANSACTION, chunks).await?;
    EvmSignature::from_device(&answer)
}

/// Sign an EIP-191 personal message. The first chunk carries the
/// big-endian message length after the path.
pub async fn sign_personal_message(
    transport: &mut dyn Transport,
    path: &DerivationPath,
    message: &[u8],
) -> Result<EvmSignature> {
    let len = u32::try_from(message.len())
        .map_err(|_| BridgeError::Protocol("message too long".into()))?;
    let mut header = path.to_bytes_be()?;
    header.extend_from_slice(&len.to_be_bytes());
    let chunks = chunk_payload(&header, message);
    let answer = send_chunks(transport, INS_SIGN_PERSONAL_MESSAGE, chunks).await?;
    EvmSignature::from_device(&answer)
}
