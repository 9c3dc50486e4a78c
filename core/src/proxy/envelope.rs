/// Envelopes exchanged with the bridge frame, and the typed params/payloads
/// each action carries.
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::app::{CosmosSignature, EvmSignature};
use crate::error::{BridgeError, Result};
use crate::keys::PublicKeyMaterial;

const REPLY_SUFFIX: &str = "-reply";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Unlock,
    SignTransaction,
    SignPersonalMessage,
    GetPublicKey,
    CloseBridge,
}

impl Action {
    pub const ALL: [Action; 5] = [
        Action::Unlock,
        Action::SignTransaction,
        Action::SignPersonalMessage,
        Action::GetPublicKey,
        Action::CloseBridge,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unlock => "ledger-unlock",
            Self::SignTransaction => "ledger-sign-transaction",
            Self::SignPersonalMessage => "ledger-sign-personal-message",
            Self::GetPublicKey => "ledger-get-public-key",
            Self::CloseBridge => "ledger-close-bridge",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.as_str() == name)
    }
}

/// `${action}-reply`.
pub fn reply_action(action: &str) -> String {
    format!("{action}{REPLY_SUFFIX}")
}

// -- Envelopes --

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub target: String,
    pub action: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyEnvelope {
    pub action: String,
    pub success: bool,
    #[serde(default)]
    pub payload: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl ReplyEnvelope {
    pub fn ok(request_action: &str, id: Option<String>, payload: Value) -> Self {
        Self {
            action: reply_action(request_action),
            success: true,
            payload,
            id,
        }
    }

    /// Failure reply; the error travels as its code string in `payload.error`.
    pub fn err(request_action: &str, id: Option<String>, error: &BridgeError) -> Self {
        Self {
            action: reply_action(request_action),
            success: false,
            payload: serde_json::json!({ "error": error.to_string() }),
            id,
        }
    }

    /// Payload on success, otherwise the error rebuilt from its code.
    pub fn into_result(self) -> Result<Value> {
        if self.success {
            return Ok(self.payload);
        }
        let error = match self.payload.get("error") {
            Some(Value::String(code)) => BridgeError::from_code(code),
            Some(other) => BridgeError::Other(other.to_string()),
            None => BridgeError::Other(self.payload.to_string()),
        };
        Err(error)
    }
}

// -- Params and payloads --

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathParams {
    pub hd_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CosmosUnlockParams {
    pub hd_path: String,
    pub hrp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvmSignParams {
    pub hd_path: String,
    pub tx: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageParams {
    pub hd_path: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CosmosSignParams {
    pub hd_path: String,
    pub tx: String,
    pub hrp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPayload {
    pub public_key: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_code: Option<String>,
}

impl From<&PublicKeyMaterial> for KeyPayload {
    fn from(material: &PublicKeyMaterial) -> Self {
        Self {
            public_key: hex::encode(&material.public_key),
            address: material.address.clone(),
            chain_code: Some(hex::encode(&material.chain_code)),
        }
    }
}

impl TryFrom<KeyPayload> for PublicKeyMaterial {
    type Error = BridgeError;

    fn try_from(payload: KeyPayload) -> Result<Self> {
        Ok(Self {
            public_key: decode_hex("publicKey", &payload.public_key)?,
            chain_code: match payload.chain_code {
                Some(code) => decode_hex("chainCode", &code)?,
                None => Vec::new(),
            },
            address: payload.address,
        })
    }
}

/// Transaction signatures carry `v` as hex, personal-message signatures as a
/// number; both shapes are accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecoveryByte {
    Number(u8),
    Hex(String),
}

impl RecoveryByte {
    fn value(&self) -> Result<u8> {
        match self {
            Self::Number(v) => Ok(*v),
            Self::Hex(v) => {
                let bytes = decode_hex("v", v)?;
                match bytes.as_slice() {
                    [] => Ok(0),
                    // EIP-155 v values overflow a byte; the app keeps the low byte.
                    [.., last] => Ok(*last),
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignaturePayload {
    pub v: RecoveryByte,
    pub r: String,
    pub s: String,
}

impl SignaturePayload {
    pub fn transaction(signature: &EvmSignature) -> Self {
        Self {
            v: RecoveryByte::Hex(format!("{:02x}", signature.v)),
            r: hex::encode(signature.r),
            s: hex::encode(signature.s),
        }
    }

    pub fn personal(signature: &EvmSignature) -> Self {
        Self {
            v: RecoveryByte::Number(signature.v),
            r: hex::encode(signature.r),
            s: hex::encode(signature.s),
        }
    }
}

impl TryFrom<SignaturePayload> for EvmSignature {
    type Error = BridgeError;

    fn try_from(payload: SignaturePayload) -> Result<Self> {
        Ok(Self {
            v: payload.v.value()?,
            r: decode_word("r", &payload.r)?,
            s: decode_word("s", &payload.s)?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CosmosSignaturePayload {
    pub signature: String,
    pub pubkey: String,
}

impl From<&CosmosSignature> for CosmosSignaturePayload {
    fn from(signature: &CosmosSignature) -> Self {
        Self {
            signature: hex::encode(&signature.signature),
            pubkey: hex::encode(&signature.public_key),
        }
    }
}

impl TryFrom<CosmosSignaturePayload> for CosmosSignature {
    type Error = BridgeError;

    fn try_from(payload: CosmosSignaturePayload) -> Result<Self> {
        Ok(Self {
            signature: decode_hex("signature", &payload.signature)?,
            public_key: decode_hex("pubkey", &payload.pubkey)?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicKeyPayload {
    pub public_key: String,
}

/// Deserialize a params or payload value, mapping failures to `ProtocolError`.
pub fn decode<T: serde::de::DeserializeOwned>(what: &str, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| BridgeError::Protocol(format!("{what}: {e}")))
}

pub fn encode<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| BridgeError::Protocol(e.to_string()))
}

pub fn decode_hex(field: &str, value: &str) -> Result<Vec<u8>> {
    let body = value.strip_prefix("0x").unwrap_or(value);
    hex::decode(body).map_err(|e| BridgeError::Protocol(format!("{field} is not hex: {e}")))
}

fn decode_word(field: &str, value: &str) -> Result<[u8; 32]> {
    let bytes = decode_hex(field, value)?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| BridgeError::Protocol(format!("{field} must be 32 bytes, got {}", b.len())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn action_names() {
        assert_eq!(Action::Unlock.as_str(), "ledger-unlock");
        assert_eq!(reply_action(Action::CloseBridge.as_str()), "ledger-close-bridge-reply");
        for action in Action::ALL {
            assert_eq!(Action::parse(action.as_str()), Some(action));
        }
        assert_eq!(Action::parse("ledger-format-disk"), None);
    }

    #[test]
    fn request_shape() {
        let envelope = RequestEnvelope {
            target: "LEDGER-IFRAME".into(),
            action: "ledger-unlock".into(),
            params: json!({ "hdPath": "44'/60'/0'" }),
            id: None,
        };
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(
            value,
            json!({
                "target": "LEDGER-IFRAME",
                "action": "ledger-unlock",
                "params": { "hdPath": "44'/60'/0'" }
            })
        );
    }

    #[test]
    fn failed_reply_rebuilds_error() {
        let reply = ReplyEnvelope::err("ledger-unlock", None, &BridgeError::Locked);
        assert_eq!(reply.action, "ledger-unlock-reply");
        assert_eq!(reply.payload, json!({ "error": "LEDGER_LOCKED" }));
        assert_eq!(reply.into_result().unwrap_err(), BridgeError::Locked);

        let raw: ReplyEnvelope = serde_json::from_value(json!({
            "action": "ledger-unlock-reply",
            "success": false,
            "payload": { "error": "TransportError: busy" }
        }))
        .unwrap();
        assert_eq!(
            raw.into_result().unwrap_err(),
            BridgeError::Other("TransportError: busy".into())
        );
    }

    #[test]
    fn signature_payload_accepts_both_v_shapes() {
        let sig = EvmSignature {
            v: 0x25,
            r: [1; 32],
            s: [2; 32],
        };
        let tx: SignaturePayload =
            serde_json::from_value(serde_json::to_value(SignaturePayload::transaction(&sig)).unwrap())
                .unwrap();
        assert_eq!(EvmSignature::try_from(tx).unwrap(), sig);

        let personal: SignaturePayload = serde_json::from_value(json!({
            "v": 28,
            "r": hex::encode([1u8; 32]),
            "s": hex::encode([2u8; 32]),
        }))
        .unwrap();
        assert_eq!(EvmSignature::try_from(personal).unwrap().v, 28);

        let eip155: SignaturePayload = serde_json::from_value(json!({
            "v": "0194",
            "r": hex::encode([1u8; 32]),
            "s": hex::encode([2u8; 32]),
        }))
        .unwrap();
        assert_eq!(EvmSignature::try_from(eip155).unwrap().v, 0x94);
    }

    #[test]
    fn short_words_are_protocol_errors() {
        let payload = SignaturePayload {
            v: RecoveryByte::Number(27),
            r: "abcd".into(),
            s: hex::encode([0u8; 32]),
        };
        assert!(matches!(
            EvmSignature::try_from(payload),
            Err(BridgeError::Protocol(_))
        ));
    }
}
