/// Frame side of the proxy protocol: receives tagged envelopes, runs them
/// against a direct device session and posts `${action}-reply` back.
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::envelope::{
    decode, decode_hex, encode, Action, CosmosSignParams, CosmosSignaturePayload,
    CosmosUnlockParams, EvmSignParams, KeyPayload, MessageParams, PathParams, PublicKeyPayload,
    ReplyEnvelope, RequestEnvelope, SignaturePayload,
};
use super::framing::{Frame, MessageSink};
use crate::app::cosmos::DEFAULT_ADDRESS_LIMIT;
use crate::config::ChainFamily;
use crate::error::{BridgeError, Result};
use crate::path::DerivationPath;
use crate::session::{CosmosSession, DirectTransport, EvmSession};

pub struct Responder {
    family: ChainFamily,
    device: DirectTransport,
    sink: Arc<dyn MessageSink>,
}

impl Responder {
    pub fn new(family: ChainFamily, device: DirectTransport, sink: Arc<dyn MessageSink>) -> Self {
        Self {
            family,
            device,
            sink,
        }
    }

    pub fn target_tag(&self) -> &'static str {
        self.family.target_tag()
    }

    /// Serve until the inbound channel closes.
    pub async fn run(mut self, mut inbound: mpsc::Receiver<Frame>) -> Result<()> {
        info!(family = %self.family, tag = self.target_tag(), "responder listening");
        while let Some(frame) = inbound.recv().await {
            let envelope: RequestEnvelope = match serde_json::from_value(frame.data) {
                Ok(envelope) => envelope,
                Err(e) => {
                    debug!(origin = %frame.origin, error = %e, "ignoring non-request message");
                    continue;
                }
            };
            if let Some(reply) = self.handle(envelope).await {
                self.sink.post(encode(&reply)?).await?;
            }
        }
        info!("responder channel closed");
        Ok(())
    }

    /// Reply to one envelope, or `None` if it is tagged for another frame.
    pub async fn handle(&mut self, envelope: RequestEnvelope) -> Option<ReplyEnvelope> {
        if envelope.target != self.target_tag() {
            debug!(tag = %envelope.target, "envelope for another frame");
            return None;
        }
        let RequestEnvelope {
            action, params, id, ..
        } = envelope;
        debug!(action = %action, id = ?id, "handling request");

        let result = match Action::parse(&action) {
            Some(known) => self.dispatch(known, params).await,
            None => Err(BridgeError::Protocol(format!("unknown action {action}"))),
        };
        Some(match result {
            Ok(payload) => ReplyEnvelope::ok(&action, id, payload),
            Err(e) => {
                warn!(action = %action, error = %e, "request failed");
                ReplyEnvelope::err(&action, id, &e)
            }
        })
    }

    async fn dispatch(&mut self, action: Action, params: Value) -> Result<Value> {
        if action == Action::CloseBridge {
            // Direct sessions close after every call; nothing is held open.
            return Ok(json!({}));
        }
        match self.family {
            ChainFamily::Evm => self.dispatch_evm(action, params).await,
            ChainFamily::Cosmos => self.dispatch_cosmos(action, params).await,
        }
    }

    async fn dispatch_evm(&mut self, action: Action, params: Value) -> Result<Value> {
        match action {
            Action::Unlock => {
                let params: PathParams = decode("unlock params", params)?;
                let path: DerivationPath = params.hd_path.parse()?;
                let material = EvmSession::unlock(&mut self.device, &path).await?;
                encode(&KeyPayload::from(&material))
            }
            Action::GetPublicKey => {
                let params: PathParams = decode("public key params", params)?;
                let path: DerivationPath = params.hd_path.parse()?;
                let material = EvmSession::unlock(&mut self.device, &path).await?;
                encode(&PublicKeyPayload {
                    public_key: hex::encode(&material.public_key),
                })
            }
            Action::SignTransaction => {
                let params: EvmSignParams = decode("sign params", params)?;
                let path: DerivationPath = params.hd_path.parse()?;
                let tx = decode_hex("tx", &params.tx)?;
                let signature = EvmSession::sign_transaction(
                    &mut self.device,
                    &path,
                    &tx,
                    params.to.as_deref(),
                )
                .await?;
                encode(&SignaturePayload::transaction(&signature))
            }
            Action::SignPersonalMessage => {
                let params: MessageParams = decode("message params", params)?;
                let path: DerivationPath = params.hd_path.parse()?;
                let message = decode_hex("message", &params.message)?;
                let signature = self.device.sign_personal_message(&path, &message).await?;
                encode(&SignaturePayload::personal(&signature))
            }
            Action::CloseBridge => Ok(json!({})),
        }
    }

    async fn dispatch_cosmos(&mut self, action: Action, params: Value) -> Result<Value> {
        match action {
            Action::Unlock => {
                let params: CosmosUnlockParams = decode("unlock params", params)?;
                let start = parse_cosmos_path(&params.hd_path)?;
                let limit = params.limit.unwrap_or(DEFAULT_ADDRESS_LIMIT);
                let addresses =
                    CosmosSession::unlock(&mut self.device, &start, &params.hrp, limit).await?;
                encode(&addresses)
            }
            Action::GetPublicKey => {
                let params: PathParams = decode("public key params", params)?;
                let path = parse_cosmos_path(&params.hd_path)?;
                let public_key = self.device.public_key(&path).await?;
                encode(&PublicKeyPayload {
                    public_key: hex::encode(public_key),
                })
            }
            Action::SignTransaction => {
                let params: CosmosSignParams = decode("sign params", params)?;
                let path = parse_cosmos_path(&params.hd_path)?;
                let sign_bytes = decode_hex("tx", &params.tx)?;
                let signature =
                    CosmosSession::sign_transaction(&mut self.device, &path, &sign_bytes, &params.hrp)
                        .await?;
                encode(&CosmosSignaturePayload::from(&signature))
            }
            Action::SignPersonalMessage => Err(BridgeError::Unsupported("signMessage".into())),
            Action::CloseBridge => Ok(json!({})),
        }
    }
}

/// Cosmos frames send plain comma-separated indices; a slash path is accepted too.
fn parse_cosmos_path(raw: &str) -> Result<DerivationPath> {
    if raw.contains(',') {
        DerivationPath::parse_plain_list(raw)
    } else {
        raw.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::DeviceError;
    use crate::emulator::Emulator;
    use crate::proxy::envelope::reply_action;

    fn request(target: &str, action: &str, params: Value) -> RequestEnvelope {
        RequestEnvelope {
            target: target.into(),
            action: action.into(),
            params,
            id: Some("abc".into()),
        }
    }

    struct NullSink;

    #[async_trait::async_trait]
    impl MessageSink for NullSink {
        async fn post(&self, _data: Value) -> Result<()> {
            Ok(())
        }
    }

    fn responder(family: ChainFamily, emulator: &Emulator) -> Responder {
        Responder::new(
            family,
            DirectTransport::new(Arc::new(emulator.clone())),
            Arc::new(NullSink),
        )
    }

    #[tokio::test]
    async fn ignores_other_targets() {
        let mut r = responder(ChainFamily::Evm, &Emulator::ethereum());
        let reply = r
            .handle(request("BC-LEDGER-IFRAME", "ledger-unlock", json!({})))
            .await;
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn evm_unlock_reply() {
        let mut r = responder(ChainFamily::Evm, &Emulator::ethereum());
        let reply = r
            .handle(request(
                "LEDGER-IFRAME",
                "ledger-unlock",
                json!({ "hdPath": "44'/60'/0'/0/0" }),
            ))
            .await
            .unwrap();
        assert_eq!(reply.action, reply_action("ledger-unlock"));
        assert_eq!(reply.id.as_deref(), Some("abc"));
        assert!(reply.success);
        assert_eq!(
            reply.payload["address"],
            "0x9858EfFD232B4033E47d90003D41EC34EcaEda94"
        );
        assert_eq!(reply.payload["chainCode"].as_str().unwrap().len(), 64);
    }

    #[tokio::test]
    async fn device_failure_becomes_error_code() {
        let emulator = Emulator::ethereum();
        emulator.fail_next_exchange(DeviceError::U2f {
            code: 5,
            kind: "TIMEOUT".into(),
        });
        let mut r = responder(ChainFamily::Evm, &emulator);
        let reply = r
            .handle(request(
                "LEDGER-IFRAME",
                "ledger-unlock",
                json!({ "hdPath": "44'/60'/0'" }),
            ))
            .await
            .unwrap();
        assert!(!reply.success);
        assert_eq!(reply.payload["error"], "LEDGER_TIMEOUT");
    }

    #[tokio::test]
    async fn unknown_action_is_protocol_error() {
        let mut r = responder(ChainFamily::Evm, &Emulator::ethereum());
        let reply = r
            .handle(request("LEDGER-IFRAME", "ledger-wipe", json!({})))
            .await
            .unwrap();
        assert!(!reply.success);
        assert_eq!(reply.action, "ledger-wipe-reply");
        assert!(reply.payload["error"]
            .as_str()
            .unwrap()
            .starts_with("ProtocolError"));
    }

    #[tokio::test]
    async fn cosmos_unlock_and_close() {
        let mut r = responder(ChainFamily::Cosmos, &Emulator::binance());
        let reply = r
            .handle(request(
                "BC-LEDGER-IFRAME",
                "ledger-unlock",
                json!({ "hdPath": "44,714,0,0,0", "hrp": "tbnb" }),
            ))
            .await
            .unwrap();
        let addresses = reply.payload.as_array().unwrap();
        assert_eq!(addresses.len(), 5);
        assert!(addresses[0].as_str().unwrap().starts_with("tbnb1"));

        let close = r
            .handle(request("BC-LEDGER-IFRAME", "ledger-close-bridge", json!({})))
            .await
            .unwrap();
        assert!(close.success);
    }

    #[tokio::test]
    async fn cosmos_rejects_personal_messages() {
        let mut r = responder(ChainFamily::Cosmos, &Emulator::binance());
        let reply = r
            .handle(request(
                "BC-LEDGER-IFRAME",
                "ledger-sign-personal-message",
                json!({ "hdPath": "44,714,0,0,0", "message": "00" }),
            ))
            .await
            .unwrap();
        assert_eq!(reply.payload["error"], "UnsupportedError: signMessage");
    }
}
