/// Proxy adapter: device calls relayed to a bridge frame over a message channel.
///
/// Outstanding requests live in a pending table keyed by a UUID correlation
/// id. A single listener task, spawned with the adapter and aborted when it is
/// dropped, resolves entries from inbound replies. Replies are accepted only
/// from the configured bridge origin.
pub mod envelope;
pub mod framing;
pub mod responder;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app::{CosmosSignature, EvmSignature};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::keys::PublicKeyMaterial;
use crate::path::DerivationPath;
use crate::session::{CosmosSession, EvmSession};

use envelope::{
    decode, decode_hex, encode, reply_action, Action, CosmosSignParams, CosmosSignaturePayload,
    CosmosUnlockParams, EvmSignParams, KeyPayload, MessageParams, PathParams, PublicKeyPayload,
    ReplyEnvelope, RequestEnvelope, SignaturePayload,
};
use framing::{Frame, MessageSink};

pub use responder::Responder;

struct PendingEntry {
    reply_action: String,
    tx: oneshot::Sender<Result<Value>>,
}

type PendingTable = Arc<Mutex<HashMap<Uuid, PendingEntry>>>;

fn lock(table: &PendingTable) -> MutexGuard<'_, HashMap<Uuid, PendingEntry>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Both halves of the cross-context channel.
pub struct ProxyChannel {
    pub sink: Arc<dyn MessageSink>,
    pub inbound: mpsc::Receiver<Frame>,
}

impl ProxyChannel {
    pub fn new(sink: Arc<dyn MessageSink>, inbound: mpsc::Receiver<Frame>) -> Self {
        Self { sink, inbound }
    }
}

pub struct ProxyTransport {
    config: BridgeConfig,
    sink: Arc<dyn MessageSink>,
    pending: PendingTable,
    rejected: Arc<AtomicU64>,
    stale_closes: Arc<AtomicU64>,
    listener: JoinHandle<()>,
}

/// Fails the outstanding request from outside the awaiting task.
#[derive(Clone)]
pub struct ProxyCanceller {
    pending: PendingTable,
}

impl ProxyCanceller {
    /// Returns whether a request was pending.
    pub fn cancel(&self) -> bool {
        let drained: Vec<_> = lock(&self.pending).drain().collect();
        let cancelled = !drained.is_empty();
        for (id, entry) in drained {
            debug!(%id, action = %entry.reply_action, "request cancelled");
            let _ = entry.tx.send(Err(BridgeError::Cancelled));
        }
        cancelled
    }
}

/// Removes the pending entry when the awaiting future goes away, whatever
/// the exit path.
struct PendingGuard<'a> {
    table: &'a PendingTable,
    id: Uuid,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.table).remove(&self.id);
    }
}

impl ProxyTransport {
    /// Start the listener. Must be called inside a tokio runtime.
    pub fn spawn(config: BridgeConfig, channel: ProxyChannel) -> Self {
        let pending = PendingTable::default();
        let rejected = Arc::new(AtomicU64::new(0));
        let stale_closes = Arc::new(AtomicU64::new(0));
        let listener = tokio::spawn(listen(
            config.origin(),
            channel.inbound,
            pending.clone(),
            rejected.clone(),
            stale_closes.clone(),
        ));
        info!(bridge = %config.bridge_url, tag = %config.target_tag, "proxy transport started");
        Self {
            config,
            sink: channel.sink,
            pending,
            rejected,
            stale_closes,
            listener,
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn canceller(&self) -> ProxyCanceller {
        ProxyCanceller {
            pending: self.pending.clone(),
        }
    }

    /// Inbound messages dropped because they came from a foreign origin.
    pub fn rejected_messages(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    pub fn has_pending(&self) -> bool {
        !lock(&self.pending).is_empty()
    }

    /// Post `action` and wait for its reply. One request may be outstanding
    /// at a time; a second fails with `BridgeBusyError`.
    pub async fn send(&self, action: Action, params: Value) -> Result<Value> {
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        {
            let mut table = lock(&self.pending);
            if let Some(busy) = table.values().next() {
                return Err(BridgeError::Busy(busy.reply_action.clone()));
            }
            table.insert(
                id,
                PendingEntry {
                    reply_action: reply_action(action.as_str()),
                    tx,
                },
            );
        }
        let guard = PendingGuard {
            table: &self.pending,
            id,
        };

        let envelope = RequestEnvelope {
            target: self.config.target_tag.clone(),
            action: action.as_str().to_string(),
            params,
            id: Some(id.to_string()),
        };
        debug!(%id, action = action.as_str(), "posting request");
        self.sink.post(encode(&envelope)?).await?;

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BridgeError::ChannelClosed),
            Err(_) => {
                drop(guard);
                warn!(%id, action = action.as_str(), "bridge did not reply in time");
                self.post_close_bridge().await;
                Err(BridgeError::Timeout)
            }
        }
    }

    /// Ask the frame to drop its transport and wait for the acknowledgement.
    pub async fn close_bridge(&self) -> Result<()> {
        self.send(Action::CloseBridge, Value::Object(Default::default()))
            .await
            .map(|_| ())
    }

    /// Fire-and-forget close. Its acknowledgement carries no id, so one
    /// id-less close reply is discarded per post; otherwise it could resolve
    /// a later [`close_bridge`](Self::close_bridge) through the action match.
    async fn post_close_bridge(&self) {
        let envelope = RequestEnvelope {
            target: self.config.target_tag.clone(),
            action: Action::CloseBridge.as_str().to_string(),
            params: Value::Object(Default::default()),
            id: None,
        };
        let posted = match encode(&envelope) {
            Ok(value) => self.sink.post(value).await,
            Err(e) => Err(e),
        };
        match posted {
            Ok(()) => {
                self.stale_closes.fetch_add(1, Ordering::AcqRel);
            }
            Err(e) => warn!(error = %e, "could not post close-bridge"),
        }
    }
}

impl Drop for ProxyTransport {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

async fn listen(
    origin: String,
    mut inbound: mpsc::Receiver<Frame>,
    pending: PendingTable,
    rejected: Arc<AtomicU64>,
    stale_closes: Arc<AtomicU64>,
) {
    while let Some(frame) = inbound.recv().await {
        // A foreign reply is dropped, not turned into an error: failing the
        // pending call here would let any page on the channel abort it. The
        // call keeps waiting for the real frame, bounded by its timeout.
        if frame.origin != origin {
            rejected.fetch_add(1, Ordering::Relaxed);
            warn!(origin = %frame.origin, expected = %origin, "rejected message from foreign origin");
            continue;
        }
        let reply: ReplyEnvelope = match serde_json::from_value(frame.data) {
            Ok(reply) => reply,
            Err(e) => {
                debug!(error = %e, "ignoring message that is not a reply envelope");
                continue;
            }
        };
        if reply.id.is_none() && reply.action == reply_action(Action::CloseBridge.as_str()) {
            let stale = stale_closes
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .is_ok();
            if stale {
                debug!("discarding acknowledgement of an abandoned close-bridge");
                continue;
            }
        }
        resolve(&pending, reply);
    }

    debug!("bridge channel closed");
    for (_, entry) in lock(&pending).drain() {
        let _ = entry.tx.send(Err(BridgeError::ChannelClosed));
    }
}

/// Match by correlation id when the frame echoes one, else by reply action.
fn resolve(pending: &PendingTable, reply: ReplyEnvelope) {
    let mut table = lock(pending);
    let id = match reply.id.as_deref().map(Uuid::parse_str) {
        Some(Ok(id)) => table.contains_key(&id).then_some(id),
        Some(Err(_)) => None,
        None => table
            .iter()
            .find(|(_, entry)| entry.reply_action == reply.action)
            .map(|(id, _)| *id),
    };
    let Some(id) = id else {
        debug!(action = %reply.action, "reply matches no pending request");
        return;
    };
    if table.get(&id).map(|e| e.reply_action.as_str()) != Some(reply.action.as_str()) {
        debug!(%id, action = %reply.action, "reply action does not match request");
        return;
    }
    if let Some(entry) = table.remove(&id) {
        debug!(%id, success = reply.success, "reply received");
        let _ = entry.tx.send(reply.into_result());
    }
}

// -- Session impls --

#[async_trait]
impl EvmSession for ProxyTransport {
    async fn unlock(&mut self, path: &DerivationPath) -> Result<PublicKeyMaterial> {
        let params = encode(&PathParams {
            hd_path: path.to_string(),
        })?;
        let payload: KeyPayload = decode("unlock payload", self.send(Action::Unlock, params).await?)?;
        PublicKeyMaterial::try_from(payload)
    }

    async fn sign_transaction(
        &mut self,
        path: &DerivationPath,
        tx: &[u8],
        to: Option<&str>,
    ) -> Result<EvmSignature> {
        let params = encode(&EvmSignParams {
            hd_path: path.to_string(),
            tx: hex::encode(tx),
            to: to.map(str::to_string),
        })?;
        let payload: SignaturePayload =
            decode("signature payload", self.send(Action::SignTransaction, params).await?)?;
        EvmSignature::try_from(payload)
    }

    async fn sign_personal_message(
        &mut self,
        path: &DerivationPath,
        message: &[u8],
    ) -> Result<EvmSignature> {
        let params = encode(&MessageParams {
            hd_path: path.to_string(),
            message: hex::encode(message),
        })?;
        let payload: SignaturePayload =
            decode("signature payload", self.send(Action::SignPersonalMessage, params).await?)?;
        EvmSignature::try_from(payload)
    }
}

#[async_trait]
impl CosmosSession for ProxyTransport {
    async fn unlock(&mut self, start: &DerivationPath, hrp: &str, limit: u32) -> Result<Vec<String>> {
        let params = encode(&CosmosUnlockParams {
            hd_path: start.to_plain_list(),
            hrp: hrp.to_string(),
            limit: Some(limit),
        })?;
        decode("unlock payload", self.send(Action::Unlock, params).await?)
    }

    async fn public_key(&mut self, path: &DerivationPath) -> Result<Vec<u8>> {
        let params = encode(&PathParams {
            hd_path: path.to_plain_list(),
        })?;
        let payload: PublicKeyPayload =
            decode("public key payload", self.send(Action::GetPublicKey, params).await?)?;
        decode_hex("publicKey", &payload.public_key)
    }

    async fn sign_transaction(
        &mut self,
        path: &DerivationPath,
        sign_bytes: &[u8],
        hrp: &str,
    ) -> Result<CosmosSignature> {
        let params = encode(&CosmosSignParams {
            hd_path: path.to_plain_list(),
            tx: hex::encode(sign_bytes),
            hrp: hrp.to_string(),
        })?;
        let payload: CosmosSignaturePayload =
            decode("signature payload", self.send(Action::SignTransaction, params).await?)?;
        CosmosSignature::try_from(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    const BRIDGE: &str = "https://bridge.example.org";

    /// Records posted envelopes instead of writing them anywhere.
    #[derive(Default)]
    struct RecordingSink {
        posted: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl MessageSink for RecordingSink {
        async fn post(&self, data: Value) -> Result<()> {
            self.posted.lock().unwrap().push(data);
            Ok(())
        }
    }

    struct Harness {
        proxy: Arc<ProxyTransport>,
        sink: Arc<RecordingSink>,
        frames: mpsc::Sender<Frame>,
    }

    fn harness(timeout: Duration) -> Harness {
        let sink = Arc::new(RecordingSink::default());
        let (frames, inbound) = mpsc::channel(8);
        let config = BridgeConfig::evm(format!("{BRIDGE}/bsc/")).with_timeout(timeout);
        let proxy = ProxyTransport::spawn(config, ProxyChannel::new(sink.clone(), inbound));
        Harness {
            proxy: Arc::new(proxy),
            sink,
            frames,
        }
    }

    async fn wait_for_post(sink: &RecordingSink, count: usize) -> Value {
        loop {
            if let Some(v) = sink.posted.lock().unwrap().get(count - 1).cloned() {
                return v;
            }
            tokio::task::yield_now().await;
        }
    }

    fn reply(origin: &str, data: Value) -> Frame {
        Frame {
            origin: origin.into(),
            data,
        }
    }

    #[tokio::test]
    async fn resolves_by_correlation_id() {
        let h = harness(Duration::from_secs(5));
        let proxy = h.proxy.clone();
        let call = tokio::spawn(async move { proxy.send(Action::Unlock, json!({})).await });

        let posted = wait_for_post(&h.sink, 1).await;
        assert_eq!(posted["target"], "LEDGER-IFRAME");
        assert_eq!(posted["action"], "ledger-unlock");
        let id = posted["id"].as_str().unwrap().to_string();

        h.frames
            .send(reply(
                BRIDGE,
                json!({ "action": "ledger-unlock-reply", "success": true, "payload": { "ok": 1 }, "id": id }),
            ))
            .await
            .unwrap();
        assert_eq!(call.await.unwrap().unwrap(), json!({ "ok": 1 }));
        assert!(!h.proxy.has_pending());
    }

    #[tokio::test]
    async fn resolves_by_action_without_id() {
        let h = harness(Duration::from_secs(5));
        let proxy = h.proxy.clone();
        let call = tokio::spawn(async move { proxy.send(Action::Unlock, json!({})).await });
        wait_for_post(&h.sink, 1).await;

        h.frames
            .send(reply(
                BRIDGE,
                json!({ "action": "ledger-unlock-reply", "success": false, "payload": { "error": "LEDGER_WRONG_APP" } }),
            ))
            .await
            .unwrap();
        assert_eq!(call.await.unwrap().unwrap_err(), BridgeError::WrongApp);
    }

    #[tokio::test]
    async fn foreign_origin_is_rejected_and_does_not_resolve() {
        let h = harness(Duration::from_secs(5));
        let proxy = h.proxy.clone();
        let call = tokio::spawn(async move { proxy.send(Action::Unlock, json!({})).await });
        wait_for_post(&h.sink, 1).await;

        let spoofed = json!({ "action": "ledger-unlock-reply", "success": true, "payload": { "evil": true } });
        h.frames
            .send(reply("https://evil.example", spoofed))
            .await
            .unwrap();
        h.frames
            .send(reply(
                BRIDGE,
                json!({ "action": "ledger-unlock-reply", "success": true, "payload": { "ok": 1 } }),
            ))
            .await
            .unwrap();

        assert_eq!(call.await.unwrap().unwrap(), json!({ "ok": 1 }));
        assert_eq!(h.proxy.rejected_messages(), 1);
    }

    #[tokio::test]
    async fn mismatched_action_is_ignored() {
        let h = harness(Duration::from_secs(5));
        let proxy = h.proxy.clone();
        let call = tokio::spawn(async move { proxy.send(Action::Unlock, json!({})).await });
        let posted = wait_for_post(&h.sink, 1).await;
        let id = posted["id"].as_str().unwrap().to_string();

        h.frames
            .send(reply(
                BRIDGE,
                json!({ "action": "ledger-sign-transaction-reply", "success": true, "payload": {} }),
            ))
            .await
            .unwrap();
        h.frames
            .send(reply(
                BRIDGE,
                json!({ "action": "ledger-sign-transaction-reply", "success": true, "payload": {}, "id": id }),
            ))
            .await
            .unwrap();
        h.frames
            .send(reply(
                BRIDGE,
                json!({ "action": "ledger-unlock-reply", "success": true, "payload": "done", "id": id }),
            ))
            .await
            .unwrap();

        assert_eq!(call.await.unwrap().unwrap(), json!("done"));
    }

    #[tokio::test]
    async fn second_request_is_busy() {
        let h = harness(Duration::from_secs(5));
        let proxy = h.proxy.clone();
        let _first = tokio::spawn(async move { proxy.send(Action::Unlock, json!({})).await });
        wait_for_post(&h.sink, 1).await;

        let err = h
            .proxy
            .send(Action::SignTransaction, json!({}))
            .await
            .unwrap_err();
        assert_eq!(err, BridgeError::Busy("ledger-unlock-reply".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_posts_close_bridge() {
        let h = harness(Duration::from_secs(30));
        let err = h.proxy.send(Action::Unlock, json!({})).await.unwrap_err();
        assert_eq!(err, BridgeError::Timeout);
        assert!(!h.proxy.has_pending());

        let close = wait_for_post(&h.sink, 2).await;
        assert_eq!(close["action"], "ledger-close-bridge");
        assert_eq!(close["target"], "LEDGER-IFRAME");
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_close_ack_does_not_answer_a_new_close() {
        let h = harness(Duration::from_secs(30));
        let err = h.proxy.send(Action::Unlock, json!({})).await.unwrap_err();
        assert_eq!(err, BridgeError::Timeout);
        wait_for_post(&h.sink, 2).await;

        let proxy = h.proxy.clone();
        let close = tokio::spawn(async move { proxy.close_bridge().await });
        let posted = wait_for_post(&h.sink, 3).await;
        let id = posted["id"].as_str().unwrap().to_string();

        h.frames
            .send(reply(
                BRIDGE,
                json!({ "action": "ledger-close-bridge-reply", "success": false, "payload": { "error": "LEDGER_TIMEOUT" } }),
            ))
            .await
            .unwrap();
        h.frames
            .send(reply(
                BRIDGE,
                json!({ "action": "ledger-close-bridge-reply", "success": true, "payload": {}, "id": id }),
            ))
            .await
            .unwrap();

        close.await.unwrap().unwrap();
        assert!(!h.proxy.has_pending());
    }

    #[tokio::test]
    async fn canceller_fails_pending_request() {
        let h = harness(Duration::from_secs(5));
        let proxy = h.proxy.clone();
        let call = tokio::spawn(async move { proxy.send(Action::Unlock, json!({})).await });
        wait_for_post(&h.sink, 1).await;

        assert!(h.proxy.canceller().cancel());
        assert_eq!(call.await.unwrap().unwrap_err(), BridgeError::Cancelled);
        assert!(!h.proxy.canceller().cancel());
    }

    #[tokio::test]
    async fn dropped_future_frees_the_slot() {
        let h = harness(Duration::from_secs(5));
        let proxy = h.proxy.clone();
        let call = tokio::spawn(async move { proxy.send(Action::Unlock, json!({})).await });
        wait_for_post(&h.sink, 1).await;
        call.abort();
        let _ = call.await;
        assert!(!h.proxy.has_pending());
    }

    #[tokio::test]
    async fn closed_channel_fails_pending() {
        let h = harness(Duration::from_secs(5));
        let proxy = h.proxy.clone();
        let call = tokio::spawn(async move { proxy.send(Action::Unlock, json!({})).await });
        wait_for_post(&h.sink, 1).await;
        drop(h.frames);
        assert_eq!(call.await.unwrap().unwrap_err(), BridgeError::ChannelClosed);
    }
}
