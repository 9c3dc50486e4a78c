/// Device sessions.
///
/// [`EvmSession`] and [`CosmosSession`] are the capability seams the facades
/// talk to; [`DirectTransport`] (in-process device I/O) and
/// [`ProxyTransport`](crate::proxy::ProxyTransport) (relayed to a bridge frame)
/// implement them. A direct call always runs open → one device call → close;
/// transports are never reused across calls.
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::app::{cosmos, eth, CosmosSignature, EvmSignature};
use crate::error::{BridgeError, Result};
use crate::keys::PublicKeyMaterial;
use crate::path::DerivationPath;
use crate::transport::{Transport, TransportFactory};

#[async_trait]
pub trait EvmSession: Send {
    /// Public key, chain code and address at `path`, without on-device display.
    async fn unlock(&mut self, path: &DerivationPath) -> Result<PublicKeyMaterial>;

    /// `to` is the lowercase destination hint some bridge firmwares display.
    async fn sign_transaction(
        &mut self,
        path: &DerivationPath,
        tx: &[u8],
        to: Option<&str>,
    ) -> Result<EvmSignature>;

    async fn sign_personal_message(
        &mut self,
        path: &DerivationPath,
        message: &[u8],
    ) -> Result<EvmSignature>;
}

#[async_trait]
pub trait CosmosSession: Send {
    /// `limit` consecutive bech32 addresses starting at `start`.
    async fn unlock(&mut self, start: &DerivationPath, hrp: &str, limit: u32) -> Result<Vec<String>>;

    /// Uncompressed public key at `path`.
    async fn public_key(&mut self, path: &DerivationPath) -> Result<Vec<u8>>;

    async fn sign_transaction(
        &mut self,
        path: &DerivationPath,
        sign_bytes: &[u8],
        hrp: &str,
    ) -> Result<CosmosSignature>;
}

// -- Session lifecycle --

/// One open transport. `None` once closed; every use goes through
/// [`DeviceSession::must_have_app`].
pub struct DeviceSession {
    transport: Option<Box<dyn Transport>>,
}

impl DeviceSession {
    /// Open a fresh transport. Creation failures come back classified.
    pub async fn open(factory: &dyn TransportFactory) -> Result<Self> {
        let transport = factory.create().await?;
        info!("device session opened");
        Ok(Self {
            transport: Some(transport),
        })
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    pub fn must_have_app(&mut self) -> Result<&mut dyn Transport> {
        match self.transport.as_deref_mut() {
            Some(transport) => Ok(transport),
            None => Err(BridgeError::NoSession),
        }
    }

    /// Release the transport. Close failures are logged, never raised, so the
    /// caller's own result is what surfaces.
    pub async fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                warn!(error = %e, "closing device transport failed");
            }
            info!("device session closed");
        }
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        if self.transport.is_some() {
            warn!("device session dropped without close");
        }
    }
}

// -- Direct adapter --

/// In-process adapter: opens its own transport for every call.
#[derive(Clone)]
pub struct DirectTransport {
    factory: Arc<dyn TransportFactory>,
}

impl DirectTransport {
    pub fn new(factory: Arc<dyn TransportFactory>) -> Self {
        Self { factory }
    }

    async fn open(&self) -> Result<DeviceSession> {
        DeviceSession::open(self.factory.as_ref()).await
    }
}

#[async_trait]
impl EvmSession for DirectTransport {
    async fn unlock(&mut self, path: &DerivationPath) -> Result<PublicKeyMaterial> {
        let mut session = self.open().await?;
        let result = async { eth::get_address(session.must_have_app()?, path, false, true).await }.await;
        session.close().await;
        result
    }

    async fn sign_transaction(
        &mut self,
        path: &DerivationPath,
        tx: &[u8],
        to: Option<&str>,
    ) -> Result<EvmSignature> {
        if let Some(to) = to {
            debug!(to, "destination hint not used by the direct transport");
        }
        let mut session = self.open().await?;
        let result = async { eth::sign_transaction(session.must_have_app()?, path, tx).await }.await;
        session.close().await;
        result
    }

    async fn sign_personal_message(
        &mut self,
        path: &DerivationPath,
        message: &[u8],
    ) -> Result<EvmSignature> {
        let mut session = self.open().await?;
        let result = async {
            eth::sign_personal_message(session.must_have_app()?, path, message).await
        }
        .await;
        session.close().await;
        result
    }
}

#[async_trait]
impl CosmosSession for DirectTransport {
    async fn unlock(&mut self, start: &DerivationPath, hrp: &str, limit: u32) -> Result<Vec<String>> {
        let mut session = self.open().await?;
        let result = async {
            cosmos::get_addresses(session.must_have_app()?, start, hrp, limit).await
        }
        .await;
        session.close().await;
        result
    }

    async fn public_key(&mut self, path: &DerivationPath) -> Result<Vec<u8>> {
        let mut session = self.open().await?;
        let result = async { cosmos::public_key(session.must_have_app()?, path).await }.await;
        session.close().await;
        result
    }

    async fn sign_transaction(
        &mut self,
        path: &DerivationPath,
        sign_bytes: &[u8],
        hrp: &str,
    ) -> Result<CosmosSignature> {
        let mut session = self.open().await?;
        let result = async {
            cosmos::sign_transaction(session.must_have_app()?, path, sign_bytes, hrp).await
        }
        .await;
        session.close().await;
        result
    }
}
