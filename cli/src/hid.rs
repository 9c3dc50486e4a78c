/// USB HID driver for a physical Ledger, behind the core transport traits.
///
/// The HID calls block, so every open and exchange runs on the blocking pool.
use std::sync::Arc;

use async_trait::async_trait;
use ledger_bridge_core::{ApduAnswer, ApduCommand, DeviceError, Transport, TransportFactory};
use ledger_transport_hid::hidapi::HidApi;
use ledger_transport_hid::TransportNativeHID;
use tracing::{debug, info};

/// Opens the first Ledger found on the USB bus.
pub struct HidTransportFactory;

#[async_trait]
impl TransportFactory for HidTransportFactory {
    async fn create(&self) -> Result<Box<dyn Transport>, DeviceError> {
        let device = tokio::task::spawn_blocking(|| {
            let api = HidApi::new().map_err(|e| open_failed(e.to_string()))?;
            TransportNativeHID::new(&api).map_err(|e| open_failed(e.to_string()))
        })
        .await
        .map_err(|e| DeviceError::Text(format!("HID task failed: {e}")))??;
        info!("Ledger device connected");
        Ok(Box::new(HidTransport {
            device: Some(Arc::new(device)),
        }))
    }
}

struct HidTransport {
    device: Option<Arc<TransportNativeHID>>,
}

#[async_trait]
impl Transport for HidTransport {
    async fn exchange(&mut self, command: &ApduCommand) -> Result<ApduAnswer, DeviceError> {
        let device = self
            .device
            .clone()
            .ok_or_else(|| DeviceError::Text("HID transport already closed".into()))?;
        // Length-checked wire form; the HID crate casts Lc without checking.
        let wire = command.to_bytes()?;
        let apdu = ledger_apdu::APDUCommand {
            cla: wire[0],
            ins: wire[1],
            p1: wire[2],
            p2: wire[3],
            data: wire[5..].to_vec(),
        };
        let answer = tokio::task::spawn_blocking(move || device.exchange(&apdu))
            .await
            .map_err(|e| DeviceError::Text(format!("HID task failed: {e}")))?
            .map_err(|e| DeviceError::Named {
                name: "TransportError".into(),
                message: e.to_string(),
            })?;
        Ok(ApduAnswer::new(answer.data().to_vec(), answer.retcode()))
    }

    async fn close(&mut self) -> Result<(), DeviceError> {
        if self.device.take().is_some() {
            debug!("HID transport released");
        }
        Ok(())
    }
}

fn open_failed(message: String) -> DeviceError {
    DeviceError::Named {
        name: "TransportOpenFailed".into(),
        message,
    }
}
