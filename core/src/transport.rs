/// Transport capability: create a connection, exchange APDUs, close.
///
/// Concrete drivers (HID, the in-memory emulator) implement these traits; the
/// rest of the crate never sees anything but [`DeviceError`] from them.
use async_trait::async_trait;

use crate::apdu::{ApduAnswer, ApduCommand};
use crate::classify::DeviceError;

#[async_trait]
pub trait Transport: Send {
    async fn exchange(&mut self, command: &ApduCommand) -> Result<ApduAnswer, DeviceError>;

    async fn close(&mut self) -> Result<(), DeviceError>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Open a fresh connection to the device.
    async fn create(&self) -> Result<Box<dyn Transport>, DeviceError>;
}

/// Exchange one command and unwrap the status word.
pub async fn call(
    transport: &mut dyn Transport,
    command: ApduCommand,
) -> Result<Vec<u8>, DeviceError> {
    tracing::debug!(
        cla = command.cla,
        ins = command.ins,
        p1 = command.p1,
        p2 = command.p2,
        len = command.data.len(),
        "apdu exchange"
    );
    let answer = transport.exchange(&command).await?;
    if answer.status() != crate::apdu::SW_OK {
        tracing::debug!(status = format!("0x{:04x}", answer.status()), "apdu rejected");
    }
    answer.into_result()
}
