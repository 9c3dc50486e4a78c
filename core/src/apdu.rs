/// APDU framing shared by every device application.
use crate::classify::DeviceError;

/// Status word of a successful exchange.
pub const SW_OK: u16 = 0x9000;

/// Short-form command APDU: `CLA INS P1 P2 Lc data`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduCommand {
    pub cla: u8,
    pub ins: u8,
    pub p1: u8,
    pub p2: u8,
    pub data: Vec<u8>,
}

impl ApduCommand {
    pub fn new(cla: u8, ins: u8, p1: u8, p2: u8, data: Vec<u8>) -> Self {
        Self {
            cla,
            ins,
            p1,
            p2,
            data,
        }
    }

    /// Wire bytes. Short APDUs cap the payload at 255 bytes; every app in this
    /// crate chunks well below that.
    pub fn to_bytes(&self) -> Result<Vec<u8>, DeviceError> {
        let lc = u8::try_from(self.data.len()).map_err(|_| {
            DeviceError::Text(format!("APDU payload too long: {} bytes", self.data.len()))
        })?;
        let mut out = Vec::with_capacity(5 + self.data.len());
        out.extend_from_slice(&[self.cla, self.ins, self.p1, self.p2, lc]);
        out.extend_from_slice(&self.data);
        Ok(out)
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, DeviceError> {
        if raw.len() < 5 {
            return Err(DeviceError::status(0x6700));
        }
        let lc = usize::from(raw[4]);
        let data = raw
            .get(5..5 + lc)
            .ok_or_else(|| DeviceError::status(0x6700))?
            .to_vec();
        Ok(Self::new(raw[0], raw[1], raw[2], raw[3], data))
    }
}

/// Response APDU: payload followed by a two-byte status word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApduAnswer {
    data: Vec<u8>,
    status: u16,
}

impl ApduAnswer {
    pub fn new(data: Vec<u8>, status: u16) -> Self {
        Self { data, status }
    }

    pub fn ok(data: Vec<u8>) -> Self {
        Self::new(data, SW_OK)
    }

    pub fn error(status: u16) -> Self {
        Self::new(Vec::new(), status)
    }

    pub fn from_bytes(raw: &[u8]) -> Result<Self, DeviceError> {
        if raw.len() < 2 {
            return Err(DeviceError::Text(format!(
                "device answer too short: {} bytes",
                raw.len()
            )));
        }
        let (data, sw) = raw.split_at(raw.len() - 2);
        Ok(Self::new(data.to_vec(), u16::from_be_bytes([sw[0], sw[1]])))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.data.clone();
        out.extend_from_slice(&self.status.to_be_bytes());
        out
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// Payload on `0x9000`, otherwise the status as a raw device error.
    pub fn into_result(self) -> Result<Vec<u8>, DeviceError> {
        if self.status == SW_OK {
            Ok(self.data)
        } else {
            Err(DeviceError::status(self.status))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_encoding() {
        let cmd = ApduCommand::new(0xe0, 0x02, 0x00, 0x01, vec![0xaa, 0xbb]);
        let bytes = cmd.to_bytes().unwrap();
        assert_eq!(bytes, vec![0xe0, 0x02, 0x00, 0x01, 0x02, 0xaa, 0xbb]);
        assert_eq!(ApduCommand::from_bytes(&bytes).unwrap(), cmd);
    }

    #[test]
    fn oversized_payload_rejected() {
        let cmd = ApduCommand::new(0xe0, 0x04, 0, 0, vec![0; 256]);
        assert!(cmd.to_bytes().is_err());
    }

    #[test]
    fn truncated_command_is_incorrect_length() {
        let err = ApduCommand::from_bytes(&[0xe0, 0x02, 0, 0, 4, 1]).unwrap_err();
        assert_eq!(err, DeviceError::status(0x6700));
    }

    #[test]
    fn answer_status_word() {
        let answer = ApduAnswer::from_bytes(&[1, 2, 0x90, 0x00]).unwrap();
        assert_eq!(answer.status(), SW_OK);
        assert_eq!(answer.into_result().unwrap(), vec![1, 2]);

        let err = ApduAnswer::from_bytes(&[0x69, 0x85]).unwrap().into_result().unwrap_err();
        match err {
            DeviceError::Status { code, message } => {
                assert_eq!(code, 0x6985);
                assert!(message.contains("0x6985"));
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }
}
