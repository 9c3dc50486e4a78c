//! In-memory Ledger emulator for tests and demos.
//!
//! Speaks the Ethereum and Binance-Chain APDU sets on top of a BIP-39 seed,
//! with real BIP-32 private derivation and secp256k1 signing. Failures can be
//! scripted with the raw shapes real transports produce.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use coins_bip32::xkeys::{Parent, XPriv};
use k256::ecdsa::SigningKey;
use sha2::{Digest, Sha256};
use sha3::Keccak256;
use zeroize::Zeroizing;

use crate::apdu::{ApduAnswer, ApduCommand};
use crate::app::{cosmos, eth};
use crate::classify::DeviceError;
use crate::keys::personal_message_hash;
use crate::transport::{Transport, TransportFactory};

/// The standard all-`abandon` test mnemonic.
pub const TEST_MNEMONIC: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

const SW_INCORRECT_DATA: u16 = 0x6a80;
const SW_INS_NOT_SUPPORTED: u16 = 0x6d00;
const SW_CLA_NOT_SUPPORTED: u16 = 0x6e00;
const SW_LOCKED: u16 = 0x5515;

/// Which application is open on the emulated device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunningApp {
    Ethereum,
    Binance,
    Dashboard,
}

impl RunningApp {
    fn cla(self) -> Option<u8> {
        match self {
            Self::Ethereum => Some(eth::CLA),
            Self::Binance => Some(cosmos::CLA),
            Self::Dashboard => None,
        }
    }
}

#[derive(Default)]
struct Chunked {
    path: Vec<u32>,
    expected: Option<usize>,
    data: Vec<u8>,
}

struct State {
    seed: Zeroizing<Vec<u8>>,
    app: RunningApp,
    locked: bool,
    wrong_key: bool,
    open_failures: VecDeque<DeviceError>,
    exchange_failures: VecDeque<DeviceError>,
    commands: Vec<ApduCommand>,
    opened: usize,
    closed: usize,
    chunked: Chunked,
}

/// Emulated device. Clones share state, so a test can keep a handle for
/// inspection after handing one to a session.
#[derive(Clone)]
pub struct Emulator {
    state: Arc<Mutex<State>>,
}

impl Emulator {
    pub fn from_mnemonic(phrase: &str, app: RunningApp) -> Result<Self, DeviceError> {
        let mnemonic = bip39::Mnemonic::parse_normalized(phrase)
            .map_err(|e| DeviceError::Text(format!("invalid mnemonic: {e}")))?;
        Ok(Self::from_seed(mnemonic.to_seed("").to_vec(), app))
    }

    pub fn from_seed(seed: Vec<u8>, app: RunningApp) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                seed: Zeroizing::new(seed),
                app,
                locked: false,
                wrong_key: false,
                open_failures: VecDeque::new(),
                exchange_failures: VecDeque::new(),
                commands: Vec::new(),
                opened: 0,
                closed: 0,
                chunked: Chunked::default(),
            })),
        }
    }

    fn with_test_mnemonic(app: RunningApp) -> Self {
        let seed = bip39::Mnemonic::parse_normalized(TEST_MNEMONIC)
            .map(|m| m.to_seed("").to_vec())
            .unwrap_or_default();
        Self::from_seed(seed, app)
    }

    /// Test mnemonic with the Ethereum app open.
    pub fn ethereum() -> Self {
        Self::with_test_mnemonic(RunningApp::Ethereum)
    }

    /// Test mnemonic with the Binance-Chain app open.
    pub fn binance() -> Self {
        Self::with_test_mnemonic(RunningApp::Binance)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn open_app(&self, app: RunningApp) {
        self.state().app = app;
    }

    /// A locked device answers every command with `0x5515`.
    pub fn set_locked(&self, locked: bool) {
        self.state().locked = locked;
    }

    /// Sign with the master key instead of the requested path.
    pub fn sign_with_wrong_key(&self, enabled: bool) {
        self.state().wrong_key = enabled;
    }

    pub fn fail_next_open(&self, err: DeviceError) {
        self.state().open_failures.push_back(err);
    }

    pub fn fail_next_exchange(&self, err: DeviceError) {
        self.state().exchange_failures.push_back(err);
    }

    pub fn sessions_opened(&self) -> usize {
        self.state().opened
    }

    pub fn sessions_closed(&self) -> usize {
        self.state().closed
    }

    /// Every command received so far.
    pub fn commands(&self) -> Vec<ApduCommand> {
        self.state().commands.clone()
    }

    /// Number of commands received with the given instruction byte.
    pub fn count_ins(&self, ins: u8) -> usize {
        self.state().commands.iter().filter(|c| c.ins == ins).count()
    }
}

#[async_trait]
impl TransportFactory for Emulator {
    async fn create(&self) -> Result<Box<dyn Transport>, DeviceError> {
        let mut state = self.state();
        if let Some(err) = state.open_failures.pop_front() {
            return Err(err);
        }
        state.opened += 1;
        Ok(Box::new(EmulatorTransport {
            device: self.clone(),
            closed: false,
        }))
    }
}

struct EmulatorTransport {
    device: Emulator,
    closed: bool,
}

#[async_trait]
impl Transport for EmulatorTransport {
    async fn exchange(&mut self, command: &ApduCommand) -> Result<ApduAnswer, DeviceError> {
        if self.closed {
            return Err(DeviceError::Named {
                name: "DisconnectedDeviceDuringOperation".into(),
                message: "transport closed".into(),
            });
        }
        // Round-trip through the wire form, as a USB hop would.
        let command = ApduCommand::from_bytes(&command.to_bytes()?)?;
        let mut state = self.device.state();
        state.commands.push(command.clone());
        if let Some(err) = state.exchange_failures.pop_front() {
            return Err(err);
        }
        Ok(state.handle(&command))
    }

    async fn close(&mut self) -> Result<(), DeviceError> {
        if !self.closed {
            self.closed = true;
            self.device.state().closed += 1;
        }
        Ok(())
    }
}

// -- Device logic --

impl State {
    fn handle(&mut self, command: &ApduCommand) -> ApduAnswer {
        if self.locked {
            return ApduAnswer::error(SW_LOCKED);
        }
        if self.app.cla() != Some(command.cla) {
            return ApduAnswer::error(SW_CLA_NOT_SUPPORTED);
        }
        let answer = match (command.cla, command.ins) {
            (eth::CLA, eth::INS_GET_ADDRESS) => self.eth_get_address(command),
            (eth::CLA, eth::INS_SIGN_TRANSACTION) => self.eth_sign_transaction(command),
            (eth::CLA, eth::INS_SIGN_PERSONAL_MESSAGE) => self.eth_sign_personal(command),
            (cosmos::CLA, cosmos::INS_PUBLIC_KEY) => self.cosmos_public_key(command),
            (cosmos::CLA, cosmos::INS_SHOW_ADDRESS) => self.cosmos_show_address(command),
            (cosmos::CLA, cosmos::INS_SIGN) => self.cosmos_sign(command),
            _ => return ApduAnswer::error(SW_INS_NOT_SUPPORTED),
        };
        answer.unwrap_or_else(ApduAnswer::error)
    }

    fn master(&self) -> Result<XPriv, u16> {
        XPriv::root_from_seed(&self.seed, None).map_err(|_| SW_INCORRECT_DATA)
    }

    fn derive(&self, path: &[u32]) -> Result<(SigningKey, [u8; 32]), u16> {
        let key = path
            .iter()
            .try_fold(self.master()?, |key, index| key.derive_child(*index))
            .map_err(|_| SW_INCORRECT_DATA)?;
        let signing: &SigningKey = key.as_ref();
        let info: &coins_bip32::primitives::XKeyInfo = key.as_ref();
        Ok((signing.clone(), info.chain_code.0))
    }

    fn signing_key(&self, path: &[u32]) -> Result<SigningKey, u16> {
        if self.wrong_key {
            return Ok(self.derive(&[])?.0);
        }
        Ok(self.derive(path)?.0)
    }

    fn eth_get_address(&mut self, command: &ApduCommand) -> Result<ApduAnswer, u16> {
        let (path, _) = parse_path(&command.data, u32::from_be_bytes)?;
        let (key, chain_code) = self.derive(&path)?;
        let point = key.verifying_key().to_encoded_point(false);
        let hash = Keccak256::digest(&point.as_bytes()[1..]);
        let address = hex::encode(&hash[12..]);

        let mut data = vec![65];
        data.extend_from_slice(point.as_bytes());
        data.push(40);
        data.extend_from_slice(address.as_bytes());
        if command.p2 == 1 {
            data.extend_from_slice(&chain_code);
        }
        Ok(ApduAnswer::ok(data))
    }

    /// Without an RLP parser the end of the transaction is unknown, so every
    /// chunk is answered with the signature over the data received so far.
    fn eth_sign_transaction(&mut self, command: &ApduCommand) -> Result<ApduAnswer, u16> {
        if command.p1 == eth::P1_FIRST_CHUNK {
            let (path, rest) = parse_path(&command.data, u32::from_be_bytes)?;
            self.chunked = Chunked {
                path,
                expected: None,
                data: rest.to_vec(),
            };
        } else {
            self.chunked.data.extend_from_slice(&command.data);
        }
        let digest: [u8; 32] = Keccak256::digest(&self.chunked.data).into();
        self.sign_recoverable(&self.chunked.path.clone(), &digest)
    }

    fn eth_sign_personal(&mut self, command: &ApduCommand) -> Result<ApduAnswer, u16> {
        if command.p1 == eth::P1_FIRST_CHUNK {
            let (path, rest) = parse_path(&command.data, u32::from_be_bytes)?;
            let len: [u8; 4] = rest
                .get(..4)
                .and_then(|b| b.try_into().ok())
                .ok_or(SW_INCORRECT_DATA)?;
            self.chunked = Chunked {
                path,
                expected: Some(u32::from_be_bytes(len) as usize),
                data: rest[4..].to_vec(),
            };
        } else {
            self.chunked.data.extend_from_slice(&command.data);
        }
        let expected = self.chunked.expected.ok_or(SW_INCORRECT_DATA)?;
        if self.chunked.data.len() < expected {
            return Ok(ApduAnswer::ok(Vec::new()));
        }
        let digest = personal_message_hash(&self.chunked.data);
        self.sign_recoverable(&self.chunked.path.clone(), &digest)
    }

    fn sign_recoverable(&self, path: &[u32], digest: &[u8; 32]) -> Result<ApduAnswer, u16> {
        let key = self.signing_key(path)?;
        let (signature, recovery) = key
            .sign_prehash_recoverable(digest)
            .map_err(|_| SW_INCORRECT_DATA)?;
        let mut data = vec![27 + recovery.to_byte()];
        data.extend_from_slice(&signature.to_bytes());
        Ok(ApduAnswer::ok(data))
    }

    fn cosmos_public_key(&mut self, command: &ApduCommand) -> Result<ApduAnswer, u16> {
        let (path, _) = parse_path(&command.data, u32::from_le_bytes)?;
        let (key, _) = self.derive(&path)?;
        let point = key.verifying_key().to_encoded_point(false);
        Ok(ApduAnswer::ok(point.as_bytes().to_vec()))
    }

    fn cosmos_show_address(&mut self, command: &ApduCommand) -> Result<ApduAnswer, u16> {
        let hrp_len = usize::from(*command.data.first().ok_or(SW_INCORRECT_DATA)?);
        let rest = command.data.get(1 + hrp_len..).ok_or(SW_INCORRECT_DATA)?;
        parse_path(rest, u32::from_le_bytes)?;
        Ok(ApduAnswer::ok(Vec::new()))
    }

    fn cosmos_sign(&mut self, command: &ApduCommand) -> Result<ApduAnswer, u16> {
        if command.p1 == 1 {
            let (path, _) = parse_path(&command.data, u32::from_le_bytes)?;
            self.chunked = Chunked {
                path,
                expected: None,
                data: Vec::new(),
            };
        } else {
            self.chunked.data.extend_from_slice(&command.data);
        }
        if command.p1 < command.p2 {
            return Ok(ApduAnswer::ok(Vec::new()));
        }
        let key = self.signing_key(&self.chunked.path)?;
        let digest = Sha256::digest(&self.chunked.data);
        let (signature, _) = key
            .sign_prehash_recoverable(&digest)
            .map_err(|_| SW_INCORRECT_DATA)?;
        Ok(ApduAnswer::ok(signature.to_der().as_bytes().to_vec()))
    }
}

/// Count byte + u32 components, in the app's byte order. Returns the path and
/// whatever follows it.
fn parse_path(data: &[u8], decode: fn([u8; 4]) -> u32) -> Result<(Vec<u32>, &[u8]), u16> {
    let count = usize::from(*data.first().ok_or(SW_INCORRECT_DATA)?);
    let body = data.get(1..1 + count * 4).ok_or(SW_INCORRECT_DATA)?;
    let path = body
        .chunks_exact(4)
        .map(|c| decode([c[0], c[1], c[2], c[3]]))
        .collect();
    Ok((path, &data[1 + count * 4..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::eth_address;
    use crate::path::HARDENED;

    const HARDENED_44: u32 = 44 | HARDENED;

    #[test]
    fn derives_known_ethereum_account() {
        let emulator = Emulator::ethereum();
        let state = emulator.state();
        let (key, _) = state
            .derive(&[HARDENED_44, 60 | HARDENED, HARDENED, 0, 0])
            .unwrap();
        let point = key.verifying_key().to_encoded_point(false);
        assert_eq!(
            eth_address(point.as_bytes()).unwrap(),
            "0x9858EfFD232B4033E47d90003D41EC34EcaEda94"
        );
    }

    #[test]
    fn wrong_cla_is_rejected() {
        let emulator = Emulator::binance();
        let answer = emulator
            .state()
            .handle(&ApduCommand::new(eth::CLA, eth::INS_GET_ADDRESS, 0, 1, vec![0]));
        assert_eq!(answer.status(), SW_CLA_NOT_SUPPORTED);
    }

    #[test]
    fn locked_device_answers_locked() {
        let emulator = Emulator::ethereum();
        emulator.set_locked(true);
        let answer = emulator
            .state()
            .handle(&ApduCommand::new(eth::CLA, eth::INS_GET_ADDRESS, 0, 1, vec![0]));
        assert_eq!(answer.status(), SW_LOCKED);
    }

    #[tokio::test]
    async fn oversized_command_never_reaches_the_device() {
        let emulator = Emulator::ethereum();
        let mut transport = emulator.create().await.unwrap();
        let command = ApduCommand::new(eth::CLA, eth::INS_SIGN_TRANSACTION, 0, 0, vec![0; 256]);
        assert!(transport.exchange(&command).await.is_err());
        assert!(emulator.commands().is_empty());
    }

    #[test]
    fn rejects_bad_mnemonic() {
        assert!(Emulator::from_mnemonic("not a mnemonic", RunningApp::Ethereum).is_err());
    }
}
