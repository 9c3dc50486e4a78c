#[cfg(feature = "hid")]
mod hid;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use ledger_bridge_core::config::BRIDGE_URL_ENV;
use ledger_bridge_core::emulator::Emulator;
use ledger_bridge_core::proxy::framing::{spawn_frame_reader, FramedSink};
use ledger_bridge_core::{
    AddressRecord, Backend, BridgeConfig, ChainFamily, CosmosBridge, DerivationPath,
    DirectTransport, EvmBridge, Responder, SignTarget, TransportFactory,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "ledger-bridge",
    about = "Ledger address discovery and signing for EVM and Cosmos-style chains",
    version
)]
pub(crate) struct Cli {
    /// Chain family: evm (bsc, eth) or cosmos (bbc, bnb)
    #[arg(long, global = true, default_value = "evm")]
    family: ChainFamily,

    /// Talk to the built-in emulator (test mnemonic) instead of a USB device
    #[arg(long, global = true)]
    emulator: bool,

    /// Output in JSON format
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Answer bridge requests framed on stdin, replies on stdout
    Serve {
        /// Origin stamped on outgoing frames (default: origin of the bridge URL)
        #[arg(long)]
        origin: Option<String>,

        /// Bridge base URL
        #[arg(long, env = BRIDGE_URL_ENV)]
        bridge_url: Option<String>,
    },
    /// List a page of addresses
    Accounts {
        /// 1-based page number
        #[arg(long, default_value_t = 1)]
        page: u32,

        /// Base derivation path, e.g. 44'/60'/0' or 44,714,0,0,0
        #[arg(long)]
        hd_path: Option<String>,

        /// Bech32 prefix (cosmos only)
        #[arg(long)]
        hrp: Option<String>,
    },
    /// Show the address and public key at a path
    Address {
        #[arg(long)]
        path: String,

        /// Bech32 prefix (cosmos only)
        #[arg(long)]
        hrp: Option<String>,
    },
    /// Personal-sign a message (evm only)
    SignMessage {
        #[arg(long)]
        path: String,

        /// `0x`-prefixed hex, or plain text
        message: String,
    },
}

impl Cli {
    fn factory(&self) -> Result<Arc<dyn TransportFactory>> {
        if self.emulator {
            let emulator = match self.family {
                ChainFamily::Evm => Emulator::ethereum(),
                ChainFamily::Cosmos => Emulator::binance(),
            };
            info!(family = %self.family, "using emulated device");
            return Ok(Arc::new(emulator));
        }
        hid_factory()
    }
}

#[cfg(feature = "hid")]
fn hid_factory() -> Result<Arc<dyn TransportFactory>> {
    Ok(Arc::new(hid::HidTransportFactory))
}

#[cfg(not(feature = "hid"))]
fn hid_factory() -> Result<Arc<dyn TransportFactory>> {
    bail!("Built without HID support. Rebuild with --features hid or pass --emulator.")
}

/// Paths are accepted in Ledger form (`44'/60'/0'`) or as plain indices (`44,714,0,0,0`).
fn parse_path(raw: &str) -> Result<DerivationPath> {
    let path = if raw.contains(',') {
        DerivationPath::parse_plain_list(raw)
    } else {
        raw.parse()
    };
    path.with_context(|| format!("Invalid derivation path '{raw}'"))
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries frames in serve mode; logs always go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match &cli.command {
        Command::Serve { origin, bridge_url } => {
            serve(&cli, origin.as_deref(), bridge_url.as_deref()).await
        }
        Command::Accounts { page, hd_path, hrp } => {
            accounts(&cli, *page, hd_path.as_deref(), hrp.as_deref()).await
        }
        Command::Address { path, hrp } => address(&cli, path, hrp.as_deref()).await,
        Command::SignMessage { path, message } => sign_message(&cli, path, message).await,
    }
}

async fn serve(cli: &Cli, origin: Option<&str>, bridge_url: Option<&str>) -> Result<()> {
    let config = match bridge_url {
        Some(url) => BridgeConfig::new(cli.family, url),
        None => BridgeConfig::from_env(cli.family),
    };
    let origin = origin.map(str::to_string).unwrap_or_else(|| config.origin());
    info!(family = %cli.family, %origin, tag = %config.target_tag, "serving bridge requests on stdio");

    let sink = Arc::new(FramedSink::new(origin, tokio::io::stdout()));
    let responder = Responder::new(cli.family, DirectTransport::new(cli.factory()?), sink);
    responder
        .run(spawn_frame_reader(tokio::io::stdin()))
        .await
        .context("Bridge channel failed")
}

async fn accounts(cli: &Cli, page: u32, hd_path: Option<&str>, hrp: Option<&str>) -> Result<()> {
    if page == 0 {
        bail!("Pages are numbered from 1.");
    }
    let backend = Backend::direct(cli.factory()?);
    let records = match cli.family {
        ChainFamily::Evm => {
            if hrp.is_some() {
                bail!("--hrp only applies to the cosmos family.");
            }
            let mut bridge = EvmBridge::new(backend);
            if let Some(raw) = hd_path {
                bridge.set_hd_path(parse_path(raw)?);
            }
            let mut records = bridge.get_first_page().await?;
            for _ in 1..page {
                records = bridge.get_next_page().await?;
            }
            records
        }
        ChainFamily::Cosmos => {
            let mut bridge = CosmosBridge::new(backend);
            if let Some(raw) = hd_path {
                bridge.set_hd_path(parse_path(raw)?)?;
            }
            if let Some(hrp) = hrp {
                bridge.set_hrp(hrp)?;
            }
            let mut records = bridge.get_first_page().await?;
            for _ in 1..page {
                records = bridge.get_next_page().await?;
            }
            records
        }
    };
    print_records(cli, &records)
}

fn print_records(cli: &Cli, records: &[AddressRecord]) -> Result<()> {
    if cli.json {
        println!("{}", serde_json::to_string_pretty(records)?);
        return Ok(());
    }
    for record in records {
        println!("{:>4}  {}  {}", record.index, record.address, record.hd_path);
    }
    Ok(())
}

async fn address(cli: &Cli, raw_path: &str, hrp: Option<&str>) -> Result<()> {
    let path = parse_path(raw_path)?;
    let backend = Backend::direct(cli.factory()?);
    let (address, public_key) = match cli.family {
        ChainFamily::Evm => {
            let mut bridge = EvmBridge::new(backend);
            let address = bridge.unlock(Some(&path)).await?;
            let public_key = bridge.get_public_key(&SignTarget::Path(path.clone())).await?;
            (address, public_key)
        }
        ChainFamily::Cosmos => {
            let mut bridge = CosmosBridge::new(backend);
            if let Some(hrp) = hrp {
                bridge.set_hrp(hrp)?;
            }
            bridge.set_hd_path(path.clone())?;
            let addresses = bridge.unlock().await?;
            let address = addresses
                .into_iter()
                .next()
                .context("Device returned no address")?;
            let public_key = bridge.get_public_key(&path).await?;
            (address, public_key)
        }
    };

    if cli.json {
        let value = serde_json::json!({
            "address": address,
            "publicKey": public_key,
            "hdPath": path,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("Address:    {address}");
        println!("Public key: {public_key}");
        println!("Path:       {path}");
    }
    Ok(())
}

async fn sign_message(cli: &Cli, raw_path: &str, message: &str) -> Result<()> {
    if cli.family != ChainFamily::Evm {
        bail!("Message signing is only supported for the evm family.");
    }
    let path = parse_path(raw_path)?;
    let mut bridge = EvmBridge::new(Backend::direct(cli.factory()?));
    info!("Confirm the message on your Ledger device...");
    let signature = bridge.sign_message(message, &SignTarget::Path(path)).await?;

    if cli.json {
        println!("{}", serde_json::json!({ "signature": signature }));
    } else {
        println!("{signature}");
    }
    Ok(())
}
