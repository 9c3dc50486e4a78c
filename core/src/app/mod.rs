/// Device application layer: APDU sets of the Ethereum and Binance-Chain apps.
pub mod cosmos;
pub mod eth;

pub use cosmos::CosmosSignature;
pub use eth::EvmSignature;
