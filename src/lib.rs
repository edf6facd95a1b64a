pub mod config;
pub mod error;
pub mod harvest;
pub mod intake;
pub mod ledger;
pub mod listing;
pub mod order;
pub mod principal;
pub mod provenance;
pub mod service;
pub mod storage;
pub mod telemetry;
pub mod units;
pub mod utils;

pub use error::{ErrorKind, MarketError, MarketResult};
pub use service::MarketService;
