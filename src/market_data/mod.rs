pub mod candle;
pub mod datastore;

pub use candle::{Candle1m, Candle15m};
pub use datastore::{Ages, DataStore, FundingSnapshot, OpenInterestSnapshot, PriceTick, SymbolState};
