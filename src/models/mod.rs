//! Data models for the held position and the trade log.

mod position;
mod trade;

pub use position::Position;
pub use trade::{TradeRecord, TradeSide};
