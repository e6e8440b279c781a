//! Exchange access: the venue abstraction and the Binance spot adapter.

mod binance_client;
mod types;
mod venue;

pub use binance_client::BinanceClient;
pub use venue::{resolve_symbol, FillStatus, OrderFill, SymbolRules, Venue, VenueError, VenueResult};
