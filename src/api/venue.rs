//! Venue abstraction: price feed and market-order execution.
//!
//! The decision loop only talks to a [`Venue`], so the exchange adapter can be
//! swapped for a simulated one or a test double.

use async_trait::async_trait;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::models::TradeSide;
use crate::trading::LotFilter;

/// Errors from the venue. None of them imply a state change.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VenueError {
    /// Connection failure or timeout
    #[error("Network error: {0}")]
    Network(String),

    /// Request weight or order rate exceeded
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// The venue refused the order or request
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Response could not be decoded
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Operation requires credentials that are not configured
    #[error("Not configured: {0}")]
    NotConfigured(String),
}

impl VenueError {
    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, VenueError::Network(_) | VenueError::RateLimited(_))
    }
}

pub type VenueResult<T> = Result<T, VenueError>;

/// Trading rules of a symbol as published by the venue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolRules {
    pub symbol: String,
    pub status: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub spot_allowed: bool,
    pub filter: LotFilter,
}

impl SymbolRules {
    /// Whether spot market orders can be placed right now.
    pub fn is_tradable(&self) -> bool {
        self.spot_allowed && self.status == "TRADING"
    }
}

/// Fill status reported for a submitted order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillStatus {
    Filled,
    PartiallyFilled,
    Simulated,
    Unfilled,
}

/// Result of a submitted market order.
///
/// `filled_quantity` is the base quantity the account actually gained (buy) or
/// gave up (sell), and `fee` is expressed in the quote asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderFill {
    pub status: FillStatus,
    pub fill_price: Decimal,
    pub filled_quantity: Decimal,
    pub fee: Decimal,
    pub order_id: Option<String>,
}

impl OrderFill {
    /// A fill authorizes a ledger update only if something was executed.
    pub fn is_confirmed(&self) -> bool {
        self.status != FillStatus::Unfilled
            && self.filled_quantity > Decimal::ZERO
            && self.fill_price > Decimal::ZERO
    }
}

/// Price feed and order execution for spot symbols.
#[async_trait]
pub trait Venue: Send + Sync {
    /// Latest traded price.
    async fn get_price(&self, symbol: &str) -> VenueResult<Decimal>;

    /// Submit a market order for `quantity` base units.
    async fn submit_market_order(
        &self,
        symbol: &str,
        side: TradeSide,
        quantity: Decimal,
    ) -> VenueResult<OrderFill>;

    /// Trading rules, or `None` if the venue does not list the symbol.
    async fn symbol_rules(&self, symbol: &str) -> VenueResult<Option<SymbolRules>>;

    /// Whether orders hit the real market.
    fn is_live(&self) -> bool;
}

/// Pick the first candidate the venue allows spot trading on.
pub async fn resolve_symbol(
    venue: &dyn Venue,
    candidates: &[String],
) -> VenueResult<Option<SymbolRules>> {
    for symbol in candidates {
        match venue.symbol_rules(symbol).await? {
            Some(rules) if rules.is_tradable() => return Ok(Some(rules)),
            Some(rules) => {
                tracing::warn!(
                    symbol = %symbol,
                    status = %rules.status,
                    spot_allowed = rules.spot_allowed,
                    "Symbol not tradable"
                );
            }
            None => tracing::warn!(symbol = %symbol, "Symbol not listed"),
        }
    }
    Ok(None)
}
