//! Trade record model: one immutable entry per confirmed execution.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "BUY" => Some(TradeSide::Buy),
            "SELL" => Some(TradeSide::Sell),
            _ => None,
        }
    }
}

impl std::fmt::Display for TradeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Executed trade as written to the append-only trade log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    /// Unique record identifier
    pub id: String,

    /// When the execution was confirmed
    pub timestamp: DateTime<Utc>,

    pub side: TradeSide,

    /// Trading pair (e.g., "BTCUSDC")
    pub symbol: String,

    /// Fill price in quote currency
    pub price: Decimal,

    /// Filled base-asset quantity
    pub quantity: Decimal,

    /// price × quantity
    pub notional: Decimal,

    /// Fee charged by the venue
    #[serde(default)]
    pub fee: Decimal,

    /// Realized P&L, always zero for buys
    #[serde(default)]
    pub realized_pnl: Decimal,

    /// Free-text tag ("scalp buy", "TP", "SL")
    #[serde(default)]
    pub note: String,

    /// Venue order id, if the venue returned one
    #[serde(default)]
    pub order_id: Option<String>,
}

impl TradeRecord {
    /// Build a buy record. Realized P&L is zero by definition.
    pub fn buy(
        symbol: &str,
        price: Decimal,
        quantity: Decimal,
        fee: Decimal,
        note: impl Into<String>,
        order_id: Option<String>,
    ) -> Self {
        Self::new(TradeSide::Buy, symbol, price, quantity, fee, Decimal::ZERO, note, order_id)
    }

    /// Build a sell record carrying the realized P&L of the closed quantity.
    pub fn sell(
        symbol: &str,
        price: Decimal,
        quantity: Decimal,
        fee: Decimal,
        realized_pnl: Decimal,
        note: impl Into<String>,
        order_id: Option<String>,
    ) -> Self {
        Self::new(TradeSide::Sell, symbol, price, quantity, fee, realized_pnl, note, order_id)
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        side: TradeSide,
        symbol: &str,
        price: Decimal,
        quantity: Decimal,
        fee: Decimal,
        realized_pnl: Decimal,
        note: impl Into<String>,
        order_id: Option<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            side,
            symbol: symbol.to_string(),
            price,
            quantity,
            notional: price * quantity,
            fee,
            realized_pnl,
            note: note.into(),
            order_id,
        }
    }

    /// Realized P&L after fees.
    pub fn net_pnl(&self) -> Decimal {
        self.realized_pnl - self.fee
    }
}
