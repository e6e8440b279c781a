//! Position model: the single open holding of the traded asset.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Singleton position in the base asset.
///
/// `quantity == 0` implies `average_cost == 0` and `used_capital == 0`; the
/// ledger restores that after every full close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// Base-asset quantity currently held
    pub quantity: Decimal,

    /// Weighted-average acquisition price of `quantity`
    pub average_cost: Decimal,

    /// Quote notional committed to the position, capped by the capital ceiling
    pub used_capital: Decimal,

    /// Last time the position was mutated
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl Default for Position {
    fn default() -> Self {
        Self::flat()
    }
}

impl Position {
    /// All-zero position.
    pub fn flat() -> Self {
        Self {
            quantity: Decimal::ZERO,
            average_cost: Decimal::ZERO,
            used_capital: Decimal::ZERO,
            updated_at: Utc::now(),
        }
    }

    /// True when nothing is held.
    pub fn is_flat(&self) -> bool {
        self.quantity.is_zero()
    }

    /// Mark-to-market P&L of the held quantity.
    pub fn unrealized_pnl(&self, current_price: Decimal) -> Decimal {
        (current_price - self.average_cost) * self.quantity
    }

    /// Market value of the held quantity.
    pub fn market_value(&self, current_price: Decimal) -> Decimal {
        self.quantity * current_price
    }
}
