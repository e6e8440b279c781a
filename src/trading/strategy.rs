//! Scalping rules: entry intents and take-profit / stop-loss exits.

use rust_decimal::Decimal;
use tracing::{debug, warn};

use super::position_sizer::{compute_order_quantity, LotFilter};
use super::ScalperConfig;

/// Reason for closing the position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
}

impl ExitReason {
    /// Tag written to the trade log.
    pub fn note(&self) -> &'static str {
        match self {
            ExitReason::TakeProfit => "TP",
            ExitReason::StopLoss => "SL",
        }
    }
}

/// Price thresholds guarding the open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitLevels {
    pub take_profit: Decimal,
    pub stop_loss: Decimal,
}

/// Buy decided for this cycle; lives only until the cycle ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderIntent {
    pub target_price: Decimal,
    pub quantity: Decimal,
    pub levels: ExitLevels,
}

/// Static-threshold scalping strategy.
#[derive(Debug, Clone)]
pub struct Strategy {
    take_profit_pct: Decimal,
    stop_loss_pct: Decimal,
    order_notional: Decimal,
    capital_ceiling: Decimal,
}

impl Strategy {
    pub fn new(config: &ScalperConfig) -> Self {
        Self {
            take_profit_pct: config.take_profit_pct,
            stop_loss_pct: config.stop_loss_pct,
            order_notional: config.order_notional,
            capital_ceiling: config.capital_ceiling,
        }
    }

    /// Thresholds around an entry price.
    pub fn exit_levels(&self, entry_price: Decimal) -> ExitLevels {
        ExitLevels {
            take_profit: entry_price * (Decimal::ONE + self.take_profit_pct),
            stop_loss: entry_price * (Decimal::ONE - self.stop_loss_pct),
        }
    }

    /// Decide the next buy, or `None` when no capital (or too little) is left.
    pub fn entry_intent(
        &self,
        price: Decimal,
        used_capital: Decimal,
        filter: &LotFilter,
    ) -> Option<OrderIntent> {
        let quantity = compute_order_quantity(
            price,
            used_capital,
            self.capital_ceiling,
            self.order_notional,
            filter,
        );

        if quantity.is_zero() {
            debug!(
                price = %price,
                used_capital = %used_capital,
                ceiling = %self.capital_ceiling,
                "No tradable quantity for entry"
            );
            return None;
        }

        Some(OrderIntent {
            target_price: price,
            quantity,
            levels: self.exit_levels(price),
        })
    }

    /// Check whether the current price crosses an exit threshold.
    ///
    /// Take-profit is evaluated first, so a price that satisfies both
    /// thresholds (only possible after a gap) exits as take-profit.
    pub fn check_exit(&self, price: Decimal, levels: &ExitLevels) -> Option<ExitReason> {
        if price >= levels.take_profit {
            debug!(price = %price, target = %levels.take_profit, "Take profit triggered");
            return Some(ExitReason::TakeProfit);
        }

        if price <= levels.stop_loss {
            warn!(price = %price, stop = %levels.stop_loss, "Stop loss triggered");
            return Some(ExitReason::StopLoss);
        }

        None
    }
}
