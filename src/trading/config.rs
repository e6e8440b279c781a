//! Scalper configuration.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration rejected at startup.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid {name}: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error("Missing required setting {0}")]
    Missing(&'static str),

    #[error("No tradable symbol among {0}")]
    NoTradableSymbol(String),
}

/// Configuration for the scalping loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalperConfig {
    /// Trading pair to scalp
    pub symbol: String,

    /// Pair to fall back to if `symbol` is not spot-tradable on the venue
    pub fallback_symbol: Option<String>,

    /// Maximum quote notional committed to the open position
    pub capital_ceiling: Decimal,

    /// Target quote notional per buy order
    pub order_notional: Decimal,

    /// Take-profit distance above entry (0.005 = 0.5%)
    pub take_profit_pct: Decimal,

    /// Stop-loss distance below entry (0.003 = 0.3%)
    pub stop_loss_pct: Decimal,

    /// Submit real orders instead of simulated fills
    pub live: bool,

    /// Seconds between decision cycles
    pub poll_interval_secs: u64,

    /// Seconds between report exports
    pub report_interval_secs: u64,

    /// Where the report workbook is written
    pub report_path: String,

    /// Fee rate applied to simulated fills (0.001 = 0.1%)
    pub sim_fee_rate: Decimal,
}

impl Default for ScalperConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDC".to_string(),
            fallback_symbol: Some("BTCUSD".to_string()),
            capital_ceiling: dec!(100),
            order_notional: dec!(10),
            take_profit_pct: dec!(0.005), // 0.5%
            stop_loss_pct: dec!(0.003),   // 0.3%
            live: false,
            poll_interval_secs: 30,
            report_interval_secs: 3600,
            report_path: "trade_report.xlsx".to_string(),
            sim_fee_rate: dec!(0.001), // 0.1%
        }
    }
}

impl ScalperConfig {
    /// Candidate symbols in preference order.
    pub fn symbol_candidates(&self) -> Vec<String> {
        let mut symbols = vec![self.symbol.clone()];
        if let Some(fallback) = &self.fallback_symbol {
            if !fallback.is_empty() && fallback != &self.symbol {
                symbols.push(fallback.clone());
            }
        }
        symbols
    }

    /// Reject settings the loop cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.symbol.trim().is_empty() {
            return Err(ConfigError::Missing("SYMBOL"));
        }
        if self.capital_ceiling <= Decimal::ZERO {
            return Err(invalid("CAPITAL_CEILING", "must be positive"));
        }
        if self.order_notional <= Decimal::ZERO {
            return Err(invalid("BUDGET_USDC", "must be positive"));
        }
        if self.take_profit_pct <= Decimal::ZERO || self.take_profit_pct >= Decimal::ONE {
            return Err(invalid("TP_PCT", "must be between 0 and 100 percent"));
        }
        if self.stop_loss_pct <= Decimal::ZERO || self.stop_loss_pct >= Decimal::ONE {
            return Err(invalid("SL_PCT", "must be between 0 and 100 percent"));
        }
        if self.sim_fee_rate < Decimal::ZERO || self.sim_fee_rate >= Decimal::ONE {
            return Err(invalid("SIM_FEE_PCT", "must be between 0 and 100 percent"));
        }
        if self.poll_interval_secs == 0 {
            return Err(invalid("POLL_INTERVAL_SECS", "must be at least 1"));
        }
        if self.report_interval_secs == 0 {
            return Err(invalid("REPORT_INTERVAL_SECS", "must be at least 1"));
        }
        if self.report_path.trim().is_empty() {
            return Err(ConfigError::Missing("REPORT_PATH"));
        }
        Ok(())
    }
}

fn invalid(name: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        name,
        reason: reason.to_string(),
    }
}
