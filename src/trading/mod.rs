//! Trading logic: order sizing, position ledger, scalping rules.

mod config;
mod ledger;
mod position_sizer;
mod strategy;

pub use config::{ConfigError, ScalperConfig};
pub use ledger::PositionLedger;
pub use position_sizer::LotFilter;
pub use strategy::{ExitLevels, ExitReason, Strategy};
