//! Spot Scalper
//!
//! Scalps a single spot pair with market orders: buys a fixed notional while
//! flat, then sells the whole position on a static take-profit or stop-loss.
//! Position and trade history are persisted; P&L reports roll up by day,
//! ISO week and month.

mod api;
mod bot;
mod db;
mod error;
mod models;
mod report;
mod trading;

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::builder::BoolishValueParser;
use clap::{ArgAction, Args, Parser, Subcommand};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::api::{resolve_symbol, BinanceClient};
use crate::bot::{Scalper, ScalperStats};
use crate::db::{Database, StateStore};
use crate::report::{DriveUploader, ReportPublisher};
use crate::trading::{ConfigError, ScalperConfig};

/// Single-asset spot scalper CLI.
#[derive(Parser)]
#[command(name = "scalper")]
#[command(
    about = "Scalp a single spot pair with static take-profit / stop-loss",
    long_about = None
)]
struct Cli {
    /// Database URL
    #[arg(short, long, env = "DATABASE_URL", default_value = "sqlite:./scalper.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the scalping loop
    Run(TradingArgs),

    /// Show persisted position, session and trade totals
    Status,

    /// Build the P&L report from the trade log
    Report {
        /// Output workbook path
        #[arg(short, long, env = "REPORT_PATH", default_value = "trade_report.xlsx")]
        output: String,

        /// Upload the workbook to Google Drive
        #[arg(long)]
        upload: bool,
    },

    /// Show the effective configuration
    Config(TradingArgs),
}

/// Trading settings, each overridable from the environment.
#[derive(Args, Debug, Clone)]
struct TradingArgs {
    /// Trading pair
    #[arg(long, env = "SYMBOL", default_value = "BTCUSDC")]
    symbol: String,

    /// Pair used when the primary one is not tradable (empty to disable)
    #[arg(long, env = "FALLBACK_SYMBOL", default_value = "BTCUSD")]
    fallback_symbol: String,

    /// Maximum quote notional committed to the position
    #[arg(long, env = "CAPITAL_CEILING", default_value = "100")]
    capital_ceiling: Decimal,

    /// Quote notional per buy order
    #[arg(long, env = "BUDGET_USDC", default_value = "10")]
    budget: Decimal,

    /// Take-profit percentage above entry
    #[arg(long, env = "TP_PCT", default_value = "0.5")]
    tp_pct: Decimal,

    /// Stop-loss percentage below entry
    #[arg(long, env = "SL_PCT", default_value = "0.3")]
    sl_pct: Decimal,

    /// Place real orders (LIVE=1/0, true/false, yes/no)
    #[arg(
        long,
        env = "LIVE",
        action = ArgAction::SetTrue,
        value_parser = BoolishValueParser::new()
    )]
    live: bool,

    /// Polling interval in seconds
    #[arg(short, long, env = "POLL_INTERVAL_SECS", default_value = "30")]
    interval: u64,

    /// Seconds between report exports
    #[arg(long, env = "REPORT_INTERVAL_SECS", default_value = "3600")]
    report_interval: u64,

    /// Report workbook path
    #[arg(long, env = "REPORT_PATH", default_value = "trade_report.xlsx")]
    report_path: String,

    /// Fee percentage applied to simulated fills
    #[arg(long, env = "SIM_FEE_PCT", default_value = "0.1")]
    sim_fee_pct: Decimal,
}

impl TradingArgs {
    fn into_config(self) -> Result<ScalperConfig, ConfigError> {
        let fallback = self.fallback_symbol.trim().to_uppercase();
        let config = ScalperConfig {
            symbol: self.symbol.trim().to_uppercase(),
            fallback_symbol: (!fallback.is_empty()).then_some(fallback),
            capital_ceiling: self.capital_ceiling,
            order_notional: self.budget,
            take_profit_pct: self.tp_pct / dec!(100),
            stop_loss_pct: self.sl_pct / dec!(100),
            live: self.live,
            poll_interval_secs: self.interval,
            report_interval_secs: self.report_interval,
            report_path: self.report_path,
            sim_fee_rate: self.sim_fee_pct / dec!(100),
        };
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run(args) => {
            let config = args.into_config().context("Invalid configuration")?;

            let client = BinanceClient::from_env(config.live, config.sim_fee_rate)
                .context("Invalid Binance settings")?;
            let candidates = config.symbol_candidates();
            let rules = resolve_symbol(&client, &candidates)
                .await
                .context("Failed to load symbol rules")?
                .ok_or_else(|| ConfigError::NoTradableSymbol(candidates.join(", ")))?;

            info!(
                symbol = %rules.symbol,
                step_size = %rules.filter.step_size,
                min_qty = %rules.filter.min_qty,
                min_notional = %rules.filter.min_notional,
                "Symbol selected"
            );

            let db = Arc::new(Database::new(&cli.database).await?);
            let uploader = DriveUploader::from_env().context("Invalid Google Drive settings")?;
            let uploads = uploader.is_some();
            let publisher = ReportPublisher::new(&config.report_path, uploader);

            println!("\n=== Spot Scalper ===");
            println!("Symbol:           {}", rules.symbol);
            println!("Capital ceiling:  ${}", config.capital_ceiling);
            println!("Order notional:   ${}", config.order_notional);
            println!("Take profit:      {}%", config.take_profit_pct * dec!(100));
            println!("Stop loss:        {}%", config.stop_loss_pct * dec!(100));
            println!("Polling interval: {}s", config.poll_interval_secs);
            let mode = if config.live {
                "LIVE TRADING"
            } else {
                "SIMULATED (no real orders)"
            };
            println!("Mode: {}", mode);
            let upload_note = if uploads { " (+ Google Drive)" } else { "" };
            println!("Report: {}{}", config.report_path, upload_note);
            println!("\nPress Ctrl+C to stop.\n");

            let venue = Arc::new(client);
            let mut bot = Scalper::new(config, rules, venue, db.clone(), Some(publisher)).await?;
            let result = bot.run().await;

            let stats = ScalperStats::load(&db).await?;
            println!("\n{}", stats);

            result?;
        }

        Commands::Status => {
            let db = Database::new(&cli.database).await?;
            if db.get_bot_state().await?.is_none() {
                println!("No scalper session found. Run 'scalper run' to start.");
                return Ok(());
            }

            let stats = ScalperStats::load(&db).await?;
            println!("\n{}", stats);
        }

        Commands::Report { output, upload } => {
            let db = Database::new(&cli.database).await?;
            let uploader = if upload {
                let uploader = DriveUploader::from_env()
                    .context("Invalid Google Drive settings")?
                    .ok_or_else(|| {
                        anyhow!("GDRIVE_SA_JSON and GDRIVE_FOLDER_ID must be set to upload")
                    })?;
                Some(uploader)
            } else {
                None
            };

            let trades = db.trades().await?;
            let publisher = ReportPublisher::new(&output, uploader);
            let report = publisher.publish(&trades).await?;

            println!("{}", report);
            println!("Written to {}", output);
        }

        Commands::Config(args) => {
            let config = args.into_config().context("Invalid configuration")?;
            let has_keys = std::env::var("BINANCE_API_KEY").is_ok()
                && std::env::var("BINANCE_API_SECRET").is_ok();
            let has_drive = std::env::var("GDRIVE_SA_JSON").is_ok()
                && std::env::var("GDRIVE_FOLDER_ID").is_ok();

            println!("\n=== Scalper Configuration ===\n");
            println!("Market:");
            println!("  Symbol:               {}", config.symbol);
            let fallback = config.fallback_symbol.as_deref().unwrap_or("-");
            let tld = std::env::var("BINANCE_TLD").unwrap_or_else(|_| "com".to_string());
            println!("  Fallback Symbol:      {}", fallback);
            println!("  Exchange:             api.binance.{}", tld);
            println!("  Mode:                 {}", if config.live { "LIVE" } else { "SIMULATED" });
            println!("  API Keys:             {}", if has_keys { "set" } else { "not set" });

            println!("\nSizing:");
            println!("  Capital Ceiling:      ${}", config.capital_ceiling);
            println!("  Order Notional:       ${}", config.order_notional);
            println!("  Simulated Fee:        {}%", config.sim_fee_rate * dec!(100));

            println!("\nExit Rules:");
            println!("  Take Profit:          {}%", config.take_profit_pct * dec!(100));
            println!("  Stop Loss:            {}%", config.stop_loss_pct * dec!(100));

            println!("\nScheduling:");
            println!("  Poll Interval:        {}s", config.poll_interval_secs);
            println!("  Report Interval:      {}s", config.report_interval_secs);
            println!("  Report Path:          {}", config.report_path);
            println!("  Drive Upload:         {}", if has_drive { "enabled" } else { "disabled" });
            println!("  Database:             {}", cli.database);

            if config.live && !has_keys {
                println!(
                    "\nWarning: LIVE is set but BINANCE_API_KEY / BINANCE_API_SECRET are missing."
                );
            }
        }
    }

    Ok(())
}
