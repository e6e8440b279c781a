//! Scalper runner: the decision loop with persisted state.
//!
//! Each cycle fetches the price and, depending on the phase, either sizes and
//! submits an entry or checks the take-profit / stop-loss thresholds of the
//! open position. The ledger is only touched after the venue confirms a fill,
//! and the new position is persisted together with its trade record before
//! the in-memory state moves on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use rust_decimal::Decimal;
use tokio::sync::Notify;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::api::{OrderFill, SymbolRules, Venue, VenueError};
use crate::db::{Database, StateStore};
use crate::error::CycleError;
use crate::models::{Position, TradeRecord, TradeSide};
use crate::report::ReportPublisher;
use crate::trading::{ExitLevels, ExitReason, LotFilter, PositionLedger, ScalperConfig, Strategy};

const ENTRY_NOTE: &str = "scalp buy";

/// Where the loop stands in the scalp cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Flat,
    Entering,
    Holding(ExitLevels),
    Exiting(ExitReason),
}

/// Result of one completed cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Bought {
        price: Decimal,
        quantity: Decimal,
        levels: ExitLevels,
    },
    Sold {
        price: Decimal,
        quantity: Decimal,
        realized_pnl: Decimal,
        reason: ExitReason,
    },
    /// Holding, price inside the thresholds
    Held { price: Decimal },
    /// Flat, no tradable quantity this cycle
    Skipped { price: Decimal },
}

/// Cooperative stop flag shared with the signal handler.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl ShutdownSignal {
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    async fn wait(&self) {
        if self.is_triggered() {
            return;
        }
        self.notify.notified().await;
    }
}

/// Main scalper runner.
pub struct Scalper {
    config: ScalperConfig,
    symbol: String,
    filter: LotFilter,
    venue: Arc<dyn Venue>,
    store: Arc<dyn StateStore>,
    ledger: PositionLedger,
    strategy: Strategy,
    phase: Phase,
    publisher: Option<ReportPublisher>,
    shutdown: ShutdownSignal,
}

impl Scalper {
    /// Create a scalper for the resolved symbol, restoring any persisted position.
    pub async fn new(
        config: ScalperConfig,
        rules: SymbolRules,
        venue: Arc<dyn Venue>,
        store: Arc<dyn StateStore>,
        publisher: Option<ReportPublisher>,
    ) -> Result<Self> {
        let strategy = Strategy::new(&config);
        let saved = store
            .load_position()
            .await
            .context("Failed to load persisted position")?;

        let position = match saved {
            Some(saved) if !saved.position.is_flat() && saved.symbol != rules.symbol => {
                bail!(
                    "Persisted position is in {} but the scalper is configured for {}; \
                     close it out or point DATABASE_URL at a fresh database",
                    saved.symbol,
                    rules.symbol
                );
            }
            Some(saved) => saved.position,
            None => Position::default(),
        };

        let ledger = PositionLedger::new(
            position,
            config.capital_ceiling,
            rules.filter.dust_epsilon(),
        );

        let phase = if ledger.position().is_flat() {
            Phase::Flat
        } else {
            let pos = ledger.position();
            let levels = strategy.exit_levels(pos.average_cost);
            info!(
                quantity = %pos.quantity,
                average_cost = %pos.average_cost,
                used_capital = %pos.used_capital,
                take_profit = %levels.take_profit,
                stop_loss = %levels.stop_loss,
                "Resuming open position"
            );
            Phase::Holding(levels)
        };

        Ok(Self {
            config,
            symbol: rules.symbol,
            filter: rules.filter,
            venue,
            store,
            ledger,
            strategy,
            phase,
            publisher,
            shutdown: ShutdownSignal::default(),
        })
    }

    /// Get shutdown signal for external control.
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn position(&self) -> &Position {
        self.ledger.position()
    }

    /// Run until a stop signal, then flush the report and mark the session stopped.
    pub async fn run(&mut self) -> Result<()> {
        info!(
            symbol = %self.symbol,
            live = self.venue.is_live(),
            poll_interval = self.config.poll_interval_secs,
            ceiling = %self.config.capital_ceiling,
            notional = %self.config.order_notional,
            "Starting scalper loop"
        );

        self.store
            .start_session(&self.symbol, self.venue.is_live())
            .await
            .context("Failed to record session start")?;

        let signal = self.shutdown.clone();
        tokio::spawn(async move {
            wait_for_stop_signal().await;
            info!("Shutdown signal received");
            signal.trigger();
        });

        let mut poll_interval = interval(Duration::from_secs(self.config.poll_interval_secs));
        poll_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let report_every = Duration::from_secs(self.config.report_interval_secs);
        let mut last_report = Instant::now();
        let mut result = Ok(());

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.wait() => break,
                _ = poll_interval.tick() => {}
            }

            match self.tick().await {
                Ok(outcome) => self.log_outcome(&outcome),
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "Fatal error, stopping");
                    result = Err(anyhow!(e));
                    break;
                }
                Err(e) => warn!(error = %e, phase = ?self.phase, "Cycle aborted"),
            }

            if let Err(e) = self.store.heartbeat().await {
                error!(error = %e, "Failed to persist heartbeat, stopping");
                result = Err(e);
                break;
            }

            if last_report.elapsed() >= report_every {
                self.publish_report().await;
                last_report = Instant::now();
            }
        }

        self.shutdown().await?;
        result
    }

    /// Single decision cycle.
    pub async fn tick(&mut self) -> Result<CycleOutcome, CycleError> {
        let price = self.venue.get_price(&self.symbol).await?;
        debug!(price = %price, phase = ?self.phase, "Scalper tick");

        match self.phase {
            Phase::Holding(levels) => self.try_exit(price, levels).await,
            _ => self.try_enter(price).await,
        }
    }

    async fn try_enter(&mut self, price: Decimal) -> Result<CycleOutcome, CycleError> {
        let used_capital = self.ledger.position().used_capital;
        let Some(intent) = self.strategy.entry_intent(price, used_capital, &self.filter) else {
            return Ok(CycleOutcome::Skipped { price });
        };

        debug!(
            target_price = %intent.target_price,
            quantity = %intent.quantity,
            take_profit = %intent.levels.take_profit,
            stop_loss = %intent.levels.stop_loss,
            "Submitting entry"
        );

        self.phase = Phase::Entering;
        let fill = match self.submit(TradeSide::Buy, intent.quantity).await {
            Ok(fill) => fill,
            Err(e) => {
                self.phase = Phase::Flat;
                return Err(e.into());
            }
        };

        let mut ledger = self.ledger.clone();
        ledger.apply_buy(fill.fill_price, fill.filled_quantity);
        let trade = TradeRecord::buy(
            &self.symbol,
            fill.fill_price,
            fill.filled_quantity,
            fill.fee,
            ENTRY_NOTE,
            fill.order_id.clone(),
        );
        self.commit(ledger, &trade).await?;

        let levels = self.strategy.exit_levels(fill.fill_price);
        self.phase = Phase::Holding(levels);

        Ok(CycleOutcome::Bought {
            price: fill.fill_price,
            quantity: fill.filled_quantity,
            levels,
        })
    }

    async fn try_exit(
        &mut self,
        price: Decimal,
        levels: ExitLevels,
    ) -> Result<CycleOutcome, CycleError> {
        let Some(reason) = self.strategy.check_exit(price, &levels) else {
            return Ok(CycleOutcome::Held { price });
        };

        let quantity = self.filter.round_down(self.ledger.position().quantity);
        if quantity.is_zero() || quantity < self.filter.min_sellable() {
            warn!(
                held = %self.ledger.position().quantity,
                min_sellable = %self.filter.min_sellable(),
                "Held quantity below venue minimum, cannot exit"
            );
            return Ok(CycleOutcome::Held { price });
        }

        self.phase = Phase::Exiting(reason);
        let fill = match self.submit(TradeSide::Sell, quantity).await {
            Ok(fill) => fill,
            Err(e) => {
                self.phase = Phase::Holding(levels);
                return Err(e.into());
            }
        };

        let mut ledger = self.ledger.clone();
        let realized_pnl = ledger.apply_sell(fill.fill_price, fill.filled_quantity);
        let dust = ledger.write_off_dust(self.filter.min_sellable());
        if !dust.is_zero() {
            debug!(dust = %dust, "Writing off unsellable remainder");
        }
        let trade = TradeRecord::sell(
            &self.symbol,
            fill.fill_price,
            fill.filled_quantity,
            fill.fee,
            realized_pnl,
            reason.note(),
            fill.order_id.clone(),
        );
        self.commit(ledger, &trade).await?;

        self.phase = if self.ledger.position().is_flat() {
            Phase::Flat
        } else {
            warn!(
                remaining = %self.ledger.position().quantity,
                "Exit partially filled, still holding"
            );
            Phase::Holding(levels)
        };

        Ok(CycleOutcome::Sold {
            price: fill.fill_price,
            quantity: fill.filled_quantity,
            realized_pnl,
            reason,
        })
    }

    /// Submit a market order and require a confirmed fill.
    async fn submit(&self, side: TradeSide, quantity: Decimal) -> Result<OrderFill, VenueError> {
        let fill = self
            .venue
            .submit_market_order(&self.symbol, side, quantity)
            .await?;

        if !fill.is_confirmed() {
            return Err(VenueError::Rejected(format!(
                "{} {} not filled ({:?})",
                side, quantity, fill.status
            )));
        }
        Ok(fill)
    }

    /// Persist the mutated ledger with its trade record, then adopt it.
    async fn commit(
        &mut self,
        ledger: PositionLedger,
        trade: &TradeRecord,
    ) -> Result<(), CycleError> {
        if let Err(e) = self.store.commit_fill(ledger.position(), trade).await {
            error!(
                side = %trade.side,
                price = %trade.price,
                quantity = %trade.quantity,
                order_id = ?trade.order_id,
                "Executed fill could not be persisted"
            );
            return Err(CycleError::Persistence(e));
        }
        self.ledger = ledger;
        Ok(())
    }

    fn log_outcome(&self, outcome: &CycleOutcome) {
        let pos = self.ledger.position();
        match outcome {
            CycleOutcome::Bought {
                price,
                quantity,
                levels,
            } => info!(
                symbol = %self.symbol,
                price = %price,
                quantity = %quantity,
                take_profit = %levels.take_profit,
                stop_loss = %levels.stop_loss,
                used_capital = %pos.used_capital,
                "Bought"
            ),
            CycleOutcome::Sold {
                price,
                quantity,
                realized_pnl,
                reason,
            } => info!(
                symbol = %self.symbol,
                price = %price,
                quantity = %quantity,
                realized_pnl = %realized_pnl,
                reason = reason.note(),
                "Sold"
            ),
            CycleOutcome::Held { price } => info!(
                price = %price,
                market_value = %pos.market_value(*price),
                unrealized_pnl = %pos.unrealized_pnl(*price),
                "Holding"
            ),
            CycleOutcome::Skipped { price } => info!(
                price = %price,
                used_capital = %pos.used_capital,
                ceiling = %self.ledger.capital_ceiling(),
                "No entry this cycle"
            ),
        }
    }

    /// Regenerate the report from the trade log. Failures are only logged.
    pub async fn publish_report(&self) {
        let Some(publisher) = &self.publisher else {
            return;
        };

        let trades = match self.store.trades().await {
            Ok(trades) => trades,
            Err(e) => {
                warn!(error = %e, "Failed to read trade log for report");
                return;
            }
        };

        if let Err(e) = publisher.publish(&trades).await {
            warn!(error = %e, path = %publisher.path().display(), "Report generation failed");
        }
    }

    /// Graceful shutdown.
    async fn shutdown(&self) -> Result<()> {
        info!("Shutting down scalper...");

        self.publish_report().await;
        self.store.mark_stopped().await?;

        let pos = self.ledger.position();
        info!(
            quantity = %pos.quantity,
            average_cost = %pos.average_cost,
            used_capital = %pos.used_capital,
            "Scalper shutdown complete"
        );
        Ok(())
    }
}

async fn wait_for_stop_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

/// Persisted session and trade-log statistics.
#[derive(Debug, Clone)]
pub struct ScalperStats {
    pub symbol: Option<String>,
    pub live: bool,
    pub is_running: bool,
    pub started_at: Option<String>,
    pub last_poll_at: Option<String>,
    pub position: Position,
    pub total_trades: usize,
    pub scalps: usize,
    pub realized_pnl: Decimal,
    pub fees: Decimal,
}

impl ScalperStats {
    pub async fn load(db: &Database) -> Result<Self> {
        let state = db.get_bot_state().await?;
        let position = db
            .load_position()
            .await?
            .map(|saved| saved.position)
            .unwrap_or_default();
        let trades = db.trades().await?;

        Ok(Self {
            symbol: state.as_ref().map(|s| s.symbol.clone()),
            live: state.as_ref().map(|s| s.live).unwrap_or(false),
            is_running: state.as_ref().map(|s| s.is_running).unwrap_or(false),
            started_at: state.as_ref().map(|s| s.started_at.clone()),
            last_poll_at: state.and_then(|s| s.last_poll_at),
            position,
            total_trades: trades.len(),
            scalps: trades.iter().filter(|t| t.side == TradeSide::Sell).count(),
            realized_pnl: trades.iter().map(|t| t.realized_pnl).sum(),
            fees: trades.iter().map(|t| t.fee).sum(),
        })
    }
}

impl std::fmt::Display for ScalperStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Scalper Status ===")?;
        writeln!(f, "Symbol:          {}", self.symbol.as_deref().unwrap_or("-"))?;
        writeln!(
            f,
            "Status:          {} {}",
            if self.is_running { "Running" } else { "Stopped" },
            if self.live { "(Live)" } else { "(Simulated)" }
        )?;
        writeln!(f, "Started:         {}", self.started_at.as_deref().unwrap_or("-"))?;
        writeln!(f, "Last Poll:       {}", self.last_poll_at.as_deref().unwrap_or("-"))?;
        writeln!(f, "Held Quantity:   {}", self.position.quantity)?;
        writeln!(f, "Average Cost:    ${:.2}", self.position.average_cost)?;
        writeln!(f, "Used Capital:    ${:.2}", self.position.used_capital)?;
        writeln!(f, "Trades:          {} ({} scalps)", self.total_trades, self.scalps)?;
        writeln!(f, "Realized P&L:    ${:.4}", self.realized_pnl)?;
        writeln!(f, "Fees:            ${:.4}", self.fees)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{FillStatus, VenueResult};
    use crate::db::SavedPosition;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Venue double fed with a script of prices.
    struct ScriptedVenue {
        prices: Mutex<VecDeque<Decimal>>,
        last_price: Mutex<Option<Decimal>>,
        reject_orders: AtomicBool,
        orders: Mutex<Vec<(TradeSide, Decimal)>>,
        /// Base quantity the venue keeps as commission on each buy
        buy_fee_qty: Mutex<Decimal>,
        /// Triggered while an order is in flight
        stop_on_order: Mutex<Option<ShutdownSignal>>,
    }

    impl ScriptedVenue {
        fn new(prices: &[Decimal]) -> Arc<Self> {
            Arc::new(Self {
                prices: Mutex::new(prices.iter().copied().collect()),
                last_price: Mutex::new(None),
                reject_orders: AtomicBool::new(false),
                orders: Mutex::new(Vec::new()),
                buy_fee_qty: Mutex::new(Decimal::ZERO),
                stop_on_order: Mutex::new(None),
            })
        }

        fn charge_base_fee(&self, quantity: Decimal) {
            *self.buy_fee_qty.lock().unwrap() = quantity;
        }

        fn stop_during_order(&self, signal: ShutdownSignal) {
            *self.stop_on_order.lock().unwrap() = Some(signal);
        }

        fn push_price(&self, price: Decimal) {
            self.prices.lock().unwrap().push_back(price);
        }

        fn set_reject(&self, reject: bool) {
            self.reject_orders.store(reject, Ordering::SeqCst);
        }

        fn orders(&self) -> Vec<(TradeSide, Decimal)> {
            self.orders.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Venue for ScriptedVenue {
        async fn get_price(&self, _symbol: &str) -> VenueResult<Decimal> {
            let next = self.prices.lock().unwrap().pop_front();
            match next {
                Some(price) => {
                    *self.last_price.lock().unwrap() = Some(price);
                    Ok(price)
                }
                None => Err(VenueError::Network("no price scripted".into())),
            }
        }

        async fn submit_market_order(
            &self,
            _symbol: &str,
            side: TradeSide,
            quantity: Decimal,
        ) -> VenueResult<OrderFill> {
            if self.reject_orders.load(Ordering::SeqCst) {
                return Err(VenueError::Rejected("insufficient balance".into()));
            }
            let price = self
                .last_price
                .lock()
                .unwrap()
                .ok_or_else(|| VenueError::Rejected("no market".into()))?;
            self.orders.lock().unwrap().push((side, quantity));
            if let Some(signal) = self.stop_on_order.lock().unwrap().as_ref() {
                signal.trigger();
            }

            let fee_qty = match side {
                TradeSide::Buy => *self.buy_fee_qty.lock().unwrap(),
                TradeSide::Sell => Decimal::ZERO,
            };
            Ok(OrderFill {
                status: FillStatus::Simulated,
                fill_price: price,
                filled_quantity: quantity - fee_qty,
                fee: fee_qty * price,
                order_id: None,
            })
        }

        async fn symbol_rules(&self, symbol: &str) -> VenueResult<Option<SymbolRules>> {
            Ok(Some(rules(symbol)))
        }

        fn is_live(&self) -> bool {
            false
        }
    }

    /// Store whose writes always fail.
    struct BrokenStore;

    #[async_trait]
    impl StateStore for BrokenStore {
        async fn load_position(&self) -> Result<Option<SavedPosition>> {
            Ok(None)
        }
        async fn commit_fill(&self, _position: &Position, _trade: &TradeRecord) -> Result<()> {
            Err(anyhow!("disk I/O error"))
        }
        async fn trades(&self) -> Result<Vec<TradeRecord>> {
            Ok(Vec::new())
        }
        async fn start_session(&self, _symbol: &str, _live: bool) -> Result<()> {
            Ok(())
        }
        async fn heartbeat(&self) -> Result<()> {
            Ok(())
        }
        async fn mark_stopped(&self) -> Result<()> {
            Ok(())
        }
    }

    fn rules(symbol: &str) -> SymbolRules {
        SymbolRules {
            symbol: symbol.to_string(),
            status: "TRADING".to_string(),
            base_asset: "BTC".to_string(),
            quote_asset: "USDC".to_string(),
            spot_allowed: true,
            filter: LotFilter {
                step_size: dec!(0.00001),
                min_qty: dec!(0.00001),
                min_notional: Decimal::ZERO,
            },
        }
    }

    fn config() -> ScalperConfig {
        ScalperConfig {
            capital_ceiling: dec!(100),
            order_notional: dec!(25),
            take_profit_pct: dec!(0.005),
            stop_loss_pct: dec!(0.003),
            ..Default::default()
        }
    }

    async fn scalper(venue: Arc<ScriptedVenue>, db: Arc<Database>) -> Scalper {
        Scalper::new(config(), rules("BTCUSDC"), venue, db, None)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_take_profit_round_trip() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let venue = ScriptedVenue::new(&[dec!(50), dec!(50.1), dec!(50.5)]);
        let mut bot = scalper(venue.clone(), db.clone()).await;

        let outcome = bot.tick().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Bought { quantity, .. } if quantity == dec!(0.5)));
        assert_eq!(bot.position().used_capital, dec!(25));
        assert_eq!(
            bot.phase(),
            Phase::Holding(ExitLevels {
                take_profit: dec!(50.25),
                stop_loss: dec!(49.85),
            })
        );

        assert_eq!(bot.tick().await.unwrap(), CycleOutcome::Held { price: dec!(50.1) });

        let outcome = bot.tick().await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Sold {
                price: dec!(50.5),
                quantity: dec!(0.5),
                realized_pnl: dec!(0.25),
                reason: ExitReason::TakeProfit,
            }
        );
        assert_eq!(bot.phase(), Phase::Flat);
        assert!(bot.position().is_flat());
        assert_eq!(bot.position().used_capital, Decimal::ZERO);

        let trades = db.trades().await.unwrap();
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[0].note, "scalp buy");
        assert_eq!(trades[1].note, "TP");
        assert_eq!(trades[1].realized_pnl, dec!(0.25));
        assert!(db.load_position().await.unwrap().unwrap().position.is_flat());
    }

    #[tokio::test]
    async fn test_stop_loss_round_trip() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let venue = ScriptedVenue::new(&[dec!(50), dec!(49.5)]);
        let mut bot = scalper(venue, db.clone()).await;

        bot.tick().await.unwrap();
        let outcome = bot.tick().await.unwrap();

        match outcome {
            CycleOutcome::Sold {
                realized_pnl,
                reason,
                ..
            } => {
                assert_eq!(reason, ExitReason::StopLoss);
                assert_eq!(realized_pnl, dec!(-0.25));
            }
            other => panic!("expected sell, got {:?}", other),
        }

        let trades = db.trades().await.unwrap();
        assert_eq!(trades[1].note, "SL");
        assert!(bot.position().is_flat());
    }

    #[tokio::test]
    async fn test_rejected_buy_stays_flat() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let venue = ScriptedVenue::new(&[dec!(50)]);
        venue.set_reject(true);
        let mut bot = scalper(venue, db.clone()).await;

        let err = bot.tick().await.unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(bot.phase(), Phase::Flat);
        assert!(bot.position().is_flat());
        assert!(db.trades().await.unwrap().is_empty());
        assert!(db.load_position().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_price_failure_is_recoverable() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let venue = ScriptedVenue::new(&[]);
        let mut bot = scalper(venue.clone(), db).await;

        let err = bot.tick().await.unwrap_err();
        assert!(matches!(err, CycleError::Venue(VenueError::Network(_))));
        assert!(!err.is_fatal());

        venue.push_price(dec!(50));
        assert!(matches!(bot.tick().await.unwrap(), CycleOutcome::Bought { .. }));
    }

    #[tokio::test]
    async fn test_failed_sell_keeps_holding() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let venue = ScriptedVenue::new(&[dec!(50), dec!(50.5), dec!(50.6)]);
        let mut bot = scalper(venue.clone(), db.clone()).await;

        bot.tick().await.unwrap();

        venue.set_reject(true);
        assert!(bot.tick().await.is_err());
        assert!(matches!(bot.phase(), Phase::Holding(_)));
        assert_eq!(bot.position().quantity, dec!(0.5));
        assert_eq!(db.trades().await.unwrap().len(), 1);

        venue.set_reject(false);
        let outcome = bot.tick().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Sold { reason: ExitReason::TakeProfit, .. }));
        assert_eq!(venue.orders().len(), 2);
    }

    #[tokio::test]
    async fn test_skip_when_below_min_notional() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let venue = ScriptedVenue::new(&[dec!(50)]);
        let mut symbol_rules = rules("BTCUSDC");
        symbol_rules.filter.min_notional = dec!(30);

        let mut bot = Scalper::new(config(), symbol_rules, venue.clone(), db, None)
            .await
            .unwrap();

        assert_eq!(bot.tick().await.unwrap(), CycleOutcome::Skipped { price: dec!(50) });
        assert_eq!(bot.phase(), Phase::Flat);
        assert!(venue.orders().is_empty());
    }

    #[tokio::test]
    async fn test_persistence_failure_is_fatal() {
        let venue = ScriptedVenue::new(&[dec!(50)]);
        let store = Arc::new(BrokenStore);
        let mut bot = Scalper::new(config(), rules("BTCUSDC"), venue, store, None)
            .await
            .unwrap();

        let err = bot.tick().await.unwrap_err();
        assert!(err.is_fatal());
        // In-memory state never runs ahead of the store
        assert!(bot.position().is_flat());
    }

    #[tokio::test]
    async fn test_restart_resumes_holding() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        {
            let venue = ScriptedVenue::new(&[dec!(50)]);
            let mut bot = scalper(venue, db.clone()).await;
            bot.tick().await.unwrap();
        }

        let venue = ScriptedVenue::new(&[dec!(50.3)]);
        let mut bot = scalper(venue, db.clone()).await;
        assert_eq!(bot.position().quantity, dec!(0.5));
        assert_eq!(bot.position().average_cost, dec!(50));
        assert_eq!(
            bot.phase(),
            Phase::Holding(ExitLevels {
                take_profit: dec!(50.25),
                stop_loss: dec!(49.85),
            })
        );

        let outcome = bot.tick().await.unwrap();
        assert!(matches!(outcome, CycleOutcome::Sold { reason: ExitReason::TakeProfit, .. }));
        assert_eq!(db.trades().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_ceiling_never_exceeded_over_many_scalps() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let mut prices = Vec::new();
        for i in 0..10 {
            let base = dec!(50) + Decimal::from(i);
            prices.push(base);
            prices.push(base * dec!(1.01));
        }
        let venue = ScriptedVenue::new(&prices);
        let mut bot = scalper(venue.clone(), db.clone()).await;

        for _ in 0..prices.len() {
            bot.tick().await.unwrap();
            assert!(bot.position().used_capital <= dec!(100));
        }

        assert_eq!(venue.orders().len(), 20);
        assert!(bot.position().is_flat());
        assert_eq!(db.trades().await.unwrap().len(), 20);
    }

    #[tokio::test]
    async fn test_run_stops_on_signal() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let venue = ScriptedVenue::new(&[dec!(50)]);
        let mut bot = scalper(venue, db.clone()).await;

        bot.shutdown_signal().trigger();
        bot.run().await.unwrap();

        let state = db.get_bot_state().await.unwrap().unwrap();
        assert_eq!(state.symbol, "BTCUSDC");
        assert!(!state.is_running);
    }

    #[tokio::test]
    async fn test_stats_from_database() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let venue = ScriptedVenue::new(&[dec!(50), dec!(50.5)]);
        let mut bot = scalper(venue, db.clone()).await;
        bot.tick().await.unwrap();
        bot.tick().await.unwrap();

        let stats = ScalperStats::load(&db).await.unwrap();
        assert_eq!(stats.total_trades, 2);
        assert_eq!(stats.scalps, 1);
        assert_eq!(stats.realized_pnl, dec!(0.25));
        assert!(stats.position.is_flat());
        assert!(stats.to_string().contains("Scalper Status"));
    }

    #[tokio::test]
    async fn test_base_asset_fee_round_trip_closes_flat() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let venue = ScriptedVenue::new(&[dec!(50), dec!(50.5)]);
        venue.charge_base_fee(dec!(0.000005));
        let mut bot = scalper(venue.clone(), db.clone()).await;

        let outcome = bot.tick().await.unwrap();
        assert!(matches!(
            outcome,
            CycleOutcome::Bought { quantity, .. } if quantity == dec!(0.499995)
        ));
        assert_eq!(bot.position().quantity, dec!(0.499995));

        // Sell rounds down to the step; the 0.000005 remainder cannot be sold
        let outcome = bot.tick().await.unwrap();
        assert_eq!(
            outcome,
            CycleOutcome::Sold {
                price: dec!(50.5),
                quantity: dec!(0.49999),
                realized_pnl: dec!(0.249995),
                reason: ExitReason::TakeProfit,
            }
        );
        assert_eq!(bot.phase(), Phase::Flat);
        assert!(bot.position().is_flat());
        assert_eq!(bot.position().used_capital, Decimal::ZERO);

        let trades = db.trades().await.unwrap();
        assert_eq!(trades[0].quantity, dec!(0.499995));
        assert_eq!(trades[0].fee, dec!(0.00025));
        assert!(db.load_position().await.unwrap().unwrap().position.is_flat());
    }

    #[tokio::test]
    async fn test_refuses_position_held_in_another_symbol() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        {
            let venue = ScriptedVenue::new(&[dec!(50)]);
            let mut bot = Scalper::new(config(), rules("ETHUSDC"), venue, db.clone(), None)
                .await
                .unwrap();
            bot.tick().await.unwrap();
        }

        let venue = ScriptedVenue::new(&[]);
        let err = match Scalper::new(config(), rules("BTCUSDC"), venue, db.clone(), None).await {
            Ok(_) => panic!("resumed a position held in another symbol"),
            Err(e) => e.to_string(),
        };
        assert!(err.contains("ETHUSDC"));
        assert!(err.contains("BTCUSDC"));

        // Same symbol still resumes
        let venue = ScriptedVenue::new(&[]);
        let bot = Scalper::new(config(), rules("ETHUSDC"), venue, db, None)
            .await
            .unwrap();
        assert_eq!(bot.position().quantity, dec!(0.5));
    }

    #[tokio::test]
    async fn test_flat_position_in_another_symbol_is_ignored() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        {
            let venue = ScriptedVenue::new(&[dec!(50), dec!(50.5)]);
            let mut bot = Scalper::new(config(), rules("ETHUSDC"), venue, db.clone(), None)
                .await
                .unwrap();
            bot.tick().await.unwrap();
            bot.tick().await.unwrap();
        }

        let venue = ScriptedVenue::new(&[]);
        let bot = scalper(venue, db).await;
        assert_eq!(bot.phase(), Phase::Flat);
    }

    #[tokio::test]
    async fn test_shutdown_during_order_commits_fill() {
        let db = Arc::new(Database::in_memory().await.unwrap());
        let venue = ScriptedVenue::new(&[dec!(50)]);
        let path = std::env::temp_dir()
            .join(format!("scalper-shutdown-{}.xlsx", uuid::Uuid::new_v4()));
        let publisher = ReportPublisher::new(&path, None);
        let mut bot = Scalper::new(
            config(),
            rules("BTCUSDC"),
            venue.clone(),
            db.clone(),
            Some(publisher),
        )
        .await
        .unwrap();
        venue.stop_during_order(bot.shutdown_signal());

        bot.run().await.unwrap();

        assert_eq!(venue.orders(), vec![(TradeSide::Buy, dec!(0.5))]);
        assert_eq!(db.trades().await.unwrap().len(), 1);

        let saved = db.load_position().await.unwrap().unwrap();
        assert_eq!(saved.symbol, "BTCUSDC");
        assert_eq!(saved.position.quantity, dec!(0.5));
        assert_eq!(saved.position.average_cost, dec!(50));

        let state = db.get_bot_state().await.unwrap().unwrap();
        assert!(!state.is_running);
        assert!(path.exists());
        let _ = std::fs::remove_file(&path);
    }
}
