//! Trade reporting: rollups by day, ISO week and month, exported as a
//! workbook and optionally uploaded to Google Drive.
//!
//! Everything here is derived from the trade log alone, so a report can be
//! regenerated at any time and always yields the same sums.

mod drive;
mod writer;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use statrs::statistics::Statistics;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::models::{TradeRecord, TradeSide};

pub use drive::DriveUploader;
pub use writer::render_workbook;

/// Rollup granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    Day,
    Week,
    Month,
}

impl Period {
    /// Bucket key of a timestamp: `2024-03-07`, `2024-W10`, `2024-03`.
    ///
    /// Weeks use the ISO week-numbering year, so the last days of December can
    /// belong to week 1 of the next year.
    pub fn key(&self, ts: &DateTime<Utc>) -> String {
        match self {
            Period::Day => ts.format("%Y-%m-%d").to_string(),
            Period::Week => {
                let week = ts.iso_week();
                format!("{}-W{:02}", week.year(), week.week())
            }
            Period::Month => ts.format("%Y-%m").to_string(),
        }
    }
}

/// Totals for one bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodSummary {
    pub period: String,
    pub trades: u32,
    pub buys: u32,
    pub sells: u32,
    pub volume: Decimal,
    pub realized_pnl: Decimal,
    pub fees: Decimal,
}

impl PeriodSummary {
    fn empty(period: String) -> Self {
        Self {
            period,
            trades: 0,
            buys: 0,
            sells: 0,
            volume: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            fees: Decimal::ZERO,
        }
    }

    fn add(&mut self, trade: &TradeRecord) {
        self.trades += 1;
        match trade.side {
            TradeSide::Buy => self.buys += 1,
            TradeSide::Sell => self.sells += 1,
        }
        self.volume += trade.notional;
        self.realized_pnl += trade.realized_pnl;
        self.fees += trade.fee;
    }

    pub fn net_pnl(&self) -> Decimal {
        self.realized_pnl - self.fees
    }
}

/// Whole-log statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportSummary {
    pub total_trades: u32,
    pub total_realized: Decimal,
    pub total_fees: Decimal,
    pub net_pnl: Decimal,
    /// Calendar days with at least one trade
    pub active_days: u32,
    pub avg_pnl_per_active_day: Decimal,
    /// Closed scalps (sell executions)
    pub scalps: u32,
    pub winning_scalps: u32,
    pub win_rate: f64,
    pub best_day: Option<(String, Decimal)>,
    pub worst_day: Option<(String, Decimal)>,
    /// Sample standard deviation of realized P&L per active day
    pub daily_pnl_std_dev: f64,
    pub first_trade: Option<DateTime<Utc>>,
    pub last_trade: Option<DateTime<Utc>>,
}

/// Full report derived from the trade log.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeReport {
    pub daily: Vec<PeriodSummary>,
    pub weekly: Vec<PeriodSummary>,
    pub monthly: Vec<PeriodSummary>,
    pub summary: ReportSummary,
}

/// Group trades by `period`, buckets in chronological order.
pub fn rollup(trades: &[TradeRecord], period: Period) -> Vec<PeriodSummary> {
    let mut buckets: BTreeMap<String, PeriodSummary> = BTreeMap::new();
    for trade in trades {
        let key = period.key(&trade.timestamp);
        buckets
            .entry(key.clone())
            .or_insert_with(|| PeriodSummary::empty(key))
            .add(trade);
    }
    buckets.into_values().collect()
}

/// Build every rollup and the summary from the trade log.
pub fn aggregate(trades: &[TradeRecord]) -> TradeReport {
    let daily = rollup(trades, Period::Day);
    let weekly = rollup(trades, Period::Week);
    let monthly = rollup(trades, Period::Month);
    let summary = summarize(trades, &daily);

    TradeReport {
        daily,
        weekly,
        monthly,
        summary,
    }
}

fn summarize(trades: &[TradeRecord], daily: &[PeriodSummary]) -> ReportSummary {
    let total_realized: Decimal = trades.iter().map(|t| t.realized_pnl).sum();
    let total_fees: Decimal = trades.iter().map(|t| t.fee).sum();

    let sells: Vec<&TradeRecord> = trades.iter().filter(|t| t.side == TradeSide::Sell).collect();
    let scalps = sells.len() as u32;
    let winning_scalps = sells.iter().filter(|t| t.realized_pnl > Decimal::ZERO).count() as u32;
    let win_rate = if scalps > 0 {
        winning_scalps as f64 / scalps as f64
    } else {
        0.0
    };

    let active_days = daily.len() as u32;
    let avg_pnl_per_active_day = if active_days > 0 {
        total_realized / Decimal::from(active_days)
    } else {
        Decimal::ZERO
    };

    // Ties keep the earliest day
    let best_day = daily
        .iter()
        .fold(None::<&PeriodSummary>, |best, d| match best {
            Some(b) if b.realized_pnl >= d.realized_pnl => Some(b),
            _ => Some(d),
        })
        .map(|d| (d.period.clone(), d.realized_pnl));
    let worst_day = daily
        .iter()
        .fold(None::<&PeriodSummary>, |worst, d| match worst {
            Some(w) if w.realized_pnl <= d.realized_pnl => Some(w),
            _ => Some(d),
        })
        .map(|d| (d.period.clone(), d.realized_pnl));

    let daily_pnls: Vec<f64> = daily
        .iter()
        .filter_map(|d| d.realized_pnl.to_f64())
        .collect();
    let daily_pnl_std_dev = if daily_pnls.len() > 1 {
        daily_pnls.std_dev()
    } else {
        0.0
    };

    ReportSummary {
        total_trades: trades.len() as u32,
        total_realized,
        total_fees,
        net_pnl: total_realized - total_fees,
        active_days,
        avg_pnl_per_active_day,
        scalps,
        winning_scalps,
        win_rate,
        best_day,
        worst_day,
        daily_pnl_std_dev,
        first_trade: trades.iter().map(|t| t.timestamp).min(),
        last_trade: trades.iter().map(|t| t.timestamp).max(),
    }
}

impl std::fmt::Display for TradeReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = &self.summary;
        writeln!(f, "\n{:=^50}", " TRADE REPORT ")?;
        if let (Some(first), Some(last)) = (s.first_trade, s.last_trade) {
            writeln!(f, "Period: {} to {}", first.format("%Y-%m-%d"), last.format("%Y-%m-%d"))?;
        }
        writeln!(f)?;
        writeln!(f, "Trades:           {} ({} scalps)", s.total_trades, s.scalps)?;
        writeln!(f, "Win Rate:         {:.1}%", s.win_rate * 100.0)?;
        writeln!(f, "Realized P&L:     ${:.4}", s.total_realized)?;
        writeln!(f, "Fees:             ${:.4}", s.total_fees)?;
        writeln!(f, "Net P&L:          ${:.4}", s.net_pnl)?;
        writeln!(f)?;
        writeln!(f, "Active Days:      {}", s.active_days)?;
        writeln!(f, "Avg P&L / Day:    ${:.4}", s.avg_pnl_per_active_day)?;
        writeln!(f, "Daily P&L StdDev: {:.4}", s.daily_pnl_std_dev)?;
        if let Some((day, pnl)) = &s.best_day {
            writeln!(f, "Best Day:         {} (${:.4})", day, pnl)?;
        }
        if let Some((day, pnl)) = &s.worst_day {
            writeln!(f, "Worst Day:        {} (${:.4})", day, pnl)?;
        }
        writeln!(f)?;
        writeln!(f, "--- Weekly ---")?;
        for week in &self.weekly {
            writeln!(
                f,
                "{}  trades {:>4}  realized ${:>10.4}  net ${:>10.4}",
                week.period,
                week.trades,
                week.realized_pnl,
                week.net_pnl()
            )?;
        }
        writeln!(f, "{:=^50}", "")?;
        Ok(())
    }
}

/// Writes the workbook locally and optionally uploads it.
pub struct ReportPublisher {
    path: PathBuf,
    uploader: Option<DriveUploader>,
}

impl ReportPublisher {
    pub fn new(path: impl Into<PathBuf>, uploader: Option<DriveUploader>) -> Self {
        Self {
            path: path.into(),
            uploader,
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Aggregate, write and upload. Returns the aggregated report.
    pub async fn publish(&self, trades: &[TradeRecord]) -> Result<TradeReport> {
        let report = aggregate(trades);
        let bytes = render_workbook(trades, &report)?;

        tokio::fs::write(&self.path, &bytes)
            .await
            .with_context(|| format!("Failed to write report to {}", self.path.display()))?;

        info!(
            path = %self.path.display(),
            trades = report.summary.total_trades,
            realized = %report.summary.total_realized,
            "Report written"
        );

        if let Some(uploader) = &self.uploader {
            let file_name = self
                .path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("trade_report.xlsx");

            match uploader.upload(file_name, bytes).await {
                Ok(file_id) => info!(file_id = %file_id, file = %file_name, "Report uploaded"),
                Err(e) => warn!(error = %e, file = %file_name, "Report upload failed"),
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn at(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).unwrap()
    }

    fn sell(ts: DateTime<Utc>, pnl: Decimal, fee: Decimal) -> TradeRecord {
        let mut trade = TradeRecord::sell("BTCUSDC", dec!(50), dec!(0.5), fee, pnl, "TP", None);
        trade.timestamp = ts;
        trade
    }

    fn buy(ts: DateTime<Utc>) -> TradeRecord {
        let mut trade =
            TradeRecord::buy("BTCUSDC", dec!(50), dec!(0.5), dec!(0.01), "scalp buy", None);
        trade.timestamp = ts;
        trade
    }

    fn sample_log() -> Vec<TradeRecord> {
        vec![
            buy(at(2023, 12, 31, 9)),
            sell(at(2023, 12, 31, 10), dec!(0.25), dec!(0.01)),
            buy(at(2024, 1, 1, 9)),
            sell(at(2024, 1, 1, 11), dec!(-0.15), dec!(0.01)),
            buy(at(2024, 1, 8, 9)),
            sell(at(2024, 1, 8, 9), dec!(0.40), dec!(0.01)),
        ]
    }

    #[test]
    fn test_period_keys() {
        let ts = at(2024, 3, 7, 12);
        assert_eq!(Period::Day.key(&ts), "2024-03-07");
        assert_eq!(Period::Week.key(&ts), "2024-W10");
        assert_eq!(Period::Month.key(&ts), "2024-03");
    }

    #[test]
    fn test_iso_week_crosses_year() {
        // 2024-12-30 is Monday of ISO week 1 of 2025
        assert_eq!(Period::Week.key(&at(2024, 12, 30, 0)), "2025-W01");
        // 2021-01-03 is Sunday of ISO week 53 of 2020
        assert_eq!(Period::Week.key(&at(2021, 1, 3, 0)), "2020-W53");
    }

    #[test]
    fn test_daily_rollup() {
        let daily = rollup(&sample_log(), Period::Day);
        assert_eq!(daily.len(), 3);
        assert_eq!(daily[0].period, "2023-12-31");
        assert_eq!(daily[0].trades, 2);
        assert_eq!(daily[0].buys, 1);
        assert_eq!(daily[0].realized_pnl, dec!(0.25));
        assert_eq!(daily[0].fees, dec!(0.02));
        assert_eq!(daily[0].net_pnl(), dec!(0.23));
        assert_eq!(daily[1].realized_pnl, dec!(-0.15));
    }

    #[test]
    fn test_weekly_and_monthly_rollups() {
        let log = sample_log();

        let weekly = rollup(&log, Period::Week);
        // 2023-12-31 is a Sunday (2023-W52); 2024-01-01 starts 2024-W01
        let keys: Vec<&str> = weekly.iter().map(|w| w.period.as_str()).collect();
        assert_eq!(keys, vec!["2023-W52", "2024-W01", "2024-W02"]);

        let monthly = rollup(&log, Period::Month);
        assert_eq!(monthly.len(), 2);
        assert_eq!(monthly[0].period, "2023-12");
        assert_eq!(monthly[1].period, "2024-01");
        assert_eq!(monthly[1].realized_pnl, dec!(0.25));
        assert_eq!(monthly[1].trades, 4);
    }

    #[test]
    fn test_summary() {
        let report = aggregate(&sample_log());
        let s = &report.summary;

        assert_eq!(s.total_trades, 6);
        assert_eq!(s.total_realized, dec!(0.50));
        assert_eq!(s.total_fees, dec!(0.06));
        assert_eq!(s.net_pnl, dec!(0.44));
        assert_eq!(s.active_days, 3);
        assert_eq!(s.avg_pnl_per_active_day.round_dp(6), dec!(0.166667));
        assert_eq!(s.scalps, 3);
        assert_eq!(s.winning_scalps, 2);
        assert!((s.win_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(s.best_day, Some(("2024-01-08".to_string(), dec!(0.40))));
        assert_eq!(s.worst_day, Some(("2024-01-01".to_string(), dec!(-0.15))));
        assert!(s.daily_pnl_std_dev > 0.0);
        assert_eq!(s.first_trade, Some(at(2023, 12, 31, 9)));
    }

    #[test]
    fn test_aggregate_is_idempotent() {
        let log = sample_log();
        let first = aggregate(&log);
        let second = aggregate(&log);
        assert_eq!(first, second);

        // Order of the log does not change the sums
        let mut reversed = log.clone();
        reversed.reverse();
        let third = aggregate(&reversed);
        assert_eq!(first.daily, third.daily);
        assert_eq!(first.summary.total_realized, third.summary.total_realized);
    }

    #[test]
    fn test_empty_log() {
        let report = aggregate(&[]);
        assert!(report.daily.is_empty());
        assert_eq!(report.summary.active_days, 0);
        assert_eq!(report.summary.avg_pnl_per_active_day, Decimal::ZERO);
        assert_eq!(report.summary.win_rate, 0.0);
        assert!(report.summary.best_day.is_none());
    }

    #[tokio::test]
    async fn test_publish_writes_workbook() {
        let path = std::env::temp_dir()
            .join(format!("scalper-report-{}.xlsx", uuid::Uuid::new_v4()));
        let publisher = ReportPublisher::new(&path, None);

        let report = publisher.publish(&sample_log()).await.unwrap();
        assert_eq!(report.summary.total_trades, 6);

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..2], b"PK");
        let _ = std::fs::remove_file(&path);
    }
}
