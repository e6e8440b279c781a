//! Excel export of the trade report.

use anyhow::{Context, Result};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_xlsxwriter::{Format, Workbook, Worksheet, XlsxError};

use crate::models::TradeRecord;

use super::{PeriodSummary, TradeReport};

const PRICE_FORMAT: &str = "#,##0.00######";
const QTY_FORMAT: &str = "0.00000000";
const PNL_FORMAT: &str = "#,##0.0000;[Red]-#,##0.0000";

fn num(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

/// Render the workbook with sheets Trades, Daily, Weekly, Monthly and Summary.
pub fn render_workbook(trades: &[TradeRecord], report: &TradeReport) -> Result<Vec<u8>> {
    let mut workbook = Workbook::new();

    write_trades(workbook.add_worksheet(), trades).context("Failed to write Trades sheet")?;
    write_periods(workbook.add_worksheet(), "Daily", "Day", &report.daily)
        .context("Failed to write Daily sheet")?;
    write_periods(workbook.add_worksheet(), "Weekly", "ISO Week", &report.weekly)
        .context("Failed to write Weekly sheet")?;
    write_periods(workbook.add_worksheet(), "Monthly", "Month", &report.monthly)
        .context("Failed to write Monthly sheet")?;
    write_summary(workbook.add_worksheet(), report).context("Failed to write Summary sheet")?;

    workbook.save_to_buffer().context("Failed to render workbook")
}

fn write_header(sheet: &mut Worksheet, headers: &[&str]) -> Result<(), XlsxError> {
    let bold = Format::new().set_bold();
    for (col, header) in headers.iter().enumerate() {
        sheet.write_string_with_format(0, col as u16, *header, &bold)?;
    }
    sheet.set_freeze_panes(1, 0)?;
    Ok(())
}

fn write_trades(sheet: &mut Worksheet, trades: &[TradeRecord]) -> Result<(), XlsxError> {
    sheet.set_name("Trades")?;
    write_header(
        sheet,
        &[
            "Timestamp (UTC)",
            "Side",
            "Symbol",
            "Price",
            "Quantity",
            "Notional",
            "Fee",
            "Realized P&L",
            "Net P&L",
            "Note",
            "Order ID",
        ],
    )?;

    let price = Format::new().set_num_format(PRICE_FORMAT);
    let qty = Format::new().set_num_format(QTY_FORMAT);
    let pnl = Format::new().set_num_format(PNL_FORMAT);

    for (i, trade) in trades.iter().enumerate() {
        let row = i as u32 + 1;
        sheet.write_string(row, 0, trade.timestamp.format("%Y-%m-%d %H:%M:%S").to_string())?;
        sheet.write_string(row, 1, trade.side.as_str())?;
        sheet.write_string(row, 2, &trade.symbol)?;
        sheet.write_number_with_format(row, 3, num(trade.price), &price)?;
        sheet.write_number_with_format(row, 4, num(trade.quantity), &qty)?;
        sheet.write_number_with_format(row, 5, num(trade.notional), &price)?;
        sheet.write_number_with_format(row, 6, num(trade.fee), &qty)?;
        sheet.write_number_with_format(row, 7, num(trade.realized_pnl), &pnl)?;
        sheet.write_number_with_format(row, 8, num(trade.net_pnl()), &pnl)?;
        sheet.write_string(row, 9, &trade.note)?;
        sheet.write_string(row, 10, trade.order_id.as_deref().unwrap_or(""))?;
    }

    sheet.autofit();
    Ok(())
}

fn write_periods(
    sheet: &mut Worksheet,
    name: &str,
    label: &str,
    periods: &[PeriodSummary],
) -> Result<(), XlsxError> {
    sheet.set_name(name)?;
    write_header(
        sheet,
        &[label, "Trades", "Buys", "Sells", "Volume", "Realized P&L", "Fees", "Net P&L"],
    )?;

    let price = Format::new().set_num_format(PRICE_FORMAT);
    let pnl = Format::new().set_num_format(PNL_FORMAT);

    for (i, p) in periods.iter().enumerate() {
        let row = i as u32 + 1;
        sheet.write_string(row, 0, &p.period)?;
        sheet.write_number(row, 1, p.trades)?;
        sheet.write_number(row, 2, p.buys)?;
        sheet.write_number(row, 3, p.sells)?;
        sheet.write_number_with_format(row, 4, num(p.volume), &price)?;
        sheet.write_number_with_format(row, 5, num(p.realized_pnl), &pnl)?;
        sheet.write_number_with_format(row, 6, num(p.fees), &pnl)?;
        sheet.write_number_with_format(row, 7, num(p.net_pnl()), &pnl)?;
    }

    sheet.autofit();
    Ok(())
}

enum SummaryValue {
    Money(Decimal),
    Count(u32),
    Ratio(f64),
    Number(f64),
    Text(String),
}

fn write_summary(sheet: &mut Worksheet, report: &TradeReport) -> Result<(), XlsxError> {
    sheet.set_name("Summary")?;
    write_header(sheet, &["Metric", "Value"])?;

    let s = &report.summary;
    let mut rows = vec![
        ("Total Realized P&L".to_string(), SummaryValue::Money(s.total_realized)),
        ("Total Fees".to_string(), SummaryValue::Money(s.total_fees)),
        ("Net P&L".to_string(), SummaryValue::Money(s.net_pnl)),
        ("Total Trades".to_string(), SummaryValue::Count(s.total_trades)),
        ("Active Days".to_string(), SummaryValue::Count(s.active_days)),
        ("Avg P&L per Active Day".to_string(), SummaryValue::Money(s.avg_pnl_per_active_day)),
        ("Closed Scalps".to_string(), SummaryValue::Count(s.scalps)),
        ("Win Rate".to_string(), SummaryValue::Ratio(s.win_rate)),
        ("Daily P&L Std Dev".to_string(), SummaryValue::Number(s.daily_pnl_std_dev)),
    ];
    if let Some((day, value)) = &s.best_day {
        rows.push((format!("Best Day ({})", day), SummaryValue::Money(*value)));
    }
    if let Some((day, value)) = &s.worst_day {
        rows.push((format!("Worst Day ({})", day), SummaryValue::Money(*value)));
    }
    if let (Some(first), Some(last)) = (s.first_trade, s.last_trade) {
        rows.push((
            "Period".to_string(),
            SummaryValue::Text(format!(
                "{} to {}",
                first.format("%Y-%m-%d"),
                last.format("%Y-%m-%d")
            )),
        ));
    }

    let pnl = Format::new().set_num_format(PNL_FORMAT);
    let pct = Format::new().set_num_format("0.0%");

    for (i, (label, value)) in rows.into_iter().enumerate() {
        let row = i as u32 + 1;
        sheet.write_string(row, 0, label)?;
        match value {
            SummaryValue::Money(v) => sheet.write_number_with_format(row, 1, num(v), &pnl)?,
            SummaryValue::Count(v) => sheet.write_number(row, 1, v)?,
            SummaryValue::Ratio(v) => sheet.write_number_with_format(row, 1, v, &pct)?,
            SummaryValue::Number(v) => sheet.write_number(row, 1, v)?,
            SummaryValue::Text(v) => sheet.write_string(row, 1, v)?,
        };
    }

    sheet.autofit();
    Ok(())
}
