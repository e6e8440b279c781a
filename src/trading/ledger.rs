//! Position ledger: weighted-average cost basis and capital accounting.
//!
//! The ledger owns the in-memory [`Position`]. It never fails: inputs are
//! validated by the caller, and overshoots are clamped rather than rejected.
//! Persisting the result is the caller's job.

use chrono::Utc;
use rust_decimal::Decimal;

use crate::models::Position;

/// Ledger over the singleton position.
#[derive(Debug, Clone)]
pub struct PositionLedger {
    position: Position,
    capital_ceiling: Decimal,
    epsilon: Decimal,
}

impl PositionLedger {
    /// Create a ledger from a loaded (or flat) position.
    ///
    /// `epsilon` is the tolerance under which the held quantity counts as zero.
    pub fn new(position: Position, capital_ceiling: Decimal, epsilon: Decimal) -> Self {
        Self {
            position,
            capital_ceiling,
            epsilon,
        }
    }

    pub fn position(&self) -> &Position {
        &self.position
    }

    pub fn capital_ceiling(&self) -> Decimal {
        self.capital_ceiling
    }

    /// Add a filled buy to the position.
    pub fn apply_buy(&mut self, price: Decimal, quantity: Decimal) {
        if quantity <= Decimal::ZERO {
            return;
        }

        let pos = &mut self.position;
        let new_qty = pos.quantity + quantity;
        pos.average_cost = (pos.quantity * pos.average_cost + quantity * price) / new_qty;
        pos.quantity = new_qty;
        pos.used_capital = (pos.used_capital + price * quantity).min(self.capital_ceiling);
        pos.updated_at = Utc::now();
    }

    /// Remove a filled sell from the position and return the realized P&L.
    ///
    /// Selling more than is held is clamped to the held quantity. Capital is
    /// only freed on a full close; a partial close keeps `used_capital`.
    pub fn apply_sell(&mut self, price: Decimal, quantity: Decimal) -> Decimal {
        let pos = &mut self.position;
        let quantity = quantity.min(pos.quantity);
        if quantity <= Decimal::ZERO {
            return Decimal::ZERO;
        }

        let realized = (price - pos.average_cost) * quantity;
        pos.quantity -= quantity;

        if pos.quantity <= self.epsilon {
            pos.quantity = Decimal::ZERO;
            pos.average_cost = Decimal::ZERO;
            pos.used_capital = Decimal::ZERO;
        }
        pos.updated_at = Utc::now();

        realized
    }

    /// Close out a remainder smaller than `min_sellable`.
    ///
    /// Such a remainder can never be sold, so keeping it would hold the
    /// position open forever. Returns the quantity written off.
    pub fn write_off_dust(&mut self, min_sellable: Decimal) -> Decimal {
        let pos = &mut self.position;
        if pos.quantity.is_zero() || pos.quantity >= min_sellable {
            return Decimal::ZERO;
        }

        let dust = pos.quantity;
        pos.quantity = Decimal::ZERO;
        pos.average_cost = Decimal::ZERO;
        pos.used_capital = Decimal::ZERO;
        pos.updated_at = Utc::now();
        dust
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ledger(ceiling: Decimal) -> PositionLedger {
        PositionLedger::new(Position::flat(), ceiling, dec!(0.0000000001))
    }

    #[test]
    fn test_single_buy() {
        let mut ledger = ledger(dec!(100));
        ledger.apply_buy(dec!(50), dec!(0.5));

        let pos = ledger.position();
        assert_eq!(pos.quantity, dec!(0.5));
        assert_eq!(pos.average_cost, dec!(50));
        assert_eq!(pos.used_capital, dec!(25));
    }

    #[test]
    fn test_averaging_in() {
        let mut ledger = ledger(dec!(100));
        ledger.apply_buy(dec!(50), dec!(0.5));
        ledger.apply_buy(dec!(60), dec!(0.5));

        let pos = ledger.position();
        assert_eq!(pos.quantity, dec!(1.0));
        // (0.5*50 + 0.5*60) / 1.0
        assert_eq!(pos.average_cost, dec!(55));
        assert_eq!(pos.used_capital, dec!(55));
    }

    #[test]
    fn test_weighted_average_over_many_buys() {
        let fills = [
            (dec!(101.25), dec!(0.3)),
            (dec!(99.80), dec!(0.125)),
            (dec!(100.40), dec!(0.75)),
            (dec!(98.10), dec!(0.02)),
        ];
        let mut ledger = ledger(dec!(1000000));

        for (price, qty) in fills {
            ledger.apply_buy(price, qty);
        }

        let total_qty: Decimal = fills.iter().map(|(_, q)| *q).sum();
        let total_cost: Decimal = fills.iter().map(|(p, q)| p * q).sum();
        let expected = total_cost / total_qty;
        let diff = (ledger.position().average_cost - expected).abs();
        let average = ledger.position().average_cost;
        assert!(diff < dec!(0.0000000001), "average {} != {}", average, expected);
        assert_eq!(ledger.position().quantity, total_qty);
    }

    #[test]
    fn test_used_capital_clamped_to_ceiling() {
        let mut ledger = ledger(dec!(100));
        for _ in 0..5 {
            ledger.apply_buy(dec!(50), dec!(0.5));
            assert!(ledger.position().used_capital <= dec!(100));
        }
        assert_eq!(ledger.position().used_capital, dec!(100));
        assert_eq!(ledger.position().quantity, dec!(2.5));
    }

    #[test]
    fn test_full_close_resets() {
        let mut ledger = ledger(dec!(100));
        ledger.apply_buy(dec!(50), dec!(0.5));

        let realized = ledger.apply_sell(dec!(50.5), dec!(0.5));
        assert_eq!(realized, dec!(0.25));

        let pos = ledger.position();
        assert!(pos.is_flat());
        assert_eq!(pos.average_cost, Decimal::ZERO);
        assert_eq!(pos.used_capital, Decimal::ZERO);
    }

    #[test]
    fn test_partial_close_keeps_capital() {
        let mut ledger = ledger(dec!(100));
        ledger.apply_buy(dec!(50), dec!(1));

        let realized = ledger.apply_sell(dec!(48), dec!(0.4));
        assert_eq!(realized, dec!(-0.8));

        let pos = ledger.position();
        assert_eq!(pos.quantity, dec!(0.6));
        assert_eq!(pos.average_cost, dec!(50));
        assert_eq!(pos.used_capital, dec!(50));
    }

    #[test]
    fn test_oversell_is_clamped() {
        let mut ledger = ledger(dec!(100));
        ledger.apply_buy(dec!(50), dec!(0.5));

        let realized = ledger.apply_sell(dec!(52), dec!(2));
        // Only the held 0.5 is sold
        assert_eq!(realized, dec!(1));
        assert_eq!(ledger.position().quantity, Decimal::ZERO);
        assert_eq!(ledger.position().used_capital, Decimal::ZERO);
    }

    #[test]
    fn test_sell_when_flat_is_noop() {
        let mut ledger = ledger(dec!(100));
        assert_eq!(ledger.apply_sell(dec!(50), dec!(1)), Decimal::ZERO);
        assert!(ledger.position().is_flat());
    }

    #[test]
    fn test_dust_counts_as_closed() {
        let mut ledger = PositionLedger::new(Position::flat(), dec!(100), dec!(0.0000001));
        ledger.apply_buy(dec!(50), dec!(0.50000005));
        ledger.apply_sell(dec!(50), dec!(0.5));

        assert!(ledger.position().is_flat());
        assert_eq!(ledger.position().used_capital, Decimal::ZERO);
    }

    #[test]
    fn test_write_off_unsellable_remainder() {
        let mut ledger = ledger(dec!(100));
        ledger.apply_buy(dec!(50), dec!(0.499995));
        ledger.apply_sell(dec!(50.5), dec!(0.49999));
        assert_eq!(ledger.position().quantity, dec!(0.000005));

        let dust = ledger.write_off_dust(dec!(0.00001));
        assert_eq!(dust, dec!(0.000005));
        assert!(ledger.position().is_flat());
        assert_eq!(ledger.position().used_capital, Decimal::ZERO);
    }

    #[test]
    fn test_write_off_keeps_sellable_remainder() {
        let mut ledger = ledger(dec!(100));
        ledger.apply_buy(dec!(50), dec!(1));
        ledger.apply_sell(dec!(50), dec!(0.4));

        assert_eq!(ledger.write_off_dust(dec!(0.00001)), Decimal::ZERO);
        assert_eq!(ledger.position().quantity, dec!(0.6));
        assert_eq!(ledger.position().used_capital, dec!(50));
    }
}
