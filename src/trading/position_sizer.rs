//! Order sizing: turns a notional budget and the remaining capital allowance
//! into a venue-valid base-asset quantity.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Venue lot constraints for one symbol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LotFilter {
    /// Quantity increment; zero means any precision is accepted
    pub step_size: Decimal,

    /// Smallest tradable quantity
    pub min_qty: Decimal,

    /// Smallest accepted order notional
    pub min_notional: Decimal,
}

impl LotFilter {
    /// Floor a quantity to the step size.
    pub fn round_down(&self, quantity: Decimal) -> Decimal {
        if quantity <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        if self.step_size.is_zero() {
            return quantity;
        }
        ((quantity / self.step_size).floor() * self.step_size).normalize()
    }

    /// Smallest quantity a sell order can carry; anything below is dust.
    pub fn min_sellable(&self) -> Decimal {
        self.min_qty.max(self.step_size)
    }

    /// Tolerance under which a remaining quantity counts as zero.
    pub fn dust_epsilon(&self) -> Decimal {
        let unit = if self.min_qty > Decimal::ZERO {
            self.min_qty
        } else {
            Decimal::ONE
        };
        unit * Decimal::new(1, 8)
    }
}

/// Compute the quantity for the next buy.
///
/// Returns zero when no capital is left, when the price is not positive, or
/// when the floored quantity falls below the venue minimums. Zero tells the
/// caller to skip the cycle.
pub fn compute_order_quantity(
    price: Decimal,
    used_capital: Decimal,
    capital_ceiling: Decimal,
    target_notional: Decimal,
    filter: &LotFilter,
) -> Decimal {
    if price <= Decimal::ZERO {
        return Decimal::ZERO;
    }

    let remaining = (capital_ceiling - used_capital).max(Decimal::ZERO);
    let effective = target_notional.min(remaining);
    if effective <= Decimal::ZERO {
        return Decimal::ZERO;
    }

    let quantity = filter.round_down(effective / price);

    if quantity.is_zero() || quantity < filter.min_qty {
        return Decimal::ZERO;
    }
    if quantity * price < filter.min_notional {
        return Decimal::ZERO;
    }

    quantity
}
