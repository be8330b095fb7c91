use std::fmt;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use thiserror::Error;

use crate::trade::Side;

/// Scale of every derived average.
pub const AVERAGE_SCALE: u32 = 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AggregationError {
    #[error("{0} overflow while applying trade")]
    Overflow(&'static str),
}

/// Running totals for one aggregation key.
///
/// Cumulative fields only grow through [`add_buy`](Self::add_buy) and
/// [`add_sell`](Self::add_sell). A failed update leaves the stats untouched.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct AggregationStats {
    total_buy_qty: i64,
    total_buy_notional: Decimal,
    total_sell_qty: i64,
    total_sell_notional: Decimal,
    last_updated_ns: u64,
}

impl AggregationStats {
    pub fn new(created_ns: u64) -> Self {
        Self {
            last_updated_ns: created_ns,
            ..Self::default()
        }
    }

    pub fn add_buy(
        &mut self,
        quantity: i64,
        price: Decimal,
        now_ns: u64,
    ) -> Result<(), AggregationError> {
        let (qty, notional) =
            accumulate(self.total_buy_qty, self.total_buy_notional, quantity, price)?;
        self.total_buy_qty = qty;
        self.total_buy_notional = notional;
        self.last_updated_ns = now_ns;
        Ok(())
    }

    pub fn add_sell(
        &mut self,
        quantity: i64,
        price: Decimal,
        now_ns: u64,
    ) -> Result<(), AggregationError> {
        let (qty, notional) =
            accumulate(self.total_sell_qty, self.total_sell_notional, quantity, price)?;
        self.total_sell_qty = qty;
        self.total_sell_notional = notional;
        self.last_updated_ns = now_ns;
        Ok(())
    }

    /// Applies a trade by side. Returns `false` without touching anything when
    /// the side is unknown.
    pub fn apply(
        &mut self,
        side: Option<Side>,
        quantity: i64,
        price: Decimal,
        now_ns: u64,
    ) -> Result<bool, AggregationError> {
        match side {
            Some(Side::Buy) => self.add_buy(quantity, price, now_ns).map(|_| true),
            Some(Side::Sell) => self.add_sell(quantity, price, now_ns).map(|_| true),
            None => Ok(false),
        }
    }

    pub fn total_buy_qty(&self) -> i64 {
        self.total_buy_qty
    }

    pub fn total_buy_notional(&self) -> Decimal {
        self.total_buy_notional
    }

    pub fn total_sell_qty(&self) -> i64 {
        self.total_sell_qty
    }

    pub fn total_sell_notional(&self) -> Decimal {
        self.total_sell_notional
    }

    pub fn last_updated_ns(&self) -> u64 {
        self.last_updated_ns
    }

    pub fn avg_buy_price(&self) -> Decimal {
        average(self.total_buy_notional, self.total_buy_qty)
    }

    pub fn avg_sell_price(&self) -> Decimal {
        average(self.total_sell_notional, self.total_sell_qty)
    }

    pub fn net_qty(&self) -> i64 {
        self.total_buy_qty.saturating_sub(self.total_sell_qty)
    }

    pub fn net_notional(&self) -> Decimal {
        self.total_buy_notional
            .saturating_sub(self.total_sell_notional)
    }

    pub fn net_average_price(&self) -> Decimal {
        average(self.net_notional(), self.net_qty())
    }
}

fn accumulate(
    qty: i64,
    notional: Decimal,
    quantity: i64,
    price: Decimal,
) -> Result<(i64, Decimal), AggregationError> {
    let qty = qty
        .checked_add(quantity)
        .ok_or(AggregationError::Overflow("quantity"))?;
    let notional = price
        .checked_mul(Decimal::from(quantity))
        .and_then(|trade_notional| notional.checked_add(trade_notional))
        .ok_or(AggregationError::Overflow("notional"))?;
    Ok((qty, notional))
}

/// `numerator / denominator` rounded half-up to [`AVERAGE_SCALE`] places, or
/// zero when the denominator is zero.
fn average(numerator: Decimal, denominator: i64) -> Decimal {
    if denominator == 0 {
        return Decimal::ZERO;
    }
    match numerator.checked_div(Decimal::from(denominator)) {
        Some(quotient) => {
            let mut rounded = quotient
                .round_dp_with_strategy(AVERAGE_SCALE, RoundingStrategy::MidpointAwayFromZero);
            rounded.rescale(AVERAGE_SCALE);
            rounded
        }
        None => Decimal::ZERO,
    }
}

impl fmt::Display for AggregationStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "buy_qty={} buy_notional={} avg_buy={} sell_qty={} sell_notional={} avg_sell={} \
             net_qty={} net_notional={} net_avg={} last_updated_ns={}",
            self.total_buy_qty,
            self.total_buy_notional,
            self.avg_buy_price(),
            self.total_sell_qty,
            self.total_sell_notional,
            self.avg_sell_price(),
            self.net_qty(),
            self.net_notional(),
            self.net_average_price(),
            self.last_updated_ns
        )
    }
}

/// Decimals serialize as strings so consumers never see float rounding.
impl Serialize for AggregationStats {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("AggregationStats", 10)?;
        state.serialize_field("total_buy_qty", &self.total_buy_qty)?;
        state.serialize_field("total_buy_notional", &self.total_buy_notional.to_string())?;
        state.serialize_field("avg_buy_price", &self.avg_buy_price().to_string())?;
        state.serialize_field("total_sell_qty", &self.total_sell_qty)?;
        state.serialize_field("total_sell_notional", &self.total_sell_notional.to_string())?;
        state.serialize_field("avg_sell_price", &self.avg_sell_price().to_string())?;
        state.serialize_field("net_qty", &self.net_qty())?;
        state.serialize_field("net_notional", &self.net_notional().to_string())?;
        state.serialize_field("net_avg_price", &self.net_average_price().to_string())?;
        state.serialize_field("last_updated_ns", &self.last_updated_ns)?;
        state.end()
    }
}
