//! Pure grid math shared by all strategy variants.

use crate::constants::SHIFT_UP_MARGIN;

/// Buy prices still needed to grow the ladder to `target` orders.
///
/// Each new level sits one interval below the lowest existing level (open
/// orders first, then levels planned in this call), so recomputing on every
/// tick reproduces the same ladder instead of drifting it. A level that
/// would land above the current price is re-clamped to one interval below
/// the current price.
pub fn replenish_levels(
    interval: f64,
    current_price: f64,
    open_buy_prices: &[f64],
    target: usize,
) -> Vec<f64> {
    let mut lowest = open_buy_prices
        .iter()
        .copied()
        .fold(f64::INFINITY, f64::min);
    let mut levels = Vec::new();

    while open_buy_prices.len() + levels.len() < target {
        let anchor = if lowest.is_finite() {
            lowest
        } else {
            current_price
        };
        let mut price = anchor / (1.0 + interval);
        if price > current_price {
            price = current_price / (1.0 + interval);
        }
        levels.push(price);
        lowest = price;
    }
    levels
}

/// Price above which the buy ladder is considered too far below the market.
pub fn shift_up_threshold(highest_buy: f64, interval: f64) -> f64 {
    highest_buy * (1.0 + interval) * (1.0 + interval) * SHIFT_UP_MARGIN
}

pub fn should_shift_up(highest_buy: f64, interval: f64, current_price: f64) -> bool {
    current_price > shift_up_threshold(highest_buy, interval)
}

/// Sell price one interval above the buy fill, re-clamped upwards when the
/// ticker has already moved past it.
pub fn sell_price(interval: f64, fill_price: f64, ticker: f64) -> f64 {
    let price = fill_price * (1.0 + interval);
    if ticker > price {
        ticker * (1.0 + interval)
    } else {
        price
    }
}

/// Base volume whose sale returns `amount` quote after fees on both legs.
pub fn sell_volume_for_quote(amount: f64, price: f64, fee: f64) -> f64 {
    amount / (price * (1.0 - 2.0 * fee))
}

/// Base volume bought for `amount` quote at `price`.
pub fn buy_volume(amount: f64, price: f64) -> f64 {
    amount / price
}

/// Price for a sell decoupled from a buy fill: two intervals above the
/// ticker, but never below two intervals above the highest buy.
pub fn extra_sell_price(interval: f64, ticker: f64, highest_buy: f64) -> f64 {
    let step = (1.0 + interval) * (1.0 + interval);
    let price = ticker * step;
    if price < highest_buy {
        highest_buy * step
    } else {
        price
    }
}
