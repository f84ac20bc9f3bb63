use super::common;
use super::{MarketView, SellDecision, StrategyPolicy};
use crate::config::{GridConfig, StrategyKind};
use crate::model::PairInfo;

/// GridHODL below the highest buy price; once the price has risen past it,
/// previously accumulated base currency is sold off at successive intervals
/// above, decoupled from any specific buy fill.
pub struct SwingPolicy {
    config: GridConfig,
    pair: PairInfo,
}

impl SwingPolicy {
    pub fn new(config: GridConfig, pair: PairInfo) -> Self {
        Self { config, pair }
    }
}

impl StrategyPolicy for SwingPolicy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Swing
    }

    fn buy_levels(&self, view: &MarketView) -> Vec<f64> {
        common::replenish_levels(
            self.config.interval,
            view.last_price,
            view.open_buy_prices,
            self.config.n_open_buy_orders,
        )
        .into_iter()
        .map(|p| self.pair.round_price(p))
        .collect()
    }

    fn should_shift_up(&self, view: &MarketView) -> bool {
        match view
            .open_buy_prices
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max)
        {
            highest if highest.is_finite() => {
                common::should_shift_up(highest, self.config.interval, view.last_price)
            }
            _ => false,
        }
    }

    fn on_buy_filled(
        &self,
        view: &MarketView,
        fill_price: f64,
        _fill_volume: f64,
    ) -> Option<SellDecision> {
        let price = self.pair.round_price(common::sell_price(
            self.config.interval,
            fill_price,
            view.last_price,
        ));
        let volume = self.pair.round_volume(common::sell_volume_for_quote(
            view.state.amount_per_grid,
            price,
            self.config.fee_rate(),
        ));
        Some(SellDecision { price, volume })
    }

    fn extra_sell(&self, view: &MarketView) -> Option<SellDecision> {
        if view.open_sell_count != 0 {
            return None;
        }
        let highest_buy = view.state.highest_buy_price;
        if highest_buy <= 0.0 {
            return None;
        }
        if view.last_price <= highest_buy * (1.0 + self.config.interval) {
            return None;
        }
        // Only when the accumulated base is worth at least one grid amount.
        let required = view.state.amount_per_grid * (1.0 + self.config.fee_rate());
        if view.base_available * view.last_price <= required {
            return None;
        }

        let price = self.pair.round_price(common::extra_sell_price(
            self.config.interval,
            view.last_price,
            highest_buy,
        ));
        let volume = self.pair.round_volume(common::sell_volume_for_quote(
            view.state.amount_per_grid,
            price,
            self.config.fee_rate(),
        ));
        Some(SellDecision { price, volume })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::StrategyState;
    use crate::strategy::testutil::{test_config, test_pair};

    fn state_with_highest_buy(config: &GridConfig, highest: f64) -> StrategyState {
        let mut state = StrategyState::new(config);
        state.highest_buy_price = highest;
        state
    }

    #[test]
    fn test_no_extra_sell_below_highest_buy() {
        let config = test_config(StrategyKind::Swing);
        let state = state_with_highest_buy(&config, 50_000.0);
        let policy = SwingPolicy::new(config, test_pair());

        let view = MarketView {
            last_price: 51_000.0, // above highest buy but within one interval
            state: &state,
            open_buy_prices: &[],
            open_sell_count: 0,
            base_available: 1.0,
        };
        assert!(policy.extra_sell(&view).is_none());
    }

    #[test]
    fn test_extra_sell_two_intervals_above_ticker() {
        let config = test_config(StrategyKind::Swing);
        let state = state_with_highest_buy(&config, 50_000.0);
        let policy = SwingPolicy::new(config, test_pair());

        let view = MarketView {
            last_price: 53_000.0,
            state: &state,
            open_buy_prices: &[],
            open_sell_count: 0,
            base_available: 1.0,
        };
        let sell = policy.extra_sell(&view).unwrap();
        assert!((sell.price - 53_000.0 * 1.04 * 1.04).abs() < 0.1);
        assert!((sell.volume * sell.price - 100.0).abs() < 1e-3);
    }

    #[test]
    fn test_extra_sell_suppressed_by_open_sells_or_thin_balance() {
        let config = test_config(StrategyKind::Swing);
        let state = state_with_highest_buy(&config, 50_000.0);
        let policy = SwingPolicy::new(config.clone(), test_pair());

        let view = MarketView {
            last_price: 53_000.0,
            state: &state,
            open_buy_prices: &[],
            open_sell_count: 1,
            base_available: 1.0,
        };
        assert!(policy.extra_sell(&view).is_none());

        // Base holdings not worth one grid amount.
        let view = MarketView {
            last_price: 53_000.0,
            state: &state,
            open_buy_prices: &[],
            open_sell_count: 0,
            base_available: 0.0001,
        };
        assert!(policy.extra_sell(&view).is_none());
    }

    #[test]
    fn test_regular_sell_matches_hodl_behavior() {
        let config = test_config(StrategyKind::Swing);
        let state = StrategyState::new(&config);
        let policy = SwingPolicy::new(config, test_pair());

        let view = MarketView {
            last_price: 48_100.0,
            state: &state,
            open_buy_prices: &[],
            open_sell_count: 0,
            base_available: 0.0,
        };
        let sell = policy.on_buy_filled(&view, 48_000.0, 0.002).unwrap();
        assert!((sell.price - 49_920.0).abs() < 1e-9);
        assert!((sell.volume * sell.price - 100.0).abs() < 1e-2);
    }
}
