use super::common;
use super::{MarketView, SellDecision, StrategyPolicy};
use crate::config::{GridConfig, StrategyKind};
use crate::model::PairInfo;

/// Sells one interval above each filled buy, sized so its quote value equals
/// the grid amount. Since the volume sold is smaller (in base terms) than
/// the volume bought, a small base surplus accumulates over time.
pub struct GridHodlPolicy {
    config: GridConfig,
    pair: PairInfo,
}

impl GridHodlPolicy {
    pub fn new(config: GridConfig, pair: PairInfo) -> Self {
        Self { config, pair }
    }
}

impl StrategyPolicy for GridHodlPolicy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::GridHodl
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::StrategyState;
    use crate::strategy::testutil::{test_config, test_pair};

    fn view<'a>(state: &'a StrategyState, buys: &'a [f64], price: f64) -> MarketView<'a> {
        MarketView {
            last_price: price,
            state,
            open_buy_prices: buys,
            open_sell_count: 0,
            base_available: 0.0,
        }
    }

    #[test]
    fn test_buy_fill_yields_one_sell_an_interval_above() {
        let config = test_config(StrategyKind::GridHodl);
        let state = StrategyState::new(&config);
        let policy = GridHodlPolicy::new(config, test_pair());

        // Buy filled at 48,000 with 100 quote per grid and 4% interval:
        // exactly one sell at 49,920 worth 100 quote.
        let v = view(&state, &[], 48_100.0);
        let sell = policy.on_buy_filled(&v, 48_000.0, 0.00208333).unwrap();
        assert!((sell.price - 49_920.0).abs() < 1e-9);
        assert!((sell.volume * sell.price - 100.0).abs() < 1e-2);
    }

    #[test]
    fn test_sell_respects_grown_amount_per_grid() {
        let config = test_config(StrategyKind::GridHodl);
        let mut state = StrategyState::new(&config);
        state.amount_per_grid = 120.0;
        let policy = GridHodlPolicy::new(config, test_pair());

        let v = view(&state, &[], 48_100.0);
        let sell = policy.on_buy_filled(&v, 48_000.0, 0.0025).unwrap();
        assert!((sell.volume * sell.price - 120.0).abs() < 1e-2);
    }

    #[test]
    fn test_buy_levels_descend_from_current_price() {
        let config = test_config(StrategyKind::GridHodl);
        let state = StrategyState::new(&config);
        let policy = GridHodlPolicy::new(config, test_pair());

        let v = view(&state, &[], 50_000.0);
        let levels = policy.buy_levels(&v);
        assert_eq!(levels.len(), 5);
        assert!((levels[0] - 48_076.9).abs() < 0.1);
        for pair in levels.windows(2) {
            assert!(pair[0] > pair[1]);
        }
    }

    #[test]
    fn test_shift_up_only_past_two_intervals_and_margin() {
        let config = test_config(StrategyKind::GridHodl);
        let state = StrategyState::new(&config);
        let policy = GridHodlPolicy::new(config, test_pair());

        let buys = [100_000.0, 96_153.8];
        let v = view(&state, &buys, 108_268.0);
        assert!(!policy.should_shift_up(&v));
        let v = view(&state, &buys, 108_269.0);
        assert!(policy.should_shift_up(&v));

        // No open buys, nothing to shift.
        let v = view(&state, &[], 200_000.0);
        assert!(!policy.should_shift_up(&v));
    }
}
