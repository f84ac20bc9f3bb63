use super::common;
use super::{MarketView, SellDecision, StrategyPolicy};
use crate::config::{GridConfig, StrategyKind};
use crate::model::PairInfo;

/// Continuous DCA: buys on the grid like the others but never sells. Filled
/// buys only update the strategy state and free their ladder slot.
pub struct CdcaPolicy {
    config: GridConfig,
    pair: PairInfo,
}

impl CdcaPolicy {
    pub fn new(config: GridConfig, pair: PairInfo) -> Self {
        Self { config, pair }
    }
}

impl StrategyPolicy for CdcaPolicy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Cdca
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
        _view: &MarketView,
        _fill_price: f64,
        _fill_volume: f64,
    ) -> Option<SellDecision> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::StrategyState;
    use crate::strategy::testutil::{test_config, test_pair};

    #[test]
    fn test_never_sells() {
        let config = test_config(StrategyKind::Cdca);
        let state = StrategyState::new(&config);
        let policy = CdcaPolicy::new(config, test_pair());

        let view = MarketView {
            last_price: 50_000.0,
            state: &state,
            open_buy_prices: &[],
            open_sell_count: 0,
            base_available: 10.0,
        };
        assert!(policy.on_buy_filled(&view, 48_000.0, 0.002).is_none());
        assert!(policy.extra_sell(&view).is_none());
    }

    #[test]
    fn test_still_replenishes_the_buy_grid() {
        let config = test_config(StrategyKind::Cdca);
        let state = StrategyState::new(&config);
        let policy = CdcaPolicy::new(config, test_pair());

        let view = MarketView {
            last_price: 50_000.0,
            state: &state,
            open_buy_prices: &[48_076.9],
            open_sell_count: 0,
            base_available: 0.0,
        };
        let levels = policy.buy_levels(&view);
        assert_eq!(levels.len(), 4);
        assert!(levels[0] < 48_076.9);
    }
}
