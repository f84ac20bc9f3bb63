use super::common;
use super::{MarketView, SellDecision, StrategyPolicy};
use crate::config::{GridConfig, StrategyKind};
use crate::model::PairInfo;

/// Full-turnover variant: every filled buy is countered by a sell of the
/// entire base volume just bought, one interval above.
pub struct GridSellPolicy {
    config: GridConfig,
    pair: PairInfo,
}

impl GridSellPolicy {
    pub fn new(config: GridConfig, pair: PairInfo) -> Self {
        Self { config, pair }
    }
}

impl StrategyPolicy for GridSellPolicy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::GridSell
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
        fill_volume: f64,
    ) -> Option<SellDecision> {
        let price = self.pair.round_price(common::sell_price(
            self.config.interval,
            fill_price,
            view.last_price,
        ));
        // The whole executed volume turns over, never more or less.
        let volume = self.pair.round_volume(fill_volume);
        Some(SellDecision { price, volume })
    }
}
