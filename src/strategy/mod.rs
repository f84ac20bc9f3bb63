pub mod cdca;
pub mod common;
pub mod grid_hodl;
pub mod grid_sell;
pub mod swing;

use crate::config::{GridConfig, StrategyKind};
use crate::ledger::StrategyState;
use crate::model::PairInfo;

/// Read-only view of the world a policy decides from. Policies never hold
/// mutable state of their own; everything they need is passed in.
pub struct MarketView<'a> {
    pub last_price: f64,
    pub state: &'a StrategyState,
    pub open_buy_prices: &'a [f64],
    pub open_sell_count: usize,
    /// Free base balance, used only by decisions that sell prior accumulation.
    pub base_available: f64,
}

/// A pure decision to place one sell order.
#[derive(Debug, Clone, PartialEq)]
pub struct SellDecision {
    pub price: f64,
    pub volume: f64,
}

/// Decision functions for one grid variant. Implementations are stateless
/// and side-effect free; the engine owns all mutation and I/O.
pub trait StrategyPolicy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Descending buy prices still needed to reach the target ladder size,
    /// anchored so that recomputation on every tick does not drift the grid.
    fn buy_levels(&self, view: &MarketView) -> Vec<f64>;

    /// Whether the price has run far enough above the highest open buy that
    /// the whole ladder should be cancelled and re-anchored.
    fn should_shift_up(&self, view: &MarketView) -> bool;

    /// Variant-specific reaction to a fully filled buy order.
    fn on_buy_filled(
        &self,
        view: &MarketView,
        fill_price: f64,
        fill_volume: f64,
    ) -> Option<SellDecision>;

    /// Sell decision decoupled from any buy fill (SWING only).
    fn extra_sell(&self, _view: &MarketView) -> Option<SellDecision> {
        None
    }
}

pub fn init_policy(config: GridConfig, pair: PairInfo) -> Box<dyn StrategyPolicy> {
    match config.strategy {
        StrategyKind::GridHodl => Box::new(grid_hodl::GridHodlPolicy::new(config, pair)),
        StrategyKind::GridSell => Box::new(grid_sell::GridSellPolicy::new(config, pair)),
        StrategyKind::Swing => Box::new(swing::SwingPolicy::new(config, pair)),
        StrategyKind::Cdca => Box::new(cdca::CdcaPolicy::new(config, pair)),
    }
}
