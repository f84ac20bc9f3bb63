//! The authoritative in-process representation of all orders and strategy
//! state. Single writer (the engine); every mutation goes through a lifecycle
//! transition and upholds the capital invariants.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{GridConfig, StrategyKind};
use crate::constants::FILL_COMPLETE_RATIO;
use crate::error::LedgerError;
use crate::model::{
    ClientOrderId, ExchangeOrder, ExecutionEvent, ExecutionKind, Order, OrderSide, OrderStatus,
    PairInfo, SurplusRecord,
};
use crate::strategy::{MarketView, SellDecision, StrategyPolicy};

/// Mutable strategy state, persisted after every fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyState {
    /// Effective quote amount per grid level; grows under reinvestment.
    pub amount_per_grid: f64,
    /// Highest price any buy has filled at (SWING anchor).
    pub highest_buy_price: f64,
    /// Net quote invested: filled buy value minus filled sell value.
    pub total_invested: f64,
    /// Accumulated sell proceeds above the grid amount, pending reinvestment.
    pub reinvest_proceeds: f64,
    /// Base volume currently resting in open sell orders.
    pub open_sell_volume: f64,
}

impl StrategyState {
    pub fn new(config: &GridConfig) -> Self {
        Self {
            amount_per_grid: config.amount_per_grid,
            highest_buy_price: 0.0,
            total_invested: 0.0,
            reinvest_proceeds: 0.0,
            open_sell_volume: 0.0,
        }
    }
}

/// A prospective order before the ledger has admitted it.
#[derive(Debug, Clone)]
pub struct OrderCandidate {
    pub side: OrderSide,
    pub price: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A live order already occupies this (side, rounded price) slot.
    DuplicateLevel,
    /// The target number of open buy orders is already reached.
    BuyTargetReached,
    /// Admitting the order would push committed exposure past max_investment.
    MaxInvestmentReached,
    /// Volume rounds below the exchange's minimum lot.
    BelowMinimumLot,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SkipReason::DuplicateLevel => "duplicate price level",
            SkipReason::BuyTargetReached => "buy target reached",
            SkipReason::MaxInvestmentReached => "max investment reached",
            SkipReason::BelowMinimumLot => "below minimum lot size",
        };
        write!(f, "{s}")
    }
}

/// Result of admitting a candidate. A skip is a normal no-op, not an error;
/// repeated placement of the same grid target is idempotent.
#[derive(Debug, Clone)]
pub enum PlaceOutcome {
    Admitted(Order),
    Skipped(SkipReason),
}

/// What an execution event did to the ledger.
#[derive(Debug, Clone)]
pub enum LedgerUpdate {
    Accepted(Order),
    PartialFill(Order),
    BuyFilled {
        order: Order,
        sell: Option<SellDecision>,
    },
    SellFilled(Order),
    Cancelled {
        order: Order,
        surplus: Option<SurplusRecord>,
    },
    Failed(Order),
    /// Redelivered or stale event; logged and discarded.
    Duplicate,
    /// Event for an order this instance does not track.
    Untracked,
}

/// Outcome of a full snapshot reconciliation.
#[derive(Debug, Default)]
pub struct ReconcileReport {
    /// Upstream orders with our userref that were unknown locally.
    pub adopted: Vec<Order>,
    /// Pending orders found resting upstream, now acknowledged.
    pub acknowledged: Vec<Order>,
    /// Acknowledged live orders absent from the snapshot; need a targeted
    /// status query.
    pub missing: Vec<Order>,
    /// Pending orders absent upstream; their placement never landed.
    pub expired: Vec<Order>,
}

pub struct OrderLedger {
    config: GridConfig,
    pair: PairInfo,
    orders: HashMap<ClientOrderId, Order>,
    by_exchange_id: HashMap<String, ClientOrderId>,
    state: StrategyState,
    surplus: Vec<SurplusRecord>,
}

impl OrderLedger {
    pub fn new(config: GridConfig, pair: PairInfo) -> Self {
        let state = StrategyState::new(&config);
        Self {
            config,
            pair,
            orders: HashMap::new(),
            by_exchange_id: HashMap::new(),
            state,
            surplus: Vec::new(),
        }
    }

    // --- restore (startup) ---------------------------------------------------

    pub fn restore_state(&mut self, state: StrategyState) {
        self.state = state;
    }

    pub fn restore_orders(&mut self, orders: Vec<Order>) {
        for order in orders {
            if let Some(id) = &order.exchange_id {
                self.by_exchange_id.insert(id.clone(), order.client_id);
            }
            self.orders.insert(order.client_id, order);
        }
    }

    pub fn restore_surplus(&mut self, records: Vec<SurplusRecord>) {
        self.surplus = records;
    }

    // --- accessors -----------------------------------------------------------

    pub fn state(&self) -> &StrategyState {
        &self.state
    }

    pub fn order(&self, id: &ClientOrderId) -> Option<&Order> {
        self.orders.get(id)
    }

    pub fn live_orders(&self) -> impl Iterator<Item = &Order> {
        self.orders.values().filter(|o| o.is_live())
    }

    pub fn open_buy_prices(&self) -> Vec<f64> {
        self.live_orders()
            .filter(|o| o.side.is_buy())
            .map(|o| o.price)
            .collect()
    }

    pub fn open_buy_count(&self) -> usize {
        self.live_orders().filter(|o| o.side.is_buy()).count()
    }

    pub fn open_sell_count(&self) -> usize {
        self.live_orders().filter(|o| o.side.is_sell()).count()
    }

    pub fn highest_open_buy(&self) -> Option<f64> {
        self.live_orders()
            .filter(|o| o.side.is_buy())
            .map(|o| o.price)
            .fold(None, |acc, p| Some(acc.map_or(p, |a: f64| a.max(p))))
    }

    /// Quote committed in open buy orders.
    pub fn committed_buy_quote(&self) -> f64 {
        self.live_orders()
            .filter(|o| o.side.is_buy())
            .map(|o| o.committed_quote())
            .sum()
    }

    /// Committed exposure: open buy commitments plus net invested quote.
    pub fn exposure(&self) -> f64 {
        self.committed_buy_quote() + self.state.total_invested
    }

    pub fn surplus_volume(&self) -> f64 {
        self.surplus.iter().map(|r| r.volume).sum()
    }

    pub fn surplus_records(&self) -> &[SurplusRecord] {
        &self.surplus
    }

    // --- placement -----------------------------------------------------------

    /// Admit a candidate order. Returns a no-op when its grid slot is already
    /// occupied or admitting it would violate the exposure or ladder-size
    /// invariants, which makes repeated placement of the same target
    /// idempotent.
    pub fn place(&mut self, candidate: &OrderCandidate) -> PlaceOutcome {
        let price = self.pair.round_price(candidate.price);
        let volume = self.pair.round_volume(candidate.volume);

        if volume <= 0.0 || volume < self.pair.min_volume {
            return PlaceOutcome::Skipped(SkipReason::BelowMinimumLot);
        }

        let key = (candidate.side, self.pair.price_key(price));
        let occupied = self
            .live_orders()
            .any(|o| (o.side, self.pair.price_key(o.price)) == key);
        if occupied {
            return PlaceOutcome::Skipped(SkipReason::DuplicateLevel);
        }

        if candidate.side.is_buy() {
            if self.open_buy_count() >= self.config.n_open_buy_orders {
                return PlaceOutcome::Skipped(SkipReason::BuyTargetReached);
            }
            if self.exposure() + price * volume > self.config.max_investment + 1e-9 {
                return PlaceOutcome::Skipped(SkipReason::MaxInvestmentReached);
            }
        }

        let order = Order {
            client_id: ClientOrderId::new(),
            exchange_id: None,
            userref: self.config.userref,
            side: candidate.side,
            price,
            volume,
            filled: 0.0,
            status: OrderStatus::Pending,
            created_at: Utc::now(),
            last_event_at: None,
        };
        self.orders.insert(order.client_id, order.clone());
        PlaceOutcome::Admitted(order)
    }

    /// Exchange acknowledged the placement: Pending -> Open.
    pub fn acknowledge(
        &mut self,
        client_id: &ClientOrderId,
        exchange_id: &str,
    ) -> Result<Order, LedgerError> {
        let order = self.orders.get_mut(client_id).ok_or_else(|| {
            LedgerError::InvariantViolation(format!("acknowledge of unknown order {client_id}"))
        })?;
        transition(order, OrderStatus::Open)?;
        order.exchange_id = Some(exchange_id.to_string());
        if order.side.is_sell() {
            self.state.open_sell_volume += order.volume;
        }
        let snapshot = order.clone();
        self.by_exchange_id
            .insert(exchange_id.to_string(), *client_id);
        Ok(snapshot)
    }

    /// Placement definitively rejected: Pending -> Failed.
    pub fn mark_failed(&mut self, client_id: &ClientOrderId) -> Result<Order, LedgerError> {
        let order = self.orders.get_mut(client_id).ok_or_else(|| {
            LedgerError::InvariantViolation(format!("mark_failed of unknown order {client_id}"))
        })?;
        transition(order, OrderStatus::Failed)?;
        Ok(order.clone())
    }

    // --- execution events ----------------------------------------------------

    /// Drive the order state machine from one feed event. Redelivered events
    /// against terminal orders (and stale timestamps) are discarded, never
    /// errors; the feed is at-least-once.
    pub fn apply_execution_event(
        &mut self,
        event: &ExecutionEvent,
        policy: &dyn StrategyPolicy,
        last_price: f64,
    ) -> Result<LedgerUpdate, LedgerError> {
        let client_id = match self.by_exchange_id.get(&event.order_id) {
            Some(id) => *id,
            None => return Ok(LedgerUpdate::Untracked),
        };

        {
            let order = &self.orders[&client_id];
            if order.status.is_terminal() {
                debug!(order = %event.order_id, "Discarding event for terminal order");
                return Ok(LedgerUpdate::Duplicate);
            }
            if let Some(last) = order.last_event_at {
                if event.timestamp < last {
                    debug!(order = %event.order_id, "Discarding stale event");
                    return Ok(LedgerUpdate::Duplicate);
                }
            }
        }

        match event.kind {
            ExecutionKind::Accepted => {
                let order = self.orders.get_mut(&client_id).expect("checked above");
                if order.status != OrderStatus::Pending {
                    return Ok(LedgerUpdate::Duplicate);
                }
                transition(order, OrderStatus::Open)?;
                order.last_event_at = Some(event.timestamp);
                let snapshot = order.clone();
                if snapshot.side.is_sell() {
                    self.state.open_sell_volume += snapshot.volume;
                }
                Ok(LedgerUpdate::Accepted(snapshot))
            }
            ExecutionKind::Fill => self.apply_fill(client_id, event, policy, last_price),
            ExecutionKind::Cancelled => {
                let order = self.orders.get_mut(&client_id).expect("checked above");
                if order.status == OrderStatus::Pending {
                    transition(order, OrderStatus::Open)?;
                }
                transition(order, OrderStatus::Cancelled)?;
                order.last_event_at = Some(event.timestamp);
                let snapshot = order.clone();

                let mut surplus = None;
                if snapshot.side.is_buy() && snapshot.filled > 0.0 {
                    let record = SurplusRecord::new(snapshot.filled, snapshot.price);
                    self.surplus.push(record.clone());
                    surplus = Some(record);
                }
                if snapshot.side.is_sell() {
                    self.state.open_sell_volume =
                        (self.state.open_sell_volume - snapshot.remaining()).max(0.0);
                }
                Ok(LedgerUpdate::Cancelled {
                    order: snapshot,
                    surplus,
                })
            }
            ExecutionKind::Rejected => {
                let order = self.orders.get_mut(&client_id).expect("checked above");
                if !order.status.can_transition(OrderStatus::Failed) {
                    // Rejections only apply to not-yet-resting orders; a late
                    // rejection against an open order is feed noise.
                    warn!(order = %event.order_id, status = %order.status,
                          "Ignoring rejection for order that is already resting");
                    return Ok(LedgerUpdate::Duplicate);
                }
                transition(order, OrderStatus::Failed)?;
                order.last_event_at = Some(event.timestamp);
                Ok(LedgerUpdate::Failed(order.clone()))
            }
        }
    }

    fn apply_fill(
        &mut self,
        client_id: ClientOrderId,
        event: &ExecutionEvent,
        policy: &dyn StrategyPolicy,
        last_price: f64,
    ) -> Result<LedgerUpdate, LedgerError> {
        let order = self.orders.get_mut(&client_id).expect("checked above");
        if order.status == OrderStatus::Pending {
            // A fill implies the exchange accepted the order.
            transition(order, OrderStatus::Open)?;
        }

        let delta = event.filled_delta.min(order.remaining());
        if delta <= 0.0 {
            order.last_event_at = Some(event.timestamp);
            return Ok(LedgerUpdate::Duplicate);
        }

        order.filled += delta;
        order.last_event_at = Some(event.timestamp);
        let complete = order.filled >= order.volume * FILL_COMPLETE_RATIO;
        if complete {
            transition(order, OrderStatus::Filled)?;
        } else {
            transition(order, OrderStatus::PartiallyFilled)?;
        }
        let snapshot = order.clone();

        let fill_price = if event.price > 0.0 {
            event.price
        } else {
            snapshot.price
        };
        match snapshot.side {
            OrderSide::Buy => {
                self.state.total_invested += delta * fill_price;
                if fill_price > self.state.highest_buy_price {
                    self.state.highest_buy_price = fill_price;
                }
            }
            OrderSide::Sell => {
                self.state.total_invested =
                    (self.state.total_invested - delta * fill_price).max(0.0);
                self.state.open_sell_volume = (self.state.open_sell_volume - delta).max(0.0);
                if complete {
                    let proceeds = snapshot.filled * snapshot.price;
                    self.state.reinvest_proceeds +=
                        (proceeds - self.state.amount_per_grid).max(0.0);
                }
            }
        }

        if !complete {
            return Ok(LedgerUpdate::PartialFill(snapshot));
        }

        if snapshot.side.is_buy() {
            let open_buys = self.open_buy_prices();
            let view = MarketView {
                last_price,
                state: &self.state,
                open_buy_prices: &open_buys,
                open_sell_count: self.open_sell_count(),
                base_available: 0.0,
            };
            let sell = policy.on_buy_filled(&view, snapshot.price, snapshot.filled);
            Ok(LedgerUpdate::BuyFilled {
                order: snapshot,
                sell,
            })
        } else {
            Ok(LedgerUpdate::SellFilled(snapshot))
        }
    }

    // --- surplus and reinvestment -------------------------------------------

    /// Consume the surplus pool into one sell decision once it is worth a
    /// full grid amount at the best recorded price. The records are taken
    /// out of the pool exactly once; a failed submission lands in the unsold
    /// queue, never back here.
    pub fn flush_surplus(&mut self, last_price: f64) -> Option<(SellDecision, Vec<SurplusRecord>)> {
        if self.config.strategy == StrategyKind::Cdca {
            return None;
        }
        if self.surplus.is_empty() {
            return None;
        }
        let total: f64 = self.surplus.iter().map(|r| r.volume).sum();
        let max_price = self
            .surplus
            .iter()
            .map(|r| r.price)
            .fold(f64::NEG_INFINITY, f64::max);
        if total * max_price < self.state.amount_per_grid {
            return None;
        }

        let price = self.pair.round_price(crate::strategy::common::sell_price(
            self.config.interval,
            max_price,
            last_price,
        ));
        let volume = self
            .pair
            .round_volume(crate::strategy::common::sell_volume_for_quote(
                self.state.amount_per_grid,
                price,
                self.config.fee_rate(),
            ));
        let consumed = std::mem::take(&mut self.surplus);
        Some((SellDecision { price, volume }, consumed))
    }

    /// Grow amount_per_grid out of accumulated proceeds once no sell order
    /// is open. Applies to future orders only. Returns the new amount.
    pub fn maybe_reinvest(&mut self) -> Option<f64> {
        let threshold = self.config.reinvest_threshold?;
        if self.open_sell_count() != 0 {
            return None;
        }
        if self.state.reinvest_proceeds < threshold {
            return None;
        }
        let bump = self.state.reinvest_proceeds / self.config.n_open_buy_orders as f64;
        self.state.amount_per_grid += bump;
        self.state.reinvest_proceeds = 0.0;
        Some(self.state.amount_per_grid)
    }

    // --- housekeeping --------------------------------------------------------

    /// Buy orders sitting closer than half an interval under a neighbour.
    /// The higher of each too-close pair goes; the lowest survives.
    pub fn near_buy_cancel_candidates(&self) -> Vec<ClientOrderId> {
        let mut buys: Vec<(f64, ClientOrderId)> = self
            .live_orders()
            .filter(|o| o.side.is_buy())
            .map(|o| (o.price, o.client_id))
            .collect();
        buys.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let mut cancel = Vec::new();
        for window in buys.windows(2) {
            let (higher, lower) = (window[0], window[1]);
            if lower.0 <= 0.0 {
                continue;
            }
            if (higher.0 / lower.0) - 1.0 < self.config.interval / 2.0 {
                cancel.push(higher.1);
            }
        }
        cancel
    }

    /// Lowest buy orders beyond the target ladder size.
    pub fn excess_buy_cancel_candidates(&self) -> Vec<ClientOrderId> {
        let count = self.open_buy_count();
        if count <= self.config.n_open_buy_orders {
            return Vec::new();
        }
        let mut buys: Vec<(f64, ClientOrderId)> = self
            .live_orders()
            .filter(|o| o.side.is_buy())
            .map(|o| (o.price, o.client_id))
            .collect();
        buys.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        buys.truncate(count - self.config.n_open_buy_orders);
        buys.into_iter().map(|(_, id)| id).collect()
    }

    pub fn live_buy_ids(&self) -> Vec<ClientOrderId> {
        self.live_orders()
            .filter(|o| o.side.is_buy())
            .map(|o| o.client_id)
            .collect()
    }

    // --- reconciliation ------------------------------------------------------

    /// Full periodic reconciliation against the exchange's open-order
    /// snapshot. Adopts unknown orders tagged with this instance's userref;
    /// reports locally-live orders the exchange no longer shows so the
    /// caller can resolve them with a targeted query.
    pub fn reconcile_snapshot(&mut self, snapshot: &[ExchangeOrder]) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let mut seen: HashSet<&str> = HashSet::new();

        for upstream in snapshot {
            if upstream.userref != self.config.userref {
                continue;
            }
            seen.insert(upstream.exchange_id.as_str());

            if self.by_exchange_id.contains_key(&upstream.exchange_id) {
                continue;
            }

            // A pending order that did land but whose ack we never saw.
            let pending_match = upstream.client_id.filter(|cid| {
                self.orders
                    .get(cid)
                    .map(|o| o.status == OrderStatus::Pending)
                    .unwrap_or(false)
            });
            if let Some(cid) = pending_match {
                match self.acknowledge(&cid, &upstream.exchange_id) {
                    Ok(order) => report.acknowledged.push(order),
                    Err(e) => warn!(order = %cid, error = %e, "Reconcile ack failed"),
                }
                continue;
            }

            // Unknown upstream order carrying our userref: adopt it.
            let status = if upstream.filled > 0.0 {
                OrderStatus::PartiallyFilled
            } else {
                OrderStatus::Open
            };
            let order = Order {
                client_id: upstream.client_id.unwrap_or_else(ClientOrderId::new),
                exchange_id: Some(upstream.exchange_id.clone()),
                userref: upstream.userref,
                side: upstream.side,
                price: upstream.price,
                volume: upstream.volume,
                filled: upstream.filled,
                status,
                created_at: Utc::now(),
                last_event_at: None,
            };
            self.by_exchange_id
                .insert(upstream.exchange_id.clone(), order.client_id);
            if order.side.is_sell() {
                self.state.open_sell_volume += order.remaining();
            }
            self.orders.insert(order.client_id, order.clone());
            report.adopted.push(order);
        }

        // Locally-live orders the snapshot no longer contains.
        let stale: Vec<ClientOrderId> = self
            .live_orders()
            .filter(|o| match &o.exchange_id {
                Some(id) => !seen.contains(id.as_str()),
                None => true,
            })
            .map(|o| o.client_id)
            .collect();

        for client_id in stale {
            let order = self.orders.get(&client_id).expect("collected above");
            if order.exchange_id.is_some() {
                report.missing.push(order.clone());
            } else {
                // Never acknowledged and not resting upstream: the placement
                // did not land.
                let order = self.orders.get_mut(&client_id).expect("collected above");
                if transition(order, OrderStatus::Failed).is_ok() {
                    report.expired.push(order.clone());
                }
            }
        }

        report
    }
}

fn transition(order: &mut Order, to: OrderStatus) -> Result<(), LedgerError> {
    if !order.status.can_transition(to) {
        return Err(LedgerError::InvalidTransition {
            order: order.client_id.to_string(),
            from: order.status,
            to,
        });
    }
    order.status = to;
    Ok(())
}
