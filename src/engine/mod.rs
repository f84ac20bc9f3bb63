//! The reconciliation control loop. One logical worker drains a serialized
//! event queue and keeps the local ledger consistent with exchange-reported
//! truth; gateway calls are the only operations that block an event.

pub mod lifecycle;

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::GridConfig;
use crate::constants::{
    MAX_ORDER_RETRIES, PERSIST_RETRIES, RECONCILIATION_INTERVAL, RETRY_BASE_DELAY,
    STATUS_SUMMARY_INTERVAL,
};
use crate::error::{GatewayError, StoreError};
use crate::gateway::retry::with_backoff;
use crate::gateway::{ExchangeGateway, LookupStatus, PlaceRequest};
use crate::ledger::{
    LedgerUpdate, OrderCandidate, OrderLedger, PlaceOutcome, SkipReason,
};
use crate::logging::order_audit::OrderAuditLogger;
use crate::model::{
    ClientOrderId, ExecutionEvent, ExecutionKind, Order, OrderSide, PriceTick, UnsoldRecord,
};
use crate::notifier::{BotSummary, Notifier, Severity};
use crate::store::{GridSettings, PersistenceStore};
use crate::strategy::{self, MarketView, SellDecision, StrategyPolicy};

use self::lifecycle::{BotState, Lifecycle};

/// Everything the loop reacts to, serialized into one queue.
#[derive(Debug)]
pub enum EngineEvent {
    Ticker(PriceTick),
    Execution(ExecutionEvent),
    ConnectionLost,
    ConnectionRestored,
    Shutdown,
}

enum Flow {
    Done,
    /// A non-ticker event pulled off the queue while coalescing tickers.
    Next(EngineEvent),
    Stop,
}

enum Wake {
    Reconcile,
    Summary,
    Interrupt,
    Queue(Option<EngineEvent>),
}

enum Placement {
    Submitted,
    Rejected,
    /// Outcome unknown (network/timeout); the order stays pending until the
    /// next reconciliation resolves it.
    Unknown,
}

pub struct Engine {
    config: GridConfig,
    policy: Box<dyn StrategyPolicy>,
    ledger: OrderLedger,
    gateway: Arc<dyn ExchangeGateway>,
    store: Arc<dyn PersistenceStore>,
    notifier: Notifier,
    audit: Option<OrderAuditLogger>,
    lifecycle: Lifecycle,
    last_price: f64,
    /// Set by a non-retryable buy rejection; cleared by a clean reconcile.
    buys_paused: bool,
    feed_connected: bool,
    /// Grid parameters changed across restart; the buy ladder gets rebuilt.
    pending_rebuild: bool,
    unsold: Vec<UnsoldRecord>,
}

impl Engine {
    pub fn new(
        mut config: GridConfig,
        gateway: Arc<dyn ExchangeGateway>,
        store: Arc<dyn PersistenceStore>,
        notifier: Notifier,
        audit: Option<OrderAuditLogger>,
    ) -> Self {
        let pair = gateway.pair_info();
        if config.fee.is_none() {
            config.fee = Some(pair.maker_fee);
        }
        let policy = strategy::init_policy(config.clone(), pair);
        let ledger = OrderLedger::new(config.clone(), pair);
        Self {
            config,
            policy,
            ledger,
            gateway,
            store,
            notifier,
            audit,
            lifecycle: Lifecycle::new(),
            last_price: 0.0,
            buys_paused: false,
            feed_connected: true,
            pending_rebuild: false,
            unsold: Vec::new(),
        }
    }

    pub async fn run(mut self, mut events: mpsc::Receiver<EngineEvent>) -> Result<()> {
        self.startup().await?;
        self.notifier
            .notify(Severity::Info, format!("{} is starting!", self.config.name));

        let mut reconcile_timer = tokio::time::interval(RECONCILIATION_INTERVAL);
        reconcile_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        reconcile_timer.tick().await; // the startup sync already ran
        let mut summary_timer = tokio::time::interval(STATUS_SUMMARY_INTERVAL);

        info!("Starting event loop...");
        loop {
            let wake = tokio::select! {
                _ = reconcile_timer.tick() => Wake::Reconcile,
                _ = summary_timer.tick() => Wake::Summary,
                _ = tokio::signal::ctrl_c() => Wake::Interrupt,
                maybe_event = events.recv() => Wake::Queue(maybe_event),
            };
            match wake {
                Wake::Reconcile => self.reconcile().await?,
                Wake::Summary => self.broadcast_summary(),
                Wake::Interrupt => {
                    info!("Shutdown signal received. Stopping engine...");
                    self.shutdown().await?;
                    break;
                }
                Wake::Queue(Some(mut event)) => loop {
                    match self.process_event(event, &mut events).await? {
                        Flow::Done => break,
                        Flow::Next(next) => event = next,
                        Flow::Stop => {
                            self.shutdown().await?;
                            return Ok(());
                        }
                    }
                },
                Wake::Queue(None) => {
                    warn!("Event queue closed; shutting down");
                    self.shutdown().await?;
                    break;
                }
            }
        }
        Ok(())
    }

    /// Process one event to completion. Ticker updates are coalesced to
    /// latest-wins: grid recomputation is a function of current state, not a
    /// delta, so intermediate prices carry no information.
    async fn process_event(
        &mut self,
        event: EngineEvent,
        queue: &mut mpsc::Receiver<EngineEvent>,
    ) -> Result<Flow> {
        match event {
            EngineEvent::Ticker(mut tick) => {
                let mut follow = None;
                while let Ok(next) = queue.try_recv() {
                    match next {
                        EngineEvent::Ticker(newer) => tick = newer,
                        other => {
                            follow = Some(other);
                            break;
                        }
                    }
                }
                self.handle_ticker(tick).await?;
                Ok(match follow {
                    Some(next) => Flow::Next(next),
                    None => Flow::Done,
                })
            }
            EngineEvent::Execution(event) => {
                self.handle_execution(&event).await?;
                Ok(Flow::Done)
            }
            EngineEvent::ConnectionLost => {
                warn!("Feed connection lost; pausing placements");
                self.feed_connected = false;
                if self.lifecycle.state() == BotState::Ready {
                    self.lifecycle.transition_to(BotState::Connecting)?;
                }
                self.notifier
                    .notify(Severity::Warning, "Feed connection lost");
                Ok(Flow::Done)
            }
            EngineEvent::ConnectionRestored => {
                info!("Feed connection restored; resyncing");
                self.feed_connected = true;
                if self.lifecycle.state() == BotState::Connecting {
                    self.lifecycle.transition_to(BotState::SyncingState)?;
                    self.reconcile().await?;
                    self.lifecycle.transition_to(BotState::Ready)?;
                }
                self.notifier
                    .notify(Severity::Info, "Feed connection restored");
                Ok(Flow::Done)
            }
            EngineEvent::Shutdown => Ok(Flow::Stop),
        }
    }

    // --- startup -------------------------------------------------------------

    async fn startup(&mut self) -> Result<()> {
        info!(
            "Initiating {} v{} ({} on {})",
            self.config.name,
            env!("CARGO_PKG_VERSION"),
            self.config.strategy,
            self.config.symbol()
        );
        let userref = self.config.userref;

        if let Some(mut state) = self.store.load_state(userref).await.map_err(anyhow_store)? {
            let drift = self.settings_drifted().await?;
            if drift {
                // Operator changed the grid parameters; adopt the new amount.
                state.amount_per_grid = self.config.amount_per_grid;
            }
            self.ledger.restore_state(state);
        } else {
            self.settings_drifted().await?;
        }

        let orders = self
            .store
            .load_orders(userref)
            .await
            .map_err(anyhow_store)?;
        let live: Vec<Order> = orders.into_iter().filter(|o| o.is_live()).collect();
        info!("Restored {} live orders from the store", live.len());
        self.ledger.restore_orders(live);
        self.ledger.restore_surplus(
            self.store
                .load_surplus(userref)
                .await
                .map_err(anyhow_store)?,
        );
        self.unsold = self
            .store
            .load_unsold(userref)
            .await
            .map_err(anyhow_store)?;

        self.lifecycle.transition_to(BotState::Connecting)?;
        let gateway = Arc::clone(&self.gateway);
        with_backoff(
            "query_balance",
            MAX_ORDER_RETRIES,
            GatewayError::is_retryable,
            move || {
                let gateway = Arc::clone(&gateway);
                async move { gateway.query_balance().await }
            },
        )
        .await
        .map_err(|e| anyhow::anyhow!("exchange unreachable during startup: {e}"))?;

        self.lifecycle.transition_to(BotState::SyncingState)?;
        let drift = self.pending_rebuild;
        self.reconcile().await?;
        if drift {
            info!("Grid parameters changed; cancelling all open buy orders...");
            self.cancel_all_open_buys().await?;
            self.pending_rebuild = false;
        }

        self.lifecycle.transition_to(BotState::Ready)?;
        info!("Algorithm is ready to trade!");
        Ok(())
    }

    /// Compare configured grid parameters with the persisted ones and write
    /// the current values back. A change invalidates the open buy ladder.
    async fn settings_drifted(&mut self) -> Result<bool> {
        let userref = self.config.userref;
        let current = GridSettings {
            interval: self.config.interval,
            amount_per_grid: self.config.amount_per_grid,
        };
        let drifted = match self
            .store
            .load_settings(userref)
            .await
            .map_err(anyhow_store)?
        {
            Some(stored) => stored != current,
            None => false,
        };
        self.store
            .save_settings(userref, current)
            .await
            .map_err(anyhow_store)?;
        self.pending_rebuild = drifted;
        Ok(drifted)
    }

    // --- ticker --------------------------------------------------------------

    async fn handle_ticker(&mut self, tick: PriceTick) -> Result<()> {
        self.last_price = tick.last;
        if !self.lifecycle.is_ready() || !self.feed_connected {
            debug!(price = tick.last, "Recording price while not trading");
            return Ok(());
        }

        let gateway = Arc::clone(&self.gateway);
        let balances = match with_backoff(
            "query_balance",
            MAX_ORDER_RETRIES,
            GatewayError::is_retryable,
            move || {
                let gateway = Arc::clone(&gateway);
                async move { gateway.query_balance().await }
            },
        )
        .await
        {
            Ok(balances) => balances,
            Err(e) => {
                warn!(error = %e, "Skipping tick: balances unavailable");
                return Ok(());
            }
        };

        // Sell decisions owed from earlier failures come first.
        self.flush_unsold().await?;

        if let Some((decision, consumed)) = self.ledger.flush_surplus(self.last_price) {
            info!(
                "Collected enough surplus from partly filled buy orders for a sell of {} @ {}",
                decision.volume, decision.price
            );
            for record in &consumed {
                let id = record.id;
                let store = Arc::clone(&self.store);
                let userref = self.config.userref;
                self.persist("delete surplus", move || {
                    let store = Arc::clone(&store);
                    async move { store.delete_surplus(userref, id).await }
                })
                .await?;
            }
            self.submit_sell(&decision).await?;
        }

        if let Some(new_amount) = self.ledger.maybe_reinvest() {
            info!(amount = new_amount, "Reinvesting accumulated proceeds");
            self.notifier.notify(
                Severity::Info,
                format!(
                    "{}: amount per grid increased to {:.2} {}",
                    self.config.symbol(),
                    new_amount,
                    self.config.quote_currency
                ),
            );
            self.persist_state().await?;
        }

        // Shift up: the ladder is too far below the market.
        let open_buys = self.ledger.open_buy_prices();
        let view = self.market_view(&open_buys, balances.base_available);
        if self.policy.should_shift_up(&view) {
            info!(price = tick.last, "Price ran above the grid; shifting buy orders up");
            self.notifier.notify(
                Severity::Info,
                format!("{}: shifting the buy grid up", self.config.symbol()),
            );
            self.cancel_all_open_buys().await?;
        }

        for client_id in self.ledger.near_buy_cancel_candidates() {
            debug!(order = %client_id, "Cancelling buy too close to a neighbour");
            self.cancel_order(&client_id).await?;
        }
        for client_id in self.ledger.excess_buy_cancel_candidates() {
            debug!(order = %client_id, "Cancelling buy beyond the ladder target");
            self.cancel_order(&client_id).await?;
        }

        // SWING: sell prior accumulation once the price has risen past it.
        let open_buys = self.ledger.open_buy_prices();
        let view = self.market_view(&open_buys, balances.base_available);
        if let Some(decision) = self.policy.extra_sell(&view) {
            self.notifier.notify(
                Severity::Info,
                format!("{}: placing extra sell order", self.config.symbol()),
            );
            self.submit_sell(&decision).await?;
        }

        self.top_up_buys(balances.quote_available).await?;
        Ok(())
    }

    /// Replenish the buy ladder to its target size, newest level first.
    async fn top_up_buys(&mut self, mut quote_available: f64) -> Result<()> {
        if self.buys_paused {
            debug!("Buy placements paused; skipping top-up");
            return Ok(());
        }
        loop {
            if self.ledger.open_buy_count() >= self.config.n_open_buy_orders {
                return Ok(());
            }
            let required = self.ledger.state().amount_per_grid * (1.0 + self.config.fee_rate());
            if quote_available <= required {
                warn!(
                    available = quote_available,
                    required, "Not enough quote currency available to place buy order"
                );
                self.notifier.notify(
                    Severity::Warning,
                    format!(
                        "{}: not enough {} to extend the buy grid",
                        self.config.symbol(),
                        self.config.quote_currency
                    ),
                );
                return Ok(());
            }

            let open_buys = self.ledger.open_buy_prices();
            let view = self.market_view(&open_buys, 0.0);
            let Some(price) = self.policy.buy_levels(&view).first().copied() else {
                return Ok(());
            };
            let volume =
                strategy::common::buy_volume(self.ledger.state().amount_per_grid, price);
            let candidate = OrderCandidate {
                side: OrderSide::Buy,
                price,
                volume,
            };
            match self.ledger.place(&candidate) {
                PlaceOutcome::Admitted(order) => {
                    let cost = order.price * order.volume;
                    match self.submit_placement(&order).await? {
                        Placement::Submitted => quote_available -= cost,
                        Placement::Rejected | Placement::Unknown => return Ok(()),
                    }
                }
                PlaceOutcome::Skipped(reason) => {
                    match reason {
                        SkipReason::MaxInvestmentReached => {
                            debug!("Max investment reached; not extending the buy grid")
                        }
                        other => debug!(reason = %other, "Skipping buy placement"),
                    }
                    return Ok(());
                }
            }
        }
    }

    // --- execution events ----------------------------------------------------

    async fn handle_execution(&mut self, event: &ExecutionEvent) -> Result<()> {
        let update = self
            .ledger
            .apply_execution_event(event, &*self.policy, self.last_price)?;
        match update {
            LedgerUpdate::Accepted(order) => {
                if let Some(audit) = &self.audit {
                    audit.log_ack(&order);
                }
                self.persist_order(&order).await?;
            }
            LedgerUpdate::PartialFill(order) => {
                info!(
                    order = %order.client_id, filled = order.filled, volume = order.volume,
                    "Order partially filled"
                );
                self.persist_order(&order).await?;
                self.persist_state().await?;
            }
            LedgerUpdate::BuyFilled { order, sell } => {
                if let Some(audit) = &self.audit {
                    audit.log_fill(&order);
                }
                self.notify_filled(&order);
                self.persist_order(&order).await?;
                self.persist_state().await?;
                if let Some(decision) = sell {
                    self.submit_sell(&decision).await?;
                }
            }
            LedgerUpdate::SellFilled(order) => {
                if let Some(audit) = &self.audit {
                    audit.log_fill(&order);
                }
                self.notify_filled(&order);
                self.persist_order(&order).await?;
                self.persist_state().await?;
            }
            LedgerUpdate::Cancelled { order, surplus } => {
                if let Some(audit) = &self.audit {
                    audit.log_cancel(&order);
                }
                self.persist_order(&order).await?;
                if let Some(record) = surplus {
                    info!(
                        order = %order.client_id, volume = record.volume,
                        "Order was partly filled; saving the executed volume as surplus"
                    );
                    let store = Arc::clone(&self.store);
                    let userref = self.config.userref;
                    let to_insert = record.clone();
                    self.persist("insert surplus", move || {
                        let store = Arc::clone(&store);
                        let record = to_insert.clone();
                        async move { store.insert_surplus(userref, &record).await }
                    })
                    .await?;
                }
            }
            LedgerUpdate::Failed(order) => {
                self.persist_order(&order).await?;
            }
            LedgerUpdate::Duplicate => {
                debug!(order = %event.order_id, "Duplicate execution event discarded");
            }
            LedgerUpdate::Untracked => {
                debug!(
                    order = %event.order_id,
                    "Execution event for untracked order; reconciliation will adopt it if ours"
                );
            }
        }
        Ok(())
    }

    fn notify_filled(&self, order: &Order) {
        self.notifier.notify(
            Severity::Info,
            format!(
                "{}: {} order executed\n ├ Price » {} {}\n ├ Size » {} {}\n └ Size in {} » {:.2}",
                self.config.symbol(),
                order.side,
                order.price,
                self.config.quote_currency,
                order.filled,
                self.config.base_currency,
                self.config.quote_currency,
                order.price * order.filled,
            ),
        );
    }

    // --- order submission ----------------------------------------------------

    /// Push an admitted order out to the exchange. Rate limits back off and
    /// retry; rejections fail the order (and pause buys); network failures
    /// leave it pending for reconciliation to resolve.
    async fn submit_placement(&mut self, order: &Order) -> Result<Placement> {
        self.persist_order(order).await?;
        if let Some(audit) = &self.audit {
            audit.log_request(order);
        }
        info!(
            "Placing order to {} {} {} @ {} {}",
            order.side,
            order.volume,
            self.config.base_currency,
            order.price,
            self.config.quote_currency
        );

        let request = PlaceRequest {
            side: order.side,
            price: order.price,
            volume: order.volume,
            client_id: order.client_id,
            userref: order.userref,
        };
        let gateway = Arc::clone(&self.gateway);
        let result = with_backoff(
            "place",
            MAX_ORDER_RETRIES,
            GatewayError::is_retryable_for_place,
            move || {
                let gateway = Arc::clone(&gateway);
                let request = request.clone();
                async move { gateway.place(&request).await }
            },
        )
        .await;

        match result {
            Ok(ack) => {
                let order = self.ledger.acknowledge(&order.client_id, &ack.exchange_id)?;
                if let Some(audit) = &self.audit {
                    audit.log_ack(&order);
                }
                self.persist_order(&order).await?;
                Ok(Placement::Submitted)
            }
            Err(GatewayError::Rejected(reason)) => {
                let order = self.ledger.mark_failed(&order.client_id)?;
                self.persist_order(&order).await?;
                if order.side.is_buy() {
                    self.buys_paused = true;
                    self.notifier.notify(
                        Severity::Warning,
                        format!(
                            "{}: buy order rejected ({reason}); pausing buy placements",
                            self.config.symbol()
                        ),
                    );
                } else {
                    self.notifier.notify(
                        Severity::Warning,
                        format!(
                            "{}: not enough {} to sell {} for {} {}",
                            self.config.symbol(),
                            self.config.base_currency,
                            order.volume,
                            order.price,
                            self.config.quote_currency
                        ),
                    );
                }
                Ok(Placement::Rejected)
            }
            Err(e) => {
                warn!(
                    order = %order.client_id, error = %e,
                    "Placement outcome unknown; deferring to reconciliation"
                );
                Ok(Placement::Unknown)
            }
        }
    }

    /// Submit a sell decision. A rejection or exhausted submission is queued
    /// durably and retried every pass until it lands; the executed buy volume
    /// behind it is never dropped.
    async fn submit_sell(&mut self, decision: &SellDecision) -> Result<()> {
        let candidate = OrderCandidate {
            side: OrderSide::Sell,
            price: decision.price,
            volume: decision.volume,
        };
        match self.ledger.place(&candidate) {
            PlaceOutcome::Admitted(order) => match self.submit_placement(&order).await? {
                Placement::Submitted | Placement::Unknown => Ok(()),
                Placement::Rejected => {
                    self.record_unsold(decision.price, decision.volume).await
                }
            },
            PlaceOutcome::Skipped(SkipReason::DuplicateLevel) => {
                debug!(price = decision.price, "Sell level already occupied");
                Ok(())
            }
            PlaceOutcome::Skipped(reason) => {
                warn!(reason = %reason, "Sell decision not placeable; queuing for retry");
                self.record_unsold(decision.price, decision.volume).await
            }
        }
    }

    async fn record_unsold(&mut self, price: f64, volume: f64) -> Result<()> {
        let record = UnsoldRecord::new(price, volume);
        let store = Arc::clone(&self.store);
        let userref = self.config.userref;
        let to_insert = record.clone();
        self.persist("insert unsold", move || {
            let store = Arc::clone(&store);
            let record = to_insert.clone();
            async move { store.insert_unsold(userref, &record).await }
        })
        .await?;
        self.unsold.push(record);
        Ok(())
    }

    /// Retry every owed sell decision. Ones that land (or whose level is
    /// already occupied) leave the queue.
    async fn flush_unsold(&mut self) -> Result<()> {
        if self.unsold.is_empty() {
            return Ok(());
        }
        let pending = self.unsold.clone();
        for record in pending {
            let candidate = OrderCandidate {
                side: OrderSide::Sell,
                price: record.price,
                volume: record.volume,
            };
            let settled = match self.ledger.place(&candidate) {
                PlaceOutcome::Admitted(order) => matches!(
                    self.submit_placement(&order).await?,
                    Placement::Submitted
                ),
                PlaceOutcome::Skipped(SkipReason::DuplicateLevel) => true,
                PlaceOutcome::Skipped(reason) => {
                    debug!(reason = %reason, "Unsold record still not placeable");
                    false
                }
            };
            if settled {
                let id = record.id;
                let store = Arc::clone(&self.store);
                let userref = self.config.userref;
                self.persist("delete unsold", move || {
                    let store = Arc::clone(&store);
                    async move { store.delete_unsold(userref, id).await }
                })
                .await?;
                self.unsold.retain(|r| r.id != record.id);
            }
        }
        Ok(())
    }

    // --- cancellation --------------------------------------------------------

    async fn cancel_all_open_buys(&mut self) -> Result<()> {
        for client_id in self.ledger.live_buy_ids() {
            self.cancel_order(&client_id).await?;
        }
        Ok(())
    }

    /// Cancel one order and wait for the gateway's acknowledgment before the
    /// ledger transition is applied.
    async fn cancel_order(&mut self, client_id: &ClientOrderId) -> Result<()> {
        let Some(order) = self.ledger.order(client_id).cloned() else {
            return Ok(());
        };
        if !order.is_live() {
            return Ok(());
        }

        match &order.exchange_id {
            Some(exchange_id) => {
                info!("Cancelling order '{}'", exchange_id);
                let gateway = Arc::clone(&self.gateway);
                let id = exchange_id.clone();
                let result = with_backoff(
                    "cancel",
                    MAX_ORDER_RETRIES,
                    GatewayError::is_retryable,
                    move || {
                        let gateway = Arc::clone(&gateway);
                        let id = id.clone();
                        async move { gateway.cancel(&id).await }
                    },
                )
                .await;

                match result {
                    Ok(()) => {
                        let event = ExecutionEvent {
                            order_id: exchange_id.clone(),
                            kind: ExecutionKind::Cancelled,
                            filled_delta: 0.0,
                            price: 0.0,
                            timestamp: Utc::now(),
                        };
                        self.handle_execution(&event).await?;
                    }
                    Err(GatewayError::Rejected(reason)) => {
                        // Most likely already closed upstream; the next
                        // reconciliation resolves its real outcome.
                        info!(
                            order = %exchange_id, reason = %reason,
                            "Cancel rejected; leaving the order for reconciliation"
                        );
                    }
                    Err(e) => {
                        warn!(
                            order = %exchange_id, error = %e,
                            "Cancel outcome unknown; reconciliation will resolve it"
                        );
                    }
                }
            }
            None => {
                // Never acknowledged: nothing can rest upstream yet.
                let order = self.ledger.mark_failed(client_id)?;
                self.persist_order(&order).await?;
            }
        }
        Ok(())
    }

    // --- reconciliation ------------------------------------------------------

    /// Periodic self-healing: compare the ledger with the exchange's open
    /// orders, adopt unknown orders carrying our userref, and resolve
    /// locally-live orders the exchange no longer shows.
    async fn reconcile(&mut self) -> Result<()> {
        debug!("Syncing the local orderbook with upstream...");
        let gateway = Arc::clone(&self.gateway);
        let userref = self.config.userref;
        let snapshot = match with_backoff(
            "query_open_orders",
            MAX_ORDER_RETRIES,
            GatewayError::is_retryable,
            move || {
                let gateway = Arc::clone(&gateway);
                async move { gateway.query_open_orders(userref).await }
            },
        )
        .await
        {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "Reconciliation skipped: open orders unavailable");
                return Ok(());
            }
        };

        let report = self.ledger.reconcile_snapshot(&snapshot);
        for order in &report.adopted {
            info!(order = ?order.exchange_id, "Adopted upstream order into the local orderbook");
            self.persist_order(order).await?;
        }
        for order in &report.acknowledged {
            self.persist_order(order).await?;
        }
        for order in &report.expired {
            warn!(order = %order.client_id, "Placement never landed upstream");
            self.persist_order(order).await?;
            if order.side.is_sell() {
                // The owed sell must not vanish with the failed placement.
                self.record_unsold(order.price, order.volume).await?;
            }
        }

        for order in report.missing {
            let exchange_id = order
                .exchange_id
                .clone()
                .expect("missing orders are acknowledged");
            let gateway = Arc::clone(&self.gateway);
            let query_id = exchange_id.clone();
            let lookup = match with_backoff(
                "query_order",
                MAX_ORDER_RETRIES,
                GatewayError::is_retryable,
                move || {
                    let gateway = Arc::clone(&gateway);
                    let id = query_id.clone();
                    async move { gateway.query_order(&id).await }
                },
            )
            .await
            {
                Ok(lookup) => lookup,
                Err(e) => {
                    warn!(order = %exchange_id, error = %e, "Status query failed; retrying next pass");
                    continue;
                }
            };

            match lookup {
                Some(resolved) if resolved.status == LookupStatus::Filled => {
                    info!(order = %exchange_id, "Missed fill recovered by reconciliation");
                    let delta = if resolved.filled > order.filled {
                        resolved.filled - order.filled
                    } else {
                        order.remaining()
                    };
                    let event = ExecutionEvent {
                        order_id: exchange_id,
                        kind: ExecutionKind::Fill,
                        filled_delta: delta,
                        price: if resolved.price > 0.0 {
                            resolved.price
                        } else {
                            order.price
                        },
                        timestamp: Utc::now(),
                    };
                    self.handle_execution(&event).await?;
                }
                Some(resolved) if resolved.status == LookupStatus::Open => {
                    // Raced the snapshot; still resting.
                }
                _ => {
                    info!(order = %exchange_id, "Order closed upstream; applying cancellation");
                    let event = ExecutionEvent {
                        order_id: exchange_id,
                        kind: ExecutionKind::Cancelled,
                        filled_delta: 0.0,
                        price: 0.0,
                        timestamp: Utc::now(),
                    };
                    self.handle_execution(&event).await?;
                }
            }
        }

        if self.buys_paused {
            info!("Reconciliation pass complete; resuming buy placements");
            self.buys_paused = false;
        }
        self.persist_state().await?;
        Ok(())
    }

    // --- persistence ---------------------------------------------------------

    async fn persist_order(&self, order: &Order) -> Result<()> {
        let store = Arc::clone(&self.store);
        let order = order.clone();
        self.persist("upsert order", move || {
            let store = Arc::clone(&store);
            let order = order.clone();
            async move { store.upsert_order(&order).await }
        })
        .await
    }

    async fn persist_state(&self) -> Result<()> {
        let store = Arc::clone(&self.store);
        let userref = self.config.userref;
        let state = self.ledger.state().clone();
        self.persist("save state", move || {
            let store = Arc::clone(&store);
            let state = state.clone();
            async move { store.save_state(userref, &state).await }
        })
        .await
    }

    /// Retry a persistence write with backoff. Exhaustion is fatal: the
    /// process must not keep trading on state it cannot record.
    async fn persist<F, Fut>(&self, label: &str, mut op: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), StoreError>>,
    {
        let mut delay = RETRY_BASE_DELAY;
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < PERSIST_RETRIES => {
                    warn!(
                        write = label, attempt, error = %e,
                        "Persistence write failed, retrying after {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => {
                    error!(write = label, error = %e, "Persistence unavailable; halting");
                    self.notifier.notify(
                        Severity::Error,
                        format!("{}: persistence unavailable, halting", self.config.name),
                    );
                    return Err(e.into());
                }
            }
        }
    }

    // --- status --------------------------------------------------------------

    fn market_view<'a>(&'a self, open_buys: &'a [f64], base_available: f64) -> MarketView<'a> {
        MarketView {
            last_price: self.last_price,
            state: self.ledger.state(),
            open_buy_prices: open_buys,
            open_sell_count: self.ledger.open_sell_count(),
            base_available,
        }
    }

    fn broadcast_summary(&self) {
        self.notifier.summary(BotSummary {
            name: self.config.name.clone(),
            symbol: self.config.symbol(),
            last_price: self.last_price,
            open_buys: self.ledger.open_buy_count(),
            open_sells: self.ledger.open_sell_count(),
            investment: self.ledger.exposure(),
            max_investment: self.config.max_investment,
            amount_per_grid: self.ledger.state().amount_per_grid,
            surplus_volume: self.ledger.surplus_volume(),
        });
    }

    async fn shutdown(&mut self) -> Result<()> {
        // Open orders stay on the exchange; the ledger is durable and the
        // next start resumes from it.
        self.lifecycle.transition_to(BotState::ShuttingDown)?;
        self.persist_state().await?;
        self.notifier
            .notify(Severity::Info, format!("{} terminated.", self.config.name));
        info!("Engine stopped gracefully.");
        Ok(())
    }
}

fn anyhow_store(e: StoreError) -> anyhow::Error {
    anyhow::anyhow!("store unavailable during startup: {e}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StrategyKind;
    use crate::gateway::paper::PaperExchange;
    use crate::model::{ExchangeOrder, PairInfo};
    use crate::store::sqlite::SqliteStore;

    fn test_config(strategy: StrategyKind) -> GridConfig {
        GridConfig {
            name: "test-bot".to_string(),
            base_currency: "BTC".to_string(),
            quote_currency: "EUR".to_string(),
            strategy,
            interval: 0.04,
            amount_per_grid: 100.0,
            n_open_buy_orders: 5,
            max_investment: 1000.0,
            fee: Some(0.0),
            userref: 7,
            reinvest_threshold: None,
        }
    }

    fn test_pair() -> PairInfo {
        PairInfo {
            price_decimals: 1,
            volume_decimals: 8,
            min_volume: 0.0,
            maker_fee: 0.0,
        }
    }

    struct TestRig {
        engine: Engine,
        paper: Arc<PaperExchange>,
        // Keeps the queue alive so try_recv sees an empty (not closed) queue.
        _tx: mpsc::Sender<EngineEvent>,
        rx: mpsc::Receiver<EngineEvent>,
    }

    async fn test_engine(strategy: StrategyKind) -> TestRig {
        let paper = Arc::new(PaperExchange::new(test_pair(), 10.0, 100_000.0));
        let store: Arc<dyn PersistenceStore> =
            Arc::new(SqliteStore::connect(None).await.unwrap());
        let (tx, rx) = mpsc::channel(64);
        let gateway: Arc<dyn ExchangeGateway> = paper.clone();
        let engine = Engine::new(test_config(strategy), gateway, store, Notifier::new(), None);
        TestRig {
            engine,
            paper,
            _tx: tx,
            rx,
        }
    }

    impl TestRig {
        async fn tick(&mut self, price: f64) {
            self.engine
                .process_event(
                    EngineEvent::Ticker(PriceTick {
                        last: price,
                        seq: 0,
                    }),
                    &mut self.rx,
                )
                .await
                .unwrap();
        }

        async fn pump_fills(&mut self, price: f64) {
            for event in self.paper.advance(price) {
                self.engine
                    .process_event(EngineEvent::Execution(event), &mut self.rx)
                    .await
                    .unwrap();
            }
        }

        async fn event(&mut self, event: EngineEvent) {
            self.engine.process_event(event, &mut self.rx).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_first_tick_builds_the_ladder() {
        let mut rig = test_engine(StrategyKind::GridHodl).await;
        rig.engine.startup().await.unwrap();

        rig.tick(50_000.0).await;

        assert_eq!(rig.engine.ledger.open_buy_count(), 5);
        assert_eq!(rig.paper.open_order_count(), 5);

        let mut prices = rig.engine.ledger.open_buy_prices();
        prices.sort_by(|a, b| b.partial_cmp(a).unwrap());
        assert!((prices[0] - 48_076.9).abs() < 0.1);
        for pair in prices.windows(2) {
            // One interval apart, descending.
            assert!((pair[0] / pair[1] - 1.04).abs() < 1e-3);
        }

        // Committed capital stays within the cap.
        assert!(rig.engine.ledger.exposure() <= 1000.0 + 1e-6);

        // A second identical tick changes nothing (idempotent placement).
        rig.tick(50_000.0).await;
        assert_eq!(rig.engine.ledger.open_buy_count(), 5);
        assert_eq!(rig.paper.open_order_count(), 5);
    }

    #[tokio::test]
    async fn test_buy_fill_places_counter_sell() {
        let mut rig = test_engine(StrategyKind::GridHodl).await;
        rig.engine.startup().await.unwrap();
        rig.tick(50_000.0).await;
        rig.tick(48_000.0).await;

        // Price crosses the top buy level.
        rig.pump_fills(48_000.0).await;

        assert_eq!(rig.engine.ledger.open_sell_count(), 1);
        let sells: Vec<f64> = rig
            .engine
            .ledger
            .live_orders()
            .filter(|o| o.side.is_sell())
            .map(|o| o.price)
            .collect();
        assert!((sells[0] - 50_000.0).abs() < 0.1); // 48,076.9 * 1.04

        // Next tick replenishes the ladder back to five buys.
        rig.tick(48_000.0).await;
        assert_eq!(rig.engine.ledger.open_buy_count(), 5);
        assert_eq!(rig.paper.open_order_count(), 6);
    }

    #[tokio::test]
    async fn test_rejected_buy_pauses_until_reconcile() {
        let mut rig = test_engine(StrategyKind::GridHodl).await;
        rig.engine.startup().await.unwrap();

        rig.paper
            .enqueue_failure(GatewayError::Rejected("insufficient funds".into()));
        rig.tick(50_000.0).await;

        assert!(rig.engine.buys_paused);
        assert_eq!(rig.paper.open_order_count(), 0);

        // Still paused on the next tick.
        rig.tick(50_000.0).await;
        assert_eq!(rig.paper.open_order_count(), 0);

        // A clean reconciliation lifts the pause.
        rig.engine.reconcile().await.unwrap();
        assert!(!rig.engine.buys_paused);
        rig.tick(50_000.0).await;
        assert_eq!(rig.paper.open_order_count(), 5);
    }

    #[tokio::test]
    async fn test_missed_fill_self_heals_via_reconciliation() {
        let mut rig = test_engine(StrategyKind::GridHodl).await;
        rig.engine.startup().await.unwrap();
        rig.tick(48_100.0).await;

        // The top ladder level (48,100 / 1.04 = 46,250) fills upstream but
        // the feed event is lost.
        let dropped = rig.paper.advance(46_000.0);
        assert_eq!(dropped.len(), 1);
        assert_eq!(rig.engine.ledger.open_sell_count(), 0);

        rig.engine.reconcile().await.unwrap();

        // The fill was recovered and the counter sell placed.
        assert_eq!(rig.engine.ledger.open_sell_count(), 1);
        assert!((rig.engine.ledger.state().total_invested - 100.0).abs() < 0.5);
    }

    #[tokio::test]
    async fn test_reconcile_adopts_upstream_orders_with_our_userref() {
        let mut rig = test_engine(StrategyKind::GridHodl).await;
        rig.engine.startup().await.unwrap();

        rig.paper.seed_resting_order(&ExchangeOrder {
            exchange_id: "EX-OURS".to_string(),
            client_id: None,
            userref: 7,
            side: OrderSide::Buy,
            price: 40_000.0,
            volume: 0.002,
            filled: 0.0,
        });
        rig.paper.seed_resting_order(&ExchangeOrder {
            exchange_id: "EX-THEIRS".to_string(),
            client_id: None,
            userref: 99,
            side: OrderSide::Buy,
            price: 41_000.0,
            volume: 0.002,
            filled: 0.0,
        });

        rig.engine.reconcile().await.unwrap();
        assert_eq!(rig.engine.ledger.open_buy_count(), 1);
        assert_eq!(
            rig.engine.ledger.open_buy_prices(),
            vec![40_000.0],
            "only the order tagged with our userref is adopted"
        );
    }

    #[tokio::test]
    async fn test_shift_up_reanchors_the_ladder() {
        let mut rig = test_engine(StrategyKind::GridHodl).await;
        rig.engine.startup().await.unwrap();
        rig.tick(50_000.0).await;
        let before = rig.engine.ledger.highest_open_buy().unwrap();
        assert!((before - 48_076.9).abs() < 0.1);

        // Far beyond highest * (1+i)^2 * 1.001.
        rig.tick(60_000.0).await;

        assert_eq!(rig.engine.ledger.open_buy_count(), 5);
        assert_eq!(rig.paper.open_order_count(), 5);
        let after = rig.engine.ledger.highest_open_buy().unwrap();
        assert!((after - 57_692.3).abs() < 0.1); // 60,000 / 1.04
    }

    #[tokio::test]
    async fn test_sell_rejection_queues_unsold_and_retries() {
        let mut rig = test_engine(StrategyKind::GridHodl).await;
        rig.engine.startup().await.unwrap();
        rig.tick(48_100.0).await;

        // The counter-sell placement gets rejected.
        rig.paper
            .enqueue_failure(GatewayError::Rejected("insufficient base funds".into()));
        rig.pump_fills(46_000.0).await;

        assert_eq!(rig.engine.ledger.open_sell_count(), 0);
        assert_eq!(rig.engine.unsold.len(), 1);

        // The owed sell goes out on the next pass.
        rig.tick(48_000.0).await;
        assert!(rig.engine.unsold.is_empty());
        assert_eq!(rig.engine.ledger.open_sell_count(), 1);
    }

    #[tokio::test]
    async fn test_restart_restores_ledger_from_store() {
        let paper = Arc::new(PaperExchange::new(test_pair(), 10.0, 100_000.0));
        let store: Arc<dyn PersistenceStore> =
            Arc::new(SqliteStore::connect(None).await.unwrap());
        let gateway: Arc<dyn ExchangeGateway> = paper.clone();

        let (tx1, rx1) = mpsc::channel(64);
        let mut first = TestRig {
            engine: Engine::new(
                test_config(StrategyKind::GridHodl),
                gateway.clone(),
                store.clone(),
                Notifier::new(),
                None,
            ),
            paper: paper.clone(),
            _tx: tx1,
            rx: rx1,
        };
        first.engine.startup().await.unwrap();
        first.tick(50_000.0).await;
        assert_eq!(first.engine.ledger.open_buy_count(), 5);
        drop(first);

        // A new process over the same store and exchange resumes seamlessly.
        let (tx2, rx2) = mpsc::channel(64);
        let mut second = TestRig {
            engine: Engine::new(
                test_config(StrategyKind::GridHodl),
                gateway,
                store,
                Notifier::new(),
                None,
            ),
            paper: paper.clone(),
            _tx: tx2,
            rx: rx2,
        };
        second.engine.startup().await.unwrap();
        assert_eq!(second.engine.ledger.open_buy_count(), 5);
        assert_eq!(paper.open_order_count(), 5);

        // And does not double-place anything.
        second.tick(50_000.0).await;
        assert_eq!(paper.open_order_count(), 5);
    }

    #[tokio::test]
    async fn test_shutdown_leaves_open_orders_on_the_exchange() {
        let mut rig = test_engine(StrategyKind::GridHodl).await;
        rig.engine.startup().await.unwrap();
        rig.tick(50_000.0).await;
        assert_eq!(rig.paper.open_order_count(), 5);

        rig.engine.shutdown().await.unwrap();
        assert_eq!(rig.paper.open_order_count(), 5);
        assert_eq!(rig.engine.lifecycle.state(), BotState::ShuttingDown);
    }

    #[tokio::test]
    async fn test_connection_loss_pauses_placements() {
        let mut rig = test_engine(StrategyKind::GridHodl).await;
        rig.engine.startup().await.unwrap();

        rig.event(EngineEvent::ConnectionLost).await;
        rig.tick(50_000.0).await;
        assert_eq!(rig.paper.open_order_count(), 0);

        rig.event(EngineEvent::ConnectionRestored).await;
        rig.tick(50_000.0).await;
        assert_eq!(rig.paper.open_order_count(), 5);
    }
}
