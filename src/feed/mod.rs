pub mod replay;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use crate::engine::EngineEvent;
use crate::model::{ExecutionEvent, PriceTick};

/// Lazy, infinite, at-least-once price stream. Reconnection is the
/// implementation's concern; the core only sees connection signals through
/// the engine event queue.
#[async_trait]
pub trait TickerFeed: Send {
    /// Next tick, or `None` when the stream has ended for good.
    async fn next_tick(&mut self) -> Option<PriceTick>;
}

/// Lazy, infinite, at-least-once order execution stream. Redelivery must be
/// tolerated downstream; the ledger's transitions are idempotent.
#[async_trait]
pub trait ExecutionFeed: Send {
    async fn next_event(&mut self) -> Option<ExecutionEvent>;
}

/// Forward ticks into the serialized engine queue. A feed ending signals a
/// lost connection; live adapters reconnect internally and only ever end the
/// stream for good.
pub async fn run_ticker_pump(mut feed: Box<dyn TickerFeed>, tx: mpsc::Sender<EngineEvent>) {
    while let Some(tick) = feed.next_tick().await {
        if tx.send(EngineEvent::Ticker(tick)).await.is_err() {
            return;
        }
    }
    warn!("Ticker feed ended");
    let _ = tx.send(EngineEvent::ConnectionLost).await;
}

/// Forward execution events into the serialized engine queue, preserving
/// their arrival order.
pub async fn run_execution_pump(mut feed: Box<dyn ExecutionFeed>, tx: mpsc::Sender<EngineEvent>) {
    while let Some(event) = feed.next_event().await {
        if tx.send(EngineEvent::Execution(event)).await.is_err() {
            return;
        }
    }
    warn!("Execution feed ended");
    let _ = tx.send(EngineEvent::ConnectionLost).await;
}
