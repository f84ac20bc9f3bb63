//! In-process simulated exchange. Limit orders rest in a book and fill when
//! the replayed price crosses them; used for dry runs and tests.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{ExchangeGateway, LookupStatus, OrderLookup, PlaceRequest, PlacedAck};
use crate::engine::EngineEvent;
use crate::error::GatewayError;
use crate::feed::TickerFeed;
use crate::model::{ExchangeOrder, ExecutionEvent, ExecutionKind, PairBalances, PairInfo};

struct Book {
    open: BTreeMap<String, PlaceRequest>,
    done: HashMap<String, OrderLookup>,
    next_id: u64,
    balances: PairBalances,
    /// Scripted errors returned by upcoming place/cancel calls, front first.
    /// Queries always succeed so failure scripts hit the call under test.
    fail_queue: VecDeque<GatewayError>,
}

pub struct PaperExchange {
    pair: PairInfo,
    inner: Mutex<Book>,
}

impl PaperExchange {
    pub fn new(pair: PairInfo, base_balance: f64, quote_balance: f64) -> Self {
        Self {
            pair,
            inner: Mutex::new(Book {
                open: BTreeMap::new(),
                done: HashMap::new(),
                next_id: 0,
                balances: PairBalances {
                    base_total: base_balance,
                    base_available: base_balance,
                    quote_total: quote_balance,
                    quote_available: quote_balance,
                },
                fail_queue: VecDeque::new(),
            }),
        }
    }

    /// Script the next place/cancel call to fail with `error`.
    pub fn enqueue_failure(&self, error: GatewayError) {
        self.inner.lock().unwrap().fail_queue.push_back(error);
    }

    /// Rest an order directly in the book, as if placed by another process
    /// sharing the account.
    pub fn seed_resting_order(&self, order: &ExchangeOrder) {
        let mut book = self.inner.lock().unwrap();
        book.open.insert(
            order.exchange_id.clone(),
            PlaceRequest {
                side: order.side,
                price: order.price,
                volume: order.volume,
                client_id: order.client_id.unwrap_or_else(crate::model::ClientOrderId::new),
                userref: order.userref,
            },
        );
    }

    pub fn open_order_count(&self) -> usize {
        self.inner.lock().unwrap().open.len()
    }

    /// Move the simulated market to `price`, filling every crossed order in
    /// full and returning the corresponding execution events.
    pub fn advance(&self, price: f64) -> Vec<ExecutionEvent> {
        let mut book = self.inner.lock().unwrap();
        let crossed: Vec<String> = book
            .open
            .iter()
            .filter(|(_, req)| match req.side {
                crate::model::OrderSide::Buy => price <= req.price,
                crate::model::OrderSide::Sell => price >= req.price,
            })
            .map(|(id, _)| id.clone())
            .collect();

        let mut events = Vec::with_capacity(crossed.len());
        for exchange_id in crossed {
            let request = book.open.remove(&exchange_id).expect("collected above");
            let value = request.price * request.volume;
            match request.side {
                crate::model::OrderSide::Buy => {
                    book.balances.quote_total -= value;
                    book.balances.base_total += request.volume;
                    book.balances.base_available += request.volume;
                }
                crate::model::OrderSide::Sell => {
                    book.balances.base_total -= request.volume;
                    book.balances.quote_total += value;
                    book.balances.quote_available += value;
                }
            }
            debug!(order = %exchange_id, side = %request.side, price = request.price,
                   "Paper fill");
            book.done.insert(
                exchange_id.clone(),
                OrderLookup {
                    status: LookupStatus::Filled,
                    filled: request.volume,
                    price: request.price,
                },
            );
            events.push(ExecutionEvent {
                order_id: exchange_id,
                kind: ExecutionKind::Fill,
                filled_delta: request.volume,
                price: request.price,
                timestamp: Utc::now(),
            });
        }
        events
    }

    fn next_failure(book: &mut Book) -> Option<GatewayError> {
        book.fail_queue.pop_front()
    }
}

#[async_trait]
impl ExchangeGateway for PaperExchange {
    async fn place(&self, request: &PlaceRequest) -> Result<PlacedAck, GatewayError> {
        let mut book = self.inner.lock().unwrap();
        if let Some(error) = Self::next_failure(&mut book) {
            return Err(error);
        }
        if request.volume < self.pair.min_volume {
            return Err(GatewayError::Rejected(format!(
                "volume {} below minimum lot {}",
                request.volume, self.pair.min_volume
            )));
        }
        match request.side {
            crate::model::OrderSide::Buy => {
                let cost = request.price * request.volume;
                if book.balances.quote_available < cost {
                    return Err(GatewayError::Rejected("insufficient quote funds".into()));
                }
                book.balances.quote_available -= cost;
            }
            crate::model::OrderSide::Sell => {
                if book.balances.base_available < request.volume {
                    return Err(GatewayError::Rejected("insufficient base funds".into()));
                }
                book.balances.base_available -= request.volume;
            }
        }
        book.next_id += 1;
        let exchange_id = format!("PX-{:08}", book.next_id);
        book.open.insert(exchange_id.clone(), request.clone());
        Ok(PlacedAck { exchange_id })
    }

    async fn cancel(&self, exchange_id: &str) -> Result<(), GatewayError> {
        let mut book = self.inner.lock().unwrap();
        if let Some(error) = Self::next_failure(&mut book) {
            return Err(error);
        }
        match book.open.remove(exchange_id) {
            Some(request) => {
                match request.side {
                    crate::model::OrderSide::Buy => {
                        book.balances.quote_available += request.price * request.volume;
                    }
                    crate::model::OrderSide::Sell => {
                        book.balances.base_available += request.volume;
                    }
                }
                book.done.insert(
                    exchange_id.to_string(),
                    OrderLookup {
                        status: LookupStatus::Cancelled,
                        filled: 0.0,
                        price: request.price,
                    },
                );
                Ok(())
            }
            None => Err(GatewayError::Rejected(format!(
                "unknown order {exchange_id}"
            ))),
        }
    }

    async fn query_open_orders(&self, userref: i64) -> Result<Vec<ExchangeOrder>, GatewayError> {
        let book = self.inner.lock().unwrap();
        Ok(book
            .open
            .iter()
            .filter(|(_, req)| req.userref == userref)
            .map(|(id, req)| ExchangeOrder {
                exchange_id: id.clone(),
                client_id: Some(req.client_id),
                userref: req.userref,
                side: req.side,
                price: req.price,
                volume: req.volume,
                filled: 0.0,
            })
            .collect())
    }

    async fn query_order(&self, exchange_id: &str) -> Result<Option<OrderLookup>, GatewayError> {
        let book = self.inner.lock().unwrap();
        if let Some(request) = book.open.get(exchange_id) {
            return Ok(Some(OrderLookup {
                status: LookupStatus::Open,
                filled: 0.0,
                price: request.price,
            }));
        }
        Ok(book.done.get(exchange_id).cloned())
    }

    async fn query_balance(&self) -> Result<PairBalances, GatewayError> {
        Ok(self.inner.lock().unwrap().balances)
    }

    fn pair_info(&self) -> PairInfo {
        self.pair
    }
}

/// Drive the paper exchange from a ticker feed: each tick first settles
/// crossed orders (their fills enter the queue ahead of the tick), then the
/// tick itself is forwarded. When the feed ends, the engine is asked to shut
/// down.
pub async fn run_paper_session(
    mut feed: Box<dyn TickerFeed>,
    exchange: Arc<PaperExchange>,
    tx: mpsc::Sender<EngineEvent>,
) {
    while let Some(tick) = feed.next_tick().await {
        for event in exchange.advance(tick.last) {
            if tx.send(EngineEvent::Execution(event)).await.is_err() {
                return;
            }
        }
        if tx.send(EngineEvent::Ticker(tick)).await.is_err() {
            return;
        }
    }
    info!("Ticker replay exhausted, requesting shutdown");
    let _ = tx.send(EngineEvent::Shutdown).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ClientOrderId, OrderSide};

    fn request(side: OrderSide, price: f64, volume: f64) -> PlaceRequest {
        PlaceRequest {
            side,
            price,
            volume,
            client_id: ClientOrderId::new(),
            userref: 7,
        }
    }

    #[tokio::test]
    async fn test_crossed_orders_fill_exactly_once() {
        let exchange = PaperExchange::new(PairInfo::default(), 1.0, 100_000.0);
        let ack = exchange
            .place(&request(OrderSide::Buy, 48_000.0, 0.002))
            .await
            .unwrap();

        // Price stays above the limit: nothing fills.
        assert!(exchange.advance(49_000.0).is_empty());

        let events = exchange.advance(47_900.0);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].order_id, ack.exchange_id);
        assert_eq!(events[0].kind, ExecutionKind::Fill);

        // Crossing again produces nothing new.
        assert!(exchange.advance(47_000.0).is_empty());

        let lookup = exchange.query_order(&ack.exchange_id).await.unwrap().unwrap();
        assert_eq!(lookup.status, LookupStatus::Filled);
    }

    #[tokio::test]
    async fn test_place_holds_and_cancel_releases_funds() {
        let exchange = PaperExchange::new(PairInfo::default(), 1.0, 100.0);
        let ack = exchange
            .place(&request(OrderSide::Buy, 48_000.0, 0.002))
            .await
            .unwrap();
        let balances = exchange.query_balance().await.unwrap();
        assert!((balances.quote_available - 4.0).abs() < 1e-9);

        // Second order cannot be funded.
        let err = exchange
            .place(&request(OrderSide::Buy, 48_000.5, 0.0021))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Rejected(_)));

        exchange.cancel(&ack.exchange_id).await.unwrap();
        let balances = exchange.query_balance().await.unwrap();
        assert!((balances.quote_available - 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_open_orders_scoped_by_userref() {
        let exchange = PaperExchange::new(PairInfo::default(), 1.0, 100_000.0);
        exchange
            .place(&request(OrderSide::Buy, 48_000.0, 0.002))
            .await
            .unwrap();
        let mut foreign = request(OrderSide::Buy, 47_000.0, 0.002);
        foreign.userref = 99;
        exchange.place(&foreign).await.unwrap();

        assert_eq!(exchange.query_open_orders(7).await.unwrap().len(), 1);
        assert_eq!(exchange.query_open_orders(99).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_scripted_failures_pop_in_order() {
        let exchange = PaperExchange::new(PairInfo::default(), 1.0, 100_000.0);
        exchange.enqueue_failure(GatewayError::RateLimited);

        let err = exchange
            .place(&request(OrderSide::Buy, 48_000.0, 0.002))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited));

        // Next call goes through.
        assert!(exchange
            .place(&request(OrderSide::Buy, 48_000.0, 0.002))
            .await
            .is_ok());
    }
}
