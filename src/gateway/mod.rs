pub mod paper;
pub mod retry;

use async_trait::async_trait;

use crate::error::GatewayError;
use crate::model::{ClientOrderId, ExchangeOrder, OrderSide, PairBalances, PairInfo};

/// A placement request carrying the client id the exchange echoes back, so
/// placements stay attributable across reconnects.
#[derive(Debug, Clone)]
pub struct PlaceRequest {
    pub side: OrderSide,
    pub price: f64,
    pub volume: f64,
    pub client_id: ClientOrderId,
    pub userref: i64,
}

#[derive(Debug, Clone)]
pub struct PlacedAck {
    pub exchange_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupStatus {
    Open,
    Filled,
    Cancelled,
}

/// Result of a targeted single-order status query.
#[derive(Debug, Clone)]
pub struct OrderLookup {
    pub status: LookupStatus,
    pub filled: f64,
    pub price: f64,
}

/// Synchronous-style request/response surface of the exchange. The wire
/// protocol behind it is a collaborator concern; implementations must tag
/// orders with the caller's userref so a shared account can be partitioned.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    async fn place(&self, request: &PlaceRequest) -> Result<PlacedAck, GatewayError>;

    async fn cancel(&self, exchange_id: &str) -> Result<(), GatewayError>;

    async fn query_open_orders(&self, userref: i64) -> Result<Vec<ExchangeOrder>, GatewayError>;

    async fn query_order(&self, exchange_id: &str) -> Result<Option<OrderLookup>, GatewayError>;

    async fn query_balance(&self) -> Result<PairBalances, GatewayError>;

    /// Precision and lot-size metadata for the traded pair.
    fn pair_info(&self) -> PairInfo;
}
