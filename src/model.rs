use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Client-side order id, assigned before the exchange acknowledges the order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientOrderId(Uuid);

impl ClientOrderId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl std::fmt::Display for ClientOrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn is_buy(&self) -> bool {
        matches!(self, OrderSide::Buy)
    }

    pub fn is_sell(&self) -> bool {
        matches!(self, OrderSide::Sell)
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "Buy"),
            OrderSide::Sell => write!(f, "Sell"),
        }
    }
}

impl std::str::FromStr for OrderSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Buy" => Ok(OrderSide::Buy),
            "Sell" => Ok(OrderSide::Sell),
            other => Err(format!("unknown order side: {other}")),
        }
    }
}

/// Order lifecycle. `Filled`, `Cancelled` and `Failed` are terminal; events
/// arriving against a terminal order are discarded as duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Failed,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Failed
        )
    }

    /// Valid lifecycle transitions. Anything else is rejected by the ledger.
    pub fn can_transition(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match (self, next) {
            (Pending, Open) | (Pending, Failed) => true,
            (Open, PartiallyFilled) | (Open, Filled) | (Open, Cancelled) => true,
            (PartiallyFilled, PartiallyFilled)
            | (PartiallyFilled, Filled)
            | (PartiallyFilled, Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderStatus::Pending => "Pending",
            OrderStatus::Open => "Open",
            OrderStatus::PartiallyFilled => "PartiallyFilled",
            OrderStatus::Filled => "Filled",
            OrderStatus::Cancelled => "Cancelled",
            OrderStatus::Failed => "Failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(OrderStatus::Pending),
            "Open" => Ok(OrderStatus::Open),
            "PartiallyFilled" => Ok(OrderStatus::PartiallyFilled),
            "Filled" => Ok(OrderStatus::Filled),
            "Cancelled" => Ok(OrderStatus::Cancelled),
            "Failed" => Ok(OrderStatus::Failed),
            other => Err(format!("unknown order status: {other}")),
        }
    }
}

/// A single tracked order. Owned and mutated exclusively by the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub client_id: ClientOrderId,
    /// Exchange-assigned id, known after acknowledgment.
    pub exchange_id: Option<String>,
    pub userref: i64,
    pub side: OrderSide,
    pub price: f64,
    pub volume: f64,
    pub filled: f64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    /// Timestamp of the last applied execution event, used to discard
    /// redelivered events.
    pub last_event_at: Option<DateTime<Utc>>,
}

impl Order {
    pub fn remaining(&self) -> f64 {
        (self.volume - self.filled).max(0.0)
    }

    /// Quote value still committed by this order.
    pub fn committed_quote(&self) -> f64 {
        self.price * self.remaining()
    }

    pub fn is_live(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// Latest observed price. Ephemeral, never persisted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceTick {
    pub last: f64,
    pub seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionKind {
    /// Exchange accepted the order and it is resting in the book.
    Accepted,
    /// A (partial) fill; `filled_delta` carries the executed base volume.
    Fill,
    Cancelled,
    Rejected,
}

/// One event from the execution feed. Delivery is at-least-once; the ledger
/// treats redelivery as a no-op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub order_id: String,
    pub kind: ExecutionKind,
    pub filled_delta: f64,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

/// One row of the exchange's open-order snapshot.
#[derive(Debug, Clone)]
pub struct ExchangeOrder {
    pub exchange_id: String,
    pub client_id: Option<ClientOrderId>,
    pub userref: i64,
    pub side: OrderSide,
    pub price: f64,
    pub volume: f64,
    pub filled: f64,
}

/// Price/volume precision and lot-size metadata for the traded pair,
/// supplied by the gateway rather than hardcoded.
#[derive(Debug, Clone, Copy)]
pub struct PairInfo {
    pub price_decimals: u32,
    pub volume_decimals: u32,
    /// Minimum base volume the exchange accepts per order.
    pub min_volume: f64,
    pub maker_fee: f64,
}

fn round_to_decimals(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

fn floor_to_decimals(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).floor() / factor
}

impl PairInfo {
    pub fn round_price(&self, price: f64) -> f64 {
        round_to_decimals(price, self.price_decimals)
    }

    /// Volumes are truncated, never rounded up, so an order can always be
    /// covered by the computed funds.
    pub fn round_volume(&self, volume: f64) -> f64 {
        floor_to_decimals(volume, self.volume_decimals)
    }

    /// Integer dedupe key for a price at this pair's precision.
    pub fn price_key(&self, price: f64) -> i64 {
        let factor = 10f64.powi(self.price_decimals as i32);
        (price * factor).round() as i64
    }
}

impl Default for PairInfo {
    fn default() -> Self {
        Self {
            price_decimals: 1,
            volume_decimals: 8,
            min_volume: 0.0,
            maker_fee: 0.0025,
        }
    }
}

/// Balances of the traded pair as reported by the exchange.
#[derive(Debug, Clone, Copy, Default)]
pub struct PairBalances {
    pub base_total: f64,
    pub base_available: f64,
    pub quote_total: f64,
    pub quote_available: f64,
}

/// Residual base volume left behind by a partially filled, then cancelled,
/// buy order. Consumed exactly once by a later sell placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SurplusRecord {
    pub id: Uuid,
    pub volume: f64,
    pub price: f64,
    pub created_at: DateTime<Utc>,
}

impl SurplusRecord {
    pub fn new(volume: f64, price: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            volume,
            price,
            created_at: Utc::now(),
        }
    }
}

/// A sell decision whose submission exhausted its retries. Kept durable and
/// retried until it goes through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnsoldRecord {
    pub id: Uuid,
    pub price: f64,
    pub volume: f64,
}

impl UnsoldRecord {
    pub fn new(price: f64, volume: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            price,
            volume,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states_reject_transitions() {
        for terminal in [
            OrderStatus::Filled,
            OrderStatus::Cancelled,
            OrderStatus::Failed,
        ] {
            assert!(terminal.is_terminal());
            for next in [
                OrderStatus::Pending,
                OrderStatus::Open,
                OrderStatus::PartiallyFilled,
                OrderStatus::Filled,
                OrderStatus::Cancelled,
                OrderStatus::Failed,
            ] {
                assert!(
                    !terminal.can_transition(next),
                    "{terminal} -> {next} must be rejected"
                );
            }
        }
    }

    #[test]
    fn test_lifecycle_happy_path() {
        assert!(OrderStatus::Pending.can_transition(OrderStatus::Open));
        assert!(OrderStatus::Open.can_transition(OrderStatus::PartiallyFilled));
        assert!(OrderStatus::PartiallyFilled.can_transition(OrderStatus::PartiallyFilled));
        assert!(OrderStatus::PartiallyFilled.can_transition(OrderStatus::Filled));
        assert!(OrderStatus::Open.can_transition(OrderStatus::Cancelled));
        assert!(OrderStatus::Pending.can_transition(OrderStatus::Failed));
        assert!(!OrderStatus::Pending.can_transition(OrderStatus::Filled));
        assert!(!OrderStatus::Open.can_transition(OrderStatus::Pending));
    }

    #[test]
    fn test_pair_info_rounding() {
        let info = PairInfo {
            price_decimals: 1,
            volume_decimals: 4,
            min_volume: 0.0001,
            maker_fee: 0.0025,
        };
        assert_eq!(info.round_price(49919.96), 49920.0);
        // Volume truncates down.
        assert_eq!(info.round_volume(0.00129999), 0.0012);
        assert_eq!(info.price_key(49920.0), 499200);
        assert_eq!(info.price_key(49920.04), 499200);
    }

    #[test]
    fn test_order_committed_quote_uses_remaining() {
        let order = Order {
            client_id: ClientOrderId::new(),
            exchange_id: None,
            userref: 1,
            side: OrderSide::Buy,
            price: 100.0,
            volume: 2.0,
            filled: 0.5,
            status: OrderStatus::PartiallyFilled,
            created_at: Utc::now(),
            last_event_at: None,
        };
        assert_eq!(order.remaining(), 1.5);
        assert_eq!(order.committed_quote(), 150.0);
    }
}
