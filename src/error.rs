use crate::model::OrderStatus;
use thiserror::Error;

/// Errors surfaced by the exchange gateway.
#[derive(Error, Debug, Clone)]
pub enum GatewayError {
    #[error("rate limited")]
    RateLimited,
    #[error("network error: {0}")]
    Network(String),
    /// Non-retryable rejection (insufficient balance, lot-size violation, ...).
    #[error("rejected: {0}")]
    Rejected(String),
}

impl GatewayError {
    /// Whether the call may simply be repeated. Placements are stricter, see
    /// [`GatewayError::is_retryable_for_place`].
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::RateLimited | GatewayError::Network(_))
    }

    /// A placement must not be blindly repeated after a network error: the
    /// order may have landed and retrying would double-place. Only rate
    /// limits are safe to retry; network outcomes stay unknown until the
    /// next reconciliation resolves them.
    pub fn is_retryable_for_place(&self) -> bool {
        matches!(self, GatewayError::RateLimited)
    }
}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("invalid order transition {from} -> {to} for order {order}")]
    InvalidTransition {
        order: String,
        from: OrderStatus,
        to: OrderStatus,
    },
    /// Should never occur; treated as fatal by the engine.
    #[error("ledger invariant violated: {0}")]
    InvariantViolation(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

#[derive(Error, Debug)]
pub enum BotError {
    #[error("config error: {0}")]
    ConfigError(#[from] std::io::Error),
    #[error("parsing error: {0}")]
    ParsingError(#[from] toml::de::Error),
    #[error("validation error: {0}")]
    ValidationError(String),
    #[error("lifecycle error: {0}")]
    LifecycleError(String),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}
