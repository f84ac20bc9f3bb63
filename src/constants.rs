//! Central configuration constants for infinity-grid-bot.
//!
//! This module contains all tunable parameters used throughout the bot.
//! Modify values here to adjust behavior without changing business logic.

use std::time::Duration;

// =============================================================================
// ORDER SUBMISSION
// =============================================================================

/// Maximum attempts for a retryable gateway call.
pub const MAX_ORDER_RETRIES: u32 = 5;

/// Initial backoff delay between retries; doubles per attempt.
pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Upper bound on a single outbound gateway call. Outcomes past this are
/// treated as unknown and resolved by the next reconciliation pass.
pub const GATEWAY_TIMEOUT: Duration = Duration::from_secs(10);

/// An order counts as fully filled once this fraction of its volume executed
/// (absorbs exchange-side rounding of the final partial fill).
pub const FILL_COMPLETE_RATIO: f64 = 0.9999;

// =============================================================================
// PERSISTENCE
// =============================================================================

/// Attempts before a failed persistence write halts the process.
pub const PERSIST_RETRIES: u32 = 5;

// =============================================================================
// GRID PARAMETERS
// =============================================================================

/// Extra 0.1% the price must exceed beyond two grid intervals before the buy
/// ladder is cancelled and re-anchored.
pub const SHIFT_UP_MARGIN: f64 = 1.001;

/// Maker fee assumed when neither the config nor the exchange supplies one.
pub const DEFAULT_MAKER_FEE: f64 = 0.0025;

// =============================================================================
// ENGINE TIMER INTERVALS
// =============================================================================

/// Interval for the periodic orderbook reconciliation against the exchange.
pub const RECONCILIATION_INTERVAL: Duration = Duration::from_secs(2 * 60);

/// Interval for broadcasting status summary updates.
pub const STATUS_SUMMARY_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Capacity of the serialized engine event queue.
pub const EVENT_QUEUE_CAPACITY: usize = 1024;
