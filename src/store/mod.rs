pub mod sqlite;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::ledger::StrategyState;
use crate::model::{Order, SurplusRecord, UnsoldRecord};

/// Grid parameters whose change across restarts forces the buy ladder to be
/// rebuilt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridSettings {
    pub interval: f64,
    pub amount_per_grid: f64,
}

/// Durable CRUD for orders, strategy state, surplus and unsold records.
/// Every query is scoped by userref so several bot instances can share one
/// database; a single instance owns its in-memory ledger exclusively.
#[async_trait]
pub trait PersistenceStore: Send + Sync {
    /// Atomic insert-or-update of one order's current state.
    async fn upsert_order(&self, order: &Order) -> Result<(), StoreError>;

    async fn load_orders(&self, userref: i64) -> Result<Vec<Order>, StoreError>;

    async fn save_state(&self, userref: i64, state: &StrategyState) -> Result<(), StoreError>;

    async fn load_state(&self, userref: i64) -> Result<Option<StrategyState>, StoreError>;

    async fn insert_surplus(&self, userref: i64, record: &SurplusRecord)
        -> Result<(), StoreError>;

    async fn delete_surplus(&self, userref: i64, id: Uuid) -> Result<(), StoreError>;

    async fn load_surplus(&self, userref: i64) -> Result<Vec<SurplusRecord>, StoreError>;

    async fn insert_unsold(&self, userref: i64, record: &UnsoldRecord) -> Result<(), StoreError>;

    async fn delete_unsold(&self, userref: i64, id: Uuid) -> Result<(), StoreError>;

    async fn load_unsold(&self, userref: i64) -> Result<Vec<UnsoldRecord>, StoreError>;

    async fn save_settings(&self, userref: i64, settings: GridSettings) -> Result<(), StoreError>;

    async fn load_settings(&self, userref: i64) -> Result<Option<GridSettings>, StoreError>;
}
