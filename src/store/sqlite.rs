use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tracing::info;
use uuid::Uuid;

use super::{GridSettings, PersistenceStore};
use crate::error::StoreError;
use crate::ledger::StrategyState;
use crate::model::{ClientOrderId, Order, SurplusRecord, UnsoldRecord};

/// SQLite-backed store. The schema is created on connect; all tables carry a
/// userref column so instances trading different pairs can share the file.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn connect(sqlite_file: Option<&str>) -> Result<Self, StoreError> {
        let options = match sqlite_file {
            Some(path) => SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true),
            None => SqliteConnectOptions::from_str("sqlite::memory:")?,
        };
        // A single connection keeps writes serialized (and an in-memory
        // database alive).
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        info!(
            file = sqlite_file.unwrap_or(":memory:"),
            "Database initialized"
        );
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                client_id     TEXT PRIMARY KEY,
                exchange_id   TEXT,
                userref       INTEGER NOT NULL,
                side          TEXT NOT NULL,
                price         REAL NOT NULL,
                volume        REAL NOT NULL,
                filled        REAL NOT NULL,
                status        TEXT NOT NULL,
                created_at    TEXT NOT NULL,
                last_event_at TEXT
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS strategy_state (
                userref           INTEGER PRIMARY KEY,
                amount_per_grid   REAL NOT NULL,
                highest_buy_price REAL NOT NULL,
                total_invested    REAL NOT NULL,
                reinvest_proceeds REAL NOT NULL,
                open_sell_volume  REAL NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS surplus (
                id         TEXT PRIMARY KEY,
                userref    INTEGER NOT NULL,
                volume     REAL NOT NULL,
                price      REAL NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS unsold (
                id      TEXT PRIMARY KEY,
                userref INTEGER NOT NULL,
                price   REAL NOT NULL,
                volume  REAL NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS grid_settings (
                userref         INTEGER PRIMARY KEY,
                interval        REAL NOT NULL,
                amount_per_grid REAL NOT NULL
            )
            "#,
        ];
        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp {raw:?}: {e}")))
}

fn row_to_order(row: &sqlx::sqlite::SqliteRow) -> Result<Order, StoreError> {
    let client_id: String = row.try_get("client_id")?;
    let client_id = ClientOrderId::parse(&client_id)
        .ok_or_else(|| StoreError::Corrupt(format!("bad client id {client_id:?}")))?;
    let side: String = row.try_get("side")?;
    let status: String = row.try_get("status")?;
    let created_at: String = row.try_get("created_at")?;
    let last_event_at: Option<String> = row.try_get("last_event_at")?;

    Ok(Order {
        client_id,
        exchange_id: row.try_get("exchange_id")?,
        userref: row.try_get("userref")?,
        side: side.parse().map_err(StoreError::Corrupt)?,
        price: row.try_get("price")?,
        volume: row.try_get("volume")?,
        filled: row.try_get("filled")?,
        status: status.parse().map_err(StoreError::Corrupt)?,
        created_at: parse_timestamp(&created_at)?,
        last_event_at: last_event_at.as_deref().map(parse_timestamp).transpose()?,
    })
}

#[async_trait]
impl PersistenceStore for SqliteStore {
    async fn upsert_order(&self, order: &Order) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO orders
                (client_id, exchange_id, userref, side, price, volume, filled,
                 status, created_at, last_event_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ON CONFLICT(client_id) DO UPDATE SET
                exchange_id   = excluded.exchange_id,
                filled        = excluded.filled,
                status        = excluded.status,
                last_event_at = excluded.last_event_at
            "#,
        )
        .bind(order.client_id.to_string())
        .bind(order.exchange_id.clone())
        .bind(order.userref)
        .bind(order.side.to_string())
        .bind(order.price)
        .bind(order.volume)
        .bind(order.filled)
        .bind(order.status.to_string())
        .bind(order.created_at.to_rfc3339())
        .bind(order.last_event_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_orders(&self, userref: i64) -> Result<Vec<Order>, StoreError> {
        let rows = sqlx::query("SELECT * FROM orders WHERE userref = ?1")
            .bind(userref)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_order).collect()
    }

    async fn save_state(&self, userref: i64, state: &StrategyState) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO strategy_state
                (userref, amount_per_grid, highest_buy_price, total_invested,
                 reinvest_proceeds, open_sell_volume)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(userref) DO UPDATE SET
                amount_per_grid   = excluded.amount_per_grid,
                highest_buy_price = excluded.highest_buy_price,
                total_invested    = excluded.total_invested,
                reinvest_proceeds = excluded.reinvest_proceeds,
                open_sell_volume  = excluded.open_sell_volume
            "#,
        )
        .bind(userref)
        .bind(state.amount_per_grid)
        .bind(state.highest_buy_price)
        .bind(state.total_invested)
        .bind(state.reinvest_proceeds)
        .bind(state.open_sell_volume)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_state(&self, userref: i64) -> Result<Option<StrategyState>, StoreError> {
        let row = sqlx::query("SELECT * FROM strategy_state WHERE userref = ?1")
            .bind(userref)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(StrategyState {
                amount_per_grid: row.try_get("amount_per_grid")?,
                highest_buy_price: row.try_get("highest_buy_price")?,
                total_invested: row.try_get("total_invested")?,
                reinvest_proceeds: row.try_get("reinvest_proceeds")?,
                open_sell_volume: row.try_get("open_sell_volume")?,
            })),
            None => Ok(None),
        }
    }

    async fn insert_surplus(
        &self,
        userref: i64,
        record: &SurplusRecord,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO surplus (id, userref, volume, price, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(record.id.to_string())
        .bind(userref)
        .bind(record.volume)
        .bind(record.price)
        .bind(record.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_surplus(&self, userref: i64, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM surplus WHERE userref = ?1 AND id = ?2")
            .bind(userref)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_surplus(&self, userref: i64) -> Result<Vec<SurplusRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM surplus WHERE userref = ?1")
            .bind(userref)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let id: String = row.try_get("id")?;
                let created_at: String = row.try_get("created_at")?;
                Ok(SurplusRecord {
                    id: Uuid::parse_str(&id)
                        .map_err(|e| StoreError::Corrupt(format!("bad surplus id: {e}")))?,
                    volume: row.try_get("volume")?,
                    price: row.try_get("price")?,
                    created_at: parse_timestamp(&created_at)?,
                })
            })
            .collect()
    }

    async fn insert_unsold(&self, userref: i64, record: &UnsoldRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO unsold (id, userref, price, volume)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(record.id.to_string())
        .bind(userref)
        .bind(record.price)
        .bind(record.volume)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_unsold(&self, userref: i64, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM unsold WHERE userref = ?1 AND id = ?2")
            .bind(userref)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_unsold(&self, userref: i64) -> Result<Vec<UnsoldRecord>, StoreError> {
        let rows = sqlx::query("SELECT * FROM unsold WHERE userref = ?1")
            .bind(userref)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let id: String = row.try_get("id")?;
                Ok(UnsoldRecord {
                    id: Uuid::parse_str(&id)
                        .map_err(|e| StoreError::Corrupt(format!("bad unsold id: {e}")))?,
                    price: row.try_get("price")?,
                    volume: row.try_get("volume")?,
                })
            })
            .collect()
    }

    async fn save_settings(&self, userref: i64, settings: GridSettings) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO grid_settings (userref, interval, amount_per_grid)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(userref) DO UPDATE SET
                interval        = excluded.interval,
                amount_per_grid = excluded.amount_per_grid
            "#,
        )
        .bind(userref)
        .bind(settings.interval)
        .bind(settings.amount_per_grid)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_settings(&self, userref: i64) -> Result<Option<GridSettings>, StoreError> {
        let row = sqlx::query("SELECT * FROM grid_settings WHERE userref = ?1")
            .bind(userref)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(GridSettings {
                interval: row.try_get("interval")?,
                amount_per_grid: row.try_get("amount_per_grid")?,
            })),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OrderSide, OrderStatus};

    fn sample_order(userref: i64) -> Order {
        Order {
            client_id: ClientOrderId::new(),
            exchange_id: None,
            userref,
            side: OrderSide::Buy,
            price: 48_000.0,
            volume: 0.002,
            filled: 0.0,
            status: OrderStatus::Pending,
            created_at: Utc::now(),
            last_event_at: None,
        }
    }

    #[tokio::test]
    async fn test_order_upsert_is_atomic_per_client_id() {
        let store = SqliteStore::connect(None).await.unwrap();
        let mut order = sample_order(7);
        store.upsert_order(&order).await.unwrap();

        // Status transition lands as an update, not a second row.
        order.status = OrderStatus::Open;
        order.exchange_id = Some("EX-1".to_string());
        order.last_event_at = Some(Utc::now());
        store.upsert_order(&order).await.unwrap();

        let loaded = store.load_orders(7).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].status, OrderStatus::Open);
        assert_eq!(loaded[0].exchange_id.as_deref(), Some("EX-1"));
    }

    #[tokio::test]
    async fn test_orders_scoped_by_userref() {
        let store = SqliteStore::connect(None).await.unwrap();
        store.upsert_order(&sample_order(7)).await.unwrap();
        store.upsert_order(&sample_order(8)).await.unwrap();

        assert_eq!(store.load_orders(7).await.unwrap().len(), 1);
        assert_eq!(store.load_orders(8).await.unwrap().len(), 1);
        assert_eq!(store.load_orders(9).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_strategy_state_roundtrip() {
        let store = SqliteStore::connect(None).await.unwrap();
        assert!(store.load_state(7).await.unwrap().is_none());

        let state = StrategyState {
            amount_per_grid: 120.0,
            highest_buy_price: 48_000.0,
            total_invested: 300.0,
            reinvest_proceeds: 12.5,
            open_sell_volume: 0.004,
        };
        store.save_state(7, &state).await.unwrap();
        assert_eq!(store.load_state(7).await.unwrap().unwrap(), state);

        // Upsert overwrites in place.
        let mut newer = state.clone();
        newer.total_invested = 400.0;
        store.save_state(7, &newer).await.unwrap();
        assert_eq!(store.load_state(7).await.unwrap().unwrap(), newer);
    }

    #[tokio::test]
    async fn test_surplus_and_unsold_roundtrip() {
        let store = SqliteStore::connect(None).await.unwrap();
        let surplus = SurplusRecord::new(0.0012, 48_000.0);
        store.insert_surplus(7, &surplus).await.unwrap();
        // Idempotent insert.
        store.insert_surplus(7, &surplus).await.unwrap();
        assert_eq!(store.load_surplus(7).await.unwrap().len(), 1);

        store.delete_surplus(7, surplus.id).await.unwrap();
        assert!(store.load_surplus(7).await.unwrap().is_empty());

        let unsold = UnsoldRecord::new(49_920.0, 0.002);
        store.insert_unsold(7, &unsold).await.unwrap();
        let loaded = store.load_unsold(7).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].price, 49_920.0);
        store.delete_unsold(7, unsold.id).await.unwrap();
        assert!(store.load_unsold(7).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_settings_detect_drift_across_restart() {
        let store = SqliteStore::connect(None).await.unwrap();
        let settings = GridSettings {
            interval: 0.04,
            amount_per_grid: 100.0,
        };
        store.save_settings(7, settings).await.unwrap();
        assert_eq!(store.load_settings(7).await.unwrap().unwrap(), settings);

        let changed = GridSettings {
            interval: 0.02,
            amount_per_grid: 100.0,
        };
        store.save_settings(7, changed).await.unwrap();
        assert_eq!(store.load_settings(7).await.unwrap().unwrap(), changed);
    }

    #[tokio::test]
    async fn test_file_backed_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("grid.sqlite");
        let path_str = path.to_str().unwrap();

        {
            let store = SqliteStore::connect(Some(path_str)).await.unwrap();
            store.upsert_order(&sample_order(7)).await.unwrap();
        }
        let store = SqliteStore::connect(Some(path_str)).await.unwrap();
        assert_eq!(store.load_orders(7).await.unwrap().len(), 1);
    }
}
