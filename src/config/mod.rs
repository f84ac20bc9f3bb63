use crate::error::BotError;
use std::fs;

pub mod creator;
pub mod grid;

use serde::{Deserialize, Serialize};

pub use grid::{GridConfig, StrategyKind};

/// Top-level configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    pub grid: GridConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub paper: PaperConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database file. `None` keeps everything in memory (useful for
    /// dry runs only; state will not survive a restart).
    pub sqlite_file: Option<String>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            sqlite_file: Some("infinity_grid.sqlite".to_string()),
        }
    }
}

/// Settings for the in-process paper exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperConfig {
    pub start_price: f64,
    pub base_balance: f64,
    pub quote_balance: f64,
    /// Optional CSV file with one price per row to replay as the ticker.
    pub price_csv: Option<String>,
    pub price_decimals: u32,
    pub volume_decimals: u32,
    pub min_volume: f64,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            start_price: 50_000.0,
            base_balance: 10.0,
            quote_balance: 100_000.0,
            price_csv: None,
            price_decimals: 1,
            volume_decimals: 8,
            min_volume: 0.0001,
        }
    }
}

pub fn load_config(path: &str) -> Result<BotConfig, BotError> {
    let content = fs::read_to_string(path)?;
    let config: BotConfig = toml::from_str(&content)?;
    config
        .grid
        .validate()
        .map_err(|e| BotError::ValidationError(e.to_string()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_config_roundtrip() {
        let toml_str = r#"
[grid]
name = "btc-eur-hodl"
base_currency = "BTC"
quote_currency = "EUR"
strategy = "GridHODL"
interval = 0.04
amount_per_grid = 100.0
n_open_buy_orders = 5
max_investment = 1000.0
userref = 42

[database]
sqlite_file = "test.sqlite"
"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(toml_str.as_bytes()).unwrap();

        let config = load_config(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.grid.name, "btc-eur-hodl");
        assert_eq!(config.grid.strategy, StrategyKind::GridHodl);
        assert_eq!(config.grid.n_open_buy_orders, 5);
        assert_eq!(config.database.sqlite_file.as_deref(), Some("test.sqlite"));
        // Paper section falls back to defaults.
        assert_eq!(config.paper.start_price, 50_000.0);
    }

    #[test]
    fn test_load_config_rejects_invalid() {
        let toml_str = r#"
[grid]
name = "bad"
base_currency = "BTC"
quote_currency = "EUR"
strategy = "GridHODL"
interval = 0.0
amount_per_grid = 100.0
n_open_buy_orders = 5
max_investment = 1000.0
userref = 42
"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(toml_str.as_bytes()).unwrap();

        assert!(load_config(file.path().to_str().unwrap()).is_err());
    }
}
