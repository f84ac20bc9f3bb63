use serde::{Deserialize, Serialize};

/// Which of the four grid variants to run. Selected by configuration, not
/// inheritance; each variant is a stateless policy behind one interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyKind {
    #[serde(rename = "GridHODL")]
    GridHodl,
    #[serde(rename = "GridSell")]
    GridSell,
    #[serde(rename = "SWING")]
    Swing,
    #[serde(rename = "cDCA")]
    Cdca,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StrategyKind::GridHodl => "GridHODL",
            StrategyKind::GridSell => "GridSell",
            StrategyKind::Swing => "SWING",
            StrategyKind::Cdca => "cDCA",
        };
        write!(f, "{s}")
    }
}

/// Immutable per-instance grid parameters. Loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    /// Display name of this bot instance.
    pub name: String,
    pub base_currency: String,
    pub quote_currency: String,
    pub strategy: StrategyKind,
    /// Grid spacing as a fraction, e.g. 0.04 for 4%.
    pub interval: f64,
    /// Quote volume per grid level.
    pub amount_per_grid: f64,
    /// Target number of concurrently open buy orders.
    pub n_open_buy_orders: usize,
    /// Hard cap on committed quote exposure.
    pub max_investment: f64,
    /// Maker fee as a fraction. Taken from the exchange pair info when absent.
    #[serde(default)]
    pub fee: Option<f64>,
    /// Scopes orders and persisted state to this instance when the store or
    /// exchange account is shared.
    pub userref: i64,
    /// Once accumulated sell proceeds cross this threshold (and no sell is
    /// open), amount_per_grid grows for future orders. Disabled when absent.
    #[serde(default)]
    pub reinvest_threshold: Option<f64>,
}

impl GridConfig {
    pub fn symbol(&self) -> String {
        format!("{}/{}", self.base_currency, self.quote_currency)
    }

    pub fn fee_rate(&self) -> f64 {
        self.fee.unwrap_or(crate::constants::DEFAULT_MAKER_FEE)
    }

    /// Quote needed per buy order including the fee.
    pub fn amount_per_grid_plus_fee(&self) -> f64 {
        self.amount_per_grid * (1.0 + self.fee_rate())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.base_currency.is_empty() || self.quote_currency.is_empty() {
            return Err(anyhow::anyhow!("Base and quote currency must be set."));
        }
        if self.interval <= 0.0 || self.interval >= 1.0 {
            return Err(anyhow::anyhow!(
                "Interval {} must be within (0, 1).",
                self.interval
            ));
        }
        if self.amount_per_grid <= 0.0 {
            return Err(anyhow::anyhow!("Amount per grid must be positive."));
        }
        if self.n_open_buy_orders == 0 {
            return Err(anyhow::anyhow!(
                "At least one open buy order must be targeted."
            ));
        }
        if self.max_investment < self.amount_per_grid {
            return Err(anyhow::anyhow!(
                "Max investment {} cannot cover a single grid amount {}.",
                self.max_investment,
                self.amount_per_grid
            ));
        }
        if let Some(fee) = self.fee {
            if !(0.0..0.5).contains(&fee) {
                return Err(anyhow::anyhow!("Fee {} must be within [0, 0.5).", fee));
            }
        }
        if let Some(threshold) = self.reinvest_threshold {
            if threshold <= 0.0 {
                return Err(anyhow::anyhow!("Reinvest threshold must be positive."));
            }
        }
        Ok(())
    }
}

pub fn print_strategy_help() {
    println!("Available strategies (grid.strategy):\n");

    println!("1. GridHODL");
    println!("   Sells one interval above each filled buy, sized to the grid's");
    println!("   quote amount. Slowly accumulates the base currency.");
    println!();

    println!("2. GridSell");
    println!("   Sells the entire base volume of each filled buy one interval");
    println!("   above it. Full turnover per cycle, no accumulation.");
    println!();

    println!("3. SWING");
    println!("   GridHODL plus extra sell orders above the highest buy price");
    println!("   once the price has risen past it, selling prior accumulation.");
    println!();

    println!("4. cDCA");
    println!("   Buys on the grid, never sells. Pure accumulation.");
    println!();

    println!("Common parameters:");
    println!("   - base_currency / quote_currency (e.g. BTC / EUR)");
    println!("   - interval (f64): grid spacing as a fraction, e.g. 0.04");
    println!("   - amount_per_grid (f64): quote volume per level");
    println!("   - n_open_buy_orders (usize): target count of open buys");
    println!("   - max_investment (f64): cap on committed quote exposure");
    println!("   - userref (i64): instance id scoping orders and state");
    println!("   - fee (f64, optional): maker fee; exchange default if unset");
    println!("   - reinvest_threshold (f64, optional): proceeds level that");
    println!("     grows amount_per_grid for future orders");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> GridConfig {
        GridConfig {
            name: "test".to_string(),
            base_currency: "BTC".to_string(),
            quote_currency: "EUR".to_string(),
            strategy: StrategyKind::GridHodl,
            interval: 0.04,
            amount_per_grid: 100.0,
            n_open_buy_orders: 5,
            max_investment: 1000.0,
            fee: None,
            userref: 1,
            reinvest_threshold: None,
        }
    }

    #[test]
    fn test_validation_accepts_sane_config() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_validation_interval_bounds() {
        let mut config = base_config();
        config.interval = 0.0;
        assert!(config.validate().is_err());
        config.interval = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_max_investment_covers_one_grid() {
        let mut config = base_config();
        config.max_investment = 50.0;
        let res = config.validate();
        assert!(res.is_err());
        assert!(res.unwrap_err().to_string().contains("Max investment"));
    }

    #[test]
    fn test_validation_zero_buy_orders() {
        let mut config = base_config();
        config.n_open_buy_orders = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_strategy_kind_serde_names() {
        let kinds = [
            (StrategyKind::GridHodl, "\"GridHODL\""),
            (StrategyKind::GridSell, "\"GridSell\""),
            (StrategyKind::Swing, "\"SWING\""),
            (StrategyKind::Cdca, "\"cDCA\""),
        ];
        for (kind, json) in kinds {
            assert_eq!(serde_json::to_string(&kind).unwrap(), json);
            let parsed: StrategyKind = serde_json::from_str(json).unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn test_amount_per_grid_plus_fee() {
        let mut config = base_config();
        config.fee = Some(0.01);
        assert!((config.amount_per_grid_plus_fee() - 101.0).abs() < 1e-9);
    }
}
