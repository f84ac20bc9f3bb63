use crate::config::grid::{GridConfig, StrategyKind};
use crate::config::{BotConfig, DatabaseConfig, PaperConfig};
use anyhow::Result;
use dialoguer::{theme::ColorfulTheme, Confirm, Input, Select};
use std::fs;

pub fn create_config() -> Result<()> {
    let theme = ColorfulTheme::default();

    let strategies = vec!["GridHODL", "GridSell", "SWING", "cDCA"];
    let selection = Select::with_theme(&theme)
        .with_prompt("Select Strategy")
        .default(0)
        .items(&strategies)
        .interact()?;
    let strategy = match selection {
        0 => StrategyKind::GridHodl,
        1 => StrategyKind::GridSell,
        2 => StrategyKind::Swing,
        _ => StrategyKind::Cdca,
    };

    let base_currency: String = Input::with_theme(&theme)
        .with_prompt("Base currency (e.g., BTC)")
        .interact_text()?;

    let quote_currency: String = Input::with_theme(&theme)
        .with_prompt("Quote currency (e.g., EUR)")
        .interact_text()?;

    let interval: f64 = Input::with_theme(&theme)
        .with_prompt("Grid interval (fraction, e.g. 0.04)")
        .default(0.04)
        .validate_with(|input: &f64| -> Result<(), &str> {
            if *input > 0.0 && *input < 1.0 {
                Ok(())
            } else {
                Err("Interval must be within (0, 1)")
            }
        })
        .interact_text()?;

    let amount_per_grid: f64 = Input::with_theme(&theme)
        .with_prompt("Amount per grid (quote units)")
        .interact_text()?;

    let n_open_buy_orders: usize = Input::with_theme(&theme)
        .with_prompt("Target number of open buy orders")
        .default(5)
        .interact_text()?;

    let max_investment: f64 = Input::with_theme(&theme)
        .with_prompt("Max investment (quote units)")
        .validate_with(|input: &f64| -> Result<(), &str> {
            if *input >= amount_per_grid {
                Ok(())
            } else {
                Err("Max investment must cover at least one grid amount")
            }
        })
        .interact_text()?;

    let userref: i64 = Input::with_theme(&theme)
        .with_prompt("Instance userref (unique per bot sharing an account)")
        .interact_text()?;

    let reinvest_threshold = if Confirm::with_theme(&theme)
        .with_prompt("Enable reinvestment of accumulated proceeds?")
        .default(false)
        .interact()?
    {
        Some(
            Input::with_theme(&theme)
                .with_prompt("Reinvest threshold (quote units)")
                .interact_text()?,
        )
    } else {
        None
    };

    let name: String = Input::with_theme(&theme)
        .with_prompt("Instance name")
        .default(format!(
            "{}-{}-{}",
            base_currency.to_lowercase(),
            quote_currency.to_lowercase(),
            strategy.to_string().to_lowercase()
        ))
        .interact_text()?;

    let config = BotConfig {
        grid: GridConfig {
            name: name.clone(),
            base_currency,
            quote_currency,
            strategy,
            interval,
            amount_per_grid,
            n_open_buy_orders,
            max_investment,
            fee: None,
            userref,
            reinvest_threshold,
        },
        database: DatabaseConfig::default(),
        paper: PaperConfig::default(),
    };
    config
        .grid
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

    let filename: String = Input::with_theme(&theme)
        .with_prompt("Configuration filename")
        .default(format!("{name}.toml"))
        .interact_text()?;

    let toml_string = toml::to_string_pretty(&config)?;

    let path = if filename.ends_with(".toml") {
        filename
    } else {
        format!("{}.toml", filename)
    };

    let final_path = if !path.contains('/') && fs::metadata("configs").is_ok() {
        format!("configs/{}", path)
    } else {
        path
    };

    fs::write(&final_path, toml_string)?;
    println!("Configuration saved to {}", final_path);

    Ok(())
}
