use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use infinity_grid_bot::config::{load_config, BotConfig};
use infinity_grid_bot::constants::EVENT_QUEUE_CAPACITY;
use infinity_grid_bot::engine::Engine;
use infinity_grid_bot::feed::replay::ReplayTicker;
use infinity_grid_bot::feed::TickerFeed;
use infinity_grid_bot::gateway::paper::{run_paper_session, PaperExchange};
use infinity_grid_bot::gateway::ExchangeGateway;
use infinity_grid_bot::logging::order_audit::OrderAuditLogger;
use infinity_grid_bot::model::PairInfo;
use infinity_grid_bot::notifier::telegram::TelegramReporter;
use infinity_grid_bot::notifier::Notifier;
use infinity_grid_bot::store::sqlite::SqliteStore;
use infinity_grid_bot::store::PersistenceStore;

#[derive(Parser, Debug)]
#[command(author, version, about = "Infinity grid trading bot", long_about = None)]
struct Args {
    #[arg(short, long)]
    config: Option<String>,

    #[arg(short, long)]
    list_strategies: bool,

    #[arg(long)]
    create: bool,

    /// Run against the in-process paper exchange with an in-memory store.
    #[arg(long)]
    dry_run: bool,
}

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

#[tokio::main]
async fn main() -> Result<()> {
    // ---------------------------------------------------------
    // 1. Setup logging (tracing)
    // ---------------------------------------------------------
    let file_appender = tracing_appender::rolling::daily("logs", "application.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    // Console layer (env filter)
    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_level(true)
        .with_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into())
                .add_directive("infinity_grid_bot=debug".parse().unwrap()),
        );

    // File layer (simple text)
    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking)
        .with_target(false)
        .with_filter(tracing_subscriber::EnvFilter::new(
            "info,infinity_grid_bot=debug",
        ));

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .init();

    dotenvy::dotenv().ok();

    let args = Args::parse();

    if args.list_strategies {
        infinity_grid_bot::config::grid::print_strategy_help();
        return Ok(());
    }

    if args.create {
        if let Err(e) = infinity_grid_bot::config::creator::create_config() {
            error!("Error creating config: {}", e);
            std::process::exit(1);
        }
        return Ok(());
    }

    let config_path = args.config.ok_or_else(|| {
        anyhow::anyhow!("Config file is required unless --list-strategies or --create is used")
    })?;

    info!("Loading config from: {}", config_path);
    let config = load_config(&config_path)?;

    info!(
        "Starting {} strategy for {}",
        config.grid.strategy,
        config.grid.symbol()
    );
    tracing::debug!(
        "Effective grid config: {}",
        serde_json::to_string(&config.grid).unwrap_or_default()
    );

    // ---------------------------------------------------------
    // 2. Audit trail
    // ---------------------------------------------------------
    let audit_logger = match OrderAuditLogger::new("logs", &config.grid.symbol()) {
        Ok(logger) => Some(logger),
        Err(e) => {
            error!("Failed to initialize order audit logger: {}", e);
            None
        }
    };

    // ---------------------------------------------------------
    // 3. Collaborators
    // ---------------------------------------------------------
    let sqlite_file = if args.dry_run {
        None
    } else {
        config.database.sqlite_file.clone()
    };
    let store: Arc<dyn PersistenceStore> =
        Arc::new(SqliteStore::connect(sqlite_file.as_deref()).await?);

    let notifier = Notifier::new();
    let mut reporter_handle = None;
    match TelegramReporter::new(notifier.subscribe()) {
        Ok(Some(reporter)) => {
            info!("Telegram reporter initialized. Spawning background task...");
            reporter_handle = Some(tokio::spawn(reporter.run()));
        }
        Ok(None) => info!("Telegram not configured; notifications stay local."),
        Err(e) => error!("Failed to initialize Telegram reporter: {}", e),
    }

    // The exchange protocol is a collaborator concern; this build wires the
    // in-process paper exchange driven by a replayed (or synthetic) ticker.
    // A live exchange adapter plugs in behind the same traits.
    let (gateway, paper, feed) = build_paper_collaborators(&config)?;

    // ---------------------------------------------------------
    // 4. Engine
    // ---------------------------------------------------------
    let (events_tx, events_rx) = tokio::sync::mpsc::channel(EVENT_QUEUE_CAPACITY);
    tokio::spawn(run_paper_session(feed, paper, events_tx));

    let engine = Engine::new(
        config.grid.clone(),
        gateway,
        store,
        notifier.clone(),
        audit_logger,
    );

    if let Err(e) = engine.run(events_rx).await {
        error!("Engine error: {}", e);
        // Give the reporter a moment to deliver the failure notification.
        if let Some(handle) = reporter_handle {
            let _ = tokio::time::timeout(Duration::from_secs(10), handle).await;
        } else {
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        std::process::exit(1);
    }

    Ok(())
}

type PaperParts = (
    Arc<dyn ExchangeGateway>,
    Arc<PaperExchange>,
    Box<dyn TickerFeed>,
);

fn build_paper_collaborators(config: &BotConfig) -> Result<PaperParts> {
    let pair = PairInfo {
        price_decimals: config.paper.price_decimals,
        volume_decimals: config.paper.volume_decimals,
        min_volume: config.paper.min_volume,
        maker_fee: config.grid.fee.unwrap_or(0.0025),
    };
    let paper = Arc::new(PaperExchange::new(
        pair,
        config.paper.base_balance,
        config.paper.quote_balance,
    ));

    let feed: Box<dyn TickerFeed> = match &config.paper.price_csv {
        Some(path) => Box::new(ReplayTicker::from_csv(
            std::path::Path::new(path),
            Duration::from_millis(10),
        )?),
        None => {
            // Without a price file, hold the last price so the bot builds
            // and maintains its grid until interrupted.
            let prices = vec![config.paper.start_price; 600];
            Box::new(ReplayTicker::from_prices(prices, Duration::from_secs(1)))
        }
    };

    let gateway: Arc<dyn ExchangeGateway> = paper.clone();
    Ok((gateway, paper, feed))
}
