//! Paper Trade Engine - Main Entry Point
//!
//! Runs single trade requests and ledger queries from the command line.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use paper_trade_engine::config::Config;
use paper_trade_engine::engine::{EngineError, TradeEngine, TradeRequest, TradeResponse};
use paper_trade_engine::ledger::{LedgerStore, SqliteLedger, TradeAction};
use paper_trade_engine::market::{MarketSignalProvider, MockMarketSignal, StaticMarketSignal};
use paper_trade_engine::notify::{
    format_trade_notification, NotificationOutcome, Notifier, TelegramNotifier,
};
use paper_trade_engine::utils::mask_secret;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Paper Trade Engine CLI
#[derive(Parser)]
#[command(name = "paper-trade")]
#[command(version, about = "Signal-gated simulated trading against a local ledger")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Buy the base asset if the signal is below the oversold threshold
    Buy(TradeArgs),

    /// Sell the base asset if the signal is above the overbought threshold
    Sell(TradeArgs),

    /// Show current signal, thresholds, trade counts and balances
    Status,

    /// List the most recent trades
    Trades {
        /// Number of trades to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Show all ledger balances
    Balances,

    /// Send a test message through the configured notifier
    Notify {
        /// Message text
        #[arg(short, long, default_value = "Paper trade engine test notification")]
        message: String,
    },
}

#[derive(clap::Args)]
struct TradeArgs {
    /// Trading pair, e.g. BTCUSDT (default from config)
    #[arg(short, long)]
    pair: Option<String>,

    /// Quantity of the base asset (default from config)
    #[arg(short, long)]
    quantity: Option<Decimal>,

    /// Correlation id; retries with the same id are deduplicated
    #[arg(short, long)]
    request_id: Option<String>,

    /// Expected next sequence number for the (pair, action) stream
    #[arg(short, long)]
    sequence: Option<u64>,

    /// Free-form client reference (max 64 characters)
    #[arg(short, long)]
    client_ref: Option<String>,

    /// Execute even if the signal threshold is not met
    #[arg(short, long)]
    force: bool,

    /// Use a fixed signal instead of the simulated one (requires --price)
    #[arg(long, requires = "price")]
    signal: Option<Decimal>,

    /// Use a fixed price instead of the simulated one (requires --signal)
    #[arg(long, requires = "signal")]
    price: Option<Decimal>,
}

impl TradeArgs {
    fn request(&self) -> TradeRequest {
        TradeRequest {
            pair: self.pair.clone(),
            quantity: self.quantity,
            request_id: self.request_id.clone(),
            sequence_number: self.sequence,
            client_ref: self.client_ref.clone(),
            force: self.force,
        }
    }

    fn signal_provider(&self) -> Arc<dyn MarketSignalProvider> {
        match (self.signal, self.price) {
            (Some(signal), Some(price)) => Arc::new(StaticMarketSignal::new(signal, price)),
            _ => Arc::new(MockMarketSignal::new()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    init_logging()?;

    let config = Config::load()?;
    config.validate()?;
    log_config(&config);

    match cli.command {
        Commands::Buy(args) => run_trade(&config, TradeAction::Buy, &args).await,
        Commands::Sell(args) => run_trade(&config, TradeAction::Sell, &args).await,
        Commands::Status => {
            let engine = build_engine(&config, Arc::new(MockMarketSignal::new()))?;
            let status = engine.status().await.map_err(report_engine_error)?;
            print_json(&status)
        }
        Commands::Trades { limit } => {
            let engine = build_engine(&config, Arc::new(MockMarketSignal::new()))?;
            let trades = engine.recent_trades(limit).map_err(report_engine_error)?;
            print_json(&trades)
        }
        Commands::Balances => {
            let engine = build_engine(&config, Arc::new(MockMarketSignal::new()))?;
            let balances = engine.store().balances()?;
            print_json(&balances)
        }
        Commands::Notify { message } => {
            let notifier = TelegramNotifier::new(&config.telegram)?;
            let outcome = notifier.send(&message).await;
            print_json(&outcome)
        }
    }
}

/// Execute one trade and print the response.
async fn run_trade(config: &Config, action: TradeAction, args: &TradeArgs) -> Result<()> {
    let engine = build_engine(config, args.signal_provider())?;

    let response = engine
        .execute(action, args.request())
        .await
        .map_err(report_engine_error)?;

    // The process exits right after printing, so deliver inline instead of
    // through the engine's background task.
    if response.is_executed() && !response.duplicate {
        notify_trade(config, &response).await;
    }

    print_json(&response)
}

fn build_engine(config: &Config, signals: Arc<dyn MarketSignalProvider>) -> Result<TradeEngine> {
    let ledger = SqliteLedger::new(&config.database.path).with_context(|| {
        format!(
            "Failed to open ledger at {}",
            config.database.path.display()
        )
    })?;

    Ok(TradeEngine::new(
        Arc::new(ledger),
        signals,
        config.trading.clone(),
    ))
}

async fn notify_trade(config: &Config, response: &TradeResponse) {
    let notifier = match TelegramNotifier::new(&config.telegram) {
        Ok(notifier) => notifier,
        Err(e) => {
            warn!("Notifier unavailable: {:#}", e);
            return;
        }
    };

    let message = format_trade_notification(
        &response.pair,
        response.action,
        response.signal,
        response.price,
    );

    match notifier.send(&message).await {
        NotificationOutcome::Sent => info!("📨 Trade notification sent"),
        NotificationOutcome::Skipped { reason } => info!("Notification skipped: {}", reason),
        NotificationOutcome::Failed { error } => warn!("⚠️  Notification failed: {}", error),
    }
}

/// Log the failure and turn it into a process error.
fn report_engine_error(e: EngineError) -> anyhow::Error {
    if e.is_client_error() {
        warn!(status = e.status_code(), "❌ Request refused: {}", e);
    } else {
        error!(status = e.status_code(), "❌ Engine failure: {}", e);
    }
    e.into()
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Failed to render output")?;
    println!("{rendered}");
    Ok(())
}

/// Initialize logging with file and console output.
fn init_logging() -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::hourly("logs", "paper-trade.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep it alive for the program duration
    Box::leak(Box::new(guard));

    // stdout carries the JSON result; logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("paper_trade_engine=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stderr.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config) {
    info!("📋 Configuration:");
    info!("   Default Pair: {}", config.trading.pair);
    info!(
        "   RSI Thresholds: buy < {} / sell > {}",
        config.trading.rsi_oversold, config.trading.rsi_overbought
    );
    info!(
        "   Seed Balances: base {} / quote {}",
        config.trading.default_base_balance, config.trading.default_quote_balance
    );
    info!(
        "   Default Quantity: {}",
        config.trading.default_order_quantity
    );
    info!("   Signal Timeout: {}ms", config.trading.signal_timeout_ms);
    info!("   Database: {}", config.database.path.display());
    info!(
        "   Telegram: token {} / chat {}",
        mask_secret(config.telegram.token.as_deref()),
        mask_secret(config.telegram.chat_id.as_deref())
    );
}
