//! Configuration management for the paper trade engine.
//!
//! Loads settings from environment variables and config files.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Trading defaults and signal thresholds
    #[serde(default)]
    pub trading: TradingConfig,
    /// Ledger database location
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Telegram notification credentials
    #[serde(default)]
    pub telegram: TelegramConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Pair used when a request does not name one
    #[serde(default = "default_pair")]
    pub pair: String,
    /// BUY executes only while the signal is strictly below this value
    #[serde(default = "default_rsi_oversold")]
    pub rsi_oversold: Decimal,
    /// SELL executes only while the signal is strictly above this value
    #[serde(default = "default_rsi_overbought")]
    pub rsi_overbought: Decimal,
    /// Seed balance for a base asset seen for the first time
    #[serde(default = "default_base_balance")]
    pub default_base_balance: Decimal,
    /// Seed balance for a quote asset seen for the first time
    #[serde(default = "default_quote_balance")]
    pub default_quote_balance: Decimal,
    /// Quantity used when a request does not carry one
    #[serde(default = "default_order_quantity")]
    pub default_order_quantity: Decimal,
    /// Upper bound on a single market signal sample
    #[serde(default = "default_signal_timeout_ms")]
    pub signal_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite file holding trades, balances and sequence counters
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Bot token
    #[serde(default)]
    pub token: Option<String>,
    /// Target chat (numeric id or @channel)
    #[serde(default)]
    pub chat_id: Option<String>,
}

// Default value functions
fn default_pair() -> String {
    "BTCUSDT".to_string()
}

fn default_rsi_oversold() -> Decimal {
    Decimal::new(20, 0)
}

fn default_rsi_overbought() -> Decimal {
    Decimal::new(80, 0)
}

fn default_base_balance() -> Decimal {
    Decimal::ONE
}

fn default_quote_balance() -> Decimal {
    Decimal::new(50_000, 0) // 50k USDT
}

fn default_order_quantity() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

fn default_signal_timeout_ms() -> u64 {
    2_000
}

fn default_db_path() -> PathBuf {
    // Serverless hosts only allow writes under /tmp
    if std::env::var_os("VERCEL").is_some() || std::env::var_os("LAMBDA_TASK_ROOT").is_some() {
        PathBuf::from("/tmp/trades.db")
    } else {
        PathBuf::from("trades.db")
    }
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("PTE")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        self.trading.validate()
    }
}

impl TradingConfig {
    /// Validate thresholds and trading defaults.
    pub fn validate(&self) -> Result<()> {
        let hundred = Decimal::new(100, 0);

        anyhow::ensure!(!self.pair.trim().is_empty(), "pair must not be empty");

        anyhow::ensure!(
            self.rsi_oversold >= Decimal::ZERO && self.rsi_overbought <= hundred,
            "rsi thresholds must be between 0 and 100"
        );

        anyhow::ensure!(
            self.rsi_oversold < self.rsi_overbought,
            "rsi_oversold must be below rsi_overbought"
        );

        anyhow::ensure!(
            self.default_base_balance >= Decimal::ZERO
                && self.default_quote_balance >= Decimal::ZERO,
            "default balances must not be negative"
        );

        anyhow::ensure!(
            self.default_order_quantity > Decimal::ZERO,
            "default_order_quantity must be positive"
        );

        anyhow::ensure!(self.signal_timeout_ms > 0, "signal_timeout_ms must be positive");

        Ok(())
    }
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            pair: default_pair(),
            rsi_oversold: default_rsi_oversold(),
            rsi_overbought: default_rsi_overbought(),
            default_base_balance: default_base_balance(),
            default_quote_balance: default_quote_balance(),
            default_order_quantity: default_order_quantity(),
            signal_timeout_ms: default_signal_timeout_ms(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}
