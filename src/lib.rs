//! # Paper Trade Engine
//!
//! Signal-gated simulated trading against a durable SQLite ledger.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `engine`: Request normalization, dedup, sequencing and execution
//! - `ledger`: Balances, trade records and sequence trackers in SQLite
//! - `market`: Market signal providers (simulated RSI and price)
//! - `notify`: Trade notifications (Telegram)
//! - `utils`: Decimal precision, pair parsing and id generation

pub mod config;
pub mod engine;
pub mod ledger;
pub mod market;
pub mod notify;
pub mod utils;

pub use config::Config;
