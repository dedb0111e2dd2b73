//! SQLite-backed ledger.
//!
//! Decimals are stored as TEXT so balances round-trip exactly. A single
//! connection sits behind a mutex; multi-statement operations run inside
//! `BEGIN IMMEDIATE` transactions.

use super::types::*;
use super::{LedgerStore, StoreError, StoreResult};
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Timelike, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info, warn};

const TRADE_COLUMNS: &str = "id, transaction_id, sequence_number, request_hash, timestamp, \
                             pair, action, signal, price, quantity, status, metadata";

/// Columns a `trades` table must have to be kept across upgrades.
const REQUIRED_TRADE_COLUMNS: [&str; 4] =
    ["transaction_id", "request_hash", "sequence_number", "signal"];

/// SQLite ledger store.
pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl SqliteLedger {
    /// Open (or create) the ledger at `db_path`, initializing the schema.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create database directory {:?}", parent))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;

        init_schema(&conn).context("Failed to initialize ledger schema")?;

        info!("Ledger initialized at {:?}", path);
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Private in-memory ledger.
    pub fn in_memory() -> Result<Self> {
        Self::new(":memory:")
    }
}

fn init_schema(conn: &Connection) -> StoreResult<()> {
    // Best effort; in-memory databases report "memory" and that is fine
    match conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get::<_, String>(0)) {
        Ok(mode) => debug!(%mode, "Journal mode set"),
        Err(e) => warn!(error = %e, "Unable to enable WAL mode; continuing with default journal"),
    }

    let columns: HashSet<String> = {
        let mut stmt = conn.prepare("PRAGMA table_info(trades)")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<rusqlite::Result<HashSet<String>>>()?;
        names
    };
    if !columns.is_empty() && REQUIRED_TRADE_COLUMNS.iter().any(|c| !columns.contains(*c)) {
        warn!("Existing trades table uses a legacy schema; recreating it");
        conn.execute_batch("DROP TABLE IF EXISTS trades;")?;
    }

    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS trades (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            transaction_id TEXT NOT NULL UNIQUE,
            sequence_number INTEGER NOT NULL,
            request_hash TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            pair TEXT NOT NULL,
            action TEXT NOT NULL,
            signal TEXT NOT NULL,
            price TEXT NOT NULL,
            quantity TEXT NOT NULL,
            status TEXT NOT NULL,
            metadata TEXT
        );
        CREATE UNIQUE INDEX IF NOT EXISTS uq_trades_request_hash ON trades(request_hash);
        CREATE INDEX IF NOT EXISTS idx_trades_pair_action ON trades(pair, action);
        CREATE INDEX IF NOT EXISTS idx_trades_timestamp ON trades(timestamp);

        CREATE TABLE IF NOT EXISTS balances (
            asset TEXT PRIMARY KEY,
            balance TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sequence_tracker (
            pair TEXT NOT NULL,
            action TEXT NOT NULL,
            last_sequence INTEGER NOT NULL,
            PRIMARY KEY (pair, action)
        );
        "#,
    )?;

    debug!("Ledger schema initialized");
    Ok(())
}

// ==================== Row helpers ====================

/// Current time truncated to what the TEXT column keeps.
fn timestamp_now() -> DateTime<Utc> {
    let now = Utc::now();
    now.with_nanosecond(now.nanosecond() / 1_000 * 1_000).unwrap_or(now)
}

/// Fixed-width RFC 3339 so timestamps sort lexically.
fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_decimal(field: &str, raw: &str) -> StoreResult<Decimal> {
    Decimal::from_str(raw).map_err(|e| StoreError::Corrupt(format!("{field} = {raw:?}: {e}")))
}

fn checked_balance(asset: &str, current: Decimal, delta: Decimal) -> StoreResult<Decimal> {
    current
        .checked_add(delta)
        .ok_or_else(|| StoreError::BalanceOverflow {
            asset: asset.to_string(),
            delta,
        })
}

fn to_sequence(raw: i64) -> StoreResult<u64> {
    u64::try_from(raw).map_err(|_| StoreError::Corrupt(format!("negative sequence {raw}")))
}

/// Trade row as SQLite hands it back, before decoding.
struct RawTrade {
    id: i64,
    transaction_id: String,
    sequence_number: i64,
    request_hash: String,
    timestamp: String,
    pair: String,
    action: String,
    signal: String,
    price: String,
    quantity: String,
    status: String,
    metadata: Option<String>,
}

impl RawTrade {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            transaction_id: row.get(1)?,
            sequence_number: row.get(2)?,
            request_hash: row.get(3)?,
            timestamp: row.get(4)?,
            pair: row.get(5)?,
            action: row.get(6)?,
            signal: row.get(7)?,
            price: row.get(8)?,
            quantity: row.get(9)?,
            status: row.get(10)?,
            metadata: row.get(11)?,
        })
    }

    fn decode(self) -> StoreResult<TradeRecord> {
        let metadata = match self.metadata.as_deref() {
            None | Some("") => TradeMetadata::default(),
            Some(raw) => serde_json::from_str(raw).map_err(|e| {
                StoreError::Corrupt(format!("metadata of trade {}: {e}", self.id))
            })?,
        };

        Ok(TradeRecord {
            id: self.id,
            sequence_number: to_sequence(self.sequence_number)?,
            timestamp: DateTime::parse_from_rfc3339(&self.timestamp)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| StoreError::Corrupt(format!("timestamp {:?}: {e}", self.timestamp)))?,
            action: TradeAction::from_str(&self.action).map_err(StoreError::Corrupt)?,
            status: TradeStatus::from_str(&self.status).map_err(StoreError::Corrupt)?,
            signal: parse_decimal("signal", &self.signal)?,
            price: parse_decimal("price", &self.price)?,
            quantity: parse_decimal("quantity", &self.quantity)?,
            transaction_id: self.transaction_id,
            request_hash: self.request_hash,
            pair: self.pair,
            metadata,
        })
    }
}

fn read_balance(conn: &Connection, asset: &str) -> StoreResult<Option<Decimal>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT balance FROM balances WHERE asset = ?1",
            [asset],
            |row| row.get(0),
        )
        .optional()?;

    raw.map(|r| parse_decimal("balance", &r)).transpose()
}

fn write_balance(conn: &Connection, asset: &str, balance: Decimal, now: DateTime<Utc>) -> StoreResult<()> {
    conn.execute(
        r#"
        INSERT INTO balances (asset, balance, updated_at)
        VALUES (?1, ?2, ?3)
        ON CONFLICT(asset) DO UPDATE SET
            balance = excluded.balance,
            updated_at = excluded.updated_at
        "#,
        params![asset, balance.to_string(), format_timestamp(now)],
    )?;
    Ok(())
}

fn read_all_balances(conn: &Connection) -> StoreResult<Balances> {
    let mut stmt = conn.prepare("SELECT asset, balance FROM balances")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(|(asset, raw)| Ok((asset, parse_decimal("balance", &raw)?)))
        .collect()
}

fn read_last_sequence(conn: &Connection, pair: &str, action: TradeAction) -> StoreResult<u64> {
    let last: Option<i64> = conn
        .query_row(
            "SELECT last_sequence FROM sequence_tracker WHERE pair = ?1 AND action = ?2",
            params![pair, action.as_str()],
            |row| row.get(0),
        )
        .optional()?;

    last.map(to_sequence).transpose().map(|s| s.unwrap_or(0))
}

fn find_by_hash(conn: &Connection, request_hash: &str) -> StoreResult<Option<TradeRecord>> {
    let raw = conn
        .query_row(
            &format!("SELECT {TRADE_COLUMNS} FROM trades WHERE request_hash = ?1 LIMIT 1"),
            [request_hash],
            RawTrade::from_row,
        )
        .optional()?;

    raw.map(RawTrade::decode).transpose()
}

/// Insert a trade row and advance the tracker for executed trades.
fn insert_trade(conn: &Connection, record: &NewTradeRecord, now: DateTime<Utc>) -> StoreResult<i64> {
    let metadata = serde_json::to_string(&record.metadata)?;
    let sequence = i64::try_from(record.sequence_number)
        .map_err(|_| StoreError::Corrupt(format!("sequence {} out of range", record.sequence_number)))?;

    conn.execute(
        r#"
        INSERT INTO trades (transaction_id, sequence_number, request_hash, timestamp,
                            pair, action, signal, price, quantity, status, metadata)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
        "#,
        params![
            record.transaction_id,
            sequence,
            record.request_hash,
            format_timestamp(now),
            record.pair,
            record.action.as_str(),
            record.signal.to_string(),
            record.price.to_string(),
            record.quantity.to_string(),
            record.status.as_str(),
            metadata,
        ],
    )?;
    let id = conn.last_insert_rowid();

    if record.status == TradeStatus::Executed {
        conn.execute(
            r#"
            INSERT INTO sequence_tracker (pair, action, last_sequence)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(pair, action) DO UPDATE SET last_sequence = excluded.last_sequence
            "#,
            params![record.pair, record.action.as_str(), sequence],
        )?;
    }

    Ok(id)
}

impl LedgerStore for SqliteLedger {
    fn get_balance(&self, asset: &str) -> StoreResult<Decimal> {
        let conn = self.conn.lock();
        Ok(read_balance(&conn, asset)?.unwrap_or(Decimal::ZERO))
    }

    fn adjust_balance(&self, asset: &str, delta: Decimal) -> StoreResult<Decimal> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = read_balance(&tx, asset)?.unwrap_or(Decimal::ZERO);
        let updated = checked_balance(asset, current, delta)?;
        if updated < Decimal::ZERO {
            return Err(StoreError::InsufficientBalance {
                asset: asset.to_string(),
                available: current,
                required: -delta,
            });
        }

        write_balance(&tx, asset, updated, timestamp_now())?;
        tx.commit()?;

        debug!(%asset, %delta, balance = %updated, "Balance adjusted");
        Ok(updated)
    }

    fn set_balance(&self, asset: &str, amount: Decimal) -> StoreResult<()> {
        let conn = self.conn.lock();
        write_balance(&conn, asset, amount, timestamp_now())
    }

    fn ensure_initial_balance(&self, asset: &str, amount: Decimal) -> StoreResult<bool> {
        let conn = self.conn.lock();
        let inserted = conn.execute(
            r#"
            INSERT INTO balances (asset, balance, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(asset) DO NOTHING
            "#,
            params![asset, amount.to_string(), format_timestamp(timestamp_now())],
        )?;

        if inserted > 0 {
            info!(%asset, %amount, "Seeded initial balance");
        }
        Ok(inserted > 0)
    }

    fn balances(&self) -> StoreResult<Balances> {
        let conn = self.conn.lock();
        read_all_balances(&conn)
    }

    fn record_trade(&self, record: &NewTradeRecord) -> StoreResult<i64> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let id = insert_trade(&tx, record, timestamp_now())?;
        tx.commit()?;
        Ok(id)
    }

    fn trade_exists(
        &self,
        transaction_id: Option<&str>,
        request_hash: Option<&str>,
    ) -> StoreResult<bool> {
        let (sql, key_a, key_b) = match (transaction_id, request_hash) {
            (None, None) => return Err(StoreError::MissingLookupKey),
            (Some(tx), None) => ("SELECT 1 FROM trades WHERE transaction_id = ?1 LIMIT 1", tx, None),
            (None, Some(hash)) => ("SELECT 1 FROM trades WHERE request_hash = ?1 LIMIT 1", hash, None),
            (Some(tx), Some(hash)) => (
                "SELECT 1 FROM trades WHERE transaction_id = ?1 OR request_hash = ?2 LIMIT 1",
                tx,
                Some(hash),
            ),
        };

        let conn = self.conn.lock();
        let found: Option<i64> = match key_b {
            Some(b) => conn.query_row(sql, params![key_a, b], |row| row.get(0)).optional()?,
            None => conn.query_row(sql, params![key_a], |row| row.get(0)).optional()?,
        };
        Ok(found.is_some())
    }

    fn fetch_by_request_hash(&self, request_hash: &str) -> StoreResult<Option<TradeRecord>> {
        let conn = self.conn.lock();
        find_by_hash(&conn, request_hash)
    }

    fn last_sequence(&self, pair: &str, action: TradeAction) -> StoreResult<u64> {
        let conn = self.conn.lock();
        read_last_sequence(&conn, pair, action)
    }

    fn commit_execution(&self, commit: &ExecutionCommit) -> StoreResult<CommitOutcome> {
        let mut conn = self.conn.lock();
        // Dropping `tx` on any early return rolls everything back
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        if let Some(existing) = find_by_hash(&tx, &commit.request_hash)? {
            return Ok(CommitOutcome::Duplicate(existing));
        }

        let expected = read_last_sequence(&tx, &commit.pair, commit.action)? + 1;
        let sequence_number = match commit.sequence {
            SequenceClaim::Next => expected,
            SequenceClaim::Exact(n) if n == expected => n,
            SequenceClaim::Exact(_) => return Ok(CommitOutcome::SequenceConflict { expected }),
        };

        let mut updates = Vec::with_capacity(commit.deltas.len());
        for delta in &commit.deltas {
            let available = read_balance(&tx, &delta.asset)?.unwrap_or(Decimal::ZERO);
            let updated = checked_balance(&delta.asset, available, delta.delta)?;
            if updated < Decimal::ZERO {
                return Ok(CommitOutcome::InsufficientBalance {
                    asset: delta.asset.clone(),
                    available,
                    required: -delta.delta,
                });
            }
            updates.push((delta.asset.as_str(), updated));
        }

        let now = timestamp_now();
        for (asset, balance) in updates {
            write_balance(&tx, asset, balance, now)?;
        }

        let metadata = TradeMetadata {
            balances: read_all_balances(&tx)?,
            ..commit.metadata.clone()
        };
        let record = NewTradeRecord {
            transaction_id: commit.transaction_id.clone(),
            sequence_number,
            request_hash: commit.request_hash.clone(),
            pair: commit.pair.clone(),
            action: commit.action,
            signal: commit.signal,
            price: commit.price,
            quantity: commit.quantity,
            status: TradeStatus::Executed,
            metadata,
        };
        let id = insert_trade(&tx, &record, now)?;
        tx.commit()?;

        debug!(
            trade_id = id,
            transaction_id = %record.transaction_id,
            pair = %record.pair,
            action = %record.action,
            sequence = sequence_number,
            "Execution committed"
        );

        Ok(CommitOutcome::Committed(TradeRecord {
            id,
            transaction_id: record.transaction_id,
            sequence_number,
            request_hash: record.request_hash,
            timestamp: now,
            pair: record.pair,
            action: record.action,
            signal: record.signal,
            price: record.price,
            quantity: record.quantity,
            status: record.status,
            metadata: record.metadata,
        }))
    }

    fn recent_trades(&self, limit: usize) -> StoreResult<Vec<TradeRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {TRADE_COLUMNS} FROM trades ORDER BY timestamp DESC, id DESC LIMIT ?1"
        ))?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map([limit], RawTrade::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter().map(RawTrade::decode).collect()
    }

    fn trade_summary(&self) -> StoreResult<TradeSummary> {
        let conn = self.conn.lock();
        let (total, buy, sell): (i64, i64, i64) = conn.query_row(
            r#"
            SELECT COUNT(*),
                   COALESCE(SUM(CASE WHEN action = 'BUY' THEN 1 ELSE 0 END), 0),
                   COALESCE(SUM(CASE WHEN action = 'SELL' THEN 1 ELSE 0 END), 0)
            FROM trades
            "#,
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        Ok(TradeSummary {
            total_trades: total.max(0) as u64,
            buy_trades: buy.max(0) as u64,
            sell_trades: sell.max(0) as u64,
        })
    }
}
