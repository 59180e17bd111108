//! Append-only, hash-chained audit ledger backed by SQLite.
//!
//! The ledger is the single source of historical truth: records are appended,
//! never mutated or deleted. Each record's hash covers its predecessor's hash,
//! the canonical payload bytes, and the timestamp, so any out-of-band edit of
//! a stored row is detectable by `verify_chain`. A detected mismatch is never
//! auto-repaired — it halts all further writes until an operator resolves it.

use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{error, info, warn};

use arbiter_shared::{CoreError, CoreResult, GovernanceEvent};

/// Database operation timeout to prevent indefinite hangs on locks.
const DB_TIMEOUT_SECS: u64 = 10;

/// Maximum INSERT attempts when the storage engine reports transient
/// contention (SQLITE_BUSY). Bounded: absorbs spikes, never waits forever.
const MAX_WRITE_ATTEMPTS: u32 = 5;

/// Base backoff between write attempts; doubled per attempt with jitter.
const WRITE_BACKOFF_MS: u64 = 25;

/// `prev_hash` sentinel of the first record.
pub const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

// ══════════════════════════════════════════════════════════════
// Records and filters
// ══════════════════════════════════════════════════════════════

/// One immutable ledger record as stored.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LedgerRecord {
    pub sequence_no: i64,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub prev_hash: String,
    pub hash: String,
    /// Seconds since the Unix epoch, microsecond precision.
    pub timestamp: f64,
}

/// Restartable query filter. All fields optional; unset means unbounded.
#[derive(Debug, Clone, Default)]
pub struct LedgerFilter {
    pub event_type: Option<String>,
    pub from_sequence: Option<i64>,
    pub to_sequence: Option<i64>,
    pub limit: Option<i64>,
}

// ══════════════════════════════════════════════════════════════
// Ledger
// ══════════════════════════════════════════════════════════════

/// Durable append-only event log with single-writer / multi-reader semantics.
///
/// Writers serialize on an internal mutex (the sole point of global
/// serialization in the core); readers query the pool directly and never
/// block writers or each other.
pub struct Ledger {
    pool: SqlitePool,
    write_lock: Mutex<()>,
    /// Set once a hash mismatch is detected; poisons every later append.
    halted: AtomicBool,
}

async fn with_db_timeout<T, E, F>(fut: F) -> CoreResult<T>
where
    F: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    timeout(Duration::from_secs(DB_TIMEOUT_SECS), fut)
        .await
        .map_err(|_| {
            CoreError::Storage(format!(
                "database operation timed out after {}s",
                DB_TIMEOUT_SECS
            ))
        })?
        .map_err(|e| CoreError::Storage(e.to_string()))
}

impl Ledger {
    /// Opens the ledger over `pool`, creating the backing table if needed.
    pub async fn open(pool: SqlitePool) -> CoreResult<Self> {
        with_db_timeout(
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS ledger_records (
                     sequence_no INTEGER PRIMARY KEY AUTOINCREMENT,
                     event_type  TEXT    NOT NULL,
                     payload     BLOB    NOT NULL,
                     prev_hash   TEXT    NOT NULL,
                     hash        TEXT    NOT NULL,
                     timestamp   REAL    NOT NULL
                 )",
            )
            .execute(&pool),
        )
        .await?;

        with_db_timeout(
            sqlx::query(
                "CREATE INDEX IF NOT EXISTS idx_ledger_event_type
                 ON ledger_records (event_type)",
            )
            .execute(&pool),
        )
        .await?;

        info!("Ledger opened");
        Ok(Self {
            pool,
            write_lock: Mutex::new(()),
            halted: AtomicBool::new(false),
        })
    }

    /// Whether writes are halted due to a detected integrity failure.
    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Appends a governance event and returns the new record's hash.
    pub async fn append(&self, event: &GovernanceEvent) -> CoreResult<String> {
        self.append_raw(event.event_type(), event).await
    }

    /// Appends an arbitrary payload under `event_type`.
    ///
    /// Fails with `SerializationError` if the payload cannot be canonically
    /// encoded, and with `IntegrityError` once the chain is known corrupt.
    pub async fn append_raw<P: Serialize>(
        &self,
        event_type: &str,
        payload: &P,
    ) -> CoreResult<String> {
        if self.is_halted() {
            return Err(CoreError::IntegrityError(
                "ledger is halted after an integrity failure; writes refused".into(),
            ));
        }

        let payload_bytes = serde_json::to_vec(payload)
            .map_err(|e| CoreError::SerializationError(e.to_string()))?;

        // Single-writer-at-a-time: the chain head must not move between
        // reading prev_hash and inserting the successor.
        let _guard = self.write_lock.lock().await;

        if self.is_halted() {
            return Err(CoreError::IntegrityError(
                "ledger is halted after an integrity failure; writes refused".into(),
            ));
        }

        let prev_hash = match self.head().await? {
            Some((_, hash)) => hash,
            None => GENESIS_HASH.to_string(),
        };

        let now = Utc::now();
        let timestamp = now.timestamp_micros() as f64 / 1_000_000.0;
        let hash = compute_hash(&prev_hash, &payload_bytes, timestamp);

        // Bounded busy-retry: SQLITE_BUSY under writer contention is
        // transient; anything else propagates immediately.
        let mut attempt = 0u32;
        loop {
            let insert = sqlx::query(
                "INSERT INTO ledger_records (event_type, payload, prev_hash, hash, timestamp)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(event_type)
            .bind(&payload_bytes)
            .bind(&prev_hash)
            .bind(&hash)
            .bind(timestamp)
            .execute(&self.pool);

            match with_db_timeout(insert).await {
                Ok(_) => break,
                Err(e) => {
                    attempt += 1;
                    let busy = matches!(&e, CoreError::Storage(msg) if msg.contains("locked") || msg.contains("busy"));
                    if !busy || attempt >= MAX_WRITE_ATTEMPTS {
                        return Err(e);
                    }
                    let backoff = WRITE_BACKOFF_MS * (1 << attempt.min(4))
                        + u64::from(rand::random::<u8>() % 16);
                    warn!(
                        attempt,
                        backoff_ms = backoff,
                        "Ledger write contended, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
            }
        }

        Ok(hash)
    }

    /// Returns the most recent `(sequence_no, hash)`, or `None` when empty.
    pub async fn head(&self) -> CoreResult<Option<(i64, String)>> {
        with_db_timeout(
            sqlx::query_as::<_, (i64, String)>(
                "SELECT sequence_no, hash FROM ledger_records
                 ORDER BY sequence_no DESC LIMIT 1",
            )
            .fetch_optional(&self.pool),
        )
        .await
    }

    /// Verifies the hash chain over `[from, to]` (sequence numbers, inclusive;
    /// pass `0, i64::MAX` for the whole chain).
    ///
    /// Returns `Ok(false)` — and halts all further writes — if any stored
    /// hash does not match its recomputed value, if a sequence gap indicates
    /// deleted rows, or if a full-chain verification does not start at the
    /// genesis sentinel. The mismatch is never auto-repaired.
    pub async fn verify_chain(&self, from: i64, to: i64) -> CoreResult<bool> {
        let rows = with_db_timeout(
            sqlx::query_as::<_, (i64, String, Vec<u8>, String, String, f64)>(
                "SELECT sequence_no, event_type, payload, prev_hash, hash, timestamp
                 FROM ledger_records
                 WHERE sequence_no >= ? AND sequence_no <= ?
                 ORDER BY sequence_no ASC",
            )
            .bind(from)
            .bind(to)
            .fetch_all(&self.pool),
        )
        .await?;

        let mut expected_prev: Option<String> = None;
        let mut prev_seq: Option<i64> = None;
        for (seq, _event_type, payload, prev_hash, hash, timestamp) in rows {
            // Deleted rows leave a sequence gap; AUTOINCREMENT never reuses.
            if let Some(prev) = prev_seq {
                if seq != prev + 1 {
                    self.halt(seq, "sequence gap inside verified range");
                    return Ok(false);
                }
            }
            prev_seq = Some(seq);

            match &expected_prev {
                Some(expected) => {
                    if &prev_hash != expected {
                        self.halt(seq, "prev_hash link broken");
                        return Ok(false);
                    }
                }
                None => {
                    // From the chain start the first record must chain from
                    // the genesis sentinel, or front truncation would pass
                    // unnoticed. Genuine mid-chain verification trusts the
                    // stored prev_hash of its first inspected record.
                    if from <= 1 && prev_hash != GENESIS_HASH {
                        self.halt(seq, "first record does not chain from genesis");
                        return Ok(false);
                    }
                }
            }
            let recomputed = compute_hash(&prev_hash, &payload, timestamp);
            if recomputed != hash {
                self.halt(seq, "stored hash does not match recomputed value");
                return Ok(false);
            }
            expected_prev = Some(hash);
        }
        Ok(true)
    }

    fn halt(&self, sequence_no: i64, detail: &str) {
        self.halted.store(true, Ordering::SeqCst);
        error!(
            sequence_no,
            detail, "Ledger integrity failure — halting all writes"
        );
    }

    /// Queries records matching `filter`, ordered by sequence number.
    pub async fn query(&self, filter: &LedgerFilter) -> CoreResult<Vec<LedgerRecord>> {
        let rows = with_db_timeout(
            sqlx::query_as::<_, (i64, String, Vec<u8>, String, String, f64)>(
                "SELECT sequence_no, event_type, payload, prev_hash, hash, timestamp
                 FROM ledger_records
                 WHERE (?1 IS NULL OR event_type = ?1)
                   AND sequence_no >= ?2 AND sequence_no <= ?3
                 ORDER BY sequence_no ASC
                 LIMIT ?4",
            )
            .bind(&filter.event_type)
            .bind(filter.from_sequence.unwrap_or(0))
            .bind(filter.to_sequence.unwrap_or(i64::MAX))
            .bind(filter.limit.unwrap_or(i64::MAX))
            .fetch_all(&self.pool),
        )
        .await?;

        let mut records = Vec::with_capacity(rows.len());
        for (sequence_no, event_type, payload, prev_hash, hash, timestamp) in rows {
            let payload = serde_json::from_slice(&payload)
                .map_err(|e| CoreError::SerializationError(e.to_string()))?;
            records.push(LedgerRecord {
                sequence_no,
                event_type,
                payload,
                prev_hash,
                hash,
                timestamp,
            });
        }
        Ok(records)
    }

    /// Total number of records.
    pub async fn len(&self) -> CoreResult<i64> {
        with_db_timeout(
            sqlx::query_as::<_, (i64,)>("SELECT COUNT(*) FROM ledger_records")
                .fetch_one(&self.pool),
        )
        .await
        .map(|(n,)| n)
    }

    pub async fn is_empty(&self) -> CoreResult<bool> {
        Ok(self.len().await? == 0)
    }

    /// Test/maintenance access to the underlying pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// `hash = SHA-256(prev_hash ‖ canonical(payload) ‖ timestamp)`.
///
/// The timestamp enters as the little-endian bits of the stored REAL so the
/// recomputation is exact — SQLite round-trips f64 losslessly.
fn compute_hash(prev_hash: &str, payload: &[u8], timestamp: f64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(payload);
    hasher.update(timestamp.to_bits().to_le_bytes());
    format!("{:x}", hasher.finalize())
}

// ══════════════════════════════════════════════════════════════
// Tests
// ══════════════════════════════════════════════════════════════
