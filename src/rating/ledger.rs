//! Rating Ledger
//!
//! Single-writer actor that persists the result of a concluded match:
//! adjusts both ratings and appends the match record. All jobs go through
//! one queue, so two matches finishing at once for the same player can
//! never lose an increment.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::adjust::{RatingDelta, K_FACTOR};
use crate::core::{Identity, MatchOutcome, MatchRecord};
use crate::store::{StoreError, UserStore};

/// Ledger configuration.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// Rating adjustment magnitude.
    pub k_factor: i32,
    /// Retries per failed store step (0 = try once).
    pub max_retries: u32,
    /// Base delay between retries; grows linearly with the attempt number.
    pub retry_backoff: Duration,
    /// Queue capacity.
    pub queue_capacity: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            k_factor: K_FACTOR,
            max_retries: 3,
            retry_backoff: Duration::from_millis(200),
            queue_capacity: 256,
        }
    }
}

impl LedgerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            k_factor: defaults.k_factor,
            max_retries: std::env::var("LEDGER_MAX_RETRIES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_retries),
            retry_backoff: std::env::var("LEDGER_RETRY_BACKOFF_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_backoff),
            queue_capacity: defaults.queue_capacity,
        }
    }
}

/// One player's rating before and after a match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RatingChange {
    /// Player.
    pub identity: Identity,
    /// Rating before the match.
    pub before: i32,
    /// Rating after the match.
    pub after: i32,
}

/// What the ledger persisted for one match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerReceipt {
    /// The appended record.
    pub record: MatchRecord,
    /// Player A's change.
    pub a: RatingChange,
    /// Player B's change.
    pub b: RatingChange,
}

/// Ledger errors.
#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    /// Store failed after all retries.
    #[error("storage failure: {0}")]
    Storage(#[from] StoreError),
    /// Ledger task is gone.
    #[error("ledger closed")]
    Closed,
}

type Reply = oneshot::Sender<Result<LedgerReceipt, LedgerError>>;

struct LedgerJob {
    record: MatchRecord,
    reply: Reply,
}

/// Handle to the ledger actor. Cheap to clone.
#[derive(Clone)]
pub struct RatingLedger {
    tx: mpsc::Sender<LedgerJob>,
}

impl RatingLedger {
    /// Spawn the ledger task on the current runtime.
    pub fn spawn(store: Arc<dyn UserStore>, config: LedgerConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        tokio::spawn(run_ledger(store, config, rx));
        Self { tx }
    }

    /// Persist an outcome and wait for the result.
    pub async fn apply_outcome(
        &self,
        a: Identity,
        b: Identity,
        outcome: MatchOutcome,
    ) -> Result<LedgerReceipt, LedgerError> {
        self.apply_record(MatchRecord::new(a, b, outcome)).await
    }

    /// Persist a prepared record and wait for the result.
    pub async fn apply_record(&self, record: MatchRecord) -> Result<LedgerReceipt, LedgerError> {
        let reply = self.submit(record).await?;
        reply.await.map_err(|_| LedgerError::Closed)?
    }

    /// Queue a record. Jobs are applied in submission order; the returned
    /// receiver yields the outcome once this one has run.
    pub async fn submit(
        &self,
        record: MatchRecord,
    ) -> Result<oneshot::Receiver<Result<LedgerReceipt, LedgerError>>, LedgerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(LedgerJob { record, reply: reply_tx })
            .await
            .map_err(|_| LedgerError::Closed)?;
        Ok(reply_rx)
    }
}

async fn run_ledger(
    store: Arc<dyn UserStore>,
    config: LedgerConfig,
    mut rx: mpsc::Receiver<LedgerJob>,
) {
    debug!("Rating ledger started");

    while let Some(job) = rx.recv().await {
        let result = process(store.as_ref(), &config, job.record).await;

        match &result {
            Ok(receipt) => info!(
                "Recorded {} vs {}: {:?} ({} -> {}, {} -> {})",
                receipt.record.player_a,
                receipt.record.player_b,
                receipt.record.outcome,
                receipt.a.before,
                receipt.a.after,
                receipt.b.before,
                receipt.b.after,
            ),
            Err(e) => error!("Failed to record match: {}", e),
        }

        // The submitter may have stopped listening.
        let _ = job.reply.send(result);
    }

    debug!("Rating ledger stopped");
}

/// Run one job. Each step is retried on its own so a completed
/// adjustment is never applied twice. If a later step fails for good, the
/// adjustments already applied are reversed.
async fn process(
    store: &dyn UserStore,
    config: &LedgerConfig,
    record: MatchRecord,
) -> Result<LedgerReceipt, LedgerError> {
    let a = record.player_a.clone();
    let b = record.player_b.clone();

    let before_a = with_retry(config, "read rating", || store.get_rating(&a)).await?;
    let before_b = with_retry(config, "read rating", || store.get_rating(&b)).await?;

    let delta = RatingDelta::with_k(record.outcome, config.k_factor);

    let mut applied: Vec<(&Identity, i32)> = Vec::with_capacity(2);
    for (who, amount) in [(&a, delta.a), (&b, delta.b)] {
        if amount == 0 {
            continue;
        }
        if let Err(e) =
            with_retry(config, "adjust rating", || store.adjust_rating(who, amount)).await
        {
            roll_back(store, config, &applied).await;
            return Err(e.into());
        }
        applied.push((who, amount));
    }

    if let Err(e) = with_retry(config, "append match record", || {
        store.append_match_record(record.clone())
    })
    .await
    {
        roll_back(store, config, &applied).await;
        return Err(e.into());
    }

    // The ledger is the only writer of ratings, so nothing can move them
    // between the read above and the adjustments.
    Ok(LedgerReceipt {
        a: RatingChange { identity: a.clone(), before: before_a, after: before_a + delta.a },
        b: RatingChange { identity: b.clone(), before: before_b, after: before_b + delta.b },
        record,
    })
}

async fn roll_back(store: &dyn UserStore, config: &LedgerConfig, applied: &[(&Identity, i32)]) {
    for &(who, amount) in applied.iter().rev() {
        match with_retry(config, "roll back rating", || store.adjust_rating(who, -amount)).await {
            Ok(_) => warn!("Rolled back {:+} for {}", amount, who),
            Err(e) => error!("Rating for {} left off by {:+}: {}", who, amount, e),
        }
    }
}

async fn with_retry<T, F, Fut>(config: &LedgerConfig, what: &str, mut op: F) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(StoreError::Unavailable(reason)) if attempt < config.max_retries => {
                attempt += 1;
                warn!("{} failed ({}), retry {}/{}", what, reason, attempt, config.max_retries);
                tokio::time::sleep(config.retry_backoff * attempt).await;
            }
            Err(e) => return Err(e),
        }
    }
}
