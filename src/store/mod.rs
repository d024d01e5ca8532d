//! Verification run persistence.
//!
//! Runs are append-only and keyed by (provider, model, attempt timestamp).
//! Saving the same key twice is a successful no-op in every backend; the
//! uniqueness check lives in the backend's write path, never in callers.
//! Catalog discoveries are kept in a separate append-only snapshot log.

mod memory;
#[cfg(feature = "jsonl")]
mod jsonl;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::MemoryStore;
#[cfg(feature = "jsonl")]
pub use jsonl::{JsonlConfig, JsonlConfigBuilder, JsonlStore, SyncMode};
#[cfg(feature = "postgres")]
pub use postgres::{PostgresConfig, PostgresStore};

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use thiserror::Error;

use crate::types::{ModelRecord, VerificationRun};

/// Page size used when streaming history lazily.
const HISTORY_PAGE: usize = 64;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("No runs recorded for {provider}/{model}")]
    NotFound { provider: String, model: String },

    /// Backend temporarily unreachable (connection refused, pool exhausted).
    #[error("Storage unavailable: {message}")]
    Unavailable { message: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn storage(message: impl Into<String>) -> Self {
        StoreError::Storage {
            message: message.into(),
        }
    }

    /// Whether repeating the same write may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable { .. } | StoreError::Io(_))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result of an idempotent save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Inserted,
    /// A run with the same key was already stored; nothing was written.
    AlreadyStored,
}

#[async_trait]
pub trait RunStore: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    /// Store a completed run. Idempotent per [`RunKey`](crate::types::RunKey).
    async fn save(&self, run: &VerificationRun) -> StoreResult<SaveOutcome>;

    /// Runs ordered by attempt time, oldest first.
    async fn history_page(
        &self,
        provider: &str,
        model: &str,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<VerificationRun>>;

    /// Up to `limit` runs attempted strictly after `after`, oldest first.
    async fn history_after(
        &self,
        provider: &str,
        model: &str,
        after: Option<DateTime<Utc>>,
        limit: usize,
    ) -> StoreResult<Vec<VerificationRun>>;

    async fn latest(&self, provider: &str, model: &str) -> StoreResult<VerificationRun>;

    async fn append_snapshot(&self, record: &ModelRecord) -> StoreResult<()>;

    /// Catalog records for one model, ordered by discovery time.
    async fn snapshots(&self, provider: &str, model: &str) -> StoreResult<Vec<ModelRecord>>;

    /// Lazy history stream ordered by attempt time.
    ///
    /// Pages are fetched on demand by keyset, so runs written while the stream
    /// is being consumed never reorder what has already been yielded. Calling
    /// this again replays from the beginning.
    fn history<'a>(
        &'a self,
        provider: &'a str,
        model: &'a str,
    ) -> BoxStream<'a, StoreResult<VerificationRun>> {
        struct Cursor {
            after: Option<DateTime<Utc>>,
            done: bool,
        }

        stream::unfold(
            Cursor {
                after: None,
                done: false,
            },
            move |mut cursor| async move {
                if cursor.done {
                    return None;
                }
                match self
                    .history_after(provider, model, cursor.after, HISTORY_PAGE)
                    .await
                {
                    Ok(page) => {
                        cursor.done = page.len() < HISTORY_PAGE;
                        cursor.after = page.last().map(|r| r.attempt_at).or(cursor.after);
                        let items: Vec<StoreResult<VerificationRun>> =
                            page.into_iter().map(Ok).collect();
                        Some((stream::iter(items), cursor))
                    }
                    Err(e) => {
                        cursor.done = true;
                        Some((stream::iter(vec![Err(e)]), cursor))
                    }
                }
            },
        )
        .flatten()
        .boxed()
    }
}

/// Retry a storage operation with exponential backoff and 10% jitter.
pub(crate) async fn with_retry<F, Fut, T>(
    max_retries: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    operation: F,
) -> StoreResult<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = StoreResult<T>>,
{
    let mut attempt = 0;
    let mut backoff = initial_backoff;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt < max_retries && e.is_retryable() => {
                attempt += 1;
                tracing::warn!(
                    attempt = attempt,
                    error = %e,
                    "Retrying storage operation after transient failure"
                );
                let jitter_factor = 1.0 + (rand::random::<f64>() * 0.2 - 0.1);
                tokio::time::sleep(backoff.mul_f64(jitter_factor)).await;
                backoff = (backoff * 2).min(max_backoff);
            }
            Err(e) => return Err(e),
        }
    }
}

pub(crate) fn not_found(provider: &str, model: &str) -> StoreError {
    StoreError::NotFound {
        provider: provider.to_string(),
        model: model.to_string(),
    }
}


#[cfg(test)]
pub(crate) mod fixtures {
    use std::time::Duration;

    use chrono::{DateTime, TimeZone, Utc};
    use uuid::Uuid;

    use crate::ErrorClass;
    use crate::types::{ProbeOutcome, RunStatus, VerificationRun};

    pub fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    pub fn run(provider: &str, model: &str, attempt_at: DateTime<Utc>) -> VerificationRun {
        VerificationRun {
            run_id: Uuid::new_v4(),
            provider: provider.into(),
            model: model.into(),
            attempt_at,
            outcomes: vec![
                ProbeOutcome::evaluated(
                    "protocol_compliance",
                    true,
                    1.0,
                    Duration::from_millis(120),
                    "pong",
                ),
                ProbeOutcome::failed(
                    "tool_invocation",
                    ErrorClass::Timeout,
                    Duration::from_secs(30),
                    "deadline elapsed",
                ),
            ],
            score: 0.54,
            supported: true,
            duration: Duration::from_millis(4_210),
            status: RunStatus::Succeeded,
        }
    }
}
