//! In-memory run store for tests and single-process deployments.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{RunStore, SaveOutcome, StoreResult, not_found};
use crate::types::{ModelRecord, RunKey, VerificationRun};

type SnapshotKey = (String, String, DateTime<Utc>);

#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    runs: Arc<RwLock<BTreeMap<RunKey, VerificationRun>>>,
    snapshots: Arc<RwLock<BTreeMap<SnapshotKey, ModelRecord>>>,
}

fn key(provider: &str, model: &str, attempt_at: DateTime<Utc>) -> RunKey {
    RunKey {
        provider: provider.to_string(),
        model: model.to_string(),
        attempt_at,
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total runs across every provider and model.
    pub async fn count(&self) -> usize {
        self.runs.read().await.len()
    }

    pub async fn clear(&self) {
        self.runs.write().await.clear();
        self.snapshots.write().await.clear();
    }

    async fn collect(
        &self,
        provider: &str,
        model: &str,
        lower: Bound<RunKey>,
        skip: usize,
        limit: usize,
    ) -> Vec<VerificationRun> {
        let upper = Bound::Included(key(provider, model, DateTime::<Utc>::MAX_UTC));
        self.runs
            .read()
            .await
            .range((lower, upper))
            .skip(skip)
            .take(limit)
            .map(|(_, run)| run.clone())
            .collect()
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn save(&self, run: &VerificationRun) -> StoreResult<SaveOutcome> {
        let mut runs = self.runs.write().await;
        let key = run.key();
        if runs.contains_key(&key) {
            tracing::debug!(provider = %run.provider, model = %run.model, "Run already stored");
            return Ok(SaveOutcome::AlreadyStored);
        }
        runs.insert(key, run.clone());
        Ok(SaveOutcome::Inserted)
    }

    async fn history_page(
        &self,
        provider: &str,
        model: &str,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<VerificationRun>> {
        let lower = Bound::Included(key(provider, model, DateTime::<Utc>::MIN_UTC));
        Ok(self.collect(provider, model, lower, offset, limit).await)
    }

    async fn history_after(
        &self,
        provider: &str,
        model: &str,
        after: Option<DateTime<Utc>>,
        limit: usize,
    ) -> StoreResult<Vec<VerificationRun>> {
        let lower = match after {
            Some(at) => Bound::Excluded(key(provider, model, at)),
            None => Bound::Included(key(provider, model, DateTime::<Utc>::MIN_UTC)),
        };
        Ok(self.collect(provider, model, lower, 0, limit).await)
    }

    async fn latest(&self, provider: &str, model: &str) -> StoreResult<VerificationRun> {
        let lower = key(provider, model, DateTime::<Utc>::MIN_UTC);
        let upper = key(provider, model, DateTime::<Utc>::MAX_UTC);
        self.runs
            .read()
            .await
            .range(lower..=upper)
            .next_back()
            .map(|(_, run)| run.clone())
            .ok_or_else(|| not_found(provider, model))
    }

    async fn append_snapshot(&self, record: &ModelRecord) -> StoreResult<()> {
        let key = (
            record.provider.clone(),
            record.model_id.clone(),
            record.discovered_at,
        );
        self.snapshots
            .write()
            .await
            .entry(key)
            .or_insert_with(|| record.clone());
        Ok(())
    }

    async fn snapshots(&self, provider: &str, model: &str) -> StoreResult<Vec<ModelRecord>> {
        let lower = (
            provider.to_string(),
            model.to_string(),
            DateTime::<Utc>::MIN_UTC,
        );
        let upper = (
            provider.to_string(),
            model.to_string(),
            DateTime::<Utc>::MAX_UTC,
        );
        Ok(self
            .snapshots
            .read()
            .await
            .range(lower..=upper)
            .map(|(_, r)| r.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;

    use super::*;
    use crate::store::StoreError;
    use crate::store::fixtures::{at, run};
    use crate::types::CatalogSource;

    #[tokio::test]
    async fn test_save_is_idempotent() {
        let store = MemoryStore::new();
        let first = run("openai", "gpt-4o", at(0));
        assert_eq!(store.save(&first).await.unwrap(), SaveOutcome::Inserted);

        let mut retry = first.clone();
        retry.score = 0.1;
        assert_eq!(store.save(&retry).await.unwrap(), SaveOutcome::AlreadyStored);
        assert_eq!(store.count().await, 1);
        assert_eq!(store.latest("openai", "gpt-4o").await.unwrap(), first);
    }

    #[tokio::test]
    async fn test_history_ordered_and_scoped() {
        let store = MemoryStore::new();
        for secs in [30, 10, 20] {
            store.save(&run("openai", "gpt-4o", at(secs))).await.unwrap();
        }
        store.save(&run("openai", "gpt-4o-mini", at(5))).await.unwrap();
        store.save(&run("groq", "gpt-4o", at(5))).await.unwrap();

        let runs: Vec<_> = store.history("openai", "gpt-4o").try_collect().await.unwrap();
        let times: Vec<_> = runs.iter().map(|r| r.attempt_at).collect();
        assert_eq!(times, vec![at(10), at(20), at(30)]);

        let page = store.history_page("openai", "gpt-4o", 1, 1).await.unwrap();
        assert_eq!(page[0].attempt_at, at(20));
        assert_eq!(
            store.latest("openai", "gpt-4o").await.unwrap().attempt_at,
            at(30)
        );
    }

    #[tokio::test]
    async fn test_history_streams_past_one_page() {
        let store = MemoryStore::new();
        for secs in 0..150 {
            store.save(&run("a", "m", at(secs))).await.unwrap();
        }
        let runs: Vec<_> = store.history("a", "m").try_collect().await.unwrap();
        assert_eq!(runs.len(), 150);
        assert!(runs.windows(2).all(|w| w[0].attempt_at < w[1].attempt_at));
    }

    #[tokio::test]
    async fn test_latest_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.latest("a", "m").await,
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_snapshots_append_only() {
        let store = MemoryStore::new();
        let older = ModelRecord::new("openai", "gpt-4o", CatalogSource::Live).with_discovered_at(at(0));
        let newer = ModelRecord::new("openai", "gpt-4o", CatalogSource::StaticFallback)
            .with_discovered_at(at(60));
        store.append_snapshot(&newer).await.unwrap();
        store.append_snapshot(&older).await.unwrap();
        store.append_snapshot(&older).await.unwrap();

        let snaps = store.snapshots("openai", "gpt-4o").await.unwrap();
        assert_eq!(snaps, vec![older, newer]);
        assert!(store.snapshots("openai", "other").await.unwrap().is_empty());
    }
}
