//! JSONL file run store.
//!
//! Layout under `base_dir`:
//!
//! ```text
//! runs/<provider>/<model>.jsonl       one VerificationRun per line
//! snapshots/<provider>/<model>.jsonl  one ModelRecord per line
//! ```
//!
//! Files are append-only. An in-memory key index, rebuilt from disk on open,
//! enforces uniqueness; writes hold a single writer lock so the index check and
//! the append are atomic with respect to other writers in this process.
//! Parsed runs are cached per model after the first read and kept current by
//! `save`, so paging through history reads each file once.

use std::collections::{HashMap, HashSet};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::{Mutex, RwLock};

use super::{RunStore, SaveOutcome, StoreError, StoreResult, not_found};
use crate::types::{ModelRecord, RunKey, VerificationRun};

/// File sync mode for durability.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SyncMode {
    /// Leave flushing to the OS.
    #[default]
    None,
    /// fsync after every write.
    OnWrite,
}

#[derive(Clone, Debug)]
pub struct JsonlConfig {
    /// Root directory (default: the platform data directory for `llm-verifier`).
    pub base_dir: PathBuf,
    pub sync_mode: SyncMode,
}

impl Default for JsonlConfig {
    fn default() -> Self {
        Self {
            base_dir: default_data_dir(),
            sync_mode: SyncMode::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("", "", "llm-verifier")
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".llm-verifier"))
}

impl JsonlConfig {
    pub fn builder() -> JsonlConfigBuilder {
        JsonlConfigBuilder::default()
    }

    fn runs_dir(&self) -> PathBuf {
        self.base_dir.join("runs")
    }

    fn snapshots_dir(&self) -> PathBuf {
        self.base_dir.join("snapshots")
    }

    fn run_file(&self, provider: &str, model: &str) -> PathBuf {
        self.runs_dir()
            .join(encode_segment(provider))
            .join(format!("{}.jsonl", encode_segment(model)))
    }

    fn snapshot_file(&self, provider: &str, model: &str) -> PathBuf {
        self.snapshots_dir()
            .join(encode_segment(provider))
            .join(format!("{}.jsonl", encode_segment(model)))
    }
}

/// Make a provider or model id safe as a single path segment.
///
/// Distinct ids may collide after encoding; records carry their full ids and
/// reads filter on them.
fn encode_segment(id: &str) -> String {
    id.replace(['/', '\\'], "-").replace([':', '.'], "_")
}

#[derive(Default)]
pub struct JsonlConfigBuilder {
    base_dir: Option<PathBuf>,
    sync_mode: Option<SyncMode>,
}

impl JsonlConfigBuilder {
    pub fn base_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_dir = Some(path.into());
        self
    }

    pub fn sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync_mode = Some(mode);
        self
    }

    pub fn build(self) -> JsonlConfig {
        JsonlConfig {
            base_dir: self.base_dir.unwrap_or_else(default_data_dir),
            sync_mode: self.sync_mode.unwrap_or_default(),
        }
    }
}

// File operations (blocking, run via spawn_blocking)

fn read_lines_sync<T: DeserializeOwned>(path: &Path) -> StoreResult<Vec<T>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = std::fs::File::open(path)?;
    let reader = BufReader::with_capacity(64 * 1024, file);
    let mut items = Vec::new();

    for (line_num, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(&line) {
            Ok(item) => items.push(item),
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    line = line_num + 1,
                    error = %e,
                    "Skipping malformed JSONL entry"
                );
            }
        }
    }

    Ok(items)
}

fn append_line_sync<T: Serialize>(path: &Path, item: &T, sync: bool) -> StoreResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut line = serde_json::to_vec(item)?;
    line.push(b'\n');

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    file.write_all(&line)?;
    file.flush()?;
    if sync {
        file.sync_all()?;
    }
    Ok(())
}

fn list_files_sync(dir: &Path) -> StoreResult<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !dir.exists() {
        return Ok(files);
    }
    for provider_dir in std::fs::read_dir(dir)? {
        let provider_dir = provider_dir?.path();
        if !provider_dir.is_dir() {
            continue;
        }
        for entry in std::fs::read_dir(&provider_dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "jsonl") {
                files.push(path);
            }
        }
    }
    Ok(files)
}

async fn blocking<T, F>(f: F) -> StoreResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> StoreResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::storage(format!("Blocking task failed: {e}")))?
}

type RunCache = HashMap<(String, String), Arc<Vec<VerificationRun>>>;

#[derive(Debug)]
pub struct JsonlStore {
    config: JsonlConfig,
    index: Arc<RwLock<HashSet<RunKey>>>,
    runs: Arc<RwLock<RunCache>>,
    snapshot_index: Arc<RwLock<HashMap<(String, String), HashSet<DateTime<Utc>>>>>,
    writer: Mutex<()>,
}

impl JsonlStore {
    pub async fn new(config: JsonlConfig) -> StoreResult<Self> {
        tokio::fs::create_dir_all(config.runs_dir()).await?;
        tokio::fs::create_dir_all(config.snapshots_dir()).await?;

        let store = Self {
            config,
            index: Arc::new(RwLock::new(HashSet::new())),
            runs: Arc::new(RwLock::new(HashMap::new())),
            snapshot_index: Arc::new(RwLock::new(HashMap::new())),
            writer: Mutex::new(()),
        };
        store.rebuild_index().await?;
        Ok(store)
    }

    pub async fn default_config() -> StoreResult<Self> {
        Self::new(JsonlConfig::default()).await
    }

    pub fn config(&self) -> &JsonlConfig {
        &self.config
    }

    async fn rebuild_index(&self) -> StoreResult<()> {
        let runs_dir = self.config.runs_dir();
        let snapshots_dir = self.config.snapshots_dir();
        let (keys, snapshot_keys) = blocking(move || {
            let mut keys = HashSet::new();
            for path in list_files_sync(&runs_dir)? {
                for run in read_lines_sync::<VerificationRun>(&path)? {
                    keys.insert(run.key());
                }
            }
            let mut snapshot_keys: HashMap<(String, String), HashSet<DateTime<Utc>>> =
                HashMap::new();
            for path in list_files_sync(&snapshots_dir)? {
                for record in read_lines_sync::<ModelRecord>(&path)? {
                    snapshot_keys
                        .entry((record.provider, record.model_id))
                        .or_default()
                        .insert(record.discovered_at);
                }
            }
            Ok((keys, snapshot_keys))
        })
        .await?;

        tracing::debug!(
            runs = keys.len(),
            base_dir = %self.config.base_dir.display(),
            "Rebuilt JSONL run index"
        );
        *self.index.write().await = keys;
        *self.snapshot_index.write().await = snapshot_keys;
        Ok(())
    }

    /// Every run for one model, sorted by attempt time.
    async fn load_runs(
        &self,
        provider: &str,
        model: &str,
    ) -> StoreResult<Arc<Vec<VerificationRun>>> {
        let slot = (provider.to_string(), model.to_string());
        if let Some(runs) = self.runs.read().await.get(&slot) {
            return Ok(runs.clone());
        }

        // Holding the writer lock keeps appends out until the cache entry exists.
        let _guard = self.writer.lock().await;
        if let Some(runs) = self.runs.read().await.get(&slot) {
            return Ok(runs.clone());
        }
        let path = self.config.run_file(provider, model);
        let mut runs = blocking(move || read_lines_sync::<VerificationRun>(&path)).await?;
        runs.retain(|r| r.provider == provider && r.model == model);
        runs.sort_by_key(|r| r.attempt_at);
        runs.dedup_by_key(|r| r.attempt_at);

        let runs = Arc::new(runs);
        self.runs.write().await.insert(slot, runs.clone());
        Ok(runs)
    }

    async fn cache_run(&self, run: &VerificationRun) {
        let mut cache = self.runs.write().await;
        let Some(runs) = cache.get_mut(&(run.provider.clone(), run.model.clone())) else {
            return;
        };
        let runs = Arc::make_mut(runs);
        let at = runs.partition_point(|r| r.attempt_at < run.attempt_at);
        if runs.get(at).is_none_or(|r| r.attempt_at != run.attempt_at) {
            runs.insert(at, run.clone());
        }
    }

    fn sync(&self) -> bool {
        self.config.sync_mode == SyncMode::OnWrite
    }
}

#[async_trait]
impl RunStore for JsonlStore {
    fn name(&self) -> &str {
        "jsonl"
    }

    async fn save(&self, run: &VerificationRun) -> StoreResult<SaveOutcome> {
        let _guard = self.writer.lock().await;
        let key = run.key();
        if self.index.read().await.contains(&key) {
            tracing::debug!(provider = %run.provider, model = %run.model, "Run already stored");
            return Ok(SaveOutcome::AlreadyStored);
        }

        let path = self.config.run_file(&run.provider, &run.model);
        let sync = self.sync();
        let record = run.clone();
        blocking(move || append_line_sync(&path, &record, sync)).await?;

        self.index.write().await.insert(key);
        self.cache_run(run).await;
        Ok(SaveOutcome::Inserted)
    }

    async fn history_page(
        &self,
        provider: &str,
        model: &str,
        limit: usize,
        offset: usize,
    ) -> StoreResult<Vec<VerificationRun>> {
        let runs = self.load_runs(provider, model).await?;
        Ok(runs.iter().skip(offset).take(limit).cloned().collect())
    }

    async fn history_after(
        &self,
        provider: &str,
        model: &str,
        after: Option<DateTime<Utc>>,
        limit: usize,
    ) -> StoreResult<Vec<VerificationRun>> {
        let runs = self.load_runs(provider, model).await?;
        let start = after.map_or(0, |at| runs.partition_point(|r| r.attempt_at <= at));
        Ok(runs[start..].iter().take(limit).cloned().collect())
    }

    async fn latest(&self, provider: &str, model: &str) -> StoreResult<VerificationRun> {
        self.load_runs(provider, model)
            .await?
            .last()
            .cloned()
            .ok_or_else(|| not_found(provider, model))
    }

    async fn append_snapshot(&self, record: &ModelRecord) -> StoreResult<()> {
        let _guard = self.writer.lock().await;
        let slot = (record.provider.clone(), record.model_id.clone());
        if self
            .snapshot_index
            .read()
            .await
            .get(&slot)
            .is_some_and(|seen| seen.contains(&record.discovered_at))
        {
            return Ok(());
        }

        let path = self.config.snapshot_file(&record.provider, &record.model_id);
        let sync = self.sync();
        let line = record.clone();
        blocking(move || append_line_sync(&path, &line, sync)).await?;

        self.snapshot_index
            .write()
            .await
            .entry(slot)
            .or_default()
            .insert(record.discovered_at);
        Ok(())
    }

    async fn snapshots(&self, provider: &str, model: &str) -> StoreResult<Vec<ModelRecord>> {
        let path = self.config.snapshot_file(provider, model);
        let mut records = blocking(move || read_lines_sync::<ModelRecord>(&path)).await?;
        records.retain(|r| r.provider == provider && r.model_id == model);
        records.sort_by_key(|r| r.discovered_at);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::store::fixtures::{at, run};
    use crate::types::CatalogSource;

    async fn create_test_store() -> (JsonlStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = JsonlConfig::builder()
            .base_dir(dir.path())
            .sync_mode(SyncMode::OnWrite)
            .build();
        (JsonlStore::new(config).await.unwrap(), dir)
    }

    #[tokio::test]
    async fn test_save_and_latest() {
        let (store, _dir) = create_test_store().await;
        let saved = run("openai", "gpt-4o", at(0));
        store.save(&saved).await.unwrap();
        assert_eq!(store.latest("openai", "gpt-4o").await.unwrap(), saved);
    }

    #[tokio::test]
    async fn test_no_duplicate_writes() {
        let (store, dir) = create_test_store().await;
        let saved = run("openai", "gpt-4o", at(0));
        assert_eq!(store.save(&saved).await.unwrap(), SaveOutcome::Inserted);
        assert_eq!(
            store.save(&saved).await.unwrap(),
            SaveOutcome::AlreadyStored
        );

        let content = std::fs::read_to_string(
            dir.path().join("runs").join("openai").join("gpt-4o.jsonl"),
        )
        .unwrap();
        assert_eq!(content.lines().count(), 1);
    }

    #[tokio::test]
    async fn test_index_survives_reopen() {
        let (store, dir) = create_test_store().await;
        let saved = run("groq", "llama-3.1-8b-instant", at(0));
        store.save(&saved).await.unwrap();
        drop(store);

        let reopened = JsonlStore::new(JsonlConfig::builder().base_dir(dir.path()).build())
            .await
            .unwrap();
        assert_eq!(
            reopened.save(&saved).await.unwrap(),
            SaveOutcome::AlreadyStored
        );
        assert_eq!(
            reopened
                .history_page("groq", "llama-3.1-8b-instant", 10, 0)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_history_sorted_despite_append_order() {
        let (store, _dir) = create_test_store().await;
        for secs in [20, 0, 10] {
            store.save(&run("a", "m", at(secs))).await.unwrap();
        }
        let runs = store.history_after("a", "m", Some(at(0)), 10).await.unwrap();
        let times: Vec<_> = runs.iter().map(|r| r.attempt_at).collect();
        assert_eq!(times, vec![at(10), at(20)]);
    }

    #[tokio::test]
    async fn test_history_drains_in_pages_and_tracks_new_saves() {
        let (store, dir) = create_test_store().await;
        for secs in [40, 0, 30, 10] {
            store.save(&run("a", "m", at(secs))).await.unwrap();
        }

        let mut drained = Vec::new();
        let mut cursor = None;
        loop {
            let page = store.history_after("a", "m", cursor, 2).await.unwrap();
            let Some(last) = page.last() else { break };
            cursor = Some(last.attempt_at);
            drained.extend(page.into_iter().map(|r| r.attempt_at));
        }
        assert_eq!(drained, vec![at(0), at(10), at(30), at(40)]);

        // Saved after the model's history was cached.
        store.save(&run("a", "m", at(20))).await.unwrap();
        assert_eq!(
            store.save(&run("a", "m", at(20))).await.unwrap(),
            SaveOutcome::AlreadyStored
        );
        let times: Vec<_> = store
            .history_page("a", "m", 10, 0)
            .await
            .unwrap()
            .iter()
            .map(|r| r.attempt_at)
            .collect();
        assert_eq!(times, vec![at(0), at(10), at(20), at(30), at(40)]);
        assert_eq!(store.latest("a", "m").await.unwrap().attempt_at, at(40));

        drop(store);
        let reopened = JsonlStore::new(JsonlConfig::builder().base_dir(dir.path()).build())
            .await
            .unwrap();
        assert_eq!(reopened.history_page("a", "m", 10, 0).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_colliding_ids_stay_separate() {
        let (store, _dir) = create_test_store().await;
        store.save(&run("a", "org/model", at(0))).await.unwrap();
        store.save(&run("a", "org-model", at(1))).await.unwrap();
        assert_eq!(store.history_page("a", "org/model", 10, 0).await.unwrap().len(), 1);
        assert_eq!(
            store.latest("a", "org-model").await.unwrap().attempt_at,
            at(1)
        );
    }

    #[tokio::test]
    async fn test_skips_malformed_lines() {
        let (store, dir) = create_test_store().await;
        store.save(&run("a", "m", at(0))).await.unwrap();
        let path = dir.path().join("runs").join("a").join("m.jsonl");
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{not json").unwrap();

        assert_eq!(store.history_page("a", "m", 10, 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_log() {
        let (store, _dir) = create_test_store().await;
        let record = ModelRecord::new("openai", "gpt-4o", CatalogSource::Live).with_discovered_at(at(0));
        store.append_snapshot(&record).await.unwrap();
        store.append_snapshot(&record).await.unwrap();
        store
            .append_snapshot(&record.clone().with_discovered_at(at(60)))
            .await
            .unwrap();

        let snaps = store.snapshots("openai", "gpt-4o").await.unwrap();
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0], record);
    }
}
