use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::{EventStore, MemoryStore, StoreStats};
use crate::error::StoreError;
use crate::types::{CapturedEvent, Endpoint};

const CATALOG_FILE: &str = "endpoints.json";
const JOURNAL_DIR: &str = "requests";
const JOURNAL_EXT: &str = "jsonl";

/// Catalog row. Counters are derived from the journal on open.
#[derive(Debug, Serialize, Deserialize)]
struct CatalogRow {
    id: String,
    name: String,
    created_at: DateTime<Utc>,
}

impl From<&Endpoint> for CatalogRow {
    fn from(endpoint: &Endpoint) -> Self {
        Self {
            id: endpoint.id.clone(),
            name: endpoint.name.clone(),
            created_at: endpoint.created_at,
        }
    }
}

/// One endpoint's JSON-lines journal. The state lock covers a single append
/// or rewrite; appends are synced after it is released.
struct Journal {
    path: PathBuf,
    state: Mutex<JournalState>,
}

#[derive(Default)]
struct JournalState {
    writer: Option<fs::File>,
    /// Set by delete; appends after this fail and rewrites are skipped.
    closed: bool,
}

impl Journal {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            state: Mutex::new(JournalState::default()),
        }
    }

    /// Write one line and return a handle to sync it with. A failed write is
    /// truncated away before the lock is released.
    async fn append(&self, endpoint_id: &str, line: &[u8]) -> Result<fs::File, StoreError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(StoreError::NotFound(endpoint_id.to_string()));
        }
        let mut file = match state.writer.take() {
            Some(file) => file,
            None => {
                fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)
                    .await?
            }
        };
        let start = file.metadata().await?.len();

        match write_line(&mut file, line).await {
            Ok(sync_handle) => {
                state.writer = Some(file);
                Ok(sync_handle)
            }
            Err(e) => {
                if let Err(undo) = file.set_len(start).await {
                    error!(
                        "failed to truncate {} after a failed append: {undo}",
                        self.path.display()
                    );
                }
                Err(e.into())
            }
        }
    }

    /// Rewrite the journal without `event_id`.
    async fn retract(&self, event_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(());
        }
        let kept: Vec<CapturedEvent> = read_journal(&self.path)
            .await?
            .into_iter()
            .filter(|e| e.id != event_id)
            .collect();
        let mut content = Vec::new();
        for event in &kept {
            content.extend(serde_json::to_vec(event)?);
            content.push(b'\n');
        }
        // The rename swaps the inode; the next append reopens the path.
        state.writer = None;
        write_atomic(&self.path, &content).await
    }

    async fn close(&self) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.closed = true;
        state.writer = None;
        remove_if_exists(&self.path).await
    }
}

/// Durable store: `endpoints.json` plus one append-only JSON-lines journal
/// per endpoint under `requests/`. Reads are served from an in-memory index.
pub struct FileStore {
    index: MemoryStore,
    data_dir: PathBuf,
    catalog_lock: Mutex<()>,
    journals: Mutex<HashMap<String, Arc<Journal>>>,
}

impl FileStore {
    /// Open (or create) a store rooted at `data_dir` and rebuild the index.
    pub async fn open(data_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let data_dir = data_dir.into();
        fs::create_dir_all(data_dir.join(JOURNAL_DIR)).await?;

        let store = Self {
            index: MemoryStore::new(),
            data_dir,
            catalog_lock: Mutex::new(()),
            journals: Mutex::new(HashMap::new()),
        };
        store.load().await?;
        Ok(store)
    }

    async fn load(&self) -> Result<(), StoreError> {
        let catalog_path = self.data_dir.join(CATALOG_FILE);
        let rows: Vec<CatalogRow> = match fs::read_to_string(&catalog_path).await {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let mut events_total = 0usize;
        for row in &rows {
            let events = read_journal(&self.journal_path(&row.id)).await?;
            events_total += events.len();
            let endpoint = Endpoint {
                id: row.id.clone(),
                name: row.name.clone(),
                created_at: row.created_at,
                last_request_at: None,
                request_count: 0,
            };
            self.index.restore(endpoint, events).await?;
        }

        self.remove_orphan_journals(&rows).await?;
        info!(
            "loaded {} endpoints and {} events from {}",
            rows.len(),
            events_total,
            self.data_dir.display()
        );
        Ok(())
    }

    /// Journals left behind by an interrupted delete, and stray rewrite temps.
    async fn remove_orphan_journals(&self, rows: &[CatalogRow]) -> Result<(), StoreError> {
        let mut dir = fs::read_dir(self.data_dir.join(JOURNAL_DIR)).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            let is_journal = path.extension().and_then(|s| s.to_str()) == Some(JOURNAL_EXT);
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if !is_journal || !rows.iter().any(|r| r.id == stem) {
                warn!("removing orphaned journal {}", path.display());
                remove_if_exists(&path).await?;
            }
        }
        Ok(())
    }

    fn journal_path(&self, endpoint_id: &str) -> PathBuf {
        self.data_dir
            .join(JOURNAL_DIR)
            .join(format!("{endpoint_id}.{JOURNAL_EXT}"))
    }

    /// Journal for a live endpoint. Entries are only created for ids the
    /// index holds; `delete_endpoint` removes them.
    async fn journal(&self, endpoint_id: &str) -> Option<Arc<Journal>> {
        let mut journals = self.journals.lock().await;
        if let Some(journal) = journals.get(endpoint_id) {
            return Some(journal.clone());
        }
        if !self.index.contains(endpoint_id).await {
            return None;
        }
        let journal = Arc::new(Journal::new(self.journal_path(endpoint_id)));
        journals.insert(endpoint_id.to_string(), journal.clone());
        Some(journal)
    }

    /// Append, sync, then index. Anything failing after the line is written
    /// takes it back out of the journal.
    async fn commit(
        &self,
        journal: &Journal,
        event: CapturedEvent,
    ) -> Result<CapturedEvent, StoreError> {
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        let handle = journal.append(&event.endpoint_id, &line).await?;

        let committed = match handle.sync_data().await {
            Ok(()) => self.index.append(event.clone()).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = committed {
            if let Err(undo) = journal.retract(&event.id).await {
                error!(
                    "failed to retract event {} from {}: {undo}",
                    event.id,
                    journal.path.display()
                );
            }
            return Err(e);
        }
        Ok(event)
    }

    async fn catalog_rows(&self) -> Result<Vec<CatalogRow>, StoreError> {
        Ok(self
            .index
            .list_endpoints()
            .await?
            .iter()
            .map(CatalogRow::from)
            .collect())
    }

    async fn write_catalog(&self, rows: &[CatalogRow]) -> Result<(), StoreError> {
        let content = serde_json::to_vec_pretty(rows)?;
        write_atomic(&self.data_dir.join(CATALOG_FILE), &content).await
    }
}

#[async_trait]
impl EventStore for FileStore {
    async fn insert_endpoint(&self, endpoint: Endpoint) -> Result<(), StoreError> {
        let _guard = self.catalog_lock.lock().await;
        if self.index.contains(&endpoint.id).await {
            return Err(StoreError::Conflict(endpoint.id));
        }
        let mut rows = self.catalog_rows().await?;
        rows.push(CatalogRow::from(&endpoint));
        self.write_catalog(&rows).await?;
        self.index.insert_endpoint(endpoint).await
    }

    async fn list_endpoints(&self) -> Result<Vec<Endpoint>, StoreError> {
        self.index.list_endpoints().await
    }

    async fn get_endpoint(&self, id: &str) -> Result<Option<Endpoint>, StoreError> {
        self.index.get_endpoint(id).await
    }

    async fn delete_endpoint(&self, id: &str) -> Result<bool, StoreError> {
        {
            let _guard = self.catalog_lock.lock().await;
            let mut rows = self.catalog_rows().await?;
            let before = rows.len();
            rows.retain(|r| r.id != id);
            if rows.len() == before {
                return Ok(false);
            }
            // Catalog first: if it cannot be written the endpoint stays live.
            self.write_catalog(&rows).await?;
            self.index.delete_endpoint(id).await?;
        }

        // The catalog no longer references the journal, so a failure here
        // leaves only an orphan that the next open() sweeps.
        let journal = self.journals.lock().await.remove(id);
        match journal {
            Some(journal) => journal.close().await?,
            None => remove_if_exists(&self.journal_path(id)).await?,
        }
        Ok(true)
    }

    async fn insert_event(&self, mut event: CapturedEvent) -> Result<CapturedEvent, StoreError> {
        let journal = self
            .journal(&event.endpoint_id)
            .await
            .ok_or_else(|| StoreError::NotFound(event.endpoint_id.clone()))?;
        event.sequence = self.index.allocate_sequence();
        self.commit(&journal, event).await
    }

    async fn remove_event(&self, endpoint_id: &str, event_id: &str) -> Result<(), StoreError> {
        if let Some(journal) = self.journal(endpoint_id).await {
            journal.retract(event_id).await?;
        }
        self.index.remove_event(endpoint_id, event_id).await
    }

    async fn touch_endpoint(&self, id: &str, at: DateTime<Utc>) -> Result<Endpoint, StoreError> {
        self.index.touch_endpoint(id, at).await
    }

    async fn list_events(&self, endpoint_id: &str) -> Result<Vec<CapturedEvent>, StoreError> {
        self.index.list_events(endpoint_id).await
    }

    async fn list_all_events(&self) -> Result<Vec<CapturedEvent>, StoreError> {
        self.index.list_all_events().await
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        self.index.stats().await
    }
}

async fn read_journal(path: &Path) -> Result<Vec<CapturedEvent>, StoreError> {
    let content = match fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut events = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<CapturedEvent>(line) {
            Ok(event) => events.push(event),
            Err(e) => warn!(
                "skipping malformed line {} in {}: {e}",
                lineno + 1,
                path.display()
            ),
        }
    }
    Ok(events)
}

/// Write and flush one line, then hand back a second handle to the file.
async fn write_line(file: &mut fs::File, line: &[u8]) -> std::io::Result<fs::File> {
    file.write_all(line).await?;
    file.flush().await?;
    file.try_clone().await
}

async fn write_atomic(path: &Path, content: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp).await?;
    file.write_all(content).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
