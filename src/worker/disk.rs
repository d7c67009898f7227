use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result, ensure};
use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::fs as async_fs;
use tracing::warn;

use super::store::{Cache, CacheStorage, CachedResponse};

const TOMBSTONE_PREFIX: &str = "tombstone-";

/// Metadata persisted beside each body file. The cached-at timestamp lives
/// inside `headers`, so the snapshot survives restarts unchanged.
#[derive(Debug, Serialize, Deserialize)]
struct PersistedEntry {
    url: String,
    status: u16,
    headers: Vec<(String, String)>,
    seq: u64,
    content_length: u64,
    content_hash: String,
}

/// Disk-backed cache storage. Each namespace is a directory under the root;
/// entries are sharded body+meta file pairs keyed by the blake3 hash of the
/// request identity. Namespace deletion renames the directory to a tombstone
/// and removes it in the background, so a crash mid-delete never leaves a
/// half-deleted namespace visible.
pub struct DiskStorage {
    root: PathBuf,
    opened: Mutex<HashMap<String, Arc<DiskCache>>>,
}

impl DiskStorage {
    pub async fn new(root: PathBuf) -> Result<Self> {
        async_fs::create_dir_all(&root)
            .await
            .with_context(|| format!("failed to create cache root {}", root.display()))?;

        let mut leftovers = Vec::new();
        let mut entries = async_fs::read_dir(&root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(TOMBSTONE_PREFIX) {
                leftovers.push(entry.path());
            }
        }
        spawn_tombstone_cleanup(leftovers);

        Ok(Self {
            root,
            opened: Mutex::new(HashMap::new()),
        })
    }

    fn namespace_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

#[async_trait]
impl CacheStorage for DiskStorage {
    async fn open(&self, name: &str) -> Result<Arc<dyn Cache>> {
        ensure!(
            namespace_name_is_safe(name),
            "cache namespace name '{name}' contains unsupported characters"
        );
        if let Some(existing) = self.opened.lock().get(name) {
            return Ok(existing.clone());
        }

        let dir = self.namespace_dir(name);
        async_fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create cache namespace {}", dir.display()))?;
        let cache = DiskCache::rebuild(dir).await?;
        let cache = Arc::new(cache);

        // A racing open may have inserted first; keep whichever handle won.
        let mut opened = self.opened.lock();
        let entry = opened.entry(name.to_string()).or_insert_with(|| cache);
        Ok(entry.clone())
    }

    async fn delete(&self, name: &str) -> Result<bool> {
        self.opened.lock().remove(name);
        let dir = self.namespace_dir(name);
        let tombstone = self
            .root
            .join(format!("{TOMBSTONE_PREFIX}{name}-{}", uuid::Uuid::new_v4()));
        match async_fs::rename(&dir, &tombstone).await {
            Ok(()) => {
                spawn_tombstone_cleanup(vec![tombstone]);
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = async_fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(TOMBSTONE_PREFIX) {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }
}

fn namespace_name_is_safe(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(TOMBSTONE_PREFIX)
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'.' || b == b'_')
}

fn spawn_tombstone_cleanup(dirs: Vec<PathBuf>) {
    for dir in dirs {
        tokio::spawn(async move {
            match async_fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    warn!(
                        error = %err,
                        path = %dir.display(),
                        "failed to remove tombstoned cache namespace"
                    );
                }
            }
        });
    }
}

struct IndexEntry {
    seq: u64,
    entry_id: String,
    status: StatusCode,
    headers: HeaderMap,
}

#[derive(Default)]
struct DiskIndex {
    order: Vec<String>,
    entries: HashMap<String, IndexEntry>,
}

impl DiskIndex {
    fn insert(&mut self, url: String, entry: IndexEntry) {
        if self.entries.insert(url.clone(), entry).is_some() {
            self.order.retain(|existing| *existing != url);
        }
        self.order.push(url);
    }

    fn remove(&mut self, url: &str) -> Option<IndexEntry> {
        let removed = self.entries.remove(url);
        if removed.is_some() {
            self.order.retain(|existing| existing != url);
        }
        removed
    }
}

struct DiskCache {
    dir: PathBuf,
    index: Mutex<DiskIndex>,
    next_seq: AtomicU64,
}

impl DiskCache {
    /// Rebuilds the in-memory index from the meta files on disk, ordered by
    /// their persisted insertion sequence. Corrupt metadata and orphaned
    /// bodies are removed rather than surfaced.
    async fn rebuild(dir: PathBuf) -> Result<Self> {
        let scan_dir = dir.clone();
        let scanned = tokio::task::spawn_blocking(move || scan_namespace_dir(&scan_dir))
            .await
            .context("cache rebuild task failed")??;

        let mut max_seq = 0u64;
        let mut index = DiskIndex::default();
        let mut ordered = scanned;
        ordered.sort_by_key(|(_, entry)| entry.seq);
        for (url, entry) in ordered {
            max_seq = max_seq.max(entry.seq);
            index.insert(url, entry);
        }

        Ok(Self {
            dir,
            index: Mutex::new(index),
            next_seq: AtomicU64::new(max_seq + 1),
        })
    }

    fn body_path(&self, entry_id: &str) -> PathBuf {
        sharded_path(&self.dir, entry_id)
    }

    fn meta_path(&self, entry_id: &str) -> PathBuf {
        let mut path = self.body_path(entry_id);
        path.set_extension("meta");
        path
    }
}

fn entry_id_for(url: &str) -> String {
    blake3::hash(url.as_bytes()).to_hex().to_string()
}

fn sharded_path(dir: &Path, entry_id: &str) -> PathBuf {
    let (first, remainder) = entry_id.split_at(2);
    let (second, _) = remainder.split_at(2);
    dir.join(first).join(second).join(entry_id)
}

type ScannedEntry = (String, IndexEntry);

fn scan_namespace_dir(dir: &Path) -> Result<Vec<ScannedEntry>> {
    let mut found = Vec::new();
    if !dir.exists() {
        return Ok(found);
    }
    for shard1 in std::fs::read_dir(dir)? {
        let shard1 = shard1?;
        if !shard1.file_type()?.is_dir() {
            continue;
        }
        for shard2 in std::fs::read_dir(shard1.path())? {
            let shard2 = shard2?;
            if !shard2.file_type()?.is_dir() {
                continue;
            }
            let mut meta_files = Vec::new();
            let mut other_files = Vec::new();
            for entry in std::fs::read_dir(shard2.path())? {
                let entry = entry?;
                let path = entry.path();
                if entry.file_type()?.is_file() {
                    if path.extension().and_then(|ext| ext.to_str()) == Some("meta") {
                        meta_files.push(path);
                    } else {
                        other_files.push(path);
                    }
                }
            }

            let mut live_ids = Vec::new();
            for meta_path in meta_files {
                match restore_entry(&meta_path) {
                    Some((url, entry)) => {
                        live_ids.push(entry.entry_id.clone());
                        found.push((url, entry));
                    }
                    None => {
                        remove_entry_files(&meta_path);
                    }
                }
            }

            for path in other_files {
                let keep = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|name| live_ids.iter().any(|id| id.as_str() == name))
                    .unwrap_or(false);
                if !keep {
                    std::fs::remove_file(&path).ok();
                }
            }
        }
    }
    Ok(found)
}

fn restore_entry(meta_path: &Path) -> Option<ScannedEntry> {
    let data = match std::fs::read(meta_path) {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(
                path = %meta_path.display(),
                error = %err,
                "failed to read cache metadata"
            );
            return None;
        }
    };

    let persisted: PersistedEntry = match serde_json::from_slice(&data) {
        Ok(value) => value,
        Err(err) => {
            warn!(
                path = %meta_path.display(),
                error = %err,
                "failed to parse cache metadata; removing entry"
            );
            return None;
        }
    };

    let entry_id = entry_id_for(&persisted.url);
    let file_stem = meta_path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
    if entry_id != file_stem {
        warn!(
            expected = entry_id,
            actual = file_stem,
            "cache metadata key mismatch; removing entry"
        );
        return None;
    }

    let body_path = meta_path.with_extension("");
    let body_len = match std::fs::metadata(&body_path) {
        Ok(metadata) => metadata.len(),
        Err(_) => return None,
    };
    if body_len != persisted.content_length {
        warn!(
            path = %body_path.display(),
            "cache body length mismatch; removing entry"
        );
        return None;
    }

    let status = StatusCode::from_u16(persisted.status).unwrap_or(StatusCode::OK);
    let headers = to_headermap(&persisted.headers);
    let entry = IndexEntry {
        seq: persisted.seq,
        entry_id,
        status,
        headers,
    };
    Some((persisted.url, entry))
}

fn remove_entry_files(meta_path: &Path) {
    let body_path = meta_path.with_extension("");
    std::fs::remove_file(body_path).ok();
    std::fs::remove_file(meta_path).ok();
}

fn to_headermap(items: &[(String, String)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in items {
        if let (Ok(name), Ok(value)) = (
            http::header::HeaderName::try_from(name.as_str()),
            http::HeaderValue::from_str(value),
        ) {
            map.append(name, value);
        }
    }
    map
}

fn headermap_to_vec(map: &HeaderMap) -> Vec<(String, String)> {
    let mut items = Vec::new();
    for (name, value) in map.iter() {
        if let Ok(value_str) = value.to_str() {
            items.push((name.as_str().to_string(), value_str.to_string()));
        }
    }
    items
}

#[async_trait]
impl Cache for DiskCache {
    async fn get(&self, url: &str) -> Result<Option<CachedResponse>> {
        let (entry_id, status, headers) = {
            let index = self.index.lock();
            match index.entries.get(url) {
                Some(entry) => (entry.entry_id.clone(), entry.status, entry.headers.clone()),
                None => return Ok(None),
            }
        };

        let body_path = self.body_path(&entry_id);
        match async_fs::read(&body_path).await {
            Ok(body) => Ok(Some(CachedResponse::new(
                status,
                headers,
                Bytes::from(body),
            ))),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!(
                    path = %body_path.display(),
                    "cache body missing on disk; dropping index entry"
                );
                self.index.lock().remove(url);
                let _ = async_fs::remove_file(self.meta_path(&entry_id)).await;
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn put(&self, url: &str, response: CachedResponse) -> Result<()> {
        let entry_id = entry_id_for(url);
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let body_path = self.body_path(&entry_id);
        let shard_dir = body_path
            .parent()
            .map(|path| path.to_path_buf())
            .context("cache entry path missing parent")?;
        async_fs::create_dir_all(&shard_dir).await?;

        // Write the body through a temp file so a crash never leaves a
        // partially written entry at the final path.
        let temp_path = self.dir.join(format!("tmp_{}", uuid::Uuid::new_v4()));
        async_fs::write(&temp_path, &response.body).await?;
        if let Err(err) = async_fs::rename(&temp_path, &body_path).await {
            let _ = async_fs::remove_file(&temp_path).await;
            return Err(err.into());
        }

        let persisted = PersistedEntry {
            url: url.to_string(),
            status: response.status.as_u16(),
            headers: headermap_to_vec(&response.headers),
            seq,
            content_length: response.body.len() as u64,
            content_hash: blake3::hash(&response.body).to_hex().to_string(),
        };
        let meta_path = self.meta_path(&entry_id);
        async_fs::write(&meta_path, serde_json::to_vec(&persisted)?).await?;

        let entry = IndexEntry {
            seq,
            entry_id,
            status: response.status,
            headers: response.headers,
        };
        self.index.lock().insert(url.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, url: &str) -> Result<bool> {
        let removed = self.index.lock().remove(url);
        match removed {
            Some(entry) => {
                let _ = async_fs::remove_file(self.body_path(&entry.entry_id)).await;
                let _ = async_fs::remove_file(self.meta_path(&entry.entry_id)).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.index.lock().order.clone())
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.index.lock().entries.len())
    }
}
