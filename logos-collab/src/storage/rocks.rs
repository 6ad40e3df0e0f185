//! RocksDB-backed durable shape store.
//!
//! Column families:
//! - `canvases` — Full canvas documents (JSON, LZ4 compressed), keyed by canvas id
//! - `metadata` — Canvas metadata (bincode: version, shape count, sizes, timestamps)
//! - `retired` — Last version of each deleted canvas (bincode u64)
//!
//! Each commit writes document and metadata in one `WriteBatch`, so a crash
//! never leaves the two out of step. Versions survive reopen because they are
//! part of the stored document. A canvas re-created after deletion resumes
//! above its retired version, so readers never see a version go backwards.
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)
//! Reference: Patterson & Hennessy — Section 5.7 (I/O Performance)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use logos_canvas::{now_millis, CanvasDocument, CanvasId, ShapeWrite};
use tokio::sync::Mutex;

use super::{BoxFuture, DurableShapeStore, SnapshotHub, SnapshotStream, StoreError, StoreResult};

/// Column family names.
const CF_CANVASES: &str = "canvases";
const CF_METADATA: &str = "metadata";
const CF_RETIRED: &str = "retired";

const COLUMN_FAMILIES: &[&str] = &[CF_CANVASES, CF_METADATA, CF_RETIRED];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every commit (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("logos_canvas_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches, given directory.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Metadata stored next to each canvas document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanvasMetadata {
    pub canvas_id: String,
    pub version: u64,
    pub shape_count: u64,
    /// Uncompressed JSON size in bytes
    pub snapshot_size: u64,
    pub compressed_size: u64,
    /// Milliseconds since the Unix epoch
    pub created_at: u64,
    pub updated_at: u64,
}

impl CanvasMetadata {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(meta)
    }
}

/// RocksDB-backed [`DurableShapeStore`].
pub struct RocksShapeStore {
    /// RocksDB instance (single-threaded mode — concurrency via tokio)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    hub: SnapshotHub,
    /// Serializes read-modify-write of documents.
    commit_lock: Mutex<()>,
}

impl RocksShapeStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        // One block cache shared by every column family.
        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config, &cache)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        info!("Opened canvas store at {}", config.path.display());

        Ok(Self {
            db,
            config,
            hub: SnapshotHub::new(),
            commit_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig, cache: &Cache) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);

        match name {
            // Values are already LZ4 framed.
            CF_CANVASES => opts.set_compression_type(DBCompressionType::None),
            CF_METADATA | CF_RETIRED => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }

        opts
    }

    // ─── Canvas Documents ─────────────────────────────────────────────

    /// Read a stored document, if any.
    pub fn read_document(&self, canvas: &CanvasId) -> Result<Option<CanvasDocument>, StoreError> {
        let cf = self.cf(CF_CANVASES)?;
        match self.db.get_cf(cf, canvas.as_str().as_bytes())? {
            Some(compressed) => {
                let json = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::Compression(e.to_string()))?;
                let doc = serde_json::from_slice(&json)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok(Some(doc))
            }
            None => Ok(None),
        }
    }

    /// Write document and metadata atomically.
    fn write_document(&self, doc: &CanvasDocument) -> Result<CanvasMetadata, StoreError> {
        let cf_docs = self.cf(CF_CANVASES)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let json = serde_json::to_vec(doc).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&json);

        let created_at = self
            .load_metadata(&doc.id)?
            .map(|m| m.created_at)
            .unwrap_or(doc.last_updated);
        let meta = CanvasMetadata {
            canvas_id: doc.id.to_string(),
            version: doc.version,
            shape_count: doc.shapes.len() as u64,
            snapshot_size: json.len() as u64,
            compressed_size: compressed.len() as u64,
            created_at,
            updated_at: doc.last_updated,
        };

        let key = doc.id.as_str().as_bytes();
        let mut batch = WriteBatch::default();
        batch.put_cf(cf_docs, key, &compressed);
        batch.put_cf(cf_meta, key, meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(meta)
    }

    fn load_or_create(&self, canvas: &CanvasId) -> Result<Arc<CanvasDocument>, StoreError> {
        if let Some(doc) = self.read_document(canvas)? {
            return Ok(Arc::new(doc));
        }
        let doc = match self.retired_version(canvas)? {
            Some(retired) => {
                info!("Re-creating canvas {} above retired v{}", canvas, retired);
                CanvasDocument::recreated(canvas.clone(), retired, now_millis())
            }
            None => {
                info!("Created canvas {}", canvas);
                CanvasDocument::empty(canvas.clone(), now_millis())
            }
        };
        self.write_document(&doc)?;
        Ok(Arc::new(doc))
    }

    // ─── Metadata ─────────────────────────────────────────────────────

    pub fn load_metadata(&self, canvas: &CanvasId) -> Result<Option<CanvasMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(cf, canvas.as_str().as_bytes())? {
            Some(bytes) => CanvasMetadata::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn canvas_ids(&self) -> Result<Vec<CanvasId>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let id = std::str::from_utf8(&key)
                .map_err(|e| StoreError::Serialization(format!("Invalid canvas key: {e}")))?;
            ids.push(CanvasId::from(id));
        }
        Ok(ids)
    }

    /// Last version of `canvas` before it was deleted, if it ever was.
    pub fn retired_version(&self, canvas: &CanvasId) -> Result<Option<u64>, StoreError> {
        let cf = self.cf(CF_RETIRED)?;
        match self.db.get_cf(cf, canvas.as_str().as_bytes())? {
            Some(bytes) => {
                let (version, _) =
                    bincode::serde::decode_from_slice::<u64, _>(&bytes, bincode::config::standard())
                        .map_err(|e| StoreError::Serialization(e.to_string()))?;
                Ok(Some(version))
            }
            None => Ok(None),
        }
    }

    fn remove_document(&self, canvas: &CanvasId) -> Result<bool, StoreError> {
        let Some(meta) = self.load_metadata(canvas)? else {
            return Ok(false);
        };
        let retired = bincode::serde::encode_to_vec(meta.version, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let key = canvas.as_str().as_bytes();
        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf(CF_CANVASES)?, key);
        batch.delete_cf(self.cf(CF_METADATA)?, key);
        batch.put_cf(self.cf(CF_RETIRED)?, key, retired);
        self.db.write(batch)?;
        Ok(true)
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }
}

impl DurableShapeStore for RocksShapeStore {
    fn load<'a>(&'a self, canvas: &'a CanvasId) -> BoxFuture<'a, StoreResult<Arc<CanvasDocument>>> {
        Box::pin(async move {
            let _guard = self.commit_lock.lock().await;
            self.load_or_create(canvas)
        })
    }

    fn commit<'a>(
        &'a self,
        canvas: &'a CanvasId,
        writes: Vec<ShapeWrite>,
    ) -> BoxFuture<'a, StoreResult<Arc<CanvasDocument>>> {
        Box::pin(async move {
            let _guard = self.commit_lock.lock().await;
            let mut doc = CanvasDocument::clone(&self.load_or_create(canvas)?);
            doc.apply_writes(&writes, now_millis())?;
            let meta = self.write_document(&doc)?;
            debug!(
                "Committed {} write(s) to {} → v{} ({} → {} bytes)",
                writes.len(),
                canvas,
                meta.version,
                meta.snapshot_size,
                meta.compressed_size
            );
            let doc = Arc::new(doc);
            self.hub.publish(doc.clone());
            Ok(doc)
        })
    }

    fn subscribe<'a>(&'a self, canvas: &'a CanvasId) -> BoxFuture<'a, StoreResult<SnapshotStream>> {
        Box::pin(async move {
            let _guard = self.commit_lock.lock().await;
            let doc = self.load_or_create(canvas)?;
            Ok(self.hub.subscribe(doc))
        })
    }

    fn delete_canvas<'a>(&'a self, canvas: &'a CanvasId) -> BoxFuture<'a, StoreResult<()>> {
        Box::pin(async move {
            let _guard = self.commit_lock.lock().await;
            let removed = self.remove_document(canvas)?;
            self.hub.close(canvas);
            if removed {
                info!("Deleted canvas {}", canvas);
                Ok(())
            } else {
                Err(StoreError::NotFound(canvas.clone()))
            }
        })
    }

    fn list_canvases(&self) -> BoxFuture<'_, StoreResult<Vec<CanvasId>>> {
        Box::pin(async move { self.canvas_ids() })
    }
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use logos_canvas::{NewShape, ShapeId};
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> RocksShapeStore {
        RocksShapeStore::open(StoreConfig::for_testing(dir.path())).unwrap()
    }

    fn rect(id: &str) -> ShapeWrite {
        ShapeWrite::Append(
            NewShape::rectangle(1.0, 2.0, 3.0, 4.0)
                .with_id(id)
                .into_record("alice", 1)
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn test_store_open_creates_lazily() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let canvas = CanvasId::from("main");

        assert!(store.load_metadata(&canvas).unwrap().is_none());
        let doc = store.load(&canvas).await.unwrap();
        assert_eq!(doc.version, 0);
        let meta = store.load_metadata(&canvas).unwrap().unwrap();
        assert_eq!(meta.version, 0);
        assert_eq!(meta.shape_count, 0);
    }

    #[tokio::test]
    async fn test_commit_updates_metadata() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let canvas = CanvasId::from("main");

        store.commit(&canvas, vec![rect("a"), rect("b")]).await.unwrap();
        let meta = store.load_metadata(&canvas).unwrap().unwrap();
        assert_eq!(meta.version, 1);
        assert_eq!(meta.shape_count, 2);
        assert!(meta.compressed_size > 0);
        assert_eq!(meta.canvas_id, "main");
    }

    #[tokio::test]
    async fn test_rejected_commit_not_persisted() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let canvas = CanvasId::from("main");

        store.commit(&canvas, vec![rect("a")]).await.unwrap();
        assert!(store.commit(&canvas, vec![rect("a")]).await.is_err());

        let doc = store.read_document(&canvas).unwrap().unwrap();
        assert_eq!(doc.version, 1);
        assert_eq!(doc.len(), 1);
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);

        store.load(&CanvasId::from("b")).await.unwrap();
        store.load(&CanvasId::from("a")).await.unwrap();
        let ids = store.list_canvases().await.unwrap();
        assert_eq!(ids, vec![CanvasId::from("a"), CanvasId::from("b")]);

        store.delete_canvas(&CanvasId::from("a")).await.unwrap();
        assert_eq!(store.list_canvases().await.unwrap(), vec![CanvasId::from("b")]);
        assert!(store.delete_canvas(&CanvasId::from("a")).await.is_err());
    }

    #[tokio::test]
    async fn test_recreated_canvas_resumes_above_retired_version() {
        let dir = TempDir::new().unwrap();
        let canvas = CanvasId::from("main");
        {
            let store = open(&dir);
            store.commit(&canvas, vec![rect("a")]).await.unwrap();
            store.commit(&canvas, vec![rect("b")]).await.unwrap();
            store.delete_canvas(&canvas).await.unwrap();
            assert_eq!(store.retired_version(&canvas).unwrap(), Some(2));
        }

        // Survives reopen.
        let store = open(&dir);
        let doc = store.load(&canvas).await.unwrap();
        assert!(doc.is_empty());
        assert_eq!(doc.version, 3);
        let doc = store.commit(&canvas, vec![rect("c")]).await.unwrap();
        assert_eq!(doc.version, 4);
        assert_eq!(store.list_canvases().await.unwrap(), vec![canvas]);
    }

    #[tokio::test]
    async fn test_subscription_receives_commit() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);
        let canvas = CanvasId::from("main");

        let mut stream = store.subscribe(&canvas).await.unwrap();
        stream.next().await.unwrap().unwrap();
        store.commit(&canvas, vec![rect("a")]).await.unwrap();
        let doc = stream.next().await.unwrap().unwrap();
        assert!(doc.contains(&ShapeId::from("a")));
    }

    #[test]
    fn test_metadata_encode_decode() {
        let meta = CanvasMetadata {
            canvas_id: "main".into(),
            version: 7,
            shape_count: 3,
            snapshot_size: 900,
            compressed_size: 300,
            created_at: 1,
            updated_at: 2,
        };
        let bytes = meta.encode().unwrap();
        assert_eq!(CanvasMetadata::decode(&bytes).unwrap(), meta);
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(!config.sync_writes);
    }
}
