//! RocksDB-backed durable snapshot store.
//!
//! Column families:
//! - `snapshots` — one LZ4-compressed CRDT snapshot blob per document
//! - `revisions` — per-document monotonic revision counter (8 bytes BE)
//!
//! The snapshot key holds exactly one value: every flush overwrites
//! the previous blob atomically, so a reader sees either the old or
//! the new committed state, never a torn write.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, MultiThreaded, Options, WriteOptions,
};
use uuid::Uuid;

use super::{SnapshotStore, StoreError};

const CF_SNAPSHOTS: &str = "snapshots";
const CF_REVISIONS: &str = "revisions";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_REVISIONS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path.
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB).
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10).
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false).
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256).
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB).
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("cowrite_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Small caches for tests.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 2 * 1024 * 1024,
        }
    }
}

/// RocksDB-backed document store.
pub struct RocksStore {
    db: DBWithThreadMode<MultiThreaded>,
    config: StoreConfig,
    /// Serializes the read-modify-write revision bump. The registry
    /// routes all connections for a document through one process, so
    /// process-local mutual exclusion is sufficient.
    revision_lock: Mutex<()>,
}

impl RocksStore {
    /// Open the store at the configured path, creating the database
    /// and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<MultiThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        Ok(Self {
            db,
            config,
            revision_lock: Mutex::new(()),
        })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.optimize_for_point_lookup(config.block_cache_size as u64);

        opts
    }

    fn write_opts(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    fn cf(&self, name: &str) -> Result<std::sync::Arc<rocksdb::BoundColumnFamily<'_>>, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    /// Flush memtables to disk. Called on graceful shutdown.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db
            .flush()
            .map_err(|e| StoreError::Database(e.to_string()))
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }
}

impl SnapshotStore for RocksStore {
    fn load_snapshot(&self, doc_id: Uuid) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        match self.db.get_cf(&cf, doc_id.as_bytes())? {
            Some(compressed) => {
                let state = lz4_flex::decompress_size_prepended(&compressed)
                    .map_err(|e| StoreError::Compression(e.to_string()))?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    fn save_snapshot(&self, doc_id: Uuid, state: &[u8]) -> Result<(), StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let compressed = lz4_flex::compress_prepend_size(state);
        self.db
            .put_cf_opt(&cf, doc_id.as_bytes(), &compressed, &self.write_opts())?;
        Ok(())
    }

    fn bump_revision(&self, doc_id: Uuid) -> Result<u64, StoreError> {
        let cf = self.cf(CF_REVISIONS)?;
        let _guard = self
            .revision_lock
            .lock()
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let current = match self.db.get_cf(&cf, doc_id.as_bytes())? {
            Some(bytes) => decode_revision(&bytes)?,
            None => 0,
        };
        let next = current + 1;
        self.db.put_cf_opt(
            &cf,
            doc_id.as_bytes(),
            next.to_be_bytes(),
            &self.write_opts(),
        )?;
        Ok(next)
    }

    fn revision(&self, doc_id: Uuid) -> Result<u64, StoreError> {
        let cf = self.cf(CF_REVISIONS)?;
        match self.db.get_cf(&cf, doc_id.as_bytes())? {
            Some(bytes) => decode_revision(&bytes),
            None => Ok(0),
        }
    }

    fn list_documents(&self) -> Result<Vec<Uuid>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let mut doc_ids = Vec::new();

        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item.map_err(|e| StoreError::Database(e.to_string()))?;
            if key.len() == 16 {
                let id = Uuid::from_bytes(
                    key.as_ref()
                        .try_into()
                        .map_err(|_| StoreError::Corrupt("invalid UUID key".into()))?,
                );
                doc_ids.push(id);
            }
        }

        Ok(doc_ids)
    }
}

fn decode_revision(bytes: &[u8]) -> Result<u64, StoreError> {
    let buf: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::Corrupt("revision value is not 8 bytes".into()))?;
    Ok(u64::from_be_bytes(buf))
}
