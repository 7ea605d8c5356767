//! RocksDB-backed replicant store.
//!
//! Column families:
//! - `replicants`: latest value per replicant (JSON, LZ4 compressed)
//! - `metadata`: revision, sizes and timestamps (bincode)
//!
//! Keys are the namespace and name, each length-prefixed, so any pair of
//! strings maps to a distinct key.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use switchboard_core::operation::deserialize_present;
use switchboard_core::{ReplicantKey, Revision};

use super::{PersistedRecord, PersistenceAdapter, StoreError};

const CF_REPLICANTS: &str = "replicants";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_REPLICANTS, CF_METADATA];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("switchboard_data"),
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
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// Bookkeeping stored next to each value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicantMetadata {
    pub namespace: String,
    pub name: String,
    pub revision: Revision,
    /// Uncompressed JSON size in bytes
    pub value_size: u64,
    pub compressed_size: u64,
    /// Seconds since epoch
    pub created_at: u64,
    pub updated_at: u64,
    pub writes: u64,
}

impl ReplicantMetadata {
    fn new(key: &ReplicantKey) -> Self {
        let now = now_secs();
        Self {
            namespace: key.namespace.clone(),
            name: key.name.clone(),
            revision: 0,
            value_size: 0,
            compressed_size: 0,
            created_at: now,
            updated_at: now,
            writes: 0,
        }
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(meta)
    }
}

/// The JSON document in the `replicants` family. A stored `null` and a
/// never-set value stay distinct.
#[derive(Serialize, Deserialize)]
struct StoredValue {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "deserialize_present"
    )]
    value: Option<Value>,
}

/// RocksDB-backed store, shared across tasks behind an `Arc`.
pub struct ReplicantStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl ReplicantStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::debug!("Opened replicant store at {}", config.path.display());

        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        block_opts.set_block_size(16 * 1024);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);

        match name {
            // Values are LZ4-compressed before they reach RocksDB
            CF_REPLICANTS => opts.set_compression_type(DBCompressionType::None),
            _ => opts.set_compression_type(DBCompressionType::Lz4),
        }
        opts.optimize_for_point_lookup(config.block_cache_size as u64);
        opts
    }

    /// Write a value and its metadata in one atomic batch.
    pub fn save_record(&self, record: &PersistedRecord) -> Result<ReplicantMetadata, StoreError> {
        let cf_values = self.cf(CF_REPLICANTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let json = serde_json::to_vec(&StoredValue {
            value: record.value.clone(),
        })
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let compressed = lz4_flex::compress_prepend_size(&json);

        let mut meta = self
            .load_metadata(&record.key)?
            .unwrap_or_else(|| ReplicantMetadata::new(&record.key));
        meta.revision = record.revision;
        meta.value_size = json.len() as u64;
        meta.compressed_size = compressed.len() as u64;
        meta.updated_at = now_secs();
        meta.writes += 1;

        let key = encode_key(&record.key);
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_values, &key, &compressed);
        batch.put_cf(&cf_meta, &key, &meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        Ok(meta)
    }

    /// Load one record, or `None` if it was never saved.
    pub fn load(&self, key: &ReplicantKey) -> Result<Option<PersistedRecord>, StoreError> {
        let cf = self.cf(CF_REPLICANTS)?;
        let Some(compressed) = self.db.get_cf(&cf, encode_key(key))? else {
            return Ok(None);
        };
        let value = decode_value(&compressed)?;
        let revision = self.load_metadata(key)?.map_or(0, |m| m.revision);
        Ok(Some(PersistedRecord::new(key.clone(), value, revision)))
    }

    pub fn load_metadata(&self, key: &ReplicantKey) -> Result<Option<ReplicantMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        self.db
            .get_cf(&cf, encode_key(key))?
            .map(|bytes| ReplicantMetadata::decode(&bytes))
            .transpose()
    }

    pub fn exists(&self, key: &ReplicantKey) -> Result<bool, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        Ok(self.db.get_cf(&cf, encode_key(key))?.is_some())
    }

    /// Keys of every stored replicant, in key order.
    pub fn list(&self) -> Result<Vec<ReplicantKey>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut keys = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            keys.push(decode_key(&key)?);
        }
        Ok(keys)
    }

    pub fn delete(&self, key: &ReplicantKey) -> Result<(), StoreError> {
        let cf_values = self.cf(CF_REPLICANTS)?;
        let cf_meta = self.cf(CF_METADATA)?;
        let key = encode_key(key);

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_values, &key);
        batch.delete_cf(&cf_meta, &key);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;
        Ok(())
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }
}

impl PersistenceAdapter for ReplicantStore {
    fn load_all(&self) -> Result<Vec<PersistedRecord>, StoreError> {
        let cf = self.cf(CF_REPLICANTS)?;
        let mut records = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (raw_key, compressed) = item?;
            let key = decode_key(&raw_key)?;
            let value = decode_value(&compressed)?;
            let revision = self.load_metadata(&key)?.map_or(0, |m| m.revision);
            records.push(PersistedRecord::new(key, value, revision));
        }
        Ok(records)
    }

    fn save(&self, record: &PersistedRecord) -> Result<(), StoreError> {
        self.save_record(record).map(|_| ())
    }
}

fn decode_value(compressed: &[u8]) -> Result<Option<Value>, StoreError> {
    let json = lz4_flex::decompress_size_prepended(compressed)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    let stored: StoredValue =
        serde_json::from_slice(&json).map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(stored.value)
}

/// namespace length (4 bytes big-endian) + namespace + name.
fn encode_key(key: &ReplicantKey) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(4 + key.namespace.len() + key.name.len());
    bytes.extend_from_slice(&(key.namespace.len() as u32).to_be_bytes());
    bytes.extend_from_slice(key.namespace.as_bytes());
    bytes.extend_from_slice(key.name.as_bytes());
    bytes
}

fn decode_key(bytes: &[u8]) -> Result<ReplicantKey, StoreError> {
    let invalid = || StoreError::Deserialization("Invalid replicant key".into());
    let (len, rest) = bytes.split_first_chunk::<4>().ok_or_else(invalid)?;
    let len = u32::from_be_bytes(*len) as usize;
    if rest.len() < len {
        return Err(invalid());
    }
    let (namespace, name) = rest.split_at(len);
    Ok(ReplicantKey::new(
        std::str::from_utf8(namespace).map_err(|_| invalid())?,
        std::str::from_utf8(name).map_err(|_| invalid())?,
    ))
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
