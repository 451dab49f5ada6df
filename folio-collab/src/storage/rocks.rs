//! RocksDB-backed persistent document store.
//!
//! Column families:
//! - `rooms`: Room records (bincode: metadata, collaborators, title version)
//! - `documents`: Full CRDT snapshots (LZ4 compressed, prefixed by op-log version)
//! - `deltas`: Incremental CRDT updates (LZ4 compressed, keyed by room_key:version)
//!
//! Every room id maps to a fixed 16-byte key (`RoomId::storage_key`), which
//! lets the `deltas` family use a fixed-length prefix extractor.
//!
//! Reference: Kleppmann, DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::room::{Room, RoomId};

const CF_ROOMS: &str = "rooms";
const CF_DOCUMENTS: &str = "documents";
const CF_DELTAS: &str = "deltas";

const COLUMN_FAMILIES: &[&str] = &[CF_ROOMS, CF_DOCUMENTS, CF_DELTAS];

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("folio_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
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

/// Storage errors.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Room not found in store: {0}")]
    NotFound(RoomId),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Compression error: {0}")]
    CompressionError(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// Sizes reported after a snapshot write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub version: u64,
    pub snapshot_size: u64,
    pub compressed_size: u64,
}

/// RocksDB-backed document store.
pub struct DocumentStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl DocumentStore {
    /// Open the store, creating the database and column families if missing.
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

        log::info!("Opened document store at {}", config.path.display());
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

        opts.set_compression_type(DBCompressionType::Lz4);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_ROOMS => {
                // Small values, point lookups on join
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_DOCUMENTS => {
                opts.set_max_write_buffer_number(2);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_DELTAS => {
                // Many small writes, prefix-scanned by room key
                opts.set_max_write_buffer_number(4);
                opts.set_prefix_extractor(rocksdb::SliceTransform::create_fixed_prefix(16));
            }
            _ => {}
        }

        opts
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    // ─── Room records ─────────────────────────────────────────────────

    /// Insert or replace a room record.
    pub fn put_room(&self, room: &Room) -> Result<(), StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        let bytes = room
            .encode()
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;
        self.db
            .put_cf_opt(&cf, room.id().storage_key().as_bytes(), bytes, &self.write_options())?;
        Ok(())
    }

    pub fn load_room(&self, room_id: &RoomId) -> Result<Room, StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        match self.db.get_cf(&cf, room_id.storage_key().as_bytes())? {
            Some(bytes) => {
                Room::decode(&bytes).map_err(|e| StoreError::DeserializationError(e.to_string()))
            }
            None => Err(StoreError::NotFound(room_id.clone())),
        }
    }

    pub fn room_exists(&self, room_id: &RoomId) -> Result<bool, StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        Ok(self.db.get_cf(&cf, room_id.storage_key().as_bytes())?.is_some())
    }

    /// All persisted room records.
    pub fn list_rooms(&self) -> Result<Vec<Room>, StoreError> {
        let cf = self.cf(CF_ROOMS)?;
        let mut rooms = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (_, value) = item?;
            match Room::decode(&value) {
                Ok(room) => rooms.push(room),
                Err(e) => log::warn!("Skipping unreadable room record: {e}"),
            }
        }
        Ok(rooms)
    }

    /// Delete a room record, its snapshot and all of its deltas.
    pub fn delete_room(&self, room_id: &RoomId) -> Result<(), StoreError> {
        let cf_rooms = self.cf(CF_ROOMS)?;
        let cf_docs = self.cf(CF_DOCUMENTS)?;
        let key = room_id.storage_key();

        let mut batch = WriteBatch::default();
        batch.delete_cf(&cf_rooms, key.as_bytes());
        batch.delete_cf(&cf_docs, key.as_bytes());
        self.batch_delete_deltas(&mut batch, room_id, u64::MAX)?;

        self.db.write_opt(batch, &self.write_options())?;
        Ok(())
    }

    // ─── Snapshots ────────────────────────────────────────────────────

    /// Save a full CRDT snapshot taken at op-log `version`.
    ///
    /// Value layout: `<version:8 bytes BE><lz4 payload>`.
    pub fn save_snapshot(
        &self,
        room_id: &RoomId,
        version: u64,
        snapshot: &[u8],
    ) -> Result<SnapshotInfo, StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let compressed = lz4_flex::compress_prepend_size(snapshot);

        let mut value = Vec::with_capacity(8 + compressed.len());
        value.extend_from_slice(&version.to_be_bytes());
        value.extend_from_slice(&compressed);

        self.db
            .put_cf_opt(&cf, room_id.storage_key().as_bytes(), &value, &self.write_options())?;

        Ok(SnapshotInfo {
            version,
            snapshot_size: snapshot.len() as u64,
            compressed_size: compressed.len() as u64,
        })
    }

    /// Load the latest snapshot and the op-log version it covers.
    pub fn load_snapshot(&self, room_id: &RoomId) -> Result<(u64, Vec<u8>), StoreError> {
        let cf = self.cf(CF_DOCUMENTS)?;
        let value = self
            .db
            .get_cf(&cf, room_id.storage_key().as_bytes())?
            .ok_or_else(|| StoreError::NotFound(room_id.clone()))?;

        if value.len() < 8 {
            return Err(StoreError::DeserializationError("Truncated snapshot".into()));
        }
        let mut ver_buf = [0u8; 8];
        ver_buf.copy_from_slice(&value[..8]);
        let snapshot = lz4_flex::decompress_size_prepended(&value[8..])
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        Ok((u64::from_be_bytes(ver_buf), snapshot))
    }

    // ─── Deltas ───────────────────────────────────────────────────────

    /// Store a compressed update at `version`.
    ///
    /// Key format: `<room_key:16 bytes><version:8 bytes big-endian>`.
    /// Returns the compressed size.
    pub fn store_delta(&self, room_id: &RoomId, version: u64, delta: &[u8]) -> Result<u64, StoreError> {
        let cf = self.cf(CF_DELTAS)?;
        let compressed = lz4_flex::compress_prepend_size(delta);
        let compressed_len = compressed.len() as u64;

        self.db.put_cf_opt(
            &cf,
            Self::delta_key(room_id, version),
            &compressed,
            &self.write_options(),
        )?;
        Ok(compressed_len)
    }

    /// All updates with version `>= since_version`, in version order.
    pub fn load_deltas_since(
        &self,
        room_id: &RoomId,
        since_version: u64,
    ) -> Result<Vec<(u64, Vec<u8>)>, StoreError> {
        let cf = self.cf(CF_DELTAS)?;
        let prefix = room_id.storage_key();
        let start_key = Self::delta_key(room_id, since_version);

        let mut deltas = Vec::new();
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );

        for item in iter {
            let (key, value) = item?;
            if key.len() < 24 || &key[..16] != prefix.as_bytes() {
                break;
            }

            let mut ver_buf = [0u8; 8];
            ver_buf.copy_from_slice(&key[16..24]);
            let version = u64::from_be_bytes(ver_buf);

            let decompressed = lz4_flex::decompress_size_prepended(&value)
                .map_err(|e| StoreError::CompressionError(e.to_string()))?;
            deltas.push((version, decompressed));
        }

        Ok(deltas)
    }

    /// Delete updates with version `<= up_to_version` (after a snapshot).
    pub fn compact_deltas(&self, room_id: &RoomId, up_to_version: u64) -> Result<u64, StoreError> {
        let mut batch = WriteBatch::default();
        let count = self.batch_delete_deltas(&mut batch, room_id, up_to_version)?;
        if count > 0 {
            self.db.write_opt(batch, &self.write_options())?;
        }
        Ok(count)
    }

    fn batch_delete_deltas(
        &self,
        batch: &mut WriteBatch,
        room_id: &RoomId,
        up_to_version: u64,
    ) -> Result<u64, StoreError> {
        let cf = self.cf(CF_DELTAS)?;
        let prefix = room_id.storage_key();
        let start_key = Self::delta_key(room_id, 0);

        let mut count = 0u64;
        let iter = self.db.iterator_cf(
            &cf,
            IteratorMode::From(&start_key, rocksdb::Direction::Forward),
        );
        for item in iter {
            let (key, _) = item?;
            if key.len() < 24 || &key[..16] != prefix.as_bytes() {
                break;
            }
            let mut ver_buf = [0u8; 8];
            ver_buf.copy_from_slice(&key[16..24]);
            if u64::from_be_bytes(ver_buf) > up_to_version {
                break;
            }
            batch.delete_cf(&cf, &key);
            count += 1;
        }
        Ok(count)
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
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }

    fn delta_key(room_id: &RoomId, version: u64) -> Vec<u8> {
        let mut key = Vec::with_capacity(24);
        key.extend_from_slice(room_id.storage_key().as_bytes());
        key.extend_from_slice(&version.to_be_bytes());
        key
    }
}

fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::{UserId, UserRole};

    fn open_temp() -> (tempfile::TempDir, DocumentStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        (dir, store)
    }

    #[test]
    fn test_store_open() {
        let (_dir, store) = open_temp();
        assert!(store.path().exists());
    }

    #[test]
    fn test_room_put_load() {
        let (_dir, store) = open_temp();
        let mut room = Room::new("room-a", "alice", "Untitled").unwrap();
        room.upsert_collaborator(UserId::from("bob"), UserRole::Viewer).unwrap();

        store.put_room(&room).unwrap();
        let loaded = store.load_room(room.id()).unwrap();
        assert_eq!(loaded, room);
        assert!(store.room_exists(room.id()).unwrap());
        assert!(!store.room_exists(&RoomId::from("missing")).unwrap());
    }

    #[test]
    fn test_room_not_found() {
        let (_dir, store) = open_temp();
        let err = store.load_room(&RoomId::from("nope")).unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_list_rooms() {
        let (_dir, store) = open_temp();
        for i in 0..5 {
            let room = Room::new(format!("room-{i}"), "alice", format!("Doc {i}")).unwrap();
            store.put_room(&room).unwrap();
        }
        let rooms = store.list_rooms().unwrap();
        assert_eq!(rooms.len(), 5);
        assert!(rooms.iter().any(|r| r.title() == "Doc 3"));
    }

    #[test]
    fn test_snapshot_save_load() {
        let (_dir, store) = open_temp();
        let room_id = RoomId::from("snap");
        let data = b"snapshot bytes with enough repetition repetition repetition".to_vec();

        let info = store.save_snapshot(&room_id, 7, &data).unwrap();
        assert_eq!(info.version, 7);
        assert_eq!(info.snapshot_size, data.len() as u64);

        let (version, loaded) = store.load_snapshot(&room_id).unwrap();
        assert_eq!(version, 7);
        assert_eq!(loaded, data);
    }

    #[test]
    fn test_delta_store_load_since() {
        let (_dir, store) = open_temp();
        let room_id = RoomId::from("deltas");
        for v in 1..=10 {
            store
                .store_delta(&room_id, v, format!("delta_{v}").as_bytes())
                .unwrap();
        }

        let all = store.load_deltas_since(&room_id, 0).unwrap();
        assert_eq!(all.len(), 10);
        assert_eq!(all[0], (1, b"delta_1".to_vec()));
        assert_eq!(all[9].1, b"delta_10");

        let tail = store.load_deltas_since(&room_id, 5).unwrap();
        assert_eq!(tail.len(), 6);
        assert_eq!(tail[0].0, 5);
    }

    #[test]
    fn test_delta_compact() {
        let (_dir, store) = open_temp();
        let room_id = RoomId::from("compact");
        for v in 1..=20 {
            store.store_delta(&room_id, v, &vec![v as u8; 32]).unwrap();
        }

        assert_eq!(store.compact_deltas(&room_id, 10).unwrap(), 10);
        let remaining = store.load_deltas_since(&room_id, 0).unwrap();
        assert_eq!(remaining.len(), 10);
        assert_eq!(remaining[0].0, 11);
    }

    #[test]
    fn test_rooms_are_isolated() {
        let (_dir, store) = open_temp();
        let a = RoomId::from("a");
        let b = RoomId::from("b");
        for v in 1..=3 {
            store.store_delta(&a, v, b"a").unwrap();
        }
        store.store_delta(&b, 1, b"b").unwrap();

        assert_eq!(store.load_deltas_since(&a, 0).unwrap().len(), 3);
        assert_eq!(store.load_deltas_since(&b, 0).unwrap().len(), 1);
    }

    #[test]
    fn test_delete_room() {
        let (_dir, store) = open_temp();
        let room = Room::new("gone", "alice", "Bye").unwrap();
        store.put_room(&room).unwrap();
        store.save_snapshot(room.id(), 1, b"state").unwrap();
        store.store_delta(room.id(), 1, b"d1").unwrap();
        store.store_delta(room.id(), 2, b"d2").unwrap();

        store.delete_room(room.id()).unwrap();
        assert!(!store.room_exists(room.id()).unwrap());
        assert!(store.load_snapshot(room.id()).is_err());
        assert!(store.load_deltas_since(room.id(), 0).unwrap().is_empty());
    }

    #[test]
    fn test_reopen_persists() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::for_testing(dir.path().join("db"));
        {
            let store = DocumentStore::open(config.clone()).unwrap();
            store.put_room(&Room::new("durable", "alice", "Kept").unwrap()).unwrap();
            store.sync().unwrap();
        }
        let store = DocumentStore::open(config).unwrap();
        assert_eq!(store.load_room(&RoomId::from("durable")).unwrap().title(), "Kept");
    }

    #[test]
    fn test_store_config_default() {
        let config = StoreConfig::default();
        assert_eq!(config.bloom_filter_bits, 10);
        assert!(!config.sync_writes);
    }
}
