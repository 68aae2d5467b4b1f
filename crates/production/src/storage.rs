//! RocksDB persistence for committed state.
//!
//! Stores committed blocks by height and the `(bexec, hqc)` checkpoint.
//! The consensus core itself needs no persistence; this record exists so a
//! restarted replica can report its last committed state and serve blocks.
//!
//! All operations are synchronous blocking I/O.

use borsh::BorshDeserialize;
use rocksdb::{ColumnFamilyDescriptor, Options, DB};
use std::path::Path;
use thiserror::Error;
use trellis_types::{Block, BlockHeight, Hash, QuorumCert};

const CF_BLOCKS: &str = "blocks";
const CF_META: &str = "meta";

const META_BEXEC_HEIGHT: &[u8] = b"bexec_height";
const META_BEXEC_HASH: &[u8] = b"bexec_hash";
const META_HQC: &[u8] = b"hqc";

/// Error type for storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] rocksdb::Error),

    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// The persisted `(bexec, hqc)` checkpoint.
#[derive(Debug, Clone)]
pub struct Checkpoint {
    /// Height of the committed tip.
    pub bexec_height: BlockHeight,
    /// Hash of the committed tip.
    pub bexec_hash: Hash,
    /// The highest quorum certificate at checkpoint time.
    pub hqc: QuorumCert,
}

/// RocksDB-backed commit log.
pub struct RocksDbStorage {
    db: DB,
}

impl RocksDbStorage {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_BLOCKS, Options::default()),
            ColumnFamilyDescriptor::new(CF_META, Options::default()),
        ];
        let db = DB::open_cf_descriptors(&opts, path, cfs)?;
        Ok(Self { db })
    }

    fn cf(&self, name: &str) -> &rocksdb::ColumnFamily {
        self.db.cf_handle(name).expect("column family exists")
    }

    /// Persist a committed block at its height.
    pub fn put_block(&self, height: BlockHeight, block: &Block) -> Result<(), StorageError> {
        let bytes = borsh::to_vec(block).expect("block serialization is infallible");
        self.db
            .put_cf(self.cf(CF_BLOCKS), height.0.to_le_bytes(), bytes)?;
        Ok(())
    }

    /// Load a committed block by height.
    pub fn block(&self, height: BlockHeight) -> Result<Option<Block>, StorageError> {
        let Some(bytes) = self.db.get_cf(self.cf(CF_BLOCKS), height.0.to_le_bytes())? else {
            return Ok(None);
        };
        let block =
            Block::try_from_slice(&bytes).map_err(|e| StorageError::Corrupt(e.to_string()))?;
        Ok(Some(block))
    }

    /// Persist the checkpoint.
    pub fn put_checkpoint(
        &self,
        bexec_height: BlockHeight,
        bexec_hash: Hash,
        hqc: &QuorumCert,
    ) -> Result<(), StorageError> {
        let meta = self.cf(CF_META);
        self.db
            .put_cf(meta, META_BEXEC_HEIGHT, bexec_height.0.to_le_bytes())?;
        self.db.put_cf(meta, META_BEXEC_HASH, bexec_hash.as_bytes())?;
        let hqc_bytes = borsh::to_vec(hqc).expect("certificate serialization is infallible");
        self.db.put_cf(meta, META_HQC, hqc_bytes)?;
        Ok(())
    }

    /// Load the checkpoint, if one was ever written.
    pub fn checkpoint(&self) -> Result<Option<Checkpoint>, StorageError> {
        let meta = self.cf(CF_META);
        let Some(height_bytes) = self.db.get_cf(meta, META_BEXEC_HEIGHT)? else {
            return Ok(None);
        };
        let height_arr: [u8; 8] = height_bytes
            .as_slice()
            .try_into()
            .map_err(|_| StorageError::Corrupt("bexec height length".into()))?;
        let hash_bytes = self
            .db
            .get_cf(meta, META_BEXEC_HASH)?
            .ok_or_else(|| StorageError::Corrupt("missing bexec hash".into()))?;
        let hash_arr: [u8; 32] = hash_bytes
            .as_slice()
            .try_into()
            .map_err(|_| StorageError::Corrupt("bexec hash length".into()))?;
        let hqc_bytes = self
            .db
            .get_cf(meta, META_HQC)?
            .ok_or_else(|| StorageError::Corrupt("missing hqc".into()))?;
        let hqc = QuorumCert::try_from_slice(&hqc_bytes)
            .map_err(|e| StorageError::Corrupt(e.to_string()))?;
        Ok(Some(Checkpoint {
            bexec_height: BlockHeight(u64::from_le_bytes(height_arr)),
            bexec_hash: Hash::from_raw(hash_arr),
            hqc,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_block(tag: u8) -> Block {
        Block::new(
            vec![Hash::digest(b"parent")],
            vec![Hash::digest(&[tag])],
            None,
            Vec::new(),
        )
    }

    #[test]
    fn block_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = RocksDbStorage::open(dir.path()).unwrap();
        let block = sample_block(1);
        storage.put_block(BlockHeight(1), &block).unwrap();
        let loaded = storage.block(BlockHeight(1)).unwrap().unwrap();
        assert_eq!(loaded.hash(), block.hash());
        assert!(storage.block(BlockHeight(2)).unwrap().is_none());
    }

    #[test]
    fn checkpoint_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = RocksDbStorage::open(dir.path()).unwrap();
        assert!(storage.checkpoint().unwrap().is_none());

        let hash = Hash::digest(b"tip");
        let mut hqc = QuorumCert::new(hash);
        hqc.compute();
        storage.put_checkpoint(BlockHeight(9), hash, &hqc).unwrap();

        let checkpoint = storage.checkpoint().unwrap().unwrap();
        assert_eq!(checkpoint.bexec_height, BlockHeight(9));
        assert_eq!(checkpoint.bexec_hash, hash);
        assert_eq!(checkpoint.hqc, hqc);
    }

    #[test]
    fn checkpoint_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let storage = RocksDbStorage::open(dir.path()).unwrap();
        let hqc = QuorumCert::genesis(Hash::digest(b"g"));
        storage
            .put_checkpoint(BlockHeight(1), Hash::digest(b"a"), &hqc)
            .unwrap();
        storage
            .put_checkpoint(BlockHeight(2), Hash::digest(b"b"), &hqc)
            .unwrap();
        let checkpoint = storage.checkpoint().unwrap().unwrap();
        assert_eq!(checkpoint.bexec_height, BlockHeight(2));
    }
}
