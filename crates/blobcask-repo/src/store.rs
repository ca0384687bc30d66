//! Record repository backed by redb
//!
//! Two tables, one per record kind, bincode-encoded values. All writes
//! are synchronous (write txn + commit). Range queries collect, sort and
//! paginate in memory — records are tens of bytes and the removed set is
//! bounded by deletion traffic, so this stays well inside redb's comfort
//! zone.

use crate::types::{ContentRecord, HandleRecord};
use crate::{RecordRepository, normalize_page};
use blobcask_common::{Error, Result};
use redb::{Database, ReadableTable, TableDefinition};
use std::path::Path;

/// Content records, keyed by content hash
const CONTENT: TableDefinition<&str, &[u8]> = TableDefinition::new("content");

/// Handle records, keyed by short handle
const HANDLES: TableDefinition<&str, &[u8]> = TableDefinition::new("handles");

/// Repository over an embedded redb database
pub struct RedbRepository {
    db: Database,
}

impl RedbRepository {
    /// Open (or create) the database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(|e| Error::repository(e.to_string()))?;

        // Create tables eagerly so later read txns don't fail
        let write_txn = db
            .begin_write()
            .map_err(|e| Error::repository(e.to_string()))?;
        {
            let _t = write_txn
                .open_table(CONTENT)
                .map_err(|e| Error::repository(e.to_string()))?;
            let _t = write_txn
                .open_table(HANDLES)
                .map_err(|e| Error::repository(e.to_string()))?;
        }
        write_txn
            .commit()
            .map_err(|e| Error::repository(e.to_string()))?;

        Ok(Self { db })
    }

    fn put_bytes(&self, table: TableDefinition<&str, &[u8]>, key: &str, value: &[u8]) -> Result<()> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| Error::repository(e.to_string()))?;
        {
            let mut t = write_txn
                .open_table(table)
                .map_err(|e| Error::repository(e.to_string()))?;
            t.insert(key, value)
                .map_err(|e| Error::repository(e.to_string()))?;
        }
        write_txn
            .commit()
            .map_err(|e| Error::repository(e.to_string()))
    }

    fn get_bytes(&self, table: TableDefinition<&str, &[u8]>, key: &str) -> Result<Option<Vec<u8>>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| Error::repository(e.to_string()))?;
        let t = read_txn
            .open_table(table)
            .map_err(|e| Error::repository(e.to_string()))?;
        let value = t
            .get(key)
            .map_err(|e| Error::repository(e.to_string()))?
            .map(|guard| guard.value().to_vec());
        Ok(value)
    }

    fn delete_key(&self, table: TableDefinition<&str, &[u8]>, key: &str) -> Result<()> {
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| Error::repository(e.to_string()))?;
        {
            let mut t = write_txn
                .open_table(table)
                .map_err(|e| Error::repository(e.to_string()))?;
            t.remove(key)
                .map_err(|e| Error::repository(e.to_string()))?;
        }
        write_txn
            .commit()
            .map_err(|e| Error::repository(e.to_string()))
    }

    fn load_all<T: serde::de::DeserializeOwned>(
        &self,
        table: TableDefinition<&str, &[u8]>,
    ) -> Result<Vec<T>> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| Error::repository(e.to_string()))?;
        let t = read_txn
            .open_table(table)
            .map_err(|e| Error::repository(e.to_string()))?;
        let mut result = Vec::new();
        for entry in t.iter().map_err(|e| Error::repository(e.to_string()))? {
            let entry = entry.map_err(|e| Error::repository(e.to_string()))?;
            let decoded = bincode::deserialize(entry.1.value())
                .map_err(|e| Error::repository(format!("decode record: {e}")))?;
            result.push(decoded);
        }
        Ok(result)
    }
}

impl RecordRepository for RedbRepository {
    fn add_content(&self, record: &ContentRecord) -> Result<()> {
        let bytes =
            bincode::serialize(record).map_err(|e| Error::repository(e.to_string()))?;
        self.put_bytes(CONTENT, &record.hash, &bytes)
    }

    fn get_content(&self, hash: &str) -> Result<Option<ContentRecord>> {
        self.get_bytes(CONTENT, hash)?
            .map(|bytes| {
                bincode::deserialize(&bytes)
                    .map_err(|e| Error::repository(format!("decode content record: {e}")))
            })
            .transpose()
    }

    fn delete_content(&self, hash: &str) -> Result<()> {
        self.delete_key(CONTENT, hash)
    }

    fn query_content_by_removed(
        &self,
        page: usize,
        page_size: usize,
    ) -> Result<(u64, Vec<ContentRecord>)> {
        let (page, page_size) = normalize_page(page, page_size);
        let mut removed: Vec<ContentRecord> = self
            .load_all::<ContentRecord>(CONTENT)?
            .into_iter()
            .filter(|r| r.removed)
            .collect();
        removed.sort_by_key(|r| r.blocks);

        let total = removed.len() as u64;
        let start = (page - 1).saturating_mul(page_size);
        let slice = removed
            .into_iter()
            .skip(start)
            .take(page_size)
            .collect();
        Ok((total, slice))
    }

    fn add_handle(&self, record: &HandleRecord) -> Result<()> {
        let bytes =
            bincode::serialize(record).map_err(|e| Error::repository(e.to_string()))?;
        self.put_bytes(HANDLES, &record.handle, &bytes)
    }

    fn get_handle(&self, handle: &str) -> Result<Option<HandleRecord>> {
        self.get_bytes(HANDLES, handle)?
            .map(|bytes| {
                bincode::deserialize(&bytes)
                    .map_err(|e| Error::repository(format!("decode handle record: {e}")))
            })
            .transpose()
    }

    fn delete_handle(&self, handle: &str) -> Result<()> {
        self.delete_key(HANDLES, handle)
    }

    fn query_handles_by_time(
        &self,
        page: usize,
        page_size: usize,
    ) -> Result<(u64, Vec<HandleRecord>)> {
        let (page, page_size) = normalize_page(page, page_size);
        let mut handles = self.load_all::<HandleRecord>(HANDLES)?;
        handles.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let total = handles.len() as u64;
        let start = (page - 1).saturating_mul(page_size);
        let slice = handles.into_iter().skip(start).take(page_size).collect();
        Ok((total, slice))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn content(hash: &str, blocks: u64, removed: bool) -> ContentRecord {
        ContentRecord {
            hash: hash.into(),
            chunk_id: 1,
            offset: 0,
            blocks,
            size: blocks.min(100),
            removed,
            ref_count: u32::from(!removed),
            created_at: 1_700_000_000,
        }
    }

    fn handle(name: &str, created_at: u64) -> HandleRecord {
        HandleRecord {
            handle: name.into(),
            content_hash: "abc".into(),
            chunk_id: 1,
            offset: 0,
            size: 5,
            blocks: 128,
            content_type: "application/octet-stream".into(),
            created_at,
        }
    }

    #[test]
    fn test_content_crud() {
        let dir = tempdir().unwrap();
        let repo = RedbRepository::open(dir.path().join("records.redb")).unwrap();

        assert!(repo.get_content("abc").unwrap().is_none());

        let record = content("abc", 128, false);
        repo.add_content(&record).unwrap();
        assert_eq!(repo.get_content("abc").unwrap().unwrap(), record);

        repo.delete_content("abc").unwrap();
        assert!(repo.get_content("abc").unwrap().is_none());
    }

    #[test]
    fn test_handle_crud() {
        let dir = tempdir().unwrap();
        let repo = RedbRepository::open(dir.path().join("records.redb")).unwrap();

        let record = handle("ab12cd", 1);
        repo.add_handle(&record).unwrap();
        assert_eq!(repo.get_handle("ab12cd").unwrap().unwrap(), record);

        repo.delete_handle("ab12cd").unwrap();
        assert!(repo.get_handle("ab12cd").unwrap().is_none());
    }

    #[test]
    fn test_query_removed_sorted_by_blocks() {
        let dir = tempdir().unwrap();
        let repo = RedbRepository::open(dir.path().join("records.redb")).unwrap();

        repo.add_content(&content("a", 384, true)).unwrap();
        repo.add_content(&content("b", 128, true)).unwrap();
        repo.add_content(&content("c", 256, false)).unwrap();
        repo.add_content(&content("d", 256, true)).unwrap();

        let (total, records) = repo.query_content_by_removed(1, 10).unwrap();
        assert_eq!(total, 3);
        let blocks: Vec<u64> = records.iter().map(|r| r.blocks).collect();
        assert_eq!(blocks, vec![128, 256, 384]);
    }

    #[test]
    fn test_query_handles_newest_first_with_paging() {
        let dir = tempdir().unwrap();
        let repo = RedbRepository::open(dir.path().join("records.redb")).unwrap();

        for i in 1..=5u64 {
            repo.add_handle(&handle(&format!("h{i}"), i)).unwrap();
        }

        let (total, first) = repo.query_handles_by_time(1, 2).unwrap();
        assert_eq!(total, 5);
        assert_eq!(first[0].handle, "h5");
        assert_eq!(first[1].handle, "h4");

        let (_, third) = repo.query_handles_by_time(3, 2).unwrap();
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].handle, "h1");
    }

    #[test]
    fn test_reopen_persists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("records.redb");

        {
            let repo = RedbRepository::open(&path).unwrap();
            repo.add_content(&content("abc", 128, false)).unwrap();
        }

        let repo = RedbRepository::open(&path).unwrap();
        assert!(repo.get_content("abc").unwrap().is_some());
    }
}
