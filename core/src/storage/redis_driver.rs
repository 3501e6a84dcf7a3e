//! Networked backing store, talking to a Redis-protocol server.
//!
//! Prefix iteration (the access pattern `ContractDriver`/`CacheDriver`
//! actually need) goes through `SCAN ... MATCH <prefix>*`, cursor-driven so
//! a single call never blocks the server. Arbitrary lexicographic range
//! scans, needed only by the generic `Engine::scan`, fall back to a full
//! keyspace scan filtered in process — Redis has no native ordered range
//! scan over an arbitrary byte keyspace.

use serde_derive::{Deserialize, Serialize};
use std::ops::Bound;

use crate::error::CResult;
use crate::storage::engine::Engine;
use crate::storage::{ScanIteratorT, Status};

#[derive(Serialize, Deserialize)]
pub struct RedisDriver {
    endpoint: String,
    db_index: i64,
    #[serde(skip)]
    conn: Option<redis::Connection>,
}

impl RedisDriver {
    pub fn new(endpoint: impl Into<String>, db_index: i64) -> CResult<Self> {
        let mut driver = RedisDriver { endpoint: endpoint.into(), db_index, conn: None };
        driver.ensure_connected()?;
        Ok(driver)
    }

    fn ensure_connected(&mut self) -> CResult<&mut redis::Connection> {
        if self.conn.is_none() {
            let url = format!("redis://{}/{}", self.endpoint, self.db_index);
            let client = redis::Client::open(url)?;
            self.conn = Some(client.get_connection()?);
        }
        Ok(self.conn.as_mut().expect("connection established above"))
    }

    /// Cursor-driven `SCAN ... MATCH <pattern>`, returning every matching
    /// key in the keyspace sorted lexicographically.
    fn scan_keys(&mut self, pattern: &str) -> CResult<Vec<Vec<u8>>> {
        let mut cursor: u64 = 0;
        let mut keys: Vec<Vec<u8>> = Vec::new();
        let conn = self.ensure_connected()?;
        loop {
            let (next_cursor, batch): (u64, Vec<Vec<u8>>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(1000)
                .query(conn)?;
            keys.extend(batch);
            if next_cursor == 0 {
                break;
            }
            cursor = next_cursor;
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    fn fetch(&mut self, keys: Vec<Vec<u8>>) -> CResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut items = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get(&key)? {
                items.push((key, value));
            }
        }
        Ok(items)
    }

    fn collect_prefix(&mut self, prefix: &[u8]) -> CResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let pattern = format!("{}*", glob_escape(prefix));
        let mut keys = self.scan_keys(&pattern)?;
        keys.retain(|k| k.starts_with(prefix));
        self.fetch(keys)
    }

    fn collect_range(&mut self, range: &(Bound<Vec<u8>>, Bound<Vec<u8>>)) -> CResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let keys: Vec<Vec<u8>> =
            self.scan_keys("*")?.into_iter().filter(|k| bound_range_contains(range, k)).collect();
        self.fetch(keys)
    }
}

/// Redis glob patterns treat `*?[]\` specially; a literal prefix that
/// happens to contain one needs escaping so `SCAN MATCH` treats it as data.
fn glob_escape(prefix: &[u8]) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for &b in prefix {
        let c = b as char;
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn bound_range_contains(range: &(Bound<Vec<u8>>, Bound<Vec<u8>>), key: &[u8]) -> bool {
    let above_start = match &range.0 {
        Bound::Included(start) => key >= start.as_slice(),
        Bound::Excluded(start) => key > start.as_slice(),
        Bound::Unbounded => true,
    };
    let below_end = match &range.1 {
        Bound::Included(end) => key <= end.as_slice(),
        Bound::Excluded(end) => key < end.as_slice(),
        Bound::Unbounded => true,
    };
    above_start && below_end
}

impl std::fmt::Display for RedisDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "redis({}/{})", self.endpoint, self.db_index)
    }
}

impl Engine for RedisDriver {
    type ScanIterator<'a> = std::vec::IntoIter<CResult<(Vec<u8>, Vec<u8>)>> where Self: Sized + 'a;

    fn delete(&mut self, key: &[u8]) -> CResult<i64> {
        let conn = self.ensure_connected()?;
        let removed: i64 = redis::cmd("DEL").arg(key).query(conn)?;
        Ok(removed)
    }

    fn flush(&mut self) -> CResult<()> {
        Ok(())
    }

    fn get(&mut self, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        let conn = self.ensure_connected()?;
        let value: Option<Vec<u8>> = redis::cmd("GET").arg(key).query(conn)?;
        Ok(value)
    }

    fn scan(&mut self, range: impl std::ops::RangeBounds<Vec<u8>>) -> Self::ScanIterator<'_>
    where
        Self: Sized,
    {
        let bounds = (range.start_bound().cloned(), range.end_bound().cloned());
        let items = self.collect_range(&bounds).unwrap_or_else(|e| {
            log::error!("redis range scan failed: {e}");
            Vec::new()
        });
        items.into_iter().map(Ok).collect::<Vec<_>>().into_iter()
    }

    fn scan_dyn(
        &mut self,
        range: (Bound<Vec<u8>>, Bound<Vec<u8>>),
    ) -> Box<dyn ScanIteratorT + '_> {
        let items = self.collect_range(&range).unwrap_or_else(|e| {
            log::error!("redis range scan failed: {e}");
            Vec::new()
        });
        Box::new(items.into_iter().map(Ok).collect::<Vec<_>>().into_iter())
    }

    fn scan_prefix(&mut self, prefix: &[u8]) -> Self::ScanIterator<'_>
    where
        Self: Sized,
    {
        let items = self.collect_prefix(prefix).unwrap_or_else(|e| {
            log::error!("redis prefix scan failed: {e}");
            Vec::new()
        });
        items.into_iter().map(Ok).collect::<Vec<_>>().into_iter()
    }

    fn set(&mut self, key: &[u8], value: Vec<u8>) -> CResult<()> {
        let conn = self.ensure_connected()?;
        let _: () = redis::cmd("SET").arg(key).arg(value).query(conn)?;
        Ok(())
    }

    fn status(&mut self) -> CResult<Status> {
        let keys = self.scan_keys("*")?;
        let mut size = 0u64;
        for key in &keys {
            size += key.len() as u64;
            if let Some(v) = self.get(key)? {
                size += v.len() as u64;
            }
        }
        Ok(Status {
            name: self.to_string(),
            keys: keys.len() as u64,
            size,
            total_disk_size: 0,
            live_disk_size: 0,
            garbage_disk_size: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_escape_protects_special_characters() {
        assert_eq!(glob_escape(b"foo*"), "foo\\*");
        assert_eq!(glob_escape(b"a.b"), "a.b");
    }

    #[test]
    fn bound_range_contains_respects_inclusivity() {
        let range = (Bound::Included(b"b".to_vec()), Bound::Excluded(b"d".to_vec()));
        assert!(!bound_range_contains(&range, b"a"));
        assert!(bound_range_contains(&range, b"b"));
        assert!(bound_range_contains(&range, b"c"));
        assert!(!bound_range_contains(&range, b"d"));
    }
}
