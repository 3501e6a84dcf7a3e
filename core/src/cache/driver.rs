use std::collections::HashMap;
use std::rc::Rc;

use serde_derive::{Deserialize, Serialize};

use crate::cache::tracer::Tracer;
use crate::encoder::{self, Value};
use crate::error::CResult;
use crate::storage::engine::Engine;

/// The cache's frame-stack state, detached from its backing `Engine`.
///
/// Shipped across the subprocess sandbox's pipe (`executor::subprocess`)
/// so a worker's writes can be replayed onto the parent's `CacheDriver`
/// without re-running the call, matching `contracting`'s
/// `reset_cache(modified_keys, contract_modifications, original_values)`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheSnapshot {
    pub contract_modifications: Vec<HashMap<Vec<u8>, Vec<u8>>>,
    pub modified_keys: HashMap<Vec<u8>, Vec<usize>>,
    pub original_values: HashMap<Vec<u8>, Option<Vec<u8>>>,
}

/// Frame-stacked transactional cache over a backing `Engine`.
///
/// Writes land in the top frame of `contract_modifications`; `commit`
/// flushes the winning value per key through to the store (an encoded
/// null becomes a delete); `revert` discards frames above a checkpoint.
/// This is deliberately not MVCC/snapshot isolation — there is a single
/// linear stack of frames, not per-transaction visibility windows.
pub struct CacheDriver<E: Engine> {
    store: E,
    contract_modifications: Vec<HashMap<Vec<u8>, Vec<u8>>>,
    modified_keys: HashMap<Vec<u8>, Vec<usize>>,
    original_values: HashMap<Vec<u8>, Option<Vec<u8>>>,
    read_cost_per_byte: u64,
    tracer: Rc<Tracer>,
}

impl<E: Engine> CacheDriver<E> {
    pub fn new(store: E) -> Self {
        Self::with_read_cost(store, 1)
    }

    pub fn with_read_cost(store: E, read_cost_per_byte: u64) -> Self {
        CacheDriver {
            store,
            contract_modifications: vec![HashMap::new()],
            modified_keys: HashMap::new(),
            original_values: HashMap::new(),
            read_cost_per_byte,
            tracer: Rc::new(Tracer::new()),
        }
    }

    /// Borrows the backing store directly, bypassing frames entirely.
    /// Used by the subprocess sandbox to clone a store for a worker.
    pub fn store(&self) -> &E {
        &self.store
    }

    /// Replaces the backing store wholesale, used by the subprocess
    /// sandbox to adopt a worker's post-execution store state.
    pub fn set_store(&mut self, store: E) {
        self.store = store;
    }

    /// Shared handle to this driver's metering tracer; the executor starts
    /// and stops it around a call and reads `accumulated()` afterward.
    pub fn tracer(&self) -> Rc<Tracer> {
        self.tracer.clone()
    }

    /// Pushes a fresh empty frame.
    pub fn new_tx(&mut self) {
        self.contract_modifications.push(HashMap::new());
    }

    fn top_frame_idx(&self) -> usize {
        self.contract_modifications.len() - 1
    }

    fn meter(&self, bytes: usize) {
        self.tracer.add_cost(bytes as u64 * self.read_cost_per_byte);
    }

    fn raw_get(&mut self, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        if let Some(indices) = self.modified_keys.get(key) {
            if let Some(&idx) = indices.last() {
                let bytes = self.contract_modifications[idx]
                    .get(key)
                    .cloned()
                    .expect("modified_keys invariant: latest frame index always holds the key");
                return Ok(if encoder::is_null(&bytes) { None } else { Some(bytes) });
            }
        }
        let from_store = self.store.get(key)?;
        self.meter(key.len() + from_store.as_ref().map_or(0, |v| v.len()));
        self.original_values.entry(key.to_vec()).or_insert_with(|| from_store.clone());
        Ok(from_store)
    }

    /// Reads through the cache, decoding the winning value.
    pub fn get(&mut self, key: &[u8]) -> CResult<Option<Value>> {
        match self.raw_get(key)? {
            None => Ok(None),
            Some(bytes) => Ok(Some(encoder::decode(&bytes)?)),
        }
    }

    /// Reads through the cache without decoding, for callers (the
    /// contract driver's `get_contract`) that store already-encoded bytes.
    pub fn get_raw(&mut self, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        self.raw_get(key)
    }

    fn raw_set(&mut self, key: &[u8], bytes: Vec<u8>) {
        let idx = self.top_frame_idx();
        self.contract_modifications[idx].insert(key.to_vec(), bytes);
        let entry = self.modified_keys.entry(key.to_vec()).or_default();
        if entry.last() != Some(&idx) {
            entry.push(idx);
        }
    }

    pub fn set(&mut self, key: &[u8], value: Value) -> CResult<()> {
        self.raw_set(key, encoder::encode(&value));
        Ok(())
    }

    pub fn set_raw(&mut self, key: &[u8], bytes: Vec<u8>) -> CResult<()> {
        self.raw_set(key, bytes);
        Ok(())
    }

    /// Writes the encoded null tombstone; `commit` turns it into a delete.
    pub fn delete(&mut self, key: &[u8]) -> CResult<()> {
        self.raw_set(key, encoder::null_bytes());
        Ok(())
    }

    /// Bypasses the cache entirely, reading straight from the store.
    pub fn get_direct(&mut self, key: &[u8]) -> CResult<Option<Vec<u8>>> {
        self.store.get(key)
    }

    /// Bypasses the cache entirely, writing straight to the store.
    pub fn set_direct(&mut self, key: &[u8], value: Vec<u8>) -> CResult<()> {
        self.store.set(key, value)
    }

    /// Bypasses the cache entirely, deleting straight from the store.
    /// Used by `CRCache::merge` to apply a tombstone from a builder's
    /// effective set directly to master.
    pub fn delete_direct(&mut self, key: &[u8]) -> CResult<i64> {
        self.store.delete(key)
    }

    /// Flushes the winning value per written key through to the store,
    /// then resets to a single empty frame.
    pub fn commit(&mut self) -> CResult<()> {
        let mut winners: Vec<(Vec<u8>, Vec<u8>)> = Vec::new();
        for (key, indices) in &self.modified_keys {
            if let Some(&idx) = indices.last() {
                if let Some(bytes) = self.contract_modifications[idx].get(key) {
                    winners.push((key.clone(), bytes.clone()));
                }
            }
        }
        for (key, bytes) in winners {
            if encoder::is_null(&bytes) {
                self.store.delete(&key)?;
            } else {
                self.meter(key.len() + bytes.len());
                self.store.set(&key, bytes)?;
            }
        }
        self.reset();
        Ok(())
    }

    /// Truncates frames above `idx` and prunes `modified_keys` entries
    /// accordingly. `revert(0)` is a full reset.
    pub fn revert(&mut self, idx: usize) {
        if idx == 0 {
            self.reset();
            return;
        }
        self.contract_modifications.truncate(idx + 1);
        let max_idx = self.contract_modifications.len() - 1;
        for indices in self.modified_keys.values_mut() {
            indices.retain(|&i| i <= max_idx);
        }
        self.modified_keys.retain(|_, indices| !indices.is_empty());
    }

    /// Discards all frames and read-through bookkeeping, leaving exactly
    /// one empty initial frame.
    pub fn reset(&mut self) {
        self.contract_modifications = vec![HashMap::new()];
        self.modified_keys.clear();
        self.original_values.clear();
    }

    /// The value a key held the first time it was read through the cache
    /// in the current frame stack, used by CRCache to detect conflicts.
    pub fn original_value(&self, key: &[u8]) -> Option<&Option<Vec<u8>>> {
        self.original_values.get(key)
    }

    /// All keys with any pending (uncommitted) write, and the bytes they
    /// would flush to the store at `commit()` time (`None` for a
    /// tombstone). Used by `CRCache` to compute a cache's effective set.
    pub fn pending_writes(&self) -> Vec<(Vec<u8>, Option<Vec<u8>>)> {
        let mut out = Vec::with_capacity(self.modified_keys.len());
        for (key, indices) in &self.modified_keys {
            if let Some(&idx) = indices.last() {
                if let Some(bytes) = self.contract_modifications[idx].get(key) {
                    out.push((key.clone(), if encoder::is_null(bytes) { None } else { Some(bytes.clone()) }));
                }
            }
        }
        out
    }

    /// Detached copy of the frame stack, for shipping across the
    /// subprocess sandbox's pipe.
    pub fn snapshot(&self) -> CacheSnapshot {
        CacheSnapshot {
            contract_modifications: self.contract_modifications.clone(),
            modified_keys: self.modified_keys.clone(),
            original_values: self.original_values.clone(),
        }
    }

    /// Replaces the frame stack with one captured by `snapshot()`,
    /// replaying a subprocess worker's writes onto this cache.
    pub fn reset_cache(&mut self, snapshot: CacheSnapshot) {
        self.contract_modifications = snapshot.contract_modifications;
        self.modified_keys = snapshot.modified_keys;
        self.original_values = snapshot.original_values;
    }

    /// Union of underlying-store keys and cache-only keys matching
    /// `prefix`, excluding keys whose winning value is a tombstone.
    pub fn iter(&mut self, prefix: &[u8]) -> CResult<Vec<Vec<u8>>> {
        let mut keys: std::collections::BTreeSet<Vec<u8>> = std::collections::BTreeSet::new();
        for frame in &self.contract_modifications {
            for key in frame.keys() {
                if key.starts_with(prefix) {
                    keys.insert(key.clone());
                }
            }
        }
        for item in self.store.scan_prefix(prefix) {
            let (key, _) = item?;
            keys.insert(key);
        }
        let mut result = Vec::with_capacity(keys.len());
        for key in keys {
            if self.raw_get(&key)?.is_some() {
                result.push(key);
            }
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::Memory;

    fn driver() -> CacheDriver<Memory> {
        CacheDriver::new(Memory::new())
    }

    #[test]
    fn latest_write_wins_across_frames() {
        let mut c = driver();
        c.set(b"a", Value::Int(1)).unwrap();
        c.new_tx();
        c.set(b"a", Value::Int(2)).unwrap();
        assert_eq!(c.get(b"a").unwrap(), Some(Value::Int(2)));
    }

    #[test]
    fn tombstone_hides_value_until_commit_deletes_it() {
        let mut c = driver();
        c.set_direct(b"a", encoder::encode(&Value::Int(1))).unwrap();
        c.new_tx();
        c.delete(b"a").unwrap();
        assert_eq!(c.get(b"a").unwrap(), None);
        c.commit().unwrap();
        assert_eq!(c.get_direct(b"a").unwrap(), None);
    }

    #[test]
    fn commit_flushes_and_resets_to_one_frame() {
        let mut c = driver();
        c.new_tx();
        c.set(b"a", Value::Int(7)).unwrap();
        c.commit().unwrap();

        assert_eq!(c.contract_modifications.len(), 1);
        assert!(c.modified_keys.is_empty());
        assert_eq!(c.get_direct(b"a").unwrap(), Some(encoder::encode(&Value::Int(7))));
    }

    #[test]
    fn revert_discards_frames_above_checkpoint() {
        let mut c = driver();
        c.new_tx(); // frame 1
        c.set(b"a", Value::Int(1)).unwrap();
        c.new_tx(); // frame 2
        c.set(b"a", Value::Int(2)).unwrap();
        c.set(b"b", Value::Int(9)).unwrap();

        c.revert(1);
        assert_eq!(c.get(b"a").unwrap(), Some(Value::Int(1)));
        assert_eq!(c.get(b"b").unwrap(), None);
    }

    #[test]
    fn revert_zero_is_full_reset() {
        let mut c = driver();
        c.set(b"a", Value::Int(1)).unwrap();
        c.revert(0);
        assert_eq!(c.get(b"a").unwrap(), None);
        assert_eq!(c.contract_modifications.len(), 1);
    }

    #[test]
    fn iter_unions_store_and_cache_keys() {
        let mut c = driver();
        c.set_direct(b"token.balances:alice", encoder::encode(&Value::Int(1))).unwrap();
        c.set(b"token.balances:bob", Value::Int(2)).unwrap();
        c.set(b"other.balances:carol", Value::Int(3)).unwrap();

        let mut keys = c.iter(b"token.balances:").unwrap();
        keys.sort();
        assert_eq!(
            keys,
            vec![b"token.balances:alice".to_vec(), b"token.balances:bob".to_vec()]
        );
    }

    #[test]
    fn read_through_meters_when_tracer_running() {
        let mut c = driver();
        c.set_direct(b"a", encoder::encode(&Value::Int(1))).unwrap();
        let tracer = c.tracer();
        tracer.start();
        c.get(b"a").unwrap();
        assert!(tracer.accumulated() > 0);
    }
}
