//! Parallel sub-block conflict-resolution cache (spec.md §4.8).
//!
//! One `CRCache` per sub-block builder runs the same bag-execution
//! protocol as `Executor::execute_bag`, but stages its effective set in
//! a private scratch store instead of writing straight through to the
//! shared master, then merges that set into master once every builder
//! in the round has reached the matching phase. Three reserved counters
//! (`__exec__`, `__cr__`, `__reset__`) on the shared master drive the
//! phase barrier: each reaching `num_sbb` is what lets a builder cross
//! into the next state.
//!
//! The builders' own phase-completion signal (`sync_execution`'s
//! "is this builder at the top of the scheduler's stack" check) is
//! supplied by a `Scheduler` the caller implements; nothing here
//! assumes a particular scheduling policy.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::Config;
use crate::contract::ContractDriver;
use crate::encoder::{self, Value};
use crate::error::{CResult, Error};
use crate::executor::{Bag, Executor, Outcome};
use crate::storage::engine::Engine;

const EXEC_MACRO_KEY: &[u8] = b"__exec__";
const CR_MACRO_KEY: &[u8] = b"__cr__";
const RESET_MACRO_KEY: &[u8] = b"__reset__";

/// The six-state transition machine a `CRCache` walks through once per
/// CR round, matching the state strings a scheduler polls for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CRCacheState {
    Clean,
    BagSet,
    Executed,
    Committed,
    ReadyToMerge,
    Reset,
}

impl CRCacheState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CRCacheState::Clean => "CLEAN",
            CRCacheState::BagSet => "BAG_SET",
            CRCacheState::Executed => "EXECUTED",
            CRCacheState::Committed => "COMMITTED",
            CRCacheState::ReadyToMerge => "READY_TO_MERGE",
            CRCacheState::Reset => "RESET",
        }
    }
}

/// Tells a `CRCache` whether it's the next builder the scheduler expects
/// to finish a phase. Implemented by the block layer; the in-crate test
/// stub drives it from an explicit ordering instead of wall-clock races.
pub trait Scheduler {
    fn is_top_of_stack(&self, sbb_idx: usize) -> bool;
}

/// One committed-but-not-yet-merged write, held between `sync_execution`
/// (which captures it) and `merge` (which applies or rejects it).
struct PendingWrite {
    key: Vec<u8>,
    value: Option<Vec<u8>>,
    original: Option<Vec<u8>>,
}

/// Per-sub-block-builder conflict-resolution cache. Shares `E`, the
/// master's engine type, with its own scratch `ContractDriver<E>`: the
/// scratch store is seeded by cloning master's current store at the
/// start of every round, so a bag can read contract code and any other
/// contract's state exactly as it would against master, while its own
/// writes stay private until `merge`.
pub struct CRCache<E>
where
    E: Engine + Clone + Serialize + DeserializeOwned,
{
    idx: usize,
    sbb_idx: usize,
    num_sbb: usize,
    config: Config,
    executor: Executor,
    master: Rc<RefCell<ContractDriver<E>>>,
    scratch: ContractDriver<E>,
    state: CRCacheState,
    bag: Option<Bag>,
    results: Option<BTreeMap<usize, Outcome>>,
    effective_set: Vec<PendingWrite>,
}

impl<E> CRCache<E>
where
    E: Engine + Clone + Serialize + DeserializeOwned,
{
    pub fn new(
        idx: usize,
        sbb_idx: usize,
        num_sbb: usize,
        master: Rc<RefCell<ContractDriver<E>>>,
        config: Config,
        executor: Executor,
    ) -> Self {
        let store = master.borrow_mut().cache().store().clone();
        let scratch = ContractDriver::new(store, config.clone());
        CRCache {
            idx,
            sbb_idx,
            num_sbb,
            config,
            executor,
            master,
            scratch,
            state: CRCacheState::Clean,
            bag: None,
            results: None,
            effective_set: Vec::new(),
        }
    }

    pub fn state(&self) -> CRCacheState {
        self.state
    }

    pub fn idx(&self) -> usize {
        self.idx
    }

    /// Reads the cache-level scratch store directly, bypassing frames.
    /// Matches the scheduler-visible `cache.db.get_direct` view a
    /// downstream builder reads before `merge()` has run.
    pub fn get_direct(&mut self, key: &[u8]) -> CResult<Option<Value>> {
        match self.scratch.cache().get_direct(key)? {
            None => Ok(None),
            Some(bytes) => Ok(Some(encoder::decode(&bytes)?)),
        }
    }

    fn check_macro_key(&mut self, key: &[u8]) -> CResult<u64> {
        let mut master = self.master.borrow_mut();
        match master.cache().get_direct(key)? {
            None => Ok(0),
            Some(bytes) => match encoder::decode(&bytes)? {
                Value::Int(n) => Ok(n.max(0) as u64),
                _ => Err(Error::Internal(format!(
                    "macro key {} held a non-integer value",
                    String::from_utf8_lossy(key)
                ))),
            },
        }
    }

    fn bump_macro_key(&mut self, key: &[u8]) -> CResult<u64> {
        let current = self.check_macro_key(key)?;
        let next = current + 1;
        let mut master = self.master.borrow_mut();
        master.cache().set_direct(key, encoder::encode(&Value::Int(next as i128)))?;
        Ok(next)
    }

    /// CLEAN -> BAG_SET.
    pub fn set_bag(&mut self, bag: Bag) -> CResult<()> {
        if self.state != CRCacheState::Clean {
            return Err(Error::Internal(format!(
                "set_bag called in state {}, expected CLEAN",
                self.state.as_str()
            )));
        }
        self.bag = Some(bag);
        self.state = CRCacheState::BagSet;
        Ok(())
    }

    /// BAG_SET -> EXECUTED. Runs the bag against the scratch store with
    /// `auto_commit = false`, leaving every transaction's writes staged
    /// in cache frames rather than flushed, then bumps `__exec__` once.
    pub fn execute(&mut self) -> CResult<()> {
        if self.state != CRCacheState::BagSet {
            return Err(Error::Internal(format!(
                "execute called in state {}, expected BAG_SET",
                self.state.as_str()
            )));
        }
        let bag = self.bag.take().ok_or_else(|| Error::Internal("execute called with no bag set".to_string()))?;
        let results = self.executor.execute_bag(&mut self.scratch, &bag, false, &[])?;
        self.results = Some(results);
        self.bump_macro_key(EXEC_MACRO_KEY)?;
        self.state = CRCacheState::Executed;
        Ok(())
    }

    /// Outcomes from the last `execute()`, keyed by position in the bag.
    pub fn get_results(&self) -> Option<&BTreeMap<usize, Outcome>> {
        self.results.as_ref()
    }

    /// EXECUTED -> COMMITTED, gated on `scheduler` reporting this
    /// builder at the top of the stack and `__exec__` having reached
    /// `num_sbb`. On success, captures the bag's effective set (with
    /// each key's pre-round original value, for `merge`'s conflict
    /// check) before flushing the scratch cache's frames into the
    /// scratch store, and bumps `__cr__` to signal readiness to merge.
    pub fn sync_execution(&mut self, scheduler: &dyn Scheduler) -> CResult<bool> {
        if self.state != CRCacheState::Executed {
            return Ok(false);
        }
        if !scheduler.is_top_of_stack(self.sbb_idx) {
            return Ok(false);
        }
        if self.check_macro_key(EXEC_MACRO_KEY)? < self.num_sbb as u64 {
            return Ok(false);
        }

        let pending = self.scratch.cache().pending_writes();
        self.effective_set = pending
            .into_iter()
            .map(|(key, value)| {
                let original = self.scratch.cache().original_value(&key).cloned().flatten();
                PendingWrite { key, value, original }
            })
            .collect();
        self.scratch.cache().commit()?;
        self.bump_macro_key(CR_MACRO_KEY)?;
        self.state = CRCacheState::Committed;
        Ok(true)
    }

    /// COMMITTED -> READY_TO_MERGE, gated on `__cr__` having reached
    /// `num_sbb` (every builder in the round has committed).
    pub fn sync_merge_ready(&mut self) -> CResult<bool> {
        if self.state != CRCacheState::Committed {
            return Ok(false);
        }
        if self.check_macro_key(CR_MACRO_KEY)? < self.num_sbb as u64 {
            return Ok(false);
        }
        self.state = CRCacheState::ReadyToMerge;
        Ok(true)
    }

    /// READY_TO_MERGE -> RESET. Writes the effective set through to
    /// master, key by key, validating first and writing second so a
    /// conflict never leaves a partial merge behind. A key conflicts
    /// when master's current value disagrees with the value this
    /// builder observed before making its own writes.
    pub fn merge(&mut self) -> CResult<()> {
        if self.state != CRCacheState::ReadyToMerge {
            return Err(Error::Internal(format!(
                "merge called in state {}, expected READY_TO_MERGE",
                self.state.as_str()
            )));
        }

        {
            let mut master = self.master.borrow_mut();
            for write in &self.effective_set {
                let current = master.cache().get_direct(&write.key)?;
                if current != write.original {
                    return Err(Error::MergeConflict {
                        key: write.key.clone(),
                        expected: write.original.clone(),
                        found: current,
                    });
                }
            }
            for write in &self.effective_set {
                match &write.value {
                    Some(bytes) => master.cache().set_direct(&write.key, bytes.clone())?,
                    None => {
                        master.cache().delete_direct(&write.key)?;
                    }
                }
            }
        }

        self.effective_set.clear();
        self.bump_macro_key(RESET_MACRO_KEY)?;
        self.state = CRCacheState::Reset;
        Ok(())
    }

    /// RESET -> CLEAN, gated on `__reset__` having reached `num_sbb`.
    /// Replaces the scratch store wholesale with a fresh one so the
    /// next round starts from an empty cache.
    pub fn sync_reset(&mut self) -> CResult<bool> {
        if self.state != CRCacheState::Reset {
            return Ok(false);
        }
        if self.check_macro_key(RESET_MACRO_KEY)? < self.num_sbb as u64 {
            return Ok(false);
        }
        let store = self.master.borrow_mut().cache().store().clone();
        self.scratch = ContractDriver::new(store, self.config.clone());
        self.state = CRCacheState::Clean;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::metadata::ContractType;
    use crate::sanitizer;
    use crate::storage::memory::Memory;

    const LEDGER_SRC: &str = r#"
balances = Hash()

@export
def set_amount(key, amount):
    balances[key] = amount
"#;

    fn bag_for(sbb_idx: usize, amount: i128) -> Bag {
        vec![crate::executor::Transaction {
            sender: "stu".to_string(),
            contract: "ledger".to_string(),
            function: "set_amount".to_string(),
            kwargs: vec![
                ("key".to_string(), Value::Str(format!("sbb{sbb_idx}"))),
                ("amount".to_string(), Value::Int(amount)),
            ],
            stamps: Some(1_000_000),
        }]
    }

    fn master_with_ledger() -> Rc<RefCell<ContractDriver<Memory>>> {
        let mut driver = ContractDriver::new(Memory::new(), Config::default());
        let config = driver.config().clone();
        let compiled = sanitizer::compile(LEDGER_SRC, &config, "ledger", &mut driver).unwrap();
        let bytes = sanitizer::serialize(&compiled).unwrap();
        driver.set_contract("ledger", LEDGER_SRC.as_bytes(), "stu", ContractType::User, bytes, false).unwrap();
        driver.cache().commit().unwrap();
        driver.cache().new_tx();
        Rc::new(RefCell::new(driver))
    }

    struct FixedScheduler {
        top: usize,
    }

    impl Scheduler for FixedScheduler {
        fn is_top_of_stack(&self, sbb_idx: usize) -> bool {
            sbb_idx == self.top
        }
    }

    fn run_one_round<E>(caches: &mut [CRCache<E>])
    where
        E: Engine + Clone + Serialize + DeserializeOwned,
    {
        for c in caches.iter_mut() {
            assert!(c.sync_execution(&FixedScheduler { top: c.sbb_idx }).unwrap());
        }
        for c in caches.iter_mut() {
            assert!(c.sync_merge_ready().unwrap());
        }
        for c in caches.iter_mut() {
            c.merge().unwrap();
        }
        for c in caches.iter_mut() {
            assert!(c.sync_reset().unwrap());
        }
    }

    #[test]
    fn e6_two_builders_with_disjoint_keys_both_merge_into_master() {
        let master = master_with_ledger();
        let config = Config::default();
        let executor = Executor::default();

        let mut a = CRCache::new(0, 0, 2, master.clone(), config.clone(), executor.clone());
        let mut b = CRCache::new(1, 1, 2, master.clone(), config.clone(), executor);

        a.set_bag(bag_for(0, 10)).unwrap();
        b.set_bag(bag_for(1, 20)).unwrap();
        assert_eq!(a.state(), CRCacheState::BagSet);

        a.execute().unwrap();
        b.execute().unwrap();
        assert_eq!(a.state(), CRCacheState::Executed);
        assert_eq!(a.get_results().unwrap().get(&0).unwrap().status_code(), 0);

        run_one_round(&mut [a, b]);

        let mut m = master.borrow_mut();
        assert_eq!(m.hget("ledger", "balances", "sbb0").unwrap(), Some(Value::Int(10)));
        assert_eq!(m.hget("ledger", "balances", "sbb1").unwrap(), Some(Value::Int(20)));
    }

    #[test]
    fn state_machine_rejects_out_of_order_calls() {
        let master = master_with_ledger();
        let mut a = CRCache::new(0, 0, 1, master, Config::default(), Executor::default());

        assert!(a.execute().is_err());
        assert!(a.merge().is_err());

        a.set_bag(bag_for(0, 5)).unwrap();
        assert!(a.set_bag(bag_for(0, 5)).is_err());
    }

    #[test]
    fn sync_gates_wait_for_every_builder_and_scheduler_order() {
        let master = master_with_ledger();
        let config = Config::default();
        let executor = Executor::default();

        let mut a = CRCache::new(0, 0, 2, master.clone(), config.clone(), executor.clone());
        let mut b = CRCache::new(1, 1, 2, master.clone(), config.clone(), executor);

        a.set_bag(bag_for(0, 1)).unwrap();
        b.set_bag(bag_for(1, 2)).unwrap();
        a.execute().unwrap();

        // Only one builder has executed so far; __exec__ hasn't reached
        // num_sbb yet, so sync_execution can't advance even though this
        // builder is reported as top of stack.
        assert!(!a.sync_execution(&FixedScheduler { top: 0 }).unwrap());

        b.execute().unwrap();
        // Now __exec__ == num_sbb, but the scheduler says it isn't a's turn.
        assert!(!a.sync_execution(&FixedScheduler { top: 1 }).unwrap());
        assert!(a.sync_execution(&FixedScheduler { top: 0 }).unwrap());
        assert_eq!(a.state(), CRCacheState::Committed);

        assert!(b.sync_execution(&FixedScheduler { top: 1 }).unwrap());
        assert_eq!(b.state(), CRCacheState::Committed);
    }

    #[test]
    fn merge_conflict_is_rejected_when_master_changed_underneath() {
        let master = master_with_ledger();
        let config = Config::default();
        let executor = Executor::default();

        let mut a = CRCache::new(0, 0, 1, master.clone(), config, executor);
        a.set_bag(bag_for(0, 99)).unwrap();
        a.execute().unwrap();
        assert!(a.sync_execution(&FixedScheduler { top: 0 }).unwrap());
        assert!(a.sync_merge_ready().unwrap());

        // Someone else writes the same key directly to master in the
        // meantime, invalidating the original value `a` observed.
        master
            .borrow_mut()
            .hset("ledger", "balances", "sbb0", Value::Int(777))
            .unwrap();
        master.borrow_mut().cache().commit().unwrap();

        let err = a.merge().unwrap_err();
        assert!(matches!(err, Error::MergeConflict { .. }));
    }
}
