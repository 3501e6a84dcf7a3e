//! Metered dispatch (spec.md §4.7): reads a sender's stamp balance,
//! meters a call through the `Loader`, and commits or reverts the
//! driver's frame stack depending on the outcome.
//!
//! Two sandbox variants dispatch the same call: `Inline` runs in the
//! calling thread and relies on the driver's frame discipline alone;
//! `Isolated` re-execs this binary as a `--sandbox-worker` subprocess so
//! a crash or runaway loop can't corrupt the parent's state. Both paths
//! converge on the same `(status_code, result, stamps_used)` triple.

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::process::{Command, Stdio};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_derive::{Deserialize, Serialize as DeriveSerialize};

use crate::cache::CacheSnapshot;
use crate::config::Config;
use crate::contract::ContractDriver;
use crate::encoder::{self, Value};
use crate::error::{CResult, Error};
use crate::loader::{canonical_decimal, numeric, Loader};
use crate::storage::engine::Engine;

/// One call dispatched through the executor.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub sender: String,
    pub contract: String,
    pub function: String,
    pub kwargs: Vec<(String, Value)>,
    /// Stamp budget for this call; falls back to `Config::default_stamps`.
    pub stamps: Option<u64>,
}

/// An ordered sequence of calls. Within a bag, transactions execute and
/// commit in the order supplied (spec.md §5's ordering guarantee).
pub type Bag = Vec<Transaction>;

/// Outcome of one dispatch, mirroring the `(status_code, result)` pair
/// the block layer consumes.
#[derive(Debug, Clone)]
pub enum ExecutionResult {
    Success(Value),
    Failure(Error),
}

impl ExecutionResult {
    pub fn status_code(&self) -> u8 {
        match self {
            ExecutionResult::Success(_) => 0,
            ExecutionResult::Failure(_) => 1,
        }
    }
}

/// Full `(status_code, result, stamps_used)` triple for one dispatch.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub result: ExecutionResult,
    pub stamps_used: u64,
}

impl Outcome {
    pub fn status_code(&self) -> u8 {
        self.result.status_code()
    }
}

/// Which of the two sandbox variants a dispatch runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SandboxMode {
    #[default]
    Inline,
    Isolated,
}

/// Meters and dispatches contract calls, committing or reverting the
/// driver's frame stack around each one. One `Executor` is shared
/// across every call in a block; it carries no per-call state itself.
#[derive(Debug, Clone)]
pub struct Executor {
    pub sandbox: SandboxMode,
    pub metering: bool,
}

impl Default for Executor {
    fn default() -> Self {
        Executor { sandbox: SandboxMode::Inline, metering: true }
    }
}

impl Executor {
    pub fn new(sandbox: SandboxMode, metering: bool) -> Self {
        Executor { sandbox, metering }
    }

    /// Dispatches one call. `environment` is accepted at the API surface
    /// (spec.md §6) but has no dialect-level binding: the restricted
    /// environment a contract body runs in only ever exposes `ctx`, the
    /// ORM, and the hashing builtins (spec.md §4.6).
    pub fn execute<E>(
        &self,
        driver: &mut ContractDriver<E>,
        sender: &str,
        contract: &str,
        function: &str,
        kwargs: Vec<(String, Value)>,
        stamps: Option<u64>,
        auto_commit: bool,
        environment: &[(String, Value)],
    ) -> CResult<Outcome>
    where
        E: Engine + Clone + Serialize + DeserializeOwned,
    {
        let _ = environment;
        let config = driver.config().clone();
        let stamps = stamps.unwrap_or(config.default_stamps);

        // Step 1-2: pre-flight balance check. This runs (and can fail)
        // before any frame is touched, so a rejection here leaves state
        // byte-for-byte unchanged (spec.md §8's E3).
        let balances_key = if self.metering {
            let key = driver.make_hash_key(&config.currency_contract, &config.balances_hash, sender);
            let balance = read_balance(driver, &key)?;
            let (scale, unscaled) = numeric(&balance)?;
            let budget_at_scale = (stamps as i128).saturating_mul(10i128.saturating_pow(scale));
            if unscaled.saturating_mul(config.stamp_to_cost_ratio as i128) < budget_at_scale {
                return Err(Error::InsufficientStamps { balance: unscaled, stamps_requested: stamps });
            }
            Some(key)
        } else {
            None
        };

        // Step 3-4: dispatch inside the chosen sandbox, under a stamp budget.
        let (dispatch, stamps_used) = match self.sandbox {
            SandboxMode::Inline => {
                let tracer = driver.cache().tracer();
                tracer.start();
                let mut loader = Loader::new(driver, config.clone()).with_stamp_budget(stamps);
                let result = loader.call(sender, contract, function, kwargs);
                (result, tracer.stop().min(stamps))
            }
            SandboxMode::Isolated => {
                dispatch_isolated(driver, &config, sender, contract, function, kwargs, stamps)?
            }
        };

        let execution_result = match dispatch {
            Ok(value) => {
                if auto_commit {
                    driver.cache().commit()?;
                }
                ExecutionResult::Success(value)
            }
            Err(e) => {
                if auto_commit {
                    driver.cache().revert(0);
                }
                ExecutionResult::Failure(e)
            }
        };

        // Step 5: deduct the stamps used, regardless of `auto_commit` or
        // outcome, and commit that deduction on its own.
        if let Some(key) = balances_key {
            let balance = read_balance(driver, &key)?;
            let (scale, unscaled) = numeric(&balance)?;
            let ratio = config.stamp_to_cost_ratio.max(1);
            let deduction = (stamps_used + ratio - 1) / ratio;
            let deduction_at_scale = (deduction as i128).saturating_mul(10i128.saturating_pow(scale));
            let new_unscaled = (unscaled - deduction_at_scale).max(0);

            driver.cache().new_tx();
            driver.cache().set(&key, canonical_decimal(scale, new_unscaled))?;
            driver.cache().commit()?;
        }

        // Step 6: always leave a fresh frame ready for the next call.
        driver.cache().new_tx();

        Ok(Outcome { result: execution_result, stamps_used })
    }

    /// Runs a bag of transactions through `execute`, in order, returning
    /// each call's outcome keyed by its position in the bag.
    pub fn execute_bag<E>(
        &self,
        driver: &mut ContractDriver<E>,
        bag: &Bag,
        auto_commit: bool,
        environment: &[(String, Value)],
    ) -> CResult<BTreeMap<usize, Outcome>>
    where
        E: Engine + Clone + Serialize + DeserializeOwned,
    {
        let mut results = BTreeMap::new();
        for (idx, tx) in bag.iter().enumerate() {
            let outcome = self.execute(
                driver,
                &tx.sender,
                &tx.contract,
                &tx.function,
                tx.kwargs.clone(),
                tx.stamps,
                auto_commit,
                environment,
            )?;
            results.insert(idx, outcome);
        }
        Ok(results)
    }
}

fn read_balance<E: Engine>(driver: &mut ContractDriver<E>, key: &[u8]) -> CResult<Value> {
    Ok(driver.cache().get(key)?.unwrap_or(Value::Int(0)))
}

// ---------------------------------------------------------------------
// Isolated subprocess sandbox.
//
// Each dispatch re-execs the current binary in `--sandbox-worker` mode
// (there's no long-lived worker process to crash and re-instantiate,
// unlike the lazily-started, persistent multiprocessing worker this is
// grounded on — a simplification worth the extra spawn cost here, since
// it removes an entire class of worker-lifecycle bugs). The whole store
// and the cache's pending frame stack cross the pipe so the worker can
// reconstruct an equivalent `ContractDriver` and run the call exactly as
// `Inline` would; its resulting store and frame stack cross back and
// replace the parent's, mirroring `reset_cache`.
// ---------------------------------------------------------------------

const SANDBOX_WORKER_FLAG: &str = "--sandbox-worker";

/// True if the current process was re-execed to run one sandboxed call.
pub fn is_sandbox_worker_invocation() -> bool {
    std::env::args().any(|a| a == SANDBOX_WORKER_FLAG)
}

#[derive(Debug, Clone, DeriveSerialize, Deserialize)]
struct WireTransaction {
    sender: String,
    contract: String,
    function: String,
    kwargs: Vec<(String, Vec<u8>)>,
    stamps: u64,
}

#[derive(DeriveSerialize, Deserialize)]
struct WireRequest<E> {
    store: E,
    config: Config,
    snapshot: CacheSnapshot,
    tx: WireTransaction,
}

#[derive(DeriveSerialize, Deserialize)]
enum WireOutcome {
    Success(Vec<u8>),
    Failure(String),
}

#[derive(DeriveSerialize, Deserialize)]
struct WireResponse<E> {
    store: E,
    snapshot: CacheSnapshot,
    outcome: WireOutcome,
    stamps_used: u64,
}

fn write_framed<W: Write, T: Serialize>(out: &mut W, value: &T) -> CResult<()> {
    let payload = bincode::serialize(value)?;
    out.write_u64::<BigEndian>(payload.len() as u64).map_err(|e| Error::Internal(e.to_string()))?;
    out.write_all(&payload).map_err(|e| Error::Internal(e.to_string()))?;
    out.flush().map_err(|e| Error::Internal(e.to_string()))?;
    Ok(())
}

fn read_framed<R: Read, T: DeserializeOwned>(input: &mut R) -> CResult<T> {
    let len = input.read_u64::<BigEndian>().map_err(|e| Error::Internal(e.to_string()))? as usize;
    let mut buf = vec![0u8; len];
    input.read_exact(&mut buf).map_err(|e| Error::Internal(e.to_string()))?;
    Ok(bincode::deserialize(&buf)?)
}

#[allow(clippy::too_many_arguments)]
fn dispatch_isolated<E>(
    driver: &mut ContractDriver<E>,
    config: &Config,
    sender: &str,
    contract: &str,
    function: &str,
    kwargs: Vec<(String, Value)>,
    stamps: u64,
) -> CResult<(CResult<Value>, u64)>
where
    E: Engine + Clone + Serialize + DeserializeOwned,
{
    let store = driver.cache().store().clone();
    let snapshot = driver.cache().snapshot();
    let wire_kwargs = kwargs.iter().map(|(k, v)| (k.clone(), encoder::encode(v))).collect();
    let request = WireRequest {
        store,
        config: config.clone(),
        snapshot,
        tx: WireTransaction {
            sender: sender.to_string(),
            contract: contract.to_string(),
            function: function.to_string(),
            kwargs: wire_kwargs,
            stamps,
        },
    };

    let exe = std::env::current_exe().map_err(|e| Error::Internal(e.to_string()))?;
    let mut child = Command::new(exe)
        .arg(SANDBOX_WORKER_FLAG)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .map_err(|e| Error::Internal(format!("failed to spawn sandbox worker: {e}")))?;

    {
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Internal("sandbox worker stdin unavailable".to_string()))?;
        write_framed(&mut stdin, &request)?;
    }

    let response: WireResponse<E> = {
        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("sandbox worker stdout unavailable".to_string()))?;
        read_framed(&mut stdout)?
    };

    let status = child.wait().map_err(|e| Error::Internal(e.to_string()))?;
    if !status.success() {
        return Err(Error::Internal(format!("sandbox worker exited with {status}")));
    }

    driver.cache().set_store(response.store);
    driver.cache().reset_cache(response.snapshot);

    let result = match response.outcome {
        WireOutcome::Success(bytes) => Ok(encoder::decode(&bytes)?),
        WireOutcome::Failure(msg) => Err(Error::Internal(msg)),
    };
    Ok((result, response.stamps_used))
}

/// Entry point for a `--sandbox-worker` re-exec: reads one `WireRequest`
/// from stdin, runs it through the `Inline` path against a driver
/// rebuilt from the shipped store and frame stack, and writes one
/// `WireResponse` to stdout.
pub fn run_sandbox_worker<E>() -> CResult<()>
where
    E: Engine + Clone + Serialize + DeserializeOwned,
{
    let stdin = std::io::stdin();
    let mut lock = stdin.lock();
    let request: WireRequest<E> = read_framed(&mut lock)?;

    let mut driver = ContractDriver::new(request.store, request.config);
    driver.cache().reset_cache(request.snapshot);

    let kwargs: CResult<Vec<(String, Value)>> = request
        .tx
        .kwargs
        .into_iter()
        .map(|(name, bytes)| encoder::decode(&bytes).map(|v| (name, v)))
        .collect();
    let kwargs = kwargs?;

    let tracer = driver.cache().tracer();
    tracer.start();
    let mut loader = Loader::new(&mut driver, driver.config().clone()).with_stamp_budget(request.tx.stamps);
    let result = loader.call(&request.tx.sender, &request.tx.contract, &request.tx.function, kwargs);
    let stamps_used = tracer.stop().min(request.tx.stamps);

    let outcome = match result {
        Ok(value) => WireOutcome::Success(encoder::encode(&value)),
        Err(e) => WireOutcome::Failure(e.to_string()),
    };

    let response = WireResponse {
        store: driver.cache().store().clone(),
        snapshot: driver.cache().snapshot(),
        outcome,
        stamps_used,
    };

    let stdout = std::io::stdout();
    let mut lock = stdout.lock();
    write_framed(&mut lock, &response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::metadata::ContractType;
    use crate::sanitizer;
    use crate::storage::memory::Memory;

    const CURRENCY_SRC: &str = r#"
balances = Hash()

@export
def transfer(amount, to):
    sender = ctx.signer
    balances[sender] -= amount
    balances[to] += amount
"#;

    const INF_LOOP_SRC: &str = r#"
balances = Hash()

@export
def spin():
    x = 0
    while True:
        x += 1
"#;

    fn submit(driver: &mut ContractDriver<Memory>, name: &str, source: &str) {
        let config = driver.config().clone();
        let compiled = sanitizer::compile(source, &config, name, driver).unwrap();
        let bytes = sanitizer::serialize(&compiled).unwrap();
        driver
            .set_contract(name, source.as_bytes(), "stu", ContractType::User, bytes, false)
            .unwrap();
    }

    fn driver_with_balance(balance: i128) -> ContractDriver<Memory> {
        let mut driver = ContractDriver::new(Memory::new(), Config::default());
        submit(&mut driver, "currency", CURRENCY_SRC);
        driver.hset("currency", "balances", "stu", Value::Int(balance)).unwrap();
        driver.cache().commit().unwrap();
        driver.cache().new_tx();
        driver
    }

    fn transfer_kwargs() -> Vec<(String, Value)> {
        vec![("amount".to_string(), Value::Int(100)), ("to".to_string(), Value::Str("colin".to_string()))]
    }

    #[test]
    fn e1_successful_metered_transfer_deducts_stamps_and_moves_balance() {
        let mut driver = driver_with_balance(1000);
        let executor = Executor::default();

        let outcome = executor
            .execute(&mut driver, "stu", "currency", "transfer", transfer_kwargs(), Some(1_000_000), true, &[])
            .unwrap();

        assert_eq!(outcome.status_code(), 0);
        let expected_stu = 1000 - 100 - outcome.stamps_used as i128;
        assert_eq!(driver.hget("currency", "balances", "stu").unwrap(), Some(Value::Int(expected_stu)));
        assert_eq!(driver.hget("currency", "balances", "colin").unwrap(), Some(Value::Int(100)));
    }

    #[test]
    fn e2_out_of_stamps_still_deducts_exactly_the_capped_budget() {
        let mut driver = driver_with_balance(1000);
        let executor = Executor::default();

        // A budget of 3 can't survive past `transfer`'s second statement
        // (every statement and sub-expression costs at least one unit),
        // regardless of exactly how many nodes the body lowers to.
        let outcome = executor
            .execute(&mut driver, "stu", "currency", "transfer", transfer_kwargs(), Some(3), true, &[])
            .unwrap();

        assert_eq!(outcome.status_code(), 1);
        assert!(matches!(outcome.result, ExecutionResult::Failure(Error::OutOfStamps)));
        assert_eq!(outcome.stamps_used, 3);
        assert_eq!(driver.hget("currency", "balances", "stu").unwrap(), Some(Value::Int(1000 - 3)));
        assert_eq!(driver.hget("currency", "balances", "colin").unwrap(), None);
    }

    #[test]
    fn e3_insufficient_stamps_rejected_before_dispatch_state_unchanged() {
        let mut driver = driver_with_balance(1000);
        let executor = Executor::default();

        let err = executor
            .execute(&mut driver, "stu", "currency", "transfer", transfer_kwargs(), Some(1000 + 1000), true, &[])
            .unwrap_err();

        assert!(matches!(err, Error::InsufficientStamps { .. }));
        assert_eq!(driver.hget("currency", "balances", "stu").unwrap(), Some(Value::Int(1000)));
    }

    #[test]
    fn e4_infinite_loop_exhausts_stamps_and_leaves_only_the_deduction() {
        let mut driver = ContractDriver::new(Memory::new(), Config::default());
        submit(&mut driver, "currency", INF_LOOP_SRC);
        driver.hset("currency", "balances", "stu", Value::Int(50)).unwrap();
        driver.cache().commit().unwrap();
        driver.cache().new_tx();

        let executor = Executor::default();
        let outcome = executor.execute(&mut driver, "stu", "currency", "spin", vec![], Some(50), true, &[]).unwrap();

        assert_eq!(outcome.status_code(), 1);
        assert_eq!(driver.hget("currency", "balances", "stu").unwrap(), Some(Value::Int(0)));
    }

    #[test]
    fn e5_bag_with_auto_commit_observes_each_intermediate_write() {
        let mut driver = ContractDriver::new(Memory::new(), Config::default());
        let src = r#"
store = Hash()

@export
def write(value):
    store['x'] = value

@export
def remove():
    store['x'] = None
"#;
        submit(&mut driver, "scratch", src);

        let executor = Executor::new(SandboxMode::Inline, false);

        executor.execute(&mut driver, "stu", "scratch", "write", vec![("value".to_string(), Value::Int(10))], None, true, &[]).unwrap();
        assert_eq!(driver.hget("scratch", "store", "x").unwrap(), Some(Value::Int(10)));

        executor.execute(&mut driver, "stu", "scratch", "write", vec![("value".to_string(), Value::Int(20))], None, true, &[]).unwrap();
        assert_eq!(driver.hget("scratch", "store", "x").unwrap(), Some(Value::Int(20)));

        executor.execute(&mut driver, "stu", "scratch", "remove", vec![], None, true, &[]).unwrap();
        assert_eq!(driver.hget("scratch", "store", "x").unwrap(), None);
    }

    #[test]
    fn e5_bag_without_auto_commit_stages_until_one_final_commit() {
        let mut driver = ContractDriver::new(Memory::new(), Config::default());
        let src = r#"
store = Hash()

@export
def write(value):
    store['x'] = value

@export
def remove():
    store['x'] = None
"#;
        submit(&mut driver, "scratch", src);

        let executor = Executor::new(SandboxMode::Inline, false);

        executor.execute(&mut driver, "stu", "scratch", "write", vec![("value".to_string(), Value::Int(10))], None, false, &[]).unwrap();
        // staged, not yet visible to a fresh read-through of the store.
        assert_eq!(driver.hget("scratch", "store", "x").unwrap(), Some(Value::Int(10)));

        executor.execute(&mut driver, "stu", "scratch", "write", vec![("value".to_string(), Value::Int(20))], None, false, &[]).unwrap();
        executor.execute(&mut driver, "stu", "scratch", "remove", vec![], None, false, &[]).unwrap();

        assert_eq!(driver.cache().get_direct(b"scratch.store:x").unwrap(), None);
        driver.cache().commit().unwrap();
        assert_eq!(driver.hget("scratch", "store", "x").unwrap(), None);
    }

    #[test]
    fn execute_bag_runs_transactions_in_order_and_keys_results_by_index() {
        let mut driver = driver_with_balance(1000);
        let executor = Executor::default();

        let bag: Bag = vec![
            Transaction {
                sender: "stu".to_string(),
                contract: "currency".to_string(),
                function: "transfer".to_string(),
                kwargs: transfer_kwargs(),
                stamps: Some(1_000_000),
            },
            Transaction {
                sender: "stu".to_string(),
                contract: "currency".to_string(),
                function: "transfer".to_string(),
                kwargs: vec![("amount".to_string(), Value::Int(1)), ("to".to_string(), Value::Str("dave".to_string()))],
                stamps: Some(1_000_000),
            },
        ];

        let results = executor.execute_bag(&mut driver, &bag, true, &[]).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[&0].status_code(), 0);
        assert_eq!(results[&1].status_code(), 0);
        assert_eq!(driver.hget("currency", "balances", "dave").unwrap(), Some(Value::Int(1)));
    }
}
