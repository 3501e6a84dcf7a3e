use contract_core::config::Config;
use contract_core::contract::ContractDriver;
use contract_core::encoder::Value;
use contract_core::error::Error;
use contract_core::executor::{ExecutionResult, Executor, SandboxMode};
use contract_core::storage::memory::Memory;

const CURRENCY_SRC: &str = r#"
balances = Hash()

@construct
def seed():
    balances['stu'] = 1_000

@export
def transfer(amount, to):
    sender = ctx.signer
    balances[sender] -= amount
    balances[to] += amount
"#;

fn main() {
    println!("Hello, contract engine!");

    run().unwrap();

    println!("Bye~");
}

/// Deploys `currency` through the `submission` system contract (running
/// its `@construct` as part of the deploy, same as `contract-cli deploy`),
/// then calls `transfer` through the metered executor.
///
/// Genesis deploy runs unmetered: the very first `currency` submission
/// can't yet be charged against a `currency` balance that doesn't exist.
/// Every call after genesis goes through the metered executor.
fn run() -> Result<(), Error> {
    let config = Config::default();
    let mut driver = ContractDriver::new(Memory::new(), config);
    let genesis = Executor::new(SandboxMode::Inline, false);
    let executor = Executor::default();

    let deploy_kwargs = vec![
        ("name".to_string(), Value::Str("currency".to_string())),
        ("code".to_string(), Value::Str(CURRENCY_SRC.to_string())),
    ];
    let deployed = genesis.execute(&mut driver, "stu", "submission", "submit_contract", deploy_kwargs, None, true, &[])?;
    match deployed.result {
        ExecutionResult::Success(_) => {}
        ExecutionResult::Failure(e) => panic!("deploy should have succeeded: {e}"),
    }

    // `seed` ran once at deploy time.
    assert_eq!(driver.hget("currency", "balances", "stu")?, Some(Value::Int(1_000)));

    let transfer_kwargs = vec![
        ("amount".to_string(), Value::Int(100)),
        ("to".to_string(), Value::Str("colin".to_string())),
    ];
    let outcome = executor.execute(&mut driver, "stu", "currency", "transfer", transfer_kwargs, Some(1_000_000), true, &[])?;

    match outcome.result {
        ExecutionResult::Success(_) => {
            println!("transfer settled, {} stamps used", outcome.stamps_used);
        }
        ExecutionResult::Failure(e) => panic!("transfer should have succeeded: {e}"),
    }

    let stu_balance = driver.hget("currency", "balances", "stu")?;
    let colin_balance = driver.hget("currency", "balances", "colin")?;
    println!("stu: {stu_balance:?}, colin: {colin_balance:?}");
    assert_eq!(colin_balance, Some(Value::Int(100)));

    Ok(())
}
