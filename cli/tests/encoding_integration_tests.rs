use contract_cli::command::{parse_line, run};
use contract_core::config::Config;
use contract_core::contract::ContractDriver;
use contract_core::executor::{Executor, SandboxMode};
use contract_core::storage::memory::Memory;

const CONTRACT_SRC: &str = r#"
@export
def noop():
    pass
"#;

/// Unmetered: these tests exercise `--encode`, not the stamp protocol, and
/// the deploying sender has no currency balance to charge against.
fn unmetered_executor() -> Executor {
    Executor::new(SandboxMode::Inline, false)
}

fn deploy(driver: &mut ContractDriver<Memory>, executor: &Executor, path: &std::path::Path) {
    let cmd = parse_line(&format!("deploy noop {}", path.display())).unwrap();
    run(&cmd, driver, executor, "stu").unwrap();
}

/// A contract's stored source is a `Value::Bytes`, the one value kind
/// `get`/`hget` route through the `--encode` codec.
#[test]
fn get_renders_contract_source_through_each_codec() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("noop.con");
    std::fs::write(&path, CONTRACT_SRC).unwrap();

    let mut driver = ContractDriver::new(Memory::new(), Config::default());
    let executor = unmetered_executor();
    deploy(&mut driver, &executor, &path);

    let hex_cmd = parse_line("get noop __code__ --encode hex").unwrap();
    let hex_out = run(&hex_cmd, &mut driver, &executor, "stu").unwrap().unwrap();
    assert!(hex_out.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(hex::decode(&hex_out).unwrap(), CONTRACT_SRC.as_bytes());

    let b64_cmd = parse_line("get noop __code__ --encode base64").unwrap();
    let b64_out = run(&b64_cmd, &mut driver, &executor, "stu").unwrap().unwrap();
    assert_ne!(b64_out, hex_out);

    let json_cmd = parse_line("get noop __code__ --encode json").unwrap();
    let json_out = run(&json_cmd, &mut driver, &executor, "stu").unwrap().unwrap();
    let decoded: String = serde_json::from_str(&json_out).unwrap();
    assert_eq!(decoded.as_bytes(), CONTRACT_SRC.as_bytes());
}

#[test]
fn get_defaults_to_hex_without_a_flag() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("noop.con");
    std::fs::write(&path, CONTRACT_SRC).unwrap();

    let mut driver = ContractDriver::new(Memory::new(), Config::default());
    let executor = unmetered_executor();
    deploy(&mut driver, &executor, &path);

    let default_cmd = parse_line("get noop __code__").unwrap();
    let default_out = run(&default_cmd, &mut driver, &executor, "stu").unwrap().unwrap();

    let explicit_cmd = parse_line("get noop __code__ --encode hex").unwrap();
    let explicit_out = run(&explicit_cmd, &mut driver, &executor, "stu").unwrap().unwrap();

    assert_eq!(default_out, explicit_out);
}

#[test]
fn unrecognized_encode_format_falls_back_to_hex() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("noop.con");
    std::fs::write(&path, CONTRACT_SRC).unwrap();

    let mut driver = ContractDriver::new(Memory::new(), Config::default());
    let executor = unmetered_executor();
    deploy(&mut driver, &executor, &path);

    let weird_cmd = parse_line("get noop __code__ --encode not-a-real-format").unwrap();
    let weird_out = run(&weird_cmd, &mut driver, &executor, "stu").unwrap().unwrap();

    let hex_cmd = parse_line("get noop __code__ --encode hex").unwrap();
    let hex_out = run(&hex_cmd, &mut driver, &executor, "stu").unwrap().unwrap();

    assert_eq!(weird_out, hex_out);
}
