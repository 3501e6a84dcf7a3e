use std::io::Cursor;

use contract_cli::command::{parse_line, Command};
use contract_cli::config::ConfigLoad;
use contract_cli::session::Session;

const CONTRACT_SRC: &str = r#"
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

fn deploy_currency(session: &mut Session, path: &std::path::Path) {
    let query = format!("deploy currency {}\n", path.display());
    session.handle_reader(Cursor::new(query)).unwrap();
}

#[test]
fn deploy_runs_construct_and_call_mutates_state() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("currency.con");
    std::fs::write(&path, CONTRACT_SRC).unwrap();

    let mut session = Session::try_new(ConfigLoad::default(), false).unwrap();
    deploy_currency(&mut session, &path);

    session.handle_reader(Cursor::new("hget currency balances stu")).unwrap();

    let query = "call currency transfer amount=100 to=colin\nhget currency balances colin\n";
    session.handle_reader(Cursor::new(query)).unwrap();
}

#[test]
fn get_on_missing_key_reads_null_without_erroring() {
    let mut session = Session::try_new(ConfigLoad::default(), false).unwrap();
    session.handle_reader(Cursor::new("hget nothere balances stu")).unwrap();
}

#[test]
fn unknown_command_is_an_error() {
    let mut session = Session::try_new(ConfigLoad::default(), false).unwrap();
    assert!(session.handle_reader(Cursor::new("frobnicate")).is_err());
}

#[test]
fn exit_stops_the_reader_without_running_later_lines() {
    let mut session = Session::try_new(ConfigLoad::default(), false).unwrap();
    // A bogus command after `exit` would error if it ran; it mustn't.
    session.handle_reader(Cursor::new("exit\nfrobnicate")).unwrap();
}

#[test]
fn parse_line_rejects_malformed_arity() {
    assert!(parse_line("get only_one_arg").is_err());
    assert!(parse_line("").is_err());
    assert_eq!(parse_line("exit").unwrap(), Command::Exit);
    assert_eq!(parse_line("quit").unwrap(), Command::Exit);
}
