use std::io::{stdin, IsTerminal};
use std::{env, panic};

use anyhow::Result;
use clap::{CommandFactory, Parser};
use log::info;

use contract_cli::command::Command;
use contract_cli::config::ConfigLoad;
use contract_cli::session::Session;
use contract_cli::trace;
use contract_core::storage::memory::Memory;

#[derive(Debug, Parser, PartialEq)]
#[command(version)]
#[command(author, about, disable_help_flag = true)]
pub struct Args {
    #[clap(short, long, help = "debug mode")]
    debug: bool,

    #[clap(long, help = "Print help information")]
    help: bool,

    /// Configuration file path, default 'config/contract-cli.toml'
    #[clap(short = 'c', long = "config", help = "Configuration file path", default_value = "config/contract-cli.toml")]
    config: String,

    /// The subcommand to run, one-shot.
    #[clap(subcommand)]
    cmd: Option<Command>,

    #[clap(short = 'l', long, default_value = "info")]
    log_level: String,

    #[clap(short = 'n', long, help = "Force non-interactive mode", default_value = "false")]
    non_interactive: bool,

    #[clap(long, require_equals = true, help = "Query to execute")]
    query: Option<String>,
}

#[tokio::main]
pub async fn main() -> Result<()> {
    // Re-exec of this binary for the isolated sandbox, spawned by
    // `contract_core::executor::dispatch_isolated`. Never reaches the
    // rest of `main` — it speaks the wire protocol over stdio and exits.
    if contract_core::executor::is_sandbox_worker_invocation() {
        return contract_core::executor::run_sandbox_worker::<Memory>().map_err(Into::into);
    }

    setup_panic_hooks();

    let args = Args::parse();
    if args.debug {
        println!("{:?}", args);
    }

    let log_dir = format!("{}/.contract-cli", env::var("HOME").unwrap_or_else(|_| ".".to_string()));
    let _guards = trace::init_logging(&log_dir, &args.log_level).await?;
    info!("contract-cli start args: {:?}", &args);

    let mut cmd = Args::command();
    if args.help {
        cmd.print_help()?;
        return Ok(());
    }

    let mut cfg = ConfigLoad::load(&args.config).unwrap_or_default();
    if args.debug {
        println!("{:?}", &cfg);
    }
    info!("contract-cli start config: {:?}", &cfg);

    let is_terminal = stdin().is_terminal();
    let is_repl = is_terminal && !args.non_interactive && args.query.is_none() && args.cmd.is_none();
    if is_repl {
        cfg.terminal_update();
    }

    let mut session = Session::try_new(cfg, is_repl)?;

    info!("contract-cli starting, is_repl={is_repl}");

    if is_repl {
        session.handle_repl();
        return Ok(());
    }

    if let Some(query) = args.query {
        session.handle_reader(std::io::Cursor::new(query))?;
        return Ok(());
    }

    if let Some(cmd) = args.cmd {
        if let Some(output) = session.run_command(&cmd)? {
            println!("{output}");
        }
        return Ok(());
    }

    session.handle_reader(stdin().lock())?;

    Ok(())
}

fn setup_panic_hooks() {
    let meta = human_panic::Metadata {
        version: env!("CARGO_PKG_VERSION").into(),
        name: env!("CARGO_PKG_NAME").into(),
        authors: env!("CARGO_PKG_AUTHORS").replace(':', ", ").into(),
        homepage: env!("CARGO_PKG_HOMEPAGE").into(),
    };

    let default_hook = panic::take_hook();

    if env::var("RUST_BACKTRACE").is_err() {
        panic::set_hook(Box::new(move |info: &panic::PanicInfo| {
            default_hook(info);

            let file_path = human_panic::handle_dump(&meta, info);
            human_panic::print_msg(file_path, &meta).expect("human-panic: printing error message to console failed");
        }));
    }
}
