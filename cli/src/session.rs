use std::io::BufRead;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use rustyline::config::Builder;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{CompletionType, Editor};

use contract_core::contract::ContractDriver;
use contract_core::executor::{Executor, SandboxMode};
use contract_core::storage::memory::Memory;

use crate::command::{self, Command};
use crate::config::ConfigLoad;
use crate::rusty::CliHelper;
use crate::show::Show;

const DEFAULT_SENDER: &str = "cli";

/// One interactive or piped-input run of the CLI against a single
/// in-memory driver. Owns the engine state for the process lifetime;
/// there is no persistence between invocations yet (spec.md's engine
/// is storage-agnostic, but the CLI only wires up `Memory`).
pub struct Session {
    is_repl: bool,
    settings: ConfigLoad,
    driver: ContractDriver<Memory>,
    executor: Executor,
    keywords: Arc<Vec<String>>,
}

impl Session {
    pub fn try_new(settings: ConfigLoad, is_repl: bool) -> Result<Self> {
        if is_repl {
            println!("Welcome to {}.", settings.prompt);
            println!();
        }

        let keywords = vec![
            "deploy".to_string(),
            "call".to_string(),
            "get".to_string(),
            "hget".to_string(),
            "balance".to_string(),
            "exit".to_string(),
        ];

        let driver = ContractDriver::new(Memory::default(), settings.engine.clone());
        let executor = Executor::new(SandboxMode::Inline, settings.metering);

        Ok(Self { is_repl, settings, driver, executor, keywords: Arc::new(keywords) })
    }

    fn prompt(&self) -> String {
        format!("{} > ", self.settings.prompt.trim_end())
    }

    pub fn handle_repl(&mut self) {
        let config = Builder::new()
            .completion_prompt_limit(5)
            .completion_type(CompletionType::Circular)
            .build();
        let mut rl = Editor::<CliHelper, DefaultHistory>::with_config(config).unwrap();

        rl.set_helper(Some(CliHelper::with_keywords(self.keywords.clone())));
        rl.load_history(&get_history_path()).ok();

        loop {
            match rl.readline(&self.prompt()) {
                Ok(line) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    let _ = rl.add_history_entry(&line);

                    match self.handle_line(&line) {
                        Ok(None) => break,
                        Ok(Some(_)) => {}
                        Err(e) => eprintln!("error: {e}"),
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("^C");
                }
                Err(ReadlineError::Eof) => break,
                Err(e) => {
                    eprintln!("io err: {e}");
                    break;
                }
            }
        }

        println!("Bye~");
        let _ = rl.save_history(&get_history_path());
    }

    pub fn handle_reader<R: BufRead>(&mut self, r: R) -> Result<()> {
        let start = Instant::now();

        for line in r.lines() {
            let line = line.map_err(|e| anyhow!("read line err: {e}"))?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match self.handle_line(line) {
                Ok(None) => break,
                Ok(Some(_)) => {}
                Err(e) => return Err(e),
            }
        }

        if self.settings.show_stats {
            println!("{:.3}", start.elapsed().as_secs_f64());
        }

        Ok(())
    }

    /// Returns `Ok(None)` on `exit`/`quit`, `Ok(Some(()))` after a
    /// normal command, `Err` on a parse or execution failure.
    fn handle_line(&mut self, line: &str) -> Result<Option<()>> {
        let command = command::parse_line(line)?;
        if command == Command::Exit {
            return Ok(None);
        }

        let show = Show::new(self.settings.show_stats, self.is_repl);
        let output = self.run_command(&command)?;
        if let Some(output) = output {
            println!("{output}");
        }
        show.output(0);
        Ok(Some(()))
    }

    /// Runs one already-parsed command, e.g. a `--query`/positional
    /// subcommand invocation that bypasses the REPL/reader entirely.
    pub fn run_command(&mut self, command: &Command) -> Result<Option<String>> {
        command::run(command, &mut self.driver, &self.executor, DEFAULT_SENDER)
    }
}

fn get_history_path() -> String {
    format!("{}/.contract_cli_history", std::env::var("HOME").unwrap_or_else(|_| ".".to_string()))
}
