use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::Subcommand;
use log::info;

use contract_core::contract::ContractDriver;
use contract_core::encoder::Value;
use contract_core::encoding::{Base64Codec, DataCodec, EncodingFormat, HexCodec, JsonCodec};
use contract_core::executor::Executor;
use contract_core::storage::memory::Memory;

/// The various kinds of commands the CLI can execute, one-shot via
/// `--query`/a positional subcommand or line-by-line in the REPL.
#[derive(Debug, Clone, PartialEq, Subcommand)]
pub enum Command {
    /// Submits `path`'s source as a contract named `name`, running the
    /// sanitizer and, if present, its `@construct` function.
    Deploy { name: String, path: PathBuf },

    /// Dispatches an exported call through the metered executor.
    Call {
        contract: String,
        function: String,
        /// `key=value` pairs; a value that parses as an integer is
        /// stored as one, otherwise it's stored as a string.
        #[clap(value_name = "KEY=VALUE")]
        kwargs: Vec<String>,
        #[clap(long)]
        stamps: Option<u64>,
    },

    /// Reads a plain `<contract>.<field>` value. A byte-string value
    /// renders through `--encode` (default `hex`).
    Get {
        contract: String,
        field: String,
        #[clap(long, default_value = "hex")]
        encode: String,
    },

    /// Reads a `<contract>.<field>:<subkey>` hash value. A byte-string
    /// value renders through `--encode` (default `hex`).
    HGet {
        contract: String,
        field: String,
        subkey: String,
        #[clap(long, default_value = "hex")]
        encode: String,
    },

    /// Shorthand for `hget <currency_contract> <balances_hash> <who>`.
    Balance { who: String },

    Exit,
}

/// Parses one REPL/piped-input line into a `Command`. Whitespace
/// separated, no quoting support — kwargs and paths with spaces aren't
/// representable here, matching the terse line grammar the teacher's
/// REPL used for its own `SET`/`GET`/`DEL` commands.
pub fn parse_line(line: &str) -> Result<Command> {
    let mut words = line.split_whitespace();
    let verb = words.next().ok_or_else(|| anyhow!("empty command"))?.to_lowercase();
    let rest: Vec<String> = words.map(str::to_string).collect();

    match verb.as_str() {
        "deploy" => {
            let [name, path] = take2(&rest, "deploy <name> <path>")?;
            Ok(Command::Deploy { name, path: PathBuf::from(path) })
        }
        "call" => {
            if rest.len() < 2 {
                return Err(anyhow!("usage: call <contract> <function> [key=value ...] [--stamps N]"));
            }
            let contract = rest[0].clone();
            let function = rest[1].clone();
            let mut kwargs = Vec::new();
            let mut stamps = None;
            let mut i = 2;
            while i < rest.len() {
                if rest[i] == "--stamps" {
                    i += 1;
                    stamps = rest.get(i).and_then(|s| s.parse().ok());
                } else {
                    kwargs.push(rest[i].clone());
                }
                i += 1;
            }
            Ok(Command::Call { contract, function, kwargs, stamps })
        }
        "get" => {
            let (positional, encode) = split_encode_flag(&rest);
            let [contract, field] = take2(&positional, "get <contract> <field> [--encode hex|base64|json]")?;
            Ok(Command::Get { contract, field, encode })
        }
        "hget" => {
            let (positional, encode) = split_encode_flag(&rest);
            let [contract, field, subkey] =
                take3(&positional, "hget <contract> <field> <subkey> [--encode hex|base64|json]")?;
            Ok(Command::HGet { contract, field, subkey, encode })
        }
        "balance" => {
            let [who] = take1(&rest, "balance <who>")?;
            Ok(Command::Balance { who })
        }
        "exit" | "quit" => Ok(Command::Exit),
        other => Err(anyhow!("unknown command `{other}`")),
    }
}

/// Pulls a trailing `--encode <format>` pair out of a line's words,
/// returning the remaining positional words and the chosen format
/// (`hex` if none was given).
fn split_encode_flag(rest: &[String]) -> (Vec<String>, String) {
    let mut positional = Vec::with_capacity(rest.len());
    let mut encode = "hex".to_string();
    let mut i = 0;
    while i < rest.len() {
        if rest[i] == "--encode" {
            i += 1;
            if let Some(v) = rest.get(i) {
                encode = v.clone();
            }
        } else {
            positional.push(rest[i].clone());
        }
        i += 1;
    }
    (positional, encode)
}

fn take1(rest: &[String], usage: &str) -> Result<[String; 1]> {
    match rest {
        [a] => Ok([a.clone()]),
        _ => Err(anyhow!("usage: {usage}")),
    }
}

fn take2(rest: &[String], usage: &str) -> Result<[String; 2]> {
    match rest {
        [a, b] => Ok([a.clone(), b.clone()]),
        _ => Err(anyhow!("usage: {usage}")),
    }
}

fn take3(rest: &[String], usage: &str) -> Result<[String; 3]> {
    match rest {
        [a, b, c] => Ok([a.clone(), b.clone(), c.clone()]),
        _ => Err(anyhow!("usage: {usage}")),
    }
}

fn parse_kwargs(raw: &[String]) -> Result<Vec<(String, Value)>> {
    raw.iter()
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("expected `key=value`, got `{pair}`"))?;
            let value = match value.parse::<i128>() {
                Ok(n) => Value::Int(n),
                Err(_) => Value::Str(value.to_string()),
            };
            Ok((key.to_string(), value))
        })
        .collect()
}

/// Resolves a `--encode` flag value to the codec used to render
/// `Value::Bytes`. Falls back to hex on an unrecognized name rather than
/// failing a read over a display nicety.
fn codec_for(encode: &str) -> Box<dyn DataCodec> {
    match encode.parse::<EncodingFormat>() {
        Ok(EncodingFormat::Base64) => Box::new(Base64Codec::new()),
        Ok(EncodingFormat::Json) => Box::new(JsonCodec::new()),
        Ok(EncodingFormat::Hex) | Err(_) => Box::new(HexCodec::new()),
    }
}

fn display_value(value: &Value, codec: &dyn DataCodec) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Int(n) => n.to_string(),
        Value::Decimal { scale, unscaled } => format!("{unscaled}e-{scale}"),
        Value::Str(s) => s.clone(),
        Value::Bytes(b) => codec.encode(b).unwrap_or_else(|e| format!("<undisplayable: {e}>")),
        Value::List(items) => {
            format!("[{}]", items.iter().map(|v| display_value(v, codec)).collect::<Vec<_>>().join(", "))
        }
        Value::Map(entries) => format!(
            "{{{}}}",
            entries
                .iter()
                .map(|(k, v)| format!("{k}: {}", display_value(v, codec)))
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

/// Runs one command against a driver, returning its printable result.
/// Shared by the one-shot `--query` path and the REPL so both commands
/// observe identical semantics.
pub fn run(
    command: &Command,
    driver: &mut ContractDriver<Memory>,
    executor: &Executor,
    sender: &str,
) -> Result<Option<String>> {
    match command {
        Command::Deploy { name, path } => {
            info!("deploying {name} from {}", path.display());
            let source = std::fs::read_to_string(path)?;
            let kwargs = vec![("name".to_string(), Value::Str(name.clone())), ("code".to_string(), Value::Str(source))];
            let outcome = executor.execute(driver, sender, "submission", "submit_contract", kwargs, None, true, &[])?;
            match outcome.result {
                contract_core::executor::ExecutionResult::Success(_) => {
                    Ok(Some(format!("deployed {name} ({} stamps)", outcome.stamps_used)))
                }
                contract_core::executor::ExecutionResult::Failure(e) => Err(anyhow!(e)),
            }
        }
        Command::Call { contract, function, kwargs, stamps } => {
            let kwargs = parse_kwargs(kwargs)?;
            let outcome = executor.execute(driver, sender, contract, function, kwargs, *stamps, true, &[])?;
            let codec = codec_for("hex");
            match outcome.result {
                contract_core::executor::ExecutionResult::Success(v) => {
                    Ok(Some(format!("{} ({} stamps)", display_value(&v, codec.as_ref()), outcome.stamps_used)))
                }
                contract_core::executor::ExecutionResult::Failure(e) => Err(anyhow!(e)),
            }
        }
        Command::Get { contract, field, encode } => {
            let value = driver.get(contract, field)?;
            let codec = codec_for(encode);
            Ok(Some(value.as_ref().map(|v| display_value(v, codec.as_ref())).unwrap_or_else(|| "null".to_string())))
        }
        Command::HGet { contract, field, subkey, encode } => {
            let value = driver.hget(contract, field, subkey)?;
            let codec = codec_for(encode);
            Ok(Some(value.as_ref().map(|v| display_value(v, codec.as_ref())).unwrap_or_else(|| "null".to_string())))
        }
        Command::Balance { who } => {
            let config = driver.config().clone();
            let value = driver.hget(&config.currency_contract, &config.balances_hash, who)?;
            let codec = codec_for("hex");
            Ok(Some(value.as_ref().map(|v| display_value(v, codec.as_ref())).unwrap_or_else(|| "0".to_string())))
        }
        Command::Exit => Ok(None),
    }
}
