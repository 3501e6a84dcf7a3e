//! Ties stage 1 (lint) and stage 2 (rewrite) together into the single
//! entry point the `submission` contract and the module loader both call.

use rustpython_parser::{ast, Parse};

use crate::ast::CompiledModule;
use crate::config::Config;
use crate::error::{CResult, Error};
use crate::sanitizer::lint::{ContractLookup, LintCode, Linter};
use crate::sanitizer::rewrite;

/// Parses `source`, runs the stage-1 lint, and on success runs the
/// stage-2 rewrite, returning the lowered `CompiledModule`. A non-empty
/// violation list never reaches rewrite; submission is refused wholesale.
pub fn compile<L: ContractLookup>(
    source: &str,
    config: &Config,
    module_name: &str,
    lookup: &mut L,
) -> CResult<CompiledModule> {
    let violations = lint(source, config, lookup)?;
    if !violations.is_empty() {
        return Err(Error::LintViolation(violations));
    }
    let suite = parse(source)?;
    rewrite::rewrite(&suite, config, module_name)
}

/// Stage 1 only, exposed separately so the module loader can lint-compile
/// an imported contract's source without re-deriving the violations list
/// shape used for submission rejection.
pub fn lint<L: ContractLookup>(source: &str, config: &Config, lookup: &mut L) -> CResult<Vec<LintCode>> {
    let suite = parse(source)?;
    let mut violations = Linter::new(config, lookup).lint(&suite);

    // S5: every top-level `import x` must name a contract present in the
    // store. Collected after the main walk so `Linter` can borrow
    // `lookup` mutably per import without the whole walk taking &mut.
    for stmt in &suite {
        if let ast::Stmt::Import(i) = stmt {
            for alias in &i.names {
                match lookup.contract_exists(alias.name.as_str()) {
                    Ok(true) => {}
                    Ok(false) | Err(_) => {
                        violations.push(LintCode::S5UnknownContract(alias.name.to_string()))
                    }
                }
            }
        }
    }
    Ok(violations)
}

fn parse(source: &str) -> CResult<Vec<ast::Stmt>> {
    ast::Suite::parse(source, "<contract>")
        .map_err(|e| Error::LintViolation(vec![LintCode::S1UnexpectedNode(e.to_string())]))
}

/// Serializes a `CompiledModule` the way `ContractDriver::set_contract`
/// stores it under `__compiled__`.
pub fn serialize(module: &CompiledModule) -> CResult<Vec<u8>> {
    Ok(bincode::serialize(module)?)
}

pub fn deserialize(bytes: &[u8]) -> CResult<CompiledModule> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sanitizer::lint::ContractLookup;

    struct Known(Vec<String>);
    impl ContractLookup for Known {
        fn contract_exists(&mut self, name: &str) -> CResult<bool> {
            Ok(self.0.iter().any(|n| n == name))
        }
    }

    #[test]
    fn dirty_source_refuses_wholesale() {
        let config = Config::default();
        let mut lookup = Known(vec![]);
        let result = compile("def helper():\n    pass\n", &config, "token", &mut lookup);
        assert!(matches!(result, Err(Error::LintViolation(_))));
    }

    #[test]
    fn compiling_twice_is_deterministic() {
        let config = Config::default();
        let src = "balances = Hash()\n@export\ndef transfer(amount, to):\n    return amount\n";
        let mut lookup = Known(vec![]);
        let first = compile(src, &config, "token", &mut lookup).unwrap();
        let mut lookup = Known(vec![]);
        let second = compile(src, &config, "token", &mut lookup).unwrap();
        assert_eq!(serialize(&first).unwrap(), serialize(&second).unwrap());
    }

    #[test]
    fn unknown_import_is_s5() {
        let config = Config::default();
        let mut lookup = Known(vec![]);
        let violations =
            lint("import currency\n@export\ndef f():\n    pass\n", &config, &mut lookup).unwrap();
        assert!(violations.iter().any(|v| matches!(v, LintCode::S5UnknownContract(_))));
    }

    #[test]
    fn known_import_lints_clean() {
        let config = Config::default();
        let mut lookup = Known(vec!["currency".to_string()]);
        let violations =
            lint("import currency\n@export\ndef f():\n    pass\n", &config, &mut lookup).unwrap();
        assert!(violations.is_empty(), "{violations:?}");
    }
}
