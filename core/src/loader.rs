//! Module loader: the restricted environment an `import <contract>`
//! (or a top-level call from the executor) runs inside (spec.md §4.6).
//!
//! Owns the bounded call stack (`ctx.signer`/`ctx.caller`/`ctx.this`),
//! recompiles every imported contract from source on each load (the
//! stored `__compiled__` image is never trusted without a fresh lint —
//! see spec.md §9's open question on compiled-image persistence), and
//! tree-walks the lowered `CompiledFunction` body, charging the tracer
//! per AST node dispatched in addition to `CacheDriver`'s byte-cost hook.

use std::collections::HashMap;

use sha2::{Digest, Sha256};
use sha3::Sha3_256;

use crate::ast::{BinOp, BoolOp, CmpOp, CompiledFunction, CompiledModule, Expr, Literal, Stmt, UnaryOp};
use crate::config::Config;
use crate::contract::metadata::ContractType;
use crate::contract::ContractDriver;
use crate::encoder::Value;
use crate::error::{CResult, Error};
use crate::orm::OrmObject;
use crate::sanitizer;
use crate::storage::engine::Engine;

/// Reserved name of the system contract spec.md §6 exposes for submitting
/// new user contracts. Never backed by a stored source string; calls to
/// it are intercepted in `invoke` before any contract lookup happens.
pub const SUBMISSION_CONTRACT: &str = "submission";

/// spec.md §4.6's per-call `ctx` record.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub signer: String,
    pub caller: String,
    pub this: String,
}

/// A runtime value: either a concrete stored `Value`, a bound ORM
/// handle, or a reference to another contract's exported functions
/// (bound by `import`).
#[derive(Debug, Clone, PartialEq)]
pub enum RtValue {
    Value(Value),
    Orm(OrmObject),
    Module(String),
}

impl RtValue {
    fn into_value(self) -> CResult<Value> {
        match self {
            RtValue::Value(v) => Ok(v),
            RtValue::Orm(_) => Err(Error::Internal("cannot use a state handle as a value".to_string())),
            RtValue::Module(name) => {
                Err(Error::Internal(format!("cannot use imported contract `{name}` as a value")))
            }
        }
    }
}

type Scope = HashMap<String, RtValue>;

enum Flow {
    Next,
    Return(RtValue),
}

/// Runs contract calls against a `ContractDriver`, enforcing the call
/// stack's recursion limit and import-cycle rejection. One `Loader` is
/// created per top-level `Executor::execute` dispatch.
pub struct Loader<'d, E: Engine> {
    driver: &'d mut ContractDriver<E>,
    config: Config,
    call_stack: Vec<String>,
    stamp_budget: u64,
}

impl<'d, E: Engine> Loader<'d, E> {
    pub fn new(driver: &'d mut ContractDriver<E>, config: Config) -> Self {
        Loader { driver, config, call_stack: Vec::new(), stamp_budget: u64::MAX }
    }

    pub fn with_stamp_budget(mut self, budget: u64) -> Self {
        self.stamp_budget = budget;
        self
    }

    /// Top-level entry point: `signer` becomes the bottom of the call
    /// stack for the whole dispatch.
    pub fn call(
        &mut self,
        signer: &str,
        contract: &str,
        function: &str,
        kwargs: Vec<(String, Value)>,
    ) -> CResult<Value> {
        self.call_stack.clear();
        self.call_stack.push(signer.to_string());
        let result = self.invoke(contract, function, kwargs);
        self.call_stack.truncate(1);
        result.and_then(RtValue::into_value)
    }

    /// Runs `name`'s constructor, if it has one, once at submission time.
    /// No-op if the module declares no `@construct`-decorated function.
    pub fn install(&mut self, signer: &str, contract: &str) -> CResult<()> {
        let module = self.compile_module(contract)?;
        if let Some(ctor) = module.constructor.clone() {
            self.call_stack.clear();
            self.call_stack.push(signer.to_string());
            self.invoke_compiled(contract, &module, &ctor, Vec::new())?;
            self.call_stack.truncate(1);
        }
        Ok(())
    }

    fn compile_module(&mut self, contract: &str) -> CResult<CompiledModule> {
        let source = self
            .driver
            .get_contract(contract)?
            .ok_or_else(|| Error::ContractNotFound(contract.to_string()))?;
        let source = String::from_utf8(source).map_err(|e| Error::EncoderError(e.to_string()))?;
        let config = self.config.clone();
        sanitizer::compile(&source, &config, contract, self.driver)
    }

    fn invoke(&mut self, contract: &str, function: &str, kwargs: Vec<(String, Value)>) -> CResult<RtValue> {
        if contract == SUBMISSION_CONTRACT {
            return self.invoke_submission(function, kwargs);
        }
        let module = self.compile_module(contract)?;
        self.invoke_compiled(contract, &module, function, kwargs)
    }

    /// The `submission` system contract's only export (spec.md §6):
    /// compiles and lints `code` under `name`, then stores it via
    /// `ContractDriver::set_contract` and runs its constructor, if any.
    /// Lint failures never reach `set_contract`, so a rejected submission
    /// leaves no partial write behind.
    fn invoke_submission(&mut self, function: &str, kwargs: Vec<(String, Value)>) -> CResult<RtValue> {
        if function != "submit_contract" {
            return Err(Error::Internal(format!("{SUBMISSION_CONTRACT}.{function} is not callable")));
        }
        let mut kwargs: HashMap<String, Value> = kwargs.into_iter().collect();
        let name = match kwargs.remove("name") {
            Some(Value::Str(s)) => s,
            _ => return Err(Error::Internal("submit_contract requires a string `name`".to_string())),
        };
        let code = match kwargs.remove("code") {
            Some(Value::Str(s)) => s.into_bytes(),
            Some(Value::Bytes(b)) => b,
            _ => return Err(Error::Internal("submit_contract requires a string or bytes `code`".to_string())),
        };
        let author = self.call_stack.first().cloned().unwrap_or_default();
        let source = String::from_utf8(code.clone()).map_err(|e| Error::EncoderError(e.to_string()))?;
        let config = self.config.clone();
        let compiled = sanitizer::compile(&source, &config, &name, self.driver)?;
        let bytes = sanitizer::serialize(&compiled)?;
        self.driver.set_contract(&name, &code, &author, ContractType::User, bytes, false)?;
        self.install(&author, &name)?;
        Ok(RtValue::Value(Value::Null))
    }

    fn invoke_compiled(
        &mut self,
        contract: &str,
        module: &CompiledModule,
        function: &str,
        kwargs: Vec<(String, Value)>,
    ) -> CResult<RtValue> {
        if self.call_stack.len() >= self.config.recursion_limit {
            return Err(Error::RecursionLimit);
        }
        // index 0 is the signer, never a contract name; a cycle is the
        // target contract already present anywhere above it.
        if self.call_stack[1..].iter().any(|c| c == contract) {
            return Err(Error::ImportCycle(contract.to_string()));
        }

        let func = module
            .function(function)
            .filter(|f| f.exported || Some(f.name.as_str()) == module.constructor.as_deref())
            .ok_or_else(|| Error::Internal(format!("{contract}.{function} is not callable")))?;

        self.call_stack.push(contract.to_string());
        let result = self.run_function(contract, module, func, kwargs);
        self.call_stack.pop();
        result
    }

    fn ctx(&self, this: &str) -> CallContext {
        let signer = self.call_stack.first().cloned().unwrap_or_default();
        let caller = if self.call_stack.len() >= 2 {
            self.call_stack[self.call_stack.len() - 2].clone()
        } else {
            signer.clone()
        };
        CallContext { signer, caller, this: this.to_string() }
    }

    fn run_function(
        &mut self,
        contract: &str,
        module: &CompiledModule,
        func: &CompiledFunction,
        kwargs: Vec<(String, Value)>,
    ) -> CResult<RtValue> {
        let ctx = self.ctx(contract);
        let mut scope = self.module_scope(module)?;

        let mut kwargs: HashMap<String, Value> = kwargs.into_iter().collect();
        for param in &func.params {
            let value = kwargs
                .remove(&param.name)
                .ok_or_else(|| Error::Internal(format!("missing argument `{}`", param.name)))?;
            scope.insert(param.name.clone(), RtValue::Value(value));
        }

        self.driver.cache().new_tx();
        match self.exec_block(&func.body, &mut scope, &ctx, contract, module)? {
            Flow::Return(v) => Ok(v),
            Flow::Next => Ok(RtValue::Value(Value::Null)),
        }
    }

    /// Evaluates every top-level ORM declaration once, producing the
    /// name -> handle bindings every function body sees, plus a
    /// `Module` binding for each top-level `import`.
    fn module_scope(&mut self, module: &CompiledModule) -> CResult<Scope> {
        let mut scope = Scope::new();
        for name in &module.imports {
            scope.insert(name.clone(), RtValue::Module(name.clone()));
        }
        // globals reference only ORM constructor calls with literal
        // contract=/name= keywords (rewrite rule 3); no driver access
        // needed to evaluate them, so a throwaway ctx is fine.
        let ctx = CallContext { signer: String::new(), caller: String::new(), this: module.name.clone() };
        for (name, expr) in &module.globals {
            let value = self.eval(expr, &mut scope, &ctx, &module.name, module)?;
            scope.insert(name.clone(), value);
        }
        Ok(scope)
    }

    fn charge_instruction(&mut self) -> CResult<()> {
        let tracer = self.driver.cache().tracer();
        tracer.add_cost(self.config.instruction_cost);
        if tracer.is_running() && tracer.accumulated() > self.stamp_budget {
            return Err(Error::OutOfStamps);
        }
        Ok(())
    }

    fn exec_block(
        &mut self,
        stmts: &[Stmt],
        scope: &mut Scope,
        ctx: &CallContext,
        contract: &str,
        module: &CompiledModule,
    ) -> CResult<Flow> {
        for stmt in stmts {
            match self.exec_stmt(stmt, scope, ctx, contract, module)? {
                Flow::Next => {}
                ret @ Flow::Return(_) => return Ok(ret),
            }
        }
        Ok(Flow::Next)
    }

    fn exec_stmt(
        &mut self,
        stmt: &Stmt,
        scope: &mut Scope,
        ctx: &CallContext,
        contract: &str,
        module: &CompiledModule,
    ) -> CResult<Flow> {
        self.charge_instruction()?;
        match stmt {
            Stmt::Assign { targets, value } => {
                let v = self.eval(value, scope, ctx, contract, module)?;
                for target in targets {
                    self.assign(target, v.clone(), scope, ctx, contract, module)?;
                }
                Ok(Flow::Next)
            }
            Stmt::AugAssign { target, op, value } => {
                let current = self.eval(target, scope, ctx, contract, module)?;
                let rhs = self.eval(value, scope, ctx, contract, module)?;
                let result = apply_binop(*op, current.into_value()?, rhs.into_value()?, &self.config)?;
                self.assign(target, RtValue::Value(result), scope, ctx, contract, module)?;
                Ok(Flow::Next)
            }
            Stmt::Return(expr) => {
                let v = match expr {
                    Some(e) => self.eval(e, scope, ctx, contract, module)?,
                    None => RtValue::Value(Value::Null),
                };
                Ok(Flow::Return(v))
            }
            Stmt::Pass => Ok(Flow::Next),
            Stmt::Assert { test, msg } => {
                let v = self.eval(test, scope, ctx, contract, module)?;
                if !truthy(&v) {
                    let message = match msg {
                        Some(m) => display_rt(&self.eval(m, scope, ctx, contract, module)?),
                        None => "assertion failed".to_string(),
                    };
                    return Err(Error::RevertRequested(message));
                }
                Ok(Flow::Next)
            }
            Stmt::If { test, body, orelse } => {
                if truthy(&self.eval(test, scope, ctx, contract, module)?) {
                    self.exec_block(body, scope, ctx, contract, module)
                } else {
                    self.exec_block(orelse, scope, ctx, contract, module)
                }
            }
            Stmt::For { target, iter, body, orelse } => {
                let iterable = self.eval(iter, scope, ctx, contract, module)?.into_value()?;
                for item in iterate(&iterable)? {
                    self.assign(target, RtValue::Value(item), scope, ctx, contract, module)?;
                    match self.exec_block(body, scope, ctx, contract, module)? {
                        Flow::Next => {}
                        ret @ Flow::Return(_) => return Ok(ret),
                    }
                }
                self.exec_block(orelse, scope, ctx, contract, module)
            }
            Stmt::While { test, body, orelse } => {
                while truthy(&self.eval(test, scope, ctx, contract, module)?) {
                    match self.exec_block(body, scope, ctx, contract, module)? {
                        Flow::Next => {}
                        ret @ Flow::Return(_) => return Ok(ret),
                    }
                }
                self.exec_block(orelse, scope, ctx, contract, module)
            }
            Stmt::Expr(e) => {
                self.eval(e, scope, ctx, contract, module)?;
                Ok(Flow::Next)
            }
        }
    }

    fn assign(
        &mut self,
        target: &Expr,
        value: RtValue,
        scope: &mut Scope,
        ctx: &CallContext,
        contract: &str,
        module: &CompiledModule,
    ) -> CResult<()> {
        match target {
            Expr::Name(n) => {
                scope.insert(n.clone(), value);
                Ok(())
            }
            Expr::Subscript { value: base, index } => {
                let handle = self.eval(base, scope, ctx, contract, module)?;
                let subkey = display_value(&self.eval(index, scope, ctx, contract, module)?.into_value()?);
                match handle {
                    RtValue::Orm(orm) => orm.set(self.driver.cache(), &self.config, Some(&subkey), value.into_value()?),
                    other => Err(Error::Internal(format!("cannot subscript-assign into {other:?}"))),
                }
            }
            other => Err(Error::Internal(format!("unsupported assignment target: {other:?}"))),
        }
    }

    fn eval(
        &mut self,
        expr: &Expr,
        scope: &mut Scope,
        ctx: &CallContext,
        contract: &str,
        module: &CompiledModule,
    ) -> CResult<RtValue> {
        self.charge_instruction()?;
        match expr {
            Expr::Constant(lit) => Ok(RtValue::Value(literal_to_value(lit))),
            Expr::Name(n) if n == "ctx" => {
                Err(Error::Internal("`ctx` must be used as ctx.signer/ctx.caller/ctx.this".to_string()))
            }
            Expr::Name(n) => scope
                .get(n)
                .cloned()
                .ok_or_else(|| Error::Internal(format!("undefined name: {n}"))),
            Expr::Attribute { value, attr } => {
                if let Expr::Name(n) = value.as_ref() {
                    if n == "ctx" {
                        let field = match attr.as_str() {
                            "signer" => ctx.signer.clone(),
                            "caller" => ctx.caller.clone(),
                            "this" => ctx.this.clone(),
                            other => return Err(Error::Internal(format!("unknown ctx field: {other}"))),
                        };
                        return Ok(RtValue::Value(Value::Str(field)));
                    }
                }
                // Bare attribute reads otherwise only make sense as the
                // callee of a Call (`.get`/`.set`), handled there.
                Err(Error::Internal(format!("unsupported attribute access: .{attr}")))
            }
            Expr::Subscript { value, index } => {
                let base = self.eval(value, scope, ctx, contract, module)?;
                let idx = self.eval(index, scope, ctx, contract, module)?.into_value()?;
                match base {
                    RtValue::Orm(orm) => {
                        let subkey = display_value(&idx);
                        Ok(RtValue::Value(orm.get(self.driver.cache(), &self.config, Some(&subkey))?.unwrap_or(Value::Null)))
                    }
                    RtValue::Value(v) => Ok(RtValue::Value(subscript_value(&v, &idx)?)),
                    RtValue::Module(name) => Err(Error::Internal(format!("cannot subscript module `{name}`"))),
                }
            }
            Expr::Slice { .. } => Err(Error::Internal("slice expressions are not evaluable standalone".to_string())),
            Expr::List(items) => Ok(RtValue::Value(Value::List(
                items
                    .iter()
                    .map(|e| self.eval(e, scope, ctx, contract, module).and_then(RtValue::into_value))
                    .collect::<CResult<_>>()?,
            ))),
            Expr::Tuple(items) => Ok(RtValue::Value(Value::List(
                items
                    .iter()
                    .map(|e| self.eval(e, scope, ctx, contract, module).and_then(RtValue::into_value))
                    .collect::<CResult<_>>()?,
            ))),
            Expr::SetLit(items) => Ok(RtValue::Value(Value::List(
                items
                    .iter()
                    .map(|e| self.eval(e, scope, ctx, contract, module).and_then(RtValue::into_value))
                    .collect::<CResult<_>>()?,
            ))),
            Expr::Dict(entries) => {
                let mut map = Vec::with_capacity(entries.len());
                for (k, v) in entries {
                    let key = display_value(&self.eval(k, scope, ctx, contract, module)?.into_value()?);
                    let value = self.eval(v, scope, ctx, contract, module)?.into_value()?;
                    map.push((key, value));
                }
                Ok(RtValue::Value(Value::Map(map)))
            }
            Expr::ListComp { element, target, iter, ifs } => {
                let iterable = self.eval(iter, scope, ctx, contract, module)?.into_value()?;
                let mut out = Vec::new();
                for item in iterate(&iterable)? {
                    self.assign(target, RtValue::Value(item), scope, ctx, contract, module)?;
                    let mut keep = true;
                    for cond in ifs {
                        if !truthy(&self.eval(cond, scope, ctx, contract, module)?) {
                            keep = false;
                            break;
                        }
                    }
                    if keep {
                        out.push(self.eval(element, scope, ctx, contract, module)?.into_value()?);
                    }
                }
                Ok(RtValue::Value(Value::List(out)))
            }
            Expr::BoolOp { op, values } => {
                let mut result = match op {
                    BoolOp::And => true,
                    BoolOp::Or => false,
                };
                let mut last = RtValue::Value(Value::Bool(result));
                for v in values {
                    last = self.eval(v, scope, ctx, contract, module)?;
                    result = truthy(&last);
                    match op {
                        BoolOp::And if !result => break,
                        BoolOp::Or if result => break,
                        _ => {}
                    }
                }
                Ok(last)
            }
            Expr::BinOp { left, op, right } => {
                let l = self.eval(left, scope, ctx, contract, module)?.into_value()?;
                let r = self.eval(right, scope, ctx, contract, module)?.into_value()?;
                Ok(RtValue::Value(apply_binop(*op, l, r, &self.config)?))
            }
            Expr::UnaryOp { op, operand } => {
                let v = self.eval(operand, scope, ctx, contract, module)?.into_value()?;
                Ok(RtValue::Value(apply_unaryop(*op, v, &self.config)?))
            }
            Expr::Compare { left, ops, comparators } => {
                let mut current = self.eval(left, scope, ctx, contract, module)?.into_value()?;
                let mut result = true;
                for (op, comp_expr) in ops.iter().zip(comparators.iter()) {
                    let next = self.eval(comp_expr, scope, ctx, contract, module)?.into_value()?;
                    if !apply_cmpop(*op, &current, &next)? {
                        result = false;
                        break;
                    }
                    current = next;
                }
                Ok(RtValue::Value(Value::Bool(result)))
            }
            Expr::Call { func, args, keywords } => self.eval_call(func, args, keywords, scope, ctx, contract, module),
            Expr::Starred(e) => self.eval(e, scope, ctx, contract, module),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn eval_call(
        &mut self,
        func: &Expr,
        args: &[Expr],
        keywords: &[(Option<String>, Expr)],
        scope: &mut Scope,
        ctx: &CallContext,
        contract: &str,
        module: &CompiledModule,
    ) -> CResult<RtValue> {
        // ORM constructor calls only ever appear inside `module_scope`'s
        // global evaluation pass, never as a normal runtime call.
        if let Expr::Name(n) = func {
            if sanitizer::lint::ORM_CONSTRUCTORS.contains(&n.as_str()) {
                return self.construct_orm(n, keywords, scope, ctx, contract, module);
            }
            if let Some(result) = self.try_builtin(n, args, scope, ctx, contract, module)? {
                return Ok(result);
            }
            // same-module call (private, mangled, or another exported fn).
            if let Some(target) = module.function(n).cloned() {
                let evaluated = self.eval_kwargs(args, keywords, &target, scope, ctx, contract, module)?;
                return self.run_function(contract, module, &target, evaluated);
            }
        }

        if let Expr::Attribute { value, attr } = func {
            let base = self.eval(value, scope, ctx, contract, module)?;
            match base {
                RtValue::Orm(orm) => return self.call_orm_method(&orm, attr, args, scope, ctx, contract, module),
                RtValue::Module(imported) => {
                    let imported_module = self.compile_module(&imported)?;
                    let target = imported_module
                        .function(attr)
                        .cloned()
                        .ok_or_else(|| Error::Internal(format!("{imported}.{attr} is not callable")))?;
                    let evaluated =
                        self.eval_kwargs(args, keywords, &target, scope, ctx, contract, module)?;
                    return self
                        .invoke_compiled(&imported, &imported_module, &target.name, evaluated)
                        .map(|r| r);
                }
                RtValue::Value(_) => {
                    return Err(Error::Internal(format!("`.{attr}` is not a callable method")))
                }
            }
        }

        Err(Error::Internal("call target is not callable".to_string()))
    }

    fn eval_kwargs(
        &mut self,
        args: &[Expr],
        keywords: &[(Option<String>, Expr)],
        target: &CompiledFunction,
        scope: &mut Scope,
        ctx: &CallContext,
        contract: &str,
        module: &CompiledModule,
    ) -> CResult<Vec<(String, Value)>> {
        let mut evaluated = Vec::with_capacity(args.len() + keywords.len());
        for (param, arg) in target.params.iter().zip(args.iter()) {
            evaluated.push((param.name.clone(), self.eval(arg, scope, ctx, contract, module)?.into_value()?));
        }
        for (name, expr) in keywords {
            let name = name.clone().ok_or_else(|| Error::Internal("starred keyword args are not supported".to_string()))?;
            evaluated.push((name, self.eval(expr, scope, ctx, contract, module)?.into_value()?));
        }
        Ok(evaluated)
    }

    fn construct_orm(
        &mut self,
        ctor: &str,
        keywords: &[(Option<String>, Expr)],
        scope: &mut Scope,
        ctx: &CallContext,
        contract: &str,
        module: &CompiledModule,
    ) -> CResult<RtValue> {
        let mut contract_kw = None;
        let mut name_kw = None;
        for (k, v) in keywords {
            let value = self.eval(v, scope, ctx, contract, module)?.into_value()?;
            match k.as_deref() {
                Some("contract") => contract_kw = Some(display_value(&value)),
                Some("name") => name_kw = Some(display_value(&value)),
                _ => {}
            }
        }
        let owner = contract_kw.ok_or_else(|| Error::Internal("state declaration missing contract=".to_string()))?;
        let name = name_kw.ok_or_else(|| Error::Internal("state declaration missing name=".to_string()))?;
        let orm = match ctor {
            "Variable" => OrmObject::variable(owner, name),
            "Hash" => OrmObject::hash(owner, name),
            "ForeignVariable" => OrmObject::foreign_variable(owner, name),
            "ForeignHash" => OrmObject::foreign_hash(owner, name),
            other => return Err(Error::Internal(format!("unknown ORM constructor: {other}"))),
        };
        Ok(RtValue::Orm(orm))
    }

    #[allow(clippy::too_many_arguments)]
    fn call_orm_method(
        &mut self,
        orm: &OrmObject,
        method: &str,
        args: &[Expr],
        scope: &mut Scope,
        ctx: &CallContext,
        contract: &str,
        module: &CompiledModule,
    ) -> CResult<RtValue> {
        let evaluated: Vec<Value> = args
            .iter()
            .map(|a| self.eval(a, scope, ctx, contract, module).and_then(RtValue::into_value))
            .collect::<CResult<_>>()?;
        match method {
            "get" => {
                let subkey = evaluated.first().map(display_value);
                let value = orm.get(self.driver.cache(), &self.config, subkey.as_deref())?;
                let default = evaluated.get(1).cloned();
                Ok(RtValue::Value(value.or(default).unwrap_or(Value::Null)))
            }
            "set" => {
                let (subkey, value) = match evaluated.len() {
                    1 => (None, evaluated[0].clone()),
                    2 => (Some(display_value(&evaluated[0])), evaluated[1].clone()),
                    _ => return Err(Error::Internal("set() takes 1 or 2 arguments".to_string())),
                };
                orm.set(self.driver.cache(), &self.config, subkey.as_deref(), value)?;
                Ok(RtValue::Value(Value::Null))
            }
            other => Err(Error::Internal(format!("unknown ORM method: {other}"))),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn try_builtin(
        &mut self,
        name: &str,
        args: &[Expr],
        scope: &mut Scope,
        ctx: &CallContext,
        contract: &str,
        module: &CompiledModule,
    ) -> CResult<Option<RtValue>> {
        match name {
            "sha256" | "sha3_256" => {
                let arg = args
                    .first()
                    .ok_or_else(|| Error::Internal(format!("{name}() takes exactly one argument")))?;
                let value = self.eval(arg, scope, ctx, contract, module)?.into_value()?;
                let bytes = match value {
                    Value::Bytes(b) => b,
                    Value::Str(s) => s.into_bytes(),
                    other => return Err(Error::Internal(format!("{name}() expects bytes/str, found {other:?}"))),
                };
                let hex = if name == "sha256" {
                    hex::encode(Sha256::digest(&bytes))
                } else {
                    hex::encode(Sha3_256::digest(&bytes))
                };
                Ok(Some(RtValue::Value(Value::Str(hex))))
            }
            _ => Ok(None),
        }
    }
}

fn literal_to_value(lit: &Literal) -> Value {
    match lit {
        Literal::Null => Value::Null,
        Literal::Bool(b) => Value::Bool(*b),
        Literal::Int(n) => Value::Int(*n),
        Literal::Decimal { scale, unscaled } => Value::Decimal { scale: *scale, unscaled: *unscaled },
        Literal::Str(s) => Value::Str(s.clone()),
        Literal::Bytes(b) => Value::Bytes(b.clone()),
    }
}

fn display_value(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Int(n) => n.to_string(),
        Value::Decimal { scale, unscaled } => format_decimal(*scale, *unscaled),
        Value::Str(s) => s.clone(),
        Value::Bytes(b) => hex::encode(b),
        Value::List(_) | Value::Map(_) => "<collection>".to_string(),
    }
}

fn display_rt(v: &RtValue) -> String {
    match v {
        RtValue::Value(v) => display_value(v),
        RtValue::Orm(_) => "<state handle>".to_string(),
        RtValue::Module(name) => format!("<module {name}>"),
    }
}

fn format_decimal(scale: u32, unscaled: i128) -> String {
    if scale == 0 {
        return unscaled.to_string();
    }
    let negative = unscaled < 0;
    let magnitude = unscaled.unsigned_abs();
    let digits = magnitude.to_string();
    let scale = scale as usize;
    let padded = if digits.len() <= scale { format!("{:0>width$}", digits, width = scale + 1) } else { digits };
    let split = padded.len() - scale;
    let mut out = String::new();
    if negative {
        out.push('-');
    }
    out.push_str(&padded[..split]);
    out.push('.');
    out.push_str(&padded[split..]);
    out
}

fn truthy(v: &RtValue) -> bool {
    match v {
        RtValue::Value(Value::Null) => false,
        RtValue::Value(Value::Bool(b)) => *b,
        RtValue::Value(Value::Int(n)) => *n != 0,
        RtValue::Value(Value::Decimal { unscaled, .. }) => *unscaled != 0,
        RtValue::Value(Value::Str(s)) => !s.is_empty(),
        RtValue::Value(Value::Bytes(b)) => !b.is_empty(),
        RtValue::Value(Value::List(l)) => !l.is_empty(),
        RtValue::Value(Value::Map(m)) => !m.is_empty(),
        RtValue::Orm(_) | RtValue::Module(_) => true,
    }
}

fn iterate(v: &Value) -> CResult<Vec<Value>> {
    match v {
        Value::List(items) => Ok(items.clone()),
        Value::Map(entries) => Ok(entries.iter().map(|(k, _)| Value::Str(k.clone())).collect()),
        Value::Str(s) => Ok(s.chars().map(|c| Value::Str(c.to_string())).collect()),
        other => Err(Error::Internal(format!("{other:?} is not iterable"))),
    }
}

fn subscript_value(base: &Value, index: &Value) -> CResult<Value> {
    match (base, index) {
        (Value::List(items), Value::Int(i)) => {
            let idx = normalize_index(*i, items.len())?;
            Ok(items[idx].clone())
        }
        (Value::Map(entries), idx) => {
            let key = display_value(idx);
            entries
                .iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.clone())
                .ok_or_else(|| Error::Internal(format!("key not found: {key}")))
        }
        (Value::Str(s), Value::Int(i)) => {
            let chars: Vec<char> = s.chars().collect();
            let idx = normalize_index(*i, chars.len())?;
            Ok(Value::Str(chars[idx].to_string()))
        }
        _ => Err(Error::Internal("unsupported subscript operands".to_string())),
    }
}

fn normalize_index(i: i128, len: usize) -> CResult<usize> {
    let idx = if i < 0 { i + len as i128 } else { i };
    if idx < 0 || idx as usize >= len {
        return Err(Error::Internal("index out of range".to_string()));
    }
    Ok(idx as usize)
}

/// `(scale, unscaled)` for any numeric `Value`, treating `Null` as zero.
pub(crate) fn numeric(v: &Value) -> CResult<(u32, i128)> {
    match v {
        Value::Int(n) => Ok((0, *n)),
        Value::Decimal { scale, unscaled } => Ok((*scale, *unscaled)),
        Value::Null => Ok((0, 0)),
        other => Err(Error::Internal(format!("expected a numeric value, found {other:?}"))),
    }
}

pub(crate) fn rescale(unscaled: i128, from: u32, to: u32) -> i128 {
    if to >= from {
        unscaled.saturating_mul(10i128.saturating_pow(to - from))
    } else {
        unscaled / 10i128.saturating_pow(from - to)
    }
}

/// Trims trailing mantissa zeros so the canonical encoding never carries
/// a redundant scale (spec.md §4.1: "no redundant trailing zeros").
pub(crate) fn canonical_decimal(mut scale: u32, mut unscaled: i128) -> Value {
    while scale > 0 && unscaled != 0 && unscaled % 10 == 0 {
        unscaled /= 10;
        scale -= 1;
    }
    if scale == 0 {
        Value::Int(unscaled)
    } else {
        Value::Decimal { scale, unscaled }
    }
}

fn apply_binop(op: BinOp, left: Value, right: Value, config: &Config) -> CResult<Value> {
    if let (Value::Str(a), Value::Str(b)) = (&left, &right) {
        if matches!(op, BinOp::Add) {
            return Ok(Value::Str(format!("{a}{b}")));
        }
    }
    let (sa, ua) = numeric(&left)?;
    let (sb, ub) = numeric(&right)?;
    let precision = config.decimal_precision;
    Ok(match op {
        BinOp::Add | BinOp::Sub => {
            let scale = sa.max(sb);
            let a = rescale(ua, sa, scale);
            let b = rescale(ub, sb, scale);
            canonical_decimal(scale, if op == BinOp::Add { a + b } else { a - b })
        }
        BinOp::Mul => {
            let scale = sa + sb;
            canonical_decimal(scale, ua.saturating_mul(ub))
        }
        BinOp::Div => {
            if ub == 0 {
                return Err(Error::Internal("division by zero".to_string()));
            }
            let scale = precision.max(sa).max(sb);
            let numerator =
                ua.saturating_mul(10i128.saturating_pow(scale + sb)).saturating_div(10i128.saturating_pow(sa));
            canonical_decimal(scale, numerator / ub)
        }
        BinOp::Mod => {
            if ub == 0 {
                return Err(Error::Internal("modulo by zero".to_string()));
            }
            let scale = sa.max(sb);
            let a = rescale(ua, sa, scale);
            let b = rescale(ub, sb, scale);
            canonical_decimal(scale, a % b)
        }
        BinOp::Pow => {
            let exp: u32 = ub.try_into().unwrap_or(0).clamp(0, 64);
            canonical_decimal(sa.saturating_mul(exp), ua.saturating_pow(exp))
        }
    })
}

fn apply_unaryop(op: UnaryOp, value: Value, _config: &Config) -> CResult<Value> {
    Ok(match op {
        UnaryOp::Not => Value::Bool(!truthy(&RtValue::Value(value))),
        UnaryOp::Pos => value,
        UnaryOp::Neg => {
            let (scale, unscaled) = numeric(&value)?;
            canonical_decimal(scale, -unscaled)
        }
    })
}

fn apply_cmpop(op: CmpOp, left: &Value, right: &Value) -> CResult<bool> {
    if matches!(op, CmpOp::In | CmpOp::NotIn) {
        let contains = match right {
            Value::List(items) => items.contains(left),
            Value::Map(entries) => {
                let key = display_value(left);
                entries.iter().any(|(k, _)| *k == key)
            }
            Value::Str(s) => matches!(left, Value::Str(needle) if s.contains(needle.as_str())),
            _ => return Err(Error::Internal("unsupported `in` operands".to_string())),
        };
        return Ok(if op == CmpOp::In { contains } else { !contains });
    }
    let ordering = match (numeric(left), numeric(right)) {
        (Ok((sa, ua)), Ok((sb, ub))) => {
            let scale = sa.max(sb);
            rescale(ua, sa, scale).cmp(&rescale(ub, sb, scale))
        }
        _ => left.partial_cmp_fallback(right)?,
    };
    Ok(match op {
        CmpOp::Eq => ordering == std::cmp::Ordering::Equal,
        CmpOp::NotEq => ordering != std::cmp::Ordering::Equal,
        CmpOp::Lt => ordering == std::cmp::Ordering::Less,
        CmpOp::LtE => ordering != std::cmp::Ordering::Greater,
        CmpOp::Gt => ordering == std::cmp::Ordering::Greater,
        CmpOp::GtE => ordering != std::cmp::Ordering::Less,
        CmpOp::In | CmpOp::NotIn => unreachable!("handled above"),
    })
}

trait FallbackCompare {
    fn partial_cmp_fallback(&self, other: &Value) -> CResult<std::cmp::Ordering>;
}

impl FallbackCompare for Value {
    fn partial_cmp_fallback(&self, other: &Value) -> CResult<std::cmp::Ordering> {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => Ok(a.cmp(b)),
            (Value::Bytes(a), Value::Bytes(b)) => Ok(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Ok(a.cmp(b)),
            (a, b) if a == b => Ok(std::cmp::Ordering::Equal),
            _ => Err(Error::Internal("values are not comparable".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::contract::metadata::ContractType;
    use crate::storage::memory::Memory;

    fn submit(driver: &mut ContractDriver<Memory>, config: &Config, name: &str, source: &str, author: &str) {
        let module = sanitizer::compile(source, config, name, driver).unwrap();
        let compiled = sanitizer::serialize(&module).unwrap();
        driver
            .set_contract(name, source.as_bytes(), author, ContractType::User, compiled, false)
            .unwrap();
    }

    #[test]
    fn transfer_moves_balance_between_hash_entries() {
        let config = Config::default();
        let mut driver = ContractDriver::new(Memory::new(), config.clone());
        submit(
            &mut driver,
            &config,
            "currency",
            "balances = Hash()\n\
             @export\n\
             def transfer(amount, to):\n\
             \u{20}   sender_balance = balances[ctx.signer]\n\
             \u{20}   assert sender_balance >= amount, 'not enough balance'\n\
             \u{20}   balances[ctx.signer] = sender_balance - amount\n\
             \u{20}   balances[to] = balances[to] + amount\n",
            "alice",
        );
        driver.hset("currency", "balances", "stu", Value::Int(1000)).unwrap();
        driver.cache().commit().unwrap();

        let mut loader = Loader::new(&mut driver, config.clone());
        let kwargs = vec![
            ("amount".to_string(), Value::Int(100)),
            ("to".to_string(), Value::Str("colin".to_string())),
        ];
        loader.call("stu", "currency", "transfer", kwargs).unwrap();
        driver.cache().commit().unwrap();

        assert_eq!(driver.hget("currency", "balances", "stu").unwrap(), Some(Value::Int(900)));
        assert_eq!(driver.hget("currency", "balances", "colin").unwrap(), Some(Value::Int(100)));
    }

    #[test]
    fn assert_failure_surfaces_as_revert_requested() {
        let config = Config::default();
        let mut driver = ContractDriver::new(Memory::new(), config.clone());
        submit(
            &mut driver,
            &config,
            "currency",
            "balances = Hash()\n\
             @export\n\
             def transfer(amount, to):\n\
             \u{20}   sender_balance = balances[ctx.signer]\n\
             \u{20}   assert sender_balance >= amount, 'not enough balance'\n\
             \u{20}   balances[ctx.signer] = sender_balance - amount\n\
             \u{20}   balances[to] = balances[to] + amount\n",
            "alice",
        );
        driver.cache().commit().unwrap();

        let mut loader = Loader::new(&mut driver, config.clone());
        let kwargs = vec![
            ("amount".to_string(), Value::Int(100)),
            ("to".to_string(), Value::Str("colin".to_string())),
        ];
        let err = loader.call("stu", "currency", "transfer", kwargs);
        assert!(matches!(err, Err(Error::RevertRequested(_))));
    }

    #[test]
    fn import_cycle_is_rejected() {
        let config = Config::default();
        let mut driver = ContractDriver::new(Memory::new(), config.clone());
        submit(&mut driver, &config, "a", "import b\n@export\ndef f():\n    return b.g()\n", "alice");
        submit(&mut driver, &config, "b", "import a\n@export\ndef g():\n    return a.f()\n", "alice");
        driver.cache().commit().unwrap();

        let mut loader = Loader::new(&mut driver, config.clone());
        let err = loader.call("stu", "a", "f", vec![]);
        assert!(matches!(err, Err(Error::ImportCycle(_))));
    }

    #[test]
    fn decimal_formatting_is_canonical() {
        assert_eq!(format_decimal(2, 150), "1.50");
        assert_eq!(canonical_decimal(2, 150), Value::Decimal { scale: 1, unscaled: 15 });
        assert_eq!(canonical_decimal(2, 100), Value::Int(1));
    }
}
