//! Stage 2 of the sanitizer: rewriting a clean-linted module into the
//! lowered, storable `CompiledModule` form (see `crate::ast`).
//!
//! Implements spec.md §4.5's four rewrite rules: private-method
//! name-mangling (and call-site rewriting), constructor renaming,
//! ORM-declaration binding (`contract=`/`name=` injection), and numeric
//! literal wrapping into fixed-precision decimals.

use std::collections::HashMap;

use num_bigint::BigInt;
use rustpython_parser::ast;

use crate::ast::{BinOp, BoolOp, CmpOp, CompiledFunction, CompiledModule, Expr, Literal, Param, Stmt, UnaryOp};
use crate::config::Config;
use crate::error::{CResult, Error};
use crate::sanitizer::lint::ORM_CONSTRUCTORS;

/// The fixed name the constructor is renamed to, so it can only be
/// invoked once at install time and never again by ordinary calls.
pub fn constructor_name(config: &Config) -> String {
    format!("{}construct", config.private_prefix)
}

struct Rewriter<'a> {
    config: &'a Config,
    module_name: &'a str,
    /// original name -> mangled name, for every undecorated top-level fn.
    private_names: HashMap<String, String>,
}

pub fn rewrite(module: &[ast::Stmt], config: &Config, module_name: &str) -> CResult<CompiledModule> {
    let mut private_names = HashMap::new();
    let mut constructor_original: Option<String> = None;

    for stmt in module {
        if let ast::Stmt::FunctionDef(f) = stmt {
            let decorators: Vec<String> =
                f.decorator_list.iter().filter_map(decorator_name).collect();
            let exported = decorators.iter().any(|d| d == &config.export_decorator);
            let constructed = decorators.iter().any(|d| d == &config.construct_decorator);
            if constructed {
                constructor_original = Some(f.name.to_string());
            } else if !exported {
                private_names
                    .insert(f.name.to_string(), format!("{}{}", config.private_prefix, f.name));
            }
        }
    }

    let rewriter = Rewriter { config, module_name, private_names };

    let mut globals = Vec::new();
    let mut imports = Vec::new();
    for stmt in module {
        match stmt {
            ast::Stmt::Assign(a) => {
                if let Some(ast::Expr::Name(target)) = a.targets.first() {
                    globals
                        .push((target.id.to_string(), rewriter.lower_assign_value(&a.targets, &a.value)?));
                }
            }
            ast::Stmt::Import(i) => {
                imports.extend(i.names.iter().map(|alias| alias.name.to_string()));
            }
            _ => {}
        }
    }

    let mut functions = Vec::new();
    for stmt in module {
        if let ast::Stmt::FunctionDef(f) = stmt {
            let decorators: Vec<String> =
                f.decorator_list.iter().filter_map(decorator_name).collect();
            let exported = decorators.iter().any(|d| d == &config.export_decorator);
            let constructed = decorators.iter().any(|d| d == &config.construct_decorator);

            let name = if constructed {
                constructor_name(config)
            } else if let Some(mangled) = rewriter.private_names.get(f.name.as_str()) {
                mangled.clone()
            } else {
                f.name.to_string()
            };

            let params = f
                .args
                .args
                .iter()
                .map(|a| Param { name: a.def.arg.to_string(), default: None })
                .collect();

            let body = rewriter.lower_block(&f.body)?;
            functions.push(CompiledFunction { name, params, body, exported });
        }
    }

    Ok(CompiledModule {
        name: module_name.to_string(),
        functions,
        constructor: constructor_original.map(|_| constructor_name(config)),
        globals,
        imports,
    })
}

fn decorator_name(expr: &ast::Expr) -> Option<String> {
    match expr {
        ast::Expr::Name(n) => Some(n.id.to_string()),
        ast::Expr::Attribute(a) => Some(a.attr.to_string()),
        _ => None,
    }
}

impl<'a> Rewriter<'a> {
    fn lower_block(&self, stmts: &[ast::Stmt]) -> CResult<Vec<Stmt>> {
        stmts.iter().map(|s| self.lower_stmt(s)).collect()
    }

    fn lower_stmt(&self, stmt: &ast::Stmt) -> CResult<Stmt> {
        Ok(match stmt {
            ast::Stmt::Assign(a) => {
                let targets: Vec<Expr> =
                    a.targets.iter().map(|t| self.lower_expr(t)).collect::<CResult<_>>()?;
                let value = self.lower_assign_value(&a.targets, &a.value)?;
                Stmt::Assign { targets, value }
            }
            ast::Stmt::AugAssign(a) => Stmt::AugAssign {
                target: self.lower_expr(&a.target)?,
                op: lower_binop(&a.op),
                value: self.lower_expr(&a.value)?,
            },
            ast::Stmt::Return(r) => {
                Stmt::Return(r.value.as_ref().map(|v| self.lower_expr(v)).transpose()?)
            }
            ast::Stmt::Pass(_) => Stmt::Pass,
            ast::Stmt::Assert(a) => Stmt::Assert {
                test: self.lower_expr(&a.test)?,
                msg: a.msg.as_ref().map(|m| self.lower_expr(m)).transpose()?,
            },
            ast::Stmt::If(i) => Stmt::If {
                test: self.lower_expr(&i.test)?,
                body: self.lower_block(&i.body)?,
                orelse: self.lower_block(&i.orelse)?,
            },
            ast::Stmt::For(fo) => Stmt::For {
                target: self.lower_expr(&fo.target)?,
                iter: self.lower_expr(&fo.iter)?,
                body: self.lower_block(&fo.body)?,
                orelse: self.lower_block(&fo.orelse)?,
            },
            ast::Stmt::While(w) => Stmt::While {
                test: self.lower_expr(&w.test)?,
                body: self.lower_block(&w.body)?,
                orelse: self.lower_block(&w.orelse)?,
            },
            ast::Stmt::Expr(e) => Stmt::Expr(self.lower_expr(&e.value)?),
            other => {
                return Err(Error::Internal(format!(
                    "sanitizer rewrite encountered a node lint should have rejected: {other:?}"
                )))
            }
        })
    }

    /// Rule 3: if `value` is a call to one of the reserved ORM
    /// constructors, inject `contract=<module>` and `name=<target>`
    /// before lowering. `targets` has already passed S12 (at most one).
    fn lower_assign_value(&self, targets: &[ast::Expr], value: &ast::Expr) -> CResult<Expr> {
        if let (ast::Expr::Call(call), Some(ast::Expr::Name(target_name))) =
            (value, targets.first())
        {
            if let ast::Expr::Name(ctor) = call.func.as_ref() {
                if ORM_CONSTRUCTORS.contains(&ctor.id.as_str()) {
                    let mut args = Vec::with_capacity(call.args.len());
                    for a in &call.args {
                        args.push(self.lower_expr(a)?);
                    }
                    let mut keywords = Vec::with_capacity(call.keywords.len() + 2);
                    for kw in &call.keywords {
                        keywords.push((
                            kw.arg.as_ref().map(|a| a.to_string()),
                            self.lower_expr(&kw.value)?,
                        ));
                    }
                    keywords.push((
                        Some("contract".to_string()),
                        Expr::Constant(Literal::Str(self.module_name.to_string())),
                    ));
                    keywords.push((
                        Some("name".to_string()),
                        Expr::Constant(Literal::Str(target_name.id.to_string())),
                    ));
                    return Ok(Expr::Call {
                        func: Box::new(Expr::Name(ctor.id.to_string())),
                        args,
                        keywords,
                    });
                }
            }
        }
        self.lower_expr(value)
    }

    fn lower_expr(&self, expr: &ast::Expr) -> CResult<Expr> {
        Ok(match expr {
            ast::Expr::Constant(c) => Expr::Constant(self.lower_constant(&c.value)?),
            ast::Expr::Name(n) => Expr::Name(n.id.to_string()),
            ast::Expr::Attribute(a) => {
                Expr::Attribute { value: Box::new(self.lower_expr(&a.value)?), attr: a.attr.to_string() }
            }
            ast::Expr::Subscript(s) => Expr::Subscript {
                value: Box::new(self.lower_expr(&s.value)?),
                index: Box::new(self.lower_expr(&s.slice)?),
            },
            ast::Expr::Slice(s) => Expr::Slice {
                lower: s.lower.as_ref().map(|e| self.lower_expr(e)).transpose()?.map(Box::new),
                upper: s.upper.as_ref().map(|e| self.lower_expr(e)).transpose()?.map(Box::new),
                step: s.step.as_ref().map(|e| self.lower_expr(e)).transpose()?.map(Box::new),
            },
            ast::Expr::List(l) => {
                Expr::List(l.elts.iter().map(|e| self.lower_expr(e)).collect::<CResult<_>>()?)
            }
            ast::Expr::Tuple(t) => {
                Expr::Tuple(t.elts.iter().map(|e| self.lower_expr(e)).collect::<CResult<_>>()?)
            }
            ast::Expr::Set(s) => {
                Expr::SetLit(s.elts.iter().map(|e| self.lower_expr(e)).collect::<CResult<_>>()?)
            }
            ast::Expr::Dict(d) => {
                let mut entries = Vec::with_capacity(d.keys.len());
                for (k, v) in d.keys.iter().zip(d.values.iter()) {
                    let key = match k {
                        Some(k) => self.lower_expr(k)?,
                        None => {
                            return Err(Error::Internal("dict unpacking is not supported".to_string()))
                        }
                    };
                    entries.push((key, self.lower_expr(v)?));
                }
                Expr::Dict(entries)
            }
            ast::Expr::ListComp(c) => {
                let generator = c.generators.first().ok_or_else(|| {
                    Error::Internal("list comprehension with no generator clause".to_string())
                })?;
                Expr::ListComp {
                    element: Box::new(self.lower_expr(&c.elt)?),
                    target: Box::new(self.lower_expr(&generator.target)?),
                    iter: Box::new(self.lower_expr(&generator.iter)?),
                    ifs: generator.ifs.iter().map(|e| self.lower_expr(e)).collect::<CResult<_>>()?,
                }
            }
            ast::Expr::BoolOp(b) => Expr::BoolOp {
                op: match b.op {
                    ast::BoolOp::And => BoolOp::And,
                    ast::BoolOp::Or => BoolOp::Or,
                },
                values: b.values.iter().map(|e| self.lower_expr(e)).collect::<CResult<_>>()?,
            },
            ast::Expr::BinOp(b) => Expr::BinOp {
                left: Box::new(self.lower_expr(&b.left)?),
                op: lower_binop(&b.op),
                right: Box::new(self.lower_expr(&b.right)?),
            },
            ast::Expr::UnaryOp(u) => Expr::UnaryOp {
                op: match u.op {
                    ast::UnaryOp::Not => UnaryOp::Not,
                    ast::UnaryOp::USub => UnaryOp::Neg,
                    ast::UnaryOp::UAdd => UnaryOp::Pos,
                    ast::UnaryOp::Invert => {
                        return Err(Error::Internal("bitwise invert is not part of the dialect".to_string()))
                    }
                },
                operand: Box::new(self.lower_expr(&u.operand)?),
            },
            ast::Expr::Compare(c) => Expr::Compare {
                left: Box::new(self.lower_expr(&c.left)?),
                ops: c.ops.iter().map(lower_cmpop).collect(),
                comparators: c.comparators.iter().map(|e| self.lower_expr(e)).collect::<CResult<_>>()?,
            },
            ast::Expr::Call(c) => self.lower_call(c)?,
            ast::Expr::Starred(s) => Expr::Starred(Box::new(self.lower_expr(&s.value)?)),
            other => {
                return Err(Error::Internal(format!(
                    "sanitizer rewrite encountered a node lint should have rejected: {other:?}"
                )))
            }
        })
    }

    fn lower_call(&self, call: &ast::ExprCall) -> CResult<Expr> {
        let func = match call.func.as_ref() {
            ast::Expr::Name(n) => match self.private_names.get(n.id.as_str()) {
                Some(mangled) => Expr::Name(mangled.clone()),
                None => Expr::Name(n.id.to_string()),
            },
            other => self.lower_expr(other)?,
        };
        let args = call.args.iter().map(|a| self.lower_expr(a)).collect::<CResult<_>>()?;
        let keywords = call
            .keywords
            .iter()
            .map(|kw| Ok((kw.arg.as_ref().map(|a| a.to_string()), self.lower_expr(&kw.value)?)))
            .collect::<CResult<_>>()?;
        Ok(Expr::Call { func: Box::new(func), args, keywords })
    }

    fn lower_constant(&self, c: &ast::Constant) -> CResult<Literal> {
        let scale = self.config.decimal_precision;
        Ok(match c {
            ast::Constant::None => Literal::Null,
            ast::Constant::Bool(b) => Literal::Bool(*b),
            ast::Constant::Int(n) => Literal::Decimal { scale, unscaled: wrap_int(n, scale) },
            ast::Constant::Float(f) => Literal::Decimal { scale, unscaled: wrap_float(*f, scale) },
            ast::Constant::Str(s) => Literal::Str(s.clone()),
            ast::Constant::Bytes(b) => Literal::Bytes(b.clone()),
            other => {
                return Err(Error::Internal(format!(
                    "sanitizer rewrite encountered a literal kind lint should have rejected: {other:?}"
                )))
            }
        })
    }
}

fn lower_binop(op: &ast::Operator) -> BinOp {
    match op {
        ast::Operator::Add => BinOp::Add,
        ast::Operator::Sub => BinOp::Sub,
        ast::Operator::Mult => BinOp::Mul,
        ast::Operator::Div => BinOp::Div,
        ast::Operator::Mod => BinOp::Mod,
        ast::Operator::Pow => BinOp::Pow,
        // lint's allow-list only names add/sub/mul/div/mod/pow; anything
        // else would already have been rejected at stage 1.
        _ => BinOp::Add,
    }
}

fn lower_cmpop(op: &ast::CmpOp) -> CmpOp {
    match op {
        ast::CmpOp::Eq => CmpOp::Eq,
        ast::CmpOp::NotEq => CmpOp::NotEq,
        ast::CmpOp::Lt => CmpOp::Lt,
        ast::CmpOp::LtE => CmpOp::LtE,
        ast::CmpOp::Gt => CmpOp::Gt,
        ast::CmpOp::GtE => CmpOp::GtE,
        ast::CmpOp::In => CmpOp::In,
        ast::CmpOp::NotIn => CmpOp::NotIn,
        _ => CmpOp::Eq,
    }
}

/// `n * 10^scale`, the unscaled mantissa for an integer literal wrapped
/// to `scale` digits of fixed-point precision.
fn wrap_int(n: &BigInt, scale: u32) -> i128 {
    let value: i128 = n.to_string().parse().unwrap_or(0);
    value.saturating_mul(10i128.saturating_pow(scale))
}

/// Wraps a float literal by formatting it to `scale` decimal places and
/// parsing the resulting fixed-point string, avoiding binary-float
/// rounding noise beyond the configured precision.
fn wrap_float(f: f64, scale: u32) -> i128 {
    let formatted = format!("{:.*}", scale as usize, f);
    let (sign, digits) = if let Some(stripped) = formatted.strip_prefix('-') {
        (-1i128, stripped)
    } else {
        (1i128, formatted.as_str())
    };
    let without_point: String = digits.chars().filter(|c| *c != '.').collect();
    sign * without_point.parse::<i128>().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustpython_parser::Parse;

    fn rewrite_src(src: &str, name: &str) -> CompiledModule {
        let config = Config::default();
        let suite = ast::Suite::parse(src, "<test>").expect("fixture parses");
        rewrite(&suite, &config, name).expect("rewrite succeeds")
    }

    #[test]
    fn private_function_is_mangled_and_calls_rewritten() {
        let module = rewrite_src(
            "def helper():\n    return 1\n@export\ndef f():\n    return helper()\n",
            "token",
        );
        assert!(module.function("__helper").is_some());
        assert!(module.function("helper").is_none());
        let f = module.function("f").unwrap();
        match &f.body[0] {
            Stmt::Return(Some(Expr::Call { func, .. })) => {
                assert_eq!(**func, Expr::Name("__helper".to_string()));
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn constructor_is_renamed() {
        let module = rewrite_src("@construct\ndef seed():\n    pass\n", "token");
        assert_eq!(module.constructor.as_deref(), Some("__construct"));
        assert!(module.function("__construct").is_some());
    }

    #[test]
    fn orm_declaration_gets_contract_and_name_injected() {
        let module = rewrite_src(
            "balances = Hash()\n@export\ndef f():\n    pass\n",
            "token",
        );
        // top-level assigns aren't functions; exercise lowering directly.
        let config = Config::default();
        let suite = ast::Suite::parse("balances = Hash()\n", "<test>").unwrap();
        let rewriter = Rewriter { config: &config, module_name: "token", private_names: HashMap::new() };
        if let ast::Stmt::Assign(a) = &suite[0] {
            let lowered = rewriter.lower_assign_value(&a.targets, &a.value).unwrap();
            match lowered {
                Expr::Call { keywords, .. } => {
                    assert!(keywords.contains(&(
                        Some("contract".to_string()),
                        Expr::Constant(Literal::Str("token".to_string()))
                    )));
                    assert!(keywords.contains(&(
                        Some("name".to_string()),
                        Expr::Constant(Literal::Str("balances".to_string()))
                    )));
                }
                other => panic!("unexpected: {other:?}"),
            }
        }
        let _ = module;
    }

    #[test]
    fn numeric_literal_becomes_fixed_decimal() {
        let module = rewrite_src("@export\ndef f():\n    return 100\n", "token");
        let f = module.function("f").unwrap();
        match &f.body[0] {
            Stmt::Return(Some(Expr::Constant(Literal::Decimal { scale, unscaled }))) => {
                assert_eq!(*scale, Config::default().decimal_precision);
                assert_eq!(*unscaled, 100 * 10i128.pow(*scale));
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }
}
