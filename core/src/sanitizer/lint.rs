//! Stage 1 of the sanitizer: fail-closed static linting.
//!
//! Walks the parsed source AST and collects every violation of spec.md
//! §4.5's allow-listed node set and its numbered static rules (S1-S13)
//! rather than stopping at the first one, so a rejected submission can be
//! reported to its author all at once.

use std::fmt;

use rustpython_parser::ast;

use crate::config::Config;

/// One violation code from spec.md §4.5. Each carries just enough
/// context to explain itself without a second lookup into the source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LintCode {
    /// S1: a node kind outside the allow-list.
    S1UnexpectedNode(String),
    /// S2: an identifier the author wrote begins with `_`.
    S2ReservedIdentifier(String),
    /// S3: a function body contains an `import` statement.
    S3NestedImport(String),
    /// S4: `from ... import ...` is not supported.
    S4ImportFrom,
    /// S5: the imported contract does not exist in the store.
    S5UnknownContract(String),
    /// S6: a class definition anywhere in the module.
    S6ClassDefinition(String),
    /// S7: an `async def` anywhere in the module.
    S7AsyncFunctionDefinition(String),
    /// S8: a decorator name that isn't `@export`/`@construct`.
    S8UnknownDecorator(String),
    /// S9: more than one `@construct`-decorated function in the module.
    S9MultipleConstructors,
    /// S10: a function carries more than one decorator.
    S10MultipleDecorators(String),
    /// S11: a state-declaration argument collides with `contract`/`name`.
    S11ReservedOrmKeyword { function: String, keyword: String },
    /// S12: a state declaration assigns to more than one target.
    S12MultipleAssignTargets(String),
    /// S13: no function in the module carries a recognized decorator.
    S13NoDecoratedFunction,
}

impl fmt::Display for LintCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LintCode::S1UnexpectedNode(kind) => write!(f, "S1: unexpected node kind `{kind}`"),
            LintCode::S2ReservedIdentifier(name) => {
                write!(f, "S2: identifier `{name}` begins with `_`, which is reserved")
            }
            LintCode::S3NestedImport(func) => {
                write!(f, "S3: `import` statement nested inside function `{func}`")
            }
            LintCode::S4ImportFrom => write!(f, "S4: `from ... import ...` is not supported"),
            LintCode::S5UnknownContract(name) => {
                write!(f, "S5: imported contract `{name}` is not present in the store")
            }
            LintCode::S6ClassDefinition(name) => write!(f, "S6: class definitions are not allowed (`{name}`)"),
            LintCode::S7AsyncFunctionDefinition(name) => {
                write!(f, "S7: async function definitions are not allowed (`{name}`)")
            }
            LintCode::S8UnknownDecorator(name) => write!(f, "S8: unknown decorator `@{name}`"),
            LintCode::S9MultipleConstructors => {
                write!(f, "S9: more than one constructor decorator in module")
            }
            LintCode::S10MultipleDecorators(func) => {
                write!(f, "S10: function `{func}` carries more than one decorator")
            }
            LintCode::S11ReservedOrmKeyword { function, keyword } => write!(
                f,
                "S11: argument `{keyword}` of `{function}` collides with a reserved ORM keyword"
            ),
            LintCode::S12MultipleAssignTargets(func) => {
                write!(f, "S12: state declaration in `{func}` assigns to more than one target")
            }
            LintCode::S13NoDecoratedFunction => {
                write!(f, "S13: no valid decorator found on any top-level function")
            }
        }
    }
}

/// The four reserved ORM state-object constructors recognized by rewrite
/// rule 3 (spec.md §9).
pub const ORM_CONSTRUCTORS: [&str; 4] = ["Variable", "Hash", "ForeignVariable", "ForeignHash"];

/// Something that can answer "does contract `name` exist" without the
/// linter needing to know which concrete store backs it.
pub trait ContractLookup {
    fn contract_exists(&mut self, name: &str) -> crate::error::CResult<bool>;
}

pub struct Linter<'a, L: ContractLookup> {
    config: &'a Config,
    lookup: &'a mut L,
    violations: Vec<LintCode>,
}

impl<'a, L: ContractLookup> Linter<'a, L> {
    pub fn new(config: &'a Config, lookup: &'a mut L) -> Self {
        Linter { config, lookup, violations: Vec::new() }
    }

    /// Runs the full stage-1 walk and returns every violation found. An
    /// empty vector means the module is clean.
    pub fn lint(mut self, module: &[ast::Stmt]) -> Vec<LintCode> {
        let mut construct_count = 0usize;
        let mut decorated_count = 0usize;

        for stmt in module {
            match stmt {
                ast::Stmt::FunctionDef(f) => {
                    let (exported, constructed) = self.lint_decorators(&f.name, &f.decorator_list);
                    if exported || constructed {
                        decorated_count += 1;
                    }
                    if constructed {
                        construct_count += 1;
                    }
                    self.lint_identifier(&f.name);
                    self.lint_args(&f.name, &f.args);
                    self.lint_function_body(&f.name, &f.body);
                }
                ast::Stmt::AsyncFunctionDef(f) => {
                    self.violations.push(LintCode::S7AsyncFunctionDefinition(f.name.to_string()));
                }
                ast::Stmt::ClassDef(c) => {
                    self.violations.push(LintCode::S6ClassDefinition(c.name.to_string()));
                }
                ast::Stmt::Import(_) => {
                    // top-level imports are allowed; existence is checked
                    // against whichever names actually get loaded (S5),
                    // deferred to the loader since linting happens before
                    // we know which imports are reachable at runtime.
                }
                ast::Stmt::ImportFrom(_) => self.violations.push(LintCode::S4ImportFrom),
                ast::Stmt::Assign(_)
                | ast::Stmt::AugAssign(_)
                | ast::Stmt::Pass(_)
                | ast::Stmt::Assert(_)
                | ast::Stmt::If(_)
                | ast::Stmt::For(_)
                | ast::Stmt::While(_)
                | ast::Stmt::Return(_)
                | ast::Stmt::Expr(_) => {
                    self.lint_stmt_tree(None, stmt);
                }
                other => {
                    self.violations.push(LintCode::S1UnexpectedNode(stmt_kind_name(other)));
                }
            }
        }

        if construct_count > 1 {
            self.violations.push(LintCode::S9MultipleConstructors);
        }
        if decorated_count == 0 {
            self.violations.push(LintCode::S13NoDecoratedFunction);
        }

        self.violations
    }

    fn lint_decorators(&mut self, func_name: &str, decorators: &[ast::Expr]) -> (bool, bool) {
        if decorators.len() > 1 {
            self.violations.push(LintCode::S10MultipleDecorators(func_name.to_string()));
        }
        let mut exported = false;
        let mut constructed = false;
        for dec in decorators {
            match decorator_name(dec) {
                Some(name) if name == self.config.export_decorator => exported = true,
                Some(name) if name == self.config.construct_decorator => constructed = true,
                Some(name) => self.violations.push(LintCode::S8UnknownDecorator(name)),
                None => self.violations.push(LintCode::S8UnknownDecorator("<expression>".to_string())),
            }
        }
        (exported, constructed)
    }

    fn lint_identifier(&mut self, name: &str) {
        if name.starts_with('_') {
            self.violations.push(LintCode::S2ReservedIdentifier(name.to_string()));
        }
    }

    fn lint_args(&mut self, func_name: &str, args: &ast::Arguments) {
        for arg in args.args.iter().chain(args.posonlyargs.iter()).chain(args.kwonlyargs.iter()) {
            let arg_name = arg.def.arg.as_str();
            if arg_name.starts_with('_') {
                self.violations.push(LintCode::S2ReservedIdentifier(arg_name.to_string()));
            }
            if arg_name == "contract" || arg_name == "name" {
                self.violations.push(LintCode::S11ReservedOrmKeyword {
                    function: func_name.to_string(),
                    keyword: arg_name.to_string(),
                });
            }
        }
    }

    fn lint_function_body(&mut self, func_name: &str, body: &[ast::Stmt]) {
        for stmt in body {
            self.lint_nested_stmt(func_name, stmt);
        }
    }

    fn lint_nested_stmt(&mut self, func_name: &str, stmt: &ast::Stmt) {
        match stmt {
            ast::Stmt::Import(_) => self.violations.push(LintCode::S3NestedImport(func_name.to_string())),
            ast::Stmt::ImportFrom(_) => self.violations.push(LintCode::S4ImportFrom),
            ast::Stmt::FunctionDef(_) | ast::Stmt::AsyncFunctionDef(_) | ast::Stmt::ClassDef(_) => {
                self.violations.push(LintCode::S1UnexpectedNode(stmt_kind_name(stmt)));
            }
            ast::Stmt::If(i) => {
                for s in i.body.iter().chain(i.orelse.iter()) {
                    self.lint_nested_stmt(func_name, s);
                }
                self.lint_expr(func_name, &i.test);
            }
            ast::Stmt::For(fo) => {
                for s in fo.body.iter().chain(fo.orelse.iter()) {
                    self.lint_nested_stmt(func_name, s);
                }
                self.lint_expr(func_name, &fo.iter);
            }
            ast::Stmt::While(w) => {
                for s in w.body.iter().chain(w.orelse.iter()) {
                    self.lint_nested_stmt(func_name, s);
                }
                self.lint_expr(func_name, &w.test);
            }
            ast::Stmt::Assign(a) => {
                if a.targets.len() > 1 {
                    if is_orm_construction(&a.value) {
                        self.violations.push(LintCode::S12MultipleAssignTargets(func_name.to_string()));
                    }
                }
                self.lint_expr(func_name, &a.value);
            }
            ast::Stmt::AugAssign(a) => self.lint_expr(func_name, &a.value),
            ast::Stmt::Assert(a) => {
                self.lint_expr(func_name, &a.test);
                if let Some(msg) = &a.msg {
                    self.lint_expr(func_name, msg);
                }
            }
            ast::Stmt::Return(r) => {
                if let Some(v) = &r.value {
                    self.lint_expr(func_name, v);
                }
            }
            ast::Stmt::Expr(e) => self.lint_expr(func_name, &e.value),
            ast::Stmt::Pass(_) => {}
            other => self.violations.push(LintCode::S1UnexpectedNode(stmt_kind_name(other))),
        }
    }

    /// Top-level statements go through the same walk as nested ones for
    /// the allow-list check, just without the "import inside a function"
    /// framing (S3 is specifically about function bodies).
    fn lint_stmt_tree(&mut self, func_name: Option<&str>, stmt: &ast::Stmt) {
        self.lint_nested_stmt(func_name.unwrap_or("<module>"), stmt);
    }

    fn lint_expr(&mut self, func_name: &str, expr: &ast::Expr) {
        match expr {
            ast::Expr::Constant(_) | ast::Expr::Name(_) => {}
            ast::Expr::Attribute(a) => self.lint_expr(func_name, &a.value),
            ast::Expr::Subscript(s) => {
                self.lint_expr(func_name, &s.value);
                self.lint_expr(func_name, &s.slice);
            }
            ast::Expr::Slice(s) => {
                for part in [&s.lower, &s.upper, &s.step].into_iter().flatten() {
                    self.lint_expr(func_name, part);
                }
            }
            ast::Expr::List(l) => l.elts.iter().for_each(|e| self.lint_expr(func_name, e)),
            ast::Expr::Tuple(t) => t.elts.iter().for_each(|e| self.lint_expr(func_name, e)),
            ast::Expr::Set(s) => s.elts.iter().for_each(|e| self.lint_expr(func_name, e)),
            ast::Expr::Dict(d) => {
                for (k, v) in d.keys.iter().zip(d.values.iter()) {
                    if let Some(k) = k {
                        self.lint_expr(func_name, k);
                    }
                    self.lint_expr(func_name, v);
                }
            }
            ast::Expr::ListComp(c) => {
                self.lint_expr(func_name, &c.elt);
                for g in &c.generators {
                    self.lint_expr(func_name, &g.iter);
                    for cond in &g.ifs {
                        self.lint_expr(func_name, cond);
                    }
                }
            }
            ast::Expr::BoolOp(b) => b.values.iter().for_each(|e| self.lint_expr(func_name, e)),
            ast::Expr::BinOp(b) => {
                self.lint_expr(func_name, &b.left);
                self.lint_expr(func_name, &b.right);
            }
            ast::Expr::UnaryOp(u) => self.lint_expr(func_name, &u.operand),
            ast::Expr::Compare(c) => {
                self.lint_expr(func_name, &c.left);
                c.comparators.iter().for_each(|e| self.lint_expr(func_name, e));
            }
            ast::Expr::Call(c) => {
                self.lint_call(func_name, c);
            }
            ast::Expr::Starred(s) => self.lint_expr(func_name, &s.value),
            other => self.violations.push(LintCode::S1UnexpectedNode(expr_kind_name(other))),
        }
    }

    fn lint_call(&mut self, func_name: &str, call: &ast::ExprCall) {
        self.lint_expr(func_name, &call.func);
        for a in &call.args {
            self.lint_expr(func_name, a);
        }
        let callee = name_of(&call.func);
        for kw in &call.keywords {
            if let Some(arg) = &kw.arg {
                if callee.as_deref().map(|c| ORM_CONSTRUCTORS.contains(&c)).unwrap_or(false)
                    && (arg.as_str() == "contract" || arg.as_str() == "name")
                {
                    self.violations.push(LintCode::S11ReservedOrmKeyword {
                        function: func_name.to_string(),
                        keyword: arg.to_string(),
                    });
                }
            }
            self.lint_expr(func_name, &kw.value);
        }
        if let Some(name) = &callee {
            if name.starts_with('_') {
                self.violations.push(LintCode::S2ReservedIdentifier(name.clone()));
            }
        }
    }

    /// Resolves S5 for a single imported name; called by the loader
    /// (which owns the store) rather than by `lint` itself, since a fresh
    /// `ContractLookup` borrow is needed per import target.
    pub fn check_import(&mut self, name: &str) {
        match self.lookup.contract_exists(name) {
            Ok(true) => {}
            Ok(false) | Err(_) => self.violations.push(LintCode::S5UnknownContract(name.to_string())),
        }
    }
}

fn decorator_name(expr: &ast::Expr) -> Option<String> {
    name_of(expr)
}

fn name_of(expr: &ast::Expr) -> Option<String> {
    match expr {
        ast::Expr::Name(n) => Some(n.id.to_string()),
        ast::Expr::Attribute(a) => Some(a.attr.to_string()),
        _ => None,
    }
}

fn is_orm_construction(expr: &ast::Expr) -> bool {
    match expr {
        ast::Expr::Call(c) => {
            name_of(&c.func).map(|n| ORM_CONSTRUCTORS.contains(&n.as_str())).unwrap_or(false)
        }
        _ => false,
    }
}

fn stmt_kind_name(stmt: &ast::Stmt) -> String {
    format!("{stmt:?}").split('(').next().unwrap_or("stmt").to_string()
}

fn expr_kind_name(expr: &ast::Expr) -> String {
    format!("{expr:?}").split('(').next().unwrap_or("expr").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustpython_parser::Parse;

    struct AlwaysPresent;
    impl ContractLookup for AlwaysPresent {
        fn contract_exists(&mut self, _name: &str) -> crate::error::CResult<bool> {
            Ok(true)
        }
    }

    fn parse(src: &str) -> Vec<ast::Stmt> {
        ast::Suite::parse(src, "<test>").expect("fixture parses")
    }

    fn lint(src: &str) -> Vec<LintCode> {
        let config = Config::default();
        let mut lookup = AlwaysPresent;
        Linter::new(&config, &mut lookup).lint(&parse(src))
    }

    #[test]
    fn clean_export_has_no_violations() {
        let violations = lint("@export\ndef transfer(amount, to):\n    pass\n");
        assert!(violations.is_empty(), "{violations:?}");
    }

    #[test]
    fn no_decorator_is_s13() {
        let violations = lint("def helper():\n    pass\n");
        assert!(violations.contains(&LintCode::S13NoDecoratedFunction));
    }

    #[test]
    fn leading_underscore_is_s2() {
        let violations = lint("@export\ndef _private():\n    pass\n");
        assert!(violations.iter().any(|v| matches!(v, LintCode::S2ReservedIdentifier(_))));
    }

    #[test]
    fn nested_import_is_s3() {
        let violations = lint("@export\ndef f():\n    import token\n");
        assert!(violations.iter().any(|v| matches!(v, LintCode::S3NestedImport(_))));
    }

    #[test]
    fn import_from_is_s4() {
        let violations = lint("from token import transfer\n@export\ndef f():\n    pass\n");
        assert!(violations.contains(&LintCode::S4ImportFrom));
    }

    #[test]
    fn class_definition_is_s6() {
        let violations = lint("class Foo:\n    pass\n@export\ndef f():\n    pass\n");
        assert!(violations.iter().any(|v| matches!(v, LintCode::S6ClassDefinition(_))));
    }

    #[test]
    fn async_def_is_s7() {
        let violations = lint("async def f():\n    pass\n@export\ndef g():\n    pass\n");
        assert!(violations.iter().any(|v| matches!(v, LintCode::S7AsyncFunctionDefinition(_))));
    }

    #[test]
    fn unknown_decorator_is_s8() {
        let violations = lint("@memoize\ndef f():\n    pass\n");
        assert!(violations.iter().any(|v| matches!(v, LintCode::S8UnknownDecorator(_))));
    }

    #[test]
    fn two_constructors_is_s9() {
        let violations = lint(
            "@construct\ndef seed():\n    pass\n@construct\ndef seed2():\n    pass\n",
        );
        assert!(violations.contains(&LintCode::S9MultipleConstructors));
    }

    #[test]
    fn double_decorator_is_s10() {
        let violations = lint("@export\n@construct\ndef f():\n    pass\n");
        assert!(violations.iter().any(|v| matches!(v, LintCode::S10MultipleDecorators(_))));
    }

    #[test]
    fn reserved_orm_keyword_is_s11() {
        let violations = lint("@export\ndef f(contract):\n    pass\n");
        assert!(violations.iter().any(|v| matches!(v, LintCode::S11ReservedOrmKeyword { .. })));
    }

    #[test]
    fn multi_target_state_decl_is_s12() {
        let violations =
            lint("balances = supply = Hash()\n@export\ndef f():\n    pass\n");
        assert!(violations.iter().any(|v| matches!(v, LintCode::S12MultipleAssignTargets(_))));
    }
}
