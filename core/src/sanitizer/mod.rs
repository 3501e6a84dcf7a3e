//! Static checker and rewriter that turns submitted contract source into
//! a safe, executable image (spec.md §4.5).

pub mod compiler;
pub mod lint;
pub mod rewrite;

pub use compiler::{compile, deserialize, serialize};
pub use lint::{ContractLookup, LintCode};
