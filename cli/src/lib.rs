//! Contract engine CLI. [Author fengyang]
//!
//! ## Getting started
//!
//! ```doc
//! ❯ ./contract-cli
//!
//! contract-cli > deploy ledger ./ledger.con
//! deployed ledger (612 stamps)
//!
//! contract-cli > call ledger set_amount key=alice amount=100
//! null (890 stamps)
//!
//! contract-cli > get ledger balances
//! {alice: 100}
//!
//! contract-cli > exit
//! ```

pub mod command;
pub mod config;
pub mod rusty;
pub mod session;
pub mod show;
pub mod trace;
