//! Execution and state-staging core for a deterministic smart-contract
//! platform: a canonical value encoder, a pluggable key/value store, a
//! frame-stacked transactional cache on top of it, a contract-aware driver,
//! a Python-subset contract dialect sanitizer/compiler, a restricted module
//! loader, a metered executor with in-process and sandboxed execution
//! modes, and a multi-builder conflict-resolution cache for concurrent
//! sub-block execution. [Author fengyang]
//!
//! ## Getting started
//!
//! ```rust
//! use contract_core::error::Error;
//! use contract_core::storage::engine::Engine;
//! use contract_core::storage::memory::Memory;
//! use contract_core::cache::driver::CacheDriver;
//! use contract_core::encoder::Value;
//!
//! fn run() -> Result<(), Error> {
//!     let store = Memory::new();
//!     let mut cache = CacheDriver::new(store);
//!
//!     cache.new_tx();
//!     cache.set(b"token.balances:alice", Value::Int(100))?;
//!     assert_eq!(cache.get(b"token.balances:alice")?, Some(Value::Int(100)));
//!
//!     cache.commit()?;
//!     assert_eq!(cache.get(b"token.balances:alice")?, Some(Value::Int(100)));
//!     Ok(())
//! }
//!
//! fn main() {
//!     run().unwrap();
//! }
//! ```

pub mod cache;
pub mod config;
pub mod contract;
pub mod crcache;
pub mod encoder;
pub mod encoding;
pub mod error;
pub mod executor;
pub mod loader;
pub mod orm;
pub mod sanitizer;
pub mod storage;

#[cfg(test)]
mod test {
    use crate::cache::driver::CacheDriver;
    use crate::encoder::Value;
    use crate::error::Error;
    use crate::storage::memory::Memory;

    #[test]
    fn run() -> Result<(), Error> {
        let store = Memory::new();
        let mut cache = CacheDriver::new(store);

        cache.new_tx();
        cache.set(b"e", Value::Int(5))?;
        cache.delete(b"e")?;

        cache.set(b"c", Value::Int(0))?;
        cache.delete(b"c")?;
        cache.set(b"c", Value::Int(3))?;

        cache.set(b"a", Value::Int(1))?;
        cache.commit()?;

        assert_eq!(cache.get(b"e")?, None);
        assert_eq!(cache.get(b"c")?, Some(Value::Int(3)));
        assert_eq!(cache.get(b"a")?, Some(Value::Int(1)));

        Ok(())
    }
}
