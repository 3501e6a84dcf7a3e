use serde::{Deserialize, Serialize};

/// Backing store kind selected for a `ContractDriver`/`CacheDriver` stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Memory,
    Networked,
}

impl Default for StoreKind {
    fn default() -> Self {
        StoreKind::Memory
    }
}

/// Every row of the external configuration table, realized as one field
/// with a documented default. Loaded in the `cli` crate via layered
/// defaults -> TOML file -> environment, same shape as `kv-cli`'s
/// `ConfigLoad`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Selects in-memory vs networked driver.
    pub store_kind: StoreKind,
    /// `host:port` of the networked driver, when `store_kind` is `Networked`.
    pub store_endpoint: String,
    /// Redis logical database index used by the networked driver.
    pub store_db_index: i64,

    /// Delimits `<contract>` from `<field>` in a compound key.
    pub index_separator: String,
    /// Delimits `<field>` from `<subkey>` in a compound key.
    pub sub_delimiter: String,

    /// Metadata field name holding a contract's post-sanitization source.
    pub code_key: String,
    /// Metadata field name holding a contract's author identifier.
    pub author_key: String,
    /// Metadata field name holding `user`/`sys`.
    pub type_key: String,
    /// Metadata field name holding the compiled image.
    pub compiled_key: String,

    /// Decorator name marking a function callable from outside the contract.
    pub export_decorator: String,
    /// Decorator name marking a contract's constructor.
    pub construct_decorator: String,

    /// Prefix applied to private-method names during rewriting.
    pub private_prefix: String,

    /// Fixed-point precision used when wrapping numeric literals.
    pub decimal_precision: u32,

    /// Per-call heap budget, in list/dict/string elements, before a call
    /// traps with `Error::Internal`.
    pub memory_limit: usize,
    /// Maximum call-stack depth before `Error::RecursionLimit`.
    pub recursion_limit: usize,

    /// Stamps charged per unit of metered execution cost (`STAMP_TO_TAU`).
    pub stamp_to_cost_ratio: u64,
    /// Additional stamps charged per byte read through the cache driver.
    pub read_cost_per_byte: u64,
    /// Stamps charged per AST node (statement or expression) dispatched
    /// by the interpreter, independent of the byte-cost hook above. This
    /// is how a contract with no reads or writes (an infinite loop) can
    /// still exhaust its stamp budget.
    pub instruction_cost: u64,

    /// Contract name the metering protocol reads `balances` from.
    pub currency_contract: String,
    /// Hash field name on the currency contract holding per-sender
    /// balances (joined with `sub_delimiter` + sender to form the key).
    pub balances_hash: String,
    /// Stamps assumed when a caller omits an explicit `stamps` budget.
    pub default_stamps: u64,

    /// Number of sub-block builders participating in a CR round.
    pub num_sub_block_builders: usize,
    /// Maximum number of bags a `CRCache` will hold pending execution.
    pub max_queue: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            store_kind: StoreKind::Memory,
            store_endpoint: "127.0.0.1:6379".to_string(),
            store_db_index: 0,

            index_separator: ".".to_string(),
            sub_delimiter: ":".to_string(),

            code_key: "__code__".to_string(),
            author_key: "__author__".to_string(),
            type_key: "__type__".to_string(),
            compiled_key: "__compiled__".to_string(),

            export_decorator: "export".to_string(),
            construct_decorator: "construct".to_string(),

            private_prefix: "__".to_string(),

            decimal_precision: 18,

            memory_limit: 64 * 1024,
            recursion_limit: 64,

            stamp_to_cost_ratio: 1,
            read_cost_per_byte: 1,
            instruction_cost: 1,

            currency_contract: "currency".to_string(),
            balances_hash: "balances".to_string(),
            default_stamps: 50_000,

            num_sub_block_builders: 4,
            max_queue: 256,
        }
    }
}

impl Config {
    /// Validates cross-field invariants a bare `Deserialize` can't express:
    /// separators must be non-empty and distinct, sub-block fan-out must be
    /// positive.
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        if self.index_separator.is_empty() {
            return Err(crate::error::Error::Configuration(
                "index_separator must not be empty".to_string(),
            ));
        }
        if self.sub_delimiter.is_empty() {
            return Err(crate::error::Error::Configuration(
                "sub_delimiter must not be empty".to_string(),
            ));
        }
        if self.index_separator == self.sub_delimiter {
            return Err(crate::error::Error::Configuration(
                "index_separator and sub_delimiter must differ".to_string(),
            ));
        }
        if self.num_sub_block_builders == 0 {
            return Err(crate::error::Error::Configuration(
                "num_sub_block_builders must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_equal_separators() {
        let mut c = Config::default();
        c.sub_delimiter = c.index_separator.clone();
        assert!(c.validate().is_err());
    }

    #[test]
    fn rejects_empty_separator() {
        let mut c = Config::default();
        c.index_separator = String::new();
        assert!(c.validate().is_err());
    }
}
