//! ORM state-object handles injected into every contract's restricted
//! environment.
//!
//! Four variants of one tagged sum, matching spec.md §9's "dynamic
//! dispatch" note: `Variable`, `Hash`, `ForeignVariable`, `ForeignHash`
//! share a `{get, set, key}` capability set. Rewrite rule 3 (see
//! `sanitizer::rewrite`) guarantees every construction of one of these
//! carries `contract=` and `name=`, so a handle can never read or write
//! outside the contract that declared it (foreign variants read another
//! contract's state but are still bound to *that* contract's keys, never
//! the declaring contract's).

use crate::cache::CacheDriver;
use crate::config::Config;
use crate::encoder::Value;
use crate::error::CResult;
use crate::storage::engine::Engine;

/// A bound ORM state handle: the contract/field it reads and writes, and
/// (for hash variants) how subkeys are joined to the field.
#[derive(Debug, Clone, PartialEq)]
pub enum OrmObject {
    Variable { contract: String, name: String },
    Hash { contract: String, name: String },
    /// A `Variable` declared in `owner` but readable/writable from
    /// `contract` — the foreign contract's keys, not the declarer's.
    ForeignVariable { owner: String, name: String },
    ForeignHash { owner: String, name: String },
}

impl OrmObject {
    pub fn variable(contract: impl Into<String>, name: impl Into<String>) -> Self {
        OrmObject::Variable { contract: contract.into(), name: name.into() }
    }

    pub fn hash(contract: impl Into<String>, name: impl Into<String>) -> Self {
        OrmObject::Hash { contract: contract.into(), name: name.into() }
    }

    pub fn foreign_variable(owner: impl Into<String>, name: impl Into<String>) -> Self {
        OrmObject::ForeignVariable { owner: owner.into(), name: name.into() }
    }

    pub fn foreign_hash(owner: impl Into<String>, name: impl Into<String>) -> Self {
        OrmObject::ForeignHash { owner: owner.into(), name: name.into() }
    }

    fn owning_contract(&self) -> &str {
        match self {
            OrmObject::Variable { contract, .. } => contract,
            OrmObject::Hash { contract, .. } => contract,
            OrmObject::ForeignVariable { owner, .. } => owner,
            OrmObject::ForeignHash { owner, .. } => owner,
        }
    }

    fn field(&self) -> &str {
        match self {
            OrmObject::Variable { name, .. }
            | OrmObject::Hash { name, .. }
            | OrmObject::ForeignVariable { name, .. }
            | OrmObject::ForeignHash { name, .. } => name,
        }
    }

    fn is_hash(&self) -> bool {
        matches!(self, OrmObject::Hash { .. } | OrmObject::ForeignHash { .. })
    }

    /// The store key this handle reads/writes: `contract.field` for a
    /// scalar, `contract.field:subkey` for a hash entry.
    pub fn key(&self, config: &Config, subkey: Option<&str>) -> Vec<u8> {
        let contract = self.owning_contract();
        let field = self.field();
        match subkey {
            Some(sub) if self.is_hash() => {
                format!("{contract}{}{field}{}{sub}", config.index_separator, config.sub_delimiter)
                    .into_bytes()
            }
            _ => format!("{contract}{}{field}", config.index_separator).into_bytes(),
        }
    }

    pub fn get<E: Engine>(
        &self,
        cache: &mut CacheDriver<E>,
        config: &Config,
        subkey: Option<&str>,
    ) -> CResult<Option<Value>> {
        cache.get(&self.key(config, subkey))
    }

    pub fn set<E: Engine>(
        &self,
        cache: &mut CacheDriver<E>,
        config: &Config,
        subkey: Option<&str>,
        value: Value,
    ) -> CResult<()> {
        cache.set(&self.key(config, subkey), value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variable_key_has_no_subkey() {
        let v = OrmObject::variable("token", "supply");
        let cfg = Config::default();
        assert_eq!(v.key(&cfg, None), b"token.supply".to_vec());
    }

    #[test]
    fn hash_key_joins_field_and_subkey() {
        let h = OrmObject::hash("token", "balances");
        let cfg = Config::default();
        assert_eq!(h.key(&cfg, Some("alice")), b"token.balances:alice".to_vec());
    }

    #[test]
    fn foreign_variable_binds_to_owner_not_caller() {
        let fv = OrmObject::foreign_variable("currency", "supply");
        let cfg = Config::default();
        assert_eq!(fv.key(&cfg, None), b"currency.supply".to_vec());
    }
}
