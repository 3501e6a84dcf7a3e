use crate::cache::CacheDriver;
use crate::config::Config;
use crate::contract::metadata::ContractType;
use crate::encoder::Value;
use crate::error::{CResult, Error};
use crate::sanitizer::lint::ContractLookup;
use crate::storage::engine::Engine;

/// Thin typed layer over `CacheDriver`: understands `<contract>.<field>`
/// key structure and contract metadata, but nothing about contract
/// *semantics* (that's the loader/executor's job).
pub struct ContractDriver<E: Engine> {
    cache: CacheDriver<E>,
    config: Config,
}

impl<E: Engine> ContractDriver<E> {
    pub fn new(store: E, config: Config) -> Self {
        ContractDriver {
            cache: CacheDriver::with_read_cost(store, config.read_cost_per_byte),
            config,
        }
    }

    pub fn cache(&mut self) -> &mut CacheDriver<E> {
        &mut self.cache
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn make_key(&self, name: &str, field: &str) -> Vec<u8> {
        format!("{name}{}{field}", self.config.index_separator).into_bytes()
    }

    pub fn make_hash_key(&self, name: &str, field: &str, subkey: &str) -> Vec<u8> {
        format!(
            "{name}{}{field}{}{subkey}",
            self.config.index_separator, self.config.sub_delimiter
        )
        .into_bytes()
    }

    pub fn get(&mut self, name: &str, field: &str) -> CResult<Option<Value>> {
        let key = self.make_key(name, field);
        self.cache.get(&key)
    }

    pub fn set(&mut self, name: &str, field: &str, value: Value) -> CResult<()> {
        let key = self.make_key(name, field);
        self.cache.set(&key, value)
    }

    pub fn hget(&mut self, name: &str, field: &str, subkey: &str) -> CResult<Option<Value>> {
        let key = self.make_hash_key(name, field, subkey);
        self.cache.get(&key)
    }

    pub fn hset(&mut self, name: &str, field: &str, subkey: &str, value: Value) -> CResult<()> {
        let key = self.make_hash_key(name, field, subkey);
        self.cache.set(&key, value)
    }

    fn bytes_field(&mut self, name: &str, field: &str) -> CResult<Option<Vec<u8>>> {
        let key = self.make_key(name, field);
        match self.cache.get(&key)? {
            None => Ok(None),
            Some(Value::Bytes(b)) => Ok(Some(b)),
            Some(Value::Str(s)) => Ok(Some(s.into_bytes())),
            Some(_) => Err(Error::EncoderError(format!("{field} is not a byte/string value"))),
        }
    }

    pub fn get_contract(&mut self, name: &str) -> CResult<Option<Vec<u8>>> {
        let code_key = self.config.code_key.clone();
        self.bytes_field(name, &code_key)
    }

    pub fn get_author(&mut self, name: &str) -> CResult<Option<String>> {
        let author_key = self.config.author_key.clone();
        match self.bytes_field(name, &author_key)? {
            Some(b) => Ok(Some(String::from_utf8(b).map_err(|e| Error::EncoderError(e.to_string()))?)),
            None => Ok(None),
        }
    }

    pub fn get_contract_type(&mut self, name: &str) -> CResult<Option<ContractType>> {
        let type_key = self.config.type_key.clone();
        match self.bytes_field(name, &type_key)? {
            Some(b) => {
                let s = String::from_utf8(b).map_err(|e| Error::EncoderError(e.to_string()))?;
                Ok(ContractType::parse(&s))
            }
            None => Ok(None),
        }
    }

    pub fn get_compiled(&mut self, name: &str) -> CResult<Option<Vec<u8>>> {
        let compiled_key = self.config.compiled_key.clone();
        self.bytes_field(name, &compiled_key)
    }

    pub fn is_contract(&mut self, name: &str) -> CResult<bool> {
        Ok(self.get_contract(name)?.is_some())
    }

    /// Writes source, author, type, and compiled image. Overwrite is
    /// refused unless `overwrite` is explicitly set and the contract
    /// already exists.
    pub fn set_contract(
        &mut self,
        name: &str,
        code: &[u8],
        author: &str,
        contract_type: ContractType,
        compiled: Vec<u8>,
        overwrite: bool,
    ) -> CResult<()> {
        if self.is_contract(name)? && !overwrite {
            return Err(Error::Internal(format!("contract already exists: {name}")));
        }
        let code_key = self.config.code_key.clone();
        let author_key = self.config.author_key.clone();
        let type_key = self.config.type_key.clone();
        let compiled_key = self.config.compiled_key.clone();

        self.set(name, &code_key, Value::Bytes(code.to_vec()))?;
        self.set(name, &author_key, Value::Str(author.to_string()))?;
        self.set(name, &type_key, Value::Str(contract_type.as_str().to_string()))?;
        self.set(name, &compiled_key, Value::Bytes(compiled))?;
        Ok(())
    }

    fn reserved_field_names(&self) -> [String; 4] {
        [
            self.config.code_key.clone(),
            self.config.author_key.clone(),
            self.config.type_key.clone(),
            self.config.compiled_key.clone(),
        ]
    }

    /// Prefix-deletes every key belonging to `name`, metadata included.
    pub fn delete_contract(&mut self, name: &str) -> CResult<()> {
        let prefix = format!("{name}{}", self.config.index_separator);
        let keys = self.cache.iter(prefix.as_bytes())?;
        for key in keys {
            self.cache.delete(&key)?;
        }
        Ok(())
    }

    /// Enumerates `name`'s state keys, excluding the four metadata fields.
    pub fn get_contract_keys(&mut self, name: &str) -> CResult<Vec<Vec<u8>>> {
        let prefix = format!("{name}{}", self.config.index_separator);
        let reserved = self.reserved_field_names();
        let keys = self.cache.iter(prefix.as_bytes())?;
        Ok(keys
            .into_iter()
            .filter(|k| {
                let suffix = &k[prefix.len()..];
                !reserved.iter().any(|r| suffix == r.as_bytes())
            })
            .collect())
    }
}

impl<E: Engine> ContractLookup for ContractDriver<E> {
    fn contract_exists(&mut self, name: &str) -> CResult<bool> {
        if name == crate::loader::SUBMISSION_CONTRACT {
            return Ok(true);
        }
        self.is_contract(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::Memory;

    fn driver() -> ContractDriver<Memory> {
        ContractDriver::new(Memory::new(), Config::default())
    }

    #[test]
    fn set_and_get_contract_roundtrips_metadata() {
        let mut d = driver();
        d.set_contract("token", b"def f(): pass", "alice", ContractType::User, vec![1, 2, 3], false)
            .unwrap();

        assert_eq!(d.get_contract("token").unwrap(), Some(b"def f(): pass".to_vec()));
        assert_eq!(d.get_author("token").unwrap(), Some("alice".to_string()));
        assert_eq!(d.get_contract_type("token").unwrap(), Some(ContractType::User));
        assert_eq!(d.get_compiled("token").unwrap(), Some(vec![1, 2, 3]));
        assert!(d.is_contract("token").unwrap());
    }

    #[test]
    fn overwrite_refused_unless_explicit() {
        let mut d = driver();
        d.set_contract("token", b"code", "alice", ContractType::User, vec![], false).unwrap();
        let err = d.set_contract("token", b"new code", "bob", ContractType::User, vec![], false);
        assert!(err.is_err());

        d.set_contract("token", b"new code", "bob", ContractType::User, vec![], true).unwrap();
        assert_eq!(d.get_contract("token").unwrap(), Some(b"new code".to_vec()));
    }

    #[test]
    fn state_keys_exclude_metadata() {
        let mut d = driver();
        d.set_contract("token", b"code", "alice", ContractType::User, vec![], false).unwrap();
        d.hset("token", "balances", "alice", Value::Int(100)).unwrap();
        d.set("token", "supply", Value::Int(1000)).unwrap();

        let mut keys = d.get_contract_keys("token").unwrap();
        keys.sort();
        assert_eq!(
            keys,
            vec![b"token.balances:alice".to_vec(), b"token.supply".to_vec()]
        );
    }

    #[test]
    fn delete_contract_removes_everything_under_prefix() {
        let mut d = driver();
        d.set_contract("token", b"code", "alice", ContractType::User, vec![], false).unwrap();
        d.hset("token", "balances", "alice", Value::Int(100)).unwrap();
        d.delete_contract("token").unwrap();

        assert!(!d.is_contract("token").unwrap());
        assert_eq!(d.hget("token", "balances", "alice").unwrap(), None);
    }
}
