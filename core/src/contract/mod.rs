pub mod driver;
pub mod metadata;

pub use driver::ContractDriver;
pub use metadata::ContractType;
