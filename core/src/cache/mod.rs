pub mod driver;
pub mod tracer;

pub use driver::{CacheDriver, CacheSnapshot};
pub use tracer::Tracer;
