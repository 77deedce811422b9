pub mod connection;
pub mod file_status;
pub mod schema;
pub mod vectors;

pub use connection::{DbError, Result, SCHEMA_VERSION, SearchDb};
pub use vectors::StoreStats;
