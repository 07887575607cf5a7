//! Store collaborators: query execution, attribute lookup, and an in-memory
//! implementation used by the CLI and integration tests.

pub mod memory;
pub mod traits;

#[cfg(test)]
pub(crate) mod mock;

pub use memory::{MemoryStore, StoreSnapshot};
pub use traits::{AttributeCatalog, QueryExecutor, QueryRequest, QueryResponse, DEFAULT_QUERY_LIMIT};
