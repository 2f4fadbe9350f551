//! Persistence for the operation log, snapshot slots and vector clock.

pub mod traits;
pub mod memory;
pub mod sql;

pub use memory::InMemoryLogStore;
pub use sql::SqliteLogStore;
pub use traits::{EntryPredicate, LogStore, StorageError};
