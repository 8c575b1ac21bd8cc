//! Concrete [`Directory`](crate::Directory) implementations.
//!
//! Contains [`MemoryDirectory`] for tests and ephemeral deployments and
//! [`SqliteDirectory`] for a durable single-host store.

pub mod memory;
pub mod sqlite;

pub use memory::*;
pub use sqlite::*;
