//! State stores and the broker queue.
//!
//! This crate provides the in-process state store, a SurrealDB state store
//! shared by every process of a deployment, and a durable work queue kept
//! in the same database.
//!
//! # Features
//!
//! - `memory` (default): In-memory SurrealDB for tests and standalone use
//! - `remote` (default): Connect to a SurrealDB server over WebSocket
//! - `rocksdb`: Use RocksDB for persistent file-based storage

mod broker;
mod connection;
mod memory;
mod schema;
mod state_store;
pub mod repositories;

pub use broker::{BrokerConfig, DEFAULT_QUEUE, SurrealQueue};
pub use connection::{Database, DbConfig, DbError, connect};
pub use memory::MemoryStateStore;
pub use schema::{init_queue_schema, init_state_schema};
pub use state_store::SurrealStateStore;
