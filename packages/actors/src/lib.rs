//! Worker pool for the analysis job orchestrator.
//!
//! This crate provides the Ractor-based worker pool, the analysis engine
//! seam and the in-process channel queue.
//!
//! # Architecture
//!
//! - `PoolSupervisor` - Owns the worker units, restarts crashed ones and runs
//!   the claim-timeout sweep
//! - `WorkerActor` - Dequeues, claims and executes one work item at a time
//! - `ChannelQueue` - At-least-once `WorkQueue` for a single process
//!
//! # Usage
//!
//! ```ignore
//! use actors::{Backends, EngineRegistry, start_worker_pool};
//!
//! let pool = start_worker_pool(backends, engines, config).await?;
//! let mut events = pool.subscribe();
//! // ...
//! pool.shutdown().await?;
//! ```

mod channel_queue;
mod engine;
mod messages;
mod pool;
mod retry;
mod supervisor;
mod worker_actor;

pub use channel_queue::ChannelQueue;
pub use engine::{
    AnalysisEngine, AnalysisRequest, CommandEngine, EngineFuture, EngineOutput, EngineRegistry,
    EngineResult, FnEngine,
};
pub use messages::{SupervisorMessage, WorkerMessage};
pub use pool::{
    Backends, PoolContext, PoolError, WorkerPool, start_worker_pool, start_worker_pool_with_cancel,
};
pub use retry::RetryPolicy;
pub use supervisor::PoolSupervisor;
pub use worker_actor::{InFlight, Slot, WorkerActor};

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef};
