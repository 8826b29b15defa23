//! Message types for actor communication.

use ractor::RpcReplyPort;

/// Messages for the WorkerActor.
#[derive(Debug)]
pub enum WorkerMessage {
    /// Take the next delivery from the queue and process it.
    Poll,
}

/// Messages for the PoolSupervisor.
#[derive(Debug)]
pub enum SupervisorMessage {
    /// Periodic tick: run the claim-timeout sweep.
    Tick,

    /// The cancellation token fired; stop once every unit has exited.
    Drain,

    /// Number of live units.
    UnitCount { reply: RpcReplyPort<usize> },
}
