//! Per-probe state and the arena that owns it.

pub mod arena;
pub mod state;

pub use arena::{ProbeArena, ProbeId, QueueKind};
pub use state::{ProbeState, ProtocolState, Timing, TlsSummary};
