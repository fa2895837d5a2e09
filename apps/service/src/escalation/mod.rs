//! Turning raw probe results into reported severities.

pub mod board;
pub mod counters;
pub mod deps;
pub mod policy;
pub mod severity;

pub use board::StatusBoard;
pub use counters::{FailureCounter, Thresholds};
pub use deps::{Upstream, parse_depends};
pub use policy::{Assessment, EscalationPolicy, EscalationSpec, Verdict};
pub use severity::Severity;
