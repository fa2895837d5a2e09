//! Process-wide tracing setup shared by the netprobe binaries.

mod tracing;

pub use self::tracing::{init, level_for_verbosity};
