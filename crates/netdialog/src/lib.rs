//! netdialog - protocol state machines for the netprobe engine.
//!
//! Everything in this crate is sans-IO: callers own the sockets and feed
//! bytes in, then ask what the conversation wants to do next. That keeps
//! the decoders testable without a network and lets the service drive
//! hundreds of them from one reactor.
//!
//! - [`script`]: the `SEND`/`EXPECT`/`READ`/`READALL`/`CLOSE` micro-language
//! - [`dialog`]: the scripted conversation with Telnet and HTTP overlays
//! - [`http`]: response decoding (chunked, content-length, 100-continue)
//!   and request construction
//! - [`ntp`]: client packets, offset math and the trimmed average
//! - [`dns`]: query-set parsing and the failure taxonomy

pub mod dialog;
pub mod dns;
pub mod http;
pub mod ntp;
pub mod outcome;
pub mod script;
pub mod telnet;

pub use dialog::{Dialog, Intent, Transcript};
pub use outcome::Outcome;
pub use script::{Instruction, Script, ScriptError};

/// Version string advertised in outgoing HTTP requests.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
