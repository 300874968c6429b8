//! grblHAL line protocol
//!
//! Framing, classification, status parsing, and command/response correlation
//! for the grblHAL serial/WebSocket command language: a mixed stream of
//! unsolicited status reports and solicited `ok`/`error:<code>`
//! acknowledgements with no request id on the wire.

mod correlator;
mod error;
pub mod framing;
mod response;
mod status;

pub use correlator::{
    CommandCorrelator, CommandKind, MatchStrategy, PendingCommand, ResolvedCommand,
};
pub use error::LinkError;
pub use framing::{LineCodec, LineFramer};
pub use response::{ErrorCode, Response};
pub use status::{MachineState, MachineStateSnapshot};

/// The status query command.
pub const STATUS_QUERY: &str = "?";

/// Default heartbeat cadence while the link is otherwise idle.
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 200;

/// Status poll cadence during a jog test; replaces the heartbeat for the
/// duration of the run.
pub const JOG_POLL_INTERVAL_MS: u64 = 50;

/// Settling delay after an observed Jog → Idle transition before the next jog
/// is issued, to avoid re-triggering on transient state chatter.
pub const JOG_SETTLE_DELAY_MS: u64 = 100;

/// How long `Connecting` waits for a first classified line before failing.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2000;

/// Default average-latency budget for the pass/fail verdict.
pub const DEFAULT_LATENCY_BUDGET_MS: f64 = 20.0;
