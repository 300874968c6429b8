//! Command/response correlation
//!
//! grblHAL responses carry no request id, so the mapping from a submitted
//! command to its eventual `ok`/`error`/status response is reconstructed
//! heuristically:
//!
//! - Non-status commands execute serially on the controller, so their
//!   acknowledgements arrive strictly in submission order: resolve FIFO.
//! - Status queries are answered with minimal buffering and polled faster
//!   than the round trip, so a report is best attributed to the most recent
//!   unresolved query: resolve LIFO (configurable, see [`MatchStrategy`]).
//!
//! Send-order must equal id-order for the FIFO half to hold, which is why
//! [`CommandCorrelator::submit`] never blocks and the caller writes to the
//! transport immediately after it returns.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use super::response::Response;

/// What a submitted command is, for correlation purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    /// A `?` status query; answered by a status report, not by `ok`.
    StatusQuery,
    /// Everything else; answered by `ok` or `error:<code>`.
    Other,
}

/// How status reports are attributed to pending status queries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatchStrategy {
    /// Match the most recently submitted unresolved query (LIFO). Best
    /// approximates true round-trip latency under a polling cadence shorter
    /// than the round trip.
    #[default]
    NewestFirst,
    /// Match the oldest unresolved query (FIFO), for controllers that buffer
    /// and answer queries strictly in order.
    OldestFirst,
}

/// A command awaiting its response. Owned exclusively by the correlator from
/// submission until resolution or teardown.
#[derive(Debug, Clone)]
pub struct PendingCommand {
    /// Monotonic id; positive for foreground traffic, negative for
    /// heartbeat/background traffic.
    pub id: i64,
    /// Literal command text as written to the transport.
    pub text: String,
    /// Correlation class.
    pub kind: CommandKind,
    /// When `submit` recorded the command.
    pub submitted_at: Instant,
}

/// A pending command matched to its response.
#[derive(Debug, Clone)]
pub struct ResolvedCommand {
    /// Id assigned at submission.
    pub id: i64,
    /// Command text.
    pub text: String,
    /// Correlation class.
    pub kind: CommandKind,
    /// Round-trip time from submission to the matched response.
    pub latency: Duration,
}

/// Tracks in-flight commands and resolves inbound responses against them.
#[derive(Debug)]
pub struct CommandCorrelator {
    pending: VecDeque<PendingCommand>,
    next_id: i64,
    next_background_id: i64,
    strategy: MatchStrategy,
}

impl Default for CommandCorrelator {
    fn default() -> Self {
        Self::new(MatchStrategy::default())
    }
}

impl CommandCorrelator {
    /// Create an empty correlator with the given status-match strategy.
    pub fn new(strategy: MatchStrategy) -> Self {
        Self {
            pending: VecDeque::new(),
            next_id: 1,
            next_background_id: -1,
            strategy,
        }
    }

    /// Register a foreground command and return its id.
    ///
    /// Never blocks; the caller performs the transport write immediately
    /// after so that send-order equals id-order.
    pub fn submit(&mut self, text: impl Into<String>, kind: CommandKind) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        self.record(id, text.into(), kind);
        id
    }

    /// Register a heartbeat/background command in the negative id space, so
    /// background traffic never collides with foreground ids.
    pub fn submit_background(&mut self, text: impl Into<String>, kind: CommandKind) -> i64 {
        let id = self.next_background_id;
        self.next_background_id -= 1;
        self.record(id, text.into(), kind);
        id
    }

    fn record(&mut self, id: i64, text: String, kind: CommandKind) {
        self.pending.push_back(PendingCommand {
            id,
            text,
            kind,
            submitted_at: Instant::now(),
        });
    }

    /// Match a classified inbound line against the pending set.
    ///
    /// `ok`/`error` resolve the oldest pending non-status command; a status
    /// report resolves a pending status query per the configured strategy.
    /// `None` means no matching command was outstanding — an expected outcome
    /// (first asynchronous report after connect, heartbeats overtaken by the
    /// poller), not an error.
    pub fn resolve(&mut self, response: &Response, now: Instant) -> Option<ResolvedCommand> {
        let index = match response {
            Response::Ok | Response::Error(_) => self
                .pending
                .iter()
                .position(|cmd| cmd.kind != CommandKind::StatusQuery),
            Response::Status(_) => match self.strategy {
                MatchStrategy::NewestFirst => self
                    .pending
                    .iter()
                    .rposition(|cmd| cmd.kind == CommandKind::StatusQuery),
                MatchStrategy::OldestFirst => self
                    .pending
                    .iter()
                    .position(|cmd| cmd.kind == CommandKind::StatusQuery),
            },
            Response::Unsolicited(_) => None,
        }?;

        let cmd = self.pending.remove(index)?;
        Some(ResolvedCommand {
            id: cmd.id,
            text: cmd.text,
            kind: cmd.kind,
            latency: now.saturating_duration_since(cmd.submitted_at),
        })
    }

    /// Drop every pending command without resolution. Called on disconnect:
    /// a dropped link makes "did this command succeed" unknowable, so the
    /// entries are discarded rather than errored. Idempotent.
    pub fn discard_all(&mut self) {
        self.pending.clear();
    }

    /// Number of commands still awaiting a response.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether a specific id is still outstanding.
    pub fn is_pending(&self, id: i64) -> bool {
        self.pending.iter().any(|cmd| cmd.id == id)
    }
}
