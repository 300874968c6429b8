//! Link errors

use thiserror::Error;

/// Errors surfaced at the engine's API boundary.
///
/// Mid-session protocol jitter (an unparseable status line, a correlation
/// miss) is deliberately not represented here: those are recovered locally
/// and only visible through metrics counters.
#[derive(Error, Debug)]
pub enum LinkError {
    /// The underlying transport failed.
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The link is not in the `Ready` state.
    #[error("Not connected to a controller")]
    NotConnected,

    /// The session actor has exited; this handle is stale.
    #[error("Session has shut down")]
    ChannelClosed,

    /// Only one jog test may run per session at a time.
    #[error("A jog test is already running")]
    JogTestAlreadyRunning,

    /// Stop was requested with no test in progress.
    #[error("No jog test is running")]
    JogTestNotRunning,
}
