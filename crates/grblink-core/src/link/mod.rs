//! Connection lifecycle and the public engine handle
//!
//! A [`Link`] owns exactly one session over one transport. Constructing a
//! link spawns the session actor; dropping every handle (or calling
//! [`Link::disconnect`]) tears it down, which discards all pending commands,
//! stops both pollers, and cancels any running jog test with a partial
//! report. Reconnection is a new `Link`, so sessions can never overlap.

mod session;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

use crate::jogtest::{JogTestParams, JogTestReport};
use crate::metrics::MetricsReport;
use crate::protocol::{
    ErrorCode, LinkError, MachineStateSnapshot, MatchStrategy, DEFAULT_CONNECT_TIMEOUT_MS,
    DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_LATENCY_BUDGET_MS, JOG_POLL_INTERVAL_MS,
};

/// Lifecycle states of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    /// No session, or the session has been torn down.
    Disconnected,
    /// Transport is open; waiting for the first classified line to prove the
    /// remote end speaks the protocol (a socket can open against anything).
    Connecting,
    /// Validated and processing traffic.
    Ready,
    /// Validation failed (connect timeout before any classified line).
    Failed,
}

/// Session identity reported once the link reaches `Ready`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSession {
    /// Unique id for this session.
    pub id: Uuid,
    /// When the first classified line was seen.
    pub connected_at: DateTime<Utc>,
}

/// Link configuration.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Heartbeat cadence while idle and connected.
    pub heartbeat_interval: Duration,
    /// Status poll cadence during a jog test.
    pub jog_poll_interval: Duration,
    /// How long `Connecting` waits for a first classified line.
    pub connect_timeout: Duration,
    /// Average-latency budget for the metrics verdict, ms.
    pub latency_budget_ms: f64,
    /// Status-report correlation strategy.
    pub match_strategy: MatchStrategy,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(DEFAULT_HEARTBEAT_INTERVAL_MS),
            jog_poll_interval: Duration::from_millis(JOG_POLL_INTERVAL_MS),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            latency_budget_ms: DEFAULT_LATENCY_BUDGET_MS,
            match_strategy: MatchStrategy::default(),
        }
    }
}

/// Events emitted on the link's broadcast feed.
///
/// Mid-session anomalies (a single unparseable line, a correlation miss) are
/// deliberately absent: they are visible only through metrics counters, so
/// expected protocol jitter does not flood subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LinkEvent {
    /// Lifecycle transition.
    StateChanged(LinkState),
    /// First classified line observed; the link is validated.
    SessionReady(ConnectionSession),
    /// A status report parsed into a snapshot.
    Status(MachineStateSnapshot),
    /// A command matched an `ok` or a status report.
    CommandResolved {
        /// Id returned at submission.
        id: i64,
        /// Command text.
        text: String,
        /// Round-trip latency, ms.
        latency_ms: f64,
    },
    /// A command matched an `error:<code>` line.
    CommandFailed {
        /// Id returned at submission.
        id: i64,
        /// Command text.
        text: String,
        /// Controller error code.
        code: ErrorCode,
        /// Round-trip latency, ms.
        latency_ms: f64,
    },
    /// A line that was neither acknowledgement nor status report.
    UnsolicitedLine(String),
    /// A jog test finished, stopped, or was cancelled.
    JogTestFinished(JogTestReport),
    /// Terminal failure with a human-readable reason.
    ConnectionError(String),
}

/// Control messages from handles to the session actor.
pub(crate) enum Control {
    Submit {
        text: String,
        reply: oneshot::Sender<Result<i64, LinkError>>,
    },
    StartJogTest {
        params: JogTestParams,
        reply: oneshot::Sender<Result<(), LinkError>>,
    },
    StopJogTest {
        reply: oneshot::Sender<Result<(), LinkError>>,
    },
    Metrics {
        reply: oneshot::Sender<MetricsReport>,
    },
    MachineState {
        reply: oneshot::Sender<Option<MachineStateSnapshot>>,
    },
    State {
        reply: oneshot::Sender<LinkState>,
    },
    Disconnect,
}

/// Handle to a running session. Cheap to clone; all interaction is
/// message-passing onto the session's serialized event loop.
#[derive(Clone)]
pub struct Link {
    control: mpsc::Sender<Control>,
    events: broadcast::Sender<LinkEvent>,
}

impl Link {
    /// Spawn a session over an already-connected duplex byte stream.
    ///
    /// The transport is assumed ordered; framing, validation, heartbeating,
    /// and teardown are handled by the session actor.
    ///
    /// Returns the handle together with an event receiver that was subscribed
    /// before the session task started, so startup events (`Connecting`,
    /// `SessionReady`, an early `ConnectionError`) cannot be missed. The
    /// broadcast feed does not replay: receivers from [`Link::subscribe`]
    /// only observe events emitted after they were created.
    pub fn connect<T>(transport: T, config: LinkConfig) -> (Link, broadcast::Receiver<LinkEvent>)
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (control_tx, control_rx) = mpsc::channel(64);
        let (events_tx, events_rx) = broadcast::channel(256);
        tokio::spawn(session::run(transport, config, control_rx, events_tx.clone()));
        (
            Link {
                control: control_tx,
                events: events_tx,
            },
            events_rx,
        )
    }

    /// Subscribe an additional receiver to the event feed. Sees only events
    /// emitted from this point on; use the receiver returned by
    /// [`Link::connect`] when startup events matter.
    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.events.subscribe()
    }

    /// Submit a command line for transmission; returns its correlation id.
    ///
    /// The session writes the text (newline-terminated) to the transport
    /// immediately after registering it, preserving send-order = id-order.
    pub async fn submit_command(&self, text: impl Into<String>) -> Result<i64, LinkError> {
        let (reply, rx) = oneshot::channel();
        self.send(Control::Submit {
            text: text.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| LinkError::ChannelClosed)?
    }

    /// Start a timed jog test. Fails if one is already running or the link is
    /// not ready.
    pub async fn start_jog_test(&self, params: JogTestParams) -> Result<(), LinkError> {
        let (reply, rx) = oneshot::channel();
        self.send(Control::StartJogTest { params, reply }).await?;
        rx.await.map_err(|_| LinkError::ChannelClosed)?
    }

    /// Cancel a running jog test; its partial report is emitted as a
    /// [`LinkEvent::JogTestFinished`].
    pub async fn stop_jog_test(&self) -> Result<(), LinkError> {
        let (reply, rx) = oneshot::channel();
        self.send(Control::StopJogTest { reply }).await?;
        rx.await.map_err(|_| LinkError::ChannelClosed)?
    }

    /// Current latency/throughput metrics.
    pub async fn current_metrics(&self) -> Result<MetricsReport, LinkError> {
        let (reply, rx) = oneshot::channel();
        self.send(Control::Metrics { reply }).await?;
        rx.await.map_err(|_| LinkError::ChannelClosed)
    }

    /// Most recent machine-state snapshot, if any report has arrived.
    pub async fn machine_state(&self) -> Result<Option<MachineStateSnapshot>, LinkError> {
        let (reply, rx) = oneshot::channel();
        self.send(Control::MachineState { reply }).await?;
        rx.await.map_err(|_| LinkError::ChannelClosed)
    }

    /// Current lifecycle state. `Disconnected` once the session has exited.
    pub async fn state(&self) -> LinkState {
        let (reply, rx) = oneshot::channel();
        if self.send(Control::State { reply }).await.is_err() {
            return LinkState::Disconnected;
        }
        rx.await.unwrap_or(LinkState::Disconnected)
    }

    /// Tear the session down: stop timers, discard pending commands, cancel
    /// any running jog test with a partial report.
    pub async fn disconnect(&self) {
        let _ = self.control.send(Control::Disconnect).await;
    }

    async fn send(&self, msg: Control) -> Result<(), LinkError> {
        self.control
            .send(msg)
            .await
            .map_err(|_| LinkError::ChannelClosed)
    }
}
