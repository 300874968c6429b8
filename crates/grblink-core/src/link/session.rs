//! The per-connection session actor
//!
//! One task owns the transport, the correlator, the metrics window, the
//! latest snapshot, and any running jog test. Every inbound line and every
//! timer callback is serialized onto this loop, so no engine state needs
//! locking; handles interact purely through the control channel and the
//! broadcast event feed.

use std::time::Instant;

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::io::{self, AsyncRead, AsyncWrite, WriteHalf};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ConnectionSession, Control, LinkConfig, LinkEvent, LinkState};
use crate::jogtest::{JogAction, JogTest, JogTestReport};
use crate::metrics::MetricsAggregator;
use crate::protocol::{
    CommandCorrelator, CommandKind, LineCodec, LinkError, MachineStateSnapshot, Response,
    STATUS_QUERY,
};

pub(crate) async fn run<T>(
    transport: T,
    config: LinkConfig,
    mut control: mpsc::Receiver<Control>,
    events: broadcast::Sender<LinkEvent>,
) where
    T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (reader, writer) = io::split(transport);
    let mut lines = FramedRead::new(reader, LineCodec::new());
    let mut session = Session::new(&config, events, writer);

    session.set_state(LinkState::Connecting);
    // Probe the endpoint: a mute controller still gets asked to speak, and a
    // non-protocol endpoint gets the connect timeout.
    if let Err(e) = session.send_status_query().await {
        session
            .teardown(LinkState::Failed, Some(format!("probe write failed: {e}")))
            .await;
        return;
    }

    let mut heartbeat = time::interval(config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut jog_poll = time::interval(config.jog_poll_interval);
    jog_poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let connect_deadline = time::sleep(config.connect_timeout);
    tokio::pin!(connect_deadline);

    let (exit_state, reason) = loop {
        // Arming one poller disarms the other atomically with respect to this
        // loop: the guards below are re-evaluated on every iteration.
        let settle_at = session.settle_deadline();
        tokio::select! {
            msg = control.recv() => match msg {
                None | Some(Control::Disconnect) => {
                    break (LinkState::Disconnected, None);
                }
                Some(msg) => {
                    if let Err(e) = session.handle_control(msg).await {
                        break (
                            LinkState::Disconnected,
                            Some(format!("transport write failed: {e}")),
                        );
                    }
                }
            },
            line = lines.next() => match line {
                Some(Ok(line)) => session.handle_line(line),
                Some(Err(e)) => {
                    break (
                        LinkState::Disconnected,
                        Some(format!("transport read failed: {e}")),
                    );
                }
                None => {
                    break (
                        LinkState::Disconnected,
                        Some("stream closed by remote end".to_string()),
                    );
                }
            },
            _ = heartbeat.tick(), if session.heartbeat_active() => {
                if let Err(e) = session.send_status_query().await {
                    break (
                        LinkState::Disconnected,
                        Some(format!("transport write failed: {e}")),
                    );
                }
            }
            _ = jog_poll.tick(), if session.jog_poll_active() => {
                if let Err(e) = session.on_jog_poll().await {
                    break (
                        LinkState::Disconnected,
                        Some(format!("transport write failed: {e}")),
                    );
                }
            }
            _ = time::sleep_until(settle_at.unwrap_or_else(time::Instant::now)),
                if settle_at.is_some() =>
            {
                if let Err(e) = session.on_settle_elapsed().await {
                    break (
                        LinkState::Disconnected,
                        Some(format!("transport write failed: {e}")),
                    );
                }
            }
            _ = &mut connect_deadline, if session.is_connecting() => {
                break (
                    LinkState::Failed,
                    Some("no classified response from controller within connect timeout".to_string()),
                );
            }
        }
    };

    session.teardown(exit_state, reason).await;
}

/// All per-session engine state, owned by the event loop.
struct Session<T> {
    events: broadcast::Sender<LinkEvent>,
    writer: FramedWrite<WriteHalf<T>, LineCodec>,
    state: LinkState,
    correlator: CommandCorrelator,
    metrics: MetricsAggregator,
    jog: Option<JogTest>,
    snapshot: Option<MachineStateSnapshot>,
}

impl<T: AsyncRead + AsyncWrite> Session<T> {
    fn new(
        config: &LinkConfig,
        events: broadcast::Sender<LinkEvent>,
        writer: WriteHalf<T>,
    ) -> Session<T> {
        Session {
            correlator: CommandCorrelator::new(config.match_strategy),
            metrics: MetricsAggregator::new(config.latency_budget_ms),
            events,
            writer: FramedWrite::new(writer, LineCodec::new()),
            state: LinkState::Disconnected,
            jog: None,
            snapshot: None,
        }
    }

    fn is_connecting(&self) -> bool {
        self.state == LinkState::Connecting
    }

    fn heartbeat_active(&self) -> bool {
        self.state == LinkState::Ready && self.jog.is_none()
    }

    fn jog_poll_active(&self) -> bool {
        self.state == LinkState::Ready && self.jog.is_some()
    }

    fn settle_deadline(&self) -> Option<time::Instant> {
        self.jog
            .as_ref()
            .and_then(|jog| jog.settle_deadline())
            .map(time::Instant::from_std)
    }

    fn set_state(&mut self, state: LinkState) {
        if self.state == state {
            return;
        }
        info!(from = ?self.state, to = ?state, "link state changed");
        self.state = state;
        self.emit(LinkEvent::StateChanged(state));
    }

    fn emit(&self, event: LinkEvent) {
        // No subscribers is fine; the feed is optional for callers.
        let _ = self.events.send(event);
    }

    /// Process one framed inbound line: promote out of `Connecting`,
    /// correlate, record metrics, and update the machine snapshot.
    fn handle_line(&mut self, line: String) {
        let now = Instant::now();
        self.metrics.count_message();

        if self.state == LinkState::Connecting {
            // Only a line that classifies proves a protocol-speaking
            // endpoint; socket-open alone does not.
            let session = ConnectionSession {
                id: Uuid::new_v4(),
                connected_at: Utc::now(),
            };
            info!(session = %session.id, "controller validated");
            self.set_state(LinkState::Ready);
            self.emit(LinkEvent::SessionReady(session));
        }

        let response = Response::classify(&line);
        match self.correlator.resolve(&response, now) {
            Some(resolved) => {
                self.metrics.record(&resolved, now);
                let latency_ms = resolved.latency.as_secs_f64() * 1000.0;
                debug!(id = resolved.id, latency_ms, "command resolved");
                match &response {
                    Response::Error(code) => self.emit(LinkEvent::CommandFailed {
                        id: resolved.id,
                        text: resolved.text,
                        code: code.clone(),
                        latency_ms,
                    }),
                    _ => self.emit(LinkEvent::CommandResolved {
                        id: resolved.id,
                        text: resolved.text,
                        latency_ms,
                    }),
                }
            }
            None if !matches!(response, Response::Unsolicited(_)) => {
                // Expected under normal operation: the first asynchronous
                // report after connect, or heartbeats overtaken by the
                // poller. Counted, never surfaced as an error.
                debug!(%line, "response matched no pending command");
                self.metrics.count_correlation_miss();
            }
            None => {}
        }

        match response {
            Response::Status(raw) => match MachineStateSnapshot::parse(&raw) {
                Some(snapshot) => {
                    if let Some(jog) = &mut self.jog {
                        jog.observe(&snapshot, now);
                    }
                    self.emit(LinkEvent::Status(snapshot.clone()));
                    self.snapshot = Some(snapshot);
                }
                None => {
                    warn!(%raw, "status report with no parseable state, discarded");
                    self.metrics.count_parse_anomaly();
                }
            },
            Response::Unsolicited(text) => {
                self.metrics.count_unsolicited();
                self.emit(LinkEvent::UnsolicitedLine(text));
            }
            Response::Ok | Response::Error(_) => {}
        }
    }

    async fn handle_control(&mut self, msg: Control) -> io::Result<()> {
        match msg {
            Control::Submit { text, reply } => {
                if self.state != LinkState::Ready {
                    let _ = reply.send(Err(LinkError::NotConnected));
                    return Ok(());
                }
                let kind = if text.trim() == STATUS_QUERY {
                    CommandKind::StatusQuery
                } else {
                    CommandKind::Other
                };
                let id = self.correlator.submit(text.clone(), kind);
                // Registration and the write happen back-to-back with nothing
                // interleaved, keeping id-order equal to send-order.
                match self.writer.send(text).await {
                    Ok(()) => {
                        let _ = reply.send(Ok(id));
                        Ok(())
                    }
                    Err(e) => {
                        let _ = reply.send(Err(LinkError::Transport(io::Error::new(
                            e.kind(),
                            e.to_string(),
                        ))));
                        Err(e)
                    }
                }
            }
            Control::StartJogTest { params, reply } => {
                if self.state != LinkState::Ready {
                    let _ = reply.send(Err(LinkError::NotConnected));
                    return Ok(());
                }
                if self.jog.is_some() {
                    let _ = reply.send(Err(LinkError::JogTestAlreadyRunning));
                    return Ok(());
                }
                info!(?params, "jog test started");
                let (test, first) = JogTest::start(params, Instant::now());
                // Setting `jog` suspends the heartbeat and arms the 50 ms
                // poller via the loop guards.
                self.jog = Some(test);
                let result = self.apply_jog_action(first).await;
                let _ = reply.send(Ok(()));
                result
            }
            Control::StopJogTest { reply } => {
                match self.jog.take() {
                    None => {
                        let _ = reply.send(Err(LinkError::JogTestNotRunning));
                    }
                    Some(mut jog) => {
                        let report = jog.cancel(Instant::now());
                        self.finish_jog_test(report);
                        let _ = reply.send(Ok(()));
                    }
                }
                Ok(())
            }
            Control::Metrics { reply } => {
                let _ = reply.send(self.metrics.report(Instant::now()));
                Ok(())
            }
            Control::MachineState { reply } => {
                let _ = reply.send(self.snapshot.clone());
                Ok(())
            }
            Control::State { reply } => {
                let _ = reply.send(self.state);
                Ok(())
            }
            // Handled by the run loop before dispatch.
            Control::Disconnect => Ok(()),
        }
    }

    /// Heartbeat tick and jog-test poll both reduce to this: register a
    /// background status query and write it immediately.
    async fn send_status_query(&mut self) -> io::Result<()> {
        self.correlator
            .submit_background(STATUS_QUERY, CommandKind::StatusQuery);
        self.writer.send(STATUS_QUERY.to_string()).await
    }

    async fn on_jog_poll(&mut self) -> io::Result<()> {
        let now = Instant::now();
        if let Some(report) = self.jog.as_mut().and_then(|jog| jog.on_poll_tick(now)) {
            self.jog = None;
            self.finish_jog_test(report);
            return Ok(());
        }
        self.send_status_query().await
    }

    async fn on_settle_elapsed(&mut self) -> io::Result<()> {
        let Some(jog) = self.jog.as_mut() else {
            return Ok(());
        };
        let action = jog.on_settle_elapsed(Instant::now());
        self.apply_jog_action(action).await
    }

    async fn apply_jog_action(&mut self, action: JogAction) -> io::Result<()> {
        match action {
            JogAction::SendJog(text) => {
                let id = self.correlator.submit(text.clone(), CommandKind::Other);
                debug!(id, %text, "jog issued");
                self.writer.send(text).await
            }
            JogAction::Finish(report) => {
                self.jog = None;
                self.finish_jog_test(report);
                Ok(())
            }
        }
    }

    fn finish_jog_test(&mut self, report: JogTestReport) {
        info!(
            jogs = report.jog_count,
            transitions = report.transitions.len(),
            cancelled = report.cancelled,
            "jog test finished"
        );
        // The heartbeat resumes on the next loop iteration now that `jog` is
        // cleared.
        self.emit(LinkEvent::JogTestFinished(report));
    }

    /// Full teardown: cancel any running jog test with a partial report,
    /// discard every pending command, and report the terminal state. Runs on
    /// every exit path, so a later connection starts from a clean slate.
    async fn teardown(mut self, final_state: LinkState, reason: Option<String>) {
        if let Some(mut jog) = self.jog.take() {
            let report = jog.cancel(Instant::now());
            self.finish_jog_test(report);
        }
        self.correlator.discard_all();
        if let Some(reason) = reason {
            warn!(%reason, "session ended");
            self.emit(LinkEvent::ConnectionError(reason));
        }
        self.set_state(final_state);
        let _ = self.writer.close().await;
    }
}
