//! Demo Mode - Simulated grblHAL controller for testing
//!
//! Speaks just enough of the protocol to exercise the engine without
//! hardware: answers `?` with synthesized status reports, acknowledges jog
//! commands with `ok`, and walks the machine through Jog → Idle after a
//! configurable (optionally jittered) motion time. Backed by an in-memory
//! duplex pipe, so it plugs into [`crate::link::Link::connect`] like any
//! transport.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::io::{self, DuplexStream};
use tokio::time::{self, Instant};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::debug;

use crate::protocol::LineCodec;

/// Tuning knobs for the simulated controller.
#[derive(Debug, Clone)]
pub struct DemoConfig {
    /// How long a jog keeps the machine in `Jog` before it settles to `Idle`.
    pub motion_time: Duration,
    /// Extra random motion time, 0..=this, per jog.
    pub motion_jitter_ms: u64,
    /// Simulated link latency applied before every response.
    pub response_delay: Duration,
    /// Whether to greet with a welcome banner on connect, as real firmware
    /// does.
    pub banner: bool,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            motion_time: Duration::from_millis(40),
            motion_jitter_ms: 0,
            response_delay: Duration::ZERO,
            banner: true,
        }
    }
}

/// Simulated grblHAL endpoint.
pub struct DemoController;

impl DemoController {
    /// Spawn the simulator and return the client end of its duplex pipe.
    pub fn spawn(config: DemoConfig) -> DuplexStream {
        Self::spawn_counting(config).0
    }

    /// Like [`DemoController::spawn`], but also returns a counter of `?`
    /// status queries received, so tests can assert on polling cadence.
    pub fn spawn_counting(config: DemoConfig) -> (DuplexStream, Arc<AtomicU64>) {
        let (client, server) = io::duplex(4096);
        let queries = Arc::new(AtomicU64::new(0));
        tokio::spawn(run(server, config, Arc::clone(&queries)));
        (client, queries)
    }
}

async fn run(stream: DuplexStream, config: DemoConfig, queries: Arc<AtomicU64>) {
    let (reader, writer) = io::split(stream);
    let mut lines = FramedRead::new(reader, LineCodec::new());
    let mut writer = FramedWrite::new(writer, LineCodec::new());
    let mut rng = StdRng::from_entropy();

    let mut jogging = false;
    let mut position = [0.0_f64; 3];
    let mut feed_rate = 0.0_f64;
    // Pending motion: when it completes, position shifts and state settles.
    let mut motion: Option<(Instant, f64)> = None;

    if config.banner
        && writer
            .send("GrblHAL 1.1f ['$' or '$HELP' for help]".to_string())
            .await
            .is_err()
    {
        return;
    }

    loop {
        let motion_at = motion.map(|(at, _)| at);
        tokio::select! {
            line = lines.next() => {
                let Some(Ok(line)) = line else { break };
                if !config.response_delay.is_zero() {
                    time::sleep(config.response_delay).await;
                }
                let reply = if line == "?" {
                    queries.fetch_add(1, Ordering::Relaxed);
                    let state = if jogging { "Jog" } else { "Idle" };
                    format!(
                        "<{state}|WPos:{:.3},{:.3},{:.3}|FS:{:.0},0>",
                        position[0], position[1], position[2], feed_rate
                    )
                } else if let Some(body) = line.strip_prefix("$J=") {
                    match parse_jog(body) {
                        Some((distance, feed)) => {
                            jogging = true;
                            feed_rate = feed;
                            let jitter = if config.motion_jitter_ms > 0 {
                                rng.gen_range(0..=config.motion_jitter_ms)
                            } else {
                                0
                            };
                            let done_at = Instant::now()
                                + config.motion_time
                                + Duration::from_millis(jitter);
                            motion = Some((done_at, distance));
                            "ok".to_string()
                        }
                        // Invalid jog command per the grbl error table.
                        None => "error:33".to_string(),
                    }
                } else {
                    "ok".to_string()
                };
                debug!(%line, %reply, "demo controller");
                if writer.send(reply).await.is_err() {
                    break;
                }
            }
            _ = time::sleep_until(motion_at.unwrap_or_else(Instant::now)),
                if motion_at.is_some() =>
            {
                if let Some((_, distance)) = motion.take() {
                    position[0] += distance;
                    jogging = false;
                    feed_rate = 0.0;
                }
            }
        }
    }
}

/// Pull the X distance and F feed out of a jog body like `G91 G21 X2.000 F500`.
fn parse_jog(body: &str) -> Option<(f64, f64)> {
    let mut distance = None;
    let mut feed = None;
    for word in body.split_whitespace() {
        if let Some(value) = word.strip_prefix('X') {
            distance = value.parse().ok();
        } else if let Some(value) = word.strip_prefix('F') {
            feed = value.parse().ok();
        }
    }
    Some((distance?, feed.unwrap_or(0.0)))
}
