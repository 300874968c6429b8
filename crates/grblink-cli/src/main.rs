//! GrbLink operator CLI
//!
//! Opens a TCP, serial, or simulated transport, drives the engine, and
//! prints events and reports as JSON lines for scripting.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use grblink_core::demo::{DemoConfig, DemoController};
use grblink_core::jogtest::JogTestParams;
use grblink_core::link::{Link, LinkConfig, LinkEvent, LinkState};
use tokio::net::TcpStream;
use tokio_serial::SerialPortBuilderExt;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "grblink", version, about = "Drive a grblHAL controller and measure link latency")]
struct Cli {
    /// Connect over TCP, e.g. 192.168.1.50:23
    #[arg(long, global = true, conflicts_with_all = ["serial", "demo"])]
    tcp: Option<String>,

    /// Connect over a serial port, e.g. /dev/ttyUSB0
    #[arg(long, global = true, conflicts_with = "demo")]
    serial: Option<String>,

    /// Serial baud rate
    #[arg(long, global = true, default_value_t = 115_200)]
    baud: u32,

    /// Use the built-in simulated controller instead of hardware
    #[arg(long, global = true)]
    demo: bool,

    /// Heartbeat interval in milliseconds
    #[arg(long, global = true, default_value_t = 200)]
    heartbeat_ms: u64,

    /// Average-latency budget in milliseconds for the metrics verdict
    #[arg(long, global = true, default_value_t = 20.0)]
    latency_budget_ms: f64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Stream link events to stdout until interrupted
    Monitor,
    /// Run a timed jog test and print its report plus final metrics
    JogTest {
        /// Test duration in seconds
        #[arg(long, default_value_t = 10)]
        duration_secs: u64,
        /// Jog distance per move, mm
        #[arg(long, default_value_t = 2.0)]
        distance_mm: f64,
        /// Jog feed rate, mm/min
        #[arg(long, default_value_t = 500.0)]
        feed_rate: f64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = LinkConfig {
        heartbeat_interval: Duration::from_millis(cli.heartbeat_ms),
        latency_budget_ms: cli.latency_budget_ms,
        ..LinkConfig::default()
    };

    let (link, mut events) = open_link(&cli, config).await?;
    wait_until_ready(&mut events).await?;

    match cli.command {
        Command::Monitor => monitor(&mut events).await,
        Command::JogTest {
            duration_secs,
            distance_mm,
            feed_rate,
        } => {
            let params = JogTestParams {
                duration: Duration::from_secs(duration_secs),
                distance_mm,
                feed_rate,
            };
            jog_test(&link, &mut events, params).await
        }
    }
}

type LinkEvents = tokio::sync::broadcast::Receiver<LinkEvent>;

/// Open the selected transport. The returned receiver predates the session
/// task, so startup events are never dropped before `wait_until_ready`.
async fn open_link(cli: &Cli, config: LinkConfig) -> Result<(Link, LinkEvents)> {
    if cli.demo {
        info!("using simulated controller");
        return Ok(Link::connect(DemoController::spawn(DemoConfig::default()), config));
    }
    if let Some(addr) = &cli.tcp {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connecting to {addr}"))?;
        info!(%addr, "tcp transport open");
        return Ok(Link::connect(stream, config));
    }
    if let Some(port) = &cli.serial {
        let stream = tokio_serial::new(port, cli.baud)
            .open_native_async()
            .with_context(|| format!("opening serial port {port}"))?;
        info!(%port, baud = cli.baud, "serial transport open");
        return Ok(Link::connect(stream, config));
    }
    bail!("no transport: pass --tcp, --serial, or --demo");
}

/// Block until the link validates the controller, or fail with its reason.
async fn wait_until_ready(events: &mut LinkEvents) -> Result<()> {
    loop {
        match events.recv().await.context("event feed closed")? {
            LinkEvent::SessionReady(session) => {
                info!(session = %session.id, "controller ready");
                return Ok(());
            }
            LinkEvent::ConnectionError(reason) => bail!("connection failed: {reason}"),
            LinkEvent::StateChanged(LinkState::Failed) => bail!("controller validation failed"),
            _ => {}
        }
    }
}

async fn monitor(events: &mut LinkEvents) -> Result<()> {
    loop {
        tokio::select! {
            event = events.recv() => {
                let event = event.context("event feed closed")?;
                println!("{}", serde_json::to_string(&event)?);
                if matches!(
                    event,
                    LinkEvent::StateChanged(LinkState::Disconnected | LinkState::Failed)
                ) {
                    return Ok(());
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                return Ok(());
            }
        }
    }
}

async fn jog_test(link: &Link, events: &mut LinkEvents, params: JogTestParams) -> Result<()> {
    info!(
        duration_secs = params.duration.as_secs(),
        distance_mm = params.distance_mm,
        feed_rate = params.feed_rate,
        "starting jog test"
    );
    link.start_jog_test(params).await?;

    let report = loop {
        tokio::select! {
            event = events.recv() => match event.context("event feed closed")? {
                LinkEvent::JogTestFinished(report) => break report,
                LinkEvent::ConnectionError(reason) => bail!("connection lost: {reason}"),
                _ => {}
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt, stopping jog test");
                link.stop_jog_test().await?;
            }
        }
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    let metrics = link.current_metrics().await?;
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    if !metrics.meets_latency_budget {
        bail!(
            "average latency {:.2} ms exceeds budget",
            metrics.average_latency_ms
        );
    }
    link.disconnect().await;
    Ok(())
}
