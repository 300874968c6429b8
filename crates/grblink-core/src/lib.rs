//! # GrbLink Core Library
//!
//! Engine for driving grblHAL-compatible CNC controllers over a line-oriented
//! duplex byte stream (serial, TCP, or WebSocket-framed text).
//!
//! This library provides:
//! - Line framing and response classification for the grblHAL protocol
//! - Heuristic command/response correlation and per-command latency
//!   measurement (the wire protocol carries no request ids)
//! - A periodic status heartbeat that stays out of the way of test traffic
//! - A self-paced jog test that measures jog-to-idle responsiveness
//! - Rolling latency metrics with a pass/fail budget verdict
//! - Connection lifecycle management with full teardown on disconnect
//!
//! The physical transport is an external collaborator: anything implementing
//! `AsyncRead + AsyncWrite` can back a [`link::Link`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use grblink_core::prelude::*;
//!
//! let stream = tokio::net::TcpStream::connect("192.168.1.50:23").await?;
//! let (link, mut events) = Link::connect(stream, LinkConfig::default());
//!
//! link.start_jog_test(JogTestParams {
//!     duration: std::time::Duration::from_secs(10),
//!     distance_mm: 2.0,
//!     feed_rate: 500.0,
//! })
//! .await?;
//! ```

#![warn(missing_docs)]

pub mod demo;
pub mod jogtest;
pub mod link;
pub mod metrics;
pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::demo::{DemoConfig, DemoController};
    pub use crate::jogtest::{JogTestParams, JogTestReport, JogTransition};
    pub use crate::link::{ConnectionSession, Link, LinkConfig, LinkEvent, LinkState};
    pub use crate::metrics::{LatencyMeasurement, MetricsReport};
    pub use crate::protocol::{
        CommandKind, ErrorCode, LinkError, MachineState, MachineStateSnapshot, MatchStrategy,
        Response,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
