//! rperf-reporter - the statistics reporting engine of a network
//! throughput and latency tester
//!
//! Traffic threads hand one [`PacketEvent`](event::PacketEvent) per send or
//! receive to a [`ChannelHandle`]. A single consumer drains every channel,
//! keeps running statistics (throughput, RFC 1889 jitter, loss and
//! reordering) and prints interval and final reports through the formatter
//! of each channel's [`ReportStyle`].
//!
//! # Features
//!
//! - Lock-free single-producer ring per stream; producers never drop events
//! - Drift-free interval reports
//! - Multi-stream groups with a start barrier and `[SUM]` lines
//! - Default (iperf text), CSV and JSON line output, or your own formatter
//! - Background, inline or caller-driven aggregation

mod aggregator;
pub mod channel;
pub mod config;
pub mod error;
pub mod event;
pub mod formatter;
pub mod multi;
pub mod report_csv;
pub mod report_default;
pub mod report_json;
pub mod reporter;
mod ring;
pub mod snapshot;
pub mod stats;
pub mod sync;
pub mod units;

pub use aggregator::ReportId;
pub use channel::ChannelHandle;
pub use config::{Driver, Protocol, ReportConfig, ReportStyle, ReporterOptions, Role};
pub use error::{Error, Result};
pub use formatter::{CallbackFormatter, ReportCallback, ReportEvent, ReportFormatter};
pub use multi::{Coordinator, StartMode};
pub use reporter::Reporter;
pub use snapshot::{CombinedSnapshot, ConnectionSnapshot, SettingsSnapshot, SnapshotKind, TransferSnapshot};
pub use units::UnitFormat;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
