use crate::event::Timestamp;
use crate::snapshot::ConnectionSnapshot;
use crate::units::UnitFormat;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of ring slots per report channel.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 700;

/// Default number of combined-snapshot slots per multi-stream coordinator.
pub const DEFAULT_MULTI_SLOTS: usize = 5;

/// Default bound on the aggregator's idle wait while channels are registered.
pub const DEFAULT_IDLE_WAIT: Duration = Duration::from_millis(10);

/// Transport protocol of the measured traffic.
///
/// UDP receivers report jitter, loss and out-of-order counts; everything
/// else reports bytes and throughput only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    /// Transmission Control Protocol - provides reliable, ordered delivery
    Tcp,
    /// User Datagram Protocol - provides best-effort delivery with lower overhead
    Udp,
}

/// Which side of the transfer a report describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Sending side; bytes are counted when they are sent
    Client,
    /// Receiving side of one connection
    Server,
    /// Accepting socket; only appears in settings reports
    Listener,
}

impl Role {
    pub fn is_receiver(&self) -> bool {
        !matches!(self, Role::Client)
    }
}

/// Output style, resolved to a formatter from the reporter's registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReportStyle {
    /// Human-readable iperf-style text
    Default,
    /// One comma-separated line per report
    Csv,
    /// One JSON object per line
    Json,
}

impl ReportStyle {
    pub const ALL: [ReportStyle; 3] = [ReportStyle::Default, ReportStyle::Csv, ReportStyle::Json];
}

/// Who runs the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Driver {
    /// A dedicated reporter thread drains all channels
    Background,
    /// Every publish drains its own channel on the traffic thread
    Inline,
    /// Nobody drains until the caller invokes `Reporter::run_pass`
    External,
}

/// Configuration for one report channel (one traffic stream).
///
/// Use the builder methods to customize the configuration; values are
/// checked by [`ReportConfig::validate`] when the channel is created.
///
/// # Examples
///
/// ## UDP receiver with one-second intervals
///
/// ```
/// use rperf_reporter::{Protocol, ReportConfig, Role};
/// use std::time::Duration;
///
/// let config = ReportConfig::new(3)
///     .with_protocol(Protocol::Udp)
///     .with_role(Role::Server)
///     .with_interval(Duration::from_secs(1));
///
/// assert!(config.validate().is_ok());
/// ```
///
/// ## CSV output with a fixed unit
///
/// ```
/// use rperf_reporter::{ReportConfig, ReportStyle, UnitFormat};
///
/// let config = ReportConfig::new(4)
///     .with_style(ReportStyle::Csv)
///     .with_unit_format(UnitFormat::MegaBits);
/// assert_eq!(config.style, ReportStyle::Csv);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportConfig {
    /// Identifier printed in the `[ ID]` column (usually the socket number)
    pub transfer_id: i32,

    /// Protocol of the measured traffic
    pub protocol: Protocol,

    /// Sending or receiving side
    pub role: Role,

    /// Interval for periodic reports; `None` reports only the final result
    pub interval: Option<Duration>,

    /// Number of ring slots between the traffic thread and the reporter
    pub capacity: usize,

    /// Output style of this channel's reports
    pub style: ReportStyle,

    /// Unit used for transfer and bandwidth columns
    pub unit_format: UnitFormat,

    /// Connection to announce before the first transfer line
    pub connection: Option<ConnectionSnapshot>,

    /// Start of a standalone stream; defaults to the channel's creation
    /// time. Ignored for multi-stream members, which use the group's start.
    pub start_time: Option<Timestamp>,

    /// TCP maximum segment size to print after the final report, 0 if the
    /// socket could not report it; `None` prints nothing
    pub mss: Option<u32>,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            transfer_id: 0,
            protocol: Protocol::Tcp,
            role: Role::Client,
            interval: None,
            capacity: DEFAULT_CHANNEL_CAPACITY,
            style: ReportStyle::Default,
            unit_format: UnitFormat::default(),
            connection: None,
            start_time: None,
            mss: None,
        }
    }
}

impl ReportConfig {
    /// Creates a configuration for the given transfer id with default values.
    pub fn new(transfer_id: i32) -> Self {
        Self {
            transfer_id,
            ..Default::default()
        }
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }

    /// Sets the interval for periodic reporting.
    ///
    /// Deadlines advance by exactly this amount, one interval at a time.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Sets the ring capacity (default: 700 slots).
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_style(mut self, style: ReportStyle) -> Self {
        self.style = style;
        self
    }

    pub fn with_unit_format(mut self, unit_format: UnitFormat) -> Self {
        self.unit_format = unit_format;
        self
    }

    /// Attaches a connection report that is printed before any statistics.
    pub fn with_connection(mut self, connection: ConnectionSnapshot) -> Self {
        self.connection = Some(connection);
        self
    }

    pub fn with_start_time(mut self, start_time: Timestamp) -> Self {
        self.start_time = Some(start_time);
        self
    }

    /// Prints the MSS/MTU line after a TCP stream's final report.
    pub fn with_mss(mut self, mss: u32) -> Self {
        self.mss = Some(mss);
        self
    }

    /// Rejects values the reporter cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if:
    /// - the capacity is below 2 slots
    /// - the interval is zero
    pub fn validate(&self) -> Result<()> {
        if self.capacity < 2 {
            return Err(Error::Config(format!(
                "channel capacity must be at least 2 slots, got {}",
                self.capacity
            )));
        }
        if self.interval == Some(Duration::ZERO) {
            return Err(Error::Config("report interval must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Options of the reporting subsystem itself.
///
/// # Examples
///
/// ```
/// use rperf_reporter::{Driver, ReporterOptions};
/// use std::time::Duration;
///
/// let options = ReporterOptions::new()
///     .with_driver(Driver::Inline)
///     .with_idle_wait(Duration::from_millis(5));
/// assert!(options.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReporterOptions {
    /// Who runs the aggregator
    pub driver: Driver,

    /// Upper bound of the aggregator's wait when channels exist but are idle
    pub idle_wait: Duration,

    /// Combined-snapshot slots per coordinator
    pub multi_slots: usize,
}

impl Default for ReporterOptions {
    fn default() -> Self {
        Self {
            driver: Driver::Background,
            idle_wait: DEFAULT_IDLE_WAIT,
            multi_slots: DEFAULT_MULTI_SLOTS,
        }
    }
}

impl ReporterOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_driver(mut self, driver: Driver) -> Self {
        self.driver = driver;
        self
    }

    pub fn with_idle_wait(mut self, idle_wait: Duration) -> Self {
        self.idle_wait = idle_wait;
        self
    }

    pub fn with_multi_slots(mut self, multi_slots: usize) -> Self {
        self.multi_slots = multi_slots;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.idle_wait.is_zero() {
            return Err(Error::Config("idle wait must be non-zero".to_string()));
        }
        if self.multi_slots == 0 {
            return Err(Error::Config("at least one multi-stream slot is required".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ReportConfig::default();
        assert_eq!(config.capacity, DEFAULT_CHANNEL_CAPACITY);
        assert_eq!(config.protocol, Protocol::Tcp);
        assert_eq!(config.role, Role::Client);
        assert!(config.interval.is_none());
        assert!(config.validate().is_ok());

        let options = ReporterOptions::default();
        assert_eq!(options.driver, Driver::Background);
        assert_eq!(options.multi_slots, DEFAULT_MULTI_SLOTS);
    }

    #[test]
    fn test_rejects_tiny_capacity() {
        let err = ReportConfig::new(1).with_capacity(1).validate().unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_rejects_zero_interval() {
        let result = ReportConfig::new(1).with_interval(Duration::ZERO).validate();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_options_validation() {
        assert!(ReporterOptions::new().with_idle_wait(Duration::ZERO).validate().is_err());
        assert!(ReporterOptions::new().with_multi_slots(0).validate().is_err());
    }

    #[test]
    fn test_role_sides() {
        assert!(!Role::Client.is_receiver());
        assert!(Role::Server.is_receiver());
        assert!(Role::Listener.is_receiver());
    }
}
