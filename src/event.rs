//! Packet events handed from traffic threads to the reporter.
//!
//! Every send or receive on a traffic thread produces one [`PacketEvent`].
//! For UDP an event stands for one datagram and carries its sequence number
//! and send timestamp, which is what jitter and loss detection work from.
//! For TCP an event stands for one buffer flush and carries only bytes
//! (sequence id `0`).
//!
//! # Examples
//!
//! ```
//! use rperf_reporter::event::{PacketEvent, Timestamp};
//!
//! let sent = Timestamp::from_micros(1_000_000);
//! let arrived = Timestamp::from_micros(1_010_000);
//!
//! let event = PacketEvent::datagram(7, 1470, sent, arrived);
//! assert_eq!(event.transit_seconds(), 0.01);
//! assert!(!event.is_terminal());
//! ```

use serde::{Deserialize, Serialize};
use std::ops::Add;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Sequence id carried by the terminal event of a stream.
pub const END_OF_STREAM: i64 = -1;

/// Wall-clock instant in microseconds since the UNIX epoch.
///
/// Signed so that transit times computed from two unsynchronised hosts can
/// go negative without wrapping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    micros: i64,
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp { micros: 0 };

    pub fn now() -> Self {
        let micros = match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_micros() as i64,
            Err(e) => -(e.duration().as_micros() as i64),
        };
        Self { micros }
    }

    pub const fn from_micros(micros: i64) -> Self {
        Self { micros }
    }

    pub fn from_millis(millis: i64) -> Self {
        Self {
            micros: millis * 1_000,
        }
    }

    pub const fn as_micros(&self) -> i64 {
        self.micros
    }

    /// Signed difference `self - earlier` in seconds.
    pub fn seconds_since(&self, earlier: Timestamp) -> f64 {
        (self.micros - earlier.micros) as f64 / 1_000_000.0
    }

    /// `self - earlier` as a duration, `None` when `earlier` is later.
    pub fn checked_elapsed(&self, earlier: Timestamp) -> Option<Duration> {
        let delta = self.micros.checked_sub(earlier.micros)?;
        u64::try_from(delta).ok().map(Duration::from_micros)
    }

    /// `self - earlier`, clamped at zero.
    pub fn saturating_elapsed(&self, earlier: Timestamp) -> Duration {
        self.checked_elapsed(earlier).unwrap_or(Duration::ZERO)
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        let micros = i64::try_from(rhs.as_micros()).unwrap_or(i64::MAX);
        Timestamp {
            micros: self.micros.saturating_add(micros),
        }
    }
}

/// One logical packet (UDP datagram or TCP buffer flush).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PacketEvent {
    /// Datagram sequence number; `0` for stream traffic, negative ends the stream.
    pub sequence_id: i64,
    pub byte_length: u64,
    pub arrival_time: Timestamp,
    pub send_time: Timestamp,
}

impl PacketEvent {
    /// A UDP datagram with its sequence number and both timestamps.
    pub fn datagram(sequence_id: i64, byte_length: u64, send_time: Timestamp, arrival_time: Timestamp) -> Self {
        Self {
            sequence_id,
            byte_length,
            arrival_time,
            send_time,
        }
    }

    /// A TCP flush; only the byte count and the local time matter.
    pub fn stream(byte_length: u64, time: Timestamp) -> Self {
        Self {
            sequence_id: 0,
            byte_length,
            arrival_time: time,
            send_time: time,
        }
    }

    /// The terminal event closing a stream at `time`.
    pub fn end_of_stream(time: Timestamp) -> Self {
        Self {
            sequence_id: END_OF_STREAM,
            byte_length: 0,
            arrival_time: time,
            send_time: time,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.sequence_id < 0
    }

    pub fn is_datagram(&self) -> bool {
        self.sequence_id > 0
    }

    /// One-way transit time in seconds (`arrival - send`).
    pub fn transit_seconds(&self) -> f64 {
        self.arrival_time.seconds_since(self.send_time)
    }
}
