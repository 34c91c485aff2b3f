//! Immutable statistics records handed to formatters.
//!
//! Snapshots are derived from the aggregator's running state at an interval
//! boundary or at the end of a stream. They are never mutated after
//! creation.

use crate::config::{Protocol, Role};
use crate::event::Timestamp;
use crate::units::UnitFormat;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Whether a snapshot covers one interval or the whole stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SnapshotKind {
    Interval,
    Final,
}

/// Statistics of one stream for one interval or the whole transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferSnapshot {
    pub transfer_id: i32,
    /// Multi-stream group, `None` for standalone streams
    pub group_id: Option<i64>,
    pub kind: SnapshotKind,
    pub protocol: Protocol,
    pub role: Role,
    pub unit_format: UnitFormat,
    /// Wall-clock start of the stream; `start` and `end` are relative to it
    pub origin: Timestamp,
    pub start: Duration,
    pub end: Duration,
    pub bytes: u64,
    /// Events processed, the terminal event included
    pub datagrams: u64,
    /// Advance of the highest sequence id over the window
    pub sequence_total: u64,
    pub errors: u64,
    pub out_of_order: u64,
    /// RFC 1889 jitter estimate in seconds
    pub jitter: f64,
    /// TCP maximum segment size, final snapshots only (0 if unknown)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mss: Option<u32>,
}

impl TransferSnapshot {
    pub fn seconds(&self) -> f64 {
        self.end.saturating_sub(self.start).as_secs_f64()
    }

    pub fn bits_per_second(&self) -> f64 {
        bits_per_second(self.bytes, self.seconds())
    }

    pub fn lost_percent(&self) -> f64 {
        lost_percent(self.errors, self.sequence_total)
    }

    pub fn is_final(&self) -> bool {
        self.kind == SnapshotKind::Final
    }

    /// Whether the loss/jitter columns apply (UDP receiver side).
    pub fn reports_datagrams(&self) -> bool {
        self.protocol == Protocol::Udp && self.role.is_receiver()
    }
}

/// Sum of the per-stream snapshots of one multi-stream group for one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedSnapshot {
    pub group_id: i64,
    pub kind: SnapshotKind,
    pub protocol: Protocol,
    pub role: Role,
    pub unit_format: UnitFormat,
    pub start: Duration,
    pub end: Duration,
    pub bytes: u64,
    pub datagrams: u64,
    pub sequence_total: u64,
    pub errors: u64,
    pub out_of_order: u64,
    /// Largest jitter among the contributing streams
    pub jitter: f64,
    /// Number of streams folded into this snapshot
    pub contributions: usize,
}

impl CombinedSnapshot {
    pub fn seconds(&self) -> f64 {
        self.end.saturating_sub(self.start).as_secs_f64()
    }

    pub fn bits_per_second(&self) -> f64 {
        bits_per_second(self.bytes, self.seconds())
    }

    pub fn lost_percent(&self) -> f64 {
        lost_percent(self.errors, self.sequence_total)
    }

    pub fn is_final(&self) -> bool {
        self.kind == SnapshotKind::Final
    }

    pub fn reports_datagrams(&self) -> bool {
        self.protocol == Protocol::Udp && self.role.is_receiver()
    }
}

/// Settings of a client or listener, printed once before traffic starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsSnapshot {
    pub transfer_id: i32,
    pub role: Role,
    pub protocol: Protocol,
    /// Remote host for clients
    pub host: Option<String>,
    /// Bound local address, if any
    pub bind_host: Option<String>,
    pub port: u16,
    pub buffer_len: usize,
    /// Window (TCP) or socket buffer (UDP) size that was requested, 0 for default
    pub window_requested: usize,
    /// Size actually granted by the socket layer
    pub window_actual: usize,
    pub ttl: Option<u8>,
    pub multicast: bool,
    pub unit_format: UnitFormat,
}

impl SettingsSnapshot {
    pub fn new(transfer_id: i32, role: Role, protocol: Protocol, port: u16) -> Self {
        Self {
            transfer_id,
            role,
            protocol,
            host: None,
            bind_host: None,
            port,
            buffer_len: 0,
            window_requested: 0,
            window_actual: 0,
            ttl: None,
            multicast: false,
            unit_format: UnitFormat::default(),
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_bind_host(mut self, bind_host: impl Into<String>) -> Self {
        self.bind_host = Some(bind_host.into());
        self
    }

    pub fn with_buffer_len(mut self, buffer_len: usize) -> Self {
        self.buffer_len = buffer_len;
        self
    }

    pub fn with_window(mut self, requested: usize, actual: usize) -> Self {
        self.window_requested = requested;
        self.window_actual = actual;
        self
    }
}

/// A connected socket pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    pub transfer_id: i32,
    pub local: SocketAddr,
    pub peer: SocketAddr,
}

impl ConnectionSnapshot {
    pub fn new(transfer_id: i32, local: SocketAddr, peer: SocketAddr) -> Self {
        Self {
            transfer_id,
            local,
            peer,
        }
    }
}

fn bits_per_second(bytes: u64, seconds: f64) -> f64 {
    if seconds > 0.0 {
        (bytes as f64 * 8.0) / seconds
    } else {
        0.0
    }
}

fn lost_percent(errors: u64, total: u64) -> f64 {
    if total > 0 {
        (errors as f64 / total as f64) * 100.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(bytes: u64, start_ms: u64, end_ms: u64) -> TransferSnapshot {
        TransferSnapshot {
            transfer_id: 3,
            group_id: None,
            kind: SnapshotKind::Interval,
            protocol: Protocol::Udp,
            role: Role::Server,
            unit_format: UnitFormat::default(),
            origin: Timestamp::ZERO,
            start: Duration::from_millis(start_ms),
            end: Duration::from_millis(end_ms),
            bytes,
            datagrams: 10,
            sequence_total: 10,
            errors: 1,
            out_of_order: 0,
            jitter: 0.0,
            mss: None,
        }
    }

    #[test]
    fn test_derived_rates() {
        let snap = snapshot(3000, 0, 1000);
        assert_eq!(snap.seconds(), 1.0);
        assert_eq!(snap.bits_per_second(), 24000.0);
        assert_eq!(snap.lost_percent(), 10.0);
        assert!(snap.reports_datagrams());
    }

    #[test]
    fn test_empty_window_has_zero_rate() {
        let snap = snapshot(3000, 500, 500);
        assert_eq!(snap.bits_per_second(), 0.0);
    }
}
