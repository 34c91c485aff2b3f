//! Running per-stream statistics and interval scheduling.
//!
//! A [`StatisticsState`] is fed one [`PacketEvent`] at a time by whoever is
//! currently draining the stream's ring. It tracks throughput, RFC 1889
//! jitter, loss and reordering, and produces [`TransferSnapshot`]s at
//! interval boundaries and at the end of the stream.
//!
//! Jitter follows the RTP estimator:
//!
//! ```text
//! J = J + (|D(i-1,i)| - J) / 16
//! ```
//!
//! where `D(i-1,i)` is the difference between two consecutive transit times.
//!
//! # Examples
//!
//! ```
//! use rperf_reporter::event::{PacketEvent, Timestamp};
//! use rperf_reporter::stats::StatisticsState;
//! use rperf_reporter::ReportConfig;
//!
//! let mut stats = StatisticsState::new(&ReportConfig::new(1), None);
//! stats.start_at(Timestamp::ZERO);
//!
//! let mut snapshots = Vec::new();
//! for id in 1..=3 {
//!     let t = Timestamp::from_millis(id * 10);
//!     stats.ingest(&PacketEvent::datagram(id, 1000, t, t), &mut snapshots);
//! }
//! stats.ingest(&PacketEvent::end_of_stream(Timestamp::from_millis(40)), &mut snapshots);
//!
//! let last = snapshots.last().unwrap();
//! assert_eq!(last.bytes, 3000);
//! assert_eq!(last.datagrams, 4);
//! assert_eq!(last.errors, 0);
//! ```

use crate::config::{Protocol, ReportConfig, Role};
use crate::event::{PacketEvent, Timestamp};
use crate::snapshot::{SnapshotKind, TransferSnapshot};
use crate::units::UnitFormat;
use std::time::Duration;

const JITTER_GAIN: f64 = 16.0;

/// Counters and their values at the last emitted interval.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Counters {
    bytes: u64,
    datagrams: u64,
    highest_sequence: i64,
    errors: u64,
    out_of_order: u64,
}

#[derive(Debug, Clone)]
pub struct StatisticsState {
    transfer_id: i32,
    group_id: Option<i64>,
    protocol: Protocol,
    role: Role,
    unit_format: UnitFormat,
    interval: Option<Duration>,
    mss: Option<u32>,

    start_time: Timestamp,
    packet_time: Timestamp,
    next_deadline: Option<Timestamp>,
    last_interval_end: Duration,

    current: Counters,
    reported: Counters,
    last_transit: Option<f64>,
    jitter: f64,
    finished: bool,
}

impl StatisticsState {
    pub fn new(config: &ReportConfig, group_id: Option<i64>) -> Self {
        Self {
            transfer_id: config.transfer_id,
            group_id,
            protocol: config.protocol,
            role: config.role,
            unit_format: config.unit_format,
            interval: config.interval,
            mss: config.mss,
            start_time: Timestamp::ZERO,
            packet_time: Timestamp::ZERO,
            next_deadline: None,
            last_interval_end: Duration::ZERO,
            current: Counters::default(),
            reported: Counters::default(),
            last_transit: None,
            jitter: 0.0,
            finished: false,
        }
    }

    /// Fixes the stream's start time; the first deadline is one interval later.
    pub fn start_at(&mut self, start: Timestamp) {
        self.start_time = start;
        self.packet_time = start;
        self.next_deadline = self.interval.map(|interval| start + interval);
    }

    /// Folds one event into the running state, appending any snapshots it
    /// closes to `out`. Returns `true` once the stream is finished; events
    /// after the terminal one are ignored.
    pub fn ingest(&mut self, event: &PacketEvent, out: &mut Vec<TransferSnapshot>) -> bool {
        if self.finished {
            return true;
        }

        self.packet_time = event.arrival_time;
        // The event that crosses a deadline belongs to the next interval.
        self.close_intervals(out);
        self.current.datagrams += 1;

        if event.is_terminal() {
            // Senders count bytes as they are sent; a receiver's terminal
            // event can still carry trailing bytes.
            if self.role.is_receiver() {
                self.current.bytes += event.byte_length;
            }
            self.finished = true;
            out.push(self.final_snapshot());
            return true;
        }

        self.current.bytes += event.byte_length;
        if event.is_datagram() {
            self.update_jitter(event.transit_seconds());
            self.track_sequence(event.sequence_id);
        }
        false
    }

    fn update_jitter(&mut self, transit: f64) {
        if let Some(last) = self.last_transit {
            let delta = (transit - last).abs();
            self.jitter += (delta - self.jitter) / JITTER_GAIN;
        }
        self.last_transit = Some(transit);
    }

    fn track_sequence(&mut self, sequence_id: i64) {
        let highest = self.current.highest_sequence;
        if sequence_id <= highest {
            self.current.out_of_order += 1;
            return;
        }
        // Ids skipped between the previous highest and this one.
        let skipped = sequence_id.abs_diff(highest) - 1;
        self.current.errors = self.current.errors.saturating_add(skipped);
        self.current.highest_sequence = sequence_id;
    }

    /// Emits one snapshot per deadline strictly before the packet time,
    /// advancing the deadline a full interval each time.
    fn close_intervals(&mut self, out: &mut Vec<TransferSnapshot>) {
        let Some(interval) = self.interval else {
            return;
        };
        while let Some(deadline) = self.next_deadline {
            if deadline >= self.packet_time {
                break;
            }
            out.push(self.interval_snapshot(deadline));
            self.next_deadline = Some(deadline + interval);
        }
    }

    fn interval_snapshot(&mut self, deadline: Timestamp) -> TransferSnapshot {
        let delta_errors = self.current.errors - self.reported.errors;
        let delta_out_of_order = self.current.out_of_order - self.reported.out_of_order;
        let start = self.last_interval_end;
        let end = deadline.saturating_elapsed(self.start_time);

        let snapshot = TransferSnapshot {
            transfer_id: self.transfer_id,
            group_id: self.group_id,
            kind: SnapshotKind::Interval,
            protocol: self.protocol,
            role: self.role,
            unit_format: self.unit_format,
            origin: self.start_time,
            start,
            end,
            bytes: self.current.bytes - self.reported.bytes,
            datagrams: self.current.datagrams - self.reported.datagrams,
            sequence_total: self.current.highest_sequence.abs_diff(self.reported.highest_sequence),
            errors: delta_errors.saturating_sub(delta_out_of_order),
            out_of_order: delta_out_of_order,
            jitter: self.jitter,
            mss: None,
        };
        self.reported = self.current;
        self.last_interval_end = end;
        snapshot
    }

    /// Cumulative snapshot from the start of the stream to the last packet.
    ///
    /// Out-of-order arrivals are assumed not to be real losses and are
    /// subtracted from the error count, clipped at zero. This undercounts
    /// when reordering and loss coincide.
    pub fn final_snapshot(&self) -> TransferSnapshot {
        TransferSnapshot {
            transfer_id: self.transfer_id,
            group_id: self.group_id,
            kind: SnapshotKind::Final,
            protocol: self.protocol,
            role: self.role,
            unit_format: self.unit_format,
            origin: self.start_time,
            start: Duration::ZERO,
            end: self.packet_time.saturating_elapsed(self.start_time),
            bytes: self.current.bytes,
            datagrams: self.current.datagrams,
            sequence_total: self.current.highest_sequence.max(0) as u64,
            errors: self.current.errors.saturating_sub(self.current.out_of_order),
            out_of_order: self.current.out_of_order,
            jitter: self.jitter,
            mss: self.mss,
        }
    }

    pub fn start_time(&self) -> Timestamp {
        self.start_time
    }

    pub fn next_deadline(&self) -> Option<Timestamp> {
        self.next_deadline
    }

    pub fn highest_sequence(&self) -> i64 {
        self.current.highest_sequence
    }

    pub fn total_bytes(&self) -> u64 {
        self.current.bytes
    }

    pub fn datagrams(&self) -> u64 {
        self.current.datagrams
    }

    /// Raw loss count, before the out-of-order correction.
    pub fn errors(&self) -> u64 {
        self.current.errors
    }

    pub fn out_of_order(&self) -> u64 {
        self.current.out_of_order
    }

    /// Current jitter estimate in seconds.
    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}
