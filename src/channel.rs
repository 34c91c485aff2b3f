//! Report channels: the producer handle a traffic thread owns and the
//! consumer-side drain the aggregator runs.
//!
//! A channel is created by [`Reporter::create_channel`](crate::Reporter::create_channel)
//! and lives in the reporter's list until it has been both drained (its
//! terminal event consumed) and detached (its handle gone). Teardown is two
//! phase: [`ChannelHandle::detach`] waits for the drain, sets the detached
//! flag, and the next aggregator pass reclaims the entry.
//!
//! # Examples
//!
//! ```
//! use rperf_reporter::event::{PacketEvent, Timestamp};
//! use rperf_reporter::formatter::MemoryWriter;
//! use rperf_reporter::{ReportConfig, Reporter, ReporterOptions};
//!
//! let output = MemoryWriter::new();
//! let reporter = Reporter::init_with_writer(ReporterOptions::new(), Box::new(output.clone())).unwrap();
//!
//! let start = Timestamp::from_millis(0);
//! let mut channel = reporter
//!     .create_channel(ReportConfig::new(3).with_start_time(start), None)
//!     .unwrap();
//! for ms in 1..=4 {
//!     channel.publish(PacketEvent::stream(1024, Timestamp::from_millis(ms)));
//! }
//! channel.mark_end(PacketEvent::end_of_stream(Timestamp::from_millis(5)));
//!
//! let total = channel.final_snapshot().unwrap();
//! assert_eq!(total.bytes, 4096);
//! channel.detach();
//! reporter.shutdown().unwrap();
//! ```

use crate::config::{ReportConfig, ReportStyle};
use crate::event::{PacketEvent, Timestamp, END_OF_STREAM};
use crate::multi::Coordinator;
use crate::reporter::Shared;
use crate::ring::Ring;
use crate::snapshot::{ConnectionSnapshot, TransferSnapshot};
use crate::stats::StatisticsState;
use crate::sync::Backoff;
use crate::{Error, Result};
use log::{debug, trace};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Consumer-owned part of a channel. Whoever holds this lock is the ring's
/// single consumer.
struct ChannelState {
    stats: StatisticsState,
    /// Label returned by the connection formatter, passed to every line
    peer: Option<String>,
    pending_connection: Option<ConnectionSnapshot>,
    final_snapshot: Option<TransferSnapshot>,
}

pub(crate) struct TransferReport {
    ring: Ring,
    config: ReportConfig,
    coordinator: Option<Arc<Coordinator>>,
    state: Mutex<ChannelState>,
    drained: AtomicBool,
    detached: AtomicBool,
}

impl fmt::Debug for TransferReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferReport")
            .field("transfer_id", &self.config.transfer_id)
            .field("pending", &self.ring.len())
            .field("drained", &self.is_drained())
            .field("detached", &self.is_detached())
            .finish()
    }
}

impl TransferReport {
    pub(crate) fn new(config: ReportConfig, coordinator: Option<Arc<Coordinator>>, start: Timestamp) -> Self {
        let mut stats = StatisticsState::new(&config, coordinator.as_ref().map(|c| c.group_id()));
        stats.start_at(start);
        Self {
            ring: Ring::new(config.capacity),
            state: Mutex::new(ChannelState {
                stats,
                peer: None,
                pending_connection: config.connection.clone(),
                final_snapshot: None,
            }),
            config,
            coordinator,
            drained: AtomicBool::new(false),
            detached: AtomicBool::new(false),
        }
    }

    pub(crate) fn transfer_id(&self) -> i32 {
        self.config.transfer_id
    }

    pub(crate) fn style(&self) -> ReportStyle {
        self.config.style
    }

    pub(crate) fn coordinator(&self) -> Option<&Arc<Coordinator>> {
        self.coordinator.as_ref()
    }

    pub(crate) fn is_drained(&self) -> bool {
        self.drained.load(Ordering::Acquire)
    }

    pub(crate) fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }

    /// Consumes every published event, formatting the snapshots they close
    /// and folding them into the group. Returns the number of events consumed.
    pub(crate) fn drain(&self, shared: &Shared) -> usize {
        let mut state = self.state.lock();
        let style = self.config.style;

        if let Some(connection) = state.pending_connection.take() {
            state.peer = shared.formatters.lock().connection(style, &connection);
        }

        let mut snapshots = Vec::new();
        let mut consumed = 0;
        while let Some(event) = self.ring.pop() {
            consumed += 1;
            state.stats.ingest(&event, &mut snapshots);
        }
        if snapshots.is_empty() {
            return consumed;
        }

        let mut formatters = shared.formatters.lock();
        for snapshot in &snapshots {
            formatters.transfer(style, snapshot, state.peer.as_deref());
            if let Some(sum) = self.coordinator.as_ref().and_then(|c| c.fold(snapshot)) {
                formatters.combined(style, &sum);
            }
        }
        drop(formatters);

        if let Some(last) = snapshots.into_iter().rev().find(TransferSnapshot::is_final) {
            state.final_snapshot = Some(last);
            self.drained.store(true, Ordering::Release);
        }
        consumed
    }
}

/// Producer side of one report channel, owned by a traffic thread.
///
/// Not `Clone`: the ring relies on a single producer. Dropping the handle
/// ends (if needed) and detaches the channel.
pub struct ChannelHandle {
    report: Arc<TransferReport>,
    shared: Arc<Shared>,
    /// Latest arrival time published so far, the stream start before that
    last_time: Timestamp,
    ended: bool,
    detached: bool,
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("report", &self.report)
            .field("ended", &self.ended)
            .finish()
    }
}

impl ChannelHandle {
    pub(crate) fn new(report: Arc<TransferReport>, shared: Arc<Shared>, start: Timestamp) -> Self {
        Self {
            report,
            shared,
            last_time: start,
            ended: false,
            detached: false,
        }
    }

    pub fn transfer_id(&self) -> i32 {
        self.report.transfer_id()
    }

    /// Events published but not yet consumed.
    pub fn pending(&self) -> usize {
        self.report.ring.len()
    }

    pub fn coordinator(&self) -> Option<&Arc<Coordinator>> {
        self.report.coordinator()
    }

    /// Whether the test was interrupted; traffic loops should stop sending.
    pub fn is_interrupted(&self) -> bool {
        self.shared.is_interrupted()
    }

    /// Hands one event to the reporter.
    ///
    /// Never drops the event: if the ring is full the call waits for the
    /// consumer to make room. Events published after
    /// [`ChannelHandle::mark_end`] are ignored.
    pub fn publish(&mut self, event: PacketEvent) {
        if self.ended {
            debug!("transfer {}: event after end of stream ignored", self.transfer_id());
            return;
        }
        self.last_time = self.last_time.max(event.arrival_time);
        self.push(event);
    }

    /// Publishes the terminal event that finalizes the statistics. The
    /// caller supplies the end time and, for receivers, any trailing bytes;
    /// the sequence id is forced to the end-of-stream sentinel.
    pub fn mark_end(&mut self, final_event: PacketEvent) {
        if self.ended {
            return;
        }
        self.ended = true;
        self.push(PacketEvent {
            sequence_id: END_OF_STREAM,
            ..final_event
        });
    }

    fn push(&mut self, event: PacketEvent) {
        let mut pending = event;
        let mut backoff = Backoff::new();
        while let Err(back) = self.report.ring.try_push(pending) {
            pending = back;
            if self.shared.needs_self_drain() {
                self.report.drain(&self.shared);
                continue;
            }
            if backoff.steps() == 0 {
                trace!(
                    "transfer {}: ring full ({} slots), waiting for the reporter",
                    self.transfer_id(),
                    self.report.ring.capacity()
                );
            }
            self.shared.nudge();
            backoff.snooze();
        }

        if self.shared.needs_self_drain() {
            self.report.drain(&self.shared);
        } else {
            self.shared.wake_if_sleeping();
        }
    }

    fn wait_drained(&self) {
        let mut backoff = Backoff::new();
        while !self.report.is_drained() {
            if self.shared.needs_self_drain() {
                self.report.drain(&self.shared);
                continue;
            }
            self.shared.nudge();
            backoff.snooze();
        }
    }

    /// Blocks until the terminal event has been consumed and returns the
    /// stream's final snapshot. Repeated calls return the same value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the stream has not been ended with
    /// [`ChannelHandle::mark_end`].
    pub fn final_snapshot(&self) -> Result<TransferSnapshot> {
        if !self.ended {
            return Err(Error::Config(format!(
                "transfer {}: final snapshot requested before the end of stream",
                self.transfer_id()
            )));
        }
        self.wait_drained();
        self.report
            .state
            .lock()
            .final_snapshot
            .clone()
            .ok_or_else(|| Error::Thread(format!("transfer {}: final snapshot missing", self.transfer_id())))
    }

    /// Gives the channel back to the reporter. Ends the stream first (at the
    /// latest published arrival time) if that has not happened yet, then
    /// waits until the reporter has drained it.
    pub fn detach(mut self) {
        self.release();
    }

    /// Ends the stream, waits for the final snapshot on tokio's blocking
    /// pool and detaches.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Thread`] if the blocking task panicked or was
    /// cancelled.
    pub async fn finish_async(mut self, final_event: PacketEvent) -> Result<TransferSnapshot> {
        tokio::task::spawn_blocking(move || {
            self.mark_end(final_event);
            let snapshot = self.final_snapshot();
            self.release();
            snapshot
        })
        .await
        .map_err(|e| Error::Thread(format!("final snapshot task failed: {}", e)))?
    }

    fn release(&mut self) {
        if self.detached {
            return;
        }
        if !self.ended {
            self.mark_end(PacketEvent::end_of_stream(self.last_time));
        }
        self.wait_drained();
        self.report.detached.store(true, Ordering::Release);
        self.detached = true;
        debug!("transfer {} detached", self.transfer_id());

        if self.shared.needs_self_drain() {
            self.shared.pass();
        } else {
            self.shared.wake();
        }
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Driver, Protocol, ReporterOptions, Role};
    use crate::formatter::{CallbackFormatter, MemoryWriter, ReportEvent};
    use crate::Reporter;
    use std::time::Duration;

    fn inline_reporter() -> (Reporter, MemoryWriter) {
        let output = MemoryWriter::new();
        let options = ReporterOptions::new().with_driver(Driver::Inline);
        let reporter = Reporter::init_with_writer(options, Box::new(output.clone())).unwrap();
        (reporter, output)
    }

    #[test]
    fn test_inline_publish_drains_immediately() {
        let (reporter, output) = inline_reporter();
        let config = ReportConfig::new(6)
            .with_interval(Duration::from_secs(1))
            .with_start_time(Timestamp::ZERO);
        let mut channel = reporter.create_channel(config, None).unwrap();

        channel.publish(PacketEvent::stream(100, Timestamp::from_millis(500)));
        assert_eq!(channel.pending(), 0);
        assert!(output.contents().is_empty());

        channel.publish(PacketEvent::stream(100, Timestamp::from_millis(1500)));
        assert!(output.contents().contains("[  6]  0.0- 1.0 sec"));
        channel.detach();
    }

    #[test]
    fn test_final_snapshot_is_stable() {
        let (reporter, _output) = inline_reporter();
        let config = ReportConfig::new(2)
            .with_protocol(Protocol::Udp)
            .with_role(Role::Server)
            .with_start_time(Timestamp::ZERO);
        let mut channel = reporter.create_channel(config, None).unwrap();
        assert!(matches!(channel.final_snapshot(), Err(Error::Config(_))));

        for id in 1..=3 {
            let t = Timestamp::from_millis(id * 10);
            channel.publish(PacketEvent::datagram(id, 1000, t, t));
        }
        channel.mark_end(PacketEvent::end_of_stream(Timestamp::from_millis(40)));
        // Ignored after the end.
        channel.publish(PacketEvent::datagram(4, 1000, Timestamp::ZERO, Timestamp::ZERO));

        let first = channel.final_snapshot().unwrap();
        let second = channel.final_snapshot().unwrap();
        assert_eq!(first, second);
        assert_eq!(first.bytes, 3000);
        assert_eq!(first.datagrams, 4);
    }

    #[test]
    fn test_drop_without_end_still_reports() {
        let (reporter, output) = inline_reporter();
        let mut channel = reporter.create_channel(ReportConfig::new(9), None).unwrap();
        channel.publish(PacketEvent::stream(64, Timestamp::now()));
        drop(channel);

        assert!(output.contents().contains("[  9]"));
        assert_eq!(reporter.pending_reports(), 0);
    }

    #[test]
    fn test_implicit_end_uses_last_packet_time() {
        let (reporter, _output) = inline_reporter();
        let reports = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&reports);
        reporter.register_formatter(
            ReportStyle::Default,
            Box::new(CallbackFormatter::new(move |event: ReportEvent| {
                if let ReportEvent::Transfer { snapshot, .. } = event {
                    sink.lock().push(snapshot);
                }
            })),
        );

        let config = ReportConfig::new(4)
            .with_interval(Duration::from_secs(3600))
            .with_start_time(Timestamp::ZERO);
        let mut channel = reporter.create_channel(config, None).unwrap();
        channel.publish(PacketEvent::stream(100, Timestamp::from_millis(500)));
        drop(channel);

        let reports = reports.lock();
        assert_eq!(reports.len(), 1);
        assert!(reports[0].is_final());
        assert_eq!(reports[0].end, Duration::from_millis(500));
        assert_eq!(reports[0].bytes, 100);
    }

    #[test]
    fn test_implicit_end_without_traffic_is_empty() {
        let (reporter, output) = inline_reporter();
        let config = ReportConfig::new(4)
            .with_interval(Duration::from_secs(1))
            .with_start_time(Timestamp::ZERO);
        let channel = reporter.create_channel(config, None).unwrap();
        channel.detach();

        assert!(output.contents().contains("[  4]  0.0- 0.0 sec"));
        assert_eq!(reporter.pending_reports(), 0);
    }

    #[test]
    fn test_mark_end_forces_sentinel() {
        let (reporter, _output) = inline_reporter();
        let config = ReportConfig::new(1).with_role(Role::Server).with_start_time(Timestamp::ZERO);
        let mut channel = reporter.create_channel(config, None).unwrap();
        let trailing = PacketEvent::datagram(77, 250, Timestamp::ZERO, Timestamp::from_millis(3));
        channel.mark_end(trailing);

        let total = channel.final_snapshot().unwrap();
        assert_eq!(total.bytes, 250);
        assert_eq!(total.sequence_total, 0);
        assert_eq!(total.end, Duration::from_millis(3));
    }
}
