//! The reporting subsystem context.
//!
//! A [`Reporter`] owns everything the reporting pipeline shares: the report
//! list, the formatter registry, the thread registry, the group-id counter
//! and the interrupt flag. Traffic threads talk to it through
//! [`ChannelHandle`]s; settings and connection collaborators post one-shot
//! reports into the same ordered stream.
//!
//! # Examples
//!
//! ## Parallel senders summed into one report
//!
//! ```
//! use rperf_reporter::event::{PacketEvent, Timestamp};
//! use rperf_reporter::{ReportConfig, Reporter, ReporterOptions, StartMode};
//! use std::thread;
//!
//! let reporter = Reporter::init(ReporterOptions::new()).unwrap();
//! let group = reporter.create_coordinator(2, StartMode::Barrier).unwrap();
//!
//! let totals: Vec<u64> = thread::scope(|s| {
//!     let workers: Vec<_> = (1..=2)
//!         .map(|id| {
//!             let (reporter, group) = (&reporter, group.clone());
//!             s.spawn(move || {
//!                 // Blocks until both streams have arrived.
//!                 let mut channel = reporter.create_channel(ReportConfig::new(id), Some(group)).unwrap();
//!                 channel.publish(PacketEvent::stream(1000, Timestamp::now()));
//!                 channel.mark_end(PacketEvent::end_of_stream(Timestamp::now()));
//!                 channel.final_snapshot().unwrap().bytes
//!             })
//!         })
//!         .collect();
//!     workers.into_iter().map(|w| w.join().unwrap()).collect()
//! });
//!
//! assert_eq!(totals, vec![1000, 1000]);
//! assert_eq!(group.final_sum().unwrap().bytes, 2000);
//! reporter.shutdown().unwrap();
//! ```

use crate::aggregator::{self, OneShot, OneShotKind, Report, ReportId, ReportList};
use crate::channel::{ChannelHandle, TransferReport};
use crate::config::{Driver, ReportConfig, ReportStyle, ReporterOptions};
use crate::event::Timestamp;
use crate::formatter::{FormatterRegistry, ReportFormatter, Sink};
use crate::multi::{Coordinator, StartMode};
use crate::snapshot::{ConnectionSnapshot, SettingsSnapshot, TransferSnapshot};
use crate::sync::{Monitor, ThreadRegistry};
use crate::{Error, Result};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// State shared by the reporter, its thread and every channel handle.
pub(crate) struct Shared {
    pub(crate) options: ReporterOptions,
    pub(crate) list: Monitor<ReportList>,
    pub(crate) formatters: Mutex<FormatterRegistry>,
    pub(crate) registry: Arc<ThreadRegistry>,
    /// Set while the aggregator waits on its idle timeout
    pub(crate) sleeping: AtomicBool,
    /// Someone other than the producers drains the channels
    pub(crate) consumer_running: AtomicBool,
    interrupted: Arc<AtomicBool>,
    next_group: AtomicI64,
}

impl Shared {
    pub(crate) fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Whether producers have to drain their own channels.
    pub(crate) fn needs_self_drain(&self) -> bool {
        !self.consumer_running.load(Ordering::SeqCst)
    }

    pub(crate) fn pass(&self) -> bool {
        aggregator::run_pass(self)
    }

    /// Wakes the aggregator whatever it is waiting on.
    pub(crate) fn nudge(&self) {
        self.list.signal();
    }

    pub(crate) fn wake_if_sleeping(&self) {
        if self.sleeping.load(Ordering::Acquire) {
            self.list.signal();
        }
    }

    /// Wakes every waiter on the list, including a parked aggregator.
    pub(crate) fn wake(&self) {
        let _list = self.list.lock();
        self.list.broadcast();
    }

    fn post(&self, report: Report) -> ReportId {
        let (id, self_drain) = {
            let mut list = self.list.lock();
            let id = list.insert(report);
            self.list.broadcast();
            (id, self.needs_self_drain())
        };
        if self_drain {
            self.pass();
        }
        id
    }
}

/// Entry point of the reporting subsystem.
///
/// `Reporter` is `Sync`; share it by reference or in an `Arc`. Dropping it
/// shuts it down.
///
/// # Examples
///
/// ```
/// use rperf_reporter::event::{PacketEvent, Timestamp};
/// use rperf_reporter::{Protocol, ReportConfig, Reporter, ReporterOptions, Role};
/// use std::time::Duration;
///
/// let reporter = Reporter::init(ReporterOptions::new()).unwrap();
/// let config = ReportConfig::new(3)
///     .with_protocol(Protocol::Udp)
///     .with_role(Role::Server)
///     .with_interval(Duration::from_secs(1));
/// let mut channel = reporter.create_channel(config, None).unwrap();
///
/// let now = Timestamp::now();
/// channel.publish(PacketEvent::datagram(1, 1470, now, now));
/// channel.mark_end(PacketEvent::end_of_stream(Timestamp::now()));
/// assert_eq!(channel.final_snapshot().unwrap().bytes, 1470);
///
/// channel.detach();
/// reporter.shutdown().unwrap();
/// ```
pub struct Reporter {
    shared: Arc<Shared>,
    aggregator: Mutex<Option<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl Reporter {
    /// Starts the reporting subsystem, printing to stdout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for invalid options and [`Error::Thread`]
    /// if the reporter thread cannot be spawned.
    pub fn init(options: ReporterOptions) -> Result<Self> {
        Self::with_sink(options, Sink::stdout())
    }

    /// Like [`Reporter::init`], writing the built-in styles to `writer`.
    pub fn init_with_writer(options: ReporterOptions, writer: Box<dyn Write + Send>) -> Result<Self> {
        Self::with_sink(options, Sink::new(writer))
    }

    fn with_sink(options: ReporterOptions, sink: Sink) -> Result<Self> {
        options.validate()?;
        let driver = options.driver;
        let shared = Arc::new(Shared {
            options,
            list: Monitor::new(ReportList::default()),
            formatters: Mutex::new(FormatterRegistry::new(sink)),
            registry: Arc::new(ThreadRegistry::new()),
            sleeping: AtomicBool::new(false),
            consumer_running: AtomicBool::new(driver != Driver::Inline),
            interrupted: Arc::new(AtomicBool::new(false)),
            next_group: AtomicI64::new(0),
        });

        let aggregator = match driver {
            Driver::Background => {
                let worker = Arc::clone(&shared);
                let handle = shared
                    .registry
                    .spawn("rperf-reporter", move || aggregator::run_forever(worker))?;
                Some(handle)
            }
            Driver::Inline | Driver::External => None,
        };
        info!("reporter initialized ({:?} driver)", driver);

        Ok(Self {
            shared,
            aggregator: Mutex::new(aggregator),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn options(&self) -> &ReporterOptions {
        &self.shared.options
    }

    /// The live-thread registry collaborators spawn and join traffic threads with.
    pub fn threads(&self) -> &Arc<ThreadRegistry> {
        &self.shared.registry
    }

    /// Creates the coordinator for a multi-stream test of `thread_count` streams.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `thread_count` is zero.
    pub fn create_coordinator(&self, thread_count: usize, start_mode: StartMode) -> Result<Arc<Coordinator>> {
        if thread_count == 0 {
            return Err(Error::Config("a multi-stream group needs at least one stream".to_string()));
        }
        let group_id = self.shared.next_group.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("group {}: {} streams, {:?}", group_id, thread_count, start_mode);
        Ok(Arc::new(Coordinator::new(
            thread_count,
            group_id,
            start_mode,
            self.shared.options.multi_slots,
            Arc::clone(&self.shared.interrupted),
        )))
    }

    /// Registers a new stream and returns its producer handle.
    ///
    /// Members of a [`StartMode::Barrier`] group block here until the whole
    /// group has arrived.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `config` is invalid and
    /// [`Error::Shutdown`] after [`Reporter::shutdown`].
    pub fn create_channel(&self, config: ReportConfig, coordinator: Option<Arc<Coordinator>>) -> Result<ChannelHandle> {
        config.validate()?;
        self.ensure_running()?;

        let start = match &coordinator {
            Some(group) => group.join(),
            None => config.start_time.unwrap_or_else(Timestamp::now),
        };
        let transfer_id = config.transfer_id;
        let report = Arc::new(TransferReport::new(config, coordinator, start));
        self.shared.post(Report::Transfer(Arc::clone(&report)));
        debug!("transfer {} registered", transfer_id);
        Ok(ChannelHandle::new(report, Arc::clone(&self.shared), start))
    }

    /// Posts the settings dump of a client or listener.
    pub fn report_settings(&self, settings: SettingsSnapshot, style: ReportStyle) -> Result<ReportId> {
        self.ensure_running()?;
        Ok(self.post_one_shot(OneShotKind::Settings(settings), style))
    }

    /// Posts a connection-established report not tied to a channel. Use
    /// [`ReportConfig::with_connection`] to attach one to a channel instead.
    pub fn report_connection(&self, connection: ConnectionSnapshot, style: ReportStyle) -> Result<ReportId> {
        self.ensure_running()?;
        Ok(self.post_one_shot(OneShotKind::Connection(connection), style))
    }

    /// Posts the statistics a remote receiver sent back for one of our streams.
    pub fn report_server_relay(
        &self,
        connection: ConnectionSnapshot,
        snapshot: TransferSnapshot,
        style: ReportStyle,
    ) -> Result<ReportId> {
        self.ensure_running()?;
        Ok(self.post_one_shot(OneShotKind::ServerRelay(connection, snapshot), style))
    }

    fn post_one_shot(&self, kind: OneShotKind, style: ReportStyle) -> ReportId {
        self.shared.post(Report::OneShot(Arc::new(OneShot::new(kind, style))))
    }

    /// Whether the report is still waiting to be printed or reclaimed.
    pub fn is_pending(&self, id: ReportId) -> bool {
        self.shared.list.lock().contains(id)
    }

    /// Number of entries in the report list.
    pub fn pending_reports(&self) -> usize {
        self.shared.list.lock().len()
    }

    /// Replaces the formatter of `style`.
    pub fn register_formatter(&self, style: ReportStyle, formatter: Box<dyn ReportFormatter>) {
        self.shared.formatters.lock().register(style, formatter);
    }

    /// Runs one aggregator pass on the calling thread. This is how the
    /// pipeline advances under [`Driver::External`]; with the other drivers
    /// it is harmless but rarely useful.
    pub fn run_pass(&self) -> bool {
        self.shared.pass()
    }

    /// Flags the test as interrupted and releases non-terminating threads
    /// from the join count.
    pub fn interrupt(&self) {
        if self.shared.interrupted.swap(true, Ordering::AcqRel) {
            return;
        }
        warn!("interrupted");
        self.shared.registry.release_non_terminating(true);
        self.shared.wake();
    }

    pub fn is_interrupted(&self) -> bool {
        self.shared.is_interrupted()
    }

    /// Prints what is still queued and stops the reporter thread. Channels
    /// still open afterwards drain on their own threads.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Thread`] if the reporter thread panicked.
    pub fn shutdown(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        {
            let mut list = self.shared.list.lock();
            list.stopping = true;
            if self.shared.options.driver != Driver::Background {
                self.shared.consumer_running.store(false, Ordering::SeqCst);
            }
            self.shared.list.broadcast();
        }

        let handle = self.aggregator.lock().take();
        let result = match handle {
            Some(handle) => handle
                .join()
                .map_err(|_| Error::Thread("reporter thread panicked".to_string())),
            None => {
                self.shared.pass();
                Ok(())
            }
        };
        info!("reporter shut down, {} reports outstanding", self.pending_reports());
        result
    }

    fn ensure_running(&self) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(Error::Shutdown("the reporter has been shut down".to_string()));
        }
        Ok(())
    }
}

impl Drop for Reporter {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!("{}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Protocol, Role};
    use crate::event::PacketEvent;
    use crate::formatter::MemoryWriter;
    use std::time::Duration;

    fn reporter(driver: Driver) -> (Reporter, MemoryWriter) {
        let output = MemoryWriter::new();
        let options = ReporterOptions::new().with_driver(driver);
        (Reporter::init_with_writer(options, Box::new(output.clone())).unwrap(), output)
    }

    #[test]
    fn test_rejects_invalid_setup() {
        let (reporter, _) = reporter(Driver::Inline);
        assert!(matches!(
            reporter.create_coordinator(0, StartMode::Barrier),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            reporter.create_channel(ReportConfig::new(1).with_capacity(0), None),
            Err(Error::Config(_))
        ));
        assert!(Reporter::init(ReporterOptions::new().with_multi_slots(0)).is_err());
    }

    #[test]
    fn test_group_ids_are_unique() {
        let (reporter, _) = reporter(Driver::Inline);
        let a = reporter.create_coordinator(2, StartMode::FirstArrival).unwrap();
        let b = reporter.create_coordinator(2, StartMode::FirstArrival).unwrap();
        assert_ne!(a.group_id(), b.group_id());
    }

    #[test]
    fn test_one_shots_print_in_posting_order() {
        let (reporter, output) = reporter(Driver::External);
        let listener = SettingsSnapshot::new(0, Role::Listener, Protocol::Tcp, 5001);
        let connection = ConnectionSnapshot::new(
            4,
            "10.0.0.1:5001".parse().unwrap(),
            "10.0.0.2:40000".parse().unwrap(),
        );
        let settings_id = reporter.report_settings(listener, ReportStyle::Default).unwrap();
        let connection_id = reporter.report_connection(connection, ReportStyle::Default).unwrap();
        assert!(reporter.is_pending(settings_id));
        assert!(output.contents().is_empty());

        assert!(reporter.run_pass());
        assert!(!reporter.is_pending(settings_id));
        assert!(!reporter.is_pending(connection_id));

        let out = output.contents();
        let listening = out.find("Server listening on TCP port 5001").unwrap();
        let connected = out.find("[  4] local 10.0.0.1 port 5001").unwrap();
        assert!(listening < connected);
    }

    #[test]
    fn test_shutdown_is_idempotent_and_final() {
        let (reporter, _) = reporter(Driver::Background);
        reporter.shutdown().unwrap();
        reporter.shutdown().unwrap();
        assert!(matches!(
            reporter.create_channel(ReportConfig::new(1), None),
            Err(Error::Shutdown(_))
        ));
    }

    #[test]
    fn test_channel_outliving_shutdown_drains_itself() {
        let (reporter, output) = reporter(Driver::Background);
        let config = ReportConfig::new(8).with_start_time(Timestamp::ZERO);
        let mut channel = reporter.create_channel(config, None).unwrap();
        reporter.shutdown().unwrap();

        channel.publish(PacketEvent::stream(500, Timestamp::from_millis(10)));
        channel.mark_end(PacketEvent::end_of_stream(Timestamp::from_millis(20)));
        assert_eq!(channel.final_snapshot().unwrap().bytes, 500);
        channel.detach();

        assert!(output.contents().contains("[  8]  0.0- 0.0 sec"));
        assert_eq!(reporter.pending_reports(), 0);
    }

    #[test]
    fn test_interrupt_sets_flag_once() {
        let (reporter, _) = reporter(Driver::Background);
        let channel = reporter.create_channel(ReportConfig::new(1), None).unwrap();
        assert!(!channel.is_interrupted());
        reporter.interrupt();
        reporter.interrupt();
        assert!(reporter.is_interrupted());
        assert!(channel.is_interrupted());
        drop(channel);
        reporter.shutdown().unwrap();
    }

    #[test]
    fn test_background_reporter_parks_out_of_join() {
        let (reporter, _) = reporter(Driver::Background);
        // With nothing registered the reporter thread must not hold up join_all.
        assert!(reporter.threads().join_all_timeout(Duration::from_secs(2)));
        reporter.shutdown().unwrap();
    }
}
