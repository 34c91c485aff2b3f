use rperf_reporter::event::{PacketEvent, Timestamp};
use rperf_reporter::formatter::MemoryWriter;
use rperf_reporter::{
    CallbackFormatter, ConnectionSnapshot, Driver, Protocol, ReportCallback, ReportConfig, ReportEvent, ReportStyle,
    Reporter, ReporterOptions, Role, SettingsSnapshot, SnapshotKind,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Custom callback implementation using a struct
struct TestCallback {
    events: Arc<Mutex<Vec<ReportEvent>>>,
}

impl TestCallback {
    fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl ReportCallback for TestCallback {
    fn on_report(&self, event: ReportEvent) {
        self.events.lock().unwrap().push(event);
    }
}

fn inline_reporter() -> (Reporter, MemoryWriter) {
    let output = MemoryWriter::new();
    let options = ReporterOptions::new().with_driver(Driver::Inline);
    let reporter = Reporter::init_with_writer(options, Box::new(output.clone())).unwrap();
    (reporter, output)
}

fn connection(id: i32) -> ConnectionSnapshot {
    ConnectionSnapshot::new(id, "127.0.0.1:5001".parse().unwrap(), "127.0.0.1:41000".parse().unwrap())
}

#[test]
fn test_custom_callback_struct() {
    let (reporter, output) = inline_reporter();
    let callback = TestCallback::new();
    let events_ref = callback.events.clone();
    reporter.register_formatter(ReportStyle::Json, Box::new(CallbackFormatter::new(callback)));

    let config = ReportConfig::new(5)
        .with_style(ReportStyle::Json)
        .with_role(Role::Server)
        .with_interval(Duration::from_secs(1))
        .with_connection(connection(5))
        .with_start_time(Timestamp::ZERO);
    let mut channel = reporter.create_channel(config, None).unwrap();
    for ms in [300, 600, 900, 1200] {
        channel.publish(PacketEvent::stream(4096, Timestamp::from_millis(ms)));
    }
    channel.mark_end(PacketEvent::end_of_stream(Timestamp::from_millis(1500)));
    channel.detach();

    let events = events_ref.lock().unwrap();
    assert_eq!(events.len(), 3, "connection, one interval and the final report");

    // The connection is always announced before any traffic report
    assert!(matches!(&events[0], ReportEvent::Connection(c) if c.transfer_id == 5));

    match &events[1] {
        ReportEvent::Transfer { snapshot, .. } => {
            assert_eq!(snapshot.kind, SnapshotKind::Interval);
            assert_eq!(snapshot.bytes, 3 * 4096);
            assert_eq!(snapshot.end, Duration::from_secs(1));
        }
        other => panic!("Expected an interval report, got {:?}", other),
    }

    match &events[2] {
        ReportEvent::Transfer { snapshot, .. } => {
            assert!(snapshot.is_final());
            assert_eq!(snapshot.bytes, 4 * 4096);
            assert_eq!(snapshot.end, Duration::from_millis(1500));
        }
        other => panic!("Expected the final report, got {:?}", other),
    }

    // A replaced formatter no longer writes to the sink
    assert!(output.contents().is_empty());
}

#[test]
fn test_closure_callback() {
    let (reporter, _output) = inline_reporter();
    let bytes = Arc::new(Mutex::new(Vec::new()));
    let bytes_clone = bytes.clone();
    reporter.register_formatter(
        ReportStyle::Default,
        Box::new(CallbackFormatter::new(move |event: ReportEvent| {
            if let ReportEvent::Transfer { snapshot, .. } = event {
                bytes_clone.lock().unwrap().push(snapshot.bytes);
            }
        })),
    );

    let config = ReportConfig::new(1).with_start_time(Timestamp::ZERO);
    let mut channel = reporter.create_channel(config, None).unwrap();
    channel.publish(PacketEvent::stream(100, Timestamp::from_millis(10)));
    channel.publish(PacketEvent::stream(200, Timestamp::from_millis(20)));
    channel.mark_end(PacketEvent::end_of_stream(Timestamp::from_millis(30)));
    drop(channel);

    // Without an interval only the final report is emitted
    assert_eq!(*bytes.lock().unwrap(), vec![300]);
}

#[test]
fn test_callback_receives_one_shot_reports() {
    let (reporter, _output) = inline_reporter();
    let callback = TestCallback::new();
    let events_ref = callback.events.clone();
    reporter.register_formatter(ReportStyle::Csv, Box::new(CallbackFormatter::new(callback)));

    let settings = SettingsSnapshot::new(0, Role::Listener, Protocol::Udp, 5001);
    let id = reporter.report_settings(settings, ReportStyle::Csv).unwrap();
    assert!(!reporter.is_pending(id), "inline reporters print one-shots immediately");
    reporter.report_connection(connection(3), ReportStyle::Csv).unwrap();

    let events = events_ref.lock().unwrap();
    assert_eq!(events.len(), 2);
    assert!(matches!(&events[0], ReportEvent::Settings(s) if s.port == 5001));
    assert!(matches!(&events[1], ReportEvent::Connection(c) if c.transfer_id == 3));
}

#[test]
fn test_callback_only_sees_its_style() {
    let (reporter, output) = inline_reporter();
    let callback = TestCallback::new();
    let events_ref = callback.events.clone();
    reporter.register_formatter(ReportStyle::Json, Box::new(CallbackFormatter::new(callback)));

    let config = ReportConfig::new(2).with_start_time(Timestamp::ZERO);
    let mut channel = reporter.create_channel(config, None).unwrap();
    channel.publish(PacketEvent::stream(1000, Timestamp::from_millis(500)));
    channel.mark_end(PacketEvent::end_of_stream(Timestamp::from_millis(1000)));
    channel.detach();

    assert!(events_ref.lock().unwrap().is_empty());
    assert!(output.contents().contains("[  2]"));
}
