use rperf_reporter::event::{PacketEvent, Timestamp};
use rperf_reporter::formatter::MemoryWriter;
use rperf_reporter::{Driver, Protocol, ReportConfig, Reporter, ReporterOptions, Role, StartMode};
use std::sync::Arc;
use std::time::Duration;

fn background_reporter() -> (Arc<Reporter>, MemoryWriter) {
    let output = MemoryWriter::new();
    let options = ReporterOptions::new().with_driver(Driver::Background);
    let reporter = Reporter::init_with_writer(options, Box::new(output.clone())).unwrap();
    (Arc::new(reporter), output)
}

#[tokio::test]
async fn test_finish_async_returns_final_snapshot() {
    let (reporter, _output) = background_reporter();
    let config = ReportConfig::new(1)
        .with_protocol(Protocol::Udp)
        .with_role(Role::Server)
        .with_start_time(Timestamp::ZERO);
    let mut channel = reporter.create_channel(config, None).unwrap();

    for id in [1, 2, 4, 3] {
        let t = Timestamp::from_millis(id * 10);
        channel.publish(PacketEvent::datagram(id, 512, t, t));
    }
    let total = channel
        .finish_async(PacketEvent::end_of_stream(Timestamp::from_millis(50)))
        .await
        .unwrap();

    assert_eq!(total.bytes, 4 * 512);
    assert_eq!(total.sequence_total, 4);
    assert_eq!(total.out_of_order, 1);
    assert_eq!(total.errors, 0, "a late datagram is not a loss");
    assert_eq!(total.end, Duration::from_millis(50));

    reporter.shutdown().unwrap();
    assert_eq!(reporter.pending_reports(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_streams_from_tasks() {
    let (reporter, output) = background_reporter();
    let group = reporter.create_coordinator(3, StartMode::FirstArrival).unwrap();

    let mut channels = Vec::new();
    for id in 1..=3 {
        channels.push(reporter.create_channel(ReportConfig::new(id), Some(group.clone())).unwrap());
    }

    let mut handles = Vec::new();
    for mut channel in channels {
        handles.push(tokio::spawn(async move {
            for _ in 0..100 {
                channel.publish(PacketEvent::stream(1024, Timestamp::now()));
                tokio::task::yield_now().await;
            }
            channel
                .finish_async(PacketEvent::end_of_stream(Timestamp::now()))
                .await
        }));
    }

    let mut total_bytes = 0;
    for handle in handles {
        let snapshot = handle.await.unwrap().unwrap();
        assert_eq!(snapshot.bytes, 100 * 1024);
        total_bytes += snapshot.bytes;
    }

    let sum = group.final_sum().expect("group should have a final sum");
    assert_eq!(sum.bytes, total_bytes);
    assert_eq!(sum.contributions, 3);

    reporter.shutdown().unwrap();
    assert!(output.contents().contains("[SUM]"));
}

#[tokio::test]
async fn test_create_channel_after_shutdown_fails() {
    let (reporter, _output) = background_reporter();
    reporter.shutdown().unwrap();
    // Idempotent
    reporter.shutdown().unwrap();

    let result = reporter.create_channel(ReportConfig::new(1), None);
    assert!(result.is_err());
}
