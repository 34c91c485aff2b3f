use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rperf_reporter::event::{PacketEvent, Timestamp};
use rperf_reporter::stats::StatisticsState;
use rperf_reporter::{Protocol, ReportConfig, Role, TransferSnapshot};
use std::time::Duration;

fn receiver() -> StatisticsState {
    let config = ReportConfig::new(1).with_protocol(Protocol::Udp).with_role(Role::Server);
    let mut state = StatisticsState::new(&config, None);
    state.start_at(Timestamp::ZERO);
    state
}

fn run(state: &mut StatisticsState, ids: &[i64]) -> TransferSnapshot {
    let mut out = Vec::new();
    for (i, id) in ids.iter().enumerate() {
        let t = Timestamp::from_millis(i as i64 + 1);
        state.ingest(&PacketEvent::datagram(*id, 100, t, t), &mut out);
    }
    let end = Timestamp::from_millis(ids.len() as i64 + 1);
    state.ingest(&PacketEvent::end_of_stream(end), &mut out);
    out.pop().unwrap()
}

#[test]
fn test_shuffled_arrivals_lose_nothing() {
    let mut rng = StdRng::seed_from_u64(0x1f2e3d);
    for round in 0..50 {
        let n = rng.gen_range(1..200);
        let mut ids: Vec<i64> = (1..=n).collect();
        ids.shuffle(&mut rng);

        let mut state = receiver();
        let total = run(&mut state, &ids);

        assert_eq!(total.errors, 0, "round {}: {:?}", round, ids);
        assert_eq!(total.sequence_total, n as u64);
        assert_eq!(state.errors(), state.out_of_order(), "round {}", round);
        assert_eq!(total.bytes, n as u64 * 100);
    }
}

#[test]
fn test_gaps_are_counted_as_losses() {
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..50 {
        let mut ids = Vec::new();
        let mut next = 0;
        let mut lost = 0;
        for _ in 0..rng.gen_range(1..100) {
            let gap = rng.gen_range(0..4);
            lost += gap;
            next += gap + 1;
            ids.push(next);
        }

        let mut state = receiver();
        let total = run(&mut state, &ids);

        assert_eq!(total.out_of_order, 0);
        assert_eq!(total.errors, lost as u64);
        assert_eq!(total.sequence_total, next as u64);
        assert!(total.lost_percent() <= 100.0);
    }
}

#[test]
fn test_interval_bytes_add_up_to_the_total() {
    let mut rng = StdRng::seed_from_u64(42);
    let config = ReportConfig::new(1).with_interval(Duration::from_millis(250));
    let mut state = StatisticsState::new(&config, None);
    state.start_at(Timestamp::ZERO);

    let mut out = Vec::new();
    let mut t = 0;
    for _ in 0..1000 {
        t += rng.gen_range(0..5);
        state.ingest(&PacketEvent::stream(rng.gen_range(1..1500), Timestamp::from_millis(t)), &mut out);
    }
    state.ingest(&PacketEvent::end_of_stream(Timestamp::from_millis(t + 1)), &mut out);

    let total = out.pop().unwrap();
    assert!(total.is_final());
    let interval_bytes: u64 = out.iter().map(|s| s.bytes).sum();
    assert!(interval_bytes <= total.bytes);

    // Windows tile the timeline without gaps
    for pair in out.windows(2) {
        assert_eq!(pair[0].end, pair[1].start);
        assert_eq!(pair[1].end - pair[1].start, Duration::from_millis(250));
    }
}
