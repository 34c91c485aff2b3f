//! Comma-separated report style, one line per report.
//!
//! Columns: timestamp, local address, local port, peer address, peer port,
//! transfer id, interval, bytes, bits/sec and, for UDP receivers, jitter
//! (ms), lost, total, lost percent and out-of-order. Summed lines carry
//! transfer id `-1`.

use crate::formatter::{ReportFormatter, Sink};
use crate::snapshot::{CombinedSnapshot, ConnectionSnapshot, TransferSnapshot};
use crate::Result;
use chrono::Local;

const NO_PEER: &str = ",,,";

#[derive(Debug)]
pub struct CsvFormatter {
    sink: Sink,
}

struct Row<'a> {
    peer: Option<&'a str>,
    transfer_id: i64,
    start: f64,
    end: f64,
    bytes: u64,
    seconds: f64,
    datagrams: Option<(f64, u64, u64, f64, u64)>,
}

impl CsvFormatter {
    pub fn new(sink: Sink) -> Self {
        Self { sink }
    }

    fn write_row(&self, row: Row<'_>) -> Result<()> {
        let speed = if row.seconds > 0.0 {
            (row.bytes as f64 * 8.0 / row.seconds) as u64
        } else {
            0
        };
        let mut line = format!(
            "{},{},{},{:.1}-{:.1},{},{}",
            timestamp(),
            row.peer.unwrap_or(NO_PEER),
            row.transfer_id,
            row.start,
            row.end,
            row.bytes,
            speed
        );
        if let Some((jitter, errors, total, lost_percent, out_of_order)) = row.datagrams {
            line.push_str(&format!(
                ",{:.3},{},{},{:.3},{}",
                jitter * 1000.0,
                errors,
                total,
                lost_percent,
                out_of_order
            ));
        }
        line.push('\n');
        self.sink.write_str(&line)
    }
}

fn timestamp() -> String {
    Local::now().format("%Y%m%d%H%M%S").to_string()
}

/// `local,port,peer,port` as used in the peer columns.
pub fn peer_label(connection: &ConnectionSnapshot) -> String {
    format!(
        "{},{},{},{}",
        connection.local.ip(),
        connection.local.port(),
        connection.peer.ip(),
        connection.peer.port()
    )
}

fn transfer_row<'a>(snapshot: &TransferSnapshot, peer: Option<&'a str>) -> Row<'a> {
    Row {
        peer,
        transfer_id: i64::from(snapshot.transfer_id),
        start: snapshot.start.as_secs_f64(),
        end: snapshot.end.as_secs_f64(),
        bytes: snapshot.bytes,
        seconds: snapshot.seconds(),
        datagrams: snapshot.reports_datagrams().then(|| {
            (
                snapshot.jitter,
                snapshot.errors,
                snapshot.sequence_total,
                snapshot.lost_percent(),
                snapshot.out_of_order,
            )
        }),
    }
}

impl ReportFormatter for CsvFormatter {
    fn format_transfer(&mut self, snapshot: &TransferSnapshot, peer: Option<&str>) -> Result<()> {
        self.write_row(transfer_row(snapshot, peer))
    }

    fn format_combined(&mut self, snapshot: &CombinedSnapshot) -> Result<()> {
        self.write_row(Row {
            peer: None,
            transfer_id: -1,
            start: snapshot.start.as_secs_f64(),
            end: snapshot.end.as_secs_f64(),
            bytes: snapshot.bytes,
            seconds: snapshot.seconds(),
            datagrams: snapshot.reports_datagrams().then(|| {
                (
                    snapshot.jitter,
                    snapshot.errors,
                    snapshot.sequence_total,
                    snapshot.lost_percent(),
                    snapshot.out_of_order,
                )
            }),
        })
    }

    // Settings are not part of the CSV stream.

    fn format_connection(&mut self, connection: &ConnectionSnapshot) -> Result<Option<String>> {
        Ok(Some(peer_label(connection)))
    }

    fn format_server_relay(&mut self, connection: &ConnectionSnapshot, snapshot: &TransferSnapshot) -> Result<()> {
        let peer = peer_label(connection);
        self.write_row(transfer_row(snapshot, Some(&peer)))
    }
}
