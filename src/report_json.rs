//! JSON lines report style: every report is one serialized object.

use crate::formatter::{ReportFormatter, Sink};
use crate::snapshot::{CombinedSnapshot, ConnectionSnapshot, SettingsSnapshot, TransferSnapshot};
use crate::Result;
use serde::Serialize;

#[derive(Debug)]
pub struct JsonFormatter {
    sink: Sink,
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Record<'a> {
    Transfer {
        #[serde(skip_serializing_if = "Option::is_none")]
        peer: Option<&'a str>,
        bits_per_second: f64,
        lost_percent: f64,
        snapshot: &'a TransferSnapshot,
    },
    Sum {
        bits_per_second: f64,
        lost_percent: f64,
        snapshot: &'a CombinedSnapshot,
    },
    Settings {
        settings: &'a SettingsSnapshot,
    },
    Connection {
        connection: &'a ConnectionSnapshot,
    },
    ServerReport {
        connection: &'a ConnectionSnapshot,
        bits_per_second: f64,
        lost_percent: f64,
        snapshot: &'a TransferSnapshot,
    },
}

impl JsonFormatter {
    pub fn new(sink: Sink) -> Self {
        Self { sink }
    }

    fn emit(&self, record: &Record<'_>) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        self.sink.write_str(&line)
    }
}

impl ReportFormatter for JsonFormatter {
    fn format_transfer(&mut self, snapshot: &TransferSnapshot, peer: Option<&str>) -> Result<()> {
        self.emit(&Record::Transfer {
            peer,
            bits_per_second: snapshot.bits_per_second(),
            lost_percent: snapshot.lost_percent(),
            snapshot,
        })
    }

    fn format_combined(&mut self, snapshot: &CombinedSnapshot) -> Result<()> {
        self.emit(&Record::Sum {
            bits_per_second: snapshot.bits_per_second(),
            lost_percent: snapshot.lost_percent(),
            snapshot,
        })
    }

    fn format_settings(&mut self, settings: &SettingsSnapshot) -> Result<()> {
        self.emit(&Record::Settings { settings })
    }

    fn format_connection(&mut self, connection: &ConnectionSnapshot) -> Result<Option<String>> {
        self.emit(&Record::Connection { connection })?;
        Ok(Some(connection.peer.to_string()))
    }

    fn format_server_relay(&mut self, connection: &ConnectionSnapshot, snapshot: &TransferSnapshot) -> Result<()> {
        self.emit(&Record::ServerReport {
            connection,
            bits_per_second: snapshot.bits_per_second(),
            lost_percent: snapshot.lost_percent(),
            snapshot,
        })
    }
}
