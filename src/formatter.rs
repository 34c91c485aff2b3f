//! Formatter dispatch: one [`ReportFormatter`] per [`ReportStyle`].
//!
//! The aggregator never formats anything itself. Every report it produces is
//! handed to the formatter registered for the style the report was created
//! with. The built-in styles write to a shared [`Sink`]; embedders can
//! replace any style, for example with a [`CallbackFormatter`].

use crate::config::ReportStyle;
use crate::report_csv::CsvFormatter;
use crate::report_default::DefaultFormatter;
use crate::report_json::JsonFormatter;
use crate::snapshot::{CombinedSnapshot, ConnectionSnapshot, SettingsSnapshot, TransferSnapshot};
use crate::Result;
use log::error;
use parking_lot::Mutex;
use std::io::{self, Write};
use std::sync::Arc;

/// Formatting functions for one report style.
///
/// Every method has a no-op default, so a formatter only implements the
/// reports it cares about.
pub trait ReportFormatter: Send {
    /// One stream's interval or final statistics. `peer` is the label the
    /// connection formatter returned for this stream, if any.
    fn format_transfer(&mut self, snapshot: &TransferSnapshot, peer: Option<&str>) -> Result<()> {
        let _ = (snapshot, peer);
        Ok(())
    }

    /// Sum over the streams of one multi-stream group.
    fn format_combined(&mut self, snapshot: &CombinedSnapshot) -> Result<()> {
        let _ = snapshot;
        Ok(())
    }

    fn format_settings(&mut self, settings: &SettingsSnapshot) -> Result<()> {
        let _ = settings;
        Ok(())
    }

    /// Announces a connection. The returned label is handed to every
    /// transfer line of the channel the connection belongs to.
    fn format_connection(&mut self, connection: &ConnectionSnapshot) -> Result<Option<String>> {
        let _ = connection;
        Ok(None)
    }

    /// Statistics the remote receiver computed and sent back.
    fn format_server_relay(&mut self, connection: &ConnectionSnapshot, snapshot: &TransferSnapshot) -> Result<()> {
        let _ = (connection, snapshot);
        Ok(())
    }
}

/// Output shared by the built-in formatters.
#[derive(Clone)]
pub struct Sink {
    inner: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Sink {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(writer)),
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    /// Writes `text` and flushes, so lines from different styles never interleave.
    pub fn write_str(&self, text: &str) -> Result<()> {
        let mut writer = self.inner.lock();
        writer.write_all(text.as_bytes())?;
        writer.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sink").finish_non_exhaustive()
    }
}

/// In-memory writer whose contents stay readable after it is handed to a [`Sink`].
///
/// # Examples
///
/// ```
/// use rperf_reporter::formatter::{MemoryWriter, Sink};
///
/// let writer = MemoryWriter::new();
/// let sink = Sink::new(Box::new(writer.clone()));
/// sink.write_str("hello\n").unwrap();
/// assert_eq!(writer.contents(), "hello\n");
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock()).into_owned()
    }
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A report as seen by a [`ReportCallback`].
#[derive(Debug, Clone)]
pub enum ReportEvent {
    Transfer {
        snapshot: TransferSnapshot,
        peer: Option<String>,
    },
    Combined(CombinedSnapshot),
    Settings(SettingsSnapshot),
    Connection(ConnectionSnapshot),
    ServerRelay {
        connection: ConnectionSnapshot,
        snapshot: TransferSnapshot,
    },
}

/// Receives every report of the styles it is registered for.
///
/// Implemented for any `Fn(ReportEvent) + Send + Sync` closure.
///
/// # Examples
///
/// ```
/// use rperf_reporter::formatter::{CallbackFormatter, ReportEvent};
/// use rperf_reporter::{ReportStyle, Reporter, ReporterOptions};
///
/// let reporter = Reporter::init(ReporterOptions::new()).unwrap();
/// reporter.register_formatter(
///     ReportStyle::Json,
///     Box::new(CallbackFormatter::new(|event: ReportEvent| {
///         if let ReportEvent::Transfer { snapshot, .. } = event {
///             println!("{} bytes", snapshot.bytes);
///         }
///     })),
/// );
/// reporter.shutdown().unwrap();
/// ```
pub trait ReportCallback: Send + Sync {
    fn on_report(&self, event: ReportEvent);
}

impl<F> ReportCallback for F
where
    F: Fn(ReportEvent) + Send + Sync,
{
    fn on_report(&self, event: ReportEvent) {
        self(event)
    }
}

/// Adapts a [`ReportCallback`] to the formatter interface.
pub struct CallbackFormatter<C> {
    callback: C,
}

impl<C: ReportCallback> CallbackFormatter<C> {
    pub fn new(callback: C) -> Self {
        Self { callback }
    }
}

impl<C: ReportCallback> ReportFormatter for CallbackFormatter<C> {
    fn format_transfer(&mut self, snapshot: &TransferSnapshot, peer: Option<&str>) -> Result<()> {
        self.callback.on_report(ReportEvent::Transfer {
            snapshot: snapshot.clone(),
            peer: peer.map(str::to_string),
        });
        Ok(())
    }

    fn format_combined(&mut self, snapshot: &CombinedSnapshot) -> Result<()> {
        self.callback.on_report(ReportEvent::Combined(snapshot.clone()));
        Ok(())
    }

    fn format_settings(&mut self, settings: &SettingsSnapshot) -> Result<()> {
        self.callback.on_report(ReportEvent::Settings(settings.clone()));
        Ok(())
    }

    fn format_connection(&mut self, connection: &ConnectionSnapshot) -> Result<Option<String>> {
        self.callback.on_report(ReportEvent::Connection(connection.clone()));
        Ok(None)
    }

    fn format_server_relay(&mut self, connection: &ConnectionSnapshot, snapshot: &TransferSnapshot) -> Result<()> {
        self.callback.on_report(ReportEvent::ServerRelay {
            connection: connection.clone(),
            snapshot: snapshot.clone(),
        });
        Ok(())
    }
}

/// Maps each [`ReportStyle`] to its formatter. Failures are logged, never
/// propagated: a broken output must not stop the aggregator.
pub struct FormatterRegistry {
    formatters: [Box<dyn ReportFormatter>; 3],
}

impl FormatterRegistry {
    /// Built-in formatters for every style, all writing to `sink`.
    pub fn new(sink: Sink) -> Self {
        Self {
            formatters: [
                Box::new(DefaultFormatter::new(sink.clone())),
                Box::new(CsvFormatter::new(sink.clone())),
                Box::new(JsonFormatter::new(sink)),
            ],
        }
    }

    pub fn register(&mut self, style: ReportStyle, formatter: Box<dyn ReportFormatter>) {
        self.formatters[index(style)] = formatter;
    }

    pub fn transfer(&mut self, style: ReportStyle, snapshot: &TransferSnapshot, peer: Option<&str>) {
        if let Err(e) = self.formatters[index(style)].format_transfer(snapshot, peer) {
            error!("failed to format transfer report {}: {}", snapshot.transfer_id, e);
        }
    }

    pub fn combined(&mut self, style: ReportStyle, snapshot: &CombinedSnapshot) {
        if let Err(e) = self.formatters[index(style)].format_combined(snapshot) {
            error!("failed to format sum of group {}: {}", snapshot.group_id, e);
        }
    }

    pub fn settings(&mut self, style: ReportStyle, settings: &SettingsSnapshot) {
        if let Err(e) = self.formatters[index(style)].format_settings(settings) {
            error!("failed to format settings: {}", e);
        }
    }

    pub fn connection(&mut self, style: ReportStyle, connection: &ConnectionSnapshot) -> Option<String> {
        match self.formatters[index(style)].format_connection(connection) {
            Ok(label) => label,
            Err(e) => {
                error!("failed to format connection {}: {}", connection.transfer_id, e);
                None
            }
        }
    }

    pub fn server_relay(&mut self, style: ReportStyle, connection: &ConnectionSnapshot, snapshot: &TransferSnapshot) {
        if let Err(e) = self.formatters[index(style)].format_server_relay(connection, snapshot) {
            error!("failed to format server report {}: {}", snapshot.transfer_id, e);
        }
    }
}

fn index(style: ReportStyle) -> usize {
    match style {
        ReportStyle::Default => 0,
        ReportStyle::Csv => 1,
        ReportStyle::Json => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Protocol, Role};
    use std::net::SocketAddr;

    struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn connection() -> ConnectionSnapshot {
        let local: SocketAddr = "10.0.0.1:5001".parse().unwrap();
        let peer: SocketAddr = "10.0.0.2:40000".parse().unwrap();
        ConnectionSnapshot::new(4, local, peer)
    }

    #[test]
    fn test_registered_formatter_replaces_style() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_writer = MemoryWriter::new();
        let mut registry = FormatterRegistry::new(Sink::new(Box::new(sink_writer.clone())));

        let events = Arc::clone(&seen);
        registry.register(
            ReportStyle::Csv,
            Box::new(CallbackFormatter::new(move |event: ReportEvent| {
                events.lock().push(event);
            })),
        );

        let settings = SettingsSnapshot::new(4, Role::Listener, Protocol::Tcp, 5001);
        registry.settings(ReportStyle::Csv, &settings);
        assert!(registry.connection(ReportStyle::Csv, &connection()).is_none());

        assert_eq!(seen.lock().len(), 2);
        assert!(matches!(seen.lock()[0], ReportEvent::Settings(_)));
        assert!(sink_writer.contents().is_empty());
    }

    #[test]
    fn test_write_failure_is_swallowed() {
        let mut registry = FormatterRegistry::new(Sink::new(Box::new(FailingWriter)));
        let settings = SettingsSnapshot::new(4, Role::Listener, Protocol::Udp, 5001);
        registry.settings(ReportStyle::Default, &settings);
        assert!(registry.connection(ReportStyle::Default, &connection()).is_none());
    }

    #[test]
    fn test_default_trait_methods_are_noops() {
        struct Silent;
        impl ReportFormatter for Silent {}

        let mut silent = Silent;
        assert!(silent.format_connection(&connection()).unwrap().is_none());
        let settings = SettingsSnapshot::new(1, Role::Client, Protocol::Tcp, 5001);
        assert!(silent.format_settings(&settings).is_ok());
    }
}
