//! The human-readable iperf report style.

use crate::config::{Protocol, Role};
use crate::formatter::{ReportFormatter, Sink};
use crate::snapshot::{CombinedSnapshot, ConnectionSnapshot, SettingsSnapshot, TransferSnapshot};
use crate::units::{format_quantity, UnitFormat};
use crate::Result;
use std::fmt::Write as _;

const SEPARATOR: &str = "------------------------------------------------------------\n";
const BANDWIDTH_HEADER: &str = "[ ID] Interval       Transfer     Bandwidth\n";
const DATAGRAM_HEADER: &str = "[ ID] Interval       Transfer     Bandwidth       Jitter   Lost/Total Datagrams\n";
const NO_PATH_MTU_WARNING: &str = "WARNING: Path MTU Discovery may not be enabled.\n";

/// Prints iperf-style text. Column headers are printed once, before the
/// first line that needs them.
#[derive(Debug)]
pub struct DefaultFormatter {
    sink: Sink,
    bandwidth_header: bool,
    datagram_header: bool,
}

/// The fields a stats line needs, shared by per-stream and summed lines.
struct Line<'a> {
    id: &'a str,
    start: f64,
    end: f64,
    seconds: f64,
    bytes: u64,
    unit_format: UnitFormat,
    datagram_columns: Option<DatagramColumns>,
    sent_datagrams: Option<u64>,
}

struct DatagramColumns {
    jitter: f64,
    errors: u64,
    total: u64,
    lost_percent: f64,
    out_of_order: u64,
}

impl DefaultFormatter {
    pub fn new(sink: Sink) -> Self {
        Self {
            sink,
            bandwidth_header: false,
            datagram_header: false,
        }
    }

    fn header(&mut self, datagrams: bool, out: &mut String) {
        if datagrams && !self.datagram_header {
            out.push_str(DATAGRAM_HEADER);
            self.datagram_header = true;
        } else if !datagrams && !self.bandwidth_header {
            out.push_str(BANDWIDTH_HEADER);
            self.bandwidth_header = true;
        }
    }

    fn stats_text(&mut self, line: &Line<'_>) -> String {
        let mut out = String::new();
        self.header(line.datagram_columns.is_some(), &mut out);

        let transfer = format_quantity(line.bytes as f64, line.unit_format.to_bytes());
        let rate = if line.seconds > 0.0 {
            line.bytes as f64 / line.seconds
        } else {
            0.0
        };
        let bandwidth = format_quantity(rate, line.unit_format);
        let _ = write!(
            out,
            "[{}] {:4.1}-{:4.1} sec  {}s  {}s/sec",
            line.id, line.start, line.end, transfer, bandwidth
        );

        match &line.datagram_columns {
            Some(udp) => {
                let _ = writeln!(
                    out,
                    "  {:5.3} ms {:4}/{:5} ({}%)",
                    udp.jitter * 1000.0,
                    udp.errors,
                    udp.total,
                    format_general(udp.lost_percent)
                );
                if udp.out_of_order > 0 {
                    let _ = writeln!(
                        out,
                        "[{}] {:4.1}-{:4.1} sec  {} datagrams received out-of-order",
                        line.id, line.start, line.end, udp.out_of_order
                    );
                }
            }
            None => out.push('\n'),
        }
        if let Some(sent) = line.sent_datagrams {
            let _ = writeln!(out, "[{}] Sent {} datagrams", line.id, sent);
        }
        out
    }

    fn transfer_text(&mut self, snapshot: &TransferSnapshot) -> String {
        let id = format!("{:3}", snapshot.transfer_id);
        let line = Line {
            id: &id,
            start: snapshot.start.as_secs_f64(),
            end: snapshot.end.as_secs_f64(),
            seconds: snapshot.seconds(),
            bytes: snapshot.bytes,
            unit_format: snapshot.unit_format,
            datagram_columns: snapshot.reports_datagrams().then(|| DatagramColumns {
                jitter: snapshot.jitter,
                errors: snapshot.errors,
                total: snapshot.sequence_total,
                lost_percent: snapshot.lost_percent(),
                out_of_order: snapshot.out_of_order,
            }),
            sent_datagrams: sends_datagrams(snapshot.is_final(), snapshot.protocol, snapshot.role)
                .then_some(snapshot.sequence_total),
        };
        let mut out = self.stats_text(&line);
        if let Some(mss) = snapshot.mss.filter(|_| snapshot.is_final() && snapshot.protocol == Protocol::Tcp) {
            out.push_str(&mss_text(&id, mss));
        }
        out
    }
}

/// Networks recognised from the MSS: `MTU - 80 <= mss <= MTU - 40`, i.e. a
/// 40 byte IP/TCP header plus up to 40 bytes of options.
const KNOWN_MTUS: [(u32, &str); 5] = [
    (1500, "ethernet"),
    (4352, "FDDI"),
    (9180, "ATM"),
    (65280, "HIPPI"),
    (576, "minimum"),
];

fn mss_text(id: &str, mss: u32) -> String {
    if mss == 0 {
        return format!("[{}] MSS and MTU size unknown (TCP_MAXSEG not supported by OS?)\n", id);
    }
    let known = KNOWN_MTUS
        .iter()
        .find(|(mtu, _)| mtu - 40 >= mss && mss >= mtu - 80);
    let (mtu, net) = known.copied().unwrap_or((mss.saturating_add(40), "unknown interface"));
    let mut out = String::new();
    if mtu == 576 {
        out.push_str(NO_PATH_MTU_WARNING);
    }
    let _ = writeln!(out, "[{}] MSS size {} bytes (MTU {} bytes, {})", id, mss, mtu, net);
    out
}

fn sends_datagrams(is_final: bool, protocol: Protocol, role: Role) -> bool {
    is_final && protocol == Protocol::Udp && role == Role::Client
}

fn protocol_name(protocol: Protocol) -> &'static str {
    match protocol {
        Protocol::Tcp => "TCP",
        Protocol::Udp => "UDP",
    }
}

impl ReportFormatter for DefaultFormatter {
    fn format_transfer(&mut self, snapshot: &TransferSnapshot, _peer: Option<&str>) -> Result<()> {
        let text = self.transfer_text(snapshot);
        self.sink.write_str(&text)
    }

    fn format_combined(&mut self, snapshot: &CombinedSnapshot) -> Result<()> {
        let line = Line {
            id: "SUM",
            start: snapshot.start.as_secs_f64(),
            end: snapshot.end.as_secs_f64(),
            seconds: snapshot.seconds(),
            bytes: snapshot.bytes,
            unit_format: snapshot.unit_format,
            datagram_columns: snapshot.reports_datagrams().then(|| DatagramColumns {
                jitter: snapshot.jitter,
                errors: snapshot.errors,
                total: snapshot.sequence_total,
                lost_percent: snapshot.lost_percent(),
                out_of_order: snapshot.out_of_order,
            }),
            sent_datagrams: sends_datagrams(snapshot.is_final(), snapshot.protocol, snapshot.role)
                .then_some(snapshot.sequence_total),
        };
        let text = self.stats_text(&line);
        self.sink.write_str(&text)
    }

    fn format_settings(&mut self, settings: &SettingsSnapshot) -> Result<()> {
        let mut out = String::from(SEPARATOR);
        let protocol = protocol_name(settings.protocol);
        if settings.role == Role::Listener {
            let _ = writeln!(out, "Server listening on {} port {}", protocol, settings.port);
        } else {
            let host = settings.host.as_deref().unwrap_or("");
            let _ = writeln!(out, "Client connecting to {}, {} port {}", host, protocol, settings.port);
        }
        if let Some(bind) = &settings.bind_host {
            let _ = writeln!(out, "Binding to local address {}", bind);
            if settings.multicast {
                let _ = writeln!(out, "Joining multicast group  {}", bind);
            }
        }
        if settings.protocol == Protocol::Udp {
            let verb = if settings.role == Role::Listener {
                "Receiving"
            } else {
                "Sending"
            };
            let _ = writeln!(out, "{} {} byte datagrams", verb, settings.buffer_len);
            if settings.multicast {
                if let Some(ttl) = settings.ttl {
                    let _ = writeln!(out, "Setting multicast TTL to {}", ttl);
                }
            }
        }

        let byte_format = settings.unit_format.to_bytes();
        let window_label = match settings.protocol {
            Protocol::Tcp => "TCP window size",
            Protocol::Udp => "UDP buffer size",
        };
        let _ = write!(
            out,
            "{}: {}",
            window_label,
            format_quantity(settings.window_actual as f64, byte_format)
        );
        if settings.window_requested == 0 {
            out.push_str(" (default)");
        } else if settings.window_actual != settings.window_requested {
            let _ = write!(
                out,
                " (WARNING: requested {})",
                format_quantity(settings.window_requested as f64, byte_format)
            );
        }
        out.push('\n');
        out.push_str(SEPARATOR);
        self.sink.write_str(&out)
    }

    fn format_connection(&mut self, connection: &ConnectionSnapshot) -> Result<Option<String>> {
        if connection.transfer_id > 0 {
            let line = format!(
                "[{:3}] local {} port {} connected with {} port {}\n",
                connection.transfer_id,
                connection.local.ip(),
                connection.local.port(),
                connection.peer.ip(),
                connection.peer.port()
            );
            self.sink.write_str(&line)?;
        }
        Ok(None)
    }

    fn format_server_relay(&mut self, _connection: &ConnectionSnapshot, snapshot: &TransferSnapshot) -> Result<()> {
        let mut text = format!("[{:3}] Server Report:\n", snapshot.transfer_id);
        text.push_str(&self.transfer_text(snapshot));
        self.sink.write_str(&text)
    }
}

/// Two significant digits, switching to exponent notation for very large or
/// small values the way printf's `%.2g` does.
fn format_general(value: f64) -> String {
    if value == 0.0 || !value.is_finite() {
        return format!("{}", value);
    }
    let scientific = format!("{:.1e}", value);
    let (mantissa, exponent) = match scientific.split_once('e') {
        Some((m, e)) => (m, e.parse::<i32>().unwrap_or(0)),
        None => (scientific.as_str(), 0),
    };
    if !(-4..2).contains(&exponent) {
        let mantissa = mantissa.trim_end_matches('0').trim_end_matches('.');
        let sign = if exponent < 0 { '-' } else { '+' };
        return format!("{}e{}{:02}", mantissa, sign, exponent.abs());
    }
    let decimals = (1 - exponent).max(0) as usize;
    let fixed = format!("{:.*}", decimals, value);
    if fixed.contains('.') {
        fixed.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        fixed
    }
}
