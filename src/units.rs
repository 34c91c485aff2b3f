//! Unit selection and rendering for transfer and bandwidth columns.
//!
//! Lower-case formats render bits with decimal prefixes, upper-case formats
//! render bytes with binary prefixes. The adaptive formats pick the largest
//! prefix that keeps the value below 1000 (bits) or 1024 (bytes).

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnitFormat {
    AdaptiveBits,
    AdaptiveBytes,
    Bits,
    Bytes,
    KiloBits,
    KiloBytes,
    MegaBits,
    MegaBytes,
    GigaBits,
    GigaBytes,
}

impl Default for UnitFormat {
    fn default() -> Self {
        UnitFormat::AdaptiveBits
    }
}

const BYTE_LABELS: [&str; 4] = ["Byte", "KByte", "MByte", "GByte"];
const BIT_LABELS: [&str; 4] = ["bit", "Kbit", "Mbit", "Gbit"];

impl UnitFormat {
    /// Parses the single-letter form (`a`, `A`, `b`, `B`, `k`, `K`, ...).
    pub fn from_char(c: char) -> Option<Self> {
        let format = match c {
            'a' => UnitFormat::AdaptiveBits,
            'A' => UnitFormat::AdaptiveBytes,
            'b' => UnitFormat::Bits,
            'B' => UnitFormat::Bytes,
            'k' => UnitFormat::KiloBits,
            'K' => UnitFormat::KiloBytes,
            'm' => UnitFormat::MegaBits,
            'M' => UnitFormat::MegaBytes,
            'g' => UnitFormat::GigaBits,
            'G' => UnitFormat::GigaBytes,
            _ => return None,
        };
        Some(format)
    }

    pub fn as_char(&self) -> char {
        match self {
            UnitFormat::AdaptiveBits => 'a',
            UnitFormat::AdaptiveBytes => 'A',
            UnitFormat::Bits => 'b',
            UnitFormat::Bytes => 'B',
            UnitFormat::KiloBits => 'k',
            UnitFormat::KiloBytes => 'K',
            UnitFormat::MegaBits => 'm',
            UnitFormat::MegaBytes => 'M',
            UnitFormat::GigaBits => 'g',
            UnitFormat::GigaBytes => 'G',
        }
    }

    pub fn is_bits(&self) -> bool {
        self.as_char().is_ascii_lowercase()
    }

    /// The byte-valued twin used for the transfer column.
    pub fn to_bytes(&self) -> Self {
        UnitFormat::from_char(self.as_char().to_ascii_uppercase()).unwrap_or(*self)
    }

    /// Fixed prefix index, `None` for the adaptive formats.
    fn prefix(&self) -> Option<usize> {
        match self {
            UnitFormat::AdaptiveBits | UnitFormat::AdaptiveBytes => None,
            UnitFormat::Bits | UnitFormat::Bytes => Some(0),
            UnitFormat::KiloBits | UnitFormat::KiloBytes => Some(1),
            UnitFormat::MegaBits | UnitFormat::MegaBytes => Some(2),
            UnitFormat::GigaBits | UnitFormat::GigaBytes => Some(3),
        }
    }
}

impl fmt::Display for UnitFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// Renders a byte quantity in `format`, fitted into four places.
///
/// The label is singular ("MByte", "Kbit"); report lines append the plural
/// `s` and the `/sec` suffix themselves.
///
/// # Examples
///
/// ```
/// use rperf_reporter::units::{format_quantity, UnitFormat};
///
/// assert_eq!(format_quantity(3000.0, UnitFormat::AdaptiveBytes), "2.93 KByte");
/// assert_eq!(format_quantity(125_000.0, UnitFormat::AdaptiveBits), "1.00 Mbit");
/// ```
pub fn format_quantity(bytes: f64, format: UnitFormat) -> String {
    let bits = format.is_bits();
    let base = if bits { 1000.0 } else { 1024.0 };
    let mut value = if bits { bytes * 8.0 } else { bytes };

    let prefix = match format.prefix() {
        Some(p) => p,
        None => {
            let mut p = 0;
            let mut scaled = value;
            while scaled >= base && p < 3 {
                scaled /= base;
                p += 1;
            }
            p
        }
    };
    value /= base.powi(prefix as i32);

    let label = if bits { BIT_LABELS[prefix] } else { BYTE_LABELS[prefix] };
    if value < 9.995 {
        format!("{:4.2} {}", value, label)
    } else if value < 99.95 {
        format!("{:4.1} {}", value, label)
    } else {
        format!("{:4.0} {}", value, label)
    }
}
