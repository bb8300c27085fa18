use serde::{Deserialize, Serialize};
use std::fmt;

pub const OBIS_LEN: usize = 6;

/// Raw OBIS identifier as it appears in an SML list entry
/// (medium, channel, indicator, mode, tariff, previous).
pub type ObisCode = [u8; OBIS_LEN];

/// Phase reported by the tokenizer for the byte just consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmlState {
    Start,          // a new telegram begins
    Version,        // rest of the escape / version header
    ListStart,      // type-length field opening a list
    ListEntry,      // byte belonging to a list element
    ListEnd,        // last byte of a list element that closed one or more lists
    BlockEnd,       // end of message marker or padding
    End,            // escape sequence of the trailer
    Checksum,       // trailer bytes before the checksum is known
    ChecksumError,
    Final,
    Unexpected,
}

/// Events emitted by the framer once a telegram is done, one way or another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalEvent {
    FrameComplete,
    ChecksumError,
    BufferOverflow,
}

/// Logical reading an OBIS code is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObisField {
    Manufacturer,
    SerialNumber,
    EnergyFromGridTotal,
    EnergyToGridTotal,
    PowerFromGridTotal,
    PowerToGridTotal,
    PowerFromGridL1,
    PowerFromGridL2,
    PowerFromGridL3,
}

impl fmt::Display for ObisField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ObisField::Manufacturer => "Manufacturer",
            ObisField::SerialNumber => "Serialnumber",
            ObisField::EnergyFromGridTotal => "EnergyFromGridTotal",
            ObisField::EnergyToGridTotal => "EnergyToGridTotal",
            ObisField::PowerFromGridTotal => "PowerFromGridTotal",
            ObisField::PowerToGridTotal => "PowerToGridTotal",
            ObisField::PowerFromGridL1 => "PowerFromGridL1",
            ObisField::PowerFromGridL2 => "PowerFromGridL2",
            ObisField::PowerFromGridL3 => "PowerFromGridL3",
        };
        write!(f, "{}", name)
    }
}

/// How a closed list entry is matched against the OBIS table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// First table entry whose code occurs anywhere in the buffered frame.
    Scan,
    /// First table entry equal to the key of the list entry that just closed.
    Entry,
}

// SML-specific OBIS code format (6 bytes)
#[derive(Debug, Clone, PartialEq)]
pub struct SmlObisCode {
    pub medium: u8,      // 0: abstract, 1: electricity, etc.
    pub channel: u8,     // 0-255
    pub indicator: u8,   // Physical value indicator
    pub mode: u8,        // Processing method
    pub tariff: u8,      // Tariff/time
    pub previous: u8,    // Historical value indicator
}

impl SmlObisCode {
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() == OBIS_LEN {
            Some(SmlObisCode {
                medium: bytes[0],
                channel: bytes[1],
                indicator: bytes[2],
                mode: bytes[3],
                tariff: bytes[4],
                previous: bytes[5],
            })
        } else {
            None
        }
    }
}

impl fmt::Display for SmlObisCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}:{}.{}.{}*{}",
            self.medium, self.channel,
            self.indicator, self.mode,
            self.tariff, self.previous)
    }
}

/// Unit codes used by the Wh / W decoders
pub const SML_UNIT_WATT: u8 = 27;
pub const SML_UNIT_WATT_HOUR: u8 = 30;
