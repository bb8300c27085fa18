use super::structs::*;
use crc16::{State, X_25};
use log::debug;

// SML Constants
pub const SML_ESCAPE: u8 = 0x1B;
const SML_VERSION: u8 = 0x01;
const SML_END_MARKER: u8 = 0x1A;
const SML_END_OF_MESSAGE: u8 = 0x00;
pub const SML_ESCAPE_COUNT: u8 = 4;

const MAX_TREE_DEPTH: usize = 10;
const MAX_LIST_ELEMENTS: usize = 16;
const MAX_ELEMENT_BYTES: usize = 32;

// Positions inside a value list entry
const ENTRY_OBJ_NAME: usize = 0;
const ENTRY_UNIT: usize = 3;
const ENTRY_SCALER: usize = 4;
const ENTRY_VALUE: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SmlElementKind {
    OctetString,
    Boolean,
    Integer,
    Unsigned,
    List,
    EndOfMessage,
}

impl SmlElementKind {
    fn from_type_field(type_field: u8) -> Option<Self> {
        match type_field {
            0 => Some(SmlElementKind::OctetString),
            4 => Some(SmlElementKind::Boolean),
            5 => Some(SmlElementKind::Integer),
            6 => Some(SmlElementKind::Unsigned),
            7 => Some(SmlElementKind::List),
            _ => None,
        }
    }
}

/// One decoded element of a list. Lists nested in a list only leave a
/// placeholder behind, their content is reported when they close.
#[derive(Debug, Clone, PartialEq)]
pub struct SmlElement {
    pub kind: SmlElementKind,
    pub bytes: Vec<u8>,
}

impl SmlElement {
    fn new(kind: SmlElementKind) -> Self {
        Self { kind, bytes: Vec::new() }
    }

    fn as_signed(&self) -> Option<i64> {
        if self.bytes.is_empty() || self.bytes.len() > 8 {
            return None;
        }
        let mut buf = if self.bytes[0] & 0x80 != 0 { [0xFF; 8] } else { [0x00; 8] };
        buf[8 - self.bytes.len()..].copy_from_slice(&self.bytes);
        Some(i64::from_be_bytes(buf))
    }

    fn as_unsigned(&self) -> Option<u64> {
        if self.bytes.is_empty() || self.bytes.len() > 8 {
            return None;
        }
        let mut buf = [0x00; 8];
        buf[8 - self.bytes.len()..].copy_from_slice(&self.bytes);
        Some(u64::from_be_bytes(buf))
    }

    fn as_number(&self) -> Option<f64> {
        match self.kind {
            SmlElementKind::Integer => self.as_signed().map(|v| v as f64),
            SmlElementKind::Unsigned => self.as_unsigned().map(|v| v as f64),
            _ => None,
        }
    }
}

struct ListLevel {
    remaining: usize,
    elements: Vec<SmlElement>,
}

enum Cursor {
    Idle { escapes: u8 },
    Version { remaining: u8 },
    TypeLength,
    ExtendedTypeLength { kind: SmlElementKind, length: usize, tl_bytes: usize },
    Data { element: SmlElement, remaining: usize },
    Trailer { position: u8 },
}

/// Byte-at-a-time SML tokenizer. One instance per read head, there is no
/// shared parser state between heads.
pub struct SmlTokenizer {
    cursor: Cursor,
    levels: Vec<ListLevel>,
    closed_entry: Vec<SmlElement>,
    escape_run: u8,
    crc: State<X_25>,
    crc_expected: u16,
    crc_low: u8,
}

impl SmlTokenizer {
    pub fn new() -> Self {
        Self {
            cursor: Cursor::Idle { escapes: 0 },
            levels: Vec::with_capacity(MAX_TREE_DEPTH),
            closed_entry: Vec::with_capacity(MAX_LIST_ELEMENTS),
            escape_run: 0,
            crc: State::<X_25>::new(),
            crc_expected: 0,
            crc_low: 0,
        }
    }

    /// Drops any telegram in progress and waits for the next escape sequence.
    pub fn reset(&mut self) {
        self.cursor = Cursor::Idle { escapes: 0 };
        self.levels.clear();
        self.escape_run = 0;
    }

    pub fn advance(&mut self, byte: u8) -> SmlState {
        let in_body = matches!(
            self.cursor,
            Cursor::TypeLength | Cursor::ExtendedTypeLength { .. } | Cursor::Data { .. }
        );
        if in_body { self.transport(byte) } else { self.deliver(byte) }
    }

    /// Escape layer of the message body. Escape bytes are held back until the
    /// run ends. Eight in a row stand for four payload bytes. Four followed
    /// by 0x1A open the trailer, four or more followed by the version byte
    /// start a new telegram.
    fn transport(&mut self, byte: u8) -> SmlState {
        self.crc.update(&[byte]);

        if byte == SML_ESCAPE {
            self.escape_run += 1;
            if self.escape_run == 2 * SML_ESCAPE_COUNT {
                self.escape_run = 0;
                return self.release(SML_ESCAPE_COUNT, None);
            }
            return if self.escape_run >= SML_ESCAPE_COUNT { SmlState::End } else { SmlState::ListEntry };
        }

        let run = std::mem::take(&mut self.escape_run);
        if run < SML_ESCAPE_COUNT {
            return self.release(run, Some(byte));
        }

        match byte {
            SML_END_MARKER if run == SML_ESCAPE_COUNT => {
                self.levels.clear();
                self.cursor = Cursor::Trailer { position: 1 };
                SmlState::Checksum
            }
            SML_VERSION => {
                debug!("SML telegram broken off by a new escape sequence at list level {}", self.levels.len());
                self.restart();
                SmlState::Start
            }
            _ => self.unexpected(byte),
        }
    }

    /// Hands held escape bytes, then `byte`, to the structure decoder. A list
    /// that closed on the way is still reported.
    fn release(&mut self, escapes: u8, byte: Option<u8>) -> SmlState {
        let mut phase = SmlState::ListEntry;
        let mut closed = false;
        for b in std::iter::repeat(SML_ESCAPE).take(escapes as usize).chain(byte) {
            phase = self.deliver(b);
            closed |= phase == SmlState::ListEnd;
        }
        if closed && matches!(phase, SmlState::ListEntry | SmlState::ListStart) {
            return SmlState::ListEnd;
        }
        phase
    }

    /// Checksum and structure start over after `1B1B1B1B 01`.
    fn restart(&mut self) {
        self.crc = State::<X_25>::new();
        self.crc.update(&[SML_ESCAPE; SML_ESCAPE_COUNT as usize]);
        self.crc.update(&[SML_VERSION]);
        self.levels.clear();
        self.escape_run = 0;
        self.cursor = Cursor::Version { remaining: 3 };
    }

    fn deliver(&mut self, byte: u8) -> SmlState {
        let cursor = std::mem::replace(&mut self.cursor, Cursor::Idle { escapes: 0 });

        match cursor {
            Cursor::Idle { escapes } => self.idle(escapes, byte),
            Cursor::Version { remaining } => {
                self.crc.update(&[byte]);
                if byte != SML_VERSION {
                    return self.unexpected(byte);
                }
                self.cursor = match remaining - 1 {
                    0 => Cursor::TypeLength,
                    r => Cursor::Version { remaining: r },
                };
                SmlState::Version
            }
            Cursor::TypeLength => self.type_length(byte),
            Cursor::ExtendedTypeLength { kind, length, tl_bytes } => {
                let length = (length << 4) | (byte & 0x0F) as usize;
                if byte & 0x80 != 0 {
                    self.cursor = Cursor::ExtendedTypeLength { kind, length, tl_bytes: tl_bytes + 1 };
                    return SmlState::ListEntry;
                }
                self.finish_type_length(kind, length, tl_bytes + 1, byte)
            }
            Cursor::Data { mut element, remaining } => {
                if element.bytes.len() < MAX_ELEMENT_BYTES {
                    element.bytes.push(byte);
                }
                if remaining > 1 {
                    self.cursor = Cursor::Data { element, remaining: remaining - 1 };
                    return SmlState::ListEntry;
                }
                self.element_done(element)
            }
            Cursor::Trailer { position } => self.trailer(position, byte),
        }
    }

    fn idle(&mut self, escapes: u8, byte: u8) -> SmlState {
        if byte == SML_ESCAPE {
            self.cursor = Cursor::Idle { escapes: (escapes + 1).min(SML_ESCAPE_COUNT) };
            return if escapes == 0 { SmlState::Start } else { SmlState::Version };
        }

        if escapes == SML_ESCAPE_COUNT && byte == SML_VERSION {
            // surplus escape bytes before the version are line noise
            self.restart();
            return SmlState::Version;
        }

        SmlState::Unexpected
    }

    fn type_length(&mut self, byte: u8) -> SmlState {
        if self.levels.is_empty() {
            // between messages only lists and padding are valid
            match byte {
                SML_END_OF_MESSAGE => {
                    self.cursor = Cursor::TypeLength;
                    return SmlState::BlockEnd;
                }
                b if (b >> 4) & 0x07 == 0x07 => {}
                _ => return self.unexpected(byte),
            }
        }

        if byte == SML_END_OF_MESSAGE {
            return self.element_done(SmlElement::new(SmlElementKind::EndOfMessage));
        }

        let kind = match SmlElementKind::from_type_field((byte >> 4) & 0x07) {
            Some(kind) => kind,
            None => return self.unexpected(byte),
        };
        let length = (byte & 0x0F) as usize;

        if byte & 0x80 != 0 {
            self.cursor = Cursor::ExtendedTypeLength { kind, length, tl_bytes: 1 };
            return SmlState::ListEntry;
        }
        self.finish_type_length(kind, length, 1, byte)
    }

    fn finish_type_length(&mut self, kind: SmlElementKind, length: usize, tl_bytes: usize, byte: u8) -> SmlState {
        if kind == SmlElementKind::List {
            if length == 0 {
                return self.element_done(SmlElement::new(SmlElementKind::List));
            }
            if self.levels.len() >= MAX_TREE_DEPTH {
                return self.unexpected(byte);
            }
            self.levels.push(ListLevel { remaining: length, elements: Vec::new() });
            self.cursor = Cursor::TypeLength;
            return SmlState::ListStart;
        }

        // the length of scalar elements includes their type-length bytes
        if length < tl_bytes {
            return self.unexpected(byte);
        }
        let data_len = length - tl_bytes;
        if data_len == 0 {
            return self.element_done(SmlElement::new(kind));
        }
        self.cursor = Cursor::Data { element: SmlElement::new(kind), remaining: data_len };
        SmlState::ListEntry
    }

    fn element_done(&mut self, element: SmlElement) -> SmlState {
        let mut element = element;
        let mut closed = false;
        let is_end_of_message = element.kind == SmlElementKind::EndOfMessage;

        self.cursor = Cursor::TypeLength;
        while let Some(level) = self.levels.last_mut() {
            if level.elements.len() < MAX_LIST_ELEMENTS {
                level.elements.push(element);
            }
            level.remaining = level.remaining.saturating_sub(1);
            if level.remaining > 0 {
                break;
            }

            // only the innermost list is kept for the OBIS check and decoder
            if let Some(finished) = self.levels.pop() {
                if !closed {
                    self.closed_entry = finished.elements;
                    closed = true;
                }
            }
            element = SmlElement::new(SmlElementKind::List);
        }

        if closed {
            SmlState::ListEnd
        } else if is_end_of_message {
            SmlState::BlockEnd
        } else {
            SmlState::ListEntry
        }
    }

    fn trailer(&mut self, position: u8, byte: u8) -> SmlState {
        match position {
            1 => {
                // number of padding bytes, covered by the checksum
                self.crc.update(&[byte]);
                self.crc_expected = self.crc.get();
                self.cursor = Cursor::Trailer { position: 2 };
                SmlState::Checksum
            }
            2 => {
                self.crc_low = byte;
                self.cursor = Cursor::Trailer { position: 3 };
                SmlState::Checksum
            }
            _ => {
                let received = u16::from_le_bytes([self.crc_low, byte]);
                self.cursor = Cursor::Idle { escapes: 0 };
                if received == self.crc_expected {
                    SmlState::Final
                } else {
                    debug!("SML checksum mismatch: expected=0x{:04X}, received=0x{:04X}",
                        self.crc_expected, received);
                    SmlState::ChecksumError
                }
            }
        }
    }

    fn unexpected(&mut self, byte: u8) -> SmlState {
        if !self.levels.is_empty() {
            debug!("Unexpected byte 0x{:02X} at list level {}", byte, self.levels.len());
        }
        self.reset();
        SmlState::Unexpected
    }

    /// The list that closed most recently, innermost first.
    pub fn closed_entry(&self) -> &[SmlElement] {
        &self.closed_entry
    }

    /// OBIS key of the list entry that closed last, if it carries one.
    pub fn active_obis(&self) -> Option<ObisCode> {
        let name = self.closed_entry.get(ENTRY_OBJ_NAME)?;
        if name.kind != SmlElementKind::OctetString {
            return None;
        }
        name.bytes.as_slice().try_into().ok()
    }

    pub fn obis_matches(&self, code: &ObisCode) -> bool {
        self.active_obis().as_ref() == Some(code)
    }

    /// Energy of the closed list entry in Wh, scaler applied.
    pub fn decode_wh(&self) -> Option<f64> {
        self.decode_by_unit(SML_UNIT_WATT_HOUR)
    }

    /// Power of the closed list entry in W, scaler applied.
    pub fn decode_w(&self) -> Option<f64> {
        self.decode_by_unit(SML_UNIT_WATT)
    }

    fn decode_by_unit(&self, unit: u8) -> Option<f64> {
        self.active_obis()?;

        let entry = &self.closed_entry;
        let entry_unit = entry.get(ENTRY_UNIT)?;
        if entry_unit.kind != SmlElementKind::Unsigned || entry_unit.as_unsigned()? != unit as u64 {
            return None;
        }

        let scaler = match entry.get(ENTRY_SCALER) {
            Some(s) if s.kind == SmlElementKind::Integer => s.as_signed()? as i32,
            _ => 0,
        };

        let value = entry.get(ENTRY_VALUE)?.as_number()?;
        Some(value * 10_f64.powi(scaler))
    }
}
