//! Telegram builders shared by the unit tests.

use super::structs::*;
use crc16::{State, X_25};

pub const OBIS_MANUFACTURER: ObisCode = [0x81, 0x81, 0xC7, 0x82, 0x03, 0xFF];
pub const OBIS_MANUFACTURER_B: ObisCode = [0x01, 0x00, 0x60, 0x32, 0x01, 0x01];
pub const OBIS_ENERGY_FROM_GRID: ObisCode = [0x01, 0x00, 0x01, 0x08, 0x00, 0xFF];
pub const OBIS_ENERGY_TO_GRID: ObisCode = [0x01, 0x00, 0x02, 0x08, 0x00, 0xFF];
pub const OBIS_POWER_FROM_GRID: ObisCode = [0x01, 0x00, 0x10, 0x07, 0x00, 0xFF];
pub const OBIS_POWER_L1_A: ObisCode = [0x01, 0x00, 0x24, 0x07, 0x00, 0xFF];
pub const OBIS_POWER_L1_B: ObisCode = [0x01, 0x00, 0x15, 0x07, 0x00, 0xFF];
pub const OBIS_SERIAL_B: ObisCode = [0x01, 0x00, 0x60, 0x01, 0x00, 0xFF];
pub const OBIS_SERIAL_C: ObisCode = [0x01, 0x00, 0x00, 0x00, 0x09, 0xFF];

pub const SERVER_ID: [u8; 10] = [0x0A, 0x01, 0x45, 0x4D, 0x48, 0x00, 0x00, 0x12, 0x34, 0x56];

pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// List entry with unit, scaler and a value given including its type-length byte.
pub fn value_entry(obis: &ObisCode, unit: u8, scaler: i8, value: &[u8]) -> Vec<u8> {
    let mut entry = vec![0x77, 0x07];
    entry.extend_from_slice(obis);
    entry.extend_from_slice(&[0x01, 0x01, 0x62, unit, 0x52, scaler as u8]);
    entry.extend_from_slice(value);
    entry.push(0x01);
    entry
}

pub fn energy_entry(obis: &ObisCode, wh: u32) -> Vec<u8> {
    let mut value = vec![0x65];
    value.extend_from_slice(&wh.to_be_bytes());
    value_entry(obis, SML_UNIT_WATT_HOUR, 0, &value)
}

pub fn power_entry(obis: &ObisCode, w: i32) -> Vec<u8> {
    let mut value = vec![0x55];
    value.extend_from_slice(&w.to_be_bytes());
    value_entry(obis, SML_UNIT_WATT, 0, &value)
}

/// List entry carrying an octet string value, e.g. manufacturer or server id.
pub fn octet_entry(obis: &ObisCode, data: &[u8]) -> Vec<u8> {
    let mut entry = vec![0x77, 0x07];
    entry.extend_from_slice(obis);
    entry.extend_from_slice(&[0x01, 0x01, 0x01, 0x01, (data.len() + 1) as u8]);
    entry.extend_from_slice(data);
    entry.push(0x01);
    entry
}

/// A single GetListResponse message wrapping the given value list entries.
pub fn get_list_body(entries: &[Vec<u8>]) -> Vec<u8> {
    let mut body = vec![
        0x76,                               // message
        0x05, 0x00, 0x00, 0x00, 0x01,       // transaction id
        0x62, 0x00,                         // group no
        0x62, 0x00,                         // abort on error
        0x72, 0x63, 0x07, 0x01,             // body: GetListResponse
        0x77, 0x01, 0x0B,
    ];
    body.extend_from_slice(&SERVER_ID);
    body.extend_from_slice(&[0x01, 0x01]);
    body.push(0x70 | entries.len() as u8);
    for entry in entries {
        body.extend_from_slice(entry);
    }
    body.extend_from_slice(&[0x01, 0x01]);
    body.extend_from_slice(&[0x63, 0x00, 0x00, 0x00]);
    body
}

/// Doubles every run of four escape bytes, as the meter sends them.
pub fn escape(body: &[u8]) -> Vec<u8> {
    let mut escaped = Vec::with_capacity(body.len());
    let mut i = 0;
    while i < body.len() {
        if body[i..].starts_with(&[0x1B; 4]) {
            escaped.extend_from_slice(&[0x1B; 8]);
            i += 4;
        } else {
            escaped.push(body[i]);
            i += 1;
        }
    }
    escaped
}

/// Escape and version header, padding, trailer and CRC around a message body.
pub fn frame(body: &[u8]) -> Vec<u8> {
    let mut telegram = vec![0x1B, 0x1B, 0x1B, 0x1B, 0x01, 0x01, 0x01, 0x01];
    telegram.extend(escape(body));
    let padding = (4 - telegram.len() % 4) % 4;
    telegram.extend(std::iter::repeat(0x00).take(padding));
    telegram.extend_from_slice(&[0x1B, 0x1B, 0x1B, 0x1B, 0x1A, padding as u8]);
    let crc = State::<X_25>::calculate(&telegram);
    telegram.extend_from_slice(&crc.to_le_bytes());
    telegram
}

pub fn telegram(entries: &[Vec<u8>]) -> Vec<u8> {
    frame(&get_list_body(entries))
}
