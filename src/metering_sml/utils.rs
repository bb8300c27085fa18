use super::parser::SmlTokenizer;
use super::readings::{is_set, ReadingState, SmlReadings};
use super::structs::*;
use chrono::{Local, TimeZone};
use log::debug;
use std::fmt::Write;

/// How far behind a matched OBIS code the type-length marker may appear.
const MARKER_SCAN_WINDOW: usize = 24;
const MARKER_MANUFACTURER: u8 = 0x04; // octet string, 3 bytes
const MARKER_SERIAL_NUMBER: u8 = 0x0B; // octet string, 10 bytes
const MANUFACTURER_LEN: usize = 3;
const SERIAL_NUMBER_LEN: usize = 10;
const RAW_HEX_LINE: usize = 64;

pub fn format_obis_code(obis_bytes: &[u8]) -> String {
    if let Some(obis) = SmlObisCode::from_bytes(obis_bytes) {
        return obis.to_string();
    }

    // Fallback: format as hex
    hex::encode(obis_bytes)
}

pub fn find_obis(frame: &[u8], code: &ObisCode) -> Option<usize> {
    frame.windows(OBIS_LEN).position(|window| window == code)
}

/// Payload following the first `marker` within the scan window behind `code`.
/// Every read is checked against the end of the frame.
pub fn scan_marker<'a>(frame: &'a [u8], code: &ObisCode, marker: u8, len: usize) -> Option<&'a [u8]> {
    let pos = find_obis(frame, code)?;
    let window_end = (pos + MARKER_SCAN_WINDOW).min(frame.len().saturating_sub(1));

    let at = (pos + 1..=window_end).find(|i| frame[*i] == marker)?;
    frame.get(at + 1..at + 1 + len)
}

pub fn extract_manufacturer(readings: &mut SmlReadings, code: &ObisCode) -> bool {
    // several codes carry the manufacturer, the first one found in a frame wins
    if !readings.manufacturer.is_empty() {
        return false;
    }

    match scan_marker(&readings.raw_frame, code, MARKER_MANUFACTURER, MANUFACTURER_LEN) {
        Some(signature) => {
            let signature = String::from_utf8_lossy(signature);
            readings.manufacturer = signature.trim_end_matches('\0').to_string();
            true
        }
        None => false,
    }
}

pub fn extract_serial_number(readings: &mut SmlReadings, code: &ObisCode) -> bool {
    match scan_marker(&readings.raw_frame, code, MARKER_SERIAL_NUMBER, SERIAL_NUMBER_LEN) {
        Some(serial) => {
            readings.serial_number = hex::encode_upper(serial);
            true
        }
        None => false,
    }
}

/// Runs the handler of `field` for the matched `code`. Returns false if
/// nothing could be extracted, the field is left untouched in that case.
pub fn apply_handler(field: ObisField, readings: &mut SmlReadings, code: &ObisCode, decoder: &SmlTokenizer) -> bool {
    let value = match field {
        ObisField::Manufacturer => return extract_manufacturer(readings, code),
        ObisField::SerialNumber => return extract_serial_number(readings, code),
        ObisField::EnergyFromGridTotal | ObisField::EnergyToGridTotal => decoder.decode_wh(),
        _ => decoder.decode_w(),
    };

    match (value, readings.numeric_mut(field)) {
        (Some(value), Some(target)) => {
            *target = value;
            true
        }
        _ => {
            debug!("No value for {} ({}) on pin {}", field, format_obis_code(code), readings.pin);
            false
        }
    }
}

pub fn format_timestamp(timestamp: u64) -> String {
    match Local.timestamp_opt(timestamp as i64, 0).single() {
        Some(dt) => dt.format("%Y-%m-%dT%H:%M:%S").to_string(),
        None => format!("Invalid timestamp: {}", timestamp),
    }
}

/// Console block for one head, raw frame included when `with_raw` is set.
pub fn format_readings(readings: &SmlReadings, now: u64, expire_secs: u64, with_raw: bool) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "SMLReader (Pin {})", readings.pin);

    if readings.state == ReadingState::ChecksumError {
        let _ = writeln!(out, "  Invalid data (checksum error)");
    } else if now.saturating_sub(readings.timestamp) < expire_secs {
        let _ = writeln!(out, "  Timestamp: {}", format_timestamp(readings.timestamp));
        let _ = writeln!(out, "  Manufacturer: {}", readings.manufacturer);
        let _ = writeln!(out, "  Serialnumber: {}", readings.serial_number);
        if is_set(readings.energy_from_grid_total) {
            let _ = writeln!(out, "  Total Consumption: {:.3} kWh", readings.energy_from_grid_total / 1000.0);
        }
        if is_set(readings.energy_to_grid_total) {
            let _ = writeln!(out, "  Total Feed to Grid: {:.3} kWh", readings.energy_to_grid_total / 1000.0);
        }
        if is_set(readings.power_from_grid_total) {
            let _ = writeln!(out, "  Total Active Power: {} W", readings.power_from_grid_total as i64);
        }
        if is_set(readings.power_from_grid_l1) {
            let _ = writeln!(out, "  Active Power L1: {} W", readings.power_from_grid_l1 as i64);
        }
        if is_set(readings.power_from_grid_l2) {
            let _ = writeln!(out, "  Active Power L2: {} W", readings.power_from_grid_l2 as i64);
        }
        if is_set(readings.power_from_grid_l3) {
            let _ = writeln!(out, "  Active Power L3: {} W", readings.power_from_grid_l3 as i64);
        }
        if is_set(readings.power_to_grid_total) {
            let _ = writeln!(out, "  Total Active Power to Grid: {} W", readings.power_to_grid_total as i64);
        }
        if with_raw {
            let raw = hex::encode_upper(&readings.raw_frame);
            let _ = writeln!(out, "  Raw SML message:");
            for chunk in raw.as_bytes().chunks(RAW_HEX_LINE) {
                let _ = writeln!(out, "    {}", String::from_utf8_lossy(chunk));
            }
        }
    } else if !readings.manufacturer.is_empty() {
        let _ = writeln!(out, "  No recent data");
    } else {
        let _ = writeln!(out, "  No data");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metering_sml::testdata::*;

    fn readings_with_frame(frame: Vec<u8>) -> SmlReadings {
        let mut readings = SmlReadings::new(4, 400);
        readings.raw_frame = frame;
        readings
    }

    #[test]
    fn test_format_obis_code() {
        assert_eq!(format_obis_code(&OBIS_ENERGY_FROM_GRID), "1-0:1.8.0*255");
        assert_eq!(format_obis_code(&[0x01, 0x02]), "0102");
    }

    #[test]
    fn test_extract_manufacturer() {
        let mut readings = readings_with_frame(octet_entry(&OBIS_MANUFACTURER, b"EMH"));
        assert!(extract_manufacturer(&mut readings, &OBIS_MANUFACTURER));
        assert_eq!(readings.manufacturer, "EMH");
    }

    #[test]
    fn test_manufacturer_first_source_wins() {
        let mut frame = octet_entry(&OBIS_MANUFACTURER, b"EMH");
        frame.extend(octet_entry(&OBIS_MANUFACTURER_B, b"ISK"));
        let mut readings = readings_with_frame(frame);

        assert!(extract_manufacturer(&mut readings, &OBIS_MANUFACTURER));
        assert!(!extract_manufacturer(&mut readings, &OBIS_MANUFACTURER_B));
        assert_eq!(readings.manufacturer, "EMH");
    }

    #[test]
    fn test_marker_outside_window_is_a_miss() {
        let mut frame = OBIS_MANUFACTURER.to_vec();
        frame.extend_from_slice(&[0x01; 24]);
        frame.extend_from_slice(&[0x04, b'E', b'M', b'H']);
        let mut readings = readings_with_frame(frame);

        assert!(!extract_manufacturer(&mut readings, &OBIS_MANUFACTURER));
        assert!(readings.manufacturer.is_empty());
    }

    #[test]
    fn test_truncated_payload_is_a_miss() {
        let mut frame = OBIS_SERIAL_C.to_vec();
        frame.extend_from_slice(&[0x01, 0x01, 0x01, 0x01, 0x0B, 0x0A, 0x01]);
        let mut readings = readings_with_frame(frame);

        assert!(!extract_serial_number(&mut readings, &OBIS_SERIAL_C));
        assert!(readings.serial_number.is_empty());
    }

    #[test]
    fn test_missing_code_is_a_miss() {
        let mut readings = readings_with_frame(vec![0x04, b'E', b'M', b'H']);
        assert!(!extract_manufacturer(&mut readings, &OBIS_MANUFACTURER));
    }

    #[test]
    fn test_extract_serial_number() {
        let mut readings = readings_with_frame(octet_entry(&OBIS_SERIAL_C, &SERVER_ID));
        assert!(extract_serial_number(&mut readings, &OBIS_SERIAL_C));
        assert_eq!(readings.serial_number, "0A01454D480000123456");
        assert_eq!(readings.serial_number.len(), 20);
    }

    #[test]
    fn test_format_readings_no_data() {
        let readings = SmlReadings::new(13, 400);
        let text = format_readings(&readings, 1_000, 60, false);
        assert!(text.starts_with("SMLReader (Pin 13)\n"));
        assert!(text.contains("  No data"));
    }

    #[test]
    fn test_format_readings_no_recent_data() {
        let mut readings = SmlReadings::new(13, 400);
        readings.manufacturer = "EMH".to_string();
        readings.timestamp = 100;
        let text = format_readings(&readings, 1_000, 60, false);
        assert!(text.contains("  No recent data"));
    }

    #[test]
    fn test_format_readings_values() {
        let mut readings = SmlReadings::new(4, 400);
        readings.state = ReadingState::FrameComplete;
        readings.timestamp = 1_000;
        readings.manufacturer = "EMH".to_string();
        readings.energy_from_grid_total = 12345000.0;
        readings.power_from_grid_l1 = 230.7;
        readings.raw_frame = vec![0x1B; 40];

        let text = format_readings(&readings, 1_010, 60, true);
        assert!(text.contains("  Total Consumption: 12345.000 kWh"));
        assert!(text.contains("  Active Power L1: 230 W"));
        assert!(!text.contains("Feed to Grid"));
        assert!(text.contains("  Raw SML message:"));
        assert!(text.contains(&format!("    {}\n", "1B".repeat(32))));
    }

    #[test]
    fn test_format_readings_checksum_error() {
        let mut readings = SmlReadings::new(4, 400);
        readings.state = ReadingState::ChecksumError;
        readings.timestamp = 1_000;
        let text = format_readings(&readings, 1_001, 60, false);
        assert!(text.contains("Invalid data (checksum error)"));
    }
}
