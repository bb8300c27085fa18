use super::parser::SmlTokenizer;
use super::readings::SmlReadings;
use super::structs::*;
use super::utils::{apply_handler, find_obis, format_obis_code};
use log::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObisEntry {
    pub code: ObisCode,
    pub handler: Option<ObisField>,
}

const fn entry(code: ObisCode, handler: ObisField) -> ObisEntry {
    ObisEntry { code, handler: Some(handler) }
}

/// Lookup stops here, the code of this entry is never compared.
pub const TERMINATOR: ObisEntry = ObisEntry { code: [0; OBIS_LEN], handler: None };

/// OBIS codes and the reading they feed. Order matters, the first match wins.
pub static OBIS_HANDLERS: [ObisEntry; 15] = [
    entry([0x81, 0x81, 0xC7, 0x82, 0x03, 0xFF], ObisField::Manufacturer),         // 129-129:199.130.3*255
    entry([0x01, 0x00, 0x60, 0x32, 0x01, 0x01], ObisField::Manufacturer),         // 1-0:96.50.1*1
    entry([0x01, 0x00, 0x01, 0x08, 0x00, 0xFF], ObisField::EnergyFromGridTotal),  // 1-0:1.8.0*255 (T1+T2)
    entry([0x01, 0x00, 0x02, 0x08, 0x00, 0xFF], ObisField::EnergyToGridTotal),    // 1-0:2.8.0*255 (T1+T2)
    entry([0x01, 0x00, 0x10, 0x07, 0x00, 0xFF], ObisField::PowerFromGridTotal),   // 1-0:16.7.0*255
    entry([0x01, 0x00, 0x0F, 0x07, 0x00, 0xFF], ObisField::PowerToGridTotal),     // 1-0:15.7.0*255
    entry([0x01, 0x00, 0x24, 0x07, 0x00, 0xFF], ObisField::PowerFromGridL1),      // 1-0:36.7.0*255
    entry([0x01, 0x00, 0x38, 0x07, 0x00, 0xFF], ObisField::PowerFromGridL2),      // 1-0:56.7.0*255
    entry([0x01, 0x00, 0x4C, 0x07, 0x00, 0xFF], ObisField::PowerFromGridL3),      // 1-0:76.7.0*255
    entry([0x01, 0x00, 0x15, 0x07, 0x00, 0xFF], ObisField::PowerFromGridL1),      // 1-0:21.7.0*255
    entry([0x01, 0x00, 0x29, 0x07, 0x00, 0xFF], ObisField::PowerFromGridL2),      // 1-0:41.7.0*255
    entry([0x01, 0x00, 0x3D, 0x07, 0x00, 0xFF], ObisField::PowerFromGridL3),      // 1-0:61.7.0*255
    entry([0x01, 0x00, 0x60, 0x01, 0x00, 0xFF], ObisField::SerialNumber),         // 1-0:96.1.0*255
    entry([0x01, 0x00, 0x00, 0x00, 0x09, 0xFF], ObisField::SerialNumber),         // 1-0:0.0.9*255
    TERMINATOR,
];

fn active_entries(table: &[ObisEntry]) -> impl Iterator<Item = &ObisEntry> {
    table.iter().take_while(|e| e.handler.is_some())
}

/// First table entry whose code occurs anywhere in `frame`.
pub fn lookup_in_frame<'a>(table: &'a [ObisEntry], frame: &[u8]) -> Option<&'a ObisEntry> {
    active_entries(table).find(|e| find_obis(frame, &e.code).is_some())
}

/// First table entry equal to the key of the list entry that just closed.
pub fn lookup_active<'a>(table: &'a [ObisEntry], decoder: &SmlTokenizer) -> Option<&'a ObisEntry> {
    active_entries(table).find(|e| decoder.obis_matches(&e.code))
}

/// Called on every list end. Runs at most one handler and returns the field
/// it was routed to.
pub fn dispatch(table: &[ObisEntry], mode: DispatchMode, readings: &mut SmlReadings, decoder: &SmlTokenizer) -> Option<ObisField> {
    let matched = match mode {
        DispatchMode::Scan => lookup_in_frame(table, &readings.raw_frame),
        DispatchMode::Entry => lookup_active(table, decoder),
    }?;
    let field = matched.handler?;

    debug!("Pin {}: {} -> {}", readings.pin, format_obis_code(&matched.code), field);
    apply_handler(field, readings, &matched.code, decoder);
    Some(field)
}
