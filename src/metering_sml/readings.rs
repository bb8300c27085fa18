use super::structs::*;

/// Marks a numeric reading which no handler has written yet.
pub const SENTINEL: f64 = i32::MIN as f64;

/// Serial number reported while a head has not sent one.
pub const DEFAULT_SERIAL: &str = "00000000000000000000";

/// Lifecycle of the readings of one head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadingState {
    NoData,
    InProgress,
    FrameComplete,
    ChecksumError,
    BufferOverflow,
}

impl From<TerminalEvent> for ReadingState {
    fn from(event: TerminalEvent) -> Self {
        match event {
            TerminalEvent::FrameComplete => ReadingState::FrameComplete,
            TerminalEvent::ChecksumError => ReadingState::ChecksumError,
            TerminalEvent::BufferOverflow => ReadingState::BufferOverflow,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SmlReadings {
    pub pin: u8,
    pub manufacturer: String,
    pub serial_number: String,
    pub energy_from_grid_total: f64,
    pub energy_to_grid_total: f64,
    pub power_from_grid_total: f64,
    pub power_to_grid_total: f64,
    pub power_from_grid_l1: f64,
    pub power_from_grid_l2: f64,
    pub power_from_grid_l3: f64,
    /// Unix time of the last terminal frame event, 0 if there never was one
    pub timestamp: u64,
    pub raw_frame: Vec<u8>,
    pub phase: SmlState,
    pub state: ReadingState,
}

pub fn is_set(value: f64) -> bool {
    value > SENTINEL
}

impl SmlReadings {
    pub fn new(pin: u8, capacity: usize) -> Self {
        Self {
            pin,
            manufacturer: String::new(),
            serial_number: String::new(),
            energy_from_grid_total: SENTINEL,
            energy_to_grid_total: SENTINEL,
            power_from_grid_total: SENTINEL,
            power_to_grid_total: SENTINEL,
            power_from_grid_l1: SENTINEL,
            power_from_grid_l2: SENTINEL,
            power_from_grid_l3: SENTINEL,
            timestamp: 0,
            raw_frame: Vec::with_capacity(capacity),
            phase: SmlState::Version,
            state: ReadingState::NoData,
        }
    }

    /// Clears everything derived from a telegram. The timestamp of the last
    /// terminal event survives until the next one replaces it.
    pub fn reset(&mut self) {
        self.manufacturer.clear();
        self.serial_number.clear();
        self.energy_from_grid_total = SENTINEL;
        self.energy_to_grid_total = SENTINEL;
        self.power_from_grid_total = SENTINEL;
        self.power_to_grid_total = SENTINEL;
        self.power_from_grid_l1 = SENTINEL;
        self.power_from_grid_l2 = SENTINEL;
        self.power_from_grid_l3 = SENTINEL;
        self.raw_frame.clear();
        self.state = ReadingState::NoData;
    }

    pub fn frame_size(&self) -> usize {
        self.raw_frame.len()
    }

    /// The numeric field a handler writes to, `None` for the string fields.
    pub fn numeric_mut(&mut self, field: ObisField) -> Option<&mut f64> {
        match field {
            ObisField::EnergyFromGridTotal => Some(&mut self.energy_from_grid_total),
            ObisField::EnergyToGridTotal => Some(&mut self.energy_to_grid_total),
            ObisField::PowerFromGridTotal => Some(&mut self.power_from_grid_total),
            ObisField::PowerToGridTotal => Some(&mut self.power_to_grid_total),
            ObisField::PowerFromGridL1 => Some(&mut self.power_from_grid_l1),
            ObisField::PowerFromGridL2 => Some(&mut self.power_from_grid_l2),
            ObisField::PowerFromGridL3 => Some(&mut self.power_from_grid_l3),
            ObisField::Manufacturer | ObisField::SerialNumber => None,
        }
    }

    /// Copy for publishing. A head silent for more than three times the
    /// expiry loses its manufacturer in the copy, the live record keeps it.
    pub fn snapshot(&self, now: u64, expire_secs: u64) -> SmlReadings {
        let mut copy = self.clone();

        if now.saturating_sub(copy.timestamp) > expire_secs.saturating_mul(3) {
            copy.manufacturer.clear();
        }
        if copy.serial_number.is_empty() {
            copy.serial_number = DEFAULT_SERIAL.to_string();
        }
        copy
    }

    pub fn is_recent(&self, now: u64, expire_secs: u64) -> bool {
        now.saturating_sub(self.timestamp) <= expire_secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_readings_are_absent() {
        let readings = SmlReadings::new(4, 400);
        assert_eq!(readings.pin, 4);
        assert_eq!(readings.timestamp, 0);
        assert_eq!(readings.state, ReadingState::NoData);
        for value in [
            readings.energy_from_grid_total,
            readings.energy_to_grid_total,
            readings.power_from_grid_total,
            readings.power_to_grid_total,
            readings.power_from_grid_l1,
            readings.power_from_grid_l2,
            readings.power_from_grid_l3,
        ] {
            assert!(!is_set(value));
        }
    }

    #[test]
    fn test_zero_is_a_reading() {
        assert!(is_set(0.0));
        assert!(is_set(-1.0));
        assert!(!is_set(SENTINEL));
    }

    #[test]
    fn test_reset_keeps_timestamp() {
        let mut readings = SmlReadings::new(4, 400);
        readings.manufacturer = "EMH".to_string();
        readings.serial_number = "0A01454D480000123456".to_string();
        readings.power_from_grid_l2 = 12.0;
        readings.raw_frame.extend_from_slice(&[0x1B, 0x1B]);
        readings.timestamp = 1_700_000_000;

        readings.reset();
        assert!(readings.manufacturer.is_empty());
        assert!(readings.serial_number.is_empty());
        assert!(!is_set(readings.power_from_grid_l2));
        assert_eq!(readings.frame_size(), 0);
        assert_eq!(readings.timestamp, 1_700_000_000);
    }

    #[test]
    fn test_snapshot_staleness() {
        let mut readings = SmlReadings::new(4, 400);
        readings.manufacturer = "EMH".to_string();
        readings.timestamp = 1_000;

        let fresh = readings.snapshot(1_000 + 3 * 60 - 1, 60);
        assert_eq!(fresh.manufacturer, "EMH");

        let stale = readings.snapshot(1_000 + 3 * 60 + 1, 60);
        assert!(stale.manufacturer.is_empty());
        assert_eq!(readings.manufacturer, "EMH");
    }

    #[test]
    fn test_snapshot_serial_placeholder() {
        let mut readings = SmlReadings::new(4, 400);
        let copy = readings.snapshot(0, 60);
        assert_eq!(copy.serial_number, DEFAULT_SERIAL);
        assert_eq!(copy.serial_number.len(), 20);
        assert!(readings.serial_number.is_empty());

        readings.serial_number = "0A01454D480000123456".to_string();
        assert_eq!(readings.snapshot(0, 60).serial_number, "0A01454D480000123456");
    }

    #[test]
    fn test_numeric_field_mapping() {
        let mut readings = SmlReadings::new(4, 400);
        *readings.numeric_mut(ObisField::PowerFromGridL3).unwrap() = 5.0;
        assert_eq!(readings.power_from_grid_l3, 5.0);
        assert!(readings.numeric_mut(ObisField::Manufacturer).is_none());
    }
}
