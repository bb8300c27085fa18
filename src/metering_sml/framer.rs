use super::meter_definitions::{dispatch, ObisEntry, OBIS_HANDLERS};
use super::parser::{SmlTokenizer, SML_ESCAPE, SML_ESCAPE_COUNT};
use super::readings::{ReadingState, SmlReadings};
use super::structs::*;
use log::{info, warn};
use std::time::{Duration, Instant};

const UNEXPECTED_LOG_INTERVAL: Duration = Duration::from_secs(1);

/// Feeds the bytes of one read head through the tokenizer, keeps a copy of
/// the telegram in the readings and routes closed list entries to the
/// OBIS handlers.
pub struct SmlFramer {
    tokenizer: SmlTokenizer,
    table: &'static [ObisEntry],
    mode: DispatchMode,
    capacity: usize,
    frame_counter: usize,
    last_unexpected_log: Option<Instant>,
}

impl SmlFramer {
    pub fn new(capacity: usize, mode: DispatchMode) -> Self {
        Self::with_table(capacity, mode, &OBIS_HANDLERS)
    }

    pub fn with_table(capacity: usize, mode: DispatchMode, table: &'static [ObisEntry]) -> Self {
        Self {
            tokenizer: SmlTokenizer::new(),
            table,
            mode,
            capacity: capacity.max(1),
            frame_counter: 0,
            last_unexpected_log: None,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of bytes of the telegram currently being collected.
    pub fn frame_counter(&self) -> usize {
        self.frame_counter
    }

    #[cfg(test)]
    pub(crate) fn last_unexpected_log(&self) -> Option<Instant> {
        self.last_unexpected_log
    }

    pub fn consume_byte(&mut self, byte: u8, readings: &mut SmlReadings, now: u64) -> Option<TerminalEvent> {
        let phase = self.tokenizer.advance(byte);
        readings.phase = phase;

        if phase == SmlState::Start {
            if self.frame_counter != 0 {
                // previous telegram never finished
                readings.reset();
                self.frame_counter = 0;
            }
            readings.state = ReadingState::InProgress;

            if byte != SML_ESCAPE {
                // telegram broke in on the version byte, its escape sequence came earlier
                let header = (SML_ESCAPE_COUNT as usize).min(self.capacity - 1);
                readings.raw_frame.clear();
                readings.raw_frame.extend(std::iter::repeat(SML_ESCAPE).take(header));
                self.frame_counter = header;
            }
        }

        if self.frame_counter < self.capacity {
            if self.frame_counter == 0 {
                readings.raw_frame.clear();
            }
            readings.raw_frame.push(byte);
            self.frame_counter += 1;
        }

        if phase == SmlState::ListEnd {
            dispatch(self.table, self.mode, readings, &self.tokenizer);
        }

        if self.frame_counter >= self.capacity {
            warn!("SML buffer exceeded on pin {} ({} bytes)", readings.pin, self.frame_counter);
            self.tokenizer.reset();
            return Some(self.terminate(TerminalEvent::BufferOverflow, SmlState::End, readings, now));
        }

        if phase == SmlState::Unexpected {
            let quiet = self.last_unexpected_log
                .map(|last| last.elapsed() <= UNEXPECTED_LOG_INTERVAL)
                .unwrap_or(false);
            if !quiet {
                warn!("Received unexpected byte on pin {}", readings.pin);
                self.last_unexpected_log = Some(Instant::now());
            }
        }

        if self.frame_counter != 0 && phase == SmlState::ChecksumError {
            warn!("Received SML message with invalid checksum on pin {} ({} bytes)",
                readings.pin, self.frame_counter);
            return Some(self.terminate(TerminalEvent::ChecksumError, phase, readings, now));
        }

        if self.frame_counter != 0 && phase == SmlState::Final {
            info!("Received and parsed SML message on pin {} ({} bytes)",
                readings.pin, self.frame_counter);
            return Some(self.terminate(TerminalEvent::FrameComplete, phase, readings, now));
        }

        None
    }

    fn terminate(&mut self, event: TerminalEvent, phase: SmlState, readings: &mut SmlReadings, now: u64) -> TerminalEvent {
        readings.timestamp = now;
        readings.phase = phase;
        readings.state = event.into();
        self.frame_counter = 0;
        event
    }
}
