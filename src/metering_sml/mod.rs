use crate::config::{HeadConfig, SmlConfig};
use crate::{console, get_unix_ts};
use log::{debug, info, log_enabled, Level};
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;

pub mod structs;
pub mod parser;
pub mod utils;
pub mod meter_definitions;
pub mod readings;
pub mod framer;
pub mod source;

#[cfg(test)]
pub(crate) mod testdata;

use framer::SmlFramer;
use readings::SmlReadings;
use source::{spawn_device_reader, ByteSource, ChannelSource, ReplaySource};
use structs::*;
use utils::format_readings;

const READ_JITTER_MS: u64 = 500;
const DEVICE_CHANNEL_CHUNKS: usize = 4;

#[derive(Error, Debug)]
pub enum SmlError {
    #[error("Unable to read {path}: {source}")]
    Io { path: String, source: std::io::Error },
    #[error("Invalid hex data on line {line}: {source}")]
    Hex { line: usize, source: hex::FromHexError },
    #[error("Replay data contains no telegram")]
    EmptyReplay,
    #[error("Head on pin {0} has no byte source")]
    NoSource(u8),
}

/// Read side of the readings of one head, cheap to clone into other tasks.
#[derive(Clone)]
pub struct ReadingsHandle {
    pin: u8,
    readings: Arc<RwLock<SmlReadings>>,
    expire_secs: u64,
}

impl ReadingsHandle {
    pub fn pin(&self) -> u8 {
        self.pin
    }

    pub fn expire_secs(&self) -> u64 {
        self.expire_secs
    }

    /// Consistent copy of the readings. The writer holds the lock for one
    /// batch of bytes at a time, so this never waits long.
    pub fn snapshot(&self, now: u64) -> SmlReadings {
        let guard = self.readings.read().unwrap_or_else(|e| e.into_inner());
        guard.snapshot(now, self.expire_secs)
    }

    pub fn render(&self, now: u64, with_raw: bool) -> String {
        let guard = self.readings.read().unwrap_or_else(|e| e.into_inner());
        format_readings(&guard, now, self.expire_secs, with_raw)
    }
}

/// Framing context of one read head. Owns the byte source and is the only
/// writer of the readings.
pub struct SmlReader {
    pin: u8,
    source: Box<dyn ByteSource>,
    framer: SmlFramer,
    readings: Arc<RwLock<SmlReadings>>,
    expire_secs: u64,
}

impl SmlReader {
    pub fn new(pin: u8, source: Box<dyn ByteSource>, capacity: usize, mode: DispatchMode, expire_secs: u64) -> Self {
        let framer = SmlFramer::new(capacity, mode);
        let readings = SmlReadings::new(pin, framer.capacity());
        Self {
            pin,
            source,
            framer,
            readings: Arc::new(RwLock::new(readings)),
            expire_secs,
        }
    }

    pub fn pin(&self) -> u8 {
        self.pin
    }

    pub fn handle(&self) -> ReadingsHandle {
        ReadingsHandle {
            pin: self.pin,
            readings: self.readings.clone(),
            expire_secs: self.expire_secs,
        }
    }

    /// Pumps the available bytes into the framer until the source runs dry
    /// or a telegram ends. Input left after a terminal event is dropped.
    pub fn read(&mut self, now: u64) -> Option<TerminalEvent> {
        self.source.poll();
        if self.source.available() == 0 {
            return None;
        }

        let mut readings = self.readings.write().unwrap_or_else(|e| e.into_inner());
        while let Some(byte) = self.source.read() {
            if let Some(event) = self.framer.consume_byte(byte, &mut readings, now) {
                self.source.discard();
                return Some(event);
            }
        }
        None
    }

    pub async fn start_thread(mut self, read_interval: Duration) {
        info!("Starting SML reader on pin {}", self.pin);
        loop {
            if let Some(event) = self.read(get_unix_ts()) {
                debug!("Pin {}: {:?}", self.pin, event);
            }
            tokio::time::sleep(jittered(read_interval)).await;
        }
    }
}

/// `interval` moved by up to half a second either way, so heads do not poll
/// in lock step.
pub fn jittered(interval: Duration) -> Duration {
    let spread = READ_JITTER_MS.min(interval.as_millis() as u64);
    let offset = rand::thread_rng().gen_range(0..=2 * spread);
    (interval + Duration::from_millis(offset)).saturating_sub(Duration::from_millis(spread))
}

/// Prints the readings of all heads every `interval`.
pub async fn print_readings(handles: Vec<ReadingsHandle>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        let now = get_unix_ts();
        let with_raw = log_enabled!(Level::Debug);
        for handle in &handles {
            console::emit(handle.render(now, with_raw));
        }
    }
}

struct DeviceFeed {
    pin: u8,
    path: PathBuf,
    sender: Sender<Vec<u8>>,
}

pub struct SmlManager {
    readers: Vec<SmlReader>,
    feeds: Vec<DeviceFeed>,
    read_interval: Duration,
    print_interval: Duration,
}

impl SmlManager {
    pub fn new(config: &SmlConfig) -> Result<Self, SmlError> {
        let mut readers = Vec::new();
        let mut feeds = Vec::new();

        for head in &config.heads {
            let source = Self::open_source(head, config.buffer_size, &mut feeds)?;
            info!("Configured SML read head on pin {}", head.pin);
            readers.push(SmlReader::new(head.pin, source, config.buffer_size, config.dispatch, config.expire_secs));
        }

        Ok(Self {
            readers,
            feeds,
            read_interval: Duration::from_millis(config.read_interval_ms.max(1)),
            print_interval: Duration::from_secs(config.print_interval_secs.max(1)),
        })
    }

    fn open_source(head: &HeadConfig, buffer_size: usize, feeds: &mut Vec<DeviceFeed>) -> Result<Box<dyn ByteSource>, SmlError> {
        if let Some(replay) = &head.replay {
            return Ok(Box::new(ReplaySource::from_file(Path::new(replay))?));
        }
        if let Some(device) = &head.device {
            let (sender, source) = ChannelSource::channel(DEVICE_CHANNEL_CHUNKS, buffer_size);
            feeds.push(DeviceFeed { pin: head.pin, path: PathBuf::from(device), sender });
            return Ok(Box::new(source));
        }
        Err(SmlError::NoSource(head.pin))
    }

    pub fn handles(&self) -> Vec<ReadingsHandle> {
        self.readers.iter().map(|r| r.handle()).collect()
    }

    /// Spawns the device readers, one reading task per head and the printer.
    pub fn start_threads(self) -> Vec<JoinHandle<()>> {
        let mut threads = Vec::new();
        let handles = self.handles();

        for feed in self.feeds {
            threads.push(spawn_device_reader(feed.pin, feed.path, feed.sender));
        }

        let read_interval = self.read_interval;
        for reader in self.readers {
            threads.push(tokio::spawn(async move {
                reader.start_thread(read_interval).await;
            }));
        }

        let print_interval = self.print_interval;
        threads.push(tokio::spawn(async move {
            print_readings(handles, print_interval).await;
        }));
        threads
    }
}
