use crate::config::PublishConfig;
use crate::console;
use crate::get_unix_ts;
use crate::metering_sml::readings::{is_set, ReadingState, SmlReadings};
use crate::metering_sml::ReadingsHandle;
use log::{debug, error, info};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("Unable to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Unable to publish on {topic}: {reason}")]
    Sink { topic: String, reason: String },
}

/// Hands a finished payload to the transport.
pub trait Publisher: Send {
    fn publish(&mut self, topic: &str, payload: &str) -> Result<(), PublishError>;
}

/// Writes every message to the console as `topic payload`.
pub struct LogPublisher;

impl Publisher for LogPublisher {
    fn publish(&mut self, topic: &str, payload: &str) -> Result<(), PublishError> {
        console::emit(format!("{} {}", topic, payload));
        Ok(())
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ProcessMessage {
    Startup,
    Keepalive,
}

#[derive(Serialize, Debug, PartialEq)]
pub struct ProcessPayload {
    pub msgtype: ProcessMessage,
    pub timestamp: u64,
    pub uptime: u64,
    pub version: &'static str,
}

#[derive(Serialize, Debug, PartialEq)]
pub struct DataPayload {
    pub timestamp: u64,
    pub manufacturer: String,
    pub serialnumber: String,
    #[serde(rename = "energyFromGridTotalkWh", skip_serializing_if = "Option::is_none")]
    pub energy_from_grid_total_kwh: Option<f64>,
    #[serde(rename = "energyToGridTotalkWh", skip_serializing_if = "Option::is_none")]
    pub energy_to_grid_total_kwh: Option<f64>,
    #[serde(rename = "powerFromGridTotalW", skip_serializing_if = "Option::is_none")]
    pub power_from_grid_total_w: Option<f64>,
    #[serde(rename = "powerToGridTotalW", skip_serializing_if = "Option::is_none")]
    pub power_to_grid_total_w: Option<f64>,
    #[serde(rename = "powerFromGridL1W", skip_serializing_if = "Option::is_none")]
    pub power_from_grid_l1_w: Option<f64>,
    #[serde(rename = "powerFromGridL2W", skip_serializing_if = "Option::is_none")]
    pub power_from_grid_l2_w: Option<f64>,
    #[serde(rename = "powerFromGridL3W", skip_serializing_if = "Option::is_none")]
    pub power_from_grid_l3_w: Option<f64>,
    pub version: &'static str,
}

#[derive(Serialize, Debug, PartialEq)]
#[serde(tag = "msgtype", rename_all = "lowercase")]
pub enum HeadPayload {
    Error { timestamp: u64, error: &'static str, version: &'static str },
    Data(DataPayload),
}

fn reading(value: f64) -> Option<f64> {
    if is_set(value) { Some(value) } else { None }
}

fn energy_kwh(value: f64) -> Option<f64> {
    reading(value).map(|wh| wh / 1000.0)
}

impl DataPayload {
    pub fn from_snapshot(snapshot: &SmlReadings) -> Self {
        Self {
            timestamp: snapshot.timestamp,
            manufacturer: snapshot.manufacturer.clone(),
            serialnumber: snapshot.serial_number.clone(),
            energy_from_grid_total_kwh: energy_kwh(snapshot.energy_from_grid_total),
            energy_to_grid_total_kwh: energy_kwh(snapshot.energy_to_grid_total),
            power_from_grid_total_w: reading(snapshot.power_from_grid_total),
            power_to_grid_total_w: reading(snapshot.power_to_grid_total),
            power_from_grid_l1_w: reading(snapshot.power_from_grid_l1),
            power_from_grid_l2_w: reading(snapshot.power_from_grid_l2),
            power_from_grid_l3_w: reading(snapshot.power_from_grid_l3),
            version: VERSION,
        }
    }
}

/// Payload for one head, `None` if its data is too old to publish.
pub fn head_payload(snapshot: &SmlReadings, now: u64, expire_secs: u64) -> Option<HeadPayload> {
    if !snapshot.is_recent(now, expire_secs) {
        if snapshot.manufacturer.is_empty() {
            info!("Skipping update (pin {}), no data", snapshot.pin);
        } else {
            info!("Skipping update for {}/{} (pin {}), no recent data",
                snapshot.manufacturer, snapshot.serial_number, snapshot.pin);
        }
        return None;
    }

    let error = match snapshot.state {
        ReadingState::ChecksumError => "checksum",
        ReadingState::BufferOverflow => "buffer",
        _ => return Some(HeadPayload::Data(DataPayload::from_snapshot(snapshot))),
    };
    Some(HeadPayload::Error { timestamp: snapshot.timestamp, error, version: VERSION })
}

pub fn process_topic(config: &PublishConfig) -> String {
    format!("{}/{}/state", config.base_topic, config.system_id)
}

pub fn head_topic(config: &PublishConfig, pin: u8) -> String {
    format!("{}/{}/{}/state", config.base_topic, config.system_id, pin)
}

/// Builds and publishes the messages of one publish cycle.
pub struct PublishCycle {
    config: PublishConfig,
    publisher: Box<dyn Publisher>,
    started: u64,
    last_update: Option<u64>,
}

impl PublishCycle {
    pub fn new(config: PublishConfig, publisher: Box<dyn Publisher>, started: u64) -> Self {
        Self { config, publisher, started, last_update: None }
    }

    /// Seconds without any message after which a keepalive goes out.
    fn keepalive_secs(&self) -> u64 {
        self.config.interval_secs * 3 / 2
    }

    fn process_message(&self, now: u64) -> Option<ProcessMessage> {
        match self.last_update {
            None => Some(ProcessMessage::Startup),
            Some(last) if now.saturating_sub(last) > self.keepalive_secs() => Some(ProcessMessage::Keepalive),
            Some(_) => None,
        }
    }

    fn send<T: Serialize>(&mut self, topic: &str, payload: &T, now: u64) -> Result<(), PublishError> {
        let payload = serde_json::to_string(payload)?;
        debug!("Publishing {} bytes on {}", payload.len(), topic);
        self.publisher.publish(topic, &payload)?;
        self.last_update = Some(now);
        Ok(())
    }

    /// Returns the number of messages published. A failed message is logged
    /// and the remaining heads are still published.
    pub fn run_once(&mut self, now: u64, handles: &[ReadingsHandle]) -> usize {
        let mut published = 0;

        if let Some(msgtype) = self.process_message(now) {
            let payload = ProcessPayload {
                msgtype,
                timestamp: now,
                uptime: now.saturating_sub(self.started),
                version: VERSION,
            };
            let topic = process_topic(&self.config);
            match self.send(&topic, &payload, now) {
                Ok(()) => published += 1,
                Err(e) => error!("Publishing process state failed: {}", e),
            }
        }

        for handle in handles {
            let snapshot = handle.snapshot(now);
            if let Some(payload) = head_payload(&snapshot, now, handle.expire_secs()) {
                let topic = head_topic(&self.config, handle.pin());
                match self.send(&topic, &payload, now) {
                    Ok(()) => published += 1,
                    Err(e) => error!("Publishing pin {} failed: {}", handle.pin(), e),
                }
            }
        }
        published
    }

    pub async fn start_thread(mut self, handles: Vec<ReadingsHandle>) {
        info!("Starting publisher with interval {} secs", self.config.interval_secs);
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.interval_secs.max(1)));
        loop {
            interval.tick().await;
            self.run_once(get_unix_ts(), &handles);
        }
    }
}
