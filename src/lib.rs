//! Reader for SML telegrams from smart meter infrared read heads.
//!
//! Every read head gets its own framing context, the latest readings of all
//! heads are printed to the console and handed to a publisher.

pub mod config;
pub mod console;
pub mod metering_sml;
pub mod publisher;

// Re-export common types for easier access
pub use config::Config;
pub use metering_sml::{ReadingsHandle, SmlManager, SmlReader};
pub use publisher::{LogPublisher, PublishCycle, Publisher};

pub fn get_unix_ts() -> u64 {
    return std::time::SystemTime::now()
        .duration_since(std::time::SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
}
