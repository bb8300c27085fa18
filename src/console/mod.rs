//! Ordered console output shared by every task.
//!
//! All output, log records included, goes through one channel and is written
//! by a single task, so lines and multi-line blocks never interleave.

use env_logger::{Env, Target};
use lazy_static::lazy_static;
use std::io;
use std::sync::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

struct Console {
    sender: UnboundedSender<String>,
    receiver: Mutex<Option<UnboundedReceiver<String>>>,
}

lazy_static! {
    static ref CONSOLE: Console = {
        let (sender, receiver) = unbounded_channel();
        Console { sender, receiver: Mutex::new(Some(receiver)) }
    };
}

/// Queues one message, written as a whole.
pub fn emit(message: impl Into<String>) {
    let _ = CONSOLE.sender.send(message.into());
}

/// Starts the writer draining the console to stdout. Only the first call
/// gets a task, the console has a single writer.
pub fn start_writer() -> Option<JoinHandle<()>> {
    let receiver = CONSOLE.receiver
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take()?;
    Some(tokio::spawn(drain(receiver, tokio::io::stdout())))
}

pub async fn drain<W: AsyncWrite + Unpin>(mut receiver: UnboundedReceiver<String>, mut out: W) {
    while let Some(mut message) = receiver.recv().await {
        if !message.ends_with('\n') {
            message.push('\n');
        }
        if out.write_all(message.as_bytes()).await.is_err() {
            break;
        }
        let _ = out.flush().await;
    }
}

/// `io::Write` end of the console, hands every complete record to the channel.
pub struct ConsolePipe {
    sender: UnboundedSender<String>,
    pending: Vec<u8>,
}

impl ConsolePipe {
    pub fn new(sender: UnboundedSender<String>) -> Self {
        Self { sender, pending: Vec::new() }
    }

    fn send_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let message = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        let _ = self.sender.send(message);
    }
}

impl Default for ConsolePipe {
    fn default() -> Self {
        Self::new(CONSOLE.sender.clone())
    }
}

impl io::Write for ConsolePipe {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        if self.pending.ends_with(b"\n") {
            self.send_pending();
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_pending();
        Ok(())
    }
}

/// Sets up env_logger on top of the console. The level comes from
/// `SML_LOG_LEVEL`, `info` if unset.
pub fn init_logging() {
    let default_filter = std::env::var("SML_LOG_LEVEL").unwrap_or("info".to_string());
    env_logger::Builder::from_env(Env::new().default_filter_or(default_filter))
        .target(Target::Pipe(Box::new(ConsolePipe::default())))
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_pipe_sends_complete_records() {
        let (sender, mut receiver) = unbounded_channel();
        let mut pipe = ConsolePipe::new(sender);

        pipe.write_all(b"[INFO  smlreader] first ").unwrap();
        assert!(receiver.try_recv().is_err());
        pipe.write_all(b"line\n").unwrap();
        assert_eq!(receiver.try_recv().unwrap(), "[INFO  smlreader] first line\n");

        pipe.write_all(b"no newline").unwrap();
        pipe.flush().unwrap();
        assert_eq!(receiver.try_recv().unwrap(), "no newline");
        pipe.flush().unwrap();
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_drain_keeps_blocks_together() {
        let (sender, receiver) = unbounded_channel();
        sender.send("SMLReader (Pin 4)\n  No data".to_string()).unwrap();
        sender.send("second\n".to_string()).unwrap();
        drop(sender);

        let mut out: Vec<u8> = Vec::new();
        drain(receiver, &mut out).await;
        assert_eq!(String::from_utf8(out).unwrap(), "SMLReader (Pin 4)\n  No data\nsecond\n");
    }
}
