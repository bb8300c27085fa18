use super::SmlError;
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError, Receiver, Sender};
use tokio::task::JoinHandle;

const DEVICE_READ_CHUNK: usize = 256;
const DEVICE_IDLE_WAIT: Duration = Duration::from_millis(100);

/// Non-blocking supply of bytes for one read head.
pub trait ByteSource: Send {
    /// Moves whatever was delivered since the last call into the receive buffer.
    fn poll(&mut self) {}
    fn available(&self) -> usize;
    fn read(&mut self) -> Option<u8>;
    /// Drops pending input, used after a terminal frame event.
    fn discard(&mut self);
}

/// Replays a fixed set of telegrams forever, one per poll.
pub struct ReplaySource {
    telegrams: Vec<Vec<u8>>,
    next: usize,
    buffer: VecDeque<u8>,
}

impl ReplaySource {
    pub fn new(telegrams: Vec<Vec<u8>>) -> Result<Self, SmlError> {
        if telegrams.is_empty() {
            return Err(SmlError::EmptyReplay);
        }
        Ok(Self { telegrams, next: 0, buffer: VecDeque::new() })
    }

    /// One hex encoded telegram per line. Blank lines and lines starting
    /// with `#` are skipped, whitespace inside a line is ignored.
    pub fn from_hex_lines(text: &str) -> Result<Self, SmlError> {
        let mut telegrams = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let compact: String = line.chars().filter(|c| !c.is_whitespace()).collect();
            let telegram = hex::decode(&compact).map_err(|source| SmlError::Hex { line: idx + 1, source })?;
            telegrams.push(telegram);
        }
        Self::new(telegrams)
    }

    pub fn from_file(path: &Path) -> Result<Self, SmlError> {
        let text = std::fs::read_to_string(path).map_err(|source| SmlError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let replay = Self::from_hex_lines(&text)?;
        info!("Loaded {} telegrams for replay from {}", replay.telegrams.len(), path.display());
        Ok(replay)
    }
}

impl ByteSource for ReplaySource {
    fn poll(&mut self) {
        if !self.buffer.is_empty() {
            return;
        }
        self.buffer.extend(self.telegrams[self.next].iter().copied());
        self.next = (self.next + 1) % self.telegrams.len();
    }

    fn available(&self) -> usize {
        self.buffer.len()
    }

    fn read(&mut self) -> Option<u8> {
        self.buffer.pop_front()
    }

    fn discard(&mut self) {
        self.buffer.clear();
    }
}

/// Bytes handed over by another task. The receive buffer keeps at most
/// `limit` bytes, older input is dropped when a producer outruns the reader.
pub struct ChannelSource {
    receiver: Receiver<Vec<u8>>,
    buffer: VecDeque<u8>,
    limit: usize,
    closed: bool,
}

impl ChannelSource {
    pub fn channel(chunks: usize, limit: usize) -> (Sender<Vec<u8>>, ChannelSource) {
        let (sender, receiver) = mpsc::channel(chunks.max(1));
        let source = ChannelSource {
            receiver,
            buffer: VecDeque::with_capacity(limit),
            limit: limit.max(1),
            closed: false,
        };
        (sender, source)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl ByteSource for ChannelSource {
    fn poll(&mut self) {
        loop {
            match self.receiver.try_recv() {
                Ok(chunk) => self.buffer.extend(chunk),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if !self.closed {
                        warn!("Byte source disconnected, {} bytes left", self.buffer.len());
                    }
                    self.closed = true;
                    break;
                }
            }
        }

        if self.buffer.len() > self.limit {
            let surplus = self.buffer.len() - self.limit;
            debug!("Receive buffer full, dropping {} bytes", surplus);
            self.buffer.drain(..surplus);
        }
    }

    fn available(&self) -> usize {
        self.buffer.len()
    }

    fn read(&mut self) -> Option<u8> {
        self.buffer.pop_front()
    }

    /// Also drops chunks still queued in the channel, they are older than
    /// the telegram that was just read.
    fn discard(&mut self) {
        let mut dropped = self.buffer.len();
        while let Ok(chunk) = self.receiver.try_recv() {
            dropped += chunk.len();
        }
        self.buffer.clear();
        if dropped > 0 {
            debug!("Discarded {} buffered bytes", dropped);
        }
    }
}

/// Reads a character device or FIFO on a blocking thread and forwards the
/// bytes to a [`ChannelSource`]. Ends when the receiving side is gone.
pub fn spawn_device_reader(pin: u8, path: PathBuf, sender: Sender<Vec<u8>>) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        if let Err(e) = read_device(&path, &sender) {
            error!("Read head on pin {} stopped: {}", pin, e);
        }
    })
}

fn read_device(path: &Path, sender: &Sender<Vec<u8>>) -> Result<(), SmlError> {
    let io_error = |source| SmlError::Io { path: path.display().to_string(), source };
    let mut device = File::open(path).map_err(io_error)?;
    info!("Reading SML data from {}", path.display());

    let mut chunk = [0u8; DEVICE_READ_CHUNK];
    loop {
        let count = device.read(&mut chunk).map_err(io_error)?;
        if count == 0 {
            // FIFO without writer
            if sender.is_closed() {
                return Ok(());
            }
            std::thread::sleep(DEVICE_IDLE_WAIT);
            continue;
        }
        if sender.blocking_send(chunk[..count].to_vec()).is_err() {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn drain(source: &mut dyn ByteSource) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(byte) = source.read() {
            out.push(byte);
        }
        out
    }

    #[test]
    fn test_replay_cycles_through_telegrams() {
        let mut replay = ReplaySource::from_hex_lines("# two telegrams\n1B1B\n\n  0102 03 \n").unwrap();
        assert_eq!(replay.available(), 0);

        replay.poll();
        assert_eq!(replay.available(), 2);
        // nothing new is queued while bytes are pending
        replay.poll();
        assert_eq!(drain(&mut replay), vec![0x1B, 0x1B]);

        replay.poll();
        assert_eq!(drain(&mut replay), vec![0x01, 0x02, 0x03]);

        replay.poll();
        assert_eq!(drain(&mut replay), vec![0x1B, 0x1B]);
    }

    #[test]
    fn test_replay_discard() {
        let mut replay = ReplaySource::new(vec![vec![1, 2, 3]]).unwrap();
        replay.poll();
        assert_eq!(replay.read(), Some(1));
        replay.discard();
        assert_eq!(replay.available(), 0);
        assert_eq!(replay.read(), None);
    }

    #[test]
    fn test_replay_rejects_bad_input() {
        match ReplaySource::from_hex_lines("1B1B\nZZ\n") {
            Err(SmlError::Hex { line, .. }) => assert_eq!(line, 2),
            _ => panic!("expected a hex error"),
        }
        assert!(matches!(ReplaySource::from_hex_lines("# nothing\n"), Err(SmlError::EmptyReplay)));
    }

    #[test]
    fn test_replay_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "1B1B1B1B01010101").unwrap();
        let mut replay = ReplaySource::from_file(file.path()).unwrap();
        replay.poll();
        assert_eq!(replay.available(), 8);

        let missing = ReplaySource::from_file(Path::new("/nonexistent/telegrams.hex"));
        assert!(matches!(missing, Err(SmlError::Io { .. })));
    }

    #[test]
    fn test_channel_source() {
        let (sender, mut source) = ChannelSource::channel(4, 64);
        sender.try_send(vec![1, 2]).unwrap();
        sender.try_send(vec![3]).unwrap();
        assert_eq!(source.available(), 0);

        source.poll();
        assert_eq!(source.available(), 3);
        assert_eq!(drain(&mut source), vec![1, 2, 3]);

        drop(sender);
        source.poll();
        assert!(source.is_closed());
    }

    #[test]
    fn test_channel_source_is_bounded() {
        let (sender, mut source) = ChannelSource::channel(4, 4);
        sender.try_send(vec![1, 2, 3]).unwrap();
        sender.try_send(vec![4, 5, 6]).unwrap();
        source.poll();
        assert_eq!(drain(&mut source), vec![3, 4, 5, 6]);
    }

    #[test]
    fn test_channel_discard_drops_queued_chunks() {
        let (sender, mut source) = ChannelSource::channel(4, 64);
        sender.try_send(vec![1, 2]).unwrap();
        source.poll();
        sender.try_send(vec![3]).unwrap();
        sender.try_send(vec![4, 5]).unwrap();

        source.discard();
        source.poll();
        assert_eq!(source.available(), 0);

        sender.try_send(vec![6]).unwrap();
        source.poll();
        assert_eq!(drain(&mut source), vec![6]);
        assert!(!source.is_closed());
    }

    #[tokio::test]
    async fn test_device_reader_forwards_file_content() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0x1B, 0x1B, 0x1B, 0x1B]).unwrap();
        file.flush().unwrap();

        let (sender, mut source) = ChannelSource::channel(4, 64);
        let reader = spawn_device_reader(7, file.path().to_path_buf(), sender);

        let mut received = Vec::new();
        for _ in 0..50 {
            source.poll();
            received.extend(drain(&mut source));
            if received.len() >= 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(received, vec![0x1B; 4]);

        // the reader ends once nobody listens any more
        drop(source);
        tokio::time::timeout(Duration::from_secs(2), reader).await.unwrap().unwrap();
    }
}
