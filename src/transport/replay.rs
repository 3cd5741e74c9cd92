//! Scripted in-memory transport.
//!
//! `ReplayConnector` plays back a recorded HTTP response as a sequence of
//! steps (data, stalls, close). Each connection gets a fresh copy of the
//! script, and everything written to any connection is recorded.

use anyhow::{anyhow, Context, Result};
use std::collections::VecDeque;
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{ByteChannel, ChannelRead, Connector};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReplayStep {
    Data(Vec<u8>),
    /// Deliver nothing for this long.
    Stall(Duration),
    Close,
}

impl ReplayStep {
    pub fn data(bytes: &[u8]) -> Self {
        Self::Data(bytes.to_vec())
    }
}

#[derive(Clone, Debug)]
pub struct ReplayConnector {
    script: Vec<ReplayStep>,
    refuse: bool,
    written: Arc<Mutex<Vec<u8>>>,
    connects: Arc<AtomicUsize>,
}

impl ReplayConnector {
    pub fn new(script: Vec<ReplayStep>) -> Self {
        Self {
            script,
            refuse: false,
            written: Arc::new(Mutex::new(Vec::new())),
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Deliver `response` in one piece, then close.
    pub fn from_response(response: &[u8]) -> Self {
        Self::new(vec![ReplayStep::data(response), ReplayStep::Close])
    }

    /// Replay a recorded response file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("failed to read replay file {}", path.display()))?;
        Ok(Self::from_response(&bytes))
    }

    /// A connector whose every connection attempt fails.
    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::new(Vec::new())
        }
    }

    /// Everything written so far, across all connections.
    pub fn written(&self) -> Vec<u8> {
        self.written
            .lock()
            .map(|bytes| bytes.clone())
            .unwrap_or_default()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl Connector for ReplayConnector {
    fn connect(&self, host: &str, port: u16, _timeout: Duration) -> Result<Box<dyn ByteChannel>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse {
            return Err(anyhow!("connection to {}:{} refused (replay)", host, port));
        }
        Ok(Box::new(ReplayChannel {
            steps: self.script.iter().cloned().collect(),
            written: self.written.clone(),
        }))
    }

    fn describe(&self) -> String {
        format!("replay ({} steps)", self.script.len())
    }
}

struct ReplayChannel {
    steps: VecDeque<ReplayStep>,
    written: Arc<Mutex<Vec<u8>>>,
}

impl Write for ReplayChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut written = self
            .written
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "replay sink poisoned"))?;
        written.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl ByteChannel for ReplayChannel {
    fn read_chunk(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<ChannelRead> {
        loop {
            let Some(step) = self.steps.pop_front() else {
                return Ok(ChannelRead::Closed);
            };
            match step {
                ReplayStep::Data(mut bytes) => {
                    if bytes.is_empty() {
                        continue;
                    }
                    let n = buf.len().min(bytes.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    bytes.drain(..n);
                    if !bytes.is_empty() {
                        self.steps.push_front(ReplayStep::Data(bytes));
                    }
                    return Ok(ChannelRead::Data(n));
                }
                ReplayStep::Stall(remaining) => {
                    if remaining > timeout {
                        std::thread::sleep(timeout);
                        self.steps.push_front(ReplayStep::Stall(remaining - timeout));
                        return Ok(ChannelRead::Idle);
                    }
                    std::thread::sleep(remaining);
                }
                ReplayStep::Close => {
                    self.steps.push_front(ReplayStep::Close);
                    return Ok(ChannelRead::Closed);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_writes_and_replays_script() {
        let connector = ReplayConnector::from_response(b"hello");
        let mut channel = connector.connect("h", 443, Duration::from_secs(1)).unwrap();
        channel.write_all(b"POST / HTTP/1.1\r\n").unwrap();

        let mut buf = [0u8; 3];
        assert_eq!(
            channel.read_chunk(&mut buf, Duration::from_millis(10)).unwrap(),
            ChannelRead::Data(3)
        );
        assert_eq!(
            channel.read_chunk(&mut buf, Duration::from_millis(10)).unwrap(),
            ChannelRead::Data(2)
        );
        assert_eq!(
            channel.read_chunk(&mut buf, Duration::from_millis(10)).unwrap(),
            ChannelRead::Closed
        );
        assert_eq!(connector.written(), b"POST / HTTP/1.1\r\n");
        assert_eq!(connector.connect_count(), 1);
    }

    #[test]
    fn long_stall_reports_idle() {
        let connector = ReplayConnector::new(vec![ReplayStep::Stall(Duration::from_secs(30))]);
        let mut channel = connector.connect("h", 443, Duration::from_secs(1)).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(
            channel.read_chunk(&mut buf, Duration::from_millis(5)).unwrap(),
            ChannelRead::Idle
        );
    }

    #[test]
    fn refusing_connector_fails() {
        let connector = ReplayConnector::refusing();
        assert!(connector.connect("h", 443, Duration::from_secs(1)).is_err());
        assert_eq!(connector.connect_count(), 1);
    }
}
