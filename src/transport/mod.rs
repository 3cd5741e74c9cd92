//! Transport channel to the inference endpoint.
//!
//! A `Connector` opens a `ByteChannel` to a named host. Channels are plain
//! `Write` sinks with one deadline-aware read primitive; `ChannelReader` layers
//! line reads (for headers) and body reads on top of it. Body framing lives
//! entirely in `ChannelReader::read_available`: the body ends when the peer
//! closes or when the caller's deadline passes.
//!
//! Backends:
//! - `TlsConnector`: rustls over TCP, verification mode chosen explicitly
//! - `ReplayConnector`: scripted in-memory responses (offline replay, tests)

mod reader;
pub mod replay;
mod tls;

use anyhow::Result;
use std::io::{self, Write};
use std::time::Duration;

pub use reader::{BodyRead, ChannelReader, LineRead};
pub use replay::{ReplayConnector, ReplayStep};
pub use tls::{TlsConnector, TlsVerification};

/// Result of one bounded read attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelRead {
    /// `n` bytes were written into the caller's buffer.
    Data(usize),
    /// Nothing arrived within the timeout; the channel is still open.
    Idle,
    /// The peer closed the connection.
    Closed,
}

/// Connected byte stream with a bounded read.
pub trait ByteChannel: Write + Send {
    /// Read whatever is available, waiting at most `timeout`.
    fn read_chunk(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<ChannelRead>;
}

/// Opens channels to `host:port`.
pub trait Connector: Send {
    fn connect(&self, host: &str, port: u16, timeout: Duration) -> Result<Box<dyn ByteChannel>>;

    /// Short label for logs.
    fn describe(&self) -> String;
}
