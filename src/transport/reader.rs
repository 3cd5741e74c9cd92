use std::io;
use std::time::Instant;

use super::{ByteChannel, ChannelRead};

const SCRATCH_BYTES: usize = 1024;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LineRead {
    /// A complete line with its terminator stripped.
    Line(String),
    /// More than `max_len` bytes arrived without a line terminator.
    TooLong,
    TimedOut,
    Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BodyRead {
    Data(usize),
    TimedOut,
    Closed,
}

/// Deadline-driven reader over a `ByteChannel`.
///
/// Bytes read past a line terminator are kept and handed out first by the
/// next `read_line` or `read_available` call.
pub struct ChannelReader<'a> {
    channel: &'a mut dyn ByteChannel,
    pending: Vec<u8>,
    scratch: Vec<u8>,
}

impl<'a> ChannelReader<'a> {
    pub fn new(channel: &'a mut dyn ByteChannel) -> Self {
        Self {
            channel,
            pending: Vec::new(),
            scratch: vec![0u8; SCRATCH_BYTES],
        }
    }

    /// Read one `\n`-terminated line before `deadline`.
    pub fn read_line(&mut self, deadline: Instant, max_len: usize) -> io::Result<LineRead> {
        loop {
            if let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = self.pending.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&raw)
                    .trim_end_matches(&['\r', '\n'][..])
                    .to_string();
                return Ok(LineRead::Line(line));
            }
            if self.pending.len() > max_len {
                return Ok(LineRead::TooLong);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(LineRead::TimedOut);
            }
            match self.channel.read_chunk(&mut self.scratch, deadline - now)? {
                ChannelRead::Data(n) => self.pending.extend_from_slice(&self.scratch[..n]),
                ChannelRead::Idle => continue,
                ChannelRead::Closed => return Ok(LineRead::Closed),
            }
        }
    }

    /// Read available body bytes into `buf` before `deadline`.
    pub fn read_available(&mut self, buf: &mut [u8], deadline: Instant) -> io::Result<BodyRead> {
        if !self.pending.is_empty() {
            let n = buf.len().min(self.pending.len());
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
            return Ok(BodyRead::Data(n));
        }
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Ok(BodyRead::TimedOut);
            }
            match self.channel.read_chunk(buf, deadline - now)? {
                ChannelRead::Data(0) => continue,
                ChannelRead::Data(n) => return Ok(BodyRead::Data(n)),
                ChannelRead::Idle => continue,
                ChannelRead::Closed => return Ok(BodyRead::Closed),
            }
        }
    }
}
