// src/communication/link.rs - Line framing and flow-controlled output for the device link
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("device closed the connection")]
    Closed,
}

/// Something that can hand the link its next command line.
pub trait CommandSource {
    fn next_command(&mut self) -> Option<String>;
}

impl<T: CommandSource + ?Sized> CommandSource for &mut T {
    fn next_command(&mut self) -> Option<String> {
        (**self).next_command()
    }
}

impl CommandSource for std::collections::VecDeque<String> {
    fn next_command(&mut self) -> Option<String> {
        self.pop_front()
    }
}

/// Longest partial line kept while waiting for its newline.
pub const MAX_LINE: usize = 16 * 1024;

/// Splits an inbound byte stream into lines. Bytes after the last newline
/// are kept for the next call. A partial line longer than [`MAX_LINE`] is
/// dropped along with the rest of it up to the next newline.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
    discarding: bool,
}

impl LineBuffer {
    pub fn feed(&mut self, mut data: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        if self.discarding {
            let Some(pos) = data.iter().position(|b| *b == b'\n') else {
                return lines;
            };
            self.discarding = false;
            data = &data[pos + 1..];
        }
        self.buf.extend_from_slice(data);
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            let line = line.trim_end_matches('\r');
            if !line.is_empty() {
                lines.push(line.to_string());
            }
        }
        if self.buf.len() > MAX_LINE {
            tracing::warn!("Discarding {} bytes of unterminated input", self.buf.len());
            self.buf.clear();
            self.discarding = true;
        }
        lines
    }

    pub fn partial_len(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.discarding = false;
    }
}

#[derive(Debug, Clone, Default)]
pub struct LinkStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub commands_sent: u64,
    pub lines_received: u64,
    pub dropped: u64,
}

/// Byte-level state of the device connection, independent of the actual
/// port. The driver reads into [`Link::feed`] and writes whatever
/// [`Link::pending`] returns, reporting progress with [`Link::advance`].
///
/// At most one command is in flight. It is only replaced once every byte
/// of it has been written, so a partial write never splits a command.
#[derive(Debug)]
pub struct Link {
    inbuf: LineBuffer,
    current: Option<Vec<u8>>,
    offset: usize,
    write_interest: bool,
    attached: bool,
    stats: LinkStats,
}

impl Link {
    pub fn new() -> Self {
        Self {
            inbuf: LineBuffer::default(),
            current: None,
            offset: 0,
            write_interest: true,
            attached: true,
            stats: LinkStats::default(),
        }
    }

    /// A link with no device behind it. Commands are pulled and dropped.
    pub fn detached() -> Self {
        Self {
            attached: false,
            ..Self::new()
        }
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn set_attached(&mut self, attached: bool) {
        self.attached = attached;
        if !attached {
            self.reset();
        }
        self.write_interest = true;
    }

    /// Complete inbound lines in `data`, after any partial line left over.
    pub fn feed(&mut self, data: &[u8]) -> Vec<String> {
        self.stats.bytes_received += data.len() as u64;
        let lines = self.inbuf.feed(data);
        self.stats.lines_received += lines.len() as u64;
        for line in &lines {
            tracing::debug!("> {}", line);
        }
        lines
    }

    /// Ask to be polled for output again; a source may have new data.
    pub fn request_write(&mut self) {
        self.write_interest = true;
    }

    pub fn wants_write(&self) -> bool {
        self.write_interest
    }

    /// A command is partly written.
    pub fn is_active(&self) -> bool {
        self.current.is_some()
    }

    /// Bytes to write next: the unwritten rest of the current command, or
    /// else the next command from `source`. Clears write interest and
    /// returns `None` when there is nothing to send.
    pub fn pending<S: CommandSource + ?Sized>(&mut self, source: &mut S) -> Option<&[u8]> {
        if self.current.is_none() {
            loop {
                let Some(cmd) = source.next_command() else {
                    self.write_interest = false;
                    return None;
                };
                if !self.attached {
                    tracing::trace!("No device, dropping: {}", cmd);
                    self.stats.dropped += 1;
                    continue;
                }
                tracing::debug!("< {}", cmd);
                let mut bytes = cmd.into_bytes();
                bytes.push(b'\n');
                self.current = Some(bytes);
                self.offset = 0;
                break;
            }
        }
        self.current.as_deref().map(|bytes| &bytes[self.offset..])
    }

    /// Record that `n` bytes of the pending output were written.
    pub fn advance(&mut self, n: usize) {
        let Some(current) = &self.current else {
            return;
        };
        self.offset = (self.offset + n).min(current.len());
        self.stats.bytes_sent += n as u64;
        if self.offset == current.len() {
            self.current = None;
            self.offset = 0;
            self.stats.commands_sent += 1;
        }
    }

    /// Write as much pending output as `out` accepts without blocking.
    /// Returns the number of bytes written.
    pub fn write_to<W, S>(&mut self, out: &mut W, source: &mut S) -> Result<usize, LinkError>
    where
        W: io::Write,
        S: CommandSource + ?Sized,
    {
        let mut total = 0;
        loop {
            let Some(buf) = self.pending(source) else {
                return Ok(total);
            };
            let n = match out.write(buf) {
                Ok(0) => return Err(LinkError::Closed),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                Err(e) => return Err(e.into()),
            };
            let short = n < buf.len();
            self.advance(n);
            total += n;
            if short {
                return Ok(total);
            }
        }
    }

    /// Forget all in-flight input and output.
    pub fn reset(&mut self) {
        self.inbuf.clear();
        self.current = None;
        self.offset = 0;
        self.write_interest = true;
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }
}

impl Default for Link {
    fn default() -> Self {
        Self::new()
    }
}
