//! Byte↔char transcoding streams.
//!
//! [`DecodingReader`] adapts a [`ByteSource`] into a [`CharSource`] through a
//! [`Decoder`]; [`EncodingWriter`] adapts a [`ByteSink`] into a [`CharSink`]
//! through an [`Encoder`]. The codec is external; what lives here is the
//! handling of partial units and leftovers:
//!
//! - Bytes the decoder could not consume (a sequence split by a refill) stay
//!   in the pending buffer and are compacted to the front before the next
//!   underlying read.
//! - A single-char read asks the decoder for *two* chars and stashes the
//!   second in a leftover slot, so a codec that produces a pair in one step
//!   never has a unit split across calls. The leftover is always the first
//!   char delivered by the next read.
//! - A bulk read blocks at most once: after the first char is produced, the
//!   reader only refills while the source reports available bytes.

use super::codec::{Decoder, Encoder, Status};
use super::error::{Result, StreamError};
use super::traits::{ByteSink, ByteSource, CharSink, CharSource};

const BYTE_BUFFER_SIZE: usize = 8192;
const MIN_BYTE_BUFFER_SIZE: usize = 32;

/// Char source decoding an underlying byte source.
pub struct DecodingReader<R, D> {
    inner: R,
    decoder: D,
    /// Pending bytes live in `buf[start..end]`.
    buf: Vec<u8>,
    start: usize,
    end: usize,
    leftover: Option<char>,
    /// The underlying source reported EOF.
    at_eof: bool,
    closed: bool,
}

impl<R: ByteSource, D: Decoder> DecodingReader<R, D> {
    pub fn new(inner: R, decoder: D) -> Self {
        Self::with_buffer_size(BYTE_BUFFER_SIZE, inner, decoder)
    }

    /// `capacity` is clamped up to a minimum that guarantees any complete
    /// byte sequence fits the pending buffer.
    pub fn with_buffer_size(capacity: usize, inner: R, decoder: D) -> Self {
        let capacity = capacity.max(MIN_BYTE_BUFFER_SIZE);
        Self {
            inner,
            decoder,
            buf: vec![0u8; capacity],
            start: 0,
            end: 0,
            leftover: None,
            at_eof: false,
            closed: false,
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(StreamError::Closed);
        }
        Ok(())
    }

    /// Compacts the pending bytes and refills from the source. Returns the
    /// number of new bytes, 0 at EOF.
    fn read_bytes(&mut self) -> Result<usize> {
        if self.start > 0 {
            self.buf.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        let end = self.end;
        let n = self.inner.read(&mut self.buf[end..])?;
        self.end += n;
        Ok(n)
    }

    fn source_ready(&mut self) -> Result<bool> {
        Ok(self.inner.available()? > 0)
    }

    fn impl_ready(&mut self) -> Result<bool> {
        Ok(self.end > self.start || self.source_ready()?)
    }

    /// Decode into `out`; callers guarantee `out.len() >= 2`.
    fn impl_read(&mut self, out: &mut [char]) -> Result<usize> {
        let mut produced = 0;
        let mut eof = self.at_eof;
        loop {
            let step = self
                .decoder
                .decode(&self.buf[self.start..self.end], &mut out[produced..], eof);
            self.start += step.consumed;
            produced += step.produced;
            match step.status {
                Status::Overflow => break,
                Status::Underflow => {
                    if eof || produced == out.len() {
                        break;
                    }
                    if produced > 0 && !self.source_ready()? {
                        // Block at most once per call.
                        break;
                    }
                    if self.read_bytes()? == 0 {
                        eof = true;
                        self.at_eof = true;
                        if self.start == self.end {
                            break;
                        }
                        // One more pass flushes the truncated tail.
                    }
                }
            }
        }
        Ok(produced)
    }
}

impl<R: ByteSource, D: Decoder> CharSource for DecodingReader<R, D> {
    fn read(&mut self, out: &mut [char]) -> Result<usize> {
        self.ensure_open()?;
        if out.is_empty() {
            return Ok(0);
        }
        let mut n = 0;
        if let Some(c) = self.leftover.take() {
            out[0] = c;
            n = 1;
            if out.len() == 1 || !self.impl_ready()? {
                return Ok(n);
            }
        }
        if out.len() - n == 1 {
            return Ok(match self.read_one()? {
                Some(c) => {
                    out[n] = c;
                    n + 1
                }
                None => n,
            });
        }
        let m = self.impl_read(&mut out[n..])?;
        Ok(n + m)
    }

    fn read_one(&mut self) -> Result<Option<char>> {
        self.ensure_open()?;
        if let Some(c) = self.leftover.take() {
            return Ok(Some(c));
        }
        // Request two chars so a pair-producing step is never split.
        let mut pair = ['\0'; 2];
        match self.impl_read(&mut pair)? {
            0 => Ok(None),
            1 => Ok(Some(pair[0])),
            _ => {
                self.leftover = Some(pair[1]);
                Ok(Some(pair[0]))
            }
        }
    }

    fn ready(&mut self) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.leftover.is_some() || self.impl_ready()?)
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.inner.close()?;
        }
        Ok(())
    }
}

/// Char sink encoding into an underlying byte sink.
pub struct EncodingWriter<W, E> {
    inner: W,
    encoder: E,
    buf: Vec<u8>,
    used: usize,
    closed: bool,
}

impl<W: ByteSink, E: Encoder> EncodingWriter<W, E> {
    pub fn new(inner: W, encoder: E) -> Self {
        Self::with_buffer_size(BYTE_BUFFER_SIZE, inner, encoder)
    }

    /// `capacity` is clamped up to a minimum that guarantees any single
    /// char's encoding fits.
    pub fn with_buffer_size(capacity: usize, inner: W, encoder: E) -> Self {
        let capacity = capacity.max(MIN_BYTE_BUFFER_SIZE);
        Self {
            inner,
            encoder,
            buf: vec![0u8; capacity],
            used: 0,
            closed: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(StreamError::Closed);
        }
        Ok(())
    }

    fn flush_bytes(&mut self) -> Result<()> {
        if self.used > 0 {
            let used = self.used;
            self.inner.write(&self.buf[..used])?;
            self.used = 0;
        }
        Ok(())
    }

    fn encode_all(&mut self, src: &[char], eof: bool) -> Result<()> {
        let mut consumed = 0;
        loop {
            let used = self.used;
            let step = self.encoder.encode(&src[consumed..], &mut self.buf[used..], eof);
            consumed += step.consumed;
            self.used += step.produced;
            match step.status {
                Status::Underflow => return Ok(()),
                Status::Overflow => self.flush_bytes()?,
            }
        }
    }
}

impl<W: ByteSink, E: Encoder> CharSink for EncodingWriter<W, E> {
    fn write(&mut self, buf: &[char]) -> Result<()> {
        self.ensure_open()?;
        self.encode_all(buf, false)
    }

    fn write_str(&mut self, s: &str) -> Result<()> {
        self.ensure_open()?;
        let chars: Vec<char> = s.chars().collect();
        self.encode_all(&chars, false)
    }

    fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.flush_bytes()?;
        self.inner.flush()
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.encode_all(&[], true)?;
        self.flush_bytes()?;
        self.inner.flush()?;
        self.inner.close()
    }
}
