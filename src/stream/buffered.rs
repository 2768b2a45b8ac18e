//! Buffered byte reader and writer.
//!
//! # Reader invariants
//! - `0 <= pos <= count <= buf.len()` while the stream is open.
//! - `mark`, when set, is an index `<= pos`; the bytes `[mark, pos)` are
//!   retained in the buffer (possibly shifted down, with `pos`, `count` and
//!   `mark` adjusted together) until more than `marklimit` bytes have been
//!   read past the mark, after which the mark may be discarded.
//! - `buf` is `None` exactly when the reader is closed; every operation on a
//!   closed reader fails with [`StreamError::Closed`].
//!
//! # Fill policy
//! On a drained buffer (`pos == count`): with no mark, `pos` rewinds to 0 and
//! one underlying read fills the buffer. With a mark and a full buffer, the
//! marked region is shifted to offset 0 if `mark > 0`; otherwise the mark is
//! silently dropped once the capacity has reached `marklimit`, or the buffer
//! grows (doubling, capped at `marklimit`).
//!
//! # Edge cases
//! - A bulk read at least as large as the buffer, with no mark set, bypasses
//!   the buffer entirely.
//! - A bulk read drains the underlying source while it reports available
//!   bytes, so it spans multiple underlying reads but blocks at most once.

use super::error::{Result, StreamError};
use super::traits::{ByteSink, ByteSource};

const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Buffering wrapper over a [`ByteSource`] with mark/reset support.
pub struct BufferedByteReader<R> {
    inner: R,
    /// `None` once closed.
    buf: Option<Vec<u8>>,
    /// Next byte to hand out.
    pos: usize,
    /// One past the last valid byte.
    count: usize,
    /// Saved position, when a mark is set.
    mark: Option<usize>,
    /// Read-ahead allowance for the current mark.
    marklimit: usize,
}

impl<R: ByteSource> BufferedByteReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE, inner)
    }

    /// # Panics
    /// Panics if `capacity == 0`.
    pub fn with_capacity(capacity: usize, inner: R) -> Self {
        assert!(capacity > 0, "buffer capacity must be > 0");
        Self {
            inner,
            buf: Some(vec![0u8; capacity]),
            pos: 0,
            count: 0,
            mark: None,
            marklimit: 0,
        }
    }

    /// Consumes the reader, returning the underlying source.
    pub fn into_inner(self) -> R {
        self.inner
    }

    fn ensure_open(&self) -> Result<()> {
        if self.buf.is_none() {
            return Err(StreamError::Closed);
        }
        Ok(())
    }

    /// Refills the buffer; assumes `pos >= count`.
    fn fill(&mut self) -> Result<()> {
        let buf = self.buf.as_mut().ok_or(StreamError::Closed)?;
        match self.mark {
            None => self.pos = 0,
            Some(mark) if self.pos >= buf.len() => {
                if mark > 0 {
                    // Keep the marked region: shift [mark, pos) to offset 0.
                    let sz = self.pos - mark;
                    buf.copy_within(mark..self.pos, 0);
                    self.pos = sz;
                    self.mark = Some(0);
                } else if buf.len() >= self.marklimit {
                    // The allowed read-ahead has been buffered in full and
                    // consumed; the mark may legally be forgotten.
                    self.mark = None;
                    self.pos = 0;
                } else {
                    // mark == 0 and the whole buffer is marked region: grow.
                    let nsz = self.pos.saturating_mul(2).min(self.marklimit);
                    buf.resize(nsz, 0);
                }
            }
            Some(_) => {}
        }
        self.count = self.pos;
        let pos = self.pos;
        let n = self
            .inner
            .read(&mut self.buf.as_mut().ok_or(StreamError::Closed)?[pos..])?;
        if n > 0 {
            self.count = pos + n;
        }
        Ok(())
    }

    /// One buffered transfer: at most one underlying read.
    fn read1(&mut self, out: &mut [u8]) -> Result<usize> {
        let mut avail = self.count - self.pos;
        if avail == 0 {
            let capacity = self.buf.as_ref().ok_or(StreamError::Closed)?.len();
            if out.len() >= capacity && self.mark.is_none() {
                // Large request, nothing to retain: hand the caller's buffer
                // straight to the underlying source.
                return self.inner.read(out);
            }
            self.fill()?;
            avail = self.count - self.pos;
            if avail == 0 {
                return Ok(0);
            }
        }
        let n = avail.min(out.len());
        let buf = self.buf.as_ref().ok_or(StreamError::Closed)?;
        out[..n].copy_from_slice(&buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

impl<R: ByteSource> ByteSource for BufferedByteReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        if buf.is_empty() {
            return Ok(0);
        }
        let mut n = 0;
        loop {
            let nread = self.read1(&mut buf[n..])?;
            if nread == 0 {
                return Ok(n);
            }
            n += nread;
            if n >= buf.len() {
                return Ok(n);
            }
            // Keep draining only while the source promises not to block.
            if self.inner.available()? == 0 {
                return Ok(n);
            }
        }
    }

    fn read_one(&mut self) -> Result<Option<u8>> {
        self.ensure_open()?;
        if self.pos >= self.count {
            self.fill()?;
            if self.pos >= self.count {
                return Ok(None);
            }
        }
        let b = self.buf.as_ref().ok_or(StreamError::Closed)?[self.pos];
        self.pos += 1;
        Ok(Some(b))
    }

    fn skip(&mut self, n: u64) -> Result<u64> {
        self.ensure_open()?;
        if n == 0 {
            return Ok(0);
        }
        let avail = self.count - self.pos;
        if avail == 0 {
            if self.mark.is_none() {
                return self.inner.skip(n);
            }
            self.fill()?;
            let avail = self.count - self.pos;
            if avail == 0 {
                return Ok(0);
            }
            let k = (avail as u64).min(n) as usize;
            self.pos += k;
            return Ok(k as u64);
        }
        let k = (avail as u64).min(n) as usize;
        self.pos += k;
        Ok(k as u64)
    }

    fn available(&mut self) -> Result<usize> {
        self.ensure_open()?;
        let buffered = self.count - self.pos;
        Ok(buffered.saturating_add(self.inner.available()?))
    }

    fn mark_supported(&self) -> bool {
        true
    }

    fn mark(&mut self, limit: usize) {
        self.marklimit = limit;
        self.mark = Some(self.pos);
    }

    fn reset(&mut self) -> Result<()> {
        self.ensure_open()?;
        let mark = self.mark.ok_or(StreamError::InvalidMark)?;
        if self.pos - mark > self.marklimit {
            // More than the promised read-ahead was consumed; the mark no
            // longer guarantees replay.
            self.mark = None;
            return Err(StreamError::InvalidMark);
        }
        self.pos = mark;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.buf.take().is_some() {
            self.inner.close()?;
        }
        Ok(())
    }
}

/// Buffering wrapper over a [`ByteSink`].
///
/// Bytes accumulate in a fixed buffer flushed when full; a write at least as
/// large as the buffer bypasses it after flushing what is pending.
pub struct BufferedByteWriter<W> {
    inner: W,
    buf: Vec<u8>,
    capacity: usize,
    closed: bool,
}

impl<W: ByteSink> BufferedByteWriter<W> {
    pub fn new(inner: W) -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE, inner)
    }

    /// # Panics
    /// Panics if `capacity == 0`.
    pub fn with_capacity(capacity: usize, inner: W) -> Self {
        assert!(capacity > 0, "buffer capacity must be > 0");
        Self {
            inner,
            buf: Vec::with_capacity(capacity),
            capacity,
            closed: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    fn flush_buffer(&mut self) -> Result<()> {
        if !self.buf.is_empty() {
            self.inner.write(&self.buf)?;
            self.buf.clear();
        }
        Ok(())
    }
}

impl<W: ByteSink> ByteSink for BufferedByteWriter<W> {
    fn write(&mut self, buf: &[u8]) -> Result<()> {
        if self.closed {
            return Err(StreamError::Closed);
        }
        if buf.len() >= self.capacity {
            self.flush_buffer()?;
            return self.inner.write(buf);
        }
        if buf.len() > self.capacity - self.buf.len() {
            self.flush_buffer()?;
        }
        self.buf.extend_from_slice(buf);
        Ok(())
    }

    fn write_one(&mut self, b: u8) -> Result<()> {
        if self.closed {
            return Err(StreamError::Closed);
        }
        if self.buf.len() >= self.capacity {
            self.flush_buffer()?;
        }
        self.buf.push(b);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if self.closed {
            return Err(StreamError::Closed);
        }
        self.flush_buffer()?;
        self.inner.flush()
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.flush_buffer()?;
        self.inner.flush()?;
        self.inner.close()
    }
}
