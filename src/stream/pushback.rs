//! Pushback readers: return already-read units to the stream.
//!
//! The pushback buffer fills from the top down: `pos == capacity` is empty,
//! `pos == 0` is full, and `unread` walks `pos` toward 0 so that the most
//! recently unread unit is the next one read. Mark/reset is deliberately
//! unsupported — a pushback position and a saved mark cannot both own the
//! read cursor.

use super::error::{Result, StreamError};
use super::traits::{ByteSource, CharSource};

/// [`ByteSource`] wrapper with a fixed-size pushback buffer.
pub struct PushbackByteReader<R> {
    inner: R,
    /// `None` once closed.
    buf: Option<Vec<u8>>,
    /// Index of the next pushed-back byte; `capacity` when none.
    pos: usize,
}

impl<R: ByteSource> PushbackByteReader<R> {
    /// Single-byte pushback.
    pub fn new(inner: R) -> Self {
        Self::with_capacity(1, inner)
    }

    /// # Panics
    /// Panics if `capacity == 0`.
    pub fn with_capacity(capacity: usize, inner: R) -> Self {
        assert!(capacity > 0, "pushback capacity must be > 0");
        Self {
            inner,
            buf: Some(vec![0u8; capacity]),
            pos: capacity,
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn ensure_open(&self) -> Result<()> {
        if self.buf.is_none() {
            return Err(StreamError::Closed);
        }
        Ok(())
    }

    /// Pushes one byte back; it will be the next byte read.
    pub fn unread_one(&mut self, b: u8) -> Result<()> {
        let buf = self.buf.as_mut().ok_or(StreamError::Closed)?;
        if self.pos == 0 {
            return Err(StreamError::PushbackOverflow);
        }
        self.pos -= 1;
        buf[self.pos] = b;
        Ok(())
    }

    /// Pushes a slice back; `data[0]` will be the next byte read.
    pub fn unread(&mut self, data: &[u8]) -> Result<()> {
        let buf = self.buf.as_mut().ok_or(StreamError::Closed)?;
        if data.len() > self.pos {
            return Err(StreamError::PushbackOverflow);
        }
        self.pos -= data.len();
        buf[self.pos..self.pos + data.len()].copy_from_slice(data);
        Ok(())
    }
}

impl<R: ByteSource> ByteSource for PushbackByteReader<R> {
    fn read(&mut self, out: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        if out.is_empty() {
            return Ok(0);
        }
        let buf = self.buf.as_ref().ok_or(StreamError::Closed)?;
        let pushed = buf.len() - self.pos;
        let n = pushed.min(out.len());
        out[..n].copy_from_slice(&buf[self.pos..self.pos + n]);
        self.pos += n;
        if n == out.len() {
            return Ok(n);
        }
        let m = self.inner.read(&mut out[n..])?;
        Ok(n + m)
    }

    fn read_one(&mut self) -> Result<Option<u8>> {
        self.ensure_open()?;
        let buf = self.buf.as_ref().ok_or(StreamError::Closed)?;
        if self.pos < buf.len() {
            let b = buf[self.pos];
            self.pos += 1;
            return Ok(Some(b));
        }
        self.inner.read_one()
    }

    fn skip(&mut self, n: u64) -> Result<u64> {
        self.ensure_open()?;
        if n == 0 {
            return Ok(0);
        }
        let capacity = self.buf.as_ref().ok_or(StreamError::Closed)?.len();
        let pushed = (capacity - self.pos) as u64;
        let mut skipped = pushed.min(n);
        self.pos += skipped as usize;
        if skipped < n {
            skipped += self.inner.skip(n - skipped)?;
        }
        Ok(skipped)
    }

    fn available(&mut self) -> Result<usize> {
        self.ensure_open()?;
        let capacity = self.buf.as_ref().ok_or(StreamError::Closed)?.len();
        Ok((capacity - self.pos).saturating_add(self.inner.available()?))
    }

    fn close(&mut self) -> Result<()> {
        if self.buf.take().is_some() {
            self.inner.close()?;
        }
        Ok(())
    }
}

/// [`CharSource`] wrapper with a fixed-size pushback buffer.
pub struct PushbackCharReader<R> {
    inner: R,
    buf: Option<Vec<char>>,
    pos: usize,
}

impl<R: CharSource> PushbackCharReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_capacity(1, inner)
    }

    /// # Panics
    /// Panics if `capacity == 0`.
    pub fn with_capacity(capacity: usize, inner: R) -> Self {
        assert!(capacity > 0, "pushback capacity must be > 0");
        Self {
            inner,
            buf: Some(vec!['\0'; capacity]),
            pos: capacity,
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    fn ensure_open(&self) -> Result<()> {
        if self.buf.is_none() {
            return Err(StreamError::Closed);
        }
        Ok(())
    }

    pub fn unread_one(&mut self, c: char) -> Result<()> {
        let buf = self.buf.as_mut().ok_or(StreamError::Closed)?;
        if self.pos == 0 {
            return Err(StreamError::PushbackOverflow);
        }
        self.pos -= 1;
        buf[self.pos] = c;
        Ok(())
    }

    pub fn unread(&mut self, data: &[char]) -> Result<()> {
        let buf = self.buf.as_mut().ok_or(StreamError::Closed)?;
        if data.len() > self.pos {
            return Err(StreamError::PushbackOverflow);
        }
        self.pos -= data.len();
        buf[self.pos..self.pos + data.len()].copy_from_slice(data);
        Ok(())
    }
}

impl<R: CharSource> CharSource for PushbackCharReader<R> {
    fn read(&mut self, out: &mut [char]) -> Result<usize> {
        self.ensure_open()?;
        if out.is_empty() {
            return Ok(0);
        }
        let buf = self.buf.as_ref().ok_or(StreamError::Closed)?;
        let pushed = buf.len() - self.pos;
        let n = pushed.min(out.len());
        out[..n].copy_from_slice(&buf[self.pos..self.pos + n]);
        self.pos += n;
        if n == out.len() {
            return Ok(n);
        }
        let m = self.inner.read(&mut out[n..])?;
        Ok(n + m)
    }

    fn read_one(&mut self) -> Result<Option<char>> {
        self.ensure_open()?;
        let buf = self.buf.as_ref().ok_or(StreamError::Closed)?;
        if self.pos < buf.len() {
            let c = buf[self.pos];
            self.pos += 1;
            return Ok(Some(c));
        }
        self.inner.read_one()
    }

    fn skip(&mut self, n: u64) -> Result<u64> {
        self.ensure_open()?;
        if n == 0 {
            return Ok(0);
        }
        let capacity = self.buf.as_ref().ok_or(StreamError::Closed)?.len();
        let pushed = (capacity - self.pos) as u64;
        let mut skipped = pushed.min(n);
        self.pos += skipped as usize;
        if skipped < n {
            skipped += self.inner.skip(n - skipped)?;
        }
        Ok(skipped)
    }

    fn ready(&mut self) -> Result<bool> {
        self.ensure_open()?;
        let capacity = self.buf.as_ref().ok_or(StreamError::Closed)?.len();
        Ok(self.pos < capacity || self.inner.ready()?)
    }

    fn close(&mut self) -> Result<()> {
        if self.buf.take().is_some() {
            self.inner.close()?;
        }
        Ok(())
    }
}
