//! Buffered char reader with line extraction, and a line-numbering wrapper.
//!
//! # Fill policy (marked case)
//! When a refill is needed and a mark is set: if more than `marklimit` chars
//! were consumed past the mark, the mark is invalidated and the whole buffer
//! is reusable. Otherwise the marked region `[mark, pos)` is retained — shifted
//! to offset 0 when `marklimit` fits the current buffer, or moved into a
//! buffer grown to exactly `marklimit` when it does not. The refill
//! destination is the length of the retained region (0 when nothing was
//! retained); no other value is ever used.
//!
//! # Line terminators
//! `\n`, `\r` and `\r\n` all end a line; the terminator is not part of the
//! returned line. A `\r` seen at the end of one buffer sets a persistent
//! `skip_lf` flag so the `\n` that may open the next buffer is discarded.
//! EOF ends a non-empty final line.

use super::error::{Result, StreamError};
use super::traits::CharSource;

const DEFAULT_BUFFER_SIZE: usize = 8192;
const EXPECTED_LINE_LENGTH: usize = 80;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unset,
    /// Set and then overrun: reset must fail, but reads continue.
    Invalidated,
    At(usize),
}

/// Buffering wrapper over a [`CharSource`] with mark/reset and line reading.
pub struct BufferedCharReader<R> {
    inner: R,
    /// `None` once closed.
    buf: Option<Vec<char>>,
    /// Next char to hand out.
    pos: usize,
    /// One past the last valid char.
    count: usize,
    mark: Mark,
    marklimit: usize,
    /// The previous read ended on `\r`; drop one leading `\n`.
    skip_lf: bool,
    marked_skip_lf: bool,
}

impl<R: CharSource> BufferedCharReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE, inner)
    }

    /// # Panics
    /// Panics if `capacity == 0`.
    pub fn with_capacity(capacity: usize, inner: R) -> Self {
        assert!(capacity > 0, "buffer capacity must be > 0");
        Self {
            inner,
            buf: Some(vec!['\0'; capacity]),
            pos: 0,
            count: 0,
            mark: Mark::Unset,
            marklimit: 0,
            skip_lf: false,
            marked_skip_lf: false,
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

    fn fill(&mut self) -> Result<()> {
        let dst = {
            let buf = self.buf.as_mut().ok_or(StreamError::Closed)?;
            match self.mark {
                Mark::At(mark) => {
                    let delta = self.pos - mark;
                    if delta >= self.marklimit {
                        self.mark = Mark::Invalidated;
                        self.marklimit = 0;
                        0
                    } else {
                        if self.marklimit <= buf.len() {
                            buf.copy_within(mark..self.pos, 0);
                        } else {
                            let mut grown = vec!['\0'; self.marklimit];
                            grown[..delta].copy_from_slice(&buf[mark..self.pos]);
                            *buf = grown;
                        }
                        self.mark = Mark::At(0);
                        self.pos = delta;
                        self.count = delta;
                        delta
                    }
                }
                _ => 0,
            }
        };
        let n = self
            .inner
            .read(&mut self.buf.as_mut().ok_or(StreamError::Closed)?[dst..])?;
        if n > 0 {
            self.count = dst + n;
            self.pos = dst;
        }
        Ok(())
    }

    /// One buffered transfer: at most one underlying read.
    fn read1(&mut self, out: &mut [char]) -> Result<usize> {
        if self.pos >= self.count {
            let capacity = self.buf.as_ref().ok_or(StreamError::Closed)?.len();
            if out.len() >= capacity && self.mark == Mark::Unset && !self.skip_lf {
                return self.inner.read(out);
            }
            self.fill()?;
        }
        if self.pos >= self.count {
            return Ok(0);
        }
        if self.skip_lf {
            self.skip_lf = false;
            if self.buf.as_ref().ok_or(StreamError::Closed)?[self.pos] == '\n' {
                self.pos += 1;
                if self.pos >= self.count {
                    self.fill()?;
                }
                if self.pos >= self.count {
                    return Ok(0);
                }
            }
        }
        let n = (self.count - self.pos).min(out.len());
        let buf = self.buf.as_ref().ok_or(StreamError::Closed)?;
        out[..n].copy_from_slice(&buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    /// Reads a line, where any of `\n`, `\r`, `\r\n` or EOF terminates it.
    pub fn read_line(&mut self) -> Result<Option<String>> {
        let mut term = false;
        self.read_line_with(false, &mut term)
    }

    /// Line-reading primitive. With `ignore_lf` a single leading `\n` is
    /// dropped regardless of the `skip_lf` flag; `term_seen` reports whether
    /// an explicit terminator (rather than EOF) ended the line.
    pub fn read_line_with(&mut self, ignore_lf: bool, term_seen: &mut bool) -> Result<Option<String>> {
        self.ensure_open()?;
        let mut acc: Option<String> = None;
        let mut omit_lf = ignore_lf || self.skip_lf;
        *term_seen = false;

        loop {
            if self.pos >= self.count {
                self.fill()?;
            }
            if self.pos >= self.count {
                // EOF: a pending fragment is the final, unterminated line.
                return Ok(match acc {
                    Some(s) if !s.is_empty() => Some(s),
                    _ => None,
                });
            }
            let buf = self.buf.as_ref().ok_or(StreamError::Closed)?;
            if omit_lf && buf[self.pos] == '\n' {
                self.pos += 1;
            }
            self.skip_lf = false;
            omit_lf = false;

            let mut eol = None;
            let mut i = self.pos;
            while i < self.count {
                let c = buf[i];
                if c == '\n' || c == '\r' {
                    *term_seen = true;
                    eol = Some(c);
                    break;
                }
                i += 1;
            }

            let start = self.pos;
            self.pos = i;

            if let Some(c) = eol {
                let line = match acc {
                    None => buf[start..i].iter().collect(),
                    Some(mut s) => {
                        s.extend(buf[start..i].iter());
                        s
                    }
                };
                self.pos += 1;
                if c == '\r' {
                    self.skip_lf = true;
                }
                return Ok(Some(line));
            }

            let s = acc.get_or_insert_with(|| String::with_capacity(EXPECTED_LINE_LENGTH));
            s.extend(buf[start..i].iter());
        }
    }
}

impl<R: CharSource> CharSource for BufferedCharReader<R> {
    fn read(&mut self, buf: &mut [char]) -> Result<usize> {
        self.ensure_open()?;
        if buf.is_empty() {
            return Ok(0);
        }
        let mut n = self.read1(buf)?;
        if n == 0 {
            return Ok(0);
        }
        while n < buf.len() && self.inner.ready()? {
            let n1 = self.read1(&mut buf[n..])?;
            if n1 == 0 {
                break;
            }
            n += n1;
        }
        Ok(n)
    }

    fn read_one(&mut self) -> Result<Option<char>> {
        self.ensure_open()?;
        loop {
            if self.pos >= self.count {
                self.fill()?;
                if self.pos >= self.count {
                    return Ok(None);
                }
            }
            let c = self.buf.as_ref().ok_or(StreamError::Closed)?[self.pos];
            if self.skip_lf {
                self.skip_lf = false;
                if c == '\n' {
                    self.pos += 1;
                    continue;
                }
            }
            self.pos += 1;
            return Ok(Some(c));
        }
    }

    fn skip(&mut self, n: u64) -> Result<u64> {
        self.ensure_open()?;
        let mut remaining = n;
        while remaining > 0 {
            if self.pos >= self.count {
                self.fill()?;
            }
            if self.pos >= self.count {
                break;
            }
            if self.skip_lf {
                self.skip_lf = false;
                if self.buf.as_ref().ok_or(StreamError::Closed)?[self.pos] == '\n' {
                    self.pos += 1;
                }
                continue;
            }
            let d = ((self.count - self.pos) as u64).min(remaining) as usize;
            self.pos += d;
            remaining -= d as u64;
        }
        Ok(n - remaining)
    }

    fn ready(&mut self) -> Result<bool> {
        self.ensure_open()?;
        // A pending '\n' skip is resolved now, while it is cheap: a buffered
        // lone '\n' would otherwise make the reader look ready when the next
        // read could block.
        if self.skip_lf {
            if self.pos >= self.count && self.inner.ready()? {
                self.fill()?;
            }
            if self.pos < self.count {
                if self.buf.as_ref().ok_or(StreamError::Closed)?[self.pos] == '\n' {
                    self.pos += 1;
                }
                self.skip_lf = false;
            }
        }
        Ok(self.pos < self.count || self.inner.ready()?)
    }

    fn mark_supported(&self) -> bool {
        true
    }

    fn mark(&mut self, limit: usize) {
        self.marklimit = limit;
        self.mark = Mark::At(self.pos);
        self.marked_skip_lf = self.skip_lf;
    }

    fn reset(&mut self) -> Result<()> {
        self.ensure_open()?;
        match self.mark {
            Mark::At(m) if self.pos - m <= self.marklimit => {
                self.pos = m;
                self.skip_lf = self.marked_skip_lf;
                Ok(())
            }
            Mark::At(_) => {
                self.mark = Mark::Invalidated;
                Err(StreamError::InvalidMark)
            }
            _ => Err(StreamError::InvalidMark),
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.buf.take().is_some() {
            self.inner.close()?;
        }
        Ok(())
    }
}

/// Char reader that tracks line numbers.
///
/// Every terminator (`\n`, `\r`, `\r\n`) reads back as a single `\n` and
/// bumps the line count; `mark`/`reset` save and restore the count.
pub struct LineNumberedReader<R> {
    inner: BufferedCharReader<R>,
    line: usize,
    marked_line: usize,
    /// A `\r` was just consumed; a following `\n` belongs to it.
    skip_lf: bool,
    marked_skip_lf: bool,
}

impl<R: CharSource> LineNumberedReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: BufferedCharReader::new(inner),
            line: 0,
            marked_line: 0,
            skip_lf: false,
            marked_skip_lf: false,
        }
    }

    /// Current line number; starts at 0 and counts terminators seen.
    pub fn line_number(&self) -> usize {
        self.line
    }

    pub fn set_line_number(&mut self, line: usize) {
        self.line = line;
    }

    /// Reads a line and counts it.
    pub fn read_line(&mut self) -> Result<Option<String>> {
        let mut term = false;
        let line = self.inner.read_line_with(self.skip_lf, &mut term)?;
        if line.is_some() {
            self.line += 1;
        }
        self.skip_lf = false;
        Ok(line)
    }
}

impl<R: CharSource> CharSource for LineNumberedReader<R> {
    fn read(&mut self, buf: &mut [char]) -> Result<usize> {
        for (i, slot) in buf.iter_mut().enumerate() {
            match self.read_one()? {
                Some(c) => *slot = c,
                None => return Ok(i),
            }
        }
        Ok(buf.len())
    }

    fn read_one(&mut self) -> Result<Option<char>> {
        let mut c = self.inner.read_one()?;
        if self.skip_lf {
            if c == Some('\n') {
                c = self.inner.read_one()?;
            }
            self.skip_lf = false;
        }
        match c {
            Some('\r') => {
                self.skip_lf = true;
                self.line += 1;
                Ok(Some('\n'))
            }
            Some('\n') => {
                self.line += 1;
                Ok(Some('\n'))
            }
            other => Ok(other),
        }
    }

    fn skip(&mut self, n: u64) -> Result<u64> {
        let mut skipped = 0;
        while skipped < n {
            if self.read_one()?.is_none() {
                break;
            }
            skipped += 1;
        }
        Ok(skipped)
    }

    fn ready(&mut self) -> Result<bool> {
        self.inner.ready()
    }

    fn mark_supported(&self) -> bool {
        true
    }

    fn mark(&mut self, limit: usize) {
        // One extra char of allowance covers a terminator pair split by the
        // mark point.
        self.inner.mark(limit.saturating_add(1));
        self.marked_line = self.line;
        self.marked_skip_lf = self.skip_lf;
    }

    fn reset(&mut self) -> Result<()> {
        self.inner.reset()?;
        self.line = self.marked_line;
        self.skip_lf = self.marked_skip_lf;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.inner.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::mem::StrSource;

    fn reader(s: &str) -> BufferedCharReader<StrSource> {
        BufferedCharReader::with_capacity(4, StrSource::new(s))
    }

    #[test]
    fn line_terminators_are_normalized() {
        let mut r = reader("a\r\nb\nc\rd");
        assert_eq!(r.read_line().unwrap().as_deref(), Some("a"));
        assert_eq!(r.read_line().unwrap().as_deref(), Some("b"));
        assert_eq!(r.read_line().unwrap().as_deref(), Some("c"));
        assert_eq!(r.read_line().unwrap().as_deref(), Some("d"));
        assert_eq!(r.read_line().unwrap(), None);
    }

    #[test]
    fn crlf_split_across_buffer_boundary() {
        // Capacity 4: "abc\r" fills one buffer, "\nxy" opens the next.
        let mut r = reader("abc\r\nxy");
        assert_eq!(r.read_line().unwrap().as_deref(), Some("abc"));
        assert_eq!(r.read_line().unwrap().as_deref(), Some("xy"));
        assert_eq!(r.read_line().unwrap(), None);
    }

    #[test]
    fn long_line_assembled_across_fills() {
        let mut r = reader("0123456789abcdef\nz");
        assert_eq!(r.read_line().unwrap().as_deref(), Some("0123456789abcdef"));
        assert_eq!(r.read_line().unwrap().as_deref(), Some("z"));
    }

    #[test]
    fn concatenation_invariant_holds() {
        let input = "a\r\nb\nc\rd\n";
        let mut r = reader(input);
        let mut rebuilt = String::new();
        // Terminators are not returned; this input ends every line with one,
        // so rebuilding with '\n' preserves line count and content.
        while let Some(line) = r.read_line().unwrap() {
            rebuilt.push_str(&line);
            rebuilt.push('\n');
        }
        assert_eq!(rebuilt, "a\nb\nc\nd\n");
    }

    #[test]
    fn empty_lines_are_preserved() {
        let mut r = reader("\n\nx\n");
        assert_eq!(r.read_line().unwrap().as_deref(), Some(""));
        assert_eq!(r.read_line().unwrap().as_deref(), Some(""));
        assert_eq!(r.read_line().unwrap().as_deref(), Some("x"));
        assert_eq!(r.read_line().unwrap(), None);
    }

    #[test]
    fn mark_reset_replays_chars() {
        let mut r = reader("abcdefgh");
        assert_eq!(r.read_one().unwrap(), Some('a'));
        r.mark(5);
        let mut buf = ['\0'; 3];
        assert_eq!(r.read(&mut buf).unwrap(), 3);
        r.reset().unwrap();
        let mut replay = ['\0'; 3];
        assert_eq!(r.read(&mut replay).unwrap(), 3);
        assert_eq!(replay, buf);
    }

    #[test]
    fn mark_survives_growth_past_capacity() {
        let mut r = reader("abcdefghij");
        r.mark(8);
        let mut buf = ['\0'; 6];
        assert_eq!(r.read(&mut buf).unwrap(), 6);
        r.reset().unwrap();
        assert_eq!(r.read_one().unwrap(), Some('a'));
    }

    #[test]
    fn overrun_mark_is_invalid() {
        let mut r = reader("abcdefghij");
        r.mark(2);
        let mut buf = ['\0'; 5];
        assert_eq!(r.read(&mut buf).unwrap(), 5);
        assert_eq!(r.reset().unwrap_err(), StreamError::InvalidMark);
    }

    #[test]
    fn skip_lf_survives_mark_reset() {
        let mut r = reader("ab\r\ncd");
        assert_eq!(r.read_line().unwrap().as_deref(), Some("ab"));
        // skip_lf is pending here: the '\n' has not been consumed yet.
        r.mark(4);
        assert_eq!(r.read_one().unwrap(), Some('c'));
        r.reset().unwrap();
        assert_eq!(r.read_one().unwrap(), Some('c'));
    }

    #[test]
    fn close_poisons_operations() {
        let mut r = reader("abc");
        r.close().unwrap();
        r.close().unwrap();
        assert_eq!(r.read_line().unwrap_err(), StreamError::Closed);
        assert_eq!(r.read_one().unwrap_err(), StreamError::Closed);
    }

    #[test]
    fn line_numbers_count_all_terminators() {
        let mut r = LineNumberedReader::new(StrSource::new("a\r\nb\nc\rd"));
        assert_eq!(r.line_number(), 0);
        assert_eq!(r.read_line().unwrap().as_deref(), Some("a"));
        assert_eq!(r.line_number(), 1);
        assert_eq!(r.read_line().unwrap().as_deref(), Some("b"));
        assert_eq!(r.read_line().unwrap().as_deref(), Some("c"));
        assert_eq!(r.read_line().unwrap().as_deref(), Some("d"));
        assert_eq!(r.line_number(), 4);
    }

    #[test]
    fn numbered_read_one_normalizes_terminators() {
        let mut r = LineNumberedReader::new(StrSource::new("x\r\ny"));
        assert_eq!(r.read_one().unwrap(), Some('x'));
        assert_eq!(r.read_one().unwrap(), Some('\n'));
        assert_eq!(r.line_number(), 1);
        assert_eq!(r.read_one().unwrap(), Some('y'));
        assert_eq!(r.read_one().unwrap(), None);
    }

    #[test]
    fn numbered_mark_restores_count() {
        let mut r = LineNumberedReader::new(StrSource::new("a\nb\nc"));
        assert_eq!(r.read_line().unwrap().as_deref(), Some("a"));
        r.mark(8);
        assert_eq!(r.read_line().unwrap().as_deref(), Some("b"));
        assert_eq!(r.line_number(), 2);
        r.reset().unwrap();
        assert_eq!(r.line_number(), 1);
        assert_eq!(r.read_line().unwrap().as_deref(), Some("b"));
    }
}
