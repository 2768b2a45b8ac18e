//! In-memory single-producer / single-consumer pipe.
//!
//! A fixed-capacity ring shared by a writer and a reader endpoint, guarded by
//! one mutex and one condvar. Indices follow the classic sentinel scheme:
//!
//! - `in_idx == -1`: ring empty.
//! - `in_idx == out_idx` (with `in_idx >= 0`): ring full.
//! - otherwise both indices walk forward modulo capacity, and the readable
//!   count is `(in_idx - out_idx) mod capacity`.
//!
//! When a reader drains to equality the ring is marked empty again, and a
//! writer filling an empty ring re-seeds both indices to 0 first.
//!
//! # Liveness
//! Blocking waits are bounded 1 s probes, re-checking peer state on every
//! wakeup rather than sleeping unboundedly. A peer that is dropped without an
//! orderly `close` marks its side dead and signals the condvar; the reader
//! additionally keeps a two-timeout retry budget before reporting a dead
//! writer as "pipe broken". Waits are interruptible and surface
//! [`StreamError::Interrupted`].

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::interrupt::{self, WaitOutcome};

use super::error::{Result, StreamError};
use super::traits::{ByteSink, ByteSource, CharSink, CharSource};

const LIVENESS_PROBE: Duration = Duration::from_secs(1);
const DEFAULT_CAPACITY: usize = 1024;

struct Ring<T> {
    buffer: Box<[T]>,
    /// Next write index; -1 when empty.
    in_idx: isize,
    /// Next read index.
    out_idx: usize,
    connected: bool,
    closed_by_writer: bool,
    closed_by_reader: bool,
    writer_dead: bool,
    reader_dead: bool,
}

impl<T> Ring<T> {
    fn is_full(&self) -> bool {
        self.in_idx >= 0 && self.in_idx as usize == self.out_idx
    }

    fn readable(&self) -> usize {
        if self.in_idx < 0 {
            0
        } else if self.in_idx as usize == self.out_idx {
            self.buffer.len()
        } else if self.in_idx as usize > self.out_idx {
            self.in_idx as usize - self.out_idx
        } else {
            self.in_idx as usize + self.buffer.len() - self.out_idx
        }
    }

    fn check_write(&self) -> Result<()> {
        if !self.connected {
            Err(StreamError::NotConnected)
        } else if self.closed_by_writer || self.closed_by_reader {
            Err(StreamError::PipeClosed)
        } else if self.reader_dead {
            Err(StreamError::ReadEndDead)
        } else {
            Ok(())
        }
    }
}

struct Shared<T> {
    ring: Mutex<Ring<T>>,
    cond: Condvar,
}

fn make_waker<T: Send + 'static>(shared: &Arc<Shared<T>>) -> Arc<dyn Fn() + Send + Sync> {
    let s = Arc::clone(shared);
    Arc::new(move || {
        let _guard = s.ring.lock().unwrap();
        s.cond.notify_all();
    })
}

/// Read end of a pipe. Owns the ring from construction.
pub struct PipeReader<T: Copy + Default + Send + 'static> {
    shared: Arc<Shared<T>>,
    closed: bool,
}

/// Write end of a pipe. Holds no ring until connected.
pub struct PipeWriter<T: Copy + Default + Send + 'static> {
    shared: Option<Arc<Shared<T>>>,
    closed: bool,
}

/// Creates a connected writer/reader pair over a ring of `capacity` units.
///
/// # Panics
/// Panics if `capacity == 0`.
pub fn pipe<T: Copy + Default + Send + 'static>(capacity: usize) -> (PipeWriter<T>, PipeReader<T>) {
    let reader = PipeReader::unconnected(capacity);
    reader.shared.ring.lock().unwrap().connected = true;
    let writer = PipeWriter {
        shared: Some(Arc::clone(&reader.shared)),
        closed: false,
    };
    (writer, reader)
}

/// Connected byte pipe with the default ring capacity.
pub fn byte_pipe() -> (PipeWriter<u8>, PipeReader<u8>) {
    pipe(DEFAULT_CAPACITY)
}

/// Connected char pipe with the default ring capacity.
pub fn char_pipe() -> (PipeWriter<char>, PipeReader<char>) {
    pipe(DEFAULT_CAPACITY)
}

/// Connects an unconnected writer to an unconnected reader.
pub fn connect<T: Copy + Default + Send + 'static>(
    writer: &mut PipeWriter<T>,
    reader: &PipeReader<T>,
) -> Result<()> {
    if writer.shared.is_some() {
        return Err(StreamError::AlreadyConnected);
    }
    let mut ring = reader.shared.ring.lock().unwrap();
    if ring.connected {
        return Err(StreamError::AlreadyConnected);
    }
    ring.connected = true;
    drop(ring);
    writer.shared = Some(Arc::clone(&reader.shared));
    Ok(())
}

impl<T: Copy + Default + Send + 'static> PipeReader<T> {
    /// Creates the read end with its ring, awaiting [`connect`].
    ///
    /// # Panics
    /// Panics if `capacity == 0`.
    pub fn unconnected(capacity: usize) -> Self {
        assert!(capacity > 0, "pipe capacity must be > 0");
        Self {
            shared: Arc::new(Shared {
                ring: Mutex::new(Ring {
                    buffer: vec![T::default(); capacity].into_boxed_slice(),
                    in_idx: -1,
                    out_idx: 0,
                    connected: false,
                    closed_by_writer: false,
                    closed_by_reader: false,
                    writer_dead: false,
                    reader_dead: false,
                }),
                cond: Condvar::new(),
            }),
            closed: false,
        }
    }

    fn read_some(&mut self, out: &mut [T]) -> Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let shared = Arc::clone(&self.shared);
        let waker = make_waker(&shared);
        let mut ring = shared.ring.lock().unwrap();
        if !ring.connected {
            return Err(StreamError::NotConnected);
        }
        if self.closed || ring.closed_by_reader {
            return Err(StreamError::PipeClosed);
        }
        if ring.writer_dead && !ring.closed_by_writer && ring.in_idx < 0 {
            return Err(StreamError::PipeBroken);
        }

        let mut trials = 2i32;
        while ring.in_idx < 0 {
            if ring.closed_by_writer {
                return Ok(0);
            }
            if ring.writer_dead {
                trials -= 1;
                if trials < 0 {
                    return Err(StreamError::PipeBroken);
                }
            }
            // A writer may be blocked on a full ring it has since drained.
            shared.cond.notify_all();
            let (guard, outcome) =
                interrupt::wait_interruptible(&shared.cond, ring, Some(LIVENESS_PROBE), &waker);
            ring = guard;
            if outcome == WaitOutcome::Interrupted {
                interrupt::interrupted();
                return Err(StreamError::Interrupted);
            }
            if ring.closed_by_reader {
                return Err(StreamError::PipeClosed);
            }
        }

        let mut n = 0;
        while n < out.len() && ring.in_idx >= 0 {
            let cap = ring.buffer.len();
            let i = ring.in_idx as usize;
            let run = if i > ring.out_idx {
                i - ring.out_idx
            } else {
                cap - ring.out_idx
            };
            let k = run.min(out.len() - n);
            let start = ring.out_idx;
            out[n..n + k].copy_from_slice(&ring.buffer[start..start + k]);
            ring.out_idx += k;
            n += k;
            if ring.out_idx >= cap {
                ring.out_idx = 0;
            }
            if ring.in_idx as usize == ring.out_idx {
                ring.in_idx = -1;
            }
        }
        shared.cond.notify_all();
        Ok(n)
    }

    fn available_units(&mut self) -> Result<usize> {
        let ring = self.shared.ring.lock().unwrap();
        if self.closed || ring.closed_by_reader {
            return Err(StreamError::PipeClosed);
        }
        Ok(ring.readable())
    }

    fn close_reader(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut ring = self.shared.ring.lock().unwrap();
        ring.closed_by_reader = true;
        ring.in_idx = -1;
        self.shared.cond.notify_all();
        Ok(())
    }
}

impl<T: Copy + Default + Send + 'static> Drop for PipeReader<T> {
    fn drop(&mut self) {
        if !self.closed {
            let mut ring = self.shared.ring.lock().unwrap();
            ring.reader_dead = true;
            self.shared.cond.notify_all();
        }
    }
}

impl<T: Copy + Default + Send + 'static> PipeWriter<T> {
    /// Creates the write end, awaiting [`connect`].
    pub fn unconnected() -> Self {
        Self {
            shared: None,
            closed: false,
        }
    }

    fn write_all(&mut self, data: &[T]) -> Result<()> {
        if self.closed {
            return Err(StreamError::PipeClosed);
        }
        let shared = Arc::clone(self.shared.as_ref().ok_or(StreamError::NotConnected)?);
        let waker = make_waker(&shared);
        let mut ring = shared.ring.lock().unwrap();
        let mut off = 0;
        while off < data.len() {
            ring.check_write()?;
            if ring.is_full() {
                shared.cond.notify_all();
                let (guard, outcome) =
                    interrupt::wait_interruptible(&shared.cond, ring, Some(LIVENESS_PROBE), &waker);
                ring = guard;
                if outcome == WaitOutcome::Interrupted {
                    interrupt::interrupted();
                    return Err(StreamError::Interrupted);
                }
                continue;
            }
            if ring.in_idx < 0 {
                ring.in_idx = 0;
                ring.out_idx = 0;
            }
            let cap = ring.buffer.len();
            let i = ring.in_idx as usize;
            let run = if i >= ring.out_idx {
                cap - i
            } else {
                ring.out_idx - i
            };
            let k = run.min(data.len() - off);
            ring.buffer[i..i + k].copy_from_slice(&data[off..off + k]);
            off += k;
            let mut next = i + k;
            if next >= cap {
                next = 0;
            }
            ring.in_idx = next as isize;
        }
        shared.cond.notify_all();
        Ok(())
    }

    fn flush_writer(&mut self) -> Result<()> {
        if self.closed {
            return Err(StreamError::PipeClosed);
        }
        let shared = self.shared.as_ref().ok_or(StreamError::NotConnected)?;
        let _ring = shared.ring.lock().unwrap();
        shared.cond.notify_all();
        Ok(())
    }

    fn close_writer(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some(shared) = &self.shared {
            let mut ring = shared.ring.lock().unwrap();
            ring.closed_by_writer = true;
            shared.cond.notify_all();
        }
        Ok(())
    }
}

impl<T: Copy + Default + Send + 'static> Drop for PipeWriter<T> {
    fn drop(&mut self) {
        if !self.closed {
            if let Some(shared) = &self.shared {
                let mut ring = shared.ring.lock().unwrap();
                if !ring.closed_by_writer {
                    ring.writer_dead = true;
                    shared.cond.notify_all();
                }
            }
        }
    }
}

impl ByteSource for PipeReader<u8> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.read_some(buf)
    }

    fn available(&mut self) -> Result<usize> {
        self.available_units()
    }

    fn close(&mut self) -> Result<()> {
        self.close_reader()
    }
}

impl ByteSink for PipeWriter<u8> {
    fn write(&mut self, buf: &[u8]) -> Result<()> {
        self.write_all(buf)
    }

    fn flush(&mut self) -> Result<()> {
        self.flush_writer()
    }

    fn close(&mut self) -> Result<()> {
        self.close_writer()
    }
}

impl CharSource for PipeReader<char> {
    fn read(&mut self, buf: &mut [char]) -> Result<usize> {
        self.read_some(buf)
    }

    fn ready(&mut self) -> Result<bool> {
        Ok(self.available_units()? > 0)
    }

    fn close(&mut self) -> Result<()> {
        self.close_reader()
    }
}

impl CharSink for PipeWriter<char> {
    fn write(&mut self, buf: &[char]) -> Result<()> {
        self.write_all(buf)
    }

    fn flush(&mut self) -> Result<()> {
        self.flush_writer()
    }

    fn close(&mut self) -> Result<()> {
        self.close_writer()
    }
}
