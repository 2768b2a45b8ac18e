//! Charset codecs: incremental byte↔char conversion.
//!
//! A codec converts between a byte sequence and chars (whole code points),
//! one bounded step at a time. Each step consumes what it can from `src`,
//! produces what fits in `dst`, and reports why it stopped:
//!
//! - [`Status::Underflow`]: `src` is exhausted or ends mid-sequence; feed
//!   more bytes (or set `eof` to flush the tail).
//! - [`Status::Overflow`]: `dst` is full; drain it and call again.
//!
//! Malformed and unmappable input is replaced — U+FFFD when decoding, `?`
//! when encoding. The policy is fixed; transcoding never fails on content.

/// Why a codec step stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// More input is needed to make progress.
    Underflow,
    /// The destination is full.
    Overflow,
}

/// Result of one codec step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    /// Units consumed from `src`.
    pub consumed: usize,
    /// Units produced into `dst`.
    pub produced: usize,
    pub status: Status,
}

/// Incremental byte→char decoder.
pub trait Decoder {
    /// Decodes from `src` into `dst`. With `eof` set, a trailing incomplete
    /// sequence is consumed and replaced instead of left pending.
    fn decode(&mut self, src: &[u8], dst: &mut [char], eof: bool) -> Step;
}

/// Incremental char→byte encoder.
pub trait Encoder {
    /// Encodes from `src` into `dst`. A char whose encoding does not fit the
    /// remaining `dst` is left unconsumed (never split).
    fn encode(&mut self, src: &[char], dst: &mut [u8], eof: bool) -> Step;
}

const REPLACEMENT: char = '\u{FFFD}';
const SUBSTITUTE: u8 = b'?';

/// UTF-8 decoder. Stateless between steps: an incomplete trailing sequence
/// is simply not consumed, so the caller's pending buffer carries it.
#[derive(Default)]
pub struct Utf8Decoder;

impl Utf8Decoder {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for Utf8Decoder {
    fn decode(&mut self, src: &[u8], dst: &mut [char], eof: bool) -> Step {
        let mut consumed = 0;
        let mut produced = 0;
        while consumed < src.len() {
            if produced == dst.len() {
                return Step {
                    consumed,
                    produced,
                    status: Status::Overflow,
                };
            }
            let rest = &src[consumed..];
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    for c in valid.chars() {
                        if produced == dst.len() {
                            return Step {
                                consumed,
                                produced,
                                status: Status::Overflow,
                            };
                        }
                        dst[produced] = c;
                        produced += 1;
                        consumed += c.len_utf8();
                    }
                }
                Err(err) => {
                    let valid = unsafe {
                        // SAFETY: from_utf8 validated this prefix.
                        std::str::from_utf8_unchecked(&rest[..err.valid_up_to()])
                    };
                    for c in valid.chars() {
                        if produced == dst.len() {
                            return Step {
                                consumed,
                                produced,
                                status: Status::Overflow,
                            };
                        }
                        dst[produced] = c;
                        produced += 1;
                        consumed += c.len_utf8();
                    }
                    match err.error_len() {
                        Some(bad) => {
                            // Malformed run: replace and resynchronize.
                            if produced == dst.len() {
                                return Step {
                                    consumed,
                                    produced,
                                    status: Status::Overflow,
                                };
                            }
                            dst[produced] = REPLACEMENT;
                            produced += 1;
                            consumed += bad;
                        }
                        None => {
                            // Truncated sequence at the end of src.
                            if !eof {
                                return Step {
                                    consumed,
                                    produced,
                                    status: Status::Underflow,
                                };
                            }
                            if produced == dst.len() {
                                return Step {
                                    consumed,
                                    produced,
                                    status: Status::Overflow,
                                };
                            }
                            dst[produced] = REPLACEMENT;
                            produced += 1;
                            consumed = src.len();
                        }
                    }
                }
            }
        }
        Step {
            consumed,
            produced,
            status: Status::Underflow,
        }
    }
}

/// UTF-8 encoder.
#[derive(Default)]
pub struct Utf8Encoder;

impl Utf8Encoder {
    pub fn new() -> Self {
        Self
    }
}

impl Encoder for Utf8Encoder {
    fn encode(&mut self, src: &[char], dst: &mut [u8], _eof: bool) -> Step {
        let mut consumed = 0;
        let mut produced = 0;
        for &c in src {
            let len = c.len_utf8();
            if dst.len() - produced < len {
                return Step {
                    consumed,
                    produced,
                    status: Status::Overflow,
                };
            }
            c.encode_utf8(&mut dst[produced..produced + len]);
            produced += len;
            consumed += 1;
        }
        Step {
            consumed,
            produced,
            status: Status::Underflow,
        }
    }
}

/// Latin-1 decoder: every byte maps to the code point of the same value.
#[derive(Default)]
pub struct Latin1Decoder;

impl Latin1Decoder {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for Latin1Decoder {
    fn decode(&mut self, src: &[u8], dst: &mut [char], _eof: bool) -> Step {
        let n = src.len().min(dst.len());
        for (slot, &b) in dst[..n].iter_mut().zip(src[..n].iter()) {
            *slot = b as char;
        }
        Step {
            consumed: n,
            produced: n,
            status: if n < src.len() {
                Status::Overflow
            } else {
                Status::Underflow
            },
        }
    }
}

/// Latin-1 encoder; code points above U+00FF are substituted.
#[derive(Default)]
pub struct Latin1Encoder;

impl Latin1Encoder {
    pub fn new() -> Self {
        Self
    }
}

impl Encoder for Latin1Encoder {
    fn encode(&mut self, src: &[char], dst: &mut [u8], _eof: bool) -> Step {
        let n = src.len().min(dst.len());
        for (slot, &c) in dst[..n].iter_mut().zip(src[..n].iter()) {
            *slot = if (c as u32) <= 0xFF { c as u32 as u8 } else { SUBSTITUTE };
        }
        Step {
            consumed: n,
            produced: n,
            status: if n < src.len() {
                Status::Overflow
            } else {
                Status::Underflow
            },
        }
    }
}
