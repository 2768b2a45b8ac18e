//! Composable blocking streams over bytes and chars.
//!
//! # Module map
//! - `traits`: the [`ByteSource`]/[`ByteSink`]/[`CharSource`]/[`CharSink`]
//!   seams everything else plugs into.
//! - `mem`: in-memory endpoints.
//! - `buffered`: buffered byte reader (mark/reset, fill policy) and writer.
//! - `chars`: buffered char reader, line extraction, line numbering.
//! - `pushback`: bounded unread for bytes and chars.
//! - `pipe`: ring-buffered thread-to-thread channel.
//! - `codec` / `transcode`: charset conversion with leftover handling.
//! - `print`: formatted output with deferred error reporting.

pub mod buffered;
pub mod chars;
pub mod codec;
pub mod error;
pub mod mem;
pub mod pipe;
pub mod print;
pub mod pushback;
pub mod traits;
pub mod transcode;

pub use buffered::{BufferedByteReader, BufferedByteWriter};
pub use chars::{BufferedCharReader, LineNumberedReader};
pub use codec::{Decoder, Encoder, Latin1Decoder, Latin1Encoder, Status, Step, Utf8Decoder, Utf8Encoder};
pub use error::{Result, StreamError};
pub use mem::{SliceSource, StrSource, StringSink, VecSink};
pub use pipe::{byte_pipe, char_pipe, connect, pipe, PipeReader, PipeWriter};
pub use print::PrintSink;
pub use pushback::{PushbackByteReader, PushbackCharReader};
pub use traits::{ByteSink, ByteSource, CharSink, CharSource};
pub use transcode::{DecodingReader, EncodingWriter};
