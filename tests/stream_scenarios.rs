//! End-to-end stream scenarios across wrapper chains.

use std::thread;
use std::time::Duration;

use taskstream::stream::{
    byte_pipe, pipe, BufferedByteReader, BufferedCharReader, ByteSink, ByteSource, CharSource,
    DecodingReader, EncodingWriter, PushbackByteReader, SliceSource, StreamError, Utf8Decoder,
    Utf8Encoder, VecSink,
};

#[test]
fn pipe_delivers_fifo_across_partial_reads() {
    // Capacity-4 ring, eight bytes: the writer must block mid-stream and
    // resume as the reader drains.
    let (mut tx, mut rx) = pipe::<u8>(4);
    let writer = thread::spawn(move || {
        tx.write(&[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        tx.close().unwrap();
    });

    let mut first = [0u8; 3];
    let mut n = 0;
    while n < 3 {
        let got = rx.read(&mut first[n..]).unwrap();
        assert!(got > 0);
        n += got;
    }
    assert_eq!(first, [1, 2, 3]);

    let mut rest = Vec::new();
    let mut buf = [0u8; 5];
    loop {
        let got = rx.read(&mut buf).unwrap();
        if got == 0 {
            break;
        }
        rest.extend_from_slice(&buf[..got]);
    }
    writer.join().unwrap();
    assert_eq!(rest, vec![4, 5, 6, 7, 8]);
}

#[test]
fn pipe_prefix_invariant_under_concurrent_chunking() {
    let (mut tx, mut rx) = byte_pipe();
    let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
    let expected = payload.clone();
    let writer = thread::spawn(move || {
        for chunk in payload.chunks(17) {
            tx.write(chunk).unwrap();
        }
        tx.close().unwrap();
    });
    let mut got = Vec::new();
    let mut buf = [0u8; 23];
    loop {
        let n = rx.read(&mut buf).unwrap();
        if n == 0 {
            break;
        }
        got.extend_from_slice(&buf[..n]);
    }
    writer.join().unwrap();
    assert_eq!(got, expected);
}

#[test]
fn mark_reset_replays_across_a_fill() {
    let mut r = BufferedByteReader::with_capacity(8, SliceSource::new(b"ABCDEFGHIJ".to_vec()));
    let mut head = [0u8; 3];
    assert_eq!(r.read(&mut head).unwrap(), 3);
    assert_eq!(&head, b"ABC");
    r.mark(4);
    let mut mid = [0u8; 4];
    assert_eq!(r.read(&mut mid).unwrap(), 4);
    assert_eq!(&mid, b"DEFG");
    r.reset().unwrap();
    let mut replay = [0u8; 4];
    assert_eq!(r.read(&mut replay).unwrap(), 4);
    assert_eq!(&replay, b"DEFG");
}

#[test]
fn overrunning_the_mark_invalidates_it() {
    let mut r = BufferedByteReader::with_capacity(8, SliceSource::new(b"0123456789".to_vec()));
    r.mark(3);
    let mut buf = [0u8; 5];
    assert_eq!(r.read(&mut buf).unwrap(), 5);
    assert_eq!(r.reset().unwrap_err(), StreamError::InvalidMark);
}

#[test]
fn line_reading_through_a_decoder_stack() {
    // Bytes -> UTF-8 decoder -> buffered char reader, with every terminator
    // flavor in one input.
    let src = SliceSource::new(b"a\r\nb\nc\rd".to_vec());
    let decoder = DecodingReader::new(src, Utf8Decoder::new());
    let mut lines = BufferedCharReader::with_capacity(4, decoder);
    assert_eq!(lines.read_line().unwrap().as_deref(), Some("a"));
    assert_eq!(lines.read_line().unwrap().as_deref(), Some("b"));
    assert_eq!(lines.read_line().unwrap().as_deref(), Some("c"));
    assert_eq!(lines.read_line().unwrap().as_deref(), Some("d"));
    assert_eq!(lines.read_line().unwrap(), None);
}

#[test]
fn encoder_on_decoder_round_trips_utf8_bytes() {
    let text = "mixed ascii, ümlauts, 漢字 and 🙂 emoji";
    let mut reader = DecodingReader::with_buffer_size(
        32,
        SliceSource::new(text.as_bytes().to_vec()),
        Utf8Decoder::new(),
    );
    let mut writer = EncodingWriter::with_buffer_size(32, VecSink::new(), Utf8Encoder::new());
    let mut buf = ['\0'; 7];
    loop {
        let n = reader.read(&mut buf).unwrap();
        if n == 0 {
            break;
        }
        taskstream::stream::CharSink::write(&mut writer, &buf[..n]).unwrap();
    }
    taskstream::stream::CharSink::flush(&mut writer).unwrap();
    assert_eq!(writer.into_inner().into_inner(), text.as_bytes());
}

#[test]
fn pushback_rewinds_in_lifo_order() {
    let mut r = PushbackByteReader::with_capacity(4, SliceSource::new(b"xyz".to_vec()));
    assert_eq!(r.read_one().unwrap(), Some(b'x'));
    r.unread_one(b'x').unwrap();
    r.unread(b"AB").unwrap();
    // Front of the last unread slice comes out first, then the older unread.
    assert_eq!(r.read_one().unwrap(), Some(b'A'));
    assert_eq!(r.read_one().unwrap(), Some(b'B'));
    assert_eq!(r.read_one().unwrap(), Some(b'x'));
    assert_eq!(r.read_one().unwrap(), Some(b'y'));
}

#[test]
fn closes_are_idempotent_across_the_stack() {
    let src = SliceSource::new(b"payload".to_vec());
    let mut buffered = BufferedByteReader::new(src);
    buffered.close().unwrap();
    buffered.close().unwrap();

    let (mut tx, mut rx) = pipe::<u8>(4);
    tx.close().unwrap();
    tx.close().unwrap();
    rx.close().unwrap();
    rx.close().unwrap();
}

#[test]
fn blocked_reader_sees_bytes_written_later() {
    let (mut tx, mut rx) = pipe::<u8>(8);
    let reader = thread::spawn(move || {
        let mut buf = [0u8; 4];
        let n = rx.read(&mut buf).unwrap();
        buf[..n].to_vec()
    });
    thread::sleep(Duration::from_millis(50));
    tx.write(&[9, 9]).unwrap();
    assert_eq!(reader.join().unwrap(), vec![9, 9]);
    tx.close().unwrap();
}
