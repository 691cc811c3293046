//! Typed messages over a byte stream.
//!
//! Each message is one JSON body behind an 8-byte header:
//! `u32 length LE | u32 crc32c(body) LE | body`. Bodies are never empty and
//! never exceed the session's `max_frame_bytes`.

use std::io::{self, Read, Write};

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

pub const FRAME_HEADER_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("stream ended inside a frame {part}")]
    Truncated { part: &'static str },
    #[error("empty frame")]
    Empty,
    #[error("frame too large: max {max_frame_bytes} got {got_bytes}")]
    TooLarge {
        max_frame_bytes: usize,
        got_bytes: usize,
    },
    #[error("frame checksum mismatch: header says {expected:#010x}, body is {actual:#010x}")]
    Checksum { expected: u32, actual: u32 },
    #[error("cannot encode message: {0}")]
    Encode(String),
    #[error("cannot decode message: {0}")]
    Decode(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Header {
    len: usize,
    crc: u32,
}

impl Header {
    fn describe(body: &[u8], max_frame_bytes: usize) -> Result<Self, FrameError> {
        let header = Header {
            len: body.len(),
            crc: crc32c::crc32c(body),
        };
        header.check_len(max_frame_bytes)?;
        Ok(header)
    }

    fn parse(raw: [u8; FRAME_HEADER_LEN], max_frame_bytes: usize) -> Result<Self, FrameError> {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = raw;
        let header = Header {
            len: u32::from_le_bytes([l0, l1, l2, l3]) as usize,
            crc: u32::from_le_bytes([c0, c1, c2, c3]),
        };
        header.check_len(max_frame_bytes)?;
        Ok(header)
    }

    fn check_len(&self, max_frame_bytes: usize) -> Result<(), FrameError> {
        if self.len == 0 {
            return Err(FrameError::Empty);
        }
        // A max above u32::MAX still cannot be expressed in the header.
        let limit = max_frame_bytes.min(u32::MAX as usize);
        if self.len > limit {
            return Err(FrameError::TooLarge {
                max_frame_bytes: limit,
                got_bytes: self.len,
            });
        }
        Ok(())
    }

    fn verify(&self, body: &[u8]) -> Result<(), FrameError> {
        let actual = crc32c::crc32c(body);
        if actual == self.crc {
            Ok(())
        } else {
            Err(FrameError::Checksum {
                expected: self.crc,
                actual,
            })
        }
    }

    fn to_bytes(self) -> [u8; FRAME_HEADER_LEN] {
        let mut raw = [0u8; FRAME_HEADER_LEN];
        // `check_len` bounds `len` by u32::MAX.
        raw[..4].copy_from_slice(&(self.len as u32).to_le_bytes());
        raw[4..].copy_from_slice(&self.crc.to_le_bytes());
        raw
    }
}

/// Serialize `message` into a complete frame.
pub fn encode<T: Serialize>(message: &T, max_frame_bytes: usize) -> Result<Vec<u8>, FrameError> {
    let body = serde_json::to_vec(message).map_err(|e| FrameError::Encode(e.to_string()))?;
    let header = Header::describe(&body, max_frame_bytes)?;
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub struct MessageReader<R> {
    reader: R,
    max_frame_bytes: usize,
}

impl<R: Read> MessageReader<R> {
    pub fn new(reader: R, max_frame_bytes: usize) -> Self {
        Self {
            reader,
            max_frame_bytes,
        }
    }

    /// Next message, or `Ok(None)` when the stream ends between frames. A
    /// body that fails to decode is reported after the whole frame was
    /// consumed.
    pub fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>, FrameError> {
        let Some(raw) = self.read_header()? else {
            return Ok(None);
        };
        let header = Header::parse(raw, self.max_frame_bytes)?;
        let mut body = vec![0u8; header.len];
        read_all(&mut self.reader, &mut body, "body")?;
        header.verify(&body)?;
        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| FrameError::Decode(e.to_string()))
    }

    fn read_header(&mut self) -> Result<Option<[u8; FRAME_HEADER_LEN]>, FrameError> {
        let mut raw = [0u8; FRAME_HEADER_LEN];
        loop {
            match self.reader.read(&mut raw[..1]) {
                Ok(0) => return Ok(None),
                Ok(_) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        read_all(&mut self.reader, &mut raw[1..], "header")?;
        Ok(Some(raw))
    }
}

fn read_all(reader: &mut impl Read, buf: &mut [u8], part: &'static str) -> Result<(), FrameError> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => FrameError::Truncated { part },
        _ => FrameError::Io(e),
    })
}

pub struct MessageWriter<W> {
    writer: W,
    max_frame_bytes: usize,
}

impl<W: Write> MessageWriter<W> {
    pub fn new(writer: W, max_frame_bytes: usize) -> Self {
        Self {
            writer,
            max_frame_bytes,
        }
    }

    /// Frame and flush one message. Nothing is written if it cannot be
    /// encoded or is too large. Returns the frame length.
    pub fn send<T: Serialize>(&mut self, message: &T) -> Result<usize, FrameError> {
        let frame = encode(message, self.max_frame_bytes)?;
        self.writer.write_all(&frame)?;
        self.writer.flush()?;
        Ok(frame.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Cursor;

    use serde_json::{Value, json};

    use crate::daemon::session::Envelope;

    #[test]
    fn envelopes_cross_in_order() {
        let mut wire = Vec::new();
        let mut writer = MessageWriter::new(&mut wire, 1024);
        let call = Envelope::Call {
            question: 1,
            request: json!({ "op": "ping" }),
        };
        let answer = Envelope::answer(1, Ok(json!("pong")));
        writer.send(&call).unwrap();
        writer.send(&answer).unwrap();

        let mut reader = MessageReader::new(Cursor::new(wire), 1024);
        assert_eq!(reader.recv::<Envelope>().unwrap(), Some(call));
        assert_eq!(reader.recv::<Envelope>().unwrap(), Some(answer));
        assert!(reader.recv::<Envelope>().unwrap().is_none());
    }

    #[test]
    fn flipped_body_bit_fails_the_checksum() {
        let mut frame = encode(&json!("hello"), 1024).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        let err = MessageReader::new(Cursor::new(frame), 1024)
            .recv::<Value>()
            .unwrap_err();
        assert!(matches!(err, FrameError::Checksum { .. }));
    }

    #[test]
    fn size_limit_applies_on_both_ends() {
        let big = json!("x".repeat(64));
        let err = MessageWriter::new(Vec::new(), 16).send(&big).unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { max_frame_bytes: 16, .. }));

        let frame = encode(&big, 1024).unwrap();
        let err = MessageReader::new(Cursor::new(frame), 16)
            .recv::<Value>()
            .unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { .. }));
    }

    #[test]
    fn zero_length_header_is_rejected() {
        let err = MessageReader::new(Cursor::new(vec![0u8; FRAME_HEADER_LEN]), 1024)
            .recv::<Value>()
            .unwrap_err();
        assert!(matches!(err, FrameError::Empty));
    }

    #[test]
    fn truncation_names_the_part() {
        let mut frame = encode(&json!("hello world"), 1024).unwrap();
        let header_only = frame[..3].to_vec();
        frame.truncate(FRAME_HEADER_LEN + 3);

        let err = MessageReader::new(Cursor::new(header_only), 1024)
            .recv::<Value>()
            .unwrap_err();
        assert!(matches!(err, FrameError::Truncated { part: "header" }));
        let err = MessageReader::new(Cursor::new(frame), 1024)
            .recv::<Value>()
            .unwrap_err();
        assert!(matches!(err, FrameError::Truncated { part: "body" }));
    }

    #[test]
    fn undecodable_body_is_a_decode_error() {
        let frame = encode(&json!({ "kind": "shout" }), 1024).unwrap();
        let err = MessageReader::new(Cursor::new(frame), 1024)
            .recv::<Envelope>()
            .unwrap_err();
        assert!(matches!(err, FrameError::Decode(_)));
    }
}
