//! Peer socket framing (4-byte big-endian length prefix).

use std::io::{Read, Write};

use thiserror::Error;

pub const FRAME_HEADER_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame length invalid: {reason}")]
    FrameLengthInvalid { reason: String },
    #[error("frame too large: max {max_frame_bytes} got {got_bytes}")]
    FrameTooLarge {
        max_frame_bytes: usize,
        got_bytes: usize,
    },
}

impl FrameError {
    /// Whether the stream can keep being read after this error.
    pub fn is_recoverable(&self) -> bool {
        // Once framing is off the rails there is no resynchronisation point.
        false
    }
}

pub struct FrameReader<R> {
    reader: R,
    max_frame_bytes: usize,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R, max_frame_bytes: usize) -> Self {
        Self {
            reader,
            max_frame_bytes,
        }
    }

    pub fn get_ref(&self) -> &R {
        &self.reader
    }

    /// Read the next frame. `Ok(None)` means the peer closed cleanly between
    /// frames; EOF inside a frame is an error.
    pub fn read_next(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        let mut read = 0usize;
        while read < header.len() {
            let n = self.reader.read(&mut header[read..])?;
            if n == 0 {
                if read == 0 {
                    return Ok(None);
                }
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "frame header truncated",
                )
                .into());
            }
            read += n;
        }

        let length = u32::from_be_bytes(header) as usize;
        if length == 0 {
            return Err(FrameError::FrameLengthInvalid {
                reason: "frame length cannot be zero".to_string(),
            });
        }
        if length > self.max_frame_bytes {
            return Err(FrameError::FrameTooLarge {
                max_frame_bytes: self.max_frame_bytes,
                got_bytes: length,
            });
        }

        let mut body = vec![0u8; length];
        let mut read_body = 0usize;
        while read_body < length {
            let n = self.reader.read(&mut body[read_body..])?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "frame body truncated",
                )
                .into());
            }
            read_body += n;
        }

        Ok(Some(body))
    }
}

pub struct FrameWriter<W> {
    writer: W,
    max_frame_bytes: usize,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(writer: W, max_frame_bytes: usize) -> Self {
        Self {
            writer,
            max_frame_bytes,
        }
    }

    pub fn write_frame(&mut self, payload: &[u8]) -> Result<usize, FrameError> {
        let frame = encode_frame(payload, self.max_frame_bytes)?;
        self.writer.write_all(&frame)?;
        self.writer.flush()?;
        Ok(frame.len())
    }
}

pub fn encode_frame(payload: &[u8], max_frame_bytes: usize) -> Result<Vec<u8>, FrameError> {
    if payload.is_empty() {
        return Err(FrameError::FrameLengthInvalid {
            reason: "frame length cannot be zero".to_string(),
        });
    }
    if payload.len() > max_frame_bytes {
        return Err(FrameError::FrameTooLarge {
            max_frame_bytes,
            got_bytes: payload.len(),
        });
    }
    let length = u32::try_from(payload.len()).map_err(|_| FrameError::FrameLengthInvalid {
        reason: "frame length exceeds u32".to_string(),
    })?;

    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(&length.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frame_round_trips() {
        let payload = b"hello";
        let frame = encode_frame(payload, 1024).unwrap();
        assert_eq!(&frame[..4], &5u32.to_be_bytes());

        let mut reader = FrameReader::new(Cursor::new(frame), 1024);
        let decoded = reader.read_next().unwrap().unwrap();
        assert_eq!(decoded, payload);
        assert!(reader.read_next().unwrap().is_none());
    }

    #[test]
    fn reader_rejects_oversize_frame() {
        let payload = vec![0u8; 10];
        let frame = encode_frame(&payload, 1024).unwrap();

        let mut reader = FrameReader::new(Cursor::new(frame), 5);
        let err = reader.read_next().unwrap_err();
        assert!(matches!(err, FrameError::FrameTooLarge { .. }));
    }

    #[test]
    fn truncated_body_is_an_error_not_eof() {
        let mut frame = encode_frame(b"full body", 1024).unwrap();
        frame.truncate(frame.len() - 3);

        let mut reader = FrameReader::new(Cursor::new(frame), 1024);
        assert!(reader.read_next().is_err());
    }

    #[test]
    fn zero_length_frames_are_rejected() {
        assert!(encode_frame(b"", 1024).is_err());

        let mut reader = FrameReader::new(Cursor::new(0u32.to_be_bytes().to_vec()), 1024);
        assert!(matches!(
            reader.read_next().unwrap_err(),
            FrameError::FrameLengthInvalid { .. }
        ));
    }

    #[test]
    fn multiple_frames_in_sequence() {
        let mut buf = Vec::new();
        buf.extend(encode_frame(b"one", 1024).unwrap());
        buf.extend(encode_frame(b"two", 1024).unwrap());

        let mut reader = FrameReader::new(Cursor::new(buf), 1024);
        assert_eq!(reader.read_next().unwrap().unwrap(), b"one");
        assert_eq!(reader.read_next().unwrap().unwrap(), b"two");
        assert!(reader.read_next().unwrap().is_none());
    }
}
