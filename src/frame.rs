// https://redis.io/docs/reference/protocol-spec

use std::fmt;
use std::io::Cursor;

use bytes::{Buf, Bytes};
use thiserror::Error as ThisError;

use crate::commands::Command;

static CRLF: &[u8; 2] = b"\r\n";

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("not enough data is available to parse an entire frame")]
    Incomplete,
    #[error("invalid frame marker: {0:#04x}")]
    InvalidMarker(u8),
    #[error("protocol error; {0}")]
    Malformed(String),
}

/// A single decoded reply value. Replies arrive on the wire in the same order
/// their requests were sent; `Push` frames are the exception and are never
/// matched against a request.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    Null,
    Array(Vec<Frame>),
    /// Out-of-band server push (`>` marker); carries the same payload shape
    /// as an array but is routed to subscriptions instead of a caller.
    Push(Vec<Frame>),
}

impl Frame {
    /// Parses one frame out of `src`, leaving the cursor just past it.
    /// Returns `Error::Incomplete` when the buffer does not yet hold a whole
    /// frame; the caller keeps the bytes and retries after the next read.
    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Frame, Error> {
        // The first byte of every RESP value identifies its type; the rest of
        // the frame is type-specific and CRLF-terminated.
        match next_byte(src)? {
            b'+' => Ok(Frame::Simple(read_line_utf8(src)?)),
            b'-' => Ok(Frame::Error(read_line_utf8(src)?)),
            b':' => Ok(Frame::Integer(read_integer(src)?)),
            b'$' => {
                let length = read_integer(src)?;
                if length == -1 {
                    return Ok(Frame::Null);
                }
                let length = usize::try_from(length)
                    .map_err(|_| Error::Malformed(format!("invalid bulk length {length}")))?;
                read_bulk_body(src, length).map(Frame::Bulk)
            }
            b'*' => {
                let length = read_integer(src)?;
                if length == -1 {
                    return Ok(Frame::Null);
                }
                read_elements(src, length).map(Frame::Array)
            }
            b'>' => {
                let length = read_integer(src)?;
                read_elements(src, length).map(Frame::Push)
            }
            marker => Err(Error::InvalidMarker(marker)),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        self.write_to(&mut bytes);
        bytes
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        match self {
            Frame::Simple(s) => write_line(out, b'+', s.as_bytes()),
            Frame::Error(s) => write_line(out, b'-', s.as_bytes()),
            Frame::Integer(i) => write_line(out, b':', i.to_string().as_bytes()),
            Frame::Bulk(data) => write_bulk(out, data),
            Frame::Null => write_line(out, b'$', b"-1"),
            Frame::Array(items) => {
                write_line(out, b'*', items.len().to_string().as_bytes());
                for item in items {
                    item.write_to(out);
                }
            }
            Frame::Push(items) => {
                write_line(out, b'>', items.len().to_string().as_bytes());
                for item in items {
                    item.write_to(out);
                }
            }
        }
    }
}

/// Encodes a command the only way requests are ever framed: an array of bulk
/// strings holding the command name followed by its arguments.
pub fn encode_command(command: &Command) -> Vec<u8> {
    let mut bytes = Vec::new();
    write_line(
        &mut bytes,
        b'*',
        (1 + command.args().len()).to_string().as_bytes(),
    );
    write_bulk(&mut bytes, command.name().as_bytes());
    for arg in command.args() {
        write_bulk(&mut bytes, arg);
    }
    bytes
}

impl From<Frame> for Vec<u8> {
    fn from(frame: Frame) -> Self {
        frame.serialize()
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Simple(s) => write!(f, "+{}", s),
            Frame::Error(s) => write!(f, "-{}", s),
            Frame::Integer(i) => write!(f, ":{}", i),
            Frame::Bulk(bytes) => write!(f, "${}", String::from_utf8_lossy(bytes)),
            Frame::Null => write!(f, "$-1"),
            Frame::Array(items) | Frame::Push(items) => {
                let marker = if matches!(self, Frame::Push(_)) { '>' } else { '*' };
                write!(f, "{}{}[", marker, items.len())?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
        }
    }
}

fn write_line(out: &mut Vec<u8>, marker: u8, body: &[u8]) {
    out.push(marker);
    out.extend_from_slice(body);
    out.extend_from_slice(CRLF);
}

fn write_bulk(out: &mut Vec<u8>, data: &[u8]) {
    write_line(out, b'$', data.len().to_string().as_bytes());
    out.extend_from_slice(data);
    out.extend_from_slice(CRLF);
}

fn next_byte(src: &mut Cursor<&[u8]>) -> Result<u8, Error> {
    if !src.has_remaining() {
        return Err(Error::Incomplete);
    }
    Ok(src.get_u8())
}

/// Returns the bytes up to the next CRLF and advances past the terminator.
fn read_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], Error> {
    let start = src.position() as usize;
    let buffer = *src.get_ref();

    let end = buffer[start..]
        .windows(CRLF.len())
        .position(|window| window == CRLF)
        .map(|index| start + index)
        .ok_or(Error::Incomplete)?;

    src.set_position((end + CRLF.len()) as u64);
    Ok(&buffer[start..end])
}

fn read_line_utf8(src: &mut Cursor<&[u8]>) -> Result<String, Error> {
    let line = read_line(src)?;
    String::from_utf8(line.to_vec())
        .map_err(|_| Error::Malformed("invalid UTF-8 in frame".to_string()))
}

fn read_integer(src: &mut Cursor<&[u8]>) -> Result<i64, Error> {
    let line = read_line(src)?;
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| {
            Error::Malformed(format!(
                "expected integer, got {:?}",
                String::from_utf8_lossy(line)
            ))
        })
}

/// Reads a bulk body of exactly `length` bytes plus its CRLF terminator.
/// Unlike line scanning this is binary safe: the payload may itself contain
/// CRLF sequences.
fn read_bulk_body(src: &mut Cursor<&[u8]>, length: usize) -> Result<Bytes, Error> {
    let start = src.position() as usize;
    let buffer = *src.get_ref();

    if buffer.len() < start + length + CRLF.len() {
        return Err(Error::Incomplete);
    }
    if &buffer[start + length..start + length + CRLF.len()] != CRLF {
        return Err(Error::Malformed("bulk frame missing terminator".to_string()));
    }

    src.set_position((start + length + CRLF.len()) as u64);
    Ok(Bytes::copy_from_slice(&buffer[start..start + length]))
}

fn read_elements(src: &mut Cursor<&[u8]>, length: i64) -> Result<Vec<Frame>, Error> {
    let length = usize::try_from(length)
        .map_err(|_| Error::Malformed(format!("invalid element count {length}")))?;

    let mut frames = Vec::with_capacity(length);
    for _ in 0..length {
        frames.push(Frame::parse(src)?);
    }
    Ok(frames)
}
