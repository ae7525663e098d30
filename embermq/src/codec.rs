//! Record framing shared by segment files and the offsets log.
//!
//! ```text
//! +-------------+-------------+----------------------+
//! | len u32 BE  | crc32 u32 BE| body (len bytes)     |
//! +-------------+-------------+----------------------+
//! ```
//!
//! The body is the bincode encoding of the stored value. A frame whose header is
//! short, whose length is implausible or whose checksum does not match is reported
//! as [`Frame::Torn`], which recovery treats as the end of the valid data.

use std::io::{self, Read};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::Result;

pub const HEADER_LEN: usize = 8;

/// Upper bound of a single frame body.
pub const MAX_BODY_LEN: u32 = 256 * 1024 * 1024;

#[derive(Debug)]
pub enum Frame {
    Record { body: Vec<u8>, len: u64 },
    Eof,
    Torn,
}

/// Appends one frame holding `value` to `buf`, returns the frame length.
#[inline]
pub fn encode<T: Serialize>(value: &T, buf: &mut Vec<u8>) -> Result<u64> {
    let body = bincode::serialize(value)?;
    let start = buf.len();
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&crc32fast::hash(&body).to_be_bytes());
    buf.extend_from_slice(&body);
    Ok((buf.len() - start) as u64)
}

#[inline]
pub fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(body)?)
}

/// Reads the next frame. I/O errors other than a short read are returned as errors.
pub fn read_frame<R: Read>(r: &mut R) -> io::Result<Frame> {
    let mut header = [0u8; HEADER_LEN];
    match read_full(r, &mut header)? {
        0 => return Ok(Frame::Eof),
        n if n < HEADER_LEN => return Ok(Frame::Torn),
        _ => {}
    }
    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    let crc = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
    if len > MAX_BODY_LEN {
        return Ok(Frame::Torn);
    }
    let mut body = vec![0u8; len as usize];
    if read_full(r, &mut body)? < body.len() {
        return Ok(Frame::Torn);
    }
    if crc32fast::hash(&body) != crc {
        return Ok(Frame::Torn);
    }
    Ok(Frame::Record { body, len: (HEADER_LEN + len as usize) as u64 })
}

fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut n = 0;
    while n < buf.len() {
        match r.read(&mut buf[n..]) {
            Ok(0) => break,
            Ok(c) => n += c,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(n)
}
