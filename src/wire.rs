//! Wire format for range requests.
//!
//! Two encodings exist. Peers never negotiate; both sides are configured
//! with the same one.
//!
//! ```text
//! Framed: [len: u32][payload: len bytes]
//!         payload = magic "RNGQ" | version u8 | kind u8 | reserved u16
//!                   | offset u64 | length u32 | crc32 u32
//!
//! Raw:    [offset: u64][length: u32]
//! ```
//!
//! All integers are little-endian. The CRC covers every payload byte before
//! it, so a corrupt or foreign payload is detected before its fields are used.
//!
//! Responses are not framed at all: the server writes the requested bytes
//! verbatim and the requester already knows how many to expect.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Deserialize;
use std::io::{self, Read};

/// Size of the length prefix in front of a framed payload.
pub const PREFIX_LEN: usize = 4;

/// Size of a version 1 framed payload.
pub const PAYLOAD_LEN: usize = 24;

/// Size of a raw request.
pub const RAW_LEN: usize = 12;

/// Default upper bound on a declared payload length.
pub const DEFAULT_MAX_MESSAGE: usize = 4096;

const MAGIC: [u8; 4] = *b"RNGQ";
const VERSION: u8 = 1;
const KIND_RANGE: u8 = 0;

/// A contiguous span of the backing resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeRequest {
    pub offset: u64,
    pub length: u32,
}

impl RangeRequest {
    pub fn new(offset: u64, length: u32) -> Self {
        Self { offset, length }
    }

    /// One past the last byte, or `None` if the range overflows `u64`.
    pub fn end(&self) -> Option<u64> {
        self.offset.checked_add(u64::from(self.length))
    }

    /// Whether `offset + length <= size`.
    pub fn fits_within(&self, size: u64) -> bool {
        matches!(self.end(), Some(end) if end <= size)
    }
}

/// Which encoding a connection speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum WireFormat {
    /// Length-prefixed, versioned and checksummed payload.
    #[default]
    Framed,
    /// Bare `{offset, length}` pair with no prefix and no check.
    Raw,
}

/// Decoding errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// More input is needed before a message can be decoded.
    Incomplete { needed: usize },
    /// The bytes do not form a valid request.
    Malformed(String),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Incomplete { needed } => {
                write!(f, "incomplete message: need {} more bytes", needed)
            }
            DecodeError::Malformed(msg) => write!(f, "malformed message: {}", msg),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Encode a request.
pub fn encode(request: &RangeRequest, format: WireFormat) -> Bytes {
    match format {
        WireFormat::Framed => encode_framed(request),
        WireFormat::Raw => encode_raw(request),
    }
}

fn encode_framed(request: &RangeRequest) -> Bytes {
    let mut buf = BytesMut::with_capacity(PREFIX_LEN + PAYLOAD_LEN);
    buf.put_u32_le(PAYLOAD_LEN as u32);
    buf.put_slice(&MAGIC);
    buf.put_u8(VERSION);
    buf.put_u8(KIND_RANGE);
    buf.put_u16_le(0);
    buf.put_u64_le(request.offset);
    buf.put_u32_le(request.length);
    let crc = crc32fast::hash(&buf[PREFIX_LEN..]);
    buf.put_u32_le(crc);
    buf.freeze()
}

fn encode_raw(request: &RangeRequest) -> Bytes {
    let mut buf = BytesMut::with_capacity(RAW_LEN);
    buf.put_u64_le(request.offset);
    buf.put_u32_le(request.length);
    buf.freeze()
}

/// Decode one request from the front of `input`.
///
/// Returns the request and the number of bytes it occupied. Never panics on
/// arbitrary input.
pub fn decode(input: &[u8], format: WireFormat) -> Result<(RangeRequest, usize), DecodeError> {
    match format {
        WireFormat::Framed => {
            if input.len() < PREFIX_LEN {
                return Err(DecodeError::Incomplete {
                    needed: PREFIX_LEN - input.len(),
                });
            }
            let declared = (&input[..PREFIX_LEN]).get_u32_le() as usize;
            let total = PREFIX_LEN.saturating_add(declared);
            if input.len() < total {
                return Err(DecodeError::Incomplete {
                    needed: total - input.len(),
                });
            }
            let request = decode_payload(&input[PREFIX_LEN..total])?;
            Ok((request, total))
        }
        WireFormat::Raw => {
            if input.len() < RAW_LEN {
                return Err(DecodeError::Incomplete {
                    needed: RAW_LEN - input.len(),
                });
            }
            let mut raw = &input[..RAW_LEN];
            let offset = raw.get_u64_le();
            let length = raw.get_u32_le();
            Ok((RangeRequest::new(offset, length), RAW_LEN))
        }
    }
}

/// Verify and decode a framed payload (the bytes after the length prefix).
pub fn decode_payload(payload: &[u8]) -> Result<RangeRequest, DecodeError> {
    if payload.len() != PAYLOAD_LEN {
        return Err(DecodeError::Malformed(format!(
            "payload is {} bytes, expected {}",
            payload.len(),
            PAYLOAD_LEN
        )));
    }

    let (body, trailer) = payload.split_at(PAYLOAD_LEN - 4);
    let stored_crc = (&trailer[..]).get_u32_le();
    let computed_crc = crc32fast::hash(body);
    if stored_crc != computed_crc {
        return Err(DecodeError::Malformed(format!(
            "checksum mismatch: stored {:#010x}, computed {:#010x}",
            stored_crc, computed_crc
        )));
    }

    let mut body = body;
    if body[..4] != MAGIC {
        return Err(DecodeError::Malformed("bad magic".to_string()));
    }
    body.advance(4);

    let version = body.get_u8();
    if version != VERSION {
        return Err(DecodeError::Malformed(format!(
            "unsupported version {}",
            version
        )));
    }
    let kind = body.get_u8();
    if kind != KIND_RANGE {
        return Err(DecodeError::Malformed(format!("unknown kind {}", kind)));
    }
    if body.get_u16_le() != 0 {
        return Err(DecodeError::Malformed("reserved bits set".to_string()));
    }

    let offset = body.get_u64_le();
    let length = body.get_u32_le();
    Ok(RangeRequest::new(offset, length))
}

/// Errors from reading a request off a stream.
#[derive(Debug)]
pub enum ReadError {
    /// The stream ended partway through a message.
    Short { expected: usize, got: usize },
    /// A complete message arrived but failed verification.
    Malformed(String),
    /// The underlying read failed.
    Io(io::Error),
}

impl std::fmt::Display for ReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadError::Short { expected, got } => {
                write!(f, "partial read: expected {} bytes, got {}", expected, got)
            }
            ReadError::Malformed(msg) => write!(f, "malformed message: {}", msg),
            ReadError::Io(e) => write!(f, "read failed: {}", e),
        }
    }
}

impl std::error::Error for ReadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ReadError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ReadError {
    fn from(e: io::Error) -> Self {
        ReadError::Io(e)
    }
}

impl From<DecodeError> for ReadError {
    fn from(e: DecodeError) -> Self {
        match e {
            DecodeError::Malformed(msg) => ReadError::Malformed(msg),
            DecodeError::Incomplete { needed } => ReadError::Malformed(format!(
                "message truncated by {} bytes",
                needed
            )),
        }
    }
}

/// Read one complete request from `reader`.
///
/// Every field is read in full. A stream that ends cleanly before the first
/// byte of a message yields `Ok(None)`; a stream that ends anywhere else is a
/// framing error. A declared payload larger than `max_message` is rejected
/// before any buffer is sized for it.
pub fn read_request<R: Read + ?Sized>(
    reader: &mut R,
    format: WireFormat,
    max_message: usize,
    scratch: &mut BytesMut,
) -> Result<Option<RangeRequest>, ReadError> {
    match format {
        WireFormat::Framed => {
            let mut prefix = [0u8; PREFIX_LEN];
            match read_full(reader, &mut prefix)? {
                0 => return Ok(None),
                n if n < PREFIX_LEN => {
                    return Err(ReadError::Short {
                        expected: PREFIX_LEN,
                        got: n,
                    })
                }
                _ => {}
            }

            let declared = u32::from_le_bytes(prefix) as usize;
            if declared > max_message {
                return Err(ReadError::Malformed(format!(
                    "declared payload of {} bytes exceeds limit of {}",
                    declared, max_message
                )));
            }

            scratch.clear();
            scratch.resize(declared, 0);
            let got = read_full(reader, &mut scratch[..])?;
            if got < declared {
                return Err(ReadError::Short {
                    expected: declared,
                    got,
                });
            }

            Ok(Some(decode_payload(&scratch[..])?))
        }
        WireFormat::Raw => {
            let mut raw = [0u8; RAW_LEN];
            match read_full(reader, &mut raw)? {
                0 => Ok(None),
                n if n < RAW_LEN => Err(ReadError::Short {
                    expected: RAW_LEN,
                    got: n,
                }),
                _ => Ok(Some(decode(&raw, WireFormat::Raw)?.0)),
            }
        }
    }
}

/// Fill `buf` from `reader`, stopping early only at end of stream.
///
/// Returns the number of bytes read.
pub fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
