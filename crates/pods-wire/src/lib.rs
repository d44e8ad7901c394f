//! Bencode envelope codec for the pod protocol.
//!
//! Every message between host and pod is one bencode value: a 64-bit
//! integer, a byte string, a list, or a dictionary with byte-string keys.
//! [`read_message`] decodes exactly one value from a stream and leaves the
//! stream positioned at the tail; [`write_message`] encodes a value and
//! flushes, writing dictionary keys in sorted order. Decode tolerates
//! arbitrary dictionary key order.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use thiserror::Error;

/// Upper bound on a single byte-string payload, so a corrupt length prefix
/// cannot drive allocation.
const MAX_BYTES_LEN: u64 = 1 << 30;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// The stream ended in the middle of a value.
    #[error("truncated envelope: stream ended mid-value")]
    Truncated,
    #[error("malformed envelope: {0}")]
    Malformed(String),
    #[error("unexpected envelope type: expected {expected}, found {found}")]
    UnexpectedType {
        expected: &'static str,
        found: &'static str,
    },
    #[error("envelope io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Envelope>),
    Dict(BTreeMap<Vec<u8>, Envelope>),
}

impl Envelope {
    pub fn bytes(b: impl Into<Vec<u8>>) -> Self {
        Envelope::Bytes(b.into())
    }

    pub fn str(s: &str) -> Self {
        Envelope::Bytes(s.as_bytes().to_vec())
    }

    fn type_name(&self) -> &'static str {
        match self {
            Envelope::Int(_) => "integer",
            Envelope::Bytes(_) => "byte string",
            Envelope::List(_) => "list",
            Envelope::Dict(_) => "dictionary",
        }
    }

    pub fn as_int(&self) -> Result<i64, EnvelopeError> {
        match self {
            Envelope::Int(n) => Ok(*n),
            other => Err(EnvelopeError::UnexpectedType {
                expected: "integer",
                found: other.type_name(),
            }),
        }
    }

    pub fn as_bytes(&self) -> Result<&[u8], EnvelopeError> {
        match self {
            Envelope::Bytes(b) => Ok(b),
            other => Err(EnvelopeError::UnexpectedType {
                expected: "byte string",
                found: other.type_name(),
            }),
        }
    }

    pub fn as_str(&self) -> Result<&str, EnvelopeError> {
        let bytes = self.as_bytes()?;
        std::str::from_utf8(bytes)
            .map_err(|_| EnvelopeError::Malformed("byte string is not utf-8".to_string()))
    }

    pub fn as_list(&self) -> Result<&[Envelope], EnvelopeError> {
        match self {
            Envelope::List(items) => Ok(items),
            other => Err(EnvelopeError::UnexpectedType {
                expected: "list",
                found: other.type_name(),
            }),
        }
    }

    pub fn as_dict(&self) -> Result<&BTreeMap<Vec<u8>, Envelope>, EnvelopeError> {
        match self {
            Envelope::Dict(entries) => Ok(entries),
            other => Err(EnvelopeError::UnexpectedType {
                expected: "dictionary",
                found: other.type_name(),
            }),
        }
    }

    /// Dictionary lookup by string key. `None` for non-dictionaries.
    pub fn get(&self, key: &str) -> Option<&Envelope> {
        match self {
            Envelope::Dict(entries) => entries.get(key.as_bytes()),
            _ => None,
        }
    }

    pub fn encode_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        match self {
            Envelope::Int(n) => write!(w, "i{n}e"),
            Envelope::Bytes(b) => {
                write!(w, "{}:", b.len())?;
                w.write_all(b)
            }
            Envelope::List(items) => {
                w.write_all(b"l")?;
                for item in items {
                    item.encode_to(w)?;
                }
                w.write_all(b"e")
            }
            Envelope::Dict(entries) => {
                w.write_all(b"d")?;
                for (key, value) in entries {
                    write!(w, "{}:", key.len())?;
                    w.write_all(key)?;
                    value.encode_to(w)?;
                }
                w.write_all(b"e")
            }
        }
    }

    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_to(&mut out)
            .unwrap_or_else(|_| unreachable!("Vec<u8> writes are infallible"));
        out
    }
}

/// Encode one envelope and flush the sink.
pub fn write_message<W: Write>(w: &mut W, value: &Envelope) -> Result<(), EnvelopeError> {
    value.encode_to(w)?;
    w.flush()?;
    Ok(())
}

/// Decode one envelope. Returns `Ok(None)` on a clean end of stream (no
/// bytes read); EOF inside a value is [`EnvelopeError::Truncated`].
pub fn read_message<R: Read>(r: &mut R) -> Result<Option<Envelope>, EnvelopeError> {
    match read_byte_opt(r)? {
        None => Ok(None),
        Some(first) => Ok(Some(parse_value(r, first)?)),
    }
}

/// Decode one envelope, treating end of stream as [`EnvelopeError::Truncated`].
pub fn decode<R: Read>(r: &mut R) -> Result<Envelope, EnvelopeError> {
    match read_message(r)? {
        Some(value) => Ok(value),
        None => Err(EnvelopeError::Truncated),
    }
}

fn read_byte_opt<R: Read>(r: &mut R) -> Result<Option<u8>, EnvelopeError> {
    let mut buf = [0u8; 1];
    loop {
        match r.read(&mut buf) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(buf[0])),
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(EnvelopeError::Io(err)),
        }
    }
}

fn read_byte<R: Read>(r: &mut R) -> Result<u8, EnvelopeError> {
    read_byte_opt(r)?.ok_or(EnvelopeError::Truncated)
}

fn parse_value<R: Read>(r: &mut R, first: u8) -> Result<Envelope, EnvelopeError> {
    match first {
        b'i' => parse_int(r),
        b'0'..=b'9' => parse_bytes(r, first),
        b'l' => {
            let mut items = Vec::new();
            loop {
                let b = read_byte(r)?;
                if b == b'e' {
                    return Ok(Envelope::List(items));
                }
                items.push(parse_value(r, b)?);
            }
        }
        b'd' => {
            let mut entries = BTreeMap::new();
            loop {
                let b = read_byte(r)?;
                if b == b'e' {
                    return Ok(Envelope::Dict(entries));
                }
                if !b.is_ascii_digit() {
                    return Err(EnvelopeError::Malformed(format!(
                        "dictionary key must be a byte string, got 0x{b:02x}"
                    )));
                }
                let key = match parse_bytes(r, b)? {
                    Envelope::Bytes(key) => key,
                    _ => unreachable!(),
                };
                let vb = read_byte(r)?;
                let value = parse_value(r, vb)?;
                entries.insert(key, value);
            }
        }
        other => Err(EnvelopeError::Malformed(format!(
            "unexpected byte 0x{other:02x} at value start"
        ))),
    }
}

fn parse_int<R: Read>(r: &mut R) -> Result<Envelope, EnvelopeError> {
    let mut digits = Vec::new();
    let mut negative = false;
    let mut b = read_byte(r)?;
    if b == b'-' {
        negative = true;
        b = read_byte(r)?;
    }
    loop {
        if b == b'e' {
            break;
        }
        if !b.is_ascii_digit() {
            return Err(EnvelopeError::Malformed(format!(
                "invalid integer byte 0x{b:02x}"
            )));
        }
        digits.push(b);
        b = read_byte(r)?;
    }
    if digits.is_empty() {
        return Err(EnvelopeError::Malformed("empty integer".to_string()));
    }
    if digits.len() > 1 && digits[0] == b'0' {
        return Err(EnvelopeError::Malformed(
            "integer has leading zero".to_string(),
        ));
    }
    if negative && digits == b"0" {
        return Err(EnvelopeError::Malformed("negative zero".to_string()));
    }
    let mut n: i64 = 0;
    for &d in &digits {
        let digit = i64::from(d - b'0');
        n = n
            .checked_mul(10)
            .and_then(|n| {
                if negative {
                    n.checked_sub(digit)
                } else {
                    n.checked_add(digit)
                }
            })
            .ok_or_else(|| {
                EnvelopeError::Malformed("integer outside 64-bit range".to_string())
            })?;
    }
    Ok(Envelope::Int(n))
}

fn parse_bytes<R: Read>(r: &mut R, first: u8) -> Result<Envelope, EnvelopeError> {
    let mut len: u64 = u64::from(first - b'0');
    loop {
        let b = read_byte(r)?;
        if b == b':' {
            break;
        }
        if !b.is_ascii_digit() {
            return Err(EnvelopeError::Malformed(format!(
                "invalid length byte 0x{b:02x}"
            )));
        }
        len = len
            .checked_mul(10)
            .and_then(|len| len.checked_add(u64::from(b - b'0')))
            .ok_or_else(|| EnvelopeError::Malformed("length overflow".to_string()))?;
        if len > MAX_BYTES_LEN {
            return Err(EnvelopeError::Malformed(format!(
                "byte string length {len} exceeds limit"
            )));
        }
    }
    let mut buf = vec![0u8; len as usize];
    let mut off = 0usize;
    while off < buf.len() {
        match r.read(&mut buf[off..]) {
            Ok(0) => return Err(EnvelopeError::Truncated),
            Ok(n) => off += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(EnvelopeError::Io(err)),
        }
    }
    Ok(Envelope::Bytes(buf))
}
