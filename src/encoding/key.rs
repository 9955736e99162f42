//! Order-preserving key encoding.
//!
//! A [`Key`] is an ordered sequence of typed segments encoded into a byte
//! string such that byte-wise comparison of two encoded keys matches the
//! intended multi-segment ordering. The B+-tree only ever compares raw
//! bytes; all type awareness lives here.
//!
//! # Encoding
//! Each segment is `[type byte][escaped payload][0x00]`. The terminator
//! byte 0x00 and the escape byte 0x01 never appear in payload position:
//! - payload 0x00 is written as `0x01 0x20`
//! - payload 0x01 is written as `0x01 0x21`
//!
//! Type bytes are ordered so segments of different types compare by type
//! first: null < false < true < int < float < string < bytes. Integers are
//! sign-flipped and big-endian; floats use the usual monotone bit trick.
//!
//! # Sentinels
//! The empty byte string is `BEFORE` and orders below every real key; the
//! single byte 0xFF is `AFTER` and orders above every real key (all type
//! bytes are below 0xFF).

use std::cmp::Ordering;
use std::fmt;

use crate::common::{Error, Result};

const TERMINATOR: u8 = 0x00;
const ESCAPE: u8 = 0x01;
const ESCAPED_ZERO: u8 = 0x20;
const ESCAPED_ONE: u8 = 0x21;

const TYPE_NULL: u8 = 0x02;
const TYPE_FALSE: u8 = 0x03;
const TYPE_TRUE: u8 = 0x04;
const TYPE_INT: u8 = 0x10;
const TYPE_FLOAT: u8 = 0x18;
const TYPE_STRING: u8 = 0x20;
const TYPE_BYTES: u8 = 0x28;

const AFTER_BYTE: u8 = 0xFF;

const SIGN_BIT: u64 = 1 << 63;

/// A decoded key segment.
#[derive(Debug, Clone, PartialEq)]
pub enum KeySegment {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
}

/// A compound, typed, order-preserving key.
///
/// # Example
/// ```
/// use foliodb::encoding::Key;
///
/// let mut a = Key::new();
/// a.append_int(5).append_str("alpha");
///
/// let mut b = Key::new();
/// b.append_int(5).append_str("beta");
///
/// assert!(a < b);
/// assert!(Key::before() < a);
/// assert!(b < Key::after());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Key {
    bytes: Vec<u8>,
}

impl Key {
    /// An empty key. Equal to [`Key::before`] until a segment is appended.
    pub fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    /// The sentinel ordering below all real keys.
    pub fn before() -> Self {
        Self { bytes: Vec::new() }
    }

    /// The sentinel ordering above all real keys.
    pub fn after() -> Self {
        Self {
            bytes: vec![AFTER_BYTE],
        }
    }

    /// Whether this key is the BEFORE sentinel (no segments).
    #[inline]
    pub fn is_before(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Whether this key is the AFTER sentinel.
    #[inline]
    pub fn is_after(&self) -> bool {
        self.bytes == [AFTER_BYTE]
    }

    /// Remove all segments, returning the key to the BEFORE state.
    pub fn clear(&mut self) -> &mut Self {
        self.bytes.clear();
        self
    }

    /// The encoded byte string.
    #[inline]
    pub fn encoded(&self) -> &[u8] {
        &self.bytes
    }

    /// Rebuild a key from its encoded form.
    ///
    /// The bytes are trusted; they must have been produced by this codec.
    pub fn from_encoded(bytes: &[u8]) -> Self {
        Self {
            bytes: bytes.to_vec(),
        }
    }

    /// Replace this key's content with another's.
    pub fn assign(&mut self, other: &Key) -> &mut Self {
        self.bytes.clear();
        self.bytes.extend_from_slice(&other.bytes);
        self
    }

    // ========================================================================
    // Segment appends
    // ========================================================================

    /// Append a null segment.
    pub fn append_null(&mut self) -> &mut Self {
        self.begin_segment(TYPE_NULL);
        self.bytes.push(TERMINATOR);
        self
    }

    /// Append a boolean segment. `false` orders below `true`.
    pub fn append_bool(&mut self, v: bool) -> &mut Self {
        self.begin_segment(if v { TYPE_TRUE } else { TYPE_FALSE });
        self.bytes.push(TERMINATOR);
        self
    }

    /// Append an integer segment. All integer widths share one encoding.
    pub fn append_int(&mut self, v: i64) -> &mut Self {
        self.begin_segment(TYPE_INT);
        let flipped = (v as u64) ^ SIGN_BIT;
        self.push_escaped(&flipped.to_be_bytes());
        self.bytes.push(TERMINATOR);
        self
    }

    /// Append a floating point segment.
    pub fn append_float(&mut self, v: f64) -> &mut Self {
        self.begin_segment(TYPE_FLOAT);
        let bits = v.to_bits();
        let monotone = if bits & SIGN_BIT != 0 { !bits } else { bits | SIGN_BIT };
        self.push_escaped(&monotone.to_be_bytes());
        self.bytes.push(TERMINATOR);
        self
    }

    /// Append a string segment.
    pub fn append_str(&mut self, v: &str) -> &mut Self {
        self.begin_segment(TYPE_STRING);
        self.push_escaped(v.as_bytes());
        self.bytes.push(TERMINATOR);
        self
    }

    /// Append a raw byte-array segment.
    pub fn append_bytes(&mut self, v: &[u8]) -> &mut Self {
        self.begin_segment(TYPE_BYTES);
        self.push_escaped(v);
        self.bytes.push(TERMINATOR);
        self
    }

    fn begin_segment(&mut self, type_byte: u8) {
        assert!(!self.is_after(), "cannot append a segment to the AFTER key");
        self.bytes.push(type_byte);
    }

    fn push_escaped(&mut self, payload: &[u8]) {
        for &b in payload {
            match b {
                TERMINATOR => {
                    self.bytes.push(ESCAPE);
                    self.bytes.push(ESCAPED_ZERO);
                }
                ESCAPE => {
                    self.bytes.push(ESCAPE);
                    self.bytes.push(ESCAPED_ONE);
                }
                _ => self.bytes.push(b),
            }
        }
    }

    // ========================================================================
    // Decoding
    // ========================================================================

    /// Decode the key back into typed segments.
    ///
    /// # Errors
    /// `InvalidKey` if the bytes are not a valid encoding (including the
    /// sentinels, which carry no segments).
    pub fn decode(&self) -> Result<Vec<KeySegment>> {
        if self.is_after() {
            return Err(Error::InvalidKey("AFTER sentinel has no segments".into()));
        }
        let mut segments = Vec::new();
        let mut pos = 0;
        while pos < self.bytes.len() {
            let type_byte = self.bytes[pos];
            pos += 1;
            let (payload, next) = unescape_until_terminator(&self.bytes, pos)?;
            pos = next;
            segments.push(decode_segment(type_byte, &payload)?);
        }
        Ok(segments)
    }

    /// Number of segments in the key.
    pub fn segment_count(&self) -> usize {
        let mut count = 0;
        let mut pos = 0;
        while pos < self.bytes.len() {
            pos += 1; // type byte
            while pos < self.bytes.len() && self.bytes[pos] != TERMINATOR {
                pos += if self.bytes[pos] == ESCAPE { 2 } else { 1 };
            }
            pos += 1; // terminator
            count += 1;
        }
        count
    }
}

fn unescape_until_terminator(bytes: &[u8], mut pos: usize) -> Result<(Vec<u8>, usize)> {
    let mut payload = Vec::new();
    while pos < bytes.len() {
        match bytes[pos] {
            TERMINATOR => return Ok((payload, pos + 1)),
            ESCAPE => {
                let code = *bytes
                    .get(pos + 1)
                    .ok_or_else(|| Error::InvalidKey("truncated escape".into()))?;
                payload.push(match code {
                    ESCAPED_ZERO => TERMINATOR,
                    ESCAPED_ONE => ESCAPE,
                    _ => return Err(Error::InvalidKey(format!("bad escape code {:#x}", code))),
                });
                pos += 2;
            }
            b => {
                payload.push(b);
                pos += 1;
            }
        }
    }
    Err(Error::InvalidKey("unterminated segment".into()))
}

fn decode_segment(type_byte: u8, payload: &[u8]) -> Result<KeySegment> {
    match type_byte {
        TYPE_NULL => Ok(KeySegment::Null),
        TYPE_FALSE => Ok(KeySegment::Bool(false)),
        TYPE_TRUE => Ok(KeySegment::Bool(true)),
        TYPE_INT => {
            let arr: [u8; 8] = payload
                .try_into()
                .map_err(|_| Error::InvalidKey("int segment is not 8 bytes".into()))?;
            Ok(KeySegment::Int((u64::from_be_bytes(arr) ^ SIGN_BIT) as i64))
        }
        TYPE_FLOAT => {
            let arr: [u8; 8] = payload
                .try_into()
                .map_err(|_| Error::InvalidKey("float segment is not 8 bytes".into()))?;
            let monotone = u64::from_be_bytes(arr);
            let bits = if monotone & SIGN_BIT != 0 {
                monotone & !SIGN_BIT
            } else {
                !monotone
            };
            Ok(KeySegment::Float(f64::from_bits(bits)))
        }
        TYPE_STRING => Ok(KeySegment::Str(
            String::from_utf8(payload.to_vec())
                .map_err(|_| Error::InvalidKey("string segment is not UTF-8".into()))?,
        )),
        TYPE_BYTES => Ok(KeySegment::Bytes(payload.to_vec())),
        other => Err(Error::InvalidKey(format!("unknown type byte {:#x}", other))),
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.bytes.cmp(&other.bytes)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_before() {
            return write!(f, "{{BEFORE}}");
        }
        if self.is_after() {
            return write!(f, "{{AFTER}}");
        }
        write!(f, "{{")?;
        match self.decode() {
            Ok(segments) => {
                for (i, seg) in segments.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    match seg {
                        KeySegment::Null => write!(f, "null")?,
                        KeySegment::Bool(b) => write!(f, "{}", b)?,
                        KeySegment::Int(v) => write!(f, "{}", v)?,
                        KeySegment::Float(v) => write!(f, "{}", v)?,
                        KeySegment::Str(s) => write!(f, "{:?}", s)?,
                        KeySegment::Bytes(b) => write!(f, "{:02x?}", b)?,
                    }
                }
            }
            Err(_) => write!(f, "<invalid>")?,
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_int(v: i64) -> Key {
        let mut k = Key::new();
        k.append_int(v);
        k
    }

    fn key_float(v: f64) -> Key {
        let mut k = Key::new();
        k.append_float(v);
        k
    }

    #[test]
    fn test_sentinel_ordering() {
        let mut k = Key::new();
        k.append_int(i64::MIN);
        assert!(Key::before() < k);
        assert!(k < Key::after());

        let mut max = Key::new();
        max.append_bytes(&[0xFF; 32]);
        assert!(max < Key::after());
    }

    #[test]
    fn test_int_ordering() {
        let values = [i64::MIN, -1_000_000, -1, 0, 1, 42, 1_000_000, i64::MAX];
        for w in values.windows(2) {
            assert!(
                key_int(w[0]) < key_int(w[1]),
                "{} should order below {}",
                w[0],
                w[1]
            );
        }
    }

    #[test]
    fn test_float_ordering() {
        let values = [
            f64::NEG_INFINITY,
            -1e300,
            -1.5,
            -0.0,
            0.0,
            1e-300,
            1.5,
            1e300,
            f64::INFINITY,
        ];
        for w in values.windows(2) {
            assert!(
                key_float(w[0]) <= key_float(w[1]),
                "{} should not order above {}",
                w[0],
                w[1]
            );
        }
    }

    #[test]
    fn test_string_ordering() {
        let mut a = Key::new();
        a.append_str("apple");
        let mut b = Key::new();
        b.append_str("banana");
        let mut prefix = Key::new();
        prefix.append_str("app");

        assert!(a < b);
        assert!(prefix < a);
    }

    #[test]
    fn test_multi_segment_ordering() {
        // (5, "z") < (6, "a"): first segment dominates
        let mut a = Key::new();
        a.append_int(5).append_str("z");
        let mut b = Key::new();
        b.append_int(6).append_str("a");
        assert!(a < b);

        // (5) < (5, "a"): prefix orders first
        let mut c = Key::new();
        c.append_int(5);
        let mut d = Key::new();
        d.append_int(5).append_str("a");
        assert!(c < d);
    }

    #[test]
    fn test_type_ordering() {
        let mut null = Key::new();
        null.append_null();
        let mut f = Key::new();
        f.append_bool(false);
        let mut t = Key::new();
        t.append_bool(true);
        let int = key_int(i64::MIN);
        let mut s = Key::new();
        s.append_str("");
        let mut b = Key::new();
        b.append_bytes(&[]);

        assert!(null < f);
        assert!(f < t);
        assert!(t < int);
        assert!(key_int(i64::MAX) < key_float(f64::NEG_INFINITY));
        assert!(key_float(f64::INFINITY) < s);
        assert!(s < b);
    }

    #[test]
    fn test_reserved_bytes_escaped() {
        // Bytes 0x00 and 0x01 in payload must not break segment boundaries.
        let mut a = Key::new();
        a.append_bytes(&[0x00]);
        let mut b = Key::new();
        b.append_bytes(&[0x01]);
        let mut c = Key::new();
        c.append_bytes(&[0x02]);
        assert!(a < b);
        assert!(b < c);

        assert_eq!(a.segment_count(), 1);
        assert_eq!(
            a.decode().unwrap(),
            vec![KeySegment::Bytes(vec![0x00])]
        );
    }

    #[test]
    fn test_decode_roundtrip() {
        let mut k = Key::new();
        k.append_null()
            .append_bool(true)
            .append_int(-42)
            .append_float(3.25)
            .append_str("fox\0hole")
            .append_bytes(&[1, 0, 255]);

        let segments = k.decode().unwrap();
        assert_eq!(
            segments,
            vec![
                KeySegment::Null,
                KeySegment::Bool(true),
                KeySegment::Int(-42),
                KeySegment::Float(3.25),
                KeySegment::Str("fox\0hole".to_string()),
                KeySegment::Bytes(vec![1, 0, 255]),
            ]
        );
        assert_eq!(k.segment_count(), 6);
    }

    #[test]
    fn test_clear_returns_to_before() {
        let mut k = Key::new();
        k.append_int(1);
        assert!(!k.is_before());
        k.clear();
        assert!(k.is_before());
    }

    #[test]
    fn test_display() {
        let mut k = Key::new();
        k.append_int(7).append_str("red");
        assert_eq!(format!("{}", k), "{7,\"red\"}");
        assert_eq!(format!("{}", Key::before()), "{BEFORE}");
        assert_eq!(format!("{}", Key::after()), "{AFTER}");
    }
}
