//! Binary register codec.
//!
//! A register block is a run of 16-bit words, each transmitted high byte
//! first. The codec concatenates the words into one byte sequence and walks
//! it with a static [`RegisterLayout`], producing a [`Record`] of named,
//! scaled values.

use std::fmt;

use serde::Serialize;
use thiserror::Error;

/// Errors raised while decoding a register block.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("register block too short: layout needs {required} bytes, got {available}")]
    Truncated { required: usize, available: usize },

    #[error("layout seeks backwards from byte {from} to byte {to}")]
    BackwardSeek { from: usize, to: usize },

    #[error("field '{field}' does not hold ASCII text")]
    InvalidText { field: &'static str },

    #[error("identification block has no usable '{field}'")]
    MissingSerial { field: &'static str },
}

/// Errors raised while encoding values back into registers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("value for '{field}' does not fit its encoding")]
    OutOfRange { field: &'static str },

    #[error("value for '{field}' has the wrong type")]
    TypeMismatch { field: &'static str },

    #[error("'{field}' has no sentinel, null cannot be encoded")]
    NoSentinel { field: &'static str },

    #[error(transparent)]
    Layout(#[from] DecodeError),
}

/// A decoded field value.
///
/// Serializes as a bare scalar, so [`Value::Null`] becomes `null` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Integer(i64),
    Unsigned(u64),
    Float(f64),
    Text(String),
    Null,
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(v) => Some(*v as f64),
            Value::Unsigned(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Text(_) | Value::Null => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Integer(v) => write!(f, "{}", v),
            Value::Unsigned(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(v) => f.write_str(v),
            Value::Null => f.write_str("null"),
        }
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Unsigned(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

/// Rational scale factor applied to raw integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scale {
    numerator: i64,
    denominator: i64,
}

impl Scale {
    pub const IDENTITY: Scale = Scale {
        numerator: 1,
        denominator: 1,
    };

    pub const fn new(numerator: i64, denominator: i64) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.numerator == self.denominator
    }

    fn apply(&self, raw: f64) -> f64 {
        raw * self.numerator as f64 / self.denominator as f64
    }

    fn invert(&self, value: f64) -> f64 {
        value * self.denominator as f64 / self.numerator as f64
    }
}

/// How a raw all-max value is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentinel {
    /// Every raw value is data.
    None,
    /// The largest representable raw value means "not available".
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Unsigned(usize),
    Signed(usize),
    Float32,
    Text(usize),
}

/// Encoding of one physical quantity inside a register block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    name: &'static str,
    encoding: Encoding,
    scale: Scale,
    sentinel: Sentinel,
}

impl FieldSpec {
    const fn new(name: &'static str, encoding: Encoding) -> Self {
        Self {
            name,
            encoding,
            scale: Scale::IDENTITY,
            sentinel: Sentinel::None,
        }
    }

    pub const fn u8(name: &'static str) -> Self {
        Self::new(name, Encoding::Unsigned(1))
    }

    pub const fn u16(name: &'static str) -> Self {
        Self::new(name, Encoding::Unsigned(2))
    }

    pub const fn u32(name: &'static str) -> Self {
        Self::new(name, Encoding::Unsigned(4))
    }

    pub const fn u64(name: &'static str) -> Self {
        Self::new(name, Encoding::Unsigned(8))
    }

    pub const fn i8(name: &'static str) -> Self {
        Self::new(name, Encoding::Signed(1))
    }

    pub const fn i16(name: &'static str) -> Self {
        Self::new(name, Encoding::Signed(2))
    }

    pub const fn i32(name: &'static str) -> Self {
        Self::new(name, Encoding::Signed(4))
    }

    pub const fn i64(name: &'static str) -> Self {
        Self::new(name, Encoding::Signed(8))
    }

    /// IEEE-754 single precision, big-endian.
    pub const fn f32(name: &'static str) -> Self {
        Self::new(name, Encoding::Float32)
    }

    /// Fixed-width ASCII text padded with NUL or space bytes.
    pub const fn text(name: &'static str, len: usize) -> Self {
        Self::new(name, Encoding::Text(len))
    }

    /// Multiply decoded values by `numerator / denominator`.
    pub const fn scaled(mut self, numerator: i64, denominator: i64) -> Self {
        self.scale = Scale::new(numerator, denominator);
        self
    }

    /// Reserve the maximum raw value as "not available".
    pub const fn with_sentinel(mut self) -> Self {
        self.sentinel = Sentinel::Max;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn scale(&self) -> Scale {
        self.scale
    }

    pub fn sentinel(&self) -> Sentinel {
        self.sentinel
    }

    /// Number of bytes the field occupies.
    pub const fn width(&self) -> usize {
        match self.encoding {
            Encoding::Unsigned(w) | Encoding::Signed(w) | Encoding::Text(w) => w,
            Encoding::Float32 => 4,
        }
    }

    /// Raw sentinel for integer fields that reserve one.
    pub fn sentinel_raw(&self) -> Option<u64> {
        if self.sentinel != Sentinel::Max {
            return None;
        }
        match self.encoding {
            Encoding::Unsigned(w) => Some(u64::MAX >> (64 - 8 * w)),
            Encoding::Signed(w) => Some((1u64 << (8 * w - 1)) - 1),
            Encoding::Float32 | Encoding::Text(_) => None,
        }
    }

    /// Decode exactly [`width`](Self::width) bytes.
    pub fn decode(&self, bytes: &[u8]) -> Result<Value, DecodeError> {
        if bytes.len() < self.width() {
            return Err(DecodeError::Truncated {
                required: self.width(),
                available: bytes.len(),
            });
        }
        let bytes = &bytes[..self.width()];

        match self.encoding {
            Encoding::Unsigned(_) => {
                let raw = read_be(bytes);
                if Some(raw) == self.sentinel_raw() {
                    return Ok(Value::Null);
                }
                Ok(self.scale_integer(Value::Unsigned(raw), raw as f64))
            }
            Encoding::Signed(w) => {
                let raw = read_be(bytes);
                if Some(raw) == self.sentinel_raw() {
                    return Ok(Value::Null);
                }
                let shift = 64 - 8 * w;
                let signed = ((raw << shift) as i64) >> shift;
                Ok(self.scale_integer(Value::Integer(signed), signed as f64))
            }
            Encoding::Float32 => {
                let value = f32::from_bits(read_be(bytes) as u32) as f64;
                if self.scale.is_identity() {
                    Ok(Value::Float(value))
                } else {
                    Ok(Value::Float(self.scale.apply(value)))
                }
            }
            Encoding::Text(_) => {
                let end = bytes
                    .iter()
                    .rposition(|b| *b != 0 && *b != b' ')
                    .map_or(0, |i| i + 1);
                let trimmed = &bytes[..end];
                if !trimmed.is_ascii() {
                    return Err(DecodeError::InvalidText { field: self.name });
                }
                Ok(Value::Text(String::from_utf8_lossy(trimmed).into_owned()))
            }
        }
    }

    fn scale_integer(&self, exact: Value, raw: f64) -> Value {
        if self.scale.is_identity() {
            exact
        } else {
            Value::Float(self.scale.apply(raw))
        }
    }

    /// Encode a value into [`width`](Self::width) big-endian bytes.
    ///
    /// Null maps to the sentinel; numbers map to `round(value / scale)`.
    pub fn encode(&self, value: &Value) -> Result<Vec<u8>, EncodeError> {
        let field = self.name;
        let width = self.width();

        match (self.encoding, value) {
            (Encoding::Text(_), Value::Text(text)) => {
                if !text.is_ascii() || text.len() > width {
                    return Err(EncodeError::OutOfRange { field });
                }
                let mut bytes = text.as_bytes().to_vec();
                bytes.resize(width, 0);
                Ok(bytes)
            }
            (Encoding::Text(_), _) => Err(EncodeError::TypeMismatch { field }),
            (_, Value::Text(_)) => Err(EncodeError::TypeMismatch { field }),
            (Encoding::Float32, Value::Null) => Err(EncodeError::NoSentinel { field }),
            (Encoding::Float32, v) => {
                let v = v.as_f64().ok_or(EncodeError::TypeMismatch { field })?;
                Ok((self.scale.invert(v) as f32).to_bits().to_be_bytes().to_vec())
            }
            (_, Value::Null) => {
                let raw = self.sentinel_raw().ok_or(EncodeError::NoSentinel { field })?;
                Ok(write_be(raw, width))
            }
            (Encoding::Unsigned(_), v) => {
                let raw = self.unsigned_raw(v)?;
                Ok(write_be(raw, width))
            }
            (Encoding::Signed(w), v) => {
                let raw = self.signed_raw(v, w)?;
                Ok(write_be(raw as u64, width))
            }
        }
    }

    fn unsigned_raw(&self, value: &Value) -> Result<u64, EncodeError> {
        let field = self.name;
        let max = u64::MAX >> (64 - 8 * self.width());

        let raw = match value {
            Value::Unsigned(v) if self.scale.is_identity() => *v,
            Value::Integer(v) if self.scale.is_identity() => {
                u64::try_from(*v).map_err(|_| EncodeError::OutOfRange { field })?
            }
            v => {
                let scaled = self
                    .scale
                    .invert(v.as_f64().ok_or(EncodeError::TypeMismatch { field })?)
                    .round();
                if !(0.0..=max as f64).contains(&scaled) {
                    return Err(EncodeError::OutOfRange { field });
                }
                scaled as u64
            }
        };

        if raw > max || Some(raw) == self.sentinel_raw() {
            return Err(EncodeError::OutOfRange { field });
        }
        Ok(raw)
    }

    fn signed_raw(&self, value: &Value, width: usize) -> Result<i64, EncodeError> {
        let field = self.name;
        let max = ((1u64 << (8 * width - 1)) - 1) as i64;
        let min = -max - 1;

        let raw = match value {
            Value::Integer(v) if self.scale.is_identity() => *v,
            Value::Unsigned(v) if self.scale.is_identity() => {
                i64::try_from(*v).map_err(|_| EncodeError::OutOfRange { field })?
            }
            v => {
                let scaled = self
                    .scale
                    .invert(v.as_f64().ok_or(EncodeError::TypeMismatch { field })?)
                    .round();
                if !(min as f64..=max as f64).contains(&scaled) {
                    return Err(EncodeError::OutOfRange { field });
                }
                scaled as i64
            }
        };

        if raw < min || raw > max || Some(raw as u64) == self.sentinel_raw() {
            return Err(EncodeError::OutOfRange { field });
        }
        Ok(raw)
    }
}

fn read_be(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

fn write_be(raw: u64, width: usize) -> Vec<u8> {
    raw.to_be_bytes()[8 - width..].to_vec()
}

/// One step of a register layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Item {
    Field(FieldSpec),
    /// Skip a fixed number of bytes.
    Padding(usize),
    /// Jump forward to an absolute byte offset.
    Seek(usize),
}

/// Binary shape of one register block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterLayout {
    items: &'static [Item],
}

impl RegisterLayout {
    pub const fn new(items: &'static [Item]) -> Self {
        Self { items }
    }

    pub fn items(&self) -> &'static [Item] {
        self.items
    }

    pub fn fields(&self) -> impl Iterator<Item = &'static FieldSpec> {
        self.items.iter().filter_map(|item| match item {
            Item::Field(spec) => Some(spec),
            _ => None,
        })
    }

    /// Number of bytes a register block must provide.
    pub fn byte_len(&self) -> Result<usize, DecodeError> {
        let mut cursor = 0;
        for item in self.items {
            cursor = match *item {
                Item::Field(spec) => cursor + spec.width(),
                Item::Padding(n) => cursor + n,
                Item::Seek(to) if to < cursor => {
                    return Err(DecodeError::BackwardSeek { from: cursor, to });
                }
                Item::Seek(to) => to,
            };
        }
        Ok(cursor)
    }

    /// Number of 16-bit registers covering [`byte_len`](Self::byte_len).
    pub fn register_count(&self) -> Result<u16, DecodeError> {
        let words = self.byte_len()?.div_ceil(2);
        Ok(u16::try_from(words).unwrap_or(u16::MAX))
    }

    /// Decode a raw register block.
    pub fn decode(&self, registers: &[u16]) -> Result<Record, DecodeError> {
        let required = self.byte_len()?;
        let bytes = registers_to_bytes(registers);
        if bytes.len() < required {
            return Err(DecodeError::Truncated {
                required,
                available: bytes.len(),
            });
        }

        let mut record = Record::default();
        let mut cursor = 0;
        for item in self.items {
            match *item {
                Item::Field(spec) => {
                    let end = cursor + spec.width();
                    record.insert(spec.name, spec.decode(&bytes[cursor..end])?);
                    cursor = end;
                }
                Item::Padding(n) => cursor += n,
                Item::Seek(to) => cursor = to,
            }
        }
        Ok(record)
    }

    /// Encode a record back into registers.
    ///
    /// Fields missing from the record become their sentinel, or zero when
    /// they have none. Skipped bytes are zero.
    pub fn encode(&self, record: &Record) -> Result<Vec<u16>, EncodeError> {
        let mut bytes = vec![0u8; self.byte_len()?];
        let mut cursor = 0;
        for item in self.items {
            match *item {
                Item::Field(spec) => {
                    let end = cursor + spec.width();
                    match record.get(spec.name) {
                        Some(value) => bytes[cursor..end].copy_from_slice(&spec.encode(value)?),
                        None => {
                            if let Some(raw) = spec.sentinel_raw() {
                                bytes[cursor..end].copy_from_slice(&write_be(raw, spec.width()));
                            }
                        }
                    }
                    cursor = end;
                }
                Item::Padding(n) => cursor += n,
                Item::Seek(to) => cursor = to,
            }
        }
        Ok(bytes_to_registers(&bytes))
    }
}

/// Flatten registers into bytes, high byte first.
pub fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
    registers.iter().flat_map(|r| r.to_be_bytes()).collect()
}

/// Pack bytes into registers, zero-padding an odd trailing byte.
pub fn bytes_to_registers(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair.get(1).copied().unwrap_or(0)]))
        .collect()
}

/// Named values decoded from one register block, in layout order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    values: Vec<(&'static str, Value)>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value, replacing any previous value of the same name.
    pub fn insert(&mut self, name: &'static str, value: Value) {
        match self.values.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.values.push((name, value)),
        }
    }

    pub fn with(mut self, name: &'static str, value: impl Into<Value>) -> Self {
        self.insert(name, value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Value)> {
        self.values.iter().map(|(n, v)| (*n, v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
