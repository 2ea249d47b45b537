//! Value decoders and the value post-filter (external collaborators, §1,
//! §6): interfaces only. This crate never encodes or validates payload
//! bytes itself — it hands payload slices to whatever `BlockDecoder` the
//! caller supplies and otherwise treats blocks as opaque.

use crate::error::Result;

/// Designates a block encodes float64 values.
pub const BLOCK_FLOAT64: u8 = 0;
/// Designates a block encodes int64 values.
pub const BLOCK_INTEGER: u8 = 1;
/// Designates a block encodes boolean values.
pub const BLOCK_BOOLEAN: u8 = 2;
/// Designates a block encodes string values.
pub const BLOCK_STRING: u8 = 3;

/// One decoded `(timestamp, value)` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Point<T> {
    pub timestamp: i64,
    pub value: T,
}

impl<T> Point<T> {
    pub fn new(timestamp: i64, value: T) -> Self {
        Self { timestamp, value }
    }
}

pub type FloatValues = Vec<Point<f64>>;
pub type IntegerValues = Vec<Point<i64>>;
pub type StringValues = Vec<Point<Vec<u8>>>;
pub type BooleanValues = Vec<Point<bool>>;

/// A decoded, typed run of values for one block. The generic counterpart
/// of the four typed read paths (§9's "typed decode paths" design note).
#[derive(Debug, Clone)]
pub enum Values {
    Float(FloatValues),
    Integer(IntegerValues),
    String(StringValues),
    Boolean(BooleanValues),
}

impl Values {
    pub fn block_type(&self) -> u8 {
        match self {
            Values::Float(_) => BLOCK_FLOAT64,
            Values::Integer(_) => BLOCK_INTEGER,
            Values::String(_) => BLOCK_STRING,
            Values::Boolean(_) => BLOCK_BOOLEAN,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Values::Float(v) => v.len(),
            Values::Integer(v) => v.len(),
            Values::String(v) => v.len(),
            Values::Boolean(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn extend(&mut self, other: Values) {
        match (self, other) {
            (Values::Float(a), Values::Float(b)) => a.extend(b),
            (Values::Integer(a), Values::Integer(b)) => a.extend(b),
            (Values::String(a), Values::String(b)) => a.extend(b),
            (Values::Boolean(a), Values::Boolean(b)) => a.extend(b),
            _ => {}
        }
    }

    pub(crate) fn empty_like(block_type: u8) -> Values {
        match block_type {
            BLOCK_FLOAT64 => Values::Float(Vec::new()),
            BLOCK_INTEGER => Values::Integer(Vec::new()),
            BLOCK_STRING => Values::String(Vec::new()),
            BLOCK_BOOLEAN => Values::Boolean(Vec::new()),
            _ => Values::Float(Vec::new()),
        }
    }
}

/// Given a decoded value sequence and a time range, excludes values whose
/// timestamp falls within `[range.min, range.max]`. Used to resolve partial
/// tombstone overlaps after a block has been decoded.
pub fn exclude_time_range(values: &mut Values, range: crate::index::TimeRange) {
    match values {
        Values::Float(v) => v.retain(|p| !range.contains(p.timestamp)),
        Values::Integer(v) => v.retain(|p| !range.contains(p.timestamp)),
        Values::String(v) => v.retain(|p| !range.contains(p.timestamp)),
        Values::Boolean(v) => v.retain(|p| !range.contains(p.timestamp)),
    }
}

/// Decodes block payloads into typed or generic value buffers. The writer
/// side of a TSF (and the specific encoding used per block) is out of
/// scope; implementations of this trait are the only thing that needs to
/// know about it.
pub trait BlockDecoder: Send + Sync {
    fn decode_float_block(&self, payload: &[u8], out: &mut FloatValues) -> Result<()>;
    fn decode_integer_block(&self, payload: &[u8], out: &mut IntegerValues) -> Result<()>;
    fn decode_string_block(&self, payload: &[u8], out: &mut StringValues) -> Result<()>;
    fn decode_boolean_block(&self, payload: &[u8], out: &mut BooleanValues) -> Result<()>;

    /// Decodes a payload of the given block type into a generic `Values`
    /// buffer, allocating the variant matching `block_type` if `out` is
    /// `None`.
    fn decode_block(&self, block_type: u8, payload: &[u8], out: &mut Option<Values>) -> Result<()> {
        let mut values = out.take().unwrap_or_else(|| Values::empty_like(block_type));
        match &mut values {
            Values::Float(v) => self.decode_float_block(payload, v)?,
            Values::Integer(v) => self.decode_integer_block(payload, v)?,
            Values::String(v) => self.decode_string_block(payload, v)?,
            Values::Boolean(v) => self.decode_boolean_block(payload, v)?,
        }
        *out = Some(values);
        Ok(())
    }
}
