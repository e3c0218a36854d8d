//! # Wire Encoding
//!
//! Value slots and envelopes exchanged through the shared serialization
//! buffer between a compiled module and its host.
//!
//! ## Slot layout
//!
//! ```text
//! [tag:u32][pad:u32][bits:u64]          16 bytes, little endian
//! ```
//!
//! ## Envelopes
//!
//! | Leg | Layout |
//! |-----|--------|
//! | call arguments | `[argCount:u32][pad:u32]` then `argCount` slots |
//! | value result | one slot at offset 0 |
//! | effect request | 32-byte header then `argCount` slots |
//! | resume value | one slot at offset 0 |
//!
//! Effect header:
//!
//! ```text
//! [opIndex:u32][opId:u32][effectIdHash:u64][resumeKind:u32][handle:u32][argCount:u32][pad:u32]
//! ```
//!
//! ## Memory layout
//!
//! The operation-handle table (one `u32` per operation ordinal) sits at
//! address 0. The buffer starts at the next 16-byte boundary, and a scratch
//! area for effect arguments follows the buffer. See [`BufferLayout`].

use std::fmt;

use thiserror::Error;

/// Minimum size of the shared serialization buffer.
pub const MIN_BUFFER_SIZE: usize = 4096;
/// Size of one encoded value slot.
pub const SLOT_SIZE: usize = 16;
/// Size of the call-arguments header.
pub const ARGS_HEADER_SIZE: usize = 8;
/// Size of the effect-request header.
pub const EFFECT_HEADER_SIZE: usize = 32;
/// Largest argument count the scratch area is sized for.
pub const MAX_WIRE_ARGS: usize = 16;

/// Discriminant of an encoded value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ValueTag {
    /// No value (unit).
    None = 0,
    /// 32-bit integer (also booleans).
    I32 = 1,
    /// 64-bit integer.
    I64 = 2,
    /// 32-bit float.
    F32 = 3,
    /// 64-bit float.
    F64 = 4,
}

impl ValueTag {
    /// The wire encoding of this tag.
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Decode a wire tag.
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(ValueTag::None),
            1 => Some(ValueTag::I32),
            2 => Some(ValueTag::I64),
            3 => Some(ValueTag::F32),
            4 => Some(ValueTag::F64),
            _ => None,
        }
    }
}

impl fmt::Display for ValueTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ValueTag::None => "none",
            ValueTag::I32 => "i32",
            ValueTag::I64 => "i64",
            ValueTag::F32 => "f32",
            ValueTag::F64 => "f64",
        };
        f.write_str(s)
    }
}

/// A value that can cross the host boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WireValue {
    /// Unit.
    None,
    /// 32-bit integer.
    I32(i32),
    /// 64-bit integer.
    I64(i64),
    /// 32-bit float.
    F32(f32),
    /// 64-bit float.
    F64(f64),
}

impl WireValue {
    /// The tag of this value.
    pub fn tag(&self) -> ValueTag {
        match self {
            WireValue::None => ValueTag::None,
            WireValue::I32(_) => ValueTag::I32,
            WireValue::I64(_) => ValueTag::I64,
            WireValue::F32(_) => ValueTag::F32,
            WireValue::F64(_) => ValueTag::F64,
        }
    }

    /// The raw 64-bit payload of this value.
    pub fn to_bits(&self) -> u64 {
        match *self {
            WireValue::None => 0,
            WireValue::I32(v) => v as u32 as u64,
            WireValue::I64(v) => v as u64,
            WireValue::F32(v) => v.to_bits() as u64,
            WireValue::F64(v) => v.to_bits(),
        }
    }

    /// Rebuild a value from its tag and raw payload.
    pub fn from_bits(tag: ValueTag, bits: u64) -> Self {
        match tag {
            ValueTag::None => WireValue::None,
            ValueTag::I32 => WireValue::I32(bits as u32 as i32),
            ValueTag::I64 => WireValue::I64(bits as i64),
            ValueTag::F32 => WireValue::F32(f32::from_bits(bits as u32)),
            ValueTag::F64 => WireValue::F64(f64::from_bits(bits)),
        }
    }

    /// The value as an `i32`, if it is one.
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            WireValue::I32(v) => Some(*v),
            _ => None,
        }
    }

    /// The value as an `i64`, if it is one.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            WireValue::I64(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for WireValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WireValue::None => f.write_str("()"),
            WireValue::I32(v) => write!(f, "{v}i32"),
            WireValue::I64(v) => write!(f, "{v}i64"),
            WireValue::F32(v) => write!(f, "{v}f32"),
            WireValue::F64(v) => write!(f, "{v}f64"),
        }
    }
}

/// Errors raised while encoding or decoding envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// The destination buffer cannot hold the payload.
    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall {
        /// Bytes required.
        needed: usize,
        /// Bytes available.
        available: usize,
    },
    /// A slot carries a tag this boundary does not know.
    #[error("unknown value tag {0}")]
    UnknownTag(u32),
    /// A slot carries a different tag than the reader expected.
    #[error("value tag mismatch: expected {expected}, found {found}")]
    TagMismatch {
        /// Tag the reader asked for.
        expected: ValueTag,
        /// Tag found in the slot.
        found: ValueTag,
    },
    /// The argument count exceeds what the scratch area can hold.
    #[error("too many arguments: {0} (limit 16)")]
    TooManyArgs(usize),
}

fn ensure(buf: &[u8], needed: usize) -> Result<(), WireError> {
    if buf.len() < needed {
        Err(WireError::BufferTooSmall {
            needed,
            available: buf.len(),
        })
    } else {
        Ok(())
    }
}

fn put_u32(buf: &mut [u8], at: usize, v: u32) {
    buf[at..at + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut [u8], at: usize, v: u64) {
    buf[at..at + 8].copy_from_slice(&v.to_le_bytes());
}

/// Read a little-endian `u32` at `at`. The caller guarantees bounds.
pub fn get_u32(buf: &[u8], at: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(bytes)
}

fn get_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(bytes)
}

/// Encode one slot at the start of `buf`.
pub fn write_slot(buf: &mut [u8], value: WireValue) -> Result<(), WireError> {
    write_raw_slot(buf, value.tag(), value.to_bits())
}

/// Encode one slot from a tag and raw bits.
pub fn write_raw_slot(buf: &mut [u8], tag: ValueTag, bits: u64) -> Result<(), WireError> {
    ensure(buf, SLOT_SIZE)?;
    put_u32(buf, 0, tag.as_u32());
    put_u32(buf, 4, 0);
    put_u64(buf, 8, bits);
    Ok(())
}

/// Decode one slot at the start of `buf`.
pub fn read_slot(buf: &[u8]) -> Result<WireValue, WireError> {
    ensure(buf, SLOT_SIZE)?;
    let raw = get_u32(buf, 0);
    let tag = ValueTag::from_u32(raw).ok_or(WireError::UnknownTag(raw))?;
    Ok(WireValue::from_bits(tag, get_u64(buf, 8)))
}

/// Decode one slot, insisting on a particular tag. Returns the raw bits.
pub fn read_slot_expecting(buf: &[u8], expected: ValueTag) -> Result<u64, WireError> {
    let value = read_slot(buf)?;
    if value.tag() != expected {
        return Err(WireError::TagMismatch {
            expected,
            found: value.tag(),
        });
    }
    Ok(value.to_bits())
}

/// Byte offset of argument slot `index` within a call-arguments envelope.
pub fn arg_slot_offset(index: usize) -> usize {
    ARGS_HEADER_SIZE + index * SLOT_SIZE
}

/// Encode a call-arguments envelope. Returns the number of bytes written.
pub fn encode_args(buf: &mut [u8], args: &[WireValue]) -> Result<usize, WireError> {
    if args.len() > MAX_WIRE_ARGS {
        return Err(WireError::TooManyArgs(args.len()));
    }
    let needed = arg_slot_offset(args.len());
    ensure(buf, needed)?;
    put_u32(buf, 0, args.len() as u32);
    put_u32(buf, 4, 0);
    for (i, arg) in args.iter().enumerate() {
        let at = arg_slot_offset(i);
        write_slot(&mut buf[at..], *arg)?;
    }
    Ok(needed)
}

/// Decode a call-arguments envelope.
pub fn decode_args(buf: &[u8]) -> Result<Vec<WireValue>, WireError> {
    ensure(buf, ARGS_HEADER_SIZE)?;
    let count = get_u32(buf, 0) as usize;
    if count > MAX_WIRE_ARGS {
        return Err(WireError::TooManyArgs(count));
    }
    ensure(buf, arg_slot_offset(count))?;
    (0..count).map(|i| read_slot(&buf[arg_slot_offset(i)..])).collect()
}

/// A decoded effect-request envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectEnvelope {
    /// Operation ordinal in the effect table.
    pub op_index: u32,
    /// Operation index within its effect.
    pub op_id: u32,
    /// Hash of the owning effect.
    pub effect_id: u64,
    /// Raw resume kind.
    pub resume_kind: u32,
    /// Host-assigned handle read from the handle table.
    pub handle: u32,
    /// Operation arguments.
    pub args: Vec<WireValue>,
}

impl EffectEnvelope {
    /// Bytes needed to encode this envelope.
    pub fn encoded_len(&self) -> usize {
        EFFECT_HEADER_SIZE + self.args.len() * SLOT_SIZE
    }

    /// Encode at the start of `buf`. Returns the number of bytes written.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, WireError> {
        if self.args.len() > MAX_WIRE_ARGS {
            return Err(WireError::TooManyArgs(self.args.len()));
        }
        let needed = self.encoded_len();
        ensure(buf, needed)?;
        put_u32(buf, 0, self.op_index);
        put_u32(buf, 4, self.op_id);
        put_u64(buf, 8, self.effect_id);
        put_u32(buf, 16, self.resume_kind);
        put_u32(buf, 20, self.handle);
        put_u32(buf, 24, self.args.len() as u32);
        put_u32(buf, 28, 0);
        for (i, arg) in self.args.iter().enumerate() {
            write_slot(&mut buf[EFFECT_HEADER_SIZE + i * SLOT_SIZE..], *arg)?;
        }
        Ok(needed)
    }

    /// Decode from the start of `buf`.
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        ensure(buf, EFFECT_HEADER_SIZE)?;
        let count = get_u32(buf, 24) as usize;
        if count > MAX_WIRE_ARGS {
            return Err(WireError::TooManyArgs(count));
        }
        ensure(buf, EFFECT_HEADER_SIZE + count * SLOT_SIZE)?;
        let args = (0..count)
            .map(|i| read_slot(&buf[EFFECT_HEADER_SIZE + i * SLOT_SIZE..]))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            op_index: get_u32(buf, 0),
            op_id: get_u32(buf, 4),
            effect_id: get_u64(buf, 8),
            resume_kind: get_u32(buf, 16),
            handle: get_u32(buf, 20),
            args,
        })
    }
}

/// Placement of the handle table, buffer and scratch area in linear memory.
///
/// Both the compiler (when emitting glue) and the host runner derive the
/// layout from the operation count, so they always agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLayout {
    /// Number of operation ordinals in the handle table.
    pub op_count: usize,
    /// Start of the shared buffer.
    pub buffer_offset: usize,
    /// Length of the shared buffer.
    pub buffer_len: usize,
    /// Start of the effect-argument scratch area.
    pub scratch_offset: usize,
}

impl BufferLayout {
    /// Compute the layout for `op_count` operations and a requested buffer size.
    pub fn new(op_count: usize, requested: usize) -> Self {
        let table_bytes = op_count * 4;
        let buffer_offset = (table_bytes + 15) & !15;
        let buffer_len = requested.max(MIN_BUFFER_SIZE);
        Self {
            op_count,
            buffer_offset,
            buffer_len,
            scratch_offset: buffer_offset + buffer_len,
        }
    }

    /// Recover the layout of a module from its operation count and memory size.
    pub fn from_memory_size(op_count: usize, memory_size: usize) -> Self {
        let probe = Self::new(op_count, MIN_BUFFER_SIZE);
        let buffer_len = memory_size
            .saturating_sub(MAX_WIRE_ARGS * SLOT_SIZE)
            .saturating_sub(probe.buffer_offset);
        Self::new(op_count, buffer_len)
    }

    /// Address of the handle-table entry for an ordinal.
    pub fn handle_slot(&self, ordinal: usize) -> usize {
        ordinal * 4
    }

    /// Total linear memory needed.
    pub fn memory_size(&self) -> usize {
        self.scratch_offset + MAX_WIRE_ARGS * SLOT_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_roundtrip_all_tags() {
        let values = [
            WireValue::None,
            WireValue::I32(-7),
            WireValue::I64(1 << 40),
            WireValue::F32(1.5),
            WireValue::F64(-2.25),
        ];
        let mut buf = [0u8; SLOT_SIZE];
        for v in values {
            write_slot(&mut buf, v).unwrap();
            assert_eq!(read_slot(&buf).unwrap(), v);
        }
    }

    #[test]
    fn test_slot_rejects_small_buffer() {
        let mut buf = [0u8; 8];
        let err = write_slot(&mut buf, WireValue::I32(1)).unwrap_err();
        assert_eq!(err, WireError::BufferTooSmall { needed: 16, available: 8 });
    }

    #[test]
    fn test_read_expecting_wrong_tag() {
        let mut buf = [0u8; SLOT_SIZE];
        write_slot(&mut buf, WireValue::I64(3)).unwrap();
        let err = read_slot_expecting(&buf, ValueTag::I32).unwrap_err();
        assert_eq!(
            err,
            WireError::TagMismatch { expected: ValueTag::I32, found: ValueTag::I64 }
        );
    }

    #[test]
    fn test_unknown_tag() {
        let mut buf = [0u8; SLOT_SIZE];
        buf[0] = 9;
        assert_eq!(read_slot(&buf).unwrap_err(), WireError::UnknownTag(9));
    }

    #[test]
    fn test_args_envelope() {
        let mut buf = vec![0u8; 128];
        let args = [WireValue::I32(4), WireValue::F64(0.5)];
        let written = encode_args(&mut buf, &args).unwrap();
        assert_eq!(written, ARGS_HEADER_SIZE + 2 * SLOT_SIZE);
        assert_eq!(decode_args(&buf).unwrap(), args.to_vec());
    }

    #[test]
    fn test_effect_envelope() {
        let env = EffectEnvelope {
            op_index: 2,
            op_id: 1,
            effect_id: 0xdead_beef_0000_0001,
            resume_kind: 1,
            handle: 3,
            args: vec![WireValue::I32(4)],
        };
        let mut buf = vec![0u8; 64];
        assert_eq!(env.encode(&mut buf).unwrap(), 48);
        assert_eq!(EffectEnvelope::decode(&buf).unwrap(), env);

        let mut tiny = vec![0u8; 40];
        assert!(matches!(env.encode(&mut tiny), Err(WireError::BufferTooSmall { .. })));
    }

    #[test]
    fn test_buffer_layout() {
        let layout = BufferLayout::new(3, 100);
        assert_eq!(layout.buffer_offset, 16);
        assert_eq!(layout.buffer_len, MIN_BUFFER_SIZE);
        assert_eq!(layout.scratch_offset, 16 + MIN_BUFFER_SIZE);
        assert_eq!(layout.handle_slot(2), 8);

        let empty = BufferLayout::new(0, 8192);
        assert_eq!(empty.buffer_offset, 0);
        assert_eq!(empty.buffer_len, 8192);
    }

    #[test]
    fn test_layout_from_memory_size() {
        let layout = BufferLayout::new(5, 6000);
        assert_eq!(BufferLayout::from_memory_size(5, layout.memory_size()), layout);
    }
}
