//! TLV codec for primitives
//!
//! Layout: `count: u16 BE` followed by `count` entries, each encoded as
//! `kind: u8 | literal: u8 | len: u32 BE | value`. Every entry carries its
//! own type tags and length, so decoding needs no schema.

use crate::errors::{TalkError, TalkResult};
use crate::primitive::{Literal, LiteralTag, Primitive, Stuff, StuffKind};

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Size of the entry count prefix
pub const COUNT_SIZE: usize = 2;

/// Size of an entry header: kind + literal tag + value length
pub const ENTRY_HEADER_SIZE: usize = 6;

/// Largest single value that can be encoded
pub const MAX_VALUE_LEN: usize = u32::MAX as usize;

// ----------------------------------------------------------------------------
// Encoding
// ----------------------------------------------------------------------------

/// Encode a primitive to its TLV byte form
pub fn encode_primitive(primitive: &Primitive) -> TalkResult<Vec<u8>> {
    let count = u16::try_from(primitive.num_stuff()).map_err(|_| {
        TalkError::malformed(format!(
            "too many stuff entries: {} (max: {})",
            primitive.num_stuff(),
            u16::MAX
        ))
    })?;

    let mut bytes = Vec::with_capacity(COUNT_SIZE + primitive.num_stuff() * 16);
    bytes.extend_from_slice(&count.to_be_bytes());

    for stuff in primitive.iter() {
        encode_stuff(stuff, &mut bytes)?;
    }

    Ok(bytes)
}

fn encode_stuff(stuff: &Stuff, out: &mut Vec<u8>) -> TalkResult<()> {
    let value: Vec<u8> = match &stuff.value {
        Literal::String(s) => s.as_bytes().to_vec(),
        Literal::Int(v) => v.to_be_bytes().to_vec(),
        Literal::Long(v) => v.to_be_bytes().to_vec(),
        Literal::Double(v) => v.to_be_bytes().to_vec(),
        Literal::Bool(v) => vec![u8::from(*v)],
        Literal::Bytes(v) => v.clone(),
        Literal::Json(v) => serde_json::to_vec(v)
            .map_err(|e| TalkError::malformed(format!("json literal not serializable: {e}")))?,
    };

    if value.len() > MAX_VALUE_LEN {
        return Err(TalkError::malformed(format!(
            "stuff value too large: {} bytes",
            value.len()
        )));
    }

    out.push(stuff.kind as u8);
    out.push(stuff.value.tag() as u8);
    out.extend_from_slice(&(value.len() as u32).to_be_bytes());
    out.extend_from_slice(&value);
    Ok(())
}

// ----------------------------------------------------------------------------
// Decoding
// ----------------------------------------------------------------------------

/// Decode a primitive from its TLV byte form
///
/// Truncated input, unknown tags, wrong fixed-width lengths, bad UTF-8 or JSON,
/// a count that disagrees with the entries present and trailing bytes are all
/// reported as `MalformedPrimitive`.
pub fn decode_primitive(bytes: &[u8]) -> TalkResult<Primitive> {
    let mut reader = Reader::new(bytes);

    let count = u16::from_be_bytes(reader.take_array::<2>("entry count")?);
    let mut stuff = Vec::with_capacity(usize::from(count).min(bytes.len() / ENTRY_HEADER_SIZE));

    for index in 0..count {
        stuff.push(decode_stuff(&mut reader, index)?);
    }

    if reader.remaining() > 0 {
        return Err(TalkError::malformed(format!(
            "{} trailing bytes after {} entries",
            reader.remaining(),
            count
        )));
    }

    Ok(stuff.into_iter().collect())
}

fn decode_stuff(reader: &mut Reader<'_>, index: u16) -> TalkResult<Stuff> {
    let [kind_byte, tag_byte] = reader.take_array::<2>("entry header")?;
    let kind = StuffKind::from_u8(kind_byte).ok_or_else(|| {
        TalkError::malformed(format!("entry {index}: unknown stuff kind 0x{kind_byte:02x}"))
    })?;
    let tag = LiteralTag::from_u8(tag_byte).ok_or_else(|| {
        TalkError::malformed(format!("entry {index}: unknown literal tag 0x{tag_byte:02x}"))
    })?;

    let len = u32::from_be_bytes(reader.take_array::<4>("entry length")?) as usize;
    if let Some(expected) = tag.fixed_len() {
        if len != expected {
            return Err(TalkError::malformed(format!(
                "entry {index}: {tag:?} literal must be {expected} bytes, got {len}"
            )));
        }
    }

    let raw = reader.take(len, "entry value")?;
    let value = match tag {
        LiteralTag::String => Literal::String(
            std::str::from_utf8(raw)
                .map_err(|e| TalkError::malformed(format!("entry {index}: invalid UTF-8: {e}")))?
                .to_string(),
        ),
        LiteralTag::Int => Literal::Int(i32::from_be_bytes(fixed(raw)?)),
        LiteralTag::Long => Literal::Long(i64::from_be_bytes(fixed(raw)?)),
        LiteralTag::Double => Literal::Double(f64::from_be_bytes(fixed(raw)?)),
        LiteralTag::Bool => match raw[0] {
            0 => Literal::Bool(false),
            1 => Literal::Bool(true),
            other => {
                return Err(TalkError::malformed(format!(
                    "entry {index}: invalid bool byte 0x{other:02x}"
                )))
            }
        },
        LiteralTag::Bytes => Literal::Bytes(raw.to_vec()),
        LiteralTag::Json => Literal::Json(
            serde_json::from_slice(raw)
                .map_err(|e| TalkError::malformed(format!("entry {index}: invalid json: {e}")))?,
        ),
    };

    Ok(Stuff { kind, value })
}

fn fixed<const N: usize>(raw: &[u8]) -> TalkResult<[u8; N]> {
    raw.try_into()
        .map_err(|_| TalkError::malformed(format!("expected {N} bytes, got {}", raw.len())))
}

/// Bounds-checked cursor over the input
struct Reader<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    fn take(&mut self, len: usize, what: &str) -> TalkResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(TalkError::malformed(format!(
                "truncated {what}: need {len} bytes, have {}",
                self.remaining()
            )));
        }
        let slice = &self.bytes[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self, what: &str) -> TalkResult<[u8; N]> {
        fixed(self.take(N, what)?)
    }
}
