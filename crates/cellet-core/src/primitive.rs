//! Primitives, the payload unit exchanged over the talk transport
//!
//! A Primitive is an ordered list of stuff entries. Each entry has a
//! grammatical kind (subject, predicate, ...) and a typed literal value, so a
//! receiver can interpret it without any external schema. Primitives carry no
//! destination; the cellet name travels alongside them in the frame.

use std::fmt;

use crate::codec;
use crate::errors::TalkResult;

// ----------------------------------------------------------------------------
// Stuff Kind
// ----------------------------------------------------------------------------

/// Grammatical role of a stuff entry
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StuffKind {
    Subject = 0x01,
    Predicate = 0x02,
    Object = 0x03,
    Attributive = 0x04,
    Adverbial = 0x05,
    Complement = 0x06,
}

impl StuffKind {
    pub const ALL: [StuffKind; 6] = [
        StuffKind::Subject,
        StuffKind::Predicate,
        StuffKind::Object,
        StuffKind::Attributive,
        StuffKind::Adverbial,
        StuffKind::Complement,
    ];

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| *kind as u8 == value)
    }

    pub fn name(&self) -> &'static str {
        match self {
            StuffKind::Subject => "subject",
            StuffKind::Predicate => "predicate",
            StuffKind::Object => "object",
            StuffKind::Attributive => "attributive",
            StuffKind::Adverbial => "adverbial",
            StuffKind::Complement => "complement",
        }
    }
}

// ----------------------------------------------------------------------------
// Literal Values
// ----------------------------------------------------------------------------

/// Wire tag of a literal value
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LiteralTag {
    String = 0x01,
    Int = 0x02,
    Long = 0x03,
    Double = 0x04,
    Bool = 0x05,
    Bytes = 0x06,
    Json = 0x07,
}

impl LiteralTag {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(LiteralTag::String),
            0x02 => Some(LiteralTag::Int),
            0x03 => Some(LiteralTag::Long),
            0x04 => Some(LiteralTag::Double),
            0x05 => Some(LiteralTag::Bool),
            0x06 => Some(LiteralTag::Bytes),
            0x07 => Some(LiteralTag::Json),
            _ => None,
        }
    }

    /// Required value length for fixed-width literals
    pub fn fixed_len(&self) -> Option<usize> {
        match self {
            LiteralTag::Int => Some(4),
            LiteralTag::Long | LiteralTag::Double => Some(8),
            LiteralTag::Bool => Some(1),
            LiteralTag::String | LiteralTag::Bytes | LiteralTag::Json => None,
        }
    }
}

/// Typed value of a stuff entry
///
/// Doubles compare by bit pattern, matching what travels on the wire, so a
/// `NaN` equals itself and `0.0` differs from `-0.0`.
#[derive(Debug, Clone)]
pub enum Literal {
    String(String),
    Int(i32),
    Long(i64),
    Double(f64),
    Bool(bool),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

impl Literal {
    pub fn tag(&self) -> LiteralTag {
        match self {
            Literal::String(_) => LiteralTag::String,
            Literal::Int(_) => LiteralTag::Int,
            Literal::Long(_) => LiteralTag::Long,
            Literal::Double(_) => LiteralTag::Double,
            Literal::Bool(_) => LiteralTag::Bool,
            Literal::Bytes(_) => LiteralTag::Bytes,
            Literal::Json(_) => LiteralTag::Json,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Literal::String(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view; `Int` widens to `i64`
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Literal::Int(v) => Some(i64::from(*v)),
            Literal::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Literal::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Literal::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Literal::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Literal::Json(v) => Some(v),
            _ => None,
        }
    }
}

impl PartialEq for Literal {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Literal::String(a), Literal::String(b)) => a == b,
            (Literal::Int(a), Literal::Int(b)) => a == b,
            (Literal::Long(a), Literal::Long(b)) => a == b,
            (Literal::Double(a), Literal::Double(b)) => a.to_bits() == b.to_bits(),
            (Literal::Bool(a), Literal::Bool(b)) => a == b,
            (Literal::Bytes(a), Literal::Bytes(b)) => a == b,
            (Literal::Json(a), Literal::Json(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::String(s) => write!(f, "{s:?}"),
            Literal::Int(v) => write!(f, "{v}"),
            Literal::Long(v) => write!(f, "{v}L"),
            Literal::Double(v) => write!(f, "{v}"),
            Literal::Bool(v) => write!(f, "{v}"),
            Literal::Bytes(v) => write!(f, "<{} bytes>", v.len()),
            Literal::Json(v) => write!(f, "{v}"),
        }
    }
}

impl From<&str> for Literal {
    fn from(value: &str) -> Self {
        Literal::String(value.to_string())
    }
}

impl From<String> for Literal {
    fn from(value: String) -> Self {
        Literal::String(value)
    }
}

impl From<i32> for Literal {
    fn from(value: i32) -> Self {
        Literal::Int(value)
    }
}

impl From<i64> for Literal {
    fn from(value: i64) -> Self {
        Literal::Long(value)
    }
}

impl From<f64> for Literal {
    fn from(value: f64) -> Self {
        Literal::Double(value)
    }
}

impl From<bool> for Literal {
    fn from(value: bool) -> Self {
        Literal::Bool(value)
    }
}

impl From<Vec<u8>> for Literal {
    fn from(value: Vec<u8>) -> Self {
        Literal::Bytes(value)
    }
}

impl From<serde_json::Value> for Literal {
    fn from(value: serde_json::Value) -> Self {
        Literal::Json(value)
    }
}

// ----------------------------------------------------------------------------
// Stuff
// ----------------------------------------------------------------------------

/// One self-describing entry of a primitive
#[derive(Debug, Clone, PartialEq)]
pub struct Stuff {
    pub kind: StuffKind,
    pub value: Literal,
}

impl Stuff {
    pub fn new<L: Into<Literal>>(kind: StuffKind, value: L) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }

    pub fn subject<L: Into<Literal>>(value: L) -> Self {
        Self::new(StuffKind::Subject, value)
    }

    pub fn predicate<L: Into<Literal>>(value: L) -> Self {
        Self::new(StuffKind::Predicate, value)
    }

    pub fn object<L: Into<Literal>>(value: L) -> Self {
        Self::new(StuffKind::Object, value)
    }

    pub fn attributive<L: Into<Literal>>(value: L) -> Self {
        Self::new(StuffKind::Attributive, value)
    }

    pub fn adverbial<L: Into<Literal>>(value: L) -> Self {
        Self::new(StuffKind::Adverbial, value)
    }

    pub fn complement<L: Into<Literal>>(value: L) -> Self {
        Self::new(StuffKind::Complement, value)
    }
}

// ----------------------------------------------------------------------------
// Primitive
// ----------------------------------------------------------------------------

/// Ordered collection of stuff entries
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Primitive {
    stuff: Vec<Stuff>,
}

impl Primitive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style append
    pub fn with(mut self, stuff: Stuff) -> Self {
        self.stuff.push(stuff);
        self
    }

    /// Append an entry at the end
    pub fn commit(&mut self, stuff: Stuff) {
        self.stuff.push(stuff);
    }

    pub fn num_stuff(&self) -> usize {
        self.stuff.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stuff.is_empty()
    }

    pub fn stuff(&self) -> &[Stuff] {
        &self.stuff
    }

    pub fn iter(&self) -> impl Iterator<Item = &Stuff> {
        self.stuff.iter()
    }

    /// Entries of one kind, in order
    pub fn of_kind(&self, kind: StuffKind) -> impl Iterator<Item = &Literal> {
        self.stuff
            .iter()
            .filter(move |s| s.kind == kind)
            .map(|s| &s.value)
    }

    pub fn subjects(&self) -> impl Iterator<Item = &Literal> {
        self.of_kind(StuffKind::Subject)
    }

    pub fn predicates(&self) -> impl Iterator<Item = &Literal> {
        self.of_kind(StuffKind::Predicate)
    }

    pub fn objects(&self) -> impl Iterator<Item = &Literal> {
        self.of_kind(StuffKind::Object)
    }

    /// Serialize into the self-describing TLV layout
    pub fn encode(&self) -> TalkResult<Vec<u8>> {
        codec::encode_primitive(self)
    }

    /// Parse the TLV layout; fails with `MalformedPrimitive` on bad input
    pub fn decode(bytes: &[u8]) -> TalkResult<Self> {
        codec::decode_primitive(bytes)
    }
}

impl FromIterator<Stuff> for Primitive {
    fn from_iter<I: IntoIterator<Item = Stuff>>(iter: I) -> Self {
        Self {
            stuff: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for Primitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, stuff) in self.stuff.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}={}", stuff.kind.name(), stuff.value)?;
        }
        f.write_str("]")
    }
}
