//! Constant pool values and the per-dialect tag tables
//!
//! Every Lua dialect prefixes a constant with a tag byte, but the tag values
//! disagree between versions: 5.4 splits booleans into two tags and swaps the
//! integer/float tags of 5.3, while 5.0-5.2 only know a single number tag.
//! A [`ConstantTagTable`] is selected once per chunk from its [`Version`] and
//! threaded through decoding.

use crate::error::{Error, Result};
use scroll::ctx::TryFromCtx;
use scroll::Pread;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Longest string stored under the short-string tag (`LUAI_MAXSHORTLEN`).
pub const MAX_SHORT_STRING: usize = 40;

/// A constant value in a prototype's constant pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Constant {
    Nil,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(LuaString),
}

impl Constant {
    /// Whether this is the integer literal `value`.
    pub fn is_integer(&self, value: i64) -> bool {
        matches!(self, Constant::Integer(v) if *v == value)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Constant::String(s) => s.as_str(),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Constant::Nil => "nil",
            Constant::Boolean(_) => "boolean",
            Constant::Integer(_) => "integer",
            Constant::Float(_) => "float",
            Constant::String(_) => "string",
        }
    }
}

/// A Lua string: a byte sequence that is usually, but not necessarily, UTF-8.
///
/// Serializes as a JSON string when the bytes are valid UTF-8 and as an array
/// of byte values otherwise.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct LuaString(Vec<u8>);

impl LuaString {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for LuaString {
    fn from(text: &str) -> Self {
        LuaString(text.as_bytes().to_vec())
    }
}

impl From<String> for LuaString {
    fn from(text: String) -> Self {
        LuaString(text.into_bytes())
    }
}

impl From<&[u8]> for LuaString {
    fn from(bytes: &[u8]) -> Self {
        LuaString(bytes.to_vec())
    }
}

impl From<Vec<u8>> for LuaString {
    fn from(bytes: Vec<u8>) -> Self {
        LuaString(bytes)
    }
}

impl Serialize for LuaString {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self.as_str() {
            Some(text) => serializer.serialize_str(text),
            None => self.0.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for LuaString {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Bytes(Vec<u8>),
        }
        Ok(match Repr::deserialize(deserializer)? {
            Repr::Text(text) => text.into(),
            Repr::Bytes(bytes) => bytes.into(),
        })
    }
}

/// Bytecode dialect selecting the constant tag encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Version {
    #[serde(rename = "5.0")]
    Lua50,
    #[serde(rename = "5.1")]
    Lua51,
    #[serde(rename = "5.2")]
    Lua52,
    #[serde(rename = "5.3")]
    Lua53,
    #[serde(rename = "5.4")]
    Lua54,
}

impl Version {
    /// Map the chunk header version byte (`0x51`, `0x54`, ...) to a dialect.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x50 => Some(Version::Lua50),
            0x51 => Some(Version::Lua51),
            0x52 => Some(Version::Lua52),
            0x53 => Some(Version::Lua53),
            0x54 => Some(Version::Lua54),
            _ => None,
        }
    }

    pub fn byte(self) -> u8 {
        match self {
            Version::Lua50 => 0x50,
            Version::Lua51 => 0x51,
            Version::Lua52 => 0x52,
            Version::Lua53 => 0x53,
            Version::Lua54 => 0x54,
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text.trim() {
            "5.0" | "50" => Some(Version::Lua50),
            "5.1" | "51" => Some(Version::Lua51),
            "5.2" | "52" => Some(Version::Lua52),
            "5.3" | "53" => Some(Version::Lua53),
            "5.4" | "54" => Some(Version::Lua54),
            _ => None,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.byte() >> 4, self.byte() & 0x0F)
    }
}

/// What a tag byte announces about the payload that follows it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstantKind {
    Nil,
    /// Boolean with a one-byte payload.
    Boolean,
    /// Payload-free `false` (5.4).
    False,
    /// Payload-free `true` (5.4).
    True,
    /// Single numeric type of 5.0-5.2.
    Number,
    Integer,
    Float,
    ShortString,
    LongString,
}

const TAGS_50: &[(u8, ConstantKind)] = &[
    (0x00, ConstantKind::Nil),
    (0x01, ConstantKind::Boolean),
    (0x03, ConstantKind::Number),
    (0x04, ConstantKind::ShortString),
];

const TAGS_53: &[(u8, ConstantKind)] = &[
    (0x00, ConstantKind::Nil),
    (0x01, ConstantKind::Boolean),
    (0x03, ConstantKind::Float),
    (0x13, ConstantKind::Integer),
    (0x04, ConstantKind::ShortString),
    (0x14, ConstantKind::LongString),
];

const TAGS_54: &[(u8, ConstantKind)] = &[
    (0x00, ConstantKind::Nil),
    (0x01, ConstantKind::False),
    (0x11, ConstantKind::True),
    (0x03, ConstantKind::Integer),
    (0x13, ConstantKind::Float),
    (0x04, ConstantKind::ShortString),
    (0x14, ConstantKind::LongString),
];

/// Tag byte <-> constant kind mapping for one dialect.
#[derive(Debug, Clone, Copy)]
pub struct ConstantTagTable {
    version: Version,
    entries: &'static [(u8, ConstantKind)],
}

impl ConstantTagTable {
    pub fn for_version(version: Version) -> Self {
        let entries = match version {
            Version::Lua50 | Version::Lua51 | Version::Lua52 => TAGS_50,
            Version::Lua53 => TAGS_53,
            Version::Lua54 => TAGS_54,
        };
        Self { version, entries }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn entries(&self) -> &'static [(u8, ConstantKind)] {
        self.entries
    }

    /// Decode a tag byte.
    pub fn decode(&self, tag: u8) -> Result<ConstantKind> {
        self.entries
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, kind)| *kind)
            .ok_or(Error::UnknownConstantTag {
                tag,
                version: self.version,
            })
    }

    /// Tag byte this dialect writes in front of `constant`.
    pub fn encode(&self, constant: &Constant) -> u8 {
        let kind = match (self.version, constant) {
            (_, Constant::Nil) => ConstantKind::Nil,
            (Version::Lua54, Constant::Boolean(false)) => ConstantKind::False,
            (Version::Lua54, Constant::Boolean(true)) => ConstantKind::True,
            (_, Constant::Boolean(_)) => ConstantKind::Boolean,
            (Version::Lua50 | Version::Lua51 | Version::Lua52, Constant::Integer(_))
            | (Version::Lua50 | Version::Lua51 | Version::Lua52, Constant::Float(_)) => {
                ConstantKind::Number
            }
            (_, Constant::Integer(_)) => ConstantKind::Integer,
            (_, Constant::Float(_)) => ConstantKind::Float,
            (Version::Lua53 | Version::Lua54, Constant::String(s)) if s.len() > MAX_SHORT_STRING => {
                ConstantKind::LongString
            }
            (_, Constant::String(_)) => ConstantKind::ShortString,
        };
        self.entries
            .iter()
            .find(|(_, k)| *k == kind)
            .map(|(tag, _)| *tag)
            .unwrap_or(0)
    }
}

/// Layout of the scalar payloads of a chunk, taken from its header.
#[derive(Debug, Clone, Copy)]
pub struct ConstantContext {
    pub tags: ConstantTagTable,
    pub endian: scroll::Endian,
    /// Size of `lua_Integer` in bytes (4 or 8).
    pub integer_size: usize,
    /// Size of `lua_Number` in bytes (4 or 8).
    pub number_size: usize,
    /// Size of `size_t` in bytes (4 or 8).
    pub size_t_size: usize,
}

impl ConstantContext {
    /// Layout produced by a stock 64-bit build of the given dialect.
    pub fn native(version: Version) -> Self {
        Self {
            tags: ConstantTagTable::for_version(version),
            endian: scroll::LE,
            integer_size: 8,
            number_size: 8,
            size_t_size: 8,
        }
    }

    fn read_integer(&self, src: &[u8], offset: &mut usize) -> Result<i64> {
        Ok(match self.integer_size {
            4 => src.gread_with::<i32>(offset, self.endian)? as i64,
            _ => src.gread_with::<i64>(offset, self.endian)?,
        })
    }

    fn read_number(&self, src: &[u8], offset: &mut usize) -> Result<f64> {
        Ok(match self.number_size {
            4 => src.gread_with::<f32>(offset, self.endian)? as f64,
            _ => src.gread_with::<f64>(offset, self.endian)?,
        })
    }

    fn read_size_t(&self, src: &[u8], offset: &mut usize) -> Result<usize> {
        Ok(match self.size_t_size {
            4 => src.gread_with::<u32>(offset, self.endian)? as usize,
            _ => src.gread_with::<u64>(offset, self.endian)? as usize,
        })
    }

    /// 5.4 size prefix: big-endian groups of seven bits, high bit marks the last byte.
    fn read_varint(&self, src: &[u8], offset: &mut usize) -> Result<usize> {
        let mut value: usize = 0;
        loop {
            let byte = src.gread::<u8>(offset)?;
            if value > usize::MAX >> 7 {
                return Err(Error::parse(*offset, "string size overflows"));
            }
            value = (value << 7) | (byte & 0x7F) as usize;
            if byte & 0x80 != 0 {
                return Ok(value);
            }
        }
    }

    fn read_string(&self, src: &[u8], offset: &mut usize) -> Result<LuaString> {
        // Every dialect stores length + 1 so that 0 can mean "no string".
        let size = match self.tags.version() {
            Version::Lua54 => self.read_varint(src, offset)?,
            Version::Lua53 => {
                let small = src.gread::<u8>(offset)?;
                if small == 0xFF {
                    self.read_size_t(src, offset)?
                } else {
                    small as usize
                }
            }
            _ => self.read_size_t(src, offset)?,
        };
        if size == 0 {
            return Err(Error::parse(*offset, "null string in constant pool"));
        }
        let len = size - 1;
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= src.len())
            .ok_or_else(|| Error::parse(*offset, "string runs past end of input"))?;
        let text = LuaString::from(&src[*offset..end]);
        *offset = end;
        if self.tags.version() < Version::Lua53 {
            // Older dialects count the terminating NUL in the size.
            let _nul = src.gread::<u8>(offset)?;
        }
        Ok(text)
    }
}

impl<'a> TryFromCtx<'a, ConstantContext> for Constant {
    type Error = Error;

    fn try_from_ctx(src: &'a [u8], ctx: ConstantContext) -> Result<(Self, usize)> {
        let mut offset = 0;
        let tag = src.gread::<u8>(&mut offset)?;
        let constant = match ctx.tags.decode(tag)? {
            ConstantKind::Nil => Constant::Nil,
            ConstantKind::Boolean => Constant::Boolean(src.gread::<u8>(&mut offset)? != 0),
            ConstantKind::False => Constant::Boolean(false),
            ConstantKind::True => Constant::Boolean(true),
            ConstantKind::Number => {
                let value = ctx.read_number(src, &mut offset)?;
                if value.fract() == 0.0 && value.abs() < 9.0e15 {
                    Constant::Integer(value as i64)
                } else {
                    Constant::Float(value)
                }
            }
            ConstantKind::Integer => Constant::Integer(ctx.read_integer(src, &mut offset)?),
            ConstantKind::Float => Constant::Float(ctx.read_number(src, &mut offset)?),
            ConstantKind::ShortString | ConstantKind::LongString => {
                Constant::String(ctx.read_string(src, &mut offset)?)
            }
        };
        Ok((constant, offset))
    }
}

/// Decode one tagged constant at `offset`, advancing it past the payload.
pub fn read_constant(src: &[u8], offset: &mut usize, ctx: ConstantContext) -> Result<Constant> {
    let start = *offset;
    src.gread_with::<Constant>(offset, ctx).map_err(|err| match err {
        Error::Parse { message, .. } => Error::Parse {
            offset: start,
            message,
        },
        other => other,
    })
}
