//! Formatters and the value model used to move cache values in and out of Redis.
//!
//! A value reaches the server along one of two paths:
//!
//! - as a direct command argument (`SET`), where the [`Transport`] may encode it itself when it has
//!   a serializer configured; [`serialize`] then hands the value over untouched,
//! - as an argument of a server-side script, which the transport never encodes;
//!   [`serialize_for_argv`] always produces the final bytes for that path.
//!
//! Integers and finite floats encoded by this crate are stored as plain decimal text so that they
//! stay readable (and usable with `INCRBY`) on the server.

use std::{
    collections::BTreeMap,
    fmt::Debug,
    io::{Read, Write},
};

use flate2::{read::ZlibDecoder, write::ZlibEncoder, Compression};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::transport::Transport;

/// A formatter that can serialize data before storing it in a cache and deserialize it after
/// retrieving it from the cache.
pub trait Formatter: Debug {
    /// Serialize a `T` into bytes.
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, FormatError>;
    /// Deserialize bytes into a `T`.
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, FormatError>;
}

/// A formatter using the [`postcard`] crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostcardFormatter;

impl Formatter for PostcardFormatter {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, FormatError> {
        Ok(postcard::to_stdvec(value)?)
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, FormatError> {
        Ok(postcard::from_bytes(bytes)?)
    }
}

/// A formatter using the [`serde_json`] crate.
///
/// JSON has no representation for infinite floats; they are written as `null` and fail to read back.
#[cfg(feature = "serde_json")]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFormatter;

#[cfg(feature = "serde_json")]
impl Formatter for JsonFormatter {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, FormatError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, FormatError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// A value stored in the cache.
///
/// The variant is chosen by the caller; nothing in this crate guesses a type from raw bytes except
/// the decimal text written for [`CacheValue::Int`] and finite [`CacheValue::Float`] values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CacheValue {
    /// A signed integer.
    Int(i64),
    /// A float. `NaN` is accepted but does not compare equal to itself after a round trip.
    Float(f64),
    /// A UTF-8 string.
    Str(String),
    /// Opaque bytes.
    Bytes(Vec<u8>),
    /// An ordered list of values.
    List(Vec<CacheValue>),
    /// A string-keyed map of values.
    Map(BTreeMap<String, CacheValue>),
}

impl CacheValue {
    /// Returns the integer if this is an [`CacheValue::Int`].
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(x) => Some(*x),
            _ => None,
        }
    }

    /// Returns the string slice if this is a [`CacheValue::Str`].
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(x) => Some(x),
            _ => None,
        }
    }

    fn numeric_text(&self) -> Option<String> {
        match self {
            Self::Int(x) => Some(x.to_string()),
            Self::Float(x) if x.is_finite() => {
                let mut text = x.to_string();
                if !text.contains('.') {
                    // keep integral floats from reading back as ints
                    text.push_str(".0");
                }
                Some(text)
            }
            _ => None,
        }
    }

    fn from_numeric_text(raw: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(raw).ok()?;
        if let Ok(x) = text.parse::<i64>() {
            return Some(Self::Int(x));
        }
        text.parse::<f64>()
            .ok()
            .filter(|x| x.is_finite())
            .map(Self::Float)
    }
}

impl From<i64> for CacheValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for CacheValue {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<f64> for CacheValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<String> for CacheValue {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<&str> for CacheValue {
    fn from(value: &str) -> Self {
        Self::Str(value.to_owned())
    }
}

impl From<Vec<u8>> for CacheValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<Vec<CacheValue>> for CacheValue {
    fn from(value: Vec<CacheValue>) -> Self {
        Self::List(value)
    }
}

impl From<BTreeMap<String, CacheValue>> for CacheValue {
    fn from(value: BTreeMap<String, CacheValue>) -> Self {
        Self::Map(value)
    }
}

/// The output of [`serialize`] and the input of [`unserialize`].
#[derive(Debug, Clone, PartialEq)]
pub enum Serialized {
    /// Left for the transport to encode (and decoded by it on the way back).
    Value(CacheValue),
    /// Bytes produced by this crate's own encoding.
    Bytes(Vec<u8>),
}

/// Prepare a value for a direct command argument.
///
/// If the transport serializes values itself, the value is returned unchanged so it is not encoded
/// twice. Otherwise it is encoded with [`encode`].
pub fn serialize(transport_serializes: bool, value: CacheValue) -> Result<Serialized, FormatError> {
    if transport_serializes {
        return Ok(Serialized::Value(value));
    }
    encode(&value).map(Serialized::Bytes)
}

/// Encode a value that is passed to a server-side script.
///
/// Script arguments bypass the transport's serializer and compression, so this always returns the
/// exact bytes that end up stored: the transport's own pack-and-compress step when it has a
/// serializer, otherwise [`encode`] followed by the transport's compression setting.
pub fn serialize_for_argv<C>(conn: &Transport<C>, value: &CacheValue) -> Result<Vec<u8>, FormatError> {
    if let Some(packed) = conn.pack(value) {
        return packed;
    }
    conn.compress(encode(value)?)
}

/// Reverse [`serialize`]. `None` (a missing key) yields `None`.
pub fn unserialize(
    transport_serializes: bool,
    raw: Option<Serialized>,
) -> Result<Option<CacheValue>, FormatError> {
    match raw {
        None => Ok(None),
        Some(Serialized::Value(value)) => Ok(Some(value)),
        Some(Serialized::Bytes(_)) if transport_serializes => Err(FormatError::Undecoded),
        Some(Serialized::Bytes(bytes)) => decode(&bytes).map(Some),
    }
}

/// This crate's own byte encoding: decimal text for ints and finite floats, postcard otherwise.
pub fn encode(value: &CacheValue) -> Result<Vec<u8>, FormatError> {
    match value.numeric_text() {
        Some(text) => Ok(text.into_bytes()),
        None => PostcardFormatter.serialize(value),
    }
}

/// Reverse [`encode`].
pub fn decode(raw: &[u8]) -> Result<CacheValue, FormatError> {
    if raw.is_empty() {
        return Err(FormatError::Empty);
    }
    match CacheValue::from_numeric_text(raw) {
        Some(value) => Ok(value),
        None => PostcardFormatter.deserialize(raw),
    }
}

/// Zlib-compress `bytes` at the given level (clamped to 0-9).
pub fn compress(level: u32, bytes: &[u8]) -> Result<Vec<u8>, FormatError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(level.min(9)));
    encoder.write_all(bytes).map_err(FormatError::Compression)?;
    encoder.finish().map_err(FormatError::Compression)
}

/// Reverse [`compress`].
pub fn decompress(bytes: &[u8]) -> Result<Vec<u8>, FormatError> {
    let mut out = Vec::new();
    ZlibDecoder::new(bytes)
        .read_to_end(&mut out)
        .map_err(FormatError::Compression)?;
    Ok(out)
}

#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("postcard error: {0}")]
    Postcard(#[from] postcard::Error),
    #[cfg(feature = "serde_json")]
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("compression error: {0}")]
    Compression(std::io::Error),
    #[error("empty payload")]
    Empty,
    #[error("transport returned raw bytes although it is configured to decode values")]
    Undecoded,
}
