//! Transport codec for plugin results.
//!
//! A result is serialized to compact, ASCII-only JSON (non-ASCII characters
//! are written as `\uXXXX` escapes). When that text fits in `chunk_size`
//! bytes it is published as-is, which is exactly the `data` message shape.
//! Otherwise it is cut into consecutive `chunk_size`-byte fragments and sent
//! as a single `chunks` message. Because the text is ASCII, a byte cut never
//! lands inside a character and every fragment is a valid JSON string.
//!
//! Receivers must join the fragments before parsing; a fragment on its own
//! is not valid JSON.

use crate::types::{Message, MessageBody, PluginResult};
use serde::Serialize;
use serde_json::ser::Formatter;
use serde_json::value::RawValue;
use std::io;

/// Maximum size in bytes of a single published data message or fragment.
pub const CHUNK_SIZE: usize = 120_000;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("chunk size must be greater than zero")]
    InvalidChunkSize,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("fragment is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("no JSON value in input")]
    Empty,

    #[error("reassembled result type '{found}' does not match message type '{expected}'")]
    KindMismatch { expected: String, found: String },
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// Compact formatter that escapes everything outside ASCII.
struct AsciiFormatter;

impl Formatter for AsciiFormatter {
    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        write_ascii(writer, fragment)
    }

    // Non-ASCII can only occur inside string literals of raw JSON text, so
    // escaping it there keeps the document equivalent.
    fn write_raw_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        write_ascii(writer, fragment)
    }
}

fn write_ascii<W>(writer: &mut W, s: &str) -> io::Result<()>
where
    W: ?Sized + io::Write,
{
    let bytes = s.as_bytes();
    let mut start = 0;
    for (i, ch) in s.char_indices() {
        if ch.is_ascii() {
            continue;
        }
        writer.write_all(&bytes[start..i])?;
        let mut units = [0u16; 2];
        for unit in ch.encode_utf16(&mut units) {
            write!(writer, "\\u{unit:04x}")?;
        }
        start = i + ch.len_utf8();
    }
    writer.write_all(&bytes[start..])
}

/// Serializes any value to the canonical wire form.
///
/// # Examples
///
/// ```
/// use mirach_common::codec::to_canonical_bytes;
///
/// let bytes = to_canonical_bytes(&serde_json::json!({"host": "héte"})).unwrap();
/// assert_eq!(bytes, br#"{"host":"h\u00e9te"}"#.to_vec());
/// ```
pub fn to_canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut out, AsciiFormatter);
    value.serialize(&mut ser)?;
    Ok(out)
}

/// One encoded wire message, ready to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    /// Message bytes.
    pub body: Vec<u8>,
    /// Number of fragments, zero for a `data` message.
    pub fragments: usize,
    /// Size of the serialized result before any splitting.
    pub result_len: usize,
}

impl Encoded {
    pub fn is_chunked(&self) -> bool {
        self.fragments > 0
    }
}

/// Encodes a result as exactly one wire message.
///
/// # Examples
///
/// ```
/// use mirach_common::codec::encode;
/// use mirach_common::types::{Payload, PluginResult};
///
/// let res = PluginResult::new("load", Payload::from_json_str(r#"{"avg":1.2}"#).unwrap());
/// let small = encode(&res, 1024).unwrap();
/// assert!(!small.is_chunked());
/// assert_eq!(small.body, br#"{"type":"load","data":{"avg":1.2}}"#.to_vec());
///
/// let split = encode(&res, 10).unwrap();
/// assert_eq!(split.fragments, 4);
/// ```
pub fn encode(result: &PluginResult, chunk_size: usize) -> Result<Encoded> {
    if chunk_size == 0 {
        return Err(CodecError::InvalidChunkSize);
    }

    let bytes = to_canonical_bytes(result)?;
    let result_len = bytes.len();
    if result_len <= chunk_size {
        return Ok(Encoded {
            body: bytes,
            fragments: 0,
            result_len,
        });
    }

    let chunks = split(&bytes, chunk_size)?;
    let fragments = chunks.len();
    let message = Message {
        kind: result.kind.clone(),
        body: MessageBody::Chunks(chunks),
    };
    Ok(Encoded {
        body: to_canonical_bytes(&message)?,
        fragments,
        result_len,
    })
}

/// Cuts `bytes` into consecutive fragments of at most `chunk_size` bytes.
pub fn split(bytes: &[u8], chunk_size: usize) -> Result<Vec<String>> {
    if chunk_size == 0 {
        return Err(CodecError::InvalidChunkSize);
    }
    bytes
        .chunks(chunk_size)
        .map(|c| String::from_utf8(c.to_vec()).map_err(CodecError::from))
        .collect()
}

/// Parses one wire message.
pub fn decode(bytes: &[u8]) -> Result<Message> {
    Ok(serde_json::from_slice(bytes)?)
}

/// What a receiver ends up with after reading a message.
#[derive(Debug, Clone, PartialEq)]
pub enum Reassembled {
    Result(PluginResult),
    Reference { kind: String, url: String },
}

/// Rebuilds the original result from a `data` or `chunks` message.
pub fn reassemble(message: &Message) -> Result<Reassembled> {
    match &message.body {
        MessageBody::Data(payload) => Ok(Reassembled::Result(PluginResult::new(
            message.kind.clone(),
            payload.clone(),
        ))),
        MessageBody::Url(url) => Ok(Reassembled::Reference {
            kind: message.kind.clone(),
            url: url.clone(),
        }),
        MessageBody::Chunks(chunks) => {
            let joined = chunks.concat();
            let result: PluginResult = serde_json::from_str(&joined)?;
            if result.kind != message.kind {
                return Err(CodecError::KindMismatch {
                    expected: message.kind.clone(),
                    found: result.kind,
                });
            }
            Ok(Reassembled::Result(result))
        }
    }
}

/// Reads the first JSON value from `bytes`, keeping its text verbatim.
/// Anything after that value is ignored.
pub fn first_json_value(bytes: &[u8]) -> Result<Box<RawValue>> {
    let mut stream = serde_json::Deserializer::from_slice(bytes).into_iter::<Box<RawValue>>();
    match stream.next() {
        Some(value) => Ok(value?),
        None => Err(CodecError::Empty),
    }
}
