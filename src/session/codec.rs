//! The tagged byte encoding for session fields and values.
//!
//! Every field name in a session record starts with a one-byte class tag
//! ([`DATA`], [`VALIDATOR`], [`NONCE`]); every `DATA` field value starts
//! with a one-byte type tag. Both tables are part of the storage
//! contract, not an implementation detail.

/// Field tag: application data, tag followed by the UTF-8 key name.
pub const DATA: u8 = 0x00;
/// Field tag: validator digest, value is the deadline as decimal seconds.
pub const VALIDATOR: u8 = 0x01;
/// Field tag: the optimistic-concurrency nonce.
pub const NONCE: u8 = 0x02;

const TAG_BYTES: u8 = 0x10;
const TAG_STRING: u8 = 0x11;
const TAG_INTEGER: u8 = 0x12;
const TAG_FLOAT: u8 = 0x13;
const TAG_BOOLEAN: u8 = 0x14;

/// A session value: the closed set of types the codec can store.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bytes(Vec<u8>),
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
}

impl Value {
    /// Encodes the value as its tagged byte form.
    pub fn encode(&self) -> Vec<u8> {
        let (tag, body) = match self {
            Value::Bytes(data) => (TAG_BYTES, data.clone()),
            Value::String(s) => (TAG_STRING, s.as_bytes().to_vec()),
            Value::Integer(n) => (TAG_INTEGER, n.to_string().into_bytes()),
            Value::Float(x) => (TAG_FLOAT, x.to_string().into_bytes()),
            Value::Boolean(b) => (TAG_BOOLEAN, vec![if *b { b'1' } else { b'0' }]),
        };
        let mut out = Vec::with_capacity(1 + body.len());
        out.push(tag);
        out.extend_from_slice(&body);
        out
    }

    /// Decodes a tagged byte form. `None` for an unknown tag or a body
    /// that does not parse under its tag.
    pub fn decode(raw: &[u8]) -> Option<Value> {
        let (&tag, body) = raw.split_first()?;
        match tag {
            TAG_BYTES => Some(Value::Bytes(body.to_vec())),
            TAG_STRING => String::from_utf8(body.to_vec()).ok().map(Value::String),
            TAG_INTEGER => std::str::from_utf8(body)
                .ok()?
                .parse()
                .ok()
                .map(Value::Integer),
            TAG_FLOAT => std::str::from_utf8(body)
                .ok()?
                .parse()
                .ok()
                .map(Value::Float),
            TAG_BOOLEAN => Some(Value::Boolean(matches!(
                body,
                b"1" | b"yes" | b"true" | b"True"
            ))),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(n) => Some(*n),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(data: Vec<u8>) -> Self {
        Value::Bytes(data)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

/// Builds the stored field name for an application key.
pub fn data_field(key: &str) -> Vec<u8> {
    let mut field = Vec::with_capacity(1 + key.len());
    field.push(DATA);
    field.extend_from_slice(key.as_bytes());
    field
}

/// Builds the stored field name for a validator digest.
pub fn validator_field(digest: &[u8]) -> Vec<u8> {
    let mut field = Vec::with_capacity(1 + digest.len());
    field.push(VALIDATOR);
    field.extend_from_slice(digest);
    field
}

/// The nonce field name.
pub fn nonce_field() -> Vec<u8> {
    vec![NONCE]
}
