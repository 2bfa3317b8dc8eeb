//! Bencode codec for info dictionaries and extension-protocol payloads
//!
//! Decoding is prefix-aware: [`decode_prefix`] reports how many bytes the
//! value occupied so that raw data trailing a bencoded header (as in
//! `ut_metadata` data messages) is never interpreted as bencode.

use std::collections::HashMap;

use bytes::Bytes;

/// Nesting limit for lists and dictionaries.
const MAX_DEPTH: usize = 64;

/// Bencode decoding failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BencodeError {
    #[error("malformed bencode at byte {position}: {reason}")]
    Malformed {
        position: usize,
        reason: &'static str,
    },
}

/// Dictionary preserving first-seen key order.
///
/// Inserting an existing key replaces its value in place, so a repeated key
/// from a hostile producer resolves to the last value written.
#[derive(Debug, Clone, Default)]
pub struct Dict {
    entries: Vec<(Bytes, Value)>,
    index: HashMap<Bytes, usize>,
}

impl Dict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<Bytes>, value: Value) {
        let key = key.into();
        match self.index.get(&key) {
            Some(&slot) => self.entries[slot].1 = value,
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, value));
            }
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<&Value> {
        self.index.get(key).map(|&slot| &self.entries[slot].1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&Bytes, &Value)> {
        self.entries.iter().map(|(key, value)| (key, value))
    }
}

impl PartialEq for Dict {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
    }
}

impl Eq for Dict {}

/// A decoded bencode value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Integer(i64),
    Bytes(Bytes),
    List(Vec<Value>),
    Dict(Dict),
}

impl Value {
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// Returns the byte string as UTF-8, if it is valid.
    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(list) => Some(list),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&Dict> {
        match self {
            Value::Dict(dict) => Some(dict),
            _ => None,
        }
    }

    /// Builds a dictionary from entries in the order given.
    pub fn dict<K: Into<Bytes>>(entries: impl IntoIterator<Item = (K, Value)>) -> Value {
        let mut dict = Dict::new();
        for (key, value) in entries {
            dict.insert(key, value);
        }
        Value::Dict(dict)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Bytes(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<Bytes> for Value {
    fn from(b: Bytes) -> Self {
        Value::Bytes(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(list: Vec<Value>) -> Self {
        Value::List(list)
    }
}

impl From<Dict> for Value {
    fn from(dict: Dict) -> Self {
        Value::Dict(dict)
    }
}

/// A value together with the number of bytes it occupied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded {
    pub value: Value,
    pub consumed: usize,
}

/// Decodes the value starting at offset 0. Trailing bytes are ignored.
///
/// # Errors
/// - `BencodeError::Malformed` - Missing delimiter, unknown type tag, or a
///   string length running past the buffer
pub fn decode(data: &[u8]) -> Result<Value, BencodeError> {
    decode_prefix(data, 0).map(|decoded| decoded.value)
}

/// Decodes the value starting at `start` and reports the bytes it consumed.
///
/// # Errors
/// - `BencodeError::Malformed` - See [`decode`]
pub fn decode_prefix(data: &[u8], start: usize) -> Result<Decoded, BencodeError> {
    let mut cursor = Cursor {
        data,
        position: start,
    };
    let value = cursor.read_value(0)?;
    Ok(Decoded {
        value,
        consumed: cursor.position - start,
    })
}

/// Explicit decode position over a borrowed buffer.
struct Cursor<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> Cursor<'a> {
    fn malformed<T>(&self, reason: &'static str) -> Result<T, BencodeError> {
        Err(BencodeError::Malformed {
            position: self.position,
            reason,
        })
    }

    fn peek(&self) -> Option<u8> {
        self.data.get(self.position).copied()
    }

    fn read_value(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth > MAX_DEPTH {
            return self.malformed("nesting too deep");
        }

        match self.peek() {
            Some(b'd') => self.read_dict(depth),
            Some(b'l') => self.read_list(depth),
            Some(b'i') => self.read_integer(),
            Some(b'0'..=b'9') => self.read_bytes().map(Value::Bytes),
            Some(_) => self.malformed("unknown type tag"),
            None => self.malformed("unexpected end of input"),
        }
    }

    /// Returns the bytes before `delimiter` and steps past it.
    fn read_until(&mut self, delimiter: u8) -> Result<&'a [u8], BencodeError> {
        let data = self.data;
        let rest = &data[self.position..];
        let Some(offset) = rest.iter().position(|&b| b == delimiter) else {
            return self.malformed("missing delimiter");
        };
        let field = &rest[..offset];
        self.position += offset + 1;
        Ok(field)
    }

    fn read_integer(&mut self) -> Result<Value, BencodeError> {
        self.position += 1; // 'i'
        let start = self.position;
        let digits = self.read_until(b'e')?;
        let parsed = std::str::from_utf8(digits)
            .ok()
            .filter(|s| !s.is_empty())
            .and_then(|s| s.parse::<i64>().ok());

        match parsed {
            Some(value) => Ok(Value::Integer(value)),
            None => Err(BencodeError::Malformed {
                position: start,
                reason: "invalid integer",
            }),
        }
    }

    fn read_bytes(&mut self) -> Result<Bytes, BencodeError> {
        let start = self.position;
        let digits = self.read_until(b':')?;
        let length = std::str::from_utf8(digits)
            .ok()
            .filter(|s| s.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|s| s.parse::<usize>().ok());

        let Some(length) = length else {
            return Err(BencodeError::Malformed {
                position: start,
                reason: "invalid string length",
            });
        };

        let end = match self.position.checked_add(length) {
            Some(end) if end <= self.data.len() => end,
            _ => return self.malformed("string runs past end of input"),
        };

        let bytes = Bytes::copy_from_slice(&self.data[self.position..end]);
        self.position = end;
        Ok(bytes)
    }

    fn read_list(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.position += 1; // 'l'
        let mut list = Vec::new();
        loop {
            match self.peek() {
                Some(b'e') => {
                    self.position += 1;
                    return Ok(Value::List(list));
                }
                Some(_) => list.push(self.read_value(depth + 1)?),
                None => return self.malformed("unterminated list"),
            }
        }
    }

    fn read_dict(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.position += 1; // 'd'
        let mut dict = Dict::new();
        loop {
            match self.peek() {
                Some(b'e') => {
                    self.position += 1;
                    return Ok(Value::Dict(dict));
                }
                Some(b'0'..=b'9') => {
                    let key = self.read_bytes()?;
                    let value = self.read_value(depth + 1)?;
                    dict.insert(key, value);
                }
                Some(_) => return self.malformed("dictionary key must be a string"),
                None => return self.malformed("unterminated dictionary"),
            }
        }
    }
}

/// Encodes a value. Dictionaries are written in insertion order.
pub fn encode(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    encode_into(value, &mut out);
    out
}

fn encode_into(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Integer(i) => {
            out.push(b'i');
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Bytes(bytes) => encode_bytes(bytes, out),
        Value::List(list) => {
            out.push(b'l');
            for item in list {
                encode_into(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(dict) => {
            out.push(b'd');
            for (key, item) in dict.iter() {
                encode_bytes(key, out);
                encode_into(item, out);
            }
            out.push(b'e');
        }
    }
}

fn encode_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    out.extend_from_slice(bytes.len().to_string().as_bytes());
    out.push(b':');
    out.extend_from_slice(bytes);
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            any::<i64>().prop_map(Value::Integer),
            proptest::collection::vec(any::<u8>(), 0..32)
                .prop_map(|bytes| Value::Bytes(Bytes::from(bytes))),
        ];
        leaf.prop_recursive(4, 64, 8, |inner| {
            prop_oneof![
                proptest::collection::vec(inner.clone(), 0..8).prop_map(Value::List),
                proptest::collection::vec((proptest::collection::vec(any::<u8>(), 0..8), inner), 0..8)
                    .prop_map(|entries| {
                        let mut dict = Dict::new();
                        for (key, value) in entries {
                            dict.insert(Bytes::from(key), value);
                        }
                        Value::Dict(dict)
                    }),
            ]
        })
    }

    proptest! {
        #[test]
        fn test_encode_decode_roundtrip(value in arb_value()) {
            let encoded = encode(&value);
            let decoded = decode_prefix(&encoded, 0).unwrap();
            prop_assert_eq!(decoded.consumed, encoded.len());
            prop_assert_eq!(decoded.value, value);
        }
    }

    #[test]
    fn test_decode_scalars() {
        assert_eq!(decode(b"i42e").unwrap(), Value::Integer(42));
        assert_eq!(decode(b"i-7e").unwrap(), Value::Integer(-7));
        assert_eq!(decode(b"4:spam").unwrap().as_str(), Some("spam"));
        assert_eq!(decode(b"0:").unwrap().as_bytes(), Some(&b""[..]));
    }

    #[test]
    fn test_decode_prefix_embedded_at_offset() {
        let mut buffer = b"XXXX".to_vec();
        buffer.extend_from_slice(b"d8:msg_typei1e5:piecei0ee");
        buffer.extend_from_slice(&[0xde, 0xad, b'e', b'i']);

        let decoded = decode_prefix(&buffer, 4).unwrap();
        assert_eq!(decoded.consumed, 25);

        let dict = decoded.value.as_dict().unwrap();
        assert_eq!(dict.get(b"msg_type").and_then(Value::as_integer), Some(1));
        assert_eq!(dict.get(b"piece").and_then(Value::as_integer), Some(0));
        assert_eq!(&buffer[4 + decoded.consumed..], &[0xde, 0xad, b'e', b'i']);
    }

    #[test]
    fn test_dict_preserves_first_seen_order_and_last_write_wins() {
        let value = decode(b"d1:bi1e1:ai2e1:bi3ee").unwrap();
        let dict = value.as_dict().unwrap();

        let keys: Vec<&[u8]> = dict.iter().map(|(k, _)| k.as_ref()).collect();
        assert_eq!(keys, vec![&b"b"[..], &b"a"[..]]);
        assert_eq!(dict.get(b"b").and_then(Value::as_integer), Some(3));
        assert_eq!(dict.len(), 2);
    }

    #[test]
    fn test_encode_uses_insertion_order() {
        let mut inner = Dict::new();
        inner.insert("ut_metadata", Value::from(1));
        let mut outer = Dict::new();
        inner.insert("ut_pex", Value::from(2));
        outer.insert("m", Value::from(inner));
        outer.insert("metadata_size", Value::from(31235));

        assert_eq!(
            encode(&Value::from(outer)),
            b"d1:md11:ut_metadatai1e6:ut_pexi2ee13:metadata_sizei31235ee".to_vec()
        );
    }

    #[test]
    fn test_decode_rejects_malformed_input() {
        let cases: [&[u8]; 10] = [
            b"",
            b"x",
            b"i42",
            b"ie",
            b"iabce",
            b"5:abc",
            b"3abc",
            b"l i1e",
            b"d3:key",
            b"di1ei2ee",
        ];

        for case in cases {
            assert!(
                matches!(decode(case), Err(BencodeError::Malformed { .. })),
                "expected failure for {:?}",
                String::from_utf8_lossy(case)
            );
        }
    }

    #[test]
    fn test_decode_rejects_excessive_nesting() {
        let mut data = vec![b'l'; MAX_DEPTH + 2];
        data.extend(std::iter::repeat_n(b'e', MAX_DEPTH + 2));
        assert!(decode(&data).is_err());
    }

    #[test]
    fn test_string_length_never_reads_past_buffer() {
        let result = decode(b"99999999999999999999999:x");
        assert!(result.is_err());
    }
}
