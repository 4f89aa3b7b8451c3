//! Canonical bencoding (C1).
//!
//! A hand-rolled AST rather than a derive-based mapping: the descriptor
//! builder and the registry's provider-metadata canonicalization both need
//! byte-identical output across platforms given the same logical value, and
//! strict rejection of non-canonical input on decode. `BTreeMap` gives us
//! byte-ordered dictionary keys for free; everything else here is just
//! making sure encode and decode agree on what "canonical" means.

use std::collections::BTreeMap;

use crate::error::DccError;

/// A bencoded value. Dictionary keys are raw bytes, ordered lexicographically
/// by `BTreeMap<Vec<u8>, _>` — the same guarantee the spec requires of the
/// wire form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn str(s: impl Into<String>) -> Value {
        Value::Bytes(s.into().into_bytes())
    }

    pub fn dict() -> DictBuilder {
        DictBuilder(BTreeMap::new())
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_dict()?.get(key.as_bytes())
    }

    /// Encode this value in canonical bencoded form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Value::Int(i) => {
                out.push(b'i');
                out.extend_from_slice(i.to_string().as_bytes());
                out.push(b'e');
            }
            Value::Bytes(b) => {
                out.extend_from_slice(b.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(b);
            }
            Value::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_into(out);
                }
                out.push(b'e');
            }
            Value::Dict(map) => {
                out.push(b'd');
                // BTreeMap already iterates in byte-ascending key order.
                for (k, v) in map {
                    Value::Bytes(k.clone()).encode_into(out);
                    v.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }

    /// Decode bencoded bytes, rejecting anything not in canonical form:
    /// non-string dict keys, duplicate keys, out-of-order keys, integers
    /// with leading zeros or a `-0`.
    pub fn decode_strict(input: &[u8]) -> Result<Value, DccError> {
        let mut parser = Parser { buf: input, pos: 0 };
        let value = parser.parse_value()?;
        if parser.pos != input.len() {
            return Err(invalid("trailing bytes after top-level value"));
        }
        Ok(value)
    }
}

/// Small builder for assembling dictionaries without fighting `BTreeMap`
/// directly at call sites (mirrors the teacher's struct-literal ergonomics
/// for building a `Torrent`/`Info` pair).
pub struct DictBuilder(BTreeMap<Vec<u8>, Value>);

impl DictBuilder {
    pub fn insert(mut self, key: &str, value: Value) -> Self {
        self.0.insert(key.as_bytes().to_vec(), value);
        self
    }

    pub fn insert_opt(self, key: &str, value: Option<Value>) -> Self {
        match value {
            Some(v) => self.insert(key, v),
            None => self,
        }
    }

    pub fn build(self) -> Value {
        Value::Dict(self.0)
    }
}

fn invalid(message: impl Into<String>) -> DccError {
    DccError::InvalidCanonicalForm {
        message: message.into(),
    }
}

struct Parser<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Result<u8, DccError> {
        self.buf
            .get(self.pos)
            .copied()
            .ok_or_else(|| invalid("unexpected end of input"))
    }

    fn parse_value(&mut self) -> Result<Value, DccError> {
        match self.peek()? {
            b'i' => self.parse_int(),
            b'l' => self.parse_list(),
            b'd' => self.parse_dict(),
            b'0'..=b'9' => self.parse_bytes().map(Value::Bytes),
            other => Err(invalid(format!("unexpected tag byte {other:#x}"))),
        }
    }

    fn parse_int(&mut self) -> Result<Value, DccError> {
        debug_assert_eq!(self.buf[self.pos], b'i');
        self.pos += 1;
        let start = self.pos;
        while self.peek()? != b'e' {
            self.pos += 1;
        }
        let digits = &self.buf[start..self.pos];
        self.pos += 1; // consume 'e'
        let text = std::str::from_utf8(digits).map_err(|_| invalid("non-utf8 integer"))?;
        validate_canonical_int(text)?;
        text.parse::<i64>()
            .map(Value::Int)
            .map_err(|_| invalid(format!("integer out of range: {text}")))
    }

    fn parse_bytes(&mut self) -> Result<Vec<u8>, DccError> {
        let start = self.pos;
        while self.peek()? != b':' {
            self.pos += 1;
        }
        let len_digits = &self.buf[start..self.pos];
        let len_text =
            std::str::from_utf8(len_digits).map_err(|_| invalid("non-utf8 length prefix"))?;
        if len_text.len() > 1 && len_text.starts_with('0') {
            return Err(invalid("length prefix has leading zero"));
        }
        let len: usize = len_text
            .parse()
            .map_err(|_| invalid(format!("bad length prefix: {len_text}")))?;
        self.pos += 1; // consume ':'
        let end = self
            .pos
            .checked_add(len)
            .ok_or_else(|| invalid("length prefix overflow"))?;
        if end > self.buf.len() {
            return Err(invalid("byte string runs past end of input"));
        }
        let bytes = self.buf[self.pos..end].to_vec();
        self.pos = end;
        Ok(bytes)
    }

    fn parse_list(&mut self) -> Result<Value, DccError> {
        debug_assert_eq!(self.buf[self.pos], b'l');
        self.pos += 1;
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.parse_value()?);
        }
        self.pos += 1;
        Ok(Value::List(items))
    }

    fn parse_dict(&mut self) -> Result<Value, DccError> {
        debug_assert_eq!(self.buf[self.pos], b'd');
        self.pos += 1;
        let mut map = BTreeMap::new();
        let mut last_key: Option<Vec<u8>> = None;
        while self.peek()? != b'e' {
            if self.peek()? < b'0' || self.peek()? > b'9' {
                return Err(invalid("dictionary key is not a byte string"));
            }
            let key = self.parse_bytes()?;
            if let Some(prev) = &last_key {
                if key == *prev {
                    return Err(invalid("duplicate dictionary key"));
                }
                if key < *prev {
                    return Err(invalid("dictionary keys are not in canonical order"));
                }
            }
            let value = self.parse_value()?;
            last_key = Some(key.clone());
            map.insert(key, value);
        }
        self.pos += 1;
        Ok(Value::Dict(map))
    }
}

fn validate_canonical_int(text: &str) -> Result<(), DccError> {
    if text.is_empty() {
        return Err(invalid("empty integer"));
    }
    if text == "-0" {
        return Err(invalid("negative zero is not canonical"));
    }
    let digits = text.strip_prefix('-').unwrap_or(text);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid(format!("malformed integer: {text}")));
    }
    if digits.len() > 1 && digits.starts_with('0') {
        return Err(invalid("integer has leading zero"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_scalars_canonically() {
        assert_eq!(Value::Int(42).encode(), b"i42e");
        assert_eq!(Value::Int(-3).encode(), b"i-3e");
        assert_eq!(Value::str("spam").encode(), b"4:spam");
    }

    #[test]
    fn encodes_dict_in_key_order_regardless_of_insert_order() {
        let a = Value::dict()
            .insert("zebra", Value::Int(1))
            .insert("apple", Value::Int(2))
            .build();
        let b = Value::dict()
            .insert("apple", Value::Int(2))
            .insert("zebra", Value::Int(1))
            .build();
        assert_eq!(a.encode(), b.encode());
        assert_eq!(a.encode(), b"d5:applei2e5:zebrai1ee");
    }

    #[test]
    fn round_trips_through_decode_strict() {
        let v = Value::dict()
            .insert("list", Value::List(vec![Value::Int(1), Value::str("x")]))
            .insert("n", Value::Int(7))
            .build();
        let bytes = v.encode();
        let decoded = Value::decode_strict(&bytes).unwrap();
        assert_eq!(decoded, v);
    }

    #[test]
    fn rejects_leading_zero_integer() {
        let err = Value::decode_strict(b"i03e").unwrap_err();
        assert!(matches!(err, DccError::InvalidCanonicalForm { .. }));
    }

    #[test]
    fn rejects_negative_zero() {
        assert!(Value::decode_strict(b"i-0e").is_err());
    }

    #[test]
    fn rejects_out_of_order_dict_keys() {
        let err = Value::decode_strict(b"d5:zebrai1e5:applei2ee").unwrap_err();
        assert!(matches!(err, DccError::InvalidCanonicalForm { .. }));
    }

    #[test]
    fn rejects_duplicate_dict_keys() {
        assert!(Value::decode_strict(b"d1:ai1e1:ai2ee").is_err());
    }

    #[test]
    fn rejects_byte_string_overrunning_buffer() {
        assert!(Value::decode_strict(b"5:ab").is_err());
    }
}
