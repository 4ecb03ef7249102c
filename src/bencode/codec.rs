use std::collections::BTreeMap;

use bytes::Bytes;

use super::error::BencodeError;
use super::value::Value;

const MAX_DEPTH: usize = 64;

/// Decodes exactly one bencode value from `data`.
///
/// Trailing bytes after the value are an error; use [`value_len`] when
/// the value is followed by out-of-band payload (as in ut_metadata data
/// messages).
pub fn from_bytes(data: &[u8]) -> Result<Value, BencodeError> {
    let mut cur = Cursor { data, pos: 0 };
    let value = cur.value(0)?;
    if cur.pos != data.len() {
        return Err(BencodeError::TrailingData);
    }
    Ok(value)
}

/// Returns the encoded length of the first complete value in `data`.
pub fn value_len(data: &[u8]) -> Result<usize, BencodeError> {
    let mut cur = Cursor { data, pos: 0 };
    cur.value(0)?;
    Ok(cur.pos)
}

/// Encodes a value to its canonical byte representation.
pub fn to_bytes(value: &Value) -> Vec<u8> {
    let mut out = Vec::new();
    render(value, &mut out);
    out
}

fn render(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Int(i) => {
            out.push(b'i');
            out.extend_from_slice(i.to_string().as_bytes());
            out.push(b'e');
        }
        Value::Str(b) => {
            out.extend_from_slice(b.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(b);
        }
        Value::List(items) => {
            out.push(b'l');
            for item in items {
                render(item, out);
            }
            out.push(b'e');
        }
        Value::Dict(map) => {
            out.push(b'd');
            for (key, val) in map {
                render(&Value::Str(key.clone()), out);
                render(val, out);
            }
            out.push(b'e');
        }
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn peek(&self) -> Result<u8, BencodeError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(BencodeError::Truncated)
    }

    fn value(&mut self, depth: usize) -> Result<Value, BencodeError> {
        if depth > MAX_DEPTH {
            return Err(BencodeError::TooDeep);
        }
        match self.peek()? {
            b'i' => self.integer(),
            b'l' => self.list(depth),
            b'd' => self.dict(depth),
            b'0'..=b'9' => self.string(),
            other => Err(BencodeError::UnexpectedByte(other, self.pos)),
        }
    }

    fn integer(&mut self) -> Result<Value, BencodeError> {
        self.pos += 1;
        let start = self.pos;
        while self.peek()? != b'e' {
            self.pos += 1;
        }
        let digits = &self.data[start..self.pos];
        self.pos += 1;

        let text = std::str::from_utf8(digits).map_err(|_| BencodeError::BadInteger)?;
        if text.is_empty() || text == "-" {
            return Err(BencodeError::BadInteger);
        }
        // "i-0e" and redundant leading zeros are not canonical.
        if text.starts_with("-0") || (text.len() > 1 && text.starts_with('0')) {
            return Err(BencodeError::BadInteger);
        }
        text.parse()
            .map(Value::Int)
            .map_err(|_| BencodeError::BadInteger)
    }

    fn string(&mut self) -> Result<Value, BencodeError> {
        let start = self.pos;
        while self.peek()? != b':' {
            if !self.data[self.pos].is_ascii_digit() {
                return Err(BencodeError::BadLength);
            }
            self.pos += 1;
        }
        let len: usize = std::str::from_utf8(&self.data[start..self.pos])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or(BencodeError::BadLength)?;
        self.pos += 1;

        let end = self.pos.checked_add(len).ok_or(BencodeError::BadLength)?;
        if end > self.data.len() {
            return Err(BencodeError::Truncated);
        }
        let bytes = Bytes::copy_from_slice(&self.data[self.pos..end]);
        self.pos = end;
        Ok(Value::Str(bytes))
    }

    fn list(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.value(depth + 1)?);
        }
        self.pos += 1;
        Ok(Value::List(items))
    }

    fn dict(&mut self, depth: usize) -> Result<Value, BencodeError> {
        self.pos += 1;
        let mut map = BTreeMap::new();
        while self.peek()? != b'e' {
            let key = match self.value(depth + 1)? {
                Value::Str(b) => b,
                _ => return Err(BencodeError::NonStringKey),
            };
            let val = self.value(depth + 1)?;
            map.insert(key, val);
        }
        self.pos += 1;
        Ok(Value::Dict(map))
    }
}
