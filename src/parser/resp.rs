//! The wire codec: a self-delimiting, typed message format built from five prefix tokens,
//! each terminated by CRLF. Decoding is streaming — the caller may hand us a buffer that
//! contains zero, one, or several concatenated messages, and may end mid-message.

use crate::common::{CR, CRLF, LF};
use std::fmt;

pub type Result<T> = std::result::Result<T, ParseError>;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("containing RESP message is malformed: {0}")]
    Invalid(String),
    #[error("need more data to correctly process message")]
    Incomplete,
}

impl From<std::num::ParseIntError> for ParseError {
    fn from(value: std::num::ParseIntError) -> Self {
        ParseError::Invalid(value.to_string())
    }
}

impl From<std::str::Utf8Error> for ParseError {
    fn from(value: std::str::Utf8Error) -> Self {
        ParseError::Invalid(value.to_string())
    }
}

/// A decoded RESP value. Arrays decode recursively into a real tree rather than being
/// flattened, so nested structure (and the distinction between a null bulk and a null
/// array) survives the round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Vec<u8>),
    NullBulk,
    Array(Vec<Value>),
    NullArray,
}

impl Value {
    pub fn bulk(data: impl Into<Vec<u8>>) -> Value {
        Value::Bulk(data.into())
    }

    pub fn simple(text: impl Into<String>) -> Value {
        Value::Simple(text.into())
    }

    pub fn error(text: impl Into<String>) -> Value {
        Value::Error(text.into())
    }

    pub fn array(values: impl IntoIterator<Item = Value>) -> Value {
        Value::Array(values.into_iter().collect())
    }

    /// Convenience constructor for the common "command propagated as an array of bulk
    /// strings" shape.
    pub fn bulk_array<I, S>(items: I) -> Value
    where
        I: IntoIterator<Item = S>,
        S: Into<Vec<u8>>,
    {
        Value::Array(items.into_iter().map(Value::bulk).collect())
    }

    pub fn as_bulk(&self) -> Result<&[u8]> {
        match self {
            Value::Bulk(data) => Ok(data),
            _ => Err(ParseError::Invalid(format!(
                "expected bulk string, got {:?}",
                self
            ))),
        }
    }

    pub fn as_simple(&self) -> Result<&str> {
        match self {
            Value::Simple(data) => Ok(data),
            _ => Err(ParseError::Invalid(format!(
                "expected simple string, got {:?}",
                self
            ))),
        }
    }

    pub fn as_array(&self) -> Result<&[Value]> {
        match self {
            Value::Array(items) => Ok(items),
            _ => Err(ParseError::Invalid(format!("expected array, got {:?}", self))),
        }
    }

    /// Encode this value into its wire representation.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.encode_into(&mut buf);
        buf
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        match self {
            Value::Simple(text) => {
                buf.push(b'+');
                buf.extend_from_slice(text.as_bytes());
                buf.extend_from_slice(CRLF.as_bytes());
            }
            Value::Error(text) => {
                buf.push(b'-');
                buf.extend_from_slice(text.as_bytes());
                buf.extend_from_slice(CRLF.as_bytes());
            }
            Value::Integer(n) => {
                buf.push(b':');
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.extend_from_slice(CRLF.as_bytes());
            }
            Value::Bulk(data) => {
                buf.push(b'$');
                buf.extend_from_slice(data.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF.as_bytes());
                buf.extend_from_slice(data);
                buf.extend_from_slice(CRLF.as_bytes());
            }
            Value::NullBulk => buf.extend_from_slice(b"$-1\r\n"),
            Value::NullArray => buf.extend_from_slice(b"*-1\r\n"),
            Value::Array(items) => {
                buf.push(b'*');
                buf.extend_from_slice(items.len().to_string().as_bytes());
                buf.extend_from_slice(CRLF.as_bytes());
                for item in items {
                    item.encode_into(buf);
                }
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

pub fn find_first_crlf(message: &[u8]) -> Option<usize> {
    message.windows(2).position(|window| window == [CR, LF])
}

fn parse_signed(bytes: &[u8]) -> Result<i64> {
    Ok(std::str::from_utf8(bytes)?.parse::<i64>()?)
}

fn parse_line(message: &[u8]) -> Result<(&[u8], usize)> {
    let end = find_first_crlf(message).ok_or(ParseError::Incomplete)?;
    Ok((&message[1..end], end + 2))
}

fn decode_simple_string(message: &[u8]) -> Result<(Value, usize)> {
    let (data, len) = parse_line(message)?;
    Ok((Value::Simple(std::str::from_utf8(data)?.to_owned()), len))
}

fn decode_error(message: &[u8]) -> Result<(Value, usize)> {
    let (data, len) = parse_line(message)?;
    Ok((Value::Error(std::str::from_utf8(data)?.to_owned()), len))
}

fn decode_integer(message: &[u8]) -> Result<(Value, usize)> {
    let (data, len) = parse_line(message)?;
    Ok((Value::Integer(parse_signed(data)?), len))
}

fn decode_bulk_string(message: &[u8]) -> Result<(Value, usize)> {
    let (size_bytes, header_len) = parse_line(message)?;
    let data_size = parse_signed(size_bytes)?;
    if data_size < 0 {
        return Ok((Value::NullBulk, header_len));
    }
    let data_size = data_size as usize;
    let data_start = header_len;
    let data_end = data_start + data_size;
    if data_end + 2 > message.len() {
        return Err(ParseError::Incomplete);
    }
    if message[data_end] != CR || message[data_end + 1] != LF {
        return Err(ParseError::Invalid(
            "bulk string payload not terminated by CRLF".to_string(),
        ));
    }
    Ok((
        Value::Bulk(message[data_start..data_end].to_vec()),
        data_end + 2,
    ))
}

fn decode_array(message: &[u8]) -> Result<(Value, usize)> {
    let (count_bytes, header_len) = parse_line(message)?;
    let count = parse_signed(count_bytes)?;
    if count < 0 {
        return Ok((Value::NullArray, header_len));
    }
    let mut offset = header_len;
    let mut items = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (item, item_len) = decode(&message[offset..])?;
        items.push(item);
        offset += item_len;
    }
    Ok((Value::Array(items), offset))
}

/// Attempt to decode exactly one RESP value from the front of `buffer`.
///
/// Returns `Ok((value, bytes_consumed))` on success, `Err(ParseError::Incomplete)` if
/// `buffer` does not yet contain a full message, and any other error on malformed input.
/// Never consumes more bytes than the decoded message occupies, so the caller can slice
/// the remainder and decode again.
pub fn decode(buffer: &[u8]) -> Result<(Value, usize)> {
    match buffer.first() {
        Some(b'+') => decode_simple_string(buffer),
        Some(b'-') => decode_error(buffer),
        Some(b':') => decode_integer(buffer),
        Some(b'$') => decode_bulk_string(buffer),
        Some(b'*') => decode_array(buffer),
        Some(other) => Err(ParseError::Invalid(format!(
            "unrecognized type prefix {:?}",
            *other as char
        ))),
        None => Err(ParseError::Incomplete),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_string_decodes() {
        let message = b"+OK\r\n";
        let (value, len) = decode(message).unwrap();
        assert_eq!(len, message.len());
        assert_eq!(value, Value::Simple("OK".to_owned()));
    }

    #[test]
    fn error_decodes() {
        let message = b"-ERR bad\r\n";
        let (value, len) = decode(message).unwrap();
        assert_eq!(len, message.len());
        assert_eq!(value, Value::Error("ERR bad".to_owned()));
    }

    #[test]
    fn integer_decodes() {
        let message = b":-42\r\n";
        let (value, len) = decode(message).unwrap();
        assert_eq!(len, message.len());
        assert_eq!(value, Value::Integer(-42));
    }

    #[test]
    fn bulk_string_decodes() {
        let message = b"$5\r\nhello\r\n";
        let (value, len) = decode(message).unwrap();
        assert_eq!(len, message.len());
        assert_eq!(value, Value::Bulk(b"hello".to_vec()));
    }

    #[test]
    fn null_bulk_string_decodes() {
        let message = b"$-1\r\n";
        let (value, len) = decode(message).unwrap();
        assert_eq!(len, message.len());
        assert_eq!(value, Value::NullBulk);
    }

    #[test]
    fn null_array_decodes() {
        let message = b"*-1\r\n";
        let (value, len) = decode(message).unwrap();
        assert_eq!(len, message.len());
        assert_eq!(value, Value::NullArray);
    }

    #[test]
    fn array_decodes_as_a_tree() {
        let message = b"*2\r\n$3\r\nget\r\n$5\r\nfruit\r\n";
        let (value, len) = decode(message).unwrap();
        assert_eq!(len, message.len());
        assert_eq!(
            value,
            Value::Array(vec![
                Value::Bulk(b"get".to_vec()),
                Value::Bulk(b"fruit".to_vec()),
            ])
        );
    }

    #[test]
    fn nested_array_preserves_structure() {
        let message = b"*2\r\n*1\r\n$2\r\nok\r\n$1\r\nx\r\n";
        let (value, len) = decode(message).unwrap();
        assert_eq!(len, message.len());
        assert_eq!(
            value,
            Value::Array(vec![
                Value::Array(vec![Value::Bulk(b"ok".to_vec())]),
                Value::Bulk(b"x".to_vec()),
            ])
        );
    }

    #[test]
    fn incomplete_input_is_reported_distinctly() {
        let message = b"*2\r\n$3\r\nget\r\n$5\r\nfru";
        match decode(message) {
            Err(ParseError::Incomplete) => {}
            other => panic!("expected Incomplete, got {:?}", other),
        }
    }

    #[test]
    fn round_trip_across_every_split_point() {
        let value = Value::Array(vec![
            Value::Bulk(b"SET".to_vec()),
            Value::Bulk(b"key".to_vec()),
            Value::Integer(7),
            Value::NullBulk,
        ]);
        let encoded = value.encode();
        for split in 0..encoded.len() {
            let (first, second) = encoded.split_at(split);
            assert!(matches!(decode(first), Err(ParseError::Incomplete)));
            let (decoded, len) = decode(&[first, second].concat()).unwrap();
            assert_eq!(len, encoded.len());
            assert_eq!(decoded, value);
        }
    }

    #[test]
    fn unrecognized_prefix_is_a_protocol_error() {
        let message = b"!oops\r\n";
        assert!(matches!(decode(message), Err(ParseError::Invalid(_))));
    }
}
