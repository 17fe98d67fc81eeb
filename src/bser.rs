// https://facebook.github.io/watchman/docs/bser

use bytes::{Buf, BufMut};
use std::collections::BTreeMap;
use std::io::Cursor;
use thiserror::Error as ThisError;

use crate::codec::PduCodec;
use crate::error::Error;
use crate::value::Value;

static MAGIC: &[u8; 2] = b"\x00\x01";

const ARRAY: u8 = 0x00;
const OBJECT: u8 = 0x01;
const BYTESTRING: u8 = 0x02;
const INT8: u8 = 0x03;
const INT16: u8 = 0x04;
const INT32: u8 = 0x05;
const INT64: u8 = 0x06;
const REAL: u8 = 0x07;
const TRUE: u8 = 0x08;
const FALSE: u8 = 0x09;
const NULL: u8 = 0x0a;
const TEMPLATE: u8 = 0x0b;
const SKIP: u8 = 0x0c;
const UTF8STRING: u8 = 0x0d;

/// Same nesting limit serde_json applies to the JSON encoding.
const MAX_DEPTH: usize = 128;

#[derive(Debug, ThisError)]
enum ParseError {
    #[error("not enough data is available to parse an entire value")]
    Incomplete,
    #[error("invalid value type: {0:#04x}")]
    InvalidType(u8),
    #[error("{0}")]
    Other(String),
}

/// BSER v1: `00 01`, the int-encoded payload length, then a single value.
pub struct BserCodec;

impl PduCodec for BserCodec {
    fn pdu_length(&self, buf: &[u8]) -> Result<Option<usize>, Error> {
        let prefix = buf.len().min(MAGIC.len());
        if buf[..prefix] != MAGIC[..prefix] {
            return Err(Error::Framing("invalid BSER header".to_string()));
        }
        if buf.len() < MAGIC.len() {
            return Ok(None);
        }

        let mut cursor = Cursor::new(&buf[MAGIC.len()..]);
        match parse_int(&mut cursor) {
            Ok(len) if len < 0 => Err(Error::Framing(format!("negative PDU length {}", len))),
            Ok(len) => Ok(Some(MAGIC.len() + cursor.position() as usize + len as usize)),
            Err(ParseError::Incomplete) => Ok(None),
            Err(err) => Err(Error::Framing(err.to_string())),
        }
    }

    fn decode(&self, pdu: &[u8]) -> Result<Value, Error> {
        if !pdu.starts_with(MAGIC) {
            return Err(Error::Decode("invalid BSER header".to_string()));
        }

        let mut cursor = Cursor::new(&pdu[MAGIC.len()..]);
        parse_pdu(&mut cursor).map_err(|err| Error::Decode(err.to_string()))
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, Error> {
        let mut body = Vec::new();
        encode_value(&mut body, value);

        let mut pdu = Vec::with_capacity(MAGIC.len() + 9 + body.len());
        pdu.put_slice(MAGIC);
        encode_int(&mut pdu, body.len() as i64);
        pdu.put_slice(&body);

        Ok(pdu)
    }
}

fn parse_pdu(src: &mut Cursor<&[u8]>) -> Result<Value, ParseError> {
    // The length header is not always minimally encoded, so compare against what was consumed.
    let len = parse_len(src)?;
    let start = src.position() as usize;
    let value = parse_value(src, 0)?;

    let consumed = src.position() as usize - start;
    if consumed != len || src.has_remaining() {
        return Err(ParseError::Other(format!(
            "PDU length {} does not match its {} bytes of content",
            len, consumed
        )));
    }

    Ok(value)
}

fn parse_value(src: &mut Cursor<&[u8]>, depth: usize) -> Result<Value, ParseError> {
    if depth > MAX_DEPTH {
        return Err(ParseError::Other(format!(
            "nesting too deep, limit is {}",
            MAX_DEPTH
        )));
    }
    let tag = get_byte(src)?;

    match tag {
        ARRAY => {
            let len = parse_len(src)?;
            let mut items = Vec::with_capacity(len.min(src.remaining()));
            for _ in 0..len {
                items.push(parse_value(src, depth + 1)?);
            }
            Ok(Value::Array(items))
        }
        OBJECT => {
            let len = parse_len(src)?;
            let mut map = BTreeMap::new();
            for _ in 0..len {
                let key = parse_key(src, depth + 1)?;
                let value = parse_value(src, depth + 1)?;
                map.insert(key, value);
            }
            Ok(Value::Object(map))
        }
        BYTESTRING => {
            let bytes = parse_bytes(src)?;
            Ok(Value::String(String::from_utf8_lossy(bytes).into_owned()))
        }
        UTF8STRING => {
            let bytes = parse_bytes(src)?.to_vec();
            let string = String::from_utf8(bytes)
                .map_err(|_| ParseError::Other("invalid UTF-8 string".to_string()))?;
            Ok(Value::String(string))
        }
        INT8 | INT16 | INT32 | INT64 => Ok(Value::Integer(parse_int_body(src, tag)?)),
        REAL => {
            ensure(src, 8)?;
            Ok(Value::Real(src.get_f64_le()))
        }
        TRUE => Ok(Value::Bool(true)),
        FALSE => Ok(Value::Bool(false)),
        NULL => Ok(Value::Null),
        // A template is an array of objects sharing the same keys. The keys are sent once,
        // followed by the values of each row; a skip marker means the row lacks that key.
        TEMPLATE => {
            let keys = match parse_value(src, depth + 1)? {
                Value::Array(keys) => keys
                    .into_iter()
                    .map(|key| match key {
                        Value::String(key) => Ok(key),
                        other => Err(ParseError::Other(format!(
                            "template key must be a string, found {}",
                            other.type_name()
                        ))),
                    })
                    .collect::<Result<Vec<_>, _>>()?,
                other => {
                    return Err(ParseError::Other(format!(
                        "template keys must be an array, found {}",
                        other.type_name()
                    )))
                }
            };

            // Every row holds at least one byte per key, so the row count is bounded by what is
            // left of the PDU. Rows without keys would consume nothing.
            let rows = parse_len(src)?;
            if keys.is_empty() && rows > 0 {
                return Err(ParseError::Other(format!(
                    "template without keys claims {} rows",
                    rows
                )));
            }
            if !keys.is_empty() && rows > src.remaining() / keys.len() {
                return Err(ParseError::Incomplete);
            }
            let mut items = Vec::with_capacity(rows.min(src.remaining()));
            for _ in 0..rows {
                let mut row = BTreeMap::new();
                for key in &keys {
                    ensure(src, 1)?;
                    if src.chunk()[0] == SKIP {
                        src.advance(1);
                        continue;
                    }
                    row.insert(key.clone(), parse_value(src, depth + 1)?);
                }
                items.push(Value::Object(row));
            }
            Ok(Value::Array(items))
        }
        tag => Err(ParseError::InvalidType(tag)),
    }
}

fn parse_key(src: &mut Cursor<&[u8]>, depth: usize) -> Result<String, ParseError> {
    match parse_value(src, depth)? {
        Value::String(key) => Ok(key),
        other => Err(ParseError::Other(format!(
            "object key must be a string, found {}",
            other.type_name()
        ))),
    }
}

fn parse_bytes<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], ParseError> {
    let len = parse_len(src)?;
    ensure(src, len)?;

    let start = src.position() as usize;
    src.advance(len);

    Ok(&src.get_ref()[start..start + len])
}

fn parse_len(src: &mut Cursor<&[u8]>) -> Result<usize, ParseError> {
    let len = parse_int(src)?;
    usize::try_from(len).map_err(|_| ParseError::Other(format!("negative length {}", len)))
}

fn parse_int(src: &mut Cursor<&[u8]>) -> Result<i64, ParseError> {
    let tag = get_byte(src)?;
    parse_int_body(src, tag)
}

fn parse_int_body(src: &mut Cursor<&[u8]>, tag: u8) -> Result<i64, ParseError> {
    match tag {
        INT8 => {
            ensure(src, 1)?;
            Ok(i64::from(src.get_i8()))
        }
        INT16 => {
            ensure(src, 2)?;
            Ok(i64::from(src.get_i16_le()))
        }
        INT32 => {
            ensure(src, 4)?;
            Ok(i64::from(src.get_i32_le()))
        }
        INT64 => {
            ensure(src, 8)?;
            Ok(src.get_i64_le())
        }
        tag => Err(ParseError::InvalidType(tag)),
    }
}

fn get_byte(src: &mut Cursor<&[u8]>) -> Result<u8, ParseError> {
    ensure(src, 1)?;
    Ok(src.get_u8())
}

fn ensure(src: &Cursor<&[u8]>, n: usize) -> Result<(), ParseError> {
    if src.remaining() < n {
        return Err(ParseError::Incomplete);
    }
    Ok(())
}

fn encode_int(dst: &mut Vec<u8>, n: i64) {
    if let Ok(n) = i8::try_from(n) {
        dst.put_u8(INT8);
        dst.put_i8(n);
    } else if let Ok(n) = i16::try_from(n) {
        dst.put_u8(INT16);
        dst.put_i16_le(n);
    } else if let Ok(n) = i32::try_from(n) {
        dst.put_u8(INT32);
        dst.put_i32_le(n);
    } else {
        dst.put_u8(INT64);
        dst.put_i64_le(n);
    }
}

fn encode_string(dst: &mut Vec<u8>, s: &str) {
    dst.put_u8(BYTESTRING);
    encode_int(dst, s.len() as i64);
    dst.put_slice(s.as_bytes());
}

fn encode_value(dst: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => dst.put_u8(NULL),
        Value::Bool(true) => dst.put_u8(TRUE),
        Value::Bool(false) => dst.put_u8(FALSE),
        Value::Integer(i) => encode_int(dst, *i),
        Value::Real(r) => {
            dst.put_u8(REAL);
            dst.put_f64_le(*r);
        }
        Value::String(s) => encode_string(dst, s),
        Value::Array(items) => {
            dst.put_u8(ARRAY);
            encode_int(dst, items.len() as i64);
            for item in items {
                encode_value(dst, item);
            }
        }
        Value::Object(map) => {
            dst.put_u8(OBJECT);
            encode_int(dst, map.len() as i64);
            for (key, item) in map {
                encode_string(dst, key);
                encode_value(dst, item);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pdu(body: &[u8]) -> Vec<u8> {
        let mut pdu = MAGIC.to_vec();
        encode_int(&mut pdu, body.len() as i64);
        pdu.extend_from_slice(body);
        pdu
    }

    #[test]
    fn encode_array_of_string_and_int() {
        let value = Value::Array(vec![Value::from("Hello"), Value::from(42)]);

        let encoded = BserCodec.encode(&value).unwrap();

        assert_eq!(
            encoded,
            b"\x00\x01\x03\x0d\x00\x03\x02\x02\x03\x05Hello\x03\x2a".to_vec()
        );
    }

    #[test]
    fn decode_array_of_string_and_int() {
        let data = b"\x00\x01\x03\x0d\x00\x03\x02\x02\x03\x05Hello\x03\x2a";

        let value = BserCodec.decode(data).unwrap();

        assert_eq!(
            value,
            Value::Array(vec![Value::from("Hello"), Value::from(42)])
        );
    }

    #[test]
    fn pdu_length_needs_complete_header() {
        assert_eq!(BserCodec.pdu_length(b"").unwrap(), None);
        assert_eq!(BserCodec.pdu_length(b"\x00").unwrap(), None);
        assert_eq!(BserCodec.pdu_length(b"\x00\x01").unwrap(), None);
        assert_eq!(BserCodec.pdu_length(b"\x00\x01\x04\x00").unwrap(), None);
    }

    #[test]
    fn pdu_length_ignores_trailing_data() {
        let data = b"\x00\x01\x03\x01\x0a\x00\x01\x03";

        assert_eq!(BserCodec.pdu_length(data).unwrap(), Some(5));
    }

    #[test]
    fn pdu_length_wide_header() {
        let data = b"\x00\x01\x05\x00\x01\x00\x00";

        assert_eq!(BserCodec.pdu_length(data).unwrap(), Some(2 + 5 + 256));
    }

    #[test]
    fn pdu_length_bad_magic() {
        assert!(matches!(
            BserCodec.pdu_length(b"\x01"),
            Err(Error::Framing(_))
        ));
        assert!(matches!(
            BserCodec.pdu_length(b"\x00\x02\x03\x01"),
            Err(Error::Framing(_))
        ));
    }

    #[test]
    fn pdu_length_bad_int_type() {
        assert!(matches!(
            BserCodec.pdu_length(b"\x00\x01\x0a\x01"),
            Err(Error::Framing(_))
        ));
    }

    #[test]
    fn pdu_length_negative() {
        assert!(matches!(
            BserCodec.pdu_length(b"\x00\x01\x03\xff"),
            Err(Error::Framing(_))
        ));
    }

    #[test]
    fn decode_object() {
        let value = Value::object([
            ("version", Value::from("2024.01.01.00")),
            ("capabilities", Value::object([("relative_root", true)])),
            ("clock", Value::from(1_700_000_000_000i64)),
            ("ratio", Value::from(0.5)),
            ("missing", Value::Null),
        ]);

        let encoded = BserCodec.encode(&value).unwrap();
        let decoded = BserCodec.decode(&encoded).unwrap();

        assert_eq!(decoded, value);
    }

    #[test]
    fn decode_template() {
        let body = b"\x0b\
            \x00\x03\x02\x02\x03\x04name\x02\x03\x03age\
            \x03\x03\
            \x02\x03\x04fred\x03\x14\
            \x02\x03\x04pete\x03\x1e\
            \x0c\x03\x19";

        let value = BserCodec.decode(&pdu(body)).unwrap();

        assert_eq!(
            value,
            Value::Array(vec![
                Value::object([("name", Value::from("fred")), ("age", Value::from(20))]),
                Value::object([("name", Value::from("pete")), ("age", Value::from(30))]),
                Value::object([("age", 25)]),
            ])
        );
    }

    #[test]
    fn decode_template_without_keys() {
        let empty = BserCodec.decode(&pdu(b"\x0b\x00\x03\x00\x03\x00")).unwrap();
        assert_eq!(empty, Value::Array(vec![]));

        let result = BserCodec.decode(&pdu(b"\x0b\x00\x03\x00\x05\x80\xf0\xfa\x02"));
        assert!(matches!(result, Err(Error::Decode(_))));
    }

    #[test]
    fn decode_template_rows_beyond_data() {
        let body = b"\x0b\x00\x03\x01\x02\x03\x01a\x06\xff\xff\xff\xff\xff\xff\xff\x7f\x0a";

        let result = BserCodec.decode(&pdu(body));

        assert!(matches!(result, Err(Error::Decode(_))));
    }

    #[test]
    fn decode_nesting_limit() {
        let nested = |depth: usize| {
            let mut body = b"\x00\x03\x01".repeat(depth);
            body.push(NULL);
            pdu(&body)
        };

        assert!(BserCodec.decode(&nested(MAX_DEPTH)).is_ok());

        let result = BserCodec.decode(&nested(200_000));
        assert!(matches!(result, Err(Error::Decode(msg)) if msg.contains("nesting too deep")));
    }

    #[test]
    fn decode_utf8_string() {
        let value = BserCodec.decode(&pdu(b"\x0d\x03\x02hi")).unwrap();

        assert_eq!(value, Value::from("hi"));
    }

    #[test]
    fn decode_invalid_utf8_string() {
        let result = BserCodec.decode(&pdu(b"\x0d\x03\x02\xff\xfe"));

        assert!(matches!(result, Err(Error::Decode(_))));
    }

    #[test]
    fn decode_bytestring_is_lossy() {
        let value = BserCodec.decode(&pdu(b"\x02\x03\x02a\xff")).unwrap();

        assert_eq!(value, Value::from("a\u{fffd}"));
    }

    #[test]
    fn decode_truncated_value() {
        let result = BserCodec.decode(b"\x00\x01\x03\x05\x00\x03\x02\x08");

        assert!(matches!(result, Err(Error::Decode(_))));
    }

    #[test]
    fn decode_invalid_type() {
        let result = BserCodec.decode(&pdu(b"\x42"));

        assert!(matches!(result, Err(Error::Decode(_))));
    }

    #[test]
    fn decode_wide_length_header() {
        let value = BserCodec.decode(b"\x00\x01\x05\x01\x00\x00\x00\x08").unwrap();

        assert_eq!(value, Value::Bool(true));
    }

    #[test]
    fn decode_length_mismatch() {
        let result = BserCodec.decode(b"\x00\x01\x03\x02\x0a\x0a");

        assert!(matches!(result, Err(Error::Decode(_))));
    }

    #[test]
    fn encode_integer_widths() {
        let cases: [(i64, &[u8]); 5] = [
            (1, b"\x03\x01"),
            (-1, b"\x03\xff"),
            (300, b"\x04\x2c\x01"),
            (70_000, b"\x05\x70\x11\x01\x00"),
            (1 << 40, b"\x06\x00\x00\x00\x00\x00\x01\x00\x00"),
        ];

        for (n, expected) in cases {
            let mut dst = Vec::new();
            encode_int(&mut dst, n);
            assert_eq!(dst, expected.to_vec(), "encoding {}", n);
        }
    }
}
