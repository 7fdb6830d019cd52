use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::ParseErrorKind;

const CRLF: &[u8] = b"\r\n";

/// One RESP2 value, client- or server-originated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    /// A null bulk string (`$-1`) or null array (`*-1`).
    Null,
    SimpleString(Bytes),
    Error(String),
    Integer(i64),
    /// `None` and `Some(empty)` both encode as the empty bulk `$0\r\n\r\n`;
    /// the distinction only matters on the construction side.
    BulkString(Option<Bytes>),
    Array(Vec<RespValue>),
}

impl RespValue {
    pub fn simple_string(s: impl AsRef<[u8]>) -> Self {
        RespValue::SimpleString(Bytes::copy_from_slice(s.as_ref()))
    }

    pub fn bulk_string(s: impl AsRef<[u8]>) -> Self {
        RespValue::BulkString(Some(Bytes::copy_from_slice(s.as_ref())))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RespValue::Null)
    }

    /// The raw bytes of a simple or bulk string, if this is one.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            RespValue::SimpleString(b) => Some(b.as_ref()),
            RespValue::BulkString(Some(b)) => Some(b.as_ref()),
            _ => None,
        }
    }
}

/// Serialize `value` onto the tail of `out` following the RESP2 grammar.
///
/// Infallible: every `RespValue` has exactly one wire form. Note the two
/// null-ish bulk forms: `BulkString(None)` is the *empty* bulk
/// `$0\r\n\r\n`, while `Null` is the null bulk `$-1\r\n`.
pub fn encode(value: &RespValue, out: &mut BytesMut) {
    match value {
        RespValue::SimpleString(b) => {
            out.extend_from_slice(b"+");
            out.extend_from_slice(b);
            out.extend_from_slice(CRLF);
        }
        RespValue::Error(m) => {
            out.extend_from_slice(b"-");
            out.extend_from_slice(m.as_bytes());
            out.extend_from_slice(CRLF);
        }
        RespValue::Integer(n) => {
            out.extend_from_slice(format!(":{n}\r\n").as_bytes());
        }
        RespValue::BulkString(Some(b)) => {
            out.extend_from_slice(format!("${}\r\n", b.len()).as_bytes());
            out.extend_from_slice(b);
            out.extend_from_slice(CRLF);
        }
        RespValue::BulkString(None) => {
            out.extend_from_slice(b"$0\r\n\r\n");
        }
        RespValue::Null => {
            out.extend_from_slice(b"$-1\r\n");
        }
        RespValue::Array(items) => {
            out.extend_from_slice(format!("*{}\r\n", items.len()).as_bytes());
            for item in items {
                encode(item, out);
            }
        }
    }
}

/// Encode a Redis command as a RESP array of bulk strings.
///
/// Redis expects every client-to-server message in this form; the client
/// never emits inline commands.
pub fn encode_command(parts: &[Bytes]) -> BytesMut {
    let mut out = BytesMut::new();
    out.extend_from_slice(format!("*{}\r\n", parts.len()).as_bytes());
    for p in parts {
        out.extend_from_slice(format!("${}\r\n", p.len()).as_bytes());
        out.extend_from_slice(p);
        out.extend_from_slice(CRLF);
    }
    out
}

/// Try to decode one complete frame from the front of `buf`.
///
/// On success the frame's bytes are consumed from `buf`. When the buffer
/// holds only part of a frame, returns `Ok(None)` and `buf` is untouched —
/// the parse runs on a scratch cursor and commits only on a whole frame,
/// so a failed or partial parse never moves the read position.
pub fn decode(buf: &mut BytesMut) -> Result<Option<RespValue>, ParseErrorKind> {
    let mut pos = 0usize;
    match parse_value(buf, &mut pos)? {
        Some(value) => {
            buf.advance(pos);
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

fn parse_value(input: &[u8], pos: &mut usize) -> Result<Option<RespValue>, ParseErrorKind> {
    let Some(&token) = input.get(*pos) else {
        return Ok(None);
    };
    *pos += 1;

    match token {
        b'+' => {
            let Some(line) = take_line(input, pos) else {
                return Ok(None);
            };
            Ok(Some(RespValue::SimpleString(Bytes::copy_from_slice(line))))
        }
        b'-' => {
            let Some(line) = take_line(input, pos) else {
                return Ok(None);
            };
            Ok(Some(RespValue::Error(
                String::from_utf8_lossy(line).into_owned(),
            )))
        }
        b':' => {
            let Some(line) = take_line(input, pos) else {
                return Ok(None);
            };
            Ok(Some(RespValue::Integer(parse_decimal(line)?)))
        }
        b'$' => parse_bulk_string(input, pos),
        b'*' => parse_array(input, pos),
        other => Err(ParseErrorKind::InvalidToken(other)),
    }
}

fn parse_bulk_string(input: &[u8], pos: &mut usize) -> Result<Option<RespValue>, ParseErrorKind> {
    let Some(line) = take_line(input, pos) else {
        return Ok(None);
    };
    let size = parse_decimal(line)?;
    if size == -1 {
        return Ok(Some(RespValue::Null));
    }
    if size < 0 {
        return Err(ParseErrorKind::InvalidBulkStringSize(size));
    }

    let size = size as usize;
    if input.len() < *pos + size + CRLF.len() {
        return Ok(None);
    }
    let payload = &input[*pos..*pos + size];
    if &input[*pos + size..*pos + size + CRLF.len()] != CRLF {
        return Err(ParseErrorKind::BulkStringSizeMismatch);
    }
    *pos += size + CRLF.len();
    Ok(Some(RespValue::BulkString(Some(Bytes::copy_from_slice(
        payload,
    )))))
}

fn parse_array(input: &[u8], pos: &mut usize) -> Result<Option<RespValue>, ParseErrorKind> {
    let Some(line) = take_line(input, pos) else {
        return Ok(None);
    };
    let size = parse_decimal(line)?;
    if size == -1 {
        return Ok(Some(RespValue::Null));
    }
    if size < 0 {
        return Err(ParseErrorKind::InvalidBulkStringSize(size));
    }

    let mut items = Vec::with_capacity((size as usize).min(1024));
    for _ in 0..size {
        // a failed or incomplete child bubbles up without committing
        match parse_value(input, pos)? {
            Some(item) => items.push(item),
            None => return Ok(None),
        }
    }
    Ok(Some(RespValue::Array(items)))
}

/// Take the bytes up to the next `\n` (exclusive), stripping a preceding
/// `\r`. Returns `None` when no newline has arrived yet.
fn take_line<'a>(input: &'a [u8], pos: &mut usize) -> Option<&'a [u8]> {
    let start = *pos;
    let nl = input[start..].iter().position(|&b| b == b'\n')? + start;
    *pos = nl + 1;
    let mut line = &input[start..nl];
    if let [head @ .., b'\r'] = line {
        line = head;
    }
    Some(line)
}

fn parse_decimal(line: &[u8]) -> Result<i64, ParseErrorKind> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(ParseErrorKind::InvalidIntegerFormat)
}

/// Read exactly one RESP frame from `read`, buffering partial input in
/// `buf`.
///
/// Returns `Ok(None)` on clean EOF.
pub(crate) async fn read_frame<R>(
    read: &mut R,
    buf: &mut BytesMut,
) -> crate::Result<Option<RespValue>>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(frame) = decode(buf)? {
            return Ok(Some(frame));
        }
        let n = read.read_buf(buf).await?;
        if n == 0 {
            return Ok(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(value: &RespValue) -> BytesMut {
        let mut out = BytesMut::new();
        encode(value, &mut out);
        out
    }

    fn decode_all(bytes: &[u8]) -> Vec<RespValue> {
        let mut buf = BytesMut::from(bytes);
        let mut out = Vec::new();
        while let Some(v) = decode(&mut buf).unwrap() {
            out.push(v);
        }
        assert!(buf.is_empty(), "leftover bytes: {buf:?}");
        out
    }

    #[test]
    fn encodes_every_variant() {
        assert_eq!(&encoded(&RespValue::simple_string("OK"))[..], b"+OK\r\n");
        assert_eq!(
            &encoded(&RespValue::Error("ERR nope".into()))[..],
            b"-ERR nope\r\n"
        );
        assert_eq!(&encoded(&RespValue::Integer(-42))[..], b":-42\r\n");
        assert_eq!(
            &encoded(&RespValue::bulk_string("hello"))[..],
            b"$5\r\nhello\r\n"
        );
        assert_eq!(&encoded(&RespValue::BulkString(None))[..], b"$0\r\n\r\n");
        assert_eq!(&encoded(&RespValue::Null)[..], b"$-1\r\n");
        assert_eq!(
            &encoded(&RespValue::Array(vec![
                RespValue::Integer(1),
                RespValue::bulk_string("a"),
            ]))[..],
            b"*2\r\n:1\r\n$1\r\na\r\n"
        );
    }

    #[test]
    fn encode_command_builds_bulk_array() {
        let parts = [Bytes::from_static(b"SET"), Bytes::from_static(b"k")];
        assert_eq!(&encode_command(&parts)[..], b"*2\r\n$3\r\nSET\r\n$1\r\nk\r\n");
    }

    #[test]
    fn round_trips_consume_the_whole_buffer() {
        let values = [
            RespValue::simple_string("PONG"),
            RespValue::Error("WRONGTYPE".into()),
            RespValue::Integer(i64::MIN),
            RespValue::bulk_string(b"\x00\xff binary \r\n ok"),
            RespValue::bulk_string(""),
            RespValue::Null,
            RespValue::Array(vec![
                RespValue::Array(vec![RespValue::Null, RespValue::Integer(0)]),
                RespValue::bulk_string("nested"),
            ]),
            RespValue::Array(vec![]),
        ];
        for value in values {
            let mut buf = encoded(&value);
            let decoded = decode(&mut buf).unwrap().expect("complete frame");
            assert_eq!(decoded, value);
            assert!(buf.is_empty());
        }
    }

    #[test]
    fn empty_bulk_decodes_as_some_empty_not_null() {
        let mut buf = BytesMut::from(&b"$0\r\n\r\n"[..]);
        let v = decode(&mut buf).unwrap().unwrap();
        assert_eq!(v, RespValue::BulkString(Some(Bytes::new())));
        assert!(!v.is_null());

        let mut buf = BytesMut::from(&b"$-1\r\n"[..]);
        assert!(decode(&mut buf).unwrap().unwrap().is_null());
    }

    #[test]
    fn null_array_decodes_as_null() {
        let mut buf = BytesMut::from(&b"*-1\r\n"[..]);
        assert_eq!(decode(&mut buf).unwrap(), Some(RespValue::Null));
    }

    #[test]
    fn every_strict_prefix_yields_nothing_and_keeps_the_cursor() {
        let value = RespValue::Array(vec![
            RespValue::bulk_string("subscribe"),
            RespValue::bulk_string("foo"),
            RespValue::Integer(1),
        ]);
        let full = encoded(&value);
        for cut in 0..full.len() {
            let mut buf = BytesMut::from(&full[..cut]);
            assert_eq!(decode(&mut buf).unwrap(), None, "prefix of {cut} bytes");
            assert_eq!(buf.len(), cut, "cursor moved on a partial frame");
        }
    }

    #[test]
    fn pipelined_frames_decode_in_order() {
        let frames = decode_all(b"+OK\r\n$1\r\nv\r\n:7\r\n");
        assert_eq!(
            frames,
            vec![
                RespValue::simple_string("OK"),
                RespValue::bulk_string("v"),
                RespValue::Integer(7),
            ]
        );
    }

    #[test]
    fn simple_string_terminates_at_first_newline() {
        // a bare \n terminates too; the preceding \r is stripped when present
        let mut buf = BytesMut::from(&b"+PONG\n"[..]);
        assert_eq!(
            decode(&mut buf).unwrap(),
            Some(RespValue::simple_string("PONG"))
        );
    }

    #[test]
    fn rejects_unknown_leading_token() {
        let mut buf = BytesMut::from(&b"!boom\r\n"[..]);
        assert_eq!(
            decode(&mut buf).unwrap_err(),
            ParseErrorKind::InvalidToken(b'!')
        );
    }

    #[test]
    fn rejects_negative_bulk_sizes_other_than_null() {
        let mut buf = BytesMut::from(&b"$-2\r\nxx\r\n"[..]);
        assert_eq!(
            decode(&mut buf).unwrap_err(),
            ParseErrorKind::InvalidBulkStringSize(-2)
        );
    }

    #[test]
    fn rejects_bulk_payload_without_terminator() {
        // declared size 3, but the terminator is not where it should be
        let mut buf = BytesMut::from(&b"$3\r\nabcd\r\n"[..]);
        assert_eq!(
            decode(&mut buf).unwrap_err(),
            ParseErrorKind::BulkStringSizeMismatch
        );
    }

    #[test]
    fn rejects_non_numeric_integers() {
        let mut buf = BytesMut::from(&b":twelve\r\n"[..]);
        assert_eq!(
            decode(&mut buf).unwrap_err(),
            ParseErrorKind::InvalidIntegerFormat
        );
    }

    #[test]
    fn malformed_child_bubbles_up_without_advancing() {
        let mut buf = BytesMut::from(&b"*2\r\n:1\r\n!x\r\n"[..]);
        let before = buf.len();
        assert!(decode(&mut buf).is_err());
        assert_eq!(buf.len(), before);
    }
}
