use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::resp::{self, RespValue};

/// A single Redis command: the keyword plus its arguments, sent on the
/// wire as one RESP array of bulk strings.
#[derive(Debug, Clone)]
pub struct Command {
    parts: Vec<Bytes>,
}

/// Shorthand constructor: `cmd("SET").arg("key").arg("value")`.
pub fn cmd(name: &str) -> Command {
    Command::new(name)
}

impl Command {
    pub fn new(name: &str) -> Self {
        Self {
            parts: vec![Bytes::copy_from_slice(name.as_bytes())],
        }
    }

    pub fn arg(mut self, arg: impl ToArg) -> Self {
        self.parts.push(arg.to_arg());
        self
    }

    pub fn args<I>(mut self, args: I) -> Self
    where
        I: IntoIterator,
        I::Item: ToArg,
    {
        self.parts.extend(args.into_iter().map(|a| a.to_arg()));
        self
    }

    /// The command keyword, uppercased. Used for the subscriber-mode gate
    /// and the per-command metrics.
    pub fn keyword_upper(&self) -> String {
        self.parts[0]
            .iter()
            .map(|b| b.to_ascii_uppercase() as char)
            .collect()
    }

    pub(crate) fn to_bytes(&self) -> BytesMut {
        resp::encode_command(&self.parts)
    }
}

/// Anything that can become one bulk-string command argument.
pub trait ToArg {
    fn to_arg(&self) -> Bytes;
}

impl ToArg for Bytes {
    fn to_arg(&self) -> Bytes {
        self.clone()
    }
}

impl ToArg for &[u8] {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl ToArg for Vec<u8> {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl ToArg for &str {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl ToArg for String {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

macro_rules! to_arg_via_display {
    ($($t:ty),*) => {
        $(impl ToArg for $t {
            fn to_arg(&self) -> Bytes {
                Bytes::from(self.to_string().into_bytes())
            }
        })*
    };
}

to_arg_via_display!(i32, i64, u32, u64, usize);

/// Conversion from a decoded reply into a caller-requested type.
///
/// Error replies never reach this trait — the command channel turns them
/// into `Error::Redis` before the promise resolves — so implementations
/// only deal with well-formed values. A shape mismatch is a per-command
/// `Error::Conversion`; the connection itself stays healthy.
pub trait FromResp: Sized {
    fn from_resp(value: RespValue) -> Result<Self>;
}

fn conversion_error(target: &'static str, value: &RespValue) -> Error {
    Error::Conversion {
        target,
        value: format!("{value:?}"),
    }
}

impl FromResp for RespValue {
    fn from_resp(value: RespValue) -> Result<Self> {
        Ok(value)
    }
}

impl FromResp for () {
    fn from_resp(_value: RespValue) -> Result<Self> {
        Ok(())
    }
}

impl FromResp for String {
    fn from_resp(value: RespValue) -> Result<Self> {
        match &value {
            RespValue::SimpleString(b) | RespValue::BulkString(Some(b)) => {
                match std::str::from_utf8(b) {
                    Ok(s) => Ok(s.to_owned()),
                    Err(_) => Err(conversion_error("String", &value)),
                }
            }
            RespValue::Integer(n) => Ok(n.to_string()),
            _ => Err(conversion_error("String", &value)),
        }
    }
}

impl FromResp for Bytes {
    fn from_resp(value: RespValue) -> Result<Self> {
        match value {
            RespValue::SimpleString(b) | RespValue::BulkString(Some(b)) => Ok(b),
            other => Err(conversion_error("Bytes", &other)),
        }
    }
}

impl FromResp for i64 {
    fn from_resp(value: RespValue) -> Result<Self> {
        match &value {
            RespValue::Integer(n) => Ok(*n),
            RespValue::SimpleString(b) | RespValue::BulkString(Some(b)) => std::str::from_utf8(b)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| conversion_error("i64", &value)),
            _ => Err(conversion_error("i64", &value)),
        }
    }
}

impl FromResp for bool {
    fn from_resp(value: RespValue) -> Result<Self> {
        match &value {
            RespValue::Integer(0) => Ok(false),
            RespValue::Integer(1) => Ok(true),
            RespValue::Null => Ok(false),
            RespValue::SimpleString(b) if b.as_ref() == b"OK" => Ok(true),
            _ => Err(conversion_error("bool", &value)),
        }
    }
}

impl<T: FromResp> FromResp for Option<T> {
    fn from_resp(value: RespValue) -> Result<Self> {
        match value {
            RespValue::Null => Ok(None),
            other => T::from_resp(other).map(Some),
        }
    }
}

impl<T: FromResp> FromResp for Vec<T> {
    fn from_resp(value: RespValue) -> Result<Self> {
        match value {
            RespValue::Array(items) => items.into_iter().map(T::from_resp).collect(),
            RespValue::Null => Ok(Vec::new()),
            other => Err(conversion_error("Vec", &other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_encode_as_bulk_arrays() {
        let bytes = cmd("SET").arg("key").arg(42i64).to_bytes();
        assert_eq!(&bytes[..], b"*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$2\r\n42\r\n");
    }

    #[test]
    fn args_extends_from_an_iterator() {
        let bytes = cmd("SUBSCRIBE").args(["a", "b"]).to_bytes();
        assert_eq!(&bytes[..], b"*3\r\n$9\r\nSUBSCRIBE\r\n$1\r\na\r\n$1\r\nb\r\n");
    }

    #[test]
    fn keyword_is_uppercased() {
        assert_eq!(cmd("get").keyword_upper(), "GET");
    }

    #[test]
    fn string_conversions() {
        let s = String::from_resp(RespValue::simple_string("PONG")).unwrap();
        assert_eq!(s, "PONG");
        let s = String::from_resp(RespValue::Integer(3)).unwrap();
        assert_eq!(s, "3");
        assert!(String::from_resp(RespValue::Null).is_err());
    }

    #[test]
    fn integer_conversions_parse_strings_too() {
        assert_eq!(i64::from_resp(RespValue::Integer(-5)).unwrap(), -5);
        assert_eq!(i64::from_resp(RespValue::bulk_string("17")).unwrap(), 17);
        assert!(matches!(
            i64::from_resp(RespValue::bulk_string("x")),
            Err(Error::Conversion { .. })
        ));
    }

    #[test]
    fn option_maps_null_to_none() {
        let v: Option<String> = Option::from_resp(RespValue::Null).unwrap();
        assert_eq!(v, None);
        let v: Option<String> = Option::from_resp(RespValue::bulk_string("v")).unwrap();
        assert_eq!(v.as_deref(), Some("v"));
    }

    #[test]
    fn vec_converts_each_element() {
        let v: Vec<i64> =
            Vec::from_resp(RespValue::Array(vec![RespValue::Integer(1), RespValue::Integer(2)]))
                .unwrap();
        assert_eq!(v, vec![1, 2]);
    }
}
