// https://redis.io/docs/reference/protocol-spec

use std::fmt;
use std::io::Cursor;

use bytes::{Buf, Bytes};
use thiserror::Error as ThisError;

static CRLF: &[u8; 2] = b"\r\n";

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("not enough data is available to parse an entire reply")]
    Incomplete,
    #[error("invalid reply type marker: {0:?}")]
    InvalidMarker(char),
    #[error("protocol error; {0}")]
    Malformed(String),
}

/// A single decoded RESP reply value.
///
/// Server `-ERR` style replies are ordinary values here, not crate errors:
/// an error reply belongs to exactly one command and never invalidates the
/// connection or the replies queued behind it.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    Null,
    Array(Vec<Reply>),
}

impl Reply {
    /// Parses one reply from the cursor, advancing it past the consumed
    /// bytes. Returns `Error::Incomplete` when the buffer does not yet hold
    /// a full reply, in which case the cursor position is meaningless and
    /// the caller must retry with more data.
    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Self, Error> {
        // The first byte of every RESP reply identifies its type.
        match get_byte(src)? {
            b'+' => {
                let line = get_line(src)?;
                Ok(Reply::Simple(to_utf8(line)?))
            }
            b'-' => {
                let line = get_line(src)?;
                Ok(Reply::Error(to_utf8(line)?))
            }
            b':' => {
                let line = get_line(src)?;
                Ok(Reply::Integer(parse_int(line)?))
            }
            // $<length>\r\n<data>\r\n
            b'$' => {
                let length = parse_int(get_line(src)?)?;
                if length == -1 {
                    return Ok(Reply::Null);
                }
                let length = usize::try_from(length)
                    .map_err(|_| Error::Malformed(format!("negative bulk length {}", length)))?;
                if src.remaining() < length + CRLF.len() {
                    return Err(Error::Incomplete);
                }
                let start = src.position() as usize;
                let data = Bytes::copy_from_slice(&src.get_ref()[start..start + length]);
                src.advance(length);
                expect_crlf(src)?;
                Ok(Reply::Bulk(data))
            }
            // *<number-of-elements>\r\n<element-1>...<element-n>
            b'*' => {
                let length = parse_int(get_line(src)?)?;
                if length == -1 {
                    return Ok(Reply::Null);
                }
                let length = usize::try_from(length)
                    .map_err(|_| Error::Malformed(format!("negative array length {}", length)))?;
                let mut items = Vec::with_capacity(length);
                for _ in 0..length {
                    items.push(Self::parse(src)?);
                }
                Ok(Reply::Array(items))
            }
            marker => Err(Error::InvalidMarker(marker as char)),
        }
    }

    /// Turns an error reply into a crate error, passing every other reply
    /// through untouched.
    pub fn ok(self) -> crate::Result<Reply> {
        match self {
            Reply::Error(message) => Err(crate::Error::ErrorReply(message)),
            reply => Ok(reply),
        }
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Simple(s) => write!(f, "{}", s),
            Reply::Error(s) => write!(f, "(error) {}", s),
            Reply::Integer(i) => write!(f, "(integer) {}", i),
            Reply::Bulk(bytes) => write!(f, "\"{}\"", String::from_utf8_lossy(bytes)),
            Reply::Null => write!(f, "(nil)"),
            Reply::Array(items) => {
                if items.is_empty() {
                    return write!(f, "(empty array)");
                }
                for (index, item) in items.iter().enumerate() {
                    if index > 0 {
                        writeln!(f)?;
                    }
                    write!(f, "{}) {}", index + 1, item)?;
                }
                Ok(())
            }
        }
    }
}

fn get_byte(src: &mut Cursor<&[u8]>) -> Result<u8, Error> {
    if !src.has_remaining() {
        return Err(Error::Incomplete);
    }
    Ok(src.get_u8())
}

/// Returns the bytes up to the next CRLF and advances the cursor past it.
fn get_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], Error> {
    let start = src.position() as usize;
    let end = src.get_ref().len();

    let line_end = src.get_ref()[start..end]
        .windows(CRLF.len())
        .position(|window| window == CRLF)
        .ok_or(Error::Incomplete)
        .map(|index| start + index)?;

    src.set_position((line_end + CRLF.len()) as u64);

    Ok(&src.get_ref()[start..line_end])
}

fn expect_crlf(src: &mut Cursor<&[u8]>) -> Result<(), Error> {
    if src.remaining() < CRLF.len() {
        return Err(Error::Incomplete);
    }
    if get_byte(src)? != b'\r' || get_byte(src)? != b'\n' {
        return Err(Error::Malformed("bulk string not terminated by CRLF".into()));
    }
    Ok(())
}

fn to_utf8(bytes: &[u8]) -> Result<String, Error> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| Error::Malformed("invalid UTF-8 in reply".into()))
}

fn parse_int(bytes: &[u8]) -> Result<i64, Error> {
    let string = std::str::from_utf8(bytes)
        .map_err(|_| Error::Malformed("invalid UTF-8 in length".into()))?;
    string
        .parse::<i64>()
        .map_err(|_| Error::Malformed(format!("invalid integer {:?}", string)))
}
