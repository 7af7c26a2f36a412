use std::io::Cursor;

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

use crate::error::Error;
use crate::frame::{self, Reply};

/// Incremental reply decoder: feed it bytes, get back complete replies.
///
/// `Ok(None)` means no complete reply is buffered yet; the framed reader
/// will call again once more bytes arrive.
pub struct ReplyCodec;

impl Decoder for ReplyCodec {
    type Item = Reply;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let mut cursor = Cursor::new(&src[..]);
        let reply = match Reply::parse(&mut cursor) {
            Ok(reply) => reply,
            Err(frame::Error::Incomplete) => return Ok(None),
            Err(err) => return Err(Error::Protocol(err.to_string())),
        };

        // Remove the parsed reply from the buffer.
        let consumed = cursor.position() as usize;
        src.advance(consumed);

        Ok(Some(reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn decodes_nothing_from_partial_input() {
        let mut codec = ReplyCodec;
        let mut buf = BytesMut::from(&b"$5\r\nhel"[..]);

        assert!(matches!(codec.decode(&mut buf), Ok(None)));
        // Partial input must stay in the buffer.
        assert_eq!(&buf[..], b"$5\r\nhel");
    }

    #[test]
    fn decodes_once_input_completes() {
        let mut codec = ReplyCodec;
        let mut buf = BytesMut::from(&b"$5\r\nhel"[..]);

        assert!(matches!(codec.decode(&mut buf), Ok(None)));
        buf.extend_from_slice(b"lo\r\n");

        let reply = codec.decode(&mut buf).unwrap();
        assert_eq!(reply, Some(Reply::Bulk(Bytes::from("hello"))));
        assert!(buf.is_empty());
    }

    #[test]
    fn decodes_multiple_replies_from_one_buffer() {
        let mut codec = ReplyCodec;
        let mut buf = BytesMut::from(&b"+OK\r\n:42\r\n"[..]);

        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Reply::Simple("OK".to_string()))
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Reply::Integer(42)));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn surfaces_framing_violations() {
        let mut codec = ReplyCodec;
        let mut buf = BytesMut::from(&b"?bogus\r\n"[..]);

        assert!(matches!(codec.decode(&mut buf), Err(Error::Protocol(_))));
    }
}
