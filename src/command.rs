use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};
use strum_macros::EnumString;

static CRLF: &[u8; 2] = b"\r\n";

/// A command to be sent to the server: an ordered argument list whose first
/// element is the command name. Immutable once encoded.
#[derive(Clone, Debug, PartialEq)]
pub struct Command {
    kind: Kind,
    args: Vec<Bytes>,
}

impl Command {
    pub fn new(name: &str) -> Command {
        Command {
            kind: Kind::from_str(name).unwrap_or_else(|_| Kind::Other(name.to_string())),
            args: vec![Bytes::copy_from_slice(name.as_bytes())],
        }
    }

    pub fn arg(mut self, arg: impl IntoArg) -> Command {
        self.args.push(arg.into_arg());
        self
    }

    pub fn args<I, A>(mut self, args: I) -> Command
    where
        I: IntoIterator<Item = A>,
        A: IntoArg,
    {
        self.args.extend(args.into_iter().map(IntoArg::into_arg));
        self
    }

    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    /// Encodes the command into the array-of-bulk-strings wire framing:
    /// `*<count>\r\n` followed by `$<len>\r\n<bytes>\r\n` per argument.
    /// Never fails; arguments are already flat byte strings by construction.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_len());
        buf.put_u8(b'*');
        buf.put_slice(self.args.len().to_string().as_bytes());
        buf.put_slice(CRLF);
        for arg in &self.args {
            buf.put_u8(b'$');
            buf.put_slice(arg.len().to_string().as_bytes());
            buf.put_slice(CRLF);
            buf.put_slice(arg);
            buf.put_slice(CRLF);
        }
        buf.freeze()
    }

    fn wire_len(&self) -> usize {
        // Slight overestimate of the digits is fine, this only sizes the
        // initial allocation.
        16 + self.args.iter().map(|arg| arg.len() + 16).sum::<usize>()
    }
}

/// Classification of command names that the client has to treat specially:
/// commands that mutate connection-local server state, plus the handful
/// that remain legal while the connection is in subscriber mode. Everything
/// else lands in `Other`.
#[derive(Clone, Debug, PartialEq, Eq, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum Kind {
    Multi,
    Exec,
    Discard,
    Watch,
    Unwatch,
    Subscribe,
    Psubscribe,
    Unsubscribe,
    Punsubscribe,
    Select,
    Auth,
    Quit,
    Ping,
    #[strum(default)]
    Other(String),
}

impl Kind {
    /// Commands whose effect is tied to one specific connection. Running
    /// these on a shared pooled connection would leak transaction or
    /// subscription state into other callers, so they require an
    /// exclusively locked connection.
    pub fn is_connection_affine(&self) -> bool {
        matches!(
            self,
            Kind::Multi
                | Kind::Exec
                | Kind::Discard
                | Kind::Watch
                | Kind::Unwatch
                | Kind::Subscribe
                | Kind::Psubscribe
                | Kind::Unsubscribe
                | Kind::Punsubscribe
                | Kind::Select
                | Kind::Auth
        )
    }

    /// Commands the server accepts while the connection is subscribed.
    pub fn is_subscriber_legal(&self) -> bool {
        matches!(
            self,
            Kind::Subscribe
                | Kind::Psubscribe
                | Kind::Unsubscribe
                | Kind::Punsubscribe
                | Kind::Ping
                | Kind::Quit
        )
    }

    /// The subscribe/unsubscribe family, whose acknowledgements are
    /// delivered as push events rather than one-shot replies.
    pub fn is_subscription(&self) -> bool {
        matches!(
            self,
            Kind::Subscribe | Kind::Psubscribe | Kind::Unsubscribe | Kind::Punsubscribe
        )
    }
}

/// Conversion of scalar argument values into wire bytes. Numbers are
/// rendered in canonical base-10 form.
pub trait IntoArg {
    fn into_arg(self) -> Bytes;
}

impl IntoArg for Bytes {
    fn into_arg(self) -> Bytes {
        self
    }
}

impl IntoArg for &Bytes {
    fn into_arg(self) -> Bytes {
        self.clone()
    }
}

impl IntoArg for Vec<u8> {
    fn into_arg(self) -> Bytes {
        Bytes::from(self)
    }
}

impl IntoArg for &[u8] {
    fn into_arg(self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl IntoArg for String {
    fn into_arg(self) -> Bytes {
        Bytes::from(self)
    }
}

impl IntoArg for &str {
    fn into_arg(self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl IntoArg for i64 {
    fn into_arg(self) -> Bytes {
        Bytes::from(self.to_string())
    }
}

impl IntoArg for u64 {
    fn into_arg(self) -> Bytes {
        Bytes::from(self.to_string())
    }
}

impl IntoArg for u32 {
    fn into_arg(self) -> Bytes {
        Bytes::from(self.to_string())
    }
}

impl IntoArg for usize {
    fn into_arg(self) -> Bytes {
        Bytes::from(self.to_string())
    }
}

impl IntoArg for f64 {
    fn into_arg(self) -> Bytes {
        Bytes::from(self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_command_with_string_args() {
        let cmd = Command::new("SET").arg("foo").arg("bar");
        assert_eq!(&cmd.encode()[..], b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n");
    }

    #[test]
    fn encodes_command_without_args() {
        let cmd = Command::new("PING");
        assert_eq!(&cmd.encode()[..], b"*1\r\n$4\r\nPING\r\n");
    }

    #[test]
    fn encodes_integer_args_in_base_10() {
        let cmd = Command::new("SELECT").arg(7u32);
        assert_eq!(&cmd.encode()[..], b"*2\r\n$6\r\nSELECT\r\n$1\r\n7\r\n");

        let cmd = Command::new("INCRBY").arg("counter").arg(-42i64);
        assert_eq!(
            &cmd.encode()[..],
            b"*3\r\n$6\r\nINCRBY\r\n$7\r\ncounter\r\n$3\r\n-42\r\n"
        );
    }

    #[test]
    fn encodes_binary_args_untouched() {
        let cmd = Command::new("SET").arg("k").arg(&b"\x00\xffbin"[..]);
        assert_eq!(
            &cmd.encode()[..],
            b"*3\r\n$3\r\nSET\r\n$1\r\nk\r\n$5\r\n\x00\xffbin\r\n"
        );
    }

    #[test]
    fn classifies_kind_case_insensitively() {
        assert_eq!(*Command::new("multi").kind(), Kind::Multi);
        assert_eq!(*Command::new("MULTI").kind(), Kind::Multi);
        assert_eq!(*Command::new("Subscribe").kind(), Kind::Subscribe);
        assert_eq!(
            *Command::new("GET").kind(),
            Kind::Other("GET".to_string())
        );
    }

    #[test]
    fn connection_affine_set() {
        for name in ["MULTI", "WATCH", "SELECT", "SUBSCRIBE", "AUTH"] {
            assert!(Command::new(name).kind().is_connection_affine(), "{name}");
        }
        for name in ["GET", "SET", "PING", "QUIT"] {
            assert!(!Command::new(name).kind().is_connection_affine(), "{name}");
        }
    }

    #[test]
    fn subscriber_legal_set() {
        for name in ["SUBSCRIBE", "UNSUBSCRIBE", "PSUBSCRIBE", "PING"] {
            assert!(Command::new(name).kind().is_subscriber_legal(), "{name}");
        }
        for name in ["GET", "MULTI", "SELECT"] {
            assert!(!Command::new(name).kind().is_subscriber_legal(), "{name}");
        }
    }
}
