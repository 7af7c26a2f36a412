use thiserror::Error as ThisError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, ThisError)]
pub enum Error {
    /// The transport closed while commands were still in flight. Every
    /// outstanding command future on that connection resolves with this.
    #[error("connection closed")]
    ConnectionClosed,
    /// A command that is illegal for the connection's current mode, e.g. a
    /// normal command on a subscribed connection, or a connection-affine
    /// command (MULTI, WATCH, SELECT, ...) on a shared pooled connection.
    #[error("illegal command for connection state: {0}")]
    IllegalState(String),
    /// Attempted to lock a connection that is already locked.
    #[error("connection is already locked")]
    AlreadyLocked,
    /// The server answered with an error reply. Local to one command; the
    /// connection and any queued replies behind it are unaffected.
    #[error("server error reply: {0}")]
    ErrorReply(String),
    /// Malformed command arguments.
    #[error("invalid command argument: {0}")]
    InvalidArgument(String),
    /// The reply decoder hit bytes that violate the wire framing.
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
