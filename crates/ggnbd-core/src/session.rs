use crate::device::Sequence;
use core::fmt;
use std::net::SocketAddr;

/// Failure category for protocol session operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionErrorKind {
    /// Socket-level failure.
    Io,
    /// The peer violated the protocol.
    Protocol,
    /// A deadline elapsed. Never reported for plain I/O failures.
    Timeout,
    /// A blocking call returned early because of an interrupt.
    Interrupted,
    /// The peer closed the connection.
    Closed,
    /// The peer refused an option or handshake step.
    Rejected,
}

/// Error surfaced by [`ProtocolSession`] implementations.
#[derive(Clone, Debug)]
pub struct SessionError {
    kind: SessionErrorKind,
    message: Option<String>,
}

impl SessionError {
    pub const fn new(kind: SessionErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    pub fn with_message(kind: SessionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }

    pub fn kind(&self) -> SessionErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{:?}: {}", self.kind, msg),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl std::error::Error for SessionError {}

pub type SessionResult<T> = core::result::Result<T, SessionError>;

/// What happened to a command the loop asked the session to send.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// The session will not issue this command; nothing went on the wire.
    Unsupported,
}

/// Why no correlation sequence came back from a reply header.
#[derive(Clone, Debug)]
pub enum ReplyError {
    /// The server answered the request with an error code.
    Rejected { errno: u32 },
    Failed(SessionError),
}

impl fmt::Display for ReplyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplyError::Rejected { errno } => write!(f, "server rejected request (error {errno})"),
            ReplyError::Failed(err) => err.fmt(f),
        }
    }
}

impl From<SessionError> for ReplyError {
    fn from(err: SessionError) -> Self {
        ReplyError::Failed(err)
    }
}

/// One connection to a remote block server plus its negotiated state.
pub trait ProtocolSession {
    /// Prepare the session for connecting.
    fn init(&mut self) -> SessionResult<()>;

    /// Connect to the first reachable address.
    fn connect(&mut self, addrs: &[SocketAddr]) -> SessionResult<()>;

    /// Limit the socket to the operations needed from now on.
    fn restrict(&mut self) -> SessionResult<()>;

    /// Run the option handshake and select the export.
    fn negotiate(&mut self) -> SessionResult<()>;

    /// Export size in bytes, valid after [`negotiate`](Self::negotiate).
    fn size(&self) -> u64;

    fn read_only(&self) -> bool;

    fn send_read(&mut self, seq: Sequence, offset: u64, length: u64) -> SessionResult<SendOutcome>;

    fn send_write(
        &mut self,
        seq: Sequence,
        offset: u64,
        length: u64,
        data: &[u8],
    ) -> SessionResult<SendOutcome>;

    fn send_trim(&mut self, seq: Sequence, offset: u64, length: u64) -> SessionResult<SendOutcome>;

    fn send_flush(&mut self, seq: Sequence) -> SessionResult<SendOutcome>;

    /// Receive the next reply header and return its correlation sequence.
    fn recv_reply_header(&mut self) -> Result<Sequence, ReplyError>;

    /// Receive a read payload filling all of `buf`.
    fn recv_reply_data(&mut self, buf: &mut [u8]) -> SessionResult<()>;

    /// Stop issuing trim for the rest of the session.
    fn disable_trim(&mut self);

    /// Mark the session as going away; later failures are expected.
    fn set_disconnect(&mut self, disconnect: bool);

    /// Tell the server the client is leaving. Best effort.
    fn send_disconnect(&mut self) -> SessionResult<()>;

    fn shutdown(&mut self);

    fn close(&mut self);
}
