//! Blocking transfers that give up on `EINTR` once the session is stopping.

use ggnbd_core::{SessionError, SessionErrorKind, SessionResult};
use std::io::{self, Read, Write};

pub(crate) fn map_io(err: io::Error) -> SessionError {
    let kind = match err.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => SessionErrorKind::Timeout,
        io::ErrorKind::Interrupted => SessionErrorKind::Interrupted,
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => SessionErrorKind::Closed,
        _ => SessionErrorKind::Io,
    };
    SessionError::with_message(kind, err.to_string())
}

/// Fill `buf` completely. `stop` is consulted whenever a read is interrupted.
pub(crate) fn read_full<R: Read>(
    reader: &mut R,
    buf: &mut [u8],
    stop: impl Fn() -> bool,
) -> SessionResult<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(SessionError::with_message(
                    SessionErrorKind::Closed,
                    format!("connection closed after {filled} of {} bytes", buf.len()),
                ))
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                if stop() {
                    return Err(SessionError::new(SessionErrorKind::Interrupted));
                }
            }
            Err(err) => return Err(map_io(err)),
        }
    }
    Ok(())
}

/// Write all of `buf`. `stop` is consulted whenever a write is interrupted.
pub(crate) fn write_full<W: Write>(
    writer: &mut W,
    mut buf: &[u8],
    stop: impl Fn() -> bool,
) -> SessionResult<()> {
    while !buf.is_empty() {
        match writer.write(buf) {
            Ok(0) => {
                return Err(SessionError::with_message(
                    SessionErrorKind::Closed,
                    "connection closed while writing",
                ))
            }
            Ok(n) => buf = &buf[n..],
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                if stop() {
                    return Err(SessionError::new(SessionErrorKind::Interrupted));
                }
            }
            Err(err) => return Err(map_io(err)),
        }
    }
    Ok(())
}
