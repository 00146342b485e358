//! Blocking NBD client: one TCP connection, one request in flight.

mod handshake;
mod io;

use crate::io::{map_io, read_full, write_full};
use ggnbd_core::{
    Cancellation, ProtocolSession, ReplyError, SendOutcome, Sequence, SessionError,
    SessionErrorKind, SessionResult,
};
use ggnbd_proto::{
    Command, ExportInfo, RequestHeader, SimpleReply, TransmissionFlags, SIMPLE_REPLY_LEN,
};
use std::{
    net::{Shutdown, SocketAddr, TcpStream},
    os::fd::AsRawFd,
};
use tracing::{debug, info, trace, warn};

/// Connection state of an [`NbdSession`].
enum Link {
    Idle,
    Ready,
    Connected(TcpStream),
}

pub struct NbdSession {
    link: Link,
    cancel: Cancellation,
    export: Option<ExportInfo>,
    trim: bool,
    disconnect: bool,
    outstanding: Option<u64>,
}

impl NbdSession {
    pub fn new(cancel: Cancellation) -> Self {
        Self {
            link: Link::Idle,
            cancel,
            export: None,
            trim: false,
            disconnect: false,
            outstanding: None,
        }
    }

    /// Transmission flags of the negotiated export.
    pub fn flags(&self) -> TransmissionFlags {
        self.export
            .map(|export| export.flags)
            .unwrap_or(TransmissionFlags::empty())
    }

    fn stop(&self) -> impl Fn() -> bool + Copy {
        let cancel = self.cancel;
        let disconnect = self.disconnect;
        move || disconnect || cancel.is_raised()
    }

    fn stream(&mut self) -> SessionResult<&mut TcpStream> {
        match &mut self.link {
            Link::Connected(stream) => Ok(stream),
            _ => Err(SessionError::with_message(
                SessionErrorKind::Closed,
                "not connected",
            )),
        }
    }

    fn request(
        &mut self,
        command: Command,
        seq: Sequence,
        offset: u64,
        length: u64,
        payload: &[u8],
    ) -> SessionResult<SendOutcome> {
        let length = u32::try_from(length).map_err(|_| {
            SessionError::with_message(
                SessionErrorKind::Protocol,
                format!("request length {length} exceeds protocol limit"),
            )
        })?;
        let header = RequestHeader::new(command, seq.0, offset, length).encode();
        let stop = self.stop();
        let stream = self.stream()?;
        write_full(stream, &header, stop)?;
        write_full(stream, payload, stop)?;
        trace!(?command, %seq, offset, length, "request sent");
        self.outstanding = Some(seq.0);
        Ok(SendOutcome::Sent)
    }
}

impl ProtocolSession for NbdSession {
    fn init(&mut self) -> SessionResult<()> {
        self.link = Link::Ready;
        self.export = None;
        self.trim = false;
        self.disconnect = false;
        self.outstanding = None;
        Ok(())
    }

    fn connect(&mut self, addrs: &[SocketAddr]) -> SessionResult<()> {
        if !matches!(self.link, Link::Ready) {
            return Err(SessionError::with_message(
                SessionErrorKind::Io,
                "session not initialised",
            ));
        }
        let stream = TcpStream::connect(addrs).map_err(map_io)?;
        if let Err(err) = stream.set_nodelay(true) {
            warn!(error = %err, "failed to disable Nagle");
        }
        debug!(peer = ?stream.peer_addr().ok(), "connected to server");
        self.link = Link::Connected(stream);
        Ok(())
    }

    fn restrict(&mut self) -> SessionResult<()> {
        let fd = self.stream()?.as_raw_fd();
        ggnbd_capsicum::limit_rights(fd, ggnbd_capsicum::SOCKET_RIGHTS).map_err(map_io)
    }

    fn negotiate(&mut self) -> SessionResult<()> {
        let stop = self.stop();
        let export = handshake::negotiate(self.stream()?, stop)?;
        self.trim = export.flags.contains(TransmissionFlags::SEND_TRIM);
        info!(
            size = export.size,
            flags = ?export.flags,
            "negotiated export"
        );
        self.export = Some(export);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.export.map(|export| export.size).unwrap_or(0)
    }

    fn read_only(&self) -> bool {
        self.flags().contains(TransmissionFlags::READ_ONLY)
    }

    fn send_read(&mut self, seq: Sequence, offset: u64, length: u64) -> SessionResult<SendOutcome> {
        self.request(Command::Read, seq, offset, length, &[])
    }

    fn send_write(
        &mut self,
        seq: Sequence,
        offset: u64,
        length: u64,
        data: &[u8],
    ) -> SessionResult<SendOutcome> {
        if self.read_only() {
            return Ok(SendOutcome::Unsupported);
        }
        if data.len() as u64 != length {
            return Err(SessionError::with_message(
                SessionErrorKind::Protocol,
                format!("write payload is {} bytes, expected {length}", data.len()),
            ));
        }
        self.request(Command::Write, seq, offset, length, data)
    }

    fn send_trim(&mut self, seq: Sequence, offset: u64, length: u64) -> SessionResult<SendOutcome> {
        if !self.trim || self.read_only() {
            return Ok(SendOutcome::Unsupported);
        }
        self.request(Command::Trim, seq, offset, length, &[])
    }

    fn send_flush(&mut self, seq: Sequence) -> SessionResult<SendOutcome> {
        if !self.flags().contains(TransmissionFlags::SEND_FLUSH) {
            return Ok(SendOutcome::Unsupported);
        }
        self.request(Command::Flush, seq, 0, 0, &[])
    }

    fn recv_reply_header(&mut self) -> Result<Sequence, ReplyError> {
        let stop = self.stop();
        let mut bytes = [0u8; SIMPLE_REPLY_LEN];
        read_full(self.stream()?, &mut bytes, stop)?;
        let reply = SimpleReply::decode(bytes).map_err(handshake::protocol)?;
        match self.outstanding.take() {
            Some(handle) if handle == reply.handle => {}
            expected => {
                return Err(SessionError::with_message(
                    SessionErrorKind::Protocol,
                    format!("reply handle {} does not match {expected:?}", reply.handle),
                )
                .into())
            }
        }
        if reply.error != 0 {
            return Err(ReplyError::Rejected { errno: reply.error });
        }
        Ok(Sequence(reply.handle))
    }

    fn recv_reply_data(&mut self, buf: &mut [u8]) -> SessionResult<()> {
        let stop = self.stop();
        read_full(self.stream()?, buf, stop)
    }

    fn disable_trim(&mut self) {
        if self.trim {
            info!("disabling trim for the rest of the session");
        }
        self.trim = false;
    }

    fn set_disconnect(&mut self, disconnect: bool) {
        self.disconnect = disconnect;
    }

    fn send_disconnect(&mut self) -> SessionResult<()> {
        let header = RequestHeader::new(Command::Disconnect, 0, 0, 0).encode();
        let stop = self.stop();
        write_full(self.stream()?, &header, stop)
    }

    fn shutdown(&mut self) {
        if let Link::Connected(stream) = &self.link {
            if let Err(err) = stream.shutdown(Shutdown::Both) {
                debug!(error = %err, "socket shutdown failed");
            }
        }
    }

    fn close(&mut self) {
        self.link = Link::Idle;
        self.outstanding = None;
    }
}
