//! Fixed-newstyle negotiation selecting the default export.

use crate::io::{read_full, write_full};
use byteorder::{BigEndian, ByteOrder};
use ggnbd_core::{SessionError, SessionErrorKind, SessionResult};
use ggnbd_proto::{
    ClientFlags, ExportInfo, Greeting, HandshakeFlags, OptionHeader, OptionReply, ProtoError,
    EXPORT_NAME_PADDING, EXPORT_NAME_REPLY_LEN, GREETING_LEN, OPTION_REPLY_LEN, OPT_EXPORT_NAME,
    OPT_GO, REP_ACK, REP_ERR_INVALID, REP_ERR_POLICY, REP_ERR_UNKNOWN, REP_ERR_UNSUP, REP_INFO,
};
use std::io::{Read, Write};
use tracing::{debug, trace};

pub(crate) fn protocol(err: ProtoError) -> SessionError {
    SessionError::with_message(SessionErrorKind::Protocol, err.to_string())
}

/// Run the handshake on `stream` and return the selected export.
pub(crate) fn negotiate<S: Read + Write>(
    stream: &mut S,
    stop: impl Fn() -> bool + Copy,
) -> SessionResult<ExportInfo> {
    let mut greeting = [0u8; GREETING_LEN];
    read_full(stream, &mut greeting, stop)?;
    let greeting = Greeting::decode(greeting).map_err(protocol)?;
    let no_zeroes = greeting.flags.contains(HandshakeFlags::NO_ZEROES);
    trace!(flags = ?greeting.flags, "server greeting");

    let mut client_flags = ClientFlags::FIXED_NEWSTYLE;
    if no_zeroes {
        client_flags |= ClientFlags::NO_ZEROES;
    }
    let mut reply = [0u8; 4];
    BigEndian::write_u32(&mut reply, client_flags.bits());
    write_full(stream, &reply, stop)?;

    match go(stream, stop)? {
        Some(export) => Ok(export),
        None => {
            debug!("server lacks NBD_OPT_GO; falling back to NBD_OPT_EXPORT_NAME");
            export_name(stream, no_zeroes, stop)
        }
    }
}

/// `NBD_OPT_GO` for the default export. `None` if the server does not know the option.
fn go<S: Read + Write>(
    stream: &mut S,
    stop: impl Fn() -> bool + Copy,
) -> SessionResult<Option<ExportInfo>> {
    // Empty export name, no information requests.
    let mut payload = [0u8; 6];
    BigEndian::write_u32(&mut payload[0..4], 0);
    BigEndian::write_u16(&mut payload[4..6], 0);
    write_full(stream, &OptionHeader::new(OPT_GO, payload.len() as u32).encode(), stop)?;
    write_full(stream, &payload, stop)?;

    let mut export = None;
    loop {
        let mut header = [0u8; OPTION_REPLY_LEN];
        read_full(stream, &mut header, stop)?;
        let reply = OptionReply::decode(header).map_err(protocol)?;
        let mut data = vec![0u8; reply.len as usize];
        read_full(stream, &mut data, stop)?;
        if reply.option != OPT_GO {
            return Err(SessionError::with_message(
                SessionErrorKind::Protocol,
                format!("reply for option {} while negotiating NBD_OPT_GO", reply.option),
            ));
        }
        match reply.reply_type {
            REP_INFO => {
                if let Some(info) = ExportInfo::decode_info(&data).map_err(protocol)? {
                    export = Some(info);
                }
            }
            REP_ACK => {
                return export.map(Some).ok_or_else(|| {
                    SessionError::with_message(
                        SessionErrorKind::Protocol,
                        "server acknowledged NBD_OPT_GO without export information",
                    )
                })
            }
            REP_ERR_UNSUP => return Ok(None),
            other if reply.is_error() => {
                return Err(SessionError::with_message(
                    SessionErrorKind::Rejected,
                    rejection(other, &data),
                ))
            }
            other => {
                return Err(SessionError::with_message(
                    SessionErrorKind::Protocol,
                    format!("unexpected option reply type {other:#x}"),
                ))
            }
        }
    }
}

fn export_name<S: Read + Write>(
    stream: &mut S,
    no_zeroes: bool,
    stop: impl Fn() -> bool + Copy,
) -> SessionResult<ExportInfo> {
    write_full(stream, &OptionHeader::new(OPT_EXPORT_NAME, 0).encode(), stop)?;
    let mut reply = [0u8; EXPORT_NAME_REPLY_LEN];
    read_full(stream, &mut reply, stop)?;
    if !no_zeroes {
        read_full(stream, &mut [0u8; EXPORT_NAME_PADDING], stop)?;
    }
    Ok(ExportInfo::decode_export_name(reply))
}

fn rejection(reply_type: u32, data: &[u8]) -> String {
    let reason = match reply_type {
        REP_ERR_POLICY => "denied by server policy".to_string(),
        REP_ERR_INVALID => "invalid request".to_string(),
        REP_ERR_UNKNOWN => "unknown export".to_string(),
        other => format!("error reply {other:#x}"),
    };
    match std::str::from_utf8(data) {
        Ok(text) if !text.is_empty() => format!("{reason}: {text}"),
        _ => reason,
    }
}
