#![no_std]

//! Fixed-layout messages of the NBD protocol, fixed-newstyle handshake and
//! simple replies only.
//!
//! All integers on the wire are big-endian.

use bitflags::bitflags;
use core::fmt;

/// "NBDMAGIC", first word sent by the server.
pub const INIT_MAGIC: u64 = 0x4e42_444d_4147_4943;
/// "IHAVEOPT", second word of a newstyle greeting and prefix of every option.
pub const OPTION_MAGIC: u64 = 0x4948_4156_454f_5054;
/// Prefix of every option reply.
pub const OPTION_REPLY_MAGIC: u64 = 0x0003_e889_0455_65a9;
/// Prefix of every transmission request.
pub const REQUEST_MAGIC: u32 = 0x2560_9513;
/// Prefix of a simple transmission reply.
pub const SIMPLE_REPLY_MAGIC: u32 = 0x6744_6698;

/// Well-known NBD TCP port.
pub const DEFAULT_PORT: u16 = 10809;

/// Number of bytes in the server greeting.
pub const GREETING_LEN: usize = 18;
/// Number of bytes in an option request header.
pub const OPTION_HEADER_LEN: usize = 16;
/// Number of bytes in an option reply header.
pub const OPTION_REPLY_LEN: usize = 20;
/// Number of bytes in a transmission request header.
pub const REQUEST_LEN: usize = 28;
/// Number of bytes in a simple reply header.
pub const SIMPLE_REPLY_LEN: usize = 16;
/// Size and transmission flags sent in reply to `NBD_OPT_EXPORT_NAME`.
pub const EXPORT_NAME_REPLY_LEN: usize = 10;
/// Zero padding after the export-name reply unless `NO_ZEROES` was agreed.
pub const EXPORT_NAME_PADDING: usize = 124;
/// Payload length of an `NBD_INFO_EXPORT` information reply.
pub const INFO_EXPORT_LEN: usize = 12;

/// Upper bound on option reply payloads the client is willing to buffer.
pub const MAX_OPTION_REPLY_LEN: u32 = 64 * 1024;

pub const OPT_EXPORT_NAME: u32 = 1;
pub const OPT_GO: u32 = 7;

pub const REP_ACK: u32 = 1;
pub const REP_INFO: u32 = 3;
pub const REP_FLAG_ERROR: u32 = 1 << 31;
pub const REP_ERR_UNSUP: u32 = 1 | REP_FLAG_ERROR;
pub const REP_ERR_POLICY: u32 = 2 | REP_FLAG_ERROR;
pub const REP_ERR_INVALID: u32 = 3 | REP_FLAG_ERROR;
pub const REP_ERR_UNKNOWN: u32 = 6 | REP_FLAG_ERROR;

pub const INFO_EXPORT: u16 = 0;

/// Simple-reply error for a request the server refuses outright.
pub const EINVAL: u32 = 22;

bitflags! {
    /// Flags advertised by the server in its greeting.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct HandshakeFlags: u16 {
        const FIXED_NEWSTYLE = 1 << 0;
        const NO_ZEROES = 1 << 1;
    }

    /// Flags the client answers the greeting with.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ClientFlags: u32 {
        const FIXED_NEWSTYLE = 1 << 0;
        const NO_ZEROES = 1 << 1;
    }

    /// Per-export transmission flags.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TransmissionFlags: u16 {
        const HAS_FLAGS = 1 << 0;
        const READ_ONLY = 1 << 1;
        const SEND_FLUSH = 1 << 2;
        const SEND_FUA = 1 << 3;
        const ROTATIONAL = 1 << 4;
        const SEND_TRIM = 1 << 5;
        const SEND_WRITE_ZEROES = 1 << 6;
        const CAN_MULTI_CONN = 1 << 8;
    }
}

/// Errors surfaced while decoding protocol messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProtoError {
    /// Buffer length did not match the protocol expectation.
    InvalidLength { expected: usize, actual: usize },
    /// A magic word did not match.
    InvalidMagic { expected: u64, actual: u64 },
    /// Server does not speak fixed newstyle negotiation.
    NotFixedNewstyle,
    /// Field value failed validation.
    InvalidValue(&'static str),
}

impl fmt::Display for ProtoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtoError::InvalidLength { expected, actual } => {
                write!(f, "invalid message length {actual}, expected {expected}")
            }
            ProtoError::InvalidMagic { expected, actual } => {
                write!(f, "invalid magic {actual:#x}, expected {expected:#x}")
            }
            ProtoError::NotFixedNewstyle => write!(f, "server is not fixed-newstyle"),
            ProtoError::InvalidValue(field) => write!(f, "invalid field value: {field}"),
        }
    }
}

/// Result alias for protocol parsing operations.
pub type Result<T> = core::result::Result<T, ProtoError>;

/// Transmission-phase commands the client issues.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum Command {
    Read = 0,
    Write = 1,
    Disconnect = 2,
    Flush = 3,
    Trim = 4,
}

impl From<Command> for u16 {
    fn from(cmd: Command) -> Self {
        cmd as u16
    }
}

/// Server greeting: `NBDMAGIC`, `IHAVEOPT`, handshake flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Greeting {
    pub flags: HandshakeFlags,
}

impl Greeting {
    pub fn encode(self) -> [u8; GREETING_LEN] {
        let mut buf = [0u8; GREETING_LEN];
        buf[0..8].copy_from_slice(&INIT_MAGIC.to_be_bytes());
        buf[8..16].copy_from_slice(&OPTION_MAGIC.to_be_bytes());
        buf[16..18].copy_from_slice(&self.flags.bits().to_be_bytes());
        buf
    }

    pub fn decode(bytes: [u8; GREETING_LEN]) -> Result<Self> {
        expect_magic64(INIT_MAGIC, &bytes[0..8])?;
        expect_magic64(OPTION_MAGIC, &bytes[8..16])?;
        let flags = HandshakeFlags::from_bits_truncate(be16(&bytes[16..18]));
        if !flags.contains(HandshakeFlags::FIXED_NEWSTYLE) {
            return Err(ProtoError::NotFixedNewstyle);
        }
        Ok(Self { flags })
    }
}

/// Header of an option request; `len` bytes of option data follow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OptionHeader {
    pub option: u32,
    pub len: u32,
}

impl OptionHeader {
    pub const fn new(option: u32, len: u32) -> Self {
        Self { option, len }
    }

    pub fn encode(self) -> [u8; OPTION_HEADER_LEN] {
        let mut buf = [0u8; OPTION_HEADER_LEN];
        buf[0..8].copy_from_slice(&OPTION_MAGIC.to_be_bytes());
        buf[8..12].copy_from_slice(&self.option.to_be_bytes());
        buf[12..16].copy_from_slice(&self.len.to_be_bytes());
        buf
    }
}

/// Header of an option reply; `len` bytes of reply data follow.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OptionReply {
    pub option: u32,
    pub reply_type: u32,
    pub len: u32,
}

impl OptionReply {
    pub fn is_error(&self) -> bool {
        self.reply_type & REP_FLAG_ERROR != 0
    }

    pub fn encode(self) -> [u8; OPTION_REPLY_LEN] {
        let mut buf = [0u8; OPTION_REPLY_LEN];
        buf[0..8].copy_from_slice(&OPTION_REPLY_MAGIC.to_be_bytes());
        buf[8..12].copy_from_slice(&self.option.to_be_bytes());
        buf[12..16].copy_from_slice(&self.reply_type.to_be_bytes());
        buf[16..20].copy_from_slice(&self.len.to_be_bytes());
        buf
    }

    pub fn decode(bytes: [u8; OPTION_REPLY_LEN]) -> Result<Self> {
        expect_magic64(OPTION_REPLY_MAGIC, &bytes[0..8])?;
        let len = be32(&bytes[16..20]);
        if len > MAX_OPTION_REPLY_LEN {
            return Err(ProtoError::InvalidValue("option reply too large"));
        }
        Ok(Self {
            option: be32(&bytes[8..12]),
            reply_type: be32(&bytes[12..16]),
            len,
        })
    }
}

/// Export geometry learned during negotiation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExportInfo {
    pub size: u64,
    pub flags: TransmissionFlags,
}

impl ExportInfo {
    /// Decode the size/flags pair that answers `NBD_OPT_EXPORT_NAME`.
    pub fn decode_export_name(bytes: [u8; EXPORT_NAME_REPLY_LEN]) -> Self {
        Self {
            size: be64(&bytes[0..8]),
            flags: TransmissionFlags::from_bits_truncate(be16(&bytes[8..10])),
        }
    }

    /// Decode an `NBD_REP_INFO` payload, returning `None` for information
    /// types other than `NBD_INFO_EXPORT`.
    pub fn decode_info(payload: &[u8]) -> Result<Option<Self>> {
        if payload.len() < 2 {
            return Err(ProtoError::InvalidLength {
                expected: 2,
                actual: payload.len(),
            });
        }
        if be16(&payload[0..2]) != INFO_EXPORT {
            return Ok(None);
        }
        if payload.len() != INFO_EXPORT_LEN {
            return Err(ProtoError::InvalidLength {
                expected: INFO_EXPORT_LEN,
                actual: payload.len(),
            });
        }
        Ok(Some(Self {
            size: be64(&payload[2..10]),
            flags: TransmissionFlags::from_bits_truncate(be16(&payload[10..12])),
        }))
    }
}

/// Transmission request header; write payloads follow it on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestHeader {
    pub flags: u16,
    pub command: Command,
    pub handle: u64,
    pub offset: u64,
    pub length: u32,
}

impl RequestHeader {
    pub const fn new(command: Command, handle: u64, offset: u64, length: u32) -> Self {
        Self {
            flags: 0,
            command,
            handle,
            offset,
            length,
        }
    }

    pub fn encode(self) -> [u8; REQUEST_LEN] {
        let mut buf = [0u8; REQUEST_LEN];
        buf[0..4].copy_from_slice(&REQUEST_MAGIC.to_be_bytes());
        buf[4..6].copy_from_slice(&self.flags.to_be_bytes());
        buf[6..8].copy_from_slice(&u16::from(self.command).to_be_bytes());
        buf[8..16].copy_from_slice(&self.handle.to_be_bytes());
        buf[16..24].copy_from_slice(&self.offset.to_be_bytes());
        buf[24..28].copy_from_slice(&self.length.to_be_bytes());
        buf
    }
}

/// Simple reply header; read payloads follow a successful reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SimpleReply {
    pub error: u32,
    pub handle: u64,
}

impl SimpleReply {
    pub const fn new(error: u32, handle: u64) -> Self {
        Self { error, handle }
    }

    pub fn encode(self) -> [u8; SIMPLE_REPLY_LEN] {
        let mut buf = [0u8; SIMPLE_REPLY_LEN];
        buf[0..4].copy_from_slice(&SIMPLE_REPLY_MAGIC.to_be_bytes());
        buf[4..8].copy_from_slice(&self.error.to_be_bytes());
        buf[8..16].copy_from_slice(&self.handle.to_be_bytes());
        buf
    }

    pub fn decode(bytes: [u8; SIMPLE_REPLY_LEN]) -> Result<Self> {
        let magic = be32(&bytes[0..4]);
        if magic != SIMPLE_REPLY_MAGIC {
            return Err(ProtoError::InvalidMagic {
                expected: SIMPLE_REPLY_MAGIC as u64,
                actual: magic as u64,
            });
        }
        Ok(Self {
            error: be32(&bytes[4..8]),
            handle: be64(&bytes[8..16]),
        })
    }
}

fn expect_magic64(expected: u64, bytes: &[u8]) -> Result<()> {
    let actual = be64(bytes);
    if actual != expected {
        return Err(ProtoError::InvalidMagic { expected, actual });
    }
    Ok(())
}

fn be16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

fn be32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn be64(bytes: &[u8]) -> u64 {
    u64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}
