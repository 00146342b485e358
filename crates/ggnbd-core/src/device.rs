use bitflags::bitflags;
use core::fmt;

/// Completion code for a request the session could not service.
pub const ERR_UNSUPPORTED: i32 = libc::EOPNOTSUPP;

/// Opaque correlation id the kernel assigns to a request.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Sequence(pub u64);

impl Sequence {
    /// Wildcard accepted by [`GatewayDevice::cancel`]: every outstanding request.
    pub const ALL: Sequence = Sequence(0);
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kernel command that has no protocol counterpart.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawCommand {
    pub code: u32,
    pub name: Option<&'static str>,
}

impl fmt::Display for RawCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name {
            Some(name) => f.write_str(name),
            None => write!(f, "{} (unknown)", self.code),
        }
    }
}

/// Command kind of a [`PendingRequest`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoCommand {
    Read,
    Write,
    Delete,
    Flush,
    Unsupported(RawCommand),
}

impl fmt::Display for IoCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoCommand::Read => f.write_str("read"),
            IoCommand::Write => f.write_str("write"),
            IoCommand::Delete => f.write_str("delete"),
            IoCommand::Flush => f.write_str("flush"),
            IoCommand::Unsupported(raw) => raw.fmt(f),
        }
    }
}

/// The one request currently in flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingRequest {
    pub unit: i32,
    pub seq: Sequence,
    pub command: IoCommand,
    pub offset: u64,
    pub length: u64,
    /// errno-style completion code, 0 on success.
    pub error: i32,
}

impl PendingRequest {
    pub fn new(unit: i32) -> Self {
        Self {
            unit,
            seq: Sequence::default(),
            command: IoCommand::Flush,
            offset: 0,
            length: 0,
            error: 0,
        }
    }

    /// Re-arm for the next start: the whole buffer is offered and the error cleared.
    pub fn reset(&mut self, capacity: usize) {
        self.length = capacity as u64;
        self.error = 0;
    }

    pub fn set_unsupported(&mut self) {
        self.error = ERR_UNSUPPORTED;
    }
}

/// Result of a start or done exchange as reported by the kernel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceStatus {
    Success,
    Canceled,
    Unsupported,
    NoDevice,
    Other(i32),
}

impl DeviceStatus {
    pub fn from_errno(code: i32) -> Self {
        match code {
            0 => DeviceStatus::Success,
            libc::ECANCELED => DeviceStatus::Canceled,
            libc::EOPNOTSUPP => DeviceStatus::Unsupported,
            libc::ENXIO => DeviceStatus::NoDevice,
            other => DeviceStatus::Other(other),
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceStatus::Success => f.write_str("success"),
            DeviceStatus::Canceled => f.write_str("operation canceled"),
            DeviceStatus::Unsupported => f.write_str("operation not supported"),
            DeviceStatus::NoDevice => f.write_str("device not configured"),
            DeviceStatus::Other(code) => {
                write!(f, "{}", std::io::Error::from_raw_os_error(*code))
            }
        }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DeviceFlags: u32 {
        const READ_ONLY = 1 << 0;
    }
}

/// Geometry and identity of the device to create.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceSpec {
    pub info: String,
    pub media_size: u64,
    pub sector_size: u32,
    pub flags: DeviceFlags,
}

/// Failure category for gateway device operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceErrorKind {
    /// The kernel facility is missing or could not be opened.
    Unavailable,
    /// The kernel refused the request (bad geometry, unknown unit).
    Rejected,
    /// The control call itself failed.
    Io,
}

/// Error surfaced by [`GatewayDevice`] implementations.
#[derive(Clone, Debug)]
pub struct DeviceError {
    kind: DeviceErrorKind,
    message: Option<String>,
}

impl DeviceError {
    pub const fn new(kind: DeviceErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    pub fn with_message(kind: DeviceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }

    pub fn kind(&self) -> DeviceErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{:?}: {}", self.kind, msg),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl std::error::Error for DeviceError {}

pub type DeviceResult<T> = core::result::Result<T, DeviceError>;

/// Local kernel block device whose requests this process services.
pub trait GatewayDevice {
    /// Open the kernel control facility.
    fn open(&mut self) -> DeviceResult<()>;

    /// Limit the control descriptor to the operations needed from now on.
    fn restrict(&mut self) -> DeviceResult<()>;

    /// Register a device of the given geometry and return its unit number.
    fn create(&mut self, spec: &DeviceSpec) -> DeviceResult<i32>;

    /// Unit number of the created device.
    fn unit(&self) -> i32;

    /// Block until the kernel hands out a request.
    ///
    /// Write payloads land in `buf`; `request.length` is the space offered on
    /// entry and the request length on return.
    fn start(&mut self, request: &mut PendingRequest, buf: &mut [u8])
        -> DeviceResult<DeviceStatus>;

    /// Report `request` complete; read payloads are taken from `buf`.
    fn done(&mut self, request: &PendingRequest, buf: &mut [u8]) -> DeviceResult<DeviceStatus>;

    /// Cancel an outstanding request, or all of them with [`Sequence::ALL`].
    fn cancel(&mut self, seq: Sequence) -> DeviceResult<()>;

    fn destroy(&mut self, force: bool) -> DeviceResult<()>;

    fn close(&mut self);
}
