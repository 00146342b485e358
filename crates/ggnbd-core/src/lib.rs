//! Core of ggnbd: services one kernel gateway device from one NBD session.
//!
//! The [`ServiceLoop`] turns each kernel request into protocol exchanges and
//! back; the [`Lifecycle`] acquires, sandboxes and releases the two handles the
//! loop borrows.

pub mod buffer;
pub mod cancel;
pub mod device;
pub mod lifecycle;
pub mod service;
pub mod session;

#[cfg(test)]
mod mock;

pub use buffer::TransferBuffer;
pub use cancel::{install_interrupt_handler, Cancellation};
pub use device::{
    DeviceError, DeviceErrorKind, DeviceFlags, DeviceResult, DeviceSpec, DeviceStatus,
    GatewayDevice, IoCommand, PendingRequest, RawCommand, Sequence, ERR_UNSUPPORTED,
};
pub use lifecycle::{Acquired, Lifecycle, LinkConfig, Platform};
pub use service::{LoopState, Outcome, ServiceLoop, Step};
pub use session::{
    ProtocolSession, ReplyError, SendOutcome, SessionError, SessionErrorKind, SessionResult,
};
