//! Request-servicing state machine.
//!
//! One [`PendingRequest`] is driven at a time:
//!
//! ```text
//! Setup -> Start -> Command -> Header -> (Data) -> EndCommand -> Setup ...
//! ```
//!
//! Every transition yields a [`LoopState`]: the next [`Step`] or one of the
//! two terminal outcomes. The [`Cancellation`] flag is consulted between
//! transitions only; a transition blocked in a system call relies on that call
//! failing and maps the failure to [`LoopState::Completed`] itself.

use crate::{
    buffer::TransferBuffer,
    cancel::Cancellation,
    device::{DeviceStatus, GatewayDevice, IoCommand, PendingRequest},
    session::{ProtocolSession, ReplyError, SendOutcome, SessionResult},
};
use core::fmt;
use tracing::{debug, error, info, trace, warn};

/// Non-terminal states of the machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Step {
    Setup,
    Start,
    Command,
    Header,
    Data,
    EndCommand,
}

impl Step {
    fn as_str(self) -> &'static str {
        match self {
            Step::Setup => "setup",
            Step::Start => "start",
            Step::Command => "command",
            Step::Header => "header",
            Step::Data => "data",
            Step::EndCommand => "end_command",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do next: run a step, or stop with an outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Continue(Step),
    Completed,
    Failed,
}

/// Terminal result of the servicing loop or the whole connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    Failed,
}

impl Outcome {
    pub fn is_success(self) -> bool {
        self == Outcome::Completed
    }
}

/// Services kernel requests against a borrowed device and session.
pub struct ServiceLoop<'a, D, S> {
    device: &'a mut D,
    session: &'a mut S,
    request: PendingRequest,
    buffer: TransferBuffer,
    cancel: Cancellation,
}

impl<'a, D, S> ServiceLoop<'a, D, S>
where
    D: GatewayDevice,
    S: ProtocolSession,
{
    pub fn new(
        device: &'a mut D,
        session: &'a mut S,
        buffer: TransferBuffer,
        cancel: Cancellation,
    ) -> Self {
        let request = PendingRequest::new(device.unit());
        Self {
            device,
            session,
            request,
            buffer,
            cancel,
        }
    }

    /// The request most recently handed out by the device.
    pub fn request(&self) -> &PendingRequest {
        &self.request
    }

    /// Run until a terminal state is reached or cancellation is observed.
    pub fn run(&mut self) -> Outcome {
        let mut state = LoopState::Continue(Step::Setup);
        loop {
            if self.cancel.is_raised() {
                debug!(seq = %self.request.seq, "cancellation observed");
                self.session.set_disconnect(true);
                self.cancel_in_flight();
                return Outcome::Completed;
            }
            state = match state {
                LoopState::Completed => return Outcome::Completed,
                LoopState::Failed => {
                    self.cancel_in_flight();
                    return Outcome::Failed;
                }
                LoopState::Continue(step) => self.transition(step),
            };
        }
    }

    /// Execute a single step.
    pub fn transition(&mut self, step: Step) -> LoopState {
        trace!(step = %step, seq = %self.request.seq, "transition");
        match step {
            Step::Setup => self.setup(),
            Step::Start => self.start(),
            Step::Command => self.command(),
            Step::Header => self.header(),
            Step::Data => self.data(),
            Step::EndCommand => self.end_command(),
        }
    }

    fn cancel_in_flight(&mut self) {
        if let Err(err) = self.device.cancel(self.request.seq) {
            warn!(seq = %self.request.seq, error = %err, "cancel in-flight request failed");
        }
    }

    fn setup(&mut self) -> LoopState {
        self.request.reset(self.buffer.capacity());
        LoopState::Continue(Step::Start)
    }

    fn start(&mut self) -> LoopState {
        match self.device.start(&mut self.request, self.buffer.as_mut_slice()) {
            Ok(DeviceStatus::Success) => {
                trace!(
                    seq = %self.request.seq,
                    cmd = %self.request.command,
                    offset = self.request.offset,
                    length = self.request.length,
                    "request started"
                );
                LoopState::Continue(Step::Command)
            }
            Ok(DeviceStatus::Canceled) => LoopState::Completed,
            Ok(status) => {
                error!(status = %status, "gateway control operation failed");
                LoopState::Failed
            }
            // The wait was interrupted by the signal that raised the flag.
            Err(_) if self.cancel.is_raised() => LoopState::Completed,
            Err(err) => {
                error!(error = %err, "gateway start request failed");
                LoopState::Failed
            }
        }
    }

    fn command(&mut self) -> LoopState {
        if matches!(self.request.command, IoCommand::Read | IoCommand::Write)
            && self.request.length > self.buffer.capacity() as u64
        {
            error!(
                cmd = %self.request.command,
                length = self.request.length,
                capacity = self.buffer.capacity(),
                "request exceeds transfer buffer"
            );
            return LoopState::Failed;
        }
        match self.dispatch() {
            Ok(SendOutcome::Sent) => LoopState::Continue(Step::Header),
            Ok(SendOutcome::Unsupported) => {
                self.request.set_unsupported();
                LoopState::Continue(Step::EndCommand)
            }
            Err(err) => {
                error!(cmd = %self.request.command, error = %err, "protocol client error");
                LoopState::Failed
            }
        }
    }

    fn dispatch(&mut self) -> SessionResult<SendOutcome> {
        let PendingRequest {
            seq,
            command,
            offset,
            length,
            ..
        } = self.request;
        match command {
            IoCommand::Read => self.session.send_read(seq, offset, length),
            IoCommand::Write => {
                let data = &self.buffer.as_slice()[..length as usize];
                self.session.send_write(seq, offset, length, data)
            }
            IoCommand::Delete => self.session.send_trim(seq, offset, length),
            IoCommand::Flush => self.session.send_flush(seq),
            IoCommand::Unsupported(raw) => {
                info!(cmd = %raw, "unsupported operation");
                Ok(SendOutcome::Unsupported)
            }
        }
    }

    fn header(&mut self) -> LoopState {
        match self.session.recv_reply_header() {
            Ok(seq) if seq != self.request.seq => {
                error!(
                    expected = %self.request.seq,
                    received = %seq,
                    "reply does not match the outstanding request"
                );
                LoopState::Failed
            }
            Ok(_) if self.request.command == IoCommand::Read => LoopState::Continue(Step::Data),
            Ok(_) => LoopState::Continue(Step::EndCommand),
            Err(ReplyError::Rejected { errno }) => self.rejected(errno),
            Err(ReplyError::Failed(_)) if self.cancel.is_raised() => LoopState::Completed,
            Err(ReplyError::Failed(err)) => {
                error!(error = %err, "error receiving reply header");
                LoopState::Failed
            }
        }
    }

    fn rejected(&mut self, errno: u32) -> LoopState {
        if self.request.command == IoCommand::Delete {
            // Some servers advertise trim and then refuse it.
            debug!(seq = %self.request.seq, errno, "server rejected trim; disabling");
            self.session.disable_trim();
            self.request.set_unsupported();
            return LoopState::Continue(Step::EndCommand);
        }
        error!(
            errno,
            cmd = %self.request.command,
            offset = format_args!("{:#x} ({})", self.request.offset, self.request.offset),
            length = format_args!("{:#x} ({})", self.request.length, self.request.length),
            "server rejected command request"
        );
        LoopState::Failed
    }

    fn data(&mut self) -> LoopState {
        let len = self.request.length as usize;
        match self
            .session
            .recv_reply_data(&mut self.buffer.as_mut_slice()[..len])
        {
            Ok(()) => LoopState::Continue(Step::EndCommand),
            Err(_) if self.cancel.is_raised() => LoopState::Completed,
            Err(err) => {
                error!(error = %err, "error receiving reply data");
                LoopState::Failed
            }
        }
    }

    fn end_command(&mut self) -> LoopState {
        match self.device.done(&self.request, self.buffer.as_mut_slice()) {
            Ok(DeviceStatus::Success | DeviceStatus::Unsupported) => {
                LoopState::Continue(Step::Setup)
            }
            Ok(DeviceStatus::Canceled) => LoopState::Completed,
            Ok(status) => {
                error!(status = %status, "gateway control operation failed");
                LoopState::Failed
            }
            Err(err) => {
                error!(error = %err, "could not complete transaction");
                LoopState::Failed
            }
        }
    }
}
