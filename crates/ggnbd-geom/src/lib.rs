//! GEOM Gate device handle: the kernel side of a ggnbd connection.
//!
//! Requests are pulled from `/dev/ggctl` with `G_GATE_CMD_START` and handed
//! back with `G_GATE_CMD_DONE`, one at a time.

mod kld;
pub mod sys;

pub use kld::load_module;

use ggnbd_core::{
    DeviceError, DeviceErrorKind, DeviceFlags, DeviceResult, DeviceSpec, DeviceStatus,
    GatewayDevice, IoCommand, PendingRequest, RawCommand, Sequence,
};
use std::{
    fs::{File, OpenOptions},
    os::fd::AsRawFd,
};
use tracing::{debug, trace};

/// Decode a kernel `BIO_*` code.
pub fn decode_command(code: u32) -> IoCommand {
    let name = match code {
        sys::BIO_READ => return IoCommand::Read,
        sys::BIO_WRITE => return IoCommand::Write,
        sys::BIO_DELETE => return IoCommand::Delete,
        sys::BIO_FLUSH => return IoCommand::Flush,
        sys::BIO_GETATTR => Some("BIO_GETATTR"),
        sys::BIO_CMD0 => Some("BIO_CMD0"),
        sys::BIO_CMD1 => Some("BIO_CMD1"),
        sys::BIO_CMD2 => Some("BIO_CMD2"),
        sys::BIO_ZONE => Some("BIO_ZONE"),
        sys::BIO_SPEEDUP => Some("BIO_SPEEDUP"),
        _ => None,
    };
    IoCommand::Unsupported(RawCommand { code, name })
}

fn encode_command(command: IoCommand) -> u32 {
    match command {
        IoCommand::Read => sys::BIO_READ,
        IoCommand::Write => sys::BIO_WRITE,
        IoCommand::Delete => sys::BIO_DELETE,
        IoCommand::Flush => sys::BIO_FLUSH,
        IoCommand::Unsupported(raw) => raw.code,
    }
}

fn ioctl_error(op: &str, err: nix::Error) -> DeviceError {
    DeviceError::with_message(DeviceErrorKind::Io, format!("{op}: {err}"))
}

/// Handle on the gate control device and the unit created through it.
pub struct GgateDevice {
    ctl: Option<File>,
    unit: i32,
}

impl Default for GgateDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl GgateDevice {
    pub fn new() -> Self {
        Self {
            ctl: None,
            unit: sys::G_GATE_UNIT_AUTO,
        }
    }

    fn fd(&self) -> DeviceResult<i32> {
        self.ctl
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .ok_or_else(|| DeviceError::with_message(DeviceErrorKind::Unavailable, "not open"))
    }

    fn io_request(&self, request: &PendingRequest, buf: &mut [u8]) -> sys::g_gate_ctl_io {
        sys::g_gate_ctl_io {
            gctl_version: sys::G_GATE_VERSION,
            gctl_unit: self.unit,
            gctl_seq: request.seq.0 as libc::uintptr_t,
            gctl_cmd: encode_command(request.command),
            gctl_offset: request.offset as libc::off_t,
            gctl_length: request.length.min(buf.len() as u64) as libc::off_t,
            gctl_data: buf.as_mut_ptr().cast(),
            gctl_error: request.error,
        }
    }
}

impl GatewayDevice for GgateDevice {
    fn open(&mut self) -> DeviceResult<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(sys::G_GATE_CTL_PATH)
            .map_err(|err| {
                DeviceError::with_message(
                    DeviceErrorKind::Unavailable,
                    format!("{}: {err}", sys::G_GATE_CTL_PATH),
                )
            })?;
        debug!(path = sys::G_GATE_CTL_PATH, "opened gate control device");
        self.ctl = Some(file);
        Ok(())
    }

    fn restrict(&mut self) -> DeviceResult<()> {
        let fd = self.fd()?;
        let rights = ggnbd_capsicum::Rights::IOCTL;
        ggnbd_capsicum::limit_rights(fd, rights)
            .and_then(|()| ggnbd_capsicum::limit_ioctls(fd, &sys::control_ioctls()))
            .map_err(|err| {
                DeviceError::with_message(DeviceErrorKind::Io, format!("limit rights: {err}"))
            })
    }

    fn create(&mut self, spec: &DeviceSpec) -> DeviceResult<i32> {
        let fd = self.fd()?;
        let mut req = sys::g_gate_ctl_create::zeroed();
        req.gctl_version = sys::G_GATE_VERSION;
        req.gctl_mediasize = i64::try_from(spec.media_size).map_err(|_| {
            DeviceError::with_message(DeviceErrorKind::Rejected, "media size out of range")
        })? as libc::off_t;
        req.gctl_sectorsize = spec.sector_size;
        if spec.flags.contains(DeviceFlags::READ_ONLY) {
            req.gctl_flags |= sys::G_GATE_FLAG_READONLY;
        }
        req.gctl_unit = sys::G_GATE_UNIT_AUTO;
        sys::fill_cstr(&mut req.gctl_info, &spec.info);
        // SAFETY: `req` is a fully initialised version 3 create request.
        unsafe { sys::ggate_create(fd, &mut req) }.map_err(|err| {
            DeviceError::with_message(DeviceErrorKind::Rejected, format!("create: {err}"))
        })?;
        self.unit = req.gctl_unit;
        debug!(unit = self.unit, info = %spec.info, "created gate device");
        Ok(self.unit)
    }

    fn unit(&self) -> i32 {
        self.unit
    }

    fn start(
        &mut self,
        request: &mut PendingRequest,
        buf: &mut [u8],
    ) -> DeviceResult<DeviceStatus> {
        let fd = self.fd()?;
        let mut io = self.io_request(request, buf);
        // SAFETY: `gctl_data` points at `buf` and `gctl_length` does not exceed it.
        unsafe { sys::ggate_start(fd, &mut io) }.map_err(|err| ioctl_error("start", err))?;
        request.seq = Sequence(io.gctl_seq as u64);
        request.command = decode_command(io.gctl_cmd);
        request.offset = io.gctl_offset as u64;
        request.length = io.gctl_length as u64;
        request.error = io.gctl_error;
        trace!(seq = %request.seq, cmd = %request.command, "start");
        Ok(DeviceStatus::from_errno(io.gctl_error))
    }

    fn done(&mut self, request: &PendingRequest, buf: &mut [u8]) -> DeviceResult<DeviceStatus> {
        let fd = self.fd()?;
        let mut io = self.io_request(request, buf);
        // SAFETY: as for start; the kernel only reads `buf` for completed reads.
        unsafe { sys::ggate_done(fd, &mut io) }.map_err(|err| ioctl_error("done", err))?;
        Ok(DeviceStatus::from_errno(io.gctl_error))
    }

    fn cancel(&mut self, seq: Sequence) -> DeviceResult<()> {
        let fd = self.fd()?;
        let mut req = sys::g_gate_ctl_cancel::new(self.unit, seq.0 as libc::uintptr_t);
        // SAFETY: `req` is a valid cancel request.
        unsafe { sys::ggate_cancel(fd, &mut req) }.map_err(|err| ioctl_error("cancel", err))?;
        Ok(())
    }

    fn destroy(&mut self, force: bool) -> DeviceResult<()> {
        let fd = self.fd()?;
        let mut req = sys::g_gate_ctl_destroy::new(self.unit, force);
        // SAFETY: `req` is a valid destroy request.
        unsafe { sys::ggate_destroy(fd, &mut req) }.map_err(|err| ioctl_error("destroy", err))?;
        debug!(unit = self.unit, "destroyed gate device");
        Ok(())
    }

    fn close(&mut self) {
        self.ctl = None;
    }
}
