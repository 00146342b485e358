//! `g_gate` control structures and ioctls (`G_GATE_VERSION` 3).

#![allow(non_camel_case_types)]

use nix::{ioctl_readwrite, request_code_readwrite};
use std::mem::size_of;

pub const G_GATE_CTL_PATH: &str = "/dev/ggctl";
pub const G_GATE_VERSION: libc::c_uint = 3;
pub const G_GATE_UNIT_AUTO: libc::c_int = -1;
pub const G_GATE_FLAG_READONLY: libc::c_uint = 0x0001;
pub const G_GATE_INFOSIZE: usize = 2048;
pub const NAME_MAX: usize = 255;

pub const BIO_READ: libc::c_uint = 0x01;
pub const BIO_WRITE: libc::c_uint = 0x02;
pub const BIO_DELETE: libc::c_uint = 0x03;
pub const BIO_GETATTR: libc::c_uint = 0x04;
pub const BIO_FLUSH: libc::c_uint = 0x05;
pub const BIO_CMD0: libc::c_uint = 0x06;
pub const BIO_CMD1: libc::c_uint = 0x07;
pub const BIO_CMD2: libc::c_uint = 0x08;
pub const BIO_ZONE: libc::c_uint = 0x09;
pub const BIO_SPEEDUP: libc::c_uint = 0x0a;

const G_GATE_IOC_MAGIC: u8 = b'm';
const G_GATE_CMD_CREATE_NR: u8 = 0;
const G_GATE_CMD_DESTROY_NR: u8 = 2;
const G_GATE_CMD_CANCEL_NR: u8 = 3;
const G_GATE_CMD_START_NR: u8 = 4;
const G_GATE_CMD_DONE_NR: u8 = 5;

#[repr(C)]
pub struct g_gate_ctl_create {
    pub gctl_version: libc::c_uint,
    pub gctl_mediasize: libc::off_t,
    pub gctl_sectorsize: libc::c_uint,
    pub gctl_flags: libc::c_uint,
    pub gctl_maxcount: libc::c_uint,
    pub gctl_timeout: libc::c_uint,
    pub gctl_name: [libc::c_char; NAME_MAX],
    pub gctl_info: [libc::c_char; G_GATE_INFOSIZE],
    pub gctl_readprov: [libc::c_char; NAME_MAX],
    pub gctl_readoffset: libc::off_t,
    pub gctl_unit: libc::c_int,
}

#[repr(C)]
pub struct g_gate_ctl_destroy {
    pub gctl_version: libc::c_uint,
    pub gctl_unit: libc::c_int,
    pub gctl_force: libc::c_int,
    pub gctl_name: [libc::c_char; NAME_MAX],
}

#[repr(C)]
pub struct g_gate_ctl_cancel {
    pub gctl_version: libc::c_uint,
    pub gctl_unit: libc::c_int,
    pub gctl_seq: libc::uintptr_t,
    pub gctl_name: [libc::c_char; NAME_MAX],
}

#[repr(C)]
pub struct g_gate_ctl_io {
    pub gctl_version: libc::c_uint,
    pub gctl_unit: libc::c_int,
    pub gctl_seq: libc::uintptr_t,
    pub gctl_cmd: libc::c_uint,
    pub gctl_offset: libc::off_t,
    pub gctl_length: libc::off_t,
    pub gctl_data: *mut libc::c_void,
    pub gctl_error: libc::c_int,
}

impl g_gate_ctl_create {
    pub fn zeroed() -> Self {
        // SAFETY: plain integers and byte arrays; all-zero is a valid value.
        unsafe { std::mem::zeroed() }
    }
}

impl g_gate_ctl_destroy {
    pub fn new(unit: libc::c_int, force: bool) -> Self {
        Self {
            gctl_version: G_GATE_VERSION,
            gctl_unit: unit,
            gctl_force: force.into(),
            gctl_name: [0; NAME_MAX],
        }
    }
}

impl g_gate_ctl_cancel {
    pub fn new(unit: libc::c_int, seq: libc::uintptr_t) -> Self {
        Self {
            gctl_version: G_GATE_VERSION,
            gctl_unit: unit,
            gctl_seq: seq,
            gctl_name: [0; NAME_MAX],
        }
    }
}

ioctl_readwrite!(
    ggate_create,
    G_GATE_IOC_MAGIC,
    G_GATE_CMD_CREATE_NR,
    g_gate_ctl_create
);
ioctl_readwrite!(
    ggate_destroy,
    G_GATE_IOC_MAGIC,
    G_GATE_CMD_DESTROY_NR,
    g_gate_ctl_destroy
);
ioctl_readwrite!(
    ggate_cancel,
    G_GATE_IOC_MAGIC,
    G_GATE_CMD_CANCEL_NR,
    g_gate_ctl_cancel
);
ioctl_readwrite!(ggate_start, G_GATE_IOC_MAGIC, G_GATE_CMD_START_NR, g_gate_ctl_io);
ioctl_readwrite!(ggate_done, G_GATE_IOC_MAGIC, G_GATE_CMD_DONE_NR, g_gate_ctl_io);

/// Request codes the control descriptor keeps once restricted.
pub fn control_ioctls() -> [libc::c_ulong; 5] {
    [
        request_code_readwrite!(
            G_GATE_IOC_MAGIC,
            G_GATE_CMD_CREATE_NR,
            size_of::<g_gate_ctl_create>()
        ) as libc::c_ulong,
        request_code_readwrite!(
            G_GATE_IOC_MAGIC,
            G_GATE_CMD_DESTROY_NR,
            size_of::<g_gate_ctl_destroy>()
        ) as libc::c_ulong,
        request_code_readwrite!(
            G_GATE_IOC_MAGIC,
            G_GATE_CMD_CANCEL_NR,
            size_of::<g_gate_ctl_cancel>()
        ) as libc::c_ulong,
        request_code_readwrite!(
            G_GATE_IOC_MAGIC,
            G_GATE_CMD_START_NR,
            size_of::<g_gate_ctl_io>()
        ) as libc::c_ulong,
        request_code_readwrite!(
            G_GATE_IOC_MAGIC,
            G_GATE_CMD_DONE_NR,
            size_of::<g_gate_ctl_io>()
        ) as libc::c_ulong,
    ]
}

/// Copy `src` into a NUL-terminated fixed-size C string field, truncating.
pub fn fill_cstr(dst: &mut [libc::c_char], src: &str) {
    let len = src.len().min(dst.len().saturating_sub(1));
    for (d, s) in dst.iter_mut().zip(&src.as_bytes()[..len]) {
        *d = *s as libc::c_char;
    }
    if let Some(rest) = dst.get_mut(len..) {
        rest.fill(0);
    }
}
