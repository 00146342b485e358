//! Capsicum capability mode and per-descriptor rights limits.
//!
//! Every function is a logged no-op on targets without Capsicum, so callers can
//! sandbox unconditionally.

use bitflags::bitflags;
use std::{io, os::fd::RawFd};

bitflags! {
    /// Descriptor rights understood by [`limit_rights`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Rights: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const FCNTL = 1 << 2;
        const FSTAT = 1 << 3;
        const SHUTDOWN = 1 << 4;
        const EVENT = 1 << 5;
        const IOCTL = 1 << 6;
    }
}

/// Two-word rights set as laid out by `cap_rights_t` (version 0).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawRights {
    pub words: [u64; 2],
}

const fn capright(index: u32, bit: u64) -> u64 {
    (1u64 << (57 + index)) | bit
}

impl Rights {
    /// Encode into the kernel's two-word representation.
    pub fn to_raw(self) -> RawRights {
        const TABLE: [(Rights, u32, u64); 7] = [
            (Rights::READ, 0, 0x0000_0000_0000_0001),
            (Rights::WRITE, 0, 0x0000_0000_0000_0002),
            (Rights::FCNTL, 0, 0x0000_0000_0000_8000),
            (Rights::FSTAT, 0, 0x0000_0000_0008_0000),
            (Rights::SHUTDOWN, 0, 0x0000_0040_0000_0000),
            (Rights::EVENT, 1, 0x0000_0000_0000_0020),
            (Rights::IOCTL, 1, 0x0000_0000_0000_0080),
        ];
        let mut words = [capright(0, 0), capright(1, 0)];
        for (right, index, bit) in TABLE {
            if self.contains(right) {
                words[index as usize] |= capright(index, bit);
            }
        }
        RawRights { words }
    }
}

/// Rights left on a connected protocol socket.
pub const SOCKET_RIGHTS: Rights = Rights::READ
    .union(Rights::WRITE)
    .union(Rights::SHUTDOWN)
    .union(Rights::FSTAT)
    .union(Rights::EVENT);

#[cfg(target_os = "freebsd")]
mod sys {
    use super::RawRights;
    use libc::{c_int, c_ulong, size_t};

    extern "C" {
        pub fn cap_enter() -> c_int;
        pub fn cap_rights_limit(fd: c_int, rights: *const RawRights) -> c_int;
        pub fn cap_ioctls_limit(fd: c_int, cmds: *const c_ulong, ncmds: size_t) -> c_int;
    }
}

/// Enter capability mode. Global namespaces are unreachable afterwards.
#[cfg(target_os = "freebsd")]
pub fn enter_capability_mode() -> io::Result<()> {
    // SAFETY: no arguments; failure is reported through errno.
    if unsafe { sys::cap_enter() } == -1 {
        let err = io::Error::last_os_error();
        // Kernels built without capability mode report ENOSYS.
        if err.raw_os_error() == Some(libc::ENOSYS) {
            tracing::warn!("kernel lacks capability mode; continuing unsandboxed");
            return Ok(());
        }
        return Err(err);
    }
    tracing::debug!("entered capability mode");
    Ok(())
}

#[cfg(not(target_os = "freebsd"))]
pub fn enter_capability_mode() -> io::Result<()> {
    tracing::debug!("capability mode unavailable on this platform");
    Ok(())
}

/// Restrict `fd` to `rights`.
#[cfg(target_os = "freebsd")]
pub fn limit_rights(fd: RawFd, rights: Rights) -> io::Result<()> {
    let raw = rights.to_raw();
    // SAFETY: `raw` is a valid version-0 rights structure for the call's duration.
    if unsafe { sys::cap_rights_limit(fd, &raw) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "freebsd"))]
pub fn limit_rights(fd: RawFd, rights: Rights) -> io::Result<()> {
    tracing::debug!(fd, ?rights, "rights limits unavailable on this platform");
    Ok(())
}

/// Restrict `fd` to the listed ioctl commands.
#[cfg(target_os = "freebsd")]
pub fn limit_ioctls(fd: RawFd, cmds: &[libc::c_ulong]) -> io::Result<()> {
    // SAFETY: the pointer and length describe `cmds`.
    if unsafe { sys::cap_ioctls_limit(fd, cmds.as_ptr(), cmds.len()) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "freebsd"))]
pub fn limit_ioctls(fd: RawFd, cmds: &[libc::c_ulong]) -> io::Result<()> {
    tracing::debug!(fd, count = cmds.len(), "ioctl limits unavailable on this platform");
    Ok(())
}

/// Limit the standard descriptors to terminal-friendly rights.
///
/// Descriptors that are already closed are skipped.
pub fn limit_stdio() -> io::Result<()> {
    let base = Rights::FCNTL | Rights::FSTAT | Rights::IOCTL | Rights::EVENT;
    for (fd, extra) in [(0, Rights::READ), (1, Rights::WRITE), (2, Rights::WRITE)] {
        match limit_rights(fd, base | extra).and_then(|()| limit_ioctls(fd, stdio_ioctls())) {
            Ok(()) => {}
            Err(err) if err.raw_os_error() == Some(libc::EBADF) => {}
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

#[cfg(target_os = "freebsd")]
fn stdio_ioctls() -> &'static [libc::c_ulong] {
    &[libc::TIOCGETA, libc::TIOCGWINSZ]
}

#[cfg(not(target_os = "freebsd"))]
fn stdio_ioctls() -> &'static [libc::c_ulong] {
    &[]
}
