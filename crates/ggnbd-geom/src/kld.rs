use std::io;

const MODULE_NAME: &str = "g_gate";
const MODULE_FILE: &str = "geom_gate";

/// Make sure the `geom_gate` kernel module is loaded.
#[cfg(target_os = "freebsd")]
pub fn load_module() -> io::Result<()> {
    use libc::{c_char, c_int};
    use std::ffi::CString;

    extern "C" {
        fn modfind(name: *const c_char) -> c_int;
        fn kldload(file: *const c_char) -> c_int;
    }

    let name = CString::new(MODULE_NAME)?;
    // SAFETY: `name` is a valid NUL-terminated string.
    if unsafe { modfind(name.as_ptr()) } != -1 {
        tracing::trace!(module = MODULE_NAME, "kernel module already present");
        return Ok(());
    }
    let file = CString::new(MODULE_FILE)?;
    // SAFETY: `file` is a valid NUL-terminated string.
    if unsafe { kldload(file.as_ptr()) } == -1 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(io::Error::new(
                err.kind(),
                format!("failed to load {MODULE_FILE} module: {err}"),
            ));
        }
    }
    tracing::debug!(module = MODULE_FILE, "loaded kernel module");
    Ok(())
}

#[cfg(not(target_os = "freebsd"))]
pub fn load_module() -> io::Result<()> {
    tracing::debug!(
        module = MODULE_NAME,
        file = MODULE_FILE,
        "kernel modules unavailable on this platform"
    );
    Ok(())
}
