//! Subscriber setup: stderr when attached to a terminal, always the system log.

use anyhow::{Context, Result};
use std::{
    ffi::CString,
    io::{self, IsTerminal, Write},
    sync::OnceLock,
};
use tracing::{Level, Metadata, Subscriber};
use tracing_subscriber::{fmt::MakeWriter, prelude::*, registry::LookupSpan, EnvFilter, Layer};

static IDENT: OnceLock<CString> = OnceLock::new();

fn priority(level: &Level) -> libc::c_int {
    match *level {
        Level::ERROR => libc::LOG_ERR,
        Level::WARN => libc::LOG_WARNING,
        Level::INFO => libc::LOG_INFO,
        Level::DEBUG | Level::TRACE => libc::LOG_DEBUG,
    }
}

/// Writer factory handing each formatted event to `syslog(3)`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Syslog;

impl<'a> MakeWriter<'a> for Syslog {
    type Writer = SyslogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SyslogWriter::new(libc::LOG_INFO)
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        SyslogWriter::new(priority(meta.level()))
    }
}

/// Buffers one event and submits it when dropped.
pub struct SyslogWriter {
    priority: libc::c_int,
    line: Vec<u8>,
}

impl SyslogWriter {
    fn new(priority: libc::c_int) -> Self {
        Self {
            priority,
            line: Vec::new(),
        }
    }

    fn message(&self) -> Option<CString> {
        let text: Vec<u8> = self
            .line
            .iter()
            .copied()
            .filter(|b| *b != 0)
            .collect();
        let trimmed = text.trim_ascii_end();
        if trimmed.is_empty() {
            return None;
        }
        CString::new(trimmed).ok()
    }
}

impl Write for SyslogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.line.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for SyslogWriter {
    fn drop(&mut self) {
        if let Some(message) = self.message() {
            // SAFETY: both strings are NUL-terminated; the format consumes one `%s`.
            unsafe { libc::syslog(self.priority, c"%s".as_ptr(), message.as_ptr()) };
        }
    }
}

fn open_syslog(ident: Option<String>, option: libc::c_int, facility: libc::c_int) -> Result<()> {
    let ident = match ident {
        Some(ident) => {
            let ident = CString::new(ident).context("syslog identity contains NUL")?;
            IDENT.get_or_init(|| ident).as_ptr()
        }
        None => std::ptr::null(),
    };
    // SAFETY: `ident` is null or points into a string that lives for the process.
    unsafe { libc::openlog(ident, option, facility) };
    Ok(())
}

fn syslog_layer<S>() -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    tracing_subscriber::fmt::layer()
        .with_writer(Syslog)
        .with_ansi(false)
        .without_time()
        .with_level(false)
        .with_target(false)
}

/// Stack used when stderr is a terminal: stderr plus the system log.
fn terminal_subscriber(filter: EnvFilter) -> impl Subscriber + Send + Sync + 'static {
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(syslog_layer())
}

fn detached_subscriber(filter: EnvFilter) -> impl Subscriber + Send + Sync + 'static {
    tracing_subscriber::registry()
        .with(filter)
        .with(syslog_layer())
}

/// Install the global subscriber for a connection to `host:port`.
///
/// The system log connection is opened immediately so it survives entering
/// capability mode.
pub fn init(host: &str, port: u16) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    if io::stderr().is_terminal() {
        open_syslog(None, libc::LOG_NDELAY, libc::LOG_USER)?;
        terminal_subscriber(filter)
            .try_init()
            .context("install log subscriber")?;
    } else {
        let ident = format!("{} ({host}:{port})", env!("CARGO_BIN_NAME"));
        open_syslog(
            Some(ident),
            libc::LOG_NDELAY | libc::LOG_CONS | libc::LOG_PID,
            libc::LOG_DAEMON,
        )?;
        detached_subscriber(filter)
            .try_init()
            .context("install log subscriber")?;
    }
    Ok(())
}
