use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::atomic::{AtomicBool, Ordering};

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Cooperative stop request observed by the servicing loop between cycles.
///
/// The process-wide instance is raised only from the `SIGINT` handler.
#[derive(Clone, Copy, Debug)]
pub struct Cancellation {
    flag: &'static AtomicBool,
}

impl Cancellation {
    /// The flag the interrupt handler raises.
    pub fn process() -> Self {
        Self { flag: &INTERRUPTED }
    }

    /// A flag independent of the interrupt handler.
    pub fn with_flag(flag: &'static AtomicBool) -> Self {
        Self { flag }
    }

    pub fn is_raised(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn raise(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

extern "C" fn on_interrupt(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Route `SIGINT` to the process-wide [`Cancellation`].
///
/// `SA_RESTART` stays clear: a blocked read or ioctl returns `EINTR` to the
/// transition that issued it.
pub fn install_interrupt_handler() -> nix::Result<Cancellation> {
    let action = SigAction::new(
        SigHandler::Handler(on_interrupt),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // SAFETY: the handler only performs an atomic store.
    unsafe { sigaction(Signal::SIGINT, &action) }?;
    Ok(Cancellation::process())
}
