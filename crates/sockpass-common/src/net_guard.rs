use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use snafu::ResultExt;
use tracing::debug;

use crate::protocol_common::{GuardHeldSnafu, Result, SyncSnafu};

static HELD: AtomicBool = AtomicBool::new(false);

/// Process-wide socket setup, taken once at entry and undone on drop.
///
/// Ignores `SIGPIPE` so a write to a vanished peer comes back as `EPIPE`
/// through the framed channel instead of killing the process.
///
/// A Rust binary's runtime already sets `SIGPIPE` to ignore before `main`, so
/// in `sockpass` itself acquiring the guard leaves the disposition as it was.
/// It changes something when the library runs in a process that starts with
/// the default action, such as one embedded in a C host.
pub struct NetGuard {
    previous: SigAction,
}

impl std::fmt::Debug for NetGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetGuard").finish_non_exhaustive()
    }
}

impl NetGuard {
    pub fn acquire() -> Result<Self> {
        if HELD.swap(true, Ordering::SeqCst) {
            return GuardHeldSnafu.fail();
        }
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        let previous = match unsafe { sigaction(Signal::SIGPIPE, &ignore) } {
            Ok(previous) => previous,
            Err(errno) => {
                HELD.store(false, Ordering::SeqCst);
                return Err(std::io::Error::from(errno)).context(SyncSnafu {
                    op: "sigaction",
                });
            }
        };
        debug!("network guard acquired");
        Ok(Self { previous })
    }
}

impl Drop for NetGuard {
    fn drop(&mut self) {
        unsafe {
            let _ = sigaction(Signal::SIGPIPE, &self.previous);
        }
        HELD.store(false, Ordering::SeqCst);
        debug!("network guard released");
    }
}
