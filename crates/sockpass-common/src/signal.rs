//! Handoff signal: a POSIX named semaphore used as a one-shot gate.
//!
//! The creator makes it with a count of zero (locked). The consumer blocks in
//! [`HandoffSignal::wait`] until the creator calls [`HandoffSignal::release`].

use std::{ffi::CString, io, ptr::NonNull, time::Duration};

use snafu::ResultExt;
use tracing::debug;

use crate::protocol_common::{
    CreateSnafu, Result, SyncSnafu, WaitTimeoutSnafu,
};

pub struct HandoffSignal {
    sem: NonNull<libc::sem_t>,
    name: String,
    owner: bool,
}

// SAFETY: sem_t handles returned by sem_open are process-wide and the sem_*
// calls are thread safe.
unsafe impl Send for HandoffSignal {}
unsafe impl Sync for HandoffSignal {}

fn sem_path(name: &str) -> io::Result<CString> {
    let path = if name.starts_with('/') {
        name.to_string()
    } else {
        format!("/{name}")
    };
    CString::new(path).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

impl HandoffSignal {
    /// Create the signal already held. Fails if the name exists.
    pub fn create_locked(name: &str) -> Result<Self> {
        let path = sem_path(name).context(CreateSnafu {
            op: "sem_open",
            name,
        })?;
        let sem = unsafe {
            libc::sem_open(
                path.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                0o600 as libc::c_uint,
                0 as libc::c_uint,
            )
        };
        let sem = Self::check_open(sem).context(CreateSnafu {
            op: "sem_open",
            name,
        })?;
        debug!(name, "created handoff signal (locked)");
        Ok(Self {
            sem,
            name: name.to_string(),
            owner: true,
        })
    }

    /// Open a signal some other process created. Never creates.
    pub fn open(name: &str) -> Result<Self> {
        let path = sem_path(name).context(CreateSnafu {
            op: "sem_open",
            name,
        })?;
        let sem = unsafe { libc::sem_open(path.as_ptr(), 0) };
        let sem = Self::check_open(sem).context(CreateSnafu {
            op: "sem_open",
            name,
        })?;
        debug!(name, "opened handoff signal");
        Ok(Self {
            sem,
            name: name.to_string(),
            owner: false,
        })
    }

    fn check_open(sem: *mut libc::sem_t) -> io::Result<NonNull<libc::sem_t>> {
        if sem == libc::SEM_FAILED {
            return Err(io::Error::last_os_error());
        }
        NonNull::new(sem).ok_or_else(io::Error::last_os_error)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Commit point: everything written before this call is visible to the
    /// process whose `wait` returns because of it.
    pub fn release(&self) -> Result<()> {
        let rc = unsafe { libc::sem_post(self.sem.as_ptr()) };
        if rc != 0 {
            return Err(io::Error::last_os_error()).context(SyncSnafu {
                op: "sem_post",
            });
        }
        debug!(name = %self.name, "released handoff signal");
        Ok(())
    }

    /// Block until the creator releases. No timeout.
    pub fn wait(&self) -> Result<()> {
        loop {
            let rc = unsafe { libc::sem_wait(self.sem.as_ptr()) };
            if rc == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err).context(SyncSnafu { op: "sem_wait" });
            }
        }
    }

    /// Like [`wait`](Self::wait) but gives up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<()> {
        let deadline = deadline_after(timeout).context(SyncSnafu {
            op: "clock_gettime",
        })?;
        loop {
            let rc =
                unsafe { libc::sem_timedwait(self.sem.as_ptr(), &raw const deadline) };
            if rc == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => {}
                Some(libc::ETIMEDOUT) => {
                    return WaitTimeoutSnafu {
                        name: self.name.clone(),
                        waited_ms: timeout.as_millis() as u64,
                    }
                    .fail();
                }
                _ => {
                    return Err(err).context(SyncSnafu {
                        op: "sem_timedwait",
                    });
                }
            }
        }
    }

    /// Try to take the signal without blocking. `Ok(false)` while held.
    pub fn try_wait(&self) -> Result<bool> {
        let rc = unsafe { libc::sem_trywait(self.sem.as_ptr()) };
        if rc == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EAGAIN) {
            return Ok(false);
        }
        Err(err).context(SyncSnafu { op: "sem_trywait" })
    }
}

// sem_timedwait takes an absolute CLOCK_REALTIME deadline
fn deadline_after(timeout: Duration) -> io::Result<libc::timespec> {
    let mut now = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    if unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &raw mut now) } != 0 {
        return Err(io::Error::last_os_error());
    }
    let nanos = now.tv_nsec as u64 + u64::from(timeout.subsec_nanos());
    Ok(libc::timespec {
        tv_sec: now.tv_sec
            + timeout.as_secs() as libc::time_t
            + (nanos / 1_000_000_000) as libc::time_t,
        tv_nsec: (nanos % 1_000_000_000) as libc::c_long,
    })
}

impl Drop for HandoffSignal {
    fn drop(&mut self) {
        unsafe {
            libc::sem_close(self.sem.as_ptr());
        }
        if self.owner {
            if let Ok(path) = sem_path(&self.name) {
                unsafe {
                    libc::sem_unlink(path.as_ptr());
                }
            }
        }
    }
}

impl std::fmt::Debug for HandoffSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandoffSignal")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}
