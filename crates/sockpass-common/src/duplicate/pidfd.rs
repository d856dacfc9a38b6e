use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};

use bytemuck::{Pod, Zeroable};
use rustix::process::{Pid, PidfdFlags, PidfdGetfdFlags, pidfd_getfd, pidfd_open};
use snafu::ResultExt;
use tracing::{debug, warn};

use super::{Backend, DuplicationBackend, ProtocolDescriptor};
use crate::protocol_common::{BadDescriptorSnafu, DuplicateSnafu, Result};

#[repr(C)]
#[derive(Clone, Copy, Zeroable, Pod)]
struct PidFdPayload {
    source_pid: u32,
    source_fd: i32,
}

/// The target reaches into the source process and copies the fd with
/// `pidfd_getfd`. The source has to keep the socket open until then.
///
/// Any ptracer exception made for the target is withdrawn when the backend is
/// dropped, which [`ParentHandoff`](crate::coordinator::ParentHandoff) does
/// once the child has been reaped.
#[derive(Debug, Default)]
pub struct PidFdBackend {
    ptracer: Option<u32>,
}

fn set_ptracer(value: libc::c_ulong) -> std::io::Result<()> {
    let rc = unsafe { libc::prctl(libc::PR_SET_PTRACER, value, 0, 0, 0) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

// Under Yama ptrace_scope=1 only an ancestor may pidfd_getfd from us, so name
// the child explicitly. EINVAL means Yama is not loaded and there is nothing
// to relax.
fn allow_ptracer(target_pid: u32) -> bool {
    match set_ptracer(libc::c_ulong::from(target_pid)) {
        Ok(()) => true,
        Err(err) => {
            if err.raw_os_error() != Some(libc::EINVAL) {
                warn!(target_pid, %err, "PR_SET_PTRACER failed");
            }
            false
        }
    }
}

impl PidFdBackend {
    /// The pid currently allowed to trace this process, if one was set.
    #[must_use]
    pub fn ptracer(&self) -> Option<u32> {
        self.ptracer
    }

    pub fn clear_ptracer(&mut self) {
        let Some(target_pid) = self.ptracer.take() else {
            return;
        };
        match set_ptracer(0) {
            Ok(()) => debug!(target_pid, "ptracer exception withdrawn"),
            Err(err) => warn!(target_pid, %err, "could not reset PR_SET_PTRACER"),
        }
    }
}

impl Drop for PidFdBackend {
    fn drop(&mut self) {
        self.clear_ptracer();
    }
}

impl DuplicationBackend for PidFdBackend {
    fn kind(&self) -> Backend {
        Backend::PidFd
    }

    fn duplicate(
        &mut self,
        socket: BorrowedFd<'_>,
        target_pid: u32,
    ) -> Result<ProtocolDescriptor> {
        if allow_ptracer(target_pid) {
            self.ptracer = Some(target_pid);
        }
        let payload = PidFdPayload {
            source_pid: std::process::id(),
            source_fd: socket.as_raw_fd(),
        };
        debug!(
            target_pid,
            source_fd = payload.source_fd,
            "duplicated socket via pidfd"
        );
        Ok(ProtocolDescriptor::new(Backend::PidFd, target_pid, &payload))
    }

    fn reconstruct(&self, descriptor: &ProtocolDescriptor) -> Result<OwnedFd> {
        let payload: PidFdPayload = descriptor.payload();
        let pid = Pid::from_raw(payload.source_pid as i32).ok_or_else(|| {
            BadDescriptorSnafu {
                op: "pidfd_open",
                reason: format!("invalid source pid {}", payload.source_pid),
            }
            .build()
        })?;

        let pidfd = pidfd_open(pid, PidfdFlags::empty())
            .map_err(std::io::Error::from)
            .context(DuplicateSnafu { op: "pidfd_open" })?;
        let fd = pidfd_getfd(&pidfd, payload.source_fd, PidfdGetfdFlags::empty())
            .map_err(std::io::Error::from)
            .context(DuplicateSnafu { op: "pidfd_getfd" })?;
        debug!(
            source_pid = payload.source_pid,
            source_fd = payload.source_fd,
            "reconstructed socket via pidfd"
        );
        Ok(fd)
    }
}
