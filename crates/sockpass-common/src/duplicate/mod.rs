//! Socket duplication for a specific target process.
//!
//! A backend turns a live socket plus a target pid into a
//! [`ProtocolDescriptor`]; only the target process can turn that descriptor
//! back into a socket with [`reconstruct`].
//!
//! - `pidfd`: the target pulls the fd out of the source with `pidfd_getfd`
//! - `scm-rights`: the source serves the fd once over an abstract unix socket

use std::{
    fmt,
    os::fd::{BorrowedFd, OwnedFd},
    str::FromStr,
};

use bytemuck::{Pod, Zeroable, bytes_of, pod_read_unaligned};

use crate::protocol_common::{BadDescriptorSnafu, Result};

pub mod pidfd;
pub mod scm_rights;

pub use pidfd::PidFdBackend;
pub use scm_rights::ScmRightsBackend;

pub const DESCRIPTOR_PAYLOAD_LEN: usize = 96;

/// Opaque to everything except the backend that produced it.
#[repr(C)]
#[derive(Clone, Copy, Debug, Zeroable, Pod)]
pub struct ProtocolDescriptor {
    pub backend: u32,
    pub target_pid: u32,
    pub payload: [u8; DESCRIPTOR_PAYLOAD_LEN],
}

impl ProtocolDescriptor {
    pub(crate) fn new<P: Pod>(backend: Backend, target_pid: u32, payload: &P) -> Self {
        let mut desc = Self::zeroed();
        desc.backend = backend as u32;
        desc.target_pid = target_pid;
        let bytes = bytes_of(payload);
        desc.payload[..bytes.len()].copy_from_slice(bytes);
        desc
    }

    pub(crate) fn payload<P: Pod>(&self) -> P {
        pod_read_unaligned(&self.payload[..size_of::<P>()])
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        bytes_of(self)
    }

    /// Parse bytes read out of a relay.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        snafu::ensure!(
            bytes.len() == size_of::<Self>(),
            BadDescriptorSnafu {
                op: "decode_descriptor",
                reason: format!(
                    "expected {} bytes, got {}",
                    size_of::<Self>(),
                    bytes.len()
                ),
            }
        );
        Ok(pod_read_unaligned(bytes))
    }

    pub fn backend(&self) -> Result<Backend> {
        Backend::from_tag(self.backend)
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Backend {
    PidFd = 1,
    #[default]
    ScmRights = 2,
}

impl Backend {
    fn from_tag(tag: u32) -> Result<Self> {
        match tag {
            1 => Ok(Backend::PidFd),
            2 => Ok(Backend::ScmRights),
            other => BadDescriptorSnafu {
                op: "decode_descriptor",
                reason: format!("unknown backend tag {other}"),
            }
            .fail(),
        }
    }

    #[must_use]
    pub fn instantiate(self) -> Box<dyn DuplicationBackend> {
        match self {
            Backend::PidFd => Box::new(PidFdBackend::default()),
            Backend::ScmRights => Box::new(ScmRightsBackend::default()),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::PidFd => f.write_str("pidfd"),
            Backend::ScmRights => f.write_str("scm-rights"),
        }
    }
}

impl FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pidfd" => Ok(Backend::PidFd),
            "scm-rights" | "scm_rights" => Ok(Backend::ScmRights),
            other => Err(format!(
                "unknown backend {other:?}, expected pidfd or scm-rights"
            )),
        }
    }
}

/// `{ duplicate(socket, target) -> descriptor; reconstruct(descriptor) -> socket }`
pub trait DuplicationBackend: Send {
    fn kind(&self) -> Backend;

    /// Produce a descriptor only `target_pid` can use. Whatever the backend
    /// needs to keep the socket reachable lives in `self` until it is dropped.
    fn duplicate(
        &mut self,
        socket: BorrowedFd<'_>,
        target_pid: u32,
    ) -> Result<ProtocolDescriptor>;

    /// Materialize the socket in the calling process.
    fn reconstruct(&self, descriptor: &ProtocolDescriptor) -> Result<OwnedFd>;
}

/// Rebuild a socket from a descriptor addressed to this process.
pub fn reconstruct(descriptor: &ProtocolDescriptor) -> Result<OwnedFd> {
    let me = std::process::id();
    snafu::ensure!(
        descriptor.target_pid == me,
        BadDescriptorSnafu {
            op: "reconstruct",
            reason: format!(
                "descriptor is for pid {}, this is pid {me}",
                descriptor.target_pid
            ),
        }
    );
    descriptor.backend()?.instantiate().reconstruct(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol_common::HandoffError;

    #[test]
    fn backend_names_parse_back() {
        for backend in [Backend::PidFd, Backend::ScmRights] {
            assert_eq!(backend.to_string().parse::<Backend>(), Ok(backend));
        }
        assert!("winsock".parse::<Backend>().is_err());
    }

    #[test]
    fn descriptor_for_another_pid_is_rejected() {
        let desc = ProtocolDescriptor::new(
            Backend::PidFd,
            std::process::id().wrapping_add(1),
            &[0u32; 2],
        );
        let err = reconstruct(&desc).expect_err("wrong target");
        assert!(matches!(err, HandoffError::BadDescriptor { .. }));
    }

    #[test]
    fn unknown_backend_tag_is_rejected() {
        let mut desc =
            ProtocolDescriptor::new(Backend::ScmRights, std::process::id(), &[0u8; 4]);
        desc.backend = 77;
        let err = reconstruct(&desc).expect_err("bad tag");
        assert!(err.to_string().contains("unknown backend tag 77"));
    }

    #[test]
    fn truncated_bytes_do_not_decode() {
        let desc = ProtocolDescriptor::new(Backend::PidFd, 1, &[9u32; 2]);
        let bytes = desc.as_bytes();
        assert!(ProtocolDescriptor::from_bytes(&bytes[..bytes.len() - 1]).is_err());
        let back = ProtocolDescriptor::from_bytes(bytes).expect("full length");
        assert_eq!(back.payload::<[u32; 2]>(), [9, 9]);
    }
}
