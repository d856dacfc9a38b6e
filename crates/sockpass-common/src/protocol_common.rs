use std::{backtrace::Backtrace, process::ExitStatus};

use bytemuck::{Pod, Zeroable};
use rustix::fs::Mode;
use snafu::Snafu;

/// Every failure the handoff can produce. Each variant names the operation
/// that failed so the top level can report it alongside the OS error code.
#[derive(Snafu, Debug)]
#[snafu(visibility(pub(crate)))]
pub enum HandoffError {
    /// Creating or opening a named object (relay, signal, listener).
    #[snafu(display("{op} failed for {name}: {source}"))]
    Create {
        op: &'static str,
        name: String,
        source: std::io::Error,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },
    /// Waiting on or releasing the handoff signal.
    #[snafu(display("{op} failed: {source}"))]
    Sync {
        op: &'static str,
        source: std::io::Error,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },
    #[snafu(display("timed out after {waited_ms}ms waiting on {name}"))]
    WaitTimeout {
        name: String,
        waited_ms: u64,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },
    #[snafu(display("{op} failed: {source}"))]
    Spawn {
        op: &'static str,
        source: std::io::Error,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },
    /// Producing a descriptor or materializing a socket from one.
    #[snafu(display("{op} failed: {source}"))]
    Duplicate {
        op: &'static str,
        source: std::io::Error,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },
    #[snafu(display("{op} rejected descriptor: {reason}"))]
    BadDescriptor {
        op: &'static str,
        reason: String,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },
    #[snafu(display("relay {name} is not usable: {reason}"))]
    CorruptRelay {
        name: String,
        reason: String,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },
    /// Framed channel traffic.
    #[snafu(display("{op} failed: {source}"))]
    Io {
        op: &'static str,
        source: std::io::Error,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },
    #[snafu(display("frame of {len} bytes exceeds the {max} byte limit"))]
    FrameTooLarge {
        len: u64,
        max: u64,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },
    #[snafu(display("child exited with {status}"))]
    ChildExit {
        status: ExitStatus,
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },
    #[snafu(display("network guard is already held by this process"))]
    GuardHeld {
        #[snafu(backtrace)]
        backtrace: Backtrace,
    },
}

impl HandoffError {
    /// Name of the operation that failed.
    #[must_use]
    pub fn op(&self) -> &'static str {
        match self {
            HandoffError::Create { op, .. }
            | HandoffError::Sync { op, .. }
            | HandoffError::Spawn { op, .. }
            | HandoffError::Duplicate { op, .. }
            | HandoffError::BadDescriptor { op, .. }
            | HandoffError::Io { op, .. } => op,
            HandoffError::WaitTimeout { .. } => "sem_timedwait",
            HandoffError::CorruptRelay { .. } => "read_descriptor",
            HandoffError::FrameTooLarge { .. } => "frame_len",
            HandoffError::ChildExit { .. } => "waitpid",
            HandoffError::GuardHeld { .. } => "net_guard",
        }
    }

    /// Raw OS error code, when the failure came from the OS.
    #[must_use]
    pub fn os_code(&self) -> Option<i32> {
        match self {
            HandoffError::Create { source, .. }
            | HandoffError::Sync { source, .. }
            | HandoffError::Spawn { source, .. }
            | HandoffError::Duplicate { source, .. }
            | HandoffError::Io { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

pub type Result<T, E = HandoffError> = std::result::Result<T, E>;

/// Prefixed to the descriptor bytes in the relay. Written after the
/// descriptor so a reader that sees a valid header sees the whole blob.
#[repr(C)]
#[derive(Clone, Copy, Debug, Zeroable, Pod)]
pub struct RelayHeader {
    pub magic: u64,
    pub version: u32,
    pub descriptor_len: u32,
}

impl RelayHeader {
    pub const MAGIC: u64 = u64::from_be_bytes(*b"SOCKPASS");
    pub const VERSION: u32 = 1;

    #[must_use]
    pub fn new(descriptor_len: u32) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            descriptor_len,
        }
    }
}

pub const RW_MODE: Mode = Mode::from_bits_retain(0o600);
pub const R_MODE: Mode = Mode::from_bits_retain(0o400);

// align to a multiple of the page size
#[inline]
#[must_use]
pub fn round_up_page(num_bytes: u64) -> u64 {
    let num_bytes_page = rustix::param::page_size() as u64;
    (num_bytes + (num_bytes_page - 1)) & !(num_bytes_page - 1)
}
