pub mod protocol_common;

// framing only needs a connected stream
pub mod async_channel;
pub mod framed_channel;

// the handoff itself leans on linux: abstract unix sockets, pidfd, posix shm
#[cfg(target_os = "linux")]
pub mod coordinator;
#[cfg(target_os = "linux")]
pub mod duplicate;
#[cfg(target_os = "linux")]
pub mod net_guard;
#[cfg(target_os = "linux")]
pub mod relay;
#[cfg(target_os = "linux")]
pub mod signal;
