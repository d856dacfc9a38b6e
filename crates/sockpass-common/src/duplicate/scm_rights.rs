use std::{
    io,
    os::{
        fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd},
        linux::net::SocketAddrExt,
        unix::net::{SocketAddr, UnixListener, UnixStream},
    },
    sync::atomic::{AtomicU32, Ordering},
    thread::JoinHandle,
};

use bytemuck::{Pod, Zeroable};
use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};
use snafu::ResultExt;
use tracing::{debug, info, warn};

use super::{Backend, DuplicationBackend, ProtocolDescriptor};
use crate::protocol_common::{BadDescriptorSnafu, DuplicateSnafu, Result};

const NAME_CAP: usize = 64;

#[repr(C)]
#[derive(Clone, Copy, Zeroable, Pod)]
struct ScmRightsPayload {
    name_len: u32,
    name: [u8; NAME_CAP],
}

static NEXT_ENDPOINT: AtomicU32 = AtomicU32::new(0);

struct Server {
    // second handle on the listening socket so drop can kick accept() loose
    listener: UnixListener,
    thread: JoinHandle<()>,
}

/// Serves the socket once over a linux abstract unix socket, checking the
/// connecting peer's pid before passing the fd with `SCM_RIGHTS`.
#[derive(Default)]
pub struct ScmRightsBackend {
    server: Option<Server>,
}

impl std::fmt::Debug for ScmRightsBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScmRightsBackend")
            .field("serving", &self.server.is_some())
            .finish()
    }
}

fn peer_pid(stream: &UnixStream) -> Option<i32> {
    getsockopt(&stream.as_fd(), PeerCredentials)
        .ok()
        .map(|x| x.pid())
}

fn send_fd(stream: &UnixStream, fd: RawFd) -> io::Result<()> {
    let fd_size = size_of::<libc::c_int>();
    let cmsg_space = unsafe { libc::CMSG_SPACE(fd_size as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];
    let data = [1u8];

    let mut iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &raw mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast::<libc::c_void>();
    msg.msg_controllen = cmsg_space as _;

    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&raw const msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(fd_size as u32) as _;
        std::ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<libc::c_int>(), fd);
    }

    let n = unsafe { libc::sendmsg(stream.as_raw_fd(), &raw const msg, libc::MSG_NOSIGNAL) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn recv_fd(stream: &UnixStream) -> io::Result<OwnedFd> {
    let fd_size = size_of::<libc::c_int>();
    let cmsg_space = unsafe { libc::CMSG_SPACE(fd_size as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];
    let mut data = [0u8; 1];

    let mut iov = libc::iovec {
        iov_base: data.as_mut_ptr().cast::<libc::c_void>(),
        iov_len: data.len(),
    };
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &raw mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast::<libc::c_void>();
    msg.msg_controllen = cmsg_space as _;

    let n = loop {
        let n = unsafe {
            libc::recvmsg(stream.as_raw_fd(), &raw mut msg, libc::MSG_CMSG_CLOEXEC)
        };
        if n >= 0 {
            break n;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    };
    if n == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "source closed without sending a socket",
        ));
    }
    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "ancillary data truncated",
        ));
    }

    let mut received = None;
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&raw const msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET
                && (*cmsg).cmsg_type == libc::SCM_RIGHTS
            {
                let fd = std::ptr::read_unaligned(
                    libc::CMSG_DATA(cmsg).cast::<libc::c_int>(),
                );
                received = Some(OwnedFd::from_raw_fd(fd));
            }
            cmsg = libc::CMSG_NXTHDR(&raw const msg, cmsg);
        }
    }
    received.ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "no SCM_RIGHTS in message")
    })
}

// accept until the target pid shows up, hand it the fd, done
fn serve(listener: &UnixListener, socket: &OwnedFd, target_pid: u32) {
    loop {
        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(%e, "descriptor server stopped");
                return;
            }
        };
        match peer_pid(&stream) {
            Some(pid) if pid as u32 == target_pid => {
                match send_fd(&stream, socket.as_raw_fd()) {
                    Ok(()) => info!(target_pid, "passed socket to target"),
                    Err(e) => warn!(target_pid, %e, "failed to pass socket"),
                }
                // later connects get ECONNREFUSED instead of sitting in the
                // backlog of a listener nobody accepts on
                if let Err(e) = rustix::net::shutdown(listener, rustix::net::Shutdown::Read) {
                    warn!(%e, "could not close descriptor endpoint");
                }
                return;
            }
            other => {
                warn!(?other, target_pid, "refusing descriptor request from wrong peer");
            }
        }
    }
}

impl DuplicationBackend for ScmRightsBackend {
    fn kind(&self) -> Backend {
        Backend::ScmRights
    }

    fn duplicate(
        &mut self,
        socket: BorrowedFd<'_>,
        target_pid: u32,
    ) -> Result<ProtocolDescriptor> {
        let name = format!(
            "sockpass-fd-p{}-t{target_pid}-{}",
            std::process::id(),
            NEXT_ENDPOINT.fetch_add(1, Ordering::Relaxed)
        );
        let addr = SocketAddr::from_abstract_name(name.as_bytes())
            .context(DuplicateSnafu { op: "sockaddr_un" })?;
        let listener = UnixListener::bind_addr(&addr)
            .context(DuplicateSnafu { op: "bind" })?;
        let owned = socket
            .try_clone_to_owned()
            .context(DuplicateSnafu { op: "dup" })?;
        let kicker = listener
            .try_clone()
            .context(DuplicateSnafu { op: "dup" })?;

        let thread = std::thread::Builder::new()
            .name("sockpass-fd-server".to_string())
            .spawn(move || serve(&listener, &owned, target_pid))
            .context(DuplicateSnafu { op: "spawn_thread" })?;

        // a second duplicate call replaces the previous endpoint
        if let Some(old) = self.server.replace(Server {
            listener: kicker,
            thread,
        }) {
            stop(old);
        }

        let mut payload = ScmRightsPayload::zeroed();
        payload.name_len = name.len() as u32;
        payload.name[..name.len()].copy_from_slice(name.as_bytes());
        debug!(target_pid, endpoint = %name, "serving socket over SCM_RIGHTS");
        Ok(ProtocolDescriptor::new(Backend::ScmRights, target_pid, &payload))
    }

    fn reconstruct(&self, descriptor: &ProtocolDescriptor) -> Result<OwnedFd> {
        let payload: ScmRightsPayload = descriptor.payload();
        let len = payload.name_len as usize;
        snafu::ensure!(
            len > 0 && len <= NAME_CAP,
            BadDescriptorSnafu {
                op: "reconstruct",
                reason: format!("endpoint name length {len}"),
            }
        );
        let addr = SocketAddr::from_abstract_name(&payload.name[..len])
            .context(DuplicateSnafu { op: "sockaddr_un" })?;
        let stream = UnixStream::connect_addr(&addr)
            .context(DuplicateSnafu { op: "connect" })?;
        let fd = recv_fd(&stream).context(DuplicateSnafu { op: "recvmsg" })?;
        debug!("reconstructed socket via SCM_RIGHTS");
        Ok(fd)
    }
}

fn stop(server: Server) {
    // shutdown on a listening socket makes a blocked accept() return
    let _ = rustix::net::shutdown(&server.listener, rustix::net::Shutdown::Both);
    if server.thread.join().is_err() {
        warn!("descriptor server thread panicked");
    }
}

impl Drop for ScmRightsBackend {
    fn drop(&mut self) {
        if let Some(server) = self.server.take() {
            stop(server);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::{TcpListener, TcpStream},
        sync::mpsc,
        time::Duration,
    };

    use super::*;

    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let a = TcpStream::connect(listener.local_addr().unwrap()).expect("connect");
        let (b, _) = listener.accept().expect("accept");
        (a, b)
    }

    #[test]
    fn reconstructed_socket_shares_the_connection() {
        let (shared, mut peer) = tcp_pair();
        let mut backend = ScmRightsBackend::default();
        let desc = backend
            .duplicate(shared.as_fd(), std::process::id())
            .expect("duplicate");

        let fd = backend.reconstruct(&desc).expect("reconstruct");
        let mut dup = TcpStream::from(fd);
        assert_eq!(dup.local_addr().unwrap(), shared.local_addr().unwrap());

        peer.write_all(b"hello").unwrap();
        let mut buf = [0u8; 5];
        dup.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        // the source handle still works alongside the duplicate
        (&shared).write_all(b"x").unwrap();
        let mut one = [0u8; 1];
        peer.read_exact(&mut one).unwrap();
        assert_eq!(&one, b"x");
    }

    #[test]
    fn replayed_descriptor_is_refused_while_server_lives() {
        let (shared, _peer) = tcp_pair();
        let mut backend = ScmRightsBackend::default();
        let desc = backend
            .duplicate(shared.as_fd(), std::process::id())
            .expect("duplicate");
        backend.reconstruct(&desc).expect("first");

        let server = backend.server.as_ref().expect("server still owned");
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !server.thread.is_finished() {
            assert!(std::time::Instant::now() < deadline, "server never finished");
            std::thread::sleep(Duration::from_millis(5));
        }

        // the endpoint name is still bound, a second reader must get an error
        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(ScmRightsBackend::default().reconstruct(&desc).is_err());
        });
        let refused = rx
            .recv_timeout(Duration::from_secs(3))
            .expect("second reconstruct blocked");
        assert!(refused);
    }

    #[test]
    fn dropping_backend_stops_idle_server() {
        let (shared, _peer) = tcp_pair();
        let mut backend = ScmRightsBackend::default();
        backend
            .duplicate(shared.as_fd(), std::process::id())
            .expect("duplicate");
        // must not hang joining a thread blocked in accept()
        drop(backend);
    }
}
