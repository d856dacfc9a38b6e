//! Parent and child halves of the handoff.
//!
//! Parent: create relay + signal (locked) -> spawn child -> map relay ->
//! duplicate socket for the child pid -> publish descriptor -> release.
//!
//! Child: open signal -> wait -> open + map relay -> read descriptor ->
//! reconstruct.
//!
//! The child must only be started after the parent has created both named
//! objects. `initiate` guarantees this; a child run by hand against names
//! that do not exist yet fails straight away with a `Create` error.

use std::{
    io,
    net::TcpStream,
    os::fd::{AsFd, BorrowedFd, OwnedFd},
    process::{Child, ChildStdout, Command, ExitStatus},
    thread::JoinHandle,
    time::Duration,
};

use snafu::ResultExt;
use tracing::{debug, info, warn};

use crate::{
    duplicate::{self, Backend, DuplicationBackend, ProtocolDescriptor},
    protocol_common::{ChildExitSnafu, Result, SpawnSnafu},
    relay::Relay,
    signal::HandoffSignal,
};

/// Names of the relay and signal for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoffNames {
    pub relay: String,
    pub signal: String,
}

impl HandoffNames {
    #[must_use]
    pub fn new(relay: impl Into<String>, signal: impl Into<String>) -> Self {
        Self {
            relay: relay.into(),
            signal: signal.into(),
        }
    }

    /// Unique per parent process, which is enough for one handoff per run.
    #[must_use]
    pub fn for_pid(pid: u32) -> Self {
        Self::new(format!("sockpass-relay-p{pid}"), format!("sockpass-signal-p{pid}"))
    }
}

/// Parent-side objects, created before the child exists.
pub struct PreparedHandoff {
    names: HandoffNames,
    relay: Relay,
    signal: HandoffSignal,
    backend: Box<dyn DuplicationBackend>,
}

impl PreparedHandoff {
    /// Create the relay and the signal in its locked state.
    pub fn create(names: HandoffNames, backend: Backend) -> Result<Self> {
        let relay = Relay::create(&names.relay)?;
        let signal = HandoffSignal::create_locked(&names.signal)?;
        info!(
            relay = %names.relay,
            signal = %names.signal,
            %backend,
            "prepared handoff"
        );
        Ok(Self {
            names,
            relay,
            signal,
            backend: backend.instantiate(),
        })
    }

    #[must_use]
    pub fn names(&self) -> &HandoffNames {
        &self.names
    }

    /// Map the relay, duplicate `socket` for `target_pid` and write the
    /// descriptor. The child cannot see any of it until [`release`].
    ///
    /// [`release`]: Self::release
    pub fn publish_descriptor(
        &mut self,
        socket: BorrowedFd<'_>,
        target_pid: u32,
    ) -> Result<ProtocolDescriptor> {
        let mut writer = self.relay.map_mut()?;
        let descriptor = self.backend.duplicate(socket, target_pid)?;
        writer.publish(descriptor.as_bytes())?;
        debug!(target_pid, backend = %self.backend.kind(), "descriptor in relay");
        Ok(descriptor)
    }

    /// The commit point.
    pub fn release(&self) -> Result<()> {
        self.signal.release()
    }

    pub fn commit(&mut self, socket: BorrowedFd<'_>, target_pid: u32) -> Result<()> {
        self.publish_descriptor(socket, target_pid)?;
        self.release()
    }
}

/// Start a handoff of `socket` to a child built from `command`. The relay and
/// signal names are appended to the command line as its last two arguments.
pub fn initiate(
    socket: &impl AsFd,
    command: Command,
    names: HandoffNames,
    backend: Backend,
) -> Result<ParentHandoff> {
    let mut prepared = PreparedHandoff::create(names, backend)?;

    let mut command = command;
    command.arg(&prepared.names.relay).arg(&prepared.names.signal);
    let mut child = command.spawn().context(SpawnSnafu { op: "spawn" })?;
    let child_pid = child.id();
    info!(child_pid, "spawned child");

    if let Err(e) = prepared.commit(socket.as_fd(), child_pid) {
        // the child would wait on the signal forever
        warn!(child_pid, %e, "handoff failed, killing child");
        let _ = child.kill();
        let _ = child.wait();
        return Err(e);
    }
    info!(child_pid, "handoff committed");

    Ok(ParentHandoff {
        child_pid,
        child: ChildState::Running(child),
        prepared,
    })
}

enum ChildState {
    Running(Child),
    Watched(JoinHandle<io::Result<ExitStatus>>),
    Reaped,
}

/// A committed handoff. Keeps the named objects (and whatever the backend
/// needs) alive until the child is done with them.
pub struct ParentHandoff {
    child_pid: u32,
    child: ChildState,
    prepared: PreparedHandoff,
}

impl ParentHandoff {
    #[must_use]
    pub fn child_pid(&self) -> u32 {
        self.child_pid
    }

    #[must_use]
    pub fn names(&self) -> &HandoffNames {
        self.prepared.names()
    }

    /// The child's stdout, if the command was set up with a pipe for it.
    /// Gone once the child is being watched.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        match &mut self.child {
            ChildState::Running(child) => child.stdout.take(),
            _ => None,
        }
    }

    /// Reap the child on a background thread and call `on_failure` if it
    /// exits unsuccessfully. A parent blocked reading the shared connection
    /// uses this to shut its side down, since its own copy of the socket
    /// keeps the connection open after the child is gone.
    pub fn watch_child<F>(&mut self, on_failure: F) -> Result<()>
    where
        F: FnOnce(ExitStatus) + Send + 'static,
    {
        let ChildState::Running(mut child) =
            std::mem::replace(&mut self.child, ChildState::Reaped)
        else {
            return Ok(());
        };
        let child_pid = self.child_pid;
        let spawned = std::thread::Builder::new()
            .name("sockpass-child-watch".to_string())
            .spawn(move || -> io::Result<ExitStatus> {
                let status = child.wait()?;
                if !status.success() {
                    warn!(child_pid, %status, "child failed");
                    on_failure(status);
                }
                Ok(status)
            });
        match spawned {
            Ok(handle) => {
                self.child = ChildState::Watched(handle);
                Ok(())
            }
            Err(source) => {
                // the child handle went down with the closure and is left
                // unreaped
                Err(source).context(SpawnSnafu { op: "spawn_thread" })
            }
        }
    }

    /// Reap the child. A non-zero exit is an error.
    pub fn wait(mut self) -> Result<()> {
        let status = match std::mem::replace(&mut self.child, ChildState::Reaped) {
            ChildState::Running(mut child) => {
                child.wait().context(SpawnSnafu { op: "waitpid" })?
            }
            ChildState::Watched(handle) => handle
                .join()
                .unwrap_or_else(|_| Err(io::Error::other("child watcher panicked")))
                .context(SpawnSnafu { op: "waitpid" })?,
            ChildState::Reaped => return Ok(()),
        };
        info!(child_pid = self.child_pid, %status, "child exited");
        snafu::ensure!(status.success(), ChildExitSnafu { status });
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReceiveOptions {
    /// `None` waits forever.
    pub wait_timeout: Option<Duration>,
}

/// Child side: block until the parent commits, then rebuild the socket.
pub fn receive(relay_name: &str, signal_name: &str) -> Result<TcpStream> {
    receive_with(relay_name, signal_name, ReceiveOptions::default())
}

pub fn receive_with(
    relay_name: &str,
    signal_name: &str,
    opts: ReceiveOptions,
) -> Result<TcpStream> {
    receive_fd(relay_name, signal_name, opts).map(TcpStream::from)
}

pub fn receive_fd(
    relay_name: &str,
    signal_name: &str,
    opts: ReceiveOptions,
) -> Result<OwnedFd> {
    let signal = HandoffSignal::open(signal_name)?;
    debug!(signal = signal_name, "waiting for parent");
    match opts.wait_timeout {
        Some(timeout) => signal.wait_timeout(timeout)?,
        None => signal.wait()?,
    }

    let relay = Relay::open(relay_name)?;
    let bytes = relay.map()?.read_descriptor()?;
    let descriptor = ProtocolDescriptor::from_bytes(&bytes)?;
    let fd = duplicate::reconstruct(&descriptor)?;
    info!(
        relay = relay_name,
        signal = signal_name,
        backend = %descriptor.backend()?,
        "received socket"
    );
    Ok(fd)
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::TcpListener,
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        thread,
        time::Instant,
    };

    use super::*;
    use crate::protocol_common::HandoffError;

    fn unique(tag: &str) -> HandoffNames {
        let pid = std::process::id();
        HandoffNames::new(
            format!("sockpass-test-relay-{tag}-{pid}"),
            format!("sockpass-test-signal-{tag}-{pid}"),
        )
    }

    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let a = TcpStream::connect(listener.local_addr().unwrap()).expect("connect");
        let (b, _) = listener.accept().expect("accept");
        (a, b)
    }

    #[test]
    fn pid_derived_names_differ_per_parent() {
        assert_ne!(HandoffNames::for_pid(1), HandoffNames::for_pid(2));
        let names = HandoffNames::for_pid(42);
        assert_ne!(names.relay, names.signal);
    }

    #[test]
    fn descriptor_written_before_release_before_wake() {
        let names = unique("order");
        let (shared, mut peer) = tcp_pair();
        let mut prepared =
            PreparedHandoff::create(names.clone(), Backend::ScmRights).expect("create");

        let woke = Arc::new(AtomicBool::new(false));
        let child = {
            let names = names.clone();
            let woke = woke.clone();
            thread::spawn(move || {
                let signal = HandoffSignal::open(&names.signal).expect("open signal");
                signal.wait().expect("wait");
                let woke_at = Instant::now();
                woke.store(true, Ordering::SeqCst);
                let relay = Relay::open(&names.relay).expect("open relay");
                let bytes = relay.map().unwrap().read_descriptor().expect("complete");
                let desc = ProtocolDescriptor::from_bytes(&bytes).unwrap();
                let stream = TcpStream::from(duplicate::reconstruct(&desc).unwrap());
                (woke_at, stream)
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!woke.load(Ordering::SeqCst), "woke before commit");

        prepared
            .publish_descriptor(shared.as_fd(), std::process::id())
            .expect("publish");
        let written_at = Instant::now();
        thread::sleep(Duration::from_millis(20));
        assert!(!woke.load(Ordering::SeqCst), "woke before release");

        let released_at = Instant::now();
        prepared.release().expect("release");

        let (woke_at, mut stream) = child.join().expect("child thread");
        assert!(written_at < released_at);
        assert!(released_at <= woke_at);

        peer.write_all(b"Are we not men?").unwrap();
        let mut buf = [0u8; 15];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"Are we not men?");
    }

    #[test]
    fn child_before_parent_fails_without_hanging() {
        let names = unique("early");
        let start = Instant::now();
        let err = receive(&names.relay, &names.signal).expect_err("nothing created");
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(matches!(err, HandoffError::Create { .. }));
    }

    #[test]
    fn second_parent_with_same_names_fails_to_create() {
        let names = unique("dup");
        let _first = PreparedHandoff::create(names.clone(), Backend::ScmRights).expect("first");
        let err = PreparedHandoff::create(names, Backend::ScmRights)
            .err()
            .expect("second must fail");
        assert!(matches!(err, HandoffError::Create { .. }));
        assert_eq!(err.os_code(), Some(libc::EEXIST));
    }

    #[test]
    fn spawn_failure_writes_nothing_and_cleans_up() {
        let names = unique("nospawn");
        let (shared, _peer) = tcp_pair();
        let err = initiate(
            &shared,
            Command::new("/nonexistent/sockpass-child"),
            names.clone(),
            Backend::ScmRights,
        )
        .err()
        .expect("spawn must fail");
        assert!(matches!(err, HandoffError::Spawn { .. }));
        assert_eq!(err.os_code(), Some(libc::ENOENT));
        // both names went away with the failed handoff
        assert!(Relay::open(&names.relay).is_err());
        assert!(HandoffSignal::open(&names.signal).is_err());
    }

    #[test]
    fn bounded_wait_gives_up() {
        let names = unique("bounded");
        let _prepared =
            PreparedHandoff::create(names.clone(), Backend::ScmRights).expect("create");
        let err = receive_with(
            &names.relay,
            &names.signal,
            ReceiveOptions {
                wait_timeout: Some(Duration::from_millis(30)),
            },
        )
        .expect_err("never committed");
        assert!(matches!(err, HandoffError::WaitTimeout { .. }));
    }

    #[test]
    fn failed_child_unblocks_reader_through_watcher() {
        let names = unique("watch");
        let (shared, accepted) = tcp_pair();
        let mut command = Command::new("/bin/sh");
        command.args(["-c", "exit 3"]);
        let mut handoff =
            initiate(&shared, command, names, Backend::ScmRights).expect("initiate");

        let closer = accepted.try_clone().expect("clone");
        handoff
            .watch_child(move |_| {
                let _ = closer.shutdown(std::net::Shutdown::Both);
            })
            .expect("watch");

        // nothing ever writes to this side; only the watcher can end the read
        accepted
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        let mut buf = [0u8; 1];
        let n = (&accepted).read(&mut buf).expect("read ends with eof");
        assert_eq!(n, 0);

        let err = handoff.wait().expect_err("child exited non-zero");
        assert!(matches!(err, HandoffError::ChildExit { .. }));
    }
}
