use std::{
    net::{Ipv4Addr, Shutdown, TcpListener, TcpStream},
    process::{Command, ExitCode},
    time::Duration,
};

use clap::Parser;
use snafu::{ResultExt, Snafu};
use sockpass_common::{
    coordinator::{HandoffNames, ReceiveOptions, initiate, receive_with},
    duplicate::Backend,
    framed_channel::{Direction, FramedChannel, RecvResult},
    net_guard::NetGuard,
    protocol_common::HandoffError,
};
use tracing::{error, info, warn};

pub mod cli;
pub mod tracing_init;

use crate::{cli::Args, tracing_init::init_tracing};

#[derive(Debug, Snafu)]
enum AppError {
    #[snafu(context(false), display("{source}"))]
    Handoff { source: HandoffError },
    #[snafu(display("{op} failed: {source}"))]
    Setup {
        op: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("peer closed the connection before sending a frame"))]
    PeerClosed,
}

impl AppError {
    fn op(&self) -> &'static str {
        match self {
            AppError::Handoff { source } => source.op(),
            AppError::Setup { op, .. } => *op,
            AppError::PeerClosed => "recv",
        }
    }

    fn os_code(&self) -> Option<i32> {
        match self {
            AppError::Handoff { source } => source.os_code(),
            AppError::Setup { source, .. } => source.raw_os_error(),
            AppError::PeerClosed => None,
        }
    }
}

fn loopback_pair() -> Result<(TcpStream, TcpStream), AppError> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .context(SetupSnafu { op: "bind" })?;
    let addr = listener.local_addr().context(SetupSnafu { op: "getsockname" })?;
    let shared = TcpStream::connect(addr).context(SetupSnafu { op: "connect" })?;
    let (accepted, peer) = listener.accept().context(SetupSnafu { op: "accept" })?;
    info!(%addr, %peer, "loopback connection up");
    Ok((shared, accepted))
}

fn talk(channel: &mut FramedChannel<TcpStream>, message: &str) -> Result<(), AppError> {
    channel.send(message.as_bytes())?;
    match channel.receive()? {
        RecvResult::Message(reply) => {
            println!("PARP {}", String::from_utf8_lossy(&reply));
            Ok(())
        }
        RecvResult::Closed => PeerClosedSnafu.fail(),
    }
}

fn run_parent(
    backend: Backend,
    message: &str,
    child_args: &[String],
    stderr: bool,
) -> Result<(), AppError> {
    let _guard = NetGuard::acquire()?;
    let (shared, accepted) = loopback_pair()?;

    let exe = std::env::current_exe().context(SetupSnafu { op: "current_exe" })?;
    let mut command = Command::new(exe);
    command.arg("child");
    if stderr {
        command.arg("--stderr");
    }
    command.args(child_args);

    let names = HandoffNames::for_pid(std::process::id());
    println!(
        "parent: relay {} signal {} backend {backend}",
        names.relay, names.signal
    );
    let mut handoff = initiate(&shared, command, names, backend)?;
    println!("parent: handed connection to child {}", handoff.child_pid());

    // our copy of the socket (and the backend's) keeps the connection alive,
    // so a dead child never shows up as a close on its own
    let closer = accepted.try_clone().context(SetupSnafu { op: "dup" })?;
    handoff.watch_child(move |status| {
        info!(%status, "closing connection after child failure");
        let _ = closer.shutdown(Shutdown::Both);
    })?;

    let mut channel = FramedChannel::new(accepted);
    let talked = talk(&mut channel, message);
    if talked.is_err() {
        // lets a child still waiting for its frame see Closed and exit
        let _ = channel.shutdown(Direction::Both);
    }
    drop(channel);

    let reaped = handoff.wait();
    // the parent's copy stays open until the child is reaped
    drop(shared);

    match (talked, reaped) {
        (talked, Err(e)) => {
            if let Err(talk_err) = talked {
                warn!(%talk_err, "exchange failed alongside child");
            }
            Err(e.into())
        }
        (talked, Ok(())) => talked,
    }
}

fn run_child(
    relay_name: &str,
    signal_name: &str,
    reply: &str,
    wait_timeout_ms: Option<u64>,
) -> Result<(), AppError> {
    let _guard = NetGuard::acquire()?;
    println!("child: relay {relay_name} signal {signal_name}");

    let opts = ReceiveOptions {
        wait_timeout: wait_timeout_ms.map(Duration::from_millis),
    };
    let stream = receive_with(relay_name, signal_name, opts)?;

    let mut channel = FramedChannel::new(stream);
    match channel.receive()? {
        RecvResult::Message(msg) => {
            println!("SUBP {}", String::from_utf8_lossy(&msg));
        }
        RecvResult::Closed => return PeerClosedSnafu.fail(),
    }
    channel.send(reply.as_bytes())?;
    channel.shutdown(Direction::Both)?;
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(e) = init_tracing(&args) {
        eprintln!("could not set up logging: {e}");
        return ExitCode::FAILURE;
    }
    let role = args.role();

    let result = match args {
        Args::Parent {
            backend,
            message,
            child_args,
            stderr,
            ..
        } => run_parent(backend, &message, &child_args, stderr),
        Args::Child {
            relay_name,
            signal_name,
            reply,
            wait_timeout_ms,
            ..
        } => run_child(&relay_name, &signal_name, &reply, wait_timeout_ms),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = e.os_code().unwrap_or(0);
            error!(role, op = e.op(), code, %e, "handoff run failed");
            eprintln!("{role}: {} failed with code {code}: {e}", e.op());
            ExitCode::FAILURE
        }
    }
}
