//! Length-prefixed messages over a connected stream socket.
//!
//! Wire protocol: [u32 length][payload]
//! Length is in native endian: both ends of a handoff live on the same
//! machine. This is not a portable wire format.

use std::{
    io::{self, Read, Write},
    net::{Shutdown, TcpStream},
    os::unix::net::UnixStream,
};

use snafu::ResultExt;
use tracing::{trace, warn};

use crate::protocol_common::{FrameTooLargeSnafu, IoSnafu, Result};

pub const HEADER_SIZE: usize = size_of::<u32>();

/// Receivers refuse frames above this unless configured otherwise.
pub const DEFAULT_MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecvResult {
    Message(Vec<u8>),
    /// The peer shut down its write side. Also returned when the peer went
    /// away part way through a frame; partial frames never reach the caller.
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
    Both,
}

impl From<Direction> for Shutdown {
    fn from(value: Direction) -> Self {
        match value {
            Direction::Read => Shutdown::Read,
            Direction::Write => Shutdown::Write,
            Direction::Both => Shutdown::Both,
        }
    }
}

/// Sockets that can stop traffic in one direction and stay open.
pub trait HalfClose {
    fn half_close(&self, how: Direction) -> io::Result<()>;
}

impl HalfClose for TcpStream {
    fn half_close(&self, how: Direction) -> io::Result<()> {
        self.shutdown(how.into())
    }
}

impl HalfClose for UnixStream {
    fn half_close(&self, how: Direction) -> io::Result<()> {
        self.shutdown(how.into())
    }
}

/// Build `[len][payload]`.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        FrameTooLargeSnafu {
            len: payload.len() as u64,
            max: u64::from(u32::MAX),
        }
        .build()
    })?;
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&len.to_ne_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

pub struct FramedChannel<S> {
    stream: S,
    max_frame_len: u32,
}

impl<S> FramedChannel<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    #[must_use]
    pub fn with_max_frame_len(mut self, max_frame_len: u32) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: Read + Write> FramedChannel<S> {
    /// Send one frame. Partial writes are accumulated until the whole frame
    /// is out; any write error ends the call.
    pub fn send(&mut self, payload: &[u8]) -> Result<()> {
        let buf = encode_frame(payload)?;
        let mut offset = 0;
        while offset < buf.len() {
            match self.stream.write(&buf[offset..]) {
                Ok(0) => {
                    return Err(io::Error::from(io::ErrorKind::WriteZero))
                        .context(IoSnafu { op: "send" });
                }
                Ok(n) => offset += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e).context(IoSnafu { op: "send" }),
            }
        }
        trace!(len = payload.len(), "sent frame");
        Ok(())
    }

    /// Receive one whole frame, or `Closed` once the peer stops writing.
    pub fn receive(&mut self) -> Result<RecvResult> {
        let mut len_bytes = [0u8; HEADER_SIZE];
        match self.read_full(&mut len_bytes)? {
            0 => return Ok(RecvResult::Closed),
            n if n < HEADER_SIZE => {
                warn!(got = n, "peer closed inside a frame header");
                return Ok(RecvResult::Closed);
            }
            _ => {}
        }

        let len = u32::from_ne_bytes(len_bytes);
        snafu::ensure!(
            len <= self.max_frame_len,
            FrameTooLargeSnafu {
                len: u64::from(len),
                max: u64::from(self.max_frame_len),
            }
        );

        let mut payload = vec![0u8; len as usize];
        let got = self.read_full(&mut payload)?;
        if got < payload.len() {
            warn!(expected = len, got, "peer closed inside a frame payload");
            return Ok(RecvResult::Closed);
        }
        trace!(len, "received frame");
        Ok(RecvResult::Message(payload))
    }

    // fills `buf` unless the peer closes first; returns how much arrived
    fn read_full(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut offset = 0;
        while offset < buf.len() {
            match self.stream.read(&mut buf[offset..]) {
                Ok(0) => break,
                Ok(n) => offset += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e).context(IoSnafu { op: "recv" }),
            }
        }
        Ok(offset)
    }
}

impl<S: HalfClose> FramedChannel<S> {
    /// Stop traffic in `how` without closing the socket.
    pub fn shutdown(&self, how: Direction) -> Result<()> {
        self.stream
            .half_close(how)
            .context(IoSnafu { op: "shutdown" })
    }
}

#[cfg(test)]
mod tests {
    use std::{net::TcpListener, thread};

    use super::*;
    use crate::protocol_common::HandoffError;

    fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let a = TcpStream::connect(listener.local_addr().unwrap()).expect("connect");
        let (b, _) = listener.accept().expect("accept");
        (a, b)
    }

    /// Hands out at most `chunk` bytes per read/write call.
    struct Trickle {
        inbound: io::Cursor<Vec<u8>>,
        outbound: Vec<u8>,
        chunk: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.chunk);
            self.inbound.read(&mut buf[..n])
        }
    }

    impl Write for Trickle {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = buf.len().min(self.chunk);
            self.outbound.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn frame_layout_is_native_length_then_payload() {
        let frame = encode_frame(b"Are we not men?").unwrap();
        assert_eq!(frame.len(), HEADER_SIZE + 15);
        assert_eq!(&frame[..HEADER_SIZE], &15u32.to_ne_bytes());
        assert_eq!(&frame[HEADER_SIZE..], b"Are we not men?");
    }

    #[test]
    fn partial_writes_and_reads_are_accumulated() {
        let mut writer = FramedChannel::new(Trickle {
            inbound: io::Cursor::new(Vec::new()),
            outbound: Vec::new(),
            chunk: 3,
        });
        writer.send(b"We are devo").unwrap();
        let wire = writer.into_inner().outbound;
        assert_eq!(wire, encode_frame(b"We are devo").unwrap());

        let mut reader = FramedChannel::new(Trickle {
            inbound: io::Cursor::new(wire),
            outbound: Vec::new(),
            chunk: 1,
        });
        assert_eq!(
            reader.receive().unwrap(),
            RecvResult::Message(b"We are devo".to_vec())
        );
        assert_eq!(reader.receive().unwrap(), RecvResult::Closed);
    }

    #[test]
    fn empty_and_large_payloads_cross_a_socket() {
        let (a, b) = tcp_pair();
        let big: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
        let expected = big.clone();

        let sender = thread::spawn(move || {
            let mut tx = FramedChannel::new(a);
            tx.send(b"").unwrap();
            tx.send(&big).unwrap();
            tx.shutdown(Direction::Write).unwrap();
        });

        let mut rx = FramedChannel::new(b);
        assert_eq!(rx.receive().unwrap(), RecvResult::Message(Vec::new()));
        assert_eq!(rx.receive().unwrap(), RecvResult::Message(expected));
        assert_eq!(rx.receive().unwrap(), RecvResult::Closed);
        sender.join().unwrap();
    }

    #[test]
    fn write_shutdown_reads_as_closed() {
        let (a, b) = UnixStream::pair().unwrap();
        let tx = FramedChannel::new(a);
        tx.shutdown(Direction::Write).unwrap();
        let mut rx = FramedChannel::new(b);
        assert_eq!(rx.receive().unwrap(), RecvResult::Closed);
    }

    #[test]
    fn truncated_frame_reads_as_closed() {
        let (mut a, b) = UnixStream::pair().unwrap();
        a.write_all(&10u32.to_ne_bytes()).unwrap();
        a.write_all(b"abc").unwrap();
        a.shutdown(Shutdown::Write).unwrap();

        let mut rx = FramedChannel::new(b);
        assert_eq!(rx.receive().unwrap(), RecvResult::Closed);
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let (mut a, b) = UnixStream::pair().unwrap();
        a.write_all(&1024u32.to_ne_bytes()).unwrap();

        let mut rx = FramedChannel::new(b).with_max_frame_len(512);
        let err = rx.receive().expect_err("limit");
        assert!(matches!(err, HandoffError::FrameTooLarge { len: 1024, .. }));
    }

    #[test]
    fn send_after_peer_gone_is_an_io_error() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(b);
        let mut tx = FramedChannel::new(a);
        let err = tx.send(b"anyone?").expect_err("peer gone");
        assert_eq!(err.op(), "send");
        assert_eq!(err.os_code(), Some(libc::EPIPE));
    }
}
