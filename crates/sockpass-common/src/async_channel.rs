use std::io;

use snafu::ResultExt;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    framed_channel::{DEFAULT_MAX_FRAME_LEN, HEADER_SIZE, RecvResult, encode_frame},
    protocol_common::{FrameTooLargeSnafu, IoSnafu, Result},
};

/// [`FramedChannel`](crate::framed_channel::FramedChannel) for tokio streams.
/// Same frame format, same `Closed` rules.
pub struct AsyncFramedChannel<S> {
    stream: S,
    max_frame_len: u32,
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncFramedChannel<S> {
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

    pub fn into_inner(self) -> S {
        self.stream
    }

    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let buf = encode_frame(payload)?;
        self.stream
            .write_all(&buf)
            .await
            .context(IoSnafu { op: "send" })?;
        self.stream.flush().await.context(IoSnafu { op: "send" })
    }

    pub async fn receive(&mut self) -> Result<RecvResult> {
        let mut len_bytes = [0u8; HEADER_SIZE];
        if self.read_full(&mut len_bytes).await? < HEADER_SIZE {
            return Ok(RecvResult::Closed);
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
        if self.read_full(&mut payload).await? < payload.len() {
            return Ok(RecvResult::Closed);
        }
        Ok(RecvResult::Message(payload))
    }

    /// Half-close the write side; the peer's next `receive` sees `Closed`.
    pub async fn shutdown_write(&mut self) -> Result<()> {
        self.stream
            .shutdown()
            .await
            .context(IoSnafu { op: "shutdown" })
    }

    async fn read_full(&mut self, buf: &mut [u8]) -> Result<usize> {
        let mut offset = 0;
        while offset < buf.len() {
            match self.stream.read(&mut buf[offset..]).await {
                Ok(0) => break,
                Ok(n) => offset += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e).context(IoSnafu { op: "recv" }),
            }
        }
        Ok(offset)
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::{TcpListener, TcpStream, UnixStream};

    use super::*;
    use crate::framed_channel::FramedChannel;

    #[tokio::test]
    async fn async_round_trip_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let mut chan = AsyncFramedChannel::new(stream);
            chan.send(b"Are we not men?").await.unwrap();
            let reply = chan.receive().await.unwrap();
            chan.shutdown_write().await.unwrap();
            reply
        });

        let (stream, _) = listener.accept().await.unwrap();
        let mut chan = AsyncFramedChannel::new(stream);
        assert_eq!(
            chan.receive().await.unwrap(),
            RecvResult::Message(b"Are we not men?".to_vec())
        );
        chan.send(b"We are devo").await.unwrap();
        assert_eq!(chan.receive().await.unwrap(), RecvResult::Closed);

        assert_eq!(
            client.await.unwrap(),
            RecvResult::Message(b"We are devo".to_vec())
        );
    }

    #[tokio::test]
    async fn async_and_blocking_ends_interoperate() {
        let (a, b) = std::os::unix::net::UnixStream::pair().unwrap();
        b.set_nonblocking(true).unwrap();
        let b = UnixStream::from_std(b).unwrap();

        let blocking = tokio::task::spawn_blocking(move || {
            let mut chan = FramedChannel::new(a);
            chan.send(&[7u8; 70_000]).unwrap();
        });

        let mut chan = AsyncFramedChannel::new(b);
        match chan.receive().await.unwrap() {
            RecvResult::Message(m) => assert_eq!(m, vec![7u8; 70_000]),
            RecvResult::Closed => panic!("unexpected close"),
        }
        blocking.await.unwrap();
        assert_eq!(chan.receive().await.unwrap(), RecvResult::Closed);
    }
}
