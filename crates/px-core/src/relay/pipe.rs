//! Byte pumps between the two halves of a relay.

use bytes::BytesMut;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::registry::RelayStats;

/// Buffer size for each direction
const BUFFER_SIZE: usize = 64 * 1024;

/// Running byte counts of a relay, readable after an aborted splice
#[derive(Debug, Default)]
pub(crate) struct Counters {
    upstream: AtomicU64,
    downstream: AtomicU64,
}

impl Counters {
    pub(crate) fn snapshot(&self) -> RelayStats {
        RelayStats {
            upstream_bytes: self.upstream.load(Ordering::Relaxed),
            downstream_bytes: self.downstream.load(Ordering::Relaxed),
        }
    }
}

/// Copy `reader` into `writer` until EOF, then half-close `writer`.
async fn pump<R, W>(reader: &mut R, writer: &mut W, counter: &AtomicU64) -> io::Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = BytesMut::with_capacity(BUFFER_SIZE);

    loop {
        buf.clear();
        let n = reader.read_buf(&mut buf).await?;
        if n == 0 {
            writer.shutdown().await?;
            return Ok(());
        }

        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Run both directions concurrently. Returns once both reached EOF, or on
/// the first I/O error from either side.
pub(crate) async fn splice<IR, IW, OR, OW>(
    inbound_read: &mut IR,
    inbound_write: &mut IW,
    outbound_read: &mut OR,
    outbound_write: &mut OW,
    counters: &Counters,
) -> io::Result<()>
where
    IR: AsyncRead + Unpin + ?Sized,
    IW: AsyncWrite + Unpin + ?Sized,
    OR: AsyncRead + Unpin + ?Sized,
    OW: AsyncWrite + Unpin + ?Sized,
{
    let upstream = pump(inbound_read, outbound_write, &counters.upstream);
    let downstream = pump(outbound_read, inbound_write, &counters.downstream);

    tokio::try_join!(upstream, downstream)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pump_half_closes_writer() {
        let (mut src, mut src_peer) = tokio::io::duplex(1024);
        let (mut dst, mut dst_peer) = tokio::io::duplex(1024);
        let counter = AtomicU64::new(0);

        src_peer.write_all(b"hello").await.unwrap();
        src_peer.shutdown().await.unwrap();

        pump(&mut src, &mut dst, &counter).await.unwrap();

        let mut out = Vec::new();
        dst_peer.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello");
        assert_eq!(counter.load(Ordering::Relaxed), 5);
    }

    #[tokio::test]
    async fn test_pump_larger_than_buffer() {
        let payload: Vec<u8> = (0..(BUFFER_SIZE * 3 + 17)).map(|i| (i % 251) as u8).collect();
        let (mut src, mut src_peer) = tokio::io::duplex(4096);
        let (mut dst, mut dst_peer) = tokio::io::duplex(4096);
        let counter = AtomicU64::new(0);

        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            src_peer.write_all(&payload).await.unwrap();
            src_peer.shutdown().await.unwrap();
        });
        let reader = tokio::spawn(async move {
            let mut out = Vec::new();
            dst_peer.read_to_end(&mut out).await.unwrap();
            out
        });

        pump(&mut src, &mut dst, &counter).await.unwrap();
        drop(dst);
        writer.await.unwrap();

        assert_eq!(reader.await.unwrap(), expected);
        assert_eq!(counter.load(Ordering::Relaxed), expected.len() as u64);
    }
}
