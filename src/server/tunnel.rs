//! Bidirectional TCP tunnel with coupled flow control
//!
//! Splices a client connection with an outbound remote connection. Each
//! direction runs through a bounded queue sized from the configured
//! high-water mark: a reader that fills its peer's queue suspends until
//! the writer drains it, so neither side can buffer more than the mark
//! while the other lags. Closing either side lets the opposite queue
//! drain fully before the peer's write half is shut down, so teardown is
//! symmetric and no in-flight bytes are dropped.

use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Read chunk size; one queue slot holds at most this many bytes.
const CHUNK_SIZE: usize = 8192;

/// Queue slots equivalent to a high-water mark of `high_water_kb` KiB.
fn queue_capacity(high_water_kb: u32) -> usize {
    ((high_water_kb as usize * 1024) / CHUNK_SIZE).max(1)
}

/// Client-side handle to a running tunnel.
///
/// Holds the client→remote queue; dropping it closes that direction and
/// starts the symmetric teardown.
#[derive(Debug, Clone)]
pub struct TunnelHandle {
    to_remote: mpsc::Sender<Bytes>,
    peer: SocketAddr,
}

impl TunnelHandle {
    /// Forward client payload toward the remote.
    ///
    /// Suspends while the remote-side queue is above the high-water mark.
    /// Returns `false` once the tunnel has gone away.
    pub async fn forward(&self, data: Bytes) -> bool {
        self.to_remote.send(data).await.is_ok()
    }

    /// The remote address this tunnel dials.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

/// Dial `dst` and splice it with the client whose write half is given.
///
/// The success reply must already have been written to the client; the
/// write half is owned by the tunnel from here on. Connection failures
/// shut the client down, which removes the tunnel on the driver side.
pub fn spawn<W>(dst: SocketAddr, client_wr: W, high_water_kb: u32) -> TunnelHandle
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let capacity = queue_capacity(high_water_kb);
    let (to_remote, from_client) = mpsc::channel(capacity);
    tokio::spawn(async move {
        match TcpStream::connect(dst).await {
            Ok(remote) => {
                let _ = remote.set_nodelay(true);
                debug!("tunnel up to {}", dst);
                splice(remote, client_wr, from_client, capacity).await;
                debug!("tunnel to {} down", dst);
            }
            Err(e) => {
                warn!("connect to {} failed: {}", dst, e);
                let mut client_wr = client_wr;
                let _ = client_wr.shutdown().await;
            }
        }
    });
    TunnelHandle {
        to_remote,
        peer: dst,
    }
}

/// Splice an already-connected remote stream with the client write half.
#[cfg(test)]
fn spawn_connected<S, W>(remote: S, client_wr: W, high_water_kb: u32) -> TunnelHandle
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let capacity = queue_capacity(high_water_kb);
    let (to_remote, from_client) = mpsc::channel(capacity);
    tokio::spawn(splice(remote, client_wr, from_client, capacity));
    TunnelHandle {
        to_remote,
        peer: SocketAddr::from(([0, 0, 0, 0], 0)),
    }
}

async fn splice<S, W>(remote: S, client_wr: W, from_client: mpsc::Receiver<Bytes>, capacity: usize)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (remote_rd, remote_wr) = tokio::io::split(remote);
    let (to_client, from_remote) = mpsc::channel(capacity);

    let up = tokio::spawn(pump(from_client, remote_wr));
    let reader = tokio::spawn(read_into(remote_rd, to_client));
    let down = tokio::spawn(pump(from_remote, client_wr));

    let _ = tokio::join!(up, reader, down);
}

/// Drain a queue into a write half, then shut the write half down.
async fn pump<W>(mut queue: mpsc::Receiver<Bytes>, mut wr: W)
where
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = queue.recv().await {
        if let Err(e) = wr.write_all(&chunk).await {
            debug!("tunnel write ended: {}", e);
            break;
        }
    }
    let _ = wr.shutdown().await;
}

/// Read a stream chunk-wise into a queue until EOF or the queue closes.
async fn read_into<R>(mut rd: R, queue: mpsc::Sender<Bytes>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(CHUNK_SIZE);
    loop {
        buf.reserve(CHUNK_SIZE);
        match rd.read_buf(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if queue.send(buf.split().freeze()).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("tunnel read ended: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt};

    #[test]
    fn test_queue_capacity() {
        assert_eq!(queue_capacity(1024), 128);
        assert_eq!(queue_capacity(8), 1);
        // A zero mark still leaves one slot so the tunnel can move bytes.
        assert_eq!(queue_capacity(0), 1);
    }

    #[tokio::test]
    async fn test_forward_reaches_remote() {
        let (remote_local, mut remote_far) = duplex(65536);
        let (client_local, _client_far) = duplex(65536);

        let handle = spawn_connected(remote_local, client_local, 64);
        assert!(handle.forward(Bytes::from_static(b"hello remote")).await);

        let mut buf = vec![0u8; 12];
        remote_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello remote");
    }

    #[tokio::test]
    async fn test_remote_bytes_reach_client() {
        let (remote_local, mut remote_far) = duplex(65536);
        let (client_local, mut client_far) = duplex(65536);

        let _handle = spawn_connected(remote_local, client_local, 64);
        remote_far.write_all(b"response data").await.unwrap();

        let mut buf = vec![0u8; 13];
        client_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"response data");
    }

    #[tokio::test]
    async fn test_dropping_handle_closes_remote_write() {
        let (remote_local, mut remote_far) = duplex(65536);
        let (client_local, _client_far) = duplex(65536);

        let handle = spawn_connected(remote_local, client_local, 64);
        handle.forward(Bytes::from_static(b"bye")).await;
        drop(handle);

        // Queued bytes are delivered before the half-close.
        let mut buf = vec![0u8; 3];
        remote_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"bye");

        let n = tokio::time::timeout(Duration::from_secs(1), remote_far.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_remote_eof_closes_client_write() {
        let (remote_local, remote_far) = duplex(65536);
        let (client_local, mut client_far) = duplex(65536);

        let _handle = spawn_connected(remote_local, client_local, 64);
        drop(remote_far);

        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(1), client_far.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_slow_client_pauses_remote_reader() {
        // Tight mark (one slot) and a tiny client pipe nobody drains: the
        // remote-side reader must stall instead of buffering everything.
        let (remote_local, mut remote_far) = duplex(8192);
        let (client_local, client_far) = duplex(256);

        let _handle = spawn_connected(remote_local, client_local, 0);

        let payload = vec![0xAB; 512 * 1024];
        let blocked = tokio::time::timeout(
            Duration::from_millis(200),
            remote_far.write_all(&payload),
        )
        .await;
        assert!(blocked.is_err(), "remote writes should hit backpressure");

        drop(client_far);
    }

    #[tokio::test]
    async fn test_large_transfer_round_trip() {
        let (remote_local, mut remote_far) = duplex(65536);
        let (client_local, mut client_far) = duplex(65536);

        let handle = spawn_connected(remote_local, client_local, 64);

        let upstream = vec![0x5A; 100_000];
        let expected = upstream.clone();
        let send = tokio::spawn(async move {
            for chunk in upstream.chunks(CHUNK_SIZE) {
                assert!(handle.forward(Bytes::copy_from_slice(chunk)).await);
            }
        });
        let mut received = vec![0u8; 100_000];
        remote_far.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);
        send.await.unwrap();

        let downstream = vec![0xA5; 100_000];
        let expected = downstream.clone();
        let send = tokio::spawn(async move {
            remote_far.write_all(&downstream).await.unwrap();
        });
        let mut received = vec![0u8; 100_000];
        client_far.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);
        send.await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_connect_failure_shuts_client_down() {
        // Port 1 on loopback is almost certainly closed; the client write
        // half must be shut down when the dial fails.
        let (client_local, mut client_far) = duplex(1024);
        let dst: SocketAddr = "127.0.0.1:1".parse().unwrap();

        let handle = spawn(dst, client_local, 64);
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), client_far.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
        drop(handle);
    }
}
