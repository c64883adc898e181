//! Bidirectional byte splicing
//!
//! Every tunneled channel is a byte-stream pair spliced until EOF. EOF on one
//! side half-closes the write side of the other, so the remaining direction
//! can drain. An idle cap reclaims streams held by peers that died without
//! sending FIN.
//!
//! Backpressure is the transport's: writes block when the peer's buffer
//! fills, and that propagates back to the originating socket. No queues here.

use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep, Instant};

const COPY_BUF_LEN: usize = 16 * 1024;

/// Copy bytes both ways between `a` and `b` until both directions reach EOF.
///
/// Returns the byte counts `(a_to_b, b_to_a)`. An idle period longer than
/// `idle_timeout` with no bytes in either direction ends the splice with
/// [`io::ErrorKind::TimedOut`].
pub async fn pipe<A, B>(a: A, b: B, idle_timeout: Duration) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Send,
    B: AsyncRead + AsyncWrite + Send,
{
    let (mut a_rd, mut a_wr) = tokio::io::split(a);
    let (mut b_rd, mut b_wr) = tokio::io::split(b);

    let mut a_buf = vec![0u8; COPY_BUF_LEN];
    let mut b_buf = vec![0u8; COPY_BUF_LEN];

    let mut a_open = true;
    let mut b_open = true;

    let mut a_to_b: u64 = 0;
    let mut b_to_a: u64 = 0;

    let idle = sleep(idle_timeout);
    tokio::pin!(idle);

    while a_open || b_open {
        tokio::select! {
            read = a_rd.read(&mut a_buf), if a_open => {
                match read? {
                    0 => {
                        a_open = false;
                        // Propagate EOF; the peer may be mid-response.
                        let _ = b_wr.shutdown().await;
                    }
                    n => {
                        b_wr.write_all(&a_buf[..n]).await?;
                        a_to_b += n as u64;
                        idle.as_mut().reset(Instant::now() + idle_timeout);
                    }
                }
            }
            read = b_rd.read(&mut b_buf), if b_open => {
                match read? {
                    0 => {
                        b_open = false;
                        let _ = a_wr.shutdown().await;
                    }
                    n => {
                        a_wr.write_all(&b_buf[..n]).await?;
                        b_to_a += n as u64;
                        idle.as_mut().reset(Instant::now() + idle_timeout);
                    }
                }
            }
            _ = &mut idle => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("channel idle for {idle_timeout:?}"),
                ));
            }
        }
    }

    Ok((a_to_b, b_to_a))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_bytes_cross_both_ways() {
        let (client, client_far) = duplex(4096);
        let (server, server_far) = duplex(4096);

        let splice = tokio::spawn(pipe(client_far, server_far, Duration::from_secs(5)));

        let (mut client_rd, mut client_wr) = tokio::io::split(client);
        let (mut server_rd, mut server_wr) = tokio::io::split(server);

        client_wr.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server_rd.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server_wr.write_all(b"pong").await.unwrap();
        client_rd.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // Close both directions; the splice should finish with the counts.
        client_wr.shutdown().await.unwrap();
        server_wr.shutdown().await.unwrap();
        let (a_to_b, b_to_a) = splice.await.unwrap().unwrap();
        assert_eq!(a_to_b, 4);
        assert_eq!(b_to_a, 4);
    }

    #[tokio::test]
    async fn test_large_transfer_is_byte_identical() {
        let (client, client_far) = duplex(1024);
        let (server, server_far) = duplex(1024);

        let splice = tokio::spawn(pipe(client_far, server_far, Duration::from_secs(10)));

        // 1 MiB of patterned bytes through a 1 KiB pipe exercises
        // backpressure on both sides.
        let payload: Vec<u8> = (0u32..(1024 * 1024))
            .map(|i| (i % 251) as u8)
            .collect();

        let (mut client_rd, mut client_wr) = tokio::io::split(client);
        let (mut server_rd, mut server_wr) = tokio::io::split(server);

        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            client_wr.write_all(&payload).await.unwrap();
            client_wr.shutdown().await.unwrap();
        });

        let echo = tokio::spawn(async move {
            let mut received = Vec::new();
            server_rd.read_to_end(&mut received).await.unwrap();
            server_wr.write_all(&received).await.unwrap();
            server_wr.shutdown().await.unwrap();
            received
        });

        let mut echoed = Vec::new();
        client_rd.read_to_end(&mut echoed).await.unwrap();

        writer.await.unwrap();
        let received = echo.await.unwrap();
        assert_eq!(received, expected);
        assert_eq!(echoed, expected);

        let (a_to_b, b_to_a) = splice.await.unwrap().unwrap();
        assert_eq!(a_to_b, expected.len() as u64);
        assert_eq!(b_to_a, expected.len() as u64);
    }

    #[tokio::test]
    async fn test_eof_half_closes_other_side() {
        let (client, client_far) = duplex(4096);
        let (server, server_far) = duplex(4096);

        let splice = tokio::spawn(pipe(client_far, server_far, Duration::from_secs(5)));

        let (_client_rd, mut client_wr) = tokio::io::split(client);
        let (mut server_rd, mut server_wr) = tokio::io::split(server);

        client_wr.write_all(b"done").await.unwrap();
        client_wr.shutdown().await.unwrap();

        // The server observes the data, then EOF.
        let mut received = Vec::new();
        server_rd.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"done");

        // The reverse direction still works until the server closes too.
        server_wr.write_all(b"bye").await.unwrap();
        server_wr.shutdown().await.unwrap();

        let (a_to_b, b_to_a) = splice.await.unwrap().unwrap();
        assert_eq!(a_to_b, 4);
        assert_eq!(b_to_a, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_cap_reclaims_dead_streams() {
        let (_client, client_far) = duplex(4096);
        let (_server, server_far) = duplex(4096);

        // Neither side ever sends; the idle cap must fire.
        let err = pipe(client_far, server_far, Duration::from_secs(600))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
