//! Length-prefixed TCP framing for the CM link.
//!
//! Every transport packet is a length-prefixed frame:
//!
//! ```text
//! +-------------------+--------------+-------------------+
//! | length (4 bytes)  | magic "VT01" |   payload         |
//! | u32 little-endian |  (4 bytes)   |  (length bytes)   |
//! +-------------------+--------------+-------------------+
//! ```
//!
//! The length covers only the payload. After the handshake the payload is
//! ciphertext; the framing itself never changes.

use cm_common::types::FRAME_MAGIC;
use cm_common::Endpoint;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tracing::trace;

/// Maximum accepted payload size in bytes.
pub const MAX_PAYLOAD: u32 = 8 * 1024 * 1024;

/// Errors that can occur during framing operations.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The payload size exceeds the maximum.
    #[error("payload size {size} exceeds maximum {max}")]
    PayloadTooLarge {
        /// The declared payload size.
        size: u32,
        /// The configured maximum.
        max: u32,
    },
    /// The magic tag after the length prefix did not match.
    #[error("bad frame magic {0:02x?}")]
    BadMagic([u8; 4]),
    /// The connection closed before a complete frame was received.
    #[error("connection closed")]
    ConnectionClosed,
    /// An I/O error occurred.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Opens a TCP connection to `remote`, optionally bound to a local address,
/// within `timeout`.
pub(crate) async fn connect(
    remote: &Endpoint,
    local_addr: Option<IpAddr>,
    local_port: Option<u16>,
    timeout: Duration,
) -> io::Result<TcpStream> {
    let addr = lookup_host((remote.host.as_str(), remote.port))
        .await?
        .next()
        .ok_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "endpoint did not resolve")
        })?;

    let attempt = async {
        let stream = if local_addr.is_some() || local_port.is_some() {
            let socket = if addr.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            let bind_ip = local_addr.unwrap_or(if addr.is_ipv4() {
                IpAddr::V4(Ipv4Addr::UNSPECIFIED)
            } else {
                IpAddr::V6(Ipv6Addr::UNSPECIFIED)
            });
            socket.bind(SocketAddr::new(bind_ip, local_port.unwrap_or(0)))?;
            socket.connect(addr).await?
        } else {
            TcpStream::connect(addr).await?
        };
        stream.set_nodelay(true)?;
        Ok(stream)
    };

    match tokio::time::timeout(timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
    }
}

/// Reads a single frame from the stream, returning its payload.
///
/// # Errors
///
/// Returns [`FrameError::ConnectionClosed`] when the peer closes before a
/// complete frame arrives, [`FrameError::BadMagic`] on a corrupt stream, and
/// [`FrameError::PayloadTooLarge`] when the declared length exceeds
/// [`MAX_PAYLOAD`].
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>, FrameError> {
    let mut prefix = [0u8; 8];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(FrameError::Io(e)),
    }

    let len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
    let magic = [prefix[4], prefix[5], prefix[6], prefix[7]];
    if magic != FRAME_MAGIC {
        return Err(FrameError::BadMagic(magic));
    }
    if len > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge {
            size: len,
            max: MAX_PAYLOAD,
        });
    }

    let mut payload = vec![0u8; len as usize];
    if len > 0 {
        reader.read_exact(&mut payload).await.map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                FrameError::ConnectionClosed
            } else {
                FrameError::Io(e)
            }
        })?;
    }
    trace!(len, "frame received");
    Ok(payload)
}

/// Writes a single frame to the stream.
///
/// # Errors
///
/// Returns [`FrameError::PayloadTooLarge`] when the payload exceeds
/// [`MAX_PAYLOAD`], or the underlying I/O error.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<(), FrameError> {
    let len = payload.len() as u32;
    if len > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge {
            size: len,
            max: MAX_PAYLOAD,
        });
    }
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&FRAME_MAGIC).await?;
    if !payload.is_empty() {
        writer.write_all(payload).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Spawns a task that reads frames off `reader` and forwards them over a
/// channel.
///
/// Channel closure signals a clean close; an `Err` item signals an errored
/// close. The channel preserves wire order.
pub(crate) fn spawn_reader<R>(mut reader: R) -> mpsc::Receiver<Result<Vec<u8>, FrameError>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(payload) => {
                    if tx.send(Ok(payload)).await.is_err() {
                        break;
                    }
                }
                Err(FrameError::ConnectionClosed) => break,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    break;
                }
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn single_frame_round_trip() {
        let (mut client, mut server) = duplex(8192);
        write_frame(&mut client, b"hello world").await.unwrap();
        let received = read_frame(&mut server).await.unwrap();
        assert_eq!(received, b"hello world");
    }

    #[tokio::test]
    async fn frames_do_not_merge() {
        let (mut client, mut server) = duplex(8192);
        write_frame(&mut client, b"aaa").await.unwrap();
        write_frame(&mut client, b"bbb").await.unwrap();
        assert_eq!(read_frame(&mut server).await.unwrap(), b"aaa");
        assert_eq!(read_frame(&mut server).await.unwrap(), b"bbb");
    }

    #[tokio::test]
    async fn empty_payload_is_valid() {
        let (mut client, mut server) = duplex(8192);
        write_frame(&mut client, &[]).await.unwrap();
        assert!(read_frame(&mut server).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn wire_layout_is_len_magic_payload() {
        let (mut client, mut server) = duplex(8192);
        write_frame(&mut client, b"abc").await.unwrap();
        let mut raw = [0u8; 11];
        server.read_exact(&mut raw).await.unwrap();
        assert_eq!(&raw[0..4], &3u32.to_le_bytes());
        assert_eq!(&raw[4..8], b"VT01");
        assert_eq!(&raw[8..11], b"abc");
    }

    #[tokio::test]
    async fn bad_magic_is_rejected() {
        let (mut client, mut server) = duplex(8192);
        client.write_all(&3u32.to_le_bytes()).await.unwrap();
        client.write_all(b"XXXX").await.unwrap();
        client.write_all(b"abc").await.unwrap();
        assert!(matches!(
            read_frame(&mut server).await,
            Err(FrameError::BadMagic(_))
        ));
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected_on_read() {
        let (mut client, mut server) = duplex(8192);
        client
            .write_all(&(MAX_PAYLOAD + 1).to_le_bytes())
            .await
            .unwrap();
        client.write_all(&FRAME_MAGIC).await.unwrap();
        assert!(matches!(
            read_frame(&mut server).await,
            Err(FrameError::PayloadTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn closed_stream_reports_clean_close() {
        let (client, mut server) = duplex(8192);
        drop(client);
        assert!(matches!(
            read_frame(&mut server).await,
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn truncated_frame_reports_closed() {
        let (mut client, mut server) = duplex(8192);
        client.write_all(&10u32.to_le_bytes()).await.unwrap();
        client.write_all(&FRAME_MAGIC).await.unwrap();
        client.write_all(b"abc").await.unwrap();
        drop(client);
        assert!(matches!(
            read_frame(&mut server).await,
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn reader_task_preserves_order_and_signals_close() {
        let (mut client, server) = duplex(8192);
        let mut frames = spawn_reader(server);
        write_frame(&mut client, b"first").await.unwrap();
        write_frame(&mut client, b"second").await.unwrap();
        drop(client);
        assert_eq!(frames.recv().await.unwrap().unwrap(), b"first");
        assert_eq!(frames.recv().await.unwrap().unwrap(), b"second");
        assert!(frames.recv().await.is_none());
    }
}
