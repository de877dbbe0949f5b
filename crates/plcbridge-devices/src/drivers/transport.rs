//! Request/response transports shared by the native drivers.
//!
//! Every failure is mapped onto the driver error taxonomy: socket errors
//! become `ConnectionError`, expired deadlines `Timeout`, and replies that
//! cannot be framed `ProtocolError`.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::trace;

use plcbridge_core::utils::hex_dump;

use crate::device::{DeviceError, Result};
use crate::probe::Framing;
use crate::protocol::util::join_target;
use crate::vendor::Vendor;

/// Largest frame a driver accepts
const MAX_FRAME: usize = 65_536;

/// A connected stream carrying one request and one reply at a time
#[derive(Debug)]
pub(crate) struct TcpTransport {
    stream: TcpStream,
    vendor: Vendor,
    target: String,
    request_timeout: Duration,
}

impl TcpTransport {
    /// Open a TCP connection
    pub async fn connect(
        vendor: Vendor,
        host: &str,
        port: u16,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self> {
        let target = join_target(host, port);
        let stream = match timeout(connect_timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(DeviceError::connection(vendor, target, e)),
            Err(_) => return Err(DeviceError::Timeout { vendor, target }),
        };
        if let Err(e) = stream.set_nodelay(true) {
            trace!("set_nodelay on {} failed: {}", target, e);
        }

        Ok(Self {
            stream,
            vendor,
            target,
            request_timeout,
        })
    }

    /// `host:port` of the peer
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Send a frame and read one framed reply
    pub async fn request(&mut self, frame: &[u8], framing: Framing) -> Result<Vec<u8>> {
        let deadline = Instant::now() + self.request_timeout;
        trace!("-> {}: {}", self.target, hex_dump(frame));

        let result = timeout_at(deadline, async {
            self.stream.write_all(frame).await?;
            read_frame(&mut self.stream, framing).await
        })
        .await;

        match result {
            Ok(Ok(Some(reply))) => {
                trace!("<- {}: {}", self.target, hex_dump(&reply));
                Ok(reply)
            }
            Ok(Ok(None)) => Err(DeviceError::protocol(
                self.vendor,
                self.target.clone(),
                "reply has an invalid frame header",
            )),
            Ok(Err(e)) => Err(DeviceError::connection(self.vendor, self.target.clone(), e)),
            Err(_) => Err(DeviceError::Timeout {
                vendor: self.vendor,
                target: self.target.clone(),
            }),
        }
    }

    /// Close the write half; the socket itself closes on drop
    pub async fn shutdown(&mut self) {
        if let Err(e) = self.stream.shutdown().await {
            trace!("shutdown of {} failed: {}", self.target, e);
        }
    }
}

async fn read_frame(stream: &mut TcpStream, framing: Framing) -> io::Result<Option<Vec<u8>>> {
    let mut frame = vec![0u8; framing.header_len];
    stream.read_exact(&mut frame).await?;

    let total = match (framing.total_len)(&frame) {
        Some(total) if total >= framing.header_len && total <= MAX_FRAME => total,
        _ => return Ok(None),
    };
    frame.resize(total, 0);
    stream.read_exact(&mut frame[framing.header_len..]).await?;
    Ok(Some(frame))
}

/// A connected datagram socket
#[derive(Debug)]
pub(crate) struct UdpTransport {
    socket: UdpSocket,
    vendor: Vendor,
    target: String,
    request_timeout: Duration,
}

impl UdpTransport {
    /// Bind an ephemeral socket and connect it to the peer
    pub async fn connect(vendor: Vendor, host: &str, port: u16, request_timeout: Duration) -> Result<Self> {
        let target = join_target(host, port);
        let peer = lookup_host((host, port))
            .await
            .map_err(|e| DeviceError::connection(vendor, target.clone(), e))?
            .next()
            .ok_or_else(|| DeviceError::connection(vendor, target.clone(), "host did not resolve"))?;

        let bind = if peer.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind)
            .await
            .map_err(|e| DeviceError::connection(vendor, target.clone(), e))?;
        socket
            .connect(peer)
            .await
            .map_err(|e| DeviceError::connection(vendor, target.clone(), e))?;

        Ok(Self {
            socket,
            vendor,
            target,
            request_timeout,
        })
    }

    /// `host:port` of the peer
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Send a datagram and wait for a reply accepted by `accept`
    ///
    /// Datagrams `accept` rejects (stale replies to earlier requests) are
    /// skipped until the request timeout expires.
    pub async fn request<F>(&mut self, datagram: &[u8], accept: F) -> Result<Vec<u8>>
    where
        F: Fn(&[u8]) -> bool,
    {
        let deadline = Instant::now() + self.request_timeout;
        trace!("-> {}: {}", self.target, hex_dump(datagram));
        self.socket
            .send(datagram)
            .await
            .map_err(|e| DeviceError::connection(self.vendor, self.target.clone(), e))?;

        let mut buf = vec![0u8; MAX_FRAME];
        loop {
            let n = match timeout_at(deadline, self.socket.recv(&mut buf)).await {
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(DeviceError::connection(self.vendor, self.target.clone(), e)),
                Err(_) => {
                    return Err(DeviceError::Timeout {
                        vendor: self.vendor,
                        target: self.target.clone(),
                    })
                }
            };
            let reply = &buf[..n];
            trace!("<- {}: {}", self.target, hex_dump(reply));
            if accept(reply) {
                return Ok(reply.to_vec());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::testing::*;

    fn two_byte_len(header: &[u8]) -> Option<usize> {
        Some(2 + header[1] as usize)
    }

    const FRAMING: Framing = Framing {
        header_len: 2,
        total_len: two_byte_len,
    };

    #[test_log::test(tokio::test)]
    async fn test_tcp_request_reply() {
        let port = spawn_tcp(2, |h| 2 + h[1] as usize, |req| {
            let mut reply = req.to_vec();
            reply[0] = 0xAA;
            Some(reply)
        })
        .await;

        let mut transport = TcpTransport::connect(
            Vendor::Generic,
            "127.0.0.1",
            port,
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        let reply = transport.request(&[0x01, 0x02, 0x10, 0x20], FRAMING).await.unwrap();
        assert_eq!(reply, vec![0xAA, 0x02, 0x10, 0x20]);
        assert_eq!(transport.target(), format!("127.0.0.1:{}", port));
    }

    #[test_log::test(tokio::test)]
    async fn test_refused_connection_is_connection_error() {
        let port = closed_port().await;
        let err = TcpTransport::connect(
            Vendor::Omron,
            "127.0.0.1",
            port,
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DeviceError::ConnectionError { vendor: Vendor::Omron, .. }));
        assert!(err.is_transport_failure());
    }

    #[test_log::test(tokio::test)]
    async fn test_silent_peer_times_out() {
        let port = spawn_silent_tcp().await;
        let mut transport = TcpTransport::connect(
            Vendor::Mitsubishi,
            "127.0.0.1",
            port,
            Duration::from_secs(1),
            Duration::from_millis(100),
        )
        .await
        .unwrap();
        let err = transport.request(&[0x00, 0x00], FRAMING).await.unwrap_err();
        assert!(matches!(err, DeviceError::Timeout { .. }));
    }

    #[test_log::test(tokio::test)]
    async fn test_udp_skips_rejected_datagrams() {
        let port = spawn_udp(|req| Some(req.iter().rev().copied().collect())).await;
        let mut transport = UdpTransport::connect(Vendor::Omron, "127.0.0.1", port, Duration::from_secs(1))
            .await
            .unwrap();
        let reply = transport.request(&[1, 2, 3], |r| r.first() == Some(&3)).await.unwrap();
        assert_eq!(reply, vec![3, 2, 1]);

        let err = transport
            .request(&[1, 2, 3], |r| r.first() == Some(&9))
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::Timeout { .. }));
    }
}
