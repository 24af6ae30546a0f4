//! # Modbus TCP Connection
//!
//! Owns the byte stream to one device and turns it into whole MBAP frames.
//!
//! A frame is delimited by the length field of its header: the first six
//! bytes are read, then `length` more. Bytes that arrive before a deadline
//! passes stay buffered, so a frame cut in half by a timeout is completed on
//! the next call instead of desynchronising the stream.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use modbus_master::connection::Connection;
//! use modbus_master::{codec, protocol::Request};
//! use std::time::Duration;
//! use tokio::time::Instant;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut connection = Connection::connect("127.0.0.1", 5020, Duration::from_secs(3)).await?;
//! connection.send(&codec::encode_request(1, 1, &Request::read(0, 4))).await?;
//! let frame = connection.receive_frame(Instant::now() + Duration::from_secs(3)).await?;
//! println!("{} byte frame", frame.len());
//! connection.close().await;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::time::Duration;

use bytes::BytesMut;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::info as trace_info;

use crate::codec;
use crate::error::{IoError, ReceiveError, TimeoutError};
use crate::utils::format::bytes_to_hex;
use crate::MAX_MBAP_LENGTH;

/// Lifecycle of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connected => "connected",
            ConnectionState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// Transport layer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}

/// Log packet with direction and unit id
fn log_packet(direction: &str, data: &[u8], unit_id: Option<u8>) {
    let hex_string = bytes_to_hex(data);
    match unit_id {
        Some(id) => trace_info!("[MODBUS-TCP] {} unit:{} {}", direction, id, hex_string),
        None => trace_info!("[MODBUS-TCP] {} {}", direction, hex_string),
    }
}

/// A framed byte stream to one Modbus device
pub struct Connection<S = TcpStream> {
    stream: Option<S>,
    peer: String,
    state: ConnectionState,
    read_buf: BytesMut,
    stats: TransportStats,
    /// Enable packet logging for debugging
    packet_logging: bool,
}

impl Connection<TcpStream> {
    /// Open a TCP connection, bounded by `connect_timeout`
    ///
    /// `host` may be a name or an IP address.
    pub async fn connect(host: &str, port: u16, connect_timeout: Duration) -> Result<Self, IoError> {
        let address = format!("{}:{}", host, port);
        let stream = match timeout(connect_timeout, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(IoError::connect_failed(address, e.to_string())),
            Err(_) => {
                return Err(IoError::connect_failed(
                    address,
                    format!("timed out after {}ms", connect_timeout.as_millis()),
                ))
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY on {}: {}", address, e);
        }
        info!("Connected to {}", address);
        Ok(Self::from_stream(stream, address))
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap an already established stream
    pub fn from_stream(stream: S, peer: impl Into<String>) -> Self {
        Self {
            stream: Some(stream),
            peer: peer.into(),
            state: ConnectionState::Connected,
            read_buf: BytesMut::with_capacity(MAX_MBAP_LENGTH + 6),
            stats: TransportStats::default(),
            packet_logging: false,
        }
    }

    /// Enable or disable packet logging
    pub fn set_packet_logging(&mut self, enabled: bool) {
        self.packet_logging = enabled;
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn stats(&self) -> TransportStats {
        self.stats.clone()
    }

    /// Count an error detected above the transport (decode failure, exception)
    pub fn record_error(&mut self) {
        self.stats.errors += 1;
    }

    /// Bytes received but not yet returned as a frame
    pub fn buffered_len(&self) -> usize {
        self.read_buf.len()
    }

    /// Write one complete frame
    pub async fn send(&mut self, frame: &[u8]) -> Result<(), IoError> {
        let stream = match self.stream.as_mut() {
            Some(stream) if self.state == ConnectionState::Connected => stream,
            _ => return Err(IoError::write_failed("not connected")),
        };

        if let Err(e) = write_frame(stream, frame).await {
            self.stats.errors += 1;
            return Err(IoError::write_failed(e.to_string()));
        }

        self.stats.requests_sent += 1;
        self.stats.bytes_sent += frame.len() as u64;
        if self.packet_logging {
            log_packet("send", frame, frame.get(6).copied());
        }
        Ok(())
    }

    /// Read the next complete frame, waiting no later than `deadline`
    pub async fn receive_frame(&mut self, deadline: Instant) -> Result<Vec<u8>, ReceiveError> {
        let started = Instant::now();
        loop {
            if let Some(frame) = self.take_buffered_frame()? {
                self.stats.responses_received += 1;
                if self.packet_logging {
                    log_packet("receive", &frame, frame.get(6).copied());
                }
                return Ok(frame);
            }

            let stream = match self.stream.as_mut() {
                Some(stream) if self.state == ConnectionState::Connected => stream,
                _ => return Err(IoError::read_failed("not connected").into()),
            };

            match timeout_at(deadline, stream.read_buf(&mut self.read_buf)).await {
                Err(_) => {
                    self.stats.timeouts += 1;
                    let waited = deadline.saturating_duration_since(started);
                    return Err(TimeoutError::new("receive frame", waited.as_millis() as u64).into());
                }
                Ok(Ok(0)) => {
                    self.stats.errors += 1;
                    let message = if self.read_buf.is_empty() {
                        "connection closed by peer".to_string()
                    } else {
                        format!(
                            "connection closed by peer with {} bytes of a partial frame",
                            self.read_buf.len()
                        )
                    };
                    return Err(IoError::read_failed(message).into());
                }
                Ok(Ok(n)) => {
                    self.stats.bytes_received += n as u64;
                    debug!("Read {} bytes from {} ({} buffered)", n, self.peer, self.read_buf.len());
                }
                Ok(Err(e)) => {
                    self.stats.errors += 1;
                    return Err(IoError::read_failed(e.to_string()).into());
                }
            }
        }
    }

    fn take_buffered_frame(&mut self) -> Result<Option<Vec<u8>>, ReceiveError> {
        match codec::frame_length(&self.read_buf) {
            None => Ok(None),
            Some(Err(e)) => {
                self.stats.errors += 1;
                Err(e.into())
            }
            Some(Ok(length)) if self.read_buf.len() >= length => {
                Ok(Some(self.read_buf.split_to(length).to_vec()))
            }
            Some(Ok(_)) => Ok(None),
        }
    }

    /// Close the connection; closing twice is a no-op
    pub async fn close(&mut self) {
        if self.state == ConnectionState::Disconnected {
            return;
        }
        self.state = ConnectionState::Closing;
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("Shutdown of {} failed: {}", self.peer, e);
            }
        }
        self.read_buf.clear();
        self.state = ConnectionState::Disconnected;
        info!("Connection to {} closed", self.peer);
    }
}

async fn write_frame<S>(stream: &mut S, frame: &[u8]) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(frame).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    const READ_RESPONSE: [u8; 11] = [0x00, 0x01, 0x00, 0x00, 0x00, 0x05, 0x01, 0x03, 0x02, 0x04, 0xD2];

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(1)
    }

    #[tokio::test]
    async fn test_receive_frame_across_split_reads() {
        let mock = Builder::new()
            .read(&READ_RESPONSE[..3])
            .read(&READ_RESPONSE[3..8])
            .read(&READ_RESPONSE[8..])
            .build();
        let mut connection = Connection::from_stream(mock, "mock");

        let frame = connection.receive_frame(deadline()).await.unwrap();
        assert_eq!(frame, READ_RESPONSE.to_vec());
        assert_eq!(connection.stats().responses_received, 1);
        assert_eq!(connection.stats().bytes_received, 11);
        assert_eq!(connection.buffered_len(), 0);
    }

    #[tokio::test]
    async fn test_receive_two_frames_in_one_read() {
        let mut both = READ_RESPONSE.to_vec();
        both.extend_from_slice(&READ_RESPONSE);
        let mock = Builder::new().read(&both).build();
        let mut connection = Connection::from_stream(mock, "mock");

        assert_eq!(connection.receive_frame(deadline()).await.unwrap().len(), 11);
        assert_eq!(connection.buffered_len(), 11);
        assert_eq!(connection.receive_frame(deadline()).await.unwrap().len(), 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_frame_survives_timeout() {
        let mock = Builder::new()
            .read(&READ_RESPONSE[..4])
            .wait(Duration::from_millis(500))
            .read(&READ_RESPONSE[4..])
            .build();
        let mut connection = Connection::from_stream(mock, "mock");

        let result = connection
            .receive_frame(Instant::now() + Duration::from_millis(100))
            .await;
        assert!(matches!(result, Err(ReceiveError::Timeout(_))));
        assert_eq!(connection.buffered_len(), 4);
        assert_eq!(connection.stats().timeouts, 1);

        let frame = connection.receive_frame(deadline()).await.unwrap();
        assert_eq!(frame, READ_RESPONSE.to_vec());
    }

    #[tokio::test]
    async fn test_unframeable_length_is_malformed() {
        let mock = Builder::new()
            .read(&[0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x01])
            .build();
        let mut connection = Connection::from_stream(mock, "mock");

        let result = connection.receive_frame(deadline()).await;
        assert!(matches!(result, Err(ReceiveError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_eof_is_read_failure() {
        let mock = Builder::new().read(&READ_RESPONSE[..5]).build();
        let mut connection = Connection::from_stream(mock, "mock");

        let result = connection.receive_frame(deadline()).await;
        assert!(matches!(result, Err(ReceiveError::Io(IoError::ReadFailed { .. }))));
    }

    #[tokio::test]
    async fn test_send_and_close_is_idempotent() {
        let request = [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        let mock = Builder::new().write(&request).build();
        let mut connection = Connection::from_stream(mock, "mock");

        connection.send(&request).await.unwrap();
        assert_eq!(connection.stats().bytes_sent, 12);

        connection.close().await;
        assert_eq!(connection.state(), ConnectionState::Disconnected);
        connection.close().await;
        assert_eq!(connection.state(), ConnectionState::Disconnected);

        assert!(matches!(connection.send(&request).await, Err(IoError::WriteFailed { .. })));
    }
}
