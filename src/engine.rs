//! # Transaction Engine
//!
//! Sends one request at a time over a [`Connection`] and waits for the frame
//! that answers it.
//!
//! ## Request Lifecycle
//!
//! ```text
//! request() ──try_lock──► allocate id ──► encode ──► register ──► send
//!                                                                   │
//!        ┌──────────────────────── receive_frame ◄──────────────────┘
//!        │
//!        ├─ matching id + unit ──► decode ──► Ok(Response) / Exception / Protocol
//!        ├─ late / unknown / wrong unit ──► logged and dropped, keep reading
//!        ├─ deadline ──► abandon (connection stays open) ──► Timeout
//!        └─ I/O failure ──► close connection, fail pending ──► ConnectionLost
//! ```
//!
//! Requests are validated before anything else; one that fails quantity or
//! range checks is rejected with [`EngineError::Protocol`] and never encoded.
//! A second caller arriving while a request is in flight gets
//! [`EngineError::Busy`] immediately and nothing is written to the socket.
//! The engine never reconnects and never retries.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{timeout_at, Instant};

use crate::codec;
use crate::connection::{Connection, ConnectionState, TransportStats};
use crate::error::{CodecError, EngineError, EngineResult, IoError, ReceiveError, TimeoutError};
use crate::protocol::{Request, Response, UnitId};
use crate::tracker::{Resolution, TransactionTracker};

struct EngineCore<S> {
    connection: Connection<S>,
    tracker: TransactionTracker,
}

impl<S> EngineCore<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Fail everything pending and drop the connection
    async fn teardown(&mut self, reason: EngineError) {
        warn!("Closing connection to {}: {}", self.connection.peer(), reason);
        self.tracker.fail_all(reason);
        self.connection.close().await;
    }
}

/// Marks a transaction as in flight for observers that cannot take the lock
struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.store(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(0, Ordering::SeqCst);
    }
}

fn encode_state(state: ConnectionState) -> u8 {
    match state {
        ConnectionState::Disconnected => 0,
        ConnectionState::Connected => 1,
        ConnectionState::Closing => 2,
    }
}

fn decode_state(value: u8) -> ConnectionState {
    match value {
        1 => ConnectionState::Connected,
        2 => ConnectionState::Closing,
        _ => ConnectionState::Disconnected,
    }
}

/// One-in-flight request/response engine over a single connection
pub struct TransactionEngine<S = TcpStream> {
    core: Mutex<EngineCore<S>>,
    in_flight: AtomicUsize,
    state: AtomicU8,
}

impl TransactionEngine<TcpStream> {
    /// Connect to `host:port` and wrap the connection in an engine
    pub async fn connect(host: &str, port: u16, connect_timeout: Duration) -> Result<Self, IoError> {
        let connection = Connection::connect(host, port, connect_timeout).await?;
        Ok(Self::new(connection))
    }
}

impl<S> TransactionEngine<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(connection: Connection<S>) -> Self {
        let state = AtomicU8::new(encode_state(connection.state()));
        Self {
            core: Mutex::new(EngineCore { connection, tracker: TransactionTracker::new() }),
            in_flight: AtomicUsize::new(0),
            state,
        }
    }

    /// Send `request` to `unit_id` and wait up to `timeout` for its response
    ///
    /// # Errors
    ///
    /// - `Protocol(Malformed)` if the request fails quantity or range checks; nothing is sent
    /// - `Busy` if another request is in flight; nothing is sent
    /// - `Timeout` if no matching response arrives in time; the connection stays open
    /// - `ConnectionLost` on any I/O failure or a send that misses the deadline;
    ///   the connection is closed
    /// - `Exception` if the device answers with a Modbus exception
    /// - `Protocol` if the matching response cannot be decoded
    pub async fn request(
        &self,
        request: Request,
        unit_id: UnitId,
        timeout: Duration,
    ) -> EngineResult<Response> {
        request
            .validate()
            .map_err(|e| EngineError::Protocol(CodecError::malformed(e.to_string())))?;

        let mut core = self.core.try_lock().map_err(|_| EngineError::Busy)?;
        if !core.connection.is_connected() {
            return Err(EngineError::connection_lost("not connected"));
        }

        // A caller that dropped its future left its transaction behind
        if core.tracker.pending_count() > 0 {
            core.tracker
                .abandon_all(EngineError::Timeout(TimeoutError::new("request abandoned", 0)));
        }

        let deadline = Instant::now() + timeout;
        let timeout_error = EngineError::Timeout(TimeoutError::new("request", timeout.as_millis() as u64));

        let transaction_id = core.tracker.next_id();
        let frame = codec::encode_request(transaction_id, unit_id, &request);
        let function = request.function();
        let completion = core
            .tracker
            .register(transaction_id, unit_id, request, deadline)
            .map_err(|_| EngineError::Busy)?;
        let _in_flight = InFlight::enter(&self.in_flight);

        debug!("Transaction {} -> unit {}: {}", transaction_id, unit_id, function);

        match timeout_at(deadline, core.connection.send(&frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let error = EngineError::connection_lost(e.to_string());
                core.teardown(error.clone()).await;
                self.sync_state(&core.connection);
                return Err(error);
            }
            Err(_) => {
                // A half-written frame leaves the stream unusable
                let error = EngineError::connection_lost("send timed out");
                core.teardown(error.clone()).await;
                self.sync_state(&core.connection);
                return Err(error);
            }
        }

        while core.tracker.is_pending(transaction_id) {
            let frame = match core.connection.receive_frame(deadline).await {
                Ok(frame) => frame,
                Err(ReceiveError::Timeout(_)) => {
                    warn!("Transaction {} timed out after {:?}", transaction_id, timeout);
                    if let Some(pending) = core.tracker.abandon(transaction_id) {
                        pending.complete(Err(timeout_error.clone()));
                    }
                    break;
                }
                Err(ReceiveError::Io(e)) => {
                    core.teardown(EngineError::connection_lost(e.to_string())).await;
                    break;
                }
                Err(ReceiveError::Malformed(e)) => {
                    core.teardown(EngineError::Protocol(e)).await;
                    break;
                }
            };

            let header = match codec::decode_header(&frame) {
                Ok(header) => header,
                Err(e) => {
                    warn!("Discarding undecodable frame: {}", e);
                    continue;
                }
            };

            match core.tracker.resolve(&header) {
                Resolution::Pending(pending) => {
                    let result = match codec::decode_response(&frame, &pending.request) {
                        Ok((_, Response::Exception { code, .. })) => {
                            core.connection.record_error();
                            Err(EngineError::Exception(code))
                        }
                        Ok((_, response)) => Ok(response),
                        Err(e) => {
                            core.connection.record_error();
                            Err(EngineError::Protocol(e))
                        }
                    };
                    debug!("Transaction {} completed", pending.transaction_id);
                    pending.complete(result);
                }
                Resolution::Late(id) => {
                    debug!("Dropping late response for abandoned transaction {}", id);
                }
                Resolution::UnitMismatch { transaction_id, expected, actual } => {
                    warn!(
                        "Discarding response for transaction {}: unit {} does not match {}",
                        transaction_id, actual, expected
                    );
                }
                Resolution::NotFound(id) => {
                    warn!("Discarding response with unknown transaction id {}", id);
                }
            }
        }

        self.sync_state(&core.connection);
        drop(core);

        match completion.await {
            Ok(result) => result,
            Err(_) => Err(EngineError::connection_lost("transaction dropped")),
        }
    }

    fn sync_state(&self, connection: &Connection<S>) {
        self.state.store(encode_state(connection.state()), Ordering::SeqCst);
    }

    /// Number of transactions in flight, 0 or 1
    pub fn pending_transactions(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectionState {
        decode_state(self.state.load(Ordering::SeqCst))
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Transport statistics; waits for an in-flight request to finish
    pub async fn stats(&self) -> TransportStats {
        self.core.lock().await.connection.stats()
    }

    /// Enable or disable hex packet logging on the connection
    pub async fn set_packet_logging(&self, enabled: bool) {
        self.core.lock().await.connection.set_packet_logging(enabled);
    }

    /// Close the connection; waits for an in-flight request to finish
    ///
    /// Closing an already closed engine does nothing.
    pub async fn close(&self) {
        let mut core = self.core.lock().await;
        if core.connection.state() == ConnectionState::Disconnected {
            return;
        }
        core.tracker.fail_all(EngineError::connection_lost("closed by caller"));
        core.connection.close().await;
        self.sync_state(&core.connection);
        info!("Transaction engine for {} closed", core.connection.peer());
    }
}
