//! # Client Worker
//!
//! Runs a [`ModbusTcpClient`] on its own task so that front ends (a UI event
//! loop, an interactive shell) never wait on the network themselves.
//!
//! Commands go to the worker over an unbounded channel, each with a oneshot
//! responder for its result. Every outcome is also published as a
//! [`WorkerEvent`], which is what a log view subscribes to.
//!
//! ```rust,no_run
//! use modbus_master::worker::{ClientWorker, WorkerEvent};
//! use modbus_master::{ClientConfig, VerifyPolicy};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (worker, mut events) = ClientWorker::spawn();
//! worker.connect(ClientConfig::new("127.0.0.1", 5020)).await?;
//! let outcome = worker.write_and_verify(1, vec![4321], 1, VerifyPolicy::default()).await?;
//! println!("{:?}", outcome);
//!
//! while let Ok(event) = events.try_recv() {
//!     println!("{:?}", event);
//! }
//! worker.shutdown().await;
//! # Ok(())
//! # }
//! ```

use log::{debug, info};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::client::{ClientConfig, ModbusTcpClient, RegisterClient, VerificationOutcome, VerifyPolicy};
use crate::error::{ClientError, ClientResult};
use crate::protocol::{ModbusAddress, ModbusValue, UnitId};

/// Operation requested from the worker
#[derive(Debug)]
enum WorkerCommand {
    Connect {
        config: ClientConfig,
        responder: oneshot::Sender<ClientResult<()>>,
    },
    Disconnect {
        responder: oneshot::Sender<ClientResult<()>>,
    },
    Read {
        start: ModbusAddress,
        quantity: u16,
        unit_id: UnitId,
        responder: oneshot::Sender<ClientResult<Vec<ModbusValue>>>,
    },
    WriteSingle {
        address: ModbusAddress,
        value: ModbusValue,
        unit_id: UnitId,
        responder: oneshot::Sender<ClientResult<()>>,
    },
    WriteMultiple {
        address: ModbusAddress,
        values: Vec<ModbusValue>,
        unit_id: UnitId,
        responder: oneshot::Sender<ClientResult<()>>,
    },
    WriteAndVerify {
        address: ModbusAddress,
        values: Vec<ModbusValue>,
        unit_id: UnitId,
        policy: VerifyPolicy,
        responder: oneshot::Sender<ClientResult<VerificationOutcome>>,
    },
}

/// Outcome notifications published by the worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    Connected { address: String },
    ConnectFailed { address: String, error: ClientError },
    Disconnected,
    ReadCompleted { start: ModbusAddress, values: Vec<ModbusValue> },
    WriteCompleted { address: ModbusAddress, count: usize },
    Verified { address: ModbusAddress, outcome: VerificationOutcome },
    OperationFailed { operation: &'static str, error: ClientError },
}

/// Handle to a worker task owning the only client
pub struct ClientWorker {
    request_sender: mpsc::UnboundedSender<WorkerCommand>,
    worker_handle: JoinHandle<()>,
}

impl ClientWorker {
    /// Start the worker task
    ///
    /// Returns the handle and the receiving end of the event channel.
    pub fn spawn() -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (request_sender, request_receiver) = mpsc::unbounded_channel();
        let (event_sender, event_receiver) = mpsc::unbounded_channel();
        let worker_handle = tokio::spawn(Self::worker_task(request_receiver, event_sender));
        (Self { request_sender, worker_handle }, event_receiver)
    }

    async fn worker_task(
        mut request_receiver: mpsc::UnboundedReceiver<WorkerCommand>,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) {
        let mut client: Option<ModbusTcpClient> = None;
        let publish = |event: WorkerEvent| {
            // Nobody listening is fine
            let _ = events.send(event);
        };

        while let Some(command) = request_receiver.recv().await {
            match command {
                WorkerCommand::Connect { config, responder } => {
                    if let Some(previous) = client.take() {
                        previous.close().await;
                    }
                    let address = config.address();
                    let result = match ModbusTcpClient::connect(config).await {
                        Ok(connected) => {
                            client = Some(connected);
                            publish(WorkerEvent::Connected { address });
                            Ok(())
                        }
                        Err(error) => {
                            publish(WorkerEvent::ConnectFailed { address, error: error.clone() });
                            Err(error)
                        }
                    };
                    let _ = responder.send(result);
                }
                WorkerCommand::Disconnect { responder } => {
                    if let Some(previous) = client.take() {
                        previous.close().await;
                        publish(WorkerEvent::Disconnected);
                    }
                    let _ = responder.send(Ok(()));
                }
                WorkerCommand::Read { start, quantity, unit_id, responder } => {
                    let result = match client.as_ref() {
                        Some(c) => c.read_holding_registers(start, quantity, unit_id).await,
                        None => Err(ClientError::not_connected()),
                    };
                    publish(match &result {
                        Ok(values) => WorkerEvent::ReadCompleted { start, values: values.clone() },
                        Err(error) => WorkerEvent::OperationFailed { operation: "read", error: error.clone() },
                    });
                    let _ = responder.send(result);
                }
                WorkerCommand::WriteSingle { address, value, unit_id, responder } => {
                    let result = match client.as_ref() {
                        Some(c) => c.write_single_register(address, value, unit_id).await,
                        None => Err(ClientError::not_connected()),
                    };
                    publish(match &result {
                        Ok(()) => WorkerEvent::WriteCompleted { address, count: 1 },
                        Err(error) => WorkerEvent::OperationFailed { operation: "write", error: error.clone() },
                    });
                    let _ = responder.send(result);
                }
                WorkerCommand::WriteMultiple { address, values, unit_id, responder } => {
                    let result = match client.as_ref() {
                        Some(c) => c.write_multiple_registers(address, &values, unit_id).await,
                        None => Err(ClientError::not_connected()),
                    };
                    publish(match &result {
                        Ok(()) => WorkerEvent::WriteCompleted { address, count: values.len() },
                        Err(error) => WorkerEvent::OperationFailed { operation: "write", error: error.clone() },
                    });
                    let _ = responder.send(result);
                }
                WorkerCommand::WriteAndVerify { address, values, unit_id, policy, responder } => {
                    let result = match client.as_ref() {
                        Some(c) => c.write_and_verify(address, &values, unit_id, &policy).await,
                        None => Err(ClientError::not_connected()),
                    };
                    publish(match &result {
                        Ok(outcome) => WorkerEvent::Verified { address, outcome: outcome.clone() },
                        Err(error) => WorkerEvent::OperationFailed { operation: "write and verify", error: error.clone() },
                    });
                    let _ = responder.send(result);
                }
            }
        }

        if let Some(previous) = client.take() {
            previous.close().await;
        }
        debug!("Client worker stopped");
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<ClientResult<T>>) -> WorkerCommand,
    ) -> ClientResult<T> {
        let (responder, receiver) = oneshot::channel();
        self.request_sender
            .send(build(responder))
            .map_err(|_| ClientError::WorkerUnavailable)?;
        receiver.await.map_err(|_| ClientError::WorkerUnavailable)?
    }

    /// Connect, replacing any existing connection
    pub async fn connect(&self, config: ClientConfig) -> ClientResult<()> {
        info!("Worker connecting to {}", config.address());
        self.call(|responder| WorkerCommand::Connect { config, responder }).await
    }

    pub async fn disconnect(&self) -> ClientResult<()> {
        self.call(|responder| WorkerCommand::Disconnect { responder }).await
    }

    pub async fn read(&self, start: ModbusAddress, quantity: u16, unit_id: UnitId) -> ClientResult<Vec<ModbusValue>> {
        self.call(|responder| WorkerCommand::Read { start, quantity, unit_id, responder }).await
    }

    pub async fn write_single(&self, address: ModbusAddress, value: ModbusValue, unit_id: UnitId) -> ClientResult<()> {
        self.call(|responder| WorkerCommand::WriteSingle { address, value, unit_id, responder }).await
    }

    pub async fn write_multiple(
        &self,
        address: ModbusAddress,
        values: Vec<ModbusValue>,
        unit_id: UnitId,
    ) -> ClientResult<()> {
        self.call(|responder| WorkerCommand::WriteMultiple { address, values, unit_id, responder }).await
    }

    pub async fn write_and_verify(
        &self,
        address: ModbusAddress,
        values: Vec<ModbusValue>,
        unit_id: UnitId,
        policy: VerifyPolicy,
    ) -> ClientResult<VerificationOutcome> {
        self.call(|responder| WorkerCommand::WriteAndVerify { address, values, unit_id, policy, responder })
            .await
    }

    /// Stop the worker after it finishes queued commands; the connection is closed
    pub async fn shutdown(self) {
        let Self { request_sender, worker_handle } = self;
        drop(request_sender);
        if let Err(e) = worker_handle.await {
            debug!("Client worker ended abnormally: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_commands_without_connection() {
        let (worker, mut events) = ClientWorker::spawn();

        let result = worker.read(0, 1, 1).await;
        assert_eq!(result, Err(ClientError::not_connected()));
        assert_eq!(
            events.recv().await,
            Some(WorkerEvent::OperationFailed { operation: "read", error: ClientError::not_connected() })
        );

        assert_eq!(worker.disconnect().await, Ok(()));
        worker.shutdown().await;
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test]
    async fn test_connect_failure_is_published() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let (worker, mut events) = ClientWorker::spawn();
        let result = worker.connect(ClientConfig::new("127.0.0.1", port)).await;
        assert!(matches!(result, Err(ClientError::Connect(_))));
        assert!(matches!(events.recv().await, Some(WorkerEvent::ConnectFailed { .. })));
        worker.shutdown().await;
    }
}
