//! Outbound half of one client connection.

use oppi_protocol::CommandResult;
use oppi_protocol::ServerMessage;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Enqueues messages for the connection's writer task. Never blocks: a full
/// queue means the client stopped draining, which disconnects the client
/// rather than stalling a supervisor.
#[derive(Clone)]
pub struct OutgoingSender {
    tx: mpsc::Sender<ServerMessage>,
    disconnect: CancellationToken,
}

impl OutgoingSender {
    pub fn new(tx: mpsc::Sender<ServerMessage>, disconnect: CancellationToken) -> Self {
        Self { tx, disconnect }
    }

    pub fn send(&self, message: ServerMessage) {
        match self.tx.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("outbound queue full; disconnecting client");
                self.disconnect.cancel();
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    pub fn result(&self, result: CommandResult) {
        self.send(ServerMessage::CommandResult(result));
    }
}
