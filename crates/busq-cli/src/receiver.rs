//! Session-less receive, one message at a time.

use crate::output::{print_received, PrintOptions};
use crate::CliError;
use busq_runtime::{MessageGateway, MessageReceiver, QueueName};
use std::io::Write;
use std::time::Duration;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "receiver_tests.rs"]
mod tests;

/// What one receive attempt produced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// A message was printed and completed
    Completed,
    /// A message was printed but its lock ran out before completion
    LockLost,
    /// Nothing arrived within the receive wait
    Empty,
}

/// Receiver for a queue without sessions
pub struct PlainReceiver {
    receiver: Box<dyn MessageReceiver>,
    wait: Duration,
}

impl PlainReceiver {
    pub async fn open(
        gateway: &dyn MessageGateway,
        queue: &QueueName,
        wait: Duration,
    ) -> Result<Self, CliError> {
        debug!(queue = %queue, "Opening receiver");
        let receiver = gateway
            .create_receiver(queue)
            .await
            .map_err(CliError::queue("Cannot create receiver"))?;
        Ok(Self { receiver, wait })
    }

    /// Pull one message from the head of the queue, print it and complete it
    pub async fn receive_one(
        &self,
        out: &mut dyn Write,
        print: PrintOptions,
    ) -> Result<ReceiveOutcome, CliError> {
        debug!("Calling receive");
        let mut batch = self
            .receiver
            .receive_messages(1, self.wait)
            .await
            .map_err(CliError::queue("Cannot receive message"))?;

        let Some(message) = batch.pop() else {
            debug!("No message received");
            return Ok(ReceiveOutcome::Empty);
        };

        print_received(out, print, &message)?;

        match self.receiver.complete_message(&message).await {
            Ok(()) => Ok(ReceiveOutcome::Completed),
            Err(e) if e.is_lock_lost() => {
                debug!(message_id = %message.message_id, "Message lock expired");
                Ok(ReceiveOutcome::LockLost)
            }
            Err(e) => Err(CliError::queue("Cannot complete message")(e)),
        }
    }

    /// Release the receiver; failures are only logged
    pub async fn close(self) {
        if let Err(e) = self.receiver.close().await {
            warn!(error = %e, "Failed to close receiver");
        }
    }
}
