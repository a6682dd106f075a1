//! Gateway traits for queue operations.
//!
//! A [`MessageGateway`] is the connection-level capability: it opens senders and
//! receivers against a named queue and, for session-enabled queues, accepts
//! sessions. Every handle it returns must be closed by its owner.

use crate::error::QueueError;
use crate::message::{Message, PeekedMessage, QueueName, ReceivedMessage, SessionId};
use crate::provider::ProviderType;
use async_trait::async_trait;
use std::time::Duration;

#[cfg(test)]
#[path = "gateway_tests.rs"]
mod tests;

/// Connection to a queueing service
#[async_trait]
pub trait MessageGateway: Send + Sync {
    /// Open a sender for the queue
    async fn create_sender(&self, queue: &QueueName) -> Result<Box<dyn MessageSender>, QueueError>;

    /// Open a peek-lock receiver for a queue without sessions
    async fn create_receiver(
        &self,
        queue: &QueueName,
    ) -> Result<Box<dyn MessageReceiver>, QueueError>;

    /// Lock exactly the given session
    async fn accept_session(
        &self,
        queue: &QueueName,
        session_id: &SessionId,
    ) -> Result<Box<dyn SessionReceiver>, QueueError>;

    /// Lock whichever session the service hands out next.
    ///
    /// Fails with an error for which [`QueueError::is_session_unavailable`] holds
    /// when no session became available within the service-side wait.
    async fn accept_next_session(
        &self,
        queue: &QueueName,
    ) -> Result<Box<dyn SessionReceiver>, QueueError>;

    /// Get provider type
    fn provider_type(&self) -> ProviderType;
}

/// Sends messages to one queue
#[async_trait]
pub trait MessageSender: Send + Sync {
    /// Send a single message, returning once the service acknowledged it
    async fn send_message(&self, message: Message) -> Result<(), QueueError>;

    /// Release the sender
    async fn close(&self) -> Result<(), QueueError>;
}

/// Receives messages from one queue or one session
#[async_trait]
pub trait MessageReceiver: Send + Sync {
    /// Receive up to `max_messages` under a peek-lock.
    ///
    /// Waits up to `wait` for the first message; an empty result means nothing
    /// arrived in that time.
    async fn receive_messages(
        &self,
        max_messages: u32,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError>;

    /// Read up to `max_messages` past the receiver's peek cursor without locking them.
    /// An empty result means the cursor reached the end of the queue.
    async fn peek_messages(&self, max_messages: u32) -> Result<Vec<PeekedMessage>, QueueError>;

    /// Remove a received message from the queue.
    ///
    /// Fails with [`QueueError::MessageLockLost`] when the lock ran out first.
    async fn complete_message(&self, message: &ReceivedMessage) -> Result<(), QueueError>;

    /// Release the receiver and any locks it still holds
    async fn close(&self) -> Result<(), QueueError>;
}

/// Receiver bound to a locked session
pub trait SessionReceiver: MessageReceiver {
    /// Session held by this receiver
    fn session_id(&self) -> &SessionId;
}
