//! AMQP receiver links for the operations the HTTP interface cannot express.
//!
//! Browsing a queue without locking its messages and holding a session both
//! need a receiver link. Each link runs on its own task, which owns the client
//! connection and the receiver and answers the [`LinkCommand`]s sent through a
//! [`Link`] handle. The task disposes both once the link is closed or its
//! handle is dropped.
//!
//! Client errors carry the AMQP condition in their text; [`classify`] maps the
//! conditions the receive protocol cares about onto [`QueueError`] variants.

use crate::error::{QueueError, ValidationError, SESSION_TIMEOUT_MARKER};
use crate::gateway::{MessageReceiver, SessionReceiver};
use crate::message::{
    MessageId, PeekedMessage, QueueName, ReceiptHandle, ReceivedMessage, SessionId, Timestamp,
};
use crate::provider::ProviderType;
use async_trait::async_trait;
use azservicebus::prelude::*;
use bytes::Bytes;
use chrono::Utc;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

#[cfg(test)]
#[path = "amqp_tests.rs"]
mod tests;

const LOCK_LOST_MARKER: &str = "com.microsoft:message-lock-lost";
const SESSION_LOCK_LOST_MARKER: &str = "com.microsoft:session-lock-lost";
const NOT_FOUND_MARKER: &str = "amqp:not-found";
const UNAUTHORIZED_MARKER: &str = "amqp:unauthorized-access";

/// Lock duration assumed for messages received over a link
const DEFAULT_LOCK_SECS: i64 = 30;

const COMMAND_BUFFER: usize = 8;

// ============================================================================
// Error Classification
// ============================================================================

/// Map the text of an AMQP client error onto a [`QueueError`].
///
/// `message_id` names the message a settlement was for and is empty for
/// every other call.
pub(crate) fn classify(detail: &str, queue: &QueueName, message_id: &str) -> QueueError {
    if detail.contains(SESSION_TIMEOUT_MARKER) {
        QueueError::NoSessionAvailable {
            queue_name: queue.to_string(),
        }
    } else if detail.contains(LOCK_LOST_MARKER) || detail.contains(SESSION_LOCK_LOST_MARKER) {
        QueueError::MessageLockLost {
            message_id: message_id.to_string(),
        }
    } else if detail.contains(NOT_FOUND_MARKER) {
        QueueError::QueueNotFound {
            queue_name: queue.to_string(),
        }
    } else if detail.contains(UNAUTHORIZED_MARKER) {
        QueueError::AuthenticationFailed {
            message: detail.to_string(),
        }
    } else {
        QueueError::ProviderError {
            provider: ProviderType::ServiceBus.to_string(),
            code: "amqp".to_string(),
            message: detail.to_string(),
        }
    }
}

/// Classify a client error on both renderings; conditions often only show up in `Debug`
fn link_error<E>(error: &E, queue: &QueueName, message_id: &str) -> QueueError
where
    E: fmt::Display + fmt::Debug,
{
    classify(&format!("{} ({:?})", error, error), queue, message_id)
}

fn connect_error(error: &impl fmt::Display) -> QueueError {
    QueueError::ConnectionFailed {
        message: format!("Cannot open AMQP connection: {}", error),
    }
}

fn link_gone(queue: &QueueName) -> QueueError {
    QueueError::ConnectionFailed {
        message: format!("AMQP link for queue '{}' is closed", queue),
    }
}

fn unsupported(operation: &str) -> QueueError {
    QueueError::Unsupported {
        provider: ProviderType::ServiceBus.to_string(),
        operation: operation.to_string(),
    }
}

fn unreadable_body(error: &impl fmt::Display) -> QueueError {
    QueueError::ProviderError {
        provider: ProviderType::ServiceBus.to_string(),
        code: "amqp".to_string(),
        message: format!("Unreadable message body: {}", error),
    }
}

// ============================================================================
// Message Conversion
// ============================================================================

/// Fields shared by received and peeked messages
#[derive(Debug, Clone)]
struct MessageFields {
    message_id: MessageId,
    body: Bytes,
    session_id: Option<SessionId>,
    correlation_id: Option<String>,
    sequence_number: i64,
}

impl MessageFields {
    /// The receipt handle carries the sequence number the link settles by
    fn into_received(self, delivery_count: Option<u32>) -> ReceivedMessage {
        let expires_at =
            Timestamp::from_datetime(Utc::now() + chrono::Duration::seconds(DEFAULT_LOCK_SECS));
        ReceivedMessage {
            message_id: self.message_id,
            body: self.body,
            session_id: self.session_id,
            correlation_id: self.correlation_id,
            receipt_handle: ReceiptHandle::new(self.sequence_number.to_string(), expires_at),
            delivery_count: delivery_count.unwrap_or(1),
            sequence_number: self.sequence_number,
        }
    }

    fn into_peeked(self) -> PeekedMessage {
        PeekedMessage {
            message_id: self.message_id,
            body: self.body,
            session_id: self.session_id,
            correlation_id: self.correlation_id,
            sequence_number: self.sequence_number,
        }
    }
}

/// Read [`MessageFields`] off a received or peeked client message
macro_rules! message_fields {
    ($message:expr) => {{
        let message = &$message;
        message
            .body()
            .map(|body| MessageFields {
                message_id: message
                    .message_id()
                    .and_then(|id| id.to_string().parse::<MessageId>().ok())
                    .unwrap_or_default(),
                body: Bytes::copy_from_slice(body),
                session_id: message
                    .session_id()
                    .and_then(|id| SessionId::new(id.to_string()).ok()),
                correlation_id: message.correlation_id().map(|id| id.to_string()),
                sequence_number: message.sequence_number(),
            })
            .map_err(|e| unreadable_body(&e))
    }};
}

// ============================================================================
// Link Plumbing
// ============================================================================

type Reply<T> = oneshot::Sender<Result<T, QueueError>>;

/// Requests served by a link task
enum LinkCommand {
    Receive {
        max_messages: u32,
        wait: Duration,
        reply: Reply<Vec<ReceivedMessage>>,
    },
    Peek {
        max_messages: u32,
        reply: Reply<Vec<PeekedMessage>>,
    },
    Complete {
        sequence_number: i64,
        message_id: String,
        reply: Reply<()>,
    },
    Close {
        reply: Reply<()>,
    },
}

/// Handle to a running link task
struct Link {
    queue: QueueName,
    commands: mpsc::Sender<LinkCommand>,
}

impl Link {
    async fn call<T, F>(&self, command: F) -> Result<T, QueueError>
    where
        F: FnOnce(Reply<T>) -> LinkCommand,
    {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| link_gone(&self.queue))?;
        response.await.map_err(|_| link_gone(&self.queue))?
    }
}

/// Answer a pending close, or log a failure nobody is waiting for
fn finish(queue: &QueueName, closing: Option<Reply<()>>, result: Result<(), QueueError>) {
    match closing {
        Some(reply) => {
            let _ = reply.send(result);
        }
        None => {
            if let Err(e) = result {
                warn!(queue = %queue, error = %e, "Failed to close AMQP link");
            }
        }
    }
}

// ============================================================================
// Browse Link
// ============================================================================

/// Link that peeks a queue without locking anything.
///
/// The client keeps the peek cursor; every peek continues after the last
/// message it returned.
pub(crate) struct AmqpPeeker {
    link: Link,
}

impl AmqpPeeker {
    pub(crate) async fn open(connection_string: &str, queue: &QueueName) -> Result<Self, QueueError> {
        let (commands, inbox) = mpsc::channel(COMMAND_BUFFER);
        let (ready, opened) = oneshot::channel();
        tokio::spawn(run_browse_link(
            connection_string.to_string(),
            queue.clone(),
            ready,
            inbox,
        ));

        opened.await.map_err(|_| link_gone(queue))??;
        Ok(Self {
            link: Link {
                queue: queue.clone(),
                commands,
            },
        })
    }

    pub(crate) async fn peek(&self, max_messages: u32) -> Result<Vec<PeekedMessage>, QueueError> {
        self.link
            .call(|reply| LinkCommand::Peek {
                max_messages,
                reply,
            })
            .await
    }

    pub(crate) async fn close(&self) -> Result<(), QueueError> {
        self.link.call(|reply| LinkCommand::Close { reply }).await
    }
}

async fn run_browse_link(
    connection_string: String,
    queue: QueueName,
    ready: Reply<()>,
    mut inbox: mpsc::Receiver<LinkCommand>,
) {
    debug!(queue = %queue, "Opening AMQP browse link");
    let mut client = match ServiceBusClient::new_from_connection_string(
        connection_string.as_str(),
        ServiceBusClientOptions::default(),
    )
    .await
    {
        Ok(client) => client,
        Err(e) => {
            let _ = ready.send(Err(connect_error(&e)));
            return;
        }
    };

    let mut receiver = match client
        .create_receiver_for_queue(queue.as_str(), ServiceBusReceiverOptions::default())
        .await
    {
        Ok(receiver) => receiver,
        Err(e) => {
            let _ = ready.send(Err(link_error(&e, &queue, "")));
            if let Err(e) = client.dispose().await {
                warn!(error = %e, "Failed to close AMQP connection");
            }
            return;
        }
    };
    let _ = ready.send(Ok(()));

    let mut closing = None;
    while let Some(command) = inbox.recv().await {
        match command {
            LinkCommand::Peek {
                max_messages,
                reply,
            } => {
                debug!(queue = %queue, max_messages, "Calling peek");
                let result = match receiver.peek_messages(max_messages, None).await {
                    Ok(messages) => messages
                        .iter()
                        .map(|message| message_fields!(message).map(MessageFields::into_peeked))
                        .collect::<Result<Vec<_>, _>>(),
                    Err(e) => Err(link_error(&e, &queue, "")),
                };
                let _ = reply.send(result);
            }
            LinkCommand::Receive { reply, .. } => {
                let _ = reply.send(Err(unsupported("receiving through a browse link")));
            }
            LinkCommand::Complete { reply, .. } => {
                let _ = reply.send(Err(unsupported("completing through a browse link")));
            }
            LinkCommand::Close { reply } => {
                closing = Some(reply);
                break;
            }
        }
    }

    debug!(queue = %queue, "Closing AMQP browse link");
    let result = receiver
        .dispose()
        .await
        .map_err(|e| link_error(&e, &queue, ""));
    if let Err(e) = client.dispose().await {
        warn!(error = %e, "Failed to close AMQP connection");
    }
    finish(&queue, closing, result);
}

// ============================================================================
// Session Link
// ============================================================================

/// Receiver holding the lock on one session
pub(crate) struct AmqpSessionReceiver {
    link: Link,
    session_id: SessionId,
}

/// Lock `session_id`, or whichever session comes next when it is `None`.
///
/// When no session turns up before the service gives up, the error satisfies
/// [`QueueError::is_session_unavailable`].
pub(crate) async fn accept_session(
    connection_string: &str,
    queue: &QueueName,
    session_id: Option<&SessionId>,
) -> Result<AmqpSessionReceiver, QueueError> {
    let (commands, inbox) = mpsc::channel(COMMAND_BUFFER);
    let (ready, accepted) = oneshot::channel();
    tokio::spawn(run_session_link(
        connection_string.to_string(),
        queue.clone(),
        session_id.map(|id| id.as_str().to_string()),
        ready,
        inbox,
    ));

    let accepted = accepted.await.map_err(|_| link_gone(queue))??;
    Ok(AmqpSessionReceiver {
        link: Link {
            queue: queue.clone(),
            commands,
        },
        session_id: SessionId::new(accepted)?,
    })
}

async fn run_session_link(
    connection_string: String,
    queue: QueueName,
    session_id: Option<String>,
    ready: Reply<String>,
    mut inbox: mpsc::Receiver<LinkCommand>,
) {
    debug!(queue = %queue, session = ?session_id, "Opening AMQP session link");
    let mut client = match ServiceBusClient::new_from_connection_string(
        connection_string.as_str(),
        ServiceBusClientOptions::default(),
    )
    .await
    {
        Ok(client) => client,
        Err(e) => {
            let _ = ready.send(Err(connect_error(&e)));
            return;
        }
    };

    let accepted = match &session_id {
        Some(session_id) => client
            .accept_session_for_queue(
                queue.as_str(),
                session_id.as_str(),
                ServiceBusSessionReceiverOptions::default(),
            )
            .await
            .map_err(|e| link_error(&e, &queue, "")),
        None => client
            .accept_next_session_for_queue(
                queue.as_str(),
                ServiceBusSessionReceiverOptions::default(),
            )
            .await
            .map_err(|e| link_error(&e, &queue, "")),
    };

    let mut receiver = match accepted {
        Ok(receiver) => receiver,
        Err(e) => {
            let _ = ready.send(Err(e));
            if let Err(e) = client.dispose().await {
                warn!(error = %e, "Failed to close AMQP connection");
            }
            return;
        }
    };
    let _ = ready.send(Ok(receiver.session_id().to_string()));

    // Received messages by sequence number, kept until they are settled
    let mut pending = HashMap::new();
    let mut closing = None;
    while let Some(command) = inbox.recv().await {
        match command {
            LinkCommand::Receive {
                max_messages,
                wait,
                reply,
            } => {
                debug!(queue = %queue, max_messages, "Calling receive");
                let result = match receiver
                    .receive_messages_with_max_wait_time(max_messages, Some(wait))
                    .await
                {
                    Ok(messages) => {
                        let received = messages
                            .iter()
                            .map(|message| {
                                let delivery_count = Option::<u32>::from(message.delivery_count());
                                message_fields!(message)
                                    .map(|fields| fields.into_received(delivery_count))
                            })
                            .collect::<Result<Vec<_>, _>>();
                        if received.is_ok() {
                            for message in messages {
                                pending.insert(message.sequence_number(), message);
                            }
                        }
                        received
                    }
                    Err(e) => Err(link_error(&e, &queue, "")),
                };
                let _ = reply.send(result);
            }
            LinkCommand::Peek {
                max_messages,
                reply,
            } => {
                let result = match receiver.peek_messages(max_messages, None).await {
                    Ok(messages) => messages
                        .iter()
                        .map(|message| message_fields!(message).map(MessageFields::into_peeked))
                        .collect::<Result<Vec<_>, _>>(),
                    Err(e) => Err(link_error(&e, &queue, "")),
                };
                let _ = reply.send(result);
            }
            LinkCommand::Complete {
                sequence_number,
                message_id,
                reply,
            } => {
                debug!(message_id = %message_id, "Completing message");
                let result = match pending.remove(&sequence_number) {
                    Some(message) => receiver
                        .complete_message(&message)
                        .await
                        .map_err(|e| link_error(&e, &queue, &message_id)),
                    None => Err(QueueError::MessageLockLost { message_id }),
                };
                let _ = reply.send(result);
            }
            LinkCommand::Close { reply } => {
                closing = Some(reply);
                break;
            }
        }
    }

    debug!(queue = %queue, unsettled = pending.len(), "Closing AMQP session link");
    let result = receiver
        .dispose()
        .await
        .map_err(|e| link_error(&e, &queue, ""));
    if let Err(e) = client.dispose().await {
        warn!(error = %e, "Failed to close AMQP connection");
    }
    finish(&queue, closing, result);
}

#[async_trait]
impl MessageReceiver for AmqpSessionReceiver {
    async fn receive_messages(
        &self,
        max_messages: u32,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        self.link
            .call(|reply| LinkCommand::Receive {
                max_messages,
                wait,
                reply,
            })
            .await
    }

    async fn peek_messages(&self, max_messages: u32) -> Result<Vec<PeekedMessage>, QueueError> {
        self.link
            .call(|reply| LinkCommand::Peek {
                max_messages,
                reply,
            })
            .await
    }

    async fn complete_message(&self, message: &ReceivedMessage) -> Result<(), QueueError> {
        let sequence_number = message
            .receipt_handle
            .handle()
            .parse::<i64>()
            .map_err(|e| ValidationError::InvalidFormat {
                field: "receipt_handle".to_string(),
                message: e.to_string(),
            })?;
        let message_id = message.message_id.to_string();

        self.link
            .call(|reply| LinkCommand::Complete {
                sequence_number,
                message_id,
                reply,
            })
            .await
    }

    async fn close(&self) -> Result<(), QueueError> {
        debug!(session = %self.session_id, "Closing session");
        self.link.call(|reply| LinkCommand::Close { reply }).await
    }
}

impl SessionReceiver for AmqpSessionReceiver {
    fn session_id(&self) -> &SessionId {
        &self.session_id
    }
}
