//! Sending standard input as messages.

use crate::{CliError, RunOptions};
use busq_runtime::{Message, MessageGateway, MessageSender, QueueName, SessionId};
use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, warn};

#[cfg(test)]
#[path = "sender_tests.rs"]
mod tests;

/// Send each input line as one message, in input order.
///
/// Every send is awaited before the next line is read. The sender is closed
/// whether or not sending succeeded. Returns the number of messages sent.
pub async fn send_lines<R>(
    gateway: &dyn MessageGateway,
    queue: &QueueName,
    session: Option<&SessionId>,
    options: &RunOptions,
    input: R,
) -> Result<u64, CliError>
where
    R: AsyncBufRead + Unpin,
{
    debug!(queue = %queue, session = ?session, "Opening sender");
    let sender = gateway
        .create_sender(queue)
        .await
        .map_err(CliError::queue("Cannot create sender"))?;

    let result = send_all(sender.as_ref(), session, options, input).await;

    if let Err(e) = sender.close().await {
        warn!(error = %e, "Failed to close sender");
    }
    result
}

async fn send_all<R>(
    sender: &dyn MessageSender,
    session: Option<&SessionId>,
    options: &RunOptions,
    input: R,
) -> Result<u64, CliError>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    let mut sent = 0;

    while let Some(line) = lines.next_line().await.map_err(CliError::Input)? {
        let mut message = Message::new(Bytes::from(line));
        if let Some(session) = session {
            message = message.with_session_id(session.clone());
        }
        if let Some(correlation_id) = &options.correlation_id {
            message = message.with_correlation_id(correlation_id.clone());
        }

        debug!(line = sent + 1, "Sending message");
        sender
            .send_message(message)
            .await
            .map_err(CliError::queue("Cannot send message"))?;
        sent += 1;
    }

    Ok(sent)
}
