//! Peeking at messages without consuming them.

use crate::output::print_peeked;
use crate::{CliError, MessageCount, RunOptions};
use busq_runtime::{MessageGateway, MessageReceiver, QueueName};
use std::io::Write;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "peek_tests.rs"]
mod tests;

/// Print up to `count` messages from the head of the queue, one peek at a time.
///
/// Stops early when a peek returns nothing. Nothing is completed, so every
/// message stays on the queue. Returns the number of messages printed.
pub async fn peek(
    gateway: &dyn MessageGateway,
    queue: &QueueName,
    count: MessageCount,
    options: &RunOptions,
    out: &mut dyn Write,
) -> Result<u64, CliError> {
    if count.is_satisfied(0) {
        return Ok(0);
    }

    debug!(queue = %queue, "Opening receiver for peek");
    let receiver = gateway
        .create_receiver(queue)
        .await
        .map_err(CliError::queue("Cannot create receiver"))?;

    let result = peek_with(receiver.as_ref(), count, options, out).await;

    if let Err(e) = receiver.close().await {
        warn!(error = %e, "Failed to close receiver");
    }

    result
}

async fn peek_with(
    receiver: &dyn MessageReceiver,
    count: MessageCount,
    options: &RunOptions,
    out: &mut dyn Write,
) -> Result<u64, CliError> {
    let mut printed = 0;

    while !count.is_satisfied(printed) {
        let batch = receiver
            .peek_messages(1)
            .await
            .map_err(CliError::queue("Cannot peek message"))?;

        if batch.is_empty() {
            debug!(printed, "No more messages to peek");
            break;
        }

        for message in &batch {
            print_peeked(out, options.print, message)?;
            printed += 1;
        }
    }

    Ok(printed)
}
