//! Session acquisition and draining.
//!
//! A session is acquired by ID or as "whichever comes next", retrying for as
//! long as the service reports that no session is available. The acquired
//! session is then drained in batches until the requested count is met or a
//! receive comes back empty.

use crate::output::{print_received, PrintOptions};
use crate::{CliError, MessageCount};
use busq_runtime::{MessageGateway, QueueName, SessionId, SessionReceiver};
use std::io::Write;
use std::time::Duration;
use tracing::debug;

#[cfg(test)]
#[path = "sessions_tests.rs"]
mod tests;

/// Largest batch requested from a session
pub const MAX_BATCH: u32 = 100;

/// Which session to acquire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionTarget<'a> {
    Next,
    Named(&'a SessionId),
}

/// Acquire a session, retrying while none is available.
///
/// The caller owns the returned session and must close it.
pub async fn acquire_session(
    gateway: &dyn MessageGateway,
    queue: &QueueName,
    target: SessionTarget<'_>,
) -> Result<Box<dyn SessionReceiver>, CliError> {
    let mut attempts: u64 = 0;

    loop {
        attempts += 1;
        let result = match target {
            SessionTarget::Named(session_id) => {
                debug!(queue = %queue, session = %session_id, attempts, "Accepting session");
                gateway.accept_session(queue, session_id).await
            }
            SessionTarget::Next => {
                debug!(queue = %queue, attempts, "Accepting next available session");
                gateway.accept_next_session(queue).await
            }
        };

        match result {
            Ok(session) => {
                debug!(session = %session.session_id(), "Session accepted");
                return Ok(session);
            }
            Err(e) if e.is_session_unavailable() => {
                debug!("No session available, trying again");
            }
            Err(e) => return Err(CliError::queue("Cannot accept session")(e)),
        }
    }
}

/// Result of draining a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Messages printed and completed
    pub completed: u64,
    /// Messages printed whose lock ran out before completion
    pub lock_lost: u64,
    /// The session ran out of messages before the count was met
    pub exhausted: bool,
}

impl DrainReport {
    /// Whether the session handed out any message at all
    pub fn obtained_any(&self) -> bool {
        self.completed + self.lock_lost > 0
    }
}

/// Size of the next batch, `None` once the count is met
fn next_batch_size(count: MessageCount, completed: u64) -> Option<u32> {
    match count.remaining(completed) {
        Some(0) => None,
        Some(remaining) => Some(u32::try_from(remaining).map_or(MAX_BATCH, |r| r.min(MAX_BATCH))),
        None => Some(MAX_BATCH),
    }
}

/// Print and complete messages from the session until `count` messages were
/// completed or a receive returns nothing within `wait`.
///
/// Messages whose lock ran out are skipped and not counted. Does not close
/// the session.
pub async fn drain_session(
    session: &dyn SessionReceiver,
    count: MessageCount,
    wait: Duration,
    out: &mut dyn Write,
    print: PrintOptions,
) -> Result<DrainReport, CliError> {
    let mut report = DrainReport::default();

    while let Some(batch_size) = next_batch_size(count, report.completed) {
        debug!(session = %session.session_id(), batch_size, "Calling receive");
        let batch = session
            .receive_messages(batch_size, wait)
            .await
            .map_err(CliError::queue("Cannot receive message"))?;

        if batch.is_empty() {
            debug!(session = %session.session_id(), "Session drained");
            report.exhausted = true;
            break;
        }

        for message in &batch {
            print_received(out, print, message)?;

            match session.complete_message(message).await {
                Ok(()) => report.completed += 1,
                Err(e) if e.is_lock_lost() => {
                    debug!(message_id = %message.message_id, "Message lock expired");
                    report.lock_lost += 1;
                }
                Err(e) => return Err(CliError::queue("Cannot complete message")(e)),
            }
        }
    }

    Ok(report)
}
