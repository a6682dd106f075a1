//! Receive orchestration.
//!
//! Picks the plain or session path once from the [`SessionMode`] and runs it
//! to completion:
//!
//! ```text
//! Start -> ModeSelect -> PlainPoll                -> Closed
//!                     -> AcquireSession -> Drain  -> Closed
//! ```
//!
//! A session that runs dry before the count is met ends the receive; no
//! further session is acquired to make up the difference.

use crate::receiver::{PlainReceiver, ReceiveOutcome};
use crate::sessions::{acquire_session, drain_session, SessionTarget};
use crate::{CliError, MessageCount, RunOptions, SessionMode};
use busq_runtime::{MessageGateway, QueueName, SessionId};
use std::io::Write;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "orchestrator_tests.rs"]
mod tests;

/// What a receive did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiveSummary {
    /// Messages printed and completed
    pub completed: u64,
    /// Messages printed but not completed because their lock ran out
    pub lock_lost: u64,
    /// The queue or session ran out before the count was met
    pub exhausted: bool,
    /// Session the messages came from
    pub session: Option<SessionId>,
}

/// Receive up to `count` messages from `queue` in the given session mode
pub async fn receive(
    gateway: &dyn MessageGateway,
    queue: &QueueName,
    mode: &SessionMode,
    count: MessageCount,
    options: &RunOptions,
    out: &mut dyn Write,
) -> Result<ReceiveSummary, CliError> {
    if count.is_satisfied(0) {
        debug!("Nothing to receive");
        return Ok(ReceiveSummary::default());
    }

    match mode {
        SessionMode::NoSession => receive_plain(gateway, queue, count, options, out).await,
        SessionMode::AnySession => {
            receive_session(gateway, queue, SessionTarget::Next, count, options, out).await
        }
        SessionMode::NamedSession(session_id) => {
            receive_session(
                gateway,
                queue,
                SessionTarget::Named(session_id),
                count,
                options,
                out,
            )
            .await
        }
    }
}

async fn receive_plain(
    gateway: &dyn MessageGateway,
    queue: &QueueName,
    count: MessageCount,
    options: &RunOptions,
    out: &mut dyn Write,
) -> Result<ReceiveSummary, CliError> {
    let receiver = PlainReceiver::open(gateway, queue, options.receive_wait).await?;
    let result = poll_plain(&receiver, count, options, out).await;
    receiver.close().await;
    result
}

async fn poll_plain(
    receiver: &PlainReceiver,
    count: MessageCount,
    options: &RunOptions,
    out: &mut dyn Write,
) -> Result<ReceiveSummary, CliError> {
    let mut summary = ReceiveSummary::default();

    while !count.is_satisfied(summary.completed) {
        match receiver.receive_one(out, options.print).await? {
            ReceiveOutcome::Completed => summary.completed += 1,
            ReceiveOutcome::LockLost => summary.lock_lost += 1,
            ReceiveOutcome::Empty => {
                summary.exhausted = true;
                break;
            }
        }
    }

    Ok(summary)
}

async fn receive_session(
    gateway: &dyn MessageGateway,
    queue: &QueueName,
    target: SessionTarget<'_>,
    count: MessageCount,
    options: &RunOptions,
    out: &mut dyn Write,
) -> Result<ReceiveSummary, CliError> {
    let session = acquire_session(gateway, queue, target).await?;
    let session_id = session.session_id().clone();

    let drained = drain_session(
        session.as_ref(),
        count,
        options.session_wait,
        out,
        options.print,
    )
    .await;

    if let Err(e) = session.close().await {
        warn!(session = %session_id, error = %e, "Failed to close session");
    }

    let report = drained?;
    if report.exhausted && !count.is_satisfied(report.completed) {
        if report.obtained_any() {
            debug!(
                session = %session_id,
                completed = report.completed,
                lock_lost = report.lock_lost,
                "Session drained before the requested count"
            );
        } else {
            debug!(session = %session_id, "Session held no messages");
        }
    }

    Ok(ReceiveSummary {
        completed: report.completed,
        lock_lost: report.lock_lost,
        exhausted: report.exhausted,
        session: Some(session_id),
    })
}
