//! Printing of received and peeked messages.
//!
//! Each message is one line: the optional `sessionId:` and `messageId:`
//! prefixes, then the body bytes as they are.

use crate::CliError;
use busq_runtime::{MessageId, PeekedMessage, ReceivedMessage, SessionId};
use std::io::Write;

#[cfg(test)]
#[path = "output_tests.rs"]
mod tests;

/// Which prefixes to print before each message body
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrintOptions {
    /// `-ps`: print the session ID, when the message has one
    pub session_id: bool,
    /// `-pm`: print the message ID
    pub message_id: bool,
}

/// Prefix for a message, empty when no prefix applies
pub fn format_prefix(
    options: PrintOptions,
    session_id: Option<&SessionId>,
    message_id: &MessageId,
) -> String {
    let mut prefix = String::new();
    if options.session_id {
        if let Some(session_id) = session_id {
            prefix.push_str(session_id.as_str());
            prefix.push(':');
        }
    }
    if options.message_id {
        prefix.push_str(message_id.as_str());
        prefix.push(':');
    }
    prefix
}

fn write_line(
    out: &mut dyn Write,
    options: PrintOptions,
    session_id: Option<&SessionId>,
    message_id: &MessageId,
    body: &[u8],
) -> Result<(), CliError> {
    let prefix = format_prefix(options, session_id, message_id);
    write_all_parts(out, &[prefix.as_bytes(), body, b"\n"]).map_err(CliError::Output)
}

fn write_all_parts(out: &mut dyn Write, parts: &[&[u8]]) -> std::io::Result<()> {
    for part in parts {
        out.write_all(part)?;
    }
    out.flush()
}

/// Print a message received under a lock
pub fn print_received(
    out: &mut dyn Write,
    options: PrintOptions,
    message: &ReceivedMessage,
) -> Result<(), CliError> {
    write_line(
        out,
        options,
        message.session_id.as_ref(),
        &message.message_id,
        &message.body,
    )
}

/// Print a peeked message
pub fn print_peeked(
    out: &mut dyn Write,
    options: PrintOptions,
    message: &PeekedMessage,
) -> Result<(), CliError> {
    write_line(
        out,
        options,
        message.session_id.as_ref(),
        &message.message_id,
        &message.body,
    )
}
