//! # busq CLI
//!
//! Command-line client for Azure Service Bus queues.
//!
//! This module provides CLI commands for:
//! - Sending standard input as one message per line
//! - Receiving and completing messages, optionally from a session
//! - Peeking at messages without consuming them
//!
//! Session-enabled queues are read through the session receive protocol in
//! [`orchestrator`]: a session is acquired (retrying while none is available),
//! drained up to the requested count, and closed.

pub mod config;
pub mod logging;
pub mod orchestrator;
pub mod output;
pub mod peek;
pub mod receiver;
pub mod sender;
pub mod sessions;

#[cfg(test)]
pub(crate) mod test_support;

use busq_runtime::{
    ConfigurationError, MessageGateway, QueueError, QueueName, ServiceBusConfig,
    ServiceBusGateway, SessionId, ValidationError,
};
use clap::{Args, Parser, Subcommand};
use crate::config::{CliConfig, ConfigError};
use output::PrintOptions;
use std::ffi::OsString;
use std::io::Write;
use std::time::Duration;
use tokio::io::AsyncBufRead;
use tracing::debug;

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

// ============================================================================
// CLI Structure
// ============================================================================

/// busq - send, receive and peek Service Bus queue messages
#[derive(Parser, Debug)]
#[command(
    name = "busq",
    disable_help_flag = true,
    disable_version_flag = true,
    disable_help_subcommand = true
)]
pub struct Cli {
    /// Show usage
    #[arg(short = 'h')]
    pub help: bool,

    /// Show version
    #[arg(short = 'v')]
    pub version: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Send standard input, one message per line
    #[command(disable_help_flag = true)]
    Send(SendArgs),

    /// Receive and complete messages
    #[command(disable_help_flag = true)]
    Receive(ReceiveArgs),

    /// Print messages without consuming them
    #[command(disable_help_flag = true)]
    Peek(PeekArgs),
}

impl Commands {
    pub fn common(&self) -> &CommonArgs {
        match self {
            Self::Send(args) => &args.common,
            Self::Receive(args) => &args.common,
            Self::Peek(args) => &args.common,
        }
    }
}

/// Options shared by every command
#[derive(Args, Debug, Clone, Default)]
pub struct CommonArgs {
    /// Connection string of the Service Bus namespace
    #[arg(short = 'c', value_name = "CONNECTION")]
    pub connection_string: Option<String>,

    /// Queue name
    #[arg(short = 'q', value_name = "QUEUE")]
    pub queue: Option<String>,

    /// Print diagnostic messages on stderr
    #[arg(short = 'd')]
    pub debug: bool,

    /// Show usage
    #[arg(short = 'h')]
    pub help: bool,
}

impl CommonArgs {
    /// Connection string and queue, both of which every command needs
    pub fn require(&self) -> Result<(&str, QueueName), CliError> {
        let connection_string = self
            .connection_string
            .as_deref()
            .filter(|value| !value.is_empty())
            .ok_or(CliError::MissingArgument {
                what: "connection string",
            })?;
        let queue = self
            .queue
            .as_deref()
            .filter(|value| !value.is_empty())
            .ok_or(CliError::MissingArgument { what: "queue name" })?;

        Ok((connection_string, QueueName::new(queue.to_string())?))
    }
}

#[derive(Args, Debug, Clone)]
pub struct SendArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Session to send to; omitted or empty sends without a session
    #[arg(short = 's', value_name = "SESSION")]
    pub session: Option<String>,

    /// Correlation ID set on every message
    #[arg(short = 'i', value_name = "CORRELATION")]
    pub correlation_id: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct ReceiveArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Session to receive from; "" for the next available session
    #[arg(short = 's', value_name = "SESSION")]
    pub session: Option<String>,

    /// Number of messages, negative for no limit
    #[arg(short = 'n', default_value_t = 1, allow_negative_numbers = true)]
    pub count: i64,

    /// Print the session ID before each message
    #[arg(short = 'p', long = "ps")]
    pub print_session_id: bool,

    /// Print the message ID before each message
    #[arg(long = "pm")]
    pub print_message_id: bool,
}

#[derive(Args, Debug, Clone)]
pub struct PeekArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Accepted for symmetry with the other commands and ignored
    #[arg(short = 's', value_name = "SESSION")]
    pub session: Option<String>,

    /// Number of messages, negative for no limit
    #[arg(short = 'n', default_value_t = 1, allow_negative_numbers = true)]
    pub count: i64,

    /// Print the session ID before each message
    #[arg(short = 'p', long = "ps")]
    pub print_session_id: bool,

    /// Print the message ID before each message
    #[arg(long = "pm")]
    pub print_message_id: bool,
}

/// Flags that consume the following argument as their value
const VALUE_FLAGS: [&str; 5] = ["-c", "-q", "-s", "-n", "-i"];

/// Rewrite the multi-letter single-dash flags `-ps` and `-pm` to `--ps` and `--pm`.
///
/// Arguments in value position (after `-c`, `-q`, `-s`, `-n` or `-i`) are left alone.
pub fn normalize_args<I, T>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let mut normalized = Vec::new();
    let mut value_position = false;

    for arg in args {
        let arg: OsString = arg.into();
        if value_position {
            value_position = false;
            normalized.push(arg);
            continue;
        }

        let replacement = match arg.to_str() {
            Some("-ps") => Some("--ps"),
            Some("-pm") => Some("--pm"),
            _ => None,
        };
        value_position = arg.to_str().is_some_and(|a| VALUE_FLAGS.contains(&a));
        normalized.push(replacement.map(OsString::from).unwrap_or(arg));
    }

    normalized
}

// ============================================================================
// Run Options
// ============================================================================

/// Which sessions a receive reads from, decided once from `-s`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionMode {
    /// `-s` not given: the queue has no sessions
    NoSession,
    /// `-s ""`: whichever session the service hands out next
    AnySession,
    /// `-s <id>`: exactly this session
    NamedSession(SessionId),
}

impl SessionMode {
    pub fn from_flag(flag: Option<&str>) -> Result<Self, ValidationError> {
        match flag {
            None => Ok(Self::NoSession),
            Some("") => Ok(Self::AnySession),
            Some(id) => Ok(Self::NamedSession(SessionId::new(id.to_string())?)),
        }
    }
}

/// How many messages a receive or peek should handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageCount {
    Bounded(u64),
    Unbounded,
}

impl MessageCount {
    /// Negative values mean no limit
    pub fn from_flag(n: i64) -> Self {
        u64::try_from(n).map_or(Self::Unbounded, Self::Bounded)
    }

    /// Messages still wanted after `done`, `None` when unbounded
    pub fn remaining(&self, done: u64) -> Option<u64> {
        match self {
            Self::Bounded(n) => Some(n.saturating_sub(done)),
            Self::Unbounded => None,
        }
    }

    pub fn is_satisfied(&self, done: u64) -> bool {
        self.remaining(done) == Some(0)
    }
}

/// Immutable settings for one invocation, built at startup
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub debug: bool,
    pub print: PrintOptions,
    pub correlation_id: Option<String>,
    /// Wait for a message on a queue without sessions
    pub receive_wait: Duration,
    /// Wait for a message in a session before it counts as drained
    pub session_wait: Duration,
}

impl RunOptions {
    pub fn new(command: &Commands, config: &CliConfig) -> Self {
        let (print, correlation_id) = match command {
            Commands::Send(args) => (PrintOptions::default(), args.correlation_id.clone()),
            Commands::Receive(args) => (
                PrintOptions {
                    session_id: args.print_session_id,
                    message_id: args.print_message_id,
                },
                None,
            ),
            Commands::Peek(args) => (
                PrintOptions {
                    session_id: args.print_session_id,
                    message_id: args.print_message_id,
                },
                None,
            ),
        };

        Self {
            debug: command.common().debug,
            print,
            correlation_id,
            receive_wait: config.receive_wait(),
            session_wait: config.session_wait(),
        }
    }
}

// ============================================================================
// CLI Error Types
// ============================================================================

/// CLI-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Arguments could not be parsed; usage is shown
    #[error("{0}")]
    Usage(String),

    #[error("{what} is required")]
    MissingArgument { what: &'static str },

    #[error("Invalid connection string: {0}")]
    ConnectionString(#[from] ConfigurationError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(#[from] ValidationError),

    #[error("{context}: {source}")]
    Queue {
        context: String,
        #[source]
        source: QueueError,
    },

    #[error("Cannot read input: {0}")]
    Input(#[source] std::io::Error),

    #[error("Cannot write output: {0}")]
    Output(#[source] std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Cannot initialize logging: {0}")]
    Logging(String),
}

impl CliError {
    /// Wrap a queue failure with what was being attempted
    pub fn queue(context: &str) -> impl FnOnce(QueueError) -> CliError + '_ {
        move |source| CliError::Queue {
            context: context.to_string(),
            source,
        }
    }

    /// Process exit status for the error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => 2,
            _ => 1,
        }
    }
}

// ============================================================================
// Usage and Version
// ============================================================================

const USAGE: &str = "\
busq - send, receive and peek Service Bus queue messages

Usage:
  busq send -c <connection> -q <queue> [-s <session>] [-i <correlation>] [-d]
  busq receive -c <connection> -q <queue> [-s <session>] [-n <count>] [-ps] [-pm] [-d]
  busq peek -c <connection> -q <queue> [-s <session>] [-n <count>] [-ps] [-pm] [-d]
  busq -v
  busq -h

Common options:
  -c       connection string of the Service Bus namespace
  -q       queue name
  -d       print diagnostic messages on stderr
  -h       show this help
  -n       number of messages to receive or peek, negative for no limit (default 1)
  -s       session ID: omit it for a queue without sessions, pass \"\" to use the
           next available session, or name the session to use (peek ignores it
           and reads the whole queue)

Receive and peek options:
  -ps, -p  print the session ID before each message
  -pm      print the message ID before each message

Send options:
  -i       correlation ID set on every message
           (one message is sent per line of standard input)";

/// Usage text
pub fn usage() -> &'static str {
    USAGE
}

/// Version line, with the build date taken from `BUSQ_BUILD_DATE` at build time
pub fn version_line() -> String {
    format!(
        "busq {} (built {})",
        env!("CARGO_PKG_VERSION"),
        option_env!("BUSQ_BUILD_DATE").unwrap_or("unknown")
    )
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Main CLI entry point
pub async fn run_cli<I, T>(args: I) -> Result<(), CliError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let cli = Cli::try_parse_from(normalize_args(args))
        .map_err(|e| CliError::Usage(e.to_string()))?;

    if cli.version {
        println!("{}", version_line());
        return Ok(());
    }

    let command = match cli.command {
        Some(command) if !command.common().help => command,
        Some(_) => {
            println!("{}", usage());
            return Ok(());
        }
        None if cli.help => {
            println!("{}", usage());
            return Ok(());
        }
        None => return Err(CliError::Usage("a command is required".to_string())),
    };

    let config = crate::config::load_configuration()?;
    logging::initialize_logging(command.common().debug, config.log_format)?;
    debug!(?config, "Configuration loaded");

    let (connection_string, queue) = command.common().require()?;
    let gateway = connect(connection_string, &config)?;
    let options = RunOptions::new(&command, &config);

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut stdout = std::io::stdout();
    execute_command(&command, &gateway, &queue, &options, stdin, &mut stdout).await
}

/// Build the Service Bus gateway for a connection string
pub fn connect(connection_string: &str, config: &CliConfig) -> Result<ServiceBusGateway, CliError> {
    let service_bus = ServiceBusConfig::from_connection_string(connection_string)?
        .with_receive_wait(config.receive_wait().max(config.session_wait()))
        .with_http_timeout(config.http_timeout())
        .with_token_ttl(config.sas_token_ttl());

    debug!(namespace = service_bus.namespace(), "Connecting");
    ServiceBusGateway::new(service_bus)
        .map_err(|e| CliError::queue("Cannot connect")(e.to_queue_error()))
}

/// Run a parsed command against a gateway
pub async fn execute_command<R>(
    command: &Commands,
    gateway: &dyn MessageGateway,
    queue: &QueueName,
    options: &RunOptions,
    input: R,
    out: &mut dyn Write,
) -> Result<(), CliError>
where
    R: AsyncBufRead + Unpin,
{
    match command {
        Commands::Send(args) => {
            let session = match args.session.as_deref() {
                None | Some("") => None,
                Some(id) => Some(SessionId::new(id.to_string())?),
            };
            let sent = sender::send_lines(gateway, queue, session.as_ref(), options, input).await?;
            debug!(sent, "Send finished");
        }
        Commands::Receive(args) => {
            let mode = SessionMode::from_flag(args.session.as_deref())?;
            let count = MessageCount::from_flag(args.count);
            let summary = orchestrator::receive(gateway, queue, &mode, count, options, out).await?;
            debug!(
                completed = summary.completed,
                lock_lost = summary.lock_lost,
                exhausted = summary.exhausted,
                "Receive finished"
            );
        }
        Commands::Peek(args) => {
            if let Some(session) = &args.session {
                debug!(session = %session, "Peek reads the whole queue, ignoring -s");
            }
            let count = MessageCount::from_flag(args.count);
            let peeked = peek::peek(gateway, queue, count, options, out).await?;
            debug!(peeked, "Peek finished");
        }
    }

    Ok(())
}
