//! # Busq Runtime
//!
//! Queue gateway runtime for Azure Service Bus queues, with an in-memory
//! implementation that follows the same semantics for tests and local runs.
//!
//! This library provides:
//! - Peek-lock receive, completion and peek through a provider-agnostic gateway
//! - Session-enabled queues with exclusive session locks
//! - Error classification for lock loss and session acquisition timeouts
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for all queue operations
//! - [`message`] - Message structures and receipt handles
//! - [`provider`] - Provider types and configuration
//! - [`gateway`] - Gateway, sender and receiver traits
//! - [`providers`] - Service Bus (HTTP and AMQP) and in-memory gateways

pub mod error;
pub mod gateway;
pub mod message;
pub mod provider;
pub mod providers;

pub use error::{
    ConfigurationError, QueueError, SerializationError, ValidationError, SESSION_TIMEOUT_MARKER,
};
pub use gateway::{MessageGateway, MessageReceiver, MessageSender, SessionReceiver};
pub use message::{
    Message, MessageId, PeekedMessage, QueueName, ReceiptHandle, ReceivedMessage, SessionId,
    Timestamp,
};
pub use provider::{InMemoryConfig, ProviderType, ServiceBusConfig, ServiceBusCredential};
pub use providers::{InMemoryGateway, ServiceBusError, ServiceBusGateway};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
