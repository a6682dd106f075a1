//! Gateway implementations.
//!
//! This module contains concrete implementations of the `MessageGateway`
//! trait for different queue backends.

mod amqp;
pub mod memory;
pub mod service_bus;

pub use memory::InMemoryGateway;
pub use service_bus::{SasTokenProvider, ServiceBusError, ServiceBusGateway};
