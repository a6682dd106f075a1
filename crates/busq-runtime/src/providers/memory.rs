//! In-memory gateway implementation for testing and development.
//!
//! This module provides a fully functional in-process queue service that:
//! - Keeps FIFO order by sequence number
//! - Delivers messages under peek-locks that expire and get redelivered
//! - Supports session-enabled queues with exclusive session locks
//! - Peeks without locking or removing anything
//!
//! It follows the service semantics closely enough to drive the receive
//! protocol end to end without a network.

use crate::error::QueueError;
use crate::gateway::{MessageGateway, MessageReceiver, MessageSender, SessionReceiver};
use crate::message::{
    Message, MessageId, PeekedMessage, QueueName, ReceiptHandle, ReceivedMessage, SessionId,
    Timestamp,
};
use crate::provider::{InMemoryConfig, ProviderType};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

// ============================================================================
// Internal Storage Structures
// ============================================================================

/// Shared storage for all queues
struct QueueStorage {
    queues: HashMap<QueueName, InMemoryQueue>,
    next_sequence_number: i64,
    config: InMemoryConfig,
}

impl QueueStorage {
    fn new(config: InMemoryConfig) -> Self {
        Self {
            queues: HashMap::new(),
            next_sequence_number: 1,
            config,
        }
    }

    /// Get or create a queue
    fn get_or_create_queue(&mut self, queue_name: &QueueName) -> &mut InMemoryQueue {
        self.queues
            .entry(queue_name.clone())
            .or_insert_with(InMemoryQueue::new)
    }
}

/// Internal queue state for a single queue
struct InMemoryQueue {
    requires_session: bool,
    /// Deliverable messages in sequence order
    messages: VecDeque<StoredMessage>,
    /// Locked messages by lock token
    in_flight: HashMap<String, InFlightMessage>,
    /// Session locks: session -> owning receiver
    session_locks: HashMap<SessionId, String>,
}

impl InMemoryQueue {
    fn new() -> Self {
        Self {
            requires_session: false,
            messages: VecDeque::new(),
            in_flight: HashMap::new(),
            session_locks: HashMap::new(),
        }
    }

    /// Put a message back in sequence order
    fn requeue(&mut self, message: StoredMessage) {
        let position = self
            .messages
            .iter()
            .position(|m| m.sequence_number > message.sequence_number)
            .unwrap_or(self.messages.len());
        self.messages.insert(position, message);
    }

    /// Return messages whose lock ran out
    fn reclaim_expired_locks(&mut self) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, m)| m.is_expired())
            .map(|(token, _)| token.clone())
            .collect();

        for token in expired {
            if let Some(in_flight) = self.in_flight.remove(&token) {
                debug!(
                    message_id = %in_flight.message.message_id,
                    "Message lock expired, returning message to queue"
                );
                self.requeue(in_flight.message);
            }
        }
    }

    /// Return every message locked by a receiver
    fn release_owner(&mut self, owner: &str) {
        let owned: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, m)| m.owner == owner)
            .map(|(token, _)| token.clone())
            .collect();

        for token in owned {
            if let Some(in_flight) = self.in_flight.remove(&token) {
                self.requeue(in_flight.message);
            }
        }

        self.session_locks.retain(|_, holder| holder != owner);
    }

    /// Lock up to `max` deliverable messages of the given session (or of no session)
    fn take_available(
        &mut self,
        session: Option<&SessionId>,
        max: u32,
        owner: &str,
        lock_duration: Duration,
    ) -> Vec<ReceivedMessage> {
        let mut taken = Vec::new();
        let mut index = 0;

        while index < self.messages.len() && taken.len() < max as usize {
            if self.messages[index].session_id.as_ref() != session {
                index += 1;
                continue;
            }

            let Some(mut message) = self.messages.remove(index) else {
                break;
            };
            message.delivery_count += 1;

            let lock_token = uuid::Uuid::new_v4().to_string();
            let lock_expires_at = lock_expiry(lock_duration);

            taken.push(ReceivedMessage {
                message_id: message.message_id.clone(),
                body: message.body.clone(),
                session_id: message.session_id.clone(),
                correlation_id: message.correlation_id.clone(),
                receipt_handle: ReceiptHandle::new(lock_token.clone(), lock_expires_at.clone()),
                delivery_count: message.delivery_count,
                sequence_number: message.sequence_number,
            });

            self.in_flight.insert(
                lock_token,
                InFlightMessage {
                    message,
                    owner: owner.to_string(),
                    lock_expires_at,
                },
            );
        }

        taken
    }

    /// First session with deliverable messages that nobody holds
    fn next_unlocked_session(&self) -> Option<SessionId> {
        self.messages
            .iter()
            .filter_map(|m| m.session_id.as_ref())
            .find(|session| !self.session_locks.contains_key(*session))
            .cloned()
    }

    /// Messages past the cursor, whether locked or not, in sequence order
    fn peek_after(
        &self,
        session: Option<&SessionId>,
        cursor: i64,
        max: u32,
    ) -> Vec<PeekedMessage> {
        let mut visible: Vec<&StoredMessage> = self
            .messages
            .iter()
            .chain(self.in_flight.values().map(|m| &m.message))
            .filter(|m| m.sequence_number > cursor)
            .filter(|m| session.is_none() || m.session_id.as_ref() == session)
            .collect();
        visible.sort_by_key(|m| m.sequence_number);

        visible
            .into_iter()
            .take(max as usize)
            .map(|m| PeekedMessage {
                message_id: m.message_id.clone(),
                body: m.body.clone(),
                session_id: m.session_id.clone(),
                correlation_id: m.correlation_id.clone(),
                sequence_number: m.sequence_number,
            })
            .collect()
    }

    fn len(&self) -> usize {
        self.messages.len() + self.in_flight.len()
    }
}

/// A message stored in the queue with metadata
#[derive(Clone)]
struct StoredMessage {
    message_id: MessageId,
    body: Bytes,
    session_id: Option<SessionId>,
    correlation_id: Option<String>,
    sequence_number: i64,
    delivery_count: u32,
}

/// A message currently locked by a receiver
struct InFlightMessage {
    message: StoredMessage,
    owner: String,
    lock_expires_at: Timestamp,
}

impl InFlightMessage {
    fn is_expired(&self) -> bool {
        Timestamp::now() >= self.lock_expires_at
    }
}

fn lock_expiry(lock_duration: Duration) -> Timestamp {
    let lock =
        chrono::Duration::from_std(lock_duration).unwrap_or_else(|_| chrono::Duration::days(365));
    Timestamp::from_datetime(Utc::now() + lock)
}

fn invalid_operation(message: &str) -> QueueError {
    QueueError::ProviderError {
        provider: ProviderType::InMemory.to_string(),
        code: "InvalidOperation".to_string(),
        message: message.to_string(),
    }
}

fn lock_storage(storage: &Mutex<QueueStorage>) -> Result<MutexGuard<'_, QueueStorage>, QueueError> {
    storage.lock().map_err(|_| QueueError::ProviderError {
        provider: ProviderType::InMemory.to_string(),
        code: "StoragePoisoned".to_string(),
        message: "in-memory storage lock was poisoned".to_string(),
    })
}

// ============================================================================
// InMemoryGateway
// ============================================================================

/// In-memory gateway implementation
#[derive(Clone)]
pub struct InMemoryGateway {
    storage: Arc<Mutex<QueueStorage>>,
}

impl InMemoryGateway {
    /// Create new in-memory gateway with configuration
    pub fn new(config: InMemoryConfig) -> Self {
        Self {
            storage: Arc::new(Mutex::new(QueueStorage::new(config))),
        }
    }

    /// Declare a queue as session-enabled. Queues are plain unless declared.
    pub fn create_session_queue(&self, queue: &QueueName) -> Result<(), QueueError> {
        let mut storage = lock_storage(&self.storage)?;
        storage.get_or_create_queue(queue).requires_session = true;
        Ok(())
    }

    /// Make every outstanding message lock on the queue run out now
    pub fn expire_message_locks(&self, queue: &QueueName) -> Result<(), QueueError> {
        let mut storage = lock_storage(&self.storage)?;
        let queue = storage.get_or_create_queue(queue);
        let now = Timestamp::now();
        for in_flight in queue.in_flight.values_mut() {
            in_flight.lock_expires_at = now.clone();
        }
        Ok(())
    }

    /// Messages still on the queue, locked or not
    pub fn message_count(&self, queue: &QueueName) -> Result<usize, QueueError> {
        let storage = lock_storage(&self.storage)?;
        Ok(storage.queues.get(queue).map_or(0, InMemoryQueue::len))
    }

    /// Check whether some receiver holds the session
    pub fn is_session_locked(
        &self,
        queue: &QueueName,
        session_id: &SessionId,
    ) -> Result<bool, QueueError> {
        let storage = lock_storage(&self.storage)?;
        Ok(storage
            .queues
            .get(queue)
            .is_some_and(|q| q.session_locks.contains_key(session_id)))
    }

    fn open_receiver(&self, queue: &QueueName, session: Option<SessionId>) -> InMemoryReceiver {
        InMemoryReceiver {
            storage: Arc::clone(&self.storage),
            queue: queue.clone(),
            owner: uuid::Uuid::new_v4().to_string(),
            session,
            peek_cursor: Mutex::new(0),
        }
    }
}

impl Default for InMemoryGateway {
    fn default() -> Self {
        Self::new(InMemoryConfig::default())
    }
}

#[async_trait]
impl MessageGateway for InMemoryGateway {
    async fn create_sender(&self, queue: &QueueName) -> Result<Box<dyn MessageSender>, QueueError> {
        lock_storage(&self.storage)?.get_or_create_queue(queue);
        Ok(Box::new(InMemorySender {
            storage: Arc::clone(&self.storage),
            queue: queue.clone(),
        }))
    }

    async fn create_receiver(
        &self,
        queue: &QueueName,
    ) -> Result<Box<dyn MessageReceiver>, QueueError> {
        let mut storage = lock_storage(&self.storage)?;
        if storage.get_or_create_queue(queue).requires_session {
            return Err(invalid_operation(
                "a session-enabled queue cannot be read by a session-less receiver",
            ));
        }
        drop(storage);

        Ok(Box::new(self.open_receiver(queue, None)))
    }

    async fn accept_session(
        &self,
        queue: &QueueName,
        session_id: &SessionId,
    ) -> Result<Box<dyn SessionReceiver>, QueueError> {
        let receiver = self.open_receiver(queue, Some(session_id.clone()));

        let mut storage = lock_storage(&self.storage)?;
        let lock_duration = storage.config.lock_duration;
        let state = storage.get_or_create_queue(queue);
        if !state.requires_session {
            return Err(invalid_operation("the queue is not session-enabled"));
        }
        if state.session_locks.contains_key(session_id) {
            return Err(QueueError::SessionLocked {
                session_id: session_id.to_string(),
                locked_until: lock_expiry(lock_duration),
            });
        }
        state
            .session_locks
            .insert(session_id.clone(), receiver.owner.clone());
        drop(storage);

        Ok(Box::new(InMemorySessionReceiver {
            session_id: session_id.clone(),
            inner: receiver,
        }))
    }

    async fn accept_next_session(
        &self,
        queue: &QueueName,
    ) -> Result<Box<dyn SessionReceiver>, QueueError> {
        let (session_wait, poll_interval) = {
            let storage = lock_storage(&self.storage)?;
            (storage.config.session_wait, storage.config.poll_interval)
        };
        let deadline = Instant::now() + session_wait;

        loop {
            {
                let mut storage = lock_storage(&self.storage)?;
                let state = storage.get_or_create_queue(queue);
                if !state.requires_session {
                    return Err(invalid_operation("the queue is not session-enabled"));
                }
                state.reclaim_expired_locks();

                if let Some(session_id) = state.next_unlocked_session() {
                    let receiver = self.open_receiver(queue, Some(session_id.clone()));
                    state
                        .session_locks
                        .insert(session_id.clone(), receiver.owner.clone());
                    return Ok(Box::new(InMemorySessionReceiver {
                        session_id,
                        inner: receiver,
                    }));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(QueueError::NoSessionAvailable {
                    queue_name: queue.to_string(),
                });
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::InMemory
    }
}

// ============================================================================
// Sender
// ============================================================================

struct InMemorySender {
    storage: Arc<Mutex<QueueStorage>>,
    queue: QueueName,
}

#[async_trait]
impl MessageSender for InMemorySender {
    async fn send_message(&self, message: Message) -> Result<(), QueueError> {
        let max_size = ProviderType::InMemory.max_message_size();
        if message.body.len() > max_size {
            return Err(QueueError::MessageTooLarge {
                size: message.body.len(),
                max_size,
            });
        }

        let mut storage = lock_storage(&self.storage)?;
        let sequence_number = storage.next_sequence_number;
        storage.next_sequence_number += 1;

        let queue = storage.get_or_create_queue(&self.queue);
        if queue.requires_session && message.session_id.is_none() {
            return Err(invalid_operation(
                "messages sent to a session-enabled queue need a session ID",
            ));
        }

        queue.messages.push_back(StoredMessage {
            message_id: message.message_id.unwrap_or_default(),
            body: message.body,
            session_id: message.session_id,
            correlation_id: message.correlation_id,
            sequence_number,
            delivery_count: 0,
        });

        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

// ============================================================================
// Receivers
// ============================================================================

struct InMemoryReceiver {
    storage: Arc<Mutex<QueueStorage>>,
    queue: QueueName,
    owner: String,
    session: Option<SessionId>,
    peek_cursor: Mutex<i64>,
}

#[async_trait]
impl MessageReceiver for InMemoryReceiver {
    async fn receive_messages(
        &self,
        max_messages: u32,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        if max_messages == 0 {
            return Ok(Vec::new());
        }

        let deadline = Instant::now() + wait;
        loop {
            let poll_interval = {
                let mut storage = lock_storage(&self.storage)?;
                let lock_duration = storage.config.lock_duration;
                let poll_interval = storage.config.poll_interval;
                let queue = storage.get_or_create_queue(&self.queue);
                queue.reclaim_expired_locks();

                let taken = queue.take_available(
                    self.session.as_ref(),
                    max_messages,
                    &self.owner,
                    lock_duration,
                );
                if !taken.is_empty() {
                    return Ok(taken);
                }
                poll_interval
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }

    async fn peek_messages(&self, max_messages: u32) -> Result<Vec<PeekedMessage>, QueueError> {
        let storage = lock_storage(&self.storage)?;
        let mut cursor = self.peek_cursor.lock().map_err(|_| QueueError::ProviderError {
            provider: ProviderType::InMemory.to_string(),
            code: "StoragePoisoned".to_string(),
            message: "peek cursor lock was poisoned".to_string(),
        })?;

        let peeked = storage.queues.get(&self.queue).map_or_else(Vec::new, |queue| {
            queue.peek_after(self.session.as_ref(), *cursor, max_messages)
        });
        if let Some(last) = peeked.last() {
            *cursor = last.sequence_number;
        }

        Ok(peeked)
    }

    async fn complete_message(&self, message: &ReceivedMessage) -> Result<(), QueueError> {
        let mut storage = lock_storage(&self.storage)?;
        let queue = storage.get_or_create_queue(&self.queue);
        queue.reclaim_expired_locks();

        let token = message.receipt_handle.handle();
        let held = queue
            .in_flight
            .get(token)
            .is_some_and(|in_flight| in_flight.owner == self.owner);
        if !held {
            return Err(QueueError::MessageLockLost {
                message_id: message.message_id.to_string(),
            });
        }

        queue.in_flight.remove(token);
        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        let mut storage = lock_storage(&self.storage)?;
        storage
            .get_or_create_queue(&self.queue)
            .release_owner(&self.owner);
        Ok(())
    }
}

struct InMemorySessionReceiver {
    session_id: SessionId,
    inner: InMemoryReceiver,
}

#[async_trait]
impl MessageReceiver for InMemorySessionReceiver {
    async fn receive_messages(
        &self,
        max_messages: u32,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        self.inner.receive_messages(max_messages, wait).await
    }

    async fn peek_messages(&self, max_messages: u32) -> Result<Vec<PeekedMessage>, QueueError> {
        self.inner.peek_messages(max_messages).await
    }

    async fn complete_message(&self, message: &ReceivedMessage) -> Result<(), QueueError> {
        self.inner.complete_message(message).await
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.inner.close().await
    }
}

impl SessionReceiver for InMemorySessionReceiver {
    fn session_id(&self) -> &SessionId {
        &self.session_id
    }
}
