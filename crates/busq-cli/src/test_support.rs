//! Scripted gateway for protocol tests.
//!
//! Every call is recorded as an event string so tests can check the exact
//! sequence of gateway operations, e.g. `["accept_next", "receive:2", "complete:m1", "close"]`.

use async_trait::async_trait;
use busq_runtime::{
    Message, MessageGateway, MessageReceiver, MessageSender, PeekedMessage, ProviderType,
    QueueError, QueueName, ReceiptHandle, ReceivedMessage, SessionId, SessionReceiver, Timestamp,
};
use bytes::Bytes;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// What the scripted gateway answers
#[derive(Default)]
pub(crate) struct Script {
    /// Errors returned by accept calls, in order, before one succeeds
    pub accept_errors: VecDeque<QueueError>,
    /// Batches returned by receive and peek calls; empty once used up
    pub batches: VecDeque<Vec<ReceivedMessage>>,
    /// Message IDs whose completion reports a lost lock
    pub lock_lost: HashSet<String>,
    /// Error for every other completion
    pub complete_error: Option<fn() -> QueueError>,
    /// Error for every send
    pub send_error: Option<fn() -> QueueError>,
    /// Error for closing receivers
    pub close_error: Option<fn() -> QueueError>,
    /// Bodies of sent messages with their session and correlation IDs
    pub sent: Vec<(String, Option<String>, Option<String>)>,
    pub events: Vec<String>,
}

#[derive(Clone, Default)]
pub(crate) struct ScriptedGateway {
    script: Arc<Mutex<Script>>,
}

fn lock(script: &Mutex<Script>) -> MutexGuard<'_, Script> {
    script.lock().unwrap()
}

impl ScriptedGateway {
    pub fn new(script: Script) -> Self {
        Self {
            script: Arc::new(Mutex::new(script)),
        }
    }

    pub fn events(&self) -> Vec<String> {
        lock(&self.script).events.clone()
    }

    pub fn sent(&self) -> Vec<(String, Option<String>, Option<String>)> {
        lock(&self.script).sent.clone()
    }

    fn record(&self, event: String) {
        lock(&self.script).events.push(event);
    }

    fn session_receiver(
        &self,
        session_id: SessionId,
    ) -> Result<Box<dyn SessionReceiver>, QueueError> {
        let mut script = lock(&self.script);
        if let Some(error) = script.accept_errors.pop_front() {
            return Err(error);
        }
        drop(script);

        Ok(Box::new(ScriptedReceiver {
            script: Arc::clone(&self.script),
            session_id: Some(session_id),
        }))
    }
}

/// A received message with a session and a lock
pub(crate) fn received(id: &str, session_id: Option<&str>, body: &str) -> ReceivedMessage {
    ReceivedMessage {
        message_id: id.parse().unwrap(),
        body: Bytes::from(body.to_string()),
        session_id: session_id.map(|s| SessionId::new(s.to_string()).unwrap()),
        correlation_id: None,
        receipt_handle: ReceiptHandle::new(format!("lock-{}", id), Timestamp::now()),
        delivery_count: 1,
        sequence_number: 1,
    }
}

pub(crate) fn no_session_available() -> QueueError {
    QueueError::NoSessionAvailable {
        queue_name: "orders".to_string(),
    }
}

pub(crate) fn connection_lost() -> QueueError {
    QueueError::ConnectionFailed {
        message: "connection reset".to_string(),
    }
}

#[async_trait]
impl MessageGateway for ScriptedGateway {
    async fn create_sender(&self, queue: &QueueName) -> Result<Box<dyn MessageSender>, QueueError> {
        self.record(format!("create_sender:{}", queue));
        Ok(Box::new(ScriptedSender {
            script: Arc::clone(&self.script),
        }))
    }

    async fn create_receiver(
        &self,
        queue: &QueueName,
    ) -> Result<Box<dyn MessageReceiver>, QueueError> {
        self.record(format!("create_receiver:{}", queue));
        Ok(Box::new(ScriptedReceiver {
            script: Arc::clone(&self.script),
            session_id: None,
        }))
    }

    async fn accept_session(
        &self,
        _queue: &QueueName,
        session_id: &SessionId,
    ) -> Result<Box<dyn SessionReceiver>, QueueError> {
        self.record(format!("accept:{}", session_id));
        self.session_receiver(session_id.clone())
    }

    async fn accept_next_session(
        &self,
        _queue: &QueueName,
    ) -> Result<Box<dyn SessionReceiver>, QueueError> {
        self.record("accept_next".to_string());
        self.session_receiver(SessionId::new("s1".to_string()).unwrap())
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::InMemory
    }
}

struct ScriptedSender {
    script: Arc<Mutex<Script>>,
}

#[async_trait]
impl MessageSender for ScriptedSender {
    async fn send_message(&self, message: Message) -> Result<(), QueueError> {
        let mut script = lock(&self.script);
        let body = String::from_utf8_lossy(&message.body).into_owned();
        script.events.push(format!("send:{}", body));
        if let Some(error) = script.send_error {
            return Err(error());
        }
        script.sent.push((
            body,
            message.session_id.map(|s| s.to_string()),
            message.correlation_id,
        ));
        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        lock(&self.script).events.push("close_sender".to_string());
        Ok(())
    }
}

struct ScriptedReceiver {
    script: Arc<Mutex<Script>>,
    session_id: Option<SessionId>,
}

#[async_trait]
impl MessageReceiver for ScriptedReceiver {
    async fn receive_messages(
        &self,
        max_messages: u32,
        _wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let mut script = lock(&self.script);
        script.events.push(format!("receive:{}", max_messages));
        Ok(script.batches.pop_front().unwrap_or_default())
    }

    async fn peek_messages(&self, max_messages: u32) -> Result<Vec<PeekedMessage>, QueueError> {
        let mut script = lock(&self.script);
        script.events.push(format!("peek:{}", max_messages));
        Ok(script
            .batches
            .pop_front()
            .unwrap_or_default()
            .into_iter()
            .map(|m| PeekedMessage {
                message_id: m.message_id,
                body: m.body,
                session_id: m.session_id,
                correlation_id: m.correlation_id,
                sequence_number: m.sequence_number,
            })
            .collect())
    }

    async fn complete_message(&self, message: &ReceivedMessage) -> Result<(), QueueError> {
        let mut script = lock(&self.script);
        script
            .events
            .push(format!("complete:{}", message.message_id));
        if script.lock_lost.contains(message.message_id.as_str()) {
            return Err(QueueError::MessageLockLost {
                message_id: message.message_id.to_string(),
            });
        }
        match script.complete_error {
            Some(error) => Err(error()),
            None => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), QueueError> {
        let mut script = lock(&self.script);
        script.events.push("close".to_string());
        match script.close_error {
            Some(error) => Err(error()),
            None => Ok(()),
        }
    }
}

impl SessionReceiver for ScriptedReceiver {
    fn session_id(&self) -> &SessionId {
        // Only session receivers are handed out as `SessionReceiver`
        self.session_id.as_ref().unwrap()
    }
}
