//! Azure Service Bus gateway.
//!
//! Sending, receiving and completing go through the HTTP REST interface.
//! Requests are authorized with Shared Access Signature tokens minted from the
//! connection string's key, so these paths can be exercised against a mocked
//! HTTP server in unit tests.
//!
//! ## Operations
//!
//! - **Send**: `POST {queue}/messages`, broker properties in the `BrokerProperties` header
//! - **Receive**: `POST {queue}/messages/head?timeout=N` under a peek-lock; `201` carries
//!   a message, `204` means nothing arrived before the timeout
//! - **Complete**: `DELETE` on the lock URI returned in the `Location` header
//! - **Peek**: over an AMQP browse link, opened on the first peek.
//!   Peeking never locks a message, so it leaves delivery counts alone.
//!
//! ## Session Support
//!
//! The REST interface can tag messages with a session ID but cannot hold a
//! session. Accepting a session opens an AMQP session link instead.
//!
//! The AMQP links need the connection string; a gateway configured without one
//! reports [`QueueError::Unsupported`] for peeking and accepting sessions.

use super::amqp::{self, AmqpPeeker};
use crate::error::{QueueError, SerializationError, SESSION_TIMEOUT_MARKER};
use crate::gateway::{MessageGateway, MessageReceiver, MessageSender, SessionReceiver};
use crate::message::{
    Message, MessageId, PeekedMessage, QueueName, ReceiptHandle, ReceivedMessage, SessionId,
    Timestamp,
};
use crate::provider::{ProviderType, ServiceBusConfig, ServiceBusCredential};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE, LOCATION};
use reqwest::{Client as HttpClient, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

#[cfg(test)]
#[path = "service_bus_tests.rs"]
mod tests;

const BROKER_PROPERTIES: &str = "BrokerProperties";

/// Lock duration assumed when the service does not report one
const DEFAULT_LOCK_SECS: i64 = 30;

// ============================================================================
// Error Types
// ============================================================================

/// Service Bus specific errors
#[derive(Debug, thiserror::Error)]
pub enum ServiceBusError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Message lock lost: {0}")]
    LockLost(String),

    #[error("Message too large: {size} bytes (max: {max_size})")]
    MessageTooLarge { size: usize, max_size: usize },

    #[error("No session available on {0}")]
    NoSessionAvailable(String),

    #[error("Service error {status}: {message}")]
    ServiceError { status: u16, message: String },

    #[error("Invalid {header} header: {message}")]
    InvalidHeader { header: String, message: String },

    #[error("{0} is not supported")]
    Unsupported(String),
}

impl ServiceBusError {
    /// Map Service Bus error to QueueError
    pub fn to_queue_error(self) -> QueueError {
        let provider = ProviderType::ServiceBus.to_string();
        match self {
            Self::Authentication(message) => QueueError::AuthenticationFailed { message },
            Self::PermissionDenied(operation) => QueueError::PermissionDenied { operation },
            Self::ConnectionFailed(message) => QueueError::ConnectionFailed { message },
            Self::Timeout(duration) => QueueError::Timeout { duration },
            Self::QueueNotFound(queue_name) => QueueError::QueueNotFound { queue_name },
            Self::LockLost(message_id) => QueueError::MessageLockLost { message_id },
            Self::MessageTooLarge { size, max_size } => {
                QueueError::MessageTooLarge { size, max_size }
            }
            Self::NoSessionAvailable(queue_name) => QueueError::NoSessionAvailable { queue_name },
            Self::ServiceError { status, message } => QueueError::ProviderError {
                provider,
                code: status.to_string(),
                message,
            },
            Self::InvalidHeader { header, message } => {
                QueueError::SerializationError(SerializationError::InvalidHeader { header, message })
            }
            Self::Unsupported(operation) => QueueError::Unsupported {
                provider,
                operation,
            },
        }
    }
}

impl From<ServiceBusError> for QueueError {
    fn from(error: ServiceBusError) -> Self {
        error.to_queue_error()
    }
}

// ============================================================================
// Shared Access Signature
// ============================================================================

type HmacSha256 = Hmac<Sha256>;

/// Mints Shared Access Signature tokens from a policy name and key.
///
/// The string to sign is the URL-encoded resource URI and the expiry (seconds
/// since the Unix epoch) joined by a newline. The key's UTF-8 bytes are the
/// HMAC key; the key is not base64-decoded.
#[derive(Clone)]
pub struct SasTokenProvider {
    key_name: String,
    key: String,
    ttl: Duration,
}

impl SasTokenProvider {
    pub fn new(key_name: String, key: String, ttl: Duration) -> Self {
        Self { key_name, key, ttl }
    }

    /// Token for the resource, valid for the configured TTL from now
    pub fn token_for(&self, resource: &str) -> Result<String, ServiceBusError> {
        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX / 2);
        let expiry = Utc::now().timestamp().saturating_add(ttl);
        self.generate_token(resource, expiry)
    }

    /// Token for the resource expiring at `expiry` (Unix seconds)
    pub fn generate_token(&self, resource: &str, expiry: i64) -> Result<String, ServiceBusError> {
        let encoded_resource = urlencoding::encode(resource);
        let string_to_sign = format!("{}\n{}", encoded_resource, expiry);

        let mut mac = HmacSha256::new_from_slice(self.key.as_bytes())
            .map_err(|e| ServiceBusError::Authentication(format!("Invalid signing key: {}", e)))?;
        mac.update(string_to_sign.as_bytes());
        let signature = STANDARD.encode(mac.finalize().into_bytes());

        Ok(format!(
            "SharedAccessSignature sr={}&sig={}&se={}&skn={}",
            encoded_resource,
            urlencoding::encode(&signature),
            expiry,
            urlencoding::encode(&self.key_name)
        ))
    }
}

impl fmt::Debug for SasTokenProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SasTokenProvider")
            .field("key_name", &self.key_name)
            .field("key", &"<redacted>")
            .field("ttl", &self.ttl)
            .finish()
    }
}

/// Source of the `Authorization` header
#[derive(Debug, Clone)]
enum Authorizer {
    Key(SasTokenProvider),
    Token(String),
}

impl Authorizer {
    fn from_config(config: &ServiceBusConfig) -> Self {
        match &config.credential {
            ServiceBusCredential::SharedAccessKey { key_name, key } => Self::Key(
                SasTokenProvider::new(key_name.clone(), key.clone(), config.token_ttl),
            ),
            ServiceBusCredential::SharedAccessSignature(token) => Self::Token(token.clone()),
        }
    }

    fn authorization(&self, resource: &str) -> Result<String, ServiceBusError> {
        match self {
            Self::Key(provider) => provider.token_for(resource),
            Self::Token(token) => Ok(token.clone()),
        }
    }
}

// ============================================================================
// Broker Properties
// ============================================================================

/// Message metadata carried in the `BrokerProperties` header
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BrokerProperties {
    #[serde(skip_serializing_if = "Option::is_none")]
    message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
    /// RFC 2822 date, e.g. `Wed, 15 Jan 2025 10:00:00 GMT`
    #[serde(skip_serializing_if = "Option::is_none")]
    locked_until_utc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    delivery_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sequence_number: Option<i64>,
}

impl BrokerProperties {
    fn for_message(message: &Message) -> Self {
        Self {
            message_id: message.message_id.as_ref().map(|id| id.to_string()),
            session_id: message.session_id.as_ref().map(|id| id.to_string()),
            correlation_id: message.correlation_id.clone(),
            ..Self::default()
        }
    }

    fn from_headers(headers: &HeaderMap) -> Result<Self, ServiceBusError> {
        let Some(value) = headers.get(BROKER_PROPERTIES) else {
            return Ok(Self::default());
        };

        let raw = value.to_str().map_err(|e| invalid_header(BROKER_PROPERTIES, e))?;
        serde_json::from_str(raw).map_err(|e| invalid_header(BROKER_PROPERTIES, e))
    }

    fn locked_until(&self) -> Timestamp {
        self.locked_until_utc
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc2822(raw).ok())
            .map(|dt| Timestamp::from_datetime(dt.with_timezone(&Utc)))
            .unwrap_or_else(|| {
                Timestamp::from_datetime(Utc::now() + chrono::Duration::seconds(DEFAULT_LOCK_SECS))
            })
    }
}

fn invalid_header(header: &str, error: impl fmt::Display) -> ServiceBusError {
    ServiceBusError::InvalidHeader {
        header: header.to_string(),
        message: error.to_string(),
    }
}

// ============================================================================
// Connection
// ============================================================================

/// Plumbing shared by the gateway and every handle it opens
struct ServiceBusConnection {
    http_client: HttpClient,
    endpoint: Url,
    authorizer: Authorizer,
    http_timeout: Duration,
    max_wait: Duration,
    /// Connection string for AMQP links, if the gateway may open them
    amqp: Option<String>,
}

impl ServiceBusConnection {
    fn amqp(&self, operation: &str) -> Result<&str, ServiceBusError> {
        self.amqp
            .as_deref()
            .ok_or_else(|| {
                ServiceBusError::Unsupported(format!("{} without a connection string", operation))
            })
    }

    fn queue_url(&self, queue: &QueueName, suffix: &str) -> Result<Url, ServiceBusError> {
        self.endpoint
            .join(&format!("{}{}", queue.as_str(), suffix))
            .map_err(|e| ServiceBusError::ServiceError {
                status: 0,
                message: format!("Cannot build URL for queue '{}': {}", queue, e),
            })
    }

    /// Start an authorized request. The SAS resource is the URL without its query.
    fn request(&self, method: Method, url: &Url) -> Result<RequestBuilder, ServiceBusError> {
        let mut resource = url.clone();
        resource.set_query(None);
        let authorization = self.authorizer.authorization(resource.as_str())?;

        Ok(self
            .http_client
            .request(method, url.clone())
            .header(AUTHORIZATION, authorization))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ServiceBusError> {
        request.send().await.map_err(|e| {
            if e.is_timeout() {
                ServiceBusError::Timeout(self.http_timeout)
            } else if e.is_connect() {
                ServiceBusError::ConnectionFailed(format!("Connection failed: {}", e))
            } else {
                ServiceBusError::ConnectionFailed(format!("HTTP request failed: {}", e))
            }
        })
    }

    /// Turn a non-success response into an error
    async fn error_from(response: Response, queue: &QueueName) -> ServiceBusError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        map_status(status, &body, queue)
    }
}

/// Map a failed response onto an error
fn map_status(status: StatusCode, body: &str, queue: &QueueName) -> ServiceBusError {
    if body.contains(SESSION_TIMEOUT_MARKER) {
        return ServiceBusError::NoSessionAvailable(queue.to_string());
    }

    match status {
        StatusCode::UNAUTHORIZED => ServiceBusError::Authentication(summarize(body, status)),
        StatusCode::FORBIDDEN => ServiceBusError::PermissionDenied(summarize(body, status)),
        StatusCode::NOT_FOUND | StatusCode::GONE => ServiceBusError::QueueNotFound(queue.to_string()),
        StatusCode::PAYLOAD_TOO_LARGE => ServiceBusError::MessageTooLarge {
            size: 0,
            max_size: ProviderType::ServiceBus.max_message_size(),
        },
        _ => ServiceBusError::ServiceError {
            status: status.as_u16(),
            message: summarize(body, status),
        },
    }
}

fn summarize(body: &str, status: StatusCode) -> String {
    let body = body.trim();
    if body.is_empty() {
        status.canonical_reason().unwrap_or("no details").to_string()
    } else {
        body.to_string()
    }
}

// ============================================================================
// Gateway
// ============================================================================

/// Azure Service Bus gateway over HTTP, with AMQP links for peek and sessions
///
/// # Example
///
/// ```no_run
/// use busq_runtime::{MessageGateway, QueueName, ServiceBusConfig, ServiceBusGateway};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ServiceBusConfig::from_connection_string(
///     "Endpoint=sb://contoso.servicebus.windows.net/;SharedAccessKeyName=send;SharedAccessKey=c2VjcmV0",
/// )?;
/// let gateway = ServiceBusGateway::new(config)?;
/// let sender = gateway.create_sender(&"orders".parse()?).await?;
/// # Ok(())
/// # }
/// ```
pub struct ServiceBusGateway {
    connection: Arc<ServiceBusConnection>,
}

impl ServiceBusGateway {
    /// Create a gateway for the namespace described by the configuration
    pub fn new(config: ServiceBusConfig) -> Result<Self, ServiceBusError> {
        let http_client = HttpClient::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| {
                ServiceBusError::ConnectionFailed(format!("Failed to create HTTP client: {}", e))
            })?;

        debug!(namespace = config.namespace(), "Creating Service Bus gateway");

        Ok(Self {
            connection: Arc::new(ServiceBusConnection {
                http_client,
                endpoint: config.endpoint.clone(),
                authorizer: Authorizer::from_config(&config),
                http_timeout: config.http_timeout,
                max_wait: config.receive_wait,
                amqp: config.connection_string.clone(),
            }),
        })
    }
}

impl fmt::Debug for ServiceBusGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceBusGateway")
            .field("endpoint", &self.connection.endpoint.as_str())
            .finish()
    }
}

#[async_trait]
impl MessageGateway for ServiceBusGateway {
    async fn create_sender(&self, queue: &QueueName) -> Result<Box<dyn MessageSender>, QueueError> {
        debug!(queue = %queue, "Opening sender");
        Ok(Box::new(ServiceBusSender {
            connection: Arc::clone(&self.connection),
            queue: queue.clone(),
        }))
    }

    async fn create_receiver(
        &self,
        queue: &QueueName,
    ) -> Result<Box<dyn MessageReceiver>, QueueError> {
        debug!(queue = %queue, "Opening receiver");
        Ok(Box::new(ServiceBusReceiver {
            connection: Arc::clone(&self.connection),
            queue: queue.clone(),
            peeker: tokio::sync::Mutex::new(None),
        }))
    }

    async fn accept_session(
        &self,
        queue: &QueueName,
        session_id: &SessionId,
    ) -> Result<Box<dyn SessionReceiver>, QueueError> {
        let connection_string = self.connection.amqp("Accepting a named session")?;
        debug!(queue = %queue, session = %session_id, "Accepting session");
        let session = amqp::accept_session(connection_string, queue, Some(session_id)).await?;
        Ok(Box::new(session))
    }

    async fn accept_next_session(
        &self,
        queue: &QueueName,
    ) -> Result<Box<dyn SessionReceiver>, QueueError> {
        let connection_string = self.connection.amqp("Accepting the next session")?;
        debug!(queue = %queue, "Accepting next session");
        let session = amqp::accept_session(connection_string, queue, None).await?;
        Ok(Box::new(session))
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::ServiceBus
    }
}

// ============================================================================
// Sender
// ============================================================================

struct ServiceBusSender {
    connection: Arc<ServiceBusConnection>,
    queue: QueueName,
}

#[async_trait]
impl MessageSender for ServiceBusSender {
    async fn send_message(&self, message: Message) -> Result<(), QueueError> {
        let max_size = ProviderType::ServiceBus.max_message_size();
        if message.body.len() > max_size {
            return Err(QueueError::MessageTooLarge {
                size: message.body.len(),
                max_size,
            });
        }

        let properties = serde_json::to_string(&BrokerProperties::for_message(&message))
            .map_err(SerializationError::from)?;
        let url = self.connection.queue_url(&self.queue, "/messages")?;

        debug!(queue = %self.queue, size = message.body.len(), "Sending message");
        let request = self
            .connection
            .request(Method::POST, &url)?
            .header(BROKER_PROPERTIES, properties)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(message.body);

        let response = self.connection.send(request).await?;
        if !response.status().is_success() {
            return Err(ServiceBusConnection::error_from(response, &self.queue)
                .await
                .into());
        }

        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        debug!(queue = %self.queue, "Closing sender");
        Ok(())
    }
}

// ============================================================================
// Receiver
// ============================================================================

struct ServiceBusReceiver {
    connection: Arc<ServiceBusConnection>,
    queue: QueueName,
    /// Browse link, opened by the first peek
    peeker: tokio::sync::Mutex<Option<AmqpPeeker>>,
}

impl ServiceBusReceiver {
    /// Peek-lock the head message, waiting up to `wait` on the service
    async fn lock_head(&self, wait: Duration) -> Result<Option<ReceivedMessage>, ServiceBusError> {
        let mut url = self.connection.queue_url(&self.queue, "/messages/head")?;
        let timeout = wait.min(self.connection.max_wait).as_secs();
        url.query_pairs_mut()
            .append_pair("timeout", &timeout.to_string());

        debug!(queue = %self.queue, timeout, "Calling receive");
        let request = self.connection.request(Method::POST, &url)?;
        let response = self.connection.send(request).await?;

        match response.status() {
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::CREATED | StatusCode::OK => self.read_locked(response).await.map(Some),
            _ => Err(ServiceBusConnection::error_from(response, &self.queue).await),
        }
    }

    async fn read_locked(&self, response: Response) -> Result<ReceivedMessage, ServiceBusError> {
        let headers = response.headers().clone();
        let properties = BrokerProperties::from_headers(&headers)?;

        let location = headers
            .get(LOCATION)
            .ok_or_else(|| invalid_header(LOCATION.as_str(), "missing lock location"))?
            .to_str()
            .map_err(|e| invalid_header(LOCATION.as_str(), e))?;
        let lock_uri = self
            .connection
            .endpoint
            .join(location)
            .map_err(|e| invalid_header(LOCATION.as_str(), e))?;

        let body = response.bytes().await.map_err(|e| {
            ServiceBusError::ConnectionFailed(format!("Failed to read response body: {}", e))
        })?;

        let message_id = properties
            .message_id
            .as_deref()
            .and_then(|id| id.parse::<MessageId>().ok())
            .unwrap_or_default();
        let session_id = properties
            .session_id
            .as_deref()
            .and_then(|id| SessionId::new(id.to_string()).ok());

        Ok(ReceivedMessage {
            message_id,
            body,
            session_id,
            correlation_id: properties.correlation_id.clone(),
            receipt_handle: ReceiptHandle::new(lock_uri.to_string(), properties.locked_until()),
            delivery_count: properties.delivery_count.unwrap_or(1),
            sequence_number: properties.sequence_number.unwrap_or_default(),
        })
    }

    /// Lock URI of a received message; the receipt handle holds it verbatim
    fn lock_uri_for(&self, message: &ReceivedMessage) -> Result<Url, ServiceBusError> {
        Url::parse(message.receipt_handle.handle())
            .map_err(|e| invalid_header(LOCATION.as_str(), e))
    }
}

#[async_trait]
impl MessageReceiver for ServiceBusReceiver {
    async fn receive_messages(
        &self,
        max_messages: u32,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let mut received = Vec::new();

        // Only the first request waits; the rest drain what is already there
        while received.len() < max_messages as usize {
            let wait = if received.is_empty() {
                wait
            } else {
                Duration::ZERO
            };
            match self.lock_head(wait).await? {
                Some(message) => received.push(message),
                None => break,
            }
        }

        Ok(received)
    }

    async fn peek_messages(&self, max_messages: u32) -> Result<Vec<PeekedMessage>, QueueError> {
        let connection_string = self.connection.amqp("Peeking messages")?;

        let mut slot = self.peeker.lock().await;
        let peeker = match slot.take() {
            Some(peeker) => peeker,
            None => AmqpPeeker::open(connection_string, &self.queue).await?,
        };
        let peeked = peeker.peek(max_messages).await;
        *slot = Some(peeker);
        peeked
    }

    async fn complete_message(&self, message: &ReceivedMessage) -> Result<(), QueueError> {
        let lock_uri = self.lock_uri_for(message)?;

        debug!(message_id = %message.message_id, "Completing message");
        let request = self.connection.request(Method::DELETE, &lock_uri)?;
        let response = self.connection.send(request).await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                debug!(message_id = %message.message_id, "Message lock expired");
                Err(ServiceBusError::LockLost(message.message_id.to_string()).into())
            }
            _ => Err(ServiceBusConnection::error_from(response, &self.queue)
                .await
                .into()),
        }
    }

    async fn close(&self) -> Result<(), QueueError> {
        debug!(queue = %self.queue, "Closing receiver");

        match self.peeker.lock().await.take() {
            Some(peeker) => peeker.close().await,
            None => Ok(()),
        }
    }
}
