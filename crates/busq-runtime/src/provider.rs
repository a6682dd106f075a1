//! Provider types and configuration.

use crate::error::ConfigurationError;
use std::fmt;
use std::time::Duration;
use url::Url;

/// Enumeration of supported gateway providers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderType {
    ServiceBus,
    InMemory,
}

impl ProviderType {
    /// Get maximum message size for provider
    pub fn max_message_size(&self) -> usize {
        match self {
            Self::ServiceBus => 256 * 1024,     // 256KB, standard tier
            Self::InMemory => 10 * 1024 * 1024, // 10MB
        }
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ServiceBus => write!(f, "ServiceBus"),
            Self::InMemory => write!(f, "InMemory"),
        }
    }
}

// ============================================================================
// Service Bus
// ============================================================================

/// Credential taken from a Service Bus connection string
#[derive(Clone, PartialEq, Eq)]
pub enum ServiceBusCredential {
    /// Shared access policy name and key, used to mint SAS tokens
    SharedAccessKey { key_name: String, key: String },
    /// Pre-computed `SharedAccessSignature sr=...` token, used verbatim
    SharedAccessSignature(String),
}

impl fmt::Debug for ServiceBusCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SharedAccessKey { key_name, .. } => f
                .debug_struct("SharedAccessKey")
                .field("key_name", key_name)
                .field("key", &"<redacted>")
                .finish(),
            Self::SharedAccessSignature(_) => f
                .debug_tuple("SharedAccessSignature")
                .field(&"<redacted>")
                .finish(),
        }
    }
}

/// Service Bus namespace configuration
#[derive(Clone)]
pub struct ServiceBusConfig {
    /// Base URL of the namespace, always ending with '/'
    pub endpoint: Url,
    pub credential: ServiceBusCredential,
    /// Entity named in the connection string, if any
    pub entity_path: Option<String>,
    /// How long a receive call waits on the service for a message
    pub receive_wait: Duration,
    /// Transport timeout for a single HTTP request
    pub http_timeout: Duration,
    /// Validity of generated SAS tokens
    pub token_ttl: Duration,
    /// Connection string for the AMQP links that browse queues and hold sessions.
    /// Without it those operations are unsupported.
    pub connection_string: Option<String>,
}

impl fmt::Debug for ServiceBusConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceBusConfig")
            .field("endpoint", &self.endpoint.as_str())
            .field("credential", &self.credential)
            .field("entity_path", &self.entity_path)
            .field("receive_wait", &self.receive_wait)
            .field("http_timeout", &self.http_timeout)
            .field("token_ttl", &self.token_ttl)
            .field(
                "connection_string",
                &self.connection_string.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

impl ServiceBusConfig {
    pub const DEFAULT_RECEIVE_WAIT: Duration = Duration::from_secs(60);
    pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(90);
    pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(3600);

    /// Create configuration for an explicit endpoint and credential
    pub fn new(endpoint: Url, credential: ServiceBusCredential) -> Self {
        Self {
            endpoint,
            credential,
            entity_path: None,
            receive_wait: Self::DEFAULT_RECEIVE_WAIT,
            http_timeout: Self::DEFAULT_HTTP_TIMEOUT,
            token_ttl: Self::DEFAULT_TOKEN_TTL,
            connection_string: None,
        }
    }

    /// Parse a connection string of the form
    /// `Endpoint=sb://<ns>.servicebus.windows.net/;SharedAccessKeyName=<name>;SharedAccessKey=<key>`.
    ///
    /// Keys are matched case-insensitively. `EntityPath`, `SharedAccessSignature` and
    /// `UseDevelopmentEmulator` are honoured when present.
    pub fn from_connection_string(connection_string: &str) -> Result<Self, ConfigurationError> {
        let mut endpoint = None;
        let mut key_name = None;
        let mut key = None;
        let mut signature = None;
        let mut entity_path = None;
        let mut emulator = false;

        for segment in connection_string.split(';') {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }

            let (name, value) = segment.split_once('=').ok_or_else(|| ConfigurationError::Parsing {
                message: format!("connection string segment '{}' is not a key=value pair", name_only(segment)),
            })?;
            let value = value.trim().to_string();

            match name.trim().to_ascii_lowercase().as_str() {
                "endpoint" => endpoint = Some(value),
                "sharedaccesskeyname" => key_name = Some(value),
                "sharedaccesskey" => key = Some(value),
                "sharedaccesssignature" => signature = Some(value),
                "entitypath" => entity_path = Some(value),
                "usedevelopmentemulator" => emulator = value.eq_ignore_ascii_case("true"),
                _ => {}
            }
        }

        let endpoint = endpoint.ok_or_else(|| ConfigurationError::Missing {
            key: "Endpoint".to_string(),
        })?;
        let endpoint = normalize_endpoint(&endpoint, emulator)?;

        let credential = match (signature, key_name, key) {
            (Some(token), _, _) => ServiceBusCredential::SharedAccessSignature(token),
            (None, Some(key_name), Some(key)) if !key_name.is_empty() && !key.is_empty() => {
                ServiceBusCredential::SharedAccessKey { key_name, key }
            }
            (None, None, _) => {
                return Err(ConfigurationError::Missing {
                    key: "SharedAccessKeyName".to_string(),
                })
            }
            (None, _, _) => {
                return Err(ConfigurationError::Missing {
                    key: "SharedAccessKey".to_string(),
                })
            }
        };

        let mut config = Self::new(endpoint, credential);
        config.entity_path = entity_path.filter(|path| !path.is_empty());
        config.connection_string = Some(connection_string.trim().to_string());
        Ok(config)
    }

    /// Set how long receive calls wait for a message
    pub fn with_receive_wait(mut self, wait: Duration) -> Self {
        self.receive_wait = wait;
        self
    }

    /// Set the per-request transport timeout
    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    /// Set the validity of generated SAS tokens
    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    /// Host name of the namespace, used in logs
    pub fn namespace(&self) -> &str {
        self.endpoint.host_str().unwrap_or_default()
    }
}

/// Keep keys out of error messages
fn name_only(segment: &str) -> &str {
    segment.split('=').next().unwrap_or_default()
}

/// Map `sb://host[:port]/` onto the HTTP(S) base URL of the namespace
fn normalize_endpoint(raw: &str, emulator: bool) -> Result<Url, ConfigurationError> {
    let parsed = Url::parse(raw).map_err(|e| ConfigurationError::Invalid {
        message: format!("Endpoint '{}' is not a valid URL: {}", raw, e),
    })?;

    let host = parsed.host_str().filter(|h| !h.is_empty()).ok_or_else(|| {
        ConfigurationError::Invalid {
            message: format!("Endpoint '{}' has no host", raw),
        }
    })?;

    let scheme = match parsed.scheme() {
        "sb" | "amqps" if emulator => "http",
        "sb" | "amqps" | "https" => "https",
        "http" => "http",
        other => {
            return Err(ConfigurationError::Invalid {
                message: format!("Endpoint scheme '{}' is not supported", other),
            })
        }
    };

    let base = match parsed.port() {
        Some(port) => format!("{}://{}:{}/", scheme, host, port),
        None => format!("{}://{}/", scheme, host),
    };

    Url::parse(&base).map_err(|e| ConfigurationError::Invalid {
        message: format!("Endpoint '{}' cannot be used: {}", raw, e),
    })
}

// ============================================================================
// In-memory
// ============================================================================

/// In-memory provider configuration
#[derive(Debug, Clone)]
pub struct InMemoryConfig {
    /// How long a received message stays locked before it is redelivered
    pub lock_duration: Duration,
    /// How long `accept_next_session` waits before reporting no session
    pub session_wait: Duration,
    /// Polling interval while waiting for messages or sessions
    pub poll_interval: Duration,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            lock_duration: Duration::from_secs(30),
            session_wait: Duration::from_secs(1),
            poll_interval: Duration::from_millis(10),
        }
    }
}

#[cfg(test)]
#[path = "provider_tests.rs"]
mod tests;
