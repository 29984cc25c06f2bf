//! Configuration structures for endpoints, sessions and clients.
//!
//! All settings derive serde with `#[serde(default)]`, so a JSON document
//! only needs the fields it overrides.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ClientError;

/// Protocol timing for a [`LocalEndpoint`](crate::LocalEndpoint).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointSettings {
    /// Silence after which a remote endpoint is evicted.
    ///
    /// Advertised to peers during the handshake; a peer adopts the value we
    /// send as the timeout it applies to us.
    pub remote_endpoint_timeout: Duration,

    /// Interval between keep-alives sent to each remote endpoint.
    pub keep_alive_interval: Duration,

    /// How long a processed message id is remembered for de-duplication.
    pub purge_processed_message_delay: Duration,

    /// Interval between `Negotiate` handshakes to a remote endpoint that has
    /// not answered yet.
    pub handshake_retry_interval: Duration,
}

impl Default for EndpointSettings {
    fn default() -> Self {
        Self {
            remote_endpoint_timeout: Duration::from_secs(60),
            keep_alive_interval: Duration::from_secs(1),
            purge_processed_message_delay: Duration::from_secs(30),
            handshake_retry_interval: Duration::from_secs(1),
        }
    }
}

impl EndpointSettings {
    /// Override the remote endpoint timeout.
    pub fn with_remote_endpoint_timeout(mut self, timeout: Duration) -> Self {
        self.remote_endpoint_timeout = timeout;
        self
    }

    /// Override the keep-alive interval.
    pub fn with_keep_alive_interval(mut self, interval: Duration) -> Self {
        self.keep_alive_interval = interval;
        self
    }

    /// Override the de-duplication purge delay.
    pub fn with_purge_processed_message_delay(mut self, delay: Duration) -> Self {
        self.purge_processed_message_delay = delay;
        self
    }

    /// Override the handshake retry interval.
    pub fn with_handshake_retry_interval(mut self, interval: Duration) -> Self {
        self.handshake_retry_interval = interval;
        self
    }
}

/// Connection behaviour of a [`ClientSession`](crate::ClientSession).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSessionSettings {
    /// Interval between connection requests while connecting, and between
    /// session tick callbacks while connected.
    pub session_tick_frequency: Duration,

    /// Maximum number of connection requests before giving up.
    /// None means unlimited retries.
    pub max_connection_attempts: Option<u32>,
}

impl Default for ClientSessionSettings {
    fn default() -> Self {
        Self {
            session_tick_frequency: Duration::from_secs(1),
            max_connection_attempts: None,
        }
    }
}

impl ClientSessionSettings {
    /// Cap the number of connection requests.
    pub fn with_max_connection_attempts(mut self, attempts: u32) -> Self {
        self.max_connection_attempts = Some(attempts);
        self
    }

    /// Override the session tick frequency.
    pub fn with_session_tick_frequency(mut self, frequency: Duration) -> Self {
        self.session_tick_frequency = frequency;
        self
    }
}

/// Settings for a [`Client`](crate::Client).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Name shown to other session participants.
    pub display_name: String,

    /// Machine name reported in client info.
    pub device_name: String,

    /// Server joined by auto-connect and `create_or_join_default_session`.
    pub default_server_name: String,

    /// Session joined (or created) by auto-connect.
    pub default_session_name: String,

    /// Start the auto-connect supervisor when the client is created.
    pub auto_connect: bool,

    /// Poll interval of the auto-connect supervisor.
    pub auto_connect_poll_interval: Duration,

    /// Interval between server discovery broadcasts.
    pub discovery_period: Duration,

    /// A discovered server not heard from within this span is forgotten.
    pub server_timeout: Duration,

    /// How long a connection sequence waits for its server to be discovered.
    pub discovery_timeout: Duration,

    /// Settings applied to the admin and session endpoints.
    pub endpoint: EndpointSettings,

    /// Settings applied to joined sessions.
    pub session: ClientSessionSettings,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            display_name: "client".to_string(),
            device_name: "localhost".to_string(),
            default_server_name: String::new(),
            default_session_name: String::new(),
            auto_connect: false,
            auto_connect_poll_interval: Duration::from_secs(1),
            discovery_period: Duration::from_secs(1),
            server_timeout: Duration::from_secs(5),
            discovery_timeout: Duration::from_secs(10),
            endpoint: EndpointSettings::default(),
            session: ClientSessionSettings::default(),
        }
    }
}

impl ClientSettings {
    /// Parse settings from a JSON document.
    pub fn from_json(json: &str) -> Result<Self, ClientError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Set the display name.
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    /// Set the default server and session used by auto-connect.
    pub fn with_default_session(
        mut self,
        server_name: impl Into<String>,
        session_name: impl Into<String>,
    ) -> Self {
        self.default_server_name = server_name.into();
        self.default_session_name = session_name.into();
        self
    }

    /// Enable or disable auto-connect.
    pub fn with_auto_connect(mut self, enabled: bool) -> Self {
        self.auto_connect = enabled;
        self
    }

    /// Override the endpoint settings.
    pub fn with_endpoint(mut self, endpoint: EndpointSettings) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// Override the session settings.
    pub fn with_session(mut self, session: ClientSessionSettings) -> Self {
        self.session = session;
        self
    }

    /// Override the discovery timeout.
    pub fn with_discovery_timeout(mut self, timeout: Duration) -> Self {
        self.discovery_timeout = timeout;
        self
    }
}
