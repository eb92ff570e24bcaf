//! Client configuration.
//!
//! Everything the session needs is carried by [`ClientConfig`], built either
//! directly or from `HIPCHAT_*` environment variables.

use std::time::Duration;

use crate::error::{Error, Result};

pub const DEFAULT_HOST: &str = "chat.hipchat.com";
pub const DEFAULT_CONFERENCE_HOST: &str = "conf.hipchat.com";
pub const DEFAULT_RESOURCE: &str = "bot";

/// Which authentication exchange the server expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMode {
    /// SASL PLAIN, then stream restart, resource bind and session start.
    #[default]
    Sasl,
    /// Single `jabber:iq:auth` request carrying username, password and resource.
    IqAuth,
}

impl std::str::FromStr for AuthMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sasl" | "plain" => Ok(AuthMode::Sasl),
            "iq" | "iq-auth" | "iqauth" | "legacy" => Ok(AuthMode::IqAuth),
            other => Err(Error::Config(format!("unknown auth mode '{}'", other))),
        }
    }
}

/// What the supervisor sends to keep an idle session open.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum KeepAlive {
    /// A single whitespace byte.
    Whitespace,
    /// An XMPP ping; the reply counts as inbound activity.
    #[default]
    Ping,
    /// Re-join a room with a one-stanza backlog.
    RoomRejoin { room: String, nickname: String },
}

/// Reconnect backoff: `initial_delay` doubled per attempt up to `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            max_attempts: Some(10),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the given attempt (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }

    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt <= max)
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub username: String,
    pub password: String,
    pub resource: String,
    /// Chat domain; the JID is `username@host`.
    pub host: String,
    pub conference_host: String,
    /// Explicit server (`tcp://h:p`, `tls://h:p`, `h:p`), or `None` for SRV on `host`.
    pub server: Option<String>,
    pub auth_mode: AuthMode,
    pub tls_insecure: bool,
    pub keep_alive: KeepAlive,
    pub keep_alive_interval: Duration,
    pub liveness_timeout: Duration,
    pub watchdog_interval: Duration,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub message_capacity: usize,
    pub room_capacity: usize,
    pub user_capacity: usize,
}

impl ClientConfig {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            resource: DEFAULT_RESOURCE.to_string(),
            host: DEFAULT_HOST.to_string(),
            conference_host: DEFAULT_CONFERENCE_HOST.to_string(),
            server: None,
            auth_mode: AuthMode::default(),
            tls_insecure: false,
            keep_alive: KeepAlive::default(),
            keep_alive_interval: Duration::from_secs(120),
            liveness_timeout: Duration::from_secs(300),
            watchdog_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(15),
            handshake_timeout: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
            message_capacity: 20,
            room_capacity: 10,
            user_capacity: 10,
        }
    }

    /// Build from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (`HIPCHAT_*` names).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let username = get("HIPCHAT_USER").ok_or_else(|| Error::Config("HIPCHAT_USER is not set".into()))?;
        let password =
            get("HIPCHAT_PASSWORD").ok_or_else(|| Error::Config("HIPCHAT_PASSWORD is not set".into()))?;

        let mut config = Self::new(username, password);
        if let Some(resource) = get("HIPCHAT_RESOURCE") {
            config.resource = resource;
        }
        if let Some(host) = get("HIPCHAT_HOST") {
            config.host = host;
        }
        if let Some(conference_host) = get("HIPCHAT_CONF_HOST") {
            config.conference_host = conference_host;
        }
        config.server = get("HIPCHAT_SERVER");
        if let Some(mode) = get("HIPCHAT_AUTH_MODE") {
            config.auth_mode = mode.parse()?;
        }
        Ok(config)
    }

    pub fn jid(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }
}
