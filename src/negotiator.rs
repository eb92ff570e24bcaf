//! Handshake state machine: from a freshly dialed stream to an authenticated, bound session.
//!
//! [`Negotiator`] is pure: it consumes each top-level element and returns the
//! [`Step`]s to perform. [`negotiate`] drives it over a [`Connection`],
//! performing sends and the in-place TLS upgrade.

use tracing::{debug, info, warn};

use crate::config::{AuthMode, ClientConfig};
use crate::error::{Error, Result};
use crate::xmpp::element::Element;
use crate::xmpp::stanza::{self, ns, Features};
use crate::xmpp::Connection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Connecting,
    /// Stream header sent, waiting for features.
    StreamOpened,
    TlsRequested,
    /// Credentials sent.
    Authenticating,
    /// SASL accepted; stream restarted, bind and session requested.
    Binding,
    Ready,
    Failed,
}

/// Action requested by the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Send(String),
    UpgradeTls,
}

pub struct Negotiator {
    state: State,
    mode: AuthMode,
    jid: String,
    host: String,
    username: String,
    password: String,
    resource: String,
    encrypted: bool,
    /// Id of the IQ whose result completes the handshake.
    final_id: Option<String>,
}

impl Negotiator {
    pub fn new(config: &ClientConfig) -> Self {
        Self {
            state: State::Connecting,
            mode: config.auth_mode,
            jid: config.jid(),
            host: config.host.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            resource: config.resource.clone(),
            encrypted: false,
            final_id: None,
        }
    }

    /// Mark the stream as already encrypted (direct TLS endpoint).
    pub fn with_encrypted(mut self, encrypted: bool) -> Self {
        self.encrypted = encrypted;
        self
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == State::Ready
    }

    pub fn start(&mut self) -> Vec<Step> {
        self.state = State::StreamOpened;
        vec![Step::Send(stanza::stream_open(&self.jid, &self.host))]
    }

    fn fail(&mut self, error: Error) -> Result<Vec<Step>> {
        warn!(error = %error, state = ?self.state, "Handshake failed");
        self.state = State::Failed;
        Err(error)
    }

    pub fn on_element(&mut self, el: &Element) -> Result<Vec<Step>> {
        if matches!(self.state, State::Ready | State::Failed) {
            return Ok(Vec::new());
        }

        if el.is("stream", ns::STREAM) {
            debug!(id = el.attr("id").unwrap_or(""), "Stream opened by server");
            return Ok(Vec::new());
        }

        if el.is("features", ns::STREAM) {
            return self.on_features(&Features::from_element(el));
        }

        if el.is("proceed", ns::TLS) && self.state == State::TlsRequested {
            self.encrypted = true;
            self.state = State::StreamOpened;
            return Ok(vec![
                Step::UpgradeTls,
                Step::Send(stanza::stream_open(&self.jid, &self.host)),
            ]);
        }

        if el.is("failure", ns::TLS) {
            return self.fail(Error::Tls("server refused STARTTLS".to_string()));
        }

        if el.is("success", ns::SASL) && self.state == State::Authenticating {
            let bind_id = stanza::new_id();
            let session_id = stanza::new_id();
            self.final_id = Some(session_id.clone());
            self.state = State::Binding;
            return Ok(vec![
                Step::Send(stanza::stream_open(&self.jid, &self.host)),
                Step::Send(stanza::bind(&bind_id, &self.resource)),
                Step::Send(stanza::session(&session_id)),
            ]);
        }

        if el.is("failure", ns::SASL) {
            let condition = el
                .children()
                .next()
                .map(|c| c.name().to_string())
                .unwrap_or_else(|| "could not authenticate".to_string());
            return self.fail(Error::Auth(condition));
        }

        if el.is("error", ns::STREAM) {
            let condition = el.children().next().map(|c| c.name().to_string()).unwrap_or_default();
            return self.fail(Error::Protocol(format!("stream error: {}", condition)));
        }

        if el.name() == "iq" {
            return self.on_iq(el);
        }

        debug!(name = el.name(), ns = el.ns(), state = ?self.state, "Ignoring element during handshake");
        Ok(Vec::new())
    }

    fn on_features(&mut self, features: &Features) -> Result<Vec<Step>> {
        if self.state != State::StreamOpened {
            debug!(state = ?self.state, "Ignoring stream features");
            return Ok(Vec::new());
        }

        if features.starttls_required && !self.encrypted {
            self.state = State::TlsRequested;
            return Ok(vec![Step::Send(stanza::start_tls())]);
        }

        if features.offers_plain() {
            let id = stanza::new_id();
            self.state = State::Authenticating;
            let request = match self.mode {
                AuthMode::Sasl => stanza::sasl_auth(&self.username, &self.password),
                AuthMode::IqAuth => {
                    self.final_id = Some(id.clone());
                    stanza::iq_auth(&id, &self.username, &self.password, &self.resource)
                }
            };
            return Ok(vec![Step::Send(request)]);
        }

        if !features.mechanisms.is_empty() {
            return self.fail(Error::Auth(format!(
                "no supported mechanism (offered: {})",
                features.mechanisms.join(", ")
            )));
        }

        debug!("Stream features without mechanisms, waiting");
        Ok(Vec::new())
    }

    fn on_iq(&mut self, iq: &Element) -> Result<Vec<Step>> {
        match iq.attr("type") {
            Some("result") => {
                let id = iq.attr("id").unwrap_or_default();
                if self.final_id.as_deref() == Some(id) {
                    self.state = State::Ready;
                    info!(jid = %self.jid, "Session ready");
                } else {
                    debug!(id, "Intermediate handshake result");
                }
                Ok(Vec::new())
            }
            Some("error") => {
                let condition = iq
                    .find_child("error")
                    .and_then(|e| e.children().next())
                    .map(|c| c.name().to_string())
                    .unwrap_or_else(|| "could not authenticate".to_string());
                self.fail(Error::Auth(condition))
            }
            _ => {
                debug!(id = iq.attr("id").unwrap_or(""), "Ignoring server request during handshake");
                Ok(Vec::new())
            }
        }
    }
}

/// Run the handshake over `conn`, bounded by `config.handshake_timeout`.
pub async fn negotiate(conn: Connection, config: &ClientConfig) -> Result<Connection> {
    tokio::time::timeout(config.handshake_timeout, drive(conn, config))
        .await
        .map_err(|_| {
            Error::Timeout(format!(
                "handshake did not complete within {}s",
                config.handshake_timeout.as_secs()
            ))
        })?
}

async fn drive(mut conn: Connection, config: &ClientConfig) -> Result<Connection> {
    let mut negotiator = Negotiator::new(config).with_encrypted(conn.is_encrypted());
    let mut steps = negotiator.start();

    loop {
        for step in steps {
            match step {
                Step::Send(data) => conn.send(&data).await?,
                Step::UpgradeTls => conn = conn.upgrade_to_tls().await?,
            }
        }
        if negotiator.is_ready() {
            return Ok(conn);
        }
        let element = conn.next_element().await?;
        steps = negotiator.on_element(&element)?;
    }
}
