//! Scripted chat server for async tests.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::config::{ClientConfig, KeepAlive, ReconnectPolicy};

pub const SERVER_HEADER: &str = "<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' from='chat.example.com' id='s1' version='1.0'>";
pub const PLAIN_FEATURES: &str = "<stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms></stream:features>";
pub const BIND_FEATURES: &str = "<stream:features><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'/><session xmlns='urn:ietf:params:xml:ns:xmpp-session'/></stream:features>";

const WAIT: Duration = Duration::from_secs(5);

pub struct FakeServer {
    listener: TcpListener,
    port: u16,
}

impl FakeServer {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        Self { listener, port }
    }

    pub fn uri(&self) -> String {
        format!("tcp://127.0.0.1:{}", self.port)
    }

    /// Client configuration pointed at this server, with test-sized timers.
    pub fn config(&self) -> ClientConfig {
        let mut config = ClientConfig::new("eve", "hunter2");
        config.host = "chat.example.com".to_string();
        config.conference_host = "conf.example.com".to_string();
        config.server = Some(self.uri());
        config.keep_alive = KeepAlive::Whitespace;
        config.keep_alive_interval = Duration::from_secs(3600);
        config.liveness_timeout = Duration::from_secs(3600);
        config.watchdog_interval = Duration::from_secs(3600);
        config.connect_timeout = Duration::from_secs(2);
        config.handshake_timeout = Duration::from_secs(5);
        config.reconnect = ReconnectPolicy {
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(100),
            max_attempts: Some(5),
        };
        config
    }

    pub async fn accept(&self) -> ServerConn {
        let (socket, _) = tokio::time::timeout(WAIT, self.listener.accept())
            .await
            .expect("client did not connect")
            .unwrap();
        ServerConn {
            socket,
            buffer: String::new(),
        }
    }
}

pub struct ServerConn {
    socket: TcpStream,
    buffer: String,
}

impl ServerConn {
    /// Read until `needle` arrives; returns everything up to and including it.
    pub async fn expect(&mut self, needle: &str) -> String {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(pos) = self.buffer.find(needle) {
                let end = pos + needle.len();
                return self.buffer.drain(..end).collect();
            }
            let n = tokio::time::timeout(WAIT, self.socket.read(&mut chunk))
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {:?}; got {:?}", needle, self.buffer))
                .unwrap();
            assert!(n > 0, "client closed while waiting for {:?}", needle);
            self.buffer.push_str(&String::from_utf8_lossy(&chunk[..n]));
        }
    }

    /// Whether nothing containing `needle` arrives within `window`.
    pub async fn stays_silent(&mut self, needle: &str, window: Duration) -> bool {
        let mut chunk = [0u8; 4096];
        let deadline = tokio::time::Instant::now() + window;
        loop {
            if self.buffer.contains(needle) {
                return false;
            }
            match tokio::time::timeout_at(deadline, self.socket.read(&mut chunk)).await {
                Err(_) => return true,
                Ok(Ok(0)) | Ok(Err(_)) => return true,
                Ok(Ok(n)) => self.buffer.push_str(&String::from_utf8_lossy(&chunk[..n])),
            }
        }
    }

    pub async fn send(&mut self, data: &str) {
        self.socket.write_all(data.as_bytes()).await.unwrap();
        self.socket.flush().await.unwrap();
    }

    /// Answer a SASL PLAIN login with bind and session.
    pub async fn complete_sasl_handshake(&mut self) {
        self.expect("<stream:stream").await;
        self.send(SERVER_HEADER).await;
        self.send(PLAIN_FEATURES).await;
        self.expect("</auth>").await;
        self.send("<success xmlns='urn:ietf:params:xml:ns:xmpp-sasl'/>").await;
        self.expect("<stream:stream").await;
        self.send(SERVER_HEADER).await;
        self.send(BIND_FEATURES).await;
        let bind = self.expect("<bind").await;
        let bind_id = last_id(&bind);
        self.send(&format!(
            "<iq type='result' id='{}'><bind xmlns='urn:ietf:params:xml:ns:xmpp-bind'><jid>eve@chat.example.com/bot</jid></bind></iq>",
            bind_id
        ))
        .await;
        let session = self.expect("<session").await;
        self.send(&format!("<iq type='result' id='{}'/>", last_id(&session))).await;
    }
}

/// The value of the last `id='...'` attribute in `text`.
pub fn last_id(text: &str) -> String {
    let start = text.rfind("id='").expect("no id attribute") + 4;
    let len = text[start..].find('\'').expect("unterminated id");
    text[start..start + len].to_string()
}
