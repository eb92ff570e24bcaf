//! Application-facing chat client.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use crate::config::ClientConfig;
use crate::dispatcher::{rooms_from, users_from, Dispatcher, IqReply};
use crate::error::{Error, Result};
use crate::model::{Attachment, Message, Room, User};
use crate::supervisor::{self, Session, SessionEvent};
use crate::xmpp::{init_crypto_provider, stanza, stanza::ns};

/// Streams of inbound events, handed out once by [`Client::connect`].
pub struct Events {
    pub messages: mpsc::Receiver<Message>,
    /// Unsolicited room lists: invitations and uncorrelated directory results.
    pub rooms: mpsc::Receiver<Vec<Room>>,
    /// Unsolicited roster results.
    pub users: mpsc::Receiver<Vec<User>>,
    pub session: broadcast::Receiver<SessionEvent>,
}

/// Handle to a supervised chat session. Clones share the session.
#[derive(Clone)]
pub struct Client {
    session: Arc<Session>,
}

impl Client {
    /// Connect, authenticate and start the supervisor.
    ///
    /// Errors from this first connection are returned directly; later
    /// connection losses are handled by reconnecting in the background.
    pub async fn connect(config: ClientConfig) -> Result<(Client, Events)> {
        init_crypto_provider();

        let (message_tx, messages) = mpsc::channel(config.message_capacity.max(1));
        let (room_tx, rooms) = mpsc::channel(config.room_capacity.max(1));
        let (user_tx, users) = mpsc::channel(config.user_capacity.max(1));

        let session = Arc::new(Session::new(config));
        let session_events = session.subscribe();
        let reader = session.establish().await?;

        let dispatcher = Dispatcher::new(
            message_tx,
            room_tx,
            user_tx,
            session.queries.clone(),
            session.history.clone(),
        );
        tokio::spawn(supervisor::run(session.clone(), reader, dispatcher));
        info!(jid = %session.jid, "Client connected");

        Ok((
            Client { session },
            Events {
                messages,
                rooms,
                users,
                session: session_events,
            },
        ))
    }

    pub fn jid(&self) -> &str {
        &self.session.jid
    }

    /// Broadcast presence with the given `show` value (`chat`, `away`, ...).
    pub async fn status(&self, show: &str) -> Result<()> {
        self.session.remember_presence(show);
        self.session.send(&stanza::presence(&self.session.jid, show)).await
    }

    /// Join `room` as `nickname`, asking for `history` backlog messages.
    pub async fn join(&self, room: &str, nickname: &str, history: u32) -> Result<()> {
        let to = format!("{}/{}", room, nickname);
        self.session
            .send(&stanza::muc_join(&stanza::new_id(), &to, &self.session.jid, history))
            .await?;
        self.session.remember_join(room, nickname);
        Ok(())
    }

    pub async fn leave(&self, room: &str, nickname: &str) -> Result<()> {
        self.session.forget_join(room, nickname);
        let to = format!("{}/{}", room, nickname);
        self.session
            .send(&stanza::muc_leave(&stanza::new_id(), &self.session.jid, &to))
            .await
    }

    /// Send a group-chat message, with inline images when `attachments` is non-empty.
    pub async fn say(&self, room: &str, body: &str, attachments: &[Attachment]) -> Result<()> {
        let from = format!("{}/{}", self.session.jid, self.session.config.resource);
        self.session
            .send(&stanza::groupchat(&from, &stanza::new_id(), room, body, attachments))
            .await
    }

    /// Send a request and wait for the reply correlated by its id.
    async fn request(&self, id: &str, data: &str) -> Result<IqReply> {
        let reply = self.session.queries.register(id);
        if let Err(e) = self.session.send(data).await {
            self.session.queries.cancel(id);
            return Err(e);
        }
        reply.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Room directory of the conference service.
    pub async fn rooms(&self) -> Result<Vec<Room>> {
        let id = stanza::new_id();
        let request = stanza::iq_query(
            &self.session.jid,
            &self.session.config.conference_host,
            &id,
            ns::DISCO_ITEMS,
        );
        let reply = self.request(&id, &request).await?;
        Ok(reply.map(|q| rooms_from(&q)).unwrap_or_default())
    }

    /// Roster of the chat service.
    pub async fn users(&self) -> Result<Vec<User>> {
        let id = stanza::new_id();
        let request = stanza::iq_query(&self.session.jid, &self.session.config.host, &id, ns::IQ_ROSTER);
        let reply = self.request(&id, &request).await?;
        Ok(reply.map(|q| users_from(&q)).unwrap_or_default())
    }

    /// Fetch up to `limit` archived messages exchanged with `with`.
    ///
    /// Concurrent calls are served one at a time, and a call dropped before
    /// completion still holds off the next until its page has arrived. An
    /// error reply from the server fails the call with [`Error::Query`].
    pub async fn load_history(
        &self,
        with: &str,
        start: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<Message>> {
        let id = stanza::new_id();
        let request = stanza::archive_query(&id, with, start, limit);
        let page = self
            .session
            .history
            .fetch(&id, || self.session.send(&request))
            .await?;
        debug!(with = %with, count = page.len(), "History loaded");
        Ok(page)
    }

    /// Round-trip a ping to the server.
    pub async fn ping(&self) -> Result<()> {
        let id = stanza::new_id();
        self.request(&id, &stanza::ping(&self.session.jid, &id)).await?;
        Ok(())
    }

    /// End the stream and stop reconnecting. Event streams close afterwards.
    pub async fn close(&self) {
        self.session.close().await;
    }

    pub fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.session.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{last_id, FakeServer, PLAIN_FEATURES, SERVER_HEADER};
    const ARCHIVE_END: &str = "<message to='eve@chat.example.com'><fin xmlns='urn:xmpp:mam:0'/></message>";
    use std::time::Duration;

    async fn connected(server: &FakeServer, config: ClientConfig) -> (Client, Events, crate::test_support::ServerConn) {
        let (result, conn) = tokio::join!(Client::connect(config), async {
            let mut conn = server.accept().await;
            conn.complete_sasl_handshake().await;
            conn
        });
        let (client, events) = result.unwrap();
        (client, events, conn)
    }

    // --- connect tests ---

    #[tokio::test]
    async fn test_connect_and_exchange_messages() {
        let server = FakeServer::bind().await;
        let (client, mut events, mut conn) = connected(&server, server.config()).await;
        assert_eq!(client.jid(), "eve@chat.example.com");

        client.status("chat").await.unwrap();
        conn.expect("<show>chat</show></presence>").await;

        client.join("room@conf.example.com", "alice", 5).await.unwrap();
        let join = conn.expect("</presence>").await;
        assert!(join.contains("to='room@conf.example.com/alice'"));
        assert!(join.contains("<history maxstanzas='5'/>"));

        client.say("room@conf.example.com", "a < b", &[]).await.unwrap();
        let sent = conn.expect("</message>").await;
        assert!(sent.contains("from='eve@chat.example.com/bot'"));
        assert!(sent.contains("<body>a &lt; b</body>"));

        conn.send("<message from='room@conf.example.com/Bob' to='eve@chat.example.com' type='groupchat' id='m9'><body>hi there</body></message>")
            .await;
        let message = tokio::time::timeout(Duration::from_secs(2), events.messages.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.body, "hi there");
        assert_eq!(message.from, "room@conf.example.com/Bob");

        client.close().await;
        conn.expect("</stream:stream>").await;
        assert!(tokio::time::timeout(Duration::from_secs(2), events.messages.recv())
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_connect_reports_auth_failure() {
        let server = FakeServer::bind().await;
        let (result, _conn) = tokio::join!(Client::connect(server.config()), async {
            let mut conn = server.accept().await;
            conn.expect("<stream:stream").await;
            conn.send(SERVER_HEADER).await;
            conn.send(PLAIN_FEATURES).await;
            conn.expect("</auth>").await;
            conn.send("<failure xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><not-authorized/></failure>")
                .await;
            conn
        });
        assert!(matches!(result, Err(Error::Auth(ref c)) if c == "not-authorized"));
    }

    #[tokio::test]
    async fn test_connect_unreachable_server() {
        let server = FakeServer::bind().await;
        let config = server.config();
        drop(server);
        assert!(matches!(Client::connect(config).await, Err(Error::Connect(_))));
    }

    // --- query tests ---

    #[tokio::test]
    async fn test_rooms_and_users_are_correlated() {
        let server = FakeServer::bind().await;
        let (client, mut events, mut conn) = connected(&server, server.config()).await;

        let rooms = tokio::spawn({
            let client = client.clone();
            async move { client.rooms().await }
        });
        let request = conn.expect("</iq>").await;
        assert!(request.contains("to='conf.example.com'"));
        assert!(request.contains("http://jabber.org/protocol/disco#items"));
        let rooms_id = last_id(&request);

        let users = tokio::spawn({
            let client = client.clone();
            async move { client.users().await }
        });
        let request = conn.expect("</iq>").await;
        assert!(request.contains("jabber:iq:roster"));
        let users_id = last_id(&request);

        // Replies arrive out of order.
        conn.send(&format!(
            "<iq type='result' id='{}'><query xmlns='jabber:iq:roster'><item jid='1_1@chat.example.com' name='Alice A' mention_name='alice'/></query></iq>",
            users_id
        ))
        .await;
        conn.send(&format!(
            "<iq type='result' id='{}'><query xmlns='http://jabber.org/protocol/disco#items'><item jid='1_ops@conf.example.com' name='Ops'><x xmlns='http://hipchat.com/protocol/muc#room'><topic>Deploys</topic><owner>1_1@chat.example.com</owner></x></item></query></iq>",
            rooms_id
        ))
        .await;

        let users = users.await.unwrap().unwrap();
        assert_eq!(users[0].mention_name, "alice");
        let rooms = rooms.await.unwrap().unwrap();
        assert_eq!(rooms[0].display_name, "Ops");
        assert_eq!(rooms[0].topic, "Deploys");
        assert!(events.rooms.try_recv().is_err());
        assert!(events.users.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_pending_query_fails_on_close() {
        let server = FakeServer::bind().await;
        let (client, _events, mut conn) = connected(&server, server.config()).await;

        let rooms = tokio::spawn({
            let client = client.clone();
            async move { client.rooms().await }
        });
        conn.expect("</iq>").await;
        client.close().await;
        assert!(matches!(rooms.await.unwrap(), Err(Error::ConnectionClosed)));
        assert!(matches!(client.ping().await, Err(Error::NotConnected)));
    }

    #[tokio::test]
    async fn test_load_history() {
        let server = FakeServer::bind().await;
        let (client, _events, mut conn) = connected(&server, server.config()).await;

        let history = tokio::spawn({
            let client = client.clone();
            async move { client.load_history("room@conf.example.com", None, 50).await }
        });
        let request = conn.expect("</iq>").await;
        assert!(request.contains("<max>50</max>"));
        assert!(request.contains("<value>room@conf.example.com</value>"));

        for (id, body) in [("a1", "first"), ("a2", "second")] {
            conn.send(&format!(
                "<message to='eve@chat.example.com'><result xmlns='urn:xmpp:mam:0' id='{}'><forwarded xmlns='urn:xmpp:forward:0'><delay xmlns='urn:xmpp:delay' stamp='2014-01-02T03:04:05Z'/><message from='room@conf.example.com/Bob' id='{}'><body>{}</body></message></forwarded></result></message>",
                id, id, body
            ))
            .await;
        }
        conn.send(ARCHIVE_END).await;

        let page = tokio::time::timeout(Duration::from_secs(2), history)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let bodies: Vec<&str> = page.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_load_history_error_reply() {
        let server = FakeServer::bind().await;
        let (client, _events, mut conn) = connected(&server, server.config()).await;

        let history = tokio::spawn({
            let client = client.clone();
            async move { client.load_history("room@conf.example.com", None, 10).await }
        });
        let request = conn.expect("</iq>").await;
        conn.send(&format!(
            "<iq type='error' id='{}'><error type='cancel'><service-unavailable xmlns='urn:ietf:params:xml:ns:xmpp-stanzas'/></error></iq>",
            last_id(&request)
        ))
        .await;

        let result = tokio::time::timeout(Duration::from_secs(2), history).await.unwrap().unwrap();
        assert!(matches!(result, Err(Error::Query(ref c)) if c == "service-unavailable"));

        // The next fetch is not held back.
        let next = tokio::spawn({
            let client = client.clone();
            async move { client.load_history("room@conf.example.com", None, 10).await }
        });
        conn.expect("</iq>").await;
        conn.send(ARCHIVE_END).await;
        let page = tokio::time::timeout(Duration::from_secs(2), next).await.unwrap().unwrap();
        assert!(page.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_history_fetch_holds_next_query() {
        let server = FakeServer::bind().await;
        let (client, _events, mut conn) = connected(&server, server.config()).await;

        let abandoned = tokio::time::timeout(
            Duration::from_millis(100),
            client.load_history("room@conf.example.com", None, 10),
        );
        let (abandoned, request) = tokio::join!(abandoned, conn.expect("</iq>"));
        assert!(abandoned.is_err());
        assert!(request.contains("urn:xmpp:mam:0"));

        let next = tokio::spawn({
            let client = client.clone();
            async move { client.load_history("room@conf.example.com", None, 10).await }
        });
        assert!(conn.stays_silent("urn:xmpp:mam:0", Duration::from_millis(200)).await);

        // The abandoned page completes, then the waiting query goes out.
        conn.send("<message to='eve@chat.example.com'><result xmlns='urn:xmpp:mam:0' id='o1'><forwarded xmlns='urn:xmpp:forward:0'><message from='room@conf.example.com/Bob' id='o1'><body>old</body></message></forwarded></result></message>")
            .await;
        conn.send(ARCHIVE_END).await;
        conn.expect("</iq>").await;
        conn.send("<message to='eve@chat.example.com'><result xmlns='urn:xmpp:mam:0' id='n1'><forwarded xmlns='urn:xmpp:forward:0'><message from='room@conf.example.com/Bob' id='n1'><body>new</body></message></forwarded></result></message>")
            .await;
        conn.send(ARCHIVE_END).await;

        let page = tokio::time::timeout(Duration::from_secs(2), next)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let bodies: Vec<&str> = page.iter().map(|m| m.body.as_str()).collect();
        assert_eq!(bodies, vec!["new"]);
    }

    // --- supervision tests ---

    #[tokio::test]
    async fn test_liveness_timeout_reconnects_and_restores() {
        let server = FakeServer::bind().await;
        let mut config = server.config();
        config.liveness_timeout = Duration::from_millis(500);
        config.watchdog_interval = Duration::from_millis(25);
        let (client, mut events, mut first) = connected(&server, config).await;

        client.status("chat").await.unwrap();
        client.join("room@conf.example.com", "alice", 5).await.unwrap();
        first.expect("<history maxstanzas='5'/>").await;

        // The first server goes silent; the watchdog forces a fresh dial.
        let mut second = server.accept().await;
        second.complete_sasl_handshake().await;
        second.expect("<show>chat</show></presence>").await;
        let rejoin = second.expect("</presence>").await;
        assert!(rejoin.contains("to='room@conf.example.com/alice'"));
        assert!(rejoin.contains("<history maxstanzas='0'/>"));

        let event = tokio::time::timeout(Duration::from_secs(2), events.session.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, SessionEvent::Reconnected);

        second
            .send("<message from='room@conf.example.com/Bob' type='groupchat'><body>welcome back</body></message>")
            .await;
        let message = tokio::time::timeout(Duration::from_secs(2), events.messages.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.body, "welcome back");
        client.close().await;
    }
}
