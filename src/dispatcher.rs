//! Inbound element classification and routing.
//!
//! The reader task feeds every top-level element to [`Dispatcher::dispatch`].
//! Correlated IQ replies go to the waiting caller through the
//! [`QueryRegistry`]; messages go to the live channel or the archive
//! accumulator; unsolicited directory and roster lists go to the room and
//! user channels. Nothing here ends the read loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::attachment::extract_attachments;
use crate::error::{Error, Result};
use crate::history::HistoryAggregator;
use crate::model::{parse_stamp, Message, Room, User};
use crate::xmpp::element::Element;
use crate::xmpp::stanza::{ns, IncomingMessage, Query};

/// Reply delivered to a correlated IQ waiter: the query payload, if any.
pub type IqReply = Option<Query>;

/// What an inbound element means to the session.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// IQ result or server push; `query` is its payload when present.
    Iq { id: String, query: Option<Query> },
    IqError { id: String, condition: String },
    Live(Message),
    Invite(Room),
    ArchiveItem(Message),
    ArchiveEnd,
    Ignored,
}

/// Pending correlated IQs, keyed by request id.
#[derive(Default)]
pub struct QueryRegistry {
    pending: Mutex<HashMap<String, oneshot::Sender<Result<IqReply>>>>,
}

impl QueryRegistry {
    fn pending(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<Result<IqReply>>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a waiter before the request with `id` is sent.
    pub fn register(&self, id: &str) -> oneshot::Receiver<Result<IqReply>> {
        let (tx, rx) = oneshot::channel();
        self.pending().insert(id.to_string(), tx);
        rx
    }

    pub fn cancel(&self, id: &str) {
        self.pending().remove(id);
    }

    /// Deliver `reply` to the waiter for `id`. Returns the reply when nobody waits.
    pub fn resolve(&self, id: &str, reply: Result<IqReply>) -> Option<Result<IqReply>> {
        match self.pending().remove(id) {
            Some(waiter) => {
                let _ = waiter.send(reply);
                None
            }
            None => Some(reply),
        }
    }

    /// Fail every waiter (connection lost).
    pub fn abort_all(&self) {
        let drained: Vec<_> = self.pending().drain().collect();
        if !drained.is_empty() {
            debug!(count = drained.len(), "Aborting pending queries");
        }
        for (_, waiter) in drained {
            let _ = waiter.send(Err(Error::ConnectionClosed));
        }
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.pending().is_empty()
    }
}

pub fn rooms_from(query: &Query) -> Vec<Room> {
    query
        .items
        .iter()
        .map(|item| Room {
            id: item.jid.clone(),
            display_name: item.name.clone(),
            owner: item.owner.clone(),
            topic: item.topic.clone(),
        })
        .collect()
}

pub fn users_from(query: &Query) -> Vec<User> {
    query
        .items
        .iter()
        .map(|item| User {
            id: item.jid.clone(),
            display_name: item.name.clone(),
            mention_name: item.mention_name.clone(),
        })
        .collect()
}

fn is_room_query(query: &Query) -> bool {
    query.ns == ns::DISCO_ITEMS || query.ns == ns::MUC_ROOM
}

/// Normalize a decoded message into the application record.
fn normalize(msg: &IncomingMessage, stamp: Option<&str>, now: DateTime<Utc>) -> Message {
    let body = match msg.body.as_deref() {
        Some("@attachment") | None => String::new(),
        Some(body) => body.to_string(),
    };
    Message {
        from: msg.from.clone(),
        to: msg.to.clone(),
        body,
        mention_name: String::new(),
        timestamp: parse_stamp(stamp.unwrap_or_default(), now),
        id: msg.id.clone(),
        attachments: msg
            .html_body
            .as_deref()
            .map(extract_attachments)
            .unwrap_or_default(),
    }
}

/// Classify one top-level element.
pub fn classify(el: &Element, now: DateTime<Utc>) -> Inbound {
    if el.ns() != ns::JABBER_CLIENT {
        return Inbound::Ignored;
    }

    match el.name() {
        "iq" => {
            let id = el.attr("id").unwrap_or_default().to_string();
            match el.attr("type") {
                Some("error") => Inbound::IqError {
                    id,
                    condition: el
                        .find_child("error")
                        .and_then(|e| e.children().next())
                        .map(|c| c.name().to_string())
                        .unwrap_or_else(|| "error".to_string()),
                },
                _ if el.get_child("fin", ns::MAM).is_some() => Inbound::ArchiveEnd,
                Some("result") | Some("set") => Inbound::Iq {
                    id,
                    query: Query::from_iq(el),
                },
                _ => Inbound::Ignored,
            }
        }
        "message" => {
            let msg = IncomingMessage::from_element(el);
            if msg.fin {
                return Inbound::ArchiveEnd;
            }
            if let Some(forwarded) = &msg.result {
                return Inbound::ArchiveItem(normalize(
                    &forwarded.message,
                    forwarded.delay_stamp.as_deref(),
                    now,
                ));
            }
            if let Some(invite) = &msg.invite {
                return Inbound::Invite(Room {
                    id: invite.room.clone(),
                    topic: invite.reason.clone(),
                    ..Room::default()
                });
            }
            match msg.body.as_deref() {
                Some(body) if !body.is_empty() && body != "none" => {
                    Inbound::Live(normalize(&msg, msg.delay_stamp.as_deref(), now))
                }
                _ => Inbound::Ignored,
            }
        }
        _ => Inbound::Ignored,
    }
}

/// Routes classified elements to their consumers.
pub struct Dispatcher {
    messages: mpsc::Sender<Message>,
    rooms: mpsc::Sender<Vec<Room>>,
    users: mpsc::Sender<Vec<User>>,
    queries: Arc<QueryRegistry>,
    history: Arc<HistoryAggregator>,
    /// Display name to mention name, learned from roster results.
    mention_names: HashMap<String, String>,
}

impl Dispatcher {
    pub fn new(
        messages: mpsc::Sender<Message>,
        rooms: mpsc::Sender<Vec<Room>>,
        users: mpsc::Sender<Vec<User>>,
        queries: Arc<QueryRegistry>,
        history: Arc<HistoryAggregator>,
    ) -> Self {
        Self {
            messages,
            rooms,
            users,
            queries,
            history,
            mention_names: HashMap::new(),
        }
    }

    fn learn_mention_names(&mut self, users: &[User]) {
        for user in users {
            if !user.mention_name.is_empty() {
                self.mention_names
                    .insert(user.display_name.clone(), user.mention_name.clone());
            }
        }
    }

    fn mention_name_for(&self, from: &str) -> String {
        from.split_once('/')
            .and_then(|(_, nick)| self.mention_names.get(nick))
            .cloned()
            .unwrap_or_default()
    }

    pub async fn dispatch(&mut self, el: &Element) {
        match classify(el, Utc::now()) {
            Inbound::Iq { id, query } => {
                if let Some(q) = &query {
                    if q.ns == ns::IQ_ROSTER {
                        let users = users_from(q);
                        self.learn_mention_names(&users);
                    }
                }
                if let Some(Ok(Some(query))) = self.queries.resolve(&id, Ok(query)) {
                    self.route_unsolicited(query);
                }
            }
            Inbound::IqError { id, condition } => {
                if self.queries.resolve(&id, Err(Error::Query(condition.clone()))).is_none() {
                    return;
                }
                if !self.history.fail(&id, &condition) {
                    warn!(id = %id, condition = %condition, "Uncorrelated IQ error");
                }
            }
            Inbound::Live(mut message) => {
                message.mention_name = self.mention_name_for(&message.from);
                if self.messages.send(message).await.is_err() {
                    debug!("Message receiver dropped");
                }
            }
            Inbound::Invite(room) => {
                if let Err(e) = self.rooms.try_send(vec![room]) {
                    warn!(error = %e, "Room channel unavailable, dropping invitation");
                }
            }
            Inbound::ArchiveItem(message) => self.history.append(message),
            Inbound::ArchiveEnd => self.history.finish(),
            Inbound::Ignored => {
                debug!(name = el.name(), ns = el.ns(), "Unhandled element");
            }
        }
    }

    fn route_unsolicited(&mut self, query: Query) {
        if is_room_query(&query) {
            if let Err(e) = self.rooms.try_send(rooms_from(&query)) {
                warn!(error = %e, "Room channel unavailable, dropping room list");
            }
        } else if query.ns == ns::IQ_ROSTER {
            if let Err(e) = self.users.try_send(users_from(&query)) {
                warn!(error = %e, "User channel unavailable, dropping roster push");
            }
        } else {
            debug!(ns = %query.ns, "Unsolicited query result ignored");
        }
    }
}
