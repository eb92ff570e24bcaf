//! Stanza codec: outgoing request templates and typed views of inbound elements.
//!
//! Outgoing stanzas are rendered from explicit parameters with pre-declared
//! namespaces; no tree serialization is involved. Inbound elements are
//! decoded lazily into the record the caller asks for, based on the
//! element's name and namespace.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use quick_xml::escape::escape;
use rand::rngs::OsRng;
use rand::RngCore;

use super::element::Element;
use crate::model::Attachment;

/// Namespaces used on the wire.
pub mod ns {
    pub const XML: &str = "http://www.w3.org/XML/1998/namespace";
    pub const JABBER_CLIENT: &str = "jabber:client";
    pub const STREAM: &str = "http://etherx.jabber.org/streams";
    pub const IQ_AUTH: &str = "jabber:iq:auth";
    pub const IQ_ROSTER: &str = "jabber:iq:roster";
    pub const TLS: &str = "urn:ietf:params:xml:ns:xmpp-tls";
    pub const SASL: &str = "urn:ietf:params:xml:ns:xmpp-sasl";
    pub const BIND: &str = "urn:ietf:params:xml:ns:xmpp-bind";
    pub const SESSION: &str = "urn:ietf:params:xml:ns:xmpp-session";
    pub const DISCO_ITEMS: &str = "http://jabber.org/protocol/disco#items";
    pub const MUC: &str = "http://jabber.org/protocol/muc";
    pub const MUC_USER: &str = "http://jabber.org/protocol/muc#user";
    pub const MUC_ROOM: &str = "http://hipchat.com/protocol/muc#room";
    pub const CONFERENCE: &str = "jabber:x:conference";
    pub const FORWARD: &str = "urn:xmpp:forward:0";
    pub const MAM: &str = "urn:xmpp:mam:0";
    pub const RSM: &str = "http://jabber.org/protocol/rsm";
    pub const DATA_FORM: &str = "jabber:x:data";
    pub const DELAY: &str = "urn:xmpp:delay";
    pub const PING: &str = "urn:xmpp:ping";
    pub const XHTML_IM: &str = "http://jabber.org/protocol/xhtml-im";
    pub const XHTML: &str = "http://www.w3.org/1999/xhtml";
}

/// Fresh correlation id: 8 bytes from the OS CSPRNG, hex-encoded.
pub fn new_id() -> String {
    let mut bytes = [0u8; 8];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

// --- outgoing ---

pub fn stream_open(jid: &str, host: &str) -> String {
    format!(
        "<stream:stream from='{}' to='{}' version='1.0' xml:lang='en' xmlns='{}' xmlns:stream='{}'>",
        escape(jid),
        escape(host),
        ns::JABBER_CLIENT,
        ns::STREAM
    )
}

pub fn start_tls() -> String {
    format!("<starttls xmlns='{}'/>", ns::TLS)
}

/// Legacy single-request authentication (`jabber:iq:auth`).
pub fn iq_auth(id: &str, username: &str, password: &str, resource: &str) -> String {
    format!(
        "<iq type='set' id='{}'><query xmlns='{}'><username>{}</username><password>{}</password><resource>{}</resource></query></iq>",
        id,
        ns::IQ_AUTH,
        escape(username),
        escape(password),
        escape(resource)
    )
}

/// SASL PLAIN payload: base64 of `\0user\0password`.
pub fn plain_credentials(username: &str, password: &str) -> String {
    let raw = format!("\0{}\0{}", username, password);
    BASE64.encode(raw.as_bytes())
}

pub fn sasl_auth(username: &str, password: &str) -> String {
    format!(
        "<auth xmlns='{}' mechanism='PLAIN'>{}</auth>",
        ns::SASL,
        plain_credentials(username, password)
    )
}

pub fn bind(id: &str, resource: &str) -> String {
    format!(
        "<iq type='set' id='{}'><bind xmlns='{}'><resource>{}</resource></bind></iq>",
        id,
        ns::BIND,
        escape(resource)
    )
}

pub fn session(id: &str) -> String {
    format!("<iq type='set' id='{}'><session xmlns='{}'/></iq>", id, ns::SESSION)
}

/// Directory (`disco#items`) or roster query.
pub fn iq_query(from: &str, to: &str, id: &str, namespace: &str) -> String {
    format!(
        "<iq from='{}' to='{}' id='{}' type='get'><query xmlns='{}'/></iq>",
        escape(from),
        escape(to),
        id,
        namespace
    )
}

pub fn presence(jid: &str, show: &str) -> String {
    format!(
        "<presence from='{}'><show>{}</show></presence>",
        escape(jid),
        escape(show)
    )
}

/// Join `room` (already suffixed with `/nickname`), asking for `history` backlog stanzas.
pub fn muc_join(id: &str, room: &str, jid: &str, history: u32) -> String {
    format!(
        "<presence id='{}' to='{}' from='{}'><x xmlns='{}'><history maxstanzas='{}'/></x></presence>",
        id,
        escape(room),
        escape(jid),
        ns::MUC,
        history
    )
}

pub fn muc_leave(id: &str, jid: &str, room: &str) -> String {
    format!(
        "<presence id='{}' from='{}' to='{}' type='unavailable'/>",
        id,
        escape(jid),
        escape(room)
    )
}

pub fn image_tag(attachment: &Attachment) -> String {
    format!(
        "<img src='{}' title='{}' longdesc='{}##{}'/>",
        escape(attachment.image_url.as_str()),
        escape(attachment.image_filename.as_str()),
        escape(attachment.thumbnail_size.as_str()),
        escape(attachment.thumbnail_url.as_str())
    )
}

pub fn groupchat(from: &str, id: &str, to: &str, body: &str, attachments: &[Attachment]) -> String {
    let body = escape(body);
    let html = if attachments.is_empty() {
        String::new()
    } else {
        let tags: Vec<String> = attachments.iter().map(image_tag).collect();
        format!(
            "<html xmlns='{}'><body xmlns='{}'><p>{}</p><p>{}</p></body></html>",
            ns::XHTML_IM,
            ns::XHTML,
            body,
            tags.join("\n")
        )
    };
    format!(
        "<message from='{}' id='{}' to='{}' type='groupchat'><body>{}</body>{}</message>",
        escape(from),
        id,
        escape(to),
        body,
        html
    )
}

fn form_field(var: &str, value: &str) -> String {
    format!("<field var='{}'><value>{}</value></field>", var, escape(value))
}

/// Paged archive query for the conversation with `with`, optionally starting at `start`.
pub fn archive_query(id: &str, with: &str, start: Option<DateTime<Utc>>, limit: u32) -> String {
    let mut filters = vec![form_field("FORM_TYPE", ns::MAM), form_field("with", with)];
    if let Some(start) = start {
        filters.push(form_field(
            "start",
            &start.format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        ));
    }
    format!(
        "<iq type='set' id='{}'><query xmlns='{}'><x xmlns='{}'>{}</x><set xmlns='{}'><max>{}</max></set></query></iq>",
        id,
        ns::MAM,
        ns::DATA_FORM,
        filters.concat(),
        ns::RSM,
        limit
    )
}

pub fn ping(from: &str, id: &str) -> String {
    format!(
        "<iq from='{}' id='{}' type='get'><ping xmlns='{}'/></iq>",
        escape(from),
        id,
        ns::PING
    )
}

/// Whitespace keep-alive.
pub const KEEP_ALIVE: &str = " ";

// --- incoming ---

/// `<stream:features>` as far as the handshake cares.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Features {
    pub starttls_offered: bool,
    pub starttls_required: bool,
    pub mechanisms: Vec<String>,
}

impl Features {
    pub fn from_element(el: &Element) -> Self {
        let starttls = el.get_child("starttls", ns::TLS);
        let mechanisms = el
            .get_child("mechanisms", ns::SASL)
            .map(|m| {
                m.children()
                    .filter(|c| c.name() == "mechanism")
                    .map(|c| c.text().trim().to_string())
                    .collect()
            })
            .unwrap_or_default();

        Self {
            starttls_offered: starttls.is_some(),
            starttls_required: starttls.is_some_and(|s| s.find_child("required").is_some()),
            mechanisms,
        }
    }

    pub fn offers_plain(&self) -> bool {
        self.mechanisms.iter().any(|m| m == "PLAIN")
    }
}

/// One `<item/>` of a directory or roster query result.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryItem {
    pub jid: String,
    pub name: String,
    pub mention_name: String,
    pub topic: String,
    pub owner: String,
}

/// The `<query/>` payload of an IQ.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub ns: String,
    pub items: Vec<QueryItem>,
}

impl Query {
    pub fn from_iq(iq: &Element) -> Option<Self> {
        let query = iq.find_child("query")?;
        let items = query
            .children()
            .filter(|c| c.name() == "item")
            .map(|item| QueryItem {
                jid: item.attr("jid").unwrap_or_default().to_string(),
                name: item
                    .attr("name")
                    .map(str::to_string)
                    .or_else(|| item.find_descendant("name").map(|n| n.text()))
                    .unwrap_or_default(),
                mention_name: item.attr("mention_name").unwrap_or_default().to_string(),
                topic: item
                    .find_descendant("topic")
                    .map(|t| t.text())
                    .unwrap_or_default(),
                owner: item
                    .find_descendant("owner")
                    .map(|o| o.text())
                    .unwrap_or_default(),
            })
            .collect();

        Some(Self {
            ns: query.ns().to_string(),
            items,
        })
    }
}

/// A room invitation carried inside a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invite {
    pub room: String,
    pub reason: String,
}

/// A `forwarded` archive envelope: the original message plus its delay stamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forwarded {
    pub message: Box<IncomingMessage>,
    pub delay_stamp: Option<String>,
}

/// Structured view of a `<message/>` stanza.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncomingMessage {
    pub from: String,
    pub to: String,
    pub id: String,
    pub body: Option<String>,
    pub delay_stamp: Option<String>,
    /// Serialized content of the XHTML body, if any.
    pub html_body: Option<String>,
    pub invite: Option<Invite>,
    pub result: Option<Forwarded>,
    pub fin: bool,
}

impl IncomingMessage {
    pub fn from_element(el: &Element) -> Self {
        let invite = el
            .children()
            .filter(|c| c.name() == "x")
            .find_map(|x| {
                x.attr("jid").filter(|j| !j.is_empty()).map(|jid| Invite {
                    room: jid.to_string(),
                    reason: x.attr("reason").unwrap_or_default().to_string(),
                })
            });

        let result = el
            .get_child("result", ns::MAM)
            .and_then(|r| r.get_child("forwarded", ns::FORWARD))
            .and_then(Forwarded::from_element);

        Self {
            from: el.attr("from").unwrap_or_default().to_string(),
            to: el.attr("to").unwrap_or_default().to_string(),
            id: el.attr("id").unwrap_or_default().to_string(),
            body: el.find_child("body").map(|b| b.text()),
            delay_stamp: el
                .find_child("delay")
                .and_then(|d| d.attr("stamp"))
                .map(str::to_string),
            html_body: el
                .get_child("html", ns::XHTML_IM)
                .and_then(|h| h.find_child("body"))
                .map(|b| b.inner_xml()),
            invite,
            result,
            fin: el.get_child("fin", ns::MAM).is_some(),
        }
    }
}

impl Forwarded {
    pub fn from_element(el: &Element) -> Option<Self> {
        let message = el.find_child("message")?;
        Some(Self {
            message: Box::new(IncomingMessage::from_element(message)),
            delay_stamp: el
                .find_child("delay")
                .and_then(|d| d.attr("stamp"))
                .map(str::to_string),
        })
    }
}
