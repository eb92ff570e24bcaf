//! XMPP stream framing: top-level element extraction from a TCP byte stream.
//!
//! The server sends one endless `<stream:stream>` document. Its opening tag
//! is reported on its own, then each depth-1 child is cut out as a complete
//! stanza, and `</stream:stream>` marks the end of the session.

use quick_xml::events::Event;
use quick_xml::Reader;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, trace};

use super::element::{Element, NamespaceScope};
use crate::error::{Error, Result};

/// Upper bound on buffered, not yet complete, inbound data (1 MiB).
pub const MAX_STANZA_BUFFER_SIZE: usize = 1024 * 1024;

const READ_CHUNK_SIZE: usize = 8192;

/// One unit cut out of the inbound stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `<stream:stream ...>` header, including any leading XML declaration.
    StreamOpen(String),
    /// `</stream:stream>`.
    StreamClose,
    /// A complete top-level element.
    Stanza(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ParserState {
    /// Between stanzas, or before the stream header.
    Idle,
    /// Inside a top-level stanza.
    InStanza,
}

fn bytes_to_string(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

fn is_stream_tag(qname: &[u8]) -> bool {
    qname == b"stream:stream" || qname == b"stream"
}

/// Extract the next frame from `buffer`.
///
/// Returns the frame and the number of bytes it consumed, or `None` while
/// the buffer only holds a partial element. Malformed input that cannot be
/// completed by further reads is a protocol error.
pub fn extract_frame(buffer: &[u8]) -> Result<Option<(Frame, usize)>> {
    let first = buffer.iter().position(|b| !b.is_ascii_whitespace());
    if let Some(start) = first {
        if buffer[start..].starts_with(b"</stream:stream>") {
            return Ok(Some((Frame::StreamClose, start + b"</stream:stream>".len())));
        }
    }

    let mut reader = Reader::from_reader(buffer);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;

    let mut depth: u32 = 0;
    let mut state = ParserState::Idle;
    let mut stanza_start: usize = 0;

    loop {
        let pos = reader.buffer_position() as usize;

        match reader.read_event() {
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_)) | Ok(Event::DocType(_)) => {
                continue;
            }
            Ok(Event::Start(e)) => {
                if state == ParserState::Idle && is_stream_tag(e.name().as_ref()) {
                    let tag_end = reader.buffer_position() as usize;
                    return Ok(Some((Frame::StreamOpen(bytes_to_string(&buffer[..tag_end])), tag_end)));
                }

                depth += 1;
                if state == ParserState::Idle && depth == 1 {
                    state = ParserState::InStanza;
                    stanza_start = pos;
                }
            }
            Ok(Event::Empty(e)) => {
                if state == ParserState::Idle && is_stream_tag(e.name().as_ref()) {
                    let tag_end = reader.buffer_position() as usize;
                    return Ok(Some((Frame::StreamOpen(bytes_to_string(&buffer[..tag_end])), tag_end)));
                }

                if state == ParserState::Idle && depth == 0 {
                    let tag_end = reader.buffer_position() as usize;
                    return Ok(Some((Frame::Stanza(bytes_to_string(&buffer[pos..tag_end])), tag_end)));
                }
            }
            Ok(Event::Text(_)) | Ok(Event::CData(_)) => {}
            Ok(Event::End(e)) => {
                if depth == 0 && is_stream_tag(e.name().as_ref()) {
                    let tag_end = reader.buffer_position() as usize;
                    return Ok(Some((Frame::StreamClose, tag_end)));
                }

                depth = depth.saturating_sub(1);
                if state == ParserState::InStanza && depth == 0 {
                    let tag_end = reader.buffer_position() as usize;
                    return Ok(Some((
                        Frame::Stanza(bytes_to_string(&buffer[stanza_start..tag_end])),
                        tag_end,
                    )));
                }
            }
            Ok(Event::Eof) => return Ok(None),
            // Unterminated markup at the end of the buffer; more bytes may complete it.
            Err(quick_xml::Error::Syntax(_)) => return Ok(None),
            Err(e) => return Err(Error::Protocol(format!("invalid xml response: {}", e))),
        }
    }
}

/// Decode cursor over an inbound stream.
///
/// Owns the undecoded bytes and the namespace bindings declared by the
/// current stream header. A fresh cursor is needed after each stream
/// restart that changes the byte stream (TLS upgrade).
#[derive(Debug, Default)]
pub struct StanzaReader {
    buffer: Vec<u8>,
    scope: NamespaceScope,
}

impl StanzaReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes received from the transport.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Decode the next element already in the buffer, if complete.
    ///
    /// A stream header yields the header element (children-less) and
    /// rebinds the namespace scope. The stream closing tag yields
    /// `ConnectionClosed`.
    pub fn try_next(&mut self) -> Result<Option<Element>> {
        let Some((frame, consumed)) = extract_frame(&self.buffer)? else {
            if self.buffer.iter().all(u8::is_ascii_whitespace) {
                self.buffer.clear();
            } else if self.buffer.len() > MAX_STANZA_BUFFER_SIZE {
                return Err(Error::Protocol(format!(
                    "incomplete stanza exceeds {} bytes",
                    MAX_STANZA_BUFFER_SIZE
                )));
            }
            return Ok(None);
        };
        self.buffer.drain(..consumed);

        match frame {
            Frame::StreamOpen(header) => {
                let (element, scope) = Element::parse_start(&header, &NamespaceScope::default())?;
                debug!(id = element.attr("id").unwrap_or(""), "Stream header received");
                self.scope = scope;
                Ok(Some(element))
            }
            Frame::StreamClose => {
                debug!("Server closed the stream");
                Err(Error::ConnectionClosed)
            }
            Frame::Stanza(text) => {
                trace!(stanza = %text, "<<");
                Element::parse(&text, &self.scope).map(Some)
            }
        }
    }

    /// Read from `io` until one complete element is decoded.
    ///
    /// Cancel-safe: bytes read before cancellation stay buffered.
    pub async fn next_element<R: AsyncRead + Unpin>(&mut self, io: &mut R) -> Result<Element> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            if let Some(element) = self.try_next()? {
                return Ok(element);
            }
            let n = io.read(&mut chunk).await?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            self.push(&chunk[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xmpp::stanza::ns;

    fn stanza(buf: &[u8]) -> (String, usize) {
        match extract_frame(buf).unwrap() {
            Some((Frame::Stanza(s), n)) => (s, n),
            other => panic!("expected stanza, got {:?}", other),
        }
    }

    // --- extract_frame tests ---

    #[test]
    fn test_extract_stream_opening() {
        let buf = b"<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' version='1.0'>";
        let (frame, consumed) = extract_frame(buf).unwrap().unwrap();
        assert!(matches!(frame, Frame::StreamOpen(ref s) if s.contains("<stream:stream") && s.contains("<?xml")));
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn test_extract_stream_features() {
        let buf = b"<stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/></stream:features>";
        let (text, consumed) = stanza(buf);
        assert!(text.starts_with("<stream:features"));
        assert!(text.ends_with("</stream:features>"));
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn test_extract_simple_stanza() {
        let (text, consumed) = stanza(b"<presence/>");
        assert_eq!(text, "<presence/>");
        assert_eq!(consumed, 11);
    }

    #[test]
    fn test_extract_multiple_stanzas() {
        let buf = b"<presence from='user@example.com'/><message to='other@example.com'><body>Hello</body></message>";
        let (first, c1) = stanza(buf);
        assert!(first.contains("<presence"));
        assert!(!first.contains("<message"));

        let (second, c2) = stanza(&buf[c1..]);
        assert!(second.contains("Hello"));
        assert_eq!(c1 + c2, buf.len());
    }

    #[test]
    fn test_extract_incomplete_stanza() {
        assert!(extract_frame(b"<iq type='get'><query xmlns='jabber:iq:roster'>").unwrap().is_none());
        assert!(extract_frame(b"<iq type='ge").unwrap().is_none());
    }

    #[test]
    fn test_extract_stream_closing() {
        let (frame, consumed) = extract_frame(b"  </stream:stream>").unwrap().unwrap();
        assert_eq!(frame, Frame::StreamClose);
        assert_eq!(consumed, 18);
    }

    #[test]
    fn test_extract_empty_and_whitespace_buffers() {
        assert!(extract_frame(b"").unwrap().is_none());
        assert!(extract_frame(b"   \n  ").unwrap().is_none());
    }

    #[test]
    fn test_extract_stanza_with_entities_and_cdata() {
        let buf = b"<message from='a@b'><body>Hello &amp; welcome</body><x><![CDATA[<raw>]]></x></message>";
        let (text, consumed) = stanza(buf);
        assert!(text.contains("&amp;"));
        assert!(text.contains("CDATA"));
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn test_extract_fragmented_features() {
        let partial = b"<stream:features><starttls xmlns='urn:ietf:params:xml:ns:xmpp-tls'/>";
        assert!(extract_frame(partial).unwrap().is_none());

        let mut full = partial.to_vec();
        full.extend_from_slice(b"</stream:features>");
        let (text, _) = stanza(&full);
        assert!(text.contains("<starttls"));
    }

    // --- StanzaReader tests ---

    #[test]
    fn test_reader_resolves_namespaces_from_header() {
        let mut reader = StanzaReader::new();
        reader.push(b"<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' id='s1' version='1.0'><stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms></stream:features>");

        let header = reader.try_next().unwrap().unwrap();
        assert!(header.is("stream", ns::STREAM));
        assert_eq!(header.attr("id"), Some("s1"));

        let features = reader.try_next().unwrap().unwrap();
        assert!(features.is("features", ns::STREAM));
        assert!(reader.try_next().unwrap().is_none());
    }

    #[test]
    fn test_reader_stream_close_is_connection_closed() {
        let mut reader = StanzaReader::new();
        reader.push(b"<presence/></stream:stream>");
        assert!(reader.try_next().unwrap().is_some());
        assert!(matches!(reader.try_next(), Err(Error::ConnectionClosed)));
    }

    #[test]
    fn test_reader_empty_element_name_is_protocol_error() {
        let mut reader = StanzaReader::new();
        reader.push(b"<:x/>");
        assert!(matches!(reader.try_next(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_reader_discards_whitespace_keepalives() {
        let mut reader = StanzaReader::new();
        reader.push(b"   \n ");
        assert!(reader.try_next().unwrap().is_none());
        reader.push(b"<presence/>");
        assert_eq!(reader.try_next().unwrap().unwrap().name(), "presence");
    }

    #[test]
    fn test_reader_rejects_oversized_partial_stanza() {
        let mut reader = StanzaReader::new();
        reader.push(b"<message><body>");
        reader.push(&vec![b'a'; MAX_STANZA_BUFFER_SIZE + 1]);
        assert!(matches!(reader.try_next(), Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_next_element_reads_across_chunks() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            server.write_all(b"<message from='a@b'><bo").await.unwrap();
            server.write_all(b"dy>split</body></message>").await.unwrap();
        });

        let mut reader = StanzaReader::new();
        let el = reader.next_element(&mut client).await.unwrap();
        assert_eq!(el.find_child("body").unwrap().text(), "split");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_next_element_eof_is_connection_closed() {
        let mut input: &[u8] = b"<message><body>cut";
        let mut reader = StanzaReader::new();
        assert!(matches!(
            reader.next_element(&mut input).await,
            Err(Error::ConnectionClosed)
        ));
    }
}
