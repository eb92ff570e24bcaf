//! Owned element tree for decoded stanzas.
//!
//! Each top-level stanza extracted by the framing layer is decoded into an
//! [`Element`] with namespaces resolved against the declarations inherited
//! from the enclosing `<stream:stream>` header. Typed records (features,
//! queries, messages) are read from the tree on demand.

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::stanza::ns;
use crate::error::{Error, Result};

/// A decoded XML element: local name, resolved namespace, attributes and children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    name: String,
    ns: String,
    attrs: Vec<(String, String)>,
    children: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

/// Prefix-to-namespace bindings in effect at some point of the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceScope {
    bindings: Vec<(Option<String>, String)>,
}

impl Default for NamespaceScope {
    /// Bindings a client stream starts with before the server header is seen.
    fn default() -> Self {
        Self {
            bindings: vec![
                (Some("xml".to_string()), ns::XML.to_string()),
                (None, ns::JABBER_CLIENT.to_string()),
                (Some("stream".to_string()), ns::STREAM.to_string()),
            ],
        }
    }
}

impl NamespaceScope {
    fn resolve(&self, prefix: Option<&str>) -> Option<&str> {
        self.bindings
            .iter()
            .rev()
            .find(|(p, _)| p.as_deref() == prefix)
            .map(|(_, uri)| uri.as_str())
    }

    fn declare(&mut self, prefix: Option<String>, uri: String) {
        self.bindings.push((prefix, uri));
    }

    fn mark(&self) -> usize {
        self.bindings.len()
    }

    fn reset_to(&mut self, mark: usize) {
        self.bindings.truncate(mark);
    }
}

impl Element {
    /// Local name of the element.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolved namespace URI (empty when none is in scope).
    pub fn ns(&self) -> &str {
        &self.ns
    }

    pub fn is(&self, name: &str, namespace: &str) -> bool {
        self.name == name && self.ns == namespace
    }

    /// Attribute value by local name. Prefixed attributes match on the part after the colon.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| local_name(k) == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    /// First child with the given name and namespace.
    pub fn get_child(&self, name: &str, namespace: &str) -> Option<&Element> {
        self.children().find(|c| c.is(name, namespace))
    }

    /// First child with the given local name, whatever its namespace.
    pub fn find_child(&self, name: &str) -> Option<&Element> {
        self.children().find(|c| c.name == name)
    }

    /// First descendant (depth-first, document order) with the given local name.
    pub fn find_descendant(&self, name: &str) -> Option<&Element> {
        for child in self.children() {
            if child.name == name {
                return Some(child);
            }
            if let Some(found) = child.find_descendant(name) {
                return Some(found);
            }
        }
        None
    }

    /// Concatenated direct text content.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|n| match n {
                Node::Text(t) => Some(t.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    /// Serialized children, with single-quoted attributes in their original order.
    pub fn inner_xml(&self) -> String {
        let mut out = String::new();
        for child in &self.children {
            write_node(child, &self.ns, &mut out);
        }
        out
    }

    /// Decode one complete element from `xml`, resolving prefixes against `scope`.
    pub fn parse(xml: &str, scope: &NamespaceScope) -> Result<Element> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(false);

        let mut scope = scope.clone();
        let mut stack: Vec<(Element, usize)> = Vec::new();

        loop {
            match reader.read_event()? {
                Event::Start(e) => {
                    let mark = scope.mark();
                    let element = open_element(&e, &mut scope)?;
                    stack.push((element, mark));
                }
                Event::Empty(e) => {
                    let mark = scope.mark();
                    let element = open_element(&e, &mut scope)?;
                    scope.reset_to(mark);
                    if let Some(root) = attach(&mut stack, element) {
                        return Ok(root);
                    }
                }
                Event::End(_) => {
                    let (element, mark) = stack
                        .pop()
                        .ok_or_else(|| Error::Protocol("unexpected closing tag".into()))?;
                    scope.reset_to(mark);
                    if let Some(root) = attach(&mut stack, element) {
                        return Ok(root);
                    }
                }
                Event::Text(t) => {
                    if let Some((top, _)) = stack.last_mut() {
                        top.children.push(Node::Text(t.unescape()?.into_owned()));
                    }
                }
                Event::CData(c) => {
                    if let Some((top, _)) = stack.last_mut() {
                        top.children
                            .push(Node::Text(String::from_utf8_lossy(&c).into_owned()));
                    }
                }
                Event::Eof => {
                    return Err(Error::Protocol("incomplete element".into()));
                }
                _ => {}
            }
        }
    }

    /// Decode only the opening tag of `xml` (used for the unclosed stream header).
    ///
    /// Returns the element without children and the scope extended with the
    /// tag's namespace declarations.
    pub fn parse_start(xml: &str, scope: &NamespaceScope) -> Result<(Element, NamespaceScope)> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().check_end_names = false;

        let mut scope = scope.clone();
        loop {
            match reader.read_event()? {
                Event::Start(e) | Event::Empty(e) => {
                    let element = open_element(&e, &mut scope)?;
                    return Ok((element, scope));
                }
                Event::Eof => {
                    return Err(Error::Protocol("missing opening tag".into()));
                }
                _ => {}
            }
        }
    }
}

fn open_element(start: &BytesStart<'_>, scope: &mut NamespaceScope) -> Result<Element> {
    let mut attrs = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| Error::Protocol(format!("invalid attribute: {}", e)))?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(|e| Error::Protocol(format!("invalid attribute name: {}", e)))?
            .to_string();
        let value = attr.unescape_value()?.into_owned();

        if key == "xmlns" {
            scope.declare(None, value);
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            scope.declare(Some(prefix.to_string()), value);
        } else {
            attrs.push((key, value));
        }
    }

    let qname = std::str::from_utf8(start.name().as_ref())
        .map_err(|e| Error::Protocol(format!("invalid element name: {}", e)))?
        .to_string();
    let (prefix, local) = match qname.split_once(':') {
        Some((p, l)) => (Some(p), l),
        None => (None, qname.as_str()),
    };
    if local.is_empty() {
        return Err(Error::Protocol("invalid xml response: empty element name".into()));
    }
    let namespace = match (prefix, scope.resolve(prefix)) {
        (_, Some(uri)) => uri.to_string(),
        (None, None) => String::new(),
        (Some(p), None) => {
            return Err(Error::Protocol(format!("unbound namespace prefix '{}'", p)));
        }
    };

    Ok(Element {
        name: local.to_string(),
        ns: namespace,
        attrs,
        children: Vec::new(),
    })
}

fn attach(stack: &mut [(Element, usize)], element: Element) -> Option<Element> {
    match stack.last_mut() {
        Some((parent, _)) => {
            parent.children.push(Node::Element(element));
            None
        }
        None => Some(element),
    }
}

fn local_name(qname: &str) -> &str {
    qname.rsplit_once(':').map_or(qname, |(_, local)| local)
}

fn write_node(node: &Node, parent_ns: &str, out: &mut String) {
    match node {
        Node::Text(t) => out.push_str(&escape(t.as_str())),
        Node::Element(e) => {
            out.push('<');
            out.push_str(&e.name);
            if e.ns != parent_ns {
                out.push_str(&format!(" xmlns='{}'", escape(e.ns.as_str())));
            }
            for (k, v) in &e.attrs {
                out.push_str(&format!(" {}='{}'", k, escape(v.as_str())));
            }
            if e.children.is_empty() {
                out.push_str("/>");
                return;
            }
            out.push('>');
            for child in &e.children {
                write_node(child, &e.ns, out);
            }
            out.push_str("</");
            out.push_str(&e.name);
            out.push('>');
        }
    }
}
