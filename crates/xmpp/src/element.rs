//! Owned XML element tree used for stanzas and nonzas.
//!
//! Elements keep their attributes in document order, including any namespace
//! declarations that were present on the wire, so that an element decoded from
//! canonical input serializes back to the same bytes.

use std::fmt;

use bytes::BytesMut;
use quick_xml::escape::{escape, partial_escape};
use tokio_util::codec::Decoder;

use crate::codec::{StreamEvent, XmlStreamCodec};
use crate::error::CodecError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    prefix: Option<String>,
    name: String,
    namespace: String,
    attributes: Vec<(String, String)>,
    /// Namespaces of prefixed attributes, by prefix.
    attribute_namespaces: Vec<(String, String)>,
    children: Vec<Node>,
}

impl Element {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            prefix: None,
            name: name.into(),
            namespace: namespace.into(),
            attributes: Vec::new(),
            attribute_namespaces: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn builder(name: impl Into<String>, namespace: impl Into<String>) -> ElementBuilder {
        ElementBuilder {
            element: Element::new(name, namespace),
        }
    }

    /// Parses a single standalone element.
    pub fn parse(xml: &str) -> Result<Element, CodecError> {
        let mut codec = XmlStreamCodec::new();
        let mut buffer = BytesMut::from(xml.as_bytes());
        let mut builder = TreeBuilder::default();

        while let Some(event) = codec.decode_eof(&mut buffer)? {
            if let Some(element) = builder.push(event)? {
                return Ok(element);
            }
        }

        Err(CodecError::Malformed("unexpected end of document".to_string()))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    pub fn ns(&self) -> &str {
        &self.namespace
    }

    pub fn is(&self, name: &str, namespace: &str) -> bool {
        self.name == name && self.namespace == namespace
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    /// Sets an attribute, keeping its original position when it already exists.
    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(key, _)| *key == name) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((name, value)),
        }
    }

    pub fn remove_attr(&mut self, name: &str) -> Option<String> {
        let index = self.attributes.iter().position(|(key, _)| key == name)?;
        Some(self.attributes.remove(index).1)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.children
    }

    pub fn children(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|node| match node {
            Node::Element(element) => Some(element),
            Node::Text(_) => None,
        })
    }

    pub fn get_child(&self, name: &str, namespace: &str) -> Option<&Element> {
        self.children().find(|child| child.is(name, namespace))
    }

    pub fn has_child(&self, name: &str, namespace: &str) -> bool {
        self.get_child(name, namespace).is_some()
    }

    pub fn append_child(&mut self, child: Element) {
        self.children.push(Node::Element(child));
    }

    pub fn append_text(&mut self, text: impl Into<String>) {
        let text = text.into();
        if let Some(Node::Text(existing)) = self.children.last_mut() {
            existing.push_str(&text);
        } else {
            self.children.push(Node::Text(text));
        }
    }

    /// Concatenated direct text content.
    pub fn text(&self) -> String {
        self.children
            .iter()
            .filter_map(|node| match node {
                Node::Text(text) => Some(text.as_str()),
                Node::Element(_) => None,
            })
            .collect()
    }

    /// Serializes with no inherited default namespace.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_to(&mut out, None, &mut Vec::new());
        out
    }

    /// Serializes as a child of a stream or element whose default namespace is
    /// `default_ns`, omitting the redundant declaration.
    pub fn to_xml_in(&self, default_ns: &str) -> String {
        let mut out = String::new();
        self.write_to(&mut out, Some(default_ns), &mut Vec::new());
        out
    }

    fn qualified_name(&self) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}:{}", self.name),
            None => self.name.clone(),
        }
    }

    /// `bound` holds the prefix declarations already written by ancestors.
    fn write_to(&self, out: &mut String, inherited_ns: Option<&str>, bound: &mut Vec<(String, String)>) {
        let qname = self.qualified_name();
        out.push('<');
        out.push_str(&qname);

        let scope_start = bound.len();
        for (key, value) in &self.attributes {
            if let Some(prefix) = key.strip_prefix("xmlns:") {
                bound.push((prefix.to_string(), value.clone()));
            }
        }

        let declares_default = self.attributes.iter().any(|(key, _)| key == "xmlns");
        if self.prefix.is_none()
            && !declares_default
            && inherited_ns != Some(self.namespace.as_str())
            && !(inherited_ns.is_none() && self.namespace.is_empty())
        {
            out.push_str(" xmlns='");
            out.push_str(&escape(self.namespace.as_str()));
            out.push('\'');
        }

        // Prefixes declared outside the subtree being written.
        let used_prefixes = self
            .prefix
            .iter()
            .map(|prefix| (prefix.as_str(), self.namespace.as_str()))
            .chain(
                self.attribute_namespaces
                    .iter()
                    .map(|(prefix, namespace)| (prefix.as_str(), namespace.as_str())),
            );
        for (prefix, namespace) in used_prefixes {
            if prefix == "xml" || is_bound(bound, prefix, namespace) {
                continue;
            }
            out.push_str(" xmlns:");
            out.push_str(prefix);
            out.push_str("='");
            out.push_str(&escape(namespace));
            out.push('\'');
            bound.push((prefix.to_string(), namespace.to_string()));
        }

        for (key, value) in &self.attributes {
            out.push(' ');
            out.push_str(key);
            out.push_str("='");
            out.push_str(&escape(value.as_str()));
            out.push('\'');
        }

        if self.children.is_empty() {
            out.push_str("/>");
        } else {
            out.push('>');

            let child_ns = match (&self.prefix, self.attr("xmlns")) {
                (_, Some(declared)) => Some(declared),
                (None, None) => Some(self.namespace.as_str()),
                (Some(_), None) => inherited_ns,
            };
            for node in &self.children {
                match node {
                    Node::Element(child) => child.write_to(out, child_ns, bound),
                    Node::Text(text) => out.push_str(&partial_escape(text.as_str())),
                }
            }

            out.push_str("</");
            out.push_str(&qname);
            out.push('>');
        }
        bound.truncate(scope_start);
    }
}

fn is_bound(bound: &[(String, String)], prefix: &str, namespace: &str) -> bool {
    bound
        .iter()
        .rev()
        .find(|(declared, _)| declared == prefix)
        .is_some_and(|(_, declared_ns)| declared_ns == namespace)
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_xml())
    }
}

pub struct ElementBuilder {
    element: Element,
}

impl ElementBuilder {
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.element.prefix = Some(prefix.into());
        self
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.element.set_attr(name, value);
        self
    }

    pub fn attr_opt<V: Into<String>>(self, name: impl Into<String>, value: Option<V>) -> Self {
        match value {
            Some(value) => self.attr(name, value),
            None => self,
        }
    }

    pub fn append(mut self, child: Element) -> Self {
        self.element.append_child(child);
        self
    }

    pub fn append_all(mut self, children: impl IntoIterator<Item = Element>) -> Self {
        for child in children {
            self.element.append_child(child);
        }
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.element.append_text(text);
        self
    }

    pub fn build(self) -> Element {
        self.element
    }
}

/// Assembles elements from a flat event sequence.
#[derive(Debug, Default)]
pub(crate) struct TreeBuilder {
    open: Vec<Element>,
}

impl TreeBuilder {
    pub(crate) fn depth(&self) -> usize {
        self.open.len()
    }

    /// Feeds one event; returns the element completed by it, if any.
    pub(crate) fn push(&mut self, event: StreamEvent) -> Result<Option<Element>, CodecError> {
        match event {
            StreamEvent::StartDocument | StreamEvent::EndDocument => Ok(None),
            StreamEvent::StartElement {
                prefix,
                name,
                namespace,
                attributes,
                attribute_namespaces,
            } => {
                self.open.push(Element {
                    prefix,
                    name,
                    namespace,
                    attributes,
                    attribute_namespaces,
                    children: Vec::new(),
                });
                Ok(None)
            }
            StreamEvent::Text(text) => {
                if let Some(parent) = self.open.last_mut() {
                    parent.append_text(text);
                }
                Ok(None)
            }
            StreamEvent::EndElement { name } => {
                let element = self.open.pop().ok_or_else(|| {
                    CodecError::Malformed(format!("unexpected end tag </{name}>"))
                })?;
                match self.open.last_mut() {
                    Some(parent) => {
                        parent.append_child(element);
                        Ok(None)
                    }
                    None => Ok(Some(element)),
                }
            }
        }
    }

    pub(crate) fn clear(&mut self) {
        self.open.clear();
    }
}
