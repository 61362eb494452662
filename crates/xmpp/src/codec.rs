//! Incremental decoding of XMPP's long-lived XML document.
//!
//! [`XmlStreamCodec`] turns arbitrarily fragmented bytes into namespace-resolved
//! [`StreamEvent`]s. [`XmppCodec`] layers stream framing on top of it and yields
//! the stream header, one complete top-level element per stanza, and the
//! stream close.

use std::collections::VecDeque;

use bytes::BytesMut;
use quick_xml::Reader;
use quick_xml::escape::{escape, unescape};
use quick_xml::events::Event;
use tokio_util::codec::{Decoder, Encoder};

use crate::element::{Element, TreeBuilder};
use crate::error::CodecError;
use crate::ns;

/// Upper bound for a single tag or text run held while waiting for more input.
pub const MAX_TOKEN_SIZE: usize = 1024 * 1024;

const COMMENT_OPEN: &[u8] = b"<!--";
const CDATA_OPEN: &[u8] = b"<![CDATA[";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    StartDocument,
    StartElement {
        prefix: Option<String>,
        name: String,
        namespace: String,
        /// Attributes as written, including namespace declarations.
        attributes: Vec<(String, String)>,
        /// Resolved namespace of each prefix used by an attribute.
        attribute_namespaces: Vec<(String, String)>,
    },
    Text(String),
    EndElement {
        name: String,
    },
    EndDocument,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Text,
    StartTag,
    EndTag,
    Declaration,
    CData,
}

#[derive(Debug)]
struct Scope {
    qname: String,
    bindings: Vec<(Option<String>, String)>,
}

#[derive(Debug)]
pub struct XmlStreamCodec {
    scopes: Vec<Scope>,
    pending: VecDeque<StreamEvent>,
    started: bool,
    finished: bool,
    max_token_size: usize,
}

impl Default for XmlStreamCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl XmlStreamCodec {
    pub fn new() -> Self {
        Self {
            scopes: Vec::new(),
            pending: VecDeque::new(),
            started: false,
            finished: false,
            max_token_size: MAX_TOKEN_SIZE,
        }
    }

    pub fn with_max_token_size(mut self, max_token_size: usize) -> Self {
        self.max_token_size = max_token_size;
        self
    }

    /// Forgets all document state, as required after StartTLS and SASL.
    pub fn reset(&mut self) {
        self.scopes.clear();
        self.pending.clear();
        self.started = false;
        self.finished = false;
    }

    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    fn scan(&self, src: &[u8]) -> Result<Option<(TokenKind, usize)>, CodecError> {
        let found = scan_token(src)?;
        let too_large = match found {
            Some((_, len)) => len > self.max_token_size,
            None => src.len() > self.max_token_size,
        };
        if too_large {
            return Err(CodecError::TokenTooLarge {
                limit: self.max_token_size,
            });
        }
        Ok(found)
    }

    fn process(&mut self, kind: TokenKind, token: &str) -> Result<(), CodecError> {
        match kind {
            TokenKind::Text => self.process_text(token),
            TokenKind::CData => {
                let inner = &token[CDATA_OPEN.len()..token.len() - 3];
                if self.scopes.is_empty() {
                    return Err(CodecError::Malformed(
                        "character data outside the root element".to_string(),
                    ));
                }
                self.pending.push_back(StreamEvent::Text(inner.to_string()));
                Ok(())
            }
            TokenKind::Declaration => {
                let is_xml_decl = token
                    .strip_prefix("<?xml")
                    .and_then(|rest| rest.chars().next())
                    .is_some_and(|next| next.is_whitespace() || next == '?');
                if !is_xml_decl || self.started {
                    return Err(CodecError::Restricted("processing instructions"));
                }
                self.start_document();
                Ok(())
            }
            TokenKind::EndTag => self.process_end_tag(token),
            TokenKind::StartTag => self.process_start_tag(token),
        }
    }

    fn start_document(&mut self) {
        if !self.started {
            self.started = true;
            self.pending.push_back(StreamEvent::StartDocument);
        }
    }

    fn process_text(&mut self, token: &str) -> Result<(), CodecError> {
        if self.scopes.is_empty() {
            if token.trim().is_empty() {
                return Ok(());
            }
            return Err(CodecError::Malformed(
                "text outside the root element".to_string(),
            ));
        }

        let text = unescape(token).map_err(|error| CodecError::Malformed(error.to_string()))?;
        self.pending.push_back(StreamEvent::Text(text.into_owned()));
        Ok(())
    }

    fn process_end_tag(&mut self, token: &str) -> Result<(), CodecError> {
        let qname = token[2..token.len() - 1].trim();
        let scope = self
            .scopes
            .pop()
            .ok_or_else(|| CodecError::Malformed(format!("unexpected end tag </{qname}>")))?;
        if scope.qname != qname {
            return Err(CodecError::MismatchedEndTag {
                expected: scope.qname,
                found: qname.to_string(),
            });
        }

        self.close_element(local_name(qname));
        Ok(())
    }

    fn close_element(&mut self, name: &str) {
        self.pending.push_back(StreamEvent::EndElement {
            name: name.to_string(),
        });
        if self.scopes.is_empty() {
            self.pending.push_back(StreamEvent::EndDocument);
            self.finished = true;
        }
    }

    fn process_start_tag(&mut self, token: &str) -> Result<(), CodecError> {
        let mut reader = Reader::from_str(token);
        reader.config_mut().check_end_names = false;

        let (start, empty) = match reader.read_event() {
            Ok(Event::Start(start)) => (start, false),
            Ok(Event::Empty(start)) => (start, true),
            Ok(other) => {
                return Err(CodecError::Malformed(format!(
                    "expected a start tag, found {other:?}"
                )));
            }
            Err(error) => return Err(CodecError::Malformed(error.to_string())),
        };

        let qname = std::str::from_utf8(start.name().as_ref())
            .map_err(|_| CodecError::InvalidUtf8)?
            .to_string();

        let mut attributes = Vec::new();
        for attribute in start.attributes() {
            let attribute =
                attribute.map_err(|error| CodecError::Malformed(error.to_string()))?;
            let key = std::str::from_utf8(attribute.key.as_ref())
                .map_err(|_| CodecError::InvalidUtf8)?
                .to_string();
            let value = attribute
                .unescape_value()
                .map_err(|error| CodecError::Malformed(error.to_string()))?
                .into_owned();
            attributes.push((key, value));
        }

        let mut bindings = Vec::new();
        for (key, value) in &attributes {
            if key == "xmlns" {
                bindings.push((None, value.clone()));
            } else if let Some(prefix) = key.strip_prefix("xmlns:") {
                if value.is_empty() {
                    return Err(CodecError::Malformed(format!(
                        "prefix '{prefix}' bound to an empty namespace"
                    )));
                }
                bindings.push((Some(prefix.to_string()), value.clone()));
            }
        }

        let (prefix, name) = match qname.split_once(':') {
            Some((prefix, name)) => (Some(prefix), name),
            None => (None, qname.as_str()),
        };
        let namespace = self
            .resolve(prefix, &bindings)
            .ok_or_else(|| CodecError::UnboundPrefix(prefix.unwrap_or_default().to_string()))?;

        let mut attribute_namespaces: Vec<(String, String)> = Vec::new();
        for (key, _) in &attributes {
            let Some((attr_prefix, _)) = key.split_once(':') else {
                continue;
            };
            if attr_prefix == "xmlns" {
                continue;
            }
            let attr_ns = self
                .resolve(Some(attr_prefix), &bindings)
                .ok_or_else(|| CodecError::UnboundPrefix(attr_prefix.to_string()))?;
            if attr_prefix != "xml" && !attribute_namespaces.iter().any(|(known, _)| known == attr_prefix) {
                attribute_namespaces.push((attr_prefix.to_string(), attr_ns));
            }
        }

        self.start_document();
        self.pending.push_back(StreamEvent::StartElement {
            prefix: prefix.map(str::to_string),
            name: name.to_string(),
            namespace,
            attributes,
            attribute_namespaces,
        });

        if empty {
            let name = name.to_string();
            self.close_element(&name);
        } else {
            self.scopes.push(Scope { qname, bindings });
        }
        Ok(())
    }

    fn resolve(
        &self,
        prefix: Option<&str>,
        local: &[(Option<String>, String)],
    ) -> Option<String> {
        if prefix == Some("xml") {
            return Some(ns::XML.to_string());
        }

        let lookup = |bindings: &[(Option<String>, String)]| {
            bindings
                .iter()
                .rev()
                .find(|(bound, _)| bound.as_deref() == prefix)
                .map(|(_, namespace)| namespace.clone())
        };

        lookup(local)
            .or_else(|| self.scopes.iter().rev().find_map(|scope| lookup(&scope.bindings)))
            .or_else(|| prefix.is_none().then(String::new))
    }
}

impl Decoder for XmlStreamCodec {
    type Item = StreamEvent;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Ok(Some(event));
            }
            if self.finished || src.is_empty() {
                return Ok(None);
            }

            let Some((kind, len)) = self.scan(src)? else {
                return Ok(None);
            };
            let raw = src.split_to(len);
            let token = std::str::from_utf8(&raw).map_err(|_| CodecError::InvalidUtf8)?;
            self.process(kind, token)?;
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(event) = self.decode(src)? {
            return Ok(Some(event));
        }
        if self.finished || src.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        Err(CodecError::Malformed(
            "stream ended inside an XML token".to_string(),
        ))
    }
}

fn local_name(qname: &str) -> &str {
    qname.split_once(':').map_or(qname, |(_, local)| local)
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|offset| from + offset)
}

/// Locates the end of the next complete token, or `None` if more input is needed.
fn scan_token(src: &[u8]) -> Result<Option<(TokenKind, usize)>, CodecError> {
    if src.first() != Some(&b'<') {
        return Ok(src
            .iter()
            .position(|&byte| byte == b'<')
            .map(|end| (TokenKind::Text, end)));
    }
    if src.len() < 2 {
        return Ok(None);
    }

    match src[1] {
        b'?' => Ok(find(src, b"?>", 2).map(|end| (TokenKind::Declaration, end + 2))),
        b'!' => {
            if src.starts_with(COMMENT_OPEN) {
                return Err(CodecError::Restricted("comments"));
            }
            if src.starts_with(CDATA_OPEN) {
                return Ok(find(src, b"]]>", CDATA_OPEN.len()).map(|end| (TokenKind::CData, end + 3)));
            }
            if COMMENT_OPEN.starts_with(src) || CDATA_OPEN.starts_with(src) {
                return Ok(None);
            }
            Err(CodecError::Restricted("document type declarations"))
        }
        b'/' => Ok(find(src, b">", 2).map(|end| (TokenKind::EndTag, end + 1))),
        _ => {
            let mut quote = None;
            for (index, &byte) in src.iter().enumerate().skip(1) {
                match quote {
                    Some(open) if byte == open => quote = None,
                    Some(_) => {}
                    None if byte == b'"' || byte == b'\'' => quote = Some(byte),
                    None if byte == b'>' => return Ok(Some((TokenKind::StartTag, index + 1))),
                    None => {}
                }
            }
            Ok(None)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamHeader {
    pub to: Option<String>,
    pub from: Option<String>,
    pub id: Option<String>,
    pub version: Option<String>,
    pub lang: Option<String>,
}

impl StreamHeader {
    /// Header a client sends to open a stream with `domain`.
    pub fn client(domain: impl Into<String>) -> Self {
        Self {
            to: Some(domain.into()),
            version: Some("1.0".to_string()),
            ..Self::default()
        }
    }

    pub fn with_from(mut self, from: Option<String>) -> Self {
        self.from = from;
        self
    }

    pub fn with_lang(mut self, lang: Option<String>) -> Self {
        self.lang = lang;
        self
    }

    pub fn from_attributes(attributes: &[(String, String)]) -> Self {
        let mut header = StreamHeader::default();
        for (key, value) in attributes {
            let slot = match key.as_str() {
                "to" => &mut header.to,
                "from" => &mut header.from,
                "id" => &mut header.id,
                "version" => &mut header.version,
                "xml:lang" => &mut header.lang,
                _ => continue,
            };
            *slot = Some(value.clone());
        }
        header
    }

    pub fn to_xml(&self) -> String {
        let mut xml = format!(
            "<?xml version='1.0'?><stream:stream xmlns='{}' xmlns:stream='{}'",
            ns::CLIENT,
            ns::STREAM
        );
        for (key, value) in [
            ("from", &self.from),
            ("to", &self.to),
            ("id", &self.id),
            ("version", &self.version),
            ("xml:lang", &self.lang),
        ] {
            if let Some(value) = value {
                xml.push_str(&format!(" {key}='{}'", escape(value.as_str())));
            }
        }
        xml.push('>');
        xml
    }
}

pub const STREAM_CLOSE: &str = "</stream:stream>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    StreamStart(StreamHeader),
    Stanza(Element),
    StreamEnd,
}

#[derive(Debug, Default)]
pub struct XmppCodec {
    tokens: XmlStreamCodec,
    tree: TreeBuilder,
    stream_open: bool,
}

impl XmppCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.tokens.reset();
        self.tree.clear();
        self.stream_open = false;
    }
}

impl Decoder for XmppCodec {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        while let Some(event) = self.tokens.decode(src)? {
            match event {
                StreamEvent::StartDocument | StreamEvent::EndDocument => {}
                StreamEvent::StartElement {
                    name,
                    namespace,
                    attributes,
                    ..
                } if !self.stream_open => {
                    if name != "stream" || namespace != ns::STREAM {
                        return Err(CodecError::UnexpectedRoot(name));
                    }
                    self.stream_open = true;
                    return Ok(Some(Packet::StreamStart(StreamHeader::from_attributes(
                        &attributes,
                    ))));
                }
                StreamEvent::EndElement { .. } if self.tree.depth() == 0 => {
                    self.stream_open = false;
                    return Ok(Some(Packet::StreamEnd));
                }
                StreamEvent::Text(text) if self.tree.depth() == 0 => {
                    if !text.trim().is_empty() {
                        return Err(CodecError::Malformed(
                            "text between stanzas".to_string(),
                        ));
                    }
                }
                event => {
                    if let Some(element) = self.tree.push(event)? {
                        return Ok(Some(Packet::Stanza(element)));
                    }
                }
            }
        }
        Ok(None)
    }
}

impl Encoder<Packet> for XmppCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let xml = match item {
            Packet::StreamStart(header) => header.to_xml(),
            Packet::Stanza(element) => element.to_xml_in(ns::CLIENT),
            Packet::StreamEnd => STREAM_CLOSE.to_string(),
        };
        dst.extend_from_slice(xml.as_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' from='example.com' id='s1' version='1.0'>";

    fn decode_all(codec: &mut XmlStreamCodec, input: &[u8]) -> Result<Vec<StreamEvent>, CodecError> {
        let mut buffer = BytesMut::from(input);
        let mut events = Vec::new();
        while let Some(event) = codec.decode(&mut buffer)? {
            events.push(event);
        }
        Ok(events)
    }

    fn decode_byte_by_byte(input: &[u8]) -> Result<Vec<StreamEvent>, CodecError> {
        let mut codec = XmlStreamCodec::new();
        let mut buffer = BytesMut::new();
        let mut events = Vec::new();
        for byte in input {
            buffer.extend_from_slice(&[*byte]);
            while let Some(event) = codec.decode(&mut buffer)? {
                events.push(event);
            }
        }
        Ok(events)
    }

    #[test]
    fn fragmented_input_yields_same_events_as_whole_input() {
        let input = format!(
            "{HEADER}<message to='a@b' id='m1'><body>caf\u{e9} &amp; cr\u{e8}me</body></message> <iq type='get' id='i1'><ping xmlns='urn:xmpp:ping'/></iq>"
        );

        let whole = decode_all(&mut XmlStreamCodec::new(), input.as_bytes())
            .expect("whole input should decode");
        let fragmented =
            decode_byte_by_byte(input.as_bytes()).expect("fragmented input should decode");

        assert_eq!(whole, fragmented);
        assert!(whole.contains(&StreamEvent::Text("caf\u{e9} & cr\u{e8}me".to_string())));
    }

    #[test]
    fn partial_tag_produces_no_event() {
        let mut codec = XmlStreamCodec::new();
        let mut buffer = BytesMut::from(&b"<stream:stream xmlns:stream='http://etherx.jabber.org/streams' to='exa"[..]);
        assert_eq!(codec.decode(&mut buffer).expect("partial input is not an error"), None);

        buffer.extend_from_slice(b"mple.com'>");
        assert_eq!(
            codec.decode(&mut buffer).expect("complete tag should decode"),
            Some(StreamEvent::StartDocument)
        );
        assert!(matches!(
            codec.decode(&mut buffer),
            Ok(Some(StreamEvent::StartElement { ref name, .. })) if name == "stream"
        ));
    }

    #[test]
    fn namespaces_resolve_through_open_scopes() {
        let events = decode_all(
            &mut XmlStreamCodec::new(),
            format!("{HEADER}<stream:features><mechanisms xmlns='urn:ietf:params:xml:ns:xmpp-sasl'><mechanism>PLAIN</mechanism></mechanisms></stream:features>").as_bytes(),
        )
        .expect("stream should decode");

        let namespaces: Vec<(&str, &str)> = events
            .iter()
            .filter_map(|event| match event {
                StreamEvent::StartElement { name, namespace, .. } => {
                    Some((name.as_str(), namespace.as_str()))
                }
                _ => None,
            })
            .collect();

        assert_eq!(
            namespaces,
            vec![
                ("stream", ns::STREAM),
                ("features", ns::STREAM),
                ("mechanisms", ns::SASL),
                ("mechanism", ns::SASL),
            ]
        );
    }

    #[test]
    fn unbound_prefix_is_rejected() {
        let result = decode_all(&mut XmlStreamCodec::new(), b"<foo:bar/>");
        assert_eq!(result, Err(CodecError::UnboundPrefix("foo".to_string())));
    }

    #[test]
    fn restricted_constructs_are_rejected() {
        assert_eq!(
            decode_all(&mut XmlStreamCodec::new(), b"<a><!-- hi --></a>"),
            Err(CodecError::Restricted("comments"))
        );
        assert_eq!(
            decode_all(&mut XmlStreamCodec::new(), b"<!DOCTYPE a><a/>"),
            Err(CodecError::Restricted("document type declarations"))
        );
        assert_eq!(
            decode_all(&mut XmlStreamCodec::new(), b"<a><?pi data?></a>"),
            Err(CodecError::Restricted("processing instructions"))
        );
    }

    #[test]
    fn mismatched_end_tag_is_rejected() {
        let result = decode_all(&mut XmlStreamCodec::new(), b"<a><b></a>");
        assert_eq!(
            result,
            Err(CodecError::MismatchedEndTag {
                expected: "b".to_string(),
                found: "a".to_string(),
            })
        );
    }

    #[test]
    fn oversized_token_is_rejected() {
        let mut codec = XmlStreamCodec::new().with_max_token_size(16);
        let result = decode_all(&mut codec, b"<a attribute='far too long for the limit'");
        assert_eq!(result, Err(CodecError::TokenTooLarge { limit: 16 }));
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let result = decode_all(&mut XmlStreamCodec::new(), b"<a>\xff\xfe</a>");
        assert_eq!(result, Err(CodecError::InvalidUtf8));
    }

    #[test]
    fn cdata_becomes_text() {
        let events = decode_all(&mut XmlStreamCodec::new(), b"<a><![CDATA[<b>&]]></a>")
            .expect("CDATA should decode");
        assert!(events.contains(&StreamEvent::Text("<b>&".to_string())));
    }

    #[test]
    fn stream_codec_yields_header_stanzas_and_close() {
        let mut codec = XmppCodec::new();
        let mut buffer = BytesMut::from(
            format!("{HEADER}\n<presence/> \n<message id='1'><body>hi</body></message></stream:stream>").as_bytes(),
        );

        let mut packets = Vec::new();
        while let Some(packet) = codec.decode(&mut buffer).expect("stream should decode") {
            packets.push(packet);
        }

        assert_eq!(packets.len(), 4);
        assert!(matches!(
            &packets[0],
            Packet::StreamStart(header) if header.id.as_deref() == Some("s1")
                && header.from.as_deref() == Some("example.com")
        ));
        assert!(matches!(&packets[1], Packet::Stanza(element) if element.is("presence", ns::CLIENT)));
        match &packets[2] {
            Packet::Stanza(element) => {
                assert_eq!(element.to_xml_in(ns::CLIENT), "<message id='1'><body>hi</body></message>");
            }
            other => panic!("expected a stanza, got {other:?}"),
        }
        assert_eq!(packets[3], Packet::StreamEnd);
    }

    #[test]
    fn stream_codec_rejects_non_stream_root() {
        let mut codec = XmppCodec::new();
        let mut buffer = BytesMut::from(&b"<html>"[..]);
        assert_eq!(
            codec.decode(&mut buffer),
            Err(CodecError::UnexpectedRoot("html".to_string()))
        );
    }

    #[test]
    fn reset_allows_a_new_stream_header() {
        let mut codec = XmppCodec::new();
        let mut buffer = BytesMut::from(HEADER.as_bytes());
        assert!(matches!(codec.decode(&mut buffer), Ok(Some(Packet::StreamStart(_)))));

        codec.reset();
        buffer.extend_from_slice(HEADER.as_bytes());
        assert!(matches!(codec.decode(&mut buffer), Ok(Some(Packet::StreamStart(_)))));
    }

    #[test]
    fn encoder_writes_client_header_and_stanzas() {
        let mut codec = XmppCodec::new();
        let mut out = BytesMut::new();
        codec
            .encode(Packet::StreamStart(StreamHeader::client("example.com")), &mut out)
            .expect("header should encode");
        codec
            .encode(
                Packet::Stanza(Element::builder("presence", ns::CLIENT).build()),
                &mut out,
            )
            .expect("stanza should encode");
        codec.encode(Packet::StreamEnd, &mut out).expect("close should encode");

        assert_eq!(
            std::str::from_utf8(&out).expect("encoder output is UTF-8"),
            "<?xml version='1.0'?><stream:stream xmlns='jabber:client' xmlns:stream='http://etherx.jabber.org/streams' to='example.com' version='1.0'><presence/></stream:stream>"
        );
    }
}
