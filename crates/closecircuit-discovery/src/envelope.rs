//! WS-Discovery SOAP envelope codec.
//!
//! Inbound datagrams are parsed into a small namespace-aware element tree and
//! then interpreted by action. Elements are matched by namespace URI and local
//! name; prefixes are irrelevant. Both the 2004/2005 XML-SOAP namespaces and
//! the OASIS 2009 namespaces are accepted.
//!
//! Outbound probes always use the XML-SOAP variant, which every ONVIF device
//! answers.

use crate::types::{split_tokens, EndpointReference, ProbeMatch, ResolveMatch};
use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::name::{Namespace, ResolveResult};
use quick_xml::NsReader;
use std::fmt::Write;
use thiserror::Error;
use uuid::Uuid;

/// SOAP 1.2 envelope namespace
pub const SOAP_ENVELOPE_NS: &str = "http://www.w3.org/2003/05/soap-envelope";

/// WS-Addressing namespace used by WS-Discovery 2005/04
pub const ADDRESSING_NS: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing";

/// WS-Addressing 1.0 namespace used by WS-Discovery 1.1
pub const ADDRESSING_NS_OASIS: &str = "http://www.w3.org/2005/08/addressing";

/// WS-Discovery 2005/04 namespace
pub const DISCOVERY_NS: &str = "http://schemas.xmlsoap.org/ws/2005/04/discovery";

/// WS-Discovery 1.1 namespace
pub const DISCOVERY_NS_OASIS: &str = "http://docs.oasis-open.org/ws-dd/ns/discovery/2009/01";

/// Logical destination of multicast probes
pub const DISCOVERY_TO: &str = "urn:schemas-xmlsoap-org:ws:2005:04:discovery";

/// ONVIF network WSDL namespace (`dn:NetworkVideoTransmitter`)
pub const ONVIF_NETWORK_NS: &str = "http://www.onvif.org/ver10/network/wsdl";

/// ONVIF device WSDL namespace (`tds:Device`)
pub const ONVIF_DEVICE_NS: &str = "http://www.onvif.org/ver10/device/wsdl";

const ADDRESSING: &[&str] = &[ADDRESSING_NS, ADDRESSING_NS_OASIS];
const DISCOVERY: &[&str] = &[DISCOVERY_NS, DISCOVERY_NS_OASIS];
const SOAP: &[&str] = &[SOAP_ENVELOPE_NS];

/// Deepest element nesting accepted in an inbound datagram
pub const MAX_ELEMENT_DEPTH: usize = 64;

/// Errors produced while interpreting a discovery datagram.
///
/// These never leave the receive loop; the offending datagram is dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolParseError {
    #[error("XML parsing error: {0}")]
    Xml(String),

    #[error("Malformed XML: {0}")]
    Malformed(String),

    #[error("Datagram is not a SOAP envelope")]
    MissingEnvelope,

    #[error("Envelope has no Header element")]
    MissingHeader,

    #[error("Envelope has no Body element")]
    MissingBody,

    #[error("Header has no Action element")]
    MissingAction,

    #[error("Missing required element: {0}")]
    MissingElement(&'static str),

    #[error("Required element is empty: {0}")]
    EmptyElement(&'static str),

    #[error("Invalid metadata version: {0:?}")]
    InvalidMetadataVersion(String),
}

/// Discovery actions this client distinguishes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Hello,
    Bye,
    Probe,
    ProbeMatches,
    Resolve,
    ResolveMatches,
}

impl Action {
    /// Maps an action URI in either namespace variant
    pub fn from_uri(uri: &str) -> Option<Self> {
        let name = DISCOVERY
            .iter()
            .find_map(|ns| uri.strip_prefix(ns).and_then(|rest| rest.strip_prefix('/')))?;

        match name {
            "Hello" => Some(Action::Hello),
            "Bye" => Some(Action::Bye),
            "Probe" => Some(Action::Probe),
            "ProbeMatches" => Some(Action::ProbeMatches),
            "Resolve" => Some(Action::Resolve),
            "ResolveMatches" => Some(Action::ResolveMatches),
            _ => None,
        }
    }

    /// Action URI in the XML-SOAP namespace variant
    pub fn uri(&self) -> String {
        let name = match self {
            Action::Hello => "Hello",
            Action::Bye => "Bye",
            Action::Probe => "Probe",
            Action::ProbeMatches => "ProbeMatches",
            Action::Resolve => "Resolve",
            Action::ResolveMatches => "ResolveMatches",
        };
        format!("{}/{}", DISCOVERY_NS, name)
    }
}

/// A successfully interpreted datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryMessage {
    /// Service announcement; not acted upon
    Hello,
    /// Service departure; not acted upon
    Bye,
    /// Another client's probe
    Probe,
    /// Another client's resolve request
    Resolve,
    ProbeMatches(Vec<ProbeMatch>),
    ResolveMatches(Vec<ResolveMatch>),
    /// Well-formed envelope with an action we do not know
    Unrecognized(String),
}

/// Parses one datagram payload.
pub fn parse_message(data: &[u8]) -> Result<DiscoveryMessage, ProtocolParseError> {
    let envelope = parse_tree(data)?;
    if !envelope.is(SOAP, "Envelope") {
        return Err(ProtocolParseError::MissingEnvelope);
    }

    let header = envelope
        .child(SOAP, "Header")
        .ok_or(ProtocolParseError::MissingHeader)?;
    let body = envelope
        .child(SOAP, "Body")
        .ok_or(ProtocolParseError::MissingBody)?;

    let action = header
        .child(ADDRESSING, "Action")
        .map(|e| e.text.trim())
        .filter(|uri| !uri.is_empty())
        .ok_or(ProtocolParseError::MissingAction)?;

    let message = match Action::from_uri(action) {
        Some(Action::Hello) => DiscoveryMessage::Hello,
        Some(Action::Bye) => DiscoveryMessage::Bye,
        Some(Action::Probe) => DiscoveryMessage::Probe,
        Some(Action::Resolve) => DiscoveryMessage::Resolve,
        Some(Action::ProbeMatches) => {
            let container = body
                .child(DISCOVERY, "ProbeMatches")
                .ok_or(ProtocolParseError::MissingElement("ProbeMatches"))?;
            let matches = container
                .children(DISCOVERY, "ProbeMatch")
                .map(|m| parse_match(m).map(MatchFields::into_probe_match))
                .collect::<Result<Vec<_>, _>>()?;
            DiscoveryMessage::ProbeMatches(matches)
        }
        Some(Action::ResolveMatches) => {
            let container = body
                .child(DISCOVERY, "ResolveMatches")
                .ok_or(ProtocolParseError::MissingElement("ResolveMatches"))?;
            let matches = container
                .children(DISCOVERY, "ResolveMatch")
                .map(|m| parse_match(m).map(MatchFields::into_resolve_match))
                .collect::<Result<Vec<_>, _>>()?;
            DiscoveryMessage::ResolveMatches(matches)
        }
        None => DiscoveryMessage::Unrecognized(action.to_string()),
    };

    Ok(message)
}

/// Builds a multicast probe envelope.
///
/// `types` are qualified names such as `dn:NetworkVideoTransmitter`; the
/// `dn` and `tds` prefixes are declared on the envelope. An empty list sends
/// an unfiltered probe.
pub fn build_probe(message_id: &Uuid, types: &[String]) -> String {
    let mut xml = String::with_capacity(1024);

    xml.push_str(r#"<?xml version="1.0" encoding="UTF-8"?>"#);
    // Writing to a String cannot fail
    let _ = write!(
        xml,
        r#"<s:Envelope xmlns:s="{}" xmlns:a="{}" xmlns:d="{}" xmlns:dn="{}" xmlns:tds="{}">"#,
        SOAP_ENVELOPE_NS, ADDRESSING_NS, DISCOVERY_NS, ONVIF_NETWORK_NS, ONVIF_DEVICE_NS
    );

    xml.push_str("<s:Header>");
    let _ = write!(
        xml,
        r#"<a:Action s:mustUnderstand="1">{}</a:Action>"#,
        Action::Probe.uri()
    );
    let _ = write!(xml, "<a:MessageID>urn:uuid:{}</a:MessageID>", message_id);
    let _ = write!(xml, r#"<a:To s:mustUnderstand="1">{}</a:To>"#, DISCOVERY_TO);
    xml.push_str("</s:Header>");

    xml.push_str("<s:Body>");
    if types.is_empty() {
        xml.push_str("<d:Probe/>");
    } else {
        let joined = types.join(" ");
        let _ = write!(xml, "<d:Probe><d:Types>{}</d:Types></d:Probe>", escape(joined.as_str()));
    }
    xml.push_str("</s:Body></s:Envelope>");

    xml
}

struct MatchFields {
    endpoint_reference: EndpointReference,
    types: Vec<String>,
    scopes: Vec<String>,
    xaddrs: Vec<String>,
    metadata_version: u32,
}

impl MatchFields {
    fn into_probe_match(self) -> ProbeMatch {
        ProbeMatch {
            endpoint_reference: self.endpoint_reference,
            types: self.types,
            scopes: self.scopes,
            xaddrs: self.xaddrs,
            metadata_version: self.metadata_version,
        }
    }

    fn into_resolve_match(self) -> ResolveMatch {
        ResolveMatch {
            endpoint_reference: self.endpoint_reference,
            types: self.types,
            scopes: self.scopes,
            xaddrs: self.xaddrs,
            metadata_version: self.metadata_version,
        }
    }
}

fn parse_match(element: &Element) -> Result<MatchFields, ProtocolParseError> {
    let address = element
        .find(ADDRESSING, "EndpointReference")
        .and_then(|epr| epr.find(ADDRESSING, "Address"))
        .ok_or(ProtocolParseError::MissingElement("Address"))?
        .text
        .trim();
    if address.is_empty() {
        return Err(ProtocolParseError::EmptyElement("Address"));
    }

    let types = element
        .find(DISCOVERY, "Types")
        .ok_or(ProtocolParseError::MissingElement("Types"))?;
    let scopes = element
        .find(DISCOVERY, "Scopes")
        .ok_or(ProtocolParseError::MissingElement("Scopes"))?;

    let xaddrs = split_tokens(
        &element
            .find(DISCOVERY, "XAddrs")
            .ok_or(ProtocolParseError::MissingElement("XAddrs"))?
            .text,
    );
    if xaddrs.is_empty() {
        return Err(ProtocolParseError::EmptyElement("XAddrs"));
    }

    let version = element
        .find(DISCOVERY, "MetadataVersion")
        .ok_or(ProtocolParseError::MissingElement("MetadataVersion"))?
        .text
        .trim();
    let metadata_version = version
        .parse::<u32>()
        .map_err(|_| ProtocolParseError::InvalidMetadataVersion(version.to_string()))?;

    Ok(MatchFields {
        endpoint_reference: EndpointReference::new(address),
        types: split_tokens(&types.text),
        scopes: split_tokens(&scopes.text),
        xaddrs,
        metadata_version,
    })
}

/// Namespace-resolved element with its concatenated text content
#[derive(Debug, Default)]
struct Element {
    namespace: Option<String>,
    name: String,
    text: String,
    children: Vec<Element>,
}

impl Element {
    fn new(ns: &ResolveResult<'_>, local_name: &[u8]) -> Self {
        let namespace = match ns {
            ResolveResult::Bound(Namespace(uri)) => Some(String::from_utf8_lossy(uri).into_owned()),
            _ => None,
        };

        Self {
            namespace,
            name: String::from_utf8_lossy(local_name).into_owned(),
            ..Default::default()
        }
    }

    fn is(&self, namespaces: &[&str], name: &str) -> bool {
        self.name == name
            && self
                .namespace
                .as_deref()
                .is_some_and(|ns| namespaces.contains(&ns))
    }

    fn child(&self, namespaces: &[&str], name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.is(namespaces, name))
    }

    fn children<'a>(
        &'a self,
        namespaces: &'a [&'a str],
        name: &'a str,
    ) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.is(namespaces, name))
    }

    /// Depth-first search among descendants
    fn find(&self, namespaces: &[&str], name: &str) -> Option<&Element> {
        self.children.iter().find_map(|c| {
            if c.is(namespaces, name) {
                Some(c)
            } else {
                c.find(namespaces, name)
            }
        })
    }
}

fn parse_tree(data: &[u8]) -> Result<Element, ProtocolParseError> {
    let mut reader = NsReader::from_reader(data);
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut stack: Vec<Element> = Vec::new();
    let mut root: Option<Element> = None;

    loop {
        let (ns, event) = reader
            .read_resolved_event_into(&mut buf)
            .map_err(|e| ProtocolParseError::Xml(e.to_string()))?;

        match event {
            Event::Start(e) => {
                if stack.len() >= MAX_ELEMENT_DEPTH {
                    return Err(ProtocolParseError::Malformed(format!(
                        "element nesting exceeds {} levels",
                        MAX_ELEMENT_DEPTH
                    )));
                }
                stack.push(Element::new(&ns, e.local_name().as_ref()));
            }
            Event::Empty(e) => {
                let element = Element::new(&ns, e.local_name().as_ref());
                attach(&mut stack, &mut root, element)?;
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| ProtocolParseError::Malformed("unbalanced end tag".to_string()))?;
                attach(&mut stack, &mut root, element)?;
            }
            Event::Text(t) => {
                if let Some(top) = stack.last_mut() {
                    let text = t
                        .unescape()
                        .map_err(|e| ProtocolParseError::Xml(e.to_string()))?;
                    top.text.push_str(&text);
                }
            }
            Event::CData(c) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&c));
                }
            }
            Event::Eof => break,
            _ => {}
        }

        buf.clear();
    }

    if !stack.is_empty() {
        return Err(ProtocolParseError::Malformed(
            "document ended inside an element".to_string(),
        ));
    }

    root.ok_or(ProtocolParseError::MissingEnvelope)
}

fn attach(
    stack: &mut [Element],
    root: &mut Option<Element>,
    element: Element,
) -> Result<(), ProtocolParseError> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None if root.is_none() => *root = Some(element),
        None => {
            return Err(ProtocolParseError::Malformed(
                "more than one root element".to_string(),
            ))
        }
    }
    Ok(())
}
