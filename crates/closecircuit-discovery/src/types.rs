//! Typed match events produced by parsing discovery replies

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable identity of a discovered service (usually a `urn:uuid:` string)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointReference {
    pub address: String,
}

impl EndpointReference {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

impl fmt::Display for EndpointReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

/// One service answering a probe.
///
/// Token lists keep first-seen order with duplicates removed, so
/// [`ProbeMatch::first_xaddr`] is well defined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeMatch {
    /// Identity of the responding service
    pub endpoint_reference: EndpointReference,

    /// Advertised type tokens (e.g. "dn:NetworkVideoTransmitter")
    pub types: Vec<String>,

    /// Scope URIs
    pub scopes: Vec<String>,

    /// Transport addresses; never empty
    pub xaddrs: Vec<String>,

    /// Incremented by the service whenever its metadata changes
    pub metadata_version: u32,
}

/// One service answering a resolve request. Same shape as [`ProbeMatch`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveMatch {
    pub endpoint_reference: EndpointReference,
    pub types: Vec<String>,
    pub scopes: Vec<String>,
    pub xaddrs: Vec<String>,
    pub metadata_version: u32,
}

/// Common view over probe and resolve matches, used by the routing table.
pub trait MatchEvent {
    fn endpoint_reference(&self) -> &EndpointReference;

    fn xaddrs(&self) -> &[String];

    /// The address the routing table keys playback on
    fn first_xaddr(&self) -> Option<&str> {
        self.xaddrs().first().map(String::as_str)
    }
}

impl MatchEvent for ProbeMatch {
    fn endpoint_reference(&self) -> &EndpointReference {
        &self.endpoint_reference
    }

    fn xaddrs(&self) -> &[String] {
        &self.xaddrs
    }
}

impl MatchEvent for ResolveMatch {
    fn endpoint_reference(&self) -> &EndpointReference {
        &self.endpoint_reference
    }

    fn xaddrs(&self) -> &[String] {
        &self.xaddrs
    }
}

impl ProbeMatch {
    pub fn first_xaddr(&self) -> Option<&str> {
        MatchEvent::first_xaddr(self)
    }
}

impl ResolveMatch {
    pub fn first_xaddr(&self) -> Option<&str> {
        MatchEvent::first_xaddr(self)
    }
}

impl From<ResolveMatch> for ProbeMatch {
    fn from(m: ResolveMatch) -> Self {
        Self {
            endpoint_reference: m.endpoint_reference,
            types: m.types,
            scopes: m.scopes,
            xaddrs: m.xaddrs,
            metadata_version: m.metadata_version,
        }
    }
}

/// Splits a whitespace-separated token list, dropping repeats.
pub(crate) fn split_tokens(text: &str) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::new();
    for token in text.split_whitespace() {
        if !tokens.iter().any(|t| t == token) {
            tokens.push(token.to_string());
        }
    }
    tokens
}
