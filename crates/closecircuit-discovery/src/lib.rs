//! WS-Discovery for network video transmitters
//!
//! This crate finds cameras on the local link and keeps track of which of them
//! are still answering:
//! - Multicast WS-Discovery probes over IPv4 and IPv6 (port 3702)
//! - Parsing of ProbeMatches / ResolveMatches replies into typed events
//! - A routing table that turns match events into a live set of playback URLs
//!
//! # Architecture
//!
//! The [`DiscoveryClient`] owns the multicast sockets and runs two background
//! tasks while listening:
//! 1. A receive loop that parses every datagram and broadcasts its matches
//! 2. A probe loop that re-announces interest at a fixed interval
//!
//! [`routing::spawn`] consumes the probe match stream and publishes a
//! [`ReachableStreamSet`] snapshot whenever the set of live endpoints changes.
//! Endpoints that stay silent for longer than the delinquency interval drop
//! out of the set until they answer again.
//!
//! # Example
//!
//! ```no_run
//! use closecircuit_core::{DiscoveryConfig, RoutingConfig};
//! use closecircuit_discovery::{interface, routing, DiscoveryClient};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DiscoveryConfig::default();
//!     let cancel = CancellationToken::new();
//!     let iface = interface::resolve("wlan0", &config.interface_retry, &cancel).await?;
//!
//!     let mut client = DiscoveryClient::new(config);
//!     let table = routing::spawn(client.probe_matches(), &RoutingConfig::default(), cancel.child_token());
//!     client.initialize(iface).await?;
//!
//!     let mut reachable = table.subscribe();
//!     while reachable.changed().await.is_ok() {
//!         println!("{:?}", *reachable.borrow_and_update());
//!     }
//!
//!     client.close().await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod envelope;
pub mod error;
pub mod interface;
pub mod routing;
pub mod types;

pub use client::DiscoveryClient;
pub use envelope::{parse_message, DiscoveryMessage, ProtocolParseError};
pub use error::{DiscoveryError, Result};
pub use interface::NetworkInterface;
pub use routing::{ReachableStreamSet, RoutingTable, RoutingTableHandle};
pub use types::{EndpointReference, MatchEvent, ProbeMatch, ResolveMatch};
