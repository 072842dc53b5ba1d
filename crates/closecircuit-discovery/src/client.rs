//! WS-Discovery client.
//!
//! The client keeps a multicast presence on one network interface, probes for
//! services periodically and publishes every parsed match on broadcast
//! channels. It owns at most one [`SocketBinding`] at a time; rebinding tears
//! the previous one down completely before the new sockets are created.

use crate::envelope::{build_probe, parse_message, DiscoveryMessage};
use crate::error::{DiscoveryError, Result};
use crate::interface::NetworkInterface;
use crate::types::{ProbeMatch, ResolveMatch};
use closecircuit_core::DiscoveryConfig;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

/// IPv4 WS-Discovery multicast group
pub const IPV4_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);

/// IPv6 link-local WS-Discovery multicast group
pub const IPV6_MULTICAST_GROUP: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 0x000c);

/// Largest possible UDP payload over IPv4
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Maximum number of events buffered per subscriber
const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// Discovery client bound to at most one interface at a time
pub struct DiscoveryClient {
    /// Configuration
    config: DiscoveryConfig,

    /// Probe match event channel
    probe_tx: broadcast::Sender<ProbeMatch>,

    /// Resolve match event channel
    resolve_tx: broadcast::Sender<ResolveMatch>,

    /// Live binding while listening
    binding: Option<SocketBinding>,
}

/// Sockets plus the tasks serving them
struct SocketBinding {
    transport: Arc<Transport>,
    cancel: CancellationToken,
    receive_task: JoinHandle<()>,
    probe_task: Option<JoinHandle<()>>,
}

impl DiscoveryClient {
    /// Creates an uninitialized client
    pub fn new(config: DiscoveryConfig) -> Self {
        let (probe_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (resolve_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Self {
            config,
            probe_tx,
            resolve_tx,
            binding: None,
        }
    }

    /// Binds to `interface`, starts listening and sends the first probe.
    #[instrument(skip(self, interface), fields(interface = %interface.name))]
    pub async fn initialize(&mut self, interface: NetworkInterface) -> Result<()> {
        if self.binding.is_some() {
            return Err(DiscoveryError::AlreadyInitialized);
        }

        let transport = Arc::new(Transport::bind(interface, &self.config)?);
        let cancel = CancellationToken::new();

        let receive_task = tokio::spawn(receive_loop(
            Arc::clone(&transport),
            EventSink {
                probe_tx: self.probe_tx.clone(),
                resolve_tx: self.resolve_tx.clone(),
            },
            self.config.receive_timeout(),
            cancel.clone(),
        ));

        transport.send_probe(&self.config.probe_types).await;

        let probe_task = self.config.probe_interval().map(|interval| {
            tokio::spawn(probe_loop(
                Arc::clone(&transport),
                self.config.probe_types.clone(),
                interval,
                cancel.clone(),
            ))
        });

        info!(
            ipv4 = transport.v4.is_some(),
            ipv6 = transport.v6.is_some(),
            probe_interval_ms = self.config.probe_interval_ms,
            "Discovery client listening"
        );

        self.binding = Some(SocketBinding {
            transport,
            cancel,
            receive_task,
            probe_task,
        });

        Ok(())
    }

    /// Closes the current binding (if any) and binds to `interface`
    pub async fn reinitialize(&mut self, interface: NetworkInterface) -> Result<()> {
        if self.binding.is_some() {
            self.close().await?;
        }
        self.initialize(interface).await
    }

    /// Stops both tasks, waits for them, then leaves the groups and closes the sockets.
    #[instrument(skip(self))]
    pub async fn close(&mut self) -> Result<()> {
        let binding = self.binding.take().ok_or(DiscoveryError::NotInitialized)?;

        binding.cancel.cancel();

        if let Some(probe_task) = binding.probe_task {
            if let Err(e) = probe_task.await {
                error!(error = %e, "Probe task failed");
            }
        }
        if let Err(e) = binding.receive_task.await {
            error!(error = %e, "Receive task failed");
        }

        binding.transport.leave_groups();
        drop(binding.transport);

        info!("Discovery client closed");
        Ok(())
    }

    /// Multicasts one probe. Returns the number of groups it was sent to.
    pub async fn dispatch_probe(&self) -> Result<usize> {
        let binding = self.binding.as_ref().ok_or(DiscoveryError::NotInitialized)?;
        Ok(binding.transport.send_probe(&self.config.probe_types).await)
    }

    /// Returns whether the client currently holds a binding
    pub fn is_listening(&self) -> bool {
        self.binding.is_some()
    }

    /// The interface the client is bound to
    pub fn interface(&self) -> Option<&NetworkInterface> {
        self.binding.as_ref().map(|b| &b.transport.interface)
    }

    /// Local addresses of the bound sockets
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        let Some(binding) = &self.binding else {
            return Vec::new();
        };
        [binding.transport.v4.as_ref(), binding.transport.v6.as_ref()]
            .into_iter()
            .flatten()
            .filter_map(|s| s.socket.local_addr().ok())
            .collect()
    }

    /// Subscribes to probe match events
    pub fn probe_matches(&self) -> broadcast::Receiver<ProbeMatch> {
        self.probe_tx.subscribe()
    }

    /// Subscribes to resolve match events
    pub fn resolve_matches(&self) -> broadcast::Receiver<ResolveMatch> {
        self.resolve_tx.subscribe()
    }
}

impl Drop for DiscoveryClient {
    fn drop(&mut self) {
        if let Some(binding) = &self.binding {
            warn!("DiscoveryClient dropped while listening, call close() for an orderly shutdown");
            binding.cancel.cancel();
        }
    }
}

/// One bound socket and whether it joined its group
struct FamilySocket {
    socket: UdpSocket,
    joined: bool,
}

/// IPv4 and IPv6 sockets for one interface
struct Transport {
    interface: NetworkInterface,
    port: u16,
    v4: Option<FamilySocket>,
    v6: Option<FamilySocket>,
}

impl Transport {
    fn bind(interface: NetworkInterface, config: &DiscoveryConfig) -> Result<Self> {
        let mut v4 = None;
        let mut v6 = None;

        if interface.supports_multicast_v4() {
            match bind_v4(&interface, config, true) {
                Ok(socket) => v4 = Some(socket),
                Err(e) => warn!(error = %e, "IPv4 discovery socket unavailable"),
            }
        }

        if interface.supports_multicast_v6() {
            match bind_v6(&interface, config) {
                Ok(socket) => v6 = Some(socket),
                Err(e) => warn!(error = %e, "IPv6 discovery socket unavailable"),
            }
        }

        if !interface.supports_multicast_v4() && !interface.supports_multicast_v6() {
            warn!(
                interface = %interface.name,
                "Interface supports neither IPv4 nor IPv6 multicast, listening for unicast only"
            );
            v4 = Some(bind_v4(&interface, config, false)?);
        }

        if v4.is_none() && v6.is_none() {
            return Err(DiscoveryError::Bind {
                interface: interface.name.clone(),
                reason: "no address family could be bound".to_string(),
            });
        }

        Ok(Self {
            interface,
            port: config.port,
            v4,
            v6,
        })
    }

    /// Sends a fresh probe to every joined group; a failure in one family
    /// does not stop the other.
    async fn send_probe(&self, types: &[String]) -> usize {
        let message_id = Uuid::new_v4();
        let payload = build_probe(&message_id, types);
        let mut sent = 0;

        if let Some(v4) = self.v4.as_ref().filter(|s| s.joined) {
            let target = SocketAddrV4::new(IPV4_MULTICAST_GROUP, self.port);
            match v4.socket.send_to(payload.as_bytes(), target).await {
                Ok(_) => sent += 1,
                Err(e) => warn!(error = %e, group = %IPV4_MULTICAST_GROUP, "Failed to send probe"),
            }
        }

        if let Some(v6) = self.v6.as_ref().filter(|s| s.joined) {
            let target = SocketAddrV6::new(IPV6_MULTICAST_GROUP, self.port, 0, self.interface.index);
            match v6.socket.send_to(payload.as_bytes(), target).await {
                Ok(_) => sent += 1,
                Err(e) => warn!(error = %e, group = %IPV6_MULTICAST_GROUP, "Failed to send probe"),
            }
        }

        debug!(message_id = %message_id, groups = sent, "Probe dispatched");
        sent
    }

    /// Waits for a datagram on whichever socket delivers first
    async fn recv(&self, buf_v4: &mut [u8], buf_v6: &mut [u8]) -> io::Result<Received> {
        tokio::select! {
            r = recv_on(self.v4.as_ref(), buf_v4) => r.map(|(len, source)| Received { len, source, v6: false }),
            r = recv_on(self.v6.as_ref(), buf_v6) => r.map(|(len, source)| Received { len, source, v6: true }),
        }
    }

    fn leave_groups(&self) {
        if let Some(v4) = self.v4.as_ref().filter(|s| s.joined) {
            let local = self.interface.primary_ipv4().unwrap_or(Ipv4Addr::UNSPECIFIED);
            if let Err(e) = v4.socket.leave_multicast_v4(IPV4_MULTICAST_GROUP, local) {
                debug!(error = %e, "Failed to leave IPv4 group");
            }
        }

        if let Some(v6) = self.v6.as_ref().filter(|s| s.joined) {
            if let Err(e) = v6.socket.leave_multicast_v6(&IPV6_MULTICAST_GROUP, self.interface.index) {
                debug!(error = %e, "Failed to leave IPv6 group");
            }
        }
    }
}

struct Received {
    len: usize,
    source: SocketAddr,
    v6: bool,
}

async fn recv_on(socket: Option<&FamilySocket>, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
    match socket {
        Some(s) => s.socket.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

fn new_socket(domain: Domain) -> io::Result<Socket> {
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

fn bind_v4(interface: &NetworkInterface, config: &DiscoveryConfig, join: bool) -> Result<FamilySocket> {
    let socket = new_socket(Domain::IPV4)?;
    let bind_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.port);
    socket.bind(&bind_addr.into()).map_err(|e| DiscoveryError::Bind {
        interface: interface.name.clone(),
        reason: format!("{}: {}", bind_addr, e),
    })?;

    socket.set_multicast_ttl_v4(config.multicast_ttl)?;

    let local = interface.primary_ipv4().unwrap_or(Ipv4Addr::UNSPECIFIED);
    if join {
        socket.set_multicast_if_v4(&local)?;
        socket
            .join_multicast_v4(&IPV4_MULTICAST_GROUP, &local)
            .map_err(|e| DiscoveryError::Join {
                group: IpAddr::V4(IPV4_MULTICAST_GROUP),
                interface: interface.name.clone(),
                reason: e.to_string(),
            })?;
        debug!(group = %IPV4_MULTICAST_GROUP, local = %local, "Joined IPv4 multicast group");
    }

    Ok(FamilySocket {
        socket: UdpSocket::from_std(socket.into())?,
        joined: join,
    })
}

fn bind_v6(interface: &NetworkInterface, config: &DiscoveryConfig) -> Result<FamilySocket> {
    let socket = new_socket(Domain::IPV6)?;
    socket.set_only_v6(true)?;
    let bind_addr = SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), config.port);
    socket.bind(&bind_addr.into()).map_err(|e| DiscoveryError::Bind {
        interface: interface.name.clone(),
        reason: format!("{}: {}", bind_addr, e),
    })?;

    socket.set_multicast_hops_v6(config.multicast_ttl)?;
    socket.set_multicast_if_v6(interface.index)?;
    socket
        .join_multicast_v6(&IPV6_MULTICAST_GROUP, interface.index)
        .map_err(|e| DiscoveryError::Join {
            group: IpAddr::V6(IPV6_MULTICAST_GROUP),
            interface: interface.name.clone(),
            reason: e.to_string(),
        })?;
    debug!(group = %IPV6_MULTICAST_GROUP, index = interface.index, "Joined IPv6 multicast group");

    Ok(FamilySocket {
        socket: UdpSocket::from_std(socket.into())?,
        joined: true,
    })
}

/// Routes parsed datagrams onto the event channels
#[derive(Clone)]
struct EventSink {
    probe_tx: broadcast::Sender<ProbeMatch>,
    resolve_tx: broadcast::Sender<ResolveMatch>,
}

impl EventSink {
    /// Parses one datagram and publishes its matches. Returns the event count.
    fn dispatch(&self, data: &[u8], source: SocketAddr) -> usize {
        match parse_message(data) {
            Ok(DiscoveryMessage::ProbeMatches(matches)) => {
                let count = matches.len();
                debug!(source = %source, count, "Received probe matches");
                for m in matches {
                    // No subscribers is fine; the event is simply dropped
                    let _ = self.probe_tx.send(m);
                }
                count
            }
            Ok(DiscoveryMessage::ResolveMatches(matches)) => {
                let count = matches.len();
                debug!(source = %source, count, "Received resolve matches");
                for m in matches {
                    let _ = self.resolve_tx.send(m);
                }
                count
            }
            Ok(DiscoveryMessage::Probe) | Ok(DiscoveryMessage::Resolve) => {
                trace!(source = %source, "Ignoring request from another client");
                0
            }
            Ok(DiscoveryMessage::Hello) => {
                debug!(source = %source, "Ignoring Hello announcement");
                0
            }
            Ok(DiscoveryMessage::Bye) => {
                debug!(source = %source, "Ignoring Bye announcement");
                0
            }
            Ok(DiscoveryMessage::Unrecognized(action)) => {
                debug!(source = %source, action = %action, "Unrecognized discovery action");
                0
            }
            Err(e) => {
                debug!(source = %source, error = %e, "Dropping unparseable discovery datagram");
                0
            }
        }
    }
}

async fn receive_loop(
    transport: Arc<Transport>,
    sink: EventSink,
    receive_timeout: Duration,
    cancel: CancellationToken,
) {
    let mut buf_v4 = vec![0u8; MAX_DATAGRAM_SIZE];
    let mut buf_v6 = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        let received = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("Discovery receive loop cancelled");
                break;
            }
            result = timeout(receive_timeout, transport.recv(&mut buf_v4, &mut buf_v6)) => result,
        };

        match received {
            Ok(Ok(datagram)) => {
                let buf = if datagram.v6 { &buf_v6 } else { &buf_v4 };
                sink.dispatch(&buf[..datagram.len], datagram.source);
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Error receiving discovery datagram");
            }
            Err(_) => {
                // Idle timeout - the normal polling cadence
                continue;
            }
        }
    }
}

async fn probe_loop(
    transport: Arc<Transport>,
    types: Vec<String>,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("Probe loop cancelled");
                break;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        transport.send_probe(&types).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{ADDRESSING_NS, DISCOVERY_NS, SOAP_ENVELOPE_NS};

    fn probe_matches_envelope(address: &str, xaddr: &str) -> String {
        format!(
            r#"<s:Envelope xmlns:s="{SOAP_ENVELOPE_NS}" xmlns:a="{ADDRESSING_NS}" xmlns:d="{DISCOVERY_NS}">
              <s:Header><a:Action>{DISCOVERY_NS}/ProbeMatches</a:Action></s:Header>
              <s:Body><d:ProbeMatches><d:ProbeMatch>
                <a:EndpointReference><a:Address>{address}</a:Address></a:EndpointReference>
                <d:Types>dn:NetworkVideoTransmitter</d:Types>
                <d:Scopes/>
                <d:XAddrs>{xaddr}</d:XAddrs>
                <d:MetadataVersion>1</d:MetadataVersion>
              </d:ProbeMatch></d:ProbeMatches></s:Body>
            </s:Envelope>"#
        )
    }

    /// Ephemeral port and no addresses: binds a unicast-only IPv4 socket
    fn unicast_only() -> (NetworkInterface, DiscoveryConfig) {
        let config = DiscoveryConfig {
            port: 0,
            ..Default::default()
        };
        (NetworkInterface::new("test0", 0), config)
    }

    fn source() -> SocketAddr {
        "192.168.1.5:3702".parse().unwrap()
    }

    #[test]
    fn test_sink_publishes_matches() {
        let (probe_tx, mut probe_rx) = broadcast::channel(16);
        let (resolve_tx, mut resolve_rx) = broadcast::channel(16);
        let sink = EventSink { probe_tx, resolve_tx };

        let xml = probe_matches_envelope("urn:uuid:1234", "http://192.168.1.5:8080/onvif/device_service");
        assert_eq!(sink.dispatch(xml.as_bytes(), source()), 1);

        let event = probe_rx.try_recv().unwrap();
        assert_eq!(event.endpoint_reference.address, "urn:uuid:1234");
        assert!(resolve_rx.try_recv().is_err());
    }

    #[test]
    fn test_sink_ignores_non_matches() {
        let (probe_tx, mut probe_rx) = broadcast::channel(16);
        let (resolve_tx, _) = broadcast::channel(16);
        let sink = EventSink { probe_tx, resolve_tx };

        let hello = format!(
            r#"<s:Envelope xmlns:s="{SOAP_ENVELOPE_NS}" xmlns:a="{ADDRESSING_NS}">
              <s:Header><a:Action>{DISCOVERY_NS}/Hello</a:Action></s:Header><s:Body/></s:Envelope>"#
        );
        let probe = build_probe(&Uuid::new_v4(), &["dn:NetworkVideoTransmitter".to_string()]);
        let no_header = format!(r#"<s:Envelope xmlns:s="{SOAP_ENVELOPE_NS}"><s:Body/></s:Envelope>"#);

        assert_eq!(sink.dispatch(hello.as_bytes(), source()), 0);
        assert_eq!(sink.dispatch(probe.as_bytes(), source()), 0);
        assert_eq!(sink.dispatch(no_header.as_bytes(), source()), 0);
        assert_eq!(sink.dispatch(b"\x00\x01garbage", source()), 0);
        assert!(probe_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_operations_require_initialization() {
        let mut client = DiscoveryClient::new(DiscoveryConfig::default());

        assert!(!client.is_listening());
        assert!(client.interface().is_none());
        assert!(matches!(client.close().await, Err(DiscoveryError::NotInitialized)));
        assert!(matches!(
            client.dispatch_probe().await,
            Err(DiscoveryError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let (interface, config) = unicast_only();
        let mut client = DiscoveryClient::new(config);

        client.initialize(interface.clone()).await.unwrap();
        assert!(client.is_listening());
        assert_eq!(client.interface().map(|i| i.name.as_str()), Some("test0"));
        assert_eq!(client.local_addrs().len(), 1);

        let err = client.initialize(interface.clone()).await.unwrap_err();
        assert!(err.is_state_error());

        // Unicast-only bindings have no group to probe
        assert_eq!(client.dispatch_probe().await.unwrap(), 0);

        client.reinitialize(interface).await.unwrap();
        assert!(client.is_listening());

        client.close().await.unwrap();
        assert!(!client.is_listening());
        assert!(matches!(client.close().await, Err(DiscoveryError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_receives_unicast_reply() {
        let (interface, config) = unicast_only();
        let mut client = DiscoveryClient::new(config);
        let mut matches = client.probe_matches();

        client.initialize(interface).await.unwrap();
        let port = client.local_addrs()[0].port();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let reply = probe_matches_envelope("urn:uuid:cam-1", "http://127.0.0.1:8080/onvif/device_service");
        sender
            .send_to(reply.as_bytes(), ("127.0.0.1", port))
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), matches.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.endpoint_reference.address, "urn:uuid:cam-1");
        assert_eq!(
            event.first_xaddr(),
            Some("http://127.0.0.1:8080/onvif/device_service")
        );

        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_rebinding_releases_port() {
        let port = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let interface = NetworkInterface::new("lo", 1).with_ipv4(Ipv4Addr::LOCALHOST);
        let config = DiscoveryConfig {
            port,
            probe_interval_ms: None,
            ..Default::default()
        };
        let mut client = DiscoveryClient::new(config);

        client.initialize(interface.clone()).await.unwrap();
        for _ in 0..3 {
            client.reinitialize(interface.clone()).await.unwrap();
            assert!(client.is_listening());
            assert_eq!(client.local_addrs(), vec![SocketAddr::from((Ipv4Addr::UNSPECIFIED, port))]);
        }
        client.close().await.unwrap();

        // A socket without address reuse only binds once nothing holds the port
        std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).unwrap();
    }
}
