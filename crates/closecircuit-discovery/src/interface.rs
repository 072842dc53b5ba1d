//! Network interface model and host lookup

use crate::error::{DiscoveryError, Result};
use closecircuit_core::blocking::run_blocking_cancellable;
use closecircuit_core::retry::{retry_until_some, BackoffConfig};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A host network interface the discovery client can bind to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterface {
    /// OS name (e.g. "wlan0", "p2p-wlan0-0")
    pub name: String,

    /// OS interface index; 0 lets the kernel choose
    pub index: u32,

    /// Assigned IPv4 addresses
    pub ipv4: Vec<Ipv4Addr>,

    /// Assigned IPv6 addresses
    pub ipv6: Vec<Ipv6Addr>,

    /// Interface is administratively up
    pub is_up: bool,

    /// Interface accepts multicast traffic
    pub multicast: bool,
}

impl NetworkInterface {
    /// Creates an up, multicast-capable interface with no addresses
    pub fn new(name: impl Into<String>, index: u32) -> Self {
        Self {
            name: name.into(),
            index,
            ipv4: Vec::new(),
            ipv6: Vec::new(),
            is_up: true,
            multicast: true,
        }
    }

    pub fn with_ipv4(mut self, addr: Ipv4Addr) -> Self {
        self.ipv4.push(addr);
        self
    }

    pub fn with_ipv6(mut self, addr: Ipv6Addr) -> Self {
        self.ipv6.push(addr);
        self
    }

    /// Address used to select the outgoing IPv4 multicast interface
    pub fn primary_ipv4(&self) -> Option<Ipv4Addr> {
        self.ipv4.first().copied()
    }

    pub fn supports_multicast_v4(&self) -> bool {
        self.is_up && self.multicast && !self.ipv4.is_empty()
    }

    pub fn supports_multicast_v6(&self) -> bool {
        self.is_up && self.multicast && !self.ipv6.is_empty()
    }

    fn add_address(&mut self, addr: IpAddr) {
        match addr {
            IpAddr::V4(v4) if !self.ipv4.contains(&v4) => self.ipv4.push(v4),
            IpAddr::V6(v6) if !self.ipv6.contains(&v6) => self.ipv6.push(v6),
            _ => {}
        }
    }
}

/// Looks up an interface by name on this host.
///
/// Returns `None` when the interface does not exist or has no addresses yet,
/// which is the normal state of a Wi-Fi Direct group interface while the
/// group is still forming.
pub fn lookup(name: &str) -> Option<NetworkInterface> {
    let addrs = match local_ip_address::list_afinet_netifas() {
        Ok(addrs) => addrs,
        Err(e) => {
            debug!(error = %e, "Failed to enumerate network interfaces");
            return None;
        }
    };

    let mut found: Option<NetworkInterface> = None;
    for (ifname, addr) in addrs {
        if ifname != name {
            continue;
        }
        found
            .get_or_insert_with(|| NetworkInterface::new(name, interface_index(name)))
            .add_address(addr);
    }

    found
}

/// The interface that owns the host's default IPv4 address
pub fn default_interface() -> Option<NetworkInterface> {
    let local = match local_ip_address::local_ip() {
        Ok(ip) => ip,
        Err(e) => {
            debug!(error = %e, "No default local address");
            return None;
        }
    };

    let addrs = local_ip_address::list_afinet_netifas().ok()?;
    let name = addrs
        .into_iter()
        .find(|(_, addr)| *addr == local)
        .map(|(name, _)| name)?;

    lookup(&name)
}

/// Waits for `name` to appear, retrying the lookup with backoff.
///
/// Host enumeration runs on the blocking pool. Returns
/// [`DiscoveryError::Cancelled`] if `cancel` fires first and
/// [`DiscoveryError::InterfaceNotFound`] once the backoff gives up.
pub async fn resolve(
    name: &str,
    backoff: &BackoffConfig,
    cancel: &CancellationToken,
) -> Result<NetworkInterface> {
    let attempt = retry_until_some(backoff, || {
        let name = name.to_string();
        async move {
            run_blocking_cancellable(cancel, move |_| lookup(&name))
                .await
                .ok()
                .flatten()
        }
    });

    tokio::select! {
        biased;

        _ = cancel.cancelled() => {
            debug!(interface = name, "Interface lookup cancelled");
            Err(DiscoveryError::Cancelled)
        }
        result = attempt => match result {
            Ok(interface) => {
                info!(
                    interface = %interface.name,
                    index = interface.index,
                    ipv4 = interface.ipv4.len(),
                    ipv6 = interface.ipv6.len(),
                    "Network interface available"
                );
                Ok(interface)
            }
            Err(_) => Err(DiscoveryError::InterfaceNotFound(name.to_string())),
        },
    }
}

#[cfg(unix)]
fn interface_index(name: &str) -> u32 {
    let Ok(c_name) = std::ffi::CString::new(name) else {
        return 0;
    };
    // SAFETY: c_name is a valid NUL-terminated string for the duration of the call
    unsafe { libc::if_nametoindex(c_name.as_ptr()) }
}

#[cfg(not(unix))]
fn interface_index(_name: &str) -> u32 {
    0
}
