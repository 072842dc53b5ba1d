//! Reachability routing table.
//!
//! Folds match events into a map of endpoint -> (first XAddr, last seen) and
//! derives the set of playback URLs whose endpoints renewed within the
//! delinquency interval. Entries are never removed; a delinquent endpoint is
//! only hidden until it is seen again.

use crate::types::MatchEvent;
use closecircuit_core::{Observable, RoutingConfig};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Ordered set of playback URLs; each snapshot is complete
pub type ReachableStreamSet = BTreeSet<String>;

#[derive(Debug, Clone)]
struct RoutingEntry {
    xaddr: Option<String>,
    last_seen: Instant,
}

/// Diagnostic view of one table entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntrySnapshot {
    pub endpoint: String,
    pub xaddr: Option<String>,
    pub age: Duration,
}

/// Endpoint map plus the rules that turn it into a reachable set
#[derive(Debug)]
pub struct RoutingTable {
    delinquency: Duration,
    playback_path: String,
    entries: HashMap<String, RoutingEntry>,
}

impl RoutingTable {
    pub fn new(delinquency: Duration, playback_path: impl Into<String>) -> Self {
        Self {
            delinquency,
            playback_path: playback_path.into(),
            entries: HashMap::new(),
        }
    }

    pub fn from_config(config: &RoutingConfig) -> Self {
        Self::new(config.delinquency_interval(), config.playback_path.clone())
    }

    /// Records a sighting; the only write path
    pub fn upsert<E: MatchEvent + ?Sized>(&mut self, event: &E, now: Instant) {
        let endpoint = event.endpoint_reference().address.clone();
        let xaddr = event.first_xaddr().map(str::to_string);

        if !self.entries.contains_key(&endpoint) {
            info!(endpoint = %endpoint, xaddr = ?xaddr, "New endpoint discovered");
        }

        self.entries.insert(
            endpoint,
            RoutingEntry {
                xaddr,
                last_seen: now,
            },
        );
    }

    /// An entry is delinquent once its age strictly exceeds the interval
    pub fn is_delinquent(&self, endpoint: &str, now: Instant) -> Option<bool> {
        self.entries
            .get(endpoint)
            .map(|e| now.saturating_duration_since(e.last_seen) > self.delinquency)
    }

    /// Recomputes the reachable set from scratch
    pub fn reachable_at(&self, now: Instant) -> ReachableStreamSet {
        let mut reachable = ReachableStreamSet::new();

        for (endpoint, entry) in &self.entries {
            if now.saturating_duration_since(entry.last_seen) > self.delinquency {
                continue;
            }
            let Some(xaddr) = &entry.xaddr else {
                continue;
            };
            match playback_url(xaddr, &self.playback_path) {
                Some(url) => {
                    reachable.insert(url);
                }
                None => debug!(endpoint = %endpoint, xaddr = %xaddr, "XAddr is not an absolute URI"),
            }
        }

        reachable
    }

    /// Every entry, delinquent or not, sorted by endpoint
    pub fn entries(&self, now: Instant) -> Vec<EntrySnapshot> {
        let mut snapshot: Vec<EntrySnapshot> = self
            .entries
            .iter()
            .map(|(endpoint, entry)| EntrySnapshot {
                endpoint: endpoint.clone(),
                xaddr: entry.xaddr.clone(),
                age: now.saturating_duration_since(entry.last_seen),
            })
            .collect();
        snapshot.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        snapshot
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Keeps scheme and authority of `xaddr` and replaces everything after with `path`.
///
/// `http://192.168.1.5:8080/onvif/device_service` -> `http://192.168.1.5:8080/video`
pub fn playback_url(xaddr: &str, path: &str) -> Option<String> {
    let uri: http::Uri = xaddr.trim().parse().ok()?;
    let scheme = uri.scheme_str()?;
    let authority = uri.authority()?;
    Some(format!("{}://{}{}", scheme, authority, path))
}

/// Handle to a spawned routing table task
pub struct RoutingTableHandle {
    reachable: Arc<Observable<ReachableStreamSet>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl RoutingTableHandle {
    /// Receiver that always holds the latest complete snapshot
    pub fn subscribe(&self) -> watch::Receiver<ReachableStreamSet> {
        self.reachable.subscribe()
    }

    pub fn current(&self) -> ReachableStreamSet {
        self.reachable.get()
    }

    /// Stops the task and waits for it to exit
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "Routing table task failed");
            }
        }
    }
}

impl Drop for RoutingTableHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Runs a routing table over `events` until `cancel` fires.
///
/// The set is recomputed after every event and on a timer no coarser than the
/// delinquency interval. Unchanged snapshots are not republished.
pub fn spawn<E>(
    mut events: broadcast::Receiver<E>,
    config: &RoutingConfig,
    cancel: CancellationToken,
) -> RoutingTableHandle
where
    E: MatchEvent + Clone + Send + 'static,
{
    let reachable = Arc::new(Observable::new(ReachableStreamSet::new()));
    let mut table = RoutingTable::from_config(config);
    let sweep_period = config.sweep_interval();

    let published = Arc::clone(&reachable);
    let task_cancel = cancel.clone();

    let task = tokio::spawn(async move {
        let mut sweep = tokio::time::interval(sweep_period);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events_open = true;

        loop {
            tokio::select! {
                biased;

                _ = task_cancel.cancelled() => {
                    debug!("Routing table cancelled");
                    break;
                }
                received = events.recv(), if events_open => match received {
                    Ok(event) => table.upsert(&event, Instant::now()),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Routing table lagged behind match events");
                        continue;
                    }
                    Err(RecvError::Closed) => {
                        debug!("Match event stream closed, sweeping only");
                        events_open = false;
                        continue;
                    }
                },
                _ = sweep.tick() => {}
            }

            let snapshot = table.reachable_at(Instant::now());
            let count = snapshot.len();
            if published.publish(snapshot) {
                info!(reachable = count, endpoints = table.len(), "Reachable streams changed");
            }
        }
    });

    RoutingTableHandle {
        reachable,
        cancel,
        task: Some(task),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EndpointReference, ProbeMatch};

    const XADDR: &str = "http://192.168.1.5:8080/onvif/device_service";

    fn probe_match(address: &str, xaddr: &str) -> ProbeMatch {
        ProbeMatch {
            endpoint_reference: EndpointReference::new(address),
            types: vec!["dn:NetworkVideoTransmitter".to_string()],
            scopes: vec![],
            xaddrs: vec![xaddr.to_string()],
            metadata_version: 1,
        }
    }

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_playback_url() {
        assert_eq!(
            playback_url(XADDR, "/video").as_deref(),
            Some("http://192.168.1.5:8080/video")
        );
        assert_eq!(
            playback_url("http://[fe80::6]/onvif/device_service", "/video").as_deref(),
            Some("http://[fe80::6]/video")
        );
        assert_eq!(playback_url("/onvif/device_service", "/video"), None);
        assert_eq!(playback_url("not a uri", "/video"), None);
    }

    #[tokio::test]
    async fn test_routing_example() {
        let mut table = RoutingTable::new(ms(3000), "/video");
        let now = Instant::now();
        table.upsert(&probe_match("urn:uuid:1234", XADDR), now);

        let expected: ReachableStreamSet = ["http://192.168.1.5:8080/video".to_string()].into();
        assert_eq!(table.reachable_at(now), expected);
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_delinquency_boundary() {
        let mut table = RoutingTable::new(ms(3000), "/video");
        let t0 = Instant::now();
        table.upsert(&probe_match("urn:uuid:1234", XADDR), t0);

        assert_eq!(table.reachable_at(t0 + ms(2999)).len(), 1);
        assert_eq!(table.reachable_at(t0 + ms(3000)).len(), 1);
        assert!(table.reachable_at(t0 + ms(3001)).is_empty());
        assert_eq!(table.is_delinquent("urn:uuid:1234", t0 + ms(3001)), Some(true));

        // The entry stays in the table while hidden
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn test_renewal_extends_reachability() {
        let mut table = RoutingTable::new(ms(3000), "/video");
        let t0 = Instant::now();
        table.upsert(&probe_match("urn:uuid:1234", XADDR), t0);
        table.upsert(&probe_match("urn:uuid:1234", XADDR), t0 + ms(2000));

        assert_eq!(table.reachable_at(t0 + ms(4999)).len(), 1);
        assert!(table.reachable_at(t0 + ms(5001)).is_empty());
    }

    #[tokio::test]
    async fn test_set_is_deduplicated_and_skips_bad_xaddrs() {
        let mut table = RoutingTable::new(ms(3000), "/video");
        let now = Instant::now();
        table.upsert(&probe_match("urn:uuid:a", "http://10.0.0.2:8080/onvif/device_service"), now);
        table.upsert(&probe_match("urn:uuid:b", "http://10.0.0.2:8080/onvif/other"), now);
        table.upsert(&probe_match("urn:uuid:c", "garbage"), now);

        let reachable = table.reachable_at(now);
        assert_eq!(reachable.len(), 1);
        assert!(reachable.contains("http://10.0.0.2:8080/video"));
        assert_eq!(table.len(), 3);

        let entries = table.entries(now + ms(10));
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].endpoint, "urn:uuid:a");
        assert_eq!(entries[0].age, ms(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_table_expires_silent_endpoints() {
        let (tx, rx) = broadcast::channel(16);
        let handle = spawn(rx, &RoutingConfig::default(), CancellationToken::new());
        let mut reachable = handle.subscribe();

        tx.send(probe_match("urn:uuid:1234", XADDR)).unwrap();
        reachable.changed().await.unwrap();
        let seen_at = Instant::now();
        assert!(reachable
            .borrow_and_update()
            .contains("http://192.168.1.5:8080/video"));

        // Paused time auto-advances to the sweep that hides the endpoint
        reachable.changed().await.unwrap();
        assert!(reachable.borrow_and_update().is_empty());
        let elapsed = seen_at.elapsed();
        assert!(elapsed > ms(3000), "expired after {:?}", elapsed);
        assert!(elapsed <= ms(4000), "expired after {:?}", elapsed);

        // A renewed sighting brings it back
        tx.send(probe_match("urn:uuid:1234", XADDR)).unwrap();
        reachable.changed().await.unwrap();
        assert_eq!(handle.current().len(), 1);

        handle.shutdown().await;
    }
}
