use anyhow::{Context, Result};
use clap::Parser;
use closecircuit_core::blocking::run_blocking_cancellable;
use closecircuit_core::config::{AppConfig, LogFormat, LoggingConfig, StreamConfig};
use closecircuit_core::retry::{retry_until_some, retry_with_backoff};
use closecircuit_discovery::{interface, routing, DiscoveryClient, NetworkInterface, ReachableStreamSet};
use closecircuit_mjpeg::{FrameExtractor, StreamEnd};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// How often the bound interface is re-checked for address changes
const INTERFACE_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// CloseCircuit - discover ONVIF cameras on the local link and watch their MJPEG streams
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file (optional)
    #[arg(short, long, default_value = "closecircuit.yaml")]
    config: PathBuf,

    /// Network interface to discover on (e.g. p2p-wlan0-0)
    #[arg(short, long, env = "CLOSECIRCUIT_INTERFACE")]
    interface: Option<String>,

    /// Override the probe interval in milliseconds
    #[arg(long)]
    probe_interval_ms: Option<u64>,

    /// Override the delinquency interval in milliseconds
    #[arg(long)]
    delinquency_ms: Option<u64>,
}

/// A running stream viewer
struct Viewer {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::from_config_builder(&args.config)
        .with_context(|| format!("Failed to load configuration from {:?}", args.config))?;

    if let Some(name) = args.interface {
        config.discovery.interface = Some(name);
    }
    if let Some(ms) = args.probe_interval_ms {
        config.discovery.probe_interval_ms = Some(ms);
    }
    if let Some(ms) = args.delinquency_ms {
        config.routing.delinquency_interval_ms = ms;
    }
    config.validate().context("Invalid configuration")?;

    init_tracing(&config.logging);

    info!(
        interface = ?config.discovery.interface,
        probe_types = ?config.discovery.probe_types,
        delinquency_ms = config.routing.delinquency_interval_ms,
        "Starting CloseCircuit"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received");
            shutdown.cancel();
        }
    });

    let iface = match wait_for_interface(&config, &shutdown).await {
        Some(iface) => iface,
        None => {
            info!("Stopped before a network interface became available");
            return Ok(());
        }
    };

    let mut client = DiscoveryClient::new(config.discovery.clone());
    let table = routing::spawn(client.probe_matches(), &config.routing, shutdown.child_token());
    client
        .initialize(iface)
        .await
        .context("Failed to start discovery")?;

    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(5))
        .build()
        .context("Failed to build HTTP client")?;

    let mut reachable = table.subscribe();
    let mut viewers: HashMap<String, Viewer> = HashMap::new();
    let mut interface_check = tokio::time::interval(INTERFACE_CHECK_INTERVAL);
    interface_check.tick().await;
    let mut reacquire: Option<JoinHandle<Option<NetworkInterface>>> = None;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            changed = reachable.changed() => {
                if changed.is_err() {
                    warn!("Routing table stopped");
                    break;
                }
                let urls = reachable.borrow_and_update().clone();
                reconcile_viewers(&mut viewers, &urls, &http, &config.stream, &shutdown).await;
            }
            _ = interface_check.tick() => {
                refresh_interface(&mut client, &shutdown).await;

                // A failed rebind leaves the client closed; wait for the
                // interface off the main loop so viewers keep reconciling
                if !client.is_listening() && reacquire.is_none() {
                    let config = config.clone();
                    let shutdown = shutdown.clone();
                    reacquire = Some(tokio::spawn(async move {
                        wait_for_interface(&config, &shutdown).await
                    }));
                }
            }
            iface = join_reacquire(&mut reacquire), if reacquire.is_some() => {
                reacquire = None;
                if let Some(iface) = iface {
                    if let Err(e) = client.initialize(iface).await {
                        error!(error = %e, "Failed to restart discovery client");
                    }
                }
            }
        }
    }

    if let Some(task) = reacquire.take() {
        task.abort();
    }

    info!(viewers = viewers.len(), "Shutting down");
    for (_, viewer) in viewers.drain() {
        viewer.cancel.cancel();
        let _ = viewer.task.await;
    }
    if let Err(e) = client.close().await {
        warn!(error = %e, "Discovery client did not close cleanly");
    }
    table.shutdown().await;

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    match logging.format {
        LogFormat::Json => tracing_subscriber::fmt().with_env_filter(filter).json().init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

/// Waits until the configured (or default) interface exists. None on shutdown.
async fn wait_for_interface(config: &AppConfig, shutdown: &CancellationToken) -> Option<NetworkInterface> {
    let backoff = &config.discovery.interface_retry;

    match &config.discovery.interface {
        Some(name) => match interface::resolve(name, backoff, shutdown).await {
            Ok(iface) => Some(iface),
            Err(e) => {
                if !matches!(e, closecircuit_discovery::DiscoveryError::Cancelled) {
                    error!(interface = %name, error = %e, "Network interface unavailable");
                }
                None
            }
        },
        None => {
            let attempt = retry_until_some(backoff, || async {
                run_blocking_cancellable(shutdown, |_| interface::default_interface())
                    .await
                    .ok()
                    .flatten()
            });
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => None,
                result = attempt => result.ok(),
            }
        }
    }
}

/// Rebinds the client when the interface's addresses changed
async fn refresh_interface(client: &mut DiscoveryClient, shutdown: &CancellationToken) {
    let Some(current) = client.interface().cloned() else {
        return;
    };
    let name = current.name.clone();

    let latest = match run_blocking_cancellable(shutdown, move |_| interface::lookup(&name)).await {
        Ok(latest) => latest,
        Err(_) => return,
    };

    match latest {
        Some(latest) if latest != current => {
            info!(interface = %latest.name, "Interface addresses changed, rebinding");
            if let Err(e) = client.reinitialize(latest).await {
                error!(error = %e, "Failed to rebind discovery client");
            }
        }
        Some(_) => {}
        None => {
            debug!(interface = %current.name, "Interface not visible, keeping current binding");
        }
    }
}

/// Resolves once the background interface wait finishes
async fn join_reacquire(task: &mut Option<JoinHandle<Option<NetworkInterface>>>) -> Option<NetworkInterface> {
    match task {
        Some(handle) => match handle.await {
            Ok(iface) => iface,
            Err(e) => {
                warn!(error = %e, "Interface wait task failed");
                None
            }
        },
        None => std::future::pending().await,
    }
}

async fn reconcile_viewers(
    viewers: &mut HashMap<String, Viewer>,
    urls: &ReachableStreamSet,
    http: &reqwest::Client,
    stream_config: &StreamConfig,
    shutdown: &CancellationToken,
) {
    let gone: Vec<String> = viewers
        .keys()
        .filter(|url| !urls.contains(*url))
        .cloned()
        .collect();

    for url in gone {
        if let Some(viewer) = viewers.remove(&url) {
            info!(url = %url, "Stream no longer reachable, stopping viewer");
            viewer.cancel.cancel();
            let _ = viewer.task.await;
        }
    }

    for url in urls {
        if viewers.contains_key(url) {
            continue;
        }
        info!(url = %url, "Opening stream");
        let cancel = shutdown.child_token();
        let task = tokio::spawn(run_viewer(
            http.clone(),
            url.clone(),
            stream_config.clone(),
            cancel.clone(),
        ));
        viewers.insert(url.clone(), Viewer { cancel, task });
    }
}

async fn open_stream(http: &reqwest::Client, url: &str) -> reqwest::Result<reqwest::Response> {
    http.get(url).send().await?.error_for_status()
}

async fn run_viewer(http: reqwest::Client, url: String, config: StreamConfig, cancel: CancellationToken) {
    let mut extractor = FrameExtractor::new(&config);
    let mut frames = extractor.subscribe();

    let frame_url = url.clone();
    let frame_log = tokio::spawn(async move {
        while frames.changed().await.is_ok() {
            if let Some(frame) = frames.borrow_and_update().as_ref() {
                if frame.sequence == 1 {
                    info!(url = %frame_url, width = frame.width, height = frame.height, "First frame");
                } else {
                    debug!(url = %frame_url, sequence = frame.sequence, "Frame");
                }
            }
        }
    });

    loop {
        let connect = retry_with_backoff(&config.reconnect, || open_stream(&http, &url));
        let response = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            response = connect => response,
        };

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                warn!(url = %url, error = %e, "Giving up on stream");
                break;
            }
        };

        match extractor.run(response.bytes_stream(), &cancel).await {
            StreamEnd::Cancelled => break,
            StreamEnd::Finished => info!(url = %url, "Stream ended, reconnecting"),
            StreamEnd::ReadError(e) => warn!(url = %url, error = %e, "Stream failed, reconnecting"),
        }

        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(config.reconnect.initial_delay()) => {}
        }
    }

    // Dropping the extractor closes the frame channel
    drop(extractor);
    let _ = frame_log.await;
    debug!(url = %url, "Viewer stopped");
}
