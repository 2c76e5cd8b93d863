use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::Future;
use anyhow::Result;
use dnssd::{BrowseStream, DiscoveryEvent, Engine};
use shared::names::local_qualified;
use shared::types::DiscoveredService;
use crate::config::BrowseConfig;

/// What the browser reports to the store manager
#[derive(Debug)]
pub enum BrowserEvent {
    /// Instance discovered, possibly not yet resolved
    Seen(DiscoveredService),
    Resolved(DiscoveredService),
    /// Instance gone, by service key
    Removed(String),
    /// The transport was lost; every instance of this type is unknown now
    Lost(String),
}

type NextResult = (String, BrowseStream, Option<DiscoveryEvent>);
type NextFuture = Pin<Box<dyn Future<Output = NextResult> + Send>>;
type RetryFuture = Pin<Box<dyn Future<Output = (String, u32)> + Send>>;

/// Each future owns its stream and hands it back with the event, so the
/// set never borrows from the loop.
fn make_next_future(service_type: String, mut stream: BrowseStream) -> NextFuture {
    Box::pin(async move {
        let event = stream.next().await;
        (service_type, stream, event)
    })
}

fn make_retry_future(service_type: String, attempt: u32, max_backoff: Duration) -> RetryFuture {
    let delay = Duration::from_secs(1u64 << attempt.min(16)).min(max_backoff);
    Box::pin(async move {
        tokio::time::sleep(delay).await;
        (service_type, attempt + 1)
    })
}

pub async fn run_browser(
    engine: Engine,
    tx: mpsc::Sender<BrowserEvent>,
    config: BrowseConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let max_backoff = Duration::from_secs(config.rebrowse_max_backoff_secs.max(1));
    let mut streams: FuturesUnordered<NextFuture> = FuturesUnordered::new();
    let mut retries: FuturesUnordered<RetryFuture> = FuturesUnordered::new();

    for service_type in &config.types {
        let service_type = local_qualified(service_type);
        match engine.browse(&service_type) {
            Ok(stream) => {
                tracing::info!("Browsing {}", service_type);
                streams.push(make_next_future(service_type, stream));
            }
            Err(e) => {
                tracing::error!("Failed to browse {}: {}", service_type, e);
            }
        }
    }

    loop {
        tokio::select! {
            Some((service_type, stream, event)) = streams.next() => {
                match event {
                    Some(DiscoveryEvent::TransportLost) | None => {
                        tracing::warn!("Browse of {} ended, transport lost", service_type);
                        drop(stream);
                        if tx.send(BrowserEvent::Lost(service_type.clone())).await.is_err() {
                            break;
                        }
                        retries.push(make_retry_future(service_type, 0, max_backoff));
                    }
                    Some(event) => {
                        if let Some(forward) = handle_event(event, config.resolve) {
                            if tx.send(forward).await.is_err() {
                                break;
                            }
                        }
                        streams.push(make_next_future(service_type, stream));
                    }
                }
            }

            Some((service_type, attempt)) = retries.next() => {
                match engine.browse(&service_type) {
                    Ok(stream) => {
                        tracing::info!("Browsing {} again", service_type);
                        streams.push(make_next_future(service_type, stream));
                    }
                    Err(dnssd::Error::EngineClosed) => break,
                    Err(e) => {
                        tracing::debug!("Browse of {} not possible yet: {}", service_type, e);
                        retries.push(make_retry_future(service_type, attempt, max_backoff));
                    }
                }
            }

            _ = cancel.cancelled() => {
                tracing::info!("Browser shutting down");
                break;
            }
        }
    }

    Ok(())
}

/// Maps one discovery event to what the store needs; starts a resolve for
/// new instances when `resolve` is set.
fn handle_event(event: DiscoveryEvent, resolve: bool) -> Option<BrowserEvent> {
    match event {
        DiscoveryEvent::Discovered { service, resolver } => {
            tracing::debug!("Discovered {}", service.key());
            if resolve {
                if let Err(e) = resolver.resolve() {
                    tracing::warn!("Failed to resolve {}: {}", service.key(), e);
                }
            }
            Some(BrowserEvent::Seen(service))
        }
        DiscoveryEvent::Resolved { service, .. } => {
            tracing::debug!("Resolved {} at {}:{}", service.key(), service.host, service.port);
            Some(BrowserEvent::Resolved(service))
        }
        DiscoveryEvent::Removed { service } => {
            tracing::debug!("Removed {}", service.key());
            Some(BrowserEvent::Removed(service.key()))
        }
        DiscoveryEvent::ResolveTimedOut { service, .. } => {
            tracing::info!("Resolve of {} timed out", service.key());
            None
        }
        DiscoveryEvent::TransportLost => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dnssd::transport::memory::MemoryNetwork;
    use dnssd::{EngineConfig, ServiceDescriptor};

    async fn engine(network: &MemoryNetwork, host: &str) -> Engine {
        Engine::builder()
            .config(EngineConfig {
                host_name: Some(host.to_string()),
                retry_backoff_ms: 1,
                ..EngineConfig::default()
            })
            .link_factory(network.clone())
            .open()
            .await
            .unwrap()
    }

    async fn recv(rx: &mut mpsc::Receiver<BrowserEvent>) -> BrowserEvent {
        tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_discovers_and_resolves() {
        let network = MemoryNetwork::new();
        let server = engine(&network, "server").await;
        let client = engine(&network, "client").await;
        let printer = ServiceDescriptor::builder("_ipp._tcp", "printer").port(631).build().unwrap();
        let handle = server.publish(printer, Duration::from_secs(3)).await.unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let config = BrowseConfig {
            types: vec!["_ipp._tcp".to_string()],
            ..BrowseConfig::default()
        };
        let task = tokio::spawn(run_browser(client.clone(), tx, config, cancel.clone()));

        let BrowserEvent::Seen(service) = recv(&mut rx).await else {
            panic!("expected Seen first");
        };
        assert_eq!(service.service_type, "_ipp._tcp.local.");
        let BrowserEvent::Resolved(service) = recv(&mut rx).await else {
            panic!("expected Resolved");
        };
        assert_eq!(service.port, 631);
        assert_eq!(service.host, "server.local.");

        server.unpublish(handle).await.unwrap();
        let BrowserEvent::Removed(key) = recv(&mut rx).await else {
            panic!("expected Removed");
        };
        assert_eq!(key, "printer_ipp_tcplocal");

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_reports_lost_transport() {
        let network = MemoryNetwork::new();
        let client = engine(&network, "client").await;
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let config = BrowseConfig {
            types: vec!["_ipp._tcp".to_string()],
            ..BrowseConfig::default()
        };
        let task = tokio::spawn(run_browser(client, tx, config, cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;

        network.sever_all();
        let BrowserEvent::Lost(service_type) = recv(&mut rx).await else {
            panic!("expected Lost");
        };
        assert_eq!(service_type, "_ipp._tcp.local.");

        cancel.cancel();
        task.await.unwrap().unwrap();
    }
}
