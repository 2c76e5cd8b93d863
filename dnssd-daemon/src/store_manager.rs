use std::thread;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use anyhow::Result;
use shared::types::{DiscoveredService, ServiceEntry};
use crate::store::{db::ServiceStore, hash};
use crate::config::StoreConfig;
pub use crate::mdns::browser::BrowserEvent;

/// Commands sent to the store thread
pub enum StoreCommand {
    Record {
        service: DiscoveredService,
        resolved: bool,
        reply: oneshot::Sender<Result<bool>>,
    },
    MarkDead(String, oneshot::Sender<Result<bool>>),
    MarkTypeDead(String, oneshot::Sender<Result<u64>>),
    GetAll(oneshot::Sender<Result<Vec<ServiceEntry>>>),
    GetByType(String, oneshot::Sender<Result<Vec<ServiceEntry>>>),
    GetOne(String, oneshot::Sender<Result<Option<ServiceEntry>>>),
    Maintenance {
        prune_after_secs: u64,
        reply: oneshot::Sender<Result<u64>>,
    },
    Shutdown,
}

/// Handle to the thread owning the SQLite connection
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoreCommand>,
}

impl StoreHandle {
    /// Spawn the store thread. `hash_tx` is refreshed after every mutation
    /// that changed data.
    pub fn spawn(store: ServiceStore, hash_tx: watch::Sender<String>) -> Self {
        let (tx, mut rx) = mpsc::channel::<StoreCommand>(256);

        let recompute_hash = |store: &ServiceStore, hash_tx: &watch::Sender<String>| {
            match store.get_all_services() {
                Ok(services) => {
                    hash_tx.send_replace(hash::compute_hash(&services));
                }
                Err(e) => tracing::warn!("Failed to recompute store hash: {:#}", e),
            }
        };

        thread::spawn(move || {
            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    StoreCommand::Record { service, resolved, reply } => {
                        let result = store.record(&service, resolved);
                        if matches!(&result, Ok(true)) {
                            recompute_hash(&store, &hash_tx);
                        }
                        let _ = reply.send(result);
                    }
                    StoreCommand::MarkDead(key, reply) => {
                        let result = store.mark_dead(&key);
                        if matches!(&result, Ok(true)) {
                            recompute_hash(&store, &hash_tx);
                        }
                        let _ = reply.send(result);
                    }
                    StoreCommand::MarkTypeDead(service_type, reply) => {
                        let result = store.mark_all_dead(Some(&service_type));
                        if matches!(&result, Ok(n) if *n > 0) {
                            recompute_hash(&store, &hash_tx);
                        }
                        let _ = reply.send(result);
                    }
                    StoreCommand::GetAll(reply) => {
                        let _ = reply.send(store.get_all_services());
                    }
                    StoreCommand::GetByType(service_type, reply) => {
                        let _ = reply.send(store.get_services_by_type(&service_type));
                    }
                    StoreCommand::GetOne(key, reply) => {
                        let _ = reply.send(store.get_service(&key));
                    }
                    StoreCommand::Maintenance { prune_after_secs, reply } => {
                        let result = store.prune_dead(prune_after_secs);
                        if matches!(&result, Ok(n) if *n > 0) {
                            recompute_hash(&store, &hash_tx);
                        }
                        let _ = reply.send(result);
                    }
                    StoreCommand::Shutdown => {
                        tracing::info!("Store thread shutting down");
                        break;
                    }
                }
            }
        });

        Self { tx }
    }

    /// Record a sighting. Returns true if data changed.
    pub async fn record(&self, service: DiscoveredService, resolved: bool) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::Record { service, resolved, reply }).await?;
        rx.await?
    }

    /// Mark a service as dead
    pub async fn mark_dead(&self, key: String) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::MarkDead(key, reply)).await?;
        rx.await?
    }

    /// Mark every live service of a type as dead
    pub async fn mark_type_dead(&self, service_type: String) -> Result<u64> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::MarkTypeDead(service_type, reply)).await?;
        rx.await?
    }

    pub async fn get_all(&self) -> Result<Vec<ServiceEntry>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::GetAll(reply)).await?;
        rx.await?
    }

    pub async fn get_by_type(&self, service_type: String) -> Result<Vec<ServiceEntry>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::GetByType(service_type, reply)).await?;
        rx.await?
    }

    pub async fn get_one(&self, key: String) -> Result<Option<ServiceEntry>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::GetOne(key, reply)).await?;
        rx.await?
    }

    /// Prune services that have been dead for too long
    pub async fn maintenance(&self, prune_after_secs: u64) -> Result<u64> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::Maintenance { prune_after_secs, reply }).await?;
        rx.await?
    }

    /// Shutdown the store thread
    pub async fn shutdown(&self) -> Result<()> {
        self.tx.send(StoreCommand::Shutdown).await?;
        Ok(())
    }
}

/// Store manager event loop - bridges browser events to the store
pub async fn run(
    store: StoreHandle,
    mut rx: mpsc::Receiver<BrowserEvent>,
    config: StoreConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let mut maintenance_interval = tokio::time::interval(
        std::time::Duration::from_secs(config.maintenance_interval_secs)
    );

    loop {
        tokio::select! {
            Some(event) = rx.recv() => {
                let result = match event {
                    BrowserEvent::Seen(service) => store.record(service, false).await.map(drop),
                    BrowserEvent::Resolved(service) => store.record(service, true).await.map(drop),
                    BrowserEvent::Removed(key) => store.mark_dead(key).await.map(drop),
                    BrowserEvent::Lost(service_type) => store.mark_type_dead(service_type).await.map(drop),
                };
                if let Err(e) = result {
                    tracing::error!("Failed to apply browser event: {:#}", e);
                }
            }
            _ = maintenance_interval.tick() => {
                match store.maintenance(config.prune_after_secs).await {
                    Ok(0) => {}
                    Ok(n) => tracing::debug!("Pruned {} dead services", n),
                    Err(e) => tracing::error!("Failed to run maintenance: {:#}", e),
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Store manager shutting down");
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn spawn() -> (StoreHandle, watch::Receiver<String>) {
        let store = ServiceStore::open(":memory:").unwrap();
        let (hash_tx, hash_rx) = watch::channel(String::new());
        (StoreHandle::spawn(store, hash_tx), hash_rx)
    }

    fn printer() -> DiscoveredService {
        DiscoveredService {
            name: "printer".to_string(),
            service_type: "_ipp._tcp.local.".to_string(),
            host: "office.local.".to_string(),
            addresses: vec!["10.0.0.7".parse().unwrap()],
            port: 631,
            txt: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_hash_follows_mutations() {
        let (store, hash_rx) = spawn();

        assert!(store.record(printer(), true).await.unwrap());
        let after_insert = hash_rx.borrow().clone();
        assert_eq!(after_insert.len(), 64);

        assert!(!store.record(printer(), true).await.unwrap());
        assert_eq!(*hash_rx.borrow(), after_insert);

        assert!(store.mark_dead(printer().key()).await.unwrap());
        assert_ne!(*hash_rx.borrow(), after_insert);

        store.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_run_applies_browser_events() {
        let (store, _hash_rx) = spawn();
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(store.clone(), rx, StoreConfig::default(), cancel.clone()));

        let mut seen = printer();
        seen.port = 0;
        seen.host.clear();
        seen.addresses.clear();
        tx.send(BrowserEvent::Seen(seen)).await.unwrap();
        tx.send(BrowserEvent::Resolved(printer())).await.unwrap();
        tx.send(BrowserEvent::Lost("_ipp._tcp.local.".to_string())).await.unwrap();

        let key = printer().key();
        let entry = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if let Some(entry) = store.get_one(key.clone()).await.unwrap() {
                    if !entry.alive {
                        return entry;
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(entry.resolved);
        assert_eq!(entry.service.port, 631);

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(store.get_by_type("_ipp._tcp.local.".to_string()).await.unwrap().len(), 1);
        assert_eq!(store.get_all().await.unwrap().len(), 1);
    }
}
