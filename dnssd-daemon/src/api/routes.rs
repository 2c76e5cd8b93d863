use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tokio::sync::watch;
use dnssd::{Engine, PublishedService};
use shared::names::local_qualified;
use shared::types::{DiscoveredService, ServiceEntry};
use crate::store_manager::StoreHandle;

#[derive(Clone)]
pub struct AppState {
    pub store: StoreHandle,
    pub hash_rx: watch::Receiver<String>,
    pub engine: Engine,
}

#[derive(Deserialize)]
pub struct ServiceQuery {
    /// Any spelling: `_ipp._tcp`, `_ipp._tcp.` or `_ipp._tcp.local.`
    #[serde(rename = "type")]
    pub service_type: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/services", get(get_services))
        .route("/v1/services/hash", get(get_hash))
        .route("/v1/services/:key", get(get_service))
        .route("/v1/services/:key/resolve", post(resolve_service))
        .route("/v1/published", get(get_published))
        .with_state(state)
}

async fn get_services(
    State(state): State<AppState>,
    Query(params): Query<ServiceQuery>,
) -> Result<Json<Vec<ServiceEntry>>, StatusCode> {
    let services = if let Some(service_type) = params.service_type {
        state.store.get_by_type(local_qualified(&service_type)).await
    } else {
        state.store.get_all().await
    };

    services
        .map(Json)
        .map_err(|e| {
            tracing::error!("Failed to query services: {:#}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })
}

async fn get_hash(State(state): State<AppState>) -> String {
    state.hash_rx.borrow().clone()
}

async fn get_service(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<ServiceEntry>, StatusCode> {
    state
        .store
        .get_one(key)
        .await
        .map_err(|e| {
            tracing::error!("Failed to query service: {:#}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// Resolves through the engine and records the result.
async fn resolve_service(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<DiscoveredService>, StatusCode> {
    let service = state.engine.resolve(&key).await.map_err(|e| {
        tracing::debug!("Resolve of {} failed: {}", key, e);
        resolve_status(&e)
    })?;

    if let Err(e) = state.store.record(service.clone(), true).await {
        tracing::error!("Failed to record resolved service: {:#}", e);
    }
    Ok(Json(service))
}

fn resolve_status(error: &dnssd::Error) -> StatusCode {
    match error {
        dnssd::Error::UnknownService(_) => StatusCode::NOT_FOUND,
        dnssd::Error::ResolveTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        dnssd::Error::Transport(_) | dnssd::Error::EngineClosed | dnssd::Error::Cancelled => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

async fn get_published(
    State(state): State<AppState>,
) -> Result<Json<Vec<PublishedService>>, StatusCode> {
    state.engine.published().await.map(Json).map_err(|e| {
        tracing::error!("Failed to list published services: {}", e);
        StatusCode::SERVICE_UNAVAILABLE
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use dnssd::transport::memory::MemoryNetwork;
    use dnssd::{EngineConfig, ServiceDescriptor};
    use tower::ServiceExt;
    use crate::store::db::ServiceStore;

    async fn state(network: &MemoryNetwork) -> AppState {
        let engine = Engine::builder()
            .config(EngineConfig {
                host_name: Some("office".to_string()),
                resolve_timeout_ms: 200,
                ..EngineConfig::default()
            })
            .link_factory(network.clone())
            .open()
            .await
            .unwrap();
        let (hash_tx, hash_rx) = watch::channel("initial".to_string());
        let store = StoreHandle::spawn(ServiceStore::open(":memory:").unwrap(), hash_tx);
        AppState { store, hash_rx, engine }
    }

    async fn call(app: Router, method: &str, uri: &str) -> (StatusCode, Vec<u8>) {
        let response = app
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn test_services_and_hash() {
        let network = MemoryNetwork::new();
        let state = state(&network).await;
        let app = router(state.clone());

        let (status, body) = call(app.clone(), "GET", "/v1/services/hash").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, b"initial");

        let printer = DiscoveredService {
            name: "printer".to_string(),
            service_type: "_ipp._tcp.local.".to_string(),
            host: "office.local.".to_string(),
            addresses: vec!["10.0.0.7".parse().unwrap()],
            port: 631,
            txt: Default::default(),
        };
        state.store.record(printer, true).await.unwrap();

        let (status, body) = call(app.clone(), "GET", "/v1/services?type=_ipp._tcp").await;
        assert_eq!(status, StatusCode::OK);
        let services: Vec<ServiceEntry> = serde_json::from_slice(&body).unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].key, "printer_ipp_tcplocal");

        let (_, body) = call(app.clone(), "GET", "/v1/services?type=_ssh._tcp").await;
        let services: Vec<ServiceEntry> = serde_json::from_slice(&body).unwrap();
        assert!(services.is_empty());

        let (status, body) = call(app.clone(), "GET", "/v1/services/printer_ipp_tcplocal").await;
        assert_eq!(status, StatusCode::OK);
        let entry: ServiceEntry = serde_json::from_slice(&body).unwrap();
        assert_eq!(entry.service.port, 631);

        let (status, body) = call(app, "GET", "/v1/services/hash").await;
        assert_eq!(status, StatusCode::OK);
        assert_ne!(body, b"initial");
    }

    #[tokio::test]
    async fn test_unknown_service_is_not_found() {
        let network = MemoryNetwork::new();
        let app = router(state(&network).await);

        let (status, _) = call(app.clone(), "GET", "/v1/services/nothing_ipp_tcplocal").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(app, "POST", "/v1/services/nothing_ipp_tcplocal/resolve").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_resolve_records_and_published_lists() {
        let network = MemoryNetwork::new();
        let state = state(&network).await;
        let app = router(state.clone());
        let printer = ServiceDescriptor::builder("_ipp._tcp", "printer").port(631).build().unwrap();
        let _handle = state.engine.publish(printer, Duration::from_secs(3)).await.unwrap();

        let (status, body) = call(app.clone(), "GET", "/v1/published").await;
        assert_eq!(status, StatusCode::OK);
        let published: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(published[0]["name"], "printer");
        assert_eq!(published[0]["state"], "announced");

        // Keys become resolvable once a browse has seen them.
        let mut events = state.engine.browse("_ipp._tcp").unwrap();
        tokio::time::timeout(Duration::from_secs(3), events.next_event())
            .await
            .unwrap()
            .unwrap();

        let (status, body) = call(app, "POST", "/v1/services/printer_ipp_tcplocal/resolve").await;
        assert_eq!(status, StatusCode::OK);
        let service: DiscoveredService = serde_json::from_slice(&body).unwrap();
        assert_eq!(service.port, 631);
        assert!(state.store.get_one(service.key()).await.unwrap().unwrap().resolved);
    }
}
