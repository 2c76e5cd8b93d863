use std::time::Duration;
use anyhow::{Context, Result};
use dnssd::{publish_service, Engine, ServiceDescriptor};
use shared::protocol::{API_PREFIX, DAEMON_SERVICE_TYPE, TXT_API_PATH};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use crate::config::PublishConfig;

/// Instance name for entries that do not set one.
fn default_instance_name() -> Result<String> {
    let hostname = hostname::get()
        .context("Failed to get system hostname")?
        .to_string_lossy()
        .to_string();
    Ok(hostname.split('.').next().unwrap_or_default().to_string())
}

pub fn descriptor(config: &PublishConfig) -> Result<ServiceDescriptor> {
    let name = match &config.name {
        Some(name) => name.clone(),
        None => default_instance_name()?,
    };

    let mut builder = ServiceDescriptor::builder(&config.service_type, &name).port(config.port);
    for (key, value) in &config.txt {
        builder = builder.txt(key, value.as_bytes());
    }
    for flag in &config.flags {
        builder = builder.txt_flag(flag);
    }
    for address in &config.addresses {
        builder = builder.address(*address);
    }

    builder
        .build()
        .with_context(|| format!("Invalid [[publish]] entry {:?} ({})", name, config.service_type))
}

/// `[[publish]]` entry describing the daemon's own API.
pub fn api_entry(port: u16) -> PublishConfig {
    PublishConfig {
        name: None,
        service_type: DAEMON_SERVICE_TYPE.to_string(),
        port,
        txt: [(TXT_API_PATH.to_string(), API_PREFIX.to_string())].into(),
        flags: Vec::new(),
        addresses: Vec::new(),
        register_timeout_ms: dnssd::DEFAULT_REGISTER_TIMEOUT.as_millis() as u64,
    }
}

/// Publishes every entry on its own task. Each task keeps its service
/// registered until `cancel` fires and then sends the goodbye.
pub fn spawn_all(
    engine: &Engine,
    entries: &[PublishConfig],
    cancel: &CancellationToken,
) -> Result<Vec<JoinHandle<()>>> {
    let descriptors = entries
        .iter()
        .map(|entry| Ok((descriptor(entry)?, Duration::from_millis(entry.register_timeout_ms))))
        .collect::<Result<Vec<_>>>()?;

    Ok(descriptors
        .into_iter()
        .map(|(descriptor, timeout)| {
            let engine = engine.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let label = format!("{} ({})", descriptor.instance_name(), descriptor.ty_domain());
                match publish_service(&engine, descriptor, timeout, cancel).await {
                    Ok(()) => tracing::info!("Unpublished {}", label),
                    Err(e) => tracing::error!("Failed to publish {}: {}", label, e),
                }
            })
        })
        .collect())
}
