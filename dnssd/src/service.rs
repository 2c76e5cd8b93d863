use std::net::IpAddr;
use std::time::Duration;

use shared::names::{is_valid_service_type, qualified, strip_local};
use shared::protocol::DEFAULT_DOMAIN;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::dns::name::labels;
use crate::dns::TxtPair;
use crate::engine::{Command, Engine};
use crate::error::{Error, Result};
use crate::publish::{PublishState, PublishStatus};
use crate::schedule::SessionId;

/// Timeout used by [`PublishHandle::register_default`].
pub const DEFAULT_REGISTER_TIMEOUT: Duration = Duration::from_millis(10_000);

const MAX_LABEL_LEN: usize = 63;
const MAX_TXT_PAIR_LEN: usize = 255;

/// A service to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    instance_name: String,
    service_type: String,
    domain: String,
    port: u16,
    priority: u16,
    weight: u16,
    txt: Vec<TxtPair>,
    addresses: Vec<IpAddr>,
}

impl ServiceDescriptor {
    /// `service_type` may be given as `_ipp._tcp`, `_ipp._tcp.` or
    /// `_ipp._tcp.local.`.
    pub fn builder(service_type: &str, instance_name: &str) -> ServiceBuilder {
        ServiceBuilder {
            descriptor: ServiceDescriptor {
                instance_name: instance_name.to_string(),
                service_type: service_type.to_string(),
                domain: DEFAULT_DOMAIN.to_string(),
                port: 0,
                priority: 0,
                weight: 1,
                txt: Vec::new(),
                addresses: Vec::new(),
            },
        }
    }

    pub fn instance_name(&self) -> &str {
        &self.instance_name
    }

    /// Service type without domain, e.g. `_ipp._tcp`.
    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn priority(&self) -> u16 {
        self.priority
    }

    pub fn weight(&self) -> u16 {
        self.weight
    }

    pub fn txt(&self) -> &[TxtPair] {
        &self.txt
    }

    /// Explicit addresses; empty means the engine's interface addresses.
    pub fn addresses(&self) -> &[IpAddr] {
        &self.addresses
    }

    /// `<service type>.<domain>`, e.g. `_ipp._tcp.local.`.
    pub fn ty_domain(&self) -> String {
        format!("{}.{}", self.service_type, self.domain)
    }

    pub(crate) fn set_txt(&mut self, txt: Vec<TxtPair>) {
        self.txt = txt;
    }

    pub(crate) fn set_addresses(&mut self, addresses: Vec<IpAddr>) {
        self.addresses = addresses;
    }

    fn validate(&self) -> Result<()> {
        if self.instance_name.is_empty() {
            return Err(Error::InvalidDescriptor("instance name is empty".to_string()));
        }
        // Leave room for a " (NN)" rename suffix.
        if self.instance_name.len() > MAX_LABEL_LEN - 5 {
            return Err(Error::InvalidDescriptor(format!(
                "instance name {:?} is too long",
                self.instance_name
            )));
        }
        if !is_valid_service_type(&self.service_type) {
            return Err(Error::InvalidDescriptor(format!(
                "{:?} is not a DNS-SD service type",
                self.service_type
            )));
        }
        if labels(&self.domain).is_empty() {
            return Err(Error::InvalidDescriptor("domain is empty".to_string()));
        }
        validate_txt(&self.txt)
    }
}

pub(crate) fn validate_txt(txt: &[TxtPair]) -> Result<()> {
    for (key, value) in txt {
        if key.is_empty() || key.contains('=') || !key.is_ascii() {
            return Err(Error::InvalidDescriptor(format!("invalid txt key {key:?}")));
        }
        let len = key.len() + value.as_ref().map_or(0, |v| v.len() + 1);
        if len > MAX_TXT_PAIR_LEN {
            return Err(Error::InvalidDescriptor(format!("txt attribute {key:?} is too long")));
        }
    }
    Ok(())
}

pub struct ServiceBuilder {
    descriptor: ServiceDescriptor,
}

impl ServiceBuilder {
    pub fn port(mut self, port: u16) -> Self {
        self.descriptor.port = port;
        self
    }

    pub fn priority(mut self, priority: u16) -> Self {
        self.descriptor.priority = priority;
        self
    }

    pub fn weight(mut self, weight: u16) -> Self {
        self.descriptor.weight = weight;
        self
    }

    pub fn domain(mut self, domain: &str) -> Self {
        self.descriptor.domain = qualified(domain);
        self
    }

    /// Adds a `key=value` attribute.
    pub fn txt(mut self, key: &str, value: impl Into<Vec<u8>>) -> Self {
        self.descriptor.txt.push((key.to_string(), Some(value.into())));
        self
    }

    /// Adds a boolean attribute, published as a bare key.
    pub fn txt_flag(mut self, key: &str) -> Self {
        self.descriptor.txt.push((key.to_string(), None));
        self
    }

    pub fn address(mut self, address: IpAddr) -> Self {
        self.descriptor.addresses.push(address);
        self
    }

    pub fn build(self) -> Result<ServiceDescriptor> {
        let mut descriptor = self.descriptor;
        let bare = strip_local(&descriptor.service_type);
        descriptor.service_type = bare.trim_end_matches('.').to_string();
        descriptor.validate()?;
        Ok(descriptor)
    }
}

/// Owner handle of a published service.
///
/// Dropping the handle unpublishes the service (goodbye packets if it was
/// announced) and frees its session in the engine.
pub struct PublishHandle {
    id: SessionId,
    descriptor: ServiceDescriptor,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<PublishStatus>,
}

impl PublishHandle {
    pub(crate) fn new(
        id: SessionId,
        descriptor: ServiceDescriptor,
        commands: mpsc::UnboundedSender<Command>,
        status: watch::Receiver<PublishStatus>,
    ) -> Self {
        Self {
            id,
            descriptor,
            commands,
            status,
        }
    }

    /// Current instance name; differs from the descriptor's after a rename.
    pub fn name(&self) -> String {
        self.status.borrow().name.clone()
    }

    pub fn service_type(&self) -> &str {
        self.descriptor.service_type()
    }

    pub fn domain(&self) -> &str {
        self.descriptor.domain()
    }

    pub fn port(&self) -> u16 {
        self.descriptor.port()
    }

    pub fn state(&self) -> PublishState {
        self.status.borrow().state
    }

    pub fn is_registered(&self) -> bool {
        self.state().is_registered()
    }

    /// Watch channel following name and state changes.
    pub fn registered(&self) -> watch::Receiver<PublishStatus> {
        self.status.clone()
    }

    /// Probes and announces the service. Returns immediately when already
    /// announced; joins the running attempt when probing is in progress.
    pub async fn register(&self, timeout: Duration) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Register {
            id: self.id,
            timeout,
            reply,
        })?;
        rx.await.map_err(|_| Error::EngineClosed)?
    }

    pub async fn register_default(&self) -> Result<()> {
        self.register(DEFAULT_REGISTER_TIMEOUT).await
    }

    /// Sends goodbye packets and returns to idle. No-op when not registered.
    pub async fn unregister(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Unregister { id: self.id, reply })?;
        rx.await.map_err(|_| Error::EngineClosed)?
    }

    /// Replaces the TXT attributes. Announced services re-announce once the
    /// coalescing window has passed.
    pub async fn set_txt(&mut self, txt: Vec<TxtPair>) -> Result<()> {
        validate_txt(&txt)?;
        self.descriptor.set_txt(txt.clone());
        self.update(Some(txt), None).await
    }

    pub async fn set_addresses(&mut self, addresses: Vec<IpAddr>) -> Result<()> {
        self.descriptor.set_addresses(addresses.clone());
        self.update(None, Some(addresses)).await
    }

    async fn update(&self, txt: Option<Vec<TxtPair>>, addresses: Option<Vec<IpAddr>>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Update {
            id: self.id,
            txt,
            addresses,
            reply,
        })?;
        rx.await.map_err(|_| Error::EngineClosed)?
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::EngineClosed)
    }
}

impl Drop for PublishHandle {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::Release(self.id));
    }
}

/// Publishes `descriptor` and keeps it registered until `cancel` fires, then
/// unregisters it. Registration errors are returned as soon as they happen.
pub async fn publish_service(
    engine: &Engine,
    descriptor: ServiceDescriptor,
    timeout: Duration,
    cancel: CancellationToken,
) -> Result<()> {
    let handle = engine.create_service(descriptor).await?;
    let registered = tokio::select! {
        result = handle.register(timeout) => result,
        _ = cancel.cancelled() => Ok(()),
    };
    if registered.is_ok() {
        tracing::info!("Published {:?} ({})", handle.name(), handle.service_type());
        cancel.cancelled().await;
    }
    let unregistered = handle.unregister().await;
    registered.and(unregistered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let descriptor = ServiceDescriptor::builder("_ipp._tcp", "printer").build().unwrap();
        assert_eq!(descriptor.port(), 0);
        assert_eq!(descriptor.priority(), 0);
        assert_eq!(descriptor.weight(), 1);
        assert!(descriptor.txt().is_empty());
        assert!(descriptor.addresses().is_empty());
        assert_eq!(descriptor.ty_domain(), "_ipp._tcp.local.");
    }

    #[test]
    fn test_type_spellings_normalize() {
        for spelling in ["_ipp._tcp", "_ipp._tcp.", "_ipp._tcp.local", "_ipp._tcp.local."] {
            let descriptor = ServiceDescriptor::builder(spelling, "printer").build().unwrap();
            assert_eq!(descriptor.service_type(), "_ipp._tcp");
            assert_eq!(descriptor.ty_domain(), "_ipp._tcp.local.");
        }
    }

    #[test]
    fn test_txt_pairs_keep_order() {
        let descriptor = ServiceDescriptor::builder("_ipp._tcp", "printer")
            .port(631)
            .txt("rp", "ipp/print")
            .txt_flag("color")
            .build()
            .unwrap();
        assert_eq!(
            descriptor.txt(),
            &[
                ("rp".to_string(), Some(b"ipp/print".to_vec())),
                ("color".to_string(), None)
            ]
        );
    }

    #[test]
    fn test_rejects_bad_descriptors() {
        assert!(matches!(
            ServiceDescriptor::builder("ipp", "printer").build(),
            Err(Error::InvalidDescriptor(_))
        ));
        assert!(matches!(
            ServiceDescriptor::builder("_ipp._tcp", "").build(),
            Err(Error::InvalidDescriptor(_))
        ));
        assert!(matches!(
            ServiceDescriptor::builder("_ipp._tcp", "printer").txt("a=b", "c").build(),
            Err(Error::InvalidDescriptor(_))
        ));
        let long = "x".repeat(60);
        assert!(ServiceDescriptor::builder("_ipp._tcp", &long).build().is_err());
    }
}
