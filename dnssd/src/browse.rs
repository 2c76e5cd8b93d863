use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use shared::types::DiscoveredService;
use tokio::sync::mpsc;

use crate::engine::Command;
use crate::error::{Error, Result};
use crate::schedule::BrowseId;

#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A new instance appeared. Host, port and addresses are filled in only
    /// as far as the cache already knows them.
    Discovered {
        service: DiscoveredService,
        resolver: Resolver,
    },
    /// SRV, TXT and address records are all known. Emitted after the
    /// resolver was called, and again whenever the resolved view changes.
    Resolved {
        service: DiscoveredService,
        resolver: Resolver,
    },
    Removed {
        service: DiscoveredService,
    },
    /// A resolve started through the resolver ran out of time.
    ResolveTimedOut {
        service: DiscoveredService,
        resolver: Resolver,
    },
    /// The multicast transport failed. Always the last event of the stream.
    TransportLost,
}

impl DiscoveryEvent {
    pub fn service(&self) -> Option<&DiscoveredService> {
        match self {
            Self::Discovered { service, .. }
            | Self::Resolved { service, .. }
            | Self::Removed { service }
            | Self::ResolveTimedOut { service, .. } => Some(service),
            Self::TransportLost => None,
        }
    }

    pub fn resolver(&self) -> Option<&Resolver> {
        match self {
            Self::Discovered { resolver, .. }
            | Self::Resolved { resolver, .. }
            | Self::ResolveTimedOut { resolver, .. } => Some(resolver),
            Self::Removed { .. } | Self::TransportLost => None,
        }
    }
}

/// Triggers a resolve of one discovered instance. The outcome arrives on
/// the browse stream the resolver came from, as `Resolved` or
/// `ResolveTimedOut`.
#[derive(Clone)]
pub struct Resolver {
    browse: BrowseId,
    key: String,
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl Resolver {
    pub(crate) fn new(browse: BrowseId, key: String, commands: mpsc::WeakUnboundedSender<Command>) -> Self {
        Self {
            browse,
            key,
            commands,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn resolve(&self) -> Result<()> {
        let commands = self.commands.upgrade().ok_or(Error::EngineClosed)?;
        commands
            .send(Command::ResolveFor {
                browse: self.browse,
                key: self.key.clone(),
            })
            .map_err(|_| Error::EngineClosed)
    }
}

impl fmt::Debug for Resolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resolver")
            .field("browse", &self.browse)
            .field("key", &self.key)
            .finish()
    }
}

/// Live discovery events for one service type. Dropping the stream ends
/// the session and, for the last session of its type, the query.
pub struct BrowseStream {
    id: BrowseId,
    service_type: String,
    events: mpsc::UnboundedReceiver<DiscoveryEvent>,
    commands: mpsc::UnboundedSender<Command>,
}

impl BrowseStream {
    pub(crate) fn new(
        id: BrowseId,
        service_type: String,
        events: mpsc::UnboundedReceiver<DiscoveryEvent>,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            id,
            service_type,
            events,
            commands,
        }
    }

    /// Browsed type with domain, e.g. `_ipp._tcp.local.`.
    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    pub async fn next_event(&mut self) -> Option<DiscoveryEvent> {
        self.events.recv().await
    }
}

impl Stream for BrowseStream {
    type Item = DiscoveryEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

impl Drop for BrowseStream {
    fn drop(&mut self) {
        let _ = self.commands.send(Command::StopBrowse(self.id));
    }
}
