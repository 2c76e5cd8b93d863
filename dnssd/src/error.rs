use std::time::Duration;

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to callers of the engine.
///
/// Malformed inbound packets are not represented here: they are logged and
/// dropped by the transport, see [`crate::dns::MalformedPacket`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Socket bind, send or receive failure.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// The platform refused access to the local network.
    #[error("permission to use the local network was denied: {0}")]
    PermissionDenied(String),

    /// Every candidate instance name was already taken.
    #[error("no free instance name for {name:?} after {attempts} renames")]
    NameConflictExhausted { name: String, attempts: u32 },

    /// Probing and announcing did not finish within the caller's deadline.
    #[error("registration of {name:?} did not complete within {timeout:?}")]
    RegisterTimeout { name: String, timeout: Duration },

    /// SRV, TXT and address records did not all arrive within the deadline.
    #[error("resolving {key:?} did not complete within {timeout:?}")]
    ResolveTimeout { key: String, timeout: Duration },

    /// The descriptor cannot be published as given.
    #[error("invalid service descriptor: {0}")]
    InvalidDescriptor(String),

    /// No discovered service carries this key.
    #[error("unknown service {0:?}")]
    UnknownService(String),

    /// A pending operation was abandoned by an unregister or a lost transport.
    #[error("operation cancelled")]
    Cancelled,

    /// The engine task has stopped.
    #[error("engine is shut down")]
    EngineClosed,
}

impl Error {
    /// Timeouts may succeed when retried; everything else is final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RegisterTimeout { .. } | Self::ResolveTimeout { .. })
    }

    pub(crate) fn transport_lost() -> Self {
        Self::Transport(std::io::Error::new(
            std::io::ErrorKind::NotConnected,
            "multicast transport lost",
        ))
    }
}
