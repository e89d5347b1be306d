//! Endpoint objects: the RPC-facing contracts of the transport plane, the
//! source-side endpoint with its connection negotiator, the sink-side
//! endpoint state machine, and the keep-alive lease.

pub mod lease;
pub mod sink;
pub mod source;

use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::broker::QosSourceRef;
use crate::protocol::{
    AllocatorParams, EndpointStatistics, MediaTime, PlayMode, Qos, StartPosition, Transport,
};

pub use lease::{LeaseError, LeaseServer, SinkLease};
pub use sink::{
    create_pull_connection, create_pull_connection_by_endpoint,
    create_pull_connection_by_factory, create_pull_connection_by_name,
    create_pull_source_by_endpoint, ConnectionRpc, EndpointFactory, FactoryConnectionRpc,
    FixedEndpointFactory, NamedEndpointFactory, RemoteSource, SinkEndpoint, SinkError,
};
pub use source::{
    create_pull_source_endpoint, create_seekable_source_endpoint, DisposableSourceFactory,
    ProxySource, SeekableSourceEndpoint, SourceEndpoint, SourceEndpointOptions, SourceFactory,
};

/// An error returned by an RPC peer, the status codes a remote endpoint
/// can answer with.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RpcError {
    /// The remote cannot serve the request right now; retry later.
    #[error("remote is busy, try later")]
    Busy,
    /// The addressed remote object does not exist.
    #[error("remote object not found")]
    NotFound,
    /// The remote refused the call in its current state.
    #[error("invalid state on remote object")]
    InvalidState,
    /// The remote could not be reached at all.
    #[error("remote unavailable: {0}")]
    Unavailable(String),
}

/// What a source hands back from connection negotiation: everything the
/// sink needs to open the data path.
#[derive(Clone)]
pub enum ConnectionInfo {
    /// A direct source reference, valid only in the same process. `None`
    /// is the well-defined "no transport" answer: no preference in the
    /// sink's list is supported by the source.
    InProc {
        /// The per-sink proxy source to connect to.
        source: Option<QosSourceRef>,
    },
    /// Shared-memory bodies plus a TCP control channel on the same host.
    Local {
        /// Port of the source's connection acceptor.
        port: u16,
        /// The shared allocator to attach.
        allocator: AllocatorParams,
    },
    /// Plain TCP; the sink races all advertised addresses.
    Tcp {
        /// Port of the source's connection acceptor.
        port: u16,
        /// Advertised addresses, most preferred first.
        addresses: Vec<String>,
    },
    /// UDP control + data socket pair.
    Udp {
        /// Address both sockets live on.
        address: String,
        /// Port of the control socket.
        control_port: u16,
        /// Port of the data socket.
        data_port: u16,
    },
    /// Shared multicast data with unicast control.
    Multicast {
        /// Address of the per-source control socket.
        control_iface: String,
        /// Port of the control socket.
        control_port: u16,
        /// The multicast group samples are sent to.
        data_group: Ipv4Addr,
        /// The group port.
        data_port: u16,
    },
    /// The RPC layer itself tunnels the media.
    RpcTunnel,
}

impl std::fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionInfo::InProc { source } => f
                .debug_struct("InProc")
                .field("source", &source.is_some())
                .finish(),
            ConnectionInfo::Local { port, allocator } => f
                .debug_struct("Local")
                .field("port", port)
                .field("allocator", &allocator.id)
                .finish(),
            ConnectionInfo::Tcp { port, addresses } => f
                .debug_struct("Tcp")
                .field("port", port)
                .field("addresses", addresses)
                .finish(),
            ConnectionInfo::Udp {
                address,
                control_port,
                data_port,
            } => f
                .debug_struct("Udp")
                .field("address", address)
                .field("control_port", control_port)
                .field("data_port", data_port)
                .finish(),
            ConnectionInfo::Multicast {
                control_iface,
                control_port,
                data_group,
                data_port,
            } => f
                .debug_struct("Multicast")
                .field("control_iface", control_iface)
                .field("control_port", control_port)
                .field("data_group", data_group)
                .field("data_port", data_port)
                .finish(),
            ConnectionInfo::RpcTunnel => f.debug_struct("RpcTunnel").finish(),
        }
    }
}

/// The transport enum a sink's `Auto` preference expands to.
pub fn auto_transport_preferences() -> Vec<Transport> {
    vec![Transport::InProc, Transport::Local, Transport::Tcp]
}

/// The source's RPC surface.
pub trait EndpointRpc: Send + Sync {
    /// Negotiates a connection for a sink. Returns the transport
    /// description and the one-shot cookie authenticating the out-of-band
    /// data channel. Every call mints a fresh cookie; cookies are never
    /// reused.
    fn request_connection(
        &self,
        pid: u32,
        host_id: &str,
        sink_prefs: &[Transport],
        use_all_addresses: bool,
        qos: &Qos,
    ) -> Result<(ConnectionInfo, String), RpcError>;

    /// Replaces the QoS of the connection identified by `cookie`.
    fn request_qos(&self, cookie: &str, qos: &Qos) -> Result<(), RpcError>;

    /// The source's current stream telemetry.
    fn get_statistics(&self) -> Result<EndpointStatistics, RpcError>;
}

/// The RPC surface of a seekable (archive) source endpoint.
pub trait StorageEndpointRpc: EndpointRpc {
    /// Repositions the stream. Samples from before the seek carry an old
    /// session id and are dropped by the consumer.
    fn seek(
        &self,
        time: MediaTime,
        start: StartPosition,
        mode: PlayMode,
        session_id: u32,
    ) -> Result<(), RpcError>;
}

/// Resolves endpoint names to live RPC references; the naming-service
/// seam, swappable in tests.
pub trait EndpointResolver: Send + Sync {
    /// Resolves a name. `NotFound` when nothing is registered under it.
    fn resolve(&self, name: &str) -> Result<Arc<dyn EndpointRpc>, RpcError>;
}

/// A sink-side connection handle: the owner may update QoS and must
/// destroy it when done.
pub trait SinkConnection: Send + Sync {
    /// Replaces the connection's QoS.
    fn request_qos(&self, qos: &Qos);

    /// Initiates teardown. Idempotent.
    fn destroy(&self);
}

/// RAII wrapper over a [SinkConnection]: destroys it on drop or reset.
#[derive(Default)]
pub struct SinkConnectionGuard {
    connection: Option<Arc<dyn SinkConnection>>,
}

impl SinkConnectionGuard {
    /// An empty guard.
    pub fn new() -> Self {
        Self::default()
    }

    /// A guard over an existing connection.
    pub fn holding(connection: Arc<dyn SinkConnection>) -> Self {
        SinkConnectionGuard {
            connection: Some(connection),
        }
    }

    /// Destroys the held connection, if any.
    pub fn reset(&mut self) {
        if let Some(connection) = self.connection.take() {
            connection.destroy();
        }
    }

    /// Destroys the held connection and takes ownership of a new one.
    pub fn replace(&mut self, connection: Arc<dyn SinkConnection>) {
        self.reset();
        self.connection = Some(connection);
    }

    /// The held connection.
    pub fn get(&self) -> Option<&Arc<dyn SinkConnection>> {
        self.connection.as_ref()
    }

    /// Whether a connection is held.
    pub fn is_some(&self) -> bool {
        self.connection.is_some()
    }
}

impl Drop for SinkConnectionGuard {
    fn drop(&mut self) {
        self.reset();
    }
}

/// The RPC surface of the keep-alive sink endpoint lease.
pub trait SinkEndpointRpc: Send + Sync {
    /// Connects the served sink to the given source under a lease with the
    /// given priority. Fails with [LeaseError::InvalidOperation] when an
    /// equal-or-higher-priority lease is live.
    fn connect_by_object_ref(
        &self,
        source: Arc<dyn EndpointRpc>,
        priority: i32,
    ) -> Result<u64, LeaseError>;

    /// Heartbeats the lease; resets its watchdog.
    fn keep_alive(&self, handle: u64) -> Result<(), LeaseError>;

    /// Releases the lease and destroys its transport.
    fn disconnect(&self, handle: u64) -> Result<(), LeaseError>;

    /// The heartbeat interval peers should use, in milliseconds.
    fn keep_alive_milliseconds(&self) -> u32;
}

#[cfg(test)]
mod tests;
