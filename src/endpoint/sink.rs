//! The sink-side endpoint: an 8-state connection machine that negotiates
//! a transport over RPC, opens the data channel, and reconnects with
//! exponential backoff when the network or the upstream dies.
//!
//! The reconnect worker holds the only strong reference to the endpoint
//! internals while it runs; channel callbacks hold weak back-references
//! and treat a dead endpoint as a normal state.

use std::net::{SocketAddrV4, UdpSocket};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{
    auto_transport_preferences, ConnectionInfo, EndpointResolver, EndpointRpc, RpcError,
    SinkConnection,
};
use crate::broker::{self, Connection, PullSink, PullSource, SinkRef, SourceRef};
use crate::channel::{
    inproc::create_inproc_input_channel, local::create_local_input_channel,
    multicast::create_multicast_input_channel, tcp::create_pull_tcp_input_channel,
    udp::create_udp_input_channel, FrameBufferingPolicy, OnNetworkDisconnect,
};
use crate::net::initiator::ConnectionInitiator;
use crate::protocol::{AllocatorParams, Qos, Transport};
use crate::sample::Sample;

/// An error on the sink side of a connection.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// No transport preference is supported by the source; the endpoint
    /// destroys itself.
    #[error("no transport preference is supported by the source")]
    NoTransport,
    /// The data channel could not be built.
    #[error("cannot create channel")]
    ChannelCreation,
    /// The state machine refused the operation.
    #[error("invalid sink endpoint state: {0}")]
    InvalidState(String),
    /// The RPC layer failed.
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),
    /// Socket setup failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Abstracts the RPC calls used to initiate a media connection, so the
/// state machine is independent of how the endpoint reference is obtained
/// and refreshed.
pub trait ConnectionRpc: Send + Sync {
    /// Whether another connect attempt is worthwhile after a failure.
    fn is_reconnect_possible(&self) -> bool;

    /// The floor for reconnect delays advertised by the RPC layer.
    fn remake_timeout(&self) -> Duration;

    /// Performs the negotiation round trip. Blocking.
    fn request_connection(
        &self,
        pid: u32,
        host_id: &str,
        sink_prefs: &[Transport],
        qos: &Qos,
    ) -> Result<(ConnectionInfo, String), RpcError>;

    /// Replaces the QoS of the pending connection. Blocking.
    fn request_qos(&self, cookie: &str, qos: &Qos) -> Result<(), RpcError>;

    /// Drops any cached endpoint reference.
    fn clean_up(&self);

    /// Builds a tunneled source through the RPC layer itself. `Ok(None)`
    /// when the provider does not tunnel.
    fn create_tunnel(
        &self,
        _qos: &Qos,
        _on_disconnect: OnNetworkDisconnect,
    ) -> Result<Option<SourceRef>, RpcError> {
        Ok(None)
    }
}

/// Builds endpoint references for a [ConnectionRpc], retrying resolution
/// across reconnects.
pub trait EndpointFactory: Send + Sync {
    /// Produces a fresh endpoint reference.
    fn make_endpoint(&self) -> Result<Arc<dyn EndpointRpc>, RpcError>;

    /// Whether `make_endpoint` may ever succeed again.
    fn is_remake_possible(&self) -> bool {
        true
    }

    /// How long callers should wait between remakes.
    fn remake_timeout(&self) -> Duration {
        Duration::from_secs(1)
    }
}

/// A factory over one fixed endpoint reference.
pub struct FixedEndpointFactory {
    endpoint: Arc<dyn EndpointRpc>,
}

impl FixedEndpointFactory {
    /// Wraps the reference.
    pub fn new(endpoint: Arc<dyn EndpointRpc>) -> Self {
        FixedEndpointFactory { endpoint }
    }
}

impl EndpointFactory for FixedEndpointFactory {
    fn make_endpoint(&self) -> Result<Arc<dyn EndpointRpc>, RpcError> {
        Ok(self.endpoint.clone())
    }
}

/// A factory resolving an endpoint name on every remake, deduplicating
/// resolution-error log spam across retries.
pub struct NamedEndpointFactory {
    resolver: Arc<dyn EndpointResolver>,
    name: String,
    last_error: Mutex<String>,
}

impl NamedEndpointFactory {
    /// A factory for the given name.
    pub fn new(resolver: Arc<dyn EndpointResolver>, name: &str) -> Self {
        NamedEndpointFactory {
            resolver,
            name: name.to_owned(),
            last_error: Mutex::new(String::new()),
        }
    }
}

impl EndpointFactory for NamedEndpointFactory {
    fn make_endpoint(&self) -> Result<Arc<dyn EndpointRpc>, RpcError> {
        match self.resolver.resolve(&self.name) {
            Ok(endpoint) => {
                let mut last = self.last_error.lock().unwrap();
                if !last.is_empty() {
                    log::warn!("resolved endpoint with name {}", self.name);
                    last.clear();
                }
                Ok(endpoint)
            }
            Err(err) => {
                let mut last = self.last_error.lock().unwrap();
                let message = err.to_string();
                if *last != message {
                    log::warn!(
                        "error ({message}) resolving endpoint with name {}",
                        self.name
                    );
                    *last = message;
                }
                Err(err)
            }
        }
    }
}

/// The standard [ConnectionRpc] over an endpoint factory: caches the
/// resolved endpoint across calls and drops the cache on `clean_up`.
pub struct FactoryConnectionRpc {
    factory: Arc<dyn EndpointFactory>,
    cached: Mutex<Option<Arc<dyn EndpointRpc>>>,
}

impl FactoryConnectionRpc {
    /// Wraps a factory.
    pub fn new(factory: Arc<dyn EndpointFactory>) -> Self {
        FactoryConnectionRpc {
            factory,
            cached: Mutex::new(None),
        }
    }

    fn endpoint(&self) -> Result<Arc<dyn EndpointRpc>, RpcError> {
        if let Some(cached) = self.cached.lock().unwrap().clone() {
            return Ok(cached);
        }
        self.factory.make_endpoint()
    }
}

impl ConnectionRpc for FactoryConnectionRpc {
    fn is_reconnect_possible(&self) -> bool {
        self.factory.is_remake_possible()
    }

    fn remake_timeout(&self) -> Duration {
        self.factory.remake_timeout()
    }

    fn request_connection(
        &self,
        pid: u32,
        host_id: &str,
        sink_prefs: &[Transport],
        qos: &Qos,
    ) -> Result<(ConnectionInfo, String), RpcError> {
        let endpoint = self.endpoint()?;
        let result = endpoint.request_connection(pid, host_id, sink_prefs, false, qos)?;
        *self.cached.lock().unwrap() = Some(endpoint);
        Ok(result)
    }

    fn request_qos(&self, cookie: &str, qos: &Qos) -> Result<(), RpcError> {
        let cached = self.cached.lock().unwrap().clone();
        match cached {
            Some(endpoint) => endpoint.request_qos(cookie, qos),
            None => {
                log::warn!("cannot request QoS, no endpoint is cached");
                Ok(())
            }
        }
    }

    fn clean_up(&self) {
        *self.cached.lock().unwrap() = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    OpenDisconnected,
    OpenConnecting,
    OpenConnected,
    OpenDisconnecting,
    Closing,
    ClosingDisconnecting,
    Destroyed,
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            State::Closed => "Closed",
            State::OpenDisconnected => "OpenDisconnected",
            State::OpenConnecting => "OpenConnecting",
            State::OpenConnected => "OpenConnected",
            State::OpenDisconnecting => "OpenDisconnecting",
            State::Closing => "Closing",
            State::ClosingDisconnecting => "ClosingDisconnecting",
            State::Destroyed => "Destroyed",
        };
        f.write_str(name)
    }
}

struct SinkState {
    state: State,
    attempts: u32,
    cookie: String,
    qos: Qos,
    connection: Option<Connection>,
    worker_active: bool,
    last_error: String,
}

type Guard<'a> = MutexGuard<'a, SinkState>;

struct SinkInner {
    rpc: Box<dyn ConnectionRpc>,
    sink: SinkRef,
    transport: Transport,
    policy: FrameBufferingPolicy,
    initiator: Arc<ConnectionInitiator>,
    name: String,
    shared: Mutex<SinkState>,
    cond: Condvar,
}

/// The sink side of a media connection. Created open; reconnects on
/// network failures until destroyed.
pub struct SinkEndpoint {
    inner: Arc<SinkInner>,
}

impl std::fmt::Debug for SinkEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkEndpoint")
            .field("name", &self.inner.name)
            .finish()
    }
}

/// Creates a pull connection driven by the given RPC steps and opens it.
pub fn create_pull_connection(
    rpc: Box<dyn ConnectionRpc>,
    sink: SinkRef,
    transport: Transport,
    qos: Option<Qos>,
    policy: FrameBufferingPolicy,
    name: &str,
) -> Arc<SinkEndpoint> {
    let inner = Arc::new(SinkInner {
        rpc,
        sink,
        transport,
        policy,
        initiator: ConnectionInitiator::instance(),
        name: if name.is_empty() {
            "sink-endpoint".to_owned()
        } else {
            name.to_owned()
        },
        shared: Mutex::new(SinkState {
            state: State::Closed,
            attempts: 0,
            cookie: String::new(),
            qos: qos.unwrap_or_default(),
            connection: None,
            worker_active: false,
            last_error: String::new(),
        }),
        cond: Condvar::new(),
    });

    inner.open();
    Arc::new(SinkEndpoint { inner })
}

/// Creates a pull connection to a known endpoint reference.
pub fn create_pull_connection_by_endpoint(
    endpoint: Arc<dyn EndpointRpc>,
    sink: SinkRef,
    transport: Transport,
    qos: Option<Qos>,
    policy: FrameBufferingPolicy,
) -> Arc<SinkEndpoint> {
    create_pull_connection_by_factory(
        Arc::new(FixedEndpointFactory::new(endpoint)),
        sink,
        transport,
        qos,
        policy,
        "",
    )
}

/// Creates a pull connection to a named endpoint, re-resolving the name
/// on reconnects.
pub fn create_pull_connection_by_name(
    resolver: Arc<dyn EndpointResolver>,
    name: &str,
    sink: SinkRef,
    transport: Transport,
    qos: Option<Qos>,
    policy: FrameBufferingPolicy,
) -> Arc<SinkEndpoint> {
    create_pull_connection_by_factory(
        Arc::new(NamedEndpointFactory::new(resolver, name)),
        sink,
        transport,
        qos,
        policy,
        name,
    )
}

/// Creates a pull connection through an endpoint factory.
pub fn create_pull_connection_by_factory(
    factory: Arc<dyn EndpointFactory>,
    sink: SinkRef,
    transport: Transport,
    qos: Option<Qos>,
    policy: FrameBufferingPolicy,
    name: &str,
) -> Arc<SinkEndpoint> {
    create_pull_connection(
        Box::new(FactoryConnectionRpc::new(factory)),
        sink,
        transport,
        qos,
        policy,
        name,
    )
}

impl SinkEndpoint {
    /// Replaces the connection's QoS, forwarding it to the source when
    /// one is negotiated.
    pub fn request_qos(&self, qos: &Qos) -> Result<(), RpcError> {
        let cookie = {
            let mut shared = self.inner.shared.lock().unwrap();
            shared.qos = qos.clone();
            shared.cookie.clone()
        };

        log::info!("{}: requesting QoS, cookie={cookie}", self.inner.name);
        self.inner.rpc.request_qos(&cookie, qos)
    }

    /// Destroys the endpoint: disconnects, stops reconnecting, and makes
    /// every further transition a no-op. Idempotent.
    pub fn destroy(&self) {
        self.inner.destroy();
    }

    #[cfg(test)]
    pub(crate) fn state_name(&self) -> String {
        self.inner.shared.lock().unwrap().state.to_string()
    }
}

impl Drop for SinkEndpoint {
    fn drop(&mut self) {
        self.inner.destroy();
        log::debug!("{}: destroyed", self.inner.name);
    }
}

impl SinkConnection for SinkEndpoint {
    fn request_qos(&self, qos: &Qos) {
        if let Err(err) = SinkEndpoint::request_qos(self, qos) {
            log::warn!("{}: QoS request failed: {err}", self.inner.name);
        }
    }

    fn destroy(&self) {
        SinkEndpoint::destroy(self);
    }
}

impl SinkInner {
    fn is_open(state: State) -> bool {
        matches!(
            state,
            State::OpenDisconnected
                | State::OpenConnecting
                | State::OpenConnected
                | State::OpenDisconnecting
        )
    }

    fn change_state(&self, shared: &mut SinkState, state: State) {
        if shared.state == state {
            return;
        }
        if shared.state == State::Destroyed {
            log::warn!("{}: invalid transition requested from Destroyed", self.name);
            return;
        }

        log::trace!("{}: {} -> {state}", self.name, shared.state);
        shared.state = state;
        self.cond.notify_all();
    }

    /// Releases the endpoint lock around a blocking call.
    fn unlocked<R>(&self, shared: Guard<'_>, f: impl FnOnce() -> R) -> (Guard<'_>, R) {
        drop(shared);
        let result = f();
        (self.shared.lock().unwrap(), result)
    }

    fn open(self: &Arc<Self>) {
        let mut shared = self.shared.lock().unwrap();
        if shared.state != State::Closed {
            log::warn!("{}: open in state {}", self.name, shared.state);
            return;
        }
        self.change_state(&mut shared, State::OpenDisconnected);
        self.spawn_worker(&mut shared, Duration::ZERO);
    }

    fn spawn_worker(self: &Arc<Self>, shared: &mut SinkState, initial_delay: Duration) {
        if shared.state != State::OpenDisconnected
            || shared.worker_active
            || !self.rpc.is_reconnect_possible()
        {
            return;
        }

        shared.worker_active = true;
        let this = self.clone();
        let _ = std::thread::Builder::new()
            .name("mediabus-reconnect".into())
            .spawn(move || this.reconnect_worker(initial_delay));
    }

    fn backoff(&self, attempts: u32) -> Duration {
        let base = Duration::from_secs(1 << attempts.min(3));
        base.max(self.rpc.remake_timeout())
    }

    fn reconnect_worker(self: Arc<Self>, initial_delay: Duration) {
        let mut shared = self.shared.lock().unwrap();

        if !initial_delay.is_zero() {
            shared = self.interruptible_wait(shared, initial_delay);
        }

        while shared.state == State::OpenDisconnected && self.rpc.is_reconnect_possible() {
            log::trace!("{}: connecting...", self.name);

            let (guard, result) = self.connect(shared);
            shared = guard;

            match result {
                Ok(()) => {
                    shared.attempts = 0;
                    shared.last_error.clear();
                }
                Err(SinkError::NoTransport) => {
                    log::warn!(
                        "{}: source supports no requested transport, giving up",
                        self.name
                    );
                    shared = self.destroy_guarded(shared);
                    break;
                }
                Err(err) => {
                    let message = err.to_string();
                    if shared.last_error != message {
                        shared.last_error = message;
                        log::error!("{}: connect failed: {}", self.name, shared.last_error);
                    }
                }
            }

            if shared.state == State::OpenDisconnected && self.rpc.is_reconnect_possible() {
                self.rpc.clean_up();
                let delay = self.backoff(shared.attempts);
                shared.attempts = shared.attempts.saturating_add(1);
                shared = self.interruptible_wait(shared, delay);
            }
        }

        shared.worker_active = false;
    }

    fn interruptible_wait<'a>(&self, mut shared: Guard<'a>, delay: Duration) -> Guard<'a> {
        let deadline = Instant::now() + delay;
        loop {
            if shared.state != State::OpenDisconnected {
                return shared;
            }
            let now = Instant::now();
            if now >= deadline {
                return shared;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(shared, deadline.saturating_duration_since(now))
                .unwrap();
            shared = guard;
        }
    }

    fn generate_transport(&self) -> Vec<Transport> {
        if self.transport == Transport::Auto {
            auto_transport_preferences()
        } else {
            vec![self.transport]
        }
    }

    fn connect<'a>(self: &'a Arc<Self>, mut shared: Guard<'a>) -> (Guard<'a>, Result<(), SinkError>) {
        if shared.state != State::OpenDisconnected {
            let err = SinkError::InvalidState(format!(
                "invalid state for connect: {}",
                shared.state
            ));
            return (shared, Err(err));
        }
        self.change_state(&mut shared, State::OpenConnecting);

        let (mut shared, result) = self.connect_steps(shared);
        if result.is_err() && shared.state != State::Destroyed {
            self.change_state(&mut shared, State::OpenDisconnected);
        }
        (shared, result)
    }

    fn connect_steps<'a>(
        self: &'a Arc<Self>,
        shared: Guard<'a>,
    ) -> (Guard<'a>, Result<(), SinkError>) {
        let qos = shared.qos.clone();
        let prefs = self.generate_transport();

        // The negotiation round trip runs with the lock released.
        let (mut shared, negotiated) = self.unlocked(shared, || {
            self.rpc
                .request_connection(std::process::id(), &crate::local_host_id(), &prefs, &qos)
        });
        let (info, cookie) = match negotiated {
            Ok(pair) => pair,
            Err(err) => return (shared, Err(err.into())),
        };

        // Someone may have changed the state while we were unlocked.
        if !matches!(shared.state, State::OpenConnecting | State::OpenConnected) {
            let err = SinkError::InvalidState(format!(
                "state changed to {} during negotiation",
                shared.state
            ));
            return (shared, Err(err));
        }

        shared.cookie = cookie.clone();
        log::debug!("{}: connection info {info:?}, cookie={cookie}", self.name);

        let (mut shared, established) = self.establish_channel(shared, info, &cookie, &qos);
        if let Err(err) = established {
            return (shared, Err(err));
        }

        // An asynchronous transport may still be racing its sockets.
        let deadline = Instant::now() + Duration::from_secs(75);
        while shared.state == State::OpenConnecting {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(shared, deadline.saturating_duration_since(now))
                .unwrap();
            shared = guard;
        }

        if !matches!(
            shared.state,
            State::OpenConnecting | State::OpenConnected | State::OpenDisconnected
        ) {
            let err = SinkError::InvalidState(format!(
                "state changed to {} during connect",
                shared.state
            ));
            return (shared, Err(err));
        }

        if shared.connection.is_none() {
            self.change_state(&mut shared, State::OpenDisconnected);
            return (shared, Err(SinkError::ChannelCreation));
        }

        if qos != shared.qos {
            let qos = shared.qos.clone();
            let cookie = shared.cookie.clone();
            log::info!("{}: replaying QoS after connect, cookie={cookie}", self.name);
            let (shared, replayed) =
                self.unlocked(shared, || self.rpc.request_qos(&cookie, &qos));
            return (shared, replayed.map_err(Into::into));
        }

        (shared, Ok(()))
    }

    fn disconnect_handler(self: &Arc<Self>) -> OnNetworkDisconnect {
        let weak = Arc::downgrade(self);
        OnNetworkDisconnect::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.disconnect_and_reconnect();
            }
        })
    }

    fn establish_channel<'a>(
        self: &'a Arc<Self>,
        mut shared: Guard<'a>,
        info: ConnectionInfo,
        cookie: &str,
        qos: &Qos,
    ) -> (Guard<'a>, Result<(), SinkError>) {
        match info {
            ConnectionInfo::InProc { source: None } => (shared, Err(SinkError::NoTransport)),
            ConnectionInfo::InProc {
                source: Some(source),
            } => {
                let wrapper =
                    create_inproc_input_channel(self.sink.clone(), self.disconnect_handler());
                let connection = broker::connect(source, wrapper);
                shared.connection = Some(connection);
                self.change_state(&mut shared, State::OpenConnected);
                (shared, Ok(()))
            }
            ConnectionInfo::Local { port, allocator } => {
                let result = self.initiate_stream_transport(
                    cookie,
                    vec!["127.0.0.1".to_owned()],
                    port,
                    StreamChannelKind::Local(allocator),
                );
                (shared, result)
            }
            ConnectionInfo::Tcp { port, addresses } => {
                let result =
                    self.initiate_stream_transport(cookie, addresses, port, StreamChannelKind::Tcp);
                (shared, result)
            }
            ConnectionInfo::Udp {
                address,
                control_port,
                data_port,
            } => {
                let result = (|| -> Result<SourceRef, SinkError> {
                    let control = connect_udp(&address, control_port)?;
                    let data = connect_udp(&address, data_port)?;
                    let channel = create_udp_input_channel(
                        control,
                        data,
                        cookie,
                        self.policy,
                        self.disconnect_handler(),
                    )?;
                    Ok(channel)
                })();

                match result {
                    Ok(channel) => {
                        let connection = broker::connect(channel, self.sink.clone());
                        shared.connection = Some(connection);
                        self.change_state(&mut shared, State::OpenConnected);
                        (shared, Ok(()))
                    }
                    Err(err) => (shared, Err(err)),
                }
            }
            ConnectionInfo::Multicast {
                control_iface,
                control_port,
                data_group,
                data_port,
            } => {
                let result = (|| -> Result<SourceRef, SinkError> {
                    let control = connect_udp(&control_iface, control_port)?;
                    let channel = create_multicast_input_channel(
                        control,
                        data_group,
                        data_port,
                        cookie,
                        self.policy,
                        self.disconnect_handler(),
                    )?;
                    Ok(channel)
                })();

                match result {
                    Ok(channel) => {
                        let connection = broker::connect(channel, self.sink.clone());
                        shared.connection = Some(connection);
                        self.change_state(&mut shared, State::OpenConnected);
                        (shared, Ok(()))
                    }
                    Err(err) => (shared, Err(err)),
                }
            }
            ConnectionInfo::RpcTunnel => {
                let handler = self.disconnect_handler();
                let (mut shared, tunneled) =
                    self.unlocked(shared, || self.rpc.create_tunnel(qos, handler));

                match tunneled {
                    Ok(Some(source)) if shared.state == State::OpenConnecting => {
                        let wrapper = create_inproc_input_channel(
                            self.sink.clone(),
                            self.disconnect_handler(),
                        );
                        let connection = broker::connect(source, wrapper);
                        shared.connection = Some(connection);
                        self.change_state(&mut shared, State::OpenConnected);
                        (shared, Ok(()))
                    }
                    Ok(Some(_)) => (
                        shared,
                        Err(SinkError::InvalidState(
                            "tunnel created in an unexpected state".to_owned(),
                        )),
                    ),
                    Ok(None) => (shared, Err(SinkError::ChannelCreation)),
                    Err(err) => (shared, Err(err.into())),
                }
            }
        }
    }

    fn initiate_stream_transport(
        self: &Arc<Self>,
        cookie: &str,
        addresses: Vec<String>,
        port: u16,
        kind: StreamChannelKind,
    ) -> Result<(), SinkError> {
        let weak = Arc::downgrade(self);
        let handler = Box::new(move |socket: Option<std::net::TcpStream>| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            inner.handle_stream_socket(socket, kind);
        });

        if let Err(err) = self.initiator.initiate(cookie, &addresses, port, handler) {
            log::error!("{}: cannot initiate connection: {err}", self.name);
            return Err(SinkError::ChannelCreation);
        }
        Ok(())
    }

    fn handle_stream_socket(
        self: &Arc<Self>,
        socket: Option<std::net::TcpStream>,
        kind: StreamChannelKind,
    ) {
        let Some(socket) = socket else {
            self.disconnect_and_reconnect();
            return;
        };

        let mut shared = self.shared.lock().unwrap();
        if shared.state != State::OpenConnecting {
            log::warn!(
                "{}: closing socket, endpoint is in state {}",
                self.name,
                shared.state
            );
            let _ = socket.shutdown(std::net::Shutdown::Both);
            return;
        }

        let on_disconnect = self.disconnect_handler();
        let channel = match &kind {
            StreamChannelKind::Local(allocator) => {
                create_local_input_channel(socket, allocator, self.policy, on_disconnect)
            }
            StreamChannelKind::Tcp => {
                create_pull_tcp_input_channel(socket, self.policy, on_disconnect)
            }
        };

        match channel {
            Ok(channel) => {
                let connection = broker::connect(channel, self.sink.clone());
                shared.connection = Some(connection);
                self.change_state(&mut shared, State::OpenConnected);
            }
            Err(err) => {
                log::warn!("{}: failed to build input channel: {err}", self.name);
                self.change_state(&mut shared, State::OpenDisconnected);
            }
        }
    }

    fn disconnect_and_reconnect(self: &Arc<Self>) {
        let shared = self.shared.lock().unwrap();
        if Self::is_open(shared.state) {
            let mut shared = self.disconnect(shared);
            let delay = self.backoff(shared.attempts);
            self.spawn_worker(&mut shared, delay);
        }
    }

    fn disconnect<'a>(&'a self, mut shared: Guard<'a>) -> Guard<'a> {
        if matches!(
            shared.state,
            State::OpenDisconnecting
                | State::OpenDisconnected
                | State::Closed
                | State::ClosingDisconnecting
        ) {
            return shared;
        }

        if shared.state == State::Closing {
            self.change_state(&mut shared, State::ClosingDisconnecting);
        } else {
            self.change_state(&mut shared, State::OpenDisconnecting);
        }

        if let Some(connection) = shared.connection.take() {
            let (guard, _) = self.unlocked(shared, || {
                connection.disconnect();
                drop(connection);
            });
            shared = guard;
        }

        self.rpc.clean_up();

        if shared.state == State::ClosingDisconnecting {
            self.change_state(&mut shared, State::Closing);
        } else {
            self.change_state(&mut shared, State::OpenDisconnected);
        }
        shared
    }

    fn close<'a>(&'a self, mut shared: Guard<'a>) -> Guard<'a> {
        if shared.state == State::Closed {
            return shared;
        }
        if matches!(shared.state, State::Closing | State::ClosingDisconnecting) {
            log::warn!("{}: recursive close ignored", self.name);
            return shared;
        }

        self.change_state(&mut shared, State::Closing);
        let mut shared = self.disconnect(shared);
        self.change_state(&mut shared, State::Closed);
        shared
    }

    fn destroy(&self) {
        let shared = self.shared.lock().unwrap();
        drop(self.destroy_guarded(shared));
    }

    fn destroy_guarded<'a>(&'a self, shared: Guard<'a>) -> Guard<'a> {
        if shared.state == State::Destroyed {
            return shared;
        }
        let mut shared = self.close(shared);
        self.change_state(&mut shared, State::Destroyed);
        shared
    }
}

#[derive(Clone)]
enum StreamChannelKind {
    Local(AllocatorParams),
    Tcp,
}

fn connect_udp(address: &str, port: u16) -> Result<UdpSocket, SinkError> {
    let socket = UdpSocket::bind(SocketAddrV4::new(std::net::Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect((address, port))?;
    Ok(socket)
}

#[derive(Default)]
struct RemoteShared {
    downstream: Mutex<Option<SinkRef>>,
    upstream: Mutex<Option<SourceRef>>,
    debt: Mutex<u32>,
}

struct RemoteSinkProxy {
    shared: Arc<RemoteShared>,
}

impl PullSink for RemoteSinkProxy {
    fn on_connected(&self, source: &SourceRef) {
        let debt = {
            *self.shared.upstream.lock().unwrap() = Some(source.clone());
            *self.shared.debt.lock().unwrap()
        };
        if debt > 0 {
            source.request(debt);
        }
    }

    fn on_disconnected(&self) {
        *self.shared.upstream.lock().unwrap() = None;
    }

    fn receive(&self, sample: Sample) {
        {
            let mut debt = self.shared.debt.lock().unwrap();
            if *debt == 0 {
                return;
            }
            *debt -= 1;
        }

        let downstream = self.shared.downstream.lock().unwrap().clone();
        if let Some(downstream) = downstream {
            downstream.receive(sample);
        }
    }
}

/// A pull source backed by a remote endpoint: local code connects to it
/// as if the remote stream were in-process, while the embedded sink
/// endpoint maintains the network connection and replays outstanding
/// credits across reconnects.
pub struct RemoteSource {
    shared: Arc<RemoteShared>,
    endpoint: Mutex<Option<Arc<SinkEndpoint>>>,
}

impl PullSource for RemoteSource {
    fn on_connected(&self, sink: &SinkRef) {
        *self.shared.downstream.lock().unwrap() = Some(sink.clone());
    }

    fn on_disconnected(&self) {
        *self.shared.debt.lock().unwrap() = 0;
        *self.shared.downstream.lock().unwrap() = None;
    }

    fn request(&self, count: u32) {
        let upstream = {
            *self.shared.debt.lock().unwrap() += count;
            self.shared.upstream.lock().unwrap().clone()
        };
        if let Some(upstream) = upstream {
            upstream.request(count);
        }
    }
}

impl Drop for RemoteSource {
    fn drop(&mut self) {
        if let Some(endpoint) = self.endpoint.lock().unwrap().take() {
            endpoint.destroy();
        }
    }
}

/// Creates a pull source facade over a remote endpoint.
pub fn create_pull_source_by_endpoint(
    endpoint: Arc<dyn EndpointRpc>,
    transport: Transport,
    qos: Option<Qos>,
    policy: FrameBufferingPolicy,
) -> Arc<RemoteSource> {
    let shared = Arc::new(RemoteShared::default());
    let proxy = Arc::new(RemoteSinkProxy {
        shared: shared.clone(),
    });
    let sink_endpoint = create_pull_connection_by_endpoint(endpoint, proxy, transport, qos, policy);

    Arc::new(RemoteSource {
        shared,
        endpoint: Mutex::new(Some(sink_endpoint)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::test_util::RecordingSink;
    use crate::broker::QosAwareSource;
    use std::time::Instant;

    struct StubSource {
        sink: Mutex<Option<SinkRef>>,
    }

    impl PullSource for StubSource {
        fn on_connected(&self, sink: &SinkRef) {
            *self.sink.lock().unwrap() = Some(sink.clone());
        }

        fn on_disconnected(&self) {
            *self.sink.lock().unwrap() = None;
        }

        fn request(&self, count: u32) {
            let sink = self.sink.lock().unwrap().clone();
            if let Some(sink) = sink {
                for i in 0..count {
                    sink.receive(Sample::with_body(
                        crate::protocol::SampleHeader {
                            timestamp: i as u64,
                            ..Default::default()
                        },
                        Vec::new(),
                    ));
                }
            }
        }
    }

    impl QosAwareSource for StubSource {
        fn modify_qos(&self, _qos: &Qos) {}
    }

    struct FlakyRpc {
        failures: Mutex<u32>,
        cleanups: Mutex<u32>,
        source: Arc<StubSource>,
    }

    impl FlakyRpc {
        fn failing(failures: u32) -> Arc<Self> {
            Arc::new(FlakyRpc {
                failures: Mutex::new(failures),
                cleanups: Mutex::new(0),
                source: Arc::new(StubSource {
                    sink: Mutex::new(None),
                }),
            })
        }
    }

    impl ConnectionRpc for Arc<FlakyRpc> {
        fn is_reconnect_possible(&self) -> bool {
            true
        }

        fn remake_timeout(&self) -> Duration {
            Duration::from_secs(1)
        }

        fn request_connection(
            &self,
            _pid: u32,
            _host_id: &str,
            _sink_prefs: &[Transport],
            _qos: &Qos,
        ) -> Result<(ConnectionInfo, String), RpcError> {
            {
                let mut failures = self.failures.lock().unwrap();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(RpcError::Unavailable("upstream still booting".into()));
                }
            }

            Ok((
                ConnectionInfo::InProc {
                    source: Some(self.source.clone()),
                },
                crate::protocol::new_cookie(),
            ))
        }

        fn request_qos(&self, _cookie: &str, _qos: &Qos) -> Result<(), RpcError> {
            Ok(())
        }

        fn clean_up(&self) {
            *self.cleanups.lock().unwrap() += 1;
        }
    }

    fn wait_for<F: Fn() -> bool>(cond: F) {
        let deadline = Instant::now() + Duration::from_secs(20);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out");
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test_log::test]
    fn reconnects_with_growing_delays_until_the_source_appears() {
        let rpc = FlakyRpc::failing(2);
        let sink = Arc::new(RecordingSink::default());

        let started = Instant::now();
        let endpoint = create_pull_connection(
            Box::new(rpc.clone()),
            sink,
            Transport::Auto,
            None,
            FrameBufferingPolicy::Buffered,
            "flaky",
        );

        wait_for(|| endpoint.state_name() == "OpenConnected");

        // Two failed attempts mean at least the first two backoff delays
        // were waited out, and the cached reference was dropped each time.
        assert!(started.elapsed() >= Duration::from_secs(3));
        assert!(*rpc.cleanups.lock().unwrap() >= 2);
    }

    #[test_log::test]
    fn destroy_is_idempotent() {
        let rpc = FlakyRpc::failing(0);
        let sink = Arc::new(RecordingSink::default());

        let endpoint = create_pull_connection(
            Box::new(rpc),
            sink,
            Transport::Auto,
            None,
            FrameBufferingPolicy::Buffered,
            "doomed",
        );

        wait_for(|| endpoint.state_name() == "OpenConnected");

        endpoint.destroy();
        assert_eq!(endpoint.state_name(), "Destroyed");
        endpoint.destroy();
        assert_eq!(endpoint.state_name(), "Destroyed");
    }
}
