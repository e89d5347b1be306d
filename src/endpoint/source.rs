//! The source-side endpoint: negotiates transports for sinks, mints
//! cookies, and owns one proxy source per connected sink.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use super::{ConnectionInfo, EndpointRpc, RpcError, StorageEndpointRpc};
use crate::broker::{
    self, Connection, PullSource, QosAwareSource, QosSourceRef, SeekableSource, SinkRef,
};
use crate::channel::{
    local::create_local_output_channel,
    multicast::{create_multicast_output_channel, generate_multicast_address},
    tcp::create_pull_tcp_output_channel,
    udp::create_udp_output_channel,
    OnNetworkDisconnect,
};
use crate::net::{
    acceptor::{TcpConnectionAcceptor, UdpPortAllocator},
    InterfaceProvider, SystemInterfaces,
};
use crate::protocol::{
    self, EndpointStatistics, MediaTime, PlayMode, Qos, SharedMemoryKind, StartPosition, Transport,
};
use crate::sample::AllocatorRequirements;
use crate::stats::StatisticsCollector;

/// Produces the per-sink sources an endpoint hands out.
pub trait SourceFactory: Send + Sync {
    /// Builds a source applying the given QoS. `None` when the factory
    /// cannot serve more sinks.
    fn create_source(&self, qos: &Qos) -> Option<QosSourceRef>;

    /// The allocation requirements shared by this factory's sources.
    fn allocator_requirements(&self) -> AllocatorRequirements {
        AllocatorRequirements::default()
    }

    /// The telemetry collector of the underlying stream, if any.
    fn statistics_collector(&self) -> Option<Arc<dyn StatisticsCollector>> {
        None
    }
}

struct ProxyState {
    pin: Option<QosSourceRef>,
    qos: Qos,
    sink: Option<SinkRef>,
    connection: Option<Connection>,
}

/// A per-sink wrapper over a factory-built source. Forwards credits and
/// connection events, records QoS until the inner source binds, and
/// notifies the endpoint when it dies.
pub struct ProxySource {
    state: Mutex<ProxyState>,
    on_destroy: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl ProxySource {
    fn new(on_destroy: impl FnOnce() + Send + 'static) -> Arc<Self> {
        Arc::new(ProxySource {
            state: Mutex::new(ProxyState {
                pin: None,
                qos: Qos::new(),
                sink: None,
                connection: None,
            }),
            on_destroy: Mutex::new(Some(Box::new(on_destroy))),
        })
    }

    /// Binds the inner source, replaying the recorded QoS and any live
    /// sink connection.
    pub fn set_source(&self, source: QosSourceRef) {
        let (qos, sink) = {
            let mut state = self.state.lock().unwrap();
            state.pin = Some(source.clone());
            (state.qos.clone(), state.sink.clone())
        };

        source.modify_qos(&qos);
        if let Some(sink) = &sink {
            source.on_connected(sink);
        }
    }

    fn set_connection(&self, connection: Connection) {
        self.state.lock().unwrap().connection = Some(connection);
    }

    /// Tears down the connection to this sink, if any. In-process sinks
    /// own the broker connection themselves; for those, both pins are
    /// notified directly.
    pub fn disconnect(&self) {
        let (connection, sink, pin) = {
            let mut state = self.state.lock().unwrap();
            (state.connection.take(), state.sink.take(), state.pin.clone())
        };

        match connection {
            Some(connection) => connection.disconnect(),
            None => {
                if let Some(pin) = pin {
                    pin.on_disconnected();
                }
                if let Some(sink) = sink {
                    sink.on_disconnected();
                }
            }
        }
    }
}

impl Drop for ProxySource {
    fn drop(&mut self) {
        if let Some(on_destroy) = self.on_destroy.lock().unwrap().take() {
            on_destroy();
        }
    }
}

impl PullSource for ProxySource {
    fn on_connected(&self, sink: &SinkRef) {
        let pin = {
            let mut state = self.state.lock().unwrap();
            state.sink = Some(sink.clone());
            state.pin.clone()
        };
        if let Some(pin) = pin {
            pin.on_connected(sink);
        }
    }

    fn on_disconnected(&self) {
        let pin = {
            let mut state = self.state.lock().unwrap();
            state.sink = None;
            state.pin.clone()
        };
        if let Some(pin) = pin {
            pin.on_disconnected();
        }
    }

    fn request(&self, count: u32) {
        let pin = self.state.lock().unwrap().pin.clone();
        if let Some(pin) = pin {
            pin.request(count);
        }
    }
}

impl QosAwareSource for ProxySource {
    fn modify_qos(&self, qos: &Qos) {
        let pin = {
            let mut state = self.state.lock().unwrap();
            state.qos = qos.clone();
            state.pin.clone()
        };
        if let Some(pin) = pin {
            pin.modify_qos(qos);
        }
    }

    fn reprocess_qos(&self) {
        let pin = self.state.lock().unwrap().pin.clone();
        if let Some(pin) = pin {
            pin.reprocess_qos();
        }
    }
}

fn proxy_disconnect_handler(proxy: &Arc<ProxySource>) -> OnNetworkDisconnect {
    let weak = Arc::downgrade(proxy);
    OnNetworkDisconnect::new(move || {
        if let Some(proxy) = weak.upgrade() {
            proxy.disconnect();
        }
    })
}

/// Construction parameters of a source endpoint.
pub struct SourceEndpointOptions {
    /// The address of this endpoint as the calling peer sees it; always
    /// advertised first.
    pub advertised_address: String,
    /// This host's identity, matched against callers for same-host
    /// transports.
    pub host_id: String,
    /// Administrator-configured extra addresses, always appended.
    pub alt_addresses: Vec<String>,
    /// Interface enumeration used for address advertisement.
    pub interfaces: Arc<dyn InterfaceProvider>,
    /// Overrides the process-wide TCP acceptor (tests).
    pub acceptor: Option<Arc<TcpConnectionAcceptor>>,
    /// Overrides the process-wide UDP port allocator (tests).
    pub udp_ports: Option<Arc<UdpPortAllocator>>,
    /// How long a minted cookie stays valid.
    pub cookie_timeout: Duration,
    /// How long a transient endpoint lives without sinks.
    pub unused_timeout: Duration,
}

impl SourceEndpointOptions {
    /// Options from the process environment.
    pub fn from_env() -> Self {
        SourceEndpointOptions {
            advertised_address: "127.0.0.1".to_owned(),
            host_id: crate::local_host_id(),
            alt_addresses: crate::alt_addresses_from_env(),
            interfaces: Arc::new(SystemInterfaces::from_env()),
            acceptor: None,
            udp_ports: None,
            cookie_timeout: Duration::from_secs(60),
            unused_timeout: Duration::from_secs(60),
        }
    }
}

struct MulticastShare {
    control_iface: String,
    control_port: u16,
    data_group: Ipv4Addr,
    data_port: u16,
}

struct SourceEndpointInner {
    factory: Arc<dyn SourceFactory>,
    options: SourceEndpointOptions,
    pid: u32,
    cookies: Mutex<HashMap<String, Weak<ProxySource>>>,
    acceptor: Mutex<Option<Arc<TcpConnectionAcceptor>>>,
    udp_ports: Mutex<Option<Arc<UdpPortAllocator>>>,
    multicast: Mutex<Option<MulticastShare>>,
    on_destroy: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

/// An addressable media source: negotiates one connection per
/// `request_connection` call and owns the resulting proxy sources.
pub struct SourceEndpoint {
    inner: Arc<SourceEndpointInner>,
}

impl std::fmt::Debug for SourceEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceEndpoint")
            .field("host_id", &self.inner.options.host_id)
            .finish()
    }
}

/// Creates an endpoint for the given source factory. With an `on_destroy`
/// callback the endpoint is transient: it destroys itself (invoking the
/// callback) when its last proxy source dies or when nobody connects
/// within the unused timeout.
pub fn create_pull_source_endpoint(
    factory: Arc<dyn SourceFactory>,
    options: SourceEndpointOptions,
    on_destroy: Option<Box<dyn FnOnce() + Send>>,
) -> Arc<SourceEndpoint> {
    let transient = on_destroy.is_some();
    let unused_timeout = options.unused_timeout;

    let inner = Arc::new(SourceEndpointInner {
        factory,
        pid: std::process::id(),
        acceptor: Mutex::new(options.acceptor.clone()),
        udp_ports: Mutex::new(options.udp_ports.clone()),
        options,
        cookies: Mutex::new(HashMap::new()),
        multicast: Mutex::new(None),
        on_destroy: Mutex::new(on_destroy),
    });

    if transient {
        let weak = Arc::downgrade(&inner);
        let _ = std::thread::Builder::new()
            .name("mediabus-transient".into())
            .spawn(move || {
                std::thread::sleep(unused_timeout);
                if let Some(inner) = weak.upgrade() {
                    if !inner.is_using() {
                        log::warn!("source endpoint destroyed on timeout because unused");
                        inner.destroy();
                    }
                }
            });
    }

    Arc::new(SourceEndpoint { inner })
}

impl SourceEndpoint {
    /// Tears down every proxy source and fires the destroy callback.
    pub fn destroy(&self) {
        self.inner.destroy();
    }

    /// Whether any proxy source is still alive.
    pub fn is_using(&self) -> bool {
        self.inner.is_using()
    }
}

impl Drop for SourceEndpoint {
    fn drop(&mut self) {
        self.inner.destroy();
    }
}

impl SourceEndpointInner {
    fn acceptor(&self) -> Result<Arc<TcpConnectionAcceptor>, RpcError> {
        let mut slot = self.acceptor.lock().unwrap();
        if let Some(acceptor) = slot.as_ref() {
            return Ok(acceptor.clone());
        }

        let acceptor = TcpConnectionAcceptor::instance()
            .map_err(|err| RpcError::Unavailable(err.to_string()))?;
        *slot = Some(acceptor.clone());
        Ok(acceptor)
    }

    fn udp_ports(&self) -> Arc<UdpPortAllocator> {
        let mut slot = self.udp_ports.lock().unwrap();
        slot.get_or_insert_with(UdpPortAllocator::instance).clone()
    }

    fn advertised_ip(&self) -> Ipv4Addr {
        self.options
            .advertised_address
            .parse()
            .unwrap_or(Ipv4Addr::LOCALHOST)
    }

    fn allowed_transports(&self, pid: u32, host_id: &str) -> Vec<Transport> {
        let mut allowed = vec![Transport::Tcp, Transport::Udp, Transport::Multicast];

        if host_id == self.options.host_id {
            let shared = self
                .factory
                .allocator_requirements()
                .allocator
                .map(|a| a.shared_memory() != SharedMemoryKind::None)
                .unwrap_or(false);
            if shared {
                allowed.push(Transport::Local);
            }
            if pid == self.pid {
                allowed.push(Transport::InProc);
            }
        }

        allowed
    }

    fn advertised_tcp_addresses(&self, is_local: bool, use_all_addresses: bool) -> Vec<String> {
        let mut addresses = vec![self.options.advertised_address.clone()];

        if is_local {
            addresses.push("127.0.0.1".to_owned());
        } else {
            let up: Vec<String> = self
                .options
                .interfaces
                .interfaces()
                .into_iter()
                .filter(|i| i.is_up)
                .map(|i| i.address.to_string())
                .collect();

            let advertised_is_down = !up
                .iter()
                .any(|a| *a == self.options.advertised_address || *a == "127.0.0.1");
            if (use_all_addresses || advertised_is_down) && !up.is_empty() {
                addresses = up;
            }
        }

        addresses.extend(self.options.alt_addresses.iter().cloned());
        addresses
    }

    fn create_inner_source(&self, qos: &Qos) -> Result<QosSourceRef, RpcError> {
        self.factory.create_source(qos).ok_or_else(|| {
            log::error!("source factory refused to create a source");
            RpcError::InvalidState
        })
    }

    fn wire_output(&self, proxy: &Arc<ProxySource>, source: QosSourceRef, channel: SinkRef) {
        proxy.set_source(source);
        let connection = broker::connect(proxy.clone(), channel);
        proxy.set_connection(connection);
    }

    fn register_stream_handler(
        self: &Arc<Self>,
        acceptor: &TcpConnectionAcceptor,
        cookie: &str,
        proxy: Arc<ProxySource>,
        qos: Qos,
        transport: Transport,
    ) -> Result<(), RpcError> {
        let weak = Arc::downgrade(self);
        let handler = Box::new(move |socket: Option<std::net::TcpStream>| {
            let Some(socket) = socket else {
                return;
            };
            let Some(endpoint) = weak.upgrade() else {
                return;
            };

            let Ok(source) = endpoint.create_inner_source(&qos) else {
                return;
            };

            let on_disconnect = proxy_disconnect_handler(&proxy);
            let channel = match transport {
                Transport::Local => {
                    let allocator = endpoint.factory.allocator_requirements().allocator;
                    create_local_output_channel(socket, allocator, on_disconnect)
                }
                Transport::Tcp => create_pull_tcp_output_channel(socket, on_disconnect),
                other => {
                    log::error!("unsupported transport {other:?} for a stream socket");
                    return;
                }
            };

            match channel {
                Ok(channel) => endpoint.wire_output(&proxy, source, channel),
                Err(err) => log::warn!("failed to build output channel: {err}"),
            }
        });

        acceptor
            .register(cookie, handler, self.options.cookie_timeout)
            .map_err(|err| {
                log::error!("cookie registration failed: {err}");
                RpcError::InvalidState
            })
    }

    fn connect_udp(
        self: &Arc<Self>,
        proxy: &Arc<ProxySource>,
        qos: &Qos,
        cookie: &str,
    ) -> Result<ConnectionInfo, RpcError> {
        let ports = self.udp_ports();
        let ip = self.advertised_ip();

        let (control, data) = match (ports.create_socket(ip), ports.create_socket(ip)) {
            (Some(control), Some(data)) => (control, data),
            _ => {
                log::error!("failed to create udp socket");
                return Err(RpcError::InvalidState);
            }
        };

        let info = ConnectionInfo::Udp {
            address: self.options.advertised_address.clone(),
            control_port: control.local_addr().map_err(io_unavailable)?.port(),
            data_port: data.local_addr().map_err(io_unavailable)?.port(),
        };
        log::info!("created udp connection {info:?}");

        let source = self.create_inner_source(qos)?;
        let channel =
            create_udp_output_channel(control, data, cookie, proxy_disconnect_handler(proxy))
                .map_err(io_unavailable)?;
        self.wire_output(proxy, source, channel);

        Ok(info)
    }

    fn connect_multicast(
        self: &Arc<Self>,
        proxy: &Arc<ProxySource>,
        qos: &Qos,
        cookie: &str,
    ) -> Result<ConnectionInfo, RpcError> {
        let mut share = self.multicast.lock().unwrap();
        if let Some(share) = share.as_ref() {
            return Ok(ConnectionInfo::Multicast {
                control_iface: share.control_iface.clone(),
                control_port: share.control_port,
                data_group: share.data_group,
                data_port: share.data_port,
            });
        }

        let (data_group, data_port) = generate_multicast_address();
        log::info!("generated multicast address {data_group}:{data_port}");

        let control = self
            .udp_ports()
            .create_socket(self.advertised_ip())
            .ok_or_else(|| {
                log::error!("failed to create udp socket");
                RpcError::InvalidState
            })?;
        let control_port = control.local_addr().map_err(io_unavailable)?.port();

        let source = self.create_inner_source(qos)?;
        let channel = create_multicast_output_channel(
            control,
            data_group,
            data_port,
            cookie,
            proxy_disconnect_handler(proxy),
        )
        .map_err(io_unavailable)?;
        self.wire_output(proxy, source, channel);

        *share = Some(MulticastShare {
            control_iface: self.options.advertised_address.clone(),
            control_port,
            data_group,
            data_port,
        });

        Ok(ConnectionInfo::Multicast {
            control_iface: self.options.advertised_address.clone(),
            control_port,
            data_group,
            data_port,
        })
    }

    fn on_proxy_destroy(&self, cookie: &str) {
        let empty = {
            let mut cookies = self.cookies.lock().unwrap();
            cookies.remove(cookie);
            cookies.is_empty()
        };

        if empty {
            self.destroy_if_transient();
        }
    }

    fn destroy_if_transient(&self) {
        if self.on_destroy.lock().unwrap().is_some() {
            self.destroy();
        }
    }

    fn is_using(&self) -> bool {
        self.cookies
            .lock()
            .unwrap()
            .values()
            .any(|w| w.strong_count() > 0)
    }

    fn destroy(&self) {
        let cookies = std::mem::take(&mut *self.cookies.lock().unwrap());
        for (_, weak) in cookies {
            if let Some(proxy) = weak.upgrade() {
                proxy.disconnect();
            }
        }

        if let Some(on_destroy) = self.on_destroy.lock().unwrap().take() {
            on_destroy();
        }
    }
}

fn io_unavailable(err: std::io::Error) -> RpcError {
    RpcError::Unavailable(err.to_string())
}

impl EndpointRpc for SourceEndpoint {
    fn request_connection(
        &self,
        pid: u32,
        host_id: &str,
        sink_prefs: &[Transport],
        use_all_addresses: bool,
        qos: &Qos,
    ) -> Result<(ConnectionInfo, String), RpcError> {
        let inner = &self.inner;
        let allowed = inner.allowed_transports(pid, host_id);
        let Some(&chosen) = sink_prefs.iter().find(|p| allowed.contains(p)) else {
            return Ok((ConnectionInfo::InProc { source: None }, String::new()));
        };

        let cookie = protocol::new_cookie();
        let weak = Arc::downgrade(inner);
        let destroy_cookie = cookie.clone();
        let proxy = ProxySource::new(move || {
            if let Some(endpoint) = weak.upgrade() {
                endpoint.on_proxy_destroy(&destroy_cookie);
            }
        });
        proxy.modify_qos(qos);
        inner
            .cookies
            .lock()
            .unwrap()
            .insert(cookie.clone(), Arc::downgrade(&proxy));

        log::debug!("negotiated transport {chosen:?} for pid {pid} on {host_id}");

        let info = match chosen {
            Transport::InProc => {
                let source = inner.create_inner_source(qos)?;
                proxy.set_source(source);
                ConnectionInfo::InProc {
                    source: Some(proxy.clone() as QosSourceRef),
                }
            }
            Transport::Udp => inner.connect_udp(&proxy, qos, &cookie)?,
            Transport::Multicast => inner.connect_multicast(&proxy, qos, &cookie)?,
            Transport::Local => {
                let acceptor = inner.acceptor()?;
                let info = ConnectionInfo::Local {
                    port: acceptor.port(),
                    allocator: inner.factory.allocator_requirements().params(),
                };
                inner.register_stream_handler(
                    &acceptor,
                    &cookie,
                    proxy.clone(),
                    qos.clone(),
                    Transport::Local,
                )?;
                info
            }
            Transport::Tcp => {
                let acceptor = inner.acceptor()?;
                let info = ConnectionInfo::Tcp {
                    port: acceptor.port(),
                    addresses: inner.advertised_tcp_addresses(
                        host_id == inner.options.host_id,
                        use_all_addresses,
                    ),
                };
                inner.register_stream_handler(
                    &acceptor,
                    &cookie,
                    proxy.clone(),
                    qos.clone(),
                    Transport::Tcp,
                )?;
                info
            }
            other => {
                log::error!("unknown connection type {other:?}");
                return Err(RpcError::InvalidState);
            }
        };

        Ok((info, cookie))
    }

    fn request_qos(&self, cookie: &str, qos: &Qos) -> Result<(), RpcError> {
        let proxy = self
            .inner
            .cookies
            .lock()
            .unwrap()
            .get(cookie)
            .and_then(Weak::upgrade);

        match proxy {
            Some(proxy) => {
                proxy.modify_qos(qos);
                Ok(())
            }
            None => {
                log::error!("unknown cookie value: {cookie}");
                Err(RpcError::InvalidState)
            }
        }
    }

    fn get_statistics(&self) -> Result<EndpointStatistics, RpcError> {
        match self.inner.factory.statistics_collector() {
            Some(collector) => Ok(collector.statistics()),
            None => {
                log::info!("statistics are not supported by this source");
                Ok(EndpointStatistics::default())
            }
        }
    }
}

/// A factory wrapping one pre-built seekable source, for archive reader
/// endpoints that serve a single logical stream.
pub struct DisposableSourceFactory {
    source: Arc<dyn SeekableSource>,
    statistics: Option<Arc<dyn StatisticsCollector>>,
}

impl DisposableSourceFactory {
    /// Wraps a source.
    pub fn new(source: Arc<dyn SeekableSource>) -> Self {
        DisposableSourceFactory {
            source,
            statistics: None,
        }
    }

    /// Wraps a source together with its telemetry collector.
    pub fn with_statistics(
        source: Arc<dyn SeekableSource>,
        statistics: Arc<dyn StatisticsCollector>,
    ) -> Self {
        DisposableSourceFactory {
            source,
            statistics: Some(statistics),
        }
    }
}

impl SourceFactory for DisposableSourceFactory {
    fn create_source(&self, qos: &Qos) -> Option<QosSourceRef> {
        self.source.modify_qos(qos);
        Some(self.source.clone())
    }

    fn statistics_collector(&self) -> Option<Arc<dyn StatisticsCollector>> {
        self.statistics.clone()
    }
}

/// A transient endpoint over a seekable source, additionally serving the
/// seek operation of the storage RPC surface.
pub struct SeekableSourceEndpoint {
    base: Arc<SourceEndpoint>,
    source: Weak<dyn SeekableSource>,
}

/// Creates a seekable (archive reader) endpoint over the given source.
pub fn create_seekable_source_endpoint(
    source: Arc<dyn SeekableSource>,
    statistics: Option<Arc<dyn StatisticsCollector>>,
    options: SourceEndpointOptions,
    on_destroy: Option<Box<dyn FnOnce() + Send>>,
) -> Arc<SeekableSourceEndpoint> {
    let factory = match statistics {
        Some(stats) => DisposableSourceFactory::with_statistics(source.clone(), stats),
        None => DisposableSourceFactory::new(source.clone()),
    };

    let base = create_pull_source_endpoint(Arc::new(factory), options, on_destroy);
    Arc::new(SeekableSourceEndpoint {
        base,
        source: Arc::downgrade(&source),
    })
}

impl EndpointRpc for SeekableSourceEndpoint {
    fn request_connection(
        &self,
        pid: u32,
        host_id: &str,
        sink_prefs: &[Transport],
        use_all_addresses: bool,
        qos: &Qos,
    ) -> Result<(ConnectionInfo, String), RpcError> {
        self.base
            .request_connection(pid, host_id, sink_prefs, use_all_addresses, qos)
    }

    fn request_qos(&self, cookie: &str, qos: &Qos) -> Result<(), RpcError> {
        self.base.request_qos(cookie, qos)
    }

    fn get_statistics(&self) -> Result<EndpointStatistics, RpcError> {
        self.base.get_statistics()
    }
}

impl StorageEndpointRpc for SeekableSourceEndpoint {
    fn seek(
        &self,
        time: MediaTime,
        start: StartPosition,
        mode: PlayMode,
        session_id: u32,
    ) -> Result<(), RpcError> {
        let Some(source) = self.source.upgrade() else {
            return Err(RpcError::InvalidState);
        };

        source.seek(time, start, mode, session_id);
        Ok(())
    }
}
