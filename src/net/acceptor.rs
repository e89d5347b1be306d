//! The process-wide TCP connection acceptor and UDP port allocator.
//!
//! The acceptor listens on one port, chosen by scanning the configured
//! range, bound on every whitelisted up interface. Inbound sockets present
//! a one-shot cookie; matching sockets receive the greeting and are handed
//! to the registered handler. The accept loop only runs while at least one
//! cookie is registered.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::ops::Range;
use std::os::fd::{FromRawFd, IntoRawFd};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use mio::{Interest, Token};

use super::{split_up_down, IfaceInfo, InterfaceProvider, SystemInterfaces};
use crate::protocol::{COOKIE_LENGTH, CONNECTION_GREETING};

/// Called with the accepted socket on a cookie match, or with `None` on
/// timeout or cancellation.
pub type AcceptHandler = Box<dyn FnOnce(Option<std::net::TcpStream>) + Send + 'static>;

/// An error raised by the acceptor's registration surface.
#[derive(Debug, thiserror::Error)]
pub enum AcceptorError {
    /// A handler with the same cookie is already registered.
    #[error("attempted to register a handler with the same cookie twice")]
    DuplicateCookie,
    /// The acceptor could not start or bind.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

const WAKER: Token = Token(0);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

struct Pending {
    handler: AcceptHandler,
    deadline: Instant,
}

enum Command {
    Interfaces(Vec<IfaceInfo>),
}

struct Shared {
    port: u16,
    waker: mio::Waker,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    handlers: HashMap<String, Pending>,
    commands: Vec<Command>,
    shutdown: bool,
}

impl Shared {
    fn wake(&self) {
        if let Err(err) = self.waker.wake() {
            log::warn!("failed to wake acceptor loop: {err}");
        }
    }
}

/// Process-wide TCP connection acceptor.
pub struct TcpConnectionAcceptor {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for TcpConnectionAcceptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnectionAcceptor")
            .field("port", &self.shared.port)
            .finish()
    }
}

impl TcpConnectionAcceptor {
    /// The process-wide instance, configured from the environment. Created
    /// lazily; the same instance is returned while anyone holds it.
    pub fn instance() -> Result<Arc<Self>, AcceptorError> {
        static INSTANCE: OnceLock<Mutex<Weak<TcpConnectionAcceptor>>> = OnceLock::new();

        let slot = INSTANCE.get_or_init(Default::default);
        let mut guard = slot.lock().unwrap();
        if let Some(existing) = guard.upgrade() {
            return Ok(existing);
        }

        let fresh = Self::new(
            Arc::new(SystemInterfaces::from_env()),
            crate::port_range_from_env(),
        )?;
        *guard = Arc::downgrade(&fresh);
        Ok(fresh)
    }

    /// Starts an acceptor over the given interfaces and port range.
    ///
    /// Scans the range and picks the first port that binds on every up
    /// interface; refuses to start when the range is empty or fully
    /// occupied.
    pub fn new(
        provider: Arc<dyn InterfaceProvider>,
        ports: Range<u16>,
    ) -> Result<Arc<Self>, AcceptorError> {
        let (up, down) = split_up_down(provider.interfaces());
        if up.is_empty() {
            return Err(AcceptorError::Io(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "no available listen endpoints",
            )));
        }

        let (port, listeners) = Self::scan_port_range(&up, ports)?;

        let poll = mio::Poll::new()?;
        let waker = mio::Waker::new(poll.registry(), WAKER)?;

        let shared = Arc::new(Shared {
            port,
            waker,
            state: Mutex::new(State::default()),
        });

        let mut reactor = AcceptorLoop {
            poll,
            shared: shared.clone(),
            contexts: Vec::new(),
            next_token: 1,
            accepting: false,
        };
        for (address, listener) in listeners {
            reactor.add_listener(address, listener)?;
        }
        for iface in down {
            reactor.contexts.push(ListenerContext {
                address: iface.address,
                entry: None,
            });
        }

        std::thread::Builder::new()
            .name("mediabus-acceptor".into())
            .spawn(move || reactor.run())?;

        Ok(Arc::new(TcpConnectionAcceptor { shared }))
    }

    fn scan_port_range(
        up: &[IfaceInfo],
        ports: Range<u16>,
    ) -> Result<(u16, Vec<(Ipv4Addr, std::net::TcpListener)>), AcceptorError> {
        for port in ports {
            let mut bound = Vec::new();
            for iface in up {
                match std::net::TcpListener::bind(SocketAddrV4::new(iface.address, port)) {
                    Ok(listener) => bound.push((iface.address, listener)),
                    Err(_) => break,
                }
            }

            if bound.len() == up.len() {
                log::info!("connection acceptor listening on port {port}");
                return Ok((port, bound));
            }
        }

        Err(AcceptorError::Io(io::Error::new(
            io::ErrorKind::AddrInUse,
            "could not listen on a port from the specified range",
        )))
    }

    /// The port every listener is bound to.
    pub fn port(&self) -> u16 {
        self.shared.port
    }

    /// Registers a cookie. The handler is invoked exactly once: with the
    /// accepted socket on a match, or with `None` when `timeout` elapses
    /// first.
    pub fn register(
        &self,
        cookie: &str,
        handler: AcceptHandler,
        timeout: Duration,
    ) -> Result<(), AcceptorError> {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.handlers.contains_key(cookie) {
                return Err(AcceptorError::DuplicateCookie);
            }
            state.handlers.insert(
                cookie.to_owned(),
                Pending {
                    handler,
                    deadline: Instant::now() + timeout,
                },
            );
        }

        self.shared.wake();
        Ok(())
    }

    /// Cancels a registered cookie; its handler is invoked with `None`.
    /// Unknown cookies are ignored.
    pub fn cancel(&self, cookie: &str) {
        let pending = self.shared.state.lock().unwrap().handlers.remove(cookie);
        if let Some(pending) = pending {
            (pending.handler)(None);
            self.shared.wake();
        }
    }

    /// Applies an interface up/down notification: newly-up interfaces get
    /// a listener on the chosen port, down interfaces have theirs
    /// released.
    pub fn update_interfaces(&self, interfaces: Vec<IfaceInfo>) {
        self.shared
            .state
            .lock()
            .unwrap()
            .commands
            .push(Command::Interfaces(interfaces));
        self.shared.wake();
    }
}

impl Drop for TcpConnectionAcceptor {
    fn drop(&mut self) {
        self.shared.state.lock().unwrap().shutdown = true;
        self.shared.wake();
    }
}

struct ListenerContext {
    address: Ipv4Addr,
    entry: Option<(Token, mio::net::TcpListener)>,
}

struct AcceptorLoop {
    poll: mio::Poll,
    shared: Arc<Shared>,
    contexts: Vec<ListenerContext>,
    next_token: usize,
    accepting: bool,
}

impl AcceptorLoop {
    fn add_listener(
        &mut self,
        address: Ipv4Addr,
        listener: std::net::TcpListener,
    ) -> io::Result<()> {
        listener.set_nonblocking(true)?;
        let listener = mio::net::TcpListener::from_std(listener);

        let token = Token(self.next_token);
        self.next_token += 1;
        self.contexts.push(ListenerContext {
            address,
            entry: Some((token, listener)),
        });

        Ok(())
    }

    fn run(&mut self) {
        let mut events = mio::Events::with_capacity(64);

        loop {
            let timeout = {
                let state = self.shared.state.lock().unwrap();
                state
                    .handlers
                    .values()
                    .map(|p| p.deadline.saturating_duration_since(Instant::now()))
                    .min()
            };

            if let Err(err) = self.poll.poll(&mut events, timeout) {
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                log::error!("acceptor poll error: {err}");
                return;
            }

            let mut expired = Vec::new();
            {
                let mut state = self.shared.state.lock().unwrap();
                if state.shutdown {
                    return;
                }

                let commands = std::mem::take(&mut state.commands);
                drop(state);
                for command in commands {
                    match command {
                        Command::Interfaces(interfaces) => self.apply_interfaces(&interfaces),
                    }
                }

                let mut state = self.shared.state.lock().unwrap();
                let now = Instant::now();
                let timed_out: Vec<String> = state
                    .handlers
                    .iter()
                    .filter(|(_, p)| p.deadline <= now)
                    .map(|(c, _)| c.clone())
                    .collect();
                for cookie in timed_out {
                    log::debug!("cookie {cookie} timed out");
                    if let Some(pending) = state.handlers.remove(&cookie) {
                        expired.push(pending.handler);
                    }
                }

                let want_accept = !state.handlers.is_empty();
                drop(state);
                self.set_accepting(want_accept);
            }

            for handler in expired {
                handler(None);
            }

            for event in events.iter() {
                if event.token() == WAKER {
                    continue;
                }
                self.accept_ready(event.token());
            }
        }
    }

    fn set_accepting(&mut self, accepting: bool) {
        if self.accepting == accepting {
            return;
        }
        self.accepting = accepting;

        for ctx in &mut self.contexts {
            let Some((token, listener)) = ctx.entry.as_mut() else {
                continue;
            };
            let result = if accepting {
                self.poll
                    .registry()
                    .register(listener, *token, Interest::READABLE)
            } else {
                self.poll.registry().deregister(listener)
            };
            if let Err(err) = result {
                log::warn!("failed to update listener on {}: {err}", ctx.address);
            }
        }
    }

    fn accept_ready(&mut self, token: Token) {
        if !self.accepting {
            return;
        }

        let Some(ctx) = self
            .contexts
            .iter_mut()
            .find(|c| matches!(&c.entry, Some((t, _)) if *t == token))
        else {
            return;
        };
        let (_, listener) = ctx.entry.as_mut().expect("matched above");

        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    log::debug!("inbound connection from {peer}");
                    let shared = self.shared.clone();
                    let _ = std::thread::Builder::new()
                        .name("mediabus-handshake".into())
                        .spawn(move || handshake(shared, stream));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    log::warn!("accept error: {err}");
                    break;
                }
            }
        }
    }

    fn apply_interfaces(&mut self, interfaces: &[IfaceInfo]) {
        let up: Vec<Ipv4Addr> = interfaces
            .iter()
            .filter(|i| i.is_up)
            .map(|i| i.address)
            .collect();

        // Drop listeners whose interface went away.
        for ctx in &mut self.contexts {
            if !up.contains(&ctx.address) {
                if let Some((_, mut listener)) = ctx.entry.take() {
                    log::info!("interface {} down, releasing listener", ctx.address);
                    let _ = self.poll.registry().deregister(&mut listener);
                }
            }
        }

        // Bind newly-raised interfaces we already knew about.
        let port = self.shared.port;
        for ctx in &mut self.contexts {
            if ctx.entry.is_some() || !up.contains(&ctx.address) {
                continue;
            }

            match std::net::TcpListener::bind(SocketAddrV4::new(ctx.address, port)) {
                Ok(listener) => {
                    if listener.set_nonblocking(true).is_err() {
                        continue;
                    }
                    let mut listener = mio::net::TcpListener::from_std(listener);
                    let token = Token(self.next_token);
                    self.next_token += 1;

                    if self.accepting {
                        if let Err(err) =
                            self.poll
                                .registry()
                                .register(&mut listener, token, Interest::READABLE)
                        {
                            log::warn!("failed to register listener on {}: {err}", ctx.address);
                            continue;
                        }
                    }

                    log::info!("interface {} up, listening again", ctx.address);
                    ctx.entry = Some((token, listener));
                }
                Err(err) => log::warn!("failed to rebind {}:{port}: {err}", ctx.address),
            }
        }
    }
}

fn handshake(shared: Arc<Shared>, stream: mio::net::TcpStream) {
    // The cookie exchange is short; it runs blocking on its own thread.
    let stream = unsafe { std::net::TcpStream::from_raw_fd(stream.into_raw_fd()) };
    if stream.set_nonblocking(false).is_err() {
        return;
    }
    let _ = stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT));

    let mut cookie = [0u8; COOKIE_LENGTH];
    let mut reader = &stream;
    if let Err(err) = reader.read_exact(&mut cookie) {
        log::debug!("failed to read connection cookie: {err}");
        shutdown(stream);
        return;
    }

    let Ok(cookie) = std::str::from_utf8(&cookie).map(str::to_owned) else {
        shutdown(stream);
        return;
    };

    let pending = shared.state.lock().unwrap().handlers.remove(&cookie);
    let Some(pending) = pending else {
        log::warn!("unknown connection cookie, dropping socket");
        shutdown(stream);
        return;
    };

    // With the entry gone the timeout can no longer fire; pause accepting
    // if this was the last one.
    shared.wake();

    let mut writer = &stream;
    if let Err(err) = writer.write_all(CONNECTION_GREETING) {
        log::warn!("failed to send greeting: {err}");
        shutdown(stream);
        (pending.handler)(None);
        return;
    }

    let _ = stream.set_read_timeout(None);
    (pending.handler)(Some(stream));
}

fn shutdown(stream: std::net::TcpStream) {
    let _ = stream.shutdown(std::net::Shutdown::Both);
}

/// Hands out UDP ports from the configured range, one counter per
/// interface address.
pub struct UdpPortAllocator {
    ports: Range<u16>,
    next: Mutex<HashMap<Ipv4Addr, u16>>,
}

impl UdpPortAllocator {
    /// The process-wide instance, configured from the environment.
    pub fn instance() -> Arc<Self> {
        static INSTANCE: OnceLock<Mutex<Weak<UdpPortAllocator>>> = OnceLock::new();

        let slot = INSTANCE.get_or_init(Default::default);
        let mut guard = slot.lock().unwrap();
        if let Some(existing) = guard.upgrade() {
            return existing;
        }

        let fresh = Arc::new(Self::new(crate::port_range_from_env()));
        *guard = Arc::downgrade(&fresh);
        fresh
    }

    /// An allocator over the given port range.
    pub fn new(ports: Range<u16>) -> Self {
        UdpPortAllocator {
            ports,
            next: Mutex::new(HashMap::new()),
        }
    }

    /// Binds a UDP socket on the interface, walking the port range past
    /// ports already taken. `None` when the range is exhausted.
    pub fn create_socket(&self, iface: Ipv4Addr) -> Option<std::net::UdpSocket> {
        loop {
            let port = {
                let mut next = self.next.lock().unwrap();
                let cursor = next.entry(iface).or_insert(self.ports.start);
                if *cursor >= self.ports.end {
                    return None;
                }
                let port = *cursor;
                *cursor += 1;
                port
            };

            match std::net::UdpSocket::bind(SocketAddrV4::new(iface, port)) {
                Ok(socket) => return Some(socket),
                Err(_) => continue,
            }
        }
    }
}
