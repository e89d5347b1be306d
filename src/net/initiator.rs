//! The sink-side connection initiator.
//!
//! Races TCP connects against every advertised address of a source in
//! parallel, writes the connection cookie, reads the greeting, and hands
//! the first successful socket to the caller. All sibling attempts are
//! cancelled; an attempt that succeeds after the race is decided is closed
//! rather than leaked, since socket cancellation is not dependable on
//! every OS.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use crate::protocol::{CONNECTION_GREETING, COOKIE_LENGTH};

/// Called exactly once per initiation: with the winning socket, or with
/// `None` when every attempt failed or the initiation was cancelled.
pub type ConnectHandler = Box<dyn FnOnce(Option<TcpStream>) + Send + 'static>;

/// An error raised by [ConnectionInitiator::initiate].
#[derive(Debug, thiserror::Error)]
pub enum InitiatorError {
    /// An initiation with the same cookie is still in flight.
    #[error("attempt to connect a pending client")]
    PendingCookie,
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

struct Group {
    handler: Option<ConnectHandler>,
    outstanding: usize,
}

/// Process-wide connection initiator.
#[derive(Default)]
pub struct ConnectionInitiator {
    groups: Mutex<HashMap<String, Group>>,
}

impl std::fmt::Debug for ConnectionInitiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionInitiator").finish()
    }
}

impl ConnectionInitiator {
    /// The process-wide instance.
    pub fn instance() -> Arc<Self> {
        static INSTANCE: OnceLock<Mutex<Weak<ConnectionInitiator>>> = OnceLock::new();

        let slot = INSTANCE.get_or_init(Default::default);
        let mut guard = slot.lock().unwrap();
        if let Some(existing) = guard.upgrade() {
            return existing;
        }

        let fresh = Arc::new(Self::default());
        *guard = Arc::downgrade(&fresh);
        fresh
    }

    /// Starts one connect attempt per address. The handler receives the
    /// first socket whose cookie/greeting exchange succeeds, or `None`.
    pub fn initiate(
        self: &Arc<Self>,
        cookie: &str,
        addresses: &[String],
        port: u16,
        handler: ConnectHandler,
    ) -> Result<(), InitiatorError> {
        debug_assert_eq!(cookie.len(), COOKIE_LENGTH);

        if addresses.is_empty() {
            handler(None);
            return Ok(());
        }

        {
            let mut groups = self.groups.lock().unwrap();
            if groups.contains_key(cookie) {
                return Err(InitiatorError::PendingCookie);
            }
            groups.insert(
                cookie.to_owned(),
                Group {
                    handler: Some(handler),
                    outstanding: addresses.len(),
                },
            );
        }

        for address in addresses {
            let this = self.clone();
            let cookie = cookie.to_owned();
            let address = address.clone();
            let _ = std::thread::Builder::new()
                .name("mediabus-initiate".into())
                .spawn(move || {
                    let stream = attempt(&address, port, &cookie);
                    this.complete(&cookie, stream);
                });
        }

        Ok(())
    }

    /// Like [ConnectionInitiator::initiate], but resolves a oneshot future
    /// instead of invoking a callback.
    pub fn initiate_oneshot(
        self: &Arc<Self>,
        cookie: &str,
        addresses: &[String],
        port: u16,
    ) -> Result<futures::channel::oneshot::Receiver<Option<TcpStream>>, InitiatorError> {
        let (tx, rx) = futures::channel::oneshot::channel();
        self.initiate(
            cookie,
            addresses,
            port,
            Box::new(move |socket| {
                let _ = tx.send(socket);
            }),
        )?;
        Ok(rx)
    }

    /// Cancels an initiation; its handler is invoked with `None`. Attempts
    /// still in flight are closed when they complete.
    pub fn cancel(&self, cookie: &str) {
        let handler = {
            let mut groups = self.groups.lock().unwrap();
            groups.remove(cookie).and_then(|mut g| g.handler.take())
        };
        if let Some(handler) = handler {
            handler(None);
        }
    }

    fn complete(&self, cookie: &str, stream: Option<TcpStream>) {
        let mut groups = self.groups.lock().unwrap();
        let Some(group) = groups.get_mut(cookie) else {
            // The race was already decided or cancelled; a late success is
            // closed by dropping it.
            return;
        };

        group.outstanding -= 1;
        let finished = stream.is_some() || group.outstanding == 0;
        if !finished {
            return;
        }

        let handler = group.handler.take();
        groups.remove(cookie);
        drop(groups);

        if let Some(handler) = handler {
            handler(stream);
        }
    }
}

fn attempt(address: &str, port: u16, cookie: &str) -> Option<TcpStream> {
    let target: SocketAddr = match (address, port).to_socket_addrs() {
        Ok(mut addrs) => addrs.next()?,
        Err(err) => {
            log::debug!("failed to resolve {address}:{port}: {err}");
            return None;
        }
    };

    let mut stream = match TcpStream::connect_timeout(&target, CONNECT_TIMEOUT) {
        Ok(stream) => stream,
        Err(err) => {
            log::debug!("connect to {target} failed: {err}");
            return None;
        }
    };

    let mut handshake = || -> std::io::Result<bool> {
        stream.set_write_timeout(Some(HANDSHAKE_TIMEOUT))?;
        stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;

        stream.write_all(cookie.as_bytes())?;

        let mut greeting = vec![0u8; CONNECTION_GREETING.len()];
        stream.read_exact(&mut greeting)?;
        Ok(greeting == CONNECTION_GREETING)
    };

    match handshake() {
        Ok(true) => {
            let _ = stream.set_read_timeout(None);
            let _ = stream.set_write_timeout(None);
            Some(stream)
        }
        Ok(false) => {
            log::warn!("bad greeting from {target}");
            None
        }
        Err(err) => {
            log::debug!("handshake with {target} failed: {err}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
    use std::sync::mpsc;

    fn greeting_server(respond: bool) -> (u16, std::thread::JoinHandle<()>) {
        let listener = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = std::thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let mut cookie = [0u8; COOKIE_LENGTH];
                if stream.read_exact(&mut cookie).is_ok() {
                    if respond {
                        let _ = stream.write_all(CONNECTION_GREETING);
                    } else {
                        let _ = stream.write_all(b"WRONG GREETING, GO AWAY........");
                    }
                }
            }
        });
        (port, handle)
    }

    #[test_log::test]
    fn first_success_wins() -> anyhow::Result<()> {
        let (port, server) = greeting_server(true);
        let initiator = Arc::new(ConnectionInitiator::default());

        let (tx, rx) = mpsc::channel();
        initiator.initiate(
            &crate::protocol::new_cookie(),
            &["127.0.0.1".to_owned()],
            port,
            Box::new(move |sock| {
                let _ = tx.send(sock.is_some());
            }),
        )?;

        assert!(rx.recv_timeout(Duration::from_secs(10))?);
        server.join().unwrap();
        Ok(())
    }

    #[test_log::test]
    fn bad_greeting_fails() -> anyhow::Result<()> {
        let (port, server) = greeting_server(false);
        let initiator = Arc::new(ConnectionInitiator::default());

        let (tx, rx) = mpsc::channel();
        initiator.initiate(
            &crate::protocol::new_cookie(),
            &["127.0.0.1".to_owned()],
            port,
            Box::new(move |sock| {
                let _ = tx.send(sock.is_some());
            }),
        )?;

        assert!(!rx.recv_timeout(Duration::from_secs(10))?);
        server.join().unwrap();
        Ok(())
    }

    #[test_log::test]
    fn all_attempts_failing_reports_none() -> anyhow::Result<()> {
        // Bind and drop, so the port is very likely closed.
        let port = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))?
            .local_addr()?
            .port();

        let initiator = Arc::new(ConnectionInitiator::default());
        let (tx, rx) = mpsc::channel();
        initiator.initiate(
            &crate::protocol::new_cookie(),
            &["127.0.0.1".to_owned(), "127.0.0.1".to_owned()],
            port,
            Box::new(move |sock| {
                let _ = tx.send(sock.is_some());
            }),
        )?;

        assert!(!rx.recv_timeout(Duration::from_secs(10))?);
        Ok(())
    }

    #[test_log::test]
    fn duplicate_initiation_is_rejected() -> anyhow::Result<()> {
        let (port, server) = greeting_server(true);
        let initiator = Arc::new(ConnectionInitiator::default());
        let cookie = crate::protocol::new_cookie();

        let (tx, rx) = mpsc::channel();
        initiator.initiate(
            &cookie,
            &["127.0.0.1".to_owned()],
            port,
            Box::new(move |sock| {
                let _ = tx.send(sock.is_some());
            }),
        )?;

        // While the first is pending this may race its completion, so only
        // check the error shape when it is still in flight.
        if let Err(err) = initiator.initiate(&cookie, &["127.0.0.1".to_owned()], port, Box::new(|_| {})) {
            assert_matches::assert_matches!(err, InitiatorError::PendingCookie);
        }

        let _ = rx.recv_timeout(Duration::from_secs(10))?;
        server.join().unwrap();
        Ok(())
    }

    #[test_log::test]
    fn oneshot_initiation_resolves() -> anyhow::Result<()> {
        let (port, server) = greeting_server(true);
        let initiator = Arc::new(ConnectionInitiator::default());

        let rx = initiator.initiate_oneshot(
            &crate::protocol::new_cookie(),
            &["127.0.0.1".to_owned()],
            port,
        )?;

        let socket = futures::executor::block_on(rx)?;
        assert!(socket.is_some());
        server.join().unwrap();
        Ok(())
    }

    #[test_log::test]
    fn cancel_invokes_handler_once() {
        let initiator = Arc::new(ConnectionInitiator::default());
        let cookie = crate::protocol::new_cookie();

        // Reserve the group by hand so no attempt threads race the cancel.
        let (tx, rx) = mpsc::channel();
        initiator.groups.lock().unwrap().insert(
            cookie.clone(),
            Group {
                handler: Some(Box::new(move |sock: Option<TcpStream>| {
                    let _ = tx.send(sock.is_none());
                })),
                outstanding: 1,
            },
        );

        initiator.cancel(&cookie);
        initiator.cancel(&cookie);

        assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap());
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }
}
