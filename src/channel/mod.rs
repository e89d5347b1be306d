//! Input and output channel wrappers.
//!
//! For every transport variant there are two companion halves: the input
//! channel on the sink side exposes a source pin, the output channel on
//! the source side exposes a sink pin. Credits flow upstream, samples flow
//! downstream; a source must not emit more samples than the credit it
//! holds. Every channel carries an [OnNetworkDisconnect] callback fired
//! exactly once on the first irrecoverable transport failure.

pub mod inproc;
pub mod local;
pub mod multicast;
pub mod tcp;
pub mod udp;

mod stream;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// How a channel treats small frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameBufferingPolicy {
    /// Small frames may be coalesced before hitting the wire.
    #[default]
    Buffered,
    /// Every frame and every credit is forwarded immediately.
    Unbuffered,
}

/// A callback invoked exactly once on any irrecoverable transport failure.
/// Clones share the fire-once latch.
#[derive(Clone)]
pub struct OnNetworkDisconnect(Arc<DisconnectInner>);

struct DisconnectInner {
    fired: AtomicBool,
    callback: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl OnNetworkDisconnect {
    /// Wraps a callback.
    pub fn new(callback: impl FnOnce() + Send + 'static) -> Self {
        OnNetworkDisconnect(Arc::new(DisconnectInner {
            fired: AtomicBool::new(false),
            callback: Mutex::new(Some(Box::new(callback))),
        }))
    }

    /// A handler that does nothing, for channels nobody watches.
    pub fn noop() -> Self {
        Self::new(|| {})
    }

    /// Fires the callback. Every call after the first is ignored.
    pub fn fire(&self) {
        if !self.0.fired.swap(true, Ordering::AcqRel) {
            if let Some(callback) = self.0.callback.lock().unwrap().take() {
                callback();
            }
        }
    }

    /// Whether the callback has fired already.
    pub fn has_fired(&self) -> bool {
        self.0.fired.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for OnNetworkDisconnect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnNetworkDisconnect")
            .field("fired", &self.has_fired())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disconnect_fires_exactly_once() {
        let count = Arc::new(Mutex::new(0));
        let counted = count.clone();
        let handler = OnNetworkDisconnect::new(move || *counted.lock().unwrap() += 1);

        let clone = handler.clone();
        handler.fire();
        clone.fire();
        handler.fire();

        assert_eq!(*count.lock().unwrap(), 1);
        assert!(handler.has_fired());
    }
}
