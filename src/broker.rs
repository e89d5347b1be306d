//! Pull-style pins and the in-process connection broker.
//!
//! A connection joins a source pin and a sink pin. Back-pressure flows
//! sink → source as integer request counts; samples flow source → sink.
//! Credits accumulate and never go negative: a source must not emit more
//! samples than the credit it holds.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::protocol::{MediaTime, PlayMode, Qos, StartPosition};
use crate::sample::Sample;

/// A shared source pin.
pub type SourceRef = Arc<dyn PullSource>;

/// A shared sink pin.
pub type SinkRef = Arc<dyn PullSink>;

/// A shared QoS-aware source pin.
pub type QosSourceRef = Arc<dyn QosAwareSource>;

/// A shared seekable source pin.
pub type SeekableSourceRef = Arc<dyn SeekableSource>;

/// The upstream half of a connection: delivers samples against credits.
pub trait PullSource: Send + Sync {
    /// Called when a connection to a sink is established.
    fn on_connected(&self, _sink: &SinkRef) {}

    /// Called when the connection is torn down.
    fn on_disconnected(&self) {}

    /// Grants the source `count` more sample credits.
    fn request(&self, count: u32);
}

/// The downstream half of a connection: receives samples it asked for.
pub trait PullSink: Send + Sync {
    /// Called when a connection to a source is established.
    fn on_connected(&self, _source: &SourceRef) {}

    /// Called when the connection is torn down.
    fn on_disconnected(&self) {}

    /// Delivers one sample. Called only up to the credit granted via
    /// [PullSource::request].
    fn receive(&self, sample: Sample);
}

/// A pull source that applies a Quality-of-Service filter internally.
pub trait QosAwareSource: PullSource {
    /// Replaces the QoS sequence. May be called at any time.
    fn modify_qos(&self, qos: &Qos);

    /// Re-applies the current QoS, e.g. after upstream capabilities
    /// changed.
    fn reprocess_qos(&self) {}
}

/// A QoS-aware source whose timeline can be repositioned.
pub trait SeekableSource: QosAwareSource {
    /// Repositions the stream. Samples from before the seek carry the old
    /// session id and are dropped downstream.
    fn seek(&self, time: MediaTime, start: StartPosition, mode: PlayMode, session_id: u32);
}

struct ConnectionInner {
    source: SourceRef,
    sink: SinkRef,
    connected: AtomicBool,
}

impl ConnectionInner {
    fn disconnect(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            self.source.on_disconnected();
            self.sink.on_disconnected();
        }
    }
}

impl Drop for ConnectionInner {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// A live connection between a source pin and a sink pin. Dropping the
/// last clone disconnects both sides.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Connection {
    /// Whether the connection has not been torn down yet.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Tears the connection down. Idempotent; either side may also drop
    /// its handle instead.
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }
}

/// Wires a source pin to a sink pin and notifies both sides.
pub fn connect(source: SourceRef, sink: SinkRef) -> Connection {
    let inner = Arc::new(ConnectionInner {
        source: source.clone(),
        sink: sink.clone(),
        connected: AtomicBool::new(true),
    });

    source.on_connected(&sink);
    sink.on_connected(&source);

    Connection { inner }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use std::sync::Mutex;

    /// A sink that records every delivered sample.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) samples: Mutex<Vec<Sample>>,
        pub(crate) source: Mutex<Option<SourceRef>>,
        pub(crate) disconnects: Mutex<u32>,
    }

    impl RecordingSink {
        pub(crate) fn timestamps(&self) -> Vec<MediaTime> {
            self.samples
                .lock()
                .unwrap()
                .iter()
                .map(Sample::timestamp)
                .collect()
        }
    }

    impl PullSink for RecordingSink {
        fn on_connected(&self, source: &SourceRef) {
            *self.source.lock().unwrap() = Some(source.clone());
        }

        fn on_disconnected(&self) {
            *self.source.lock().unwrap() = None;
            *self.disconnects.lock().unwrap() += 1;
        }

        fn receive(&self, sample: Sample) {
            self.samples.lock().unwrap().push(sample);
        }
    }

    /// A source that pushes numbered samples as soon as it has credit.
    #[derive(Default)]
    pub(crate) struct CountingSource {
        pub(crate) sink: Mutex<Option<SinkRef>>,
        pub(crate) next_timestamp: Mutex<MediaTime>,
    }

    impl PullSource for CountingSource {
        fn on_connected(&self, sink: &SinkRef) {
            *self.sink.lock().unwrap() = Some(sink.clone());
        }

        fn on_disconnected(&self) {
            *self.sink.lock().unwrap() = None;
        }

        fn request(&self, count: u32) {
            let sink = self.sink.lock().unwrap().clone();
            if let Some(sink) = sink {
                for _ in 0..count {
                    let ts = {
                        let mut next = self.next_timestamp.lock().unwrap();
                        *next += 1;
                        *next
                    };
                    sink.receive(Sample::with_body(
                        crate::protocol::SampleHeader {
                            timestamp: ts,
                            ..Default::default()
                        },
                        vec![0; 8],
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_util::*;
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn samples_flow_against_credits() {
        let source = Arc::new(CountingSource::default());
        let sink = Arc::new(RecordingSink::default());

        let conn = connect(source.clone(), sink.clone());

        let upstream = sink.source.lock().unwrap().clone().unwrap();
        upstream.request(3);

        assert_eq!(sink.timestamps(), vec![1, 2, 3]);
        conn.disconnect();
        assert!(sink.source.lock().unwrap().is_none());
        assert!(source.sink.lock().unwrap().is_none());
    }

    #[test]
    fn disconnect_is_idempotent() {
        let source = Arc::new(CountingSource::default());
        let sink = Arc::new(RecordingSink::default());

        let conn = connect(source, sink.clone());
        conn.disconnect();
        conn.disconnect();
        drop(conn);

        assert_eq!(*sink.disconnects.lock().unwrap(), 1);
    }

    #[test]
    fn drop_disconnects() {
        let source = Arc::new(CountingSource::default());
        let sink = Arc::new(RecordingSink::default());

        let conn = connect(source, sink.clone());
        drop(conn);

        assert_eq!(*sink.disconnects.lock().unwrap(), 1);
    }
}
