//! The in-process transport: no sockets, just a thin wrapper around the
//! destination sink so disconnects are observable.

use std::sync::Arc;

use super::OnNetworkDisconnect;
use crate::broker::{PullSink, SinkRef, SourceRef};
use crate::sample::Sample;

struct InprocInputChannel {
    sink: SinkRef,
    on_disconnect: OnNetworkDisconnect,
}

impl PullSink for InprocInputChannel {
    fn on_connected(&self, source: &SourceRef) {
        self.sink.on_connected(source);
    }

    fn on_disconnected(&self) {
        self.sink.on_disconnected();
        self.on_disconnect.fire();
    }

    fn receive(&self, sample: Sample) {
        self.sink.receive(sample);
    }
}

/// Wraps a sink for an in-process connection. The disconnect callback
/// fires when the source side tears the connection down, e.g. because the
/// upstream endpoint was destroyed.
pub fn create_inproc_input_channel(sink: SinkRef, on_disconnect: OnNetworkDisconnect) -> SinkRef {
    Arc::new(InprocInputChannel {
        sink,
        on_disconnect,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{self, test_util::*};
    use std::sync::Mutex;

    #[test]
    fn wrapper_forwards_and_reports_teardown(){
        let sink = Arc::new(RecordingSink::default());
        let fired = Arc::new(Mutex::new(false));
        let flag = fired.clone();

        let wrapper = create_inproc_input_channel(
            sink.clone(),
            OnNetworkDisconnect::new(move || *flag.lock().unwrap() = true),
        );

        let source = Arc::new(CountingSource::default());
        let conn = broker::connect(source, wrapper);

        sink.source.lock().unwrap().clone().unwrap().request(2);
        assert_eq!(sink.timestamps(), vec![1, 2]);

        conn.disconnect();
        assert!(*fired.lock().unwrap());
        assert!(sink.source.lock().unwrap().is_none());
    }
}
