//! The shared stream-socket channel core used by the TCP and local
//! transports. One socket carries framed messages in both directions:
//! credits toward the source, samples toward the sink.

use std::io::Read;
use std::net::TcpStream;
use std::sync::{Arc, Mutex, Weak};

use super::{FrameBufferingPolicy, OnNetworkDisconnect};
use crate::broker::{PullSink, PullSource, SinkRef, SourceRef};
use crate::protocol::{self, MessageKind};
use crate::sample::{Allocator, Sample};

pub(super) struct StreamInputChannel {
    writer: Mutex<TcpStream>,
    reader_stream: TcpStream,
    sink: Mutex<Option<SinkRef>>,
    on_disconnect: OnNetworkDisconnect,
}

impl StreamInputChannel {
    /// Builds the sink-side half over a connected socket and starts its
    /// sample reader. `allocator` is the attached shared pool for local
    /// transports.
    pub(super) fn spawn(
        stream: TcpStream,
        allocator: Option<Allocator>,
        policy: FrameBufferingPolicy,
        on_disconnect: OnNetworkDisconnect,
    ) -> std::io::Result<SourceRef> {
        stream.set_nodelay(policy == FrameBufferingPolicy::Unbuffered)?;
        let reader = stream.try_clone()?;

        let channel = Arc::new(StreamInputChannel {
            writer: Mutex::new(stream),
            reader_stream: reader.try_clone()?,
            sink: Mutex::new(None),
            on_disconnect,
        });

        let weak = Arc::downgrade(&channel);
        std::thread::Builder::new()
            .name("mediabus-input".into())
            .spawn(move || run_sample_reader(reader, allocator, weak))?;

        Ok(channel)
    }

    fn deliver(&self, sample: Sample) {
        let sink = self.sink.lock().unwrap().clone();
        match sink {
            Some(sink) => sink.receive(sample),
            None => log::warn!("sample arrived before the input channel was wired, dropping"),
        }
    }
}

impl PullSource for StreamInputChannel {
    fn on_connected(&self, sink: &SinkRef) {
        *self.sink.lock().unwrap() = Some(sink.clone());
    }

    fn on_disconnected(&self) {
        *self.sink.lock().unwrap() = None;
        let _ = self.reader_stream.shutdown(std::net::Shutdown::Both);
    }

    fn request(&self, count: u32) {
        let mut writer = self.writer.lock().unwrap();
        if let Err(err) = protocol::write_credit_message(&mut *writer, count) {
            log::debug!("failed to send credit: {err}");
            drop(writer);
            self.on_disconnect.fire();
        }
    }
}

fn run_sample_reader(
    mut stream: TcpStream,
    allocator: Option<Allocator>,
    channel: Weak<StreamInputChannel>,
) {
    loop {
        match read_one_message(&mut stream, allocator.as_ref()) {
            Ok(sample) => {
                let Some(channel) = channel.upgrade() else {
                    return;
                };
                channel.deliver(sample);
            }
            Err(err) => {
                log::debug!("input channel closed: {err}");
                if let Some(channel) = channel.upgrade() {
                    channel.on_disconnect.fire();
                }
                return;
            }
        }
    }
}

fn read_one_message(
    stream: &mut TcpStream,
    allocator: Option<&Allocator>,
) -> Result<Sample, protocol::ProtocolError> {
    loop {
        let header = protocol::read_frame_header(stream)?;
        let mut payload = vec![0; header.length as usize];
        stream.read_exact(&mut payload)?;

        match header.kind {
            MessageKind::Sample => return Sample::decode_payload(&payload, allocator),
            MessageKind::SharedSample => return Sample::decode_shared_payload(&payload),
            other => {
                log::warn!("ignoring unexpected message on input channel: {other:?}");
            }
        }
    }
}

pub(super) struct StreamOutputChannel {
    writer: Mutex<TcpStream>,
    reader_stream: TcpStream,
    source: Mutex<Option<SourceRef>>,
    credits: Mutex<u32>,
    allocator: Option<Allocator>,
    on_disconnect: OnNetworkDisconnect,
}

impl StreamOutputChannel {
    /// Builds the source-side half over a connected socket and starts its
    /// credit reader. With an allocator, samples go out as shared-sample
    /// messages carrying the allocator id.
    pub(super) fn spawn(
        stream: TcpStream,
        allocator: Option<Allocator>,
        on_disconnect: OnNetworkDisconnect,
    ) -> std::io::Result<SinkRef> {
        let reader = stream.try_clone()?;

        let channel = Arc::new(StreamOutputChannel {
            writer: Mutex::new(stream),
            reader_stream: reader.try_clone()?,
            source: Mutex::new(None),
            credits: Mutex::new(0),
            allocator,
            on_disconnect,
        });

        let weak = Arc::downgrade(&channel);
        std::thread::Builder::new()
            .name("mediabus-output".into())
            .spawn(move || run_credit_reader(reader, weak))?;

        Ok(channel)
    }
}

impl PullSink for StreamOutputChannel {
    fn on_connected(&self, source: &SourceRef) {
        let pending = {
            let mut source_slot = self.source.lock().unwrap();
            *source_slot = Some(source.clone());
            std::mem::take(&mut *self.credits.lock().unwrap())
        };

        // Credits that arrived before the source was wired are replayed.
        if pending > 0 {
            source.request(pending);
        }
    }

    fn on_disconnected(&self) {
        *self.source.lock().unwrap() = None;
        let _ = self.reader_stream.shutdown(std::net::Shutdown::Both);
    }

    fn receive(&self, sample: Sample) {
        let encoded = if self.allocator.is_some() {
            sample
                .encode_shared_payload()
                .map(|p| (MessageKind::SharedSample, p))
        } else {
            sample.encode_payload().map(|p| (MessageKind::Sample, p))
        };

        let (kind, payload) = match encoded {
            Ok(pair) => pair,
            Err(err) => {
                log::error!("failed to encode sample: {err}");
                return;
            }
        };

        let mut writer = self.writer.lock().unwrap();
        if let Err(err) = protocol::write_message(&mut *writer, kind, &payload) {
            log::debug!("failed to send sample: {err}");
            drop(writer);
            self.on_disconnect.fire();
        }
    }
}

fn run_credit_reader(mut stream: TcpStream, channel: Weak<StreamOutputChannel>) {
    loop {
        let credit = match read_one_credit(&mut stream) {
            Ok(credit) => credit,
            Err(err) => {
                log::debug!("output channel closed: {err}");
                if let Some(channel) = channel.upgrade() {
                    channel.on_disconnect.fire();
                }
                return;
            }
        };

        let Some(channel) = channel.upgrade() else {
            return;
        };

        let source = channel.source.lock().unwrap().clone();
        match source {
            Some(source) => source.request(credit),
            // The upstream source binds lazily; bank the credit for it.
            None => *channel.credits.lock().unwrap() += credit,
        }
    }
}

fn read_one_credit(stream: &mut TcpStream) -> Result<u32, protocol::ProtocolError> {
    loop {
        let header = protocol::read_frame_header(stream)?;
        let mut payload = vec![0; header.length as usize];
        stream.read_exact(&mut payload)?;

        match header.kind {
            MessageKind::Credit => return protocol::read_credit_payload(&payload),
            other => {
                log::warn!("ignoring unexpected message on output channel: {other:?}");
            }
        }
    }
}
