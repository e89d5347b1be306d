//! The UDP transport: a unicast control socket carrying cookie probes and
//! credits toward the source, and a lossy data socket carrying
//! sequence-numbered sample datagrams toward the sink.
//!
//! A dropped or torn sample is reported and skipped, never retransmitted;
//! the next delivered sample carries the discontinuity flag.

use std::io::Write;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use super::{FrameBufferingPolicy, OnNetworkDisconnect};
use crate::broker::{PullSink, PullSource, SinkRef, SourceRef};
use crate::protocol::{
    self,
    wire::{self, DatagramHeader},
    MessageKind, SampleFlags,
};
use crate::sample::Sample;

const RECV_POLL: Duration = Duration::from_millis(500);
const MAX_DATAGRAM: usize = wire::DATAGRAM_HEADER_SIZE + wire::DATAGRAM_PAYLOAD_SIZE;

/// Builds the sink-side input channel over a connected control/data socket
/// pair. Cookie probes are sent so the source learns both peer addresses.
pub fn create_udp_input_channel(
    control: UdpSocket,
    data: UdpSocket,
    cookie: &str,
    policy: FrameBufferingPolicy,
    on_disconnect: OnNetworkDisconnect,
) -> std::io::Result<SourceRef> {
    spawn_datagram_input(control, data, cookie, true, policy, on_disconnect)
}

pub(super) fn spawn_datagram_input(
    control: UdpSocket,
    data: UdpSocket,
    cookie: &str,
    probe_data: bool,
    _policy: FrameBufferingPolicy,
    on_disconnect: OnNetworkDisconnect,
) -> std::io::Result<SourceRef> {
    data.set_read_timeout(Some(RECV_POLL))?;

    let probe = encode_cookie_probe(cookie)?;
    control.send(&probe)?;
    if probe_data {
        data.send(&probe)?;
    }

    let channel = Arc::new(UdpInputChannel {
        control,
        sink: Mutex::new(None),
        on_disconnect,
    });

    let weak = Arc::downgrade(&channel);
    std::thread::Builder::new()
        .name("mediabus-udp-input".into())
        .spawn(move || run_datagram_reader(data, weak))?;

    Ok(channel)
}

fn encode_cookie_probe(cookie: &str) -> Result<Vec<u8>, std::io::Error> {
    let mut buf = Vec::with_capacity(protocol::FRAME_HEADER_SIZE + cookie.len());
    protocol::write_message(&mut buf, MessageKind::CookieProbe, cookie.as_bytes())
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
    Ok(buf)
}

struct UdpInputChannel {
    control: UdpSocket,
    sink: Mutex<Option<SinkRef>>,
    on_disconnect: OnNetworkDisconnect,
}

impl PullSource for UdpInputChannel {
    fn on_connected(&self, sink: &SinkRef) {
        *self.sink.lock().unwrap() = Some(sink.clone());
    }

    fn on_disconnected(&self) {
        *self.sink.lock().unwrap() = None;
    }

    fn request(&self, count: u32) {
        let mut buf = Vec::with_capacity(protocol::FRAME_HEADER_SIZE + 4);
        if protocol::write_credit_message(&mut buf, count).is_err() {
            return;
        }
        if let Err(err) = self.control.send(&buf) {
            log::debug!("failed to send credit datagram: {err}");
            self.on_disconnect.fire();
        }
    }
}

/// Reassembles fragmented sample datagrams, tracking losses.
struct Reassembler {
    seq: u32,
    frag_count: u16,
    received: u16,
    buf: Vec<u8>,
    collecting: bool,
    next_seq: Option<u32>,
    pending_discontinuity: bool,
}

impl Reassembler {
    fn new() -> Self {
        Reassembler {
            seq: 0,
            frag_count: 0,
            received: 0,
            buf: Vec::new(),
            collecting: false,
            next_seq: None,
            pending_discontinuity: false,
        }
    }

    fn gap(&mut self, why: &str) {
        log::warn!("dropped media datagrams ({why}), stream will skip");
        self.collecting = false;
        self.pending_discontinuity = true;
    }

    /// Feeds one datagram; returns a complete message when the last
    /// fragment arrives.
    fn push(&mut self, datagram: &[u8]) -> Option<Vec<u8>> {
        let mut cursor = datagram;
        let header = match wire::read_datagram_header(&mut cursor) {
            Ok(header) => header,
            Err(err) => {
                log::debug!("bad datagram: {err}");
                return None;
            }
        };

        if self.collecting && header.seq != self.seq {
            self.gap("sample torn");
        }

        if !self.collecting {
            if let Some(expected) = self.next_seq {
                if header.seq != expected {
                    self.gap("sequence gap");
                }
            }
            if header.frag_index != 0 {
                self.gap("lost leading fragment");
                return None;
            }
            self.seq = header.seq;
            self.frag_count = header.frag_count;
            self.received = 0;
            self.buf.clear();
            self.collecting = true;
        }

        if header.frag_index != self.received || header.frag_count != self.frag_count {
            self.gap("fragments out of order");
            return None;
        }

        self.buf.extend_from_slice(cursor);
        self.received += 1;

        if self.received == self.frag_count {
            self.collecting = false;
            self.next_seq = Some(self.seq.wrapping_add(1));
            return Some(std::mem::take(&mut self.buf));
        }

        None
    }

    fn decode(&mut self, message: &[u8]) -> Option<Sample> {
        let mut cursor = message;
        let header = protocol::read_frame_header(&mut cursor).ok()?;
        if cursor.len() != header.length as usize {
            log::debug!("datagram message length mismatch");
            return None;
        }

        let sample = match header.kind {
            MessageKind::Sample => Sample::decode_payload(cursor, None),
            MessageKind::SharedSample => Sample::decode_shared_payload(cursor),
            other => {
                log::warn!("ignoring unexpected message on data socket: {other:?}");
                return None;
            }
        };

        let mut sample = match sample {
            Ok(sample) => sample,
            Err(err) => {
                log::debug!("failed to decode sample datagram: {err}");
                return None;
            }
        };

        if self.pending_discontinuity {
            sample.set_flag(SampleFlags::DISCONTINUITY);
            self.pending_discontinuity = false;
        }
        Some(sample)
    }
}

fn run_datagram_reader(data: UdpSocket, channel: Weak<UdpInputChannel>) {
    let mut reassembler = Reassembler::new();
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let received = match data.recv_from(&mut buf) {
            Ok((len, _)) => Some(&buf[..len]),
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                None
            }
            Err(err) => {
                log::debug!("data socket error: {err}");
                if let Some(channel) = channel.upgrade() {
                    channel.on_disconnect.fire();
                }
                return;
            }
        };

        let Some(channel) = channel.upgrade() else {
            return;
        };

        let Some(datagram) = received else {
            continue;
        };
        let Some(message) = reassembler.push(datagram) else {
            continue;
        };
        let Some(sample) = reassembler.decode(&message) else {
            continue;
        };

        let sink = channel.sink.lock().unwrap().clone();
        match sink {
            Some(sink) => sink.receive(sample),
            None => log::warn!("sample arrived before the input channel was wired, dropping"),
        }
    }
}

pub(super) enum DataTarget {
    /// Unicast: the peer address is learned from its cookie probe.
    Peer(Mutex<Option<SocketAddr>>),
    /// Multicast: every sample goes to the group.
    Group(SocketAddr),
}

/// Builds the source-side output channel over a bound control/data socket
/// pair. The sink's addresses are learned from its cookie probes.
pub fn create_udp_output_channel(
    control: UdpSocket,
    data: UdpSocket,
    cookie: &str,
    on_disconnect: OnNetworkDisconnect,
) -> std::io::Result<SinkRef> {
    spawn_datagram_output(
        control,
        data,
        DataTarget::Peer(Mutex::new(None)),
        true,
        cookie,
        on_disconnect,
    )
}

pub(super) fn spawn_datagram_output(
    control: UdpSocket,
    data: UdpSocket,
    target: DataTarget,
    probe_data: bool,
    cookie: &str,
    on_disconnect: OnNetworkDisconnect,
) -> std::io::Result<SinkRef> {
    control.set_read_timeout(Some(RECV_POLL))?;

    let channel = Arc::new(UdpOutputChannel {
        data,
        target,
        source: Mutex::new(None),
        pending_credits: Mutex::new(0),
        cookie: cookie.to_owned(),
        next_seq: AtomicU32::new(0),
        on_disconnect,
    });

    let weak = Arc::downgrade(&channel);
    std::thread::Builder::new()
        .name("mediabus-udp-control".into())
        .spawn(move || run_control_reader(control, weak))?;

    if probe_data {
        let weak = Arc::downgrade(&channel);
        let data = channel.data.try_clone()?;
        data.set_read_timeout(Some(RECV_POLL))?;
        std::thread::Builder::new()
            .name("mediabus-udp-probe".into())
            .spawn(move || run_probe_reader(data, weak))?;
    }

    Ok(channel)
}

struct UdpOutputChannel {
    data: UdpSocket,
    target: DataTarget,
    source: Mutex<Option<SourceRef>>,
    pending_credits: Mutex<u32>,
    cookie: String,
    next_seq: AtomicU32,
    on_disconnect: OnNetworkDisconnect,
}

impl UdpOutputChannel {
    fn data_target(&self) -> Option<SocketAddr> {
        match &self.target {
            DataTarget::Peer(peer) => *peer.lock().unwrap(),
            DataTarget::Group(group) => Some(*group),
        }
    }
}

impl PullSink for UdpOutputChannel {
    fn on_connected(&self, source: &SourceRef) {
        let pending = {
            let mut slot = self.source.lock().unwrap();
            *slot = Some(source.clone());
            std::mem::take(&mut *self.pending_credits.lock().unwrap())
        };
        if pending > 0 {
            source.request(pending);
        }
    }

    fn on_disconnected(&self) {
        *self.source.lock().unwrap() = None;
    }

    fn receive(&self, sample: Sample) {
        let Some(target) = self.data_target() else {
            log::debug!("no data peer yet, dropping sample");
            return;
        };

        let payload = match sample.encode_payload() {
            Ok(payload) => payload,
            Err(err) => {
                log::error!("failed to encode sample: {err}");
                return;
            }
        };

        let mut message = Vec::with_capacity(protocol::FRAME_HEADER_SIZE + payload.len());
        if protocol::write_message(&mut message, MessageKind::Sample, &payload).is_err() {
            return;
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let chunks: Vec<&[u8]> = message.chunks(wire::DATAGRAM_PAYLOAD_SIZE).collect();
        let frag_count = chunks.len() as u16;

        for (index, chunk) in chunks.into_iter().enumerate() {
            let mut datagram = Vec::with_capacity(wire::DATAGRAM_HEADER_SIZE + chunk.len());
            let header = DatagramHeader {
                seq,
                frag_index: index as u16,
                frag_count,
            };
            if wire::write_datagram_header(&mut datagram, &header).is_err() {
                return;
            }
            let _ = datagram.write_all(chunk);

            if let Err(err) = self.data.send_to(&datagram, target) {
                log::debug!("failed to send sample datagram: {err}");
                self.on_disconnect.fire();
                return;
            }
        }
    }
}

fn run_control_reader(control: UdpSocket, channel: Weak<UdpOutputChannel>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let received = match control.recv_from(&mut buf) {
            Ok((len, peer)) => Some((len, peer)),
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                None
            }
            Err(err) => {
                log::debug!("control socket error: {err}");
                if let Some(channel) = channel.upgrade() {
                    channel.on_disconnect.fire();
                }
                return;
            }
        };

        let Some(channel) = channel.upgrade() else {
            return;
        };
        let Some((len, peer)) = received else {
            continue;
        };

        match parse_control(&buf[..len]) {
            Some(ControlMessage::Cookie(cookie)) => {
                if cookie != channel.cookie {
                    log::warn!("cookie mismatch on control socket from {peer}");
                }
            }
            Some(ControlMessage::Credit(count)) => {
                let source = channel.source.lock().unwrap().clone();
                match source {
                    Some(source) => source.request(count),
                    None => *channel.pending_credits.lock().unwrap() += count,
                }
            }
            None => {}
        }
    }
}

fn run_probe_reader(data: UdpSocket, channel: Weak<UdpOutputChannel>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let received = match data.recv_from(&mut buf) {
            Ok((len, peer)) => Some((len, peer)),
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                None
            }
            Err(_) => return,
        };

        let Some(channel) = channel.upgrade() else {
            return;
        };
        let Some((len, peer)) = received else {
            continue;
        };

        if let Some(ControlMessage::Cookie(cookie)) = parse_control(&buf[..len]) {
            if cookie == channel.cookie {
                if let DataTarget::Peer(slot) = &channel.target {
                    log::debug!("learned data peer {peer}");
                    *slot.lock().unwrap() = Some(peer);
                }
            }
        }
    }
}

enum ControlMessage {
    Cookie(String),
    Credit(u32),
}

fn parse_control(datagram: &[u8]) -> Option<ControlMessage> {
    let mut cursor = datagram;
    let header = protocol::read_frame_header(&mut cursor).ok()?;
    if cursor.len() != header.length as usize {
        return None;
    }

    match header.kind {
        MessageKind::CookieProbe => protocol::read_cookie_payload(cursor)
            .ok()
            .map(ControlMessage::Cookie),
        MessageKind::Credit => protocol::read_credit_payload(cursor)
            .ok()
            .map(ControlMessage::Credit),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{self, test_util::*};
    use crate::protocol::SampleHeader;
    use std::net::{Ipv4Addr, SocketAddrV4};
    use std::time::Instant;

    fn wait_for<F: Fn() -> bool>(cond: F) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    fn bind() -> UdpSocket {
        UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)).unwrap()
    }

    #[test_log::test]
    fn udp_samples_flow_end_to_end() {
        let cookie = crate::protocol::new_cookie();

        let src_control = bind();
        let src_data = bind();
        let control_port = src_control.local_addr().unwrap().port();
        let data_port = src_data.local_addr().unwrap().port();

        let output = create_udp_output_channel(
            src_control,
            src_data,
            &cookie,
            OnNetworkDisconnect::noop(),
        )
        .unwrap();

        let sink_control = bind();
        sink_control
            .connect(SocketAddrV4::new(Ipv4Addr::LOCALHOST, control_port))
            .unwrap();
        let sink_data = bind();
        sink_data
            .connect(SocketAddrV4::new(Ipv4Addr::LOCALHOST, data_port))
            .unwrap();

        let input = create_udp_input_channel(
            sink_control,
            sink_data,
            &cookie,
            FrameBufferingPolicy::Unbuffered,
            OnNetworkDisconnect::noop(),
        )
        .unwrap();

        let sink = Arc::new(RecordingSink::default());
        let source = Arc::new(CountingSource::default());
        let _down = broker::connect(input.clone(), sink.clone());
        let _up = broker::connect(source, output);

        // Give the probe a moment to register the data peer, then pull.
        std::thread::sleep(Duration::from_millis(200));
        input.request(3);

        wait_for(|| sink.samples.lock().unwrap().len() >= 3);
        assert_eq!(sink.timestamps()[..3], [1, 2, 3]);
    }

    #[test]
    fn reassembler_flags_discontinuity_after_gap() {
        let mut reassembler = Reassembler::new();

        let encode = |ts: u64, seq: u32| {
            let sample = Sample::with_body(
                SampleHeader {
                    timestamp: ts,
                    ..Default::default()
                },
                vec![1, 2, 3],
            );
            let payload = sample.encode_payload().unwrap();
            let mut message = Vec::new();
            protocol::write_message(&mut message, MessageKind::Sample, &payload).unwrap();

            let mut datagram = Vec::new();
            wire::write_datagram_header(
                &mut datagram,
                &DatagramHeader {
                    seq,
                    frag_index: 0,
                    frag_count: 1,
                },
            )
            .unwrap();
            datagram.extend_from_slice(&message);
            datagram
        };

        let first = reassembler.push(&encode(1, 0)).unwrap();
        let first = reassembler.decode(&first).unwrap();
        assert!(!first.flags().contains(SampleFlags::DISCONTINUITY));

        // Sequence 1 is lost entirely.
        let third = reassembler.push(&encode(3, 2)).unwrap();
        let third = reassembler.decode(&third).unwrap();
        assert!(third.flags().contains(SampleFlags::DISCONTINUITY));

        let fourth = reassembler.push(&encode(4, 3)).unwrap();
        let fourth = reassembler.decode(&fourth).unwrap();
        assert!(!fourth.flags().contains(SampleFlags::DISCONTINUITY));
    }

    #[test]
    fn reassembler_joins_fragments() {
        let mut reassembler = Reassembler::new();

        let body = vec![7u8; wire::DATAGRAM_PAYLOAD_SIZE * 2];
        let sample = Sample::with_body(
            SampleHeader {
                timestamp: 9,
                ..Default::default()
            },
            body.clone(),
        );
        let payload = sample.encode_payload().unwrap();
        let mut message = Vec::new();
        protocol::write_message(&mut message, MessageKind::Sample, &payload).unwrap();

        let chunks: Vec<&[u8]> = message.chunks(wire::DATAGRAM_PAYLOAD_SIZE).collect();
        let frag_count = chunks.len() as u16;
        let mut complete = None;
        for (index, chunk) in chunks.into_iter().enumerate() {
            let mut datagram = Vec::new();
            wire::write_datagram_header(
                &mut datagram,
                &DatagramHeader {
                    seq: 0,
                    frag_index: index as u16,
                    frag_count,
                },
            )
            .unwrap();
            datagram.extend_from_slice(chunk);
            complete = reassembler.push(&datagram);
        }

        let sample = reassembler.decode(&complete.unwrap()).unwrap();
        assert_eq!(sample.body(), &body[..]);
    }
}
