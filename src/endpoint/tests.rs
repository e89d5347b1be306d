//! In-process integration tests: source endpoints feeding sink endpoints
//! over every transport that can run inside one process.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;

use super::*;
use crate::broker::{
    test_util::RecordingSink, PullSource, QosAwareSource, QosSourceRef, SinkRef,
};
use crate::channel::FrameBufferingPolicy;
use crate::net::{
    acceptor::{TcpConnectionAcceptor, UdpPortAllocator},
    FixedInterfaces, IfaceInfo,
};
use crate::protocol::{
    media_type, EndpointStatistics, Qos, QosRequest, SampleFlags, SampleHeader, Transport,
    COOKIE_LENGTH,
};
use crate::sample::{Allocator, AllocatorRequirements, Sample};
use crate::stats::StatisticsCollector;

struct StreamState {
    sink: Option<SinkRef>,
    next_ts: u64,
    fresh: bool,
    qos: Qos,
}

/// A test source emitting numbered video samples against credits. The
/// first sample after every (re)connect carries the discontinuity flag.
struct TestStreamSource {
    width: u32,
    height: u32,
    allocator: Option<Allocator>,
    state: Mutex<StreamState>,
}

impl TestStreamSource {
    fn new(width: u32, height: u32, allocator: Option<Allocator>) -> Arc<Self> {
        Arc::new(TestStreamSource {
            width,
            height,
            allocator,
            state: Mutex::new(StreamState {
                sink: None,
                next_ts: 0,
                fresh: true,
                qos: Qos::new(),
            }),
        })
    }

    fn make_sample(&self, ts: u64, fresh: bool) -> Sample {
        let header = SampleHeader {
            timestamp: ts,
            flags: if fresh {
                SampleFlags::KEY_SAMPLE | SampleFlags::DISCONTINUITY
            } else {
                SampleFlags::empty()
            },
            major: media_type::VIDEO,
            subtype: 1,
            body_size: 0,
        };

        let mut sample = match &self.allocator {
            Some(allocator) => allocator.alloc_sample(header, &[7; 64]),
            None => Sample::with_body(header, vec![7; 64]),
        };
        sample.set_video_geometry(self.width, self.height);
        sample
    }
}

impl PullSource for TestStreamSource {
    fn on_connected(&self, sink: &SinkRef) {
        let mut state = self.state.lock().unwrap();
        state.sink = Some(sink.clone());
        state.fresh = true;
    }

    fn on_disconnected(&self) {
        self.state.lock().unwrap().sink = None;
    }

    fn request(&self, count: u32) {
        for _ in 0..count {
            let (sink, sample) = {
                let mut state = self.state.lock().unwrap();
                let Some(sink) = state.sink.clone() else {
                    return;
                };
                state.next_ts += 40_000_000;
                let fresh = std::mem::take(&mut state.fresh);
                (sink, (state.next_ts, fresh))
            };
            sink.receive(self.make_sample(sample.0, sample.1));
        }
    }
}

impl QosAwareSource for TestStreamSource {
    fn modify_qos(&self, qos: &Qos) {
        self.state.lock().unwrap().qos = qos.clone();
    }
}

struct FixedStats(EndpointStatistics);

impl StatisticsCollector for FixedStats {
    fn update(&self, _sample: &Sample) {}

    fn statistics(&self) -> EndpointStatistics {
        self.0
    }
}

/// A factory producing [TestStreamSource]s of one size, remembering every
/// source it handed out.
struct TestSourceFactory {
    width: u32,
    height: u32,
    allocator: Option<Allocator>,
    stats: Option<Arc<dyn StatisticsCollector>>,
    created: Mutex<Vec<Arc<TestStreamSource>>>,
}

impl TestSourceFactory {
    fn new(width: u32, height: u32) -> Arc<Self> {
        Arc::new(TestSourceFactory {
            width,
            height,
            allocator: None,
            stats: None,
            created: Mutex::new(Vec::new()),
        })
    }

    fn with_allocator(width: u32, height: u32, allocator: Allocator) -> Arc<Self> {
        Arc::new(TestSourceFactory {
            width,
            height,
            allocator: Some(allocator),
            stats: None,
            created: Mutex::new(Vec::new()),
        })
    }

    fn with_stats(width: u32, height: u32, stats: EndpointStatistics) -> Arc<Self> {
        Arc::new(TestSourceFactory {
            width,
            height,
            allocator: None,
            stats: Some(Arc::new(FixedStats(stats))),
            created: Mutex::new(Vec::new()),
        })
    }
}

impl SourceFactory for TestSourceFactory {
    fn create_source(&self, qos: &Qos) -> Option<QosSourceRef> {
        let source = TestStreamSource::new(self.width, self.height, self.allocator.clone());
        source.modify_qos(qos);
        self.created.lock().unwrap().push(source.clone());
        Some(source)
    }

    fn allocator_requirements(&self) -> AllocatorRequirements {
        AllocatorRequirements {
            allocator: self.allocator.clone(),
            buffer_count: 16,
            buffer_size: 4096,
            alignment: 1,
        }
    }

    fn statistics_collector(&self) -> Option<Arc<dyn StatisticsCollector>> {
        self.stats.clone()
    }
}

struct MapResolver(HashMap<String, Arc<dyn EndpointRpc>>);

impl EndpointResolver for MapResolver {
    fn resolve(&self, name: &str) -> Result<Arc<dyn EndpointRpc>, RpcError> {
        self.0.get(name).cloned().ok_or(RpcError::NotFound)
    }
}

fn loopback_interfaces() -> Arc<FixedInterfaces> {
    Arc::new(FixedInterfaces(vec![IfaceInfo {
        name: "lo".into(),
        address: Ipv4Addr::LOCALHOST,
        is_loopback: true,
        is_up: true,
    }]))
}

fn test_options(ports: std::ops::Range<u16>, host_id: &str) -> SourceEndpointOptions {
    let acceptor = TcpConnectionAcceptor::new(loopback_interfaces(), ports.clone())
        .expect("acceptor should bind on loopback");

    SourceEndpointOptions {
        advertised_address: "127.0.0.1".to_owned(),
        host_id: host_id.to_owned(),
        alt_addresses: Vec::new(),
        interfaces: loopback_interfaces(),
        acceptor: Some(acceptor),
        udp_ports: Some(Arc::new(UdpPortAllocator::new(ports))),
        cookie_timeout: Duration::from_secs(5),
        unused_timeout: Duration::from_secs(60),
    }
}

fn inproc_options() -> SourceEndpointOptions {
    SourceEndpointOptions {
        advertised_address: "127.0.0.1".to_owned(),
        host_id: crate::local_host_id(),
        alt_addresses: Vec::new(),
        interfaces: loopback_interfaces(),
        acceptor: None,
        udp_ports: None,
        cookie_timeout: Duration::from_secs(5),
        unused_timeout: Duration::from_secs(60),
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
fn inproc_connection_delivers_samples() {
    let factory = TestSourceFactory::new(1920, 1080);
    let source = create_pull_source_endpoint(factory, inproc_options(), None);

    let sink = Arc::new(RecordingSink::default());
    let endpoint = create_pull_connection_by_endpoint(
        source.clone(),
        sink.clone(),
        Transport::Auto,
        None,
        FrameBufferingPolicy::Buffered,
    );

    wait_for(|| endpoint.state_name() == "OpenConnected");

    sink.source.lock().unwrap().clone().unwrap().request(3);
    wait_for(|| sink.samples.lock().unwrap().len() >= 3);

    let samples = sink.samples.lock().unwrap();
    assert!(samples[0].flags().contains(SampleFlags::DISCONTINUITY));
    assert_eq!(samples[0].video_geometry(), Some((1920, 1080)));
    drop(samples);

    endpoint.destroy();
    assert_eq!(endpoint.state_name(), "Destroyed");
}

#[test_log::test]
fn rejected_preferences_destroy_the_endpoint() {
    let factory = TestSourceFactory::new(640, 360);
    let mut options = inproc_options();
    options.host_id = "a-host-far-away".to_owned();
    let source = create_pull_source_endpoint(factory, options, None);

    let sink = Arc::new(RecordingSink::default());
    let endpoint = create_pull_connection_by_endpoint(
        source.clone(),
        sink,
        Transport::InProc,
        None,
        FrameBufferingPolicy::Buffered,
    );

    // The negotiator answers "no transport"; the sink gives up entirely.
    wait_for(|| endpoint.state_name() == "Destroyed");
}

#[test_log::test]
fn negotiation_mints_unique_cookies() {
    let factory = TestSourceFactory::new(640, 360);
    let source = create_pull_source_endpoint(factory, test_options(28600..28650, "negotiation-host"), None);

    let (info, first) = source
        .request_connection(
            std::process::id(),
            "negotiation-host",
            &[Transport::Tcp],
            false,
            &Qos::new(),
        )
        .unwrap();
    let (_, second) = source
        .request_connection(
            std::process::id(),
            "negotiation-host",
            &[Transport::Tcp],
            false,
            &Qos::new(),
        )
        .unwrap();

    assert_eq!(first.len(), COOKIE_LENGTH);
    assert_eq!(second.len(), COOKIE_LENGTH);
    assert_ne!(first, second);

    match info {
        ConnectionInfo::Tcp { addresses, .. } => {
            // The caller is "same host": the loopback alternate is added.
            assert_eq!(
                addresses,
                vec!["127.0.0.1".to_owned(), "127.0.0.1".to_owned()]
            );
        }
        other => panic!("expected tcp info, got {other:?}"),
    }
}

#[test_log::test]
fn empty_preferences_yield_no_transport() {
    let factory = TestSourceFactory::new(640, 360);
    let source = create_pull_source_endpoint(factory, inproc_options(), None);

    let (info, cookie) = source
        .request_connection(std::process::id(), &crate::local_host_id(), &[], false, &Qos::new())
        .unwrap();

    assert!(cookie.is_empty());
    assert!(matches!(info, ConnectionInfo::InProc { source: None }));
}

#[test_log::test]
fn local_transport_maps_shared_bodies() {
    let allocator = Allocator::new(crate::protocol::SharedMemoryKind::Posix, 16, 4096);
    let factory = TestSourceFactory::with_allocator(1280, 720, allocator);
    let source = create_pull_source_endpoint(
        factory,
        test_options(28650..28700, &crate::local_host_id()),
        None,
    );

    let sink = Arc::new(RecordingSink::default());
    let endpoint = create_pull_connection_by_endpoint(
        source.clone(),
        sink.clone(),
        Transport::Local,
        None,
        FrameBufferingPolicy::Unbuffered,
    );

    wait_for(|| endpoint.state_name() == "OpenConnected");

    sink.source.lock().unwrap().clone().unwrap().request(5);
    wait_for(|| sink.samples.lock().unwrap().len() >= 5);

    let samples = sink.samples.lock().unwrap();
    assert_eq!(samples[0].body(), &[7; 64]);
    assert_eq!(samples[0].video_geometry(), Some((1280, 720)));
}

#[test_log::test]
fn tcp_transport_delivers_and_reconnects() {
    let factory = TestSourceFactory::new(800, 600);
    let source = create_pull_source_endpoint(
        factory,
        test_options(28700..28750, "some-remote-host"),
        None,
    );

    let sink = Arc::new(RecordingSink::default());
    let endpoint = create_pull_connection_by_endpoint(
        source.clone(),
        sink.clone(),
        Transport::Tcp,
        None,
        FrameBufferingPolicy::Unbuffered,
    );

    wait_for(|| endpoint.state_name() == "OpenConnected");
    sink.source.lock().unwrap().clone().unwrap().request(3);
    wait_for(|| sink.samples.lock().unwrap().len() >= 3);

    // Upstream restart: every proxy source dies, the socket goes with it.
    source.destroy();
    wait_for(|| endpoint.state_name() != "OpenConnected");

    // The endpoint reconnects with backoff and a fresh negotiation.
    wait_for(|| endpoint.state_name() == "OpenConnected");

    let before = sink.samples.lock().unwrap().len();
    sink.source.lock().unwrap().clone().unwrap().request(2);
    wait_for(|| sink.samples.lock().unwrap().len() >= before + 2);

    let samples = sink.samples.lock().unwrap();
    assert!(
        samples[before].flags().contains(SampleFlags::DISCONTINUITY),
        "first sample after reconnect marks the break"
    );
}

#[test_log::test]
fn udp_transport_delivers_samples() {
    let factory = TestSourceFactory::new(320, 240);
    let source = create_pull_source_endpoint(
        factory,
        test_options(28750..28800, "udp-remote-host"),
        None,
    );

    let sink = Arc::new(RecordingSink::default());
    let endpoint = create_pull_connection_by_endpoint(
        source.clone(),
        sink.clone(),
        Transport::Udp,
        None,
        FrameBufferingPolicy::Unbuffered,
    );

    wait_for(|| endpoint.state_name() == "OpenConnected");

    // Let the cookie probes land before pulling.
    std::thread::sleep(Duration::from_millis(200));
    sink.source.lock().unwrap().clone().unwrap().request(3);

    wait_for(|| !sink.samples.lock().unwrap().is_empty());
    assert_eq!(
        sink.samples.lock().unwrap()[0].video_geometry(),
        Some((320, 240))
    );
}

#[test_log::test]
fn qos_updates_reach_the_inner_source() {
    let factory = TestSourceFactory::new(640, 480);
    let source = create_pull_source_endpoint(factory.clone(), inproc_options(), None);

    let sink = Arc::new(RecordingSink::default());
    let endpoint = create_pull_connection_by_endpoint(
        source.clone(),
        sink,
        Transport::Auto,
        Some(Qos::from_requests([QosRequest::OnlyKeyFrames {
            enabled: false,
        }])),
        FrameBufferingPolicy::Buffered,
    );

    wait_for(|| endpoint.state_name() == "OpenConnected");

    let qos = Qos::from_requests([QosRequest::FrameRate { fps: 12.5 }]);
    endpoint.request_qos(&qos).unwrap();

    wait_for(|| {
        factory
            .created
            .lock()
            .unwrap()
            .iter()
            .any(|s| s.state.lock().unwrap().qos == qos)
    });
}

#[test_log::test]
fn remote_source_replays_debt_over_the_connection() {
    let factory = TestSourceFactory::new(640, 480);
    let source = create_pull_source_endpoint(factory, inproc_options(), None);

    let remote = create_pull_source_by_endpoint(
        source.clone(),
        Transport::Auto,
        None,
        FrameBufferingPolicy::Buffered,
    );

    let sink = Arc::new(RecordingSink::default());
    let _conn = crate::broker::connect(remote.clone(), sink.clone());

    // Credits issued before the remote connection finishes are honored
    // once it does.
    remote.request(4);
    wait_for(|| sink.samples.lock().unwrap().len() >= 4);
}

#[test]
fn connection_guard_destroys_on_reset_and_drop() {
    struct CountedConnection(Arc<Mutex<u32>>);

    impl SinkConnection for CountedConnection {
        fn request_qos(&self, _qos: &Qos) {}

        fn destroy(&self) {
            *self.0.lock().unwrap() += 1;
        }
    }

    let destroyed = Arc::new(Mutex::new(0));

    let mut guard = SinkConnectionGuard::new();
    assert!(!guard.is_some());

    guard.replace(Arc::new(CountedConnection(destroyed.clone())));
    assert!(guard.get().is_some());

    guard.replace(Arc::new(CountedConnection(destroyed.clone())));
    assert_eq!(*destroyed.lock().unwrap(), 1);

    guard.reset();
    assert_eq!(*destroyed.lock().unwrap(), 2);

    guard.replace(Arc::new(CountedConnection(destroyed.clone())));
    drop(guard);
    assert_eq!(*destroyed.lock().unwrap(), 3);
}

#[test_log::test]
fn adaptive_source_switches_on_viewport_change() {
    let small_stats = EndpointStatistics {
        width: 640,
        height: 360,
        fps: 25.0,
        bitrate: 1_000_000,
        media_type: media_type::VIDEO,
        stream_type: 1,
    };
    let big_stats = EndpointStatistics {
        width: 1920,
        height: 1080,
        fps: 25.0,
        bitrate: 8_000_000,
        media_type: media_type::VIDEO,
        stream_type: 1,
    };

    let small = create_pull_source_endpoint(
        TestSourceFactory::with_stats(640, 360, small_stats),
        inproc_options(),
        None,
    );
    let big = create_pull_source_endpoint(
        TestSourceFactory::with_stats(1920, 1080, big_stats),
        inproc_options(),
        None,
    );

    let mut map: HashMap<String, Arc<dyn EndpointRpc>> = HashMap::new();
    map.insert("camera/small".to_owned(), small.clone());
    map.insert("camera/big".to_owned(), big.clone());
    let resolver = Arc::new(MapResolver(map));

    let adaptive = crate::adaptive::AdaptiveSource::new(
        resolver,
        &["camera/small".to_owned(), "camera/big".to_owned()],
        Qos::from_requests([QosRequest::FrameGeometry {
            width: 640,
            height: 360,
        }]),
    );

    let sink = Arc::new(RecordingSink::default());
    let _conn = crate::broker::connect(adaptive.clone(), sink.clone());

    adaptive.request(10);
    wait_for(|| !sink.samples.lock().unwrap().is_empty());
    assert_eq!(
        sink.samples.lock().unwrap()[0].video_geometry(),
        Some((640, 360))
    );

    // Growing the viewport forces the switch to the larger streaming.
    adaptive.modify_qos(&Qos::from_requests([QosRequest::FrameGeometry {
        width: 1920,
        height: 1080,
    }]));

    // Keep pulling like a live sink would, until the crossfade completes.
    let deadline = Instant::now() + Duration::from_secs(20);
    let big_arrived = || {
        sink.samples
            .lock()
            .unwrap()
            .iter()
            .any(|s| s.video_geometry() == Some((1920, 1080)))
    };
    while !big_arrived() {
        assert!(Instant::now() < deadline, "timed out");
        adaptive.request(2);
        std::thread::sleep(Duration::from_millis(50));
    }

    let samples = sink.samples.lock().unwrap();
    let first_big = samples
        .iter()
        .find(|s| s.video_geometry() == Some((1920, 1080)))
        .expect("a sample from the big streaming");
    assert!(
        first_big.flags().contains(SampleFlags::DISCONTINUITY),
        "the switch marks the stream break"
    );
}
