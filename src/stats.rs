//! Per-stream telemetry: sliding-window fps/bitrate/geometry collection,
//! fed to an external aggregator as TTL-stamped datapoints.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::protocol::{media_type, EndpointStatistics, SampleFlags};
use crate::sample::Sample;

const SAMPLE_COUNT_FOR_CALCULATE: u64 = 250;
const MIN_STATS_SEND_DELAY: Duration = Duration::from_secs(15);

/// How long a pushed datapoint stays valid at the aggregator.
pub const STAT_TTL: Duration = Duration::from_secs(30);

/// Observes passing samples and reports the stream's current shape.
pub trait StatisticsCollector: Send + Sync {
    /// Feeds one sample.
    fn update(&self, sample: &Sample);

    /// The statistics of the current window.
    fn statistics(&self) -> EndpointStatistics;
}

/// The metrics a stream reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatMetric {
    /// Frames per second.
    LiveFps,
    /// Key frames per second.
    LiveKeyFps,
    /// Bits per second.
    LiveBitrate,
    /// Coded width.
    LiveWidth,
    /// Coded height.
    LiveHeight,
    /// Major media type code.
    LiveMediaType,
    /// Stream subtype code.
    LiveStreamType,
}

/// Whether a datapoint must bypass the aggregator's batching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Deliver with the next batch.
    Deferred,
    /// Deliver now; used when the stream type changes.
    Immediate,
}

/// One datapoint pushed to the aggregator.
#[derive(Debug, Clone, PartialEq)]
pub struct StatPoint {
    /// Which metric this is.
    pub metric: StatMetric,
    /// The stream the metric belongs to.
    pub source_name: String,
    /// How long the value stays valid.
    pub ttl: Duration,
    /// The value.
    pub value: f64,
}

impl StatPoint {
    /// A datapoint with the default TTL.
    pub fn new(metric: StatMetric, source_name: &str, value: f64) -> Self {
        StatPoint {
            metric,
            source_name: source_name.to_owned(),
            ttl: STAT_TTL,
            value,
        }
    }
}

/// The external telemetry aggregator.
pub trait StatisticsAggregator: Send + Sync {
    /// Accepts one datapoint.
    fn push(&self, point: StatPoint, delivery: Delivery);
}

struct FpsCounter {
    count: u32,
    window_start: Instant,
    fps: f32,
}

impl FpsCounter {
    fn new() -> Self {
        FpsCounter {
            count: 0,
            window_start: Instant::now(),
            fps: 0.0,
        }
    }

    fn increment(&mut self) {
        self.count += 1;
    }

    fn force_calc(&mut self) {
        let elapsed = self.window_start.elapsed();
        if elapsed > Duration::ZERO {
            self.fps = self.count as f32 / elapsed.as_secs_f32();
        }
        self.count = 0;
        self.window_start = Instant::now();
    }

    fn fps(&self) -> f32 {
        self.fps
    }
}

struct AggregatingState {
    info: EndpointStatistics,
    sample_count: u64,
    data_size: u64,
    last_report: Instant,
    fps: FpsCounter,
    key_fps: Option<FpsCounter>,
    last_stream_type: u32,
    report_immediately: bool,
}

/// The live-stream collector: windows of 250 samples or 15 seconds,
/// pushed to the aggregator with a 30-second TTL. A stream-type change is
/// reported immediately.
pub struct AggregatingCollector {
    source_name: String,
    aggregator: Option<std::sync::Arc<dyn StatisticsAggregator>>,
    state: Mutex<AggregatingState>,
}

impl AggregatingCollector {
    /// A collector for the named stream. `calc_key_fps` additionally
    /// tracks the key-frame rate.
    pub fn new(
        source_name: &str,
        aggregator: Option<std::sync::Arc<dyn StatisticsAggregator>>,
        calc_key_fps: bool,
    ) -> Self {
        AggregatingCollector {
            source_name: source_name.to_owned(),
            aggregator,
            state: Mutex::new(AggregatingState {
                info: EndpointStatistics::default(),
                sample_count: SAMPLE_COUNT_FOR_CALCULATE - 1,
                data_size: 0,
                last_report: Instant::now(),
                fps: FpsCounter::new(),
                key_fps: calc_key_fps.then(FpsCounter::new),
                last_stream_type: 0,
                report_immediately: true,
            }),
        }
    }

    fn push(&self, metric: StatMetric, value: f64, delivery: Delivery) {
        if let Some(aggregator) = &self.aggregator {
            aggregator.push(StatPoint::new(metric, &self.source_name, value), delivery);
        }
    }
}

impl StatisticsCollector for AggregatingCollector {
    fn update(&self, sample: &Sample) {
        let mut state = self.state.lock().unwrap();
        let header = sample.header();

        state.fps.increment();
        if header.is_key_sample() {
            if let Some(key_fps) = &mut state.key_fps {
                key_fps.increment();
            }
        }

        state.sample_count += 1;
        state.data_size += header.body_size as u64;
        if header.major == media_type::VIDEO {
            if let Some((width, height)) = sample.video_geometry() {
                state.info.width = width;
                state.info.height = height;
            }
        }

        let elapsed = state.last_report.elapsed();
        state.report_immediately = state.last_stream_type != header.subtype;
        state.last_stream_type = header.subtype;
        if !state.report_immediately
            && elapsed < MIN_STATS_SEND_DELAY
            && state.sample_count % SAMPLE_COUNT_FOR_CALCULATE != 0
        {
            return;
        }

        state.fps.force_calc();
        if let Some(key_fps) = &mut state.key_fps {
            key_fps.force_calc();
        }

        if !elapsed.is_zero() {
            state.info.bitrate = 8 * state.data_size * 1000 / elapsed.as_millis().max(1) as u64;
        }
        state.info.fps = state.fps.fps();
        state.info.media_type = header.major;
        state.info.stream_type = header.subtype;

        let delivery = if state.report_immediately {
            Delivery::Immediate
        } else {
            Delivery::Deferred
        };

        self.push(StatMetric::LiveFps, state.info.fps as f64, Delivery::Deferred);
        if let Some(key_fps) = &state.key_fps {
            self.push(
                StatMetric::LiveKeyFps,
                key_fps.fps() as f64,
                Delivery::Deferred,
            );
        }
        self.push(
            StatMetric::LiveBitrate,
            state.info.bitrate as f64,
            Delivery::Deferred,
        );
        self.push(StatMetric::LiveWidth, state.info.width as f64, Delivery::Deferred);
        self.push(
            StatMetric::LiveHeight,
            state.info.height as f64,
            Delivery::Deferred,
        );
        self.push(
            StatMetric::LiveMediaType,
            state.info.media_type as f64,
            Delivery::Deferred,
        );
        self.push(
            StatMetric::LiveStreamType,
            state.info.stream_type as f64,
            delivery,
        );

        state.report_immediately = false;
        state.data_size = 0;
        state.last_report = Instant::now();
    }

    fn statistics(&self) -> EndpointStatistics {
        let mut state = self.state.lock().unwrap();
        state.info.fps = state.fps.fps();
        state.info
    }
}

impl Drop for AggregatingCollector {
    fn drop(&mut self) {
        // Zero out the stream's datapoints so stale values age out fast.
        for metric in [
            StatMetric::LiveFps,
            StatMetric::LiveBitrate,
            StatMetric::LiveWidth,
            StatMetric::LiveHeight,
            StatMetric::LiveMediaType,
            StatMetric::LiveStreamType,
        ] {
            self.push(metric, 0.0, Delivery::Deferred);
        }
    }
}

#[derive(Default)]
struct MeasurerWindow {
    first_ts: u64,
    last_ts: u64,
    frame_count: u32,
    data_size: u64,
    width: u32,
    height: u32,
    media_type: u32,
    stream_type: u32,
}

/// An inline stream-quality measurer for stitched playback: windows reset
/// on end-of-stream and discontinuities, decoder init data is ignored.
pub struct StreamQualityMeasurer {
    stats: Mutex<EndpointStatistics>,
    window: Mutex<MeasurerWindow>,
}

impl Default for StreamQualityMeasurer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamQualityMeasurer {
    /// A fresh measurer.
    pub fn new() -> Self {
        StreamQualityMeasurer {
            stats: Mutex::new(EndpointStatistics::default()),
            window: Mutex::new(MeasurerWindow::default()),
        }
    }

    fn update_stats(&self, window: &MeasurerWindow) {
        let span_ms = window.last_ts.saturating_sub(window.first_ts) / 1_000_000;
        if span_ms == 0 {
            return;
        }

        let mut stats = self.stats.lock().unwrap();
        stats.fps = 1000.0 * window.frame_count as f32 / span_ms as f32;
        stats.bitrate = window.data_size * 8 * 1000 / span_ms;
        stats.media_type = window.media_type;
        stats.stream_type = window.stream_type;
        stats.width = window.width;
        stats.height = window.height;
    }
}

impl StatisticsCollector for StreamQualityMeasurer {
    fn update(&self, sample: &Sample) {
        let header = *sample.header();
        let mut window = self.window.lock().unwrap();

        if header.is_end_of_stream() {
            self.update_stats(&window);
            *window = MeasurerWindow::default();
            return;
        }
        if header.flags.contains(SampleFlags::INIT_DATA) {
            return;
        }

        let window_ms = window.last_ts.saturating_sub(window.first_ts) / 1_000_000;
        if header.flags.contains(SampleFlags::DISCONTINUITY)
            || (header.is_key_sample() && window_ms >= MIN_STATS_SEND_DELAY.as_millis() as u64)
        {
            self.update_stats(&window);
            *window = MeasurerWindow::default();
        }

        if window.frame_count == 0 {
            if header.major == media_type::VIDEO {
                if let Some((width, height)) = sample.video_geometry() {
                    window.width = width;
                    window.height = height;
                }
            }
            window.media_type = header.major;
            window.stream_type = header.subtype;
            window.first_ts = header.timestamp;
            window.last_ts = header.timestamp;
        } else {
            window.first_ts = window.first_ts.min(header.timestamp);
            window.last_ts = window.last_ts.max(header.timestamp);
        }
        window.frame_count += 1;

        window.data_size += header.body_size as u64;

        if window.frame_count % SAMPLE_COUNT_FOR_CALCULATE as u32 == 0 {
            self.update_stats(&window);
        }
    }

    fn statistics(&self) -> EndpointStatistics {
        *self.stats.lock().unwrap()
    }
}
