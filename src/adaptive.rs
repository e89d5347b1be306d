//! The adaptive source: one logical stream backed by several alternative
//! streamings of the same scene. Statistics drive the choice of the
//! backing stream; switching uses a two-sink crossfade so the downstream
//! sink never observes the reconnect latency.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::broker::{PullSink, PullSource, QosAwareSource, QosSourceRef, SinkRef, SourceRef};
use crate::channel::FrameBufferingPolicy;
use crate::endpoint::{
    create_pull_connection_by_name, EndpointResolver, SinkEndpoint, SourceFactory,
};
use crate::protocol::{EndpointStatistics, Qos, SampleFlags, Transport};
use crate::sample::Sample;

const CHECK_PERIOD: Duration = Duration::from_secs(35);

/// The factor by which a stream may be smaller than the uniform fit into
/// the viewport and still qualify.
const QUALITY_FACTOR: f64 = 1.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Size {
    width: u32,
    height: u32,
}

impl Size {
    fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    fn is_empty(&self) -> bool {
        self.area() == 0
    }
}

impl Ord for Size {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.area(), self.width).cmp(&(other.area(), other.width))
    }
}

impl PartialOrd for Size {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Uniformly scales `stream` into `viewport`.
fn fit(stream: Size, viewport: Size) -> Size {
    if viewport.is_empty() || stream.is_empty() {
        return viewport;
    }

    let factor = f64::min(
        viewport.width as f64 / stream.width as f64,
        viewport.height as f64 / stream.height as f64,
    );
    Size {
        width: (factor * stream.width as f64).round() as u32,
        height: (factor * stream.height as f64).round() as u32,
    }
}

/// Folds a frame rate into a comparable integer: 2 fps beats 1 fps and
/// 0.5 fps beats 0.2 fps with the same arithmetic.
fn fps_factor(fps: f32) -> i32 {
    let fps = fps.max(0.001);
    if fps < 1.0 {
        (-(1.0 / fps)).round() as i32
    } else {
        fps.round() as i32
    }
}

struct AltSink {
    index: usize,
    name: String,
    resolver: Arc<dyn EndpointResolver>,
    parent: Weak<AdaptiveInner>,
    stats: Mutex<EndpointStatistics>,
    upstream: Mutex<Option<SourceRef>>,
    connection: Mutex<Option<Arc<SinkEndpoint>>>,
}

impl AltSink {
    fn size(&self) -> Size {
        let stats = self.stats.lock().unwrap();
        Size {
            width: stats.width,
            height: stats.height,
        }
    }

    fn statistics(&self) -> EndpointStatistics {
        *self.stats.lock().unwrap()
    }

    fn update_stats(&self) {
        let fetched = self
            .resolver
            .resolve(&self.name)
            .and_then(|endpoint| endpoint.get_statistics());
        if let Ok(stats) = fetched {
            *self.stats.lock().unwrap() = stats;
        }
    }

    fn connect(self: &Arc<Self>, qos: &Qos) {
        let connection = create_pull_connection_by_name(
            self.resolver.clone(),
            &self.name,
            self.clone(),
            Transport::InProc,
            Some(qos.clone()),
            FrameBufferingPolicy::Buffered,
        );
        *self.connection.lock().unwrap() = Some(connection);
    }

    fn disconnect(&self) {
        if let Some(connection) = self.connection.lock().unwrap().take() {
            connection.destroy();
        }
    }

    fn request(&self, count: u32) {
        let upstream = self.upstream.lock().unwrap().clone();
        if let Some(upstream) = upstream {
            upstream.request(count);
        }
    }

    /// Whether this stream is a richer rendition than `other` of the same
    /// size bucket.
    fn better_than(&self, other: &AltSink) -> bool {
        let (a, b) = (self.statistics(), other.statistics());
        let (sa, sb) = (self.size(), other.size());

        sb < sa
            || (sb == sa && fps_factor(b.fps) < fps_factor(a.fps))
            || (sb == sa && fps_factor(b.fps) == fps_factor(a.fps) && b.bitrate < a.bitrate)
    }

    /// Whether this stream is the cheaper rendition: smaller area, among
    /// equals fewer fps, among equals lower bitrate.
    fn cheaper_than(&self, other: &AltSink) -> bool {
        let (a, b) = (self.statistics(), other.statistics());
        let (sa, sb) = (self.size(), other.size());

        sa < sb
            || (sa == sb && fps_factor(a.fps) < fps_factor(b.fps))
            || (sa == sb && fps_factor(a.fps) == fps_factor(b.fps) && a.bitrate < b.bitrate)
    }

    /// Whether switching from `current` to this stream is worth the
    /// reconnect: different size, different fps factor, or a bitrate gap
    /// above 5 %.
    fn differs_enough(&self, current: &AltSink) -> bool {
        if self.size() != current.size()
            || fps_factor(self.statistics().fps) != fps_factor(current.statistics().fps)
        {
            return true;
        }

        let rate1 = self.statistics().bitrate as i64;
        let rate2 = current.statistics().bitrate as i64;
        (rate2 - rate1).abs() > rate2 / 20
    }
}

impl PullSink for AltSink {
    fn on_connected(&self, source: &SourceRef) {
        *self.upstream.lock().unwrap() = Some(source.clone());

        if let Some(parent) = self.parent.upgrade() {
            let outstanding = parent.state.lock().unwrap().requested;
            if outstanding > 0 {
                source.request(outstanding);
            }
        }
    }

    fn on_disconnected(&self) {
        *self.upstream.lock().unwrap() = None;
    }

    fn receive(&self, sample: Sample) {
        if let Some(parent) = self.parent.upgrade() {
            parent.receive(sample, self.index);
        }
    }
}

struct AdaptiveState {
    qos: Qos,
    downstream: Option<SinkRef>,
    requested: u32,
    active: Option<usize>,
    old_active: Option<usize>,
    low_quality: Option<usize>,
    best: BTreeMap<Size, usize>,
    last_check: Instant,
    switch_requested: bool,
    pending_discontinuity: bool,
}

struct AdaptiveInner {
    sinks: Vec<Arc<AltSink>>,
    state: Mutex<AdaptiveState>,
}

/// A pull source that transparently follows the best-fitting alternative
/// streaming for the sink's current viewport.
pub struct AdaptiveSource {
    inner: Arc<AdaptiveInner>,
}

impl std::fmt::Debug for AdaptiveSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveSource")
            .field("alternatives", &self.inner.sinks.len())
            .finish()
    }
}

impl AdaptiveSource {
    /// An adaptive source over the named alternative streamings.
    pub fn new(
        resolver: Arc<dyn EndpointResolver>,
        streamings: &[String],
        qos: Qos,
    ) -> Arc<AdaptiveSource> {
        let inner = Arc::new_cyclic(|weak: &Weak<AdaptiveInner>| {
            let sinks = streamings
                .iter()
                .enumerate()
                .map(|(index, name)| {
                    Arc::new(AltSink {
                        index,
                        name: name.clone(),
                        resolver: resolver.clone(),
                        parent: weak.clone(),
                        stats: Mutex::new(EndpointStatistics::default()),
                        upstream: Mutex::new(None),
                        connection: Mutex::new(None),
                    })
                })
                .collect();

            AdaptiveInner {
                sinks,
                state: Mutex::new(AdaptiveState {
                    qos,
                    downstream: None,
                    requested: 0,
                    active: None,
                    old_active: None,
                    low_quality: None,
                    best: BTreeMap::new(),
                    last_check: Instant::now(),
                    switch_requested: false,
                    pending_discontinuity: false,
                }),
            }
        });

        inner.check_stats();
        Arc::new(AdaptiveSource { inner })
    }
}

impl AdaptiveInner {
    /// Refreshes every alternative's statistics and rebuilds the
    /// size-bucketed candidate table.
    fn check_stats(&self) {
        for sink in &self.sinks {
            sink.update_stats();
        }

        let mut best: BTreeMap<Size, usize> = BTreeMap::new();
        let mut low_quality: Option<usize> = None;
        for sink in &self.sinks {
            match best.entry(sink.size()) {
                std::collections::btree_map::Entry::Vacant(entry) => {
                    entry.insert(sink.index);
                }
                std::collections::btree_map::Entry::Occupied(mut entry) => {
                    if sink.better_than(&self.sinks[*entry.get()]) {
                        entry.insert(sink.index);
                    }
                }
            }

            low_quality = match low_quality {
                Some(current) if !sink.cheaper_than(&self.sinks[current]) => Some(current),
                _ => Some(sink.index),
            };
        }

        let mut state = self.state.lock().unwrap();
        state.best = best;
        state.low_quality = low_quality;
        state.last_check = Instant::now();
    }

    fn required_sink(&self, state: &AdaptiveState, viewport: Size) -> Option<usize> {
        if viewport.is_empty() {
            return state.low_quality;
        }
        if state.best.is_empty() {
            return None;
        }

        let candidates: Vec<usize> = state.best.values().copied().collect();
        for &index in &candidates[..candidates.len() - 1] {
            let stream = self.sinks[index].size();
            if stream.is_empty() {
                continue;
            }

            let required = fit(stream, viewport);
            if QUALITY_FACTOR * stream.width as f64 >= required.width as f64
                && QUALITY_FACTOR * stream.height as f64 >= required.height as f64
            {
                return Some(index);
            }
        }
        candidates.last().copied()
    }

    fn select_active_sink(&self, state: &mut AdaptiveState, force_switch: bool) {
        state.switch_requested |= force_switch;

        let Some((width, height)) = state.qos.frame_geometry() else {
            return;
        };
        let Some(candidate) = self.required_sink(state, Size { width, height }) else {
            return;
        };

        if state.active != Some(candidate) && state.downstream.is_some() {
            let differs = state
                .active
                .map(|active| self.sinks[candidate].differs_enough(&self.sinks[active]))
                .unwrap_or(true);

            if state.active.is_none() || state.switch_requested || differs {
                self.switch_to(state, candidate);
            } else {
                state.switch_requested = true;
            }
        }
    }

    /// The crossfade: the new sink connects before the old disconnects;
    /// the old one is dropped when the first sample arrives from the new.
    fn switch_to(&self, state: &mut AdaptiveState, candidate: usize) {
        let old_is_candidate = state.old_active == Some(candidate);

        if let Some(old) = state.old_active {
            // A switch during a switch: drop the middle stream at once.
            if let Some(active) = state.active {
                if active != old && active != candidate {
                    self.sinks[active].disconnect();
                }
            }
        } else {
            state.old_active = state.active;
        }

        state.active = Some(candidate);
        state.pending_discontinuity = true;
        if old_is_candidate {
            state.old_active = None;
        } else {
            self.sinks[candidate].connect(&state.qos);
        }
        state.switch_requested = false;
    }

    fn receive(&self, mut sample: Sample, from_index: usize) {
        let check_due = {
            let state = self.state.lock().unwrap();
            state.last_check.elapsed() >= CHECK_PERIOD
        };
        if check_due {
            self.check_stats();
            let mut state = self.state.lock().unwrap();
            self.select_active_sink(&mut state, false);
        }

        let mut to_disconnect = None;
        let downstream = {
            let mut state = self.state.lock().unwrap();

            if state.active == Some(from_index) {
                if let Some(old) = state.old_active.take() {
                    to_disconnect = Some(old);
                }
            }

            let relevant =
                state.active == Some(from_index) || state.old_active == Some(from_index);
            if !relevant || state.requested == 0 {
                None
            } else {
                state.requested -= 1;
                if state.pending_discontinuity && state.active == Some(from_index) {
                    sample.set_flag(SampleFlags::DISCONTINUITY);
                    state.pending_discontinuity = false;
                }
                state.downstream.clone()
            }
        };

        if let Some(old) = to_disconnect {
            self.sinks[old].disconnect();
        }
        if let Some(downstream) = downstream {
            downstream.receive(sample);
        }
    }
}

impl PullSource for AdaptiveSource {
    fn on_connected(&self, sink: &SinkRef) {
        let mut state = self.inner.state.lock().unwrap();
        state.downstream = Some(sink.clone());
        self.inner.select_active_sink(&mut state, true);
    }

    fn on_disconnected(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.downstream = None;
        state.active = None;
        state.old_active = None;
        state.requested = 0;
        drop(state);

        for sink in &self.inner.sinks {
            sink.disconnect();
        }
    }

    fn request(&self, count: u32) {
        let (active, old) = {
            let mut state = self.inner.state.lock().unwrap();
            state.requested += count;
            (state.active, state.old_active)
        };

        for index in [active, old].into_iter().flatten() {
            self.inner.sinks[index].request(count);
        }
    }
}

impl QosAwareSource for AdaptiveSource {
    fn modify_qos(&self, qos: &Qos) {
        let mut state = self.inner.state.lock().unwrap();
        state.qos = qos.clone();
        self.inner.select_active_sink(&mut state, true);
    }
}

/// A source factory serving adaptive sources over the streamings enabled
/// on it, preferring the ones marked for adaptive ("green") use.
pub struct AdaptiveSourceFactory {
    resolver: Arc<dyn EndpointResolver>,
    streams: Mutex<StreamSets>,
}

#[derive(Default)]
struct StreamSets {
    available: std::collections::BTreeSet<String>,
    green: std::collections::BTreeSet<String>,
}

impl StreamSets {
    fn selected(&self) -> Vec<String> {
        if !self.green.is_empty() {
            self.green.iter().cloned().collect()
        } else {
            self.available.iter().take(1).cloned().collect()
        }
    }
}

impl AdaptiveSourceFactory {
    /// An empty factory over the given resolver.
    pub fn new(resolver: Arc<dyn EndpointResolver>) -> Self {
        AdaptiveSourceFactory {
            resolver,
            streams: Mutex::new(StreamSets::default()),
        }
    }

    /// Makes a streaming available, optionally marking it for adaptive
    /// use.
    pub fn enable(&self, name: &str, use_for_adaptive: bool) {
        let mut streams = self.streams.lock().unwrap();
        streams.available.insert(name.to_owned());
        if use_for_adaptive {
            streams.green.insert(name.to_owned());
        } else {
            streams.green.remove(name);
        }
    }

    /// Removes a streaming entirely.
    pub fn disable(&self, name: &str) {
        let mut streams = self.streams.lock().unwrap();
        streams.available.remove(name);
        streams.green.remove(name);
    }

    /// The streamings an adaptive source would currently be built over.
    pub fn selected(&self) -> Vec<String> {
        self.streams.lock().unwrap().selected()
    }
}

impl SourceFactory for AdaptiveSourceFactory {
    fn create_source(&self, qos: &Qos) -> Option<QosSourceRef> {
        let selected = self.selected();
        if selected.is_empty() {
            return None;
        }
        Some(AdaptiveSource::new(
            self.resolver.clone(),
            &selected,
            qos.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn size_orders_by_area_then_width() {
        let small = Size {
            width: 640,
            height: 360,
        };
        let big = Size {
            width: 1920,
            height: 1080,
        };
        let tall = Size {
            width: 360,
            height: 640,
        };

        assert!(small < big);
        assert!(tall < small);
        assert!(Size::default().is_empty());
    }

    #[test]
    fn fps_factor_orders_slow_streams() {
        assert_eq!(fps_factor(25.0), 25);
        assert_eq!(fps_factor(2.0), 2);
        assert_eq!(fps_factor(0.5), -2);
        assert_eq!(fps_factor(0.2), -5);

        // 2 fps beats 1 fps, and 0.5 fps beats 0.2 fps.
        assert!(fps_factor(2.0) > fps_factor(1.0));
        assert!(fps_factor(0.5) > fps_factor(0.2));
    }

    #[test]
    fn fit_scales_uniformly() {
        let stream = Size {
            width: 1920,
            height: 1080,
        };
        let viewport = Size {
            width: 960,
            height: 960,
        };

        let fitted = fit(stream, viewport);
        assert_eq!((fitted.width, fitted.height), (960, 540));
    }

    #[test]
    fn factory_prefers_green_streamings() {
        struct NoResolver;
        impl EndpointResolver for NoResolver {
            fn resolve(
                &self,
                _name: &str,
            ) -> Result<Arc<dyn crate::endpoint::EndpointRpc>, crate::endpoint::RpcError> {
                Err(crate::endpoint::RpcError::NotFound)
            }
        }

        let factory = AdaptiveSourceFactory::new(Arc::new(NoResolver));
        assert!(factory.selected().is_empty());

        factory.enable("camera/low", false);
        assert_eq!(factory.selected(), vec!["camera/low".to_owned()]);

        factory.enable("camera/high", true);
        factory.enable("camera/low", true);
        assert_eq!(
            factory.selected(),
            vec!["camera/high".to_owned(), "camera/low".to_owned()]
        );

        factory.disable("camera/high");
        factory.disable("camera/low");
        assert!(factory.selected().is_empty());
    }
}
