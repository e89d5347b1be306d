//! Archived playback over several storage sources: plans a globally
//! sorted, non-overlapping sequence of recorded intervals and presents it
//! as one continuous seekable stream, forward or reverse.
//!
//! Samples are tagged with the current session id; a seek increments the
//! session and stale samples are dropped. Every interval change injects a
//! discontinuity into the first sample of the new interval.

use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use crate::broker::{PullSink, PullSource, QosAwareSource, SeekableSource, SinkRef, SourceRef};
use crate::channel::FrameBufferingPolicy;
use crate::endpoint::{
    create_pull_connection_by_endpoint, RpcError, SinkEndpoint, StorageEndpointRpc,
};
use crate::protocol::{Interval, MediaTime, PlayMode, Qos, SampleFlags, StartPosition, Transport};
use crate::sample::Sample;
use crate::stats::{StatisticsCollector, StreamQualityMeasurer};

const MAX_INTERVALS: u32 = 32768;
const HISTORY_PORTION: u64 = 24 * 60 * 60 * 1_000_000_000;
const ONE_MILLISECOND: u64 = 1_000_000;

/// How urgently an archive reader competes for storage bandwidth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StoragePriority {
    /// Background export and similar.
    Low,
    /// Regular playback.
    Mid,
    /// Interactive playback.
    High,
}

/// The client view of one storage source.
pub trait StorageSource: Send + Sync {
    /// Lists recorded intervals intersecting `[from, to)`, at most
    /// `max_count`, merging gaps shorter than `min_gap_ms`.
    fn get_history(
        &self,
        from: MediaTime,
        to: MediaTime,
        max_count: u32,
        min_gap_ms: u32,
    ) -> Result<Vec<Interval>, RpcError>;

    /// Opens a seekable reader endpoint positioned at `time`.
    fn get_source_reader_endpoint(
        &self,
        time: MediaTime,
        start: StartPosition,
        realtime: bool,
        mode: PlayMode,
        priority: StoragePriority,
    ) -> Result<Arc<dyn StorageEndpointRpc>, RpcError>;
}

/// Retry pacing for BUSY answers: equal-jitter exponential backoff from
/// 500 ms up to 3 s, at most 4 attempts.
#[derive(Debug, Clone, Copy)]
struct RetryState {
    attempts: u32,
    current: Duration,
}

impl RetryState {
    const INITIAL: Duration = Duration::from_millis(500);
    const MAX: Duration = Duration::from_millis(3000);
    const MAX_ATTEMPTS: u32 = 4;

    fn fresh() -> Self {
        RetryState {
            attempts: 0,
            current: Self::INITIAL,
        }
    }

    /// The next delay, or `None` when the retry budget is spent. A `None`
    /// input means "run now, this is not a retry".
    fn next_timeout(state: Option<RetryState>) -> Option<(Duration, Option<RetryState>)> {
        let Some(mut state) = state else {
            return Some((Duration::ZERO, None));
        };

        state.attempts += 1;
        if state.attempts > Self::MAX_ATTEMPTS {
            return None;
        }

        let delay = equal_jitter(state.current);
        state.current = (state.current * 2).min(Self::MAX);
        Some((delay, Some(state)))
    }
}

/// Half the base delay fixed, half random.
fn equal_jitter(base: Duration) -> Duration {
    let half = base / 2;
    let entropy = uuid::Uuid::new_v4().as_u64_pair().0;
    half + Duration::from_nanos(entropy % half.as_nanos().max(1) as u64)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    StartPlaying,
    TryNextInterval,
}

#[derive(Debug, Clone, Copy)]
struct PlannedInterval {
    interval: Interval,
    processor: usize,
}

#[derive(Default)]
struct ProcState {
    intervals: Vec<Interval>,
    interval: Option<Interval>,
    end_reached: bool,
    just_started: bool,
    saved_session_out: u32,
    upstream: Option<SourceRef>,
    endpoint: Option<Arc<dyn StorageEndpointRpc>>,
    connection: Option<Arc<SinkEndpoint>>,
}

struct PlannerState {
    requested: u32,
    mode: PlayMode,
    time_position: MediaTime,
    frame_position: StartPosition,
    session_out: u32,
    session_in: u32,
    downstream: Option<SinkRef>,
    planned: Vec<PlannedInterval>,
    active: Option<usize>,
    discontinuity: bool,
    lower: Option<MediaTime>,
    upper: Option<MediaTime>,
    procs: Vec<ProcState>,
}

impl PlannerState {
    fn is_runnable(&self, session: u32) -> bool {
        self.session_out == session && self.downstream.is_some()
    }

    fn reverse(&self) -> bool {
        self.mode.contains(PlayMode::REVERSE)
    }
}

type Guard<'a> = MutexGuard<'a, PlannerState>;

/// The sink pin a storage reader delivers into; all of its mutable state
/// lives in the planner's arena under the planner's lock.
struct StorageProcessor {
    index: usize,
    owner: Weak<PlannerInner>,
}

impl PullSink for StorageProcessor {
    fn on_connected(&self, source: &SourceRef) {
        let Some(owner) = self.owner.upgrade() else {
            return;
        };
        let mut state = owner.state.lock().unwrap();
        state.procs[self.index].upstream = Some(source.clone());
        drop(owner.do_request(state, self.index, 0));
    }

    fn on_disconnected(&self) {
        if let Some(owner) = self.owner.upgrade() {
            owner.state.lock().unwrap().procs[self.index].upstream = None;
        }
    }

    fn receive(&self, sample: Sample) {
        let Some(owner) = self.owner.upgrade() else {
            return;
        };
        owner.receive_from_processor(self.index, sample);
    }
}

struct PlannerInner {
    processors: Vec<StorageProcessorHandle>,
    measurer: Arc<StreamQualityMeasurer>,
    state: Mutex<PlannerState>,
}

struct StorageProcessorHandle {
    sink: Arc<StorageProcessor>,
    storage: Arc<dyn StorageSource>,
}

/// A seekable pull source stitching several storage sources into one
/// timeline.
pub struct PlannedSequenceSource {
    inner: Arc<PlannerInner>,
}

impl std::fmt::Debug for PlannedSequenceSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlannedSequenceSource")
            .field("storages", &self.inner.processors.len())
            .finish()
    }
}

/// Creates a planned-sequence source over the given storage sources.
pub fn create_planned_sequence_source(
    storage_sources: Vec<Arc<dyn StorageSource>>,
    begin_time: MediaTime,
    position: StartPosition,
    mode: PlayMode,
) -> Arc<PlannedSequenceSource> {
    let inner = Arc::new_cyclic(|weak: &Weak<PlannerInner>| {
        let processors = storage_sources
            .iter()
            .enumerate()
            .map(|(index, storage)| StorageProcessorHandle {
                sink: Arc::new(StorageProcessor {
                    index,
                    owner: weak.clone(),
                }),
                storage: storage.clone(),
            })
            .collect();

        PlannerInner {
            processors,
            measurer: Arc::new(StreamQualityMeasurer::new()),
            state: Mutex::new(PlannerState {
                requested: 0,
                mode,
                time_position: begin_time,
                frame_position: position,
                session_out: 0,
                session_in: 0,
                downstream: None,
                planned: Vec::new(),
                active: None,
                discontinuity: false,
                lower: None,
                upper: None,
                procs: storage_sources.iter().map(|_| ProcState::default()).collect(),
            }),
        }
    });

    log::info!("created sequence planner over {} storages", inner.processors.len());
    Arc::new(PlannedSequenceSource { inner })
}

impl PlannedSequenceSource {
    /// The inline quality measurer observing the stitched stream.
    pub fn statistics_collector(&self) -> Arc<dyn StatisticsCollector> {
        self.inner.measurer.clone()
    }
}

impl Drop for PlannedSequenceSource {
    fn drop(&mut self) {
        let connections: Vec<_> = {
            let mut state = self.inner.state.lock().unwrap();
            state
                .procs
                .iter_mut()
                .filter_map(|p| p.connection.take())
                .collect()
        };
        for connection in connections {
            connection.destroy();
        }
    }
}

impl PlannerInner {
    /// Releases the planner lock around a blocking call.
    fn unlocked<R>(&self, guard: Guard<'_>, f: impl FnOnce() -> R) -> (Guard<'_>, R) {
        drop(guard);
        let result = f();
        (self.state.lock().unwrap(), result)
    }

    fn post(self: &Arc<Self>, session: u32, action: Action, retry: Option<RetryState>) {
        let Some((delay, retry)) = RetryState::next_timeout(retry) else {
            log::error!(
                "sequence planner failed to retry a storage request after {} attempts",
                RetryState::MAX_ATTEMPTS
            );
            return;
        };

        let this = self.clone();
        let _ = std::thread::Builder::new()
            .name("mediabus-planner".into())
            .spawn(move || {
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
                this.rerun_if_runnable(session, action, retry);
            });
    }

    fn post_delayed(self: &Arc<Self>, session: u32, action: Action, retry: Option<RetryState>) {
        self.post(session, action, Some(retry.unwrap_or_else(RetryState::fresh)));
    }

    fn rerun_if_runnable(self: &Arc<Self>, session: u32, action: Action, retry: Option<RetryState>) {
        let state = self.state.lock().unwrap();
        if !state.is_runnable(session) {
            return;
        }

        let (_state, result) = match action {
            Action::StartPlaying => self.start_playing(state, session),
            Action::TryNextInterval => self.try_next_interval(state, session),
        };

        if let Err(RpcError::Busy) = result {
            self.post_delayed(session, action, retry);
        }
    }

    fn start_playing<'a>(
        self: &'a Arc<Self>,
        state: Guard<'a>,
        session: u32,
    ) -> (Guard<'a>, Result<(), RpcError>) {
        let (state, result) = self.build_intervals_sequence(state, session);
        if result.is_ok() {
            self.post(session, Action::TryNextInterval, None);
        }
        (state, result)
    }

    fn clear_plan(state: &mut PlannerState) {
        state.active = None;
        state.planned.clear();
    }

    fn build_intervals_sequence<'a>(
        self: &'a Arc<Self>,
        mut state: Guard<'a>,
        session: u32,
    ) -> (Guard<'a>, Result<(), RpcError>) {
        Self::clear_plan(&mut state);

        let (mut state, can_build) = self.can_build_intervals(state, session);
        match can_build {
            Err(err) => return (state, Err(err)),
            Ok(false) => return (state, Ok(())),
            Ok(true) => {}
        }

        if state.reverse() {
            state.time_position = state.time_position.saturating_sub(HISTORY_PORTION);
        }
        if state.frame_position == StartPosition::OneFrameBack {
            if let Some(upper) = state.upper {
                state.time_position = state
                    .time_position
                    .min(upper.saturating_sub(ONE_MILLISECOND));
            }
        }

        let begin = state.time_position;
        let end = begin.saturating_add(HISTORY_PORTION);
        let window = Interval::new(begin, end);

        for index in 0..self.processors.len() {
            let storage = self.processors[index].storage.clone();
            let (guard, history) = self.unlocked(state, || {
                storage.get_history(window.begin, window.end, MAX_INTERVALS, 0)
            });
            state = guard;

            state.procs[index].intervals = match history {
                Ok(intervals) => intervals
                    .iter()
                    .map(|i| window.intersection(i))
                    .filter(|i| !i.is_empty())
                    .collect(),
                Err(RpcError::Busy) => return (state, Err(RpcError::Busy)),
                Err(err) => {
                    log::warn!("get_history failed: {err}");
                    Vec::new()
                }
            };
        }

        if state.is_runnable(session) {
            loop {
                let Some(best) = Self::offer_best_interval(&state) else {
                    break;
                };

                state.time_position = best.interval.end;

                if let Some(last) = state.planned.last_mut() {
                    if last.interval.end > best.interval.begin {
                        last.interval = Interval::new(last.interval.begin, best.interval.begin);
                    }
                }
                state.planned.push(best);
            }

            if state.reverse() {
                state.time_position = state.lower.map_or(begin, |lower| begin.max(lower));
                state.planned.reverse();
            } else {
                state.time_position = state.upper.map_or(end, |upper| end.min(upper));
            }

            log::debug!("planned {} intervals", state.planned.len());
        }

        (state, Ok(()))
    }

    /// The best next interval across all processors: the one with the
    /// smallest shift past the cursor, ties broken toward the later end.
    fn offer_best_interval(state: &PlannerState) -> Option<PlannedInterval> {
        let cursor = state.time_position;
        let mut best: Option<PlannedInterval> = None;

        for (index, proc) in state.procs.iter().enumerate() {
            let Some(candidate) = proc.intervals.iter().find(|i| i.end > cursor) else {
                continue;
            };

            let shift = candidate.begin.saturating_sub(cursor);
            let replace = match &best {
                None => true,
                Some(current) => {
                    let current_shift = current.interval.begin.saturating_sub(cursor);
                    shift < current_shift
                        || (shift == current_shift && candidate.end > current.interval.end)
                }
            };

            if replace {
                best = Some(PlannedInterval {
                    interval: *candidate,
                    processor: index,
                });
            }
        }

        best
    }

    fn can_build_intervals<'a>(
        self: &'a Arc<Self>,
        state: Guard<'a>,
        session: u32,
    ) -> (Guard<'a>, Result<bool, RpcError>) {
        let (state, result) = self.build_boundary(state, session);
        match result {
            Err(err) => (state, Err(err)),
            Ok(false) => (state, Ok(false)),
            Ok(true) => {
                let ok = state.is_runnable(session) && Self::check_time_limits(&state);
                (state, Ok(ok))
            }
        }
    }

    fn check_time_limits(state: &PlannerState) -> bool {
        if state.reverse() {
            state.lower.is_some_and(|lower| lower < state.time_position)
        } else {
            state.upper.is_some_and(|upper| {
                upper > state.time_position
                    || state.frame_position == StartPosition::OneFrameBack
            })
        }
    }

    fn build_boundary<'a>(
        self: &'a Arc<Self>,
        mut state: Guard<'a>,
        session: u32,
    ) -> (Guard<'a>, Result<bool, RpcError>) {
        state.lower = None;
        state.upper = None;

        for index in 0..self.processors.len() {
            if !state.is_runnable(session) {
                break;
            }

            let storage = self.processors[index].storage.clone();
            let (guard, history) =
                self.unlocked(state, || storage.get_history(0, MediaTime::MAX, 1, 0));
            state = guard;

            match history {
                Ok(intervals) => {
                    if let Some(first) = intervals.first() {
                        state.lower = Some(state.lower.map_or(first.begin, |l| l.min(first.begin)));
                        state.upper = Some(state.upper.map_or(first.end, |u| u.max(first.end)));
                    }
                }
                Err(RpcError::Busy) => return (state, Err(RpcError::Busy)),
                Err(err) => log::warn!("boundary discovery failed: {err}"),
            }
        }

        let bounded = state.lower.is_some() && state.upper.is_some();
        (state, Ok(bounded))
    }

    fn try_next_interval<'a>(
        self: &'a Arc<Self>,
        state: Guard<'a>,
        session: u32,
    ) -> (Guard<'a>, Result<(), RpcError>) {
        let (state, started) = self.start_next_interval(state, session);
        match started {
            Err(err) => (state, Err(err)),
            Ok(true) => (state, Ok(())),
            Ok(false) => {
                let epsilon = if state.reverse() { -1i64 } else { 1i64 };
                let timestamp = state.time_position.saturating_add_signed(epsilon);
                let state = self.forward_downstream(state, Sample::end_of_stream(timestamp));

                self.post_delayed(session, Action::StartPlaying, None);
                (state, Ok(()))
            }
        }
    }

    fn start_next_interval<'a>(
        self: &'a Arc<Self>,
        mut state: Guard<'a>,
        session: u32,
    ) -> (Guard<'a>, Result<bool, RpcError>) {
        let next = state.active.map_or(0, |a| a + 1);
        let Some(&planned) = state.planned.get(next) else {
            Self::clear_plan(&mut state);
            return (state, Ok(false));
        };

        log::debug!(
            "starting interval [{}, {}) on processor {}",
            planned.interval.begin,
            planned.interval.end,
            planned.processor
        );

        {
            let proc = &mut state.procs[planned.processor];
            proc.interval = Some(planned.interval);
            proc.end_reached = false;
        }
        state.active = Some(next);
        state.discontinuity = true;

        let (state, result) = self.reset_sink_connection(state, planned, session);
        match result {
            Ok(()) => (state, Ok(true)),
            Err(err) => (state, Err(err)),
        }
    }

    fn reset_sink_connection<'a>(
        self: &'a Arc<Self>,
        mut state: Guard<'a>,
        planned: PlannedInterval,
        session: u32,
    ) -> (Guard<'a>, Result<(), RpcError>) {
        let index = planned.processor;
        let seek_time = if state.reverse() {
            planned.interval.end
        } else {
            planned.interval.begin
        };
        let mode = state.mode;
        let start_pos = state.frame_position;
        state.session_in = state.session_in.wrapping_add(1);
        let session_in = state.session_in;

        for attempt in 0..2 {
            // Connect (or reuse the reader connection) and seek, with the
            // lock released across the storage round trips.
            if state.procs[index].connection.is_none() {
                let storage = self.processors[index].storage.clone();
                let sink = self.processors[index].sink.clone();
                let (guard, opened) = self.unlocked(state, || {
                    let endpoint = storage.get_source_reader_endpoint(
                        seek_time,
                        start_pos,
                        false,
                        mode,
                        StoragePriority::High,
                    )?;
                    let connection = create_pull_connection_by_endpoint(
                        endpoint.clone(),
                        sink,
                        Transport::Auto,
                        None,
                        FrameBufferingPolicy::Unbuffered,
                    );
                    Ok::<_, RpcError>((endpoint, connection))
                });
                state = guard;

                match opened {
                    Ok((endpoint, connection)) => {
                        let proc = &mut state.procs[index];
                        proc.endpoint = Some(endpoint);
                        proc.connection = Some(connection);
                    }
                    Err(RpcError::Busy) => return (state, Err(RpcError::Busy)),
                    Err(err) => {
                        log::warn!("failed to open storage reader: {err}");
                        return (state, Ok(()));
                    }
                }
            }

            let Some(endpoint) = state.procs[index].endpoint.clone() else {
                return (state, Ok(()));
            };

            let (guard, sought) = self.unlocked(state, || {
                endpoint.seek(seek_time, start_pos, mode, session_in)
            });
            state = guard;

            match sought {
                Ok(()) => {
                    {
                        let proc = &mut state.procs[index];
                        proc.saved_session_out = session;
                        proc.just_started = true;
                    }
                    state.frame_position = StartPosition::Exactly;
                    state = self.do_request(state, index, 0);
                    return (state, Ok(()));
                }
                Err(RpcError::Busy) => return (state, Err(RpcError::Busy)),
                Err(RpcError::NotFound) if attempt == 0 => {
                    // The reader endpoint is stale; rebuild it once.
                    let connection = {
                        let proc = &mut state.procs[index];
                        proc.endpoint = None;
                        proc.connection.take()
                    };
                    if let Some(connection) = connection {
                        let (guard, ()) = self.unlocked(state, || connection.destroy());
                        state = guard;
                    }
                }
                Err(err) => {
                    log::warn!("seek failed: {err}");
                    return (state, Ok(()));
                }
            }
        }

        (state, Ok(()))
    }

    fn do_request<'a>(self: &'a Arc<Self>, mut state: Guard<'a>, index: usize, count: u32) -> Guard<'a> {
        let session_out = state.session_out;
        let (saved, has_upstream, just_started) = {
            let proc = &state.procs[index];
            (
                proc.saved_session_out,
                proc.upstream.is_some(),
                proc.just_started,
            )
        };
        if session_out != saved || !has_upstream {
            return state;
        }

        let mut count = count;
        if just_started {
            count = state.requested;
            state.procs[index].just_started = false;
        }
        if count == 0 {
            return state;
        }

        let upstream = state.procs[index].upstream.clone().expect("checked above");
        let (state, ()) = self.unlocked(state, || upstream.request(count));
        state
    }

    fn receive_from_processor(self: &Arc<Self>, index: usize, sample: Sample) {
        let mut state = self.state.lock().unwrap();

        if sample.session_id() != Some(state.session_in) {
            return;
        }
        if state.procs[index].end_reached {
            return;
        }

        let Some(interval) = state.procs[index].interval else {
            return;
        };

        let timestamp = sample.timestamp();
        let reverse = state.reverse();
        let boundary_passed = sample.is_end_of_stream()
            || if reverse {
                interval.begin > timestamp
            } else {
                interval.end < timestamp
            };

        if boundary_passed {
            state.procs[index].end_reached = true;
            let session = state.session_out;
            drop(state);
            self.post(session, Action::TryNextInterval, None);
            return;
        }

        drop(self.forward_downstream(state, sample));
    }

    fn forward_downstream<'a>(&'a self, mut state: Guard<'a>, mut sample: Sample) -> Guard<'a> {
        let Some(downstream) = state.downstream.clone() else {
            return state;
        };
        if state.requested == 0 {
            return state;
        }

        sample.set_session_id(state.session_out);
        if state.discontinuity {
            sample.set_flag(SampleFlags::DISCONTINUITY);
            state.discontinuity = false;
        }
        state.requested -= 1;

        self.measurer.update(&sample);

        drop(state);
        downstream.receive(sample);
        self.state.lock().unwrap()
    }

    fn seek_locked(self: &Arc<Self>, state: &mut PlannerState) {
        state.session_in = state.session_in.wrapping_add(1);
        Self::clear_plan(state);
        self.post(state.session_out, Action::StartPlaying, None);
    }
}

impl PullSource for PlannedSequenceSource {
    fn on_connected(&self, sink: &SinkRef) {
        let mut state = self.inner.state.lock().unwrap();
        state.downstream = Some(sink.clone());
        self.inner.seek_locked(&mut state);
    }

    fn on_disconnected(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.downstream = None;
        state.session_out = state.session_out.wrapping_add(1);
        state.session_in = state.session_in.wrapping_add(1);
    }

    fn request(&self, count: u32) {
        let mut state = self.inner.state.lock().unwrap();
        state.requested += count;

        let target = state.active.and_then(|a| state.planned.get(a).copied());
        if let Some(planned) = target {
            drop(self.inner.do_request(state, planned.processor, count));
        }
    }
}

impl QosAwareSource for PlannedSequenceSource {
    fn modify_qos(&self, _qos: &Qos) {}
}

impl SeekableSource for PlannedSequenceSource {
    fn seek(&self, time: MediaTime, start: StartPosition, mode: PlayMode, session_id: u32) {
        log::info!("seek sequence planner to {time} | {start:?} | {mode:?} | {session_id}");

        let mut state = self.inner.state.lock().unwrap();
        state.requested = 0;
        state.session_out = session_id;
        state.time_position = time;
        state.frame_position = start;
        state.mode = mode;

        if state.downstream.is_some() {
            self.inner.seek_locked(&mut state);
        }
    }
}
