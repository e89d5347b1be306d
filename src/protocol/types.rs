//! Shared data types of the transport plane.

use bitflags::bitflags;
use enum_primitive_derive::Primitive;

/// Media timestamps are nanoseconds on the capture clock. Samples are
/// ordered by timestamp within a session; a new session begins after a
/// sample carrying [SampleFlags::DISCONTINUITY].
pub type MediaTime = u64;

/// Builds a fourcc-style numeric id out of four ASCII bytes.
pub const fn fourcc(tag: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*tag)
}

/// Major media type codes, the codec-family half of a sample's type.
pub mod media_type {
    use super::fourcc;

    /// Coded video samples.
    pub const VIDEO: u32 = fourcc(b"VIDE");
    /// Coded audio samples.
    pub const AUDIO: u32 = fourcc(b"AUDI");
    /// Auxiliary control samples (end-of-stream markers and the like).
    pub const AUXILIARY: u32 = fourcc(b"AUXI");

    /// Subtype marking an end-of-stream sample within [AUXILIARY].
    pub const SUBTYPE_END_OF_STREAM: u32 = fourcc(b"EOST");
}

bitflags! {
    /// Per-sample flag bits carried in the sample header.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
    pub struct SampleFlags: u32 {
        /// The sample can be decoded without reference to earlier samples.
        const KEY_SAMPLE = 0x01;
        /// Output preceding the first visible frame after a seek; sinks
        /// typically discard these.
        const PREROLL = 0x02;
        /// First sample after any break in the stream.
        const DISCONTINUITY = 0x04;
        /// Out-of-band decoder initialization data.
        const INIT_DATA = 0x08;
        /// No more samples follow until a discontinuity.
        const END_OF_STREAM = 0x10;
    }
}

/// The in-memory header of a media sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SampleHeader {
    /// Capture timestamp.
    pub timestamp: MediaTime,
    /// Flag bits.
    pub flags: SampleFlags,
    /// Codec family (fourcc, see [media_type]).
    pub major: u32,
    /// Codec subtype within the family.
    pub subtype: u32,
    /// Length of the sample body in bytes.
    pub body_size: u32,
}

impl SampleHeader {
    /// Whether the sample is independently decodable.
    pub fn is_key_sample(&self) -> bool {
        self.flags.contains(SampleFlags::KEY_SAMPLE)
    }

    /// Whether this is an end-of-stream marker.
    pub fn is_end_of_stream(&self) -> bool {
        self.flags.contains(SampleFlags::END_OF_STREAM)
            || (self.major == media_type::AUXILIARY
                && self.subtype == media_type::SUBTYPE_END_OF_STREAM)
    }
}

/// An extension header attached to a sample, keyed by a fourcc-like id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionHeader {
    /// The extension id (see [ext_header]).
    pub id: u32,
    /// Raw extension payload.
    pub data: Vec<u8>,
}

/// Well-known extension header ids.
pub mod ext_header {
    use super::fourcc;

    /// Carries the 32-bit playback session id attached by sequenced
    /// playback (big-endian on the wire).
    pub const SESSION_ID: u32 = fourcc(b"SESS");

    /// Carries the coded width and height of a video sample as two
    /// big-endian u32 values.
    pub const VIDEO_GEOMETRY: u32 = fourcc(b"GEOM");
}

/// Network transports a connection can be carried over, in the order they
/// appear on the wire.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Primitive)]
pub enum Transport {
    /// A raw source reference, valid only in the same process.
    InProc = 0,
    /// Shared memory for sample bodies plus a TCP control channel.
    Local = 1,
    /// Plain TCP across one of several advertised addresses.
    Tcp = 2,
    /// UDP control + data socket pair.
    Udp = 3,
    /// Shared multicast data channel with per-sink unicast control.
    Multicast = 4,
    /// The RPC layer itself carries the media.
    RpcTunnel = 5,
    /// Let the sink endpoint pick a sensible preference list.
    Auto = 6,
}

/// Shared-memory flavors an allocator can offer.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Primitive, Default)]
pub enum SharedMemoryKind {
    /// Buffers live in private memory.
    #[default]
    None = 0,
    /// POSIX shared memory objects.
    Posix = 1,
    /// Win32 file mappings.
    Win32 = 2,
}

/// Identifies an allocator so a peer on the same host may attach the same
/// buffer pool. The all-zero id means "no shared allocator".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AllocatorId(pub [u8; 16]);

impl AllocatorId {
    /// The "no shared allocator" id.
    pub const NONE: AllocatorId = AllocatorId([0; 16]);

    /// Generates a fresh unique id.
    pub fn generate() -> Self {
        AllocatorId(*uuid::Uuid::new_v4().as_bytes())
    }

    /// Whether this is the "no shared allocator" id.
    pub fn is_none(&self) -> bool {
        *self == Self::NONE
    }
}

/// Allocator parameters advertised alongside a shared-memory transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocatorParams {
    /// Id of the allocator backing sample bodies.
    pub id: AllocatorId,
    /// Number of pooled buffers.
    pub buffer_count: u32,
    /// Size of each pooled buffer in bytes.
    pub buffer_size: u32,
    /// Required body alignment.
    pub alignment: u32,
}

/// Per-stream telemetry reported by an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EndpointStatistics {
    /// Last observed coded width.
    pub width: u32,
    /// Last observed coded height.
    pub height: u32,
    /// Average frames per second over the current window.
    pub fps: f32,
    /// Average bitrate in bits per second over the current window.
    pub bitrate: u64,
    /// Last observed major media type.
    pub media_type: u32,
    /// Last observed subtype.
    pub stream_type: u32,
}

/// Where playback starts relative to the requested timestamp.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Primitive)]
pub enum StartPosition {
    /// At the key sample preceding the timestamp.
    AtKeyFrame = 0,
    /// Exactly at the timestamp.
    Exactly = 1,
    /// One frame before the timestamp.
    OneFrameBack = 2,
    /// At the key sample nearest to the timestamp.
    NearestKeyFrame = 3,
    /// At the preceding key sample, or at end-of-stream if past the end.
    AtKeyFrameOrAtEos = 4,
    /// Exactly at the timestamp, failing if no sample matches.
    Strict = 5,
}

bitflags! {
    /// Playback mode flags for seekable sources.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
    pub struct PlayMode: u32 {
        /// Play the timeline backwards.
        const REVERSE = 0x1;
    }
}

/// A `[begin, end)` timestamp range of recorded media held by a storage
/// source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    /// Inclusive start of the range.
    pub begin: MediaTime,
    /// Exclusive end of the range.
    pub end: MediaTime,
}

impl Interval {
    /// A new half-open interval. `begin > end` is normalized to empty.
    pub fn new(begin: MediaTime, end: MediaTime) -> Self {
        Interval {
            begin,
            end: end.max(begin),
        }
    }

    /// Whether the interval contains no time at all.
    pub fn is_empty(&self) -> bool {
        self.begin >= self.end
    }

    /// The intersection of two intervals, empty if they do not overlap.
    pub fn intersection(&self, other: &Interval) -> Interval {
        Interval::new(self.begin.max(other.begin), self.end.min(other.end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn interval_intersection() {
        let a = Interval::new(10, 20);
        let b = Interval::new(18, 30);

        assert_eq!(a.intersection(&b), Interval::new(18, 20));
        assert!(a.intersection(&Interval::new(25, 30)).is_empty());
    }

    #[test]
    fn allocator_ids_are_unique() {
        assert_ne!(AllocatorId::generate(), AllocatorId::generate());
        assert!(AllocatorId::NONE.is_none());
        assert!(!AllocatorId::generate().is_none());
    }

    #[test]
    fn end_of_stream_detection() {
        let header = SampleHeader {
            major: media_type::AUXILIARY,
            subtype: media_type::SUBTYPE_END_OF_STREAM,
            ..Default::default()
        };
        assert!(header.is_end_of_stream());

        let header = SampleHeader {
            flags: SampleFlags::END_OF_STREAM,
            major: media_type::VIDEO,
            ..Default::default()
        };
        assert!(header.is_end_of_stream());
    }
}
