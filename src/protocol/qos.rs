//! The Quality-of-Service model.
//!
//! A QoS value is an ordered sequence of tagged requests attached to a
//! connection at creation time. The sink may replace it at any moment; the
//! source applies the sequence in order. At most one request of each tag is
//! kept.

use super::MediaTime;

/// A single QoS request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QosRequest {
    /// Deliver only independently decodable samples.
    OnlyKeyFrames {
        /// Enables or disables the filter.
        enabled: bool,
    },
    /// Thin the stream down to the given frame rate.
    FrameRate {
        /// Target frames per second.
        fps: f32,
    },
    /// The viewport the sink renders into; drives adaptive stream
    /// selection.
    FrameGeometry {
        /// Viewport width in pixels.
        width: u32,
        /// Viewport height in pixels.
        height: u32,
    },
    /// Source-side buffering of the stream head.
    Buffer {
        /// How much media to buffer, in milliseconds.
        duration_ms: u32,
        /// Where in the buffer delivery starts, relative to its head.
        start_offset_ms: i32,
    },
    /// Start delivery at the given timestamp.
    StartFrom {
        /// First timestamp to deliver.
        timestamp: MediaTime,
    },
    /// Pins decoding to particular hardware.
    DecoderRequirements {
        /// Acceptable device type bits.
        device_type_mask: u32,
        /// Acceptable device id bits.
        device_id_mask: u32,
        /// Acceptable output memory type bits.
        memory_type_mask: u32,
        /// Process the decoder must live in, 0 for any.
        target_process_id: u32,
    },
    /// How much history a playback sink intends to request.
    PlaybackDepth {
        /// Depth in seconds.
        seconds: u32,
    },
}

/// Discriminates [QosRequest] variants for lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QosTag {
    /// [QosRequest::OnlyKeyFrames]
    OnlyKeyFrames,
    /// [QosRequest::FrameRate]
    FrameRate,
    /// [QosRequest::FrameGeometry]
    FrameGeometry,
    /// [QosRequest::Buffer]
    Buffer,
    /// [QosRequest::StartFrom]
    StartFrom,
    /// [QosRequest::DecoderRequirements]
    DecoderRequirements,
    /// [QosRequest::PlaybackDepth]
    PlaybackDepth,
}

impl QosRequest {
    /// The tag of this request.
    pub fn tag(&self) -> QosTag {
        match self {
            QosRequest::OnlyKeyFrames { .. } => QosTag::OnlyKeyFrames,
            QosRequest::FrameRate { .. } => QosTag::FrameRate,
            QosRequest::FrameGeometry { .. } => QosTag::FrameGeometry,
            QosRequest::Buffer { .. } => QosTag::Buffer,
            QosRequest::StartFrom { .. } => QosTag::StartFrom,
            QosRequest::DecoderRequirements { .. } => QosTag::DecoderRequirements,
            QosRequest::PlaybackDepth { .. } => QosTag::PlaybackDepth,
        }
    }
}

/// An ordered sequence of QoS requests.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Qos {
    requests: Vec<QosRequest>,
}

impl Qos {
    /// An empty QoS sequence.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a sequence from requests, keeping the given order.
    pub fn from_requests(requests: impl IntoIterator<Item = QosRequest>) -> Self {
        let mut qos = Self::new();
        for r in requests {
            qos.set(r);
        }
        qos
    }

    /// Whether the sequence holds no requests.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// The requests in order.
    pub fn requests(&self) -> &[QosRequest] {
        &self.requests
    }

    /// Finds the request with the given tag.
    pub fn get(&self, tag: QosTag) -> Option<&QosRequest> {
        self.requests.iter().find(|r| r.tag() == tag)
    }

    /// Replaces the request with the same tag, or appends.
    pub fn set(&mut self, request: QosRequest) {
        if let Some(slot) = self.requests.iter_mut().find(|r| r.tag() == request.tag()) {
            *slot = request;
        } else {
            self.requests.push(request);
        }
    }

    /// Removes the request with the given tag, keeping the order of the
    /// rest.
    pub fn remove(&mut self, tag: QosTag) {
        self.requests.retain(|r| r.tag() != tag);
    }

    /// The requested viewport, if any.
    pub fn frame_geometry(&self) -> Option<(u32, u32)> {
        match self.get(QosTag::FrameGeometry) {
            Some(&QosRequest::FrameGeometry { width, height }) => Some((width, height)),
            _ => None,
        }
    }

    /// The requested start timestamp, if any.
    pub fn start_from(&self) -> Option<MediaTime> {
        match self.get(QosTag::StartFrom) {
            Some(&QosRequest::StartFrom { timestamp }) => Some(timestamp),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn set_replaces_by_tag() {
        let mut qos = Qos::from_requests([
            QosRequest::OnlyKeyFrames { enabled: true },
            QosRequest::FrameGeometry {
                width: 640,
                height: 360,
            },
        ]);

        qos.set(QosRequest::FrameGeometry {
            width: 1920,
            height: 1080,
        });

        assert_eq!(qos.requests().len(), 2);
        assert_eq!(qos.frame_geometry(), Some((1920, 1080)));
    }

    #[test]
    fn remove_keeps_order() {
        let mut qos = Qos::from_requests([
            QosRequest::OnlyKeyFrames { enabled: true },
            QosRequest::FrameRate { fps: 12.5 },
            QosRequest::PlaybackDepth { seconds: 30 },
        ]);

        qos.remove(QosTag::FrameRate);

        assert_eq!(
            qos.requests(),
            &[
                QosRequest::OnlyKeyFrames { enabled: true },
                QosRequest::PlaybackDepth { seconds: 30 },
            ]
        );
    }

    #[test]
    fn equality_is_order_sensitive() {
        let a = Qos::from_requests([
            QosRequest::OnlyKeyFrames { enabled: true },
            QosRequest::FrameRate { fps: 5.0 },
        ]);
        let b = Qos::from_requests([
            QosRequest::FrameRate { fps: 5.0 },
            QosRequest::OnlyKeyFrames { enabled: true },
        ]);

        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }
}
