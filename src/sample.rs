//! Media samples and the pooled allocators that back their bodies.
//!
//! A [Sample] is a cheaply clonable value: the header and extension headers
//! are owned per clone, the body is a reference-counted buffer. Buffers
//! allocated from an [Allocator] return to its pool when the last reference
//! drops.
//!
//! Allocators with a shared-memory flavor publish their [AllocatorId] in a
//! process-global registry, standing in for the OS-level page mapping: a
//! local peer attaches the same pool by id and resolves bodies by reference
//! instead of copying them.

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use crate::protocol::{
    ext_header, media_type, wire, AllocatorId, AllocatorParams, ExtensionHeader, MediaTime,
    ProtocolError, SampleFlags, SampleHeader, SharedMemoryKind,
};

/// A reference-counted sample body.
#[derive(Clone)]
pub struct Body(Arc<BodyBuf>);

struct BodyBuf {
    data: Option<Vec<u8>>,
    len: usize,
    slot: u64,
    pool: Option<Arc<AllocatorInner>>,
}

impl Body {
    fn from_vec(data: Vec<u8>) -> Self {
        let len = data.len();
        Body(Arc::new(BodyBuf {
            data: Some(data),
            len,
            slot: 0,
            pool: None,
        }))
    }

    /// The valid bytes of the body.
    pub fn bytes(&self) -> &[u8] {
        &self.0.data.as_ref().expect("present until drop")[..self.0.len]
    }

    /// Length of the body in bytes.
    pub fn len(&self) -> usize {
        self.0.len
    }

    /// Whether the body is empty.
    pub fn is_empty(&self) -> bool {
        self.0.len == 0
    }
}

impl std::fmt::Debug for Body {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Body").field("len", &self.0.len).finish()
    }
}

impl Drop for BodyBuf {
    fn drop(&mut self) {
        if let (Some(pool), Some(data)) = (self.pool.take(), self.data.take()) {
            pool.recycle(self.slot, data);
        }
    }
}

/// An opaque, cheaply clonable media sample.
#[derive(Debug, Clone)]
pub struct Sample {
    header: SampleHeader,
    extensions: Vec<ExtensionHeader>,
    body: Body,
}

impl Sample {
    /// Builds a sample over a private (unpooled) body.
    pub fn with_body(mut header: SampleHeader, body: Vec<u8>) -> Self {
        header.body_size = body.len() as u32;
        Sample {
            header,
            extensions: Vec::new(),
            body: Body::from_vec(body),
        }
    }

    /// Builds the end-of-stream marker emitted when a stream runs dry.
    pub fn end_of_stream(timestamp: MediaTime) -> Self {
        Sample::with_body(
            SampleHeader {
                timestamp,
                flags: SampleFlags::END_OF_STREAM,
                major: media_type::AUXILIARY,
                subtype: media_type::SUBTYPE_END_OF_STREAM,
                body_size: 0,
            },
            Vec::new(),
        )
    }

    /// The sample header.
    pub fn header(&self) -> &SampleHeader {
        &self.header
    }

    /// Mutable access to the header, for producers and stream stitching.
    pub fn header_mut(&mut self) -> &mut SampleHeader {
        &mut self.header
    }

    /// The capture timestamp.
    pub fn timestamp(&self) -> MediaTime {
        self.header.timestamp
    }

    /// The flag bits.
    pub fn flags(&self) -> SampleFlags {
        self.header.flags
    }

    /// Sets a flag bit.
    pub fn set_flag(&mut self, flag: SampleFlags) {
        self.header.flags |= flag;
    }

    /// Whether this sample ends the stream.
    pub fn is_end_of_stream(&self) -> bool {
        self.header.is_end_of_stream()
    }

    /// The body bytes.
    pub fn body(&self) -> &[u8] {
        self.body.bytes()
    }

    /// The extension headers in order.
    pub fn extensions(&self) -> &[ExtensionHeader] {
        &self.extensions
    }

    /// The playback session id, if one is attached.
    pub fn session_id(&self) -> Option<u32> {
        self.extensions
            .iter()
            .find(|e| e.id == ext_header::SESSION_ID)
            .and_then(|e| <[u8; 4]>::try_from(e.data.as_slice()).ok())
            .map(u32::from_be_bytes)
    }

    /// Attaches or replaces the playback session id.
    pub fn set_session_id(&mut self, session_id: u32) {
        self.set_extension(ext_header::SESSION_ID, session_id.to_be_bytes().to_vec());
    }

    /// The coded video geometry, if the producer attached it.
    pub fn video_geometry(&self) -> Option<(u32, u32)> {
        self.extensions
            .iter()
            .find(|e| e.id == ext_header::VIDEO_GEOMETRY)
            .and_then(|e| <[u8; 8]>::try_from(e.data.as_slice()).ok())
            .map(|bytes| {
                (
                    u32::from_be_bytes(bytes[..4].try_into().expect("length checked")),
                    u32::from_be_bytes(bytes[4..].try_into().expect("length checked")),
                )
            })
    }

    /// Attaches or replaces the coded video geometry.
    pub fn set_video_geometry(&mut self, width: u32, height: u32) {
        let mut data = width.to_be_bytes().to_vec();
        data.extend_from_slice(&height.to_be_bytes());
        self.set_extension(ext_header::VIDEO_GEOMETRY, data);
    }

    fn set_extension(&mut self, id: u32, data: Vec<u8>) {
        if let Some(ext) = self.extensions.iter_mut().find(|e| e.id == id) {
            ext.data = data;
        } else {
            self.extensions.push(ExtensionHeader { id, data });
        }
    }

    /// Encodes the sample as the payload of a `Sample` message.
    pub fn encode_payload(&self) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = Vec::with_capacity(wire::SAMPLE_HEADER_SIZE + self.body.len());
        let mut header = self.header;
        header.body_size = self.body.len() as u32;

        wire::write_sample_header(&mut buf, &header, &self.extensions)?;
        buf.write_all(self.body.bytes())?;

        Ok(buf)
    }

    /// Decodes a sample from the payload of a `Sample` message. When an
    /// allocator is given, the body is copied into one of its pooled
    /// buffers.
    pub fn decode_payload(
        payload: &[u8],
        allocator: Option<&Allocator>,
    ) -> Result<Self, ProtocolError> {
        let mut cursor = payload;
        let (header, extensions) = wire::read_sample_header(&mut cursor)?;

        if cursor.len() != header.body_size as usize {
            return Err(ProtocolError::Invalid(format!(
                "sample body size mismatch: header says {}, got {}",
                header.body_size,
                cursor.len()
            )));
        }

        let body = match allocator {
            Some(alloc) => alloc.alloc_body(cursor),
            None => Body::from_vec(cursor.to_vec()),
        };

        Ok(Sample {
            header,
            extensions,
            body,
        })
    }

    /// Encodes the sample as the payload of a `SharedSample` message,
    /// embedding the allocator id and buffer slot so a local peer may map
    /// the body by reference.
    pub fn encode_shared_payload(&self) -> Result<Vec<u8>, ProtocolError> {
        let (id, slot) = match &self.body.0.pool {
            Some(pool) => (pool.id, self.body.0.slot),
            None => (AllocatorId::NONE, 0),
        };

        let mut buf = Vec::with_capacity(24 + wire::SAMPLE_HEADER_SIZE + self.body.len());
        buf.write_all(&id.0)?;
        buf.write_all(&slot.to_be_bytes())?;
        buf.extend_from_slice(&self.encode_payload()?);

        Ok(buf)
    }

    /// Decodes a `SharedSample` payload, resolving the body by reference
    /// through the allocator registry when possible and falling back to a
    /// copy.
    pub fn decode_shared_payload(payload: &[u8]) -> Result<Self, ProtocolError> {
        if payload.len() < 24 {
            return Err(ProtocolError::Invalid(format!(
                "short shared sample payload: {} bytes",
                payload.len()
            )));
        }

        let id = AllocatorId(payload[..16].try_into().expect("length checked"));
        let slot = u64::from_be_bytes(payload[16..24].try_into().expect("length checked"));
        let mut sample = Sample::decode_payload(&payload[24..], None)?;

        if !id.is_none() {
            if let Some(alloc) = Allocator::attach(&id) {
                if let Some(body) = alloc.resolve(slot, sample.body.len()) {
                    sample.body = body;
                }
            }
        }

        Ok(sample)
    }
}

struct AllocatorInner {
    id: AllocatorId,
    shared: SharedMemoryKind,
    buffer_count: u32,
    buffer_size: usize,
    pool: Mutex<Vec<Vec<u8>>>,
    in_flight: Mutex<HashMap<u64, Weak<BodyBuf>>>,
    next_slot: AtomicU64,
}

impl AllocatorInner {
    fn recycle(&self, slot: u64, data: Vec<u8>) {
        self.in_flight.lock().unwrap().remove(&slot);

        let mut pool = self.pool.lock().unwrap();
        if pool.len() < self.buffer_count as usize {
            pool.push(data);
        }
    }
}

/// A pool of reusable sample buffers.
#[derive(Clone)]
pub struct Allocator {
    inner: Arc<AllocatorInner>,
}

impl std::fmt::Debug for Allocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocator")
            .field("id", &self.inner.id)
            .field("shared", &self.inner.shared)
            .finish()
    }
}

fn registry() -> &'static Mutex<HashMap<AllocatorId, Weak<AllocatorInner>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<AllocatorId, Weak<AllocatorInner>>>> = OnceLock::new();
    REGISTRY.get_or_init(Default::default)
}

impl Allocator {
    /// Creates an allocator. A shared-memory flavor other than `None`
    /// publishes the allocator id so a local peer may attach it.
    pub fn new(shared: SharedMemoryKind, buffer_count: u32, buffer_size: u32) -> Self {
        let inner = Arc::new(AllocatorInner {
            id: AllocatorId::generate(),
            shared,
            buffer_count,
            buffer_size: buffer_size as usize,
            pool: Mutex::new(Vec::new()),
            in_flight: Mutex::new(HashMap::new()),
            next_slot: AtomicU64::new(1),
        });

        if shared != SharedMemoryKind::None {
            let mut reg = registry().lock().unwrap();
            reg.retain(|_, w| w.strong_count() > 0);
            reg.insert(inner.id, Arc::downgrade(&inner));
        }

        Allocator { inner }
    }

    /// Attaches the allocator published under the given id, if it is still
    /// alive in this process's registry.
    pub fn attach(id: &AllocatorId) -> Option<Allocator> {
        registry()
            .lock()
            .unwrap()
            .get(id)
            .and_then(Weak::upgrade)
            .map(|inner| Allocator { inner })
    }

    /// The allocator id.
    pub fn id(&self) -> AllocatorId {
        self.inner.id
    }

    /// The shared-memory flavor of the pool.
    pub fn shared_memory(&self) -> SharedMemoryKind {
        self.inner.shared
    }

    /// The advertised allocator parameters.
    pub fn params(&self) -> AllocatorParams {
        AllocatorParams {
            id: self.inner.id,
            buffer_count: self.inner.buffer_count,
            buffer_size: self.inner.buffer_size as u32,
            alignment: 1,
        }
    }

    /// Allocates a sample over a pooled buffer filled with `body`.
    pub fn alloc_sample(&self, mut header: SampleHeader, body: &[u8]) -> Sample {
        header.body_size = body.len() as u32;
        Sample {
            header,
            extensions: Vec::new(),
            body: self.alloc_body(body),
        }
    }

    fn alloc_body(&self, body: &[u8]) -> Body {
        let mut data = self
            .inner
            .pool
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.inner.buffer_size.max(body.len())));
        data.clear();
        data.extend_from_slice(body);

        let slot = self.inner.next_slot.fetch_add(1, Ordering::Relaxed);
        let buf = Arc::new(BodyBuf {
            len: body.len(),
            data: Some(data),
            slot,
            pool: Some(self.inner.clone()),
        });

        self.inner
            .in_flight
            .lock()
            .unwrap()
            .insert(slot, Arc::downgrade(&buf));

        Body(buf)
    }

    fn resolve(&self, slot: u64, len: usize) -> Option<Body> {
        let buf = self.inner.in_flight.lock().unwrap().get(&slot)?.upgrade()?;
        (buf.len == len).then_some(Body(buf))
    }
}

/// What a source factory needs from the allocation layer, advertised to
/// peers during negotiation.
#[derive(Debug, Clone, Default)]
pub struct AllocatorRequirements {
    /// The allocator backing the factory's samples, if any.
    pub allocator: Option<Allocator>,
    /// Number of pooled buffers a peer should expect.
    pub buffer_count: u32,
    /// Pooled buffer size in bytes.
    pub buffer_size: u32,
    /// Required body alignment.
    pub alignment: u32,
}

impl AllocatorRequirements {
    /// The advertised allocator parameters, or the defaults when the
    /// factory has no shared allocator.
    pub fn params(&self) -> AllocatorParams {
        self.allocator
            .as_ref()
            .map(Allocator::params)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn video_header(timestamp: MediaTime) -> SampleHeader {
        SampleHeader {
            timestamp,
            flags: SampleFlags::KEY_SAMPLE,
            major: media_type::VIDEO,
            subtype: 1,
            body_size: 0,
        }
    }

    #[test]
    fn sample_payload_roundtrip() {
        let mut sample = Sample::with_body(video_header(100), vec![1, 2, 3, 4]);
        sample.set_session_id(7);

        let payload = sample.encode_payload().unwrap();
        let decoded = Sample::decode_payload(&payload, None).unwrap();

        assert_eq!(decoded.header(), sample.header());
        assert_eq!(decoded.body(), &[1, 2, 3, 4]);
        assert_eq!(decoded.session_id(), Some(7));
    }

    #[test]
    fn session_id_is_replaced_not_duplicated() {
        let mut sample = Sample::with_body(video_header(0), Vec::new());
        sample.set_session_id(1);
        sample.set_session_id(2);

        assert_eq!(sample.extensions().len(), 1);
        assert_eq!(sample.session_id(), Some(2));
    }

    #[test]
    fn pooled_buffers_are_recycled() {
        let alloc = Allocator::new(SharedMemoryKind::None, 4, 64);

        let sample = alloc.alloc_sample(video_header(1), &[9; 16]);
        drop(sample);

        assert_eq!(alloc.inner.pool.lock().unwrap().len(), 1);

        let again = alloc.alloc_sample(video_header(2), &[8; 16]);
        assert_eq!(alloc.inner.pool.lock().unwrap().len(), 0);
        assert_eq!(again.body(), &[8; 16]);
    }

    #[test]
    fn shared_sample_resolves_by_reference() {
        let alloc = Allocator::new(SharedMemoryKind::Posix, 4, 64);
        let sample = alloc.alloc_sample(video_header(5), &[3; 32]);

        let payload = sample.encode_shared_payload().unwrap();
        let decoded = Sample::decode_shared_payload(&payload).unwrap();

        assert_eq!(decoded.body(), sample.body());
        assert!(Arc::ptr_eq(&decoded.body.0, &sample.body.0));
    }

    #[test]
    fn shared_sample_falls_back_to_copy() {
        let alloc = Allocator::new(SharedMemoryKind::Posix, 4, 64);
        let sample = alloc.alloc_sample(video_header(5), &[3; 32]);
        let payload = sample.encode_shared_payload().unwrap();

        // Once the original body is gone, the slot cannot be resolved.
        drop(sample);
        let decoded = Sample::decode_shared_payload(&payload).unwrap();
        assert_eq!(decoded.body(), &[3; 32]);
    }

    #[test]
    fn end_of_stream_marker() {
        let eos = Sample::end_of_stream(42);
        assert!(eos.is_end_of_stream());
        assert_eq!(eos.timestamp(), 42);
        assert!(eos.body().is_empty());
    }
}
