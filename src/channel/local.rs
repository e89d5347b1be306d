//! The same-host transport: a TCP control channel whose sample messages
//! embed allocator-id metadata, so the peer can map bodies from the shared
//! pool by reference rather than copy them.

use std::net::TcpStream;

use super::stream::{StreamInputChannel, StreamOutputChannel};
use super::{FrameBufferingPolicy, OnNetworkDisconnect};
use crate::broker::{SinkRef, SourceRef};
use crate::protocol::AllocatorParams;
use crate::sample::Allocator;

/// Builds the sink-side input channel, attaching the advertised shared
/// allocator when it resolves. Without a mapping, bodies are copied.
pub fn create_local_input_channel(
    stream: TcpStream,
    allocator: &AllocatorParams,
    policy: FrameBufferingPolicy,
    on_disconnect: OnNetworkDisconnect,
) -> std::io::Result<SourceRef> {
    let attached = if allocator.id.is_none() {
        None
    } else {
        let attached = Allocator::attach(&allocator.id);
        if attached.is_none() {
            log::debug!("shared allocator not mapped here, sample bodies will be copied");
        }
        attached
    };

    StreamInputChannel::spawn(stream, attached, policy, on_disconnect)
}

/// Builds the source-side output channel over an accepted, cookie-matched
/// socket. Samples go out with the allocator id of the factory's pool.
pub fn create_local_output_channel(
    stream: TcpStream,
    allocator: Option<Allocator>,
    on_disconnect: OnNetworkDisconnect,
) -> std::io::Result<SinkRef> {
    StreamOutputChannel::spawn(stream, allocator, on_disconnect)
}
