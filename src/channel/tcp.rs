//! The plain TCP transport.

use std::net::TcpStream;

use super::stream::{StreamInputChannel, StreamOutputChannel};
use super::{FrameBufferingPolicy, OnNetworkDisconnect};
use crate::broker::{SinkRef, SourceRef};

/// Builds the sink-side input channel over a connected, greeted socket.
pub fn create_pull_tcp_input_channel(
    stream: TcpStream,
    policy: FrameBufferingPolicy,
    on_disconnect: OnNetworkDisconnect,
) -> std::io::Result<SourceRef> {
    StreamInputChannel::spawn(stream, None, policy, on_disconnect)
}

/// Builds the source-side output channel over an accepted, cookie-matched
/// socket.
pub fn create_pull_tcp_output_channel(
    stream: TcpStream,
    on_disconnect: OnNetworkDisconnect,
) -> std::io::Result<SinkRef> {
    StreamOutputChannel::spawn(stream, None, on_disconnect)
}
