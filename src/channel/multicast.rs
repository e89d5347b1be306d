//! The multicast transport: one shared data socket per source sending to
//! a generated group address, and a per-sink unicast control path for
//! cookie probes and credits. Credits from every subscribed sink are
//! aggregated; samples hit the wire once.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};

use super::udp::{spawn_datagram_input, spawn_datagram_output, DataTarget};
use super::{FrameBufferingPolicy, OnNetworkDisconnect};
use crate::broker::{SinkRef, SourceRef};

/// Builds the sink-side input channel: joins the group on the data port
/// and opens a unicast control path to the source.
pub fn create_multicast_input_channel(
    control: UdpSocket,
    group: Ipv4Addr,
    data_port: u16,
    cookie: &str,
    policy: FrameBufferingPolicy,
    on_disconnect: OnNetworkDisconnect,
) -> std::io::Result<SourceRef> {
    let data = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, data_port))?;
    data.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;

    spawn_datagram_input(control, data, cookie, false, policy, on_disconnect)
}

/// Builds the source-side output channel shared by every multicast sink of
/// one source. The control socket aggregates credits from all of them.
pub fn create_multicast_output_channel(
    control: UdpSocket,
    group: Ipv4Addr,
    data_port: u16,
    cookie: &str,
    on_disconnect: OnNetworkDisconnect,
) -> std::io::Result<SinkRef> {
    let data = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?;
    data.set_multicast_ttl_v4(1)?;

    let target = DataTarget::Group(SocketAddr::V4(SocketAddrV4::new(group, data_port)));
    spawn_datagram_output(control, data, target, false, cookie, on_disconnect)
}

/// Generates the multicast group and data port for a source: a random
/// 235.x.y.z address and a port in the ephemeral range, both derived from
/// UUID bytes. Collisions with an in-use group simply produce a new group
/// for the next source.
pub fn generate_multicast_address() -> (Ipv4Addr, u16) {
    // Most default Linux configurations use this ephemeral range.
    const EPHEMERAL_PORT_RANGE_BEGIN: u16 = 32768;
    const EPHEMERAL_PORT_RANGE_END: u16 = 60999;
    const EPHEMERAL_PORT_RANGE_SIZE: u16 = EPHEMERAL_PORT_RANGE_END - EPHEMERAL_PORT_RANGE_BEGIN + 1;
    const MULTICAST_BYTE: u8 = 235;

    let rand = *uuid::Uuid::new_v4().as_bytes();
    let group = Ipv4Addr::new(MULTICAST_BYTE, rand[1], rand[2], rand[3]);

    let port = u16::from_be_bytes([rand[4], rand[5]]);
    let port = EPHEMERAL_PORT_RANGE_BEGIN + port % EPHEMERAL_PORT_RANGE_SIZE;

    (group, port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_addresses_are_in_range() {
        for _ in 0..64 {
            let (group, port) = generate_multicast_address();
            assert_eq!(group.octets()[0], 235);
            assert!((32768..=60999).contains(&port));
        }
    }

    #[test]
    fn generated_addresses_vary() {
        let a = generate_multicast_address();
        let b = generate_multicast_address();
        // Two UUID draws colliding on all six bytes is not a thing.
        assert_ne!(a, b);
    }
}
