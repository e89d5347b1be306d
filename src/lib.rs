//! A pure Rust media transport plane for multi-process video streaming.
//!
//! A data sink in one process attaches to a named media source in another
//! (or the same) process and receives a continuous, credit-driven sequence
//! of media samples over the most efficient transport the two peers agree
//! on, recovering from network failures, shared-memory faults and upstream
//! restarts.

#![warn(
    anonymous_parameters,
    nonstandard_style,
    rust_2018_idioms,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_qualifications
)]

use std::net::Ipv4Addr;
use std::ops::Range;

pub mod adaptive;
pub mod broker;
pub mod channel;
pub mod endpoint;
pub mod net;
pub mod planner;
pub mod protocol;
pub mod sample;
pub mod stats;

/// Default base of the data port range, used when `MEDIABUS_PORT_BASE` is
/// not set.
pub const DEFAULT_PORT_BASE: u16 = 20110;

/// Default size of the data port range, used when `MEDIABUS_PORT_SPAN` is
/// not set.
pub const DEFAULT_PORT_SPAN: u16 = 50;

/// Determines the port range scanned by the connection acceptor, checking
/// `$MEDIABUS_PORT_BASE` and `$MEDIABUS_PORT_SPAN` and falling back to the
/// compiled-in defaults.
pub fn port_range_from_env() -> Range<u16> {
    let base = std::env::var("MEDIABUS_PORT_BASE")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_PORT_BASE);
    let span = std::env::var("MEDIABUS_PORT_SPAN")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(DEFAULT_PORT_SPAN);

    base..base.saturating_add(span)
}

/// An entry of the administrator's interface whitelist: either a CIDR block
/// matched against interface addresses, or a literal interface name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WhitelistEntry {
    /// Matches any interface with an address inside the network.
    Net(ipnet::Ipv4Net),
    /// Matches an interface by its OS name.
    Name(String),
}

impl WhitelistEntry {
    /// Whether an interface with the given name and address passes this
    /// entry.
    pub fn matches(&self, name: &str, addr: Ipv4Addr) -> bool {
        match self {
            WhitelistEntry::Net(net) => net.contains(&addr),
            WhitelistEntry::Name(n) => n == name,
        }
    }
}

/// Reads the interface whitelist from `$MEDIABUS_IFACE_WHITELIST`, a
/// comma-separated list of CIDR blocks or interface names. An empty or
/// unset variable means every interface is admitted.
pub fn iface_whitelist_from_env() -> Vec<WhitelistEntry> {
    let Ok(raw) = std::env::var("MEDIABUS_IFACE_WHITELIST") else {
        return Vec::new();
    };

    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| match s.parse::<ipnet::Ipv4Net>() {
            Ok(net) => WhitelistEntry::Net(net),
            Err(_) => WhitelistEntry::Name(s.to_owned()),
        })
        .collect()
}

/// Reads additional administrator-configured addresses to advertise from
/// `$MEDIABUS_ALT_ADDRESSES` (comma-separated).
pub fn alt_addresses_from_env() -> Vec<String> {
    std::env::var("MEDIABUS_ALT_ADDRESSES")
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

/// Whether hardware decoding was administratively disabled via
/// `$MEDIABUS_DISABLE_HW_DECODE`.
pub fn hw_decode_disabled_from_env() -> bool {
    env_flag("MEDIABUS_DISABLE_HW_DECODE")
}

/// Whether decoding a single stream across GPUs of mixed device types was
/// administratively allowed via `$MEDIABUS_ALLOW_MIXED_GPU`.
pub fn mixed_gpu_allowed_from_env() -> bool {
    env_flag("MEDIABUS_ALLOW_MIXED_GPU")
}

/// The identity of this host as seen by connection negotiation. Peers with
/// equal host ids are assumed to share memory. Reads `$MEDIABUS_HOST_ID`
/// and falls back to the OS hostname.
pub fn local_host_id() -> String {
    if let Ok(id) = std::env::var("MEDIABUS_HOST_ID") {
        if !id.is_empty() {
            return id;
        }
    }

    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_owned())
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "localhost".to_owned())
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| {
            let v = v.trim();
            !v.is_empty() && v != "0" && !v.eq_ignore_ascii_case("false")
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn whitelist_matching() {
        let entries = vec![
            WhitelistEntry::Net("10.0.0.0/8".parse().unwrap()),
            WhitelistEntry::Name("eth1".to_owned()),
        ];

        assert!(entries[0].matches("eth0", Ipv4Addr::new(10, 1, 2, 3)));
        assert!(!entries[0].matches("eth0", Ipv4Addr::new(192, 168, 0, 1)));
        assert!(entries[1].matches("eth1", Ipv4Addr::new(192, 168, 0, 1)));
        assert!(!entries[1].matches("eth2", Ipv4Addr::new(192, 168, 0, 1)));
    }

    #[test]
    fn host_id_is_never_empty() {
        assert_eq!(local_host_id().is_empty(), false);
    }
}
