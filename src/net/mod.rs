//! Network plumbing shared by the transport plane: interface enumeration,
//! the process-wide connection acceptor and the connection initiator.

pub mod acceptor;
pub mod initiator;

use std::net::Ipv4Addr;

use crate::WhitelistEntry;

/// One IPv4 address of a network interface, as seen by the OS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfaceInfo {
    /// OS name of the interface.
    pub name: String,
    /// An IPv4 address assigned to it.
    pub address: Ipv4Addr,
    /// Whether this is a loopback interface.
    pub is_loopback: bool,
    /// Whether the interface is administratively up.
    pub is_up: bool,
}

/// Enumerates the host's IPv4 interfaces. Hidden behind a trait so tests
/// can substitute fixed interface sets for the OS enumeration.
pub trait InterfaceProvider: Send + Sync {
    /// Every known interface address, up or down, passing the
    /// administrator whitelist.
    fn interfaces(&self) -> Vec<IfaceInfo>;
}

/// The OS-backed interface provider, filtered by an administrator
/// whitelist. An empty whitelist admits every interface.
pub struct SystemInterfaces {
    whitelist: Vec<WhitelistEntry>,
}

impl SystemInterfaces {
    /// A provider with the given whitelist.
    pub fn new(whitelist: Vec<WhitelistEntry>) -> Self {
        SystemInterfaces { whitelist }
    }

    /// A provider configured from `$MEDIABUS_IFACE_WHITELIST`.
    pub fn from_env() -> Self {
        Self::new(crate::iface_whitelist_from_env())
    }
}

impl InterfaceProvider for SystemInterfaces {
    fn interfaces(&self) -> Vec<IfaceInfo> {
        let mut out = Vec::new();
        for iface in pnet::datalink::interfaces() {
            for net in &iface.ips {
                let std::net::IpAddr::V4(address) = net.ip() else {
                    continue;
                };

                let admitted = self.whitelist.is_empty()
                    || iface.is_loopback()
                    || self
                        .whitelist
                        .iter()
                        .any(|e| e.matches(&iface.name, address));
                if admitted {
                    out.push(IfaceInfo {
                        name: iface.name.clone(),
                        address,
                        is_loopback: iface.is_loopback(),
                        is_up: iface.is_up(),
                    });
                }
            }
        }
        out
    }
}

/// A fixed interface set, for tests and embedded configurations.
pub struct FixedInterfaces(pub Vec<IfaceInfo>);

impl InterfaceProvider for FixedInterfaces {
    fn interfaces(&self) -> Vec<IfaceInfo> {
        self.0.clone()
    }
}

/// Splits an enumeration into up and down interfaces, adding loopback to
/// the up set when the enumeration lacks it.
pub fn split_up_down(interfaces: Vec<IfaceInfo>) -> (Vec<IfaceInfo>, Vec<IfaceInfo>) {
    let has_loopback = interfaces.iter().any(|i| i.is_loopback);
    let (mut up, down): (Vec<_>, Vec<_>) = interfaces.into_iter().partition(|i| i.is_up);

    if !has_loopback {
        up.push(IfaceInfo {
            name: "lo".to_owned(),
            address: Ipv4Addr::LOCALHOST,
            is_loopback: true,
            is_up: true,
        });
    }

    (up, down)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn loopback_is_added_when_missing() {
        let (up, down) = split_up_down(vec![
            IfaceInfo {
                name: "eth0".into(),
                address: Ipv4Addr::new(10, 0, 0, 5),
                is_loopback: false,
                is_up: true,
            },
            IfaceInfo {
                name: "eth1".into(),
                address: Ipv4Addr::new(10, 0, 1, 5),
                is_loopback: false,
                is_up: false,
            },
        ]);

        assert_eq!(up.len(), 2);
        assert!(up.iter().any(|i| i.is_loopback));
        assert_eq!(down.len(), 1);
    }

    #[test]
    fn loopback_is_not_duplicated() {
        let (up, _) = split_up_down(vec![IfaceInfo {
            name: "lo".into(),
            address: Ipv4Addr::LOCALHOST,
            is_loopback: true,
            is_up: true,
        }]);

        assert_eq!(up.len(), 1);
    }
}
