//! Network addresses announced by nodes.
//!
//! Addresses are tracked per slot, a (role, family) pair. Each of the six
//! slots has its own presence table and its own index, and a change in one slot
//! never touches another.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::node::NodeIdentity;

/// What a node uses an address for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressRole {
    /// Accepts onion-routing connections (`or_addresses`).
    OnionRouting,
    /// Exits to the internet (`exit_addresses`). Carries no port.
    Exit,
    /// Serves directory requests (`dir_address`).
    Directory,
}

impl AddressRole {
    /// All roles in reconciliation order.
    pub const ALL: [Self; 3] = [Self::OnionRouting, Self::Exit, Self::Directory];

    /// Returns true if addresses in this role carry a port.
    #[must_use]
    pub const fn has_port(self) -> bool {
        !matches!(self, Self::Exit)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OnionRouting => "onion-routing",
            Self::Exit => "exit",
            Self::Directory => "directory",
        }
    }
}

impl fmt::Display for AddressRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// IP family of an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    #[must_use]
    pub const fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }
}

/// One of the six (role, family) presence tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AddressSlot {
    pub role: AddressRole,
    pub family: AddressFamily,
}

impl AddressSlot {
    /// All slots, in table order.
    pub const ALL: [Self; 6] = [
        Self::new(AddressRole::OnionRouting, AddressFamily::V4),
        Self::new(AddressRole::OnionRouting, AddressFamily::V6),
        Self::new(AddressRole::Exit, AddressFamily::V4),
        Self::new(AddressRole::Exit, AddressFamily::V6),
        Self::new(AddressRole::Directory, AddressFamily::V4),
        Self::new(AddressRole::Directory, AddressFamily::V6),
    ];

    #[must_use]
    pub const fn new(role: AddressRole, family: AddressFamily) -> Self {
        Self { role, family }
    }

    /// Position of this slot in [`AddressSlot::ALL`].
    #[must_use]
    pub const fn index(self) -> usize {
        let role = match self.role {
            AddressRole::OnionRouting => 0,
            AddressRole::Exit => 1,
            AddressRole::Directory => 2,
        };
        let family = match self.family {
            AddressFamily::V4 => 0,
            AddressFamily::V6 => 1,
        };
        role * 2 + family
    }

    /// Name of the backing table.
    #[must_use]
    pub const fn table_name(self) -> &'static str {
        match (self.role, self.family) {
            (AddressRole::OnionRouting, AddressFamily::V4) => "or_addresses_v4",
            (AddressRole::OnionRouting, AddressFamily::V6) => "or_addresses_v6",
            (AddressRole::Exit, AddressFamily::V4) => "exit_addresses_v4",
            (AddressRole::Exit, AddressFamily::V6) => "exit_addresses_v6",
            (AddressRole::Directory, AddressFamily::V4) => "dir_addresses_v4",
            (AddressRole::Directory, AddressFamily::V6) => "dir_addresses_v6",
        }
    }
}

impl fmt::Display for AddressSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

/// An address as announced in a snapshot, parsed and normalized.
///
/// IPv6 addresses print in RFC 5952 form, so two spellings of the same address
/// compare and hash equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParsedAddress {
    pub ip: IpAddr,
    pub port: Option<u16>,
}

impl ParsedAddress {
    /// Parses an address entry for the given role.
    ///
    /// Onion-routing and directory entries are `a.b.c.d:port` or `[v6]:port`.
    /// Exit entries are bare addresses; brackets around an IPv6 exit address
    /// are tolerated.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidAddress` if the entry does not parse.
    pub fn parse(role: AddressRole, text: &str) -> Result<Self, ValidationError> {
        let text = text.trim();
        let invalid = |reason: &str| ValidationError::InvalidAddress {
            role: role.to_string(),
            address: text.to_string(),
            reason: reason.to_string(),
        };

        if role.has_port() {
            let socket: SocketAddr = text
                .parse()
                .map_err(|_| invalid("expected address:port or [address]:port"))?;
            Ok(Self {
                ip: socket.ip(),
                port: Some(socket.port()),
            })
        } else {
            let bare = text
                .strip_prefix('[')
                .and_then(|s| s.strip_suffix(']'))
                .unwrap_or(text);
            let ip: IpAddr = bare.parse().map_err(|_| invalid("expected a bare IP address"))?;
            Ok(Self { ip, port: None })
        }
    }

    #[must_use]
    pub const fn family(&self) -> AddressFamily {
        AddressFamily::of(&self.ip)
    }

    /// The presence table this address belongs to for `role`.
    #[must_use]
    pub const fn slot(&self, role: AddressRole) -> AddressSlot {
        AddressSlot::new(role, self.family())
    }
}

impl fmt::Display for ParsedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.ip, self.port) {
            (IpAddr::V6(ip), Some(port)) => write!(f, "[{ip}]:{port}"),
            (ip, Some(port)) => write!(f, "{ip}:{port}"),
            (ip, None) => write!(f, "{ip}"),
        }
    }
}

/// Store-assigned identifier of an [`AddressPresence`] row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PresenceId(pub u64);

/// One recorded sighting interval of an address for a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressPresence {
    pub id: PresenceId,
    pub node: NodeIdentity,
    pub slot: AddressSlot,
    pub address: IpAddr,
    pub port: Option<u16>,
    pub inserted_at: DateTime<Utc>,
    pub last_confirmed_at: DateTime<Utc>,
}

/// A presence row about to be inserted; both timestamps are set to `at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPresence {
    pub node: NodeIdentity,
    pub slot: AddressSlot,
    pub address: IpAddr,
    pub port: Option<u16>,
    pub at: DateTime<Utc>,
}

impl NewPresence {
    #[must_use]
    pub fn into_presence(self, id: PresenceId) -> AddressPresence {
        AddressPresence {
            id,
            node: self.node,
            slot: self.slot,
            address: self.address,
            port: self.port,
            inserted_at: self.at,
            last_confirmed_at: self.at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_indices_match_all() {
        for (i, slot) in AddressSlot::ALL.iter().enumerate() {
            assert_eq!(slot.index(), i);
        }
    }

    #[test]
    fn test_parse_onion_routing_v4() {
        let parsed = ParsedAddress::parse(AddressRole::OnionRouting, "192.0.2.10:9001").unwrap();
        assert_eq!(parsed.ip, "192.0.2.10".parse::<IpAddr>().unwrap());
        assert_eq!(parsed.port, Some(9001));
        assert_eq!(parsed.family(), AddressFamily::V4);
    }

    #[test]
    fn test_parse_onion_routing_v6_normalizes() {
        let parsed =
            ParsedAddress::parse(AddressRole::OnionRouting, "[2001:db8:0:0:0:0:0:1]:443").unwrap();
        assert_eq!(parsed.ip.to_string(), "2001:db8::1");
        assert_eq!(parsed.to_string(), "[2001:db8::1]:443");
        assert_eq!(
            parsed.slot(AddressRole::OnionRouting),
            AddressSlot::new(AddressRole::OnionRouting, AddressFamily::V6)
        );

        let other = ParsedAddress::parse(AddressRole::OnionRouting, "[2001:DB8::1]:443").unwrap();
        assert_eq!(parsed, other);
    }

    #[test]
    fn test_parse_exit_bare_and_bracketed() {
        let v4 = ParsedAddress::parse(AddressRole::Exit, "198.51.100.7").unwrap();
        assert_eq!(v4.port, None);
        assert_eq!(v4.to_string(), "198.51.100.7");

        let v6 = ParsedAddress::parse(AddressRole::Exit, "[2001:db8::7]").unwrap();
        assert_eq!(v6.family(), AddressFamily::V6);
        assert_eq!(v6.port, None);
    }

    #[test]
    fn test_parse_rejects_missing_port() {
        let err = ParsedAddress::parse(AddressRole::Directory, "192.0.2.10").unwrap_err();
        assert!(matches!(err, ValidationError::InvalidAddress { .. }));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ParsedAddress::parse(AddressRole::OnionRouting, "relay.example:9001").is_err());
        assert!(ParsedAddress::parse(AddressRole::OnionRouting, "192.0.2.10:99999").is_err());
        assert!(ParsedAddress::parse(AddressRole::Exit, "192.0.2.300").is_err());
    }

    #[test]
    fn test_role_ports() {
        assert!(AddressRole::OnionRouting.has_port());
        assert!(AddressRole::Directory.has_port());
        assert!(!AddressRole::Exit.has_port());
    }
}
