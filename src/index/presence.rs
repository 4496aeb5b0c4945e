//! Address presence indices, one per (role, family) slot.

use std::collections::HashMap;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::address::{AddressPresence, AddressSlot};
use crate::error::{ExecutionError, HistoryResult};
use crate::node::NodeIdentity;
use crate::storage::HistoryStore;

/// Node → address → newest presence rows of one slot.
///
/// Keyed by address, not port: the caller compares the port after the
/// address hit. A node listing the same address with two ports keeps both
/// rows under that address.
#[derive(Debug)]
pub struct AddressPresenceIndex {
    slot: AddressSlot,
    entries: HashMap<NodeIdentity, HashMap<IpAddr, Vec<AddressPresence>>>,
}

impl AddressPresenceIndex {
    /// Loads, for every node, the rows carrying its greatest
    /// last-confirmed-at not exceeding `at`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn load(store: &dyn HistoryStore, slot: AddressSlot, at: DateTime<Utc>) -> HistoryResult<Self> {
        let rows = store
            .latest_presence(slot, at)
            .map_err(|e| ExecutionError::storage(format!("load latest {slot}"), e))?;

        let mut entries: HashMap<NodeIdentity, HashMap<IpAddr, Vec<AddressPresence>>> =
            HashMap::new();
        for row in rows {
            entries
                .entry(row.node.clone())
                .or_default()
                .entry(row.address)
                .or_default()
                .push(row);
        }
        Ok(Self { slot, entries })
    }

    #[must_use]
    pub const fn slot(&self) -> AddressSlot {
        self.slot
    }

    /// Rows recorded for `address` on `node`; empty when the address is new.
    #[must_use]
    pub fn lookup(&self, node: &NodeIdentity, address: &IpAddr) -> &[AddressPresence] {
        self.entries
            .get(node)
            .and_then(|by_address| by_address.get(address))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Number of indexed nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The six independent slot indices.
#[derive(Debug)]
pub struct PresenceIndexSet {
    slots: [AddressPresenceIndex; 6],
}

impl PresenceIndexSet {
    /// Loads all six slots as of `at`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read.
    pub fn load(store: &dyn HistoryStore, at: DateTime<Utc>) -> HistoryResult<Self> {
        let [a, b, c, d, e, f] = AddressSlot::ALL;
        let slots = [
            AddressPresenceIndex::load(store, a, at)?,
            AddressPresenceIndex::load(store, b, at)?,
            AddressPresenceIndex::load(store, c, at)?,
            AddressPresenceIndex::load(store, d, at)?,
            AddressPresenceIndex::load(store, e, at)?,
            AddressPresenceIndex::load(store, f, at)?,
        ];
        debug!(
            nodes = ?slots.iter().map(AddressPresenceIndex::len).collect::<Vec<_>>(),
            %at,
            "address presence indices loaded"
        );
        Ok(Self { slots })
    }

    #[must_use]
    pub fn slot(&self, slot: AddressSlot) -> &AddressPresenceIndex {
        &self.slots[slot.index()]
    }

    #[must_use]
    pub fn lookup(
        &self,
        slot: AddressSlot,
        node: &NodeIdentity,
        address: &IpAddr,
    ) -> &[AddressPresence] {
        self.slot(slot).lookup(node, address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::{AddressFamily, AddressRole, NewPresence};
    use crate::storage::InMemoryHistoryStore;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_slots_are_independent() {
        let store = InMemoryHistoryStore::new();
        let node = NodeIdentity::new("F00D").unwrap();
        let exit4 = AddressSlot::new(AddressRole::Exit, AddressFamily::V4);
        let or4 = AddressSlot::new(AddressRole::OnionRouting, AddressFamily::V4);
        let ip: IpAddr = "198.51.100.7".parse().unwrap();

        store
            .insert_presence(NewPresence {
                node: node.clone(),
                slot: exit4,
                address: ip,
                port: None,
                at: t0(),
            })
            .unwrap();

        let set = PresenceIndexSet::load(&store, t0()).unwrap();
        assert_eq!(set.lookup(exit4, &node, &ip).len(), 1);
        assert!(set.lookup(or4, &node, &ip).is_empty());
        assert_eq!(set.slot(exit4).slot(), exit4);
    }

    #[test]
    fn test_same_address_two_ports() {
        let store = InMemoryHistoryStore::new();
        let node = NodeIdentity::new("F00D").unwrap();
        let or6 = AddressSlot::new(AddressRole::OnionRouting, AddressFamily::V6);
        let ip: IpAddr = "2001:db8::1".parse().unwrap();
        for port in [443, 9001] {
            store
                .insert_presence(NewPresence {
                    node: node.clone(),
                    slot: or6,
                    address: ip,
                    port: Some(port),
                    at: t0(),
                })
                .unwrap();
        }

        let index = AddressPresenceIndex::load(&store, or6, t0() + Duration::hours(1)).unwrap();
        let rows = index.lookup(&node, &ip);
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().any(|row| row.port == Some(9001)));
    }
}
