//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use ipnetwork::IpNetwork;

use crate::route::{Link, Neighbor};

// Cached attributes of one interface, including the set of addresses
// currently assigned to it.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LinkAttrs {
    pub ifindex: i32,
    pub up: bool,
    pub networks: BTreeSet<IpNetwork>,
}

// Interface cache keyed by name, with loopback tracking.
#[derive(Debug, Default)]
pub struct Links {
    entries: BTreeMap<String, LinkAttrs>,
    loopback_ifindex: Option<i32>,
}

// Neighbor cache keyed by interface name and destination address. Holds
// reachable entries only.
#[derive(Debug, Default)]
pub struct Neighbors {
    entries: BTreeMap<(String, IpAddr), Neighbor>,
}

// ===== impl Links =====

impl Links {
    // Adds or updates the entry for the given link.
    pub(crate) fn update(&mut self, link: &Link) {
        let attrs = self.entries.entry(link.name.clone()).or_default();
        attrs.ifindex = link.ifindex;
        attrs.up = link.up;
        if link.loopback {
            self.loopback_ifindex = Some(link.ifindex);
        }
    }

    // Records an address as assigned to the given interface.
    pub(crate) fn addr_add(&mut self, ifname: &str, prefix: IpNetwork) {
        self.entries
            .entry(ifname.to_owned())
            .or_default()
            .networks
            .insert(prefix);
    }

    // Removes an address from the given interface.
    pub(crate) fn addr_del(&mut self, ifname: &str, prefix: IpNetwork) {
        if let Some(attrs) = self.entries.get_mut(ifname) {
            attrs.networks.remove(&prefix);
        }
    }

    // Resolves an interface name to its index.
    pub(crate) fn get_ifindex(&self, ifname: &str) -> Option<i32> {
        self.entries.get(ifname).map(|attrs| attrs.ifindex)
    }

    // Resolves an interface index to its name.
    pub(crate) fn get_ifname(&self, ifindex: i32) -> Option<String> {
        self.entries
            .iter()
            .find(|(_, attrs)| attrs.ifindex == ifindex)
            .map(|(ifname, _)| ifname.clone())
    }

    pub(crate) fn loopback_ifindex(&self) -> Option<i32> {
        self.loopback_ifindex
    }

    pub(crate) fn snapshot(&self) -> BTreeMap<String, LinkAttrs> {
        self.entries.clone()
    }
}

// ===== impl Neighbors =====

impl Neighbors {
    pub(crate) fn remove(&mut self, key: &(String, IpAddr)) {
        self.entries.remove(key);
    }

    pub(crate) fn insert(
        &mut self,
        key: (String, IpAddr),
        neighbor: Neighbor,
    ) {
        self.entries.insert(key, neighbor);
    }

    // Drops every entry learned on the given interface.
    pub(crate) fn purge_interface(&mut self, ifname: &str) {
        self.entries.retain(|(name, _), _| name != ifname);
    }

    pub(crate) fn snapshot(&self) -> BTreeMap<(String, IpAddr), Neighbor> {
        self.entries.clone()
    }
}
