//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;

use bitflags::bitflags;
use derive_new::new;
use fibsync_utils::ip::{AddressFamily, IpAddrExt, IpNetworkExt};
use fibsync_utils::mpls::Label;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

use crate::error::Error;

// Protocol ID used for routes installed by this agent.
pub const DEFAULT_PROTOCOL_ID: u8 = 99;

// Kernel route types accepted by the agent.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum RouteType {
    #[default]
    Unicast,
    Multicast,
    Blackhole,
}

// Kernel route scopes.
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub enum RouteScope {
    #[default]
    Universe,
    Site,
    Link,
    Host,
    Nowhere,
    Other(u8),
}

// Kernel routing table identifier.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct RouteTable(u8);

bitflags! {
    // Kernel route flags.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[derive(Deserialize, Serialize)]
    #[serde(transparent)]
    pub struct RouteFlags: u32 {
        const NOTIFY = 0x0100;
        const CLONED = 0x0200;
    }
}

// Route nexthop: output interface, gateway address, ECMP weight. At least
// one of interface and gateway must be present.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct NextHop {
    ifindex: Option<i32>,
    gateway: Option<IpAddr>,
    weight: Option<u8>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NextHopBuilder {
    ifindex: Option<i32>,
    gateway: Option<IpAddr>,
    weight: Option<u8>,
}

// A kernel route: an IP prefix or MPLS label, routing attributes and an
// ordered nexthop set. Values are pure data; encoding to and from netlink
// messages is the transport's job.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct Route {
    destination: Option<IpNetwork>,
    kind: RouteType,
    table: RouteTable,
    protocol_id: u8,
    scope: RouteScope,
    flags: Option<RouteFlags>,
    priority: Option<u32>,
    tos: Option<u8>,
    mpls_label: Option<Label>,
    ifname: Option<String>,
    nexthops: Vec<NextHop>,
    valid: bool,
}

#[derive(Clone, Debug)]
pub struct RouteBuilder {
    destination: Option<IpNetwork>,
    kind: RouteType,
    table: RouteTable,
    protocol_id: u8,
    scope: RouteScope,
    flags: Option<RouteFlags>,
    priority: Option<u32>,
    tos: Option<u8>,
    mpls_label: Option<Label>,
    ifname: Option<String>,
    nexthops: Vec<NextHop>,
    valid: bool,
}

// An address assigned to an interface.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct IfAddress {
    ifindex: i32,
    prefix: Option<IpNetwork>,
    scope: Option<RouteScope>,
    valid: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct IfAddressBuilder {
    ifindex: Option<i32>,
    prefix: Option<IpNetwork>,
    scope: Option<RouteScope>,
    valid: bool,
}

// Interface attributes as decoded from a kernel link object.
#[derive(Clone, Debug, Eq, PartialEq, new)]
#[derive(Deserialize, Serialize)]
pub struct Link {
    pub name: String,
    pub ifindex: i32,
    pub up: bool,
    pub loopback: bool,
}

// A neighbor table entry.
#[derive(Clone, Debug, Eq, PartialEq, new)]
#[derive(Deserialize, Serialize)]
pub struct Neighbor {
    pub ifindex: i32,
    pub destination: IpAddr,
    pub lladdr: Option<[u8; 6]>,
    pub reachable: bool,
}

// ===== impl RouteTable =====

impl RouteTable {
    pub const UNSPEC: RouteTable = RouteTable(0);
    pub const DEFAULT: RouteTable = RouteTable(253);
    pub const MAIN: RouteTable = RouteTable(254);
    pub const LOCAL: RouteTable = RouteTable(255);

    pub fn new(table: u8) -> RouteTable {
        RouteTable(table)
    }

    pub fn get(&self) -> u8 {
        self.0
    }

    pub fn is_main(&self) -> bool {
        *self == Self::MAIN
    }
}

impl Default for RouteTable {
    fn default() -> RouteTable {
        RouteTable::MAIN
    }
}

impl std::fmt::Display for RouteTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            RouteTable::UNSPEC => write!(f, "unspec"),
            RouteTable::DEFAULT => write!(f, "default"),
            RouteTable::MAIN => write!(f, "main"),
            RouteTable::LOCAL => write!(f, "local"),
            RouteTable(table) => write!(f, "{}", table),
        }
    }
}

// ===== impl NextHop =====

impl NextHop {
    pub fn ifindex(&self) -> Option<i32> {
        self.ifindex
    }

    pub fn gateway(&self) -> Option<IpAddr> {
        self.gateway
    }

    pub fn weight(&self) -> Option<u8> {
        self.weight
    }
}

// ===== impl NextHopBuilder =====

impl NextHopBuilder {
    pub fn new() -> NextHopBuilder {
        Default::default()
    }

    pub fn ifindex(mut self, ifindex: i32) -> Self {
        self.ifindex = Some(ifindex);
        self
    }

    pub fn gateway(mut self, gateway: IpAddr) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn weight(mut self, weight: u8) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn build(self) -> Result<NextHop, Error> {
        if self.ifindex.is_none() && self.gateway.is_none() {
            return Err(Error::InvalidNextHop);
        }
        Ok(NextHop {
            ifindex: self.ifindex,
            gateway: self.gateway,
            weight: self.weight,
        })
    }
}

// ===== impl Route =====

impl Route {
    pub fn destination(&self) -> Option<IpNetwork> {
        self.destination
    }

    pub fn kind(&self) -> RouteType {
        self.kind
    }

    pub fn table(&self) -> RouteTable {
        self.table
    }

    pub fn protocol_id(&self) -> u8 {
        self.protocol_id
    }

    pub fn scope(&self) -> RouteScope {
        self.scope
    }

    pub fn flags(&self) -> Option<RouteFlags> {
        self.flags
    }

    pub fn priority(&self) -> Option<u32> {
        self.priority
    }

    pub fn tos(&self) -> Option<u8> {
        self.tos
    }

    pub fn mpls_label(&self) -> Option<Label> {
        self.mpls_label
    }

    pub fn ifname(&self) -> Option<&str> {
        self.ifname.as_deref()
    }

    pub fn nexthops(&self) -> &[NextHop] {
        &self.nexthops
    }

    // Whether the route exists in the kernel. Cleared by the notification
    // path when the kernel withdraws the route.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    // Returns true when the route has exactly one nexthop carrying an
    // interface index (required for multicast and link scope routes).
    pub(crate) fn single_ifindex_nexthop(&self) -> Option<i32> {
        match self.nexthops.as_slice() {
            [nexthop] => nexthop.ifindex(),
            _ => None,
        }
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.destination, self.mpls_label) {
            (Some(destination), _) => write!(f, "{}", destination),
            (None, Some(label)) => write!(f, "label {}", label),
            (None, None) => write!(f, "(empty)"),
        }
    }
}

// ===== impl RouteBuilder =====

impl RouteBuilder {
    pub fn new() -> RouteBuilder {
        Default::default()
    }

    pub fn destination(mut self, destination: IpNetwork) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn kind(mut self, kind: RouteType) -> Self {
        self.kind = kind;
        self
    }

    pub fn table(mut self, table: RouteTable) -> Self {
        self.table = table;
        self
    }

    pub fn protocol_id(mut self, protocol_id: u8) -> Self {
        self.protocol_id = protocol_id;
        self
    }

    pub fn scope(mut self, scope: RouteScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn flags(mut self, flags: RouteFlags) -> Self {
        self.flags = Some(flags);
        self
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn tos(mut self, tos: u8) -> Self {
        self.tos = Some(tos);
        self
    }

    pub fn mpls_label(mut self, label: Label) -> Self {
        self.mpls_label = Some(label);
        self
    }

    pub fn ifname(mut self, ifname: String) -> Self {
        self.ifname = Some(ifname);
        self
    }

    pub fn nexthop(mut self, nexthop: NextHop) -> Self {
        self.nexthops.push(nexthop);
        self
    }

    pub fn valid(mut self, valid: bool) -> Self {
        self.valid = valid;
        self
    }

    // Validates the route invariants appropriate to its type and produces
    // the route value.
    pub fn build(self) -> Result<Route, Error> {
        if self.mpls_label.is_some() {
            // Label routes: unicast, no interface name, and every nexthop
            // must name an output interface.
            if self.kind != RouteType::Unicast
                || self.ifname.is_some()
                || self
                    .nexthops
                    .iter()
                    .any(|nexthop| nexthop.ifindex().is_none())
            {
                return Err(Error::InvalidMplsRoute);
            }
            return Ok(self.finish());
        }

        let Some(destination) = self.destination else {
            return Err(Error::MissingDestination);
        };
        match self.kind {
            RouteType::Unicast | RouteType::Blackhole => {
                if destination.ip().is_multicast()
                    || destination.ip().is_link_local()
                {
                    return Err(Error::InvalidUnicastRoute(destination));
                }
                // Link scope routes must resolve to a single interface.
                if self.scope == RouteScope::Link
                    && self
                        .nexthops
                        .iter()
                        .filter(|nexthop| nexthop.ifindex().is_some())
                        .count()
                        != 1
                {
                    return Err(Error::InvalidUnicastRoute(destination));
                }
            }
            RouteType::Multicast => {
                if !destination.ip().is_multicast()
                    || self.ifname.is_none()
                    || self.single_ifindex_nexthop().is_none()
                {
                    return Err(Error::InvalidMulticastRoute(destination));
                }
            }
        }
        Ok(self.finish())
    }

    // Produces the route value without invariant checks. Used by transport
    // decoders, where the kernel object is authoritative; the `valid` flag
    // set on the builder is preserved.
    pub fn build_unchecked(self) -> Route {
        self.finish()
    }

    fn finish(self) -> Route {
        Route {
            destination: self.destination,
            kind: self.kind,
            table: self.table,
            protocol_id: self.protocol_id,
            scope: self.scope,
            flags: self.flags,
            priority: self.priority,
            tos: self.tos,
            mpls_label: self.mpls_label,
            ifname: self.ifname,
            nexthops: self.nexthops,
            valid: self.valid,
        }
    }

    fn single_ifindex_nexthop(&self) -> Option<i32> {
        match self.nexthops.as_slice() {
            [nexthop] => nexthop.ifindex(),
            _ => None,
        }
    }
}

impl Default for RouteBuilder {
    fn default() -> RouteBuilder {
        RouteBuilder {
            destination: None,
            kind: Default::default(),
            table: Default::default(),
            protocol_id: DEFAULT_PROTOCOL_ID,
            scope: Default::default(),
            flags: None,
            priority: None,
            tos: None,
            mpls_label: None,
            ifname: None,
            nexthops: Vec::new(),
            valid: true,
        }
    }
}

// ===== impl IfAddress =====

impl IfAddress {
    pub fn ifindex(&self) -> i32 {
        self.ifindex
    }

    pub fn prefix(&self) -> Option<IpNetwork> {
        self.prefix
    }

    pub fn scope(&self) -> Option<RouteScope> {
        self.scope
    }

    pub fn family(&self) -> Option<AddressFamily> {
        self.prefix.map(|prefix| prefix.address_family())
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

// ===== impl IfAddressBuilder =====

impl IfAddressBuilder {
    pub fn new() -> IfAddressBuilder {
        Default::default()
    }

    pub fn ifindex(mut self, ifindex: i32) -> Self {
        self.ifindex = Some(ifindex);
        self
    }

    pub fn prefix(mut self, prefix: IpNetwork) -> Self {
        self.prefix = Some(prefix);
        self
    }

    pub fn scope(mut self, scope: RouteScope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn valid(mut self, valid: bool) -> Self {
        self.valid = valid;
        self
    }

    pub fn build(self) -> IfAddress {
        IfAddress {
            ifindex: self.ifindex.unwrap_or(0),
            prefix: self.prefix,
            scope: self.scope,
            valid: self.valid,
        }
    }
}

impl Default for IfAddressBuilder {
    fn default() -> IfAddressBuilder {
        IfAddressBuilder {
            ifindex: None,
            prefix: None,
            scope: None,
            valid: true,
        }
    }
}
