//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use bitflags::bitflags;

use crate::route::{IfAddress, Link, Neighbor, Route};
use crate::transport::NetlinkAction;

// Event classes a caller can subscribe to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NetlinkEventType {
    Route,
    Link,
    Address,
    Neighbor,
}

bitflags! {
    // Subscription mask, one bit per event class.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct EventFlags: u8 {
        const ROUTE = 0x01;
        const LINK = 0x02;
        const ADDR = 0x04;
        const NEIGH = 0x08;
    }
}

// A kernel object delivered to the caller's events handler.
#[derive(Clone, Debug)]
pub enum EventVariant {
    Route(Route),
    Link(Link),
    Address(IfAddress),
    Neighbor(Neighbor),
}

// Callback interface for subscribed kernel events. Invoked on the agent
// event loop; implementations must not block.
pub trait EventsHandler: Send + Sync {
    fn handle_event(
        &mut self,
        ifname: &str,
        action: NetlinkAction,
        event: EventVariant,
    );
}

// ===== impl NetlinkEventType =====

impl NetlinkEventType {
    pub(crate) fn flag(&self) -> EventFlags {
        match self {
            NetlinkEventType::Route => EventFlags::ROUTE,
            NetlinkEventType::Link => EventFlags::LINK,
            NetlinkEventType::Address => EventFlags::ADDR,
            NetlinkEventType::Neighbor => EventFlags::NEIGH,
        }
    }
}
