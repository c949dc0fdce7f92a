//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::route::{IfAddress, Link, Neighbor, Route};

// Receive buffer size for the notification socket. Bulk events (e.g. a full
// table flush) overflow the kernel default of 32 KiB.
pub const SUB_SOCKET_RCVBUF_SIZE: usize = 2 * 1024 * 1024;

// What a transport implementation can do. The legacy rtnl codec surfaces
// route events through its object caches but cannot program labels; the
// newer message codec is the other way around.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct TransportCapabilities {
    pub mpls: bool,
    pub route_events: bool,
}

// Kernel object actions, mirroring the netlink action codes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NetlinkAction {
    New,
    Del,
    Change,
    Get,
}

// A decoded kernel notification. Transports deliver pure values; no kernel
// handle outlives the transport call that decoded it.
#[derive(Clone, Debug)]
pub enum NetlinkNotification {
    Route { route: Route, action: NetlinkAction },
    Link { link: Link, action: NetlinkAction },
    Address { address: IfAddress, action: NetlinkAction },
    Neighbor { neighbor: Neighbor, action: NetlinkAction },
}

// Transport-level request failures.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TransportError {
    // The object to delete does not exist.
    NotFound,
    // The object to add already exists.
    Exists,
    // The address to delete is not assigned.
    AddressNotFound,
    // The operation is not supported by this transport.
    Unsupported,
    // Any other kernel errno.
    Errno(i32),
    // Connection-level failure.
    Other(String),
}

// A channel to the kernel FIB: one request/reply path for mutations and
// dumps, one subscription path for unsolicited notifications.
#[async_trait]
pub trait NetlinkTransport: Send + Sync {
    fn capabilities(&self) -> TransportCapabilities;

    // Hands over the notification stream. Yields `Some` exactly once.
    fn take_event_stream(
        &mut self,
    ) -> Option<UnboundedReceiver<NetlinkNotification>>;

    async fn route_add(
        &self,
        route: &Route,
        replace: bool,
    ) -> Result<(), TransportError>;

    async fn route_del(&self, route: &Route) -> Result<(), TransportError>;

    async fn label_add(&self, route: &Route) -> Result<(), TransportError>;

    async fn label_del(&self, route: &Route) -> Result<(), TransportError>;

    async fn addr_add(&self, addr: &IfAddress) -> Result<(), TransportError>;

    async fn addr_del(&self, addr: &IfAddress) -> Result<(), TransportError>;

    async fn route_dump(&self) -> Result<Vec<Route>, TransportError>;

    async fn link_dump(&self) -> Result<Vec<Link>, TransportError>;

    async fn addr_dump(&self) -> Result<Vec<IfAddress>, TransportError>;

    async fn neigh_dump(&self) -> Result<Vec<Neighbor>, TransportError>;
}

// ===== impl TransportError =====

impl TransportError {
    // Returns the kernel errno behind this error, if any.
    pub fn errno(&self) -> Option<i32> {
        match self {
            TransportError::Errno(errno) => Some(*errno),
            _ => None,
        }
    }
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::NotFound => write!(f, "object not found"),
            TransportError::Exists => write!(f, "object already exists"),
            TransportError::AddressNotFound => {
                write!(f, "address not assigned")
            }
            TransportError::Unsupported => {
                write!(f, "operation not supported by the transport")
            }
            TransportError::Errno(errno) => write!(f, "errno {}", errno),
            TransportError::Other(reason) => write!(f, "{}", reason),
        }
    }
}

impl std::error::Error for TransportError {}
