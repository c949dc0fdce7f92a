//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use ipnetwork::IpNetwork;
use tracing::{error, warn};

use crate::route::RouteType;
use crate::transport::TransportError;

// FIB agent errors.
#[derive(Debug)]
pub enum Error {
    // Route validation
    UnsupportedRouteType(RouteType),
    InvalidUnicastRoute(IpNetwork),
    InvalidMulticastRoute(IpNetwork),
    InvalidMplsRoute,
    InvalidNextHop,
    MissingDestination,
    // Interface addresses
    MissingPrefix,
    InconsistentIfIndex,
    // Kernel request failures
    KernelAddFailed(TransportError),
    KernelDeleteFailed(TransportError),
    KernelDumpFailed(TransportError),
    // Event subscription
    RouteEventsUnsupported,
    // Lifecycle
    TransportInitFailed,
    AgentGone,
}

// ===== impl Error =====

impl Error {
    pub(crate) fn log(&self) {
        match self {
            Error::UnsupportedRouteType(route_type) => {
                warn!(?route_type, "{}", self);
            }
            Error::InvalidUnicastRoute(prefix)
            | Error::InvalidMulticastRoute(prefix) => {
                warn!(%prefix, "{}", self);
            }
            Error::InvalidMplsRoute
            | Error::InvalidNextHop
            | Error::MissingDestination
            | Error::MissingPrefix
            | Error::InconsistentIfIndex
            | Error::RouteEventsUnsupported => {
                warn!("{}", self);
            }
            Error::KernelAddFailed(error)
            | Error::KernelDeleteFailed(error)
            | Error::KernelDumpFailed(error) => {
                error!(%error, "{}", self);
            }
            Error::TransportInitFailed | Error::AgentGone => {
                error!("{}", self);
            }
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::UnsupportedRouteType(..) => {
                write!(f, "unsupported route type")
            }
            Error::InvalidUnicastRoute(..) => {
                write!(f, "invalid unicast route")
            }
            Error::InvalidMulticastRoute(..) => {
                write!(f, "invalid multicast route")
            }
            Error::InvalidMplsRoute => {
                write!(f, "invalid MPLS route")
            }
            Error::InvalidNextHop => {
                write!(f, "nexthop has neither interface nor gateway")
            }
            Error::MissingDestination => {
                write!(f, "route destination must be set")
            }
            Error::MissingPrefix => {
                write!(f, "address prefix must be set")
            }
            Error::InconsistentIfIndex => {
                write!(f, "inconsistent ifindex in address list")
            }
            Error::KernelAddFailed(..) => {
                write!(f, "failed to add object to the kernel")
            }
            Error::KernelDeleteFailed(..) => {
                write!(f, "failed to delete object from the kernel")
            }
            Error::KernelDumpFailed(..) => {
                write!(f, "failed to dump objects from the kernel")
            }
            Error::RouteEventsUnsupported => {
                write!(f, "transport does not surface route events")
            }
            Error::TransportInitFailed => {
                write!(f, "failed to initialize netlink transport")
            }
            Error::AgentGone => {
                write!(f, "agent event loop is gone")
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::KernelAddFailed(error)
            | Error::KernelDeleteFailed(error)
            | Error::KernelDumpFailed(error) => Some(error),
            _ => None,
        }
    }
}
