//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

#![allow(dead_code)]

use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fibsync::route::{
    IfAddress, IfAddressBuilder, Link, Neighbor, NextHopBuilder, Route,
    RouteBuilder, RouteScope, RouteType,
};
use fibsync::transport::{
    NetlinkNotification, NetlinkTransport, TransportCapabilities,
    TransportError,
};
use fibsync_utils::mpls::Label;
use ipnetwork::IpNetwork;
use tokio::sync::mpsc;

// One recorded transport operation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Op {
    RouteAdd { route: Route, replace: bool },
    RouteDel { route: Route },
    LabelAdd { route: Route },
    LabelDel { route: Route },
    AddrAdd { addr: IfAddress },
    AddrDel { addr: IfAddress },
}

// Shared stub state: recorded operations, canned dump answers and injectable
// request failures.
#[derive(Default)]
pub struct StubState {
    pub ops: Mutex<Vec<Op>>,
    pub routes: Mutex<Vec<Route>>,
    pub links: Mutex<Vec<Link>>,
    pub addrs: Mutex<Vec<IfAddress>>,
    pub neighbors: Mutex<Vec<Neighbor>>,
    pub route_add_error: Mutex<Option<TransportError>>,
    pub route_del_error: Mutex<Option<TransportError>>,
    pub addr_add_error: Mutex<Option<TransportError>>,
    pub addr_del_error: Mutex<Option<TransportError>>,
}

// Recording transport handed to the agent under test.
pub struct StubTransport {
    state: Arc<StubState>,
    capabilities: TransportCapabilities,
    notifications: Option<mpsc::UnboundedReceiver<NetlinkNotification>>,
}

// Test-side view of the stub: state access plus notification injection.
pub struct StubHandle {
    pub state: Arc<StubState>,
    pub notifications: mpsc::UnboundedSender<NetlinkNotification>,
}

pub fn full_capabilities() -> TransportCapabilities {
    TransportCapabilities {
        mpls: true,
        route_events: true,
    }
}

pub fn stub_transport(
    capabilities: TransportCapabilities,
) -> (StubTransport, StubHandle) {
    let (notif_tx, notif_rx) = mpsc::unbounded_channel();
    let state = Arc::new(StubState::default());
    let transport = StubTransport {
        state: state.clone(),
        capabilities,
        notifications: Some(notif_rx),
    };
    let handle = StubHandle {
        state,
        notifications: notif_tx,
    };
    (transport, handle)
}

// ===== impl StubState =====

impl StubState {
    pub fn ops(&self) -> Vec<Op> {
        self.ops.lock().unwrap().clone()
    }

    pub fn clear_ops(&self) {
        self.ops.lock().unwrap().clear();
    }
}

// ===== impl StubTransport =====

impl StubTransport {
    fn record(&self, op: Op) {
        self.state.ops.lock().unwrap().push(op);
    }

    fn result(
        &self,
        error: &Mutex<Option<TransportError>>,
    ) -> Result<(), TransportError> {
        match error.lock().unwrap().clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl NetlinkTransport for StubTransport {
    fn capabilities(&self) -> TransportCapabilities {
        self.capabilities
    }

    fn take_event_stream(
        &mut self,
    ) -> Option<mpsc::UnboundedReceiver<NetlinkNotification>> {
        self.notifications.take()
    }

    async fn route_add(
        &self,
        route: &Route,
        replace: bool,
    ) -> Result<(), TransportError> {
        self.record(Op::RouteAdd {
            route: route.clone(),
            replace,
        });
        self.result(&self.state.route_add_error)
    }

    async fn route_del(&self, route: &Route) -> Result<(), TransportError> {
        self.record(Op::RouteDel {
            route: route.clone(),
        });
        self.result(&self.state.route_del_error)
    }

    async fn label_add(&self, route: &Route) -> Result<(), TransportError> {
        self.record(Op::LabelAdd {
            route: route.clone(),
        });
        Ok(())
    }

    async fn label_del(&self, route: &Route) -> Result<(), TransportError> {
        self.record(Op::LabelDel {
            route: route.clone(),
        });
        Ok(())
    }

    async fn addr_add(&self, addr: &IfAddress) -> Result<(), TransportError> {
        self.record(Op::AddrAdd { addr: addr.clone() });
        self.result(&self.state.addr_add_error)
    }

    async fn addr_del(&self, addr: &IfAddress) -> Result<(), TransportError> {
        self.record(Op::AddrDel { addr: addr.clone() });
        self.result(&self.state.addr_del_error)
    }

    async fn route_dump(&self) -> Result<Vec<Route>, TransportError> {
        Ok(self.state.routes.lock().unwrap().clone())
    }

    async fn link_dump(&self) -> Result<Vec<Link>, TransportError> {
        Ok(self.state.links.lock().unwrap().clone())
    }

    async fn addr_dump(&self) -> Result<Vec<IfAddress>, TransportError> {
        Ok(self.state.addrs.lock().unwrap().clone())
    }

    async fn neigh_dump(&self) -> Result<Vec<Neighbor>, TransportError> {
        Ok(self.state.neighbors.lock().unwrap().clone())
    }
}

// ===== fixture helpers =====

pub fn unicast_route(
    prefix: IpNetwork,
    gateway: IpAddr,
    ifindex: i32,
) -> Route {
    let nexthop = NextHopBuilder::new()
        .gateway(gateway)
        .ifindex(ifindex)
        .build()
        .unwrap();
    RouteBuilder::new()
        .destination(prefix)
        .nexthop(nexthop)
        .build()
        .unwrap()
}

pub fn mcast_route(prefix: IpNetwork, ifname: &str, ifindex: i32) -> Route {
    let nexthop = NextHopBuilder::new().ifindex(ifindex).build().unwrap();
    RouteBuilder::new()
        .destination(prefix)
        .kind(RouteType::Multicast)
        .ifname(ifname.to_owned())
        .nexthop(nexthop)
        .build()
        .unwrap()
}

pub fn link_route(prefix: IpNetwork, ifindex: i32) -> Route {
    let nexthop = NextHopBuilder::new().ifindex(ifindex).build().unwrap();
    RouteBuilder::new()
        .destination(prefix)
        .scope(RouteScope::Link)
        .nexthop(nexthop)
        .build()
        .unwrap()
}

pub fn mpls_route(label: u32, ifindex: i32) -> Route {
    let nexthop = NextHopBuilder::new().ifindex(ifindex).build().unwrap();
    RouteBuilder::new()
        .mpls_label(Label::new(label))
        .nexthop(nexthop)
        .build()
        .unwrap()
}

pub fn ifaddr(ifindex: i32, prefix: IpNetwork) -> IfAddress {
    IfAddressBuilder::new().ifindex(ifindex).prefix(prefix).build()
}

pub fn link(name: &str, ifindex: i32, up: bool) -> Link {
    Link {
        name: name.to_owned(),
        ifindex,
        up,
        loopback: false,
    }
}

pub fn neighbor(ifindex: i32, destination: IpAddr, reachable: bool) -> Neighbor {
    Neighbor {
        ifindex,
        destination,
        lladdr: Some([0, 1, 2, 3, 4, 5]),
        reachable,
    }
}
