//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use async_trait::async_trait;
use capctl::caps::CapState;
use fibsync_utils::ip::{Ipv4AddrExt, Ipv6AddrExt};
use futures::channel::mpsc::UnboundedReceiver as RawMonitor;
use futures::{StreamExt, TryStreamExt};
use ipnetwork::IpNetwork;
use netlink_packet_core::{NetlinkMessage, NetlinkPayload};
use netlink_packet_route::constants::{
    AF_INET, AF_INET6, ARPHRD_LOOPBACK, IFF_RUNNING, NUD_DELAY, NUD_NOARP,
    NUD_PERMANENT, NUD_PROBE, NUD_REACHABLE, NUD_STALE, RTNLGRP_IPV4_IFADDR,
    RTNLGRP_IPV4_ROUTE, RTNLGRP_IPV6_IFADDR, RTNLGRP_IPV6_ROUTE, RTNLGRP_LINK,
    RTNLGRP_NEIGH, RTN_BLACKHOLE, RTN_MULTICAST, RTN_UNICAST,
    RT_SCOPE_HOST, RT_SCOPE_LINK, RT_SCOPE_NOWHERE, RT_SCOPE_SITE,
    RT_SCOPE_UNIVERSE,
};
use netlink_packet_route::rtnl::RtnlMessage;
use netlink_packet_route::{
    AddressMessage, LinkMessage, NeighbourMessage, RouteMessage,
};
use netlink_sys::{AsyncSocket, SocketAddr};
use rtnetlink::{new_connection, Handle, IpVersion};
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{error, trace, warn};

use crate::route::{
    IfAddress, IfAddressBuilder, Link, Neighbor, NextHopBuilder, Route,
    RouteBuilder, RouteFlags, RouteScope, RouteTable, RouteType,
};
use crate::transport::{
    NetlinkAction, NetlinkNotification, NetlinkTransport,
    TransportCapabilities, TransportError, SUB_SOCKET_RCVBUF_SIZE,
};

pub type NetlinkMonitor =
    RawMonitor<(NetlinkMessage<RtnlMessage>, SocketAddr)>;

// Errno values masked or classified by the agent.
const ENOENT: i32 = 2;
const ESRCH: i32 = 3;
const EEXIST: i32 = 17;
const EADDRNOTAVAIL: i32 = 99;

// Neighbor states treated as reachable.
const NUD_VALID: u16 = NUD_PERMANENT
    | NUD_NOARP
    | NUD_REACHABLE
    | NUD_PROBE
    | NUD_STALE
    | NUD_DELAY;

// Production transport backed by two rtnetlink connections: one for
// request/reply traffic and one bound to the rtnetlink multicast groups for
// unsolicited notifications.
pub struct NetlinkSocketTransport {
    handle: Handle,
    notifications: Option<mpsc::UnboundedReceiver<NetlinkNotification>>,
}

// ===== impl NetlinkSocketTransport =====

impl NetlinkSocketTransport {
    // Opens both netlink connections. Must be called from within a tokio
    // runtime.
    pub fn init() -> Result<NetlinkSocketTransport, TransportError> {
        // Create the request channel.
        let (conn, handle, _) = new_connection()
            .map_err(|error| TransportError::Other(error.to_string()))?;

        // Spawn the request connection on a separate thread with permanent
        // elevated capabilities.
        std::thread::spawn(|| {
            // Raise capabilities.
            let mut caps = CapState::get_current().unwrap();
            caps.effective = caps.permitted;
            if let Err(error) = caps.set_current() {
                error!("failed to update current capabilities: {}", error);
            }

            // Serve requests initiated by the netlink handle.
            futures::executor::block_on(conn)
        });

        // Create the subscription channel.
        let (mut conn, _, messages) = new_connection()
            .map_err(|error| TransportError::Other(error.to_string()))?;
        let groups = [
            RTNLGRP_LINK,
            RTNLGRP_NEIGH,
            RTNLGRP_IPV4_IFADDR,
            RTNLGRP_IPV6_IFADDR,
            RTNLGRP_IPV4_ROUTE,
            RTNLGRP_IPV6_ROUTE,
        ]
        .iter()
        .map(|group| 1 << (group - 1))
        .fold(0, std::ops::BitOr::bitor);
        let addr = SocketAddr::new(0, groups);
        {
            let socket = conn.socket_mut().socket_mut();
            // Bulk events (e.g. table flushes) overflow the default receive
            // buffer.
            if let Err(error) = socket.set_rx_buf_sz(SUB_SOCKET_RCVBUF_SIZE) {
                warn!(%error, "failed to set socket receive buffer");
            }
            socket
                .bind(&addr)
                .map_err(|error| TransportError::Other(error.to_string()))?;
        }
        tokio::spawn(conn);

        // Decode raw messages off the subscription channel.
        let (notif_tx, notif_rx) = mpsc::unbounded_channel();
        tokio::spawn(monitor(messages, notif_tx));

        Ok(NetlinkSocketTransport {
            handle,
            notifications: Some(notif_rx),
        })
    }
}

// Fills the parts of a route message the request builder does not cover.
fn apply_route_attrs(message: &mut RouteMessage, route: &Route) {
    use netlink_packet_route::route::nlas::Nla;

    message.header.table = route.table().get();
    message.header.kind = kind_code(route.kind());
    message.header.scope = scope_code(route.scope());
    if let Some(tos) = route.tos() {
        message.header.tos = tos;
    }
    if let Some(priority) = route.priority() {
        message.nlas.push(Nla::Priority(priority));
    }
}

#[async_trait]
impl NetlinkTransport for NetlinkSocketTransport {
    fn capabilities(&self) -> TransportCapabilities {
        // The rtnetlink crate does not support the MPLS address family yet.
        TransportCapabilities {
            mpls: false,
            route_events: true,
        }
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
        let Some(prefix) = route.destination() else {
            return Err(TransportError::Unsupported);
        };
        let mut request =
            self.handle.route().add().protocol(route.protocol_id());
        apply_route_attrs(request.message_mut(), route);
        match prefix {
            IpNetwork::V4(prefix) => {
                let mut request = request
                    .v4()
                    .destination_prefix(prefix.ip(), prefix.prefix());
                if replace {
                    request = request.replace();
                }
                for nexthop in route.nexthops() {
                    if let Some(IpAddr::V4(gateway)) = nexthop.gateway() {
                        request = request.gateway(gateway);
                    }
                    if let Some(ifindex) = nexthop.ifindex() {
                        request = request.output_interface(ifindex as u32);
                    }
                }
                request.execute().await.map_err(map_request_error)
            }
            IpNetwork::V6(prefix) => {
                let mut request = request
                    .v6()
                    .destination_prefix(prefix.ip(), prefix.prefix());
                if replace {
                    request = request.replace();
                }
                for nexthop in route.nexthops() {
                    if let Some(IpAddr::V6(gateway)) = nexthop.gateway() {
                        request = request.gateway(gateway);
                    }
                    if let Some(ifindex) = nexthop.ifindex() {
                        request = request.output_interface(ifindex as u32);
                    }
                }
                request.execute().await.map_err(map_request_error)
            }
        }
    }

    async fn route_del(&self, route: &Route) -> Result<(), TransportError> {
        let Some(prefix) = route.destination() else {
            return Err(TransportError::Unsupported);
        };
        let mut request =
            self.handle.route().add().protocol(route.protocol_id());
        apply_route_attrs(request.message_mut(), route);
        match prefix {
            IpNetwork::V4(prefix) => {
                let mut request = request
                    .v4()
                    .destination_prefix(prefix.ip(), prefix.prefix());
                let request =
                    self.handle.route().del(request.message_mut().clone());
                request.execute().await.map_err(map_request_error)
            }
            IpNetwork::V6(prefix) => {
                let mut request = request
                    .v6()
                    .destination_prefix(prefix.ip(), prefix.prefix());
                let request =
                    self.handle.route().del(request.message_mut().clone());
                request.execute().await.map_err(map_request_error)
            }
        }
    }

    async fn label_add(&self, _route: &Route) -> Result<(), TransportError> {
        // TODO: encode label routes once the rtnetlink crate grows AF_MPLS
        // support.
        Err(TransportError::Unsupported)
    }

    async fn label_del(&self, _route: &Route) -> Result<(), TransportError> {
        Err(TransportError::Unsupported)
    }

    async fn addr_add(&self, addr: &IfAddress) -> Result<(), TransportError> {
        let Some(prefix) = addr.prefix() else {
            return Err(TransportError::Unsupported);
        };
        let mut request = self.handle.address().add(
            addr.ifindex() as u32,
            prefix.ip(),
            prefix.prefix(),
        );
        if let Some(scope) = addr.scope() {
            request.message_mut().header.scope = scope_code(scope);
        }
        request.execute().await.map_err(map_request_error)
    }

    async fn addr_del(&self, addr: &IfAddress) -> Result<(), TransportError> {
        let Some(prefix) = addr.prefix() else {
            return Err(TransportError::Unsupported);
        };
        let mut request = self.handle.address().add(
            addr.ifindex() as u32,
            prefix.ip(),
            prefix.prefix(),
        );
        if let Some(scope) = addr.scope() {
            request.message_mut().header.scope = scope_code(scope);
        }
        let request =
            self.handle.address().del(request.message_mut().clone());
        request.execute().await.map_err(map_request_error)
    }

    async fn route_dump(&self) -> Result<Vec<Route>, TransportError> {
        let mut routes = Vec::new();
        for ip_version in [IpVersion::V4, IpVersion::V6] {
            let mut stream = self.handle.route().get(ip_version).execute();
            while let Some(msg) =
                stream.try_next().await.map_err(map_request_error)?
            {
                if let Some(route) = route_from_msg(msg, true) {
                    routes.push(route);
                }
            }
        }
        Ok(routes)
    }

    async fn link_dump(&self) -> Result<Vec<Link>, TransportError> {
        let mut links = Vec::new();
        let mut stream = self.handle.link().get().execute();
        while let Some(msg) =
            stream.try_next().await.map_err(map_request_error)?
        {
            if let Some(link) = link_from_msg(msg) {
                links.push(link);
            }
        }
        Ok(links)
    }

    async fn addr_dump(&self) -> Result<Vec<IfAddress>, TransportError> {
        let mut addrs = Vec::new();
        let mut stream = self.handle.address().get().execute();
        while let Some(msg) =
            stream.try_next().await.map_err(map_request_error)?
        {
            if let Some(addr) = addr_from_msg(msg, true) {
                addrs.push(addr);
            }
        }
        Ok(addrs)
    }

    async fn neigh_dump(&self) -> Result<Vec<Neighbor>, TransportError> {
        let mut neighbors = Vec::new();
        let mut stream = self.handle.neighbours().get().execute();
        while let Some(msg) =
            stream.try_next().await.map_err(map_request_error)?
        {
            if let Some(neighbor) = neigh_from_msg(msg) {
                neighbors.push(neighbor);
            }
        }
        Ok(neighbors)
    }
}

// ===== helper functions =====

async fn monitor(
    mut messages: NetlinkMonitor,
    notifications: UnboundedSender<NetlinkNotification>,
) {
    while let Some((message, _)) = messages.next().await {
        let Some(notification) = notification_from_msg(message) else {
            continue;
        };
        if notifications.send(notification).is_err() {
            // Agent is gone.
            break;
        }
    }
}

fn notification_from_msg(
    message: NetlinkMessage<RtnlMessage>,
) -> Option<NetlinkNotification> {
    let NetlinkPayload::InnerMessage(message) = message.payload else {
        return None;
    };
    trace!(?message, "received netlink message");
    match message {
        RtnlMessage::NewRoute(msg) => {
            let action = NetlinkAction::New;
            let route = route_from_msg(msg, true)?;
            Some(NetlinkNotification::Route { route, action })
        }
        RtnlMessage::DelRoute(msg) => {
            let action = NetlinkAction::Del;
            let route = route_from_msg(msg, false)?;
            Some(NetlinkNotification::Route { route, action })
        }
        RtnlMessage::NewLink(msg) => {
            let action = NetlinkAction::New;
            let link = link_from_msg(msg)?;
            Some(NetlinkNotification::Link { link, action })
        }
        RtnlMessage::DelLink(msg) => {
            let action = NetlinkAction::Del;
            let link = link_from_msg(msg)?;
            Some(NetlinkNotification::Link { link, action })
        }
        RtnlMessage::NewAddress(msg) => {
            let action = NetlinkAction::New;
            let address = addr_from_msg(msg, true)?;
            Some(NetlinkNotification::Address { address, action })
        }
        RtnlMessage::DelAddress(msg) => {
            let action = NetlinkAction::Del;
            let address = addr_from_msg(msg, false)?;
            Some(NetlinkNotification::Address { address, action })
        }
        RtnlMessage::NewNeighbour(msg) => {
            let action = NetlinkAction::New;
            let neighbor = neigh_from_msg(msg)?;
            Some(NetlinkNotification::Neighbor { neighbor, action })
        }
        RtnlMessage::DelNeighbour(msg) => {
            let action = NetlinkAction::Del;
            let neighbor = neigh_from_msg(msg)?;
            Some(NetlinkNotification::Neighbor { neighbor, action })
        }
        _ => None,
    }
}

fn route_from_msg(msg: RouteMessage, valid: bool) -> Option<Route> {
    use netlink_packet_route::route::nlas::Nla;

    let family = msg.header.address_family as u16;
    let kind = match msg.header.kind {
        RTN_UNICAST => RouteType::Unicast,
        RTN_MULTICAST => RouteType::Multicast,
        RTN_BLACKHOLE => RouteType::Blackhole,
        _ => return None,
    };

    // Fetch route attributes.
    let mut destination = None;
    let mut gateway = None;
    let mut ifindex = None;
    let mut priority = None;
    for nla in msg.nlas.into_iter() {
        match nla {
            Nla::Destination(bytes) => {
                destination = parse_ip(family, bytes);
            }
            Nla::Gateway(bytes) => gateway = parse_ip(family, bytes),
            Nla::Oif(index) => ifindex = Some(index as i32),
            Nla::Priority(value) => priority = Some(value),
            _ => (),
        }
    }
    let destination = destination.or_else(|| match family {
        AF_INET => Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
        AF_INET6 => Some(IpAddr::V6(Ipv6Addr::UNSPECIFIED)),
        _ => None,
    })?;
    let destination =
        IpNetwork::new(destination, msg.header.destination_prefix_length)
            .ok()?;

    let mut builder = RouteBuilder::new()
        .destination(destination)
        .kind(kind)
        .table(RouteTable::new(msg.header.table))
        .protocol_id(msg.header.protocol)
        .scope(scope_from_code(msg.header.scope))
        .valid(valid);
    if !msg.header.flags.is_empty() {
        builder =
            builder.flags(RouteFlags::from_bits_truncate(msg.header.flags.bits()));
    }
    if msg.header.tos != 0 {
        builder = builder.tos(msg.header.tos);
    }
    if let Some(priority) = priority {
        builder = builder.priority(priority);
    }
    if gateway.is_some() || ifindex.is_some() {
        let mut nexthop = NextHopBuilder::new();
        if let Some(gateway) = gateway {
            nexthop = nexthop.gateway(gateway);
        }
        if let Some(ifindex) = ifindex {
            nexthop = nexthop.ifindex(ifindex);
        }
        if let Ok(nexthop) = nexthop.build() {
            builder = builder.nexthop(nexthop);
        }
    }
    Some(builder.build_unchecked())
}

fn link_from_msg(msg: LinkMessage) -> Option<Link> {
    use netlink_packet_route::link::nlas::Nla;

    // Fetch interface attributes.
    let ifindex = msg.header.index as i32;
    let loopback = msg.header.link_layer_type == ARPHRD_LOOPBACK;
    let up = msg.header.flags & IFF_RUNNING != 0;
    let mut name = None;
    for nla in msg.nlas.into_iter() {
        match nla {
            Nla::IfName(nla_ifname) => name = Some(nla_ifname),
            _ => (),
        }
    }
    Some(Link::new(name?, ifindex, up, loopback))
}

fn addr_from_msg(msg: AddressMessage, valid: bool) -> Option<IfAddress> {
    use netlink_packet_route::address::nlas::Nla;

    // Fetch address attributes.
    let ifindex = msg.header.index as i32;
    let mut addr = None;
    for nla in msg.nlas.into_iter() {
        match nla {
            Nla::Address(nla_addr) => addr = Some(nla_addr),
            _ => (),
        }
    }
    let addr = parse_ip(msg.header.family as u16, addr?)?;
    let prefix = IpNetwork::new(addr, msg.header.prefix_len).ok()?;
    Some(
        IfAddressBuilder::new()
            .ifindex(ifindex)
            .prefix(prefix)
            .scope(scope_from_code(msg.header.scope))
            .valid(valid)
            .build(),
    )
}

fn neigh_from_msg(msg: NeighbourMessage) -> Option<Neighbor> {
    use netlink_packet_route::neighbour::nlas::Nla;

    // Fetch neighbor attributes.
    let ifindex = msg.header.ifindex as i32;
    let reachable = msg.header.state & NUD_VALID != 0;
    let mut destination = None;
    let mut lladdr = None;
    for nla in msg.nlas.into_iter() {
        match nla {
            Nla::Destination(bytes) => {
                destination = parse_ip(msg.header.family as u16, bytes);
            }
            Nla::LinkLocalAddress(bytes) => {
                lladdr = bytes.try_into().ok();
            }
            _ => (),
        }
    }
    Some(Neighbor::new(ifindex, destination?, lladdr, reachable))
}

fn parse_ip(family: u16, bytes: Vec<u8>) -> Option<IpAddr> {
    match family {
        AF_INET => {
            let addr: [u8; Ipv4Addr::LENGTH] = bytes.try_into().ok()?;
            Some(Ipv4Addr::from(addr).into())
        }
        AF_INET6 => {
            let addr: [u8; Ipv6Addr::LENGTH] = bytes.try_into().ok()?;
            Some(Ipv6Addr::from(addr).into())
        }
        _ => None,
    }
}

fn kind_code(kind: RouteType) -> u8 {
    match kind {
        RouteType::Unicast => RTN_UNICAST,
        RouteType::Multicast => RTN_MULTICAST,
        RouteType::Blackhole => RTN_BLACKHOLE,
    }
}

fn scope_code(scope: RouteScope) -> u8 {
    match scope {
        RouteScope::Universe => RT_SCOPE_UNIVERSE,
        RouteScope::Site => RT_SCOPE_SITE,
        RouteScope::Link => RT_SCOPE_LINK,
        RouteScope::Host => RT_SCOPE_HOST,
        RouteScope::Nowhere => RT_SCOPE_NOWHERE,
        RouteScope::Other(code) => code,
    }
}

fn scope_from_code(code: u8) -> RouteScope {
    match code {
        RT_SCOPE_UNIVERSE => RouteScope::Universe,
        RT_SCOPE_SITE => RouteScope::Site,
        RT_SCOPE_LINK => RouteScope::Link,
        RT_SCOPE_HOST => RouteScope::Host,
        RT_SCOPE_NOWHERE => RouteScope::Nowhere,
        code => RouteScope::Other(code),
    }
}

fn map_request_error(error: rtnetlink::Error) -> TransportError {
    match error {
        rtnetlink::Error::NetlinkError(message) => match -message.code {
            ENOENT | ESRCH => TransportError::NotFound,
            EEXIST => TransportError::Exists,
            EADDRNOTAVAIL => TransportError::AddressNotFound,
            errno => TransportError::Errno(errno),
        },
        error => TransportError::Other(error.to_string()),
    }
}
