//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

pub mod error;
pub mod events;
pub mod interface;
pub mod netlink;
pub mod rib;
pub mod route;
pub mod transport;

use std::collections::BTreeMap;
use std::net::IpAddr;

use fibsync_utils::ip::AddressFamily;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::error::Error;
use crate::events::{EventFlags, EventVariant, EventsHandler, NetlinkEventType};
use crate::interface::{LinkAttrs, Links, Neighbors};
use crate::rib::{LinkRoutes, MplsRoutes, MulticastRoutes, Rib, UnicastRoutes};
use crate::route::{
    IfAddress, IfAddressBuilder, Link, Neighbor, Route, RouteFlags, RouteScope,
};
use crate::transport::{
    NetlinkAction, NetlinkNotification, NetlinkTransport,
};

pub use crate::route::DEFAULT_PROTOCOL_ID;

type Responder<T> = oneshot::Sender<Result<T, Error>>;

// Requests posted to the agent event loop. Executed in submission order;
// notifications interleave at request granularity only.
enum Request {
    RouteAdd {
        route: Route,
        responder: Responder<()>,
    },
    RouteDel {
        route: Route,
        responder: Responder<()>,
    },
    MplsRouteAdd {
        route: Route,
        responder: Responder<()>,
    },
    MplsRouteDel {
        route: Route,
        responder: Responder<()>,
    },
    SyncUnicastRoutes {
        protocol_id: u8,
        routes: UnicastRoutes,
        responder: Responder<()>,
    },
    SyncMplsRoutes {
        protocol_id: u8,
        routes: MplsRoutes,
        responder: Responder<()>,
    },
    SyncLinkRoutes {
        protocol_id: u8,
        routes: LinkRoutes,
        responder: Responder<()>,
    },
    GetUnicastRoutes {
        protocol_id: u8,
        responder: Responder<UnicastRoutes>,
    },
    GetMulticastRoutes {
        protocol_id: u8,
        responder: Responder<MulticastRoutes>,
    },
    GetLinkRoutes {
        protocol_id: u8,
        responder: Responder<LinkRoutes>,
    },
    GetMplsRoutes {
        protocol_id: u8,
        responder: Responder<MplsRoutes>,
    },
    GetRouteCount {
        responder: Responder<i64>,
    },
    GetMplsRouteCount {
        responder: Responder<i64>,
    },
    AddrAdd {
        addr: IfAddress,
        responder: Responder<()>,
    },
    AddrDel {
        addr: IfAddress,
        responder: Responder<()>,
    },
    SyncAddrs {
        ifindex: i32,
        addrs: Vec<IfAddress>,
        family: Option<AddressFamily>,
        scope: Option<RouteScope>,
        responder: Responder<()>,
    },
    GetAddrs {
        ifindex: i32,
        family: Option<AddressFamily>,
        scope: Option<RouteScope>,
        responder: Responder<Vec<IfAddress>>,
    },
    GetIfIndex {
        ifname: String,
        responder: Responder<Option<i32>>,
    },
    GetIfName {
        ifindex: i32,
        responder: Responder<Option<String>>,
    },
    GetLoopbackIfindex {
        responder: Responder<Option<i32>>,
    },
    GetLinks {
        responder: Responder<BTreeMap<String, LinkAttrs>>,
    },
    GetNeighbors {
        responder: Responder<BTreeMap<(String, IpAddr), Neighbor>>,
    },
    SubscribeEvent {
        event: NetlinkEventType,
        responder: Responder<()>,
    },
    UnsubscribeEvent {
        event: NetlinkEventType,
        responder: Responder<()>,
    },
    SubscribeAllEvents {
        responder: Responder<()>,
    },
    UnsubscribeAllEvents {
        responder: Responder<()>,
    },
    SetEventHandler {
        handler: Box<dyn EventsHandler>,
        responder: Responder<()>,
    },
}

// Handle to a running FIB agent. Cheap to clone; methods may be called from
// any task and resolve once the agent event loop has executed the request.
#[derive(Clone)]
pub struct FibAgent {
    request_tx: mpsc::UnboundedSender<Request>,
}

// Event loop state: the transport, the route cache and the link/neighbor
// caches, owned by a single task.
struct Master {
    transport: Box<dyn NetlinkTransport>,
    rib: Rib,
    links: Links,
    neighbors: Neighbors,
    event_flags: EventFlags,
    handler: Option<Box<dyn EventsHandler>>,
}

// ===== impl FibAgent =====

impl FibAgent {
    async fn request<T>(
        &self,
        make: impl FnOnce(Responder<T>) -> Request,
    ) -> Result<T, Error> {
        let (responder, response) = oneshot::channel();
        self.request_tx
            .send(make(responder))
            .map_err(|_| Error::AgentGone)?;
        response.await.map_err(|_| Error::AgentGone)?
    }

    pub async fn add_route(&self, route: Route) -> Result<(), Error> {
        self.request(|responder| Request::RouteAdd { route, responder })
            .await
    }

    pub async fn del_route(&self, route: Route) -> Result<(), Error> {
        self.request(|responder| Request::RouteDel { route, responder })
            .await
    }

    pub async fn add_mpls_route(&self, route: Route) -> Result<(), Error> {
        self.request(|responder| Request::MplsRouteAdd { route, responder })
            .await
    }

    pub async fn del_mpls_route(&self, route: Route) -> Result<(), Error> {
        self.request(|responder| Request::MplsRouteDel { route, responder })
            .await
    }

    // Replaces the kernel's per-protocol unicast subtree with the given
    // route database, computing the minimal delete/update sequence.
    pub async fn sync_unicast_routes(
        &self,
        protocol_id: u8,
        routes: UnicastRoutes,
    ) -> Result<(), Error> {
        self.request(|responder| Request::SyncUnicastRoutes {
            protocol_id,
            routes,
            responder,
        })
        .await
    }

    pub async fn sync_mpls_routes(
        &self,
        protocol_id: u8,
        routes: MplsRoutes,
    ) -> Result<(), Error> {
        self.request(|responder| Request::SyncMplsRoutes {
            protocol_id,
            routes,
            responder,
        })
        .await
    }

    pub async fn sync_link_routes(
        &self,
        protocol_id: u8,
        routes: LinkRoutes,
    ) -> Result<(), Error> {
        self.request(|responder| Request::SyncLinkRoutes {
            protocol_id,
            routes,
            responder,
        })
        .await
    }

    pub async fn get_cached_unicast_routes(
        &self,
        protocol_id: u8,
    ) -> Result<UnicastRoutes, Error> {
        self.request(|responder| Request::GetUnicastRoutes {
            protocol_id,
            responder,
        })
        .await
    }

    pub async fn get_cached_multicast_routes(
        &self,
        protocol_id: u8,
    ) -> Result<MulticastRoutes, Error> {
        self.request(|responder| Request::GetMulticastRoutes {
            protocol_id,
            responder,
        })
        .await
    }

    pub async fn get_cached_link_routes(
        &self,
        protocol_id: u8,
    ) -> Result<LinkRoutes, Error> {
        self.request(|responder| Request::GetLinkRoutes {
            protocol_id,
            responder,
        })
        .await
    }

    pub async fn get_cached_mpls_routes(
        &self,
        protocol_id: u8,
    ) -> Result<MplsRoutes, Error> {
        self.request(|responder| Request::GetMplsRoutes {
            protocol_id,
            responder,
        })
        .await
    }

    pub async fn get_route_count(&self) -> Result<i64, Error> {
        self.request(|responder| Request::GetRouteCount { responder })
            .await
    }

    pub async fn get_mpls_route_count(&self) -> Result<i64, Error> {
        self.request(|responder| Request::GetMplsRouteCount { responder })
            .await
    }

    pub async fn add_ifaddress(&self, addr: IfAddress) -> Result<(), Error> {
        self.request(|responder| Request::AddrAdd { addr, responder })
            .await
    }

    pub async fn del_ifaddress(&self, addr: IfAddress) -> Result<(), Error> {
        self.request(|responder| Request::AddrDel { addr, responder })
            .await
    }

    // Reconciles the addresses of one interface. New addresses are added
    // before deprecated ones are deleted.
    pub async fn sync_ifaddresses(
        &self,
        ifindex: i32,
        addrs: Vec<IfAddress>,
        family: Option<AddressFamily>,
        scope: Option<RouteScope>,
    ) -> Result<(), Error> {
        self.request(|responder| Request::SyncAddrs {
            ifindex,
            addrs,
            family,
            scope,
            responder,
        })
        .await
    }

    pub async fn get_ifaddrs(
        &self,
        ifindex: i32,
        family: Option<AddressFamily>,
        scope: Option<RouteScope>,
    ) -> Result<Vec<IfAddress>, Error> {
        self.request(|responder| Request::GetAddrs {
            ifindex,
            family,
            scope,
            responder,
        })
        .await
    }

    pub async fn get_ifindex(&self, ifname: &str) -> Result<Option<i32>, Error> {
        let ifname = ifname.to_owned();
        self.request(|responder| Request::GetIfIndex { ifname, responder })
            .await
    }

    pub async fn get_ifname(
        &self,
        ifindex: i32,
    ) -> Result<Option<String>, Error> {
        self.request(|responder| Request::GetIfName { ifindex, responder })
            .await
    }

    pub async fn get_loopback_ifindex(&self) -> Result<Option<i32>, Error> {
        self.request(|responder| Request::GetLoopbackIfindex { responder })
            .await
    }

    pub async fn get_all_links(
        &self,
    ) -> Result<BTreeMap<String, LinkAttrs>, Error> {
        self.request(|responder| Request::GetLinks { responder }).await
    }

    pub async fn get_all_reachable_neighbors(
        &self,
    ) -> Result<BTreeMap<(String, IpAddr), Neighbor>, Error> {
        self.request(|responder| Request::GetNeighbors { responder })
            .await
    }

    pub async fn subscribe_event(
        &self,
        event: NetlinkEventType,
    ) -> Result<(), Error> {
        self.request(|responder| Request::SubscribeEvent { event, responder })
            .await
    }

    pub async fn unsubscribe_event(
        &self,
        event: NetlinkEventType,
    ) -> Result<(), Error> {
        self.request(|responder| Request::UnsubscribeEvent {
            event,
            responder,
        })
        .await
    }

    pub async fn subscribe_all_events(&self) -> Result<(), Error> {
        self.request(|responder| Request::SubscribeAllEvents { responder })
            .await
    }

    pub async fn unsubscribe_all_events(&self) -> Result<(), Error> {
        self.request(|responder| Request::UnsubscribeAllEvents { responder })
            .await
    }

    pub async fn set_event_handler(
        &self,
        handler: impl EventsHandler + 'static,
    ) -> Result<(), Error> {
        let handler = Box::new(handler);
        self.request(|responder| Request::SetEventHandler {
            handler,
            responder,
        })
        .await
    }
}

// ===== impl Master =====

impl Master {
    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<Request>,
        mut notifications: mpsc::UnboundedReceiver<NetlinkNotification>,
    ) {
        let mut subscribed = true;
        loop {
            tokio::select! {
                // Drain pending notifications first so the caches reflect
                // every kernel event that preceded the next request.
                biased;
                notification = notifications.recv(), if subscribed => {
                    match notification {
                        Some(notification) => {
                            self.process_notification(notification)
                        }
                        None => subscribed = false,
                    }
                }
                request = requests.recv() => match request {
                    Some(request) => self.process_request(request).await,
                    // All agent handles are gone.
                    None => break,
                },
            }
        }
    }

    async fn process_request(&mut self, request: Request) {
        match request {
            Request::RouteAdd { route, responder } => {
                let result =
                    self.rib.route_add(&*self.transport, route).await;
                let _ = responder.send(result);
            }
            Request::RouteDel { route, responder } => {
                let result =
                    self.rib.route_del(&*self.transport, route).await;
                let _ = responder.send(result);
            }
            Request::MplsRouteAdd { route, responder } => {
                let result =
                    self.rib.mpls_route_add(&*self.transport, route).await;
                let _ = responder.send(result);
            }
            Request::MplsRouteDel { route, responder } => {
                let result =
                    self.rib.mpls_route_del(&*self.transport, route).await;
                let _ = responder.send(result);
            }
            Request::SyncUnicastRoutes {
                protocol_id,
                routes,
                responder,
            } => {
                let result = self
                    .rib
                    .sync_unicast(&*self.transport, protocol_id, routes)
                    .await;
                let _ = responder.send(result);
            }
            Request::SyncMplsRoutes {
                protocol_id,
                routes,
                responder,
            } => {
                let result = self
                    .rib
                    .sync_mpls(&*self.transport, protocol_id, routes)
                    .await;
                let _ = responder.send(result);
            }
            Request::SyncLinkRoutes {
                protocol_id,
                routes,
                responder,
            } => {
                let result = self
                    .rib
                    .sync_link(&*self.transport, protocol_id, routes)
                    .await;
                let _ = responder.send(result);
            }
            Request::GetUnicastRoutes {
                protocol_id,
                responder,
            } => {
                let _ = responder.send(Ok(self.rib.unicast_routes(protocol_id)));
            }
            Request::GetMulticastRoutes {
                protocol_id,
                responder,
            } => {
                let _ = responder.send(Ok(self.rib.mcast_routes(protocol_id)));
            }
            Request::GetLinkRoutes {
                protocol_id,
                responder,
            } => {
                let _ = responder.send(Ok(self.rib.link_routes(protocol_id)));
            }
            Request::GetMplsRoutes {
                protocol_id,
                responder,
            } => {
                let _ = responder.send(Ok(self.rib.mpls_routes(protocol_id)));
            }
            Request::GetRouteCount { responder } => {
                let _ = responder.send(Ok(self.rib.route_count()));
            }
            Request::GetMplsRouteCount { responder } => {
                let _ = responder.send(Ok(self.rib.mpls_route_count()));
            }
            Request::AddrAdd { addr, responder } => {
                let result = self.addr_add(&addr).await;
                let _ = responder.send(result);
            }
            Request::AddrDel { addr, responder } => {
                let result = self.addr_del(&addr).await;
                let _ = responder.send(result);
            }
            Request::SyncAddrs {
                ifindex,
                addrs,
                family,
                scope,
                responder,
            } => {
                let result =
                    self.sync_ifaddrs(ifindex, addrs, family, scope).await;
                let _ = responder.send(result);
            }
            Request::GetAddrs {
                ifindex,
                family,
                scope,
                responder,
            } => {
                let result = self.get_ifaddrs(ifindex, family, scope).await;
                let _ = responder.send(result);
            }
            Request::GetIfIndex { ifname, responder } => {
                let _ = responder.send(Ok(self.links.get_ifindex(&ifname)));
            }
            Request::GetIfName { ifindex, responder } => {
                let _ = responder.send(Ok(self.links.get_ifname(ifindex)));
            }
            Request::GetLoopbackIfindex { responder } => {
                let _ = responder.send(Ok(self.links.loopback_ifindex()));
            }
            Request::GetLinks { responder } => {
                let mut result = Ok(());
                // Neighbors resolve interface names through the link cache.
                result = result.and(self.update_link_cache().await);
                result = result.and(self.update_addr_cache().await);
                let _ = responder
                    .send(result.map(|_| self.links.snapshot()));
            }
            Request::GetNeighbors { responder } => {
                let mut result = Ok(());
                result = result.and(self.update_link_cache().await);
                result = result.and(self.update_addr_cache().await);
                result = result.and(self.update_neighbor_cache().await);
                let _ = responder
                    .send(result.map(|_| self.neighbors.snapshot()));
            }
            Request::SubscribeEvent { event, responder } => {
                let result = self.subscribe_event(event);
                let _ = responder.send(result);
            }
            Request::UnsubscribeEvent { event, responder } => {
                self.event_flags.remove(event.flag());
                let _ = responder.send(Ok(()));
            }
            Request::SubscribeAllEvents { responder } => {
                for event in [
                    NetlinkEventType::Route,
                    NetlinkEventType::Link,
                    NetlinkEventType::Address,
                    NetlinkEventType::Neighbor,
                ] {
                    if let Err(error) = self.subscribe_event(event) {
                        error.log();
                    }
                }
                let _ = responder.send(Ok(()));
            }
            Request::UnsubscribeAllEvents { responder } => {
                self.event_flags = EventFlags::empty();
                let _ = responder.send(Ok(()));
            }
            Request::SetEventHandler { handler, responder } => {
                self.handler = Some(handler);
                let _ = responder.send(Ok(()));
            }
        }
    }

    fn subscribe_event(&mut self, event: NetlinkEventType) -> Result<(), Error> {
        // The message-codec transport does not surface route events through
        // its caches; reject the subscription instead of silently starving
        // the handler.
        if event == NetlinkEventType::Route
            && !self.transport.capabilities().route_events
        {
            return Err(Error::RouteEventsUnsupported);
        }
        self.event_flags.insert(event.flag());
        Ok(())
    }

    // ===== notification handling =====

    fn process_notification(&mut self, notification: NetlinkNotification) {
        match notification {
            NetlinkNotification::Route { route, action } => {
                self.handle_route_event(route, action, true, false);
            }
            NetlinkNotification::Link { link, action } => {
                self.handle_link_event(link, action, true);
            }
            NetlinkNotification::Address { address, action } => {
                self.handle_addr_event(address, action, true);
            }
            NetlinkNotification::Neighbor { neighbor, action } => {
                self.handle_neigh_event(neighbor, action, true);
            }
        }
    }

    fn handle_route_event(
        &mut self,
        route: Route,
        action: NetlinkAction,
        run_handler: bool,
        update_unicast: bool,
    ) {
        // Skip cloned entries and any routes not in the main table.
        if !route.table().is_main()
            || route
                .flags()
                .unwrap_or_default()
                .contains(RouteFlags::CLONED)
        {
            return;
        }
        let Some(prefix) = route.destination() else {
            return;
        };

        let mut event_ifname = None;
        if prefix.ip().is_multicast() {
            // Multicast routes do not belong to our protocol; keep a local
            // copy and move on.
            let Some(ifname) = self.interface_route_key(&route) else {
                return;
            };
            event_ifname = Some(ifname.clone());
            self.rib.fold_multicast((prefix, ifname), route.clone());
        } else if route.scope() == RouteScope::Link {
            let Some(ifname) = self.interface_route_key(&route) else {
                return;
            };
            event_ifname = Some(ifname.clone());
            self.rib.fold_link_scope((prefix, ifname), route.clone());
        } else if update_unicast {
            // Live notifications leave the unicast partition to the mutation
            // engine; only refresh walks rebuild it.
            self.rib.fold_unicast(prefix, route.clone());
        }

        if run_handler && self.event_flags.contains(EventFlags::ROUTE) {
            let ifname = event_ifname
                .or_else(|| route.ifname().map(str::to_owned))
                .unwrap_or_default();
            if let Some(handler) = self.handler.as_mut() {
                handler.handle_event(
                    &ifname,
                    action,
                    EventVariant::Route(route),
                );
            }
        }
    }

    // Resolves the output interface name of a multicast or link scope
    // route, which must carry exactly one nexthop with an ifindex.
    fn interface_route_key(&self, route: &Route) -> Option<String> {
        let Some(ifindex) = route.single_ifindex_nexthop() else {
            error!(%route, "unexpected nexthops for interface route");
            return None;
        };
        let Some(ifname) = self.links.get_ifname(ifindex) else {
            warn!(%route, ifindex, "unknown output interface");
            return None;
        };
        Some(ifname)
    }

    fn handle_link_event(
        &mut self,
        link: Link,
        action: NetlinkAction,
        run_handler: bool,
    ) {
        self.links.update(&link);
        if !link.up {
            // Any neighbor behind a downed interface is gone.
            self.neighbors.purge_interface(&link.name);
        }

        if run_handler && self.event_flags.contains(EventFlags::LINK) {
            let ifname = link.name.clone();
            if let Some(handler) = self.handler.as_mut() {
                handler.handle_event(
                    &ifname,
                    action,
                    EventVariant::Link(link),
                );
            }
        }
    }

    fn handle_addr_event(
        &mut self,
        address: IfAddress,
        action: NetlinkAction,
        run_handler: bool,
    ) {
        let Some(prefix) = address.prefix() else {
            warn!("address event without prefix");
            return;
        };
        let Some(ifname) = self.links.get_ifname(address.ifindex()) else {
            debug!(ifindex = address.ifindex(), "address event for unknown interface");
            return;
        };
        if address.is_valid() {
            self.links.addr_add(&ifname, prefix);
        } else {
            self.links.addr_del(&ifname, prefix);
        }

        if run_handler && self.event_flags.contains(EventFlags::ADDR) {
            if let Some(handler) = self.handler.as_mut() {
                handler.handle_event(
                    &ifname,
                    action,
                    EventVariant::Address(address),
                );
            }
        }
    }

    fn handle_neigh_event(
        &mut self,
        neighbor: Neighbor,
        action: NetlinkAction,
        run_handler: bool,
    ) {
        let Some(ifname) = self.links.get_ifname(neighbor.ifindex) else {
            debug!(ifindex = neighbor.ifindex, "neighbor event for unknown interface");
            return;
        };
        let key = (ifname.clone(), neighbor.destination);
        self.neighbors.remove(&key);
        if action != NetlinkAction::Del && neighbor.reachable {
            self.neighbors.insert(key, neighbor.clone());
        }

        if run_handler && self.event_flags.contains(EventFlags::NEIGH) {
            if let Some(handler) = self.handler.as_mut() {
                handler.handle_event(
                    &ifname,
                    action,
                    EventVariant::Neighbor(neighbor),
                );
            }
        }
    }

    // ===== cache refresh =====

    // Refresh walks rescan the kernel's current objects without delivering
    // synthetic events to the caller's handler.

    async fn refresh_caches(&mut self) {
        for result in [
            self.update_link_cache().await,
            self.update_addr_cache().await,
            self.update_neighbor_cache().await,
            self.update_route_cache().await,
        ] {
            if let Err(error) = result {
                error.log();
            }
        }
    }

    async fn update_link_cache(&mut self) -> Result<(), Error> {
        let links = self
            .transport
            .link_dump()
            .await
            .map_err(Error::KernelDumpFailed)?;
        for link in links {
            self.handle_link_event(link, NetlinkAction::Get, false);
        }
        Ok(())
    }

    async fn update_addr_cache(&mut self) -> Result<(), Error> {
        let addrs = self
            .transport
            .addr_dump()
            .await
            .map_err(Error::KernelDumpFailed)?;
        for addr in addrs {
            self.handle_addr_event(addr, NetlinkAction::Get, false);
        }
        Ok(())
    }

    async fn update_neighbor_cache(&mut self) -> Result<(), Error> {
        let neighbors = self
            .transport
            .neigh_dump()
            .await
            .map_err(Error::KernelDumpFailed)?;
        for neighbor in neighbors {
            self.handle_neigh_event(neighbor, NetlinkAction::Get, false);
        }
        Ok(())
    }

    async fn update_route_cache(&mut self) -> Result<(), Error> {
        let routes = self
            .transport
            .route_dump()
            .await
            .map_err(Error::KernelDumpFailed)?;
        for route in routes {
            self.handle_route_event(route, NetlinkAction::Get, false, true);
        }
        Ok(())
    }

    // ===== interface addresses =====

    async fn addr_add(&self, addr: &IfAddress) -> Result<(), Error> {
        if addr.prefix().is_none() {
            return Err(Error::MissingPrefix);
        }
        match self.transport.addr_add(addr).await {
            // A duplicated address is treated as success for backward
            // compatibility.
            Ok(()) | Err(crate::transport::TransportError::Exists) => Ok(()),
            Err(error) => {
                error!(%error, "failed to add address");
                Err(Error::KernelAddFailed(error))
            }
        }
    }

    async fn addr_del(&self, addr: &IfAddress) -> Result<(), Error> {
        if addr.prefix().is_none() {
            return Err(Error::MissingPrefix);
        }
        match self.transport.addr_del(addr).await {
            // Deleting an address that is not assigned is treated as
            // success for backward compatibility.
            Ok(())
            | Err(crate::transport::TransportError::AddressNotFound) => Ok(()),
            Err(error) => {
                error!(%error, "failed to delete address");
                Err(Error::KernelDeleteFailed(error))
            }
        }
    }

    async fn get_ifaddrs(
        &self,
        ifindex: i32,
        family: Option<AddressFamily>,
        scope: Option<RouteScope>,
    ) -> Result<Vec<IfAddress>, Error> {
        let addrs = self
            .transport
            .addr_dump()
            .await
            .map_err(Error::KernelDumpFailed)?;
        Ok(addrs
            .into_iter()
            .filter(|addr| {
                addr.ifindex() == ifindex
                    && family
                        .map_or(true, |family| addr.family() == Some(family))
                    && scope.map_or(true, |scope| addr.scope() == Some(scope))
            })
            .collect())
    }

    async fn sync_ifaddrs(
        &mut self,
        ifindex: i32,
        addrs: Vec<IfAddress>,
        family: Option<AddressFamily>,
        scope: Option<RouteScope>,
    ) -> Result<(), Error> {
        // Check ifindex and prefix consistency.
        let mut new_prefixes = Vec::new();
        for addr in &addrs {
            if addr.ifindex() != ifindex {
                return Err(Error::InconsistentIfIndex);
            }
            let Some(prefix) = addr.prefix() else {
                return Err(Error::MissingPrefix);
            };
            new_prefixes.push(prefix);
        }

        let old_addrs = self.get_ifaddrs(ifindex, family, scope).await?;

        // Add first: deleting the only address of an interface brings the
        // link down.
        for addr in &addrs {
            self.addr_add(addr).await?;
        }

        // Delete deprecated addresses.
        for old_addr in old_addrs {
            let Some(prefix) = old_addr.prefix() else {
                continue;
            };
            if new_prefixes.contains(&prefix) {
                continue;
            }
            let mut builder =
                IfAddressBuilder::new().ifindex(ifindex).prefix(prefix);
            if let Some(scope) = scope {
                builder = builder.scope(scope);
            }
            self.addr_del(&builder.build()).await?;
        }
        Ok(())
    }
}

// ===== global functions =====

// Starts the agent event loop on the current tokio runtime and returns a
// handle to it. The transport's current kernel state is loaded into the
// caches before the first request is served.
pub fn start<T>(mut transport: T) -> Result<FibAgent, Error>
where
    T: NetlinkTransport + 'static,
{
    let notifications = transport
        .take_event_stream()
        .ok_or(Error::TransportInitFailed)?;
    let (request_tx, request_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut master = Master {
            transport: Box::new(transport),
            rib: Default::default(),
            links: Default::default(),
            neighbors: Default::default(),
            event_flags: EventFlags::empty(),
            handler: None,
        };

        // Reload kernel state to avoid re-adding routes that already exist.
        master.refresh_caches().await;

        master.run(request_rx, notifications).await;
    });

    Ok(FibAgent { request_tx })
}
