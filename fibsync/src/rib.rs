//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;

use fibsync_utils::ip::IpAddrExt;
use fibsync_utils::mpls::Label;
use ipnetwork::IpNetwork;
use tracing::{debug, error, info, warn};

use crate::error::Error;
use crate::route::{Route, RouteType};
use crate::transport::{NetlinkTransport, TransportError};

// Per-protocol route databases, as exchanged with callers.
pub type UnicastRoutes = BTreeMap<IpNetwork, Route>;
pub type MulticastRoutes = BTreeMap<(IpNetwork, String), Route>;
pub type LinkRoutes = BTreeMap<(IpNetwork, String), Route>;
pub type MplsRoutes = BTreeMap<Label, Route>;

// In-memory image of the kernel FIB, partitioned by route family and keyed
// first by the protocol ID that installed each route. Only main-table,
// non-cloned routes are ever stored.
#[derive(Debug, Default)]
pub(crate) struct Rib {
    unicast: BTreeMap<u8, UnicastRoutes>,
    mcast: BTreeMap<u8, MulticastRoutes>,
    link: BTreeMap<u8, LinkRoutes>,
    mpls: BTreeMap<u8, MplsRoutes>,
}

// ===== impl Rib =====

impl Rib {
    // ===== mutation engine =====

    pub(crate) async fn route_add(
        &mut self,
        transport: &dyn NetlinkTransport,
        route: Route,
    ) -> Result<(), Error> {
        match route.kind() {
            RouteType::Unicast | RouteType::Blackhole => {
                self.add_update_unicast(transport, route).await
            }
            RouteType::Multicast => self.add_multicast(transport, route).await,
        }
    }

    pub(crate) async fn route_del(
        &mut self,
        transport: &dyn NetlinkTransport,
        route: Route,
    ) -> Result<(), Error> {
        match route.kind() {
            RouteType::Unicast | RouteType::Blackhole => {
                self.del_unicast(transport, route).await
            }
            RouteType::Multicast => self.del_multicast(transport, route).await,
        }
    }

    async fn add_update_unicast(
        &mut self,
        transport: &dyn NetlinkTransport,
        route: Route,
    ) -> Result<(), Error> {
        let prefix = check_unicast_route(&route)?;
        let routes = self.unicast.entry(route.protocol_id()).or_default();

        if let Some(old) = routes.get(&prefix) {
            // Same route, nothing to program.
            if *old == route {
                return Ok(());
            }

            // The IPv6 kernel path does not reliably replace a route in
            // place when attributes differ; the stale route would linger and
            // destabilize netdev teardown. Delete it explicitly first.
            if prefix.is_ipv6() {
                match transport.route_del(old).await {
                    Ok(()) | Err(TransportError::NotFound) => (),
                    Err(error) => {
                        error!(%prefix, %error, "failed to delete stale route");
                        return Err(Error::KernelDeleteFailed(error));
                    }
                }
            }
        }
        routes.remove(&prefix);

        if let Err(error) = transport.route_add(&route, true).await {
            error!(%prefix, %error, "failed to add route");
            return Err(Error::KernelAddFailed(error));
        }
        routes.insert(prefix, route);
        Ok(())
    }

    async fn del_unicast(
        &mut self,
        transport: &dyn NetlinkTransport,
        route: Route,
    ) -> Result<(), Error> {
        let prefix = check_unicast_route(&route)?;
        let routes = self.unicast.entry(route.protocol_id()).or_default();
        if !routes.contains_key(&prefix) {
            debug!(%prefix, "deleting route not present in the cache");
            return Ok(());
        }

        match transport.route_del(&route).await {
            // The kernel withdraws routes on its own when an interface goes
            // down; a missing object is not a failure.
            Ok(()) | Err(TransportError::NotFound) => (),
            Err(error) => {
                error!(%prefix, %error, "failed to delete route");
                return Err(Error::KernelDeleteFailed(error));
            }
        }
        routes.remove(&prefix);
        Ok(())
    }

    async fn add_multicast(
        &mut self,
        transport: &dyn NetlinkTransport,
        route: Route,
    ) -> Result<(), Error> {
        let (prefix, ifname) = check_multicast_route(&route)?;
        let routes = self.mcast.entry(route.protocol_id()).or_default();
        let key = (prefix, ifname.clone());
        if routes.contains_key(&key) {
            // Could have been installed by the kernel or another agent.
            warn!(%prefix, %ifname, "multicast route already exists");
            return Ok(());
        }

        debug!(%prefix, %ifname, "adding multicast route");
        if let Err(error) = transport.route_add(&route, false).await {
            error!(%prefix, %ifname, %error, "failed to add multicast route");
            return Err(Error::KernelAddFailed(error));
        }
        routes.insert(key, route);
        Ok(())
    }

    async fn del_multicast(
        &mut self,
        transport: &dyn NetlinkTransport,
        route: Route,
    ) -> Result<(), Error> {
        let (prefix, ifname) = check_multicast_route(&route)?;
        let routes = self.mcast.entry(route.protocol_id()).or_default();
        let key = (prefix, ifname.clone());
        let Some(cached) = routes.get(&key) else {
            warn!(%prefix, %ifname, "multicast route does not exist");
            return Ok(());
        };

        debug!(%prefix, %ifname, "deleting multicast route");
        if let Err(error) = transport.route_del(cached).await {
            error!(%prefix, %ifname, %error, "failed to delete multicast route");
            return Err(Error::KernelDeleteFailed(error));
        }
        routes.remove(&key);
        Ok(())
    }

    pub(crate) async fn mpls_route_add(
        &mut self,
        transport: &dyn NetlinkTransport,
        route: Route,
    ) -> Result<(), Error> {
        if !transport.capabilities().mpls {
            warn!("label programming not supported by this transport");
            return Ok(());
        }
        let label = check_mpls_route(&route)?;

        let routes = self.mpls.entry(route.protocol_id()).or_default();
        // Same route, nothing to program.
        if routes.get(&label) == Some(&route) {
            return Ok(());
        }
        routes.remove(&label);

        if let Err(error) = transport.label_add(&route).await {
            error!(%label, %error, "failed to add MPLS route");
            return Err(Error::KernelAddFailed(error));
        }
        routes.insert(label, route);
        Ok(())
    }

    pub(crate) async fn mpls_route_del(
        &mut self,
        transport: &dyn NetlinkTransport,
        route: Route,
    ) -> Result<(), Error> {
        if !transport.capabilities().mpls {
            warn!("label programming not supported by this transport");
            return Ok(());
        }
        let label = check_mpls_route(&route)?;

        let routes = self.mpls.entry(route.protocol_id()).or_default();
        if !routes.contains_key(&label) {
            debug!(%label, "deleting label not present in the cache");
            return Ok(());
        }

        match transport.label_del(&route).await {
            Ok(()) | Err(TransportError::NotFound) => (),
            Err(error) => {
                error!(%label, %error, "failed to delete MPLS route");
                return Err(Error::KernelDeleteFailed(error));
            }
        }
        routes.remove(&label);
        Ok(())
    }

    // ===== reconcilers =====

    // Moves the kernel's per-protocol unicast subtree to the given database:
    // stale prefixes are withdrawn first, then every database entry is
    // added or updated (unchanged routes are no-ops).
    pub(crate) async fn sync_unicast(
        &mut self,
        transport: &dyn NetlinkTransport,
        protocol_id: u8,
        db: UnicastRoutes,
    ) -> Result<(), Error> {
        info!(protocol_id, routes = db.len(), "syncing unicast routes");
        let routes = self.unicast.entry(protocol_id).or_default();
        let to_delete = routes
            .iter()
            .filter(|(prefix, _)| !db.contains_key(prefix))
            .map(|(_, route)| route.clone())
            .collect::<Vec<_>>();

        debug!(count = to_delete.len(), "sync: deleting stale routes");
        for route in to_delete {
            self.del_unicast(transport, route).await?;
        }
        for route in db.into_values() {
            self.add_update_unicast(transport, route).await?;
        }
        Ok(())
    }

    pub(crate) async fn sync_mpls(
        &mut self,
        transport: &dyn NetlinkTransport,
        protocol_id: u8,
        db: MplsRoutes,
    ) -> Result<(), Error> {
        info!(protocol_id, routes = db.len(), "syncing MPLS routes");
        let routes = self.mpls.entry(protocol_id).or_default();
        let to_delete = routes
            .iter()
            .filter(|(label, _)| !db.contains_key(label))
            .map(|(_, route)| route.clone())
            .collect::<Vec<_>>();

        debug!(count = to_delete.len(), "sync: deleting stale routes");
        for route in to_delete {
            self.mpls_route_del(transport, route).await?;
        }
        for route in db.into_values() {
            self.mpls_route_add(transport, route).await?;
        }
        Ok(())
    }

    // Link scope routes are keyed by prefix and interface; entries already
    // present are left untouched in the kernel (no replace).
    pub(crate) async fn sync_link(
        &mut self,
        transport: &dyn NetlinkTransport,
        protocol_id: u8,
        db: LinkRoutes,
    ) -> Result<(), Error> {
        info!(protocol_id, routes = db.len(), "syncing link scope routes");
        let routes = self.link.entry(protocol_id).or_default();
        let to_delete = routes
            .iter()
            .filter(|(key, _)| !db.contains_key(key))
            .map(|(key, route)| (key.clone(), route.clone()))
            .collect::<Vec<_>>();

        for ((prefix, ifname), route) in to_delete {
            if let Err(error) = transport.route_del(&route).await {
                error!(%prefix, %ifname, %error, "failed to delete link scope route");
                return Err(Error::KernelDeleteFailed(error));
            }
            routes.remove(&(prefix, ifname));
        }
        for (key, route) in db {
            if routes.contains_key(&key) {
                routes.insert(key, route);
                continue;
            }
            if let Err(error) = transport.route_add(&route, false).await {
                let (prefix, ifname) = &key;
                error!(%prefix, %ifname, %error, "failed to add link scope route");
                return Err(Error::KernelAddFailed(error));
            }
            routes.insert(key, route);
        }
        Ok(())
    }

    // ===== notification folds =====

    // Each fold erases the key and re-inserts the route when it is still
    // valid, so a DEL followed by a NEW leaves exactly the latest object.

    pub(crate) fn fold_unicast(&mut self, prefix: IpNetwork, route: Route) {
        let routes = self.unicast.entry(route.protocol_id()).or_default();
        routes.remove(&prefix);
        if route.is_valid() {
            routes.insert(prefix, route);
        }
    }

    pub(crate) fn fold_multicast(
        &mut self,
        key: (IpNetwork, String),
        route: Route,
    ) {
        let routes = self.mcast.entry(route.protocol_id()).or_default();
        routes.remove(&key);
        if route.is_valid() {
            routes.insert(key, route);
        }
    }

    pub(crate) fn fold_link_scope(
        &mut self,
        key: (IpNetwork, String),
        route: Route,
    ) {
        let routes = self.link.entry(route.protocol_id()).or_default();
        routes.remove(&key);
        if route.is_valid() {
            routes.insert(key, route);
        }
    }

    // ===== snapshots =====

    pub(crate) fn unicast_routes(&self, protocol_id: u8) -> UnicastRoutes {
        self.unicast.get(&protocol_id).cloned().unwrap_or_default()
    }

    pub(crate) fn mcast_routes(&self, protocol_id: u8) -> MulticastRoutes {
        self.mcast.get(&protocol_id).cloned().unwrap_or_default()
    }

    pub(crate) fn link_routes(&self, protocol_id: u8) -> LinkRoutes {
        self.link.get(&protocol_id).cloned().unwrap_or_default()
    }

    pub(crate) fn mpls_routes(&self, protocol_id: u8) -> MplsRoutes {
        self.mpls.get(&protocol_id).cloned().unwrap_or_default()
    }

    pub(crate) fn route_count(&self) -> i64 {
        self.unicast.values().map(|routes| routes.len() as i64).sum()
    }

    pub(crate) fn mpls_route_count(&self) -> i64 {
        self.mpls.values().map(|routes| routes.len() as i64).sum()
    }
}

// ===== helper functions =====

// Invariant check for unicast and blackhole routes: the destination must be
// neither multicast nor link-local.
fn check_unicast_route(route: &Route) -> Result<IpNetwork, Error> {
    let Some(prefix) = route.destination() else {
        return Err(Error::MissingDestination);
    };
    if prefix.ip().is_multicast() || prefix.ip().is_link_local() {
        return Err(Error::InvalidUnicastRoute(prefix));
    }
    Ok(prefix)
}

// Invariant check for multicast routes: multicast destination, interface
// name set, and a single nexthop carrying the output interface.
fn check_multicast_route(route: &Route) -> Result<(IpNetwork, String), Error> {
    let Some(prefix) = route.destination() else {
        return Err(Error::MissingDestination);
    };
    if !prefix.ip().is_multicast()
        || route.single_ifindex_nexthop().is_none()
    {
        return Err(Error::InvalidMulticastRoute(prefix));
    }
    let Some(ifname) = route.ifname() else {
        return Err(Error::InvalidMulticastRoute(prefix));
    };
    Ok((prefix, ifname.to_owned()))
}

// MPLS routes are unicast label routes; anything else is unsupported.
fn check_mpls_route(route: &Route) -> Result<Label, Error> {
    if route.kind() != RouteType::Unicast {
        return Err(Error::UnsupportedRouteType(route.kind()));
    }
    route.mpls_label().ok_or(Error::InvalidMplsRoute)
}
