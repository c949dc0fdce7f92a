//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

mod common;

use common::*;
use const_addrs::{ip, net};
use fibsync::error::Error;
use fibsync::route::{
    IfAddressBuilder, NextHopBuilder, RouteBuilder, RouteType,
    DEFAULT_PROTOCOL_ID,
};
use fibsync::transport::{TransportCapabilities, TransportError};
use fibsync_utils::mpls::Label;
use maplit::btreemap;

#[tokio::test]
async fn unicast_add_replace_v4() {
    let (transport, stub) = stub_transport(full_capabilities());
    let agent = fibsync::start(transport).unwrap();

    // First add programs one route with the replace flag.
    let route = unicast_route(net!("10.0.0.0/24"), ip!("10.0.0.1"), 2);
    agent.add_route(route.clone()).await.unwrap();
    assert_eq!(
        stub.state.ops(),
        vec![Op::RouteAdd {
            route: route.clone(),
            replace: true
        }]
    );
    assert_eq!(agent.get_route_count().await.unwrap(), 1);

    // Re-adding the same route is a no-op.
    agent.add_route(route.clone()).await.unwrap();
    assert_eq!(stub.state.ops().len(), 1);
    assert_eq!(agent.get_route_count().await.unwrap(), 1);

    // A changed nexthop is programmed as a plain replace, with no
    // preceding delete on IPv4.
    let updated = unicast_route(net!("10.0.0.0/24"), ip!("10.0.0.2"), 2);
    agent.add_route(updated.clone()).await.unwrap();
    assert_eq!(
        stub.state.ops(),
        vec![
            Op::RouteAdd {
                route,
                replace: true
            },
            Op::RouteAdd {
                route: updated.clone(),
                replace: true
            },
        ]
    );
    let routes = agent
        .get_cached_unicast_routes(DEFAULT_PROTOCOL_ID)
        .await
        .unwrap();
    assert_eq!(routes, btreemap! { net!("10.0.0.0/24") => updated });
}

#[tokio::test]
async fn unicast_replace_v6_predeletes() {
    let (transport, stub) = stub_transport(full_capabilities());
    let agent = fibsync::start(transport).unwrap();

    let route = unicast_route(net!("2001:db8::/64"), ip!("2001:db8::1"), 3);
    agent.add_route(route.clone()).await.unwrap();
    stub.state.clear_ops();

    // Replacing an IPv6 route deletes the cached route before the add.
    let updated = unicast_route(net!("2001:db8::/64"), ip!("2001:db8::2"), 3);
    agent.add_route(updated.clone()).await.unwrap();
    assert_eq!(
        stub.state.ops(),
        vec![
            Op::RouteDel { route },
            Op::RouteAdd {
                route: updated.clone(),
                replace: true
            },
        ]
    );
    let routes = agent
        .get_cached_unicast_routes(DEFAULT_PROTOCOL_ID)
        .await
        .unwrap();
    assert_eq!(routes, btreemap! { net!("2001:db8::/64") => updated });
}

#[tokio::test]
async fn unicast_v6_predelete_masks_notfound() {
    let (transport, stub) = stub_transport(full_capabilities());
    let agent = fibsync::start(transport).unwrap();

    let route = unicast_route(net!("2001:db8::/64"), ip!("2001:db8::1"), 3);
    agent.add_route(route).await.unwrap();

    // The kernel may have withdrawn the route on its own already.
    *stub.state.route_del_error.lock().unwrap() =
        Some(TransportError::NotFound);
    let updated = unicast_route(net!("2001:db8::/64"), ip!("2001:db8::2"), 3);
    agent.add_route(updated.clone()).await.unwrap();
    let routes = agent
        .get_cached_unicast_routes(DEFAULT_PROTOCOL_ID)
        .await
        .unwrap();
    assert_eq!(routes, btreemap! { net!("2001:db8::/64") => updated });
}

#[tokio::test]
async fn unicast_delete_idempotence() {
    let (transport, stub) = stub_transport(full_capabilities());
    let agent = fibsync::start(transport).unwrap();

    // Deleting a route that is not cached succeeds without touching the
    // kernel.
    let route = unicast_route(net!("10.0.0.0/24"), ip!("10.0.0.1"), 2);
    agent.del_route(route.clone()).await.unwrap();
    assert!(stub.state.ops().is_empty());

    agent.add_route(route.clone()).await.unwrap();
    stub.state.clear_ops();
    agent.del_route(route.clone()).await.unwrap();
    assert_eq!(stub.state.ops(), vec![Op::RouteDel { route }]);
    assert_eq!(agent.get_route_count().await.unwrap(), 0);
}

#[tokio::test]
async fn unicast_delete_masks_notfound() {
    let (transport, stub) = stub_transport(full_capabilities());
    let agent = fibsync::start(transport).unwrap();

    let route = unicast_route(net!("10.0.0.0/24"), ip!("10.0.0.1"), 2);
    agent.add_route(route.clone()).await.unwrap();

    *stub.state.route_del_error.lock().unwrap() =
        Some(TransportError::NotFound);
    agent.del_route(route).await.unwrap();
    assert_eq!(agent.get_route_count().await.unwrap(), 0);
}

#[tokio::test]
async fn unicast_add_failure_leaves_cache_empty() {
    let (transport, stub) = stub_transport(full_capabilities());
    let agent = fibsync::start(transport).unwrap();

    *stub.state.route_add_error.lock().unwrap() =
        Some(TransportError::Errno(22));
    let route = unicast_route(net!("10.0.0.0/24"), ip!("10.0.0.1"), 2);
    let error = agent.add_route(route).await.unwrap_err();
    assert!(matches!(error, Error::KernelAddFailed(_)));
    assert_eq!(agent.get_route_count().await.unwrap(), 0);
}

#[tokio::test]
async fn unicast_rejects_invalid_destination() {
    let (transport, _stub) = stub_transport(full_capabilities());
    let agent = fibsync::start(transport).unwrap();

    // The builder refuses multicast and link-local destinations outright.
    let nexthop = NextHopBuilder::new().ifindex(2).build().unwrap();
    assert!(matches!(
        RouteBuilder::new()
            .destination(net!("239.1.1.0/24"))
            .nexthop(nexthop)
            .build(),
        Err(Error::InvalidUnicastRoute(_))
    ));

    // The mutation engine re-checks routes built from raw kernel state.
    let route = RouteBuilder::new()
        .destination(net!("fe80::/64"))
        .nexthop(nexthop)
        .build_unchecked();
    assert!(matches!(
        agent.add_route(route).await,
        Err(Error::InvalidUnicastRoute(_))
    ));
}

#[tokio::test]
async fn sync_unicast_computes_minimal_diff() {
    let (transport, stub) = stub_transport(full_capabilities());
    let agent = fibsync::start(transport).unwrap();

    let route_a = unicast_route(net!("10.1.0.0/24"), ip!("10.0.0.1"), 2);
    let route_b = unicast_route(net!("10.2.0.0/24"), ip!("10.0.0.1"), 2);
    let route_c = unicast_route(net!("10.3.0.0/24"), ip!("10.0.0.1"), 2);
    for route in [&route_a, &route_b, &route_c] {
        agent.add_route(route.clone()).await.unwrap();
    }
    stub.state.clear_ops();

    // B changes nexthop, A disappears, D is new, C is untouched.
    let route_b2 = unicast_route(net!("10.2.0.0/24"), ip!("10.0.0.2"), 2);
    let route_d = unicast_route(net!("10.4.0.0/24"), ip!("10.0.0.1"), 2);
    let db = btreemap! {
        net!("10.2.0.0/24") => route_b2.clone(),
        net!("10.3.0.0/24") => route_c.clone(),
        net!("10.4.0.0/24") => route_d.clone(),
    };
    agent
        .sync_unicast_routes(DEFAULT_PROTOCOL_ID, db.clone())
        .await
        .unwrap();

    // Stale routes are deleted before the database is applied; unchanged
    // routes do not reach the transport.
    assert_eq!(
        stub.state.ops(),
        vec![
            Op::RouteDel { route: route_a },
            Op::RouteAdd {
                route: route_b2,
                replace: true
            },
            Op::RouteAdd {
                route: route_d,
                replace: true
            },
        ]
    );

    // The cache now key-equals the database.
    let routes = agent
        .get_cached_unicast_routes(DEFAULT_PROTOCOL_ID)
        .await
        .unwrap();
    assert_eq!(routes, db);
}

#[tokio::test]
async fn sync_unicast_isolated_per_protocol() {
    let (transport, _stub) = stub_transport(full_capabilities());
    let agent = fibsync::start(transport).unwrap();

    let route = unicast_route(net!("10.1.0.0/24"), ip!("10.0.0.1"), 2);
    agent.add_route(route.clone()).await.unwrap();

    // Syncing another protocol's subtree leaves ours untouched.
    agent.sync_unicast_routes(186, btreemap! {}).await.unwrap();
    let routes = agent
        .get_cached_unicast_routes(DEFAULT_PROTOCOL_ID)
        .await
        .unwrap();
    assert_eq!(routes.len(), 1);
}

#[tokio::test]
async fn multicast_add_del() {
    let (transport, stub) = stub_transport(full_capabilities());
    let agent = fibsync::start(transport).unwrap();

    let route = mcast_route(net!("239.1.1.0/24"), "eth0", 2);
    agent.add_route(route.clone()).await.unwrap();
    assert_eq!(
        stub.state.ops(),
        vec![Op::RouteAdd {
            route: route.clone(),
            replace: false
        }]
    );
    let routes = agent
        .get_cached_multicast_routes(DEFAULT_PROTOCOL_ID)
        .await
        .unwrap();
    assert_eq!(
        routes.keys().collect::<Vec<_>>(),
        vec![&(net!("239.1.1.0/24"), "eth0".to_owned())]
    );

    // A duplicate add could come from the kernel or another agent; it is
    // reported as success without a second kernel mutation.
    agent.add_route(route.clone()).await.unwrap();
    assert_eq!(stub.state.ops().len(), 1);

    stub.state.clear_ops();
    agent.del_route(route.clone()).await.unwrap();
    assert_eq!(stub.state.ops(), vec![Op::RouteDel { route: route.clone() }]);
    assert!(agent
        .get_cached_multicast_routes(DEFAULT_PROTOCOL_ID)
        .await
        .unwrap()
        .is_empty());

    // Deleting it again is accepted with a warning.
    stub.state.clear_ops();
    agent.del_route(route).await.unwrap();
    assert!(stub.state.ops().is_empty());
}

#[tokio::test]
async fn multicast_requires_ifname() {
    let nexthop = NextHopBuilder::new().ifindex(2).build().unwrap();
    assert!(matches!(
        RouteBuilder::new()
            .destination(net!("239.1.1.0/24"))
            .kind(RouteType::Multicast)
            .nexthop(nexthop)
            .build(),
        Err(Error::InvalidMulticastRoute(_))
    ));
}

#[tokio::test]
async fn mpls_disabled_is_a_noop() {
    let capabilities = TransportCapabilities {
        mpls: false,
        route_events: true,
    };
    let (transport, stub) = stub_transport(capabilities);
    let agent = fibsync::start(transport).unwrap();

    // Label programming is reported as success but nothing happens.
    agent.add_mpls_route(mpls_route(1000, 2)).await.unwrap();
    assert!(stub.state.ops().is_empty());
    assert!(agent
        .get_cached_mpls_routes(DEFAULT_PROTOCOL_ID)
        .await
        .unwrap()
        .is_empty());
    assert_eq!(agent.get_mpls_route_count().await.unwrap(), 0);

    agent.del_mpls_route(mpls_route(1000, 2)).await.unwrap();
    assert!(stub.state.ops().is_empty());
}

#[tokio::test]
async fn mpls_add_del() {
    let (transport, stub) = stub_transport(full_capabilities());
    let agent = fibsync::start(transport).unwrap();

    let route = mpls_route(1000, 2);
    agent.add_mpls_route(route.clone()).await.unwrap();
    assert_eq!(
        stub.state.ops(),
        vec![Op::LabelAdd {
            route: route.clone()
        }]
    );
    assert_eq!(agent.get_mpls_route_count().await.unwrap(), 1);
    let routes = agent
        .get_cached_mpls_routes(DEFAULT_PROTOCOL_ID)
        .await
        .unwrap();
    assert!(routes.contains_key(&Label::new(1000)));

    // Same route, no second kernel mutation.
    agent.add_mpls_route(route.clone()).await.unwrap();
    assert_eq!(stub.state.ops().len(), 1);

    // Deleting an unknown label is accepted.
    agent.del_mpls_route(mpls_route(2000, 2)).await.unwrap();
    assert_eq!(stub.state.ops().len(), 1);

    agent.del_mpls_route(route.clone()).await.unwrap();
    assert_eq!(stub.state.ops().len(), 2);
    assert_eq!(agent.get_mpls_route_count().await.unwrap(), 0);
}

#[tokio::test]
async fn mpls_requires_unicast_type() {
    let (transport, _stub) = stub_transport(full_capabilities());
    let agent = fibsync::start(transport).unwrap();

    let nexthop = NextHopBuilder::new().ifindex(2).build().unwrap();
    let route = RouteBuilder::new()
        .kind(RouteType::Multicast)
        .mpls_label(Label::new(1000))
        .nexthop(nexthop)
        .build_unchecked();
    assert!(matches!(
        agent.add_mpls_route(route).await,
        Err(Error::UnsupportedRouteType(_))
    ));
}

#[tokio::test]
async fn sync_mpls_routes() {
    let (transport, stub) = stub_transport(full_capabilities());
    let agent = fibsync::start(transport).unwrap();

    let route_a = mpls_route(1000, 2);
    let route_b = mpls_route(2000, 2);
    agent.add_mpls_route(route_a.clone()).await.unwrap();
    agent.add_mpls_route(route_b.clone()).await.unwrap();
    stub.state.clear_ops();

    let route_c = mpls_route(3000, 2);
    let db = btreemap! {
        Label::new(2000) => route_b.clone(),
        Label::new(3000) => route_c.clone(),
    };
    agent
        .sync_mpls_routes(DEFAULT_PROTOCOL_ID, db.clone())
        .await
        .unwrap();
    assert_eq!(
        stub.state.ops(),
        vec![
            Op::LabelDel { route: route_a },
            Op::LabelAdd { route: route_c },
        ]
    );
    let routes = agent
        .get_cached_mpls_routes(DEFAULT_PROTOCOL_ID)
        .await
        .unwrap();
    assert_eq!(routes, db);
}

#[tokio::test]
async fn sync_link_routes_adds_only_missing() {
    let (transport, stub) = stub_transport(full_capabilities());
    let agent = fibsync::start(transport).unwrap();

    let key_a = (net!("10.1.0.0/24"), "eth0".to_owned());
    let key_b = (net!("10.2.0.0/24"), "eth1".to_owned());
    let route_a = link_route(net!("10.1.0.0/24"), 2);
    let route_b = link_route(net!("10.2.0.0/24"), 3);

    agent
        .sync_link_routes(
            DEFAULT_PROTOCOL_ID,
            btreemap! { key_a.clone() => route_a.clone() },
        )
        .await
        .unwrap();
    assert_eq!(
        stub.state.ops(),
        vec![Op::RouteAdd {
            route: route_a.clone(),
            replace: false
        }]
    );

    // Keys already present are not re-programmed.
    stub.state.clear_ops();
    agent
        .sync_link_routes(
            DEFAULT_PROTOCOL_ID,
            btreemap! {
                key_a.clone() => route_a.clone(),
                key_b.clone() => route_b.clone(),
            },
        )
        .await
        .unwrap();
    assert_eq!(
        stub.state.ops(),
        vec![Op::RouteAdd {
            route: route_b.clone(),
            replace: false
        }]
    );

    // Dropping a key deletes only that route.
    stub.state.clear_ops();
    agent
        .sync_link_routes(
            DEFAULT_PROTOCOL_ID,
            btreemap! { key_b.clone() => route_b.clone() },
        )
        .await
        .unwrap();
    assert_eq!(stub.state.ops(), vec![Op::RouteDel { route: route_a }]);
    let routes = agent
        .get_cached_link_routes(DEFAULT_PROTOCOL_ID)
        .await
        .unwrap();
    assert_eq!(routes, btreemap! { key_b => route_b });
}

#[tokio::test]
async fn sync_ifaddresses_adds_before_deletes() {
    let (transport, stub) = stub_transport(full_capabilities());
    let agent = fibsync::start(transport).unwrap();

    // Interface 5 currently holds 10.1.0.1/24.
    let old_addr = ifaddr(5, net!("10.1.0.1/24"));
    stub.state.addrs.lock().unwrap().push(old_addr);

    let new_addr = ifaddr(5, net!("10.2.0.1/24"));
    agent
        .sync_ifaddresses(5, vec![new_addr.clone()], None, None)
        .await
        .unwrap();

    // The new address lands before the deprecated one is removed, so the
    // interface never goes addressless.
    let ops = stub.state.ops();
    assert_eq!(ops.len(), 2);
    assert!(matches!(&ops[0], Op::AddrAdd { addr } if addr == &new_addr));
    assert!(
        matches!(&ops[1], Op::AddrDel { addr } if addr.prefix() == Some(net!("10.1.0.1/24")))
    );
}

#[tokio::test]
async fn sync_ifaddresses_checks_consistency() {
    let (transport, _stub) = stub_transport(full_capabilities());
    let agent = fibsync::start(transport).unwrap();

    let addr = ifaddr(6, net!("10.2.0.1/24"));
    assert!(matches!(
        agent.sync_ifaddresses(5, vec![addr], None, None).await,
        Err(Error::InconsistentIfIndex)
    ));

    let addr = IfAddressBuilder::new().ifindex(5).build();
    assert!(matches!(
        agent.sync_ifaddresses(5, vec![addr], None, None).await,
        Err(Error::MissingPrefix)
    ));
}

#[tokio::test]
async fn ifaddress_error_masking() {
    let (transport, stub) = stub_transport(full_capabilities());
    let agent = fibsync::start(transport).unwrap();

    // Duplicated address.
    *stub.state.addr_add_error.lock().unwrap() = Some(TransportError::Exists);
    agent
        .add_ifaddress(ifaddr(5, net!("10.1.0.1/24")))
        .await
        .unwrap();

    // Deleting an address that is not assigned.
    *stub.state.addr_del_error.lock().unwrap() =
        Some(TransportError::AddressNotFound);
    agent
        .del_ifaddress(ifaddr(5, net!("10.1.0.1/24")))
        .await
        .unwrap();

    // Anything else is fatal.
    *stub.state.addr_add_error.lock().unwrap() =
        Some(TransportError::Errno(13));
    assert!(matches!(
        agent.add_ifaddress(ifaddr(5, net!("10.1.0.1/24"))).await,
        Err(Error::KernelAddFailed(_))
    ));

    // A mutation without a prefix is rejected before the transport.
    stub.state.clear_ops();
    let addr = IfAddressBuilder::new().ifindex(5).build();
    assert!(matches!(
        agent.del_ifaddress(addr).await,
        Err(Error::MissingPrefix)
    ));
    assert!(stub.state.ops().is_empty());
}

#[tokio::test]
async fn get_ifaddrs_filters() {
    use fibsync::route::RouteScope;
    use fibsync_utils::ip::AddressFamily;

    let (transport, stub) = stub_transport(full_capabilities());
    let agent = fibsync::start(transport).unwrap();

    {
        let mut addrs = stub.state.addrs.lock().unwrap();
        addrs.push(ifaddr(5, net!("10.1.0.1/24")));
        addrs.push(ifaddr(5, net!("2001:db8::1/64")));
        addrs.push(ifaddr(6, net!("10.2.0.1/24")));
    }

    let addrs = agent.get_ifaddrs(5, None, None).await.unwrap();
    assert_eq!(addrs.len(), 2);

    let addrs = agent
        .get_ifaddrs(5, Some(AddressFamily::Ipv6), None)
        .await
        .unwrap();
    assert_eq!(addrs.len(), 1);
    assert_eq!(addrs[0].prefix(), Some(net!("2001:db8::1/64")));

    // Scoped queries only match addresses carrying that scope.
    let addrs = agent
        .get_ifaddrs(5, None, Some(RouteScope::Host))
        .await
        .unwrap();
    assert!(addrs.is_empty());
}
