//
// Copyright (c) The Concord Contributors
//
// SPDX-License-Identifier: MIT
//

#[cfg(not(feature = "testing"))]
use std::net::IpAddr;

#[cfg(not(feature = "testing"))]
use capctl::caps::CapState;
#[cfg(not(feature = "testing"))]
use futures::TryStreamExt;
#[cfg(not(feature = "testing"))]
use ipnetwork::IpNetwork;
#[cfg(not(feature = "testing"))]
use netlink_packet_route::AddressFamily;
#[cfg(not(feature = "testing"))]
use netlink_packet_route::route::{
    RouteAddress, RouteAttribute, RouteHeader, RouteMessage, RouteProtocol,
    RouteType,
};
#[cfg(not(feature = "testing"))]
use rtnetlink::{Handle, IpVersion, new_connection};
#[cfg(not(feature = "testing"))]
use tracing::error;

use concord_utils::protocol::Protocol;
use concord_utils::southbound::{Nexthop, RouteMsg};

use crate::rib::Route;

// Handle to the kernel routing table.
//
// When built with the "testing" feature, all operations are no-ops so the
// reconciliation logic can be exercised without privileges.
#[derive(Debug)]
pub struct NetlinkHandle {
    #[cfg(not(feature = "testing"))]
    handle: Handle,
}

// ===== impl NetlinkHandle =====

impl NetlinkHandle {
    pub(crate) fn init() -> NetlinkHandle {
        #[cfg(not(feature = "testing"))]
        {
            // Create netlink socket.
            let (conn, handle, _) = new_connection().unwrap();

            // Spawn the netlink connection on a separate thread with
            // permitted capabilities raised.
            std::thread::spawn(|| {
                let mut caps = CapState::get_current().unwrap();
                caps.effective = caps.permitted;
                if let Err(error) = caps.set_current() {
                    error!("failed to update current capabilities: {}", error);
                }
                futures::executor::block_on(conn)
            });

            NetlinkHandle { handle }
        }
        #[cfg(feature = "testing")]
        {
            NetlinkHandle {}
        }
    }

    // Installs the route in the kernel, returning whether the request was
    // accepted. Only the best nexthop is programmed.
    pub(crate) async fn route_install(
        &self,
        prefix: &ipnetwork::IpNetwork,
        route: &Route,
    ) -> bool {
        #[cfg(not(feature = "testing"))]
        {
            // Create netlink request.
            let mut request = self.handle.route().add();

            // Set route protocol.
            let protocol = netlink_protocol(route.protocol);
            request = request.protocol(protocol);

            match prefix {
                IpNetwork::V4(prefix) => {
                    // Set destination prefix.
                    let mut request = request
                        .v4()
                        .replace()
                        .destination_prefix(prefix.ip(), prefix.prefix());

                    // Set nexthop.
                    if let Some(nexthop) = route.nexthops.first() {
                        match nexthop {
                            Nexthop::Address { addr, ifindex } => {
                                if let IpAddr::V4(addr) = addr {
                                    request = request.gateway(*addr);
                                }
                                if *ifindex != 0 {
                                    request =
                                        request.output_interface(*ifindex);
                                }
                            }
                            Nexthop::Interface { ifindex } => {
                                request = request.output_interface(*ifindex);
                            }
                        }
                    }

                    // Execute request.
                    if let Err(error) = request.execute().await {
                        error!(%prefix, %error, "failed to install route");
                        return false;
                    }
                }
                IpNetwork::V6(prefix) => {
                    // Set destination prefix.
                    let mut request = request
                        .v6()
                        .replace()
                        .destination_prefix(prefix.ip(), prefix.prefix());

                    // Set nexthop.
                    if let Some(nexthop) = route.nexthops.first() {
                        match nexthop {
                            Nexthop::Address { addr, ifindex } => {
                                if let IpAddr::V6(addr) = addr {
                                    request = request.gateway(*addr);
                                }
                                if *ifindex != 0 {
                                    request =
                                        request.output_interface(*ifindex);
                                }
                            }
                            Nexthop::Interface { ifindex } => {
                                request = request.output_interface(*ifindex);
                            }
                        }
                    }

                    // Execute request.
                    if let Err(error) = request.execute().await {
                        error!(%prefix, %error, "failed to install route");
                        return false;
                    }
                }
            }
            true
        }
        #[cfg(feature = "testing")]
        {
            true
        }
    }

    // Removes the route from the kernel.
    pub(crate) async fn route_uninstall(&self, prefix: &ipnetwork::IpNetwork) {
        #[cfg(not(feature = "testing"))]
        {
            // Create netlink request.
            let request = self.handle.route().add();

            match prefix {
                IpNetwork::V4(prefix) => {
                    // Set destination prefix.
                    let mut request = request
                        .v4()
                        .destination_prefix(prefix.ip(), prefix.prefix());

                    // Execute request.
                    if let Err(error) = self
                        .handle
                        .route()
                        .del(request.message_mut().clone())
                        .execute()
                        .await
                    {
                        error!(%prefix, %error, "failed to uninstall route");
                    }
                }
                IpNetwork::V6(prefix) => {
                    // Set destination prefix.
                    let mut request = request
                        .v6()
                        .destination_prefix(prefix.ip(), prefix.prefix());

                    // Execute request.
                    if let Err(error) = self
                        .handle
                        .route()
                        .del(request.message_mut().clone())
                        .execute()
                        .await
                    {
                        error!(%prefix, %error, "failed to uninstall route");
                    }
                }
            }
        }
    }

    // Dumps the kernel routing tables, readopting routes installed by a
    // previous incarnation of the daemon. Routes that no protocol engine
    // reclaims are garbage collected by the stale-route differ later on.
    pub(crate) async fn fetch_routes(&self) -> Vec<RouteMsg> {
        #[cfg(not(feature = "testing"))]
        {
            let mut routes = Vec::new();
            for ip_version in [IpVersion::V4, IpVersion::V6] {
                let mut stream =
                    self.handle.route().get(ip_version).execute();
                loop {
                    match stream.try_next().await {
                        Ok(Some(msg)) => {
                            if let Some(route) = parse_route(msg) {
                                routes.push(route);
                            }
                        }
                        Ok(None) => break,
                        Err(error) => {
                            error!(%error, "failed to fetch kernel routes");
                            break;
                        }
                    }
                }
            }
            routes
        }
        #[cfg(feature = "testing")]
        {
            Vec::new()
        }
    }
}

// ===== helper functions =====

#[cfg(not(feature = "testing"))]
fn netlink_protocol(protocol: Protocol) -> RouteProtocol {
    match protocol {
        Protocol::BGP => RouteProtocol::Bgp,
        Protocol::DIRECT => RouteProtocol::Unspec,
        Protocol::ISIS => RouteProtocol::Isis,
        Protocol::OSPFV2 | Protocol::OSPFV3 => RouteProtocol::Ospf,
        Protocol::RIPV2 | Protocol::RIPNG => RouteProtocol::Rip,
        Protocol::STATIC => RouteProtocol::Static,
    }
}

#[cfg(not(feature = "testing"))]
fn parse_protocol(
    protocol: RouteProtocol,
    af: AddressFamily,
) -> Option<Protocol> {
    match protocol {
        RouteProtocol::Bgp => Some(Protocol::BGP),
        RouteProtocol::Isis => Some(Protocol::ISIS),
        RouteProtocol::Ospf => match af {
            AddressFamily::Inet6 => Some(Protocol::OSPFV3),
            _ => Some(Protocol::OSPFV2),
        },
        RouteProtocol::Rip => match af {
            AddressFamily::Inet6 => Some(Protocol::RIPNG),
            _ => Some(Protocol::RIPV2),
        },
        RouteProtocol::Static => Some(Protocol::STATIC),
        _ => None,
    }
}

#[cfg(not(feature = "testing"))]
fn parse_address(addr: &RouteAddress) -> Option<IpAddr> {
    match addr {
        RouteAddress::Inet(addr) => Some(IpAddr::V4(*addr)),
        RouteAddress::Inet6(addr) => Some(IpAddr::V6(*addr)),
        _ => None,
    }
}

#[cfg(not(feature = "testing"))]
fn parse_route(msg: RouteMessage) -> Option<RouteMsg> {
    use std::collections::BTreeSet;
    use std::net::{Ipv4Addr, Ipv6Addr};

    // Only unicast routes from the main table are of interest.
    if msg.header.kind != RouteType::Unicast
        || msg.header.table != RouteHeader::RT_TABLE_MAIN
    {
        return None;
    }
    let protocol =
        parse_protocol(msg.header.protocol, msg.header.address_family)?;

    let mut dst = None;
    let mut gateway = None;
    let mut ifindex = 0;
    let mut metric = 0;
    for attr in &msg.attributes {
        match attr {
            RouteAttribute::Destination(addr) => dst = parse_address(addr),
            RouteAttribute::Gateway(addr) => gateway = parse_address(addr),
            RouteAttribute::Oif(oif) => ifindex = *oif,
            RouteAttribute::Priority(priority) => metric = *priority,
            _ => (),
        }
    }

    // Routes without a destination attribute are default routes.
    let dst = dst.or(match msg.header.address_family {
        AddressFamily::Inet => Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
        AddressFamily::Inet6 => Some(IpAddr::V6(Ipv6Addr::UNSPECIFIED)),
        _ => None,
    })?;
    let prefix =
        IpNetwork::new(dst, msg.header.destination_prefix_length).ok()?;

    let nexthop = match gateway {
        Some(addr) => Nexthop::Address { ifindex, addr },
        None if ifindex != 0 => Nexthop::Interface { ifindex },
        None => return None,
    };

    Some(RouteMsg {
        protocol,
        prefix,
        distance: protocol.default_distance(),
        metric,
        nexthops: BTreeSet::from([nexthop]),
    })
}
