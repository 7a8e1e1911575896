//! Semantic property hooks: constraints the type validators cannot
//! express, plus the ring assignment machinery. Registered with the
//! dispatcher at startup; checks run with the tree lock held and never
//! re-enter the tree.

use std::net::Ipv4Addr;
use std::sync::Arc;

use time::OffsetDateTime;

use crate::{
    dispatch::{Dispatch, ExpireAction, ExpireHook, PropHook},
    path::PropPath,
    schema::{parse_cidr, RINGS},
    tree::PropTree,
};

/// The factory-fresh appliance identity; the only value `@/uuid` may
/// transition away from.
pub const ZERO_UUID: &str = "00000000-0000-0000-0000-000000000000";

/// Extra prefix bits each ring subnet takes below the base address.
/// Three bits covers the eight rings exactly.
const RING_PREFIX_BITS: u32 = 3;

fn read_prop(tree: &PropTree, path: &str) -> Option<String> {
    let path = tree.parse(path).ok()?;
    let id = tree.lookup(&path)?;
    let node = tree.node(id);
    if node.is_leaf() && !node.value().is_empty() {
        Some(node.value().to_owned())
    } else {
        None
    }
}

fn client_macs(tree: &PropTree) -> Vec<String> {
    let Ok(path) = tree.parse("@/clients") else {
        return Vec::new();
    };
    tree.get_children(&path)
        .into_iter()
        .map(|id| tree.node(id).name().to_owned())
        .collect()
}

/// Computes the subnet a ring occupies for the given base address and site
/// index: the site takes the `site_index`-th successive block of the base
/// prefix size, and each ring takes its fixed sub-block within that.
pub fn ring_subnet(base: &str, site_index: u32, ring: &str) -> Result<(Ipv4Addr, u32), String> {
    let (addr, prefix) = parse_cidr(base)?;
    if prefix + RING_PREFIX_BITS > 30 {
        return Err(format!(
            "base prefix /{prefix} leaves no room for per-ring subnets"
        ));
    }

    let index = RINGS
        .iter()
        .position(|r| *r == ring)
        .ok_or_else(|| format!("unknown ring '{ring}'"))? as u64;

    let span: u64 = 1 << (32 - prefix);
    let base_net = u64::from(u32::from(addr)) & !(span - 1);
    let site_net = base_net + u64::from(site_index) * span;
    if site_net + span > 1 << 32 {
        return Err(format!(
            "site index {site_index} pushes {base} past the address space"
        ));
    }

    let sub_prefix = prefix + RING_PREFIX_BITS;
    let sub_span: u64 = 1 << (32 - sub_prefix);
    let net = site_net + index * sub_span;
    Ok((Ipv4Addr::from(net as u32), sub_prefix))
}

pub fn subnet_contains(net: Ipv4Addr, prefix: u32, ip: Ipv4Addr) -> bool {
    let mask = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix)
    };
    (u32::from(ip) & mask) == (u32::from(net) & mask)
}

/// The subnet currently governing `ring`: the explicit `@/rings/…/subnet`
/// leaf when present, otherwise the computed plan.
fn ring_subnet_for(tree: &PropTree, ring: &str) -> Result<(Ipv4Addr, u32), String> {
    if let Some(subnet) = read_prop(tree, &format!("@/rings/{ring}/subnet")) {
        return parse_cidr(&subnet);
    }
    let base = read_prop(tree, "@/network/base_address")
        .ok_or("no @/network/base_address configured")?;
    let site_index = read_prop(tree, "@/site_index")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    ring_subnet(&base, site_index, ring)
}

fn vap_rings(tree: &PropTree, vap: &str) -> Vec<String> {
    let mut rings: Vec<String> = read_prop(tree, &format!("@/network/vap/{vap}/rings"))
        .map(|list| list.split(',').map(|r| r.trim().to_owned()).collect())
        .unwrap_or_default();
    if let Some(default) = read_prop(tree, &format!("@/network/vap/{vap}/default_ring")) {
        if !rings.contains(&default) {
            rings.push(default);
        }
    }
    rings
}

fn vap_default_ring(tree: &PropTree, vap: &str) -> String {
    read_prop(tree, &format!("@/network/vap/{vap}/default_ring"))
        .unwrap_or_else(|| "unenrolled".to_owned())
}

/// Ring selection for a newly observed client event.
///
/// With a virtual AP: keep the current ring if it is served by that VAP,
/// else move to the client's home ring if that is served, else the VAP's
/// default. Without a VAP the event is DHCP-originated and may only land
/// on non-quarantine rings.
pub fn select_ring(
    tree: &PropTree,
    mac: &str,
    vap: Option<&str>,
    reported: Option<&str>,
) -> String {
    let current = read_prop(tree, &format!("@/clients/{mac}/ring"));
    let home = read_prop(tree, &format!("@/clients/{mac}/home"));

    match vap {
        Some(vap) => {
            let served = vap_rings(tree, vap);
            if let Some(current) = &current {
                if served.contains(current) {
                    return current.clone();
                }
            }
            if let Some(home) = &home {
                if served.contains(home) {
                    return home.clone();
                }
            }
            vap_default_ring(tree, vap)
        }
        None => match reported {
            Some(ring) if ring != "quarantine" && RINGS.contains(&ring) => ring.to_owned(),
            _ => current.unwrap_or_else(|| "unenrolled".to_owned()),
        },
    }
}

/// `@/uuid` may only transition away from the all-zero form.
struct UuidHook;

impl PropHook for UuidHook {
    fn check(
        &self,
        tree: &PropTree,
        _path: &PropPath,
        value: &str,
        _now: OffsetDateTime,
    ) -> Result<Option<String>, String> {
        if let Some(current) = read_prop(tree, "@/uuid") {
            if current != ZERO_UUID && current != value {
                return Err(format!("appliance uuid is already set to {current}"));
            }
        }
        Ok(None)
    }
}

/// A DNS name must not collide with any other client's dns_name or
/// dhcp_name, nor with a CNAME.
struct DnsNameHook;

impl PropHook for DnsNameHook {
    fn check(
        &self,
        tree: &PropTree,
        path: &PropPath,
        value: &str,
        _now: OffsetDateTime,
    ) -> Result<Option<String>, String> {
        let mac = path
            .segments()
            .get(1)
            .map(String::as_str)
            .unwrap_or_default();

        for other in client_macs(tree) {
            if other == mac {
                continue;
            }
            for field in ["dns_name", "dhcp_name"] {
                if let Some(existing) = read_prop(tree, &format!("@/clients/{other}/{field}")) {
                    if existing.eq_ignore_ascii_case(value) {
                        return Err(format!(
                            "name '{value}' is already the {field} of {other}"
                        ));
                    }
                }
            }
        }

        if read_prop(tree, &format!("@/dns/cnames/{value}")).is_some() {
            return Err(format!("name '{value}' is already a CNAME"));
        }

        Ok(None)
    }
}

/// A static IPv4 assignment must fall inside the client's ring subnet and
/// must not collide with another client's unexpired address.
struct Ipv4Hook;

impl PropHook for Ipv4Hook {
    fn check(
        &self,
        tree: &PropTree,
        path: &PropPath,
        value: &str,
        now: OffsetDateTime,
    ) -> Result<Option<String>, String> {
        let mac = path
            .segments()
            .get(1)
            .map(String::as_str)
            .unwrap_or_default();

        let ip: Ipv4Addr = value
            .parse()
            .map_err(|_| format!("static assignments must be IPv4, got '{value}'"))?;

        let ring = read_prop(tree, &format!("@/clients/{mac}/ring"))
            .ok_or_else(|| format!("client {mac} has no ring assignment"))?;
        let (net, prefix) = ring_subnet_for(tree, &ring)?;
        if !subnet_contains(net, prefix, ip) {
            return Err(format!(
                "{ip} is outside the {ring} subnet {net}/{prefix}"
            ));
        }

        for other in client_macs(tree) {
            if other == mac {
                continue;
            }
            let Ok(other_path) = tree.parse(&format!("@/clients/{other}/ipv4")) else {
                continue;
            };
            let Some(id) = tree.lookup(&other_path) else {
                continue;
            };
            let node = tree.node(id);
            if node.expired_at(now) {
                continue;
            }
            if node.value() == value {
                return Err(format!("{ip} is already assigned to {other}"));
            }
        }

        Ok(None)
    }
}

/// Changing the base address or site index must still yield a workable,
/// non-overlapping subnet plan that keeps every existing static
/// assignment inside its ring.
struct SubnetPlanHook;

impl PropHook for SubnetPlanHook {
    fn check(
        &self,
        tree: &PropTree,
        path: &PropPath,
        value: &str,
        now: OffsetDateTime,
    ) -> Result<Option<String>, String> {
        let (base, site_index) = if path.leaf_name() == Some("base_address") {
            let site_index = read_prop(tree, "@/site_index")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            (value.to_owned(), site_index)
        } else {
            let Some(base) = read_prop(tree, "@/network/base_address") else {
                // No base configured yet; nothing to re-plan.
                return Ok(None);
            };
            let site_index: u32 = value
                .parse()
                .map_err(|_| format!("'{value}' is not a site index"))?;
            (base, site_index)
        };

        let mut plan = Vec::with_capacity(RINGS.len());
        for ring in RINGS {
            plan.push((*ring, ring_subnet(&base, site_index, ring)?));
        }

        for (i, (ring_a, (net_a, prefix_a))) in plan.iter().enumerate() {
            for (ring_b, (net_b, prefix_b)) in plan.iter().skip(i + 1) {
                if subnet_contains(*net_a, *prefix_a, *net_b)
                    || subnet_contains(*net_b, *prefix_b, *net_a)
                {
                    return Err(format!(
                        "rings {ring_a} and {ring_b} would overlap under {base}"
                    ));
                }
            }
        }

        for mac in client_macs(tree) {
            let Some(ring) = read_prop(tree, &format!("@/clients/{mac}/ring")) else {
                continue;
            };
            let Ok(ip_path) = tree.parse(&format!("@/clients/{mac}/ipv4")) else {
                continue;
            };
            let Some(id) = tree.lookup(&ip_path) else {
                continue;
            };
            let node = tree.node(id);
            if node.expired_at(now) {
                continue;
            }
            let Ok(ip) = node.value().parse::<Ipv4Addr>() else {
                continue;
            };

            let Some((_, (net, prefix))) = plan.iter().find(|(r, _)| *r == ring) else {
                continue;
            };
            if !subnet_contains(*net, *prefix, ip) {
                return Err(format!(
                    "client {mac} static address {ip} would fall outside the {ring} subnet"
                ));
            }
        }

        Ok(None)
    }
}

/// An expired ring assignment returns the client to the default for its
/// connection VAP.
struct RingExpireHook;

impl ExpireHook for RingExpireHook {
    fn action(&self, tree: &PropTree, path: &PropPath) -> ExpireAction {
        let vap = path
            .segments()
            .get(1)
            .and_then(|mac| read_prop(tree, &format!("@/clients/{mac}/connection/vap")));
        match vap {
            Some(vap) => ExpireAction::Reset(vap_default_ring(tree, &vap)),
            None => ExpireAction::Reset("unenrolled".to_owned()),
        }
    }
}

/// Registers the standard semantic hooks with the dispatcher.
pub fn register_standard(dispatch: &mut Dispatch) -> Result<(), regex::Error> {
    dispatch.register_hook(r"^@/uuid$", Arc::new(UuidHook))?;
    dispatch.register_hook(r"^@/clients/[^/]+/dns_name$", Arc::new(DnsNameHook))?;
    dispatch.register_hook(r"^@/clients/[^/]+/ipv4$", Arc::new(Ipv4Hook))?;
    dispatch.register_hook(r"^@/network/base_address$", Arc::new(SubnetPlanHook))?;
    dispatch.register_hook(r"^@/site_index$", Arc::new(SubnetPlanHook))?;
    dispatch.register_expire(r"^@/clients/[^/]+/ring$", Arc::new(RingExpireHook))?;
    Ok(())
}
