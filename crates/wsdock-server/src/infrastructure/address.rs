//! AddressResolver: picks the local network address that peers on the LAN
//! can reach, for binding and for composing the connectable URL.
//!
//! Preference order:
//! 1. an IPv4 address on a primary interface (`en0`, `en1`, `eth0`, `wlan0`)
//! 2. any other non-loopback, non-link-local IPv4 address
//! 3. `127.0.0.1`
//!
//! IPv6 addresses are never chosen; they are logged so an operator can see
//! what was skipped.

use std::net::{IpAddr, Ipv4Addr};

use tracing::{debug, info};

/// Interfaces tried first, in order.
const PREFERRED_INTERFACES: [&str; 4] = ["en0", "en1", "eth0", "wlan0"];

/// Stateless resolver over the host's network interfaces.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddressResolver;

impl AddressResolver {
    /// Returns the best local address, falling back to loopback.
    pub fn resolve(&self) -> IpAddr {
        let candidates: Vec<(String, IpAddr)> = if_addrs::get_if_addrs()
            .unwrap_or_default()
            .into_iter()
            .filter(|iface| !iface.is_loopback())
            .map(|iface| {
                let ip = iface.ip();
                (iface.name, ip)
            })
            .collect();
        let chosen = select_address(&candidates);
        info!("resolved local address {chosen}");
        chosen
    }
}

/// Chooses from `(interface name, address)` pairs according to the module's
/// preference order.
pub fn select_address(candidates: &[(String, IpAddr)]) -> IpAddr {
    let skipped_v6: Vec<String> = candidates
        .iter()
        .filter(|(_, ip)| ip.is_ipv6())
        .map(|(_, ip)| ip.to_string())
        .collect();
    if !skipped_v6.is_empty() {
        debug!("skipping IPv6 addresses: {}", skipped_v6.join(", "));
    }

    let usable = || candidates.iter().filter(|(_, ip)| is_usable_v4(ip));

    PREFERRED_INTERFACES
        .iter()
        .find_map(|preferred| {
            usable()
                .find(|(name, _)| name == preferred)
                .map(|(_, ip)| *ip)
        })
        .or_else(|| usable().map(|(_, ip)| *ip).next())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

fn is_usable_v4(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => !v4.is_loopback() && !v4.is_link_local() && !v4.is_unspecified(),
        IpAddr::V6(_) => false,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
