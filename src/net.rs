use std::net::IpAddr;

/// Returns `true` when `addr` belongs to a private LAN, loopback, or
/// link-local range. Publicly routable addresses are rejected; the engine
/// only ever pairs peers on the local network.
pub fn is_lan_ip(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            v6.is_loopback()
                // fc00::/7 unique local
                || (segments[0] & 0xfe00) == 0xfc00
                // fe80::/10 link local
                || (segments[0] & 0xffc0) == 0xfe80
        }
    }
}
