use std::net::{IpAddr, Ipv4Addr, UdpSocket};

/// Returns the address this host would use to reach the wider network.
///
/// Connecting a UDP socket only selects a route, no packet leaves the host.
pub fn lan_address() -> Option<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
    socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9)).ok()?;
    let ip = socket.local_addr().ok()?.ip();
    (!ip.is_unspecified() && !ip.is_loopback()).then_some(ip)
}

/// Whether `host` designates the machine we are running on.
///
/// Name resolution failures are not considered local, the subsequent request
/// will surface the real error.
pub async fn is_local_target(host: &str, port: u16) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    let own = lan_address();
    let is_own = |ip: IpAddr| ip.is_loopback() || ip.is_unspecified() || Some(ip) == own;
    if let Ok(ip) = host.parse::<IpAddr>() {
        return is_own(ip);
    }
    match tokio::net::lookup_host((host, port)).await {
        Ok(mut addrs) => addrs.any(|addr| is_own(addr.ip())),
        Err(error) => {
            tracing::debug!(%host, %error, "could not resolve target host");
            false
        }
    }
}
