//! LAN discovery: scan the local /24 for hosts accepting SSH.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info};

/// Simultaneous connection attempts
pub const MAX_CONCURRENT_DIALS: usize = 50;

/// Local IPv4 address used for outbound traffic. Connecting a UDP socket
/// only selects a route; nothing is sent.
pub fn local_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("192.0.2.1:9").ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_loopback() && !ip.is_unspecified() => Some(ip),
        _ => None,
    }
}

/// All host addresses of the /24 containing `ip`, except `ip` itself.
pub fn subnet_hosts(ip: Ipv4Addr) -> Vec<Ipv4Addr> {
    let [a, b, c, _] = ip.octets();
    (1..=254)
        .map(|d| Ipv4Addr::new(a, b, c, d))
        .filter(|host| *host != ip)
        .collect()
}

/// Addresses that accepted a TCP connection within `timeout`, sorted.
pub async fn sweep(targets: Vec<SocketAddr>, timeout: Duration) -> Vec<SocketAddr> {
    let found = Arc::new(Mutex::new(Vec::new()));
    let permits = Arc::new(Semaphore::new(MAX_CONCURRENT_DIALS));
    let mut dials = JoinSet::new();

    for addr in targets {
        let found = found.clone();
        let permits = permits.clone();
        dials.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            if let Ok(Ok(_stream)) = tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
                debug!("[discovery] {} is open", addr);
                found.lock().push(addr);
            }
        });
    }
    while dials.join_next().await.is_some() {}

    let mut found = std::mem::take(&mut *found.lock());
    found.sort();
    found
}

/// Scan the local /24 for `port` (normally 22).
pub async fn scan_local_subnet(port: u16, timeout: Duration) -> Option<Vec<SocketAddr>> {
    let ip = local_ipv4()?;
    info!("[discovery] Scanning {}/24 for port {}", ip, port);
    let targets = subnet_hosts(ip)
        .into_iter()
        .map(|host| SocketAddr::new(IpAddr::V4(host), port))
        .collect();
    Some(sweep(targets, timeout).await)
}
