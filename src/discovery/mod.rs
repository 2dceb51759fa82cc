//! LAN discovery module
//!
//! Finds listening Duotris peers by brute force: every host address of every
//! attached IPv4 subnet gets a connection attempt and a handshake, all in parallel.
//! Refusals and timeouts both just mean "nobody there".

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::network::{Connection, ConnectionError, ConnectionResult};
use crate::protocol::{CodecError, Message, Tag};

/// A peer that answered the handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    pub address: Ipv4Addr,
    pub port: u16,
    /// Name the peer introduced itself with
    pub name: String,
}

impl DiscoveredPeer {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.address, self.port))
    }
}

/// An IPv4 network attached to one of the local interfaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subnet {
    network: Ipv4Addr,
    netmask: Ipv4Addr,
}

impl Subnet {
    /// Subnet containing `address` under `netmask`
    pub fn new(address: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        Self {
            network: Ipv4Addr::from(u32::from(address) & u32::from(netmask)),
            netmask,
        }
    }

    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    pub fn prefix_len(&self) -> u32 {
        u32::from(self.netmask).count_ones()
    }

    /// Number of addresses [`Subnet::hosts`] yields
    pub fn host_count(&self) -> u64 {
        let (first, last) = self.host_range();
        last + 1 - first
    }

    /// Every host address, excluding the network and broadcast addresses where the
    /// subnet is large enough to have them
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        let base = u64::from(u32::from(self.network));
        let (first, last) = self.host_range();
        (first..=last).map(move |offset| Ipv4Addr::from((base + offset) as u32))
    }

    fn host_range(&self) -> (u64, u64) {
        let size = 1u64 << (32 - self.prefix_len());
        if size <= 2 {
            (0, size - 1)
        } else {
            (1, size - 2)
        }
    }
}

/// Address and netmask of every non-loopback IPv4 interface
#[cfg(unix)]
fn interfaces() -> Vec<(Ipv4Addr, Ipv4Addr)> {
    use nix::ifaddrs::getifaddrs;
    use nix::net::if_::InterfaceFlags;

    let addrs = match getifaddrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            tracing::warn!("Could not enumerate network interfaces: {}", e);
            return Vec::new();
        }
    };

    let mut found = Vec::new();
    for ifaddr in addrs {
        if ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK) {
            continue;
        }
        let (Some(address), Some(netmask)) = (ifaddr.address, ifaddr.netmask) else {
            continue;
        };
        let (Some(address), Some(netmask)) = (address.as_sockaddr_in(), netmask.as_sockaddr_in())
        else {
            continue;
        };

        let address = *SocketAddrV4::from(*address).ip();
        let netmask = *SocketAddrV4::from(*netmask).ip();
        if address.is_loopback() {
            continue;
        }
        tracing::trace!("Interface {}: {}", ifaddr.interface_name, address);
        found.push((address, netmask));
    }
    found
}

#[cfg(not(unix))]
fn interfaces() -> Vec<(Ipv4Addr, Ipv4Addr)> {
    tracing::warn!("Interface enumeration is not supported on this platform");
    Vec::new()
}

/// Subnets of all non-loopback IPv4 interfaces, without duplicates
pub fn local_subnets() -> Vec<Subnet> {
    let mut subnets = Vec::new();
    for (address, netmask) in interfaces() {
        let subnet = Subnet::new(address, netmask);
        if !subnets.contains(&subnet) {
            tracing::debug!("Attached subnet {}/{}", subnet.network(), subnet.prefix_len());
            subnets.push(subnet);
        }
    }
    subnets
}

/// Our own addresses on the attached subnets
pub fn local_addresses() -> Vec<Ipv4Addr> {
    interfaces().into_iter().map(|(address, _)| address).collect()
}

/// Sweep candidates: the first `max_hosts` of each subnet, minus `skip`
fn candidates(subnets: &[Subnet], max_hosts: usize, skip: &[Ipv4Addr]) -> Vec<Ipv4Addr> {
    let mut hosts = Vec::new();
    for subnet in subnets {
        if subnet.host_count() > max_hosts as u64 {
            tracing::warn!(
                "Subnet {}/{} has {} hosts, scanning only the first {}",
                subnet.network(),
                subnet.prefix_len(),
                subnet.host_count(),
                max_hosts
            );
        }
        hosts.extend(subnet.hosts().take(max_hosts).filter(|host| !skip.contains(host)));
    }
    hosts
}

/// Tuning for a sweep
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Budget for connect plus handshake, per address
    pub probe_timeout: Duration,
    /// Larger subnets are truncated to this many addresses
    pub max_hosts_per_subnet: usize,
    /// Upper bound on simultaneous probes
    pub max_in_flight: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_millis(500),
            max_hosts_per_subnet: 4096,
            max_in_flight: 1024,
        }
    }
}

#[derive(Default)]
struct ScanState {
    scanning: bool,
    results: Vec<DiscoveredPeer>,
}

/// Asynchronous LAN sweep with snapshot results
pub struct Scanner {
    /// Name sent in our side of each handshake
    local_name: String,
    config: ScanConfig,
    state: Arc<Mutex<ScanState>>,
}

impl Scanner {
    pub fn new(local_name: impl Into<String>, config: ScanConfig) -> Self {
        Self {
            local_name: local_name.into(),
            config,
            state: Arc::new(Mutex::new(ScanState::default())),
        }
    }

    /// Sweep every attached subnet for peers on `port`. No-op while a sweep is running.
    pub fn scan(&self, port: u16) {
        self.scan_excluding(port, Vec::new());
    }

    /// Like [`Scanner::scan`], leaving out the addresses in `skip`
    pub fn scan_excluding(&self, port: u16, skip: Vec<Ipv4Addr>) {
        if !self.begin() {
            return;
        }

        let max_hosts = self.config.max_hosts_per_subnet;
        self.spawn_sweep(port, move || candidates(&local_subnets(), max_hosts, &skip));
    }

    /// Sweep an explicit list of addresses. No-op while a sweep is running.
    pub fn scan_hosts(&self, hosts: Vec<Ipv4Addr>, port: u16) {
        if !self.begin() {
            return;
        }
        self.spawn_sweep(port, move || hosts);
    }

    /// Results of the last finished sweep, or `None` while one is in flight
    pub fn results(&self) -> Option<Vec<DiscoveredPeer>> {
        let state = self.lock();
        if state.scanning {
            None
        } else {
            Some(state.results.clone())
        }
    }

    pub fn is_scanning(&self) -> bool {
        self.lock().scanning
    }

    fn lock(&self) -> MutexGuard<'_, ScanState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark a sweep as running and drop the previous results
    fn begin(&self) -> bool {
        let mut state = self.lock();
        if state.scanning {
            return false;
        }
        state.scanning = true;
        state.results.clear();
        true
    }

    fn spawn_sweep<F>(&self, port: u16, candidates: F)
    where
        F: FnOnce() -> Vec<Ipv4Addr> + Send + 'static,
    {
        let state = self.state.clone();
        let local_name: Arc<str> = Arc::from(self.local_name.as_str());
        let config = self.config.clone();

        tokio::spawn(async move {
            let hosts = candidates();
            tracing::info!("Scanning {} addresses on port {}", hosts.len(), port);

            let found = sweep(hosts, port, local_name, &config).await;
            tracing::info!("Scan finished: {} peer(s) found", found.len());

            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            state.results = found;
            state.scanning = false;
        });
    }
}

async fn sweep(
    hosts: Vec<Ipv4Addr>,
    port: u16,
    local_name: Arc<str>,
    config: &ScanConfig,
) -> Vec<DiscoveredPeer> {
    let permits = Arc::new(Semaphore::new(config.max_in_flight.max(1)));
    let mut probes = JoinSet::new();

    for host in hosts {
        let permits = permits.clone();
        let local_name = local_name.clone();
        let timeout = config.probe_timeout;
        probes.spawn(async move {
            let _permit = permits.acquire_owned().await.ok()?;
            probe(SocketAddrV4::new(host, port), &local_name, timeout).await
        });
    }

    let mut found = Vec::new();
    while let Some(joined) = probes.join_next().await {
        if let Ok(Some(peer)) = joined {
            found.push(peer);
        }
    }
    found.sort_by_key(|peer| peer.address);
    found
}

/// Connect to `target` and trade introductions within `timeout`
async fn probe(target: SocketAddrV4, local_name: &str, timeout: Duration) -> Option<DiscoveredPeer> {
    match tokio::time::timeout(timeout, introduce(target, local_name)).await {
        Ok(Ok(name)) => {
            tracing::debug!("Found '{}' at {}", name, target);
            Some(DiscoveredPeer {
                address: *target.ip(),
                port: target.port(),
                name,
            })
        }
        Ok(Err(e)) => {
            tracing::trace!("No peer at {}: {}", target, e);
            None
        }
        Err(_) => None,
    }
}

async fn introduce(target: SocketAddrV4, local_name: &str) -> ConnectionResult<String> {
    let stream = TcpStream::connect(target).await?;
    let mut conn = Connection::new(stream, SocketAddr::V4(target));
    conn.send(&Message::introduce(local_name)).await?;

    let name = loop {
        match conn.recv().await? {
            Some(frame) if frame.message.tag == Tag::INTRODUCE_REPLY => {
                break frame
                    .message
                    .body_as::<String>()
                    .map_err(|e| ConnectionError::Protocol(CodecError::from(e)))?;
            }
            Some(_) => continue,
            None => return Err(ConnectionError::Closed),
        }
    };

    let _ = conn.close().await;
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{Listener, Peer, PeerSocket};
    use std::net::IpAddr;

    #[test]
    fn test_subnet_hosts() {
        let subnet = Subnet::new(Ipv4Addr::new(192, 168, 1, 37), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(subnet.network(), Ipv4Addr::new(192, 168, 1, 0));
        assert_eq!(subnet.prefix_len(), 24);
        assert_eq!(subnet.host_count(), 254);

        let hosts: Vec<_> = subnet.hosts().collect();
        assert_eq!(hosts.len(), 254);
        assert_eq!(hosts.first(), Some(&Ipv4Addr::new(192, 168, 1, 1)));
        assert_eq!(hosts.last(), Some(&Ipv4Addr::new(192, 168, 1, 254)));
    }

    #[test]
    fn test_tiny_subnets() {
        let point_to_point = Subnet::new(Ipv4Addr::new(10, 0, 0, 7), Ipv4Addr::new(255, 255, 255, 254));
        assert_eq!(
            point_to_point.hosts().collect::<Vec<_>>(),
            vec![Ipv4Addr::new(10, 0, 0, 6), Ipv4Addr::new(10, 0, 0, 7)]
        );

        let single = Subnet::new(Ipv4Addr::new(10, 0, 0, 7), Ipv4Addr::BROADCAST);
        assert_eq!(single.hosts().collect::<Vec<_>>(), vec![Ipv4Addr::new(10, 0, 0, 7)]);
    }

    #[test]
    fn test_candidates_skip_and_truncate() {
        let lan = Subnet::new(Ipv4Addr::new(192, 168, 1, 37), Ipv4Addr::new(255, 255, 255, 0));
        let link = Subnet::new(Ipv4Addr::new(10, 0, 0, 7), Ipv4Addr::new(255, 255, 255, 254));

        let hosts = candidates(&[lan, link], 4, &[Ipv4Addr::new(192, 168, 1, 2)]);
        assert_eq!(
            hosts,
            vec![
                Ipv4Addr::new(192, 168, 1, 1),
                Ipv4Addr::new(192, 168, 1, 3),
                Ipv4Addr::new(192, 168, 1, 4),
                Ipv4Addr::new(10, 0, 0, 6),
                Ipv4Addr::new(10, 0, 0, 7),
            ]
        );
    }

    async fn listening(name: &str) -> (Listener, u16) {
        let listener = Listener::new(Peer::new(name));
        listener.start(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let port = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(addr) = listener.local_addr() {
                    return addr.port();
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        (listener, port)
    }

    async fn finished(scanner: &Scanner) -> Vec<DiscoveredPeer> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(results) = scanner.results() {
                    return results;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_scanner_finds_listener() {
        let (_listener, port) = listening("host").await;

        let scanner = Scanner::new("seeker", ScanConfig::default());
        assert_eq!(scanner.results(), Some(Vec::new()));

        // 127.0.0.2 has nobody listening on the port.
        scanner.scan_hosts(vec![Ipv4Addr::LOCALHOST, Ipv4Addr::new(127, 0, 0, 2)], port);
        assert!(scanner.is_scanning());
        assert_eq!(scanner.results(), None);

        // A second call mid-scan is ignored.
        scanner.scan_hosts(vec![], port);
        assert!(scanner.is_scanning());

        let results = finished(&scanner).await;
        assert!(!scanner.is_scanning());
        assert_eq!(
            results,
            vec![DiscoveredPeer {
                address: Ipv4Addr::LOCALHOST,
                port,
                name: "host".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_scanner_reports_namesake() {
        let (_listener, port) = listening("kim").await;

        let scanner = Scanner::new("kim", ScanConfig::default());
        scanner.scan_hosts(vec![Ipv4Addr::LOCALHOST], port);

        let results = finished(&scanner).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "kim");
    }
}
