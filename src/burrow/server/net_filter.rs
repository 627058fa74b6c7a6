use std::net::{IpAddr, SocketAddr};

use ipnet::IpNet;

/// Destination policy applied to every proxied flow. An empty include list
/// admits everything; loopback and unspecified destinations are always
/// refused so tunneled traffic cannot reach the server host itself.
pub struct NetFilter {
    include: Vec<IpNet>,
    exclude: Vec<IpNet>,
    block_loopback: bool,
}

impl NetFilter {
    pub fn new(include: Vec<IpNet>, exclude: Vec<IpNet>) -> Self {
        Self {
            include,
            exclude,
            block_loopback: true,
        }
    }

    /// Test servers proxy to local fixtures; production filters never admit
    /// the server host itself.
    pub fn with_loopback_allowed(include: Vec<IpNet>, exclude: Vec<IpNet>) -> Self {
        Self {
            include,
            exclude,
            block_loopback: false,
        }
    }

    pub fn include_ranges(&self) -> &[IpNet] {
        &self.include
    }

    fn is_allowed(&self, ip: IpAddr) -> bool {
        if ip.is_unspecified() || (self.block_loopback && ip.is_loopback()) {
            return false;
        }
        if self.exclude.iter().any(|n| n.contains(&ip)) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|n| n.contains(&ip))
    }

    /// Accepts or maps a destination endpoint; `None` means the flow is
    /// blocked. The identity mapping is the common case; derived filters may
    /// rewrite (e.g. force a DNS upstream).
    pub fn process(&self, destination: SocketAddr) -> Option<SocketAddr> {
        self.is_allowed(destination.ip()).then_some(destination)
    }
}

impl Default for NetFilter {
    fn default() -> Self {
        Self::new(Vec::new(), Vec::new())
    }
}
