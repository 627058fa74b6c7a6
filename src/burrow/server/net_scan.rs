use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Flags clients that touch too many distinct remote endpoints inside a
/// sliding window; the classic signature of a port/net scan through the
/// tunnel.
pub struct NetScanDetector {
    /// 0 disables detection.
    limit: usize,
    window: Duration,
    seen: Mutex<HashMap<SocketAddr, Instant>>,
}

impl NetScanDetector {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Records the endpoint and returns false when the burst limit is
    /// exceeded.
    pub fn verify(&self, destination: SocketAddr) -> bool {
        if self.limit == 0 {
            return true;
        }
        let mut seen = self.seen.lock().unwrap();
        let now = Instant::now();
        seen.retain(|_, at| now.duration_since(*at) < self.window);
        seen.insert(destination, now);
        seen.len() <= self.limit
    }

    pub fn distinct_endpoints(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ep(port: u16) -> SocketAddr {
        format!("1.2.3.4:{port}").parse().unwrap()
    }

    #[test]
    fn triggers_over_limit() {
        let d = NetScanDetector::new(3, Duration::from_secs(10));
        assert!(d.verify(ep(1)));
        assert!(d.verify(ep(2)));
        assert!(d.verify(ep(3)));
        assert!(!d.verify(ep(4)));
    }

    #[test]
    fn repeat_endpoint_is_not_a_scan() {
        let d = NetScanDetector::new(2, Duration::from_secs(10));
        for _ in 0..10 {
            assert!(d.verify(ep(1)));
        }
    }

    #[test]
    fn window_expiry_resets_count() {
        let d = NetScanDetector::new(2, Duration::from_millis(30));
        assert!(d.verify(ep(1)));
        assert!(d.verify(ep(2)));
        std::thread::sleep(Duration::from_millis(40));
        assert!(d.verify(ep(3)));
    }

    #[test]
    fn zero_limit_disables() {
        let d = NetScanDetector::new(0, Duration::from_secs(10));
        for port in 1..100 {
            assert!(d.verify(ep(port)));
        }
    }
}
