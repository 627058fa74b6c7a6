use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::burrow::packet::{IpPacket, IpVersion, TransportProtocol};

#[derive(Debug, Error)]
pub enum NatError {
    #[error("packet carries no NAT-able flow id")]
    Unsupported,
    #[error("no free replacement id in ({0:?}, {1:?})")]
    Exhausted(IpVersion, u8),
}

/// One translated flow: the original five-tuple-ish key plus the replacement
/// id (ephemeral UDP/TCP source port or ICMP query id) stamped onto outbound
/// packets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NatItem {
    pub version: IpVersion,
    pub protocol: TransportProtocol,
    pub source_address: IpAddr,
    pub source_id: u16,
    pub destination_address: IpAddr,
    pub destination_id: u16,
    pub replacement_id: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FlowKey {
    source_address: IpAddr,
    source_id: u16,
    destination_address: IpAddr,
    destination_id: u16,
}

struct NatEntry {
    item: NatItem,
    last_used: Instant,
}

#[derive(Default)]
struct Bucket {
    forward: HashMap<FlowKey, NatEntry>,
    reverse: HashMap<u16, FlowKey>,
}

impl Bucket {
    fn evict_expired(&mut self, timeout: Duration) {
        let expired: Vec<FlowKey> = self
            .forward
            .iter()
            .filter(|(_, e)| e.last_used.elapsed() >= timeout)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            if let Some(e) = self.forward.remove(&key) {
                self.reverse.remove(&e.item.replacement_id);
            }
        }
    }
}

/// Per-(version, protocol) NAT buckets. The map entry itself is the bucket
/// lock; replacement ids are unique within a bucket while the item lives.
pub struct NatTable {
    buckets: DashMap<(IpVersion, u8), Bucket>,
    timeout: Duration,
}

impl NatTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            buckets: DashMap::new(),
            timeout,
        }
    }

    fn flow_of(packet: &IpPacket) -> Result<(FlowKey, TransportProtocol), NatError> {
        let protocol = packet.protocol();
        let (source_id, destination_id) = match protocol {
            TransportProtocol::Tcp | TransportProtocol::Udp => (
                packet.source_port().ok_or(NatError::Unsupported)?,
                packet.destination_port().ok_or(NatError::Unsupported)?,
            ),
            TransportProtocol::Icmp | TransportProtocol::IcmpV6 => {
                (packet.icmp_echo_id().ok_or(NatError::Unsupported)?, 0)
            }
            TransportProtocol::Other(_) => return Err(NatError::Unsupported),
        };
        Ok((
            FlowKey {
                source_address: packet.source(),
                source_id,
                destination_address: packet.destination(),
                destination_id,
            },
            protocol,
        ))
    }

    /// Returns the live item for the packet's flow, allocating a fresh
    /// replacement id when the flow is new.
    pub fn get_or_add(&self, packet: &IpPacket) -> Result<NatItem, NatError> {
        let (key, protocol) = Self::flow_of(packet)?;
        let version = packet.version();
        let mut bucket = self
            .buckets
            .entry((version, protocol.value()))
            .or_default();

        if let Some(e) = bucket.forward.get_mut(&key) {
            if e.last_used.elapsed() < self.timeout {
                e.last_used = Instant::now();
                return Ok(e.item.clone());
            }
            let stale = e.item.replacement_id;
            bucket.forward.remove(&key);
            bucket.reverse.remove(&stale);
        }

        // Entries may have gone idle since the last pass; reclaim their ids
        // before scanning for a free one.
        bucket.evict_expired(self.timeout);

        let base: u16 = rand::random();
        let mut replacement_id = None;
        for offset in 0..=u16::MAX {
            let candidate = base.wrapping_add(offset);
            if candidate == 0 {
                continue;
            }
            if !bucket.reverse.contains_key(&candidate) {
                replacement_id = Some(candidate);
                break;
            }
        }
        let replacement_id =
            replacement_id.ok_or(NatError::Exhausted(version, protocol.value()))?;

        let item = NatItem {
            version,
            protocol,
            source_address: key.source_address,
            source_id: key.source_id,
            destination_address: key.destination_address,
            destination_id: key.destination_id,
            replacement_id,
        };
        bucket.reverse.insert(replacement_id, key.clone());
        bucket.forward.insert(
            key,
            NatEntry {
                item: item.clone(),
                last_used: Instant::now(),
            },
        );
        tracing::trace!(?item, "nat: new mapping");
        Ok(item)
    }

    /// Reverses a replacement id for a reply packet, refreshing the item.
    pub fn resolve(
        &self,
        version: IpVersion,
        protocol: TransportProtocol,
        replacement_id: u16,
    ) -> Option<NatItem> {
        let mut bucket = self.buckets.get_mut(&(version, protocol.value()))?;
        let key = bucket.reverse.get(&replacement_id)?.clone();
        let e = bucket.forward.get_mut(&key)?;
        if e.last_used.elapsed() >= self.timeout {
            bucket.forward.remove(&key);
            bucket.reverse.remove(&replacement_id);
            return None;
        }
        e.last_used = Instant::now();
        Some(e.item.clone())
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.forward.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Eviction pass over every bucket.
    pub fn cleanup(&self) {
        for mut bucket in self.buckets.iter_mut() {
            bucket.evict_expired(self.timeout);
        }
    }

    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let table = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = tick.tick() => table.cleanup(),
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::burrow::packet::{build_icmp, build_udp, ICMP_V4_ECHO_REQUEST};

    fn udp_packet(src_port: u16, dst: &str) -> IpPacket {
        build_udp(
            format!("10.0.0.9:{src_port}").parse().unwrap(),
            dst.parse().unwrap(),
            b"data",
        )
        .unwrap()
    }

    fn echo_packet(id: u16) -> IpPacket {
        let mut msg = vec![ICMP_V4_ECHO_REQUEST, 0, 0, 0];
        msg.extend_from_slice(&id.to_be_bytes());
        msg.extend_from_slice(&[0, 1]);
        msg.extend_from_slice(b"ping");
        build_icmp(
            "10.0.0.9".parse().unwrap(),
            "8.8.8.8".parse().unwrap(),
            &msg,
        )
        .unwrap()
    }

    #[test]
    fn same_flow_returns_same_item() {
        let nat = NatTable::new(Duration::from_secs(60));
        let p = udp_packet(5000, "1.1.1.1:53");
        let a = nat.get_or_add(&p).unwrap();
        let b = nat.get_or_add(&p).unwrap();
        assert_eq!(a, b);
        assert_eq!(nat.len(), 1);
    }

    #[test]
    fn replacement_ids_unique_within_bucket() {
        let nat = NatTable::new(Duration::from_secs(60));
        let mut seen = std::collections::HashSet::new();
        for port in 1..=200u16 {
            let item = nat.get_or_add(&udp_packet(port, "1.1.1.1:53")).unwrap();
            assert!(seen.insert(item.replacement_id), "duplicate id");
        }
    }

    #[test]
    fn buckets_are_independent() {
        let nat = NatTable::new(Duration::from_secs(60));
        let udp = nat.get_or_add(&udp_packet(5000, "1.1.1.1:53")).unwrap();
        let icmp = nat.get_or_add(&echo_packet(5000)).unwrap();
        // Same replacement id may legally appear across buckets; the lookup
        // key includes the protocol.
        let back = nat
            .resolve(IpVersion::V4, TransportProtocol::Udp, udp.replacement_id)
            .unwrap();
        assert_eq!(back.source_id, 5000);
        let back = nat
            .resolve(IpVersion::V4, TransportProtocol::Icmp, icmp.replacement_id)
            .unwrap();
        assert_eq!(back.protocol, TransportProtocol::Icmp);
    }

    #[test]
    fn resolve_unknown_id_is_none() {
        let nat = NatTable::new(Duration::from_secs(60));
        let item = nat.get_or_add(&udp_packet(1, "1.1.1.1:53")).unwrap();
        let missing = item.replacement_id.wrapping_add(1);
        assert!(
            nat.resolve(IpVersion::V4, TransportProtocol::Udp, missing)
                .is_none()
        );
    }

    #[test]
    fn idle_items_are_evicted() {
        let nat = NatTable::new(Duration::from_millis(20));
        let item = nat.get_or_add(&udp_packet(7, "1.1.1.1:53")).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        assert!(
            nat.resolve(IpVersion::V4, TransportProtocol::Udp, item.replacement_id)
                .is_none()
        );
        nat.cleanup();
        assert!(nat.is_empty());
    }

    #[test]
    fn expired_flow_gets_fresh_item() {
        let nat = NatTable::new(Duration::from_millis(20));
        let p = udp_packet(9, "1.1.1.1:53");
        let first = nat.get_or_add(&p).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        let second = nat.get_or_add(&p).unwrap();
        assert_eq!(first.source_id, second.source_id);
        assert_eq!(nat.len(), 1);
    }

    #[test]
    fn non_flow_packets_rejected() {
        let nat = NatTable::new(Duration::from_secs(60));
        // Neighbor solicitation has no echo id.
        let nd = build_icmp(
            "fe80::1".parse().unwrap(),
            "ff02::1".parse().unwrap(),
            &[135u8, 0, 0, 0, 0, 0, 0, 0],
        )
        .unwrap();
        assert!(matches!(nat.get_or_add(&nd), Err(NatError::Unsupported)));
    }
}
