pub mod channel;
pub mod stream_datagram;
pub mod stream_proxy;
pub mod udp_channel;

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Notify, Semaphore, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::burrow::packet::{self, IpPacket, IpVersion};
use crate::burrow::protocol::Traffic;

pub use channel::{ChannelEvent, ChannelKind, DatagramChannel};
pub use stream_datagram::StreamDatagramChannel;
pub use stream_proxy::StreamProxyChannel;
pub use udp_channel::UdpChannel;

const EVENT_QUEUE: usize = 128;
const DELIVERY_QUEUE: usize = 128;

#[derive(Debug, Error)]
pub enum TunnelError {
    /// The outbound queue stayed full for the whole datagram timeout.
    #[error("tunnel congested")]
    Congested,
    #[error("tunnel disposed")]
    Disposed,
    #[error("channel {0} already added")]
    DuplicateChannel(String),
}

#[derive(Debug, Clone)]
pub struct TunnelOptions {
    pub max_datagram_channel_count: usize,
    /// Largest batch the tunnel packs into one send; packets above this are
    /// sent alone (or bounced for MTU discovery when DF forbids it).
    pub mtu_no_fragment: usize,
    /// Absolute cap; anything above is dropped.
    pub mtu_with_fragment: usize,
    pub queue_capacity: usize,
    pub enqueue_timeout: Duration,
    pub speed_interval: Duration,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            max_datagram_channel_count: 8,
            mtu_no_fragment: 1500,
            mtu_with_fragment: 8192,
            queue_capacity: 100,
            enqueue_timeout: Duration::from_secs(100),
            speed_interval: Duration::from_secs(2),
        }
    }
}

struct DatagramEntry {
    channel: Arc<dyn DatagramChannel>,
    _runner: tokio::task::JoinHandle<()>,
    _worker: tokio::task::JoinHandle<()>,
}

struct ProxyEntry {
    channel: Arc<StreamProxyChannel>,
    _runner: tokio::task::JoinHandle<()>,
}

#[derive(Default)]
struct State {
    /// Datagram channels, oldest first.
    datagram: Vec<DatagramEntry>,
    proxies: Vec<ProxyEntry>,
    removed_traffic: Traffic,
}

struct Metrics {
    speed: Traffic,
    last_traffic: Traffic,
    last_activity: Instant,
}

struct Inner {
    opts: TunnelOptions,
    queue: std::sync::Mutex<VecDeque<IpPacket>>,
    packets_available: Semaphore,
    packet_sent: Notify,
    state: std::sync::Mutex<State>,
    metrics: std::sync::Mutex<Metrics>,
    events_tx: mpsc::Sender<ChannelEvent>,
    cancel: CancellationToken,
    disposed: AtomicBool,
}

/// Fan-in/out of IP packets across the session's datagram channels, plus
/// bookkeeping for its stream proxy channels.
///
/// Owned by exactly one session (or the client core); everything else holds
/// the delivery receiver handed out at construction.
pub struct Tunnel {
    inner: Arc<Inner>,
}

impl Tunnel {
    pub fn new(opts: TunnelOptions) -> (Self, mpsc::Receiver<Vec<IpPacket>>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (delivery_tx, delivery_rx) = mpsc::channel(DELIVERY_QUEUE);

        let inner = Arc::new(Inner {
            opts,
            queue: std::sync::Mutex::new(VecDeque::new()),
            packets_available: Semaphore::new(0),
            packet_sent: Notify::new(),
            state: std::sync::Mutex::new(State::default()),
            metrics: std::sync::Mutex::new(Metrics {
                speed: Traffic::default(),
                last_traffic: Traffic::default(),
                last_activity: Instant::now(),
            }),
            events_tx,
            cancel: CancellationToken::new(),
            disposed: AtomicBool::new(false),
        });

        tokio::spawn(Inner::pump(inner.clone(), events_rx, delivery_tx));
        tokio::spawn(Inner::speed_loop(inner.clone()));

        (Self { inner }, delivery_rx)
    }

    pub fn add_datagram_channel(
        &self,
        channel: Arc<dyn DatagramChannel>,
    ) -> Result<(), TunnelError> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(TunnelError::Disposed);
        }

        let mut st = self.inner.state.lock().unwrap();
        if st.datagram.iter().any(|e| e.channel.id() == channel.id()) {
            return Err(TunnelError::DuplicateChannel(channel.id().to_string()));
        }

        // UDP and stream datagram channels never coexist.
        let kind = channel.kind();
        let evicted: Vec<usize> = st
            .datagram
            .iter()
            .enumerate()
            .filter(|(_, e)| e.channel.kind() != kind)
            .map(|(i, _)| i)
            .rev()
            .collect();
        for i in evicted {
            let entry = st.datagram.remove(i);
            tracing::debug!(channel = %entry.channel.id(), "tunnel: evicting channel of other kind");
            Inner::retire(&self.inner, &mut st, entry.channel);
        }

        let runner = tokio::spawn(channel.clone().run(self.inner.events_tx.clone()));
        let worker = tokio::spawn(Inner::sender_worker(self.inner.clone(), channel.clone()));
        st.datagram.push(DatagramEntry {
            channel,
            _runner: runner,
            _worker: worker,
        });

        while st.datagram.len() > self.inner.opts.max_datagram_channel_count {
            let entry = st.datagram.remove(0);
            tracing::debug!(channel = %entry.channel.id(), "tunnel: evicting oldest channel");
            Inner::retire(&self.inner, &mut st, entry.channel);
        }
        Ok(())
    }

    pub fn add_stream_proxy_channel(
        &self,
        channel: Arc<StreamProxyChannel>,
    ) -> Result<(), TunnelError> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(TunnelError::Disposed);
        }
        let mut st = self.inner.state.lock().unwrap();
        if st.proxies.iter().any(|e| e.channel.id() == channel.id()) {
            return Err(TunnelError::DuplicateChannel(channel.id().to_string()));
        }
        let runner = tokio::spawn(channel.clone().run());
        st.proxies.push(ProxyEntry {
            channel,
            _runner: runner,
        });
        Ok(())
    }

    pub fn remove_channel(&self, channel_id: &str) {
        self.inner.remove_channel(channel_id);
    }

    pub async fn send_packet(&self, packet: IpPacket) -> Result<(), TunnelError> {
        self.send_packets(vec![packet]).await
    }

    pub async fn send_packets(&self, packets: Vec<IpPacket>) -> Result<(), TunnelError> {
        self.inner.send_packets(packets).await
    }

    pub fn datagram_channel_count(&self) -> usize {
        self.inner.state.lock().unwrap().datagram.len()
    }

    /// Packets waiting for a sender worker.
    pub fn pending_packets(&self) -> usize {
        self.inner.queue.lock().unwrap().len()
    }

    pub fn datagram_channel_kind(&self) -> Option<ChannelKind> {
        self.inner
            .state
            .lock()
            .unwrap()
            .datagram
            .first()
            .map(|e| e.channel.kind())
    }

    pub fn stream_proxy_channel_count(&self) -> usize {
        let st = self.inner.state.lock().unwrap();
        st.proxies.iter().filter(|e| e.channel.is_connected()).count()
    }

    pub fn max_datagram_channel_count(&self) -> usize {
        self.inner.opts.max_datagram_channel_count
    }

    pub fn traffic(&self) -> Traffic {
        self.inner.traffic()
    }

    /// Bytes per second over the last accounting interval.
    pub fn speed(&self) -> Traffic {
        self.inner.metrics.lock().unwrap().speed
    }

    pub fn last_activity(&self) -> Instant {
        self.inner.metrics.lock().unwrap().last_activity
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    /// Stops all workers and channels; idempotent.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel.cancel();
        // Unblock any queue waiter or parked sender worker.
        self.inner
            .packets_available
            .add_permits(self.inner.opts.max_datagram_channel_count * 10 + 1);
        self.inner.packet_sent.notify_waiters();

        let mut st = self.inner.state.lock().unwrap();
        let datagram: Vec<_> = st.datagram.drain(..).collect();
        let proxies: Vec<_> = st.proxies.drain(..).collect();
        for e in datagram {
            st.removed_traffic += e.channel.traffic();
            e.channel.close();
        }
        for e in proxies {
            st.removed_traffic += e.channel.traffic();
            e.channel.close();
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl Inner {
    fn retire(inner: &Arc<Inner>, st: &mut State, channel: Arc<dyn DatagramChannel>) {
        st.removed_traffic += channel.traffic();
        channel.close();
        // Wake a parked worker so the closed channel's task can exit.
        inner.packets_available.add_permits(1);
    }

    fn remove_channel(self: &Arc<Self>, channel_id: &str) {
        let mut st = self.state.lock().unwrap();
        if let Some(i) = st
            .datagram
            .iter()
            .position(|e| e.channel.id() == channel_id)
        {
            let entry = st.datagram.remove(i);
            Inner::retire(self, &mut st, entry.channel);
            return;
        }
        if let Some(i) = st.proxies.iter().position(|e| e.channel.id() == channel_id) {
            let entry = st.proxies.remove(i);
            st.removed_traffic += entry.channel.traffic();
            entry.channel.close();
        }
    }

    async fn send_packets(self: &Arc<Self>, packets: Vec<IpPacket>) -> Result<(), TunnelError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(TunnelError::Disposed);
        }
        let deadline = Instant::now() + self.opts.enqueue_timeout;
        for p in packets {
            self.enqueue(p, deadline).await?;
        }
        let grant = self
            .state
            .lock()
            .unwrap()
            .datagram
            .len()
            .max(1);
        self.packets_available.add_permits(grant);
        Ok(())
    }

    async fn enqueue(&self, packet: IpPacket, deadline: Instant) -> Result<(), TunnelError> {
        let mut packet = Some(packet);
        loop {
            if self.disposed.load(Ordering::Acquire) {
                return Err(TunnelError::Disposed);
            }
            {
                let mut q = self.queue.lock().unwrap();
                if q.len() < self.opts.queue_capacity {
                    q.push_back(packet.take().expect("packet still pending"));
                    return Ok(());
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TunnelError::Congested);
            }
            // Spin-wait on the packet-sent signal; re-checks once a second so
            // a missed notification cannot strand the producer.
            let wait = Duration::from_secs(1).min(deadline - now);
            let _ = tokio::time::timeout(wait, self.packet_sent.notified()).await;
        }
    }

    /// Drains a send batch honoring the MTU discipline. Returns the batch
    /// and any MTU-discovery replies owed upstream.
    fn drain_batch(&self) -> (Vec<IpPacket>, Vec<IpPacket>) {
        let mut q = self.queue.lock().unwrap();
        let mut batch = Vec::new();
        let mut replies = Vec::new();
        let mut size = 0usize;

        while let Some(p) = q.pop_front() {
            let len = p.len();
            if len > self.opts.mtu_with_fragment {
                tracing::warn!(len, cap = self.opts.mtu_with_fragment, "tunnel: dropped oversize packet");
                continue;
            }
            if len > self.opts.mtu_no_fragment
                && p.version() == IpVersion::V4
                && p.dont_fragment()
            {
                tracing::debug!(len, mtu = self.opts.mtu_no_fragment, "tunnel: bouncing DF packet for MTU discovery");
                if let Ok(r) = packet::build_packet_too_big(&p, self.opts.mtu_no_fragment as u16) {
                    replies.push(r);
                }
                continue;
            }
            if len > self.opts.mtu_no_fragment {
                // Send alone; flush whatever was batched first.
                if batch.is_empty() {
                    batch.push(p);
                } else {
                    q.push_front(p);
                }
                break;
            }
            if !batch.is_empty() && size + len >= self.opts.mtu_no_fragment {
                q.push_front(p);
                break;
            }
            size += len;
            batch.push(p);
        }
        (batch, replies)
    }

    async fn sender_worker(self: Arc<Self>, channel: Arc<dyn DatagramChannel>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                permit = self.packets_available.acquire() => match permit {
                    Ok(p) => p.forget(),
                    Err(_) => break,
                },
            }
            if self.disposed.load(Ordering::Acquire) || !channel.is_connected() {
                break;
            }

            let (batch, replies) = self.drain_batch();
            if !replies.is_empty() {
                let _ = self
                    .events_tx
                    .send(ChannelEvent::Packets {
                        channel_id: channel.id().to_string(),
                        packets: replies,
                    })
                    .await;
            }
            if batch.is_empty() {
                continue;
            }

            match channel.send_packets(&batch).await {
                Ok(()) => {
                    self.packet_sent.notify_waiters();
                    self.packets_available.add_permits(1);
                }
                Err(err) => {
                    tracing::warn!(channel = %channel.id(), err = %err, "tunnel: send failed; requeueing batch");
                    let _ = self.send_packets(batch).await;
                    if !channel.is_connected() {
                        self.remove_channel(channel.id());
                        break;
                    }
                }
            }
        }
    }

    /// Routes channel events: control messages are consumed, user packets go
    /// to the delivery queue, closed channels get removed.
    async fn pump(
        self: Arc<Self>,
        mut events_rx: mpsc::Receiver<ChannelEvent>,
        delivery_tx: mpsc::Sender<Vec<IpPacket>>,
    ) {
        loop {
            let ev = tokio::select! {
                _ = self.cancel.cancelled() => break,
                ev = events_rx.recv() => match ev {
                    Some(ev) => ev,
                    None => break,
                },
            };

            match ev {
                ChannelEvent::Packets {
                    channel_id,
                    packets,
                } => {
                    let mut out = Vec::with_capacity(packets.len());
                    for p in packets {
                        match channel::parse_control(&p) {
                            Some(channel::ControlMessage::CloseChannel) => {
                                tracing::debug!(channel = %channel_id, "tunnel: peer rotated channel");
                                self.remove_channel(&channel_id);
                            }
                            None => out.push(p),
                        }
                    }
                    if !out.is_empty() && delivery_tx.send(out).await.is_err() {
                        // Consumer is gone; keep draining so channels do not
                        // block, but nothing is delivered anymore.
                    }
                }
                ChannelEvent::Closed { channel_id } => {
                    self.remove_channel(&channel_id);
                }
            }
        }
    }

    fn traffic(&self) -> Traffic {
        let st = self.state.lock().unwrap();
        let mut t = st.removed_traffic;
        for e in &st.datagram {
            t += e.channel.traffic();
        }
        for e in &st.proxies {
            t += e.channel.traffic();
        }
        t
    }

    async fn speed_loop(self: Arc<Self>) {
        let interval = self.opts.speed_interval;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            // Retire finished proxy channels so their counters stay counted.
            {
                let mut st = self.state.lock().unwrap();
                let done: Vec<usize> = st
                    .proxies
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| !e.channel.is_connected())
                    .map(|(i, _)| i)
                    .rev()
                    .collect();
                for i in done {
                    let entry = st.proxies.remove(i);
                    st.removed_traffic += entry.channel.traffic();
                }
            }

            let now = self.traffic();
            let mut m = self.metrics.lock().unwrap();
            let delta = now - m.last_traffic;
            let secs = interval.as_secs_f64().max(f64::EPSILON);
            m.speed = Traffic {
                sent: (delta.sent as f64 / secs) as u64,
                received: (delta.received as f64 / secs) as u64,
            };
            if delta != Traffic::default() {
                m.last_activity = Instant::now();
            }
            m.last_traffic = now;
        }
    }
}
