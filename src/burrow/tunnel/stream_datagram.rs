use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::burrow::packet::IpPacket;
use crate::burrow::protocol::{MAX_STREAM_DATAGRAM_BYTES, Traffic};
use crate::burrow::tunnel::channel::{
    BoxedStream, ChannelEvent, ChannelKind, ControlMessage, DatagramChannel, TrafficCounter,
    build_control,
};

/// Length-framed datagram channel over a reliable (TCP/TLS) stream:
/// `<u16 BE length><payload>` per packet.
pub struct StreamDatagramChannel {
    id: String,
    reader: std::sync::Mutex<Option<ReadHalf<BoxedStream>>>,
    writer: tokio::sync::Mutex<WriteHalf<BoxedStream>>,
    traffic: TrafficCounter,
    connected: AtomicBool,
    /// Rotation deadline picked uniformly in the configured lifespan range.
    expires_at: Option<Instant>,
    cancel: CancellationToken,
}

impl StreamDatagramChannel {
    pub fn new(id: String, stream: BoxedStream, lifespan: Option<(Duration, Duration)>) -> Self {
        let (r, w) = tokio::io::split(stream);
        let expires_at = lifespan.map(|(min, max)| {
            let span = if max > min {
                rand::rng().random_range(min..=max)
            } else {
                min
            };
            Instant::now() + span
        });
        Self {
            id,
            reader: std::sync::Mutex::new(Some(r)),
            writer: tokio::sync::Mutex::new(w),
            traffic: TrafficCounter::default(),
            connected: AtomicBool::new(true),
            expires_at,
            cancel: CancellationToken::new(),
        }
    }

    async fn read_loop(
        &self,
        reader: &mut ReadHalf<BoxedStream>,
        events: &mpsc::Sender<ChannelEvent>,
    ) -> std::io::Result<()> {
        loop {
            let len = reader.read_u16().await? as usize;
            let mut buf = vec![0u8; len];
            reader.read_exact(&mut buf).await?;
            self.traffic.add_received(2 + len as u64);

            match IpPacket::parse(&buf[..]) {
                Ok(p) => {
                    let ev = ChannelEvent::Packets {
                        channel_id: self.id.clone(),
                        packets: vec![p],
                    };
                    if events.send(ev).await.is_err() {
                        return Ok(());
                    }
                }
                Err(err) => {
                    tracing::warn!(channel = %self.id, err = %err, "channel: dropped malformed frame");
                }
            }
        }
    }
}

#[async_trait]
impl DatagramChannel for StreamDatagramChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ChannelKind {
        ChannelKind::Stream
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn traffic(&self) -> Traffic {
        self.traffic.get()
    }

    async fn send_packets(&self, packets: &[IpPacket]) -> std::io::Result<()> {
        if !self.is_connected() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "channel closed",
            ));
        }

        let mut frame = Vec::with_capacity(packets.iter().map(|p| 2 + p.len()).sum());
        for p in packets {
            if p.len() > MAX_STREAM_DATAGRAM_BYTES {
                tracing::warn!(channel = %self.id, len = p.len(), "channel: packet exceeds frame limit");
                continue;
            }
            frame.extend_from_slice(&(p.len() as u16).to_be_bytes());
            frame.extend_from_slice(p.as_bytes());
        }
        if frame.is_empty() {
            return Ok(());
        }

        let mut w = self.writer.lock().await;
        w.write_all(&frame).await?;
        w.flush().await?;
        self.traffic.add_sent(frame.len() as u64);
        Ok(())
    }

    async fn run(self: Arc<Self>, events: mpsc::Sender<ChannelEvent>) {
        let Some(mut reader) = self.reader.lock().unwrap().take() else {
            return;
        };

        let lifespan = async {
            match self.expires_at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = lifespan => {
                // Graceful rotation: tell the peer before going away.
                let _ = self
                    .send_packets(&[build_control(ControlMessage::CloseChannel)])
                    .await;
                tracing::debug!(channel = %self.id, "channel: lifespan elapsed");
            }
            res = self.read_loop(&mut reader, &events) => {
                if let Err(err) = res {
                    tracing::debug!(channel = %self.id, err = %err, "channel: stream ended");
                }
            }
        }

        self.connected.store(false, Ordering::Release);
        let _ = events
            .send(ChannelEvent::Closed {
                channel_id: self.id.clone(),
            })
            .await;
    }

    fn close(&self) {
        self.connected.store(false, Ordering::Release);
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::burrow::packet::build_udp;
    use crate::burrow::tunnel::channel::next_channel_id;

    fn sample_packet(payload: &[u8]) -> IpPacket {
        build_udp(
            "10.0.0.1:1000".parse().unwrap(),
            "1.2.3.4:2000".parse().unwrap(),
            payload,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn frames_roundtrip_between_two_channels() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let ca = Arc::new(StreamDatagramChannel::new(
            next_channel_id("tcp-datagram"),
            Box::new(a),
            None,
        ));
        let cb = Arc::new(StreamDatagramChannel::new(
            next_channel_id("tcp-datagram"),
            Box::new(b),
            None,
        ));

        let (tx, mut rx) = mpsc::channel(16);
        tokio::spawn(cb.clone().run(tx));

        let packets = vec![sample_packet(b"one"), sample_packet(b"two")];
        ca.send_packets(&packets).await.unwrap();

        let mut got = Vec::new();
        while got.len() < 2 {
            match rx.recv().await.unwrap() {
                ChannelEvent::Packets { packets, .. } => got.extend(packets),
                ChannelEvent::Closed { .. } => panic!("closed early"),
            }
        }
        assert_eq!(got[0].udp_payload(), Some(&b"one"[..]));
        assert_eq!(got[1].udp_payload(), Some(&b"two"[..]));

        let sent = ca.traffic().sent;
        let received = cb.traffic().received;
        assert_eq!(sent, received);
        assert!(sent > 0);
    }

    #[tokio::test]
    async fn close_emits_closed_event() {
        let (a, _keep) = tokio::io::duplex(1024);
        let c = Arc::new(StreamDatagramChannel::new(
            next_channel_id("tcp-datagram"),
            Box::new(a),
            None,
        ));
        let (tx, mut rx) = mpsc::channel(4);
        let run = tokio::spawn(c.clone().run(tx));
        c.close();
        run.await.unwrap();
        assert!(!c.is_connected());
        match rx.recv().await.unwrap() {
            ChannelEvent::Closed { channel_id } => assert_eq!(channel_id, c.id()),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn lifespan_rotates_channel() {
        let (a, b) = tokio::io::duplex(4096);
        let c = Arc::new(StreamDatagramChannel::new(
            next_channel_id("tcp-datagram"),
            Box::new(a),
            Some((Duration::from_secs(5), Duration::from_secs(5))),
        ));
        let peer = Arc::new(StreamDatagramChannel::new(
            next_channel_id("tcp-datagram"),
            Box::new(b),
            None,
        ));

        let (tx, mut rx) = mpsc::channel(4);
        let (peer_tx, mut peer_rx) = mpsc::channel(4);
        let run = tokio::spawn(c.clone().run(tx));
        tokio::spawn(peer.clone().run(peer_tx));

        tokio::time::advance(Duration::from_secs(6)).await;
        run.await.unwrap();
        assert!(!c.is_connected());
        assert!(matches!(
            rx.recv().await.unwrap(),
            ChannelEvent::Closed { .. }
        ));

        // The peer saw the close control packet before the channel went away.
        match peer_rx.recv().await.unwrap() {
            ChannelEvent::Packets { packets, .. } => {
                use crate::burrow::tunnel::channel::parse_control;
                assert_eq!(parse_control(&packets[0]), Some(ControlMessage::CloseChannel));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (a, _b) = tokio::io::duplex(1024);
        let c = StreamDatagramChannel::new(next_channel_id("tcp-datagram"), Box::new(a), None);
        c.close();
        let err = c.send_packets(&[sample_packet(b"x")]).await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotConnected);
    }
}
