use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::burrow::protocol::Traffic;
use crate::burrow::tunnel::channel::{BoxedStream, TrafficCounter};

pub const DEFAULT_COPY_CHUNK: usize = 16 * 1024;

/// Bidirectional byte-copy bridge between the tunnel-side stream and a host
/// stream; used for TCP passthrough. Byte order is preserved end to end.
pub struct StreamProxyChannel {
    id: String,
    streams: std::sync::Mutex<Option<(BoxedStream, BoxedStream)>>,
    traffic: TrafficCounter,
    connected: AtomicBool,
    cancel: CancellationToken,
    /// Copy buffer cap; bounds how much cleartext a single TLS record can
    /// carry on the tunnel side.
    chunk_size: usize,
}

impl StreamProxyChannel {
    pub fn new(id: String, tunnel_stream: BoxedStream, host_stream: BoxedStream) -> Self {
        Self::with_chunk_size(id, tunnel_stream, host_stream, DEFAULT_COPY_CHUNK)
    }

    pub fn with_chunk_size(
        id: String,
        tunnel_stream: BoxedStream,
        host_stream: BoxedStream,
        chunk_size: usize,
    ) -> Self {
        Self {
            id,
            streams: std::sync::Mutex::new(Some((tunnel_stream, host_stream))),
            traffic: TrafficCounter::default(),
            connected: AtomicBool::new(true),
            cancel: CancellationToken::new(),
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn traffic(&self) -> Traffic {
        self.traffic.get()
    }

    pub fn close(&self) {
        self.connected.store(false, Ordering::Release);
        self.cancel.cancel();
    }

    /// Copies bytes in both directions until either side closes or errors.
    /// `sent` counts bytes written toward the tunnel, `received` bytes read
    /// from it.
    pub async fn run(self: Arc<Self>) {
        let Some((tunnel_stream, host_stream)) = self.streams.lock().unwrap().take() else {
            return;
        };
        let (mut tunnel_r, mut tunnel_w) = tokio::io::split(tunnel_stream);
        let (mut host_r, mut host_w) = tokio::io::split(host_stream);

        let this = self.clone();
        let upstream = async {
            let mut buf = vec![0u8; this.chunk_size];
            loop {
                let n = tunnel_r.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                host_w.write_all(&buf[..n]).await?;
                this.traffic.add_received(n as u64);
            }
            host_w.shutdown().await?;
            Ok::<(), std::io::Error>(())
        };

        let this = self.clone();
        let downstream = async {
            let mut buf = vec![0u8; this.chunk_size];
            loop {
                let n = host_r.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                tunnel_w.write_all(&buf[..n]).await?;
                this.traffic.add_sent(n as u64);
            }
            tunnel_w.shutdown().await?;
            Ok::<(), std::io::Error>(())
        };

        tokio::select! {
            _ = self.cancel.cancelled() => {}
            res = async { tokio::try_join!(upstream, downstream) } => {
                if let Err(err) = res {
                    tracing::debug!(channel = %self.id, err = %err, "proxy channel: copy ended");
                }
            }
        }

        self.connected.store(false, Ordering::Release);
    }
}
