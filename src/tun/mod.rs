//! The virtual-interface boundary.
//!
//! The host's OS integration layer owns the actual TUN device; the engine
//! only reads and writes raw IP packets through [`PacketSource`]. A
//! [`PacketSourceProvider`] hands the engine a fresh source on every
//! start, so a stopped engine can be started again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Duplex stream of raw IP packets.
#[async_trait]
pub trait PacketSource: Send + Sync {
    /// Interface name (e.g. utun0, tun0, or a test label).
    fn name(&self) -> &str;

    /// Read one IP packet into `buf`, returning its length.
    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize>;

    /// Write one IP packet. Blocks when the write side is full rather
    /// than dropping.
    async fn write_packet(&self, buf: &[u8]) -> Result<usize>;

    /// Close the source. Pending reads fail after this returns.
    async fn close(&self) -> Result<()>;
}

pub type BoxPacketSource = Arc<dyn PacketSource>;

/// Opens the packet source during engine startup.
pub trait PacketSourceProvider: Send + Sync {
    fn open(&self) -> Result<BoxPacketSource>;
}

impl<F> PacketSourceProvider for F
where
    F: Fn() -> Result<BoxPacketSource> + Send + Sync,
{
    fn open(&self) -> Result<BoxPacketSource> {
        self()
    }
}

/// In-memory packet source backed by bounded channels.
///
/// `pair()` returns two connected ends: what one end writes, the other
/// reads. The engine side is handed to the dispatcher; the peer end acts
/// as the "OS" side in tests and embeddings.
pub struct ChannelPacketSource {
    name: String,
    tx: mpsc::Sender<Vec<u8>>,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl ChannelPacketSource {
    /// Create two connected ends with the given per-direction capacity.
    pub fn pair(capacity: usize) -> (Arc<Self>, Arc<Self>) {
        let (a_tx, b_rx) = mpsc::channel(capacity);
        let (b_tx, a_rx) = mpsc::channel(capacity);
        let a = Arc::new(Self {
            name: "mem-tun".to_string(),
            tx: a_tx,
            rx: Mutex::new(a_rx),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });
        let b = Arc::new(Self {
            name: "mem-tun-peer".to_string(),
            tx: b_tx,
            rx: Mutex::new(b_rx),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        });
        (a, b)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl PacketSource for ChannelPacketSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize> {
        if self.is_closed() {
            anyhow::bail!("packet source '{}' is closed", self.name);
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => {
                anyhow::bail!("packet source '{}' is closed", self.name)
            }
            received = rx.recv() => match received {
                Some(packet) => {
                    let n = packet.len().min(buf.len());
                    buf[..n].copy_from_slice(&packet[..n]);
                    Ok(n)
                }
                None => anyhow::bail!("packet source '{}' peer gone", self.name),
            }
        }
    }

    async fn write_packet(&self, buf: &[u8]) -> Result<usize> {
        if self.is_closed() {
            anyhow::bail!("packet source '{}' is closed", self.name);
        }
        self.tx
            .send(buf.to_vec())
            .await
            .map_err(|_| anyhow::anyhow!("packet source '{}' peer gone", self.name))?;
        Ok(buf.len())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!(source = self.name, "packet source closed");
            // Wakes any reader blocked in read_packet.
            self.cancel.cancel();
        }
        Ok(())
    }
}
