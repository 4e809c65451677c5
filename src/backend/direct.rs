//! Direct backend: carries a flow straight to its destination address
//! over an ordinary TCP or UDP socket. This is the reference backend and
//! the default outbound in most configs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::common::EngineError;
use crate::packet::{FlowKey, IpProtocol};

use super::{Backend, BoxFlowTransport, FlowTransport};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RECV_BUF_SIZE: usize = 65535;

pub struct DirectBackend {
    tag: String,
    connect_timeout: Duration,
}

impl DirectBackend {
    pub fn new(tag: String) -> Self {
        Self {
            tag,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl Backend for DirectBackend {
    fn tag(&self) -> &str {
        &self.tag
    }

    async fn connect(&self, key: &FlowKey) -> Result<BoxFlowTransport, EngineError> {
        match key.protocol {
            IpProtocol::Udp => {
                let bind_addr = if key.dst.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
                let socket = UdpSocket::bind(bind_addr).await?;
                socket
                    .connect(key.dst)
                    .await
                    .map_err(|e| EngineError::from_connect_io(e, key.dst))?;
                debug!(flow = %key, local = %socket.local_addr()?, "direct UDP connected");
                Ok(Arc::new(UdpFlowTransport {
                    socket,
                    closed: AtomicBool::new(false),
                    cancel: CancellationToken::new(),
                }))
            }
            IpProtocol::Tcp => {
                let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(key.dst))
                    .await
                    .map_err(|_| {
                        EngineError::ConnectTimeout(format!(
                            "{} after {:?}",
                            key.dst, self.connect_timeout
                        ))
                    })?
                    .map_err(|e| EngineError::from_connect_io(e, key.dst))?;
                stream.set_nodelay(true).ok();
                debug!(flow = %key, "direct TCP connected");
                let (read_half, write_half) = stream.into_split();
                Ok(Arc::new(TcpFlowTransport {
                    read_half: Mutex::new(read_half),
                    write_half: Mutex::new(write_half),
                    closed: AtomicBool::new(false),
                    cancel: CancellationToken::new(),
                }))
            }
            other => Err(EngineError::BackendUnavailable(format!(
                "direct backend does not carry {} flows",
                other.as_str()
            ))),
        }
    }
}

struct UdpFlowTransport {
    socket: UdpSocket,
    closed: AtomicBool,
    cancel: CancellationToken,
}

#[async_trait]
impl FlowTransport for UdpFlowTransport {
    async fn send(&self, data: Bytes) -> Result<(), EngineError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::SessionClosed);
        }
        self.socket.send(&data).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Bytes, EngineError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::SessionClosed);
        }
        let mut buf = vec![0u8; RECV_BUF_SIZE];
        tokio::select! {
            _ = self.cancel.cancelled() => Err(EngineError::SessionClosed),
            result = self.socket.recv(&mut buf) => {
                let n = result?;
                buf.truncate(n);
                Ok(Bytes::from(buf))
            }
        }
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.cancel.cancel();
        }
    }
}

struct TcpFlowTransport {
    read_half: Mutex<tokio::net::tcp::OwnedReadHalf>,
    write_half: Mutex<tokio::net::tcp::OwnedWriteHalf>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

#[async_trait]
impl FlowTransport for TcpFlowTransport {
    async fn send(&self, data: Bytes) -> Result<(), EngineError> {
        use tokio::io::AsyncWriteExt;
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::SessionClosed);
        }
        let mut write_half = self.write_half.lock().await;
        write_half.write_all(&data).await?;
        Ok(())
    }

    async fn recv(&self) -> Result<Bytes, EngineError> {
        use tokio::io::AsyncReadExt;
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::SessionClosed);
        }
        let mut buf = vec![0u8; RECV_BUF_SIZE];
        let mut read_half = self.read_half.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(EngineError::SessionClosed),
            result = read_half.read(&mut buf) => {
                let n = result?;
                if n == 0 {
                    return Err(EngineError::SessionClosed);
                }
                buf.truncate(n);
                Ok(Bytes::from(buf))
            }
        }
    }

    async fn close(&self) {
        use tokio::io::AsyncWriteExt;
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.cancel.cancel();
            // Flush pending bytes, then FIN; best effort.
            let mut write_half = self.write_half.lock().await;
            let _ = write_half.shutdown().await;
        }
    }
}
