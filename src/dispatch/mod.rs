//! Packet dispatch: the single read loop over the packet source.
//!
//! One task reads packets in arrival order, so packets of the same flow
//! are handed to their session in order. The backend→device direction
//! runs as one pump task per session, spawned on session creation.
//!
//! The TCP path terminates the handshake locally: SYN is answered with
//! SYN-ACK once the backend connect succeeds, payload segments are
//! acked and forwarded as a byte stream, FIN/RST tear the session down.

use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::common::{metrics, EngineError, EngineErrorKind, EngineMetrics};
use crate::config::ConfigManager;
use crate::packet::{
    build_tcp_packet_ipv4, build_udp_packet_ipv4, parse_ip_packet, parse_tcp_header, udp_payload,
    FlowKey, IpProtocol, ParsedPacket,
};
use crate::session::{Session, SessionTable};
use crate::tun::BoxPacketSource;

const TCP_FIN: u8 = 0x01;
const TCP_SYN: u8 = 0x02;
const TCP_RST: u8 = 0x04;
const TCP_PSH: u8 = 0x08;
const TCP_ACK: u8 = 0x10;

/// Initial send sequence for locally terminated TCP flows.
const TCP_ISS: u32 = 0x0001_0000;

const MAX_PACKET: usize = 65536;

pub struct Dispatcher {
    source: BoxPacketSource,
    config: Arc<ConfigManager>,
    table: Arc<SessionTable>,
    metrics: Arc<EngineMetrics>,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        source: BoxPacketSource,
        config: Arc<ConfigManager>,
        table: Arc<SessionTable>,
        metrics: Arc<EngineMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            source,
            config,
            table,
            metrics,
            cancel,
        }
    }

    /// Run the device→backend read loop until cancellation or a fatal
    /// source failure. Per-packet failures are counted and dropped; only
    /// the packet source dying is fatal.
    pub async fn run(&self) -> Result<(), EngineError> {
        let mut buf = vec![0u8; MAX_PACKET];
        loop {
            let n = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                read = self.source.read_packet(&mut buf) => match read {
                    Ok(0) => return Ok(()),
                    Ok(n) => n,
                    Err(e) => {
                        if self.cancel.is_cancelled() {
                            return Ok(());
                        }
                        error!(error = %e, "packet source read failed");
                        return Err(EngineError::Io(std::io::Error::new(
                            std::io::ErrorKind::Other,
                            e.to_string(),
                        )));
                    }
                },
            };

            metrics::inc(&self.metrics.packets_in);
            if let Err(e) = self.handle_packet(&buf[..n]).await {
                match e.kind() {
                    EngineErrorKind::MalformedPacket => {
                        metrics::inc(&self.metrics.malformed_dropped);
                        self.metrics.record_error(e.kind().as_str());
                        debug!(error = %e, len = n, "malformed packet dropped");
                    }
                    kind => {
                        metrics::inc(&self.metrics.backend_errors);
                        self.metrics.record_error(kind.as_str());
                        debug!(error = %e, kind = kind.as_str(), "packet dropped");
                    }
                }
            }
        }
    }

    /// Dispatch a single raw IP packet.
    pub async fn handle_packet(&self, data: &[u8]) -> Result<(), EngineError> {
        let parsed = parse_ip_packet(data)?;
        let key = FlowKey::from_parsed(&parsed);

        match parsed.protocol {
            IpProtocol::Udp => self.handle_udp(data, &parsed, key).await,
            IpProtocol::Tcp => self.handle_tcp(data, &parsed, key).await,
            IpProtocol::Icmp => {
                trace!(flow = %key, "icmp not forwarded, dropping");
                Ok(())
            }
            IpProtocol::Other(n) => {
                trace!(flow = %key, protocol = n, "unsupported protocol, dropping");
                Ok(())
            }
        }
    }

    async fn handle_udp(
        &self,
        data: &[u8],
        parsed: &ParsedPacket,
        key: FlowKey,
    ) -> Result<(), EngineError> {
        let payload = udp_payload(data, parsed.payload_offset)?;
        let snapshot = self.config.snapshot().await;
        let session = self.table.get_or_create(key, &snapshot).await?;
        self.spawn_pump_if_new(&session);

        session.touch();
        let n = payload.len() as u64;
        if let Err(e) = session
            .transport()
            .send(Bytes::copy_from_slice(payload))
            .await
        {
            warn!(flow = %key, error = %e, "udp send failed, closing session");
            self.table.drain_where(|s| *s.key() == key).await;
            return Err(e);
        }
        session.add_tx(n);
        metrics::add(&self.metrics.tx_bytes, n);
        Ok(())
    }

    async fn handle_tcp(
        &self,
        data: &[u8],
        parsed: &ParsedPacket,
        key: FlowKey,
    ) -> Result<(), EngineError> {
        let (flags, seq, payload_start) = parse_tcp_header(data, parsed.payload_offset)?;
        let payload = &data[payload_start..];

        if flags.rst {
            if self.table.get(&key).await.is_some() {
                debug!(flow = %key, "rst received, closing session");
                self.table.drain_where(|s| *s.key() == key).await;
            }
            return Ok(());
        }

        if flags.syn && !flags.ack {
            return self.handle_tcp_syn(key, seq).await;
        }

        let session = match self.table.get(&key).await {
            Some(s) => s,
            None => {
                // Segment for a flow we no longer track. Reset so the
                // peer stops retransmitting into the void.
                trace!(flow = %key, "tcp segment without session, resetting");
                self.inject_rst(&key, seq, payload.len()).await;
                return Ok(());
            }
        };
        session.touch();

        if flags.fin {
            self.ack_fin(&session, seq, payload.len()).await?;
            self.table.drain_where(|s| *s.key() == key).await;
            return Ok(());
        }

        if payload.is_empty() {
            // Bare ACK: activity only.
            return Ok(());
        }

        self.forward_tcp_payload(&session, seq, payload).await
    }

    async fn handle_tcp_syn(&self, key: FlowKey, seq: u32) -> Result<(), EngineError> {
        let snapshot = self.config.snapshot().await;
        let session = match self.table.get_or_create(key, &snapshot).await {
            Ok(s) => s,
            Err(e) => {
                debug!(flow = %key, error = %e, "tcp connect failed, resetting");
                self.inject_rst(&key, seq, 1).await;
                return Err(e);
            }
        };
        self.spawn_pump_if_new(&session);

        let client_next = seq.wrapping_add(1);
        if let Some(tcp) = session.tcp_seq() {
            let mut state = tcp.lock().await;
            state.client_seq_next = client_next;
            state.server_seq_next = TCP_ISS.wrapping_add(1);
        }
        self.inject_tcp(&key, TCP_ISS, client_next, TCP_SYN | TCP_ACK, &[])
            .await;
        Ok(())
    }

    async fn ack_fin(&self, session: &Arc<Session>, seq: u32, payload_len: usize) -> Result<(), EngineError> {
        if let Some(tcp) = session.tcp_seq() {
            let mut state = tcp.lock().await;
            state.client_seq_next = seq.wrapping_add(payload_len as u32).wrapping_add(1);
            let server_seq = state.server_seq_next;
            state.server_seq_next = server_seq.wrapping_add(1);
            let client_next = state.client_seq_next;
            drop(state);
            self.inject_tcp(
                session.key(),
                server_seq,
                client_next,
                TCP_FIN | TCP_ACK,
                &[],
            )
            .await;
        }
        Ok(())
    }

    async fn forward_tcp_payload(
        &self,
        session: &Arc<Session>,
        seq: u32,
        payload: &[u8],
    ) -> Result<(), EngineError> {
        let key = *session.key();
        if let Some(tcp) = session.tcp_seq() {
            let mut state = tcp.lock().await;
            state.client_seq_next = seq.wrapping_add(payload.len() as u32);
            let server_seq = state.server_seq_next;
            let client_next = state.client_seq_next;
            drop(state);
            self.inject_tcp(&key, server_seq, client_next, TCP_ACK, &[])
                .await;
        }

        let n = payload.len() as u64;
        if let Err(e) = session
            .transport()
            .send(Bytes::copy_from_slice(payload))
            .await
        {
            warn!(flow = %key, error = %e, "tcp send failed, closing session");
            self.inject_rst(&key, seq, payload.len()).await;
            self.table.drain_where(|s| *s.key() == key).await;
            return Err(e);
        }
        session.add_tx(n);
        metrics::add(&self.metrics.tx_bytes, n);
        Ok(())
    }

    /// Build and write an IPv4 TCP segment in the return direction.
    async fn inject_tcp(&self, key: &FlowKey, seq: u32, ack: u32, flags: u8, payload: &[u8]) {
        match build_tcp_packet_ipv4(key.dst, key.src, seq, ack, flags, payload) {
            Ok(packet) => {
                if let Err(e) = self.source.write_packet(&packet).await {
                    debug!(flow = %key, error = %e, "tcp inject failed");
                } else {
                    metrics::inc(&self.metrics.packets_out);
                }
            }
            Err(e) => debug!(flow = %key, error = %e, "cannot build tcp segment"),
        }
    }

    async fn inject_rst(&self, key: &FlowKey, seq: u32, advance: usize) {
        self.inject_tcp(
            key,
            0,
            seq.wrapping_add(advance as u32),
            TCP_RST | TCP_ACK,
            &[],
        )
        .await;
    }

    /// Spawn the backend→device pump for a freshly created session.
    fn spawn_pump_if_new(&self, session: &Arc<Session>) {
        if !session.claim_pump() {
            return;
        }
        let session = session.clone();
        let source = self.source.clone();
        let table = self.table.clone();
        let engine_metrics = self.metrics.clone();
        let cancel = self.cancel.child_token();
        tokio::spawn(async move {
            run_return_pump(session, source, table, engine_metrics, cancel).await;
        });
    }
}

/// Per-session return pump: reads from the backend transport and
/// injects reply packets toward the device until the session or the
/// engine goes away.
async fn run_return_pump(
    session: Arc<Session>,
    source: BoxPacketSource,
    table: Arc<SessionTable>,
    engine_metrics: Arc<EngineMetrics>,
    cancel: CancellationToken,
) {
    let key = *session.key();
    loop {
        let data = tokio::select! {
            _ = cancel.cancelled() => break,
            recv = session.transport().recv() => match recv {
                Ok(data) => data,
                Err(e) => {
                    match e.kind() {
                        EngineErrorKind::SessionClosed => {
                            trace!(flow = %key, "backend closed, ending pump");
                        }
                        kind => {
                            debug!(flow = %key, error = %e, kind = kind.as_str(), "backend recv failed");
                            metrics::inc(&engine_metrics.backend_errors);
                            engine_metrics.record_error(kind.as_str());
                        }
                    }
                    break;
                }
            },
        };

        session.touch();
        let n = data.len() as u64;
        let packet = match key.protocol {
            IpProtocol::Tcp => {
                let Some(tcp) = session.tcp_seq() else { break };
                let mut state = tcp.lock().await;
                let seq = state.server_seq_next;
                state.server_seq_next = seq.wrapping_add(data.len() as u32);
                let ack = state.client_seq_next;
                drop(state);
                build_tcp_packet_ipv4(key.dst, key.src, seq, ack, TCP_PSH | TCP_ACK, &data)
            }
            _ => build_udp_packet_ipv4(key.dst, key.src, &data),
        };

        let packet = match packet {
            Ok(p) => p,
            Err(e) => {
                debug!(flow = %key, error = %e, "cannot build reply packet");
                continue;
            }
        };
        if let Err(e) = source.write_packet(&packet).await {
            debug!(flow = %key, error = %e, "reply write failed, ending pump");
            break;
        }
        session.add_rx(n);
        metrics::inc(&engine_metrics.packets_out);
        metrics::add(&engine_metrics.rx_bytes, n);
    }

    // The pump owns session teardown for its flow.
    if session.is_live() {
        table.drain_where(|s| *s.key() == key).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, BackendManager, FlowTransport};
    use crate::common::EngineMetrics;
    use crate::config::parse_config;
    use crate::packet::parse_ip_packet;
    use crate::tun::{ChannelPacketSource, PacketSource};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Mutex;

    /// Backend whose transports echo every datagram back.
    struct EchoBackend {
        tag: String,
    }

    struct EchoTransport {
        queue: Mutex<tokio::sync::mpsc::UnboundedReceiver<Bytes>>,
        tx: tokio::sync::mpsc::UnboundedSender<Bytes>,
        cancel: CancellationToken,
    }

    #[async_trait]
    impl FlowTransport for EchoTransport {
        async fn send(&self, data: Bytes) -> Result<(), EngineError> {
            self.tx
                .send(data)
                .map_err(|_| EngineError::SessionClosed)
        }

        async fn recv(&self) -> Result<Bytes, EngineError> {
            let mut queue = self.queue.lock().await;
            tokio::select! {
                _ = self.cancel.cancelled() => Err(EngineError::SessionClosed),
                item = queue.recv() => item.ok_or(EngineError::SessionClosed),
            }
        }

        async fn close(&self) {
            self.cancel.cancel();
        }
    }

    #[async_trait]
    impl Backend for EchoBackend {
        fn tag(&self) -> &str {
            &self.tag
        }

        async fn connect(
            &self,
            _key: &FlowKey,
        ) -> Result<crate::backend::BoxFlowTransport, EngineError> {
            let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
            Ok(Arc::new(EchoTransport {
                queue: Mutex::new(rx),
                tx,
                cancel: CancellationToken::new(),
            }))
        }
    }

    struct Harness {
        host: Arc<ChannelPacketSource>,
        dispatcher: Arc<Dispatcher>,
        table: Arc<SessionTable>,
        metrics: Arc<EngineMetrics>,
        cancel: CancellationToken,
    }

    /// Harness whose "direct" outbound is a blackhole: connects succeed
    /// instantly and never produce return traffic.
    fn harness() -> Harness {
        let json = r#"{"outbounds": [{"tag": "direct", "protocol": "blackhole"}]}"#;
        let config = parse_config(json).unwrap();
        let mgr = Arc::new(ConfigManager::new(&config, None).unwrap());
        let metrics = Arc::new(EngineMetrics::new());
        let table = Arc::new(SessionTable::new(metrics.clone(), Duration::from_millis(200)));
        let (device, host) = ChannelPacketSource::pair(64);
        let cancel = CancellationToken::new();
        let dispatcher = Arc::new(Dispatcher::new(
            device,
            mgr,
            table.clone(),
            metrics.clone(),
            cancel.clone(),
        ));
        Harness {
            host,
            dispatcher,
            table,
            metrics,
            cancel,
        }
    }

    fn udp_packet(src_port: u16, payload: &[u8]) -> Vec<u8> {
        build_udp_packet_ipv4(
            format!("10.0.0.2:{}", src_port).parse().unwrap(),
            "8.8.8.8:53".parse().unwrap(),
            payload,
        )
        .unwrap()
    }

    fn tcp_packet(src_port: u16, seq: u32, ack: u32, flags: u8, payload: &[u8]) -> Vec<u8> {
        build_tcp_packet_ipv4(
            format!("10.0.0.2:{}", src_port).parse().unwrap(),
            "1.1.1.1:443".parse().unwrap(),
            seq,
            ack,
            flags,
            payload,
        )
        .unwrap()
    }

    async fn read_reply(host: &Arc<ChannelPacketSource>) -> Vec<u8> {
        let mut buf = vec![0u8; MAX_PACKET];
        let n = tokio::time::timeout(Duration::from_secs(2), host.read_packet(&mut buf))
            .await
            .unwrap()
            .unwrap();
        buf.truncate(n);
        buf
    }

    #[tokio::test]
    async fn malformed_packet_is_counted_not_fatal() {
        let h = harness();
        let err = h.dispatcher.handle_packet(&[0xFF, 0x00]).await.unwrap_err();
        assert_eq!(err.kind(), EngineErrorKind::MalformedPacket);
        assert_eq!(h.table.len().await, 0);
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn udp_packet_echoes_back() {
        let h = harness();
        // Pre-seed the flow's session with an echo transport; dispatch
        // finds it live and reuses it instead of the config's backend.
        let mut backends = BackendManager::empty();
        backends.insert(Arc::new(EchoBackend {
            tag: "direct".to_string(),
        }));
        let table = h.table.clone();
        let router = crate::router::Router::new(&Default::default(), None).unwrap();
        let snapshot = Arc::new(crate::config::RoutingSnapshot {
            generation: 1,
            router,
            backends,
        });
        let key = FlowKey {
            protocol: IpProtocol::Udp,
            src: "10.0.0.2:5353".parse().unwrap(),
            dst: "8.8.8.8:53".parse().unwrap(),
        };
        let session = table.get_or_create(key, &snapshot).await.unwrap();
        h.dispatcher.spawn_pump_if_new(&session);

        let packet = udp_packet(5353, b"query");
        h.dispatcher.handle_packet(&packet).await.unwrap();

        let reply = read_reply(&h.host).await;
        let parsed = parse_ip_packet(&reply).unwrap();
        assert_eq!(parsed.protocol, IpProtocol::Udp);
        assert_eq!(parsed.src_port, 53);
        assert_eq!(parsed.dst_port, 5353);
        assert_eq!(udp_payload(&reply, parsed.payload_offset).unwrap(), b"query");
        assert_eq!(session.tx_bytes(), 5);
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn tcp_syn_gets_syn_ack() {
        let h = harness();
        let syn = tcp_packet(40000, 1000, 0, TCP_SYN, &[]);
        h.dispatcher.handle_packet(&syn).await.unwrap();

        let reply = read_reply(&h.host).await;
        let parsed = parse_ip_packet(&reply).unwrap();
        assert_eq!(parsed.protocol, IpProtocol::Tcp);
        let (flags, seq, _) = parse_tcp_header(&reply, parsed.payload_offset).unwrap();
        assert!(flags.syn && flags.ack);
        assert_eq!(seq, TCP_ISS);
        assert_eq!(h.table.len().await, 1);
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn tcp_payload_is_acked_and_forwarded() {
        let h = harness();
        let syn = tcp_packet(40000, 1000, 0, TCP_SYN, &[]);
        h.dispatcher.handle_packet(&syn).await.unwrap();
        let _syn_ack = read_reply(&h.host).await;

        let data = tcp_packet(40000, 1001, TCP_ISS + 1, TCP_ACK | TCP_PSH, b"hello");
        h.dispatcher.handle_packet(&data).await.unwrap();

        let ack = read_reply(&h.host).await;
        let parsed = parse_ip_packet(&ack).unwrap();
        let (flags, _seq, payload_start) = parse_tcp_header(&ack, parsed.payload_offset).unwrap();
        assert!(flags.ack && !flags.syn);
        assert!(ack[payload_start..].is_empty());

        let key = FlowKey {
            protocol: IpProtocol::Tcp,
            src: "10.0.0.2:40000".parse().unwrap(),
            dst: "1.1.1.1:443".parse().unwrap(),
        };
        let session = h.table.get(&key).await.unwrap();
        assert_eq!(session.tx_bytes(), 5);
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn tcp_rst_drops_session() {
        let h = harness();
        let syn = tcp_packet(40000, 1000, 0, TCP_SYN, &[]);
        h.dispatcher.handle_packet(&syn).await.unwrap();
        let _syn_ack = read_reply(&h.host).await;
        assert_eq!(h.table.len().await, 1);

        let rst = tcp_packet(40000, 1001, 0, TCP_RST, &[]);
        h.dispatcher.handle_packet(&rst).await.unwrap();
        assert_eq!(h.table.len().await, 0);
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn tcp_segment_without_session_gets_rst() {
        let h = harness();
        let stray = tcp_packet(41000, 5000, 1, TCP_ACK | TCP_PSH, b"stale");
        h.dispatcher.handle_packet(&stray).await.unwrap();

        let reply = read_reply(&h.host).await;
        let parsed = parse_ip_packet(&reply).unwrap();
        let (flags, _, _) = parse_tcp_header(&reply, parsed.payload_offset).unwrap();
        assert!(flags.rst);
        assert_eq!(h.table.len().await, 0);
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn bare_ack_touches_without_forwarding() {
        let h = harness();
        let syn = tcp_packet(40000, 1000, 0, TCP_SYN, &[]);
        h.dispatcher.handle_packet(&syn).await.unwrap();
        let _syn_ack = read_reply(&h.host).await;

        let key = FlowKey {
            protocol: IpProtocol::Tcp,
            src: "10.0.0.2:40000".parse().unwrap(),
            dst: "1.1.1.1:443".parse().unwrap(),
        };
        let session = h.table.get(&key).await.unwrap();
        let before_tx = session.tx_bytes();

        let ack = tcp_packet(40000, 1001, TCP_ISS + 1, TCP_ACK, &[]);
        h.dispatcher.handle_packet(&ack).await.unwrap();
        assert_eq!(session.tx_bytes(), before_tx);
        assert!(session.is_live());
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn icmp_is_dropped_silently() {
        let h = harness();
        // Hand-built ICMP echo request.
        let mut packet = vec![0u8; 28];
        packet[0] = 0x45;
        packet[2..4].copy_from_slice(&28u16.to_be_bytes());
        packet[8] = 64;
        packet[9] = 1;
        packet[12..16].copy_from_slice(&[10, 0, 0, 2]);
        packet[16..20].copy_from_slice(&[8, 8, 8, 8]);
        packet[20] = 8;

        h.dispatcher.handle_packet(&packet).await.unwrap();
        assert_eq!(h.table.len().await, 0);
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn run_loop_survives_malformed_and_counts() {
        let h = harness();
        let dispatcher = h.dispatcher.clone();
        let run = tokio::spawn(async move { dispatcher.run().await });

        h.host.write_packet(&[0xAB, 0xCD]).await.unwrap();
        h.host
            .write_packet(&tcp_packet(40000, 1000, 0, TCP_SYN, &[]))
            .await
            .unwrap();

        let reply = read_reply(&h.host).await;
        assert!(!reply.is_empty());
        assert_eq!(h.metrics.snapshot().malformed_dropped, 1);

        h.cancel.cancel();
        run.await.unwrap().unwrap();
    }
}
