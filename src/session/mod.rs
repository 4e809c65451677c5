//! Flow session table.
//!
//! Owns every active session keyed by [`FlowKey`]. Creation is
//! single-flight per key: while one caller connects the backend, the map
//! entry is parked as `Connecting` and racing callers await the winner's
//! result instead of issuing a second connect. The backend connect runs
//! outside the table lock.
//!
//! Failed connects are negative-cached: retryable failures back off
//! exponentially, `AuthRejected` failures are blocked long enough that
//! the flow is effectively never retried.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::BoxFlowTransport;
use crate::common::{metrics, now_millis, EngineError, EngineErrorKind, EngineMetrics};
use crate::config::manager::RoutingSnapshot;
use crate::packet::{FlowKey, IpProtocol};

/// Backoff base after a retryable connect failure.
const BACKOFF_BASE: Duration = Duration::from_millis(200);
/// Backoff cap.
const BACKOFF_MAX: Duration = Duration::from_secs(10);
/// Block window for AuthRejected flows; long enough that the session is
/// never retried in practice.
const AUTH_REJECT_BLOCK: Duration = Duration::from_secs(300);

const STATE_CONNECTING: u8 = 0;
const STATE_ESTABLISHED: u8 = 1;
const STATE_DRAINING: u8 = 2;
const STATE_CLOSED: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Established,
    Draining,
    Closed,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            STATE_CONNECTING => Self::Connecting,
            STATE_ESTABLISHED => Self::Established,
            STATE_DRAINING => Self::Draining,
            _ => Self::Closed,
        }
    }
}

/// Per-flow TCP sequence bookkeeping for reply injection.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpSeqState {
    pub client_seq_next: u32,
    pub server_seq_next: u32,
}

/// One active flow bound to one backend transport.
#[derive(Debug)]
pub struct Session {
    key: FlowKey,
    backend_tag: String,
    transport: BoxFlowTransport,
    state: AtomicU8,
    generation: AtomicU64,
    last_active: AtomicI64,
    tx_bytes: AtomicU64,
    rx_bytes: AtomicU64,
    pump_claimed: std::sync::atomic::AtomicBool,
    /// Present for TCP flows only.
    tcp_seq: Option<Mutex<TcpSeqState>>,
}

impl Session {
    fn new(key: FlowKey, backend_tag: String, transport: BoxFlowTransport, generation: u64) -> Self {
        let tcp_seq = match key.protocol {
            IpProtocol::Tcp => Some(Mutex::new(TcpSeqState::default())),
            _ => None,
        };
        Self {
            key,
            backend_tag,
            transport,
            state: AtomicU8::new(STATE_ESTABLISHED),
            generation: AtomicU64::new(generation),
            last_active: AtomicI64::new(now_millis()),
            tx_bytes: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
            pump_claimed: std::sync::atomic::AtomicBool::new(false),
            tcp_seq,
        }
    }

    pub fn key(&self) -> &FlowKey {
        &self.key
    }

    pub fn backend_tag(&self) -> &str {
        &self.backend_tag
    }

    pub fn transport(&self) -> &BoxFlowTransport {
        &self.transport
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Migrate the session to a newer config generation (reload kept its
    /// backend unchanged).
    pub fn set_generation(&self, generation: u64) {
        self.generation.store(generation, Ordering::Release);
    }

    /// Update the last-active timestamp.
    pub fn touch(&self) {
        self.last_active.store(now_millis(), Ordering::Relaxed);
    }

    /// Milliseconds since last activity.
    pub fn idle_millis(&self) -> i64 {
        now_millis() - self.last_active.load(Ordering::Relaxed)
    }

    pub fn add_tx(&self, n: u64) {
        self.tx_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_rx(&self, n: u64) {
        self.rx_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes.load(Ordering::Relaxed)
    }

    pub fn rx_bytes(&self) -> u64 {
        self.rx_bytes.load(Ordering::Relaxed)
    }

    /// Whether the session accepts new packets.
    pub fn is_live(&self) -> bool {
        matches!(self.state(), SessionState::Established)
    }

    pub fn tcp_seq(&self) -> Option<&Mutex<TcpSeqState>> {
        self.tcp_seq.as_ref()
    }

    /// Claim the return pump for this session. True exactly once, so
    /// racing dispatch paths spawn a single pump task.
    pub fn claim_pump(&self) -> bool {
        !self
            .pump_claimed
            .swap(true, Ordering::AcqRel)
    }

    /// Drain and close this session's transport, bounded by `timeout`.
    /// A transport that makes no flush progress within the bound is
    /// forcibly abandoned; the session ends up Closed either way.
    pub async fn drain(&self, timeout: Duration) {
        let prev = self
            .state
            .swap(STATE_DRAINING, Ordering::AcqRel);
        if prev == STATE_CLOSED {
            self.state.store(STATE_CLOSED, Ordering::Release);
            return;
        }
        if tokio::time::timeout(timeout, self.transport.close())
            .await
            .is_err()
        {
            warn!(flow = %self.key, "session close timed out, forcing");
        }
        self.state.store(STATE_CLOSED, Ordering::Release);
        debug!(
            flow = %self.key,
            outbound = self.backend_tag,
            tx = self.tx_bytes(),
            rx = self.rx_bytes(),
            "session closed"
        );
    }
}

type CreateResult = Result<Arc<Session>, EngineErrorKind>;

enum Slot {
    /// Creation in flight; waiters subscribe to the winner's result.
    Connecting(watch::Receiver<Option<CreateResult>>),
    Ready(Arc<Session>),
}

struct FailureRecord {
    kind: EngineErrorKind,
    attempts: u32,
    blocked_until: Instant,
}

pub struct SessionTable {
    entries: Mutex<HashMap<FlowKey, Slot>>,
    failures: Mutex<HashMap<FlowKey, FailureRecord>>,
    /// Lowest snapshot generation still allowed to publish sessions.
    /// Raised by reload before its drain sweep, so a creation that was
    /// in flight with an older snapshot cannot slip a stale session in
    /// after the sweep.
    generation_floor: AtomicU64,
    metrics: Arc<EngineMetrics>,
    drain_timeout: Duration,
}

impl SessionTable {
    pub fn new(metrics: Arc<EngineMetrics>, drain_timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            generation_floor: AtomicU64::new(0),
            metrics,
            drain_timeout,
        }
    }

    /// Declare `generation` the minimum acceptable snapshot generation.
    /// Sessions built from older snapshots are rejected at publish time.
    pub fn raise_generation_floor(&self, generation: u64) {
        self.generation_floor
            .fetch_max(generation, Ordering::AcqRel);
    }

    /// Return the live session for `key`, or create one by resolving the
    /// key against `snapshot`. Exactly one connect happens per new key
    /// even under concurrent callers.
    pub async fn get_or_create(
        &self,
        key: FlowKey,
        snapshot: &Arc<RoutingSnapshot>,
    ) -> Result<Arc<Session>, EngineError> {
        if let Some(remaining) = self.blocked_for(&key).await {
            return Err(EngineError::BackendUnavailable(format!(
                "flow {} blocked for {:?} after connect failure",
                key, remaining
            )));
        }

        enum Claim {
            Existing(Arc<Session>),
            Draining,
            Wait(watch::Receiver<Option<CreateResult>>),
            Create(watch::Sender<Option<CreateResult>>),
        }

        let claim = {
            let mut entries = self.entries.lock().await;
            let found = match entries.get(&key) {
                Some(Slot::Ready(session)) => match session.state() {
                    SessionState::Established => Some(Claim::Existing(session.clone())),
                    SessionState::Draining => Some(Claim::Draining),
                    // Stale slot from a closed session; recreate below.
                    _ => None,
                },
                Some(Slot::Connecting(rx)) => Some(Claim::Wait(rx.clone())),
                None => None,
            };
            match found {
                Some(claim) => claim,
                None => {
                    let (tx, rx) = watch::channel(None);
                    entries.insert(key, Slot::Connecting(rx));
                    Claim::Create(tx)
                }
            }
        };

        let tx = match claim {
            Claim::Existing(session) => return Ok(session),
            Claim::Draining => return Err(EngineError::SessionClosed),
            Claim::Wait(mut rx) => {
                let result = rx
                    .wait_for(|v| v.is_some())
                    .await
                    .map_err(|_| {
                        EngineError::BackendUnavailable("session creation aborted".into())
                    })?
                    .clone()
                    .unwrap_or(Err(EngineErrorKind::BackendUnavailable));
                return result.map_err(|kind| {
                    EngineError::BackendUnavailable(format!("connect failed: {}", kind.as_str()))
                });
            }
            Claim::Create(tx) => tx,
        };

        // We won the slot: connect outside the lock.
        let outcome = self.connect_backend(&key, snapshot).await;
        match outcome {
            Ok(session) => {
                let stale = {
                    let mut entries = self.entries.lock().await;
                    if snapshot.generation < self.generation_floor.load(Ordering::Acquire) {
                        entries.remove(&key);
                        true
                    } else {
                        entries.insert(key, Slot::Ready(session.clone()));
                        false
                    }
                };
                if stale {
                    // A reload landed while we were connecting; this
                    // session routes by the old config and must not be
                    // published. Drop the packet; the next one resolves
                    // against the fresh snapshot.
                    debug!(
                        flow = %key,
                        generation = snapshot.generation,
                        "config changed during connect, discarding session"
                    );
                    session.drain(self.drain_timeout).await;
                    let _ = tx.send(Some(Err(EngineErrorKind::SessionClosed)));
                    return Err(EngineError::SessionClosed);
                }
                self.failures.lock().await.remove(&key);
                let _ = tx.send(Some(Ok(session.clone())));
                metrics::inc(&self.metrics.sessions_created);
                info!(
                    flow = %key,
                    outbound = session.backend_tag(),
                    generation = session.generation(),
                    "session established"
                );
                Ok(session)
            }
            Err(e) => {
                {
                    let mut entries = self.entries.lock().await;
                    entries.remove(&key);
                }
                self.record_failure(&key, e.kind()).await;
                let _ = tx.send(Some(Err(e.kind())));
                metrics::inc(&self.metrics.connect_failures);
                self.metrics.record_error(e.kind().as_str());
                Err(e)
            }
        }
    }

    async fn connect_backend(
        &self,
        key: &FlowKey,
        snapshot: &Arc<RoutingSnapshot>,
    ) -> Result<Arc<Session>, EngineError> {
        let tag = snapshot.router.resolve(key).to_string();
        let backend = snapshot.backends.get(&tag).ok_or_else(|| {
            EngineError::BackendUnavailable(format!("no backend for tag '{}'", tag))
        })?;
        let transport = backend.connect(key).await?;
        Ok(Arc::new(Session::new(
            *key,
            tag,
            transport,
            snapshot.generation,
        )))
    }

    /// Remaining block time for a negative-cached flow, if any.
    async fn blocked_for(&self, key: &FlowKey) -> Option<Duration> {
        let failures = self.failures.lock().await;
        let record = failures.get(key)?;
        record
            .blocked_until
            .checked_duration_since(Instant::now())
    }

    async fn record_failure(&self, key: &FlowKey, kind: EngineErrorKind) {
        let mut failures = self.failures.lock().await;
        let record = failures.entry(*key).or_insert(FailureRecord {
            kind,
            attempts: 0,
            blocked_until: Instant::now(),
        });
        record.kind = kind;
        record.attempts = record.attempts.saturating_add(1);
        let delay = if kind == EngineErrorKind::AuthRejected {
            AUTH_REJECT_BLOCK
        } else {
            let base_ms = BACKOFF_BASE.as_millis() as u64;
            let exp_ms = base_ms.saturating_mul(1u64 << (record.attempts - 1).min(16));
            Duration::from_millis(exp_ms.min(BACKOFF_MAX.as_millis() as u64))
        };
        record.blocked_until = Instant::now() + delay;
        debug!(
            flow = %key,
            kind = kind.as_str(),
            attempts = record.attempts,
            backoff_ms = delay.as_millis() as u64,
            "connect failure cached"
        );
    }

    /// Look up an existing live session without creating one.
    pub async fn get(&self, key: &FlowKey) -> Option<Arc<Session>> {
        let entries = self.entries.lock().await;
        match entries.get(key) {
            Some(Slot::Ready(session)) if session.is_live() => Some(session.clone()),
            _ => None,
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// All sessions currently in Ready slots.
    pub async fn sessions(&self) -> Vec<Arc<Session>> {
        self.entries
            .lock()
            .await
            .values()
            .filter_map(|slot| match slot {
                Slot::Ready(session) => Some(session.clone()),
                Slot::Connecting(_) => None,
            })
            .collect()
    }

    /// Remove and close sessions idle for at least `threshold`. Idle
    /// time, not insertion order: any activity within the window keeps a
    /// slow flow alive. Returns the number evicted.
    pub async fn evict_idle(&self, threshold: Duration) -> usize {
        let threshold_ms = threshold.as_millis() as i64;
        let victims: Vec<Arc<Session>> = {
            let mut entries = self.entries.lock().await;
            let keys: Vec<FlowKey> = entries
                .iter()
                .filter_map(|(key, slot)| match slot {
                    Slot::Ready(session) if session.idle_millis() >= threshold_ms => Some(*key),
                    _ => None,
                })
                .collect();
            keys.iter()
                .filter_map(|key| match entries.remove(key) {
                    Some(Slot::Ready(session)) => Some(session),
                    _ => None,
                })
                .collect()
        };

        // Also drop expired failure records so the cache cannot grow
        // without bound.
        {
            let now = Instant::now();
            let mut failures = self.failures.lock().await;
            failures.retain(|_, record| record.blocked_until > now);
        }

        let evicted = victims.len();
        for session in victims {
            debug!(flow = %session.key(), idle_ms = session.idle_millis(), "session idle, evicting");
            session.drain(self.drain_timeout).await;
            metrics::inc(&self.metrics.sessions_evicted);
        }
        evicted
    }

    /// Drain and close every session for which `pred` returns true.
    /// Sessions transition Established → Draining → Closed; closing is
    /// bounded by the table's drain timeout per session.
    pub async fn drain_where<F>(&self, pred: F) -> usize
    where
        F: Fn(&Session) -> bool,
    {
        let victims: Vec<Arc<Session>> = {
            let mut entries = self.entries.lock().await;
            let keys: Vec<FlowKey> = entries
                .iter()
                .filter_map(|(key, slot)| match slot {
                    Slot::Ready(session) if pred(session) => Some(*key),
                    _ => None,
                })
                .collect();
            keys.iter()
                .filter_map(|key| match entries.remove(key) {
                    Some(Slot::Ready(session)) => Some(session),
                    _ => None,
                })
                .collect()
        };

        let drained = victims.len();
        let timeout = self.drain_timeout;
        let closes = victims.iter().map(|session| session.drain(timeout));
        futures_util::future::join_all(closes).await;
        for _ in 0..drained {
            metrics::inc(&self.metrics.sessions_drained);
        }
        if drained > 0 {
            info!(count = drained, "sessions drained");
        }
        drained
    }

    /// Drain every session; used by reload-all and shutdown.
    pub async fn drain_all(&self) -> usize {
        self.drain_where(|_| true).await
    }

    /// Spawn the periodic idle-eviction task.
    pub fn spawn_evict_task(
        self: &Arc<Self>,
        idle_timeout: Duration,
        interval: Duration,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let table = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = table.evict_idle(idle_timeout).await;
                        if removed > 0 {
                            let remaining = table.len().await;
                            debug!(removed = removed, remaining = remaining, "idle eviction pass");
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        })
    }
}
