//! Engine lifecycle and host control surface.
//!
//! An [`Engine`] is an explicit handle owned by the host; there is no
//! process-global instance, and several engines can coexist in one
//! process (tests do exactly that). The host drives it with
//! `start` / `stop` / `reload` / `validate` and observes it through
//! `state`, `metrics` and `session_count`.
//!
//! `start` returns a coarse [`StatusCode`] to keep FFI embeddings
//! trivial; the detailed failure is logged.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::common::{EngineError, EngineMetrics, MetricsSnapshot};
use crate::config::manager::ReloadOutcome;
use crate::config::{parse_config, ConfigManager};
use crate::dispatch::Dispatcher;
use crate::session::SessionTable;
use crate::tun::{BoxPacketSource, PacketSourceProvider};

/// Coarse start/stop result for host embeddings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    AlreadyRunning,
    InvalidConfig,
    StartupFailed,
}

impl StatusCode {
    pub fn code(self) -> i32 {
        match self {
            StatusCode::Ok => 0,
            StatusCode::AlreadyRunning => 1,
            StatusCode::InvalidConfig => 2,
            StatusCode::StartupFailed => 3,
        }
    }
}

const STATE_STOPPED: u8 = 0;
const STATE_STARTING: u8 = 1;
const STATE_RUNNING: u8 = 2;
const STATE_STOPPING: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl EngineState {
    fn from_u8(v: u8) -> Self {
        match v {
            STATE_STARTING => Self::Starting,
            STATE_RUNNING => Self::Running,
            STATE_STOPPING => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

struct Running {
    cancel: CancellationToken,
    source: BoxPacketSource,
    config: Arc<ConfigManager>,
    table: Arc<SessionTable>,
    metrics: Arc<EngineMetrics>,
    dispatch: tokio::task::JoinHandle<Result<(), EngineError>>,
    evict: tokio::task::JoinHandle<()>,
}

pub struct Engine {
    state: Arc<AtomicU8>,
    running: Mutex<Option<Running>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self {
            state: Arc::new(AtomicU8::new(STATE_STOPPED)),
            running: Mutex::new(None),
        }
    }

    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Validate config text without starting anything. `None` means the
    /// config is acceptable; `Some` carries the failure message.
    pub fn validate(config_json: &str, asset_dir: Option<&Path>) -> Option<String> {
        ConfigManager::validate_text(config_json, asset_dir)
    }

    /// Start the engine with the given config and packet source.
    /// Invalid config and source failures roll everything back, so a
    /// failed start leaves the engine startable again.
    pub async fn start<P>(
        &self,
        config_json: &str,
        asset_dir: Option<PathBuf>,
        provider: &P,
    ) -> StatusCode
    where
        P: PacketSourceProvider + ?Sized,
    {
        let mut running = self.running.lock().await;
        if self.state() != EngineState::Stopped {
            warn!("start refused, engine is not stopped");
            return StatusCode::AlreadyRunning;
        }
        if let Some(stale) = running.take() {
            // A fatal dispatch error flips the state to stopped but
            // cannot take this mutex; its teardown finishes here.
            teardown(stale).await;
        }
        self.state.store(STATE_STARTING, Ordering::Release);

        let config = match parse_config(config_json) {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "config rejected");
                self.state.store(STATE_STOPPED, Ordering::Release);
                return StatusCode::InvalidConfig;
            }
        };
        let manager = match ConfigManager::new(&config, asset_dir) {
            Ok(m) => Arc::new(m),
            Err(e) => {
                error!(error = %e, "config rejected");
                self.state.store(STATE_STOPPED, Ordering::Release);
                return StatusCode::InvalidConfig;
            }
        };

        let source = match provider.open() {
            Ok(source) => source,
            Err(e) => {
                error!(error = %e, "packet source open failed");
                self.state.store(STATE_STOPPED, Ordering::Release);
                return StatusCode::StartupFailed;
            }
        };

        let session_cfg = manager.session_config().clone();
        let metrics = Arc::new(EngineMetrics::new());
        let table = Arc::new(SessionTable::new(
            metrics.clone(),
            Duration::from_millis(session_cfg.drain_timeout_ms),
        ));
        let cancel = CancellationToken::new();

        let evict = table.spawn_evict_task(
            Duration::from_secs(session_cfg.idle_timeout_secs),
            Duration::from_secs(session_cfg.evict_interval_secs),
            cancel.child_token(),
        );

        let dispatcher = Dispatcher::new(
            source.clone(),
            manager.clone(),
            table.clone(),
            metrics.clone(),
            cancel.clone(),
        );
        let state = self.state.clone();
        let fatal_cancel = cancel.clone();
        let dispatch = tokio::spawn(async move {
            let result = dispatcher.run().await;
            if let Err(e) = &result {
                // A dead packet source ends the engine; pumps and the
                // evict task stop with the token, and the state flips so
                // the host can restart.
                error!(error = %e, "dispatch loop failed, stopping engine");
                fatal_cancel.cancel();
                state.store(STATE_STOPPED, Ordering::Release);
            }
            result
        });

        *running = Some(Running {
            cancel,
            source,
            config: manager,
            table,
            metrics,
            dispatch,
            evict,
        });
        self.state.store(STATE_RUNNING, Ordering::Release);
        info!("engine started");
        StatusCode::Ok
    }

    /// Stop the engine: cancel the loops, drain every session (each
    /// bounded by the drain timeout), close the packet source. Stopping
    /// a stopped engine is a no-op.
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        let Some(run) = running.take() else {
            self.state.store(STATE_STOPPED, Ordering::Release);
            return;
        };
        self.state.store(STATE_STOPPING, Ordering::Release);
        teardown(run).await;
        self.state.store(STATE_STOPPED, Ordering::Release);
    }

    /// Swap the routing config of a running engine. See
    /// [`ConfigManager::reload`] for the drain/migrate semantics.
    pub async fn reload(&self, config_json: &str) -> Result<ReloadOutcome, EngineError> {
        let running = self.running.lock().await;
        let Some(run) = running.as_ref() else {
            return Err(EngineError::Startup("engine is not running".into()));
        };
        run.config.reload(config_json, &run.table).await
    }

    pub async fn metrics(&self) -> Option<MetricsSnapshot> {
        let running = self.running.lock().await;
        running.as_ref().map(|run| run.metrics.snapshot())
    }

    pub async fn session_count(&self) -> Option<usize> {
        let running = self.running.lock().await;
        match running.as_ref() {
            Some(run) => Some(run.table.len().await),
            None => None,
        }
    }

    pub async fn config_generation(&self) -> Option<u64> {
        let running = self.running.lock().await;
        running.as_ref().map(|run| run.config.generation())
    }

    /// Per-flow view of the live session table.
    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let running = self.running.lock().await;
        let Some(run) = running.as_ref() else {
            return Vec::new();
        };
        run.table
            .sessions()
            .await
            .iter()
            .map(|s| SessionInfo {
                key: *s.key(),
                outbound: s.backend_tag().to_string(),
                generation: s.generation(),
                tx_bytes: s.tx_bytes(),
                rx_bytes: s.rx_bytes(),
            })
            .collect()
    }
}

/// Cancel the loops, drain every session (each bounded by the drain
/// timeout), join the tasks and close the packet source.
async fn teardown(run: Running) {
    run.cancel.cancel();
    let drained = run.table.drain_all().await;

    if let Err(e) = run.dispatch.await {
        if !e.is_cancelled() {
            warn!(error = %e, "dispatch task join failed");
        }
    }
    if let Err(e) = run.evict.await {
        if !e.is_cancelled() {
            warn!(error = %e, "evict task join failed");
        }
    }
    if let Err(e) = run.source.close().await {
        warn!(error = %e, "packet source close failed");
    }

    let snapshot = run.metrics.snapshot();
    info!(
        drained = drained,
        packets_in = snapshot.packets_in,
        packets_out = snapshot.packets_out,
        "engine stopped"
    );
}

/// Host-facing summary of one session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub key: crate::packet::FlowKey,
    pub outbound: String,
    pub generation: u64,
    pub tx_bytes: u64,
    pub rx_bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tun::{ChannelPacketSource, PacketSource};

    const BLACKHOLE_CONFIG: &str =
        r#"{"outbounds": [{"tag": "direct", "protocol": "blackhole"}]}"#;

    fn channel_provider() -> (impl PacketSourceProvider, Arc<ChannelPacketSource>) {
        let (device, host) = ChannelPacketSource::pair(64);
        let device = std::sync::Mutex::new(Some(device));
        let provider = move || {
            device
                .lock()
                .ok()
                .and_then(|mut slot| slot.take())
                .map(|d| d as BoxPacketSource)
                .ok_or_else(|| anyhow::anyhow!("source already taken"))
        };
        (provider, host)
    }

    #[tokio::test]
    async fn start_and_stop_cycle() {
        let engine = Engine::new();
        let (provider, _host) = channel_provider();
        assert_eq!(
            engine.start(BLACKHOLE_CONFIG, None, &provider).await,
            StatusCode::Ok
        );
        assert_eq!(engine.state(), EngineState::Running);
        assert_eq!(engine.session_count().await, Some(0));

        engine.stop().await;
        assert_eq!(engine.state(), EngineState::Stopped);
        assert_eq!(engine.session_count().await, None);
    }

    #[tokio::test]
    async fn double_start_is_refused() {
        let engine = Engine::new();
        let (provider, _host) = channel_provider();
        assert_eq!(
            engine.start(BLACKHOLE_CONFIG, None, &provider).await,
            StatusCode::Ok
        );
        let (provider2, _host2) = channel_provider();
        assert_eq!(
            engine.start(BLACKHOLE_CONFIG, None, &provider2).await,
            StatusCode::AlreadyRunning
        );
        engine.stop().await;
    }

    #[tokio::test]
    async fn invalid_config_leaves_engine_startable() {
        let engine = Engine::new();
        let (provider, _host) = channel_provider();
        assert_eq!(
            engine.start("{nope", None, &provider).await,
            StatusCode::InvalidConfig
        );
        assert_eq!(engine.state(), EngineState::Stopped);

        assert_eq!(
            engine.start(BLACKHOLE_CONFIG, None, &provider).await,
            StatusCode::Ok
        );
        engine.stop().await;
    }

    #[tokio::test]
    async fn source_open_failure_is_startup_failed() {
        let engine = Engine::new();
        let provider =
            || -> anyhow::Result<BoxPacketSource> { Err(anyhow::anyhow!("no tun device")) };
        assert_eq!(
            engine.start(BLACKHOLE_CONFIG, None, &provider).await,
            StatusCode::StartupFailed
        );
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn stop_when_stopped_is_noop() {
        let engine = Engine::new();
        engine.stop().await;
        engine.stop().await;
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn restart_after_stop_works() {
        let engine = Engine::new();
        let (provider, _host) = channel_provider();
        assert_eq!(
            engine.start(BLACKHOLE_CONFIG, None, &provider).await,
            StatusCode::Ok
        );
        engine.stop().await;

        let (provider2, _host2) = channel_provider();
        assert_eq!(
            engine.start(BLACKHOLE_CONFIG, None, &provider2).await,
            StatusCode::Ok
        );
        engine.stop().await;
    }

    #[tokio::test]
    async fn validate_is_pure() {
        assert_eq!(Engine::validate(BLACKHOLE_CONFIG, None), None);
        assert!(Engine::validate("{nope", None).is_some());
    }

    #[tokio::test]
    async fn reload_requires_running_engine() {
        let engine = Engine::new();
        let err = engine.reload(BLACKHOLE_CONFIG).await.unwrap_err();
        assert!(matches!(err, EngineError::Startup(_)));
    }

    #[tokio::test]
    async fn source_death_stops_engine() {
        let engine = Engine::new();
        let (provider, host) = channel_provider();
        assert_eq!(
            engine.start(BLACKHOLE_CONFIG, None, &provider).await,
            StatusCode::Ok
        );
        // Dropping the peer end drops its sender; the engine-side read
        // fails with "peer gone", which is fatal for the dispatcher.
        host.close().await.unwrap();
        drop(host);

        tokio::time::timeout(Duration::from_secs(2), async {
            while engine.state() != EngineState::Stopped {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // stop() afterwards stays a clean no-op.
        engine.stop().await;
        assert_eq!(engine.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn restart_after_source_death_needs_no_stop() {
        let engine = Engine::new();
        let (provider, host) = channel_provider();
        assert_eq!(
            engine.start(BLACKHOLE_CONFIG, None, &provider).await,
            StatusCode::Ok
        );
        host.close().await.unwrap();
        drop(host);

        tokio::time::timeout(Duration::from_secs(2), async {
            while engine.state() != EngineState::Stopped {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // A fresh start must succeed directly; the dead run's leftovers
        // are cleaned up on the way in.
        let (provider2, _host2) = channel_provider();
        assert_eq!(
            engine.start(BLACKHOLE_CONFIG, None, &provider2).await,
            StatusCode::Ok
        );
        assert_eq!(engine.state(), EngineState::Running);
        engine.stop().await;
    }
}
