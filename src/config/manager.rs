//! Live configuration: immutable routing snapshots with atomic swap.
//!
//! The dispatcher never sees a half-applied config. A reload builds the
//! complete new snapshot (router with compiled rules, instantiated
//! backends) off to the side and only then publishes it; any failure
//! along the way leaves the previous snapshot untouched.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::backend::BackendManager;
use crate::common::EngineError;
use crate::router::Router;
use crate::session::SessionTable;

use super::{parse_config, Config, SessionConfig};

/// One fully-built, immutable view of the routing config. Packets in
/// flight hold an `Arc` to the snapshot they started with.
pub struct RoutingSnapshot {
    pub generation: u64,
    pub router: Router,
    pub backends: BackendManager,
}

/// Result of a successful reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadOutcome {
    pub generation: u64,
    /// Sessions whose backend changed and were drained.
    pub drained: usize,
    /// Sessions migrated to the new generation in place.
    pub migrated: usize,
}

pub struct ConfigManager {
    current: RwLock<Arc<RoutingSnapshot>>,
    generation: AtomicU64,
    asset_dir: Option<PathBuf>,
    session: SessionConfig,
}

impl ConfigManager {
    /// Build the initial snapshot from a parsed config. Fails without
    /// side effects if any rule or outbound cannot be built.
    pub fn new(config: &Config, asset_dir: Option<PathBuf>) -> Result<Self, EngineError> {
        config.validate()?;
        let snapshot = build_snapshot(config, asset_dir.as_deref(), 1)?;
        Ok(Self {
            current: RwLock::new(Arc::new(snapshot)),
            generation: AtomicU64::new(1),
            asset_dir,
            session: config.session.clone(),
        })
    }

    /// Cheap clone of the current snapshot.
    pub async fn snapshot(&self) -> Arc<RoutingSnapshot> {
        self.current.read().await.clone()
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Session tuning captured at construction. Reload updates routing
    /// only; timer changes take effect on the next engine start.
    pub fn session_config(&self) -> &SessionConfig {
        &self.session
    }

    /// Validate config text without touching running state. Returns a
    /// human-readable message on failure, `None` when the config is
    /// acceptable.
    pub fn validate_text(json: &str, asset_dir: Option<&Path>) -> Option<String> {
        let config = match parse_config(json) {
            Ok(c) => c,
            Err(e) => return Some(e.to_string()),
        };
        if let Err(e) = config.validate() {
            return Some(e.to_string());
        }
        // Dry-build so file-backed rules and backend protocols are
        // checked too, not just the JSON shape.
        if let Err(e) = build_snapshot(&config, asset_dir, 0) {
            return Some(e.to_string());
        }
        None
    }

    /// Replace the routing config. All-or-nothing: the new snapshot is
    /// fully built before the swap, and a failed reload leaves the old
    /// one serving. After the swap, sessions whose resolved backend
    /// changed are drained; every other session migrates in place and
    /// keeps its transport.
    pub async fn reload(
        &self,
        json: &str,
        table: &SessionTable,
    ) -> Result<ReloadOutcome, EngineError> {
        let config = parse_config(json)?;
        config.validate()?;

        let generation = self.generation.load(Ordering::Acquire) + 1;
        let snapshot = Arc::new(build_snapshot(
            &config,
            self.asset_dir.as_deref(),
            generation,
        )?);

        {
            let mut current = self.current.write().await;
            *current = snapshot.clone();
        }
        self.generation.store(generation, Ordering::Release);

        // Creations in flight with the old snapshot must not publish
        // after the sweep below; the table rejects them at the floor.
        table.raise_generation_floor(generation);

        let mut migrated = 0usize;
        for session in table.sessions().await {
            if snapshot.router.resolve(session.key()) == session.backend_tag() {
                session.set_generation(generation);
                migrated += 1;
            }
        }
        let drained = table
            .drain_where(|s| s.generation() < generation)
            .await;

        info!(
            generation = generation,
            drained = drained,
            migrated = migrated,
            "config reloaded"
        );
        Ok(ReloadOutcome {
            generation,
            drained,
            migrated,
        })
    }
}

fn build_snapshot(
    config: &Config,
    asset_dir: Option<&Path>,
    generation: u64,
) -> Result<RoutingSnapshot, EngineError> {
    let router = Router::new(&config.routing, asset_dir)?;
    let backends = BackendManager::new(&config.outbounds)?;
    debug!(
        generation = generation,
        rules = router.rules().len(),
        outbounds = backends.len(),
        "routing snapshot built"
    );
    Ok(RoutingSnapshot {
        generation,
        router,
        backends,
    })
}
