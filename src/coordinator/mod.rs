// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Operation log engine facade.
//!
//! The [`OpLogEngine`] ties the components together:
//! - capture pipeline and writer for local commands
//! - log store (SQLite or in-memory) with snapshot and clock slots
//! - hydration (snapshot + tail replay) with schema migration
//! - recovery, compaction, remote-sync hydration and remote exchange
//!
//! # Lifecycle
//!
//! ```text
//! Created → Hydrating → Ready
//!              │
//!              └─(error)→ Recovering → Ready
//!                              │
//!                              └─(error)→ Failed
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use oplog_engine::{OpLogConfig, OpLogEngine, EngineState, StaticClientId};
//! # use oplog_engine::AppStateHost;
//! # async fn run(host: Arc<dyn AppStateHost>) -> oplog_engine::Result<()> {
//! let engine = OpLogEngine::builder(OpLogConfig::default(), host, Arc::new(StaticClientId("client-a".into())))
//!     .build()
//!     .await?;
//! assert_eq!(engine.state(), EngineState::Created);
//!
//! engine.hydrate_store().await?;
//! assert!(engine.is_ready());
//! # Ok(())
//! # }
//! ```

mod api;
mod lifecycle;
mod types;

pub use types::{DispatchOutcome, EngineState, HydrationReport, SyncReport};

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::capture::{ChangeExtractor, ChangeExtractors, OperationCaptureQueue, OperationWriter};
use crate::compaction::{CompactionConfig, CompactionResult, CompactionTrigger, Compactor};
use crate::config::OpLogConfig;
use crate::error::Result;
use crate::host::{
    AppStateHost, CachedClientId, ClientIdProvider, ModelDataSource, RemoteClockView, TracingNotifier,
    UserNotifier,
};
use crate::hydration_state::HydrationState;
use crate::recovery::RecoveryService;
use crate::remote::{RemoteEndpoint, RemoteSync};
use crate::resilience::LockService;
use crate::schema::SchemaMigrator;
use crate::storage::{InMemoryLogStore, LogStore, SqliteLogStore};
use crate::sync_hydration::SyncHydrator;
use crate::validation::{CoreSectionsValidator, StateValidator};

/// The operation log engine.
///
/// `Send + Sync`; share it behind an `Arc`. Call [`hydrate_store()`](Self::hydrate_store)
/// once at startup before dispatching commands.
pub struct OpLogEngine {
    pub(super) config: OpLogConfig,

    /// Lifecycle state (broadcast to watchers)
    pub(super) state: watch::Sender<EngineState>,
    pub(super) state_rx: watch::Receiver<EngineState>,

    pub(super) store: Arc<dyn LogStore>,
    pub(super) host: Arc<dyn AppStateHost>,
    pub(super) locks: Arc<LockService>,
    pub(super) notifier: Arc<dyn UserNotifier>,
    pub(super) validator: Arc<dyn StateValidator>,
    pub(super) remote_clock: Option<Arc<dyn RemoteClockView>>,
    pub(super) migrator: SchemaMigrator,

    /// Sync window flags and the deferred command buffer
    pub(super) hydration: HydrationState,
    pub(super) queue: OperationCaptureQueue,
    pub(super) extractors: ChangeExtractors,
    /// Held across capture and dequeue so queue slots match their commands
    pub(super) dispatch_gate: Mutex<()>,

    pub(super) writer: OperationWriter,
    pub(super) compactor: Arc<Compactor>,
    pub(super) recovery: RecoveryService,
    pub(super) sync_hydrator: SyncHydrator,
    pub(super) remote: Option<RemoteSync>,
}

impl OpLogEngine {
    /// Start building an engine around the application `host`.
    pub fn builder(
        config: OpLogConfig,
        host: Arc<dyn AppStateHost>,
        client_id: Arc<dyn ClientIdProvider>,
    ) -> OpLogEngineBuilder {
        OpLogEngineBuilder {
            config,
            host,
            client_id,
            store: None,
            legacy: None,
            remote_clock: None,
            remote_endpoint: None,
            notifier: Arc::new(TracingNotifier),
            validator: None,
            migrator: None,
            extractors: ChangeExtractors::new(),
        }
    }

    /// Get current engine state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state() == EngineState::Ready
    }

    pub(super) fn set_state(&self, state: EngineState) {
        debug!(%state, "Engine state change");
        crate::metrics::set_engine_state(state.as_str());
        let _ = self.state.send(state);
    }

    #[must_use]
    pub fn config(&self) -> &OpLogConfig {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn LogStore> {
        &self.store
    }

    #[must_use]
    pub fn hydration_state(&self) -> &HydrationState {
        &self.hydration
    }

    /// True while remote operations are applied and during the cooldown after.
    ///
    /// Side effects driven by state changes should stay quiet while this holds.
    #[must_use]
    pub fn is_in_sync_window(&self) -> bool {
        self.hydration.is_in_sync_window()
    }

    #[must_use]
    pub fn is_applying_remote_ops(&self) -> bool {
        self.hydration.is_applying_remote_ops()
    }

    /// Run a regular compaction now.
    pub async fn compact(&self) -> Result<CompactionResult> {
        self.compactor.compact().await
    }
}

/// Builder for [`OpLogEngine`].
pub struct OpLogEngineBuilder {
    config: OpLogConfig,
    host: Arc<dyn AppStateHost>,
    client_id: Arc<dyn ClientIdProvider>,
    store: Option<Arc<dyn LogStore>>,
    legacy: Option<Arc<dyn ModelDataSource>>,
    remote_clock: Option<Arc<dyn RemoteClockView>>,
    remote_endpoint: Option<Arc<dyn RemoteEndpoint>>,
    notifier: Arc<dyn UserNotifier>,
    validator: Option<Arc<dyn StateValidator>>,
    migrator: Option<SchemaMigrator>,
    extractors: ChangeExtractors,
}

impl OpLogEngineBuilder {
    /// Use this store instead of the one derived from `config.db_path`.
    #[must_use]
    pub fn store(mut self, store: Arc<dyn LogStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Legacy model storage consulted on fresh installs and during recovery.
    #[must_use]
    pub fn legacy_source(mut self, source: Arc<dyn ModelDataSource>) -> Self {
        self.legacy = Some(source);
        self
    }

    #[must_use]
    pub fn remote_clock(mut self, view: Arc<dyn RemoteClockView>) -> Self {
        self.remote_clock = Some(view);
        self
    }

    #[must_use]
    pub fn remote_endpoint(mut self, endpoint: Arc<dyn RemoteEndpoint>) -> Self {
        self.remote_endpoint = Some(endpoint);
        self
    }

    #[must_use]
    pub fn notifier(mut self, notifier: Arc<dyn UserNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    #[must_use]
    pub fn validator(mut self, validator: Arc<dyn StateValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    #[must_use]
    pub fn migrator(mut self, migrator: SchemaMigrator) -> Self {
        self.migrator = Some(migrator);
        self
    }

    /// Register an entity-change extractor for `action_type`.
    #[must_use]
    pub fn extractor(mut self, action_type: impl Into<String>, extractor: ChangeExtractor) -> Self {
        self.extractors.register(action_type, extractor);
        self
    }

    /// Open the store and wire the components.
    ///
    /// Fails fast if the migration chain is misconfigured or the SQLite file
    /// cannot be opened.
    pub async fn build(self) -> Result<OpLogEngine> {
        let config = self.config;
        let migrator = match self.migrator {
            Some(m) => m,
            None => SchemaMigrator::new()?,
        };

        let store: Arc<dyn LogStore> = match (self.store, &config.db_path) {
            (Some(store), _) => store,
            (None, Some(path)) => {
                info!(path = %path, "Opening SQLite operation log");
                Arc::new(SqliteLogStore::open(path).await?)
            }
            (None, None) => {
                info!("No db_path configured; using an in-memory operation log");
                Arc::new(InMemoryLogStore::new())
            }
        };

        let validator = self
            .validator
            .unwrap_or_else(|| Arc::new(CoreSectionsValidator::new(config.core_state_sections.clone())));
        let locks = Arc::new(LockService::new());
        let client_id = Arc::new(CachedClientId::new(self.client_id));

        let compactor = Arc::new(Compactor::new(
            Arc::clone(&store),
            Arc::clone(&self.host),
            Arc::clone(&locks),
            CompactionConfig::from(&config),
        ));
        let trigger = Arc::new(CompactionTrigger::new(
            Arc::clone(&compactor),
            Arc::clone(&store),
            Arc::clone(&self.notifier),
        ));
        let writer = OperationWriter::new(
            Arc::clone(&store),
            Arc::clone(&locks),
            Arc::clone(&client_id),
            Arc::clone(&compactor),
            trigger,
            Arc::clone(&self.notifier),
            config.core_state_sections.clone(),
        );
        let recovery = RecoveryService::new(
            Arc::clone(&store),
            Arc::clone(&self.host),
            Arc::clone(&locks),
            Arc::clone(&client_id),
            self.legacy,
            self.remote_clock.clone(),
            &config,
        );
        let sync_hydrator = SyncHydrator::new(
            Arc::clone(&store),
            Arc::clone(&self.host),
            Arc::clone(&locks),
            client_id,
            self.remote_clock.clone(),
            Arc::clone(&validator),
            Arc::clone(&self.notifier),
            config.core_state_sections.clone(),
            config.local_only_fields.clone(),
        );
        let remote = self.remote_endpoint.map(|endpoint| {
            RemoteSync::new(
                endpoint,
                Arc::clone(&store),
                Arc::clone(&self.host),
                Arc::clone(&locks),
                migrator.clone(),
            )
        });

        let (state_tx, state_rx) = watch::channel(EngineState::Created);

        Ok(OpLogEngine {
            hydration: HydrationState::new(config.post_sync_cooldown(), config.deferred_warn_threshold),
            queue: OperationCaptureQueue::new(config.capture_queue_warn_threshold),
            extractors: self.extractors,
            dispatch_gate: Mutex::new(()),
            state: state_tx,
            state_rx,
            store,
            host: self.host,
            locks,
            notifier: self.notifier,
            validator,
            remote_clock: self.remote_clock,
            migrator,
            writer,
            compactor,
            recovery,
            sync_hydrator,
            remote,
            config,
        })
    }
}
