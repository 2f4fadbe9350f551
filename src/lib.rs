//! # OpLog Engine
//!
//! A local-first operation log: every state-changing command an application
//! performs is captured, stamped with a vector clock and persisted, so state
//! can be rebuilt after a restart and merged with other devices.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Capture Layer                        │
//! │  • Accepts commands via dispatch()                          │
//! │  • Entity-change extraction, FIFO capture queue             │
//! │  • Defers commands while remote operations are applied      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                    (OPERATION_LOG lock, clock increment)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Log Store                            │
//! │  • Append-only entries with monotonic seq                  │
//! │  • Snapshot slot + migration backup slot                   │
//! │  • Persisted vector clock and compaction counter            │
//! │  • SQLite (durable) or in-memory                           │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                    (startup)
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Hydration                            │
//! │  • Snapshot load, schema migration, validation             │
//! │  • Tail replay as one bulk update                          │
//! │  • Disaster recovery from legacy data                      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Remote Exchange                        │
//! │  • Download/apply with conflict detection                  │
//! │  • Upload of unsynced operations and snapshots             │
//! │  • Circuit breaker + retry around the endpoint             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use oplog_engine::{
//!     AppStateHost, OpLogConfig, OpLogEngine, OpType, PersistentCommand, StaticClientId,
//! };
//! use serde_json::json;
//!
//! # async fn run(host: Arc<dyn AppStateHost>) -> oplog_engine::Result<()> {
//! let config = OpLogConfig {
//!     db_path: Some("/var/lib/app/oplog.db".into()),
//!     ..Default::default()
//! };
//! let engine = OpLogEngine::builder(config, host, Arc::new(StaticClientId("device-a".into())))
//!     .build()
//!     .await?;
//!
//! // Rebuild state from snapshot + log
//! engine.hydrate_store().await?;
//!
//! // Persist a command
//! let before = json!({"task": {}});
//! let after = json!({"task": {"t1": {"title": "Write docs"}}});
//! let cmd = PersistentCommand::new("[Task] Add", OpType::Create, "TASK", json!({"id": "t1"}))
//!     .with_entity_id("t1");
//! engine.dispatch(cmd, &before, &after).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`coordinator`]: The [`OpLogEngine`] facade and its lifecycle
//! - [`capture`]: Capture queue, change extraction and the operation writer
//! - [`storage`]: Log stores (SQLite, memory)
//! - [`compaction`]: Snapshot-then-delete compaction and its trigger
//! - [`schema`]: Versioned state and operation migrations
//! - [`recovery`]: Disaster recovery and failed-operation retry
//! - [`remote`]: Remote endpoint abstraction and sync
//! - [`resilience`]: Named locks, circuit breaker, retry

pub mod capture;
pub mod compaction;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod host;
pub mod hydration_state;
pub mod metrics;
pub mod operation;
pub mod recovery;
pub mod remote;
pub mod resilience;
pub mod schema;
pub mod snapshot;
pub mod storage;
pub mod sync_hydration;
pub mod validation;
pub mod vector_clock;

pub use capture::{section_delta_extractor, ChangeExtractor};
pub use compaction::{CompactionKind, CompactionResult};
pub use config::OpLogConfig;
pub use coordinator::{DispatchOutcome, EngineState, HydrationReport, OpLogEngine, OpLogEngineBuilder, SyncReport};
pub use error::{OpLogError, Result};
pub use host::{
    AppStateHost, ApplyError, ClientIdProvider, ClockSyncError, HostError, ModelDataSource, RemoteClockView,
    StaticClientId, TracingNotifier, UserNotice, UserNotifier,
};
pub use hydration_state::HydrationState;
pub use operation::{
    ApplicationStatus, EntityChange, OpSource, OpType, Operation, OperationLogEntry, PersistentCommand, StateCache,
};
pub use recovery::RetryReport;
pub use remote::{
    Conflict, DownloadOutcome, DownloadPage, RemoteEndpoint, RemoteError, UploadOutcome, UploadReceipt,
};
pub use resilience::{CircuitConfig, RetryConfig};
pub use schema::{SchemaMigration, SchemaMigrator};
pub use storage::{InMemoryLogStore, LogStore, SqliteLogStore, StorageError};
pub use validation::{CoreSectionsValidator, StateCheck, StateValidator};
pub use vector_clock::{ClockComparison, VectorClock};
