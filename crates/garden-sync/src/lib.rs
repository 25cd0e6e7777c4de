//! # garden-sync: Federation Core for Beer Garden
//!
//! Connects a garden to its message broker, routes operations between
//! gardens and keeps job and user state consistent across the federation.
//!
//! ## Architecture Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Garden Federation Core                            │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                   GardenAgent (Orchestrator)                     │  │
//! │  │  Seeds the registry, builds the handler table, owns the tasks   │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │         ┌─────────────────────┼─────────────────────┐                  │
//! │         ▼                     ▼                     ▼                   │
//! │  ┌────────────────┐  ┌────────────────┐  ┌────────────────────────┐    │
//! │  │BrokerConnection│  │ Operation      │  │  Router                │    │
//! │  │                │  │ Listener       │  │                        │    │
//! │  │ STOMP 1.2 over │─►│ decode → route │─►│ HandlerTable (local)   │    │
//! │  │ WebSocket,     │  │ → reply        │  │ GardenRegistry (remote)│    │
//! │  │ backoff, reply │  │ events → users │  │                        │    │
//! │  │ correlation    │  │                │  │                        │    │
//! │  └────────────────┘  └────────────────┘  └───────────┬────────────┘    │
//! │                                                       │                 │
//! │                               ┌───────────────────────┴──────┐         │
//! │                               ▼                              ▼          │
//! │                      ┌────────────────┐           ┌────────────────┐   │
//! │                      │  JobControl    │           │  UserSync      │   │
//! │                      │  patch state   │           │  push / import │   │
//! │                      │  machine       │           │  USER_UPDATED  │   │
//! │                      └────────────────┘           └────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Organization
//!
//! ### Plumbing
//! - [`config`] - Garden configuration (TOML + `BG_*` environment)
//! - [`error`] - Sync error types
//! - [`supervisor`] - Lifecycle token and reconnection backoff
//! - [`frame`] - STOMP frame codec
//! - [`transport`] - Broker connection and reply correlation
//! - [`codec`] - Operation, result and event bodies plus header assembly
//!
//! ### Federation
//! - [`registry`] - Known gardens and how to reach them
//! - [`router`] - Local handler dispatch or forwarding
//! - [`listener`] - Inbound message processing and replies
//! - [`events`] - Local event bus and upstream forwarding
//! - [`jobs`] - Job control facade and JOB_* handlers
//! - [`users`] - User federation sync and USER_SYNC handler
//! - [`agent`] - `GardenAgent` orchestrator
//!
//! ## Usage
//!
//! ```rust,ignore
//! use garden_sync::{GardenAgent, GardenConfig, Lifecycle};
//! use garden_db::Database;
//!
//! let config = GardenConfig::load(None)?;
//! let db = Database::new(config.db_config()).await?;
//!
//! let root = Lifecycle::new();
//! let mut agent = GardenAgent::new(config, db, &root);
//! let handle = agent.start().await?;
//!
//! let jobs = handle.jobs().list(&[]).await?;
//!
//! agent.shutdown().await;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod config;
pub mod error;
pub mod supervisor;

pub mod codec;
pub mod frame;
pub mod transport;

pub mod listener;
pub mod registry;
pub mod router;

pub mod agent;
pub mod events;
pub mod jobs;
pub mod users;

#[cfg(test)]
mod testing;

// =============================================================================
// Re-exports
// =============================================================================

pub use agent::{GardenAgent, GardenAgentHandle, GardenStatus};
pub use config::GardenConfig;
pub use error::{SyncError, SyncResult};
pub use events::EventBus;
pub use jobs::{DbScheduler, JobControl, SchedulerBackend};
pub use listener::{EventHandler, OperationListener};
pub use registry::{GardenRegistry, GardenTransport};
pub use router::{HandlerTable, OperationHandler, Router};
pub use supervisor::{BackoffPolicy, Lifecycle, Readiness, Supervisor};
pub use transport::{BrokerConnection, ConnectionState, MessageSink, TransportConfig};
pub use users::{UserPatch, UserSync};
