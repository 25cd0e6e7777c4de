//! # Garden Agent
//!
//! Wires the federation core together and owns its background tasks.
//!
//! ## Agent Architecture
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        GardenAgent Architecture                         │
//! │                                                                         │
//! │  ┌──────────────────────────────────────────────────────────────────┐  │
//! │  │                         GardenAgent                              │  │
//! │  │                                                                  │  │
//! │  │  • Seeds the garden store and registry from configuration       │  │
//! │  │  • Builds the handler table (jobs, user sync)                   │  │
//! │  │  • Spawns the broker, listener and event tasks                  │  │
//! │  │  • Joins them within the shutdown grace period                  │  │
//! │  └────────────────────────────┬─────────────────────────────────────┘  │
//! │                               │                                         │
//! │      ┌──────────────────┬─────┴────────────┬──────────────────┐        │
//! │      ▼                  ▼                  ▼                  ▼         │
//! │  ┌──────────┐   ┌──────────────┐   ┌──────────────┐   ┌────────────┐   │
//! │  │ maintain │   │ listener.run │   │ forward_to_  │   │ sync on    │   │
//! │  │ (broker  │   │ decode/route │   │ broker       │   │ connect    │   │
//! │  │ backoff) │   │ /reply       │   │ local events │   │ user push  │   │
//! │  └──────────┘   └──────────────┘   └──────────────┘   └────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use garden_db::Database;

use crate::codec::garden_headers;
use crate::config::GardenConfig;
use crate::error::{SyncError, SyncResult};
use crate::events::{forward_to_broker, EventBus};
use crate::jobs::{self, DbScheduler, JobControl, SchedulerBackend};
use crate::listener::OperationListener;
use crate::registry::{BrokerGardenTransport, GardenRegistry, GardenTransport};
use crate::router::{HandlerTable, Router};
use crate::supervisor::{Lifecycle, Readiness};
use crate::transport::{BrokerConnection, ConnectionState};
use crate::users::{self, UserSync};

// =============================================================================
// Status
// =============================================================================

/// Point-in-time view of the agent for health reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct GardenStatus {
    pub garden_name: String,
    pub connection_state: ConnectionState,
    pub remote_gardens: Vec<String>,
}

// =============================================================================
// Garden Agent
// =============================================================================

pub struct GardenAgent {
    config: Arc<GardenConfig>,
    db: Database,
    lifecycle: Lifecycle,
    backend: Arc<dyn SchedulerBackend>,
    bus: EventBus,
    connection: Option<Arc<BrokerConnection>>,
    tasks: Vec<JoinHandle<()>>,
}

impl GardenAgent {
    /// Creates an agent that stops when `parent` stops.
    pub fn new(config: GardenConfig, db: Database, parent: &Lifecycle) -> Self {
        let backend = Arc::new(DbScheduler::new(db.clone()));
        GardenAgent {
            config: Arc::new(config),
            db,
            lifecycle: parent.child(),
            backend,
            bus: EventBus::default(),
            connection: None,
            tasks: Vec::new(),
        }
    }

    /// Replaces the in-process scheduler.
    pub fn with_scheduler(mut self, backend: Arc<dyn SchedulerBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.bus
    }

    /// Starts every background task and returns a handle to the running
    /// garden.
    pub async fn start(&mut self) -> SyncResult<GardenAgentHandle> {
        if self.connection.is_some() {
            return Err(SyncError::Internal("garden agent already started".into()));
        }

        self.config.validate()?;
        let garden_name = self.config.garden_name().to_string();

        info!(
            garden = %garden_name,
            endpoints = ?self.config.broker.endpoints,
            remote_gardens = self.config.remote_gardens.len(),
            "Starting garden agent"
        );

        self.db.gardens().upsert(&self.config.local_garden()).await?;

        let (connection, inbound_rx) =
            BrokerConnection::new(garden_name.clone(), self.config.transport_config());
        let registry = self.seed_registry(&connection).await?;

        let jobs = Arc::new(JobControl::new(self.db.clone(), self.backend.clone()));
        let users = Arc::new(UserSync::new(
            self.db.clone(),
            garden_name.clone(),
            self.bus.clone(),
        ));

        let table = users::register(HandlerTable::builder(), users.clone())?;
        let table = jobs::register(table, jobs.clone())?.build();
        debug!(kinds = ?table.kinds(), "Handler table built");

        let router = Arc::new(Router::new(garden_name.clone(), table, registry.clone()));
        let listener = Arc::new(
            OperationListener::new(router.clone(), connection.clone())
                .with_event_handler(users.clone()),
        );

        self.tasks.push(tokio::spawn(
            connection.clone().maintain(self.lifecycle.clone()),
        ));
        self.tasks.push(tokio::spawn(
            listener.run(inbound_rx, self.lifecycle.clone()),
        ));
        self.tasks.push(tokio::spawn(forward_to_broker(
            self.bus.subscribe(),
            connection.clone(),
            garden_name.clone(),
            self.lifecycle.clone(),
        )));
        self.tasks.push(tokio::spawn(sync_on_connect(
            connection.clone(),
            users.clone(),
            router.clone(),
            self.lifecycle.clone(),
        )));

        self.connection = Some(connection.clone());
        info!(garden = %garden_name, "Garden agent started");

        Ok(GardenAgentHandle {
            garden_name,
            lifecycle: self.lifecycle.clone(),
            connection,
            router,
            jobs,
            users,
        })
    }

    /// Stops the agent and waits, at most the shutdown grace period, for
    /// its tasks to finish.
    pub async fn shutdown(&mut self) {
        info!(garden = %self.config.garden_name(), "Shutting down garden agent");
        self.lifecycle.stop();

        let grace = self.config.shutdown_grace();
        let mut tasks = std::mem::take(&mut self.tasks);
        let joined = tokio::time::timeout(grace, async {
            for task in tasks.iter_mut() {
                let _ = task.await;
            }
        })
        .await;

        if joined.is_err() {
            warn!(?grace, "Garden agent tasks did not stop in time, aborting them");
            for task in &tasks {
                task.abort();
            }
        }

        if let Some(connection) = self.connection.take() {
            connection.disconnect().await;
        }

        info!("Garden agent stopped");
    }

    /// Registers every configured remote garden with a broker transport,
    /// and every stored one that is not configured without one.
    async fn seed_registry(&self, connection: &Arc<BrokerConnection>) -> SyncResult<GardenRegistry> {
        let registry = GardenRegistry::new();
        let garden_name = self.config.garden_name();
        let reply_destination = self.config.broker.reply_destination.clone().unwrap_or_default();

        for remote in &self.config.remote_gardens {
            let garden = remote.to_garden();
            self.db.gardens().upsert(&garden).await?;

            let transport: Arc<dyn GardenTransport> = Arc::new(BrokerGardenTransport::new(
                remote.name.clone(),
                connection.clone(),
                remote.destination(),
                reply_destination.clone(),
                garden_headers(garden_name),
                self.lifecycle.clone(),
            ));
            registry.register(garden, Some(transport));
        }

        for garden in self.db.gardens().list_remote().await? {
            if !registry.contains(&garden.name) {
                registry.register(garden, None);
            }
        }

        Ok(registry)
    }
}

/// Pushes users to every remote garden each time the broker session comes up.
async fn sync_on_connect(
    connection: Arc<BrokerConnection>,
    users: Arc<UserSync>,
    router: Arc<Router>,
    lifecycle: Lifecycle,
) {
    let mut state_rx = connection.watch_state();
    let mut was_connected = false;

    loop {
        let connected = *state_rx.borrow_and_update() == ConnectionState::Connected;
        if connected && !was_connected {
            if let Err(e) = users.initiate_user_sync(&router).await {
                warn!(error = %e, "Initial user sync failed");
            }
        }
        was_connected = connected;

        tokio::select! {
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = lifecycle.stopped() => break,
        }
    }
}

// =============================================================================
// Agent Handle
// =============================================================================

/// Cloneable access to a running garden.
#[derive(Clone)]
pub struct GardenAgentHandle {
    garden_name: String,
    lifecycle: Lifecycle,
    connection: Arc<BrokerConnection>,
    router: Arc<Router>,
    jobs: Arc<JobControl>,
    users: Arc<UserSync>,
}

impl GardenAgentHandle {
    pub fn garden_name(&self) -> &str {
        &self.garden_name
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn jobs(&self) -> &Arc<JobControl> {
        &self.jobs
    }

    pub fn users(&self) -> &Arc<UserSync> {
        &self.users
    }

    pub fn status(&self) -> GardenStatus {
        GardenStatus {
            garden_name: self.garden_name.clone(),
            connection_state: self.connection.state(),
            remote_gardens: self.router.registry().names(),
        }
    }

    /// Waits for the first broker session.
    ///
    /// Retries and their warnings belong to the connection's own supervisor;
    /// this only observes its state. Returns [`Readiness::Stopped`] if the
    /// agent stops first.
    pub async fn until_connected(&self) -> Readiness {
        let mut state_rx = self.connection.watch_state();
        loop {
            if *state_rx.borrow_and_update() == ConnectionState::Connected {
                return Readiness::Ready;
            }
            tokio::select! {
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return Readiness::Stopped;
                    }
                }
                _ = self.lifecycle.stopped() => return Readiness::Stopped,
            }
        }
    }

    /// Signals the agent to stop. [`GardenAgent::shutdown`] does the join.
    pub fn shutdown(&self) {
        self.lifecycle.stop();
    }
}
