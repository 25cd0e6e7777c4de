//! # Operation Router
//!
//! Single entry point for every operation, local or remote.
//!
//! ```text
//!                       route(op)
//!                          │
//!               op.kind() known? ──no──► RoutingError
//!                          │
//!        target empty or == local garden?
//!              │yes                  │no
//!              ▼                     ▼
//!     HandlerTable[kind]      GardenRegistry[target] ──missing──► RoutingError
//!     .handle(router, op)            │
//!                             transport up? ──no──► RemoteUnreachableError
//!                                    │
//!                   strip wait_timeout, then
//!                   request(op, wait)  or  publish(op) for fire-and-forget kinds
//! ```
//!
//! Handlers receive the router itself, so a handler that needs to push
//! operations to other gardens (user sync) routes through the same path.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use garden_core::{Operation, OperationKind, Response};

use crate::error::{SyncError, SyncResult};
use crate::registry::GardenRegistry;

// =============================================================================
// Handlers
// =============================================================================

/// Executes one kind of operation on this garden.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn handle(&self, router: &Router, operation: Operation) -> SyncResult<Response>;
}

/// Immutable kind → handler table.
#[derive(Clone, Default)]
pub struct HandlerTable {
    handlers: HashMap<OperationKind, Arc<dyn OperationHandler>>,
}

impl HandlerTable {
    pub fn builder() -> HandlerTableBuilder {
        HandlerTableBuilder::default()
    }

    pub fn get(&self, kind: OperationKind) -> Option<&Arc<dyn OperationHandler>> {
        self.handlers.get(&kind)
    }

    pub fn kinds(&self) -> Vec<OperationKind> {
        let mut kinds: Vec<_> = self.handlers.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

/// Collects handlers before the table is frozen.
#[derive(Default)]
pub struct HandlerTableBuilder {
    handlers: HashMap<OperationKind, Arc<dyn OperationHandler>>,
}

impl HandlerTableBuilder {
    /// Adds the handler for `kind`. A kind can be registered only once.
    pub fn register(
        mut self,
        kind: OperationKind,
        handler: Arc<dyn OperationHandler>,
    ) -> SyncResult<Self> {
        if self.handlers.contains_key(&kind) {
            return Err(SyncError::InvalidConfig(format!(
                "handler for {} registered twice",
                kind
            )));
        }
        self.handlers.insert(kind, handler);
        Ok(self)
    }

    pub fn build(self) -> HandlerTable {
        HandlerTable {
            handlers: self.handlers,
        }
    }
}

// =============================================================================
// Router
// =============================================================================

pub struct Router {
    garden_name: String,
    handlers: HandlerTable,
    registry: GardenRegistry,
}

impl Router {
    pub fn new(garden_name: impl Into<String>, handlers: HandlerTable, registry: GardenRegistry) -> Self {
        Router {
            garden_name: garden_name.into(),
            handlers,
            registry,
        }
    }

    pub fn garden_name(&self) -> &str {
        &self.garden_name
    }

    pub fn registry(&self) -> &GardenRegistry {
        &self.registry
    }

    /// Executes `operation` locally or forwards it to its target garden.
    pub async fn route(&self, operation: Operation) -> SyncResult<Response> {
        let kind = operation.kind()?;

        if operation.is_local_to(&self.garden_name) {
            let handler = self.handlers.get(kind).ok_or_else(|| {
                SyncError::Routing(format!("No local handler for operation type '{}'", kind))
            })?;

            debug!(garden = %self.garden_name, operation = %kind, "Handling operation locally");
            return handler.handle(self, operation).await;
        }

        // is_local_to is false only for a non-empty target
        let target = operation.target_garden_name().unwrap_or_default().to_string();

        let entry = self
            .registry
            .get(&target)
            .ok_or_else(|| SyncError::Routing(format!("Unknown garden '{}'", target)))?;

        let transport = entry
            .transport
            .filter(|transport| transport.is_connected())
            .ok_or_else(|| {
                SyncError::RemoteUnreachable(format!("garden '{}' has no live connection", target))
            })?;

        let wait = operation.wait_timeout();
        let forwarded = operation.without_wait_timeout();

        if !kind.expects_reply() {
            info!(garden = %target, operation = %kind, "Publishing operation");
            transport.publish(&forwarded).await?;
            return Ok(Response::ack());
        }

        info!(garden = %target, operation = %kind, ?wait, "Forwarding operation");
        transport.request(&forwarded, wait).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::GardenTransport;
    use crate::testing::StubTransport;
    use garden_core::{ConnectionType, ErrorKind, ErrorMessage, Garden, WAIT_TIMEOUT_KWARG};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct CountingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl OperationHandler for CountingHandler {
        async fn handle(&self, router: &Router, operation: Operation) -> SyncResult<Response> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Response::new(
                "Handled",
                json!({"garden": router.garden_name(), "type": operation.operation_type()}),
            ))
        }
    }

    fn router_with(
        handler: Arc<CountingHandler>,
        remote: Option<Arc<StubTransport>>,
    ) -> Router {
        let table = HandlerTable::builder()
            .register(OperationKind::JobReadAll, handler.clone())
            .unwrap()
            .register(OperationKind::UserSync, handler)
            .unwrap()
            .build();

        let registry = GardenRegistry::new();
        if let Some(transport) = remote {
            let transport: Arc<dyn GardenTransport> = transport;
            registry.register(
                Garden::new("child", Some(ConnectionType::Stomp)),
                Some(transport),
            );
        }
        Router::new("parent", table, registry)
    }

    #[tokio::test]
    async fn test_local_operations_never_touch_transports() {
        let handler = Arc::new(CountingHandler::default());
        let remote = StubTransport::replying(Ok(Response::ack()));
        let router = router_with(handler.clone(), Some(remote.clone()));

        let untargeted = Operation::new(OperationKind::JobReadAll);
        let empty_target = Operation::new(OperationKind::JobReadAll).with_target("");
        let self_target = Operation::new(OperationKind::JobReadAll).with_target("parent");

        for op in [untargeted, empty_target, self_target] {
            let response = router.route(op).await.unwrap();
            assert_eq!(response.payload["garden"], "parent");
        }

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert!(remote.requests().is_empty());
        assert!(remote.published().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_garden_is_routing_error() {
        let handler = Arc::new(CountingHandler::default());
        let remote = StubTransport::replying(Ok(Response::ack()));
        let router = router_with(handler.clone(), Some(remote.clone()));

        let err = router
            .route(Operation::new(OperationKind::JobReadAll).with_target("nowhere"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Routing);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
        assert!(remote.requests().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_operation_type_is_routing_error() {
        let router = router_with(Arc::new(CountingHandler::default()), None);

        let err = router.route(Operation::with_type("BREW_COFFEE")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Routing);

        // known kind without a local handler
        let err = router.route(Operation::new(OperationKind::JobPause)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Routing);
    }

    #[tokio::test]
    async fn test_forwarding_strips_wait_timeout() {
        let remote = StubTransport::replying(Ok(Response::new("Job", json!([]))));
        let router = router_with(Arc::new(CountingHandler::default()), Some(remote.clone()));

        let op = Operation::new(OperationKind::JobReadAll)
            .with_target("child")
            .with_kwarg(WAIT_TIMEOUT_KWARG, json!(2.5));
        let response = router.route(op).await.unwrap();
        assert_eq!(response.model_class, "Job");

        let requests = remote.requests();
        assert_eq!(requests.len(), 1);
        let (forwarded, wait) = &requests[0];
        assert!(forwarded.kwarg(WAIT_TIMEOUT_KWARG).is_none());
        assert_eq!(*wait, Some(Duration::from_millis(2500)));
    }

    #[tokio::test]
    async fn test_fire_and_forget_is_published() {
        let remote = StubTransport::replying(Ok(Response::new("Job", json!([]))));
        let router = router_with(Arc::new(CountingHandler::default()), Some(remote.clone()));

        let response = router
            .route(Operation::new(OperationKind::UserSync).with_target("child"))
            .await
            .unwrap();

        assert!(response.is_empty());
        assert_eq!(remote.published().len(), 1);
        assert!(remote.requests().is_empty());
    }

    #[tokio::test]
    async fn test_disconnected_garden_is_unreachable() {
        let router = router_with(
            Arc::new(CountingHandler::default()),
            Some(StubTransport::disconnected()),
        );
        let err = router
            .route(Operation::new(OperationKind::JobReadAll).with_target("child"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RemoteUnreachable);

        // known from the store only
        let router = router_with(Arc::new(CountingHandler::default()), None);
        router
            .registry()
            .register(Garden::new("child", Some(ConnectionType::Stomp)), None);
        let err = router
            .route(Operation::new(OperationKind::JobReadAll).with_target("child"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RemoteUnreachable);
    }

    #[tokio::test]
    async fn test_remote_failure_surfaces_unchanged() {
        let remote = StubTransport::replying(Err(SyncError::Remote(ErrorMessage::new(
            ErrorKind::Validation,
            "Unsupported status value 'STOPPED'",
        ))));
        let router = router_with(Arc::new(CountingHandler::default()), Some(remote));

        let err = router
            .route(Operation::new(OperationKind::JobReadAll).with_target("child"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(
            err.to_error_message().message,
            "Unsupported status value 'STOPPED'"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_wait_is_bounded() {
        let remote = StubTransport::slow(Duration::from_secs(60));
        let router = router_with(Arc::new(CountingHandler::default()), Some(remote));

        let op = Operation::new(OperationKind::JobReadAll)
            .with_target("child")
            .with_kwarg(WAIT_TIMEOUT_KWARG, json!(1));
        let started = tokio::time::Instant::now();
        let err = router.route(op).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::RemoteUnreachable);
        assert!(started.elapsed() < Duration::from_secs(60));
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let handler = Arc::new(CountingHandler::default());
        let result = HandlerTable::builder()
            .register(OperationKind::JobPause, handler.clone())
            .unwrap()
            .register(OperationKind::JobPause, handler);
        assert!(matches!(result, Err(SyncError::InvalidConfig(_))));
    }
}
