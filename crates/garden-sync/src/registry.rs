//! # Garden Registry
//!
//! The gardens this process knows about, each with the transport used to
//! reach it.
//!
//! Read on every forwarded route, written only when gardens are configured
//! or their connection lifecycle changes. Backed by a `DashMap`, so readers
//! never serialize behind a single lock.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info};

use garden_core::{Garden, Operation, Outcome, Response, MODEL_CLASS_ERROR, MODEL_CLASS_OPERATION};

use crate::codec::{build_headers, decode_outcome, encode_operation, model_class_headers};
use crate::error::{SyncError, SyncResult};
use crate::supervisor::Lifecycle;
use crate::transport::{BrokerConnection, Headers, HEADER_CORRELATION_ID, HEADER_REPLY_TO};

// =============================================================================
// Garden Transport
// =============================================================================

/// How operations reach one remote garden.
#[async_trait]
pub trait GardenTransport: Send + Sync {
    fn is_connected(&self) -> bool;

    /// Sends `operation` and waits for the correlated reply.
    ///
    /// `wait` bounds the wait; `None` waits until the reply arrives or the
    /// transport shuts down.
    async fn request(&self, operation: &Operation, wait: Option<Duration>) -> SyncResult<Response>;

    /// Sends `operation` without asking for a reply.
    async fn publish(&self, operation: &Operation) -> SyncResult<()>;
}

/// Reaches a remote garden through a destination on the shared broker.
pub struct BrokerGardenTransport {
    garden: String,
    conn: Arc<BrokerConnection>,
    destination: String,
    reply_destination: String,
    garden_headers: Headers,
    lifecycle: Lifecycle,
}

impl BrokerGardenTransport {
    pub fn new(
        garden: impl Into<String>,
        conn: Arc<BrokerConnection>,
        destination: impl Into<String>,
        reply_destination: impl Into<String>,
        garden_headers: Headers,
        lifecycle: Lifecycle,
    ) -> Self {
        BrokerGardenTransport {
            garden: garden.into(),
            conn,
            destination: destination.into(),
            reply_destination: reply_destination.into(),
            garden_headers,
            lifecycle,
        }
    }

    fn unreachable(&self, reason: impl std::fmt::Display) -> SyncError {
        SyncError::RemoteUnreachable(format!("garden '{}': {}", self.garden, reason))
    }
}

#[async_trait]
impl GardenTransport for BrokerGardenTransport {
    fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    async fn request(&self, operation: &Operation, wait: Option<Duration>) -> SyncResult<Response> {
        if !self.conn.is_connected() {
            return Err(self.unreachable("broker connection is down"));
        }

        let body = encode_operation(operation)?;
        let pending = self.conn.pending();
        let (correlation_id, reply_rx) = pending.register();

        let mut response_headers = model_class_headers(MODEL_CLASS_OPERATION);
        response_headers.insert(HEADER_REPLY_TO.to_string(), self.reply_destination.clone());
        response_headers.insert(HEADER_CORRELATION_ID.to_string(), correlation_id.clone());
        let headers = build_headers(&response_headers, &Headers::new(), &self.garden_headers);

        if let Err(e) = self.conn.try_send(body, headers, &self.destination).await {
            pending.cancel(&correlation_id);
            return Err(self.unreachable(e));
        }

        debug!(
            garden = %self.garden,
            operation = %operation.operation_type(),
            correlation_id = %correlation_id,
            ?wait,
            "Awaiting reply"
        );

        let reply = async {
            let received = match wait {
                Some(limit) => tokio::time::timeout(limit, reply_rx)
                    .await
                    .map_err(|_| self.unreachable(format!("no reply within {:?}", limit)))?,
                None => reply_rx.await,
            };
            received.map_err(|_| self.unreachable("connection lost before the reply arrived"))
        };

        let message = tokio::select! {
            result = reply => result,
            _ = self.lifecycle.stopped() => Err(SyncError::ShuttingDown),
        };

        let message = match message {
            Ok(message) => message,
            Err(e) => {
                pending.cancel(&correlation_id);
                return Err(e);
            }
        };

        let model_class = message.model_class().unwrap_or(MODEL_CLASS_ERROR);
        match decode_outcome(model_class, &message.body)? {
            Outcome::Success(response) => Ok(response),
            Outcome::Failure(error) => Err(SyncError::Remote(error)),
        }
    }

    async fn publish(&self, operation: &Operation) -> SyncResult<()> {
        let body = encode_operation(operation)?;
        let headers = build_headers(
            &model_class_headers(MODEL_CLASS_OPERATION),
            &Headers::new(),
            &self.garden_headers,
        );

        self.conn
            .try_send(body, headers, &self.destination)
            .await
            .map_err(|e| self.unreachable(e))
    }
}

// =============================================================================
// Registry
// =============================================================================

/// A garden plus how to reach it. `transport` is `None` for gardens known
/// only from the store.
#[derive(Clone)]
pub struct GardenEntry {
    pub garden: Garden,
    pub transport: Option<Arc<dyn GardenTransport>>,
}

/// Concurrent name → garden map shared by the router and the agent.
#[derive(Clone, Default)]
pub struct GardenRegistry {
    entries: Arc<DashMap<String, GardenEntry>>,
}

impl GardenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a garden. Returns the previous entry.
    pub fn register(
        &self,
        garden: Garden,
        transport: Option<Arc<dyn GardenTransport>>,
    ) -> Option<GardenEntry> {
        info!(
            garden = %garden.name,
            has_transport = transport.is_some(),
            "Registering garden"
        );
        self.entries
            .insert(garden.name.clone(), GardenEntry { garden, transport })
    }

    pub fn remove(&self, name: &str) -> Option<GardenEntry> {
        let removed = self.entries.remove(name).map(|(_, entry)| entry);
        if removed.is_some() {
            info!(garden = %name, "Removed garden");
        }
        removed
    }

    /// Snapshot of one entry. The map is not locked after this returns.
    pub fn get(&self, name: &str) -> Option<GardenEntry> {
        self.entries.get(name).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::garden_headers;
    use crate::frame::{Command, Frame};
    use crate::testing::{spawn_broker, StubTransport};
    use crate::transport::{TransportConfig, HEADER_DESTINATION, HEADER_MODEL_CLASS};
    use garden_core::{ConnectionType, ErrorKind, OperationKind};
    use serde_json::json;

    fn child() -> Garden {
        Garden::new("child", Some(ConnectionType::Stomp)).with_namespaces(["ns1"])
    }

    #[test]
    fn test_register_get_remove() {
        let registry = GardenRegistry::new();
        assert!(!registry.contains("child"));

        assert!(registry.register(child(), None).is_none());
        assert!(registry.contains("child"));
        assert!(registry.get("child").unwrap().transport.is_none());

        let transport: Arc<dyn GardenTransport> = StubTransport::replying(Ok(Response::ack()));
        let previous = registry.register(child(), Some(transport));
        assert!(previous.is_some());
        assert!(registry.get("child").unwrap().transport.is_some());

        assert!(registry.remove("child").is_some());
        assert!(registry.remove("child").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_clones_share_entries() {
        let registry = GardenRegistry::new();
        let other = registry.clone();
        registry.register(child(), None);
        assert_eq!(other.names(), vec!["child".to_string()]);
    }

    fn broker_transport(conn: Arc<BrokerConnection>, lifecycle: Lifecycle) -> BrokerGardenTransport {
        BrokerGardenTransport::new(
            "child",
            conn,
            "child.operations",
            "parent.replies",
            garden_headers("parent"),
            lifecycle,
        )
    }

    #[tokio::test]
    async fn test_request_on_disconnected_broker_is_unreachable() {
        let (conn, _rx) = BrokerConnection::new("parent", TransportConfig::default());
        let transport = broker_transport(conn, Lifecycle::new());

        let err = transport
            .request(&Operation::new(OperationKind::JobReadAll), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RemoteUnreachable);
        assert!(transport.conn.pending().is_empty());
    }

    /// Echoes each SEND that asks for a reply with a `Job` reply, or an
    /// error reply for JOB_DELETE. Sends without reply-to get nothing.
    fn echo_replies(frame: &Frame) -> Vec<Frame> {
        if frame.command != Command::Send {
            return Vec::new();
        }
        let (Some(reply_to), Some(correlation_id)) =
            (frame.get(HEADER_REPLY_TO), frame.get(HEADER_CORRELATION_ID))
        else {
            return Vec::new();
        };

        let reply = Frame::new(Command::Message)
            .header(HEADER_DESTINATION, reply_to)
            .header(HEADER_CORRELATION_ID, correlation_id);

        if frame.body.contains("JOB_DELETE") {
            vec![reply
                .header(HEADER_MODEL_CLASS, MODEL_CLASS_ERROR)
                .body(r#"{"error_type":"BackendError","message":"Job not found: 9"}"#)]
        } else {
            vec![reply.header(HEADER_MODEL_CLASS, "Job").body(r#"{"id":"1"}"#)]
        }
    }

    #[tokio::test]
    async fn test_request_reply_over_loopback_broker() {
        let (addr, mut frames_rx, broker) = spawn_broker(echo_replies).await;

        let config = TransportConfig {
            endpoints: vec![format!("ws://{}/stomp", addr)],
            subscriptions: vec!["parent.replies".into()],
            heartbeat: (0, 0),
            ..Default::default()
        };
        let (conn, _inbound_rx) = BrokerConnection::new("parent", config);
        conn.connect().await.unwrap();
        let transport = broker_transport(conn.clone(), Lifecycle::new());

        let op = Operation::new(OperationKind::JobRead).with_kwarg("job_id", json!("1"));
        let response = transport
            .request(&op, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(response.model_class, "Job");
        assert_eq!(response.payload, json!({"id": "1"}));

        let op = Operation::new(OperationKind::JobDelete).with_kwarg("job_id", json!("9"));
        let err = transport.request(&op, None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Backend);
        assert_eq!(err.to_string(), "BackendError: Job not found: 9");

        transport
            .publish(&Operation::new(OperationKind::UserSync))
            .await
            .unwrap();

        conn.disconnect().await;
        broker.await.unwrap();

        let sends: Vec<Frame> = std::iter::from_fn(|| frames_rx.try_recv().ok())
            .filter(|f| f.command == Command::Send)
            .collect();
        assert_eq!(sends.len(), 3);
        assert!(sends.iter().all(|f| f.get(HEADER_DESTINATION) == Some("child.operations")));
        assert_eq!(sends[0].get(HEADER_REPLY_TO), Some("parent.replies"));
        assert_eq!(sends[0].get("garden_name"), Some("parent"));
        // fire-and-forget carries no reply address
        assert_eq!(sends[2].get(HEADER_REPLY_TO), None);
        assert_eq!(sends[2].get(HEADER_MODEL_CLASS), Some(MODEL_CLASS_OPERATION));
    }

    #[tokio::test]
    async fn test_request_times_out_without_reply() {
        let (addr, _frames_rx, _broker) = spawn_broker(|_| Vec::new()).await;

        let config = TransportConfig {
            endpoints: vec![format!("ws://{}/stomp", addr)],
            heartbeat: (0, 0),
            ..Default::default()
        };
        let (conn, _inbound_rx) = BrokerConnection::new("parent", config);
        conn.connect().await.unwrap();
        let transport = broker_transport(conn.clone(), Lifecycle::new());

        let err = transport
            .request(
                &Operation::new(OperationKind::JobReadAll),
                Some(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::RemoteUnreachable);
        assert!(conn.pending().is_empty());
        conn.disconnect().await;
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_reply_wait() {
        let (addr, _frames_rx, _broker) = spawn_broker(|_| Vec::new()).await;

        let config = TransportConfig {
            endpoints: vec![format!("ws://{}/stomp", addr)],
            heartbeat: (0, 0),
            ..Default::default()
        };
        let (conn, _inbound_rx) = BrokerConnection::new("parent", config);
        conn.connect().await.unwrap();

        let lifecycle = Lifecycle::new();
        let transport = broker_transport(conn.clone(), lifecycle.clone());

        let stopper = lifecycle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            stopper.stop();
        });

        let err = transport
            .request(&Operation::new(OperationKind::JobReadAll), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ShuttingDown));
        conn.disconnect().await;
    }
}
