//! # Broker Listener / Reply Dispatcher
//!
//! Turns inbound broker messages into routed operations and sends back the
//! outcome.
//!
//! ```text
//! (headers, body)
//!       │
//!       ├── model_class == Event ──► decode_event ──► EventHandler(s)   (no reply)
//!       │
//!       ▼
//! decode_operation ─► strip wait_timeout ─► Router::route
//!       │ Err                                  │ Ok / Err
//!       └──────────────► Outcome ◄─────────────┘
//!                           │
//!            resolve_destination(reply-to, default)
//!                           │
//!                    MessageSink::send
//! ```
//!
//! Nothing in this pipeline propagates out of [`OperationListener::on_message`].
//! Failures become `error_message` replies and log lines.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use garden_core::{GardenEvent, Outcome, Response, MODEL_CLASS_EVENT};

use crate::codec::{
    build_headers, decode_event, decode_operation, encode_outcome, garden_headers,
    model_class_headers,
};
use crate::error::SyncResult;
use crate::router::Router;
use crate::supervisor::Lifecycle;
use crate::transport::{Headers, InboundMessage, MessageSink, HEADER_MODEL_CLASS, HEADER_REPLY_TO};

/// Consumes events received from other gardens.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: &GardenEvent);
}

/// Where a reply to `request_headers` goes: `reply-to` if present, else the
/// default destination, else nowhere.
pub fn resolve_destination(request_headers: &Headers, default: Option<&str>) -> Option<String> {
    request_headers
        .get(HEADER_REPLY_TO)
        .filter(|dest| !dest.is_empty())
        .cloned()
        .or_else(|| default.filter(|dest| !dest.is_empty()).map(String::from))
}

pub struct OperationListener {
    router: Arc<Router>,
    sink: Arc<dyn MessageSink>,
    garden_headers: Headers,
    event_handlers: Vec<Arc<dyn EventHandler>>,
}

impl OperationListener {
    pub fn new(router: Arc<Router>, sink: Arc<dyn MessageSink>) -> Self {
        let garden_headers = garden_headers(router.garden_name());
        OperationListener {
            router,
            sink,
            garden_headers,
            event_handlers: Vec::new(),
        }
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handlers.push(handler);
        self
    }

    /// Handles one inbound message to completion.
    pub async fn on_message(&self, headers: Headers, body: &str) {
        if headers.get(HEADER_MODEL_CLASS).map(String::as_str) == Some(MODEL_CLASS_EVENT) {
            self.on_event(body).await;
            return;
        }

        let outcome = match self.execute(body).await {
            Ok(response) => Outcome::Success(response),
            Err(e) => {
                warn!(error = %e, kind = %e.kind(), "Operation failed");
                Outcome::Failure(e.to_error_message())
            }
        };

        self.reply(&headers, outcome).await;
    }

    /// Processes messages in arrival order until the channel closes or
    /// `lifecycle` stops.
    pub async fn run(
        self: Arc<Self>,
        mut inbound_rx: mpsc::UnboundedReceiver<InboundMessage>,
        lifecycle: Lifecycle,
    ) {
        loop {
            tokio::select! {
                message = inbound_rx.recv() => match message {
                    Some(message) => self.on_message(message.headers, &message.body).await,
                    None => {
                        debug!("Inbound channel closed, listener stopping");
                        break;
                    }
                },
                _ = lifecycle.stopped() => {
                    debug!("Listener stopping");
                    break;
                }
            }
        }
    }

    async fn execute(&self, body: &str) -> SyncResult<Response> {
        // wait_timeout bounds the sender's own wait, not ours
        let operation = decode_operation(body)?.without_wait_timeout();
        debug!(operation = %operation.operation_type(), "Received operation");
        self.router.route(operation).await
    }

    async fn reply(&self, request_headers: &Headers, outcome: Outcome) {
        if let Outcome::Success(response) = &outcome {
            if response.is_empty() && !request_headers.contains_key(HEADER_REPLY_TO) {
                return;
            }
        }

        if !self.sink.is_connected() {
            debug!("Broker connection is down, reply dropped");
            return;
        }

        let default = self.sink.default_destination();
        let Some(destination) = resolve_destination(request_headers, default.as_deref()) else {
            debug!("No reply destination configured, reply dropped");
            return;
        };

        let body = match encode_outcome(&outcome) {
            Ok(body) => body,
            Err(e) => {
                error!(error = %e, "Unable to encode reply");
                return;
            }
        };

        let headers = build_headers(
            &model_class_headers(outcome.model_class()),
            request_headers,
            &self.garden_headers,
        );

        self.sink.send(body, headers, &destination).await;
    }

    async fn on_event(&self, body: &str) {
        match decode_event(body) {
            Ok(event) => {
                debug!(event = %event, "Received event");
                for handler in &self.event_handlers {
                    handler.handle_event(&event).await;
                }
            }
            Err(e) => {
                let raw = serde_json::from_str::<Value>(body).unwrap_or(Value::Null);
                let field = |pointer: &str| {
                    raw.pointer(pointer)
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string()
                };
                let (name, garden) = (field("/payload/name"), field("/garden"));
                error!(error = %e, "Error parsing {} event from garden {}", name, garden);
            }
        }
    }
}
