//! Test doubles shared by the unit tests of this crate.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response as WsResponse};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use garden_core::{Operation, Response};

use crate::error::{SyncError, SyncResult};
use crate::frame::{Command, Frame};
use crate::registry::GardenTransport;
use crate::transport::{Headers, MessageSink, STOMP_SUBPROTOCOL};

// =============================================================================
// Loopback Broker
// =============================================================================

/// STOMP broker on 127.0.0.1 serving one client session at a time.
///
/// Answers CONNECT itself, hands every other frame to `respond` and writes
/// back whatever it returns. Every received frame is forwarded on the
/// returned channel. A session that drops its socket is followed by the next
/// one; the broker stops after DISCONNECT.
pub async fn spawn_broker<F>(
    respond: F,
) -> (SocketAddr, mpsc::UnboundedReceiver<Frame>, JoinHandle<()>)
where
    F: Fn(&Frame) -> Vec<Frame> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let callback = |_req: &Request, mut resp: WsResponse| -> Result<WsResponse, ErrorResponse> {
                resp.headers_mut().insert(
                    "Sec-WebSocket-Protocol",
                    HeaderValue::from_static(STOMP_SUBPROTOCOL),
                );
                Ok(resp)
            };
            let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                continue;
            };
            let (mut write, mut read) = ws.split();

            while let Some(Ok(msg)) = read.next().await {
                let WsMessage::Text(text) = msg else { continue };
                let Ok(Some(frame)) = Frame::decode(&text) else { continue };

                let replies = match frame.command {
                    Command::Connect => vec![Frame::new(Command::Connected).header("version", "1.2")],
                    _ => respond(&frame),
                };
                for reply in replies {
                    if write.send(WsMessage::text(reply.encode())).await.is_err() {
                        break;
                    }
                }

                let done = frame.command == Command::Disconnect;
                let _ = frames_tx.send(frame);
                if done {
                    return;
                }
            }
        }
    });

    (addr, frames_rx, task)
}

// =============================================================================
// Recording Sink
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub body: String,
    pub headers: Headers,
    pub destination: String,
}

/// `MessageSink` that keeps everything it is asked to send.
pub struct RecordingSink {
    pub connected: bool,
    pub default_destination: Option<String>,
    pub sent: Mutex<Vec<SentMessage>>,
}

impl RecordingSink {
    pub fn new(default_destination: Option<&str>) -> Arc<Self> {
        Arc::new(RecordingSink {
            connected: true,
            default_destination: default_destination.map(String::from),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn disconnected() -> Arc<Self> {
        Arc::new(RecordingSink {
            connected: false,
            default_destination: Some("default.dest".into()),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl MessageSink for RecordingSink {
    fn is_connected(&self) -> bool {
        self.connected
    }

    fn default_destination(&self) -> Option<String> {
        self.default_destination.clone()
    }

    async fn send(&self, body: String, headers: Headers, destination: &str) {
        if !self.connected {
            return;
        }
        self.sent.lock().unwrap().push(SentMessage {
            body,
            headers,
            destination: destination.to_string(),
        });
    }
}

// =============================================================================
// Stub Garden Transport
// =============================================================================

/// `GardenTransport` that records operations and answers with a canned reply.
pub struct StubTransport {
    pub connected: bool,
    pub reply: Mutex<SyncResult<Response>>,
    pub delay: Option<Duration>,
    pub requests: Mutex<Vec<(Operation, Option<Duration>)>>,
    pub published: Mutex<Vec<Operation>>,
}

impl StubTransport {
    pub fn replying(reply: SyncResult<Response>) -> Arc<Self> {
        Arc::new(StubTransport {
            connected: true,
            reply: Mutex::new(reply),
            delay: None,
            requests: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
        })
    }

    pub fn disconnected() -> Arc<Self> {
        Arc::new(StubTransport {
            connected: false,
            reply: Mutex::new(Ok(Response::ack())),
            delay: None,
            requests: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
        })
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(StubTransport {
            connected: true,
            reply: Mutex::new(Ok(Response::ack())),
            delay: Some(delay),
            requests: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<(Operation, Option<Duration>)> {
        self.requests.lock().unwrap().clone()
    }

    pub fn published(&self) -> Vec<Operation> {
        self.published.lock().unwrap().clone()
    }
}

fn clone_reply(reply: &SyncResult<Response>) -> SyncResult<Response> {
    match reply {
        Ok(response) => Ok(response.clone()),
        Err(e) => Err(SyncError::Remote(e.to_error_message())),
    }
}

#[async_trait]
impl GardenTransport for StubTransport {
    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn request(&self, operation: &Operation, wait: Option<Duration>) -> SyncResult<Response> {
        self.requests
            .lock()
            .unwrap()
            .push((operation.clone(), wait));

        if let Some(delay) = self.delay {
            match wait {
                Some(limit) if limit < delay => {
                    tokio::time::sleep(limit).await;
                    return Err(SyncError::RemoteUnreachable("no reply".into()));
                }
                _ => tokio::time::sleep(delay).await,
            }
        }

        clone_reply(&self.reply.lock().unwrap())
    }

    async fn publish(&self, operation: &Operation) -> SyncResult<()> {
        self.published.lock().unwrap().push(operation.clone());
        Ok(())
    }
}
