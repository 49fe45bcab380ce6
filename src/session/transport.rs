//! JSON-RPC over a byte stream with `Content-Length` framing.
//!
//! A reader task routes responses to waiting requests, answers
//! server-to-client requests through the [`MessageHandler`] and hands
//! notifications to it. A writer task owns the output stream so callers never
//! contend on it.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("request '{method}' timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("server error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("malformed frame: {0}")]
    Frame(String),

    #[error("malformed message from server: {0}")]
    Malformed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: i64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

/// Receives everything the server sends that is not a response.
pub trait MessageHandler: Send + Sync + 'static {
    fn on_notification(&self, method: &str, params: Value);

    /// Result to send back for a server-to-client request.
    fn on_request(&self, method: &str, params: &Value) -> Value;

    /// Called once when the input stream ends.
    fn on_close(&self);
}

type PendingMap = DashMap<i64, oneshot::Sender<Result<Value, TransportError>>>;

/// Reads one framed message. `Ok(None)` means the stream ended cleanly
/// between messages.
pub async fn read_message<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Value>, TransportError> {
    let mut content_length: Option<usize> = None;
    let mut saw_header = false;

    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            if saw_header {
                return Err(TransportError::Frame("stream ended inside a header".into()));
            }
            return Ok(None);
        }
        let line = line.trim();
        if line.is_empty() {
            if saw_header {
                break;
            }
            continue;
        }
        saw_header = true;
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("Content-Length") {
                let len = value.trim().parse().map_err(|_| {
                    TransportError::Frame(format!("invalid Content-Length `{}`", value.trim()))
                })?;
                content_length = Some(len);
            }
        }
    }

    let Some(len) = content_length else {
        return Err(TransportError::Frame("missing Content-Length header".into()));
    };
    let mut content = vec![0u8; len];
    reader.read_exact(&mut content).await?;
    Ok(Some(serde_json::from_slice(&content)?))
}

pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Value,
) -> Result<(), TransportError> {
    let content = serde_json::to_string(message)?;
    let header = format!("Content-Length: {}\r\n\r\n", content.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(content.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

pub struct Transport {
    outgoing: mpsc::UnboundedSender<Value>,
    pending: Arc<PendingMap>,
    closed: Arc<AtomicBool>,
    next_id: AtomicI64,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl Transport {
    pub fn start<R, W, H>(reader: R, writer: W, handler: Arc<H>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
        H: MessageHandler,
    {
        let (outgoing, receiver) = mpsc::unbounded_channel();
        let pending: Arc<PendingMap> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        let reader_task = tokio::spawn(read_loop(
            BufReader::new(reader),
            handler,
            Arc::clone(&pending),
            outgoing.clone(),
            Arc::clone(&closed),
        ));
        let writer_task = tokio::spawn(write_loop(writer, receiver));

        Self {
            outgoing,
            pending,
            closed,
            next_id: AtomicI64::new(1),
            reader_task,
            writer_task,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = oneshot::channel();
        self.pending.insert(id, sender);
        // The reader drains `pending` after setting `closed`, so this check
        // cannot miss a close that happened before the insert.
        if self.is_closed() {
            self.pending.remove(&id);
            return Err(TransportError::Closed);
        }

        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        };
        debug!(method, id, "-> request");
        if let Err(e) = self.send(serde_json::to_value(&request)?) {
            self.pending.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::Closed),
            Err(_) => {
                self.pending.remove(&id);
                warn!(method, id, "Request timed out after {:?}", timeout);
                Err(TransportError::Timeout {
                    method: method.to_string(),
                    timeout,
                })
            }
        }
    }

    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        let notification = JsonRpcNotification {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        };
        debug!(method, "-> notification");
        self.send(serde_json::to_value(&notification)?)
    }

    fn send(&self, message: Value) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.outgoing.send(message).map_err(|_| TransportError::Closed)
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

async fn read_loop<R, H>(
    mut reader: BufReader<R>,
    handler: Arc<H>,
    pending: Arc<PendingMap>,
    outgoing: mpsc::UnboundedSender<Value>,
    closed: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin,
    H: MessageHandler,
{
    loop {
        let message = match read_message(&mut reader).await {
            Ok(Some(message)) => message,
            Ok(None) => break,
            // The body was consumed in full, so the stream is still in sync.
            // It cannot be attributed to a request, so every outstanding
            // request fails with the parse error instead of timing out.
            Err(TransportError::Json(e)) => {
                warn!("Discarding malformed message: {}", e);
                fail_pending(&pending, &e.to_string());
                continue;
            }
            Err(e) => {
                warn!("Transport read failed: {}", e);
                break;
            }
        };
        dispatch(message, handler.as_ref(), &pending, &outgoing);
    }

    closed.store(true, Ordering::SeqCst);
    // Dropping the senders wakes every waiter with `Closed`.
    pending.clear();
    handler.on_close();
    debug!("Transport reader finished");
}

fn fail_pending(pending: &PendingMap, reason: &str) {
    let ids: Vec<i64> = pending.iter().map(|entry| *entry.key()).collect();
    for id in ids {
        if let Some((_, sender)) = pending.remove(&id) {
            let _ = sender.send(Err(TransportError::Malformed(reason.to_string())));
        }
    }
}

fn dispatch<H: MessageHandler>(
    message: Value,
    handler: &H,
    pending: &PendingMap,
    outgoing: &mpsc::UnboundedSender<Value>,
) {
    let method = message.get("method").and_then(Value::as_str).map(str::to_string);
    let id = message.get("id").cloned().filter(|id| !id.is_null());

    match (method, id) {
        (Some(method), Some(id)) => {
            let params = message.get("params").cloned().unwrap_or(Value::Null);
            debug!(method = %method, "<- server request");
            let result = handler.on_request(&method, &params);
            let response = json!({ "jsonrpc": "2.0", "id": id, "result": result });
            if outgoing.send(response).is_err() {
                warn!(method = %method, "Cannot answer server request, writer is gone");
            }
        }
        (Some(method), None) => {
            let params = message.get("params").cloned().unwrap_or(Value::Null);
            handler.on_notification(&method, params);
        }
        (None, Some(id)) => {
            let Some(id) = id.as_i64() else {
                warn!("Ignoring response with foreign id {}", id);
                return;
            };
            let Some((_, sender)) = pending.remove(&id) else {
                debug!(id, "Ignoring response to an abandoned request");
                return;
            };
            let result = match message.get("error") {
                Some(error) => match serde_json::from_value::<JsonRpcError>(error.clone()) {
                    Ok(error) => Err(TransportError::Rpc {
                        code: error.code,
                        message: error.message,
                    }),
                    Err(e) => Err(TransportError::Json(e)),
                },
                None => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
            };
            debug!(id, ok = result.is_ok(), "<- response");
            let _ = sender.send(result);
        }
        (None, None) => warn!("Ignoring message without method or id"),
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(mut writer: W, mut receiver: mpsc::UnboundedReceiver<Value>) {
    while let Some(message) = receiver.recv().await {
        if let Err(e) = write_message(&mut writer, &message).await {
            warn!("Transport write failed: {}", e);
            break;
        }
    }
}
