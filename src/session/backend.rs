//! The language server a fixture is executed against.
//!
//! [`Backend`] is the synchronous-looking facade the driver sees: every call
//! completes before the next directive runs. [`LspBackend`] implements it on
//! top of [`Transport`], tracking diagnostics and work-done progress in the
//! background to answer readiness questions.

use crate::assertion::items;
use crate::assertion::ResponseItem;
use crate::config::ProberConfig;
use crate::error::{BestEffort, ProbeError};
use crate::session::document::{Document, TextChange};
use crate::session::transport::{MessageHandler, Transport, TransportError};
use crate::types::Feature;
use async_trait::async_trait;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::{json, Value};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::watch;
use tower_lsp::lsp_types::{
    InitializeResult, NumberOrString, Position, ProgressParams, ProgressParamsValue,
    PublishDiagnosticsParams, TextDocumentSyncCapability, TextDocumentSyncKind, Url,
    WorkDoneProgress,
};
use tracing::{debug, info, warn};

#[async_trait]
pub trait Backend: Send {
    async fn open(&mut self, document: &Document) -> Result<(), ProbeError>;

    /// Sends `change`, already applied to `document`.
    async fn change(&mut self, document: &Document, change: &TextChange) -> Result<(), ProbeError>;

    async fn close(&mut self, uri: &Url) -> Result<(), ProbeError>;

    /// Blocks until the server has analysed `version` of `uri`.
    async fn wait_for_ready(&mut self, uri: &Url, version: i32, timeout: Duration) -> Result<(), ProbeError>;

    async fn request(
        &mut self,
        feature: Feature,
        uri: &Url,
        position: Position,
    ) -> Result<Vec<ResponseItem>, ProbeError>;

    /// Ends the session. Safe to call more than once.
    async fn shutdown(&mut self) -> Result<(), ProbeError>;
}

#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub request_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub require_diagnostics: bool,
}

impl SessionOptions {
    pub fn from_config(config: &ProberConfig) -> Self {
        Self {
            request_timeout: config.timeouts.request(),
            shutdown_timeout: config.timeouts.shutdown(),
            require_diagnostics: config.readiness.require_diagnostics,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DiagnosticsStamp {
    version: Option<i32>,
    /// Value of [`ServerActivity::seq`] when these diagnostics arrived.
    seq: u64,
}

/// What the server has told us so far.
#[derive(Debug, Clone, Default)]
struct ServerActivity {
    diagnostics: FxHashMap<Url, DiagnosticsStamp>,
    active_progress: FxHashSet<String>,
    seq: u64,
    closed: bool,
}

impl ServerActivity {
    fn is_ready(&self, uri: &Url, version: i32, synced_at: u64, require_diagnostics: bool) -> bool {
        if !self.active_progress.is_empty() {
            return false;
        }
        if !require_diagnostics {
            return true;
        }
        match self.diagnostics.get(uri) {
            Some(DiagnosticsStamp { version: Some(v), .. }) => *v >= version,
            Some(DiagnosticsStamp { version: None, seq }) => *seq > synced_at,
            None => false,
        }
    }
}

struct ActivityTracker {
    state: watch::Sender<ServerActivity>,
}

impl MessageHandler for ActivityTracker {
    fn on_notification(&self, method: &str, params: Value) {
        match method {
            "textDocument/publishDiagnostics" => {
                let params: PublishDiagnosticsParams = match serde_json::from_value(params) {
                    Ok(params) => params,
                    Err(e) => {
                        warn!("Malformed publishDiagnostics: {}", e);
                        return;
                    }
                };
                debug!(
                    uri = %params.uri,
                    version = ?params.version,
                    count = params.diagnostics.len(),
                    "<- diagnostics"
                );
                self.state.send_modify(|state| {
                    state.seq += 1;
                    let stamp = DiagnosticsStamp {
                        version: params.version,
                        seq: state.seq,
                    };
                    state.diagnostics.insert(params.uri, stamp);
                });
            }
            "$/progress" => {
                let Ok(params) = serde_json::from_value::<ProgressParams>(params) else {
                    return;
                };
                let token = match params.token {
                    NumberOrString::Number(n) => n.to_string(),
                    NumberOrString::String(s) => s,
                };
                #[allow(irrefutable_let_patterns)]
                let ProgressParamsValue::WorkDone(progress) = params.value else {
                    return;
                };
                self.state.send_modify(|state| match progress {
                    WorkDoneProgress::Begin(begin) => {
                        debug!(token = %token, title = %begin.title, "<- progress begin");
                        state.active_progress.insert(token);
                    }
                    WorkDoneProgress::End(_) => {
                        debug!(token = %token, "<- progress end");
                        state.active_progress.remove(&token);
                    }
                    WorkDoneProgress::Report(_) => {}
                });
            }
            "window/logMessage" | "window/showMessage" => {
                let message = params.get("message").and_then(Value::as_str).unwrap_or("");
                debug!(method, "server: {}", message);
            }
            _ => debug!(method, "<- notification (ignored)"),
        }
    }

    fn on_request(&self, method: &str, params: &Value) -> Value {
        match method {
            "workspace/configuration" => {
                let count = params
                    .get("items")
                    .and_then(Value::as_array)
                    .map_or(0, Vec::len);
                Value::Array(vec![Value::Null; count])
            }
            _ => Value::Null,
        }
    }

    fn on_close(&self) {
        self.state.send_modify(|state| state.closed = true);
    }
}

pub struct LspBackend {
    transport: Transport,
    activity: watch::Receiver<ServerActivity>,
    child: Option<Child>,
    sync_kind: TextDocumentSyncKind,
    /// Activity sequence number at the last document sync.
    synced_at: u64,
    options: SessionOptions,
    shut_down: bool,
}

impl LspBackend {
    /// Starts the configured server in `root` and initializes it.
    pub async fn launch(config: &ProberConfig, root: &Path) -> Result<Self, ProbeError> {
        let command = &config.backend.command;
        info!(command = %command, root = %root.display(), "Launching backend");

        let mut child = Command::new(command)
            .args(&config.backend.args)
            .current_dir(root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ProbeError::backend(format!("cannot start `{}`: {}", command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProbeError::backend("backend stdin was not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProbeError::backend("backend stdout was not captured"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_stderr(stderr));
        }

        let mut backend = Self::connect(stdout, stdin, SessionOptions::from_config(config));
        backend.child = Some(child);
        backend
            .initialize(root, config.backend.initialization_options.clone())
            .await?;
        Ok(backend)
    }

    /// Wraps an already connected stream pair. The caller initializes.
    pub fn connect<R, W>(reader: R, writer: W, options: SessionOptions) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (state, activity) = watch::channel(ServerActivity::default());
        let transport = Transport::start(reader, writer, Arc::new(ActivityTracker { state }));
        Self {
            transport,
            activity,
            child: None,
            sync_kind: TextDocumentSyncKind::FULL,
            synced_at: 0,
            options,
            shut_down: false,
        }
    }

    pub async fn initialize(&mut self, root: &Path, initialization_options: Option<Value>) -> Result<(), ProbeError> {
        let root_uri = Url::from_directory_path(root)
            .map_err(|_| ProbeError::backend(format!("root {} is not absolute", root.display())))?;
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "root".to_string());

        let params = json!({
            "processId": std::process::id(),
            "clientInfo": { "name": env!("CARGO_PKG_NAME"), "version": env!("CARGO_PKG_VERSION") },
            "rootUri": root_uri,
            "rootPath": root.display().to_string(),
            "workspaceFolders": [{ "uri": root_uri, "name": name }],
            "initializationOptions": initialization_options,
            "capabilities": {
                "textDocument": {
                    "synchronization": { "didSave": false, "dynamicRegistration": false },
                    "completion": {
                        "completionItem": {
                            "snippetSupport": true,
                            "documentationFormat": ["markdown", "plaintext"]
                        }
                    },
                    "definition": { "linkSupport": true },
                    "signatureHelp": {
                        "signatureInformation": {
                            "documentationFormat": ["markdown", "plaintext"],
                            "parameterInformation": { "labelOffsetSupport": true },
                            "activeParameterSupport": true
                        }
                    },
                    "publishDiagnostics": { "versionSupport": true }
                },
                "window": { "workDoneProgress": true },
                "workspace": { "configuration": true, "workspaceFolders": true }
            }
        });

        let result = self
            .transport
            .request("initialize", Some(params), self.options.request_timeout)
            .await
            .map_err(ProbeError::backend)?;
        let result: InitializeResult = serde_json::from_value(result)
            .map_err(|e| ProbeError::backend(format!("malformed initialize result: {}", e)))?;

        self.sync_kind = match result.capabilities.text_document_sync {
            Some(TextDocumentSyncCapability::Kind(kind)) => kind,
            Some(TextDocumentSyncCapability::Options(options)) => {
                options.change.unwrap_or(TextDocumentSyncKind::FULL)
            }
            None => TextDocumentSyncKind::FULL,
        };
        debug!(
            server = ?result.server_info.map(|info| info.name),
            sync = ?self.sync_kind,
            "Backend initialized"
        );

        self.transport
            .notify("initialized", Some(json!({})))
            .map_err(ProbeError::backend)
    }

    async fn wait_closed(&self, timeout: Duration) -> bool {
        let mut activity = self.activity.clone();
        let closed = async move {
            loop {
                if activity.borrow_and_update().closed {
                    return;
                }
                if activity.changed().await.is_err() {
                    return;
                }
            }
        };
        tokio::time::timeout(timeout, closed).await.is_ok()
    }

    fn mark_synced(&mut self) {
        self.synced_at = self.activity.borrow().seq;
    }
}

#[async_trait]
impl Backend for LspBackend {
    async fn open(&mut self, document: &Document) -> Result<(), ProbeError> {
        self.mark_synced();
        self.transport
            .notify(
                "textDocument/didOpen",
                Some(json!({
                    "textDocument": {
                        "uri": document.uri,
                        "languageId": document.language_id,
                        "version": document.version(),
                        "text": document.text()
                    }
                })),
            )
            .map_err(ProbeError::backend)
    }

    async fn change(&mut self, document: &Document, change: &TextChange) -> Result<(), ProbeError> {
        let content_change = if self.sync_kind == TextDocumentSyncKind::INCREMENTAL {
            json!({ "range": change.range, "text": change.text })
        } else {
            json!({ "text": document.text() })
        };
        self.mark_synced();
        self.transport
            .notify(
                "textDocument/didChange",
                Some(json!({
                    "textDocument": { "uri": document.uri, "version": document.version() },
                    "contentChanges": [content_change]
                })),
            )
            .map_err(ProbeError::backend)
    }

    async fn close(&mut self, uri: &Url) -> Result<(), ProbeError> {
        self.transport
            .notify("textDocument/didClose", Some(json!({ "textDocument": { "uri": uri } })))
            .map_err(ProbeError::backend)
    }

    async fn wait_for_ready(&mut self, uri: &Url, version: i32, timeout: Duration) -> Result<(), ProbeError> {
        let synced_at = self.synced_at;
        let require_diagnostics = self.options.require_diagnostics;
        let mut activity = self.activity.clone();

        let ready = async move {
            loop {
                {
                    let state = activity.borrow_and_update();
                    if state.is_ready(uri, version, synced_at, require_diagnostics) {
                        return Ok(());
                    }
                    if state.closed {
                        return Err(ProbeError::backend("connection closed while waiting for readiness"));
                    }
                }
                if activity.changed().await.is_err() {
                    return Err(ProbeError::backend("connection closed while waiting for readiness"));
                }
            }
        };

        match tokio::time::timeout(timeout, ready).await {
            Ok(result) => result,
            Err(_) => {
                let state = self.activity.borrow();
                warn!(
                    uri = %uri,
                    version,
                    active_progress = state.active_progress.len(),
                    "Backend not ready after {:?}",
                    timeout
                );
                Err(ProbeError::BackendNotReady { timeout })
            }
        }
    }

    async fn request(
        &mut self,
        feature: Feature,
        uri: &Url,
        position: Position,
    ) -> Result<Vec<ResponseItem>, ProbeError> {
        let params = json!({
            "textDocument": { "uri": uri },
            "position": position
        });
        let result = self
            .transport
            .request(feature.method(), Some(params), self.options.request_timeout)
            .await
            .map_err(ProbeError::backend)?;

        let normalized = match feature {
            Feature::Completion => items::from_completion(result),
            Feature::Navigation => items::from_definition(result),
            Feature::ParamInfo => items::from_signature_help(result),
        };
        let items = normalized
            .map_err(|e| ProbeError::backend(format!("malformed {} response: {}", feature, e)))?;
        debug!(feature = %feature, count = items.len(), "Received items");
        Ok(items)
    }

    async fn shutdown(&mut self) -> Result<(), ProbeError> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        let timeout = self.options.shutdown_timeout;

        let result = match self.transport.request("shutdown", None, timeout).await {
            Ok(_) => self.transport.notify("exit", None),
            Err(TransportError::Closed) => Ok(()),
            Err(e) => Err(e),
        };
        // The server closes its output once it has processed `exit`.
        if result.is_ok() && !self.wait_closed(timeout).await {
            debug!("Backend kept its connection open after exit");
        }

        if let Some(mut child) = self.child.take() {
            match tokio::time::timeout(timeout, child.wait()).await {
                Ok(Ok(status)) => debug!(%status, "Backend exited"),
                Ok(Err(e)) => warn!("Failed to wait for backend: {}", e),
                Err(_) => {
                    warn!("Backend did not exit within {:?}, killing it", timeout);
                    child.kill().await.best_effort("kill backend");
                }
            }
        }

        result.map_err(ProbeError::backend)
    }
}

async fn forward_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "ide_prober::backend", "{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri() -> Url {
        Url::parse("file:///w/a.cc").unwrap()
    }

    fn with_diagnostics(version: Option<i32>, seq: u64) -> ServerActivity {
        let mut state = ServerActivity::default();
        state.seq = seq;
        state.diagnostics.insert(uri(), DiagnosticsStamp { version, seq });
        state
    }

    #[test]
    fn test_versioned_diagnostics_readiness() {
        let state = with_diagnostics(Some(2), 1);
        assert!(state.is_ready(&uri(), 2, 5, true));
        assert!(state.is_ready(&uri(), 1, 5, true));
        assert!(!state.is_ready(&uri(), 3, 0, true));
    }

    #[test]
    fn test_unversioned_diagnostics_must_follow_sync() {
        let state = with_diagnostics(None, 4);
        assert!(state.is_ready(&uri(), 7, 3, true));
        assert!(!state.is_ready(&uri(), 7, 4, true));
    }

    #[test]
    fn test_open_progress_blocks_readiness() {
        let mut state = with_diagnostics(Some(1), 1);
        state.active_progress.insert("backgroundIndexProgress".to_string());
        assert!(!state.is_ready(&uri(), 1, 0, true));
        assert!(!state.is_ready(&uri(), 1, 0, false));
        state.active_progress.clear();
        assert!(ServerActivity::default().is_ready(&uri(), 1, 0, false));
        assert!(!ServerActivity::default().is_ready(&uri(), 1, 0, true));
    }

    #[test]
    fn test_tracker_follows_progress_and_diagnostics() {
        let (state, activity) = watch::channel(ServerActivity::default());
        let tracker = ActivityTracker { state };

        tracker.on_notification(
            "$/progress",
            json!({ "token": 7, "value": { "kind": "begin", "title": "indexing" } }),
        );
        assert!(activity.borrow().active_progress.contains("7"));
        tracker.on_notification("$/progress", json!({ "token": 7, "value": { "kind": "end" } }));
        assert!(activity.borrow().active_progress.is_empty());

        tracker.on_notification(
            "textDocument/publishDiagnostics",
            json!({ "uri": "file:///w/a.cc", "version": 3, "diagnostics": [] }),
        );
        let stamp = activity.borrow().diagnostics[&uri()];
        assert_eq!(stamp, DiagnosticsStamp { version: Some(3), seq: 1 });

        tracker.on_close();
        assert!(activity.borrow().closed);
    }

    #[test]
    fn test_configuration_requests_get_one_null_per_item() {
        let (state, _activity) = watch::channel(ServerActivity::default());
        let tracker = ActivityTracker { state };
        let answer = tracker.on_request(
            "workspace/configuration",
            &json!({ "items": [{ "section": "a" }, { "section": "b" }] }),
        );
        assert_eq!(answer, json!([null, null]));
        assert_eq!(tracker.on_request("window/workDoneProgress/create", &json!({})), Value::Null);
    }
}
