//! In-process fake language server for driving the full prober stack.
//!
//! The server speaks real JSON-RPC framing over a `tokio::io::duplex` pipe,
//! keeps a copy of the open document and answers feature requests through a
//! test-supplied responder.

#![allow(dead_code)]

use async_trait::async_trait;
use ide_prober::config::ProberConfig;
use ide_prober::error::ProbeError;
use ide_prober::runner::Launcher;
use ide_prober::session::transport::{read_message, write_message};
use ide_prober::session::{Backend, LspBackend, SessionOptions};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{split, BufReader, DuplexStream, WriteHalf};

/// A feature request as seen by the fake server.
pub struct Request<'a> {
    pub method: &'a str,
    pub uri: &'a str,
    pub text: &'a str,
    pub line: u32,
    pub character: u32,
}

impl Request<'_> {
    /// Text of the line the request points at.
    pub fn line_text(&self) -> &str {
        self.text.lines().nth(self.line as usize).unwrap_or("")
    }
}

pub type Responder = Arc<dyn Fn(&Request<'_>) -> Value + Send + Sync>;

#[derive(Clone)]
pub struct FakeServer {
    /// `textDocumentSync` advertised on initialize: 1 = full, 2 = incremental.
    pub sync_kind: u8,
    /// Publish (versioned) diagnostics after every open and change.
    pub publish_diagnostics: bool,
    /// Begin a work-done progress on open and never end it.
    pub stuck_indexing: bool,
    /// Drop the connection when this method arrives.
    pub hang_up_on: Option<&'static str>,
    /// Never answer requests for this method.
    pub ignore: Option<&'static str>,
    pub responder: Responder,
    log: Arc<Mutex<Vec<Value>>>,
}

impl FakeServer {
    pub fn new(responder: impl Fn(&Request<'_>) -> Value + Send + Sync + 'static) -> Self {
        Self {
            sync_kind: 1,
            publish_diagnostics: true,
            stuck_indexing: false,
            hang_up_on: None,
            ignore: None,
            responder: Arc::new(responder),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every message the server received, in order.
    pub fn received(&self) -> Vec<Value> {
        self.log.lock().unwrap().clone()
    }

    pub fn received_methods(&self) -> Vec<String> {
        self.received()
            .iter()
            .filter_map(|m| m.get("method")?.as_str().map(str::to_string))
            .collect()
    }

    /// Starts serving and returns the client end of the pipe.
    pub fn spawn(&self) -> DuplexStream {
        let (client, server) = tokio::io::duplex(1 << 20);
        tokio::spawn(self.clone().serve(server));
        client
    }

    /// Backend connected to a fresh server task, initialized against `root`.
    pub async fn backend(&self, root: &Path, options: SessionOptions) -> Result<LspBackend, ProbeError> {
        let (reader, writer) = split(self.spawn());
        let mut backend = LspBackend::connect(reader, writer, options);
        backend.initialize(root, None).await?;
        Ok(backend)
    }

    async fn serve(self, stream: DuplexStream) {
        let (reader, mut writer) = split(stream);
        let mut reader = BufReader::new(reader);
        let mut document = String::new();

        while let Ok(Some(message)) = read_message(&mut reader).await {
            self.log.lock().unwrap().push(message.clone());
            let Some(method) = message.get("method").and_then(Value::as_str) else {
                continue;
            };
            if self.hang_up_on == Some(method) {
                return;
            }
            if self.ignore == Some(method) {
                continue;
            }
            let id = message.get("id").cloned();
            let params = message.get("params").cloned().unwrap_or(Value::Null);

            match method {
                "initialize" => {
                    let result = json!({
                        "capabilities": {
                            "textDocumentSync": self.sync_kind,
                            "completionProvider": {},
                            "definitionProvider": true,
                            "signatureHelpProvider": { "triggerCharacters": ["(", ","] }
                        },
                        "serverInfo": { "name": "fake-server" }
                    });
                    respond(&mut writer, id, result).await;
                    // Exercise server-to-client requests the way real servers do.
                    let request = json!({
                        "jsonrpc": "2.0",
                        "id": "cfg-1",
                        "method": "workspace/configuration",
                        "params": { "items": [{ "section": "fake" }] }
                    });
                    let _ = write_message(&mut writer, &request).await;
                }
                "textDocument/didOpen" => {
                    document = params["textDocument"]["text"].as_str().unwrap_or("").to_string();
                    let version = params["textDocument"]["version"].clone();
                    let uri = params["textDocument"]["uri"].clone();
                    if self.stuck_indexing {
                        progress(&mut writer, "begin").await;
                    } else {
                        progress(&mut writer, "begin").await;
                        self.diagnostics(&mut writer, &uri, version).await;
                        progress(&mut writer, "end").await;
                    }
                }
                "textDocument/didChange" => {
                    for change in params["contentChanges"].as_array().into_iter().flatten() {
                        apply_change(&mut document, change);
                    }
                    let version = params["textDocument"]["version"].clone();
                    let uri = params["textDocument"]["uri"].clone();
                    self.diagnostics(&mut writer, &uri, version).await;
                }
                "textDocument/completion" | "textDocument/definition" | "textDocument/signatureHelp" => {
                    let request = Request {
                        method,
                        uri: params["textDocument"]["uri"].as_str().unwrap_or(""),
                        text: &document,
                        line: params["position"]["line"].as_u64().unwrap_or(0) as u32,
                        character: params["position"]["character"].as_u64().unwrap_or(0) as u32,
                    };
                    let result = (self.responder)(&request);
                    respond(&mut writer, id, result).await;
                }
                "shutdown" => respond(&mut writer, id, Value::Null).await,
                "exit" => return,
                _ => {
                    if id.is_some() {
                        respond(&mut writer, id, Value::Null).await;
                    }
                }
            }
        }
    }

    async fn diagnostics(&self, writer: &mut WriteHalf<DuplexStream>, uri: &Value, version: Value) {
        if !self.publish_diagnostics {
            return;
        }
        let notification = json!({
            "jsonrpc": "2.0",
            "method": "textDocument/publishDiagnostics",
            "params": { "uri": uri, "version": version, "diagnostics": [] }
        });
        let _ = write_message(writer, &notification).await;
    }
}

async fn respond(writer: &mut WriteHalf<DuplexStream>, id: Option<Value>, result: Value) {
    let response = json!({ "jsonrpc": "2.0", "id": id, "result": result });
    let _ = write_message(writer, &response).await;
}

async fn progress(writer: &mut WriteHalf<DuplexStream>, kind: &str) {
    let value = if kind == "begin" {
        json!({ "kind": "begin", "title": "indexing" })
    } else {
        json!({ "kind": kind })
    };
    let notification = json!({
        "jsonrpc": "2.0",
        "method": "$/progress",
        "params": { "token": "backgroundIndexProgress", "value": value }
    });
    let _ = write_message(writer, &notification).await;
}

/// Applies a full or ranged change. Fixtures are ASCII, so columns are
/// byte offsets within a line.
fn apply_change(document: &mut String, change: &Value) {
    let text = change["text"].as_str().unwrap_or("");
    let Some(range) = change.get("range") else {
        *document = text.to_string();
        return;
    };
    let offset = |position: &Value| {
        let line = position["line"].as_u64().unwrap_or(0) as usize;
        let character = position["character"].as_u64().unwrap_or(0) as usize;
        let line_start: usize = document.split_inclusive('\n').take(line).map(str::len).sum();
        line_start + character
    };
    let start = offset(&range["start"]);
    let end = offset(&range["end"]);
    document.replace_range(start..end, text);
}

/// Launches fake servers for the runner and counts launches.
pub struct FakeLauncher {
    pub server: FakeServer,
    pub options: SessionOptions,
    pub launches: AtomicUsize,
}

impl FakeLauncher {
    pub fn new(server: FakeServer, config: &ProberConfig) -> Self {
        Self {
            server,
            options: SessionOptions::from_config(config),
            launches: AtomicUsize::new(0),
        }
    }

    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(&self, root: &Path) -> Result<Box<dyn Backend>, ProbeError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let backend = self.server.backend(root, self.options).await?;
        Ok(Box::new(backend))
    }
}

/// Config with short timeouts suitable for tests.
pub fn test_config() -> ProberConfig {
    let mut config = ProberConfig::default();
    config.timeouts.ready_secs = 2;
    config.timeouts.request_secs = 2;
    config.timeouts.shutdown_secs = 1;
    config.timeouts.fixture_secs = 30;
    config.run.jobs = 2;
    config
}

pub fn fixture_path(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name)
}

/// Copies a checked-in fixture into `dir`, optionally rewriting its text.
pub fn write_fixture(dir: &Path, name: &str, edit: impl FnOnce(String) -> String) -> PathBuf {
    let text = std::fs::read_to_string(fixture_path(name)).unwrap();
    let path = dir.join(name);
    std::fs::write(&path, edit(text)).unwrap();
    path
}

/// Answers like clangd would for `tests/fixtures/general.cc`.
pub fn clangd_like(request: &Request<'_>) -> Value {
    let line = request.line_text().trim();
    match request.method {
        "textDocument/completion" => match line {
            "f" => json!([{ "label": "foo", "kind": 6 }, { "label": "for", "kind": 14 }]),
            "foo.sf" => json!({
                "isIncomplete": false,
                "items": [
                    { "label": "some_field()", "insertText": "some_field()", "kind": 2 },
                    { "label": "set_some_field(int value)", "insertText": "set_some_field(${1:int value})", "kind": 2 }
                ]
            }),
            "v.push" => json!([{
                "label": "push_back(const int &x)",
                "textEdit": {
                    "range": { "start": { "line": request.line, "character": 2 }, "end": { "line": request.line, "character": 6 } },
                    "newText": "push_back(${1:const int &x})"
                }
            }]),
            _ => json!([]),
        },
        "textDocument/definition" => {
            if line.starts_with("std::vector<int> ints;") {
                json!([{
                    "targetUri": "file:///usr/include/c++/v1/vector",
                    "targetRange": { "start": { "line": 400, "character": 0 }, "end": { "line": 900, "character": 1 } },
                    "targetSelectionRange": { "start": { "line": 401, "character": 28 }, "end": { "line": 401, "character": 34 } }
                }])
            } else if line.starts_with("ints.push_back") {
                let decl = request
                    .text
                    .lines()
                    .position(|l| l.trim() == "std::vector<int> ints;")
                    .unwrap_or(0);
                json!({
                    "uri": request.uri,
                    "range": { "start": { "line": decl, "character": 19 }, "end": { "line": decl, "character": 23 } }
                })
            } else if line.starts_with("msg.set_some_field") {
                json!([{
                    "uri": "file:///out/gen/foo.pb.h",
                    "range": { "start": { "line": 120, "character": 7 }, "end": { "line": 120, "character": 21 } }
                }])
            } else {
                Value::Null
            }
        }
        "textDocument/signatureHelp" => {
            if line.starts_with("v.push_back") {
                json!({
                    "signatures": [{ "label": "push_back(const int &x) -> void", "parameters": [{ "label": [10, 22] }] }],
                    "activeSignature": 0,
                    "activeParameter": 0
                })
            } else if line.starts_with("Foo(0, 0.0)") {
                json!({
                    "signatures": [
                        {
                            "label": "Foo(int x, double y) -> void",
                            "parameters": [{ "label": [4, 9] }, { "label": [11, 19] }]
                        },
                        {
                            "label": "Foo(float x, float y) -> float",
                            "parameters": [{ "label": "float x" }, { "label": "float y" }]
                        }
                    ],
                    "activeSignature": 0,
                    "activeParameter": 1
                })
            } else {
                Value::Null
            }
        }
        _ => Value::Null,
    }
}
