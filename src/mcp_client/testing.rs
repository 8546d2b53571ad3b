//! Scripted transports and connectors for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::errors::TransportError;
use super::transport::{Connector, Transport};
use super::types::{ServerDescriptor, TransportKind};

/// Answers a `tools/call`: `(server, tool, arguments) -> result`.
pub(crate) type Responder =
    Arc<dyn Fn(&str, &str, &Value) -> Result<Value, TransportError> + Send + Sync>;

/// A transport that answers the discovery handshake from a fixed inventory
/// and delegates tool calls to a [`Responder`].
pub(crate) struct MockTransport {
    server: String,
    tools: Vec<Value>,
    responder: Responder,
    ping_fails: bool,
    closed: AtomicBool,
    pub(crate) tool_calls: AtomicUsize,
    pub(crate) pings: AtomicUsize,
}

impl MockTransport {
    fn lost(&self, reason: &str) -> TransportError {
        TransportError::ConnectionLost {
            server: self.server.clone(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn server(&self) -> &str {
        &self.server
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stdio
    }

    async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        if self.is_closed() {
            return Err(self.lost("closed"));
        }
        match method {
            "initialize" => Ok(json!({"capabilities": {}, "serverInfo": {"name": self.server}})),
            "tools/list" => Ok(json!({ "tools": self.tools })),
            "ping" => {
                self.pings.fetch_add(1, Ordering::SeqCst);
                if self.ping_fails {
                    Err(TransportError::Timeout {
                        server: self.server.clone(),
                        method: "ping".into(),
                        timeout_ms: timeout.as_millis() as u64,
                    })
                } else {
                    Ok(json!({}))
                }
            }
            "tools/call" => {
                self.tool_calls.fetch_add(1, Ordering::SeqCst);
                let params = params.unwrap_or(Value::Null);
                let tool = params["name"].as_str().unwrap_or_default().to_string();
                let result = (self.responder)(&self.server, &tool, &params["arguments"]);
                if matches!(result, Err(TransportError::ConnectionLost { .. })) {
                    self.closed.store(true, Ordering::SeqCst);
                }
                result
            }
            other => Err(TransportError::RemoteError {
                code: -32601,
                message: format!("unknown method {other}"),
                data: None,
            }),
        }
    }

    async fn notify(&self, _method: &str, _params: Option<Value>) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(self.lost("closed"));
        }
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// How a scripted server behaves on connect.
#[derive(Clone, Default)]
struct Script {
    tools: Vec<String>,
    /// Connect attempts that fail before one succeeds.
    failures: u32,
    /// Connect never completes.
    hangs: bool,
    ping_fails: bool,
}

/// A connector that builds [`MockTransport`]s from per-server scripts.
pub(crate) struct MockConnector {
    scripts: Mutex<HashMap<String, Script>>,
    responder: Mutex<Responder>,
    connects: Mutex<HashMap<String, u32>>,
    transports: Mutex<HashMap<String, Arc<MockTransport>>>,
}

impl MockConnector {
    pub(crate) fn new() -> Self {
        let echo: Responder = Arc::new(|server: &str, tool: &str, args: &Value| {
            Ok(json!({"server": server, "tool": tool, "arguments": args}))
        });
        Self {
            scripts: Mutex::new(HashMap::new()),
            responder: Mutex::new(echo),
            connects: Mutex::new(HashMap::new()),
            transports: Mutex::new(HashMap::new()),
        }
    }

    fn script(&self, server: &str, f: impl FnOnce(&mut Script)) {
        let mut scripts = self.scripts.lock().unwrap();
        f(scripts.entry(server.to_string()).or_default());
    }

    /// The server advertises these tools.
    pub(crate) fn with_tools(self, server: &str, tools: &[&str]) -> Self {
        self.script(server, |s| s.tools = tools.iter().map(|t| t.to_string()).collect());
        self
    }

    /// The first `n` connects to the server fail (`u32::MAX`: always).
    pub(crate) fn failing(self, server: &str, n: u32) -> Self {
        self.script(server, |s| s.failures = n);
        self
    }

    pub(crate) fn hanging(self, server: &str) -> Self {
        self.script(server, |s| s.hangs = true);
        self
    }

    pub(crate) fn with_failing_ping(self, server: &str) -> Self {
        self.script(server, |s| s.ping_fails = true);
        self
    }

    pub(crate) fn with_responder(self, responder: Responder) -> Self {
        *self.responder.lock().unwrap() = responder;
        self
    }

    pub(crate) fn set_failures(&self, server: &str, n: u32) {
        self.script(server, |s| s.failures = n);
    }

    pub(crate) fn connect_count(&self, server: &str) -> u32 {
        self.connects.lock().unwrap().get(server).copied().unwrap_or(0)
    }

    /// The most recent transport handed out for the server.
    pub(crate) fn transport(&self, server: &str) -> Option<Arc<MockTransport>> {
        self.transports.lock().unwrap().get(server).cloned()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        descriptor: &ServerDescriptor,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        let name = descriptor.name.clone();
        let attempt = {
            let mut connects = self.connects.lock().unwrap();
            let count = connects.entry(name.clone()).or_insert(0);
            *count += 1;
            *count
        };
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&name)
            .cloned()
            .unwrap_or_default();

        if script.hangs {
            futures::future::pending::<()>().await;
        }
        if attempt <= script.failures {
            return Err(TransportError::ConnectionLost {
                server: name,
                reason: "connection refused".into(),
            });
        }

        let transport = Arc::new(MockTransport {
            server: name.clone(),
            tools: script
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t,
                        "description": format!("{t} on {name}"),
                        "inputSchema": {"type": "object"}
                    })
                })
                .collect(),
            responder: Arc::clone(&self.responder.lock().unwrap()),
            ping_fails: script.ping_fails,
            closed: AtomicBool::new(false),
            tool_calls: AtomicUsize::new(0),
            pings: AtomicUsize::new(0),
        });
        self.transports
            .lock()
            .unwrap()
            .insert(name, Arc::clone(&transport));
        Ok(transport)
    }
}

/// A stdio descriptor with a short call timeout.
pub(crate) fn descriptor(name: &str) -> ServerDescriptor {
    let mut d = ServerDescriptor::stdio(name, "mock-server", &[]);
    d.timeout = Duration::from_secs(5);
    d
}
