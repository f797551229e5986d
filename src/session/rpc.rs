//! Session RPC surface: wire frames and the method registry.
//!
//! Every call gets its own progress channel. Streaming methods forward each
//! chunk as a `chunk` frame; unary methods only report the terminal frame.
//! Handlers run detached from the socket so a disconnect never cancels them.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::bail;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::mpsc;

use super::channel::{ProgressSender, ProgressStream, StreamEvent, progress_channel};
use super::machine::SessionMachine;
use super::models::{Session, SessionConfig};
use crate::errors::SessionError;

/// Id used for frames of server-initiated calls (auto-provisioning on connect).
pub const SERVER_CALL_ID: u64 = 0;

pub const METHOD_CONFIGURE: &str = "configure";
pub const METHOD_RUN_SETUP: &str = "runSetup";
pub const METHOD_SUBMIT_EDIT: &str = "submitEdit";
pub const METHOD_GET_STATE: &str = "getState";

const REQUIRED_METHODS: [&str; 3] = [METHOD_CONFIGURE, METHOD_RUN_SETUP, METHOD_SUBMIT_EDIT];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    Unary,
    Streaming,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Chunk { id: u64, data: String },
    Done { id: u64, result: Value },
    Error { id: u64, message: String },
    State { session: Session },
}

pub type Handler = fn(Arc<SessionMachine>, Value, ProgressSender) -> BoxFuture<'static, ()>;

#[derive(Debug, Clone)]
pub struct MethodSpec {
    pub name: &'static str,
    pub mode: CallMode,
    pub handler: Handler,
}

#[derive(Debug)]
pub struct MethodRegistry {
    methods: HashMap<&'static str, MethodSpec>,
}

impl MethodRegistry {
    /// Build a registry, rejecting blank or duplicate names and a missing
    /// required method.
    pub fn new(specs: Vec<MethodSpec>) -> anyhow::Result<Self> {
        let mut methods = HashMap::new();
        for spec in specs {
            if spec.name.trim().is_empty() {
                bail!("RPC method name must not be empty");
            }
            if methods.insert(spec.name, spec.clone()).is_some() {
                bail!("RPC method '{}' is registered twice", spec.name);
            }
        }
        for required in REQUIRED_METHODS {
            if !methods.contains_key(required) {
                bail!("RPC method '{}' is not registered", required);
            }
        }
        Ok(Self { methods })
    }

    pub fn standard() -> anyhow::Result<Self> {
        Self::new(vec![
            MethodSpec {
                name: METHOD_CONFIGURE,
                mode: CallMode::Unary,
                handler: |machine, params, progress| Box::pin(configure(machine, params, progress)),
            },
            MethodSpec {
                name: METHOD_RUN_SETUP,
                mode: CallMode::Streaming,
                handler: |machine, _params, progress| Box::pin(run_setup(machine, progress)),
            },
            MethodSpec {
                name: METHOD_SUBMIT_EDIT,
                mode: CallMode::Streaming,
                handler: |machine, params, progress| Box::pin(submit_edit(machine, params, progress)),
            },
            MethodSpec {
                name: METHOD_GET_STATE,
                mode: CallMode::Unary,
                handler: |machine, _params, progress| {
                    Box::pin(async move { progress.complete(json!(machine.snapshot())) })
                },
            },
        ])
    }

    pub fn mode(&self, method: &str) -> Option<CallMode> {
        self.methods.get(method).map(|spec| spec.mode)
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.methods.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Start `request` against `machine`, writing its frames to `out`.
    /// Returns immediately; the call keeps running if `out` closes.
    pub fn dispatch(
        &self,
        machine: Arc<SessionMachine>,
        request: RpcRequest,
        out: mpsc::UnboundedSender<ServerFrame>,
    ) {
        let Some(spec) = self.methods.get(request.method.as_str()) else {
            let _ = out.send(ServerFrame::Error {
                id: request.id,
                message: format!("Unknown method '{}'", request.method),
            });
            return;
        };
        tracing::debug!(session_id = %machine.id(), method = spec.name, call_id = request.id, "dispatching call");

        let (tx, rx) = progress_channel();
        tokio::spawn((spec.handler)(machine, request.params, tx));
        tokio::spawn(forward_frames(request.id, spec.mode, rx, out));
    }
}

async fn forward_frames(
    id: u64,
    mode: CallMode,
    mut events: ProgressStream,
    out: mpsc::UnboundedSender<ServerFrame>,
) {
    while let Some(event) = events.next().await {
        let frame = match event {
            StreamEvent::Chunk(data) => {
                if mode == CallMode::Unary {
                    continue;
                }
                ServerFrame::Chunk { id, data }
            }
            StreamEvent::Completed(result) => ServerFrame::Done { id, result },
            StreamEvent::Failed(message) => ServerFrame::Error { id, message },
        };
        if out.send(frame).is_err() {
            // Client went away; the operation itself keeps running.
            break;
        }
    }
}

fn invalid_params(progress: ProgressSender, detail: impl std::fmt::Display) {
    progress.fail(SessionError::InvalidRequest(detail.to_string()).to_string());
}

async fn configure(machine: Arc<SessionMachine>, params: Value, progress: ProgressSender) {
    let config: SessionConfig = match serde_json::from_value(params) {
        Ok(config) => config,
        Err(e) => return invalid_params(progress, e),
    };
    match machine.configure(config).await {
        Ok(session) => progress.complete(json!(session)),
        Err(e) => progress.fail(e.to_string()),
    }
}

async fn run_setup(machine: Arc<SessionMachine>, progress: ProgressSender) {
    // Terminal event is sent by the machine.
    let _ = machine.provision(progress).await;
}

#[derive(Deserialize)]
struct EditParams {
    prompt: String,
}

async fn submit_edit(machine: Arc<SessionMachine>, params: Value, progress: ProgressSender) {
    let params: EditParams = match serde_json::from_value(params) {
        Ok(params) => params,
        Err(e) => return invalid_params(progress, e),
    };
    let _ = machine.submit_edit(&params.prompt, progress).await;
}
