//! Newline-delimited JSON-RPC loop over a reader/writer pair (stdio in
//! production).
//!
//! Requests other than `tools/call` are answered inline. Each `tools/call`
//! runs in its own task under a child of the session signal, so
//! `notifications/cancelled` or session shutdown aborts it. Responses and
//! progress notifications share one ordered writer task.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use async_trait::async_trait;
use maas_async_utils::AbortSignal;
use maas_operations::NotificationSender;
use maas_operations::ProgressNotification;
use maas_operations::spawn_sweeper;
use serde_json::Value;
use serde_json::json;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::Instrument;

use crate::SERVER_NAME;
use crate::SERVER_VERSION;
use crate::backend::BackendError;
use crate::backend::HttpMachineBackend;
use crate::config::ServerConfig;
use crate::protocol::*;
use crate::tools::ToolCall;
use crate::tools::ToolRouter;

const SHUTDOWN_REASON: &str = "server shutting down";
const CLIENT_CANCEL_REASON: &str = "Request cancelled by client";

type RpcResult = Result<Value, (i64, String)>;

/// Progress sink that queues notifications on the session writer.
#[derive(Debug, Clone)]
pub struct ChannelNotificationSender {
    tx: mpsc::UnboundedSender<OutgoingMessage>,
}

impl ChannelNotificationSender {
    pub fn new(tx: mpsc::UnboundedSender<OutgoingMessage>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl NotificationSender for ChannelNotificationSender {
    async fn send_notification(&self, notification: ProgressNotification) -> anyhow::Result<()> {
        let params = serde_json::to_value(&notification.params)?;
        self.tx
            .send(OutgoingMessage::notification(notification.method, params))
            .map_err(|_| anyhow::anyhow!("client connection closed"))
    }
}

/// Requests whose tool call is still running, by request id.
#[derive(Default)]
struct InFlight {
    signals: Mutex<HashMap<RequestId, AbortSignal>>,
}

impl InFlight {
    fn signals(&self) -> MutexGuard<'_, HashMap<RequestId, AbortSignal>> {
        self.signals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns false when `id` is already in flight.
    fn insert(&self, id: RequestId, signal: AbortSignal) -> bool {
        let mut signals = self.signals();
        if signals.contains_key(&id) {
            return false;
        }
        signals.insert(id, signal);
        true
    }

    fn remove(&self, id: &RequestId) -> Option<AbortSignal> {
        self.signals().remove(id)
    }

    fn len(&self) -> usize {
        self.signals().len()
    }
}

pub struct McpServer {
    router: ToolRouter,
    sweep_interval: Duration,
}

impl McpServer {
    pub fn new(router: ToolRouter, sweep_interval: Duration) -> Self {
        Self {
            router,
            sweep_interval,
        }
    }

    /// Server backed by the MAAS HTTP API described by `config`.
    pub fn from_config(config: &ServerConfig) -> Result<Self, BackendError> {
        let backend = HttpMachineBackend::from_config(&config.backend)?;
        let router = ToolRouter::new(
            config.operation_services(),
            Arc::new(backend),
            config.poll_interval(),
        );
        Ok(Self::new(router, config.sweep_interval()))
    }

    pub fn router(&self) -> &ToolRouter {
        &self.router
    }

    /// Serve one client until EOF on `reader` or until `shutdown` fires.
    ///
    /// On exit every in-flight tool call is aborted and allowed to write
    /// its final response before the writer is closed.
    pub async fn serve<R, W>(
        &self,
        reader: R,
        writer: W,
        shutdown: AbortSignal,
    ) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let session = shutdown.child();
        let (tx, rx) = mpsc::unbounded_channel();
        let writer_task = tokio::spawn(write_messages(writer, rx));
        let sweeper = spawn_sweeper(
            Arc::clone(&self.router.services().registry),
            Arc::clone(&self.router.services().rate_limit_history),
            self.sweep_interval,
            session.clone(),
        );

        let session_state = Session {
            router: self.router.clone(),
            tx: tx.clone(),
            in_flight: Arc::new(InFlight::default()),
            signal: session.clone(),
        };
        let mut tasks = JoinSet::new();
        let mut lines = BufReader::new(reader).lines();
        tracing::info!("MCP session started");

        loop {
            let line = tokio::select! {
                biased;
                _ = session.cancelled() => break,
                line = lines.next_line() => line,
            };
            match line {
                Ok(Some(line)) => {
                    let trimmed = line.trim();
                    if !trimmed.is_empty() {
                        session_state.dispatch(trimmed, &mut tasks);
                    }
                }
                Ok(None) => {
                    tracing::info!("Client closed input");
                    break;
                }
                Err(err) => {
                    tracing::warn!("Failed to read from client: {err}");
                    break;
                }
            }
        }

        let pending = session_state.in_flight.len();
        session.abort(SHUTDOWN_REASON);
        if pending > 0 {
            tracing::info!(pending, "Aborting in-flight requests");
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                tracing::warn!("Tool task failed: {err}");
            }
        }
        if let Err(err) = sweeper.await {
            tracing::warn!("Sweeper task failed: {err}");
        }

        drop(session_state);
        drop(tx);
        match writer_task.await {
            Ok(result) => result,
            Err(err) => Err(std::io::Error::other(err)),
        }
    }
}

/// Per-connection state shared with spawned tool tasks.
#[derive(Clone)]
struct Session {
    router: ToolRouter,
    tx: mpsc::UnboundedSender<OutgoingMessage>,
    in_flight: Arc<InFlight>,
    signal: AbortSignal,
}

impl Session {
    fn send(&self, message: OutgoingMessage) {
        if self.tx.send(message).is_err() {
            tracing::debug!("Writer closed; dropping message");
        }
    }

    fn dispatch(&self, raw: &str, tasks: &mut JoinSet<()>) {
        let message: IncomingMessage = match serde_json::from_str(raw) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("Unparseable message: {e}");
                self.send(OutgoingMessage::error(
                    None,
                    ERR_PARSE,
                    format!("Parse error: {e}"),
                ));
                return;
            }
        };

        let IncomingMessage {
            jsonrpc,
            id,
            method,
            params,
        } = message;

        if jsonrpc.as_deref() != Some(JSONRPC_VERSION) {
            self.send(OutgoingMessage::error(
                id,
                ERR_INVALID_REQUEST,
                "Invalid Request: jsonrpc must be \"2.0\"",
            ));
            return;
        }

        match (id, method) {
            (Some(id), Some(method)) => self.handle_request(id, &method, params, tasks),
            (None, Some(method)) => self.handle_notification(&method, params),
            (Some(id), None) => {
                tracing::debug!(%id, "Ignoring response to server request");
            }
            (None, None) => self.send(OutgoingMessage::error(
                None,
                ERR_INVALID_REQUEST,
                "Invalid Request: missing method",
            )),
        }
    }

    fn handle_request(
        &self,
        id: RequestId,
        method: &str,
        params: Option<Value>,
        tasks: &mut JoinSet<()>,
    ) {
        tracing::debug!(%id, method, "Request received");
        let result = match method {
            METHOD_INITIALIZE => handle_initialize(),
            METHOD_PING => Ok(json!({})),
            METHOD_TOOLS_LIST => handle_tools_list(),
            METHOD_TOOLS_CALL => {
                if let Err(err) = self.spawn_tool_call(id.clone(), params, tasks) {
                    self.send(OutgoingMessage::error(Some(id), err.0, err.1));
                }
                return;
            }
            _ => Err((ERR_METHOD_NOT_FOUND, format!("Method not found: {method}"))),
        };
        self.send(match result {
            Ok(value) => OutgoingMessage::response(id, value),
            Err((code, message)) => OutgoingMessage::error(Some(id), code, message),
        });
    }

    fn handle_notification(&self, method: &str, params: Option<Value>) {
        match method {
            NOTIFICATION_INITIALIZED => tracing::debug!("Client initialized"),
            NOTIFICATION_CANCELLED => {
                let params: CancelledParams = match params.map(serde_json::from_value) {
                    Some(Ok(params)) => params,
                    Some(Err(e)) => {
                        tracing::warn!("Invalid cancellation params: {e}");
                        return;
                    }
                    None => {
                        tracing::warn!("Cancellation without params");
                        return;
                    }
                };
                let reason = params.reason.as_deref().unwrap_or(CLIENT_CANCEL_REASON);
                match self.in_flight.remove(&params.request_id) {
                    Some(signal) => {
                        tracing::info!(id = %params.request_id, reason, "Client cancelled request");
                        signal.abort(reason);
                    }
                    None => {
                        tracing::debug!(id = %params.request_id, "Cancellation for unknown request");
                    }
                }
            }
            _ => tracing::debug!(method, "Ignoring notification"),
        }
    }

    fn spawn_tool_call(
        &self,
        id: RequestId,
        params: Option<Value>,
        tasks: &mut JoinSet<()>,
    ) -> Result<(), (i64, String)> {
        let params: CallToolParams = params
            .ok_or_else(|| (ERR_INVALID_PARAMS, "Missing params".to_string()))
            .and_then(|v| {
                serde_json::from_value(v)
                    .map_err(|e| (ERR_INVALID_PARAMS, format!("Invalid tools/call params: {e}")))
            })?;

        let signal = self.signal.child();
        if !self.in_flight.insert(id.clone(), signal.clone()) {
            return Err((
                ERR_INVALID_REQUEST,
                format!("Request id {id} is already in flight"),
            ));
        }

        let progress_token = params.progress_token();
        let call = ToolCall {
            name: params.name.clone(),
            arguments: params.arguments.unwrap_or(Value::Null),
            progress_token,
            request_id: Some(id.to_string()),
            signal,
            sender: Some(Arc::new(ChannelNotificationSender::new(self.tx.clone()))),
        };

        let session = self.clone();
        let span = tracing::info_span!("tools/call", id = %id, tool = %params.name);
        tasks.spawn(
            async move {
                let result = session.router.call(call).await;
                // A client-cancelled request gets no response.
                if session.in_flight.remove(&id).is_none() {
                    tracing::debug!("Suppressing response to cancelled request");
                    return;
                }
                session.send(match result {
                    Ok(tool_result) => match serde_json::to_value(&tool_result) {
                        Ok(value) => OutgoingMessage::response(id, value),
                        Err(e) => OutgoingMessage::error(
                            Some(id),
                            ERR_INTERNAL,
                            format!("Serialize error: {e}"),
                        ),
                    },
                    Err(err) => OutgoingMessage::error(Some(id), ERR_INVALID_PARAMS, err.to_string()),
                });
            }
            .instrument(span),
        );
        Ok(())
    }
}

fn handle_initialize() -> RpcResult {
    let result = InitializeResult {
        protocol_version: MCP_PROTOCOL_VERSION.to_string(),
        capabilities: ServerCapabilities::default(),
        server_info: Implementation {
            name: SERVER_NAME.to_string(),
            version: SERVER_VERSION.to_string(),
        },
        instructions: Some(
            "Long-running tools accept _meta.progressToken and report \
             notifications/progress; inspect them with list_operations."
                .to_string(),
        ),
    };
    serde_json::to_value(result).map_err(|e| (ERR_INTERNAL, format!("Serialize error: {e}")))
}

fn handle_tools_list() -> RpcResult {
    let result = ListToolsResult {
        tools: ToolRouter::definitions(),
    };
    serde_json::to_value(result).map_err(|e| (ERR_INTERNAL, format!("Serialize error: {e}")))
}

async fn write_messages<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<OutgoingMessage>,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let mut bytes = serde_json::to_vec(&message)?;
        bytes.push(b'\n');
        writer.write_all(&bytes).await?;
        writer.flush().await?;
    }
    writer.shutdown().await
}
