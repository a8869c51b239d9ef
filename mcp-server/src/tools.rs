//! Tool catalogue and dispatch.
//!
//! `deploy_machine` and `commission_machine` are long-running: they start the
//! action on MAAS, then poll the machine until it settles, reporting progress
//! along the way. The remaining tools inspect and control the operations
//! registry.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use maas_async_utils::AbortSignal;
use maas_operations::ErrorHandler;
use maas_operations::NotificationSender;
use maas_operations::OperationRequest;
use maas_operations::OperationScope;
use maas_operations::OperationServices;
use maas_operations::OperationStatus;
use maas_operations::ProgressToken;
use maas_operations::ToolResult;
use maas_operations::handle_operation_error;
use maas_operations::with_operation_handler;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use serde_json::json;

use crate::backend::BackendError;
use crate::backend::CommissionOptions;
use crate::backend::DeployOptions;
use crate::backend::Machine;
use crate::backend::MachineBackend;
use crate::backend::status;
use crate::protocol::ToolDefinition;

pub const DEPLOY_MACHINE: &str = "deploy_machine";
pub const COMMISSION_MACHINE: &str = "commission_machine";
pub const LIST_OPERATIONS: &str = "list_operations";
pub const GET_OPERATION: &str = "get_operation";
pub const CANCEL_OPERATION: &str = "cancel_operation";

/// Progress reported once the backend accepted the action.
const ACCEPTED_PROGRESS: f64 = 10.0;
const PROGRESS_PER_POLL: f64 = 10.0;
/// Polling never reports more than this before the terminal state.
const MAX_POLL_PROGRESS: f64 = 90.0;

const DEFAULT_CANCEL_REASON: &str = "Cancelled by client";

#[derive(Debug, thiserror::Error)]
pub enum ToolCallError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments for {tool}: {source}")]
    InvalidArguments {
        tool: String,
        #[source]
        source: serde_json::Error,
    },
}

/// One `tools/call` invocation.
pub struct ToolCall {
    pub name: String,
    pub arguments: Value,
    pub progress_token: Option<ProgressToken>,
    pub request_id: Option<String>,
    pub signal: AbortSignal,
    pub sender: Option<Arc<dyn NotificationSender>>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: Value, signal: AbortSignal) -> Self {
        Self {
            name: name.into(),
            arguments,
            progress_token: None,
            request_id: None,
            signal,
            sender: None,
        }
    }

    fn request<P>(self, params: P) -> OperationRequest<P> {
        let mut request = OperationRequest::new(params, self.signal)
            .with_progress_token(self.progress_token);
        if let Some(request_id) = self.request_id {
            request = request.with_request_id(request_id);
        }
        if let Some(sender) = self.sender {
            request = request.with_sender(sender);
        }
        request
    }
}

#[derive(Debug, Clone, Deserialize)]
struct DeployArgs {
    system_id: String,
    #[serde(flatten)]
    options: DeployOptions,
}

#[derive(Debug, Clone, Deserialize)]
struct CommissionArgs {
    system_id: String,
    #[serde(flatten)]
    options: CommissionOptions,
}

#[derive(Debug, Default, Deserialize)]
struct ListOperationsArgs {
    #[serde(default)]
    status: Option<OperationStatus>,
}

#[derive(Debug, Deserialize)]
struct GetOperationArgs {
    token: ProgressToken,
}

#[derive(Debug, Deserialize)]
struct CancelOperationArgs {
    token: ProgressToken,
    #[serde(default)]
    reason: Option<String>,
}

/// Backend action driven to a settled machine state.
#[derive(Debug, Clone)]
enum MachineAction {
    Deploy(DeployOptions),
    Commission(CommissionOptions),
}

impl MachineAction {
    fn verb(&self) -> &'static str {
        match self {
            MachineAction::Deploy(_) => "deployment",
            MachineAction::Commission(_) => "commissioning",
        }
    }

    fn done_status(&self) -> &'static str {
        match self {
            MachineAction::Deploy(_) => status::DEPLOYED,
            MachineAction::Commission(_) => status::READY,
        }
    }

    fn is_failed(&self, status_name: &str) -> bool {
        match self {
            MachineAction::Deploy(_) => status_name == status::FAILED_DEPLOYMENT,
            MachineAction::Commission(_) => {
                status_name == status::FAILED_COMMISSIONING || status_name == status::FAILED_TESTING
            }
        }
    }

    async fn start(
        &self,
        backend: &dyn MachineBackend,
        system_id: &str,
    ) -> Result<Machine, BackendError> {
        match self {
            MachineAction::Deploy(options) => backend.deploy(system_id, options).await,
            MachineAction::Commission(options) => backend.commission(system_id, options).await,
        }
    }
}

/// Dispatches `tools/call` to the handlers.
#[derive(Clone)]
pub struct ToolRouter {
    services: OperationServices,
    backend: Arc<dyn MachineBackend>,
    poll_interval: Duration,
}

impl ToolRouter {
    pub fn new(
        services: OperationServices,
        backend: Arc<dyn MachineBackend>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            services,
            backend,
            poll_interval,
        }
    }

    pub fn services(&self) -> &OperationServices {
        &self.services
    }

    pub fn definitions() -> Vec<ToolDefinition> {
        let token_schema = json!({
            "type": ["string", "integer"],
            "description": "Progress token the operation was started with"
        });
        vec![
            ToolDefinition {
                name: DEPLOY_MACHINE.to_string(),
                description: "Deploy an allocated machine and wait until it is deployed. \
                              Pass _meta.progressToken to receive progress notifications."
                    .to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "system_id": {"type": "string"},
                        "distro_series": {"type": "string"},
                        "hwe_kernel": {"type": "string"},
                        "user_data": {"type": "string", "description": "Base64-encoded cloud-init user data"}
                    },
                    "required": ["system_id"]
                }),
            },
            ToolDefinition {
                name: COMMISSION_MACHINE.to_string(),
                description: "Commission a machine and wait until it is ready. \
                              Pass _meta.progressToken to receive progress notifications."
                    .to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "system_id": {"type": "string"},
                        "enable_ssh": {"type": "boolean"},
                        "skip_bmc_config": {"type": "boolean"},
                        "skip_networking": {"type": "boolean"},
                        "skip_storage": {"type": "boolean"}
                    },
                    "required": ["system_id"]
                }),
            },
            ToolDefinition {
                name: LIST_OPERATIONS.to_string(),
                description: "List tracked long-running operations.".to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "status": {
                            "type": "string",
                            "enum": ["pending", "running", "completed", "failed", "aborted"]
                        }
                    }
                }),
            },
            ToolDefinition {
                name: GET_OPERATION.to_string(),
                description: "Show one tracked operation.".to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {"token": token_schema},
                    "required": ["token"]
                }),
            },
            ToolDefinition {
                name: CANCEL_OPERATION.to_string(),
                description: "Abort a running operation.".to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "token": token_schema,
                        "reason": {"type": "string"}
                    },
                    "required": ["token"]
                }),
            },
        ]
    }

    /// Run one tool call. Tool-level failures come back as an error
    /// [`ToolResult`]; only unknown tools and malformed arguments are
    /// protocol errors.
    pub async fn call(&self, call: ToolCall) -> Result<ToolResult, ToolCallError> {
        match call.name.as_str() {
            DEPLOY_MACHINE => {
                let args: DeployArgs = parse_args(&call)?;
                let action = MachineAction::Deploy(args.options);
                Ok(self.run_action(DEPLOY_MACHINE, args.system_id, action, call).await)
            }
            COMMISSION_MACHINE => {
                let args: CommissionArgs = parse_args(&call)?;
                let action = MachineAction::Commission(args.options);
                Ok(self
                    .run_action(COMMISSION_MACHINE, args.system_id, action, call)
                    .await)
            }
            LIST_OPERATIONS => {
                let args: ListOperationsArgs = if call.arguments.is_null() {
                    ListOperationsArgs::default()
                } else {
                    parse_args(&call)?
                };
                Ok(self.list_operations(args.status))
            }
            GET_OPERATION => {
                let args: GetOperationArgs = parse_args(&call)?;
                Ok(self.get_operation(&args.token))
            }
            CANCEL_OPERATION => {
                let args: CancelOperationArgs = parse_args(&call)?;
                let reason = args.reason.as_deref().unwrap_or(DEFAULT_CANCEL_REASON);
                Ok(self.cancel_operation(&args.token, reason))
            }
            other => Err(ToolCallError::UnknownTool(other.to_string())),
        }
    }

    async fn run_action(
        &self,
        tool: &str,
        system_id: String,
        action: MachineAction,
        call: ToolCall,
    ) -> ToolResult {
        let backend = Arc::clone(&self.backend);
        let poll_interval = self.poll_interval;
        let handler = with_operation_handler(
            self.services.clone(),
            tool,
            move |(system_id, action): (String, MachineAction), scope: OperationScope| {
                let backend = Arc::clone(&backend);
                async move { drive_machine(&*backend, &system_id, &action, poll_interval, &scope).await }
            },
        );

        let outcome = handler
            .call(call.request((system_id.clone(), action)))
            .await;
        match outcome {
            Ok(machine) => match serde_json::to_value(&machine) {
                Ok(value) => ToolResult::json(value),
                Err(err) => ToolResult::error(format!("Failed to encode machine: {err}")),
            },
            Err(err) => {
                let missing = format!("Machine {system_id} not found");
                let not_found = move |err: &anyhow::Error| -> Option<ToolResult> {
                    err.chain()
                        .filter_map(|cause| cause.downcast_ref::<BackendError>())
                        .any(BackendError::is_not_found)
                        .then(|| ToolResult::error(missing.clone()))
                };
                let handlers: [&ErrorHandler; 1] = [&not_found];
                handle_operation_error(err, tool, &handlers)
            }
        }
    }

    fn list_operations(&self, status: Option<OperationStatus>) -> ToolResult {
        let operations: Vec<_> = self
            .services
            .registry
            .snapshots()
            .into_iter()
            .filter(|snapshot| status.is_none_or(|status| snapshot.status == status))
            .collect();
        ToolResult::json(json!({
            "count": operations.len(),
            "operations": operations,
        }))
    }

    fn get_operation(&self, token: &ProgressToken) -> ToolResult {
        match self.services.registry.snapshot(token) {
            Some(snapshot) => match serde_json::to_value(snapshot) {
                Ok(value) => ToolResult::json(value),
                Err(err) => ToolResult::error(format!("Failed to encode operation: {err}")),
            },
            None => ToolResult::error(format!("Operation {token} not found")),
        }
    }

    fn cancel_operation(&self, token: &ProgressToken, reason: &str) -> ToolResult {
        if self.services.registry.abort(token, reason) {
            tracing::info!(%token, reason, "Operation cancelled via tool");
            ToolResult::text(format!("Operation {token} cancelled"))
        } else {
            ToolResult::error(format!("Operation {token} is not running"))
        }
    }
}

fn parse_args<T: DeserializeOwned>(call: &ToolCall) -> Result<T, ToolCallError> {
    serde_json::from_value(call.arguments.clone()).map_err(|source| {
        ToolCallError::InvalidArguments {
            tool: call.name.clone(),
            source,
        }
    })
}

/// Start `action` on the machine and poll until it settles.
async fn drive_machine(
    backend: &dyn MachineBackend,
    system_id: &str,
    action: &MachineAction,
    poll_interval: Duration,
    scope: &OperationScope,
) -> anyhow::Result<Machine> {
    let verb = action.verb();
    scope
        .send_progress(0.0, format!("Starting {verb} of machine {system_id}"))
        .await;

    let accepted = scope
        .retry_when(|| action.start(backend, system_id), BackendError::is_transient)
        .await
        .with_context(|| format!("starting {verb} of machine {system_id}"))?;
    scope
        .send_progress(
            ACCEPTED_PROGRESS,
            format!("Machine {system_id} is {}", accepted.status_name),
        )
        .await;

    let mut polls = 0u32;
    loop {
        scope.delay(poll_interval).await?;
        let machine = scope
            .retry_when(|| backend.machine(system_id), BackendError::is_transient)
            .await
            .with_context(|| format!("polling machine {system_id}"))?;
        polls += 1;

        if machine.status_name == action.done_status() {
            scope
                .send_progress(100.0, format!("Machine {system_id} {verb} finished"))
                .await;
            return Ok(machine);
        }
        if action.is_failed(&machine.status_name) {
            anyhow::bail!(
                "machine {system_id} entered {:?}{}",
                machine.status_name,
                machine
                    .status_message
                    .as_deref()
                    .map(|message| format!(": {message}"))
                    .unwrap_or_default()
            );
        }

        let progress =
            (ACCEPTED_PROGRESS + PROGRESS_PER_POLL * f64::from(polls)).min(MAX_POLL_PROGRESS);
        tracing::debug!(system_id, status = %machine.status_name, polls, "Machine still settling");
        scope
            .send_progress(
                progress,
                format!("Machine {system_id} is {}", machine.status_name),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use maas_operations::OperationsRegistry;
    use maas_operations::RateLimitHistory;
    use maas_operations::RetryPolicy;
    use pretty_assertions::assert_eq;
    use reqwest::StatusCode;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Backend whose machine reports a scripted sequence of statuses.
    struct ScriptedBackend {
        start: Mutex<VecDeque<Result<Machine, BackendError>>>,
        statuses: Mutex<VecDeque<&'static str>>,
    }

    impl ScriptedBackend {
        fn new(statuses: &[&'static str]) -> Self {
            Self {
                start: Mutex::new(VecDeque::new()),
                statuses: Mutex::new(statuses.iter().copied().collect()),
            }
        }

        fn failing_start(self, err: BackendError) -> Self {
            self.start.lock().unwrap().push_back(Err(err));
            self
        }

        fn machine_in(status_name: &str) -> Machine {
            Machine {
                system_id: "abc123".to_string(),
                hostname: "node-1".to_string(),
                status_name: status_name.to_string(),
                status_message: None,
            }
        }

        fn next_start(&self, status_name: &str) -> Result<Machine, BackendError> {
            self.start
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Self::machine_in(status_name)))
        }
    }

    #[async_trait]
    impl MachineBackend for ScriptedBackend {
        async fn deploy(&self, _: &str, _: &DeployOptions) -> Result<Machine, BackendError> {
            self.next_start(status::DEPLOYING)
        }

        async fn commission(&self, _: &str, _: &CommissionOptions) -> Result<Machine, BackendError> {
            self.next_start(status::COMMISSIONING)
        }

        async fn machine(&self, _: &str) -> Result<Machine, BackendError> {
            let status_name = self.statuses.lock().unwrap().pop_front().unwrap_or(status::DEPLOYING);
            Ok(Self::machine_in(status_name))
        }
    }

    fn router(backend: ScriptedBackend) -> ToolRouter {
        let services = OperationServices::new(
            Arc::new(OperationsRegistry::new(Default::default())),
            Arc::new(RateLimitHistory::new()),
        )
        .with_retry_policy(RetryPolicy::new(3, Duration::from_millis(10)));
        ToolRouter::new(services, Arc::new(backend), Duration::from_secs(5))
    }

    fn deploy_call(token: Option<&str>) -> ToolCall {
        let mut call = ToolCall::new(
            DEPLOY_MACHINE,
            json!({"system_id": "abc123", "distro_series": "jammy"}),
            AbortSignal::new(),
        );
        call.progress_token = token.map(ProgressToken::from);
        call
    }

    #[tokio::test(start_paused = true)]
    async fn deploy_polls_until_deployed() {
        let router = router(ScriptedBackend::new(&[
            status::DEPLOYING,
            status::DEPLOYING,
            status::DEPLOYED,
        ]));

        let result = router.call(deploy_call(Some("tok"))).await.unwrap();

        assert!(!result.is_error, "{}", result.joined_text());
        assert_eq!(
            result.structured_content.unwrap()["status_name"],
            json!("Deployed")
        );
        let operation = router.services().registry.get(&"tok".into()).unwrap();
        assert_eq!(operation.status, OperationStatus::Completed);
        assert_eq!(operation.progress, 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_deployment_is_reported_as_tool_error() {
        let router = router(ScriptedBackend::new(&[status::FAILED_DEPLOYMENT]));

        let result = router.call(deploy_call(Some("tok"))).await.unwrap();

        assert!(result.is_error);
        assert_eq!(
            result.joined_text(),
            "Operation deploy_machine failed: machine abc123 entered \"Failed deployment\""
        );
        let operation = router.services().registry.get(&"tok".into()).unwrap();
        assert_eq!(operation.status, OperationStatus::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_machine_uses_not_found_message() {
        let backend = ScriptedBackend::new(&[]).failing_start(BackendError::Status {
            status: StatusCode::NOT_FOUND,
            body: String::new(),
        });
        let router = router(backend);

        let result = router.call(deploy_call(None)).await.unwrap();

        assert!(result.is_error);
        assert_eq!(result.joined_text(), "Machine abc123 not found");
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_operation_aborts_running_deploy() {
        let router = router(ScriptedBackend::new(&[]));
        let running = tokio::spawn({
            let router = router.clone();
            async move { router.call(deploy_call(Some("tok"))).await }
        });

        tokio::time::sleep(Duration::from_secs(12)).await;
        let cancel = router
            .call(ToolCall::new(
                CANCEL_OPERATION,
                json!({"token": "tok", "reason": "operator request"}),
                AbortSignal::new(),
            ))
            .await
            .unwrap();
        assert_eq!(cancel.joined_text(), "Operation tok cancelled");

        let result = running.await.unwrap().unwrap();
        assert_eq!(result.joined_text(), "Operation deploy_machine was aborted");
        let operation = router.services().registry.get(&"tok".into()).unwrap();
        assert_eq!(operation.status, OperationStatus::Aborted);
        assert_eq!(operation.message, "operator request");

        let again = router
            .call(ToolCall::new(
                CANCEL_OPERATION,
                json!({"token": "tok"}),
                AbortSignal::new(),
            ))
            .await
            .unwrap();
        assert!(again.is_error);
    }

    #[tokio::test(start_paused = true)]
    async fn registry_tools_report_operations() {
        let router = router(ScriptedBackend::new(&[status::DEPLOYED]));
        router.call(deploy_call(Some("tok"))).await.unwrap();

        let listed = router
            .call(ToolCall::new(
                LIST_OPERATIONS,
                json!({"status": "completed"}),
                AbortSignal::new(),
            ))
            .await
            .unwrap();
        assert_eq!(listed.structured_content.unwrap()["count"], json!(1));

        let fetched = router
            .call(ToolCall::new(GET_OPERATION, json!({"token": "tok"}), AbortSignal::new()))
            .await
            .unwrap();
        let snapshot = fetched.structured_content.unwrap();
        assert_eq!(snapshot["operationType"], json!(DEPLOY_MACHINE));
        assert_eq!(snapshot["status"], json!("completed"));

        let missing = router
            .call(ToolCall::new(GET_OPERATION, json!({"token": 42}), AbortSignal::new()))
            .await
            .unwrap();
        assert!(missing.is_error);
        assert_eq!(missing.joined_text(), "Operation 42 not found");
    }

    #[tokio::test]
    async fn bad_arguments_and_unknown_tools_are_call_errors() {
        let router = router(ScriptedBackend::new(&[]));

        let err = router
            .call(ToolCall::new(DEPLOY_MACHINE, json!({}), AbortSignal::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolCallError::InvalidArguments { .. }));

        let err = router
            .call(ToolCall::new("reboot_everything", json!({}), AbortSignal::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolCallError::UnknownTool(_)));
    }
}
