//! MCP server implementation using rmcp.
//!
//! Exposes the executor as a single `execute` tool. The tool answers with the
//! same JSON shape the notebook frontend expects from a kernel:
//! `{stdout, stderr, executionTime, error}`.

use std::future::Future;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo};
use rmcp::schemars;
use rmcp::service::RequestContext;
use rmcp::transport::stdio;
use rmcp::{
    tool, tool_handler, tool_router, ErrorData as McpError, RoleServer, ServerHandler, ServiceExt,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::backend::IsolationBackend;
use crate::executor::{ExecutionResult, Executor};

/// MCP server for sandboxed code execution.
#[derive(Clone)]
pub struct SandboxServer<B: Clone> {
    executor: Executor<B>,
    tool_router: ToolRouter<Self>,
}

/// Parameters for the execute tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecuteParams {
    /// The code to execute in the sandbox.
    #[schemars(description = "The Python code to execute in the sandbox")]
    pub code: String,

    /// Optional wall-clock limit in seconds.
    #[schemars(description = "Wall-clock limit in seconds (defaults to the server setting)")]
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// Wire shape of an execution result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    pub stdout: String,
    pub stderr: String,
    pub execution_time: f64,
    pub error: bool,
}

impl From<ExecutionResult> for ExecuteResponse {
    fn from(result: ExecutionResult) -> Self {
        Self {
            stdout: result.stdout,
            stderr: result.stderr,
            execution_time: result.execution_time_seconds,
            error: result.failed,
        }
    }
}

#[tool_router]
impl<B: IsolationBackend + Clone + 'static> SandboxServer<B> {
    /// Create a new sandbox server.
    pub fn new(executor: Executor<B>) -> Self {
        Self {
            executor,
            tool_router: Self::tool_router(),
        }
    }

    /// Execute code in a fresh sandbox.
    #[tool(description = "Execute Python code in a throwaway Docker container")]
    async fn execute(
        &self,
        Parameters(params): Parameters<ExecuteParams>,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        self.run_cell(params, context.ct.cancelled()).await
    }

    /// Run one cell unless `cancelled` resolves first.
    ///
    /// Cancelling drops the execution, which kills its sandbox.
    async fn run_cell(
        &self,
        params: ExecuteParams,
        cancelled: impl Future<Output = ()> + Send,
    ) -> Result<CallToolResult, McpError> {
        let timeout = self.executor.config().effective_timeout(params.timeout_seconds);

        info!(code_len = params.code.len(), ?timeout, "Executing code");

        let result = tokio::select! {
            result = self.executor.execute(params.code.as_bytes(), timeout) => result,
            () = cancelled => {
                info!("Execution cancelled by client");
                return Ok(CallToolResult::error(vec![Content::text("Execution cancelled")]));
            }
        };
        let response = ExecuteResponse::from(result);

        let body = serde_json::to_string(&response).map_err(|e| {
            McpError::internal_error(format!("Failed to encode result: {e}"), None)
        })?;

        if response.error {
            Ok(CallToolResult::error(vec![Content::text(body)]))
        } else {
            Ok(CallToolResult::success(vec![Content::text(body)]))
        }
    }
}

#[tool_handler]
impl<B: IsolationBackend + Clone + 'static> ServerHandler for SandboxServer<B> {
    fn get_info(&self) -> ServerInfo {
        let config = self.executor.config();

        ServerInfo {
            protocol_version: rmcp::model::ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "cell-sandbox".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(format!(
                "Execute code in a throwaway container built from image '{}'.\n\
                 Each call starts from a clean state; nothing persists between calls.\n\
                 \n\
                 Use the 'execute' tool with:\n\
                 - code: the code to run\n\
                 - timeout_seconds (optional): defaults to {}, capped at {}",
                config.image, config.timeout_seconds, config.limits.max_timeout_seconds
            )),
        }
    }
}

/// Serve the sandbox server over stdio.
pub async fn serve_stdio<B: IsolationBackend + Clone + 'static>(
    executor: Executor<B>,
) -> anyhow::Result<()> {
    let server = SandboxServer::new(executor);

    info!("Starting MCP server on stdio");

    let service = server
        .serve(stdio())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start MCP server: {e}"))?;

    service
        .waiting()
        .await
        .map_err(|e| anyhow::anyhow!("MCP server error: {e}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendError, RunOutput, RunSpec};
    use crate::config::Config;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Clone, Default)]
    struct MockBackend {
        exit_code: i32,
        hang: bool,
        kills: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl IsolationBackend for MockBackend {
        async fn run(&self, spec: &RunSpec) -> Result<RunOutput, BackendError> {
            if self.hang {
                return std::future::pending().await;
            }
            let code = std::fs::read_to_string(spec.mounts[0].host.join("cell_exec.py"))?;
            Ok(RunOutput {
                exit_code: Some(self.exit_code),
                stdout: format!("executed: {code}"),
                ..RunOutput::default()
            })
        }

        async fn kill(&self, name: &str) -> Result<(), BackendError> {
            self.kills.lock().unwrap().push(name.to_string());
            Ok(())
        }
    }

    fn server(exit_code: i32) -> SandboxServer<MockBackend> {
        let backend = MockBackend {
            exit_code,
            ..MockBackend::default()
        };
        SandboxServer::new(Executor::new(Config::default(), backend))
    }

    fn params(code: &str) -> ExecuteParams {
        ExecuteParams {
            code: code.to_string(),
            timeout_seconds: None,
        }
    }

    fn response(result: &CallToolResult) -> ExecuteResponse {
        let text = &result.content[0].as_text().unwrap().text;
        serde_json::from_str(text).unwrap()
    }

    #[tokio::test]
    async fn test_execute_success() {
        let server = server(0);

        let result = server
            .run_cell(params("hello"), std::future::pending())
            .await
            .unwrap();

        assert!(!result.is_error.unwrap_or(false));
        let response = response(&result);
        assert_eq!(response.stdout, "executed: hello");
        assert!(!response.error);
    }

    #[tokio::test]
    async fn test_execute_failure_is_tool_error() {
        let server = server(1);

        let result = server
            .run_cell(params("raise SystemExit(1)"), std::future::pending())
            .await
            .unwrap();

        assert_eq!(result.is_error, Some(true));
        assert!(response(&result).error);
    }

    #[tokio::test]
    async fn test_cancelled_call_kills_sandbox() {
        let backend = MockBackend {
            hang: true,
            ..MockBackend::default()
        };
        let kills = Arc::clone(&backend.kills);
        let server = SandboxServer::new(Executor::new(Config::default(), backend));

        let result = server
            .run_cell(
                params("while True: pass"),
                tokio::time::sleep(Duration::from_millis(50)),
            )
            .await
            .unwrap();

        assert_eq!(result.is_error, Some(true));
        assert_eq!(
            result.content[0].as_text().unwrap().text,
            "Execution cancelled"
        );

        // The sandbox is killed in the background once the call is dropped
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(kills.lock().unwrap().len(), 1);
    }

    #[test]
    fn response_uses_frontend_field_names() {
        let response = ExecuteResponse::from(ExecutionResult {
            stdout: "hello\n".to_string(),
            stderr: String::new(),
            execution_time_seconds: 0.5,
            failed: false,
        });
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "stdout": "hello\n",
                "stderr": "",
                "executionTime": 0.5,
                "error": false
            })
        );
    }

    #[test]
    fn params_timeout_is_optional() {
        let parsed: ExecuteParams = serde_json::from_str(r#"{"code": "print(1)"}"#).unwrap();
        assert!(parsed.timeout_seconds.is_none());

        let parsed: ExecuteParams =
            serde_json::from_str(r#"{"code": "", "timeout_seconds": 2}"#).unwrap();
        assert_eq!(parsed.timeout_seconds, Some(2));
        assert_eq!(
            Config::default().effective_timeout(parsed.timeout_seconds),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn get_info_mentions_image() {
        let info = server(0).get_info();
        assert!(info.instructions.unwrap().contains("blockzie-python"));
    }
}
