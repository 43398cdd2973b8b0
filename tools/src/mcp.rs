use rmcp::{
    RmcpError,
    model::{CallToolRequestParam, ServerInfo, Tool},
    service::{RoleClient, RunningService, ServiceError, ServiceExt},
    transport::{ConfigureCommandExt, TokioChildProcess},
};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use tokio::process::Command;

/// MCPクライアントのエラー型
#[derive(thiserror::Error, Debug)]
pub enum McpError {
    #[error("MCP transport error: {0}")]
    TransportError(String),

    #[error("MCP protocol error: {0}")]
    ProtocolError(#[from] RmcpError),

    #[error("MCP service error: {0}")]
    ServiceError(#[from] ServiceError),

    #[error("MCP client initialization error: {0}")]
    InitializationError(String),

    #[error("Task join error: {0}")]
    TaskJoinError(#[from] tokio::task::JoinError),

    #[error("MCP tool {name} failed: {detail}")]
    ToolFailed { name: String, detail: String },

    #[error("MCP result serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// ツール実行を委譲するローカル MCP サーバーのクライアント
///
/// サーバーは子プロセスとして起動し、stdio で通信する。
pub struct McpClient {
    client: RunningService<RoleClient, ()>,
}

impl McpClient {
    /// MCP サーバーを起動して接続する
    ///
    /// # Arguments
    /// * `command` - 起動するコマンド名（例: "uvx", "npx"）
    /// * `args` - コマンド引数
    /// * `env` - 子プロセスに追加する環境変数
    /// * `cwd` - 作業ディレクトリ（オプション）
    ///
    /// # Examples
    /// ```no_run
    /// # use std::collections::HashMap;
    /// # use tools::McpClient;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let client = McpClient::spawn("uvx", &["mcp-server-time".to_string()], &HashMap::new(), None).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn spawn(
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
        cwd: Option<&Path>,
    ) -> Result<Self, McpError> {
        let transport = TokioChildProcess::new(Command::new(command).configure(|cmd| {
            cmd.args(args);
            cmd.envs(env);
            if let Some(dir) = cwd {
                cmd.current_dir(dir);
            }
        }))
        .map_err(|e| McpError::TransportError(e.to_string()))?;

        let client = ()
            .serve(transport)
            .await
            .map_err(|e| McpError::InitializationError(e.to_string()))?;

        tracing::info!(command = %command, "Connected to MCP tool server");
        Ok(Self { client })
    }

    /// サーバーの情報（名前、バージョン等）
    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.client.peer_info()
    }

    pub async fn list_tools(&self) -> Result<Vec<Tool>, McpError> {
        let response = self.client.list_tools(Default::default()).await?;
        Ok(response.tools)
    }

    /// 指定されたツールを実行する
    ///
    /// # Returns
    /// * `Ok(Value)` - ツールの実行結果（`CallToolResult` の JSON 表現）
    /// * `Err(McpError::ToolFailed)` - サーバーが `isError` を返した場合
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: Option<serde_json::Map<String, Value>>,
    ) -> Result<Value, McpError> {
        let result = self
            .client
            .call_tool(CallToolRequestParam {
                name: tool_name.to_string().into(),
                arguments,
            })
            .await?;

        let value = serde_json::to_value(&result)?;
        if value.get("isError").and_then(Value::as_bool) == Some(true) {
            return Err(McpError::ToolFailed {
                name: tool_name.to_string(),
                detail: value
                    .get("content")
                    .map(Value::to_string)
                    .unwrap_or_default(),
            });
        }
        Ok(value)
    }

    /// MCPサーバーとの接続を切断する
    pub async fn disconnect(self) -> Result<(), McpError> {
        self.client.cancel().await?;
        Ok(())
    }
}
