use serde_json::Value;
use std::collections::BTreeSet;

use crate::builtin::BuiltinTool;
use crate::mcp::{McpClient, McpError};

/// ツール実行のエラー型
#[derive(thiserror::Error, Debug)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    UnknownTool(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("MCP error: {0}")]
    Mcp(#[from] McpError),
}

struct McpTools {
    client: McpClient,
    names: BTreeSet<String>,
}

/// リレーがローカルで処理するツールの一覧
///
/// 組み込みツールを優先し、見つからなければ接続済みの MCP サーバーに委譲する。
#[derive(Default)]
pub struct ToolRegistry {
    builtins: Vec<BuiltinTool>,
    mcp: Option<McpTools>,
}

impl ToolRegistry {
    /// ツールを持たない空のレジストリ
    pub fn new() -> Self {
        Self::default()
    }

    /// すべての組み込みツールを登録したレジストリ
    pub fn with_builtins() -> Self {
        Self {
            builtins: BuiltinTool::ALL.to_vec(),
            mcp: None,
        }
    }

    /// MCP サーバーを接続し、提供されるツール名を登録する
    ///
    /// 既存の MCP 接続があれば切断してから置き換える。
    ///
    /// # Returns
    /// 登録したツールの数
    pub async fn attach_mcp(&mut self, client: McpClient) -> Result<usize, ToolError> {
        if let Some(existing) = self.mcp.take() {
            let _ = existing.client.disconnect().await;
        }

        let names: BTreeSet<String> = client
            .list_tools()
            .await?
            .into_iter()
            .map(|tool| tool.name.to_string())
            .collect();
        let count = names.len();
        tracing::info!(tools = ?names, "Registered MCP tools");

        self.mcp = Some(McpTools { client, names });
        Ok(count)
    }

    pub fn is_mcp_connected(&self) -> bool {
        self.mcp.is_some()
    }

    /// ローカルで処理できるツール名かどうか
    pub fn is_known(&self, name: &str) -> bool {
        self.builtin(name).is_some()
            || self
                .mcp
                .as_ref()
                .is_some_and(|mcp| mcp.names.contains(name))
    }

    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .builtins
            .iter()
            .flat_map(|tool| tool.aliases().iter().map(|a| a.to_string()))
            .collect();
        if let Some(mcp) = &self.mcp {
            names.extend(mcp.names.iter().cloned());
        }
        names
    }

    /// ツールを実行する
    ///
    /// # Arguments
    /// * `name` - ツール名
    /// * `input` - 引数。JSON 文字列の場合は展開してから渡す
    ///
    /// # Errors
    /// 未登録のツールは `ToolError::UnknownTool`
    pub async fn call(&self, name: &str, input: Value) -> Result<Value, ToolError> {
        let input = normalize_input(input);

        if let Some(tool) = self.builtin(name) {
            tracing::debug!(tool = %name, "Invoking builtin tool");
            return tool.invoke(&input);
        }

        match &self.mcp {
            Some(mcp) if mcp.names.contains(name) => {
                tracing::debug!(tool = %name, "Invoking MCP tool");
                let arguments = match input {
                    Value::Object(map) => Some(map),
                    Value::Null => None,
                    other => {
                        return Err(ToolError::InvalidArguments(format!(
                            "{name} expects an object, got {other}"
                        )));
                    }
                };
                Ok(mcp.client.call_tool(name, arguments).await?)
            }
            _ => Err(ToolError::UnknownTool(name.to_string())),
        }
    }

    /// MCP サーバーとの接続を閉じる
    pub async fn shutdown(&mut self) -> Result<(), ToolError> {
        if let Some(mcp) = self.mcp.take() {
            mcp.client.disconnect().await?;
        }
        Ok(())
    }

    fn builtin(&self, name: &str) -> Option<BuiltinTool> {
        BuiltinTool::from_name(name).filter(|tool| self.builtins.contains(tool))
    }
}

/// Sonic のツール入力は JSON 文字列で届くため、オブジェクトに展開する
fn normalize_input(input: Value) -> Value {
    match input {
        Value::String(text) => {
            let trimmed = text.trim();
            if trimmed.is_empty() {
                Value::Null
            } else {
                serde_json::from_str(trimmed).unwrap_or(Value::String(text))
            }
        }
        other => other,
    }
}
