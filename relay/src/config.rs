/// relay.json 設定ファイルの構造体定義
///
/// 接続先の既定値、タイミング、ローカルで処理するツールを設定する。
/// 値の優先順位は CLI 引数 > 環境変数 > 設定ファイル > 既定値。
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::session::RelayOptions;

const DEFAULT_OPEN_TIMEOUT_SECS: u64 = 130;
const DEFAULT_PING_INTERVAL_SECS: u64 = 20;

/// relay.json のルート構造
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelayConfig {
    /// AWS リージョン
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// ランタイム ID から ARN を組み立てる際のアカウント ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,

    /// エンドポイントの qualifier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qualifier: Option<String>,

    pub open_timeout_secs: u64,

    /// 0 でキープアライブを無効化
    pub ping_interval_secs: u64,

    /// 0 で再生のペース制御を無効化
    pub playback_interval_ms: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub presign_expires_secs: Option<u64>,

    /// 組み込みツールを有効にするか
    pub builtin_tools: bool,

    /// MCP サーバーの設定マップ
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub mcp_servers: HashMap<String, McpServerConfig>,
}

/// MCP サーバーの設定（stdio で起動する）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServerConfig {
    /// 実行するコマンド
    pub command: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,

    /// 作業ディレクトリ（オプション）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            region: None,
            account_id: None,
            qualifier: None,
            open_timeout_secs: DEFAULT_OPEN_TIMEOUT_SECS,
            ping_interval_secs: DEFAULT_PING_INTERVAL_SECS,
            playback_interval_ms: 0,
            presign_expires_secs: None,
            builtin_tools: true,
            mcp_servers: HashMap::new(),
        }
    }
}

impl RelayConfig {
    /// relay.json ファイルを読み込む
    ///
    /// # Errors
    /// ファイルの読み込みやパースに失敗した場合
    pub fn load_from_file(path: impl Into<PathBuf>) -> Result<Self, std::io::Error> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)?;
        let config: RelayConfig = serde_json::from_str(&content).map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("Failed to parse {}: {}", path.display(), e),
            )
        })?;
        Ok(config)
    }

    /// デフォルトの設定ファイルパスを取得
    ///
    /// 以下の順序で検索：
    /// 1. `.agentcore/relay.json`
    /// 2. `relay.json`（カレントディレクトリ）
    pub fn default_path() -> Option<PathBuf> {
        [".agentcore/relay.json", "relay.json"]
            .into_iter()
            .map(PathBuf::from)
            .find(|path| path.exists())
    }

    /// デフォルトパスから設定を読み込む
    ///
    /// 見つからない場合は既定値を返す。
    pub fn load_default() -> Result<Self, std::io::Error> {
        match Self::default_path() {
            Some(path) => {
                tracing::debug!(path = %path.display(), "Loading relay config");
                Self::load_from_file(path)
            }
            None => Ok(Self::default()),
        }
    }

    /// 環境変数（`AWS_REGION`, `ACCOUNT_ID`）で上書きする
    pub fn apply_env(self) -> Self {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// 任意の参照関数で環境変数を解決して上書きする
    pub fn apply_env_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        if let Some(region) = non_empty("AWS_REGION") {
            self.region = Some(region);
        }
        if let Some(account_id) = non_empty("ACCOUNT_ID") {
            self.account_id = Some(account_id);
        }
        self
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        (self.ping_interval_secs > 0).then(|| Duration::from_secs(self.ping_interval_secs))
    }

    pub fn playback_interval(&self) -> Option<Duration> {
        (self.playback_interval_ms > 0).then(|| Duration::from_millis(self.playback_interval_ms))
    }

    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            playback_interval: self.playback_interval(),
            ping_interval: self.ping_interval(),
        }
    }

    /// 特定の MCP サーバー設定を取得
    pub fn mcp_server(&self, name: &str) -> Option<&McpServerConfig> {
        self.mcp_servers.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_empty() {
        let config: RelayConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, RelayConfig::default());
        assert_eq!(config.open_timeout(), Duration::from_secs(130));
        assert_eq!(config.ping_interval(), Some(Duration::from_secs(20)));
        assert_eq!(config.playback_interval(), None);
        assert!(config.builtin_tools);
    }

    #[test]
    fn test_parse_full_config() {
        let json = r#"
        {
          "region": "us-west-2",
          "accountId": "123456789012",
          "qualifier": "PROD",
          "openTimeoutSecs": 10,
          "pingIntervalSecs": 0,
          "playbackIntervalMs": 40,
          "presignExpiresSecs": 60,
          "builtinTools": false,
          "mcpServers": {
            "time": {
              "command": "uvx",
              "args": ["mcp-server-time"],
              "env": { "RUST_LOG": "debug" }
            }
          }
        }
        "#;

        let config: RelayConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.region.as_deref(), Some("us-west-2"));
        assert_eq!(config.account_id.as_deref(), Some("123456789012"));
        assert_eq!(config.qualifier.as_deref(), Some("PROD"));
        assert_eq!(config.presign_expires_secs, Some(60));
        assert!(!config.builtin_tools);

        let options = config.relay_options();
        assert_eq!(options.ping_interval, None);
        assert_eq!(options.playback_interval, Some(Duration::from_millis(40)));

        let server = config.mcp_server("time").unwrap();
        assert_eq!(server.command, "uvx");
        assert_eq!(server.args, vec!["mcp-server-time".to_string()]);
        assert_eq!(server.env.get("RUST_LOG"), Some(&"debug".to_string()));
        assert!(server.cwd.is_none());
    }

    #[test]
    fn test_env_overrides_file() {
        let config = RelayConfig {
            region: Some("us-west-2".to_string()),
            ..RelayConfig::default()
        };
        let config = config.apply_env_from(|key| match key {
            "AWS_REGION" => Some("ap-northeast-1".to_string()),
            "ACCOUNT_ID" => Some("  ".to_string()),
            _ => None,
        });
        assert_eq!(config.region.as_deref(), Some("ap-northeast-1"));
        assert_eq!(config.account_id, None);
    }

    #[test]
    fn test_load_from_file_reports_parse_error() {
        let path = std::env::temp_dir().join(format!("relay-config-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, "{ not json").unwrap();

        let err = RelayConfig::load_from_file(&path).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);

        std::fs::remove_file(&path).unwrap();
    }
}
