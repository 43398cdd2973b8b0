use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use std::fmt;
use std::str::FromStr;
use url::Url;

use crate::credentials::Credentials;
use crate::error::AuthError;
use crate::sigv4::{self, SigningParams};

/// ランタイムのセッション ID を運ぶヘッダ
pub const SESSION_ID_HEADER: &str = "X-Amzn-Bedrock-AgentCore-Runtime-Session-Id";
pub const DEFAULT_QUALIFIER: &str = "DEFAULT";
pub const DEFAULT_PRESIGN_EXPIRES_SECS: u64 = 300;

const SESSION_ID_LEN: usize = 50;
const SIGV4_USER_AGENT: &str = "AWS-SigV4-WebSocket-Client/1.0";
const OAUTH_USER_AGENT: &str = "OAuth-WebSocket-Client/1.0";

/// 接続時の認証方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMode {
    /// SigV4 署名を `Authorization` ヘッダで送る
    #[default]
    Headers,
    /// SigV4 署名をクエリ文字列に載せる（プリサインド URL）
    Query,
    /// `Authorization: Bearer` トークン
    OAuth,
}

impl fmt::Display for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthMode::Headers => "headers",
            AuthMode::Query => "query",
            AuthMode::OAuth => "oauth",
        };
        f.write_str(name)
    }
}

impl FromStr for AuthMode {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "headers" => Ok(AuthMode::Headers),
            "query" => Ok(AuthMode::Query),
            "oauth" => Ok(AuthMode::OAuth),
            other => Err(AuthError::InvalidSigningInput(format!(
                "unknown auth type: {other}"
            ))),
        }
    }
}

/// 署名に使う認証素材
#[derive(Debug, Clone)]
pub enum AuthMaterial {
    Aws(Credentials),
    Bearer(String),
}

/// AgentCore Runtime の ARN
///
/// `arn:<partition>:bedrock-agentcore:<region>:<account>:runtime/<id>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeArn {
    raw: String,
    region: String,
    account_id: String,
    runtime_id: String,
}

impl RuntimeArn {
    /// ランタイム ID とアカウント ID から ARN を組み立てる
    pub fn from_id(runtime_id: &str, region: &str, account_id: &str) -> Result<Self, AuthError> {
        format!("arn:aws:{}:{region}:{account_id}:runtime/{runtime_id}", sigv4::SERVICE).parse()
    }

    /// ARN もしくはランタイム ID を解決する
    ///
    /// `arn:` で始まらない入力はランタイム ID とみなし、`account_id` が必要。
    pub fn resolve(input: &str, region: &str, account_id: Option<&str>) -> Result<Self, AuthError> {
        if input.starts_with("arn:") {
            return input.parse();
        }
        match account_id {
            Some(account) if !account.is_empty() => Self::from_id(input, region, account),
            _ => Err(AuthError::InvalidRuntimeArn(format!(
                "{input} is not an ARN and ACCOUNT_ID is not set"
            ))),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn runtime_id(&self) -> &str {
        &self.runtime_id
    }
}

impl FromStr for RuntimeArn {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| AuthError::InvalidRuntimeArn(format!("{s}: {reason}"));

        let parts: Vec<&str> = s.splitn(6, ':').collect();
        if parts.len() != 6 || parts[0] != "arn" {
            return Err(invalid("expected arn:<partition>:<service>:<region>:<account>:<resource>"));
        }
        if parts[2] != sigv4::SERVICE {
            return Err(invalid("service must be bedrock-agentcore"));
        }
        if parts[3].is_empty() || parts[4].is_empty() {
            return Err(invalid("region and account are required"));
        }
        let runtime_id = parts[5]
            .strip_prefix("runtime/")
            .filter(|id| !id.is_empty())
            .ok_or_else(|| invalid("resource must be runtime/<id>"))?;

        Ok(Self {
            raw: s.to_string(),
            region: parts[3].to_string(),
            account_id: parts[4].to_string(),
            runtime_id: runtime_id.to_string(),
        })
    }
}

impl fmt::Display for RuntimeArn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// ランタイムの WebSocket エンドポイント URL を組み立てる
///
/// ARN はパスセグメントとして完全に URL エンコードされる。
pub fn runtime_ws_url(region: &str, arn: &RuntimeArn, qualifier: &str) -> Result<Url, AuthError> {
    let mut url = Url::parse(&format!(
        "wss://bedrock-agentcore.{region}.amazonaws.com/runtimes/{}/ws",
        sigv4::uri_encode(arn.as_str(), true)
    ))?;
    url.query_pairs_mut().append_pair("qualifier", qualifier);
    Ok(url)
}

/// 50 文字の英数字セッション ID を生成する
pub fn generate_session_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SESSION_ID_LEN)
        .map(char::from)
        .collect()
}

/// 署名済みの接続記述子
///
/// 一度署名したら変更できない。
#[derive(Clone)]
pub struct ConnectionDescriptor {
    runtime_arn: RuntimeArn,
    region: String,
    auth_mode: AuthMode,
    url: Url,
    headers: Vec<(String, String)>,
    session_id: String,
    signed_at: DateTime<Utc>,
}

impl ConnectionDescriptor {
    pub fn runtime_arn(&self) -> &RuntimeArn {
        &self.runtime_arn
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn auth_mode(&self) -> AuthMode {
        self.auth_mode
    }

    /// 接続先 URL（クエリ署名の場合は署名済み）
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// アップグレード要求に追加するヘッダ
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn signed_at(&self) -> DateTime<Utc> {
        self.signed_at
    }
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let headers: Vec<(&str, &str)> = self
            .headers
            .iter()
            .map(|(n, v)| {
                if n.eq_ignore_ascii_case("authorization")
                    || n.eq_ignore_ascii_case("x-amz-security-token")
                {
                    (n.as_str(), "** redacted **")
                } else {
                    (n.as_str(), v.as_str())
                }
            })
            .collect();
        let mut url = self.url.clone();
        if url.query_pairs().any(|(k, _)| k == "X-Amz-Security-Token") {
            url.set_query(Some("** redacted **"));
        }
        f.debug_struct("ConnectionDescriptor")
            .field("runtime_arn", &self.runtime_arn.as_str())
            .field("region", &self.region)
            .field("auth_mode", &self.auth_mode)
            .field("url", &url.as_str())
            .field("headers", &headers)
            .field("session_id", &self.session_id)
            .field("signed_at", &self.signed_at)
            .finish()
    }
}

/// 接続記述子のビルダー
#[derive(Debug, Clone)]
pub struct ConnectionBuilder {
    runtime_arn: RuntimeArn,
    region: String,
    auth_mode: AuthMode,
    session_id: Option<String>,
    qualifier: String,
    presign_expires_secs: u64,
    endpoint: Option<Url>,
}

impl ConnectionBuilder {
    /// ARN のリージョンを既定値として新しいビルダーを作成する
    pub fn new(runtime_arn: RuntimeArn) -> Self {
        Self {
            region: runtime_arn.region().to_string(),
            runtime_arn,
            auth_mode: AuthMode::default(),
            session_id: None,
            qualifier: DEFAULT_QUALIFIER.to_string(),
            presign_expires_secs: DEFAULT_PRESIGN_EXPIRES_SECS,
            endpoint: None,
        }
    }

    pub fn region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn auth_mode(mut self, mode: AuthMode) -> Self {
        self.auth_mode = mode;
        self
    }

    pub fn session_id(mut self, session_id: Option<String>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn qualifier(mut self, qualifier: impl Into<String>) -> Self {
        self.qualifier = qualifier.into();
        self
    }

    pub fn presign_expires_secs(mut self, secs: u64) -> Self {
        self.presign_expires_secs = secs;
        self
    }

    /// 接続先を上書きする（ローカルで動かすエージェント向け）
    pub fn endpoint(mut self, endpoint: Url) -> Self {
        self.endpoint = Some(endpoint);
        self
    }

    /// 現在時刻で署名する
    pub fn build(self, material: &AuthMaterial) -> Result<ConnectionDescriptor, AuthError> {
        self.build_at(material, Utc::now())
    }

    /// 指定時刻で署名し、接続記述子を作成する
    ///
    /// # Errors
    /// * 認証方式と認証素材が一致しない場合は `AuthError::AuthModeMismatch`
    /// * OAuth でトークンが空の場合は `AuthError::MissingBearerToken`
    /// * 署名入力が不正な場合は `AuthError::InvalidSigningInput` など
    pub fn build_at(
        self,
        material: &AuthMaterial,
        now: DateTime<Utc>,
    ) -> Result<ConnectionDescriptor, AuthError> {
        let session_id = match self.session_id {
            Some(id) if id.is_empty() => {
                return Err(AuthError::InvalidSigningInput(
                    "session id is empty".to_string(),
                ));
            }
            Some(id) => id,
            None => generate_session_id(),
        };

        let base_url = match self.endpoint {
            Some(endpoint) => endpoint,
            None => runtime_ws_url(&self.region, &self.runtime_arn, &self.qualifier)?,
        };

        let (url, mut headers) = match (self.auth_mode, material) {
            (AuthMode::Headers, AuthMaterial::Aws(credentials)) => {
                let params = SigningParams {
                    credentials,
                    region: &self.region,
                    service: sigv4::SERVICE,
                    time: now,
                };
                let signed = sigv4::sign_headers("GET", &base_url, &params)?;
                (base_url, signed.headers)
            }
            (AuthMode::Query, AuthMaterial::Aws(credentials)) => {
                let params = SigningParams {
                    credentials,
                    region: &self.region,
                    service: sigv4::SERVICE,
                    time: now,
                };
                let url = sigv4::presign_url(&base_url, &params, self.presign_expires_secs)?;
                (url, Vec::new())
            }
            (AuthMode::OAuth, AuthMaterial::Bearer(token)) => {
                if token.is_empty() {
                    return Err(AuthError::MissingBearerToken);
                }
                (
                    base_url,
                    vec![("Authorization".to_string(), format!("Bearer {token}"))],
                )
            }
            (mode, _) => return Err(AuthError::AuthModeMismatch(mode.to_string())),
        };

        let user_agent = match self.auth_mode {
            AuthMode::OAuth => OAUTH_USER_AGENT,
            AuthMode::Headers | AuthMode::Query => SIGV4_USER_AGENT,
        };
        headers.push((SESSION_ID_HEADER.to_string(), session_id.clone()));
        headers.push(("User-Agent".to_string(), user_agent.to_string()));

        tracing::debug!(
            mode = %self.auth_mode,
            url = %url.host_str().unwrap_or_default(),
            session = %session_id,
            "Prepared runtime connection"
        );

        Ok(ConnectionDescriptor {
            runtime_arn: self.runtime_arn,
            region: self.region,
            auth_mode: self.auth_mode,
            url,
            headers,
            session_id,
            signed_at: now,
        })
    }
}
