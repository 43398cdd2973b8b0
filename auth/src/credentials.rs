use aws_config::meta::region::RegionProviderChain;
use aws_config::{self, BehaviorVersion};
use aws_credential_types::provider::ProvideCredentials;
use std::fmt;

use crate::error::AuthError;

/// リージョンが解決できなかった場合のフォールバック
pub const DEFAULT_REGION: &str = "us-east-1";

/// 署名に使う AWS 認証情報
///
/// シークレットとセッショントークンは `Debug` 出力に含めない。
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl Credentials {
    pub fn new(
        access_key_id: impl Into<String>,
        secret_access_key: impl Into<String>,
        session_token: Option<String>,
    ) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token,
        }
    }

    pub fn access_key_id(&self) -> &str {
        &self.access_key_id
    }

    pub fn secret_access_key(&self) -> &str {
        &self.secret_access_key
    }

    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"** redacted **")
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "** redacted **"),
            )
            .finish()
    }
}

impl From<aws_credential_types::Credentials> for Credentials {
    fn from(creds: aws_credential_types::Credentials) -> Self {
        Self::new(
            creds.access_key_id(),
            creds.secret_access_key(),
            creds.session_token().map(str::to_string),
        )
    }
}

/// 解決済みの認証情報とリージョン
#[derive(Debug, Clone)]
pub struct AwsContext {
    pub credentials: Credentials,
    pub region: String,
}

fn region_chain(region: Option<String>) -> RegionProviderChain {
    RegionProviderChain::first_try(region.map(aws_config::Region::new))
        .or_default_provider()
        .or_else(aws_config::Region::new(DEFAULT_REGION))
}

/// リージョンだけを解決する
///
/// 指定がなければ SDK のデフォルトチェーン（`AWS_REGION`、プロファイル）、
/// それも無ければ us-east-1 を使用する。
pub async fn resolve_region(region: Option<String>) -> String {
    region_chain(region)
        .region()
        .await
        .map(|r| r.as_ref().to_string())
        .unwrap_or_else(|| DEFAULT_REGION.to_string())
}

/// SDK のデフォルトプロバイダチェーンから認証情報とリージョンを読み込む
///
/// # Arguments
/// * `profile` - 使用する AWS プロファイル名（オプション）
/// * `region` - リージョン（オプション）
///
/// # Errors
/// 認証情報プロバイダが存在しない、または認証情報の取得に失敗した場合は
/// `AuthError::MissingCredentials`
pub async fn load_aws_context(
    profile: Option<&str>,
    region: Option<String>,
) -> Result<AwsContext, AuthError> {
    let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(region_chain(region));
    if let Some(profile) = profile {
        loader = loader.profile_name(profile);
    }
    let config = loader.load().await;

    let region = config
        .region()
        .map(|r| r.as_ref().to_string())
        .unwrap_or_else(|| DEFAULT_REGION.to_string());

    let provider = config.credentials_provider().ok_or_else(|| {
        AuthError::MissingCredentials("no credentials provider configured".to_string())
    })?;
    let credentials = provider
        .provide_credentials()
        .await
        .map_err(|e| AuthError::MissingCredentials(e.to_string()))?;

    tracing::debug!(region = %region, "Loaded AWS credentials");

    Ok(AwsContext {
        credentials: credentials.into(),
        region,
    })
}
