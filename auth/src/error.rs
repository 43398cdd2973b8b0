/// 接続認証のエラー型
#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("Missing credentials: {0}")]
    MissingCredentials(String),

    #[error("BEARER_TOKEN environment variable required for OAuth")]
    MissingBearerToken,

    #[error("Invalid signing input: {0}")]
    InvalidSigningInput(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Invalid runtime ARN: {0}")]
    InvalidRuntimeArn(String),

    #[error("Auth material does not match auth mode {0}")]
    AuthModeMismatch(String),
}

impl From<url::ParseError> for AuthError {
    fn from(e: url::ParseError) -> Self {
        AuthError::InvalidUrl(e.to_string())
    }
}
