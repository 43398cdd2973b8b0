pub mod connection;
pub mod credentials;
pub mod error;
pub mod sigv4;

pub use connection::{
    AuthMaterial, AuthMode, ConnectionBuilder, ConnectionDescriptor, RuntimeArn,
    SESSION_ID_HEADER, generate_session_id, runtime_ws_url,
};
pub use credentials::{AwsContext, Credentials, load_aws_context, resolve_region};
pub use error::AuthError;
pub use sigv4::{SignedHeaders, SigningParams, presign_url, sign_headers};
