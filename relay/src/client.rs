use auth::ConnectionDescriptor;
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{self, handshake::client::Request};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tools::ToolRegistry;

use crate::error::RelayError;
use crate::session::{CloseReason, LocalInput, LocalOutput, RelayOptions, SessionRelay};

/// 既定の接続待ち時間
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(130);

/// 既定のエコー応答待ち時間
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// 接続済みのリレー
///
/// `connect` でハンドシェイクまで済ませ、`run` で中継を開始する。
pub struct RelayConnection {
    socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    relay: SessionRelay,
    session_id: String,
}

impl RelayConnection {
    /// 接続記述子に従って WebSocket を開く
    ///
    /// # Arguments
    /// * `descriptor` - 署名済みの URL とヘッダー
    /// * `tools` - ローカルで処理するツール
    /// * `options` - 再生・キープアライブの設定
    /// * `open_timeout` - ハンドシェイク完了までの待ち時間
    ///
    /// # Errors
    /// ハンドシェイクが拒否された場合は `RelayError::HandshakeRejected`、
    /// 時間内に応答がない場合は `RelayError::ConnectTimeout`
    pub async fn connect(
        descriptor: &ConnectionDescriptor,
        tools: ToolRegistry,
        options: RelayOptions,
        open_timeout: Duration,
    ) -> Result<Self, RelayError> {
        let mut relay = SessionRelay::new(tools, options);
        let request = build_request(descriptor)?;

        tracing::info!(
            url = %redacted_url(descriptor),
            session_id = %descriptor.session_id(),
            auth_mode = %descriptor.auth_mode(),
            "Connecting to agent runtime"
        );

        let handshake = tokio_tungstenite::connect_async(request);
        let (socket, response) = match tokio::time::timeout(open_timeout, handshake).await {
            Err(_) => return Err(RelayError::ConnectTimeout(open_timeout)),
            Ok(Err(tungstenite::Error::Http(response))) => {
                let status = response.status().as_u16();
                let body = response
                    .body()
                    .as_deref()
                    .map(String::from_utf8_lossy)
                    .unwrap_or_default()
                    .into_owned();
                tracing::error!(status, body = %body, "WebSocket handshake rejected");
                return Err(RelayError::HandshakeRejected { status, body });
            }
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(connected)) => connected,
        };

        tracing::info!(status = %response.status(), "WebSocket connection established");
        relay.mark_open()?;

        Ok(Self {
            socket,
            relay,
            session_id: descriptor.session_id().to_string(),
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn relay(&self) -> &SessionRelay {
        &self.relay
    }

    /// 中継を実行し、終了理由を返す
    pub async fn run(
        mut self,
        mut local_rx: mpsc::Receiver<LocalInput>,
        local_tx: mpsc::Sender<LocalOutput>,
    ) -> Result<CloseReason, RelayError> {
        self.relay.run(self.socket, &mut local_rx, &local_tx).await
    }
}

fn build_request(descriptor: &ConnectionDescriptor) -> Result<Request, RelayError> {
    let mut request = descriptor.url().as_str().into_client_request()?;
    let headers = request.headers_mut();
    for (name, value) in descriptor.headers() {
        let header_name =
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| RelayError::InvalidHeader {
                name: name.clone(),
                reason: e.to_string(),
            })?;
        let header_value = HeaderValue::from_str(value).map_err(|e| RelayError::InvalidHeader {
            name: name.clone(),
            reason: e.to_string(),
        })?;
        headers.insert(header_name, header_value);
    }
    Ok(request)
}

/// 署名パラメーターを含まない URL（ログ出力用）
fn redacted_url(descriptor: &ConnectionDescriptor) -> String {
    let url = descriptor.url();
    format!(
        "{}://{}{}",
        url.scheme(),
        url.host_str().unwrap_or_default(),
        url.path()
    )
}

/// エコーエージェントへの疎通確認
///
/// ペイロードを送り、最初に返ってきたテキストフレームが同じ内容かを確かめる。
/// JSON として比較するため、キーの順序や空白の違いは無視する。
///
/// # Returns
/// 応答が一致した場合は `true`、異なる内容の場合は `false`
///
/// # Errors
/// 応答前に接続が閉じられた場合は `RelayError::ClosedBeforeReply`、
/// 時間内に応答がない場合は `RelayError::ReplyTimeout`
pub async fn echo_check(
    descriptor: &ConnectionDescriptor,
    payload: &Value,
    open_timeout: Duration,
    reply_timeout: Duration,
) -> Result<bool, RelayError> {
    let connection = RelayConnection::connect(
        descriptor,
        ToolRegistry::new(),
        RelayOptions::default(),
        open_timeout,
    )
    .await?;

    let (input_tx, input_rx) = mpsc::channel(16);
    let (output_tx, mut output_rx) = mpsc::channel(16);
    let sent = serde_json::to_string(payload)?;
    tracing::info!(payload = %sent, "Sending echo payload");

    let exchange = async move {
        input_tx
            .send(LocalInput::Text(sent))
            .await
            .map_err(|_| RelayError::LocalClosed)?;
        loop {
            match tokio::time::timeout(reply_timeout, output_rx.recv()).await {
                Err(_) => return Err(RelayError::ReplyTimeout(reply_timeout)),
                Ok(Some(LocalOutput::Text(text))) => return Ok(Some(text)),
                Ok(Some(LocalOutput::Closed(_))) | Ok(None) => return Ok(None),
                Ok(Some(_)) => continue,
            }
        }
    };

    let (relay_result, reply) = tokio::join!(connection.run(input_rx, output_tx), exchange);
    if let Err(e) = relay_result {
        tracing::debug!(error = %e, "Relay ended with error after echo exchange");
    }

    let Some(reply) = reply? else {
        tracing::warn!("Connection closed before an echo reply arrived");
        return Err(RelayError::ClosedBeforeReply);
    };
    tracing::info!(reply = %reply, "Received echo reply");

    let matched = match serde_json::from_str::<Value>(&reply) {
        Ok(value) => &value == payload,
        Err(_) => false,
    };
    Ok(matched)
}
