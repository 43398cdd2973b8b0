use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_tungstenite::tungstenite::{self, Message};

use crate::error::RelayError;

/// 受け取ったフレームをそのまま返すエコーエージェント
///
/// テキスト・バイナリとも内容を変えずに送り返す。接続ごとにタスクを起動する。
pub struct EchoServer {
    listener: TcpListener,
}

impl EchoServer {
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.listener.local_addr()?)
    }

    /// 接続の受け付けを続ける（エラーで終了するまで戻らない）
    pub async fn serve(self) -> Result<(), RelayError> {
        tracing::info!(addr = %self.local_addr()?, "Echo agent listening");
        loop {
            let (stream, peer) = self.listener.accept().await?;
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer).await {
                    tracing::warn!(peer = %peer, error = %e, "Echo connection ended with error");
                }
            });
        }
    }
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr) -> Result<(), tungstenite::Error> {
    let mut socket = tokio_tungstenite::accept_async(stream).await?;
    tracing::info!(peer = %peer, "Echo client connected");

    while let Some(message) = socket.next().await {
        match message? {
            Message::Text(text) => {
                tracing::debug!(peer = %peer, len = text.len(), "Echoing text frame");
                socket.send(Message::Text(text)).await?;
            }
            Message::Binary(data) => {
                tracing::debug!(peer = %peer, len = data.len(), "Echoing binary frame");
                socket.send(Message::Binary(data)).await?;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    tracing::info!(peer = %peer, "Echo client disconnected");
    Ok(())
}
