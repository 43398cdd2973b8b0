use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::{self, Message};
use tools::ToolRegistry;

use crate::envelope::{Envelope, ToolInvocation, ToolOutcome, sonic_tool_result_events};
use crate::error::RelayError;
use crate::playback::{Frame, FrameKind, Playback};

/// セッションの状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    Closed,
}

/// ローカル側からリレーへの入力
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalInput {
    Text(String),
    Binary(Vec<u8>),
    /// バージイン（再生中の出力を打ち切って新しいターンを開始する）
    Interrupt,
}

/// リレーからローカル側への出力
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalOutput {
    Text(String),
    Binary(Vec<u8>),
    TurnStarted {
        turn: u64,
        dropped: usize,
    },
    ToolDispatched {
        name: String,
        tool_use_id: String,
        success: bool,
    },
    Closed(CloseReason),
}

impl From<Frame> for LocalOutput {
    fn from(frame: Frame) -> Self {
        match frame {
            Frame::Text(text) => LocalOutput::Text(text),
            Frame::Binary(data) => LocalOutput::Binary(data),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// リモートからのクローズフレーム、またはストリーム終端
    RemoteClosed,
    /// ローカル入力の終端
    LocalEof,
}

#[derive(Debug, Clone, Default)]
pub struct RelayOptions {
    /// ローカルへの出力を 1 フレームずつ送る間隔（リアルタイム再生の模擬）
    pub playback_interval: Option<Duration>,
    /// キープアライブの ping 間隔
    pub ping_interval: Option<Duration>,
}

/// 1 本の WebSocket 接続を中継するリレー
///
/// ローカル入力を JSON エンベロープとして解析し、既知のツール呼び出しは
/// ローカルで実行して結果を送る。それ以外はそのまま転送する。
/// リモートからのフレームは変更せずにローカルへ渡す。
pub struct SessionRelay {
    state: SessionState,
    tools: ToolRegistry,
    options: RelayOptions,
    playback: Playback,
    pending_remote_tools: Vec<ToolInvocation>,
}

impl SessionRelay {
    pub fn new(tools: ToolRegistry, options: RelayOptions) -> Self {
        Self {
            state: SessionState::Connecting,
            tools,
            options,
            playback: Playback::new(),
            pending_remote_tools: Vec::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// 現在のターン番号（バージインごとに 1 増える）
    pub fn turn(&self) -> u64 {
        self.playback.turn()
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// ハンドシェイク完了を記録する（CONNECTING → OPEN）
    pub fn mark_open(&mut self) -> Result<(), RelayError> {
        self.expect_state(SessionState::Connecting)?;
        self.state = SessionState::Open;
        Ok(())
    }

    fn expect_state(&self, expected: SessionState) -> Result<(), RelayError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(RelayError::InvalidState {
                expected,
                found: self.state,
            })
        }
    }

    /// 中継ループを実行する（OPEN → CLOSED）
    ///
    /// リモートのクローズ、ローカル入力の終端、またはエラーで終了する。
    /// 終了時は MCP ツールサーバーも切断する。
    ///
    /// # Arguments
    /// * `remote` - リモートエージェントとの WebSocket
    /// * `local_rx` - ローカル側からの入力
    /// * `local_tx` - ローカル側への出力
    pub async fn run<S>(
        &mut self,
        remote: S,
        local_rx: &mut mpsc::Receiver<LocalInput>,
        local_tx: &mpsc::Sender<LocalOutput>,
    ) -> Result<CloseReason, RelayError>
    where
        S: Stream<Item = Result<Message, tungstenite::Error>>
            + Sink<Message, Error = tungstenite::Error>
            + Unpin,
    {
        self.expect_state(SessionState::Open)?;

        let (mut sink, mut stream) = remote.split();
        let result = self.pump(&mut sink, &mut stream, local_rx, local_tx).await;
        self.state = SessionState::Closed;

        if let Err(e) = sink.close().await {
            tracing::debug!(error = %e, "WebSocket already closed");
        }
        if let Err(e) = self.tools.shutdown().await {
            tracing::warn!(error = %e, "Failed to disconnect MCP tool server");
        }

        match &result {
            Ok(reason) => {
                tracing::info!(reason = ?reason, "Session closed");
                let _ = local_tx.send(LocalOutput::Closed(*reason)).await;
            }
            Err(e) => tracing::error!(error = %e, "Session ended with error"),
        }
        result
    }

    async fn pump<K, T>(
        &mut self,
        sink: &mut K,
        stream: &mut T,
        local_rx: &mut mpsc::Receiver<LocalInput>,
        local_tx: &mpsc::Sender<LocalOutput>,
    ) -> Result<CloseReason, RelayError>
    where
        K: Sink<Message, Error = tungstenite::Error> + Unpin,
        T: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        let mut pace = self.options.playback_interval.map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let mut keepalive = self.options.ping_interval.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        let reason = loop {
            tokio::select! {
                biased;

                input = local_rx.recv() => match input {
                    Some(LocalInput::Interrupt) => self.barge_in(local_tx, true).await?,
                    Some(LocalInput::Text(text)) => {
                        self.handle_local_text(text, sink, local_tx).await?
                    }
                    Some(LocalInput::Binary(data)) => {
                        sink.send(Message::Binary(data.into())).await?
                    }
                    None => {
                        tracing::info!("Local input ended, closing WebSocket");
                        if let Err(e) = sink.send(Message::Close(None)).await {
                            tracing::debug!(error = %e, "Failed to send close frame");
                        }
                        break CloseReason::LocalEof;
                    }
                },

                _ = playback_slot(&mut pace), if !self.playback.is_empty() => {
                    if let Some(frame) = self.playback.pop() {
                        local_tx
                            .send(frame.into())
                            .await
                            .map_err(|_| RelayError::LocalClosed)?;
                    }
                }

                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        self.handle_remote_text(text.as_str(), sink, local_tx).await?
                    }
                    Some(Ok(Message::Binary(data))) => {
                        self.playback.push(Frame::Binary(data.to_vec()), FrameKind::Other);
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(frame = ?frame, "Remote closed the WebSocket");
                        break CloseReason::RemoteClosed;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => break CloseReason::RemoteClosed,
                },

                _ = keepalive_tick(&mut keepalive) => {
                    sink.send(Message::Ping(Default::default())).await?;
                }
            }
        };

        // リモート終了時は受信済みの出力を最後まで渡す
        if reason == CloseReason::RemoteClosed {
            for frame in self.playback.drain() {
                local_tx
                    .send(frame.into())
                    .await
                    .map_err(|_| RelayError::LocalClosed)?;
            }
        }
        Ok(reason)
    }

    async fn handle_local_text<K>(
        &mut self,
        text: String,
        sink: &mut K,
        local_tx: &mpsc::Sender<LocalOutput>,
    ) -> Result<(), RelayError>
    where
        K: Sink<Message, Error = tungstenite::Error> + Unpin,
    {
        let envelope = Envelope::parse(&text).map_err(|e| RelayError::InvalidFrame(e.to_string()))?;

        let invocations: Vec<ToolInvocation> = envelope
            .tool_invocations()
            .into_iter()
            .filter(|invocation| self.tools.is_known(&invocation.name))
            .collect();

        if invocations.is_empty() {
            sink.send(Message::Text(text.into())).await?;
            return Ok(());
        }

        let outcomes = self.dispatch(invocations, local_tx).await?;
        for frame in envelope.tool_result_frames(&outcomes)? {
            sink.send(Message::Text(frame.into())).await?;
        }
        Ok(())
    }

    async fn handle_remote_text<K>(
        &mut self,
        text: &str,
        sink: &mut K,
        local_tx: &mpsc::Sender<LocalOutput>,
    ) -> Result<(), RelayError>
    where
        K: Sink<Message, Error = tungstenite::Error> + Unpin,
    {
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!(error = %e, "Forwarding non-JSON frame from remote");
                self.playback.push(Frame::Text(text.to_string()), FrameKind::Other);
                return Ok(());
            }
        };

        let kind = if envelope.is_interruption() {
            // ローカルで既にバージイン済みならターンは進めない
            if !self.playback.is_suppressing() {
                self.barge_in(local_tx, false).await?;
            }
            FrameKind::Boundary
        } else if envelope.is_output() {
            FrameKind::Output
        } else if envelope.starts_new_output() {
            FrameKind::Boundary
        } else {
            FrameKind::Other
        };

        if !self.playback.push(Frame::Text(text.to_string()), kind) {
            tracing::trace!(turn = self.playback.turn(), "Dropped output of interrupted turn");
        }

        if let Some(invocation) = envelope.sonic_tool_use()
            && self.tools.is_known(&invocation.name)
        {
            self.pending_remote_tools.push(invocation);
        }

        if envelope.ends_tool_content() && !self.pending_remote_tools.is_empty() {
            let pending = std::mem::take(&mut self.pending_remote_tools);
            let outcomes = self.dispatch(pending, local_tx).await?;
            for outcome in &outcomes {
                let content_name = uuid::Uuid::new_v4().to_string();
                for event in sonic_tool_result_events(outcome, &content_name) {
                    sink.send(Message::Text(event.to_string().into())).await?;
                }
            }
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        invocations: Vec<ToolInvocation>,
        local_tx: &mpsc::Sender<LocalOutput>,
    ) -> Result<Vec<ToolOutcome>, RelayError> {
        let mut outcomes = Vec::with_capacity(invocations.len());
        for invocation in invocations {
            let result = self
                .tools
                .call(&invocation.name, invocation.input.clone())
                .await
                .map_err(|e| e.to_string());

            match &result {
                Ok(_) => tracing::info!(
                    tool = %invocation.name,
                    tool_use_id = %invocation.tool_use_id,
                    "Tool invocation handled locally"
                ),
                Err(e) => tracing::warn!(
                    tool = %invocation.name,
                    tool_use_id = %invocation.tool_use_id,
                    error = %e,
                    "Tool invocation failed"
                ),
            }

            local_tx
                .send(LocalOutput::ToolDispatched {
                    name: invocation.name.clone(),
                    tool_use_id: invocation.tool_use_id.clone(),
                    success: result.is_ok(),
                })
                .await
                .map_err(|_| RelayError::LocalClosed)?;

            outcomes.push(ToolOutcome { invocation, result });
        }
        Ok(outcomes)
    }

    async fn barge_in(
        &mut self,
        local_tx: &mpsc::Sender<LocalOutput>,
        suppress: bool,
    ) -> Result<(), RelayError> {
        let dropped = self.playback.interrupt(suppress);
        let turn = self.playback.turn();
        tracing::info!(turn, dropped, "Barge-in: playback interrupted");
        local_tx
            .send(LocalOutput::TurnStarted { turn, dropped })
            .await
            .map_err(|_| RelayError::LocalClosed)
    }
}

async fn playback_slot(pace: &mut Option<Interval>) {
    if let Some(interval) = pace {
        interval.tick().await;
    }
}

async fn keepalive_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
