use anyhow::Context;
use auth::{AuthMaterial, AuthMode, ConnectionBuilder, ConnectionDescriptor, RuntimeArn};
use clap::{Args, Parser, Subcommand};
use relay::{
    CloseReason, ConversationMessage, DEFAULT_REPLY_TIMEOUT, EchoServer, Envelope, LocalInput,
    LocalOutput, RelayConfig, RelayConnection, RelayError, echo_check,
};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use serde_json::{Value, json};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinError;
use tools::{McpClient, ToolRegistry};
use url::Url;

// UI関連の設定
const USER_NAME: &str = "User";
const AGENT_NAME: &str = "Agent";
const INTERRUPT_COMMAND: &str = "/interrupt";
const DEFAULT_ECHO_MESSAGE: &str = "Hello, World! Echo Test";

// CLIの引数構造体定義
#[derive(Parser)]
#[command(name = "relay-cli")]
#[command(about = "WebSocket relay for Bedrock AgentCore runtimes", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// 接続先と認証方式の指定
#[derive(Args, Debug)]
struct TargetArgs {
    /// エージェントランタイムの ARN（ACCOUNT_ID があればランタイム ID でも可）
    #[arg(long, env = "AGENT_ARN")]
    runtime_arn: String,

    /// 認証方式 (headers | query | oauth)
    #[arg(long, default_value = "headers")]
    auth_type: AuthMode,

    /// セッション ID (オプション: 省略時は自動生成)
    #[arg(long)]
    session_id: Option<String>,

    /// 使用するAWSプロファイル名
    #[arg(long)]
    aws_profile: Option<String>,

    /// リージョン (オプション: デフォルトは設定ファイル、プロファイル設定またはus-east-1)
    #[arg(long)]
    region: Option<String>,

    /// 接続先 URL の上書き（ローカルのエージェント向け）
    #[arg(long)]
    endpoint: Option<Url>,

    /// 設定ファイルのパス
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// エコーエージェントとの疎通を確認します
    Echo {
        #[command(flatten)]
        target: TargetArgs,

        /// 送信するメッセージ（JSON または文字列）
        #[arg(long)]
        message: Option<String>,
    },

    /// 対話セッションを開始します
    Chat {
        #[command(flatten)]
        target: TargetArgs,

        /// 接続する MCP サーバー名（設定ファイルの mcpServers）
        #[arg(long)]
        mcp_server: Option<String>,

        /// 組み込みツールを無効にする
        #[arg(long)]
        no_builtin_tools: bool,
    },

    /// ローカルのエコーエージェントを起動します
    ServeEcho {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_cli=info,relay=info".into()),
        )
        .init();

    // 引数の解析
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Echo { target, message } => run_echo(target, message).await,
        Commands::Chat {
            target,
            mcp_server,
            no_builtin_tools,
        } => run_chat(target, mcp_server, no_builtin_tools)
            .await
            .map(|()| true),
        Commands::ServeEcho { host, port } => serve_echo(host, port).await.map(|()| true),
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            println!("[Error] {:#}", e);
            ExitCode::FAILURE
        }
    }
}

/// 設定ファイルと環境変数を読み込み、署名済みの接続記述子を作る
async fn prepare(target: &TargetArgs) -> anyhow::Result<(ConnectionDescriptor, RelayConfig)> {
    let config = match &target.config {
        Some(path) => RelayConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => RelayConfig::load_default()?,
    }
    .apply_env();

    let region =
        auth::resolve_region(target.region.clone().or_else(|| config.region.clone())).await;
    let runtime_arn =
        RuntimeArn::resolve(&target.runtime_arn, &region, config.account_id.as_deref())?;
    if runtime_arn.region() != region {
        tracing::warn!(
            configured = %region,
            arn_region = %runtime_arn.region(),
            "Region differs from the runtime ARN, using the ARN region"
        );
    }

    let material = match target.auth_type {
        AuthMode::OAuth => AuthMaterial::Bearer(
            std::env::var("BEARER_TOKEN").context("BEARER_TOKEN is required for oauth")?,
        ),
        AuthMode::Headers | AuthMode::Query => {
            let context =
                auth::load_aws_context(target.aws_profile.as_deref(), Some(region.clone())).await?;
            AuthMaterial::Aws(context.credentials)
        }
    };

    let mut builder = ConnectionBuilder::new(runtime_arn)
        .auth_mode(target.auth_type)
        .session_id(target.session_id.clone());
    if let Some(qualifier) = &config.qualifier {
        builder = builder.qualifier(qualifier.clone());
    }
    if let Some(secs) = config.presign_expires_secs {
        builder = builder.presign_expires_secs(secs);
    }
    if let Some(endpoint) = &target.endpoint {
        builder = builder.endpoint(endpoint.clone());
    }
    let descriptor = builder.build(&material)?;

    println!("Runtime ARN: {}", descriptor.runtime_arn());
    println!("Region: {}", descriptor.region());
    println!("Session ID: {}", descriptor.session_id());
    println!("Auth type: {}", descriptor.auth_mode());

    Ok((descriptor, config))
}

/// エコーエージェントとの疎通を確認する
///
/// # Returns
/// 応答が一致した場合は `true`
async fn run_echo(target: TargetArgs, message: Option<String>) -> anyhow::Result<bool> {
    let (descriptor, config) = prepare(&target).await?;

    let payload = match message {
        Some(message) => {
            serde_json::from_str(&message).unwrap_or_else(|_| json!({ "msg": message }))
        }
        None => json!({ "msg": DEFAULT_ECHO_MESSAGE }),
    };
    println!("Sending: {}", payload);

    match echo_check(&descriptor, &payload, config.open_timeout(), DEFAULT_REPLY_TIMEOUT).await {
        Ok(true) => {
            println!("Echo test PASSED");
            Ok(true)
        }
        Ok(false) => {
            println!("Echo test FAILED: reply did not match");
            Ok(false)
        }
        Err(RelayError::ClosedBeforeReply) => {
            println!("Echo test FAILED: connection closed before a reply");
            Ok(false)
        }
        Err(RelayError::HandshakeRejected { status, body }) => {
            println!("[Error] WebSocket handshake failed with status code: {}", status);
            println!("Response body: {}", body);
            println!("Echo test FAILED");
            Ok(false)
        }
        Err(e) => {
            println!("[Error] {}", e);
            println!("Echo test FAILED");
            Ok(false)
        }
    }
}

/// 対話セッションを実行する
///
/// 入力は専用スレッドの rustyline で受け付け、リレーの出力は別タスクで表示する。
/// リモートが閉じた場合やリレーがエラーで終わった場合は、入力待ちのまま終了する。
async fn run_chat(
    target: TargetArgs,
    mcp_server: Option<String>,
    no_builtin_tools: bool,
) -> anyhow::Result<()> {
    let (descriptor, config) = prepare(&target).await?;

    let mut tools = if no_builtin_tools || !config.builtin_tools {
        ToolRegistry::new()
    } else {
        ToolRegistry::with_builtins()
    };
    if let Some(name) = mcp_server {
        let server = config
            .mcp_server(&name)
            .with_context(|| format!("MCP server '{}' is not defined in the config", name))?;
        let client =
            McpClient::spawn(&server.command, &server.args, &server.env, server.cwd.as_deref())
                .await?;
        let count = tools.attach_mcp(client).await?;
        println!("Connected to MCP server '{}' ({} tools)", name, count);
    }
    println!("Local tools: {}", tools.tool_names().join(", "));

    let connection =
        RelayConnection::connect(&descriptor, tools, config.relay_options(), config.open_timeout())
            .await?;

    println!("+---------------------------------------------------------+");
    println!("| Session started. '{}' to barge in, 'exit' to stop. |", INTERRUPT_COMMAND);
    println!("+---------------------------------------------------------+");

    let (input_tx, input_rx) = mpsc::channel(32);
    let (output_tx, mut output_rx) = mpsc::channel(64);

    let relay_task = tokio::spawn(connection.run(input_rx, output_tx));
    let printer = tokio::spawn(async move {
        while let Some(output) = output_rx.recv().await {
            print_output(output);
        }
    });

    // readline はキャンセルできないので、ランタイムが終了を待たない OS スレッドで動かす
    let (reader_tx, reader_rx) = oneshot::channel();
    std::thread::spawn(move || {
        let _ = reader_tx.send(read_input(input_tx));
    });
    let reader = async move { reader_rx.await.context("Input thread stopped")? };

    let reason = finish_session(relay_task, reader).await;
    let _ = printer.await;
    let reason = reason?;
    tracing::info!(reason = ?reason, "Chat session finished");
    Ok(())
}

/// リレーと入力のどちらかが先に終わるまで待つ
///
/// リレーが先に終わった場合は入力の終了を待たずにその結果を返す。
/// 入力が先に終わった場合はリレーがクローズを済ませるまで待つ。
async fn finish_session<R, I>(relay: R, reader: I) -> anyhow::Result<CloseReason>
where
    R: Future<Output = Result<Result<CloseReason, RelayError>, JoinError>>,
    I: Future<Output = anyhow::Result<()>>,
{
    tokio::pin!(relay);
    tokio::select! {
        result = &mut relay => Ok(result??),
        read = reader => {
            read?;
            Ok(relay.await??)
        }
    }
}

/// ローカルのエコーエージェントを起動する（CTRL-C で停止）
async fn serve_echo(host: String, port: u16) -> anyhow::Result<()> {
    let server = EchoServer::bind((host.as_str(), port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", host, port))?;
    println!("Echo agent listening on ws://{}", server.local_addr()?);

    serve_until(server, async {
        let _ = tokio::signal::ctrl_c().await;
        println!("CTRL-C");
    })
    .await
}

async fn serve_until(
    server: EchoServer,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    tokio::select! {
        result = server.serve() => Ok(result?),
        () = shutdown => Ok(()),
    }
}

/// ユーザー入力をリレーへ送る（ブロッキング）
///
/// 入力チャネルを閉じるとリレーはクローズフレームを送って終了する。
fn read_input(input_tx: mpsc::Sender<LocalInput>) -> anyhow::Result<()> {
    let mut rl = DefaultEditor::new()?;

    loop {
        let readline = rl.readline(&format!("{} > ", USER_NAME));
        match readline {
            Ok(line) => {
                let input = line.trim();

                // 空入力はスキップ
                if input.is_empty() {
                    continue;
                }

                // 終了コマンドの処理
                if input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit") {
                    break;
                }

                let _ = rl.add_history_entry(input);

                let message = if input == INTERRUPT_COMMAND {
                    LocalInput::Interrupt
                } else if input.starts_with('{') {
                    if let Err(e) = serde_json::from_str::<Value>(input) {
                        println!("[Error] Invalid JSON: {}", e);
                        continue;
                    }
                    LocalInput::Text(input.to_string())
                } else {
                    let message =
                        ConversationMessage::user_text(input, uuid::Uuid::new_v4().to_string());
                    LocalInput::Text(serde_json::to_string(&message)?)
                };

                if input_tx.blocking_send(message).is_err() {
                    println!("[Info] Connection is already closed");
                    break;
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("CTRL-C");
                break;
            }
            Err(ReadlineError::Eof) => {
                println!("CTRL-D");
                break;
            }
            Err(err) => {
                println!("Error: {:?}", err);
                break;
            }
        }
    }

    Ok(())
}

fn print_output(output: LocalOutput) {
    match output {
        LocalOutput::Text(text) => {
            if let Some(line) = render_text(&text) {
                println!("{} > {}", AGENT_NAME, line);
            }
        }
        LocalOutput::Binary(data) => println!("{} > [binary {} bytes]", AGENT_NAME, data.len()),
        LocalOutput::TurnStarted { turn, dropped } => {
            println!("[Turn {}] interrupted, {} queued frames dropped", turn, dropped)
        }
        LocalOutput::ToolDispatched {
            name,
            tool_use_id,
            success,
        } => println!(
            "[Tool] {} ({}) {}",
            name,
            tool_use_id,
            if success { "succeeded" } else { "failed" }
        ),
        LocalOutput::Closed(reason) => println!("[Info] Connection closed ({:?})", reason),
    }
}

/// 表示用にフレームを整形する（音声データは表示しない）
fn render_text(text: &str) -> Option<String> {
    match Envelope::parse(text) {
        Ok(Envelope::Event { name, body }) => match name.as_str() {
            "textOutput" => body
                .get("content")
                .and_then(Value::as_str)
                .map(str::to_string),
            "audioOutput" => None,
            _ => Some(format!("[{}]", name)),
        },
        _ => Some(text.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_remote_close_ends_session_while_input_is_pending() {
        let relay = tokio::spawn(async { Ok::<_, RelayError>(CloseReason::RemoteClosed) });
        let reader = std::future::pending::<anyhow::Result<()>>();

        let reason = tokio::time::timeout(WAIT, finish_session(relay, reader))
            .await
            .expect("入力待ちのまま終了しない")
            .unwrap();
        assert_eq!(reason, CloseReason::RemoteClosed);
    }

    #[tokio::test]
    async fn test_relay_error_is_reported_while_input_is_pending() {
        let relay = tokio::spawn(async {
            Err::<CloseReason, _>(RelayError::InvalidFrame("not json".to_string()))
        });
        let reader = std::future::pending::<anyhow::Result<()>>();

        let result = tokio::time::timeout(WAIT, finish_session(relay, reader))
            .await
            .expect("入力待ちのまま終了しない");
        let err = result.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RelayError>(),
            Some(RelayError::InvalidFrame(_))
        ));
    }

    #[tokio::test]
    async fn test_local_eof_waits_for_relay_close() {
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let relay = tokio::spawn(async move {
            let _ = done_rx.await;
            Ok::<_, RelayError>(CloseReason::LocalEof)
        });
        let reader = async move {
            drop(done_tx);
            Ok(())
        };

        let reason = tokio::time::timeout(WAIT, finish_session(relay, reader))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, CloseReason::LocalEof);
    }

    #[tokio::test]
    async fn test_serve_echo_answers_until_shutdown() {
        let server = EchoServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let serving = tokio::spawn(serve_until(server, async {
            let _ = stop_rx.await;
        }));

        let endpoint = Url::parse(&format!("ws://{addr}/ws")).unwrap();
        let descriptor = ConnectionBuilder::new(
            "arn:aws:bedrock-agentcore:us-west-2:123456789012:runtime/echo_agent-abc123"
                .parse::<RuntimeArn>()
                .unwrap(),
        )
        .auth_mode(AuthMode::OAuth)
        .endpoint(endpoint)
        .build(&AuthMaterial::Bearer("test-token".to_string()))
        .unwrap();
        let payload = json!({ "msg": DEFAULT_ECHO_MESSAGE });
        assert!(echo_check(&descriptor, &payload, WAIT, WAIT).await.unwrap());

        stop_tx.send(()).unwrap();
        let result = tokio::time::timeout(WAIT, serving).await.unwrap().unwrap();
        assert!(result.is_ok());
    }
}
