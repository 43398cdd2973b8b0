//! リレーが扱う JSON エンベロープ
//!
//! 次の 3 形式を識別する。
//! - エコー: `{"msg": ...}`
//! - Sonic イベント: `{"event": {"<name>": {...}}}`（`{"body": "<json>"}` で包まれる場合もある）
//! - メッセージ: `{"role", "content": [...], "messageId"}`
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

/// Sonic の割り込み通知で `textOutput.content` に入る値
const INTERRUPTED_KEY: &str = "interrupted";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUseBlock {
    pub tool_use_id: String,
    pub name: String,
    #[serde(default)]
    pub input: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolResultStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResultBlock {
    pub tool_use_id: String,
    pub content: Vec<Value>,
    pub status: ToolResultStatus,
}

/// メッセージの構成要素
///
/// 未知の形式はそのまま保持する。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContentPart {
    Text(String),
    ToolUse(ToolUseBlock),
    ToolResult(ToolResultBlock),
    #[serde(untagged)]
    Other(Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMessage {
    pub role: String,
    pub content: Vec<ContentPart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    /// その他のトップレベルのフィールド（変更せずに保持する）
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ConversationMessage {
    /// テキスト 1 つだけのユーザーメッセージ
    pub fn user_text(text: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: vec![ContentPart::Text(text.into())],
            message_id: Some(message_id.into()),
            extra: Map::new(),
        }
    }
}

/// エンベロープから取り出したツール呼び出し
#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub tool_use_id: String,
    pub name: String,
    pub input: Value,
    /// Sonic イベント形式の場合の promptName
    pub prompt_name: Option<String>,
}

/// ツール実行の結果
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub invocation: ToolInvocation,
    pub result: Result<Value, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Echo(Value),
    Event { name: String, body: Value },
    Message(ConversationMessage),
    Other(Value),
}

impl Envelope {
    /// テキストフレームを JSON として解析し、形式を識別する
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(text)?;
        Ok(Self::classify(value))
    }

    fn classify(value: Value) -> Self {
        let map = match value {
            Value::Object(map) => map,
            other => return Envelope::Other(other),
        };

        if let Some(Value::String(body)) = map.get("body")
            && let Ok(inner) = serde_json::from_str::<Value>(body)
        {
            return Self::classify(inner);
        }

        if let Some(Value::Object(event)) = map.get("event")
            && event.len() == 1
            && let Some((name, body)) = event.iter().next()
        {
            return Envelope::Event {
                name: name.clone(),
                body: body.clone(),
            };
        }

        if map.contains_key("role")
            && map.contains_key("content")
            && let Ok(message) =
                serde_json::from_value::<ConversationMessage>(Value::Object(map.clone()))
        {
            return Envelope::Message(message);
        }

        if map.contains_key("msg") {
            return Envelope::Echo(Value::Object(map));
        }

        Envelope::Other(Value::Object(map))
    }

    pub fn event_name(&self) -> Option<&str> {
        match self {
            Envelope::Event { name, .. } => Some(name),
            _ => None,
        }
    }

    fn event_body(&self, event: &str) -> Option<&Value> {
        match self {
            Envelope::Event { name, body } if name == event => Some(body),
            _ => None,
        }
    }

    /// エンベロープに含まれるツール呼び出しをすべて返す
    pub fn tool_invocations(&self) -> Vec<ToolInvocation> {
        match self {
            Envelope::Message(message) => message
                .content
                .iter()
                .filter_map(|part| match part {
                    ContentPart::ToolUse(tool_use) => Some(ToolInvocation {
                        tool_use_id: tool_use.tool_use_id.clone(),
                        name: tool_use.name.clone(),
                        input: tool_use.input.clone(),
                        prompt_name: None,
                    }),
                    _ => None,
                })
                .collect(),
            Envelope::Event { .. } => self.sonic_tool_use().into_iter().collect(),
            Envelope::Echo(_) | Envelope::Other(_) => Vec::new(),
        }
    }

    /// Sonic の `toolUse` イベント
    pub fn sonic_tool_use(&self) -> Option<ToolInvocation> {
        let body = self.event_body("toolUse")?;
        let str_field = |key: &str| body.get(key).and_then(Value::as_str).map(str::to_string);
        Some(ToolInvocation {
            tool_use_id: str_field("toolUseId")?,
            name: str_field("toolName")?,
            input: body.get("content").cloned().unwrap_or(Value::Null),
            prompt_name: str_field("promptName"),
        })
    }

    /// ツール用コンテンツブロックの終了（`contentEnd` で `type: TOOL`）
    pub fn ends_tool_content(&self) -> bool {
        self.event_body("contentEnd")
            .and_then(|body| body.get("type"))
            .and_then(Value::as_str)
            == Some("TOOL")
    }

    /// リモートが送る割り込み通知か
    ///
    /// Sonic は `textOutput.content` に `{ "interrupted" : true }` を入れて通知する。
    pub fn is_interruption(&self) -> bool {
        self.event_body("textOutput")
            .and_then(|body| body.get("content"))
            .and_then(Value::as_str)
            .and_then(|content| serde_json::from_str::<Value>(content).ok())
            .and_then(|content| content.get(INTERRUPTED_KEY).and_then(Value::as_bool))
            == Some(true)
    }

    /// 再生対象の出力（音声・テキスト）イベントか
    pub fn is_output(&self) -> bool {
        matches!(self.event_name(), Some("audioOutput" | "textOutput"))
    }

    /// 新しい出力の開始、または応答の区切りとなるイベントか
    pub fn starts_new_output(&self) -> bool {
        matches!(
            self.event_name(),
            Some("contentStart" | "completionStart" | "completionEnd")
        )
    }

    /// ツール結果を差し込んだ送信フレームを組み立てる
    ///
    /// * メッセージ形式: 該当する `toolUse` を `toolResult` に置き換えた 1 フレーム
    /// * Sonic イベント形式: `contentStart` / `toolResult` / `contentEnd` の 3 フレーム
    pub fn tool_result_frames(
        &self,
        outcomes: &[ToolOutcome],
    ) -> Result<Vec<String>, serde_json::Error> {
        match self {
            Envelope::Message(message) => {
                let substituted = substitute_tool_results(message, outcomes);
                Ok(vec![serde_json::to_string(&substituted)?])
            }
            _ => outcomes
                .iter()
                .flat_map(|outcome| {
                    let content_name = uuid::Uuid::new_v4().to_string();
                    sonic_tool_result_events(outcome, &content_name)
                })
                .map(|event| serde_json::to_string(&event))
                .collect(),
        }
    }
}

/// `toolUse` を対応する `toolResult` に置き換える
pub fn substitute_tool_results(
    message: &ConversationMessage,
    outcomes: &[ToolOutcome],
) -> ConversationMessage {
    let content = message
        .content
        .iter()
        .map(|part| match part {
            ContentPart::ToolUse(tool_use) => outcomes
                .iter()
                .find(|o| o.invocation.tool_use_id == tool_use.tool_use_id)
                .map(|outcome| ContentPart::ToolResult(result_block(outcome)))
                .unwrap_or_else(|| part.clone()),
            other => other.clone(),
        })
        .collect();

    ConversationMessage {
        role: message.role.clone(),
        content,
        message_id: message.message_id.clone(),
        extra: message.extra.clone(),
    }
}

fn result_block(outcome: &ToolOutcome) -> ToolResultBlock {
    let (content, status) = match &outcome.result {
        Ok(value) => (vec![json!({ "json": value })], ToolResultStatus::Success),
        Err(message) => (vec![json!({ "text": message })], ToolResultStatus::Error),
    };
    ToolResultBlock {
        tool_use_id: outcome.invocation.tool_use_id.clone(),
        content,
        status,
    }
}

/// Sonic へツール結果を返すイベント列
pub fn sonic_tool_result_events(outcome: &ToolOutcome, content_name: &str) -> Vec<Value> {
    let prompt_name = outcome.invocation.prompt_name.clone().unwrap_or_default();
    let content = match &outcome.result {
        Ok(value) => value.to_string(),
        Err(message) => json!({ "error": message }).to_string(),
    };

    vec![
        json!({
            "event": {
                "contentStart": {
                    "promptName": prompt_name,
                    "contentName": content_name,
                    "interactive": false,
                    "type": "TOOL",
                    "role": "TOOL",
                    "toolResultInputConfiguration": {
                        "toolUseId": outcome.invocation.tool_use_id,
                        "type": "TEXT",
                        "textInputConfiguration": { "mediaType": "text/plain" }
                    }
                }
            }
        }),
        json!({
            "event": {
                "toolResult": {
                    "promptName": prompt_name,
                    "contentName": content_name,
                    "content": content
                }
            }
        }),
        json!({
            "event": {
                "contentEnd": {
                    "promptName": prompt_name,
                    "contentName": content_name
                }
            }
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(id: &str, result: Result<Value, String>) -> ToolOutcome {
        ToolOutcome {
            invocation: ToolInvocation {
                tool_use_id: id.to_string(),
                name: "getDateTool".to_string(),
                input: Value::Null,
                prompt_name: Some("prompt-1".to_string()),
            },
            result,
        }
    }

    #[test]
    fn test_classify_echo() {
        let envelope = Envelope::parse(r#"{"msg": "Hello, World! Echo Test"}"#).unwrap();
        assert!(matches!(envelope, Envelope::Echo(_)));
        assert!(envelope.tool_invocations().is_empty());
    }

    #[test]
    fn test_classify_event_and_wrapped_body() {
        let direct =
            Envelope::parse(r#"{"event": {"sessionStart": {"inferenceConfiguration": {}}}}"#)
                .unwrap();
        assert_eq!(direct.event_name(), Some("sessionStart"));

        let wrapped = Envelope::parse(
            r#"{"body": "{\"event\": {\"promptStart\": {\"promptName\": \"p\"}}}"}"#,
        )
        .unwrap();
        assert_eq!(wrapped.event_name(), Some("promptStart"));
    }

    #[test]
    fn test_classify_message_with_unknown_part() {
        let envelope = Envelope::parse(
            r#"{"role": "user", "content": [{"text": "hi"}, {"image": {"format": "png"}}], "messageId": "m1"}"#,
        )
        .unwrap();
        let Envelope::Message(message) = envelope else {
            panic!("メッセージとして識別されるべき");
        };
        assert_eq!(message.content[0], ContentPart::Text("hi".to_string()));
        assert!(matches!(message.content[1], ContentPart::Other(_)));
        assert_eq!(message.message_id.as_deref(), Some("m1"));
    }

    #[test]
    fn test_non_object_is_other() {
        assert!(matches!(Envelope::parse("[1, 2]").unwrap(), Envelope::Other(_)));
        assert!(Envelope::parse("not json").is_err());
    }

    #[test]
    fn test_message_tool_invocations() {
        let envelope = Envelope::parse(
            r#"{"role": "user", "messageId": "m2", "content": [
                {"text": "what day is it?"},
                {"toolUse": {"toolUseId": "t1", "name": "getDateTool", "input": {}}}
            ]}"#,
        )
        .unwrap();
        let invocations = envelope.tool_invocations();
        assert_eq!(invocations.len(), 1);
        assert_eq!(invocations[0].tool_use_id, "t1");
        assert_eq!(invocations[0].name, "getDateTool");
    }

    #[test]
    fn test_sonic_tool_use() {
        let envelope = Envelope::parse(
            r#"{"event": {"toolUse": {"promptName": "p1", "toolUseId": "t9", "toolName": "getDateTool", "content": "{}"}}}"#,
        )
        .unwrap();
        let invocation = envelope.sonic_tool_use().unwrap();
        assert_eq!(invocation.tool_use_id, "t9");
        assert_eq!(invocation.prompt_name.as_deref(), Some("p1"));
        assert_eq!(invocation.input, Value::String("{}".to_string()));
    }

    #[test]
    fn test_ends_tool_content() {
        let end = Envelope::parse(r#"{"event": {"contentEnd": {"type": "TOOL"}}}"#).unwrap();
        assert!(end.ends_tool_content());
        let audio_end = Envelope::parse(r#"{"event": {"contentEnd": {"type": "AUDIO"}}}"#).unwrap();
        assert!(!audio_end.ends_tool_content());
    }

    #[test]
    fn test_interruption_marker() {
        let marker = Envelope::parse(
            r#"{"event": {"textOutput": {"role": "ASSISTANT", "content": "{ \"interrupted\" : true }"}}}"#,
        )
        .unwrap();
        assert!(marker.is_interruption());
        assert!(marker.is_output());

        let text = Envelope::parse(r#"{"event": {"textOutput": {"content": "hello"}}}"#).unwrap();
        assert!(!text.is_interruption());
    }

    #[test]
    fn test_substitute_replaces_only_matching_tool_use() {
        let envelope = Envelope::parse(
            r#"{"role": "user", "messageId": "m3", "content": [
                {"toolUse": {"toolUseId": "t1", "name": "getDateTool", "input": {}}},
                {"toolUse": {"toolUseId": "t2", "name": "remoteOnly", "input": {}}}
            ]}"#,
        )
        .unwrap();
        let frames = envelope
            .tool_result_frames(&[outcome("t1", Ok(json!({"date": "2025-01-01"})))])
            .unwrap();
        assert_eq!(frames.len(), 1);

        let Envelope::Message(message) = Envelope::parse(&frames[0]).unwrap() else {
            panic!("メッセージとして識別されるべき");
        };
        assert_eq!(message.message_id.as_deref(), Some("m3"));
        match &message.content[0] {
            ContentPart::ToolResult(result) => {
                assert_eq!(result.tool_use_id, "t1");
                assert_eq!(result.status, ToolResultStatus::Success);
                assert_eq!(result.content[0]["json"]["date"], "2025-01-01");
            }
            other => panic!("toolResult に置き換わるべき: {:?}", other),
        }
        assert!(matches!(message.content[1], ContentPart::ToolUse(_)));
    }

    #[test]
    fn test_substitute_keeps_other_top_level_fields() {
        let envelope = Envelope::parse(
            r#"{"role": "user", "messageId": "m4", "metadata": {"traceId": "abc"}, "content": [
                {"toolUse": {"toolUseId": "t1", "name": "getDateTool", "input": {}}}
            ]}"#,
        )
        .unwrap();
        let frames = envelope
            .tool_result_frames(&[outcome("t1", Ok(json!({})))])
            .unwrap();

        let forwarded: Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(forwarded["metadata"], json!({ "traceId": "abc" }));
        assert_eq!(forwarded["messageId"], "m4");
        assert!(forwarded["content"][0].get("toolResult").is_some());
    }

    #[test]
    fn test_sonic_result_events() {
        let events = sonic_tool_result_events(&outcome("t1", Err("boom".to_string())), "c1");
        assert_eq!(events.len(), 3);
        assert_eq!(
            events[0]["event"]["contentStart"]["toolResultInputConfiguration"]["toolUseId"],
            "t1"
        );
        assert_eq!(events[0]["event"]["contentStart"]["promptName"], "prompt-1");
        let content: Value = serde_json::from_str(
            events[1]["event"]["toolResult"]["content"].as_str().unwrap(),
        )
        .unwrap();
        assert_eq!(content["error"], "boom");
        assert_eq!(events[2]["event"]["contentEnd"]["contentName"], "c1");
    }
}
