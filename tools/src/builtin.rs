//! ローカルで実行する組み込みツール
use chrono::{DateTime, Datelike, Utc};
use serde_json::{Value, json};

use crate::registry::ToolError;

/// Nova Sonic のサンプルが使うツール名
pub const GET_DATE_TOOL: &str = "getDateTool";
pub const GET_CURRENT_DATE: &str = "get_current_date";
pub const GREET_USER: &str = "greet_user";
pub const GET_AGENT_INFO: &str = "get_agent_info";

const AGENT_INFO: &str = "I am a WebSocket relay for agents deployed on AgentCore Runtime with IAM authentication. I can tell the current date, greet users and describe myself.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinTool {
    CurrentDate,
    GreetUser,
    AgentInfo,
}

impl BuiltinTool {
    pub const ALL: [BuiltinTool; 3] = [
        BuiltinTool::CurrentDate,
        BuiltinTool::GreetUser,
        BuiltinTool::AgentInfo,
    ];

    /// ツール名（別名を含む）から組み込みツールを引く
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            GET_DATE_TOOL | GET_CURRENT_DATE => Some(BuiltinTool::CurrentDate),
            GREET_USER => Some(BuiltinTool::GreetUser),
            GET_AGENT_INFO => Some(BuiltinTool::AgentInfo),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BuiltinTool::CurrentDate => GET_DATE_TOOL,
            BuiltinTool::GreetUser => GREET_USER,
            BuiltinTool::AgentInfo => GET_AGENT_INFO,
        }
    }

    pub fn aliases(&self) -> &'static [&'static str] {
        match self {
            BuiltinTool::CurrentDate => &[GET_DATE_TOOL, GET_CURRENT_DATE],
            BuiltinTool::GreetUser => &[GREET_USER],
            BuiltinTool::AgentInfo => &[GET_AGENT_INFO],
        }
    }

    pub fn invoke(&self, input: &Value) -> Result<Value, ToolError> {
        self.invoke_at(input, Utc::now())
    }

    /// 時刻を固定して実行する
    pub fn invoke_at(&self, input: &Value, now: DateTime<Utc>) -> Result<Value, ToolError> {
        match self {
            BuiltinTool::CurrentDate => Ok(current_date(now)),
            BuiltinTool::GreetUser => greet_user(input),
            BuiltinTool::AgentInfo => Ok(json!({ "info": AGENT_INFO })),
        }
    }
}

fn current_date(now: DateTime<Utc>) -> Value {
    json!({
        "date": now.format("%Y-%m-%d").to_string(),
        "year": now.year(),
        "month": now.month(),
        "day": now.day(),
        "dayOfWeek": now.format("%A").to_string(),
        "formattedTime": now.format("%H:%M").to_string(),
        "timezone": "UTC",
    })
}

fn greet_user(input: &Value) -> Result<Value, ToolError> {
    let name = input
        .get("name")
        .and_then(Value::as_str)
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| ToolError::InvalidArguments(format!("{GREET_USER} requires a name")))?;
    Ok(json!({
        "greeting": format!("Hello, {name}! Welcome to the AgentCore WebSocket relay.")
    }))
}
