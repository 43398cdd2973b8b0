pub mod builtin;
pub mod mcp;
pub mod registry;

pub use builtin::BuiltinTool;
pub use mcp::{McpClient, McpError};
pub use registry::{ToolError, ToolRegistry};

// Re-export commonly used types from rmcp for convenience
pub use rmcp::model::Tool as McpTool;
