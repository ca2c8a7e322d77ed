//! MCP мост: JSON-RPC инструменты бэкенда, исполняемые на стороне браузера

pub mod bridge;
pub mod tools;

pub use bridge::{CaptureResponse, McpBridge};
