//! Каталог MCP инструментов

use serde::Serialize;
use serde_json::{json, Value};

#[derive(Debug, Clone, Serialize)]
pub struct Tool {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// Статический каталог: съемка камеры и скриншот экрана.
pub fn catalogue() -> Vec<Tool> {
    vec![
        Tool {
            name: "take_photo".to_string(),
            description: "Capture a camera frame and analyze it.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "question": {"type": "string", "default": ""}
                },
                "required": []
            }),
        },
        Tool {
            name: "take_screenshot".to_string(),
            description: "Capture a screen frame and analyze it.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "question": {"type": "string", "default": ""},
                    "display": {"type": "string", "default": ""}
                },
                "required": []
            }),
        },
    ]
}
