//! JSON-RPC маршрутизация MCP, корреляция захватов и vision HTTP вызов

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::mcp::tools;
use crate::websocket::protocol::ServerMessage;
use crate::xiaozhi::Client;

const CAPTURE_TIMEOUT: Duration = Duration::from_secs(30);
const VISION_TIMEOUT: Duration = Duration::from_secs(15);
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// Ответ фронтенда на запрос захвата камеры или экрана.
#[derive(Debug, Clone)]
pub struct CaptureResponse {
    pub success: bool,
    pub image: String,
    pub mime_type: String,
    pub message: String,
}

#[derive(Default)]
struct Shared {
    waiters: HashMap<String, oneshot::Sender<CaptureResponse>>,
    vision_url: String,
    vision_token: String,
}

/// Мост MCP: принимает JSON-RPC от бэкенда, гоняет захваты через клиента
/// и ходит во vision сервис.
#[derive(Clone)]
pub struct McpBridge {
    device_id: String,
    client_id: String,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    upstream: Client,
    http: reqwest::Client,
    shared: Arc<Mutex<Shared>>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    #[serde(default)]
    jsonrpc: String,
    #[serde(default)]
    method: String,
    id: Option<Value>,
    #[serde(default)]
    params: Value,
}

impl McpBridge {
    pub fn new(
        device_id: String,
        client_id: String,
        outbound: mpsc::UnboundedSender<ServerMessage>,
        upstream: Client,
    ) -> Self {
        Self {
            device_id,
            client_id,
            outbound,
            upstream,
            http: reqwest::Client::new(),
            shared: Arc::new(Mutex::new(Shared::default())),
        }
    }

    /// Точка входа для конверта `{"type":"mcp"}` от бэкенда.
    pub async fn handle_mcp(&self, payload: Value) {
        let request: JsonRpcRequest = match serde_json::from_value(payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "mcp payload parse failed");
                self.reply_error(Value::Null, "invalid MCP payload").await;
                return;
            }
        };
        let id = request.id.clone().unwrap_or(Value::Null);
        if request.jsonrpc != "2.0" {
            self.reply_error(id, "invalid JSON-RPC version").await;
            return;
        }
        if request.method.is_empty() || request.id.is_none() {
            self.reply_error(id, "missing method or id").await;
            return;
        }

        match request.method.as_str() {
            "initialize" => self.handle_initialize(id, &request.params).await,
            "tools/list" => self.handle_tools_list(id).await,
            "tools/call" => self.handle_tools_call(id, &request.params),
            _ => self.reply_error(id, "method not implemented").await,
        }
    }

    async fn handle_initialize(&self, id: Value, params: &Value) {
        #[derive(Default, Deserialize)]
        struct Vision {
            #[serde(default)]
            url: String,
            #[serde(default)]
            token: String,
        }
        #[derive(Default, Deserialize)]
        struct Capabilities {
            #[serde(default)]
            vision: Vision,
        }
        #[derive(Default, Deserialize)]
        struct InitParams {
            #[serde(default)]
            capabilities: Capabilities,
        }

        if let Ok(params) = serde_json::from_value::<InitParams>(params.clone()) {
            let mut shared = self.lock_shared();
            shared.vision_url = params.capabilities.vision.url;
            shared.vision_token = params.capabilities.vision.token;
        }

        self.reply_result(
            id,
            json!({
                "protocolVersion": MCP_PROTOCOL_VERSION,
                "capabilities": {"tools": {}},
                "serverInfo": {"name": "vtuber-gateway", "version": "1.0"},
            }),
        )
        .await;
    }

    async fn handle_tools_list(&self, id: Value) {
        self.reply_result(id, json!({"tools": tools::catalogue()}))
            .await;
    }

    /// tools/call исполняется в отдельном таске: ожидание захвата не должно
    /// блокировать цикл сессии, который доставляет capture-response.
    fn handle_tools_call(&self, id: Value, params: &Value) {
        #[derive(Default, Deserialize)]
        struct CallParams {
            #[serde(default)]
            name: String,
            #[serde(default)]
            arguments: Value,
        }

        let bridge = self.clone();
        let params: CallParams = match serde_json::from_value(params.clone()) {
            Ok(params) => params,
            Err(_) => {
                tokio::spawn(async move {
                    bridge.reply_error(id, "invalid tool call params").await;
                });
                return;
            }
        };
        if params.name.is_empty() {
            tokio::spawn(async move {
                bridge.reply_error(id, "missing tool name").await;
            });
            return;
        }

        tokio::spawn(async move {
            let tool_id = tool_id_string(&id);
            let question = string_arg(&params.arguments, "question");
            bridge.send_tool_status(&tool_id, &params.name, "running", "");

            match params.name.as_str() {
                "take_photo" => {
                    let (result, status, content) =
                        bridge.capture_and_analyze("camera", &question, "").await;
                    bridge.send_tool_status(&tool_id, &params.name, status, &content);
                    bridge.reply_result(id, result).await;
                }
                "take_screenshot" => {
                    let display = string_arg(&params.arguments, "display");
                    let (result, status, content) =
                        bridge.capture_and_analyze("screen", &question, &display).await;
                    bridge.send_tool_status(&tool_id, &params.name, status, &content);
                    bridge.reply_result(id, result).await;
                }
                _ => bridge.reply_error(id, "unknown tool").await,
            }
        });
    }

    /// Захват на фронтенде плюс анализ во vision сервисе.
    ///
    /// Возвращает (результат MCP, статус для tool_call_status, текст ошибки).
    async fn capture_and_analyze(
        &self,
        source: &str,
        question: &str,
        display: &str,
    ) -> (Value, &'static str, String) {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.lock_shared().waiters.insert(request_id.clone(), tx);

        let _ = self.outbound.send(ServerMessage::McpCaptureRequest {
            request_id: request_id.clone(),
            source: source.to_string(),
            question: question.to_string(),
            display: display.to_string(),
        });

        let response = match timeout(CAPTURE_TIMEOUT, rx).await {
            Ok(Ok(response)) => response,
            _ => {
                self.lock_shared().waiters.remove(&request_id);
                return error_outcome("capture timeout");
            }
        };
        if !response.success {
            return error_outcome(&response.message);
        }

        let vision_url = self.lock_shared().vision_url.clone();
        if vision_url.is_empty() {
            return error_outcome("vision service is not configured");
        }

        let image = match decode_capture_image(&response.image) {
            Ok(image) => image,
            Err(e) => return error_outcome(&e.to_string()),
        };
        let mime_type = if response.mime_type.is_empty() {
            "image/jpeg".to_string()
        } else {
            response.mime_type
        };

        match self.call_vision(&vision_url, image, &mime_type, question).await {
            Ok(result) => (result, "completed", String::new()),
            Err(e) => error_outcome(&e.to_string()),
        }
    }

    async fn call_vision(
        &self,
        vision_url: &str,
        image: Vec<u8>,
        mime_type: &str,
        question: &str,
    ) -> Result<Value> {
        let part = reqwest::multipart::Part::bytes(image)
            .file_name("capture.jpg")
            .mime_str(mime_type)
            .context("vision image mime")?;
        let form = reqwest::multipart::Form::new()
            .text("question", question.to_string())
            .part("file", part);

        let mut request = self
            .http
            .post(vision_url)
            .timeout(VISION_TIMEOUT)
            .header("Device-Id", &self.device_id)
            .header("Client-Id", &self.client_id)
            .multipart(form);
        let token = self.lock_shared().vision_token.clone();
        if !token.is_empty() {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request.send().await.context("vision request")?;
        let status = response.status();
        let body = response.bytes().await.context("vision response body")?;
        if !status.is_success() {
            anyhow::bail!("{}", String::from_utf8_lossy(&body));
        }

        if let Ok(parsed) = serde_json::from_slice::<Value>(&body) {
            return Ok(parsed);
        }
        Ok(json!({
            "content": [{"type": "text", "text": String::from_utf8_lossy(&body)}],
            "isError": false,
        }))
    }

    /// Доставляет ответ захвата ровно одному ожидающему; запись удаляется.
    pub fn deliver_capture(&self, request_id: &str, response: CaptureResponse) {
        let waiter = self.lock_shared().waiters.remove(request_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => debug!(request_id, "capture response without waiter"),
        }
    }

    async fn reply_result(&self, id: Value, result: Value) {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": result,
        });
        if let Err(e) = self.upstream.send_mcp(payload).await {
            warn!(error = %e, "mcp result send failed");
        }
    }

    async fn reply_error(&self, id: Value, message: &str) {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": {"message": message},
        });
        if let Err(e) = self.upstream.send_mcp(payload).await {
            warn!(error = %e, "mcp error send failed");
        }
    }

    fn send_tool_status(&self, tool_id: &str, tool_name: &str, status: &str, content: &str) {
        if status.is_empty() {
            return;
        }
        let _ = self.outbound.send(ServerMessage::ToolCallStatus {
            tool_id: tool_id.to_string(),
            tool_name: tool_name.to_string(),
            status: status.to_string(),
            content: content.to_string(),
            timestamp: Utc::now().to_rfc3339(),
        });
    }

    fn lock_shared(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.shared.lock().expect("mcp shared poisoned")
    }
}

/// Результат-ошибка в формате MCP.
fn mcp_error_result(message: &str) -> Value {
    let message = if message.is_empty() {
        "capture failed"
    } else {
        message
    };
    json!({
        "content": [{"type": "text", "text": message}],
        "isError": true,
    })
}

fn error_outcome(message: &str) -> (Value, &'static str, String) {
    (mcp_error_result(message), "error", message.to_string())
}

fn tool_id_string(id: &Value) -> String {
    match id {
        Value::String(text) => text.clone(),
        Value::Number(number) => number.to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn string_arg(arguments: &Value, key: &str) -> String {
    arguments
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Декодирует изображение захвата: data-url с префиксом либо голый base64.
fn decode_capture_image(data: &str) -> Result<Vec<u8>> {
    anyhow::ensure!(!data.is_empty(), "empty capture image");
    if let Some(stripped) = data.strip_prefix("data:") {
        let payload = stripped
            .split_once(',')
            .map(|(_, payload)| payload)
            .ok_or_else(|| anyhow::anyhow!("invalid data url"))?;
        return BASE64.decode(payload).context("decode capture image");
    }
    BASE64.decode(data).context("decode capture image")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xiaozhi::Config;

    fn test_bridge() -> (McpBridge, mpsc::UnboundedReceiver<ServerMessage>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (ev_tx, _ev_rx) = mpsc::unbounded_channel();
        let upstream = Client::new(Config::default(), ev_tx);
        let bridge = McpBridge::new(
            "device-1".to_string(),
            "client-1".to_string(),
            out_tx,
            upstream,
        );
        (bridge, out_rx)
    }

    #[test]
    fn test_decode_capture_image_variants() {
        let raw = BASE64.encode(b"picture");
        assert_eq!(decode_capture_image(&raw).expect("bare"), b"picture");

        let data_url = format!("data:image/png;base64,{}", raw);
        assert_eq!(decode_capture_image(&data_url).expect("data url"), b"picture");

        assert!(decode_capture_image("").is_err());
        assert!(decode_capture_image("data:image/png;base64").is_err());
    }

    #[test]
    fn test_tool_id_string() {
        assert_eq!(tool_id_string(&json!("42")), "42");
        assert_eq!(tool_id_string(&json!(42)), "42");
        assert_eq!(tool_id_string(&Value::Null), "");
    }

    #[test]
    fn test_mcp_error_result() {
        let result = mcp_error_result("");
        assert_eq!(result["isError"], true);
        assert_eq!(result["content"][0]["text"], "capture failed");

        let result = mcp_error_result("boom");
        assert_eq!(result["content"][0]["text"], "boom");
    }

    #[tokio::test]
    async fn test_deliver_capture_single_shot() {
        let (bridge, _out_rx) = test_bridge();
        let (tx, mut rx) = oneshot::channel();
        bridge
            .lock_shared()
            .waiters
            .insert("req-1".to_string(), tx);

        bridge.deliver_capture(
            "req-1",
            CaptureResponse {
                success: true,
                image: "aGk=".to_string(),
                mime_type: String::new(),
                message: String::new(),
            },
        );
        let response = rx.try_recv().expect("capture delivered");
        assert!(response.success);

        // Запись удалена, повторная доставка никуда не уходит
        assert!(bridge.lock_shared().waiters.is_empty());
        bridge.deliver_capture(
            "req-1",
            CaptureResponse {
                success: false,
                image: String::new(),
                mime_type: String::new(),
                message: String::new(),
            },
        );
    }

    #[tokio::test]
    async fn test_tools_call_emits_running_status_and_capture_request() {
        let (bridge, mut out_rx) = test_bridge();
        bridge.handle_tools_call(
            json!("7"),
            &json!({"name": "take_photo", "arguments": {"question": "what is this"}}),
        );

        let status = tokio::time::timeout(Duration::from_secs(1), out_rx.recv())
            .await
            .expect("status in time")
            .expect("status message");
        match status {
            ServerMessage::ToolCallStatus {
                tool_id,
                tool_name,
                status,
                ..
            } => {
                assert_eq!(tool_id, "7");
                assert_eq!(tool_name, "take_photo");
                assert_eq!(status, "running");
            }
            other => panic!("unexpected message: {:?}", other),
        }

        let capture = tokio::time::timeout(Duration::from_secs(1), out_rx.recv())
            .await
            .expect("capture in time")
            .expect("capture message");
        match capture {
            ServerMessage::McpCaptureRequest {
                source, question, ..
            } => {
                assert_eq!(source, "camera");
                assert_eq!(question, "what is this");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_capture_failure_reports_error_result() {
        let (bridge, mut out_rx) = test_bridge();
        bridge.handle_tools_call(json!(3), &json!({"name": "take_photo"}));

        // running + capture-request
        let _ = tokio::time::timeout(Duration::from_secs(1), out_rx.recv()).await;
        let capture = tokio::time::timeout(Duration::from_secs(1), out_rx.recv())
            .await
            .expect("capture in time")
            .expect("capture message");
        let request_id = match capture {
            ServerMessage::McpCaptureRequest { request_id, .. } => request_id,
            other => panic!("unexpected message: {:?}", other),
        };

        bridge.deliver_capture(
            &request_id,
            CaptureResponse {
                success: false,
                image: String::new(),
                mime_type: String::new(),
                message: "camera busy".to_string(),
            },
        );

        let status = tokio::time::timeout(Duration::from_secs(1), out_rx.recv())
            .await
            .expect("status in time")
            .expect("status message");
        match status {
            ServerMessage::ToolCallStatus {
                status, content, ..
            } => {
                assert_eq!(status, "error");
                assert_eq!(content, "camera busy");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }
}
