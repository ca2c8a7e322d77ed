//! Протокол обмена с фронтендом: JSON текстовые кадры в обе стороны

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ConfigFileInfo;
use crate::storage::{HistoryInfo, HistoryMessage};

/// Входящие сообщения клиента.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "text-input")]
    TextInput {
        #[serde(default)]
        text: String,
    },
    #[serde(rename = "interrupt-signal")]
    InterruptSignal,
    #[serde(rename = "mic-audio-data")]
    MicAudioData {
        /// float64 samples с частотой и каналами сессии
        #[serde(default)]
        audio: Vec<f64>,
        /// либо base64 PCM16 с явными параметрами
        #[serde(default)]
        audio_pcm: String,
        #[serde(default)]
        audio_sample_rate: u32,
        #[serde(default)]
        audio_channels: u32,
    },
    #[serde(rename = "mic-audio-end")]
    MicAudioEnd,
    #[serde(rename = "set-listen-mode")]
    SetListenMode {
        #[serde(default)]
        listen_mode: String,
    },
    #[serde(rename = "mcp-capture-response")]
    McpCaptureResponse {
        #[serde(default)]
        request_id: String,
        success: Option<bool>,
        #[serde(default)]
        image: String,
        #[serde(default)]
        mime_type: String,
        #[serde(default)]
        message: String,
    },
    #[serde(rename = "frontend-playback-complete")]
    FrontendPlaybackComplete,
    #[serde(rename = "audio-play-start")]
    AudioPlayStart,
    #[serde(rename = "fetch-configs")]
    FetchConfigs,
    #[serde(rename = "switch-config")]
    SwitchConfig {
        #[serde(default)]
        file: String,
    },
    #[serde(rename = "fetch-backgrounds")]
    FetchBackgrounds,
    #[serde(rename = "request-init-config")]
    RequestInitConfig,
    #[serde(rename = "fetch-history-list")]
    FetchHistoryList,
    #[serde(rename = "fetch-and-set-history")]
    FetchAndSetHistory {
        #[serde(default)]
        history_uid: String,
    },
    #[serde(rename = "create-new-history")]
    CreateNewHistory,
    #[serde(rename = "delete-history")]
    DeleteHistory {
        #[serde(default)]
        history_uid: String,
    },
    #[serde(rename = "request-group-info")]
    RequestGroupInfo,
    #[serde(rename = "add-client-to-group")]
    AddClientToGroup {
        #[serde(default)]
        invitee_uid: String,
    },
    #[serde(rename = "remove-client-from-group")]
    RemoveClientFromGroup {
        #[serde(default)]
        target_uid: String,
    },
    #[serde(rename = "ai-speak-signal")]
    AiSpeakSignal,
    #[serde(rename = "heartbeat")]
    Heartbeat,
    #[serde(other)]
    Unknown,
}

/// Подпись к первому аудио чанку реплики.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayText {
    pub text: String,
    pub name: String,
    pub avatar: String,
}

/// Исходящие сообщения к клиенту.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "set-model-and-conf")]
    SetModelAndConf {
        model_info: Value,
        conf_name: String,
        conf_uid: String,
        client_uid: String,
    },
    #[serde(rename = "user-input-transcription")]
    UserInputTranscription { text: String },
    #[serde(rename = "full-text")]
    FullText { text: String },
    #[serde(rename = "control")]
    Control { text: String },
    #[serde(rename = "audio")]
    Audio {
        audio_pcm: String,
        audio_format: String,
        audio_sample_rate: u32,
        audio_channels: u32,
        volumes: Vec<f64>,
        slice_length: u32,
        display_text: Option<DisplayText>,
        actions: Option<Value>,
        forwarded: bool,
    },
    #[serde(rename = "backend-synth-complete")]
    BackendSynthComplete,
    #[serde(rename = "force-new-message")]
    ForceNewMessage,
    #[serde(rename = "config-files")]
    ConfigFiles { configs: Vec<ConfigFileInfo> },
    #[serde(rename = "config-switched")]
    ConfigSwitched,
    #[serde(rename = "background-files")]
    BackgroundFiles { files: Vec<String> },
    #[serde(rename = "history-list")]
    HistoryList { histories: Vec<HistoryInfo> },
    #[serde(rename = "history-data")]
    HistoryData { messages: Vec<HistoryMessage> },
    #[serde(rename = "new-history-created")]
    NewHistoryCreated { history_uid: String },
    #[serde(rename = "history-deleted")]
    HistoryDeleted { success: bool, history_uid: String },
    #[serde(rename = "group-update")]
    GroupUpdate {
        members: Vec<String>,
        is_owner: bool,
    },
    #[serde(rename = "group-operation-result")]
    GroupOperationResult { success: bool, message: String },
    #[serde(rename = "mcp-capture-request")]
    McpCaptureRequest {
        request_id: String,
        /// "camera" или "screen"
        source: String,
        question: String,
        display: String,
    },
    #[serde(rename = "tool_call_status")]
    ToolCallStatus {
        tool_id: String,
        tool_name: String,
        /// "running", "completed" или "error"
        status: String,
        content: String,
        timestamp: String,
    },
    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}
